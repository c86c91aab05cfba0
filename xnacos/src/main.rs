use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{error, info, warn};

use xnacos_core::{logging, Config};
use xnacos_naming::{NamingClient, SelectParams};

#[derive(Parser, Debug)]
#[command(name = "xnacos")]
#[command(about = "Resolve service instances from a Nacos registry", long_about = None)]
struct Args {
    /// Configuration file (TOML, YAML or JSON)
    #[arg(short, long, env = "XNACOS_CONFIG")]
    config: Option<String>,

    /// Service to resolve
    #[arg(short, long)]
    service: String,

    /// Service group (defaults to the configured group)
    #[arg(short, long)]
    group: Option<String>,

    /// Restrict selection to these clusters
    #[arg(long, value_delimiter = ',')]
    clusters: Vec<String>,

    /// Number of lookups
    #[arg(short = 'n', long, default_value = "10")]
    count: u64,

    /// Pause between lookups in milliseconds
    #[arg(long, default_value = "1000")]
    interval_ms: u64,

    /// Print each selected instance as a JSON line
    #[arg(long)]
    json: bool,

    /// Registry host
    #[arg(long, env = "NACOS_IP_ADDR")]
    ip_addr: Option<String>,

    /// Registry port
    #[arg(long, env = "NACOS_PORT")]
    port: Option<u32>,

    /// Registry username (empty for anonymous access)
    #[arg(long, env = "NACOS_USERNAME")]
    username: Option<String>,

    /// Registry password
    #[arg(long, env = "NACOS_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Namespace id (empty string for the public namespace)
    #[arg(long, env = "NACOS_NAMESPACE")]
    namespace: Option<String>,
}

impl Args {
    fn apply(&self, config: &mut Config) {
        let registry = &mut config.registry;
        if let Some(ip_addr) = &self.ip_addr {
            registry.ip_addr.clone_from(ip_addr);
        }
        if let Some(port) = self.port {
            registry.port = port;
        }
        if let Some(username) = &self.username {
            registry.username.clone_from(username);
        }
        if let Some(password) = &self.password {
            registry.password.clone_from(password);
        }
        if let Some(namespace) = &self.namespace {
            registry.namespace_id = Some(namespace.clone());
        }
    }

    fn select_params(&self) -> SelectParams {
        let mut params = SelectParams::new(&self.service).clusters(self.clusters.iter().cloned());
        if let Some(group) = &self.group {
            params = params.group(group);
        }
        params
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // 1. Load configuration: defaults, file, environment, then flags
    let mut config = Config::load(args.config.as_deref()).context("Failed to load configuration")?;
    args.apply(&mut config);
    config.validate().context("Invalid configuration")?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!(
        endpoint = %config.registry.endpoint(),
        service = %args.service,
        count = args.count,
        "xnacos starting"
    );

    // 3. Build the client; nothing is contacted until the first lookup
    let client = NamingClient::from_config(config).context("Failed to create naming client")?;
    let params = args.select_params();

    tokio::select! {
        () = resolve_loop(&client, &params, &args) => {}
        result = tokio::signal::ctrl_c() => {
            match result {
                Ok(()) => info!("Interrupted, shutting down"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
        }
    }

    // 4. Release the client
    client.close().await;
    info!("xnacos stopped");
    Ok(())
}

async fn resolve_loop(client: &NamingClient, params: &SelectParams, args: &Args) {
    let pause = Duration::from_millis(args.interval_ms);
    for round in 1..=args.count {
        match client.select_one_healthy_instance_with(params).await {
            Ok(instance) if args.json => match serde_json::to_string(&instance) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "Failed to encode instance"),
            },
            Ok(instance) => {
                info!(
                    round,
                    endpoint = %instance.address(),
                    healthy = instance.healthy,
                    weight = instance.weight,
                    cluster = %instance.cluster_name,
                    "Resolved instance"
                );
            }
            Err(e) => warn!(round, error = %e, "Lookup failed"),
        }

        if round < args.count {
            tokio::time::sleep(pause).await;
        }
    }
}
