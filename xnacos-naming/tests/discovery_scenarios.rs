//! End-to-end discovery scenarios against a scripted registry
//!
//! Run with: cargo test -p xnacos-naming --test discovery_scenarios

use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde_json::json;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use xnacos_naming::test_helpers::{instance, test_config, FakeTransport};
use xnacos_naming::{Config, Error, NamingClient};

fn client_with(config: Config, transport: &Arc<FakeTransport>) -> NamingClient {
    NamingClient::new(config, transport.clone())
        .unwrap()
        .with_rng(StdRng::seed_from_u64(7))
}

fn client(transport: &Arc<FakeTransport>) -> NamingClient {
    client_with(test_config(), transport)
}

#[tokio::test(start_paused = true)]
async fn test_healthy_instance_always_preferred() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_instances(
        "svc-a",
        vec![
            instance("svc-a", "10.0.0.1", 8080),
            instance("svc-a", "10.0.0.2", 8080).with_healthy(false),
        ],
    );
    let client = client(&transport);

    for _ in 0..200 {
        let selected = client.select_one_healthy_instance("svc-a").await.unwrap();
        assert_eq!(selected.ip, "10.0.0.1");
        assert_eq!(selected.port, 8080);
    }

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_service_without_instances() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_instances("svc-b", Vec::new());
    let client = client(&transport);

    let err = client.select_one_healthy_instance("svc-b").await.unwrap_err();
    assert!(matches!(err, Error::NoInstance(_)));

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_outage_serves_last_known_until_ceiling() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_instances("svc-c", vec![instance("svc-c", "10.0.0.1", 8080)]);
    let client = client(&transport);

    let first = client.select_one_healthy_instance("svc-c").await.unwrap();
    assert_eq!(first.ip, "10.0.0.1");

    transport.fail_service("svc-c", Error::Unreachable("registry down".to_string()));

    // Past the ttl: refreshes fail in the background, reads keep working
    for _ in 0..5 {
        tokio::time::sleep(Duration::from_secs(30)).await;
        let selected = client.select_one_healthy_instance("svc-c").await.unwrap();
        assert_eq!(selected.ip, "10.0.0.1");
    }
    assert!(transport.fetch_calls("svc-c") > 1);

    // Past the staleness ceiling
    tokio::time::sleep(Duration::from_secs(200)).await;
    let err = client.select_one_healthy_instance("svc-c").await.unwrap_err();
    assert!(matches!(err, Error::NoInstance(_)));

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_recovery_after_outage_picks_up_new_set() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_instances("svc-c", vec![instance("svc-c", "10.0.0.1", 8080)]);
    let client = client(&transport);
    let mut changes = client.subscribe_changes();

    client.select_one_healthy_instance("svc-c").await.unwrap();
    changes.recv().await.unwrap();

    transport.fail_service("svc-c", Error::Unreachable("registry down".to_string()));
    tokio::time::sleep(Duration::from_secs(60)).await;

    transport.set_instances("svc-c", vec![instance("svc-c", "10.0.0.9", 8080)]);
    let event = tokio::time::timeout(Duration::from_secs(60), changes.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(event.instance_count, 1);

    let selected = client.select_one_healthy_instance("svc-c").await.unwrap();
    assert_eq!(selected.ip, "10.0.0.9");

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_zero_weight_skipped_unless_alone() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_instances(
        "svc-w",
        vec![
            instance("svc-w", "10.0.0.1", 8080).with_weight(0.0),
            instance("svc-w", "10.0.0.2", 8080),
        ],
    );
    transport.set_instances(
        "svc-solo",
        vec![instance("svc-solo", "10.0.0.3", 8080).with_weight(0.0)],
    );
    let client = client(&transport);

    for _ in 0..100 {
        let selected = client.select_one_healthy_instance("svc-w").await.unwrap();
        assert_eq!(selected.ip, "10.0.0.2");
    }
    let solo = client.select_one_healthy_instance("svc-solo").await.unwrap();
    assert_eq!(solo.ip, "10.0.0.3");

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_concurrent_first_lookups_fetch_once() {
    let transport = Arc::new(FakeTransport::new().with_fetch_delay(Duration::from_millis(100)));
    transport.set_instances("svc-a", vec![instance("svc-a", "10.0.0.1", 8080)]);
    let client = Arc::new(client(&transport));

    let lookups: Vec<_> = (0..50)
        .map(|_| {
            let client = client.clone();
            tokio::spawn(async move { client.select_one_healthy_instance("svc-a").await })
        })
        .collect();

    for lookup in futures::future::join_all(lookups).await {
        assert_eq!(lookup.unwrap().unwrap().ip, "10.0.0.1");
    }
    assert_eq!(transport.fetch_calls("svc-a"), 1);
    assert_eq!(transport.login_calls(), 0);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_one_login_shared_by_services() {
    let transport = Arc::new(FakeTransport::new().with_login_delay(Duration::from_millis(50)));
    transport.set_instances("svc-a", vec![instance("svc-a", "10.0.0.1", 8080)]);
    transport.set_instances("svc-b", vec![instance("svc-b", "10.0.0.2", 8080)]);
    let mut config = test_config();
    config.registry.username = "nacos".to_string();
    config.registry.password = "nacos".to_string();
    let client = Arc::new(client_with(config, &transport));

    let (a, b) = tokio::join!(
        client.select_one_healthy_instance("svc-a"),
        client.select_one_healthy_instance("svc-b"),
    );
    assert_eq!(a.unwrap().ip, "10.0.0.1");
    assert_eq!(b.unwrap().ip, "10.0.0.2");
    assert_eq!(transport.login_calls(), 1);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_rejected_credentials_surface_auth_error() {
    let transport = Arc::new(FakeTransport::new());
    transport.reject_logins(true);
    let mut config = test_config();
    config.registry.username = "nacos".to_string();
    config.registry.password = "wrong".to_string();
    let client = client_with(config, &transport);

    let err = client.select_one_healthy_instance("svc-a").await.unwrap_err();
    assert!(matches!(err, Error::Auth(_)));
    assert_eq!(transport.login_calls(), 1);

    client.close().await;
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_registry_on_first_lookup() {
    let transport = Arc::new(FakeTransport::new());
    transport.fail_service("svc-a", Error::Unreachable("connection refused".to_string()));
    let mut config = test_config();
    config.retry.max_attempts = 1;
    let client = client_with(config, &transport);

    let err = client.select_one_healthy_instance("svc-a").await.unwrap_err();
    assert!(matches!(err, Error::Unreachable(_)));

    client.close().await;
}

#[test]
fn test_bad_configuration_fails_fast() {
    let transport = Arc::new(FakeTransport::new());

    let mut bad_port = test_config();
    bad_port.registry.port = 70_000;
    assert!(matches!(
        NamingClient::new(bad_port, transport.clone()),
        Err(Error::Config(_))
    ));

    let mut no_host = test_config();
    no_host.registry.ip_addr = String::new();
    assert!(matches!(
        NamingClient::new(no_host, transport.clone()),
        Err(Error::Config(_))
    ));

    let mut no_namespace = test_config();
    no_namespace.registry.namespace_id = None;
    assert!(matches!(
        NamingClient::new(no_namespace, transport.clone()),
        Err(Error::Config(_))
    ));

    // Nothing was contacted
    assert_eq!(transport.login_calls(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_closed_client_rejects_calls() {
    let transport = Arc::new(FakeTransport::new());
    transport.set_instances("svc-a", vec![instance("svc-a", "10.0.0.1", 8080)]);
    let client = client(&transport);
    client.select_one_healthy_instance("svc-a").await.unwrap();

    client.close().await;

    assert_eq!(
        client.select_one_healthy_instance("svc-a").await.unwrap_err(),
        Error::Closed
    );
    assert_eq!(client.get_all_instances("svc-a").await.unwrap_err(), Error::Closed);
}

#[tokio::test]
async fn test_http_registry_end_to_end() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/nacos/v1/auth/login"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "accessToken": "tok-e2e",
            "tokenTtl": 18000
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/nacos/v1/ns/instance/list"))
        .and(query_param("serviceName", "orders"))
        .and(query_param("namespaceId", "test"))
        .and(query_param("accessToken", "tok-e2e"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "name": "DEFAULT_GROUP@@orders",
            "hosts": [
                { "ip": "10.1.0.1", "port": 7001, "weight": 1.0, "healthy": true, "enabled": true },
                { "ip": "10.1.0.2", "port": 7001, "weight": 1.0, "healthy": false, "enabled": true }
            ]
        })))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.registry.ip_addr = server.address().ip().to_string();
    config.registry.port = u32::from(server.address().port());
    config.registry.username = "nacos".to_string();
    config.registry.password = "nacos".to_string();
    let client = NamingClient::from_config(config).unwrap();

    for _ in 0..5 {
        let selected = client.select_one_healthy_instance("orders").await.unwrap();
        assert_eq!(selected.address(), "10.1.0.1:7001");
    }

    client.close().await;
}
