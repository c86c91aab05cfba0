//! Instance selection
//!
//! Weighted random choice among healthy instances. Cumulative weight tables
//! are cached per service and cluster filter and rebuilt only when the view
//! revision moves, so unchanged instance sets cost one table lookup.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, RngCore, SeedableRng};
use tracing::warn;

use crate::model::{Instance, ServiceKey, ServiceView};
use xnacos_core::{Error, Result};

/// Candidate pool derived from one view revision
#[derive(Debug)]
enum Pool {
    /// Healthy instances with positive weight: (cumulative weight, index)
    Weighted { cumulative: Vec<(f64, usize)>, total: f64 },
    /// The only instance present; selectable even with weight 0
    Single(usize),
    /// No healthy instance; uniform over these when fallback is enabled
    Degraded(Vec<usize>),
    /// Non-empty but nothing selectable
    NoHealthy,
    /// Nothing registered (after cluster filtering)
    Empty,
}

#[derive(Debug)]
struct SelectionTable {
    revision: u64,
    pool: Pool,
}

type TableKey = (ServiceKey, String);

/// Picks one instance per call
pub struct HealthSelector {
    rng: Mutex<Box<dyn RngCore + Send>>,
    fallback_to_unhealthy: bool,
    tables: DashMap<TableKey, Arc<SelectionTable>>,
    degraded_selections: AtomicU64,
}

impl HealthSelector {
    #[must_use]
    pub fn new(fallback_to_unhealthy: bool) -> Self {
        Self::with_rng(fallback_to_unhealthy, StdRng::from_entropy())
    }

    /// Selector with an injected random source
    #[must_use]
    pub fn with_rng(fallback_to_unhealthy: bool, rng: impl RngCore + Send + 'static) -> Self {
        Self {
            rng: Mutex::new(Box::new(rng)),
            fallback_to_unhealthy,
            tables: DashMap::new(),
            degraded_selections: AtomicU64::new(0),
        }
    }

    /// Select one instance from `view`, restricted to `clusters` when non-empty
    pub fn select_one(&self, view: &ServiceView, clusters: &[String]) -> Result<Instance> {
        let table = self.table_for(view, clusters);

        let index = match &table.pool {
            Pool::Weighted { cumulative, total } => {
                let point = self.rng.lock().gen::<f64>() * total;
                let pos = cumulative.partition_point(|(upper, _)| *upper <= point);
                cumulative[pos.min(cumulative.len() - 1)].1
            }
            Pool::Single(index) => *index,
            Pool::Degraded(candidates) => {
                let pick = candidates[self.rng.lock().gen_range(0..candidates.len())];
                self.degraded_selections.fetch_add(1, Ordering::Relaxed);
                warn!(
                    service = %view.key,
                    instance = %view.instances[pick].address(),
                    candidates = candidates.len(),
                    "Degraded selection: no healthy instance, falling back to unhealthy"
                );
                pick
            }
            Pool::NoHealthy => return Err(Error::NoHealthyInstance(view.key.to_string())),
            Pool::Empty => return Err(Error::NoInstance(view.key.to_string())),
        };

        Ok(view.instances[index].clone())
    }

    /// Drop cached tables of `key`
    pub fn forget(&self, key: &ServiceKey) {
        self.tables.retain(|(k, _), _| k != key);
    }

    pub fn clear(&self) {
        self.tables.clear();
    }

    /// Number of selections served from unhealthy instances
    #[must_use]
    pub fn degraded_selections(&self) -> u64 {
        self.degraded_selections.load(Ordering::Relaxed)
    }

    fn table_for(&self, view: &ServiceView, clusters: &[String]) -> Arc<SelectionTable> {
        let key = (view.key.clone(), cluster_filter_key(clusters));
        if let Some(table) = self.tables.get(&key) {
            if table.revision == view.revision {
                return Arc::clone(table.value());
            }
        }

        let table = Arc::new(SelectionTable {
            revision: view.revision,
            pool: self.build_pool(&view.instances, clusters),
        });
        self.tables.insert(key, Arc::clone(&table));
        table
    }

    fn build_pool(&self, instances: &[Instance], clusters: &[String]) -> Pool {
        let candidates: Vec<usize> = instances
            .iter()
            .enumerate()
            .filter(|(_, i)| clusters.is_empty() || clusters.contains(&i.cluster_name))
            .map(|(idx, _)| idx)
            .collect();

        if candidates.is_empty() {
            return Pool::Empty;
        }

        let mut total = 0.0;
        let cumulative: Vec<(f64, usize)> = candidates
            .iter()
            .copied()
            .filter(|&idx| instances[idx].is_available() && instances[idx].has_positive_weight())
            .map(|idx| {
                total += instances[idx].weight;
                (total, idx)
            })
            .collect();

        if !cumulative.is_empty() {
            return Pool::Weighted { cumulative, total };
        }

        let only = candidates.len() == 1;
        if candidates.iter().any(|&idx| instances[idx].is_available()) {
            // Healthy but zero weight
            return if only { Pool::Single(candidates[0]) } else { Pool::NoHealthy };
        }

        if !self.fallback_to_unhealthy {
            return Pool::NoHealthy;
        }

        let fallback: Vec<usize> = if only {
            candidates
        } else {
            candidates
                .into_iter()
                .filter(|&idx| instances[idx].has_positive_weight())
                .collect()
        };

        if fallback.is_empty() {
            Pool::NoHealthy
        } else {
            Pool::Degraded(fallback)
        }
    }
}

fn cluster_filter_key(clusters: &[String]) -> String {
    let mut sorted: Vec<&str> = clusters.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    sorted.join(",")
}
