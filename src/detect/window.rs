//! Bounded per-(entity, metric) sliding windows.
//!
//! Absorbs the source's delivery quirks: exact duplicates are dropped,
//! late samples within the skew tolerance are inserted in time order, and
//! anything older is discarded.

use std::collections::{HashMap, VecDeque};

use chrono::{DateTime, Utc};
use tokio::sync::RwLock;
use tracing::debug;

use crate::observe::Observation;

type Key = (String, String);

pub struct WindowStore {
    windows: RwLock<HashMap<Key, VecDeque<Observation>>>,
    capacity: usize,
    max_skew: chrono::Duration,
}

impl WindowStore {
    pub fn new(capacity: usize, max_skew: chrono::Duration) -> Self {
        Self {
            windows: RwLock::new(HashMap::new()),
            capacity: capacity.max(1),
            max_skew,
        }
    }

    /// Insert an observation. Returns `false` when it was a duplicate or
    /// arrived too late to be placed.
    pub async fn ingest(&self, obs: Observation) -> bool {
        let mut windows = self.windows.write().await;
        let window = windows
            .entry((obs.entity_id.clone(), obs.metric_name.clone()))
            .or_default();

        if let Some(newest) = window.back() {
            if obs.timestamp < newest.timestamp - self.max_skew {
                debug!(entity = %obs.entity_id, metric = %obs.metric_name, "dropping observation older than skew tolerance");
                return false;
            }
        }
        if window.iter().any(|o| o == &obs) {
            return false;
        }

        let pos = window
            .iter()
            .rposition(|o| o.timestamp <= obs.timestamp)
            .map(|p| p + 1)
            .unwrap_or(0);
        window.insert(pos, obs);
        while window.len() > self.capacity {
            window.pop_front();
        }
        true
    }

    /// Every observation for `entity_id` across all metrics, in time order.
    pub async fn entity_window(&self, entity_id: &str) -> Vec<Observation> {
        let windows = self.windows.read().await;
        let mut out: Vec<Observation> = windows
            .iter()
            .filter(|((entity, _), _)| entity == entity_id)
            .flat_map(|(_, w)| w.iter().cloned())
            .collect();
        out.sort_by(|a, b| {
            a.timestamp
                .cmp(&b.timestamp)
                .then_with(|| a.metric_name.cmp(&b.metric_name))
        });
        out
    }

    /// Observations for `entity_id` strictly newer than `since`.
    pub async fn since(&self, entity_id: &str, since: DateTime<Utc>) -> Vec<Observation> {
        self.entity_window(entity_id)
            .await
            .into_iter()
            .filter(|o| o.timestamp > since)
            .collect()
    }

    pub async fn entities(&self) -> Vec<String> {
        let windows = self.windows.read().await;
        let mut entities: Vec<String> = windows.keys().map(|(e, _)| e.clone()).collect();
        entities.sort();
        entities.dedup();
        entities
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn obs(entity: &str, metric: &str, value: f64, at: DateTime<Utc>) -> Observation {
        Observation::metric(entity, metric, value, at, "test")
    }

    #[tokio::test]
    async fn test_out_of_order_samples_are_sorted() {
        let store = WindowStore::new(10, chrono::Duration::seconds(60));
        let t0 = Utc::now();
        assert!(store.ingest(obs("db", "cpu", 1.0, t0)).await);
        assert!(store.ingest(obs("db", "cpu", 3.0, t0 + chrono::Duration::seconds(20))).await);
        assert!(store.ingest(obs("db", "cpu", 2.0, t0 + chrono::Duration::seconds(10))).await);

        let values: Vec<f64> = store
            .entity_window("db")
            .await
            .iter()
            .filter_map(|o| o.as_metric())
            .collect();
        assert_eq!(values, vec![1.0, 2.0, 3.0]);
    }

    #[tokio::test]
    async fn test_duplicates_and_stale_samples_dropped() {
        let store = WindowStore::new(10, chrono::Duration::seconds(30));
        let t0 = Utc::now();
        assert!(store.ingest(obs("db", "cpu", 1.0, t0)).await);
        assert!(!store.ingest(obs("db", "cpu", 1.0, t0)).await);
        assert!(!store.ingest(obs("db", "cpu", 9.0, t0 - chrono::Duration::seconds(120))).await);
        assert_eq!(store.entity_window("db").await.len(), 1);
    }

    #[tokio::test]
    async fn test_capacity_evicts_oldest() {
        let store = WindowStore::new(3, chrono::Duration::seconds(300));
        let t0 = Utc::now();
        for i in 0..5 {
            store
                .ingest(obs("db", "cpu", i as f64, t0 + chrono::Duration::seconds(i)))
                .await;
        }
        let values: Vec<f64> = store
            .entity_window("db")
            .await
            .iter()
            .filter_map(|o| o.as_metric())
            .collect();
        assert_eq!(values, vec![2.0, 3.0, 4.0]);
    }

    #[tokio::test]
    async fn test_since_filters_strictly_newer() {
        let store = WindowStore::new(10, chrono::Duration::seconds(300));
        let t0 = Utc::now();
        store.ingest(obs("cache", "memory", 1.0, t0)).await;
        store.ingest(obs("cache", "memory", 2.0, t0 + chrono::Duration::seconds(5))).await;
        store.ingest(obs("db", "memory", 3.0, t0 + chrono::Duration::seconds(5))).await;

        let fresh = store.since("cache", t0).await;
        assert_eq!(fresh.len(), 1);
        assert_eq!(fresh[0].as_metric(), Some(2.0));
        assert_eq!(store.entities().await, vec!["cache".to_string(), "db".to_string()]);
    }
}
