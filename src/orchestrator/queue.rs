//! Work queue keyed by incident id.
//!
//! An incident is either queued, in flight, or absent. Submitting an
//! incident that is already queued or in flight merges the new context into
//! the existing entry instead of creating a second one, which is what keeps
//! remediation to one active cycle per incident.

use std::collections::{HashMap, VecDeque};

use tokio::sync::{Mutex, Notify};
use uuid::Uuid;

use crate::observe::Observation;

/// Most observations carried per pending context; oldest are dropped.
pub const MAX_PENDING_OBSERVATIONS: usize = 256;

/// Fresh data gathered for an incident between cycles.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PendingContext {
    pub observations: Vec<Observation>,
    /// Detections folded into this context.
    pub detections: u32,
}

impl PendingContext {
    pub fn detected(observations: Vec<Observation>) -> Self {
        let mut ctx = Self {
            observations: Vec::new(),
            detections: 1,
        };
        ctx.push_observations(observations);
        ctx
    }

    pub fn is_empty(&self) -> bool {
        self.observations.is_empty() && self.detections == 0
    }

    pub fn merge(&mut self, other: PendingContext) {
        self.detections = self.detections.saturating_add(other.detections);
        self.push_observations(other.observations);
    }

    fn push_observations(&mut self, observations: Vec<Observation>) {
        for obs in observations {
            if !self.observations.contains(&obs) {
                self.observations.push(obs);
            }
        }
        if self.observations.len() > MAX_PENDING_OBSERVATIONS {
            self.observations.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
            let excess = self.observations.len() - MAX_PENDING_OBSERVATIONS;
            self.observations.drain(..excess);
        }
    }
}

/// What `submit` did with the context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    Queued,
    /// Merged into an entry still waiting in the queue.
    Coalesced,
    /// Merged into the context of a cycle already running.
    MergedInFlight,
}

#[derive(Default)]
struct Inner {
    ready: VecDeque<Uuid>,
    queued: HashMap<Uuid, PendingContext>,
    in_flight: HashMap<Uuid, PendingContext>,
}

#[derive(Default)]
pub struct WorkQueue {
    inner: Mutex<Inner>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn submit(&self, incident_id: Uuid, ctx: PendingContext) -> Submitted {
        let mut inner = self.inner.lock().await;
        if let Some(pending) = inner.in_flight.get_mut(&incident_id) {
            pending.merge(ctx);
            return Submitted::MergedInFlight;
        }
        if let Some(pending) = inner.queued.get_mut(&incident_id) {
            pending.merge(ctx);
            return Submitted::Coalesced;
        }
        inner.queued.insert(incident_id, ctx);
        inner.ready.push_back(incident_id);
        drop(inner);
        self.notify.notify_one();
        Submitted::Queued
    }

    /// Wait for the next queued incident and mark it in flight.
    pub async fn next(&self) -> (Uuid, PendingContext) {
        loop {
            if let Some(item) = self.try_next().await {
                return item;
            }
            self.notify.notified().await;
        }
    }

    pub async fn try_next(&self) -> Option<(Uuid, PendingContext)> {
        let mut inner = self.inner.lock().await;
        let id = inner.ready.pop_front()?;
        let ctx = inner.queued.remove(&id).unwrap_or_default();
        inner.in_flight.insert(id, PendingContext::default());
        Some((id, ctx))
    }

    /// Take whatever was merged into a running cycle so far.
    pub async fn take_pending(&self, incident_id: &Uuid) -> PendingContext {
        let mut inner = self.inner.lock().await;
        inner
            .in_flight
            .get_mut(incident_id)
            .map(std::mem::take)
            .unwrap_or_default()
    }

    /// Release an in-flight incident. Returns context merged after the
    /// last [`WorkQueue::take_pending`], for the caller to resubmit if the
    /// incident is still open.
    pub async fn complete(&self, incident_id: &Uuid) -> PendingContext {
        let mut inner = self.inner.lock().await;
        inner.in_flight.remove(incident_id).unwrap_or_default()
    }

    pub async fn is_in_flight(&self, incident_id: &Uuid) -> bool {
        self.inner.lock().await.in_flight.contains_key(incident_id)
    }

    /// (queued, in flight)
    pub async fn depth(&self) -> (usize, usize) {
        let inner = self.inner.lock().await;
        (inner.ready.len(), inner.in_flight.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use std::sync::Arc;
    use std::time::Duration;

    fn obs(v: f64) -> Observation {
        Observation::metric("web", "cpu", v, Utc::now(), "test")
    }

    #[tokio::test]
    async fn test_duplicate_submits_coalesce() {
        let q = WorkQueue::new();
        let id = Uuid::new_v4();
        assert_eq!(q.submit(id, PendingContext::detected(vec![obs(1.0)])).await, Submitted::Queued);
        assert_eq!(q.submit(id, PendingContext::detected(vec![obs(2.0)])).await, Submitted::Coalesced);
        assert_eq!(q.depth().await, (1, 0));

        let (got, ctx) = q.next().await;
        assert_eq!(got, id);
        assert_eq!(ctx.detections, 2);
        assert_eq!(ctx.observations.len(), 2);
        assert!(q.try_next().await.is_none());
    }

    #[tokio::test]
    async fn test_in_flight_incident_is_not_handed_out_twice() {
        let q = WorkQueue::new();
        let id = Uuid::new_v4();
        q.submit(id, PendingContext::detected(vec![])).await;
        let (got, _) = q.next().await;
        assert_eq!(got, id);
        assert!(q.is_in_flight(&id).await);

        assert_eq!(
            q.submit(id, PendingContext::detected(vec![obs(3.0)])).await,
            Submitted::MergedInFlight
        );
        assert!(q.try_next().await.is_none());

        let pending = q.take_pending(&id).await;
        assert_eq!(pending.observations.len(), 1);
        assert!(q.take_pending(&id).await.is_empty());

        q.submit(id, PendingContext::detected(vec![])).await;
        let leftover = q.complete(&id).await;
        assert_eq!(leftover.detections, 1);
        assert!(!q.is_in_flight(&id).await);
        assert_eq!(q.submit(id, leftover).await, Submitted::Queued);
    }

    #[tokio::test]
    async fn test_next_waits_for_submit() {
        let q = Arc::new(WorkQueue::new());
        let id = Uuid::new_v4();
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await.0 })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;
        q.submit(id, PendingContext::default()).await;
        let got = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
        assert_eq!(got, id);
    }

    #[test]
    fn test_complete_unknown_incident_is_empty() {
        let q = WorkQueue::new();
        let id = Uuid::new_v4();
        tokio_test::block_on(async {
            assert!(q.complete(&id).await.is_empty());
            assert!(q.take_pending(&id).await.is_empty());
            assert_eq!(q.depth().await, (0, 0));
        });
    }

    #[test]
    fn test_pending_context_is_bounded() {
        let start = Utc::now();
        let many: Vec<Observation> = (0..MAX_PENDING_OBSERVATIONS + 10)
            .map(|i| Observation::metric("web", "cpu", i as f64, start + chrono::Duration::seconds(i as i64), "t"))
            .collect();
        let ctx = PendingContext::detected(many);
        assert_eq!(ctx.observations.len(), MAX_PENDING_OBSERVATIONS);
        assert_eq!(ctx.observations[0].as_metric(), Some(10.0));
    }
}
