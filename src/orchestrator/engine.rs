//! Tick loop and worker pool.
//!
//! Every tick polls the observation source, feeds the windows, evaluates
//! the entities that received data, and submits an incident to the work
//! queue for every signal. A dispatcher hands queued incidents to at most
//! `workers` concurrent cycles.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use chrono::{DateTime, Utc};
use tokio::sync::{Mutex, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::{CycleOutcome, Orchestrator, OrchestratorError, PendingContext, Submitted};
use crate::audit::{AuditKind, AuditRecord};
use crate::detect::Detector;
use crate::incident::{Incident, OpenRequest};
use crate::observe::{normalize, Observation, ObservationSource};

/// Counters for one tick.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub events: usize,
    pub accepted: usize,
    pub rejected: usize,
    pub signals: usize,
    pub suppressed: usize,
    pub opened: usize,
    pub submitted: usize,
    pub errors: usize,
}

pub struct Engine {
    source: Arc<dyn ObservationSource>,
    detector: Arc<Detector>,
    orchestrator: Arc<Orchestrator>,
    max_future_skew: chrono::Duration,
    /// Closure time of the last incident per signature. Signals observed
    /// at or before it describe the fault that incident already handled.
    closed: Mutex<HashMap<String, DateTime<Utc>>>,
}

impl Engine {
    pub fn new(
        source: Arc<dyn ObservationSource>,
        detector: Arc<Detector>,
        orchestrator: Arc<Orchestrator>,
        max_future_skew: chrono::Duration,
    ) -> Self {
        Self {
            source,
            detector,
            orchestrator,
            max_future_skew,
            closed: Mutex::new(HashMap::new()),
        }
    }

    pub fn orchestrator(&self) -> &Arc<Orchestrator> {
        &self.orchestrator
    }

    /// Queue every incident left open by a previous run.
    pub async fn recover(&self) -> Result<usize> {
        let open = self.orchestrator.registry().list_open()?;
        for incident in &open {
            info!(incident_id = %incident.incident_id, state = %incident.state, "resuming open incident");
            self.orchestrator
                .queue()
                .submit(incident.incident_id, PendingContext::default())
                .await;
        }
        Ok(open.len())
    }

    /// One poll, ingest and detect pass.
    pub async fn tick(&self) -> TickSummary {
        let mut summary = TickSummary::default();
        let events = match self.source.poll().await {
            Ok(events) => events,
            Err(e) => {
                warn!(error = %e, "observation source poll failed");
                summary.errors += 1;
                return summary;
            }
        };
        summary.events = events.len();

        let now = Utc::now();
        let windows = self.orchestrator.windows();
        let mut fresh: HashMap<String, Vec<Observation>> = HashMap::new();
        let mut touched = BTreeSet::new();
        for raw in events {
            match normalize(raw, now, self.max_future_skew) {
                Ok(obs) => {
                    touched.insert(obs.entity_id.clone());
                    if windows.ingest(obs.clone()).await {
                        summary.accepted += 1;
                        fresh.entry(obs.entity_id.clone()).or_default().push(obs);
                    }
                }
                Err(e) => {
                    debug!(error = %e, "observation rejected");
                    summary.rejected += 1;
                }
            }
        }

        for entity in touched {
            let window = windows.entity_window(&entity).await;
            for signal in self.detector.evaluate(&entity, &window) {
                summary.signals += 1;
                let signature = self.detector.signature(&signal);
                if self.is_stale(&signature, signal.observed_at).await {
                    summary.suppressed += 1;
                    continue;
                }

                let request = OpenRequest::from_signal(&signal, signature);
                let (incident, created) = match self.orchestrator.registry().open_or_get(&request).await {
                    Ok(opened) => opened,
                    Err(e) => {
                        warn!(entity = %entity, signature = %request.signature, error = %e, "could not open incident");
                        summary.errors += 1;
                        continue;
                    }
                };
                if created {
                    summary.opened += 1;
                }

                let ctx = PendingContext::detected(fresh.get(&entity).cloned().unwrap_or_default());
                let submitted = self.orchestrator.queue().submit(incident.incident_id, ctx).await;
                debug!(incident_id = %incident.incident_id, ?submitted, "signal submitted");
                if submitted == Submitted::Queued {
                    summary.submitted += 1;
                }
            }
        }
        summary
    }

    async fn is_stale(&self, signature: &str, observed_at: DateTime<Utc>) -> bool {
        self.closed
            .lock()
            .await
            .get(signature)
            .is_some_and(|closed_at| observed_at <= *closed_at)
    }

    /// Remember when `incident` closed so the evidence that opened it does
    /// not open a successor.
    pub async fn record_closure(&self, incident: &Incident) {
        let closed_at = incident.closed_at.unwrap_or_else(Utc::now);
        self.closed
            .lock()
            .await
            .insert(incident.signature.clone(), closed_at);
    }

    /// Run until `shutdown` fires. In-flight cycles are cancelled and
    /// awaited before this returns.
    pub async fn run(self: Arc<Self>, shutdown: CancellationToken) -> Result<()> {
        let resumed = self.recover().await?;
        let config = self.orchestrator.config();
        info!(workers = config.workers, tick_ms = config.tick_ms, resumed, "engine started");

        let dispatcher = tokio::spawn(self.clone().dispatch(shutdown.clone()));

        let mut interval = tokio::time::interval(config.tick());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let summary = self.tick().await;
                    if summary.events > 0 || summary.errors > 0 {
                        debug!(?summary, "tick");
                    }
                }
            }
        }

        if let Err(e) = dispatcher.await {
            error!(error = %e, "dispatcher task failed");
        }
        info!("engine stopped");
        Ok(())
    }

    async fn dispatch(self: Arc<Self>, shutdown: CancellationToken) {
        let semaphore = Arc::new(Semaphore::new(self.orchestrator.config().workers.max(1)));
        let mut tasks = JoinSet::new();
        loop {
            let permit = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                permit = semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            let (incident_id, ctx) = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                item = self.orchestrator.queue().next() => item,
            };

            let engine = self.clone();
            let cancel = shutdown.clone();
            tasks.spawn(async move {
                let _permit = permit;
                engine.work(incident_id, ctx, &cancel).await;
            });
            while let Some(joined) = tasks.try_join_next() {
                if let Err(e) = joined {
                    error!(error = %e, "worker task failed");
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                error!(error = %e, "worker task failed");
            }
        }
    }

    /// Run one cycle and settle what happens to the incident next.
    pub async fn work(self: &Arc<Self>, incident_id: Uuid, ctx: PendingContext, cancel: &CancellationToken) {
        let result = self.orchestrator.run_cycle(incident_id, ctx, cancel).await;
        let leftover = self.orchestrator.queue().complete(&incident_id).await;
        self.settle(incident_id, leftover, result, cancel).await;
    }

    async fn settle(
        self: &Arc<Self>,
        incident_id: Uuid,
        leftover: PendingContext,
        result: std::result::Result<CycleOutcome, OrchestratorError>,
        cancel: &CancellationToken,
    ) {

        match result {
            Ok(CycleOutcome::Finished(state)) => {
                info!(incident_id = %incident_id, state = %state, "incident closed");
                match self.orchestrator.registry().get(&incident_id) {
                    Ok(Some(incident)) => self.record_closure(&incident).await,
                    Ok(None) => {}
                    Err(e) => warn!(incident_id = %incident_id, error = %e, "could not read closed incident"),
                }
            }
            Ok(CycleOutcome::Deferred(wait)) => {
                info!(incident_id = %incident_id, wait_ms = wait.as_millis() as u64, "cycle deferred by oracle rate limit");
                self.requeue_after(incident_id, leftover, wait, cancel);
            }
            Err(OrchestratorError::Cancelled) => {
                debug!(incident_id = %incident_id, "cycle cancelled");
            }
            Err(e) if e.is_store_unavailable() => {
                let wait = self.orchestrator.config().requeue_delay();
                warn!(incident_id = %incident_id, error = %e, wait_ms = wait.as_millis() as u64, "store unavailable, cycle suspended");
                self.requeue_after(incident_id, leftover, wait, cancel);
            }
            Err(OrchestratorError::NotFound(_)) => {
                warn!(incident_id = %incident_id, "queued incident no longer exists");
            }
            Err(e) => {
                // Still open; a later cycle resumes from the last durable state.
                let wait = self.orchestrator.config().requeue_delay();
                error!(incident_id = %incident_id, error = %e, wait_ms = wait.as_millis() as u64, "cycle failed");
                let record = AuditRecord::new(AuditKind::Error)
                    .with_incident(incident_id)
                    .with_field("error", e.to_string());
                if let Err(e) = self.orchestrator.audit().record(record).await {
                    warn!(incident_id = %incident_id, error = %e, "could not audit cycle failure");
                }
                self.requeue_after(incident_id, leftover, wait, cancel);
            }
        }
    }

    fn requeue_after(self: &Arc<Self>, incident_id: Uuid, ctx: PendingContext, wait: Duration, cancel: &CancellationToken) {
        let engine = self.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(wait) => {
                    engine.orchestrator.queue().submit(incident_id, ctx).await;
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::AuditLogger;
    use crate::broker::{ActionKind, DecisionBroker, Oracle, OracleRequest};
    use crate::config::{BrokerConfig, OrchestratorConfig};
    use crate::detect::rules::{default_log_rules, default_threshold_rules};
    use crate::detect::WindowStore;
    use crate::executor::{RemediationExecutor, Sandbox, SandboxError, SandboxOutput};
    use crate::incident::{CloseOutcome, IncidentRegistry, IncidentState, RegistryError};
    use crate::observe::RawEvent;
    use crate::orchestrator::WorkQueue;
    use crate::retry::RetryPolicy;
    use crate::storage::{open_memory_pool, Store};
    use crate::verify::Verifier;
    use std::collections::BTreeMap;

    /// Hands out one batch per poll.
    struct Batches(std::sync::Mutex<Vec<Vec<RawEvent>>>);

    #[async_trait::async_trait]
    impl ObservationSource for Batches {
        async fn poll(&self) -> Result<Vec<RawEvent>> {
            let mut batches = self.0.lock().unwrap();
            Ok(if batches.is_empty() { Vec::new() } else { batches.remove(0) })
        }
    }

    struct Silent;

    #[async_trait::async_trait]
    impl Oracle for Silent {
        fn name(&self) -> &str {
            "silent"
        }

        async fn propose(&self, _request: &OracleRequest) -> anyhow::Result<String> {
            Ok(r#"{"action": "no-action"}"#.into())
        }
    }

    struct Noop;

    #[async_trait::async_trait]
    impl Sandbox for Noop {
        async fn run(
            &self,
            _kind: ActionKind,
            _parameters: &BTreeMap<String, String>,
            _timeout: Duration,
        ) -> std::result::Result<SandboxOutput, SandboxError> {
            Ok(SandboxOutput {
                exit_status: 0,
                output: String::new(),
            })
        }
    }

    fn engine(batches: Vec<Vec<RawEvent>>) -> (Arc<Engine>, Store) {
        let store = Store::new(open_memory_pool().unwrap());
        let audit = Arc::new(AuditLogger::new(store.clone(), RetryPolicy::once()));
        let detector = Arc::new(Detector::new(default_threshold_rules(), default_log_rules()));
        let orchestrator = Orchestrator::new(
            Arc::new(IncidentRegistry::new(audit.clone(), 3)),
            Arc::new(DecisionBroker::new(&BrokerConfig::default(), Arc::new(Silent), audit.clone())),
            Arc::new(RemediationExecutor::new(Arc::new(Noop), audit, RetryPolicy::once())),
            Verifier::new(detector.clone()),
            Arc::new(WindowStore::new(240, chrono::Duration::seconds(60))),
            Arc::new(WorkQueue::new()),
            OrchestratorConfig {
                tick_ms: 20,
                requeue_delay_ms: 20,
                ..OrchestratorConfig::default()
            },
        );
        let engine = Engine::new(
            Arc::new(Batches(std::sync::Mutex::new(batches))),
            detector,
            Arc::new(orchestrator),
            chrono::Duration::seconds(30),
        );
        (Arc::new(engine), store)
    }

    fn crash(entity: &str, at: DateTime<Utc>) -> RawEvent {
        RawEvent::Log {
            entity: entity.into(),
            line: "CRASH: worker exited".into(),
            timestamp: at,
            source: "test".into(),
        }
    }

    #[tokio::test]
    async fn test_tick_opens_and_queues_one_incident_per_signature() {
        let now = Utc::now();
        let (engine, store) = engine(vec![
            vec![crash("api", now - chrono::Duration::seconds(2))],
            vec![crash("api", now - chrono::Duration::seconds(1))],
        ]);

        let first = engine.tick().await;
        assert_eq!(first.accepted, 1);
        assert_eq!(first.opened, 1);
        assert_eq!(first.submitted, 1);

        let second = engine.tick().await;
        assert_eq!(second.opened, 0);
        assert_eq!(second.submitted, 0);

        assert_eq!(store.list_incidents(true, 10).unwrap().len(), 1);
        assert_eq!(engine.orchestrator().queue().depth().await, (1, 0));
    }

    #[tokio::test]
    async fn test_invalid_events_are_rejected() {
        let now = Utc::now();
        let (engine, _) = engine(vec![vec![
            RawEvent::Metric {
                entity: "api".into(),
                name: "cpu".into(),
                value: f64::NAN,
                timestamp: now,
                source: "test".into(),
            },
            RawEvent::Metric {
                entity: " ".into(),
                name: "cpu".into(),
                value: 1.0,
                timestamp: now,
                source: "test".into(),
            },
            crash("api", now + chrono::Duration::hours(1)),
        ]]);
        let summary = engine.tick().await;
        assert_eq!(summary.events, 3);
        assert_eq!(summary.rejected, 3);
        assert_eq!(summary.signals, 0);
    }

    #[tokio::test]
    async fn test_evidence_from_before_closure_is_suppressed() {
        let now = Utc::now();
        let (engine, store) = engine(vec![
            vec![crash("api", now - chrono::Duration::seconds(5))],
            vec![RawEvent::Metric {
                entity: "api".into(),
                name: "cpu".into(),
                value: 10.0,
                timestamp: now,
                source: "test".into(),
            }],
            vec![crash("api", Utc::now() + chrono::Duration::seconds(5))],
        ]);
        engine.tick().await;
        let open = store.list_incidents(true, 10).unwrap();
        let closed = engine
            .orchestrator()
            .registry()
            .close(open[0].incident_id, CloseOutcome::Abandoned { reason: "test".into() })
            .await
            .unwrap();
        engine.record_closure(&closed).await;

        // Same crash line still in the window.
        let stale = engine.tick().await;
        assert_eq!(stale.suppressed, 1);
        assert_eq!(stale.opened, 0);

        // A new crash after closure opens a successor.
        let fresh = engine.tick().await;
        assert_eq!(fresh.opened, 1);
        let all = store.list_incidents(false, 10).unwrap();
        assert_eq!(all.len(), 2);
    }

    #[tokio::test]
    async fn test_recover_queues_open_incidents() {
        let (engine, _) = engine(vec![vec![crash("api", Utc::now())]]);
        engine.tick().await;
        let (id, _) = engine.orchestrator().queue().try_next().await.unwrap();
        engine.orchestrator().queue().complete(&id).await;

        assert_eq!(engine.recover().await.unwrap(), 1);
        assert_eq!(engine.orchestrator().queue().depth().await, (1, 0));
    }

    #[tokio::test]
    async fn test_failed_cycle_is_requeued() {
        let (engine, store) = engine(vec![vec![crash("api", Utc::now())]]);
        engine.tick().await;
        let (id, _) = engine.orchestrator().queue().try_next().await.unwrap();
        let leftover = engine.orchestrator().queue().complete(&id).await;
        assert_eq!(engine.orchestrator().queue().depth().await, (0, 0));

        let failure = Err(OrchestratorError::Registry(RegistryError::Contention(id)));
        engine.settle(id, leftover, failure, &CancellationToken::new()).await;

        let errors = store.audit_for_incident(&id).unwrap();
        assert!(errors.iter().any(|r| r.kind == AuditKind::Error));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(engine.orchestrator().queue().depth().await, (1, 0));
        let (requeued, _) = engine.orchestrator().queue().try_next().await.unwrap();
        assert_eq!(requeued, id);
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let (engine, store) = engine(vec![vec![crash("api", Utc::now())]]);
        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(engine.clone().run(shutdown.clone()));
        tokio::time::sleep(Duration::from_millis(100)).await;
        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let incidents = store.list_incidents(false, 10).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_ne!(incidents[0].state, IncidentState::Detected);
    }
}
