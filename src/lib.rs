//! fleetmedic -- autonomous incident orchestration for a service fleet.
//!
//! Observations are windowed and checked by the detector; each anomaly
//! becomes an incident that the orchestrator drives through diagnosis (an
//! external oracle proposes a plan), remediation (a sandbox carries it out)
//! and verification, recording every step in a durable audit trail.

pub mod api;
pub mod audit;
pub mod broker;
pub mod config;
pub mod detect;
pub mod executor;
pub mod incident;
pub mod observe;
pub mod orchestrator;
pub mod retry;
pub mod sim;
pub mod storage;
pub mod verify;

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use crate::audit::{AuditLogger, JsonlMirror};
use crate::broker::http::ChatOracle;
use crate::broker::{DecisionBroker, Oracle};
use crate::config::{FleetConfig, OracleBackend, SourceKind};
use crate::detect::{Detector, WindowStore};
use crate::executor::{CommandSandbox, RemediationExecutor, Sandbox};
use crate::incident::{Incident, IncidentRegistry};
use crate::observe::{JsonlFeed, ObservationSource, SnapshotFeed};
use crate::orchestrator::{Engine, Orchestrator, WorkQueue};
use crate::retry::RetryPolicy;
use crate::sim::{FaultScenario, HeuristicOracle, SimulatedFleet, SimulatedSandbox};
use crate::storage::Store;
use crate::verify::Verifier;

/// Everything the daemon needs, wired from one [`FleetConfig`].
pub struct Runtime {
    pub config: FleetConfig,
    pub audit: Arc<AuditLogger>,
    pub engine: Arc<Engine>,
    /// Present when the observation source is the simulated fleet.
    pub fleet: Option<Arc<SimulatedFleet>>,
}

/// Open the SQLite store at `path`, creating its directory if needed.
pub fn open_store(path: &Path) -> Result<Store> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("failed to create {}", parent.display()))?;
    }
    let path_str = path
        .to_str()
        .with_context(|| format!("database path is not UTF-8: {}", path.display()))?;
    tracing::info!(db_path = %path_str, "initializing database");
    Store::open(path_str)
}

/// Build every component from `config`. Store retries stop waiting once
/// `shutdown` fires.
pub async fn assemble(config: FleetConfig, shutdown: CancellationToken) -> Result<Runtime> {
    let store = open_store(&config.storage.db_path)?;
    let mut audit = AuditLogger::new(store, config.store_retry.clone()).with_shutdown(shutdown);
    if let Some(path) = &config.logging.audit_mirror_path {
        audit = audit.with_mirror(JsonlMirror::open(path.clone()).await?);
    }
    let audit = Arc::new(audit);

    let detector_cfg = &config.detector;
    let detector = Arc::new(Detector::new(
        detector_cfg.threshold_rules.clone(),
        detector_cfg.log_rules.clone(),
    ));
    let windows = Arc::new(WindowStore::new(
        detector_cfg.window_capacity,
        chrono::Duration::seconds(detector_cfg.max_skew_secs as i64),
    ));

    let mut fleet = None;
    let (source, sandbox): (Arc<dyn ObservationSource>, Arc<dyn Sandbox>) = match config.source.kind {
        SourceKind::Simulated => {
            let sim = Arc::new(SimulatedFleet::with_default_services(config.source.seed));
            fleet = Some(sim.clone());
            let source: Arc<dyn ObservationSource> = sim.clone();
            let sandbox: Arc<dyn Sandbox> = Arc::new(SimulatedSandbox::new(sim));
            (source, sandbox)
        }
        SourceKind::Jsonl => {
            let feed: Arc<dyn ObservationSource> = Arc::new(JsonlFeed::new(config.source.path.clone()));
            let sandbox: Arc<dyn Sandbox> = Arc::new(CommandSandbox::new(&config.executor.commands)?);
            (feed, sandbox)
        }
        SourceKind::Snapshot => {
            let feed: Arc<dyn ObservationSource> = Arc::new(SnapshotFeed::new(
                config.source.url.clone(),
                Duration::from_millis(config.source.request_timeout_ms),
            )?);
            let sandbox: Arc<dyn Sandbox> = Arc::new(CommandSandbox::new(&config.executor.commands)?);
            (feed, sandbox)
        }
    };

    let oracle: Arc<dyn Oracle> = match config.broker.oracle.backend {
        OracleBackend::Heuristic => Arc::new(HeuristicOracle::new()),
        OracleBackend::Chat => Arc::new(ChatOracle::new(&config.broker.oracle)?),
    };
    tracing::info!(
        oracle = oracle.name(),
        source = ?config.source.kind,
        workers = config.orchestrator.workers,
        "components assembled"
    );

    let broker = Arc::new(DecisionBroker::new(&config.broker, oracle, audit.clone()));
    let executor = Arc::new(
        RemediationExecutor::new(sandbox, audit.clone(), config.executor.step_retry.clone())
            .with_output_limit(config.executor.output_limit),
    );
    let registry = Arc::new(IncidentRegistry::new(audit.clone(), config.orchestrator.max_attempts));
    let orchestrator = Orchestrator::new(
        registry,
        broker,
        executor,
        Verifier::new(detector.clone()),
        windows,
        Arc::new(WorkQueue::new()),
        config.orchestrator.clone(),
    )
    .with_escalate_on_nontransient(config.executor.escalate_on_nontransient);

    let engine = Arc::new(Engine::new(
        source,
        detector,
        Arc::new(orchestrator),
        chrono::Duration::seconds(config.detector.max_future_skew_secs as i64),
    ));

    Ok(Runtime {
        config,
        audit,
        engine,
        fleet,
    })
}

impl Runtime {
    /// Run the engine, and the API when enabled, until `shutdown` fires.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let api = if self.config.api.enabled {
            let bind = self.config.api.bind.clone();
            let state = api::state::AppState::new(self.audit.clone());
            let token = shutdown.clone();
            Some(tokio::spawn(async move { api::serve(&bind, state, token).await }))
        } else {
            None
        };

        let result = self.engine.clone().run(shutdown.clone()).await;
        shutdown.cancel();
        if let Some(api) = api {
            match api.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::error!(error = %e, "dashboard API failed"),
                Err(e) => tracing::error!(error = %e, "dashboard API task failed"),
            }
        }
        result
    }
}

/// Tighten `config` for a fast, self-contained simulation: the simulated
/// fleet and sandbox, the heuristic oracle, sub-second ticks and short
/// debounce, settle and verification timings.
pub fn simulation_profile(config: &mut FleetConfig) {
    config.source.kind = SourceKind::Simulated;
    config.broker.oracle.backend = OracleBackend::Heuristic;
    config.broker.rate_limit_calls = config.broker.rate_limit_calls.max(20);
    for rule in config.detector.threshold_rules.iter_mut() {
        rule.sustain_secs = rule.sustain_secs.min(1);
    }
    let orch = &mut config.orchestrator;
    orch.tick_ms = 500;
    orch.settle_delay_ms = 0;
    orch.verification_window_ms = 3_000;
    orch.verification_poll_ms = 250;
    orch.requeue_delay_ms = 500;
    orch.decision_retry = RetryPolicy {
        max_attempts: orch.decision_retry.max_attempts,
        initial_backoff_ms: 100,
        ..RetryPolicy::default()
    };
    config.executor.step_retry = RetryPolicy {
        max_attempts: config.executor.step_retry.max_attempts,
        initial_backoff_ms: 50,
        ..RetryPolicy::default()
    };
    config.api.enabled = false;
}

#[derive(Debug)]
pub struct SimulationReport {
    pub ticks: u32,
    pub injected: Vec<(String, FaultScenario)>,
    pub remaining_faults: Vec<(String, FaultScenario)>,
    pub incidents: Vec<Incident>,
}

/// Run the simulated fleet for up to `cycles` ticks with `faults` random
/// faults injected up front. Stops early once every fault is cleared and
/// no incident is open.
pub async fn simulate(mut config: FleetConfig, cycles: u32, faults: usize) -> Result<SimulationReport> {
    simulation_profile(&mut config);
    let tick = config.orchestrator.tick();
    let shutdown = CancellationToken::new();
    let runtime = assemble(config, shutdown.clone()).await?;
    let fleet = runtime
        .fleet
        .clone()
        .context("simulation requires the simulated source")?;

    let mut injected = Vec::new();
    for _ in 0..faults {
        if let Some(fault) = fleet.inject_random().await {
            injected.push(fault);
        }
    }

    let engine = runtime.engine.clone();
    let handle = tokio::spawn(engine.clone().run(shutdown.clone()));

    let mut ticks = 0;
    let mut interval = tokio::time::interval(tick);
    interval.tick().await;
    while ticks < cycles {
        interval.tick().await;
        ticks += 1;
        let settled = fleet.active_faults().await.is_empty()
            && engine.orchestrator().registry().list_open()?.is_empty();
        if ticks >= 2 && settled {
            break;
        }
    }

    shutdown.cancel();
    handle.await.context("engine task panicked")??;

    let mut incidents = runtime.audit.store().list_incidents(false, 1_000)?;
    incidents.reverse();
    Ok(SimulationReport {
        ticks,
        injected,
        remaining_faults: fleet.active_faults().await,
        incidents,
    })
}
