//! TOML configuration for fleetmedic.
//!
//! Every section has compiled-in defaults, so an empty file (or none at
//! all) yields a working daemon. The file is located through, in order, an
//! explicit `--config` path, the `FLEETMEDIC_CONFIG` environment variable,
//! and `/etc/fleetmedic/fleetmedic.toml`.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::broker::{ActionKind, ContextLimits, PlanLimits};
use crate::detect::rules::{default_log_rules, default_threshold_rules, LogPatternRule, ThresholdRule};
use crate::executor::DEFAULT_OUTPUT_LIMIT;
use crate::retry::RetryPolicy;

pub const CONFIG_ENV: &str = "FLEETMEDIC_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/fleetmedic/fleetmedic.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FleetConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub source: SourceConfig,
    #[serde(default)]
    pub detector: DetectorConfig,
    #[serde(default)]
    pub broker: BrokerConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub orchestrator: OrchestratorConfig,
    /// Backoff for store writes while the database is unavailable.
    #[serde(default = "default_store_retry")]
    pub store_retry: RetryPolicy,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

impl Default for FleetConfig {
    fn default() -> Self {
        Self {
            storage: StorageConfig::default(),
            source: SourceConfig::default(),
            detector: DetectorConfig::default(),
            broker: BrokerConfig::default(),
            executor: ExecutorConfig::default(),
            orchestrator: OrchestratorConfig::default(),
            store_retry: default_store_retry(),
            logging: LoggingConfig::default(),
            api: ApiConfig::default(),
        }
    }
}

fn default_store_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 5,
        initial_backoff_ms: 200,
        ..RetryPolicy::default()
    }
}

impl FleetConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        info!(path = %path.display(), "loaded fleetmedic configuration");
        Ok(config)
    }

    /// Load from `explicit` if given (failure is an error), else fall back
    /// to [`FleetConfig::load_or_default`].
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        match explicit {
            Some(path) => Self::load(path),
            None => Ok(Self::load_or_default()),
        }
    }

    /// Try `FLEETMEDIC_CONFIG`, then the system path, then defaults.
    pub fn load_or_default() -> Self {
        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "FLEETMEDIC_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return cfg,
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Self::default()
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub db_path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("/var/lib/fleetmedic/fleetmedic.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Observation source
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceKind {
    /// Tail a JSON-lines file of raw events.
    Jsonl,
    /// Poll a metrics-generator endpoint for snapshot documents.
    Snapshot,
    /// In-process simulated fleet; remediation goes to the simulation too.
    Simulated,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    pub kind: SourceKind,
    pub path: PathBuf,
    pub url: String,
    pub request_timeout_ms: u64,
    /// Seed for the simulated fleet.
    pub seed: u64,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            kind: SourceKind::Jsonl,
            path: PathBuf::from("/var/lib/fleetmedic/observations.jsonl"),
            url: "http://localhost:4566/metrics".to_string(),
            request_timeout_ms: 5_000,
            seed: 0,
        }
    }
}

// ---------------------------------------------------------------------------
// Detector
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DetectorConfig {
    /// Samples kept per (entity, metric).
    pub window_capacity: usize,
    /// How far behind the newest sample an out-of-order one may arrive.
    pub max_skew_secs: u64,
    /// Observations stamped further than this in the future are rejected.
    pub max_future_skew_secs: u64,
    pub threshold_rules: Vec<ThresholdRule>,
    pub log_rules: Vec<LogPatternRule>,
}

impl Default for DetectorConfig {
    fn default() -> Self {
        Self {
            window_capacity: 240,
            max_skew_secs: 60,
            max_future_skew_secs: 30,
            threshold_rules: default_threshold_rules(),
            log_rules: default_log_rules(),
        }
    }
}

// ---------------------------------------------------------------------------
// Broker
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrokerConfig {
    /// Hard limit on one oracle round trip.
    pub oracle_timeout_ms: u64,
    /// Oracle calls allowed per entity per window. Zero disables the limit.
    pub rate_limit_calls: u32,
    pub rate_limit_window_secs: u64,
    pub context: ContextLimits,
    pub allowed_actions: Vec<ActionKind>,
    pub max_steps: usize,
    pub max_params: usize,
    pub max_param_key_len: usize,
    pub max_param_value_len: usize,
    /// Used for steps that carry no timeout of their own.
    pub default_step_timeout_ms: u64,
    pub max_step_timeout_ms: u64,
    pub oracle: OracleConfig,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        let limits = PlanLimits::default();
        Self {
            oracle_timeout_ms: 30_000,
            rate_limit_calls: 6,
            rate_limit_window_secs: 300,
            context: ContextLimits::default(),
            allowed_actions: limits.allowed,
            max_steps: limits.max_steps,
            max_params: limits.max_params,
            max_param_key_len: limits.max_key_len,
            max_param_value_len: limits.max_value_len,
            default_step_timeout_ms: limits.default_timeout_ms,
            max_step_timeout_ms: limits.max_timeout_ms,
            oracle: OracleConfig::default(),
        }
    }
}

impl BrokerConfig {
    pub fn plan_limits(&self) -> PlanLimits {
        PlanLimits {
            max_steps: self.max_steps,
            allowed: self.allowed_actions.clone(),
            max_params: self.max_params,
            max_key_len: self.max_param_key_len,
            max_value_len: self.max_param_value_len,
            default_timeout_ms: self.default_step_timeout_ms,
            max_timeout_ms: self.max_step_timeout_ms,
        }
    }

    pub fn context_limits(&self) -> ContextLimits {
        self.context.clone()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OracleBackend {
    /// Built-in rule table; no network.
    Heuristic,
    /// OpenAI-compatible `/chat/completions` endpoint.
    Chat,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OracleConfig {
    pub backend: OracleBackend,
    pub base_url: String,
    pub model: String,
    /// Environment variable holding the API key, if the endpoint needs one.
    pub api_key_env: Option<String>,
    pub temperature: f32,
    pub max_tokens: u32,
}

impl Default for OracleConfig {
    fn default() -> Self {
        Self {
            backend: OracleBackend::Heuristic,
            base_url: "http://localhost:11434/v1".to_string(),
            model: "llama3.1".to_string(),
            api_key_env: Some("FLEETMEDIC_ORACLE_KEY".to_string()),
            temperature: 0.1,
            max_tokens: 1024,
        }
    }
}

// ---------------------------------------------------------------------------
// Executor
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Per-step budget for transient sandbox failures.
    pub step_retry: RetryPolicy,
    /// Bytes of sandbox output kept per step.
    pub output_limit: usize,
    /// Escalate straight away when a step fails non-transiently, instead of
    /// verifying and re-diagnosing.
    pub escalate_on_nontransient: bool,
    /// argv templates keyed by action kind; `{param}` is substituted.
    pub commands: BTreeMap<String, Vec<String>>,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        let argv = |parts: &[&str]| parts.iter().map(|s| s.to_string()).collect::<Vec<_>>();
        Self {
            step_retry: RetryPolicy::default(),
            output_limit: DEFAULT_OUTPUT_LIMIT,
            escalate_on_nontransient: false,
            commands: BTreeMap::from([
                (
                    ActionKind::RestartService.as_str().to_string(),
                    argv(&["systemctl", "restart", "{service}"]),
                ),
                (ActionKind::NoOp.as_str().to_string(), argv(&["true"])),
            ]),
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Incidents processed concurrently.
    pub workers: usize,
    /// Observation poll and detection interval.
    pub tick_ms: u64,
    /// Remediation cycles before an incident escalates.
    pub max_attempts: u32,
    /// Oracle calls per decision cycle before the incident escalates.
    pub decision_retry: RetryPolicy,
    /// Wait after an attempt before samples count as fresh.
    pub settle_delay_ms: u64,
    /// How long verification waits for conclusive data.
    pub verification_window_ms: u64,
    pub verification_poll_ms: u64,
    /// Delay before retrying a cycle suspended on an unavailable store.
    pub requeue_delay_ms: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            workers: 4,
            tick_ms: 5_000,
            max_attempts: 3,
            decision_retry: RetryPolicy {
                max_attempts: 3,
                initial_backoff_ms: 1_000,
                ..RetryPolicy::default()
            },
            settle_delay_ms: 30_000,
            verification_window_ms: 120_000,
            verification_poll_ms: 2_000,
            requeue_delay_ms: 5_000,
        }
    }
}

impl OrchestratorConfig {
    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(1))
    }

    pub fn settle_delay(&self) -> Duration {
        Duration::from_millis(self.settle_delay_ms)
    }

    pub fn verification_window(&self) -> Duration {
        Duration::from_millis(self.verification_window_ms)
    }

    pub fn verification_poll(&self) -> Duration {
        Duration::from_millis(self.verification_poll_ms.max(1))
    }

    pub fn requeue_delay(&self) -> Duration {
        Duration::from_millis(self.requeue_delay_ms)
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable text.
    pub json: bool,
    /// Optional JSON-lines copy of the audit trail.
    pub audit_mirror_path: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
            audit_mirror_path: None,
        }
    }
}

// ---------------------------------------------------------------------------
// API
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "127.0.0.1:8470".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
