use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;

use super::SimulatedFleet;
use crate::broker::ActionKind;
use crate::executor::{Sandbox, SandboxError, SandboxOutput};

/// Carries remediation actions out against a [`SimulatedFleet`].
pub struct SimulatedSandbox {
    fleet: Arc<SimulatedFleet>,
    latency: Duration,
    /// Probability that a call fails as unavailable before doing anything.
    flakiness: f64,
    rng: Mutex<StdRng>,
}

impl SimulatedSandbox {
    pub fn new(fleet: Arc<SimulatedFleet>) -> Self {
        Self {
            fleet,
            latency: Duration::ZERO,
            flakiness: 0.0,
            rng: Mutex::new(StdRng::seed_from_u64(0)),
        }
    }

    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn with_flakiness(mut self, probability: f64, seed: u64) -> Self {
        self.flakiness = probability.clamp(0.0, 1.0);
        self.rng = Mutex::new(StdRng::seed_from_u64(seed));
        self
    }
}

#[async_trait::async_trait]
impl Sandbox for SimulatedSandbox {
    async fn run(
        &self,
        kind: ActionKind,
        parameters: &BTreeMap<String, String>,
        _timeout: Duration,
    ) -> Result<SandboxOutput, SandboxError> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        if self.flakiness > 0.0 && self.rng.lock().await.gen_bool(self.flakiness) {
            return Err(SandboxError::Unavailable("simulated control plane unavailable".into()));
        }
        let effect = self
            .fleet
            .apply(kind, parameters)
            .await
            .ok_or_else(|| SandboxError::Rejected(format!("{kind} is not supported by the simulation")))?;
        Ok(SandboxOutput {
            exit_status: effect.exit_status,
            output: effect.output,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::FaultScenario;

    #[tokio::test]
    async fn test_actions_reach_the_fleet() {
        let fleet = Arc::new(SimulatedFleet::with_default_services(11));
        fleet.inject("database", FaultScenario::DiskExhaustion).await;
        let sandbox = SimulatedSandbox::new(fleet.clone());

        let params = BTreeMap::from([
            ("path".to_string(), "/var/log/database".to_string()),
            ("service".to_string(), "database".to_string()),
        ]);
        let out = sandbox
            .run(ActionKind::ClearDisk, &params, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(out.exit_status, 0);
        assert!(out.output.contains("disk-exhaustion"));
        assert!(fleet.active_faults().await.is_empty());
    }

    #[tokio::test]
    async fn test_custom_command_is_rejected() {
        let sandbox = SimulatedSandbox::new(Arc::new(SimulatedFleet::with_default_services(1)));
        let err = sandbox
            .run(ActionKind::CustomCommand, &BTreeMap::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Rejected(_)));
    }

    #[tokio::test]
    async fn test_always_flaky_is_unavailable() {
        let sandbox = SimulatedSandbox::new(Arc::new(SimulatedFleet::with_default_services(1)))
            .with_flakiness(1.0, 3);
        let err = sandbox
            .run(ActionKind::NoOp, &BTreeMap::new(), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Unavailable(_)));
    }
}
