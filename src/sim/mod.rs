//! Simulated fleet for demos and end-to-end tests.
//!
//! [`SimulatedFleet`] is an observation source whose services can have
//! faults injected; [`SimulatedSandbox`] applies remediation actions back
//! to it, and [`HeuristicOracle`] proposes plans from a fixed rule table.
//! Wired together they exercise the whole control loop without any real
//! infrastructure.

pub mod fleet;
pub mod oracle;
pub mod sandbox;

pub use fleet::SimulatedFleet;
pub use oracle::HeuristicOracle;
pub use sandbox::SimulatedSandbox;

use serde::{Deserialize, Serialize};

/// Services the metrics generator reports on.
pub const DEFAULT_SERVICES: [&str; 5] = ["web-api", "auth-service", "database", "cache", "worker-queue"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FaultScenario {
    CpuSaturation,
    MemoryLeak,
    DiskExhaustion,
    ServiceCrash,
    ErrorStorm,
    LatencySpike,
}

impl FaultScenario {
    pub const ALL: [FaultScenario; 6] = [
        FaultScenario::CpuSaturation,
        FaultScenario::MemoryLeak,
        FaultScenario::DiskExhaustion,
        FaultScenario::ServiceCrash,
        FaultScenario::ErrorStorm,
        FaultScenario::LatencySpike,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FaultScenario::CpuSaturation => "cpu-saturation",
            FaultScenario::MemoryLeak => "memory-leak",
            FaultScenario::DiskExhaustion => "disk-exhaustion",
            FaultScenario::ServiceCrash => "service-crash",
            FaultScenario::ErrorStorm => "error-storm",
            FaultScenario::LatencySpike => "latency-spike",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|f| f.as_str() == s)
    }
}

impl std::fmt::Display for FaultScenario {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
