//! A fleet of services that report metrics and logs on every poll.
//!
//! Healthy services hold a steady per-service baseline so that nothing
//! trends; injected faults move the metrics the detector watches.

use std::collections::{BTreeMap, BTreeSet};

use anyhow::Result;
use chrono::{DateTime, Utc};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tokio::sync::Mutex;
use tracing::info;

use super::{FaultScenario, DEFAULT_SERVICES};
use crate::broker::ActionKind;
use crate::observe::{ObservationSource, RawEvent};

const SOURCE_TAG: &str = "sim";
/// Memory growth per poll while leaking.
const LEAK_STEP: f64 = 6.0;
/// ERROR lines emitted per poll during an error storm.
const STORM_LINES: usize = 6;

#[derive(Debug, Clone)]
struct Baseline {
    cpu: f64,
    memory: f64,
    disk: f64,
    error_count: f64,
    p99_latency_ms: f64,
}

#[derive(Debug)]
struct ServiceState {
    baseline: Baseline,
    memory: f64,
    replicas: u32,
    faults: BTreeSet<FaultScenario>,
}

struct FleetState {
    rng: StdRng,
    services: BTreeMap<String, ServiceState>,
    polls: u64,
}

/// What applying a remediation action did.
#[derive(Debug, Clone, PartialEq)]
pub struct ActionEffect {
    pub exit_status: i32,
    pub output: String,
}

impl ActionEffect {
    fn ok(output: String) -> Self {
        Self { exit_status: 0, output }
    }

    fn failed(output: String) -> Self {
        Self { exit_status: 1, output }
    }
}

pub struct SimulatedFleet {
    state: Mutex<FleetState>,
}

impl SimulatedFleet {
    pub fn new<S: AsRef<str>>(services: &[S], seed: u64) -> Self {
        let mut rng = StdRng::seed_from_u64(seed);
        let services = services
            .iter()
            .map(|name| {
                let baseline = Baseline {
                    cpu: rng.gen_range(20.0..45.0),
                    memory: rng.gen_range(30.0..50.0),
                    disk: rng.gen_range(40.0..60.0),
                    error_count: rng.gen_range(0u32..5) as f64,
                    p99_latency_ms: rng.gen_range(200.0..1500.0),
                };
                let state = ServiceState {
                    memory: baseline.memory,
                    baseline,
                    replicas: 2,
                    faults: BTreeSet::new(),
                };
                (name.as_ref().to_string(), state)
            })
            .collect();
        Self {
            state: Mutex::new(FleetState {
                rng,
                services,
                polls: 0,
            }),
        }
    }

    pub fn with_default_services(seed: u64) -> Self {
        Self::new(&DEFAULT_SERVICES, seed)
    }

    pub async fn services(&self) -> Vec<String> {
        self.state.lock().await.services.keys().cloned().collect()
    }

    /// Returns `false` when the service is unknown or already has the fault.
    pub async fn inject(&self, service: &str, fault: FaultScenario) -> bool {
        let mut state = self.state.lock().await;
        let Some(svc) = state.services.get_mut(service) else {
            return false;
        };
        let added = svc.faults.insert(fault);
        if added {
            info!(service, %fault, "fault injected");
        }
        added
    }

    /// Inject a fault the fleet does not have yet on a random service.
    pub async fn inject_random(&self) -> Option<(String, FaultScenario)> {
        let mut state = self.state.lock().await;
        let FleetState { rng, services, .. } = &mut *state;
        let candidates: Vec<(String, FaultScenario)> = services
            .iter()
            .flat_map(|(name, svc)| {
                FaultScenario::ALL
                    .into_iter()
                    .filter(|f| !svc.faults.contains(f))
                    .map(move |f| (name.clone(), f))
            })
            .collect();
        let (service, fault) = candidates.choose(rng)?.clone();
        if let Some(svc) = services.get_mut(&service) {
            svc.faults.insert(fault);
        }
        info!(service = %service, %fault, "fault injected");
        Some((service, fault))
    }

    pub async fn active_faults(&self) -> Vec<(String, FaultScenario)> {
        let state = self.state.lock().await;
        state
            .services
            .iter()
            .flat_map(|(name, svc)| svc.faults.iter().map(move |f| (name.clone(), *f)))
            .collect()
    }

    /// Apply a remediation action. `None` means the action is not something
    /// the simulation can carry out.
    pub async fn apply(&self, kind: ActionKind, parameters: &BTreeMap<String, String>) -> Option<ActionEffect> {
        let (service_param, cures): (&str, &[FaultScenario]) = match kind {
            ActionKind::RestartService => (
                "service",
                &[FaultScenario::ServiceCrash, FaultScenario::MemoryLeak, FaultScenario::ErrorStorm],
            ),
            ActionKind::ScaleResource => ("resource", &[FaultScenario::CpuSaturation]),
            ActionKind::ClearDisk => ("service", &[FaultScenario::DiskExhaustion]),
            ActionKind::ThrottleTraffic => ("target", &[FaultScenario::LatencySpike]),
            ActionKind::NoOp => return Some(ActionEffect::ok("nothing to do".into())),
            ActionKind::CustomCommand => return None,
        };

        let Some(service) = parameters.get(service_param) else {
            return Some(ActionEffect::failed(format!("{kind}: missing '{service_param}'")));
        };
        let mut state = self.state.lock().await;
        let Some(svc) = state.services.get_mut(service) else {
            return Some(ActionEffect::failed(format!("{kind}: no such service '{service}'")));
        };

        let cleared: Vec<FaultScenario> = cures.iter().copied().filter(|f| svc.faults.remove(f)).collect();
        let mut note = String::new();
        match kind {
            ActionKind::RestartService => svc.memory = svc.baseline.memory,
            ActionKind::ScaleResource => {
                if let Some(replicas) = parameters.get("replicas").and_then(|r| r.parse().ok()) {
                    svc.replicas = replicas;
                }
                note = format!(" (now {} replicas)", svc.replicas);
            }
            _ => {}
        }
        info!(service = %service, action = %kind, ?cleared, "simulated action applied");
        let cleared = if cleared.is_empty() {
            "nothing".to_string()
        } else {
            cleared.iter().map(FaultScenario::as_str).collect::<Vec<_>>().join(", ")
        };
        Some(ActionEffect::ok(format!("{kind} {service}: cleared {cleared}{note}")))
    }

    async fn sample(&self, now: DateTime<Utc>) -> Vec<RawEvent> {
        let mut state = self.state.lock().await;
        state.polls += 1;
        let poll = state.polls;
        let FleetState { rng, services, .. } = &mut *state;

        let mut events = Vec::new();
        for (name, svc) in services.iter_mut() {
            let faults = svc.faults.clone();
            let faulted = |f: FaultScenario| faults.contains(&f);
            let cpu = if faulted(FaultScenario::CpuSaturation) {
                rng.gen_range(92.0..99.0)
            } else {
                svc.baseline.cpu
            };
            if faulted(FaultScenario::MemoryLeak) {
                svc.memory = (svc.memory + LEAK_STEP).min(99.0);
            }
            let disk = if faulted(FaultScenario::DiskExhaustion) {
                rng.gen_range(95.0..99.5)
            } else {
                svc.baseline.disk
            };
            let error_count = if faulted(FaultScenario::ErrorStorm) {
                rng.gen_range(50u32..120) as f64
            } else {
                svc.baseline.error_count
            };
            let latency = if faulted(FaultScenario::LatencySpike) {
                rng.gen_range(5000.0..8000.0)
            } else {
                svc.baseline.p99_latency_ms
            };

            for (metric, value) in [
                ("cpu", cpu),
                ("memory", svc.memory),
                ("disk", disk),
                ("error_count", error_count),
                ("p99_latency_ms", latency),
            ] {
                events.push(RawEvent::Metric {
                    entity: name.clone(),
                    name: metric.to_string(),
                    value,
                    timestamp: now,
                    source: SOURCE_TAG.to_string(),
                });
            }

            if faulted(FaultScenario::ServiceCrash) {
                let exit_code = [1, 137, 139, 255][rng.gen_range(0usize..4)];
                events.push(log_event(
                    name,
                    format!("SERVICE_CRASH {name} has crashed unexpectedly (exit code {exit_code}, poll {poll})"),
                    now,
                ));
            }
            if faulted(FaultScenario::ErrorStorm) {
                for i in 0..STORM_LINES {
                    events.push(log_event(
                        name,
                        format!("ERROR DatabaseConnectionTimeout in {name} (poll {poll}, #{i})"),
                        now,
                    ));
                }
            }
        }
        events
    }
}

fn log_event(entity: &str, line: String, timestamp: DateTime<Utc>) -> RawEvent {
    RawEvent::Log {
        entity: entity.to_string(),
        line,
        timestamp,
        source: SOURCE_TAG.to_string(),
    }
}

#[async_trait::async_trait]
impl ObservationSource for SimulatedFleet {
    async fn poll(&self) -> Result<Vec<RawEvent>> {
        Ok(self.sample(Utc::now()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metric(events: &[RawEvent], entity: &str, metric: &str) -> Option<f64> {
        events.iter().find_map(|e| match e {
            RawEvent::Metric { entity: en, name, value, .. } if en == entity && name == metric => Some(*value),
            _ => None,
        })
    }

    fn logs(events: &[RawEvent], entity: &str) -> Vec<String> {
        events
            .iter()
            .filter_map(|e| match e {
                RawEvent::Log { entity: en, line, .. } if en == entity => Some(line.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_healthy_fleet_is_steady() {
        let fleet = SimulatedFleet::with_default_services(7);
        let a = fleet.poll().await.unwrap();
        let b = fleet.poll().await.unwrap();
        assert_eq!(a.len(), DEFAULT_SERVICES.len() * 5);
        for svc in DEFAULT_SERVICES {
            assert_eq!(metric(&a, svc, "cpu"), metric(&b, svc, "cpu"));
            assert!(metric(&a, svc, "cpu").unwrap() < 85.0);
            assert!(logs(&a, svc).is_empty());
        }
    }

    #[tokio::test]
    async fn test_same_seed_same_fleet() {
        let a = SimulatedFleet::with_default_services(42).sample(Utc::now()).await;
        let b = SimulatedFleet::with_default_services(42).sample(Utc::now()).await;
        assert_eq!(metric(&a, "cache", "memory"), metric(&b, "cache", "memory"));
    }

    #[tokio::test]
    async fn test_faults_move_metrics_and_restart_cures() {
        let fleet = SimulatedFleet::with_default_services(1);
        assert!(fleet.inject("web-api", FaultScenario::CpuSaturation).await);
        assert!(fleet.inject("web-api", FaultScenario::ServiceCrash).await);
        assert!(!fleet.inject("web-api", FaultScenario::ServiceCrash).await);
        assert!(!fleet.inject("nope", FaultScenario::ServiceCrash).await);

        let events = fleet.poll().await.unwrap();
        assert!(metric(&events, "web-api", "cpu").unwrap() > 90.0);
        assert!(logs(&events, "web-api")[0].contains("CRASH"));

        let params = BTreeMap::from([("service".to_string(), "web-api".to_string())]);
        let effect = fleet.apply(ActionKind::RestartService, &params).await.unwrap();
        assert_eq!(effect.exit_status, 0);
        assert_eq!(
            fleet.active_faults().await,
            vec![("web-api".to_string(), FaultScenario::CpuSaturation)]
        );

        let params = BTreeMap::from([
            ("resource".to_string(), "web-api".to_string()),
            ("replicas".to_string(), "4".to_string()),
        ]);
        fleet.apply(ActionKind::ScaleResource, &params).await.unwrap();
        assert!(fleet.active_faults().await.is_empty());
    }

    #[tokio::test]
    async fn test_memory_leak_grows_until_restart() {
        let fleet = SimulatedFleet::with_default_services(3);
        fleet.inject("cache", FaultScenario::MemoryLeak).await;
        let first = metric(&fleet.poll().await.unwrap(), "cache", "memory").unwrap();
        let second = metric(&fleet.poll().await.unwrap(), "cache", "memory").unwrap();
        assert!(second > first);

        let params = BTreeMap::from([("service".to_string(), "cache".to_string())]);
        fleet.apply(ActionKind::RestartService, &params).await.unwrap();
        let after = metric(&fleet.poll().await.unwrap(), "cache", "memory").unwrap();
        assert!(after < first);
    }

    #[tokio::test]
    async fn test_unknown_service_and_custom_command() {
        let fleet = SimulatedFleet::with_default_services(5);
        let params = BTreeMap::from([("service".to_string(), "ghost".to_string())]);
        let effect = fleet.apply(ActionKind::RestartService, &params).await.unwrap();
        assert_eq!(effect.exit_status, 1);
        assert!(fleet.apply(ActionKind::CustomCommand, &BTreeMap::new()).await.is_none());
    }

    #[tokio::test]
    async fn test_inject_random_picks_new_fault() {
        let fleet = SimulatedFleet::new(&["only"], 9);
        let mut seen = BTreeSet::new();
        for _ in 0..FaultScenario::ALL.len() {
            let (svc, fault) = fleet.inject_random().await.unwrap();
            assert_eq!(svc, "only");
            assert!(seen.insert(fault));
        }
        assert!(fleet.inject_random().await.is_none());
    }
}
