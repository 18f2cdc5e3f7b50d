//! Health aggregation and the supervisory probe loop.
//!
//! Broker-probe failure and device silence are independent signals: a failed
//! probe with recent device traffic points at an outbound-only network issue
//! from the probing process, not a fleet-wide outage. The aggregator folds
//! both signals plus the registry state into one three-way verdict; the
//! external monitoring surface maps Healthy/Degraded/Unhealthy onto
//! 200/207/503.

use crate::broker::{BrokerConfig, BrokerRegistry};
use crate::device::DeviceDirectory;
use crate::error::GatewayResult;
use crate::probe::{probe, ConnectivityVerdict};
use chrono::{Duration as ChronoDuration, Utc};
use serde::Serialize;
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

/// Aggregated health facts polled by the external health-check layer.
#[derive(Debug, Clone, Serialize)]
pub struct HealthReport {
    pub status: HealthStatus,
    pub last_verdict: Option<ConnectivityVerdict>,
    pub recent_device_activity_count: u32,
    pub consecutive_probe_failures: u32,
}

#[derive(Default)]
struct ProbeState {
    last_verdict: Option<ConnectivityVerdict>,
    consecutive_failures: u32,
}

pub struct HealthAggregator {
    registry: BrokerRegistry,
    devices: DeviceDirectory,
    activity_window_secs: u64,
    state: RwLock<ProbeState>,
}

impl HealthAggregator {
    pub fn new(
        registry: BrokerRegistry,
        devices: DeviceDirectory,
        activity_window_secs: u64,
    ) -> Self {
        Self {
            registry,
            devices,
            activity_window_secs,
            state: RwLock::new(ProbeState::default()),
        }
    }

    /// The registry's currently active broker, exposed for the supervisor.
    pub fn active_broker(&self) -> GatewayResult<Option<BrokerConfig>> {
        self.registry.get_active()
    }

    /// Fold a fresh probe verdict into the retained state.
    pub fn record_verdict(&self, verdict: ConnectivityVerdict) {
        let mut state = self
            .state
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if verdict.success {
            state.consecutive_failures = 0;
        } else {
            state.consecutive_failures = state.consecutive_failures.saturating_add(1);
        }
        state.last_verdict = Some(verdict);
    }

    /// Current health verdict. Never blocks on the network: it reads the last
    /// retained probe verdict, one registry lookup and one activity count.
    pub fn current_health(&self) -> HealthReport {
        let cutoff = Utc::now() - ChronoDuration::seconds(self.activity_window_secs as i64);
        let activity = self.devices.active_since(cutoff).unwrap_or_else(|e| {
            warn!(error = %e, "device activity count failed, assuming none");
            0
        });

        let has_active_broker = match self.registry.get_active() {
            Ok(broker) => broker.is_some(),
            Err(e) => {
                warn!(error = %e, "broker registry lookup failed");
                false
            }
        };

        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        let probe_succeeded = state
            .last_verdict
            .as_ref()
            .map(|v| v.success)
            .unwrap_or(false);

        let status = if probe_succeeded {
            HealthStatus::Healthy
        } else if !has_active_broker && activity == 0 {
            HealthStatus::Unhealthy
        } else {
            HealthStatus::Degraded
        };

        HealthReport {
            status,
            last_verdict: state.last_verdict.clone(),
            recent_device_activity_count: activity,
            consecutive_probe_failures: state.consecutive_failures,
        }
    }
}

/// Supervisory loop: probe the active broker on a fixed cadence and feed the
/// verdicts into the aggregator. Runs independently of request-serving paths,
/// so a slow or hung probe never delays authorization or issuance. A failed
/// cycle waits for the next tick rather than retrying immediately.
pub async fn run_probe_supervisor(
    aggregator: Arc<HealthAggregator>,
    interval: Duration,
    timeout: Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    info!(
        interval_secs = interval.as_secs(),
        timeout_secs = timeout.as_secs(),
        "probe supervisor started"
    );

    loop {
        ticker.tick().await;

        match aggregator.active_broker() {
            Ok(Some(config)) => {
                let verdict = probe(&config, timeout).await;
                if verdict.success {
                    debug!(host = %config.host, latency_ms = verdict.latency_ms, "broker reachable");
                } else {
                    warn!(
                        host = %config.host,
                        error = %verdict.error.as_ref().map(|e| e.to_string()).unwrap_or_default(),
                        "broker probe failed"
                    );
                }
                aggregator.record_verdict(verdict);
            }
            Ok(None) => debug!("no active broker configured, skipping probe"),
            Err(e) => warn!(error = %e, "could not read active broker"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::BrokerConfig;
    use crate::device::DeviceIdentity;
    use crate::probe::ProbeFailure;
    use crate::store::Db;

    fn fixture() -> (Arc<HealthAggregator>, BrokerRegistry, DeviceDirectory) {
        let db = Db::open_in_memory().unwrap();
        let registry = BrokerRegistry::new(db.clone());
        let devices = DeviceDirectory::new(db);
        let aggregator = Arc::new(HealthAggregator::new(
            registry.clone(),
            devices.clone(),
            300,
        ));
        (aggregator, registry, devices)
    }

    fn verdict(success: bool) -> ConnectivityVerdict {
        ConnectivityVerdict {
            attempted_at: Utc::now(),
            success,
            latency_ms: 12,
            error: if success {
                None
            } else {
                Some(ProbeFailure::ConnectionRefused)
            },
        }
    }

    fn broker() -> BrokerConfig {
        BrokerConfig {
            name: "site".to_string(),
            host: "broker.example.org".to_string(),
            port: 1883,
            username: None,
            password: None,
            use_tls: false,
        }
    }

    #[test]
    fn test_successful_probe_is_healthy() {
        let (aggregator, registry, _devices) = fixture();
        registry.set_active(&broker()).unwrap();
        aggregator.record_verdict(verdict(true));

        let report = aggregator.current_health();
        assert_eq!(report.status, HealthStatus::Healthy);
        assert_eq!(report.consecutive_probe_failures, 0);
    }

    #[test]
    fn test_no_broker_and_silent_fleet_is_unhealthy() {
        let (aggregator, _registry, _devices) = fixture();
        let report = aggregator.current_health();
        assert_eq!(report.status, HealthStatus::Unhealthy);
        assert!(report.last_verdict.is_none());
        assert_eq!(report.recent_device_activity_count, 0);
    }

    #[test]
    fn test_failed_probe_with_device_activity_is_degraded() {
        let (aggregator, registry, devices) = fixture();
        registry.set_active(&broker()).unwrap();
        devices
            .upsert(&DeviceIdentity::new("demo-3em-001").unwrap())
            .unwrap();
        devices.record_heartbeat("demo-3em-001", Utc::now()).unwrap();

        aggregator.record_verdict(verdict(false));
        let report = aggregator.current_health();
        assert_eq!(report.status, HealthStatus::Degraded);
        assert_eq!(report.recent_device_activity_count, 1);
    }

    #[test]
    fn test_no_broker_but_recent_activity_is_degraded() {
        let (aggregator, _registry, devices) = fixture();
        devices
            .upsert(&DeviceIdentity::new("demo-3em-001").unwrap())
            .unwrap();
        devices.record_heartbeat("demo-3em-001", Utc::now()).unwrap();

        let report = aggregator.current_health();
        assert_eq!(report.status, HealthStatus::Degraded);
    }

    #[test]
    fn test_failure_streak_counts_and_resets() {
        let (aggregator, registry, _devices) = fixture();
        registry.set_active(&broker()).unwrap();

        aggregator.record_verdict(verdict(false));
        aggregator.record_verdict(verdict(false));
        aggregator.record_verdict(verdict(false));
        assert_eq!(aggregator.current_health().consecutive_probe_failures, 3);

        aggregator.record_verdict(verdict(true));
        let report = aggregator.current_health();
        assert_eq!(report.consecutive_probe_failures, 0);
        assert_eq!(report.status, HealthStatus::Healthy);
    }
}
