//! Link health checks and optical link recovery
//!
//! A local link is good when the Aurora lane is up and the remote PCIe root
//! complex has initialised. When it is not, the unit is asked to bounce its
//! optical transmitters (TX_DISABLE on then off, on each optical port) until
//! it reappears in the host connection table or the attempt budget runs out.

use crate::backend::{Connector, Key, LinkRegistry, RemoteDevice};
use crate::config::Timings;
use crate::error::Result;
use crate::types::{LinkState, RemotePort};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Why a link stayed down
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DownReason {
    /// The unit has no TX_DISABLE control
    OldFirmware,
    /// The unit could not be reached to reset it
    Unreachable { message: String },
    /// The unit never reappeared in the connection table
    RetriesExhausted { attempts: u32 },
    /// The unit reconnected but the root complex is still not initialised
    NotInitialized,
}

impl fmt::Display for DownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DownReason::OldFirmware => write!(f, "old firmware"),
            DownReason::Unreachable { message } => write!(f, "no route to host ({})", message),
            DownReason::RetriesExhausted { attempts } => {
                write!(f, "still down after {} reset attempts", attempts)
            }
            DownReason::NotInitialized => write!(f, "root complex not initialised"),
        }
    }
}

/// Result of one link check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "health", rename_all = "snake_case")]
pub enum LinkHealth {
    /// Good on first read; no reset issued
    Healthy,
    /// Good after a reset
    Repaired,
    Down(DownReason),
}

impl LinkHealth {
    pub fn is_up(&self) -> bool {
        !matches!(self, LinkHealth::Down(_))
    }
}

impl fmt::Display for LinkHealth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkHealth::Healthy => write!(f, "Link Good"),
            LinkHealth::Repaired => write!(f, "Link Fixed"),
            LinkHealth::Down(reason) => write!(f, "Link down: {}", reason),
        }
    }
}

/// Result of the reset protocol
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ResetOutcome {
    /// The unit reappeared in the connection table
    Reconnected { attempts: u32 },
    OldFirmware,
    Unreachable { message: String },
    Exhausted { attempts: u32 },
}

impl ResetOutcome {
    fn down_reason(&self) -> Option<DownReason> {
        match self {
            ResetOutcome::Reconnected { .. } => None,
            ResetOutcome::OldFirmware => Some(DownReason::OldFirmware),
            ResetOutcome::Unreachable { message } => Some(DownReason::Unreachable {
                message: message.clone(),
            }),
            ResetOutcome::Exhausted { attempts } => Some(DownReason::RetriesExhausted {
                attempts: *attempts,
            }),
        }
    }
}

/// One checked link in an audit
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub unit: String,
    pub port: RemotePort,
    pub link: u32,
    #[serde(flatten)]
    pub health: LinkHealth,
}

impl fmt::Display for AuditEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[{}:{} -> afhba.{}] {}",
            self.unit, self.port, self.link, self.health
        )
    }
}

/// A reset issued for a requested unit missing from the connection table
#[derive(Debug, Clone, Serialize)]
pub struct ResetEntry {
    pub unit: String,
    #[serde(flatten)]
    pub outcome: ResetOutcome,
}

/// Result of a full audit pass
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditReport {
    pub resets: Vec<ResetEntry>,
    pub links: Vec<AuditEntry>,
}

impl AuditReport {
    /// True when every audited link is up and every reset reconnected
    pub fn all_up(&self) -> bool {
        self.links.iter().all(|e| e.health.is_up())
            && self
                .resets
                .iter()
                .all(|r| matches!(r.outcome, ResetOutcome::Reconnected { .. }))
    }
}

/// Checks and repairs local links
#[derive(Clone)]
pub struct LinkHealthMonitor {
    registry: Arc<dyn LinkRegistry>,
    attempts: u32,
    settle: Duration,
}

impl LinkHealthMonitor {
    pub fn new(registry: Arc<dyn LinkRegistry>, timings: &Timings) -> Self {
        Self {
            registry,
            attempts: timings.reset_attempts,
            settle: timings.toggle_settle(),
        }
    }

    /// Check one link, resetting the unit if it is not good
    pub fn check(
        &self,
        unit: &str,
        device: &dyn RemoteDevice,
        link: u32,
        port: RemotePort,
    ) -> LinkHealth {
        self.check_with(unit, link, port, || self.reset(unit, device))
    }

    fn check_with(
        &self,
        unit: &str,
        link: u32,
        port: RemotePort,
        reset: impl FnOnce() -> ResetOutcome,
    ) -> LinkHealth {
        if self.read_state(link).is_good() {
            tracing::info!("[{}:{} -> afhba.{}] Link Good", unit, port, link);
            return LinkHealth::Healthy;
        }

        let outcome = reset();
        if self.read_state(link).root_complex_init {
            tracing::info!("[{}:{} -> afhba.{}] Link Fixed", unit, port, link);
            return LinkHealth::Repaired;
        }

        let reason = outcome.down_reason().unwrap_or(DownReason::NotInitialized);
        tracing::warn!("[{}:{} -> afhba.{}] Link down: {}", unit, port, link, reason);
        LinkHealth::Down(reason)
    }

    /// Unreadable lane flags count as down
    fn read_state(&self, link: u32) -> LinkState {
        match self.registry.link_state(link) {
            Ok(state) => state,
            Err(e) => {
                tracing::debug!("afhba.{}: {}", link, e);
                LinkState::default()
            }
        }
    }

    /// Bounce the unit's optical transmitters until it reconnects
    pub fn reset(&self, unit: &str, device: &dyn RemoteDevice) -> ResetOutcome {
        tracing::info!("[{}] Resetting Link", unit);

        if let Err(e) = device.get(&Key::TxDisable(RemotePort::A)) {
            if e.is_unknown_key() {
                tracing::warn!("[{}] Warning old firmware", unit);
                return ResetOutcome::OldFirmware;
            }
            tracing::warn!("[{}] No route to host: {}", unit, e);
            return ResetOutcome::Unreachable {
                message: e.to_string(),
            };
        }

        for attempt in 1..=self.attempts {
            for port in RemotePort::OPTICAL {
                for value in ["1", "0"] {
                    if let Err(e) = device.set(&Key::TxDisable(port), value) {
                        tracing::debug!("[{}] TX_DISABLE {}={} failed: {}", unit, port, value, e);
                    }
                    std::thread::sleep(self.settle);
                }
            }

            if self.is_connected(unit) {
                tracing::info!("[{}] Link connected after {} attempt(s)", unit, attempt);
                return ResetOutcome::Reconnected { attempts: attempt };
            }
            tracing::debug!("[{}] reset attempt {} did not reconnect", unit, attempt);
        }

        tracing::warn!("[{}] Link down", unit);
        ResetOutcome::Exhausted {
            attempts: self.attempts,
        }
    }

    fn is_connected(&self, unit: &str) -> bool {
        match self.registry.list_connections() {
            Ok(conns) => conns.iter().any(|c| c.unit == unit),
            Err(e) => {
                tracing::debug!("Connection table unreadable: {}", e);
                false
            }
        }
    }

    /// Check every known connection once, optionally only for named units
    ///
    /// Named units missing from the connection table get a reset first, so
    /// a unit whose link dropped entirely can come back and be checked.
    pub fn audit(&self, connector: &dyn Connector, units: &[String]) -> Result<AuditReport> {
        let mut report = AuditReport::default();
        let mut devices: HashMap<String, std::result::Result<Arc<dyn RemoteDevice>, String>> =
            HashMap::new();
        let mut device_for = |name: &str| {
            devices
                .entry(name.to_string())
                .or_insert_with(|| connector.connect(name).map_err(|e| e.to_string()))
                .clone()
        };

        let present: BTreeSet<String> = self
            .registry
            .list_connections()?
            .into_iter()
            .map(|c| c.unit)
            .collect();

        for unit in units.iter().filter(|u| !present.contains(*u)) {
            let outcome = match device_for(unit) {
                Ok(device) => self.reset(unit, device.as_ref()),
                Err(message) => {
                    tracing::warn!("[{}] No route to host", unit);
                    ResetOutcome::Unreachable { message }
                }
            };
            report.resets.push(ResetEntry {
                unit: unit.clone(),
                outcome,
            });
        }

        for conn in self.registry.list_connections()? {
            if !units.is_empty() && !units.contains(&conn.unit) {
                continue;
            }
            let health = match device_for(&conn.unit) {
                Ok(device) => self.check(&conn.unit, device.as_ref(), conn.link, conn.port),
                Err(message) => {
                    self.check_with(&conn.unit, conn.link, conn.port, || {
                        ResetOutcome::Unreachable { message }
                    })
                }
            };
            report.links.push(AuditEntry {
                unit: conn.unit,
                port: conn.port,
                link: conn.link,
                health,
            });
        }

        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::mock::{MockConnector, MockDevice, MockRegistry};

    fn monitor(registry: Arc<MockRegistry>) -> LinkHealthMonitor {
        LinkHealthMonitor::new(registry, &Timings::fast())
    }

    #[test]
    fn test_healthy_link_gets_no_toggles() {
        let registry = Arc::new(MockRegistry::default());
        registry.connect("acq2106_007", RemotePort::A, 0);
        let device = MockDevice::new("acq2106_007");

        let health = monitor(registry).check("acq2106_007", &device, 0, RemotePort::A);
        assert_eq!(health, LinkHealth::Healthy);
        assert!(device.writes().is_empty());
    }

    #[test]
    fn test_repaired_when_reset_brings_lane_back() {
        let registry = Arc::new(MockRegistry::default());
        registry.connect("acq2106_007", RemotePort::A, 0);
        registry.set_link_state(0, false, false);

        let device = MockDevice::new("acq2106_007");
        let reg = registry.clone();
        device.on_set(move |key, value| {
            if *key == Key::TxDisable(RemotePort::B) && value == "0" {
                reg.set_link_state(0, true, true);
            }
        });

        let health = monitor(registry).check("acq2106_007", &device, 0, RemotePort::A);
        assert_eq!(health, LinkHealth::Repaired);
        assert_eq!(device.write_count(&Key::TxDisable(RemotePort::A)), 2);
    }

    #[test]
    fn test_always_down_exhausts_five_attempts() {
        let registry = Arc::new(MockRegistry::default());
        registry.connect("acq2106_007", RemotePort::A, 0);
        registry.hide_unit("acq2106_007");
        registry.set_link_state(0, false, false);
        let device = MockDevice::new("acq2106_007");

        let monitor = monitor(registry.clone());
        let outcome = monitor.reset("acq2106_007", &device);
        assert_eq!(outcome, ResetOutcome::Exhausted { attempts: 5 });
        assert_eq!(registry.enumerations(), 5);
        // Each attempt is on+off on both optical ports
        assert_eq!(device.writes().len(), 20);

        let health = monitor.check("acq2106_007", &device, 0, RemotePort::A);
        assert_eq!(
            health,
            LinkHealth::Down(DownReason::RetriesExhausted { attempts: 5 })
        );
    }

    #[test]
    fn test_old_firmware_aborts_without_retry() {
        let registry = Arc::new(MockRegistry::default());
        registry.set_link_state(0, false, false);
        let device = MockDevice::new("acq2106_007").without_tx_disable();

        let health = monitor(registry.clone()).check("acq2106_007", &device, 0, RemotePort::A);
        assert_eq!(health, LinkHealth::Down(DownReason::OldFirmware));
        assert_eq!(registry.enumerations(), 0);
        assert!(device.writes().is_empty());
    }

    #[test]
    fn test_reconnected_but_not_initialised() {
        let registry = Arc::new(MockRegistry::default());
        registry.connect("acq2106_007", RemotePort::A, 0);
        registry.set_link_state(0, true, false);
        let device = MockDevice::new("acq2106_007");

        let health = monitor(registry).check("acq2106_007", &device, 0, RemotePort::A);
        assert_eq!(health, LinkHealth::Down(DownReason::NotInitialized));
    }

    #[test]
    fn test_audit_checks_each_link_once() {
        let registry = Arc::new(MockRegistry::default());
        registry.connect("acq2106_007", RemotePort::A, 0);
        registry.connect("acq2106_007", RemotePort::B, 1);
        registry.connect("acq2106_008", RemotePort::A, 2);

        let connector = MockConnector::new();
        connector.add(Arc::new(MockDevice::new("acq2106_007")));
        connector.add(Arc::new(MockDevice::new("acq2106_008")));

        let monitor = monitor(registry);
        let all = monitor.audit(&connector, &[]).unwrap();
        assert_eq!(all.links.len(), 3);
        assert!(all.all_up());

        let filtered = monitor
            .audit(&connector, &["acq2106_008".to_string()])
            .unwrap();
        assert_eq!(filtered.links.len(), 1);
        assert_eq!(filtered.links[0].link, 2);
        assert!(filtered.resets.is_empty());
    }

    #[test]
    fn test_audit_resets_missing_unit() {
        let registry = Arc::new(MockRegistry::default());
        registry.connect("acq2106_009", RemotePort::A, 4);
        registry.hide_unit("acq2106_009");

        let device = Arc::new(MockDevice::new("acq2106_009"));
        let reg = registry.clone();
        device.on_set(move |_, value| {
            if value == "0" {
                reg.restore_unit("acq2106_009");
            }
        });
        let connector = MockConnector::new();
        connector.add(device);

        let report = monitor(registry)
            .audit(&connector, &["acq2106_009".to_string()])
            .unwrap();
        assert_eq!(report.resets.len(), 1);
        assert_eq!(
            report.resets[0].outcome,
            ResetOutcome::Reconnected { attempts: 1 }
        );
        assert_eq!(report.links.len(), 1);
        assert_eq!(report.links[0].health, LinkHealth::Healthy);
    }

    #[test]
    fn test_audit_unreachable_unit_with_bad_link() {
        let registry = Arc::new(MockRegistry::default());
        registry.connect("acq2106_010", RemotePort::A, 0);
        registry.set_link_state(0, false, false);

        let report = monitor(registry)
            .audit(&MockConnector::new(), &[])
            .unwrap();
        assert!(matches!(
            report.links[0].health,
            LinkHealth::Down(DownReason::Unreachable { .. })
        ));
        assert!(!report.all_up());
    }

    #[test]
    fn test_audit_entry_json() {
        let entry = AuditEntry {
            unit: "acq2106_007".to_string(),
            port: RemotePort::A,
            link: 0,
            health: LinkHealth::Down(DownReason::RetriesExhausted { attempts: 5 }),
        };
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["health"], "down");
        assert_eq!(json["reason"], "retries_exhausted");
        assert_eq!(json["attempts"], 5);
    }
}
