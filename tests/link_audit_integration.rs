//! Integration tests for the link audit
//!
//! These validate the check-links pass over a simulated host:
//! - Every connected link is checked once
//! - Units missing from the table are reset first
//! - The JSON report shape

mod common;

use common::builders::UnitSpec;
use common::mock_helpers::MockSystem;
use hts_multistream::backend::mock::MockConnector;
use hts_multistream::backend::Key;
use hts_multistream::config::Timings;
use hts_multistream::link::{DownReason, LinkHealth, LinkHealthMonitor, ResetOutcome};
use hts_multistream::types::RemotePort;
use std::sync::Arc;

fn system() -> MockSystem {
    MockSystem::new(&[
        UnitSpec::new("acq2106_001")
            .link(RemotePort::A, 0)
            .link(RemotePort::B, 1),
        UnitSpec::new("acq2106_002").link(RemotePort::A, 2),
    ])
}

fn monitor(system: &MockSystem) -> LinkHealthMonitor {
    LinkHealthMonitor::new(system.services.registry.clone(), &Timings::fast())
}

#[test]
fn test_healthy_host_audit() {
    let system = system();
    let report = monitor(&system)
        .audit(system.services.connector.as_ref(), &[])
        .unwrap();

    assert_eq!(report.links.len(), 3);
    assert!(report.all_up());
    assert!(report.resets.is_empty());
    for device in &system.devices {
        assert_eq!(device.write_count(&Key::TxDisable(RemotePort::A)), 0);
    }
}

#[test]
fn test_dead_link_is_reported_down() {
    let system = system();
    system.registry.set_link_state(1, false, false);

    let report = monitor(&system)
        .audit(system.services.connector.as_ref(), &[])
        .unwrap();

    assert!(!report.all_up());
    let dead = report.links.iter().find(|e| e.link == 1).unwrap();
    assert!(matches!(dead.health, LinkHealth::Down(DownReason::NotInitialized)));
    // Reset was attempted on the unit owning the dead link only
    assert!(system.device("acq2106_001").write_count(&Key::TxDisable(RemotePort::A)) > 0);
    assert_eq!(
        system.device("acq2106_002").write_count(&Key::TxDisable(RemotePort::A)),
        0
    );
}

#[test]
fn test_missing_unit_is_reset_and_rechecked() {
    let system = system();
    system.registry.hide_unit("acq2106_002");
    let registry = system.registry.clone();
    system.device("acq2106_002").on_set(move |key, value| {
        if *key == Key::TxDisable(RemotePort::B) && value == "0" {
            registry.restore_unit("acq2106_002");
        }
    });

    let report = monitor(&system)
        .audit(
            system.services.connector.as_ref(),
            &["acq2106_002".to_string()],
        )
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
fn test_old_firmware_unit() {
    let system = MockSystem::new(&[UnitSpec::new("acq2106_003").link(RemotePort::A, 0)]);
    system.registry.set_link_state(0, false, false);
    let connector = MockConnector::new();
    connector.add(Arc::new(
        UnitSpec::new("acq2106_003").device().without_tx_disable(),
    ));

    let report = monitor(&system).audit(&connector, &[]).unwrap();
    assert_eq!(
        report.links[0].health,
        LinkHealth::Down(DownReason::OldFirmware)
    );
}

#[test]
fn test_report_json() {
    let system = system();
    system.registry.set_link_state(2, false, false);
    let report = monitor(&system)
        .audit(system.services.connector.as_ref(), &[])
        .unwrap();

    let json = serde_json::to_value(&report).unwrap();
    let links = json["links"].as_array().unwrap();
    assert_eq!(links.len(), 3);
    assert_eq!(links[0]["unit"], "acq2106_001");
    assert_eq!(links[0]["port"], "A");
    assert_eq!(links[0]["health"], "healthy");
    assert_eq!(links[2]["health"], "down");
    assert_eq!(links[2]["reason"], "not_initialized");
}
