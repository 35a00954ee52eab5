use agrisobus::diagnostics::dtc::Fmi;
use agrisobus::diagnostics::{DiagnosticConfig, DiagnosticProtocol};
use agrisobus::fs::{FileAttributes, FileServer, FileServerConfig, OpenFlags};
use agrisobus::network::{ClaimState, Message, Name, NetworkManager};
use agrisobus::niu::{FilterRule, ForwardPolicy, NIUConfig, NetworkInterconnectUnit, RouteOutcome};
use agrisobus::physical::mock::MockDriver;
use agrisobus::safety::{EscalationAction, SafetyPolicyEngine, SafetyState};
use agrisobus::tecu::{facilities_for_classification, TECUClass, TECUClassification, TECUConfig, TractorECU};
use agrisobus::types::BROADCAST_ADDRESS;
use agrisobus::{Frame, Result};

#[test]
fn address_claim_settles_and_dispatches_to_subscribers() -> Result<()> {
    let mut nm = NetworkManager::new(MockDriver::new());
    let handle = nm.create_internal(Name::from(0x1122_3344_5566_7788u64), 0x20);
    nm.update(300);
    assert_eq!(nm.control_function(handle).state(), ClaimState::Claimed);
    assert_eq!(nm.control_function(handle).address(), 0x20);

    nm.send(0x1234, &[1, 2, 3], handle, BROADCAST_ADDRESS)?;
    nm.update(10);
    Ok(())
}

#[test]
fn dm1_reports_active_dtc_until_cleared() {
    let mut diag = DiagnosticProtocol::new(DiagnosticConfig::default());
    diag.set_active(110, Fmi::AboveNormal, vec![]);
    assert_eq!(diag.active_dtcs().len(), 1);
    let dm1 = diag.encode_dm1();
    assert!(!dm1.is_empty());

    assert!(diag.clear_active(110, Fmi::AboveNormal));
    assert!(diag.active_dtcs().is_empty());
    assert_eq!(diag.previously_active_dtcs().len(), 1);
}

#[test]
fn tecu_facilities_broadcast_crosses_the_niu_bridge() {
    let primary = TECUConfig::new().set_classification(TECUClassification {
        base_class: TECUClass::Class2,
        ..Default::default()
    });
    let mut tractor = TractorECU::new(primary);
    tractor.set_key_switch(true);

    let outcome = tractor.update(2_000);
    assert_eq!(outcome.outbound.len(), 1);
    let (pgn, payload) = &outcome.outbound[0];

    let mut niu = NetworkInterconnectUnit::new(NIUConfig::default());
    niu.start().unwrap();
    niu.add_filter(FilterRule::new(*pgn, ForwardPolicy::Allow, true));

    let frame = Frame::from_message(6, *pgn, 0x10, BROADCAST_ADDRESS, payload.clone());
    assert_eq!(niu.process_tractor_frame(&frame), RouteOutcome::Forwarded);
    assert_eq!(niu.forwarded(), 1);

    let facilities = facilities_for_classification(&tractor.classification());
    assert!(facilities.ground_based_distance);
}

#[test]
fn safety_engine_escalates_when_tecu_status_goes_stale() {
    let mut safety = SafetyPolicyEngine::new();
    let tecu_name = Name::from(0xAAu64);
    safety.require_freshness(tecu_name, 500, 200, EscalationAction::Immediate);

    safety.update(100);
    assert_eq!(safety.state(), SafetyState::Normal);

    safety.update(500);
    assert_eq!(safety.state(), SafetyState::Degraded);
    assert_eq!(safety.current_action(), Some(EscalationAction::Immediate));

    safety.update(300);
    assert_eq!(safety.state(), SafetyState::Emergency);
}

#[test]
fn file_server_open_write_read_round_trip() {
    use agrisobus::fs::FSFunction;

    let mut server = FileServer::new(FileServerConfig::default());
    server.add_file("LOG1", b"seed".to_vec(), FileAttributes::empty());

    let open = Message {
        pgn: agrisobus::fs::server::PGN_FILE_CLIENT_TO_SERVER,
        priority: 6,
        source: 0x30,
        destination: 0x10,
        payload: vec![FSFunction::OpenFile as u8, 1, 4, OpenFlags::READ_WRITE.bits(), b'L', b'O', b'G', b'1'],
        timestamp: 0,
    };
    let response = server.handle_message(&open).outbound.remove(0).1;
    assert_eq!(response[2], agrisobus::fs::FSError::Success as u8);
    let handle = response[3];

    let write = Message {
        payload: vec![FSFunction::WriteFile as u8, 2, handle, 3, b'x', b'y', b'z'],
        ..open.clone()
    };
    let write_response = server.handle_message(&write).outbound.remove(0).1;
    assert_eq!(write_response[2], agrisobus::fs::FSError::Success as u8);
}
