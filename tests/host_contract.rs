use pixel_pulse::host::contract::{
    CommandEnvelope, CommandName, ContractErrorKind, EVENT_VERSION, EventEnvelope, InboundFrame,
    ResponseEnvelope,
};
use serde_json::json;

#[test]
fn every_command_name_survives_its_wire_form() {
    for command in CommandName::ALL {
        assert_eq!(CommandName::parse(command.as_str()), Some(command));
        let wire = serde_json::to_value(command).expect("serialize command name");
        assert_eq!(wire, json!(command.as_str()));
    }
    assert!(CommandName::parse("runtime.not_real").is_none());
}

#[test]
fn command_payload_defaults_to_null() {
    let frame = InboundFrame::parse(r#"{"v":1,"request_id":"r","command":"host.ping"}"#)
        .expect("parse command");
    let InboundFrame::Command(envelope) = frame else {
        panic!("expected a command frame");
    };
    assert_eq!(envelope.payload, serde_json::Value::Null);
    assert!(envelope.validate().is_ok());
}

#[test]
fn command_with_future_version_fails_validation() {
    let mut envelope = CommandEnvelope::new("r", CommandName::HostPing, json!({}));
    envelope.v = EVENT_VERSION + 1;
    let err = envelope.validate().expect_err("unsupported version");
    assert_eq!(err.kind, ContractErrorKind::UnsupportedVersion);
}

#[test]
fn reply_without_ok_flag_is_malformed() {
    let err = InboundFrame::parse(r#"{"v":1,"call_id":"c1","payload":{}}"#)
        .expect_err("missing ok");
    assert_eq!(err.kind, ContractErrorKind::Malformed);
}

#[test]
fn response_and_event_wire_shapes() {
    let response = serde_json::to_value(ResponseEnvelope::error("r9", "rule not found"))
        .expect("serialize response");
    assert_eq!(
        response,
        json!({"v": 1, "request_id": "r9", "ok": false, "payload": null, "error": "rule not found"})
    );

    let event = serde_json::to_value(EventEnvelope::new(
        "e1",
        "status.changed",
        json!({"state": "inactive", "reason": "paused"}),
    ))
    .expect("serialize event");
    assert_eq!(event["v"], EVENT_VERSION);
    assert_eq!(event["event_id"], "e1");
    assert_eq!(event["event"], "status.changed");
    assert_eq!(event["payload"]["reason"], "paused");
}
