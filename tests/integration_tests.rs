/*
 * Integration tests for the YogaVPC client
 *
 * A fake daemon on a temporary Unix socket answers one request per
 * connection, so the tests cover the wire format end to end.
 */

use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixListener;
use std::path::PathBuf;
use std::thread::JoinHandle;

use serial_test::serial;
use vpc_protocol::{
    DriverStatus, ErrorKind, OutcomeKind, PropertyValue, Request, RequestEnvelope, Response,
    ResponseData, ResponseEnvelope, SetOutcome, ToggleInfo,
};
use yogavpc::{socket_path, ClientError, VpcClient, SOCKET_ENV};

/// Serve one request with `answer`, handing back the parsed request
fn fake_daemon<F>(answer: F) -> (tempfile::TempDir, PathBuf, JoinHandle<Request>)
where
    F: FnOnce(&RequestEnvelope) -> ResponseEnvelope + Send + 'static,
{
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("yogavpc.sock");
    let listener = UnixListener::bind(&path).unwrap();

    let handle = std::thread::spawn(move || {
        let (mut conn, _) = listener.accept().unwrap();
        let mut line = String::new();
        BufReader::new(conn.try_clone().unwrap()).read_line(&mut line).unwrap();
        let envelope: RequestEnvelope = serde_json::from_str(&line).unwrap();
        let reply = answer(&envelope);
        let mut out = serde_json::to_vec(&reply).unwrap();
        out.push(b'\n');
        conn.write_all(&out).unwrap();
        envelope.request
    });

    (dir, path, handle)
}

#[test]
fn test_set_property_round_trip() {
    let (_dir, path, daemon) = fake_daemon(|req| {
        ResponseEnvelope::new(
            req.id,
            Response::Ok(ResponseData::outcome(SetOutcome {
                result: OutcomeKind::AlreadySet,
                property: "ConservationMode".into(),
                value: Some(1),
            })),
        )
    });

    let mut client = VpcClient::connect(&path).unwrap();
    let data = client.set_property("ConservationMode", PropertyValue::Bool(true)).unwrap();
    let outcome = data.outcome.unwrap();
    assert_eq!(outcome.result, OutcomeKind::AlreadySet);
    assert_eq!(outcome.value, Some(1));

    match daemon.join().unwrap() {
        Request::SetProperty { name, value } => {
            assert_eq!(name, "ConservationMode");
            assert_eq!(value, PropertyValue::Bool(true));
        }
        other => panic!("unexpected request {:?}", other),
    }
}

#[test]
fn test_daemon_error_keeps_kind() {
    let (_dir, path, daemon) = fake_daemon(|req| {
        ResponseEnvelope::new(req.id, Response::error(ErrorKind::MethodMissing, "Method SFNL not found"))
    });

    let mut client = VpcClient::connect(&path).unwrap();
    match client.set_property("FnlockMode", PropertyValue::Bool(true)) {
        Err(ClientError::Daemon { kind, message }) => {
            assert_eq!(kind, ErrorKind::MethodMissing);
            assert!(message.contains("SFNL"));
        }
        other => panic!("unexpected result {:?}", other),
    }
    daemon.join().unwrap();
}

#[test]
fn test_status_payload() {
    let (_dir, path, daemon) = fake_daemon(|req| {
        ResponseEnvelope::new(
            req.id,
            Response::Ok(ResponseData::status(DriverStatus {
                platform: "generic".into(),
                power: "active".into(),
                registration: "notifier_armed".into(),
                aggregator_instance: None,
                toggles: vec![ToggleInfo {
                    property: "ClamshellMode".into(),
                    state: "valid".into(),
                    value: Some(0),
                    missing: false,
                }],
            })),
        )
    });

    let status = VpcClient::connect(&path).unwrap().status().unwrap();
    assert_eq!(status.registration, "notifier_armed");
    assert_eq!(status.toggles[0].value, Some(0));
    assert!(matches!(daemon.join().unwrap(), Request::Status));
}

#[test]
fn test_mismatched_response_id_is_rejected() {
    let (_dir, path, daemon) = fake_daemon(|req| ResponseEnvelope::new(req.id + 1000, Response::ok_string("pong")));

    let mut client = VpcClient::connect(&path).unwrap();
    assert!(matches!(client.ping(), Err(ClientError::IdMismatch { .. })));
    daemon.join().unwrap();
}

#[test]
fn test_invalid_request_never_leaves_the_client() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("yogavpc.sock");
    let _listener = UnixListener::bind(&path).unwrap();

    let mut client = VpcClient::connect(&path).unwrap();
    let result = client.set_property("Clamshell Mode", PropertyValue::Bool(true));
    assert!(matches!(result, Err(ClientError::InvalidRequest(_))));
}

#[test]
fn test_connect_failure_names_the_socket() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("absent.sock");
    match VpcClient::connect(&path) {
        Err(e @ ClientError::Connect { .. }) => assert!(e.to_string().contains("absent.sock")),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("connected to a missing socket"),
    }
}

#[test]
#[serial]
fn test_socket_path_env_override() {
    std::env::set_var(SOCKET_ENV, "/tmp/other-yogavpc.sock");
    assert_eq!(socket_path(), PathBuf::from("/tmp/other-yogavpc.sock"));
    std::env::remove_var(SOCKET_ENV);
    assert_eq!(socket_path(), PathBuf::from("/run/yogavpc.sock"));
}
