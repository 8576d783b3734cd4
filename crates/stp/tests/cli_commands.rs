#![cfg(feature = "cli")]

use std::net::TcpListener;
use std::process::{Command, Output, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use serde_json::{json, Value};
use stp_runtime::testing::{FakeBrowser, Reply};

fn stp(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_stp"))
        .env_remove("STP_ADDR")
        .args(["--log-level", "error", "--format", "json"])
        .args(args)
        .output()
        .expect("stp should run")
}

fn json_lines(output: &Output) -> Vec<Value> {
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("stdout line should be json"))
        .collect()
}

fn closed_port_addr() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").expect("ephemeral bind should work");
    let addr = listener.local_addr().expect("listener should have an address");
    drop(listener);
    addr.to_string()
}

#[test]
fn info_prints_negotiated_services() {
    let browser = FakeBrowser::builder()
        .service("exec", "2.2")
        .service("window-manager", "2.0")
        .spawn()
        .expect("fake browser should start");
    let addr = browser.addr().to_string();

    let output = stp(&["info", "--addr", &addr]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let lines = json_lines(&output);
    assert_eq!(lines.len(), 1);
    let info = &lines[0];
    assert_eq!(info["user_agent"], "FakeBrowser/1.0");
    assert_eq!(info["state"], "ready");

    let services = info["services"].as_array().expect("services should be a list");
    assert!(services.contains(&json!({"name": "exec", "version": "2.2.0"})));
    assert!(services.contains(&json!({"name": "window-manager", "version": "2.0.0"})));

    let capabilities = info["capabilities"]
        .as_array()
        .expect("capabilities should be a list");
    assert!(capabilities.contains(&json!("mouse-repeat-count")));
    assert!(capabilities.contains(&json!("window-scoped-close-page")));
    assert!(info["browser"].is_null());
}

#[test]
fn info_fetches_browser_information_when_core_supports_it() {
    let browser = FakeBrowser::builder()
        .service("core", "1.2")
        .respond(|frame| match (frame.service.as_str(), frame.command_id) {
            ("core", 10) => Reply::json(&json!({
                "core_version": "2.12.388",
                "product": "desktop",
                "process_id": 4242
            })),
            _ => Reply::empty(),
        })
        .spawn()
        .expect("fake browser should start");
    let addr = browser.addr().to_string();

    let output = stp(&["info", "--addr", &addr]);
    assert!(output.status.success());

    let info = &json_lines(&output)[0];
    assert_eq!(info["browser"]["product"], "desktop");
    assert_eq!(info["browser"]["process_id"], 4242);
}

#[test]
fn info_requesting_missing_service_fails_handshake() {
    let browser = FakeBrowser::builder()
        .service("exec", "2.2")
        .spawn()
        .expect("fake browser should start");
    let addr = browser.addr().to_string();

    let output = stp(&["info", "--addr", &addr, "--service", "ecmascript-debugger"]);
    assert_eq!(output.status.code(), Some(4));
    assert!(String::from_utf8_lossy(&output.stderr).contains("handshake failed"));
}

#[test]
fn info_timeout_returns_124() {
    let addr = closed_port_addr();
    let output = stp(&["info", "--addr", &addr, "--timeout", "300ms"]);
    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn call_prints_response_payload() {
    let browser = FakeBrowser::builder()
        .service("prefs", "1.0")
        .respond(|frame| match frame.command_id {
            1 => Reply::json(&json!({"value": "en"})),
            _ => Reply::Error("unknown command".into()),
        })
        .spawn()
        .expect("fake browser should start");
    let addr = browser.addr().to_string();

    let output = stp(&[
        "call",
        "--addr",
        &addr,
        "prefs",
        "1",
        "--json",
        r#"{"section":"User Prefs","key":"Language"}"#,
    ]);
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let response = &json_lines(&output)[0];
    assert_eq!(response["kind"], "response");
    assert_eq!(response["service"], "prefs");
    assert_eq!(response["command_id"], 1);
    assert_eq!(response["payload"], json!({"value": "en"}));

    let sent = browser.commands("prefs");
    assert_eq!(sent.len(), 1);
    let body: Value = serde_json::from_slice(&sent[0].payload).expect("request should be json");
    assert_eq!(body["key"], "Language");
}

#[test]
fn call_remote_error_exits_with_remote_code() {
    let browser = FakeBrowser::builder()
        .service("prefs", "1.0")
        .respond(|_| Reply::Error("no such preference".into()))
        .spawn()
        .expect("fake browser should start");
    let addr = browser.addr().to_string();

    let output = stp(&["call", "--addr", &addr, "prefs", "1"]);
    assert_eq!(output.status.code(), Some(5));
    assert!(String::from_utf8_lossy(&output.stderr).contains("no such preference"));
}

#[test]
fn call_timeout_returns_124() {
    let browser = FakeBrowser::builder()
        .service("exec", "2.2")
        .respond(|_| Reply::Ignore)
        .spawn()
        .expect("fake browser should start");
    let addr = browser.addr().to_string();

    let output = stp(&["call", "--addr", &addr, "exec", "1", "--call-timeout", "200ms"]);
    assert_eq!(output.status.code(), Some(124));
}

#[test]
fn events_prints_until_count_reached() {
    let browser = FakeBrowser::builder()
        .service("window-manager", "2.0")
        .spawn()
        .expect("fake browser should start");
    let addr = browser.addr().to_string();

    let mut child = Command::new(env!("CARGO_BIN_EXE_stp"))
        .env_remove("STP_ADDR")
        .args(["--log-level", "error", "--format", "json"])
        .args(["events", "--addr", &addr, "--subscribe", "window-manager", "--count", "2"])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("events command should start");

    // Events sent before the subscription is in place are dropped, so keep
    // pushing until the command has printed enough and exits.
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut pushed = 0u32;
    loop {
        if child.try_wait().expect("child status").is_some() {
            break;
        }
        assert!(Instant::now() < deadline, "events command did not exit");
        let _ = browser.push_event("window-manager", 5, r#"{"window_id":7}"#);
        pushed += 1;
        thread::sleep(Duration::from_millis(25));
    }
    assert!(pushed >= 2);

    let output = child.wait_with_output().expect("events output");
    assert!(output.status.success());

    let lines = json_lines(&output);
    assert_eq!(lines.len(), 2);
    for line in &lines {
        assert_eq!(line["kind"], "event");
        assert_eq!(line["service"], "window-manager");
        assert_eq!(line["event_id"], 5);
        assert_eq!(line["payload"], json!({"window_id": 7}));
    }
}

#[test]
fn events_for_unknown_service_is_rejected() {
    let browser = FakeBrowser::builder()
        .service("exec", "2.2")
        .spawn()
        .expect("fake browser should start");
    let addr = browser.addr().to_string();

    let output = stp(&["events", "--addr", &addr, "--subscribe", "window-manager"]);
    assert_eq!(output.status.code(), Some(69));
}

#[test]
fn version_json_lists_capabilities() {
    let output = stp(&["version"]);
    assert!(output.status.success());

    let version = &json_lines(&output)[0];
    assert_eq!(version["name"], "stp");
    assert_eq!(version["version"], env!("CARGO_PKG_VERSION"));
    let names: Vec<&str> = version["capabilities"]
        .as_array()
        .expect("capabilities should be a list")
        .iter()
        .filter_map(|c| c["name"].as_str())
        .collect();
    assert_eq!(
        names,
        vec!["mouse-repeat-count", "window-scoped-close-page", "browser-information"]
    );
}

#[test]
fn conflicting_payload_flags_are_rejected_by_parser() {
    let output = stp(&["call", "exec", "1", "--json", "{}", "--data", "x"]);
    assert_eq!(output.status.code(), Some(2));
}
