//! End-to-end tests of the subprocess assistant client against a fake
//! assistant shell script.

#![cfg(unix)]

use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

use taskpilot::adapters::assistant::{CliAssistantClient, CliAssistantConfig};
use taskpilot::domain::errors::EngineError;
use taskpilot::domain::ports::{AssistantClient, AssistantRequest};

/// Install a fake assistant: a shell script that records its arguments and
/// then runs `body`.
fn fake_assistant(dir: &Path, body: &str) -> PathBuf {
    let script = dir.join("assistant.sh");
    let contents = format!(
        "#!/bin/sh\nhere=\"$(cd \"$(dirname \"$0\")\" && pwd)\"\nprintf '%s\\n' \"$@\" > \"$here/args.txt\"\n{body}\n"
    );
    std::fs::write(&script, contents).unwrap();
    let mut perms = std::fs::metadata(&script).unwrap().permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(&script, perms).unwrap();
    script
}

fn recorded_args(dir: &Path) -> Vec<String> {
    std::fs::read_to_string(dir.join("args.txt"))
        .unwrap_or_default()
        .lines()
        .map(str::to_string)
        .collect()
}

fn client_for(script: &Path) -> CliAssistantClient {
    CliAssistantClient::new(CliAssistantConfig {
        command: script.to_string_lossy().into_owned(),
        idle_timeout: Duration::from_secs(10),
        drain_window: Duration::from_millis(500),
        ..Default::default()
    })
}

#[tokio::test]
async fn test_fresh_turn_extracts_session_and_usage() {
    let dir = TempDir::new().unwrap();
    let script = fake_assistant(
        dir.path(),
        r#"cat <<'EOF'
{"type":"system","subtype":"init","session_id":"sess-e2e"}
{"type":"assistant","text":"Working on it. "}
{"type":"assistant","text":"All set."}
{"type":"result","result":"Working on it. All set.","usage":{"output_tokens":42,"input_tokens":7},"total_cost_usd":0.01,"duration_ms":1200}
EOF"#,
    );

    let client = client_for(&script);
    let (outcome, events) = client
        .send(AssistantRequest::new("build the widget"))
        .await
        .unwrap();

    assert_eq!(outcome.session_id.as_deref(), Some("sess-e2e"));
    assert_eq!(outcome.full_text, "Working on it. All set.");
    assert_eq!(outcome.usage.output_tokens, 42);
    assert_eq!(outcome.usage.input_tokens, 7);
    assert_eq!(outcome.usage.duration_ms, 1200);
    assert!(outcome.subprocess_id.is_some());
    assert_eq!(events.len(), 4);

    let args = recorded_args(dir.path());
    assert_eq!(args[0], "-p");
    assert_eq!(args[1], "build the widget");
    assert!(args.contains(&"--output-format".to_string()));
    assert!(args.contains(&"stream-json".to_string()));
    assert!(args.contains(&"--verbose".to_string()));
    assert!(!args.contains(&"-r".to_string()));
}

#[tokio::test]
async fn test_resumed_turn_passes_session_id() {
    let dir = TempDir::new().unwrap();
    let script = fake_assistant(
        dir.path(),
        r#"printf '%s\n' '{"type":"assistant","text":"Continuing."}'"#,
    );

    let client = client_for(&script);
    let (outcome, _) = client
        .send(AssistantRequest::new("keep going").resuming("sess-42"))
        .await
        .unwrap();

    // Resumed calls never report a new session id.
    assert!(outcome.session_id.is_none());
    assert_eq!(outcome.full_text, "Continuing.");

    let args = recorded_args(dir.path());
    assert_eq!(args[0], "-r");
    assert_eq!(args[1], "sess-42");
    assert!(!args.contains(&"--verbose".to_string()));
}

#[tokio::test]
async fn test_oversized_record_is_dropped_and_stream_continues() {
    let dir = TempDir::new().unwrap();

    // One record well past the 256 KiB cap, followed by a valid one.
    let huge_text = "a".repeat(300 * 1024);
    let fixture = format!(
        "{}\n{}\n",
        serde_json::json!({"type": "assistant", "text": huge_text}),
        r#"{"type":"assistant","text":"survived"}"#
    );
    std::fs::write(dir.path().join("turn.ndjson"), fixture).unwrap();
    let script = fake_assistant(dir.path(), r#"cat "$here/turn.ndjson""#);

    let client = client_for(&script);
    let (outcome, events) = client
        .send(AssistantRequest::new("emit a lot"))
        .await
        .unwrap();

    // The oversized record produced no event and did not end the turn.
    assert_eq!(events.len(), 1);
    assert_eq!(outcome.full_text, "survived");
}

#[tokio::test]
async fn test_missing_binary_is_spawn_failure() {
    let client = CliAssistantClient::with_command("/nonexistent/assistant-binary");
    let err = client
        .send(AssistantRequest::new("hello"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::SubprocessSpawnFailed(_)));
}

#[tokio::test]
async fn test_nonzero_exit_surfaces_stderr() {
    let dir = TempDir::new().unwrap();
    let script = fake_assistant(dir.path(), "echo 'credentials expired' >&2\nexit 7");

    let client = client_for(&script);
    let err = client
        .send(AssistantRequest::new("doomed"))
        .await
        .unwrap_err();
    match err {
        EngineError::AssistantFailed { code, stderr } => {
            assert_eq!(code, 7);
            assert!(stderr.contains("credentials expired"));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn test_missing_workdir_rejected() {
    let dir = TempDir::new().unwrap();
    let script = fake_assistant(dir.path(), "exit 0");
    let client = client_for(&script);

    let err = client
        .send(AssistantRequest::new("hi").in_dir("/no/such/directory/anywhere"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_idle_timeout_kills_hung_subprocess() {
    let dir = TempDir::new().unwrap();
    let script = fake_assistant(dir.path(), "sleep 30");

    let client = CliAssistantClient::new(CliAssistantConfig {
        command: script.to_string_lossy().into_owned(),
        idle_timeout: Duration::from_millis(300),
        ..Default::default()
    });

    let err = client
        .send(AssistantRequest::new("hang forever"))
        .await
        .unwrap_err();
    assert!(matches!(err, EngineError::AssistantTimeout(_)));
}

#[tokio::test]
async fn test_cancellation_drains_then_terminates() {
    let dir = TempDir::new().unwrap();
    let script = fake_assistant(
        dir.path(),
        r#"printf '%s\n' '{"type":"assistant","text":"first chunk"}'
sleep 30
printf '%s\n' '{"type":"assistant","text":"never seen"}'"#,
    );

    let client = client_for(&script);
    let cancel = CancellationToken::new();
    let mut turn = client
        .begin(AssistantRequest::new("long running"), cancel.clone())
        .await
        .unwrap();

    // First event arrives, then we request termination mid-turn.
    let first = turn.events.recv().await.unwrap();
    assert_eq!(first.text.as_deref(), Some("first chunk"));
    cancel.cancel();

    while turn.events.recv().await.is_some() {}
    let outcome = turn.finish().await.unwrap();
    assert_eq!(outcome.full_text, "first chunk");
}
