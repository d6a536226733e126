//! Session manager driving real child processes through `sh`.
#![cfg(unix)]

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use serde_json::json;

use mcp_tester::mcp_client::{inspect, LogBroadcaster, McpError, ServerConfig, SessionManager};

/// Answers every request line with an empty listing that echoes its id.
const ECHO_SERVER: &str = r#"
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  if [ -n "$id" ]; then
    printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[],"resources":[],"prompts":[]}}\n' "$id"
  fi
done
"#;

fn script(dir: &Path, name: &str, body: &str) -> String {
    let path = dir.join(name);
    std::fs::write(&path, body).unwrap();
    format!("sh {}", path.display())
}

fn manager_for(entries: &[(&str, String)]) -> SessionManager {
    let servers: HashMap<String, ServerConfig> = entries
        .iter()
        .map(|(id, command)| {
            let config = ServerConfig {
                id: id.to_string(),
                name: id.to_string(),
                command: Some(command.clone()),
                ..Default::default()
            };
            (id.to_string(), config)
        })
        .collect();
    SessionManager::new(Arc::new(servers))
}

fn lines(logs: &LogBroadcaster) -> Vec<String> {
    logs.snapshot().into_iter().map(|e| e.line).collect()
}

async fn eventually(mut condition: impl FnMut() -> bool) {
    for _ in 0..200 {
        if condition() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    panic!("condition not reached within 5s");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_start_spawns_one_process() {
    let dir = tempfile::tempdir().unwrap();
    let counter = dir.path().join("starts");
    let body = format!("echo started >> {}\nexec cat\n", counter.display());
    let manager = Arc::new(manager_for(&[("fs", script(dir.path(), "server.sh", &body))]));

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let manager = Arc::clone(&manager);
            tokio::spawn(async move { manager.start("fs").unwrap() })
        })
        .collect();
    let mut sessions = Vec::new();
    for handle in handles {
        sessions.push(handle.await.unwrap());
    }
    assert!(sessions.iter().all(|s| Arc::ptr_eq(s, &sessions[0])));

    eventually(|| counter.exists()).await;
    tokio::time::sleep(Duration::from_millis(200)).await;
    let starts = std::fs::read_to_string(&counter).unwrap();
    assert_eq!(starts.lines().count(), 1);

    manager.stop("fs").await;
}

#[tokio::test]
async fn test_connect_inspect_and_stop() {
    let dir = tempfile::tempdir().unwrap();
    let command = script(dir.path(), "echo.sh", ECHO_SERVER);
    let manager = manager_for(&[("echo", command.clone())]);

    let status = inspect::connect(&manager, "echo").await.unwrap();
    assert!(status.running);
    assert_eq!(status.command.as_deref(), Some(command.as_str()));
    assert_eq!(status.initialize.unwrap()["tools"], json!([]));
    assert!(manager.is_running("echo"));

    let session = manager.get("echo").unwrap();
    assert!(session.pid().is_some());
    let state = session.state();
    assert_eq!(state.supports_tools, Some(true));
    assert_eq!(state.tools.unwrap(), json!({"tools": [], "resources": [], "prompts": []}));

    let response = inspect::invoke_tool(&manager, "echo", "noop", Some(r#"{"x": 1}"#), None)
        .await
        .unwrap();
    assert!(response["id"].as_u64().is_some());
    assert!(response.get("result").is_some());

    let logs = manager.log_stream_for("echo");
    let before = lines(&logs);
    assert!(before.contains(&format!("started server {command}")));
    assert!(before.iter().any(|l| l.starts_with(">> ") && l.contains("\"initialize\"")));
    assert!(before.iter().any(|l| l.starts_with(">> ") && l.contains("\"initialized\"")));
    assert!(before.iter().any(|l| l.starts_with("<< ")));

    manager.stop("echo").await;
    assert!(manager.get("echo").is_none());
    assert!(!inspect::status(&manager, "echo").running);

    let after = lines(&logs);
    assert!(after.contains(&"stopping server".to_string()));
    assert!(after.contains(&"process exited with code 137".to_string()));
    let stop_at = after.iter().position(|l| l == "stopping server").unwrap();
    let exit_at = after.iter().position(|l| l.starts_with("process exited")).unwrap();
    assert!(stop_at < exit_at);

    let err = inspect::read_resource(&manager, "echo", "ui://x").await.unwrap_err();
    assert!(matches!(err, McpError::NotRunning { .. }));
}

#[tokio::test]
async fn test_process_exit_evicts_session_and_restart_is_fresh() {
    let dir = tempfile::tempdir().unwrap();
    let command = script(dir.path(), "crash.sh", "echo oops >&2\nsleep 0.2\nexit 3\n");
    let manager = manager_for(&[("crash", command)]);

    let first = manager.start("crash").unwrap();
    eventually(|| manager.get("crash").is_none()).await;
    assert!(!first.is_running());

    let logs = manager.log_stream_for("crash");
    eventually(|| lines(&logs).contains(&"[stderr] oops".to_string())).await;
    assert!(lines(&logs).contains(&"process exited with code 3".to_string()));

    let second = manager.start("crash").unwrap();
    assert!(!Arc::ptr_eq(&first, &second));
    assert!(second.pid().is_some());
    manager.stop("crash").await;
}

#[tokio::test]
async fn test_failed_handshake_stops_session() {
    let dir = tempfile::tempdir().unwrap();
    let manager = manager_for(&[("dead", script(dir.path(), "dead.sh", "exit 0\n"))]);

    let err = inspect::connect(&manager, "dead").await.unwrap_err();
    assert!(
        !matches!(err, McpError::ConfigError { .. }),
        "unexpected error: {err}"
    );
    assert!(manager.get("dead").is_none());
    assert!(manager.running_servers().is_empty());
}

#[tokio::test]
async fn test_shutdown_stops_every_session() {
    let dir = tempfile::tempdir().unwrap();
    let command = script(dir.path(), "cat.sh", "exec cat\n");
    let manager = manager_for(&[("a", command.clone()), ("b", command)]);

    manager.start("a").unwrap();
    manager.start("b").unwrap();
    assert_eq!(manager.running_servers(), vec!["a", "b"]);

    manager.shutdown().await;
    assert!(manager.running_servers().is_empty());
    for id in ["a", "b"] {
        let logs = manager.log_stream_for(id);
        assert!(lines(&logs).contains(&"process exited with code 137".to_string()));
    }
}
