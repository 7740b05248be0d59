//! Lifecycle of stdio servers driven through the connection manager.
#![cfg(unix)]

use conduit_auth::{AuthResult, BrowserOpener, MemoryCredentialStore, OAuthManager};
use conduit_mcp::{
    ConnectionEvent, ConnectionManager, ConnectionState, LogKind, ManagerSettings, McpError,
    ServerConfig,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

struct NoBrowser;

impl BrowserOpener for NoBrowser {
    fn open(&self, _url: &str) -> AuthResult<()> {
        Ok(())
    }
}

fn manager() -> ConnectionManager {
    let oauth = OAuthManager::new(Arc::new(MemoryCredentialStore::new()), Arc::new(NoBrowser));
    let settings = ManagerSettings {
        stdio_timeout_secs: 5,
        spawn_grace_ms: 200,
        ..ManagerSettings::default()
    };
    ConnectionManager::new(settings, Arc::new(oauth))
}

/// A line-oriented MCP server written in sh.
///
/// Answers `initialize`, `tools/list` and `tools/call`. A call to the
/// `crash` tool makes the server print "boom" to stderr and exit 2.
const SERVER: &str = r#"
echo 'server starting' >&2
while IFS= read -r line; do
  id=$(printf '%s' "$line" | sed -n 's/.*"id":\([0-9][0-9]*\).*/\1/p')
  case "$line" in
    *'"method":"initialize"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"protocolVersion":"2024-11-05","capabilities":{"tools":{}},"serverInfo":{"name":"sh-server","version":"1.0"}}}\n' "$id" ;;
    *'"method":"tools/list"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"tools":[{"name":"echo","inputSchema":{"type":"object"}},{"name":"crash"}]}}\n' "$id" ;;
    *'"name":"crash"'*)
      echo 'boom' >&2
      exit 2 ;;
    *'"method":"tools/call"'*)
      printf '{"jsonrpc":"2.0","id":%s,"result":{"content":[{"type":"text","text":"pong"}]}}\n' "$id" ;;
  esac
done
"#;

fn sh_server(id: &str, script: &str) -> ServerConfig {
    ServerConfig::stdio(id, "sh", ["-c", script])
}

fn drain_states(rx: &mut broadcast::Receiver<ConnectionEvent>) -> Vec<&'static str> {
    let mut states = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let ConnectionEvent::StateChanged { state, .. } = event {
            states.push(state.name());
        }
    }
    states
}

async fn wait_for_exit(rx: &mut broadcast::Receiver<ConnectionEvent>) -> (Option<i32>, String) {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            if let Ok(ConnectionEvent::ServerExited { code, reason, .. }) = rx.recv().await {
                return (code, reason);
            }
        }
    })
    .await
    .expect("timed out waiting for server exit")
}

#[tokio::test]
async fn test_start_list_call_stop() {
    let manager = manager();
    let mut events = manager.subscribe();

    let outcome = manager.start_server(sh_server("local", SERVER)).await;
    assert!(outcome.success, "start failed: {:?}", outcome.error);
    assert!(matches!(
        manager.state("local"),
        Some(ConnectionState::Connected { .. })
    ));

    let names: Vec<_> = manager
        .list_tools("local")
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["echo", "crash"]);

    let result = manager.call_tool("local", "echo", None).await.unwrap();
    assert_eq!(result.text(), "pong");

    let stopped = manager.stop_server("local").await;
    assert!(stopped.success);
    assert_eq!(manager.state("local"), Some(ConnectionState::Idle));
    assert_eq!(
        drain_states(&mut events),
        vec!["connecting", "connected", "idle"]
    );

    let logs = manager.get_logs("local");
    assert!(logs
        .iter()
        .any(|e| e.kind == LogKind::Stderr && e.message == "server starting"));
}

#[tokio::test]
async fn test_immediate_exit_reports_stderr() {
    let manager = manager();
    let mut events = manager.subscribe();

    let outcome = manager
        .start_server(sh_server("broken", "echo 'missing dependency' >&2; exit 1"))
        .await;
    assert!(!outcome.success);
    assert_eq!(outcome.error.as_deref(), Some("missing dependency"));
    assert_eq!(
        manager.state("broken"),
        Some(ConnectionState::error("missing dependency"))
    );
    assert_eq!(drain_states(&mut events), vec!["connecting", "error"]);
}

#[tokio::test]
async fn test_crash_after_start() {
    let manager = manager();
    let mut events = manager.subscribe();
    assert!(manager.start_server(sh_server("local", SERVER)).await.success);

    let err = manager.call_tool("local", "crash", None).await.unwrap_err();
    assert!(matches!(err, McpError::ConnectionClosed));

    let (code, reason) = wait_for_exit(&mut events).await;
    assert_eq!(code, Some(2));
    assert!(reason.contains("boom"), "unexpected reason {reason}");
    assert!(matches!(
        manager.state("local"),
        Some(ConnectionState::Error { .. })
    ));
    assert!(matches!(
        manager.list_tools("local").await,
        Err(McpError::NotConnected(_))
    ));
}

#[tokio::test]
async fn test_retry_after_failure() {
    let manager = manager();
    let marker = tempfile::tempdir().unwrap();
    let flag = marker.path().join("ready");
    // Fails until the flag file exists.
    let script = format!(
        "[ -f '{}' ] || {{ echo 'not ready' >&2; exit 1; }}\n{SERVER}",
        flag.display()
    );

    let outcome = manager.start_server(sh_server("flaky", &script)).await;
    assert_eq!(outcome.error.as_deref(), Some("not ready"));

    std::fs::write(&flag, "").unwrap();
    let outcome = manager.retry_server("flaky").await;
    assert!(outcome.success, "retry failed: {:?}", outcome.error);
    assert!(matches!(
        manager.state("flaky"),
        Some(ConnectionState::Connected { .. })
    ));
    manager.shutdown().await;
    assert_eq!(manager.state("flaky"), Some(ConnectionState::Idle));
}

#[tokio::test]
async fn test_restart_with_same_config_is_noop() {
    let manager = manager();
    let config = sh_server("local", SERVER);
    assert!(manager.start_server(config.clone()).await.success);

    let mut events = manager.subscribe();
    assert!(manager.start_server(config).await.success);
    assert!(drain_states(&mut events).is_empty());
    manager.shutdown().await;
}
