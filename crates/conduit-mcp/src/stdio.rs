//! Stdio transport for local MCP servers.
//!
//! The server runs as a child process speaking newline-delimited JSON-RPC on
//! stdin/stdout. Stderr is captured as diagnostics. A single watcher task
//! owns the child, so exit detection and kill requests never race on it.

use crate::correlator::{Inbound, RequestCorrelator};
use crate::error::{McpError, McpResult};
use crate::framer::{Frame, MessageFramer};
use crate::launcher;
use crate::logs::LogKind;
use crate::protocol::JsonRpcMessage;
use crate::transport::{EventSender, Transport, TransportEvent};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::io;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, trace, warn};

/// Default time a process must survive to count as started.
pub const DEFAULT_SPAWN_GRACE: Duration = Duration::from_secs(1);

/// Default per-request timeout for stdio servers.
pub const DEFAULT_STDIO_TIMEOUT: Duration = Duration::from_secs(30);

/// Stderr lines kept for exit reasons.
const STDERR_TAIL_LINES: usize = 20;

/// How long to wait for stderr to drain after the process exits.
const STDERR_DRAIN: Duration = Duration::from_millis(250);

/// How long `stop` waits for the exit to be observed after killing.
const KILL_WAIT: Duration = Duration::from_secs(2);

const STARTING: u8 = 0;
const RUNNING: u8 = 1;
const STOPPING: u8 = 2;
const EXITED: u8 = 3;

type KillReply = oneshot::Sender<io::Result<()>>;
type StderrTail = Arc<std::sync::Mutex<VecDeque<String>>>;

/// How to launch a stdio server.
#[derive(Debug, Clone)]
pub struct StdioConfig {
    pub command: String,
    pub args: Vec<String>,
    /// Overrides on top of the inherited environment.
    pub env: HashMap<String, String>,
    pub cwd: Option<PathBuf>,
    pub request_timeout: Duration,
    pub grace: Duration,
}

impl StdioConfig {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
            env: HashMap::new(),
            cwd: None,
            request_timeout: DEFAULT_STDIO_TIMEOUT,
            grace: DEFAULT_SPAWN_GRACE,
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    fn overrides_path(&self) -> bool {
        self.env.keys().any(|k| k.eq_ignore_ascii_case("PATH"))
    }
}

/// How a server process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    pub code: Option<i32>,
    pub reason: String,
}

/// A running stdio server.
pub struct ProcessTransport {
    command: String,
    pid: Option<u32>,
    correlator: Arc<RequestCorrelator>,
    writer: Arc<Mutex<FramedWrite<ChildStdin, MessageFramer>>>,
    phase: Arc<AtomicU8>,
    kill_tx: std::sync::Mutex<Option<oneshot::Sender<KillReply>>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessTransport {
    /// Spawn the server and wait out the grace window.
    ///
    /// Fails with [`McpError::StartFailed`] if the process cannot be spawned
    /// or exits before the window elapses.
    pub async fn start(config: StdioConfig, events: EventSender) -> McpResult<Self> {
        let launch = launcher::resolve(&config.command, &config.args);

        let mut cmd = Command::new(&launch.program);
        cmd.args(&launch.args)
            .envs(&config.env)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(path) = launch.path {
            if !config.overrides_path() {
                cmd.env("PATH", path);
            }
        }
        if let Some(dir) = &config.cwd {
            cmd.current_dir(dir);
        }

        debug!(
            command = %config.command,
            program = %launch.program.display(),
            args = ?launch.args,
            "Starting MCP server process"
        );

        let mut child = cmd
            .spawn()
            .map_err(|e| McpError::StartFailed(format!("{}: {e}", config.command)))?;
        let pid = child.id();

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| McpError::ProcessError("Failed to get stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| McpError::ProcessError("Failed to get stdout".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| McpError::ProcessError("Failed to get stderr".to_string()))?;

        let correlator = Arc::new(RequestCorrelator::new(config.request_timeout));
        let writer = Arc::new(Mutex::new(FramedWrite::new(stdin, MessageFramer::new())));
        let phase = Arc::new(AtomicU8::new(STARTING));
        let tail: StderrTail = Arc::default();

        let stderr_task = tokio::spawn(read_stderr(stderr, tail.clone(), events.clone()));
        let stdout_task = tokio::spawn(read_stdout(
            stdout,
            correlator.clone(),
            writer.clone(),
            events.clone(),
        ));

        let (kill_tx, kill_rx) = oneshot::channel();
        let (exit_tx, exit_rx) = watch::channel(None);
        tokio::spawn(watch_exit(
            child,
            kill_rx,
            [stdout_task, stderr_task],
            tail,
            correlator.clone(),
            phase.clone(),
            exit_tx,
            events,
        ));

        let transport = Self {
            command: config.command,
            pid,
            correlator,
            writer,
            phase,
            kill_tx: std::sync::Mutex::new(Some(kill_tx)),
            exit_rx,
        };
        transport.await_grace(config.grace).await?;

        info!(command = %transport.command, pid = ?transport.pid, "MCP server process started");
        Ok(transport)
    }

    async fn await_grace(&self, grace: Duration) -> McpResult<()> {
        let mut exit_rx = self.exit_rx.clone();
        if let Ok(Ok(exit)) =
            tokio::time::timeout(grace, exit_rx.wait_for(Option::is_some)).await
        {
            let reason = (*exit)
                .as_ref()
                .map(|e| e.reason.clone())
                .unwrap_or_default();
            return Err(McpError::StartFailed(reason));
        }

        // The exit may land between the timeout and this point.
        if self
            .phase
            .compare_exchange(STARTING, RUNNING, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            let reason = self
                .exit_status()
                .map(|e| e.reason)
                .unwrap_or_else(|| "process exited during startup".to_string());
            return Err(McpError::StartFailed(reason));
        }
        Ok(())
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// How the process ended, once it has.
    pub fn exit_status(&self) -> Option<ProcessExit> {
        self.exit_rx.borrow().clone()
    }

    /// Kill the process and reject pending requests.
    ///
    /// Only fails if the kill signal itself errors; stopping a process that
    /// already exited succeeds.
    pub async fn stop(&self) -> McpResult<()> {
        let _ = self
            .phase
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |p| {
                (p != EXITED).then_some(STOPPING)
            });

        let kill_tx = self
            .kill_tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(kill_tx) = kill_tx else {
            return Ok(());
        };

        let (reply_tx, reply_rx) = oneshot::channel();
        if kill_tx.send(reply_tx).is_ok() {
            if let Ok(Err(e)) = reply_rx.await {
                return Err(McpError::ProcessError(format!(
                    "Failed to kill {}: {e}",
                    self.command
                )));
            }
        }

        self.correlator.close();
        let mut exit_rx = self.exit_rx.clone();
        let _ = tokio::time::timeout(KILL_WAIT, exit_rx.wait_for(Option::is_some)).await;
        debug!(command = %self.command, "Stopped MCP server process");
        Ok(())
    }

    async fn write(&self, message: JsonRpcMessage) -> McpResult<()> {
        if self.phase.load(Ordering::SeqCst) == EXITED {
            return Err(McpError::ConnectionClosed);
        }
        let mut writer = self.writer.lock().await;
        writer.send(message).await
    }
}

#[async_trait]
impl Transport for ProcessTransport {
    async fn request(&self, method: &str, params: Option<Value>) -> McpResult<Value> {
        self.correlator
            .send_request(method, params, |message| self.write(message))
            .await
    }

    async fn notify(&self, method: &str, params: Option<Value>) -> McpResult<()> {
        trace!(method, "Sending notification");
        self.write(JsonRpcMessage::notification(method, params))
            .await
    }

    async fn close(&self) -> McpResult<()> {
        self.stop().await
    }

    fn is_connected(&self) -> bool {
        self.phase.load(Ordering::SeqCst) == RUNNING
    }
}

async fn read_stdout(
    stdout: ChildStdout,
    correlator: Arc<RequestCorrelator>,
    writer: Arc<Mutex<FramedWrite<ChildStdin, MessageFramer>>>,
    events: EventSender,
) {
    let mut frames = FramedRead::new(stdout, MessageFramer::new());
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(Frame::Message(message)) => match correlator.dispatch(message) {
                Inbound::Resolved(id) => trace!(id, "Resolved request"),
                Inbound::Notification(message) => {
                    let _ = events.send(TransportEvent::Notification(message));
                }
                Inbound::Request(message) => {
                    let method = message.method().unwrap_or_default().to_string();
                    let _ = events.send(TransportEvent::Log {
                        kind: LogKind::Protocol,
                        message: format!("server request: {method}"),
                        payload: message.params.clone(),
                    });
                    if let Some(reply) = message.reply_to_server_request() {
                        if let Err(e) = writer.lock().await.send(reply).await {
                            warn!(method = %method, error = %e, "Failed to answer server request");
                        }
                    }
                }
                Inbound::Orphan(message) => {
                    debug!(id = ?message.id, "Dropping response with no pending request");
                }
            },
            Ok(Frame::Diagnostic(line)) => {
                let _ = events.send(TransportEvent::log(LogKind::Stdout, line));
            }
            Err(e) => {
                debug!(error = %e, "Stdout read failed");
                break;
            }
        }
    }
}

async fn read_stderr(stderr: ChildStderr, tail: StderrTail, events: EventSender) {
    let mut reader = BufReader::new(stderr);
    let mut buf = Vec::new();
    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
        let line = String::from_utf8_lossy(&buf).trim_end().to_string();
        if line.is_empty() {
            continue;
        }
        {
            let mut tail = tail.lock().unwrap_or_else(PoisonError::into_inner);
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line.clone());
        }
        let _ = events.send(TransportEvent::log(LogKind::Stderr, line));
    }
}

#[allow(clippy::too_many_arguments)]
async fn watch_exit(
    mut child: Child,
    kill_rx: oneshot::Receiver<KillReply>,
    readers: [JoinHandle<()>; 2],
    tail: StderrTail,
    correlator: Arc<RequestCorrelator>,
    phase: Arc<AtomicU8>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    events: EventSender,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        request = kill_rx => {
            // A dropped transport also kills its process.
            let result = child.start_kill();
            if let Ok(reply) = request {
                let _ = reply.send(result);
            }
            child.wait().await
        }
    };

    let code = status.as_ref().ok().and_then(|s| s.code());

    // Grandchildren may keep the pipes open after the server itself exits.
    let [stdout_task, stderr_task] = readers;
    let stderr_abort = stderr_task.abort_handle();
    let _ = tokio::time::timeout(STDERR_DRAIN, stderr_task).await;
    stderr_abort.abort();
    stdout_task.abort();

    let stderr = tail
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .iter()
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string();
    let reason = if !stderr.is_empty() {
        stderr
    } else {
        match (&status, code) {
            (_, Some(code)) => format!("process exited with code {code}"),
            (Err(e), None) => format!("failed to wait for process: {e}"),
            (Ok(_), None) => "process terminated by signal".to_string(),
        }
    };

    correlator.close();
    exit_tx.send_replace(Some(ProcessExit {
        code,
        reason: reason.clone(),
    }));

    let crashed = phase
        .compare_exchange(RUNNING, EXITED, Ordering::SeqCst, Ordering::SeqCst)
        .is_ok();
    if crashed {
        warn!(code = ?code, reason = %reason, "MCP server process exited");
        let _ = events.send(TransportEvent::Closed { code, reason });
    } else {
        phase.store(EXITED, Ordering::SeqCst);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    fn sh(script: &str) -> StdioConfig {
        StdioConfig::new("sh", vec!["-c".to_string(), script.to_string()])
            .with_grace(Duration::from_millis(200))
            .with_timeout(Duration::from_secs(5))
    }

    async fn next_matching<F>(
        rx: &mut mpsc::UnboundedReceiver<TransportEvent>,
        mut pred: F,
    ) -> TransportEvent
    where
        F: FnMut(&TransportEvent) -> bool,
    {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let event = rx.recv().await.expect("event channel closed");
                if pred(&event) {
                    return event;
                }
            }
        })
        .await
        .expect("timed out waiting for event")
    }

    #[tokio::test]
    async fn test_request_round_trip() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let script = r#"read line; echo '{"jsonrpc":"2.0","id":1,"result":{"ok":true}}'; sleep 5"#;
        let transport = ProcessTransport::start(sh(script), tx).await.unwrap();
        assert!(transport.is_connected());

        let result = transport.request("tools/list", None).await.unwrap();
        assert_eq!(result["ok"], true);
        transport.stop().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn test_immediate_exit_uses_stderr() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = ProcessTransport::start(sh("echo 'missing dependency' >&2; exit 1"), tx).await;
        match result {
            Err(McpError::StartFailed(reason)) => assert_eq!(reason, "missing dependency"),
            other => panic!("expected StartFailed, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_immediate_exit_without_stderr() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let result = ProcessTransport::start(sh("exit 3"), tx).await;
        match result {
            Err(McpError::StartFailed(reason)) => {
                assert_eq!(reason, "process exited with code 3")
            }
            other => panic!("expected StartFailed, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_spawn_error() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = StdioConfig::new("conduit-no-such-binary-12345", vec![]);
        match ProcessTransport::start(config, tx).await {
            Err(McpError::StartFailed(reason)) => {
                assert!(reason.starts_with("conduit-no-such-binary-12345: "))
            }
            other => panic!("expected StartFailed, got {:?}", other.err()),
        }
    }

    #[tokio::test]
    async fn test_stop_rejects_pending() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let transport = Arc::new(ProcessTransport::start(sh("exec sleep 30"), tx).await.unwrap());

        let mut handles = Vec::new();
        for _ in 0..3 {
            let transport = transport.clone();
            handles.push(tokio::spawn(async move {
                transport.request("slow", None).await
            }));
        }
        while transport.correlator.pending_count() < 3 {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        transport.stop().await.unwrap();
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(McpError::ConnectionClosed)
            ));
        }

        // Stopping twice is fine.
        transport.stop().await.unwrap();
        assert!(matches!(
            transport.request("late", None).await,
            Err(McpError::ConnectionClosed)
        ));
    }

    #[tokio::test]
    async fn test_crash_after_start_is_reported() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = ProcessTransport::start(sh("sleep 0.5; echo boom >&2; exit 2"), tx)
            .await
            .unwrap();

        let event = next_matching(&mut rx, |e| matches!(e, TransportEvent::Closed { .. })).await;
        match event {
            TransportEvent::Closed { code, reason } => {
                assert_eq!(code, Some(2));
                assert_eq!(reason, "boom");
            }
            _ => unreachable!(),
        }
        assert!(!transport.is_connected());
        assert_eq!(transport.exit_status().unwrap().code, Some(2));
    }

    #[tokio::test]
    async fn test_stop_does_not_report_crash() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let transport = ProcessTransport::start(sh("exec sleep 30"), tx).await.unwrap();
        transport.stop().await.unwrap();
        drop(transport);

        let drained = tokio::time::timeout(Duration::from_secs(3), async {
            while let Some(event) = rx.recv().await {
                assert!(!matches!(event, TransportEvent::Closed { .. }));
            }
        })
        .await;
        assert!(drained.is_ok());
    }

    #[tokio::test]
    async fn test_non_protocol_stdout_is_logged() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let _transport = ProcessTransport::start(sh("echo 'server banner'; sleep 5"), tx)
            .await
            .unwrap();

        let event = next_matching(&mut rx, |e| {
            matches!(e, TransportEvent::Log { kind: LogKind::Stdout, .. })
        })
        .await;
        match event {
            TransportEvent::Log { message, .. } => assert_eq!(message, "server banner"),
            _ => unreachable!(),
        }
    }

    #[tokio::test]
    async fn test_answers_server_ping() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let script = r#"echo '{"jsonrpc":"2.0","id":"p1","method":"ping"}'; read reply; echo "$reply" >&2; sleep 5"#;
        let _transport = ProcessTransport::start(sh(script), tx).await.unwrap();

        let event = next_matching(&mut rx, |e| {
            matches!(e, TransportEvent::Log { kind: LogKind::Stderr, .. })
        })
        .await;
        let TransportEvent::Log { message, .. } = event else {
            unreachable!()
        };
        let reply: Value = serde_json::from_str(&message).unwrap();
        assert_eq!(reply["id"], "p1");
        assert_eq!(reply["result"], serde_json::json!({}));
    }

    #[tokio::test]
    async fn test_notifications_are_forwarded() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let script = r#"echo '{"jsonrpc":"2.0","method":"notifications/tools/list_changed"}'; sleep 5"#;
        let _transport = ProcessTransport::start(sh(script), tx).await.unwrap();

        let event = next_matching(&mut rx, |e| matches!(e, TransportEvent::Notification(_))).await;
        let TransportEvent::Notification(message) = event else {
            unreachable!()
        };
        assert_eq!(message.method(), Some("notifications/tools/list_changed"));
    }

    #[tokio::test]
    async fn test_env_overrides_are_applied() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = sh(r#"echo "token=$CONDUIT_TEST_TOKEN" >&2; sleep 5"#)
            .with_env("CONDUIT_TEST_TOKEN", "abc");
        let _transport = ProcessTransport::start(config, tx).await.unwrap();

        let event = next_matching(&mut rx, |e| {
            matches!(e, TransportEvent::Log { kind: LogKind::Stderr, .. })
        })
        .await;
        let TransportEvent::Log { message, .. } = event else {
            unreachable!()
        };
        assert_eq!(message, "token=abc");
    }
}
