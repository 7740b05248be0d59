//! Request/response correlation.
//!
//! Ids are allocated per transport instance starting at 1. Each pending
//! request owns a oneshot sender that is completed by the matching response,
//! by closing the correlator, or dropped when its timeout elapses.

use crate::error::{McpError, McpResult};
use crate::protocol::{JsonRpcMessage, MessageKind};
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::{debug, trace};

type Waiter = oneshot::Sender<McpResult<Value>>;

/// Where an inbound message was routed.
#[derive(Debug)]
pub enum Inbound {
    /// Completed a pending request.
    Resolved(u64),
    /// Server notification, for observers.
    Notification(JsonRpcMessage),
    /// Server-initiated request; the transport must answer it.
    Request(JsonRpcMessage),
    /// A response nobody waits for (late, duplicate or malformed).
    Orphan(JsonRpcMessage),
}

/// Pending-request table for one transport instance.
#[derive(Debug)]
pub struct RequestCorrelator {
    next_id: AtomicU64,
    pending: Mutex<HashMap<u64, Waiter>>,
    closed: AtomicBool,
    timeout: Duration,
}

impl RequestCorrelator {
    pub fn new(timeout: Duration) -> Self {
        Self {
            next_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            timeout,
        }
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    fn table(&self) -> MutexGuard<'_, HashMap<u64, Waiter>> {
        self.pending.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Send a request and wait for its response.
    ///
    /// `send` writes the framed request. The timeout covers both the write
    /// and the wait; on timeout or write failure the pending entry is removed.
    pub async fn send_request<F, Fut>(
        &self,
        method: &str,
        params: Option<Value>,
        send: F,
    ) -> McpResult<Value>
    where
        F: FnOnce(JsonRpcMessage) -> Fut,
        Fut: Future<Output = McpResult<()>>,
    {
        let (id, rx) = self.register()?;
        trace!(id, method, "Sending request");
        let message = JsonRpcMessage::request(id, method, params);

        let exchange = async {
            send(message).await?;
            rx.await.map_err(|_| McpError::ConnectionClosed)?
        };

        match tokio::time::timeout(self.timeout, exchange).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(e)) => {
                self.forget(id);
                Err(e)
            }
            Err(_) => {
                self.forget(id);
                debug!(id, method, timeout = ?self.timeout, "Request timed out");
                Err(McpError::Timeout(method.to_string()))
            }
        }
    }

    /// Allocate an id and a waiter for it.
    pub fn register(&self) -> McpResult<(u64, oneshot::Receiver<McpResult<Value>>)> {
        if self.is_closed() {
            return Err(McpError::ConnectionClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        let mut table = self.table();
        // Re-check under the lock so close() cannot miss this entry.
        if self.is_closed() {
            return Err(McpError::ConnectionClosed);
        }
        table.insert(id, tx);
        Ok((id, rx))
    }

    /// Drop a pending entry without completing it.
    pub fn forget(&self, id: u64) -> bool {
        self.table().remove(&id).is_some()
    }

    /// Route an inbound message.
    pub fn dispatch(&self, message: JsonRpcMessage) -> Inbound {
        match message.kind() {
            MessageKind::Notification => Inbound::Notification(message),
            MessageKind::Request => Inbound::Request(message),
            MessageKind::Response => {
                let waiter = message
                    .id
                    .as_ref()
                    .and_then(|id| id.as_u64())
                    .and_then(|id| self.table().remove(&id).map(|w| (id, w)));
                let Some((id, waiter)) = waiter else {
                    return Inbound::Orphan(message);
                };
                let outcome = match message.error {
                    Some(error) => Err(McpError::Rpc {
                        code: error.code,
                        message: error.message,
                        data: error.data,
                    }),
                    None => Ok(message.result.unwrap_or(Value::Null)),
                };
                // The waiter may have timed out in the meantime.
                let _ = waiter.send(outcome);
                Inbound::Resolved(id)
            }
            MessageKind::Invalid => Inbound::Orphan(message),
        }
    }

    /// Reject every pending request and refuse new ones.
    ///
    /// Returns the number of requests rejected.
    pub fn close(&self) -> usize {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<Waiter> = self.table().drain().map(|(_, w)| w).collect();
        let count = drained.len();
        for waiter in drained {
            let _ = waiter.send(Err(McpError::ConnectionClosed));
        }
        if count > 0 {
            debug!(count, "Rejected pending requests on close");
        }
        count
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn pending_count(&self) -> usize {
        self.table().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::RequestId;
    use serde_json::json;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn response(id: u64, result: Value) -> JsonRpcMessage {
        JsonRpcMessage::response(RequestId::Number(id), result)
    }

    /// Correlator whose "wire" is an mpsc channel of outbound requests.
    fn wired(
        timeout: Duration,
    ) -> (
        Arc<RequestCorrelator>,
        mpsc::UnboundedReceiver<JsonRpcMessage>,
        mpsc::UnboundedSender<JsonRpcMessage>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Arc::new(RequestCorrelator::new(timeout)), rx, tx)
    }

    #[tokio::test]
    async fn test_ids_start_at_one_and_increase() {
        let correlator = RequestCorrelator::new(Duration::from_secs(1));
        let (a, _ra) = correlator.register().unwrap();
        let (b, _rb) = correlator.register().unwrap();
        assert_eq!((a, b), (1, 2));
        assert_eq!(correlator.pending_count(), 2);
    }

    #[tokio::test]
    async fn test_concurrent_requests_resolve_out_of_order() {
        let (correlator, mut wire, tx) = wired(Duration::from_secs(5));

        let mut handles = Vec::new();
        for n in 0..10u64 {
            let correlator = correlator.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                correlator
                    .send_request("echo", Some(json!({ "n": n })), |msg| async move {
                        tx.send(msg).map_err(|_| McpError::ConnectionClosed)
                    })
                    .await
                    .map(|v| (n, v))
            }));
        }

        let mut sent = Vec::new();
        for _ in 0..10 {
            sent.push(wire.recv().await.unwrap());
        }
        // Answer in reverse order, echoing the params back.
        for msg in sent.into_iter().rev() {
            let id = msg.id.unwrap().as_u64().unwrap();
            let routed = correlator.dispatch(response(id, msg.params.unwrap()));
            assert!(matches!(routed, Inbound::Resolved(i) if i == id));
        }

        for handle in handles {
            let (n, value) = handle.await.unwrap().unwrap();
            assert_eq!(value, json!({ "n": n }));
        }
        assert_eq!(correlator.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_timeout_removes_pending_entry() {
        let correlator = RequestCorrelator::new(Duration::from_millis(50));
        let err = correlator
            .send_request("slow", None, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::Timeout(ref m) if m == "slow"));
        assert_eq!(correlator.pending_count(), 0);

        // A late response is now an orphan.
        assert!(matches!(
            correlator.dispatch(response(1, json!({}))),
            Inbound::Orphan(_)
        ));
    }

    #[tokio::test]
    async fn test_close_rejects_exactly_pending() {
        let (correlator, mut wire, tx) = wired(Duration::from_secs(5));

        let mut handles = Vec::new();
        for _ in 0..3 {
            let correlator = correlator.clone();
            let tx = tx.clone();
            handles.push(tokio::spawn(async move {
                correlator
                    .send_request("hang", None, |msg| async move {
                        tx.send(msg).map_err(|_| McpError::ConnectionClosed)
                    })
                    .await
            }));
        }
        for _ in 0..3 {
            wire.recv().await.unwrap();
        }

        assert_eq!(correlator.close(), 3);
        for handle in handles {
            assert!(matches!(
                handle.await.unwrap(),
                Err(McpError::ConnectionClosed)
            ));
        }

        let err = correlator
            .send_request("after", None, |_| async { Ok(()) })
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionClosed));
    }

    #[tokio::test]
    async fn test_error_response_maps_to_rpc_error() {
        let correlator = RequestCorrelator::new(Duration::from_secs(1));
        let (id, rx) = correlator.register().unwrap();

        let mut msg = JsonRpcMessage::error_response(RequestId::Number(id), -32602, "bad params");
        msg.error.as_mut().unwrap().data = Some(json!({"field": "x"}));
        correlator.dispatch(msg);

        match rx.await.unwrap() {
            Err(McpError::Rpc { code, message, data }) => {
                assert_eq!(code, -32602);
                assert_eq!(message, "bad params");
                assert_eq!(data, Some(json!({"field": "x"})));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_string_id_resolves() {
        let correlator = RequestCorrelator::new(Duration::from_secs(1));
        let (id, rx) = correlator.register().unwrap();
        correlator.dispatch(JsonRpcMessage::response(
            RequestId::String(id.to_string()),
            json!("ok"),
        ));
        assert_eq!(rx.await.unwrap().unwrap(), json!("ok"));
    }

    #[test]
    fn test_dispatch_classifies_server_messages() {
        let correlator = RequestCorrelator::new(Duration::from_secs(1));
        let note = JsonRpcMessage::notification("notifications/tools/list_changed", None);
        assert!(matches!(correlator.dispatch(note), Inbound::Notification(_)));

        let req: JsonRpcMessage =
            serde_json::from_str(r#"{"jsonrpc":"2.0","id":"srv-1","method":"ping"}"#).unwrap();
        assert!(matches!(correlator.dispatch(req), Inbound::Request(_)));

        assert!(matches!(
            correlator.dispatch(response(99, json!({}))),
            Inbound::Orphan(_)
        ));
    }

    #[tokio::test]
    async fn test_send_failure_removes_entry() {
        let correlator = RequestCorrelator::new(Duration::from_secs(1));
        let err = correlator
            .send_request("x", None, |_| async {
                Err(McpError::connection_failed("broken pipe"))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, McpError::ConnectionFailed(_)));
        assert_eq!(correlator.pending_count(), 0);
    }
}
