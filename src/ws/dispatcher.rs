//! Default [`Dispatcher`]: request ids on the wire, replies matched by id.
//!
//! Requests go out as
//!
//! ```json
//! {"type": "request", "body": {"request_id": "..", "method": "Event.replay", "data": {..}}}
//! ```
//!
//! and the server answers with a `response` frame carrying the same `request_id`, a `success`
//! flag and the reply `data`.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::{Value, json};
use tokio::sync::oneshot;
use tokio::time::timeout;
use uuid::Uuid;

use super::envelope::{Envelope, Method, Request, Response};
use super::error::WsError;
use super::traits::Dispatcher;
use super::transport::Outbound;
use crate::Result;

/// How long a routed request may wait for its reply.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(20);

type Reply = std::result::Result<Response, WsError>;

struct Pending {
    method: Method,
    reply: oneshot::Sender<Reply>,
}

/// Correlates requests and `response` frames by `request_id`.
pub struct SocketDispatcher {
    pending: DashMap<String, Pending>,
    timeout: Duration,
}

impl Default for SocketDispatcher {
    fn default() -> Self {
        Self::new(DEFAULT_REQUEST_TIMEOUT)
    }
}

impl SocketDispatcher {
    #[must_use]
    pub fn new(timeout: Duration) -> Self {
        Self {
            pending: DashMap::new(),
            timeout,
        }
    }

    /// Number of requests still waiting for a reply.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.pending.len()
    }
}

/// Removes the pending entry when the request finishes or is dropped mid-flight.
struct PendingGuard<'map> {
    pending: &'map DashMap<String, Pending>,
    request_id: String,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.pending.remove(&self.request_id);
    }
}

#[async_trait]
impl Dispatcher for SocketDispatcher {
    async fn request(&self, outbound: Outbound, request: Request) -> Result<Response> {
        let method = request.method;
        let request_id = Uuid::new_v4().to_string();
        let (reply, rx) = oneshot::channel();

        self.pending
            .insert(request_id.clone(), Pending { method, reply });
        let guard = PendingGuard {
            pending: &self.pending,
            request_id: request_id.clone(),
        };

        let frame = json!({
            "type": "request",
            "body": {
                "request_id": request_id,
                "method": method.as_ref(),
                "data": request.data,
            },
        });
        tracing::trace!(%method, %request_id, "Sending websocket request");
        outbound.send_json(&frame)?;

        let outcome = timeout(self.timeout, rx).await;
        drop(guard);

        match outcome {
            Ok(Ok(reply)) => Ok(reply?),
            Ok(Err(_closed)) => Err(WsError::Cancelled(method).into()),
            Err(_elapsed) => {
                tracing::warn!(%method, %request_id, "Websocket request timed out");
                Err(WsError::Timeout.into())
            }
        }
    }

    fn handle_inbound(&self, envelope: &Envelope) -> bool {
        if envelope.kind != "response" {
            return false;
        }
        let Some(request_id) = envelope.body.get("request_id").and_then(Value::as_str) else {
            return false;
        };
        let Some((_, pending)) = self.pending.remove(request_id) else {
            tracing::debug!(request_id, "Response for unknown or expired request");
            return false;
        };

        let success = envelope
            .body
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or(false);
        let data = envelope.body.get("data").cloned().unwrap_or(Value::Null);

        let reply = if success {
            Ok(Response::new(data, envelope.counter))
        } else {
            Err(WsError::RequestFailed {
                method: pending.method,
                reason: data.to_string(),
            })
        };
        _ = pending.reply.send(reply);
        true
    }
}
