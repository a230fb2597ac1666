//! Request/response correlation with per-attempt timeout and retry budget.
//!
//! Each attempt gets a fresh `msgId`. The pending entry is registered before
//! the frame is transmitted and removed exactly once: by its response, by
//! its timeout, by a flush when the connection drops, or when the caller
//! drops the call future.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::error::{CallError, ConnectionError};
use crate::retry::{retry_async, with_timeout, RetryPolicy};
use crate::stream::client::StreamDefaults;
use crate::stream::proto::{Envelope, MessageType};

/// Transport the correlator writes through.
#[async_trait]
pub trait EnvelopeSink: Send + Sync {
    fn is_open(&self) -> bool;
    async fn transmit(&self, envelope: &Envelope) -> Result<(), ConnectionError>;
}

/// Per-call delivery options.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CallOptions {
    /// Extra attempts after the first one times out.
    pub retries: u32,
    /// Deadline for each attempt.
    pub timeout: Duration,
    pub wait_for_response: bool,
}

impl Default for CallOptions {
    fn default() -> Self {
        Self {
            retries: 0,
            timeout: StreamDefaults::RESPONSE_TIMEOUT,
            wait_for_response: true,
        }
    }
}

impl CallOptions {
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn fire_and_forget(mut self) -> Self {
        self.wait_for_response = false;
        self
    }
}

#[derive(Debug)]
struct PendingRequest {
    expected: MessageType,
    tx: oneshot::Sender<Result<Envelope, CallError>>,
}

/// Removes its entry from the pending table when the attempt ends, however
/// it ends.
struct PendingSlot<'a> {
    correlator: &'a RequestCorrelator,
    msg_id: String,
}

impl Drop for PendingSlot<'_> {
    fn drop(&mut self) {
        if self.correlator.remove(&self.msg_id).is_some() {
            debug!(event = "pending_entry_released", msg_id = %self.msg_id);
        }
    }
}

#[derive(Debug, Default)]
pub struct RequestCorrelator {
    pending: Mutex<HashMap<String, PendingRequest>>,
}

impl RequestCorrelator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sends `kind` and, in wait mode, resolves with its matching response.
    ///
    /// Fire-and-forget calls resolve to `Ok(None)` once the frame is written.
    pub async fn call(
        &self,
        sink: &dyn EnvelopeSink,
        kind: MessageType,
        content: Value,
        options: CallOptions,
    ) -> Result<Option<Envelope>, CallError> {
        if !sink.is_open() {
            debug!(event = "call_rejected_not_open", kind = kind.as_str());
            return Err(CallError::Communication);
        }
        let policy = RetryPolicy::from_retries(options.retries);

        if !options.wait_for_response {
            retry_async(
                &policy,
                move |_| {
                    let envelope = Envelope::new(kind, content.clone());
                    async move { sink.transmit(&envelope).await }
                },
                |_| true,
            )
            .await
            .map_err(|err| {
                warn!(event = "send_failed", kind = kind.as_str(), error = %err);
                CallError::Communication
            })?;
            return Ok(None);
        }

        let expected = kind
            .expected_response()
            .ok_or(CallError::UnknownMessageType(kind.as_str()))?;
        let result = retry_async(
            &policy,
            move |attempt| {
                self.attempt(
                    sink,
                    Envelope::new(kind, content.clone()),
                    expected,
                    options.timeout,
                    attempt,
                )
            },
            CallError::is_timeout,
        )
        .await;

        match result {
            Ok(envelope) => Ok(Some(envelope)),
            Err(err) if err.is_timeout() => {
                warn!(
                    event = "call_retries_exhausted",
                    kind = kind.as_str(),
                    attempts = policy.max_attempts
                );
                Err(CallError::Communication)
            }
            Err(err) => Err(err),
        }
    }

    async fn attempt(
        &self,
        sink: &dyn EnvelopeSink,
        envelope: Envelope,
        expected: MessageType,
        timeout: Duration,
        attempt: usize,
    ) -> Result<Envelope, CallError> {
        let msg_id = envelope.msg_id.clone();
        let (tx, rx) = oneshot::channel();
        self.register(msg_id.clone(), expected, tx);
        let _slot = PendingSlot {
            correlator: self,
            msg_id: msg_id.clone(),
        };

        if let Err(err) = sink.transmit(&envelope).await {
            warn!(event = "send_failed", kind = envelope.kind.as_str(), error = %err);
            return Err(CallError::Communication);
        }
        debug!(
            event = "call_sent",
            kind = envelope.kind.as_str(),
            msg_id = %msg_id,
            attempt
        );

        match with_timeout(timeout, rx).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(_)) => Err(CallError::Communication),
            Err(_) => {
                debug!(event = "call_timed_out", msg_id = %msg_id, attempt);
                Err(CallError::Timeout {
                    timeout_ms: timeout.as_millis() as u64,
                })
            }
        }
    }

    /// Hands `envelope` to its pending entry. Gives it back if nothing waits.
    pub fn resolve(&self, envelope: Envelope) -> Result<(), Envelope> {
        let Some(entry) = self.remove(&envelope.msg_id) else {
            return Err(envelope);
        };
        let outcome = if envelope.kind == entry.expected {
            Ok(envelope)
        } else if envelope.kind == MessageType::Incompatible {
            warn!(event = "request_incompatible", expected = entry.expected.as_str());
            Err(CallError::Incompatible)
        } else {
            warn!(
                event = "protocol_mismatch",
                expected = entry.expected.as_str(),
                received = envelope.kind.as_str()
            );
            Err(CallError::ProtocolMismatch {
                expected: entry.expected.as_str(),
                received: envelope.kind.as_str(),
            })
        };
        let _ = entry.tx.send(outcome);
        Ok(())
    }

    /// Resolves every outstanding entry with a communication error.
    pub fn flush_all(&self) -> usize {
        let drained: Vec<PendingRequest> = match self.pending.lock() {
            Ok(mut pending) => pending.drain().map(|(_, entry)| entry).collect(),
            Err(_) => return 0,
        };
        let flushed = drained.len();
        for entry in drained {
            let _ = entry.tx.send(Err(CallError::Communication));
        }
        if flushed > 0 {
            debug!(event = "pending_flushed", flushed);
        }
        flushed
    }

    pub fn pending_len(&self) -> usize {
        self.pending.lock().map(|pending| pending.len()).unwrap_or(0)
    }

    fn register(
        &self,
        msg_id: String,
        expected: MessageType,
        tx: oneshot::Sender<Result<Envelope, CallError>>,
    ) {
        if let Ok(mut pending) = self.pending.lock() {
            pending.insert(msg_id, PendingRequest { expected, tx });
        }
    }

    fn remove(&self, msg_id: &str) -> Option<PendingRequest> {
        self.pending
            .lock()
            .ok()
            .and_then(|mut pending| pending.remove(msg_id))
    }
}
