use super::{
    commands::Command,
    envelope::{CallEnvelope, MessageType, ResultEnvelope},
};
use crate::errors::ProtocolError;
use eyre::Context as _;
use serde_json::Value;
use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, PoisonError,
    },
};
use tokio::sync::{mpsc, oneshot};
use tracing::warn;

type Reply = Result<ResultEnvelope, ProtocolError>;

/// Outstanding calls of one client, keyed by call ID.
#[derive(Debug, Default)]
pub struct PendingCalls {
    waiting: Mutex<HashMap<u64, oneshot::Sender<Reply>>>,
}

impl PendingCalls {
    fn register(&self, call_id: u64) -> oneshot::Receiver<Reply> {
        let (tx, rx) = oneshot::channel();
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(call_id, tx);
        rx
    }

    fn take(&self, call_id: u64) -> Option<oneshot::Sender<Reply>> {
        self.waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&call_id)
    }

    /// Route a response to its caller. Unknown or abandoned call IDs are dropped.
    pub fn deliver(&self, resp: ResultEnvelope) {
        match self.take(resp.call_id) {
            Some(tx) => {
                // The caller may have stopped waiting; its result is dropped.
                drop(tx.send(Ok(resp)));
            }
            None => {
                warn!(
                    call_id = resp.call_id,
                    message_type = %resp.message_type,
                    "response for unknown call ignored"
                );
            }
        }
    }

    pub fn fail(&self, call_id: u64, err: ProtocolError) {
        if let Some(tx) = self.take(call_id) {
            drop(tx.send(Err(err)));
        }
    }

    /// Fail every outstanding call, e.g. when the connection goes away.
    pub fn fail_all(&self) {
        let drained: Vec<_> = self
            .waiting
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        for (call_id, tx) in drained {
            drop(tx.send(Err(ProtocolError::ConnectionClosed(call_id))));
        }
    }
}

/// Removes the pending entry if the caller gives up before the reply lands.
struct PendingGuard<'a> {
    pending: &'a PendingCalls,
    call_id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        drop(self.pending.take(self.call_id));
    }
}

/// Issuing side of the command bus.
///
/// Call IDs are generated here, never by the handler side, and grow monotonically, so
/// any number of concurrent calls (including of the same message type) stay
/// distinguishable. There is no built-in timeout; wrap a call in `tokio::time::timeout`
/// when latency must be bounded.
#[derive(Debug)]
pub struct BusClient {
    next_call_id: AtomicU64,
    pending: Arc<PendingCalls>,
    outbound: mpsc::UnboundedSender<CallEnvelope>,
}

impl BusClient {
    /// A client posting calls into `outbound`. Whoever reads that channel feeds
    /// responses back through the returned `PendingCalls`.
    pub fn new(outbound: mpsc::UnboundedSender<CallEnvelope>) -> (Self, Arc<PendingCalls>) {
        let pending = Arc::new(PendingCalls::default());
        (
            Self {
                next_call_id: AtomicU64::new(1),
                pending: Arc::clone(&pending),
                outbound,
            },
            pending,
        )
    }

    /// Issue one call and wait for its envelope.
    pub async fn call_envelope(
        &self,
        message_type: MessageType,
        args: Vec<Value>,
    ) -> eyre::Result<ResultEnvelope> {
        let call_id = self.next_call_id.fetch_add(1, Ordering::Relaxed);
        let rx = self.pending.register(call_id);
        let _guard = PendingGuard {
            pending: &self.pending,
            call_id,
        };

        let call = CallEnvelope {
            message_type: message_type.as_str().to_owned(),
            call_id,
            args,
        };
        if self.outbound.send(call).is_err() {
            return Err(ProtocolError::ConnectionClosed(call_id).into());
        }

        match rx.await {
            Ok(reply) => Ok(reply?),
            Err(_closed) => Err(ProtocolError::ConnectionClosed(call_id).into()),
        }
    }

    pub async fn call_raw(&self, message_type: MessageType, args: Vec<Value>) -> eyre::Result<Value> {
        self.call_envelope(message_type, args).await?.into_outcome()
    }

    /// Typed call: arguments and result are checked against `C` at compile time.
    pub async fn call<C: Command>(&self, cmd: C) -> eyre::Result<C::Output> {
        let v = self.call_raw(C::TYPE, cmd.into_args()).await?;
        serde_json::from_value(v).with_context(|| format!("parse {} result", C::TYPE))
    }
}
