use super::{
    commands::Command,
    envelope::{CallEnvelope, MessageType, ResultEnvelope},
    BoxFuture,
};
use crate::errors::{ProtocolError, SerializedError, VaultError};
use eyre::Context as _;
use serde_json::Value;
use std::{collections::HashMap, future::Future, sync::Arc};
use tracing::{debug, warn};

pub type Handler = Arc<dyn Fn(Vec<Value>) -> BoxFuture<'static, eyre::Result<Value>> + Send + Sync>;

/// Message-type keyed handler table. Transports feed it call envelopes and ship back
/// whatever envelope it produces.
#[derive(Default, Clone)]
pub struct CommandBus {
    handlers: HashMap<MessageType, Handler>,
}

impl std::fmt::Debug for CommandBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandBus")
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl CommandBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register the handler for `C`. A second registration replaces the first.
    pub fn expose<C, F, Fut>(&mut self, handler: F)
    where
        C: Command,
        F: Fn(C) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = eyre::Result<C::Output>> + Send + 'static,
    {
        let h: Handler = Arc::new(move |args: Vec<Value>| -> BoxFuture<'static, eyre::Result<Value>> {
            match C::from_args(args) {
                Ok(cmd) => {
                    let fut = handler(cmd);
                    Box::pin(async move {
                        let out = fut.await?;
                        serde_json::to_value(out)
                            .with_context(|| format!("serialize {} result", C::TYPE))
                    })
                }
                Err(e) => Box::pin(async move { Err(e) }),
            }
        });
        if self.handlers.insert(C::TYPE, h).is_some() {
            warn!(message_type = %C::TYPE, "replaced existing handler");
        }
    }

    /// Fails on the first message type without a handler.
    pub fn ensure_complete(&self) -> Result<(), ProtocolError> {
        match MessageType::ALL
            .into_iter()
            .find(|t| !self.handlers.contains_key(t))
        {
            Some(t) => Err(ProtocolError::MissingHandler(t.as_str().to_owned())),
            None => Ok(()),
        }
    }

    /// Resolve the handler for a wire message type. A miss is a wiring bug, never bad
    /// input, so it surfaces as a `ProtocolError` instead of an error envelope.
    pub fn lookup(&self, message_type: &str) -> Result<Handler, ProtocolError> {
        message_type
            .parse::<MessageType>()
            .ok()
            .and_then(|t| self.handlers.get(&t))
            .cloned()
            .ok_or_else(|| ProtocolError::MissingHandler(message_type.to_owned()))
    }

    /// Run a resolved handler and wrap its outcome in an envelope carrying the call's
    /// correlation ID.
    pub async fn invoke(handler: Handler, call: CallEnvelope) -> ResultEnvelope {
        let CallEnvelope {
            message_type,
            call_id,
            args,
        } = call;
        match handler(args).await {
            Ok(result) => ResultEnvelope::ok(message_type, call_id, result),
            Err(e) => {
                let error = SerializedError::from_report(&e);
                let retryable = e
                    .downcast_ref::<VaultError>()
                    .is_some_and(VaultError::is_retryable);
                debug!(%message_type, call_id, error_name = %error.name, retryable, "handler failed");
                ResultEnvelope::err(message_type, call_id, error)
            }
        }
    }

    pub async fn dispatch(&self, call: CallEnvelope) -> Result<ResultEnvelope, ProtocolError> {
        let handler = self.lookup(&call.message_type)?;
        Ok(Self::invoke(handler, call).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::commands::{GetKeyIDs, HasSetAppPassword};
    use eyre::ContextCompat as _;
    use serde_json::json;

    fn call(t: &str, id: u64, args: Vec<Value>) -> CallEnvelope {
        CallEnvelope {
            message_type: t.to_owned(),
            call_id: id,
            args,
        }
    }

    #[tokio::test]
    async fn dispatch_correlates_result_with_call_id() -> eyre::Result<()> {
        let mut bus = CommandBus::new();
        bus.expose(|_: GetKeyIDs| async { Ok::<_, eyre::Report>(vec!["a".to_owned(), "b".to_owned()]) });

        let out = bus.dispatch(call("GetKeyIDs", 42, vec![])).await?;
        assert_eq!(out.call_id, 42);
        assert_eq!(out.message_type, "GetKeyIDs");
        assert_eq!(out.result, Some(json!(["a", "b"])));
        assert!(out.error.is_none());
        Ok(())
    }

    #[tokio::test]
    async fn missing_handler_is_a_protocol_error() -> eyre::Result<()> {
        let bus = CommandBus::new();
        let err = bus
            .dispatch(call("GetKeyIDs", 1, vec![]))
            .await
            .err()
            .context("must fail")?;
        assert_eq!(err, ProtocolError::MissingHandler("GetKeyIDs".to_owned()));

        let err = bus
            .dispatch(call("NoSuchThing", 2, vec![]))
            .await
            .err()
            .context("must fail")?;
        assert_eq!(err, ProtocolError::MissingHandler("NoSuchThing".to_owned()));
        Ok(())
    }

    #[tokio::test]
    async fn handler_errors_become_error_envelopes() -> eyre::Result<()> {
        let mut bus = CommandBus::new();
        bus.expose(|_: HasSetAppPassword| async {
            Err::<bool, eyre::Report>(VaultError::wrong_password().into())
        });

        let out = bus.dispatch(call("HasSetAppPassword", 5, vec![])).await?;
        let err = out.error.context("error envelope")?;
        assert_eq!(err.name, "UnauthorizedError");
        assert_eq!(err.message, "Wrong password.");
        assert!(out.result.is_none());

        // Argument errors are reported the same way.
        let out = bus
            .dispatch(call("HasSetAppPassword", 6, vec![json!(true)]))
            .await?;
        assert_eq!(
            out.error.map(|e| e.name),
            Some("InvalidArgumentsError".to_owned())
        );
        Ok(())
    }

    #[tokio::test]
    async fn re_exposing_replaces_the_handler() -> eyre::Result<()> {
        let mut bus = CommandBus::new();
        bus.expose(|_: HasSetAppPassword| async { Ok::<_, eyre::Report>(false) });
        bus.expose(|_: HasSetAppPassword| async { Ok::<_, eyre::Report>(true) });
        let out = bus.dispatch(call("HasSetAppPassword", 1, vec![])).await?;
        assert_eq!(out.result, Some(json!(true)));
        Ok(())
    }

    #[test]
    fn ensure_complete_names_the_first_gap() {
        let mut bus = CommandBus::new();
        bus.expose(|_: GetKeyIDs| async { Ok::<_, eyre::Report>(Vec::<String>::new()) });
        assert_eq!(
            bus.ensure_complete(),
            Err(ProtocolError::MissingHandler("CreateKey".to_owned()))
        );
    }
}
