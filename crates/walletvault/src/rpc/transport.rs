use super::{
    bus::CommandBus,
    client::{BusClient, PendingCalls},
    envelope::{CallEnvelope, ResultEnvelope},
};
use crate::errors::ProtocolError;
use serde::Serialize;
use std::sync::Arc;
use tokio::{
    io::{AsyncBufReadExt as _, AsyncRead, AsyncWrite, AsyncWriteExt as _, BufReader},
    sync::mpsc,
    task::JoinSet,
};
use tracing::{debug, error, warn};

pub const MAX_FRAME_BYTES: usize = 1_000_000;

pub async fn write_frame<W, T>(out: &mut W, v: &T) -> eyre::Result<()>
where
    W: AsyncWrite + Unpin + Send,
    T: Serialize + Sync,
{
    out.write_all(format!("{}\n", serde_json::to_string(v)?).as_bytes())
        .await?;
    out.flush().await?;
    Ok(())
}

/// Same-process link: every call runs on its own task, so responses complete in
/// whatever order the handlers finish.
pub fn connect_in_process(bus: Arc<CommandBus>) -> BusClient {
    let (tx, mut rx) = mpsc::unbounded_channel::<CallEnvelope>();
    let (client, pending) = BusClient::new(tx);
    tokio::spawn(async move {
        while let Some(call) = rx.recv().await {
            let call_id = call.call_id;
            let handler = match bus.lookup(&call.message_type) {
                Ok(h) => h,
                Err(e) => {
                    error!(error = %e, call_id, "command bus wiring error");
                    pending.fail(call_id, e);
                    continue;
                }
            };
            let pending = Arc::clone(&pending);
            tokio::spawn(async move {
                pending.deliver(CommandBus::invoke(handler, call).await);
            });
        }
    });
    client
}

/// Serve the bus on one newline-delimited JSON stream until the peer closes it.
///
/// Calls are handled concurrently; in-flight calls are finished and flushed before
/// returning. A call for an unknown message type is a wiring fault and tears the
/// connection down.
pub async fn serve_stream<R, W>(bus: Arc<CommandBus>, reader: R, writer: W) -> eyre::Result<()>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<ResultEnvelope>();
    let writer_task = tokio::spawn(async move {
        let mut w = writer;
        while let Some(resp) = out_rx.recv().await {
            write_frame(&mut w, &resp).await?;
        }
        drop(w.shutdown().await);
        Ok::<_, eyre::Report>(())
    });

    let mut lines = BufReader::new(reader).lines();
    let mut in_flight = JoinSet::new();
    let mut outcome = Ok(());

    while let Some(line) = lines.next_line().await? {
        if line.len() > MAX_FRAME_BYTES {
            warn!(len = line.len(), "frame too large; closing connection");
            outcome = Err(ProtocolError::FrameTooLarge(MAX_FRAME_BYTES).into());
            break;
        }
        if line.trim().is_empty() {
            continue;
        }
        let call: CallEnvelope = match serde_json::from_str(&line) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, "invalid call envelope from client");
                continue;
            }
        };
        let handler = match bus.lookup(&call.message_type) {
            Ok(h) => h,
            Err(e) => {
                error!(error = %e, call_id = call.call_id, "command bus wiring error");
                outcome = Err(e.into());
                break;
            }
        };
        debug!(message_type = %call.message_type, call_id = call.call_id, "call received");
        let out_tx = out_tx.clone();
        in_flight.spawn(async move {
            drop(out_tx.send(CommandBus::invoke(handler, call).await));
        });
        // Reap finished calls so a long-lived connection does not accumulate them.
        while let Some(joined) = in_flight.try_join_next() {
            log_join(joined);
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        log_join(joined);
    }
    drop(out_tx);
    writer_task.await??;
    outcome
}

fn log_join(joined: Result<(), tokio::task::JoinError>) {
    if let Err(e) = joined {
        warn!(error = %e, "call task failed");
    }
}

/// Client half of the stream transport.
pub fn connect_stream<R, W>(reader: R, writer: W) -> BusClient
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<CallEnvelope>();
    let (client, pending) = BusClient::new(tx);

    let writer_pending = Arc::clone(&pending);
    tokio::spawn(async move {
        let mut w = writer;
        while let Some(call) = rx.recv().await {
            if let Err(e) = write_frame(&mut w, &call).await {
                warn!(error = %e, call_id = call.call_id, "failed to send call");
                writer_pending.fail_all();
                return;
            }
        }
        // Client dropped: let the server see end-of-stream.
        drop(w.shutdown().await);
    });

    tokio::spawn(async move {
        read_responses(reader, &pending).await;
        pending.fail_all();
    });

    client
}

async fn read_responses<R: AsyncRead + Unpin + Send>(reader: R, pending: &PendingCalls) {
    let mut lines = BufReader::new(reader).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(l)) => l,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "connection read failed");
                break;
            }
        };
        if line.len() > MAX_FRAME_BYTES {
            warn!(len = line.len(), "response frame too large; closing connection");
            break;
        }
        match serde_json::from_str::<ResultEnvelope>(&line) {
            Ok(resp) => pending.deliver(resp),
            Err(e) => warn!(error = %e, "invalid result envelope from server"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::VaultError;
    use crate::rpc::commands::{GetKeyIDs, GetPublicKeyData, HasSetAppPassword};
    use crate::vault::KeyPublicData;
    use eyre::ContextCompat as _;
    use std::time::Duration;
    use tokio::io::AsyncReadExt as _;

    /// Slow lookups for "slow", instant ones otherwise; echoes the key ID as the name.
    fn echo_bus() -> Arc<CommandBus> {
        let mut bus = CommandBus::new();
        bus.expose(|c: GetPublicKeyData| async move {
            if c.key_id == "slow" {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            if c.key_id == "missing" {
                return Err(eyre::Report::new(VaultError::not_found(&c.key_id)));
            }
            Ok::<_, eyre::Report>(KeyPublicData {
                name: c.key_id,
                ..KeyPublicData::default()
            })
        });
        bus.expose(|_: HasSetAppPassword| async { Ok::<_, eyre::Report>(true) });
        Arc::new(bus)
    }

    #[tokio::test]
    async fn concurrent_calls_of_one_type_resolve_to_their_own_results() -> eyre::Result<()> {
        let client = connect_in_process(echo_bus());
        let slow = client.call(GetPublicKeyData {
            key_id: "slow".to_owned(),
        });
        let fast = client.call(GetPublicKeyData {
            key_id: "fast".to_owned(),
        });
        let (slow, fast) = tokio::join!(slow, fast);
        assert_eq!(slow?.name, "slow");
        assert_eq!(fast?.name, "fast");
        Ok(())
    }

    #[tokio::test]
    async fn domain_errors_cross_the_link_typed() -> eyre::Result<()> {
        let client = connect_in_process(echo_bus());
        let err = client
            .call(GetPublicKeyData {
                key_id: "missing".to_owned(),
            })
            .await
            .err()
            .context("must fail")?;
        assert_eq!(
            err.downcast_ref::<VaultError>(),
            Some(&VaultError::not_found("missing"))
        );
        Ok(())
    }

    #[tokio::test]
    async fn unwired_message_type_fails_loudly() -> eyre::Result<()> {
        let client = connect_in_process(echo_bus());
        let err = client
            .call(GetKeyIDs)
            .await
            .err()
            .context("must fail")?;
        assert!(matches!(
            err.downcast_ref::<ProtocolError>(),
            Some(ProtocolError::MissingHandler(t)) if t == "GetKeyIDs"
        ));
        Ok(())
    }

    #[tokio::test]
    async fn stream_transport_roundtrips_calls() -> eyre::Result<()> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (sr, sw) = tokio::io::split(server_io);
        let server = tokio::spawn(serve_stream(echo_bus(), sr, sw));

        let (cr, cw) = tokio::io::split(client_io);
        let client = connect_stream(cr, cw);

        let (a, b, c) = tokio::join!(
            client.call(GetPublicKeyData {
                key_id: "slow".to_owned()
            }),
            client.call(GetPublicKeyData {
                key_id: "fast".to_owned()
            }),
            client.call(HasSetAppPassword),
        );
        assert_eq!(a?.name, "slow");
        assert_eq!(b?.name, "fast");
        assert!(c?);

        drop(client);
        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn long_lived_connection_serves_sequential_calls() -> eyre::Result<()> {
        let (client_io, server_io) = tokio::io::duplex(64 * 1024);
        let (sr, sw) = tokio::io::split(server_io);
        let server = tokio::spawn(serve_stream(echo_bus(), sr, sw));
        let (cr, cw) = tokio::io::split(client_io);
        let client = connect_stream(cr, cw);

        for i in 0..200 {
            let key_id = format!("k{i}");
            let got = client
                .call(GetPublicKeyData {
                    key_id: key_id.clone(),
                })
                .await?;
            assert_eq!(got.name, key_id);
        }

        drop(client);
        server.await??;
        Ok(())
    }

    #[tokio::test]
    async fn stream_server_skips_garbage_lines() -> eyre::Result<()> {
        let input = b"not json\n\n{\"messageType\":\"HasSetAppPassword\",\"callID\":3,\"args\":[]}\n";
        let (out_w, mut out_r) = tokio::io::duplex(4096);
        serve_stream(echo_bus(), &input[..], out_w).await?;
        let mut out = Vec::new();
        out_r.read_to_end(&mut out).await?;
        let resp: ResultEnvelope = serde_json::from_slice(&out)?;
        assert_eq!(resp.call_id, 3);
        assert_eq!(resp.result, Some(serde_json::json!(true)));
        Ok(())
    }
}
