//! One relay connection: writer task, read loop, and teardown.
//!
//! The read loop is the only reader of the socket. Everything written to the socket (pongs,
//! close echoes, relayed messages, heartbeat pings) goes through the connection's FIFO queue
//! and is drained by a single writer task.

use std::io;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::relay::error::ConnectionError;
use crate::relay::frame::{self, Frame};
use crate::relay::protocol::{ClientMessage, ACTION_RENAME};
use crate::relay::registry::{ConnectionHandle, Registry};

/// How long teardown waits for queued frames (e.g. a close echo) to flush.
const WRITER_DRAIN: Duration = Duration::from_secs(5);

/// Serve an upgraded stream until it ends: register it, run the read loop, then broadcast the
/// leave notice and deregister it.
pub async fn serve<S>(stream: S, registry: Arc<Registry>, requested_room: Option<String>)
where
    S: AsyncRead + AsyncWrite + Send + 'static,
{
    let (mut reader, writer) = tokio::io::split(stream);
    let (conn, outbound) = ConnectionHandle::new();
    let mut writer_task = tokio::spawn(write_loop(writer, outbound, conn.close_token()));

    let admission = registry.admit(requested_room.as_deref(), conn.clone()).await;
    let id = admission.id;

    let reason = read_loop(&mut reader, &registry, &id, &conn).await;
    if reason.is_violation() {
        log::error!("{}: websocket connection closed: {}", id, reason);
    } else {
        log::debug!("{}: websocket connection closed: {}", id, reason);
    }

    registry.depart(&id).await;

    // The registry's clone is gone; dropping ours lets the writer finish once drained.
    let token = conn.close_token();
    drop(conn);
    if tokio::time::timeout(WRITER_DRAIN, &mut writer_task).await.is_err() {
        token.cancel();
        let _ = writer_task.await;
    }
}

/// Decode frames until the connection ends and report why.
async fn read_loop<R>(
    reader: &mut R,
    registry: &Registry,
    id: &str,
    conn: &ConnectionHandle,
) -> ConnectionError
where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            _ = conn.closed() => return ConnectionError::Evicted,
            next = frame::read_frame(reader) => next,
        };
        let next = match next {
            Ok(f) => f,
            Err(e) => return e,
        };

        match next {
            Frame::Pong => registry.mark_alive(id).await,
            Frame::Ping(payload) => {
                log::debug!("[{}] received ping frame, sending pong", id);
                registry.mark_alive(id).await;
                if conn.send(frame::encode_pong(&payload)).is_err() {
                    return ConnectionError::Evicted;
                }
            }
            Frame::Close { code, reason } => {
                log::debug!("{}: received close frame: code {}, reason: {}", id, code, reason);
                let _ = conn.send(frame::encode_close(code));
                return ConnectionError::Closed { code, reason };
            }
            Frame::Text(text) => {
                if text.is_empty() {
                    continue;
                }
                let message: ClientMessage = match serde_json::from_str(&text) {
                    Ok(m) => m,
                    Err(e) => return e.into(),
                };
                if message.typ == ACTION_RENAME {
                    registry.rename(id, message.name.unwrap_or_default()).await;
                }
                registry.relay(id, &message.room_id, &text).await;
            }
        }
    }
}

/// Drain the outbound queue onto the socket in order. Stops when the queue closes (then shuts
/// the write side down) or when the connection is closed. A failed write closes the connection.
async fn write_loop<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Vec<u8>>,
    closer: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    loop {
        let frame = tokio::select! {
            biased;
            _ = closer.cancelled() => return,
            frame = outbound.recv() => frame,
        };
        let Some(frame) = frame else { break };

        let written: io::Result<()> = tokio::select! {
            _ = closer.cancelled() => return,
            res = async {
                writer.write_all(&frame).await?;
                writer.flush().await
            } => res,
        };
        if let Err(e) = written {
            log::error!("error writing frame: {}", e);
            closer.cancel();
            return;
        }
    }
    let _ = writer.shutdown().await;
}
