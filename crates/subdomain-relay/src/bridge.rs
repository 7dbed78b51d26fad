//! The two copy loops that move bytes between a client WebSocket and its backend TCP stream.
//!
//! Each loop owns its read side exclusively. The client write side is shared through
//! [`ClientChannel`] so that either loop (and the session controller) can close the client, and so
//! that nothing is forwarded to the client once it has been closed.

use std::{
    borrow::Cow,
    io,
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::tcp::{OwnedReadHalf, OwnedWriteHalf},
    sync::Mutex,
};
use tokio_util::sync::CancellationToken;

use crate::metrics::Metrics;

/// Upper bound for writing a close or ping frame to a client that may have stopped reading.
const CONTROL_FRAME_TIMEOUT: Duration = Duration::from_secs(2);

pub(crate) const REASON_TARGET_CLOSED: &str = "Target closed";

/// Why a copy loop stopped without an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum PumpExit {
    /// The client sent a close frame.
    ClientClosed,
    /// The client stream ended without a close frame.
    ClientGone,
    /// The backend returned a zero-length read.
    TargetClosed,
    /// The client channel had already been closed elsewhere.
    ClientNotOpen,
    /// The session scope was cancelled.
    Cancelled,
}

#[derive(Debug, thiserror::Error)]
pub(crate) enum BridgeError {
    #[error("client websocket error: {0}")]
    Client(#[source] axum::Error),
    #[error("reading from target failed: {0}")]
    TargetRead(#[source] io::Error),
    #[error("writing to target failed: {0}")]
    TargetWrite(#[source] io::Error),
}

/// Write side of the client WebSocket plus its open/closed state.
pub(crate) struct ClientChannel {
    open: AtomicBool,
    sink: Mutex<SplitSink<WebSocket, Message>>,
}

impl ClientChannel {
    pub(crate) fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            open: AtomicBool::new(true),
            sink: Mutex::new(sink),
        }
    }

    pub(crate) fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }

    /// Marks the channel closed without sending anything, e.g. after the peer vanished.
    pub(crate) fn mark_gone(&self) {
        self.open.store(false, Ordering::Release);
    }

    /// Sends one binary message. Returns `Ok(false)` if the channel is no longer open.
    pub(crate) async fn send_binary(&self, payload: Vec<u8>) -> Result<bool, axum::Error> {
        let mut sink = self.sink.lock().await;
        if !self.is_open() {
            return Ok(false);
        }
        sink.send(Message::Binary(payload)).await?;
        Ok(true)
    }

    pub(crate) async fn ping(&self) {
        let mut sink = self.sink.lock().await;
        if !self.is_open() {
            return;
        }
        match tokio::time::timeout(CONTROL_FRAME_TIMEOUT, sink.send(Message::Ping(Vec::new())))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!("websocket ping failed: {err}"),
            Err(_) => tracing::debug!("websocket ping timed out"),
        }
    }

    /// Completes a close the client started.
    ///
    /// The WebSocket layer queues the close reply when it reads the client's frame; closing the
    /// sink flushes that reply. No second close frame is sent.
    pub(crate) async fn ack_close(&self) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(CONTROL_FRAME_TIMEOUT, sink.close()).await {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!("websocket close handshake failed: {err}"),
            Err(_) => tracing::debug!("websocket close handshake timed out"),
        }
    }

    /// Sends a close frame once. Later calls, and calls after [`Self::mark_gone`], do nothing.
    ///
    /// The channel stops accepting payload before the frame is written, so no data can follow the
    /// close. Failures are logged and otherwise ignored; the session is ending either way.
    pub(crate) async fn close(&self, code: u16, reason: &'static str) {
        if !self.open.swap(false, Ordering::AcqRel) {
            return;
        }

        let frame = CloseFrame {
            code,
            reason: Cow::Borrowed(reason),
        };
        let mut sink = self.sink.lock().await;
        match tokio::time::timeout(CONTROL_FRAME_TIMEOUT, sink.send(Message::Close(Some(frame))))
            .await
        {
            Ok(Ok(())) => {}
            Ok(Err(err)) => tracing::debug!(code, reason, "websocket close failed: {err}"),
            Err(_) => tracing::debug!(code, reason, "websocket close timed out"),
        }
    }
}

/// Forwards client messages to the backend until the client closes or the scope is cancelled.
///
/// Payloads are written in slices of at most `chunk_size` bytes, each flushed before the next.
pub(crate) async fn client_to_target(
    mut client_rx: SplitStream<WebSocket>,
    client: &ClientChannel,
    mut target_tx: OwnedWriteHalf,
    chunk_size: usize,
    cancel: CancellationToken,
    metrics: Metrics,
) -> Result<PumpExit, BridgeError> {
    while client.is_open() {
        let next = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PumpExit::Cancelled),
            next = client_rx.next() => next,
        };

        let payload = match next {
            None => {
                client.mark_gone();
                return Ok(PumpExit::ClientGone);
            }
            Some(Err(err)) => return Err(BridgeError::Client(err)),
            Some(Ok(Message::Close(_))) => {
                client.ack_close().await;
                return Ok(PumpExit::ClientClosed);
            }
            Some(Ok(Message::Binary(bytes))) => bytes,
            Some(Ok(Message::Text(text))) => text.into_bytes(),
            // Pings are answered by the WebSocket layer.
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
        };

        if payload.is_empty() {
            continue;
        }

        for slice in payload.chunks(chunk_size.max(1)) {
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Ok(PumpExit::Cancelled),
                res = write_and_flush(&mut target_tx, slice) => {
                    res.map_err(BridgeError::TargetWrite)?;
                }
            }
        }
        metrics.client_to_target(payload.len());
    }

    Ok(PumpExit::ClientNotOpen)
}

/// Forwards backend bytes to the client, one binary message per read, until the backend closes
/// or the scope is cancelled.
pub(crate) async fn target_to_client(
    mut target_rx: OwnedReadHalf,
    client: &ClientChannel,
    chunk_size: usize,
    cancel: CancellationToken,
    metrics: Metrics,
) -> Result<PumpExit, BridgeError> {
    let mut chunk = vec![0u8; chunk_size.max(1)];

    while client.is_open() {
        let n = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PumpExit::Cancelled),
            res = target_rx.read(&mut chunk) => res.map_err(BridgeError::TargetRead)?,
        };

        if n == 0 {
            client.close(close_code::NORMAL, REASON_TARGET_CLOSED).await;
            return Ok(PumpExit::TargetClosed);
        }

        let sent = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Ok(PumpExit::Cancelled),
            res = client.send_binary(chunk[..n].to_vec()) => res.map_err(BridgeError::Client)?,
        };
        if !sent {
            break;
        }
        metrics.target_to_client(n);
    }

    Ok(PumpExit::ClientNotOpen)
}

async fn write_and_flush(target_tx: &mut OwnedWriteHalf, payload: &[u8]) -> io::Result<()> {
    target_tx.write_all(payload).await?;
    target_tx.flush().await
}
