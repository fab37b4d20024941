//! Outbound sender - the single writer on the worker's stdin.
//!
//! Drains the bounded outbound queue in order and writes one flushed line per
//! request. A failure is reported to the one caller whose frame failed; a
//! broken pipe additionally fails everything still queued and stops the loop.

use std::sync::Arc;

use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::{CodecError, JsonLinesCodec};
use crate::bridge::protocol::OutboundFrame;
use crate::error::BridgeError;
use crate::pending::PendingTable;

pub(crate) type FrameWriter<W> = FramedWrite<W, JsonLinesCodec<OutboundFrame>>;

pub(crate) async fn run_sender<W>(
    mut queue: mpsc::Receiver<OutboundFrame>,
    mut writer: FrameWriter<W>,
    pending: Arc<PendingTable>,
    shutdown: CancellationToken,
) where
    W: AsyncWrite + Unpin,
{
    let mut broken: Option<String> = None;

    loop {
        let frame = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break,
            frame = queue.recv() => match frame {
                Some(frame) => frame,
                None => break,
            },
        };

        let id = frame.id.clone();
        // send() flushes, so every frame reaches the pipe before the next dequeue.
        // A worker that stops reading stdin blocks it until shutdown.
        let written = tokio::select! {
            biased;

            _ = shutdown.cancelled() => {
                pending.deliver(id.as_str(), Err(BridgeError::Closed));
                break;
            }
            written = writer.send(frame) => written,
        };
        match written {
            Ok(()) => tracing::trace!(%id, "Frame written"),
            Err(CodecError::Serialize(e)) => {
                tracing::warn!(%id, error = %e, "Failed to serialize frame");
                pending.deliver(id.as_str(), Err(BridgeError::Serialization(e)));
            }
            Err(CodecError::Io(e)) => {
                tracing::error!(%id, error = %e, "Failed to write to worker");
                let reason = e.to_string();
                pending.deliver(id.as_str(), Err(BridgeError::Transport(reason.clone())));
                broken = Some(reason);
                break;
            }
        }
    }

    queue.close();
    let mut dropped = 0usize;
    while let Ok(frame) = queue.try_recv() {
        let err = match &broken {
            Some(reason) => BridgeError::Transport(reason.clone()),
            None => BridgeError::Closed,
        };
        if pending.deliver(frame.id.as_str(), Err(err)) {
            dropped += 1;
        }
    }
    if dropped > 0 {
        tracing::warn!(dropped, "Failed requests still queued when sender stopped");
    }

    tracing::debug!("Sender task exiting");
}
