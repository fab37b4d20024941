//! Reference worker speaking the molbridge wire protocol.
//!
//! Reads `{"id","msg"}` lines on stdin and answers with `{"id","reply"}` lines
//! on stdout. Each request is handled on its own task, so replies come back in
//! completion order. Payloads with special meaning:
//!
//! - `init` -> `initialized` (handshake)
//! - `ping` -> `pong`
//! - `slow` / `silent` -> never answered
//! - `crash` -> exit with status 3
//! - `garbage` -> a non-frame line, then `garbage-ok`
//! - `sleep:<ms>:<text>` -> `<text>` after `<ms>` milliseconds
//!
//! Anything else is echoed back unchanged.

use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use molbridge::{InboundFrame, JsonLinesCodec, OutboundFrame};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};

enum Output {
    Frame(InboundFrame),
    Raw(&'static str),
}

#[tokio::main]
async fn main() -> Result<()> {
    molbridge_cli::logging::init_tracing();
    tracing::info!(pid = std::process::id(), "Echo worker starting");

    let mut requests = FramedRead::new(tokio::io::stdin(), JsonLinesCodec::<OutboundFrame>::new());
    let (out_tx, out_rx) = mpsc::channel::<Output>(100);
    let writer = tokio::spawn(write_replies(out_rx));

    while let Some(item) = requests.next().await {
        match item {
            Ok(Ok(frame)) => {
                tokio::spawn(handle(frame, out_tx.clone()));
            }
            Ok(Err(e)) => tracing::warn!(error = %e, "Ignoring malformed request"),
            Err(e) => {
                tracing::error!(error = %e, "Failed to read stdin");
                break;
            }
        }
    }

    // Let in-flight handlers finish before exiting.
    drop(out_tx);
    writer.await.context("writer task panicked")??;
    tracing::info!("Echo worker exiting");
    Ok(())
}

async fn write_replies(mut rx: mpsc::Receiver<Output>) -> Result<()> {
    let mut sink = FramedWrite::new(tokio::io::stdout(), JsonLinesCodec::<InboundFrame>::new());
    while let Some(output) = rx.recv().await {
        match output {
            Output::Frame(frame) => sink.send(frame).await.context("failed to write reply")?,
            Output::Raw(line) => {
                // send() always flushes, so the codec buffer is empty here.
                let stdout = sink.get_mut();
                stdout.write_all(line.as_bytes()).await?;
                stdout.write_all(b"\n").await?;
                stdout.flush().await?;
            }
        }
    }
    Ok(())
}

async fn handle(frame: OutboundFrame, out: mpsc::Sender<Output>) {
    let OutboundFrame { id, payload } = frame;
    tracing::debug!(%id, payload_len = payload.len(), "Handling request");

    let reply = match payload.as_str() {
        "init" => "initialized".to_string(),
        "ping" => "pong".to_string(),
        "slow" | "silent" => return,
        "crash" => {
            tracing::warn!(%id, "Crash requested, exiting with status 3");
            std::process::exit(3);
        }
        "garbage" => {
            let _ = out.send(Output::Raw("<<this line is not a frame>>")).await;
            "garbage-ok".to_string()
        }
        other => match parse_sleep(other) {
            Some((delay, text)) => {
                tokio::time::sleep(delay).await;
                text.to_string()
            }
            None => other.to_string(),
        },
    };

    let _ = out.send(Output::Frame(InboundFrame::new(id, reply))).await;
}

/// `sleep:<ms>:<text>`
fn parse_sleep(payload: &str) -> Option<(Duration, &str)> {
    let (ms, text) = payload.strip_prefix("sleep:")?.split_once(':')?;
    let ms: u64 = ms.parse().ok()?;
    Some((Duration::from_millis(ms), text))
}
