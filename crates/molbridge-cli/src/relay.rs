//! Line relay: every non-empty input line becomes one concurrent request.
//!
//! Results are written as JSON lines as soon as each reply arrives, so output
//! order follows reply order, not input order. The `request` field carries the
//! 1-based input line number for matching them up.
//!
//! At most `max_in_flight` requests are outstanding at once. Input is not read
//! further until one finishes, so a slow worker slows the reader instead of
//! piling up tasks whose queue wait eats into their timeout.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use molbridge::WorkerClient;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{Semaphore, mpsc};
use tokio_util::codec::{FramedRead, FramedWrite, LinesCodec};

/// One output line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayRecord {
    pub request: u64,
    pub payload: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RelaySummary {
    pub sent: u64,
    pub succeeded: u64,
    pub failed: u64,
}

pub async fn relay<R, W>(
    client: Arc<dyn WorkerClient>,
    input: R,
    output: W,
    timeout: Duration,
    max_in_flight: usize,
) -> Result<RelaySummary>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin + Send + 'static,
{
    let (record_tx, mut record_rx) = mpsc::channel::<RelayRecord>(100);

    let writer = tokio::spawn(async move {
        let mut sink = FramedWrite::new(output, LinesCodec::new());
        let mut summary = RelaySummary::default();
        while let Some(record) = record_rx.recv().await {
            if record.error.is_some() {
                summary.failed += 1;
            } else {
                summary.succeeded += 1;
            }
            let line =
                serde_json::to_string(&record).context("failed to encode relay record")?;
            sink.send(line)
                .await
                .context("failed to write relay output")?;
        }
        anyhow::Ok(summary)
    });

    let mut lines = FramedRead::new(input, LinesCodec::new());
    let in_flight = Arc::new(Semaphore::new(max_in_flight.max(1)));
    let mut sent = 0u64;

    while let Some(line) = lines.next().await {
        let line = line.context("failed to read relay input")?;
        let payload = line.trim().to_string();
        if payload.is_empty() {
            continue;
        }
        let permit = Arc::clone(&in_flight)
            .acquire_owned()
            .await
            .context("relay concurrency limit closed")?;
        sent += 1;
        let request = sent;

        let client = Arc::clone(&client);
        let record_tx = record_tx.clone();
        tokio::spawn(async move {
            let _permit = permit;
            let outcome = client.send_and_wait(payload.clone(), timeout).await;
            let record = match outcome {
                Ok(reply) => RelayRecord {
                    request,
                    payload,
                    reply: Some(reply),
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(request, error = %e, "Request failed");
                    RelayRecord {
                        request,
                        payload,
                        reply: None,
                        error: Some(e.to_string()),
                    }
                }
            };
            let _ = record_tx.send(record).await;
        });
    }
    tracing::debug!(sent, "Relay input closed, waiting for outstanding replies");

    // The writer finishes once every request task has dropped its sender.
    drop(record_tx);

    let mut summary = writer.await.context("relay writer task failed")??;
    summary.sent = sent;
    Ok(summary)
}
