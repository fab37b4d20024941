//! Inbound dispatcher - the single reader on the worker's stdout.
//!
//! Replies are routed by correlation id only, so they may arrive in any
//! order. Bad lines are logged and skipped; only end of stream or a read
//! error stops the loop.

use std::sync::Arc;

use futures::StreamExt;
use tokio::io::AsyncRead;
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;

use crate::bridge::codec::JsonLinesCodec;
use crate::bridge::protocol::InboundFrame;
use crate::pending::PendingTable;

pub(crate) type FrameReader<R> = FramedRead<R, JsonLinesCodec<InboundFrame>>;

/// Why the dispatcher stopped reading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum DispatchExit {
    Shutdown,
    EndOfStream,
    ReadFailed(String),
}

pub(crate) async fn run_dispatcher<R>(
    mut reader: FrameReader<R>,
    pending: Arc<PendingTable>,
    shutdown: CancellationToken,
) -> DispatchExit
where
    R: AsyncRead + Unpin,
{
    let mut malformed: u64 = 0;

    let exit = loop {
        let item = tokio::select! {
            biased;

            _ = shutdown.cancelled() => break DispatchExit::Shutdown,
            item = reader.next() => item,
        };

        match item {
            Some(Ok(Ok(frame))) => {
                let InboundFrame { id, reply } = frame;
                if pending.deliver(id.as_str(), Ok(reply)) {
                    tracing::trace!(%id, pending = pending.len(), "Reply delivered");
                } else {
                    // Late reply after a timeout, or an id we never issued.
                    tracing::debug!(%id, "Discarding reply with no pending request");
                }
            }
            Some(Ok(Err(e))) => {
                malformed += 1;
                tracing::warn!(error = %e, malformed, "Ignoring malformed line from worker");
            }
            Some(Err(e)) => {
                tracing::error!(error = %e, "Failed to read from worker");
                break DispatchExit::ReadFailed(e.to_string());
            }
            None => {
                tracing::debug!("Worker stdout closed");
                break DispatchExit::EndOfStream;
            }
        }
    };

    tracing::debug!(?exit, malformed, "Dispatcher task exiting");
    exit
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::CorrelationId;
    use crate::pending::PendingGuard;
    use tokio::io::AsyncWriteExt;

    fn spawn_dispatcher(
        stdout: tokio::io::DuplexStream,
        pending: &Arc<PendingTable>,
    ) -> (tokio::task::JoinHandle<DispatchExit>, CancellationToken) {
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(run_dispatcher(
            FramedRead::new(stdout, JsonLinesCodec::new()),
            Arc::clone(pending),
            shutdown.clone(),
        ));
        (task, shutdown)
    }

    #[tokio::test]
    async fn routes_replies_in_arrival_order() {
        let (mut worker, stdout) = tokio::io::duplex(4096);
        let pending = PendingTable::new();
        let (_a, reply_a) = PendingGuard::register(&pending, CorrelationId::from("a"));
        let (_b, reply_b) = PendingGuard::register(&pending, CorrelationId::from("b"));
        let (task, _shutdown) = spawn_dispatcher(stdout, &pending);

        worker
            .write_all(b"{\"id\":\"b\",\"reply\":\"second\"}\n{\"id\":\"a\",\"reply\":\"first\"}\n")
            .await
            .unwrap();

        assert_eq!(reply_b.await.unwrap().unwrap(), "second");
        assert_eq!(reply_a.await.unwrap().unwrap(), "first");

        drop(worker);
        assert_eq!(task.await.unwrap(), DispatchExit::EndOfStream);
    }

    #[tokio::test]
    async fn malformed_and_unknown_lines_are_skipped() {
        let (mut worker, stdout) = tokio::io::duplex(4096);
        let pending = PendingTable::new();
        let (_guard, reply) = PendingGuard::register(&pending, CorrelationId::from("real"));
        let (task, shutdown) = spawn_dispatcher(stdout, &pending);

        worker
            .write_all(
                b"Traceback (most recent call last):\n\
                  {\"id\":\"real\"}\n\
                  {\"id\":\"stranger\",\"reply\":\"nope\"}\n\
                  {\"id\":\"real\",\"reply\":\"ok\"}\n",
            )
            .await
            .unwrap();

        assert_eq!(reply.await.unwrap().unwrap(), "ok");
        assert!(pending.is_empty());

        shutdown.cancel();
        assert_eq!(task.await.unwrap(), DispatchExit::Shutdown);
    }

    #[tokio::test]
    async fn late_reply_after_removal_is_dropped() {
        let (mut worker, stdout) = tokio::io::duplex(4096);
        let pending = PendingTable::new();
        let (guard, _reply) = PendingGuard::register(&pending, CorrelationId::from("gone"));
        drop(guard);
        let (task, _shutdown) = spawn_dispatcher(stdout, &pending);

        worker
            .write_all(b"{\"id\":\"gone\",\"reply\":\"too late\"}\n")
            .await
            .unwrap();
        drop(worker);

        assert_eq!(task.await.unwrap(), DispatchExit::EndOfStream);
        assert!(pending.is_empty());
    }
}
