//! End-to-end tests against the real echo worker process.

use std::sync::Arc;
use std::time::{Duration, Instant};

use futures::future::join_all;
use molbridge::{Bridge, BridgeConfig, BridgeError, Handshake, ProcessState, WorkerCommand};

const WAIT: Duration = Duration::from_secs(10);

fn echo_worker() -> WorkerCommand {
    WorkerCommand::new(env!("CARGO_BIN_EXE_molbridge-echo-worker"))
}

fn config() -> BridgeConfig {
    BridgeConfig::new()
        .with_startup_grace(Duration::from_millis(100))
        .with_handshake(Handshake::new("init", "initialized"))
}

async fn start() -> Bridge {
    Bridge::start(echo_worker(), config()).await.unwrap()
}

#[tokio::test]
async fn handshake_then_ping() {
    let bridge = start().await;

    let status = bridge.status();
    assert_eq!(status.state, ProcessState::Running);
    assert!(status.pid.is_some());

    assert_eq!(bridge.send_and_wait("ping", WAIT).await.unwrap(), "pong");
    assert_eq!(bridge.send_and_wait("CCO", WAIT).await.unwrap(), "CCO");

    bridge.close().await;
}

#[tokio::test]
async fn handshake_mismatch_fails_startup() {
    let config = BridgeConfig::new()
        .with_startup_grace(Duration::from_millis(100))
        .with_handshake(Handshake::new("init", "ready"));

    let result = Bridge::start(echo_worker(), config).await;
    assert!(matches!(result, Err(BridgeError::Startup(_))));
}

#[tokio::test]
async fn slower_request_does_not_block_faster_one() {
    let bridge = start().await;

    let started = Instant::now();
    let (first, second) = tokio::join!(
        bridge.send_and_wait("sleep:400:first", WAIT),
        async {
            let reply = bridge.send_and_wait("sleep:10:second", WAIT).await;
            (reply, started.elapsed())
        }
    );

    assert_eq!(first.unwrap(), "first");
    let (second, second_elapsed) = second;
    assert_eq!(second.unwrap(), "second");
    assert!(second_elapsed < Duration::from_millis(400), "{second_elapsed:?}");

    bridge.close().await;
}

#[tokio::test]
async fn many_concurrent_callers() {
    let bridge = Arc::new(start().await);

    let calls = (0..40).map(|i| {
        let bridge = Arc::clone(&bridge);
        tokio::spawn(async move {
            let payload = format!("sleep:{}:mol-{i}", (40 - i) * 2);
            bridge.send_and_wait(payload, WAIT).await
        })
    });

    for (i, joined) in join_all(calls).await.into_iter().enumerate() {
        assert_eq!(joined.unwrap().unwrap(), format!("mol-{i}"));
    }
    assert_eq!(bridge.pending_count(), 0);

    bridge.close().await;
}

#[tokio::test]
async fn timeout_then_recovery() {
    let bridge = start().await;

    let started = Instant::now();
    let result = bridge.send_and_wait("slow", Duration::from_millis(50)).await;
    assert!(matches!(result, Err(BridgeError::Timeout(_))));
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(bridge.pending_count(), 0);

    assert_eq!(bridge.send_and_wait("ping", WAIT).await.unwrap(), "pong");
    bridge.close().await;
}

#[tokio::test]
async fn garbage_output_is_skipped() {
    let bridge = start().await;

    assert_eq!(bridge.send_and_wait("garbage", WAIT).await.unwrap(), "garbage-ok");
    assert_eq!(bridge.send_and_wait("ping", WAIT).await.unwrap(), "pong");

    bridge.close().await;
}

#[tokio::test]
async fn crash_fails_pending_and_later_requests() {
    let bridge = Arc::new(start().await);

    let waiting = tokio::spawn({
        let bridge = Arc::clone(&bridge);
        async move { bridge.send_and_wait("silent", WAIT).await }
    });
    // Give the silent request time to reach the worker before it dies.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let crashed = bridge.send_and_wait("crash", WAIT).await;
    assert!(matches!(crashed, Err(BridgeError::WorkerExited(_))));
    assert!(matches!(waiting.await.unwrap(), Err(BridgeError::WorkerExited(_))));

    assert!(!bridge.is_running());
    assert!(matches!(
        bridge.send_and_wait("ping", WAIT).await,
        Err(BridgeError::WorkerExited(_))
    ));
    assert_eq!(bridge.status().state, ProcessState::Terminated);
}

#[tokio::test]
async fn close_releases_waiters() {
    let bridge = Arc::new(start().await);

    let waiting = tokio::spawn({
        let bridge = Arc::clone(&bridge);
        async move { bridge.send_and_wait("silent", WAIT).await }
    });
    tokio::time::sleep(Duration::from_millis(100)).await;

    bridge.close().await;
    assert!(matches!(waiting.await.unwrap(), Err(BridgeError::Closed)));
    assert!(matches!(
        bridge.send_and_wait("ping", WAIT).await,
        Err(BridgeError::Closed)
    ));
    assert!(!bridge.is_running());
}
