// ABOUTME: Behavioral tests for server admission, worker restart and shutdown
//
// Covers:
// - connections past the admission bound are closed and counted
// - a killed worker returns under the same id with its stats retained
// - stop() waits for an active connection to close
// - stop() forcibly ends a connection that outlives the drain timeout

use std::time::{Duration, Instant};

use hfingest::config::ServerConfig;
use hfingest::server::{Server, WorkerState};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use super::fixtures::{server_config, wait_until};

async fn read_eof(stream: &mut TcpStream) -> bool {
    let mut buf = [0u8; 16];
    matches!(
        tokio::time::timeout(Duration::from_secs(2), stream.read(&mut buf)).await,
        Ok(Ok(0) | Err(_))
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_connection_past_admission_bound_is_rejected() {
    let config = ServerConfig {
        worker_count: 1,
        max_clients: 2,
        ..server_config()
    };
    let server = Server::start(config).await.unwrap();
    let addr = server.local_addr();

    // First connection occupies the only worker
    let mut active = TcpStream::connect(addr).await.unwrap();
    active.write_all(&[0u8; 16]).await.unwrap();
    let record = std::sync::Arc::clone(&server.records()[0]);
    assert!(wait_until(Duration::from_secs(2), || {
        let record = std::sync::Arc::clone(&record);
        async move { record.is_active() }
    })
    .await);

    // Second waits in the queue, third exceeds max_clients
    let queued = TcpStream::connect(addr).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let mut rejected = TcpStream::connect(addr).await.unwrap();
    assert!(read_eof(&mut rejected).await);

    let stats = server.flushed_stats().await;
    assert_eq!(stats.rejected, 1);
    assert_eq!(stats.errors, 1);
    assert_eq!(stats.active_connections, 1);

    drop(active);
    drop(queued);
    server.stop(Duration::from_secs(2)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_killed_worker_restarts_with_same_id() {
    let server = Server::start(ServerConfig {
        worker_count: 2,
        ..server_config()
    })
    .await
    .unwrap();

    let srv = &server;
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(&[1u8; 160]).await.unwrap();
    assert!(wait_until(Duration::from_secs(2), || async move {
        srv.flushed_stats().await.total_packets == 10
    })
    .await);

    // Least-connections put the first connection on worker 0
    assert!(server.records()[0].is_active());
    assert!(server.kill_worker(0).await);
    assert_eq!(server.records()[0].state(), WorkerState::Dead);

    // One liveness interval is 100ms
    tokio::time::sleep(Duration::from_millis(250)).await;
    assert_eq!(server.records()[0].state(), WorkerState::Running);
    assert_eq!(server.records()[0].restarts(), 1);
    assert_eq!(server.records()[0].id(), 0);

    let stats = server.flushed_stats().await;
    assert_eq!(stats.restarts, 1);
    assert_eq!(stats.total_packets, 10);
    assert_eq!(stats.active_connections, 0);
    assert!(read_eof(&mut client).await);

    // The replacement serves new connections
    let mut next = TcpStream::connect(server.local_addr()).await.unwrap();
    next.write_all(&[2u8; 32]).await.unwrap();
    drop(next);
    assert!(wait_until(Duration::from_secs(2), || async move {
        srv.flushed_stats().await.total_packets == 12
    })
    .await);

    server.stop(Duration::from_secs(1)).await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_waits_for_active_connection() {
    let server = Server::start(server_config()).await.unwrap();
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(&[3u8; 64]).await.unwrap();

    let srv = &server;
    assert!(wait_until(Duration::from_secs(2), || async move {
        srv.records().iter().any(|r| r.is_active())
    })
    .await);
    let records: Vec<_> = server.records().to_vec();

    // Keep streaming for a while after stop begins, then close
    let streamer = tokio::spawn(async move {
        for _ in 0..6 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            client.write_all(&[3u8; 64]).await.unwrap();
        }
        drop(client);
    });

    let started = Instant::now();
    let report = server.stop(Duration::from_secs(5)).await;
    streamer.await.unwrap();

    assert!(report.drained);
    assert!(report.forced_workers.is_empty());
    assert!(started.elapsed() >= Duration::from_millis(250));
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(report.stats.total_packets, 28);
    assert_eq!(report.stats.active_connections, 0);
    assert!(records.iter().all(|r| r.state() != WorkerState::Running));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_forces_connection_after_drain_timeout() {
    let server = Server::start(server_config()).await.unwrap();
    let mut client = TcpStream::connect(server.local_addr()).await.unwrap();
    client.write_all(&[4u8; 16]).await.unwrap();

    let srv = &server;
    assert!(wait_until(Duration::from_secs(2), || async move {
        srv.records().iter().any(|r| r.is_active())
    })
    .await);
    let records: Vec<_> = server.records().to_vec();

    let started = Instant::now();
    let report = server.stop(Duration::from_millis(500)).await;

    assert!(!report.drained);
    assert_eq!(report.forced_workers.len(), 1);
    assert!(started.elapsed() >= Duration::from_millis(500));
    assert!(started.elapsed() < Duration::from_secs(3));
    assert_eq!(report.stats.active_connections, 0);
    assert!(records.iter().all(|r| r.state() == WorkerState::Dead));
    assert!(read_eof(&mut client).await);
}
