// ABOUTME: Behavioral tests for client pacing, connect backoff and reconnection
//
// Covers:
// - 1000 pkt/s for 2s delivers 2000 packets within 5% with bounded gaps
// - three refused connects follow the 0.5s / 0.75s / 1.125s schedule
// - a reset connection is re-established mid-transmission
// - an unreachable server after a reset ends the session with an error
// - the simulator keeps the counters of a session that ended that way

use std::time::{Duration, Instant};

use hfingest::client::{
    Client, ClientError, ConnectionManager, RateConfig, RetryPolicy, Simulator,
};
use hfingest::config::ClientConfig;
use hfingest::net::DEFAULT_SOCKET_BUFFER;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;

use super::fixtures::{client_config, free_port, wait_until, SinkServer};

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_rate_fidelity_at_1000_pps() {
    let sink = SinkServer::start().await;
    let config = ClientConfig {
        target_rate: 1000.0,
        packet_size: 16,
        duration: Duration::from_secs(2),
        ..client_config(sink.port())
    };

    let mut client = Client::new("client_000", &config).unwrap();
    client.connect("127.0.0.1", sink.port()).await.unwrap();
    let result = client.transmit(config.duration).await.unwrap();
    client.disconnect().await;

    let nominal = RateConfig::from_config(&config).unwrap().batch_interval();
    assert_eq!(nominal, Duration::from_millis(5));

    assert!(
        (1900..=2100).contains(&result.packets_sent),
        "sent {} packets",
        result.packets_sent
    );
    assert!(
        result.max_batch_gap <= nominal * 2,
        "max gap {:?}",
        result.max_batch_gap
    );
    assert!(result.within_tolerance);
    assert_eq!(result.send_errors, 0);

    let expected = result.bytes_sent;
    let sink = &sink;
    assert!(wait_until(Duration::from_secs(2), || async move { sink.bytes() == expected }).await);
    assert_eq!(sink.connections(), 1);
}

#[tokio::test]
async fn test_connect_backoff_schedule() {
    let port = free_port();

    // Start listening after the third retry delay has begun
    let late_listener = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(1800)).await;
        let listener = TcpListener::bind(("127.0.0.1", port)).await.unwrap();
        let (stream, _) = listener.accept().await.unwrap();
        stream
    });

    let mut manager = ConnectionManager::new(RetryPolicy::default(), DEFAULT_SOCKET_BUFFER);
    let started = Instant::now();
    let established = manager.connect("127.0.0.1", port).await.unwrap();
    let elapsed = started.elapsed();

    assert_eq!(established.attempts, 4);
    assert_eq!(
        established.delays,
        vec![
            Duration::from_millis(500),
            Duration::from_millis(750),
            Duration::from_millis(1125),
        ]
    );
    assert!(elapsed >= Duration::from_micros(2_375_000), "elapsed {elapsed:?}");

    late_listener.await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_reset_connection_triggers_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // First connection is reset after a short read; later ones are drained
    let server = tokio::spawn(async move {
        let (mut first, _) = listener.accept().await.unwrap();
        let mut buf = vec![0u8; 64 * 1024];
        let _ = first.read(&mut buf).await;
        socket2::SockRef::from(&first)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(first);

        while let Ok((mut stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let mut buf = vec![0u8; 64 * 1024];
                while let Ok(n) = stream.read(&mut buf).await {
                    if n == 0 {
                        break;
                    }
                }
            });
        }
    });

    let mut client = Client::new("client_000", &client_config(port)).unwrap();
    client.connect("127.0.0.1", port).await.unwrap();
    let result = client.transmit(Duration::from_secs(1)).await.unwrap();
    client.disconnect().await;

    assert!(result.send_errors >= 1);
    assert_eq!(result.reconnects, result.send_errors);
    assert!(result.packets_sent > 0);

    server.abort();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_exhausted_reconnect_aborts_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Accept once, then reset the connection and stop listening
    let server = tokio::spawn(async move {
        let (first, _) = listener.accept().await.unwrap();
        drop(listener);
        tokio::time::sleep(Duration::from_millis(100)).await;
        socket2::SockRef::from(&first)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(first);
    });

    let config = ClientConfig {
        connect_attempts: 2,
        ..client_config(port)
    };
    let mut client = Client::new("client_000", &config).unwrap();
    client.connect("127.0.0.1", port).await.unwrap();
    server.await.unwrap();

    let err = client.transmit(Duration::from_secs(5)).await.unwrap_err();
    let (result, source) = match err {
        ClientError::SessionAborted { result, source } => (result, source),
        other => panic!("expected an aborted session, got {other:?}"),
    };
    assert!(matches!(*source, ClientError::ConnectExhausted { attempts: 2, .. }));
    assert!(!client.is_connected());
    assert!(result.send_errors >= 1);
    assert_eq!(result.send_errors, client.session().counters().send_errors);
    assert_eq!(result.reconnects, 0);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_simulator_counts_aborted_session() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();

    // Read for 300ms, stop listening, then reset the connection
    let server = tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        drop(listener);

        let deadline = tokio::time::Instant::now() + Duration::from_millis(300);
        let mut buf = vec![0u8; 64 * 1024];
        let mut received = 0u64;
        while let Ok(Ok(n)) = tokio::time::timeout_at(deadline, stream.read(&mut buf)).await {
            if n == 0 {
                break;
            }
            received += n as u64;
        }

        socket2::SockRef::from(&stream)
            .set_linger(Some(Duration::ZERO))
            .unwrap();
        drop(stream);
        received
    });

    let config = ClientConfig {
        connect_attempts: 2,
        ..client_config(port)
    };
    let summary = Simulator::new(config)
        .unwrap()
        .run(Duration::from_secs(5))
        .await
        .unwrap();
    let received = server.await.unwrap();

    assert_eq!(summary.aborted_clients, vec!["client_000".to_string()]);
    assert!(summary.failed_clients.is_empty());
    assert_eq!(summary.total_clients, 1);
    assert_eq!(summary.sessions[0].id, "client_000");
    assert!(received > 0);
    assert!(summary.total_packets > 0);
    assert!(summary.total_bytes >= received, "sent {} < received {received}", summary.total_bytes);
    assert!(summary.total_errors >= 1);
}
