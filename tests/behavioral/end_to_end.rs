// ABOUTME: End-to-end tests running the packet client against the ingest server
//
// Covers:
// - every packet a client reports sent is counted by the server
// - simulator totals match server totals across concurrent clients
// - the round-robin and scored policies serve real traffic

use std::time::Duration;

use hfingest::client::{Client, Simulator};
use hfingest::config::{BalancePolicy, ClientConfig, ServerConfig};
use hfingest::server::Server;

use super::fixtures::{client_config, server_config, wait_until};

/// Wait until the server has closed `connections` connections and nothing is active
async fn settle(server: &Server, connections: u64) -> bool {
    wait_until(Duration::from_secs(3), || async move {
        let stats = server.flushed_stats().await;
        stats.connections_served == connections && stats.active_connections == 0
    })
    .await
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_single_client_packets_all_counted() {
    let server = Server::start(server_config()).await.unwrap();
    let port = server.local_addr().port();

    let config = ClientConfig {
        target_rate: 2000.0,
        duration: Duration::from_millis(500),
        ..client_config(port)
    };
    let mut client = Client::new("client_000", &config).unwrap();
    client.connect("127.0.0.1", port).await.unwrap();
    let result = client.transmit(config.duration).await.unwrap();
    client.disconnect().await;

    assert!(settle(&server, 1).await);
    let report = server.stop(Duration::from_secs(1)).await;

    assert_eq!(report.stats.total_packets, result.packets_sent);
    assert_eq!(report.stats.total_bytes, result.bytes_sent);
    assert_eq!(report.stats.errors, 0);
    assert!(report.drained);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_simulator_totals_match_server() {
    let server = Server::start(ServerConfig {
        worker_count: 4,
        ..server_config()
    })
    .await
    .unwrap();
    let port = server.local_addr().port();

    let config = ClientConfig {
        clients: 3,
        target_rate: 500.0,
        duration: Duration::from_millis(600),
        ..client_config(port)
    };
    let summary = Simulator::new(config)
        .unwrap()
        .run(Duration::from_millis(600))
        .await
        .unwrap();

    assert_eq!(summary.total_clients, 3);
    assert!(summary.failed_clients.is_empty());
    assert!(summary.aborted_clients.is_empty());
    let ids: Vec<_> = summary.sessions.iter().map(|s| s.id.as_str()).collect();
    assert_eq!(ids, vec!["client_000", "client_001", "client_002"]);

    assert!(settle(&server, 3).await);
    let report = server.stop(Duration::from_secs(1)).await;

    assert_eq!(report.stats.total_packets, summary.total_packets);
    assert_eq!(report.stats.total_bytes, summary.total_bytes);
    assert_eq!(report.stats.connections_served, 3);

    // Three concurrent connections spread across three distinct workers
    let busy = report
        .stats
        .workers
        .iter()
        .filter(|w| w.connections_served > 0)
        .count();
    assert_eq!(busy, 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_alternate_policies_serve_traffic() {
    for policy in [BalancePolicy::RoundRobin, BalancePolicy::Scored] {
        let server = Server::start(ServerConfig {
            policy,
            ..server_config()
        })
        .await
        .unwrap();
        let port = server.local_addr().port();

        let config = ClientConfig {
            target_rate: 1000.0,
            duration: Duration::from_millis(200),
            ..client_config(port)
        };
        let mut client = Client::new("client_000", &config).unwrap();
        client.connect("127.0.0.1", port).await.unwrap();
        let result = client.transmit(config.duration).await.unwrap();
        client.disconnect().await;

        assert!(settle(&server, 1).await);
        let report = server.stop(Duration::from_secs(1)).await;
        assert_eq!(report.stats.total_packets, result.packets_sent);
    }
}
