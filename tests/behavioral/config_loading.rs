// ABOUTME: Behavioral tests for TOML configuration driving live components

use std::io::Write;
use std::time::Duration;

use hfingest::config::{BalancePolicy, Config, ConfigError};
use hfingest::server::Server;
use pretty_assertions::assert_eq;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(content.as_bytes()).unwrap();
    file
}

#[tokio::test]
async fn test_server_starts_from_config_file() {
    let file = write_config(
        r#"
        [server]
        port = 0
        worker_count = 3
        max_clients = 6
        policy = "scored"
        stats_interval = 0.0
        queue_wait = 0.05
        "#,
    );

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.server.policy, BalancePolicy::Scored);
    assert_eq!(config.server.queue_capacity(), 2);

    let server = Server::start(config.server).await.unwrap();
    assert_eq!(server.records().len(), 3);
    assert_eq!(server.config().worker_count, 3);

    let report = server.stop(Duration::from_secs(1)).await;
    assert!(report.drained);
    assert_eq!(report.stats.workers.len(), 3);
}

#[test]
fn test_client_section_defaults_and_overrides() {
    let file = write_config(
        r#"
        [client]
        host = "ingest.local"
        target_rate = 2500.0
        packet_size = 32
        connect_timeout = 0.25
        "#,
    );

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.client.host, "ingest.local");
    assert_eq!(config.client.packet_size, 32);
    assert_eq!(config.client.connect_timeout, Duration::from_millis(250));
    assert_eq!(config.client.connect_attempts, 10);
    assert_eq!(config.server.port, 8888);
}

#[test]
fn test_unknown_policy_is_a_parse_error() {
    let file = write_config("[server]\npolicy = \"random\"\n");
    let err = Config::load(file.path()).unwrap_err();
    assert!(matches!(err, ConfigError::Parse { .. }));
}
