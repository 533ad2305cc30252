// ABOUTME: Library crate for hfingest, a high-frequency TCP packet ingest server and client
//
// Modules:
// - server: dispatcher, supervised worker pool and stats aggregation
// - client: connection retries, deadline-paced transmission, simulator
// - config: validated configuration loaded from TOML
// - net: socket tuning shared by both ends
// - backoff: retry delay schedule

pub mod backoff;
pub mod client;
pub mod config;
pub mod net;
pub mod server;
