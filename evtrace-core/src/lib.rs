//! # evtrace core - local event tracing for distributed nodes
//!
//! evtrace records structured diagnostic events of a node durably and lets
//! them be read while writing continues:
//!
//! - **Tables**: named event categories, each persisted to its own
//!   append-only `<table>.jsonl` file
//! - **Envelopes**: every event is wrapped with chain id, node id, table,
//!   per-table sequence number and timestamp
//! - **Push**: committed lines are forwarded in order to a remote collector,
//!   retried with backoff while it is unreachable
//!
//! ## Architecture
//!
//! ```text
//! write(event) ──► registry ──► per-table bounded queue ──► writer thread ──► <table>.jsonl
//!                                  (blocks when full)            │                │
//!                                                        committed sequence        │
//!                                                                ▼                ▼
//!                                                          pusher thread    read_table()
//!                                                                │          (snapshot)
//!                                                                ▼
//!                                                            collector
//! ```
//!
//! ## Example
//!
//! ```rust
//! use evtrace_core::{Event, LocalClient, TraceConfig};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Debug, Serialize, Deserialize, PartialEq)]
//! struct Cannal {
//!     #[serde(rename = "city")]
//!     ville: String,
//!     #[serde(rename = "length")]
//!     longueur: i64,
//! }
//!
//! impl Event for Cannal {
//!     fn table(&self) -> &str {
//!         "cannal"
//!     }
//! }
//!
//! let dir = tempfile::tempdir().unwrap();
//! let config = TraceConfig::new()
//!     .tables("cannal")
//!     .buffer_size(100)
//!     .trace_dir(dir.path());
//! let client = LocalClient::new(config, "test_chain", "test_node").unwrap();
//!
//! client.write(Cannal { ville: "Annecy".into(), longueur: 420 }).unwrap();
//! client.close().unwrap();
//!
//! let decoded = evtrace_core::decode::<Cannal, _>(client.read_table("cannal").unwrap()).unwrap();
//! assert_eq!(decoded.events[0].msg.ville, "Annecy");
//! assert_eq!(decoded.events[0].sequence, 1);
//! ```

pub mod client;
pub mod config;
pub mod envelope;
pub mod error;
pub mod pusher;
pub mod reader;
pub mod table;

mod queue;
mod server;
mod writer;

// Re-export main types
pub use client::{ClientState, ClientStats, LocalClient, NoopTracer, TableStats, Tracer};
pub use config::{parse_table_list, PushConfig, TraceConfig};
pub use envelope::{
    decode_header, decode_line, encode_line, DecodeFailure, Decoded, Envelope, EnvelopeHeader,
};
pub use error::{ErrorCategory, Result, TraceError};
pub use pusher::{backoff_delay, CollectorTransport, HttpTransport, PushCursor};
pub use reader::{decode, decode_file, TableReader};
pub use table::{table_path, Event, TableRegistry, TABLE_FILE_EXTENSION};

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct MempoolTx {
        hash: String,
        size: u32,
    }

    impl Event for MempoolTx {
        fn table(&self) -> &str {
            "mempool_tx"
        }
    }

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct RoundState {
        height: u64,
        round: u32,
        step: String,
    }

    impl Event for RoundState {
        fn table(&self) -> &str {
            "consensus_round_state"
        }
    }

    #[test]
    fn test_full_workflow() {
        let dir = tempdir().unwrap();
        let config = TraceConfig::new()
            .tables("mempool_tx,consensus_round_state")
            .buffer_size(16)
            .trace_dir(dir.path());
        let client = LocalClient::new(config, "test_chain", "val-0").unwrap();

        for i in 0..20u32 {
            client
                .write(MempoolTx {
                    hash: format!("{:08x}", i),
                    size: i * 100,
                })
                .unwrap();
        }
        client
            .write(RoundState {
                height: 7,
                round: 0,
                step: "propose".to_string(),
            })
            .unwrap();

        client.close().unwrap();

        let txs: Decoded<MempoolTx> = client.read_events("mempool_tx").unwrap();
        assert_eq!(txs.events.len(), 20);
        assert_eq!(txs.skipped_count(), 0);
        for (i, envelope) in txs.events.iter().enumerate() {
            assert_eq!(envelope.sequence, i as u64 + 1);
            assert_eq!(envelope.chain_id, "test_chain");
            assert_eq!(envelope.node_id, "val-0");
            assert_eq!(envelope.table, "mempool_tx");
        }

        let rounds: Decoded<RoundState> = client.read_events("consensus_round_state").unwrap();
        assert_eq!(rounds.events.len(), 1);
        assert_eq!(rounds.events[0].sequence, 1);
        assert_eq!(rounds.messages()[0].step, "propose");

        let stats = client.stats();
        assert_eq!(stats.state, ClientState::Closed);
        assert_eq!(stats.tables.len(), 2);
        assert_eq!(stats.tables[0].table, "consensus_round_state");
        assert_eq!(stats.tables[1].committed, 20);
    }

    #[test]
    fn test_tracer_seam() {
        fn record<T: Tracer>(tracer: &T) -> Result<()> {
            tracer.write(RoundState {
                height: 1,
                round: 0,
                step: "commit".to_string(),
            })
        }

        let dir = tempdir().unwrap();
        let config = TraceConfig::new()
            .tables("consensus_round_state")
            .trace_dir(dir.path());
        let client = LocalClient::new(config, "c", "n").unwrap();

        record(&client).unwrap();
        record(&NoopTracer).unwrap();
        assert!(Tracer::is_collecting(&client, "consensus_round_state"));
        assert!(!NoopTracer.is_collecting("consensus_round_state"));
        Tracer::close(&client).unwrap();
    }
}
