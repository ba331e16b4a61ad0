//! Envelope types and the line codec
//!
//! Every persisted event is wrapped in an [`Envelope`] and written as one JSON
//! object per line. JSON escapes embedded newlines, so a line is always a
//! complete, self-contained record.
//!
//! ```text
//! {"chain_id":"test_chain","node_id":"val-0","table":"cannal","sequence":1,"timestamp":"...","msg":{...}}
//! ```

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Metadata-wrapped unit persisted per event
///
/// Field order is fixed: chain id, node id, table, sequence, timestamp, payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope<T> {
    /// Chain the node belongs to
    pub chain_id: String,

    /// Node that recorded the event
    pub node_id: String,

    /// Table the event was written to
    pub table: String,

    /// Per-table sequence number, starting at 1
    pub sequence: u64,

    /// Wall-clock time the write was accepted
    pub timestamp: DateTime<Utc>,

    /// Caller-supplied payload
    pub msg: T,
}

/// Envelope as it travels through the queue, payload already serialized
pub(crate) type RawEnvelope = Envelope<Value>;

/// Envelope metadata without the payload
///
/// Parsing only the header is enough to recover sequence numbers and push
/// cursors without knowing the payload type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EnvelopeHeader {
    pub chain_id: String,
    pub node_id: String,
    pub table: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
}

/// A line that could not be decoded into the requested payload type
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodeFailure {
    /// 1-based line number in the table file
    pub line: usize,

    /// Parser message
    pub reason: String,
}

/// Result of decoding a table snapshot
#[derive(Debug, Clone)]
pub struct Decoded<T> {
    /// Envelopes in commit order
    pub events: Vec<Envelope<T>>,

    /// Lines that were skipped because they did not parse
    pub skipped: Vec<DecodeFailure>,
}

impl<T> Decoded<T> {
    /// Number of skipped lines
    pub fn skipped_count(&self) -> usize {
        self.skipped.len()
    }

    /// Payloads only, in commit order
    pub fn messages(self) -> Vec<T> {
        self.events.into_iter().map(|e| e.msg).collect()
    }
}

impl<T> Default for Decoded<T> {
    fn default() -> Self {
        Self {
            events: Vec::new(),
            skipped: Vec::new(),
        }
    }
}

/// Serialize an envelope as one line, trailing newline included
pub fn encode_line<T: Serialize>(envelope: &Envelope<T>) -> serde_json::Result<Vec<u8>> {
    let mut line = serde_json::to_vec(envelope)?;
    line.push(b'\n');
    Ok(line)
}

/// Parse a single line into an envelope with payload type `T`
pub fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<Envelope<T>> {
    serde_json::from_str(line.trim_end_matches(['\n', '\r']))
}

/// Parse only the envelope metadata of a line
pub fn decode_header(line: &[u8]) -> serde_json::Result<EnvelopeHeader> {
    serde_json::from_slice(line)
}
