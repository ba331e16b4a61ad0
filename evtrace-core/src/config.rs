//! Configuration for the trace client
//!
//! [`TraceConfig`] is immutable once a client is built from it. It can be
//! deserialized (every field has a default), read from the environment, or
//! assembled with the builder methods.

use std::collections::BTreeSet;
use std::fmt;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use serde::de::{self, SeqAccess, Visitor};
use serde::{Deserialize, Deserializer, Serialize};

use crate::error::{Result, TraceError};
use crate::table::validate_table_name;

/// Main trace client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceConfig {
    /// Capacity of each table's ingestion queue, in events
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Tables that may be written. Accepts `"a,b,c"` or `["a", "b", "c"]`.
    #[serde(default, deserialize_with = "deserialize_tables")]
    pub tables: BTreeSet<String>,

    /// Directory holding one `<table>.jsonl` file per table
    #[serde(default = "default_trace_dir")]
    pub trace_dir: PathBuf,

    /// How long `close` waits for queues to drain, in milliseconds
    #[serde(default = "default_drain_timeout")]
    pub drain_timeout_ms: u64,

    /// Remote push configuration
    #[serde(default)]
    pub push: PushConfig,

    /// Address for the table pull server (disabled when unset)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pull_address: Option<SocketAddr>,
}

fn default_buffer_size() -> usize {
    1000
}

fn default_trace_dir() -> PathBuf {
    PathBuf::from("data").join("traces")
}

fn default_drain_timeout() -> u64 {
    5000
}

impl Default for TraceConfig {
    fn default() -> Self {
        Self {
            buffer_size: default_buffer_size(),
            tables: BTreeSet::new(),
            trace_dir: default_trace_dir(),
            drain_timeout_ms: default_drain_timeout(),
            push: PushConfig::default(),
            pull_address: None,
        }
    }
}

impl TraceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Read configuration from `EVTRACE_*` environment variables
    ///
    /// Unset or unparsable variables keep their defaults; the result is
    /// validated before it is returned.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();

        if let Some(size) = std::env::var("EVTRACE_BUFFER_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
        {
            config.buffer_size = size;
        }

        if let Ok(tables) = std::env::var("EVTRACE_TABLES") {
            config.tables = parse_table_list(&tables);
        }

        if let Ok(dir) = std::env::var("EVTRACE_DIR") {
            config.trace_dir = PathBuf::from(dir);
        }

        if let Ok(url) = std::env::var("EVTRACE_PUSH_URL") {
            config.push = config.push.url(url);
        }

        config.pull_address = std::env::var("EVTRACE_PULL_ADDRESS")
            .ok()
            .and_then(|v| v.parse().ok());

        config.validate()?;
        Ok(config)
    }

    /// Set the queue capacity per table
    pub fn buffer_size(mut self, size: usize) -> Self {
        self.buffer_size = size;
        self
    }

    /// Replace the table list with a comma-separated list
    pub fn tables(mut self, list: &str) -> Self {
        self.tables = parse_table_list(list);
        self
    }

    /// Register one more table
    pub fn with_table(mut self, table: impl Into<String>) -> Self {
        self.tables.insert(table.into());
        self
    }

    pub fn trace_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.trace_dir = dir.into();
        self
    }

    pub fn drain_timeout(mut self, timeout: Duration) -> Self {
        self.drain_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn push(mut self, push: PushConfig) -> Self {
        self.push = push;
        self
    }

    /// Set the collector URL; an empty string disables push
    pub fn push_url(mut self, url: impl Into<String>) -> Self {
        self.push = self.push.url(url);
        self
    }

    pub fn pull_address(mut self, addr: SocketAddr) -> Self {
        self.pull_address = Some(addr);
        self
    }

    pub fn drain_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    /// Check the configuration before a client is built from it
    pub fn validate(&self) -> Result<()> {
        if self.buffer_size == 0 {
            return Err(TraceError::InvalidConfig {
                reason: "buffer_size must be at least 1".to_string(),
            });
        }

        for table in &self.tables {
            validate_table_name(table)?;
        }

        if let Some(url) = self.push.push_url() {
            reqwest::Url::parse(url).map_err(|e| TraceError::InvalidConfig {
                reason: format!("push url '{}' is invalid: {}", url, e),
            })?;
        }

        if self.push.max_backoff_ms < self.push.initial_backoff_ms {
            return Err(TraceError::InvalidConfig {
                reason: "push max_backoff_ms must not be below initial_backoff_ms".to_string(),
            });
        }

        if self.push.batch_max_events == 0 {
            return Err(TraceError::InvalidConfig {
                reason: "push batch_max_events must be at least 1".to_string(),
            });
        }

        Ok(())
    }
}

/// Remote push configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Collector endpoint; `None` or empty leaves the pusher inert
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Pause between push passes, in milliseconds
    #[serde(default = "default_push_interval")]
    pub interval_ms: u64,

    /// Timeout of a single upload attempt, in milliseconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_ms: u64,

    /// First retry delay after a failed upload, in milliseconds
    #[serde(default = "default_initial_backoff")]
    pub initial_backoff_ms: u64,

    /// Upper bound of the retry delay, in milliseconds
    #[serde(default = "default_max_backoff")]
    pub max_backoff_ms: u64,

    /// Maximum envelopes per upload
    #[serde(default = "default_batch_max_events")]
    pub batch_max_events: usize,
}

fn default_push_interval() -> u64 {
    1000
}

fn default_request_timeout() -> u64 {
    10_000
}

fn default_initial_backoff() -> u64 {
    500
}

fn default_max_backoff() -> u64 {
    30_000
}

fn default_batch_max_events() -> usize {
    1000
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            url: None,
            interval_ms: default_push_interval(),
            request_timeout_ms: default_request_timeout(),
            initial_backoff_ms: default_initial_backoff(),
            max_backoff_ms: default_max_backoff(),
            batch_max_events: default_batch_max_events(),
        }
    }
}

impl PushConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        let url = url.into();
        self.url = if url.trim().is_empty() { None } else { Some(url) };
        self
    }

    pub fn interval(mut self, interval: Duration) -> Self {
        self.interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn backoff(mut self, initial: Duration, max: Duration) -> Self {
        self.initial_backoff_ms = initial.as_millis() as u64;
        self.max_backoff_ms = max.as_millis() as u64;
        self
    }

    pub fn batch_max_events(mut self, n: usize) -> Self {
        self.batch_max_events = n;
        self
    }

    /// The configured URL, ignoring blank values
    pub fn push_url(&self) -> Option<&str> {
        self.url.as_deref().filter(|u| !u.trim().is_empty())
    }

    pub fn is_enabled(&self) -> bool {
        self.push_url().is_some()
    }

    pub fn interval_duration(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }

    pub fn request_timeout_duration(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }
}

/// Split a comma-separated table list, dropping blanks and duplicates
pub fn parse_table_list(list: &str) -> BTreeSet<String> {
    list.split(',')
        .map(str::trim)
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

fn deserialize_tables<'de, D>(deserializer: D) -> std::result::Result<BTreeSet<String>, D::Error>
where
    D: Deserializer<'de>,
{
    struct TablesVisitor;

    impl<'de> Visitor<'de> for TablesVisitor {
        type Value = BTreeSet<String>;

        fn expecting(&self, f: &mut fmt::Formatter) -> fmt::Result {
            f.write_str("a comma-separated string or a list of table names")
        }

        fn visit_str<E: de::Error>(self, v: &str) -> std::result::Result<Self::Value, E> {
            Ok(parse_table_list(v))
        }

        fn visit_seq<A: SeqAccess<'de>>(
            self,
            mut seq: A,
        ) -> std::result::Result<Self::Value, A::Error> {
            let mut tables = BTreeSet::new();
            while let Some(table) = seq.next_element::<String>()? {
                let table = table.trim();
                if !table.is_empty() {
                    tables.insert(table.to_string());
                }
            }
            Ok(tables)
        }
    }

    deserializer.deserialize_any(TablesVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_table_list() {
        let tables = parse_table_list(" mempool_tx, votes,,mempool_tx ");
        assert_eq!(tables.len(), 2);
        assert!(tables.contains("mempool_tx"));
        assert!(tables.contains("votes"));
        assert!(parse_table_list("").is_empty());
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: TraceConfig = serde_json::from_value(json!({
            "tables": "cannal,votes"
        }))
        .unwrap();

        assert_eq!(config.buffer_size, 1000);
        assert_eq!(config.tables.len(), 2);
        assert!(!config.push.is_enabled());
        assert_eq!(config.push.initial_backoff_ms, 500);
        assert!(config.pull_address.is_none());
    }

    #[test]
    fn test_deserialize_table_array() {
        let config: TraceConfig = serde_json::from_value(json!({
            "buffer_size": 10,
            "tables": ["cannal", " votes "],
            "push": { "url": "http://localhost:42042/upload" }
        }))
        .unwrap();

        assert_eq!(config.buffer_size, 10);
        assert!(config.tables.contains("votes"));
        assert_eq!(config.push.push_url(), Some("http://localhost:42042/upload"));
        config.validate().unwrap();
    }

    #[test]
    fn test_empty_push_url_disables_push() {
        let push = PushConfig::new().url("   ");
        assert!(!push.is_enabled());

        let config: TraceConfig = serde_json::from_value(json!({
            "push": { "url": "" }
        }))
        .unwrap();
        assert!(!config.push.is_enabled());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        assert!(TraceConfig::new().buffer_size(0).validate().is_err());
        assert!(TraceConfig::new().tables("ok,../escape").validate().is_err());
        assert!(TraceConfig::new().push_url("not a url").validate().is_err());

        let push = PushConfig::new().backoff(Duration::from_secs(5), Duration::from_secs(1));
        assert!(TraceConfig::new().push(push).validate().is_err());

        assert!(TraceConfig::new().tables("cannal").validate().is_ok());
    }
}
