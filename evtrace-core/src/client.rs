//! The local trace client
//!
//! [`LocalClient`] owns everything a node needs to trace: the table registry,
//! one queue and writer thread per table (created lazily on first write), the
//! shared pusher thread and the optional pull server.
//!
//! ```text
//! Uninitialized ──new()──► Running ──close()──► Draining ──► Closed
//!                            │
//!                            └─ only state that accepts write()
//! ```

use std::collections::HashMap;
use std::fmt;
use std::fs::File;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use serde::de::DeserializeOwned;
use tracing::{debug, error, info, warn};

use crate::config::TraceConfig;
use crate::envelope::{Decoded, Envelope};
use crate::error::{Result, TraceError};
use crate::pusher::{CollectorTransport, PusherHandle, TransportSource};
use crate::queue::{EnqueueError, IngestQueue};
use crate::reader::{open_table, TableReader};
use crate::server::{PullServer, PullState};
use crate::table::{table_path, Event, TableRegistry};
use crate::writer::{open_log, TableLog, TableWriter};

/// Lifecycle state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientState {
    Uninitialized,
    Running,
    Draining,
    Closed,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ClientState::Uninitialized => "uninitialized",
            ClientState::Running => "running",
            ClientState::Draining => "draining",
            ClientState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Counters of one opened table
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableStats {
    pub table: String,
    /// Events accepted but not yet taken by the writer
    pub pending: usize,
    /// Queue capacity
    pub capacity: usize,
    /// Highest sequence persisted (0 = none)
    pub committed: u64,
    /// Highest sequence acknowledged by the collector (0 = none)
    pub pushed: u64,
    /// Why the table became unusable, if it did
    pub failure: Option<String>,
}

/// Snapshot of the whole client
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientStats {
    pub state: ClientState,
    /// Opened tables, sorted by name
    pub tables: Vec<TableStats>,
}

/// Minimal tracing surface a node depends on
///
/// Implemented by [`LocalClient`] and [`NoopTracer`], so a node can be handed
/// either one without knowing which.
pub trait Tracer: Send + Sync {
    /// Record an event in its table
    fn write<E: Event>(&self, event: E) -> Result<()>;

    /// Open a snapshot of a table
    fn read_table(&self, table: &str) -> Result<TableReader>;

    /// Whether writes to `table` are persisted
    fn is_collecting(&self, table: &str) -> bool;

    /// Flush and release all resources
    fn close(&self) -> Result<()>;
}

/// A tracer that accepts and discards everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopTracer;

impl Tracer for NoopTracer {
    fn write<E: Event>(&self, _event: E) -> Result<()> {
        Ok(())
    }

    fn read_table(&self, table: &str) -> Result<TableReader> {
        Err(TraceError::UnregisteredTable {
            table: table.to_string(),
        })
    }

    fn is_collecting(&self, _table: &str) -> bool {
        false
    }

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// Per-table resources, created on the first write to the table
struct OpenTable {
    log: Arc<TableLog>,
    queue: IngestQueue,
    writer: Mutex<TableWriter>,
}

enum TableSlot {
    Open(Arc<OpenTable>),
    /// The table file could not be opened; kept so we do not retry
    Failed(String),
}

impl TableSlot {
    fn handle(&self, table: &str) -> Result<Arc<OpenTable>> {
        match self {
            TableSlot::Open(open) => Ok(Arc::clone(open)),
            TableSlot::Failed(reason) => Err(TraceError::Io {
                table: table.to_string(),
                message: reason.clone(),
            }),
        }
    }
}

/// Local event-tracing client
///
/// # Example
///
/// ```rust,no_run
/// use evtrace_core::{Event, LocalClient, TraceConfig};
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct BlockCommitted {
///     height: u64,
/// }
///
/// impl Event for BlockCommitted {
///     fn table(&self) -> &str {
///         "blocks"
///     }
/// }
///
/// let config = TraceConfig::new().tables("blocks").trace_dir("/tmp/traces");
/// let client = LocalClient::new(config, "test_chain", "val-0").unwrap();
///
/// let sequence = client.write(BlockCommitted { height: 1 }).unwrap();
/// assert_eq!(sequence, 1);
///
/// client.close().unwrap();
/// ```
pub struct LocalClient {
    config: TraceConfig,
    registry: TableRegistry,
    chain_id: String,
    node_id: String,
    state: RwLock<ClientState>,
    tables: RwLock<HashMap<String, TableSlot>>,
    pusher: Mutex<Option<PusherHandle>>,
    server: Mutex<Option<PullServer>>,
}

impl LocalClient {
    /// Build a running client
    ///
    /// Starts the pusher when a push URL is configured and the pull server
    /// when a pull address is configured. No table file is touched until the
    /// first write to that table.
    pub fn new(
        config: TraceConfig,
        chain_id: impl Into<String>,
        node_id: impl Into<String>,
    ) -> Result<Self> {
        let source = config.push.push_url().map(|url| TransportSource::Http {
            url: url.to_string(),
            timeout: config.push.request_timeout_duration(),
        });
        Self::build(config, chain_id.into(), node_id.into(), source)
    }

    /// Build a running client that pushes through `transport`
    ///
    /// The configured push URL is ignored; push timing still comes from the
    /// configuration.
    pub fn with_transport<T>(
        config: TraceConfig,
        chain_id: impl Into<String>,
        node_id: impl Into<String>,
        transport: T,
    ) -> Result<Self>
    where
        T: CollectorTransport + 'static,
    {
        let source = TransportSource::Custom(Box::new(transport));
        Self::build(config, chain_id.into(), node_id.into(), Some(source))
    }

    fn build(
        config: TraceConfig,
        chain_id: String,
        node_id: String,
        push: Option<TransportSource>,
    ) -> Result<Self> {
        config.validate()?;
        let registry = TableRegistry::from_config(&config.tables)?;

        let client = Self {
            registry,
            chain_id,
            node_id,
            state: RwLock::new(ClientState::Uninitialized),
            tables: RwLock::new(HashMap::new()),
            pusher: Mutex::new(None),
            server: Mutex::new(None),
            config,
        };

        if let Some(source) = push {
            let pusher = PusherHandle::spawn(source, client.config.push.clone())?;
            *client.pusher.lock() = Some(pusher);
        }

        if let Some(addr) = client.config.pull_address {
            let state = PullState {
                trace_dir: client.config.trace_dir.clone(),
                registry: client.registry.clone(),
            };
            *client.server.lock() = Some(PullServer::start(addr, state)?);
        }

        *client.state.write() = ClientState::Running;
        info!(
            chain_id = %client.chain_id,
            node_id = %client.node_id,
            tables = client.registry.len(),
            trace_dir = %client.config.trace_dir.display(),
            push = client.config.push.is_enabled(),
            "trace client running"
        );

        Ok(client)
    }

    pub fn config(&self) -> &TraceConfig {
        &self.config
    }

    pub fn chain_id(&self) -> &str {
        &self.chain_id
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn state(&self) -> ClientState {
        *self.state.read()
    }

    /// Whether writes to `table` are persisted
    pub fn is_collecting(&self, table: &str) -> bool {
        self.registry.contains(table)
    }

    /// Address the pull server is bound to, if it runs
    pub fn pull_address(&self) -> Option<std::net::SocketAddr> {
        self.server.lock().as_ref().map(PullServer::addr)
    }

    /// Record an event in its table
    ///
    /// Returns the sequence number assigned to the event. Blocks while the
    /// table's queue is full; never waits on the network.
    ///
    /// # Errors
    ///
    /// - `UnregisteredTable` when the table is not configured (nothing is
    ///   queued and no file is created)
    /// - `Io` when the table file could not be opened or appended
    /// - `Encode` when the payload cannot be serialized (no sequence number
    ///   is consumed)
    /// - `NotRunning` once `close` has started
    pub fn write<E: Event>(&self, event: E) -> Result<u64> {
        let table = event.table();
        let (open, msg) = {
            // Held until the table is open so close() sees every opened table
            let state = self.state.read();
            if *state != ClientState::Running {
                return Err(TraceError::NotRunning { state: *state });
            }
            self.registry.check(table)?;

            let msg = serde_json::to_value(&event).map_err(|e| {
                warn!(table = %table, error = %e, "dropping trace event that failed to encode");
                TraceError::Encode {
                    table: table.to_string(),
                    reason: e.to_string(),
                }
            })?;
            (self.table_handle(table)?, msg)
        };

        if let Some(reason) = open.log.failure() {
            return Err(TraceError::Io {
                table: table.to_string(),
                message: reason,
            });
        }

        // A full queue parks us here without holding the state lock; close()
        // makes the enqueue give up with `Closed`
        let enqueued = open.queue.enqueue(|sequence| Envelope {
            chain_id: self.chain_id.clone(),
            node_id: self.node_id.clone(),
            table: table.to_string(),
            sequence,
            timestamp: Utc::now(),
            msg,
        });

        match enqueued {
            Ok(sequence) => Ok(sequence),
            Err(EnqueueError::Closed) => Err(TraceError::NotRunning {
                state: ClientState::Draining,
            }),
            Err(EnqueueError::Disconnected) => Err(TraceError::Io {
                table: table.to_string(),
                message: open
                    .log
                    .failure()
                    .unwrap_or_else(|| "table writer stopped".to_string()),
            }),
        }
    }

    /// Open a snapshot of `table`
    ///
    /// The snapshot sees everything committed before this call and nothing
    /// after it. Works in every state, also after `close`.
    pub fn read_table(&self, table: &str) -> Result<TableReader> {
        open_table(&self.config.trace_dir, &self.registry, table)
    }

    /// Snapshot and decode `table` in one step
    pub fn read_events<T: DeserializeOwned>(&self, table: &str) -> Result<Decoded<T>> {
        self.read_table(table)?.decode()
    }

    /// Highest persisted sequence of an opened table
    pub fn committed_sequence(&self, table: &str) -> Option<u64> {
        self.open_table_log(table).map(|log| log.committed())
    }

    /// Highest sequence the collector acknowledged for an opened table
    pub fn pushed_sequence(&self, table: &str) -> Option<u64> {
        self.open_table_log(table).map(|log| log.pushed())
    }

    pub fn stats(&self) -> ClientStats {
        let tables = self.tables.read();
        let mut stats: Vec<TableStats> = tables
            .iter()
            .map(|(name, slot)| match slot {
                TableSlot::Open(open) => TableStats {
                    table: name.clone(),
                    pending: open.queue.pending(),
                    capacity: open.queue.capacity(),
                    committed: open.log.committed(),
                    pushed: open.log.pushed(),
                    failure: open.log.failure(),
                },
                TableSlot::Failed(reason) => TableStats {
                    table: name.clone(),
                    pending: 0,
                    capacity: 0,
                    committed: 0,
                    pushed: 0,
                    failure: Some(reason.clone()),
                },
            })
            .collect();
        stats.sort_by(|a, b| a.table.cmp(&b.table));

        ClientStats {
            state: self.state(),
            tables: stats,
        }
    }

    /// Drain every queue, finish pushing and release all resources
    ///
    /// Writers get `drain_timeout` to persist what was queued; the pusher gets
    /// one more pass bounded by the request timeout. Calling `close` again is
    /// a no-op.
    ///
    /// # Errors
    ///
    /// `DrainTimeout` names the tables whose queues were not fully persisted
    /// in time. The client is closed regardless.
    pub fn close(&self) -> Result<()> {
        {
            let mut state = self.state.write();
            match *state {
                ClientState::Draining | ClientState::Closed => return Ok(()),
                _ => *state = ClientState::Draining,
            }
        }
        debug!("trace client draining");

        let deadline = Instant::now() + self.config.drain_timeout_duration();
        let open: Vec<Arc<OpenTable>> = self
            .tables
            .read()
            .values()
            .filter_map(|slot| match slot {
                TableSlot::Open(open) => Some(Arc::clone(open)),
                TableSlot::Failed(_) => None,
            })
            .collect();

        for table in &open {
            table.queue.close();
        }

        let mut undrained = Vec::new();
        for table in &open {
            if !table.writer.lock().wait_until(deadline) {
                warn!(
                    table = table.log.table(),
                    unpersisted = table
                        .queue
                        .last_sequence()
                        .saturating_sub(table.log.committed()),
                    committed = table.log.committed(),
                    "table did not drain before the shutdown deadline"
                );
                undrained.push(table.log.table().to_string());
            }
        }
        undrained.sort();

        if let Some(mut pusher) = self.pusher.lock().take() {
            let push_deadline = Instant::now() + self.config.push.request_timeout_duration();
            if !pusher.shutdown(push_deadline) {
                warn!("pusher did not finish its final pass before the deadline");
            }
        }

        if let Some(server) = self.server.lock().take() {
            server.shutdown();
        }

        *self.state.write() = ClientState::Closed;
        info!(tables = open.len(), undrained = undrained.len(), "trace client closed");

        if undrained.is_empty() {
            Ok(())
        } else {
            Err(TraceError::DrainTimeout { tables: undrained })
        }
    }

    /// Get the table's resources, opening them on first use
    ///
    /// The file is opened and scanned before the table map is locked, so a
    /// large existing file does not hold up writes to other tables.
    fn table_handle(&self, table: &str) -> Result<Arc<OpenTable>> {
        if let Some(slot) = self.tables.read().get(table) {
            return slot.handle(table);
        }

        let path = table_path(&self.config.trace_dir, table);
        let opened = open_log(&path);

        // Another writer may have opened the table meanwhile; its slot wins
        // and our file handle is dropped
        let mut tables = self.tables.write();
        let slot = tables
            .entry(table.to_string())
            .or_insert_with(|| self.start_table(table, path, opened));
        slot.handle(table)
    }

    fn start_table(
        &self,
        table: &str,
        path: PathBuf,
        opened: io::Result<(File, u64)>,
    ) -> TableSlot {
        let (file, last_sequence) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                error!(
                    table = %table,
                    path = %path.display(),
                    error = %e,
                    "failed to open trace table, table disabled"
                );
                return TableSlot::Failed(format!("open failed: {}", e));
            }
        };

        let log = Arc::new(TableLog::new(table, path, last_sequence));
        let (queue, receiver) = IngestQueue::bounded(self.config.buffer_size, last_sequence + 1);

        let writer = match TableWriter::spawn(Arc::clone(&log), file, receiver) {
            Ok(writer) => writer,
            Err(e) => {
                error!(table = %table, error = %e, "failed to start trace writer, table disabled");
                return TableSlot::Failed(format!("writer failed to start: {}", e));
            }
        };

        if let Some(pusher) = self.pusher.lock().as_ref() {
            pusher.track(Arc::clone(&log));
        }

        info!(table = %table, next_sequence = last_sequence + 1, "opened trace table");

        TableSlot::Open(Arc::new(OpenTable {
            log,
            queue,
            writer: Mutex::new(writer),
        }))
    }

    fn open_table_log(&self, table: &str) -> Option<Arc<TableLog>> {
        match self.tables.read().get(table) {
            Some(TableSlot::Open(open)) => Some(Arc::clone(&open.log)),
            _ => None,
        }
    }
}

impl Tracer for LocalClient {
    fn write<E: Event>(&self, event: E) -> Result<()> {
        LocalClient::write(self, event).map(|_| ())
    }

    fn read_table(&self, table: &str) -> Result<TableReader> {
        LocalClient::read_table(self, table)
    }

    fn is_collecting(&self, table: &str) -> bool {
        LocalClient::is_collecting(self, table)
    }

    fn close(&self) -> Result<()> {
        LocalClient::close(self)
    }
}

impl Drop for LocalClient {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            warn!(error = %e, "trace client closed with errors on drop");
        }
    }
}

impl fmt::Debug for LocalClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalClient")
            .field("chain_id", &self.chain_id)
            .field("node_id", &self.node_id)
            .field("state", &self.state())
            .field("tables", &self.registry.names())
            .finish()
    }
}
