//! Remote pusher
//!
//! A single background thread forwards committed lines of every table to a
//! remote collector. Each table has its own [`PushCursor`]; a failed upload
//! only delays that table, and local files are never touched.
//!
//! ```text
//! <table>.jsonl ──► read complete lines past cursor ──► CollectorTransport::upload
//!                                                           │
//!                         advance cursor ◄── 2xx ───────────┤
//!                         backoff (×2, capped) ◄── error ───┘
//! ```

use std::fs::File;
use std::io::{self, BufRead, BufReader, Seek, SeekFrom};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender};
use reqwest::header::CONTENT_TYPE;
use tracing::{debug, error, info, warn};

use crate::config::PushConfig;
use crate::envelope::decode_header;
use crate::error::{Result, TraceError};
use crate::writer::TableLog;

/// Content type of an uploaded batch
pub const BATCH_CONTENT_TYPE: &str = "application/x-ndjson";

/// Header naming the table a batch belongs to
pub const TABLE_HEADER: &str = "x-trace-table";

/// Something that can deliver a batch of envelope lines to a collector
///
/// `upload` returns `Ok` only when the collector acknowledged the whole batch.
/// Implementations are driven from the pusher thread only.
pub trait CollectorTransport: Send {
    /// Transport name for logs
    fn name(&self) -> &str;

    /// Deliver `batch` (complete JSONL lines) of `table`
    fn upload(&mut self, table: &str, batch: &[u8]) -> Result<()>;
}

/// Batched HTTP POST to a collector endpoint
pub struct HttpTransport {
    url: reqwest::Url,
    client: reqwest::blocking::Client,
}

impl HttpTransport {
    /// Build a transport whose every request is bounded by `timeout`
    ///
    /// Must not be called from inside an async runtime.
    pub fn new(url: &str, timeout: Duration) -> Result<Self> {
        let url = reqwest::Url::parse(url).map_err(|e| TraceError::InvalidConfig {
            reason: format!("push url '{}' is invalid: {}", url, e),
        })?;

        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TraceError::InvalidConfig {
                reason: format!("failed to build HTTP client: {}", e),
            })?;

        Ok(Self { url, client })
    }

    pub fn url(&self) -> &str {
        self.url.as_str()
    }
}

impl CollectorTransport for HttpTransport {
    fn name(&self) -> &str {
        "http"
    }

    fn upload(&mut self, table: &str, batch: &[u8]) -> Result<()> {
        let push_err = |reason: String| TraceError::Push {
            table: table.to_string(),
            reason,
        };

        let response = self
            .client
            .post(self.url.clone())
            .header(CONTENT_TYPE, BATCH_CONTENT_TYPE)
            .header(TABLE_HEADER, table)
            .body(batch.to_vec())
            .send()
            .map_err(|e| push_err(e.to_string()))?;

        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            Err(push_err(format!("collector answered {}", status)))
        }
    }
}

/// How the pusher thread obtains its transport
pub(crate) enum TransportSource {
    /// Built inside the pusher thread; the blocking client owns a runtime
    Http { url: String, timeout: Duration },
    Custom(Box<dyn CollectorTransport>),
}

impl TransportSource {
    fn build(self) -> Result<Box<dyn CollectorTransport>> {
        match self {
            TransportSource::Http { url, timeout } => {
                Ok(Box::new(HttpTransport::new(&url, timeout)?))
            }
            TransportSource::Custom(transport) => Ok(transport),
        }
    }
}

/// Push progress of one table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushCursor {
    /// Byte offset of the first line not yet acknowledged
    pub offset: u64,

    /// Sequence of the last acknowledged line (0 = none)
    pub last_sequence: u64,

    /// Consecutive failed uploads
    pub failures: u32,

    /// No attempt before this instant
    pub retry_at: Option<Instant>,
}

impl PushCursor {
    fn is_waiting(&self, now: Instant) -> bool {
        self.retry_at.map_or(false, |at| now < at)
    }
}

/// Delay before the next attempt after `failures` consecutive failures
pub fn backoff_delay(initial: Duration, max: Duration, failures: u32) -> Duration {
    let exponent = failures.saturating_sub(1).min(31);
    initial.saturating_mul(1u32 << exponent).min(max)
}

/// Complete lines read past a cursor
#[derive(Debug, Default)]
struct Batch {
    /// Non-blank lines, newline-terminated, exactly as on disk
    bytes: Vec<u8>,
    /// Bytes consumed from the file, blank lines included
    consumed: u64,
    lines: usize,
    last_sequence: Option<u64>,
}

fn read_batch(log: &TableLog, offset: u64, max_lines: usize) -> io::Result<Batch> {
    let mut file = File::open(log.path())?;
    file.seek(SeekFrom::Start(offset))?;
    let mut reader = BufReader::new(file);

    let mut batch = Batch::default();
    let mut line = Vec::new();

    while batch.lines < max_lines {
        line.clear();
        let n = reader.read_until(b'\n', &mut line)?;
        if n == 0 || line.last() != Some(&b'\n') {
            break;
        }
        batch.consumed += n as u64;

        let body = &line[..n - 1];
        if body.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        if let Ok(header) = decode_header(body) {
            batch.last_sequence = Some(header.sequence);
        }
        batch.bytes.extend_from_slice(&line);
        batch.lines += 1;
    }

    Ok(batch)
}

/// Push state for all tracked tables
pub(crate) struct Pusher {
    transport: Box<dyn CollectorTransport>,
    config: PushConfig,
    tables: Vec<(Arc<TableLog>, PushCursor)>,
}

impl Pusher {
    pub(crate) fn new(transport: Box<dyn CollectorTransport>, config: PushConfig) -> Self {
        Self {
            transport,
            config,
            tables: Vec::new(),
        }
    }

    /// Start pushing a table from the beginning of its file
    pub(crate) fn track(&mut self, log: Arc<TableLog>) {
        if self.tables.iter().any(|(l, _)| l.table() == log.table()) {
            return;
        }
        debug!(table = log.table(), transport = self.transport.name(), "tracking table for push");
        self.tables.push((log, PushCursor::default()));
    }

    #[cfg(test)]
    pub(crate) fn cursor(&self, table: &str) -> Option<&PushCursor> {
        self.tables
            .iter()
            .find(|(l, _)| l.table() == table)
            .map(|(_, c)| c)
    }

    /// One pass over every table
    ///
    /// With `force` set, tables waiting out a backoff get one attempt anyway.
    /// No batch is started past `deadline`.
    pub(crate) fn run_pass(&mut self, force: bool, deadline: Option<Instant>) {
        let Self {
            transport,
            config,
            tables,
        } = self;

        for (log, cursor) in tables.iter_mut() {
            if deadline.map_or(false, |d| Instant::now() >= d) {
                warn!(table = log.table(), "push deadline reached, skipping table");
                continue;
            }
            push_table(transport.as_mut(), config, log, cursor, force, deadline);
        }
    }
}

/// Upload batches of one table until it is caught up or an upload fails
fn push_table(
    transport: &mut dyn CollectorTransport,
    config: &PushConfig,
    log: &TableLog,
    cursor: &mut PushCursor,
    force: bool,
    deadline: Option<Instant>,
) {
    if !force && cursor.is_waiting(Instant::now()) {
        return;
    }

    loop {
        if log.committed() == cursor.last_sequence && cursor.last_sequence != 0 {
            return;
        }
        if deadline.map_or(false, |d| Instant::now() >= d) {
            warn!(
                table = log.table(),
                pushed = cursor.last_sequence,
                committed = log.committed(),
                "push deadline reached with lines left"
            );
            return;
        }

        let batch = match read_batch(log, cursor.offset, config.batch_max_events) {
            Ok(batch) => batch,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                warn!(table = log.table(), error = %e, "failed to read table for push");
                return;
            }
        };

        if batch.lines == 0 {
            cursor.offset += batch.consumed;
            return;
        }

        match transport.upload(log.table(), &batch.bytes) {
            Ok(()) => {
                cursor.offset += batch.consumed;
                if let Some(sequence) = batch.last_sequence {
                    cursor.last_sequence = sequence;
                    log.record_pushed(sequence);
                }
                if cursor.failures > 0 {
                    info!(
                        table = log.table(),
                        attempt = cursor.failures + 1,
                        "push recovered"
                    );
                }
                cursor.failures = 0;
                cursor.retry_at = None;
                debug!(
                    table = log.table(),
                    lines = batch.lines,
                    sequence = cursor.last_sequence,
                    "pushed batch"
                );

                if batch.lines < config.batch_max_events {
                    return;
                }
            }
            Err(e) => {
                cursor.failures = cursor.failures.saturating_add(1);
                let delay = backoff_delay(
                    config.initial_backoff(),
                    config.max_backoff(),
                    cursor.failures,
                );
                cursor.retry_at = Some(Instant::now() + delay);
                warn!(
                    table = log.table(),
                    attempt = cursor.failures,
                    backoff_ms = delay.as_millis() as u64,
                    error = %e,
                    "push failed, will retry"
                );
                return;
            }
        }
    }
}

enum PushCommand {
    Track(Arc<TableLog>),
    Shutdown { deadline: Instant },
}

/// Handle to the running pusher thread
pub(crate) struct PusherHandle {
    control: Sender<PushCommand>,
    done: Receiver<()>,
    handle: Option<JoinHandle<()>>,
}

impl PusherHandle {
    /// Start the pusher thread
    pub(crate) fn spawn(source: TransportSource, config: PushConfig) -> io::Result<Self> {
        let (control, commands) = channel::unbounded();
        let (done_tx, done) = channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name("evtrace-pusher".to_string())
            .spawn(move || {
                match source.build() {
                    Ok(transport) => run_pusher(Pusher::new(transport, config), &commands),
                    Err(e) => error!(error = %e, "failed to start push transport, push disabled"),
                }
                drop(done_tx);
            })?;

        Ok(Self {
            control,
            done,
            handle: Some(handle),
        })
    }

    /// Start pushing a newly opened table
    pub(crate) fn track(&self, log: Arc<TableLog>) {
        // A stopped pusher has nothing left to push to
        let _ = self.control.send(PushCommand::Track(log));
    }

    /// Ask for a final pass and wait for it until `deadline`
    ///
    /// Returns false if the pusher was still busy at `deadline`.
    pub(crate) fn shutdown(&mut self, deadline: Instant) -> bool {
        let _ = self.control.send(PushCommand::Shutdown { deadline });

        match self.done.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        error!("trace pusher thread panicked");
                    }
                }
                true
            }
        }
    }
}

fn run_pusher(mut pusher: Pusher, commands: &Receiver<PushCommand>) {
    let interval = pusher.config.interval_duration();
    let mut next_pass = Instant::now() + interval;

    loop {
        match commands.recv_deadline(next_pass) {
            Ok(PushCommand::Track(log)) => pusher.track(log),
            Ok(PushCommand::Shutdown { deadline }) => {
                // Tables opened just before shutdown may still be queued
                for command in commands.try_iter() {
                    if let PushCommand::Track(log) = command {
                        pusher.track(log);
                    }
                }
                pusher.run_pass(true, Some(deadline));
                debug!("pusher finished final pass");
                return;
            }
            Err(RecvTimeoutError::Timeout) => {
                pusher.run_pass(false, None);
                next_pass = Instant::now() + interval;
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}
