//! Persistence writer
//!
//! One writer thread per table drains the table's ingestion queue and appends
//! each envelope as a line to `<trace_dir>/<table>.jsonl`. The file is opened
//! once in append mode and never truncated. After every successful append the
//! writer publishes the committed sequence, which is all the pusher needs to
//! know about the writer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Receiver, RecvTimeoutError};
use parking_lot::RwLock;
use tracing::{debug, error, warn};

use crate::envelope::{decode_header, encode_line, RawEnvelope};

/// State of one table shared between the client, its writer and the pusher
#[derive(Debug)]
pub(crate) struct TableLog {
    table: String,
    path: PathBuf,

    /// Highest sequence appended and flushed (0 = none yet)
    committed: AtomicU64,

    /// Highest sequence acknowledged by the collector (0 = none yet)
    pushed: AtomicU64,

    /// Set once the table became unusable
    failure: RwLock<Option<String>>,

    /// Held by a test to stall the writer before its next append
    #[cfg(test)]
    pub(crate) stall: parking_lot::Mutex<()>,
}

impl TableLog {
    pub(crate) fn new(table: impl Into<String>, path: PathBuf, committed: u64) -> Self {
        Self {
            table: table.into(),
            path,
            committed: AtomicU64::new(committed),
            pushed: AtomicU64::new(0),
            failure: RwLock::new(None),
            #[cfg(test)]
            stall: parking_lot::Mutex::new(()),
        }
    }

    pub(crate) fn table(&self) -> &str {
        &self.table
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    pub(crate) fn committed(&self) -> u64 {
        self.committed.load(Ordering::Acquire)
    }

    pub(crate) fn pushed(&self) -> u64 {
        self.pushed.load(Ordering::Acquire)
    }

    pub(crate) fn record_pushed(&self, sequence: u64) {
        self.pushed.fetch_max(sequence, Ordering::AcqRel);
    }

    pub(crate) fn record_committed(&self, sequence: u64) {
        self.committed.store(sequence, Ordering::Release);
    }

    /// Mark the table unusable for the rest of the client's lifetime
    pub(crate) fn mark_failed(&self, reason: impl Into<String>) {
        let mut failure = self.failure.write();
        if failure.is_none() {
            *failure = Some(reason.into());
        }
    }

    pub(crate) fn failure(&self) -> Option<String> {
        self.failure.read().clone()
    }
}

/// What a scan of an existing table file found
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub(crate) struct LogScan {
    /// Highest sequence among well-formed lines (0 = none)
    pub last_sequence: u64,

    /// Complete lines whose header could not be parsed
    pub corrupt_lines: usize,

    /// The file ends in a partial line left by an interrupted append
    pub torn_tail: bool,
}

/// Scan a table file to find where its sequence left off
///
/// A missing file scans as empty.
pub(crate) fn scan_log(path: &Path) -> io::Result<LogScan> {
    let file = match File::open(path) {
        Ok(file) => file,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(LogScan::default()),
        Err(e) => return Err(e),
    };

    let mut reader = BufReader::new(file);
    let mut scan = LogScan::default();
    let mut line = Vec::new();

    loop {
        line.clear();
        if reader.read_until(b'\n', &mut line)? == 0 {
            break;
        }

        if line.last() != Some(&b'\n') {
            scan.torn_tail = true;
            break;
        }

        let body = &line[..line.len() - 1];
        if body.iter().all(u8::is_ascii_whitespace) {
            continue;
        }

        match decode_header(body) {
            Ok(header) => scan.last_sequence = scan.last_sequence.max(header.sequence),
            Err(_) => scan.corrupt_lines += 1,
        }
    }

    Ok(scan)
}

/// Open a table file for appending, creating it and its directory if needed
///
/// Returns the file and the last sequence already persisted in it. A torn
/// last line is terminated so that the next append starts on a fresh line.
pub(crate) fn open_log(path: &Path) -> io::Result<(File, u64)> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }

    let scan = scan_log(path)?;
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;

    if scan.torn_tail {
        warn!(path = %path.display(), "terminating partial line left by an interrupted append");
        file.write_all(b"\n")?;
        file.flush()?;
    }
    if scan.corrupt_lines > 0 {
        warn!(
            path = %path.display(),
            corrupt_lines = scan.corrupt_lines,
            "table file contains unparsable lines"
        );
    }

    Ok((file, scan.last_sequence))
}

/// Handle to a running writer thread
pub(crate) struct TableWriter {
    handle: Option<JoinHandle<()>>,

    /// Disconnects when the writer thread exits
    done: Receiver<()>,
}

impl TableWriter {
    /// Start the writer thread for `log`, draining `queue` into `file`
    pub(crate) fn spawn(
        log: Arc<TableLog>,
        file: File,
        queue: Receiver<RawEnvelope>,
    ) -> io::Result<Self> {
        let (done_tx, done) = channel::bounded::<()>(1);

        let handle = thread::Builder::new()
            .name(format!("evtrace-writer-{}", log.table()))
            .spawn(move || {
                run_writer(&log, BufWriter::new(file), &queue);
                drop(done_tx);
            })?;

        Ok(Self {
            handle: Some(handle),
            done,
        })
    }

    /// Wait for the writer to drain its queue and exit
    ///
    /// Returns false if it was still running at `deadline`. The queue must
    /// have been closed beforehand or this only ever times out.
    pub(crate) fn wait_until(&mut self, deadline: Instant) -> bool {
        match self.done.recv_deadline(deadline) {
            Err(RecvTimeoutError::Timeout) => false,
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                if let Some(handle) = self.handle.take() {
                    if handle.join().is_err() {
                        error!("trace writer thread panicked");
                    }
                }
                true
            }
        }
    }
}

/// The writer loop: one envelope, one line, one flush
fn run_writer(log: &TableLog, mut out: BufWriter<File>, queue: &Receiver<RawEnvelope>) {
    for envelope in queue.iter() {
        let line = match encode_line(&envelope) {
            Ok(line) => line,
            Err(e) => {
                warn!(
                    table = log.table(),
                    sequence = envelope.sequence,
                    error = %e,
                    "dropping trace event that failed to encode"
                );
                continue;
            }
        };

        #[cfg(test)]
        drop(log.stall.lock());

        if let Err(e) = out.write_all(&line).and_then(|_| out.flush()) {
            let discarded = queue.try_iter().count();
            error!(
                table = log.table(),
                sequence = envelope.sequence,
                discarded,
                error = %e,
                "failed to append trace event, table disabled"
            );
            log.mark_failed(format!("append failed: {}", e));
            return;
        }

        log.record_committed(envelope.sequence);
    }

    debug!(
        table = log.table(),
        committed = log.committed(),
        "trace writer drained"
    );
}
