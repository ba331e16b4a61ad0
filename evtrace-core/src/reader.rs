//! Table reader and decoder
//!
//! A [`TableReader`] is an independent read-only handle whose readable length
//! is fixed when it is opened. Appends made afterwards are invisible to it and
//! it never takes a lock the writer needs.

use std::fs::File;
use std::io::{self, BufRead, BufReader, Read, Take};
use std::path::Path;

use serde::de::DeserializeOwned;
use tracing::debug;

use crate::envelope::{decode_line, DecodeFailure, Decoded};
use crate::error::{Result, TraceError};
use crate::table::{table_path, TableRegistry};

/// Snapshot of a table file
#[derive(Debug)]
pub struct TableReader {
    table: String,
    len: u64,
    inner: Take<File>,
}

impl TableReader {
    /// Open a snapshot of the file at `path`
    pub fn open(table: impl Into<String>, path: &Path) -> Result<Self> {
        let table = table.into();
        let file = match File::open(path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(TraceError::TableNotFound { table });
            }
            Err(e) => return Err(TraceError::io(&table, e)),
        };

        let len = file.metadata().map_err(|e| TraceError::io(&table, e))?.len();
        debug!(table = %table, bytes = len, "opened table snapshot");

        Ok(Self {
            table,
            len,
            inner: file.take(len),
        })
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    /// Bytes visible to this snapshot
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Decode the remaining snapshot into envelopes with payload type `T`
    pub fn decode<T: DeserializeOwned>(self) -> Result<Decoded<T>> {
        decode(self)
    }
}

impl Read for TableReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}

/// Open a snapshot of a registered table in `trace_dir`
pub(crate) fn open_table(
    trace_dir: &Path,
    registry: &TableRegistry,
    table: &str,
) -> Result<TableReader> {
    registry.check(table)?;
    TableReader::open(table, &table_path(trace_dir, table))
}

/// Decode a stream of envelope lines
///
/// Lines that do not parse as `Envelope<T>` are reported in
/// [`Decoded::skipped`] and decoding continues. Empty lines are ignored, as is
/// a final line without a terminating newline: that is an append still in
/// flight.
pub fn decode<T, R>(reader: R) -> Result<Decoded<T>>
where
    T: DeserializeOwned,
    R: Read,
{
    let mut reader = BufReader::new(reader);
    let mut decoded = Decoded::default();
    let mut buf = Vec::new();
    let mut line_no = 0usize;

    loop {
        buf.clear();
        if reader.read_until(b'\n', &mut buf)? == 0 {
            break;
        }
        if buf.last() != Some(&b'\n') {
            break;
        }
        line_no += 1;

        let line = match std::str::from_utf8(&buf) {
            Ok(line) => line,
            Err(e) => {
                decoded.skipped.push(DecodeFailure {
                    line: line_no,
                    reason: e.to_string(),
                });
                continue;
            }
        };

        if line.trim().is_empty() {
            continue;
        }

        match decode_line::<T>(line) {
            Ok(envelope) => decoded.events.push(envelope),
            Err(e) => decoded.skipped.push(DecodeFailure {
                line: line_no,
                reason: e.to_string(),
            }),
        }
    }

    if !decoded.skipped.is_empty() {
        debug!(skipped = decoded.skipped.len(), "skipped malformed trace lines");
    }

    Ok(decoded)
}

/// Decode a table file directly from its path
pub fn decode_file<T: DeserializeOwned>(path: &Path) -> Result<Decoded<T>> {
    let table = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    TableReader::open(table, path)?.decode()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{encode_line, Envelope};
    use chrono::Utc;
    use serde::{Deserialize, Serialize};
    use std::fs::{self, OpenOptions};
    use std::io::Write;
    use tempfile::tempdir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Vote {
        height: u64,
        round: u32,
    }

    fn line(sequence: u64) -> Vec<u8> {
        encode_line(&Envelope {
            chain_id: "c".to_string(),
            node_id: "n".to_string(),
            table: "votes".to_string(),
            sequence,
            timestamp: Utc::now(),
            msg: Vote {
                height: sequence * 10,
                round: 0,
            },
        })
        .unwrap()
    }

    #[test]
    fn test_decode_skips_malformed_lines() {
        let mut data = Vec::new();
        data.extend(line(1));
        data.extend(b"garbage\n");
        data.extend(b"\n");
        // Well-formed envelope whose payload does not fit the type
        let mismatched = concat!(
            r#"{"chain_id":"c","node_id":"n","table":"votes","sequence":9,"#,
            r#""timestamp":"2024-01-01T00:00:00Z","msg":{"city":"x"}}"#,
            "\n"
        );
        data.extend(mismatched.as_bytes());
        data.extend(line(2));

        let decoded: Decoded<Vote> = decode(data.as_slice()).unwrap();
        assert_eq!(decoded.events.len(), 2);
        assert_eq!(decoded.events[1].msg.height, 20);
        assert_eq!(decoded.skipped_count(), 2);
        assert_eq!(decoded.skipped[0].line, 2);
        assert_eq!(decoded.skipped[1].line, 4);
    }

    #[test]
    fn test_partial_tail_is_not_malformed() {
        let mut data = line(1);
        let partial = line(2);
        data.extend(&partial[..partial.len() / 2]);

        let decoded: Decoded<Vote> = decode(data.as_slice()).unwrap();
        assert_eq!(decoded.events.len(), 1);
        assert_eq!(decoded.skipped_count(), 0);
    }

    #[test]
    fn test_snapshot_ignores_later_appends() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("votes.jsonl");
        fs::write(&path, [line(1), line(2)].concat()).unwrap();

        let snapshot = TableReader::open("votes", &path).unwrap();
        assert_eq!(snapshot.table(), "votes");

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&line(3)).unwrap();

        let decoded: Decoded<Vote> = snapshot.decode().unwrap();
        assert_eq!(decoded.events.len(), 2);

        let fresh: Decoded<Vote> = decode_file(&path).unwrap();
        assert_eq!(fresh.events.len(), 3);
    }

    #[test]
    fn test_open_table_errors() {
        let dir = tempdir().unwrap();
        let registry = TableRegistry::new(["votes"]).unwrap();

        let err = open_table(dir.path(), &registry, "blocks").unwrap_err();
        assert_eq!(err.error_code(), "UNREGISTERED_TABLE");

        let err = open_table(dir.path(), &registry, "votes").unwrap_err();
        assert_eq!(err.error_code(), "TABLE_NOT_FOUND");

        fs::write(dir.path().join("votes.jsonl"), b"").unwrap();
        let reader = open_table(dir.path(), &registry, "votes").unwrap();
        assert!(reader.is_empty());
    }
}
