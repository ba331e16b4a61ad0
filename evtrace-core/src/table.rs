//! Table registry
//!
//! A table is a named category of trace events persisted to its own file.
//! Only tables listed in the configuration may be written; the registry
//! answers that question in O(1).

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{Result, TraceError};

/// File extension of table logs
pub const TABLE_FILE_EXTENSION: &str = "jsonl";

/// A payload that knows which table it belongs to
///
/// This is the only thing the client asks of a payload:
///
/// ```rust
/// use evtrace_core::Event;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct RoundStep {
///     height: u64,
///     round: u32,
/// }
///
/// impl Event for RoundStep {
///     fn table(&self) -> &str {
///         "consensus_round_state"
///     }
/// }
/// ```
pub trait Event: Serialize {
    /// Name of the table this event is written to
    fn table(&self) -> &str;
}

impl<E: Event + ?Sized> Event for &E {
    fn table(&self) -> &str {
        (**self).table()
    }
}

/// Set of tables permitted by configuration
#[derive(Debug, Clone, Default)]
pub struct TableRegistry {
    tables: HashSet<String>,
}

impl TableRegistry {
    /// Build a registry, rejecting names that cannot be used as file names
    pub fn new<I, S>(tables: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let mut set = HashSet::new();
        for table in tables {
            let table = table.into();
            validate_table_name(&table)?;
            set.insert(table);
        }
        Ok(Self { tables: set })
    }

    pub fn from_config(tables: &BTreeSet<String>) -> Result<Self> {
        Self::new(tables.iter().cloned())
    }

    pub fn contains(&self, table: &str) -> bool {
        self.tables.contains(table)
    }

    /// Fail with `UnregisteredTable` unless `table` is registered
    pub fn check(&self, table: &str) -> Result<()> {
        if self.contains(table) {
            Ok(())
        } else {
            Err(TraceError::UnregisteredTable {
                table: table.to_string(),
            })
        }
    }

    pub fn len(&self) -> usize {
        self.tables.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Registered table names in sorted order
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.tables.iter().cloned().collect();
        names.sort();
        names
    }
}

/// Path of a table's log inside the trace directory
pub fn table_path(trace_dir: &Path, table: &str) -> PathBuf {
    trace_dir.join(format!("{}.{}", table, TABLE_FILE_EXTENSION))
}

/// Table names become file names, so keep them to a safe alphabet
pub(crate) fn validate_table_name(table: &str) -> Result<()> {
    let valid = !table.is_empty()
        && !table.starts_with('.')
        && table
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));

    if valid {
        Ok(())
    } else {
        Err(TraceError::InvalidConfig {
            reason: format!(
                "table name '{}' must match [A-Za-z0-9_.-]+ and not start with '.'",
                table
            ),
        })
    }
}
