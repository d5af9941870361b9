//! # pgload Core - Shared Types and Traits
//!
//! This crate provides the foundational types, traits, and abstractions for the
//! pgload bulk loading pipeline. It defines the row messaging system, the source
//! reader interface, the load-command configuration structures, and the error
//! types used throughout the workspace.
//!
//! ## Key Components
//!
//! - **Row Messaging**: bounded single-producer/single-consumer hand-off between
//!   a source reader and the PostgreSQL sink
//! - **Source Trait**: the capability set every source format implements
//!   (name, discovered columns, row streaming)
//! - **Configuration**: YAML-based load specification and option flags
//! - **Error Handling**: one `LoadError` variant per failure class, so the
//!   orchestrator can decide locally whether to continue or propagate
//!
//! ## Example Usage
//!
//! ```rust
//! use pgload_core::{row_channel, Message, SqlValue};
//!
//! # async fn example() -> anyhow::Result<()> {
//! let (tx, mut rx) = row_channel(10);
//! tx.send(Message::Row(vec![SqlValue::Integer(1)])).await?;
//! tx.send(Message::Eos).await?;
//! # Ok(())
//! # }
//! ```

use async_trait::async_trait;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub mod filter;
pub mod stats;

pub use filter::TableFilter;
pub use stats::{PgState, StateBundle};

/// A single raw value produced by a source reader.
///
/// Values stay in this shape from the reader through the row queue; the sink
/// applies the column's transform and the COPY text escaping on the way out.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Boolean(bool),
    Integer(i64),
    Real(f64),
    Text(String),
    Bytes(Vec<u8>),
    Date(NaiveDate),
}

/// One source row, in the column order the reader declared.
pub type Row = Vec<SqlValue>;

/// Messages passed from a source reader to the PostgreSQL sink.
#[derive(Debug, Clone)]
pub enum Message {
    /// A single row of raw source values.
    Row(Row),

    /// End-of-stream marker.
    ///
    /// Signals that the reader is done; the sink finishes the COPY stream and
    /// commits once it observes this (or the channel closes).
    Eos,
}

/// Sender half of the reader→sink row queue.
pub type RowTx = mpsc::Sender<Message>;

/// Receiver half of the reader→sink row queue.
pub type RowRx = mpsc::Receiver<Message>;

/// Default bounded capacity of the row queue (`concurrent_batches`).
pub const DEFAULT_CONCURRENT_BATCHES: usize = 10;

/// Create the bounded reader→sink row queue.
///
/// The fixed capacity is the backpressure mechanism: the sink's speed bounds
/// the reader's speed without unbounded buffering. `send` suspends when the
/// queue is full, `recv` when it is empty.
pub fn row_channel(capacity: usize) -> (RowTx, RowRx) {
    mpsc::channel(capacity.max(1))
}

/// Text encodings the DBF reader understands.
///
/// Enumerating every legacy code page is glue outside the core; these cover
/// the common artifacts, decoding lossily rather than failing a load over a
/// stray byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TextEncoding {
    #[default]
    Utf8,
    Latin1,
}

impl TextEncoding {
    pub fn parse(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "utf-8" | "utf8" => Some(TextEncoding::Utf8),
            "latin1" | "latin-1" | "iso-8859-1" => Some(TextEncoding::Latin1),
            _ => None,
        }
    }

    pub fn decode(&self, bytes: &[u8]) -> String {
        match self {
            TextEncoding::Utf8 => String::from_utf8_lossy(bytes).into_owned(),
            TextEncoding::Latin1 => bytes.iter().map(|&b| b as char).collect(),
        }
    }
}

/// Source type tag for a discovered column, covering both input formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceType {
    /// DBF `C` fields: fixed-width, right-padded with spaces.
    DbfCharacter,
    /// DBF `N` fields: numeric text, left-padded with spaces.
    DbfNumeric,
    /// DBF `L` fields: one of `YyTt`, `NnFf`, or `?`/blank for unknown.
    DbfLogical,
    /// DBF `D` fields: eight bytes, `YYYYMMDD`.
    DbfDate,
    /// DBF `M` memo fields, loaded as text.
    DbfMemo,
    SqliteInteger,
    SqliteReal,
    SqliteText,
    SqliteBlob,
    SqliteNumeric,
    /// Anything neither format mapping recognizes; loads as text, identity.
    Other,
}

/// A discovered source column. Immutable after discovery.
#[derive(Debug, Clone)]
pub struct Column {
    pub name: String,
    pub ty: SourceType,
    /// Declared byte length, where the format carries one (DBF).
    pub length: Option<usize>,
    pub nullable: bool,
    /// True for a SQLite INTEGER PRIMARY KEY column; maps to `bigserial` so
    /// the target table gets a sequence worth resetting after the copy.
    pub serial: bool,
}

impl Column {
    pub fn new(name: impl Into<String>, ty: SourceType) -> Self {
        Self {
            name: name.into(),
            ty,
            length: None,
            nullable: true,
            serial: false,
        }
    }

    pub fn with_length(mut self, length: usize) -> Self {
        self.length = Some(length);
        self
    }

    pub fn with_serial(mut self, serial: bool) -> Self {
        self.serial = serial;
        self
    }
}

/// An index discovered on a source table, recreated on the target after the
/// owning table's copy begins.
#[derive(Debug, Clone)]
pub struct Index {
    pub name: String,
    pub table: String,
    pub columns: Vec<String>,
    pub unique: bool,
    /// Optional partial-index predicate, passed through verbatim.
    pub predicate: Option<String>,
}

/// Error types for pgload pipeline operations.
///
/// Each variant corresponds to one failure class with its own propagation
/// policy: per-table failures end that table's reader/sink pair, schema
/// failures abort the run, index and sequence failures are logged and the run
/// continues.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    /// The peer end of a row queue vanished mid-copy.
    #[error("channel closed: {0}")]
    ChannelClosed(&'static str),

    /// Malformed header or truncated record in a source artifact.
    /// Fatal for that table.
    #[error("malformed {format} source: {reason}")]
    SourceFormat {
        format: &'static str,
        reason: String,
    },

    /// A source-side read step failed. Recoverable: the table's counters get
    /// one error, the sink is ended, and other tables proceed.
    #[error("source query failed on {table}: {reason}")]
    SourceQuery { table: String, reason: String },

    /// Transaction or COPY stream failure. Fatal for that table; the
    /// transaction is rolled back.
    #[error("sink failed on {table} near row {row}: {reason}")]
    Sink {
        table: String,
        row: u64,
        reason: String,
    },

    /// A DDL statement failed during the schema phase. Fatal for the run.
    #[error("schema statement failed: {0}")]
    Schema(String),

    /// A single index build failed. Recoverable.
    #[error("index {index} on {table} failed: {reason}")]
    Index {
        table: String,
        index: String,
        reason: String,
    },

    /// A single sequence reset failed. Recoverable.
    #[error("sequence reset failed on {table}: {reason}")]
    Sequence { table: String, reason: String },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl LoadError {
    /// Whether this error must abort the whole run rather than a single
    /// table, index, or sequence.
    pub fn is_fatal(&self) -> bool {
        matches!(self, LoadError::Schema(_))
    }
}

/// The capability set every source format implements.
///
/// A source owns its file or database handle for the duration of iteration
/// and releases it on normal end, on consumer cancellation, or on any error.
#[async_trait]
pub trait Source: Send {
    /// Source-side name of the relation being read.
    fn name(&self) -> &str;

    /// Discovered columns, in the exact order `run` emits values.
    fn columns(&self) -> &[Column];

    /// Stream every row into `tx` followed by [`Message::Eos`], returning the
    /// number of rows emitted.
    ///
    /// On cancellation the reader stops at its next suspension point, drops
    /// its handle, and returns the count emitted so far.
    async fn run(&mut self, tx: RowTx, cancel: CancellationToken) -> Result<u64, LoadError>;
}

/// Complete load specification, parsed from a YAML command file.
///
/// # Example
///
/// ```yaml
/// name: "nightly-import"
/// source:
///   type: sqlite
///   path: "data/app.db"
/// target:
///   conninfo: "host=localhost user=loader dbname=warehouse"
/// options:
///   create_tables: true
///   excluding: ["audit*"]
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadSpec {
    /// Human-readable name for the run; used to label the summary.
    #[serde(default)]
    pub name: Option<String>,

    pub source: SourceSpec,

    pub target: TargetSpec,

    #[serde(default)]
    pub options: LoadOptions,
}

impl LoadSpec {
    /// Parse a load command file.
    pub fn from_path(path: &Path) -> anyhow::Result<Self> {
        let y = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&y)?)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SourceSpec {
    #[serde(rename = "dbf")]
    Dbf(DbfSourceSpec),
    #[serde(rename = "sqlite")]
    Sqlite(SqliteSourceSpec),
}

/// A single DBF file to load into a single target table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DbfSourceSpec {
    pub path: String,

    /// Target table name. Defaults to the file's base name, lowercased.
    #[serde(default)]
    pub table: Option<String>,
}

/// A SQLite database file; every user table is a load candidate, subject to
/// the table filter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SqliteSourceSpec {
    pub path: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    /// Standard PostgreSQL connection string.
    pub conninfo: String,
}

/// Option flags controlling a run. Field names match the command-file keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoadOptions {
    /// Skip the schema phase entirely; copy into preexisting tables.
    pub data_only: bool,

    /// Run the schema phase (and sequence resets) but copy no data.
    pub schema_only: bool,

    /// TRUNCATE preexisting target tables before copying. Never applied to a
    /// table created in the same run.
    pub truncate: bool,

    pub create_tables: bool,

    pub create_indexes: bool,

    /// Emit `DROP TABLE IF EXISTS` before each `CREATE TABLE`.
    pub include_drop: bool,

    pub reset_sequences: bool,

    /// Exact table names to load; empty means all.
    pub only_tables: Vec<String>,

    /// Glob patterns a table must match (any) to be selected; empty means all.
    pub including: Vec<String>,

    /// Glob patterns that deselect a table (any match).
    pub excluding: Vec<String>,

    /// Bounded capacity of each reader→sink row queue.
    pub concurrent_batches: usize,
}

impl Default for LoadOptions {
    fn default() -> Self {
        Self {
            data_only: false,
            schema_only: false,
            truncate: false,
            create_tables: true,
            create_indexes: true,
            include_drop: false,
            reset_sequences: true,
            only_tables: vec![],
            including: vec![],
            excluding: vec![],
            concurrent_batches: DEFAULT_CONCURRENT_BATCHES,
        }
    }
}

/// Per-run environment, threaded explicitly through the orchestrator instead
/// of living in process-wide globals.
#[derive(Debug, Clone)]
pub struct RunContext {
    /// Output directory for rejected-row files.
    pub root_dir: PathBuf,

    /// Optional file the final summary is also written to.
    pub summary_path: Option<PathBuf>,

    /// Character encoding of DBF text fields.
    pub encoding: TextEncoding,

    /// Row queue capacity for each table copy.
    pub concurrent_batches: usize,
}

impl Default for RunContext {
    fn default() -> Self {
        Self {
            root_dir: PathBuf::from("."),
            summary_path: None,
            encoding: TextEncoding::Utf8,
            concurrent_batches: DEFAULT_CONCURRENT_BATCHES,
        }
    }
}
