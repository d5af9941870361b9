//! # pgload I/O - Source Readers, PostgreSQL Sink, and Orchestration
//!
//! This crate provides the concrete pieces of the pgload pipeline: the source
//! readers for each supported format, the PostgreSQL COPY sink, the schema
//! materializer, and the orchestrator that drives table copies and index
//! builds across the two worker pools.
//!
//! ## Data flow
//!
//! ```text
//! DbfSource / SqliteSource --> bounded row queue --> PostgresSink
//! ```
//!
//! Control flow: the schema phase runs first (create or truncate), then the
//! orchestrator launches one reader task and one sink task per table on the
//! copy pool while index builds interleave on the index pool. Sequence resets
//! run after all copies complete.
//!
//! ## Example Usage
//!
//! ```no_run
//! use pgload_core::{LoadSpec, RunContext};
//! use pgload_io::orchestrator;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> anyhow::Result<()> {
//! let spec = LoadSpec::from_path("import.yml".as_ref())?;
//! let ctx = RunContext::default();
//! let bundle = orchestrator::load(&ctx, &spec, CancellationToken::new()).await?;
//! println!("{}", pgload_core::stats::render_summary("import", &bundle));
//! # Ok(())
//! # }
//! ```

/// COPY text-protocol value and row encoding
pub mod copy_text;

/// DBF (dBase III/IV) file source
pub mod source_dbf;

/// SQLite database source
pub mod source_sqlite;

/// PostgreSQL COPY sink and reject files
pub mod sink_postgres;

/// DDL builders and the schema materializer
pub mod schema;

/// Table copy and index build coordination
pub mod orchestrator;
