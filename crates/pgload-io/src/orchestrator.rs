//! Copy orchestration.
//!
//! Drives a run end to end: source discovery, the schema phase, per-table
//! copies on the copy pool, index builds on the index pool, sequence resets,
//! and the aggregated statistics bundle. The schema phase strictly precedes
//! any data copy; sequence resets strictly follow all copies; index builds
//! may overlap copies of later tables.

use crate::schema;
use crate::sink_postgres::PostgresSink;
use crate::source_dbf::DbfSource;
use crate::source_sqlite::{self, SqliteSource};
use pgload_core::stats::with_stats;
use pgload_core::{
    row_channel, Column, Index, LoadError, LoadSpec, PgState, RunContext, Source, SourceSpec,
    StateBundle, TableFilter, TextEncoding,
};
use pgload_tx::{type_mapping, CaseFold, Transform};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// The copy pool runs two workers per active table: one reader, one sink.
const COPY_POOL_WORKERS: usize = 2;

/// Everything needed to copy one table. Constructed once per table during
/// discovery; `columns` and `transforms` pair up index for index with the
/// reader's value order.
pub struct SourceDescriptor {
    pub source: Box<dyn Source>,
    pub target_table: String,
    pub columns: Vec<Column>,
    pub transforms: Vec<Transform>,
    pub indexes: Vec<Index>,
}

impl SourceDescriptor {
    fn new(source: Box<dyn Source>, indexes: Vec<Index>) -> Self {
        let target_table = source.name().to_string();
        let columns = source.columns().to_vec();
        let transforms = columns.iter().map(|c| type_mapping(c).1).collect();
        Self {
            source,
            target_table,
            columns,
            transforms,
            indexes,
        }
    }
}

/// Discover sources and their indexes, applying the table filter to both.
pub fn discover(
    spec: &LoadSpec,
    filter: &TableFilter,
    encoding: TextEncoding,
) -> Result<Vec<SourceDescriptor>, LoadError> {
    match &spec.source {
        SourceSpec::Dbf(dbf) => {
            let source = DbfSource::open(Path::new(&dbf.path), dbf.table.as_deref(), encoding)?;
            if filter.selects(source.name()) {
                Ok(vec![SourceDescriptor::new(Box::new(source), vec![])])
            } else {
                Ok(vec![])
            }
        }
        SourceSpec::Sqlite(sqlite) => {
            let path = Path::new(&sqlite.path);
            let conn = source_sqlite::open_database(path)?;
            let mut out = Vec::new();
            for table in source_sqlite::list_tables(&conn)? {
                if !filter.selects(&table) {
                    continue;
                }
                let indexes = source_sqlite::table_indexes(&conn, &table)?;
                let source = SqliteSource::open(path, &table)?;
                out.push(SourceDescriptor::new(Box::new(source), indexes));
            }
            Ok(out)
        }
    }
}

/// Size of the index pool: the most indexes any one table carries. Zero
/// means no pool gets allocated at all.
pub fn index_pool_size(descriptors: &[SourceDescriptor]) -> usize {
    descriptors
        .iter()
        .map(|d| d.indexes.len())
        .max()
        .unwrap_or(0)
}

/// Run a whole load and return the aggregated statistics.
pub async fn load(
    ctx: &RunContext,
    spec: &LoadSpec,
    cancel: CancellationToken,
) -> Result<StateBundle, LoadError> {
    let opts = &spec.options;
    let fold = CaseFold::Lower;
    let filter = TableFilter::from_options(opts).map_err(LoadError::Other)?;
    let descriptors = discover(spec, &filter, ctx.encoding)?;
    info!(tables = descriptors.len(), "discovery complete");

    let schema_tables: Vec<(String, Vec<Column>)> = descriptors
        .iter()
        .map(|d| (d.target_table.clone(), d.columns.clone()))
        .collect();

    let mut bundle = StateBundle::new();

    // schema phase strictly precedes any data copy
    let creating = (opts.create_tables || opts.schema_only) && !opts.data_only;
    if creating {
        let mut client = schema::connect(&spec.target.conninfo)
            .await
            .map_err(|e| LoadError::Schema(e.to_string()))?;
        with_stats(
            "create tables",
            &mut bundle.before,
            schema::create_tables(&mut client, &schema_tables, opts.include_drop, fold),
        )
        .await?;
    } else if opts.truncate {
        // never reached for freshly created tables
        let client = schema::connect(&spec.target.conninfo)
            .await
            .map_err(|e| LoadError::Schema(e.to_string()))?;
        let names: Vec<String> = schema_tables.iter().map(|(t, _)| t.clone()).collect();
        with_stats(
            "truncate",
            &mut bundle.before,
            schema::truncate_tables(&client, &names, fold),
        )
        .await?;
    }

    let index_tasks = if opts.schema_only {
        Vec::new()
    } else {
        copy_phase(ctx, spec, &mut bundle, descriptors, fold, &cancel).await
    };

    // sequence resets strictly follow all data copies
    if opts.reset_sequences && !cancel.is_cancelled() {
        let conninfo = spec.target.conninfo.clone();
        let tables = &schema_tables;
        let (reset, errors) = with_stats("reset sequences", &mut bundle.sequences, async {
            match schema::connect(&conninfo).await {
                Ok(client) => schema::reset_sequences(&client, tables, fold).await,
                Err(e) => {
                    warn!(error = %e, "could not connect for sequence reset");
                    (0, 1)
                }
            }
        })
        .await;
        bundle.sequences.written = reset;
        bundle.sequences.errors = errors;
    }

    // drain the index pool
    for task in index_tasks {
        match task.await {
            Ok((built, errors, elapsed)) => {
                bundle.index.written += built;
                bundle.index.errors += errors;
                // builds overlap; the phase's wall clock is the longest one
                bundle.index.elapsed = bundle.index.elapsed.max(elapsed);
            }
            Err(e) => {
                error!(error = %e, "index task panicked");
                bundle.index.errors += 1;
            }
        }
    }

    Ok(bundle)
}

/// Launch one reader task and one sink task per table on the copy pool,
/// submitting each table's index builds to the index pool right after its
/// copy pair. Returns the still-running index tasks; copies are awaited here.
async fn copy_phase(
    ctx: &RunContext,
    spec: &LoadSpec,
    bundle: &mut StateBundle,
    descriptors: Vec<SourceDescriptor>,
    fold: CaseFold,
    cancel: &CancellationToken,
) -> Vec<JoinHandle<(u64, u64, Duration)>> {
    let opts = &spec.options;
    let conninfo = spec.target.conninfo.clone();
    let copy_pool = Arc::new(Semaphore::new(COPY_POOL_WORKERS / 2));
    let index_workers = if opts.create_indexes {
        index_pool_size(&descriptors)
    } else {
        0
    };
    // "no indexes" means "no index pool", not a pool of size zero
    let index_pool = (index_workers > 0).then(|| Arc::new(Semaphore::new(index_workers)));

    let mut copy_tasks = Vec::new();
    let mut index_tasks = Vec::new();
    for mut desc in descriptors {
        let indexes = std::mem::take(&mut desc.indexes);

        let pool = copy_pool.clone();
        let conninfo_table = conninfo.clone();
        let reject_dir = ctx.root_dir.clone();
        let queue_capacity = ctx.concurrent_batches;
        let table_cancel = cancel.child_token();
        copy_tasks.push(tokio::spawn(async move {
            let _permit = pool.acquire_owned().await.ok();
            run_table_copy(
                desc,
                conninfo_table,
                reject_dir,
                queue_capacity,
                fold,
                table_cancel,
            )
            .await
        }));

        if let Some(index_pool) = &index_pool {
            for index in indexes {
                let pool = index_pool.clone();
                let conninfo_index = conninfo.clone();
                let index_cancel = cancel.child_token();
                index_tasks.push(tokio::spawn(async move {
                    let _permit = pool.acquire_owned().await.ok();
                    if index_cancel.is_cancelled() {
                        return (0u64, 0u64, Duration::ZERO);
                    }
                    let begin = Instant::now();
                    match schema::create_index(&conninfo_index, &index, fold).await {
                        Ok(()) => {
                            info!(index = %index.name, table = %index.table, "index created");
                            (1, 0, begin.elapsed())
                        }
                        Err(e) => {
                            error!(error = %e, "index build failed");
                            (0, 1, begin.elapsed())
                        }
                    }
                }));
            }
        }
    }

    // await both results for every table; a failed table never stops the rest
    for task in copy_tasks {
        match task.await {
            Ok(state) => bundle.main.push(state),
            Err(e) => {
                error!(error = %e, "copy task panicked");
                let mut state = PgState::new("(lost table)");
                state.errors = 1;
                bundle.main.push(state);
            }
        }
    }
    index_tasks
}

/// One table: reader and sink sharing a fresh bounded queue, each mutating
/// only its own side of the table's counters.
async fn run_table_copy(
    desc: SourceDescriptor,
    conninfo: String,
    reject_dir: PathBuf,
    queue_capacity: usize,
    fold: CaseFold,
    cancel: CancellationToken,
) -> PgState {
    let SourceDescriptor {
        mut source,
        target_table: table,
        columns,
        transforms,
        indexes: _,
    } = desc;
    let mut state = PgState::new(table.clone());
    if cancel.is_cancelled() {
        return state;
    }
    let begin = Instant::now();

    let (tx, rx) = row_channel(queue_capacity);
    let reader_cancel = cancel.child_token();
    let reader = tokio::spawn(async move { source.run(tx, reader_cancel).await });

    let column_names = columns.iter().map(|c| c.name.clone()).collect();
    let mut sink = PostgresSink::new(
        conninfo,
        table.clone(),
        column_names,
        transforms,
        fold,
        false,
        reject_dir,
    );
    let sink_cancel = cancel.child_token();
    let sink_task = tokio::spawn(async move { sink.run(rx, sink_cancel).await });

    let read = reader.await;
    let wrote = sink_task.await;

    let mut received = 0;
    match wrote {
        Ok(Ok(report)) => {
            state.written = report.written;
            state.errors += report.errors;
            state.bytes = report.bytes;
            received = report.received;
        }
        Ok(Err(e)) => {
            state.errors += 1;
            error!(table = %table, error = %e, "sink failed");
        }
        Err(e) => {
            state.errors += 1;
            error!(table = %table, error = %e, "sink task panicked");
        }
    }
    match read {
        Ok(Ok(n)) => state.read = n,
        Ok(Err(e)) => {
            // the reader could not finish; the sink's receive count is the
            // best available read figure
            state.read = received;
            state.errors += 1;
            error!(table = %table, error = %e, "source failed");
        }
        Err(e) => {
            state.read = received;
            state.errors += 1;
            error!(table = %table, error = %e, "reader task panicked");
        }
    }
    state.elapsed = begin.elapsed();
    state
}
