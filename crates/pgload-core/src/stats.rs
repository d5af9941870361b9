//! Per-table and per-phase counters, and the final summary report.
//!
//! Each [`PgState`] is mutated by exactly one worker pair and read by the
//! collector only after that pair terminates, so no synchronization is
//! needed beyond ownership.

use std::fmt::Write as _;
use std::future::Future;
use std::time::{Duration, Instant};

/// Counters and timings for one table copy or one named phase.
#[derive(Debug, Clone)]
pub struct PgState {
    pub label: String,
    /// Rows the reader produced.
    pub read: u64,
    /// Rows the server acknowledged.
    pub written: u64,
    pub errors: u64,
    /// Bytes sent down the COPY stream.
    pub bytes: u64,
    pub elapsed: Duration,
}

impl PgState {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            read: 0,
            written: 0,
            errors: 0,
            bytes: 0,
            elapsed: Duration::ZERO,
        }
    }
}

/// Phase-grouped statistics for a whole run.
#[derive(Debug, Clone)]
pub struct StateBundle {
    /// Schema phase: create/drop/truncate.
    pub before: PgState,
    /// One entry per table that began a copy.
    pub main: Vec<PgState>,
    pub index: PgState,
    pub sequences: PgState,
}

impl StateBundle {
    pub fn new() -> Self {
        Self {
            before: PgState::new("before load"),
            main: Vec::new(),
            index: PgState::new("index build"),
            sequences: PgState::new("reset sequences"),
        }
    }

    /// Fold every phase into a single totals row.
    pub fn total(&self) -> PgState {
        let mut total = PgState::new("Total import time");
        for state in self
            .main
            .iter()
            .chain([&self.before, &self.index, &self.sequences])
        {
            total.read += state.read;
            total.written += state.written;
            total.errors += state.errors;
            total.bytes += state.bytes;
            total.elapsed += state.elapsed;
        }
        total
    }
}

impl Default for StateBundle {
    fn default() -> Self {
        Self::new()
    }
}

/// Scope a timed region: run `fut` and fold its elapsed wall time into
/// `state` under `label`.
pub async fn with_stats<T, F>(label: &str, state: &mut PgState, fut: F) -> T
where
    F: Future<Output = T>,
{
    state.label = label.to_string();
    let begin = Instant::now();
    let out = fut.await;
    state.elapsed += begin.elapsed();
    out
}

/// Render the full summary: one row per table, rows for the before/index/
/// sequence phases, and a total.
pub fn render_summary(label: &str, bundle: &StateBundle) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "{}", label);
    let _ = writeln!(
        out,
        "{:<28} {:>10} {:>10} {:>8} {:>12}",
        "table name", "read", "written", "errors", "time"
    );
    let rule = format!("{:-<72}", "");
    let _ = writeln!(out, "{}", rule);
    if bundle.before.elapsed > Duration::ZERO {
        push_row(&mut out, &bundle.before);
    }
    for state in &bundle.main {
        push_row(&mut out, state);
    }
    if bundle.index.elapsed > Duration::ZERO {
        push_row(&mut out, &bundle.index);
    }
    if bundle.sequences.elapsed > Duration::ZERO {
        push_row(&mut out, &bundle.sequences);
    }
    let _ = writeln!(out, "{}", rule);
    push_row(&mut out, &bundle.total());
    out
}

fn push_row(out: &mut String, state: &PgState) {
    let _ = writeln!(
        out,
        "{:<28} {:>10} {:>10} {:>8} {:>12}",
        state.label,
        state.read,
        state.written,
        state.errors,
        format_duration(state.elapsed)
    );
}

fn format_duration(d: Duration) -> String {
    format!("{:.3}s", d.as_secs_f64())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_stats_folds_elapsed_time() {
        let mut state = PgState::new("t");
        let out = with_stats("copy users", &mut state, async {
            tokio::time::sleep(Duration::from_millis(20)).await;
            7u64
        })
        .await;
        assert_eq!(out, 7);
        assert_eq!(state.label, "copy users");
        assert!(state.elapsed >= Duration::from_millis(20));
    }

    #[test]
    fn total_sums_counters_across_phases() {
        let mut bundle = StateBundle::new();
        let mut users = PgState::new("users");
        users.read = 10;
        users.written = 10;
        let mut posts = PgState::new("posts");
        posts.read = 5;
        posts.written = 4;
        posts.errors = 1;
        bundle.main.push(users);
        bundle.main.push(posts);

        let total = bundle.total();
        assert_eq!(total.read, 15);
        assert_eq!(total.written, 14);
        assert_eq!(total.errors, 1);
    }

    #[test]
    fn summary_lists_every_copied_table_and_the_total() {
        let mut bundle = StateBundle::new();
        let mut users = PgState::new("users");
        users.read = 3;
        users.written = 3;
        users.elapsed = Duration::from_millis(12);
        bundle.main.push(users);
        bundle.sequences.elapsed = Duration::from_millis(1);

        let report = render_summary("import", &bundle);
        assert!(report.contains("users"));
        assert!(report.contains("reset sequences"));
        assert!(report.contains("Total import time"));
        // the schema phase never ran, so it is not reported
        assert!(!report.contains("before load"));
    }
}
