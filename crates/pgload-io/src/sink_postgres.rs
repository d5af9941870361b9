//! PostgreSQL COPY sink.
//!
//! Consumes one table's row queue and streams it into `COPY ... FROM STDIN`
//! inside a single transaction. Each raw value goes through its column's
//! transform, then the text-protocol escaping; rows that fail either step are
//! rejected to disk and counted, never sent. The whole copy commits on
//! end-of-stream and rolls back on stream or transaction failure.

use bytes::Bytes;
use futures::SinkExt;
use pgload_core::{LoadError, Message, Row, RowRx};
use pgload_tx::{quote_ident, CaseFold, Transform};
use std::fs::{File, OpenOptions};
use std::io::Write as _;
use std::path::PathBuf;
use tokio_postgres::NoTls;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::copy_text;

/// What the sink observed for one table copy.
#[derive(Debug, Default, Clone, Copy)]
pub struct SinkReport {
    /// Rows taken off the queue.
    pub received: u64,
    /// Rows the server acknowledged when the COPY stream closed.
    pub written: u64,
    /// Rows rejected by a transform or formatting failure.
    pub errors: u64,
    /// Bytes sent down the stream.
    pub bytes: u64,
}

pub struct PostgresSink {
    conninfo: String,
    table: String,
    columns: Vec<String>,
    transforms: Vec<Transform>,
    fold: CaseFold,
    truncate: bool,
    reject: RejectLog,
}

impl PostgresSink {
    /// `columns` and `transforms` must pair up with the reader's value order.
    pub fn new(
        conninfo: String,
        table: String,
        columns: Vec<String>,
        transforms: Vec<Transform>,
        fold: CaseFold,
        truncate: bool,
        reject_dir: PathBuf,
    ) -> Self {
        let reject = RejectLog::new(reject_dir, table.clone());
        Self {
            conninfo,
            table,
            columns,
            transforms,
            fold,
            truncate,
            reject,
        }
    }

    fn sink_err(&self, row: u64, e: impl std::fmt::Display) -> LoadError {
        LoadError::Sink {
            table: self.table.clone(),
            row,
            reason: e.to_string(),
        }
    }

    /// The COPY statement with an explicit column list, so the target table
    /// may carry extra columns without breaking the load.
    pub fn copy_statement(&self) -> String {
        let cols = self
            .columns
            .iter()
            .map(|c| quote_ident(c, self.fold))
            .collect::<Vec<_>>()
            .join(", ");
        format!(
            "COPY {} ({}) FROM STDIN",
            quote_ident(&self.table, self.fold),
            cols
        )
    }

    pub async fn run(
        &mut self,
        mut rx: RowRx,
        cancel: CancellationToken,
    ) -> Result<SinkReport, LoadError> {
        let (mut client, connection) = tokio_postgres::connect(&self.conninfo, NoTls)
            .await
            .map_err(|e| self.sink_err(0, e))?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!(error = %e, "postgres connection task ended with error");
            }
        });

        if self.truncate {
            let sql = format!("TRUNCATE {}", quote_ident(&self.table, self.fold));
            client
                .batch_execute(&sql)
                .await
                .map_err(|e| self.sink_err(0, e))?;
        }

        let tx = client
            .transaction()
            .await
            .map_err(|e| self.sink_err(0, e))?;
        let stream = tx
            .copy_in(&self.copy_statement())
            .await
            .map_err(|e| self.sink_err(0, e))?;
        futures::pin_mut!(stream);

        let mut report = SinkReport::default();
        loop {
            let msg = tokio::select! {
                _ = cancel.cancelled() => {
                    // dropping the transaction rolls the copy back
                    debug!(table = %self.table, "sink cancelled; rolling back");
                    return Ok(SinkReport {
                        received: report.received,
                        ..SinkReport::default()
                    });
                }
                msg = rx.recv() => msg,
            };
            // a closed channel counts as end-of-stream
            let Some(msg) = msg else { break };
            match msg {
                Message::Row(row) => {
                    report.received += 1;
                    if row.len() != self.transforms.len() {
                        return Err(self.sink_err(
                            report.received,
                            format!(
                                "row has {} values, table has {} columns",
                                row.len(),
                                self.transforms.len()
                            ),
                        ));
                    }
                    match encode_row(&row, &self.transforms) {
                        Ok(line) => {
                            report.bytes += line.len() as u64;
                            stream
                                .send(Bytes::from(line))
                                .await
                                .map_err(|e| self.sink_err(report.received, e))?;
                        }
                        Err(reason) => {
                            report.errors += 1;
                            self.reject.record(&row, &reason);
                        }
                    }
                }
                Message::Eos => break,
            }
        }

        let written = stream
            .finish()
            .await
            .map_err(|e| self.sink_err(report.received, e))?;
        tx.commit()
            .await
            .map_err(|e| self.sink_err(report.received, e))?;
        report.written = written;
        info!(
            table = %self.table,
            written,
            errors = report.errors,
            "copy committed"
        );
        Ok(report)
    }
}

/// Transform then encode one row into its wire line.
pub fn encode_row(row: &Row, transforms: &[Transform]) -> anyhow::Result<String> {
    let mut values = Vec::with_capacity(row.len());
    for (value, transform) in row.iter().zip(transforms) {
        values.push(transform.apply(value.clone())?);
    }
    Ok(copy_text::format_row(&values))
}

/// Rejected rows for one table under the run's root directory: the row goes
/// to `<table>.dat`, the reason to the same line of `<table>.err`.
pub struct RejectLog {
    dir: PathBuf,
    table: String,
    files: Option<(File, File)>,
}

impl RejectLog {
    pub fn new(dir: PathBuf, table: String) -> Self {
        Self {
            dir,
            table,
            files: None,
        }
    }

    pub fn record(&mut self, row: &Row, reason: &anyhow::Error) {
        if let Err(e) = self.append(row, reason) {
            warn!(table = %self.table, error = %e, "could not persist rejected row");
        }
    }

    fn append(&mut self, row: &Row, reason: &anyhow::Error) -> std::io::Result<()> {
        if self.files.is_none() {
            std::fs::create_dir_all(&self.dir)?;
            let open = |suffix: &str| {
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(self.dir.join(format!("{}.{}", self.table, suffix)))
            };
            self.files = Some((open("dat")?, open("err")?));
        }
        if let Some((dat, err)) = self.files.as_mut() {
            let line = row
                .iter()
                .map(copy_text::format_value)
                .collect::<Vec<_>>()
                .join("\t");
            writeln!(dat, "{}", line)?;
            writeln!(err, "{}", reason)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgload_core::SqlValue;

    fn dbf_transforms() -> Vec<Transform> {
        vec![Transform::RightTrim, Transform::Identity, Transform::Logical]
    }

    #[test]
    fn encode_row_applies_transforms_then_escapes() {
        let row = vec![
            SqlValue::Text("Alice     ".into()),
            SqlValue::Text("42".into()),
            SqlValue::Text("Y".into()),
        ];
        assert_eq!(encode_row(&row, &dbf_transforms()).unwrap(), "Alice\t42\tt\n");
    }

    #[test]
    fn encode_row_maps_unknown_logical_to_null() {
        let row = vec![
            SqlValue::Text("?         ".into()),
            SqlValue::Null,
            SqlValue::Text("?".into()),
        ];
        assert_eq!(encode_row(&row, &dbf_transforms()).unwrap(), "?\t\\N\t\\N\n");
    }

    #[test]
    fn encode_row_surfaces_transform_failures() {
        let row = vec![
            SqlValue::Text("x".into()),
            SqlValue::Null,
            SqlValue::Text("maybe".into()),
        ];
        assert!(encode_row(&row, &dbf_transforms()).is_err());
    }

    #[test]
    fn base64_text_blob_lands_as_escaped_hex() {
        use base64::engine::general_purpose::STANDARD;
        use base64::Engine as _;
        let row = vec![SqlValue::Text(STANDARD.encode([0xde, 0xad]))];
        let line = encode_row(&row, &[Transform::Base64Blob]).unwrap();
        assert_eq!(line, "\\\\xdead\n");
    }

    #[test]
    fn copy_statement_quotes_table_and_columns() {
        let sink = PostgresSink::new(
            "host=localhost".into(),
            "People".into(),
            vec!["name".into(), "Age".into()],
            vec![Transform::Identity, Transform::Identity],
            CaseFold::Lower,
            false,
            PathBuf::from("."),
        );
        assert_eq!(sink.copy_statement(), "COPY people (name, age) FROM STDIN");
    }

    #[test]
    fn reject_log_appends_row_and_reason_line_for_line() {
        let dir = tempfile::tempdir().unwrap();
        let mut log = RejectLog::new(dir.path().to_path_buf(), "people".into());
        let row = vec![SqlValue::Text("bad".into()), SqlValue::Null];
        log.record(&row, &anyhow::anyhow!("bad logical field"));
        log.record(&row, &anyhow::anyhow!("bad date field"));

        let dat = std::fs::read_to_string(dir.path().join("people.dat")).unwrap();
        let err = std::fs::read_to_string(dir.path().join("people.err")).unwrap();
        assert_eq!(dat.lines().count(), 2);
        assert_eq!(dat.lines().next(), Some("bad\t\\N"));
        assert_eq!(err.lines().next(), Some("bad logical field"));
    }
}
