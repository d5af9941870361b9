//! SQLite database source.
//!
//! Discovery goes through `sqlite_master` and the table pragmas; row
//! iteration prepares `SELECT *` and steps the statement on a blocking
//! thread, pushing into the bounded row queue so the sink's speed still
//! bounds the reader's.

use async_trait::async_trait;
use pgload_core::{Column, Index, LoadError, Message, Row, RowTx, Source, SourceType, SqlValue};
use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags, OptionalExtension};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

fn query_err(table: &str, e: impl std::fmt::Display) -> LoadError {
    LoadError::SourceQuery {
        table: table.to_string(),
        reason: e.to_string(),
    }
}

/// Open a database file read-only.
pub fn open_database(path: &Path) -> Result<Connection, LoadError> {
    Connection::open_with_flags(path, OpenFlags::SQLITE_OPEN_READ_ONLY).map_err(|e| {
        LoadError::SourceFormat {
            format: "sqlite",
            reason: format!("{}: {}", path.display(), e),
        }
    })
}

/// List user tables, excluding the `sqlite_*` internals.
pub fn list_tables(conn: &Connection) -> Result<Vec<String>, LoadError> {
    let mut stmt = conn
        .prepare(
            "SELECT name FROM sqlite_master \
             WHERE type = 'table' AND name NOT LIKE 'sqlite_%' ORDER BY name",
        )
        .map_err(|e| query_err("sqlite_master", e))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .map_err(|e| query_err("sqlite_master", e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| query_err("sqlite_master", e))?;
    Ok(names)
}

/// Columns of one table, in declaration order.
pub fn table_columns(conn: &Connection, table: &str) -> Result<Vec<Column>, LoadError> {
    struct RawColumn {
        name: String,
        decl: String,
        notnull: bool,
        pk: i64,
    }

    let mut stmt = conn
        .prepare(&format!("PRAGMA table_info(\"{}\")", table))
        .map_err(|e| query_err(table, e))?;
    let raw = stmt
        .query_map([], |row| {
            Ok(RawColumn {
                name: row.get(1)?,
                decl: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                notnull: row.get::<_, i64>(3)? != 0,
                pk: row.get(5)?,
            })
        })
        .map_err(|e| query_err(table, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| query_err(table, e))?;

    let pk_columns = raw.iter().filter(|c| c.pk > 0).count();
    Ok(raw
        .into_iter()
        .map(|c| {
            let ty = affinity(&c.decl);
            // a lone INTEGER PRIMARY KEY is the rowid; it maps to bigserial
            let serial = pk_columns == 1 && c.pk == 1 && ty == SourceType::SqliteInteger;
            let mut col = Column::new(c.name, ty).with_serial(serial);
            col.nullable = !c.notnull && !serial;
            col
        })
        .collect())
}

/// SQLite declared-type affinity, reduced to the tags the mapper understands.
fn affinity(decl: &str) -> SourceType {
    let d = decl.to_uppercase();
    if d.contains("INT") {
        SourceType::SqliteInteger
    } else if d.contains("CHAR") || d.contains("CLOB") || d.contains("TEXT") {
        SourceType::SqliteText
    } else if d.is_empty() || d.contains("BLOB") {
        SourceType::SqliteBlob
    } else if d.contains("REAL") || d.contains("FLOA") || d.contains("DOUB") {
        SourceType::SqliteReal
    } else {
        SourceType::SqliteNumeric
    }
}

/// Indexes of one table, skipping the automatic primary-key index (the
/// target column is recreated as bigserial) and expression indexes.
pub fn table_indexes(conn: &Connection, table: &str) -> Result<Vec<Index>, LoadError> {
    let mut stmt = conn
        .prepare(&format!("PRAGMA index_list(\"{}\")", table))
        .map_err(|e| query_err(table, e))?;
    let entries = stmt
        .query_map([], |row| {
            Ok((
                row.get::<_, String>(1)?,
                row.get::<_, i64>(2)? != 0,
                row.get::<_, String>(3)?,
            ))
        })
        .map_err(|e| query_err(table, e))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| query_err(table, e))?;

    let mut out = Vec::new();
    for (name, unique, origin) in entries {
        if origin == "pk" {
            continue;
        }
        let mut info = conn
            .prepare(&format!("PRAGMA index_info(\"{}\")", name))
            .map_err(|e| query_err(table, e))?;
        let columns = info
            .query_map([], |row| row.get::<_, Option<String>>(2))
            .map_err(|e| query_err(table, e))?
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| query_err(table, e))?;
        let Some(columns) = columns.into_iter().collect::<Option<Vec<_>>>() else {
            warn!(index = %name, "skipping expression index");
            continue;
        };
        let predicate = index_predicate(conn, &name)?;
        out.push(Index {
            name,
            table: table.to_string(),
            columns,
            unique,
            predicate,
        });
    }
    Ok(out)
}

fn index_predicate(conn: &Connection, index: &str) -> Result<Option<String>, LoadError> {
    let sql: Option<Option<String>> = conn
        .query_row(
            "SELECT sql FROM sqlite_master WHERE type = 'index' AND name = ?1",
            [index],
            |row| row.get(0),
        )
        .optional()
        .map_err(|e| query_err(index, e))?;
    // auto indexes carry no sql at all
    Ok(sql.flatten().and_then(|s| {
        let lower = s.to_lowercase();
        lower
            .find(" where ")
            .map(|pos| s[pos + " where ".len()..].trim().to_string())
    }))
}

pub struct SqliteSource {
    table: String,
    columns: Vec<Column>,
    conn: Option<Connection>,
}

impl SqliteSource {
    /// Open the database read-only and discover one table's columns. The
    /// connection is owned by this reader until `run` completes.
    pub fn open(path: &Path, table: &str) -> Result<Self, LoadError> {
        let conn = open_database(path)?;
        let columns = table_columns(&conn, table)?;
        if columns.is_empty() {
            return Err(query_err(table, "no such table"));
        }
        debug!(table = %table, columns = columns.len(), "opened sqlite source");
        Ok(Self {
            table: table.to_string(),
            columns,
            conn: Some(conn),
        })
    }
}

#[async_trait]
impl Source for SqliteSource {
    fn name(&self) -> &str {
        &self.table
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn run(&mut self, tx: RowTx, cancel: CancellationToken) -> Result<u64, LoadError> {
        let conn = self
            .conn
            .take()
            .ok_or_else(|| query_err(&self.table, "source already consumed"))?;
        let table = self.table.clone();
        let ncols = self.columns.len();

        let handle = tokio::task::spawn_blocking(move || -> Result<u64, LoadError> {
            let mut stmt = conn
                .prepare(&format!("SELECT * FROM \"{}\"", table))
                .map_err(|e| query_err(&table, e))?;
            if stmt.column_count() != ncols {
                return Err(query_err(&table, "statement metadata disagrees with discovery"));
            }
            let mut rows = stmt.query([]).map_err(|e| query_err(&table, e))?;
            let mut emitted = 0u64;
            loop {
                if cancel.is_cancelled() {
                    debug!(table = %table, emitted, "sqlite read cancelled");
                    break;
                }
                match rows.next() {
                    Ok(Some(row)) => {
                        let mut out: Row = Vec::with_capacity(ncols);
                        for i in 0..ncols {
                            let value = match row.get_ref(i).map_err(|e| query_err(&table, e))? {
                                ValueRef::Null => SqlValue::Null,
                                ValueRef::Integer(n) => SqlValue::Integer(n),
                                ValueRef::Real(f) => SqlValue::Real(f),
                                ValueRef::Text(t) => {
                                    SqlValue::Text(String::from_utf8_lossy(t).into_owned())
                                }
                                ValueRef::Blob(b) => SqlValue::Bytes(b.to_vec()),
                            };
                            out.push(value);
                        }
                        if tx.blocking_send(Message::Row(out)).is_err() {
                            warn!(table = %table, "row queue closed mid-copy");
                            break;
                        }
                        emitted += 1;
                    }
                    Ok(None) => break,
                    Err(e) => {
                        // recoverable: end the sink's stream, surface the error
                        let _ = tx.blocking_send(Message::Eos);
                        return Err(query_err(&table, e));
                    }
                }
            }
            let _ = tx.blocking_send(Message::Eos);
            Ok(emitted)
        });

        handle.await.map_err(|e| query_err(&self.table, e))?
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgload_core::row_channel;

    fn fixture() -> (tempfile::TempDir, std::path::PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE users (
                id INTEGER PRIMARY KEY,
                name TEXT NOT NULL,
                score REAL,
                avatar BLOB
            );
            CREATE TABLE posts (id INTEGER PRIMARY KEY, body TEXT);
            CREATE TABLE audit (id INTEGER PRIMARY KEY, entry TEXT);
            CREATE INDEX idx_users_score ON users(score);
            CREATE UNIQUE INDEX idx_users_name ON users(name) WHERE score > 0;
            INSERT INTO users (id, name, score, avatar) VALUES
                (1, 'Alice', 9.5, x'deadbeef'),
                (2, 'Bob', NULL, NULL);
            "#,
        )
        .unwrap();
        (dir, path)
    }

    #[test]
    fn lists_user_tables_only() {
        let (_dir, path) = fixture();
        let conn = open_database(&path).unwrap();
        assert_eq!(list_tables(&conn).unwrap(), vec!["audit", "posts", "users"]);
    }

    #[test]
    fn discovers_columns_with_affinity_and_serial() {
        let (_dir, path) = fixture();
        let conn = open_database(&path).unwrap();
        let cols = table_columns(&conn, "users").unwrap();
        assert_eq!(cols.len(), 4);
        assert_eq!(cols[0].name, "id");
        assert_eq!(cols[0].ty, SourceType::SqliteInteger);
        assert!(cols[0].serial);
        assert_eq!(cols[1].ty, SourceType::SqliteText);
        assert!(!cols[1].nullable);
        assert_eq!(cols[2].ty, SourceType::SqliteReal);
        assert_eq!(cols[3].ty, SourceType::SqliteBlob);
        assert!(cols[3].nullable);
    }

    #[test]
    fn affinity_follows_declared_types() {
        assert_eq!(affinity("INTEGER"), SourceType::SqliteInteger);
        assert_eq!(affinity("VARCHAR(20)"), SourceType::SqliteText);
        assert_eq!(affinity(""), SourceType::SqliteBlob);
        assert_eq!(affinity("BLOB"), SourceType::SqliteBlob);
        assert_eq!(affinity("DOUBLE"), SourceType::SqliteReal);
        assert_eq!(affinity("DECIMAL(10,2)"), SourceType::SqliteNumeric);
    }

    #[test]
    fn discovers_indexes_with_uniqueness_and_predicate() {
        let (_dir, path) = fixture();
        let conn = open_database(&path).unwrap();
        let mut indexes = table_indexes(&conn, "users").unwrap();
        indexes.sort_by(|a, b| a.name.cmp(&b.name));
        assert_eq!(indexes.len(), 2);
        assert_eq!(indexes[0].name, "idx_users_name");
        assert!(indexes[0].unique);
        assert_eq!(indexes[0].columns, vec!["name"]);
        assert_eq!(indexes[0].predicate.as_deref(), Some("score > 0"));
        assert_eq!(indexes[1].name, "idx_users_score");
        assert!(!indexes[1].unique);
        assert!(indexes[1].predicate.is_none());
    }

    #[tokio::test]
    async fn streams_rows_with_raw_values() {
        let (_dir, path) = fixture();
        let mut src = SqliteSource::open(&path, "users").unwrap();
        let (tx, mut rx) = row_channel(16);
        let emitted = src.run(tx, CancellationToken::new()).await.unwrap();
        assert_eq!(emitted, 2);

        let mut rows = Vec::new();
        while let Some(msg) = rx.recv().await {
            match msg {
                Message::Row(row) => rows.push(row),
                Message::Eos => break,
            }
        }
        assert_eq!(
            rows[0],
            vec![
                SqlValue::Integer(1),
                SqlValue::Text("Alice".into()),
                SqlValue::Real(9.5),
                SqlValue::Bytes(vec![0xde, 0xad, 0xbe, 0xef]),
            ]
        );
        assert_eq!(rows[1][2], SqlValue::Null);
    }

    #[test]
    fn missing_table_is_a_query_error() {
        let (_dir, path) = fixture();
        assert!(matches!(
            SqliteSource::open(&path, "nope"),
            Err(LoadError::SourceQuery { .. })
        ));
    }
}
