//! Schema materializer.
//!
//! DDL strings are produced by pure builder functions and executed by thin
//! async wrappers, so the generated SQL stays testable without a server.
//! Create/drop runs in one transaction per invocation; index builds and
//! sequence resets are per-object and recoverable.

use pgload_core::{Column, Index, LoadError};
use pgload_tx::{column_definition, quote_ident, CaseFold};
use tokio_postgres::{Client, NoTls};
use tracing::{info, warn};

/// Connect and spawn the connection future.
pub async fn connect(conninfo: &str) -> anyhow::Result<Client> {
    let (client, connection) = tokio_postgres::connect(conninfo, NoTls).await?;
    tokio::spawn(async move {
        if let Err(e) = connection.await {
            warn!(error = %e, "postgres connection task ended with error");
        }
    });
    Ok(client)
}

fn schema_err(e: tokio_postgres::Error) -> LoadError {
    LoadError::Schema(e.to_string())
}

/// CREATE TABLE with column definitions from the type mapper.
pub fn create_table_sql(
    table: &str,
    columns: &[Column],
    if_not_exists: bool,
    fold: CaseFold,
) -> String {
    let defs = columns
        .iter()
        .map(|c| column_definition(c, fold).0)
        .collect::<Vec<_>>()
        .join(", ");
    format!(
        "CREATE TABLE {}{} ({})",
        if if_not_exists { "IF NOT EXISTS " } else { "" },
        quote_ident(table, fold),
        defs
    )
}

pub fn drop_table_sql(table: &str, fold: CaseFold) -> String {
    format!("DROP TABLE IF EXISTS {}", quote_ident(table, fold))
}

/// One statement truncating every listed table.
pub fn truncate_sql(tables: &[String], fold: CaseFold) -> String {
    format!(
        "TRUNCATE {}",
        tables
            .iter()
            .map(|t| quote_ident(t, fold))
            .collect::<Vec<_>>()
            .join(", ")
    )
}

pub fn create_index_sql(index: &Index, fold: CaseFold) -> String {
    let cols = index
        .columns
        .iter()
        .map(|c| quote_ident(c, fold))
        .collect::<Vec<_>>()
        .join(", ");
    let mut sql = format!(
        "CREATE {}INDEX IF NOT EXISTS {} ON {} ({})",
        if index.unique { "UNIQUE " } else { "" },
        quote_ident(&index.name, fold),
        quote_ident(&index.table, fold),
        cols
    );
    if let Some(predicate) = &index.predicate {
        sql.push_str(" WHERE ");
        sql.push_str(predicate);
    }
    sql
}

/// setval to MAX(column)+1 with is_called = false, so the next nextval
/// returns exactly that. COALESCE restarts empty tables at 1. Idempotent.
pub fn reset_sequence_sql(table: &str, column: &str, fold: CaseFold) -> String {
    let table_q = quote_ident(table, fold);
    let column_q = quote_ident(column, fold);
    let column_literal = match fold {
        CaseFold::Lower => column.to_lowercase(),
        CaseFold::Preserve => column.to_string(),
    };
    format!(
        "SELECT setval(pg_get_serial_sequence('{}', '{}'), \
         (SELECT COALESCE(MAX({}), 0) + 1 FROM {}), false)",
        table_q, column_literal, column_q, table_q
    )
}

/// Create every listed table, optionally dropping first. All DDL for one
/// invocation runs in a single transaction; any failure aborts the run.
pub async fn create_tables(
    client: &mut Client,
    tables: &[(String, Vec<Column>)],
    include_drop: bool,
    fold: CaseFold,
) -> Result<(), LoadError> {
    let tx = client.transaction().await.map_err(schema_err)?;
    for (table, columns) in tables {
        if include_drop {
            tx.batch_execute(&drop_table_sql(table, fold))
                .await
                .map_err(schema_err)?;
        }
        tx.batch_execute(&create_table_sql(table, columns, !include_drop, fold))
            .await
            .map_err(schema_err)?;
    }
    tx.commit().await.map_err(schema_err)?;
    info!(tables = tables.len(), "schema created");
    Ok(())
}

pub async fn truncate_tables(
    client: &Client,
    tables: &[String],
    fold: CaseFold,
) -> Result<(), LoadError> {
    if tables.is_empty() {
        return Ok(());
    }
    client
        .batch_execute(&truncate_sql(tables, fold))
        .await
        .map_err(schema_err)
}

/// Build one index on its own connection. A failure is recoverable and
/// recorded against this index alone.
pub async fn create_index(conninfo: &str, index: &Index, fold: CaseFold) -> Result<(), LoadError> {
    let index_err = |reason: String| LoadError::Index {
        table: index.table.clone(),
        index: index.name.clone(),
        reason,
    };
    let client = connect(conninfo)
        .await
        .map_err(|e| index_err(e.to_string()))?;
    client
        .batch_execute(&create_index_sql(index, fold))
        .await
        .map_err(|e| index_err(e.to_string()))
}

/// Reset the sequences behind every serial column of the listed tables.
/// Returns (resets, failures); failures are logged, never propagated.
pub async fn reset_sequences(
    client: &Client,
    tables: &[(String, Vec<Column>)],
    fold: CaseFold,
) -> (u64, u64) {
    let mut reset = 0u64;
    let mut errors = 0u64;
    for (table, columns) in tables {
        for column in columns.iter().filter(|c| c.serial) {
            match client
                .batch_execute(&reset_sequence_sql(table, &column.name, fold))
                .await
            {
                Ok(()) => reset += 1,
                Err(e) => {
                    errors += 1;
                    warn!(
                        table = %table,
                        column = %column.name,
                        error = %e,
                        "sequence reset failed"
                    );
                }
            }
        }
    }
    (reset, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pgload_core::SourceType;

    fn people_columns() -> Vec<Column> {
        vec![
            Column::new("name", SourceType::DbfCharacter),
            Column::new("age", SourceType::DbfNumeric),
            Column::new("active", SourceType::DbfLogical),
        ]
    }

    #[test]
    fn create_table_lists_mapped_column_definitions() {
        let sql = create_table_sql("people", &people_columns(), true, CaseFold::Lower);
        assert_eq!(
            sql,
            "CREATE TABLE IF NOT EXISTS people (name text, age numeric, active boolean)"
        );
    }

    #[test]
    fn create_table_without_if_not_exists() {
        let sql = create_table_sql("people", &people_columns(), false, CaseFold::Lower);
        assert!(sql.starts_with("CREATE TABLE people ("));
    }

    #[test]
    fn serial_column_becomes_bigserial_in_ddl() {
        let columns = vec![
            Column::new("id", SourceType::SqliteInteger).with_serial(true),
            Column::new("body", SourceType::SqliteText),
        ];
        assert_eq!(
            create_table_sql("posts", &columns, true, CaseFold::Lower),
            "CREATE TABLE IF NOT EXISTS posts (id bigserial, body text)"
        );
    }

    #[test]
    fn drop_is_conditional() {
        assert_eq!(
            drop_table_sql("people", CaseFold::Lower),
            "DROP TABLE IF EXISTS people"
        );
    }

    #[test]
    fn truncate_names_every_table_in_one_statement() {
        let tables = vec!["users".to_string(), "posts".to_string()];
        assert_eq!(
            truncate_sql(&tables, CaseFold::Lower),
            "TRUNCATE users, posts"
        );
    }

    #[test]
    fn index_sql_carries_uniqueness_and_predicate() {
        let index = Index {
            name: "idx_users_name".into(),
            table: "users".into(),
            columns: vec!["name".into()],
            unique: true,
            predicate: Some("score > 0".into()),
        };
        assert_eq!(
            create_index_sql(&index, CaseFold::Lower),
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_users_name ON users (name) WHERE score > 0"
        );
    }

    #[test]
    fn plain_index_sql() {
        let index = Index {
            name: "idx_users_score".into(),
            table: "users".into(),
            columns: vec!["score".into(), "name".into()],
            unique: false,
            predicate: None,
        };
        assert_eq!(
            create_index_sql(&index, CaseFold::Lower),
            "CREATE INDEX IF NOT EXISTS idx_users_score ON users (score, name)"
        );
    }

    #[test]
    fn sequence_reset_restarts_after_the_current_max() {
        let sql = reset_sequence_sql("users", "id", CaseFold::Lower);
        assert_eq!(
            sql,
            "SELECT setval(pg_get_serial_sequence('users', 'id'), \
             (SELECT COALESCE(MAX(id), 0) + 1 FROM users), false)"
        );
    }
}
