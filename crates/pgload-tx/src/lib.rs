//! # pgload Transforms - Type Mapping and Value Conversion
//!
//! This crate maps discovered source columns to PostgreSQL column definitions
//! and to the per-value transforms the sink applies before COPY text encoding.
//! Everything here is pure and deterministic: the same column always yields
//! the same definition, and a transform never carries state between values.
//!
//! ## Type mapping
//!
//! | Source tag        | PostgreSQL type    | Default transform        |
//! |-------------------|--------------------|--------------------------|
//! | DBF `C`           | `text`             | right-trim spaces        |
//! | DBF `N`           | `numeric`          | identity                 |
//! | DBF `L`           | `boolean`          | `?` → NULL               |
//! | DBF `D`           | `date`             | `YYYYMMDD` → date        |
//! | DBF `M`           | `text`             | identity                 |
//! | SQLite integer    | `bigint`/`bigserial` | identity               |
//! | SQLite real       | `double precision` | identity                 |
//! | SQLite text       | `text`             | identity                 |
//! | SQLite blob       | `bytea`            | base64-decode text       |
//! | SQLite numeric    | `numeric`          | identity                 |
//! | anything else     | `text`             | identity                 |

use anyhow::{bail, Result};
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use chrono::NaiveDate;
use pgload_core::{Column, SourceType, SqlValue};

/// Identifier case policy for generated DDL and COPY statements.
///
/// `Lower` folds plain names to lowercase the way the server would; `Preserve`
/// keeps the source spelling, quoting whenever the name is not plain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaseFold {
    Lower,
    Preserve,
}

/// A pure per-value conversion from a raw source value to a value ready for
/// COPY text encoding. `Identity` is the sentinel for "pass through".
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transform {
    Identity,
    /// DBF `C` fields: drop the fixed-width right padding.
    RightTrim,
    /// DBF `D` fields: `YYYYMMDD` text to a date; blank to NULL.
    DateYmd,
    /// DBF `L` fields: `?`/blank to NULL, `YyTt` true, `NnFf` false.
    Logical,
    /// SQLite blob columns: text values are base64 and decode to bytes.
    Base64Blob,
}

impl Transform {
    pub fn apply(&self, value: SqlValue) -> Result<SqlValue> {
        match (self, value) {
            (Transform::Identity, v) => Ok(v),

            (Transform::RightTrim, SqlValue::Text(s)) => {
                Ok(SqlValue::Text(s.trim_end_matches(' ').to_string()))
            }
            (Transform::RightTrim, v) => Ok(v),

            (Transform::DateYmd, SqlValue::Text(s)) => {
                let s = s.trim();
                if s.is_empty() {
                    return Ok(SqlValue::Null);
                }
                match NaiveDate::parse_from_str(s, "%Y%m%d") {
                    Ok(date) => Ok(SqlValue::Date(date)),
                    Err(e) => bail!("bad date field {:?}: {}", s, e),
                }
            }
            (Transform::DateYmd, v) => Ok(v),

            (Transform::Logical, SqlValue::Text(s)) => match s.trim() {
                "" | "?" => Ok(SqlValue::Null),
                "Y" | "y" | "T" | "t" => Ok(SqlValue::Boolean(true)),
                "N" | "n" | "F" | "f" => Ok(SqlValue::Boolean(false)),
                other => bail!("bad logical field {:?}", other),
            },
            (Transform::Logical, v) => Ok(v),

            (Transform::Base64Blob, SqlValue::Text(s)) => match BASE64.decode(s.trim()) {
                Ok(bytes) => Ok(SqlValue::Bytes(bytes)),
                Err(e) => bail!("bad base64 blob: {}", e),
            },
            (Transform::Base64Blob, v) => Ok(v),
        }
    }
}

/// Map a source column to its PostgreSQL type name and default transform.
pub fn type_mapping(col: &Column) -> (&'static str, Transform) {
    match col.ty {
        SourceType::DbfCharacter => ("text", Transform::RightTrim),
        SourceType::DbfNumeric => ("numeric", Transform::Identity),
        SourceType::DbfLogical => ("boolean", Transform::Logical),
        SourceType::DbfDate => ("date", Transform::DateYmd),
        SourceType::DbfMemo => ("text", Transform::Identity),
        SourceType::SqliteInteger if col.serial => ("bigserial", Transform::Identity),
        SourceType::SqliteInteger => ("bigint", Transform::Identity),
        SourceType::SqliteReal => ("double precision", Transform::Identity),
        SourceType::SqliteText => ("text", Transform::Identity),
        SourceType::SqliteBlob => ("bytea", Transform::Base64Blob),
        SourceType::SqliteNumeric => ("numeric", Transform::Identity),
        SourceType::Other => ("text", Transform::Identity),
    }
}

/// Produce the `"<quoted-ident> <pg-type>"` column definition for CREATE
/// TABLE, plus the column's transform.
pub fn column_definition(col: &Column, fold: CaseFold) -> (String, Transform) {
    let (pg_type, transform) = type_mapping(col);
    (
        format!("{} {}", quote_ident(&col.name, fold), pg_type),
        transform,
    )
}

/// Quote a SQL identifier.
///
/// A plain name (lowercase letters, digits, underscores, not digit-leading)
/// passes bare; anything else is double-quoted with embedded quotes doubled.
pub fn quote_ident(name: &str, fold: CaseFold) -> String {
    let folded = match fold {
        CaseFold::Lower => name.to_lowercase(),
        CaseFold::Preserve => name.to_string(),
    };
    if is_plain(&folded) {
        folded
    } else {
        format!("\"{}\"", folded.replace('"', "\"\""))
    }
}

fn is_plain(name: &str) -> bool {
    let mut chars = name.chars();
    let head_ok = matches!(chars.next(), Some(c) if c.is_ascii_lowercase() || c == '_');
    head_ok
        && name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn right_trim_is_idempotent() {
        let once = Transform::RightTrim
            .apply(SqlValue::Text("Alice     ".into()))
            .unwrap();
        let twice = Transform::RightTrim.apply(once.clone()).unwrap();
        assert_eq!(once, SqlValue::Text("Alice".into()));
        assert_eq!(once, twice);
    }

    #[test]
    fn right_trim_keeps_interior_and_leading_spaces() {
        let out = Transform::RightTrim
            .apply(SqlValue::Text("  a b  ".into()))
            .unwrap();
        assert_eq!(out, SqlValue::Text("  a b".into()));
    }

    #[test]
    fn date_parses_ymd() {
        let out = Transform::DateYmd
            .apply(SqlValue::Text("20200301".into()))
            .unwrap();
        assert_eq!(
            out,
            SqlValue::Date(NaiveDate::from_ymd_opt(2020, 3, 1).unwrap())
        );
    }

    #[test]
    fn blank_date_is_null() {
        let out = Transform::DateYmd
            .apply(SqlValue::Text("        ".into()))
            .unwrap();
        assert_eq!(out, SqlValue::Null);
    }

    #[test]
    fn garbage_date_is_an_error() {
        assert!(Transform::DateYmd
            .apply(SqlValue::Text("00000000".into()))
            .is_err());
    }

    #[test]
    fn logical_maps_the_dbase_alphabet() {
        let apply = |s: &str| Transform::Logical.apply(SqlValue::Text(s.into())).unwrap();
        assert_eq!(apply("?"), SqlValue::Null);
        assert_eq!(apply("Y"), SqlValue::Boolean(true));
        assert_eq!(apply("t"), SqlValue::Boolean(true));
        assert_eq!(apply("N"), SqlValue::Boolean(false));
        assert_eq!(apply("f"), SqlValue::Boolean(false));
        assert!(Transform::Logical.apply(SqlValue::Text("x".into())).is_err());
    }

    #[test]
    fn base64_decode_inverts_encode() {
        let bytes = vec![0u8, 1, 2, 254, 255];
        let encoded = BASE64.encode(&bytes);
        let out = Transform::Base64Blob
            .apply(SqlValue::Text(encoded))
            .unwrap();
        assert_eq!(out, SqlValue::Bytes(bytes));
    }

    #[test]
    fn blob_bytes_pass_through() {
        let out = Transform::Base64Blob
            .apply(SqlValue::Bytes(vec![1, 2]))
            .unwrap();
        assert_eq!(out, SqlValue::Bytes(vec![1, 2]));
    }

    #[test]
    fn dbf_columns_map_to_scalar_types() {
        let case = |ty| type_mapping(&Column::new("c", ty));
        assert_eq!(case(SourceType::DbfCharacter).0, "text");
        assert_eq!(case(SourceType::DbfNumeric).0, "numeric");
        assert_eq!(case(SourceType::DbfLogical).0, "boolean");
        assert_eq!(case(SourceType::DbfDate).0, "date");
        assert_eq!(case(SourceType::DbfMemo).0, "text");
    }

    #[test]
    fn sqlite_integer_pk_becomes_bigserial() {
        let col = Column::new("id", SourceType::SqliteInteger).with_serial(true);
        assert_eq!(type_mapping(&col).0, "bigserial");
        let col = Column::new("n", SourceType::SqliteInteger);
        assert_eq!(type_mapping(&col).0, "bigint");
    }

    #[test]
    fn column_definition_quotes_and_folds() {
        let col = Column::new("Name", SourceType::DbfCharacter);
        let (def, transform) = column_definition(&col, CaseFold::Lower);
        assert_eq!(def, "name text");
        assert_eq!(transform, Transform::RightTrim);

        let (def, _) = column_definition(&col, CaseFold::Preserve);
        assert_eq!(def, "\"Name\" text");
    }

    #[test]
    fn quoting_handles_embedded_quotes_and_keywords() {
        assert_eq!(quote_ident("user", CaseFold::Lower), "user");
        assert_eq!(quote_ident("2fast", CaseFold::Lower), "\"2fast\"");
        assert_eq!(
            quote_ident("we\"ird", CaseFold::Preserve),
            "\"we\"\"ird\""
        );
    }
}
