//! DBF (dBase III/IV) file source.
//!
//! The header carries the record count and a field descriptor per column;
//! record bodies are fixed-width with strings right-padded by spaces. The
//! header's record count governs how many bodies are read: exactly that many
//! rows are produced, then the reader stops.

use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use pgload_core::{
    Column, LoadError, Message, Row, RowTx, Source, SourceType, SqlValue, TextEncoding,
};
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

const HEADER_LEN: usize = 32;
const DESCRIPTOR_LEN: usize = 32;
const DESCRIPTOR_TERMINATOR: u8 = 0x0d;

struct DbfField {
    kind: u8,
    length: usize,
}

pub struct DbfSource {
    table: String,
    columns: Vec<Column>,
    fields: Vec<DbfField>,
    record_count: u32,
    header_len: u64,
    record_len: usize,
    encoding: TextEncoding,
    file: Option<File>,
}

fn format_err(reason: impl Into<String>) -> LoadError {
    LoadError::SourceFormat {
        format: "dbf",
        reason: reason.into(),
    }
}

impl DbfSource {
    /// Open a DBF file and parse its header and field descriptors.
    ///
    /// The target table name defaults to the file's base name, lowercased.
    pub fn open(
        path: &Path,
        table: Option<&str>,
        encoding: TextEncoding,
    ) -> Result<Self, LoadError> {
        let mut file = File::open(path)
            .map_err(|e| format_err(format!("{}: {}", path.display(), e)))?;

        let mut header = [0u8; HEADER_LEN];
        file.read_exact(&mut header)
            .map_err(|_| format_err("truncated header"))?;
        let record_count = LittleEndian::read_u32(&header[4..8]);
        let header_len = LittleEndian::read_u16(&header[8..10]) as usize;
        let record_len = LittleEndian::read_u16(&header[10..12]) as usize;
        if header_len < HEADER_LEN + DESCRIPTOR_LEN + 1 || record_len == 0 {
            return Err(format_err(format!(
                "implausible header: header length {}, record length {}",
                header_len, record_len
            )));
        }

        let n_fields = (header_len - HEADER_LEN - 1) / DESCRIPTOR_LEN;
        let mut fields = Vec::with_capacity(n_fields);
        let mut columns = Vec::with_capacity(n_fields);
        for _ in 0..n_fields {
            let mut raw = [0u8; DESCRIPTOR_LEN];
            file.read_exact(&mut raw)
                .map_err(|_| format_err("truncated field descriptor"))?;
            if raw[0] == DESCRIPTOR_TERMINATOR {
                break;
            }
            let end = raw[..11].iter().position(|b| *b == 0).unwrap_or(11);
            let name = String::from_utf8_lossy(&raw[..end]).trim().to_string();
            if name.is_empty() {
                return Err(format_err("empty field name in descriptor"));
            }
            let kind = raw[11];
            let length = raw[16] as usize;
            let ty = match kind {
                b'C' => SourceType::DbfCharacter,
                b'N' | b'F' => SourceType::DbfNumeric,
                b'L' => SourceType::DbfLogical,
                b'D' => SourceType::DbfDate,
                b'M' => SourceType::DbfMemo,
                _ => SourceType::Other,
            };
            columns.push(Column::new(name.to_lowercase(), ty).with_length(length));
            fields.push(DbfField { kind, length });
        }
        if fields.is_empty() {
            return Err(format_err("no field descriptors"));
        }

        // one deletion-flag byte precedes the field bytes
        let body_len: usize = 1 + fields.iter().map(|f| f.length).sum::<usize>();
        if body_len != record_len {
            return Err(format_err(format!(
                "record length {} disagrees with field lengths {}",
                record_len, body_len
            )));
        }

        let table = match table {
            Some(t) => t.to_string(),
            None => path
                .file_stem()
                .map(|s| s.to_string_lossy().to_lowercase())
                .ok_or_else(|| format_err("no file name to derive a table name from"))?,
        };

        debug!(
            table = %table,
            records = record_count,
            fields = fields.len(),
            "opened dbf source"
        );
        Ok(Self {
            table,
            columns,
            fields,
            record_count,
            header_len: header_len as u64,
            record_len,
            encoding,
            file: Some(file),
        })
    }

    pub fn record_count(&self) -> u32 {
        self.record_count
    }

    fn decode_record(&self, body: &[u8]) -> Row {
        // body[0] is the deletion flag; the header count governs, so the
        // flag is consumed and ignored
        let mut row = Vec::with_capacity(self.fields.len());
        let mut offset = 1;
        for field in &self.fields {
            let raw = &body[offset..offset + field.length];
            offset += field.length;
            let text = self.encoding.decode(raw);
            row.push(match field.kind {
                // numeric fields arrive space-padded; all-blank means NULL
                b'N' | b'F' => {
                    let trimmed = text.trim();
                    if trimmed.is_empty() {
                        SqlValue::Null
                    } else {
                        SqlValue::Text(trimmed.to_string())
                    }
                }
                _ => SqlValue::Text(text),
            });
        }
        row
    }
}

#[async_trait]
impl Source for DbfSource {
    fn name(&self) -> &str {
        &self.table
    }

    fn columns(&self) -> &[Column] {
        &self.columns
    }

    async fn run(&mut self, tx: RowTx, cancel: CancellationToken) -> Result<u64, LoadError> {
        let mut file = self
            .file
            .take()
            .ok_or_else(|| format_err("source already consumed"))?;
        file.seek(SeekFrom::Start(self.header_len))
            .map_err(|e| format_err(e.to_string()))?;

        let mut body = vec![0u8; self.record_len];
        let mut emitted = 0u64;
        for _ in 0..self.record_count {
            if cancel.is_cancelled() {
                debug!(table = %self.table, emitted, "dbf read cancelled");
                break;
            }
            file.read_exact(&mut body).map_err(|_| {
                format_err(format!(
                    "stream ends after {} of {} records",
                    emitted, self.record_count
                ))
            })?;
            if tx.send(Message::Row(self.decode_record(&body))).await.is_err() {
                warn!(table = %self.table, "row queue closed before end of file");
                break;
            }
            emitted += 1;
        }
        let _ = tx.send(Message::Eos).await; // best-effort
        Ok(emitted)
    }
}
