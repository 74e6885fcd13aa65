//! The database phase: a resumable SQL export written as `database.sql`.

pub mod sqlite;

use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::chunking::SeekableIterator;
use crate::error::{BalerError, Result};

pub use sqlite::SqliteSource;

pub const DATABASE_FILE: &str = "database.sql";

/// A single SQL value, as exported.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    /// TEXT whose stored bytes are not valid UTF-8.
    RawText(Vec<u8>),
    Blob(Vec<u8>),
}

impl SqlValue {
    pub fn to_sql_literal(&self) -> String {
        match self {
            SqlValue::Null => "NULL".to_string(),
            SqlValue::Integer(v) => v.to_string(),
            SqlValue::Real(f) if f.is_finite() => format!("{f:?}"),
            SqlValue::Real(_) => "NULL".to_string(),
            SqlValue::Text(s) => format!("'{}'", s.replace('\'', "''")),
            SqlValue::RawText(b) => format!("CAST(X'{}' AS TEXT)", hex::encode(b)),
            SqlValue::Blob(b) => format!("X'{}'", hex::encode(b)),
        }
    }
}

/// Double-quoted SQL identifier.
pub(crate) fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Source of the tables exported by the database phase.
pub trait DatabaseSource: Send {
    fn name(&self) -> String;

    /// Table names in export order.
    fn tables(&self) -> Result<Vec<String>>;

    fn create_statement(&self, table: &str) -> Result<String>;

    fn columns(&self, table: &str) -> Result<Vec<String>>;

    fn row_count(&self, table: &str) -> Result<u64>;

    /// Up to `limit` rows starting at `offset`, in a stable order.
    fn rows(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<Vec<SqlValue>>>;
}

/// Unit of export work and its persisted position.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "unit", rename_all = "snake_case")]
pub enum DatabaseUnit {
    TableSchema { table: usize },
    Rows { table: usize, offset: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseItem {
    pub unit: DatabaseUnit,
    pub table: String,
    pub limit: u64,
}

/// Schema then row batches for every table, as listed when constructed.
pub struct DatabaseIterator {
    tables: Vec<(String, u64)>,
    batch_rows: u64,
    total_rows: u64,
    current: Option<DatabaseItem>,
}

impl DatabaseIterator {
    pub fn new(source: Option<&dyn DatabaseSource>, batch_rows: u64) -> Result<Self> {
        let mut tables = Vec::new();
        if let Some(source) = source {
            for name in source.tables()? {
                let count = source.row_count(&name)?;
                tables.push((name, count));
            }
        }
        let total_rows = tables.iter().map(|(_, n)| n).sum();
        let mut it = Self {
            tables,
            batch_rows: batch_rows.max(1),
            total_rows,
            current: None,
        };
        it.current = it.item(DatabaseUnit::TableSchema { table: 0 });
        Ok(it)
    }

    pub fn table_count(&self) -> usize {
        self.tables.len()
    }

    fn item(&self, unit: DatabaseUnit) -> Option<DatabaseItem> {
        let (table, limit) = match unit {
            DatabaseUnit::TableSchema { table } => (table, 0),
            DatabaseUnit::Rows { table, offset } => {
                let rows = self.tables.get(table)?.1;
                (table, self.batch_rows.min(rows.saturating_sub(offset)))
            }
        };
        let (name, _) = self.tables.get(table)?;
        Some(DatabaseItem {
            unit,
            table: name.clone(),
            limit,
        })
    }

    fn next_unit(&self, unit: DatabaseUnit) -> DatabaseUnit {
        let (table, next_offset) = match unit {
            DatabaseUnit::TableSchema { table } => (table, 0),
            DatabaseUnit::Rows { table, offset } => (table, offset + self.batch_rows),
        };
        let rows = self.tables.get(table).map_or(0, |t| t.1);
        if next_offset < rows {
            DatabaseUnit::Rows {
                table,
                offset: next_offset,
            }
        } else {
            DatabaseUnit::TableSchema { table: table + 1 }
        }
    }
}

impl SeekableIterator for DatabaseIterator {
    type Key = DatabaseUnit;
    type Item = DatabaseItem;
    type Position = DatabaseUnit;

    fn rewind(&mut self) -> Result<()> {
        self.current = self.item(DatabaseUnit::TableSchema { table: 0 });
        Ok(())
    }

    fn is_valid(&self) -> bool {
        self.current.is_some()
    }

    fn current(&self) -> Option<&DatabaseItem> {
        self.current.as_ref()
    }

    fn key(&self) -> Option<DatabaseUnit> {
        self.current.as_ref().map(|i| i.unit)
    }

    fn advance(&mut self) -> Result<()> {
        if let Some(unit) = self.key() {
            self.current = self.item(self.next_unit(unit));
        }
        Ok(())
    }

    fn position(&self) -> Option<DatabaseUnit> {
        self.key()
    }

    /// Stale when the table is gone or now holds fewer rows than the offset.
    fn seek(&mut self, position: &DatabaseUnit) -> Result<bool> {
        let valid = match *position {
            DatabaseUnit::TableSchema { table } => table < self.tables.len(),
            DatabaseUnit::Rows { table, offset } => self
                .tables
                .get(table)
                .is_some_and(|(_, rows)| offset < *rows && offset % self.batch_rows == 0),
        };
        if !valid {
            return Ok(false);
        }
        self.current = self.item(*position);
        Ok(self.current.is_some())
    }

    fn progress_percent(&self) -> Option<f64> {
        if self.total_rows == 0 {
            return None;
        }
        let done: u64 = match self.key()? {
            DatabaseUnit::TableSchema { table } => {
                self.tables[..table].iter().map(|(_, n)| n).sum()
            }
            DatabaseUnit::Rows { table, offset } => {
                self.tables[..table].iter().map(|(_, n)| n).sum::<u64>() + offset
            }
        };
        Some(done as f64 * 100.0 / self.total_rows as f64)
    }
}

/// Extra data of the database job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatabaseExportState {
    /// Script length covered by this checkpoint.
    pub script_len: u64,
    pub tables_done: u64,
    pub rows_written: u64,
}

/// Appends statements to `database.sql`.
pub struct ScriptWriter {
    file: File,
}

impl ScriptWriter {
    /// Open the script, writing its header when `state` is fresh and cutting
    /// it back to `script_len` otherwise.
    pub fn open(path: &Path, source_name: &str, state: &mut DatabaseExportState) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(path)?;
        let mut writer = if state.script_len == 0 {
            file.set_len(0)?;
            let mut writer = Self { file };
            writer.append(
                &format!("-- baler database script\n-- source: {source_name}\n"),
                state,
            )?;
            writer
        } else {
            let len = file.metadata()?.len();
            if len < state.script_len {
                return Err(BalerError::StaleCheckpoint(format!(
                    "{} is shorter ({len}) than its checkpoint ({})",
                    path.display(),
                    state.script_len
                )));
            }
            file.set_len(state.script_len)?;
            file.seek(SeekFrom::End(0))?;
            Self { file }
        };
        writer.file.flush()?;
        Ok(writer)
    }

    fn append(&mut self, text: &str, state: &mut DatabaseExportState) -> Result<()> {
        self.file.write_all(text.as_bytes())?;
        state.script_len += text.len() as u64;
        Ok(())
    }

    pub fn write_unit(
        &mut self,
        source: &dyn DatabaseSource,
        item: &DatabaseItem,
        state: &mut DatabaseExportState,
    ) -> Result<()> {
        let table = &item.table;
        let quoted = quote_ident(table);
        match item.unit {
            DatabaseUnit::TableSchema { .. } => {
                let create = source.create_statement(table)?;
                let create = create.trim_end().trim_end_matches(';');
                let label = table.replace(['\n', '\r'], " ");
                self.append(
                    &format!("\n-- Table: {label}\nDROP TABLE IF EXISTS {quoted};\n{create};\n"),
                    state,
                )?;
                state.tables_done += 1;
            }
            DatabaseUnit::Rows { offset, .. } => {
                let columns = source
                    .columns(table)?
                    .iter()
                    .map(|c| quote_ident(c))
                    .collect::<Vec<_>>()
                    .join(", ");
                let rows = source.rows(table, offset, item.limit)?;
                let mut text = String::new();
                for row in &rows {
                    let values = row
                        .iter()
                        .map(SqlValue::to_sql_literal)
                        .collect::<Vec<_>>()
                        .join(", ");
                    text.push_str(&format!(
                        "INSERT INTO {quoted} ({columns}) VALUES ({values});\n"
                    ));
                }
                self.append(&text, state)?;
                state.rows_written += rows.len() as u64;
                debug!(table = %table, offset, rows = rows.len(), "exported row batch");
            }
        }
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.file.sync_data()?;
        Ok(())
    }
}
