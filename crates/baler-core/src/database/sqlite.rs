use std::path::{Path, PathBuf};

use rusqlite::types::ValueRef;
use rusqlite::{Connection, OpenFlags};

use super::{quote_ident, DatabaseSource, SqlValue};
use crate::error::{BalerError, Result};
use crate::lock::LOCK_TABLE;

fn sql_err(e: rusqlite::Error) -> BalerError {
    BalerError::Other(format!("sqlite: {e}"))
}

/// Read-only export source over a SQLite database file.
pub struct SqliteSource {
    path: PathBuf,
    conn: Connection,
}

impl SqliteSource {
    pub fn open(path: &Path) -> Result<Self> {
        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )
        .map_err(sql_err)?;
        Ok(Self {
            path: path.to_path_buf(),
            conn,
        })
    }

    /// Stable row order: `rowid`, or the primary key of a WITHOUT ROWID table.
    fn order_by(&self, table: &str) -> Result<String> {
        let without_rowid: bool = self
            .conn
            .query_row(
                "SELECT wr FROM pragma_table_list WHERE schema = 'main' AND name = ?1",
                [table],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        if !without_rowid {
            return Ok("rowid".to_string());
        }
        let mut stmt = self
            .conn
            .prepare("SELECT name FROM pragma_table_info(?1) WHERE pk > 0 ORDER BY pk")
            .map_err(sql_err)?;
        let keys = stmt
            .query_map([table], |row| row.get::<_, String>(0))
            .map_err(sql_err)?
            .map(|name| name.map(|n| quote_ident(&n)))
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        if keys.is_empty() {
            return Err(BalerError::Other(format!(
                "sqlite: table '{table}' has neither rowid nor primary key"
            )));
        }
        Ok(keys.join(", "))
    }
}

impl DatabaseSource for SqliteSource {
    fn name(&self) -> String {
        format!("sqlite:{}", self.path.display())
    }

    fn tables(&self) -> Result<Vec<String>> {
        let mut stmt = self
            .conn
            .prepare(
                "SELECT name FROM sqlite_master \
                 WHERE type = 'table' AND name NOT LIKE 'sqlite_%' AND name <> ?1 ORDER BY name",
            )
            .map_err(sql_err)?;
        let names = stmt
            .query_map([LOCK_TABLE], |row| row.get::<_, String>(0))
            .map_err(sql_err)?
            .collect::<std::result::Result<Vec<_>, _>>()
            .map_err(sql_err)?;
        Ok(names)
    }

    fn create_statement(&self, table: &str) -> Result<String> {
        self.conn
            .query_row(
                "SELECT sql FROM sqlite_master WHERE type = 'table' AND name = ?1",
                [table],
                |row| row.get::<_, String>(0),
            )
            .map_err(sql_err)
    }

    fn columns(&self, table: &str) -> Result<Vec<String>> {
        let stmt = self
            .conn
            .prepare(&format!("SELECT * FROM {} LIMIT 0", quote_ident(table)))
            .map_err(sql_err)?;
        Ok(stmt.column_names().into_iter().map(String::from).collect())
    }

    fn row_count(&self, table: &str) -> Result<u64> {
        let count: i64 = self
            .conn
            .query_row(
                &format!("SELECT COUNT(*) FROM {}", quote_ident(table)),
                [],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        Ok(count.max(0) as u64)
    }

    fn rows(&self, table: &str, offset: u64, limit: u64) -> Result<Vec<Vec<SqlValue>>> {
        let order = self.order_by(table)?;
        let mut stmt = self
            .conn
            .prepare(&format!(
                "SELECT * FROM {} ORDER BY {order} LIMIT ?1 OFFSET ?2",
                quote_ident(table)
            ))
            .map_err(sql_err)?;
        let width = stmt.column_count();
        let mut rows = stmt
            .query([limit as i64, offset as i64])
            .map_err(sql_err)?;
        let mut out = Vec::new();
        while let Some(row) = rows.next().map_err(sql_err)? {
            let mut values = Vec::with_capacity(width);
            for i in 0..width {
                let value = match row.get_ref(i).map_err(sql_err)? {
                    ValueRef::Null => SqlValue::Null,
                    ValueRef::Integer(v) => SqlValue::Integer(v),
                    ValueRef::Real(f) => SqlValue::Real(f),
                    ValueRef::Text(t) => match std::str::from_utf8(t) {
                        Ok(text) => SqlValue::Text(text.to_string()),
                        Err(_) => SqlValue::RawText(t.to_vec()),
                    },
                    ValueRef::Blob(b) => SqlValue::Blob(b.to_vec()),
                };
                values.push(value);
            }
            out.push(values);
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exports_tables_in_rowid_batches() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE users (id INTEGER PRIMARY KEY, name TEXT, avatar BLOB);
                 INSERT INTO users (name, avatar) VALUES ('ann', X'01'), ('bob', NULL), ('cy', NULL);
                 CREATE TABLE empty (x REAL);",
            )
            .unwrap();
        }

        let source = SqliteSource::open(&path).unwrap();
        assert_eq!(source.tables().unwrap(), vec!["empty", "users"]);
        assert_eq!(source.row_count("users").unwrap(), 3);
        assert_eq!(source.columns("users").unwrap(), vec!["id", "name", "avatar"]);
        assert!(source.create_statement("users").unwrap().starts_with("CREATE TABLE users"));

        let batch = source.rows("users", 1, 5).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0][1], SqlValue::Text("bob".into()));
        assert_eq!(source.rows("users", 0, 1).unwrap()[0][2], SqlValue::Blob(vec![1]));
    }

    #[test]
    fn without_rowid_tables_export_in_key_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kv.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE kv (k TEXT PRIMARY KEY, v) WITHOUT ROWID;
                 INSERT INTO kv VALUES ('b', 2), ('a', 1), ('c', 3);",
            )
            .unwrap();
        }

        let source = SqliteSource::open(&path).unwrap();
        let rows = source.rows("kv", 0, 10).unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r[0].clone()).collect();
        assert_eq!(
            keys,
            vec![
                SqlValue::Text("a".into()),
                SqlValue::Text("b".into()),
                SqlValue::Text("c".into())
            ]
        );
        assert_eq!(source.rows("kv", 2, 10).unwrap()[0][1], SqlValue::Integer(3));
    }

    #[test]
    fn non_utf8_text_is_kept_byte_exact() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("raw.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE notes (body TEXT);
                 INSERT INTO notes VALUES (CAST(X'61ff62' AS TEXT)), ('plain');",
            )
            .unwrap();
        }

        let source = SqliteSource::open(&path).unwrap();
        let rows = source.rows("notes", 0, 10).unwrap();
        assert_eq!(rows[0][0], SqlValue::RawText(vec![0x61, 0xff, 0x62]));
        assert_eq!(rows[0][0].to_sql_literal(), "CAST(X'61ff62' AS TEXT)");
        assert_eq!(rows[1][0], SqlValue::Text("plain".into()));
    }

    #[test]
    fn exported_script_replays_quoted_and_keyed_tables() {
        use crate::chunking::SeekableIterator;
        use crate::database::{DatabaseExportState, DatabaseIterator, ScriptWriter};

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("src.db");
        {
            let conn = Connection::open(&path).unwrap();
            conn.execute_batch(
                "CREATE TABLE \"a\"\"b\" (\"c\"\"d\" TEXT);
                 INSERT INTO \"a\"\"b\" VALUES ('x'), ('y');
                 CREATE TABLE kv (k TEXT PRIMARY KEY, v) WITHOUT ROWID;
                 INSERT INTO kv VALUES ('z', X'00'), ('m', CAST(X'ff' AS TEXT));",
            )
            .unwrap();
        }

        let source = SqliteSource::open(&path).unwrap();
        let script = dir.path().join("database.sql");
        let mut state = DatabaseExportState::default();
        let mut writer = ScriptWriter::open(&script, &source.name(), &mut state).unwrap();
        let mut units = DatabaseIterator::new(Some(&source as &dyn DatabaseSource), 1).unwrap();
        while let Some(item) = units.current().cloned() {
            writer.write_unit(&source, &item, &mut state).unwrap();
            units.advance().unwrap();
        }
        assert_eq!(state.rows_written, 4);

        let replay = Connection::open_in_memory().unwrap();
        replay
            .execute_batch(&std::fs::read_to_string(&script).unwrap())
            .unwrap();
        let quoted: Vec<String> = replay
            .prepare("SELECT \"c\"\"d\" FROM \"a\"\"b\" ORDER BY rowid")
            .unwrap()
            .query_map([], |row| row.get(0))
            .unwrap()
            .collect::<std::result::Result<_, _>>()
            .unwrap();
        assert_eq!(quoted, vec!["x", "y"]);
        let raw: Vec<u8> = replay
            .query_row("SELECT CAST(v AS BLOB) FROM kv WHERE k = 'm'", [], |row| row.get(0))
            .unwrap();
        assert_eq!(raw, vec![0xff]);
    }
}
