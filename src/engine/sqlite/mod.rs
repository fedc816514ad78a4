//! `SQLite` Engine Implementation
//!
//! # Features
//! - File-based connections (`/path/to/db.sqlite`)
//! - In-memory connections (`:memory:`)
//! - Read-only open flag mirroring the connector's read-only option
//! - Discovery through `sqlite_master` and the `pragma_*` table-valued functions
//!
//! # Implementation Notes
//! - Uses `rusqlite` (synchronous driver); calls run on the blocking pool
//! - One handle per connector, serialized by its mutex
//! - BLOB data is Base64-encoded for JSON safety
//! - `busy_timeout` is the only deadline; statements run to completion
//! - Attached databases play the role of schemas (`main` by default)

use parking_lot::Mutex;
use rusqlite::types::{Value as SqlValue, ValueRef};
use rusqlite::{Connection, OpenFlags, Row};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::capability::{inject_limit, validate_identifier};
use crate::config::{ConnectionParams, ConnectorOptions};
use crate::engine::{
    zip_row, EngineAdapter, ExecLimits, HandleSlot, ObjectType, QueryResult, Row as ResultRow,
    SchemaObject, SearchFilter, TABLE_LISTING_CAP,
};
use crate::error::{RelayError, Result};

type SharedConnection = Arc<Mutex<Connection>>;

/// `SQLite` adapter
pub struct SqliteAdapter {
    params: ConnectionParams,
    options: ConnectorOptions,
    slot: HandleSlot<SharedConnection>,
}

/// What one statement produced
enum Outcome {
    Rows { columns: Vec<String>, rows: Vec<Vec<Value>> },
    Changes { changes: u64, last_insert_rowid: i64 },
}

impl SqliteAdapter {
    #[must_use]
    pub fn new(params: ConnectionParams, options: ConnectorOptions) -> Self {
        Self { params, options, slot: HandleSlot::new() }
    }

    fn path(&self) -> Result<String> {
        match &self.params {
            ConnectionParams::File(path) | ConnectionParams::Dsn(path) => Ok(path.clone()),
            _ => Err(RelayError::engine_error("sqlite", "SQLite requires a database file path")),
        }
    }

    /// Run a closure against the open handle on the blocking pool
    async fn with_connection<T, F>(&self, f: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&Connection) -> rusqlite::Result<T> + Send + 'static,
    {
        let handle = self.slot.require("sqlite")?;
        tokio::task::spawn_blocking(move || {
            let conn = handle.lock();
            f(&conn).map_err(sqlite_error)
        })
        .await
        .map_err(|e| RelayError::engine_error("sqlite", format!("blocking task failed: {e}")))?
    }
}

fn sqlite_error(e: rusqlite::Error) -> RelayError {
    RelayError::engine_error("sqlite", e.to_string())
}

/// Open `SQLite` connection with appropriate flags
fn open_connection(path: &str, read_only: bool, options: &ConnectorOptions) -> rusqlite::Result<Connection> {
    let flags = if read_only {
        OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX
    } else {
        OpenFlags::SQLITE_OPEN_READ_WRITE | OpenFlags::SQLITE_OPEN_CREATE | OpenFlags::SQLITE_OPEN_NO_MUTEX
    };

    let conn = Connection::open_with_flags(path, flags)?;
    if let Some(timeout) = options.query_timeout.or(options.connection_timeout) {
        conn.busy_timeout(timeout)?;
    }
    Ok(conn)
}

/// JSON parameter to a `SQLite` value
fn json_to_sqlite(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(b) => SqlValue::Integer(i64::from(*b)),
        Value::Number(n) => match n.as_i64() {
            Some(i) => SqlValue::Integer(i),
            None => n.as_f64().map_or(SqlValue::Null, SqlValue::Real),
        },
        Value::String(s) => SqlValue::Text(s.clone()),
        composite => SqlValue::Text(composite.to_string()),
    }
}

/// Convert `SQLite` value to JSON value
fn sqlite_value_to_json(row: &Row, idx: usize) -> rusqlite::Result<Value> {
    Ok(match row.get_ref(idx)? {
        ValueRef::Null => Value::Null,
        ValueRef::Integer(i) => Value::Number(i.into()),
        ValueRef::Real(f) => serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number),
        ValueRef::Text(s) => {
            let text = std::str::from_utf8(s).map_err(|e| {
                rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e))
            })?;
            Value::String(text.to_string())
        }
        ValueRef::Blob(b) => {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(b))
        }
    })
}

fn run_statement(conn: &Connection, sql: &str, params: &[Value], fetch_limit: usize) -> rusqlite::Result<Outcome> {
    let mut stmt = conn.prepare(sql)?;
    let bound = rusqlite::params_from_iter(params.iter().map(json_to_sqlite));

    if stmt.column_count() == 0 {
        let changes = stmt.execute(bound)?;
        return Ok(Outcome::Changes { changes: changes as u64, last_insert_rowid: conn.last_insert_rowid() });
    }

    let columns: Vec<String> = stmt.column_names().iter().map(|s| (*s).to_string()).collect();
    let width = columns.len();
    let mut rows = Vec::new();
    let mut cursor = stmt.query(bound)?;
    while rows.len() < fetch_limit {
        let Some(row) = cursor.next()? else {
            break;
        };
        rows.push((0..width).map(|idx| sqlite_value_to_json(row, idx)).collect::<rusqlite::Result<Vec<_>>>()?);
    }

    Ok(Outcome::Rows { columns, rows })
}

fn collect<T>(
    conn: &Connection,
    sql: &str,
    params: impl rusqlite::Params,
    map: impl FnMut(&Row<'_>) -> rusqlite::Result<T>,
) -> rusqlite::Result<Vec<T>> {
    let mut stmt = conn.prepare(sql)?;
    let rows = stmt.query_map(params, map)?;
    rows.collect()
}

#[async_trait::async_trait]
impl EngineAdapter for SqliteAdapter {
    async fn connect(&self) -> Result<()> {
        let _gate = self.slot.lock_lifecycle().await;
        if self.slot.is_set() {
            return Ok(());
        }

        let path = self.path()?;
        let read_only = self.options.readonly;
        let options = self.options;
        let conn = tokio::task::spawn_blocking(move || open_connection(&path, read_only, &options))
            .await
            .map_err(|e| RelayError::engine_error("sqlite", format!("blocking task failed: {e}")))?
            .map_err(|e| RelayError::engine_error("sqlite", format!("Failed to open SQLite database: {e}")))?;

        self.slot.set(Arc::new(Mutex::new(conn)));
        info!(read_only, "SQLite database opened");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _gate = self.slot.lock_lifecycle().await;
        let Some(handle) = self.slot.take() else {
            return Ok(());
        };

        // Statements still in flight keep the handle alive; it closes with the last reference
        let Ok(mutex) = Arc::try_unwrap(handle) else {
            debug!("SQLite handle still in use; closing after the last statement");
            return Ok(());
        };
        tokio::task::spawn_blocking(move || mutex.into_inner().close().map_err(|(_, e)| sqlite_error(e)))
            .await
            .map_err(|e| RelayError::engine_error("sqlite", format!("blocking task failed: {e}")))?
            .inspect_err(|e| warn!("SQLite close failed: {}", e.message()))
    }

    fn is_connected(&self) -> bool {
        self.slot.is_set()
    }

    async fn execute(&self, sql: &str, params: &[Value], limits: ExecLimits) -> Result<QueryResult> {
        let statement = inject_limit(sql, limits.fetch_limit());
        let params = params.to_vec();
        let fetch_limit = limits.fetch_limit();
        debug!(fetch_limit, "Executing SQLite statement");

        let outcome = self.with_connection(move |conn| run_statement(conn, &statement, &params, fetch_limit)).await?;

        Ok(match outcome {
            Outcome::Rows { columns, rows } => {
                let rows = rows.into_iter().map(|values| zip_row(&columns, values)).collect();
                QueryResult::from_fetched(columns, rows, limits.max_rows)
            }
            Outcome::Changes { changes, last_insert_rowid } => {
                let mut row = ResultRow::new();
                row.insert("changes".to_string(), changes.into());
                row.insert("lastInsertRowid".to_string(), last_insert_rowid.into());
                QueryResult::status(row, changes)
            }
        })
    }

    async fn search_objects(&self, filter: &SearchFilter) -> Result<Vec<SchemaObject>> {
        let pattern = filter.pattern().to_string();
        let schema = validate_identifier(filter.schema.as_deref().unwrap_or("main"))?.to_string();
        let table = filter.table.clone();

        match filter.object_type {
            ObjectType::Schema => {
                self.with_connection(move |conn| {
                    collect(
                        conn,
                        "SELECT name FROM pragma_database_list WHERE name <> 'temp' AND name LIKE ?1 ORDER BY name",
                        [&pattern],
                        |row| Ok(SchemaObject::Schema { name: row.get(0)? }),
                    )
                })
                .await
            }
            ObjectType::Table => {
                self.with_connection(move |conn| {
                    let sql = format!(
                        "SELECT name FROM \"{schema}\".sqlite_master \
                         WHERE type IN ('table', 'view') AND name NOT LIKE 'sqlite_%' AND name LIKE ?1 \
                         ORDER BY name LIMIT {TABLE_LISTING_CAP}"
                    );
                    collect(conn, &sql, [&pattern], |row| {
                        Ok(SchemaObject::Table { name: row.get(0)?, schema: Some(schema.clone()) })
                    })
                })
                .await
            }
            ObjectType::Column => {
                let Some(table) = table else {
                    return Ok(Vec::new());
                };
                self.with_connection(move |conn| {
                    collect(
                        conn,
                        "SELECT name, type, \"notnull\", pk FROM pragma_table_info(?1, ?2) \
                         WHERE name LIKE ?3 ORDER BY cid",
                        [&table, &schema, &pattern],
                        |row| {
                            Ok(SchemaObject::Column {
                                name: row.get(0)?,
                                schema: Some(schema.clone()),
                                table: table.clone(),
                                data_type: row.get(1)?,
                                nullable: row.get::<_, i64>(2)? == 0,
                                primary_key: row.get::<_, i64>(3)? > 0,
                            })
                        },
                    )
                })
                .await
            }
            ObjectType::Index => {
                self.with_connection(move |conn| {
                    let sql = format!(
                        "SELECT m.tbl_name, il.name, il.\"unique\" \
                         FROM \"{schema}\".sqlite_master AS m, pragma_index_list(m.tbl_name, ?1) AS il \
                         WHERE m.type = 'table' AND il.name LIKE ?2 AND (?3 IS NULL OR m.tbl_name = ?3) \
                         ORDER BY m.tbl_name, il.name"
                    );
                    collect(conn, &sql, rusqlite::params![schema, pattern, table], |row| {
                        Ok(SchemaObject::Index {
                            name: row.get(1)?,
                            schema: Some(schema.clone()),
                            table: row.get(0)?,
                            unique: row.get::<_, i64>(2)? != 0,
                        })
                    })
                })
                .await
            }
            ObjectType::Procedure => Ok(Vec::new()),
        }
    }
}
