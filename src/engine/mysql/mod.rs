//! `MySQL` / `MariaDB` Engine Implementation
//!
//! # Features
//! - Pooled connections (`mysql_async::Pool`), verified with a throwaway checkout
//! - `MySQL` vs `MariaDB` subtype taken from the configured engine type
//! - Positional `?` parameters over the binary protocol; plain statements over the text protocol
//! - Discovery through `information_schema`
//!
//! # Implementation Notes
//! - Row statements stop reading after `max_rows + 1` rows; the remainder is discarded
//! - Non-row statements report `{affectedRows, insertId}`
//! - A statement outliving its deadline is stopped with `KILL QUERY` from a second connection
//! - Text-protocol numerics are decoded by column type
//! - Binary strings that are not UTF-8 are Base64-encoded

use async_trait::async_trait;
use mysql_async::consts::ColumnType;
use mysql_async::prelude::{FromValue, Protocol, Queryable};
use mysql_async::{
    Column, Opts, OptsBuilder, Params, Pool, PoolConstraints, PoolOpts, QueryResult as MySqlResult, Row,
    SslOpts, Value as MySqlValue,
};
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::capability::inject_limit;
use crate::config::{ConnectionParams, ConnectorOptions};
use crate::engine::{
    with_deadline, with_timeout, zip_row, EngineAdapter, EngineType, ExecLimits, HandleSlot, ObjectType, QueryResult,
    Row as ResultRow, SchemaObject, SearchFilter, TABLE_LISTING_CAP,
};
use crate::error::{RelayError, Result};

const DEFAULT_PORT: u16 = 3306;
const MAX_POOL_SIZE: usize = 10;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const KILL_TIMEOUT: Duration = Duration::from_secs(5);

const SYSTEM_SCHEMAS: &str = "('mysql', 'information_schema', 'performance_schema', 'sys')";

/// Build pool options from connection parameters
fn build_mysql_opts(params: &ConnectionParams) -> Result<Opts> {
    let builder = match params {
        ConnectionParams::Dsn(dsn) => {
            let opts = Opts::from_url(dsn)
                .map_err(|e| RelayError::config_error(format!("Invalid MySQL connection string: {e}")))?;
            OptsBuilder::from_opts(opts)
        }
        ConnectionParams::Server(server) => {
            let ssl = server
                .ssl
                .then(|| SslOpts::default().with_danger_accept_invalid_certs(server.trust_server_certificate));
            OptsBuilder::default()
                .ip_or_hostname(server.host.clone())
                .tcp_port(server.port.unwrap_or(DEFAULT_PORT))
                .user(server.user.clone())
                .pass(server.password.clone())
                .db_name(server.database.clone())
                .ssl_opts(ssl)
        }
        _ => return Err(RelayError::config_error("MySQL sources require a dsn or a host")),
    };

    let pool_opts = PoolOpts::default()
        .with_constraints(PoolConstraints::new(0, MAX_POOL_SIZE).unwrap_or_default())
        .with_inactive_connection_ttl(IDLE_TIMEOUT);
    Ok(builder.pool_opts(pool_opts).into())
}

/// `MySQL` / `MariaDB` adapter
pub struct MySqlAdapter {
    engine: EngineType,
    params: ConnectionParams,
    options: ConnectorOptions,
    slot: HandleSlot<Pool>,
}

impl MySqlAdapter {
    #[must_use]
    pub fn new(engine: EngineType, params: ConnectionParams, options: ConnectorOptions) -> Self {
        Self { engine, params, options, slot: HandleSlot::new() }
    }

    fn error(&self, detail: impl std::fmt::Display) -> RelayError {
        RelayError::engine_error(self.engine.as_str(), detail.to_string())
    }

    async fn catalog<T>(
        &self,
        sql: &str,
        params: Vec<MySqlValue>,
        map: impl Fn(&Row) -> Result<T>,
    ) -> Result<Vec<T>> {
        let pool = self.slot.require(self.engine.as_str())?;
        let rows: Vec<Row> = with_timeout(self.engine.as_str(), self.options.query_timeout, async {
            let mut conn = pool.get_conn().await.map_err(|e| self.error(e))?;
            let rows = conn.exec(sql, params).await.map_err(|e| self.error(e))?;
            Ok(rows)
        })
        .await?;
        rows.iter().map(map).collect()
    }
}

/// What one statement produced
enum Outcome {
    Rows { columns: Vec<String>, rows: Vec<Vec<Value>> },
    Status { affected_rows: u64, insert_id: Option<u64> },
}

/// Read at most `fetch_limit` rows of the first result set, then discard the rest
async fn drain<P: Protocol>(mut result: MySqlResult<'_, 'static, P>, fetch_limit: usize) -> mysql_async::Result<Outcome> {
    let columns: Arc<[Column]> = result.columns().unwrap_or_default();
    if columns.is_empty() {
        let outcome = Outcome::Status { affected_rows: result.affected_rows(), insert_id: result.last_insert_id() };
        result.drop_result().await?;
        return Ok(outcome);
    }

    let mut rows = Vec::new();
    while rows.len() < fetch_limit {
        let Some(row) = result.next().await? else {
            break;
        };
        rows.push((0..columns.len()).map(|idx| mysql_value_to_json(&row, &columns[idx], idx)).collect());
    }
    result.drop_result().await?;

    Ok(Outcome::Rows { columns: columns.iter().map(|c| c.name_str().into_owned()).collect(), rows })
}

/// Stop a statement still running server-side on connection `id`
async fn kill_query(pool: Pool, engine: EngineType, id: u32) {
    let killed = async {
        let mut conn = pool.get_conn().await?;
        conn.query_drop(kill_query_sql(id)).await?;
        Ok::<_, mysql_async::Error>(())
    };
    match tokio::time::timeout(KILL_TIMEOUT, killed).await {
        Ok(Ok(())) => info!(%engine, connection = id, "Killed timed-out statement"),
        Ok(Err(e)) => warn!(%engine, connection = id, "KILL QUERY failed: {e}"),
        Err(_) => warn!(%engine, connection = id, "KILL QUERY timed out"),
    }
}

fn kill_query_sql(id: u32) -> String {
    format!("KILL QUERY {id}")
}

fn json_to_mysql(value: &Value) -> MySqlValue {
    match value {
        Value::Null => MySqlValue::NULL,
        Value::Bool(b) => MySqlValue::Int(i64::from(*b)),
        Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                MySqlValue::Int(i)
            } else if let Some(u) = n.as_u64() {
                MySqlValue::UInt(u)
            } else {
                n.as_f64().map_or(MySqlValue::NULL, MySqlValue::Double)
            }
        }
        Value::String(s) => MySqlValue::Bytes(s.clone().into_bytes()),
        composite => MySqlValue::Bytes(composite.to_string().into_bytes()),
    }
}

fn float_json(f: f64) -> Value {
    serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
}

/// Text-protocol cell decoded by its declared column type
fn text_cell(bytes: &[u8], column: &Column) -> Value {
    let Ok(text) = std::str::from_utf8(bytes) else {
        use base64::Engine;
        return Value::String(base64::engine::general_purpose::STANDARD.encode(bytes));
    };

    match column.column_type() {
        ColumnType::MYSQL_TYPE_TINY
        | ColumnType::MYSQL_TYPE_SHORT
        | ColumnType::MYSQL_TYPE_INT24
        | ColumnType::MYSQL_TYPE_LONG
        | ColumnType::MYSQL_TYPE_LONGLONG
        | ColumnType::MYSQL_TYPE_YEAR => text
            .parse::<i64>()
            .map(Value::from)
            .or_else(|_| text.parse::<u64>().map(Value::from))
            .unwrap_or_else(|_| Value::String(text.to_string())),
        ColumnType::MYSQL_TYPE_FLOAT | ColumnType::MYSQL_TYPE_DOUBLE => {
            text.parse::<f64>().map_or_else(|_| Value::String(text.to_string()), float_json)
        }
        _ => Value::String(text.to_string()),
    }
}

/// Convert `MySQL` value to JSON value
fn mysql_value_to_json(row: &Row, column: &Column, idx: usize) -> Value {
    match row.as_ref(idx) {
        None | Some(MySqlValue::NULL) => Value::Null,
        Some(MySqlValue::Bytes(bytes)) => text_cell(bytes, column),
        Some(MySqlValue::Int(i)) => Value::from(*i),
        Some(MySqlValue::UInt(u)) => Value::from(*u),
        Some(MySqlValue::Float(f)) => float_json(f64::from(*f)),
        Some(MySqlValue::Double(d)) => float_json(*d),
        Some(MySqlValue::Date(year, month, day, hour, minute, second, micro)) => {
            if column.column_type() == ColumnType::MYSQL_TYPE_DATE {
                Value::String(format!("{year:04}-{month:02}-{day:02}"))
            } else {
                Value::String(format!(
                    "{year:04}-{month:02}-{day:02}T{hour:02}:{minute:02}:{second:02}.{micro:06}"
                ))
            }
        }
        Some(MySqlValue::Time(is_negative, days, hours, minutes, seconds, micros)) => {
            let sign = if *is_negative { "-" } else { "" };
            let total_hours = days * 24 + u32::from(*hours);
            Value::String(format!("{sign}{total_hours}:{minutes:02}:{seconds:02}.{micros:06}"))
        }
    }
}

fn cell<T: FromValue>(row: &Row, idx: usize) -> Result<T> {
    row.get_opt::<T, usize>(idx)
        .ok_or_else(|| RelayError::engine_error("mysql", format!("catalog row has no column {idx}")))?
        .map_err(|e| RelayError::engine_error("mysql", format!("Failed to read catalog column {idx}: {e}")))
}

fn text_param(value: Option<&str>) -> MySqlValue {
    value.map_or(MySqlValue::NULL, |s| MySqlValue::Bytes(s.as_bytes().to_vec()))
}

#[async_trait]
impl EngineAdapter for MySqlAdapter {
    async fn connect(&self) -> Result<()> {
        let _gate = self.slot.lock_lifecycle().await;
        if self.slot.is_set() {
            return Ok(());
        }

        let pool = Pool::new(build_mysql_opts(&self.params)?);
        let check = with_timeout(self.engine.as_str(), self.options.connection_timeout, async {
            pool.get_conn().await.map(drop).map_err(|e| self.error(e))
        })
        .await;
        if let Err(e) = check {
            if let Err(close) = pool.disconnect().await {
                debug!("Discarding failed {} pool: {close}", self.engine);
            }
            return Err(e);
        }

        self.slot.set(pool);
        info!(engine = %self.engine, "Connection pool ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _gate = self.slot.lock_lifecycle().await;
        let Some(pool) = self.slot.take() else {
            return Ok(());
        };
        pool.disconnect().await.map_err(|e| {
            warn!(engine = %self.engine, "Pool shutdown failed: {e}");
            self.error(e)
        })
    }

    fn is_connected(&self) -> bool {
        self.slot.is_set()
    }

    async fn execute(&self, sql: &str, params: &[Value], limits: ExecLimits) -> Result<QueryResult> {
        let pool = self.slot.require(self.engine.as_str())?;
        let statement = inject_limit(sql, limits.fetch_limit());
        let fetch_limit = limits.fetch_limit();

        let mut conn = with_timeout(self.engine.as_str(), self.options.connection_timeout, async {
            pool.get_conn().await.map_err(|e| self.error(e))
        })
        .await?;
        let connection_id = conn.id();

        let run = async {
            let outcome = if params.is_empty() {
                let result = conn.query_iter(statement.as_str()).await.map_err(|e| self.error(e))?;
                drain(result, fetch_limit).await
            } else {
                let bound = Params::Positional(params.iter().map(json_to_mysql).collect());
                let result = conn.exec_iter(statement.as_str(), bound).await.map_err(|e| self.error(e))?;
                drain(result, fetch_limit).await
            };
            outcome.map_err(|e| self.error(e))
        };
        // The client deadline alone would leave the statement running on the server
        let killer = pool.clone();
        let engine = self.engine;
        let outcome = with_deadline(engine.as_str(), limits.timeout, run, move || {
            kill_query(killer, engine, connection_id)
        })
        .await?;
        drop(conn);

        Ok(match outcome {
            Outcome::Rows { columns, rows } => {
                debug!(engine = %self.engine, fetched = rows.len(), "Statement complete");
                let rows = rows.into_iter().map(|values| zip_row(&columns, values)).collect();
                QueryResult::from_fetched(columns, rows, limits.max_rows)
            }
            Outcome::Status { affected_rows, insert_id } => {
                let mut row = ResultRow::new();
                row.insert("affectedRows".to_string(), affected_rows.into());
                row.insert("insertId".to_string(), insert_id.into());
                QueryResult::status(row, affected_rows)
            }
        })
    }

    async fn search_objects(&self, filter: &SearchFilter) -> Result<Vec<SchemaObject>> {
        let pattern = text_param(Some(filter.pattern()));
        let schema = text_param(filter.schema.as_deref());
        let table = text_param(filter.table.as_deref());

        match filter.object_type {
            ObjectType::Schema => {
                let sql = format!(
                    "SELECT SCHEMA_NAME FROM information_schema.SCHEMATA \
                     WHERE SCHEMA_NAME NOT IN {SYSTEM_SCHEMAS} AND SCHEMA_NAME LIKE ? ORDER BY SCHEMA_NAME"
                );
                self.catalog(&sql, vec![pattern], |row| Ok(SchemaObject::Schema { name: cell(row, 0)? })).await
            }
            ObjectType::Table => {
                let sql = format!(
                    "SELECT TABLE_SCHEMA, TABLE_NAME FROM information_schema.TABLES \
                     WHERE TABLE_SCHEMA NOT IN {SYSTEM_SCHEMAS} AND (? IS NULL OR TABLE_SCHEMA = ?) \
                     AND TABLE_NAME LIKE ? ORDER BY TABLE_SCHEMA, TABLE_NAME LIMIT {TABLE_LISTING_CAP}"
                );
                self.catalog(&sql, vec![schema.clone(), schema, pattern], |row| {
                    Ok(SchemaObject::Table { schema: Some(cell(row, 0)?), name: cell(row, 1)? })
                })
                .await
            }
            ObjectType::Column => {
                let Some(table_name) = filter.table.as_deref() else {
                    return Ok(Vec::new());
                };
                let sql = "SELECT TABLE_SCHEMA, COLUMN_NAME, COLUMN_TYPE, IS_NULLABLE = 'YES', COLUMN_KEY = 'PRI' \
                           FROM information_schema.COLUMNS \
                           WHERE TABLE_NAME = ? AND TABLE_SCHEMA = COALESCE(?, DATABASE()) AND COLUMN_NAME LIKE ? \
                           ORDER BY ORDINAL_POSITION";
                self.catalog(sql, vec![table, schema, pattern], |row| {
                    Ok(SchemaObject::Column {
                        schema: Some(cell(row, 0)?),
                        name: cell(row, 1)?,
                        table: table_name.to_string(),
                        data_type: cell(row, 2)?,
                        nullable: cell(row, 3)?,
                        primary_key: cell(row, 4)?,
                    })
                })
                .await
            }
            ObjectType::Index => {
                let sql = format!(
                    "SELECT DISTINCT TABLE_SCHEMA, TABLE_NAME, INDEX_NAME, NON_UNIQUE = 0 \
                     FROM information_schema.STATISTICS \
                     WHERE TABLE_SCHEMA NOT IN {SYSTEM_SCHEMAS} \
                       AND (? IS NULL OR TABLE_SCHEMA = ?) AND (? IS NULL OR TABLE_NAME = ?) \
                       AND INDEX_NAME LIKE ? \
                     ORDER BY TABLE_SCHEMA, TABLE_NAME, INDEX_NAME"
                );
                self.catalog(&sql, vec![schema.clone(), schema, table.clone(), table, pattern], |row| {
                    Ok(SchemaObject::Index {
                        schema: Some(cell(row, 0)?),
                        table: cell(row, 1)?,
                        name: cell(row, 2)?,
                        unique: cell(row, 3)?,
                    })
                })
                .await
            }
            ObjectType::Procedure => {
                let sql = format!(
                    "SELECT ROUTINE_SCHEMA, ROUTINE_NAME FROM information_schema.ROUTINES \
                     WHERE ROUTINE_SCHEMA NOT IN {SYSTEM_SCHEMAS} AND (? IS NULL OR ROUTINE_SCHEMA = ?) \
                     AND ROUTINE_NAME LIKE ? ORDER BY ROUTINE_SCHEMA, ROUTINE_NAME"
                );
                self.catalog(&sql, vec![schema.clone(), schema, pattern], |row| {
                    Ok(SchemaObject::Procedure { schema: Some(cell(row, 0)?), name: cell(row, 1)? })
                })
                .await
            }
        }
    }
}
