//! SQL Server Engine Implementation
//!
//! # Features
//! - bb8 pool over tiberius, verified with `SELECT 1` on connect
//! - `@p0, @p1, ...` placeholders rewritten to the driver's one-based `@P1, @P2, ...`
//! - `TOP n` row limiting for plain `SELECT`s
//! - Discovery through the `sys.*` catalog views
//!
//! # Implementation Notes
//! - Only the first result set is read; the stream is dropped after `max_rows + 1` rows
//! - `WITH` queries get no `TOP` and are capped while streaming
//! - Data changes without `OUTPUT` and DDL report the total rows affected;
//!   every other statement (`EXEC`, `OUTPUT`, batches) is streamed, and one
//!   that produces no result set reports zero rows

use async_trait::async_trait;
use bb8::Pool;
use bb8_tiberius::ConnectionManager;
use futures::TryStreamExt;
use serde_json::Value;
use std::time::Duration;
use tiberius::{AuthMethod, ColumnData, Config, EncryptionLevel, FromSql, Query, QueryItem, Row, ToSql};
use tracing::{debug, info};

use crate::capability::{has_output_clause, inject_top, leading_keyword, rewrite_mssql_placeholders};
use crate::config::{ConnectionParams, ConnectorOptions};
use crate::engine::{
    with_timeout, zip_row, EngineAdapter, ExecLimits, HandleSlot, ObjectType, QueryResult, SchemaObject,
    SearchFilter, TABLE_LISTING_CAP,
};
use crate::error::{RelayError, Result};

const ENGINE: &str = "sqlserver";
const DEFAULT_PORT: u16 = 1433;
const MAX_POOL_SIZE: u32 = 10;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

fn mssql_error(detail: impl std::fmt::Display) -> RelayError {
    RelayError::engine_error(ENGINE, detail.to_string())
}

/// Build a tiberius config from connection parameters
fn build_mssql_config(params: &ConnectionParams) -> Result<Config> {
    match params {
        ConnectionParams::Dsn(dsn) => Config::from_ado_string(dsn)
            .map_err(|e| RelayError::config_error(format!("Invalid SQL Server connection string: {e}"))),
        ConnectionParams::Server(server) => {
            let user = server
                .user
                .as_deref()
                .ok_or_else(|| RelayError::config_error("SQL Server sources require a user"))?;

            let mut config = Config::new();
            config.host(&server.host);
            config.port(server.port.unwrap_or(DEFAULT_PORT));
            if let Some(database) = &server.database {
                config.database(database);
            }
            config.authentication(AuthMethod::sql_server(user, server.password.as_deref().unwrap_or("")));
            config.encryption(if server.ssl { EncryptionLevel::Required } else { EncryptionLevel::Off });
            if server.trust_server_certificate {
                config.trust_cert();
            }
            config.application_name("dbrelay");
            Ok(config)
        }
        _ => Err(RelayError::config_error("SQL Server sources require a dsn or a host")),
    }
}

/// SQL Server adapter
pub struct SqlServerAdapter {
    params: ConnectionParams,
    options: ConnectorOptions,
    slot: HandleSlot<Pool<ConnectionManager>>,
}

impl SqlServerAdapter {
    #[must_use]
    pub fn new(params: ConnectionParams, options: ConnectorOptions) -> Self {
        Self { params, options, slot: HandleSlot::new() }
    }

    async fn catalog<T>(
        &self,
        sql: &str,
        params: &[Option<&str>],
        map: impl Fn(&Row) -> Result<T>,
    ) -> Result<Vec<T>> {
        let pool = self.slot.require(ENGINE)?;
        let rows = with_timeout(ENGINE, self.options.query_timeout, async {
            let mut conn = pool.get().await.map_err(mssql_error)?;
            let bound: Vec<&dyn ToSql> = params.iter().map(|p| p as &dyn ToSql).collect();
            let rows = conn
                .query(sql, &bound)
                .await
                .map_err(mssql_error)?
                .into_first_result()
                .await
                .map_err(mssql_error)?;
            Ok(rows)
        })
        .await?;
        rows.iter().map(map).collect()
    }
}

/// Whether the statement can produce a result set and must be streamed
fn may_return_rows(sql: &str) -> bool {
    match leading_keyword(sql).as_str() {
        "INSERT" | "UPDATE" | "DELETE" | "MERGE" => has_output_clause(sql),
        "CREATE" | "ALTER" | "DROP" | "TRUNCATE" | "GRANT" | "REVOKE" | "DENY" | "USE" | "SET" => false,
        _ => true,
    }
}

fn bind_json(query: &mut Query<'_>, value: &Value) {
    match value {
        Value::Null => query.bind(Option::<String>::None),
        Value::Bool(b) => query.bind(*b),
        Value::Number(n) => match n.as_i64() {
            Some(i) => query.bind(i),
            None => query.bind(n.as_f64()),
        },
        Value::String(s) => query.bind(s.clone()),
        composite => query.bind(composite.to_string()),
    }
}

fn float_json(f: f64) -> Value {
    serde_json::Number::from_f64(f).map_or(Value::Null, Value::Number)
}

fn temporal<'a, T: FromSql<'a>>(data: &'a ColumnData<'static>, render: impl FnOnce(T) -> String) -> Value {
    T::from_sql(data).ok().flatten().map_or(Value::Null, |v| Value::String(render(v)))
}

/// Convert a tiberius cell to JSON
fn column_to_json(data: &ColumnData<'static>) -> Value {
    match data {
        ColumnData::U8(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I16(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I32(v) => v.map_or(Value::Null, Value::from),
        ColumnData::I64(v) => v.map_or(Value::Null, Value::from),
        ColumnData::F32(v) => v.map_or(Value::Null, |f| float_json(f64::from(f))),
        ColumnData::F64(v) => v.map_or(Value::Null, float_json),
        ColumnData::Bit(v) => v.map_or(Value::Null, Value::Bool),
        ColumnData::String(v) => v.as_ref().map_or(Value::Null, |s| Value::String(s.to_string())),
        ColumnData::Guid(v) => v.map_or(Value::Null, |g| Value::String(g.to_string())),
        ColumnData::Binary(v) => v.as_ref().map_or(Value::Null, |bytes| {
            use base64::Engine;
            Value::String(base64::engine::general_purpose::STANDARD.encode(bytes))
        }),
        ColumnData::Numeric(v) => v.map_or(Value::Null, |n| Value::String(n.to_string())),
        ColumnData::Xml(v) => v.as_ref().map_or(Value::Null, |xml| Value::String(xml.to_string())),
        ColumnData::DateTime(_) | ColumnData::SmallDateTime(_) | ColumnData::DateTime2(_) => {
            temporal(data, |dt: chrono::NaiveDateTime| dt.format("%Y-%m-%dT%H:%M:%S%.f").to_string())
        }
        ColumnData::Date(_) => temporal(data, |d: chrono::NaiveDate| d.format("%Y-%m-%d").to_string()),
        ColumnData::Time(_) => temporal(data, |t: chrono::NaiveTime| t.format("%H:%M:%S%.f").to_string()),
        ColumnData::DateTimeOffset(_) => {
            temporal(data, |dt: chrono::DateTime<chrono::FixedOffset>| dt.to_rfc3339())
        }
    }
}

fn text(row: &Row, idx: usize) -> Result<String> {
    row.try_get::<&str, usize>(idx)
        .map_err(mssql_error)?
        .map(str::to_string)
        .ok_or_else(|| mssql_error(format!("NULL in catalog column {idx}")))
}

fn flag(row: &Row, idx: usize) -> Result<bool> {
    Ok(row.try_get::<bool, usize>(idx).map_err(mssql_error)?.unwrap_or(false))
}

#[async_trait]
impl EngineAdapter for SqlServerAdapter {
    async fn connect(&self) -> Result<()> {
        let _gate = self.slot.lock_lifecycle().await;
        if self.slot.is_set() {
            return Ok(());
        }

        let config = build_mssql_config(&self.params)?;
        let connect_timeout = self.options.connection_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let pool = Pool::builder()
            .max_size(MAX_POOL_SIZE)
            .idle_timeout(Some(IDLE_TIMEOUT))
            .connection_timeout(connect_timeout)
            .build(ConnectionManager::new(config))
            .await
            .map_err(mssql_error)?;

        {
            let mut conn = pool.get().await.map_err(mssql_error)?;
            conn.simple_query("SELECT 1")
                .await
                .map_err(mssql_error)?
                .into_results()
                .await
                .map_err(mssql_error)?;
        }

        self.slot.set(pool);
        info!(engine = ENGINE, "Connection pool ready");
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        let _gate = self.slot.lock_lifecycle().await;
        if self.slot.take().is_some() {
            debug!(engine = ENGINE, "Connection pool released");
        }
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.slot.is_set()
    }

    async fn execute(&self, sql: &str, params: &[Value], limits: ExecLimits) -> Result<QueryResult> {
        let pool = self.slot.require(ENGINE)?;
        let fetch_limit = limits.fetch_limit();
        let statement = rewrite_mssql_placeholders(&inject_top(sql, fetch_limit))?;
        let returns_rows = may_return_rows(sql);

        with_timeout(ENGINE, limits.timeout, async {
            let mut conn = pool.get().await.map_err(mssql_error)?;
            let mut query = Query::new(statement.as_str());
            for param in params {
                bind_json(&mut query, param);
            }

            if !returns_rows {
                let result = query.execute(&mut *conn).await.map_err(mssql_error)?;
                return Ok(QueryResult::affected(result.total()));
            }

            let mut stream = query.query(&mut *conn).await.map_err(mssql_error)?;
            let mut columns: Vec<String> = Vec::new();
            let mut rows = Vec::new();
            let mut has_result_set = false;
            while let Some(item) = stream.try_next().await.map_err(mssql_error)? {
                match item {
                    QueryItem::Metadata(meta) if meta.result_index() == 0 => {
                        has_result_set = true;
                        columns = meta.columns().iter().map(|c| c.name().to_string()).collect();
                    }
                    QueryItem::Metadata(_) => break,
                    QueryItem::Row(row) => {
                        if row.result_index() > 0 {
                            break;
                        }
                        let values = row.into_iter().map(|data| column_to_json(&data)).collect();
                        rows.push(zip_row(&columns, values));
                        if rows.len() >= fetch_limit {
                            break;
                        }
                    }
                }
            }

            drop(stream);

            if !has_result_set {
                return Ok(QueryResult::affected(0));
            }
            debug!(engine = ENGINE, fetched = rows.len(), "Statement complete");
            Ok(QueryResult::from_fetched(columns, rows, limits.max_rows))
        })
        .await
    }

    async fn search_objects(&self, filter: &SearchFilter) -> Result<Vec<SchemaObject>> {
        let pattern = Some(filter.pattern());
        let schema = filter.schema.as_deref();
        let table = filter.table.as_deref();

        match filter.object_type {
            ObjectType::Schema => {
                let sql = "SELECT name FROM sys.schemas \
                           WHERE name NOT IN ('sys', 'INFORMATION_SCHEMA', 'guest') AND name NOT LIKE 'db[_]%' \
                           AND name LIKE @P1 ORDER BY name";
                self.catalog(sql, &[pattern], |row| Ok(SchemaObject::Schema { name: text(row, 0)? })).await
            }
            ObjectType::Table => {
                let sql = format!(
                    "SELECT TOP {TABLE_LISTING_CAP} s.name, t.name FROM sys.tables t \
                     JOIN sys.schemas s ON s.schema_id = t.schema_id \
                     WHERE (@P1 IS NULL OR s.name = @P1) AND t.name LIKE @P2 \
                     ORDER BY s.name, t.name"
                );
                self.catalog(&sql, &[schema, pattern], |row| {
                    Ok(SchemaObject::Table { schema: Some(text(row, 0)?), name: text(row, 1)? })
                })
                .await
            }
            ObjectType::Column => {
                let Some(table_name) = table else {
                    return Ok(Vec::new());
                };
                let sql = "SELECT s.name, c.name, ty.name, c.is_nullable, \
                             CAST(CASE WHEN EXISTS ( \
                               SELECT 1 FROM sys.indexes i \
                               JOIN sys.index_columns ic ON ic.object_id = i.object_id AND ic.index_id = i.index_id \
                               WHERE i.object_id = t.object_id AND i.is_primary_key = 1 AND ic.column_id = c.column_id \
                             ) THEN 1 ELSE 0 END AS bit) \
                           FROM sys.columns c \
                           JOIN sys.tables t ON t.object_id = c.object_id \
                           JOIN sys.schemas s ON s.schema_id = t.schema_id \
                           JOIN sys.types ty ON ty.user_type_id = c.user_type_id \
                           WHERE t.name = @P1 AND s.name = COALESCE(@P2, SCHEMA_NAME()) AND c.name LIKE @P3 \
                           ORDER BY c.column_id";
                self.catalog(sql, &[Some(table_name), schema, pattern], |row| {
                    Ok(SchemaObject::Column {
                        schema: Some(text(row, 0)?),
                        name: text(row, 1)?,
                        table: table_name.to_string(),
                        data_type: text(row, 2)?,
                        nullable: flag(row, 3)?,
                        primary_key: flag(row, 4)?,
                    })
                })
                .await
            }
            ObjectType::Index => {
                let sql = "SELECT s.name, t.name, i.name, i.is_unique FROM sys.indexes i \
                           JOIN sys.tables t ON t.object_id = i.object_id \
                           JOIN sys.schemas s ON s.schema_id = t.schema_id \
                           WHERE i.name IS NOT NULL \
                             AND (@P1 IS NULL OR s.name = @P1) AND (@P2 IS NULL OR t.name = @P2) \
                             AND i.name LIKE @P3 \
                           ORDER BY s.name, t.name, i.name";
                self.catalog(sql, &[schema, table, pattern], |row| {
                    Ok(SchemaObject::Index {
                        schema: Some(text(row, 0)?),
                        table: text(row, 1)?,
                        name: text(row, 2)?,
                        unique: flag(row, 3)?,
                    })
                })
                .await
            }
            ObjectType::Procedure => {
                let sql = "SELECT s.name, p.name FROM sys.procedures p \
                           JOIN sys.schemas s ON s.schema_id = p.schema_id \
                           WHERE (@P1 IS NULL OR s.name = @P1) AND p.name LIKE @P2 \
                           ORDER BY s.name, p.name";
                self.catalog(sql, &[schema, pattern], |row| {
                    Ok(SchemaObject::Procedure { schema: Some(text(row, 0)?), name: text(row, 1)? })
                })
                .await
            }
        }
    }
}
