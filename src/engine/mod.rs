//! Engine Adapters and Shared Result Types
//!
//! This module defines the contract every engine adapter implements and the
//! normalized shapes (tabular results, schema objects) they all populate.
//!
//! # Closed Dispatch
//! [`Adapter`] is a closed union over the supported engines. The factory
//! [`Adapter::for_source`] maps a descriptor's engine type to its variant with
//! an exhaustive match, so adding an engine means extending both.
//!
//! # Handle Ownership
//! Each adapter keeps its engine handle (pool, connection or session) in a
//! [`HandleSlot`]. An empty slot is the disconnected state.

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

use crate::config::{ConnectorOptions, SourceDescriptor};
use crate::error::{RelayError, Result};

pub mod hive;

#[cfg(feature = "sqlite")]
pub mod sqlite;

#[cfg(feature = "postgres")]
pub mod postgres;

#[cfg(feature = "mysql")]
pub mod mysql;

#[cfg(feature = "mssql")]
pub mod sqlserver;

/// Upper bound on table listings for engines with global catalogs
pub const TABLE_LISTING_CAP: usize = 100;

/// Supported database engine types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineType {
    /// `PostgreSQL`
    Postgres,
    /// `MySQL`
    #[serde(rename = "mysql")]
    MySql,
    /// `MariaDB` (served by the `MySQL` adapter)
    #[serde(rename = "mariadb")]
    MariaDb,
    /// Microsoft SQL Server
    #[serde(rename = "sqlserver", alias = "mssql")]
    SqlServer,
    /// `SQLite`
    Sqlite,
    /// Apache Hive (`HiveServer2`)
    Hive,
    /// Apache Impala
    Impala,
}

impl EngineType {
    /// Get the engine name as a string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Postgres => "postgres",
            Self::MySql => "mysql",
            Self::MariaDb => "mariadb",
            Self::SqlServer => "sqlserver",
            Self::Sqlite => "sqlite",
            Self::Hive => "hive",
            Self::Impala => "impala",
        }
    }
}

impl std::fmt::Display for EngineType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One result row: column name to value, in column order
pub type Row = serde_json::Map<String, serde_json::Value>;

/// Normalized tabular result
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QueryResult {
    /// Column names in engine order
    pub columns: Vec<String>,

    /// Returned rows (never more than the effective row cap)
    pub rows: Vec<Row>,

    /// Rows fetched from the engine before truncation, or rows affected for writes
    pub row_count: u64,

    /// More rows existed than were returned
    pub truncated: bool,
}

impl QueryResult {
    /// Build a result from up to `max_rows + 1` fetched rows.
    ///
    /// More than `max_rows` fetched rows sets `truncated` and keeps the first
    /// `max_rows`; `row_count` is the fetched count.
    #[must_use]
    pub fn from_fetched(columns: Vec<String>, mut rows: Vec<Row>, max_rows: usize) -> Self {
        let row_count = rows.len() as u64;
        let truncated = crate::capability::truncate_rows(&mut rows, max_rows);
        Self { columns, rows, row_count, truncated }
    }

    /// Result of a statement that returns no rows
    #[must_use]
    pub fn affected(row_count: u64) -> Self {
        Self { columns: Vec::new(), rows: Vec::new(), row_count, truncated: false }
    }

    /// Result carrying a synthesized status row (e.g. `{affectedRows, insertId}`)
    #[must_use]
    pub fn status(row: Row, row_count: u64) -> Self {
        Self {
            columns: row.keys().cloned().collect(),
            rows: vec![row],
            row_count,
            truncated: false,
        }
    }
}

/// Build a row from column names and values of equal length
pub(crate) fn zip_row(columns: &[String], values: Vec<serde_json::Value>) -> Row {
    columns.iter().cloned().zip(values).collect()
}

/// Schema object kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ObjectType {
    Schema,
    #[default]
    Table,
    Column,
    Index,
    Procedure,
}

impl ObjectType {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Schema => "schema",
            Self::Table => "table",
            Self::Column => "column",
            Self::Index => "index",
            Self::Procedure => "procedure",
        }
    }
}

impl FromStr for ObjectType {
    type Err = RelayError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "schema" => Ok(Self::Schema),
            "table" => Ok(Self::Table),
            "column" => Ok(Self::Column),
            "index" => Ok(Self::Index),
            "procedure" => Ok(Self::Procedure),
            other => Err(RelayError::invalid_input(format!(
                "Unknown object type '{other}' (expected schema, table, column, index or procedure)"
            ))),
        }
    }
}

/// One discovered schema object
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum SchemaObject {
    Schema {
        name: String,
    },
    Table {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
    },
    Column {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
        table: String,
        data_type: String,
        nullable: bool,
        primary_key: bool,
    },
    Index {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
        table: String,
        unique: bool,
    },
    Procedure {
        name: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        schema: Option<String>,
    },
}

impl SchemaObject {
    #[must_use]
    pub fn name(&self) -> &str {
        match self {
            Self::Schema { name }
            | Self::Table { name, .. }
            | Self::Column { name, .. }
            | Self::Index { name, .. }
            | Self::Procedure { name, .. } => name,
        }
    }

    #[must_use]
    pub const fn object_type(&self) -> ObjectType {
        match self {
            Self::Schema { .. } => ObjectType::Schema,
            Self::Table { .. } => ObjectType::Table,
            Self::Column { .. } => ObjectType::Column,
            Self::Index { .. } => ObjectType::Index,
            Self::Procedure { .. } => ObjectType::Procedure,
        }
    }
}

/// Progressive discovery filter
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchFilter {
    #[serde(default)]
    pub object_type: ObjectType,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub schema: Option<String>,

    /// Owning table (required for column search)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub table: Option<String>,

    /// `LIKE` pattern on the object name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

impl SearchFilter {
    /// Name pattern, `%` when unset
    #[must_use]
    pub fn pattern(&self) -> &str {
        self.pattern.as_deref().filter(|p| !p.is_empty()).unwrap_or("%")
    }

    /// Reject combinations the tool boundary refuses to forward
    pub fn validate(&self) -> Result<()> {
        if self.object_type == ObjectType::Column && self.table.is_none() {
            return Err(RelayError::invalid_input("Column search requires a table name"));
        }
        Ok(())
    }
}

/// Per-call overrides for `execute`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecuteOptions {
    pub max_rows: Option<usize>,
    pub timeout: Option<Duration>,
}

/// Effective limits handed to an adapter
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecLimits {
    pub max_rows: usize,
    pub timeout: Option<Duration>,
}

impl ExecLimits {
    /// Rows requested from the engine: one past the cap, to detect truncation
    #[must_use]
    pub const fn fetch_limit(&self) -> usize {
        self.max_rows + 1
    }
}

/// Run an engine future under an optional deadline
pub(crate) async fn with_timeout<T, F>(engine: &str, timeout: Option<Duration>, fut: F) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
{
    with_deadline(engine, timeout, fut, || async {}).await
}

/// Like [`with_timeout`], running `on_expiry` once the deadline fires.
///
/// The engine future is dropped before `on_expiry` starts.
pub(crate) async fn with_deadline<T, F, C, CF>(
    engine: &str,
    timeout: Option<Duration>,
    fut: F,
    on_expiry: C,
) -> Result<T>
where
    F: std::future::Future<Output = Result<T>>,
    C: FnOnce() -> CF,
    CF: std::future::Future<Output = ()>,
{
    let Some(limit) = timeout else {
        return fut.await;
    };
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => {
            on_expiry().await;
            Err(RelayError::engine_error(engine, format!("timed out after {}ms", limit.as_millis())))
        }
    }
}

/// Holder for an adapter's engine handle.
///
/// Reads clone the handle out of a short-held lock; `connect`/`disconnect`
/// serialize on the async lifecycle gate.
pub(crate) struct HandleSlot<H> {
    handle: RwLock<Option<H>>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl<H: Clone> HandleSlot<H> {
    pub(crate) fn new() -> Self {
        Self { handle: RwLock::new(None), lifecycle: tokio::sync::Mutex::new(()) }
    }

    pub(crate) fn get(&self) -> Option<H> {
        self.handle.read().clone()
    }

    pub(crate) fn is_set(&self) -> bool {
        self.handle.read().is_some()
    }

    pub(crate) fn set(&self, handle: H) {
        *self.handle.write() = Some(handle);
    }

    pub(crate) fn take(&self) -> Option<H> {
        self.handle.write().take()
    }

    pub(crate) async fn lock_lifecycle(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.lifecycle.lock().await
    }

    /// Current handle or a "not connected" engine error
    pub(crate) fn require(&self, engine: &str) -> Result<H> {
        self.get().ok_or_else(|| RelayError::engine_error(engine, "Not connected"))
    }
}

/// Engine-specific half of the connector contract
#[async_trait]
pub trait EngineAdapter: Send + Sync {
    /// Establish the engine handle; a no-op when already connected
    async fn connect(&self) -> Result<()>;

    /// Release the engine handle; the adapter is disconnected afterwards even on error
    async fn disconnect(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    /// Run one statement with the effective limits
    async fn execute(
        &self,
        sql: &str,
        params: &[serde_json::Value],
        limits: ExecLimits,
    ) -> Result<QueryResult>;

    /// Catalog lookup for one object type
    async fn search_objects(&self, filter: &SearchFilter) -> Result<Vec<SchemaObject>>;
}

/// Closed union over the engine adapters
pub enum Adapter {
    #[cfg(feature = "postgres")]
    Postgres(postgres::PostgresAdapter),
    #[cfg(feature = "mysql")]
    MySql(mysql::MySqlAdapter),
    #[cfg(feature = "mssql")]
    SqlServer(sqlserver::SqlServerAdapter),
    #[cfg(feature = "sqlite")]
    Sqlite(sqlite::SqliteAdapter),
    Hive(hive::HiveAdapter),
    Impala(hive::HiveAdapter),
}

macro_rules! dispatch {
    ($self:expr, $adapter:ident => $body:expr) => {
        match $self {
            #[cfg(feature = "postgres")]
            Adapter::Postgres($adapter) => $body,
            #[cfg(feature = "mysql")]
            Adapter::MySql($adapter) => $body,
            #[cfg(feature = "mssql")]
            Adapter::SqlServer($adapter) => $body,
            #[cfg(feature = "sqlite")]
            Adapter::Sqlite($adapter) => $body,
            Adapter::Hive($adapter) | Adapter::Impala($adapter) => $body,
        }
    };
}

fn feature_disabled(source: &SourceDescriptor, feature: &str) -> RelayError {
    RelayError::config_error(format!(
        "Source '{}' uses engine '{}', but dbrelay was built without the '{feature}' feature",
        source.id, source.engine
    ))
}

impl Adapter {
    /// Build the adapter for a (password-resolved) source descriptor
    pub fn for_source(source: &SourceDescriptor, options: &ConnectorOptions) -> Result<Self> {
        let params = source.connection_params()?;

        match source.engine {
            EngineType::Postgres => {
                #[cfg(feature = "postgres")]
                {
                    Ok(Self::Postgres(postgres::PostgresAdapter::new(params, *options)))
                }
                #[cfg(not(feature = "postgres"))]
                {
                    Err(feature_disabled(source, "postgres"))
                }
            }
            EngineType::MySql | EngineType::MariaDb => {
                #[cfg(feature = "mysql")]
                {
                    Ok(Self::MySql(mysql::MySqlAdapter::new(source.engine, params, *options)))
                }
                #[cfg(not(feature = "mysql"))]
                {
                    Err(feature_disabled(source, "mysql"))
                }
            }
            EngineType::SqlServer => {
                #[cfg(feature = "mssql")]
                {
                    Ok(Self::SqlServer(sqlserver::SqlServerAdapter::new(params, *options)))
                }
                #[cfg(not(feature = "mssql"))]
                {
                    Err(feature_disabled(source, "mssql"))
                }
            }
            EngineType::Sqlite => {
                #[cfg(feature = "sqlite")]
                {
                    Ok(Self::Sqlite(sqlite::SqliteAdapter::new(params, *options)))
                }
                #[cfg(not(feature = "sqlite"))]
                {
                    Err(feature_disabled(source, "sqlite"))
                }
            }
            EngineType::Hive => {
                Ok(Self::Hive(hive::HiveAdapter::new(hive::HiveFlavor::Hive, params, *options)?))
            }
            EngineType::Impala => {
                Ok(Self::Impala(hive::HiveAdapter::new(hive::HiveFlavor::Impala, params, *options)?))
            }
        }
    }

    /// The variant as a trait object
    #[must_use]
    pub fn as_engine(&self) -> &dyn EngineAdapter {
        dispatch!(self, adapter => adapter as &dyn EngineAdapter)
    }
}
