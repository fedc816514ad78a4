//! Hive and Impala Engine Implementation
//!
//! Both engines speak the `HiveServer2` protocol family and share this adapter;
//! [`HiveFlavor`] carries the differences (default port, Kerberos service name,
//! driver connection-string keys).
//!
//! # Features
//! - Session opened through a [`HiveDriver`], acquired once per process at runtime
//! - Optional Kerberos authentication through a [`TicketAuthenticator`]
//! - Row capping through the driver's fetch size (`max_rows + 1`), no SQL rewrite
//! - Discovery through `SHOW DATABASES`, `SHOW TABLES IN` and `DESCRIBE`
//!
//! # Implementation Notes
//! - Parameterized statements are rejected
//! - Name patterns are matched client-side with `LIKE` semantics, case-insensitively
//! - Index and procedure searches return nothing
//! - No statement deadline is enforced

use async_trait::async_trait;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::auth::TicketAuthenticator;
use crate::capability::{like_match, strip_trailing_semicolon, validate_identifier};
use crate::config::{AuthMechanism, ClusterParams, ConnectionParams, ConnectorOptions};
use crate::engine::{
    zip_row, EngineAdapter, ExecLimits, HandleSlot, ObjectType, QueryResult, SchemaObject,
    SearchFilter, TABLE_LISTING_CAP,
};
use crate::error::{RelayError, Result};

#[cfg(feature = "odbc")]
pub mod odbc;

/// Fetch size for catalog statements issued during discovery
const CATALOG_FETCH_SIZE: usize = 10_000;

/// Engine flavor sharing the Hive transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HiveFlavor {
    Hive,
    Impala,
}

impl HiveFlavor {
    #[must_use]
    pub const fn default_port(&self) -> u16 {
        match self {
            Self::Hive => 10000,
            Self::Impala => 21050,
        }
    }

    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Hive => "hive",
            Self::Impala => "impala",
        }
    }

    /// Kerberos service name used when the source does not set one
    #[must_use]
    pub const fn default_service_name(&self) -> &'static str {
        self.as_str()
    }

    /// ODBC driver name used when the source does not set one
    #[must_use]
    pub const fn default_odbc_driver(&self) -> &'static str {
        match self {
            Self::Hive => "Cloudera ODBC Driver for Apache Hive",
            Self::Impala => "Cloudera ODBC Driver for Impala",
        }
    }
}

/// Everything a driver needs to open a session
#[derive(Debug, Clone)]
pub struct SessionRequest {
    pub flavor: HiveFlavor,
    pub params: ConnectionParams,
    pub connection_timeout: Option<Duration>,
}

/// Rows returned by one fetch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FetchedRows {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<Value>>,
}

/// Transport able to open `HiveServer2` sessions
#[async_trait]
pub trait HiveDriver: Send + Sync {
    async fn open_session(&self, request: &SessionRequest) -> Result<Arc<dyn HiveSession>>;
}

/// One open session
#[async_trait]
pub trait HiveSession: Send + Sync {
    /// Run a statement and return at most `fetch_size` rows
    async fn execute(&self, statement: &str, fetch_size: usize) -> Result<FetchedRows>;

    async fn close(&self) -> Result<()>;
}

/// Process-wide driver, looked up on first use and cached either way
pub fn runtime_driver() -> Result<Arc<dyn HiveDriver>> {
    static DRIVER: OnceLock<std::result::Result<Arc<dyn HiveDriver>, String>> = OnceLock::new();

    DRIVER
        .get_or_init(load_driver)
        .clone()
        .map_err(|reason| RelayError::engine_error("hive", format!("driver unavailable: {reason}")))
}

#[cfg(feature = "odbc")]
fn load_driver() -> std::result::Result<Arc<dyn HiveDriver>, String> {
    odbc::OdbcDriver::load().map(|driver| Arc::new(driver) as Arc<dyn HiveDriver>)
}

#[cfg(not(feature = "odbc"))]
fn load_driver() -> std::result::Result<Arc<dyn HiveDriver>, String> {
    Err("dbrelay was built without the 'odbc' feature".to_string())
}

/// Driver connection string for a cluster source
///
/// A `dsn` is passed through untouched; discrete fields are mapped onto the
/// Cloudera driver keys for the flavor.
pub fn odbc_connection_string(flavor: HiveFlavor, params: &ConnectionParams) -> Result<String> {
    let cluster = match params {
        ConnectionParams::Dsn(dsn) => return Ok(dsn.clone()),
        ConnectionParams::Cluster(cluster) => cluster,
        _ => {
            return Err(RelayError::config_error(format!(
                "{} sources require a cluster host or a dsn",
                flavor.as_str()
            )))
        }
    };

    let driver = cluster.odbc_driver.as_deref().unwrap_or(flavor.default_odbc_driver());
    let port = cluster.port.unwrap_or(flavor.default_port());
    let mut parts = vec![
        format!("Driver={{{driver}}}"),
        format!("Host={}", odbc_value(&cluster.host)),
        format!("Port={port}"),
    ];

    if let Some(database) = &cluster.database {
        let key = match flavor {
            HiveFlavor::Hive => "Schema",
            HiveFlavor::Impala => "Database",
        };
        parts.push(format!("{key}={}", odbc_value(database)));
    }
    if flavor == HiveFlavor::Hive {
        parts.push("HiveServerType=2".to_string());
    }

    match cluster.auth {
        AuthMechanism::None => parts.push("AuthMech=0".to_string()),
        AuthMechanism::Kerberos => {
            parts.push("AuthMech=1".to_string());
            let service = cluster.service_name.as_deref().unwrap_or(flavor.default_service_name());
            parts.push(format!("KrbServiceName={}", odbc_value(service)));
            let fqdn_key = match flavor {
                HiveFlavor::Hive => "KrbHostFQDN",
                HiveFlavor::Impala => "KrbFQDN",
            };
            parts.push(format!("{fqdn_key}={}", odbc_value(&cluster.host)));
            if let Some(realm) = cluster.realm.as_deref().or_else(|| realm_of(cluster)) {
                parts.push(format!("KrbRealm={}", odbc_value(realm)));
            }
        }
        AuthMechanism::Plain => {
            let user = cluster.user.as_deref().unwrap_or_default();
            match &cluster.password {
                Some(password) => {
                    parts.push("AuthMech=3".to_string());
                    parts.push(format!("UID={}", odbc_value(user)));
                    parts.push(format!("PWD={}", odbc_value(password)));
                }
                None => {
                    parts.push("AuthMech=2".to_string());
                    parts.push(format!("UID={}", odbc_value(user)));
                }
            }
        }
    }

    if cluster.ssl {
        parts.push("SSL=1".to_string());
    }

    Ok(parts.join(";"))
}

/// Realm taken from the principal (`user@REALM`)
fn realm_of(cluster: &ClusterParams) -> Option<&str> {
    cluster.principal.as_deref().and_then(|p| p.rsplit_once('@')).map(|(_, realm)| realm)
}

/// Brace-quote values containing separators
fn odbc_value(value: &str) -> String {
    if value.contains([';', '{', '}', '=']) || value.starts_with(' ') || value.ends_with(' ') {
        format!("{{{}}}", value.replace('}', "}}"))
    } else {
        value.to_string()
    }
}

/// Hive/Impala adapter
pub struct HiveAdapter {
    flavor: HiveFlavor,
    params: ConnectionParams,
    options: ConnectorOptions,
    driver: Option<Arc<dyn HiveDriver>>,
    authenticator: Option<TicketAuthenticator>,
    slot: HandleSlot<Arc<dyn HiveSession>>,
}

impl HiveAdapter {
    /// Adapter using the process-wide runtime driver
    pub fn new(flavor: HiveFlavor, params: ConnectionParams, options: ConnectorOptions) -> Result<Self> {
        let authenticator = match &params {
            ConnectionParams::Cluster(cluster) if cluster.auth == AuthMechanism::Kerberos => {
                match (&cluster.principal, &cluster.keytab) {
                    (Some(principal), Some(keytab)) => {
                        Some(TicketAuthenticator::new(principal.clone(), keytab.clone()))
                    }
                    _ => {
                        return Err(RelayError::config_error(
                            "Kerberos authentication requires 'principal' and 'keytab'",
                        ))
                    }
                }
            }
            ConnectionParams::Cluster(_) | ConnectionParams::Dsn(_) => None,
            _ => {
                return Err(RelayError::config_error(format!(
                    "{} sources require a cluster host or a dsn",
                    flavor.as_str()
                )))
            }
        };

        Ok(Self {
            flavor,
            params,
            options,
            driver: None,
            authenticator,
            slot: HandleSlot::new(),
        })
    }

    /// Use a specific driver instead of the runtime one
    #[must_use]
    pub fn with_driver(mut self, driver: Arc<dyn HiveDriver>) -> Self {
        self.driver = Some(driver);
        self
    }

    /// Replace the Kerberos authenticator
    #[must_use]
    pub fn with_authenticator(mut self, authenticator: TicketAuthenticator) -> Self {
        self.authenticator = Some(authenticator);
        self
    }

    #[must_use]
    pub const fn flavor(&self) -> HiveFlavor {
        self.flavor
    }

    fn driver(&self) -> Result<Arc<dyn HiveDriver>> {
        match &self.driver {
            Some(driver) => Ok(driver.clone()),
            None => runtime_driver(),
        }
    }

    async fn run(&self, statement: &str, fetch_size: usize) -> Result<FetchedRows> {
        let session = self.slot.require(self.flavor.as_str())?;
        if let Some(authenticator) = &self.authenticator {
            authenticator.ensure_valid().await?;
        }
        debug!(engine = self.flavor.as_str(), fetch_size, "Executing statement");
        session.execute(statement, fetch_size).await
    }

    /// First column of a catalog statement, as strings
    async fn first_column(&self, statement: &str) -> Result<Vec<String>> {
        let fetched = self.run(statement, CATALOG_FETCH_SIZE).await?;
        Ok(fetched.rows.into_iter().filter_map(|row| row.into_iter().next()).map(text_of).collect())
    }

    async fn list_databases(&self) -> Result<Vec<String>> {
        let mut databases = self.first_column("SHOW DATABASES").await?;
        databases.sort();
        Ok(databases)
    }

    async fn list_tables(&self, database: &str) -> Result<Vec<String>> {
        let database = validate_identifier(database)?;
        let mut tables = self.first_column(&format!("SHOW TABLES IN `{database}`")).await?;
        tables.sort();
        Ok(tables)
    }

    /// `(name, type)` pairs in declared order
    async fn describe(&self, database: &str, table: &str) -> Result<Vec<(String, String)>> {
        let database = validate_identifier(database)?;
        let table = validate_identifier(table)?;
        let fetched = self.run(&format!("DESCRIBE `{database}`.`{table}`"), CATALOG_FETCH_SIZE).await?;

        let mut columns = Vec::new();
        for row in fetched.rows {
            let mut values = row.into_iter().map(text_of);
            let name = values.next().unwrap_or_default().trim().to_string();
            // Partition and detail sections follow the first blank or '#' row
            if name.is_empty() || name.starts_with('#') {
                break;
            }
            let data_type = values.next().unwrap_or_default().trim().to_string();
            columns.push((name, data_type));
        }
        Ok(columns)
    }

    async fn search_schemas(&self, pattern: &str) -> Result<Vec<SchemaObject>> {
        Ok(self
            .list_databases()
            .await?
            .into_iter()
            .filter(|name| like_match(pattern, name))
            .map(|name| SchemaObject::Schema { name })
            .collect())
    }

    async fn search_tables(&self, schema: Option<&str>, pattern: &str) -> Result<Vec<SchemaObject>> {
        let databases = match schema {
            Some(schema) => vec![schema.to_string()],
            None => self.list_databases().await?,
        };

        let mut found = Vec::new();
        for database in databases {
            for name in self.list_tables(&database).await? {
                if like_match(pattern, &name) {
                    found.push(SchemaObject::Table { name, schema: Some(database.clone()) });
                    if found.len() >= TABLE_LISTING_CAP {
                        return Ok(found);
                    }
                }
            }
        }
        Ok(found)
    }

    async fn search_columns(
        &self,
        schema: Option<&str>,
        table: &str,
        pattern: &str,
    ) -> Result<Vec<SchemaObject>> {
        let database = schema.unwrap_or("default");
        Ok(self
            .describe(database, table)
            .await?
            .into_iter()
            .filter(|(name, _)| like_match(pattern, name))
            .map(|(name, data_type)| SchemaObject::Column {
                name,
                schema: Some(database.to_string()),
                table: table.to_string(),
                data_type,
                nullable: true,
                primary_key: false,
            })
            .collect())
    }
}

fn text_of(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

#[async_trait]
impl EngineAdapter for HiveAdapter {
    async fn connect(&self) -> Result<()> {
        let _gate = self.slot.lock_lifecycle().await;
        if self.slot.is_set() {
            return Ok(());
        }

        let driver = self.driver()?;
        if let Some(authenticator) = &self.authenticator {
            authenticator.initialize().await?;
        }

        let request = SessionRequest {
            flavor: self.flavor,
            params: self.params.clone(),
            connection_timeout: self.options.connection_timeout,
        };
        match driver.open_session(&request).await {
            Ok(session) => {
                self.slot.set(session);
                info!(engine = self.flavor.as_str(), "Session opened");
                Ok(())
            }
            Err(e) => {
                if let Some(authenticator) = &self.authenticator {
                    authenticator.destroy().await;
                }
                Err(e)
            }
        }
    }

    async fn disconnect(&self) -> Result<()> {
        let _gate = self.slot.lock_lifecycle().await;
        let closed = match self.slot.take() {
            Some(session) => session.close().await,
            None => Ok(()),
        };
        if let Err(e) = &closed {
            warn!(engine = self.flavor.as_str(), "Session close failed: {}", e.message());
        }
        if let Some(authenticator) = &self.authenticator {
            authenticator.destroy().await;
        }
        closed
    }

    fn is_connected(&self) -> bool {
        self.slot.is_set()
    }

    async fn execute(&self, sql: &str, params: &[Value], limits: ExecLimits) -> Result<QueryResult> {
        if !params.is_empty() {
            return Err(RelayError::engine_error(
                self.flavor.as_str(),
                "parameterized statements are not supported",
            ));
        }

        let fetched = self.run(strip_trailing_semicolon(sql), limits.fetch_limit()).await?;
        let rows = fetched.rows.into_iter().map(|values| zip_row(&fetched.columns, values)).collect();
        Ok(QueryResult::from_fetched(fetched.columns, rows, limits.max_rows))
    }

    async fn search_objects(&self, filter: &SearchFilter) -> Result<Vec<SchemaObject>> {
        let pattern = filter.pattern();
        match filter.object_type {
            ObjectType::Schema => self.search_schemas(pattern).await,
            ObjectType::Table => self.search_tables(filter.schema.as_deref(), pattern).await,
            ObjectType::Column => match &filter.table {
                Some(table) => self.search_columns(filter.schema.as_deref(), table, pattern).await,
                None => Ok(Vec::new()),
            },
            ObjectType::Index | ObjectType::Procedure => Ok(Vec::new()),
        }
    }
}
