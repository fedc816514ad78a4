//! Per-Source Connector
//!
//! A [`Connector`] wraps one engine [`Adapter`] with the policy every engine
//! shares: connectivity checks, read-only enforcement, multi-statement
//! rejection, effective row/timeout limits and error normalization.
//!
//! # Execute Template
//! 1. Not connected → `Query` error ("Not connected"), no I/O
//! 2. Read-only source and a write statement → `Query` error, no I/O
//! 3. More than one statement → `Query` error, no I/O
//! 4. Delegate to the adapter with the effective limits
//! 5. Driver errors become `Query` errors carrying the source id and statement

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::capability::{has_multiple_statements, is_write_statement};
use crate::config::{ConnectorOptions, Settings, SourceDescriptor};
use crate::engine::{
    Adapter, EngineType, ExecLimits, ExecuteOptions, ObjectType, QueryResult, SchemaObject, SearchFilter,
};
use crate::error::{RelayError, Result};

/// Point-in-time view of one connector
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceInfo {
    pub id: String,
    #[serde(rename = "type")]
    pub engine: EngineType,
    pub readonly: bool,
    pub connected: bool,
}

/// One configured source and its engine handle
pub struct Connector {
    id: String,
    engine: EngineType,
    options: ConnectorOptions,
    adapter: Adapter,
}

impl Connector {
    /// Build the connector for a source descriptor.
    ///
    /// Resolves `password_env`, merges the global settings and picks the
    /// adapter for the engine type. Nothing is connected yet.
    pub fn new(source: &SourceDescriptor, settings: &Settings) -> Result<Self> {
        let resolved = source.resolve()?;
        let options = ConnectorOptions::merge(settings, &resolved);
        let adapter = Adapter::for_source(&resolved, &options)?;
        Ok(Self::with_adapter(resolved.id, resolved.engine, options, adapter))
    }

    /// Wrap an already-built adapter
    pub fn with_adapter(
        id: impl Into<String>,
        engine: EngineType,
        options: ConnectorOptions,
        adapter: Adapter,
    ) -> Self {
        Self { id: id.into(), engine, options, adapter }
    }

    #[must_use]
    pub fn id(&self) -> &str {
        &self.id
    }

    #[must_use]
    pub const fn engine(&self) -> EngineType {
        self.engine
    }

    #[must_use]
    pub const fn options(&self) -> &ConnectorOptions {
        &self.options
    }

    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.adapter.as_engine().is_connected()
    }

    #[must_use]
    pub fn info(&self) -> SourceInfo {
        SourceInfo {
            id: self.id.clone(),
            engine: self.engine,
            readonly: self.options.readonly,
            connected: self.is_connected(),
        }
    }

    /// Open the engine handle; a no-op when already connected
    pub async fn connect(&self) -> Result<()> {
        if self.is_connected() {
            return Ok(());
        }
        self.adapter
            .as_engine()
            .connect()
            .await
            .map_err(|e| e.into_connection_error(&self.id))?;
        info!(source = %self.id, engine = %self.engine, "Connected");
        Ok(())
    }

    /// Release the engine handle. Close failures are logged, never returned.
    pub async fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        match self.adapter.as_engine().disconnect().await {
            Ok(()) => info!(source = %self.id, "Disconnected"),
            Err(e) => warn!(source = %self.id, "Disconnect reported an error: {e}"),
        }
    }

    /// Effective limits for one call
    fn limits(&self, overrides: ExecuteOptions) -> Result<ExecLimits> {
        let max_rows = match overrides.max_rows {
            Some(0) => return Err(RelayError::invalid_input("max_rows must be greater than 0")),
            Some(n) => n,
            None => self.options.max_rows,
        };
        Ok(ExecLimits { max_rows, timeout: overrides.timeout.or(self.options.query_timeout) })
    }

    /// Run one statement under the source's policy
    pub async fn execute(&self, sql: &str, params: &[Value], overrides: ExecuteOptions) -> Result<QueryResult> {
        // Input errors come first: an empty statement is rejected even when disconnected
        if sql.trim().is_empty() {
            return Err(RelayError::invalid_input("SQL statement cannot be empty"));
        }
        if !self.is_connected() {
            return Err(RelayError::query(&self.id, "Not connected"));
        }
        if self.options.readonly && is_write_statement(sql) {
            return Err(RelayError::query_with_statement(
                &self.id,
                sql,
                "Write statements are not allowed: source is in read-only mode",
            ));
        }
        if has_multiple_statements(sql) {
            return Err(RelayError::query_with_statement(
                &self.id,
                sql,
                "Multiple statements are not allowed; send one statement per call",
            ));
        }

        let limits = self.limits(overrides)?;
        debug!(source = %self.id, max_rows = limits.max_rows, params = params.len(), "Dispatching statement");

        let result = self
            .adapter
            .as_engine()
            .execute(sql, params, limits)
            .await
            .map_err(|e| e.into_query_error(&self.id, sql))?;
        if result.truncated {
            debug!(source = %self.id, returned = result.rows.len(), "Result truncated");
        }
        Ok(result)
    }

    /// Catalog lookup; column search without a table yields nothing
    pub async fn search_objects(&self, filter: &SearchFilter) -> Result<Vec<SchemaObject>> {
        if !self.is_connected() {
            return Err(RelayError::query(&self.id, "Not connected"));
        }
        if filter.object_type == ObjectType::Column && filter.table.is_none() {
            return Ok(Vec::new());
        }

        debug!(source = %self.id, object_type = filter.object_type.as_str(), "Searching objects");
        self.adapter
            .as_engine()
            .search_objects(filter)
            .await
            .map_err(|e| e.into_catalog_error(&self.id))
    }

    /// Round-trip `SELECT 1`; any failure reads as `false`
    pub async fn test_connection(&self) -> bool {
        match self.execute("SELECT 1", &[], ExecuteOptions::default()).await {
            Ok(_) => true,
            Err(e) => {
                debug!(source = %self.id, "Connection test failed: {e}");
                false
            }
        }
    }
}
