//! Source Registry
//!
//! Holds every configured [`Connector`] keyed by source id. Membership is fixed
//! at construction; only each connector's own handle changes afterwards.
//!
//! # Resolution
//! - An explicit id must name a configured source (`UnknownSource` otherwise)
//! - Without an id, a single configured source or one named `default` is used;
//!   anything else is `AmbiguousSource`
//!
//! # Bulk Lifecycle
//! `connect_all` tolerates partial failure and only errors when every source
//! failed; `disconnect_all` never errors.

use futures::future::join_all;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};

use crate::config::Config;
use crate::connector::{Connector, SourceInfo};
use crate::engine::{ExecuteOptions, QueryResult, SchemaObject, SearchFilter};
use crate::error::{RelayError, Result};

/// Source id picked when none is given and several are configured
pub const DEFAULT_SOURCE_ID: &str = "default";

/// Outcome of `connect_all` when at least one source connected
#[derive(Debug, Default)]
pub struct ConnectReport {
    pub connected: Vec<String>,
    pub failed: Vec<(String, RelayError)>,
}

impl ConnectReport {
    #[must_use]
    pub fn is_partial(&self) -> bool {
        !self.failed.is_empty()
    }
}

/// Registry of configured connectors
pub struct SourceRegistry {
    connectors: Vec<Arc<Connector>>,
    index: HashMap<String, usize>,
}

impl SourceRegistry {
    /// Build a connector per source. Unsupported engines and unresolvable
    /// passwords fail here, before anything connects.
    pub fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;
        let connectors = config
            .sources
            .iter()
            .map(|source| Connector::new(source, &config.settings))
            .collect::<Result<Vec<_>>>()?;
        Self::from_connectors(connectors)
    }

    /// Build from already-constructed connectors (ids must be unique)
    pub fn from_connectors(connectors: Vec<Connector>) -> Result<Self> {
        let mut index = HashMap::with_capacity(connectors.len());
        for (position, connector) in connectors.iter().enumerate() {
            if index.insert(connector.id().to_string(), position).is_some() {
                return Err(RelayError::config_error(format!("Duplicate source id '{}'", connector.id())));
            }
        }
        Ok(Self { connectors: connectors.into_iter().map(Arc::new).collect(), index })
    }

    /// Configured source ids in configuration order
    #[must_use]
    pub fn ids(&self) -> Vec<String> {
        self.connectors.iter().map(|c| c.id().to_string()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.connectors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.connectors.is_empty()
    }

    /// Pick the connector for an optional source id
    pub fn resolve(&self, id: Option<&str>) -> Result<Arc<Connector>> {
        match id {
            Some(id) => self
                .index
                .get(id)
                .map(|&position| self.connectors[position].clone())
                .ok_or_else(|| RelayError::unknown_source(id, self.ids())),
            None => {
                if let [only] = self.connectors.as_slice() {
                    return Ok(only.clone());
                }
                self.index
                    .get(DEFAULT_SOURCE_ID)
                    .map(|&position| self.connectors[position].clone())
                    .ok_or_else(|| RelayError::ambiguous_source(self.ids()))
            }
        }
    }

    /// Connect one source
    pub async fn connect(&self, id: &str) -> Result<()> {
        self.resolve(Some(id))?.connect().await
    }

    /// Connect every source concurrently.
    ///
    /// Errors only when every source failed; partial failures are logged and
    /// reported.
    pub async fn connect_all(&self) -> Result<ConnectReport> {
        let outcomes = join_all(self.connectors.iter().map(|connector| async move {
            (connector.id().to_string(), connector.connect().await)
        }))
        .await;

        let mut report = ConnectReport::default();
        for (id, outcome) in outcomes {
            match outcome {
                Ok(()) => report.connected.push(id),
                Err(e) => {
                    warn!(source = %id, "Source failed to connect: {e}");
                    report.failed.push((id, e));
                }
            }
        }

        if report.connected.is_empty() && !report.failed.is_empty() {
            let ids: Vec<&str> = report.failed.iter().map(|(id, _)| id.as_str()).collect();
            let causes: Vec<String> = report.failed.iter().map(|(id, e)| format!("{id}: {e}")).collect();
            return Err(RelayError::connection(
                ids.join(", "),
                format!("No source could be connected ({})", causes.join("; ")),
            ));
        }

        info!(connected = report.connected.len(), failed = report.failed.len(), "Sources connected");
        Ok(report)
    }

    /// Disconnect every source; failures are only logged
    pub async fn disconnect_all(&self) {
        join_all(self.connectors.iter().map(|connector| connector.disconnect())).await;
    }

    /// Snapshot of every source
    #[must_use]
    pub fn list_sources(&self) -> Vec<SourceInfo> {
        self.connectors.iter().map(|c| c.info()).collect()
    }

    /// Run a statement against the resolved source
    pub async fn execute(
        &self,
        id: Option<&str>,
        sql: &str,
        params: &[Value],
        overrides: ExecuteOptions,
    ) -> Result<QueryResult> {
        self.resolve(id)?.execute(sql, params, overrides).await
    }

    /// Catalog lookup against the resolved source.
    ///
    /// Column search without a table is refused here, before resolving.
    pub async fn search_objects(&self, id: Option<&str>, filter: &SearchFilter) -> Result<Vec<SchemaObject>> {
        filter.validate()?;
        self.resolve(id)?.search_objects(filter).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::tests::hive_connector;
    use crate::engine::hive::testing::{FakeDriver, SharedFakeDriver};
    use crate::engine::ObjectType;
    use pretty_assertions::assert_eq;

    fn healthy() -> Arc<SharedFakeDriver> {
        SharedFakeDriver::new(FakeDriver::default())
    }

    fn broken() -> Arc<SharedFakeDriver> {
        SharedFakeDriver::new(FakeDriver { fail_open: true, ..FakeDriver::default() })
    }

    fn registry(ids: &[&str]) -> SourceRegistry {
        let driver = healthy();
        SourceRegistry::from_connectors(ids.iter().map(|id| hive_connector(id, false, &driver)).collect())
            .unwrap()
    }

    #[test]
    fn test_resolve_single_source_without_id() {
        let registry = registry(&["only"]);
        assert_eq!(registry.resolve(None).unwrap().id(), "only");
    }

    #[test]
    fn test_resolve_prefers_default() {
        let registry = registry(&["a", "default", "b"]);
        assert_eq!(registry.resolve(None).unwrap().id(), "default");
        assert_eq!(registry.resolve(Some("b")).unwrap().id(), "b");
    }

    #[test]
    fn test_resolve_ambiguous_lists_ids() {
        let registry = registry(&["a", "b"]);
        let err = registry.resolve(None).err().unwrap();
        assert_eq!(err.error_code(), "AMBIGUOUS_SOURCE");
        assert!(err.message().contains("a, b"));
    }

    #[test]
    fn test_resolve_unknown_lists_ids() {
        let registry = registry(&["a", "b"]);
        let err = registry.resolve(Some("c")).err().unwrap();
        assert_eq!(err.error_code(), "UNKNOWN_SOURCE");
        assert!(err.message().contains("a, b"));
    }

    #[test]
    fn test_resolve_on_empty_registry() {
        let registry = SourceRegistry::from_connectors(Vec::new()).unwrap();
        assert_eq!(registry.resolve(None).err().unwrap().error_code(), "AMBIGUOUS_SOURCE");
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let driver = healthy();
        let result = SourceRegistry::from_connectors(vec![
            hive_connector("a", false, &driver),
            hive_connector("a", false, &driver),
        ]);
        assert_eq!(result.err().unwrap().error_code(), "CONFIG_ERROR");
    }

    #[tokio::test]
    async fn test_connect_all_tolerates_partial_failure() {
        let (good, bad) = (healthy(), broken());
        let registry = SourceRegistry::from_connectors(vec![
            hive_connector("a", false, &good),
            hive_connector("b", false, &bad),
            hive_connector("c", false, &good),
        ])
        .unwrap();

        let report = registry.connect_all().await.unwrap();
        assert_eq!(report.connected, vec!["a".to_string(), "c".to_string()]);
        assert!(report.is_partial());
        assert_eq!(report.failed[0].0, "b");

        let connected: Vec<(String, bool)> =
            registry.list_sources().into_iter().map(|s| (s.id, s.connected)).collect();
        assert_eq!(
            connected,
            vec![("a".to_string(), true), ("b".to_string(), false), ("c".to_string(), true)]
        );

        registry.disconnect_all().await;
        assert!(registry.list_sources().iter().all(|s| !s.connected));
    }

    #[tokio::test]
    async fn test_connect_all_fails_when_every_source_fails() {
        let bad = broken();
        let registry = SourceRegistry::from_connectors(vec![
            hive_connector("a", false, &bad),
            hive_connector("b", false, &bad),
        ])
        .unwrap();

        let err = registry.connect_all().await.unwrap_err();
        assert_eq!(err.error_code(), "CONNECTION_FAILED");
        assert!(err.message().contains("a: "));
        assert!(err.message().contains("b: "));
    }

    #[tokio::test]
    async fn test_connect_all_with_no_sources() {
        let registry = SourceRegistry::from_connectors(Vec::new()).unwrap();
        let report = registry.connect_all().await.unwrap();
        assert!(report.connected.is_empty());
        assert!(!report.is_partial());
    }

    #[tokio::test]
    async fn test_column_search_without_table_rejected_before_resolve() {
        let registry = registry(&["a", "b"]);
        let filter = SearchFilter { object_type: ObjectType::Column, ..SearchFilter::default() };

        // Ambiguous id would fail too; validation runs first
        let err = registry.search_objects(None, &filter).await.unwrap_err();
        assert_eq!(err.error_code(), "INVALID_INPUT");
    }
}
