//! Configuration Management
//!
//! This module loads the resolved settings and source descriptors consumed by
//! the registry.
//!
//! # Configuration Locations
//! - Local: `.dbrelay/sources.json` (team-shareable, per-project)
//! - Global: `~/.config/dbrelay/sources.json` (per-user)
//!
//! # Resolution Precedence
//! 1. Explicit `--config` path (highest priority)
//! 2. Local config file (`.dbrelay/sources.json`)
//! 3. Global config file (`~/.config/dbrelay/sources.json`)
//!
//! # Secrets
//! Passwords may be given inline or through `password_env`, which is resolved
//! from the process environment when the registry is built.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::engine::EngineType;
use crate::error::{RelayError, Result};

const DEFAULT_MAX_ROWS: usize = 1000;

fn default_max_rows() -> usize {
    DEFAULT_MAX_ROWS
}

/// Global settings shared by every source
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    /// Reject write statements on every source unless a source overrides it
    #[serde(default)]
    pub readonly: bool,

    /// Default row cap per statement (must be > 0)
    #[serde(default = "default_max_rows")]
    pub max_rows: usize,

    /// Statement timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_timeout_ms: Option<u64>,

    /// Connect timeout in milliseconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection_timeout_ms: Option<u64>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            readonly: false,
            max_rows: DEFAULT_MAX_ROWS,
            query_timeout_ms: None,
            connection_timeout_ms: None,
        }
    }
}

/// Authentication mechanism for Hive/Impala clusters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthMechanism {
    /// No authentication
    #[default]
    None,
    /// Username/password
    Plain,
    /// Kerberos ticket obtained from a keytab
    Kerberos,
}

/// Static description of one database endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceDescriptor {
    /// Unique source identifier
    pub id: String,

    /// Engine type
    #[serde(rename = "type")]
    pub engine: EngineType,

    /// Single connection string (URL, key/value or ADO form, depending on engine)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dsn: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Environment variable holding the password
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_env: Option<String>,

    /// Require TLS
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ssl: Option<bool>,

    /// Accept any server certificate (SQL Server)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trust_server_certificate: Option<bool>,

    /// Database file for SQLite (`:memory:` for an in-memory database)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// Hive/Impala authentication mechanism
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthMechanism>,

    /// Kerberos principal used with `keytab`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub principal: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keytab: Option<PathBuf>,

    /// Kerberos service name of the cluster (defaults to `hive` / `impala`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,

    /// ODBC driver name override for Hive/Impala
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub odbc_driver: Option<String>,

    /// Per-source read-only override (wins over the global setting)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub readonly: Option<bool>,
}

/// Discrete server connection fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerParams {
    pub host: String,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub user: Option<String>,
    pub password: Option<String>,
    pub ssl: bool,
    pub trust_server_certificate: bool,
}

/// Hive/Impala cluster connection fields
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClusterParams {
    pub host: String,
    pub port: Option<u16>,
    pub database: Option<String>,
    pub auth: AuthMechanism,
    pub user: Option<String>,
    pub password: Option<String>,
    pub principal: Option<String>,
    pub keytab: Option<PathBuf>,
    pub service_name: Option<String>,
    pub realm: Option<String>,
    pub odbc_driver: Option<String>,
    pub ssl: bool,
}

/// The one connection form a descriptor resolves to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionParams {
    /// Single connection string
    Dsn(String),
    /// Discrete host/port/database/user/password/TLS fields
    Server(ServerParams),
    /// Embedded database file (SQLite)
    File(String),
    /// Hive/Impala host plus authentication mechanism
    Cluster(ClusterParams),
}

impl SourceDescriptor {
    /// Descriptor with only an id and engine type set
    pub fn new(id: impl Into<String>, engine: EngineType) -> Self {
        Self {
            id: id.into(),
            engine,
            dsn: None,
            host: None,
            port: None,
            database: None,
            user: None,
            password: None,
            password_env: None,
            ssl: None,
            trust_server_certificate: None,
            path: None,
            auth: None,
            principal: None,
            keytab: None,
            service_name: None,
            realm: None,
            odbc_driver: None,
            readonly: None,
        }
    }

    /// Resolve `password_env` into `password`
    ///
    /// Returns a copy with the password filled in; the original stays untouched.
    pub fn resolve(&self) -> Result<Self> {
        let mut resolved = self.clone();

        if let Some(env_var) = &self.password_env {
            match std::env::var(env_var) {
                Ok(password) => resolved.password = Some(password),
                Err(_) => {
                    return Err(RelayError::config_error(format!(
                        "Environment variable {env_var} not found for password of source '{}'",
                        self.id
                    )));
                }
            }
        }

        Ok(resolved)
    }

    /// Pick the connection form for this descriptor's engine
    pub fn connection_params(&self) -> Result<ConnectionParams> {
        match self.engine {
            EngineType::Sqlite => {
                let path = self
                    .path
                    .clone()
                    .or_else(|| self.dsn.as_deref().map(sqlite_path_from_dsn))
                    .ok_or_else(|| {
                        RelayError::config_error(format!(
                            "SQLite source '{}' requires 'path' or 'dsn'",
                            self.id
                        ))
                    })?;
                Ok(ConnectionParams::File(path))
            }
            EngineType::Hive | EngineType::Impala => {
                if let Some(dsn) = &self.dsn {
                    return Ok(ConnectionParams::Dsn(dsn.clone()));
                }
                let host = self.require_host()?;
                let auth = self.auth.unwrap_or_default();
                if auth == AuthMechanism::Kerberos {
                    if self.principal.is_none() {
                        return Err(RelayError::config_error(format!(
                            "Kerberos source '{}' requires 'principal'",
                            self.id
                        )));
                    }
                    if self.keytab.is_none() {
                        return Err(RelayError::config_error(format!(
                            "Kerberos source '{}' requires 'keytab'",
                            self.id
                        )));
                    }
                }
                Ok(ConnectionParams::Cluster(ClusterParams {
                    host,
                    port: self.port,
                    database: self.database.clone(),
                    auth,
                    user: self.user.clone(),
                    password: self.password.clone(),
                    principal: self.principal.clone(),
                    keytab: self.keytab.clone(),
                    service_name: self.service_name.clone(),
                    realm: self.realm.clone(),
                    odbc_driver: self.odbc_driver.clone(),
                    ssl: self.ssl.unwrap_or(false),
                }))
            }
            EngineType::Postgres | EngineType::MySql | EngineType::MariaDb | EngineType::SqlServer => {
                if let Some(dsn) = &self.dsn {
                    return Ok(ConnectionParams::Dsn(dsn.clone()));
                }
                Ok(ConnectionParams::Server(ServerParams {
                    host: self.require_host()?,
                    port: self.port,
                    database: self.database.clone(),
                    user: self.user.clone(),
                    password: self.password.clone(),
                    ssl: self.ssl.unwrap_or(false),
                    trust_server_certificate: self.trust_server_certificate.unwrap_or(false),
                }))
            }
        }
    }

    fn require_host(&self) -> Result<String> {
        self.host.clone().ok_or_else(|| {
            RelayError::config_error(format!(
                "{} source '{}' requires 'dsn' or 'host'",
                self.engine, self.id
            ))
        })
    }
}

fn sqlite_path_from_dsn(dsn: &str) -> String {
    dsn.strip_prefix("sqlite://")
        .or_else(|| dsn.strip_prefix("sqlite:"))
        .unwrap_or(dsn)
        .to_string()
}

/// Per-connector options: global settings merged with the source override
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectorOptions {
    pub readonly: bool,
    pub max_rows: usize,
    pub query_timeout: Option<Duration>,
    pub connection_timeout: Option<Duration>,
}

impl ConnectorOptions {
    /// Merge global settings with a source descriptor (source `readonly` wins)
    #[must_use]
    pub fn merge(settings: &Settings, source: &SourceDescriptor) -> Self {
        Self {
            readonly: source.readonly.unwrap_or(settings.readonly),
            max_rows: settings.max_rows,
            query_timeout: settings.query_timeout_ms.map(Duration::from_millis),
            connection_timeout: settings.connection_timeout_ms.map(Duration::from_millis),
        }
    }
}

impl Default for ConnectorOptions {
    fn default() -> Self {
        let settings = Settings::default();
        Self {
            readonly: settings.readonly,
            max_rows: settings.max_rows,
            query_timeout: None,
            connection_timeout: None,
        }
    }
}

/// Full configuration document
///
/// ```json
/// {
///   "settings": { "readonly": true, "max_rows": 500 },
///   "sources": [
///     { "id": "warehouse", "type": "postgres", "host": "db", "user": "app", "password_env": "PGPASS" },
///     { "id": "local", "type": "sqlite", "path": "./app.db" }
///   ]
/// }
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub settings: Settings,

    #[serde(default)]
    pub sources: Vec<SourceDescriptor>,
}

impl Config {
    /// Parse and validate a JSON configuration document
    pub fn from_json_str(contents: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(contents)
            .map_err(|e| RelayError::config_error(format!("Invalid config file format: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    /// Load a configuration file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            RelayError::config_error(format!("Could not read config file {}: {e}", path.display()))
        })?;
        Self::from_json_str(&contents)
    }

    /// Load the local config if present, otherwise the global one
    ///
    /// Returns an empty configuration when neither file exists.
    pub fn load_with_precedence() -> Result<Self> {
        let local_path = local_config_path()?;
        if local_path.exists() {
            return Self::load(&local_path);
        }

        match global_config_path() {
            Ok(global_path) if global_path.exists() => Self::load(&global_path),
            _ => Ok(Self::default()),
        }
    }

    /// Check structural invariants the registry relies on
    pub fn validate(&self) -> Result<()> {
        if self.settings.max_rows == 0 {
            return Err(RelayError::config_error("settings.max_rows must be greater than 0"));
        }

        let mut seen = HashSet::new();
        for source in &self.sources {
            if source.id.trim().is_empty() {
                return Err(RelayError::config_error("Source id cannot be empty"));
            }
            if !seen.insert(source.id.as_str()) {
                return Err(RelayError::config_error(format!(
                    "Duplicate source id '{}'",
                    source.id
                )));
            }
        }

        Ok(())
    }
}

/// Get path to local config file (`.dbrelay/sources.json`)
pub fn local_config_path() -> Result<PathBuf> {
    let current_dir = std::env::current_dir().map_err(|e| {
        RelayError::config_error(format!("Could not determine current directory: {e}"))
    })?;

    Ok(current_dir.join(".dbrelay").join("sources.json"))
}

/// Get path to global config file (`~/.config/dbrelay/sources.json`)
pub fn global_config_path() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| RelayError::config_error("Could not determine user config directory"))?;

    Ok(config_dir.join("dbrelay").join("sources.json"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn descriptor(id: &str, engine: EngineType) -> SourceDescriptor {
        SourceDescriptor::new(id, engine)
    }

    #[test]
    fn test_settings_defaults() {
        let config = Config::from_json_str(r#"{"sources": []}"#).unwrap();
        assert_eq!(config.settings, Settings::default());
        assert_eq!(config.settings.max_rows, 1000);
        assert!(!config.settings.readonly);
    }

    #[test]
    fn test_parse_full_document() {
        let json = r#"{
            "settings": {"readonly": true, "max_rows": 2, "query_timeout_ms": 5000},
            "sources": [
                {"id": "p", "type": "postgres", "host": "localhost", "port": 5432, "user": "app"},
                {"id": "lite", "type": "sqlite", "path": ":memory:", "readonly": false},
                {"id": "h", "type": "hive", "host": "hs2", "auth": "kerberos",
                 "principal": "svc@EXAMPLE.COM", "keytab": "/etc/svc.keytab"}
            ]
        }"#;
        let config = Config::from_json_str(json).unwrap();

        assert_eq!(config.settings.max_rows, 2);
        assert_eq!(config.settings.query_timeout_ms, Some(5000));
        assert_eq!(config.sources.len(), 3);
        assert_eq!(config.sources[0].engine, EngineType::Postgres);
        assert_eq!(config.sources[1].readonly, Some(false));
        assert_eq!(config.sources[2].auth, Some(AuthMechanism::Kerberos));
    }

    #[test]
    fn test_unknown_engine_type_rejected() {
        let err = Config::from_json_str(r#"{"sources": [{"id": "x", "type": "oracle"}]}"#)
            .unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_zero_max_rows_rejected() {
        let err = Config::from_json_str(r#"{"settings": {"max_rows": 0}}"#).unwrap_err();
        assert!(err.message().contains("max_rows"));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let json = r#"{"sources": [
            {"id": "a", "type": "sqlite", "path": "a.db"},
            {"id": "a", "type": "sqlite", "path": "b.db"}
        ]}"#;
        let err = Config::from_json_str(json).unwrap_err();
        assert!(err.message().contains("Duplicate source id 'a'"));
    }

    #[test]
    fn test_source_readonly_wins_over_global() {
        let settings = Settings { readonly: true, ..Settings::default() };
        let mut source = descriptor("a", EngineType::Sqlite);

        assert!(ConnectorOptions::merge(&settings, &source).readonly);

        source.readonly = Some(false);
        assert!(!ConnectorOptions::merge(&settings, &source).readonly);

        let settings = Settings::default();
        source.readonly = Some(true);
        assert!(ConnectorOptions::merge(&settings, &source).readonly);
    }

    #[test]
    fn test_merge_timeouts() {
        let settings = Settings {
            query_timeout_ms: Some(1500),
            connection_timeout_ms: Some(250),
            ..Settings::default()
        };
        let options = ConnectorOptions::merge(&settings, &descriptor("a", EngineType::Postgres));
        assert_eq!(options.query_timeout, Some(Duration::from_millis(1500)));
        assert_eq!(options.connection_timeout, Some(Duration::from_millis(250)));
        assert_eq!(options.max_rows, 1000);
    }

    #[test]
    fn test_resolve_password_env() {
        std::env::set_var("DBRELAY_TEST_PASSWORD_RESOLVE", "s3cret");
        let mut source = descriptor("a", EngineType::MySql);
        source.password_env = Some("DBRELAY_TEST_PASSWORD_RESOLVE".to_string());

        let resolved = source.resolve().unwrap();
        assert_eq!(resolved.password.as_deref(), Some("s3cret"));
        assert_eq!(source.password, None);
        std::env::remove_var("DBRELAY_TEST_PASSWORD_RESOLVE");
    }

    #[test]
    fn test_resolve_missing_password_env() {
        let mut source = descriptor("a", EngineType::MySql);
        source.password_env = Some("DBRELAY_TEST_PASSWORD_DEFINITELY_UNSET".to_string());

        let err = source.resolve().unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
        assert!(err.message().contains("DBRELAY_TEST_PASSWORD_DEFINITELY_UNSET"));
    }

    #[test]
    fn test_connection_params_prefers_dsn() {
        let mut source = descriptor("p", EngineType::Postgres);
        source.dsn = Some("postgres://u@h/db".to_string());
        source.host = Some("ignored".to_string());

        assert_eq!(
            source.connection_params().unwrap(),
            ConnectionParams::Dsn("postgres://u@h/db".to_string())
        );
    }

    #[test]
    fn test_connection_params_server_fields() {
        let mut source = descriptor("m", EngineType::MariaDb);
        source.host = Some("db".to_string());
        source.port = Some(3307);
        source.ssl = Some(true);

        match source.connection_params().unwrap() {
            ConnectionParams::Server(params) => {
                assert_eq!(params.host, "db");
                assert_eq!(params.port, Some(3307));
                assert!(params.ssl);
                assert!(!params.trust_server_certificate);
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[test]
    fn test_connection_params_missing_host() {
        let err = descriptor("s", EngineType::SqlServer).connection_params().unwrap_err();
        assert!(err.message().contains("requires 'dsn' or 'host'"));
    }

    #[test]
    fn test_sqlite_path_from_dsn() {
        let mut source = descriptor("s", EngineType::Sqlite);
        source.dsn = Some("sqlite:///tmp/app.db".to_string());
        assert_eq!(
            source.connection_params().unwrap(),
            ConnectionParams::File("/tmp/app.db".to_string())
        );

        source.dsn = Some("sqlite::memory:".to_string());
        assert_eq!(
            source.connection_params().unwrap(),
            ConnectionParams::File(":memory:".to_string())
        );
    }

    #[test]
    fn test_kerberos_requires_principal_and_keytab() {
        let mut source = descriptor("h", EngineType::Hive);
        source.host = Some("hs2".to_string());
        source.auth = Some(AuthMechanism::Kerberos);

        let err = source.connection_params().unwrap_err();
        assert!(err.message().contains("principal"));

        source.principal = Some("svc@EXAMPLE.COM".to_string());
        let err = source.connection_params().unwrap_err();
        assert!(err.message().contains("keytab"));

        source.keytab = Some(PathBuf::from("/etc/svc.keytab"));
        assert!(matches!(source.connection_params().unwrap(), ConnectionParams::Cluster(_)));
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        fs::write(&path, r#"{"sources": [{"id": "default", "type": "sqlite", "path": ":memory:"}]}"#)
            .unwrap();

        let config = Config::load(&path).unwrap();
        assert_eq!(config.sources[0].id, "default");
    }

    #[test]
    fn test_load_missing_file() {
        let err = Config::load(Path::new("/nonexistent/dbrelay/sources.json")).unwrap_err();
        assert_eq!(err.error_code(), "CONFIG_ERROR");
    }

    #[test]
    fn test_config_paths() {
        assert!(local_config_path().unwrap().ends_with(".dbrelay/sources.json"));
        if let Ok(global) = global_config_path() {
            assert!(global.ends_with("dbrelay/sources.json"));
        }
    }
}
