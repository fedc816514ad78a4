//! Error Handling Infrastructure
//!
//! This module defines all error types used throughout dbrelay.
//! All errors are structured and map to stable error codes for JSON output.
//!
//! # Error Categories
//! - `Connection`: connect failed for a source
//! - `Query`: statement execution failed (including policy rejections)
//! - `Auth`: Kerberos ticket setup or renewal failed
//! - `UnknownSource` / `AmbiguousSource`: the registry could not pick a connector
//! - `Configuration`: malformed or unsupported source descriptors (fatal at startup)
//! - `InvalidInput`: malformed caller input rejected before any engine call
//! - `Engine`: raw driver failure, rewritten by the connector into `Connection`/`Query`

use thiserror::Error;

/// Main error type for dbrelay operations
#[derive(Error, Debug)]
pub enum RelayError {
    /// Connecting a source failed
    #[error("Connection failed for source '{source_id}': {message}")]
    Connection { source_id: String, message: String },

    /// Executing a statement (or a catalog lookup) failed
    #[error("Query failed for source '{source_id}': {message}")]
    Query {
        source_id: String,
        /// Statement text, when the failure belongs to a caller-supplied statement
        statement: Option<String>,
        message: String,
    },

    /// Kerberos credential lifecycle failure
    #[error("Authentication failed{}: {message}", for_source(.source_id))]
    Auth {
        /// Set once the failure surfaces through a connector
        source_id: Option<String>,
        message: String,
    },

    /// A source id was given but is not configured
    #[error("Unknown source '{id}'. Known sources: {}", known.join(", "))]
    UnknownSource { id: String, known: Vec<String> },

    /// No source id was given and none could be chosen implicitly
    #[error(
        "No source specified and no default could be chosen. Configured sources: {}",
        known.join(", ")
    )]
    AmbiguousSource { known: Vec<String> },

    /// Configuration error (unsupported engine, missing fields, unreadable file)
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Invalid input or missing required parameters
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Engine-specific driver error
    #[error("Engine error ({engine}): {detail}")]
    Engine { engine: String, detail: String },
}

impl RelayError {
    /// Convert error to error code string for JSON output
    ///
    /// Error codes are stable and suitable for programmatic handling.
    #[must_use]
    pub const fn error_code(&self) -> &'static str {
        match self {
            Self::Connection { .. } => "CONNECTION_FAILED",
            Self::Query { .. } => "QUERY_FAILED",
            Self::Auth { .. } => "AUTH_FAILED",
            Self::UnknownSource { .. } => "UNKNOWN_SOURCE",
            Self::AmbiguousSource { .. } => "AMBIGUOUS_SOURCE",
            Self::Configuration(_) => "CONFIG_ERROR",
            Self::InvalidInput(_) => "INVALID_INPUT",
            Self::Engine { .. } => "ENGINE_ERROR",
        }
    }

    /// Human-readable error message (no credentials, no stack detail)
    #[must_use]
    pub fn message(&self) -> String {
        self.to_string()
    }

    /// Source id the error is attached to, if any
    #[must_use]
    pub fn source_id(&self) -> Option<&str> {
        match self {
            Self::Connection { source_id, .. } | Self::Query { source_id, .. } => Some(source_id),
            Self::Auth { source_id, .. } => source_id.as_deref(),
            _ => None,
        }
    }

    /// Statement text attached to a query error
    #[must_use]
    pub fn statement(&self) -> Option<&str> {
        match self {
            Self::Query { statement, .. } => statement.as_deref(),
            _ => None,
        }
    }

    /// Create a connection error
    pub fn connection(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Connection { source_id: source_id.into(), message: message.into() }
    }

    /// Create a query error without statement text
    pub fn query(source_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Query { source_id: source_id.into(), statement: None, message: message.into() }
    }

    /// Create a query error carrying the statement that failed
    pub fn query_with_statement(
        source_id: impl Into<String>,
        statement: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::Query {
            source_id: source_id.into(),
            statement: Some(statement.into()),
            message: message.into(),
        }
    }

    /// Create an authentication error
    pub fn auth(message: impl Into<String>) -> Self {
        Self::Auth { source_id: None, message: message.into() }
    }

    /// Create an unknown-source error
    pub fn unknown_source(id: impl Into<String>, known: Vec<String>) -> Self {
        Self::UnknownSource { id: id.into(), known }
    }

    /// Create an ambiguous-source error
    pub fn ambiguous_source(known: Vec<String>) -> Self {
        Self::AmbiguousSource { known }
    }

    /// Create a configuration error
    pub fn config_error(message: impl Into<String>) -> Self {
        Self::Configuration(message.into())
    }

    /// Create an invalid input error
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput(message.into())
    }

    /// Create an engine-specific error
    pub fn engine_error(engine: impl Into<String>, detail: impl Into<String>) -> Self {
        Self::Engine { engine: engine.into(), detail: detail.into() }
    }

    /// Attach the source id to an auth error, keeping one that is already set
    fn with_auth_source(self, source_id: &str) -> Self {
        match self {
            Self::Auth { source_id: None, message } => {
                Self::Auth { source_id: Some(source_id.to_string()), message }
            }
            other => other,
        }
    }

    /// Attach a source id to a failure raised while connecting.
    ///
    /// Driver errors become `Connection`; auth and configuration errors keep
    /// their category, auth errors gaining the source id.
    #[must_use]
    pub fn into_connection_error(self, source_id: &str) -> Self {
        match self {
            Self::Engine { engine, detail } => Self::connection(source_id, format!("{engine}: {detail}")),
            Self::Connection { message, .. } => Self::connection(source_id, message),
            Self::Query { message, .. } => Self::connection(source_id, message),
            other => other.with_auth_source(source_id),
        }
    }

    /// Attach a source id and statement to a failure raised while executing.
    #[must_use]
    pub fn into_query_error(self, source_id: &str, statement: &str) -> Self {
        match self {
            Self::Engine { engine, detail } => {
                Self::query_with_statement(source_id, statement, format!("{engine}: {detail}"))
            }
            Self::Query { message, statement: None, .. } => {
                Self::query_with_statement(source_id, statement, message)
            }
            Self::Connection { message, .. } => {
                Self::query_with_statement(source_id, statement, message)
            }
            other => other.with_auth_source(source_id),
        }
    }

    /// Attach a source id to a failed catalog lookup
    #[must_use]
    pub fn into_catalog_error(self, source_id: &str) -> Self {
        match self {
            Self::Engine { engine, detail } => Self::query(source_id, format!("{engine}: {detail}")),
            Self::Connection { message, .. } => Self::query(source_id, message),
            other => other.with_auth_source(source_id),
        }
    }
}

fn for_source(source_id: &Option<String>) -> String {
    source_id.as_ref().map(|id| format!(" for source '{id}'")).unwrap_or_default()
}

/// Result type alias for dbrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;
