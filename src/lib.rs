//! dbrelay - Uniform Connector Layer over SQL Engines
//!
//! dbrelay gives a single caller (typically an AI-tool protocol front end) one
//! interface to PostgreSQL, MySQL/MariaDB, SQL Server, SQLite, Hive and Impala:
//! connection lifecycle, guarded statement execution and progressive schema
//! discovery.
//!
//! # Core Principles
//! - Least privilege: read-only sources reject writes before any I/O
//! - Bounded results: every statement is capped and reports truncation
//! - Vendor SQL passes through; only row-limit clauses and placeholders are rewritten
//! - Errors carry the source id (and statement) they belong to
//!
//! # Module Organization
//! - [`error`] - Error taxonomy and stable codes
//! - [`config`] - Settings, source descriptors, config file loading
//! - [`capability`] - Statement classification and rewriting
//! - [`engine`] - Adapter contract, shared result types and the engine adapters
//! - [`auth`] - Kerberos ticket lifecycle for Hive/Impala
//! - [`connector`] - Per-source policy wrapper around an adapter
//! - [`registry`] - Source resolution and bulk lifecycle
//! - [`output`] - JSON envelopes printed by the binary
//! - [`logging`] - stderr tracing setup for the binary

pub mod auth;
pub mod capability;
pub mod config;
pub mod connector;
pub mod engine;
pub mod error;
pub mod logging;
pub mod output;
pub mod registry;

pub use auth::{CredentialCommands, TicketAuthenticator};
pub use config::{AuthMechanism, Config, ConnectionParams, ConnectorOptions, Settings, SourceDescriptor};
pub use connector::{Connector, SourceInfo};
pub use engine::{
    Adapter, EngineAdapter, EngineType, ExecLimits, ExecuteOptions, ObjectType, QueryResult, Row, SchemaObject,
    SearchFilter,
};
pub use error::{RelayError, Result};
pub use logging::init_logging;
pub use output::{ErrorEnvelope, ErrorInfo, Metadata, SuccessEnvelope};
pub use registry::{ConnectReport, SourceRegistry};
