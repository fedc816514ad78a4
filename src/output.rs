//! JSON Output Envelope Types
//!
//! Every `dbrelay` command prints exactly one envelope to stdout.
//!
//! # Output Contract
//! - Success: `{"ok": true, "command": "...", "source": "...", "data": {...}, "meta": {...}}`
//! - Error: `{"ok": false, "command": "...", "error": {"code": "...", "message": "...", "source": "..."}}`
//!
//! `source` is omitted for commands that span every source (`sources`, `check`).

use serde::{Deserialize, Serialize};

use crate::error::RelayError;

/// Success envelope for operation results
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SuccessEnvelope<T> {
    /// Always true for success envelopes
    pub ok: bool,

    /// Command that was executed (sources, check, query, search)
    pub command: String,

    /// Source the command ran against
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    pub data: T,

    pub meta: Metadata,
}

impl<T> SuccessEnvelope<T> {
    pub fn new(command: impl Into<String>, source: Option<String>, data: T, meta: Metadata) -> Self {
        Self { ok: true, command: command.into(), source, data, meta }
    }
}

/// Error envelope for operation failures
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEnvelope {
    /// Always false for error envelopes
    pub ok: bool,

    pub command: String,

    pub error: ErrorInfo,
}

impl ErrorEnvelope {
    pub fn new(command: impl Into<String>, error: ErrorInfo) -> Self {
        Self { ok: false, command: command.into(), error }
    }

    /// Envelope for a `RelayError`, keeping its source id and statement
    pub fn from_error(command: impl Into<String>, err: &RelayError) -> Self {
        Self::new(
            command,
            ErrorInfo {
                code: err.error_code().to_string(),
                message: err.message(),
                source: err.source_id().map(str::to_string),
                statement: err.statement().map(str::to_string),
            },
        )
    }
}

/// Error information structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    /// Stable error code (e.g. `QUERY_FAILED`, `UNKNOWN_SOURCE`)
    pub code: String,

    /// Human-readable message (no credentials)
    pub message: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub statement: Option<String>,
}

impl ErrorInfo {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self { code: code.into(), message: message.into(), source: None, statement: None }
    }
}

/// Execution metadata included in all success responses
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Metadata {
    /// Execution time in milliseconds
    pub execution_ms: u64,

    /// Rows returned (query results only)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rows_returned: Option<usize>,
}

impl Metadata {
    #[must_use]
    pub const fn new(execution_ms: u64) -> Self {
        Self { execution_ms, rows_returned: None }
    }

    #[must_use]
    pub const fn with_rows(execution_ms: u64, rows_returned: usize) -> Self {
        Self { execution_ms, rows_returned: Some(rows_returned) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_success_envelope_serialization() {
        let envelope =
            SuccessEnvelope::new("query", Some("warehouse".into()), json!({"rows": []}), Metadata::with_rows(42, 0));

        assert_eq!(
            serde_json::to_value(&envelope).unwrap(),
            json!({
                "ok": true,
                "command": "query",
                "source": "warehouse",
                "data": {"rows": []},
                "meta": {"execution_ms": 42, "rows_returned": 0}
            })
        );
    }

    #[test]
    fn test_success_envelope_without_source() {
        let envelope = SuccessEnvelope::new("sources", None, json!([]), Metadata::new(1));
        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("source").is_none());
        assert!(value["meta"].get("rows_returned").is_none());
    }

    #[test]
    fn test_error_envelope_from_query_error() {
        let err = RelayError::query_with_statement("p", "DELETE FROM t", "read-only mode");
        let envelope = ErrorEnvelope::from_error("query", &err);

        insta::assert_json_snapshot!(envelope, @r###"
        {
          "ok": false,
          "command": "query",
          "error": {
            "code": "QUERY_FAILED",
            "message": "Query failed for source 'p': read-only mode",
            "source": "p",
            "statement": "DELETE FROM t"
          }
        }
        "###);
    }

    #[test]
    fn test_error_envelope_omits_missing_context() {
        let envelope = ErrorEnvelope::new("search", ErrorInfo::new("INVALID_INPUT", "table required"));
        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["ok"], json!(false));
        assert!(value["error"].get("source").is_none());
        assert!(value["error"].get("statement").is_none());
    }
}
