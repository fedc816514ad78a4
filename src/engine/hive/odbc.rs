//! ODBC transport for Hive and Impala
//!
//! Sessions go through the Cloudera ODBC drivers installed on the host. The
//! driver manager is loaded once; a missing driver is reported as
//! "driver unavailable" when a session is opened.

use async_trait::async_trait;
use odbc_api::buffers::TextRowSet;
use odbc_api::{Connection, ConnectionOptions, Cursor, Environment, ResultSetMetadata};
use parking_lot::Mutex;
use serde_json::Value;
use std::sync::{Arc, OnceLock};
use tracing::{debug, info};

use super::{odbc_connection_string, FetchedRows, HiveDriver, HiveSession, SessionRequest};
use crate::error::{RelayError, Result};

/// Rows bound per fetch round-trip
const BATCH_ROWS: usize = 1000;

/// Upper bound on one text cell
const MAX_TEXT_BYTES: usize = 4096;

fn environment() -> std::result::Result<&'static Environment, String> {
    static ENVIRONMENT: OnceLock<Environment> = OnceLock::new();

    if let Some(env) = ENVIRONMENT.get() {
        return Ok(env);
    }
    let env = Environment::new().map_err(|e| format!("ODBC driver manager not available: {e}"))?;
    Ok(ENVIRONMENT.get_or_init(|| env))
}

/// Driver backed by the host ODBC driver manager
pub struct OdbcDriver {
    env: &'static Environment,
    installed: Vec<String>,
}

impl OdbcDriver {
    pub fn load() -> std::result::Result<Self, String> {
        let env = environment()?;
        let installed: Vec<String> = env
            .drivers()
            .map_err(|e| format!("could not enumerate ODBC drivers: {e}"))?
            .into_iter()
            .map(|info| info.description)
            .collect();
        debug!(drivers = ?installed, "ODBC drivers found");
        Ok(Self { env, installed })
    }

    fn check_installed(&self, engine: &str, connection_string: &str) -> Result<()> {
        let Some(name) = requested_driver(connection_string) else {
            return Ok(());
        };
        if self.installed.iter().any(|installed| installed.eq_ignore_ascii_case(name)) {
            Ok(())
        } else {
            Err(RelayError::engine_error(
                engine,
                format!("driver unavailable: ODBC driver '{name}' is not installed"),
            ))
        }
    }
}

/// Value of the `Driver={...}` key, if present
fn requested_driver(connection_string: &str) -> Option<&str> {
    connection_string.split(';').find_map(|part| {
        let (key, value) = part.split_once('=')?;
        key.trim()
            .eq_ignore_ascii_case("driver")
            .then(|| value.trim().trim_start_matches('{').trim_end_matches('}'))
    })
}

#[async_trait]
impl HiveDriver for OdbcDriver {
    async fn open_session(&self, request: &SessionRequest) -> Result<Arc<dyn HiveSession>> {
        let engine = request.flavor.as_str();
        let connection_string = odbc_connection_string(request.flavor, &request.params)?;
        self.check_installed(engine, &connection_string)?;

        let env = self.env;
        let options = ConnectionOptions {
            login_timeout_sec: request
                .connection_timeout
                .map(|timeout| u32::try_from(timeout.as_secs().max(1)).unwrap_or(u32::MAX)),
            ..ConnectionOptions::default()
        };
        let connection = tokio::task::spawn_blocking(move || {
            env.connect_with_connection_string(&connection_string, options)
        })
        .await
        .map_err(|e| RelayError::engine_error(engine, format!("connect task failed: {e}")))?
        .map_err(|e| RelayError::engine_error(engine, e.to_string()))?;

        info!(engine, "ODBC session established");
        Ok(Arc::new(OdbcSession { engine, connection: Arc::new(Mutex::new(Some(connection))) }))
    }
}

struct OdbcSession {
    engine: &'static str,
    connection: Arc<Mutex<Option<Connection<'static>>>>,
}

#[async_trait]
impl HiveSession for OdbcSession {
    async fn execute(&self, statement: &str, fetch_size: usize) -> Result<FetchedRows> {
        let engine = self.engine;
        let connection = self.connection.clone();
        let statement = statement.to_string();

        tokio::task::spawn_blocking(move || {
            let guard = connection.lock();
            let conn = guard
                .as_ref()
                .ok_or_else(|| RelayError::engine_error(engine, "session is closed"))?;
            fetch(conn, &statement, fetch_size).map_err(|e| RelayError::engine_error(engine, e.to_string()))
        })
        .await
        .map_err(|e| RelayError::engine_error(engine, format!("statement task failed: {e}")))?
    }

    async fn close(&self) -> Result<()> {
        let engine = self.engine;
        let connection = self.connection.clone();
        tokio::task::spawn_blocking(move || drop(connection.lock().take()))
            .await
            .map_err(|e| RelayError::engine_error(engine, format!("close task failed: {e}")))
    }
}

fn fetch(
    conn: &Connection<'_>,
    statement: &str,
    fetch_size: usize,
) -> std::result::Result<FetchedRows, odbc_api::Error> {
    let Some(mut cursor) = conn.execute(statement, (), None)? else {
        return Ok(FetchedRows::default());
    };

    let columns = cursor.column_names()?.collect::<std::result::Result<Vec<String>, _>>()?;
    let buffer = TextRowSet::for_cursor(fetch_size.min(BATCH_ROWS), &mut cursor, Some(MAX_TEXT_BYTES))?;
    let mut block = cursor.bind_buffer(buffer)?;

    let mut rows = Vec::new();
    while rows.len() < fetch_size {
        let Some(batch) = block.fetch()? else {
            break;
        };
        for row in 0..batch.num_rows() {
            rows.push(
                (0..batch.num_cols())
                    .map(|col| match batch.at(col, row) {
                        Some(bytes) => Value::String(String::from_utf8_lossy(bytes).into_owned()),
                        None => Value::Null,
                    })
                    .collect(),
            );
        }
    }
    rows.truncate(fetch_size);

    Ok(FetchedRows { columns, rows })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_driver() {
        assert_eq!(
            requested_driver("Driver={Cloudera ODBC Driver for Impala};Host=h;Port=21050"),
            Some("Cloudera ODBC Driver for Impala")
        );
        assert_eq!(requested_driver("DSN=warehouse;UID=u"), None);
    }
}
