//! Kerberos ticket lifecycle
//!
//! # Features
//! - Obtains a ticket from a keytab (`kinit -kt`)
//! - Reads the ticket expiry from `klist` and renews 10 minutes before it
//! - Destroys the credential cache (`kdestroy`) on disconnect
//!
//! # Implementation Notes
//! - The renewal timer is a tokio task holding only a weak reference to the
//!   authenticator, aborted on `destroy()` and on drop
//! - Renewal failures are logged and retried after 5 minutes
//! - Renewal, `ensure_valid` and `destroy` serialize on one lifecycle gate, so
//!   `kdestroy` never runs while a `kinit` is in flight
//! - External commands sit behind [`CredentialCommands`] so the lifecycle can be
//!   exercised without a KDC

use async_trait::async_trait;
use chrono::{DateTime, Local, NaiveDateTime, TimeZone, Utc};
use parking_lot::Mutex;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::{RelayError, Result};

/// Renew this long before the ticket expires
const RENEW_BEFORE_EXPIRY: Duration = Duration::from_secs(10 * 60);

/// Renewal interval when the expiry could not be read
const UNKNOWN_EXPIRY_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// Retry delay after a failed renewal
const RENEWAL_RETRY: Duration = Duration::from_secs(5 * 60);

/// Assumed lifetime when `klist` output cannot be parsed
fn default_ticket_lifetime() -> chrono::Duration {
    chrono::Duration::hours(8)
}

const EXPIRY_FORMATS: &[&str] = &[
    "%m/%d/%y %H:%M:%S",
    "%m/%d/%Y %H:%M:%S",
    "%Y-%m-%d %H:%M:%S",
    "%d/%m/%Y %H:%M:%S",
    "%b %d %H:%M:%S %Y",
];

/// External credential commands
#[async_trait]
pub trait CredentialCommands: Send + Sync {
    /// Obtain a ticket for `principal` from `keytab`
    async fn obtain(&self, keytab: &Path, principal: &str) -> Result<()>;

    /// Destroy the credential cache
    async fn destroy(&self) -> Result<()>;

    /// Credential listing (expected to contain the `krbtgt/` line)
    async fn list(&self) -> Result<String>;
}

/// `kinit` / `kdestroy` / `klist` from the system Kerberos tools
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemCommands;

async fn run_command(program: &str, args: &[&OsStr]) -> Result<String> {
    // A cancelled renewal must not leave kinit running past kdestroy
    let output = Command::new(program)
        .args(args)
        .kill_on_drop(true)
        .output()
        .await
        .map_err(|e| RelayError::auth(format!("Failed to run {program}: {e}")))?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    } else {
        Err(RelayError::auth(format!(
            "{program} exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        )))
    }
}

#[async_trait]
impl CredentialCommands for SystemCommands {
    async fn obtain(&self, keytab: &Path, principal: &str) -> Result<()> {
        run_command("kinit", &[OsStr::new("-kt"), keytab.as_os_str(), OsStr::new(principal)]).await?;
        Ok(())
    }

    async fn destroy(&self) -> Result<()> {
        run_command("kdestroy", &[]).await?;
        Ok(())
    }

    async fn list(&self) -> Result<String> {
        run_command("klist", &[]).await
    }
}

#[derive(Default)]
struct TicketState {
    initialized: bool,
    expiry: Option<DateTime<Utc>>,
    renewal: Option<JoinHandle<()>>,
}

struct Inner {
    principal: String,
    keytab: PathBuf,
    commands: Arc<dyn CredentialCommands>,
    state: Mutex<TicketState>,
    lifecycle: tokio::sync::Mutex<()>,
}

impl Inner {
    async fn obtain(&self) -> Result<Option<DateTime<Utc>>> {
        self.commands.obtain(&self.keytab, &self.principal).await.map_err(|e| {
            RelayError::auth(format!("Could not obtain ticket for {}: {}", self.principal, e.message()))
        })?;
        Ok(self.read_expiry().await)
    }

    async fn read_expiry(&self) -> Option<DateTime<Utc>> {
        match self.commands.list().await {
            Ok(listing) => Some(parse_expiry(&listing, Utc::now())),
            Err(e) => {
                debug!("Could not list Kerberos tickets: {}", e.message());
                None
            }
        }
    }

    /// Re-obtain the ticket and return the delay until the next renewal.
    ///
    /// Callers hold the lifecycle gate.
    async fn renew(&self) -> Result<Duration> {
        if !self.state.lock().initialized {
            return Err(RelayError::auth("Authenticator was destroyed before renewal"));
        }
        let expiry = self.obtain().await?;
        let mut state = self.state.lock();
        if !state.initialized {
            return Err(RelayError::auth("Authenticator was destroyed during renewal"));
        }
        state.expiry = expiry;
        Ok(renewal_delay(expiry, Utc::now()))
    }
}

/// Kerberos credential lifecycle manager for one connector
pub struct TicketAuthenticator {
    inner: Arc<Inner>,
}

impl TicketAuthenticator {
    /// Authenticator backed by the system Kerberos tools
    pub fn new(principal: impl Into<String>, keytab: impl Into<PathBuf>) -> Self {
        Self::with_commands(principal, keytab, Arc::new(SystemCommands))
    }

    /// Authenticator backed by custom credential commands
    pub fn with_commands(
        principal: impl Into<String>,
        keytab: impl Into<PathBuf>,
        commands: Arc<dyn CredentialCommands>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                principal: principal.into(),
                keytab: keytab.into(),
                commands,
                state: Mutex::new(TicketState::default()),
                lifecycle: tokio::sync::Mutex::new(()),
            }),
        }
    }

    #[must_use]
    pub fn principal(&self) -> &str {
        &self.inner.principal
    }

    /// Obtain a ticket and schedule its renewal; a no-op when already initialized
    pub async fn initialize(&self) -> Result<()> {
        let _gate = self.inner.lifecycle.lock().await;
        if self.inner.state.lock().initialized {
            return Ok(());
        }

        let keytab = &self.inner.keytab;
        if !keytab.exists() {
            return Err(RelayError::auth(format!("Keytab file not found: {}", keytab.display())));
        }
        warn_if_permissive(keytab);

        let expiry = self.inner.obtain().await?;
        {
            let mut state = self.inner.state.lock();
            state.initialized = true;
            state.expiry = expiry;
        }
        self.schedule_renewal(renewal_delay(expiry, Utc::now()));

        info!(principal = %self.inner.principal, expiry = ?expiry, "Kerberos ticket obtained");
        Ok(())
    }

    /// Re-obtain the ticket immediately when it is no longer valid
    pub async fn ensure_valid(&self) -> Result<()> {
        if self.is_valid() {
            return Ok(());
        }
        if !self.inner.state.lock().initialized {
            return self.initialize().await;
        }

        let _gate = self.inner.lifecycle.lock().await;
        // Another caller (or the renewal task) may have renewed while this one waited
        if self.is_valid() {
            return Ok(());
        }
        let delay = self.inner.renew().await?;
        self.schedule_renewal(delay);
        info!(principal = %self.inner.principal, "Expired Kerberos ticket re-obtained");
        Ok(())
    }

    /// Cancel renewal, destroy credentials best-effort, reset to uninitialized
    pub async fn destroy(&self) {
        let _gate = self.inner.lifecycle.lock().await;
        let (was_initialized, renewal) = {
            let mut state = self.inner.state.lock();
            let was_initialized = state.initialized;
            let renewal = state.renewal.take();
            *state = TicketState::default();
            (was_initialized, renewal)
        };

        if let Some(handle) = renewal {
            handle.abort();
        }
        if !was_initialized {
            return;
        }

        match self.inner.commands.destroy().await {
            Ok(()) => info!(principal = %self.inner.principal, "Kerberos credentials destroyed"),
            Err(e) => warn!(
                principal = %self.inner.principal,
                "Failed to destroy Kerberos credentials: {}",
                e.message()
            ),
        }
    }

    /// Initialized and not known to be expired
    #[must_use]
    pub fn is_valid(&self) -> bool {
        let state = self.inner.state.lock();
        state.initialized && state.expiry.map_or(true, |expiry| expiry > Utc::now())
    }

    #[must_use]
    pub fn expiry(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().expiry
    }

    fn schedule_renewal(&self, delay: Duration) {
        debug!(principal = %self.inner.principal, delay_secs = delay.as_secs(), "Scheduling ticket renewal");
        let handle = tokio::spawn(renewal_loop(Arc::downgrade(&self.inner), delay));
        if let Some(previous) = self.inner.state.lock().renewal.replace(handle) {
            previous.abort();
        }
    }
}

impl Drop for TicketAuthenticator {
    fn drop(&mut self) {
        if let Some(handle) = self.inner.state.lock().renewal.take() {
            handle.abort();
        }
    }
}

async fn renewal_loop(inner: Weak<Inner>, mut delay: Duration) {
    loop {
        tokio::time::sleep(delay).await;
        let Some(inner) = inner.upgrade() else {
            return;
        };

        let _gate = inner.lifecycle.lock().await;
        delay = match inner.renew().await {
            // A fresh ticket already inside the renewal window: back off instead of spinning
            Ok(next) if next.is_zero() => RENEWAL_RETRY,
            Ok(next) => {
                info!(principal = %inner.principal, "Kerberos ticket renewed");
                next
            }
            Err(e) => {
                warn!(
                    principal = %inner.principal,
                    "Kerberos ticket renewal failed, retrying in {}s: {}",
                    RENEWAL_RETRY.as_secs(),
                    e.message()
                );
                RENEWAL_RETRY
            }
        };
    }
}

/// Delay until renewal: `max(0, expiry - now - 10min)`, or 4 hours when unknown
#[must_use]
pub fn renewal_delay(expiry: Option<DateTime<Utc>>, now: DateTime<Utc>) -> Duration {
    match expiry {
        Some(expiry) => (expiry - now)
            .to_std()
            .map_or(Duration::ZERO, |left| left.saturating_sub(RENEW_BEFORE_EXPIRY)),
        None => UNKNOWN_EXPIRY_INTERVAL,
    }
}

/// Expiry of the `krbtgt/` ticket in a `klist` listing, or `now + 8h`
#[must_use]
pub fn parse_expiry(listing: &str, now: DateTime<Utc>) -> DateTime<Utc> {
    listing
        .lines()
        .find(|line| line.contains("krbtgt/"))
        .and_then(|line| {
            let stamps: Vec<&str> =
                line.split_whitespace().filter(|token| !token.contains("krbtgt/")).collect();
            // Valid-starting and expires columns share one layout; the second half is the expiry
            let expires = stamps[stamps.len() / 2..].join(" ");
            parse_local_timestamp(&expires)
        })
        .unwrap_or_else(|| now + default_ticket_lifetime())
}

fn parse_local_timestamp(text: &str) -> Option<DateTime<Utc>> {
    EXPIRY_FORMATS.iter().find_map(|format| {
        NaiveDateTime::parse_from_str(text, format)
            .ok()
            .and_then(|naive| Local.from_local_datetime(&naive).earliest())
            .map(|local| local.with_timezone(&Utc))
    })
}

#[cfg(unix)]
fn warn_if_permissive(keytab: &Path) {
    use std::os::unix::fs::PermissionsExt;

    if let Ok(metadata) = std::fs::metadata(keytab) {
        let mode = metadata.permissions().mode();
        if mode & 0o077 != 0 {
            warn!(
                "Keytab {} is accessible by group/other (mode {:o}); restrict it to the owner",
                keytab.display(),
                mode & 0o777
            );
        }
    }
}

#[cfg(not(unix))]
fn warn_if_permissive(_keytab: &Path) {}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const FRESH_LISTING: &str = "01/01/2020 00:00:00  01/01/2099 00:00:00  krbtgt/EXAMPLE.COM@EXAMPLE.COM";
    const EXPIRED_LISTING: &str = "01/01/20 00:00:00  01/02/20 00:00:00  krbtgt/EXAMPLE.COM@EXAMPLE.COM";

    #[derive(Default)]
    struct MockCommands {
        obtains: AtomicUsize,
        destroys: AtomicUsize,
        /// Obtain calls numbered from this one onwards fail
        fail_obtain_from: Option<usize>,
        fail_destroy: bool,
        listing: Option<String>,
        /// After this many obtains, `list` reports a ticket valid until 2099
        fresh_from: Option<usize>,
        obtain_delay: Option<Duration>,
        events: Mutex<Vec<&'static str>>,
    }

    #[async_trait]
    impl CredentialCommands for MockCommands {
        async fn obtain(&self, _keytab: &Path, _principal: &str) -> Result<()> {
            self.events.lock().push("kinit started");
            if let Some(delay) = self.obtain_delay {
                tokio::time::sleep(delay).await;
            }
            self.events.lock().push("kinit finished");
            let call = self.obtains.fetch_add(1, Ordering::SeqCst) + 1;
            match self.fail_obtain_from {
                Some(from) if call >= from => Err(RelayError::auth("kinit: KDC unreachable")),
                _ => Ok(()),
            }
        }

        async fn destroy(&self) -> Result<()> {
            self.events.lock().push("kdestroy");
            self.destroys.fetch_add(1, Ordering::SeqCst);
            if self.fail_destroy {
                Err(RelayError::auth("kdestroy: no credentials cache"))
            } else {
                Ok(())
            }
        }

        async fn list(&self) -> Result<String> {
            if self.fresh_from.is_some_and(|from| self.obtains.load(Ordering::SeqCst) >= from) {
                return Ok(FRESH_LISTING.to_string());
            }
            self.listing.clone().ok_or_else(|| RelayError::auth("klist: no ticket"))
        }
    }

    fn keytab() -> tempfile::NamedTempFile {
        tempfile::NamedTempFile::new().unwrap()
    }

    fn authenticator(mock: &Arc<MockCommands>, keytab: &Path) -> TicketAuthenticator {
        TicketAuthenticator::with_commands("svc/host@EXAMPLE.COM", keytab, mock.clone())
    }

    fn local(y: i32, m: u32, d: u32, h: u32, min: u32, s: u32) -> DateTime<Utc> {
        Local.with_ymd_and_hms(y, m, d, h, min, s).earliest().unwrap().with_timezone(&Utc)
    }

    #[test]
    fn test_parse_expiry_mit_short_year() {
        let listing = "Ticket cache: FILE:/tmp/krb5cc_1000\n\
                       Default principal: svc@EXAMPLE.COM\n\n\
                       Valid starting       Expires              Service principal\n\
                       10/19/26 09:00:00  10/19/26 19:00:00  krbtgt/EXAMPLE.COM@EXAMPLE.COM\n\
                       \trenew until 10/26/26 09:00:00\n";
        assert_eq!(parse_expiry(listing, Utc::now()), local(2026, 10, 19, 19, 0, 0));
    }

    #[test]
    fn test_parse_expiry_mit_long_year() {
        let listing = "10/19/2026 09:00:00  10/20/2026 07:30:00  krbtgt/EXAMPLE.COM@EXAMPLE.COM";
        assert_eq!(parse_expiry(listing, Utc::now()), local(2026, 10, 20, 7, 30, 0));
    }

    #[test]
    fn test_parse_expiry_iso() {
        let listing = "2026-10-19 09:00:00  2026-10-19 21:15:00  krbtgt/EXAMPLE.COM@EXAMPLE.COM";
        assert_eq!(parse_expiry(listing, Utc::now()), local(2026, 10, 19, 21, 15, 0));
    }

    #[test]
    fn test_parse_expiry_heimdal() {
        let listing = "  Issued                Expires               Principal\n\
                       Oct 19 09:00:00 2026  Oct 19 19:00:00 2026  krbtgt/EXAMPLE.COM@EXAMPLE.COM";
        assert_eq!(parse_expiry(listing, Utc::now()), local(2026, 10, 19, 19, 0, 0));
    }

    #[test]
    fn test_parse_expiry_defaults_to_eight_hours() {
        let now = Utc::now();
        assert_eq!(parse_expiry("klist: garbage", now), now + chrono::Duration::hours(8));
        assert_eq!(
            parse_expiry("yesterday tomorrow krbtgt/EXAMPLE.COM@EXAMPLE.COM", now),
            now + chrono::Duration::hours(8)
        );
    }

    #[test]
    fn test_renewal_delay() {
        let now = Utc::now();
        assert_eq!(
            renewal_delay(Some(now + chrono::Duration::hours(1)), now),
            Duration::from_secs(50 * 60)
        );
        assert_eq!(renewal_delay(Some(now + chrono::Duration::minutes(5)), now), Duration::ZERO);
        assert_eq!(renewal_delay(Some(now - chrono::Duration::hours(1)), now), Duration::ZERO);
        assert_eq!(renewal_delay(None, now), Duration::from_secs(4 * 60 * 60));
    }

    #[tokio::test]
    async fn test_initialize_twice_obtains_once() {
        let mock = Arc::new(MockCommands::default());
        let keytab = keytab();
        let auth = authenticator(&mock, keytab.path());

        auth.initialize().await.unwrap();
        auth.initialize().await.unwrap();

        assert_eq!(mock.obtains.load(Ordering::SeqCst), 1);
        assert!(auth.is_valid());
        assert_eq!(auth.expiry(), None);
    }

    #[tokio::test]
    async fn test_missing_keytab_fails_without_obtain() {
        let mock = Arc::new(MockCommands::default());
        let auth = authenticator(&mock, Path::new("/nonexistent/svc.keytab"));

        let err = auth.initialize().await.unwrap_err();
        assert_eq!(err.error_code(), "AUTH_FAILED");
        assert!(err.message().contains("Keytab file not found"));
        assert_eq!(mock.obtains.load(Ordering::SeqCst), 0);
        assert!(!auth.is_valid());
    }

    #[tokio::test]
    async fn test_obtain_failure_is_auth_error() {
        let mock = Arc::new(MockCommands { fail_obtain_from: Some(1), ..MockCommands::default() });
        let keytab = keytab();
        let auth = authenticator(&mock, keytab.path());

        let err = auth.initialize().await.unwrap_err();
        assert!(matches!(err, RelayError::Auth { .. }));
        assert!(err.message().contains("KDC unreachable"));
        assert!(!auth.is_valid());
    }

    #[tokio::test]
    async fn test_destroy_never_initialized_skips_command() {
        let mock = Arc::new(MockCommands::default());
        let keytab = keytab();
        let auth = authenticator(&mock, keytab.path());

        auth.destroy().await;
        assert_eq!(mock.destroys.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_destroy_resets_even_when_command_fails() {
        let mock = Arc::new(MockCommands { fail_destroy: true, ..MockCommands::default() });
        let keytab = keytab();
        let auth = authenticator(&mock, keytab.path());

        auth.initialize().await.unwrap();
        auth.destroy().await;

        assert_eq!(mock.destroys.load(Ordering::SeqCst), 1);
        assert!(!auth.is_valid());

        // A fresh initialize obtains again
        auth.initialize().await.unwrap();
        assert_eq!(mock.obtains.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_expired_ticket_is_invalid_and_reobtained() {
        let mock = Arc::new(MockCommands {
            listing: Some(EXPIRED_LISTING.into()),
            ..MockCommands::default()
        });
        let keytab = keytab();
        let auth = authenticator(&mock, keytab.path());

        auth.initialize().await.unwrap();
        assert!(!auth.is_valid());

        auth.ensure_valid().await.unwrap();
        assert!(mock.obtains.load(Ordering::SeqCst) >= 2);
        auth.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_fires_after_interval() {
        let mock = Arc::new(MockCommands::default());
        let keytab = keytab();
        let auth = authenticator(&mock, keytab.path());

        auth.initialize().await.unwrap();
        tokio::time::sleep(UNKNOWN_EXPIRY_INTERVAL - Duration::from_secs(1)).await;
        assert_eq!(mock.obtains.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(mock.obtains.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_renewal_failure_retries_after_five_minutes() {
        let mock = Arc::new(MockCommands { fail_obtain_from: Some(2), ..MockCommands::default() });
        let keytab = keytab();
        let auth = authenticator(&mock, keytab.path());

        auth.initialize().await.unwrap();
        tokio::time::sleep(UNKNOWN_EXPIRY_INTERVAL + Duration::from_secs(1)).await;
        assert_eq!(mock.obtains.load(Ordering::SeqCst), 2);

        tokio::time::sleep(RENEWAL_RETRY).await;
        assert_eq!(mock.obtains.load(Ordering::SeqCst), 3);
        // Failed renewals are not escalated: the authenticator keeps its state
        assert!(auth.is_valid());
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_cancels_renewal() {
        let mock = Arc::new(MockCommands::default());
        let keytab = keytab();
        let auth = authenticator(&mock, keytab.path());

        auth.initialize().await.unwrap();
        auth.destroy().await;
        tokio::time::sleep(UNKNOWN_EXPIRY_INTERVAL * 3).await;

        assert_eq!(mock.obtains.load(Ordering::SeqCst), 1);
        assert_eq!(mock.destroys.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_cancels_renewal() {
        let mock = Arc::new(MockCommands::default());
        let keytab = keytab();

        {
            let auth = authenticator(&mock, keytab.path());
            auth.initialize().await.unwrap();
        }
        tokio::time::sleep(UNKNOWN_EXPIRY_INTERVAL * 2).await;

        assert_eq!(mock.obtains.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_ensure_valid_renews_once() {
        let mock = Arc::new(MockCommands {
            listing: Some(EXPIRED_LISTING.into()),
            fresh_from: Some(2),
            obtain_delay: Some(Duration::from_secs(1)),
            ..MockCommands::default()
        });
        let keytab = keytab();
        let auth = authenticator(&mock, keytab.path());

        auth.initialize().await.unwrap();
        assert!(!auth.is_valid());

        let (a, b, c) = tokio::join!(auth.ensure_valid(), auth.ensure_valid(), auth.ensure_valid());
        a.unwrap();
        b.unwrap();
        c.unwrap();

        assert!(auth.is_valid());
        assert_eq!(mock.obtains.load(Ordering::SeqCst), 2);
        auth.destroy().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_waits_for_inflight_renewal() {
        let mock = Arc::new(MockCommands { obtain_delay: Some(Duration::from_secs(10)), ..MockCommands::default() });
        let keytab = keytab();
        let auth = authenticator(&mock, keytab.path());

        auth.initialize().await.unwrap();
        // Renewal is now inside its 10 second kinit
        tokio::time::sleep(UNKNOWN_EXPIRY_INTERVAL + Duration::from_secs(1)).await;
        auth.destroy().await;

        assert_eq!(
            *mock.events.lock(),
            vec!["kinit started", "kinit finished", "kinit started", "kinit finished", "kdestroy"]
        );
        assert!(!auth.is_valid());

        tokio::time::sleep(UNKNOWN_EXPIRY_INTERVAL * 2).await;
        assert_eq!(mock.obtains.load(Ordering::SeqCst), 2);
    }
}
