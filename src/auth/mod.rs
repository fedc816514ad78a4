//! Authentication support for cluster engines
//!
//! Hive and Impala sources configured with `auth = "kerberos"` own a
//! [`TicketAuthenticator`] whose lifetime follows the connector's
//! connect/disconnect calls.

pub mod kerberos;

pub use kerberos::{CredentialCommands, SystemCommands, TicketAuthenticator};
