//! login-rs: pre-authentication IMAP front-end
//!
//! A network-facing process that accepts client connections, speaks the
//! small IMAP command subset that is legal before authentication, drives
//! SASL exchanges against an out-of-process authentication service,
//! upgrades sessions to TLS in-band (STARTTLS), and hands authenticated
//! connections off to a post-login process.
//!
//! # Resource bounds
//!
//! - Input and output buffers are capped at 4 KiB per connection
//! - Command lines are capped at 8 KiB
//! - Ten bad commands, or sixty seconds of silence, end a connection
//! - When the global connection cap is reached, the oldest sessions are
//!   evicted in batches
//!
//! # Modules
//!
//! - [`config`]: Configuration management
//! - [`error`]: Error types
//! - [`imap`]: Parser, connection state machine, SASL driver, listener
//! - [`auth`]: Authentication service client
//! - [`master`]: Post-login handoff
//! - [`registry`]: Process-wide connection registry
//! - [`security`]: TLS certificate loading

pub mod auth;
pub mod config;
pub mod error;
pub mod imap;
pub mod master;
pub mod registry;
pub mod security;

// Re-export commonly used types
pub use config::Config;
pub use error::{LoginError, Result};
pub use imap::LoginServer;
