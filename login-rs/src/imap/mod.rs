//! Pre-authentication IMAP front-end
//!
//! Speaks the pre-login command subset (CAPABILITY, NOOP, STARTTLS,
//! LOGIN, AUTHENTICATE, LOGOUT), relays SASL to the auth service and
//! hands authenticated connections to the post-login process.

pub mod authenticate;
pub mod connection;
pub mod parser;
pub mod server;

pub use authenticate::capability_string;
pub use connection::{Client, ClientHandle, ClientStream, DisconnectReason};
pub use parser::{Arg, ImapParser, ParseError};
pub use server::LoginServer;
