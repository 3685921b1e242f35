//! TLS support for the login front-end

pub mod tls;

pub use tls::{generate_self_signed_cert, TlsProvider};
