use thiserror::Error;

#[derive(Error, Debug)]
pub enum LoginError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("Auth service protocol error: {0}")]
    AuthProtocol(String),
}

pub type Result<T> = std::result::Result<T, LoginError>;
