use thiserror::Error;

/// Unified error type for Plugboard.
///
/// Only `Config` and `Bind` are fatal; every other variant is scoped to a
/// single exchange and closes that connection without touching the acceptor.
#[derive(Error, Debug)]
pub enum ProxyError {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Bind error: {0}")]
    Bind(std::io::Error),

    #[error("Upstream dial error: {0}")]
    UpstreamDial(std::io::Error),

    #[error("Client framing error: {0}")]
    ClientFraming(String),

    #[error("Upstream framing error: {0}")]
    UpstreamFraming(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// Fatal errors terminate the process; the rest are contained to one
    /// connection.
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProxyError::Config(_) | ProxyError::Bind(_))
    }
}
