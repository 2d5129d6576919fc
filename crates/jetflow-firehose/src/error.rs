use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// One malformed envelope; recovered locally by skipping it.
    #[error("Decode error: {0}")]
    Decode(String),

    /// Session setup failed before reading started.
    #[error("Handshake failed: {0}")]
    Handshake(String),

    /// WebSocket protocol failure; fatal to the session.
    #[error("WebSocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// Transport-level failure; fatal to the session.
    #[error("Transport error: {0}")]
    Transport(String),

    #[error(transparent)]
    Net(#[from] jetflow_net::Error),

    #[error(transparent)]
    Store(#[from] jetflow_core::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
