use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("DNS resolution for {0} failed: {1}")]
    Resolve(String, #[source] std::io::Error),

    #[error("DNS resolution for {0} returned no addresses")]
    NoRecords(String),

    #[error("No connectable address remaining for {0}")]
    NoRoute(String),

    #[error("Connection failed: {0}")]
    Connect(#[from] std::io::Error),

    #[error("Connection race to {0} timed out")]
    Timeout(String),

    #[error("Connection cancelled")]
    Cancelled,
}

pub type Result<T> = std::result::Result<T, Error>;
