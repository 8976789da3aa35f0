//! Error types for tracelink-broker

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Failed to bind listener: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Failed to read config: {0}")]
    ConfigRead(#[source] std::io::Error),

    #[error("Failed to parse config: {0}")]
    ConfigParse(String),

    #[error(
        "Config version {found} is newer than supported version {supported}. Please upgrade the broker."
    )]
    ConfigVersionTooNew { found: u32, supported: u32 },

    #[error("Server error: {0}")]
    Server(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
