//! Error types

/// Errors surfaced by the engine and configuration layer.
///
/// Parse misses and decryption failures are not errors; they resolve to the
/// least intrusive verdict instead.
#[derive(Debug, thiserror::Error)]
pub enum MangleError {
    /// The packet sink refused a crafted packet
    #[error("Send failed: {0}")]
    Send(#[source] std::io::Error),

    /// A crafted packet could not be built
    #[error("Packet synthesis failed: {0}")]
    Synthesis(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// No tokio runtime to run the background sweep on
    #[error("Runtime unavailable: {0}")]
    Runtime(String),

    /// I/O error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    TomlDe(#[from] toml::de::Error),

    #[error("TOML encode error: {0}")]
    TomlSer(#[from] toml::ser::Error),

    #[error("Hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
}
