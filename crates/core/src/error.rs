/// Result alias that carries the custom [`MetronomeError`] type.
pub type Result<T> = std::result::Result<T, MetronomeError>;

/// Common error type for the core crate.
#[derive(Debug, thiserror::Error)]
pub enum MetronomeError {
    /// Free-form failure that does not warrant its own variant.
    #[error("{0}")]
    Message(String),
    /// A tempo request outside the supported range or not a number at all.
    #[error("invalid tempo `{0}`: expected an integer between 30 and 300 BPM")]
    InvalidTempo(String),
    /// The audio device could not be opened, written or closed.
    #[error("audio device error: {0}")]
    Audio(String),
    /// Wrapper around standard IO errors.
    #[error("{0}")]
    Io(#[from] std::io::Error),
    /// Persisted state could not be encoded or decoded.
    #[error("{0}")]
    Json(#[from] serde_json::Error),
}

impl MetronomeError {
    /// Creates a new error that simply wraps the provided message.
    pub fn msg<T: Into<String>>(msg: T) -> Self {
        Self::Message(msg.into())
    }

    /// Creates an audio device error from anything printable.
    pub fn audio<T: std::fmt::Display>(err: T) -> Self {
        Self::Audio(err.to_string())
    }
}

impl From<&str> for MetronomeError {
    fn from(value: &str) -> Self {
        Self::msg(value)
    }
}

impl From<String> for MetronomeError {
    fn from(value: String) -> Self {
        Self::Message(value)
    }
}
