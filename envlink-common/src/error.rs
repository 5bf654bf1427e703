use thiserror::Error;

/// Failures shared by the envlink crates: loading settings, talking to Zenoh
/// and encoding telemetry messages.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad or unparsable settings. Never retried.
    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("zenoh: {0}")]
    Zenoh(#[from] zenoh::Error),

    #[error("message encoding (json): {0}")]
    Json(#[from] serde_json::Error),

    #[error("message encoding (cbor): {0}")]
    Cbor(String),

    #[error("i/o: {0}")]
    Io(#[from] std::io::Error),

    /// A prefix, device id or topic that cannot form a key expression.
    #[error("bad key expression: {0}")]
    KeyExpr(String),
}

impl From<ciborium::ser::Error<std::io::Error>> for Error {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        Error::Cbor(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for Error {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        Error::Cbor(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
