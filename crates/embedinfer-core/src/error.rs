use std::path::PathBuf;

use thiserror::Error;

/// Every failure this layer can report, grouped by where it originates.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed request construction: duplicate tensor name, zero byte size,
    /// conflicting correlation ids, reuse of a submitted request.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("model '{model}' (version {version}) is not ready")]
    ModelNotReady { model: String, version: i64 },

    #[error("cannot resolve input '{input}' of model '{model}' from its configuration: {reason}")]
    ConfigLookup {
        model: String,
        input: String,
        reason: String,
    },

    /// The engine rejected an operation; carries the engine's message.
    #[error("engine error: {0}")]
    Engine(String),

    /// The engine completed the call but flagged the response itself as failed.
    #[error("response error: {0}")]
    Response(String),

    #[error("malformed string tensor: {0}")]
    Decode(String),

    #[error("response parameter '{0}' has type BYTES, which is not supported")]
    UnsupportedParameterType(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::Engine(msg.into())
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
