use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

/// Failure taxonomy shared by every façade.
///
/// Façades translate these into their own vocabulary (HTTP status, exit code,
/// JSON-RPC error) but must keep the split between client mistakes
/// ([`Error::is_client_error`]) and system failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input, correctable by the caller. Never retried.
    #[error("{0}")]
    InvalidRequest(String),

    #[error("Unsupported precision '{0}'. Available: full, q8, q4")]
    UnknownPrecision(String),

    /// Weights or adapter could not be loaded. The engine is left `Unloaded`.
    #[error("model load failed: {message}")]
    ModelLoad {
        message: String,
        #[source]
        source: anyhow::Error,
    },

    /// Inference failed. `out_of_memory` lets a façade suggest a smaller tier.
    #[error("generation failed: {message}")]
    Generation { message: String, out_of_memory: bool },

    #[error("{0}")]
    NotFound(String),

    #[error("storage error: {message}")]
    Storage {
        message: String,
        #[source]
        source: anyhow::Error,
    },
}

impl Error {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidRequest(message.into())
    }

    pub fn model_load(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::ModelLoad {
            message: message.into(),
            source: source.into(),
        }
    }

    pub fn storage(message: impl Into<String>, source: impl Into<anyhow::Error>) -> Self {
        Self::Storage {
            message: message.into(),
            source: source.into(),
        }
    }

    /// Builds a [`Error::Generation`] from an inference failure, flagging
    /// allocator exhaustion reported by any backend.
    pub fn generation(source: anyhow::Error) -> Self {
        let message = format!("{source:#}");
        let out_of_memory = looks_like_oom(&message);
        Self::Generation {
            message,
            out_of_memory,
        }
    }

    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_) | Self::UnknownPrecision(_) | Self::NotFound(_)
        )
    }

    pub fn is_out_of_memory(&self) -> bool {
        matches!(
            self,
            Self::Generation {
                out_of_memory: true,
                ..
            }
        )
    }
}

impl From<sqlx::Error> for Error {
    fn from(e: sqlx::Error) -> Self {
        Self::storage("database operation failed", e)
    }
}

fn looks_like_oom(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    [
        "out of memory",
        "out_of_memory",
        "outofmemory",
        "failed to allocate",
        "memory allocation",
        "insufficient memory",
    ]
    .iter()
    .any(|needle| lower.contains(needle))
}
