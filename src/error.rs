use thiserror::Error;

/// Errors produced by pipelines and their stages.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// A stage failed with a domain error carried as data.
    #[error("eventual failed: {0}")]
    Failed(String),

    /// The pipeline was cancelled: a stop signal reached the terminal.
    ///
    /// Produced after an [`Interrupt`](crate::interrupt::Interrupt) fires,
    /// or by stages that choose to stop on their own.
    #[error("eventual computation stopped (cancelled)")]
    Stopped,

    /// A stream ended before producing the value a sink required
    /// (e.g. [`head`](crate::stream::head) on an empty stream).
    #[error("stream ended without a value")]
    EmptyStream,

    /// Invalid configuration detected when a pipeline started
    /// (e.g. a stage pinned to a core beyond the pool width).
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl From<anyhow::Error> for Error {
    fn from(err: anyhow::Error) -> Self {
        Error::Other(err.to_string())
    }
}

impl From<String> for Error {
    fn from(message: String) -> Self {
        Error::Failed(message)
    }
}

impl From<&str> for Error {
    fn from(message: &str) -> Self {
        Error::Failed(message.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
