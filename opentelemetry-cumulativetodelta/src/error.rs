use thiserror::Error;

/// Errors returned by the cumulative-to-delta processor.
///
/// Per-point conversion outcomes are never errors; a point that cannot be
/// converted is simply not emitted. Errors only surface from configuration
/// and lifecycle operations.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    /// Invalid configuration.
    #[error("Config error: {0}")]
    Config(String),

    /// The processor was already shut down.
    #[error("Processor is already shut down")]
    AlreadyShutdown,

    /// Other errors not covered by specific cases.
    #[error("Cumulative-to-delta error: {0}")]
    Other(String),
}
