//! Error types for the engine binary.
//!
//! [`EngineError`] is the top-level error type that wraps every failure
//! mode during engine startup and simulation execution.

/// Top-level error for the engine binary.
///
/// Each variant wraps a specific subsystem error, providing a single
/// error type that `main` can propagate with `?`.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Configuration loading failed.
    #[error("config error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: commons_core::config::ConfigError,
    },

    /// Environment construction failed.
    #[error("round error: {source}")]
    Round {
        /// The underlying round error.
        #[from]
        source: commons_core::round::RoundError,
    },

    /// Simulation runner failed.
    #[error("runner error: {source}")]
    Runner {
        /// The underlying runner error.
        #[from]
        source: commons_core::runner::RunnerError,
    },

    /// Decision policy configuration was unusable.
    #[error("policy error: {message}")]
    Policy {
        /// Description of the policy failure.
        message: String,
    },

    /// Output records could not be written.
    #[error("output error: {message}")]
    Output {
        /// Description of the output failure.
        message: String,
    },
}
