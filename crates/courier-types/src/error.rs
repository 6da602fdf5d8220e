//! Error types shared across all courier crates.

/// Errors that can occur across the courier runtime.
///
/// Each variant corresponds to a different subsystem: configuration
/// loading/validation, persisted state stores, or the transform pipeline.
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("state store error: {0}")]
    Store(String),

    #[error("invalid replacement rule `{find}`: {reason}")]
    Rule { find: String, reason: String },
}
