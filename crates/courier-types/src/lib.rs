//! Core types shared across all courier crates.
//!
//! Defines the relay configuration schema (workers, channel pairs,
//! replacement rules, filters, tuning knobs) and the error type used by
//! the engine and CLI.

pub mod config;
pub mod error;

pub use config::{
    ChannelPair, FilterConfig, FilterMode, RelayConfig, RelaySettings, ReplacementRule,
    WorkerConfig,
};
pub use error::RelayError;
