//! Error types for the RBPF core

use std::time::Duration;

use thiserror::Error;

/// Errors produced by the filter core and its collaborators.
#[derive(Error, Debug)]
pub enum RbpfError {
    /// A frame transform required at startup did not resolve within the allowed wait.
    #[error("transform {target} -> {source_frame} unavailable after {waited:?}")]
    StartupTransformUnavailable {
        target: String,
        source_frame: String,
        waited: Duration,
    },

    #[error("map estimator of particle {particle} did not answer within {timeout:?}")]
    MapQueryTimeout { particle: usize, timeout: Duration },

    #[error("map estimator of particle {particle} failed: {reason}")]
    MapQueryFailure { particle: usize, reason: String },

    /// Not enough pings have been collected to serve a minibatch.
    #[error("insufficient ping history: {available} pings, {required} needed")]
    InsufficientHistory { available: usize, required: usize },

    #[error("unknown particle index {0}")]
    UnknownParticle(usize),

    #[error("reassignment of particle {particle} failed: {reason}")]
    ReassignmentFailed { particle: usize, reason: String },

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),
}

impl From<toml::de::Error> for RbpfError {
    fn from(e: toml::de::Error) -> Self {
        RbpfError::Config(e.to_string())
    }
}

impl From<toml::ser::Error> for RbpfError {
    fn from(e: toml::ser::Error) -> Self {
        RbpfError::Config(e.to_string())
    }
}

impl From<serde_json::Error> for RbpfError {
    fn from(e: serde_json::Error) -> Self {
        RbpfError::Config(e.to_string())
    }
}

impl RbpfError {
    /// True for the failures that count a particle as having missed the measurement.
    pub fn is_missed_measurement(&self) -> bool {
        matches!(
            self,
            RbpfError::MapQueryTimeout { .. } | RbpfError::MapQueryFailure { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, RbpfError>;
