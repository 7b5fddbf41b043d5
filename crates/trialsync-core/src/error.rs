//! Error types for the trial store, backend client and trial state parsing.

use thiserror::Error;

/// Failures reading or writing persisted trial keys.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sled: {0}")]
    Sled(#[from] sled::Error),
    #[error("stored value for {key} is not UTF-8")]
    NotUtf8 { key: String },
}

/// Failures talking to the backend API.
#[derive(Debug, Error)]
pub enum ClientError {
    #[error("request to {path} failed: {source}")]
    Transport {
        path: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("{path} returned {status}: {body}")]
    Status {
        path: String,
        status: u16,
        body: String,
    },
    #[error("{path} response parse: {message}")]
    Decode { path: String, message: String },
}

/// Trial data that cannot form a valid [`crate::TrialState`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TrialError {
    #[error("missing field: {0}")]
    Missing(&'static str),
    #[error("invalid timestamp for {field}: {value}")]
    InvalidTimestamp { field: &'static str, value: String },
    #[error("unknown tier: {0}")]
    UnknownTier(String),
    #[error("trial expires at or before it starts")]
    NonPositiveDuration,
}

/// Failures while refreshing state from the backend.
#[derive(Debug, Error)]
pub enum SyncError {
    #[error(transparent)]
    Client(#[from] ClientError),
    #[error(transparent)]
    Trial(#[from] TrialError),
}
