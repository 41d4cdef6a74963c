//! Salesdesk Error Types
//!
//! This module defines a layered error hierarchy:
//! - `TransportError`: failures reported by the realtime service
//! - `ChannelError`: failures while driving a single channel (transport or payload)
//! - `TeardownError`: close failures collected while ending a session
//! - `ConfigError`: configuration loading and validation
//! - `SalesdeskError`: top-level error that wraps every category

use crate::transport::SubscriptionId;
use thiserror::Error;

/// Errors reported by a `RealtimeTransport` implementation
#[derive(Debug, Error)]
pub enum TransportError {
    /// The service refused or failed the subscription request
    #[error("Subscribe to '{topic}' failed: {reason}")]
    Subscribe { topic: String, reason: String },

    /// Publishing the local presence record failed
    #[error("Presence track on '{topic}' failed: {reason}")]
    Track { topic: String, reason: String },

    /// The authoritative presence table could not be read
    #[error("Presence state for '{topic}' unavailable: {reason}")]
    PresenceState { topic: String, reason: String },

    /// Releasing the remote subscription failed
    #[error("Unsubscribe from '{topic}' failed: {reason}")]
    Unsubscribe { topic: String, reason: String },

    /// The subscription is not (or no longer) known to the service
    #[error("Unknown subscription: {0}")]
    UnknownSubscription(SubscriptionId),
}

/// Errors raised while driving one channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    /// A presence or change payload did not have the expected shape
    #[error("Malformed payload on '{topic}': {source}")]
    Payload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    /// The operation needs an acknowledged subscription
    #[error("Channel '{topic}' is not subscribed")]
    NotSubscribed { topic: String },
}

/// Close failures collected during session teardown.
///
/// Local state has already been reset when this error is returned.
#[derive(Debug, Error)]
#[error("Session teardown finished with {} channel close failure(s): {}", failures.len(), summarize(failures))]
pub struct TeardownError {
    pub failures: Vec<ChannelError>,
}

fn summarize(failures: &[ChannelError]) -> String {
    failures
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Config not found: {path}")]
    NotFound { path: String },

    #[error("Config invalid [{field}]: {reason}")]
    Invalid { field: String, reason: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yml::Error),
}

/// Top-level error type for salesdesk
#[derive(Debug, Error)]
pub enum SalesdeskError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error(transparent)]
    Teardown(#[from] TeardownError),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

pub type Result<T, E = SalesdeskError> = std::result::Result<T, E>;
