//! Error taxonomy for the profile engine

use thiserror::Error;

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors surfaced by the session, scraper, resolver and synchronizer
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum EngineError {
    /// The appliance still answered 401 after the digest retry
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Transport-level failure before any HTTP status was received
    #[error("Cannot reach appliance: {0}")]
    Connectivity(String),

    /// Non-2xx answer (other than 401) or an unusable response body
    #[error("Appliance returned {status}: {detail}")]
    Protocol {
        /// HTTP status code, 0 when no status was received
        status: u16,
        detail: String,
    },

    /// No usable profile exists to resolve against
    #[error("No usable profile found{}", .0.as_deref().map(|id| format!(" for '{}'", id)).unwrap_or_default())]
    Resolution(Option<String>),

    /// Missing settings or an invalid request from the caller
    #[error("Invalid request: {0}")]
    Validation(String),
}

impl EngineError {
    pub fn protocol(status: u16, detail: impl Into<String>) -> Self {
        Self::Protocol {
            status,
            detail: detail.into(),
        }
    }

    /// Errors the appliance produces while it reboots after a profile switch
    pub fn is_restart_class(&self) -> bool {
        matches!(self, Self::Connectivity(_) | Self::Protocol { .. })
    }
}

impl From<reqwest::Error> for EngineError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_connect() || e.is_timeout() {
            Self::Connectivity(e.to_string())
        } else {
            Self::protocol(e.status().map(|s| s.as_u16()).unwrap_or(0), e.to_string())
        }
    }
}
