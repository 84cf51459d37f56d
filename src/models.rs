//! Data models shared by the scraper, resolver and synchronizer

use serde::Serialize;
use std::fmt;

/// Title used when an option has neither text nor a value
pub const PLACEHOLDER_TITLE: &str = "Unnamed profile";

/// A selectable operating profile discovered on the appliance's form
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Profile {
    /// Appliance-defined identifier, submitted verbatim on load
    pub id: String,
    /// Human-readable title
    pub title: String,
}

impl Profile {
    /// Build a profile, falling back to the identifier and then to a
    /// placeholder when the title is empty.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        let id = id.into();
        let mut title = title.into();
        if title.trim().is_empty() {
            title = if id.trim().is_empty() {
                PLACEHOLDER_TITLE.to_string()
            } else {
                id.clone()
            };
        }
        Self { id, title }
    }

    /// Case-insensitive identifier comparison
    pub fn is(&self, id: &str) -> bool {
        self.id.to_lowercase() == id.to_lowercase()
    }
}

impl fmt::Display for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.title == self.id {
            write!(f, "{}", self.id)
        } else {
            write!(f, "{} ({})", self.title, self.id)
        }
    }
}

/// On/off state of a control endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointStatus {
    Selected,
    Deselected,
    Indeterminate,
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Selected => "on",
            Self::Deselected => "off",
            Self::Indeterminate => "unknown",
        };
        f.write_str(s)
    }
}

/// Externally addressable on/off representation of one profile
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ControlEndpoint {
    /// Stable key derived from the profile identifier
    pub key: String,
    pub profile: Profile,
    pub status: EndpointStatus,
}

/// Change notifications published by the synchronizer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointEvent {
    Created(ControlEndpoint),
    Removed(String),
    StatusChanged {
        key: String,
        status: EndpointStatus,
    },
}

/// Human-facing status line
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StatusReport {
    pub message: String,
    pub is_error: bool,
}

impl StatusReport {
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_error: false,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            is_error: true,
        }
    }
}
