//! Profile resolution against the appliance's advertised list

use crate::error::{EngineError, Result};
use crate::models::Profile;

/// Identifier picked when nothing was requested or the request matched nothing
pub const DEFAULT_PROFILE_ID: &str = "sda";

/// Lowercase and collapse runs of non-alphanumerics into a single `-`
pub fn normalize(id: &str) -> String {
    let mut out = String::with_capacity(id.len());
    for c in id.trim().chars() {
        if c.is_alphanumeric() {
            out.extend(c.to_lowercase());
        } else if !out.ends_with('-') {
            out.push('-');
        }
    }
    out.trim_matches('-').to_string()
}

/// Placeholder entries such as an empty option or "Default"
pub fn is_placeholder(profile: &Profile) -> bool {
    let normalized = normalize(&profile.id);
    normalized.is_empty() || normalized == "default"
}

/// Profiles that may be shown and selected, in server order
pub fn usable_profiles(profiles: &[Profile]) -> Vec<Profile> {
    profiles
        .iter()
        .filter(|p| !is_placeholder(p))
        .cloned()
        .collect()
}

/// Strict lookup: identifier matches beat title matches, first in list order wins
pub fn find_match<'a>(usable: &'a [Profile], requested: &str) -> Option<&'a Profile> {
    let wanted = requested.trim().to_lowercase();
    if wanted.is_empty() {
        return None;
    }

    usable
        .iter()
        .find(|p| p.id.trim().to_lowercase() == wanted)
        .or_else(|| usable.iter().find(|p| p.title.trim().to_lowercase() == wanted))
}

/// Resolve a requested identifier, falling back to the default label and
/// then to the first usable profile.
pub fn resolve(profiles: &[Profile], requested: Option<&str>) -> Result<Profile> {
    let usable = usable_profiles(profiles);
    let requested = requested.map(str::trim).filter(|r| !r.is_empty());

    if usable.is_empty() {
        return Err(EngineError::Resolution(requested.map(str::to_string)));
    }

    if let Some(req) = requested {
        if let Some(found) = find_match(&usable, req) {
            return Ok(found.clone());
        }
        tracing::debug!("Requested profile '{}' not offered, falling back", req);
    }

    let chosen = usable
        .iter()
        .find(|p| p.is(DEFAULT_PROFILE_ID))
        .unwrap_or(&usable[0]);

    Ok(chosen.clone())
}
