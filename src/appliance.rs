//! Profile form access on the appliance
//!
//! Wraps a [`DigestSession`] with the form path and the hidden fields that
//! must be replayed on every load. All requests go through one async mutex,
//! so digest nonce counts are never interleaved.

use crate::digest::{Credentials, DigestSession};
use crate::error::{EngineError, Result};
use crate::http::{HttpResponse, Transport};
use crate::models::Profile;
use crate::parser::{self, HiddenFields, ScrapedForm};
use reqwest::Method;
use std::sync::Arc;
use tokio::sync::Mutex;

pub const DEFAULT_FORM_PATH: &str = "/profile.html";

/// Form field carrying the chosen profile identifier
const PROFILE_FIELD: &str = "profile";

struct ApplianceState {
    session: DigestSession,
    hidden_fields: Option<HiddenFields>,
}

/// One configured appliance connection
pub struct Appliance {
    form_path: String,
    state: Mutex<ApplianceState>,
}

impl Appliance {
    pub fn new(transport: Arc<dyn Transport>, credentials: Credentials, form_path: &str) -> Self {
        let form_path = if form_path.starts_with('/') {
            form_path.to_string()
        } else {
            format!("/{}", form_path)
        };

        Self {
            form_path,
            state: Mutex::new(ApplianceState {
                session: DigestSession::new(transport, credentials),
                hidden_fields: None,
            }),
        }
    }

    /// Fetch and scrape the profile form, refreshing the hidden-field cache
    pub async fn fetch_form(&self) -> Result<ScrapedForm> {
        let mut state = self.state.lock().await;
        self.fetch_locked(&mut state).await
    }

    /// Submit a profile load with the cached hidden fields
    pub async fn submit_profile(&self, profile: &Profile) -> Result<()> {
        let mut state = self.state.lock().await;

        let mut fields = match state.hidden_fields.clone() {
            Some(fields) => fields,
            None => {
                tracing::debug!("No hidden fields cached, fetching form first");
                self.fetch_locked(&mut state).await?.hidden_fields
            }
        };
        if fields.is_empty() {
            tracing::debug!("Form carries no hidden fields");
        }
        fields.insert(PROFILE_FIELD, profile.id.as_str());

        let base = state.session.base_url();
        let headers = vec![
            (
                "Content-Type".to_string(),
                "application/x-www-form-urlencoded".to_string(),
            ),
            ("Origin".to_string(), base.clone()),
            ("Referer".to_string(), format!("{}{}", base, self.form_path)),
        ];

        let result = state
            .session
            .request(Method::POST, &self.form_path, &headers, Some(encode_form(&fields)))
            .await
            .and_then(|resp| check_status(resp, "profile load"));

        match result {
            Ok(_) => {
                tracing::info!("Appliance accepted profile '{}'", profile.id);
                Ok(())
            }
            Err(e) => {
                state.hidden_fields = None;
                Err(e)
            }
        }
    }

    async fn fetch_locked(&self, state: &mut ApplianceState) -> Result<ScrapedForm> {
        let resp = state
            .session
            .request(Method::GET, &self.form_path, &[], None)
            .await?;
        let resp = check_status(resp, "form fetch")?;

        let form = parser::scrape_form(&resp.body);
        tracing::debug!(
            "Scraped {} hidden field(s), {} profile option(s)",
            form.hidden_fields.len(),
            form.profiles.len()
        );
        state.hidden_fields = Some(form.hidden_fields.clone());
        Ok(form)
    }
}

fn check_status(resp: HttpResponse, what: &str) -> Result<HttpResponse> {
    if resp.is_success() {
        return Ok(resp);
    }

    let snippet: String = resp.body.chars().take(80).collect();
    Err(EngineError::protocol(
        resp.status,
        format!("{} failed: {}", what, snippet.trim()),
    ))
}

fn encode_form(fields: &HiddenFields) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}
