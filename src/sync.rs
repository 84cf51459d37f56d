//! Control surface synchronizer
//!
//! Owns the authoritative current profile, the set of control endpoints and
//! the restart-grace window. Every state-changing operation runs behind one
//! async gate; the plain state mutex is only held between awaits, so readers
//! see the optimistic state while a load is in flight.

use crate::appliance::{Appliance, DEFAULT_FORM_PATH};
use crate::digest::Credentials;
use crate::error::{EngineError, Result};
use crate::http::Transport;
use crate::models::{ControlEndpoint, EndpointEvent, EndpointStatus, Profile, StatusReport};
use crate::resolver;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::Instant;

pub const DEFAULT_RESTART_GRACE: Duration = Duration::from_millis(10_000);

const EVENT_CAPACITY: usize = 64;

/// Connection parameters plus the last selected profile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_https: bool,
    pub form_path: String,
    /// Identifier selected last, resolved on the first refresh
    pub profile: Option<String>,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            host: String::new(),
            port: 80,
            username: String::new(),
            password: String::new(),
            use_https: false,
            form_path: DEFAULT_FORM_PATH.to_string(),
            profile: None,
        }
    }
}

impl ConnectionSettings {
    /// Host, username and password are all present
    pub fn is_complete(&self) -> bool {
        !self.host.trim().is_empty() && !self.username.is_empty() && !self.password.is_empty()
    }

    pub fn credentials(&self) -> Credentials {
        Credentials {
            host: self.host.trim().to_string(),
            port: self.port,
            username: self.username.clone(),
            password: self.password.clone(),
            use_https: self.use_https,
        }
    }

    fn same_connection(&self, other: &Self) -> bool {
        self.credentials() == other.credentials() && self.form_path == other.form_path
    }
}

/// Which profile the synchronizer considers active
#[derive(Debug, Clone, PartialEq, Eq)]
enum Current {
    /// Nothing resolved yet; the next refresh resolves the configured profile
    Unresolved,
    Active(Profile),
    /// Explicitly switched off through an endpoint
    Standby,
}

impl Current {
    fn profile(&self) -> Option<&Profile> {
        match self {
            Self::Active(p) => Some(p),
            _ => None,
        }
    }
}

struct SyncState {
    settings: ConnectionSettings,
    /// Usable profiles from the last successful refresh
    profiles: Vec<Profile>,
    current: Current,
    endpoints: Vec<ControlEndpoint>,
    grace_until: Option<Instant>,
}

impl SyncState {
    fn in_grace(&self) -> bool {
        self.grace_until
            .map(|until| Instant::now() < until)
            .unwrap_or(false)
    }

    /// Bring endpoints in line with the cached profiles and current value
    fn reconcile(&mut self) -> Vec<EndpointEvent> {
        let mut events = Vec::new();
        let gated = !self.settings.is_complete();
        let selected_id = self.current.profile().map(|p| p.id.clone());
        let mut selected_seen = false;

        let mut previous = std::mem::take(&mut self.endpoints);
        let mut next: Vec<ControlEndpoint> = Vec::with_capacity(self.profiles.len());

        for profile in &self.profiles {
            let key = unique_key(&next, &profile.id);

            // Only the first profile carrying the active id is selected
            let status = if gated {
                EndpointStatus::Indeterminate
            } else if !selected_seen && selected_id.as_deref() == Some(profile.id.as_str()) {
                selected_seen = true;
                EndpointStatus::Selected
            } else {
                EndpointStatus::Deselected
            };

            match previous.iter().position(|e| e.key == key) {
                Some(idx) => {
                    let mut endpoint = previous.remove(idx);
                    endpoint.profile = profile.clone();
                    if endpoint.status != status {
                        endpoint.status = status;
                        events.push(EndpointEvent::StatusChanged {
                            key: key.clone(),
                            status,
                        });
                    }
                    next.push(endpoint);
                }
                None => {
                    let endpoint = ControlEndpoint {
                        key,
                        profile: profile.clone(),
                        status,
                    };
                    events.push(EndpointEvent::Created(endpoint.clone()));
                    next.push(endpoint);
                }
            }
        }

        for gone in previous {
            events.push(EndpointEvent::Removed(gone.key));
        }

        self.endpoints = next;
        events
    }
}

/// Endpoint key for a profile identifier; colliding slugs get a numeric suffix
fn unique_key(taken: &[ControlEndpoint], id: &str) -> String {
    let base = resolver::normalize(id);
    let mut key = base.clone();
    let mut n = 2;
    while taken.iter().any(|e| e.key == key) {
        key = format!("{}-{}", base, n);
        n += 1;
    }
    key
}

/// Outcome of one refresh
struct Refreshed {
    profiles: Vec<Profile>,
    /// The fetch failed inside the restart-grace window; `profiles` is the cache
    restarting: bool,
}

/// Keeps control endpoints in step with the appliance's active profile
pub struct Synchronizer {
    transport: Arc<dyn Transport>,
    restart_grace: Duration,
    gate: tokio::sync::Mutex<()>,
    appliance: Mutex<Arc<Appliance>>,
    state: Mutex<SyncState>,
    events: broadcast::Sender<EndpointEvent>,
}

impl Synchronizer {
    pub fn new(
        transport: Arc<dyn Transport>,
        settings: ConnectionSettings,
        restart_grace: Duration,
    ) -> Self {
        let appliance = Arc::new(Appliance::new(
            transport.clone(),
            settings.credentials(),
            &settings.form_path,
        ));
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            transport,
            restart_grace,
            gate: tokio::sync::Mutex::new(()),
            appliance: Mutex::new(appliance),
            state: Mutex::new(SyncState {
                settings,
                profiles: Vec::new(),
                current: Current::Unresolved,
                endpoints: Vec::new(),
                grace_until: None,
            }),
            events,
        }
    }

    /// Receive endpoint creations, removals and status changes
    pub fn subscribe(&self) -> broadcast::Receiver<EndpointEvent> {
        self.events.subscribe()
    }

    pub fn settings(&self) -> ConnectionSettings {
        self.lock_state().settings.clone()
    }

    pub fn current_profile(&self) -> Option<Profile> {
        self.lock_state().current.profile().cloned()
    }

    pub fn list_endpoints(&self) -> Vec<ControlEndpoint> {
        self.lock_state().endpoints.clone()
    }

    /// Aggregate state of the whole surface
    pub fn surface_status(&self) -> EndpointStatus {
        let state = self.lock_state();
        if !state.settings.is_complete() {
            EndpointStatus::Indeterminate
        } else if state.current.profile().is_some() {
            EndpointStatus::Selected
        } else {
            EndpointStatus::Deselected
        }
    }

    /// Replace connection settings; a changed connection gets a fresh session
    pub async fn update_settings(&self, settings: ConnectionSettings) {
        let _gate = self.gate.lock().await;

        let events = {
            let mut state = self.lock_state();
            if !state.settings.same_connection(&settings) {
                tracing::info!("Connection settings changed, starting a new session");
                let appliance = Appliance::new(
                    self.transport.clone(),
                    settings.credentials(),
                    &settings.form_path,
                );
                *self
                    .appliance
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner) = Arc::new(appliance);
                state.grace_until = None;
                state.current = Current::Unresolved;
            }
            state.settings = settings;
            state.reconcile()
        };
        self.publish(events);
    }

    /// Fetch the usable profile list and reconcile endpoints
    pub async fn fetch_profiles(&self) -> Result<Vec<Profile>> {
        let _gate = self.gate.lock().await;
        self.refresh_locked().await.map(|r| r.profiles)
    }

    /// Status line for the current state, refreshing from the appliance
    pub async fn current_status(&self) -> StatusReport {
        let _gate = self.gate.lock().await;

        match self.refresh_locked().await {
            Ok(Refreshed {
                restarting: true, ..
            }) => StatusReport::ok("Waiting for appliance restart"),
            Ok(_) => match self.current_profile() {
                Some(p) => StatusReport::ok(format!("Active profile: {}", p.title)),
                None => StatusReport::ok("No active profile"),
            },
            Err(EngineError::Validation(_)) if !self.settings().is_complete() => {
                StatusReport::error("Missing connection settings")
            }
            Err(e) => StatusReport::error(e.to_string()),
        }
    }

    /// Activate a profile on the appliance.
    ///
    /// Endpoints flip optimistically before the submission and are rolled
    /// back if the appliance rejects it.
    pub async fn load_profile(&self, requested: &str) -> Result<Profile> {
        let _gate = self.gate.lock().await;

        self.check_settings()?;
        let requested = requested.trim();
        if requested.is_empty() {
            return Err(EngineError::Validation("profile identifier is empty".to_string()));
        }

        let needs_refresh = self.lock_state().profiles.is_empty();
        if needs_refresh {
            self.refresh_locked().await?;
        }

        let (target, snapshot, events) = {
            let mut state = self.lock_state();
            if state.profiles.is_empty() {
                return Err(EngineError::Resolution(Some(requested.to_string())));
            }
            let target = resolver::find_match(&state.profiles, requested)
                .cloned()
                .ok_or_else(|| {
                    EngineError::Validation(format!("'{}' is not a selectable profile", requested))
                })?;

            let snapshot = state.current.clone();
            state.current = Current::Active(target.clone());
            let events = state.reconcile();
            (target, snapshot, events)
        };
        self.publish(events);

        tracing::info!("Loading profile '{}'", target.id);
        match self.appliance().submit_profile(&target).await {
            Ok(()) => {
                let mut state = self.lock_state();
                state.settings.profile = Some(target.id.clone());
                state.grace_until = Some(Instant::now() + self.restart_grace);
                tracing::info!(
                    "Profile '{}' loaded, appliance restarting for up to {:?}",
                    target.id,
                    self.restart_grace
                );
                Ok(target)
            }
            Err(e) => {
                tracing::warn!("Loading '{}' failed, rolling back: {}", target.id, e);
                let events = {
                    let mut state = self.lock_state();
                    state.current = snapshot;
                    state.reconcile()
                };
                self.publish(events);
                Err(e)
            }
        }
    }

    /// Switch off one endpoint; only clears the active profile if it owns it
    pub async fn deselect(&self, key: &str) -> Result<()> {
        let _gate = self.gate.lock().await;
        self.check_settings()?;

        let events = {
            let mut state = self.lock_state();
            let selected = match state.endpoints.iter().find(|e| e.key == key) {
                Some(endpoint) => endpoint.status == EndpointStatus::Selected,
                None => {
                    return Err(EngineError::Validation(format!("unknown endpoint '{}'", key)))
                }
            };

            if selected {
                tracing::info!("Endpoint '{}' switched off, no profile active", key);
                state.current = Current::Standby;
            }
            state.reconcile()
        };
        self.publish(events);
        Ok(())
    }

    async fn refresh_locked(&self) -> Result<Refreshed> {
        if let Err(e) = self.check_settings() {
            let events = self.lock_state().reconcile();
            self.publish(events);
            return Err(e);
        }

        let fetched = self.appliance().fetch_form().await;

        let mut state = self.lock_state();
        let form = match fetched {
            Ok(form) => form,
            Err(e) if e.is_restart_class() && state.in_grace() => {
                tracing::warn!("Appliance unavailable while restarting: {}", e);
                return Ok(Refreshed {
                    profiles: state.profiles.clone(),
                    restarting: true,
                });
            }
            Err(e) => {
                tracing::error!("Profile refresh failed: {}", e);
                return Err(e);
            }
        };

        let usable = resolver::usable_profiles(&form.profiles);
        let requested = match &state.current {
            Current::Active(p) => Some(p.id.clone()),
            Current::Unresolved => state.settings.profile.clone(),
            Current::Standby => None,
        };

        if state.current != Current::Standby {
            state.current = match resolver::resolve(&usable, requested.as_deref()) {
                Ok(profile) => Current::Active(profile),
                Err(e) => {
                    tracing::warn!("{}", e);
                    Current::Unresolved
                }
            };
        }

        state.profiles = usable.clone();
        let events = state.reconcile();
        drop(state);
        self.publish(events);

        Ok(Refreshed {
            profiles: usable,
            restarting: false,
        })
    }

    fn check_settings(&self) -> Result<()> {
        if self.lock_state().settings.is_complete() {
            Ok(())
        } else {
            Err(EngineError::Validation(
                "host, username and password are required".to_string(),
            ))
        }
    }

    fn appliance(&self) -> Arc<Appliance> {
        self.appliance
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    fn lock_state(&self) -> MutexGuard<'_, SyncState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn publish(&self, events: Vec<EndpointEvent>) {
        for event in events {
            tracing::debug!("Endpoint event: {:?}", event);
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }
}
