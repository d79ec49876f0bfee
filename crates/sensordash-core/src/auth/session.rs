use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use reqwest::header::AUTHORIZATION;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::CredentialStorage;
use crate::api::transport::{bearer_header, join_url, ApiRequest, Transport};
use crate::api::ApiError;

/// Storage key for the access token
pub const ACCESS_TOKEN_KEY: &str = "accessToken";

/// Storage key for the refresh token
pub const REFRESH_TOKEN_KEY: &str = "refreshToken";

/// Storage key for the JSON-serialized identity
pub const USER_KEY: &str = "user";

const REFRESH_PATH: &str = "/refresh";

/// Session events are informational; a slow subscriber that falls this far
/// behind only misses old events.
const EVENT_CHANNEL_CAPACITY: usize = 16;

/// The logged-in user as returned by `/login` and `/profile`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    pub id: i64,
    pub username: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub first_name: Option<String>,
    #[serde(default)]
    pub last_name: Option<String>,
}

impl Identity {
    /// "First Last" when both are known, otherwise the username.
    pub fn display_name(&self) -> String {
        match (&self.first_name, &self.last_name) {
            (Some(first), Some(last)) => format!("{} {}", first, last),
            _ => self.username.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Credentials {
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Session {
    pub credentials: Credentials,
    pub identity: Option<Identity>,
}

impl Session {
    pub fn is_authenticated(&self) -> bool {
        self.credentials.access_token.is_some()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    LoggedIn,
    Refreshed,
    /// The session was cleared. UI layers send the user back to login.
    LoggedOut,
}

#[derive(Debug, Deserialize)]
struct RefreshResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
}

/// Owner of the credential pair and identity.
///
/// All writes go through `login`, `logout` and `refresh`, each of which
/// persists the affected fields before releasing the state lock.
pub struct SessionStore {
    state: RwLock<Session>,
    storage: Box<dyn CredentialStorage>,
    transport: Arc<dyn Transport>,
    base_url: String,
    events: broadcast::Sender<SessionEvent>,
}

impl SessionStore {
    /// Open the store, hydrating every field from `storage` before returning.
    pub fn open(
        storage: Box<dyn CredentialStorage>,
        transport: Arc<dyn Transport>,
        base_url: impl Into<String>,
    ) -> Self {
        let session = Self::hydrate(storage.as_ref());
        debug!(
            authenticated = session.is_authenticated(),
            has_identity = session.identity.is_some(),
            "Session hydrated"
        );

        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            state: RwLock::new(session),
            storage,
            transport,
            base_url: base_url.into(),
            events,
        }
    }

    fn hydrate(storage: &dyn CredentialStorage) -> Session {
        let load = |key: &str| match storage.load(key) {
            Ok(value) => value,
            Err(e) => {
                warn!(key, error = %e, "Failed to load session field");
                None
            }
        };

        let identity = load(USER_KEY).and_then(|json| match serde_json::from_str(&json) {
            Ok(identity) => Some(identity),
            Err(e) => {
                warn!(error = %e, "Ignoring unreadable stored user");
                None
            }
        });

        Session {
            credentials: Credentials {
                access_token: load(ACCESS_TOKEN_KEY),
                refresh_token: load(REFRESH_TOKEN_KEY),
            },
            identity,
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Session> {
        self.state.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, Session> {
        self.state.write().unwrap_or_else(|e| e.into_inner())
    }

    fn persist(&self, key: &str, value: Option<&str>) {
        let result = match value {
            Some(value) => self.storage.store(key, value),
            None => self.storage.remove(key),
        };
        if let Err(e) = result {
            warn!(key, error = %e, "Failed to persist session field");
        }
    }

    fn notify(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }

    /// Replace the whole session. Persistence failures are logged; the
    /// in-memory session is updated regardless.
    pub fn login(&self, access_token: String, refresh_token: String, identity: Identity) {
        let user_json = match serde_json::to_string(&identity) {
            Ok(json) => Some(json),
            Err(e) => {
                warn!(error = %e, "Failed to serialize user");
                None
            }
        };

        {
            let mut state = self.write();
            self.persist(ACCESS_TOKEN_KEY, Some(&access_token));
            self.persist(REFRESH_TOKEN_KEY, Some(&refresh_token));
            self.persist(USER_KEY, user_json.as_deref());
            info!(username = %identity.username, "Logged in");
            *state = Session {
                credentials: Credentials {
                    access_token: Some(access_token),
                    refresh_token: Some(refresh_token),
                },
                identity: Some(identity),
            };
        }
        self.notify(SessionEvent::LoggedIn);
    }

    /// Clear the session and its stored fields, then tell subscribers to
    /// return to the login entry point.
    pub fn logout(&self) {
        {
            let mut state = self.write();
            self.persist(ACCESS_TOKEN_KEY, None);
            self.persist(REFRESH_TOKEN_KEY, None);
            self.persist(USER_KEY, None);
            *state = Session::default();
        }
        info!("Logged out");
        self.notify(SessionEvent::LoggedOut);
    }

    /// Exchange the refresh token for a new access token.
    ///
    /// Only the access token changes on success. On failure nothing is
    /// mutated; deciding whether to log out is the caller's job.
    pub async fn refresh(&self) -> Result<(), ApiError> {
        let refresh_token = self.refresh_token().ok_or(ApiError::NotAuthenticated)?;

        let request = ApiRequest::post(join_url(&self.base_url, REFRESH_PATH))
            .header(AUTHORIZATION, bearer_header(&refresh_token)?);

        debug!("Refreshing access token");
        let response = self.transport.send(request).await?;
        if !response.is_success() {
            warn!(status = %response.status(), "Refresh rejected");
            return Err(ApiError::RefreshRejected(response.status()));
        }
        let body: RefreshResponse = response.json()?;

        {
            let mut state = self.write();
            // A logout or re-login while the refresh was in flight wins.
            match state.credentials.refresh_token.as_deref() {
                None => return Err(ApiError::NotAuthenticated),
                Some(current) if current != refresh_token => {
                    debug!("Session replaced during refresh, keeping the newer token");
                    return Ok(());
                }
                Some(_) => {}
            }
            self.persist(ACCESS_TOKEN_KEY, Some(&body.access_token));
            state.credentials.access_token = Some(body.access_token);
        }
        info!("Access token refreshed");
        self.notify(SessionEvent::Refreshed);
        Ok(())
    }

    pub fn is_authenticated(&self) -> bool {
        self.read().is_authenticated()
    }

    pub fn access_token(&self) -> Option<String> {
        self.read().credentials.access_token.clone()
    }

    pub fn refresh_token(&self) -> Option<String> {
        self.read().credentials.refresh_token.clone()
    }

    pub fn identity(&self) -> Option<Identity> {
        self.read().identity.clone()
    }

    /// Snapshot of the current session.
    pub fn session(&self) -> Session {
        self.read().clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    pub(crate) fn transport(&self) -> Arc<dyn Transport> {
        Arc::clone(&self.transport)
    }
}
