//! API client for the monitoring backend.
//!
//! This module provides the `ApiClient` struct for logging in, registering,
//! managing the account, and making authenticated JSON requests against
//! resource paths.

use std::sync::Arc;

use anyhow::{Context, Result};
use reqwest::Method;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::{debug, info};

use super::transport::{join_url, ApiRequest, ApiResponse, HttpTransport, Transport};
use super::{ApiError, Dispatcher};
use crate::auth::{Identity, SessionStore};
use crate::config::Config;

#[derive(Debug, Serialize)]
struct LoginRequest<'a> {
    username: &'a str,
    password: &'a str,
}

#[derive(Debug, Deserialize)]
struct LoginResponse {
    #[serde(rename = "accessToken")]
    access_token: String,
    #[serde(rename = "refreshToken")]
    refresh_token: String,
    user: Identity,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ChangePasswordRequest<'a> {
    current_password: &'a str,
    new_password: &'a str,
}

/// Registration form. Every field is required.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NewAccount {
    pub username: String,
    pub password: String,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
}

impl NewAccount {
    /// Names of fields left blank.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        [
            ("username", &self.username),
            ("password", &self.password),
            ("first name", &self.first_name),
            ("last name", &self.last_name),
            ("email", &self.email),
        ]
        .into_iter()
        .filter(|(_, value)| value.trim().is_empty())
        .map(|(name, _)| name)
        .collect()
    }
}

/// Clone is cheap - the session, transport and refresh marker are shared.
#[derive(Clone)]
pub struct ApiClient {
    base_url: String,
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
}

impl ApiClient {
    pub fn new(dispatcher: Dispatcher) -> Self {
        let store = dispatcher.session();
        Self {
            base_url: store.base_url().to_string(),
            transport: store.transport(),
            dispatcher,
        }
    }

    /// Build the whole stack from configuration: HTTP transport, session
    /// storage, session store and dispatcher.
    pub fn from_config(config: &Config, api_url: &str) -> Result<Self> {
        let transport = HttpTransport::new(config.request_timeout())
            .context("Failed to build HTTP client")?;
        let storage = config.open_storage(api_url)?;
        let store = SessionStore::open(storage, Arc::new(transport), api_url);
        let dispatcher = Dispatcher::new(Arc::new(store)).with_policy(config.refresh_policy);
        Ok(Self::new(dispatcher))
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        self.dispatcher.session()
    }

    pub fn url(&self, path: &str) -> String {
        join_url(&self.base_url, path)
    }

    // ===== Account =====

    /// Log in and start a session. Sent without credentials, so a stale
    /// token never triggers a refresh here.
    pub async fn login(&self, username: &str, password: &str) -> Result<Identity> {
        let request = ApiRequest::post(self.url("/login"))
            .json(&LoginRequest { username, password })?;

        let response = self
            .transport
            .send(request)
            .await
            .context("Failed to send login request")?
            .error_for_status()?;

        let login: LoginResponse = response.json().context("Failed to parse login response")?;
        let identity = login.user.clone();
        self.session()
            .login(login.access_token, login.refresh_token, login.user);
        Ok(identity)
    }

    /// Create an account. Returns the server's confirmation message.
    pub async fn register(&self, account: &NewAccount) -> Result<String> {
        let missing = account.missing_fields();
        if !missing.is_empty() {
            anyhow::bail!("Missing required fields: {}", missing.join(", "));
        }

        let request = ApiRequest::post(self.url("/register")).json(account)?;
        let response = self
            .transport
            .send(request)
            .await
            .context("Failed to send registration request")?
            .error_for_status()?;

        info!(username = %account.username, "Account registered");
        Ok(response
            .message()
            .unwrap_or_else(|| "User created successfully".to_string()))
    }

    /// Fetch the logged-in user's profile.
    pub async fn profile(&self) -> Result<Identity> {
        self.get_json("/profile").await
    }

    /// Change the password, then end the session so the new password is
    /// used for the next login.
    pub async fn change_password(&self, current_password: &str, new_password: &str) -> Result<String> {
        if current_password.is_empty() || new_password.is_empty() {
            anyhow::bail!("Current password and new password are required");
        }

        let body = ChangePasswordRequest {
            current_password,
            new_password,
        };
        let request = ApiRequest::patch(self.url("/change_password")).json(&body)?;
        let response = self.dispatch_checked(request).await?;

        self.session().logout();
        Ok(response
            .message()
            .unwrap_or_else(|| "Password updated successfully".to_string()))
    }

    pub fn logout(&self) {
        self.session().logout();
    }

    // ===== Resources =====

    /// Send an arbitrary request through the dispatcher. HTTP error statuses
    /// come back as responses.
    pub async fn request(&self, method: Method, path: &str, body: Option<Vec<u8>>) -> Result<ApiResponse, ApiError> {
        let mut request = ApiRequest::new(method, self.url(path));
        if let Some(body) = body {
            request = request.body(body);
        }
        self.dispatcher.dispatch(request).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.dispatch_checked(ApiRequest::get(self.url(path))).await?;
        response
            .json()
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }

    pub async fn send_json<T: DeserializeOwned, B: Serialize + ?Sized>(
        &self,
        method: Method,
        path: &str,
        body: &B,
    ) -> Result<T> {
        let request = ApiRequest::new(method, self.url(path)).json(body)?;
        let response = self.dispatch_checked(request).await?;
        response
            .json()
            .with_context(|| format!("Failed to parse JSON response from {}", path))
    }

    pub async fn delete(&self, path: &str) -> Result<()> {
        self.dispatch_checked(ApiRequest::delete(self.url(path))).await?;
        Ok(())
    }

    async fn dispatch_checked(&self, request: ApiRequest) -> Result<ApiResponse> {
        let url = request.url.clone();
        let method = request.method.clone();
        let response = self
            .dispatcher
            .dispatch(request)
            .await
            .with_context(|| format!("Failed to send {} request to {}", method, url))?;
        debug!(%method, %url, status = %response.status(), "Response received");
        Ok(response.error_for_status()?)
    }
}
