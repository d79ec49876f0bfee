//! Authenticated request dispatch.
//!
//! `Dispatcher::dispatch` is a drop-in replacement for sending a request
//! directly: it attaches the current access token, and when the server
//! answers `401` it refreshes the token once and replays the request once.
//!
//! Only one refresh runs at a time no matter how many requests are rejected
//! concurrently. What a rejected request does while another request's
//! refresh is running is decided by [`RefreshPolicy`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use futures::future::{BoxFuture, FutureExt, Shared, WeakShared};
use reqwest::header::{HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::transport::{bearer_header, ApiRequest, ApiResponse, Transport};
use super::ApiError;
use crate::auth::SessionStore;

/// Behavior of a request that gets `401` while a refresh started by another
/// request is still running.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RefreshPolicy {
    /// Return the original `401` immediately.
    #[default]
    ReturnStale,
    /// Wait for the running refresh; retry once if it succeeded.
    AwaitInFlight,
}

/// Resolves to `true` when the refresh produced a new access token.
type RefreshFuture = Shared<BoxFuture<'static, bool>>;

/// The refresh currently running. The slot holds it weakly: the requests
/// awaiting it keep it alive, and it is dropped once none of them remain.
struct InFlight {
    id: u64,
    refresh: WeakShared<BoxFuture<'static, bool>>,
}

type RefreshSlot = Arc<Mutex<Option<InFlight>>>;

/// Where a single dispatch is in the retry protocol. `Retried` is terminal,
/// so a request is sent at most twice.
#[derive(Debug)]
enum DispatchState {
    Direct,
    AwaitingRefresh { rejected: ApiResponse },
    Retried,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RefreshOutcome {
    Refreshed,
    Failed,
    /// Another request's refresh is running and the policy says not to wait.
    Busy,
}

/// Owned by the refresh future. Clears the in-flight marker when the refresh
/// settles, or when the future is dropped because every request awaiting it
/// was dropped. A marker left by a newer refresh is not touched.
struct InFlightGuard {
    slot: RefreshSlot,
    id: u64,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        let mut slot = lock_slot(&self.slot);
        if slot.as_ref().is_some_and(|running| running.id == self.id) {
            slot.take();
        }
    }
}

fn lock_slot(slot: &Mutex<Option<InFlight>>) -> MutexGuard<'_, Option<InFlight>> {
    slot.lock().unwrap_or_else(|e| e.into_inner())
}

/// Clone shares the session and the in-flight marker.
#[derive(Clone)]
pub struct Dispatcher {
    store: Arc<SessionStore>,
    transport: Arc<dyn Transport>,
    policy: RefreshPolicy,
    in_flight: RefreshSlot,
    next_refresh_id: Arc<AtomicU64>,
}

impl Dispatcher {
    /// Dispatch through the same transport the session store refreshes with.
    pub fn new(store: Arc<SessionStore>) -> Self {
        let transport = store.transport();
        Self {
            store,
            transport,
            policy: RefreshPolicy::default(),
            in_flight: Arc::new(Mutex::new(None)),
            next_refresh_id: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn with_policy(mut self, policy: RefreshPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn session(&self) -> &Arc<SessionStore> {
        &self.store
    }

    /// Whether a refresh is currently outstanding.
    pub fn is_refreshing(&self) -> bool {
        let running = lock_slot(&self.in_flight)
            .as_ref()
            .and_then(|running| running.refresh.upgrade());
        running.is_some()
    }

    /// Send `request` with the session's credentials.
    ///
    /// Every HTTP status is returned as `Ok`, including a `401` that could
    /// not be recovered. Transport failures are returned as `Err` and are
    /// never retried.
    pub async fn dispatch(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut state = DispatchState::Direct;
        loop {
            state = match state {
                DispatchState::Direct => {
                    let response = self.send_authorized(&request).await?;
                    if response.status() != StatusCode::UNAUTHORIZED {
                        return Ok(response);
                    }
                    debug!(method = %request.method, url = %request.url, "Request unauthorized");
                    DispatchState::AwaitingRefresh { rejected: response }
                }
                DispatchState::AwaitingRefresh { rejected } => match self.refresh().await {
                    RefreshOutcome::Refreshed => DispatchState::Retried,
                    RefreshOutcome::Failed | RefreshOutcome::Busy => return Ok(rejected),
                },
                DispatchState::Retried => {
                    debug!(method = %request.method, url = %request.url, "Retrying with refreshed token");
                    return self.send_authorized(&request).await;
                }
            };
        }
    }

    /// Attach the current access token, plus a JSON content type when there
    /// is a body. Other caller headers are left alone.
    async fn send_authorized(&self, request: &ApiRequest) -> Result<ApiResponse, ApiError> {
        let mut request = request.clone();
        if let Some(token) = self.store.access_token() {
            request.headers.insert(AUTHORIZATION, bearer_header(&token)?);
        }
        if request.body.is_some() {
            request
                .headers
                .insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        self.transport.send(request).await
    }

    /// Start a refresh, or join or skip the one already running.
    async fn refresh(&self) -> RefreshOutcome {
        // The upgraded handle leaves the block before it can be dropped, so
        // an `InFlightGuard` never runs while the slot is locked.
        let (refresh, joined) = {
            let mut slot = lock_slot(&self.in_flight);
            match slot.as_ref().and_then(|running| running.refresh.upgrade()) {
                Some(running) => (running, true),
                None => {
                    let id = self.next_refresh_id.fetch_add(1, Ordering::Relaxed);
                    let refresh = self.start_refresh(id);
                    *slot = refresh.downgrade().map(|weak| InFlight { id, refresh: weak });
                    (refresh, false)
                }
            }
        };

        if joined {
            if self.policy == RefreshPolicy::ReturnStale {
                debug!("Refresh already in progress, returning original response");
                return RefreshOutcome::Busy;
            }
            debug!("Refresh already in progress, waiting for it");
        }

        if refresh.await {
            RefreshOutcome::Refreshed
        } else {
            RefreshOutcome::Failed
        }
    }

    /// The shared refresh future. It clears the marker itself and evicts
    /// the session on failure, so this happens once however many requests
    /// await it and whichever of them are dropped.
    fn start_refresh(&self, id: u64) -> RefreshFuture {
        let store = Arc::clone(&self.store);
        let guard = InFlightGuard {
            slot: Arc::clone(&self.in_flight),
            id,
        };
        async move {
            let refreshed = match store.refresh().await {
                Ok(()) => true,
                Err(e) => {
                    warn!(error = %e, "Token refresh failed");
                    false
                }
            };
            drop(guard);
            if !refreshed {
                store.logout();
            }
            refreshed
        }
        .boxed()
        .shared()
    }
}
