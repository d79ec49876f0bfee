//! In-process `Transport` for tests.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use reqwest::StatusCode;

use super::transport::{ApiRequest, ApiResponse, Transport};
use super::ApiError;

type Handler = dyn Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync;

/// Records every request and answers it with `handler`.
///
/// Each send yields to the scheduler once before answering, so dispatches
/// joined on one task interleave the way concurrent requests do.
pub(crate) struct MockTransport {
    handler: Box<Handler>,
    requests: Mutex<Vec<ApiRequest>>,
    stalled_path: Option<String>,
}

impl MockTransport {
    pub(crate) fn new(
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            stalled_path: None,
        })
    }

    /// Like `new`, but requests to `path` never complete.
    pub(crate) fn stalling(
        path: &str,
        handler: impl Fn(&ApiRequest) -> Result<ApiResponse, ApiError> + Send + Sync + 'static,
    ) -> Arc<Self> {
        Arc::new(Self {
            handler: Box::new(handler),
            requests: Mutex::new(Vec::new()),
            stalled_path: Some(path.to_string()),
        })
    }

    pub(crate) fn requests(&self) -> Vec<ApiRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// Number of requests whose URL ends with `path`.
    pub(crate) fn count(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.url.ends_with(path))
            .count()
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
        self.requests.lock().unwrap().push(request.clone());
        tokio::task::yield_now().await;
        if let Some(path) = &self.stalled_path {
            if request.url.ends_with(path.as_str()) {
                futures::future::pending::<()>().await;
            }
        }
        (self.handler)(&request)
    }
}

pub(crate) fn json_response(status: u16, body: serde_json::Value) -> Result<ApiResponse, ApiError> {
    let status = StatusCode::from_u16(status).expect("valid status code");
    Ok(ApiResponse::new(status, body.to_string()))
}
