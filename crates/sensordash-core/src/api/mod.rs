//! REST API access for the monitoring backend.
//!
//! `Dispatcher` sends requests with the session's bearer token and handles
//! refresh-and-retry on `401`. `ApiClient` builds the auth endpoints and
//! typed JSON helpers on top of it.

pub mod client;
pub mod dispatcher;
pub mod error;
pub mod transport;

#[cfg(test)]
pub(crate) mod mock;

pub use client::{ApiClient, NewAccount};
pub use dispatcher::{Dispatcher, RefreshPolicy};
pub use error::ApiError;
pub use reqwest::{Method, StatusCode};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Transport};
