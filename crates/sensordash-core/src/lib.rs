//! Core library for sensordash.
//!
//! Holds the session (tokens and user), persists it between runs, and sends
//! API requests with transparent access-token refresh.

pub mod api;
pub mod auth;
pub mod config;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, Dispatcher, RefreshPolicy};
pub use auth::{Identity, SessionEvent, SessionStore};
pub use config::Config;
