//! Session state and where it is kept between runs.
//!
//! This module provides:
//! - `SessionStore`: owner of the access/refresh token pair and the user
//! - `CredentialStorage`: durable backends for the session fields
//!   (`FileStorage`, `KeyringStorage`, `MemoryStorage`)

pub mod credentials;
pub mod session;
pub mod storage;

pub use credentials::KeyringStorage;
pub use session::{
    Credentials, Identity, Session, SessionEvent, SessionStore, ACCESS_TOKEN_KEY,
    REFRESH_TOKEN_KEY, USER_KEY,
};
pub use storage::{CredentialStorage, FileStorage, MemoryStorage};
