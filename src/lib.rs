//! Relay — authenticated encrypted job relay.
//!
//! Clients log in for a short-lived credential, submit an encrypted payload
//! with a delivery target, and get a job id back immediately. Relay workers
//! later decrypt the payload and POST it to the target, retrying transient
//! failures.

use std::sync::Arc;

pub mod api;
pub mod auth;
pub mod cli;
pub mod config;
pub mod delivery;
pub mod errors;
pub mod jobs;
pub mod middleware;
pub mod queue;
pub mod store;
pub mod vault;

pub use api::router;

use auth::CredentialService;
use queue::JobQueue;
use store::CredentialStore;
use vault::Keyring;

/// Shared application state passed to handlers and middleware.
pub struct AppState {
    pub credentials: CredentialService,
    pub store: Arc<dyn CredentialStore>,
    pub queue: Arc<dyn JobQueue>,
    pub keyring: Arc<Keyring>,
}
