//! `VoiceChat` Relay
//!
//! Signaling relay for peer voice sessions: channel membership, peer
//! listing and store-and-forward delivery of handshake payloads. Clients
//! poll it; nothing is pushed.

pub mod config;
pub mod error;
mod handlers;
pub mod state;

use std::sync::Arc;

use axum::{routing::get, Router};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use config::RelayConfig;
pub use error::RelayServerError;
pub use state::RelayState;

/// Build the relay router.
///
/// The relay answers on `/`; other methods get 405 and CORS preflights are
/// answered for any origin.
pub fn create_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(handlers::get_action).post(handlers::post_action))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
