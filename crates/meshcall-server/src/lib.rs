//! Meshcall signaling relay
//!
//! Tracks room membership and routes negotiation messages between
//! participants over websockets. Media never passes through the relay.

pub mod api;
pub mod error;
pub mod ice;
pub mod relay;
pub mod rooms;
pub mod state;
pub mod ws;

/// Create and configure the relay application
pub fn create_app(config: state::Config) -> axum::Router {
    let app_state = state::AppState::new(config);
    api::create_router(app_state)
}
