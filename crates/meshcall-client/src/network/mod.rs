mod api;
mod signaling;

pub use api::fetch_ice_servers;
pub use signaling::{SignalingClient, SignalingError};
