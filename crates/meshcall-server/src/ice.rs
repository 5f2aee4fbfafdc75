use crate::state::AppState;
use axum::{extract::State, Json};
use meshcall_protocol::IceServersResponse;

/// STUN/TURN servers participants should gather candidates against
pub async fn get_ice_servers(State(state): State<AppState>) -> Json<IceServersResponse> {
    Json(IceServersResponse {
        ice_servers: state.config.ice_servers(),
    })
}
