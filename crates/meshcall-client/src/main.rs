use anyhow::Result;
use meshcall_client::call::Call;
use meshcall_client::media::SystemDevices;
use meshcall_client::network;
use meshcall_client::peer::RtcConnector;
use meshcall_client::state::Settings;
use meshcall_protocol::IceServer;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

const FALLBACK_STUN: &str = "stun:stun.l.google.com:19302";

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshcall=debug,meshcall_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Meshcall participant...");

    let mut settings = Settings::load()?;
    if let Some(room) = std::env::args().nth(1) {
        settings.room_id = Some(room);
    }
    let Some(room_id) = settings.room_id.clone() else {
        anyhow::bail!("No room given: pass it as the first argument or set MESHCALL_ROOM_ID");
    };

    let ice_servers = resolve_ice_servers(&settings).await;
    let connector = Arc::new(RtcConnector::new(&ice_servers)?);
    let devices = Arc::new(SystemDevices::new(
        settings.audio_available,
        settings.video_available,
    ));

    let mut call = Call::start(&settings, &room_id, connector, devices).await?;
    tracing::info!("Joined room {} as {}, Ctrl-C to leave", room_id, call.local_id());

    let result = call.run_until(tokio::signal::ctrl_c()).await;
    call.end().await;
    result?;

    Ok(())
}

async fn resolve_ice_servers(settings: &Settings) -> Vec<IceServer> {
    if !settings.ice_servers.is_empty() {
        return settings
            .ice_servers
            .iter()
            .map(IceServer::stun)
            .collect();
    }

    let fetched = match settings.relay_http_url() {
        Ok(url) => network::fetch_ice_servers(&url).await,
        Err(e) => Err(e),
    };
    match fetched {
        Ok(servers) => servers,
        Err(e) => {
            tracing::warn!("Could not fetch ICE servers from relay ({}), using {}", e, FALLBACK_STUN);
            vec![IceServer::stun(FALLBACK_STUN)]
        }
    }
}
