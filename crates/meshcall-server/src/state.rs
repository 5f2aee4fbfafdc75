use crate::relay::Relay;
use meshcall_protocol::IceServer;
use std::sync::Arc;

#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: String,
    /// Allowed browser origin; `*` allows any
    pub cors_origin: String,
    pub stun_servers: Vec<String>,
    pub turn_servers: Vec<TurnServer>,
    /// Tell remaining members when someone sends `leaveRoom`
    pub announce_leave: bool,
}

#[derive(Clone, Debug)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let bind_address =
            std::env::var("BIND_ADDRESS").unwrap_or_else(|_| "0.0.0.0:3001".to_string());

        let cors_origin =
            std::env::var("CORS_ORIGIN").unwrap_or_else(|_| "http://localhost:3000".to_string());

        let stun_servers = std::env::var("STUN_SERVERS")
            .map(|s| split_list(&s))
            .unwrap_or_else(|_| vec!["stun:stun.l.google.com:19302".to_string()]);

        let turn_servers = match std::env::var("TURN_SERVERS") {
            Ok(s) => parse_turn_servers(&s)?,
            Err(_) => vec![],
        };

        let announce_leave = match std::env::var("ANNOUNCE_LEAVE") {
            Ok(s) => s.trim().parse::<bool>().map_err(|_| {
                anyhow::anyhow!("ANNOUNCE_LEAVE must be true or false, got {:?}", s)
            })?,
            Err(_) => false,
        };

        Ok(Config {
            bind_address,
            cors_origin,
            stun_servers,
            turn_servers,
            announce_leave,
        })
    }
}

impl Config {
    /// STUN entries first, then TURN with credentials
    pub fn ice_servers(&self) -> Vec<IceServer> {
        let stun = self.stun_servers.iter().map(IceServer::stun);
        let turn = self
            .turn_servers
            .iter()
            .map(|t| IceServer::turn(&t.url, &t.username, &t.credential));
        stun.chain(turn).collect()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_address: "127.0.0.1:0".to_string(),
            cors_origin: "*".to_string(),
            stun_servers: vec![],
            turn_servers: vec![],
            announce_leave: false,
        }
    }
}

fn split_list(s: &str) -> Vec<String> {
    s.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(String::from)
        .collect()
}

/// `url|username|credential` entries, comma separated
fn parse_turn_servers(s: &str) -> anyhow::Result<Vec<TurnServer>> {
    split_list(s)
        .into_iter()
        .map(|entry| {
            let mut parts = entry.splitn(3, '|');
            match (parts.next(), parts.next(), parts.next()) {
                (Some(url), Some(username), Some(credential)) => Ok(TurnServer {
                    url: url.to_string(),
                    username: username.to_string(),
                    credential: credential.to_string(),
                }),
                _ => anyhow::bail!("Invalid TURN server entry {:?}, expected url|username|credential", entry),
            }
        })
        .collect()
}

#[derive(Clone)]
pub struct AppState {
    pub config: Config,
    pub relay: Arc<Relay>,
}

impl AppState {
    pub fn new(config: Config) -> Self {
        let relay = Arc::new(Relay::new(config.announce_leave));
        Self { config, relay }
    }
}
