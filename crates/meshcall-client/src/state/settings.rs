//! Participant settings
//!
//! Built from defaults overlaid with `MESHCALL_*` environment variables,
//! e.g. `MESHCALL_SIGNALING_URL` or `MESHCALL_ICE_SERVERS=stun:a,stun:b`.

use crate::peer::IceRestartPolicy;
use config::{Config, ConfigError, Environment};
use reqwest::Url;
use serde::Deserialize;
use std::time::Duration;

const ENV_PREFIX: &str = "MESHCALL";

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    /// Relay websocket endpoint
    pub signaling_url: String,
    /// Room to join; the first CLI argument takes precedence
    #[serde(default)]
    pub room_id: Option<String>,
    /// STUN/TURN urls. Empty means ask the relay.
    #[serde(default)]
    pub ice_servers: Vec<String>,
    /// Join with zero tracks when no device can be opened
    pub continue_without_media: bool,
    /// Capture the default microphone
    pub audio_available: bool,
    /// Whether an external pipeline feeds the video track
    pub video_available: bool,
    /// ICE restarts attempted per link before giving up
    pub max_ice_restarts: u32,
    /// How long the larger id waits for the other side to restart ICE
    pub ice_restart_grace_ms: u64,
}

impl Settings {
    pub fn load() -> Result<Self, ConfigError> {
        Self::from_env(environment())
    }

    fn from_env(env: Environment) -> Result<Self, ConfigError> {
        Config::builder()
            .set_default("signaling_url", "ws://localhost:3001/ws")?
            .set_default("continue_without_media", true)?
            .set_default("audio_available", true)?
            .set_default("video_available", true)?
            .set_default("max_ice_restarts", 3)?
            .set_default("ice_restart_grace_ms", 5000)?
            .add_source(env)
            .build()?
            .try_deserialize()
    }

    pub fn ice_restart_policy(&self) -> IceRestartPolicy {
        IceRestartPolicy {
            max_attempts: self.max_ice_restarts,
            grace: Duration::from_millis(self.ice_restart_grace_ms),
        }
    }

    /// HTTP base of the relay, derived from the websocket url.
    /// A trailing `/ws` segment is dropped, as are query and fragment.
    pub fn relay_http_url(&self) -> anyhow::Result<Url> {
        let mut url = Url::parse(&self.signaling_url)?;
        let scheme = match url.scheme() {
            "wss" | "https" => "https",
            "ws" | "http" => "http",
            other => anyhow::bail!("Unsupported relay url scheme {:?}", other),
        };
        url.set_scheme(scheme)
            .map_err(|_| anyhow::anyhow!("Cannot use {} for {}", scheme, self.signaling_url))?;

        let path = url.path().trim_end_matches('/');
        let path = path.strip_suffix("/ws").unwrap_or(path);
        url.set_path(&format!("{}/", path));
        url.set_query(None);
        url.set_fragment(None);
        Ok(url)
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .try_parsing(true)
        .list_separator(",")
        .with_list_parse_key("ice_servers")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn load_with(vars: &[(&str, &str)]) -> Settings {
        let source = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Settings::from_env(environment().source(Some(source))).unwrap()
    }

    #[test]
    fn defaults_apply_without_environment() {
        let settings = load_with(&[]);
        assert_eq!(settings.signaling_url, "ws://localhost:3001/ws");
        assert_eq!(settings.room_id, None);
        assert!(settings.ice_servers.is_empty());
        assert!(settings.continue_without_media);
        assert!(settings.audio_available);
        assert!(settings.video_available);
        assert_eq!(settings.max_ice_restarts, 3);
        assert_eq!(settings.ice_restart_policy().grace, Duration::from_secs(5));
    }

    #[test]
    fn environment_overrides_defaults() {
        let settings = load_with(&[
            ("MESHCALL_ROOM_ID", "abc"),
            ("MESHCALL_CONTINUE_WITHOUT_MEDIA", "false"),
            ("MESHCALL_VIDEO_AVAILABLE", "false"),
            ("MESHCALL_MAX_ICE_RESTARTS", "1"),
            ("MESHCALL_ICE_SERVERS", "stun:a.example:3478,stun:b.example"),
        ]);
        assert_eq!(settings.room_id.as_deref(), Some("abc"));
        assert!(!settings.continue_without_media);
        assert!(!settings.video_available);
        assert_eq!(settings.max_ice_restarts, 1);
        assert_eq!(
            settings.ice_servers,
            vec!["stun:a.example:3478", "stun:b.example"]
        );
    }

    #[test]
    fn relay_http_url_follows_signaling_url() {
        let mut settings = load_with(&[]);
        assert_eq!(settings.relay_http_url().unwrap().as_str(), "http://localhost:3001/");

        settings.signaling_url = "wss://relay.example.org/ws".to_string();
        assert_eq!(settings.relay_http_url().unwrap().as_str(), "https://relay.example.org/");

        settings.signaling_url = "wss://relay.example.org/call/ws/?token=abc".to_string();
        assert_eq!(
            settings.relay_http_url().unwrap().as_str(),
            "https://relay.example.org/call/"
        );

        settings.signaling_url = "not a url".to_string();
        assert!(settings.relay_http_url().is_err());
        settings.signaling_url = "ftp://relay.example.org/ws".to_string();
        assert!(settings.relay_http_url().is_err());
    }
}
