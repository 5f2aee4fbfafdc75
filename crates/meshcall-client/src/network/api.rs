use anyhow::Result;
use meshcall_protocol::{IceServer, IceServersResponse};
use reqwest::Url;
use serde::de::DeserializeOwned;

async fn get<T: DeserializeOwned>(url: Url) -> Result<T> {
    let response = reqwest::get(url).await?;

    if !response.status().is_success() {
        let status = response.status();
        let text = response.text().await.unwrap_or_default();
        anyhow::bail!("Request failed with status {}: {}", status, text);
    }

    Ok(response.json().await?)
}

/// Ask the relay for its STUN/TURN configuration. `relay_url` is the
/// relay's HTTP base and must end in `/`.
pub async fn fetch_ice_servers(relay_url: &Url) -> Result<Vec<IceServer>> {
    let response: IceServersResponse = get(relay_url.join("api/rtc/ice-servers")?).await?;
    Ok(response.ice_servers)
}
