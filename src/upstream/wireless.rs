use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use crate::upstream::{
    ensure_success, UpstreamError, UpstreamResult, WirelessClient, WirelessClients,
};
use crate::utils::net::normalize_mac;
use crate::warn;

/// HTTP adapter for the wireless-client controller.
pub struct HttpWirelessController {
    client: reqwest::Client,
    base: String,
    api_key: String,
}

impl HttpWirelessController {
    pub fn new(base: &str, api_key: &str, timeout_secs: u64) -> UpstreamResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            client,
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    async fn post(&self, path: &str) -> UpstreamResult<()> {
        let resp = self
            .client
            .post(self.url(path))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        ensure_success(path, resp)?;
        Ok(())
    }
}

#[async_trait]
impl WirelessClients for HttpWirelessController {
    async fn list_clients(&self) -> UpstreamResult<Vec<WirelessClient>> {
        let path = "/api/clients";
        let resp = self
            .client
            .get(self.url(path))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        let resp = ensure_success(path, resp)?;
        let body: Value = resp.json().await.map_err(|e| UpstreamError::Decode {
            endpoint: path.to_string(),
            reason: e.to_string(),
        })?;

        let items = body
            .get("data")
            .and_then(Value::as_array)
            .or_else(|| body.as_array())
            .cloned()
            .unwrap_or_default();

        let mut clients = Vec::new();
        for item in items {
            // Controller firmware is inconsistent about the MAC field name
            let raw_mac = item
                .get("mac")
                .or_else(|| item.get("macId"))
                .and_then(Value::as_str)
                .unwrap_or_default();
            let mac = match normalize_mac(raw_mac) {
                Some(mac) => mac,
                None => {
                    warn!("Skipping wireless client with bad MAC: {:?}", raw_mac);
                    continue;
                }
            };
            clients.push(WirelessClient {
                mac,
                ip: item
                    .get("ip")
                    .and_then(Value::as_str)
                    .map(str::to_string),
                associated: item
                    .get("associated")
                    .and_then(Value::as_bool)
                    .unwrap_or(false),
            });
        }
        Ok(clients)
    }

    async fn block_client(&self, mac: &str) -> UpstreamResult<()> {
        self.post(&format!("/api/clients/{}/block", mac)).await
    }

    async fn unblock_client(&self, mac: &str) -> UpstreamResult<()> {
        self.post(&format!("/api/clients/{}/unblock", mac)).await
    }
}
