use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;

use crate::upstream::Notifier;
use crate::warn;

/// Push notification sink that POSTs to a configured webhook.
///
/// Strictly best-effort: when no webhook is configured this is a no-op,
/// and delivery failures are logged and swallowed.
pub struct WebhookNotifier {
    client: reqwest::Client,
    url: Option<String>,
}

impl WebhookNotifier {
    pub fn new(url: Option<String>, timeout_secs: u64) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .unwrap_or_default();
        Self { client, url }
    }
}

#[async_trait]
impl Notifier for WebhookNotifier {
    async fn notify(&self, title: &str, body: &str) {
        let url = match &self.url {
            Some(url) => url.clone(),
            None => return,
        };
        let result = self
            .client
            .post(&url)
            .json(&json!({ "title": title, "body": body }))
            .send()
            .await;
        match result {
            Ok(resp) if !resp.status().is_success() => {
                warn!("Notification webhook returned {}", resp.status());
            }
            Err(e) => {
                warn!("Notification webhook failed: {}", e);
            }
            _ => {}
        }
    }
}
