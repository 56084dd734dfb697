pub mod firewall;
pub mod notify;
pub mod wireless;

use async_trait::async_trait;
use thiserror::Error;

pub use firewall::HttpFirewall;
pub use notify::WebhookNotifier;
pub use wireless::HttpWirelessController;

/// Errors talking to a downstream collaborator
#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("HTTP transport error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("unexpected status {status} from {endpoint}")]
    Status { endpoint: String, status: u16 },

    #[error("could not decode response from {endpoint}: {reason}")]
    Decode { endpoint: String, reason: String },
}

/// Result type for collaborator calls
pub type UpstreamResult<T> = Result<T, UpstreamError>;

/// Where a firewall rule draws its matched hosts from, normalized at the
/// adapter boundary: either a literal address/prefix or a named group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleSource {
    Address(String),
    Group(String),
}

/// One firewall rule as reported by the packet filter
#[derive(Debug, Clone)]
pub struct FirewallRule {
    pub id: String,
    pub tracker: String,
    pub disabled: bool,
    pub source: RuleSource,
}

/// The block rules use inverted semantics: a *disabled* block rule means
/// the subject is permitted. Named here once so the double negative never
/// leaks into call sites.
pub fn rule_allows(rule: &FirewallRule) -> bool {
    rule.disabled
}

/// A named address group and its member addresses
#[derive(Debug, Clone)]
pub struct AddressGroup {
    pub name: String,
    pub members: Vec<String>,
}

/// One client as reported by the wireless controller
#[derive(Debug, Clone)]
pub struct WirelessClient {
    pub mac: String,
    pub ip: Option<String>,
    pub associated: bool,
}

/// Packet-filter rule engine contract
#[async_trait]
pub trait FirewallRules: Send + Sync {
    async fn list_rules(&self) -> UpstreamResult<Vec<FirewallRule>>;
    async fn patch_rule(&self, id: &str, disabled: bool) -> UpstreamResult<()>;
    async fn commit_pending(&self) -> UpstreamResult<()>;
    async fn list_address_groups(&self) -> UpstreamResult<Vec<AddressGroup>>;
    async fn patch_address_group(&self, id: &str, members: Vec<String>) -> UpstreamResult<()>;
}

/// Live-connection table contract. Not filterable by group; callers resolve
/// to concrete addresses first.
#[async_trait]
pub trait ConnectionTable: Send + Sync {
    async fn kill_connections(&self, address: &str) -> UpstreamResult<()>;
}

/// Wireless-client controller contract
#[async_trait]
pub trait WirelessClients: Send + Sync {
    async fn list_clients(&self) -> UpstreamResult<Vec<WirelessClient>>;
    async fn block_client(&self, mac: &str) -> UpstreamResult<()>;
    async fn unblock_client(&self, mac: &str) -> UpstreamResult<()>;
}

/// Best-effort push notification sink; implementations swallow failures.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, title: &str, body: &str);
}

pub(crate) fn ensure_success(
    endpoint: &str,
    resp: reqwest::Response,
) -> UpstreamResult<reqwest::Response> {
    let status = resp.status();
    if !status.is_success() {
        return Err(UpstreamError::Status {
            endpoint: endpoint.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(resp)
}
