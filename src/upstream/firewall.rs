use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::upstream::{
    ensure_success, AddressGroup, ConnectionTable, FirewallRule, FirewallRules, RuleSource,
    UpstreamError, UpstreamResult,
};
use crate::warn;

/// HTTP adapter for the packet-filtering device.
///
/// The same device owns both the rule set and the live-connection table,
/// so this adapter implements both contracts.
pub struct HttpFirewall {
    client: reqwest::Client,
    base: String,
    api_key: String,
}

impl HttpFirewall {
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

    async fn get_json(&self, path: &str) -> UpstreamResult<Value> {
        let url = self.url(path);
        let resp = self
            .client
            .get(&url)
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        let resp = ensure_success(path, resp)?;
        resp.json().await.map_err(|e| UpstreamError::Decode {
            endpoint: path.to_string(),
            reason: e.to_string(),
        })
    }
}

/// Pull the payload array out of a response that is either a bare array
/// or wrapped as {"data": [...]}.
fn payload_items(body: &Value) -> &[Value] {
    body.get("data")
        .and_then(Value::as_array)
        .or_else(|| body.as_array())
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

fn field_string(item: &Value, key: &str) -> Option<String> {
    match item.get(key)? {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn field_bool(item: &Value, key: &str) -> bool {
    match item.get(key) {
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1),
        Some(Value::String(s)) => s == "1" || s.eq_ignore_ascii_case("true"),
        _ => false,
    }
}

/// Normalize a rule's source field. The device reports it as a bare string,
/// an {"address": ...} object, or a {"group"/"alias": ...} reference. A bare
/// string that does not parse as an address or prefix is taken as a group
/// name.
pub(crate) fn parse_source(raw: Option<&Value>) -> Option<RuleSource> {
    match raw? {
        Value::String(s) => {
            let literal = s.split('/').next().unwrap_or(s);
            if literal.parse::<std::net::IpAddr>().is_ok() {
                Some(RuleSource::Address(s.clone()))
            } else {
                Some(RuleSource::Group(s.clone()))
            }
        }
        Value::Object(map) => {
            if let Some(Value::String(addr)) = map.get("address") {
                Some(RuleSource::Address(addr.clone()))
            } else if let Some(Value::String(group)) = map.get("group") {
                Some(RuleSource::Group(group.clone()))
            } else if let Some(Value::String(alias)) = map.get("alias") {
                Some(RuleSource::Group(alias.clone()))
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Normalize group membership data into a flat list of address strings.
/// Depending on firmware this arrives as an array of strings, an array of
/// {"address": ...} entries, or one space-separated string.
pub(crate) fn parse_members(raw: Option<&Value>) -> Vec<String> {
    match raw {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|item| match item {
                Value::String(s) => Some(s.clone()),
                Value::Object(map) => match map.get("address") {
                    Some(Value::String(s)) => Some(s.clone()),
                    _ => None,
                },
                _ => None,
            })
            .collect(),
        Some(Value::String(joined)) => joined
            .split_whitespace()
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl FirewallRules for HttpFirewall {
    async fn list_rules(&self) -> UpstreamResult<Vec<FirewallRule>> {
        let body = self.get_json("/api/v1/firewall/rules").await?;

        let mut rules = Vec::new();
        for item in payload_items(&body) {
            let id = match field_string(item, "id") {
                Some(id) => id,
                None => {
                    warn!("Skipping firewall rule without an id: {}", item);
                    continue;
                }
            };
            let source = match parse_source(item.get("source")) {
                Some(source) => source,
                None => {
                    warn!("Skipping firewall rule {} with unreadable source", id);
                    continue;
                }
            };
            rules.push(FirewallRule {
                tracker: field_string(item, "tracker").unwrap_or_else(|| id.clone()),
                disabled: field_bool(item, "disabled"),
                source,
                id,
            });
        }
        Ok(rules)
    }

    async fn patch_rule(&self, id: &str, disabled: bool) -> UpstreamResult<()> {
        let path = format!("/api/v1/firewall/rules/{}", id);
        let resp = self
            .client
            .patch(self.url(&path))
            .header("X-API-Key", &self.api_key)
            .json(&json!({ "disabled": disabled }))
            .send()
            .await?;
        ensure_success(&path, resp)?;
        Ok(())
    }

    async fn commit_pending(&self) -> UpstreamResult<()> {
        let path = "/api/v1/firewall/apply";
        let resp = self
            .client
            .post(self.url(path))
            .header("X-API-Key", &self.api_key)
            .send()
            .await?;
        ensure_success(path, resp)?;
        Ok(())
    }

    async fn list_address_groups(&self) -> UpstreamResult<Vec<AddressGroup>> {
        let body = self.get_json("/api/v1/firewall/aliases").await?;

        let groups = payload_items(&body)
            .iter()
            .filter_map(|item| {
                let name = field_string(item, "name")?;
                Some(AddressGroup {
                    members: parse_members(item.get("members")),
                    name,
                })
            })
            .collect();
        Ok(groups)
    }

    async fn patch_address_group(&self, id: &str, members: Vec<String>) -> UpstreamResult<()> {
        let path = format!("/api/v1/firewall/aliases/{}", id);
        let resp = self
            .client
            .put(self.url(&path))
            .header("X-API-Key", &self.api_key)
            .json(&json!({ "members": members }))
            .send()
            .await?;
        ensure_success(&path, resp)?;
        Ok(())
    }
}

#[async_trait]
impl ConnectionTable for HttpFirewall {
    async fn kill_connections(&self, address: &str) -> UpstreamResult<()> {
        let path = "/api/v1/diagnostics/kill-states";
        let resp = self
            .client
            .post(self.url(path))
            .header("X-API-Key", &self.api_key)
            .json(&json!({ "address": address }))
            .send()
            .await?;
        ensure_success(path, resp)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn source_normalization_handles_every_shape() {
        assert_eq!(
            parse_source(Some(&json!("192.168.4.20"))),
            Some(RuleSource::Address("192.168.4.20".into()))
        );
        assert_eq!(
            parse_source(Some(&json!("192.168.4.0/24"))),
            Some(RuleSource::Address("192.168.4.0/24".into()))
        );
        assert_eq!(
            parse_source(Some(&json!("kids_devices"))),
            Some(RuleSource::Group("kids_devices".into()))
        );
        assert_eq!(
            parse_source(Some(&json!({"address": "10.0.0.7"}))),
            Some(RuleSource::Address("10.0.0.7".into()))
        );
        assert_eq!(
            parse_source(Some(&json!({"group": "teens"}))),
            Some(RuleSource::Group("teens".into()))
        );
        assert_eq!(
            parse_source(Some(&json!({"alias": "teens"}))),
            Some(RuleSource::Group("teens".into()))
        );
        assert_eq!(parse_source(Some(&json!(42))), None);
        assert_eq!(parse_source(None), None);
    }

    #[test]
    fn member_normalization_handles_every_shape() {
        assert_eq!(
            parse_members(Some(&json!(["10.0.0.1", "10.0.0.2"]))),
            vec!["10.0.0.1", "10.0.0.2"]
        );
        assert_eq!(
            parse_members(Some(&json!([{"address": "10.0.0.3"}, {"port": 80}]))),
            vec!["10.0.0.3"]
        );
        assert_eq!(
            parse_members(Some(&json!("10.0.0.4 10.0.0.5"))),
            vec!["10.0.0.4", "10.0.0.5"]
        );
        assert!(parse_members(Some(&json!(17))).is_empty());
        assert!(parse_members(None).is_empty());
    }
}
