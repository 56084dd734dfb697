use std::collections::BTreeSet;
use std::net::IpAddr;

use crate::engine::{AccessEngine, EngineError, EngineResult};
use crate::models::Subject;
use crate::upstream::{RuleSource, WirelessClient};
use crate::utils::net::any_address_contains;
use crate::{debug, warn};

/// Apply the downstream side effects of a transition, after the rule-level
/// change has already been committed.
///
/// Never fails the caller: each downstream call is independently fallible,
/// gets logged with the subject and action, and is retried naturally by
/// later transitions. The rule-level state is authoritative either way.
pub(crate) async fn run(engine: &AccessEngine, subject: &Subject, source: &RuleSource, allowed: bool) {
    if allowed {
        to_allowed(engine, subject, source).await;
    } else {
        to_blocked(engine, subject, source).await;
    }
}

/// Resolve a rule's source specification into concrete addresses. Literal
/// addresses pass through; a named group is resolved via the firewall's
/// group table.
pub(crate) async fn resolve_addresses(
    engine: &AccessEngine,
    source: &RuleSource,
) -> EngineResult<Vec<String>> {
    match source {
        RuleSource::Address(address) => Ok(vec![address.clone()]),
        RuleSource::Group(name) => {
            let groups = engine.inner.firewall.list_address_groups().await?;
            groups
                .into_iter()
                .find(|group| &group.name == name)
                .map(|group| group.members)
                .ok_or_else(|| EngineError::GroupNotFound(name.clone()))
        }
    }
}

fn macs_at_addresses(clients: &[WirelessClient], addresses: &[String]) -> Vec<String> {
    clients
        .iter()
        .filter(|client| client.associated)
        .filter(|client| {
            client
                .ip
                .as_deref()
                .and_then(|ip| ip.parse::<IpAddr>().ok())
                .map(|ip| any_address_contains(addresses, &ip))
                .unwrap_or(false)
        })
        .map(|client| client.mac.clone())
        .collect()
}

async fn to_blocked(engine: &AccessEngine, subject: &Subject, source: &RuleSource) {
    // Disabling a permit rule does not end sessions that already exist, so
    // the live-connection table has to be flushed per address.
    let addresses = match resolve_addresses(engine, source).await {
        Ok(addresses) => addresses,
        Err(e) => {
            warn!("Could not resolve addresses for {}: {}", subject.name, e);
            Vec::new()
        }
    };
    for address in &addresses {
        if let Err(e) = engine.inner.conntrack.kill_connections(address).await {
            warn!(
                "Failed to kill connections for {} ({}): {}",
                subject.name, address, e
            );
        }
    }

    // Fold whoever is associated right now into the known set, then block
    // everything ever seen for this subject so offline devices are covered
    // pre-emptively.
    match engine.inner.wireless.list_clients().await {
        Ok(clients) => {
            let observed = macs_at_addresses(&clients, &addresses);
            engine.merge_known_devices(subject, observed).await;
        }
        Err(e) => {
            warn!("Could not list wireless clients for {}: {}", subject.name, e);
        }
    }

    let mut blocked = BTreeSet::new();
    for mac in engine.known_devices(subject).await {
        if engine.inner.options.excluded_macs.contains(&mac) {
            continue;
        }
        match engine.inner.wireless.block_client(&mac).await {
            Ok(()) => {
                blocked.insert(mac);
            }
            Err(e) => warn!("Failed to block {} for {}: {}", mac, subject.name, e),
        }
    }
    debug!("Blocked {} device(s) for {}", blocked.len(), subject.name);
    engine.replace_blocked_devices(subject, blocked).await;
}

async fn to_allowed(engine: &AccessEngine, subject: &Subject, source: &RuleSource) {
    let mut targets: BTreeSet<String> = engine.blocked_devices(subject).await;
    targets.extend(engine.known_devices(subject).await);

    if targets.is_empty() {
        // Nothing cached for this subject yet; fall back to whatever is
        // associated at its addresses right now.
        match resolve_addresses(engine, source).await {
            Ok(addresses) => match engine.inner.wireless.list_clients().await {
                Ok(clients) => targets.extend(macs_at_addresses(&clients, &addresses)),
                Err(e) => warn!(
                    "Could not list wireless clients for {}: {}",
                    subject.name, e
                ),
            },
            Err(e) => warn!("Could not resolve addresses for {}: {}", subject.name, e),
        }
    }

    for mac in &targets {
        if let Err(e) = engine.inner.wireless.unblock_client(mac).await {
            warn!("Failed to unblock {} for {}: {}", mac, subject.name, e);
        }
    }
    engine.clear_blocked_devices(subject).await;
}
