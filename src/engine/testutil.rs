//! Mock collaborators and rig helpers shared by the engine tests.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::engine::{AccessEngine, EngineOptions};
use crate::models::Subject;
use crate::schedule::{ScheduleConfig, Window};
use crate::store::MemoryStore;
use crate::upstream::{
    AddressGroup, ConnectionTable, FirewallRule, FirewallRules, Notifier, RuleSource,
    UpstreamError, UpstreamResult, WirelessClient, WirelessClients,
};

fn unavailable(endpoint: &str) -> UpstreamError {
    UpstreamError::Status {
        endpoint: endpoint.to_string(),
        status: 503,
    }
}

/// Stateful firewall mock: patches update the rule set it reports, so a
/// second reconciliation pass sees the corrected state.
pub(crate) struct MockFirewall {
    pub rules: Mutex<Vec<FirewallRule>>,
    pub groups: Vec<AddressGroup>,
    pub patches: Mutex<Vec<(String, bool)>>,
    pub commits: AtomicUsize,
    pub fail_list: AtomicBool,
}

impl MockFirewall {
    pub fn new(rules: Vec<FirewallRule>, groups: Vec<AddressGroup>) -> Self {
        Self {
            rules: Mutex::new(rules),
            groups,
            patches: Mutex::new(Vec::new()),
            commits: AtomicUsize::new(0),
            fail_list: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl FirewallRules for MockFirewall {
    async fn list_rules(&self) -> UpstreamResult<Vec<FirewallRule>> {
        if self.fail_list.load(Ordering::SeqCst) {
            return Err(unavailable("list_rules"));
        }
        Ok(self.rules.lock().unwrap().clone())
    }

    async fn patch_rule(&self, id: &str, disabled: bool) -> UpstreamResult<()> {
        self.patches.lock().unwrap().push((id.to_string(), disabled));
        let mut rules = self.rules.lock().unwrap();
        if let Some(rule) = rules.iter_mut().find(|r| r.id == id) {
            rule.disabled = disabled;
        }
        Ok(())
    }

    async fn commit_pending(&self) -> UpstreamResult<()> {
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn list_address_groups(&self) -> UpstreamResult<Vec<AddressGroup>> {
        Ok(self.groups.clone())
    }

    async fn patch_address_group(&self, _id: &str, _members: Vec<String>) -> UpstreamResult<()> {
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct MockConntrack {
    pub kills: Mutex<Vec<String>>,
}

#[async_trait]
impl ConnectionTable for MockConntrack {
    async fn kill_connections(&self, address: &str) -> UpstreamResult<()> {
        self.kills.lock().unwrap().push(address.to_string());
        Ok(())
    }
}

pub(crate) struct MockWireless {
    pub clients: Mutex<Vec<WirelessClient>>,
    pub blocked: Mutex<Vec<String>>,
    pub unblocked: Mutex<Vec<String>>,
    pub fail_macs: Mutex<HashSet<String>>,
}

impl MockWireless {
    pub fn new(clients: Vec<WirelessClient>) -> Self {
        Self {
            clients: Mutex::new(clients),
            blocked: Mutex::new(Vec::new()),
            unblocked: Mutex::new(Vec::new()),
            fail_macs: Mutex::new(HashSet::new()),
        }
    }
}

#[async_trait]
impl WirelessClients for MockWireless {
    async fn list_clients(&self) -> UpstreamResult<Vec<WirelessClient>> {
        Ok(self.clients.lock().unwrap().clone())
    }

    async fn block_client(&self, mac: &str) -> UpstreamResult<()> {
        if self.fail_macs.lock().unwrap().contains(mac) {
            return Err(unavailable("block_client"));
        }
        self.blocked.lock().unwrap().push(mac.to_string());
        Ok(())
    }

    async fn unblock_client(&self, mac: &str) -> UpstreamResult<()> {
        self.unblocked.lock().unwrap().push(mac.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn notify(&self, title: &str, body: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((title.to_string(), body.to_string()));
    }
}

pub(crate) fn subject(name: &str, tracker: &str, rule_id: &str) -> Subject {
    Subject {
        tracker: tracker.to_string(),
        name: name.to_string(),
        rule_id: rule_id.to_string(),
        schedule_rule_id: None,
    }
}

pub(crate) fn rule(id: &str, tracker: &str, disabled: bool, source: RuleSource) -> FirewallRule {
    FirewallRule {
        id: id.to_string(),
        tracker: tracker.to_string(),
        disabled,
        source,
    }
}

pub(crate) fn client(mac: &str, ip: Option<&str>, associated: bool) -> WirelessClient {
    WirelessClient {
        mac: mac.to_string(),
        ip: ip.map(str::to_string),
        associated,
    }
}

/// A schedule that is active at (almost) any instant a test can run.
pub(crate) fn always_schedule() -> ScheduleConfig {
    ScheduleConfig {
        enabled: true,
        windows: vec![Window {
            days: vec![0, 1, 2, 3, 4, 5, 6],
            start: "00:00".into(),
            end: "23:59".into(),
        }],
    }
}

/// Install a schedule directly, without the save path's fire-and-forget
/// reconciliation trigger, so tests stay deterministic about patch counts.
pub(crate) async fn set_schedule(engine: &AccessEngine, tracker: &str, cfg: ScheduleConfig) {
    engine
        .inner
        .schedules
        .write()
        .await
        .insert(tracker.to_string(), cfg);
}

pub(crate) struct RigConfig {
    pub subjects: Vec<Subject>,
    pub rules: Vec<FirewallRule>,
    pub groups: Vec<AddressGroup>,
    pub clients: Vec<WirelessClient>,
    pub options: EngineOptions,
}

pub(crate) struct TestRig {
    pub engine: AccessEngine,
    pub firewall: Arc<MockFirewall>,
    pub conntrack: Arc<MockConntrack>,
    pub wireless: Arc<MockWireless>,
    pub store: Arc<MemoryStore>,
    pub notifier: Arc<RecordingNotifier>,
}

pub(crate) async fn rig_with(cfg: RigConfig) -> TestRig {
    let firewall = Arc::new(MockFirewall::new(cfg.rules, cfg.groups));
    let conntrack = Arc::new(MockConntrack::default());
    let wireless = Arc::new(MockWireless::new(cfg.clients));
    let store = Arc::new(MemoryStore::new());
    let notifier = Arc::new(RecordingNotifier::default());

    let engine = AccessEngine::new(
        cfg.subjects,
        firewall.clone(),
        conntrack.clone(),
        wireless.clone(),
        notifier.clone(),
        store.clone(),
        cfg.options,
    )
    .await
    .expect("engine construction");

    TestRig {
        engine,
        firewall,
        conntrack,
        wireless,
        store,
        notifier,
    }
}

pub(crate) async fn rig(subjects: Vec<Subject>, rules: Vec<FirewallRule>) -> TestRig {
    rig_with(RigConfig {
        subjects,
        rules,
        groups: Vec::new(),
        clients: Vec::new(),
        options: EngineOptions::default(),
    })
    .await
}
