pub mod effects;
pub mod reconcile;
pub mod resolver;
mod skips;
mod timers;

#[cfg(test)]
pub(crate) mod testutil;

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::sync::Arc;

use chrono::Local;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{Mutex, RwLock};

use crate::models::{AuditAction, AuditEntry, Subject, SubjectState};
use crate::schedule::{self, ScheduleConfig, ScheduleError};
use crate::store::{keys, Store, StoreError};
use crate::upstream::{
    rule_allows, ConnectionTable, FirewallRule, FirewallRules, Notifier, UpstreamError,
    WirelessClients,
};
use crate::utils::net::normalize_mac;
use crate::{error, info, warn};

use skips::Skip;
use timers::PendingTimer;

pub use timers::{MAX_TIMED_ALLOW_MINUTES, MIN_TIMED_ALLOW_MINUTES};

/// Engine operation errors
#[derive(Error, Debug)]
pub enum EngineError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown subject: {0}")]
    UnknownSubject(String),

    #[error("no upcoming schedule window for {0}")]
    NoUpcomingWindow(String),

    #[error("no firewall rule found for {0}")]
    RuleMissing(String),

    #[error("address group {0} not found")]
    GroupNotFound(String),

    #[error(transparent)]
    Schedule(#[from] ScheduleError),

    #[error(transparent)]
    Upstream(#[from] UpstreamError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for engine operations
pub type EngineResult<T> = Result<T, EngineError>;

/// Tunables that do not change while the process runs
pub struct EngineOptions {
    /// Device identifiers never to block, normalized MAC form
    pub excluded_macs: HashSet<String>,

    /// Maximum audit entries kept, newest first
    pub audit_cap: usize,

    /// Whether transitions also emit a push notification
    pub notify_transitions: bool,
}

impl Default for EngineOptions {
    fn default() -> Self {
        Self {
            excluded_macs: HashSet::new(),
            audit_cap: 500,
            notify_transitions: true,
        }
    }
}

/// Durable per-subject device identifier caches, keyed by tracker
#[derive(Default)]
struct DeviceCache {
    known: HashMap<String, BTreeSet<String>>,
    blocked: HashMap<String, BTreeSet<String>>,
}

/// The access reconciliation engine.
///
/// Owns all transient authority state (timers, skips) and the durable
/// device caches, and drives the downstream collaborators toward whatever
/// the resolver says each subject's state should be. Cheap to clone; all
/// clones share the same state.
pub struct AccessEngine {
    pub(crate) inner: Arc<EngineInner>,
}

impl Clone for AccessEngine {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

pub(crate) struct EngineInner {
    pub(crate) subjects: Vec<Subject>,
    pub(crate) firewall: Arc<dyn FirewallRules>,
    pub(crate) conntrack: Arc<dyn ConnectionTable>,
    pub(crate) wireless: Arc<dyn WirelessClients>,
    pub(crate) notifier: Arc<dyn Notifier>,
    pub(crate) store: Arc<dyn Store>,
    pub(crate) options: EngineOptions,

    pub(crate) schedules: RwLock<HashMap<String, ScheduleConfig>>,
    pub(crate) timers: Mutex<HashMap<String, PendingTimer>>,
    pub(crate) skips: Mutex<HashMap<String, Skip>>,
    devices: Mutex<DeviceCache>,
    audit: Mutex<VecDeque<AuditEntry>>,
}

async fn load_doc<T: DeserializeOwned>(store: &dyn Store, key: &str) -> EngineResult<Option<T>> {
    match store.load(key).await? {
        Some(value) => {
            let parsed = serde_json::from_value(value).map_err(StoreError::Corrupt)?;
            Ok(Some(parsed))
        }
        None => Ok(None),
    }
}

pub(crate) fn find_rule<'a>(rules: &'a [FirewallRule], subject: &Subject) -> Option<&'a FirewallRule> {
    rules
        .iter()
        .find(|rule| rule.tracker == subject.tracker)
        .or_else(|| rules.iter().find(|rule| rule.id == subject.rule_id))
}

impl AccessEngine {
    /// Build the engine, loading schedules, device caches and the audit
    /// trail from the durable store.
    pub async fn new(
        subjects: Vec<Subject>,
        firewall: Arc<dyn FirewallRules>,
        conntrack: Arc<dyn ConnectionTable>,
        wireless: Arc<dyn WirelessClients>,
        notifier: Arc<dyn Notifier>,
        store: Arc<dyn Store>,
        mut options: EngineOptions,
    ) -> EngineResult<Self> {
        let schedules: HashMap<String, ScheduleConfig> =
            load_doc(store.as_ref(), keys::SCHEDULES).await?.unwrap_or_default();
        let known: HashMap<String, BTreeSet<String>> =
            load_doc(store.as_ref(), keys::KNOWN_DEVICES).await?.unwrap_or_default();
        let blocked: HashMap<String, BTreeSet<String>> =
            load_doc(store.as_ref(), keys::BLOCKED_DEVICES).await?.unwrap_or_default();
        let audit: VecDeque<AuditEntry> =
            load_doc(store.as_ref(), keys::AUDIT).await?.unwrap_or_default();

        options.excluded_macs = options
            .excluded_macs
            .iter()
            .filter_map(|mac| normalize_mac(mac))
            .collect();

        info!(
            "Engine initialized: {} subjects, {} schedules, {} audit entries",
            subjects.len(),
            schedules.len(),
            audit.len()
        );

        Ok(Self {
            inner: Arc::new(EngineInner {
                subjects,
                firewall,
                conntrack,
                wireless,
                notifier,
                store,
                options,
                schedules: RwLock::new(schedules),
                timers: Mutex::new(HashMap::new()),
                skips: Mutex::new(HashMap::new()),
                devices: Mutex::new(DeviceCache { known, blocked }),
                audit: Mutex::new(audit),
            }),
        })
    }

    pub fn subjects(&self) -> &[Subject] {
        &self.inner.subjects
    }

    pub(crate) fn subject(&self, name: &str) -> EngineResult<Subject> {
        self.inner
            .subjects
            .iter()
            .find(|s| s.name == name)
            .cloned()
            .ok_or_else(|| EngineError::UnknownSubject(name.to_string()))
    }

    pub(crate) async fn schedule_for(&self, tracker: &str) -> ScheduleConfig {
        self.inner
            .schedules
            .read()
            .await
            .get(tracker)
            .cloned()
            .unwrap_or_default()
    }

    pub(crate) async fn timer_active(&self, name: &str) -> bool {
        self.inner.timers.lock().await.contains_key(name)
    }

    pub(crate) async fn skip_active(&self, name: &str) -> bool {
        match self.inner.skips.lock().await.get(name) {
            Some(skip) => chrono::Utc::now() < skip.until,
            None => false,
        }
    }

    /// Point-in-time view of every subject, against a fresh rule fetch.
    pub async fn subject_states(&self) -> EngineResult<Vec<SubjectState>> {
        let rules = self.inner.firewall.list_rules().await?;
        let now = Local::now();

        let mut states = Vec::with_capacity(self.inner.subjects.len());
        for subject in &self.inner.subjects {
            let cfg = self.schedule_for(&subject.tracker).await;
            let status = schedule::evaluate(&cfg, now);
            let rule = find_rule(&rules, subject);

            let timer_ends = self
                .inner
                .timers
                .lock()
                .await
                .get(&subject.name)
                .map(|t| t.fires_at);
            let skip_until = self
                .inner
                .skips
                .lock()
                .await
                .get(&subject.name)
                .filter(|s| chrono::Utc::now() < s.until)
                .map(|s| s.until);

            states.push(SubjectState {
                name: subject.name.clone(),
                tracker: subject.tracker.clone(),
                blocked: rule.map(|r| !rule_allows(r)),
                schedule_enabled: cfg.enabled,
                schedule_active: status.active,
                current_window_end: status.current_window_end,
                next_window_start: status.next_window_start,
                next_window_end: status.next_window_end,
                timer_ends,
                skip_until,
            });
        }
        Ok(states)
    }

    /// Flip a subject's actual rule state, whatever the schedule says.
    /// Returns the new blocked value.
    pub async fn toggle_manual(&self, name: &str) -> EngineResult<bool> {
        let subject = self.subject(name)?;
        let rules = self.inner.firewall.list_rules().await?;
        let rule = find_rule(&rules, &subject)
            .cloned()
            .ok_or_else(|| EngineError::RuleMissing(subject.name.clone()))?;

        let make_allowed = !rule_allows(&rule);
        let action = if make_allowed {
            AuditAction::ToggleAllow
        } else {
            AuditAction::ToggleBlock
        };
        self.drive_with_rule(&subject, &rule, make_allowed, action).await?;
        Ok(!make_allowed)
    }

    /// Enable or disable a subject's schedule. Returns the new flag.
    pub async fn toggle_schedule_enabled(&self, name: &str) -> EngineResult<bool> {
        let subject = self.subject(name)?;

        let enabled = {
            let mut schedules = self.inner.schedules.write().await;
            let cfg = schedules.entry(subject.tracker.clone()).or_default();
            cfg.enabled = !cfg.enabled;
            cfg.enabled
        };
        self.persist_schedules().await?;

        let action = if enabled {
            AuditAction::ScheduleEnabled
        } else {
            AuditAction::ScheduleDisabled
        };
        self.audit(name, action, format!("schedule enabled={}", enabled)).await;

        self.trigger_tick();
        Ok(enabled)
    }

    /// Validate and replace the whole schedule map, keyed by tracker.
    pub async fn save_schedules(
        &self,
        map: HashMap<String, ScheduleConfig>,
    ) -> EngineResult<()> {
        for (tracker, cfg) in &map {
            if !self.inner.subjects.iter().any(|s| &s.tracker == tracker) {
                return Err(EngineError::UnknownSubject(tracker.clone()));
            }
            schedule::validate(cfg)?;
        }

        {
            let mut schedules = self.inner.schedules.write().await;
            *schedules = map;
        }
        self.persist_schedules().await?;

        self.audit("all", AuditAction::ScheduleSaved, "schedule configuration saved")
            .await;
        self.trigger_tick();
        Ok(())
    }

    /// Force every subject to allowed.
    pub async fn allow_all(&self) -> EngineResult<()> {
        self.set_all(true, AuditAction::AllowAll).await
    }

    /// Force every subject to blocked.
    pub async fn block_all(&self) -> EngineResult<()> {
        self.set_all(false, AuditAction::BlockAll).await
    }

    async fn set_all(&self, allowed: bool, action: AuditAction) -> EngineResult<()> {
        let rules = self.inner.firewall.list_rules().await?;

        let mut driven: Vec<(Subject, FirewallRule)> = Vec::new();
        for subject in &self.inner.subjects {
            let rule = match find_rule(&rules, subject) {
                Some(rule) => rule.clone(),
                None => {
                    warn!("No firewall rule for {}, skipping", subject.name);
                    continue;
                }
            };
            match self.inner.firewall.patch_rule(&rule.id, allowed).await {
                Ok(()) => driven.push((subject.clone(), rule)),
                Err(e) => error!("Failed to patch rule for {}: {}", subject.name, e),
            }
        }

        if driven.is_empty() {
            return Ok(());
        }
        self.inner.firewall.commit_pending().await?;

        for (subject, rule) in &driven {
            effects::run(self, subject, &rule.source, allowed).await;
            self.audit(
                &subject.name,
                action,
                format!("forced {}", if allowed { "allowed" } else { "blocked" }),
            )
            .await;
        }
        Ok(())
    }

    /// Full one-shot transition: fetch the rule fresh, then patch, commit,
    /// side effects and audit. Used by the timer subsystem where no fetch
    /// is already in hand.
    pub(crate) async fn drive(
        &self,
        subject: &Subject,
        allowed: bool,
        action: AuditAction,
    ) -> EngineResult<()> {
        let rules = self.inner.firewall.list_rules().await?;
        let rule = find_rule(&rules, subject)
            .cloned()
            .ok_or_else(|| EngineError::RuleMissing(subject.name.clone()))?;
        self.drive_with_rule(subject, &rule, allowed, action).await
    }

    pub(crate) async fn drive_with_rule(
        &self,
        subject: &Subject,
        rule: &FirewallRule,
        allowed: bool,
        action: AuditAction,
    ) -> EngineResult<()> {
        self.inner.firewall.patch_rule(&rule.id, allowed).await?;
        self.inner.firewall.commit_pending().await?;

        effects::run(self, subject, &rule.source, allowed).await;

        self.audit(
            &subject.name,
            action,
            format!("now {}", if allowed { "allowed" } else { "blocked" }),
        )
        .await;
        Ok(())
    }

    async fn persist_schedules(&self) -> EngineResult<()> {
        let snapshot = self.inner.schedules.read().await.clone();
        self.save_doc(keys::SCHEDULES, &snapshot).await
    }

    async fn save_doc<T: Serialize>(&self, key: &str, value: &T) -> EngineResult<()> {
        let value = serde_json::to_value(value).map_err(StoreError::Corrupt)?;
        self.inner.store.save(key, value).await?;
        Ok(())
    }

    /// Record a transition in the bounded audit trail and optionally push
    /// a notification. Persistence failures are logged, never escalated.
    pub(crate) async fn audit(&self, subject: &str, action: AuditAction, detail: impl Into<String>) {
        let entry = AuditEntry::new(subject, action, detail);
        info!("[audit] {} {}: {}", entry.subject, entry.action, entry.detail);

        let snapshot = {
            let mut audit = self.inner.audit.lock().await;
            audit.push_front(entry.clone());
            audit.truncate(self.inner.options.audit_cap);
            audit.clone()
        };
        if let Err(e) = self.save_doc(keys::AUDIT, &snapshot).await {
            error!("Failed to persist audit trail: {}", e);
        }

        if self.inner.options.notify_transitions && action.is_transition() {
            self.inner
                .notifier
                .notify(
                    &format!("curfew: {}", entry.subject),
                    &format!("{}: {}", entry.action, entry.detail),
                )
                .await;
        }
    }

    /// Audit trail, newest first.
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.inner.audit.lock().await.iter().cloned().collect()
    }

    /// All device identifiers ever observed for the subject.
    pub async fn known_devices(&self, subject: &Subject) -> BTreeSet<String> {
        self.inner
            .devices
            .lock()
            .await
            .known
            .get(&subject.tracker)
            .cloned()
            .unwrap_or_default()
    }

    /// Device identifiers currently believed blocked on the controller.
    pub async fn blocked_devices(&self, subject: &Subject) -> BTreeSet<String> {
        self.inner
            .devices
            .lock()
            .await
            .blocked
            .get(&subject.tracker)
            .cloned()
            .unwrap_or_default()
    }

    /// Fold newly observed identifiers into the subject's known set. The
    /// set only ever grows; the exclusion list is the single way out.
    pub(crate) async fn merge_known_devices<I>(&self, subject: &Subject, macs: I)
    where
        I: IntoIterator<Item = String>,
    {
        let additions: Vec<String> = macs
            .into_iter()
            .filter_map(|mac| normalize_mac(&mac))
            .filter(|mac| !self.inner.options.excluded_macs.contains(mac))
            .collect();
        if additions.is_empty() {
            return;
        }

        let snapshot = {
            let mut devices = self.inner.devices.lock().await;
            let known = devices.known.entry(subject.tracker.clone()).or_default();
            let before = known.len();
            known.extend(additions);
            if known.len() == before {
                return;
            }
            devices.known.clone()
        };
        if let Err(e) = self.save_doc(keys::KNOWN_DEVICES, &snapshot).await {
            error!("Failed to persist known devices: {}", e);
        }
    }

    pub(crate) async fn replace_blocked_devices(&self, subject: &Subject, set: BTreeSet<String>) {
        let snapshot = {
            let mut devices = self.inner.devices.lock().await;
            devices.blocked.insert(subject.tracker.clone(), set);
            devices.blocked.clone()
        };
        if let Err(e) = self.save_doc(keys::BLOCKED_DEVICES, &snapshot).await {
            error!("Failed to persist blocked devices: {}", e);
        }
    }

    pub(crate) async fn clear_blocked_devices(&self, subject: &Subject) {
        self.replace_blocked_devices(subject, BTreeSet::new()).await;
    }

    /// Fire-and-forget reconciliation pass, used after every state change
    /// so the effect lands without waiting for the next periodic tick.
    pub fn trigger_tick(&self) {
        let engine = self.clone();
        tokio::spawn(async move {
            if let Err(e) = engine.run_tick().await {
                error!("Triggered reconciliation pass failed: {}", e);
            }
        });
    }
}
