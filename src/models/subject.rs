use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};

/// A managed owner of network devices whose access is controlled.
///
/// Subjects are read from the subjects file once at startup and are
/// immutable for the life of the process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subject {
    /// Stable identifier shared with the firewall rule (its tracker field)
    pub tracker: String,

    /// Display name, also the key used by the control operations
    pub name: String,

    /// Identifier of the subject's firewall block-rule
    pub rule_id: String,

    /// Identifier of an optional companion schedule-rule on the firewall
    #[serde(default)]
    pub schedule_rule_id: Option<String>,
}

/// Point-in-time view of one subject, as reported to the control surface.
#[derive(Debug, Clone, Serialize)]
pub struct SubjectState {
    pub name: String,
    pub tracker: String,

    /// Actual rule state; None when the block-rule is missing upstream
    pub blocked: Option<bool>,

    pub schedule_enabled: bool,
    pub schedule_active: bool,
    pub current_window_end: Option<DateTime<Local>>,
    pub next_window_start: Option<DateTime<Local>>,
    pub next_window_end: Option<DateTime<Local>>,

    /// When the active timed-allow expires, if one is pending
    pub timer_ends: Option<DateTime<Utc>>,

    /// When the active skip expires, if one is set
    pub skip_until: Option<DateTime<Utc>>,
}
