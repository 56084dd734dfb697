use std::fmt;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// What kind of transition an audit entry records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AuditAction {
    ToggleBlock,
    ToggleAllow,
    TimedAllow,
    TimerExpired,
    TimerCancel,
    SkipStart,
    SkipCancel,
    ScheduleBlock,
    ScheduleAllow,
    ScheduleEnabled,
    ScheduleDisabled,
    ScheduleSaved,
    AllowAll,
    BlockAll,
    Block,
    Allow,
}

impl AuditAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditAction::ToggleBlock => "toggle-block",
            AuditAction::ToggleAllow => "toggle-allow",
            AuditAction::TimedAllow => "timed-allow",
            AuditAction::TimerExpired => "timer-expired",
            AuditAction::TimerCancel => "timer-cancel",
            AuditAction::SkipStart => "skip-start",
            AuditAction::SkipCancel => "skip-cancel",
            AuditAction::ScheduleBlock => "schedule-block",
            AuditAction::ScheduleAllow => "schedule-allow",
            AuditAction::ScheduleEnabled => "schedule-enabled",
            AuditAction::ScheduleDisabled => "schedule-disabled",
            AuditAction::ScheduleSaved => "schedule-saved",
            AuditAction::AllowAll => "allow-all",
            AuditAction::BlockAll => "block-all",
            AuditAction::Block => "block",
            AuditAction::Allow => "allow",
        }
    }

    /// Whether this action represents an access transition worth a push
    /// notification, as opposed to configuration churn.
    pub fn is_transition(&self) -> bool {
        !matches!(
            self,
            AuditAction::ScheduleSaved
                | AuditAction::ScheduleEnabled
                | AuditAction::ScheduleDisabled
        )
    }
}

impl fmt::Display for AuditAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One recorded state transition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditEntry {
    pub id: Uuid,
    pub at: DateTime<Utc>,
    pub subject: String,
    pub action: AuditAction,
    pub detail: String,
}

impl AuditEntry {
    pub fn new(subject: &str, action: AuditAction, detail: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            at: Utc::now(),
            subject: subject.to_string(),
            action,
            detail: detail.into(),
        }
    }
}
