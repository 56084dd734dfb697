use chrono::{DateTime, Local, Utc};
use tokio::task::JoinHandle;

use crate::engine::{AccessEngine, EngineError, EngineResult};
use crate::models::AuditAction;
use crate::schedule;
use crate::{error, info};

pub const MIN_TIMED_ALLOW_MINUTES: i64 = 1;
pub const MAX_TIMED_ALLOW_MINUTES: i64 = 120;

/// A pending deferred re-block. The handle aborts the deferred task, which
/// is how a timer is cancelled or superseded before it fires.
pub(crate) struct PendingTimer {
    pub fires_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

impl PendingTimer {
    pub(crate) fn cancel(self) {
        self.handle.abort();
    }
}

impl AccessEngine {
    /// Allow a subject for the given number of minutes, then re-block.
    ///
    /// Any existing timer for the subject is superseded before the new
    /// deferred action is scheduled, so at most one re-block is ever in
    /// flight per subject.
    pub async fn start_timed_allow(&self, name: &str, minutes: i64) -> EngineResult<DateTime<Utc>> {
        if !(MIN_TIMED_ALLOW_MINUTES..=MAX_TIMED_ALLOW_MINUTES).contains(&minutes) {
            return Err(EngineError::Validation(format!(
                "minutes must be between {} and {}, got {}",
                MIN_TIMED_ALLOW_MINUTES, MAX_TIMED_ALLOW_MINUTES, minutes
            )));
        }
        let subject = self.subject(name)?;
        let fires_at = Utc::now() + chrono::Duration::minutes(minutes);

        {
            let mut timers = self.inner.timers.lock().await;
            if let Some(old) = timers.remove(name) {
                info!("Replacing pending timer for {}", name);
                old.cancel();
            }
            let engine = self.clone();
            let task_subject = name.to_string();
            let handle = tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_secs((minutes * 60) as u64)).await;
                engine.fire_timer(&task_subject).await;
            });
            timers.insert(
                name.to_string(),
                PendingTimer { fires_at, handle },
            );
        }

        // One-shot allow, independent of the reconciliation loop. The loop
        // already sees the timer record and keeps its hands off the subject.
        if let Err(e) = self.drive(&subject, true, AuditAction::TimedAllow).await {
            // The grant never took effect; pull the deferred re-block back out
            let mut timers = self.inner.timers.lock().await;
            if let Some(timer) = timers.remove(name) {
                timer.cancel();
            }
            return Err(e);
        }

        info!("{} allowed until {}", name, fires_at);
        Ok(fires_at)
    }

    /// Cancel a pending timed-allow and immediately settle the subject to
    /// its non-timer desired state. Returns false when no timer was pending.
    pub async fn cancel_timer(&self, name: &str) -> EngineResult<bool> {
        let subject = self.subject(name)?;

        let removed = self.inner.timers.lock().await.remove(name);
        let timer = match removed {
            Some(timer) => timer,
            None => return Ok(false),
        };
        let fires_at = timer.fires_at;
        timer.cancel();

        self.audit(
            name,
            AuditAction::TimerCancel,
            format!("pending re-block at {} cancelled", fires_at),
        )
        .await;

        self.settle_after_timer(&subject, AuditAction::Block).await;
        Ok(true)
    }

    /// Deferred re-block landing point. Removes its own record first so a
    /// re-entrant reconciliation tick sees no active timer.
    pub(crate) async fn fire_timer(&self, name: &str) {
        if self.inner.timers.lock().await.remove(name).is_none() {
            // Superseded or cancelled while we were waking up
            return;
        }
        info!("Timed allow for {} expired", name);

        let subject = match self.subject(name) {
            Ok(subject) => subject,
            Err(_) => return,
        };
        self.settle_after_timer(&subject, AuditAction::TimerExpired).await;
    }

    /// Shared landing path for timer expiry and cancellation: re-block
    /// unless the subject sits inside an active, non-skipped window (the
    /// schedule has already taken over in that case).
    async fn settle_after_timer(&self, subject: &crate::models::Subject, action: AuditAction) {
        let cfg = self.schedule_for(&subject.tracker).await;
        let status = schedule::evaluate(&cfg, Local::now());
        if status.active && !self.skip_active(&subject.name).await {
            info!(
                "{} is inside an active schedule window, leaving allowed",
                subject.name
            );
            return;
        }
        if let Err(e) = self.drive(subject, false, action).await {
            error!("Failed to re-block {} after timer: {}", subject.name, e);
        }
    }
}
