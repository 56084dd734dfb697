use chrono::{DateTime, Local, Utc};

use crate::engine::{AccessEngine, EngineError, EngineResult};
use crate::info;
use crate::models::AuditAction;
use crate::schedule;

/// A time-bounded override forcing "blocked" regardless of the schedule.
pub(crate) struct Skip {
    pub until: DateTime<Utc>,
}

impl AccessEngine {
    /// Skip the current window (when inside one) or the next upcoming
    /// window. Fails with `NoUpcomingWindow` when the schedule offers
    /// nothing within the next week.
    pub async fn start_skip(&self, name: &str) -> EngineResult<DateTime<Utc>> {
        let subject = self.subject(name)?;

        let cfg = self.schedule_for(&subject.tracker).await;
        let status = schedule::evaluate(&cfg, Local::now());
        let until_local = if status.active {
            status.current_window_end
        } else {
            status.next_window_end
        };
        let until = until_local
            .ok_or_else(|| EngineError::NoUpcomingWindow(name.to_string()))?
            .with_timezone(&Utc);

        self.inner
            .skips
            .lock()
            .await
            .insert(name.to_string(), Skip { until });

        self.audit(
            name,
            AuditAction::SkipStart,
            format!("schedule window skipped until {}", until),
        )
        .await;

        // Take effect without waiting for the next periodic tick
        self.trigger_tick();
        Ok(until)
    }

    /// Remove a pending skip. Returns false when none was set.
    pub async fn cancel_skip(&self, name: &str) -> EngineResult<bool> {
        self.subject(name)?;

        let removed = self.inner.skips.lock().await.remove(name).is_some();
        if removed {
            self.audit(name, AuditAction::SkipCancel, "skip cancelled").await;
            self.trigger_tick();
        }
        Ok(removed)
    }

    /// Drop skips whose deadline has passed. Runs at the top of every
    /// reconciliation tick; expiry is passive by design.
    pub(crate) async fn prune_expired_skips(&self) {
        let now = Utc::now();
        let mut skips = self.inner.skips.lock().await;
        skips.retain(|name, skip| {
            let keep = now < skip.until;
            if !keep {
                info!("Skip for {} expired", name);
            }
            keep
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{always_schedule, rig, rule, set_schedule, subject};
    use crate::schedule::{ScheduleConfig, Window};
    use chrono::Datelike;

    #[tokio::test]
    async fn skip_inside_active_window_lasts_until_its_end() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule(
                "r1",
                "tr1",
                true,
                crate::upstream::RuleSource::Address("10.0.0.2".into()),
            )],
        )
        .await;
        set_schedule(&rig.engine, "tr1", always_schedule()).await;

        let until = rig.engine.start_skip("kid").await.unwrap();

        let status = schedule::evaluate(&always_schedule(), Local::now());
        assert!(status.active);
        assert_eq!(until, status.current_window_end.unwrap().with_timezone(&Utc));
        assert!(rig.engine.skip_active("kid").await);
    }

    #[tokio::test]
    async fn skip_outside_any_window_uses_next_window_end() {
        // Window lives on a weekday two days out, so we are never inside it
        let day_after_tomorrow =
            (Local::now().weekday().num_days_from_sunday() as u8 + 2) % 7;
        let cfg = ScheduleConfig {
            enabled: true,
            windows: vec![Window {
                days: vec![day_after_tomorrow],
                start: "08:00".into(),
                end: "17:00".into(),
            }],
        };

        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule(
                "r1",
                "tr1",
                true,
                crate::upstream::RuleSource::Address("10.0.0.2".into()),
            )],
        )
        .await;
        set_schedule(&rig.engine, "tr1", cfg.clone()).await;

        let until = rig.engine.start_skip("kid").await.unwrap();

        let status = schedule::evaluate(&cfg, Local::now());
        assert!(!status.active);
        assert_eq!(until, status.next_window_end.unwrap().with_timezone(&Utc));
    }

    #[tokio::test]
    async fn skip_without_upcoming_window_fails_and_stores_nothing() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule(
                "r1",
                "tr1",
                true,
                crate::upstream::RuleSource::Address("10.0.0.2".into()),
            )],
        )
        .await;

        // Schedule disabled entirely
        let err = rig.engine.start_skip("kid").await.unwrap_err();
        assert!(matches!(err, EngineError::NoUpcomingWindow(_)));
        assert!(rig.engine.inner.skips.lock().await.is_empty());
    }

    #[tokio::test]
    async fn cancel_skip_removes_the_record() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule(
                "r1",
                "tr1",
                true,
                crate::upstream::RuleSource::Address("10.0.0.2".into()),
            )],
        )
        .await;
        set_schedule(&rig.engine, "tr1", always_schedule()).await;

        rig.engine.start_skip("kid").await.unwrap();
        assert!(rig.engine.cancel_skip("kid").await.unwrap());
        assert!(!rig.engine.skip_active("kid").await);
        assert!(!rig.engine.cancel_skip("kid").await.unwrap());
    }

    #[tokio::test]
    async fn expired_skips_are_pruned() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule(
                "r1",
                "tr1",
                true,
                crate::upstream::RuleSource::Address("10.0.0.2".into()),
            )],
        )
        .await;

        rig.engine.inner.skips.lock().await.insert(
            "kid".to_string(),
            Skip {
                until: Utc::now() - chrono::Duration::minutes(1),
            },
        );
        assert!(!rig.engine.skip_active("kid").await);

        rig.engine.prune_expired_skips().await;
        assert!(rig.engine.inner.skips.lock().await.is_empty());
    }
}
