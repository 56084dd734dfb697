use std::time::Duration;

use chrono::Local;
use tokio::task::JoinHandle;

use crate::engine::resolver::{self, Desired};
use crate::engine::{effects, find_rule, AccessEngine, EngineResult};
use crate::models::{AuditAction, Subject};
use crate::schedule;
use crate::upstream::{rule_allows, FirewallRule};
use crate::{debug, error, info, warn};

/// Default period of the reconciliation worker
pub const DEFAULT_TICK_SECS: u64 = 15;

impl AccessEngine {
    /// One reconciliation pass: compare every subject's desired state with
    /// the actual rule state and correct the differences. Idempotent and
    /// safe to call on demand; overlapping passes tolerate each other
    /// because every correction is computed from a fresh fetch and every
    /// downstream action is idempotent.
    ///
    /// Returns the number of corrections applied.
    pub async fn run_tick(&self) -> EngineResult<usize> {
        self.prune_expired_skips().await;

        // One shared fetch per tick. If it fails we abort outright rather
        // than act on partial or unknown actual state.
        let rules = match self.inner.firewall.list_rules().await {
            Ok(rules) => rules,
            Err(e) => {
                error!("Skipping reconciliation tick, rule fetch failed: {}", e);
                return Err(e.into());
            }
        };

        let now = Local::now();
        let mut corrections: Vec<(Subject, FirewallRule, bool)> = Vec::new();

        for subject in self.subjects() {
            // A live timer owns its subject outright
            if self.timer_active(&subject.name).await {
                debug!("{} has an active timer, leaving alone", subject.name);
                continue;
            }

            // A disabled schedule asserts nothing; the subject stays in
            // whatever state it was last driven to
            let cfg = self.schedule_for(&subject.tracker).await;
            if !cfg.enabled {
                continue;
            }

            let status = schedule::evaluate(&cfg, now);
            let skip = self.skip_active(&subject.name).await;

            let desired_allowed = match resolver::resolve(false, skip, &status) {
                Desired::NoAssertion => continue,
                Desired::Allowed => true,
                Desired::Blocked => false,
            };

            let rule = match find_rule(&rules, subject) {
                Some(rule) => rule,
                None => {
                    warn!("No firewall rule for {}, cannot reconcile", subject.name);
                    continue;
                }
            };

            if rule_allows(rule) == desired_allowed {
                continue;
            }

            // Rule-level correction now; the shared apply and the side
            // effects wait for the whole batch.
            match self.inner.firewall.patch_rule(&rule.id, desired_allowed).await {
                Ok(()) => corrections.push((subject.clone(), rule.clone(), desired_allowed)),
                Err(e) => {
                    error!("Failed to patch rule for {}: {}", subject.name, e);
                }
            }
        }

        if corrections.is_empty() {
            return Ok(0);
        }

        // Exactly one apply per tick, however many subjects changed
        self.inner.firewall.commit_pending().await?;
        info!("Reconciliation corrected {} subject(s)", corrections.len());

        for (subject, rule, allowed) in &corrections {
            effects::run(self, subject, &rule.source, *allowed).await;
            let action = if *allowed {
                AuditAction::ScheduleAllow
            } else {
                AuditAction::ScheduleBlock
            };
            self.audit(&subject.name, action, format!("reconciled, rule {}", rule.id))
                .await;
        }
        Ok(corrections.len())
    }

    /// Spawn the fixed-interval reconciliation worker. The first tick runs
    /// after one full period; callers wanting a startup pass run one
    /// directly first.
    pub fn spawn_reconciliation_loop(&self, period: Duration) -> JoinHandle<()> {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // immediate first tick of interval()
            loop {
                interval.tick().await;
                if let Err(e) = engine.run_tick().await {
                    error!("Reconciliation tick failed: {}", e);
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::testutil::{always_schedule, rig, rule, set_schedule, subject};
    use crate::upstream::RuleSource;

    #[tokio::test]
    async fn corrects_drift_and_is_idempotent() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule("r1", "tr1", false, RuleSource::Address("10.0.0.2".into()))],
        )
        .await;
        set_schedule(&rig.engine, "tr1", always_schedule()).await;

        // Window is active but the rule says blocked: one correction
        let corrected = rig.engine.run_tick().await.unwrap();
        assert_eq!(corrected, 1);
        assert!(rule_allows(&rig.firewall.rules.lock().unwrap()[0]));
        assert_eq!(rig.firewall.commits.load(std::sync::atomic::Ordering::SeqCst), 1);

        // Nothing changed since: the second pass issues zero patches
        let corrected = rig.engine.run_tick().await.unwrap();
        assert_eq!(corrected, 0);
        assert_eq!(rig.firewall.commits.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn skip_forces_block_over_an_active_window() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule("r1", "tr1", true, RuleSource::Address("10.0.0.2".into()))],
        )
        .await;
        set_schedule(&rig.engine, "tr1", always_schedule()).await;

        rig.engine.start_skip("kid").await.unwrap();
        rig.engine.run_tick().await.unwrap();

        assert!(!rule_allows(&rig.firewall.rules.lock().unwrap()[0]));
    }

    #[tokio::test]
    async fn timer_owned_subjects_are_left_alone() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule("r1", "tr1", false, RuleSource::Address("10.0.0.2".into()))],
        )
        .await;
        set_schedule(
            &rig.engine,
            "tr1",
            crate::schedule::ScheduleConfig {
                enabled: true,
                windows: vec![],
            },
        )
        .await;

        rig.engine.start_timed_allow("kid", 30).await.unwrap();
        let baseline = rig.firewall.patches.lock().unwrap().len();

        // Even with no active window, the tick must not re-block while the
        // timer is live
        rig.engine.run_tick().await.unwrap();
        assert_eq!(rig.firewall.patches.lock().unwrap().len(), baseline);
        assert!(rule_allows(&rig.firewall.rules.lock().unwrap()[0]));
    }

    #[tokio::test]
    async fn disabled_schedule_asserts_nothing() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule("r1", "tr1", false, RuleSource::Address("10.0.0.2".into()))],
        )
        .await;

        let corrected = rig.engine.run_tick().await.unwrap();
        assert_eq!(corrected, 0);
        assert!(rig.firewall.patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn fetch_failure_aborts_the_whole_tick() {
        let rig = rig(
            vec![subject("kid", "tr1", "r1")],
            vec![rule("r1", "tr1", false, RuleSource::Address("10.0.0.2".into()))],
        )
        .await;
        set_schedule(&rig.engine, "tr1", always_schedule()).await;

        rig.firewall
            .fail_list
            .store(true, std::sync::atomic::Ordering::SeqCst);
        assert!(rig.engine.run_tick().await.is_err());
        assert!(rig.firewall.patches.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn missing_rule_is_skipped_without_failing_the_batch() {
        let rig = rig(
            vec![
                subject("kid", "tr1", "r1"),
                subject("teen", "tr2", "r2"),
            ],
            vec![rule("r1", "tr1", false, RuleSource::Address("10.0.0.2".into()))],
        )
        .await;
        set_schedule(&rig.engine, "tr1", always_schedule()).await;
        set_schedule(&rig.engine, "tr2", always_schedule()).await;

        // teen has no rule upstream; kid still gets corrected
        let corrected = rig.engine.run_tick().await.unwrap();
        assert_eq!(corrected, 1);
    }
}
