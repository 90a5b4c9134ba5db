//! Per-scope invocation budgets.
//!
//! Counters are keyed by (scope, tier) and reset when the configured cycle
//! rolls over. The check and the increment happen under one per-key mutex,
//! so concurrent reservations against the same key are linearizable while
//! different keys never contend. A multi-unit reservation is all or nothing.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;

use chrono::{DateTime, Datelike, Duration, TimeZone, Timelike, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::db::{DbCostLedgerRow, SignalDb};
use crate::types::{CostConfig, CostCycle, Tier};

/// How much a request may push past a hard limit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Urgency {
    /// Event-driven follow-up. Rejected at the hard limit.
    Routine,
    /// Scheduled work. Deferred to the next cycle at the hard limit.
    Background,
    HumanInitiated,
    CriticalEscalation,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Urgency::Routine => "routine",
            Urgency::Background => "background",
            Urgency::HumanInitiated => "human_initiated",
            Urgency::CriticalEscalation => "critical_escalation",
        }
    }

    fn overrides_hard_limit(&self) -> bool {
        matches!(self, Urgency::HumanInitiated | Urgency::CriticalEscalation)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "decision")]
pub enum CostDecision {
    Allow {
        /// Count for this key in the current period, including this call.
        used: u64,
        soft_exceeded: bool,
        hard_override: bool,
    },
    Defer {
        resume_at: DateTime<Utc>,
    },
    Reject {
        reason: String,
    },
}

impl CostDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, CostDecision::Allow { .. })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Soft,
    Hard,
}

/// Operational alert raised once per (scope, tier, period, level).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostAlert {
    pub scope: String,
    pub tier: Tier,
    pub period: String,
    pub level: AlertLevel,
    pub used: u64,
    pub limit: u64,
    pub raised_at: DateTime<Utc>,
}

#[derive(Debug)]
struct LedgerEntry {
    period: String,
    count: u64,
}

type AlertKey = (String, Tier, AlertLevel);

/// Periods whose raised-alert keys are remembered for deduplication.
const RAISED_PERIODS_KEPT: usize = 2;

pub struct CostGuard {
    config: CostConfig,
    ledger: DashMap<(String, Tier), Arc<Mutex<LedgerEntry>>>,
    alerts: Mutex<Vec<CostAlert>>,
    /// Alert keys already raised, per period. Only the newest periods are kept.
    raised: Mutex<BTreeMap<String, HashSet<AlertKey>>>,
    db: Option<Arc<Mutex<SignalDb>>>,
}

/// Ledger period label for `now`.
pub fn period_key(cycle: CostCycle, now: DateTime<Utc>) -> String {
    match cycle {
        CostCycle::Hourly => now.format("%Y-%m-%dT%H").to_string(),
        CostCycle::Daily => now.format("%Y-%m-%d").to_string(),
        CostCycle::Monthly => now.format("%Y-%m").to_string(),
    }
}

/// Start of the period after the one containing `now`.
pub fn next_period_start(cycle: CostCycle, now: DateTime<Utc>) -> DateTime<Utc> {
    let (y, m, d) = (now.year(), now.month(), now.day());
    let start = match cycle {
        CostCycle::Hourly => Utc
            .with_ymd_and_hms(y, m, d, now.hour(), 0, 0)
            .single()
            .map(|t| t + Duration::hours(1)),
        CostCycle::Daily => Utc
            .with_ymd_and_hms(y, m, d, 0, 0, 0)
            .single()
            .map(|t| t + Duration::days(1)),
        CostCycle::Monthly => {
            let (ny, nm) = if m == 12 { (y + 1, 1) } else { (y, m + 1) };
            Utc.with_ymd_and_hms(ny, nm, 1, 0, 0, 0).single()
        }
    };
    start.unwrap_or(now + Duration::hours(1))
}

impl CostGuard {
    pub fn new(config: CostConfig, db: Option<Arc<Mutex<SignalDb>>>) -> Self {
        Self {
            config,
            ledger: DashMap::new(),
            alerts: Mutex::new(Vec::new()),
            raised: Mutex::new(BTreeMap::new()),
            db,
        }
    }

    pub fn config(&self) -> &CostConfig {
        &self.config
    }

    /// Admit, defer or reject one invocation and count it if admitted.
    pub fn check_and_reserve(&self, scope: &str, tier: Tier, urgency: Urgency) -> CostDecision {
        self.check_and_reserve_at(scope, tier, urgency, Utc::now())
    }

    pub fn check_and_reserve_at(
        &self,
        scope: &str,
        tier: Tier,
        urgency: Urgency,
        now: DateTime<Utc>,
    ) -> CostDecision {
        self.check_and_reserve_n_at(scope, tier, urgency, 1, now)
    }

    /// Reserve `units` invocations at once: either all are counted or none.
    pub fn check_and_reserve_n_at(
        &self,
        scope: &str,
        tier: Tier,
        urgency: Urgency,
        units: u64,
        now: DateTime<Utc>,
    ) -> CostDecision {
        if !tier.is_metered() || units == 0 {
            return CostDecision::Allow {
                used: 0,
                soft_exceeded: false,
                hard_override: false,
            };
        }

        let period = period_key(self.config.cycle, now);
        let entry = self.entry(scope, tier, &period);
        let mut guard = entry.lock();
        if guard.period != period {
            guard.period = period.clone();
            guard.count = 0;
        }

        let Some(limit) = self.config.limits.get(&tier).copied() else {
            guard.count += units;
            self.persist(scope, tier, &guard);
            return CostDecision::Allow {
                used: guard.count,
                soft_exceeded: false,
                hard_override: false,
            };
        };

        if guard.count.saturating_add(units) > limit.hard {
            self.raise(scope, tier, &period, AlertLevel::Hard, guard.count, limit.hard, now);
            if urgency.overrides_hard_limit() {
                guard.count += units;
                self.persist(scope, tier, &guard);
                log::warn!(
                    "Cost: {} {} over hard limit {}, allowed as {}",
                    scope,
                    tier,
                    limit.hard,
                    urgency.as_str()
                );
                return CostDecision::Allow {
                    used: guard.count,
                    soft_exceeded: true,
                    hard_override: true,
                };
            }
            return match urgency {
                Urgency::Background => CostDecision::Defer {
                    resume_at: next_period_start(self.config.cycle, now),
                },
                _ => CostDecision::Reject {
                    reason: format!(
                        "{} {} more {} call(s) would pass the hard limit of {} for {} ({} used)",
                        scope, units, tier, limit.hard, period, guard.count
                    ),
                },
            };
        }

        guard.count += units;
        self.persist(scope, tier, &guard);
        let soft_exceeded = guard.count > limit.soft;
        if soft_exceeded {
            self.raise(scope, tier, &period, AlertLevel::Soft, guard.count, limit.soft, now);
        }
        CostDecision::Allow {
            used: guard.count,
            soft_exceeded,
            hard_override: false,
        }
    }

    /// Reservations counted for a key in the period containing `now`.
    pub fn usage(&self, scope: &str, tier: Tier, now: DateTime<Utc>) -> u64 {
        let period = period_key(self.config.cycle, now);
        self.ledger
            .get(&(scope.to_string(), tier))
            .map(|e| {
                let guard = e.lock();
                if guard.period == period {
                    guard.count
                } else {
                    0
                }
            })
            .unwrap_or(0)
    }

    /// Take every alert raised since the last drain.
    pub fn drain_alerts(&self) -> Vec<CostAlert> {
        std::mem::take(&mut *self.alerts.lock())
    }

    /// Current ledger rows, sorted by scope then tier.
    pub fn snapshot(&self) -> Vec<DbCostLedgerRow> {
        let mut rows: Vec<DbCostLedgerRow> = self
            .ledger
            .iter()
            .map(|e| {
                let (scope, tier) = e.key();
                let guard = e.value().lock();
                DbCostLedgerRow {
                    scope: scope.clone(),
                    tier: tier.as_str().to_string(),
                    period: guard.period.clone(),
                    count: guard.count,
                }
            })
            .collect();
        rows.sort_by(|a, b| a.scope.cmp(&b.scope).then(a.tier.cmp(&b.tier)));
        rows
    }

    /// Reload the current period's counters. Rows for unknown tiers are skipped.
    pub fn restore(&self, db: &SignalDb, now: DateTime<Utc>) -> Result<usize, crate::db::DbError> {
        let period = period_key(self.config.cycle, now);
        let mut restored = 0;
        for row in db.load_cost_ledger(&period)? {
            let Some(tier) = Tier::from_str_lossy(&row.tier) else {
                log::warn!("Cost: skipping ledger row with unknown tier {}", row.tier);
                continue;
            };
            self.ledger.insert(
                (row.scope, tier),
                Arc::new(Mutex::new(LedgerEntry {
                    period: row.period,
                    count: row.count,
                })),
            );
            restored += 1;
        }
        Ok(restored)
    }

    fn entry(&self, scope: &str, tier: Tier, period: &str) -> Arc<Mutex<LedgerEntry>> {
        self.ledger
            .entry((scope.to_string(), tier))
            .or_insert_with(|| {
                Arc::new(Mutex::new(LedgerEntry {
                    period: period.to_string(),
                    count: 0,
                }))
            })
            .clone()
    }

    fn persist(&self, scope: &str, tier: Tier, entry: &LedgerEntry) {
        let Some(db) = &self.db else { return };
        let row = DbCostLedgerRow {
            scope: scope.to_string(),
            tier: tier.as_str().to_string(),
            period: entry.period.clone(),
            count: entry.count,
        };
        if let Err(e) = db.lock().upsert_cost_ledger(&row) {
            log::warn!("Cost: failed to persist ledger row for {} {}: {}", scope, tier, e);
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn raise(
        &self,
        scope: &str,
        tier: Tier,
        period: &str,
        level: AlertLevel,
        used: u64,
        limit: u64,
        now: DateTime<Utc>,
    ) {
        {
            let mut raised = self.raised.lock();
            let fresh = raised
                .entry(period.to_string())
                .or_default()
                .insert((scope.to_string(), tier, level));
            while raised.len() > RAISED_PERIODS_KEPT {
                raised.pop_first();
            }
            if !fresh {
                return;
            }
        }
        log::warn!(
            "Cost: {} {} passed its {:?} limit ({} of {}) for {}",
            scope,
            tier,
            level,
            used,
            limit,
            period
        );
        self.alerts.lock().push(CostAlert {
            scope: scope.to_string(),
            tier,
            period: period.to_string(),
            level,
            used,
            limit,
            raised_at: now,
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_utils::test_db;
    use crate::types::TierLimit;
    use std::collections::BTreeMap;

    fn at(day: u32, hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, day, hour, 15, 0).unwrap()
    }

    fn guard(soft: u64, hard: u64) -> CostGuard {
        let mut limits = BTreeMap::new();
        limits.insert(Tier::LanguageStandard, TierLimit { soft, hard });
        CostGuard::new(
            CostConfig {
                cycle: CostCycle::Daily,
                limits,
            },
            None,
        )
    }

    fn fill(g: &CostGuard, n: u64, now: DateTime<Utc>) {
        for _ in 0..n {
            assert!(g
                .check_and_reserve_at("prop-1", Tier::LanguageStandard, Urgency::Routine, now)
                .is_allowed());
        }
    }

    #[test]
    fn test_hard_limit_rejects_routine_allows_human() {
        let g = guard(2, 3);
        let now = at(10, 9);
        fill(&g, 3, now);

        let routine = g.check_and_reserve_at("prop-1", Tier::LanguageStandard, Urgency::Routine, now);
        assert!(matches!(routine, CostDecision::Reject { .. }), "got {:?}", routine);

        let human =
            g.check_and_reserve_at("prop-1", Tier::LanguageStandard, Urgency::HumanInitiated, now);
        assert_eq!(
            human,
            CostDecision::Allow {
                used: 4,
                soft_exceeded: true,
                hard_override: true
            }
        );
        let critical = g.check_and_reserve_at(
            "prop-1",
            Tier::LanguageStandard,
            Urgency::CriticalEscalation,
            now,
        );
        assert!(critical.is_allowed());
    }

    #[test]
    fn test_background_defers_to_next_cycle() {
        let g = guard(1, 1);
        let now = at(10, 22);
        fill(&g, 1, now);
        let decision =
            g.check_and_reserve_at("prop-1", Tier::LanguageStandard, Urgency::Background, now);
        assert_eq!(
            decision,
            CostDecision::Defer {
                resume_at: Utc.with_ymd_and_hms(2026, 3, 11, 0, 0, 0).unwrap()
            }
        );
        assert_eq!(g.usage("prop-1", Tier::LanguageStandard, now), 1, "deferral is not counted");
    }

    #[test]
    fn test_soft_limit_allows_and_alerts_once() {
        let g = guard(2, 10);
        let now = at(10, 9);
        fill(&g, 2, now);
        assert!(g.drain_alerts().is_empty());

        fill(&g, 3, now);
        let alerts = g.drain_alerts();
        assert_eq!(alerts.len(), 1, "one alert per scope/tier/period/level");
        assert_eq!(alerts[0].level, AlertLevel::Soft);
        assert_eq!(alerts[0].used, 3);
        assert_eq!(alerts[0].period, "2026-03-10");
    }

    #[test]
    fn test_hard_alert_raised_once_per_period() {
        let g = guard(1, 1);
        let now = at(10, 9);
        fill(&g, 1, now);
        g.drain_alerts();
        for _ in 0..3 {
            g.check_and_reserve_at("prop-1", Tier::LanguageStandard, Urgency::Routine, now);
        }
        let alerts = g.drain_alerts();
        assert_eq!(alerts.len(), 1);
        assert_eq!(alerts[0].level, AlertLevel::Hard);
    }

    #[test]
    fn test_multi_unit_reservation_is_all_or_nothing() {
        let g = guard(2, 3);
        let now = at(10, 9);
        fill(&g, 1, now);
        let three = g.check_and_reserve_n_at("prop-1", Tier::LanguageStandard, Urgency::Routine, 3, now);
        assert!(matches!(three, CostDecision::Reject { .. }), "got {:?}", three);
        assert_eq!(g.usage("prop-1", Tier::LanguageStandard, now), 1, "nothing counted on reject");

        let deferred =
            g.check_and_reserve_n_at("prop-1", Tier::LanguageStandard, Urgency::Background, 3, now);
        assert!(matches!(deferred, CostDecision::Defer { .. }));
        assert_eq!(g.usage("prop-1", Tier::LanguageStandard, now), 1);

        let two = g.check_and_reserve_n_at("prop-1", Tier::LanguageStandard, Urgency::Routine, 2, now);
        assert_eq!(
            two,
            CostDecision::Allow {
                used: 3,
                soft_exceeded: true,
                hard_override: false
            }
        );
    }

    #[test]
    fn test_alert_dedup_forgets_old_periods() {
        let g = guard(1, 1);
        for day in 1..=20 {
            for hour in [9, 10] {
                for scope in ["prop-1", "prop-2"] {
                    g.check_and_reserve_at(scope, Tier::LanguageStandard, Urgency::Routine, at(day, hour));
                }
            }
        }
        let raised = g.raised.lock();
        assert!(raised.len() <= RAISED_PERIODS_KEPT, "{} periods kept", raised.len());
        assert!(raised.contains_key("2026-03-20"));
        drop(raised);
        assert_eq!(g.drain_alerts().len(), 40, "one hard alert per scope per day");
    }

    #[test]
    fn test_period_rollover_resets_counter() {
        let g = guard(1, 2);
        fill(&g, 2, at(10, 9));
        assert!(!g
            .check_and_reserve_at("prop-1", Tier::LanguageStandard, Urgency::Routine, at(10, 23))
            .is_allowed());
        let next_day =
            g.check_and_reserve_at("prop-1", Tier::LanguageStandard, Urgency::Routine, at(11, 0));
        assert_eq!(
            next_day,
            CostDecision::Allow {
                used: 1,
                soft_exceeded: false,
                hard_override: false
            }
        );
    }

    #[test]
    fn test_scopes_and_tiers_are_independent() {
        let g = guard(1, 1);
        let now = at(10, 9);
        fill(&g, 1, now);
        assert!(g
            .check_and_reserve_at("prop-2", Tier::LanguageStandard, Urgency::Routine, now)
            .is_allowed());
        // no configured limit
        assert!(g
            .check_and_reserve_at("prop-1", Tier::LanguagePremium, Urgency::Routine, now)
            .is_allowed());
        assert_eq!(
            g.check_and_reserve_at("prop-1", Tier::RuleEngine, Urgency::Routine, now),
            CostDecision::Allow {
                used: 0,
                soft_exceeded: false,
                hard_override: false
            }
        );
    }

    #[test]
    fn test_concurrent_reservations_admit_exactly_hard() {
        let g = Arc::new(guard(50, 100));
        let now = at(10, 9);
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let g = g.clone();
                std::thread::spawn(move || {
                    (0..40)
                        .filter(|_| {
                            g.check_and_reserve_at(
                                "prop-1",
                                Tier::LanguageStandard,
                                Urgency::Routine,
                                now,
                            )
                            .is_allowed()
                        })
                        .count()
                })
            })
            .collect();
        let allowed: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
        assert_eq!(allowed, 100);
        assert_eq!(g.usage("prop-1", Tier::LanguageStandard, now), 100);
    }

    #[test]
    fn test_ledger_persists_and_restores() {
        let db = Arc::new(Mutex::new(test_db()));
        let mut limits = BTreeMap::new();
        limits.insert(Tier::LanguageLight, TierLimit { soft: 5, hard: 5 });
        let config = CostConfig {
            cycle: CostCycle::Daily,
            limits,
        };
        let now = at(10, 9);
        let g = CostGuard::new(config.clone(), Some(db.clone()));
        for _ in 0..3 {
            g.check_and_reserve_at("prop-1", Tier::LanguageLight, Urgency::Routine, now);
        }

        let restored = CostGuard::new(config, None);
        assert_eq!(restored.restore(&db.lock(), now).expect("restore"), 1);
        assert_eq!(restored.usage("prop-1", Tier::LanguageLight, now), 3);
        assert_eq!(restored.snapshot(), g.snapshot());
    }

    #[test]
    fn test_next_period_boundaries() {
        let now = Utc.with_ymd_and_hms(2026, 12, 31, 23, 40, 0).unwrap();
        assert_eq!(
            next_period_start(CostCycle::Hourly, now),
            Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(
            next_period_start(CostCycle::Monthly, now),
            Utc.with_ymd_and_hms(2027, 1, 1, 0, 0, 0).unwrap()
        );
        assert_eq!(period_key(CostCycle::Hourly, now), "2026-12-31T23");
        assert_eq!(period_key(CostCycle::Monthly, now), "2026-12");
    }
}
