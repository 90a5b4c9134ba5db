//! Materialized summary store.
//!
//! One slot per registered entity, each behind its own mutex, so events
//! for different entities apply in parallel and events for the same entity
//! serialize. An update works on a private copy of the summary, persists it
//! and only then swaps it in, so readers holding the previous `Arc` never
//! see a half-applied event.
//!
//! Lock order: entity slots (sorted by `EntityRef`), then the database, then
//! the portfolio index. Portfolio reads release the index before touching slots.
//!
//! With a history horizon set, in-memory activity keeps only the records
//! newer than `newest - horizon`; the database keeps everything. Signal ids
//! dated before the trimmed range are checked against the database.

pub mod activity;
pub mod portfolio;
pub mod summary;

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::analysis::baseline::EventAnomalyCheck;
use crate::db::SignalDb;
use crate::entity::{EntityProfile, EntityRef};
use crate::error::{PipelineError, ValidationError};
use crate::signals::bus::{Polarity, SignalEvent, SignalWeight};
use crate::signals::rules::{RuleTable, WindowCounts};
use crate::types::SentimentConfig;

use activity::{ActivityLog, ActivityRecord};
use portfolio::{PortfolioIndex, PortfolioScope, PortfolioSort};
use summary::{AnomalyFlag, ApplyOutcome, MaterializedSignalSummary};

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

/// Stale records are dropped in batches once this far past the horizon.
const TRIM_SLACK_DAYS: i64 = 7;

struct EntitySlot {
    profile: EntityProfile,
    summary: Arc<MaterializedSignalSummary>,
    activity: ActivityLog,
    /// Signal id -> event time, for ids still in `activity`.
    seen: HashMap<String, DateTime<Utc>>,
    /// Records before this were dropped from memory.
    trimmed_before: Option<DateTime<Utc>>,
}

impl EntitySlot {
    fn new(profile: EntityProfile, summary: MaterializedSignalSummary, activity: ActivityLog) -> Self {
        let seen = activity
            .records()
            .iter()
            .map(|r| (r.signal_id.clone(), r.occurred_at))
            .collect();
        Self {
            profile,
            summary: Arc::new(summary),
            activity,
            seen,
            trimmed_before: None,
        }
    }

    /// Drop activity older than `horizon` before the newest record, once
    /// enough has gone stale to be worth the copy.
    fn trim_history(&mut self, horizon: Duration) {
        let (Some(oldest), Some(newest)) = (
            self.activity.oldest(),
            self.activity.records().last().map(|r| r.occurred_at),
        ) else {
            return;
        };
        let Some(cutoff) = newest.checked_sub_signed(horizon) else {
            return;
        };
        let due = cutoff
            .checked_sub_signed(Duration::days(TRIM_SLACK_DAYS))
            .map_or(false, |t| oldest < t);
        if !due {
            return;
        }
        let dropped = self.activity.trim_before(cutoff);
        for r in &dropped {
            self.seen.remove(&r.signal_id);
        }
        self.trimmed_before = Some(self.trimmed_before.map_or(cutoff, |t| t.max(cutoff)));
        log::debug!(
            "{}: dropped {} activity records before {}",
            self.profile.entity,
            dropped.len(),
            cutoff
        );
    }
}

/// Consistent copy of one entity for batch work.
#[derive(Debug, Clone)]
pub struct EntitySnapshot {
    pub profile: EntityProfile,
    pub summary: Arc<MaterializedSignalSummary>,
    pub activity: ActivityLog,
}

/// Result of applying a signal to one of its entities.
#[derive(Debug, Clone)]
pub struct AppliedSignal {
    pub entity: EntityRef,
    pub summary: Arc<MaterializedSignalSummary>,
    pub outcome: ApplyOutcome,
    pub anomalies: Vec<AnomalyFlag>,
    /// True when the signal id had already been applied to this entity.
    pub duplicate: bool,
}

/// A rule window where the cached marks disagree with a recount of raw activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WindowMismatch {
    pub rule_id: String,
    pub category: String,
    pub cached: u64,
    pub recounted: u64,
}

pub struct SummaryStore {
    slots: DashMap<EntityRef, Arc<Mutex<EntitySlot>>>,
    portfolio: RwLock<PortfolioIndex>,
    rules: Arc<RuleTable>,
    sentiment: SentimentConfig,
    anomaly_retention: usize,
    history_horizon: Option<Duration>,
    db: Option<Arc<Mutex<SignalDb>>>,
    next_seq: AtomicU64,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

impl SummaryStore {
    pub fn new(
        rules: Arc<RuleTable>,
        sentiment: SentimentConfig,
        anomaly_retention: usize,
        db: Option<Arc<Mutex<SignalDb>>>,
    ) -> Self {
        Self {
            slots: DashMap::new(),
            portfolio: RwLock::new(PortfolioIndex::default()),
            rules,
            sentiment,
            anomaly_retention,
            history_horizon: None,
            db,
            next_seq: AtomicU64::new(0),
        }
    }

    /// Keep only `days` of activity per entity in memory.
    pub fn with_history_horizon(mut self, days: i64) -> Self {
        self.history_horizon = Some(Duration::days(days.max(1)));
        self
    }

    pub fn history_horizon(&self) -> Option<Duration> {
        self.history_horizon
    }

    pub fn rules(&self) -> &Arc<RuleTable> {
        &self.rules
    }

    pub fn sentiment_config(&self) -> &SentimentConfig {
        &self.sentiment
    }

    pub fn anomaly_retention(&self) -> usize {
        self.anomaly_retention
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        self.slots.contains_key(entity)
    }

    /// Register an entity or update its structural profile.
    pub fn register(&self, profile: EntityProfile) -> Result<(), PipelineError> {
        let entity = profile.entity.clone();
        if let Some(slot) = self.slot(&entity) {
            let mut guard = slot.lock();
            if let Some(db) = &self.db {
                db.lock().upsert_profile(&profile)?;
            }
            guard.profile = profile;
            return Ok(());
        }

        let summary = MaterializedSignalSummary::new(entity.clone());
        if let Some(db) = &self.db {
            db.lock().with_transaction(|tx| {
                tx.upsert_profile(&profile)?;
                tx.upsert_summary(&summary)
            })?;
        }
        let score = summary.sentiment_score;
        let slot = EntitySlot::new(profile, summary, ActivityLog::default());
        // A concurrent register for the same entity keeps whichever landed first.
        if let dashmap::Entry::Vacant(v) = self.slots.entry(entity.clone()) {
            v.insert(Arc::new(Mutex::new(slot)));
            self.portfolio.write().upsert(&entity, score);
            log::debug!("registered {}", entity);
        }
        Ok(())
    }

    /// O(1) read of the last fully-applied summary.
    pub fn summary(&self, entity: &EntityRef) -> Option<Arc<MaterializedSignalSummary>> {
        self.slot(entity).map(|s| s.lock().summary.clone())
    }

    pub fn profile(&self, entity: &EntityRef) -> Option<EntityProfile> {
        self.slot(entity).map(|s| s.lock().profile.clone())
    }

    pub fn profiles(&self) -> Vec<EntityProfile> {
        let mut out: Vec<EntityProfile> = self
            .slot_list()
            .into_iter()
            .map(|(_, s)| s.lock().profile.clone())
            .collect();
        out.sort_by(|a, b| a.entity.cmp(&b.entity));
        out
    }

    pub fn entities(&self) -> Vec<EntityRef> {
        let mut out: Vec<EntityRef> = self.slots.iter().map(|e| e.key().clone()).collect();
        out.sort();
        out
    }

    pub fn snapshot(&self, entity: &EntityRef) -> Option<EntitySnapshot> {
        self.slot(entity).map(|s| {
            let guard = s.lock();
            EntitySnapshot {
                profile: guard.profile.clone(),
                summary: guard.summary.clone(),
                activity: guard.activity.clone(),
            }
        })
    }

    /// Portfolio screening over the pre-sorted index, O(T).
    pub fn portfolio(
        &self,
        scope: &PortfolioScope,
        sort: PortfolioSort,
    ) -> Vec<Arc<MaterializedSignalSummary>> {
        let ordered: Vec<EntityRef> = {
            let index = self.portfolio.read();
            index.ordered(sort).map(|(e, _)| e.clone()).collect()
        };
        ordered
            .into_iter()
            .filter_map(|entity| {
                let slot = self.slot(&entity)?;
                let guard = slot.lock();
                scope.admits(&guard.profile).then(|| guard.summary.clone())
            })
            .collect()
    }

    /// Convenience entry point taking weight and polarity labels as strings.
    /// Labels are validated before anything else happens.
    pub fn apply_labeled(
        &self,
        entity: &EntityRef,
        category: &str,
        weight: &str,
        polarity: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<Arc<MaterializedSignalSummary>, PipelineError> {
        let weight = SignalWeight::parse(weight)?;
        let polarity = Polarity::parse(polarity)?;
        let signal = SignalEvent {
            id: format!("sig-{}", uuid::Uuid::new_v4()),
            event_type: category.to_string(),
            occurred_at,
            entity_refs: vec![entity.clone()],
            category: category.to_string(),
            weight,
            polarity,
            payload: serde_json::Value::Null,
            observations: Vec::new(),
        };
        let mut applied = self.apply_signal(&signal, None)?;
        applied
            .pop()
            .map(|a| a.summary)
            .ok_or_else(|| ValidationError::UnknownEntity(entity.clone()).into())
    }

    /// Apply a classified signal to every entity it references.
    ///
    /// Every reference is validated first; an unknown entity rejects the whole
    /// signal with nothing written. All affected entities commit together.
    pub fn apply_signal(
        &self,
        signal: &SignalEvent,
        anomaly_check: Option<&dyn EventAnomalyCheck>,
    ) -> Result<Vec<AppliedSignal>, PipelineError> {
        let mut targets = signal.entity_refs.clone();
        targets.sort();
        targets.dedup();
        if targets.is_empty() {
            return Err(ValidationError::NoEntities.into());
        }

        let slots: Vec<(EntityRef, Arc<Mutex<EntitySlot>>)> = targets
            .into_iter()
            .map(|e| match self.slot(&e) {
                Some(s) => Ok((e, s)),
                None => Err(ValidationError::UnknownEntity(e)),
            })
            .collect::<Result<_, _>>()?;

        let mut guards: Vec<_> = slots.iter().map(|(_, s)| s.lock()).collect();

        let seq = self.next_seq.fetch_add(1, Ordering::SeqCst) + 1;
        let record = ActivityRecord::from_signal(signal, seq);

        struct Pending {
            next: Option<MaterializedSignalSummary>,
            outcome: ApplyOutcome,
            anomalies: Vec<AnomalyFlag>,
        }
        let mut pending = Vec::with_capacity(guards.len());
        for ((entity, _), guard) in slots.iter().zip(guards.iter()) {
            if self.already_applied(guard, entity, signal)? {
                log::debug!("signal {} already applied to {}", signal.id, entity);
                pending.push(Pending {
                    next: None,
                    outcome: ApplyOutcome::default(),
                    anomalies: Vec::new(),
                });
                continue;
            }
            let mut next = (*guard.summary).clone();
            let outcome = next.apply_signal(signal, &self.rules, &self.sentiment);
            let anomalies = anomaly_check
                .map(|c| c.check(entity, signal))
                .unwrap_or_default();
            for flag in &anomalies {
                log::info!("event-time anomaly for {}: {}", entity, flag.description);
                next.push_anomaly(flag.clone(), self.anomaly_retention);
            }
            pending.push(Pending {
                next: Some(next),
                outcome,
                anomalies,
            });
        }

        if let Some(db) = &self.db {
            db.lock().with_transaction(|tx| {
                for ((entity, _), p) in slots.iter().zip(pending.iter()) {
                    if let Some(next) = &p.next {
                        tx.insert_activity(entity, &record)?;
                        tx.upsert_summary(next)?;
                    }
                }
                Ok(())
            })?;
        }

        let mut applied = Vec::with_capacity(pending.len());
        for (((entity, _), guard), p) in slots.iter().zip(guards.iter_mut()).zip(pending) {
            let duplicate = p.next.is_none();
            if let Some(next) = p.next {
                let score = next.sentiment_score;
                guard.summary = Arc::new(next);
                guard.activity.insert(record.clone());
                guard.seen.insert(signal.id.clone(), signal.occurred_at);
                if let Some(horizon) = self.history_horizon {
                    guard.trim_history(horizon);
                }
                self.portfolio.write().upsert(entity, score);
            }
            applied.push(AppliedSignal {
                entity: entity.clone(),
                summary: guard.summary.clone(),
                outcome: p.outcome,
                anomalies: p.anomalies,
                duplicate,
            });
        }
        Ok(applied)
    }

    /// Write derived fields back from the batch path. `f` sees the current
    /// summary, not the snapshot the batch computed from, so event-path
    /// changes made meanwhile are kept.
    pub fn update_derived<F>(
        &self,
        entity: &EntityRef,
        f: F,
    ) -> Result<Arc<MaterializedSignalSummary>, PipelineError>
    where
        F: FnOnce(&mut MaterializedSignalSummary),
    {
        let slot = self
            .slot(entity)
            .ok_or_else(|| ValidationError::UnknownEntity(entity.clone()))?;
        let mut guard = slot.lock();
        let mut next = (*guard.summary).clone();
        f(&mut next);
        if next == *guard.summary {
            return Ok(guard.summary.clone());
        }
        next.version = guard.summary.version + 1;
        if let Some(db) = &self.db {
            db.lock().upsert_summary(&next)?;
        }
        let score = next.sentiment_score;
        guard.summary = Arc::new(next);
        self.portfolio.write().upsert(entity, score);
        Ok(guard.summary.clone())
    }

    /// Explicitly clear an active escalation.
    pub fn clear_escalation(&self, entity: &EntityRef, rule_id: &str) -> Result<bool, PipelineError> {
        let mut cleared = false;
        self.update_derived(entity, |s| {
            cleared = s.clear_escalation(rule_id);
        })?;
        if cleared {
            log::info!("escalation {} cleared for {} on request", rule_id, entity);
        }
        Ok(cleared)
    }

    /// Recount every rule window from raw activity and report disagreements
    /// with the cached marks. Evaluated no earlier than the newest signal.
    pub fn verify_window_counts(
        &self,
        entity: &EntityRef,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<WindowMismatch>, PipelineError> {
        let slot = self
            .slot(entity)
            .ok_or_else(|| ValidationError::UnknownEntity(entity.clone()))?;
        let guard = slot.lock();
        let summary = &guard.summary;
        let as_of = summary.last_signal_at().map_or(as_of, |t| t.max(as_of));

        let mut mismatches = Vec::new();
        let mut checked = HashSet::new();
        for category in summary.categories.keys() {
            for rule in self.rules.rules_for(category) {
                for condition in rule.predicate.count_conditions() {
                    if !checked.insert((rule.rule_id.clone(), condition.category.clone())) {
                        continue;
                    }
                    let cached = summary.count_in_window(condition, as_of);
                    let recounted = guard.activity.count_in_window(condition, as_of);
                    if cached != recounted {
                        mismatches.push(WindowMismatch {
                            rule_id: rule.rule_id.clone(),
                            category: condition.category.clone(),
                            cached,
                            recounted,
                        });
                    }
                }
            }
        }
        if !mismatches.is_empty() {
            log::warn!("{} window mismatch(es) for {}", mismatches.len(), entity);
        }
        Ok(mismatches)
    }

    /// Rebuild in-memory state from the database.
    pub fn restore(&self, db: &SignalDb) -> Result<usize, PipelineError> {
        let profiles = db.load_profiles()?;
        let mut restored = 0;
        for profile in profiles {
            let entity = profile.entity.clone();
            let summary = db
                .get_summary(&entity)?
                .unwrap_or_else(|| MaterializedSignalSummary::new(entity.clone()));
            let records = db.load_activity(&entity)?;
            let score = summary.sentiment_score;
            let mut slot = EntitySlot::new(profile, summary, ActivityLog::from_records(records));
            if let Some(horizon) = self.history_horizon {
                slot.trim_history(horizon);
            }
            self.slots.insert(entity.clone(), Arc::new(Mutex::new(slot)));
            self.portfolio.write().upsert(&entity, score);
            restored += 1;
        }
        let max_seq = db.max_activity_seq()?;
        self.next_seq.fetch_max(max_seq, Ordering::SeqCst);
        log::info!("restored {} entities (activity seq {})", restored, max_seq);
        Ok(restored)
    }

    pub(crate) fn db(&self) -> Option<&Arc<Mutex<SignalDb>>> {
        self.db.as_ref()
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

impl SummaryStore {
    fn already_applied(
        &self,
        slot: &EntitySlot,
        entity: &EntityRef,
        signal: &SignalEvent,
    ) -> Result<bool, PipelineError> {
        if slot.seen.contains_key(&signal.id) {
            return Ok(true);
        }
        match (&self.db, slot.trimmed_before) {
            (Some(db), Some(cutoff)) if signal.occurred_at < cutoff => {
                Ok(db.lock().has_activity(entity, &signal.id)?)
            }
            _ => Ok(false),
        }
    }

    fn slot(&self, entity: &EntityRef) -> Option<Arc<Mutex<EntitySlot>>> {
        self.slots.get(entity).map(|s| s.value().clone())
    }

    fn slot_list(&self) -> Vec<(EntityRef, Arc<Mutex<EntitySlot>>)> {
        self.slots
            .iter()
            .map(|e| (e.key().clone(), e.value().clone()))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
