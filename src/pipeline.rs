//! Ingestion facade over the summary store, batch runner, router,
//! context assembler and cost guard.
//!
//! One `SignalPipeline` owns the immutable registry and rule table for the
//! life of the process. Everything it hands out (`Arc` summaries, packets,
//! route decisions) is a consistent snapshot; nothing borrows into the store.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::analysis::baseline::BaselineStore;
use crate::analysis::runner::{AnalysisRunner, CycleReport, SEASONAL_HISTORY_MONTHS};
use crate::analysis::AnalysisMethod;
use crate::capability::{Dispatcher, LanguageCapability};
use crate::context::{Assembly, AssemblyRequest, ContextAssembler};
use crate::cost::{CostAlert, CostDecision, CostGuard, Urgency};
use crate::db::SignalDb;
use crate::entity::{EntityProfile, EntityRef};
use crate::error::PipelineError;
use crate::presets::{self, embedded::DEFAULT_PRESET, Preset};
use crate::routing::{route, RouteDecision, TaskDescriptor};
use crate::signals::bus::DomainEvent;
use crate::signals::classifier::SignalRegistry;
use crate::signals::rules::RuleTable;
use crate::store::portfolio::{PortfolioScope, PortfolioSort};
use crate::store::summary::MaterializedSignalSummary;
use crate::store::{AppliedSignal, SummaryStore, WindowMismatch};
use crate::types::{Config, Tier};

pub struct SignalPipeline {
    config: Config,
    preset_id: String,
    registry: SignalRegistry,
    store: Arc<SummaryStore>,
    runner: AnalysisRunner,
    assembler: Arc<ContextAssembler>,
    cost: Arc<CostGuard>,
    db: Option<Arc<Mutex<SignalDb>>>,
}

/// Resolve the preset a config asks for: a custom file if set, else the
/// embedded default.
pub fn preset_for(config: &Config) -> Result<Preset, PipelineError> {
    let preset = match &config.preset_path {
        Some(path) => presets::load_custom_preset(path),
        None => presets::load_preset(DEFAULT_PRESET),
    };
    preset.map_err(PipelineError::Config)
}

/// Longest look-back, in days, of anything that reads in-memory activity:
/// batch windows (plus the month in progress), context retention and rule windows.
pub fn history_horizon_days(config: &Config, rules: &RuleTable) -> i64 {
    let months = SEASONAL_HISTORY_MONTHS.max(config.analysis.baseline_window_months) as i64 + 1;
    (months * 31)
        .max(config.context.retention_days)
        .max(rules.max_window_days())
}

impl SignalPipeline {
    /// Build a pipeline. Nothing is restored from `db`; call [`restore`](Self::restore).
    pub fn new(config: Config, preset: Preset, db: Option<SignalDb>) -> Result<Self, PipelineError> {
        config.validate()?;
        presets::validate_preset(&preset).map_err(PipelineError::Config)?;

        let rules = Arc::new(RuleTable::new(preset.rules.clone())?);
        let mut sentiment = config.sentiment.clone();
        for (category, weight) in &preset.category_weights {
            sentiment
                .category_weights
                .entry(category.clone())
                .or_insert(*weight);
        }

        let db = db.map(|d| Arc::new(Mutex::new(d)));
        let horizon = history_horizon_days(&config, &rules);
        let store = Arc::new(
            SummaryStore::new(
                rules,
                sentiment,
                config.analysis.anomaly_retention,
                db.clone(),
            )
            .with_history_horizon(horizon),
        );
        let baselines = Arc::new(BaselineStore::new(&config.analysis));
        let runner = AnalysisRunner::new(store.clone(), baselines, config.analysis.clone());
        let assembler = Arc::new(ContextAssembler::new(
            config.context.clone(),
            config.tiers.clone(),
        ));
        let cost = Arc::new(CostGuard::new(config.cost.clone(), db.clone()));

        log::info!(
            "pipeline ready: preset {} ({} registry entries, {} rules)",
            preset.id,
            preset.registry.len(),
            preset.rules.len()
        );

        Ok(Self {
            registry: preset.signal_registry(),
            preset_id: preset.id,
            config,
            store,
            runner,
            assembler,
            cost,
            db,
        })
    }

    /// Open the configured database and rebuild in-memory state from it.
    pub fn open(config: Config) -> Result<Self, PipelineError> {
        let preset = preset_for(&config)?;
        let db = SignalDb::open_at(config.database_path()?)?;
        let pipeline = Self::new(config, preset, Some(db))?;
        pipeline.restore()?;
        Ok(pipeline)
    }

    /// Pipeline with the embedded preset and no persistence.
    pub fn in_memory(config: Config) -> Result<Self, PipelineError> {
        let preset = preset_for(&config)?;
        Self::new(config, preset, None)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn preset_id(&self) -> &str {
        &self.preset_id
    }

    pub fn store(&self) -> &Arc<SummaryStore> {
        &self.store
    }

    pub fn runner(&self) -> &AnalysisRunner {
        &self.runner
    }

    // -----------------------------------------------------------------------
    // Event path
    // -----------------------------------------------------------------------

    pub fn register_entity(&self, profile: EntityProfile) -> Result<(), PipelineError> {
        self.store.register(profile)
    }

    pub fn ingest(&self, event: &DomainEvent) -> Result<Vec<AppliedSignal>, PipelineError> {
        self.ingest_at(event, Utc::now())
    }

    /// Classify a raw event and apply it to every entity it references.
    /// `received_at` stands in for a missing occurrence time.
    pub fn ingest_at(
        &self,
        event: &DomainEvent,
        received_at: DateTime<Utc>,
    ) -> Result<Vec<AppliedSignal>, PipelineError> {
        let signal = self.registry.classify(event, received_at)?;
        log::debug!(
            "ingest {} -> {}/{}/{}",
            event.event_type,
            signal.category,
            signal.weight,
            signal.polarity
        );
        let baselines: &BaselineStore = self.runner.baselines();
        self.store.apply_signal(&signal, Some(baselines))
    }

    /// Apply one already-classified signal by label.
    pub fn apply_signal(
        &self,
        entity: &EntityRef,
        category: &str,
        weight: &str,
        polarity: &str,
        occurred_at: DateTime<Utc>,
    ) -> Result<Arc<MaterializedSignalSummary>, PipelineError> {
        self.store
            .apply_labeled(entity, category, weight, polarity, occurred_at)
    }

    pub fn get_signal_summary(&self, entity: &EntityRef) -> Option<Arc<MaterializedSignalSummary>> {
        self.store.summary(entity)
    }

    pub fn get_portfolio_signals(
        &self,
        scope: &PortfolioScope,
        sort: PortfolioSort,
    ) -> Vec<Arc<MaterializedSignalSummary>> {
        self.store.portfolio(scope, sort)
    }

    pub fn clear_escalation(&self, entity: &EntityRef, rule_id: &str) -> Result<bool, PipelineError> {
        self.store.clear_escalation(entity, rule_id)
    }

    pub fn verify_window_counts(
        &self,
        entity: &EntityRef,
        as_of: DateTime<Utc>,
    ) -> Result<Vec<WindowMismatch>, PipelineError> {
        self.store.verify_window_counts(entity, as_of)
    }

    // -----------------------------------------------------------------------
    // Batch path
    // -----------------------------------------------------------------------

    pub async fn run_analysis(&self, methods: &[AnalysisMethod], as_of: DateTime<Utc>) -> CycleReport {
        self.runner.run_cycle(methods, as_of).await
    }

    pub fn due_methods(
        &self,
        last_runs: &BTreeMap<AnalysisMethod, DateTime<Utc>>,
        now: DateTime<Utc>,
    ) -> Result<Vec<AnalysisMethod>, PipelineError> {
        self.config.schedule.due_methods(last_runs, now)
    }

    // -----------------------------------------------------------------------
    // Routing, context, cost
    // -----------------------------------------------------------------------

    pub fn route(&self, task: &TaskDescriptor) -> RouteDecision {
        route(task, &self.config.router)
    }

    /// Assemble context packets from current snapshots of the request's targets.
    pub fn assemble(&self, request: &AssemblyRequest) -> Result<Assembly, PipelineError> {
        let snapshots: Vec<_> = request
            .targets
            .iter()
            .filter_map(|t| self.store.snapshot(t))
            .collect();
        self.assembler.assemble(request, &snapshots)
    }

    pub fn check_and_reserve(&self, scope: &str, tier: Tier, urgency: Urgency) -> CostDecision {
        self.cost.check_and_reserve(scope, tier, urgency)
    }

    pub fn drain_cost_alerts(&self) -> Vec<CostAlert> {
        self.cost.drain_alerts()
    }

    /// Dispatcher sharing this pipeline's store, assembler and cost ledger.
    pub fn dispatcher(&self, language: Arc<dyn LanguageCapability>) -> Dispatcher {
        Dispatcher::new(
            self.store.clone(),
            self.assembler.clone(),
            self.cost.clone(),
            self.config.router.clone(),
            language,
        )
    }

    // -----------------------------------------------------------------------
    // Persistence
    // -----------------------------------------------------------------------

    /// Rebuild summaries, activity, baselines, charts and the current cost
    /// period from the database. Returns the number of entities restored.
    pub fn restore(&self) -> Result<usize, PipelineError> {
        let Some(db) = &self.db else {
            return Ok(0);
        };
        let db = db.lock();
        let restored = self.store.restore(&db)?;
        self.runner.restore(&db)?;
        self.cost.restore(&db, Utc::now())?;
        Ok(restored)
    }
}
