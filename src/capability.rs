//! External capabilities and the dispatch path that calls them.
//!
//! Dispatch runs route → model scoring → context assembly → cost reservation
//! → language invocation → delivery. The language call is the only await on
//! an external service and happens strictly after assembly. Nothing is
//! queued or sent until a call succeeds, so a timed-out or abandoned call
//! leaves nothing to undo.
//!
//! Retry policy follows idempotency: scoring and plain responses are reads
//! and retry with exponential backoff; drafted outreach and intervention
//! plans are never retried and land in the human review queue on failure.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::context::{AssemblyRequest, ContextAssembler, ContextPacket};
use crate::cost::{CostDecision, CostGuard, Urgency};
use crate::entity::EntityRef;
use crate::error::{PipelineError, ValidationError};
use crate::routing::{route, Delivery, RouteDecision, TaskDescriptor, TaskOrigin};
use crate::signals::rules::Severity;
use crate::store::summary::{FeatureWeight, ModelOutput};
use crate::store::{EntitySnapshot, SummaryStore};
use crate::types::{RouterConfig, Tier};

// ============================================================================
// Capability interfaces
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelScore {
    pub value: f64,
    pub feature_importance: Vec<FeatureWeight>,
}

/// A trained scoring model. Calls are read-only and safe to retry.
#[async_trait]
pub trait ModelScorer: Send + Sync {
    fn model_id(&self) -> &str;

    async fn score(&self, snapshot: &EntitySnapshot) -> Result<ModelScore, PipelineError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", tag = "kind", content = "content")]
pub enum Generation {
    Text(String),
    /// Structured intervention plan.
    Plan(serde_json::Value),
}

/// A language-model tier. Whether a call may be retried is decided by the
/// dispatcher, not the implementation.
#[async_trait]
pub trait LanguageCapability: Send + Sync {
    async fn invoke(&self, tier: Tier, packet: &ContextPacket) -> Result<Generation, PipelineError>;
}

// ============================================================================
// Retry
// ============================================================================

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    /// Per-attempt timeout.
    pub timeout_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 250,
            max_backoff_ms: 2_000,
            timeout_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    /// Single attempt, same timeout.
    pub fn no_retry(&self) -> Self {
        Self {
            max_attempts: 1,
            ..self.clone()
        }
    }

    fn delay(&self, attempt: u32) -> Duration {
        let exponent = 2u64.saturating_pow(attempt.saturating_sub(1));
        Duration::from_millis(
            self.initial_backoff_ms
                .saturating_mul(exponent)
                .min(self.max_backoff_ms),
        )
    }
}

/// Run `call` under the policy's timeout, retrying retryable failures with
/// exponential backoff. Timeouts count as retryable.
pub async fn call_with_retry<T, F, Fut>(
    capability: &str,
    policy: &RetryPolicy,
    mut call: F,
) -> Result<T, PipelineError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, PipelineError>>,
{
    let attempts = policy.max_attempts.max(1);
    let mut last_err = None;
    for attempt in 1..=attempts {
        let result =
            match tokio::time::timeout(Duration::from_millis(policy.timeout_ms), call()).await {
                Ok(r) => r,
                Err(_) => Err(PipelineError::DownstreamUnavailable {
                    capability: capability.to_string(),
                    reason: format!("timed out after {}ms", policy.timeout_ms),
                    retryable: true,
                }),
            };
        match result {
            Ok(v) => return Ok(v),
            Err(e) if e.is_retryable() && attempt < attempts => {
                let delay = policy.delay(attempt);
                log::warn!(
                    "{} retry {}/{} after: {} (sleep {:?})",
                    capability,
                    attempt,
                    attempts,
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
                last_err = Some(e);
            }
            Err(e) => return Err(e),
        }
    }
    Err(last_err.unwrap_or_else(|| PipelineError::DownstreamUnavailable {
        capability: capability.to_string(),
        reason: "exhausted retries".to_string(),
        retryable: true,
    }))
}

// ============================================================================
// Human review and outbound delivery
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReviewKind {
    /// A successful draft or plan awaiting approval.
    Approval,
    /// A non-retryable call that failed; a person decides what happens next.
    FailedCall,
    ManagerNotification,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewItem {
    pub id: String,
    pub kind: ReviewKind,
    pub entities: Vec<EntityRef>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
    pub note: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
pub struct HumanReviewQueue {
    items: Mutex<Vec<ReviewItem>>,
}

impl HumanReviewQueue {
    fn push(
        &self,
        kind: ReviewKind,
        entities: &[EntityRef],
        task_type: Option<&str>,
        generation: Option<Generation>,
        note: String,
    ) -> String {
        let id = Uuid::new_v4().to_string();
        self.items.lock().push(ReviewItem {
            id: id.clone(),
            kind,
            entities: entities.to_vec(),
            task_type: task_type.map(str::to_string),
            generation,
            note,
            created_at: Utc::now(),
        });
        id
    }

    pub fn pending(&self) -> Vec<ReviewItem> {
        self.items.lock().clone()
    }

    pub fn pending_of(&self, kind: ReviewKind) -> Vec<ReviewItem> {
        self.items.lock().iter().filter(|i| i.kind == kind).cloned().collect()
    }

    /// Remove an item once a person has acted on it.
    pub fn resolve(&self, id: &str) -> Option<ReviewItem> {
        let mut items = self.items.lock();
        let pos = items.iter().position(|i| i.id == id)?;
        Some(items.remove(pos))
    }

    pub fn len(&self) -> usize {
        self.items.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutboundMessage {
    pub id: String,
    pub entities: Vec<EntityRef>,
    pub body: Generation,
    pub queued_at: DateTime<Utc>,
}

/// Auto-send queue drained by the delivery integration.
#[derive(Debug, Default)]
pub struct Outbox {
    messages: Mutex<Vec<OutboundMessage>>,
}

impl Outbox {
    fn push(&self, entities: &[EntityRef], body: Generation) {
        self.messages.lock().push(OutboundMessage {
            id: Uuid::new_v4().to_string(),
            entities: entities.to_vec(),
            body,
            queued_at: Utc::now(),
        });
    }

    pub fn drain(&self) -> Vec<OutboundMessage> {
        std::mem::take(&mut *self.messages.lock())
    }

    pub fn len(&self) -> usize {
        self.messages.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.lock().is_empty()
    }
}

// ============================================================================
// Dispatcher
// ============================================================================

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase", tag = "outcome")]
pub enum DispatchOutcome {
    NoAction,
    /// Resolved without a language call (rule engine, classifier output,
    /// materialized data).
    Handled { decision: RouteDecision },
    Deferred {
        decision: RouteDecision,
        resume_at: DateTime<Utc>,
    },
    Completed {
        decision: RouteDecision,
        generations: Vec<Generation>,
        /// Review item ids created for approval or manager notification.
        review_items: Vec<String>,
    },
}

pub struct Dispatcher {
    store: Arc<SummaryStore>,
    assembler: Arc<ContextAssembler>,
    cost: Arc<CostGuard>,
    router: RouterConfig,
    language: Arc<dyn LanguageCapability>,
    scorer: Option<Arc<dyn ModelScorer>>,
    review: Arc<HumanReviewQueue>,
    outbox: Arc<Outbox>,
    policy: RetryPolicy,
}

/// Cost urgency implied by a task and its route.
pub fn urgency_for(task: &TaskDescriptor) -> Urgency {
    if task.origin == TaskOrigin::Human {
        return Urgency::HumanInitiated;
    }
    if task
        .escalation
        .is_some_and(|e| e.effective_severity() == Severity::Critical)
    {
        return Urgency::CriticalEscalation;
    }
    match task.origin {
        TaskOrigin::Scheduled => Urgency::Background,
        _ => Urgency::Routine,
    }
}

impl Dispatcher {
    pub fn new(
        store: Arc<SummaryStore>,
        assembler: Arc<ContextAssembler>,
        cost: Arc<CostGuard>,
        router: RouterConfig,
        language: Arc<dyn LanguageCapability>,
    ) -> Self {
        Self {
            store,
            assembler,
            cost,
            router,
            language,
            scorer: None,
            review: Arc::new(HumanReviewQueue::default()),
            outbox: Arc::new(Outbox::default()),
            policy: RetryPolicy::default(),
        }
    }

    pub fn with_scorer(mut self, scorer: Arc<dyn ModelScorer>) -> Self {
        self.scorer = Some(scorer);
        self
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn review_queue(&self) -> &Arc<HumanReviewQueue> {
        &self.review
    }

    pub fn outbox(&self) -> &Arc<Outbox> {
        &self.outbox
    }

    /// Cost scope for a set of targets: the first target's property, else
    /// the target itself, else the whole portfolio.
    fn scope_for(&self, targets: &[EntityRef]) -> String {
        let Some(first) = targets.first() else {
            return "portfolio".to_string();
        };
        self.store
            .profile(first)
            .and_then(|p| p.property_id)
            .unwrap_or_else(|| first.to_string())
    }

    pub async fn dispatch(&self, task: &TaskDescriptor) -> Result<DispatchOutcome, PipelineError> {
        self.dispatch_at(task, Utc::now()).await
    }

    pub async fn dispatch_at(
        &self,
        task: &TaskDescriptor,
        now: DateTime<Utc>,
    ) -> Result<DispatchOutcome, PipelineError> {
        let decision = route(task, &self.router);
        log::debug!(
            "Dispatch: {:?} -> {} ({})",
            decision.rule,
            decision.tier,
            decision.reason
        );
        if decision.tier == Tier::NoOp {
            return Ok(DispatchOutcome::NoAction);
        }
        if !decision.needs_language() {
            return Ok(DispatchOutcome::Handled { decision });
        }

        let urgency = urgency_for(task);
        let scope = self.scope_for(&task.targets);

        if decision.chain.contains(&Tier::Model) {
            self.score_targets(&scope, urgency, &task.targets, now).await;
        }

        // Assembly reads snapshots taken after scoring so model outputs are included.
        let targets = if task.targets.is_empty() {
            self.store.entities()
        } else {
            task.targets.clone()
        };
        let snapshots = targets
            .iter()
            .map(|t| {
                self.store
                    .snapshot(t)
                    .ok_or_else(|| ValidationError::UnknownEntity(t.clone()))
            })
            .collect::<Result<Vec<_>, _>>()?;
        let task_type = decision
            .task_type
            .clone()
            .unwrap_or_else(|| "portfolio_synthesis".to_string());
        let request = AssemblyRequest {
            task_type: task_type.clone(),
            tier: decision.tier,
            targets,
            goal: task
                .request_text
                .clone()
                .unwrap_or_else(|| decision.reason.clone()),
            include_full_history: false,
            as_of: now,
        };
        let assembly = self.assembler.assemble(&request, &snapshots)?;

        // One call per packet, reserved together so a split task never pays
        // for a partial run.
        let units = assembly.packets.len() as u64;
        match self
            .cost
            .check_and_reserve_n_at(&scope, decision.tier, urgency, units, now)
        {
            CostDecision::Allow { .. } => {}
            CostDecision::Defer { resume_at } => {
                log::info!("Dispatch: {} deferred until {}", task_type, resume_at);
                return Ok(DispatchOutcome::Deferred {
                    decision,
                    resume_at,
                });
            }
            CostDecision::Reject { reason } => {
                log::warn!("Dispatch: {} rejected: {}", task_type, reason);
                return Err(PipelineError::CostLimitReached {
                    scope,
                    tier: decision.tier.as_str().to_string(),
                    hard: true,
                });
            }
        }

        // Drafts and plans have side effects downstream of a successful call.
        let drafting = decision.delivery != Delivery::Respond;
        let policy = if drafting {
            self.policy.no_retry()
        } else {
            self.policy.clone()
        };

        let mut generations = Vec::with_capacity(assembly.packets.len());
        for packet in &assembly.packets {
            let language = self.language.clone();
            let tier = decision.tier;
            let result = call_with_retry(tier.as_str(), &policy, || {
                let language = language.clone();
                async move { language.invoke(tier, packet).await }
            })
            .await;
            match result {
                Ok(g) => generations.push(g),
                Err(e) if drafting => {
                    let id = self.review.push(
                        ReviewKind::FailedCall,
                        &request.targets,
                        Some(&task_type),
                        None,
                        format!("{} failed: {}", task_type, e),
                    );
                    log::warn!("Dispatch: {} failed, queued for review as {}", task_type, id);
                    return Err(PipelineError::DownstreamUnavailable {
                        capability: tier.as_str().to_string(),
                        reason: e.to_string(),
                        retryable: false,
                    });
                }
                Err(e) => return Err(e),
            }
        }

        let mut review_items = Vec::new();
        match decision.delivery {
            Delivery::ApprovalQueue => {
                for g in &generations {
                    review_items.push(self.review.push(
                        ReviewKind::Approval,
                        &request.targets,
                        Some(&task_type),
                        Some(g.clone()),
                        decision.reason.clone(),
                    ));
                }
            }
            Delivery::AutoSend => {
                for g in &generations {
                    self.outbox.push(&request.targets, g.clone());
                }
            }
            Delivery::Respond | Delivery::None => {}
        }
        if decision.notify_manager {
            review_items.push(self.review.push(
                ReviewKind::ManagerNotification,
                &request.targets,
                Some(&task_type),
                None,
                decision.reason.clone(),
            ));
        }

        Ok(DispatchOutcome::Completed {
            decision,
            generations,
            review_items,
        })
    }

    /// Score each target and store the output. Failures are logged and the
    /// drafting step continues without a score.
    async fn score_targets(
        &self,
        scope: &str,
        urgency: Urgency,
        targets: &[EntityRef],
        now: DateTime<Utc>,
    ) {
        let Some(scorer) = &self.scorer else { return };
        for target in targets {
            let Some(snapshot) = self.store.snapshot(target) else {
                continue;
            };
            if !self
                .cost
                .check_and_reserve_at(scope, Tier::Model, urgency, now)
                .is_allowed()
            {
                log::warn!("Dispatch: model scoring for {} skipped by cost guard", target);
                continue;
            }
            let result = call_with_retry(scorer.model_id(), &self.policy, || {
                let scorer = scorer.clone();
                let snapshot = &snapshot;
                async move { scorer.score(snapshot).await }
            })
            .await;
            match result {
                Ok(score) => {
                    let output = ModelOutput {
                        model_id: scorer.model_id().to_string(),
                        value: score.value,
                        feature_importance: score.feature_importance,
                        scored_at: now,
                    };
                    if let Err(e) = self.store.update_derived(target, |s| {
                        s.model_outputs.insert(output.model_id.clone(), output);
                    }) {
                        log::warn!("Dispatch: failed to store model output for {}: {}", target, e);
                    }
                }
                Err(e) => log::warn!("Dispatch: scoring {} failed: {}", target, e),
            }
        }
    }
}
