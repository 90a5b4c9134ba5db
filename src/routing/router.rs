//! Deterministic capability-tier router.
//!
//! Priority-ordered rules, first match wins:
//!
//! 1. No escalation and no explicit request: nothing to do.
//! 2. Informational escalation: summary update only (rule engine).
//! 3. Outreach escalation: model scoring, then the cheapest language tier
//!    drafts, delivered through the approval queue or auto-send policy.
//! 4. Critical or cross-category escalation: mid language tier plans the
//!    intervention and the manager is notified.
//! 5. Text classification: trust the classifier above the confidence
//!    threshold, otherwise the cheapest language tier.
//! 6. Human free text: routed by intent; unmatched goes to the mid tier.
//!
//! A cross-category escalation is treated as critical whatever its
//! configured severity, so rule 4 handles it rather than rules 2 or 3.

use serde::{Deserialize, Serialize};

use super::intent::{self, Intent};
use crate::entity::EntityRef;
use crate::signals::rules::{ActiveEscalation, Severity};
use crate::store::summary::MaterializedSignalSummary;
use crate::types::{RouterConfig, Tier};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskOrigin {
    Event,
    Scheduled,
    Human,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    EscalationFollowUp,
    TextClassification,
    FreeText,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EscalationContext {
    pub severity: Severity,
    pub cross_category: bool,
}

impl EscalationContext {
    /// Severity after cross-category elevation.
    pub fn effective_severity(&self) -> Severity {
        if self.cross_category {
            Severity::Critical
        } else {
            self.severity
        }
    }
}

impl From<&ActiveEscalation> for EscalationContext {
    fn from(e: &ActiveEscalation) -> Self {
        Self {
            severity: e.severity,
            cross_category: e.cross_category,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskDescriptor {
    pub origin: TaskOrigin,
    pub kind: TaskKind,
    #[serde(default)]
    pub targets: Vec<EntityRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub escalation: Option<EscalationContext>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub classifier_confidence: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_text: Option<String>,
    #[serde(default)]
    pub explicit_request: bool,
}

impl TaskDescriptor {
    /// Follow-up for the most severe active escalation on a summary, or a
    /// task with no escalation when none is active.
    pub fn from_summary(summary: &MaterializedSignalSummary, origin: TaskOrigin) -> Self {
        Self {
            origin,
            kind: TaskKind::EscalationFollowUp,
            targets: vec![summary.entity.clone()],
            escalation: summary.top_escalation().map(EscalationContext::from),
            classifier_confidence: None,
            request_text: None,
            explicit_request: false,
        }
    }

    pub fn classification(target: EntityRef, confidence: Option<f64>) -> Self {
        Self {
            origin: TaskOrigin::Event,
            kind: TaskKind::TextClassification,
            targets: vec![target],
            escalation: None,
            classifier_confidence: confidence,
            request_text: None,
            explicit_request: true,
        }
    }

    pub fn human_request(text: impl Into<String>, targets: Vec<EntityRef>) -> Self {
        Self {
            origin: TaskOrigin::Human,
            kind: TaskKind::FreeText,
            targets,
            escalation: None,
            classifier_confidence: None,
            request_text: Some(text.into()),
            explicit_request: true,
        }
    }

    fn has_request(&self) -> bool {
        self.explicit_request || self.request_text.is_some() || self.kind != TaskKind::EscalationFollowUp
    }
}

/// How an outcome reaches people.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Delivery {
    None,
    ApprovalQueue,
    AutoSend,
    Respond,
}

/// Which priority rule decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RouteRule {
    NoAction,
    Informational,
    Outreach,
    Critical,
    Classification,
    FreeText,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RouteDecision {
    /// The tier that produces the final outcome.
    pub tier: Tier,
    /// Every capability invoked, in order.
    pub chain: Vec<Tier>,
    pub rule: RouteRule,
    pub reason: String,
    pub delivery: Delivery,
    pub notify_manager: bool,
    /// Context task profile for the language step, if there is one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub task_type: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub intent: Option<Intent>,
}

impl RouteDecision {
    fn new(tier: Tier, rule: RouteRule, reason: impl Into<String>) -> Self {
        Self {
            tier,
            chain: vec![tier],
            rule,
            reason: reason.into(),
            delivery: Delivery::None,
            notify_manager: false,
            task_type: None,
            intent: None,
        }
    }

    fn with_chain(mut self, chain: Vec<Tier>) -> Self {
        self.chain = chain;
        self
    }

    fn with_delivery(mut self, delivery: Delivery) -> Self {
        self.delivery = delivery;
        self
    }

    fn with_task(mut self, task_type: &str) -> Self {
        self.task_type = Some(task_type.to_string());
        self
    }

    pub fn needs_language(&self) -> bool {
        self.chain.iter().any(Tier::is_language)
    }
}

/// Pick a tier for a task. Pure: the same descriptor and config always
/// produce the same decision.
pub fn route(task: &TaskDescriptor, config: &RouterConfig) -> RouteDecision {
    // 1
    if task.escalation.is_none() && !task.has_request() {
        return RouteDecision::new(Tier::NoOp, RouteRule::NoAction, "no escalation and no request");
    }

    if let Some(escalation) = task.escalation {
        match escalation.effective_severity() {
            // 2
            Severity::Informational => {
                return RouteDecision::new(
                    Tier::RuleEngine,
                    RouteRule::Informational,
                    "informational escalation, summary update only",
                );
            }
            // 3
            Severity::Outreach => {
                let delivery = if config.auto_send_outreach {
                    Delivery::AutoSend
                } else {
                    Delivery::ApprovalQueue
                };
                return RouteDecision::new(
                    Tier::LanguageLight,
                    RouteRule::Outreach,
                    "outreach escalation: score, then draft with the cheapest language tier",
                )
                .with_chain(vec![Tier::Model, Tier::LanguageLight])
                .with_delivery(delivery)
                .with_task("outreach_draft");
            }
            // 4
            Severity::Critical => {
                let reason = if escalation.cross_category {
                    "cross-category escalation: intervention plan with manager notification"
                } else {
                    "critical escalation: intervention plan with manager notification"
                };
                let mut decision =
                    RouteDecision::new(Tier::LanguageStandard, RouteRule::Critical, reason)
                        .with_delivery(Delivery::ApprovalQueue)
                        .with_task("intervention_plan");
                decision.notify_manager = true;
                return decision;
            }
        }
    }

    // 5
    if task.kind == TaskKind::TextClassification {
        let confidence = task.classifier_confidence.unwrap_or(0.0);
        return if confidence >= config.classifier_confidence_threshold {
            RouteDecision::new(
                Tier::Model,
                RouteRule::Classification,
                format!(
                    "classifier confidence {:.2} meets threshold {:.2}",
                    confidence, config.classifier_confidence_threshold
                ),
            )
        } else {
            RouteDecision::new(
                Tier::LanguageLight,
                RouteRule::Classification,
                format!(
                    "classifier confidence {:.2} below threshold {:.2}",
                    confidence, config.classifier_confidence_threshold
                ),
            )
            .with_task("message_classification")
        };
    }

    // 6
    let text = task.request_text.as_deref().unwrap_or("");
    let intent = intent::classify(text);
    let mut decision = match intent {
        Some(Intent::DataQuery) => {
            RouteDecision::new(Tier::RuleEngine, RouteRule::FreeText, "data query, answered from stored data")
        }
        Some(Intent::Synthesis) => {
            RouteDecision::new(Tier::LanguageStandard, RouteRule::FreeText, "synthesis request")
                .with_task("portfolio_synthesis")
        }
        Some(Intent::Strategy) => RouteDecision::new(
            Tier::LanguagePremium,
            RouteRule::FreeText,
            "high-stakes strategy request",
        )
        .with_task("strategy_review"),
        Some(Intent::Drafting) => {
            RouteDecision::new(Tier::LanguageLight, RouteRule::FreeText, "drafting request")
                .with_delivery(Delivery::ApprovalQueue)
                .with_task("outreach_draft")
        }
        None => RouteDecision::new(
            Tier::LanguageStandard,
            RouteRule::FreeText,
            "unmatched request, default to the mid tier",
        )
        .with_task("portfolio_synthesis"),
    };
    if decision.delivery == Delivery::None && decision.tier != Tier::NoOp {
        decision.delivery = Delivery::Respond;
    }
    decision.intent = intent;
    decision
}
