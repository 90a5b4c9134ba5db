//! Bounded, task-specific context packets.
//!
//! Content is rendered at the least compressed stage that fits the budget:
//!
//! 0. every event with its raw payload
//! 1. one classification sentence per event, payloads dropped
//! 2. per-event detail only inside the recent window, older activity as
//!    monthly counts, activity past the retention horizon omitted (and
//!    listed as omitted) unless full history was requested
//! 3. categories outside the task's focus collapse to a single line
//! 4. split into several packets, by entity and then by category
//!
//! A section that cannot fit an empty packet fails with `BudgetExceeded`.
//! Nothing is truncated silently. Assembly reads snapshots only.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use sha2::{Digest, Sha256};

use super::budget::{default_profiles, estimate_tokens, resolve_budget, TaskProfile};
use crate::entity::EntityRef;
use crate::error::{PipelineError, ValidationError};
use crate::signals::bus::{Polarity, SignalWeight};
use crate::store::activity::{days_before, month_key, ActivityRecord};
use crate::store::summary::{CategoryCounters, MaterializedSignalSummary};
use crate::store::EntitySnapshot;
use crate::types::{ContextConfig, Tier, TierCeilings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompressionStage {
    Full,
    Summarized,
    RecencyBiased,
    TaskFocused,
    Split,
}

#[derive(Debug, Clone)]
pub struct AssemblyRequest {
    pub task_type: String,
    pub tier: Tier,
    pub targets: Vec<EntityRef>,
    pub goal: String,
    pub include_full_history: bool,
    pub as_of: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PacketSection {
    pub entity: EntityRef,
    pub heading: String,
    pub body: String,
}

impl PacketSection {
    fn render(&self) -> String {
        format!("{}\n{}", self.heading, self.body)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Omission {
    pub entity: EntityRef,
    pub category: String,
    pub count: usize,
    pub reason: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextPacket {
    /// SHA-256 of the rendered content and part position.
    pub id: String,
    pub task_type: String,
    pub tier: Tier,
    pub goal: String,
    pub budget_tokens: usize,
    pub estimated_tokens: usize,
    pub entities: Vec<EntityRef>,
    pub sections: Vec<PacketSection>,
    pub omissions: Vec<Omission>,
    pub stage: CompressionStage,
    pub part: usize,
    pub parts: usize,
    #[serde(skip)]
    preamble: String,
}

impl ContextPacket {
    /// The text handed to the language capability.
    pub fn render(&self) -> String {
        let mut out = self.preamble.clone();
        for section in &self.sections {
            out.push_str(&section.render());
        }
        out
    }
}

#[derive(Debug, Clone)]
pub struct Assembly {
    pub packets: Vec<ContextPacket>,
    pub stage: CompressionStage,
}

pub struct ContextAssembler {
    profiles: BTreeMap<String, TaskProfile>,
    config: ContextConfig,
    ceilings: TierCeilings,
}

impl ContextAssembler {
    pub fn new(config: ContextConfig, ceilings: TierCeilings) -> Self {
        Self {
            profiles: default_profiles(),
            config,
            ceilings,
        }
    }

    /// Add or replace a task profile.
    pub fn with_profile(mut self, profile: TaskProfile) -> Self {
        self.profiles.insert(profile.task_type.clone(), profile);
        self
    }

    pub fn profile(&self, task_type: &str) -> Option<&TaskProfile> {
        self.profiles.get(task_type)
    }

    pub fn assemble(
        &self,
        request: &AssemblyRequest,
        snapshots: &[EntitySnapshot],
    ) -> Result<Assembly, PipelineError> {
        let profile = self.profiles.get(&request.task_type).ok_or_else(|| {
            PipelineError::Config(format!("unknown context task type {}", request.task_type))
        })?;
        let budget = resolve_budget(profile, request.tier, &self.config, &self.ceilings)?;
        let targets: Vec<&EntitySnapshot> = request
            .targets
            .iter()
            .map(|t| {
                snapshots
                    .iter()
                    .find(|s| s.profile.entity == *t)
                    .ok_or_else(|| ValidationError::UnknownEntity(t.clone()))
            })
            .collect::<Result<_, _>>()?;

        let preamble = format!(
            "# task {} | tier {} | as of {}\ngoal: {}\n",
            request.task_type,
            request.tier,
            request.as_of.format("%Y-%m-%d"),
            request.goal
        );
        let cpt = self.config.chars_per_token;

        for stage in [
            CompressionStage::Full,
            CompressionStage::Summarized,
            CompressionStage::RecencyBiased,
            CompressionStage::TaskFocused,
        ] {
            if stage == CompressionStage::TaskFocused && profile.focus_categories.is_empty() {
                continue;
            }
            let (groups, omissions) = self.build_sections(stage, profile, request, &targets);
            let sections: Vec<PacketSection> = groups.into_iter().flatten().collect();
            let packet = self.packet(request, &preamble, budget, stage, sections, omissions, 1, 1);
            if packet.estimated_tokens <= budget {
                log::debug!(
                    "context {}: {} tokens of {} at stage {:?}",
                    request.task_type,
                    packet.estimated_tokens,
                    budget,
                    stage
                );
                return Ok(Assembly {
                    packets: vec![packet],
                    stage,
                });
            }
        }

        let (groups, omissions) =
            self.build_sections(CompressionStage::TaskFocused, profile, request, &targets);
        let packed = pack(groups, estimate_tokens(&preamble, cpt), budget, cpt)?;
        let parts = packed.len();
        let mut packets = Vec::with_capacity(parts);
        for (i, sections) in packed.into_iter().enumerate() {
            let entities: BTreeSet<&EntityRef> = sections.iter().map(|s| &s.entity).collect();
            let own: Vec<Omission> = omissions
                .iter()
                .filter(|o| entities.contains(&o.entity))
                .cloned()
                .collect();
            let packet = self.packet(
                request,
                &preamble,
                budget,
                CompressionStage::Split,
                sections,
                own,
                i + 1,
                parts,
            );
            if packet.estimated_tokens > budget {
                return Err(PipelineError::BudgetExceeded {
                    needed: packet.estimated_tokens,
                    budget,
                });
            }
            packets.push(packet);
        }
        log::info!(
            "context {}: split into {} packets of at most {} tokens",
            request.task_type,
            parts,
            budget
        );
        Ok(Assembly {
            packets,
            stage: CompressionStage::Split,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn packet(
        &self,
        request: &AssemblyRequest,
        preamble: &str,
        budget: usize,
        stage: CompressionStage,
        sections: Vec<PacketSection>,
        omissions: Vec<Omission>,
        part: usize,
        parts: usize,
    ) -> ContextPacket {
        let mut entities: Vec<EntityRef> = Vec::new();
        for s in &sections {
            if !entities.contains(&s.entity) {
                entities.push(s.entity.clone());
            }
        }
        let mut packet = ContextPacket {
            id: String::new(),
            task_type: request.task_type.clone(),
            tier: request.tier,
            goal: request.goal.clone(),
            budget_tokens: budget,
            estimated_tokens: 0,
            entities,
            sections,
            omissions,
            stage,
            part,
            parts,
            preamble: preamble.to_string(),
        };
        let rendered = packet.render();
        packet.estimated_tokens = estimate_tokens(&rendered, self.config.chars_per_token);
        let mut hasher = Sha256::new();
        hasher.update(rendered.as_bytes());
        hasher.update(format!("|{}/{}", part, parts).as_bytes());
        packet.id = hex::encode(hasher.finalize());
        packet
    }

    /// Sections per target entity (header first), plus what was left out.
    fn build_sections(
        &self,
        stage: CompressionStage,
        profile: &TaskProfile,
        request: &AssemblyRequest,
        targets: &[&EntitySnapshot],
    ) -> (Vec<Vec<PacketSection>>, Vec<Omission>) {
        let recent_start = days_before(request.as_of, self.config.recent_window_days);
        let retention_start = days_before(request.as_of, self.config.retention_days);
        let apply_retention =
            stage >= CompressionStage::RecencyBiased && !request.include_full_history;

        let mut groups = Vec::with_capacity(targets.len());
        let mut omissions = Vec::new();
        for snap in targets {
            let entity = &snap.profile.entity;
            let summary = &snap.summary;

            let mut by_category: BTreeMap<&str, Vec<&ActivityRecord>> = BTreeMap::new();
            for category in summary.categories.keys() {
                by_category.entry(category.as_str()).or_default();
            }
            for r in snap.activity.records() {
                if r.occurred_at <= request.as_of {
                    by_category.entry(r.category.as_str()).or_default().push(r);
                }
            }

            let mut own_omissions = Vec::new();
            let mut category_sections = Vec::new();
            for (category, mut records) in by_category {
                if apply_retention {
                    let dropped = records.partition_point(|r| r.occurred_at < retention_start);
                    if dropped > 0 {
                        own_omissions.push(Omission {
                            entity: entity.clone(),
                            category: category.to_string(),
                            count: dropped,
                            reason: format!(
                                "older than the {}-day retention horizon",
                                self.config.retention_days
                            ),
                        });
                        records.drain(..dropped);
                    }
                }

                let body = match stage {
                    CompressionStage::Full => records.iter().map(|r| full_line(r)).collect(),
                    CompressionStage::Summarized => {
                        records.iter().map(|r| brief_line(r)).collect()
                    }
                    CompressionStage::TaskFocused if !profile.is_focus(category) => summary
                        .categories
                        .get(category)
                        .map(counter_line)
                        .unwrap_or_default(),
                    _ => recency_body(&records, recent_start),
                };
                if body.is_empty() {
                    continue;
                }
                category_sections.push(PacketSection {
                    entity: entity.clone(),
                    heading: format!("### {}", category),
                    body,
                });
            }

            let mut group = Vec::with_capacity(category_sections.len() + 1);
            group.push(header_section(summary, profile, &own_omissions));
            group.extend(category_sections);
            groups.push(group);
            omissions.extend(own_omissions);
        }
        (groups, omissions)
    }
}

/// Greedy packing: whole entities where they fit, otherwise their sections
/// spill across packets one at a time.
fn pack(
    groups: Vec<Vec<PacketSection>>,
    preamble_tokens: usize,
    budget: usize,
    cpt: usize,
) -> Result<Vec<Vec<PacketSection>>, PipelineError> {
    let mut packets: Vec<Vec<PacketSection>> = Vec::new();
    let mut current: Vec<PacketSection> = Vec::new();
    let mut used = preamble_tokens;

    for group in groups {
        let sized: Vec<(usize, PacketSection)> = group
            .into_iter()
            .map(|s| (estimate_tokens(&s.render(), cpt), s))
            .collect();
        for (tokens, _) in &sized {
            if preamble_tokens + tokens > budget {
                return Err(PipelineError::BudgetExceeded {
                    needed: preamble_tokens + tokens,
                    budget,
                });
            }
        }
        let group_tokens: usize = sized.iter().map(|(t, _)| t).sum();

        if used + group_tokens <= budget {
            used += group_tokens;
            current.extend(sized.into_iter().map(|(_, s)| s));
            continue;
        }
        if preamble_tokens + group_tokens <= budget {
            if !current.is_empty() {
                packets.push(std::mem::take(&mut current));
            }
            used = preamble_tokens + group_tokens;
            current.extend(sized.into_iter().map(|(_, s)| s));
            continue;
        }
        for (tokens, section) in sized {
            if used + tokens > budget && !current.is_empty() {
                packets.push(std::mem::take(&mut current));
                used = preamble_tokens;
            }
            used += tokens;
            current.push(section);
        }
    }
    if !current.is_empty() {
        packets.push(current);
    }
    Ok(packets)
}

// ---------------------------------------------------------------------------
// Rendering
// ---------------------------------------------------------------------------

fn full_line(r: &ActivityRecord) -> String {
    let payload = if r.payload.is_null() {
        String::new()
    } else {
        format!(" {}", r.payload)
    };
    format!(
        "- {} {} {}/{}{}\n",
        r.occurred_at.format("%Y-%m-%d %H:%M"),
        r.event_type,
        r.weight,
        r.polarity,
        payload
    )
}

fn brief_line(r: &ActivityRecord) -> String {
    format!(
        "- {} {}: {} {} signal\n",
        r.occurred_at.format("%Y-%m-%d"),
        r.event_type,
        r.weight,
        r.polarity
    )
}

fn breakdown<I>(marks: I) -> String
where
    I: IntoIterator<Item = (SignalWeight, Polarity, u64)>,
{
    let mut counts: BTreeMap<(std::cmp::Reverse<SignalWeight>, Polarity), u64> = BTreeMap::new();
    for (w, p, n) in marks {
        if n > 0 {
            *counts.entry((std::cmp::Reverse(w), p)).or_insert(0) += n;
        }
    }
    counts
        .into_iter()
        .map(|((w, p), n)| format!("{} {} {}", n, w.0, p))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Recent records one per line, everything older as monthly counts.
fn recency_body(records: &[&ActivityRecord], recent_start: DateTime<Utc>) -> String {
    let split = records.partition_point(|r| r.occurred_at < recent_start);
    let (older, recent) = records.split_at(split);

    let mut months: BTreeMap<(i32, u32), Vec<&ActivityRecord>> = BTreeMap::new();
    for r in older {
        months.entry(month_key(r.occurred_at)).or_default().push(r);
    }
    let mut body = String::new();
    for ((year, month), recs) in months {
        body.push_str(&format!(
            "- {}-{:02}: {} signal(s), {}\n",
            year,
            month,
            recs.len(),
            breakdown(recs.iter().map(|r| (r.weight, r.polarity, 1)))
        ));
    }
    for r in recent {
        body.push_str(&brief_line(r));
    }
    body
}

fn counter_line(c: &CategoryCounters) -> String {
    let marks = SignalWeight::ALL
        .into_iter()
        .flat_map(|w| Polarity::ALL.into_iter().map(move |p| (w, p, c.count(w, p))));
    let trend = c
        .trend
        .map(|t| format!(", trend {:?}", t).to_lowercase())
        .unwrap_or_default();
    let last = c
        .last_signal_at
        .map(|t| format!(", last {}", t.format("%Y-%m-%d")))
        .unwrap_or_default();
    format!(
        "- {} signal(s), {}; score {:.1}{}{}\n",
        c.total,
        breakdown(marks),
        c.score,
        trend,
        last
    )
}

fn header_section(
    summary: &MaterializedSignalSummary,
    profile: &TaskProfile,
    omissions: &[Omission],
) -> PacketSection {
    let mut body = String::new();
    for e in &summary.escalations {
        body.push_str(&format!(
            "- escalation {} ({}) since {}: {}\n",
            e.rule_id,
            e.severity,
            e.triggered_at.format("%Y-%m-%d"),
            e.recommended_action
        ));
    }
    if profile.include_anomalies {
        for a in &summary.anomalies {
            body.push_str(&format!("- anomaly: {}\n", a.description));
        }
    }
    for (metric, pct) in &summary.cohort_percentiles {
        body.push_str(&format!("- {} percentile in segment: {:.0}\n", metric, pct));
    }
    if profile.include_model_outputs {
        for (model, output) in &summary.model_outputs {
            body.push_str(&format!("- model {}: {:.3}\n", model, output.value));
        }
    }
    for o in omissions {
        body.push_str(&format!(
            "- omitted {} {} signal(s) {}\n",
            o.count, o.category, o.reason
        ));
    }
    PacketSection {
        entity: summary.entity.clone(),
        heading: format!(
            "## {} | sentiment {} ({:.2}) | {} signals",
            summary.entity, summary.sentiment, summary.sentiment_score, summary.signal_count
        ),
        body,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{EntityProfile, EntityType};
    use crate::signals::bus::SignalEvent;
    use crate::signals::rules::RuleTable;
    use crate::store::SummaryStore;
    use crate::types::SentimentConfig;
    use chrono::{Duration, TimeZone};
    use std::sync::Arc;

    fn as_of() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 6, 30, 12, 0, 0).unwrap()
    }

    fn store() -> SummaryStore {
        SummaryStore::new(
            Arc::new(RuleTable::new(vec![]).expect("rules")),
            SentimentConfig::default(),
            20,
            None,
        )
    }

    fn person(id: &str) -> EntityRef {
        EntityRef::new(EntityType::Person, id)
    }

    fn emit(store: &SummaryStore, entity: &EntityRef, id: String, event_type: &str, days_ago: i64) {
        let signal = SignalEvent {
            id,
            event_type: event_type.to_string(),
            occurred_at: as_of() - Duration::days(days_ago),
            entity_refs: vec![entity.clone()],
            category: "financial".to_string(),
            weight: SignalWeight::Strong,
            polarity: Polarity::Negative,
            payload: serde_json::json!({
                "note": "Resident called about the ledger balance and disputed the late fee posted last cycle"
            }),
            observations: Vec::new(),
        };
        store.apply_signal(&signal, None).expect("apply");
    }

    /// 600 older payment events spread over ~10 months plus 5 recent ones.
    fn heavy_history(store: &SummaryStore, entity: &EntityRef) {
        store.register(EntityProfile::new(entity.clone())).expect("register");
        for i in 0..600 {
            emit(store, entity, format!("{}-old-{}", entity, i), "late_payment", 35 + i / 2);
        }
        for i in 0..5 {
            emit(store, entity, format!("{}-new-{}", entity, i), "recent_marker", i + 1);
        }
    }

    fn request(task_type: &str, tier: Tier, targets: Vec<EntityRef>) -> AssemblyRequest {
        AssemblyRequest {
            task_type: task_type.to_string(),
            tier,
            targets,
            goal: "draft a payment plan offer".to_string(),
            include_full_history: false,
            as_of: as_of(),
        }
    }

    #[test]
    fn test_small_budget_keeps_recent_detail() {
        let store = store();
        let p = person("p-1");
        heavy_history(&store, &p);
        let snaps = vec![store.snapshot(&p).expect("snapshot")];
        let assembler = ContextAssembler::new(ContextConfig::default(), TierCeilings::default());

        let roomy = assembler
            .assemble(&request("strategy_review", Tier::LanguagePremium, vec![p.clone()]), &snaps)
            .expect("assemble");
        assert_eq!(roomy.stage, CompressionStage::Full);
        assert!(roomy.packets[0].estimated_tokens >= 10_000, "candidate content is large");

        let tight = assembler
            .assemble(&request("outreach_draft", Tier::LanguageLight, vec![p.clone()]), &snaps)
            .expect("assemble");
        assert_eq!(tight.packets.len(), 1);
        let packet = &tight.packets[0];
        assert!(packet.estimated_tokens <= 2_000);
        assert_eq!(packet.budget_tokens, 2_000);
        assert_eq!(tight.stage, CompressionStage::RecencyBiased);

        let text = packet.render();
        assert_eq!(text.matches("recent_marker").count(), 5, "recent events stay itemized");
        assert!(!text.contains("late_payment"), "older events are counted, not listed");
        assert!(text.contains("signal(s)"));
    }

    #[test]
    fn test_retention_omission_is_declared() {
        let store = store();
        let p = person("p-1");
        store.register(EntityProfile::new(p.clone())).expect("register");
        for i in 0..400 {
            emit(&store, &p, format!("old-{}", i), "late_payment", 400 + i);
        }
        emit(&store, &p, "new".to_string(), "recent_marker", 2);
        let snaps = vec![store.snapshot(&p).expect("snapshot")];
        let assembler = ContextAssembler::new(ContextConfig::default(), TierCeilings::default());

        let mut req = request("outreach_draft", Tier::LanguageLight, vec![p.clone()]);
        let assembly = assembler.assemble(&req, &snaps).expect("assemble");
        let packet = &assembly.packets[0];
        assert_eq!(packet.omissions.len(), 1);
        assert_eq!(packet.omissions[0].count, 400);
        assert!(packet.render().contains("omitted 400 financial"));

        req.include_full_history = true;
        req.task_type = "intervention_plan".to_string();
        req.tier = Tier::LanguageStandard;
        let full = assembler.assemble(&req, &snaps).expect("assemble");
        assert!(full.packets.iter().all(|p| p.omissions.is_empty()));
    }

    #[test]
    fn test_split_across_packets_within_budget() {
        let store = store();
        let targets: Vec<EntityRef> = (0..3).map(|i| person(&format!("p-{}", i))).collect();
        for t in &targets {
            store.register(EntityProfile::new(t.clone())).expect("register");
            for i in 0..8 {
                emit(&store, t, format!("{}-{}", t, i), "recent_marker", i + 1);
            }
        }
        let snaps: Vec<EntitySnapshot> =
            targets.iter().filter_map(|t| store.snapshot(t)).collect();
        let mut config = ContextConfig::default();
        config.task_budgets.insert("outreach_draft".to_string(), 300);
        let assembler = ContextAssembler::new(config, TierCeilings::default());

        let assembly = assembler
            .assemble(&request("outreach_draft", Tier::LanguageLight, targets.clone()), &snaps)
            .expect("assemble");
        assert_eq!(assembly.stage, CompressionStage::Split);
        assert!(assembly.packets.len() > 1);
        let mut covered = Vec::new();
        for packet in &assembly.packets {
            assert!(packet.estimated_tokens <= 300);
            assert_eq!(packet.parts, assembly.packets.len());
            covered.extend(packet.entities.clone());
        }
        assert_eq!(covered, targets, "every entity lands in exactly one packet");
        let total: usize = assembly
            .packets
            .iter()
            .map(|p| p.render().matches("recent_marker").count())
            .sum();
        assert_eq!(total, 24, "splitting drops nothing");
    }

    #[test]
    fn test_unsplittable_section_fails() {
        let store = store();
        let p = person("p-1");
        store.register(EntityProfile::new(p.clone())).expect("register");
        for i in 0..200 {
            emit(&store, &p, format!("s-{}", i), "recent_marker", i % 20 + 1);
        }
        let snaps = vec![store.snapshot(&p).expect("snapshot")];
        let mut config = ContextConfig::default();
        config.task_budgets.insert("outreach_draft".to_string(), 300);
        let assembler = ContextAssembler::new(config, TierCeilings::default());
        let err = assembler
            .assemble(&request("outreach_draft", Tier::LanguageLight, vec![p]), &snaps)
            .unwrap_err();
        assert!(matches!(err, PipelineError::BudgetExceeded { budget: 300, .. }));
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let store = store();
        let p = person("p-1");
        heavy_history(&store, &p);
        let snaps = vec![store.snapshot(&p).expect("snapshot")];
        let assembler = ContextAssembler::new(ContextConfig::default(), TierCeilings::default());
        let req = request("outreach_draft", Tier::LanguageLight, vec![p]);
        let a = assembler.assemble(&req, &snaps).expect("assemble");
        let b = assembler.assemble(&req, &snaps).expect("assemble");
        assert_eq!(a.packets[0].id, b.packets[0].id);
        assert_eq!(a.packets[0].id.len(), 64);
    }

    #[test]
    fn test_unknown_target_rejected() {
        let assembler = ContextAssembler::new(ContextConfig::default(), TierCeilings::default());
        let err = assembler
            .assemble(&request("outreach_draft", Tier::LanguageLight, vec![person("ghost")]), &[])
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }
}
