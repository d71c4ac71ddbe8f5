//! Capability-based worker matching.
//!
//! `CapabilityMatcher::score` rates how well a worker fits a task as a
//! weighted sum of five sub-scores:
//!
//! | sub-score          | weight |
//! |--------------------|--------|
//! | skill match        | 40%    |
//! | confidence         | 25%    |
//! | domain efficiency  | 20%    |
//! | free capacity      | 10%    |
//! | priority alignment | 5%     |
//!
//! Checkpoint-only workers (reviewers, QA) are excluded outright from tasks
//! that are neither checkpoints nor titled like testing/review work.

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::LazyLock;

use crate::core::task::{Priority, TaskNode};

const SKILL_WEIGHT: f64 = 0.40;
const CONFIDENCE_WEIGHT: f64 = 0.25;
const DOMAIN_WEIGHT: f64 = 0.20;
const WORKLOAD_WEIGHT: f64 = 0.10;
const PRIORITY_WEIGHT: f64 = 0.05;

/// Skill-match base when a task declares no skills.
const NEUTRAL_SKILL_MATCH: f64 = 0.5;
/// Bonus per matching task pattern, and the cap on the total bonus.
const PATTERN_BONUS: f64 = 0.15;
const PATTERN_BONUS_CAP: f64 = 0.3;

/// Titles a checkpoint-only worker may still take.
static REVIEW_TITLE_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"(?i)\b(test|tests|testing|qa|review|audit|verify|verification)\b").unwrap()
});

/// Experience level attached to a skill.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ExperienceTier {
    Novice,
    #[default]
    Intermediate,
    Expert,
    Master,
}

impl ExperienceTier {
    pub fn weight(&self) -> f64 {
        match self {
            ExperienceTier::Novice => 0.25,
            ExperienceTier::Intermediate => 0.5,
            ExperienceTier::Expert => 0.75,
            ExperienceTier::Master => 1.0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SkillCapability {
    /// Efficiency in [0, 1].
    pub efficiency: f64,
    #[serde(default)]
    pub tier: ExperienceTier,
}

/// Keyword matcher recognising tasks a worker suits regardless of skill tags.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskPattern {
    pub keywords: Vec<String>,
    #[serde(default)]
    pub priority: Priority,
    /// Typical effort in hours for matching tasks.
    #[serde(default)]
    pub effort_hint: f64,
}

impl TaskPattern {
    pub fn new(keywords: &[&str], priority: Priority, effort_hint: f64) -> Self {
        Self {
            keywords: keywords.iter().map(|k| k.to_lowercase()).collect(),
            priority,
            effort_hint,
        }
    }

    fn matches(&self, text: &str) -> bool {
        self.keywords.iter().any(|k| text.contains(k.as_str()))
    }
}

/// Capability profile of a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerProfile {
    pub id: String,
    pub specialization: String,
    #[serde(default)]
    pub skills: BTreeMap<String, SkillCapability>,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
    #[serde(default)]
    pub patterns: Vec<TaskPattern>,
    /// Only takes checkpoint (review/QA) work.
    #[serde(default)]
    pub checkpoint_only: bool,
}

fn default_max_concurrent() -> usize {
    2
}

impl WorkerProfile {
    pub fn new(id: &str, specialization: &str) -> Self {
        Self {
            id: id.to_string(),
            specialization: specialization.to_string(),
            skills: BTreeMap::new(),
            max_concurrent: default_max_concurrent(),
            patterns: Vec::new(),
            checkpoint_only: false,
        }
    }

    pub fn with_skill(mut self, name: &str, efficiency: f64, tier: ExperienceTier) -> Self {
        self.skills.insert(
            name.to_lowercase(),
            SkillCapability {
                efficiency: efficiency.clamp(0.0, 1.0),
                tier,
            },
        );
        self
    }

    pub fn with_pattern(mut self, pattern: TaskPattern) -> Self {
        self.patterns.push(pattern);
        self
    }

    pub fn with_max_concurrent(mut self, max: usize) -> Self {
        self.max_concurrent = max;
        self
    }

    pub fn checkpoint_only(mut self) -> Self {
        self.checkpoint_only = true;
        self
    }

    fn skill(&self, name: &str) -> Option<&SkillCapability> {
        self.skills.get(&name.to_lowercase())
    }

    /// Roster used when a plan declares no workers.
    pub fn default_roster() -> Vec<WorkerProfile> {
        vec![
            WorkerProfile::new("developer", "generalist developer")
                .with_skill("rust", 0.8, ExperienceTier::Expert)
                .with_skill("typescript", 0.8, ExperienceTier::Expert)
                .with_skill("react", 0.75, ExperienceTier::Expert)
                .with_skill("python", 0.75, ExperienceTier::Expert)
                .with_skill("api", 0.7, ExperienceTier::Intermediate)
                .with_skill("database", 0.7, ExperienceTier::Intermediate)
                .with_pattern(TaskPattern::new(
                    &["implement", "build", "create", "add"],
                    Priority::Medium,
                    2.0,
                ))
                .with_max_concurrent(3),
            WorkerProfile::new("reviewer", "code reviewer")
                .with_skill("code-review", 0.9, ExperienceTier::Master)
                .with_skill("security", 0.8, ExperienceTier::Expert)
                .with_pattern(TaskPattern::new(&["review", "audit"], Priority::High, 0.5))
                .with_max_concurrent(2)
                .checkpoint_only(),
            WorkerProfile::new("qa", "QA engineer")
                .with_skill("testing", 0.9, ExperienceTier::Master)
                .with_skill("qa", 0.9, ExperienceTier::Master)
                .with_pattern(TaskPattern::new(&["qa", "test", "verify"], Priority::High, 0.5))
                .with_max_concurrent(2)
                .checkpoint_only(),
        ]
    }
}

/// Per-worker scoring detail.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchBreakdown {
    pub worker_id: String,
    pub skill_match: f64,
    pub confidence: f64,
    pub domain_efficiency: f64,
    pub workload: f64,
    pub priority_alignment: f64,
    pub total: f64,
    pub in_flight: usize,
    pub matched_skills: Vec<String>,
    /// Checkpoint-only worker on ordinary work.
    pub excluded: bool,
}

impl MatchBreakdown {
    fn describe(&self) -> String {
        if self.excluded {
            return format!("{}: 0.00 (checkpoint-only)", self.worker_id);
        }
        format!(
            "{}: {:.2} (skills {:.2}, confidence {:.2}, domain {:.2}, workload {:.2}, priority {:.2})",
            self.worker_id,
            self.total,
            self.skill_match,
            self.confidence,
            self.domain_efficiency,
            self.workload,
            self.priority_alignment
        )
    }
}

/// Result of [`CapabilityMatcher::find_best`].
#[derive(Debug, Clone, Serialize)]
pub struct Assignment {
    /// Highest-ranked worker with a non-zero score.
    pub best: Option<MatchBreakdown>,
    /// Every worker, best first.
    pub ranked: Vec<MatchBreakdown>,
    pub justification: String,
}

enum SkillMatch {
    Excluded,
    Scored {
        ratio: f64,
        matched: Vec<String>,
        domain_efficiency: f64,
        tier_weight: f64,
        priority_alignment: f64,
    },
}

#[derive(Debug, Clone, Default)]
pub struct CapabilityMatcher;

impl CapabilityMatcher {
    pub fn new() -> Self {
        Self
    }

    fn skill_match(&self, task: &TaskNode, worker: &WorkerProfile) -> SkillMatch {
        if worker.checkpoint_only && !task.is_checkpoint && !REVIEW_TITLE_RE.is_match(&task.title)
        {
            return SkillMatch::Excluded;
        }

        let mut matched = Vec::new();
        let mut efficiency_sum = 0.0;
        let mut tier_sum = 0.0;
        for skill in &task.required_skills {
            if let Some(capability) = worker.skill(skill) {
                matched.push(skill.clone());
                efficiency_sum += capability.efficiency;
                tier_sum += capability.tier.weight();
            }
        }

        let base = if task.required_skills.is_empty() {
            NEUTRAL_SKILL_MATCH
        } else {
            efficiency_sum / task.required_skills.len() as f64
        };

        let text = match task.checkpoint_type {
            Some(kind) => kind.label().to_string(),
            None => format!("{} {}", task.title, task.description).to_lowercase(),
        };
        let hits: Vec<&TaskPattern> = worker.patterns.iter().filter(|p| p.matches(&text)).collect();
        let bonus = (hits.len() as f64 * PATTERN_BONUS).min(PATTERN_BONUS_CAP);

        let (domain_efficiency, tier_weight) = if matched.is_empty() {
            if task.required_skills.is_empty() {
                (NEUTRAL_SKILL_MATCH, ExperienceTier::Intermediate.weight())
            } else {
                (0.0, 0.0)
            }
        } else {
            let n = matched.len() as f64;
            (efficiency_sum / n, tier_sum / n)
        };

        let priority_alignment = hits
            .iter()
            .map(|p| 1.0 - (p.priority.rank() as f64 - task.priority.rank() as f64).abs() / 3.0)
            .fold(None, |best: Option<f64>, v| Some(best.map_or(v, |b| b.max(v))))
            .unwrap_or(0.5);

        SkillMatch::Scored {
            ratio: (base + bonus).min(1.0),
            matched,
            domain_efficiency,
            tier_weight,
            priority_alignment,
        }
    }

    /// Score a worker for a task given its current in-flight count.
    pub fn breakdown(
        &self,
        task: &TaskNode,
        worker: &WorkerProfile,
        in_flight: usize,
    ) -> MatchBreakdown {
        match self.skill_match(task, worker) {
            SkillMatch::Excluded => MatchBreakdown {
                worker_id: worker.id.clone(),
                skill_match: 0.0,
                confidence: 0.0,
                domain_efficiency: 0.0,
                workload: 0.0,
                priority_alignment: 0.0,
                total: 0.0,
                in_flight,
                matched_skills: Vec::new(),
                excluded: true,
            },
            SkillMatch::Scored {
                ratio,
                matched,
                domain_efficiency,
                tier_weight,
                priority_alignment,
            } => {
                let confidence = ratio * (0.7 + 0.3 * tier_weight);
                let workload = if worker.max_concurrent == 0 {
                    0.0
                } else {
                    worker.max_concurrent.saturating_sub(in_flight) as f64
                        / worker.max_concurrent as f64
                };
                let total = (SKILL_WEIGHT * ratio
                    + CONFIDENCE_WEIGHT * confidence
                    + DOMAIN_WEIGHT * domain_efficiency
                    + WORKLOAD_WEIGHT * workload
                    + PRIORITY_WEIGHT * priority_alignment)
                    .clamp(0.0, 1.0);
                MatchBreakdown {
                    worker_id: worker.id.clone(),
                    skill_match: ratio,
                    confidence,
                    domain_efficiency,
                    workload,
                    priority_alignment,
                    total,
                    in_flight,
                    matched_skills: matched,
                    excluded: false,
                }
            }
        }
    }

    /// Score in [0, 1].
    pub fn score(&self, task: &TaskNode, worker: &WorkerProfile, in_flight: usize) -> f64 {
        self.breakdown(task, worker, in_flight).total
    }

    /// Rank every worker for `task`.
    ///
    /// Sorted by score descending, then fewer in-flight tasks, then worker id.
    pub fn find_best<'a>(
        &self,
        task: &TaskNode,
        workers: impl IntoIterator<Item = &'a WorkerProfile>,
        in_flight: impl Fn(&str) -> usize,
    ) -> Assignment {
        let mut ranked: Vec<MatchBreakdown> = workers
            .into_iter()
            .map(|w| self.breakdown(task, w, in_flight(&w.id)))
            .collect();
        ranked.sort_by(|a, b| {
            b.total
                .partial_cmp(&a.total)
                .unwrap_or(Ordering::Equal)
                .then_with(|| a.in_flight.cmp(&b.in_flight))
                .then_with(|| a.worker_id.cmp(&b.worker_id))
        });

        let best = ranked.first().filter(|b| b.total > 0.0).cloned();
        let justification = match &best {
            Some(top) => {
                let mut text = format!("selected {}", top.describe());
                if let Some(next) = ranked.get(1) {
                    text.push_str(&format!("; runner-up {}", next.describe()));
                }
                text
            }
            None => format!("no capable worker among {} candidates", ranked.len()),
        };

        Assignment {
            best,
            ranked,
            justification,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::task::{CheckpointType, TaskSpec};

    fn task(title: &str, skills: &[&str]) -> TaskNode {
        TaskNode::from_spec(&TaskSpec::new("t", title).with_skills(skills), 3)
    }

    fn react_worker(id: &str, efficiency: f64) -> WorkerProfile {
        WorkerProfile::new(id, "frontend").with_skill("react", efficiency, ExperienceTier::Expert)
    }

    // ========== Scoring Tests ==========

    #[test]
    fn test_higher_efficiency_scores_higher() {
        let matcher = CapabilityMatcher::new();
        let task = task("Build login form", &["react"]);
        let a = matcher.score(&task, &react_worker("a", 0.95), 0);
        let b = matcher.score(&task, &react_worker("b", 0.2), 0);
        assert!(a > b, "{} should beat {}", a, b);
    }

    #[test]
    fn test_checkpoint_only_worker_scores_zero_on_ordinary_work() {
        let matcher = CapabilityMatcher::new();
        let reviewer = react_worker("rev", 1.0).checkpoint_only();
        let ordinary = task("Build login form", &["react"]);
        assert_eq!(matcher.score(&ordinary, &reviewer, 0), 0.0);
        assert!(matcher.breakdown(&ordinary, &reviewer, 0).excluded);
    }

    #[test]
    fn test_checkpoint_only_worker_takes_checkpoints_and_review_titles() {
        let matcher = CapabilityMatcher::new();
        let reviewer = react_worker("rev", 0.9).checkpoint_only();

        let original = task("Build login form", &["react"]);
        let review = TaskNode::checkpoint(
            "t-code-review".into(),
            "Code review: Build login form".into(),
            CheckpointType::CodeReview,
            Some(&original),
            Default::default(),
            3,
        );
        assert!(matcher.score(&review, &reviewer, 0) > 0.0);

        let titled = task("Write integration tests", &[]);
        assert!(matcher.score(&titled, &reviewer, 0) > 0.0);
    }

    #[test]
    fn test_score_is_clamped_to_unit_interval() {
        let matcher = CapabilityMatcher::new();
        let worker = WorkerProfile::new("max", "all")
            .with_skill("react", 1.0, ExperienceTier::Master)
            .with_pattern(TaskPattern::new(&["login"], Priority::Medium, 1.0))
            .with_pattern(TaskPattern::new(&["form"], Priority::Medium, 1.0));
        let score = matcher.score(&task("Build login form", &["react"]), &worker, 0);
        assert!((0.0..=1.0).contains(&score));
        assert!(score > 0.95);
    }

    #[test]
    fn test_workload_lowers_score() {
        let matcher = CapabilityMatcher::new();
        let worker = react_worker("a", 0.8).with_max_concurrent(2);
        let task = task("Build login form", &["react"]);
        let idle = matcher.breakdown(&task, &worker, 0);
        let busy = matcher.breakdown(&task, &worker, 2);
        assert_eq!(idle.workload, 1.0);
        assert_eq!(busy.workload, 0.0);
        assert!(idle.total > busy.total);
    }

    #[test]
    fn test_pattern_bonus_without_skill_tags() {
        let matcher = CapabilityMatcher::new();
        let plain = WorkerProfile::new("plain", "dev");
        let patterned = WorkerProfile::new("pat", "dev").with_pattern(TaskPattern::new(
            &["login"],
            Priority::Medium,
            1.0,
        ));
        let task = task("Build login form", &[]);
        assert!(matcher.score(&task, &patterned, 0) > matcher.score(&task, &plain, 0));
    }

    #[test]
    fn test_missing_skill_contributes_nothing() {
        let matcher = CapabilityMatcher::new();
        let worker = react_worker("a", 0.9);
        let breakdown = matcher.breakdown(&task("Port service", &["go"]), &worker, 0);
        assert_eq!(breakdown.skill_match, 0.0);
        assert_eq!(breakdown.domain_efficiency, 0.0);
        assert!(breakdown.matched_skills.is_empty());
    }

    // ========== Ranking Tests ==========

    #[test]
    fn test_find_best_ranks_and_justifies() {
        let matcher = CapabilityMatcher::new();
        let workers = vec![
            react_worker("slow", 0.2),
            react_worker("fast", 0.95),
            react_worker("qa", 0.99).checkpoint_only(),
        ];
        let result = matcher.find_best(&task("Build login form", &["react"]), &workers, |_| 0);
        assert_eq!(result.best.as_ref().unwrap().worker_id, "fast");
        assert_eq!(result.ranked.len(), 3);
        assert_eq!(result.ranked[2].worker_id, "qa");
        assert!(result.justification.contains("selected fast"));
        assert!(result.justification.contains("runner-up slow"));
    }

    #[test]
    fn test_find_best_ties_break_on_workload_then_id() {
        let matcher = CapabilityMatcher::new();
        let workers = vec![
            react_worker("b", 0.8).with_max_concurrent(0),
            react_worker("a", 0.8).with_max_concurrent(0),
        ];
        let task = task("Build login form", &["react"]);
        let result = matcher.find_best(&task, &workers, |_| 0);
        assert_eq!(result.ranked[0].worker_id, "a");

        let loaded = matcher.find_best(&task, &workers, |id| if id == "a" { 1 } else { 0 });
        assert_eq!(loaded.ranked[0].worker_id, "b");
    }

    #[test]
    fn test_find_best_without_capable_worker() {
        let matcher = CapabilityMatcher::new();
        let workers = vec![react_worker("qa", 0.9).checkpoint_only()];
        let result = matcher.find_best(&task("Build login form", &["react"]), &workers, |_| 0);
        assert!(result.best.is_none());
        assert!(result.justification.contains("no capable worker"));
    }

    #[test]
    fn test_default_roster_sends_gates_to_gate_workers() {
        let matcher = CapabilityMatcher::new();
        let roster = WorkerProfile::default_roster();
        let original = task("Build login form", &["react"]);
        let pick = |kind: CheckpointType| {
            let gate = TaskNode::checkpoint(
                "t-gate".into(),
                format!("Gate: {}", original.title),
                kind,
                Some(&original),
                Default::default(),
                3,
            );
            matcher
                .find_best(&gate, &roster, |_| 0)
                .best
                .map(|b| b.worker_id)
        };
        assert_eq!(pick(CheckpointType::CodeReview).as_deref(), Some("reviewer"));
        assert_eq!(pick(CheckpointType::FinalCodeReview).as_deref(), Some("reviewer"));
        assert_eq!(pick(CheckpointType::QaTesting).as_deref(), Some("qa"));
        assert_eq!(pick(CheckpointType::FinalQa).as_deref(), Some("qa"));

        let build = matcher.find_best(&original, &roster, |_| 0);
        assert_eq!(build.best.map(|b| b.worker_id).as_deref(), Some("developer"));
    }

    #[test]
    fn test_default_roster_covers_all_node_kinds() {
        let roster = WorkerProfile::default_roster();
        assert_eq!(roster.len(), 3);
        assert_eq!(roster.iter().filter(|w| w.checkpoint_only).count(), 2);
    }
}
