//! Fit scoring: deterministic rule signals, optionally blended with the AI collaborator.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use intake_core::{
    ContentDetails, ContentItem, FitCategory, FundingDetails, ProjectDetails, ResourceDetails,
    ScoreBreakdown, ScoredItem,
};
use tracing::{debug, warn};

use crate::ai::{build_prompt, response_schema, AiAssessment, CompletionClient, CompletionError};

#[derive(Debug, Clone, PartialEq)]
pub struct ScoringConfig {
    /// Weight of the AI score in the blend; 0 ignores the collaborator entirely.
    pub ai_weight: f64,
    pub high_fit_at: u8,
    pub medium_fit_at: u8,
    pub ai_timeout: Duration,
    pub prompt_description_chars: usize,
    pub team_size_band: (u32, u32),
    pub funding_amount_band: (f64, f64),
    pub default_ai_confidence: f64,
}

impl Default for ScoringConfig {
    fn default() -> Self {
        Self {
            ai_weight: 0.4,
            high_fit_at: 80,
            medium_fit_at: 50,
            ai_timeout: Duration::from_secs(20),
            prompt_description_chars: 1_500,
            team_size_band: (1, 10),
            funding_amount_band: (10_000.0, 2_000_000.0),
            default_ai_confidence: 0.7,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleScore {
    pub score: u8,
    pub signals: BTreeMap<String, u8>,
    /// Fraction of signals that had any data to judge.
    pub coverage: f64,
}

#[derive(Default)]
struct Signals {
    points: BTreeMap<String, u8>,
    present: usize,
}

impl Signals {
    fn add(&mut self, name: &str, points: Option<u8>) {
        if points.is_some() {
            self.present += 1;
        }
        self.points.insert(name.to_string(), points.unwrap_or(0));
    }

    fn finish(self) -> RuleScore {
        let total = self.points.values().map(|p| u32::from(*p)).sum::<u32>().min(100);
        let coverage = if self.points.is_empty() {
            0.0
        } else {
            self.present as f64 / self.points.len() as f64
        };
        RuleScore {
            score: total as u8,
            signals: self.points,
            coverage,
        }
    }
}

fn description_depth(description: &str, max: u8) -> Option<u8> {
    let len = description.chars().count();
    let points = if len >= 200 {
        max
    } else if len >= 80 {
        max * 2 / 3
    } else if len >= 30 {
        max / 3
    } else {
        0
    };
    Some(points)
}

fn age_days(date: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (now - date).num_days().max(0)
}

fn present(value: Option<&str>, points: u8) -> Option<u8> {
    value.filter(|v| !v.trim().is_empty()).map(|_| points)
}

fn project_signals(item: &ContentItem, d: &ProjectDetails, config: &ScoringConfig) -> RuleScore {
    let mut s = Signals::default();
    s.add("description", description_depth(item.description(), 15));
    s.add(
        "social_links",
        match d.social_links.len() {
            0 => None,
            1 => Some(10),
            _ => Some(15),
        },
    );
    s.add(
        "launch_recency",
        d.launched_at.map(|at| match age_days(at, item.fetched_at()) {
            0..=30 => 25,
            31..=90 => 18,
            91..=365 => 10,
            _ => 3,
        }),
    );
    let (lo, hi) = config.team_size_band;
    s.add(
        "team_size",
        d.team_size.map(|n| if (lo..=hi).contains(&n) { 20 } else { 5 }),
    );
    s.add(
        "traction",
        d.traction.map(|t| match t {
            0 => 0,
            1..=24 => 5,
            25..=99 => 12,
            100..=499 => 20,
            _ => 25,
        }),
    );
    s.finish()
}

fn funding_signals(item: &ContentItem, d: &FundingDetails, config: &ScoringConfig) -> RuleScore {
    let mut s = Signals::default();
    let (lo, hi) = config.funding_amount_band;
    s.add(
        "amount",
        d.amount_max
            .or(d.amount_min)
            .map(|amount| if amount >= lo && amount <= hi { 30 } else { 10 }),
    );
    let today = item.fetched_at().date_naive();
    s.add(
        "deadline",
        Some(match d.deadline.map(|deadline| (deadline - today).num_days()) {
            None => 15,
            Some(days) if days < 0 => 0,
            Some(0..=6) => 10,
            Some(7..=90) => 25,
            Some(_) => 18,
        }),
    );
    s.add("eligibility", present(d.eligibility.as_deref(), 15));
    s.add("description", description_depth(item.description(), 15));
    s.add("apply_url", present(d.apply_url.as_deref(), 15));
    s.finish()
}

fn resource_signals(item: &ContentItem, d: &ResourceDetails) -> RuleScore {
    let mut s = Signals::default();
    s.add("description", description_depth(item.description(), 20));
    s.add(
        "recency",
        d.published_at.map(|at| match age_days(at, item.fetched_at()) {
            0..=7 => 30,
            8..=30 => 22,
            31..=90 => 12,
            91..=365 => 5,
            _ => 0,
        }),
    );
    s.add(
        "engagement",
        d.engagement.map(|e| match e {
            0 => 0,
            1..=19 => 5,
            20..=99 => 12,
            100..=499 => 20,
            _ => 25,
        }),
    );
    s.add(
        "tags",
        match d.tags.len() {
            0 => None,
            1 => Some(8),
            _ => Some(15),
        },
    );
    s.add("author", present(d.author.as_deref(), 10));
    s.finish()
}

/// Deterministic signal score. Dates are measured against the item's `fetched_at`.
pub fn rule_score(item: &ContentItem, config: &ScoringConfig) -> RuleScore {
    match item.details() {
        ContentDetails::Project(d) => project_signals(item, d, config),
        ContentDetails::Funding(d) => funding_signals(item, d, config),
        ContentDetails::Resource(d) => resource_signals(item, d),
    }
}

pub fn blend(rule: u8, ai: f64, ai_weight: f64) -> u8 {
    let w = if ai_weight.is_finite() { ai_weight.clamp(0.0, 1.0) } else { 0.0 };
    let ai = if ai.is_finite() { ai.clamp(0.0, 100.0) } else { f64::from(rule) };
    ((1.0 - w) * f64::from(rule) + w * ai).round().clamp(0.0, 100.0) as u8
}

pub struct Scorer {
    config: ScoringConfig,
    ai: Option<Arc<dyn CompletionClient>>,
}

impl Scorer {
    pub fn new(config: ScoringConfig) -> Self {
        Self { config, ai: None }
    }

    pub fn with_ai(mut self, client: Arc<dyn CompletionClient>) -> Self {
        self.ai = Some(client);
        self
    }

    pub fn config(&self) -> &ScoringConfig {
        &self.config
    }

    pub fn has_ai(&self) -> bool {
        self.ai.is_some() && self.config.ai_weight > 0.0
    }

    async fn assess(&self, client: &dyn CompletionClient, item: &ContentItem) -> Result<AiAssessment, CompletionError> {
        let prompt = build_prompt(item, self.config.prompt_description_chars);
        let schema = response_schema(item.kind());
        let value = tokio::time::timeout(self.config.ai_timeout, client.complete(&prompt, &schema))
            .await
            .map_err(|_| CompletionError::Timeout(self.config.ai_timeout))??;
        AiAssessment::from_json(value)
    }

    /// Never fails: collaborator problems degrade to the rule score.
    pub async fn score_content(&self, item: ContentItem) -> ScoredItem {
        let rules = rule_score(&item, &self.config);
        let mut breakdown = ScoreBreakdown {
            rule_score: rules.score,
            ai_score: None,
            signals: rules.signals.clone(),
            degraded: false,
        };
        let mut score = rules.score;
        let mut confidence = rules.coverage;
        let mut ai_summary = None;
        let mut ai_reasoning = None;

        if let Some(client) = self.ai.as_deref().filter(|_| self.config.ai_weight > 0.0) {
            match self.assess(client, &item).await {
                Ok(assessment) => {
                    let ai = assessment.score();
                    breakdown.ai_score = Some(ai.round() as u8);
                    score = blend(rules.score, ai, self.config.ai_weight);
                    confidence = assessment.confidence.unwrap_or(self.config.default_ai_confidence);
                    ai_summary = Some(assessment.summary).filter(|s| !s.is_empty());
                    ai_reasoning = Some(assessment.reasoning).filter(|s| !s.is_empty());
                }
                Err(err) => {
                    warn!(
                        url_key = %item.url_key(),
                        source = %item.source(),
                        error = %err,
                        "AI scoring unavailable; using rule score"
                    );
                    breakdown.degraded = true;
                }
            }
        }

        let category = FitCategory::bucket(score, self.config.high_fit_at, self.config.medium_fit_at);
        debug!(
            url_key = %item.url_key(),
            rule = rules.score,
            ai = ?breakdown.ai_score,
            score,
            category = %category,
            "item scored"
        );
        ScoredItem {
            item,
            score,
            category,
            confidence,
            ai_summary,
            ai_reasoning,
            breakdown,
        }
    }
}
