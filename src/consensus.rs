//! Confidence-weighted consensus over an issue's opinion thread.
//!
//! Only the latest vote-bearing opinion per voter counts. The initial
//! `raise` is the raiser's fix-side vote. A side wins outright when its
//! weight exceeds the other by at least the threshold; once every eligible
//! voter has spoken in the current turn without reaching it, a simple
//! majority of the latest votes decides instead, so low-confidence rounds
//! cannot deadlock.

use std::collections::HashMap;

use tracing::debug;

use crate::config::ConsensusConfig;
use crate::models::{AgentConfig, ConsensusType, Issue, Opinion, Severity};

/// Weighted standings for one issue.
#[derive(Debug, Clone, Default)]
pub struct VoteTally {
    pub fix_weight: f64,
    pub no_fix_weight: f64,
    pub fix_votes: usize,
    pub no_fix_votes: usize,
    /// A `false_positive` vote was cast, flagging a review request back to
    /// the raiser.
    pub review_requested: bool,
    pub voters: Vec<String>,
}

/// Outcome of a consensus evaluation for one issue.
#[derive(Debug, Clone, PartialEq)]
pub enum ConsensusOutcome {
    /// Threshold or majority reached.
    Reached {
        consensus_type: ConsensusType,
        final_severity: Severity,
    },
    /// All voices heard, votes split evenly; frozen for the operator.
    Tied,
    /// Votes still outstanding.
    Pending,
}

/// The latest vote-bearing opinion per voter, in first-vote order.
fn latest_votes(issue: &Issue) -> Vec<&Opinion> {
    let mut by_voter: HashMap<&str, &Opinion> = HashMap::new();
    let mut order: Vec<&str> = Vec::new();
    for op in &issue.thread {
        if !op.action.is_vote() {
            continue;
        }
        if by_voter.insert(op.model_id.as_str(), op).is_none() {
            order.push(op.model_id.as_str());
        }
    }
    order.into_iter().filter_map(|v| by_voter.remove(v)).collect()
}

fn vote_weight(op: &Opinion, agents: &[AgentConfig], config: &ConsensusConfig) -> f64 {
    match op.confidence {
        Some(c) => c.clamp(0.0, 1.0).max(config.min_confidence_weight),
        None => agents
            .iter()
            .find(|a| a.id == op.model_id)
            .map(|a| config.strictness_weight(a.strictness))
            .unwrap_or(config.balanced_weight),
    }
}

pub fn tally(issue: &Issue, agents: &[AgentConfig], config: &ConsensusConfig) -> VoteTally {
    let mut result = VoteTally::default();
    for op in latest_votes(issue) {
        let weight = vote_weight(op, agents, config);
        if op.action.is_fix_side() {
            result.fix_weight += weight;
            result.fix_votes += 1;
        } else {
            result.no_fix_weight += weight;
            result.no_fix_votes += 1;
            if op.action == crate::models::OpinionAction::FalsePositive {
                result.review_requested = true;
            }
        }
        result.voters.push(op.model_id.clone());
    }
    result
}

/// Weighted median over the suggested severities of the latest fix-side
/// votes. `None` when nobody suggested one.
fn weighted_median_severity(
    issue: &Issue,
    agents: &[AgentConfig],
    config: &ConsensusConfig,
) -> Option<Severity> {
    let mut weighted: Vec<(i32, f64)> = latest_votes(issue)
        .into_iter()
        .filter(|op| op.action.is_fix_side())
        .filter_map(|op| {
            op.suggested_severity
                .filter(|s| *s != Severity::Dismissed)
                .map(|s| (s.rank(), vote_weight(op, agents, config)))
        })
        .collect();
    if weighted.is_empty() {
        return None;
    }
    weighted.sort_by_key(|(rank, _)| *rank);
    let total: f64 = weighted.iter().map(|(_, w)| w).sum();
    let mut cumulative = 0.0;
    for (rank, weight) in &weighted {
        cumulative += weight;
        if cumulative * 2.0 >= total {
            return Some(Severity::from_rank(*rank));
        }
    }
    weighted.last().map(|(rank, _)| Severity::from_rank(*rank))
}

/// Have all enabled non-raiser reviewers cast a vote in the issue's current
/// turn? (The deadlock-bypass gate: "all voices heard".)
fn all_voices_heard(issue: &Issue, agents: &[AgentConfig]) -> bool {
    agents
        .iter()
        .filter(|a| a.enabled && a.id != issue.raised_by)
        .all(|a| {
            issue
                .thread
                .iter()
                .any(|op| op.model_id == a.id && op.action.is_vote() && op.turn == issue.turn)
        })
}

pub fn evaluate(
    issue: &Issue,
    agents: &[AgentConfig],
    config: &ConsensusConfig,
) -> ConsensusOutcome {
    let tally = tally(issue, agents, config);
    if tally.voters.is_empty() {
        return ConsensusOutcome::Pending;
    }

    let fix_side = |issue: &Issue| ConsensusOutcome::Reached {
        consensus_type: ConsensusType::FixRequired,
        final_severity: weighted_median_severity(issue, agents, config)
            .unwrap_or(issue.severity),
    };
    let no_fix_side = ConsensusOutcome::Reached {
        consensus_type: ConsensusType::Dismissed,
        final_severity: Severity::Dismissed,
    };

    if tally.fix_weight - tally.no_fix_weight >= config.threshold {
        return fix_side(issue);
    }
    if tally.no_fix_weight - tally.fix_weight >= config.threshold {
        return no_fix_side;
    }

    if all_voices_heard(issue, agents) {
        debug!(
            issue_id = %issue.id,
            fix = tally.fix_votes,
            no_fix = tally.no_fix_votes,
            "threshold unmet with all voices heard, falling back to majority"
        );
        return match tally.fix_votes.cmp(&tally.no_fix_votes) {
            std::cmp::Ordering::Greater => fix_side(issue),
            std::cmp::Ordering::Less => no_fix_side,
            std::cmp::Ordering::Equal => ConsensusOutcome::Tied,
        };
    }

    ConsensusOutcome::Pending
}

/// Recompute consensus for every open issue. Closed issues are untouched.
/// Deterministic: identical threads always produce identical verdicts.
pub fn apply(issues: &mut [Issue], agents: &[AgentConfig], config: &ConsensusConfig) {
    for issue in issues.iter_mut() {
        if issue.is_closed() {
            continue;
        }
        match evaluate(issue, agents, config) {
            ConsensusOutcome::Reached {
                consensus_type,
                final_severity,
            } => {
                issue.consensus = Some(true);
                issue.consensus_type = Some(consensus_type);
                issue.final_severity = Some(final_severity);
            }
            ConsensusOutcome::Tied => {
                issue.consensus = Some(false);
                issue.consensus_type = Some(ConsensusType::Undecided);
                issue.final_severity = None;
            }
            ConsensusOutcome::Pending => {
                issue.consensus = Some(false);
                issue.consensus_type = None;
                issue.final_severity = None;
            }
        }
    }
}

/// Freeze every still-open issue as undecided (max-turns cutoff).
pub fn freeze_undecided(issues: &mut [Issue]) {
    for issue in issues.iter_mut() {
        if issue.is_closed() || issue.is_decided() {
            continue;
        }
        issue.consensus = Some(false);
        issue.consensus_type = Some(ConsensusType::Undecided);
    }
}
