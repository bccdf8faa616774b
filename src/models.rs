//! Data model for review sessions, agents, issues, and opinion threads.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::AccessKeys;
use crate::phase::SessionPhase;

/// 12-hex-char opaque identifier, used for sessions, issues, and opinions.
pub fn new_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..12].to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    High,
    #[default]
    Medium,
    Low,
    Dismissed,
}

impl Severity {
    /// Rank for comparisons and the weighted-median vote. Higher is more severe.
    /// `Dismissed` carries no rank and never participates in severity votes.
    pub fn rank(&self) -> i32 {
        match self {
            Self::Critical => 3,
            Self::High => 2,
            Self::Medium => 1,
            Self::Low => 0,
            Self::Dismissed => -1,
        }
    }

    pub fn from_rank(rank: i32) -> Self {
        match rank {
            3 => Self::Critical,
            2 => Self::High,
            1 => Self::Medium,
            _ => Self::Low,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Critical => "critical",
            Self::High => "high",
            Self::Medium => "medium",
            Self::Low => "low",
            Self::Dismissed => "dismissed",
        };
        write!(f, "{}", s)
    }
}

/// One entry in an issue's opinion thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OpinionAction {
    Raise,
    FixRequired,
    NoFix,
    FalsePositive,
    Withdraw,
    Comment,
    StatusChange,
}

impl OpinionAction {
    /// Whether this action participates in the consensus tally.
    /// `raise` counts as the raiser's fix-side vote.
    pub fn is_vote(&self) -> bool {
        matches!(
            self,
            Self::Raise | Self::FixRequired | Self::NoFix | Self::FalsePositive
        )
    }

    pub fn is_fix_side(&self) -> bool {
        matches!(self, Self::Raise | Self::FixRequired)
    }
}

impl fmt::Display for OpinionAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Raise => "raise",
            Self::FixRequired => "fix_required",
            Self::NoFix => "no_fix",
            Self::FalsePositive => "false_positive",
            Self::Withdraw => "withdraw",
            Self::Comment => "comment",
            Self::StatusChange => "status_change",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConsensusType {
    FixRequired,
    Dismissed,
    Undecided,
    Closed,
}

impl fmt::Display for ConsensusType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::FixRequired => "fix_required",
            Self::Dismissed => "dismissed",
            Self::Undecided => "undecided",
            Self::Closed => "closed",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressStatus {
    #[default]
    Reported,
    WontFix,
    Fixed,
    Completed,
}

impl fmt::Display for ProgressStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Reported => "reported",
            Self::WontFix => "wont_fix",
            Self::Fixed => "fixed",
            Self::Completed => "completed",
        };
        write!(f, "{}", s)
    }
}

/// Reviewer strictness, mapped to a vote weight when no explicit
/// confidence accompanies an opinion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Strictness {
    Strict,
    #[default]
    Balanced,
    Lenient,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ClientKind {
    #[default]
    ClaudeCode,
    Codex,
    Gemini,
    Opencode,
}

impl fmt::Display for ClientKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::ClaudeCode => "claude-code",
            Self::Codex => "codex",
            Self::Gemini => "gemini",
            Self::Opencode => "opencode",
        };
        write!(f, "{}", s)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    #[default]
    Idle,
    Reviewing,
    Submitted,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskKind {
    #[default]
    Review,
    Deliberation,
    Verification,
}

impl fmt::Display for TaskKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Review => "review",
            Self::Deliberation => "deliberation",
            Self::Verification => "verification",
        };
        write!(f, "{}", s)
    }
}

/// Author response to a fix-required issue during verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseAction {
    Accept,
    Dispute,
    Partial,
}

// --- Diff ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileChangeStatus {
    Added,
    #[default]
    Modified,
    Deleted,
    Renamed,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffFile {
    pub path: String,
    pub status: FileChangeStatus,
    pub additions: u32,
    pub deletions: u32,
    /// Unified diff text; empty for binary or unchanged files.
    pub content: String,
}

// --- Review ---

/// A reviewer-reported issue before dedup promotes it to an `Issue`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RawIssue {
    pub title: String,
    pub severity: Severity,
    pub file: String,
    pub line: Option<u32>,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub description: String,
    pub suggestion: String,
}

/// One reviewer's round-level record. At most one per (model_id, turn).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Review {
    pub model_id: String,
    pub turn: u32,
    pub summary: String,
    pub issues: Vec<RawIssue>,
    pub submitted_at: DateTime<Utc>,
}

impl Default for Review {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            turn: 0,
            summary: String::new(),
            issues: Vec::new(),
            submitted_at: Utc::now(),
        }
    }
}

impl Review {
    pub fn issue_count(&self) -> usize {
        self.issues.len()
    }
}

// --- Issue & Opinion ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Opinion {
    pub id: String,
    pub model_id: String,
    pub action: OpinionAction,
    pub reasoning: String,
    pub suggested_severity: Option<Severity>,
    /// Voter confidence in [0, 1]; when absent the agent's strictness
    /// mapping supplies the weight.
    pub confidence: Option<f64>,
    pub turn: u32,
    pub timestamp: DateTime<Utc>,
    pub mentions: Vec<String>,
    pub previous_status: Option<String>,
    pub status_value: Option<String>,
}

impl Default for Opinion {
    fn default() -> Self {
        Self {
            id: new_id(),
            model_id: String::new(),
            action: OpinionAction::Comment,
            reasoning: String::new(),
            suggested_severity: None,
            confidence: None,
            turn: 0,
            timestamp: Utc::now(),
            mentions: Vec::new(),
            previous_status: None,
            status_value: None,
        }
    }
}

impl Opinion {
    pub fn new(model_id: impl Into<String>, action: OpinionAction, reasoning: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            action,
            reasoning: reasoning.into(),
            ..Default::default()
        }
    }

    pub fn with_severity(mut self, severity: Severity) -> Self {
        self.suggested_severity = Some(severity);
        self
    }

    pub fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence.clamp(0.0, 1.0));
        self
    }

    pub fn at_turn(mut self, turn: u32) -> Self {
        self.turn = turn;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AssistMessage {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

impl Default for AssistMessage {
    fn default() -> Self {
        Self {
            role: String::new(),
            content: String::new(),
            timestamp: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Issue {
    pub id: String,
    /// Dense 1-based number within the session, assigned once at dedup and
    /// never reassigned, even after dismissal or withdraw.
    pub display_number: u32,
    pub title: String,
    pub severity: Severity,
    pub file: String,
    pub line: Option<u32>,
    pub line_start: Option<u32>,
    pub line_end: Option<u32>,
    pub description: String,
    pub suggestion: String,
    pub raised_by: String,
    pub turn: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub consensus: Option<bool>,
    pub consensus_type: Option<ConsensusType>,
    pub final_severity: Option<Severity>,
    pub progress_status: ProgressStatus,
    pub group_key: String,
    pub thread: Vec<Opinion>,
    pub assist_messages: Vec<AssistMessage>,
}

impl Default for Issue {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            display_number: 0,
            title: String::new(),
            severity: Severity::Medium,
            file: String::new(),
            line: None,
            line_start: None,
            line_end: None,
            description: String::new(),
            suggestion: String::new(),
            raised_by: String::new(),
            turn: 0,
            created_at: now,
            updated_at: now,
            consensus: None,
            consensus_type: None,
            final_severity: None,
            progress_status: ProgressStatus::Reported,
            group_key: String::new(),
            thread: Vec::new(),
            assist_messages: Vec::new(),
        }
    }
}

impl Issue {
    pub fn is_closed(&self) -> bool {
        self.consensus_type == Some(ConsensusType::Closed)
    }

    pub fn is_decided(&self) -> bool {
        self.consensus == Some(true)
    }

    pub fn is_fix_required(&self) -> bool {
        self.consensus_type == Some(ConsensusType::FixRequired)
    }

    /// Effective severity for reporting: consensus verdict when present,
    /// raise severity otherwise.
    pub fn effective_severity(&self) -> Severity {
        self.final_severity.unwrap_or(self.severity)
    }

    /// Latest thread turn at which this model spoke, or `None`.
    pub fn latest_turn_of(&self, model_id: &str) -> Option<u32> {
        self.thread
            .iter()
            .filter(|op| op.model_id == model_id)
            .map(|op| op.turn)
            .max()
    }
}

/// Normalize `(line, line_start, line_end)` so that start <= end and a bare
/// `line` fills in for a missing range. Out-of-order ranges are swapped, not
/// rejected.
pub fn normalize_lines(
    line: Option<u32>,
    line_start: Option<u32>,
    line_end: Option<u32>,
) -> (Option<u32>, Option<u32>, Option<u32>) {
    let mut start = line_start.or(line);
    let mut end = line_end.or(start);
    if start.is_none() {
        start = end;
    }
    if let (Some(s), Some(e)) = (start, end)
        && e < s
    {
        (start, end) = (Some(e), Some(s));
    }
    (line.or(start), start, end)
}

// --- Agents ---

/// A configured reviewer, bound to a session (or stored as a preset).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Model identifier, unique within a session.
    pub id: String,
    pub client_kind: ClientKind,
    pub provider: String,
    /// Underlying model name passed to the client CLI, if any.
    pub model_name: String,
    pub strictness: Strictness,
    pub system_prompt: String,
    pub temperature: Option<f64>,
    /// Review focus keywords woven into the prompt.
    pub focus: Vec<String>,
    pub color: String,
    pub enabled: bool,
    pub description: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            id: String::new(),
            client_kind: ClientKind::ClaudeCode,
            provider: String::new(),
            model_name: String::new(),
            strictness: Strictness::Balanced,
            system_prompt: String::new(),
            temperature: None,
            focus: Vec::new(),
            color: String::new(),
            enabled: true,
            description: String::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentState {
    pub model_id: String,
    pub status: AgentStatus,
    pub task_kind: TaskKind,
    pub prompt_preview: String,
    #[serde(skip_serializing_if = "String::is_empty")]
    pub prompt_full: String,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Turn this agent was last handed a prompt for; guards against
    /// re-prompting within the same round.
    pub prompted_turn: Option<u32>,
    pub last_reason: String,
    pub last_output: String,
    pub last_error: String,
}

impl Default for AgentState {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            status: AgentStatus::Idle,
            task_kind: TaskKind::Review,
            prompt_preview: String::new(),
            prompt_full: String::new(),
            started_at: None,
            submitted_at: None,
            updated_at: None,
            prompted_turn: None,
            last_reason: String::new(),
            last_output: String::new(),
            last_error: String::new(),
        }
    }
}

impl AgentState {
    pub fn new(model_id: impl Into<String>) -> Self {
        Self {
            model_id: model_id.into(),
            ..Default::default()
        }
    }

    /// Elapsed seconds for the current task run. Ticks while reviewing,
    /// frozen at the terminal timestamp otherwise.
    pub fn elapsed_seconds(&self) -> Option<f64> {
        let started = self.started_at?;
        let end = if self.status == AgentStatus::Reviewing {
            Utc::now()
        } else {
            self.submitted_at
                .or(self.updated_at)
                .unwrap_or(started)
        };
        let secs = (end - started).num_milliseconds() as f64 / 1000.0;
        Some(secs.max(0.0))
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, AgentStatus::Submitted | AgentStatus::Failed)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentActivity {
    pub model_id: String,
    pub action: String,
    pub target: String,
    pub timestamp: DateTime<Utc>,
}

impl Default for AgentActivity {
    fn default() -> Self {
        Self {
            model_id: String::new(),
            action: String::new(),
            target: String::new(),
            timestamp: Utc::now(),
        }
    }
}

// --- Session-level records ---

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ImplementationContext {
    pub summary: String,
    pub decisions: Vec<String>,
    pub tradeoffs: Vec<String>,
    pub known_issues: Vec<String>,
    pub out_of_scope: Vec<String>,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
}

impl Default for ImplementationContext {
    fn default() -> Self {
        Self {
            summary: String::new(),
            decisions: Vec::new(),
            tradeoffs: Vec::new(),
            known_issues: Vec::new(),
            out_of_scope: Vec::new(),
            submitted_by: String::new(),
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixCommit {
    pub commit_hash: String,
    pub issues_addressed: Vec<String>,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
}

impl Default for FixCommit {
    fn default() -> Self {
        Self {
            commit_hash: String::new(),
            issues_addressed: Vec::new(),
            submitted_by: String::new(),
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueResponse {
    pub issue_id: String,
    pub action: ResponseAction,
    pub reasoning: String,
    pub submitted_by: String,
    pub submitted_at: DateTime<Utc>,
}

impl Default for IssueResponse {
    fn default() -> Self {
        Self {
            issue_id: String::new(),
            action: ResponseAction::Accept,
            reasoning: String::new(),
            submitted_by: String::new(),
            submitted_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IssueDismissal {
    pub issue_id: String,
    pub reasoning: String,
    pub dismissed_by: String,
    pub dismissed_at: DateTime<Utc>,
}

impl Default for IssueDismissal {
    fn default() -> Self {
        Self {
            issue_id: String::new(),
            reasoning: String::new(),
            dismissed_by: String::new(),
            dismissed_at: Utc::now(),
        }
    }
}

// --- Session ---

/// A single code-review job over a `(base, head)` pair.
///
/// Issues, reviews, and access keys are persisted to their own files under
/// the session directory and therefore skipped here; the store reassembles
/// them on load.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Session {
    pub id: String,
    pub repo_path: PathBuf,
    pub base: String,
    pub head: String,
    pub phase: SessionPhase,
    /// Zero-based deliberation turn; turn 0 is the initial raise.
    pub turn: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub agents: Vec<AgentConfig>,
    pub agent_states: HashMap<String, AgentState>,
    pub diff: Vec<DiffFile>,
    pub delta_diff: Vec<DiffFile>,
    pub implementation_context: Option<ImplementationContext>,
    pub fix_commits: Vec<FixCommit>,
    pub issue_responses: Vec<IssueResponse>,
    pub dismissals: Vec<IssueDismissal>,
    pub verification_round: u32,
    pub agent_activities: Vec<AgentActivity>,
    /// Issue ids in insertion order; the issue bodies live in their own files.
    pub issue_order: Vec<String>,
    /// Buffered single-issue reports awaiting the reviewer's summary call.
    pub pending_raw_issues: HashMap<String, Vec<RawIssue>>,
    #[serde(skip)]
    pub issues: Vec<Issue>,
    #[serde(skip)]
    pub reviews: Vec<Review>,
    #[serde(skip)]
    pub keys: AccessKeys,
}

impl Default for Session {
    fn default() -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            repo_path: PathBuf::new(),
            base: "main".to_string(),
            head: String::new(),
            phase: SessionPhase::Idle,
            turn: 0,
            created_at: now,
            updated_at: now,
            agents: Vec::new(),
            agent_states: HashMap::new(),
            diff: Vec::new(),
            delta_diff: Vec::new(),
            implementation_context: None,
            fix_commits: Vec::new(),
            issue_responses: Vec::new(),
            dismissals: Vec::new(),
            verification_round: 0,
            agent_activities: Vec::new(),
            issue_order: Vec::new(),
            pending_raw_issues: HashMap::new(),
            issues: Vec::new(),
            reviews: Vec::new(),
            keys: AccessKeys::default(),
        }
    }
}

impl Session {
    pub fn enabled_agents(&self) -> impl Iterator<Item = &AgentConfig> {
        self.agents.iter().filter(|a| a.enabled)
    }

    pub fn agent(&self, model_id: &str) -> Option<&AgentConfig> {
        self.agents.iter().find(|a| a.id == model_id)
    }

    pub fn issue(&self, issue_id: &str) -> Option<&Issue> {
        self.issues.iter().find(|i| i.id == issue_id)
    }

    pub fn issue_mut(&mut self, issue_id: &str) -> Option<&mut Issue> {
        self.issues.iter_mut().find(|i| i.id == issue_id)
    }

    /// Fix-required issues the author has not yet resolved.
    pub fn unresolved_issues(&self) -> Vec<&Issue> {
        let dismissed: std::collections::HashSet<&str> =
            self.dismissals.iter().map(|d| d.issue_id.as_str()).collect();
        self.issues
            .iter()
            .filter(|i| i.is_fix_required())
            .filter(|i| i.progress_status != ProgressStatus::Completed)
            .filter(|i| !dismissed.contains(i.id.as_str()))
            .collect()
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_id_shape() {
        let id = new_id();
        assert_eq!(id.len(), 12);
        assert!(id.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn test_severity_rank_order() {
        assert!(Severity::Critical.rank() > Severity::High.rank());
        assert!(Severity::High.rank() > Severity::Medium.rank());
        assert!(Severity::Medium.rank() > Severity::Low.rank());
        assert!(Severity::Low.rank() > Severity::Dismissed.rank());
    }

    #[test]
    fn test_normalize_lines_swaps_inverted_range() {
        let (line, start, end) = normalize_lines(None, Some(12), Some(10));
        assert_eq!(start, Some(10));
        assert_eq!(end, Some(12));
        assert_eq!(line, Some(10));
    }

    #[test]
    fn test_normalize_lines_bare_line_fills_range() {
        let (line, start, end) = normalize_lines(Some(7), None, None);
        assert_eq!(line, Some(7));
        assert_eq!(start, Some(7));
        assert_eq!(end, Some(7));
    }

    #[test]
    fn test_normalize_lines_end_only() {
        let (line, start, end) = normalize_lines(None, None, Some(3));
        assert_eq!(line, Some(3));
        assert_eq!(start, Some(3));
        assert_eq!(end, Some(3));
    }

    #[test]
    fn test_vote_bearing_actions() {
        assert!(OpinionAction::Raise.is_vote());
        assert!(OpinionAction::FixRequired.is_vote());
        assert!(OpinionAction::NoFix.is_vote());
        assert!(OpinionAction::FalsePositive.is_vote());
        assert!(!OpinionAction::Comment.is_vote());
        assert!(!OpinionAction::StatusChange.is_vote());
        assert!(!OpinionAction::Withdraw.is_vote());
    }

    #[test]
    fn test_session_unknown_fields_ignored() {
        let json = r#"{"id":"abc123abc123","base":"main","head":"fe1","unknown_field":42}"#;
        let session: Session = serde_json::from_str(json).unwrap();
        assert_eq!(session.id, "abc123abc123");
        assert_eq!(session.head, "fe1");
    }
}
