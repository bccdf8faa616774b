//! Session lifecycle controller.
//!
//! Owns the master state machine (idle → collecting → reviewing → dedup →
//! deliberating → fixing → verifying → complete), schedules reviewer
//! subprocesses, routes submissions through dedup and consensus, and drives
//! the fix/verify loop.
//!
//! Concurrency model: one `tokio::sync::Mutex` per session serializes every
//! mutation; reads go through a refreshed `Arc<Session>` snapshot and never
//! contend. No lock is ever held across a subprocess wait; runners are
//! spawned as detached tasks that re-acquire the lock on exit.

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::auth::HUMAN_MODEL_ID;
use crate::config::ServerConfig;
use crate::consensus;
use crate::dedup;
use crate::error::{Result, ReviewError, UnresolvedIssue};
use crate::events::{EventBus, ReviewEvent};
use crate::models::{
    AgentActivity, AgentConfig, AgentState, AgentStatus, ClientKind, ConsensusType, DiffFile,
    FixCommit, ImplementationContext, Issue, IssueDismissal, IssueResponse, Opinion,
    OpinionAction, ProgressStatus, RawIssue, ResponseAction, Review, Session, Severity, TaskKind,
    normalize_lines,
};
use crate::phase::{SessionPhase, transition};
use crate::prompts;
use crate::repo;
use crate::runner::{ReviewerRunner, RunOutcome, RunReport, StopHandle, build_command};
use crate::store::SessionStore;

const ACTIVITY_DEDUP_SECONDS: i64 = 10;

/// Mention pattern: `@model-id` references inside opinion reasoning.
static MENTION_RE: std::sync::LazyLock<regex::Regex> =
    std::sync::LazyLock::new(|| regex::Regex::new(r"@([A-Za-z0-9_-]+)").unwrap());

struct SessionSlot {
    lock: Mutex<Session>,
    snapshot: RwLock<Arc<Session>>,
}

impl SessionSlot {
    fn new(session: Session) -> Arc<Self> {
        let snapshot = Arc::new(session.clone());
        Arc::new(Self {
            lock: Mutex::new(session),
            snapshot: RwLock::new(snapshot),
        })
    }
}

/// Deferred side effects accumulated under the session lock and executed
/// after the mutation has been committed to the store.
#[derive(Default)]
struct Effects {
    events: Vec<ReviewEvent>,
    spawns: Vec<SpawnRequest>,
    schedule_turn_timer: Option<u32>,
    stop_all_runners: bool,
}

struct SpawnRequest {
    model_id: String,
    prompt: String,
}

// --- API-facing payloads ---

#[derive(Debug, Clone, Deserialize)]
pub struct CreateSessionRequest {
    pub repo_path: String,
    #[serde(default = "default_base")]
    pub base: String,
    pub head: String,
    #[serde(default)]
    pub preset_ids: Option<Vec<String>>,
    #[serde(default)]
    pub implementation_context: Option<ImplementationContextPayload>,
}

fn default_base() -> String {
    "main".to_string()
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ImplementationContextPayload {
    pub summary: String,
    pub decisions: Vec<String>,
    pub tradeoffs: Vec<String>,
    pub known_issues: Vec<String>,
    pub out_of_scope: Vec<String>,
    pub submitted_by: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct SessionSummary {
    pub session_id: String,
    pub phase: SessionPhase,
    pub base: String,
    pub head: String,
    pub repo_path: PathBuf,
    pub review_count: usize,
    pub issue_count: usize,
    pub files_changed: usize,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct AgentStatusEntry {
    pub model_id: String,
    pub status: AgentStatus,
    pub task_kind: TaskKind,
    pub prompt_preview: String,
    pub elapsed_seconds: Option<f64>,
    pub last_reason: String,
    pub strictness: crate::models::Strictness,
    pub color: String,
    pub enabled: bool,
    pub description: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewSummary {
    pub model_id: String,
    pub turn: u32,
    pub summary: String,
    pub issue_count: usize,
    pub submitted_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSummary {
    pub path: String,
    pub status: crate::models::FileChangeStatus,
    pub additions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatusRollup {
    pub session_id: String,
    pub phase: SessionPhase,
    pub turn: u32,
    pub verification_round: u32,
    pub base: String,
    pub head: String,
    pub review_count: usize,
    pub issue_count: usize,
    pub files_changed: usize,
    pub files: Vec<FileSummary>,
    pub agents: Vec<AgentStatusEntry>,
    pub reviews: Vec<ReviewSummary>,
    pub implementation_context: Option<ImplementationContext>,
    pub agent_activities: HashMap<String, Vec<AgentActivity>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewReceipt {
    pub status: &'static str,
    pub review_count: usize,
    pub issue_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReportReceipt {
    pub status: &'static str,
    pub pending_count: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct OpinionReceipt {
    pub status: &'static str,
    pub issue_id: String,
    pub thread_length: usize,
    pub turn: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct FixCompleteReceipt {
    pub status: &'static str,
    pub commit_hash: String,
    pub issues_addressed: Vec<String>,
    pub delta_files_changed: usize,
    pub verification_round: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ProcessReceipt {
    pub phase: SessionPhase,
    pub turn: u32,
    pub raw_issues: usize,
    pub after_dedup: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeltaContext {
    pub session_id: String,
    pub verification_round: u32,
    pub delta_diff: Vec<DiffFile>,
    pub delta_files: Vec<String>,
    pub fix_commits: Vec<FixCommit>,
    pub original_issues: Vec<Issue>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RuntimeInfo {
    pub model_id: String,
    pub status: AgentStatus,
    pub task_kind: TaskKind,
    pub prompt_preview: String,
    pub prompt_full: String,
    pub started_at: Option<DateTime<Utc>>,
    pub submitted_at: Option<DateTime<Utc>>,
    pub elapsed_seconds: Option<f64>,
    pub last_reason: String,
    pub last_output: String,
    pub last_error: String,
    pub pending_issue_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalReportStats {
    pub total_issues_found: usize,
    pub after_dedup: usize,
    pub consensus_reached: usize,
    pub fix_required: usize,
    pub dismissed: usize,
    pub undecided: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct FinalReport {
    pub session_id: String,
    pub phase: SessionPhase,
    pub issues: Vec<Issue>,
    pub issue_responses: Vec<IssueResponse>,
    pub fix_commits: Vec<FixCommit>,
    pub dismissals: Vec<IssueDismissal>,
    pub verification_round: u32,
    pub implementation_context: Option<ImplementationContext>,
    pub stats: FinalReportStats,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextIndexFile {
    pub path: String,
    pub status: crate::models::FileChangeStatus,
    pub additions: u32,
    pub deletions: u32,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextIndex {
    pub session_id: String,
    pub base: String,
    pub head: String,
    pub files: Vec<ContextIndexFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ReviewContext {
    pub diff: String,
    pub files: Vec<String>,
    pub implementation_context: Option<ImplementationContext>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OpinionRequest {
    pub model_id: String,
    pub action: OpinionAction,
    pub reasoning: String,
    #[serde(default)]
    pub suggested_severity: Option<Severity>,
    #[serde(default)]
    pub confidence: Option<f64>,
    #[serde(default)]
    pub mentions: Vec<String>,
}

pub struct SessionManager {
    config: ServerConfig,
    store: SessionStore,
    pub bus: EventBus,
    runner: ReviewerRunner,
    sessions: DashMap<String, Arc<SessionSlot>>,
    presets: RwLock<HashMap<String, AgentConfig>>,
    current_session: parking_lot::Mutex<Option<String>>,
    issue_index: DashMap<String, String>,
    runners: DashMap<String, StopHandle>,
    turn_timers: DashMap<String, tokio::task::JoinHandle<()>>,
    api_base_url: RwLock<String>,
}

impl SessionManager {
    /// Load persisted state and apply boot recovery: reviewers that were
    /// mid-flight when the process died are failed, and sessions stranded
    /// in a runner-driven phase are rewound to a phase the engine can
    /// resume from.
    pub async fn load(config: ServerConfig) -> Result<Arc<Self>> {
        let store = SessionStore::new(config.storage.root.clone());
        store.init().await?;

        let manager = Arc::new(Self {
            bus: EventBus::new(config.server.event_capacity),
            runner: ReviewerRunner::new(config.runner.clone()),
            sessions: DashMap::new(),
            presets: RwLock::new(HashMap::new()),
            current_session: parking_lot::Mutex::new(None),
            issue_index: DashMap::new(),
            runners: DashMap::new(),
            turn_timers: DashMap::new(),
            api_base_url: RwLock::new(format!("http://localhost:{}", config.server.port)),
            store,
            config,
        });

        let mut presets: HashMap<String, AgentConfig> = manager
            .store
            .load_presets()
            .await?
            .into_iter()
            .map(|p| (p.id.clone(), p))
            .collect();
        if presets.is_empty() {
            for preset in default_presets() {
                presets.insert(preset.id.clone(), preset);
            }
            manager.store.save_presets(&presets).await?;
        }
        *manager.presets.write() = presets;

        for mut session in manager.store.load_all().await? {
            recover_session(&mut session);
            manager.store.save_all(&session).await?;
            for issue in &session.issues {
                manager.issue_index.insert(issue.id.clone(), session.id.clone());
            }
            manager
                .sessions
                .insert(session.id.clone(), SessionSlot::new(session));
        }

        info!(sessions = manager.sessions.len(), "session manager loaded");
        Ok(manager)
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    pub fn set_api_base_url(&self, url: impl Into<String>) {
        *self.api_base_url.write() = url.into();
    }

    pub fn api_base_url(&self) -> String {
        self.api_base_url.read().clone()
    }

    // --- Slot plumbing ---

    fn slot(&self, session_id: &str) -> Result<Arc<SessionSlot>> {
        self.sessions
            .get(session_id)
            .map(|entry| Arc::clone(entry.value()))
            .ok_or_else(|| ReviewError::SessionNotFound(session_id.to_string()))
    }

    /// Consistent read snapshot; does not contend with the session lock.
    pub fn snapshot(&self, session_id: &str) -> Result<Arc<Session>> {
        Ok(Arc::clone(&self.slot(session_id)?.snapshot.read()))
    }

    /// Which session owns this issue.
    pub fn session_for_issue(&self, issue_id: &str) -> Result<String> {
        self.session_id_for_issue(issue_id)
    }

    fn session_id_for_issue(&self, issue_id: &str) -> Result<String> {
        self.issue_index
            .get(issue_id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| ReviewError::IssueNotFound(issue_id.to_string()))
    }

    /// Persist the session and refresh the read snapshot. Called with the
    /// session lock held, before any effect is executed.
    async fn commit(&self, slot: &SessionSlot, session: &mut Session) -> Result<()> {
        session.touch();
        self.store.save_all(session).await?;
        *slot.snapshot.write() = Arc::new(session.clone());
        Ok(())
    }

    fn run_effects(self: &Arc<Self>, session_id: &str, effects: Effects) {
        for event in effects.events {
            self.bus.publish(event);
        }
        if effects.stop_all_runners {
            self.stop_session_runners(session_id);
        }
        for spawn in effects.spawns {
            self.spawn_reviewer(session_id, &spawn.model_id, spawn.prompt);
        }
        if let Some(turn) = effects.schedule_turn_timer {
            self.schedule_turn_deadline(session_id, turn);
        }
    }

    // --- Session CRUD ---

    pub async fn create_session(&self, request: CreateSessionRequest) -> Result<SessionSummary> {
        let repo_path = PathBuf::from(&request.repo_path);
        let validation = repo::validate(&repo_path).await?;

        let agents = self.resolve_agents(request.preset_ids.as_deref())?;
        if agents.is_empty() {
            return Err(ReviewError::Validation(
                "no enabled agents resolved from presets".into(),
            ));
        }

        let mut session = Session {
            repo_path: validation.root,
            base: request.base,
            head: request.head,
            agents,
            ..Default::default()
        };
        if let Some(payload) = request.implementation_context {
            session.implementation_context = Some(implementation_context(payload));
        }
        for agent in &session.agents {
            session
                .agent_states
                .insert(agent.id.clone(), AgentState::new(agent.id.clone()));
        }

        let summary = summarize(&session);
        self.store.save_all(&session).await?;
        *self.current_session.lock() = Some(session.id.clone());
        self.sessions
            .insert(session.id.clone(), SessionSlot::new(session));
        info!(session_id = %summary.session_id, "session created");
        Ok(summary)
    }

    fn resolve_agents(&self, preset_ids: Option<&[String]>) -> Result<Vec<AgentConfig>> {
        let presets = self.presets.read();
        match preset_ids {
            Some(ids) => {
                if ids.is_empty() {
                    return Err(ReviewError::Validation(
                        "preset_ids must include at least one preset id".into(),
                    ));
                }
                let mut resolved = Vec::new();
                let mut missing = Vec::new();
                for id in ids {
                    match presets.get(id) {
                        Some(preset) => resolved.push(preset.clone()),
                        None => missing.push(id.clone()),
                    }
                }
                if !missing.is_empty() {
                    return Err(ReviewError::PresetNotFound(missing.join(", ")));
                }
                Ok(resolved)
            }
            None => Ok(presets.values().filter(|p| p.enabled).cloned().collect()),
        }
    }

    pub fn list_sessions(&self) -> Vec<SessionSummary> {
        let mut summaries: Vec<SessionSummary> = self
            .sessions
            .iter()
            .map(|entry| summarize(&entry.value().snapshot.read()))
            .collect();
        summaries.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        summaries
    }

    pub fn activate(&self, session_id: &str) -> Result<()> {
        self.slot(session_id)?;
        *self.current_session.lock() = Some(session_id.to_string());
        Ok(())
    }

    pub fn current_session_id(&self) -> Option<String> {
        self.current_session.lock().clone()
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let slot = self.slot(session_id)?;
        {
            // Serialize against in-flight mutations before tearing down.
            let _guard = slot.lock.lock().await;
            self.stop_session_runners(session_id);
        }
        if let Some(timer) = self.turn_timers.remove(session_id) {
            timer.1.abort();
        }
        self.sessions.remove(session_id);
        self.issue_index.retain(|_, sid| sid != session_id);
        self.bus.remove_session(session_id);
        self.store.delete_session(session_id).await?;
        let mut current = self.current_session.lock();
        if current.as_deref() == Some(session_id) {
            *current = None;
        }
        info!(session_id, "session deleted");
        Ok(())
    }

    // --- Lifecycle: start / reviews / dedup / deliberation ---

    /// Begin collecting: read the diff, mint agent tokens, and fire review
    /// prompts at every enabled reviewer.
    pub async fn start(self: &Arc<Self>, session_id: &str) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        let mut effects = Effects::default();

        session.phase = transition(session.phase, SessionPhase::Collecting)?;
        effects.events.push(phase_event(&session));

        let diff =
            repo::collect_diff(&session.repo_path, &session.base, &session.head).await?;
        session.diff = diff;

        session.phase = transition(session.phase, SessionPhase::Reviewing)?;
        effects.events.push(phase_event(&session));

        let api_base = self.api_base_url();
        let enabled: Vec<AgentConfig> = session.enabled_agents().cloned().collect();
        for agent in &enabled {
            let key = session.keys.ensure_agent_key(&agent.id);
            let ic = session.implementation_context.clone();
            let prompt = prompts::build_review_prompt(
                &session.id,
                agent,
                &api_base,
                &key,
                ic.as_ref(),
            );
            mark_agent_running(&mut session, &agent.id, TaskKind::Review, &prompt, &mut effects);
            effects.spawns.push(SpawnRequest {
                model_id: agent.id.clone(),
                prompt,
            });
        }
        info!(session_id, reviewers = enabled.len(), "review started");

        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(session_id, effects);
        Ok(())
    }

    /// Buffer a single reported issue until the reviewer's summary call.
    pub async fn report_issue(
        &self,
        session_id: &str,
        model_id: &str,
        issue: RawIssue,
    ) -> Result<ReportReceipt> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        if !session.phase.accepts_reviews() {
            return Err(ReviewError::state(
                "report",
                "reviewing|verifying",
                session.phase,
            ));
        }
        if session.agent(model_id).is_none() {
            return Err(ReviewError::AgentNotFound(model_id.to_string()));
        }
        let buffer = session
            .pending_raw_issues
            .entry(model_id.to_string())
            .or_default();
        buffer.push(issue);
        let pending_count = buffer.len();
        self.commit(&slot, &mut session).await?;
        Ok(ReportReceipt {
            status: "accepted",
            pending_count,
        })
    }

    /// Finalize a reviewer's round: flush buffered reports plus any inline
    /// issues into a Review record, then advance the phase if everyone is
    /// terminal.
    pub async fn submit_review(
        self: &Arc<Self>,
        session_id: &str,
        model_id: &str,
        mut issues: Vec<RawIssue>,
        summary: String,
    ) -> Result<ReviewReceipt> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        let mut effects = Effects::default();

        if !session.phase.accepts_reviews() {
            return Err(ReviewError::state(
                "submit_review",
                "reviewing|verifying",
                session.phase,
            ));
        }
        if session.agent(model_id).is_none() {
            return Err(ReviewError::AgentNotFound(model_id.to_string()));
        }

        let mut buffered = session
            .pending_raw_issues
            .remove(model_id)
            .unwrap_or_default();
        buffered.append(&mut issues);

        let turn = session.turn;
        let issue_count = buffered.len();
        match session
            .reviews
            .iter_mut()
            .find(|r| r.model_id == model_id && r.turn == turn)
        {
            Some(existing) => {
                // Serialized duplicate submission in the same turn: both are
                // accepted, merged into the single round record.
                existing.issues.extend(buffered);
                if !summary.is_empty() {
                    existing.summary = summary;
                }
            }
            None => session.reviews.push(Review {
                model_id: model_id.to_string(),
                turn,
                summary,
                issues: buffered,
                submitted_at: Utc::now(),
            }),
        }

        if let Some(state) = session.agent_states.get_mut(model_id) {
            state.status = AgentStatus::Submitted;
            state.submitted_at = Some(Utc::now());
            state.updated_at = Some(Utc::now());
            state.last_reason = "review submitted".to_string();
        }
        effects.events.push(ReviewEvent::ReviewSubmitted {
            session_id: session_id.to_string(),
            model_id: model_id.to_string(),
            issue_count,
        });
        effects.events.push(agent_status_event(&session, model_id));

        let review_count = session.reviews.len();
        if session.phase == SessionPhase::Reviewing {
            self.maybe_advance_reviews(&mut session, &mut effects);
        }

        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(session_id, effects);
        Ok(ReviewReceipt {
            status: "accepted",
            review_count,
            issue_count,
        })
    }

    /// Advance past `reviewing` once every enabled reviewer is terminal and
    /// at least one review exists.
    fn maybe_advance_reviews(self: &Arc<Self>, session: &mut Session, effects: &mut Effects) {
        let enabled: HashSet<String> = session.enabled_agents().map(|a| a.id.clone()).collect();
        if enabled.is_empty() {
            return;
        }
        let finished = session
            .agent_states
            .iter()
            .filter(|(id, state)| enabled.contains(*id) && state.is_terminal())
            .count();
        if finished >= enabled.len() && !session.reviews.is_empty() {
            info!(
                session_id = %session.id,
                reviewers = enabled.len(),
                reviews = session.reviews.len(),
                "all reviewers terminal, advancing"
            );
            self.advance_to_deliberation(session, effects);
        }
    }

    fn advance_to_deliberation(self: &Arc<Self>, session: &mut Session, effects: &mut Effects) {
        if session.phase == SessionPhase::Reviewing {
            session.phase = SessionPhase::Dedup;
            effects.events.push(phase_event(session));
        }

        if session.issues.is_empty() {
            let raised = raise_issues_from_reviews(session);
            let total = raised.len();
            let mut canonical =
                dedup::deduplicate(raised, self.config.dedup.line_proximity);
            dedup::assign_display_numbers(&mut canonical);
            debug!(session_id = %session.id, total, canonical = canonical.len(), "issues created");
            session.issue_order = canonical.iter().map(|i| i.id.clone()).collect();
            for issue in &canonical {
                self.issue_index.insert(issue.id.clone(), session.id.clone());
                effects.events.push(ReviewEvent::IssueCreated {
                    session_id: session.id.clone(),
                    issue_id: issue.id.clone(),
                    title: issue.title.clone(),
                });
            }
            session.issues = canonical;
        }

        let agents = session.agents.clone();
        consensus::apply(&mut session.issues, &agents, &self.config.consensus);

        if session.phase == SessionPhase::Dedup {
            session.phase = SessionPhase::Deliberating;
            effects.events.push(phase_event(session));
        }

        if all_settled(session) {
            self.author_gate(session, effects);
        } else {
            self.trigger_deliberation_round(session, effects);
        }
    }

    /// Fire deliberation prompts at every enabled agent with pending issues.
    fn trigger_deliberation_round(
        self: &Arc<Self>,
        session: &mut Session,
        effects: &mut Effects,
    ) {
        let api_base = self.api_base_url();
        let current_turn = session.turn;
        let agents: Vec<AgentConfig> = session.enabled_agents().cloned().collect();
        for agent in agents {
            // Skip agents that are mid-run, or were already handed a prompt
            // for this turn (their opinions may still arrive out of band).
            let skip = session.agent_states.get(&agent.id).is_some_and(|s| {
                s.status == AgentStatus::Reviewing
                    || (s.task_kind == TaskKind::Deliberation
                        && s.prompted_turn == Some(current_turn))
            });
            if skip {
                continue;
            }
            let pending = pending_issue_ids(session, &agent.id);
            if pending.is_empty() {
                continue;
            }
            let key = session.keys.ensure_agent_key(&agent.id);
            let prompt = prompts::build_deliberation_prompt(
                &session.id,
                &agent,
                &pending,
                &api_base,
                session.turn,
                &key,
            );
            mark_agent_running(session, &agent.id, TaskKind::Deliberation, &prompt, effects);
            effects.spawns.push(SpawnRequest {
                model_id: agent.id.clone(),
                prompt,
            });
        }
        effects.schedule_turn_timer = Some(session.turn);
    }

    // --- Opinions & deliberation advancement ---

    pub async fn submit_opinion(
        self: &Arc<Self>,
        issue_id: &str,
        request: OpinionRequest,
    ) -> Result<OpinionReceipt> {
        let session_id = self.session_id_for_issue(issue_id)?;
        let slot = self.slot(&session_id)?;
        let mut session = slot.lock.lock().await;
        let mut effects = Effects::default();

        let is_human = request.model_id == HUMAN_MODEL_ID;
        let is_human_reopen = is_human && session.phase == SessionPhase::Complete;
        // A raiser may withdraw at any point before the session closes,
        // including while the author is already fixing.
        let is_withdraw = request.action == OpinionAction::Withdraw
            && !session.phase.is_terminal()
            && session.phase != SessionPhase::Idle;
        if !session.phase.accepts_opinions() && !is_human_reopen && !is_withdraw {
            return Err(ReviewError::state(
                "submit_opinion",
                "deliberating|reviewing|verifying",
                session.phase,
            ));
        }

        let phase = session.phase;
        let valid_mentions: HashSet<String> =
            session.agents.iter().map(|a| a.id.clone()).collect();
        let issue = session
            .issue_mut(issue_id)
            .ok_or_else(|| ReviewError::IssueNotFound(issue_id.to_string()))?;

        if issue.is_closed() {
            return Err(ReviewError::state("submit_opinion", "open issue", phase));
        }
        match request.action {
            OpinionAction::Raise => {
                return Err(ReviewError::Validation(
                    "raise is reserved for the initial report".into(),
                ));
            }
            OpinionAction::FalsePositive if request.model_id == issue.raised_by => {
                return Err(ReviewError::Validation(
                    "original raiser cannot mark own issue as false positive".into(),
                ));
            }
            OpinionAction::Withdraw if request.model_id != issue.raised_by => {
                return Err(ReviewError::Validation(
                    "only the original raiser can withdraw an issue".into(),
                ));
            }
            _ => {}
        }

        // A human opinion opens a fresh turn so every reviewer re-examines
        // the issue.
        if is_human {
            issue.turn += 1;
            issue.consensus = Some(false);
            issue.consensus_type = None;
            issue.final_severity = None;
        }
        let target_turn = issue.turn;

        if !is_human
            && request.action != OpinionAction::Withdraw
            && issue
                .thread
                .iter()
                .any(|op| op.model_id == request.model_id && op.turn == target_turn)
        {
            return Ok(OpinionReceipt {
                status: "duplicate",
                issue_id: issue_id.to_string(),
                thread_length: issue.thread.len(),
                turn: target_turn,
            });
        }

        let mut mentions: HashSet<String> = request
            .mentions
            .iter()
            .filter(|m| valid_mentions.contains(*m))
            .cloned()
            .collect();
        for caps in MENTION_RE.captures_iter(&request.reasoning) {
            let name = caps[1].to_string();
            if valid_mentions.contains(&name) {
                mentions.insert(name);
            }
        }
        let mut sorted_mentions: Vec<String> = mentions.into_iter().collect();
        sorted_mentions.sort();

        let mut opinion = Opinion::new(
            request.model_id.clone(),
            request.action,
            request.reasoning.clone(),
        )
        .at_turn(target_turn);
        opinion.suggested_severity = request.suggested_severity;
        opinion.confidence = request.confidence.map(|c| c.clamp(0.0, 1.0));
        opinion.mentions = sorted_mentions;
        issue.thread.push(opinion);

        if request.action == OpinionAction::Withdraw {
            issue.consensus = Some(true);
            issue.consensus_type = Some(ConsensusType::Closed);
            issue.final_severity = Some(Severity::Dismissed);
            effects.events.push(ReviewEvent::IssueStatusChanged {
                session_id: session_id.clone(),
                issue_id: issue_id.to_string(),
                status: "closed".to_string(),
            });
        }

        let thread_length = issue.thread.len();
        effects.events.push(ReviewEvent::OpinionSubmitted {
            session_id: session_id.clone(),
            issue_id: issue_id.to_string(),
            model_id: request.model_id.clone(),
            action: request.action,
            turn: target_turn,
        });

        if is_human_reopen {
            // Reopen bypasses the table: complete is otherwise terminal.
            session.phase = SessionPhase::Deliberating;
            effects.events.push(phase_event(&session));
        }
        if is_human && session.turn < target_turn {
            session.turn = target_turn;
        }

        if !is_human {
            update_agent_reason(
                &mut session,
                &request.model_id,
                format!("opinion submitted for {}", issue_id),
            );
        }

        match session.phase {
            SessionPhase::Deliberating => {
                self.deliberation_tick(&mut session, &mut effects, false)
            }
            // A withdraw during fixing may clear the last unresolved issue.
            SessionPhase::Fixing if request.action == OpinionAction::Withdraw => {
                self.author_gate(&mut session, &mut effects)
            }
            _ => {}
        }

        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(&session_id, effects);
        Ok(OpinionReceipt {
            status: "accepted",
            issue_id: issue_id.to_string(),
            thread_length,
            turn: target_turn,
        })
    }

    /// Re-apply consensus and advance the turn when the round is over.
    /// With `force`, non-responders are skipped (per-turn deadline).
    fn deliberation_tick(self: &Arc<Self>, session: &mut Session, effects: &mut Effects, force: bool) {
        let agents = session.agents.clone();
        consensus::apply(&mut session.issues, &agents, &self.config.consensus);

        if all_settled(session) {
            self.author_gate(session, effects);
            return;
        }

        let enabled_ids: Vec<String> = session.enabled_agents().map(|a| a.id.clone()).collect();
        let mut all_responded = true;
        for id in &enabled_ids {
            let failed = session
                .agent_states
                .get(id)
                .is_some_and(|s| s.status == AgentStatus::Failed);
            if !failed && !pending_issue_ids(session, id).is_empty() {
                all_responded = false;
                break;
            }
        }
        if !all_responded && !force {
            // Round still in flight; make sure idle agents with pending
            // issues have a live prompt.
            self.trigger_deliberation_round(session, effects);
            return;
        }

        // Turn is over. Issues that picked up new votes this turn get
        // another; the rest freeze as undecided for the operator.
        let current_turn = session.turn;
        let mut continuing = 0usize;
        for issue in session.issues.iter_mut() {
            if issue.is_closed() || issue.is_decided() || is_frozen(issue) {
                continue;
            }
            let votes_this_turn = issue
                .thread
                .iter()
                .filter(|op| op.action.is_vote() && op.turn == current_turn)
                .count();
            if votes_this_turn > 0 && current_turn + 1 < self.config.consensus.max_turns {
                issue.turn = current_turn + 1;
                continuing += 1;
            } else {
                issue.consensus = Some(false);
                issue.consensus_type = Some(ConsensusType::Undecided);
            }
        }

        if continuing == 0 {
            self.author_gate(session, effects);
            return;
        }

        session.turn = current_turn + 1;
        // Self-transition: a new deliberation turn is still deliberating.
        session.phase = SessionPhase::Deliberating;
        effects.events.push(phase_event(session));
        let agents = session.agents.clone();
        consensus::apply(&mut session.issues, &agents, &self.config.consensus);
        self.trigger_deliberation_round(session, effects);
    }

    /// Deliberation is over: hand off to the author when fixes are owed,
    /// otherwise the session is complete.
    fn author_gate(self: &Arc<Self>, session: &mut Session, effects: &mut Effects) {
        let unresolved = session.unresolved_issues().len();
        if unresolved > 0 {
            if session.phase != SessionPhase::Fixing
                && session.phase.can_transition_to(SessionPhase::Fixing)
            {
                session.phase = SessionPhase::Fixing;
                effects.events.push(phase_event(session));
                info!(session_id = %session.id, unresolved, "author gate: fixes required");
            }
        } else if session.phase != SessionPhase::Complete {
            session.phase = SessionPhase::Complete;
            effects.events.push(phase_event(session));
            effects.stop_all_runners = true;
            info!(session_id = %session.id, "session complete");
        }
    }

    /// Per-turn deadline: skip agents that never responded and move on.
    fn schedule_turn_deadline(self: &Arc<Self>, session_id: &str, turn: u32) {
        let manager = Arc::clone(self);
        let sid = session_id.to_string();
        let deadline = Duration::from_secs(self.config.consensus.turn_deadline_secs);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(deadline).await;
            if let Err(e) = manager.force_turn_advance(&sid, turn).await {
                debug!(session_id = %sid, error = %e, "turn deadline tick skipped");
            }
        });
        if let Some(previous) = self.turn_timers.insert(session_id.to_string(), handle) {
            previous.abort();
        }
    }

    async fn force_turn_advance(self: &Arc<Self>, session_id: &str, turn: u32) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        if session.phase != SessionPhase::Deliberating || session.turn != turn {
            return Ok(());
        }
        warn!(session_id, turn, "turn deadline reached, skipping non-responders");
        let mut effects = Effects::default();
        self.deliberation_tick(&mut session, &mut effects, true);
        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(session_id, effects);
        Ok(())
    }

    /// Manual advance: `process` drives dedup from reviewing, or forces the
    /// current deliberation turn to a close.
    pub async fn process(self: &Arc<Self>, session_id: &str) -> Result<ProcessReceipt> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        let mut effects = Effects::default();

        let raw_count: usize = session.reviews.iter().map(Review::issue_count).sum();
        match session.phase {
            SessionPhase::Reviewing => {
                self.advance_to_deliberation(&mut session, &mut effects);
            }
            SessionPhase::Deliberating => {
                self.deliberation_tick(&mut session, &mut effects, true);
            }
            phase => {
                return Err(ReviewError::state(
                    "process",
                    "reviewing|deliberating",
                    phase,
                ));
            }
        }

        let receipt = ProcessReceipt {
            phase: session.phase,
            turn: session.turn,
            raw_issues: raw_count,
            after_dedup: session.issues.len(),
        };
        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(session_id, effects);
        Ok(receipt)
    }

    // --- Finish / fix / verify ---

    pub async fn finish(self: &Arc<Self>, session_id: &str, force: bool) -> Result<FinalReport> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        let mut effects = Effects::default();

        let agents = session.agents.clone();
        consensus::apply(&mut session.issues, &agents, &self.config.consensus);

        if force {
            if session.phase != SessionPhase::Complete {
                // Operator override: bypasses verification and the table.
                session.phase = SessionPhase::Complete;
                effects.events.push(phase_event(&session));
            }
            effects.stop_all_runners = true;
        } else {
            let unresolved: Vec<UnresolvedIssue> = session
                .unresolved_issues()
                .iter()
                .map(|i| UnresolvedIssue {
                    id: i.id.clone(),
                    title: i.title.clone(),
                    file: i.file.clone(),
                    severity: i.effective_severity().to_string(),
                })
                .collect();
            if !unresolved.is_empty() {
                return Err(ReviewError::UnresolvedIssues(unresolved));
            }
            if session.phase != SessionPhase::Complete {
                session.phase = transition(session.phase, SessionPhase::Complete)?;
                effects.events.push(phase_event(&session));
                effects.stop_all_runners = true;
            }
        }

        let report = final_report(&session);
        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(session_id, effects);
        Ok(report)
    }

    /// Record a fix commit, capture the delta diff, and move to verifying.
    pub async fn fix_complete(
        self: &Arc<Self>,
        session_id: &str,
        commit_hash: String,
        issue_ids: Option<Vec<String>>,
        submitted_by: String,
    ) -> Result<FixCompleteReceipt> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        let mut effects = Effects::default();

        if session.phase != SessionPhase::Fixing {
            return Err(ReviewError::state("fix_complete", "fixing", session.phase));
        }

        let confirmed: HashSet<String> = session
            .unresolved_issues()
            .iter()
            .map(|i| i.id.clone())
            .collect();
        let addressed = match issue_ids {
            Some(ids) => {
                for id in &ids {
                    if !confirmed.contains(id) {
                        return Err(ReviewError::IssueNotFound(format!(
                            "{} (not an unresolved fix_required issue)",
                            id
                        )));
                    }
                }
                ids
            }
            None => {
                let mut ids: Vec<String> = confirmed.iter().cloned().collect();
                ids.sort();
                ids
            }
        };

        let paths: Vec<String> = {
            let mut seen = HashSet::new();
            session
                .issues
                .iter()
                .filter(|i| addressed.contains(&i.id))
                .map(|i| i.file.clone())
                .filter(|f| seen.insert(f.clone()))
                .collect()
        };

        let prev_head = session.head.clone();
        let delta =
            repo::delta(&session.repo_path, &prev_head, &commit_hash, &paths).await?;
        let delta_files_changed = delta.len();
        session.delta_diff = delta;
        session.head = commit_hash.clone();
        session.verification_round += 1;
        session.issue_responses.clear();
        session.fix_commits.push(FixCommit {
            commit_hash: commit_hash.clone(),
            issues_addressed: addressed.clone(),
            submitted_by,
            submitted_at: Utc::now(),
        });

        // Verification opinions and responses land on a fresh turn.
        session.turn += 1;
        let verification_turn = session.turn;
        for issue in session.issues.iter_mut() {
            if issue.is_fix_required() && issue.progress_status != ProgressStatus::Completed {
                issue.turn = verification_turn;
            }
        }

        session.phase = transition(session.phase, SessionPhase::Verifying)?;
        effects.events.push(phase_event(&session));

        // Notify the raisers of the addressed issues to inspect the delta.
        let api_base = self.api_base_url();
        let raisers: HashSet<String> = session
            .issues
            .iter()
            .filter(|i| addressed.contains(&i.id))
            .map(|i| i.raised_by.clone())
            .collect();
        let verification_round = session.verification_round;
        let agents: Vec<AgentConfig> = session
            .enabled_agents()
            .filter(|a| raisers.contains(&a.id))
            .cloned()
            .collect();
        for agent in agents {
            let key = session.keys.ensure_agent_key(&agent.id);
            let prompt = prompts::build_verification_prompt(
                &session.id,
                &agent,
                &api_base,
                verification_round,
                &key,
            );
            mark_agent_running(&mut session, &agent.id, TaskKind::Verification, &prompt, &mut effects);
            effects.spawns.push(SpawnRequest {
                model_id: agent.id.clone(),
                prompt,
            });
        }

        info!(
            session_id,
            commit = %commit_hash,
            round = verification_round,
            addressed = addressed.len(),
            "fix recorded, verification started"
        );

        let receipt = FixCompleteReceipt {
            status: "accepted",
            commit_hash,
            issues_addressed: addressed,
            delta_files_changed,
            verification_round,
        };
        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(session_id, effects);
        Ok(receipt)
    }

    /// Raiser verdict on a fix: accept, dispute, or partial.
    pub async fn respond(
        self: &Arc<Self>,
        issue_id: &str,
        model_id: &str,
        action: ResponseAction,
        reasoning: String,
    ) -> Result<OpinionReceipt> {
        let session_id = self.session_id_for_issue(issue_id)?;
        let slot = self.slot(&session_id)?;
        let mut session = slot.lock.lock().await;
        let mut effects = Effects::default();

        if session.phase != SessionPhase::Verifying {
            return Err(ReviewError::state("respond", "verifying", session.phase));
        }
        if session
            .issue_responses
            .iter()
            .any(|r| r.issue_id == issue_id)
        {
            return Err(ReviewError::Validation(format!(
                "duplicate response for issue {}",
                issue_id
            )));
        }

        let phase = session.phase;
        let issue = session
            .issue_mut(issue_id)
            .ok_or_else(|| ReviewError::IssueNotFound(issue_id.to_string()))?;
        if !issue.is_fix_required() {
            return Err(ReviewError::state("respond", "fix_required issue", phase));
        }
        if model_id != issue.raised_by && model_id != HUMAN_MODEL_ID {
            return Err(ReviewError::Validation(format!(
                "only the raiser ({}) may respond to this issue",
                issue.raised_by
            )));
        }

        let turn = issue.turn;
        match action {
            ResponseAction::Accept => {
                issue.progress_status = ProgressStatus::Completed;
                effects.events.push(ReviewEvent::IssueStatusChanged {
                    session_id: session_id.clone(),
                    issue_id: issue_id.to_string(),
                    status: "completed".to_string(),
                });
            }
            ResponseAction::Dispute => {
                issue.thread.push(
                    Opinion::new(
                        model_id,
                        OpinionAction::FixRequired,
                        format!("[dispute] {}", reasoning),
                    )
                    .at_turn(turn),
                );
            }
            ResponseAction::Partial => {
                issue.thread.push(
                    Opinion::new(
                        model_id,
                        OpinionAction::Comment,
                        format!("[partial] {}", reasoning),
                    )
                    .at_turn(turn),
                );
            }
        }
        let thread_length = issue.thread.len();

        session.issue_responses.push(IssueResponse {
            issue_id: issue_id.to_string(),
            action,
            reasoning,
            submitted_by: model_id.to_string(),
            submitted_at: Utc::now(),
        });

        self.check_verification_complete(&mut session, &mut effects);

        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(&session_id, effects);
        Ok(OpinionReceipt {
            status: "accepted",
            issue_id: issue_id.to_string(),
            thread_length,
            turn,
        })
    }

    /// Once every outstanding fix-required issue has a raiser verdict:
    /// all accepted → complete; any dispute within the round cap → back to
    /// fixing; round cap reached → complete with the rest frozen undecided.
    fn check_verification_complete(
        self: &Arc<Self>,
        session: &mut Session,
        effects: &mut Effects,
    ) {
        let responded: HashSet<&str> = session
            .issue_responses
            .iter()
            .map(|r| r.issue_id.as_str())
            .collect();
        let outstanding = session
            .unresolved_issues()
            .iter()
            .filter(|i| !responded.contains(i.id.as_str()))
            .count();
        if outstanding > 0 {
            return;
        }

        let all_accepted = session
            .issue_responses
            .iter()
            .all(|r| r.action == ResponseAction::Accept);
        if all_accepted {
            session.phase = SessionPhase::Complete;
            effects.events.push(phase_event(session));
            effects.stop_all_runners = true;
            info!(session_id = %session.id, "verification passed, session complete");
            return;
        }

        if session.verification_round >= self.config.consensus.max_verification_rounds {
            // Round cap: whatever the author could not land stays undecided.
            for issue in session.issues.iter_mut() {
                if issue.is_fix_required() && issue.progress_status != ProgressStatus::Completed {
                    issue.consensus = Some(false);
                    issue.consensus_type = Some(ConsensusType::Undecided);
                }
            }
            session.phase = SessionPhase::Complete;
            effects.events.push(phase_event(session));
            effects.stop_all_runners = true;
            warn!(
                session_id = %session.id,
                rounds = session.verification_round,
                "verification round cap reached, completing with undecided issues"
            );
            return;
        }

        session.phase = SessionPhase::Fixing;
        effects.events.push(phase_event(session));
        info!(session_id = %session.id, "fix disputed, returning to fixing");
    }

    /// Operator dismissal of a fix-required issue during fixing.
    pub async fn dismiss_issue(
        self: &Arc<Self>,
        issue_id: &str,
        reasoning: String,
        dismissed_by: String,
    ) -> Result<()> {
        let session_id = self.session_id_for_issue(issue_id)?;
        let slot = self.slot(&session_id)?;
        let mut session = slot.lock.lock().await;
        let mut effects = Effects::default();

        if session.phase != SessionPhase::Fixing {
            return Err(ReviewError::state("dismiss", "fixing", session.phase));
        }
        let phase = session.phase;
        {
            let issue = session
                .issue(issue_id)
                .ok_or_else(|| ReviewError::IssueNotFound(issue_id.to_string()))?;
            if !issue.is_fix_required() {
                return Err(ReviewError::state("dismiss", "fix_required issue", phase));
            }
        }
        if session.dismissals.iter().any(|d| d.issue_id == issue_id) {
            return Err(ReviewError::Validation(format!(
                "already dismissed: {}",
                issue_id
            )));
        }
        session.dismissals.push(IssueDismissal {
            issue_id: issue_id.to_string(),
            reasoning,
            dismissed_by,
            dismissed_at: Utc::now(),
        });
        effects.events.push(ReviewEvent::IssueStatusChanged {
            session_id: session_id.clone(),
            issue_id: issue_id.to_string(),
            status: "dismissed".to_string(),
        });

        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(&session_id, effects);
        Ok(())
    }

    /// Author progress marker on an issue (`fixed`, `wont_fix`, `completed`).
    pub async fn set_issue_status(
        self: &Arc<Self>,
        issue_id: &str,
        status: ProgressStatus,
        reasoning: String,
        submitted_by: String,
    ) -> Result<()> {
        let session_id = self.session_id_for_issue(issue_id)?;
        let slot = self.slot(&session_id)?;
        let mut session = slot.lock.lock().await;
        let mut effects = Effects::default();

        // `completed` is reserved for the verification pass (I3).
        if status == ProgressStatus::Completed {
            return Err(ReviewError::Validation(
                "completed is set by verification, not by status calls".into(),
            ));
        }

        let turn = session.turn;
        let phase = session.phase;
        let issue = session
            .issue_mut(issue_id)
            .ok_or_else(|| ReviewError::IssueNotFound(issue_id.to_string()))?;
        if issue.is_closed() {
            return Err(ReviewError::state("set_issue_status", "open issue", phase));
        }
        let previous = issue.progress_status;
        issue.progress_status = status;
        let mut opinion = Opinion::new(
            submitted_by,
            OpinionAction::StatusChange,
            reasoning,
        )
        .at_turn(turn.min(issue.turn));
        opinion.previous_status = Some(previous.to_string());
        opinion.status_value = Some(status.to_string());
        issue.thread.push(opinion);

        effects.events.push(ReviewEvent::IssueStatusChanged {
            session_id: session_id.clone(),
            issue_id: issue_id.to_string(),
            status: status.to_string(),
        });

        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(&session_id, effects);
        Ok(())
    }

    /// Operator-raised issue (the human acting as a synthetic reviewer).
    pub async fn add_manual_issue(
        self: &Arc<Self>,
        session_id: &str,
        raw: RawIssue,
    ) -> Result<Issue> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        let mut effects = Effects::default();

        if !matches!(
            session.phase,
            SessionPhase::Reviewing | SessionPhase::Deliberating
        ) {
            return Err(ReviewError::state(
                "add_issue",
                "reviewing|deliberating",
                session.phase,
            ));
        }

        let (line, start, end) = normalize_lines(raw.line, raw.line_start, raw.line_end);
        let mut issue = Issue {
            title: raw.title.clone(),
            severity: raw.severity,
            file: raw.file.clone(),
            line,
            line_start: start,
            line_end: end,
            description: raw.description.clone(),
            suggestion: raw.suggestion.clone(),
            raised_by: HUMAN_MODEL_ID.to_string(),
            turn: session.turn,
            group_key: dedup::group_key(&raw.file, &raw.title),
            ..Default::default()
        };
        issue.thread.push(
            Opinion::new(HUMAN_MODEL_ID, OpinionAction::Raise, raw.description)
                .with_severity(raw.severity)
                .at_turn(session.turn),
        );
        let issue_id = issue.id.clone();

        session.issue_order.push(issue_id.clone());
        session.issues.push(issue);
        dedup::assign_display_numbers(&mut session.issues);
        self.issue_index.insert(issue_id.clone(), session_id.to_string());

        effects.events.push(ReviewEvent::IssueCreated {
            session_id: session_id.to_string(),
            issue_id: issue_id.clone(),
            title: raw.title,
        });

        let created = session.issue(&issue_id).cloned();
        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(session_id, effects);
        created.ok_or_else(|| ReviewError::IssueNotFound(issue_id))
    }

    // --- Runner supervision glue ---

    fn runner_key(session_id: &str, model_id: &str) -> String {
        format!("{}:{}", session_id, model_id)
    }

    fn spawn_reviewer(self: &Arc<Self>, session_id: &str, model_id: &str, prompt: String) {
        if !self.config.runner.autospawn {
            debug!(session_id, model_id, "autospawn disabled, reviewer triggered externally");
            return;
        }
        let snapshot = match self.snapshot(session_id) {
            Ok(s) => s,
            Err(_) => return,
        };
        let Some(agent) = snapshot.agent(model_id).cloned() else {
            return;
        };
        let spec = match build_command(&agent, &prompt) {
            Ok(spec) => spec,
            Err(e) => {
                warn!(session_id, model_id, error = %e, "cannot build client command");
                return;
            }
        };

        let key = Self::runner_key(session_id, model_id);
        let (stop, stop_rx) = ReviewerRunner::stop_channel();
        if let Some(previous) = self.runners.insert(key.clone(), stop) {
            previous.stop();
        }

        let manager = Arc::clone(self);
        let sid = session_id.to_string();
        let mid = model_id.to_string();
        tokio::spawn(async move {
            let report = manager.runner.run(&spec, stop_rx).await;
            manager.runners.remove(&key);
            if let Err(e) = manager.handle_runner_exit(&sid, &mid, report).await {
                warn!(session_id = %sid, model_id = %mid, error = %e, "runner exit handling failed");
            }
        });
    }

    async fn handle_runner_exit(
        self: &Arc<Self>,
        session_id: &str,
        model_id: &str,
        report: RunReport,
    ) -> Result<()> {
        let slot = match self.slot(session_id) {
            Ok(slot) => slot,
            // Session deleted while the runner was in flight.
            Err(_) => return Ok(()),
        };
        let mut session = slot.lock.lock().await;
        let mut effects = Effects::default();

        let limit = self.config.runner.runtime_text_limit;
        let task_kind = session
            .agent_states
            .get(model_id)
            .map(|s| s.task_kind)
            .unwrap_or_default();
        let still_running = session
            .agent_states
            .get(model_id)
            .is_some_and(|s| s.status == AgentStatus::Reviewing);

        if let Some(state) = session.agent_states.get_mut(model_id) {
            state.last_output = clip(&report.stdout_tail, limit);
            state.last_error = clip(&report.stderr_tail, limit);
            state.updated_at = Some(Utc::now());
        }

        match report.outcome {
            RunOutcome::Cancelled => {
                if still_running {
                    fail_agent(&mut session, model_id, "cancelled", &mut effects);
                }
            }
            RunOutcome::TimedOut => {
                if still_running {
                    if task_kind == TaskKind::Review {
                        // Zero submissions at the deadline count as an empty
                        // review so the round can close.
                        let turn = session.turn;
                        if !session
                            .reviews
                            .iter()
                            .any(|r| r.model_id == model_id && r.turn == turn)
                        {
                            session.reviews.push(Review {
                                model_id: model_id.to_string(),
                                turn,
                                summary: String::new(),
                                issues: Vec::new(),
                                submitted_at: Utc::now(),
                            });
                        }
                    }
                    fail_agent(&mut session, model_id, "deadline exceeded", &mut effects);
                }
            }
            RunOutcome::Failed(reason) => {
                if still_running {
                    fail_agent(&mut session, model_id, &reason, &mut effects);
                }
            }
            RunOutcome::Completed { exit_ok: false } => {
                if still_running {
                    fail_agent(
                        &mut session,
                        model_id,
                        "client exited with an error",
                        &mut effects,
                    );
                }
            }
            RunOutcome::Completed { exit_ok: true } => {
                if still_running {
                    match task_kind {
                        TaskKind::Review => fail_agent(
                            &mut session,
                            model_id,
                            "completed without submitting review",
                            &mut effects,
                        ),
                        TaskKind::Deliberation | TaskKind::Verification => {
                            // The client finished but the opinions may still
                            // arrive out of band; park the agent.
                            if let Some(state) = session.agent_states.get_mut(model_id) {
                                state.status = AgentStatus::Idle;
                                state.last_reason = format!("{} pending", task_kind);
                                state.submitted_at = Some(Utc::now());
                            }
                            effects.events.push(agent_status_event(&session, model_id));
                        }
                    }
                }
            }
        }

        if session.phase == SessionPhase::Reviewing {
            self.maybe_advance_reviews(&mut session, &mut effects);
        }

        self.commit(&slot, &mut session).await?;
        drop(session);
        self.run_effects(session_id, effects);
        Ok(())
    }

    /// Stop every runner belonging to a session (delete / force finish).
    pub fn stop_session_runners(&self, session_id: &str) {
        let prefix = format!("{}:", session_id);
        let keys: Vec<String> = self
            .runners
            .iter()
            .map(|e| e.key().clone())
            .filter(|k| k.starts_with(&prefix))
            .collect();
        for key in keys {
            if let Some((_, stop)) = self.runners.remove(&key) {
                stop.stop();
            }
        }
        if let Some((_, timer)) = self.turn_timers.remove(session_id) {
            timer.abort();
        }
    }

    // --- Queries ---

    pub fn status(&self, session_id: &str) -> Result<StatusRollup> {
        let session = self.snapshot(session_id)?;
        Ok(status_rollup(&session, self.config.runner.activity_capacity))
    }

    pub fn issues(&self, session_id: &str) -> Result<Vec<Issue>> {
        Ok(self.snapshot(session_id)?.issues.clone())
    }

    pub fn issue_thread(&self, issue_id: &str) -> Result<Issue> {
        let session_id = self.session_id_for_issue(issue_id)?;
        let session = self.snapshot(&session_id)?;
        session
            .issue(issue_id)
            .cloned()
            .ok_or_else(|| ReviewError::IssueNotFound(issue_id.to_string()))
    }

    pub fn pending_issues(&self, session_id: &str, model_id: &str) -> Result<Vec<Issue>> {
        let session = self.snapshot(session_id)?;
        let ids = pending_issue_ids(&session, model_id);
        Ok(session
            .issues
            .iter()
            .filter(|i| ids.contains(&i.id))
            .cloned()
            .collect())
    }

    pub fn file_diff(&self, session_id: &str, path: &str) -> Result<DiffFile> {
        let session = self.snapshot(session_id)?;
        session
            .diff
            .iter()
            .find(|f| f.path == path)
            .cloned()
            .ok_or_else(|| {
                ReviewError::repo(
                    crate::error::RepoErrorKind::NoSuchPath,
                    format!("file not in diff: {}", path),
                )
            })
    }

    pub async fn read_file(
        &self,
        session_id: &str,
        path: &str,
        start: Option<u32>,
        end: Option<u32>,
    ) -> Result<repo::FileSlice> {
        let session = self.snapshot(session_id)?;
        repo::read(&session.repo_path, &session.head, path, start, end).await
    }

    pub fn context_index(&self, session_id: &str) -> Result<ContextIndex> {
        let session = self.snapshot(session_id)?;
        Ok(ContextIndex {
            session_id: session.id.clone(),
            base: session.base.clone(),
            head: session.head.clone(),
            files: session
                .diff
                .iter()
                .map(|f| ContextIndexFile {
                    path: f.path.clone(),
                    status: f.status,
                    additions: f.additions,
                    deletions: f.deletions,
                })
                .collect(),
        })
    }

    pub fn review_context(&self, session_id: &str, file: Option<&str>) -> Result<ReviewContext> {
        let session = self.snapshot(session_id)?;
        let diff = session
            .diff
            .iter()
            .filter(|f| file.is_none_or(|wanted| f.path == wanted))
            .filter(|f| !f.content.is_empty())
            .map(|f| f.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");
        Ok(ReviewContext {
            diff,
            files: session.diff.iter().map(|f| f.path.clone()).collect(),
            implementation_context: session.implementation_context.clone(),
        })
    }

    pub fn delta_context(&self, session_id: &str) -> Result<DeltaContext> {
        let session = self.snapshot(session_id)?;
        Ok(DeltaContext {
            session_id: session.id.clone(),
            verification_round: session.verification_round,
            delta_files: session.delta_diff.iter().map(|f| f.path.clone()).collect(),
            delta_diff: session.delta_diff.clone(),
            fix_commits: session.fix_commits.clone(),
            original_issues: session
                .issues
                .iter()
                .filter(|i| i.is_fix_required())
                .cloned()
                .collect(),
        })
    }

    pub fn final_report(&self, session_id: &str) -> Result<FinalReport> {
        Ok(final_report(&*self.snapshot(session_id)?))
    }

    pub fn agent_runtime(&self, session_id: &str, model_id: &str) -> Result<RuntimeInfo> {
        let session = self.snapshot(session_id)?;
        let state = session
            .agent_states
            .get(model_id)
            .ok_or_else(|| ReviewError::AgentNotFound(model_id.to_string()))?;
        Ok(RuntimeInfo {
            model_id: model_id.to_string(),
            status: state.status,
            task_kind: state.task_kind,
            prompt_preview: state.prompt_preview.clone(),
            prompt_full: state.prompt_full.clone(),
            started_at: state.started_at,
            submitted_at: state.submitted_at,
            elapsed_seconds: state.elapsed_seconds(),
            last_reason: state.last_reason.clone(),
            last_output: state.last_output.clone(),
            last_error: state.last_error.clone(),
            pending_issue_ids: pending_issue_ids(&session, model_id),
        })
    }

    // --- Identity ---

    pub fn authorize(&self, session_id: &str, model_id: &str, key: &str) -> Result<()> {
        self.snapshot(session_id)?.keys.authorize(model_id, key)
    }

    pub fn authorize_issue_call(&self, issue_id: &str, model_id: &str, key: &str) -> Result<String> {
        let session_id = self.session_id_for_issue(issue_id)?;
        self.authorize(&session_id, model_id, key)?;
        Ok(session_id)
    }

    /// Reverse-lookup the identity behind an agent key for an issue-scoped
    /// call that carries no explicit model id.
    pub fn resolve_model_for_issue(&self, issue_id: &str, key: &str) -> Result<String> {
        let session_id = self.session_id_for_issue(issue_id)?;
        let session = self.snapshot(&session_id)?;
        session
            .keys
            .resolve_model_id(key)
            .map(str::to_string)
            .ok_or_else(|| ReviewError::Auth("unknown agent key".into()))
    }

    pub async fn issue_human_assist_key(&self, session_id: &str) -> Result<String> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        let key = session.keys.rotate_human_assist_key();
        self.commit(&slot, &mut session).await?;
        Ok(key)
    }

    // --- Activity / implementation context / agent CRUD ---

    /// Record an agent activity event. Duplicate (model, action, target)
    /// tuples inside the dedup window are suppressed.
    pub async fn record_activity(
        &self,
        session_id: &str,
        model_id: &str,
        action: String,
        target: String,
    ) -> Result<bool> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;

        let now = Utc::now();
        let duplicate = session
            .agent_activities
            .iter()
            .rev()
            .find(|a| a.model_id == model_id)
            .is_some_and(|a| {
                a.action == action
                    && a.target == target
                    && (now - a.timestamp).num_seconds() < ACTIVITY_DEDUP_SECONDS
            });
        if duplicate {
            return Ok(false);
        }

        session.agent_activities.push(AgentActivity {
            model_id: model_id.to_string(),
            action: action.clone(),
            target: target.clone(),
            timestamp: now,
        });
        // Bound the buffer per model, dropping oldest.
        let cap = self.config.runner.activity_capacity;
        let count = session
            .agent_activities
            .iter()
            .filter(|a| a.model_id == model_id)
            .count();
        if count > cap {
            let mut to_drop = count - cap;
            session.agent_activities.retain(|a| {
                if to_drop > 0 && a.model_id == model_id {
                    to_drop -= 1;
                    false
                } else {
                    true
                }
            });
        }

        self.commit(&slot, &mut session).await?;
        drop(session);
        self.bus.publish(ReviewEvent::AgentActivity {
            session_id: session_id.to_string(),
            model_id: model_id.to_string(),
            action,
            target,
        });
        Ok(true)
    }

    pub async fn submit_implementation_context(
        &self,
        session_id: &str,
        payload: ImplementationContextPayload,
    ) -> Result<ImplementationContext> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        if !matches!(
            session.phase,
            SessionPhase::Idle | SessionPhase::Collecting | SessionPhase::Reviewing
        ) {
            return Err(ReviewError::state(
                "implementation_context",
                "idle|collecting|reviewing",
                session.phase,
            ));
        }
        let ic = implementation_context(payload);
        session.implementation_context = Some(ic.clone());
        self.commit(&slot, &mut session).await?;
        Ok(ic)
    }

    pub fn list_agents(&self, session_id: &str) -> Result<Vec<AgentConfig>> {
        Ok(self.snapshot(session_id)?.agents.clone())
    }

    pub async fn add_agent(&self, session_id: &str, agent: AgentConfig) -> Result<AgentConfig> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        if agent.id.is_empty() {
            return Err(ReviewError::Validation("agent id must not be empty".into()));
        }
        if session.agent(&agent.id).is_some() {
            return Err(ReviewError::Validation(format!(
                "agent already exists: {}",
                agent.id
            )));
        }
        session
            .agent_states
            .insert(agent.id.clone(), AgentState::new(agent.id.clone()));
        session.keys.ensure_agent_key(&agent.id);
        session.agents.push(agent.clone());
        self.commit(&slot, &mut session).await?;
        drop(session);
        self.bus.publish(ReviewEvent::AgentConfigChanged {
            session_id: session_id.to_string(),
            model_id: agent.id.clone(),
        });
        Ok(agent)
    }

    pub async fn update_agent(
        &self,
        session_id: &str,
        model_id: &str,
        updated: AgentConfig,
    ) -> Result<AgentConfig> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        let agent = session
            .agents
            .iter_mut()
            .find(|a| a.id == model_id)
            .ok_or_else(|| ReviewError::AgentNotFound(model_id.to_string()))?;
        // The id is immutable.
        let id = agent.id.clone();
        *agent = AgentConfig { id, ..updated };
        let result = agent.clone();
        self.commit(&slot, &mut session).await?;
        drop(session);
        self.bus.publish(ReviewEvent::AgentConfigChanged {
            session_id: session_id.to_string(),
            model_id: model_id.to_string(),
        });
        Ok(result)
    }

    pub async fn remove_agent(&self, session_id: &str, model_id: &str) -> Result<()> {
        let slot = self.slot(session_id)?;
        let mut session = slot.lock.lock().await;
        let before = session.agents.len();
        session.agents.retain(|a| a.id != model_id);
        if session.agents.len() == before {
            return Err(ReviewError::AgentNotFound(model_id.to_string()));
        }
        session.agent_states.remove(model_id);
        session.keys.remove_agent(model_id);
        self.commit(&slot, &mut session).await?;
        drop(session);
        if let Some((_, stop)) = self
            .runners
            .remove(&Self::runner_key(session_id, model_id))
        {
            stop.stop();
        }
        self.bus.publish(ReviewEvent::AgentConfigChanged {
            session_id: session_id.to_string(),
            model_id: model_id.to_string(),
        });
        Ok(())
    }

    // --- Presets ---

    pub fn list_presets(&self) -> Vec<AgentConfig> {
        let mut list: Vec<AgentConfig> = self.presets.read().values().cloned().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        list
    }

    pub async fn add_preset(&self, preset: AgentConfig) -> Result<AgentConfig> {
        if preset.id.is_empty() {
            return Err(ReviewError::Validation("preset id must not be empty".into()));
        }
        let snapshot = {
            let mut presets = self.presets.write();
            if presets.contains_key(&preset.id) {
                return Err(ReviewError::Validation(format!(
                    "preset already exists: {}",
                    preset.id
                )));
            }
            presets.insert(preset.id.clone(), preset.clone());
            presets.clone()
        };
        self.store.save_presets(&snapshot).await?;
        Ok(preset)
    }

    pub async fn update_preset(&self, preset_id: &str, updated: AgentConfig) -> Result<AgentConfig> {
        let (result, snapshot) = {
            let mut presets = self.presets.write();
            let preset = presets
                .get_mut(preset_id)
                .ok_or_else(|| ReviewError::PresetNotFound(preset_id.to_string()))?;
            let id = preset.id.clone();
            *preset = AgentConfig { id, ..updated };
            (preset.clone(), presets.clone())
        };
        self.store.save_presets(&snapshot).await?;
        Ok(result)
    }

    pub async fn remove_preset(&self, preset_id: &str) -> Result<()> {
        let snapshot = {
            let mut presets = self.presets.write();
            if presets.remove(preset_id).is_none() {
                return Err(ReviewError::PresetNotFound(preset_id.to_string()));
            }
            presets.clone()
        };
        self.store.save_presets(&snapshot).await?;
        Ok(())
    }

    // --- Assist glue (called by the assist engine) ---

    pub async fn append_assist_message(
        &self,
        issue_id: &str,
        role: &str,
        content: String,
    ) -> Result<Vec<crate::models::AssistMessage>> {
        let session_id = self.session_id_for_issue(issue_id)?;
        let slot = self.slot(&session_id)?;
        let mut session = slot.lock.lock().await;
        let issue = session
            .issue_mut(issue_id)
            .ok_or_else(|| ReviewError::IssueNotFound(issue_id.to_string()))?;
        issue.assist_messages.push(crate::models::AssistMessage {
            role: role.to_string(),
            content,
            timestamp: Utc::now(),
        });
        let messages = issue.assist_messages.clone();
        self.commit(&slot, &mut session).await?;
        Ok(messages)
    }
}

// --- Free helpers (pure functions over Session) ---

fn default_presets() -> Vec<AgentConfig> {
    vec![
        AgentConfig {
            id: "preset-claude-code".into(),
            client_kind: ClientKind::ClaudeCode,
            color: "#8B5CF6".into(),
            ..Default::default()
        },
        AgentConfig {
            id: "preset-codex".into(),
            client_kind: ClientKind::Codex,
            color: "#22C55E".into(),
            ..Default::default()
        },
        AgentConfig {
            id: "preset-gemini".into(),
            client_kind: ClientKind::Gemini,
            color: "#3B82F6".into(),
            ..Default::default()
        },
    ]
}

fn implementation_context(payload: ImplementationContextPayload) -> ImplementationContext {
    ImplementationContext {
        summary: payload.summary,
        decisions: payload.decisions,
        tradeoffs: payload.tradeoffs,
        known_issues: payload.known_issues,
        out_of_scope: payload.out_of_scope,
        submitted_by: payload.submitted_by,
        submitted_at: Utc::now(),
    }
}

/// Boot recovery (process crash + restart): reviewers that were mid-flight
/// are failed, and sessions stuck in a runner-driven phase rewind to one
/// the engine can resume. Direct phase writes are deliberate here; the
/// normal transition table does not cover crash rewinds.
fn recover_session(session: &mut Session) {
    for state in session.agent_states.values_mut() {
        if state.status == AgentStatus::Reviewing {
            state.status = AgentStatus::Failed;
            state.last_reason = "interrupted: server restarted".to_string();
            if state.submitted_at.is_none() {
                state.submitted_at = Some(Utc::now());
            }
            state.updated_at = Some(Utc::now());
        }
    }
    match session.phase {
        SessionPhase::Collecting | SessionPhase::Reviewing | SessionPhase::Dedup => {
            // Deliberation needs materialized issues; until dedup has run,
            // the furthest safe phase is reviewing.
            session.phase = if session.issues.is_empty() {
                SessionPhase::Reviewing
            } else {
                SessionPhase::Deliberating
            };
        }
        SessionPhase::Deliberating | SessionPhase::Verifying => {
            session.phase = SessionPhase::Deliberating;
        }
        // Idle (not started), fixing (author at work), complete: untouched.
        _ => {}
    }
}

fn raise_issues_from_reviews(session: &Session) -> Vec<Issue> {
    let mut raised = Vec::new();
    for review in &session.reviews {
        if review.turn != 0 {
            continue;
        }
        for raw in &review.issues {
            let (line, start, end) = normalize_lines(raw.line, raw.line_start, raw.line_end);
            let mut issue = Issue {
                title: raw.title.clone(),
                severity: raw.severity,
                file: raw.file.clone(),
                line,
                line_start: start,
                line_end: end,
                description: raw.description.clone(),
                suggestion: raw.suggestion.clone(),
                raised_by: review.model_id.clone(),
                created_at: review.submitted_at,
                updated_at: review.submitted_at,
                group_key: dedup::group_key(&raw.file, &raw.title),
                ..Default::default()
            };
            let mut raise = Opinion::new(
                review.model_id.clone(),
                OpinionAction::Raise,
                raw.description.clone(),
            )
            .with_severity(raw.severity)
            .at_turn(0);
            raise.timestamp = review.submitted_at;
            issue.thread.push(raise);
            raised.push(issue);
        }
    }
    raised
}

/// Issues still owed an opinion by this model in their current turn.
fn pending_issue_ids(session: &Session, model_id: &str) -> Vec<String> {
    session
        .issues
        .iter()
        .filter(|issue| !issue.is_closed() && !issue.is_decided() && !is_frozen(issue))
        .filter(|issue| {
            issue
                .latest_turn_of(model_id)
                .is_none_or(|latest| latest < issue.turn)
        })
        .map(|issue| issue.id.clone())
        .collect()
}

fn is_frozen(issue: &Issue) -> bool {
    issue.consensus_type == Some(ConsensusType::Undecided)
}

fn all_settled(session: &Session) -> bool {
    session
        .issues
        .iter()
        .all(|i| i.is_closed() || i.is_decided() || is_frozen(i))
}

fn clip(text: &str, limit: usize) -> String {
    let trimmed = text.trim();
    if trimmed.len() <= limit {
        return trimmed.to_string();
    }
    let mut cut = limit;
    while !trimmed.is_char_boundary(cut) {
        cut -= 1;
    }
    format!(
        "{}\n\n... ({} chars omitted)",
        &trimmed[..cut],
        trimmed.len() - cut
    )
}

fn phase_event(session: &Session) -> ReviewEvent {
    ReviewEvent::PhaseChange {
        session_id: session.id.clone(),
        phase: session.phase,
        turn: session.turn,
        verification_round: session.verification_round,
    }
}

fn agent_status_event(session: &Session, model_id: &str) -> ReviewEvent {
    let state = session.agent_states.get(model_id);
    ReviewEvent::AgentStatus {
        session_id: session.id.clone(),
        model_id: model_id.to_string(),
        status: state.map(|s| s.status).unwrap_or_default(),
        task_kind: state.map(|s| s.task_kind).unwrap_or_default(),
        reason: state.map(|s| s.last_reason.clone()).filter(|r| !r.is_empty()),
    }
}

fn mark_agent_running(
    session: &mut Session,
    model_id: &str,
    task_kind: TaskKind,
    prompt: &str,
    effects: &mut Effects,
) {
    let session_turn = session.turn;
    let state = session
        .agent_states
        .entry(model_id.to_string())
        .or_insert_with(|| AgentState::new(model_id));
    state.status = AgentStatus::Reviewing;
    state.task_kind = task_kind;
    state.prompt_preview = prompt.chars().take(200).collect();
    state.prompt_full = prompt.to_string();
    state.started_at = Some(Utc::now());
    state.prompted_turn = Some(session_turn);
    state.submitted_at = None;
    state.updated_at = Some(Utc::now());
    state.last_reason = format!("{} trigger started", task_kind);
    effects.events.push(agent_status_event(session, model_id));
}

fn fail_agent(session: &mut Session, model_id: &str, reason: &str, effects: &mut Effects) {
    if let Some(state) = session.agent_states.get_mut(model_id) {
        state.status = AgentStatus::Failed;
        state.last_reason = reason.to_string();
        state.submitted_at = Some(Utc::now());
        state.updated_at = Some(Utc::now());
    }
    effects.events.push(agent_status_event(session, model_id));
}

fn update_agent_reason(session: &mut Session, model_id: &str, reason: String) {
    if let Some(state) = session.agent_states.get_mut(model_id) {
        state.last_reason = reason;
        state.updated_at = Some(Utc::now());
    }
}

fn summarize(session: &Session) -> SessionSummary {
    SessionSummary {
        session_id: session.id.clone(),
        phase: session.phase,
        base: session.base.clone(),
        head: session.head.clone(),
        repo_path: session.repo_path.clone(),
        review_count: session.reviews.len(),
        issue_count: session.issues.len(),
        files_changed: session.diff.len(),
        created_at: session.created_at,
    }
}

fn status_rollup(session: &Session, activity_cap: usize) -> StatusRollup {
    let mut agents: Vec<AgentStatusEntry> = session
        .agents
        .iter()
        .map(|agent| {
            let state = session.agent_states.get(&agent.id);
            AgentStatusEntry {
                model_id: agent.id.clone(),
                status: state.map(|s| s.status).unwrap_or_default(),
                task_kind: state.map(|s| s.task_kind).unwrap_or_default(),
                prompt_preview: state.map(|s| s.prompt_preview.clone()).unwrap_or_default(),
                elapsed_seconds: state.and_then(|s| s.elapsed_seconds()),
                last_reason: state.map(|s| s.last_reason.clone()).unwrap_or_default(),
                strictness: agent.strictness,
                color: agent.color.clone(),
                enabled: agent.enabled,
                description: agent.description.clone(),
            }
        })
        .collect();
    agents.sort_by(|a, b| a.model_id.cmp(&b.model_id));

    let mut activities: HashMap<String, Vec<AgentActivity>> = HashMap::new();
    for activity in session.agent_activities.iter().rev() {
        let bucket = activities.entry(activity.model_id.clone()).or_default();
        if bucket.len() < activity_cap {
            bucket.push(activity.clone());
        }
    }

    StatusRollup {
        session_id: session.id.clone(),
        phase: session.phase,
        turn: session.turn,
        verification_round: session.verification_round,
        base: session.base.clone(),
        head: session.head.clone(),
        review_count: session.reviews.len(),
        issue_count: session.issues.len(),
        files_changed: session.diff.len(),
        files: session
            .diff
            .iter()
            .map(|f| FileSummary {
                path: f.path.clone(),
                status: f.status,
                additions: f.additions,
                deletions: f.deletions,
            })
            .collect(),
        agents,
        reviews: session
            .reviews
            .iter()
            .map(|r| ReviewSummary {
                model_id: r.model_id.clone(),
                turn: r.turn,
                summary: r.summary.clone(),
                issue_count: r.issue_count(),
                submitted_at: r.submitted_at,
            })
            .collect(),
        implementation_context: session.implementation_context.clone(),
        agent_activities: activities,
    }
}

fn final_report(session: &Session) -> FinalReport {
    let total_raw: usize = session.reviews.iter().map(Review::issue_count).sum();
    let fix_required = session.issues.iter().filter(|i| i.is_fix_required()).count();
    let dismissed = session
        .issues
        .iter()
        .filter(|i| i.consensus_type == Some(ConsensusType::Dismissed))
        .count();
    let undecided = session
        .issues
        .iter()
        .filter(|i| i.consensus_type == Some(ConsensusType::Undecided))
        .count();

    FinalReport {
        session_id: session.id.clone(),
        phase: session.phase,
        issues: session.issues.clone(),
        issue_responses: session.issue_responses.clone(),
        fix_commits: session.fix_commits.clone(),
        dismissals: session.dismissals.clone(),
        verification_round: session.verification_round,
        implementation_context: session.implementation_context.clone(),
        stats: FinalReportStats {
            total_issues_found: total_raw,
            after_dedup: session.issues.len(),
            consensus_reached: fix_required + dismissed,
            fix_required,
            dismissed,
            undecided,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_clip_respects_limit() {
        let text = "a".repeat(100);
        let clipped = clip(&text, 40);
        assert!(clipped.starts_with(&"a".repeat(40)));
        assert!(clipped.contains("60 chars omitted"));
        assert_eq!(clip("short", 40), "short");
    }

    #[test]
    fn test_recover_session_rewinds_phases() {
        let mut session = Session::default();
        session.phase = SessionPhase::Reviewing;
        recover_session(&mut session);
        assert_eq!(session.phase, SessionPhase::Reviewing);

        // Reviews alone are not enough: issues must exist to deliberate.
        session.phase = SessionPhase::Dedup;
        session.reviews.push(Review::default());
        recover_session(&mut session);
        assert_eq!(session.phase, SessionPhase::Reviewing);

        session.phase = SessionPhase::Dedup;
        session.issues.push(Issue::default());
        recover_session(&mut session);
        assert_eq!(session.phase, SessionPhase::Deliberating);

        session.phase = SessionPhase::Verifying;
        recover_session(&mut session);
        assert_eq!(session.phase, SessionPhase::Deliberating);

        session.phase = SessionPhase::Fixing;
        recover_session(&mut session);
        assert_eq!(session.phase, SessionPhase::Fixing);

        session.phase = SessionPhase::Complete;
        recover_session(&mut session);
        assert_eq!(session.phase, SessionPhase::Complete);
    }

    #[test]
    fn test_recover_session_fails_inflight_agents() {
        let mut session = Session::default();
        let mut state = AgentState::new("m1");
        state.status = AgentStatus::Reviewing;
        session.agent_states.insert("m1".into(), state);
        recover_session(&mut session);
        let state = &session.agent_states["m1"];
        assert_eq!(state.status, AgentStatus::Failed);
        assert_eq!(state.last_reason, "interrupted: server restarted");
    }

    #[test]
    fn test_pending_issue_ids_skips_decided_and_spoken() {
        let mut session = Session::default();
        let mut open = Issue {
            raised_by: "a".to_string(),
            turn: 1,
            ..Default::default()
        };
        open.thread
            .push(Opinion::new("a", OpinionAction::Raise, "x").at_turn(0));
        let open_id = open.id.clone();

        let mut decided = Issue::default();
        decided.consensus = Some(true);
        decided.consensus_type = Some(ConsensusType::FixRequired);

        session.issues = vec![open, decided];

        // "a" spoke at turn 0 but the issue is at turn 1: still pending.
        assert_eq!(pending_issue_ids(&session, "a"), vec![open_id.clone()]);
        // "b" never spoke: pending.
        assert_eq!(pending_issue_ids(&session, "b"), vec![open_id]);
    }

    #[test]
    fn test_default_presets_cover_client_kinds() {
        let presets = default_presets();
        assert_eq!(presets.len(), 3);
        assert!(presets.iter().any(|p| p.client_kind == ClientKind::ClaudeCode));
        assert!(presets.iter().any(|p| p.client_kind == ClientKind::Codex));
        assert!(presets.iter().any(|p| p.client_kind == ClientKind::Gemini));
    }
}
