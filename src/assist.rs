//! Per-issue assist conversations with a helper model.
//!
//! The transcript lives on the issue and never influences consensus unless
//! a human-assist token explicitly converts it into an opinion on behalf of
//! the `human` pseudo-reviewer.

use std::sync::Arc;

use serde::Deserialize;
use tracing::warn;

use crate::auth::HUMAN_MODEL_ID;
use crate::config::AssistConfig;
use crate::error::{Result, ReviewError};
use crate::manager::{OpinionReceipt, OpinionRequest, SessionManager};
use crate::models::{AssistMessage, Issue, OpinionAction, Severity};
use crate::runner::{ProcessSpec, ReviewerRunner, RunOutcome};

pub struct AssistEngine {
    manager: Arc<SessionManager>,
    runner: ReviewerRunner,
    config: AssistConfig,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct AssistReply {
    pub response: String,
    pub cli_command: String,
    pub messages: Vec<AssistMessage>,
}

/// Opinion payload extracted from helper-model output.
#[derive(Debug, Clone, Deserialize)]
pub struct ParsedOpinion {
    pub action: OpinionAction,
    pub reasoning: String,
    #[serde(default)]
    pub suggested_severity: Option<Severity>,
}

/// Format an issue location as `file`, `file:line`, or `file:start-end`.
pub fn issue_location(issue: &Issue) -> String {
    match (issue.line_start, issue.line_end) {
        (Some(start), Some(end)) if end != start => {
            format!("{}:{}-{}", issue.file, start, end)
        }
        (Some(start), _) => format!("{}:{}", issue.file, start),
        _ => issue.file.clone(),
    }
}

/// Extract a JSON object from possibly noisy helper output.
pub fn parse_assist_opinion(text: &str) -> Result<ParsedOpinion> {
    let raw = text.trim();
    if let Ok(parsed) = serde_json::from_str(raw) {
        return Ok(parsed);
    }
    let start = raw.find('{');
    let end = raw.rfind('}');
    if let (Some(start), Some(end)) = (start, end)
        && end > start
    {
        return Ok(serde_json::from_str(&raw[start..=end])?);
    }
    Err(ReviewError::Validation(
        "assist opinion output is not valid JSON".into(),
    ))
}

impl AssistEngine {
    pub fn new(manager: Arc<SessionManager>, config: AssistConfig) -> Self {
        let runner_config = crate::config::RunnerConfig {
            deadline_secs: config.timeout_secs,
            retry_delays_secs: vec![],
            ..manager.config().runner.clone()
        };
        Self {
            manager,
            runner: ReviewerRunner::new(runner_config),
            config,
        }
    }

    fn helper_spec(prompt: &str) -> ProcessSpec {
        ProcessSpec {
            program: "claude".to_string(),
            args: vec![
                "--print".to_string(),
                "--output-format".to_string(),
                "text".to_string(),
                "-p".to_string(),
                prompt.to_string(),
            ],
        }
    }

    fn cli_command(issue: &Issue) -> String {
        format!(
            "claude -p \"Resolve this review issue in {}: {}. {}\"",
            issue_location(issue),
            issue.title.replace('"', "'"),
            issue.description.replace('"', "'"),
        )
    }

    fn diff_for_issue(&self, issue: &Issue, session_id: &str) -> String {
        self.manager
            .snapshot(session_id)
            .ok()
            .and_then(|session| {
                session
                    .diff
                    .iter()
                    .find(|f| f.path == issue.file)
                    .map(|f| f.content.clone())
            })
            .unwrap_or_default()
    }

    fn chat_prompt(issue: &Issue, diff: &str, user_message: &str) -> String {
        let mut parts = vec![
            "You are a senior developer helping resolve a code-review issue.".to_string(),
            String::new(),
            "## Issue".to_string(),
            format!("- Title: {}", issue.title),
            format!("- Severity: {}", issue.effective_severity()),
            format!("- Location: {}", issue_location(issue)),
            format!("- Description: {}", issue.description),
        ];
        if !issue.suggestion.is_empty() {
            parts.push(format!("- Suggested fix: {}", issue.suggestion));
        }
        if !issue.thread.is_empty() {
            parts.push(String::new());
            parts.push("## Reviewer discussion".to_string());
            for op in &issue.thread {
                parts.push(format!("- {} ({}): {}", op.model_id, op.action, op.reasoning));
            }
        }
        if !diff.is_empty() {
            parts.push(String::new());
            parts.push("## Related change (diff)".to_string());
            parts.push("```diff".to_string());
            parts.push(diff.to_string());
            parts.push("```".to_string());
        }
        if !issue.assist_messages.is_empty() {
            parts.push(String::new());
            parts.push("## Conversation so far".to_string());
            for msg in &issue.assist_messages {
                parts.push(format!("**{}**: {}", msg.role, msg.content));
            }
        }
        parts.push(String::new());
        parts.push(format!("**user**: {}", user_message));
        parts.push(String::new());
        parts.push(
            "Answer concretely. If code changes are needed, show them. If the fix spans \
             several files, suggest a CLI command the operator can run instead."
                .to_string(),
        );
        parts.join("\n")
    }

    fn opinion_prompt(issue: &Issue, diff: &str, instruction: &str) -> String {
        let mut parts = vec![
            "You are a code-review mediator.".to_string(),
            "Produce exactly one JSON object for the deliberation thread, no other text:".to_string(),
            r#"{"action":"fix_required|no_fix|comment","reasoning":"...","suggested_severity":"critical|high|medium|low|null"}"#
                .to_string(),
            String::new(),
            format!("- Title: {}", issue.title),
            format!("- Location: {}", issue_location(issue)),
            format!("- Description: {}", issue.description),
        ];
        if !issue.thread.is_empty() {
            parts.push(String::new());
            parts.push("Existing discussion:".to_string());
            for op in &issue.thread {
                parts.push(format!("- {} ({}): {}", op.model_id, op.action, op.reasoning));
            }
        }
        if !diff.is_empty() {
            parts.push(String::new());
            parts.push("Related diff:".to_string());
            parts.push("```diff".to_string());
            parts.push(diff.to_string());
            parts.push("```".to_string());
        }
        if !instruction.is_empty() {
            parts.push(String::new());
            parts.push(format!("Operator instruction: {}", instruction));
        }
        parts.join("\n")
    }

    async fn run_helper(&self, prompt: &str) -> Result<String> {
        let (_stop, rx) = ReviewerRunner::stop_channel();
        let report = self.runner.run(&Self::helper_spec(prompt), rx).await;
        match report.outcome {
            RunOutcome::Completed { exit_ok: true } => Ok(report.stdout_tail),
            RunOutcome::Completed { exit_ok: false } => Err(ReviewError::Subprocess(format!(
                "helper exited with error: {}",
                report.stderr_tail
            ))),
            RunOutcome::TimedOut => Err(ReviewError::Subprocess(format!(
                "helper timed out after {}s",
                self.config.timeout_secs
            ))),
            RunOutcome::Failed(reason) => Err(ReviewError::Subprocess(reason)),
            RunOutcome::Cancelled => Err(ReviewError::Subprocess("helper cancelled".into())),
        }
    }

    /// Append a user turn, consult the helper model, and append its reply.
    /// Helper failures degrade to a canned answer with a CLI hint rather
    /// than failing the request.
    pub async fn chat(&self, issue_id: &str, message: &str) -> Result<AssistReply> {
        let message = message.trim();
        if message.is_empty() {
            return Err(ReviewError::Validation("message must not be empty".into()));
        }
        let issue = self.manager.issue_thread(issue_id)?;
        let session_id = self
            .manager
            .session_for_issue(issue_id)?;
        let diff = self.diff_for_issue(&issue, &session_id);

        self.manager
            .append_assist_message(issue_id, "user", message.to_string())
            .await?;

        let prompt = Self::chat_prompt(&issue, &diff, message);
        let cli_command = Self::cli_command(&issue);
        let response = match self.run_helper(&prompt).await {
            Ok(output) => output.trim().to_string(),
            Err(e) => {
                warn!(issue_id, error = %e, "assist helper failed");
                format!(
                    "The helper is unavailable ({}). Try resolving from the CLI:\n\n```\n{}\n```",
                    e, cli_command
                )
            }
        };

        let messages = self
            .manager
            .append_assist_message(issue_id, "assistant", response.clone())
            .await?;

        Ok(AssistReply {
            response,
            cli_command,
            messages,
        })
    }

    /// Convert the assist conversation into a real opinion from the
    /// `human` pseudo-reviewer. Requires the session's human-assist token.
    pub async fn submit_opinion(
        self: &Arc<Self>,
        issue_id: &str,
        assist_key: &str,
        instruction: &str,
        explicit: Option<ParsedOpinion>,
    ) -> Result<OpinionReceipt> {
        self.manager
            .authorize_issue_call(issue_id, HUMAN_MODEL_ID, assist_key)?;

        let parsed = match explicit {
            Some(parsed) => parsed,
            None => {
                let issue = self.manager.issue_thread(issue_id)?;
                let session_id = self.manager.session_for_issue(issue_id)?;
                let diff = self.diff_for_issue(&issue, &session_id);
                let prompt = Self::opinion_prompt(&issue, &diff, instruction);
                let output = self.run_helper(&prompt).await?;
                parse_assist_opinion(&output)?
            }
        };

        if !matches!(
            parsed.action,
            OpinionAction::FixRequired | OpinionAction::NoFix | OpinionAction::Comment
        ) {
            return Err(ReviewError::Validation(format!(
                "assist opinions may only be fix_required, no_fix, or comment (got {})",
                parsed.action
            )));
        }

        let manager = Arc::clone(&self.manager);
        manager
            .submit_opinion(
                issue_id,
                OpinionRequest {
                    model_id: HUMAN_MODEL_ID.to_string(),
                    action: parsed.action,
                    reasoning: parsed.reasoning,
                    suggested_severity: parsed.suggested_severity,
                    confidence: None,
                    mentions: Vec::new(),
                },
            )
            .await
    }
}
