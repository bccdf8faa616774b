//! Prompt templates handed to reviewer clients. Reviewers talk back to the
//! engine exclusively through the REST API (or the `arv` CLI wrapper), so
//! every prompt spells out the endpoints and the agent's access key.

use crate::models::AgentConfig;
use crate::models::ImplementationContext;

fn focus_line(agent: &AgentConfig) -> Option<String> {
    if agent.focus.is_empty() {
        None
    } else {
        Some(format!("Your review focus: {}", agent.focus.join(", ")))
    }
}

pub fn build_review_prompt(
    session_id: &str,
    agent: &AgentConfig,
    api_base_url: &str,
    agent_key: &str,
    implementation_context: Option<&ImplementationContext>,
) -> String {
    let mut parts: Vec<String> = vec![format!(
        "You are a code reviewer (model: {}).",
        agent.id
    )];
    if !agent.system_prompt.is_empty() {
        parts.push(agent.system_prompt.clone());
    }
    if let Some(focus) = focus_line(agent) {
        parts.push(focus);
    }

    if let Some(ic) = implementation_context {
        parts.push(String::new());
        parts.push("## Author context".to_string());
        if !ic.summary.is_empty() {
            parts.push(format!("Summary: {}", ic.summary));
        }
        for d in &ic.decisions {
            parts.push(format!("- decision: {}", d));
        }
        for t in &ic.tradeoffs {
            parts.push(format!("- tradeoff: {}", t));
        }
    }

    parts.extend([
        String::new(),
        "## Instructions".to_string(),
        String::new(),
        "Follow these steps exactly:".to_string(),
        String::new(),
        format!(
            "1. Retrieve the context index:\n   curl -H \"X-Agent-Key: {key}\" {base}/api/sessions/{sid}/index",
            key = agent_key,
            base = api_base_url,
            sid = session_id
        ),
        "2. Use local tools (git/sed/rg) to inspect only the necessary files and line ranges.".to_string(),
        format!(
            "3. If needed, retrieve per-file server context:\n   curl -H \"X-Agent-Key: {key}\" \"{base}/api/sessions/{sid}/context?file=<path>\"",
            key = agent_key,
            base = api_base_url,
            sid = session_id
        ),
        "4. Review the changes thoroughly based on your assigned focus.".to_string(),
        format!(
            "5. Report each issue as you find it:\n   curl -X POST {base}/api/sessions/{sid}/report \\\n     -H \"Content-Type: application/json\" -H \"X-Agent-Key: {key}\" \\\n     -d '{{\"model_id\": \"{mid}\", \"issue\": {{\"title\": \"...\", \"severity\": \"critical|high|medium|low\", \"file\": \"...\", \"line_start\": 1, \"line_end\": 2, \"description\": \"...\", \"suggestion\": \"...\"}}}}'",
            base = api_base_url,
            sid = session_id,
            key = agent_key,
            mid = agent.id
        ),
        format!(
            "6. When done, submit your summary (this finalizes your review):\n   curl -X POST {base}/api/sessions/{sid}/summary \\\n     -H \"Content-Type: application/json\" -H \"X-Agent-Key: {key}\" \\\n     -d '{{\"model_id\": \"{mid}\", \"summary\": \"...\"}}'",
            base = api_base_url,
            sid = session_id,
            key = agent_key,
            mid = agent.id
        ),
        String::new(),
        "## Important".to_string(),
        String::new(),
        "- Review independently. Do not ask for human input.".to_string(),
        "- Be specific: include file paths and line ranges.".to_string(),
        "- Only report real issues. Do not fabricate problems.".to_string(),
        "- If you find no issues, you MUST still submit the summary call with no reports.".to_string(),
        "- Complete the review in a single pass.".to_string(),
        format!("- Session ID: {}", session_id),
    ]);
    parts.join("\n")
}

pub fn build_deliberation_prompt(
    session_id: &str,
    agent: &AgentConfig,
    issue_ids: &[String],
    api_base_url: &str,
    turn: u32,
    agent_key: &str,
) -> String {
    let issue_list = issue_ids
        .iter()
        .map(|id| format!("  - {}", id))
        .collect::<Vec<_>>()
        .join("\n");
    let mut parts: Vec<String> = vec![format!(
        "You are a code reviewer (model: {}) in deliberation turn {}.",
        agent.id, turn
    )];
    if let Some(focus) = focus_line(agent) {
        parts.push(focus);
    }
    parts.extend([
        String::new(),
        "## Instructions".to_string(),
        String::new(),
        "Other reviewers have raised issues. Review each one and vote.".to_string(),
        String::new(),
        "For each issue ID listed below:".to_string(),
        String::new(),
        format!(
            "1. Retrieve the thread:\n   curl -H \"X-Agent-Key: {key}\" {base}/api/issues/{{issue_id}}/thread",
            key = agent_key,
            base = api_base_url
        ),
        "2. Weigh the code context, severity, and the other opinions.".to_string(),
        format!(
            "3. Submit your opinion:\n   curl -X POST {base}/api/issues/{{issue_id}}/opinions \\\n     -H \"Content-Type: application/json\" -H \"X-Agent-Key: {key}\" \\\n     -d '{{\"model_id\": \"{mid}\", \"action\": \"...\", \"reasoning\": \"...\", \"suggested_severity\": \"...\", \"confidence\": 0.8}}'",
            base = api_base_url,
            key = agent_key,
            mid = agent.id
        ),
        "   - action: fix_required | no_fix | false_positive | comment".to_string(),
        "   - confidence: how sure you are, 0.0-1.0".to_string(),
        "   - suggested_severity: critical/high/medium/low when voting fix_required".to_string(),
        String::new(),
        "## Pending issue IDs".to_string(),
        String::new(),
        issue_list,
        String::new(),
        "## Important".to_string(),
        String::new(),
        "- Process ALL listed issues.".to_string(),
        "- Deliberate independently. Do not ask for human input.".to_string(),
        "- Be concise but substantive in your reasoning.".to_string(),
        format!("- Session ID: {}", session_id),
    ]);
    parts.join("\n")
}

pub fn build_verification_prompt(
    session_id: &str,
    agent: &AgentConfig,
    api_base_url: &str,
    verification_round: u32,
    agent_key: &str,
) -> String {
    let parts: Vec<String> = vec![
        format!(
            "You are a code reviewer (model: {}) verifying fixes (round {}).",
            agent.id, verification_round
        ),
        String::new(),
        "## Instructions".to_string(),
        String::new(),
        "The author committed fixes for issues you and others confirmed.".to_string(),
        String::new(),
        format!(
            "1. Retrieve the delta context (the diff since the previous head):\n   curl -H \"X-Agent-Key: {key}\" {base}/api/sessions/{sid}/delta",
            key = agent_key,
            base = api_base_url,
            sid = session_id
        ),
        "2. For every issue you raised, check whether the delta actually resolves it.".to_string(),
        format!(
            "3. Respond per issue:\n   curl -X POST {base}/api/issues/{{issue_id}}/respond \\\n     -H \"Content-Type: application/json\" -H \"X-Agent-Key: {key}\" \\\n     -d '{{\"model_id\": \"{mid}\", \"action\": \"accept|dispute|partial\", \"reasoning\": \"...\"}}'",
            base = api_base_url,
            key = agent_key,
            mid = agent.id
        ),
        "   - accept: the fix resolves the issue".to_string(),
        "   - dispute: the issue is still present (explain what remains)".to_string(),
        "   - partial: improved but incomplete".to_string(),
        String::new(),
        "## Important".to_string(),
        String::new(),
        "- Judge only the issues you raised.".to_string(),
        "- Base your verdict on the delta diff, not on optimism.".to_string(),
        format!("- Session ID: {}", session_id),
    ];
    parts.join("\n")
}

/// Prompt for the one-shot connection probe: the client only has to prove
/// liveness by calling back.
pub fn build_probe_prompt(callback_url: &str) -> String {
    [
        "This is a connectivity test.".to_string(),
        format!(
            "Run exactly one command and nothing else:\n  curl -X POST {}",
            callback_url
        ),
        "Then reply with the single word: done".to_string(),
    ]
    .join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn agent() -> AgentConfig {
        AgentConfig {
            id: "claude-opus".into(),
            focus: vec!["security".into(), "concurrency".into()],
            ..Default::default()
        }
    }

    #[test]
    fn test_review_prompt_mentions_endpoints_and_key() {
        let prompt = build_review_prompt("s1", &agent(), "http://localhost:3000", "k123", None);
        assert!(prompt.contains("/api/sessions/s1/report"));
        assert!(prompt.contains("/api/sessions/s1/summary"));
        assert!(prompt.contains("X-Agent-Key: k123"));
        assert!(prompt.contains("security, concurrency"));
    }

    #[test]
    fn test_review_prompt_includes_author_context() {
        let ic = ImplementationContext {
            summary: "rewrote the cache".into(),
            decisions: vec!["kept LRU".into()],
            ..Default::default()
        };
        let prompt =
            build_review_prompt("s1", &agent(), "http://localhost:3000", "k", Some(&ic));
        assert!(prompt.contains("rewrote the cache"));
        assert!(prompt.contains("kept LRU"));
    }

    #[test]
    fn test_deliberation_prompt_lists_issues() {
        let ids = vec!["i1".to_string(), "i2".to_string()];
        let prompt =
            build_deliberation_prompt("s1", &agent(), &ids, "http://localhost:3000", 2, "k");
        assert!(prompt.contains("turn 2"));
        assert!(prompt.contains("  - i1"));
        assert!(prompt.contains("  - i2"));
        assert!(prompt.contains("fix_required | no_fix | false_positive | comment"));
    }

    #[test]
    fn test_verification_prompt_mentions_delta() {
        let prompt =
            build_verification_prompt("s1", &agent(), "http://localhost:3000", 1, "k");
        assert!(prompt.contains("/api/sessions/s1/delta"));
        assert!(prompt.contains("accept|dispute|partial"));
    }
}
