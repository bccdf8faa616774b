//! End-to-end lifecycle scenarios driven through the session manager.
//!
//! Reviewer subprocesses are not launched (manual mode); review and opinion
//! submissions arrive through the same entry points the REST adapter uses,
//! so these tests exercise the full collecting → reviewing → dedup →
//! deliberating → fixing → verifying → complete pipeline against a real
//! scratch git repository.

use std::path::Path;
use std::process::Command;
use std::sync::Arc;

use arv::config::ServerConfig;
use arv::manager::{CreateSessionRequest, OpinionRequest, SessionManager};
use arv::models::{
    AgentConfig, ClientKind, ConsensusType, OpinionAction, ProgressStatus, RawIssue,
    ResponseAction, Severity, Strictness,
};
use arv::phase::SessionPhase;
use tempfile::TempDir;

fn git(dir: &Path, args: &[&str]) {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git must be runnable in tests");
    assert!(
        output.status.success(),
        "git {:?} failed: {}",
        args,
        String::from_utf8_lossy(&output.stderr)
    );
}

fn git_out(dir: &Path, args: &[&str]) -> String {
    let output = Command::new("git")
        .args(args)
        .current_dir(dir)
        .output()
        .expect("git must be runnable in tests");
    String::from_utf8_lossy(&output.stdout).trim().to_string()
}

/// A scratch repository with four commits on `main`; returns their hashes
/// oldest first.
fn scratch_repo() -> (TempDir, Vec<String>) {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path();
    git(root, &["init", "-b", "main"]);
    git(root, &["config", "user.email", "review@example.com"]);
    git(root, &["config", "user.name", "Review Bot"]);

    let mut commits = Vec::new();
    for (i, content) in [
        "fn main() {}\n",
        "fn main() { run(); }\nfn run() {}\n",
        "fn main() { run(); }\nfn run() { step(); }\nfn step() {}\n",
        "fn main() { run(); }\nfn run() { step(); }\nfn step() { done(); }\nfn done() {}\n",
    ]
    .iter()
    .enumerate()
    {
        std::fs::write(root.join("app.rs"), content).unwrap();
        git(root, &["add", "."]);
        git(root, &["commit", "-m", &format!("change {}", i)]);
        commits.push(git_out(root, &["rev-parse", "HEAD"]));
    }
    (dir, commits)
}

fn preset(id: &str, strictness: Strictness) -> AgentConfig {
    AgentConfig {
        id: id.to_string(),
        client_kind: ClientKind::ClaudeCode,
        strictness,
        enabled: true,
        ..Default::default()
    }
}

fn raw_issue(title: &str, file: &str, start: u32, end: u32, severity: Severity) -> RawIssue {
    RawIssue {
        title: title.to_string(),
        severity,
        file: file.to_string(),
        line_start: Some(start),
        line_end: Some(end),
        description: format!("{} description", title),
        suggestion: String::new(),
        ..Default::default()
    }
}

fn opinion(model: &str, action: OpinionAction, reasoning: &str) -> OpinionRequest {
    OpinionRequest {
        model_id: model.to_string(),
        action,
        reasoning: reasoning.to_string(),
        suggested_severity: None,
        confidence: None,
        mentions: Vec::new(),
    }
}

struct Harness {
    _repo: TempDir,
    _storage: TempDir,
    commits: Vec<String>,
    manager: Arc<SessionManager>,
}

/// Build a manager in manual mode with the given reviewer presets and a
/// session over commits[0]..commits[1].
async fn harness(presets: &[AgentConfig]) -> (Harness, String) {
    let (repo, commits) = scratch_repo();
    let storage = tempfile::tempdir().unwrap();

    let mut config = ServerConfig::default();
    config.storage.root = storage.path().to_path_buf();
    config.runner.autospawn = false;

    let manager = SessionManager::load(config).await.unwrap();
    for preset in presets {
        manager.add_preset(preset.clone()).await.unwrap();
    }

    let summary = manager
        .create_session(CreateSessionRequest {
            repo_path: repo.path().to_string_lossy().to_string(),
            base: commits[0].clone(),
            head: commits[1].clone(),
            preset_ids: Some(presets.iter().map(|p| p.id.clone()).collect()),
            implementation_context: None,
        })
        .await
        .unwrap();
    let sid = summary.session_id;

    (
        Harness {
            _repo: repo,
            _storage: storage,
            commits,
            manager,
        },
        sid,
    )
}

#[tokio::test]
async fn two_reviewers_one_issue_consensus_fix() {
    let presets = [
        preset("model-a", Strictness::Strict),
        preset("model-b", Strictness::Balanced),
    ];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;

    manager.start(&sid).await.unwrap();
    assert_eq!(manager.snapshot(&sid).unwrap().phase, SessionPhase::Reviewing);

    manager
        .submit_review(
            &sid,
            "model-a",
            vec![raw_issue("off-by-one in loop", "src/x.y", 10, 12, Severity::High)],
            "one finding".into(),
        )
        .await
        .unwrap();
    manager
        .submit_review(&sid, "model-b", vec![], "looks fine otherwise".into())
        .await
        .unwrap();

    // Both reviewers terminal: dedup ran and deliberation opened.
    let issues = manager.issues(&sid).unwrap();
    assert_eq!(issues.len(), 1);
    assert_eq!(issues[0].display_number, 1);
    assert_eq!(manager.snapshot(&sid).unwrap().phase, SessionPhase::Deliberating);

    let mut vote = opinion("model-b", OpinionAction::FixRequired, "agree, clearly off by one");
    vote.confidence = Some(0.8);
    manager.submit_opinion(&issues[0].id, vote).await.unwrap();

    // 1.0 + 0.8 misses T=2.0 but every voice was heard: majority decides.
    let issue = manager.issue_thread(&issues[0].id).unwrap();
    assert_eq!(issue.consensus, Some(true));
    assert_eq!(issue.consensus_type, Some(ConsensusType::FixRequired));
    assert_eq!(issue.final_severity, Some(Severity::High));

    // The author now owes a fix; finishing without one is a conflict.
    assert_eq!(manager.snapshot(&sid).unwrap().phase, SessionPhase::Fixing);
    let err = manager.finish(&sid, false).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");
}

#[tokio::test]
async fn dedup_collapses_duplicates_across_reviewers() {
    let presets = [
        preset("model-a", Strictness::Strict),
        preset("model-b", Strictness::Balanced),
    ];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;
    manager.start(&sid).await.unwrap();

    manager
        .submit_review(
            &sid,
            "model-a",
            vec![raw_issue("null deref in parse", "p.go", 40, 40, Severity::High)],
            String::new(),
        )
        .await
        .unwrap();
    manager
        .submit_review(
            &sid,
            "model-b",
            vec![raw_issue(
                "possible null pointer in parse",
                "p.go",
                41,
                41,
                Severity::Medium,
            )],
            String::new(),
        )
        .await
        .unwrap();

    let issues = manager.issues(&sid).unwrap();
    assert_eq!(issues.len(), 1, "both raises must collapse into one issue");
    let canonical = &issues[0];
    assert_eq!(canonical.raised_by, "model-a", "higher severity wins canonical");
    assert_eq!(canonical.display_number, 1);
    assert_eq!(canonical.thread.len(), 2, "the merged raise joins the thread");
    assert_eq!(canonical.thread[1].model_id, "model-b");
    assert_eq!(canonical.thread[1].turn, 0);
}

#[tokio::test]
async fn withdraw_closes_immediately_and_rejects_further_opinions() {
    let presets = [
        preset("model-a", Strictness::Strict),
        preset("model-b", Strictness::Balanced),
    ];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;
    manager.start(&sid).await.unwrap();

    manager
        .submit_review(
            &sid,
            "model-a",
            vec![raw_issue("off-by-one in loop", "src/x.y", 10, 12, Severity::High)],
            String::new(),
        )
        .await
        .unwrap();
    manager
        .submit_review(&sid, "model-b", vec![], String::new())
        .await
        .unwrap();
    let issue_id = manager.issues(&sid).unwrap()[0].id.clone();
    let mut vote = opinion("model-b", OpinionAction::FixRequired, "agree");
    vote.confidence = Some(0.8);
    manager.submit_opinion(&issue_id, vote).await.unwrap();
    assert_eq!(manager.snapshot(&sid).unwrap().phase, SessionPhase::Fixing);

    manager
        .submit_opinion(&issue_id, opinion("model-a", OpinionAction::Withdraw, "retracted"))
        .await
        .unwrap();

    let issue = manager.issue_thread(&issue_id).unwrap();
    assert_eq!(issue.consensus, Some(true));
    assert_eq!(issue.consensus_type, Some(ConsensusType::Closed));

    // The withdrawn issue keeps its display number.
    assert_eq!(issue.display_number, 1);

    // Nothing left to fix: the session closed behind the withdraw.
    assert_eq!(manager.snapshot(&sid).unwrap().phase, SessionPhase::Complete);

    let err = manager
        .submit_opinion(&issue_id, opinion("model-b", OpinionAction::Comment, "wait"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "state");
}

#[tokio::test]
async fn deadlock_bypass_decides_by_majority() {
    let presets = [
        preset("model-a", Strictness::Balanced),
        preset("model-b", Strictness::Balanced),
        preset("model-c", Strictness::Balanced),
    ];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;
    manager.start(&sid).await.unwrap();

    manager
        .submit_review(
            &sid,
            "model-a",
            vec![raw_issue("race in counter update", "c.rs", 5, 9, Severity::Medium)],
            String::new(),
        )
        .await
        .unwrap();
    for model in ["model-b", "model-c"] {
        manager
            .submit_review(&sid, model, vec![], String::new())
            .await
            .unwrap();
    }
    let issue_id = manager.issues(&sid).unwrap()[0].id.clone();

    for model in ["model-b", "model-c"] {
        let mut vote = opinion(model, OpinionAction::FixRequired, "low-confidence agree");
        vote.confidence = Some(0.3);
        manager.submit_opinion(&issue_id, vote).await.unwrap();
    }

    // Weighted sum stays under T, but all voters responded: 3-0 majority.
    let issue = manager.issue_thread(&issue_id).unwrap();
    assert_eq!(issue.consensus, Some(true));
    assert_eq!(issue.consensus_type, Some(ConsensusType::FixRequired));
}

#[tokio::test]
async fn fix_verify_loop_with_dispute_then_accept() {
    let presets = [
        preset("model-a", Strictness::Strict),
        preset("model-b", Strictness::Balanced),
    ];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;
    manager.start(&sid).await.unwrap();

    manager
        .submit_review(
            &sid,
            "model-a",
            vec![raw_issue("off-by-one in loop", "app.rs", 1, 2, Severity::High)],
            String::new(),
        )
        .await
        .unwrap();
    manager
        .submit_review(&sid, "model-b", vec![], String::new())
        .await
        .unwrap();
    let issue_id = manager.issues(&sid).unwrap()[0].id.clone();
    let mut vote = opinion("model-b", OpinionAction::FixRequired, "agree");
    vote.confidence = Some(0.9);
    manager.submit_opinion(&issue_id, vote).await.unwrap();
    assert_eq!(manager.snapshot(&sid).unwrap().phase, SessionPhase::Fixing);

    let err = manager.finish(&sid, false).await.unwrap_err();
    assert_eq!(err.kind(), "conflict");

    manager
        .set_issue_status(&issue_id, ProgressStatus::Fixed, "patched".into(), "author".into())
        .await
        .unwrap();
    manager
        .fix_complete(&sid, h.commits[2].clone(), None, "author".into())
        .await
        .unwrap();

    let session = manager.snapshot(&sid).unwrap();
    assert_eq!(session.phase, SessionPhase::Verifying);
    assert_eq!(session.verification_round, 1);
    assert_eq!(session.head, h.commits[2]);

    // Raiser is not convinced: back to fixing, same round counter.
    manager
        .respond(&issue_id, "model-a", ResponseAction::Dispute, "still wrong".into())
        .await
        .unwrap();
    let session = manager.snapshot(&sid).unwrap();
    assert_eq!(session.phase, SessionPhase::Fixing);
    assert_eq!(session.verification_round, 1);

    // Second round lands and the raiser accepts.
    manager
        .fix_complete(&sid, h.commits[3].clone(), None, "author".into())
        .await
        .unwrap();
    assert_eq!(manager.snapshot(&sid).unwrap().verification_round, 2);
    manager
        .respond(&issue_id, "model-a", ResponseAction::Accept, "fixed now".into())
        .await
        .unwrap();

    let session = manager.snapshot(&sid).unwrap();
    assert_eq!(session.phase, SessionPhase::Complete);
    let issue = manager.issue_thread(&issue_id).unwrap();
    assert_eq!(issue.progress_status, ProgressStatus::Completed);
}

#[tokio::test]
async fn silent_reviewer_does_not_stall_the_phase() {
    let presets = [
        preset("model-a", Strictness::Strict),
        preset("model-b", Strictness::Balanced),
    ];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;
    manager.start(&sid).await.unwrap();

    manager
        .submit_review(
            &sid,
            "model-a",
            vec![raw_issue("leaked handle in open", "f.rs", 3, 3, Severity::Medium)],
            String::new(),
        )
        .await
        .unwrap();
    // model-b never submits anything; the operator forces the round closed.
    let receipt = manager.process(&sid).await.unwrap();
    assert_eq!(receipt.after_dedup, 1);

    let session = manager.snapshot(&sid).unwrap();
    assert_eq!(session.phase, SessionPhase::Deliberating);
    assert_eq!(manager.issues(&sid).unwrap().len(), 1);
}

#[tokio::test]
async fn finish_during_reviewing_is_a_state_conflict() {
    let presets = [preset("model-a", Strictness::Strict)];
    let (h, sid) = harness(&presets).await;
    h.manager.start(&sid).await.unwrap();

    let err = h.manager.finish(&sid, false).await.unwrap_err();
    assert_eq!(err.kind(), "state");
}

#[tokio::test]
async fn force_finish_bypasses_the_gate() {
    let presets = [
        preset("model-a", Strictness::Strict),
        preset("model-b", Strictness::Balanced),
    ];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;
    manager.start(&sid).await.unwrap();

    manager
        .submit_review(
            &sid,
            "model-a",
            vec![raw_issue("off-by-one in loop", "src/x.y", 10, 12, Severity::High)],
            String::new(),
        )
        .await
        .unwrap();
    manager
        .submit_review(&sid, "model-b", vec![], String::new())
        .await
        .unwrap();
    let issue_id = manager.issues(&sid).unwrap()[0].id.clone();
    let mut vote = opinion("model-b", OpinionAction::FixRequired, "agree");
    vote.confidence = Some(0.9);
    manager.submit_opinion(&issue_id, vote).await.unwrap();

    let report = manager.finish(&sid, true).await.unwrap();
    assert_eq!(report.phase, SessionPhase::Complete);
    assert_eq!(report.stats.fix_required, 1);
}

#[tokio::test]
async fn inverted_line_range_is_normalized_not_rejected() {
    let presets = [preset("model-a", Strictness::Strict)];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;
    manager.start(&sid).await.unwrap();

    let issue = RawIssue {
        title: "inverted range report".into(),
        severity: Severity::Low,
        file: "z.rs".into(),
        line_start: Some(12),
        line_end: Some(10),
        ..Default::default()
    };
    manager
        .submit_review(&sid, "model-a", vec![issue], String::new())
        .await
        .unwrap();

    let issues = manager.issues(&sid).unwrap();
    assert_eq!(issues[0].line_start, Some(10));
    assert_eq!(issues[0].line_end, Some(12));
}

#[tokio::test]
async fn role_validation_for_votes() {
    let presets = [
        preset("model-a", Strictness::Strict),
        preset("model-b", Strictness::Balanced),
    ];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;
    manager.start(&sid).await.unwrap();

    manager
        .submit_review(
            &sid,
            "model-a",
            vec![raw_issue("dangling pointer in free", "m.c", 7, 7, Severity::High)],
            String::new(),
        )
        .await
        .unwrap();
    manager
        .submit_review(&sid, "model-b", vec![], String::new())
        .await
        .unwrap();
    let issue_id = manager.issues(&sid).unwrap()[0].id.clone();

    let err = manager
        .submit_opinion(
            &issue_id,
            opinion("model-a", OpinionAction::FalsePositive, "never mind"),
        )
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");

    let err = manager
        .submit_opinion(&issue_id, opinion("model-b", OpinionAction::Withdraw, "drop it"))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), "validation");
}

#[tokio::test]
async fn duplicate_opinion_in_same_turn_reports_duplicate() {
    let presets = [
        preset("model-a", Strictness::Strict),
        preset("model-b", Strictness::Balanced),
        preset("model-c", Strictness::Balanced),
    ];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;
    manager.start(&sid).await.unwrap();

    manager
        .submit_review(
            &sid,
            "model-a",
            vec![raw_issue("shadowed variable in parser", "p.rs", 2, 2, Severity::Low)],
            String::new(),
        )
        .await
        .unwrap();
    for model in ["model-b", "model-c"] {
        manager
            .submit_review(&sid, model, vec![], String::new())
            .await
            .unwrap();
    }
    let issue_id = manager.issues(&sid).unwrap()[0].id.clone();

    let first = manager
        .submit_opinion(&issue_id, opinion("model-b", OpinionAction::Comment, "hmm"))
        .await
        .unwrap();
    assert_eq!(first.status, "accepted");

    let second = manager
        .submit_opinion(&issue_id, opinion("model-b", OpinionAction::Comment, "again"))
        .await
        .unwrap();
    assert_eq!(second.status, "duplicate");
}

#[tokio::test]
async fn restart_recovers_sessions_and_accepts_late_submissions() {
    let (repo, commits) = scratch_repo();
    let storage = tempfile::tempdir().unwrap();

    let mut config = ServerConfig::default();
    config.storage.root = storage.path().to_path_buf();
    config.runner.autospawn = false;

    let sid;
    {
        let manager = SessionManager::load(config.clone()).await.unwrap();
        manager
            .add_preset(preset("model-a", Strictness::Strict))
            .await
            .unwrap();
        manager
            .add_preset(preset("model-b", Strictness::Balanced))
            .await
            .unwrap();
        let summary = manager
            .create_session(CreateSessionRequest {
                repo_path: repo.path().to_string_lossy().to_string(),
                base: commits[0].clone(),
                head: commits[1].clone(),
                preset_ids: Some(vec!["model-a".into(), "model-b".into()]),
                implementation_context: None,
            })
            .await
            .unwrap();
        sid = summary.session_id;
        manager.start(&sid).await.unwrap();
        manager
            .submit_review(
                &sid,
                "model-a",
                vec![raw_issue("missing bounds check", "b.rs", 4, 6, Severity::High)],
                String::new(),
            )
            .await
            .unwrap();
        // Process "crashes" here with model-b still reviewing.
    }

    let manager = SessionManager::load(config).await.unwrap();
    let session = manager.snapshot(&sid).unwrap();
    // Issues were never materialized, so the session rewinds to reviewing
    // and the stranded reviewer is failed.
    assert_eq!(session.phase, SessionPhase::Reviewing);
    assert_eq!(
        session.agent_states["model-b"].last_reason,
        "interrupted: server restarted"
    );
    assert_eq!(session.reviews.len(), 1);

    // The operator re-processes and late opinions still land.
    manager.process(&sid).await.unwrap();
    let issues = manager.issues(&sid).unwrap();
    assert_eq!(issues.len(), 1);
    let mut vote = opinion("model-b", OpinionAction::NoFix, "intended behavior");
    vote.confidence = Some(1.0);
    manager.submit_opinion(&issues[0].id, vote).await.unwrap();
}

#[tokio::test]
async fn access_keys_gate_submissions() {
    let presets = [preset("model-a", Strictness::Strict)];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;
    manager.start(&sid).await.unwrap();

    let session = manager.snapshot(&sid).unwrap();
    let key = session.keys.agent_key("model-a").unwrap().to_string();

    assert!(manager.authorize(&sid, "model-a", &key).is_ok());
    assert_eq!(
        manager
            .authorize(&sid, "model-a", "wrong-key")
            .unwrap_err()
            .kind(),
        "authentication"
    );

    // Human assist keys are scoped and rotate.
    let assist = manager.issue_human_assist_key(&sid).await.unwrap();
    assert!(manager.authorize(&sid, "human", &assist).is_ok());
    assert!(manager.authorize(&sid, "model-a", &assist).is_err());
}

#[tokio::test]
async fn events_follow_committed_phase_changes() {
    let presets = [preset("model-a", Strictness::Strict)];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;

    let mut rx = manager.bus.subscribe(&sid);
    manager.start(&sid).await.unwrap();

    let mut phases = Vec::new();
    while let Ok(event) = rx.try_recv() {
        if let arv::events::ReviewEvent::PhaseChange { phase, .. } = event {
            phases.push(phase);
        }
    }
    assert_eq!(
        phases,
        vec![SessionPhase::Collecting, SessionPhase::Reviewing]
    );
    // The broadcast phase always matches the persisted one.
    assert_eq!(
        manager.snapshot(&sid).unwrap().phase,
        *phases.last().unwrap()
    );
}

#[tokio::test]
async fn session_diff_is_collected_from_the_repo() {
    let presets = [preset("model-a", Strictness::Strict)];
    let (h, sid) = harness(&presets).await;
    let manager = &h.manager;
    manager.start(&sid).await.unwrap();

    let session = manager.snapshot(&sid).unwrap();
    assert_eq!(session.diff.len(), 1);
    assert_eq!(session.diff[0].path, "app.rs");
    assert!(session.diff[0].content.contains("fn run()"));

    let context = manager.review_context(&sid, None).unwrap();
    assert!(context.diff.contains("app.rs"));

    let slice = manager.read_file(&sid, "app.rs", Some(1), Some(1)).await.unwrap();
    assert_eq!(slice.lines.len(), 1);
    assert_eq!(slice.lines[0].number, 1);
}
