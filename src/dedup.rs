//! Collapse near-duplicate reports from different reviewers into one
//! canonical issue.
//!
//! Identity is the normalized (file, title-token) group key, narrowed by
//! line-range proximity. The whole pass is deterministic and idempotent:
//! the same raised-issue set always yields the same canonical set and the
//! same display numbering.

use tracing::debug;

use crate::models::{Issue, Opinion, OpinionAction};

/// Normalized title: lowercase, punctuation to spaces, collapsed whitespace.
fn normalize_title(title: &str) -> String {
    let lowered: String = title
        .to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    lowered.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Token-set identity for a title: drop one-char tokens, sort the first
/// four remaining tokens alphabetically, join.
fn title_key(title: &str) -> String {
    let normalized = normalize_title(title);
    let mut tokens: Vec<&str> = normalized
        .split_whitespace()
        .filter(|t| t.len() > 1)
        .take(4)
        .collect();
    tokens.sort_unstable();
    tokens.join(" ")
}

/// Full dedup group key, scoped to the file.
pub fn group_key(file: &str, title: &str) -> String {
    format!("{}::{}", file, title_key(title))
}

fn ranges_near(a: &Issue, b: &Issue, proximity: u32) -> bool {
    let (Some(a_start), Some(a_end)) = (a.line_start, a.line_end) else {
        return false;
    };
    let (Some(b_start), Some(b_end)) = (b.line_start, b.line_end) else {
        return false;
    };
    // Overlap, or gap within the proximity window.
    a_start.saturating_sub(proximity) <= b_end && b_start.saturating_sub(proximity) <= a_end
}

/// Count of normalized tokens the two titles share.
fn shared_tokens(a: &str, b: &str) -> usize {
    let normalized_a = normalize_title(a);
    let normalized_b = normalize_title(b);
    let set_a: std::collections::HashSet<&str> = normalized_a
        .split_whitespace()
        .filter(|t| t.len() > 1)
        .collect();
    normalized_b
        .split_whitespace()
        .filter(|t| t.len() > 1 && set_a.contains(t))
        .collect::<std::collections::HashSet<&str>>()
        .len()
}

fn is_duplicate(a: &Issue, b: &Issue, proximity: u32) -> bool {
    if a.file != b.file {
        return false;
    }
    // Candidate when the token-set keys agree, or the titles still share
    // enough vocabulary ("null deref in parse" / "possible null pointer in
    // parse" must land in the same group).
    let candidate =
        title_key(&a.title) == title_key(&b.title) || shared_tokens(&a.title, &b.title) >= 3;
    if !candidate {
        return false;
    }
    ranges_near(a, b, proximity) || normalize_title(&a.title) == normalize_title(&b.title)
}

/// Pick the canonical member of a duplicate cluster: highest severity,
/// tie-break on earliest raise, then lexicographic model id.
fn canonical_index(cluster: &[Issue]) -> usize {
    let mut best = 0;
    for (idx, issue) in cluster.iter().enumerate().skip(1) {
        let current = &cluster[best];
        let candidate_key = (
            -issue.severity.rank(),
            issue.created_at,
            issue.raised_by.clone(),
        );
        let current_key = (
            -current.severity.rank(),
            current.created_at,
            current.raised_by.clone(),
        );
        if candidate_key < current_key {
            best = idx;
        }
    }
    best
}

fn merge_cluster(mut cluster: Vec<Issue>) -> Issue {
    let canonical_idx = canonical_index(&cluster);
    let mut canonical = cluster.swap_remove(canonical_idx);

    for dup in cluster {
        if canonical.thread.iter().any(|op| op.model_id == dup.raised_by) {
            // Same reviewer reported twice; the thread already carries their
            // raise, so the duplicate body is simply dropped.
            continue;
        }
        let mut opinion = Opinion::new(
            dup.raised_by.clone(),
            OpinionAction::FixRequired,
            dup.description.clone(),
        )
        .with_severity(dup.severity)
        .at_turn(0);
        opinion.timestamp = dup.created_at;
        canonical.thread.push(opinion);
    }

    canonical.group_key = group_key(&canonical.file, &canonical.title);
    canonical
}

/// Deduplicate raised issues. Input order is the raise order across all
/// reviewers; each output issue keeps the position of its cluster's first
/// appearance.
pub fn deduplicate(issues: Vec<Issue>, proximity: u32) -> Vec<Issue> {
    let before = issues.len();
    let mut clusters: Vec<Vec<Issue>> = Vec::new();

    for issue in issues {
        let target = clusters
            .iter()
            .position(|cluster| cluster.iter().any(|m| is_duplicate(m, &issue, proximity)));
        match target {
            Some(idx) => clusters[idx].push(issue),
            None => clusters.push(vec![issue]),
        }
    }

    let canonical: Vec<Issue> = clusters.into_iter().map(merge_cluster).collect();
    if canonical.len() != before {
        debug!(before, after = canonical.len(), "dedup collapsed issues");
    }
    canonical
}

/// Assign dense 1-based display numbers to issues that do not have one yet.
/// Existing numbers are never reassigned (I7).
pub fn assign_display_numbers(issues: &mut [Issue]) {
    let mut next = issues.iter().map(|i| i.display_number).max().unwrap_or(0);
    for issue in issues.iter_mut() {
        if issue.display_number == 0 {
            next += 1;
            issue.display_number = next;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Severity;
    use chrono::{Duration, Utc};

    fn issue(title: &str, file: &str, line: Option<u32>, raiser: &str, severity: Severity) -> Issue {
        let (line, start, end) = crate::models::normalize_lines(line, None, None);
        Issue {
            title: title.to_string(),
            severity,
            file: file.to_string(),
            line,
            line_start: start,
            line_end: end,
            description: format!("{} description", title),
            raised_by: raiser.to_string(),
            thread: vec![
                Opinion::new(raiser, OpinionAction::Raise, format!("{} description", title))
                    .with_severity(severity),
            ],
            ..Default::default()
        }
    }

    #[test]
    fn test_title_key_normalization() {
        assert_eq!(
            title_key("Null deref in parse!"),
            title_key("null DEREF in parse")
        );
        // One-char tokens dropped, first four kept, sorted.
        assert_eq!(title_key("a possible null deref in parse"), "deref in null possible");
    }

    #[test]
    fn test_collapses_nearby_duplicates() {
        let issues = vec![
            issue("null deref in parse", "p.go", Some(40), "a", Severity::High),
            issue("null deref in parse", "p.go", Some(41), "b", Severity::Medium),
        ];
        let deduped = deduplicate(issues, 5);
        assert_eq!(deduped.len(), 1);
        // Canonical is the higher-severity report; both raises are in the thread.
        assert_eq!(deduped[0].raised_by, "a");
        assert_eq!(deduped[0].severity, Severity::High);
        assert_eq!(deduped[0].thread.len(), 2);
        assert_eq!(deduped[0].thread[1].model_id, "b");
        assert_eq!(deduped[0].thread[1].turn, 0);
    }

    #[test]
    fn test_merges_on_shared_vocabulary() {
        let issues = vec![
            issue("null deref in parse", "p.go", Some(40), "a", Severity::High),
            issue(
                "possible null pointer in parse",
                "p.go",
                Some(41),
                "b",
                Severity::Medium,
            ),
        ];
        let deduped = deduplicate(issues, 5);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].thread.len(), 2);
    }

    #[test]
    fn test_different_files_never_merge() {
        let issues = vec![
            issue("null deref in parse", "p.go", Some(40), "a", Severity::High),
            issue("null deref in parse", "q.go", Some(40), "b", Severity::High),
        ];
        assert_eq!(deduplicate(issues, 5).len(), 2);
    }

    #[test]
    fn test_distant_lines_do_not_merge() {
        let issues = vec![
            issue(
                "unchecked index bounds in reader",
                "x.rs",
                Some(10),
                "a",
                Severity::Medium,
            ),
            issue(
                "reader has unchecked index bounds",
                "x.rs",
                Some(400),
                "b",
                Severity::Medium,
            ),
        ];
        assert_eq!(deduplicate(issues, 5).len(), 2);
    }

    #[test]
    fn test_identical_titles_merge_without_lines() {
        let issues = vec![
            issue("missing error handling", "y.rs", None, "a", Severity::Low),
            issue("Missing error handling!", "y.rs", None, "b", Severity::Low),
        ];
        assert_eq!(deduplicate(issues, 5).len(), 1);
    }

    #[test]
    fn test_same_reviewer_double_report_yields_one_issue() {
        let issues = vec![
            issue("race in cache update", "c.rs", Some(20), "a", Severity::High),
            issue("race in cache update", "c.rs", Some(21), "a", Severity::High),
        ];
        let deduped = deduplicate(issues, 5);
        assert_eq!(deduped.len(), 1);
        // No second opinion from the same reviewer.
        assert_eq!(deduped[0].thread.len(), 1);
    }

    #[test]
    fn test_canonical_tiebreak_earliest_then_model() {
        let now = Utc::now();
        let mut first = issue("leak in pool", "p.rs", Some(5), "zeta", Severity::High);
        first.created_at = now;
        let mut second = issue("leak in pool", "p.rs", Some(6), "alpha", Severity::High);
        second.created_at = now + Duration::seconds(10);

        // Same severity: earliest raise wins even with a later model id.
        let deduped = deduplicate(vec![first, second], 5);
        assert_eq!(deduped.len(), 1);
        assert_eq!(deduped[0].raised_by, "zeta");

        let mut third = issue("leak in pool", "p.rs", Some(5), "zeta", Severity::High);
        third.created_at = now;
        let mut fourth = issue("leak in pool", "p.rs", Some(6), "alpha", Severity::High);
        fourth.created_at = now;
        // Equal timestamps: lexicographic model id.
        let deduped = deduplicate(vec![third, fourth], 5);
        assert_eq!(deduped[0].raised_by, "alpha");
    }

    #[test]
    fn test_dedup_idempotence() {
        let issues = vec![
            issue("null deref in parse", "p.go", Some(40), "a", Severity::High),
            issue("possible null deref parse", "p.go", Some(41), "b", Severity::Medium),
            issue("slow query in listing", "q.sql", Some(3), "a", Severity::Low),
        ];
        let once = deduplicate(issues, 5);
        let twice = deduplicate(once.clone(), 5);
        assert_eq!(once.len(), twice.len());
        let ids_once: Vec<_> = once.iter().map(|i| i.id.clone()).collect();
        let ids_twice: Vec<_> = twice.iter().map(|i| i.id.clone()).collect();
        assert_eq!(ids_once, ids_twice);
    }

    #[test]
    fn test_no_shared_group_keys_after_dedup() {
        let issues = vec![
            issue("null deref in parse", "p.go", Some(40), "a", Severity::High),
            issue("null deref in parse", "p.go", Some(42), "b", Severity::Medium),
            issue("off by one in loop", "p.go", Some(40), "c", Severity::Low),
        ];
        let deduped = deduplicate(issues, 5);
        for (i, a) in deduped.iter().enumerate() {
            for b in deduped.iter().skip(i + 1) {
                assert!(!is_duplicate(a, b, 5), "{} and {} still duplicates", a.title, b.title);
            }
        }
    }

    #[test]
    fn test_display_numbers_dense_and_stable() {
        let mut issues = deduplicate(
            vec![
                issue("first problem here", "a.rs", Some(1), "a", Severity::Low),
                issue("second problem here", "b.rs", Some(1), "b", Severity::Low),
            ],
            5,
        );
        assign_display_numbers(&mut issues);
        assert_eq!(issues[0].display_number, 1);
        assert_eq!(issues[1].display_number, 2);

        // A later pass never renumbers.
        issues.push(issue("third problem here", "c.rs", Some(1), "a", Severity::Low));
        assign_display_numbers(&mut issues);
        assert_eq!(issues[0].display_number, 1);
        assert_eq!(issues[2].display_number, 3);
    }
}
