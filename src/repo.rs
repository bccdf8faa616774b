//! Read-only facade over a git working tree: branch listing, diff
//! extraction, revision-pinned line reads, and the delta diff used by
//! verification. All operations are stateless and shell out to `git`.

use std::path::{Component, Path, PathBuf};

use regex::Regex;
use serde::Serialize;
use std::process::Output;
use std::sync::LazyLock;
use tokio::process::Command;
use tracing::debug;

use crate::error::{RepoErrorKind, Result, ReviewError};
use crate::models::{DiffFile, FileChangeStatus};

/// Maximum lines served by a single `read` call.
pub const MAX_READ_LINES: u32 = 2000;

static DIFF_HEADER: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^diff --git a/(.+?) b/(.+)$").unwrap());
static NUMSTAT_LINE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?m)^(\d+|-)\t(\d+|-)\t(.+)$").unwrap());

#[derive(Debug, Clone, Serialize)]
pub struct RepoValidation {
    pub valid: bool,
    pub root: PathBuf,
    pub current_branch: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BranchType {
    Local,
    Remote,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub branch_type: BranchType,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileLine {
    pub number: u32,
    pub content: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileSlice {
    pub path: String,
    pub start_line: u32,
    pub end_line: u32,
    pub total_lines: u32,
    pub lines: Vec<FileLine>,
}

async fn run_git(root: &Path, args: &[&str]) -> Result<Output> {
    debug!(args = ?args, dir = %root.display(), "running git");
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .await
        .map_err(|e| ReviewError::repo(RepoErrorKind::NotARepo, e.to_string()))?;
    Ok(output)
}

async fn run_git_checked(root: &Path, args: &[&str]) -> Result<Output> {
    let output = run_git(root, args).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(classify_git_error(&stderr));
    }
    Ok(output)
}

fn classify_git_error(stderr: &str) -> ReviewError {
    let lowered = stderr.to_lowercase();
    let kind = if lowered.contains("not a git repository") {
        RepoErrorKind::NotARepo
    } else if lowered.contains("unknown revision")
        || lowered.contains("bad revision")
        || lowered.contains("ambiguous argument")
    {
        RepoErrorKind::NoSuchRef
    } else if lowered.contains("does not exist")
        || lowered.contains("exists on disk, but not in")
        || lowered.contains("path not in")
    {
        RepoErrorKind::NoSuchPath
    } else {
        RepoErrorKind::NotARepo
    };
    ReviewError::repo(kind, stderr.trim().to_string())
}

/// Reject escapes from the repository root before any git pathspec use.
fn check_within_root(path: &str) -> Result<()> {
    let p = Path::new(path);
    if p.is_absolute() {
        return Err(ReviewError::repo(
            RepoErrorKind::InvalidPath,
            format!("absolute path not allowed: {}", path),
        ));
    }
    if p.components().any(|c| matches!(c, Component::ParentDir)) {
        return Err(ReviewError::repo(
            RepoErrorKind::InvalidPath,
            format!("path escapes repository root: {}", path),
        ));
    }
    Ok(())
}

/// Validate a repository path and resolve its root and current branch.
pub async fn validate(path: &Path) -> Result<RepoValidation> {
    if !path.is_dir() {
        return Err(ReviewError::repo(
            RepoErrorKind::InvalidPath,
            format!("not a directory: {}", path.display()),
        ));
    }
    let output = run_git(path, &["rev-parse", "--show-toplevel"]).await?;
    if !output.status.success() {
        return Err(ReviewError::repo(
            RepoErrorKind::NotARepo,
            String::from_utf8_lossy(&output.stderr).trim().to_string(),
        ));
    }
    let root = PathBuf::from(String::from_utf8_lossy(&output.stdout).trim());

    let branch_out = run_git_checked(&root, &["rev-parse", "--abbrev-ref", "HEAD"]).await?;
    let current_branch = String::from_utf8_lossy(&branch_out.stdout).trim().to_string();

    Ok(RepoValidation {
        valid: true,
        root,
        current_branch,
    })
}

/// List local and remote branches.
pub async fn branches(root: &Path) -> Result<Vec<BranchInfo>> {
    let mut result = Vec::new();

    let local = run_git_checked(root, &["branch", "--format=%(refname:short)"]).await?;
    for line in String::from_utf8_lossy(&local.stdout).lines() {
        let name = line.trim();
        if !name.is_empty() {
            result.push(BranchInfo {
                name: name.to_string(),
                branch_type: BranchType::Local,
            });
        }
    }

    let remote = run_git_checked(root, &["branch", "-r", "--format=%(refname:short)"]).await?;
    for line in String::from_utf8_lossy(&remote.stdout).lines() {
        let name = line.trim();
        if !name.is_empty() && !name.ends_with("/HEAD") {
            result.push(BranchInfo {
                name: name.to_string(),
                branch_type: BranchType::Remote,
            });
        }
    }

    Ok(result)
}

fn infer_status(diff_content: &str) -> FileChangeStatus {
    if diff_content.contains("\nnew file mode") {
        FileChangeStatus::Added
    } else if diff_content.contains("\ndeleted file mode") {
        FileChangeStatus::Deleted
    } else if diff_content.contains("\nrename from ") && diff_content.contains("\nrename to ") {
        FileChangeStatus::Renamed
    } else {
        FileChangeStatus::Modified
    }
}

/// Parse `git diff --numstat` plus full unified diff output into per-file
/// entries. Binary files appear in numstat only and keep empty content.
pub fn parse_diff(numstat_text: &str, diff_text: &str) -> Vec<DiffFile> {
    let mut stats: Vec<(String, u32, u32)> = Vec::new();
    for caps in NUMSTAT_LINE.captures_iter(numstat_text) {
        let adds = caps[1].parse().unwrap_or(0);
        let dels = caps[2].parse().unwrap_or(0);
        stats.push((caps[3].to_string(), adds, dels));
    }

    // Split the unified diff into per-file sections on its headers.
    let mut sections: Vec<(String, String)> = Vec::new();
    let headers: Vec<_> = DIFF_HEADER.captures_iter(diff_text).collect();
    let positions: Vec<usize> = DIFF_HEADER.find_iter(diff_text).map(|m| m.start()).collect();
    for (i, caps) in headers.iter().enumerate() {
        let path = caps[2].to_string();
        let start = positions[i];
        let end = positions.get(i + 1).copied().unwrap_or(diff_text.len());
        sections.push((path, diff_text[start..end].trim().to_string()));
    }

    let mut files: Vec<DiffFile> = Vec::new();
    for (path, content) in &sections {
        let (adds, dels) = stats
            .iter()
            .find(|(p, _, _)| p == path)
            .map(|(_, a, d)| (*a, *d))
            .unwrap_or((0, 0));
        files.push(DiffFile {
            path: path.clone(),
            status: infer_status(content),
            additions: adds,
            deletions: dels,
            content: content.clone(),
        });
    }
    for (path, adds, dels) in stats {
        if !sections.iter().any(|(p, _)| *p == path) {
            files.push(DiffFile {
                path,
                status: FileChangeStatus::Modified,
                additions: adds,
                deletions: dels,
                content: String::new(),
            });
        }
    }
    files
}

/// Full per-file diff between two revisions, content included.
pub async fn collect_diff(root: &Path, base: &str, head: &str) -> Result<Vec<DiffFile>> {
    let range = format!("{}...{}", base, head);
    let numstat = run_git_checked(root, &["diff", &range, "--numstat"]).await?;
    let diff = run_git_checked(root, &["diff", &range]).await?;
    Ok(parse_diff(
        &String::from_utf8_lossy(&numstat.stdout),
        &String::from_utf8_lossy(&diff.stdout),
    ))
}

/// Ordered changed-file list (no diff bodies).
pub async fn files(root: &Path, base: &str, head: &str) -> Result<Vec<DiffFile>> {
    let mut list = collect_diff(root, base, head).await?;
    for f in &mut list {
        f.content.clear();
    }
    Ok(list)
}

/// Unified diff for a single file; empty string when unchanged.
pub async fn diff(root: &Path, base: &str, head: &str, path: &str) -> Result<String> {
    check_within_root(path)?;
    let range = format!("{}...{}", base, head);
    let output = run_git_checked(root, &["diff", &range, "--", path]).await?;
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// File-scoped delta diff between two heads, used by verification.
/// With an empty `paths` the whole delta is returned.
pub async fn delta(
    root: &Path,
    prev_head: &str,
    new_head: &str,
    paths: &[String],
) -> Result<Vec<DiffFile>> {
    for p in paths {
        check_within_root(p)?;
    }
    let range = format!("{}..{}", prev_head, new_head);
    let mut numstat_args = vec!["diff", &range, "--numstat"];
    let mut diff_args = vec!["diff", &range];
    if !paths.is_empty() {
        numstat_args.push("--");
        diff_args.push("--");
        for p in paths {
            numstat_args.push(p);
            diff_args.push(p);
        }
    }
    let numstat = run_git_checked(root, &numstat_args).await?;
    let diff = run_git_checked(root, &diff_args).await?;
    Ok(parse_diff(
        &String::from_utf8_lossy(&numstat.stdout),
        &String::from_utf8_lossy(&diff.stdout),
    ))
}

/// Inclusive line-range read of a file at `head`.
pub async fn read(
    root: &Path,
    head: &str,
    path: &str,
    start: Option<u32>,
    end: Option<u32>,
) -> Result<FileSlice> {
    check_within_root(path)?;
    if let (Some(s), Some(e)) = (start, end)
        && (s == 0 || e < s)
    {
        return Err(ReviewError::repo(
            RepoErrorKind::RangeInvalid,
            format!("invalid range {}..{}", s, e),
        ));
    }

    let spec = format!("{}:{}", head, path);
    let output = run_git(root, &["show", &spec]).await?;
    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        return Err(classify_git_error(&stderr));
    }
    let content = String::from_utf8_lossy(&output.stdout).to_string();
    let all_lines: Vec<&str> = content.lines().collect();
    let total = all_lines.len() as u32;

    let s = start.unwrap_or(1).max(1);
    let mut e = end.unwrap_or(total).min(total);
    if e < s && total > 0 {
        e = s.min(total);
    }
    if e.saturating_sub(s) + 1 > MAX_READ_LINES {
        e = s + MAX_READ_LINES - 1;
    }

    let lines = all_lines
        .iter()
        .enumerate()
        .skip(s.saturating_sub(1) as usize)
        .take(e.saturating_sub(s) as usize + 1)
        .map(|(idx, line)| FileLine {
            number: idx as u32 + 1,
            content: (*line).to_string(),
        })
        .collect();

    Ok(FileSlice {
        path: path.to_string(),
        start_line: s,
        end_line: e,
        total_lines: total,
        lines,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE_DIFF: &str = "diff --git a/src/parse.rs b/src/parse.rs\n\
index 1111111..2222222 100644\n\
--- a/src/parse.rs\n\
+++ b/src/parse.rs\n\
@@ -10,3 +10,4 @@\n\
 fn parse() {\n\
+    check();\n\
 }\n\
diff --git a/src/new.rs b/src/new.rs\n\
new file mode 100644\n\
index 0000000..3333333\n\
--- /dev/null\n\
+++ b/src/new.rs\n\
@@ -0,0 +1,2 @@\n\
+fn fresh() {}\n\
+\n";

    const SAMPLE_NUMSTAT: &str = "1\t0\tsrc/parse.rs\n2\t0\tsrc/new.rs\n-\t-\tassets/logo.png\n";

    #[test]
    fn test_parse_diff_splits_files() {
        let files = parse_diff(SAMPLE_NUMSTAT, SAMPLE_DIFF);
        assert_eq!(files.len(), 3);
        assert_eq!(files[0].path, "src/parse.rs");
        assert_eq!(files[0].additions, 1);
        assert_eq!(files[0].status, FileChangeStatus::Modified);
        assert!(files[0].content.contains("check()"));
    }

    #[test]
    fn test_parse_diff_detects_added_file() {
        let files = parse_diff(SAMPLE_NUMSTAT, SAMPLE_DIFF);
        assert_eq!(files[1].path, "src/new.rs");
        assert_eq!(files[1].status, FileChangeStatus::Added);
    }

    #[test]
    fn test_parse_diff_keeps_binary_from_numstat() {
        let files = parse_diff(SAMPLE_NUMSTAT, SAMPLE_DIFF);
        let binary = files.iter().find(|f| f.path == "assets/logo.png").unwrap();
        assert!(binary.content.is_empty());
        assert_eq!(binary.additions, 0);
    }

    #[test]
    fn test_traversal_rejected() {
        assert!(check_within_root("../etc/passwd").is_err());
        assert!(check_within_root("/etc/passwd").is_err());
        assert!(check_within_root("src/../../x").is_err());
        assert!(check_within_root("src/ok.rs").is_ok());
    }

    #[test]
    fn test_classify_git_error() {
        assert_eq!(
            match classify_git_error("fatal: not a git repository") {
                ReviewError::Repo { kind, .. } => kind,
                _ => panic!(),
            },
            RepoErrorKind::NotARepo
        );
        assert_eq!(
            match classify_git_error("fatal: bad revision 'nope'") {
                ReviewError::Repo { kind, .. } => kind,
                _ => panic!(),
            },
            RepoErrorKind::NoSuchRef
        );
    }
}
