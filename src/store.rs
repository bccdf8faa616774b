//! Durable session storage.
//!
//! One directory per session: `sessions/{sid}/session.json`,
//! `sessions/{sid}/issues/{iid}.json`, `sessions/{sid}/reviews.json`,
//! `sessions/{sid}/tokens.json`; a process-wide `presets.json` beside them.
//! Every write goes to a temp file and is renamed into place, so a crash
//! mid-write never corrupts prior state. Unknown JSON fields are ignored on
//! read. Cross-entity consistency is the session lock's job, not ours.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::fs;
use tracing::{debug, warn};

use crate::auth::AccessKeys;
use crate::error::{Result, ReviewError};
use crate::models::{AgentConfig, Issue, Review, Session};

pub struct SessionStore {
    root: PathBuf,
}

impl SessionStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn sessions_dir(&self) -> PathBuf {
        self.root.join("sessions")
    }

    fn session_dir(&self, session_id: &str) -> PathBuf {
        self.sessions_dir().join(session_id)
    }

    fn issues_dir(&self, session_id: &str) -> PathBuf {
        self.session_dir(session_id).join("issues")
    }

    fn presets_path(&self) -> PathBuf {
        self.root.join("presets.json")
    }

    pub async fn init(&self) -> Result<()> {
        fs::create_dir_all(self.sessions_dir()).await?;
        self.recover_interrupted_writes().await;
        Ok(())
    }

    /// Remove temp files left behind by an interrupted write.
    async fn recover_interrupted_writes(&self) {
        let mut stack = vec![self.root.clone()];
        while let Some(dir) = stack.pop() {
            let Ok(mut entries) = fs::read_dir(&dir).await else {
                continue;
            };
            while let Ok(Some(entry)) = entries.next_entry().await {
                let path = entry.path();
                if path.is_dir() {
                    stack.push(path);
                } else if path.extension().is_some_and(|ext| ext == "tmp") {
                    debug!(path = %path.display(), "removing interrupted write");
                    let _ = fs::remove_file(&path).await;
                }
            }
        }
    }

    async fn write_atomic<T: Serialize>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }
        let content = serde_json::to_vec_pretty(value)?;
        let tmp_path = path.with_extension("json.tmp");
        fs::write(&tmp_path, &content).await?;

        // Flush the temp file before the rename makes it visible.
        let sync_path = tmp_path.clone();
        let synced = tokio::task::spawn_blocking(move || {
            std::fs::File::open(&sync_path).and_then(|f| f.sync_all())
        })
        .await;
        match synced {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to sync temp file"),
            Err(e) => warn!(error = %e, "sync task failed"),
        }

        fs::rename(&tmp_path, path)
            .await
            .map_err(|e| ReviewError::Storage(format!("rename {}: {}", path.display(), e)))?;
        Ok(())
    }

    async fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<Option<T>> {
        match fs::read_to_string(path).await {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    // --- Sessions ---

    /// Persist the session record (not its issues/reviews/tokens).
    pub async fn save_session(&self, session: &Session) -> Result<()> {
        let path = self.session_dir(&session.id).join("session.json");
        self.write_atomic(&path, session).await
    }

    pub async fn save_issue(&self, session_id: &str, issue: &Issue) -> Result<()> {
        let path = self.issues_dir(session_id).join(format!("{}.json", issue.id));
        self.write_atomic(&path, issue).await
    }

    pub async fn save_reviews(&self, session_id: &str, reviews: &[Review]) -> Result<()> {
        let path = self.session_dir(session_id).join("reviews.json");
        self.write_atomic(&path, &reviews).await
    }

    pub async fn save_tokens(&self, session_id: &str, keys: &AccessKeys) -> Result<()> {
        let path = self.session_dir(session_id).join("tokens.json");
        self.write_atomic(&path, keys).await
    }

    /// Persist a session and everything it owns.
    pub async fn save_all(&self, session: &Session) -> Result<()> {
        self.save_session(session).await?;
        self.save_reviews(&session.id, &session.reviews).await?;
        self.save_tokens(&session.id, &session.keys).await?;
        for issue in &session.issues {
            self.save_issue(&session.id, issue).await?;
        }
        Ok(())
    }

    /// Load one session, reassembling issues, reviews, and tokens.
    pub async fn load_session(&self, session_id: &str) -> Result<Session> {
        let path = self.session_dir(session_id).join("session.json");
        let mut session: Session = self
            .read_json(&path)
            .await?
            .ok_or_else(|| ReviewError::SessionNotFound(session_id.to_string()))?;

        if let Some(mut reviews) = self
            .read_json::<Vec<Review>>(&self.session_dir(session_id).join("reviews.json"))
            .await?
        {
            reviews.sort_by(|a, b| (a.turn, a.submitted_at).cmp(&(b.turn, b.submitted_at)));
            session.reviews = reviews;
        }

        if let Some(keys) = self
            .read_json::<AccessKeys>(&self.session_dir(session_id).join("tokens.json"))
            .await?
        {
            session.keys = keys;
        }

        let mut issues = Vec::new();
        for issue_id in &session.issue_order {
            let issue_path = self.issues_dir(session_id).join(format!("{}.json", issue_id));
            match self.read_json::<Issue>(&issue_path).await {
                Ok(Some(issue)) => issues.push(issue),
                Ok(None) => warn!(session_id, issue_id, "issue file missing, skipping"),
                Err(e) => warn!(session_id, issue_id, error = %e, "issue file unreadable, skipping"),
            }
        }
        session.issues = issues;

        Ok(session)
    }

    /// Load every persisted session, newest first. Unreadable sessions are
    /// skipped with a warning rather than failing boot.
    pub async fn load_all(&self) -> Result<Vec<Session>> {
        let mut sessions = Vec::new();
        let dir = self.sessions_dir();
        if !dir.exists() {
            return Ok(sessions);
        }
        let mut entries = fs::read_dir(&dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            if !entry.path().is_dir() {
                continue;
            }
            let session_id = entry.file_name().to_string_lossy().to_string();
            match self.load_session(&session_id).await {
                Ok(session) => sessions.push(session),
                Err(e) => warn!(session_id, error = %e, "skipping unreadable session"),
            }
        }
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    pub async fn delete_session(&self, session_id: &str) -> Result<()> {
        let dir = self.session_dir(session_id);
        if dir.exists() {
            fs::remove_dir_all(&dir).await?;
        }
        Ok(())
    }

    // --- Presets ---

    pub async fn save_presets(&self, presets: &HashMap<String, AgentConfig>) -> Result<()> {
        let mut list: Vec<&AgentConfig> = presets.values().collect();
        list.sort_by(|a, b| a.id.cmp(&b.id));
        self.write_atomic(&self.presets_path(), &list).await
    }

    pub async fn load_presets(&self) -> Result<Vec<AgentConfig>> {
        Ok(self
            .read_json::<Vec<AgentConfig>>(&self.presets_path())
            .await?
            .unwrap_or_default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Opinion, OpinionAction, Severity};

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        (dir, store)
    }

    #[tokio::test]
    async fn test_session_round_trip() {
        let (_dir, store) = store();
        store.init().await.unwrap();

        let mut session = Session::default();
        session.head = "abc123".to_string();
        let mut issue = Issue {
            title: "leak".into(),
            severity: Severity::High,
            file: "a.rs".into(),
            raised_by: "m1".into(),
            ..Default::default()
        };
        issue
            .thread
            .push(Opinion::new("m1", OpinionAction::Raise, "leak"));
        session.issue_order.push(issue.id.clone());
        session.issues.push(issue);
        session.reviews.push(Review {
            model_id: "m1".into(),
            ..Default::default()
        });
        session.keys.ensure_agent_key("m1");

        store.save_all(&session).await.unwrap();
        let loaded = store.load_session(&session.id).await.unwrap();

        assert_eq!(loaded.head, "abc123");
        assert_eq!(loaded.issues.len(), 1);
        assert_eq!(loaded.issues[0].thread.len(), 1);
        assert_eq!(loaded.reviews.len(), 1);
        assert!(loaded.keys.agent_key("m1").is_some());
    }

    #[tokio::test]
    async fn test_load_missing_session() {
        let (_dir, store) = store();
        store.init().await.unwrap();
        let err = store.load_session("nope").await.unwrap_err();
        assert_eq!(err.kind(), "not_found");
    }

    #[tokio::test]
    async fn test_interrupted_write_swept_on_init() {
        let (_dir, store) = store();
        store.init().await.unwrap();

        let session = Session::default();
        store.save_all(&session).await.unwrap();

        let stray = store
            .session_dir(&session.id)
            .join("session.json.tmp");
        fs::write(&stray, b"{garbage").await.unwrap();

        store.init().await.unwrap();
        assert!(!stray.exists());
        // The real file is intact.
        assert!(store.load_session(&session.id).await.is_ok());
    }

    #[tokio::test]
    async fn test_delete_session_removes_directory() {
        let (_dir, store) = store();
        store.init().await.unwrap();
        let session = Session::default();
        store.save_all(&session).await.unwrap();

        store.delete_session(&session.id).await.unwrap();
        assert!(store.load_session(&session.id).await.is_err());
    }

    #[tokio::test]
    async fn test_presets_round_trip() {
        let (_dir, store) = store();
        store.init().await.unwrap();

        let mut presets = HashMap::new();
        presets.insert(
            "preset-claude".to_string(),
            AgentConfig {
                id: "preset-claude".into(),
                ..Default::default()
            },
        );
        store.save_presets(&presets).await.unwrap();
        let loaded = store.load_presets().await.unwrap();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].id, "preset-claude");
    }

    #[tokio::test]
    async fn test_reviews_sorted_by_turn_then_time() {
        let (_dir, store) = store();
        store.init().await.unwrap();

        let mut session = Session::default();
        let early = chrono::Utc::now();
        let late = early + chrono::Duration::seconds(5);
        session.reviews = vec![
            Review {
                model_id: "b".into(),
                turn: 1,
                submitted_at: early,
                ..Default::default()
            },
            Review {
                model_id: "a".into(),
                turn: 0,
                submitted_at: late,
                ..Default::default()
            },
            Review {
                model_id: "c".into(),
                turn: 0,
                submitted_at: early,
                ..Default::default()
            },
        ];
        store.save_all(&session).await.unwrap();

        let loaded = store.load_session(&session.id).await.unwrap();
        let order: Vec<&str> = loaded.reviews.iter().map(|r| r.model_id.as_str()).collect();
        assert_eq!(order, vec!["c", "a", "b"]);
    }
}
