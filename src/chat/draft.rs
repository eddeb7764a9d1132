//! Draft persistence for unsent input
//!
//! A single draft is kept on disk as JSON. It is written after the input has
//! been quiet for the debounce period, cleared on send, and offered back on
//! startup only when it belongs to the active conversation and is younger
//! than the maximum age.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(1000);

pub const DEFAULT_MAX_AGE_HOURS: i64 = 24;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    pub text: String,
    pub conversation_id: Option<String>,
    pub timestamp: DateTime<Utc>,
}

impl Draft {
    pub fn new(text: impl Into<String>, conversation_id: Option<String>) -> Self {
        Self {
            text: text.into(),
            conversation_id,
            timestamp: Utc::now(),
        }
    }

    /// A draft with no conversation matches a session with no conversation.
    pub fn matches(&self, conversation_id: Option<&str>) -> bool {
        self.conversation_id.as_deref() == conversation_id
    }

    /// A draft exactly `max_age` old is already expired.
    pub fn is_expired(&self, now: DateTime<Utc>, max_age: chrono::Duration) -> bool {
        now.signed_duration_since(self.timestamp) >= max_age
    }
}

/// JSON file holding at most one draft
#[derive(Debug, Clone)]
pub struct DraftStore {
    path: PathBuf,
    max_age: chrono::Duration,
}

impl DraftStore {
    pub fn new(path: impl Into<PathBuf>, max_age_hours: i64) -> Self {
        Self {
            path: path.into(),
            max_age: chrono::Duration::hours(max_age_hours),
        }
    }

    /// `<data dir>/chat-stream-client/draft.json`
    pub fn default_path() -> PathBuf {
        dirs::data_local_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("chat-stream-client")
            .join("draft.json")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub async fn save(&self, draft: &Draft) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
        }
        let json = serde_json::to_vec_pretty(draft).context("Failed to serialize draft")?;
        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, json)
            .await
            .with_context(|| format!("Failed to write {}", tmp.display()))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .with_context(|| format!("Failed to replace {}", self.path.display()))?;
        debug!(path = %self.path.display(), chars = draft.text.len(), "Draft saved");
        Ok(())
    }

    /// Raw stored draft, if any
    pub async fn load(&self) -> Result<Option<Draft>> {
        let bytes = match tokio::fs::read(&self.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read {}", self.path.display()))
            }
        };
        let draft = serde_json::from_slice(&bytes)
            .with_context(|| format!("Invalid draft file {}", self.path.display()))?;
        Ok(Some(draft))
    }

    /// Draft to offer for `conversation_id`. Anything else on disk (expired,
    /// corrupt, or belonging to another conversation) is deleted.
    pub async fn restore(
        &self,
        conversation_id: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<Option<Draft>> {
        let draft = match self.load().await {
            Ok(Some(draft)) => draft,
            Ok(None) => return Ok(None),
            Err(e) => {
                warn!(error = %format!("{:#}", e), "Discarding unreadable draft");
                self.clear().await?;
                return Ok(None);
            }
        };
        if draft.is_expired(now, self.max_age) {
            info!(saved_at = %draft.timestamp, "Discarding expired draft");
            self.clear().await?;
            return Ok(None);
        }
        if !draft.matches(conversation_id) || draft.text.is_empty() {
            debug!(
                draft_conversation = ?draft.conversation_id,
                active_conversation = ?conversation_id,
                "Discarding draft for another conversation"
            );
            self.clear().await?;
            return Ok(None);
        }
        Ok(Some(draft))
    }

    pub async fn clear(&self) -> Result<()> {
        match tokio::fs::remove_file(&self.path).await {
            Ok(()) => {
                debug!(path = %self.path.display(), "Draft cleared");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e).with_context(|| format!("Failed to remove {}", self.path.display())),
        }
    }
}

// ============================================================================
// Debounced writer
// ============================================================================

enum DraftCommand {
    Save(Draft),
    Clear,
}

/// Coalesces input changes into a single write after a quiet period.
///
/// Runs in its own task so file I/O never stalls the session loop. A clear
/// cancels any pending write.
pub struct DraftDebouncer {
    tx: mpsc::UnboundedSender<DraftCommand>,
    task: JoinHandle<()>,
}

impl DraftDebouncer {
    pub fn new(store: DraftStore, quiet: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(Self::run_loop(store, rx, quiet));
        Self { tx, task }
    }

    /// Non-blocking: the latest draft wins once input goes quiet.
    pub fn trigger(&self, draft: Draft) {
        let _ = self.tx.send(DraftCommand::Save(draft));
    }

    pub fn clear(&self) {
        let _ = self.tx.send(DraftCommand::Clear);
    }

    /// Write any pending draft immediately and stop the writer.
    pub async fn shutdown(self) {
        drop(self.tx);
        let _ = self.task.await;
    }

    async fn run_loop(
        store: DraftStore,
        mut rx: mpsc::UnboundedReceiver<DraftCommand>,
        quiet: Duration,
    ) {
        'outer: loop {
            let mut pending = match rx.recv().await {
                Some(DraftCommand::Save(draft)) => draft,
                Some(DraftCommand::Clear) => {
                    Self::apply_clear(&store).await;
                    continue;
                }
                None => break,
            };

            loop {
                match tokio::time::timeout(quiet, rx.recv()).await {
                    Ok(Some(DraftCommand::Save(draft))) => pending = draft,
                    Ok(Some(DraftCommand::Clear)) => {
                        Self::apply_clear(&store).await;
                        continue 'outer;
                    }
                    Ok(None) => {
                        Self::apply_save(&store, &pending).await;
                        return;
                    }
                    Err(_) => break,
                }
            }

            Self::apply_save(&store, &pending).await;
        }
    }

    async fn apply_save(store: &DraftStore, draft: &Draft) {
        let result = if draft.text.trim().is_empty() {
            store.clear().await
        } else {
            store.save(draft).await
        };
        if let Err(e) = result {
            warn!(error = %format!("{:#}", e), "Failed to persist draft");
        }
    }

    async fn apply_clear(store: &DraftStore) {
        if let Err(e) = store.clear().await {
            warn!(error = %format!("{:#}", e), "Failed to clear draft");
        }
    }
}
