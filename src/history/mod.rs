use crate::models::ChatSession;
use anyhow::{Context, Result};
use chrono::Local;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

pub const HISTORY_FILE: &str = "chat_history.json";

/// Chat history storage - persists to a JSON file.
///
/// Every mutation runs under one async lock and rewrites the file
/// atomically (temp file + rename), so history writes never interleave.
/// Persistence is best-effort: failures are logged and the in-memory
/// copy stays authoritative.
#[derive(Debug, Clone)]
pub struct HistoryStore {
    file_path: PathBuf,
    sessions: Arc<Mutex<Vec<ChatSession>>>,
}

impl HistoryStore {
    /// Open the store, loading existing sessions if the file exists.
    /// An unreadable file is logged and treated as empty.
    pub fn open(file_path: PathBuf) -> Self {
        let sessions = match read_sessions(&file_path) {
            Ok(sessions) => sessions,
            Err(e) => {
                tracing::error!("Failed to load chat history: {:#}", e);
                Vec::new()
            }
        };
        tracing::debug!("Loaded {} chat sessions from {}", sessions.len(), file_path.display());

        Self {
            file_path,
            sessions: Arc::new(Mutex::new(sessions)),
        }
    }

    /// `<dir>/chat_history.json`
    pub fn in_dir(dir: &Path) -> Self {
        Self::open(dir.join(HISTORY_FILE))
    }

    pub fn path(&self) -> &Path {
        &self.file_path
    }

    /// All sessions in insertion order
    pub async fn load(&self) -> Vec<ChatSession> {
        self.sessions.lock().await.clone()
    }

    /// Replace every session and persist
    pub async fn save(&self, sessions: Vec<ChatSession>) {
        let mut guard = self.sessions.lock().await;
        *guard = sessions;
        self.persist(&guard).await;
    }

    pub async fn get(&self, id: Uuid) -> Option<ChatSession> {
        self.sessions.lock().await.iter().find(|s| s.id == id).cloned()
    }

    /// Replace the session with the same id, or append it
    pub async fn upsert(&self, session: ChatSession) {
        let mut guard = self.sessions.lock().await;
        match guard.iter_mut().find(|s| s.id == session.id) {
            Some(existing) => *existing = session,
            None => guard.push(session),
        }
        self.persist(&guard).await;
    }

    /// Returns false when no session has that id
    pub async fn delete(&self, id: Uuid) -> bool {
        let mut guard = self.sessions.lock().await;
        let before = guard.len();
        guard.retain(|s| s.id != id);
        if guard.len() == before {
            return false;
        }
        self.persist(&guard).await;
        true
    }

    /// Returns false when no session has that id
    pub async fn rename(&self, id: Uuid, title: impl Into<String>) -> bool {
        let mut guard = self.sessions.lock().await;
        let Some(session) = guard.iter_mut().find(|s| s.id == id) else {
            return false;
        };
        session.title = Some(title.into());
        self.persist(&guard).await;
        true
    }

    /// Case-insensitive match on the title or on the date as shown in
    /// history lists (`5 March 2025`). An empty query returns everything.
    pub async fn search(&self, query: &str) -> Vec<ChatSession> {
        let sessions = self.sessions.lock().await;
        let query = query.trim().to_lowercase();
        if query.is_empty() {
            return sessions.clone();
        }

        sessions
            .iter()
            .filter(|session| {
                let title_match = session
                    .title
                    .as_ref()
                    .is_some_and(|t| t.to_lowercase().contains(&query));
                title_match || display_date(session).to_lowercase().contains(&query)
            })
            .cloned()
            .collect()
    }

    async fn persist(&self, sessions: &[ChatSession]) {
        if let Err(e) = write_atomically(&self.file_path, sessions).await {
            tracing::error!("Failed to save chat history: {:#}", e);
        } else {
            tracing::info!("Chat history saved ({} sessions)", sessions.len());
        }
    }
}

/// Session date as printed in history lists, in local time
pub fn display_date(session: &ChatSession) -> String {
    session.date.with_timezone(&Local).format("%-d %B %Y").to_string()
}

fn read_sessions(path: &Path) -> Result<Vec<ChatSession>> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let content = std::fs::read_to_string(path).context("Failed to read history file")?;
    serde_json::from_str(&content).context("Failed to parse history file")
}

async fn write_atomically(path: &Path, sessions: &[ChatSession]) -> Result<()> {
    let json = serde_json::to_vec_pretty(sessions).context("Failed to serialize history")?;

    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .context("Failed to create history directory")?;
    }

    let tmp_path = path.with_extension("json.tmp");
    tokio::fs::write(&tmp_path, json)
        .await
        .context("Failed to write temporary history file")?;
    tokio::fs::rename(&tmp_path, path)
        .await
        .context("Failed to replace history file")?;
    Ok(())
}
