use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::fs;
use tokio::sync::RwLock;

use tether_types::{Message, TranscriptEntry};

use crate::context_window::DeletedRange;
use crate::mode::Mode;

const HISTORY_FILE: &str = "api_conversation_history.json";
const TRANSCRIPT_FILE: &str = "ui_messages.json";
const META_FILE: &str = "task_meta.json";

/// Everything needed to pick a task back up.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskSnapshot {
    pub task_id: String,
    pub history: Vec<Message>,
    pub transcript: Vec<TranscriptEntry>,
    #[serde(default)]
    pub deleted_range: Option<DeletedRange>,
    #[serde(default)]
    pub mode: Mode,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct TaskMeta {
    #[serde(default)]
    deleted_range: Option<DeletedRange>,
    #[serde(default)]
    mode: Mode,
    updated_at: DateTime<Utc>,
}

#[async_trait]
pub trait TaskStore: Send + Sync {
    async fn save(&self, snapshot: &TaskSnapshot) -> anyhow::Result<()>;

    async fn load(&self, task_id: &str) -> anyhow::Result<Option<TaskSnapshot>>;

    async fn list(&self) -> anyhow::Result<Vec<String>>;
}

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: RwLock<HashMap<String, TaskSnapshot>>,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn save(&self, snapshot: &TaskSnapshot) -> anyhow::Result<()> {
        self.tasks
            .write()
            .await
            .insert(snapshot.task_id.clone(), snapshot.clone());
        Ok(())
    }

    async fn load(&self, task_id: &str) -> anyhow::Result<Option<TaskSnapshot>> {
        Ok(self.tasks.read().await.get(task_id).cloned())
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut ids = self.tasks.read().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        Ok(ids)
    }
}

/// One directory per task under `<base>/tasks`, holding the model history and
/// the transcript as separate JSON documents.
pub struct FileTaskStore {
    base: PathBuf,
}

impl FileTaskStore {
    pub async fn new(base: impl AsRef<Path>) -> anyhow::Result<Self> {
        let base = base.as_ref().to_path_buf();
        fs::create_dir_all(base.join("tasks"))
            .await
            .with_context(|| format!("creating task store at {}", base.display()))?;
        Ok(Self { base })
    }

    fn task_dir(&self, task_id: &str) -> PathBuf {
        self.base.join("tasks").join(task_id)
    }
}

#[async_trait]
impl TaskStore for FileTaskStore {
    async fn save(&self, snapshot: &TaskSnapshot) -> anyhow::Result<()> {
        let dir = self.task_dir(&snapshot.task_id);
        fs::create_dir_all(&dir).await?;
        let history = serde_json::to_string_pretty(&snapshot.history)?;
        fs::write(dir.join(HISTORY_FILE), history).await?;
        let transcript = serde_json::to_string_pretty(&snapshot.transcript)?;
        fs::write(dir.join(TRANSCRIPT_FILE), transcript).await?;
        let meta = serde_json::to_string_pretty(&TaskMeta {
            deleted_range: snapshot.deleted_range,
            mode: snapshot.mode,
            updated_at: snapshot.updated_at,
        })?;
        fs::write(dir.join(META_FILE), meta).await?;
        Ok(())
    }

    async fn load(&self, task_id: &str) -> anyhow::Result<Option<TaskSnapshot>> {
        let dir = self.task_dir(task_id);
        let history_path = dir.join(HISTORY_FILE);
        if !history_path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&history_path).await?;
        let history: Vec<Message> = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", history_path.display()))?;

        let transcript_path = dir.join(TRANSCRIPT_FILE);
        let transcript: Vec<TranscriptEntry> = if transcript_path.exists() {
            let raw = fs::read_to_string(&transcript_path).await?;
            serde_json::from_str(&raw)
                .with_context(|| format!("parsing {}", transcript_path.display()))?
        } else {
            Vec::new()
        };

        let meta_path = dir.join(META_FILE);
        let meta = match fs::read_to_string(&meta_path).await {
            Ok(raw) => serde_json::from_str::<TaskMeta>(&raw).ok(),
            Err(_) => None,
        };
        let (deleted_range, mode, updated_at) = match meta {
            Some(meta) => (meta.deleted_range, meta.mode, meta.updated_at),
            None => (None, Mode::default(), Utc::now()),
        };

        Ok(Some(TaskSnapshot {
            task_id: task_id.to_string(),
            history,
            transcript,
            deleted_range,
            mode,
            updated_at,
        }))
    }

    async fn list(&self) -> anyhow::Result<Vec<String>> {
        let mut ids = Vec::new();
        let mut entries = fs::read_dir(self.base.join("tasks")).await?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.path().join(HISTORY_FILE).exists() {
                ids.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        ids.sort();
        Ok(ids)
    }
}
