use async_trait::async_trait;

/// Workspace snapshots taken after a tool changes files or runs a command.
#[async_trait]
pub trait CheckpointService: Send + Sync {
    /// Returns an identifier for the snapshot, shown in the transcript.
    async fn save_checkpoint(&self, task_id: &str, label: &str) -> anyhow::Result<String>;
}
