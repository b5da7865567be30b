use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

/// Cancellation tokens of the tasks currently running, by task id.
#[derive(Clone, Default)]
pub struct CancellationRegistry {
    tokens: Arc<RwLock<HashMap<String, CancellationToken>>>,
}

impl CancellationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Token for `task_id`, replacing any token left over from an earlier run.
    pub async fn create(&self, task_id: &str) -> CancellationToken {
        let token = CancellationToken::new();
        self.tokens
            .write()
            .await
            .insert(task_id.to_string(), token.clone());
        token
    }

    pub async fn cancel(&self, task_id: &str) -> bool {
        match self.tokens.read().await.get(task_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    pub async fn cancel_all(&self) -> usize {
        let tokens = self.tokens.read().await;
        for token in tokens.values() {
            token.cancel();
        }
        tokens.len()
    }

    pub async fn remove(&self, task_id: &str) {
        self.tokens.write().await.remove(task_id);
    }

    pub async fn active(&self) -> Vec<String> {
        let mut ids = self.tokens.read().await.keys().cloned().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}
