use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::{broadcast, watch, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use tether_types::{AskKind, AskReply, EngineEvent, ToolCategory, ToolId};

use crate::config::AutoApprovalSettings;
use crate::event_bus::EventBus;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PermissionAction {
    Allow,
    Ask,
    Deny,
}

/// Whether an invocation of `tool` may run without asking.
pub fn evaluate_tool(settings: &AutoApprovalSettings, tool: ToolId) -> PermissionAction {
    if settings.denied_tools.contains(&tool) {
        return PermissionAction::Deny;
    }
    if !settings.enabled {
        return PermissionAction::Ask;
    }
    let allowed = match tool.category() {
        ToolCategory::Read => settings.read,
        ToolCategory::Edit => settings.edit,
        ToolCategory::Execute => settings.execute,
        ToolCategory::Browse => settings.browse,
        ToolCategory::ExternalTool => settings.external_tool,
        ToolCategory::Interaction => false,
    };
    if allowed {
        PermissionAction::Allow
    } else {
        PermissionAction::Ask
    }
}

/// An ask the task is suspended on, addressed by the transcript timestamp of
/// the entry that raised it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PendingAsk {
    #[serde(rename = "taskID")]
    pub task_id: String,
    pub ts: i64,
    pub kind: AskKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
}

type AskKey = (String, i64);

#[derive(Clone)]
pub struct ApprovalHost {
    asks: Arc<RwLock<HashMap<AskKey, PendingAsk>>>,
    waiters: Arc<RwLock<HashMap<AskKey, watch::Sender<Option<AskReply>>>>>,
    event_bus: EventBus,
}

impl ApprovalHost {
    pub fn new(event_bus: EventBus) -> Self {
        Self {
            asks: Arc::new(RwLock::new(HashMap::new())),
            waiters: Arc::new(RwLock::new(HashMap::new())),
            event_bus,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.event_bus
    }

    /// Records a pending ask and returns the receiver its reply arrives on.
    pub async fn register(&self, ask: PendingAsk) -> watch::Receiver<Option<AskReply>> {
        let key = (ask.task_id.clone(), ask.ts);
        let (tx, rx) = watch::channel(None);
        self.waiters.write().await.insert(key.clone(), tx);
        self.asks.write().await.insert(key, ask.clone());
        self.event_bus.publish(EngineEvent::new(
            "ask.pending",
            serde_json::to_value(&ask).unwrap_or_default(),
        ));
        rx
    }

    /// Answers a pending ask. Returns `false` when nothing is waiting on
    /// `(task_id, ts)`, for example because the ask was already answered.
    pub async fn reply(&self, task_id: &str, ts: i64, reply: AskReply) -> bool {
        let key = (task_id.to_string(), ts);
        if self.asks.write().await.remove(&key).is_none() {
            return false;
        }
        self.event_bus.publish(EngineEvent::new(
            "ask.replied",
            json!({"taskID": task_id, "ts": ts, "response": reply.response}),
        ));
        if let Some(waiter) = self.waiters.write().await.remove(&key) {
            let _ = waiter.send(Some(reply));
        }
        true
    }

    pub async fn forget(&self, task_id: &str, ts: i64) {
        let key = (task_id.to_string(), ts);
        self.asks.write().await.remove(&key);
        self.waiters.write().await.remove(&key);
    }

    pub async fn forget_task(&self, task_id: &str) {
        self.asks.write().await.retain(|(id, _), _| id != task_id);
        self.waiters.write().await.retain(|(id, _), _| id != task_id);
    }

    /// Resolves with the reply, or `None` once `cancel` fires or the ask is
    /// forgotten without an answer.
    pub async fn wait_for_reply(
        &self,
        mut rx: watch::Receiver<Option<AskReply>>,
        cancel: CancellationToken,
    ) -> Option<AskReply> {
        loop {
            let current = { rx.borrow().clone() };
            if current.is_some() {
                return current;
            }
            tokio::select! {
                _ = cancel.cancelled() => return None,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return rx.borrow().clone();
                    }
                }
            }
        }
    }

    /// Answers asks as they are raised. `respond` returning `None` leaves the
    /// ask for someone else.
    pub fn spawn_responder<F>(&self, mut respond: F) -> JoinHandle<()>
    where
        F: FnMut(&PendingAsk) -> Option<AskReply> + Send + 'static,
    {
        let host = self.clone();
        let mut events = self.event_bus.subscribe();
        tokio::spawn(async move {
            loop {
                let event = match events.recv().await {
                    Ok(event) => event,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "ask responder lagged behind the event bus");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                };
                if event.event_type != "ask.pending" {
                    continue;
                }
                let Ok(ask) = serde_json::from_value::<PendingAsk>(event.properties) else {
                    continue;
                };
                if let Some(reply) = respond(&ask) {
                    host.reply(&ask.task_id, ask.ts, reply).await;
                }
            }
        })
    }
}
