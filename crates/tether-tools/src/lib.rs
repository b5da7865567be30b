use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use tether_types::{AskKind, SayKind, ToolId, ToolUse};

mod command;
mod files;
mod search;

pub use command::ExecuteCommandTool;
pub use files::{ReadFileTool, ReplaceInFileTool, WriteToFileTool};
pub use search::{ListFilesTool, SearchFilesTool};

/// What a tool hands back to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolOutput {
    pub content: String,
    #[serde(default)]
    pub is_error: bool,
}

impl ToolOutput {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: false,
        }
    }

    pub fn error(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            is_error: true,
        }
    }
}

/// A request for the human to approve one invocation.
#[derive(Debug, Clone)]
pub struct ApprovalRequest {
    pub ask: AskKind,
    pub tool: ToolId,
    /// JSON payload rendered by the host.
    pub payload: Value,
    /// Ask even when the tool's category is auto-approved.
    pub force_ask: bool,
}

impl ApprovalRequest {
    pub fn tool(tool: ToolId, payload: Value) -> Self {
        Self {
            ask: AskKind::Tool,
            tool,
            payload,
            force_ask: false,
        }
    }
}

/// Proposed file content while an edit is still streaming.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditPreview {
    pub path: String,
    pub original: String,
    pub proposed: String,
}

#[derive(Debug, Clone)]
pub struct ToolPreview {
    pub payload: Value,
    pub edit: Option<EditPreview>,
}

/// The orchestrator side of a tool invocation. Executors never touch the
/// conversation directly; everything they report flows through here.
#[async_trait]
pub trait ToolCallbacks: Send {
    /// Resolves to `true` when the invocation may proceed. A rejection has
    /// already been recorded as the tool result when this returns `false`.
    async fn ask_approval(&mut self, request: ApprovalRequest) -> anyhow::Result<bool>;

    fn push_result(&mut self, output: ToolOutput);

    async fn handle_error(&mut self, action: &str, error: anyhow::Error) -> anyhow::Result<()>;

    async fn say(&mut self, kind: SayKind, text: &str) -> anyhow::Result<()>;

    /// Counts a model mistake, such as an edit whose search text is absent.
    fn record_mistake(&mut self);

    fn cancel_token(&self) -> CancellationToken;
}

#[async_trait]
pub trait ToolExecutor: Send + Sync {
    fn id(&self) -> ToolId;

    /// Live preview for an invocation that is still streaming.
    async fn preview(&self, _tool: &ToolUse) -> anyhow::Result<Option<ToolPreview>> {
        Ok(None)
    }

    async fn execute(&self, tool: &ToolUse, callbacks: &mut dyn ToolCallbacks)
        -> anyhow::Result<()>;
}

#[derive(Clone, Default)]
pub struct ToolRegistry {
    executors: Arc<RwLock<HashMap<ToolId, Arc<dyn ToolExecutor>>>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the sandboxed file, search and shell tools rooted at
    /// `workspace`.
    pub fn with_workspace_tools(workspace: Workspace) -> Self {
        let mut map: HashMap<ToolId, Arc<dyn ToolExecutor>> = HashMap::new();
        let tools: Vec<Arc<dyn ToolExecutor>> = vec![
            Arc::new(ReadFileTool::new(workspace.clone())),
            Arc::new(WriteToFileTool::new(workspace.clone())),
            Arc::new(ReplaceInFileTool::new(workspace.clone())),
            Arc::new(ListFilesTool::new(workspace.clone())),
            Arc::new(SearchFilesTool::new(workspace.clone())),
            Arc::new(ExecuteCommandTool::new(workspace)),
        ];
        for tool in tools {
            map.insert(tool.id(), tool);
        }
        Self {
            executors: Arc::new(RwLock::new(map)),
        }
    }

    pub async fn register(&self, executor: Arc<dyn ToolExecutor>) {
        self.executors.write().await.insert(executor.id(), executor);
    }

    pub async fn unregister(&self, id: ToolId) -> Option<Arc<dyn ToolExecutor>> {
        self.executors.write().await.remove(&id)
    }

    pub async fn get(&self, id: ToolId) -> Option<Arc<dyn ToolExecutor>> {
        self.executors.read().await.get(&id).cloned()
    }

    pub async fn list(&self) -> Vec<ToolId> {
        let mut ids = self.executors.read().await.keys().copied().collect::<Vec<_>>();
        ids.sort();
        ids
    }
}

/// Directory the file and shell tools are confined to.
#[derive(Debug, Clone)]
pub struct Workspace {
    root: PathBuf,
}

impl Workspace {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Joins a model-supplied relative path onto the root.
    pub fn resolve(&self, path: &str) -> anyhow::Result<PathBuf> {
        if !is_path_allowed(path) {
            anyhow::bail!("path `{path}` denied by sandbox policy");
        }
        Ok(self.root.join(path))
    }
}

fn is_path_allowed(path: &str) -> bool {
    let raw = Path::new(path);
    if path.trim().is_empty() || raw.is_absolute() {
        return false;
    }
    !raw.components().any(|c| matches!(c, Component::ParentDir))
}

pub(crate) fn required_param<'a>(
    tool: &'a ToolUse,
    param: tether_types::ToolParam,
) -> anyhow::Result<&'a str> {
    tool.param(param)
        .filter(|v| !v.trim().is_empty())
        .ok_or_else(|| anyhow::anyhow!("missing required parameter `{param}` for `{}`", tool.name))
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    /// Callbacks that approve or reject everything and record what happened.
    pub struct RecordingCallbacks {
        pub approve: bool,
        pub approvals: Vec<ApprovalRequest>,
        pub results: Vec<ToolOutput>,
        pub errors: Vec<String>,
        pub said: Vec<(SayKind, String)>,
        pub mistakes: usize,
        pub cancel: CancellationToken,
    }

    impl RecordingCallbacks {
        pub fn approving() -> Self {
            Self {
                approve: true,
                approvals: Vec::new(),
                results: Vec::new(),
                errors: Vec::new(),
                said: Vec::new(),
                mistakes: 0,
                cancel: CancellationToken::new(),
            }
        }

        pub fn rejecting() -> Self {
            Self {
                approve: false,
                ..Self::approving()
            }
        }
    }

    #[async_trait]
    impl ToolCallbacks for RecordingCallbacks {
        async fn ask_approval(&mut self, request: ApprovalRequest) -> anyhow::Result<bool> {
            self.approvals.push(request);
            if !self.approve {
                self.results.push(ToolOutput::text("The user denied this operation."));
            }
            Ok(self.approve)
        }

        fn push_result(&mut self, output: ToolOutput) {
            self.results.push(output);
        }

        async fn handle_error(&mut self, action: &str, error: anyhow::Error) -> anyhow::Result<()> {
            let message = format!("Error {action}: {error}");
            self.errors.push(message.clone());
            self.results.push(ToolOutput::error(message));
            Ok(())
        }

        async fn say(&mut self, kind: SayKind, text: &str) -> anyhow::Result<()> {
            self.said.push((kind, text.to_string()));
            Ok(())
        }

        fn record_mistake(&mut self) {
            self.mistakes += 1;
        }

        fn cancel_token(&self) -> CancellationToken {
            self.cancel.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sandbox_rejects_escaping_paths() {
        assert!(is_path_allowed("src/lib.rs"));
        assert!(!is_path_allowed("../secrets"));
        assert!(!is_path_allowed("/etc/passwd"));
        assert!(!is_path_allowed("  "));
        let ws = Workspace::new("/tmp/ws");
        assert_eq!(ws.resolve("a/b.txt").unwrap(), PathBuf::from("/tmp/ws/a/b.txt"));
        assert!(ws.resolve("a/../../b").is_err());
    }

    #[tokio::test]
    async fn workspace_registry_covers_local_tools_only() {
        let registry = ToolRegistry::with_workspace_tools(Workspace::new("."));
        assert_eq!(
            registry.list().await,
            vec![
                ToolId::ReadFile,
                ToolId::WriteToFile,
                ToolId::ReplaceInFile,
                ToolId::ExecuteCommand,
                ToolId::ListFiles,
                ToolId::SearchFiles,
            ]
        );
        assert!(registry.get(ToolId::BrowserAction).await.is_none());
    }

    #[tokio::test]
    async fn register_and_unregister_by_id() {
        let registry = ToolRegistry::new();
        registry
            .register(Arc::new(ReadFileTool::new(Workspace::new("."))))
            .await;
        assert!(registry.get(ToolId::ReadFile).await.is_some());
        assert!(registry.unregister(ToolId::ReadFile).await.is_some());
        assert!(registry.list().await.is_empty());
    }
}
