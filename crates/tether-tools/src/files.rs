use async_trait::async_trait;
use serde_json::json;
use tokio::fs;

use tether_patch::construct_new_file_content;
use tether_types::{SayKind, ToolId, ToolParam, ToolUse};

use crate::{
    required_param, ApprovalRequest, EditPreview, ToolCallbacks, ToolExecutor, ToolOutput,
    ToolPreview, Workspace,
};

pub struct ReadFileTool {
    workspace: Workspace,
}

impl ReadFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl ToolExecutor for ReadFileTool {
    fn id(&self) -> ToolId {
        ToolId::ReadFile
    }

    async fn preview(&self, tool: &ToolUse) -> anyhow::Result<Option<ToolPreview>> {
        Ok(Some(ToolPreview {
            payload: json!({"tool": "readFile", "path": tool.param(ToolParam::Path).unwrap_or("")}),
            edit: None,
        }))
    }

    async fn execute(
        &self,
        tool: &ToolUse,
        callbacks: &mut dyn ToolCallbacks,
    ) -> anyhow::Result<()> {
        let path = required_param(tool, ToolParam::Path)?;
        let payload = json!({"tool": "readFile", "path": path});
        if !callbacks
            .ask_approval(ApprovalRequest::tool(self.id(), payload))
            .await?
        {
            return Ok(());
        }
        let resolved = match self.workspace.resolve(path) {
            Ok(resolved) => resolved,
            Err(err) => return callbacks.handle_error("reading file", err).await,
        };
        match fs::read_to_string(&resolved).await {
            Ok(content) => callbacks.push_result(ToolOutput::text(content)),
            Err(err) => {
                callbacks
                    .handle_error("reading file", anyhow::anyhow!("{path}: {err}"))
                    .await?
            }
        }
        Ok(())
    }
}

pub struct WriteToFileTool {
    workspace: Workspace,
}

impl WriteToFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

/// Models sometimes wrap whole-file content in a code fence.
fn strip_code_fence(content: &str) -> String {
    let mut lines: Vec<&str> = content.lines().collect();
    if lines.first().is_some_and(|l| l.trim_start().starts_with("```")) {
        lines.remove(0);
        if lines.last().is_some_and(|l| l.trim() == "```") {
            lines.pop();
        }
    }
    let mut out = lines.join("\n");
    if content.ends_with('\n') && !out.is_empty() {
        out.push('\n');
    }
    out
}

#[async_trait]
impl ToolExecutor for WriteToFileTool {
    fn id(&self) -> ToolId {
        ToolId::WriteToFile
    }

    async fn preview(&self, tool: &ToolUse) -> anyhow::Result<Option<ToolPreview>> {
        let Some(path) = tool.param(ToolParam::Path) else {
            return Ok(None);
        };
        let resolved = self.workspace.resolve(path)?;
        let original = fs::read_to_string(&resolved).await.unwrap_or_default();
        let proposed = strip_code_fence(tool.param(ToolParam::Content).unwrap_or(""));
        Ok(Some(ToolPreview {
            payload: json!({"tool": "newFileCreated", "path": path, "content": proposed}),
            edit: Some(EditPreview {
                path: path.to_string(),
                original,
                proposed,
            }),
        }))
    }

    async fn execute(
        &self,
        tool: &ToolUse,
        callbacks: &mut dyn ToolCallbacks,
    ) -> anyhow::Result<()> {
        let path = required_param(tool, ToolParam::Path)?;
        let content = strip_code_fence(required_param(tool, ToolParam::Content)?);
        let resolved = match self.workspace.resolve(path) {
            Ok(resolved) => resolved,
            Err(err) => return callbacks.handle_error("writing file", err).await,
        };
        let exists = fs::try_exists(&resolved).await.unwrap_or(false);
        let label = if exists { "editedExistingFile" } else { "newFileCreated" };
        let payload = json!({"tool": label, "path": path, "content": content});
        if !callbacks
            .ask_approval(ApprovalRequest::tool(self.id(), payload))
            .await?
        {
            return Ok(());
        }
        if let Some(parent) = resolved.parent() {
            fs::create_dir_all(parent).await?;
        }
        if let Err(err) = fs::write(&resolved, &content).await {
            return callbacks
                .handle_error("writing file", anyhow::anyhow!("{path}: {err}"))
                .await;
        }
        callbacks.push_result(ToolOutput::text(format!(
            "The content was successfully saved to {path}."
        )));
        Ok(())
    }
}

pub struct ReplaceInFileTool {
    workspace: Workspace,
}

impl ReplaceInFileTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl ToolExecutor for ReplaceInFileTool {
    fn id(&self) -> ToolId {
        ToolId::ReplaceInFile
    }

    async fn preview(&self, tool: &ToolUse) -> anyhow::Result<Option<ToolPreview>> {
        let Some(path) = tool.param(ToolParam::Path) else {
            return Ok(None);
        };
        let diff = tool.param(ToolParam::Diff).unwrap_or("");
        let resolved = self.workspace.resolve(path)?;
        let original = fs::read_to_string(&resolved).await?;
        // Mismatches only surface once the invocation is complete.
        let edit = construct_new_file_content(diff, &original, false)
            .ok()
            .map(|proposed| EditPreview {
                path: path.to_string(),
                original,
                proposed,
            });
        Ok(Some(ToolPreview {
            payload: json!({"tool": "editedExistingFile", "path": path, "diff": diff}),
            edit,
        }))
    }

    async fn execute(
        &self,
        tool: &ToolUse,
        callbacks: &mut dyn ToolCallbacks,
    ) -> anyhow::Result<()> {
        let path = required_param(tool, ToolParam::Path)?;
        let diff = required_param(tool, ToolParam::Diff)?;
        let resolved = match self.workspace.resolve(path) {
            Ok(resolved) => resolved,
            Err(err) => return callbacks.handle_error("editing file", err).await,
        };
        let original = match fs::read_to_string(&resolved).await {
            Ok(original) => original,
            Err(err) => {
                return callbacks
                    .handle_error("editing file", anyhow::anyhow!("{path}: {err}"))
                    .await
            }
        };

        let updated = match construct_new_file_content(diff, &original, true) {
            Ok(updated) => updated,
            Err(err) => {
                callbacks.record_mistake();
                callbacks.say(SayKind::DiffError, path).await?;
                callbacks.push_result(ToolOutput::error(format!(
                    "{err}\n\nThe file was not modified. Its current content is:\n\n\
                     <file_content path=\"{path}\">\n{original}\n</file_content>\n\n\
                     Use the exact lines from this content in the SEARCH block."
                )));
                return Ok(());
            }
        };

        let payload = json!({"tool": "editedExistingFile", "path": path, "diff": diff});
        if !callbacks
            .ask_approval(ApprovalRequest::tool(self.id(), payload))
            .await?
        {
            return Ok(());
        }
        if let Err(err) = fs::write(&resolved, &updated).await {
            return callbacks
                .handle_error("editing file", anyhow::anyhow!("{path}: {err}"))
                .await;
        }
        callbacks.push_result(ToolOutput::text(format!(
            "The content was successfully saved to {path}.\n\n\
             <final_file_content path=\"{path}\">\n{updated}\n</final_file_content>"
        )));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordingCallbacks;

    fn tool(id: ToolId, params: &[(ToolParam, &str)]) -> ToolUse {
        let mut tool = ToolUse::new(id);
        for (k, v) in params {
            tool.params.insert(*k, v.to_string());
        }
        tool.partial = false;
        tool
    }

    #[test]
    fn code_fences_are_stripped() {
        assert_eq!(strip_code_fence("```rust\nfn a() {}\n```\n"), "fn a() {}\n");
        assert_eq!(strip_code_fence("plain\n"), "plain\n");
    }

    #[tokio::test]
    async fn write_then_read_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let ws = Workspace::new(dir.path());
        let mut callbacks = RecordingCallbacks::approving();
        WriteToFileTool::new(ws.clone())
            .execute(
                &tool(
                    ToolId::WriteToFile,
                    &[(ToolParam::Path, "nested/a.txt"), (ToolParam::Content, "hello\n")],
                ),
                &mut callbacks,
            )
            .await
            .unwrap();
        assert_eq!(callbacks.approvals[0].payload["tool"], "newFileCreated");

        ReadFileTool::new(ws)
            .execute(
                &tool(ToolId::ReadFile, &[(ToolParam::Path, "nested/a.txt")]),
                &mut callbacks,
            )
            .await
            .unwrap();
        assert_eq!(callbacks.results.last().unwrap().content, "hello\n");
    }

    #[tokio::test]
    async fn rejected_write_leaves_disk_untouched() {
        let dir = tempfile::tempdir().unwrap();
        let mut callbacks = RecordingCallbacks::rejecting();
        WriteToFileTool::new(Workspace::new(dir.path()))
            .execute(
                &tool(
                    ToolId::WriteToFile,
                    &[(ToolParam::Path, "a.txt"), (ToolParam::Content, "x")],
                ),
                &mut callbacks,
            )
            .await
            .unwrap();
        assert!(!dir.path().join("a.txt").exists());
    }

    #[tokio::test]
    async fn replace_in_file_applies_edit_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn a() {\n    1\n}\n").unwrap();
        let mut callbacks = RecordingCallbacks::approving();
        ReplaceInFileTool::new(Workspace::new(dir.path()))
            .execute(
                &tool(
                    ToolId::ReplaceInFile,
                    &[
                        (ToolParam::Path, "lib.rs"),
                        (
                            ToolParam::Diff,
                            "------- SEARCH\n    1\n=======\n    2\n+++++++ REPLACE",
                        ),
                    ],
                ),
                &mut callbacks,
            )
            .await
            .unwrap();
        assert_eq!(
            std::fs::read_to_string(dir.path().join("lib.rs")).unwrap(),
            "fn a() {\n    2\n}\n"
        );
        assert!(!callbacks.results[0].is_error);
    }

    #[tokio::test]
    async fn replace_in_file_mismatch_counts_as_mistake() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("lib.rs"), "fn a() {}\n").unwrap();
        let mut callbacks = RecordingCallbacks::approving();
        ReplaceInFileTool::new(Workspace::new(dir.path()))
            .execute(
                &tool(
                    ToolId::ReplaceInFile,
                    &[
                        (ToolParam::Path, "lib.rs"),
                        (ToolParam::Diff, "------- SEARCH\nfn b() {}\n=======\nx\n+++++++ REPLACE"),
                    ],
                ),
                &mut callbacks,
            )
            .await
            .unwrap();
        assert_eq!(callbacks.mistakes, 1);
        assert!(callbacks.approvals.is_empty());
        assert!(callbacks.results[0].is_error);
        assert!(callbacks.results[0].content.contains("fn a() {}"));
        assert_eq!(callbacks.said[0].0, SayKind::DiffError);
    }

    #[tokio::test]
    async fn replace_preview_tracks_partial_script() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), "one\ntwo\nthree\n").unwrap();
        let mut partial = tool(
            ToolId::ReplaceInFile,
            &[
                (ToolParam::Path, "a.txt"),
                (ToolParam::Diff, "------- SEARCH\ntwo\n=======\nTWO"),
            ],
        );
        partial.partial = true;
        let preview = ReplaceInFileTool::new(Workspace::new(dir.path()))
            .preview(&partial)
            .await
            .unwrap()
            .unwrap();
        let edit = preview.edit.unwrap();
        assert_eq!(edit.proposed, "one\nTWO\n");
        assert_eq!(edit.original, "one\ntwo\nthree\n");
    }

    #[tokio::test]
    async fn escaping_path_is_reported_as_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut callbacks = RecordingCallbacks::approving();
        ReadFileTool::new(Workspace::new(dir.path()))
            .execute(
                &tool(ToolId::ReadFile, &[(ToolParam::Path, "../outside.txt")]),
                &mut callbacks,
            )
            .await
            .unwrap();
        assert!(callbacks.errors[0].contains("sandbox policy"));
    }
}
