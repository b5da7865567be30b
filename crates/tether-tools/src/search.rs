use async_trait::async_trait;
use ignore::WalkBuilder;
use regex::Regex;
use serde_json::json;
use tokio::fs;

use tether_types::{ToolId, ToolParam, ToolUse};

use crate::{required_param, ApprovalRequest, ToolCallbacks, ToolExecutor, ToolOutput, Workspace};

const MAX_LISTED: usize = 200;
const MAX_MATCHES: usize = 300;

pub struct ListFilesTool {
    workspace: Workspace,
}

impl ListFilesTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl ToolExecutor for ListFilesTool {
    fn id(&self) -> ToolId {
        ToolId::ListFiles
    }

    async fn execute(
        &self,
        tool: &ToolUse,
        callbacks: &mut dyn ToolCallbacks,
    ) -> anyhow::Result<()> {
        let path = required_param(tool, ToolParam::Path)?;
        let recursive = tool
            .param(ToolParam::Recursive)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        let label = if recursive {
            "listFilesRecursive"
        } else {
            "listFilesTopLevel"
        };
        if !callbacks
            .ask_approval(ApprovalRequest::tool(
                self.id(),
                json!({"tool": label, "path": path}),
            ))
            .await?
        {
            return Ok(());
        }
        let root = match self.workspace.resolve(path) {
            Ok(root) => root,
            Err(err) => return callbacks.handle_error("listing files", err).await,
        };

        let mut walker = WalkBuilder::new(&root);
        if !recursive {
            walker.max_depth(Some(1));
        }
        let mut entries = Vec::new();
        let mut truncated = false;
        for entry in walker.build().flatten() {
            if entry.depth() == 0 {
                continue;
            }
            let Ok(relative) = entry.path().strip_prefix(&root) else {
                continue;
            };
            let mut line = relative.display().to_string();
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                line.push('/');
            }
            entries.push(line);
            if entries.len() >= MAX_LISTED {
                truncated = true;
                break;
            }
        }
        entries.sort();

        let mut output = if entries.is_empty() {
            "No files found.".to_string()
        } else {
            entries.join("\n")
        };
        if truncated {
            output.push_str(&format!(
                "\n\n(File list truncated at {MAX_LISTED} entries. Narrow the path to see more.)"
            ));
        }
        callbacks.push_result(ToolOutput::text(output));
        Ok(())
    }
}

pub struct SearchFilesTool {
    workspace: Workspace,
}

impl SearchFilesTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }
}

#[async_trait]
impl ToolExecutor for SearchFilesTool {
    fn id(&self) -> ToolId {
        ToolId::SearchFiles
    }

    async fn execute(
        &self,
        tool: &ToolUse,
        callbacks: &mut dyn ToolCallbacks,
    ) -> anyhow::Result<()> {
        let path = required_param(tool, ToolParam::Path)?;
        let pattern = required_param(tool, ToolParam::Regex)?;
        let file_pattern = tool.param(ToolParam::FilePattern).filter(|p| !p.is_empty());
        if !callbacks
            .ask_approval(ApprovalRequest::tool(
                self.id(),
                json!({"tool": "searchFiles", "path": path, "regex": pattern, "filePattern": file_pattern}),
            ))
            .await?
        {
            return Ok(());
        }

        let regex = match Regex::new(pattern) {
            Ok(regex) => regex,
            Err(err) => return callbacks.handle_error("searching files", err.into()).await,
        };
        let glob = match file_pattern.map(glob::Pattern::new).transpose() {
            Ok(glob) => glob,
            Err(err) => return callbacks.handle_error("searching files", err.into()).await,
        };
        let root = match self.workspace.resolve(path) {
            Ok(root) => root,
            Err(err) => return callbacks.handle_error("searching files", err).await,
        };

        let mut matches = Vec::new();
        'files: for entry in WalkBuilder::new(&root).build().flatten() {
            if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                continue;
            }
            let file_path = entry.path();
            if let Some(glob) = &glob {
                let name = file_path.file_name().and_then(|n| n.to_str()).unwrap_or("");
                if !glob.matches(name) {
                    continue;
                }
            }
            let Ok(content) = fs::read_to_string(file_path).await else {
                continue;
            };
            let relative = file_path.strip_prefix(self.workspace.root()).unwrap_or(file_path);
            for (idx, line) in content.lines().enumerate() {
                if regex.is_match(line) {
                    matches.push(format!("{}:{}:{}", relative.display(), idx + 1, line.trim()));
                    if matches.len() >= MAX_MATCHES {
                        break 'files;
                    }
                }
            }
        }

        let output = if matches.is_empty() {
            "Found 0 results.".to_string()
        } else {
            format!("Found {} results.\n\n{}", matches.len(), matches.join("\n"))
        };
        callbacks.push_result(ToolOutput::text(output));
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

    fn seed() -> tempfile::TempDir {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join("src/nested")).unwrap();
        std::fs::write(dir.path().join("src/main.rs"), "fn main() {\n    run();\n}\n").unwrap();
        std::fs::write(dir.path().join("src/nested/util.rs"), "pub fn run() {}\n").unwrap();
        std::fs::write(dir.path().join("README.md"), "run the thing\n").unwrap();
        dir
    }

    #[tokio::test]
    async fn top_level_listing_does_not_recurse() {
        let dir = seed();
        let mut callbacks = RecordingCallbacks::approving();
        ListFilesTool::new(Workspace::new(dir.path()))
            .execute(&tool(ToolId::ListFiles, &[(ToolParam::Path, "src")]), &mut callbacks)
            .await
            .unwrap();
        assert_eq!(callbacks.results[0].content, "main.rs\nnested/");
    }

    #[tokio::test]
    async fn recursive_listing_includes_nested_files() {
        let dir = seed();
        let mut callbacks = RecordingCallbacks::approving();
        ListFilesTool::new(Workspace::new(dir.path()))
            .execute(
                &tool(
                    ToolId::ListFiles,
                    &[(ToolParam::Path, "src"), (ToolParam::Recursive, "true")],
                ),
                &mut callbacks,
            )
            .await
            .unwrap();
        assert!(callbacks.results[0].content.contains("nested/util.rs"));
        assert_eq!(callbacks.approvals[0].payload["tool"], "listFilesRecursive");
    }

    #[tokio::test]
    async fn search_honors_file_pattern() {
        let dir = seed();
        let mut callbacks = RecordingCallbacks::approving();
        SearchFilesTool::new(Workspace::new(dir.path()))
            .execute(
                &tool(
                    ToolId::SearchFiles,
                    &[
                        (ToolParam::Path, "."),
                        (ToolParam::Regex, r"\brun\b"),
                        (ToolParam::FilePattern, "*.rs"),
                    ],
                ),
                &mut callbacks,
            )
            .await
            .unwrap();
        let content = &callbacks.results[0].content;
        assert!(content.starts_with("Found 2 results."));
        assert!(!content.contains("README.md"));
    }

    #[tokio::test]
    async fn invalid_regex_is_reported() {
        let dir = seed();
        let mut callbacks = RecordingCallbacks::approving();
        SearchFilesTool::new(Workspace::new(dir.path()))
            .execute(
                &tool(ToolId::SearchFiles, &[(ToolParam::Path, "."), (ToolParam::Regex, "(")]),
                &mut callbacks,
            )
            .await
            .unwrap();
        assert!(callbacks.results[0].is_error);
    }
}
