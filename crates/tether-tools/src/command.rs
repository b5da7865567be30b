use std::process::Stdio;

use async_trait::async_trait;
use serde_json::json;
use tokio::process::Command;

use tether_types::{AskKind, ToolId, ToolParam, ToolUse};

use crate::{required_param, ApprovalRequest, ToolCallbacks, ToolExecutor, ToolOutput, Workspace};

const MAX_OUTPUT_CHARS: usize = 50_000;

pub struct ExecuteCommandTool {
    workspace: Workspace,
}

impl ExecuteCommandTool {
    pub fn new(workspace: Workspace) -> Self {
        Self { workspace }
    }

    fn shell_command(&self, command_line: &str) -> Command {
        let mut command = if cfg!(windows) {
            let mut c = Command::new("powershell");
            c.args(["-NoProfile", "-Command", command_line]);
            c
        } else {
            let mut c = Command::new("sh");
            c.args(["-c", command_line]);
            c
        };
        command.current_dir(self.workspace.root()).kill_on_drop(true);
        command
    }
}

fn clip(output: &str) -> String {
    match output.char_indices().nth(MAX_OUTPUT_CHARS) {
        Some((idx, _)) => format!("{}\n[output truncated]", &output[..idx]),
        None => output.to_string(),
    }
}

#[async_trait]
impl ToolExecutor for ExecuteCommandTool {
    fn id(&self) -> ToolId {
        ToolId::ExecuteCommand
    }

    async fn execute(
        &self,
        tool: &ToolUse,
        callbacks: &mut dyn ToolCallbacks,
    ) -> anyhow::Result<()> {
        let command_line = required_param(tool, ToolParam::Command)?;
        let requires_approval = tool
            .param(ToolParam::RequiresApproval)
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("true"));
        let request = ApprovalRequest {
            ask: AskKind::Command,
            tool: self.id(),
            payload: json!({"command": command_line}),
            force_ask: requires_approval,
        };
        if !callbacks.ask_approval(request).await? {
            return Ok(());
        }

        let cancel = callbacks.cancel_token();
        let mut command = self.shell_command(command_line);
        command.stdout(Stdio::piped()).stderr(Stdio::piped());
        let child = match command.spawn() {
            Ok(child) => child,
            Err(err) => return callbacks.handle_error("executing command", err.into()).await,
        };
        // Dropping the wait future kills the child.
        let output = tokio::select! {
            _ = cancel.cancelled() => {
                callbacks.push_result(ToolOutput::error("Command was cancelled before it finished."));
                return Ok(());
            }
            result = child.wait_with_output() => result,
        };
        let output = match output {
            Ok(output) => output,
            Err(err) => {
                return callbacks
                    .handle_error("executing command", anyhow::anyhow!(err))
                    .await
            }
        };

        let mut combined = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr);
        if !stderr.trim().is_empty() {
            if !combined.is_empty() && !combined.ends_with('\n') {
                combined.push('\n');
            }
            combined.push_str(&stderr);
        }
        let code = output
            .status
            .code()
            .map(|c| c.to_string())
            .unwrap_or_else(|| "signal".to_string());
        let text = format!(
            "Command executed (exit code {code}).\nOutput:\n{}",
            clip(combined.trim_end())
        );
        if output.status.success() {
            callbacks.push_result(ToolOutput::text(text));
        } else {
            callbacks.push_result(ToolOutput::error(text));
        }
        Ok(())
    }
}
