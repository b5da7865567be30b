use serde_json::{json, Value};
use uuid::Uuid;

use tether_parser::clean_text_for_display;
use tether_types::{
    AskKind, ContentBlock, EntryKind, MessagePart, SayKind, ToolId, ToolParam, ToolUse,
};

use super::{Task, TaskState};
use crate::approval::{evaluate_tool, PermissionAction};
use crate::responses;

impl Task {
    /// Presents parsed blocks in order, one at a time. Re-entrant calls only
    /// flag the running pass to look again.
    pub(super) async fn present_assistant_message(&mut self) -> anyhow::Result<()> {
        if !self.reply.gate.try_enter() {
            return Ok(());
        }
        self.set_state(TaskState::Presenting);
        let result = self.presentation_pass().await;
        self.reply.gate.leave();
        if self.state == TaskState::Presenting {
            self.set_state(TaskState::Streaming);
        }
        result
    }

    async fn presentation_pass(&mut self) -> anyhow::Result<()> {
        loop {
            while let Some(block) = self.reply.blocks.get(self.reply.current_index).cloned() {
                self.ensure_active()?;
                let partial = block.is_partial();
                match block {
                    ContentBlock::Text(text) => self.present_text(&text.text, partial).await?,
                    ContentBlock::ToolUse(tool) => self.present_tool(tool).await?,
                }
                if partial {
                    break;
                }
                self.reply.current_index += 1;
            }
            if !self.reply.gate.take_pending() {
                return Ok(());
            }
        }
    }

    async fn present_text(&mut self, raw: &str, partial: bool) -> anyhow::Result<()> {
        if self.reply.did_reject_tool || self.reply.did_already_use_tool {
            return Ok(());
        }
        let content = clean_text_for_display(raw, partial);
        if content.trim().is_empty() {
            if !partial {
                self.discard_partial(EntryKind::Say(SayKind::Text));
            }
            return Ok(());
        }
        if partial {
            self.say_partial(SayKind::Text, Some(content))
        } else {
            self.say(SayKind::Text, Some(content)).await.map(|_| ())
        }
    }

    async fn present_tool(&mut self, tool: ToolUse) -> anyhow::Result<()> {
        if self.reply.did_reject_tool {
            if !tool.partial {
                self.record_skipped_tool(&tool, responses::skipped_after_rejection(tool.name));
            }
            return Ok(());
        }
        if self.reply.did_already_use_tool {
            if !tool.partial {
                self.record_skipped_tool(&tool, responses::skipped_one_tool_per_message(tool.name));
            }
            return Ok(());
        }
        if tool.partial {
            if !self.mode.allows(tool.name) {
                return Ok(());
            }
            return self.preview_tool(&tool).await;
        }
        self.dispatch_tool(tool).await
    }

    /// A tool that never runs still gets an id and a result, so every tool use
    /// in history is answered.
    fn record_skipped_tool(&mut self, tool: &ToolUse, reason: String) {
        let id = new_tool_use_id();
        self.reply.tool_uses.push(MessagePart::ToolUse {
            id: id.clone(),
            name: tool.name,
            params: tool.params.clone(),
        });
        self.reply.user_content.push(MessagePart::ToolResult {
            tool_use_id: id,
            name: tool.name,
            content: reason,
            is_error: false,
        });
    }

    async fn preview_tool(&mut self, tool: &ToolUse) -> anyhow::Result<()> {
        match tool.name {
            ToolId::AskFollowupQuestion => {
                if let Some(question) = tool.param(ToolParam::Question) {
                    let payload = followup_payload(question, tool.param(ToolParam::Options));
                    self.ask_partial(AskKind::Followup, Some(payload))?;
                }
                Ok(())
            }
            ToolId::AttemptCompletion => {
                if let Some(result) = tool.param(ToolParam::Result) {
                    self.say_partial(SayKind::CompletionResult, Some(result.to_string()))?;
                }
                Ok(())
            }
            ToolId::PlanModeRespond => {
                if let Some(response) = tool.param(ToolParam::Response) {
                    let payload = plan_payload(response, tool.param(ToolParam::Options));
                    self.ask_partial(AskKind::PlanModeRespond, Some(payload))?;
                }
                Ok(())
            }
            ToolId::SwitchMode => Ok(()),
            _ => self.preview_registry_tool(tool).await,
        }
    }

    async fn preview_registry_tool(&mut self, tool: &ToolUse) -> anyhow::Result<()> {
        let policy = evaluate_tool(&self.config.auto_approval, tool.name);
        if policy == PermissionAction::Deny || !self.mode.allows(tool.name) {
            return Ok(());
        }
        let Some(executor) = self.services.tools.get(tool.name).await else {
            return Ok(());
        };
        let ask = preview_ask_kind(tool.name);
        let message = match executor.preview(tool).await {
            Ok(Some(preview)) => {
                if let Some(edit) = preview.edit {
                    self.show_edit_preview(edit);
                }
                approval_text(ask, &preview.payload)
            }
            Ok(None) => match tool.param(ToolParam::Command) {
                Some(command) if tool.name == ToolId::ExecuteCommand => command.to_string(),
                _ => return Ok(()),
            },
            Err(err) => {
                tracing::debug!(task_id = %self.id, tool = %tool.name, error = %err, "no preview");
                return Ok(());
            }
        };
        if policy == PermissionAction::Allow {
            self.say_partial(say_kind_for(ask), Some(message))
        } else {
            self.ask_partial(ask, Some(message))
        }
    }
}

pub(super) fn new_tool_use_id() -> String {
    format!("toolu_{}", Uuid::new_v4().simple())
}

pub(super) fn followup_payload(question: &str, options: Option<&str>) -> String {
    json!({"question": question, "options": parse_options(options)}).to_string()
}

pub(super) fn plan_payload(response: &str, options: Option<&str>) -> String {
    json!({"response": response, "options": parse_options(options)}).to_string()
}

/// Options arrive as a JSON array of strings; anything else means none.
fn parse_options(options: Option<&str>) -> Vec<String> {
    options
        .and_then(|raw| serde_json::from_str(raw).ok())
        .unwrap_or_default()
}

fn preview_ask_kind(tool: ToolId) -> AskKind {
    match tool {
        ToolId::ExecuteCommand => AskKind::Command,
        ToolId::BrowserAction => AskKind::BrowserActionLaunch,
        ToolId::UseMcpTool | ToolId::AccessMcpResource => AskKind::UseMcpServer,
        ToolId::NewTask => AskKind::NewTask,
        _ => AskKind::Tool,
    }
}

/// Commands are shown as the bare command line, everything else as JSON.
pub(super) fn approval_text(ask: AskKind, payload: &Value) -> String {
    match (ask, payload) {
        (_, Value::String(text)) => text.clone(),
        (AskKind::Command, Value::Object(map)) => match map.get("command") {
            Some(Value::String(command)) => command.clone(),
            _ => payload.to_string(),
        },
        _ => payload.to_string(),
    }
}

/// The say an auto-approved ask of this kind is shown as.
pub(super) fn say_kind_for(ask: AskKind) -> SayKind {
    match ask {
        AskKind::Command => SayKind::Command,
        _ => SayKind::Tool,
    }
}
