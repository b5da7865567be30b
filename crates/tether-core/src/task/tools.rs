use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use tether_observability::{redact_text, truncate_for_log};
use tether_tools::{ApprovalRequest, EditPreview, ToolCallbacks, ToolOutput};
use tether_types::{
    AskKind, AskReply, AskResponse, EngineEvent, EntryKind, MessagePart, SayKind, ToolCategory,
    ToolId, ToolParam, ToolUse,
};

use super::present::{
    approval_text, followup_payload, new_tool_use_id, plan_payload, say_kind_for,
};
use super::{image_part, is_abort, Task};
use crate::approval::{evaluate_tool, PermissionAction};
use crate::mode::Mode;
use crate::responses;

const CHECKPOINT_TIMEOUT: Duration = Duration::from_secs(15);

impl Task {
    /// Runs one complete tool block. Whatever happens, the block leaves a
    /// result behind unless it ended the task.
    pub(super) async fn dispatch_tool(&mut self, tool: ToolUse) -> anyhow::Result<()> {
        let id = new_tool_use_id();
        self.reply.tool_uses.push(MessagePart::ToolUse {
            id: id.clone(),
            name: tool.name,
            params: tool.params.clone(),
        });
        self.reply.current_tool = Some((id, tool.name));
        self.log_tool_event(
            Level::INFO,
            "tool.dispatch",
            tool.name,
            None,
            Some(&params_for_log(&tool)),
        );

        self.run_tool(&tool).await?;
        self.clear_edit_preview();

        if !self.reply.did_already_use_tool
            && self.reply.completion.is_none()
            && !self.reply.stop_requested
        {
            self.push_tool_result(responses::no_tool_output(), false);
        }
        self.reply.did_already_use_tool = true;
        self.reply.current_tool = None;

        let changes_workspace = matches!(
            tool.name.category(),
            ToolCategory::Edit | ToolCategory::Execute
        );
        if changes_workspace && !self.reply.did_reject_tool && !self.reply.last_result_error {
            self.save_checkpoint(tool.name).await?;
        }
        Ok(())
    }

    async fn run_tool(&mut self, tool: &ToolUse) -> anyhow::Result<()> {
        if !self.mode.allows(tool.name) {
            self.consecutive_mistakes += 1;
            self.push_tool_result(responses::mode_forbids(tool.name, self.mode), true);
            return Ok(());
        }
        if let Some(param) = tool.missing_required().first().copied() {
            self.consecutive_mistakes += 1;
            self.say(
                SayKind::Error,
                Some(format!(
                    "The model tried to use {} without a value for required parameter '{param}'. Retrying...",
                    tool.name
                )),
            )
            .await?;
            self.push_tool_result(responses::missing_param(tool.name, param), true);
            return Ok(());
        }
        if evaluate_tool(&self.config.auto_approval, tool.name) == PermissionAction::Deny {
            self.push_tool_result(responses::tool_disabled(tool.name), true);
            return Ok(());
        }
        if !self.repetition.check(tool) {
            return self.stop_repeated_tool(tool).await;
        }

        self.consecutive_mistakes = 0;
        match tool.name {
            ToolId::AskFollowupQuestion => self.ask_followup_question(tool).await,
            ToolId::AttemptCompletion => self.attempt_completion(tool).await,
            ToolId::SwitchMode => self.switch_mode(tool).await,
            ToolId::PlanModeRespond => self.plan_mode_respond(tool).await,
            ToolId::ReadFile
            | ToolId::WriteToFile
            | ToolId::ReplaceInFile
            | ToolId::ExecuteCommand
            | ToolId::ListFiles
            | ToolId::SearchFiles
            | ToolId::ListCodeDefinitionNames
            | ToolId::BrowserAction
            | ToolId::UseMcpTool
            | ToolId::AccessMcpResource
            | ToolId::NewTask => self.run_executor(tool).await,
        }
    }

    async fn stop_repeated_tool(&mut self, tool: &ToolUse) -> anyhow::Result<()> {
        self.log_tool_event(Level::WARN, "tool.repeated", tool.name, Some("blocked"), None);
        let reply = self
            .ask(
                AskKind::MistakeLimitReached,
                Some(format!(
                    "The model called {} with the same parameters several times in a row.",
                    tool.name
                )),
            )
            .await?;
        self.push_tool_result(responses::repeated_tool(tool.name), true);
        if reply.response == AskResponse::No {
            self.reply.stop_requested = true;
            return Ok(());
        }
        if let Some(feedback) = reply.feedback().map(str::to_string) {
            self.say_with_images(SayKind::UserFeedback, Some(feedback.clone()), reply.images.clone())
                .await?;
            self.push_tool_result(responses::too_many_mistakes(&feedback), false);
            self.push_reply_images(&reply);
        }
        Ok(())
    }

    async fn run_executor(&mut self, tool: &ToolUse) -> anyhow::Result<()> {
        let Some(executor) = self.services.tools.get(tool.name).await else {
            self.push_tool_result(responses::tool_unavailable(tool.name), true);
            return Ok(());
        };
        let result = {
            let mut callbacks = InvocationCallbacks { task: self };
            executor.execute(tool, &mut callbacks).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(err) if is_abort(&err) => Err(err),
            Err(err) => {
                self.report_tool_error(&format!("executing {}", tool.name), err)
                    .await
            }
        }
    }

    /// Auto-approves when policy allows, otherwise raises an ask. A rejection
    /// is recorded as the tool result before this returns `false`.
    pub(super) async fn ask_tool_approval(&mut self, request: ApprovalRequest) -> anyhow::Result<bool> {
        let text = approval_text(request.ask, &request.payload);
        let say_kind = say_kind_for(request.ask);
        let policy = evaluate_tool(&self.config.auto_approval, request.tool);
        if !request.force_ask && policy == PermissionAction::Allow {
            self.discard_partial(EntryKind::Ask(request.ask));
            self.say(say_kind, Some(text)).await?;
            self.consecutive_auto_approved += 1;
            return Ok(true);
        }

        self.discard_partial(EntryKind::Say(say_kind));
        let reply = self.ask(request.ask, Some(text)).await?;
        let feedback = reply.feedback().map(str::to_string);
        if let Some(feedback) = &feedback {
            self.say_with_images(SayKind::UserFeedback, Some(feedback.clone()), reply.images.clone())
                .await?;
        }
        if reply.response == AskResponse::Yes {
            if let Some(feedback) = feedback {
                self.push_tool_result(responses::tool_approved_with_feedback(&feedback), false);
                self.push_reply_images(&reply);
            }
            return Ok(true);
        }

        let content = match feedback {
            Some(feedback) => responses::tool_denied_with_feedback(&feedback),
            None => responses::tool_denied(),
        };
        self.push_tool_result(content, false);
        self.push_reply_images(&reply);
        self.reply.did_reject_tool = true;
        self.log_tool_event(Level::INFO, "tool.rejected", request.tool, Some("denied"), None);
        Ok(false)
    }

    /// Results for the same invocation are merged into one tool result.
    pub(super) fn push_tool_result(&mut self, content: String, is_error: bool) {
        let Some((id, name)) = self.reply.current_tool.clone() else {
            self.reply.user_content.push(MessagePart::text(content));
            return;
        };
        let existing = self.reply.user_content.iter_mut().find_map(|part| match part {
            MessagePart::ToolResult {
                tool_use_id,
                content: existing,
                is_error: existing_error,
                ..
            } if *tool_use_id == id => Some((existing, existing_error)),
            _ => None,
        });
        match existing {
            Some((existing, existing_error)) => {
                existing.push_str("\n\n");
                existing.push_str(&content);
                *existing_error |= is_error;
            }
            None => self.reply.user_content.push(MessagePart::ToolResult {
                tool_use_id: id,
                name,
                content,
                is_error,
            }),
        }
        self.reply.did_already_use_tool = true;
        self.reply.last_result_error = is_error;
    }

    fn push_reply_images(&mut self, reply: &AskReply) {
        self.reply
            .user_content
            .extend(reply.images.iter().map(|image| image_part(image)));
    }

    async fn report_tool_error(&mut self, action: &str, err: anyhow::Error) -> anyhow::Result<()> {
        let message = format!("Error {action}: {err:#}");
        let detail = truncate_for_log(&message, 500);
        match self.reply.current_tool.as_ref().map(|(_, name)| *name) {
            Some(name) => self.log_tool_event(Level::WARN, "tool.error", name, Some("error"), Some(&detail)),
            None => self.log_event(Level::WARN, "tool.error", Some("error"), Some(&detail)),
        }
        self.say(SayKind::Error, Some(message.clone())).await?;
        self.push_tool_result(responses::tool_error(&message), true);
        Ok(())
    }

    async fn ask_followup_question(&mut self, tool: &ToolUse) -> anyhow::Result<()> {
        let question = tool.param(ToolParam::Question).unwrap_or_default();
        let payload = followup_payload(question, tool.param(ToolParam::Options));
        let reply = self.ask(AskKind::Followup, Some(payload)).await?;
        let answer = reply.text.clone().unwrap_or_default();
        self.say_with_images(SayKind::UserFeedback, Some(answer.clone()), reply.images.clone())
            .await?;
        self.push_tool_result(responses::followup_answer(&answer), false);
        self.push_reply_images(&reply);
        Ok(())
    }

    async fn plan_mode_respond(&mut self, tool: &ToolUse) -> anyhow::Result<()> {
        let response = tool.param(ToolParam::Response).unwrap_or_default();
        let payload = plan_payload(response, tool.param(ToolParam::Options));
        let reply = self.ask(AskKind::PlanModeRespond, Some(payload)).await?;
        match reply.feedback().map(str::to_string) {
            Some(answer) => {
                self.say_with_images(SayKind::UserFeedback, Some(answer.clone()), reply.images.clone())
                    .await?;
                self.push_tool_result(responses::plan_mode_answer(&answer), false);
                self.push_reply_images(&reply);
            }
            None => self.push_tool_result(responses::plan_mode_acknowledged(), false),
        }
        Ok(())
    }

    /// The user either accepts the result, which ends the task, or answers
    /// with feedback that becomes the tool result.
    async fn attempt_completion(&mut self, tool: &ToolUse) -> anyhow::Result<()> {
        let result = tool.param(ToolParam::Result).unwrap_or_default().to_string();
        self.say(SayKind::CompletionResult, Some(result.clone())).await?;
        let reply = self.ask(AskKind::CompletionResult, None).await?;
        match reply.feedback().map(str::to_string) {
            Some(feedback) if reply.response != AskResponse::Yes => {
                self.say_with_images(SayKind::UserFeedback, Some(feedback.clone()), reply.images.clone())
                    .await?;
                self.push_tool_result(responses::completion_feedback(&feedback), false);
                self.push_reply_images(&reply);
            }
            _ => self.reply.completion = Some(result),
        }
        Ok(())
    }

    async fn switch_mode(&mut self, tool: &ToolUse) -> anyhow::Result<()> {
        let requested = tool.param(ToolParam::Mode).unwrap_or_default();
        let target: Mode = match requested.parse() {
            Ok(mode) => mode,
            Err(err) => {
                self.consecutive_mistakes += 1;
                self.push_tool_result(responses::tool_error(&err), true);
                return Ok(());
            }
        };
        if target == self.mode {
            self.push_tool_result(format!("Already in {target} mode."), false);
            return Ok(());
        }
        let reason = tool.param(ToolParam::Reason);
        let request = ApprovalRequest::tool(
            ToolId::SwitchMode,
            json!({"tool": "switchMode", "mode": target.as_str(), "reason": reason}),
        );
        if !self.ask_tool_approval(request).await? {
            return Ok(());
        }
        let from = self.mode;
        self.mode = target;
        self.say(SayKind::Info, Some(format!("Switched from {from} mode to {target} mode.")))
            .await?;
        self.push_tool_result(responses::mode_switched(from, target, reason), false);
        self.log_event(Level::INFO, "task.mode", Some(target.as_str()), None);
        Ok(())
    }

    async fn save_checkpoint(&mut self, tool: ToolId) -> anyhow::Result<()> {
        let Some(checkpoints) = self.services.checkpoints.clone() else {
            return Ok(());
        };
        let saved = tokio::time::timeout(
            CHECKPOINT_TIMEOUT,
            checkpoints.save_checkpoint(&self.id, tool.as_str()),
        )
        .await;
        match saved {
            Ok(Ok(checkpoint)) => {
                self.say(SayKind::CheckpointCreated, Some(checkpoint)).await?;
            }
            Ok(Err(err)) => {
                tracing::warn!(task_id = %self.id, %tool, error = %err, "checkpoint failed");
            }
            Err(_) => {
                tracing::warn!(task_id = %self.id, %tool, "checkpoint timed out");
            }
        }
        Ok(())
    }

    pub(super) fn show_edit_preview(&mut self, edit: EditPreview) {
        if self.edit_preview.as_ref() == Some(&edit) {
            return;
        }
        self.services.events.publish(EngineEvent::new(
            "preview.updated",
            json!({"taskID": self.id, "path": edit.path, "proposed": edit.proposed}),
        ));
        self.edit_preview = Some(edit);
    }

    /// The edit was applied or rejected through the tool; the preview is done.
    pub(super) fn clear_edit_preview(&mut self) {
        if let Some(edit) = self.edit_preview.take() {
            self.services.events.publish(EngineEvent::new(
                "preview.closed",
                json!({"taskID": self.id, "path": edit.path}),
            ));
        }
    }

    /// Hosts restore the file view to `original`. Nothing was written yet.
    pub(super) fn revert_edit_preview(&mut self) {
        if let Some(edit) = self.edit_preview.take() {
            self.services.events.publish(EngineEvent::new(
                "preview.reverted",
                json!({"taskID": self.id, "path": edit.path, "original": edit.original}),
            ));
        }
    }
}

/// Parameter summary for `tool.dispatch`. Values that carry file contents,
/// commands or free text are redacted.
fn params_for_log(tool: &ToolUse) -> String {
    tool.params
        .iter()
        .map(|(param, value)| {
            let value = match param {
                ToolParam::Content
                | ToolParam::Diff
                | ToolParam::Command
                | ToolParam::Arguments
                | ToolParam::Text
                | ToolParam::Response
                | ToolParam::Result => redact_text(value),
                _ => truncate_for_log(value, 200),
            };
            format!("{param}={value}")
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Routes an executor's reports into the running task.
struct InvocationCallbacks<'a> {
    task: &'a mut Task,
}

#[async_trait]
impl<'a> ToolCallbacks for InvocationCallbacks<'a> {
    async fn ask_approval(&mut self, request: ApprovalRequest) -> anyhow::Result<bool> {
        self.task.ask_tool_approval(request).await
    }

    fn push_result(&mut self, output: ToolOutput) {
        self.task.push_tool_result(output.content, output.is_error);
    }

    async fn handle_error(&mut self, action: &str, error: anyhow::Error) -> anyhow::Result<()> {
        if is_abort(&error) {
            return Err(error);
        }
        self.task.report_tool_error(action, error).await
    }

    async fn say(&mut self, kind: SayKind, text: &str) -> anyhow::Result<()> {
        self.task.say(kind, Some(text.to_string())).await.map(|_| ())
    }

    fn record_mistake(&mut self) {
        self.task.consecutive_mistakes += 1;
    }

    fn cancel_token(&self) -> CancellationToken {
        self.task.cancel.clone()
    }
}
