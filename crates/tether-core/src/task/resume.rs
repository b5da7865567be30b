use std::collections::HashSet;

use chrono::Utc;
use tracing::Level;

use tether_types::{
    AskKind, AskResponse, CancelReason, MessagePart, MessageRole, SayKind,
};

use super::{image_part, Task, TaskOutcome, TaskServices, TaskState};
use crate::config::EngineConfig;
use crate::responses;

impl Task {
    /// Loads a stored task. Nothing runs until [`Task::resume_run`].
    pub async fn resume(
        services: TaskServices,
        config: EngineConfig,
        task_id: &str,
    ) -> anyhow::Result<Self> {
        let snapshot = services
            .store
            .load(task_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("task `{task_id}` not found"))?;
        let mut task = Self::with_id(services, config, snapshot.task_id).await;
        task.last_ts = snapshot.transcript.last().map(|entry| entry.ts).unwrap_or(0);
        task.history = snapshot.history;
        task.transcript = snapshot.transcript;
        task.deleted_range = snapshot.deleted_range;
        task.mode = snapshot.mode;
        Ok(task)
    }

    /// Asks whether to continue, repairs the history and re-enters the loop.
    pub async fn resume_run(&mut self) -> anyhow::Result<TaskOutcome> {
        self.log_event(Level::INFO, "task.resume", None, None);
        match self.prepare_resume().await {
            Ok(Some(content)) => self.run_loop(content).await,
            Ok(None) => self.settle(TaskOutcome::Stopped).await,
            Err(err) => self.settle_error(err).await,
        }
    }

    async fn prepare_resume(&mut self) -> anyhow::Result<Option<Vec<MessagePart>>> {
        while self.transcript.last().is_some_and(|entry| {
            entry.is_ask(AskKind::ResumeTask) || entry.is_ask(AskKind::ResumeCompletedTask)
        }) {
            self.transcript.pop();
        }
        self.finalize_partial_entry();

        let last_activity = self.transcript.last().map(|entry| entry.ts);
        let was_completed = self
            .transcript
            .last()
            .is_some_and(|entry| entry.is_ask(AskKind::CompletionResult));
        let ask = if was_completed {
            AskKind::ResumeCompletedTask
        } else {
            AskKind::ResumeTask
        };
        let reply = self.ask(ask, None).await?;
        if reply.response == AskResponse::No {
            return Ok(None);
        }
        let feedback = reply.feedback().map(str::to_string);
        if let Some(feedback) = &feedback {
            self.say_with_images(SayKind::UserFeedback, Some(feedback.clone()), reply.images.clone())
                .await?;
        }

        let mut content = self.take_resume_content();
        let elapsed = last_activity
            .map(|ts| Utc::now().timestamp_millis() - ts)
            .unwrap_or(0);
        content.push(MessagePart::text(responses::task_resumption(
            &responses::format_elapsed(elapsed),
            self.mode,
            was_completed,
        )));
        if let Some(feedback) = feedback {
            content.push(MessagePart::text(responses::new_instructions(&feedback)));
            content.extend(reply.images.iter().map(|image| image_part(image)));
        }
        Ok(Some(content))
    }

    /// Pulls a trailing user message back out of history so it is re-sent
    /// with the resumption note, and answers every tool use the last
    /// assistant message left open. Tool results lead the content.
    fn take_resume_content(&mut self) -> Vec<MessagePart> {
        let mut pending = Vec::new();
        if self
            .history
            .last()
            .is_some_and(|message| message.role == MessageRole::User)
        {
            if let Some(message) = self.history.pop() {
                pending = message.parts;
            }
        }

        let (mut results, rest): (Vec<_>, Vec<_>) = pending
            .into_iter()
            .partition(|part| matches!(part, MessagePart::ToolResult { .. }));
        let answered: HashSet<String> = results
            .iter()
            .filter_map(|part| match part {
                MessagePart::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
            .collect();

        if let Some(assistant) = self
            .history
            .last()
            .filter(|message| message.role == MessageRole::Assistant)
        {
            for (id, name) in assistant.tool_use_ids() {
                if !answered.contains(&id) {
                    results.push(MessagePart::ToolResult {
                        tool_use_id: id,
                        name,
                        content: responses::interrupted_tool_result(),
                        is_error: false,
                    });
                }
            }
        }
        results.extend(rest);
        results
    }

    /// Leaves the task in a resumable state after an abort: partial output is
    /// kept, the open request is marked cancelled and everything is persisted.
    pub(super) async fn abort_cleanup(&mut self) -> anyhow::Result<()> {
        self.set_state(TaskState::Aborted);
        self.reply.stop_reading();
        self.revert_edit_preview();
        self.finalize_partial_entry();

        if self.reply.active {
            if let Some(ts) = self.reply.request_ts {
                let usage = self.reply.usage;
                let saw_usage = self.reply.saw_usage;
                let pricing = self.services.provider.model().pricing;
                self.update_api_request(ts, |info| {
                    if info.cost.is_none() {
                        if saw_usage {
                            info.record_usage(&usage, &pricing);
                        }
                        info.cancel_reason = Some(CancelReason::UserCancelled);
                    }
                });
            }
        }
        self.save_interrupted_reply(responses::response_interrupted_by_user());
        self.services.host.forget_task(&self.id).await;
        self.log_event(Level::INFO, "task.aborted", Some("aborted"), None);
        self.persist().await
    }
}
