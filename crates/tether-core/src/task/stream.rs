use std::time::Duration;

use futures::StreamExt;
use serde_json::json;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::Level;

use tether_observability::{truncate_for_log, ObservabilityEvent};
use tether_providers::{ProviderStream, StreamChunk};
use tether_types::{
    AskKind, AskResponse, CancelReason, Message, MessagePart, MessageRole, SayKind,
};

use super::state::ReplyState;
use super::transcript::next_chunk;
use super::{is_abort, Task, TaskError, TaskOutcome, TaskState, Turn};
use crate::context_window::apply_deleted_range;
use crate::responses;

type OpenedStream = (ProviderStream, Option<StreamChunk>);

impl Task {
    /// Opens the model stream and waits for its first chunk. Failures before
    /// the first chunk are retried with backoff, then put to the user.
    pub(super) async fn open_stream_with_retry(&mut self) -> anyhow::Result<Option<OpenedStream>> {
        let mut attempt: u32 = 0;
        loop {
            self.ensure_active()?;
            self.log_event(Level::INFO, "provider.call.start", None, None);
            let error = match self.open_stream().await {
                Ok(opened) => return Ok(Some(opened)),
                Err(err) if is_abort(&err) => return Err(err),
                Err(err) => format!("{err:#}"),
            };
            self.emit(
                Level::WARN,
                ObservabilityEvent {
                    event: "provider.call.error",
                    status: Some("failed"),
                    error_code: Some("provider_open_failed"),
                    detail: Some(&truncate_for_log(&error, 500)),
                    ..Default::default()
                },
            );

            if attempt < self.config.retry.auto_retry_attempts {
                attempt += 1;
                let delay_ms = self.config.retry.delay_ms(attempt);
                self.say(
                    SayKind::ApiReqRetried,
                    Some(json!({"attempt": attempt, "delayMs": delay_ms, "error": error}).to_string()),
                )
                .await?;
                let cancel = self.cancel.clone();
                tokio::select! {
                    _ = cancel.cancelled() => return Err(TaskError::Aborted.into()),
                    _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
                }
                continue;
            }

            let reply = self.ask(AskKind::ApiReqFailed, Some(error)).await?;
            if reply.response != AskResponse::Yes {
                return Ok(None);
            }
            attempt = 0;
            self.say(SayKind::ApiReqRetried, None).await?;
        }
    }

    async fn open_stream(&self) -> anyhow::Result<OpenedStream> {
        let messages = apply_deleted_range(&self.history, self.deleted_range);
        let mut stream = self
            .services
            .provider
            .stream(&self.services.system_prompt, messages, self.cancel.child_token())
            .await?;
        let cancel = self.cancel.clone();
        let first = tokio::select! {
            _ = cancel.cancelled() => return Err(TaskError::Aborted.into()),
            first = stream.next() => first,
        };
        Ok((stream, first.transpose()?))
    }

    /// Hands the stream to a reader task and resets per-reply state.
    pub(super) fn begin_reply(
        &mut self,
        stream: ProviderStream,
        first: Option<StreamChunk>,
        request_ts: i64,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        if let Some(first) = first {
            let _ = tx.send(Ok(first));
        }
        let reader_cancel = self.cancel.child_token();
        tokio::spawn(forward_stream(stream, tx, reader_cancel.clone()));

        self.reply = ReplyState::new(self.config.parser.limits());
        self.reply.rx = Some(rx);
        self.reply.reader_cancel = reader_cancel;
        self.reply.active = true;
        self.reply.request_ts = Some(request_ts);
        self.set_state(TaskState::Streaming);
    }

    pub(super) async fn consume_reply(&mut self) -> anyhow::Result<()> {
        let cancel = self.cancel.clone();
        while self.reply.rx.is_some() {
            let chunk = tokio::select! {
                _ = cancel.cancelled() => return Err(TaskError::Aborted.into()),
                chunk = next_chunk(&mut self.reply.rx) => chunk,
            };
            self.ingest_chunk(chunk);
            if self.reply.stream_error.is_some() || self.reply.parse_error.is_some() {
                break;
            }
            self.show_reasoning()?;
            self.present_assistant_message().await?;
            if self.reply.did_reject_tool {
                self.reply.interrupted = true;
                self.reply.stop_reading();
            } else if self.reply.stop_requested {
                self.reply.stop_reading();
            }
        }
        Ok(())
    }

    pub(super) fn ingest_chunk(&mut self, chunk: Option<anyhow::Result<StreamChunk>>) {
        match chunk {
            None => self.reply.rx = None,
            Some(Ok(StreamChunk::TextDelta(delta))) => {
                if let Err(err) = self.reply.parser.push(&delta) {
                    self.reply.parse_error = Some(err.to_string());
                    self.reply.stop_reading();
                    return;
                }
                self.log_parser_diagnostics();
                let blocks = self.reply.parser.blocks();
                if blocks != self.reply.blocks {
                    self.reply.blocks = blocks;
                    self.reply.gate.mark_pending();
                }
            }
            Some(Ok(StreamChunk::ReasoningDelta(delta))) => self.reply.reasoning.push_str(&delta),
            Some(Ok(StreamChunk::Usage(usage))) => {
                self.reply.usage.accumulate(&usage);
                self.reply.saw_usage = true;
            }
            Some(Ok(StreamChunk::Done { finish_reason })) => {
                tracing::debug!(task_id = %self.id, %finish_reason, "model stream finished");
            }
            Some(Err(err)) => {
                self.reply.stream_error = Some(format!("{err:#}"));
                self.reply.stop_reading();
            }
        }
    }

    fn log_parser_diagnostics(&mut self) {
        let diagnostics = self.reply.parser.diagnostics();
        for diagnostic in diagnostics.iter().skip(self.reply.diagnostics_logged) {
            tracing::warn!(task_id = %self.id, error = %diagnostic, "parser dropped oversized content");
        }
        self.reply.diagnostics_logged = diagnostics.len();
    }

    fn show_reasoning(&mut self) -> anyhow::Result<()> {
        if self.reply.reasoning.len() > self.reply.reasoning_shown {
            self.reply.reasoning_shown = self.reply.reasoning.len();
            let reasoning = self.reply.reasoning.clone();
            self.say_partial(SayKind::Reasoning, Some(reasoning))?;
        }
        Ok(())
    }

    /// Completes whatever is still partial, flushes presentation and records
    /// the assistant message.
    pub(super) async fn finish_reply(&mut self) -> anyhow::Result<Turn> {
        self.reply.stop_reading();
        self.reply.blocks = self.reply.parser.finish();
        self.present_assistant_message().await?;
        self.finalize_partial_entry();
        self.record_reply_usage();

        let mut text = self.reply.parser.text().to_string();
        if self.reply.interrupted {
            text.push_str("\n\n");
            text.push_str(responses::response_interrupted_by_rejection());
        }
        let tool_uses = std::mem::take(&mut self.reply.tool_uses);
        let used_tool = !tool_uses.is_empty();
        self.reply.active = false;

        if text.trim().is_empty() && !used_tool {
            self.say(
                SayKind::Error,
                Some("The model returned an empty response. Retrying with a reminder to use a tool.".to_string()),
            )
            .await?;
            self.history
                .push(Message::assistant_text("Failure: I did not provide a response."));
            self.consecutive_mistakes += 1;
            self.persist().await?;
            return Ok(Turn::Continue(vec![MessagePart::text(responses::no_tools_used())]));
        }

        let mut parts = vec![MessagePart::text(text)];
        parts.extend(tool_uses);
        self.history.push(Message::new(MessageRole::Assistant, parts));
        self.persist().await?;

        if let Some(result) = self.reply.completion.take() {
            return Ok(Turn::Finished(TaskOutcome::Completed { result }));
        }
        if self.reply.stop_requested {
            return Ok(Turn::Finished(TaskOutcome::Stopped));
        }
        let mut next = std::mem::take(&mut self.reply.user_content);
        if !used_tool {
            next.push(MessagePart::text(responses::no_tools_used()));
            self.consecutive_mistakes += 1;
        }
        Ok(Turn::Continue(next))
    }

    /// The reply outgrew the parser buffer. What was parsed so far is kept,
    /// the model is told to answer in smaller pieces, and the loop goes on.
    pub(super) async fn drop_oversized_reply(&mut self, message: String) -> anyhow::Result<Turn> {
        self.emit(
            Level::WARN,
            ObservabilityEvent {
                event: "parser.overflow",
                status: Some("dropped"),
                error_code: Some("buffer_overflow"),
                detail: Some(&truncate_for_log(&message, 500)),
                ..Default::default()
            },
        );
        self.reply.stop_reading();
        self.finalize_partial_entry();
        self.revert_edit_preview();
        self.record_reply_usage();
        self.say(
            SayKind::Error,
            Some(format!("The model's response was too large and was cut off: {message}")),
        )
        .await?;

        let mut text = self.reply.parser.text().to_string();
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(responses::response_interrupted_by_size());
        let mut parts = vec![MessagePart::text(text)];
        parts.append(&mut self.reply.tool_uses);
        self.history.push(Message::new(MessageRole::Assistant, parts));
        self.reply.active = false;
        self.persist().await?;

        if let Some(result) = self.reply.completion.take() {
            return Ok(Turn::Finished(TaskOutcome::Completed { result }));
        }
        if self.reply.stop_requested {
            return Ok(Turn::Finished(TaskOutcome::Stopped));
        }
        self.consecutive_mistakes += 1;
        let mut next = std::mem::take(&mut self.reply.user_content);
        next.push(MessagePart::text(responses::response_too_large(&message)));
        Ok(Turn::Continue(next))
    }

    fn record_reply_usage(&mut self) {
        let usage = self.reply.usage;
        if let Some(ts) = self.reply.request_ts {
            let pricing = self.services.provider.model().pricing;
            self.update_api_request(ts, |info| info.record_usage(&usage, &pricing));
        }
        if self.reply.saw_usage {
            self.last_usage = Some(usage);
        }
    }

    /// The stream broke after it started: keep what arrived, record the
    /// failure on the request, and end the task as resumable.
    pub(super) async fn fail_reply(&mut self, message: String) -> anyhow::Result<TaskOutcome> {
        self.emit(
            Level::ERROR,
            ObservabilityEvent {
                event: "provider.stream.failed",
                status: Some("failed"),
                error_code: Some("stream_failed"),
                detail: Some(&truncate_for_log(&message, 500)),
                ..Default::default()
            },
        );
        self.reply.stop_reading();
        self.finalize_partial_entry();
        let usage = self.reply.usage;
        let saw_usage = self.reply.saw_usage;
        if let Some(ts) = self.reply.request_ts {
            let pricing = self.services.provider.model().pricing;
            let failure = message.clone();
            self.update_api_request(ts, |info| {
                if saw_usage {
                    info.record_usage(&usage, &pricing);
                }
                info.cancel_reason = Some(CancelReason::StreamingFailed);
                info.streaming_failed_message = Some(failure);
            });
        }
        self.revert_edit_preview();
        self.save_interrupted_reply(responses::response_interrupted_by_api_error());
        self.say(SayKind::Error, Some(message.clone())).await?;
        Ok(TaskOutcome::Failed { message })
    }

    /// Records a reply cut short: the text so far plus its tool uses, and the
    /// results gathered before the interruption.
    pub(super) fn save_interrupted_reply(&mut self, marker: &str) {
        if !self.reply.active {
            return;
        }
        self.reply.active = false;
        let mut text = self.reply.parser.text().to_string();
        if !text.is_empty() {
            text.push_str("\n\n");
        }
        text.push_str(marker);
        let mut parts = vec![MessagePart::text(text)];
        parts.append(&mut self.reply.tool_uses);
        self.history.push(Message::new(MessageRole::Assistant, parts));
        if !self.reply.user_content.is_empty() {
            let results = std::mem::take(&mut self.reply.user_content);
            self.history.push(Message::new(MessageRole::User, results));
        }
    }
}

async fn forward_stream(
    mut stream: ProviderStream,
    tx: mpsc::UnboundedSender<anyhow::Result<StreamChunk>>,
    cancel: CancellationToken,
) {
    loop {
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            next = stream.next() => next,
        };
        let Some(item) = next else {
            break;
        };
        let failed = item.is_err();
        if tx.send(item).is_err() || failed {
            break;
        }
    }
}
