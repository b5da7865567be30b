use serde_json::json;
use tracing::Level;

use tether_types::{EngineEvent, Message, SayKind};

use super::{is_abort, Task};
use crate::context_window::{
    apply_deleted_range, assemble_condensed, condense_split, next_truncation_range, ContextBudget,
};

const CONDENSE_PROMPT: &str = "You summarize coding sessions so work can continue with less context. \
Write a concise summary of the conversation so far: the user's requests, decisions made, files \
read or changed, commands run and their outcomes, and what remains to be done. Reply with the \
summary only.";

impl Task {
    /// Shrinks what the model sees when the previous request came close to
    /// the context window. Condensation is tried first when enabled.
    pub(super) async fn manage_context_window(&mut self) -> anyhow::Result<()> {
        let total = match self.last_usage {
            Some(usage) => usage.total(),
            None => {
                let visible = apply_deleted_range(&self.history, self.deleted_range);
                self.services.token_counter.count_messages(&visible) as u64
            }
        };
        let budget = ContextBudget::for_model(&self.config.context, &self.services.provider.model());
        let Some(keep) = budget.decide(total) else {
            return Ok(());
        };
        tracing::info!(
            task_id = %self.id,
            total,
            threshold = budget.threshold,
            ?keep,
            "context window nearly full"
        );

        if self.config.context.condense_enabled {
            match self.condense().await {
                Ok(true) => return Ok(()),
                Ok(false) => {}
                Err(err) if is_abort(&err) => return Err(err),
                Err(err) => {
                    tracing::warn!(task_id = %self.id, error = %format!("{err:#}"), "condensing failed, truncating instead");
                }
            }
        }

        let Some(range) = next_truncation_range(self.history.len(), self.deleted_range, keep) else {
            return Ok(());
        };
        self.deleted_range = Some(range);
        self.last_usage = None;
        self.say(
            SayKind::DeletedApiReqs,
            Some(json!({"start": range.start, "end": range.end, "total": total}).to_string()),
        )
        .await?;
        self.services.events.publish(EngineEvent::new(
            "context.truncated",
            json!({"taskID": self.id, "start": range.start, "end": range.end}),
        ));
        self.log_event(
            Level::INFO,
            "context.truncated",
            None,
            Some(&format!("hid messages {}..={}", range.start, range.end)),
        );
        self.persist().await
    }

    /// Replaces the middle of the visible conversation with a model-written
    /// summary. `Ok(false)` when there is too little history to summarize.
    async fn condense(&mut self) -> anyhow::Result<bool> {
        let visible = apply_deleted_range(&self.history, self.deleted_range);
        let Some(tail_start) = condense_split(&visible, self.config.context.keep_recent_exchanges)
        else {
            return Ok(false);
        };

        let mut request = visible[..tail_start].to_vec();
        request.push(Message::user_text(
            "Summarize the conversation above so the task can continue from the summary.",
        ));
        let summary = self
            .services
            .provider
            .complete(CONDENSE_PROMPT, request, self.cancel.child_token())
            .await?;
        if summary.trim().is_empty() {
            anyhow::bail!("provider returned an empty summary");
        }

        let before = visible.len();
        self.history = assemble_condensed(&visible, tail_start, &summary);
        self.deleted_range = None;
        self.last_usage = None;
        self.say(SayKind::CondenseContext, Some(summary.trim().to_string()))
            .await?;
        self.log_event(
            Level::INFO,
            "context.condensed",
            None,
            Some(&format!("{before} messages condensed to {}", self.history.len())),
        );
        self.persist().await?;
        Ok(true)
    }
}
