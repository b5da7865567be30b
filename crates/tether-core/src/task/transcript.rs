use anyhow::Context;
use chrono::Utc;
use serde_json::json;

use tether_types::{
    ApiRequestInfo, AskKind, AskReply, EngineEvent, EntryKind, SayKind, TranscriptEntry,
};

use super::state::ChunkReceiver;
use super::{Task, TaskError, TaskState};
use crate::approval::PendingAsk;
use crate::storage::TaskSnapshot;

impl Task {
    /// Strictly increasing millisecond timestamps, so `ts` identifies an
    /// entry even when two are created in the same millisecond.
    fn next_ts(&mut self) -> i64 {
        let ts = Utc::now().timestamp_millis().max(self.last_ts + 1);
        self.last_ts = ts;
        ts
    }

    /// Only the newest entry may still be partial.
    fn append_entry(
        &mut self,
        kind: EntryKind,
        text: Option<String>,
        images: Vec<String>,
        partial: bool,
    ) -> i64 {
        if let Some(last) = self.transcript.last_mut() {
            if last.partial {
                last.partial = false;
                let entry = last.clone();
                self.publish_entry("transcript.updated", &entry);
            }
        }
        let entry = TranscriptEntry {
            ts: self.next_ts(),
            kind,
            text,
            images,
            partial,
        };
        self.publish_entry("transcript.appended", &entry);
        let ts = entry.ts;
        self.transcript.push(entry);
        ts
    }

    fn update_last_partial(
        &mut self,
        kind: EntryKind,
        text: Option<String>,
        partial: bool,
    ) -> Option<i64> {
        let last = self.transcript.last_mut()?;
        if !last.partial || last.kind != kind {
            return None;
        }
        last.text = text;
        last.partial = partial;
        let entry = last.clone();
        self.publish_entry("transcript.updated", &entry);
        Some(entry.ts)
    }

    fn publish_entry(&self, event: &str, entry: &TranscriptEntry) {
        self.services.events.publish(EngineEvent::new(
            event,
            json!({"taskID": self.id, "entry": entry}),
        ));
    }

    pub(super) async fn say(&mut self, kind: SayKind, text: Option<String>) -> anyhow::Result<i64> {
        self.say_with_images(kind, text, Vec::new()).await
    }

    /// Completes the matching partial entry if it is the newest one, otherwise
    /// appends a complete entry.
    pub(super) async fn say_with_images(
        &mut self,
        kind: SayKind,
        text: Option<String>,
        images: Vec<String>,
    ) -> anyhow::Result<i64> {
        self.ensure_active()?;
        let kind = EntryKind::Say(kind);
        let ts = match self.update_last_partial(kind, text.clone(), false) {
            Some(ts) => ts,
            None => self.append_entry(kind, text, images, false),
        };
        self.persist().await?;
        Ok(ts)
    }

    pub(super) fn say_partial(&mut self, kind: SayKind, text: Option<String>) -> anyhow::Result<()> {
        self.ensure_active()?;
        let kind = EntryKind::Say(kind);
        if self.update_last_partial(kind, text.clone(), true).is_none() {
            self.append_entry(kind, text, Vec::new(), true);
        }
        Ok(())
    }

    pub(super) fn ask_partial(&mut self, kind: AskKind, text: Option<String>) -> anyhow::Result<()> {
        self.ensure_active()?;
        let kind = EntryKind::Ask(kind);
        if self.update_last_partial(kind, text.clone(), true).is_none() {
            self.append_entry(kind, text, Vec::new(), true);
        }
        Ok(())
    }

    /// Raises an ask and suspends until the host answers it or the task is
    /// aborted. Stream chunks keep being ingested while waiting.
    pub(super) async fn ask(&mut self, kind: AskKind, text: Option<String>) -> anyhow::Result<AskReply> {
        self.ensure_active()?;
        let entry_kind = EntryKind::Ask(kind);
        let ts = match self.update_last_partial(entry_kind, text.clone(), false) {
            Some(ts) => ts,
            None => self.append_entry(entry_kind, text.clone(), Vec::new(), false),
        };
        self.persist().await?;

        let resume_state = self.state;
        self.set_state(match kind {
            AskKind::Followup
            | AskKind::PlanModeRespond
            | AskKind::CompletionResult
            | AskKind::ResumeTask
            | AskKind::ResumeCompletedTask => TaskState::AwaitingAnswer,
            _ => TaskState::AwaitingApproval,
        });
        let host = self.services.host.clone();
        let rx = host
            .register(PendingAsk {
                task_id: self.id.clone(),
                ts,
                kind,
                text,
            })
            .await;

        let wait = host.wait_for_reply(rx, self.cancel.clone());
        tokio::pin!(wait);
        let reply = loop {
            tokio::select! {
                reply = &mut wait => break reply,
                chunk = next_chunk(&mut self.reply.rx) => self.ingest_chunk(chunk),
            }
        };
        let Some(reply) = reply else {
            host.forget(&self.id, ts).await;
            if self.cancel.is_cancelled() {
                return Err(TaskError::Aborted.into());
            }
            anyhow::bail!("approval host dropped ask {ts}");
        };
        self.set_state(resume_state);
        Ok(reply)
    }

    /// Drops the newest entry if it is a partial of `kind`, for a preview
    /// that ends up being raised as a different kind.
    pub(super) fn discard_partial(&mut self, kind: EntryKind) {
        if self
            .transcript
            .last()
            .is_some_and(|last| last.partial && last.kind == kind)
        {
            if let Some(entry) = self.transcript.pop() {
                self.services.events.publish(EngineEvent::new(
                    "transcript.removed",
                    json!({"taskID": self.id, "ts": entry.ts}),
                ));
            }
        }
    }

    pub(super) fn finalize_partial_entry(&mut self) {
        if let Some(last) = self.transcript.last_mut() {
            if last.partial {
                last.partial = false;
                let entry = last.clone();
                self.publish_entry("transcript.updated", &entry);
            }
        }
    }

    /// Rewrites the `api_req_started` record raised at `ts`.
    pub(super) fn update_api_request(&mut self, ts: i64, update: impl FnOnce(&mut ApiRequestInfo)) {
        let Some(entry) = self
            .transcript
            .iter_mut()
            .find(|entry| entry.ts == ts && entry.is_say(SayKind::ApiReqStarted))
        else {
            return;
        };
        let mut info: ApiRequestInfo = entry
            .text
            .as_deref()
            .and_then(|raw| serde_json::from_str(raw).ok())
            .unwrap_or_default();
        update(&mut info);
        entry.text = serde_json::to_string(&info).ok();
        let entry = entry.clone();
        self.publish_entry("transcript.updated", &entry);
    }

    pub(super) async fn persist(&self) -> anyhow::Result<()> {
        if self.abandoned.load(std::sync::atomic::Ordering::SeqCst) {
            return Ok(());
        }
        let snapshot = TaskSnapshot {
            task_id: self.id.clone(),
            history: self.history.clone(),
            transcript: self.transcript.clone(),
            deleted_range: self.deleted_range,
            mode: self.mode,
            updated_at: Utc::now(),
        };
        self.services
            .store
            .save(&snapshot)
            .await
            .with_context(|| format!("persisting task {}", self.id))
    }
}

/// Next chunk from the reader task, or never once the reply has no stream.
pub(super) async fn next_chunk(
    rx: &mut Option<ChunkReceiver>,
) -> Option<anyhow::Result<tether_providers::StreamChunk>> {
    match rx {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
