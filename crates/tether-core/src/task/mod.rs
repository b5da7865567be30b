use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::Serialize;
use serde_json::json;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::Level;
use uuid::Uuid;

use tether_observability::{emit_event, ObservabilityEvent, ProcessKind};
use tether_providers::Provider;
use tether_tools::{EditPreview, ToolRegistry};
use tether_types::{
    ApiRequestInfo, AskKind, AskResponse, EngineEvent, Message, MessagePart, MessageRole, SayKind,
    TokenUsage, ToolId, TranscriptEntry,
};

use crate::approval::ApprovalHost;
use crate::cancellation::CancellationRegistry;
use crate::checkpoint::CheckpointService;
use crate::config::EngineConfig;
use crate::context_window::{DeletedRange, TiktokenCounter, TokenCounter};
use crate::event_bus::EventBus;
use crate::mode::Mode;
use crate::repetition::RepetitionDetector;
use crate::responses;
use crate::storage::TaskStore;

mod context;
mod present;
mod resume;
mod state;
mod stream;
mod tools;
mod transcript;

pub use state::TaskState;
use state::ReplyState;

#[derive(Debug, Error)]
pub enum TaskError {
    #[error("task was aborted")]
    Aborted,
}

pub fn is_abort(err: &anyhow::Error) -> bool {
    matches!(err.downcast_ref::<TaskError>(), Some(TaskError::Aborted))
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum TaskOutcome {
    /// The user accepted an `attempt_completion` result.
    Completed { result: String },
    Aborted,
    /// The user declined to continue at a circuit breaker or failed request.
    Stopped,
    /// The provider stream broke mid-reply. The task can be resumed.
    Failed { message: String },
}

/// Collaborators a task talks to. Cheap to clone; one set can drive many
/// tasks.
#[derive(Clone)]
pub struct TaskServices {
    pub provider: Arc<dyn Provider>,
    pub tools: ToolRegistry,
    pub store: Arc<dyn TaskStore>,
    pub host: ApprovalHost,
    pub events: EventBus,
    pub cancellations: CancellationRegistry,
    pub checkpoints: Option<Arc<dyn CheckpointService>>,
    pub token_counter: Arc<dyn TokenCounter>,
    pub system_prompt: String,
}

impl TaskServices {
    pub fn new(
        provider: Arc<dyn Provider>,
        tools: ToolRegistry,
        store: Arc<dyn TaskStore>,
        host: ApprovalHost,
    ) -> Self {
        Self {
            provider,
            tools,
            store,
            events: host.event_bus().clone(),
            host,
            cancellations: CancellationRegistry::new(),
            checkpoints: None,
            token_counter: Arc::new(TiktokenCounter::new()),
            system_prompt: String::new(),
        }
    }

    pub fn with_checkpoints(mut self, checkpoints: Arc<dyn CheckpointService>) -> Self {
        self.checkpoints = Some(checkpoints);
        self
    }

    pub fn with_token_counter(mut self, counter: Arc<dyn TokenCounter>) -> Self {
        self.token_counter = counter;
        self
    }

    pub fn with_system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.system_prompt = prompt.into();
        self
    }

    pub fn with_cancellations(mut self, cancellations: CancellationRegistry) -> Self {
        self.cancellations = cancellations;
        self
    }
}

/// Lets other tasks stop a running task without borrowing it.
#[derive(Clone)]
pub struct TaskHandle {
    task_id: String,
    cancel: CancellationToken,
    abandoned: Arc<AtomicBool>,
}

impl TaskHandle {
    pub fn id(&self) -> &str {
        &self.task_id
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    /// Abort without persisting anything further, for a task that is being
    /// replaced.
    pub fn abandon(&self) {
        self.abandoned.store(true, Ordering::SeqCst);
        self.cancel.cancel();
    }

    pub fn is_aborted(&self) -> bool {
        self.cancel.is_cancelled()
    }
}

enum Turn {
    Continue(Vec<MessagePart>),
    Finished(TaskOutcome),
}

pub struct Task {
    id: String,
    services: TaskServices,
    config: EngineConfig,
    cancel: CancellationToken,
    abandoned: Arc<AtomicBool>,
    state: TaskState,
    mode: Mode,
    history: Vec<Message>,
    transcript: Vec<TranscriptEntry>,
    deleted_range: Option<DeletedRange>,
    last_ts: i64,
    consecutive_mistakes: u32,
    consecutive_auto_approved: u32,
    last_usage: Option<TokenUsage>,
    /// Correlates log events with the `api_req_started` entry of the turn.
    request_id: Option<String>,
    repetition: RepetitionDetector,
    reply: ReplyState,
    edit_preview: Option<EditPreview>,
}

impl Task {
    pub async fn new(services: TaskServices, config: EngineConfig) -> Self {
        Self::with_id(services, config, Uuid::new_v4().to_string()).await
    }

    async fn with_id(services: TaskServices, config: EngineConfig, id: String) -> Self {
        let cancel = services.cancellations.create(&id).await;
        Self {
            mode: config.mode,
            repetition: RepetitionDetector::new(config.limits.max_repeated_tool_calls),
            reply: ReplyState::new(config.parser.limits()),
            id,
            services,
            config,
            cancel,
            abandoned: Arc::new(AtomicBool::new(false)),
            state: TaskState::Idle,
            history: Vec::new(),
            transcript: Vec::new(),
            deleted_range: None,
            last_ts: 0,
            consecutive_mistakes: 0,
            consecutive_auto_approved: 0,
            last_usage: None,
            request_id: None,
            edit_preview: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> TaskState {
        self.state
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    pub fn history(&self) -> &[Message] {
        &self.history
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        &self.transcript
    }

    pub fn deleted_range(&self) -> Option<DeletedRange> {
        self.deleted_range
    }

    pub fn consecutive_mistakes(&self) -> u32 {
        self.consecutive_mistakes
    }

    pub fn handle(&self) -> TaskHandle {
        TaskHandle {
            task_id: self.id.clone(),
            cancel: self.cancel.clone(),
            abandoned: self.abandoned.clone(),
        }
    }

    /// Runs a new task until it completes, stops, fails or is aborted.
    pub async fn start(&mut self, task: &str, images: Vec<String>) -> anyhow::Result<TaskOutcome> {
        self.log_event(Level::INFO, "task.start", None, None);
        if let Err(err) = self
            .say_with_images(SayKind::Task, Some(task.to_string()), images.clone())
            .await
        {
            return self.settle_error(err).await;
        }
        let mut content = vec![MessagePart::text(format!("<task>\n{task}\n</task>"))];
        content.extend(images.iter().map(|image| image_part(image)));
        self.run_loop(content).await
    }

    async fn run_loop(&mut self, first: Vec<MessagePart>) -> anyhow::Result<TaskOutcome> {
        let mut next = first;
        let outcome = loop {
            match self.run_turn(next).await {
                Ok(Turn::Continue(content)) => next = content,
                Ok(Turn::Finished(outcome)) => break outcome,
                Err(err) => return self.settle_error(err).await,
            }
        };
        self.settle(outcome).await
    }

    async fn settle_error(&mut self, err: anyhow::Error) -> anyhow::Result<TaskOutcome> {
        if is_abort(&err) {
            self.abort_cleanup().await?;
            return self.settle(TaskOutcome::Aborted).await;
        }
        self.log_event(Level::ERROR, "task.error", Some("error"), Some(&format!("{err:#}")));
        self.set_state(TaskState::Failed);
        self.services.cancellations.remove(&self.id).await;
        Err(err)
    }

    async fn settle(&mut self, outcome: TaskOutcome) -> anyhow::Result<TaskOutcome> {
        let state = match &outcome {
            TaskOutcome::Completed { .. } => TaskState::Completed,
            TaskOutcome::Aborted => TaskState::Aborted,
            TaskOutcome::Failed { .. } => TaskState::Failed,
            TaskOutcome::Stopped => TaskState::Idle,
        };
        self.set_state(state);
        self.services.host.forget_task(&self.id).await;
        self.services.cancellations.remove(&self.id).await;
        self.log_event(Level::INFO, "task.finished", Some(state.as_str()), None);
        Ok(outcome)
    }

    async fn run_turn(&mut self, mut user_content: Vec<MessagePart>) -> anyhow::Result<Turn> {
        self.ensure_active()?;
        if let Some(outcome) = self.check_circuit_breakers(&mut user_content).await? {
            return Ok(Turn::Finished(outcome));
        }

        let request = ApiRequestInfo {
            request: Some(request_preview(&user_content)),
            ..Default::default()
        };
        let request_ts = self
            .say(SayKind::ApiReqStarted, Some(serde_json::to_string(&request)?))
            .await?;
        self.request_id = Some(format!("req_{request_ts}"));
        self.history
            .push(Message::new(MessageRole::User, user_content));
        self.persist().await?;

        self.manage_context_window().await?;

        let Some((stream, first)) = self.open_stream_with_retry().await? else {
            return Ok(Turn::Finished(TaskOutcome::Stopped));
        };
        self.begin_reply(stream, first, request_ts);
        self.consume_reply().await?;
        if let Some(message) = self.reply.stream_error.take() {
            return self.fail_reply(message).await.map(Turn::Finished);
        }
        if let Some(message) = self.reply.parse_error.take() {
            return self.drop_oversized_reply(message).await;
        }
        self.finish_reply().await
    }

    async fn check_circuit_breakers(
        &mut self,
        user_content: &mut Vec<MessagePart>,
    ) -> anyhow::Result<Option<TaskOutcome>> {
        let max_mistakes = self.config.limits.max_consecutive_mistakes;
        if max_mistakes > 0 && self.consecutive_mistakes >= max_mistakes {
            let reply = self
                .ask(
                    AskKind::MistakeLimitReached,
                    Some(format!(
                        "The model has made {} consecutive mistakes. Guidance such as \
                         \"Try breaking the task into smaller steps\" may help it recover.",
                        self.consecutive_mistakes
                    )),
                )
                .await?;
            if reply.response == AskResponse::No {
                return Ok(Some(TaskOutcome::Stopped));
            }
            if let Some(feedback) = reply.feedback().map(str::to_string) {
                user_content.push(MessagePart::text(responses::too_many_mistakes(&feedback)));
                user_content.extend(reply.images.iter().map(|image| image_part(image)));
                self.say_with_images(SayKind::UserFeedback, Some(feedback), reply.images.clone())
                    .await?;
            }
            self.consecutive_mistakes = 0;
        }

        let approval = &self.config.auto_approval;
        if approval.enabled
            && approval.max_requests > 0
            && self.consecutive_auto_approved >= approval.max_requests
        {
            let reply = self
                .ask(
                    AskKind::AutoApprovalMaxReqReached,
                    Some(format!(
                        "{} requests were auto-approved in a row. Reset the count and continue?",
                        self.consecutive_auto_approved
                    )),
                )
                .await?;
            if reply.response == AskResponse::No {
                return Ok(Some(TaskOutcome::Stopped));
            }
            self.consecutive_auto_approved = 0;
        }
        Ok(None)
    }

    fn ensure_active(&self) -> anyhow::Result<()> {
        if self.cancel.is_cancelled() {
            return Err(TaskError::Aborted.into());
        }
        Ok(())
    }

    fn set_state(&mut self, state: TaskState) {
        if self.state == state {
            return;
        }
        self.state = state;
        self.services.events.publish(EngineEvent::new(
            "task.status",
            json!({"taskID": self.id, "state": state}),
        ));
    }

    fn log_event(&self, level: Level, event: &str, status: Option<&str>, detail: Option<&str>) {
        self.emit(
            level,
            ObservabilityEvent {
                event,
                status,
                detail,
                ..Default::default()
            },
        );
    }

    fn log_tool_event(
        &self,
        level: Level,
        event: &str,
        tool: ToolId,
        status: Option<&str>,
        detail: Option<&str>,
    ) {
        self.emit(
            level,
            ObservabilityEvent {
                event,
                tool: Some(tool.as_str()),
                status,
                detail,
                ..Default::default()
            },
        );
    }

    /// Fills in the task, request and model fields every event carries.
    fn emit(&self, level: Level, event: ObservabilityEvent<'_>) {
        let model = self.services.provider.model();
        emit_event(
            level,
            ProcessKind::Engine,
            ObservabilityEvent {
                component: "task",
                task_id: Some(&self.id),
                request_id: self.request_id.as_deref(),
                provider_id: Some(&model.provider_id),
                model_id: Some(&model.id),
                ..event
            },
        );
    }
}

/// Images travel as data URLs; anything else is passed through as PNG data.
fn image_part(image: &str) -> MessagePart {
    if let Some(rest) = image.strip_prefix("data:") {
        if let Some((media_type, data)) = rest.split_once(";base64,") {
            return MessagePart::Image {
                media_type: media_type.to_string(),
                data: data.to_string(),
            };
        }
    }
    MessagePart::Image {
        media_type: "image/png".to_string(),
        data: image.to_string(),
    }
}

/// Short rendering of the user content for the `api_req_started` record.
fn request_preview(parts: &[MessagePart]) -> String {
    let preview = Message::new(MessageRole::User, parts.to_vec()).flattened_text();
    tether_observability::truncate_for_log(&preview, 2_000)
}
