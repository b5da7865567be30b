use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use tether_parser::{ParserLimits, StreamingParser};
use tether_providers::StreamChunk;
use tether_types::{ContentBlock, MessagePart, TokenUsage, ToolId};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskState {
    Idle,
    Streaming,
    Presenting,
    AwaitingApproval,
    AwaitingAnswer,
    Completed,
    Aborted,
    Failed,
}

impl TaskState {
    pub fn as_str(self) -> &'static str {
        match self {
            TaskState::Idle => "idle",
            TaskState::Streaming => "streaming",
            TaskState::Presenting => "presenting",
            TaskState::AwaitingApproval => "awaiting_approval",
            TaskState::AwaitingAnswer => "awaiting_answer",
            TaskState::Completed => "completed",
            TaskState::Aborted => "aborted",
            TaskState::Failed => "failed",
        }
    }
}

/// Serializes presentation passes. A caller that finds a pass running only
/// marks the reply dirty; the running pass loops until nothing is pending.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct PresentationGate {
    locked: bool,
    pending: bool,
}

impl PresentationGate {
    pub(crate) fn try_enter(&mut self) -> bool {
        if self.locked {
            self.pending = true;
            return false;
        }
        self.locked = true;
        self.pending = false;
        true
    }

    pub(crate) fn mark_pending(&mut self) {
        if self.locked {
            self.pending = true;
        }
    }

    pub(crate) fn take_pending(&mut self) -> bool {
        std::mem::take(&mut self.pending)
    }

    pub(crate) fn leave(&mut self) {
        self.locked = false;
        self.pending = false;
    }
}

pub(crate) type ChunkReceiver = mpsc::UnboundedReceiver<anyhow::Result<StreamChunk>>;

/// Everything scoped to one model reply.
pub(crate) struct ReplyState {
    pub(crate) parser: StreamingParser,
    pub(crate) blocks: Vec<ContentBlock>,
    pub(crate) current_index: usize,
    pub(crate) gate: PresentationGate,
    pub(crate) rx: Option<ChunkReceiver>,
    /// Stops the reader task that owns the provider stream.
    pub(crate) reader_cancel: CancellationToken,
    pub(crate) active: bool,
    pub(crate) request_ts: Option<i64>,
    /// Next user message: tool results plus any feedback gathered on the way.
    pub(crate) user_content: Vec<MessagePart>,
    /// Tool-use parts for the assistant message, in presentation order.
    pub(crate) tool_uses: Vec<MessagePart>,
    pub(crate) current_tool: Option<(String, ToolId)>,
    pub(crate) did_reject_tool: bool,
    pub(crate) did_already_use_tool: bool,
    pub(crate) last_result_error: bool,
    pub(crate) interrupted: bool,
    pub(crate) stop_requested: bool,
    pub(crate) completion: Option<String>,
    pub(crate) usage: TokenUsage,
    pub(crate) saw_usage: bool,
    pub(crate) reasoning: String,
    pub(crate) reasoning_shown: usize,
    pub(crate) diagnostics_logged: usize,
    pub(crate) stream_error: Option<String>,
    /// The reply outgrew the parser buffer. Recoverable, unlike `stream_error`.
    pub(crate) parse_error: Option<String>,
}

impl ReplyState {
    pub(crate) fn new(limits: ParserLimits) -> Self {
        Self {
            parser: StreamingParser::new(limits),
            blocks: Vec::new(),
            current_index: 0,
            gate: PresentationGate::default(),
            rx: None,
            reader_cancel: CancellationToken::new(),
            active: false,
            request_ts: None,
            user_content: Vec::new(),
            tool_uses: Vec::new(),
            current_tool: None,
            did_reject_tool: false,
            did_already_use_tool: false,
            last_result_error: false,
            interrupted: false,
            stop_requested: false,
            completion: None,
            usage: TokenUsage::default(),
            saw_usage: false,
            reasoning: String::new(),
            reasoning_shown: 0,
            diagnostics_logged: 0,
            stream_error: None,
            parse_error: None,
        }
    }

    /// Drops the chunk receiver and cancels the reader, which may be parked
    /// on a provider that has not yielded yet.
    pub(crate) fn stop_reading(&mut self) {
        self.rx = None;
        self.reader_cancel.cancel();
    }
}
