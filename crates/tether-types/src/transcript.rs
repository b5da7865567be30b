use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskKind {
    Followup,
    PlanModeRespond,
    Command,
    CompletionResult,
    Tool,
    ApiReqFailed,
    ResumeTask,
    ResumeCompletedTask,
    MistakeLimitReached,
    AutoApprovalMaxReqReached,
    BrowserActionLaunch,
    UseMcpServer,
    NewTask,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SayKind {
    Task,
    Error,
    ApiReqStarted,
    Text,
    Reasoning,
    CompletionResult,
    UserFeedback,
    ApiReqRetried,
    Command,
    Tool,
    DiffError,
    DeletedApiReqs,
    CheckpointCreated,
    CondenseContext,
    Info,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", content = "kind", rename_all = "snake_case")]
pub enum EntryKind {
    Ask(AskKind),
    Say(SayKind),
}

/// One user-visible transcript line. `ts` is the entry's identity and never
/// changes once assigned.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TranscriptEntry {
    pub ts: i64,
    #[serde(flatten)]
    pub kind: EntryKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
    #[serde(default)]
    pub partial: bool,
}

impl TranscriptEntry {
    pub fn is_ask(&self, kind: AskKind) -> bool {
        self.kind == EntryKind::Ask(kind)
    }

    pub fn is_say(&self, kind: SayKind) -> bool {
        self.kind == EntryKind::Say(kind)
    }
}

/// How the human answered an ask.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AskResponse {
    Yes,
    No,
    Message,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AskReply {
    pub response: AskResponse,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub images: Vec<String>,
}

impl AskReply {
    pub fn yes() -> Self {
        Self {
            response: AskResponse::Yes,
            text: None,
            images: Vec::new(),
        }
    }

    pub fn no() -> Self {
        Self {
            response: AskResponse::No,
            text: None,
            images: Vec::new(),
        }
    }

    pub fn message(text: impl Into<String>) -> Self {
        Self {
            response: AskResponse::Message,
            text: Some(text.into()),
            images: Vec::new(),
        }
    }

    /// Free-form feedback attached to the reply, if any.
    pub fn feedback(&self) -> Option<&str> {
        self.text.as_deref().map(str::trim).filter(|t| !t.is_empty())
    }
}
