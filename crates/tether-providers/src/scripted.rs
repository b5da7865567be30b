use std::collections::VecDeque;
use std::path::Path;

use async_stream::try_stream;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use tether_types::{Message, ModelInfo, ModelPricing, ProviderInfo, TokenUsage};

use crate::{Provider, ProviderStream, StreamChunk};

/// Where a scripted reply breaks.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "at", rename_all = "snake_case")]
pub enum ScriptedFailure {
    /// The stream errors before yielding anything.
    FirstChunk { message: String },
    /// The stream errors after `after` text chunks.
    MidStream { after: usize, message: String },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptedReply {
    #[serde(default)]
    pub chunks: Vec<String>,
    #[serde(default)]
    pub reasoning: Option<String>,
    #[serde(default)]
    pub usage: Option<TokenUsage>,
    #[serde(default)]
    pub failure: Option<ScriptedFailure>,
}

impl ScriptedReply {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            chunks: vec![text.into()],
            reasoning: None,
            usage: None,
            failure: None,
        }
    }

    pub fn failing(failure: ScriptedFailure) -> Self {
        Self {
            chunks: Vec::new(),
            reasoning: None,
            usage: None,
            failure: Some(failure),
        }
    }

    /// Re-splits the reply into chunks of at most `size` characters.
    pub fn chunked(mut self, size: usize) -> Self {
        let text: String = self.chunks.concat();
        let chars: Vec<char> = text.chars().collect();
        self.chunks = chars
            .chunks(size.max(1))
            .map(|c| c.iter().collect())
            .collect();
        self
    }

    pub fn with_usage(mut self, usage: TokenUsage) -> Self {
        self.usage = Some(usage);
        self
    }

    pub fn with_failure(mut self, failure: ScriptedFailure) -> Self {
        self.failure = Some(failure);
        self
    }
}

/// On-disk form of a replay script.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScriptFile {
    #[serde(default)]
    pub model: Option<ModelInfo>,
    #[serde(default)]
    pub chunk_size: Option<usize>,
    pub replies: Vec<ScriptedReply>,
}

/// Replays canned replies in order, one per request. Every request's history
/// is recorded so callers can inspect what the model would have seen.
pub struct ScriptedProvider {
    id: String,
    model: ModelInfo,
    replies: Mutex<VecDeque<ScriptedReply>>,
    requests: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self::with_id("scripted", replies)
    }

    pub fn with_id(id: &str, replies: Vec<ScriptedReply>) -> Self {
        Self {
            id: id.to_string(),
            model: ModelInfo {
                id: "scripted-1".to_string(),
                provider_id: id.to_string(),
                display_name: "Scripted Model".to_string(),
                context_window: 128_000,
                max_output_tokens: None,
                pricing: ModelPricing::default(),
            },
            replies: Mutex::new(replies.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn with_model(mut self, model: ModelInfo) -> Self {
        self.model = model;
        self
    }

    pub fn from_script(script: ScriptFile) -> Self {
        let replies = script
            .replies
            .into_iter()
            .map(|reply| match script.chunk_size {
                Some(size) => reply.chunked(size),
                None => reply,
            })
            .collect();
        let provider = Self::new(replies);
        match script.model {
            Some(model) => provider.with_model(model),
            None => provider,
        }
    }

    pub fn from_json_file(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let script: ScriptFile = serde_json::from_str(&raw)?;
        Ok(Self::from_script(script))
    }

    pub async fn push_reply(&self, reply: ScriptedReply) {
        self.replies.lock().await.push_back(reply);
    }

    pub async fn remaining(&self) -> usize {
        self.replies.lock().await.len()
    }

    pub async fn requests(&self) -> Vec<Vec<Message>> {
        self.requests.lock().await.clone()
    }
}

#[async_trait]
impl Provider for ScriptedProvider {
    fn info(&self) -> ProviderInfo {
        ProviderInfo {
            id: self.id.clone(),
            name: "Scripted".to_string(),
            models: vec![self.model.clone()],
        }
    }

    fn model(&self) -> ModelInfo {
        self.model.clone()
    }

    async fn stream(
        &self,
        _system_prompt: &str,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ProviderStream> {
        self.requests.lock().await.push(messages);
        let Some(reply) = self.replies.lock().await.pop_front() else {
            anyhow::bail!("scripted provider `{}` has no replies left", self.id);
        };

        let stream = try_stream! {
            if let Some(ScriptedFailure::FirstChunk { message }) = &reply.failure {
                Err(anyhow::anyhow!(message.clone()))?;
            }
            if let Some(reasoning) = &reply.reasoning {
                yield StreamChunk::ReasoningDelta(reasoning.clone());
            }
            for (idx, chunk) in reply.chunks.iter().enumerate() {
                if let Some(ScriptedFailure::MidStream { after, message }) = &reply.failure {
                    if idx == *after {
                        Err(anyhow::anyhow!(message.clone()))?;
                    }
                }
                if cancel.is_cancelled() {
                    yield StreamChunk::Done { finish_reason: "cancelled".to_string() };
                    return;
                }
                yield StreamChunk::TextDelta(chunk.clone());
                tokio::task::yield_now().await;
            }
            if let Some(usage) = reply.usage {
                yield StreamChunk::Usage(usage);
            }
            yield StreamChunk::Done { finish_reason: "stop".to_string() };
        };
        Ok(Box::pin(stream))
    }
}
