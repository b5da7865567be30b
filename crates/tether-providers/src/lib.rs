use std::pin::Pin;

use async_trait::async_trait;
use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use tether_types::{Message, ModelInfo, ProviderInfo, TokenUsage};

mod scripted;

pub use scripted::{ScriptFile, ScriptedFailure, ScriptedProvider, ScriptedReply};

#[derive(Debug, Clone, PartialEq)]
pub enum StreamChunk {
    TextDelta(String),
    ReasoningDelta(String),
    Usage(TokenUsage),
    Done { finish_reason: String },
}

pub type ProviderStream = Pin<Box<dyn Stream<Item = anyhow::Result<StreamChunk>> + Send>>;

#[async_trait]
pub trait Provider: Send + Sync {
    fn info(&self) -> ProviderInfo;

    /// The model replies are requested from.
    fn model(&self) -> ModelInfo;

    async fn stream(
        &self,
        system_prompt: &str,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> anyhow::Result<ProviderStream>;

    /// One-shot reply, collected from [`Provider::stream`].
    async fn complete(
        &self,
        system_prompt: &str,
        messages: Vec<Message>,
        cancel: CancellationToken,
    ) -> anyhow::Result<String> {
        let mut stream = self.stream(system_prompt, messages, cancel).await?;
        let mut text = String::new();
        while let Some(chunk) = stream.next().await {
            match chunk? {
                StreamChunk::TextDelta(delta) => text.push_str(&delta),
                StreamChunk::Done { .. } => break,
                StreamChunk::ReasoningDelta(_) | StreamChunk::Usage(_) => {}
            }
        }
        Ok(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn complete_collects_text_deltas() {
        let provider = ScriptedProvider::new(vec![ScriptedReply::text("hello there").chunked(3)]);
        let text = provider
            .complete("", Vec::new(), CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(text, "hello there");
    }
}
