use serde::{Deserialize, Serialize};
use tiktoken_rs::{cl100k_base, CoreBPE};

use tether_types::{Message, MessagePart, MessageRole, ModelInfo};

use crate::config::ContextSettings;

/// Per-message framing the provider adds around content.
const MESSAGE_OVERHEAD_TOKENS: usize = 4;

/// Inclusive range of history indices hidden from the model. The stored
/// history keeps them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeletedRange {
    pub start: usize,
    pub end: usize,
}

impl DeletedRange {
    pub fn len(&self) -> usize {
        self.end + 1 - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepPolicy {
    Half,
    Quarter,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContextBudget {
    pub context_window: usize,
    pub reserve: usize,
    pub threshold: u64,
}

impl ContextBudget {
    pub fn for_model(settings: &ContextSettings, model: &ModelInfo) -> Self {
        let context_window = settings.context_window.unwrap_or(model.context_window);
        let reserve = model
            .max_output_tokens
            .unwrap_or_else(|| (context_window as f64 * settings.reserve_fraction) as usize)
            .min(context_window);
        let usable = (context_window - reserve) as f64;
        let threshold = (usable * (1.0 - settings.safety_margin.clamp(0.0, 1.0))) as u64;
        Self {
            context_window,
            reserve,
            threshold,
        }
    }

    /// `None` while `total_tokens` fits under the threshold.
    pub fn decide(&self, total_tokens: u64) -> Option<KeepPolicy> {
        if total_tokens <= self.threshold {
            None
        } else if total_tokens / 2 > self.threshold {
            Some(KeepPolicy::Quarter)
        } else {
            Some(KeepPolicy::Half)
        }
    }
}

/// Extends the hidden range past what is already hidden. Message 0 is never
/// included and the range always covers an even number of messages, so the
/// conversation still alternates once it is applied.
pub fn next_truncation_range(
    history_len: usize,
    current: Option<DeletedRange>,
    keep: KeepPolicy,
) -> Option<DeletedRange> {
    let first_visible = current.map(|range| range.end + 1).unwrap_or(1);
    let visible = history_len.saturating_sub(first_visible);
    let to_remove = match keep {
        KeepPolicy::Half => (visible / 4) * 2,
        KeepPolicy::Quarter => ((visible * 3 / 4) / 2) * 2,
    };
    if to_remove == 0 {
        return None;
    }
    Some(DeletedRange {
        start: 1,
        end: first_visible + to_remove - 1,
    })
}

/// The history the model sees.
pub fn apply_deleted_range(history: &[Message], range: Option<DeletedRange>) -> Vec<Message> {
    match range {
        Some(range) if range.start >= 1 && range.start <= range.end => history
            .iter()
            .enumerate()
            .filter(|(idx, _)| *idx < range.start || *idx > range.end)
            .map(|(_, message)| message.clone())
            .collect(),
        _ => history.to_vec(),
    }
}

/// Index where the verbatim tail begins when condensing, or `None` when the
/// history is too short to be worth summarizing. The tail starts on a user
/// message so the summary can sit between it and message 0.
pub fn condense_split(history: &[Message], keep_exchanges: usize) -> Option<usize> {
    let keep = keep_exchanges.max(1) * 2;
    if history.len() < keep + 3 {
        return None;
    }
    let mut tail_start = history.len() - keep;
    while tail_start > 1 && history[tail_start].role != MessageRole::User {
        tail_start -= 1;
    }
    (tail_start > 2).then_some(tail_start)
}

pub fn assemble_condensed(history: &[Message], tail_start: usize, summary: &str) -> Vec<Message> {
    let mut condensed = Vec::with_capacity(history.len() - tail_start + 2);
    condensed.extend(history.first().cloned());
    condensed.push(Message::assistant_text(format!(
        "[Summary of the earlier conversation]\n{}",
        summary.trim()
    )));
    condensed.extend(history[tail_start..].iter().cloned());
    condensed
}

pub trait TokenCounter: Send + Sync {
    fn count_text(&self, text: &str) -> usize;

    fn count_messages(&self, messages: &[Message]) -> usize {
        messages
            .iter()
            .map(|message| {
                MESSAGE_OVERHEAD_TOKENS
                    + message
                        .parts
                        .iter()
                        .map(|part| self.count_part(part))
                        .sum::<usize>()
            })
            .sum()
    }

    fn count_part(&self, part: &MessagePart) -> usize {
        match part {
            MessagePart::Text { text } => self.count_text(text),
            MessagePart::Image { data, .. } => data.len() / 4,
            MessagePart::ToolUse { name, params, .. } => {
                self.count_text(name.as_str())
                    + params
                        .iter()
                        .map(|(key, value)| self.count_text(key.as_str()) + self.count_text(value))
                        .sum::<usize>()
            }
            MessagePart::ToolResult { content, .. } => self.count_text(content),
        }
    }
}

/// `cl100k_base` counts, or a bytes/4 estimate when the BPE tables fail to
/// load.
pub struct TiktokenCounter {
    bpe: Option<CoreBPE>,
}

impl TiktokenCounter {
    pub fn new() -> Self {
        let bpe = match cl100k_base() {
            Ok(bpe) => Some(bpe),
            Err(err) => {
                tracing::warn!(error = %err, "tokenizer unavailable, estimating by bytes");
                None
            }
        };
        Self { bpe }
    }

    pub fn heuristic() -> Self {
        Self { bpe: None }
    }
}

impl Default for TiktokenCounter {
    fn default() -> Self {
        Self::new()
    }
}

impl TokenCounter for TiktokenCounter {
    fn count_text(&self, text: &str) -> usize {
        match &self.bpe {
            Some(bpe) => bpe.encode_with_special_tokens(text).len(),
            None => text.len().div_ceil(4),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tether_types::ModelPricing;

    fn model(window: usize, max_output: Option<usize>) -> ModelInfo {
        ModelInfo {
            id: "m".to_string(),
            provider_id: "p".to_string(),
            display_name: "M".to_string(),
            context_window: window,
            max_output_tokens: max_output,
            pricing: ModelPricing::default(),
        }
    }

    fn conversation(len: usize) -> Vec<Message> {
        (0..len)
            .map(|idx| {
                if idx % 2 == 0 {
                    Message::user_text(format!("u{idx}"))
                } else {
                    Message::assistant_text(format!("a{idx}"))
                }
            })
            .collect()
    }

    #[test]
    fn reserve_prefers_declared_output_limit() {
        let settings = ContextSettings::default();
        let declared = ContextBudget::for_model(&settings, &model(100_000, Some(8_000)));
        assert_eq!(declared.reserve, 8_000);
        assert_eq!(declared.threshold, 92_000);

        let derived = ContextBudget::for_model(&settings, &model(100_000, None));
        assert_eq!(derived.reserve, 20_000);
        assert_eq!(derived.threshold, 80_000);

        let margin = ContextSettings {
            safety_margin: 0.5,
            context_window: Some(10_000),
            ..ContextSettings::default()
        };
        let overridden = ContextBudget::for_model(&margin, &model(100_000, None));
        assert_eq!(overridden.context_window, 10_000);
        assert_eq!(overridden.threshold, 4_000);
    }

    #[test]
    fn decision_escalates_when_far_over() {
        let budget = ContextBudget {
            context_window: 1_000,
            reserve: 200,
            threshold: 800,
        };
        assert_eq!(budget.decide(800), None);
        assert_eq!(budget.decide(900), Some(KeepPolicy::Half));
        assert_eq!(budget.decide(1_700), Some(KeepPolicy::Quarter));
    }

    #[test]
    fn truncation_removes_even_count_and_keeps_first_message() {
        for len in 2..60 {
            let mut range = None;
            for keep in [KeepPolicy::Half, KeepPolicy::Quarter, KeepPolicy::Half] {
                let Some(next) = next_truncation_range(len, range, keep) else {
                    continue;
                };
                assert_eq!(next.start, 1);
                assert_eq!(next.len() % 2, 0, "len {len} range {next:?}");
                assert!(next.end < len);
                if let Some(prev) = range {
                    assert!(next.end > prev.end);
                }
                range = Some(next);
            }
            if let Some(range) = range {
                let visible = apply_deleted_range(&conversation(len), Some(range));
                assert_eq!(visible[0].flattened_text(), "u0");
                assert!(visible.len() < 2 || visible[1].role == MessageRole::Assistant);
            }
        }
    }

    #[test]
    fn half_and_quarter_policies() {
        assert_eq!(
            next_truncation_range(9, None, KeepPolicy::Half),
            Some(DeletedRange { start: 1, end: 4 })
        );
        assert_eq!(
            next_truncation_range(9, None, KeepPolicy::Quarter),
            Some(DeletedRange { start: 1, end: 6 })
        );
        assert_eq!(next_truncation_range(3, None, KeepPolicy::Half), None);
    }

    #[test]
    fn condensed_history_keeps_first_and_recent_tail() {
        let history = conversation(11);
        let tail_start = condense_split(&history, 2).unwrap();
        assert_eq!(history[tail_start].role, MessageRole::User);
        let condensed = assemble_condensed(&history, tail_start, "they fixed the bug");
        assert_eq!(condensed[0].flattened_text(), "u0");
        assert_eq!(condensed[1].role, MessageRole::Assistant);
        assert!(condensed[1].flattened_text().contains("fixed the bug"));
        assert_eq!(condensed.last().unwrap().flattened_text(), "u10");
        assert!(condense_split(&conversation(5), 2).is_none());
    }

    #[test]
    fn heuristic_counts_quarter_bytes() {
        let counter = TiktokenCounter::heuristic();
        assert_eq!(counter.count_text("abcdefgh"), 2);
        assert_eq!(counter.count_text("abcdefghi"), 3);
        let messages = vec![Message::user_text("abcd")];
        assert_eq!(counter.count_messages(&messages), 1 + MESSAGE_OVERHEAD_TOKENS);
    }
}
