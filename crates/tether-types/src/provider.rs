use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub id: String,
    pub provider_id: String,
    pub display_name: String,
    pub context_window: usize,
    /// Response budget declared by the model, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_output_tokens: Option<usize>,
    #[serde(default)]
    pub pricing: ModelPricing,
}

/// Prices in USD per million tokens.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ModelPricing {
    #[serde(default)]
    pub input: f64,
    #[serde(default)]
    pub output: f64,
    #[serde(default)]
    pub cache_writes: f64,
    #[serde(default)]
    pub cache_reads: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderInfo {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub models: Vec<ModelInfo>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenUsage {
    pub input_tokens: u64,
    pub output_tokens: u64,
    #[serde(default)]
    pub cache_write_tokens: u64,
    #[serde(default)]
    pub cache_read_tokens: u64,
}

impl TokenUsage {
    pub fn total(&self) -> u64 {
        self.input_tokens + self.output_tokens + self.cache_write_tokens + self.cache_read_tokens
    }

    pub fn accumulate(&mut self, other: &TokenUsage) {
        self.input_tokens += other.input_tokens;
        self.output_tokens += other.output_tokens;
        self.cache_write_tokens += other.cache_write_tokens;
        self.cache_read_tokens += other.cache_read_tokens;
    }

    pub fn cost(&self, pricing: &ModelPricing) -> f64 {
        let per_token = |count: u64, price: f64| count as f64 * price / 1_000_000.0;
        per_token(self.input_tokens, pricing.input)
            + per_token(self.output_tokens, pricing.output)
            + per_token(self.cache_write_tokens, pricing.cache_writes)
            + per_token(self.cache_read_tokens, pricing.cache_reads)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CancelReason {
    StreamingFailed,
    UserCancelled,
}

/// Payload of the `api_req_started` transcript entry. Field names follow the
/// host protocol.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiRequestInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_in: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens_out: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_writes: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cache_reads: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cost: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cancel_reason: Option<CancelReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub streaming_failed_message: Option<String>,
}

impl ApiRequestInfo {
    pub fn record_usage(&mut self, usage: &TokenUsage, pricing: &ModelPricing) {
        self.tokens_in = Some(usage.input_tokens);
        self.tokens_out = Some(usage.output_tokens);
        self.cache_writes = Some(usage.cache_write_tokens);
        self.cache_reads = Some(usage.cache_read_tokens);
        self.cost = Some(usage.cost(pricing));
    }
}
