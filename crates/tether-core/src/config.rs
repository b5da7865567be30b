use std::path::{Path, PathBuf};

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use tokio::fs;

use tether_parser::ParserLimits;
use tether_types::ToolId;

use crate::mode::Mode;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct EngineConfig {
    pub mode: Mode,
    pub auto_approval: AutoApprovalSettings,
    pub limits: LoopLimits,
    pub parser: ParserSettings,
    pub context: ContextSettings,
    pub retry: RetrySettings,
}

/// Which tool categories run without asking. Nothing is auto-approved unless
/// `enabled` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoApprovalSettings {
    pub enabled: bool,
    pub read: bool,
    pub edit: bool,
    pub execute: bool,
    pub browse: bool,
    pub external_tool: bool,
    pub max_requests: u32,
    /// Tools refused outright, whatever the category settings say.
    pub denied_tools: Vec<ToolId>,
}

impl Default for AutoApprovalSettings {
    fn default() -> Self {
        Self {
            enabled: false,
            read: true,
            edit: false,
            execute: false,
            browse: false,
            external_tool: false,
            max_requests: 20,
            denied_tools: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoopLimits {
    pub max_consecutive_mistakes: u32,
    pub max_repeated_tool_calls: u32,
}

impl Default for LoopLimits {
    fn default() -> Self {
        Self {
            max_consecutive_mistakes: 3,
            max_repeated_tool_calls: 3,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ParserSettings {
    pub max_buffer_bytes: usize,
    pub max_param_bytes: usize,
}

impl Default for ParserSettings {
    fn default() -> Self {
        let limits = ParserLimits::default();
        Self {
            max_buffer_bytes: limits.max_buffer_bytes,
            max_param_bytes: limits.max_param_bytes,
        }
    }
}

impl ParserSettings {
    pub fn limits(&self) -> ParserLimits {
        ParserLimits {
            max_buffer_bytes: self.max_buffer_bytes,
            max_param_bytes: self.max_param_bytes,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    pub condense_enabled: bool,
    /// User/assistant pairs kept verbatim after a condense.
    pub keep_recent_exchanges: usize,
    /// Share of the window held back for the reply when the model declares
    /// no output limit.
    pub reserve_fraction: f64,
    pub safety_margin: f64,
    pub context_window: Option<usize>,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            condense_enabled: false,
            keep_recent_exchanges: 2,
            reserve_fraction: 0.2,
            safety_margin: 0.0,
            context_window: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub auto_retry_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            auto_retry_attempts: 3,
            base_delay_ms: 2_000,
            max_delay_ms: 60_000,
        }
    }
}

impl RetrySettings {
    /// Exponential backoff for the given 1-based attempt.
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let factor = 1u64 << attempt.saturating_sub(1).min(20);
        self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms)
    }
}

#[derive(Debug, Clone)]
struct ConfigLayers {
    global: Value,
    project: Value,
    env: Value,
    cli: Value,
}

/// Layered configuration: global file, project file, environment, then CLI
/// overrides, deep-merged in that order.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    layers: ConfigLayers,
}

impl ConfigStore {
    pub async fn new(path: impl AsRef<Path>, cli_overrides: Option<Value>) -> anyhow::Result<Self> {
        let global_path = resolve_global_config_path();
        Self::with_global_path(path, global_path, cli_overrides).await
    }

    pub async fn with_global_path(
        path: impl AsRef<Path>,
        global_path: PathBuf,
        cli_overrides: Option<Value>,
    ) -> anyhow::Result<Self> {
        let global = read_json_file(&global_path)
            .await
            .with_context(|| format!("reading {}", global_path.display()))?;
        let project = read_json_file(path.as_ref())
            .await
            .with_context(|| format!("reading {}", path.as_ref().display()))?;
        tracing::debug!(global = %global_path.display(), project = %path.as_ref().display(), "config layers loaded");

        Ok(Self {
            layers: ConfigLayers {
                global,
                project,
                env: env_layer(),
                cli: cli_overrides.unwrap_or_else(empty_object),
            },
        })
    }

    pub fn get(&self) -> EngineConfig {
        serde_json::from_value(self.get_effective_value()).unwrap_or_default()
    }

    pub fn get_effective_value(&self) -> Value {
        let mut merged = empty_object();
        deep_merge(&mut merged, &self.layers.global);
        deep_merge(&mut merged, &self.layers.project);
        deep_merge(&mut merged, &self.layers.env);
        deep_merge(&mut merged, &self.layers.cli);
        merged
    }
}

fn empty_object() -> Value {
    Value::Object(Map::new())
}

async fn read_json_file(path: &Path) -> anyhow::Result<Value> {
    if !path.exists() {
        return Ok(empty_object());
    }
    let raw = fs::read_to_string(path).await?;
    Ok(serde_json::from_str::<Value>(&raw).unwrap_or_else(|_| empty_object()))
}

fn resolve_global_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("TETHER_GLOBAL_CONFIG") {
        return PathBuf::from(path);
    }
    if let Some(config_dir) = dirs::config_dir() {
        return config_dir.join("tether").join("config.json");
    }
    PathBuf::from(".tether/global_config.json")
}

fn env_layer() -> Value {
    env_layer_from(|key| std::env::var(key).ok())
}

fn env_layer_from(lookup: impl Fn(&str) -> Option<String>) -> Value {
    let mut root = empty_object();

    if let Some(v) = lookup("TETHER_AUTO_APPROVE").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "auto_approval": { "enabled": v } }));
    }
    if let Some(n) = lookup("TETHER_MAX_AUTO_REQUESTS").and_then(|v| v.trim().parse::<u32>().ok())
    {
        deep_merge(&mut root, &json!({ "auto_approval": { "max_requests": n } }));
    }
    if let Some(n) = lookup("TETHER_MAX_MISTAKES").and_then(|v| v.trim().parse::<u32>().ok()) {
        deep_merge(
            &mut root,
            &json!({ "limits": { "max_consecutive_mistakes": n } }),
        );
    }
    if let Some(n) = lookup("TETHER_CONTEXT_WINDOW").and_then(|v| v.trim().parse::<usize>().ok()) {
        deep_merge(&mut root, &json!({ "context": { "context_window": n } }));
    }
    if let Some(v) = lookup("TETHER_CONDENSE").and_then(|v| parse_bool_like(&v)) {
        deep_merge(&mut root, &json!({ "context": { "condense_enabled": v } }));
    }
    if let Some(mode) = lookup("TETHER_MODE").filter(|m| !m.trim().is_empty()) {
        deep_merge(&mut root, &json!({ "mode": mode.trim().to_lowercase() }));
    }
    root
}

fn parse_bool_like(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn deep_merge(base: &mut Value, overlay: &Value) {
    if overlay.is_null() {
        return;
    }
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            for (key, value) in overlay_map {
                if value.is_null() {
                    continue;
                }
                match base_map.get_mut(key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        base_map.insert(key.clone(), value.clone());
                    }
                }
            }
        }
        (base_value, overlay_value) => {
            *base_value = overlay_value.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn defaults_are_conservative() {
        let config = EngineConfig::default();
        assert!(!config.auto_approval.enabled);
        assert_eq!(config.limits.max_consecutive_mistakes, 3);
        assert_eq!(config.context.reserve_fraction, 0.2);
        assert_eq!(config.mode, Mode::Act);
    }

    #[test]
    fn deep_merge_skips_nulls_and_replaces_scalars() {
        let mut base = json!({"limits": {"max_consecutive_mistakes": 3, "max_repeated_tool_calls": 3}});
        deep_merge(
            &mut base,
            &json!({"limits": {"max_consecutive_mistakes": 7, "max_repeated_tool_calls": null}}),
        );
        assert_eq!(base["limits"]["max_consecutive_mistakes"], 7);
        assert_eq!(base["limits"]["max_repeated_tool_calls"], 3);
    }

    #[test]
    fn env_layer_reads_known_variables() {
        let vars: HashMap<&str, &str> = HashMap::from([
            ("TETHER_AUTO_APPROVE", "yes"),
            ("TETHER_MAX_MISTAKES", "5"),
            ("TETHER_CONTEXT_WINDOW", "not-a-number"),
            ("TETHER_MODE", "Plan"),
        ]);
        let layer = env_layer_from(|key| vars.get(key).map(|v| v.to_string()));
        assert_eq!(layer["auto_approval"]["enabled"], true);
        assert_eq!(layer["limits"]["max_consecutive_mistakes"], 5);
        assert!(layer.get("context").is_none());
        assert_eq!(layer["mode"], "plan");
    }

    #[test]
    fn retry_delay_doubles_and_caps() {
        let retry = RetrySettings {
            auto_retry_attempts: 5,
            base_delay_ms: 100,
            max_delay_ms: 350,
        };
        assert_eq!(retry.delay_ms(1), 100);
        assert_eq!(retry.delay_ms(2), 200);
        assert_eq!(retry.delay_ms(3), 350);
    }

    #[tokio::test]
    async fn layers_merge_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let global = dir.path().join("global.json");
        let project = dir.path().join("project.json");
        std::fs::write(
            &global,
            r#"{"limits": {"max_consecutive_mistakes": 9}, "context": {"condense_enabled": true}}"#,
        )
        .unwrap();
        std::fs::write(&project, r#"{"limits": {"max_consecutive_mistakes": 4}}"#).unwrap();

        let store = ConfigStore::with_global_path(
            &project,
            global,
            Some(json!({"auto_approval": {"max_requests": 2}, "limits": {"max_repeated_tool_calls": 6}})),
        )
        .await
        .unwrap();
        let config = store.get();
        assert_eq!(config.limits.max_consecutive_mistakes, 4);
        assert_eq!(config.limits.max_repeated_tool_calls, 6);
        assert!(config.context.condense_enabled);
        assert_eq!(config.auto_approval.max_requests, 2);
    }

    #[tokio::test]
    async fn missing_or_malformed_files_are_empty_layers() {
        let dir = tempfile::tempdir().unwrap();
        let project = dir.path().join("project.json");
        std::fs::write(&project, "{ not json").unwrap();
        let store = ConfigStore::with_global_path(&project, dir.path().join("absent.json"), None)
            .await
            .unwrap();
        assert_eq!(store.get().retry.auto_retry_attempts, RetrySettings::default().auto_retry_attempts);
    }
}
