use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::tool::{ToolId, ToolParam};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum MessagePart {
    Text {
        text: String,
    },
    Image {
        media_type: String,
        data: String,
    },
    ToolUse {
        id: String,
        name: ToolId,
        #[serde(default)]
        params: BTreeMap<ToolParam, String>,
    },
    ToolResult {
        tool_use_id: String,
        name: ToolId,
        content: String,
        #[serde(default)]
        is_error: bool,
    },
}

impl MessagePart {
    pub fn text(text: impl Into<String>) -> Self {
        MessagePart::Text { text: text.into() }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            MessagePart::Text { text } => Some(text),
            _ => None,
        }
    }
}

/// One entry of the model-facing conversation history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub role: MessageRole,
    pub parts: Vec<MessagePart>,
    pub created_at: DateTime<Utc>,
}

impl Message {
    pub fn new(role: MessageRole, parts: Vec<MessagePart>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            role,
            parts,
            created_at: Utc::now(),
        }
    }

    pub fn user_text(text: impl Into<String>) -> Self {
        Self::new(MessageRole::User, vec![MessagePart::text(text)])
    }

    pub fn assistant_text(text: impl Into<String>) -> Self {
        Self::new(MessageRole::Assistant, vec![MessagePart::text(text)])
    }

    /// Concatenated text of every text and tool-result part.
    pub fn flattened_text(&self) -> String {
        let mut out = String::new();
        for part in &self.parts {
            let chunk = match part {
                MessagePart::Text { text } => text.as_str(),
                MessagePart::ToolResult { content, .. } => content.as_str(),
                MessagePart::Image { .. } | MessagePart::ToolUse { .. } => continue,
            };
            if !out.is_empty() {
                out.push('\n');
            }
            out.push_str(chunk);
        }
        out
    }

    pub fn tool_use_ids(&self) -> Vec<(String, ToolId)> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::ToolUse { id, name, .. } => Some((id.clone(), *name)),
                _ => None,
            })
            .collect()
    }

    pub fn tool_result_ids(&self) -> Vec<String> {
        self.parts
            .iter()
            .filter_map(|part| match part {
                MessagePart::ToolResult { tool_use_id, .. } => Some(tool_use_id.clone()),
                _ => None,
            })
            .collect()
    }
}
