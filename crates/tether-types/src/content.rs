use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::tool::{ToolId, ToolParam};

/// One unit of parsed assistant output.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentBlock {
    Text(TextContent),
    ToolUse(ToolUse),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextContent {
    pub text: String,
    pub partial: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ToolUse {
    pub name: ToolId,
    #[serde(default)]
    pub params: BTreeMap<ToolParam, String>,
    pub partial: bool,
}

impl ContentBlock {
    pub fn is_partial(&self) -> bool {
        match self {
            ContentBlock::Text(text) => text.partial,
            ContentBlock::ToolUse(tool) => tool.partial,
        }
    }

    pub fn set_partial(&mut self, partial: bool) {
        match self {
            ContentBlock::Text(text) => text.partial = partial,
            ContentBlock::ToolUse(tool) => tool.partial = partial,
        }
    }

    pub fn as_tool_use(&self) -> Option<&ToolUse> {
        match self {
            ContentBlock::ToolUse(tool) => Some(tool),
            ContentBlock::Text(_) => None,
        }
    }
}

impl ToolUse {
    pub fn new(name: ToolId) -> Self {
        Self {
            name,
            params: BTreeMap::new(),
            partial: true,
        }
    }

    pub fn param(&self, name: ToolParam) -> Option<&str> {
        self.params.get(&name).map(String::as_str)
    }

    /// Required parameters that are absent or blank.
    pub fn missing_required(&self) -> Vec<ToolParam> {
        self.name
            .required_params()
            .iter()
            .copied()
            .filter(|p| self.param(*p).map(str::trim).unwrap_or("").is_empty())
            .collect()
    }

    /// Renders the invocation back into tag form, as the model wrote it.
    pub fn to_tag_text(&self) -> String {
        let mut out = format!("<{}>\n", self.name);
        for (param, value) in &self.params {
            out.push_str(&format!("<{param}>{value}</{param}>\n"));
        }
        out.push_str(&format!("</{}>", self.name));
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_required_ignores_blank_values() {
        let mut tool = ToolUse::new(ToolId::WriteToFile);
        tool.params.insert(ToolParam::Path, "a.txt".to_string());
        tool.params.insert(ToolParam::Content, "   ".to_string());
        assert_eq!(tool.missing_required(), vec![ToolParam::Content]);
    }

    #[test]
    fn tag_text_lists_params() {
        let mut tool = ToolUse::new(ToolId::ReadFile);
        tool.params.insert(ToolParam::Path, "src/lib.rs".to_string());
        assert_eq!(
            tool.to_tag_text(),
            "<read_file>\n<path>src/lib.rs</path>\n</read_file>"
        );
    }
}
