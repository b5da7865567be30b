use tether_types::{ContentBlock, TextContent, ToolId, ToolParam, ToolUse};

use crate::{ParseError, ParserLimits};

struct OpenParam {
    name: ToolParam,
    value_start: usize,
    overflowed: bool,
}

struct OpenTool {
    tool: ToolUse,
    param: Option<OpenParam>,
}

/// Incremental parser over a growing assistant reply.
///
/// Only characters past the stored cursor are scanned on each call, and the
/// scan state depends solely on the consumed prefix, so any split of the same
/// text into chunks yields the same blocks as a single pass.
pub struct StreamingParser {
    limits: ParserLimits,
    buffer: String,
    cursor: usize,
    completed: Vec<ContentBlock>,
    text_start: usize,
    open_tool: Option<OpenTool>,
    diagnostics: Vec<ParseError>,
}

impl Default for StreamingParser {
    fn default() -> Self {
        Self::new(ParserLimits::default())
    }
}

impl StreamingParser {
    pub fn new(limits: ParserLimits) -> Self {
        Self {
            limits,
            buffer: String::new(),
            cursor: 0,
            completed: Vec::new(),
            text_start: 0,
            open_tool: None,
            diagnostics: Vec::new(),
        }
    }

    pub fn text(&self) -> &str {
        &self.buffer
    }

    /// Non-fatal problems seen so far, such as reset parameter values.
    pub fn diagnostics(&self) -> &[ParseError] {
        &self.diagnostics
    }

    pub fn reset(&mut self) {
        *self = Self::new(self.limits);
    }

    /// Appends a delta and scans it. The buffer is left untouched when the
    /// delta would push it past the configured cap.
    pub fn push(&mut self, delta: &str) -> Result<(), ParseError> {
        let len = self.buffer.len() + delta.len();
        if len > self.limits.max_buffer_bytes {
            return Err(ParseError::BufferOverflow {
                len,
                limit: self.limits.max_buffer_bytes,
            });
        }
        self.buffer.push_str(delta);
        self.advance();
        Ok(())
    }

    /// Parses the full reply received so far. Calling this repeatedly with the
    /// same or a longer text only scans what is new; a text that does not
    /// extend the previous one restarts the scan.
    pub fn update(&mut self, full_text: &str) -> Result<Vec<ContentBlock>, ParseError> {
        if !full_text.starts_with(self.buffer.as_str()) {
            self.reset();
        }
        let delta = &full_text[self.buffer.len()..];
        if !delta.is_empty() {
            self.push(delta)?;
        }
        Ok(self.blocks())
    }

    /// Completed blocks followed by the open block, if any, marked partial.
    pub fn blocks(&self) -> Vec<ContentBlock> {
        let mut blocks = self.completed.clone();
        if let Some(open) = &self.open_tool {
            let mut tool = open.tool.clone();
            if let Some(param) = &open.param {
                let value = if param.overflowed {
                    String::new()
                } else {
                    self.buffer[param.value_start..].trim().to_string()
                };
                tool.params.insert(param.name, value);
            }
            tool.partial = true;
            blocks.push(ContentBlock::ToolUse(tool));
        } else {
            let text = self.buffer[self.text_start..].trim();
            if !text.is_empty() {
                blocks.push(ContentBlock::Text(TextContent {
                    text: text.to_string(),
                    partial: true,
                }));
            }
        }
        blocks
    }

    /// Blocks as they stand once the stream has ended: nothing stays partial.
    pub fn finish(&self) -> Vec<ContentBlock> {
        let mut blocks = self.blocks();
        for block in &mut blocks {
            block.set_partial(false);
        }
        blocks
    }

    fn advance(&mut self) {
        while self.cursor < self.buffer.len() {
            let Some(ch) = self.buffer[self.cursor..].chars().next() else {
                break;
            };
            self.cursor += ch.len_utf8();
            self.step(ch);
        }
    }

    fn step(&mut self, ch: char) {
        let end = self.cursor;
        let consumed = &self.buffer[..end];

        let Some(open) = self.open_tool.as_mut() else {
            if ch != '>' {
                return;
            }
            for id in ToolId::ALL {
                let tag = format!("<{id}>");
                if !consumed.ends_with(&tag) {
                    continue;
                }
                let tag_start = end - tag.len();
                if tag_start < self.text_start {
                    continue;
                }
                let text = self.buffer[self.text_start..tag_start].trim();
                if !text.is_empty() {
                    self.completed.push(ContentBlock::Text(TextContent {
                        text: text.to_string(),
                        partial: false,
                    }));
                }
                self.open_tool = Some(OpenTool {
                    tool: ToolUse::new(id),
                    param: None,
                });
                return;
            }
            return;
        };

        let tool_name = open.tool.name;
        if let Some(param) = open.param.as_mut() {
            if ch == '>' {
                let close = format!("</{}>", param.name);
                if consumed.ends_with(&close)
                    && (param.overflowed || end - close.len() >= param.value_start)
                {
                    let value = if param.overflowed {
                        String::new()
                    } else {
                        self.buffer[param.value_start..end - close.len()]
                            .trim()
                            .to_string()
                    };
                    open.tool.params.insert(param.name, value);
                    open.param = None;
                    return;
                }
                if param.overflowed && consumed.ends_with(&format!("</{tool_name}>")) {
                    open.tool.params.insert(param.name, String::new());
                    open.param = None;
                    self.close_tool(end);
                    return;
                }
            }
            if !param.overflowed && end - param.value_start > self.limits.max_param_bytes {
                param.overflowed = true;
                self.diagnostics.push(ParseError::ParamOverflow {
                    tool: tool_name,
                    param: param.name,
                    limit: self.limits.max_param_bytes,
                });
            }
            return;
        }

        if ch != '>' {
            return;
        }
        for name in tool_name.params() {
            if consumed.ends_with(&format!("<{name}>")) {
                open.param = Some(OpenParam {
                    name: *name,
                    value_start: end,
                    overflowed: false,
                });
                return;
            }
        }
        if consumed.ends_with(&format!("</{tool_name}>")) {
            self.close_tool(end);
        }
    }

    fn close_tool(&mut self, end: usize) {
        if let Some(open) = self.open_tool.take() {
            let mut tool = open.tool;
            tool.partial = false;
            self.completed.push(ContentBlock::ToolUse(tool));
        }
        self.text_start = end;
    }
}
