//! Tool-tag parsing for streamed assistant replies.
//!
//! Replies interleave prose with tool invocations written as
//! `<tool_name><param>value</param></tool_name>`. [`StreamingParser`] turns
//! the growing reply into [`ContentBlock`]s without rescanning consumed text.

mod display;
mod stream;

use thiserror::Error;

use tether_types::{ContentBlock, ToolId, ToolParam};

pub use display::clean_text_for_display;
pub use stream::StreamingParser;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParserLimits {
    pub max_buffer_bytes: usize,
    pub max_param_bytes: usize,
}

impl Default for ParserLimits {
    fn default() -> Self {
        Self {
            max_buffer_bytes: 4 * 1024 * 1024,
            max_param_bytes: 1024 * 1024,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("assistant reply of {len} bytes exceeds the {limit} byte limit")]
    BufferOverflow { len: usize, limit: usize },
    #[error("parameter `{param}` of `{tool}` exceeded {limit} bytes and was discarded")]
    ParamOverflow {
        tool: ToolId,
        param: ToolParam,
        limit: usize,
    },
}

/// One-shot parse of a complete or partial reply.
pub fn parse_assistant_message(
    text: &str,
    limits: ParserLimits,
) -> Result<Vec<ContentBlock>, ParseError> {
    let mut parser = StreamingParser::new(limits);
    parser.push(text)?;
    Ok(parser.blocks())
}
