//! Function-name lookup for tool-result messages.
//!
//! OpenAI tool messages reference their call by `tool_call_id` only, while
//! Gemini's `functionResponse` needs the function name. The name is recovered
//! from the assistant turns earlier in the same request.

use super::openai_types::ChatMessage;

/// `{id, name}` of one tool call made by an assistant turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ToolCallRecord<'a> {
    pub id: &'a str,
    pub name: &'a str,
}

/// Borrowed view over one request's message history.
#[derive(Debug, Clone, Copy)]
pub struct ToolCallIndex<'a> {
    messages: &'a [ChatMessage],
}

impl<'a> ToolCallIndex<'a> {
    pub fn new(messages: &'a [ChatMessage]) -> Self {
        Self { messages }
    }

    /// Tool-call records of the assistant message at `position`, if any.
    fn records_at(&self, position: usize) -> impl Iterator<Item = ToolCallRecord<'a>> + 'a {
        let calls = match self.messages.get(position) {
            Some(ChatMessage::Assistant {
                tool_calls: Some(calls),
                ..
            }) => calls.as_slice(),
            _ => &[],
        };
        calls.iter().map(|c| ToolCallRecord {
            id: c.id.as_str(),
            name: c.function.name.as_str(),
        })
    }

    /// Name of the function whose call id is `tool_call_id`, searching the
    /// assistant turns before `position` from nearest to oldest.
    pub fn resolve(&self, position: usize, tool_call_id: &str) -> Option<&'a str> {
        let end = position.min(self.messages.len());
        (0..end)
            .rev()
            .find_map(|i| self.records_at(i).find(|r| r.id == tool_call_id))
            .map(|r| r.name)
    }
}
