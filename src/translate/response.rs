use super::gemini_types::{Candidate, GenerateContentResponse, ListModelsResponse, Part};
use super::openai_types::{
    ChatCompletionResponse, ChatToolCall, ChatToolCallFunction, ChatUsage, Choice, ChoiceMessage,
};
use serde::{Deserialize, Serialize};

/// Translate a Gemini `generateContent` response into an `OpenAI` chat completion.
/// Pure function: `model` is reported back as the response model.
pub fn gemini_to_openai(resp: &GenerateContentResponse, model: &str) -> ChatCompletionResponse {
    let choices = resp
        .candidates
        .iter()
        .enumerate()
        .map(|(position, candidate)| {
            translate_candidate(candidate_index(position, candidate), candidate)
        })
        .collect();

    ChatCompletionResponse {
        id: new_completion_id(),
        object: "chat.completion".to_string(),
        created: chrono::Utc::now().timestamp(),
        model: model.to_string(),
        choices,
        usage: ChatUsage::default(),
    }
}

fn translate_candidate(index: u32, candidate: &Candidate) -> Choice {
    let (text, calls) = split_parts(candidate);
    let tool_calls: Vec<ChatToolCall> = calls
        .into_iter()
        .map(|(name, args)| ChatToolCall {
            id: new_tool_call_id(),
            call_type: "function".to_string(),
            function: ChatToolCallFunction {
                name: name.to_string(),
                arguments: encode_arguments(args),
            },
        })
        .collect();

    let finish_reason = if tool_calls.is_empty() {
        map_finish_reason(candidate.finish_reason.as_deref())
    } else {
        "tool_calls"
    };

    Choice {
        index,
        message: ChoiceMessage {
            role: "assistant".to_string(),
            content: text,
            tool_calls: if tool_calls.is_empty() {
                None
            } else {
                Some(tool_calls)
            },
        },
        finish_reason: finish_reason.to_string(),
    }
}

/// The candidate's own `index`, falling back to its position in the response.
pub(crate) fn candidate_index(position: usize, candidate: &Candidate) -> u32 {
    candidate
        .index
        .unwrap_or_else(|| u32::try_from(position).unwrap_or(u32::MAX))
}

/// Concatenated text (if any) and the function calls of a candidate, in part order.
pub(crate) fn split_parts(candidate: &Candidate) -> (Option<String>, Vec<(&str, &serde_json::Value)>) {
    let mut text: Option<String> = None;
    let mut calls = Vec::new();

    let parts = candidate
        .content
        .as_ref()
        .map(|c| c.parts.as_slice())
        .unwrap_or_default();

    for part in parts {
        match part {
            Part::Text { text: t } => text.get_or_insert_with(String::new).push_str(t),
            Part::FunctionCall { function_call } => {
                calls.push((function_call.name.as_str(), &function_call.args));
            }
            Part::InlineData { .. } | Part::FunctionResponse { .. } | Part::Other(_) => {}
        }
    }

    (text.filter(|t| !t.is_empty()), calls)
}

pub(crate) fn encode_arguments(args: &serde_json::Value) -> String {
    if args.is_null() {
        return "{}".to_string();
    }
    serde_json::to_string(args).unwrap_or_else(|_| "{}".to_string())
}

/// Map a Gemini `finishReason` to an `OpenAI` `finish_reason`.
/// Anything other than `MAX_TOKENS` is reported as a normal stop.
pub fn map_finish_reason(reason: Option<&str>) -> &'static str {
    match reason {
        Some("MAX_TOKENS") => "length",
        _ => "stop",
    }
}

/// Gemini does not identify tool calls, so every call gets a fresh id.
pub fn new_tool_call_id() -> String {
    let hex = uuid::Uuid::new_v4().simple().to_string();
    format!("call_{}", &hex[..8])
}

pub fn new_completion_id() -> String {
    format!("chatcmpl-{}", uuid::Uuid::new_v4())
}

// ---------------------------------------------------------------------------
// Model listing
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelList {
    pub object: String,
    pub data: Vec<ModelEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelEntry {
    pub id: String,
    pub object: String,
    pub created: i64,
    pub owned_by: String,
}

/// Translate a Gemini model listing into an `OpenAI` model list.
pub fn gemini_models_to_openai(resp: &ListModelsResponse) -> ModelList {
    let created = chrono::Utc::now().timestamp();
    ModelList {
        object: "list".to_string(),
        data: resp
            .models
            .iter()
            .map(|m| ModelEntry {
                id: m.name.trim_start_matches("models/").to_string(),
                object: "model".to_string(),
                created,
                owned_by: "google".to_string(),
            })
            .collect(),
    }
}
