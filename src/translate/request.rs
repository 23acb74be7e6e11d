//! Translate `OpenAI` Chat Completions requests into Gemini `generateContent` payloads.
//!
//! Handles system instructions, multi-part user content (text, inline and remote
//! images), assistant tool calls, tool results and tool-choice mapping. Remote
//! images are the only I/O: they are fetched through an [`ImageFetcher`] and a
//! failed fetch drops that single part.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde_json::json;

use super::gemini_types::{
    Content, ContentRole, FunctionCallingConfig, FunctionCallingMode, FunctionDeclaration,
    GeminiTool, GenerateContentRequest, GenerationConfig, Part, ToolConfig,
};
use super::openai_types::{
    ChatCompletionRequest, ChatMessage, ChatTool, ChatToolCall, ChatToolChoice, ContentPart,
    ImageSource, MessageContent, StopSequences,
};
use super::tool_index::ToolCallIndex;
use crate::error::{ProxyError, Result};
use crate::fetch::ImageFetcher;

pub const DEFAULT_IMAGE_MIME: &str = "image/jpeg";

/// Media types recognised in a data URI header, checked in order.
const KNOWN_IMAGE_MIMES: &[&str] = &["image/png", "image/jpeg", "image/webp", "image/heic"];

/// Key under which tool output is wrapped in a `functionResponse`.
pub const FUNCTION_RESPONSE_KEY: &str = "content";

pub const TOOL_OUTPUT_PREFIX: &str = "Tool output: ";

/// Translate an `OpenAI` chat request into a Gemini `generateContent` payload.
///
/// # Errors
/// Returns `ProxyError::MalformedRequest` if an assistant tool call carries
/// arguments that are not valid JSON.
pub async fn openai_to_gemini(
    req: &ChatCompletionRequest,
    images: &dyn ImageFetcher,
) -> Result<GenerateContentRequest> {
    let index = ToolCallIndex::new(&req.messages);
    let mut contents = Vec::with_capacity(req.messages.len());
    let mut system_instruction = None;

    for (position, msg) in req.messages.iter().enumerate() {
        match msg {
            ChatMessage::System { content, .. } => {
                system_instruction = Some(translate_system(content));
            }
            ChatMessage::User { content, .. } => {
                contents.push(translate_user(content, images).await);
            }
            ChatMessage::Assistant {
                content,
                tool_calls,
            } => {
                contents.push(translate_assistant(
                    content.as_ref(),
                    tool_calls.as_deref().unwrap_or_default(),
                )?);
            }
            ChatMessage::Tool {
                content,
                tool_call_id,
                name,
            } => {
                contents.push(translate_tool(
                    &index,
                    position,
                    content,
                    tool_call_id.as_deref(),
                    name.as_deref(),
                ));
            }
        }
    }

    let tools = req.tools.as_deref().and_then(translate_tools);
    let tool_config = (tools.is_some() || req.tool_choice.is_some())
        .then(|| translate_tool_choice(req.tool_choice.as_ref()));

    Ok(GenerateContentRequest {
        contents,
        generation_config: GenerationConfig {
            temperature: req.temperature,
            top_p: req.top_p,
            max_output_tokens: req.max_tokens,
            stop_sequences: normalize_stop(req.stop.as_ref()),
        },
        tools,
        tool_config,
        system_instruction,
    })
}

fn translate_system(content: &MessageContent) -> Content {
    Content {
        role: None,
        parts: vec![Part::text(content.text())],
    }
}

async fn translate_user(content: &MessageContent, images: &dyn ImageFetcher) -> Content {
    let mut parts = Vec::new();

    for part in content.parts() {
        match part {
            ContentPart::Text { text } => parts.push(Part::text(text)),
            ContentPart::ImageUrl { image_url } => match image_url.source() {
                ImageSource::Inline { header, data } => {
                    if !data.is_empty() {
                        parts.push(Part::inline_data(mime_from_data_uri(header), data));
                    }
                }
                ImageSource::Remote(url) => match images.fetch(url).await {
                    Ok(image) => {
                        let mime = image
                            .content_type
                            .as_deref()
                            .and_then(media_type)
                            .unwrap_or(DEFAULT_IMAGE_MIME);
                        parts.push(Part::inline_data(mime, BASE64.encode(&image.bytes)));
                    }
                    Err(e) => {
                        tracing::warn!(url, error = %e, "Dropping image part that could not be fetched");
                    }
                },
            },
        }
    }

    Content::new(ContentRole::User, parts)
}

/// Function calls first, then any text, all in one `model` turn.
fn translate_assistant(content: Option<&MessageContent>, tool_calls: &[ChatToolCall]) -> Result<Content> {
    let mut parts = Vec::with_capacity(tool_calls.len() + 1);

    for call in tool_calls {
        let args = parse_arguments(call)?;
        parts.push(Part::function_call(call.function.name.clone(), args));
    }

    if let Some(text) = content.map(MessageContent::text).filter(|t| !t.is_empty()) {
        parts.push(Part::text(text));
    }

    Ok(Content::new(ContentRole::Model, parts))
}

fn parse_arguments(call: &ChatToolCall) -> Result<serde_json::Value> {
    let raw = call.function.arguments.trim();
    if raw.is_empty() {
        return Ok(json!({}));
    }
    serde_json::from_str(raw).map_err(|e| {
        ProxyError::malformed(format!(
            "tool call '{}' has invalid JSON arguments: {e}",
            call.id
        ))
    })
}

fn translate_tool(
    index: &ToolCallIndex<'_>,
    position: usize,
    content: &MessageContent,
    tool_call_id: Option<&str>,
    name: Option<&str>,
) -> Content {
    let output = content.text();

    let function_name = name
        .filter(|n| !n.is_empty())
        .or_else(|| tool_call_id.and_then(|id| index.resolve(position, id)));

    match function_name {
        Some(function_name) => Content::new(
            ContentRole::Function,
            vec![Part::function_response(
                function_name,
                json!({ FUNCTION_RESPONSE_KEY: output }),
            )],
        ),
        None => {
            tracing::debug!(
                tool_call_id = tool_call_id.unwrap_or("-"),
                "No function name for tool message, sending as user text"
            );
            Content::new(
                ContentRole::User,
                vec![Part::text(format!("{TOOL_OUTPUT_PREFIX}{output}"))],
            )
        }
    }
}

/// MIME type named in a data URI header such as `data:image/png;base64`.
pub fn mime_from_data_uri(header: &str) -> &'static str {
    KNOWN_IMAGE_MIMES
        .iter()
        .copied()
        .find(|mime| header.contains(mime))
        .unwrap_or(DEFAULT_IMAGE_MIME)
}

/// `image/png; charset=binary` -> `image/png`
fn media_type(content_type: &str) -> Option<&str> {
    content_type
        .split(';')
        .next()
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

pub fn normalize_stop(stop: Option<&StopSequences>) -> Option<Vec<String>> {
    match stop? {
        StopSequences::Single(s) if s.is_empty() => None,
        StopSequences::Single(s) => Some(vec![s.clone()]),
        StopSequences::Many(v) if v.is_empty() => None,
        StopSequences::Many(v) => Some(v.clone()),
    }
}

fn translate_tools(tools: &[ChatTool]) -> Option<Vec<GeminiTool>> {
    let declarations: Vec<FunctionDeclaration> = tools
        .iter()
        .filter(|t| t.tool_type == "function")
        .map(|t| FunctionDeclaration {
            name: t.function.name.clone(),
            description: t.function.description.clone(),
            parameters: t.function.parameters.clone(),
        })
        .collect();

    if declarations.is_empty() {
        None
    } else {
        Some(vec![GeminiTool {
            function_declarations: declarations,
        }])
    }
}

pub fn translate_tool_choice(choice: Option<&ChatToolChoice>) -> ToolConfig {
    let (mode, allowed_function_names) = match choice {
        None => (FunctionCallingMode::Auto, None),
        Some(ChatToolChoice::Mode(mode)) => match mode.as_str() {
            "none" => (FunctionCallingMode::None, None),
            "required" => (FunctionCallingMode::Any, None),
            _ => (FunctionCallingMode::Auto, None),
        },
        Some(ChatToolChoice::Function(forced)) if forced.choice_type == "function" => (
            FunctionCallingMode::Any,
            Some(vec![forced.function.name.clone()]),
        ),
        Some(ChatToolChoice::Function(_)) => (FunctionCallingMode::Auto, None),
    };

    ToolConfig {
        function_calling_config: FunctionCallingConfig {
            mode,
            allowed_function_names,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetch::FetchedImage;
    use crate::translate::openai_types::*;
    use async_trait::async_trait;
    use bytes::Bytes;
    use std::collections::HashMap;

    struct StubFetcher(HashMap<String, FetchedImage>);

    #[async_trait]
    impl ImageFetcher for StubFetcher {
        async fn fetch(&self, url: &str) -> Result<FetchedImage> {
            self.0
                .get(url)
                .cloned()
                .ok_or_else(|| ProxyError::transport(format!("404 for {url}")))
        }
    }

    fn no_images() -> StubFetcher {
        StubFetcher(HashMap::new())
    }

    fn request(messages: Vec<ChatMessage>) -> ChatCompletionRequest {
        ChatCompletionRequest {
            model: "gemini-1.5-flash".to_string(),
            messages,
            temperature: None,
            top_p: None,
            max_tokens: None,
            stop: None,
            tools: None,
            tool_choice: None,
            stream: None,
        }
    }

    fn system(text: &str) -> ChatMessage {
        ChatMessage::System {
            content: MessageContent::Text(text.to_string()),
            name: None,
        }
    }

    fn user(text: &str) -> ChatMessage {
        ChatMessage::User {
            content: MessageContent::Text(text.to_string()),
            name: None,
        }
    }

    fn user_image(url: &str) -> ChatMessage {
        ChatMessage::User {
            content: MessageContent::Parts(vec![
                ContentPart::Text {
                    text: "what is this?".to_string(),
                },
                ContentPart::ImageUrl {
                    image_url: ImageUrlDetail {
                        url: url.to_string(),
                        detail: None,
                    },
                },
            ]),
            name: None,
        }
    }

    fn assistant_call(id: &str, name: &str, args: &str, text: Option<&str>) -> ChatMessage {
        ChatMessage::Assistant {
            content: text.map(|t| MessageContent::Text(t.to_string())),
            tool_calls: Some(vec![ChatToolCall {
                id: id.to_string(),
                call_type: "function".to_string(),
                function: ChatToolCallFunction {
                    name: name.to_string(),
                    arguments: args.to_string(),
                },
            }]),
        }
    }

    fn tool_result(id: &str, content: &str) -> ChatMessage {
        ChatMessage::Tool {
            content: MessageContent::Text(content.to_string()),
            tool_call_id: Some(id.to_string()),
            name: None,
        }
    }

    #[tokio::test]
    async fn test_simple_text_request() {
        let mut req = request(vec![system("You are helpful"), user("Hello")]);
        req.temperature = Some(0.2);
        req.top_p = Some(0.9);
        req.max_tokens = Some(256);

        let result = openai_to_gemini(&req, &no_images()).await.unwrap();

        assert_eq!(result.contents.len(), 1);
        assert_eq!(result.contents[0].role, Some(ContentRole::User));
        assert_eq!(result.contents[0].parts, vec![Part::text("Hello")]);
        assert_eq!(
            result.system_instruction.unwrap().parts,
            vec![Part::text("You are helpful")]
        );
        assert_eq!(result.generation_config.temperature, Some(0.2));
        assert_eq!(result.generation_config.top_p, Some(0.9));
        assert_eq!(result.generation_config.max_output_tokens, Some(256));
        assert!(result.tools.is_none());
        assert!(result.tool_config.is_none());
    }

    #[tokio::test]
    async fn test_last_system_message_wins() {
        let req = request(vec![system("first"), user("hi"), system("second")]);
        let result = openai_to_gemini(&req, &no_images()).await.unwrap();
        assert_eq!(
            result.system_instruction.unwrap().parts,
            vec![Part::text("second")]
        );
        assert_eq!(result.contents.len(), 1);
    }

    #[test]
    fn test_stop_normalization() {
        assert_eq!(normalize_stop(None), None);
        assert_eq!(
            normalize_stop(Some(&StopSequences::Single("x".to_string()))),
            Some(vec!["x".to_string()])
        );
        assert_eq!(
            normalize_stop(Some(&StopSequences::Many(vec![
                "a".to_string(),
                "b".to_string()
            ]))),
            Some(vec!["a".to_string(), "b".to_string()])
        );
        assert_eq!(normalize_stop(Some(&StopSequences::Single(String::new()))), None);
    }

    #[tokio::test]
    async fn test_tool_result_resolves_function_name() {
        let req = request(vec![
            user("what is 6*7?"),
            assistant_call("call_1", "foo", "{\"x\":6}", None),
            tool_result("call_1", "42"),
        ]);

        let result = openai_to_gemini(&req, &no_images()).await.unwrap();

        assert_eq!(result.contents.len(), 3);
        assert_eq!(result.contents[2].role, Some(ContentRole::Function));
        assert_eq!(
            result.contents[2].parts,
            vec![Part::function_response("foo", json!({"content": "42"}))]
        );
    }

    #[tokio::test]
    async fn test_explicit_tool_name_is_used() {
        let req = request(vec![ChatMessage::Tool {
            content: MessageContent::Text("sunny".to_string()),
            tool_call_id: Some("call_unknown".to_string()),
            name: Some("get_weather".to_string()),
        }]);

        let result = openai_to_gemini(&req, &no_images()).await.unwrap();
        assert_eq!(
            result.contents[0].parts,
            vec![Part::function_response("get_weather", json!({"content": "sunny"}))]
        );
    }

    #[tokio::test]
    async fn test_unresolved_tool_falls_back_to_user_text() {
        let req = request(vec![
            assistant_call("call_1", "foo", "{}", None),
            tool_result("call_other", "42"),
        ]);

        let result = openai_to_gemini(&req, &no_images()).await.unwrap();

        assert_eq!(result.contents.len(), 2);
        assert_eq!(result.contents[1].role, Some(ContentRole::User));
        assert_eq!(result.contents[1].parts, vec![Part::text("Tool output: 42")]);
    }

    #[tokio::test]
    async fn test_assistant_function_calls_precede_text() {
        let req = request(vec![assistant_call(
            "call_1",
            "lookup",
            "{\"q\":\"rust\"}",
            Some("Let me check."),
        )]);

        let result = openai_to_gemini(&req, &no_images()).await.unwrap();
        let turn = &result.contents[0];
        assert_eq!(turn.role, Some(ContentRole::Model));
        assert_eq!(
            turn.parts,
            vec![
                Part::function_call("lookup", json!({"q": "rust"})),
                Part::text("Let me check."),
            ]
        );
    }

    #[tokio::test]
    async fn test_empty_arguments_become_empty_object() {
        let req = request(vec![assistant_call("call_1", "now", "", None)]);
        let result = openai_to_gemini(&req, &no_images()).await.unwrap();
        assert_eq!(result.contents[0].parts, vec![Part::function_call("now", json!({}))]);
    }

    #[tokio::test]
    async fn test_invalid_arguments_rejected() {
        let req = request(vec![assistant_call("call_1", "foo", "{not json", None)]);
        let err = openai_to_gemini(&req, &no_images()).await.unwrap_err();
        assert!(matches!(err, ProxyError::MalformedRequest { .. }));
    }

    #[tokio::test]
    async fn test_inline_png_passes_through() {
        let req = request(vec![user_image("data:image/png;base64,QUJD")]);
        let result = openai_to_gemini(&req, &no_images()).await.unwrap();
        assert_eq!(
            result.contents[0].parts,
            vec![Part::text("what is this?"), Part::inline_data("image/png", "QUJD")]
        );
    }

    #[test]
    fn test_data_uri_mime_detection() {
        assert_eq!(mime_from_data_uri("data:image/heic;base64"), "image/heic");
        assert_eq!(mime_from_data_uri("data:image/webp;base64"), "image/webp");
        assert_eq!(mime_from_data_uri("data:image/gif;base64"), "image/jpeg");
    }

    #[tokio::test]
    async fn test_remote_image_is_fetched_and_encoded() {
        let mut images = HashMap::new();
        images.insert(
            "https://example.com/a.webp".to_string(),
            FetchedImage {
                bytes: Bytes::from_static(b"ABC"),
                content_type: Some("image/webp; charset=binary".to_string()),
            },
        );
        images.insert(
            "https://example.com/raw".to_string(),
            FetchedImage {
                bytes: Bytes::from_static(b"ABC"),
                content_type: None,
            },
        );

        let req = request(vec![
            user_image("https://example.com/a.webp"),
            user_image("https://example.com/raw"),
        ]);
        let result = openai_to_gemini(&req, &StubFetcher(images)).await.unwrap();

        assert_eq!(result.contents[0].parts[1], Part::inline_data("image/webp", "QUJD"));
        assert_eq!(result.contents[1].parts[1], Part::inline_data("image/jpeg", "QUJD"));
    }

    #[tokio::test]
    async fn test_failed_image_fetch_drops_part() {
        let req = request(vec![user_image("https://example.com/missing.png")]);
        let result = openai_to_gemini(&req, &no_images()).await.unwrap();
        assert_eq!(result.contents[0].parts, vec![Part::text("what is this?")]);
    }

    #[test]
    fn test_tool_choice_table() {
        let mode = |c: Option<ChatToolChoice>| translate_tool_choice(c.as_ref()).function_calling_config;

        assert_eq!(mode(None).mode, FunctionCallingMode::Auto);
        assert_eq!(
            mode(Some(ChatToolChoice::Mode("auto".to_string()))).mode,
            FunctionCallingMode::Auto
        );
        assert_eq!(
            mode(Some(ChatToolChoice::Mode("none".to_string()))).mode,
            FunctionCallingMode::None
        );
        assert_eq!(
            mode(Some(ChatToolChoice::Mode("required".to_string()))).mode,
            FunctionCallingMode::Any
        );

        let forced = mode(Some(ChatToolChoice::Function(ChatToolChoiceFunction {
            choice_type: "function".to_string(),
            function: ChatFunctionName {
                name: "get_weather".to_string(),
            },
        })));
        assert_eq!(forced.mode, FunctionCallingMode::Any);
        assert_eq!(forced.allowed_function_names, Some(vec!["get_weather".to_string()]));
    }

    #[tokio::test]
    async fn test_tools_wrapped_in_single_group() {
        let mut req = request(vec![user("weather?")]);
        req.tools = Some(vec![
            ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: "get_weather".to_string(),
                    description: Some("Current weather".to_string()),
                    parameters: Some(json!({"type": "object"})),
                },
            },
            ChatTool {
                tool_type: "function".to_string(),
                function: ChatFunction {
                    name: "get_time".to_string(),
                    description: None,
                    parameters: None,
                },
            },
        ]);

        let result = openai_to_gemini(&req, &no_images()).await.unwrap();
        let tools = result.tools.unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(tools[0].function_declarations.len(), 2);
        assert_eq!(tools[0].function_declarations[1].name, "get_time");
        assert_eq!(
            result.tool_config.unwrap().function_calling_config.mode,
            FunctionCallingMode::Auto
        );
    }
}
