use crate::error::{ProxyError, Result};
use crate::forwarder::{api_key_headers, passthrough_request_headers, UpstreamResponse, UpstreamStream};
use crate::logging::RequestLogger;
use crate::server::AppState;
use crate::translate::gemini_types::{GenerateContentResponse, ListModelsResponse};
use crate::translate::openai_types::{ChatCompletionRequest, ChatCompletionResponse, ChatErrorResponse};
use crate::translate::request::openai_to_gemini;
use crate::translate::response::{gemini_models_to_openai, gemini_to_openai, ModelList};
use crate::translate::streaming::{ReframeOptions, StreamFrame, StreamReframer};

use axum::http::{HeaderMap, Method};
use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};
use std::pin::Pin;

/// Outcome of a translated call: either our own response, or an upstream
/// refusal to relay verbatim.
pub enum ProxyResult<T> {
    Success(T),
    Upstream(UpstreamResponse),
}

/// Frames for one streaming chat completion, always ending with `Done`.
pub type FrameStream = Pin<Box<dyn Stream<Item = StreamFrame> + Send>>;

/// Translate a non-streaming chat completion and call `generateContent`.
pub async fn proxy_chat_completion(
    req: &ChatCompletionRequest,
    api_key: &str,
    state: &AppState,
    log: &RequestLogger,
) -> Result<ProxyResult<ChatCompletionResponse>> {
    let model = state.models.resolve(&req.model);
    let payload = openai_to_gemini(req, state.images.as_ref()).await?;
    let path = state.forwarder.generate_path(&model);

    log.info("proxy", format!("POST {} model={}", path, model));

    let body = Bytes::from(serde_json::to_vec(&payload)?);
    let response = state
        .forwarder
        .send_unary(Method::POST, &path, api_key_headers(api_key)?, &[], body)
        .await?;

    log.debug(
        "proxy",
        format!("Response status={} body_len={}", response.status, response.body.len()),
    );

    if !response.is_success() {
        log.warn(
            "proxy",
            format!(
                "Upstream returned status {}: {}",
                response.status,
                truncate(&String::from_utf8_lossy(&response.body), 500)
            ),
        );
        return Ok(ProxyResult::Upstream(response));
    }

    let gemini: GenerateContentResponse = serde_json::from_slice(&response.body).map_err(|e| {
        ProxyError::translation(format!(
            "Failed to parse upstream response: {}. Body: {}",
            e,
            truncate(&String::from_utf8_lossy(&response.body), 300)
        ))
    })?;

    let completion = gemini_to_openai(&gemini, &model);
    log.info(
        "proxy",
        format!(
            "Completed: candidates={} finish_reason={}",
            completion.choices.len(),
            completion
                .choices
                .first()
                .map_or("none", |c| c.finish_reason.as_str())
        ),
    );

    Ok(ProxyResult::Success(completion))
}

/// Translate a streaming chat completion and call `streamGenerateContent`.
///
/// Translation errors are returned before any frame is produced. Failures
/// after that point, including an unreachable upstream, become an error
/// frame followed by `Done`.
pub async fn proxy_chat_completion_stream(
    req: &ChatCompletionRequest,
    api_key: &str,
    state: &AppState,
    log: &RequestLogger,
) -> Result<FrameStream> {
    let model = state.models.resolve(&req.model);
    let payload = openai_to_gemini(req, state.images.as_ref()).await?;
    let path = state.forwarder.stream_generate_path(&model);

    log.info("proxy", format!("POST {} model={} (streaming)", path, model));

    let body = Bytes::from(serde_json::to_vec(&payload)?);
    let upstream = match state
        .forwarder
        .send_streaming(Method::POST, &path, api_key_headers(api_key)?, &[], body)
        .await
    {
        Ok(upstream) => upstream,
        Err(e) => {
            log.error("proxy", format!("Streaming request failed: {}", e));
            return Ok(frames(vec![
                StreamFrame::Error(ChatErrorResponse::new("upstream_error", e.to_string())),
                StreamFrame::Done,
            ]));
        }
    };

    if !upstream.is_success() {
        let status = upstream.status;
        let body = read_rejected_body(upstream, log).await;
        let body = String::from_utf8_lossy(&body);
        log.warn(
            "proxy",
            format!("Streaming error status={}: {}", status, truncate(&body, 300)),
        );
        return Ok(frames(StreamReframer::upstream_rejected(status, &body)));
    }

    let options = ReframeOptions::from(&state.config.stream);
    Ok(Box::pin(reframe_stream(upstream, model, options, log.clone())))
}

/// Body of a refused stream. A read failure is logged and yields an empty body.
async fn read_rejected_body(upstream: UpstreamStream, log: &RequestLogger) -> Bytes {
    match upstream.collect_body().await {
        Ok(body) => body,
        Err(e) => {
            log.warn("proxy", format!("Failed to read rejected stream body: {}", e));
            Bytes::new()
        }
    }
}

fn frames(frames: Vec<StreamFrame>) -> FrameStream {
    Box::pin(stream::iter(frames))
}

/// Drive a [`StreamReframer`] over the upstream body. The upstream is read
/// only when the consumer polls for the next frame.
fn reframe_stream(
    upstream: UpstreamStream,
    model: String,
    options: ReframeOptions,
    log: RequestLogger,
) -> impl Stream<Item = StreamFrame> + Send + 'static {
    async_stream::stream! {
        let mut reframer = StreamReframer::new(&model, options);
        let mut body = upstream.body;

        while let Some(chunk_result) = body.next().await {
            let chunk = match chunk_result {
                Ok(c) => c,
                Err(e) => {
                    log.error("stream", format!("Byte stream error: {}", e));
                    yield StreamFrame::Error(ChatErrorResponse::new("upstream_error", e.to_string()));
                    break;
                }
            };

            for frame in reframer.feed(&chunk) {
                yield frame;
            }

            if reframer.is_aborted() {
                log.error("stream", "Stream aborted: buffer limit exceeded");
                break;
            }
        }

        yield reframer.finish();

        log.info(
            "stream",
            format!(
                "Stream completed: chunks={} dropped={}",
                reframer.chunks_emitted(),
                reframer.fragments_dropped()
            ),
        );
    }
}

/// Fetch the Gemini model listing and convert it to an `OpenAI` model list.
pub async fn proxy_list_models(
    api_key: &str,
    state: &AppState,
    log: &RequestLogger,
) -> Result<ProxyResult<ModelList>> {
    let path = state.forwarder.models_path();
    log.info("proxy", format!("GET {}", path));

    let response = state
        .forwarder
        .send_unary(Method::GET, &path, api_key_headers(api_key)?, &[], Bytes::new())
        .await?;

    if !response.is_success() {
        log.warn("proxy", format!("Model listing failed with status {}", response.status));
        return Ok(ProxyResult::Upstream(response));
    }

    let listing: ListModelsResponse = serde_json::from_slice(&response.body).map_err(|e| {
        ProxyError::translation(format!("Failed to parse model listing: {}", e))
    })?;

    Ok(ProxyResult::Success(gemini_models_to_openai(&listing)))
}

/// Native model listing. The key travels in a header; any `key` query
/// parameter is dropped so it does not leak into upstream URLs.
pub async fn proxy_native_models(
    api_key: &str,
    query: &[(String, String)],
    state: &AppState,
    log: &RequestLogger,
) -> Result<UpstreamStream> {
    let path = state.forwarder.models_path();
    let query: Vec<(String, String)> = query
        .iter()
        .filter(|(k, _)| k != crate::credentials::KEY_QUERY_PARAM)
        .cloned()
        .collect();

    log.info("proxy", format!("Native GET {}", path));

    state
        .forwarder
        .send_streaming(Method::GET, &path, api_key_headers(api_key)?, &query, Bytes::new())
        .await
}

/// Forward a native Gemini request unchanged apart from header cleanup.
pub async fn proxy_passthrough(
    method: Method,
    path: &str,
    headers: &HeaderMap,
    query: &[(String, String)],
    body: Bytes,
    state: &AppState,
    log: &RequestLogger,
) -> Result<UpstreamStream> {
    let path = format!("/v1beta/{}", path.trim_start_matches('/'));
    log.info("proxy", format!("Passthrough {} {}", method, path));

    let upstream = state
        .forwarder
        .send_streaming(method, &path, passthrough_request_headers(headers)?, query, body)
        .await?;

    log.info("proxy", format!("Passthrough response: status={}", upstream.status));
    Ok(upstream)
}

fn truncate(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}
