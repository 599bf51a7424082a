//! Google ("Gemini API") dispatcher.
//!
//! Key rotation interplay: a fresh key is acquired per attempt unless the
//! prompt carries an uploaded-file handle, in which case the pinned key is
//! reused for every attempt (uploads are bound to the key that created them).

use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{info, warn};

use tandem_core::config::GROUNDING_SEPARATOR;
use tandem_keys::{KeyErrorKind, KeyPool, KeyPoolError};

use crate::backend::{Backend, GenConfig};
use crate::outcome::{Outcome, Usage};
use crate::prompt::{MediaPart, Prompt, Role};

const BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";
const MAX_ATTEMPTS: u32 = 3;
/// Rule between the reply and the reasoning part of thinking models.
const THINKING_RULE: &str = "---";
/// Model families hidden from the model list.
const HIDDEN_MODELS: [&str; 4] = ["bison", "aqa", "embedding", "gecko"];

const SAFETY_CATEGORIES: [&str; 5] = [
    "HARM_CATEGORY_SEXUALLY_EXPLICIT",
    "HARM_CATEGORY_HATE_SPEECH",
    "HARM_CATEGORY_HARASSMENT",
    "HARM_CATEGORY_DANGEROUS_CONTENT",
    "HARM_CATEGORY_CIVIC_INTEGRITY",
];

pub struct GoogleDispatcher {
    client: reqwest::Client,
    /// Grounded requests may route through a dedicated proxy.
    grounding_client: reqwest::Client,
    keys: Arc<KeyPool>,
}

impl GoogleDispatcher {
    pub fn new(
        keys: Arc<KeyPool>,
        proxy: Option<&str>,
        grounding_proxy: Option<&str>,
    ) -> Result<Self, reqwest::Error> {
        let client = build_client(proxy)?;
        let grounding_client = match grounding_proxy.or(proxy) {
            Some(url) => build_client(Some(url))?,
            None => client.clone(),
        };
        Ok(Self {
            client,
            grounding_client,
            keys,
        })
    }

    fn client_for(&self, cfg: &GenConfig) -> &reqwest::Client {
        if cfg.g_web_search {
            &self.grounding_client
        } else {
            &self.client
        }
    }

    fn acquire_key(&self, prompt: &Prompt, grounding: bool) -> Result<String, Outcome> {
        if let Some(pinned) = &prompt.pinned_key {
            return Ok(pinned.clone());
        }
        self.keys.acquire(grounding).map_err(|e| match e {
            KeyPoolError::OutOfBillingKeys => Outcome::BillingExhausted,
            _ => Outcome::QuotaExhausted,
        })
    }
}

fn build_client(proxy: Option<&str>) -> Result<reqwest::Client, reqwest::Error> {
    let mut builder = reqwest::Client::builder();
    if let Some(url) = proxy {
        builder = builder.proxy(reqwest::Proxy::all(url)?);
    }
    builder.build()
}

#[async_trait]
impl Backend for GoogleDispatcher {
    fn name(&self) -> &'static str {
        "google"
    }

    fn model<'a>(&self, cfg: &'a GenConfig) -> &'a str {
        &cfg.g_model
    }

    async fn generate(&self, prompt: &Prompt, cfg: &GenConfig, request_id: u32) -> Outcome {
        let grounding = cfg.g_web_search;
        let url = format!("{BASE_URL}/models/{}:generateContent", cfg.g_model);
        let body = build_request_body(prompt, cfg);
        let media_locked = prompt.pinned_key.is_some();
        if media_locked {
            info!(request_id, "prompt references uploaded media, key rotation suppressed");
        }

        let mut last = Outcome::Unknown {
            message: "no attempts made".to_string(),
            timeout: false,
        };

        for attempt in 1..=MAX_ATTEMPTS {
            let key = match self.acquire_key(prompt, grounding) {
                Ok(k) => k,
                Err(outcome) => return outcome,
            };

            info!(request_id, attempt, max = MAX_ATTEMPTS, "generating");

            let resp = match self
                .client_for(cfg)
                .post(&url)
                .header("x-goog-api-key", &key)
                .json(&body)
                .send()
                .await
            {
                Ok(r) => r,
                Err(e) => {
                    warn!(request_id, error = %e, "transport error");
                    self.keys.handle_error(&key, KeyErrorKind::Server, grounding);
                    last = Outcome::Unknown {
                        message: e.to_string(),
                        timeout: e.is_timeout(),
                    };
                    if media_locked {
                        return last;
                    }
                    continue;
                }
            };

            let status = resp.status();
            let parsed: ApiResponse = match resp.json().await {
                Ok(p) => p,
                Err(e) => {
                    // Content-type mismatches happen on proxy interference;
                    // log and treat like a transient failure.
                    warn!(request_id, error = %e, "failed to decode response body");
                    last = Outcome::Unknown {
                        message: e.to_string(),
                        timeout: false,
                    };
                    if media_locked {
                        return last;
                    }
                    continue;
                }
            };

            if !status.is_success() {
                let kind = classify_error(parsed.error.as_ref());
                last = error_outcome(parsed.error.as_ref());
                let should_retry = self.keys.handle_error(&key, kind, grounding);
                if !should_retry || media_locked {
                    return last;
                }
                continue;
            }

            return decode_response(parsed, cfg);
        }

        last
    }

    async fn count_tokens(&self, prompt: &Prompt, cfg: &GenConfig) -> Option<i64> {
        let key = self.acquire_key(prompt, false).ok()?;
        let url = format!("{BASE_URL}/models/{}:countTokens", cfg.g_model);
        let body = serde_json::json!({ "contents": build_contents(prompt) });

        let resp = self
            .client
            .post(&url)
            .header("x-goog-api-key", &key)
            .json(&body)
            .send()
            .await
            .ok()?;
        let value: serde_json::Value = resp.json().await.ok()?;
        value.get("totalTokens").and_then(|t| t.as_i64())
    }

    async fn list_models(&self) -> Vec<String> {
        let key = match self.keys.acquire(false) {
            Ok(k) => k,
            Err(_) => return Vec::new(),
        };
        let resp = self
            .client
            .get(format!("{BASE_URL}/models"))
            .header("x-goog-api-key", &key)
            .send()
            .await;
        let value: serde_json::Value = match resp {
            Ok(r) => match r.json().await {
                Ok(v) => v,
                Err(_) => return Vec::new(),
            },
            Err(e) => {
                warn!(error = %e, "failed to list models");
                return Vec::new();
            }
        };

        value
            .get("models")
            .and_then(|m| m.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("name").and_then(|n| n.as_str()))
                    .filter(|name| !HIDDEN_MODELS.iter().any(|h| name.contains(h)))
                    .map(|name| name.trim_start_matches("models/").to_string())
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// Build the generateContent request body. System turns fold into
/// `systemInstruction`; media parts attach to the final turn.
pub(crate) fn build_request_body(prompt: &Prompt, cfg: &GenConfig) -> serde_json::Value {
    let threshold = format!("BLOCK_{}", cfg.g_safety_threshold.to_uppercase());
    let safety_settings: Vec<serde_json::Value> = SAFETY_CATEGORIES
        .iter()
        .map(|category| {
            serde_json::json!({
                "category": category,
                "threshold": threshold,
            })
        })
        .collect();

    let mut body = serde_json::json!({
        "contents": build_contents(prompt),
        "safetySettings": safety_settings,
        "generationConfig": {
            "temperature": cfg.g_temperature,
            "topP": cfg.g_top_p,
            "topK": cfg.g_top_k,
            "maxOutputTokens": cfg.max_output_tokens,
        },
    });

    let mut system_text = prompt.system.clone().unwrap_or_default();
    for turn in prompt.turns.iter().filter(|t| t.role == Role::System) {
        if !system_text.is_empty() {
            system_text.push('\n');
        }
        system_text.push_str(&turn.text);
    }
    if !system_text.is_empty() {
        body["systemInstruction"] = serde_json::json!({ "parts": [{ "text": system_text }] });
    }

    // Grounding and code execution are mutually exclusive; grounding wins.
    if cfg.g_web_search {
        body["tools"] = serde_json::json!([{
            "google_search_retrieval": {
                "mode": "MODE_DYNAMIC",
                "dynamic_threshold": cfg.g_web_threshold,
            }
        }]);
    } else if cfg.g_code_execution {
        body["tools"] = serde_json::json!([{ "code_execution": {} }]);
    }

    body
}

/// Render user/model turns as `contents`, appending any resolved media as
/// extra parts of the final turn.
fn build_contents(prompt: &Prompt) -> Vec<serde_json::Value> {
    let mut contents: Vec<serde_json::Value> = prompt
        .turns
        .iter()
        .filter(|t| t.role != Role::System)
        .map(|t| {
            let role = match t.role {
                Role::Assistant => "model",
                _ => "user",
            };
            serde_json::json!({ "role": role, "parts": [{ "text": t.text }] })
        })
        .collect();

    if let (Some(media), Some(last)) = (&prompt.media, contents.last_mut()) {
        let part = match media {
            MediaPart::InlinePhoto { data } => serde_json::json!({
                "inline_data": { "mime_type": "image/jpeg", "data": data }
            }),
            MediaPart::FileHandle { mime_type, uri } => serde_json::json!({
                "file_data": { "mime_type": mime_type, "file_uri": uri }
            }),
        };
        if let Some(parts) = last.get_mut("parts").and_then(|p| p.as_array_mut()) {
            parts.push(part);
        }
    }

    contents
}

fn classify_error(error: Option<&ApiError>) -> KeyErrorKind {
    let Some(error) = error else {
        return KeyErrorKind::Server;
    };
    match error.status.as_deref() {
        Some("RESOURCE_EXHAUSTED") => KeyErrorKind::Quota,
        Some("PERMISSION_DENIED") | Some("UNAUTHENTICATED") => KeyErrorKind::Invalid,
        Some("INVALID_ARGUMENT") => {
            // An invalid credential also surfaces as INVALID_ARGUMENT.
            let message = error.message.as_deref().unwrap_or("");
            if message.contains("API key") {
                KeyErrorKind::Invalid
            } else {
                KeyErrorKind::Other
            }
        }
        Some("UNAVAILABLE") | Some("INTERNAL") => KeyErrorKind::Server,
        _ => KeyErrorKind::Server,
    }
}

fn error_outcome(error: Option<&ApiError>) -> Outcome {
    let Some(error) = error else {
        return Outcome::Unknown {
            message: "non-success status without error body".to_string(),
            timeout: false,
        };
    };
    match error.status.as_deref() {
        Some("RESOURCE_EXHAUSTED") => Outcome::QuotaExhausted,
        Some("NO_BILLING") => Outcome::BillingExhausted,
        Some("UNAVAILABLE") => Outcome::Unavailable,
        Some("INTERNAL") => Outcome::Internal,
        Some("INVALID_ARGUMENT") => Outcome::InvalidArgument {
            message: error.message.clone().unwrap_or_default(),
        },
        other => Outcome::Unknown {
            message: format!(
                "{}: {}",
                other.unwrap_or("UNKNOWN"),
                error.message.as_deref().unwrap_or("")
            ),
            timeout: false,
        },
    }
}

/// Decode a 200 response in spec precedence order: embedded error, prompt
/// feedback, finish reason, then text extraction with thinking-model and
/// grounding-metadata handling.
pub(crate) fn decode_response(resp: ApiResponse, cfg: &GenConfig) -> Outcome {
    if resp.error.is_some() {
        return error_outcome(resp.error.as_ref());
    }

    if let Some(feedback) = &resp.prompt_feedback {
        if matches!(
            feedback.block_reason.as_deref(),
            Some("OTHER") | Some("PROHIBITED_CONTENT")
        ) {
            return Outcome::Censored {
                reason: format!(
                    "prompt blocked: {}",
                    feedback.block_reason.as_deref().unwrap_or("")
                ),
                details: Vec::new(),
            };
        }
    }

    let Some(candidate) = resp.candidates.and_then(|mut c| {
        if c.is_empty() {
            None
        } else {
            Some(c.remove(0))
        }
    }) else {
        return Outcome::Unknown {
            message: "response carries no candidates".to_string(),
            timeout: false,
        };
    };

    match candidate.finish_reason.as_deref() {
        Some("SAFETY") | Some("OTHER") => {
            let details = candidate
                .safety_ratings
                .unwrap_or_default()
                .into_iter()
                .filter(|r| r.probability != "NEGLIGIBLE")
                .map(|r| format!("{}: {}", r.category, r.probability))
                .collect();
            return Outcome::Censored {
                reason: format!(
                    "finish reason {}",
                    candidate.finish_reason.as_deref().unwrap_or("")
                ),
                details,
            };
        }
        Some("PROHIBITED_CONTENT") => {
            return Outcome::Censored {
                reason: "prohibited content".to_string(),
                details: Vec::new(),
            };
        }
        Some("RECITATION") => {
            let details = candidate
                .citation_metadata
                .and_then(|m| m.citation_sources)
                .unwrap_or_default()
                .into_iter()
                .filter_map(|s| s.uri)
                .collect();
            return Outcome::Censored {
                reason: "recitation".to_string(),
                details,
            };
        }
        _ => {}
    }

    let parts: Vec<String> = candidate
        .content
        .and_then(|c| c.parts)
        .unwrap_or_default()
        .into_iter()
        .filter_map(|p| p.text)
        .filter(|t| !t.is_empty())
        .collect();

    if parts.is_empty() {
        return Outcome::Unknown {
            message: "candidate carries no text parts".to_string(),
            timeout: false,
        };
    }

    // Thinking variants return the reasoning as the first part and the
    // reply as the last.
    let is_thinking = cfg.g_model.contains("thinking") && parts.len() > 1;
    let mut text = if is_thinking {
        parts.last().cloned().unwrap_or_default()
    } else {
        parts.join("\n")
    };
    if is_thinking && cfg.g_show_thinking {
        text = format!("{text}\n\n{THINKING_RULE}\n{}", parts[0]);
    }

    if let Some(grounding) = candidate.grounding_metadata {
        if let Some(appendix) = grounding_appendix(&grounding, cfg) {
            text.push_str(&appendix);
        }
    }

    let usage = resp
        .usage_metadata
        .map(|u| Usage {
            prompt_tokens: u.prompt_token_count.unwrap_or(0),
            completion_tokens: u.candidates_token_count.unwrap_or(0),
            total_tokens: u.total_token_count.unwrap_or(0),
        })
        .unwrap_or_default();

    Outcome::Text { text, usage }
}

/// Search queries and source links appended below the separator; everything
/// after the separator is stripped before the reply is persisted.
fn grounding_appendix(meta: &GroundingMetadata, cfg: &GenConfig) -> Option<String> {
    let mut lines: Vec<String> = Vec::new();

    if cfg.g_web_show_queries {
        if let Some(queries) = &meta.web_search_queries {
            if !queries.is_empty() {
                lines.push(format!("Search queries: {}", queries.join(", ")));
            }
        }
    }
    if cfg.g_web_show_sources {
        if let Some(chunks) = &meta.grounding_chunks {
            for chunk in chunks {
                if let Some(web) = &chunk.web {
                    if let Some(uri) = &web.uri {
                        match &web.title {
                            Some(title) => lines.push(format!("{title}: {uri}")),
                            None => lines.push(uri.clone()),
                        }
                    }
                }
            }
        }
    }

    if lines.is_empty() {
        return None;
    }
    Some(format!("\n\n{GROUNDING_SEPARATOR}\n{}", lines.join("\n")))
}

// generateContent response shapes (the subset the decoder touches).

#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) error: Option<ApiError>,
    #[serde(rename = "promptFeedback")]
    pub(crate) prompt_feedback: Option<PromptFeedback>,
    pub(crate) candidates: Option<Vec<Candidate>>,
    #[serde(rename = "usageMetadata")]
    pub(crate) usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiError {
    pub(crate) status: Option<String>,
    pub(crate) message: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct PromptFeedback {
    #[serde(rename = "blockReason")]
    pub(crate) block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Candidate {
    pub(crate) content: Option<Content>,
    #[serde(rename = "finishReason")]
    pub(crate) finish_reason: Option<String>,
    #[serde(rename = "safetyRatings")]
    pub(crate) safety_ratings: Option<Vec<SafetyRating>>,
    #[serde(rename = "citationMetadata")]
    pub(crate) citation_metadata: Option<CitationMetadata>,
    #[serde(rename = "groundingMetadata")]
    pub(crate) grounding_metadata: Option<GroundingMetadata>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Content {
    pub(crate) parts: Option<Vec<Part>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Part {
    pub(crate) text: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct SafetyRating {
    pub(crate) category: String,
    pub(crate) probability: String,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CitationMetadata {
    #[serde(rename = "citationSources")]
    pub(crate) citation_sources: Option<Vec<CitationSource>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct CitationSource {
    pub(crate) uri: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GroundingMetadata {
    #[serde(rename = "webSearchQueries")]
    pub(crate) web_search_queries: Option<Vec<String>>,
    #[serde(rename = "groundingChunks")]
    pub(crate) grounding_chunks: Option<Vec<GroundingChunk>>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct GroundingChunk {
    pub(crate) web: Option<WebSource>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct WebSource {
    pub(crate) uri: Option<String>,
    pub(crate) title: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct UsageMetadata {
    #[serde(rename = "promptTokenCount")]
    pub(crate) prompt_token_count: Option<i64>,
    #[serde(rename = "candidatesTokenCount")]
    pub(crate) candidates_token_count: Option<i64>,
    #[serde(rename = "totalTokenCount")]
    pub(crate) total_token_count: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::prompt::Turn;

    fn cfg() -> GenConfig {
        GenConfig {
            max_output_tokens: 1024,
            g_model: "gemini-1.5-pro-latest".to_string(),
            g_safety_threshold: "none".to_string(),
            g_temperature: 1.0,
            g_top_p: 0.95,
            g_top_k: 40,
            g_code_execution: false,
            g_web_search: false,
            g_web_threshold: 0.73,
            g_web_show_queries: true,
            g_web_show_sources: true,
            g_show_thinking: false,
            o_model: "gpt-4o".to_string(),
            o_url: None,
            o_key: None,
            o_temperature: 1.0,
            o_top_p: 1.0,
            o_frequency_penalty: 0.0,
            o_presence_penalty: 0.0,
            o_timeout_secs: 60,
            o_vision: true,
            o_log_prompt: false,
        }
    }

    fn prompt() -> Prompt {
        Prompt {
            system: Some("Be helpful.".to_string()),
            turns: vec![
                Turn {
                    role: Role::User,
                    text: "Alice: hello".to_string(),
                },
                Turn {
                    role: Role::Assistant,
                    text: "hi".to_string(),
                },
                Turn {
                    role: Role::User,
                    text: "Alice: what time?".to_string(),
                },
            ],
            media: None,
            pinned_key: None,
        }
    }

    fn decode_json(json: serde_json::Value, cfg: &GenConfig) -> Outcome {
        decode_response(serde_json::from_value(json).unwrap(), cfg)
    }

    #[test]
    fn body_has_five_safety_settings_with_threshold() {
        let body = build_request_body(&prompt(), &cfg());
        let settings = body["safetySettings"].as_array().unwrap();
        assert_eq!(settings.len(), 5);
        for s in settings {
            assert_eq!(s["threshold"], "BLOCK_NONE");
        }
    }

    #[test]
    fn body_roles_map_assistant_to_model() {
        let body = build_request_body(&prompt(), &cfg());
        let contents = body["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[2]["role"], "user");
        assert_eq!(
            body["systemInstruction"]["parts"][0]["text"],
            "Be helpful."
        );
    }

    #[test]
    fn grounding_tool_excludes_code_execution() {
        let mut c = cfg();
        c.g_web_search = true;
        c.g_code_execution = true;
        let body = build_request_body(&prompt(), &c);
        let tools = body["tools"].as_array().unwrap();
        assert_eq!(tools.len(), 1);
        assert_eq!(
            tools[0]["google_search_retrieval"]["mode"],
            "MODE_DYNAMIC"
        );
        assert_eq!(
            tools[0]["google_search_retrieval"]["dynamic_threshold"],
            0.73
        );
    }

    #[test]
    fn code_execution_tool_when_grounding_off() {
        let mut c = cfg();
        c.g_code_execution = true;
        let body = build_request_body(&prompt(), &c);
        assert!(body["tools"][0].get("code_execution").is_some());
    }

    #[test]
    fn media_parts_attach_to_final_turn() {
        let mut p = prompt();
        p.media = Some(MediaPart::FileHandle {
            mime_type: "application/pdf".to_string(),
            uri: "https://files.example/abc".to_string(),
        });
        let body = build_request_body(&p, &cfg());
        let last_parts = body["contents"][2]["parts"].as_array().unwrap();
        assert_eq!(last_parts.len(), 2);
        assert_eq!(last_parts[1]["file_data"]["mime_type"], "application/pdf");

        p.media = Some(MediaPart::InlinePhoto {
            data: "QUJD".to_string(),
        });
        let body = build_request_body(&p, &cfg());
        let last_parts = body["contents"][2]["parts"].as_array().unwrap();
        assert_eq!(last_parts[1]["inline_data"]["mime_type"], "image/jpeg");
    }

    #[test]
    fn decodes_plain_text_with_usage() {
        let outcome = decode_json(
            serde_json::json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "It is noon." }] },
                    "finishReason": "STOP"
                }],
                "usageMetadata": {
                    "promptTokenCount": 120,
                    "candidatesTokenCount": 8,
                    "totalTokenCount": 128
                }
            }),
            &cfg(),
        );
        assert_eq!(
            outcome,
            Outcome::Text {
                text: "It is noon.".to_string(),
                usage: Usage {
                    prompt_tokens: 120,
                    completion_tokens: 8,
                    total_tokens: 128
                }
            }
        );
    }

    #[test]
    fn error_status_takes_precedence() {
        let outcome = decode_json(
            serde_json::json!({
                "error": { "status": "RESOURCE_EXHAUSTED", "message": "quota" },
                "candidates": [{ "content": { "parts": [{ "text": "ignored" }] } }]
            }),
            &cfg(),
        );
        assert_eq!(outcome, Outcome::QuotaExhausted);
    }

    #[test]
    fn bespoke_no_billing_maps_to_billing_exhausted() {
        let outcome = decode_json(
            serde_json::json!({ "error": { "status": "NO_BILLING", "message": "" } }),
            &cfg(),
        );
        assert_eq!(outcome, Outcome::BillingExhausted);
    }

    #[test]
    fn prompt_feedback_block_is_censored() {
        let outcome = decode_json(
            serde_json::json!({
                "promptFeedback": { "blockReason": "PROHIBITED_CONTENT" }
            }),
            &cfg(),
        );
        assert!(matches!(outcome, Outcome::Censored { .. }));
    }

    #[test]
    fn safety_finish_filters_negligible_ratings() {
        let outcome = decode_json(
            serde_json::json!({
                "candidates": [{
                    "finishReason": "SAFETY",
                    "safetyRatings": [
                        { "category": "HARM_CATEGORY_HARASSMENT", "probability": "HIGH" },
                        { "category": "HARM_CATEGORY_HATE_SPEECH", "probability": "NEGLIGIBLE" }
                    ]
                }]
            }),
            &cfg(),
        );
        match outcome {
            Outcome::Censored { details, .. } => {
                assert_eq!(details, vec!["HARM_CATEGORY_HARASSMENT: HIGH"]);
            }
            other => panic!("expected Censored, got {other:?}"),
        }
    }

    #[test]
    fn recitation_carries_citation_uris() {
        let outcome = decode_json(
            serde_json::json!({
                "candidates": [{
                    "finishReason": "RECITATION",
                    "citationMetadata": {
                        "citationSources": [{ "uri": "https://example.com/a" }]
                    }
                }]
            }),
            &cfg(),
        );
        match outcome {
            Outcome::Censored { details, .. } => {
                assert_eq!(details, vec!["https://example.com/a"]);
            }
            other => panic!("expected Censored, got {other:?}"),
        }
    }

    #[test]
    fn thinking_model_takes_last_part() {
        let mut c = cfg();
        c.g_model = "gemini-2.0-flash-thinking-exp".to_string();
        let json = serde_json::json!({
            "candidates": [{
                "content": { "parts": [
                    { "text": "reasoning trace" },
                    { "text": "final answer" }
                ]},
                "finishReason": "STOP"
            }]
        });

        match decode_json(json.clone(), &c) {
            Outcome::Text { text, .. } => assert_eq!(text, "final answer"),
            other => panic!("expected Text, got {other:?}"),
        }

        c.g_show_thinking = true;
        match decode_json(json, &c) {
            Outcome::Text { text, .. } => {
                assert!(text.starts_with("final answer"));
                assert!(text.contains(THINKING_RULE));
                assert!(text.ends_with("reasoning trace"));
            }
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn grounding_metadata_appends_below_separator() {
        let outcome = decode_json(
            serde_json::json!({
                "candidates": [{
                    "content": { "parts": [{ "text": "Answer." }] },
                    "finishReason": "STOP",
                    "groundingMetadata": {
                        "webSearchQueries": ["time in utc"],
                        "groundingChunks": [
                            { "web": { "uri": "https://time.example", "title": "Time" } }
                        ]
                    }
                }]
            }),
            &cfg(),
        );
        match outcome {
            Outcome::Text { text, .. } => {
                assert!(text.starts_with("Answer."));
                assert!(text.contains(GROUNDING_SEPARATOR));
                assert!(text.contains("Search queries: time in utc"));
                assert!(text.contains("Time: https://time.example"));
            }
            other => panic!("expected Text, got {other:?}"),
        }
    }

    #[test]
    fn grounding_appendix_respects_flags() {
        let mut c = cfg();
        c.g_web_show_queries = false;
        c.g_web_show_sources = false;
        let meta = GroundingMetadata {
            web_search_queries: Some(vec!["q".to_string()]),
            grounding_chunks: None,
        };
        assert!(grounding_appendix(&meta, &c).is_none());
    }

    #[test]
    fn invalid_argument_surfaces_message() {
        let outcome = decode_json(
            serde_json::json!({
                "error": { "status": "INVALID_ARGUMENT", "message": "bad tool config" }
            }),
            &cfg(),
        );
        assert_eq!(
            outcome,
            Outcome::InvalidArgument {
                message: "bad tool config".to_string()
            }
        );
    }

    #[test]
    fn pinned_key_suppresses_rotation() {
        use std::io::Write;

        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"AIzaSyAAA111\nAIzaSyBBB222\n").unwrap();
        let pool = std::sync::Arc::new(
            tandem_keys::KeyPool::from_file(f.path().to_str().unwrap(), None).unwrap(),
        );
        let dispatcher = GoogleDispatcher::new(pool, None, None).unwrap();

        let mut p = prompt();
        p.pinned_key = Some("AIzaSyPIN000".to_string());
        for _ in 0..5 {
            assert_eq!(
                dispatcher.acquire_key(&p, false).unwrap(),
                "AIzaSyPIN000"
            );
        }
    }

    #[test]
    fn empty_billing_pool_maps_to_billing_exhausted() {
        use std::io::Write;

        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(b"AIzaSyAAA111\n").unwrap();
        let pool = std::sync::Arc::new(
            tandem_keys::KeyPool::from_file(f.path().to_str().unwrap(), None).unwrap(),
        );
        let dispatcher = GoogleDispatcher::new(pool, None, None).unwrap();

        match dispatcher.acquire_key(&prompt(), true) {
            Err(outcome) => assert_eq!(outcome, Outcome::BillingExhausted),
            Ok(k) => panic!("expected BillingExhausted, got key {k}"),
        }
    }

    #[test]
    fn classify_invalid_key_message() {
        let err = ApiError {
            status: Some("INVALID_ARGUMENT".to_string()),
            message: Some("API key not valid. Please pass a valid API key.".to_string()),
        };
        assert_eq!(classify_error(Some(&err)), KeyErrorKind::Invalid);

        let err = ApiError {
            status: Some("INVALID_ARGUMENT".to_string()),
            message: Some("Unknown field".to_string()),
        };
        assert_eq!(classify_error(Some(&err)), KeyErrorKind::Other);
    }
}
