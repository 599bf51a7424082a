//! OpenAI-compatible dispatcher.
//!
//! Single attempt, single key: retry and fallback policy live in the
//! orchestrator. Per-chat `o_url` / `o_key` override the process defaults.

use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tracing::{debug, warn};

use crate::backend::{Backend, GenConfig};
use crate::outcome::{Outcome, Usage};
use crate::prompt::{MediaPart, Prompt, Role};
use crate::tokens;

/// Marker injected by reverse proxies into otherwise-200 bodies.
const PROXY_ERROR_MARKER: &str = "oai-proxy-error";

pub struct OpenAiDispatcher {
    client: reqwest::Client,
    default_url: Option<String>,
    default_key: Option<String>,
}

impl OpenAiDispatcher {
    pub fn new(default_url: Option<String>, default_key: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            default_url,
            default_key,
        }
    }

    fn base_url<'a>(&'a self, cfg: &'a GenConfig) -> Option<&'a str> {
        cfg.o_url
            .as_deref()
            .or(self.default_url.as_deref())
            .map(|u| u.trim_end_matches('/'))
    }

    fn api_key<'a>(&'a self, cfg: &'a GenConfig) -> &'a str {
        cfg.o_key
            .as_deref()
            .or(self.default_key.as_deref())
            .unwrap_or("")
    }
}

#[async_trait]
impl Backend for OpenAiDispatcher {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn model<'a>(&self, cfg: &'a GenConfig) -> &'a str {
        &cfg.o_model
    }

    async fn generate(&self, prompt: &Prompt, cfg: &GenConfig, request_id: u32) -> Outcome {
        let Some(base) = self.base_url(cfg) else {
            return Outcome::Unknown {
                message: "no OpenAI endpoint configured".to_string(),
                timeout: false,
            };
        };
        let url = format!("{base}/v1/chat/completions");
        let body = build_request_body(prompt, cfg, base);

        if cfg.o_log_prompt {
            debug!(request_id, body = %body, "assembled request");
        }
        debug!(request_id, url = %url, model = %cfg.o_model, "sending request");

        let resp = self
            .client
            .post(&url)
            .bearer_auth(self.api_key(cfg))
            .header("content-type", "application/json")
            .json(&body)
            .timeout(Duration::from_secs(cfg.o_timeout_secs.max(1) as u64))
            .send()
            .await;

        let resp = match resp {
            Ok(r) => r,
            Err(e) => {
                warn!(request_id, error = %e, "request failed");
                return Outcome::Unknown {
                    message: e.to_string(),
                    timeout: e.is_timeout(),
                };
            }
        };

        let parsed: ApiResponse = match resp.json().await {
            Ok(p) => p,
            Err(e) => {
                warn!(request_id, error = %e, "failed to decode response body");
                return Outcome::Unknown {
                    message: e.to_string(),
                    timeout: false,
                };
            }
        };

        decode_response(parsed)
    }

    async fn count_tokens(&self, prompt: &Prompt, cfg: &GenConfig) -> Option<i64> {
        Some(tokens::estimate_tokens(&prompt.plain_text(), &cfg.o_model))
    }

    async fn list_models(&self) -> Vec<String> {
        let Some(base) = self.default_url.as_deref() else {
            return Vec::new();
        };
        let url = format!("{}/v1/models", base.trim_end_matches('/'));
        let resp = self
            .client
            .get(&url)
            .bearer_auth(self.default_key.as_deref().unwrap_or(""))
            .timeout(Duration::from_secs(5))
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
            .get("data")
            .and_then(|d| d.as_array())
            .map(|models| {
                models
                    .iter()
                    .filter_map(|m| m.get("id").and_then(|i| i.as_str()))
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    }
}

/// The `o1` model family rejects sampling penalties and renames the output
/// cap, except when the URL points at a local tunnel that fronts a
/// non-OpenAI server.
fn is_o1_family(model: &str, base_url: &str) -> bool {
    model.starts_with("o1") && !base_url.contains("localhost") && !base_url.contains("127.0.0.1")
}

pub(crate) fn build_request_body(
    prompt: &Prompt,
    cfg: &GenConfig,
    base_url: &str,
) -> serde_json::Value {
    let mut messages: Vec<serde_json::Value> = Vec::new();
    if let Some(system) = &prompt.system {
        messages.push(serde_json::json!({ "role": "system", "content": system }));
    }

    let last_index = prompt.turns.len().saturating_sub(1);
    for (i, turn) in prompt.turns.iter().enumerate() {
        let role = match turn.role {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::System => "system",
        };

        // Photos attach to the final turn as a data-URL content part.
        // Non-image media is not representable on this shape and is omitted.
        let is_final_with_photo = i == last_index
            && cfg.o_vision
            && matches!(prompt.media, Some(MediaPart::InlinePhoto { .. }));
        if is_final_with_photo {
            if let Some(MediaPart::InlinePhoto { data }) = &prompt.media {
                messages.push(serde_json::json!({
                    "role": role,
                    "content": [
                        { "type": "text", "text": turn.text },
                        {
                            "type": "image_url",
                            "image_url": { "url": format!("data:image/jpeg;base64,{data}") }
                        }
                    ]
                }));
                continue;
            }
        }
        messages.push(serde_json::json!({ "role": role, "content": turn.text }));
    }

    let mut body = serde_json::json!({
        "model": cfg.o_model,
        "messages": messages,
        "temperature": cfg.o_temperature,
        "top_p": cfg.o_top_p,
        "frequency_penalty": cfg.o_frequency_penalty,
        "presence_penalty": cfg.o_presence_penalty,
    });

    if is_o1_family(&cfg.o_model, base_url) {
        body["max_completion_tokens"] = serde_json::json!(cfg.max_output_tokens);
    } else {
        body["max_tokens"] = serde_json::json!(cfg.max_output_tokens);
    }

    body
}

pub(crate) fn decode_response(resp: ApiResponse) -> Outcome {
    if let Some(error) = resp.error {
        return Outcome::Unknown {
            message: error.message.unwrap_or_else(|| "endpoint error".to_string()),
            timeout: false,
        };
    }

    let choice = match resp.choices.and_then(|mut c| {
        if c.is_empty() {
            None
        } else {
            Some(c.remove(0))
        }
    }) {
        Some(c) => c,
        None => {
            return Outcome::Unknown {
                message: "response carries no choices".to_string(),
                timeout: false,
            }
        }
    };

    if choice.finish_reason.as_deref() == Some("length") {
        return Outcome::Unknown {
            message: "the reply hit max-output-tokens before completing".to_string(),
            timeout: false,
        };
    }

    let content = choice
        .message
        .and_then(|m| m.content)
        .unwrap_or_default();

    if content.is_empty() {
        return Outcome::Unknown {
            message: "response carries no content".to_string(),
            timeout: false,
        };
    }
    if content.contains(PROXY_ERROR_MARKER) {
        debug!(content = %content, "proxy-level failure marker in content");
        return Outcome::Unknown {
            message: "the endpoint's proxy reported a failure".to_string(),
            timeout: false,
        };
    }

    let usage = resp
        .usage
        .map(|u| Usage {
            prompt_tokens: u.prompt_tokens.unwrap_or(0),
            completion_tokens: u.completion_tokens.unwrap_or(0),
            total_tokens: u.total_tokens.unwrap_or(0),
        })
        .unwrap_or_default();

    Outcome::Text {
        text: content,
        usage,
    }
}

// Chat-completions response shapes.

#[derive(Debug, Deserialize)]
pub(crate) struct ApiResponse {
    pub(crate) choices: Option<Vec<Choice>>,
    pub(crate) usage: Option<ApiUsage>,
    pub(crate) error: Option<ApiError>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct Choice {
    pub(crate) message: Option<ChoiceMessage>,
    pub(crate) finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ChoiceMessage {
    pub(crate) content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiUsage {
    pub(crate) prompt_tokens: Option<i64>,
    pub(crate) completion_tokens: Option<i64>,
    pub(crate) total_tokens: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub(crate) struct ApiError {
    pub(crate) message: Option<String>,
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
            o_temperature: 0.7,
            o_top_p: 1.0,
            o_frequency_penalty: 0.1,
            o_presence_penalty: 0.2,
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
                    text: "Name: hello".to_string(),
                },
                Turn {
                    role: Role::Assistant,
                    text: "hi".to_string(),
                },
                Turn {
                    role: Role::User,
                    text: "Name: what time?".to_string(),
                },
            ],
            media: None,
            pinned_key: None,
        }
    }

    fn decode_json(json: serde_json::Value) -> Outcome {
        decode_response(serde_json::from_value(json).unwrap())
    }

    #[test]
    fn body_carries_sampling_params_and_messages() {
        let body = build_request_body(&prompt(), &cfg(), "https://api.openai.com");
        assert_eq!(body["model"], "gpt-4o");
        assert_eq!(body["temperature"], 0.7);
        assert_eq!(body["frequency_penalty"], 0.1);
        assert_eq!(body["presence_penalty"], 0.2);
        assert_eq!(body["max_tokens"], 1024);
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["role"], "system");
        assert_eq!(messages[3]["role"], "user");
        assert_eq!(messages[3]["content"], "Name: what time?");
    }

    #[test]
    fn o1_family_substitutes_max_completion_tokens() {
        let mut c = cfg();
        c.o_model = "o1-preview".to_string();
        let body = build_request_body(&prompt(), &c, "https://api.openai.com");
        assert_eq!(body["max_completion_tokens"], 1024);
        assert!(body.get("max_tokens").is_none());

        // A local tunnel keeps the standard field even for o1-named models.
        let body = build_request_body(&prompt(), &c, "http://localhost:5001");
        assert_eq!(body["max_tokens"], 1024);
        assert!(body.get("max_completion_tokens").is_none());
    }

    #[test]
    fn photo_becomes_image_url_part_on_final_turn() {
        let mut p = prompt();
        p.media = Some(MediaPart::InlinePhoto {
            data: "QUJD".to_string(),
        });
        let body = build_request_body(&p, &cfg(), "https://api.openai.com");
        let last = body["messages"].as_array().unwrap().last().unwrap().clone();
        let parts = last["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "text");
        assert_eq!(
            parts[1]["image_url"]["url"],
            "data:image/jpeg;base64,QUJD"
        );
    }

    #[test]
    fn vision_off_drops_the_photo() {
        let mut p = prompt();
        p.media = Some(MediaPart::InlinePhoto {
            data: "QUJD".to_string(),
        });
        let mut c = cfg();
        c.o_vision = false;
        let body = build_request_body(&p, &c, "https://api.openai.com");
        let last = body["messages"].as_array().unwrap().last().unwrap().clone();
        assert!(last["content"].is_string());
    }

    #[test]
    fn file_handles_are_omitted_on_this_shape() {
        let mut p = prompt();
        p.media = Some(MediaPart::FileHandle {
            mime_type: "application/pdf".to_string(),
            uri: "https://files.example/abc".to_string(),
        });
        let body = build_request_body(&p, &cfg(), "https://api.openai.com");
        let last = body["messages"].as_array().unwrap().last().unwrap().clone();
        assert!(last["content"].is_string());
    }

    #[test]
    fn decodes_content_and_usage() {
        let outcome = decode_json(serde_json::json!({
            "choices": [{
                "message": { "content": "It is noon." },
                "finish_reason": "stop"
            }],
            "usage": { "prompt_tokens": 50, "completion_tokens": 5, "total_tokens": 55 }
        }));
        assert_eq!(
            outcome,
            Outcome::Text {
                text: "It is noon.".to_string(),
                usage: Usage {
                    prompt_tokens: 50,
                    completion_tokens: 5,
                    total_tokens: 55
                }
            }
        );
    }

    #[test]
    fn length_finish_reason_is_failure() {
        let outcome = decode_json(serde_json::json!({
            "choices": [{
                "message": { "content": "truncat" },
                "finish_reason": "length"
            }]
        }));
        match outcome {
            Outcome::Unknown { message, .. } => assert!(message.contains("max-output-tokens")),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn proxy_error_marker_is_failure() {
        let outcome = decode_json(serde_json::json!({
            "choices": [{
                "message": { "content": "oai-proxy-error: upstream overloaded" }
            }]
        }));
        assert!(outcome.is_failure());
    }

    #[test]
    fn error_body_is_failure() {
        let outcome = decode_json(serde_json::json!({
            "error": { "message": "quota" }
        }));
        match outcome {
            Outcome::Unknown { message, .. } => assert_eq!(message, "quota"),
            other => panic!("expected Unknown, got {other:?}"),
        }
    }
}
