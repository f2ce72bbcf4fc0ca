//! LLM Gateway Adapter (C2): wraps the external LLM HTTP endpoint.
//!
//! Grounded on the teacher's council-member HTTP call shape (one reqwest
//! POST per model, JSON request/response, thiserror'd failures) and on the
//! original `openrouter_service.py`'s exact multimodal-encoding and
//! cost-extraction algorithms, which this module ports verbatim into typed
//! Rust rather than dict-indexing.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use base64::Engine;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::model::{Attachment, FileType};

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("gateway returned {status}: {body}")]
    BadStatus { status: u16, body: String },

    #[error("malformed response: {0}")]
    Decode(String),
}

pub type GatewayResult<T> = Result<T, GatewayError>;

/// Per-call cost/token accounting, as returned alongside a completion.
#[derive(Debug, Clone, Copy, Default, Serialize)]
pub struct CostInfo {
    pub actual_cost: f64,
    pub input_tokens: u64,
    pub output_tokens: u64,
}

/// One multimodal content part, matching the OpenRouter/OpenAI content-array
/// wire shape described in SPEC_FULL.md §4.2.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type")]
enum ContentPart {
    #[serde(rename = "text")]
    Text { text: String },
    #[serde(rename = "image_url")]
    ImageUrl { image_url: UrlPart },
    #[serde(rename = "file")]
    File { file: FilePart },
    #[serde(rename = "input_audio")]
    InputAudio { input_audio: AudioPart },
    #[serde(rename = "video_url")]
    VideoUrl { video_url: UrlPart },
}

#[derive(Debug, Clone, Serialize)]
struct UrlPart {
    url: String,
}

#[derive(Debug, Clone, Serialize)]
struct FilePart {
    filename: String,
    file_data: String,
}

#[derive(Debug, Clone, Serialize)]
struct AudioPart {
    data: String,
    format: String,
}

/// Encode attachments into content parts, appended after the original text.
/// Mirrors `openrouter_service.py`'s `_build_content` ordering: text first,
/// then one part per attachment in declaration order.
fn build_content_parts(attachments: &[Attachment]) -> Vec<ContentPart> {
    attachments
        .iter()
        .map(|att| {
            let b64 = base64::engine::general_purpose::STANDARD.encode(&att.file_data);
            match att.file_type {
                FileType::Image => ContentPart::ImageUrl {
                    image_url: UrlPart {
                        url: format!("data:{};base64,{}", att.mime_type, b64),
                    },
                },
                FileType::Pdf | FileType::File => ContentPart::File {
                    file: FilePart {
                        filename: att.filename.clone(),
                        file_data: format!("data:{};base64,{}", att.mime_type, b64),
                    },
                },
                FileType::Audio => ContentPart::InputAudio {
                    input_audio: AudioPart {
                        data: b64,
                        format: att
                            .mime_type
                            .split('/')
                            .nth(1)
                            .unwrap_or(&att.mime_type)
                            .to_string(),
                    },
                },
                FileType::Video => ContentPart::VideoUrl {
                    video_url: UrlPart {
                        url: format!("data:{};base64,{}", att.mime_type, b64),
                    },
                },
                FileType::Text => ContentPart::Text {
                    text: String::from_utf8_lossy(&att.file_data).into_owned(),
                },
            }
        })
        .collect()
}

/// A single chat message. `content` is rewritten into a content array only
/// when attachments are present; a bare string is sent otherwise.
#[derive(Debug, Clone)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

#[derive(Serialize)]
#[serde(untagged)]
enum WireContent {
    Plain(String),
    Parts(Vec<WirePart>),
}

#[derive(Serialize)]
#[serde(untagged)]
enum WirePart {
    Text { r#type: &'static str, text: String },
    Other(ContentPart),
}

#[derive(Serialize)]
struct WireMessage {
    role: String,
    content: WireContent,
}

#[derive(Serialize)]
struct ChatRequest {
    model: String,
    messages: Vec<WireMessage>,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<Value>,
    #[serde(default)]
    cost: Option<Value>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Deserialize)]
struct ChatChoiceMessage {
    content: String,
}

/// Cost-extraction precedence from SPEC_FULL.md §4.2:
/// `cost` → `total_cost` → `cost_details.upstream_inference_cost +
/// upstream_image_inference_cost` → `response.cost` → else 0.0.
fn extract_cost(usage: Option<&Value>, top_level_cost: Option<&Value>) -> f64 {
    let as_f64 = |v: &Value| v.as_f64().unwrap_or(0.0);

    if let Some(usage) = usage {
        if let Some(c) = usage.get("cost").and_then(Value::as_f64) {
            return c;
        }
        if let Some(c) = usage.get("total_cost").and_then(Value::as_f64) {
            return c;
        }
        if let Some(details) = usage.get("cost_details") {
            let inference = details.get("upstream_inference_cost").map(&as_f64).unwrap_or(0.0);
            let image = details
                .get("upstream_image_inference_cost")
                .map(&as_f64)
                .unwrap_or(0.0);
            if details.get("upstream_inference_cost").is_some()
                || details.get("upstream_image_inference_cost").is_some()
            {
                return inference + image;
            }
        }
    }
    if let Some(c) = top_level_cost.and_then(Value::as_f64) {
        return c;
    }
    0.0
}

fn extract_tokens(usage: Option<&Value>) -> (u64, u64) {
    let input = usage
        .and_then(|u| u.get("prompt_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    let output = usage
        .and_then(|u| u.get("completion_tokens"))
        .and_then(Value::as_u64)
        .unwrap_or(0);
    (input, output)
}

/// A model's declared multimodal capability flags, from the gateway's
/// `/models` catalog.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct Capabilities {
    pub image: bool,
    pub file: bool,
    pub audio: bool,
    pub video: bool,
    pub text: bool,
}

impl Capabilities {
    /// Parse a catalog entry's `architecture.modality` string, e.g.
    /// `"text+image->text"`, into capability flags.
    pub fn from_modality(modality: &str) -> Self {
        let input = modality.split("->").next().unwrap_or(modality);
        Capabilities {
            image: input.contains("image"),
            file: input.contains("file"),
            audio: input.contains("audio"),
            video: input.contains("video"),
            text: input.contains("text"),
        }
    }

    fn flag_for(&self, file_type: FileType) -> bool {
        match file_type {
            FileType::Image => self.image,
            // pdf shares the `file` wire encoding and capability flag.
            FileType::Pdf | FileType::File => self.file,
            FileType::Audio => self.audio,
            FileType::Video => self.video,
            FileType::Text => self.text,
        }
    }
}

/// Per-user cache of the gateway's model catalog, keyed by model id.
/// Process-wide, last-writer-wins on concurrent refresh (§5).
#[derive(Default, Clone)]
pub struct CatalogCache {
    inner: Arc<RwLock<HashMap<String, HashMap<String, Capabilities>>>>,
}

impl CatalogCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_catalog(&self, user_id: &str, catalog: HashMap<String, Capabilities>) {
        self.inner.write().unwrap().insert(user_id.to_string(), catalog);
    }

    /// Whether a catalog has already been fetched for `user_id` (§4.2: fetch
    /// once per user, not once per call).
    pub fn is_cached(&self, user_id: &str) -> bool {
        self.inner.read().unwrap().contains_key(user_id)
    }

    fn lookup(&self, user_id: &str, model_id: &str) -> Option<Capabilities> {
        self.inner.read().unwrap().get(user_id).and_then(|c| c.get(model_id)).copied()
    }

    /// `unsupported_attachments` from SPEC_FULL.md §4.2: one warning per
    /// attachment *type present* whose capability flag is false. No catalog
    /// entry for the model → no warnings (conservative).
    pub fn unsupported_attachments(
        &self,
        user_id: &str,
        model_id: &str,
        attachments: &[Attachment],
    ) -> Vec<String> {
        let Some(caps) = self.lookup(user_id, model_id) else {
            return Vec::new();
        };
        let mut counts: HashMap<&'static str, usize> = HashMap::new();
        let mut types_seen: Vec<FileType> = Vec::new();
        for att in attachments {
            if !caps.flag_for(att.file_type) {
                let label = wire_label(att.file_type);
                if !counts.contains_key(label) {
                    types_seen.push(att.file_type);
                }
                *counts.entry(label).or_insert(0) += 1;
            }
        }
        types_seen
            .into_iter()
            .map(|ft| {
                let label = wire_label(ft);
                let count = counts[label];
                format!(
                    "⚠️ Model '{model_id}' doesn't support {}. {count} {label}(s) sent anyway - may be ignored by model.",
                    support_label(ft)
                )
            })
            .collect()
    }
}

fn wire_label(ft: FileType) -> &'static str {
    match ft {
        FileType::Image => "image",
        FileType::Pdf | FileType::File => "file",
        FileType::Audio => "audio",
        FileType::Video => "video",
        FileType::Text => "text",
    }
}

/// The noun used in the "doesn't support ..." clause — matches the
/// original's wording (`vision`, `files`) rather than the wire/count label.
fn support_label(ft: FileType) -> &'static str {
    match ft {
        FileType::Image => "vision",
        FileType::Pdf | FileType::File => "files",
        FileType::Audio => "audio",
        FileType::Video => "video",
        FileType::Text => "text",
    }
}

/// The LLM Gateway Adapter contract. A trait so engines and tests can swap
/// in a scriptable stub (§10.4) without a live gateway.
#[async_trait]
pub trait LlmGateway: Send + Sync {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        attachments: &[Attachment],
    ) -> GatewayResult<(String, CostInfo)>;

    /// Fetch the gateway's model catalog, keyed by model id, for capability
    /// introspection (§4.2). Defaults to an empty catalog so stub gateways
    /// used in tests need not implement it.
    async fn fetch_catalog(&self) -> GatewayResult<HashMap<String, Capabilities>> {
        Ok(HashMap::new())
    }
}

/// `reqwest`-backed adapter over an OpenRouter-shaped chat-completions
/// endpoint.
pub struct HttpGateway {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl HttpGateway {
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.into(),
            api_key: api_key.into(),
        }
    }
}

#[async_trait]
impl LlmGateway for HttpGateway {
    async fn complete(
        &self,
        model: &str,
        prompt: &str,
        attachments: &[Attachment],
    ) -> GatewayResult<(String, CostInfo)> {
        let content = if attachments.is_empty() {
            WireContent::Plain(prompt.to_string())
        } else {
            let mut parts = vec![WirePart::Text {
                r#type: "text",
                text: prompt.to_string(),
            }];
            parts.extend(build_content_parts(attachments).into_iter().map(WirePart::Other));
            WireContent::Parts(parts)
        };

        let request = ChatRequest {
            model: model.to_string(),
            messages: vec![WireMessage {
                role: "user".to_string(),
                content,
            }],
        };

        let response = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ChatResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.clone())
            .ok_or_else(|| GatewayError::Decode("no choices in response".to_string()))?;

        let actual_cost = extract_cost(parsed.usage.as_ref(), parsed.cost.as_ref());
        let (input_tokens, output_tokens) = extract_tokens(parsed.usage.as_ref());

        Ok((
            content,
            CostInfo {
                actual_cost,
                input_tokens,
                output_tokens,
            },
        ))
    }

    async fn fetch_catalog(&self) -> GatewayResult<HashMap<String, Capabilities>> {
        let response = self
            .client
            .get(format!("{}/models", self.base_url))
            .bearer_auth(&self.api_key)
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(GatewayError::BadStatus {
                status: status.as_u16(),
                body,
            });
        }

        let parsed: ModelsResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Decode(e.to_string()))?;

        Ok(parsed
            .data
            .into_iter()
            .map(|entry| {
                let modality = entry.architecture.map(|a| a.modality).unwrap_or_default();
                (entry.id, Capabilities::from_modality(&modality))
            })
            .collect())
    }
}

#[derive(Deserialize)]
struct ModelsResponse {
    data: Vec<ModelEntry>,
}

#[derive(Deserialize)]
struct ModelEntry {
    id: String,
    #[serde(default)]
    architecture: Option<ModelArchitecture>,
}

#[derive(Deserialize)]
struct ModelArchitecture {
    #[serde(default)]
    modality: String,
}
