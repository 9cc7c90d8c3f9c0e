/// Gemini image adapter: the production `GenerationClient`.
///
/// One `generateContent` call renders one image, so a four-candidate grid is
/// four calls with consecutive seeds. Rendered bytes go straight to the image
/// store; only the references travel back to the dispatcher.
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::admission::AdmissionController;
use crate::generation::client::{GenerationClient, GenerationError, GenerationRequest};
use crate::generation::images::{ImageStore, StoredImage};
use crate::generation::prompts::build_prompt;
use crate::models::{Candidate, JobKind};

pub const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
pub const DEFAULT_MODEL: &str = "gemini-3-pro-image-preview";
pub const SUPPORTED_MODELS: &[&str] = &[
    "gemini-3-pro-image-preview",
    "gemini-2.5-flash-image",
    "gemini-2.5-flash-image-preview",
];

const MAX_RETRIES: u32 = 3;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Finish reasons that mean the provider refused to render.
const SAFETY_FINISH_REASONS: &[&str] = &[
    "SAFETY",
    "IMAGE_SAFETY",
    "PROHIBITED_CONTENT",
    "BLOCKLIST",
    "SPII",
];

// ─── Wire types ──────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: [Content<'a>; 1],
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    role: &'static str,
    parts: &'a [Part],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData>,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_modalities: [&'static str; 1],
    seed: i32,
    image_config: ImageConfig,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct ImageConfig {
    aspect_ratio: &'static str,
    image_size: &'static str,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<ResponseCandidate>,
    prompt_feedback: Option<PromptFeedback>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseCandidate {
    content: Option<ResponseContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ResponseContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponsePart {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PromptFeedback {
    block_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    error: ApiErrorBody,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    message: String,
}

/// Outcome of reading one response body.
enum Extracted {
    Image(StoredImage),
    Blocked(String),
    Empty,
}

// ─── Client ──────────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct GeminiClient {
    http: Client,
    api_key: String,
    model: String,
    base_url: String,
    images: Arc<dyn ImageStore>,
    /// Paces every provider request after the first one of a job.
    admission: Option<Arc<AdmissionController>>,
    retry_base_delay: Duration,
}

impl GeminiClient {
    pub fn new(
        api_key: String,
        model: String,
        base_url: String,
        images: Arc<dyn ImageStore>,
    ) -> anyhow::Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            api_key,
            model,
            base_url: base_url.trim_end_matches('/').to_string(),
            images,
            admission: None,
            retry_base_delay: RETRY_BASE_DELAY,
        })
    }

    /// Shares the dispatcher's limiter so extra candidates and retries count
    /// against the same per-minute budget.
    pub fn with_admission(mut self, admission: Arc<AdmissionController>) -> Self {
        self.admission = Some(admission);
        self
    }

    #[cfg(test)]
    pub fn with_retry_base_delay(mut self, delay: Duration) -> Self {
        self.retry_base_delay = delay;
        self
    }

    fn endpoint(&self, model: &str) -> String {
        format!("{}/v1beta/models/{}:generateContent", self.base_url, model)
    }

    /// Reference images plus the selected candidate (for upscale and
    /// variation), followed by the text prompt.
    async fn build_parts(&self, request: &GenerationRequest) -> Result<Vec<Part>, GenerationError> {
        let mut parts = Vec::new();

        if request.kind != JobKind::Upscale {
            for reference in &request.references {
                parts.push(Part {
                    text: None,
                    inline_data: Some(InlineData {
                        mime_type: reference.mime_type.clone(),
                        data: reference.data.clone(),
                    }),
                });
            }
        }

        if let Some(source) = &request.source_image {
            let image = self.images.get(source).await.map_err(|e| {
                GenerationError::Upstream(format!("source image unavailable: {e:#}"))
            })?;
            parts.push(Part {
                text: None,
                inline_data: Some(InlineData {
                    mime_type: image.mime_type,
                    data: base64::engine::general_purpose::STANDARD.encode(&image.bytes),
                }),
            });
        }

        parts.push(Part {
            text: Some(build_prompt(request)),
            inline_data: None,
        });
        Ok(parts)
    }

    /// Waits for an admission token unless this is the request the dispatch
    /// loop already paid for.
    async fn pace(&self, prepaid: &mut bool) {
        if std::mem::take(prepaid) {
            return;
        }
        if let Some(admission) = &self.admission {
            admission.acquire().await;
        }
    }

    /// Renders one image. Retries on 429, 5xx, transport errors and empty
    /// responses with exponential backoff; safety blocks are final.
    async fn render_one(
        &self,
        endpoint: &str,
        parts: &[Part],
        config: GenerationConfig,
        prepaid: &mut bool,
    ) -> Result<StoredImage, GenerationError> {
        let body = GenerateContentRequest {
            contents: [Content { role: "user", parts }],
            generation_config: config,
        };

        let mut last_error: Option<GenerationError> = None;

        for attempt in 0..MAX_RETRIES {
            if attempt > 0 {
                // Exponential backoff: 2s, 4s
                let delay = self.retry_base_delay * (1 << (attempt - 1));
                warn!(
                    "Gemini call attempt {} failed, retrying after {}ms...",
                    attempt,
                    delay.as_millis()
                );
                tokio::time::sleep(delay).await;
            }

            self.pace(prepaid).await;
            let response = self
                .http
                .post(endpoint)
                .header("x-goog-api-key", &self.api_key)
                .json(&body)
                .send()
                .await;

            let response = match response {
                Ok(r) => r,
                Err(e) if e.is_timeout() => {
                    last_error = Some(GenerationError::Timeout);
                    continue;
                }
                Err(e) => {
                    last_error = Some(GenerationError::Upstream(e.to_string()));
                    continue;
                }
            };

            let status = response.status();

            if status.as_u16() == 429 || status.is_server_error() {
                let text = response.text().await.unwrap_or_default();
                warn!("Gemini API returned {}: {}", status, text);
                last_error = Some(GenerationError::Upstream(format!("{status}: {text}")));
                continue;
            }

            if !status.is_success() {
                let text = response.text().await.unwrap_or_default();
                let message = serde_json::from_str::<ApiError>(&text)
                    .map(|e| e.error.message)
                    .unwrap_or(text);
                return Err(classify_rejection(status.as_u16(), message));
            }

            let parsed: GenerateContentResponse = match response.json().await {
                Ok(parsed) => parsed,
                Err(e) => {
                    last_error = Some(GenerationError::Upstream(format!("bad response: {e}")));
                    continue;
                }
            };

            match extract_image(parsed)? {
                Extracted::Image(image) => return Ok(image),
                Extracted::Blocked(reason) => return Err(GenerationError::SafetyBlocked(reason)),
                Extracted::Empty => {
                    last_error = Some(GenerationError::Upstream("no image in response".into()));
                }
            }
        }

        Err(last_error.unwrap_or_else(|| {
            GenerationError::Upstream(format!("gave up after {MAX_RETRIES} attempts"))
        }))
    }
}

#[async_trait]
impl GenerationClient for GeminiClient {
    async fn generate(
        &self,
        request: &GenerationRequest,
    ) -> Result<Vec<Candidate>, GenerationError> {
        let parts = self.build_parts(request).await?;
        let quality = match request.kind {
            JobKind::Upscale => request.quality.upscaled(),
            _ => request.quality,
        };

        let model = request.model.as_deref().unwrap_or(&self.model);
        let endpoint = self.endpoint(model);

        let mut prepaid = true;
        let mut candidates = Vec::with_capacity(request.candidate_count);
        for i in 0..request.candidate_count {
            let config = GenerationConfig {
                response_modalities: ["IMAGE"],
                seed: wire_seed(request.seed.wrapping_add(i as u32)),
                image_config: ImageConfig {
                    aspect_ratio: request.aspect_ratio.as_str(),
                    image_size: quality.as_str(),
                },
            };

            let image = match self.render_one(&endpoint, &parts, config, &mut prepaid).await {
                Ok(image) => image,
                Err(GenerationError::SafetyBlocked(reason)) => {
                    return Err(GenerationError::SafetyBlocked(reason))
                }
                // Keep a partial grid rather than discarding finished renders.
                Err(e) if !candidates.is_empty() => {
                    warn!(
                        "Job {}: candidate {} failed ({e}), returning {} of {}",
                        request.job_id,
                        i,
                        candidates.len(),
                        request.candidate_count
                    );
                    break;
                }
                Err(e) => return Err(e),
            };

            let image_ref = self
                .images
                .put(image)
                .await
                .map_err(|e| GenerationError::Upstream(format!("storing image: {e:#}")))?;

            candidates.push(Candidate {
                index: i as u8,
                image_ref,
                parent_job_id: request.job_id,
            });
        }

        debug!(
            "Job {}: rendered {} candidate(s) with {}",
            request.job_id,
            candidates.len(),
            model
        );
        Ok(candidates)
    }
}

/// Gemini takes a signed 32-bit seed.
fn wire_seed(seed: u32) -> i32 {
    (seed & i32::MAX as u32) as i32
}

fn classify_rejection(status: u16, message: String) -> GenerationError {
    let lower = message.to_lowercase();
    if lower.contains("safety") || lower.contains("blocked") {
        GenerationError::SafetyBlocked(message)
    } else {
        GenerationError::Upstream(format!("{status}: {message}"))
    }
}

fn extract_image(response: GenerateContentResponse) -> Result<Extracted, GenerationError> {
    if let Some(reason) = response.prompt_feedback.and_then(|f| f.block_reason) {
        return Ok(Extracted::Blocked(reason));
    }

    let mut blocked_reason = None;
    for candidate in response.candidates {
        let inline = candidate
            .content
            .into_iter()
            .flat_map(|c| c.parts)
            .find_map(|p| p.inline_data);

        if let Some(inline) = inline {
            let bytes = base64::engine::general_purpose::STANDARD
                .decode(inline.data.as_bytes())
                .map_err(|e| GenerationError::Upstream(format!("undecodable image data: {e}")))?;
            return Ok(Extracted::Image(StoredImage {
                bytes: Bytes::from(bytes),
                mime_type: inline.mime_type,
            }));
        }

        if let Some(reason) = candidate.finish_reason {
            if SAFETY_FINISH_REASONS.contains(&reason.as_str()) {
                blocked_reason = Some(reason);
            }
        }
    }

    Ok(blocked_reason.map_or(Extracted::Empty, Extracted::Blocked))
}
