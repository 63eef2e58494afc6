//! Gemini-backed plan model.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

const GEMINI_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

#[derive(Debug, Error)]
pub enum LlmError {
    #[error("LLM request failed: {0}")]
    Request(String),

    #[error("LLM returned no content")]
    Empty,
}

/// The model seam the planner calls; stubbed out in tests.
#[async_trait]
pub trait PlanModel: Send + Sync {
    /// Generates raw text for the prompt.
    async fn generate(&self, prompt: &str) -> Result<String, LlmError>;
}

/// Google Gemini implementation of `PlanModel`.
#[derive(Debug, Clone)]
pub struct GeminiModel {
    model_id: String,
    api_key: String,
    base_url: String,
    client: Client,
}

impl GeminiModel {
    #[must_use]
    pub fn new(model_id: String, api_key: String) -> Self {
        Self {
            model_id,
            api_key,
            base_url: GEMINI_BASE_URL.to_string(),
            client: Client::new(),
        }
    }
}

#[async_trait]
impl PlanModel for GeminiModel {
    async fn generate(&self, prompt: &str) -> Result<String, LlmError> {
        debug!(
            model_id = %self.model_id,
            prompt_len = prompt.len(),
            "Calling Gemini"
        );

        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.base_url, self.model_id, self.api_key
        );

        let body = GeminiRequest {
            contents: vec![GeminiContent {
                role: "user".to_string(),
                parts: vec![GeminiPart {
                    text: prompt.to_string(),
                }],
            }],
        };

        let response = self
            .client
            .post(&url)
            .json(&body)
            .send()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(LlmError::Request(format!("status {status}: {detail}")));
        }

        let parsed: GeminiResponse = response
            .json()
            .await
            .map_err(|e| LlmError::Request(e.to_string()))?;

        parsed
            .candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content.parts.into_iter().next())
            .map(|part| part.text)
            .ok_or(LlmError::Empty)
    }
}

#[derive(Debug, Serialize)]
struct GeminiRequest {
    contents: Vec<GeminiContent>,
}

#[derive(Debug, Serialize)]
struct GeminiContent {
    role: String,
    parts: Vec<GeminiPart>,
}

#[derive(Debug, Serialize)]
struct GeminiPart {
    text: String,
}

#[derive(Debug, Deserialize)]
struct GeminiResponse {
    #[serde(default)]
    candidates: Vec<GeminiCandidate>,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidate {
    content: GeminiCandidateContent,
}

#[derive(Debug, Deserialize)]
struct GeminiCandidateContent {
    #[serde(default)]
    parts: Vec<GeminiResponsePart>,
}

#[derive(Debug, Deserialize)]
struct GeminiResponsePart {
    #[serde(default)]
    text: String,
}

/// Builds the structured prompt demanding strict JSON.
#[must_use]
pub fn build_plan_prompt(utterance: &str) -> String {
    format!(
        r#"You are the planner for an AutoML system. Convert the user request into a structured JSON object.

User Request: "{utterance}"

Respond with ONLY a valid JSON object (no markdown, no explanation) conforming to this exact schema:
{{
  "name": "string - a descriptive project name based on the request",
  "task_type": "image_classification",
  "framework": "pytorch",
  "dataset_source": "kaggle",
  "search_keywords": ["2-4 relevant keywords for finding datasets"],
  "preferred_model": "one of: resnet18, resnet34, resnet50, mobilenet_v2, efficientnet_b0",
  "target_metric": "accuracy",
  "target_value": 0.9,
  "max_dataset_size_gb": 50
}}

Rules:
- Extract the main topic from the request for the project name.
- Generate 2-4 search keywords that would find appropriate datasets.
- Choose resnet18 for simple tasks, resnet50 or efficientnet_b0 for complex ones.
- Keep target_value at 0.9 unless the user says otherwise.
- If the user mentions a dataset size limit (e.g. "not more than 1GB", "under 500MB"), set max_dataset_size_gb accordingly, converting MB to GB (500MB = 0.5). Otherwise use 50.
- Respond with ONLY the JSON object.

Example:
User: "Train a plant disease classifier with dataset not more than 1GB"
Response: {{"name": "Plant Disease Classifier", "task_type": "image_classification", "framework": "pytorch", "dataset_source": "kaggle", "search_keywords": ["plant disease", "leaf disease", "crop disease"], "preferred_model": "resnet18", "target_metric": "accuracy", "target_value": 0.9, "max_dataset_size_gb": 1}}
"#
    )
}

/// Prefix used for the single retry after an invalid response.
pub const SCHEMA_REMINDER: &str =
    "Return ONLY a JSON object matching the schema exactly. No markdown fences, no prose.\n\n";

/// Strips markdown code fences the model sometimes wraps JSON in.
#[must_use]
pub fn strip_code_fences(raw: &str) -> &str {
    let trimmed = raw.trim();
    let without_open = trimmed
        .strip_prefix("```json")
        .or_else(|| trimmed.strip_prefix("```"))
        .unwrap_or(trimmed);
    without_open
        .strip_suffix("```")
        .unwrap_or(without_open)
        .trim()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strip_fences() {
        assert_eq!(strip_code_fences("```json\n{\"a\":1}\n```"), "{\"a\":1}");
        assert_eq!(strip_code_fences("```\n{}\n```"), "{}");
        assert_eq!(strip_code_fences("{\"plain\":true}"), "{\"plain\":true}");
    }

    #[test]
    fn test_prompt_carries_utterance() {
        let prompt = build_plan_prompt("classify mushrooms under 2GB");
        assert!(prompt.contains("classify mushrooms under 2GB"));
        assert!(prompt.contains("max_dataset_size_gb"));
    }
}
