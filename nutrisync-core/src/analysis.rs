use std::path::Path;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use crate::backend::directory_url;
use crate::nutrition::{NutritionError, NutritionReport};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com";
const DEFAULT_MODEL: &str = "gemini-1.5-flash";

pub const ANALYSIS_PROMPT: &str = r#"Analyze this food image and return nutrition data in JSON format. Be quick but accurate.

RULES:
1. Estimate portions based on visual cues (plate size, typical servings)
2. Use standard nutrition values
3. Return concise JSON only

FORMAT:
{
  "foods": [
    {
      "name": "food name",
      "portion": "description like '2 idlis' or '1 cup rice'",
      "weight_g": number,
      "nutrition": {
        "calories": number,
        "protein": number,
        "carbs": number,
        "fat": number,
        "fiber": number
      }
    }
  ],
  "total": {
    "calories": number,
    "protein": number,
    "carbs": number,
    "fat": number,
    "fiber": number
  },
  "confidence": "high/medium/low"
}

Return valid JSON only, no markdown."#;

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("failed to read image: {0}")]
    Io(#[from] std::io::Error),
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("vision api returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("malformed vision response: {0}")]
    Response(serde_json::Error),
    #[error("vision response has no candidate text")]
    EmptyResponse,
    #[error("unusable analysis payload: {0}")]
    Payload(#[from] NutritionError),
}

/// Stateless adapter over the `generateContent` endpoint of the vision model.
#[derive(Clone)]
pub struct VisionClient {
    http: Client,
    base_url: Url,
    api_key: String,
    model: String,
}

impl VisionClient {
    pub fn new(api_key: impl Into<String>) -> Result<Self, AnalysisError> {
        Self::with_base_url(DEFAULT_BASE_URL, api_key)
    }

    pub fn with_base_url(base_url: &str, api_key: impl Into<String>) -> Result<Self, AnalysisError> {
        Ok(Self {
            http: Client::new(),
            base_url: directory_url(base_url)?,
            api_key: api_key.into(),
            model: DEFAULT_MODEL.to_string(),
        })
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = model.into();
        self
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    pub async fn analyze_file(&self, path: &Path) -> Result<NutritionReport, AnalysisError> {
        let image = tokio::fs::read(path).await?;
        self.analyze_image(&image, mime_type_for(path)).await
    }

    pub async fn analyze_image(
        &self,
        image: &[u8],
        mime_type: &str,
    ) -> Result<NutritionReport, AnalysisError> {
        let encoded = STANDARD.encode(image);
        let request = GenerateContentRequest {
            contents: [RequestContent {
                parts: [
                    RequestPart::Text {
                        text: ANALYSIS_PROMPT,
                    },
                    RequestPart::InlineData {
                        inline_data: InlineData {
                            mime_type,
                            data: &encoded,
                        },
                    },
                ],
            }],
        };
        let response = self
            .http
            .post(self.endpoint()?)
            .json(&request)
            .send()
            .await?;
        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            return Err(AnalysisError::Api { status, body });
        }
        let payload: GenerateContentResponse =
            serde_json::from_str(&body).map_err(AnalysisError::Response)?;
        let text = payload.first_text().ok_or(AnalysisError::EmptyResponse)?;
        Ok(NutritionReport::from_model_text(text)?)
    }

    fn endpoint(&self) -> Result<Url, AnalysisError> {
        let mut url = self
            .base_url
            .join(&format!("v1/models/{}:generateContent", self.model))?;
        url.query_pairs_mut().append_pair("key", &self.api_key);
        Ok(url)
    }
}

pub fn mime_type_for(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        _ => "image/jpeg",
    }
}

#[derive(Serialize)]
struct GenerateContentRequest<'a> {
    contents: [RequestContent<'a>; 1],
}

#[derive(Serialize)]
struct RequestContent<'a> {
    parts: [RequestPart<'a>; 2],
}

#[derive(Serialize)]
#[serde(untagged)]
enum RequestPart<'a> {
    Text { text: &'a str },
    InlineData { inline_data: InlineData<'a> },
}

#[derive(Serialize)]
struct InlineData<'a> {
    mime_type: &'a str,
    data: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    #[serde(default)]
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    #[serde(default)]
    text: Option<String>,
}

impl GenerateContentResponse {
    fn first_text(&self) -> Option<&str> {
        self.candidates
            .first()?
            .content
            .as_ref()?
            .parts
            .first()?
            .text
            .as_deref()
    }
}
