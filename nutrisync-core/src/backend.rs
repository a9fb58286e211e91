use std::time::Duration;

use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use url::Url;

use crate::nutrition::NutritionReport;

const USER_AGENT: &str = concat!("nutrisyncd/", env!("CARGO_PKG_VERSION"));
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum BackendError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("invalid url: {0}")]
    Url(#[from] url::ParseError),
    #[error("backend returned {status}: {body}")]
    Api { status: StatusCode, body: String },
    #[error("lookup requires an email or a session id")]
    MissingLookupKey,
}

/// Body of `POST /api/save-background-analysis`.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalysisRecord<'a> {
    pub user_id: &'a str,
    pub image_path: &'a str,
    pub analysis_result: &'a NutritionReport,
    pub timestamp: i64,
    pub device_info: &'a str,
}

#[derive(Debug, Default, Deserialize)]
pub struct SaveReceipt {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub id: Option<i64>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct LookupRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    firebase_uid: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LookupResponse {
    #[serde(default)]
    success: bool,
    #[serde(default)]
    user_id: Option<Value>,
}

/// Client for the nutrition backend that stores analysis results.
#[derive(Clone)]
pub struct BackendClient {
    http: Client,
    base_url: Url,
}

impl BackendClient {
    pub fn new(base_url: &str) -> Result<Self, BackendError> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .user_agent(USER_AGENT)
            .build()?;
        Ok(Self {
            http,
            base_url: directory_url(base_url)?,
        })
    }

    pub async fn save_analysis(
        &self,
        record: &AnalysisRecord<'_>,
    ) -> Result<SaveReceipt, BackendError> {
        let url = self.endpoint("api/save-background-analysis")?;
        let response = self.http.post(url).json(record).send().await?;
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if !status.is_success() {
            return Err(BackendError::Api { status, body });
        }
        Ok(serde_json::from_str(&body).unwrap_or_default())
    }

    /// Maps an account email (or session id) to the backend's user id.
    /// `Ok(None)` means the backend answered but knows no such user.
    pub async fn lookup_user_id(
        &self,
        email: Option<&str>,
        session_id: Option<&str>,
    ) -> Result<Option<String>, BackendError> {
        let email = email.filter(|value| !value.is_empty());
        let session_id = session_id.filter(|value| !value.is_empty());
        if email.is_none() && session_id.is_none() {
            return Err(BackendError::MissingLookupKey);
        }
        let url = self.endpoint("api/lookup-user-id")?;
        let response = self
            .http
            .post(url)
            .json(&LookupRequest {
                email,
                firebase_uid: session_id,
            })
            .send()
            .await?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(BackendError::Api { status, body });
        }
        let payload: LookupResponse = response.json().await?;
        if !payload.success {
            return Ok(None);
        }
        Ok(payload.user_id.and_then(|value| match value {
            Value::String(id) if !id.is_empty() => Some(id),
            Value::Number(id) => Some(id.to_string()),
            _ => None,
        }))
    }

    pub async fn health_check(&self) -> Result<(), BackendError> {
        let url = self.endpoint("api/service-health")?;
        let response = self.http.get(url).send().await?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(BackendError::Api { status, body })
        }
    }

    /// `path` is relative, so any prefix in the base url is kept.
    fn endpoint(&self, path: &str) -> Result<Url, BackendError> {
        Ok(self.base_url.join(path)?)
    }
}

/// Parses `base_url` so that its path ends in `/` and relative joins append
/// to it instead of replacing the last segment.
pub(crate) fn directory_url(base_url: &str) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(base_url)?;
    if !url.path().ends_with('/') {
        let path = format!("{}/", url.path());
        url.set_path(&path);
    }
    Ok(url)
}
