use crate::core::config::Settings;
use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LateInteractionError {
    /// The backend has no indexed documents yet; callers treat this as an
    /// empty result, not a failure.
    #[error("index is empty")]
    EmptyIndex,
    #[error("documents_ids and documents must be the same length ({ids} != {texts})")]
    LengthMismatch { ids: usize, texts: usize },
    #[error("late-interaction backend error: {0}")]
    Backend(String),
}

impl From<reqwest::Error> for LateInteractionError {
    fn from(err: reqwest::Error) -> Self {
        LateInteractionError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct Hit {
    pub id: String,
    pub score: f64,
}

/// Multi-vector (ColBERT-family) retriever, treated as a pluggable black
/// box: feed it `(id, text)` pairs at index time, ask it for ranked ids at
/// query time.
#[async_trait]
pub trait LateInteraction: Send + Sync {
    async fn add_documents(
        &self,
        ids: &[String],
        texts: &[String],
    ) -> Result<(), LateInteractionError>;

    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Hit>, LateInteractionError>;
}

/// HTTP client for a PyLate/ColBERT sidecar service.
pub struct SidecarRetriever {
    http: reqwest::Client,
    base_url: String,
    index_name: String,
}

impl SidecarRetriever {
    pub fn new(settings: &Settings, http: reqwest::Client) -> Self {
        Self {
            http,
            base_url: settings.pylate_base_url.trim_end_matches('/').to_string(),
            index_name: settings.pylate_index_name.clone(),
        }
    }

    fn endpoint(&self, verb: &str) -> String {
        format!("{}/indexes/{}/{}", self.base_url, self.index_name, verb)
    }

    async fn check(
        response: reqwest::Response,
    ) -> Result<reqwest::Response, LateInteractionError> {
        if response.status().is_success() {
            return Ok(response);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        if body.to_ascii_lowercase().contains("index is empty") {
            return Err(LateInteractionError::EmptyIndex);
        }
        Err(LateInteractionError::Backend(format!("{status}: {body}")))
    }
}

#[async_trait]
impl LateInteraction for SidecarRetriever {
    async fn add_documents(
        &self,
        ids: &[String],
        texts: &[String],
    ) -> Result<(), LateInteractionError> {
        if ids.len() != texts.len() {
            return Err(LateInteractionError::LengthMismatch {
                ids: ids.len(),
                texts: texts.len(),
            });
        }
        if ids.is_empty() {
            return Ok(());
        }
        let response = self
            .http
            .post(self.endpoint("documents"))
            .json(&serde_json::json!({ "ids": ids, "documents": texts }))
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn retrieve(&self, query: &str, k: usize) -> Result<Vec<Hit>, LateInteractionError> {
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let response = self
            .http
            .post(self.endpoint("retrieve"))
            .json(&serde_json::json!({ "query": query, "k": k }))
            .send()
            .await?;
        let response = Self::check(response).await?;
        let hits: Vec<Hit> = response.json().await?;
        Ok(hits)
    }
}
