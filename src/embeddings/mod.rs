pub mod late_interaction;

use crate::core::config::Settings;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EmbedError {
    #[error("Missing required env var: {0}")]
    MissingEnv(&'static str),
    #[error("Unknown embedding provider: {0}")]
    UnknownProvider(String),
    #[error("Embedding dim {got} < expected {want}")]
    DimTooSmall { got: usize, want: usize },
    #[error("embedding backend error: {0}")]
    Backend(String),
}

impl From<reqwest::Error> for EmbedError {
    fn from(err: reqwest::Error) -> Self {
        EmbedError::Backend(err.to_string())
    }
}

#[derive(Debug, Clone)]
pub struct EmbeddingResult {
    pub vector: Vec<f32>,
    pub provider: &'static str,
}

/// Fit a vector to the configured index dimension: excess is truncated, a
/// deficit is fatal — a short vector silently zero-padded would corrupt every
/// cosine comparison against it.
pub fn normalize_embedding(vector: Vec<f32>, dim: usize) -> Result<Vec<f32>, EmbedError> {
    if vector.len() < dim {
        return Err(EmbedError::DimTooSmall {
            got: vector.len(),
            want: dim,
        });
    }
    let mut vector = vector;
    vector.truncate(dim);
    Ok(vector)
}

/// Little-endian f32 packing, the wire format of the `embedding` hash field.
pub fn vector_to_bytes(vector: &[f32]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(vector.len() * 4);
    for value in vector {
        bytes.extend_from_slice(&value.to_le_bytes());
    }
    bytes
}

/// Inverse of `vector_to_bytes`; anything not a whole number of f32s decodes
/// as empty rather than as a truncated vector.
pub fn bytes_to_vector(bytes: &[u8]) -> Vec<f32> {
    if bytes.is_empty() || bytes.len() % 4 != 0 {
        return Vec::new();
    }
    bytes
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect()
}

fn mean_pool(rows: &[Vec<f32>]) -> Result<Vec<f32>, EmbedError> {
    let Some(first) = rows.first() else {
        return Ok(Vec::new());
    };
    let width = first.len();
    let mut sums = vec![0.0f32; width];
    for row in rows {
        if row.len() != width {
            return Err(EmbedError::Backend(
                "embedding rows have inconsistent dimensions".to_string(),
            ));
        }
        for (sum, value) in sums.iter_mut().zip(row) {
            *sum += value;
        }
    }
    let count = rows.len() as f32;
    Ok(sums.into_iter().map(|s| s / count).collect())
}

/// Remote feature-extraction client. Token matrices are mean-pooled to a
/// single vector.
pub struct HuggingFaceProvider {
    http: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl HuggingFaceProvider {
    fn new(settings: &Settings, http: reqwest::Client) -> Result<Self, EmbedError> {
        if settings.huggingface_api_key.is_empty() {
            return Err(EmbedError::MissingEnv("HUGGINGFACE_API_KEY"));
        }
        let model = &settings.huggingface_embeddings_model;
        if model.to_ascii_lowercase().contains("colbert") {
            return Err(EmbedError::Backend(format!(
                "ColBERT model {model} requires EMBEDDINGS_PROVIDER=pylate; \
                 use a standard embedding model for feature extraction"
            )));
        }
        let base = settings.huggingface_base_url.trim_end_matches('/');
        Ok(Self {
            http,
            endpoint: format!("{base}/models/{model}/pipeline/feature-extraction"),
            api_key: settings.huggingface_api_key.clone(),
        })
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>, EmbedError> {
        let response = self
            .http
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&serde_json::json!({ "inputs": text }))
            .send()
            .await?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(EmbedError::Backend(format!(
                "feature extraction failed ({status}): {body}"
            )));
        }
        let value: serde_json::Value = response.json().await?;
        vector_from_json(&value)
    }
}

/// Accept either a flat vector or a token matrix (mean-pooled).
fn vector_from_json(value: &serde_json::Value) -> Result<Vec<f32>, EmbedError> {
    let Some(items) = value.as_array() else {
        return Err(EmbedError::Backend(
            "unexpected embedding response shape".to_string(),
        ));
    };
    if items.is_empty() {
        return Err(EmbedError::Backend("empty embedding response".to_string()));
    }
    if items[0].is_array() {
        let rows: Vec<Vec<f32>> = items
            .iter()
            .map(|row| {
                row.as_array()
                    .map(|cells| {
                        cells
                            .iter()
                            .filter_map(|c| c.as_f64())
                            .map(|c| c as f32)
                            .collect()
                    })
                    .ok_or_else(|| {
                        EmbedError::Backend("unexpected embedding response shape".to_string())
                    })
            })
            .collect::<Result<_, _>>()?;
        return mean_pool(&rows);
    }
    Ok(items
        .iter()
        .filter_map(|c| c.as_f64())
        .map(|c| c as f32)
        .collect())
}

/// Sealed provider set. `pylate`/`colbert` deployments bypass this entirely
/// and go through the late-interaction retriever.
pub enum EmbeddingProvider {
    Dummy { dim: usize },
    HuggingFace(HuggingFaceProvider),
}

impl EmbeddingProvider {
    pub fn from_settings(
        settings: &Settings,
        http: reqwest::Client,
    ) -> Result<Self, EmbedError> {
        match settings.embeddings_provider.as_str() {
            "dummy" => Ok(EmbeddingProvider::Dummy {
                dim: settings.embeddings_dim,
            }),
            "huggingface" | "hf" => Ok(EmbeddingProvider::HuggingFace(
                HuggingFaceProvider::new(settings, http)?,
            )),
            other => Err(EmbedError::UnknownProvider(other.to_string())),
        }
    }

    pub async fn embed(&self, text: &str) -> Result<EmbeddingResult, EmbedError> {
        match self {
            EmbeddingProvider::Dummy { dim } => {
                // Deterministic and content-sensitive, which is all the test
                // deployments need from it.
                let mut vector = vec![0.0f32; *dim];
                for (slot, ch) in vector.iter_mut().zip(text.chars()) {
                    *slot = (ch as u32 % 97) as f32 / 96.0;
                }
                Ok(EmbeddingResult {
                    vector,
                    provider: "dummy",
                })
            }
            EmbeddingProvider::HuggingFace(provider) => Ok(EmbeddingResult {
                vector: provider.embed(text).await?,
                provider: "huggingface",
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_unpack_round_trips() {
        let vector = vec![0.0f32, 1.5, -2.25, 1.0e-7];
        let bytes = vector_to_bytes(&vector);
        assert_eq!(bytes.len(), 16);
        assert_eq!(bytes_to_vector(&bytes), vector);
        // And the byte-level inverse law.
        assert_eq!(vector_to_bytes(&bytes_to_vector(&bytes)), bytes);
    }

    #[test]
    fn unpack_rejects_ragged_lengths() {
        assert!(bytes_to_vector(&[1, 2, 3]).is_empty());
        assert!(bytes_to_vector(&[]).is_empty());
    }

    #[test]
    fn normalize_truncates_excess_and_rejects_deficit() {
        let out = normalize_embedding(vec![1.0; 10], 4).unwrap();
        assert_eq!(out.len(), 4);
        let err = normalize_embedding(vec![1.0; 3], 4).unwrap_err();
        assert!(matches!(err, EmbedError::DimTooSmall { got: 3, want: 4 }));
    }

    #[tokio::test]
    async fn dummy_provider_is_deterministic() {
        let provider = EmbeddingProvider::Dummy { dim: 8 };
        let a = provider.embed("machine learning").await.unwrap();
        let b = provider.embed("machine learning").await.unwrap();
        let c = provider.embed("streaming systems").await.unwrap();
        assert_eq!(a.vector, b.vector);
        assert_ne!(a.vector, c.vector);
        assert_eq!(a.vector.len(), 8);
        assert_eq!(a.provider, "dummy");
    }

    #[test]
    fn mean_pool_averages_rows() {
        let pooled = mean_pool(&[vec![1.0, 3.0], vec![3.0, 5.0]]).unwrap();
        assert_eq!(pooled, vec![2.0, 4.0]);
        assert!(mean_pool(&[vec![1.0], vec![1.0, 2.0]]).is_err());
    }

    #[test]
    fn json_vector_shapes() {
        let flat = serde_json::json!([0.25, 0.5]);
        assert_eq!(vector_from_json(&flat).unwrap(), vec![0.25, 0.5]);
        let matrix = serde_json::json!([[1.0, 2.0], [3.0, 4.0]]);
        assert_eq!(vector_from_json(&matrix).unwrap(), vec![2.0, 3.0]);
        assert!(vector_from_json(&serde_json::json!("nope")).is_err());
    }
}
