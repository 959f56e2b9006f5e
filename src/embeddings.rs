//! Proveedores de embeddings detrás de un único trait.
//!
//! - `HuggingFaceEmbedder`: API de inferencia de Hugging Face (feature-extraction).
//! - `OpenAiEmbedder`: embeddings de OpenAI a través de Rig.
//! - `HashingEmbedder`: bolsa de palabras con hashing, local y determinista.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::config::{AppConfig, EmbeddingProvider};

#[async_trait]
pub trait Embedder: Send + Sync {
    /// Devuelve un vector por cada texto, en el mismo orden.
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>>;

    fn name(&self) -> &str;
}

pub fn create_embedder(cfg: &AppConfig) -> Result<Arc<dyn Embedder>> {
    let embedder: Arc<dyn Embedder> = match cfg.embedding_provider {
        EmbeddingProvider::HuggingFace => Arc::new(HuggingFaceEmbedder::new(HuggingFaceConfig {
            api_key: cfg.huggingface_api_key.clone(),
            model: cfg.embedding_model.clone(),
            base_url: cfg.huggingface_base_url.clone(),
            ..HuggingFaceConfig::default()
        })?),
        EmbeddingProvider::OpenAI => Arc::new(OpenAiEmbedder::new(&cfg.embedding_model)),
        EmbeddingProvider::Hashing => Arc::new(HashingEmbedder::default()),
    };
    info!("Proveedor de embeddings: {}", embedder.name());
    Ok(embedder)
}

// ---------------------------------------------------------------------
// HUGGING FACE
// ---------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct HuggingFaceConfig {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_secs: u64,
}

impl Default for HuggingFaceConfig {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "sentence-transformers/all-MiniLM-L6-v2".to_string(),
            base_url: "https://router.huggingface.co/hf-inference".to_string(),
            timeout_secs: 60,
        }
    }
}

#[derive(Debug, Serialize)]
struct FeatureExtractionRequest<'a> {
    inputs: &'a [String],
}

/// Los modelos sentence-transformers devuelven un vector por frase; otros
/// modelos devuelven un vector por token y se promedian.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum FeatureExtractionResponse {
    Sentences(Vec<Vec<f32>>),
    Tokens(Vec<Vec<Vec<f32>>>),
}

impl FeatureExtractionResponse {
    fn into_sentence_vectors(self) -> Vec<Vec<f32>> {
        match self {
            Self::Sentences(vectors) => vectors,
            Self::Tokens(per_text) => per_text.into_iter().map(|tokens| mean_pool(&tokens)).collect(),
        }
    }
}

fn mean_pool(tokens: &[Vec<f32>]) -> Vec<f32> {
    let Some(first) = tokens.first() else {
        return Vec::new();
    };
    let mut pooled = vec![0.0f32; first.len()];
    for token in tokens {
        for (acc, value) in pooled.iter_mut().zip(token) {
            *acc += value;
        }
    }
    let n = tokens.len() as f32;
    pooled.iter_mut().for_each(|v| *v /= n);
    pooled
}

pub struct HuggingFaceEmbedder {
    config: HuggingFaceConfig,
    client: Client,
}

impl HuggingFaceEmbedder {
    pub fn new(config: HuggingFaceConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .context("No se pudo crear el cliente HTTP de Hugging Face")?;
        Ok(Self { config, client })
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/models/{}/pipeline/feature-extraction",
            self.config.base_url.trim_end_matches('/'),
            self.config.model
        )
    }
}

#[async_trait]
impl Embedder for HuggingFaceEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }

        let mut request = self
            .client
            .post(self.endpoint())
            .json(&FeatureExtractionRequest { inputs: &texts });
        if let Some(key) = &self.config.api_key {
            request = request.bearer_auth(key);
        }

        let response = request
            .send()
            .await
            .context("Fallo enviando la petición a Hugging Face")?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!("Hugging Face devolvió {status}: {body}"));
        }

        let parsed: FeatureExtractionResponse = response
            .json()
            .await
            .context("Respuesta de Hugging Face con formato inesperado")?;
        let vectors = parsed.into_sentence_vectors();
        ensure_same_len(&texts, &vectors)?;
        debug!("Hugging Face: {} embeddings generados", vectors.len());
        Ok(vectors)
    }

    fn name(&self) -> &str {
        &self.config.model
    }
}

// ---------------------------------------------------------------------
// OPENAI (RIG)
// ---------------------------------------------------------------------

pub struct OpenAiEmbedder {
    model: String,
}

impl OpenAiEmbedder {
    pub fn new(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }
}

#[async_trait]
impl Embedder for OpenAiEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        use rig::providers::openai::{self, TEXT_EMBEDDING_3_SMALL};
        // Trait para client.embedding_model(...)
        use rig::client::EmbeddingsClient as _;
        use rig::embeddings::EmbeddingModel as _;

        if texts.is_empty() {
            return Ok(Vec::new());
        }

        // Cliente OpenAI de Rig (lee OPENAI_API_KEY)
        let client = openai::Client::from_env();
        // Un modelo de sentence-transformers no existe en OpenAI: usamos el de por defecto.
        let model_name = if self.model.is_empty() || self.model.contains('/') {
            TEXT_EMBEDDING_3_SMALL
        } else {
            self.model.as_str()
        };
        let embedding_model = client.embedding_model(model_name);

        let embeddings = embedding_model.embed_texts(texts.clone()).await?;
        let vectors: Vec<Vec<f32>> = embeddings
            .into_iter()
            .map(|e| e.vec.into_iter().map(|v| v as f32).collect())
            .collect();
        ensure_same_len(&texts, &vectors)?;
        Ok(vectors)
    }

    fn name(&self) -> &str {
        &self.model
    }
}

// ---------------------------------------------------------------------
// HASHING (LOCAL)
// ---------------------------------------------------------------------

/// Embedder local sin red: cada palabra suma 1 en la dimensión que indica su
/// hash FNV-1a y el vector resultante se normaliza.
pub struct HashingEmbedder {
    dimension: usize,
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(384)
    }
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }

    pub fn embed_one(&self, text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; self.dimension];
        for word in text
            .split(|c: char| !c.is_alphanumeric())
            .filter(|w| !w.is_empty())
        {
            let slot = (fnv1a(&word.to_lowercase()) % self.dimension as u64) as usize;
            vector[slot] += 1.0;
        }
        let norm = vector.iter().map(|v| v * v).sum::<f32>().sqrt();
        if norm > 0.0 {
            vector.iter_mut().for_each(|v| *v /= norm);
        }
        vector
    }
}

fn fnv1a(word: &str) -> u64 {
    word.bytes().fold(0xcbf29ce484222325u64, |hash, byte| {
        (hash ^ u64::from(byte)).wrapping_mul(0x100000001b3)
    })
}

#[async_trait]
impl Embedder for HashingEmbedder {
    async fn embed(&self, texts: Vec<String>) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| self.embed_one(t)).collect())
    }

    fn name(&self) -> &str {
        "hashing"
    }
}

fn ensure_same_len(texts: &[String], vectors: &[Vec<f32>]) -> Result<()> {
    if texts.len() != vectors.len() {
        return Err(anyhow!(
            "Número de embeddings ({}) distinto al número de textos ({})",
            vectors.len(),
            texts.len()
        ));
    }
    Ok(())
}
