//! Carga y gestión de configuración de la aplicación (servidor, usuarios,
//! vector store, embeddings, LLM y tokens).

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use anyhow::{anyhow, Context, Result};
use url::Url;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EmbeddingProvider {
    HuggingFace,
    OpenAI,
    Hashing,
}

impl FromStr for EmbeddingProvider {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "huggingface" | "hf" => Ok(Self::HuggingFace),
            "openai" => Ok(Self::OpenAI),
            "hashing" => Ok(Self::Hashing),
            other => Err(anyhow!("Proveedor de embeddings no soportado: {other}")),
        }
    }
}

/// Configuración completa de la aplicación.
#[derive(Clone, Debug)]
pub struct AppConfig {
    pub server_addr: String,
    pub database_url: String,
    pub vector_store_dir: String,
    pub upload_dir: String,
    pub max_upload_bytes: usize,
    pub cors_origins: Vec<String>,

    pub embedding_provider: EmbeddingProvider,
    pub embedding_model: String,
    pub huggingface_api_key: Option<String>,
    pub huggingface_base_url: String,

    pub openrouter_api_key: Option<String>,
    pub llm_chat_model: String,
    pub llm_temperature: f64,
    pub llm_max_tokens: u64,
    pub retriever_top_k: usize,

    pub chunk_size: usize,
    pub chunk_overlap: usize,

    pub jwt_secret: String,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_days: i64,
}

impl AppConfig {
    /// Carga la configuración desde variables de entorno (usando .env si existe).
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();
        Self::from_source(|key| env::var(key).ok())
    }

    /// Construye la configuración a partir de cualquier fuente clave → valor.
    pub fn from_source<F>(get: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| get(key).filter(|v| !v.trim().is_empty());
        let or_default = |key: &str, default: &str| var(key).unwrap_or_else(|| default.to_string());

        let server_addr = or_default("SERVER_ADDR", "127.0.0.1:8000");
        server_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("SERVER_ADDR inválida: {server_addr}"))?;

        let database_url = or_default("DATABASE_URL", "sqlite://users.db?mode=rwc");
        let vector_store_dir = var("VECTOR_STORE_DIR")
            .or_else(|| var("CHROMA_DB_DIR"))
            .unwrap_or_else(|| "./chroma_db".to_string());
        let upload_dir = or_default("UPLOAD_DIR", "./uploads");
        let max_upload_bytes = parse_number(&var, "MAX_UPLOAD_BYTES", 20 * 1024 * 1024)?;

        let cors_origins = or_default("CORS_ORIGINS", "http://localhost:5173")
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .map(String::from)
            .collect();

        let embedding_provider: EmbeddingProvider =
            or_default("EMBEDDING_PROVIDER", "huggingface").parse()?;
        let embedding_model = or_default("EMBEDDING_MODEL", "sentence-transformers/all-MiniLM-L6-v2");
        let huggingface_api_key = var("HUGGINGFACE_API_KEY").or_else(|| var("HUGGINGFACETOEN"));
        let huggingface_base_url = or_default(
            "HUGGINGFACE_BASE_URL",
            "https://router.huggingface.co/hf-inference",
        );
        Url::parse(&huggingface_base_url)
            .with_context(|| format!("HUGGINGFACE_BASE_URL inválida: {huggingface_base_url}"))?;

        let openrouter_api_key = var("OPENROUTER_API_KEY").or_else(|| var("OPENROUTER"));
        let llm_chat_model = or_default("LLM_CHAT_MODEL", "meta-llama/llama-4-scout:free");
        let llm_temperature = parse_number(&var, "LLM_TEMPERATURE", 0.0)?;
        let llm_max_tokens = parse_number(&var, "LLM_MAX_TOKENS", 512)?;
        let retriever_top_k = parse_number(&var, "RETRIEVER_TOP_K", 4)?;
        if retriever_top_k == 0 {
            return Err(anyhow!("RETRIEVER_TOP_K debe ser mayor que 0"));
        }

        let chunk_size = parse_number(&var, "CHUNK_SIZE", 500)?;
        let chunk_overlap = parse_number(&var, "CHUNK_OVERLAP", 50)?;
        if chunk_size == 0 || chunk_overlap >= chunk_size {
            return Err(anyhow!(
                "CHUNK_OVERLAP ({chunk_overlap}) debe ser menor que CHUNK_SIZE ({chunk_size})"
            ));
        }

        let jwt_secret = var("JWT_SECRET_KEY")
            .ok_or_else(|| anyhow!("Falta JWT_SECRET_KEY en el entorno"))?;
        let access_token_ttl_minutes = parse_number(&var, "ACCESS_TOKEN_EXPIRE_MINUTES", 30)?;
        let refresh_token_ttl_days = parse_number(&var, "REFRESH_TOKEN_EXPIRE_DAYS", 7)?;

        Ok(Self {
            server_addr,
            database_url,
            vector_store_dir,
            upload_dir,
            max_upload_bytes,
            cors_origins,
            embedding_provider,
            embedding_model,
            huggingface_api_key,
            huggingface_base_url,
            openrouter_api_key,
            llm_chat_model,
            llm_temperature,
            llm_max_tokens,
            retriever_top_k,
            chunk_size,
            chunk_overlap,
            jwt_secret,
            access_token_ttl_minutes,
            refresh_token_ttl_days,
        })
    }
}

fn parse_number<T, F>(var: &F, key: &str, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow!("Valor inválido para {key} ('{raw}'): {e}")),
        None => Ok(default),
    }
}
