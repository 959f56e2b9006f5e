//! Modelos de dominio (usuarios, tokens y chunks de documentos) y payloads de la API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Usuario persistido en la tabla `users`.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub hashed_password: String,
    pub created_at: DateTime<Utc>,
}

/// Credenciales recibidas en /signup y /signin.
#[derive(Debug, Clone, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// Par de tokens devuelto por signup, signin y refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
}

impl TokenPair {
    pub fn bearer(access_token: String, refresh_token: String) -> Self {
        Self {
            access_token,
            refresh_token,
            token_type: "bearer".to_string(),
        }
    }
}

/// Metadatos que acompañan a cada chunk en el vector store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkMetadata {
    pub user_id: String,
    pub filename: String,
}

/// Un trozo de texto de un documento subido, listo para indexarse.
#[derive(Debug, Clone)]
pub struct ChunkRecord {
    pub id: String,
    pub text: String,
    pub metadata: ChunkMetadata,
    pub created_at: DateTime<Utc>,
}

/// Resultado de una búsqueda vectorial.
#[derive(Debug, Clone)]
pub struct ScoredChunk {
    pub score: f64,
    pub chunk: ChunkRecord,
}

#[derive(Debug, Deserialize)]
pub struct AskParams {
    pub q: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AskResponse {
    pub question: String,
    pub answer: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UploadResponse {
    pub message: String,
    pub filename: String,
    pub chunks: usize,
}
