//! Vector store persistente en disco para los chunks de documentos.
//!
//! El directorio configurado contiene un índice SQLite (`index.sqlite3`) con
//! una fila por chunk: texto, metadatos (`user_id`, `filename`) y el embedding
//! en un BLOB de f32 little-endian. La búsqueda aplica el filtro de metadatos
//! en SQL y calcula la similitud coseno sobre las filas que lo cumplen.
//!
//! API pública:
//!   - `VectorStore::open(dir)`
//!   - `add_chunks(&[ChunkRecord], &[Vec<f32>])`
//!   - `search(&[f32], usize, &MetadataFilter)`
//!   - `count(&MetadataFilter)`

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    QueryBuilder, Row, Sqlite, SqlitePool,
};
use tracing::{debug, info};

use crate::models::{ChunkMetadata, ChunkRecord, ScoredChunk};

const INDEX_FILE: &str = "index.sqlite3";

/// Filtro de igualdad sobre los metadatos de los chunks.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MetadataFilter {
    pub user_id: Option<String>,
    pub filename: Option<String>,
}

impl MetadataFilter {
    pub fn for_user(user_id: &str) -> Self {
        Self {
            user_id: Some(user_id.to_string()),
            filename: None,
        }
    }

    pub fn with_filename(mut self, filename: &str) -> Self {
        self.filename = Some(filename.to_string());
        self
    }

    fn push_where(&self, builder: &mut QueryBuilder<'_, Sqlite>) {
        builder.push(" WHERE 1 = 1");
        if let Some(user_id) = &self.user_id {
            builder.push(" AND user_id = ").push_bind(user_id.clone());
        }
        if let Some(filename) = &self.filename {
            builder.push(" AND filename = ").push_bind(filename.clone());
        }
    }
}

#[derive(Clone)]
pub struct VectorStore {
    pool: SqlitePool,
    dir: PathBuf,
}

impl VectorStore {
    /// Abre (o crea) el índice dentro de `dir`.
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        tokio::fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("No se pudo crear el directorio {}", dir.display()))?;

        let options = SqliteConnectOptions::new()
            .filename(dir.join(INDEX_FILE))
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await
            .context("No se pudo abrir el índice vectorial")?;

        let store = Self { pool, dir };
        store.ensure_schema().await?;
        info!("Vector store abierto en {}", store.dir.display());
        Ok(store)
    }

    async fn ensure_schema(&self) -> Result<()> {
        let statements = [
            "CREATE TABLE IF NOT EXISTS chunks (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                filename TEXT NOT NULL,
                text TEXT NOT NULL,
                embedding BLOB NOT NULL,
                dimension INTEGER NOT NULL,
                created_at TEXT NOT NULL
            )",
            "CREATE INDEX IF NOT EXISTS chunks_user_id ON chunks (user_id)",
        ];
        for stmt in statements {
            sqlx::query(stmt).execute(&self.pool).await?;
        }
        Ok(())
    }

    /// Inserta todos los chunks en una única transacción: o entran todos o ninguno.
    pub async fn add_chunks(&self, chunks: &[ChunkRecord], embeddings: &[Vec<f32>]) -> Result<usize> {
        if chunks.len() != embeddings.len() {
            return Err(anyhow!(
                "Número de embeddings ({}) distinto al número de chunks ({})",
                embeddings.len(),
                chunks.len()
            ));
        }
        for vector in embeddings {
            validate_vector(vector)?;
        }
        if chunks.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        for (chunk, vector) in chunks.iter().zip(embeddings) {
            sqlx::query(
                "INSERT INTO chunks (id, user_id, filename, text, embedding, dimension, created_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?)",
            )
            .bind(&chunk.id)
            .bind(&chunk.metadata.user_id)
            .bind(&chunk.metadata.filename)
            .bind(&chunk.text)
            .bind(encode_embedding(vector))
            .bind(vector.len() as i64)
            .bind(chunk.created_at)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("No se pudo insertar el chunk {}", chunk.id))?;
        }
        tx.commit().await?;

        debug!("{} chunks añadidos al vector store", chunks.len());
        Ok(chunks.len())
    }

    /// Devuelve los `top_k` chunks más parecidos a `query` que cumplen `filter`.
    pub async fn search(
        &self,
        query: &[f32],
        top_k: usize,
        filter: &MetadataFilter,
    ) -> Result<Vec<ScoredChunk>> {
        if query.is_empty() || top_k == 0 {
            return Ok(Vec::new());
        }
        validate_vector(query)?;

        let mut builder = QueryBuilder::<Sqlite>::new(
            "SELECT id, user_id, filename, text, embedding, dimension, created_at FROM chunks",
        );
        filter.push_where(&mut builder);
        builder
            .push(" AND dimension = ")
            .push_bind(query.len() as i64);

        let rows = builder.build().fetch_all(&self.pool).await?;

        let mut hits = Vec::with_capacity(rows.len());
        for row in rows {
            let blob: Vec<u8> = row.try_get("embedding")?;
            let candidate = decode_embedding(&blob)?;
            let Some(score) = cosine_similarity(query, &candidate) else {
                continue;
            };
            let created_at: DateTime<Utc> = row.try_get("created_at")?;
            hits.push(ScoredChunk {
                score,
                chunk: ChunkRecord {
                    id: row.try_get("id")?,
                    text: row.try_get("text")?,
                    metadata: ChunkMetadata {
                        user_id: row.try_get("user_id")?,
                        filename: row.try_get("filename")?,
                    },
                    created_at,
                },
            });
        }

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.chunk.id.cmp(&b.chunk.id))
        });
        hits.truncate(top_k);
        Ok(hits)
    }

    pub async fn count(&self, filter: &MetadataFilter) -> Result<i64> {
        let mut builder = QueryBuilder::<Sqlite>::new("SELECT COUNT(*) AS count FROM chunks");
        filter.push_where(&mut builder);
        let row = builder.build().fetch_one(&self.pool).await?;
        Ok(row.try_get("count")?)
    }
}

fn validate_vector(vector: &[f32]) -> Result<()> {
    if vector.iter().any(|v| !v.is_finite()) {
        return Err(anyhow!("El embedding contiene valores no finitos"));
    }
    Ok(())
}

fn encode_embedding(vector: &[f32]) -> Vec<u8> {
    vector.iter().flat_map(|v| v.to_le_bytes()).collect()
}

fn decode_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(anyhow!("Embedding corrupto: {} bytes", blob.len()));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
        .collect())
}

fn cosine_similarity(a: &[f32], b: &[f32]) -> Option<f64> {
    if a.len() != b.len() || a.is_empty() {
        return None;
    }
    let mut dot = 0.0f64;
    let mut norm_a = 0.0f64;
    let mut norm_b = 0.0f64;
    for (&x, &y) in a.iter().zip(b) {
        let (x, y) = (f64::from(x), f64::from(y));
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom <= f64::EPSILON {
        return None;
    }
    Some(dot / denom)
}
