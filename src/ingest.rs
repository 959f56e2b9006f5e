//! Ingesta de documentos subidos: extracción del texto según la extensión,
//! troceado, embeddings y persistencia en el vector store con los metadatos
//! del propietario.

use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use mime_guess::MimeGuess;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    chunker::TextSplitter,
    error::AppError,
    llm::LlmManager,
    models::{ChunkMetadata, ChunkRecord},
    vector_store::{MetadataFilter, VectorStore},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Pdf,
    Text,
}

impl DocumentKind {
    /// Elige el cargador por la extensión (sin distinguir mayúsculas).
    pub fn from_path(path: &Path) -> Result<Self, AppError> {
        let extension = path
            .extension()
            .and_then(std::ffi::OsStr::to_str)
            .unwrap_or("")
            .to_lowercase();
        match extension.as_str() {
            "pdf" => Ok(Self::Pdf),
            "txt" => Ok(Self::Text),
            _ => Err(AppError::UnsupportedFileType(path.display().to_string())),
        }
    }
}

/// Resumen de una ingesta.
#[derive(Debug, Default, Clone)]
pub struct IngestionSummary {
    pub filename: String,
    pub mime_type: Option<String>,
    pub characters: usize,
    pub chunks_created: usize,
}

impl std::fmt::Display for IngestionSummary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}): {} caracteres, {} chunks",
            self.filename,
            self.mime_type.as_deref().unwrap_or("desconocido"),
            self.characters,
            self.chunks_created
        )
    }
}

/// Se queda sólo con el nombre base del fichero enviado por el cliente.
pub fn sanitize_filename(raw: &str) -> Option<String> {
    let name = raw.rsplit(['/', '\\']).next()?.trim();
    if name.is_empty() || name == "." || name == ".." {
        return None;
    }
    Some(name.to_string())
}

/// Nombre de directorio para las subidas de un usuario.
fn user_dir_name(user_id: &str) -> String {
    let name: String = user_id
        .chars()
        .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect();
    if name.is_empty() {
        "_".to_string()
    } else {
        name
    }
}

/// Copia los bytes subidos a `upload_dir/<usuario>/filename`, sobrescribiendo
/// si existe. Cada usuario tiene su propio directorio.
pub async fn save_upload(
    upload_dir: &Path,
    user_id: &str,
    filename: &str,
    bytes: &[u8],
) -> Result<PathBuf> {
    let dir = upload_dir.join(user_dir_name(user_id));
    tokio::fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("No se pudo crear {}", dir.display()))?;
    let path = dir.join(filename);
    tokio::fs::write(&path, bytes)
        .await
        .with_context(|| format!("No se pudo escribir {}", path.display()))?;
    Ok(path)
}

/// Extrae el texto de los bytes recibidos, sin volver a leer del disco.
pub async fn extract_text(bytes: &[u8], kind: DocumentKind) -> Result<String> {
    match kind {
        DocumentKind::Text => {
            String::from_utf8(bytes.to_vec()).context("El fichero de texto no es UTF-8 válido")
        }
        DocumentKind::Pdf => {
            let owned = bytes.to_vec();
            tokio::task::spawn_blocking(move || pdf_extract::extract_text_from_mem(&owned))
                .await
                .context("La extracción del PDF terminó abruptamente")?
                .map_err(|e| anyhow!("No se pudo extraer texto del PDF: {}", e))
        }
    }
}

/// Extrae, trocea, calcula embeddings y guarda los chunks de un fichero subido
/// etiquetados con `user_id`. Subir dos veces el mismo fichero duplica sus chunks.
pub async fn ingest_upload(
    store: &VectorStore,
    llm: &LlmManager,
    splitter: &TextSplitter,
    filename: &str,
    bytes: &[u8],
    user_id: &str,
) -> Result<IngestionSummary, AppError> {
    let path = Path::new(filename);
    let kind = DocumentKind::from_path(path)?;
    let mime_type = MimeGuess::from_path(path).first().map(|m| m.to_string());

    let text = extract_text(bytes, kind)
        .await
        .map_err(|e| AppError::Ingestion(format!("{filename}: {e}")))?;

    let mut summary = IngestionSummary {
        filename: filename.to_string(),
        mime_type,
        characters: text.chars().count(),
        chunks_created: 0,
    };

    let pieces = splitter.split(&text);
    if pieces.is_empty() {
        warn!("Fichero vacío o sin texto útil: {}", filename);
        return Ok(summary);
    }

    let embeddings = llm
        .embed_chunks(&pieces)
        .await
        .map_err(|e| AppError::Embedding(e.to_string()))?;

    let now = Utc::now();
    let records: Vec<ChunkRecord> = pieces
        .into_iter()
        .map(|text| ChunkRecord {
            id: Uuid::new_v4().to_string(),
            text,
            metadata: ChunkMetadata {
                user_id: user_id.to_string(),
                filename: filename.to_string(),
            },
            created_at: now,
        })
        .collect();

    summary.chunks_created = store
        .add_chunks(&records, &embeddings)
        .await
        .map_err(|e| AppError::VectorStore(e.to_string()))?;

    let stored = store
        .count(&MetadataFilter::for_user(user_id).with_filename(filename))
        .await
        .map_err(|e| AppError::VectorStore(e.to_string()))?;
    info!(
        "Ingerido para '{}': {} ({} chunks de este fichero en el índice)",
        user_id, summary, stored
    );
    Ok(summary)
}
