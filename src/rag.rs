//! Consulta RAG contra el vector store local, acotada a los documentos del usuario.
//!
//! Flujo:
//!   1. Embedding de la pregunta.
//!   2. Búsqueda vectorial con filtro de igualdad sobre `user_id`.
//!   3. Comprobación explícita de propiedad de cada chunk recuperado.
//!   4. Contexto "stuff" (chunks concatenados) y una única llamada al LLM,
//!      también cuando no se recupera nada (contexto vacío).

use tracing::{info, warn};

use crate::{
    error::AppError,
    llm::LlmManager,
    models::ScoredChunk,
    vector_store::{MetadataFilter, VectorStore},
};

pub async fn rag_query(
    store: &VectorStore,
    llm: &LlmManager,
    user_id: &str,
    question: &str,
    top_k: usize,
) -> Result<String, AppError> {
    // 1) Embedding de la pregunta
    let query_vec = llm
        .embed_query(question)
        .await
        .map_err(|e| AppError::Embedding(e.to_string()))?;

    // 2) Buscar top_k chunks del usuario
    let hits = store
        .search(&query_vec, top_k, &MetadataFilter::for_user(user_id))
        .await
        .map_err(|e| AppError::VectorStore(e.to_string()))?;

    // 3) No confiamos sólo en el filtro del store
    let hits = retain_owned(hits, user_id);

    if hits.is_empty() {
        info!("Sin chunks para la pregunta de '{}', contexto vacío", user_id);
    }
    let context = build_context(&hits);

    // 4) Preguntar al LLM
    let answer = llm
        .answer_with_context(question, &context)
        .await
        .map_err(|e| AppError::Llm(e.to_string()))?;
    info!("Pregunta de '{}' respondida con {} chunks", user_id, hits.len());

    Ok(answer)
}

/// Descarta cualquier chunk cuyo propietario no sea `user_id`.
pub fn retain_owned(hits: Vec<ScoredChunk>, user_id: &str) -> Vec<ScoredChunk> {
    let before = hits.len();
    let owned: Vec<ScoredChunk> = hits
        .into_iter()
        .filter(|hit| hit.chunk.metadata.user_id == user_id)
        .collect();
    if owned.len() != before {
        warn!(
            "Descartados {} chunks ajenos al usuario '{}' tras la búsqueda",
            before - owned.len(),
            user_id
        );
    }
    owned
}

fn build_context(hits: &[ScoredChunk]) -> String {
    hits.iter()
        .map(|hit| hit.chunk.text.as_str())
        .collect::<Vec<_>>()
        .join("\n\n")
}
