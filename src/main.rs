// Módulos de la aplicación
mod api;
mod app_state;
mod auth;
mod chunker;
mod config;
mod db;
mod embeddings;
mod error;
mod ingest;
mod llm;
mod models;
mod rag;
mod vector_store;

use anyhow::Context;
use tower_http::trace::TraceLayer;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Cargar .env e inicializar logging
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    // 2. Cargar configuración
    let cfg = config::AppConfig::from_env().context("Error al cargar la configuración")?;

    // 3. Base de datos de usuarios
    let pool = db::connect_from_config(&cfg)
        .await
        .context("Error conectando a la base de datos")?;
    db::ensure_schema(&pool)
        .await
        .context("Error asegurando el esquema de usuarios")?;

    // 4. Vector store en disco y directorio de subidas
    let vector_store = vector_store::VectorStore::open(&cfg.vector_store_dir)
        .await
        .context("Error abriendo el vector store")?;
    tokio::fs::create_dir_all(&cfg.upload_dir)
        .await
        .with_context(|| format!("Error creando el directorio de subidas {}", cfg.upload_dir))?;

    // 5. Inicializar gestor de LLMs
    let llm_manager =
        llm::LlmManager::from_config(&cfg).context("Error inicializando LLM Manager")?;

    // 6. Estado compartido y router
    let app_state = AppState::new(cfg.clone(), pool, vector_store, llm_manager)?;
    let app = api::create_router(app_state)
        .layer(api::cors_layer(&cfg.cors_origins))
        .layer(TraceLayer::new_for_http());

    // 7. Iniciar el servidor
    let listener = tokio::net::TcpListener::bind(&cfg.server_addr)
        .await
        .with_context(|| format!("No se pudo escuchar en {}", cfg.server_addr))?;
    info!("🚀 Servidor escuchando en http://{}", cfg.server_addr);

    // Apagado ordenado con Ctrl-C.
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            tokio::signal::ctrl_c().await.ok();
            info!("Señal de apagado recibida, iniciando cierre del servidor.");
        })
        .await?;

    info!("✅ Servidor cerrado correctamente.");
    Ok(())
}
