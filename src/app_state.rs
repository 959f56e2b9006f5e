use std::path::PathBuf;

use chrono::Duration;
use sqlx::SqlitePool;

use crate::{
    auth::TokenService, chunker::TextSplitter, config::AppConfig, llm::LlmManager,
    vector_store::VectorStore,
};

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db: SqlitePool,
    pub tokens: TokenService,
    pub vector_store: VectorStore,
    pub llm_manager: LlmManager,
    pub splitter: TextSplitter,
    pub upload_dir: PathBuf,
}

impl AppState {
    pub fn new(
        config: AppConfig,
        db: SqlitePool,
        vector_store: VectorStore,
        llm_manager: LlmManager,
    ) -> anyhow::Result<Self> {
        let tokens = TokenService::new(
            &config.jwt_secret,
            Duration::minutes(config.access_token_ttl_minutes),
            Duration::days(config.refresh_token_ttl_days),
        );
        let splitter = TextSplitter::new(config.chunk_size, config.chunk_overlap)?;
        let upload_dir = PathBuf::from(&config.upload_dir);
        Ok(Self {
            config,
            db,
            tokens,
            vector_store,
            llm_manager,
            splitter,
            upload_dir,
        })
    }
}
