//! Abstracción sobre Rig para el modelo de chat y agrupación de embeddings +
//! chat en un único `LlmManager` compartido por la aplicación.

use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use tracing::debug;

use crate::config::AppConfig;
use crate::embeddings::{self, Embedder};

/// Prompt "stuff": todo el contexto recuperado va en el mensaje de sistema.
pub const STUFF_SYSTEM_PROMPT: &str = "Use the following pieces of context to answer the user's question. \
If you don't know the answer, just say that you don't know, don't try to make up an answer.\n\
----------------\n";

#[async_trait]
pub trait ChatModel: Send + Sync {
    /// Una única llamada de generación, sin streaming.
    async fn complete(&self, system: &str, prompt: &str) -> Result<String>;
}

/// Modelo de chat alojado en OpenRouter.
#[derive(Debug, Clone)]
pub struct OpenRouterChat {
    api_key: String,
    model: String,
    temperature: f64,
    max_tokens: u64,
}

impl OpenRouterChat {
    pub fn new(api_key: &str, model: &str, temperature: f64, max_tokens: u64) -> Self {
        Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            temperature,
            max_tokens,
        }
    }
}

#[async_trait]
impl ChatModel for OpenRouterChat {
    async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
        use rig::completion::Prompt;
        use rig::providers::openrouter;
        // Trait para client.agent(...)
        use rig::client::CompletionClient as _;

        let client = openrouter::Client::new(&self.api_key);
        let agent = client
            .agent(&self.model)
            .preamble(system)
            .temperature(self.temperature)
            .max_tokens(self.max_tokens)
            .build();

        debug!("Llamando a OpenRouter con el modelo {}", self.model);
        let answer = agent.prompt(prompt).await?;
        Ok(answer)
    }
}

/// Gestor de LLMs y embeddings.
#[derive(Clone)]
pub struct LlmManager {
    embedder: Arc<dyn Embedder>,
    chat: Arc<dyn ChatModel>,
}

impl LlmManager {
    pub fn new(embedder: Arc<dyn Embedder>, chat: Arc<dyn ChatModel>) -> Self {
        Self { embedder, chat }
    }

    /// Construye el manager a partir de la configuración.
    pub fn from_config(cfg: &AppConfig) -> Result<Self> {
        let api_key = cfg
            .openrouter_api_key
            .as_deref()
            .ok_or_else(|| anyhow!("Falta OPENROUTER_API_KEY en el entorno"))?;
        let chat = OpenRouterChat::new(
            api_key,
            &cfg.llm_chat_model,
            cfg.llm_temperature,
            cfg.llm_max_tokens,
        );
        Ok(Self::new(embeddings::create_embedder(cfg)?, Arc::new(chat)))
    }

    // ---------------------------------------------------------------------
    // EMBEDDINGS
    // ---------------------------------------------------------------------

    pub async fn embed_chunks(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        self.embedder.embed(texts.to_vec()).await
    }

    pub async fn embed_query(&self, question: &str) -> Result<Vec<f32>> {
        self.embedder
            .embed(vec![question.to_string()])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("No se pudo generar embedding de la pregunta"))
    }

    // ---------------------------------------------------------------------
    // CHAT / COMPLETION
    // ---------------------------------------------------------------------

    /// Genera una respuesta a partir de una pregunta y un contexto
    /// (concatenación de chunks relevantes).
    pub async fn answer_with_context(&self, question: &str, context: &str) -> Result<String> {
        let system = format!("{STUFF_SYSTEM_PROMPT}{context}");
        self.chat.complete(&system, question).await
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::Mutex;

    /// Devuelve el contexto recibido para poder inspeccionarlo en los tests.
    #[derive(Default)]
    pub struct EchoChat {
        pub calls: Mutex<Vec<(String, String)>>,
    }

    #[async_trait]
    impl ChatModel for EchoChat {
        async fn complete(&self, system: &str, prompt: &str) -> Result<String> {
            self.calls
                .lock()
                .unwrap()
                .push((system.to_string(), prompt.to_string()));
            Ok(format!("ANSWER[{prompt}] {system}"))
        }
    }
}
