//! Chat orchestration.
//!
//! A per-request state machine: resolve the conversation (creating it
//! lazily on first message), persist the user message, retrieve grounding
//! context when asked for and available, invoke the model, merge chart
//! payloads for spreadsheet-backed citations, and persist the assistant
//! reply. Model failure produces an assistant message carrying an explicit
//! error marker — the user's message is never lost, the turn is never
//! dropped.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use sqlx::SqlitePool;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::conversation::{ConversationLocks, ConversationStore};
use crate::embedding::{self, EmbeddingProvider};
use crate::error::ValidationError;
use crate::index::{QueryScope, VectorIndex};
use crate::llm::{self, ChatTurn, LlmProvider};
use crate::models::{ChatMode, Message, MessageRole, RetrievedChunk, SourceCitation};
use crate::registry::DocumentRegistry;

/// Marker prefixed to the assistant message when the model call fails.
pub const MODEL_ERROR_MARKER: &str = "[model error]";

const GENERAL_SYSTEM_PROMPT: &str = "You are a helpful, knowledgeable assistant.";
const GROUNDED_SYSTEM_PROMPT: &str =
    "You are a helpful assistant. Answer based on the context provided. Be concise and accurate.";

#[derive(Debug, Clone, serde::Deserialize)]
pub struct ChatRequest {
    pub message: String,
    #[serde(default)]
    pub conversation_id: Option<String>,
    pub mode: ChatMode,
}

#[derive(Debug, serde::Serialize)]
pub struct ChatResponse {
    pub message: Message,
    pub sources: Vec<SourceCitation>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charts: Option<serde_json::Value>,
    pub conversation_id: String,
    pub context_used: bool,
}

#[derive(Debug, Error)]
pub enum ChatError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("conversation not found: {0}")]
    ConversationNotFound(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

pub struct ChatOrchestrator {
    config: Arc<Config>,
    registry: DocumentRegistry,
    index: VectorIndex,
    store: ConversationStore,
    locks: Arc<ConversationLocks>,
    embedder: Arc<dyn EmbeddingProvider>,
    llm: Arc<dyn LlmProvider>,
}

impl ChatOrchestrator {
    pub fn new(config: Arc<Config>, pool: SqlitePool, locks: Arc<ConversationLocks>) -> Result<Self> {
        let embedder: Arc<dyn EmbeddingProvider> =
            embedding::create_provider(&config.embedding)?.into();
        let llm: Arc<dyn LlmProvider> = llm::create_provider(&config.llm)?.into();
        Ok(Self {
            registry: DocumentRegistry::new(pool.clone()),
            index: VectorIndex::new(pool.clone(), config.retrieval.max_top_k),
            store: ConversationStore::new(pool),
            locks,
            config,
            embedder,
            llm,
        })
    }

    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, ChatError> {
        if request.message.trim().is_empty() {
            return Err(ValidationError::MissingField("message").into());
        }

        // Resolve the conversation; lazily create on first message.
        let conversation = match &request.conversation_id {
            Some(id) => self
                .store
                .get(id)
                .await
                .map_err(ChatError::Internal)?
                .ok_or_else(|| ChatError::ConversationNotFound(id.clone()))?,
            None => self
                .store
                .create(&request.message)
                .await
                .map_err(ChatError::Internal)?,
        };

        // Serialize this conversation's turn; others proceed freely.
        let lock = self.locks.for_conversation(&conversation.id).await;
        let _guard = lock.lock().await;

        // History snapshot before this turn's messages are appended.
        let history = self
            .store
            .recent_messages(&conversation.id, self.config.llm.history_limit as i64)
            .await
            .map_err(ChatError::Internal)?;

        // The user's message is persisted before the model is involved, so
        // a model failure can never lose it.
        self.store
            .append_message(&conversation.id, MessageRole::User, &request.message, None, None)
            .await
            .map_err(ChatError::Internal)?;

        // Grounding: only in rag mode, only with completed documents, and
        // only when retrieval actually yields something above the cutoff.
        let retrieved = if request.mode == ChatMode::Rag {
            self.retrieve_context(&request.message).await
        } else {
            Vec::new()
        };
        let context_used = !retrieved.is_empty();

        let (context_text, sources, charts) = self
            .assemble_context(&retrieved)
            .await
            .map_err(ChatError::Internal)?;

        let turns = self.build_turns(&history, context_text.as_deref(), &request.message);

        let content = match self.llm.complete(&turns).await {
            Ok(answer) => answer,
            Err(e) => {
                warn!(conversation = %conversation.id, error = %e, "model invocation failed");
                format!("{} {}", MODEL_ERROR_MARKER, e)
            }
        };

        let assistant = self
            .store
            .append_message(
                &conversation.id,
                MessageRole::Assistant,
                &content,
                if sources.is_empty() {
                    None
                } else {
                    Some(sources.as_slice())
                },
                charts.as_ref(),
            )
            .await
            .map_err(ChatError::Internal)?;

        info!(
            conversation = %conversation.id,
            context_used,
            sources = sources.len(),
            "chat turn complete"
        );

        Ok(ChatResponse {
            message: assistant,
            sources,
            charts,
            conversation_id: conversation.id,
            context_used,
        })
    }

    /// Retrieve chunks for grounding. Every failure here degrades to "no
    /// context" — retrieval problems are never user-visible.
    async fn retrieve_context(&self, message: &str) -> Vec<RetrievedChunk> {
        let completed = match self.registry.completed_count().await {
            Ok(n) => n,
            Err(e) => {
                warn!(error = %e, "completed-count read failed; downgrading to general mode");
                return Vec::new();
            }
        };
        if completed == 0 {
            debug!("rag requested with no completed documents; downgrading");
            return Vec::new();
        }

        let query_vec = match embedding::embed_query(self.embedder.as_ref(), message).await {
            Ok(v) => v,
            Err(e) => {
                warn!(error = %e, "query embedding failed; downgrading to general mode");
                return Vec::new();
            }
        };

        match self
            .index
            .query(&query_vec, self.config.retrieval.top_k, QueryScope::All)
            .await
        {
            Ok(chunks) => chunks
                .into_iter()
                .filter(|c| c.score >= self.config.retrieval.min_similarity)
                .collect(),
            Err(e) => {
                warn!(error = %e, "index query failed; downgrading to general mode");
                Vec::new()
            }
        }
    }

    /// Turn retrieved chunks into bounded context text, citations, and any
    /// chart payloads carried by the cited documents.
    async fn assemble_context(
        &self,
        retrieved: &[RetrievedChunk],
    ) -> Result<(Option<String>, Vec<SourceCitation>, Option<serde_json::Value>)> {
        if retrieved.is_empty() {
            return Ok((None, Vec::new(), None));
        }

        // One registry read per distinct document.
        let mut documents = HashMap::new();
        for chunk in retrieved {
            if !documents.contains_key(&chunk.document_id) {
                if let Some(doc) = self.registry.get(&chunk.document_id).await? {
                    documents.insert(chunk.document_id.clone(), doc);
                }
            }
        }

        let max_chars = self.config.retrieval.max_context_chars;
        let mut context = String::new();
        let mut sources = Vec::new();

        for chunk in retrieved {
            if !context.is_empty() {
                if context.chars().count() + chunk.text.chars().count() + 2 > max_chars {
                    break;
                }
                context.push_str("\n\n");
            }
            context.push_str(&chunk.text);

            let display_name = documents
                .get(&chunk.document_id)
                .map(|d| d.display_name.clone())
                .unwrap_or_default();
            sources.push(SourceCitation {
                document_id: chunk.document_id.clone(),
                chunk_id: chunk.chunk_id.clone(),
                score: chunk.score,
                display_name,
            });
        }

        // Merge chart payloads from every cited spreadsheet document.
        let mut charts: Vec<serde_json::Value> = Vec::new();
        let mut seen = std::collections::HashSet::new();
        for citation in &sources {
            if !seen.insert(citation.document_id.clone()) {
                continue;
            }
            if let Some(chart_json) = documents
                .get(&citation.document_id)
                .and_then(|d| d.chart_json.as_deref())
            {
                if let Ok(serde_json::Value::Array(items)) = serde_json::from_str(chart_json) {
                    charts.extend(items);
                }
            }
        }

        let charts = if charts.is_empty() {
            None
        } else {
            Some(serde_json::Value::Array(charts))
        };

        Ok((Some(context), sources, charts))
    }

    fn build_turns(
        &self,
        history: &[Message],
        context: Option<&str>,
        message: &str,
    ) -> Vec<ChatTurn> {
        let mut turns = Vec::with_capacity(history.len() + 2);

        let system = match context {
            Some(ctx) => format!("{}\n\nContext:\n{}", GROUNDED_SYSTEM_PROMPT, ctx),
            None => GENERAL_SYSTEM_PROMPT.to_string(),
        };
        turns.push(ChatTurn {
            role: "system",
            content: system,
        });

        for past in history {
            turns.push(ChatTurn {
                role: match past.role {
                    MessageRole::User => "user",
                    MessageRole::Assistant => "assistant",
                },
                content: past.content.clone(),
            });
        }

        turns.push(ChatTurn {
            role: "user",
            content: message.to_string(),
        });
        turns
    }
}
