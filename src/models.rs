//! Core data models used throughout finsight.
//!
//! These types represent the documents, chunks, conversations, and
//! accounting records that flow through the ingestion, retrieval, and
//! aggregation pipelines.

use serde::{Deserialize, Serialize};

/// Where a document came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OriginType {
    Upload,
    PdfUrl,
    WebUrl,
    DriveFile,
    DriveFolder,
}

impl OriginType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OriginType::Upload => "upload",
            OriginType::PdfUrl => "pdf_url",
            OriginType::WebUrl => "web_url",
            OriginType::DriveFile => "drive_file",
            OriginType::DriveFolder => "drive_folder",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "upload" => Some(OriginType::Upload),
            "pdf_url" => Some(OriginType::PdfUrl),
            "web_url" => Some(OriginType::WebUrl),
            "drive_file" => Some(OriginType::DriveFile),
            "drive_folder" => Some(OriginType::DriveFolder),
            _ => None,
        }
    }
}

/// Processing lifecycle of a document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl DocumentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocumentStatus::Pending => "pending",
            DocumentStatus::Processing => "processing",
            DocumentStatus::Completed => "completed",
            DocumentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(DocumentStatus::Pending),
            "processing" => Some(DocumentStatus::Processing),
            "completed" => Some(DocumentStatus::Completed),
            "failed" => Some(DocumentStatus::Failed),
            _ => None,
        }
    }
}

/// Document metadata stored in SQLite. The extracted body lives in chunks;
/// the document row carries lifecycle state and provenance only.
#[derive(Debug, Clone, Serialize)]
pub struct Document {
    pub id: String,
    pub origin: OriginType,
    pub display_name: String,
    pub source_url: Option<String>,
    pub status: DocumentStatus,
    /// Byte size of the raw source. Null for remote sources whose size
    /// was never known.
    pub byte_size: Option<i64>,
    pub chunk_count: i64,
    pub failure_reason: Option<String>,
    /// Chart payloads produced by the financial analyzer, serialized JSON.
    /// Present only for spreadsheet-origin documents with recognized
    /// financial structure.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chart_json: Option<String>,
    pub created_at: i64,
}

/// A chunk of a document's extracted text. Chunks are owned exclusively by
/// their document and die with it.
#[derive(Debug, Clone)]
pub struct Chunk {
    pub id: String,
    pub document_id: String,
    /// Contiguous from 0 within the document, never reordered.
    pub chunk_index: i64,
    pub text: String,
    /// Character offsets into the extracted text.
    pub start_offset: i64,
    pub end_offset: i64,
}

/// A chunk returned from the retriever with its similarity score.
#[derive(Debug, Clone)]
pub struct RetrievedChunk {
    pub chunk_id: String,
    pub document_id: String,
    pub chunk_index: i64,
    pub text: String,
    pub score: f64,
    /// Creation timestamp of the owning document; used for recency
    /// tie-breaking in ranking.
    pub document_created_at: i64,
}

/// Persisted conversation. Title derives from the first user message.
#[derive(Debug, Clone, Serialize)]
pub struct Conversation {
    pub id: String,
    pub owner: String,
    pub title: String,
    pub created_at: i64,
}

/// One turn in a conversation. Immutable once persisted.
#[derive(Debug, Clone, Serialize)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceCitation>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub charts: Option<serde_json::Value>,
    /// Epoch milliseconds. Appends are serialized per conversation and
    /// ordered by (created_at, rowid), so the log is a total order.
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageRole {
    User,
    Assistant,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "user" => Some(MessageRole::User),
            "assistant" => Some(MessageRole::Assistant),
            _ => None,
        }
    }
}

/// A retrieved passage cited by an assistant message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceCitation {
    pub document_id: String,
    pub chunk_id: String,
    pub score: f64,
    pub display_name: String,
}

/// Chat mode, chosen per request and never stored on the conversation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatMode {
    General,
    Rag,
}

// ============ Accounting records ============

/// A company known to the accounting system.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Company {
    pub name: String,
}

/// A ledger account with its group and balances, parsed from the wire
/// format into canonical field names at the connector boundary.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub name: String,
    pub parent: String,
    pub opening_balance: f64,
    pub closing_balance: f64,
}

/// A voucher (transaction) record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Voucher {
    pub date: String,
    pub voucher_type: String,
    pub voucher_number: String,
    pub party: String,
    pub narration: String,
    pub amount: f64,
}

/// An inventory item with balances.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StockItem {
    pub name: String,
    pub parent: String,
    pub category: String,
    pub opening_balance: f64,
    pub closing_balance: f64,
}

/// Provenance of a financial snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataSource {
    Live,
    Demo,
}

/// Point-in-time financial summary. Recomputed per request, never stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinancialMetricsSnapshot {
    pub company: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_date: Option<String>,
    pub revenue: f64,
    pub expenses: f64,
    pub profit: f64,
    pub net_worth: f64,
    pub data_source: DataSource,
}
