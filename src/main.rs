//! # finsight CLI (`fin`)
//!
//! The `fin` binary drives the full system from the command line: database
//! initialization, document ingestion, previews, chat, conversation
//! management, the accounting surface, and the API server.
//!
//! ## Usage
//!
//! ```bash
//! fin --config ./config/fin.toml <command>
//! ```
//!
//! ## Examples
//!
//! ```bash
//! # Initialize the database
//! fin init
//!
//! # Ingest a local file / a web page / a batch
//! fin ingest file ./reports/q1.pdf
//! fin ingest web-url https://example.com/post
//! fin ingest pdf-url https://example.com/whitepaper.pdf
//!
//! # Ask a grounded question
//! fin chat "what did revenue reach in Q1?" --mode rag
//!
//! # Accounting
//! fin accounting connect
//! fin accounting metrics --company "Acme Co"
//!
//! # Serve the HTTP API
//! fin serve
//! ```

use anyhow::Result;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::sync::Arc;

use finsight::chat::{ChatOrchestrator, ChatRequest};
use finsight::config::{self, Config};
use finsight::conversation::{ConversationLocks, ConversationStore};
use finsight::ingest::IngestPipeline;
use finsight::models::{ChatMode, DocumentStatus};
use finsight::registry::DocumentRegistry;
use finsight::sources::SourceInput;
use finsight::{db, migrate, server};

/// finsight — a document-grounded assistant backend with live accounting
/// integration.
#[derive(Parser)]
#[command(
    name = "fin",
    about = "finsight — document-grounded assistant backend with live accounting integration",
    version
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fin.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Idempotent.
    Init,

    /// Ingest one or more sources into the knowledge base.
    Ingest {
        #[command(subcommand)]
        source: IngestSource,
    },

    /// Preview a remote source without creating a document.
    Preview {
        /// URL to fetch.
        url: String,
        /// Declared kind when the server's Content-Type is unreliable
        /// (pdf, html, xlsx, csv, docx, image, text).
        #[arg(long)]
        kind: Option<String>,
    },

    /// Document management.
    Docs {
        #[command(subcommand)]
        action: DocsAction,
    },

    /// One chat turn. Prints the assistant reply and citations.
    Chat {
        /// The user message.
        message: String,
        /// `rag` (document-grounded) or `general`.
        #[arg(long, default_value = "rag")]
        mode: String,
        /// Continue an existing conversation.
        #[arg(long)]
        conversation: Option<String>,
    },

    /// Conversation management.
    Conversations {
        #[command(subcommand)]
        action: ConversationsAction,
    },

    /// Accounting system surface.
    Accounting {
        #[command(subcommand)]
        action: AccountingAction,
    },

    /// Start the HTTP API server.
    Serve,
}

#[derive(Subcommand)]
enum IngestSource {
    /// A local file (pdf, docx, xlsx, csv, html, image, text).
    File { path: PathBuf },
    /// A remote PDF link.
    PdfUrl { url: String },
    /// A web page.
    WebUrl { url: String },
    /// A cloud-drive file.
    DriveFile { url: String },
    /// A cloud-drive folder (fans out to every child file).
    DriveFolder { url: String },
}

#[derive(Subcommand)]
enum DocsAction {
    /// List documents, newest first.
    List {
        #[arg(long, default_value_t = 0)]
        skip: i64,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Aggregate statistics.
    Stats,
    /// Delete a document and all of its chunks.
    Delete { id: String },
}

#[derive(Subcommand)]
enum ConversationsAction {
    /// List conversations, newest first.
    List {
        #[arg(long, default_value_t = 0)]
        skip: i64,
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Show one conversation's messages.
    Messages {
        id: String,
        #[arg(long, default_value_t = 0)]
        skip: i64,
        #[arg(long, default_value_t = 50)]
        limit: i64,
    },
    /// Delete a conversation and its messages.
    Delete { id: String },
}

#[derive(Subcommand)]
enum AccountingAction {
    /// Connect to the accounting system and enumerate companies.
    Connect,
    /// Drop the connection.
    Disconnect,
    /// Connection state plus a liveness probe.
    Status,
    /// List companies (cached while connected).
    Companies,
    /// List ledgers for a company.
    Ledgers {
        #[arg(long)]
        company: String,
    },
    /// List vouchers for a company.
    Vouchers {
        #[arg(long)]
        company: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
        #[arg(long)]
        voucher_type: Option<String>,
    },
    /// List stock items for a company.
    Stock {
        #[arg(long)]
        company: String,
    },
    /// Financial metrics snapshot (live when connected, demo otherwise).
    Metrics {
        #[arg(long)]
        company: String,
        #[arg(long)]
        from: Option<String>,
        #[arg(long)]
        to: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("finsight=info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Ingest { source } => {
            let input = match source {
                IngestSource::File { path } => {
                    let bytes = std::fs::read(&path)?;
                    let name = path
                        .file_name()
                        .map(|n| n.to_string_lossy().to_string())
                        .unwrap_or_else(|| path.display().to_string());
                    SourceInput::Upload { name, bytes }
                }
                IngestSource::PdfUrl { url } => SourceInput::PdfUrl { url },
                IngestSource::WebUrl { url } => SourceInput::WebUrl { url },
                IngestSource::DriveFile { url } => SourceInput::DriveFile { url },
                IngestSource::DriveFolder { url } => SourceInput::DriveFolder { url },
            };
            run_ingest(&cfg, vec![input]).await?;
        }
        Commands::Preview { url, kind } => {
            let cfg = Arc::new(cfg);
            let pool = db::connect(&cfg).await?;
            migrate::apply_schema(&pool).await?;
            let pipeline = Arc::new(IngestPipeline::new(Arc::clone(&cfg), pool)?);

            let declared = kind.as_deref().and_then(parse_kind);
            match pipeline.preview(&url, declared).await {
                Ok(preview) => {
                    println!("supported: {}", preview.supported);
                    println!("words: {}  chars: {}", preview.word_count, preview.char_count);
                    if !preview.excerpt.is_empty() {
                        println!();
                        println!("{}", preview.excerpt);
                    }
                }
                Err(e) => {
                    println!("preview failed: {}", e);
                }
            }
        }
        Commands::Docs { action } => {
            let pool = db::connect(&cfg).await?;
            migrate::apply_schema(&pool).await?;
            let registry = DocumentRegistry::new(pool);
            match action {
                DocsAction::List { skip, limit } => {
                    let documents = registry.list(skip, limit).await?;
                    if documents.is_empty() {
                        println!("No documents.");
                    }
                    for doc in documents {
                        println!(
                            "{}  [{}] {} ({} chunks){}",
                            doc.id,
                            doc.status.as_str(),
                            doc.display_name,
                            doc.chunk_count,
                            doc.failure_reason
                                .map(|r| format!(" — {}", r))
                                .unwrap_or_default()
                        );
                    }
                }
                DocsAction::Stats => {
                    let stats = registry.stats().await?;
                    println!("documents: {}", stats.total_documents);
                    println!("  processed: {}", stats.processed_documents);
                    println!("  failed:    {}", stats.failed_documents);
                    println!("chunks: {}", stats.vector_stats.total_chunks);
                }
                DocsAction::Delete { id } => {
                    if registry.delete(&id).await? {
                        println!("deleted {}", id);
                    } else {
                        println!("document not found: {}", id);
                    }
                }
            }
        }
        Commands::Chat {
            message,
            mode,
            conversation,
        } => {
            let mode = match mode.as_str() {
                "rag" => ChatMode::Rag,
                "general" => ChatMode::General,
                other => anyhow::bail!("unknown mode: {} (use rag or general)", other),
            };

            let cfg = Arc::new(cfg);
            let pool = db::connect(&cfg).await?;
            migrate::apply_schema(&pool).await?;
            let orchestrator = ChatOrchestrator::new(
                Arc::clone(&cfg),
                pool,
                Arc::new(ConversationLocks::new()),
            )?;

            let response = orchestrator
                .chat(ChatRequest {
                    message,
                    conversation_id: conversation,
                    mode,
                })
                .await?;

            println!("{}", response.message.content);
            println!();
            println!("conversation: {}", response.conversation_id);
            println!("context used: {}", response.context_used);
            for source in &response.sources {
                println!("  source [{:.2}] {}", source.score, source.display_name);
            }
        }
        Commands::Conversations { action } => {
            let pool = db::connect(&cfg).await?;
            migrate::apply_schema(&pool).await?;
            let store = ConversationStore::new(pool);
            match action {
                ConversationsAction::List { skip, limit } => {
                    let conversations = store.list(skip, limit).await?;
                    if conversations.is_empty() {
                        println!("No conversations.");
                    }
                    for conv in conversations {
                        println!("{}  {}", conv.id, conv.title);
                    }
                }
                ConversationsAction::Messages { id, skip, limit } => {
                    let messages = store.list_messages(&id, skip, limit).await?;
                    for message in messages {
                        println!("[{}] {}", message.role.as_str(), message.content);
                        println!();
                    }
                }
                ConversationsAction::Delete { id } => {
                    if store.delete(&id).await? {
                        println!("deleted {}", id);
                    } else {
                        println!("conversation not found: {}", id);
                    }
                }
            }
        }
        Commands::Accounting { action } => {
            run_accounting(&cfg, action).await?;
        }
        Commands::Serve => {
            server::run_server(&cfg).await?;
        }
    }

    Ok(())
}

fn parse_kind(kind: &str) -> Option<finsight::extract::ContentKind> {
    use finsight::extract::ContentKind;
    match kind {
        "pdf" => Some(ContentKind::Pdf),
        "html" | "web" => Some(ContentKind::Html),
        "xlsx" => Some(ContentKind::Xlsx),
        "csv" => Some(ContentKind::Csv),
        "docx" => Some(ContentKind::Docx),
        "image" => Some(ContentKind::Image),
        "text" => Some(ContentKind::Text),
        _ => None,
    }
}

async fn run_ingest(cfg: &Config, inputs: Vec<SourceInput>) -> Result<()> {
    let cfg = Arc::new(cfg.clone());
    let pool = db::connect(&cfg).await?;
    migrate::apply_schema(&pool).await?;
    let pipeline = Arc::new(IngestPipeline::new(Arc::clone(&cfg), pool)?);

    let documents = pipeline
        .ingest(inputs)
        .await
        .map_err(|e| anyhow::anyhow!(e.to_string()))?;

    let completed = documents
        .iter()
        .filter(|d| d.status == DocumentStatus::Completed)
        .count();
    let failed = documents.len() - completed;

    println!("ingest");
    println!("  documents: {}", documents.len());
    println!("  completed: {}", completed);
    println!("  failed:    {}", failed);
    for doc in &documents {
        match doc.status {
            DocumentStatus::Completed => {
                println!("  {} {} ({} chunks)", doc.id, doc.display_name, doc.chunk_count)
            }
            _ => println!(
                "  {} {} — {}",
                doc.id,
                doc.display_name,
                doc.failure_reason.as_deref().unwrap_or("failed")
            ),
        }
    }
    println!("ok");
    Ok(())
}

async fn run_accounting(cfg: &Config, action: AccountingAction) -> Result<()> {
    use finsight::aggregator::AccountingAggregator;
    use finsight::connector::AccountingConnector;

    let connector = Arc::new(AccountingConnector::new(cfg.accounting.clone()));

    match action {
        AccountingAction::Connect => match connector.connect().await {
            Ok(status) => {
                println!("connected to {}", connector.endpoint());
                if let Some(company) = status.company_name {
                    println!("company: {}", company);
                }
            }
            Err(e) => println!("connect failed: {}", e),
        },
        AccountingAction::Disconnect => {
            connector.disconnect().await;
            println!("disconnected");
        }
        AccountingAction::Status => {
            let status = connector.test_connection().await;
            println!("endpoint: {}", connector.endpoint());
            println!("status: {:?}", status.status);
            if let Some(company) = status.company_name {
                println!("company: {}", company);
            }
            if let Some(error) = status.last_error {
                println!("last error: {}", error);
            }
        }
        AccountingAction::Companies => {
            // Company enumeration happens at connect; a one-shot CLI call
            // connects first.
            let _ = connector.connect().await;
            let companies = connector.companies().await;
            if companies.is_empty() {
                println!("No companies (not connected?).");
            }
            for company in companies {
                println!("{}", company.name);
            }
        }
        AccountingAction::Ledgers { company } => {
            let _ = connector.connect().await;
            match connector.ledgers(&company).await {
                Ok(ledgers) => {
                    for l in &ledgers {
                        println!("{:<40} {:<28} {:>14.2}", l.name, l.parent, l.closing_balance);
                    }
                    println!("{} ledgers", ledgers.len());
                }
                Err(e) => println!("ledger fetch failed: {}", e),
            }
        }
        AccountingAction::Vouchers {
            company,
            from,
            to,
            voucher_type,
        } => {
            let _ = connector.connect().await;
            match connector
                .vouchers(&company, from.as_deref(), to.as_deref(), voucher_type.as_deref())
                .await
            {
                Ok(vouchers) => {
                    for v in &vouchers {
                        println!(
                            "{:<10} {:<16} {:<24} {:>12.2}",
                            v.date, v.voucher_type, v.party, v.amount
                        );
                    }
                    println!("{} vouchers", vouchers.len());
                }
                Err(e) => println!("voucher fetch failed: {}", e),
            }
        }
        AccountingAction::Stock { company } => {
            let _ = connector.connect().await;
            match connector.stock_items(&company).await {
                Ok(items) => {
                    for item in &items {
                        println!("{:<40} {:<20} {:>12.2}", item.name, item.category, item.closing_balance);
                    }
                    println!("{} stock items", items.len());
                }
                Err(e) => println!("stock fetch failed: {}", e),
            }
        }
        AccountingAction::Metrics { company, from, to } => {
            let _ = connector.connect().await;
            let aggregator = AccountingAggregator::new(Arc::clone(&connector), &cfg.accounting);
            let snapshot = aggregator
                .financial_metrics(&company, from.as_deref(), to.as_deref())
                .await;
            println!("company: {}", snapshot.company);
            println!("revenue:   {:>14.2}", snapshot.revenue);
            println!("expenses:  {:>14.2}", snapshot.expenses);
            println!("profit:    {:>14.2}", snapshot.profit);
            println!("net worth: {:>14.2}", snapshot.net_worth);
            println!("source: {:?}", snapshot.data_source);
        }
    }
    Ok(())
}
