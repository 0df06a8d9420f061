//! Source normalization: turning whatever a caller submits into canonical
//! records the extraction pipeline can process.
//!
//! Accepted inputs are raw uploads, remote PDF links, web pages, and
//! cloud-drive files or folders. A folder input is expanded into one record
//! per child file (fan-out), each tagged with the parent folder reference.
//! Batch submission is a thin fan-out over the single-source path; one
//! item failing never aborts the rest.
//!
//! Validation failures (malformed URL, empty input) are rejected before
//! any Document exists. Fetch-side failures (unreachable host, unsupported
//! type, oversized payload) surface as [`Resolution::Failed`], which the
//! pipeline records as a failed Document without invoking extraction.

use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::IngestionConfig;
use crate::error::{IngestionError, ValidationError};
use crate::extract::{detect_kind, ContentKind};
use crate::models::OriginType;

/// What a caller submits for ingestion.
#[derive(Debug, Clone)]
pub enum SourceInput {
    Upload { name: String, bytes: Vec<u8> },
    PdfUrl { url: String },
    WebUrl { url: String },
    DriveFile { url: String },
    DriveFolder { url: String },
}

impl SourceInput {
    pub fn origin(&self) -> OriginType {
        match self {
            SourceInput::Upload { .. } => OriginType::Upload,
            SourceInput::PdfUrl { .. } => OriginType::PdfUrl,
            SourceInput::WebUrl { .. } => OriginType::WebUrl,
            SourceInput::DriveFile { .. } => OriginType::DriveFile,
            SourceInput::DriveFolder { .. } => OriginType::DriveFolder,
        }
    }
}

/// Enough metadata to create a Document row before (or instead of) any
/// content being available.
#[derive(Debug, Clone)]
pub struct SourceMeta {
    pub origin: OriginType,
    pub display_name: String,
    pub source_url: Option<String>,
}

/// A source with its content in hand, ready for extraction.
#[derive(Debug)]
pub struct NormalizedSource {
    pub meta: SourceMeta,
    pub bytes: Vec<u8>,
    pub kind: ContentKind,
    pub byte_size: Option<i64>,
}

/// Per-item outcome of normalization.
#[derive(Debug)]
pub enum Resolution {
    Ready(NormalizedSource),
    Failed {
        meta: SourceMeta,
        error: IngestionError,
    },
}

/// Preview of a remote source, computed without creating a Document.
#[derive(Debug, serde::Serialize)]
pub struct Preview {
    pub excerpt: String,
    pub word_count: usize,
    pub char_count: usize,
    pub supported: bool,
}

const PREVIEW_EXCERPT_CHARS: usize = 500;

/// Reject invalid input synchronously, before any Document is created.
pub fn validate(input: &SourceInput) -> Result<(), ValidationError> {
    match input {
        SourceInput::Upload { name, bytes } => {
            if name.trim().is_empty() {
                return Err(ValidationError::MissingField("name"));
            }
            if bytes.is_empty() {
                return Err(ValidationError::Invalid {
                    field: "file",
                    reason: "empty upload".to_string(),
                });
            }
        }
        SourceInput::PdfUrl { url }
        | SourceInput::WebUrl { url }
        | SourceInput::DriveFile { url }
        | SourceInput::DriveFolder { url } => {
            if url.trim().is_empty() {
                return Err(ValidationError::MissingField("url"));
            }
            url::Url::parse(url).map_err(|_| ValidationError::MalformedUrl(url.clone()))?;
        }
    }
    Ok(())
}

/// Normalizes inputs and fetches remote content.
pub struct SourceNormalizer {
    client: reqwest::Client,
    config: IngestionConfig,
}

impl SourceNormalizer {
    pub fn new(config: IngestionConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.fetch_timeout_secs))
            .user_agent(config.user_agent.clone())
            .build()
            .unwrap_or_default();
        Self { client, config }
    }

    /// Resolve one input into one or more per-item outcomes. Only a drive
    /// folder fans out to more than one.
    pub async fn resolve(&self, input: SourceInput) -> Vec<Resolution> {
        match input {
            SourceInput::Upload { name, bytes } => {
                let meta = SourceMeta {
                    origin: OriginType::Upload,
                    display_name: name.clone(),
                    source_url: None,
                };
                let size = bytes.len() as u64;
                if size > self.config.max_file_size_bytes() {
                    return vec![Resolution::Failed {
                        meta,
                        error: IngestionError::Oversized {
                            got: size,
                            limit: self.config.max_file_size_bytes(),
                        },
                    }];
                }
                match detect_kind(None, &name) {
                    Some(kind) => vec![Resolution::Ready(NormalizedSource {
                        meta,
                        byte_size: Some(size as i64),
                        bytes,
                        kind,
                    })],
                    None => vec![Resolution::Failed {
                        meta,
                        error: IngestionError::UnsupportedFormat(name),
                    }],
                }
            }
            SourceInput::PdfUrl { url } => {
                let meta = SourceMeta {
                    origin: OriginType::PdfUrl,
                    display_name: url.clone(),
                    source_url: Some(url.clone()),
                };
                vec![self.fetch_into(meta, &url, Some(ContentKind::Pdf)).await]
            }
            SourceInput::WebUrl { url } => {
                let meta = SourceMeta {
                    origin: OriginType::WebUrl,
                    display_name: url.clone(),
                    source_url: Some(url.clone()),
                };
                vec![self.fetch_into(meta, &url, Some(ContentKind::Html)).await]
            }
            SourceInput::DriveFile { url } => {
                let meta = SourceMeta {
                    origin: OriginType::DriveFile,
                    display_name: url.clone(),
                    source_url: Some(url.clone()),
                };
                match self.resolve_drive_file(&url, None).await {
                    Ok(res) => vec![res],
                    Err(error) => vec![Resolution::Failed { meta, error }],
                }
            }
            SourceInput::DriveFolder { url } => self.resolve_drive_folder(&url).await,
        }
    }

    /// Fetch a URL into a normalized source, classifying by the response
    /// Content-Type with `fallback` as the declared kind.
    async fn fetch_into(
        &self,
        meta: SourceMeta,
        url: &str,
        fallback: Option<ContentKind>,
    ) -> Resolution {
        match self.fetch_bytes(url).await {
            Ok((bytes, content_type)) => {
                let kind = detect_kind(content_type.as_deref(), url).or(fallback);
                match kind {
                    Some(kind) => Resolution::Ready(NormalizedSource {
                        byte_size: Some(bytes.len() as i64),
                        meta,
                        bytes,
                        kind,
                    }),
                    None => Resolution::Failed {
                        meta,
                        error: IngestionError::UnsupportedFormat(
                            content_type.unwrap_or_else(|| "unknown".to_string()),
                        ),
                    },
                }
            }
            Err(error) => Resolution::Failed { meta, error },
        }
    }

    /// GET a URL with the configured timeout and a streaming size cap.
    /// Returns the body and the Content-Type header.
    async fn fetch_bytes(&self, url: &str) -> Result<(Vec<u8>, Option<String>), IngestionError> {
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| classify_reqwest(url, e))?;

        let status = response.status();
        if !status.is_success() {
            return Err(IngestionError::Unreachable(format!(
                "{} returned HTTP {}",
                url, status
            )));
        }

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        let limit = self.config.max_file_size_bytes();
        if let Some(len) = response.content_length() {
            if len > limit {
                return Err(IngestionError::Oversized { got: len, limit });
            }
        }

        let mut bytes = Vec::new();
        let mut stream = response;
        while let Some(chunk) = stream
            .chunk()
            .await
            .map_err(|e| classify_reqwest(url, e))?
        {
            bytes.extend_from_slice(&chunk);
            if bytes.len() as u64 > limit {
                return Err(IngestionError::Oversized {
                    got: bytes.len() as u64,
                    limit,
                });
            }
        }

        debug!(url, bytes = bytes.len(), "fetched remote source");
        Ok((bytes, content_type))
    }

    // ============ Cloud drive ============

    fn drive_base(&self) -> Result<&str, IngestionError> {
        self.config
            .drive_base_url
            .as_deref()
            .ok_or_else(|| {
                IngestionError::Unreachable(
                    "cloud drive is not configured (ingestion.drive_base_url)".to_string(),
                )
            })
            .map(|s| s.trim_end_matches('/'))
    }

    async fn resolve_drive_file(
        &self,
        url: &str,
        parent_folder: Option<&str>,
    ) -> Result<Resolution, IngestionError> {
        let base = self.drive_base()?;
        let file_id = extract_drive_id(url)
            .ok_or_else(|| IngestionError::Unreachable(format!("no drive id in {}", url)))?;

        let meta_url = format!("{}/files/{}", base, file_id);
        let meta: DriveFileMeta = self
            .client
            .get(&meta_url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&meta_url, e))?
            .error_for_status()
            .map_err(|e| IngestionError::Unreachable(e.to_string()))?
            .json()
            .await
            .map_err(|e| IngestionError::Unreachable(format!("drive metadata: {}", e)))?;

        let source_url = match parent_folder {
            Some(folder) => format!("{}/files/{}?folder={}", base, file_id, folder),
            None => format!("{}/files/{}", base, file_id),
        };
        let doc_meta = SourceMeta {
            origin: OriginType::DriveFile,
            display_name: meta.name.clone(),
            source_url: Some(source_url),
        };

        let Some(kind) = detect_kind(meta.mime_type.as_deref(), &meta.name) else {
            return Ok(Resolution::Failed {
                meta: doc_meta,
                error: IngestionError::UnsupportedFormat(
                    meta.mime_type.unwrap_or_else(|| meta.name.clone()),
                ),
            });
        };

        let content_url = format!("{}/files/{}/content", base, file_id);
        match self.fetch_bytes(&content_url).await {
            Ok((bytes, _)) => Ok(Resolution::Ready(NormalizedSource {
                meta: doc_meta,
                byte_size: Some(bytes.len() as i64),
                bytes,
                kind,
            })),
            Err(error) => Ok(Resolution::Failed {
                meta: doc_meta,
                error,
            }),
        }
    }

    /// Enumerate a folder's children and resolve each through the
    /// single-file path. A child failing produces one failed record;
    /// siblings continue.
    async fn resolve_drive_folder(&self, url: &str) -> Vec<Resolution> {
        let folder_meta = SourceMeta {
            origin: OriginType::DriveFolder,
            display_name: url.to_string(),
            source_url: Some(url.to_string()),
        };

        let base = match self.drive_base() {
            Ok(b) => b.to_string(),
            Err(error) => {
                return vec![Resolution::Failed {
                    meta: folder_meta,
                    error,
                }]
            }
        };
        let Some(folder_id) = extract_drive_id(url) else {
            return vec![Resolution::Failed {
                meta: folder_meta,
                error: IngestionError::Unreachable(format!("no drive id in {}", url)),
            }];
        };

        let list_url = format!("{}/folders/{}/children", base, folder_id);
        let listing: DriveListing = match self
            .client
            .get(&list_url)
            .send()
            .await
            .map_err(|e| classify_reqwest(&list_url, e))
            .and_then(|r| {
                r.error_for_status()
                    .map_err(|e| IngestionError::Unreachable(e.to_string()))
            }) {
            Ok(response) => match response.json().await {
                Ok(listing) => listing,
                Err(e) => {
                    return vec![Resolution::Failed {
                        meta: folder_meta,
                        error: IngestionError::Unreachable(format!("drive listing: {}", e)),
                    }]
                }
            },
            Err(error) => {
                return vec![Resolution::Failed {
                    meta: folder_meta,
                    error,
                }]
            }
        };

        if listing.files.is_empty() {
            return vec![Resolution::Failed {
                meta: folder_meta,
                error: IngestionError::Unreachable("folder contains no files".to_string()),
            }];
        }

        let total = listing.files.len();
        if total > self.config.max_folder_files {
            warn!(
                folder = %folder_id,
                total,
                cap = self.config.max_folder_files,
                "folder listing truncated"
            );
        }

        let mut out = Vec::new();
        for child in listing.files.into_iter().take(self.config.max_folder_files) {
            let child_url = format!("{}/files/{}", base, child.id);
            match self.resolve_drive_file(&child_url, Some(&folder_id)).await {
                Ok(res) => out.push(res),
                Err(error) => out.push(Resolution::Failed {
                    meta: SourceMeta {
                        origin: OriginType::DriveFile,
                        display_name: child.name.clone(),
                        source_url: Some(child_url),
                    },
                    error,
                }),
            }
        }
        out
    }

    // ============ Preview ============

    /// Fetch and extract a short excerpt without creating a Document.
    pub async fn preview(
        &self,
        url: &str,
        declared_kind: Option<ContentKind>,
    ) -> Result<Preview, IngestionError> {
        let (bytes, content_type) = self.fetch_bytes(url).await?;

        let kind = detect_kind(content_type.as_deref(), url).or(declared_kind);
        let Some(kind) = kind else {
            return Ok(Preview {
                excerpt: String::new(),
                word_count: 0,
                char_count: 0,
                supported: false,
            });
        };

        let extraction = crate::extract::extract(&bytes, kind).await?;
        let text = extraction.text.trim();
        let excerpt: String = text.chars().take(PREVIEW_EXCERPT_CHARS).collect();

        Ok(Preview {
            excerpt,
            word_count: text.split_whitespace().count(),
            char_count: text.chars().count(),
            supported: true,
        })
    }
}

fn classify_reqwest(url: &str, e: reqwest::Error) -> IngestionError {
    if e.is_timeout() {
        IngestionError::Unreachable(format!("{} timed out", url))
    } else {
        IngestionError::Unreachable(format!("{}: {}", url, e))
    }
}

/// Pull the file/folder id out of a drive URL. Accepts `/files/{id}`,
/// `/file/d/{id}`, `/folders/{id}`, `?id={id}`, or a bare id.
fn extract_drive_id(url: &str) -> Option<String> {
    let is_id_char = |c: char| c.is_ascii_alphanumeric() || c == '-' || c == '_';

    for marker in ["/file/d/", "/files/", "/folders/"] {
        if let Some(pos) = url.find(marker) {
            let rest = &url[pos + marker.len()..];
            let id: String = rest.chars().take_while(|&c| is_id_char(c)).collect();
            if !id.is_empty() {
                return Some(id);
            }
        }
    }

    if let Some(pos) = url.find("id=") {
        let rest = &url[pos + 3..];
        let id: String = rest.chars().take_while(|&c| is_id_char(c)).collect();
        if !id.is_empty() {
            return Some(id);
        }
    }

    // Bare id
    if !url.is_empty() && url.chars().all(is_id_char) {
        return Some(url.to_string());
    }

    None
}

#[derive(Debug, Deserialize)]
struct DriveFileMeta {
    #[allow(dead_code)]
    #[serde(default)]
    id: String,
    name: String,
    #[serde(default)]
    mime_type: Option<String>,
    #[allow(dead_code)]
    #[serde(default)]
    size: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct DriveListing {
    #[serde(default)]
    files: Vec<DriveChild>,
}

#[derive(Debug, Deserialize)]
struct DriveChild {
    id: String,
    name: String,
    #[allow(dead_code)]
    #[serde(default)]
    mime_type: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_rejects_malformed_url() {
        let input = SourceInput::WebUrl {
            url: "not a url".to_string(),
        };
        assert!(matches!(
            validate(&input),
            Err(ValidationError::MalformedUrl(_))
        ));
    }

    #[test]
    fn validate_rejects_empty_upload() {
        let input = SourceInput::Upload {
            name: "x.txt".to_string(),
            bytes: Vec::new(),
        };
        assert!(validate(&input).is_err());

        let input = SourceInput::Upload {
            name: "  ".to_string(),
            bytes: b"data".to_vec(),
        };
        assert!(matches!(
            validate(&input),
            Err(ValidationError::MissingField("name"))
        ));
    }

    #[test]
    fn validate_accepts_wellformed() {
        assert!(validate(&SourceInput::PdfUrl {
            url: "https://example.com/a.pdf".to_string()
        })
        .is_ok());
        assert!(validate(&SourceInput::Upload {
            name: "a.txt".to_string(),
            bytes: b"hello".to_vec()
        })
        .is_ok());
    }

    #[tokio::test]
    async fn oversized_upload_fails_without_extraction() {
        let mut config = IngestionConfig::default();
        config.max_file_size_mb = 0; // limit of zero bytes
        let normalizer = SourceNormalizer::new(config);

        let out = normalizer
            .resolve(SourceInput::Upload {
                name: "big.txt".to_string(),
                bytes: b"too big".to_vec(),
            })
            .await;
        assert_eq!(out.len(), 1);
        assert!(matches!(
            out[0],
            Resolution::Failed {
                error: IngestionError::Oversized { .. },
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unsupported_extension_fails_without_extraction() {
        let normalizer = SourceNormalizer::new(IngestionConfig::default());
        let out = normalizer
            .resolve(SourceInput::Upload {
                name: "firmware.bin".to_string(),
                bytes: vec![0u8; 16],
            })
            .await;
        assert!(matches!(
            out[0],
            Resolution::Failed {
                error: IngestionError::UnsupportedFormat(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn unreachable_url_fails() {
        let mut config = IngestionConfig::default();
        config.fetch_timeout_secs = 2;
        let normalizer = SourceNormalizer::new(config);

        let out = normalizer
            .resolve(SourceInput::WebUrl {
                // Reserved TLD; resolution fails fast.
                url: "http://nonexistent.invalid/page".to_string(),
            })
            .await;
        assert!(matches!(
            out[0],
            Resolution::Failed {
                error: IngestionError::Unreachable(_),
                ..
            }
        ));
    }

    #[tokio::test]
    async fn drive_without_base_url_fails() {
        let normalizer = SourceNormalizer::new(IngestionConfig::default());
        let out = normalizer
            .resolve(SourceInput::DriveFile {
                url: "https://drive.example.com/files/abc123".to_string(),
            })
            .await;
        assert!(matches!(out[0], Resolution::Failed { .. }));
    }

    #[test]
    fn drive_id_extraction() {
        assert_eq!(
            extract_drive_id("https://drive.example.com/file/d/aB3-_x/view"),
            Some("aB3-_x".to_string())
        );
        assert_eq!(
            extract_drive_id("https://drive.example.com/folders/F0LD3R?usp=share"),
            Some("F0LD3R".to_string())
        );
        assert_eq!(
            extract_drive_id("https://drive.example.com/open?id=XYZ9"),
            Some("XYZ9".to_string())
        );
        assert_eq!(extract_drive_id("plainid42"), Some("plainid42".to_string()));
        assert_eq!(extract_drive_id("https://example.com/"), None);
    }
}
