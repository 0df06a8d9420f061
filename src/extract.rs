//! Per-format text extraction for ingested sources.
//!
//! Connectors supply bytes plus a detected [`ContentKind`]; this module
//! returns plain UTF-8 text, and for tabular formats (xlsx, csv) also a
//! row/column grid that the financial analyzer consumes. Extraction
//! failures are returned as [`IngestionError`] values — they mark the
//! document failed, never crash the pipeline.

use std::io::Read;

use crate::error::IngestionError;

/// Maximum sheets to process in an xlsx workbook.
const XLSX_MAX_SHEETS: usize = 50;
/// Maximum rows to process per sheet (avoids unbounded memory).
const XLSX_MAX_ROWS_PER_SHEET: usize = 50_000;
/// Maximum decompressed bytes to read from a single ZIP entry (zip-bomb
/// protection).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;

/// Format dispatched on by the extractor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Pdf,
    Docx,
    Xlsx,
    Csv,
    Html,
    Image,
    Text,
}

impl ContentKind {
    pub fn is_spreadsheet(&self) -> bool {
        matches!(self, ContentKind::Xlsx | ContentKind::Csv)
    }
}

/// Detect the content kind from a Content-Type header (preferred) or the
/// file name extension. `None` means the format is unsupported.
pub fn detect_kind(content_type: Option<&str>, name: &str) -> Option<ContentKind> {
    if let Some(ct) = content_type {
        let ct = ct.split(';').next().unwrap_or(ct).trim();
        match ct {
            "application/pdf" => return Some(ContentKind::Pdf),
            "application/vnd.openxmlformats-officedocument.wordprocessingml.document" => {
                return Some(ContentKind::Docx)
            }
            "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet" => {
                return Some(ContentKind::Xlsx)
            }
            "text/csv" => return Some(ContentKind::Csv),
            "text/html" | "application/xhtml+xml" => return Some(ContentKind::Html),
            _ => {
                if ct.starts_with("image/") {
                    return Some(ContentKind::Image);
                }
                if ct.starts_with("text/") {
                    return Some(ContentKind::Text);
                }
            }
        }
    }

    let ext = name.rsplit('.').next().unwrap_or("").to_lowercase();
    match ext.as_str() {
        "pdf" => Some(ContentKind::Pdf),
        "docx" => Some(ContentKind::Docx),
        "xlsx" => Some(ContentKind::Xlsx),
        "csv" => Some(ContentKind::Csv),
        "html" | "htm" => Some(ContentKind::Html),
        "png" | "jpg" | "jpeg" | "bmp" | "tiff" | "tif" => Some(ContentKind::Image),
        "txt" | "md" | "markdown" | "rst" | "log" => Some(ContentKind::Text),
        _ => None,
    }
}

/// Result of an extraction: flattened text plus, for tabular sources, the
/// cell grid the financial analyzer inspects.
#[derive(Debug, Clone)]
pub struct Extraction {
    pub text: String,
    pub table: Option<Vec<Vec<String>>>,
}

impl Extraction {
    fn text_only(text: String) -> Self {
        Self { text, table: None }
    }
}

/// Extract text (and a table grid where applicable) from raw bytes.
pub async fn extract(bytes: &[u8], kind: ContentKind) -> Result<Extraction, IngestionError> {
    match kind {
        ContentKind::Pdf => extract_pdf(bytes).map(Extraction::text_only),
        ContentKind::Docx => extract_docx(bytes).map(Extraction::text_only),
        ContentKind::Xlsx => {
            let rows = extract_xlsx_rows(bytes)?;
            Ok(grid_to_extraction(rows))
        }
        ContentKind::Csv => {
            let rows = extract_csv_rows(bytes)?;
            Ok(grid_to_extraction(rows))
        }
        ContentKind::Html => Ok(Extraction::text_only(extract_html(bytes))),
        ContentKind::Image => extract_image_ocr(bytes).await.map(Extraction::text_only),
        ContentKind::Text => Ok(Extraction::text_only(
            String::from_utf8_lossy(bytes).into_owned(),
        )),
    }
}

fn grid_to_extraction(rows: Vec<Vec<String>>) -> Extraction {
    let text = rows
        .iter()
        .map(|row| row.join(" | "))
        .filter(|line| !line.trim().is_empty())
        .collect::<Vec<_>>()
        .join("\n");
    Extraction {
        text,
        table: Some(rows),
    }
}

// ============ PDF ============

fn extract_pdf(bytes: &[u8]) -> Result<String, IngestionError> {
    pdf_extract::extract_text_from_mem(bytes)
        .map_err(|e| IngestionError::Extraction(format!("PDF: {}", e)))
}

// ============ OOXML plumbing ============

fn read_zip_entry_bounded(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
    name: &str,
    max_bytes: u64,
) -> Result<Vec<u8>, IngestionError> {
    let entry = archive
        .by_name(name)
        .map_err(|e| IngestionError::Extraction(format!("OOXML: {}", e)))?;
    let mut out = Vec::new();
    entry
        .take(max_bytes)
        .read_to_end(&mut out)
        .map_err(|e| IngestionError::Extraction(format!("OOXML: {}", e)))?;
    if out.len() as u64 >= max_bytes {
        return Err(IngestionError::Extraction(format!(
            "ZIP entry {} exceeds size limit ({} bytes)",
            name, max_bytes
        )));
    }
    Ok(out)
}

// ============ DOCX ============

/// Pull the `<w:t>` text runs out of `word/document.xml`, inserting a
/// newline at each paragraph end so structure survives (table cells are
/// text runs too and come along for free).
fn extract_docx(bytes: &[u8]) -> Result<String, IngestionError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| IngestionError::Extraction(format!("DOCX: {}", e)))?;
    let doc_xml = read_zip_entry_bounded(&mut archive, "word/document.xml", MAX_XML_ENTRY_BYTES)?;

    let mut out = String::new();
    let mut reader = quick_xml::Reader::from_reader(doc_xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_t = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => {
                if e.local_name().as_ref() == b"t" {
                    in_t = true;
                }
            }
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                out.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"p" => out.push('\n'),
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(IngestionError::Extraction(format!("DOCX: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

// ============ XLSX ============

/// Parse worksheets into a row/column grid. Both shared-string cells and
/// inline numeric values are captured so the financial analyzer can see
/// headers and figures side by side.
fn extract_xlsx_rows(bytes: &[u8]) -> Result<Vec<Vec<String>>, IngestionError> {
    let mut archive = zip::ZipArchive::new(std::io::Cursor::new(bytes))
        .map_err(|e| IngestionError::Extraction(format!("XLSX: {}", e)))?;
    let shared_strings = read_shared_strings(&mut archive).unwrap_or_default();
    let sheet_names = list_worksheet_names(&mut archive);

    let mut rows: Vec<Vec<String>> = Vec::new();
    for name in sheet_names.into_iter().take(XLSX_MAX_SHEETS) {
        let sheet_xml = read_zip_entry_bounded(&mut archive, &name, MAX_XML_ENTRY_BYTES)?;
        parse_sheet_rows(&sheet_xml, &shared_strings, &mut rows)?;
    }
    Ok(rows)
}

fn read_shared_strings(
    archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>,
) -> Result<Vec<String>, IngestionError> {
    let xml = read_zip_entry_bounded(archive, "xl/sharedStrings.xml", MAX_XML_ENTRY_BYTES)?;
    let mut strings = Vec::new();
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(false);
    let mut buf = Vec::new();
    let mut in_si = false;
    let mut in_t = false;
    let mut current = String::new();
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"si" => {
                    in_si = true;
                    current.clear();
                }
                b"t" if in_si => in_t = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_t => {
                current.push_str(te.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(std::mem::take(&mut current));
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(IngestionError::Extraction(format!("XLSX: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

fn list_worksheet_names(archive: &mut zip::ZipArchive<std::io::Cursor<&[u8]>>) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with("xl/worksheets/sheet") && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches("xl/worksheets/sheet")
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn parse_sheet_rows(
    xml: &[u8],
    shared_strings: &[String],
    rows: &mut Vec<Vec<String>>,
) -> Result<(), IngestionError> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();

    let mut current_row: Vec<String> = Vec::new();
    let mut row_count = 0usize;
    let mut in_v = false;
    let mut in_inline_t = false;
    let mut cell_type: Option<Vec<u8>> = None;

    loop {
        if row_count >= XLSX_MAX_ROWS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => current_row.clear(),
                b"c" => {
                    cell_type = e.attributes().flatten().find_map(|a| {
                        (a.key.as_ref() == b"t").then(|| a.value.to_vec())
                    });
                }
                b"v" => in_v = true,
                b"t" if cell_type.as_deref() == Some(b"inlineStr".as_slice()) => {
                    in_inline_t = true
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(te)) if in_v || in_inline_t => {
                let v = te.unescape().unwrap_or_default();
                let s = v.trim();
                if in_inline_t {
                    current_row.push(s.to_string());
                } else if cell_type.as_deref() == Some(b"s".as_slice()) {
                    // Shared string index
                    if let Ok(i) = s.parse::<usize>() {
                        if let Some(shared) = shared_strings.get(i) {
                            current_row.push(shared.clone());
                        }
                    }
                } else if !s.is_empty() {
                    current_row.push(s.to_string());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_v = false,
                b"t" => in_inline_t = false,
                b"c" => cell_type = None,
                b"row" => {
                    if !current_row.is_empty() {
                        rows.push(std::mem::take(&mut current_row));
                        row_count += 1;
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(IngestionError::Extraction(format!("XLSX: {}", e))),
            _ => {}
        }
        buf.clear();
    }
    Ok(())
}

// ============ CSV ============

fn extract_csv_rows(bytes: &[u8]) -> Result<Vec<Vec<String>>, IngestionError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(false)
        .flexible(true)
        .from_reader(bytes);

    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record.map_err(|e| IngestionError::Extraction(format!("CSV: {}", e)))?;
        let row: Vec<String> = record.iter().map(|f| f.trim().to_string()).collect();
        if row.iter().any(|f| !f.is_empty()) {
            rows.push(row);
        }
    }
    Ok(rows)
}

// ============ HTML ============

/// Strip markup and boilerplate containers, keeping visible text joined by
/// newlines.
fn extract_html(bytes: &[u8]) -> String {
    let html = String::from_utf8_lossy(bytes);
    let document = scraper::Html::parse_document(&html);

    const SKIP: &[&str] = &["script", "style", "nav", "footer", "header", "noscript"];

    let mut parts: Vec<String> = Vec::new();
    let mut stack = vec![document.tree.root()];
    while let Some(node) = stack.pop() {
        if let Some(el) = node.value().as_element() {
            if SKIP.contains(&el.name()) {
                continue;
            }
        }
        if let Some(text) = node.value().as_text() {
            let t = text.trim();
            if !t.is_empty() {
                parts.push(t.to_string());
            }
        }
        // Reverse so children pop in document order.
        let children: Vec<_> = node.children().collect();
        for child in children.into_iter().rev() {
            stack.push(child);
        }
    }

    parts.join("\n")
}

// ============ Image OCR ============

/// OCR via the system `tesseract` binary, fed through stdin/stdout. A
/// missing binary or empty output is an extraction failure for the one
/// document, never a crash.
async fn extract_image_ocr(bytes: &[u8]) -> Result<String, IngestionError> {
    use tokio::io::AsyncWriteExt;

    let binary = which::which("tesseract").map_err(|_| {
        IngestionError::Extraction("tesseract binary not found on PATH".to_string())
    })?;

    let mut child = tokio::process::Command::new(binary)
        .args(["stdin", "stdout"])
        .stdin(std::process::Stdio::piped())
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::null())
        .spawn()
        .map_err(|e| IngestionError::Extraction(format!("OCR: {}", e)))?;

    if let Some(mut stdin) = child.stdin.take() {
        stdin
            .write_all(bytes)
            .await
            .map_err(|e| IngestionError::Extraction(format!("OCR: {}", e)))?;
    }

    let output = child
        .wait_with_output()
        .await
        .map_err(|e| IngestionError::Extraction(format!("OCR: {}", e)))?;

    if !output.status.success() {
        return Err(IngestionError::Extraction(format!(
            "OCR exited with status {}",
            output.status
        )));
    }

    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
