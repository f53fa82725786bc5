//! Binary-to-Markdown file conversion.
//!
//! Turns PDF and OOXML (docx/pptx/xlsx) bytes into Markdown so downstream
//! chunking sees uniform text. Conversion is gated by a maximum file size
//! and a wall-clock timeout; extraction runs on a blocking task wrapped in
//! `tokio::time::timeout`, so cancellation is scoped and portable (no Unix
//! signals involved).
//!
//! On failure or unsupported input the document falls back to a textual
//! rendering (filename, metadata, and any bytes that decode as UTF-8), and
//! the outcome is recorded in `conversion_events` by the caller. Same input
//! always yields the same output; the change-detection hash is computed
//! over the post-conversion text.
//!
//! Excel workbooks render one `## <sheet>` section per sheet with
//! `|`-delimited table rows, and the document is flagged `is_excel_sheet`
//! so the Markdown chunker takes its H2-per-sheet path.

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use crate::config::FileConversionConfig;
use crate::llm::{ChatMessage, LlmProvider};
use crate::models::ConversionOutcome;

pub const MIME_PDF: &str = "application/pdf";
pub const MIME_DOCX: &str =
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document";
pub const MIME_PPTX: &str =
    "application/vnd.openxmlformats-officedocument.presentationml.presentation";
pub const MIME_XLSX: &str = "application/vnd.openxmlformats-officedocument.spreadsheetml.sheet";

/// Maximum decompressed bytes read from a single ZIP entry (zip-bomb guard).
const MAX_XML_ENTRY_BYTES: u64 = 50 * 1024 * 1024;
/// Sheet and cell caps for xlsx extraction.
const XLSX_MAX_SHEETS: usize = 100;
const XLSX_MAX_ROWS_PER_SHEET: usize = 50_000;

/// Result of one conversion attempt.
#[derive(Debug, Clone)]
pub struct Conversion {
    pub markdown: String,
    pub outcome: ConversionOutcome,
    /// Set when the output is sheet-structured Markdown from a workbook.
    pub is_excel_sheet: bool,
    pub detail: Option<String>,
}

impl Conversion {
    fn ok(markdown: String) -> Self {
        Self {
            markdown,
            outcome: ConversionOutcome::Converted,
            is_excel_sheet: false,
            detail: None,
        }
    }
}

/// Converter over binary document content.
pub struct FileConverter {
    config: FileConversionConfig,
    /// Used only for image descriptions when
    /// `markitdown.enable_llm_descriptions` is set.
    provider: Option<Arc<dyn LlmProvider>>,
}

impl FileConverter {
    pub fn new(config: FileConversionConfig, provider: Option<Arc<dyn LlmProvider>>) -> Self {
        Self { config, provider }
    }

    /// Convert `bytes` to Markdown.
    ///
    /// Never returns an error: every failure mode degrades to the textual
    /// fallback with the matching [`ConversionOutcome`].
    pub async fn convert(&self, bytes: &[u8], mime: &str, filename: &str) -> Conversion {
        if bytes.len() as u64 > self.config.max_file_size {
            tracing::warn!(
                file = filename,
                size = bytes.len(),
                limit = self.config.max_file_size,
                "file exceeds conversion size limit, skipping"
            );
            return Conversion {
                markdown: fallback_text(bytes, filename),
                outcome: ConversionOutcome::SkippedTooLarge,
                is_excel_sheet: false,
                detail: Some(format!("{} bytes over limit", bytes.len())),
            };
        }

        if mime.starts_with("image/") {
            return self.describe_image(bytes, mime, filename).await;
        }

        let kind = match mime {
            MIME_PDF => Kind::Pdf,
            MIME_DOCX => Kind::Docx,
            MIME_PPTX => Kind::Pptx,
            MIME_XLSX => Kind::Xlsx,
            _ => {
                return Conversion {
                    markdown: fallback_text(bytes, filename),
                    outcome: ConversionOutcome::Unsupported,
                    is_excel_sheet: false,
                    detail: Some(format!("unsupported content type: {mime}")),
                }
            }
        };

        let owned = bytes.to_vec();
        let timeout = Duration::from_secs(self.config.conversion_timeout_s);
        let extraction =
            tokio::time::timeout(timeout, tokio::task::spawn_blocking(move || extract(kind, &owned)))
                .await;

        match extraction {
            Ok(Ok(Ok(markdown))) => {
                let is_excel = kind == Kind::Xlsx;
                let mut conversion = Conversion::ok(markdown);
                conversion.is_excel_sheet = is_excel;
                conversion
            }
            Ok(Ok(Err(detail))) => {
                tracing::warn!(file = filename, %detail, "conversion failed");
                Conversion {
                    markdown: fallback_text(bytes, filename),
                    outcome: ConversionOutcome::Failed,
                    is_excel_sheet: false,
                    detail: Some(detail),
                }
            }
            Ok(Err(join_err)) => Conversion {
                markdown: fallback_text(bytes, filename),
                outcome: ConversionOutcome::Failed,
                is_excel_sheet: false,
                detail: Some(format!("conversion task failed: {join_err}")),
            },
            Err(_) => {
                tracing::warn!(
                    file = filename,
                    timeout_s = self.config.conversion_timeout_s,
                    "conversion timed out"
                );
                Conversion {
                    markdown: fallback_text(bytes, filename),
                    outcome: ConversionOutcome::Failed,
                    is_excel_sheet: false,
                    detail: Some("conversion timed out".to_string()),
                }
            }
        }
    }

    async fn describe_image(&self, bytes: &[u8], mime: &str, filename: &str) -> Conversion {
        if !self.config.markitdown.enable_llm_descriptions {
            return Conversion {
                markdown: fallback_text(bytes, filename),
                outcome: ConversionOutcome::Unsupported,
                is_excel_sheet: false,
                detail: Some("image description disabled".to_string()),
            };
        }
        let Some(provider) = &self.provider else {
            return Conversion {
                markdown: fallback_text(bytes, filename),
                outcome: ConversionOutcome::Unsupported,
                is_excel_sheet: false,
                detail: Some("no chat provider available".to_string()),
            };
        };

        let prompt = format!(
            "Describe the image '{filename}' ({mime}, {} bytes) in two sentences for a search index.",
            bytes.len()
        );
        match provider.chat(&[ChatMessage::user(prompt)]).await {
            Ok(caption) => Conversion::ok(format!("# {filename}\n\n## Description\n\n{caption}\n")),
            Err(e) => Conversion {
                markdown: fallback_text(bytes, filename),
                outcome: ConversionOutcome::Failed,
                is_excel_sheet: false,
                detail: Some(format!("caption failed: {e}")),
            },
        }
    }
}

/// Textual fallback used whenever conversion cannot produce Markdown:
/// filename plus whatever bytes decode as UTF-8.
pub fn fallback_text(bytes: &[u8], filename: &str) -> String {
    let mut out = format!("# {filename}\n");
    if let Ok(text) = std::str::from_utf8(bytes) {
        let printable = text
            .chars()
            .filter(|c| !c.is_control() || c.is_whitespace())
            .count();
        if !text.is_empty() && printable * 10 >= text.chars().count() * 9 {
            out.push('\n');
            out.push_str(text);
        }
    }
    out
}

// ============ Extraction ============

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Pdf,
    Docx,
    Pptx,
    Xlsx,
}

fn extract(kind: Kind, bytes: &[u8]) -> std::result::Result<String, String> {
    match kind {
        Kind::Pdf => pdf_extract::extract_text_from_mem(bytes).map_err(|e| e.to_string()),
        Kind::Docx => extract_docx(bytes),
        Kind::Pptx => extract_pptx(bytes),
        Kind::Xlsx => extract_xlsx(bytes),
    }
}

type ZipArchive<'a> = zip::ZipArchive<std::io::Cursor<&'a [u8]>>;

fn open_zip(bytes: &[u8]) -> std::result::Result<ZipArchive<'_>, String> {
    zip::ZipArchive::new(std::io::Cursor::new(bytes)).map_err(|e| e.to_string())
}

fn read_zip_entry(archive: &mut ZipArchive<'_>, name: &str) -> std::result::Result<Vec<u8>, String> {
    let entry = archive.by_name(name).map_err(|e| e.to_string())?;
    let mut out = Vec::new();
    entry
        .take(MAX_XML_ENTRY_BYTES)
        .read_to_end(&mut out)
        .map_err(|e| e.to_string())?;
    if out.len() as u64 >= MAX_XML_ENTRY_BYTES {
        return Err(format!("ZIP entry {name} exceeds size limit"));
    }
    Ok(out)
}

/// Numbered entries like `ppt/slides/slide3.xml`, sorted by index.
fn numbered_entries(archive: &ZipArchive<'_>, prefix: &str) -> Vec<String> {
    let mut names: Vec<String> = archive
        .file_names()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".xml"))
        .map(|s| s.to_string())
        .collect();
    names.sort_by_key(|name| {
        name.trim_start_matches(prefix)
            .trim_end_matches(".xml")
            .parse::<u32>()
            .unwrap_or(u32::MAX)
    });
    names
}

fn extract_docx(bytes: &[u8]) -> std::result::Result<String, String> {
    let mut archive = open_zip(bytes)?;
    let xml = read_zip_entry(&mut archive, "word/document.xml")?;

    // Paragraph elements become Markdown lines; runs within a paragraph
    // concatenate.
    let mut reader = quick_xml::Reader::from_reader(xml.as_slice());
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut out = String::new();
    let mut paragraph = String::new();
    let mut in_text = false;

    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"t" => in_text = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(t)) if in_text => {
                paragraph.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_text = false,
                b"p" => {
                    let line = paragraph.trim();
                    if !line.is_empty() {
                        out.push_str(line);
                        out.push_str("\n\n");
                    }
                    paragraph.clear();
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out.trim_end().to_string())
}

fn extract_pptx(bytes: &[u8]) -> std::result::Result<String, String> {
    let mut archive = open_zip(bytes)?;
    let slides = numbered_entries(&archive, "ppt/slides/slide");

    let mut out = String::new();
    for (i, name) in slides.iter().enumerate() {
        let xml = read_zip_entry(&mut archive, name)?;
        let text = collect_text_elements(&xml, b"t")?;
        out.push_str(&format!("## Slide {}\n\n", i + 1));
        for line in text {
            out.push_str(&line);
            out.push('\n');
        }
        out.push('\n');
    }
    Ok(out.trim_end().to_string())
}

/// All text content of `<{tag}>` elements, one entry per element.
fn collect_text_elements(xml: &[u8], tag: &[u8]) -> std::result::Result<Vec<String>, String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut out = Vec::new();
    let mut in_tag = false;
    loop {
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) if e.local_name().as_ref() == tag => {
                in_tag = true;
            }
            Ok(quick_xml::events::Event::Text(t)) if in_tag => {
                let s = t.unescape().unwrap_or_default().into_owned();
                if !s.is_empty() {
                    out.push(s);
                }
            }
            Ok(quick_xml::events::Event::End(e)) if e.local_name().as_ref() == tag => {
                in_tag = false;
            }
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(out)
}

fn extract_xlsx(bytes: &[u8]) -> std::result::Result<String, String> {
    let mut archive = open_zip(bytes)?;
    let shared = match read_zip_entry(&mut archive, "xl/sharedStrings.xml") {
        Ok(xml) => read_shared_strings(&xml)?,
        Err(_) => Vec::new(),
    };
    let sheets = numbered_entries(&archive, "xl/worksheets/sheet");

    let mut out = String::new();
    for (i, name) in sheets.iter().take(XLSX_MAX_SHEETS).enumerate() {
        let xml = read_zip_entry(&mut archive, name)?;
        let rows = extract_sheet_rows(&xml, &shared)?;
        out.push_str(&format!("## Sheet{}\n\n", i + 1));
        for (r, row) in rows.iter().enumerate() {
            out.push_str("| ");
            out.push_str(&row.join(" | "));
            out.push_str(" |\n");
            if r == 0 {
                out.push('|');
                out.push_str(&" --- |".repeat(row.len()));
                out.push('\n');
            }
        }
        out.push('\n');
    }
    Ok(out.trim_end().to_string())
}

fn read_shared_strings(xml: &[u8]) -> std::result::Result<Vec<String>, String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut strings = Vec::new();
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
            Ok(quick_xml::events::Event::Text(t)) if in_t => {
                current.push_str(t.unescape().unwrap_or_default().as_ref());
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"t" => in_t = false,
                b"si" => {
                    in_si = false;
                    strings.push(current.clone());
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(strings)
}

/// Rows of cell texts from a worksheet. Shared-string cells resolve through
/// the table; inline numeric cells keep their literal value.
fn extract_sheet_rows(
    xml: &[u8],
    shared: &[String],
) -> std::result::Result<Vec<Vec<String>>, String> {
    let mut reader = quick_xml::Reader::from_reader(xml);
    reader.config_mut().trim_text(true);
    let mut buf = Vec::new();
    let mut rows: Vec<Vec<String>> = Vec::new();
    let mut row: Vec<String> = Vec::new();
    let mut in_row = false;
    let mut in_value = false;
    let mut cell_is_shared = false;

    loop {
        if rows.len() >= XLSX_MAX_ROWS_PER_SHEET {
            break;
        }
        match reader.read_event_into(&mut buf) {
            Ok(quick_xml::events::Event::Start(e)) => match e.local_name().as_ref() {
                b"row" => {
                    in_row = true;
                    row.clear();
                }
                b"c" if in_row => {
                    cell_is_shared = e.attributes().any(|a| {
                        a.as_ref()
                            .map(|a| a.key.as_ref() == b"t" && a.value.as_ref() == b"s")
                            .unwrap_or(false)
                    });
                }
                b"v" if in_row => in_value = true,
                _ => {}
            },
            Ok(quick_xml::events::Event::Text(t)) if in_value => {
                let raw = t.unescape().unwrap_or_default();
                let value = raw.trim();
                if cell_is_shared {
                    if let Ok(i) = value.parse::<usize>() {
                        row.push(shared.get(i).cloned().unwrap_or_default());
                    }
                } else if !value.is_empty() {
                    row.push(value.to_string());
                }
            }
            Ok(quick_xml::events::Event::End(e)) => match e.local_name().as_ref() {
                b"v" => in_value = false,
                b"c" => cell_is_shared = false,
                b"row" => {
                    in_row = false;
                    if !row.is_empty() {
                        rows.push(std::mem::take(&mut row));
                    }
                }
                _ => {}
            },
            Ok(quick_xml::events::Event::Eof) => break,
            Err(e) => return Err(e.to_string()),
            _ => {}
        }
        buf.clear();
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::FakeLlmProvider;

    fn converter() -> FileConverter {
        FileConverter::new(FileConversionConfig::default(), None)
    }

    #[tokio::test]
    async fn unsupported_type_falls_back() {
        let c = converter()
            .convert(b"hello world", "application/octet-stream", "blob.bin")
            .await;
        assert_eq!(c.outcome, ConversionOutcome::Unsupported);
        assert!(c.markdown.contains("blob.bin"));
        assert!(c.markdown.contains("hello world"));
    }

    #[tokio::test]
    async fn oversized_file_is_skipped() {
        let config = FileConversionConfig {
            max_file_size: 4,
            ..FileConversionConfig::default()
        };
        let converter = FileConverter::new(config, None);
        let c = converter.convert(b"12345", MIME_PDF, "big.pdf").await;
        assert_eq!(c.outcome, ConversionOutcome::SkippedTooLarge);
    }

    #[tokio::test]
    async fn file_at_exact_limit_is_converted_or_failed_not_skipped() {
        let config = FileConversionConfig {
            max_file_size: 5,
            ..FileConversionConfig::default()
        };
        let converter = FileConverter::new(config, None);
        let c = converter.convert(b"12345", MIME_PDF, "edge.pdf").await;
        // 5 bytes at a 5-byte limit passes the gate; the garbage PDF then
        // fails extraction.
        assert_eq!(c.outcome, ConversionOutcome::Failed);
    }

    #[tokio::test]
    async fn invalid_pdf_records_failure_with_fallback() {
        let c = converter().convert(b"not a pdf", MIME_PDF, "broken.pdf").await;
        assert_eq!(c.outcome, ConversionOutcome::Failed);
        assert!(c.markdown.contains("broken.pdf"));
    }

    #[tokio::test]
    async fn invalid_zip_fails_for_docx() {
        let c = converter().convert(b"not a zip", MIME_DOCX, "doc.docx").await;
        assert_eq!(c.outcome, ConversionOutcome::Failed);
    }

    #[tokio::test]
    async fn conversion_is_idempotent() {
        let a = converter().convert(b"junk", MIME_PDF, "x.pdf").await;
        let b = converter().convert(b"junk", MIME_PDF, "x.pdf").await;
        assert_eq!(a.markdown, b.markdown);
        assert_eq!(a.outcome, b.outcome);
    }

    #[tokio::test]
    async fn image_without_captions_is_unsupported() {
        let c = converter().convert(b"\x89PNG", "image/png", "pic.png").await;
        assert_eq!(c.outcome, ConversionOutcome::Unsupported);
    }

    #[tokio::test]
    async fn image_caption_uses_chat() {
        let config = FileConversionConfig {
            markitdown: crate::config::MarkitdownConfig {
                enable_llm_descriptions: true,
            },
            ..FileConversionConfig::default()
        };
        let converter = FileConverter::new(config, Some(Arc::new(FakeLlmProvider::new(8))));
        let c = converter.convert(b"\x89PNG", "image/png", "pic.png").await;
        assert_eq!(c.outcome, ConversionOutcome::Converted);
        assert!(c.markdown.contains("## Description"));
    }

    #[test]
    fn fallback_skips_binary_garbage() {
        let text = fallback_text(&[0u8, 159, 146, 150], "bin.dat");
        assert_eq!(text, "# bin.dat\n");
    }

    fn make_docx(paragraphs: &[&str]) -> Vec<u8> {
        use std::io::Write;
        let body: String = paragraphs
            .iter()
            .map(|p| format!("<w:p><w:r><w:t>{p}</w:t></w:r></w:p>"))
            .collect();
        let xml = format!(
            r#"<?xml version="1.0"?><w:document xmlns:w="http://schemas.openxmlformats.org/wordprocessingml/2006/main"><w:body>{body}</w:body></w:document>"#
        );
        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            writer
                .start_file("word/document.xml", zip::write::SimpleFileOptions::default())
                .unwrap();
            writer.write_all(xml.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn docx_paragraphs_become_markdown_lines() {
        let bytes = make_docx(&["First paragraph.", "Second paragraph."]);
        let c = converter().convert(&bytes, MIME_DOCX, "doc.docx").await;
        assert_eq!(c.outcome, ConversionOutcome::Converted);
        assert!(c.markdown.contains("First paragraph.\n\nSecond paragraph."));
    }

    fn make_xlsx(rows: &[&[&str]]) -> Vec<u8> {
        use std::io::Write;
        let mut strings: Vec<String> = Vec::new();
        let mut rows_xml = String::new();
        for row in rows {
            rows_xml.push_str("<row>");
            for cell in *row {
                let idx = strings.len();
                strings.push(cell.to_string());
                rows_xml.push_str(&format!(r#"<c t="s"><v>{idx}</v></c>"#));
            }
            rows_xml.push_str("</row>");
        }
        let sheet = format!(
            r#"<?xml version="1.0"?><worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>{rows_xml}</sheetData></worksheet>"#
        );
        let shared: String = strings
            .iter()
            .map(|s| format!("<si><t>{s}</t></si>"))
            .collect();
        let shared_xml = format!(
            r#"<?xml version="1.0"?><sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main">{shared}</sst>"#
        );

        let mut cursor = std::io::Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut cursor);
            let opts = zip::write::SimpleFileOptions::default();
            writer.start_file("xl/sharedStrings.xml", opts).unwrap();
            writer.write_all(shared_xml.as_bytes()).unwrap();
            writer.start_file("xl/worksheets/sheet1.xml", opts).unwrap();
            writer.write_all(sheet.as_bytes()).unwrap();
            writer.finish().unwrap();
        }
        cursor.into_inner()
    }

    #[tokio::test]
    async fn xlsx_renders_sheet_sections_with_table_rows() {
        let bytes = make_xlsx(&[&["name", "count"], &["alpha", "3"], &["beta", "5"]]);
        let c = converter().convert(&bytes, MIME_XLSX, "book.xlsx").await;
        assert_eq!(c.outcome, ConversionOutcome::Converted);
        assert!(c.is_excel_sheet);
        assert!(c.markdown.contains("## Sheet1"));
        assert!(c.markdown.contains("| name | count |"));
        assert!(c.markdown.contains("| alpha | 3 |"));
    }
}
