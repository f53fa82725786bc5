//! HTML chunking strategy.
//!
//! Two parse paths by input size: documents under
//! `simple_parsing_threshold` get a cheap whole-document text extraction;
//! larger documents (up to `max_html_size_for_parsing`) get a DOM walk that
//! starts a new section at every `h1`–`h6`, `article`, and `section`
//! element. Beyond the parse cap the document degrades to the plain-text
//! path over the stripped text.
//!
//! With `preserve_semantic_structure`, each section records the DOM path of
//! its opening element (e.g. `html > body > article > h2`).

use scraper::{Html, Node, Selector};
use serde_json::Value;

use super::{text, Piece};
use crate::config::ChunkingConfig;

pub fn chunk_html(content: &str, config: &ChunkingConfig) -> Vec<Piece> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    if content.len() < config.html.simple_parsing_threshold
        || content.len() > config.html.max_html_size_for_parsing
    {
        let stripped = extract_text(content);
        return text::chunk_plain(&stripped, config)
            .into_iter()
            .map(|mut p| {
                p.tags
                    .insert("html_parse".into(), Value::String("simple".into()));
                p
            })
            .collect();
    }

    let sections = dom_sections(content);
    let mut pieces = Vec::new();
    for section in sections {
        let body = section.text.trim();
        if body.is_empty() {
            continue;
        }
        if body.len() <= config.chunk_size {
            pieces.push(section_piece(body.to_string(), &section, config));
        } else {
            for part in text::split_oversized(body, config) {
                pieces.push(section_piece(part, &section, config));
            }
        }
    }
    pieces
}

struct DomSection {
    title: Option<String>,
    dom_path: Option<String>,
    text: String,
}

fn section_piece(content: String, section: &DomSection, config: &ChunkingConfig) -> Piece {
    let mut piece = Piece::new(content);
    piece.section_title = section.title.clone();
    piece
        .tags
        .insert("html_parse".into(), Value::String("dom".into()));
    if config.html.preserve_semantic_structure {
        if let Some(path) = &section.dom_path {
            piece
                .tags
                .insert("dom_path".into(), Value::String(path.clone()));
        }
    }
    piece
}

/// Whole-document text with tags stripped; block elements separate
/// paragraphs.
pub(crate) fn extract_text(html: &str) -> String {
    let document = Html::parse_document(html);
    let selector = Selector::parse("body").unwrap();
    let root = document.select(&selector).next();

    let mut out = String::new();
    match root {
        Some(body) => collect_text(body, &mut out),
        None => collect_text(document.root_element(), &mut out),
    }
    collapse_blank_lines(&out)
}

fn collect_text(element: scraper::ElementRef<'_>, out: &mut String) {
    for node in element.descendants() {
        match node.value() {
            Node::Text(t) => {
                if !in_ignored_element(&node) {
                    out.push_str(t);
                }
            }
            Node::Element(el) => {
                if is_block_tag(el.name()) {
                    out.push_str("\n\n");
                }
            }
            _ => {}
        }
    }
}

fn in_ignored_element(node: &ego_tree::NodeRef<'_, Node>) -> bool {
    node.ancestors().any(|a| {
        a.value()
            .as_element()
            .map(|el| matches!(el.name(), "script" | "style" | "noscript"))
            .unwrap_or(false)
    })
}

fn is_block_tag(name: &str) -> bool {
    matches!(
        name,
        "p" | "div"
            | "li"
            | "br"
            | "tr"
            | "h1"
            | "h2"
            | "h3"
            | "h4"
            | "h5"
            | "h6"
            | "article"
            | "section"
            | "pre"
            | "blockquote"
    )
}

fn is_section_boundary(name: &str) -> bool {
    matches!(
        name,
        "h1" | "h2" | "h3" | "h4" | "h5" | "h6" | "article" | "section"
    )
}

/// Walk the DOM in document order, starting a new section at each boundary
/// element.
fn dom_sections(html: &str) -> Vec<DomSection> {
    let document = Html::parse_document(html);
    let mut sections: Vec<DomSection> = Vec::new();
    let mut current = DomSection {
        title: None,
        dom_path: None,
        text: String::new(),
    };

    for node in document.root_element().descendants() {
        match node.value() {
            Node::Element(el) => {
                let name = el.name();
                if is_section_boundary(name) {
                    if !current.text.trim().is_empty() {
                        current.text = collapse_blank_lines(&current.text);
                        sections.push(current);
                    }
                    let title = if name.starts_with('h') {
                        let text: String = node
                            .descendants()
                            .filter_map(|n| n.value().as_text().map(|t| t.to_string()))
                            .collect();
                        let trimmed = text.trim().to_string();
                        (!trimmed.is_empty()).then_some(trimmed)
                    } else {
                        None
                    };
                    current = DomSection {
                        title,
                        dom_path: Some(dom_path(&node)),
                        text: String::new(),
                    };
                } else if is_block_tag(name) {
                    current.text.push_str("\n\n");
                }
            }
            Node::Text(t) => {
                if !in_ignored_element(&node) {
                    current.text.push_str(t);
                }
            }
            _ => {}
        }
    }
    if !current.text.trim().is_empty() {
        current.text = collapse_blank_lines(&current.text);
        sections.push(current);
    }
    sections
}

/// `html > body > article > h2`-style path for a node.
fn dom_path(node: &ego_tree::NodeRef<'_, Node>) -> String {
    let mut names: Vec<&str> = node
        .ancestors()
        .filter_map(|a| a.value().as_element().map(|el| el.name()))
        .collect();
    names.reverse();
    if let Some(el) = node.value().as_element() {
        names.push(el.name());
    }
    names.join(" > ")
}

fn collapse_blank_lines(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let mut blank_run = 0usize;
    for line in text.lines() {
        if line.trim().is_empty() {
            blank_run += 1;
            if blank_run > 1 {
                continue;
            }
        } else {
            blank_run = 0;
        }
        out.push_str(line.trim_end());
        out.push('\n');
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkingConfig {
        ChunkingConfig {
            html: crate::config::HtmlChunkingConfig {
                simple_parsing_threshold: 64,
                max_html_size_for_parsing: 1024 * 1024,
                preserve_semantic_structure: true,
            },
            ..ChunkingConfig::default()
        }
    }

    #[test]
    fn empty_html_no_pieces() {
        assert!(chunk_html("", &config()).is_empty());
    }

    #[test]
    fn small_files_take_simple_path() {
        let pieces = chunk_html("<p>tiny page</p>", &config());
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].tags["html_parse"], Value::String("simple".into()));
        assert!(pieces[0].content.contains("tiny page"));
    }

    #[test]
    fn large_files_take_dom_path_with_sections() {
        let html = format!(
            "<html><body><h1>Title</h1><p>{}</p><h2>Second</h2><p>{}</p></body></html>",
            "intro text ".repeat(10),
            "more text ".repeat(10)
        );
        let pieces = chunk_html(&html, &config());
        assert!(pieces.len() >= 2);
        assert_eq!(pieces[0].tags["html_parse"], Value::String("dom".into()));
        let titles: Vec<_> = pieces.iter().filter_map(|p| p.section_title.clone()).collect();
        assert!(titles.contains(&"Title".to_string()));
        assert!(titles.contains(&"Second".to_string()));
    }

    #[test]
    fn dom_path_is_recorded() {
        let html = format!(
            "<html><body><article><h2>Deep</h2><p>{}</p></article></body></html>",
            "content ".repeat(20)
        );
        let pieces = chunk_html(&html, &config());
        let with_path = pieces
            .iter()
            .find(|p| p.section_title.as_deref() == Some("Deep"))
            .unwrap();
        let path = with_path.tags["dom_path"].as_str().unwrap();
        assert!(path.contains("article"));
        assert!(path.ends_with("h2"));
    }

    #[test]
    fn script_and_style_are_ignored() {
        let html = format!(
            "<html><body><script>var secret = 42;</script><p>{}</p></body></html>",
            "visible text ".repeat(10)
        );
        let pieces = chunk_html(&html, &config());
        for p in &pieces {
            assert!(!p.content.contains("secret"));
        }
    }

    #[test]
    fn oversized_sections_are_split() {
        let mut cfg = config();
        cfg.chunk_size = 100;
        cfg.chunk_overlap = 0;
        cfg.min_chunk_size = 1;
        let html = format!(
            "<html><body><h1>Big</h1><p>{}</p></body></html>",
            "lots of words here ".repeat(50)
        );
        let pieces = chunk_html(&html, &cfg);
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| p.content.len() <= 120));
    }
}
