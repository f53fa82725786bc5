//! Code chunking strategy.
//!
//! A language-agnostic element scanner, not a real parser: declaration
//! headers (fn/def/class/impl/interface and friends) open elements whose
//! extent is tracked by brace depth for brace languages and by indentation
//! for Python-style ones. Each element becomes one chunk up to
//! `max_element_size`; larger elements fall back to line-window splitting.
//! Import/dependency lines are collected into chunk metadata when
//! `enable_dependency_analysis` is on.
//!
//! Oversized files (over `max_file_size_for_ast`) and disabled parsing both
//! degrade to the plain-text strategy.

use serde_json::Value;

use super::{text, Piece};
use crate::config::ChunkingConfig;

/// Declaration keywords that open a code element, with the kind recorded in
/// metadata.
const DECL_KEYWORDS: &[(&str, &str)] = &[
    ("fn ", "function"),
    ("pub fn ", "function"),
    ("async fn ", "function"),
    ("pub async fn ", "function"),
    ("def ", "function"),
    ("async def ", "function"),
    ("function ", "function"),
    ("class ", "class"),
    ("pub struct ", "struct"),
    ("struct ", "struct"),
    ("pub enum ", "enum"),
    ("enum ", "enum"),
    ("pub trait ", "trait"),
    ("trait ", "trait"),
    ("impl ", "impl"),
    ("interface ", "interface"),
    ("func ", "function"),
];

const IMPORT_PREFIXES: &[&str] = &[
    "use ", "import ", "from ", "#include", "require(", "require ", "extern crate ",
];

pub fn chunk_code(content: &str, content_type: &str, config: &ChunkingConfig) -> Vec<Piece> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    if !config.code.enable_ast_parsing || content.len() > config.code.max_file_size_for_ast {
        return text::chunk_plain(content, config);
    }

    let language = language_tag(content_type);
    let elements = scan_elements(content, config.code.max_recursion_depth);
    let imports = if config.code.enable_dependency_analysis {
        collect_imports(content)
    } else {
        Vec::new()
    };

    let mut pieces = Vec::new();
    for element in elements {
        let body = element.content.trim_end();
        if body.trim().is_empty() {
            continue;
        }

        if body.len() <= config.code.max_element_size {
            pieces.push(element_piece(body.to_string(), &element, &language, &imports));
        } else {
            // Split long elements by line windows with overlap.
            for part in split_lines(body, config.code.max_element_size, config.effective_overlap())
            {
                pieces.push(element_piece(part, &element, &language, &imports));
            }
        }
    }
    pieces
}

#[derive(Debug, Clone)]
struct Element {
    kind: String,
    name: Option<String>,
    content: String,
}

fn element_piece(content: String, element: &Element, language: &str, imports: &[String]) -> Piece {
    let mut piece = Piece::new(content);
    piece.section_title = element.name.clone();
    piece
        .tags
        .insert("element_kind".into(), Value::String(element.kind.clone()));
    if !language.is_empty() {
        piece
            .tags
            .insert("language".into(), Value::String(language.to_string()));
    }
    if !imports.is_empty() {
        piece.tags.insert(
            "imports".into(),
            Value::Array(imports.iter().map(|i| Value::String(i.clone())).collect()),
        );
    }
    piece
}

fn language_tag(content_type: &str) -> String {
    let ext = content_type
        .rsplit('.')
        .next()
        .unwrap_or(content_type)
        .to_ascii_lowercase();
    match ext.as_str() {
        "rs" => "rust",
        "py" => "python",
        "js" | "jsx" => "javascript",
        "ts" | "tsx" => "typescript",
        "go" => "go",
        "java" => "java",
        "c" | "h" => "c",
        "cpp" | "hpp" | "cc" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "kt" => "kotlin",
        "scala" => "scala",
        "sh" | "bash" => "shell",
        "sql" => "sql",
        "lua" => "lua",
        "zig" => "zig",
        _ => "",
    }
    .to_string()
}

fn decl_of(line: &str) -> Option<(&'static str, String)> {
    let trimmed = line.trim_start();
    for (prefix, kind) in DECL_KEYWORDS {
        if let Some(rest) = trimmed.strip_prefix(prefix) {
            let name: String = rest
                .chars()
                .take_while(|c| c.is_alphanumeric() || *c == '_' || *c == ':')
                .collect();
            return Some((kind, name));
        }
    }
    None
}

/// Scan top-level elements. Brace depth bounds brace-language elements;
/// indentation bounds Python-style ones. Content between elements is
/// gathered into `module` pseudo-elements so nothing is dropped. `max_depth`
/// caps how deep brace nesting is followed before an element is force-closed.
fn scan_elements(content: &str, max_depth: usize) -> Vec<Element> {
    let mut elements: Vec<Element> = Vec::new();
    let mut current: Option<(Element, i64, usize)> = None; // (element, brace_depth, indent)
    let mut free = String::new();

    let flush_free = |free: &mut String, elements: &mut Vec<Element>| {
        if !free.trim().is_empty() {
            elements.push(Element {
                kind: "module".to_string(),
                name: None,
                content: std::mem::take(free),
            });
        } else {
            free.clear();
        }
    };

    for line in content.lines() {
        let indent = line.len() - line.trim_start().len();
        let opens = line.matches('{').count() as i64;
        let closes = line.matches('}').count() as i64;

        let Some((mut element, mut depth, start_indent)) = current.take() else {
            if let Some((kind, name)) = decl_of(line) {
                flush_free(&mut free, &mut elements);
                let element = Element {
                    kind: kind.to_string(),
                    name: (!name.is_empty()).then_some(name),
                    content: format!("{line}\n"),
                };
                let depth = opens - closes;
                if depth <= 0 && line.trim_end().ends_with('}') {
                    // One-liner.
                    elements.push(element);
                } else {
                    current = Some((element, depth, indent));
                }
            } else {
                free.push_str(line);
                free.push('\n');
            }
            continue;
        };

        // Indentation-delimited end (no braces opened yet).
        if depth == 0
            && !line.trim().is_empty()
            && indent <= start_indent
            && !element.content.trim_end().ends_with(['{', '(', ','])
        {
            elements.push(element);
            // Reprocess this line as a potential new element start.
            if let Some((kind, name)) = decl_of(line) {
                let new_element = Element {
                    kind: kind.to_string(),
                    name: (!name.is_empty()).then_some(name),
                    content: format!("{line}\n"),
                };
                current = Some((new_element, opens - closes, indent));
            } else {
                free.push_str(line);
                free.push('\n');
            }
            continue;
        }

        element.content.push_str(line);
        element.content.push('\n');
        depth += opens - closes;

        let too_deep = depth > max_depth as i64;
        if (depth <= 0 && (opens > 0 || closes > 0)) || too_deep {
            elements.push(element);
        } else {
            current = Some((element, depth, start_indent));
        }
    }

    if let Some((element, _, _)) = current {
        elements.push(element);
    }
    flush_free(&mut free, &mut elements);
    elements
}

fn collect_imports(content: &str) -> Vec<String> {
    content
        .lines()
        .map(str::trim)
        .filter(|line| IMPORT_PREFIXES.iter().any(|p| line.starts_with(p)))
        .map(|line| line.trim_end_matches(';').to_string())
        .take(64)
        .collect()
}

/// Line-window split for oversized elements.
fn split_lines(content: &str, max_size: usize, overlap: usize) -> Vec<String> {
    let mut parts: Vec<String> = Vec::new();
    let mut current = String::new();

    for line in content.lines() {
        let len = line.len() + 1;
        if !current.is_empty() && current.len() + len > max_size {
            // Carry trailing lines up to the overlap budget.
            let mut carried: Vec<String> = Vec::new();
            let mut size = 0usize;
            for l in current.lines().rev() {
                if size + l.len() + 1 > overlap {
                    break;
                }
                carried.push(l.to_string());
                size += l.len() + 1;
            }
            carried.reverse();
            parts.push(std::mem::take(&mut current));
            for l in carried {
                current.push_str(&l);
                current.push('\n');
            }
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        parts.push(current);
    }
    parts.into_iter().map(|p| p.trim_end().to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkingConfig {
        ChunkingConfig::default()
    }

    const RUST_SAMPLE: &str = r#"use std::collections::HashMap;
use serde::Serialize;

pub struct Config {
    name: String,
}

pub fn load(path: &str) -> Config {
    let map = HashMap::new();
    Config { name: path.to_string() }
}

fn helper() {
    println!("hi");
}
"#;

    #[test]
    fn elements_become_chunks() {
        let pieces = chunk_code(RUST_SAMPLE, "lib.rs", &config());
        let kinds: Vec<&str> = pieces
            .iter()
            .map(|p| p.tags["element_kind"].as_str().unwrap())
            .collect();
        assert!(kinds.contains(&"struct"));
        assert!(kinds.contains(&"function"));
    }

    #[test]
    fn element_names_are_captured() {
        let pieces = chunk_code(RUST_SAMPLE, "lib.rs", &config());
        let names: Vec<String> = pieces.iter().filter_map(|p| p.section_title.clone()).collect();
        assert!(names.iter().any(|n| n.starts_with("load")));
        assert!(names.iter().any(|n| n.starts_with("Config")));
    }

    #[test]
    fn imports_recorded_in_metadata() {
        let pieces = chunk_code(RUST_SAMPLE, "lib.rs", &config());
        let imports = pieces[0].tags["imports"].as_array().unwrap();
        assert!(imports
            .iter()
            .any(|i| i.as_str().unwrap().contains("HashMap")));
    }

    #[test]
    fn language_tag_from_extension() {
        let pieces = chunk_code("fn main() {}\n", "main.rs", &config());
        assert_eq!(pieces[0].tags["language"], Value::String("rust".into()));
    }

    #[test]
    fn python_elements_end_by_indentation() {
        let py = "import os\n\ndef first():\n    a = 1\n    return a\n\ndef second():\n    return 2\n";
        let pieces = chunk_code(py, "mod.py", &config());
        let functions: Vec<&Piece> = pieces
            .iter()
            .filter(|p| p.tags["element_kind"] == Value::String("function".into()))
            .collect();
        assert_eq!(functions.len(), 2);
        assert!(functions[0].content.contains("return a"));
        assert!(!functions[0].content.contains("second"));
    }

    #[test]
    fn oversized_element_is_split_with_bounded_parts() {
        let mut cfg = config();
        cfg.code.max_element_size = 200;
        cfg.chunk_overlap = 0;
        let body: String = (0..50).map(|i| format!("    let x{i} = {i};\n")).collect();
        let code = format!("fn big() {{\n{body}}}\n");
        let pieces = chunk_code(&code, "big.rs", &cfg);
        assert!(pieces.len() > 1);
        assert!(pieces.iter().all(|p| p.content.len() <= 220));
    }

    #[test]
    fn ast_disabled_falls_back_to_text() {
        let mut cfg = config();
        cfg.code.enable_ast_parsing = false;
        let pieces = chunk_code(RUST_SAMPLE, "lib.rs", &cfg);
        assert!(!pieces.is_empty());
        assert!(pieces[0].tags.get("element_kind").is_none());
    }

    #[test]
    fn dependency_analysis_can_be_disabled() {
        let mut cfg = config();
        cfg.code.enable_dependency_analysis = false;
        let pieces = chunk_code(RUST_SAMPLE, "lib.rs", &cfg);
        assert!(pieces[0].tags.get("imports").is_none());
    }
}
