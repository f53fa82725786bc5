//! Markdown chunking strategy.
//!
//! Splits on header boundaries, with the split depth chosen by analyzing
//! the document's header population:
//!
//! - at least `header_analysis_threshold_h1` H1s → split on H1 only
//! - Excel-as-Markdown (`is_excel_sheet`) → split on H1 and H2 (one H2 per
//!   sheet)
//! - at least `header_analysis_threshold_h3` H3s → split on H1, H2 and H3
//! - otherwise → split on H1 and H2
//!
//! Sections that fit in `chunk_size` become chunks directly; oversized
//! sections go through a table-aware line splitter that never cuts inside a
//! Markdown table row. Overlap copies trailing lines of one chunk to the
//! head of the next, capped at `max_overlap_percentage × chunk_size`, and
//! is skipped when the boundary sits inside a table.
//!
//! Headers inside fenced code blocks are content, not structure.

use serde_json::Value;

use super::Piece;
use crate::config::ChunkingConfig;

/// One header-delimited section with its header chain.
#[derive(Debug, Clone, Default)]
struct Section {
    /// Header chain from H1 downward, e.g. `["Guide", "Install"]`.
    chain: Vec<String>,
    content: String,
}

pub fn chunk_markdown(content: &str, config: &ChunkingConfig, is_excel_sheet: bool) -> Vec<Piece> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    let levels = split_levels(content, &config.markdown, is_excel_sheet);
    let sections = split_sections(content, levels);

    let mut pieces = Vec::new();
    let mut pending: Option<Section> = None;

    for section in sections {
        // Sections below min_section_size ride along with the next one.
        if section.content.trim().len() < config.markdown.min_section_size {
            match pending.as_mut() {
                Some(p) => {
                    p.content.push('\n');
                    p.content.push_str(&section.content);
                }
                None => pending = Some(section),
            }
            continue;
        }

        let merged = match pending.take() {
            Some(mut p) => {
                p.content.push('\n');
                p.content.push_str(&section.content);
                // The substantive section's chain wins.
                Section {
                    chain: section.chain,
                    content: p.content,
                }
            }
            None => section,
        };
        emit_section(&merged, config, &mut pieces);
    }
    if let Some(p) = pending {
        emit_section(&p, config, &mut pieces);
    }

    pieces
}

/// Header levels that delimit sections, per the header-population analysis.
fn split_levels(
    content: &str,
    config: &crate::config::MarkdownChunkingConfig,
    is_excel_sheet: bool,
) -> u8 {
    let mut h1 = 0usize;
    let mut h3 = 0usize;
    for (level, _) in headers(content) {
        match level {
            1 => h1 += 1,
            3 => h3 += 1,
            _ => {}
        }
    }

    if h1 >= config.header_analysis_threshold_h1 {
        1
    } else if is_excel_sheet {
        2
    } else if h3 >= config.header_analysis_threshold_h3 {
        3
    } else {
        2
    }
}

/// Iterate `(level, title)` for headers outside fenced code blocks.
fn headers(content: &str) -> impl Iterator<Item = (u8, String)> + '_ {
    let mut in_fence = false;
    content.lines().filter_map(move |line| {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
            return None;
        }
        if in_fence {
            return None;
        }
        parse_header(trimmed)
    })
}

fn parse_header(line: &str) -> Option<(u8, String)> {
    let hashes = line.bytes().take_while(|b| *b == b'#').count();
    if hashes == 0 || hashes > 6 {
        return None;
    }
    let rest = &line[hashes..];
    if !rest.starts_with(' ') {
        return None;
    }
    Some((hashes as u8, rest.trim().to_string()))
}

/// Split into sections at headers of level `<= max_level`, tracking the
/// header chain for each.
fn split_sections(content: &str, max_level: u8) -> Vec<Section> {
    let mut sections: Vec<Section> = Vec::new();
    let mut chain: Vec<(u8, String)> = Vec::new();
    let mut current = Section::default();
    let mut in_fence = false;

    for line in content.lines() {
        let trimmed = line.trim_start();
        if trimmed.starts_with("```") || trimmed.starts_with("~~~") {
            in_fence = !in_fence;
        }

        let header = if in_fence { None } else { parse_header(trimmed) };
        if let Some((level, title)) = header {
            if level <= max_level {
                if !current.content.trim().is_empty() {
                    sections.push(current);
                }
                chain.retain(|(l, _)| *l < level);
                chain.push((level, title));
                current = Section {
                    chain: chain.iter().map(|(_, t)| t.clone()).collect(),
                    content: String::new(),
                };
            }
        }

        current.content.push_str(line);
        current.content.push('\n');
    }

    if !current.content.trim().is_empty() {
        sections.push(current);
    }
    sections
}

fn emit_section(section: &Section, config: &ChunkingConfig, pieces: &mut Vec<Piece>) {
    let content = section.content.trim_end();
    if content.is_empty() {
        return;
    }

    if content.len() <= config.chunk_size {
        pieces.push(make_piece(content.to_string(), section));
        return;
    }

    let parts = split_table_aware(content, config);
    let capped = parts.len().min(config.markdown.max_chunks_per_section);
    if capped < parts.len() {
        tracing::warn!(
            section = section.chain.last().map(String::as_str).unwrap_or(""),
            produced = parts.len(),
            cap = capped,
            "section chunk cap exceeded, truncating"
        );
    }
    for part in parts.into_iter().take(capped) {
        pieces.push(make_piece(part, section));
    }
}

fn make_piece(content: String, section: &Section) -> Piece {
    let mut piece = Piece::new(content);
    piece.section_title = section.chain.last().cloned();
    if !section.chain.is_empty() {
        piece.tags.insert(
            "header_chain".into(),
            Value::Array(
                section
                    .chain
                    .iter()
                    .map(|t| Value::String(t.clone()))
                    .collect(),
            ),
        );
    }
    piece
}

fn is_table_row(line: &str) -> bool {
    let t = line.trim_start();
    t.starts_with('|') && t.len() > 1
}

/// Line-based splitter for oversized sections. Chunk boundaries always fall
/// between lines, so a Markdown table row is never cut in half. Overlap is
/// applied by carrying trailing complete lines forward, except across a
/// table boundary.
fn split_table_aware(content: &str, config: &ChunkingConfig) -> Vec<String> {
    let overlap_cap = (config.max_overlap_percentage * config.chunk_size as f64).floor() as usize;
    let overlap = config.chunk_overlap.min(overlap_cap);

    let lines: Vec<&str> = content.lines().collect();
    let mut chunks: Vec<String> = Vec::new();
    let mut current = String::new();
    let mut in_fence = false;

    for line in &lines {
        let trimmed = line.trim_start();
        let is_fence = trimmed.starts_with("```") || trimmed.starts_with("~~~");

        let line_len = line.len() + 1;
        let over = !current.is_empty() && current.len() + line_len > config.chunk_size;

        // Keep fences closed within a chunk where possible; never flush
        // mid-fence unless the block alone exceeds the budget twice over.
        let fence_guard = in_fence && current.len() < config.chunk_size * 2;

        if over && !fence_guard {
            let carried = overlap_lines(&current, overlap);
            chunks.push(std::mem::take(&mut current));
            current = carried;
        }

        if is_fence {
            in_fence = !in_fence;
        }
        current.push_str(line);
        current.push('\n');
    }
    if !current.trim().is_empty() {
        chunks.push(current);
    }

    chunks
        .into_iter()
        .map(|c| c.trim_end().to_string())
        .collect()
}

/// Trailing complete lines of `chunk` up to `overlap` characters, to seed
/// the next chunk. Returns empty when the tail is table content: rows stay
/// atomic and are not duplicated across chunks.
fn overlap_lines(chunk: &str, overlap: usize) -> String {
    if overlap == 0 {
        return String::new();
    }
    let last_line = chunk.lines().next_back().unwrap_or("");
    if is_table_row(last_line) {
        return String::new();
    }

    let mut carried: Vec<&str> = Vec::new();
    let mut size = 0usize;
    for line in chunk.lines().rev() {
        let len = line.len() + 1;
        if size + len > overlap || is_table_row(line) {
            break;
        }
        carried.push(line);
        size += len;
    }
    if carried.is_empty() {
        return String::new();
    }
    carried.reverse();
    let mut out = carried.join("\n");
    out.push('\n');
    out
}
