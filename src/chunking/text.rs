//! Default (plain text) chunking strategy.
//!
//! Character-based sliding window: each chunk holds up to `chunk_size`
//! characters, consecutive chunks share the effective overlap, and split
//! points prefer whitespace so words stay intact. A single token longer
//! than `chunk_size` is cut rather than looping. A trailing fragment below
//! `min_chunk_size` merges into its predecessor.

use serde_json::Value;

use super::{overlap_tail, split_point, Piece};
use crate::config::ChunkingConfig;

pub fn chunk_plain(content: &str, config: &ChunkingConfig) -> Vec<Piece> {
    let windows = sliding_windows(
        content,
        config.chunk_size,
        config.effective_overlap(),
        config.min_chunk_size,
    );

    windows
        .into_iter()
        .map(|(start, piece)| {
            let mut p = Piece::new(piece);
            p.tags.insert("offset".into(), Value::from(start));
            let entities = extract_entities(&p.content);
            if !entities.is_empty() {
                p.tags.insert(
                    "entities".into(),
                    Value::Array(entities.into_iter().map(Value::String).collect()),
                );
            }
            p
        })
        .collect()
}

/// Core sliding-window split, returning `(start_offset, slice)` pairs.
///
/// Invariants: with `overlap == 0`, consecutive windows share no
/// characters; with `overlap > 0`, every consecutive pair shares exactly
/// `overlap` characters (except when the final window is shorter). Progress
/// is at least one character per step, so pathological inputs terminate.
pub(crate) fn sliding_windows(
    text: &str,
    chunk_size: usize,
    overlap: usize,
    min_chunk_size: usize,
) -> Vec<(usize, String)> {
    if text.is_empty() {
        return Vec::new();
    }

    let chunk_size = chunk_size.max(1);
    let mut windows: Vec<(usize, String)> = Vec::new();
    let mut pos = 0usize;

    loop {
        let remaining = &text[pos..];
        if remaining.len() <= chunk_size {
            windows.push((pos, remaining.to_string()));
            break;
        }

        let cut = split_point(remaining, chunk_size);
        windows.push((pos, remaining[..cut].to_string()));

        let back = overlap.min(cut.saturating_sub(1));
        let next = pos + cut - overlap_tail(&remaining[..cut], back).len();
        debug_assert!(next > pos);
        pos = next;
    }

    // Merge a runt tail into its predecessor.
    if windows.len() > 1 {
        let last_len = windows.last().map(|(_, s)| s.len()).unwrap_or(0);
        if last_len < min_chunk_size {
            windows.pop();
            let start = windows.last().map(|(s, _)| *s).unwrap_or(0);
            if let Some(last) = windows.last_mut() {
                last.1 = text[start..].to_string();
            }
        }
    }

    windows
}

/// Cheap entity annotation: capitalized tokens that appear mid-sentence,
/// deduplicated, capped at eight.
pub(crate) fn extract_entities(text: &str) -> Vec<String> {
    let mut seen = std::collections::BTreeSet::new();
    let mut entities = Vec::new();
    let mut prev_end: Option<char> = None;

    for token in text.split_whitespace() {
        let word: String = token
            .trim_matches(|c: char| !c.is_alphanumeric())
            .to_string();
        let sentence_start = matches!(prev_end, None | Some('.') | Some('!') | Some('?'));
        prev_end = token.chars().last();

        if sentence_start || word.len() < 3 {
            continue;
        }
        let mut chars = word.chars();
        let is_capitalized = chars
            .next()
            .map(|c| c.is_uppercase())
            .unwrap_or(false);
        if is_capitalized && seen.insert(word.clone()) {
            entities.push(word);
            if entities.len() >= 8 {
                break;
            }
        }
    }
    entities
}

/// Shared helper for strategies that need to re-split an oversized section
/// without any overlap bookkeeping.
pub(crate) fn split_oversized(content: &str, config: &ChunkingConfig) -> Vec<String> {
    sliding_windows(
        content,
        config.chunk_size,
        config.effective_overlap(),
        config.min_chunk_size,
    )
    .into_iter()
    .map(|(_, s)| s)
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(size: usize, overlap: usize, min: usize) -> ChunkingConfig {
        ChunkingConfig {
            chunk_size: size,
            chunk_overlap: overlap,
            min_chunk_size: min,
            max_overlap_percentage: 1.0,
            ..ChunkingConfig::default()
        }
    }

    #[test]
    fn small_text_single_chunk() {
        let pieces = chunk_plain("Hello, world!", &config(700, 80, 1));
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].content, "Hello, world!");
    }

    #[test]
    fn empty_text_no_chunks() {
        assert!(chunk_plain("", &config(700, 80, 1)).is_empty());
    }

    #[test]
    fn zero_overlap_shares_no_characters() {
        let text = "alpha beta gamma delta epsilon zeta eta theta iota kappa";
        let windows = sliding_windows(text, 20, 0, 1);
        assert!(windows.len() > 1);
        for pair in windows.windows(2) {
            let (s0, c0) = (&pair[0].0, &pair[0].1);
            let (s1, _) = (&pair[1].0, &pair[1].1);
            assert_eq!(s0 + c0.len(), *s1, "windows must be contiguous");
        }
    }

    #[test]
    fn positive_overlap_shares_exactly_overlap() {
        let text = "one two three four five six seven eight nine ten eleven twelve";
        let overlap = 5;
        let windows = sliding_windows(text, 20, overlap, 1);
        assert!(windows.len() > 1);
        for pair in windows.windows(2) {
            let (s0, c0) = (pair[0].0, &pair[0].1);
            let s1 = pair[1].0;
            let shared = (s0 + c0.len()).saturating_sub(s1);
            // The final pair may share less if the tail was merged.
            assert!(shared <= overlap);
            if s1 + 20 < text.len() {
                assert_eq!(shared, overlap);
            }
        }
    }

    #[test]
    fn long_word_is_truncated_not_looped() {
        let text = "a".repeat(100);
        let windows = sliding_windows(&text, 10, 3, 1);
        assert!(windows.len() < 100);
        assert!(windows.iter().all(|(_, c)| c.len() <= 10));
        // Full coverage: last window ends at text end.
        let (s, c) = windows.last().unwrap();
        assert_eq!(s + c.len(), text.len());
    }

    #[test]
    fn runt_tail_merges_with_predecessor() {
        let text = "aaaa bbbb cccc dd";
        let windows = sliding_windows(text, 10, 0, 5);
        let last = &windows.last().unwrap().1;
        assert!(last.len() >= 5 || windows.len() == 1);
    }

    #[test]
    fn indices_cover_content() {
        let text = "word ".repeat(100);
        let windows = sliding_windows(&text, 30, 5, 1);
        assert_eq!(windows[0].0, 0);
        let (s, c) = windows.last().unwrap();
        assert_eq!(s + c.len(), text.len());
    }

    #[test]
    fn entities_are_extracted_mid_sentence() {
        let entities =
            extract_entities("The server runs Qdrant and talks to Confluence. Kafka is next.");
        assert!(entities.contains(&"Qdrant".to_string()));
        assert!(entities.contains(&"Confluence".to_string()));
        // Sentence-initial words are skipped.
        assert!(!entities.contains(&"The".to_string()));
    }

    #[test]
    fn deterministic() {
        let text = "Alpha beta gamma delta epsilon zeta";
        let a = chunk_plain(text, &config(12, 4, 1));
        let b = chunk_plain(text, &config(12, 4, 1));
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.content, y.content);
        }
    }
}
