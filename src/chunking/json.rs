//! JSON chunking strategy.
//!
//! Structural chunking for parseable documents up to
//! `max_json_size_for_parsing`: each top-level object member becomes a
//! candidate chunk (capped at `max_object_keys_to_process`), arrays are
//! grouped into runs of `max_array_items_per_chunk` items, and scalars
//! collapse to a single chunk. Every chunk records its JSON path; with
//! `enable_schema_inference` the inferred shape of the value is recorded
//! too. Unparseable or oversized input falls back to plain text.

use serde_json::Value;

use super::{text, Piece};
use crate::config::ChunkingConfig;

pub fn chunk_json(content: &str, config: &ChunkingConfig) -> Vec<Piece> {
    if content.trim().is_empty() {
        return Vec::new();
    }

    if content.len() > config.json.max_json_size_for_parsing {
        return text::chunk_plain(content, config);
    }

    let value: Value = match serde_json::from_str(content) {
        Ok(v) => v,
        Err(_) => return text::chunk_plain(content, config),
    };

    let mut pieces = Vec::new();
    match &value {
        Value::Object(map) => {
            for (key, member) in map.iter().take(config.json.max_object_keys_to_process) {
                let path = format!("$.{key}");
                emit_member(member, &path, config, &mut pieces);
            }
            if map.len() > config.json.max_object_keys_to_process {
                tracing::warn!(
                    keys = map.len(),
                    cap = config.json.max_object_keys_to_process,
                    "object key cap exceeded, remaining keys skipped"
                );
            }
        }
        Value::Array(items) => emit_array(items, "$", config, &mut pieces),
        scalar => {
            let rendered = render(scalar);
            let mut piece = Piece::new(rendered);
            piece.tags.insert("json_path".into(), Value::String("$".into()));
            tag_schema(&mut piece, scalar, config);
            pieces.push(piece);
        }
    }
    pieces
}

fn emit_member(value: &Value, path: &str, config: &ChunkingConfig, pieces: &mut Vec<Piece>) {
    match value {
        Value::Array(items) if items.len() > config.json.max_array_items_per_chunk => {
            emit_array(items, path, config, pieces)
        }
        _ => {
            let rendered = render(value);
            if rendered.len() <= config.chunk_size {
                let mut piece = Piece::new(rendered);
                piece.section_title = Some(path.to_string());
                piece
                    .tags
                    .insert("json_path".into(), Value::String(path.to_string()));
                tag_schema(&mut piece, value, config);
                pieces.push(piece);
            } else {
                for part in text::split_oversized(&rendered, config) {
                    let mut piece = Piece::new(part);
                    piece.section_title = Some(path.to_string());
                    piece
                        .tags
                        .insert("json_path".into(), Value::String(path.to_string()));
                    tag_schema(&mut piece, value, config);
                    pieces.push(piece);
                }
            }
        }
    }
}

fn emit_array(items: &[Value], base: &str, config: &ChunkingConfig, pieces: &mut Vec<Piece>) {
    for (group_index, group) in items.chunks(config.json.max_array_items_per_chunk).enumerate() {
        let start = group_index * config.json.max_array_items_per_chunk;
        let path = format!("{base}[{}..{}]", start, start + group.len());
        let rendered = render(&Value::Array(group.to_vec()));

        let mut piece = Piece::new(rendered);
        piece.section_title = Some(path.clone());
        piece.tags.insert("json_path".into(), Value::String(path));
        if config.json.enable_schema_inference {
            let shape = group.first().map(infer_shape).unwrap_or_default();
            piece
                .tags
                .insert("schema".into(), Value::String(format!("array of {shape}")));
        }
        pieces.push(piece);
    }
}

fn tag_schema(piece: &mut Piece, value: &Value, config: &ChunkingConfig) {
    if config.json.enable_schema_inference {
        piece
            .tags
            .insert("schema".into(), Value::String(infer_shape(value)));
    }
}

/// One-line shape description, two levels deep.
fn infer_shape(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(items) => match items.first() {
            Some(first) => format!("array<{}>", shallow_shape(first)),
            None => "array<empty>".to_string(),
        },
        Value::Object(map) => {
            let fields: Vec<String> = map
                .iter()
                .take(12)
                .map(|(k, v)| format!("{k}: {}", shallow_shape(v)))
                .collect();
            format!("object{{{}}}", fields.join(", "))
        }
    }
}

fn shallow_shape(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn render(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> ChunkingConfig {
        ChunkingConfig::default()
    }

    #[test]
    fn object_members_become_chunks() {
        let json = r#"{"name": "semindex", "version": 3, "tags": ["a", "b"]}"#;
        let pieces = chunk_json(json, &config());
        assert_eq!(pieces.len(), 3);
        let paths: Vec<&str> = pieces
            .iter()
            .map(|p| p.tags["json_path"].as_str().unwrap())
            .collect();
        assert!(paths.contains(&"$.name"));
        assert!(paths.contains(&"$.tags"));
    }

    #[test]
    fn large_arrays_are_grouped() {
        let items: Vec<String> = (0..60).map(|i| format!("{{\"id\": {i}}}")).collect();
        let json = format!("[{}]", items.join(","));
        let pieces = chunk_json(&json, &config());
        // 60 items at 25 per chunk → 3 groups.
        assert_eq!(pieces.len(), 3);
        assert_eq!(pieces[0].tags["json_path"], Value::String("$[0..25]".into()));
        assert_eq!(pieces[2].tags["json_path"], Value::String("$[50..60]".into()));
    }

    #[test]
    fn schema_inference_records_shape() {
        let json = r#"{"server": {"host": "localhost", "port": 8080}}"#;
        let pieces = chunk_json(json, &config());
        let schema = pieces[0].tags["schema"].as_str().unwrap();
        assert!(schema.contains("host: string"));
        assert!(schema.contains("port: number"));
    }

    #[test]
    fn schema_inference_can_be_disabled() {
        let mut cfg = config();
        cfg.json.enable_schema_inference = false;
        let pieces = chunk_json(r#"{"a": 1}"#, &cfg);
        assert!(pieces[0].tags.get("schema").is_none());
    }

    #[test]
    fn key_cap_limits_output() {
        let mut cfg = config();
        cfg.json.max_object_keys_to_process = 2;
        let json = r#"{"a": 1, "b": 2, "c": 3, "d": 4}"#;
        let pieces = chunk_json(json, &cfg);
        assert_eq!(pieces.len(), 2);
    }

    #[test]
    fn invalid_json_falls_back_to_text() {
        let pieces = chunk_json("{not json at all", &config());
        assert!(!pieces.is_empty());
        assert!(pieces[0].tags.get("json_path").is_none());
    }

    #[test]
    fn scalar_document_is_one_chunk() {
        let pieces = chunk_json("42", &config());
        assert_eq!(pieces.len(), 1);
        assert_eq!(pieces[0].tags["json_path"], Value::String("$".into()));
    }

    #[test]
    fn deterministic() {
        let json = r#"{"z": 1, "a": {"nested": true}}"#;
        let a = chunk_json(json, &config());
        let b = chunk_json(json, &config());
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert_eq!(x.content, y.content);
        }
    }
}
