//! Prompt text for structured summarization.
//!
//! Every builder here is a pure function of its inputs: the same chunks,
//! summaries, metrics and schema always produce byte-identical prompts.

use serde_json::{Map, Value};

use crate::models::{Chunk, RunMetrics};

/// Separator placed between chunk excerpts.
pub const CHUNK_DELIMITER: &str = "\n\n---\n\n";

/// Characters of a representative chunk shown in the project prompt.
pub const PREVIEW_CHARS: usize = 500;

pub const SYSTEM_PROMPT: &str = "\
You analyze groups of related text segments taken from a source tree and
describe them faithfully, without inventing details.

When asked for structured data:
- Follow the provided JSON schema exactly.
- Output only one valid JSON object.
- No commentary, narration or markdown.
";

/// Trailing instructions that pin the reply to `schema`.
pub fn json_instructions(schema: &Value) -> String {
    let rendered = serde_json::to_string_pretty(schema).unwrap_or_else(|_| schema.to_string());
    format!(
        "Respond with a single JSON object that conforms to this JSON Schema. \
         Do not add fields that are not declared.\n\n{}\n",
        rendered
    )
}

fn location(chunk: &Chunk) -> String {
    format!("{}:{}-{}", chunk.file_path, chunk.start_line, chunk.end_line)
}

/// Prompt for one cluster. `members` is already truncated and in cluster order.
pub fn build_cluster_prompt(
    cluster_id: usize,
    members: &[&Chunk],
    allow_cross_file_inference: bool,
    schema: &Value,
) -> String {
    let mut files: Vec<&str> = Vec::new();
    for chunk in members {
        if !files.contains(&chunk.file_path.as_str()) {
            files.push(&chunk.file_path);
        }
    }

    let scope = if allow_cross_file_inference {
        format!(
            "The excerpts come from these files: {}.\n\
             You may relate content across files and describe how they work together.",
            files.join(", ")
        )
    } else {
        "Describe each file's content on its own terms. Do not infer connections \
         between different files."
            .to_string()
    };

    let excerpts: Vec<String> = members
        .iter()
        .map(|chunk| format!("[{}]\n{}", location(chunk), chunk.text))
        .collect();

    format!(
        "You are analyzing cluster {} of semantically related text segments.\n\n\
         Identify the central themes and what the segments collectively represent. \
         Stay grounded in the provided content.\n{}\n\n\
         Cluster:\n--------------------\n{}\n--------------------\n\n{}",
        cluster_id,
        scope,
        excerpts.join(CHUNK_DELIMITER),
        json_instructions(schema)
    )
}

/// One cluster as seen by the project prompt.
pub struct ClusterDigest<'a> {
    pub cluster_id: usize,
    pub size: usize,
    pub summary: Option<&'a Map<String, Value>>,
    pub representative: Option<&'a Chunk>,
}

/// First `max_chars` characters of `text`, never splitting a character.
pub fn preview(text: &str, max_chars: usize) -> &str {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => &text[..byte_idx],
        None => text,
    }
}

pub fn render_metrics(metrics: &RunMetrics) -> String {
    format!(
        "Files: {}\nChunks: {}\nClusters: {}\nTotal tokens: {}\nEmbedding dimensions: {}",
        metrics.file_count,
        metrics.chunk_count,
        metrics.cluster_count,
        metrics.total_tokens,
        metrics.embedding_dim
    )
}

fn render_summary_block(digest: &ClusterDigest<'_>) -> String {
    let mut block = format!("Cluster {} ({} chunks):", digest.cluster_id, digest.size);
    match digest.summary {
        Some(summary) if !summary.is_empty() => {
            for (field, value) in summary {
                block.push_str(&format!("\n  {}: {}", field, value));
            }
        }
        _ => block.push_str("\n  (no summary)"),
    }
    block
}

/// Prompt for the project-level merge.
pub fn build_project_prompt(
    digests: &[ClusterDigest<'_>],
    metrics: &RunMetrics,
    schema: &Value,
) -> String {
    let summaries: Vec<String> = digests.iter().map(render_summary_block).collect();
    let representatives: Vec<String> = digests
        .iter()
        .filter_map(|digest| {
            digest.representative.map(|chunk| {
                format!(
                    "Cluster {} representative [{}]\n{}",
                    digest.cluster_id,
                    location(chunk),
                    preview(&chunk.text, PREVIEW_CHARS)
                )
            })
        })
        .collect();

    format!(
        "Produce a high-level overview of the whole corpus from the cluster \
         summaries, metrics and excerpts below. Describe its purpose and main \
         themes. Do not speculate beyond what is supported.\n\n\
         Metrics:\n{}\n\n\
         Cluster summaries:\n{}\n\n\
         Representative excerpts:\n--------------------\n{}\n--------------------\n\n{}",
        render_metrics(metrics),
        summaries.join("\n\n"),
        representatives.join(CHUNK_DELIMITER),
        json_instructions(schema)
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PendingChunk;
    use serde_json::json;

    fn chunk(id: u64, path: &str, text: &str) -> Chunk {
        PendingChunk {
            chunk_id: id,
            file_path: path.to_string(),
            start_line: 1,
            end_line: 3,
            tokens: text.chars().count() / 4,
            text: text.to_string(),
        }
        .into_chunk(vec![0.0])
    }

    #[test]
    fn test_preview_is_char_safe() {
        let text = "é".repeat(600);
        assert_eq!(preview(&text, 500).chars().count(), 500);
        assert_eq!(preview("short", 500), "short");
    }

    #[test]
    fn test_cluster_prompt_delimits_chunks() {
        let a = chunk(0, "src/a.rs", "fn a() {}");
        let b = chunk(1, "src/b.rs", "fn b() {}");
        let schema = json!({"title": "ClusterSummary"});
        let prompt = build_cluster_prompt(4, &[&a, &b], false, &schema);
        assert!(prompt.contains("cluster 4"));
        assert!(prompt.contains("[src/a.rs:1-3]\nfn a() {}\n\n---\n\n[src/b.rs:1-3]\nfn b() {}"));
        assert!(prompt.contains("Do not infer connections"));
        assert!(prompt.contains("\"title\": \"ClusterSummary\""));

        let prompt = build_cluster_prompt(4, &[&a, &b], true, &schema);
        assert!(prompt.contains("these files: src/a.rs, src/b.rs"));
    }

    #[test]
    fn test_project_prompt_is_deterministic() {
        let a = chunk(0, "a.md", &"x".repeat(800));
        let mut summary = Map::new();
        summary.insert("topic".to_string(), json!("parsing"));
        summary.insert("tags".to_string(), json!(["lexer", "ast"]));
        let digests = vec![
            ClusterDigest {
                cluster_id: 0,
                size: 1,
                summary: Some(&summary),
                representative: Some(&a),
            },
            ClusterDigest {
                cluster_id: 1,
                size: 0,
                summary: None,
                representative: None,
            },
        ];
        let metrics = RunMetrics {
            file_count: 1,
            chunk_count: 1,
            cluster_count: 2,
            total_tokens: 200,
            embedding_dim: 1,
        };
        let schema = json!({"title": "ProjectSummary"});
        let first = build_project_prompt(&digests, &metrics, &schema);
        let second = build_project_prompt(&digests, &metrics, &schema);
        assert_eq!(first, second);
        assert!(first.contains("Cluster 0 (1 chunks):\n  topic: \"parsing\"\n  tags: [\"lexer\",\"ast\"]"));
        assert!(first.contains("Cluster 1 (0 chunks):\n  (no summary)"));
        assert!(first.contains("Total tokens: 200"));
        assert!(first.contains(&"x".repeat(500)));
        assert!(!first.contains(&"x".repeat(501)));
    }
}
