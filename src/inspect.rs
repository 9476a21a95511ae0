//! Archive overview for `docpack inspect`.
//!
//! Shows what an archive holds: provenance, run metrics, a per-cluster table
//! and the project summary. `--json` emits the same data as one JSON object.

use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::path::Path;

use serde_json::{json, Value};
use walkdir::WalkDir;

use crate::archive::read_archive;
use crate::error::Result;
use crate::models::Archive;
use crate::prompts::preview;

const HEADLINE_CHARS: usize = 48;

/// Per-cluster line of the report.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterRow {
    pub cluster_id: usize,
    pub chunks: usize,
    pub files: usize,
    pub tokens: usize,
    /// First summary field, shortened. Empty when there is no summary.
    pub headline: String,
}

fn headline(value: &Value) -> String {
    let text = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    let line = text.lines().next().unwrap_or("");
    let short = preview(line, HEADLINE_CHARS);
    if short.len() < text.len() {
        format!("{}…", short)
    } else {
        short.to_string()
    }
}

pub fn cluster_rows(archive: &Archive) -> Vec<ClusterRow> {
    archive
        .clusters
        .iter()
        .map(|cluster| {
            let members = archive.chunks_for_cluster(cluster.cluster_id);
            let files: BTreeSet<&str> = members.iter().map(|c| c.file_path.as_str()).collect();
            ClusterRow {
                cluster_id: cluster.cluster_id,
                chunks: members.len(),
                files: files.len(),
                tokens: members.iter().map(|c| c.tokens).sum(),
                headline: cluster
                    .summary()
                    .and_then(|s| s.values().next())
                    .map(headline)
                    .unwrap_or_default(),
            }
        })
        .collect()
}

/// Bytes on disk: the zip file, or every file under the directory.
pub fn archive_size(path: &Path) -> u64 {
    if path.is_dir() {
        WalkDir::new(path)
            .into_iter()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_type().is_file())
            .filter_map(|e| e.metadata().ok())
            .map(|m| m.len())
            .sum()
    } else {
        std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
    }
}

/// Format a byte count as a human-readable string.
pub fn format_bytes(bytes: u64) -> String {
    if bytes < 1024 {
        format!("{} B", bytes)
    } else if bytes < 1024 * 1024 {
        format!("{:.1} KB", bytes as f64 / 1024.0)
    } else if bytes < 1024 * 1024 * 1024 {
        format!("{:.1} MB", bytes as f64 / (1024.0 * 1024.0))
    } else {
        format!("{:.2} GB", bytes as f64 / (1024.0 * 1024.0 * 1024.0))
    }
}

pub fn render_report(archive: &Archive, size: u64) -> String {
    let m = &archive.manifest;
    let raw_bytes: usize = archive.raw_files.values().map(|b| b.len()).sum();
    let mut out = String::new();

    let _ = writeln!(out, "docpack: {}", m.intent_name);
    let _ = writeln!(out, "{}", "=".repeat(9 + m.intent_name.chars().count()));
    if !m.intent_description.is_empty() {
        let _ = writeln!(out, "{}", m.intent_description);
    }
    let _ = writeln!(out);
    let _ = writeln!(out, "  Source:      {} ({})", m.source_identifier, m.source_type);
    let _ = writeln!(out, "  Digest:      {}", m.source_digest);
    let _ = writeln!(
        out,
        "  Created:     {} (docpack {})",
        m.created_at.format("%Y-%m-%d %H:%M:%S UTC"),
        m.tool_version
    );
    let _ = writeln!(out, "  Size:        {}", format_bytes(size));
    let _ = writeln!(out);
    let _ = writeln!(out, "  Files:       {}", m.metrics.file_count);
    let _ = writeln!(out, "  Chunks:      {}", m.metrics.chunk_count);
    let _ = writeln!(out, "  Clusters:    {}", m.metrics.cluster_count);
    let _ = writeln!(out, "  Tokens:      {}", m.metrics.total_tokens);
    let _ = writeln!(out, "  Dimensions:  {}", m.metrics.embedding_dim);
    if m.includes_raw_files {
        let _ = writeln!(
            out,
            "  Raw files:   {} ({})",
            archive.raw_files.len(),
            format_bytes(raw_bytes as u64)
        );
    } else {
        let _ = writeln!(out, "  Raw files:   not included");
    }

    let rows = cluster_rows(archive);
    if !rows.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  By cluster:");
        let _ = writeln!(
            out,
            "  {:>7} {:>7} {:>6} {:>8}   {}",
            "CLUSTER", "CHUNKS", "FILES", "TOKENS", "SUMMARY"
        );
        let _ = writeln!(out, "  {}", "-".repeat(76));
        for row in &rows {
            let _ = writeln!(
                out,
                "  {:>7} {:>7} {:>6} {:>8}   {}",
                row.cluster_id,
                row.chunks,
                row.files,
                row.tokens,
                if row.headline.is_empty() { "-" } else { &row.headline }
            );
        }
    }

    if !archive.project_summary.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "  Project summary:");
        for (field, value) in &archive.project_summary {
            let rendered = serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string());
            let rendered = match value {
                Value::String(s) => s.clone(),
                _ => rendered,
            };
            let _ = writeln!(out, "    {}: {}", field, rendered.replace('\n', "\n      "));
        }
    }

    out
}

pub fn json_report(archive: &Archive, size: u64) -> Value {
    let clusters: Vec<Value> = cluster_rows(archive)
        .into_iter()
        .zip(&archive.clusters)
        .map(|(row, cluster)| {
            json!({
                "cluster_id": row.cluster_id,
                "chunks": row.chunks,
                "files": row.files,
                "tokens": row.tokens,
                "summary": cluster.summary(),
            })
        })
        .collect();

    json!({
        "manifest": archive.manifest,
        "size_bytes": size,
        "raw_file_count": archive.raw_files.len(),
        "clusters": clusters,
        "project_summary": archive.project_summary,
    })
}

/// Read the archive at `path` and print its report to stdout.
pub fn run_inspect(path: &Path, as_json: bool) -> Result<()> {
    let archive = read_archive(path)?;
    let size = archive_size(path);
    if as_json {
        let report = json_report(&archive, size);
        println!(
            "{}",
            serde_json::to_string_pretty(&report).unwrap_or_else(|_| report.to_string())
        );
    } else {
        print!("{}", render_report(&archive, size));
    }
    Ok(())
}
