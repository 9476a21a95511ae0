//! Core data models used throughout docpack.
//!
//! These types represent the source files, chunks, clusters and the archive
//! aggregate that flow through the chunk → cluster → synthesize → serialize
//! pipeline. Field names double as the JSON record layout inside an archive.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DocpackError, Result};
use crate::intent::IntentSpec;

/// A file handed to the core by the ingestion layer.
///
/// `path` is already sanitized: relative, forward-slash, no traversal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// Where the ingested files came from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceInfo {
    /// `"directory"` or `"zip"`.
    pub source_type: String,
    pub identifier: String,
    /// SHA-256 over every (path, bytes) pair, in path order.
    pub digest: String,
}

/// A chunk as produced by the chunker, before its embedding is known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingChunk {
    pub chunk_id: u64,
    pub file_path: String,
    pub start_line: usize,
    pub end_line: usize,
    pub tokens: usize,
    pub text: String,
}

impl PendingChunk {
    pub fn into_chunk(self, embedding: Vec<f32>) -> Chunk {
        Chunk {
            chunk_id: self.chunk_id,
            file_path: self.file_path,
            start_line: self.start_line,
            end_line: self.end_line,
            tokens: self.tokens,
            text: self.text,
            embedding,
            cluster_id: None,
        }
    }
}

/// A contiguous, token-bounded slice of one source file.
///
/// Everything except `cluster_id` is fixed at construction. `cluster_id` is
/// written exactly once, by the cluster engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chunk {
    pub chunk_id: u64,
    pub file_path: String,
    /// 1-indexed, inclusive.
    pub start_line: usize,
    /// 1-indexed, inclusive.
    pub end_line: usize,
    pub tokens: usize,
    pub text: String,
    pub embedding: Vec<f32>,
    cluster_id: Option<usize>,
}

impl Chunk {
    pub fn cluster_id(&self) -> Option<usize> {
        self.cluster_id
    }

    pub fn assign_cluster(&mut self, cluster_id: usize) -> Result<()> {
        if let Some(existing) = self.cluster_id {
            return Err(DocpackError::Invariant(format!(
                "chunk {} already assigned to cluster {}",
                self.chunk_id, existing
            )));
        }
        self.cluster_id = Some(cluster_id);
        Ok(())
    }
}

/// A partition cell over chunks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Cluster {
    pub cluster_id: usize,
    /// Member chunk ids in original chunk order.
    pub chunk_ids: Vec<u64>,
    pub centroid: Vec<f32>,
    summary: Option<Map<String, Value>>,
}

impl Cluster {
    pub fn new(cluster_id: usize, chunk_ids: Vec<u64>, centroid: Vec<f32>) -> Self {
        Self {
            cluster_id,
            chunk_ids,
            centroid,
            summary: None,
        }
    }

    pub fn summary(&self) -> Option<&Map<String, Value>> {
        self.summary.as_ref()
    }

    /// Store the structured summary. Fails if one was already stored.
    pub fn set_summary(&mut self, summary: Map<String, Value>) -> Result<()> {
        if self.summary.is_some() {
            return Err(DocpackError::Invariant(format!(
                "cluster {} already has a summary",
                self.cluster_id
            )));
        }
        self.summary = Some(summary);
        Ok(())
    }
}

/// Run metrics. Always derived from the chunk and cluster collections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub file_count: usize,
    pub chunk_count: usize,
    pub cluster_count: usize,
    pub total_tokens: usize,
    pub embedding_dim: usize,
}

impl RunMetrics {
    pub fn from_collections(chunks: &[Chunk], clusters: &[Cluster]) -> Self {
        let files: BTreeSet<&str> = chunks.iter().map(|c| c.file_path.as_str()).collect();
        Self {
            file_count: files.len(),
            chunk_count: chunks.len(),
            cluster_count: clusters.len(),
            total_tokens: chunks.iter().map(|c| c.tokens).sum(),
            embedding_dim: chunks.first().map(|c| c.embedding.len()).unwrap_or(0),
        }
    }
}

/// Archive metadata: run metrics plus provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub created_at: DateTime<Utc>,
    pub tool_version: String,
    pub source_type: String,
    pub source_identifier: String,
    pub source_digest: String,
    pub intent_name: String,
    pub intent_description: String,
    #[serde(flatten)]
    pub metrics: RunMetrics,
    pub includes_raw_files: bool,
}

impl Manifest {
    pub fn build(
        source: &SourceInfo,
        intent: &IntentSpec,
        chunks: &[Chunk],
        clusters: &[Cluster],
        includes_raw_files: bool,
    ) -> Self {
        Self {
            created_at: Utc::now(),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            source_type: source.source_type.clone(),
            source_identifier: source.identifier.clone(),
            source_digest: source.digest.clone(),
            intent_name: intent.name.clone(),
            intent_description: intent.description.clone(),
            metrics: RunMetrics::from_collections(chunks, clusters),
            includes_raw_files,
        }
    }
}

/// Look up a chunk by id. Run ids are dense, so the chunk normally sits at
/// index `chunk_id`; any other layout falls back to a scan.
pub fn chunk_by_id(chunks: &[Chunk], chunk_id: u64) -> Option<&Chunk> {
    usize::try_from(chunk_id)
        .ok()
        .and_then(|index| chunks.get(index))
        .filter(|c| c.chunk_id == chunk_id)
        .or_else(|| chunks.iter().find(|c| c.chunk_id == chunk_id))
}

/// The persisted aggregate.
#[derive(Debug, Clone, PartialEq)]
pub struct Archive {
    pub manifest: Manifest,
    pub intent: IntentSpec,
    pub chunks: Vec<Chunk>,
    pub clusters: Vec<Cluster>,
    pub project_summary: Map<String, Value>,
    /// Empty unless `manifest.includes_raw_files`.
    pub raw_files: BTreeMap<String, Vec<u8>>,
}

impl Archive {
    pub fn chunk(&self, chunk_id: u64) -> Option<&Chunk> {
        chunk_by_id(&self.chunks, chunk_id)
    }

    pub fn cluster(&self, cluster_id: usize) -> Option<&Cluster> {
        self.clusters.iter().find(|c| c.cluster_id == cluster_id)
    }

    pub fn chunks_for_cluster(&self, cluster_id: usize) -> Vec<&Chunk> {
        match self.cluster(cluster_id) {
            Some(cluster) => cluster
                .chunk_ids
                .iter()
                .filter_map(|id| self.chunk(*id))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Check that the manifest metrics still describe the collections.
    pub fn check_metrics(&self) -> Result<()> {
        let actual = RunMetrics::from_collections(&self.chunks, &self.clusters);
        if actual != self.manifest.metrics {
            return Err(DocpackError::Invariant(format!(
                "manifest metrics {:?} do not match archive contents {:?}",
                self.manifest.metrics, actual
            )));
        }
        Ok(())
    }
}
