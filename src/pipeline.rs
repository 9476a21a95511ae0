//! End-to-end build: chunk → embed → cluster → synthesize.
//!
//! The caller supplies the ingested files, a resolved [`Config`], a validated
//! intent and the two capabilities. Each stage fully consumes the previous
//! one; writing the resulting [`Archive`] is left to the caller.

use std::collections::BTreeMap;
use std::sync::Arc;

use crate::chunk::{chunk_file, ChunkIdAllocator};
use crate::cluster::{cluster_chunks, ClusterMethod};
use crate::config::Config;
use crate::embedding::{embed_chunks, Embedder};
use crate::error::{DocpackError, Result};
use crate::generation::StructuredGenerator;
use crate::intent::IntentSpec;
use crate::models::{Archive, Manifest, PendingChunk, SourceFile, SourceInfo};
use crate::progress::{ProgressEvent, ProgressReporter, Stage};
use crate::synthesize::apply_intent;

const UNDECODABLE: &str = "not UTF-8 text or empty";

/// What a build would do, without calling any capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkPlan {
    pub files: usize,
    /// Files that would produce no chunks.
    pub skipped: Vec<String>,
    pub chunks: usize,
    pub total_tokens: usize,
    /// Cluster count after clamping `k` to the chunk count.
    pub clusters: usize,
}

fn chunk_files(
    config: &Config,
    files: &[SourceFile],
    progress: &dyn ProgressReporter,
) -> (Vec<PendingChunk>, Vec<String>) {
    let ids = ChunkIdAllocator::new();
    let mut pending = Vec::new();
    let mut skipped = Vec::new();

    for file in files {
        let chunks = chunk_file(
            &file.path,
            &file.bytes,
            config.chunking.max_tokens,
            config.chunking.overlap_tokens,
            &ids,
        );
        if chunks.is_empty() {
            progress.report(ProgressEvent::Skipped {
                path: file.path.clone(),
                reason: UNDECODABLE.to_string(),
            });
            skipped.push(file.path.clone());
            continue;
        }
        pending.extend(chunks);
    }

    (pending, skipped)
}

/// Chunk `files` and report counts. Used by `build --dry-run`.
pub fn plan_chunks(config: &Config, files: &[SourceFile], progress: &dyn ProgressReporter) -> ChunkPlan {
    let (pending, skipped) = chunk_files(config, files, progress);
    ChunkPlan {
        files: files.len() - skipped.len(),
        skipped,
        chunks: pending.len(),
        total_tokens: pending.iter().map(|c| c.tokens).sum(),
        clusters: config.clustering.k.min(pending.len()),
    }
}

/// Run every stage and return the assembled archive.
#[allow(clippy::too_many_arguments)]
pub async fn run_pipeline(
    config: &Config,
    intent: IntentSpec,
    source: &SourceInfo,
    files: Vec<SourceFile>,
    embedder: Arc<dyn Embedder>,
    generator: Arc<dyn StructuredGenerator>,
    progress: &dyn ProgressReporter,
) -> Result<Archive> {
    intent.validate()?;
    let method: ClusterMethod = config.clustering.method.parse()?;
    if intent.needs_generator() && !generator.is_enabled() {
        return Err(DocpackError::Configuration(format!(
            "intent '{}' declares summary schemas but the generation provider is disabled",
            intent.name
        )));
    }

    progress.report(ProgressEvent::Started {
        stage: Stage::Chunking,
        detail: format!("{} files", files.len()),
    });
    let (pending, _) = chunk_files(config, &files, progress);

    progress.report(ProgressEvent::Started {
        stage: Stage::Embedding,
        detail: format!("{} chunks with {}", pending.len(), embedder.model_name()),
    });
    let mut chunks = embed_chunks(
        embedder,
        pending,
        config.embedding.batch_size,
        config.embedding.concurrency,
        config.embedding.dims,
        progress,
    )
    .await?;

    progress.report(ProgressEvent::Started {
        stage: Stage::Clustering,
        detail: format!("k = {} ({})", config.clustering.k, method),
    });
    let clusters = cluster_chunks(&mut chunks, config.clustering.k, method, config.clustering.seed)?;

    let include_raw = config.output.include_raw_files;
    let raw_files: BTreeMap<String, Vec<u8>> = if include_raw {
        files.into_iter().map(|f| (f.path, f.bytes)).collect()
    } else {
        BTreeMap::new()
    };

    let manifest = Manifest::build(source, &intent, &chunks, &clusters, include_raw);
    apply_intent(
        generator,
        manifest,
        intent,
        chunks,
        clusters,
        raw_files,
        config.generation.concurrency,
        progress,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::generation::DisabledGenerator;
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use serde_json::{json, Value};

    /// Two-dimensional vectors from the text: length and line count.
    struct ShapeEmbedder;

    #[async_trait]
    impl Embedder for ShapeEmbedder {
        fn model_name(&self) -> &str {
            "shape"
        }

        async fn embed_batch(&self, texts: &[String]) -> anyhow::Result<Vec<Vec<f32>>> {
            Ok(texts
                .iter()
                .map(|t| vec![t.len() as f32, t.lines().count() as f32])
                .collect())
        }
    }

    struct TopicGenerator;

    #[async_trait]
    impl StructuredGenerator for TopicGenerator {
        fn model_name(&self) -> &str {
            "topic"
        }

        async fn generate(&self, _system: &str, _user: &str, schema: &Value) -> anyhow::Result<String> {
            match schema["title"].as_str() {
                Some("ClusterSummary") => Ok(r#"{"topic": "code"}"#.to_string()),
                _ => Ok(r#"{"overview": "a small tree"}"#.to_string()),
            }
        }
    }

    fn files() -> Vec<SourceFile> {
        vec![
            SourceFile {
                path: "README.md".to_string(),
                bytes: b"# Demo\n\nA tiny project.\n".to_vec(),
            },
            SourceFile {
                path: "logo.png".to_string(),
                bytes: vec![0x89, 0x50, 0xff, 0xfe],
            },
            SourceFile {
                path: "src/lib.rs".to_string(),
                bytes: (0..40)
                    .map(|i| format!("pub fn f{}() -> u32 {{ {} }}\n", i, i))
                    .collect::<String>()
                    .into_bytes(),
            },
        ]
    }

    fn source() -> SourceInfo {
        SourceInfo {
            source_type: "directory".to_string(),
            identifier: "demo".to_string(),
            digest: "0".repeat(64),
        }
    }

    fn config() -> Config {
        let mut config = Config::default();
        config.chunking.max_tokens = 60;
        config.chunking.overlap_tokens = 10;
        config.clustering.k = 3;
        config
    }

    fn intent(value: Value) -> IntentSpec {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_plan_chunks() {
        let plan = plan_chunks(&config(), &files(), &NoProgress);
        assert_eq!(plan.files, 2);
        assert_eq!(plan.skipped, vec!["logo.png".to_string()]);
        assert!(plan.chunks > 2);
        assert_eq!(plan.clusters, 3);
        assert!(plan.total_tokens > 0);
    }

    #[tokio::test]
    async fn test_run_pipeline_end_to_end() {
        let intent = intent(json!({
            "name": "demo",
            "cluster_schema": {"topic": "str"},
            "project_schema": {"overview": "str"},
        }));
        let archive = run_pipeline(
            &config(),
            intent,
            &source(),
            files(),
            Arc::new(ShapeEmbedder),
            Arc::new(TopicGenerator),
            &NoProgress,
        )
        .await
        .unwrap();

        archive.check_metrics().unwrap();
        assert_eq!(archive.manifest.metrics.file_count, 2);
        assert_eq!(archive.clusters.len(), 3);
        assert!(archive.chunks.iter().all(|c| c.cluster_id().is_some()));
        for (i, chunk) in archive.chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_id, i as u64);
        }
        assert!(archive
            .clusters
            .iter()
            .all(|c| c.summary().unwrap()["topic"] == "code"));
        assert_eq!(archive.project_summary["overview"], "a small tree");
        // raw files keep every ingested file, decodable or not
        assert_eq!(archive.raw_files.len(), 3);
    }

    #[tokio::test]
    async fn test_schema_free_intent_runs_without_generator() {
        let mut config = config();
        config.output.include_raw_files = false;
        let archive = run_pipeline(
            &config,
            intent(json!({"name": "index-only"})),
            &source(),
            files(),
            Arc::new(ShapeEmbedder),
            Arc::new(DisabledGenerator),
            &NoProgress,
        )
        .await
        .unwrap();
        assert!(archive.clusters.iter().all(|c| c.summary().is_none()));
        assert!(archive.project_summary.is_empty());
        assert!(archive.raw_files.is_empty());
        assert!(!archive.manifest.includes_raw_files);
    }

    #[tokio::test]
    async fn test_disabled_generator_rejected_up_front() {
        let err = run_pipeline(
            &config(),
            intent(json!({"name": "needs-llm", "cluster_schema": {"topic": "str"}})),
            &source(),
            files(),
            Arc::new(ShapeEmbedder),
            Arc::new(DisabledGenerator),
            &NoProgress,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[tokio::test]
    async fn test_unknown_method_rejected() {
        let mut config = config();
        config.clustering.method = "dbscan".to_string();
        let err = run_pipeline(
            &config,
            intent(json!({"name": "x"})),
            &source(),
            files(),
            Arc::new(ShapeEmbedder),
            Arc::new(DisabledGenerator),
            &NoProgress,
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[tokio::test]
    async fn test_empty_source_gives_empty_archive() {
        let archive = run_pipeline(
            &config(),
            intent(json!({"name": "empty", "project_schema": {"overview": "str"}})),
            &source(),
            Vec::new(),
            Arc::new(ShapeEmbedder),
            Arc::new(TopicGenerator),
            &NoProgress,
        )
        .await
        .unwrap();
        assert!(archive.chunks.is_empty());
        assert!(archive.clusters.is_empty());
        assert_eq!(archive.manifest.metrics.chunk_count, 0);
    }
}
