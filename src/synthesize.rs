//! Structured summarization of clusters and the project-level merge.
//!
//! Cluster summaries are requested concurrently (bounded by
//! `generation.concurrency`) and attached to their clusters only after every
//! call has returned. The project merge runs after that, from the stored
//! summaries, the manifest metrics and one representative chunk per cluster.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;

use crate::error::{DocpackError, Result};
use crate::generation::StructuredGenerator;
use crate::intent::IntentSpec;
use crate::models::{chunk_by_id, Archive, Chunk, Cluster, Manifest};
use crate::progress::{ProgressEvent, ProgressReporter, Stage};
use crate::prompts::{build_cluster_prompt, build_project_prompt, ClusterDigest, SYSTEM_PROMPT};
use crate::schema::TypeDescriptor;

fn cluster_unit(cluster_id: usize) -> String {
    format!("cluster {}", cluster_id)
}

const PROJECT_UNIT: &str = "project";

fn find_chunk<'a>(chunks: &'a [Chunk], chunk_id: u64, cluster_id: usize) -> Result<&'a Chunk> {
    chunk_by_id(chunks, chunk_id).ok_or_else(|| {
        DocpackError::Invariant(format!(
            "cluster {} references missing chunk {}",
            cluster_id, chunk_id
        ))
    })
}

/// The first `limit` members of `cluster`, in stored order.
pub fn cluster_members<'a>(
    cluster: &Cluster,
    chunks: &'a [Chunk],
    limit: usize,
) -> Result<Vec<&'a Chunk>> {
    cluster
        .chunk_ids
        .iter()
        .take(limit)
        .map(|id| find_chunk(chunks, *id, cluster.cluster_id))
        .collect()
}

/// Summarize one cluster. `None` when the intent declares no cluster schema.
///
/// The returned object is validated and normalized but not stored; callers
/// attach it with [`Cluster::set_summary`].
pub async fn synthesize_cluster(
    generator: &dyn StructuredGenerator,
    cluster: &Cluster,
    chunks: &[Chunk],
    intent: &IntentSpec,
) -> Result<Option<Map<String, Value>>> {
    let Some(descriptor) = intent.compile()?.cluster else {
        return Ok(None);
    };
    let schema = descriptor.to_json_schema();
    let members = cluster_members(cluster, chunks, intent.max_chunks_per_cluster)?;
    let prompt = build_cluster_prompt(
        cluster.cluster_id,
        &members,
        intent.allow_cross_file_inference,
        &schema,
    );

    let unit = cluster_unit(cluster.cluster_id);
    let raw = generator
        .generate(SYSTEM_PROMPT, &prompt, &schema)
        .await
        .map_err(|e| DocpackError::Generation {
            unit: unit.clone(),
            message: format!("{:#}", e),
        })?;
    descriptor.validate_generated(&unit, &raw).map(Some)
}

/// Summarize every cluster concurrently and store the results.
///
/// Nothing is stored unless every cluster succeeds.
pub async fn summarize_clusters(
    generator: Arc<dyn StructuredGenerator>,
    clusters: &mut [Cluster],
    chunks: &[Chunk],
    intent: &IntentSpec,
    concurrency: usize,
    progress: &dyn ProgressReporter,
) -> Result<()> {
    let Some(descriptor) = intent.compile()?.cluster else {
        return Ok(());
    };
    if clusters.is_empty() {
        return Ok(());
    }

    let schema = Arc::new(descriptor.to_json_schema());
    let semaphore = Arc::new(Semaphore::new(concurrency.max(1)));
    let mut tasks = JoinSet::new();

    for (index, cluster) in clusters.iter().enumerate() {
        let members = cluster_members(cluster, chunks, intent.max_chunks_per_cluster)?;
        let prompt = build_cluster_prompt(
            cluster.cluster_id,
            &members,
            intent.allow_cross_file_inference,
            &schema,
        );
        let generator = Arc::clone(&generator);
        let schema = Arc::clone(&schema);
        let semaphore = Arc::clone(&semaphore);
        tasks.spawn(async move {
            let result = match semaphore.acquire_owned().await {
                Ok(_permit) => generator.generate(SYSTEM_PROMPT, &prompt, &schema).await,
                Err(e) => Err(anyhow::anyhow!("generation scheduler closed: {}", e)),
            };
            (index, result)
        });
    }

    let total = clusters.len() as u64;
    let mut summaries: BTreeMap<usize, Map<String, Value>> = BTreeMap::new();

    while let Some(joined) = tasks.join_next().await {
        let (index, result) = joined.map_err(|e| DocpackError::Generation {
            unit: "cluster".to_string(),
            message: format!("generation task failed: {}", e),
        })?;
        let unit = cluster_unit(clusters[index].cluster_id);
        let raw = result.map_err(|e| DocpackError::Generation {
            unit: unit.clone(),
            message: format!("{:#}", e),
        })?;
        let summary = descriptor.validate_generated(&unit, &raw)?;
        summaries.insert(index, summary);
        progress.report(ProgressEvent::Advanced {
            stage: Stage::Summarizing,
            n: summaries.len() as u64,
            total,
        });
    }

    for (index, summary) in summaries {
        clusters[index].set_summary(summary)?;
    }
    Ok(())
}

/// Everything needed for the project-level generation call.
pub struct ProjectRequest {
    pub prompt: String,
    pub schema: Value,
    pub descriptor: TypeDescriptor,
}

/// Build the project prompt and schema. `None` when no project summary is
/// wanted.
pub fn project_request(
    clusters: &[Cluster],
    chunks: &[Chunk],
    intent: &IntentSpec,
    manifest: &Manifest,
) -> Result<Option<ProjectRequest>> {
    if !intent.allow_global_summary {
        return Ok(None);
    }
    let Some(descriptor) = intent.compile()?.project else {
        return Ok(None);
    };
    let schema = descriptor.to_json_schema();

    let mut digests = Vec::with_capacity(clusters.len());
    for cluster in clusters {
        let representative = match cluster.chunk_ids.first() {
            Some(id) => Some(find_chunk(chunks, *id, cluster.cluster_id)?),
            None => None,
        };
        digests.push(ClusterDigest {
            cluster_id: cluster.cluster_id,
            size: cluster.chunk_ids.len(),
            summary: cluster.summary(),
            representative,
        });
    }

    let prompt = build_project_prompt(&digests, &manifest.metrics, &schema);
    Ok(Some(ProjectRequest {
        prompt,
        schema,
        descriptor,
    }))
}

/// Merge cluster summaries and run metrics into the project summary.
///
/// Returns an empty object when the intent declares no project schema or
/// disallows a global summary.
pub async fn synthesize_project(
    generator: &dyn StructuredGenerator,
    clusters: &[Cluster],
    chunks: &[Chunk],
    intent: &IntentSpec,
    manifest: &Manifest,
) -> Result<Map<String, Value>> {
    let Some(request) = project_request(clusters, chunks, intent, manifest)? else {
        return Ok(Map::new());
    };

    let raw = generator
        .generate(SYSTEM_PROMPT, &request.prompt, &request.schema)
        .await
        .map_err(|e| DocpackError::Generation {
            unit: PROJECT_UNIT.to_string(),
            message: format!("{:#}", e),
        })?;
    request.descriptor.validate_generated(PROJECT_UNIT, &raw)
}

/// Run cluster synthesis, then the project merge, and assemble the archive.
#[allow(clippy::too_many_arguments)]
pub async fn apply_intent(
    generator: Arc<dyn StructuredGenerator>,
    manifest: Manifest,
    intent: IntentSpec,
    chunks: Vec<Chunk>,
    mut clusters: Vec<Cluster>,
    raw_files: BTreeMap<String, Vec<u8>>,
    concurrency: usize,
    progress: &dyn ProgressReporter,
) -> Result<Archive> {
    if intent.cluster_schema.is_some() && !clusters.is_empty() {
        progress.report(ProgressEvent::Started {
            stage: Stage::Summarizing,
            detail: format!("{} clusters with {}", clusters.len(), generator.model_name()),
        });
    }
    summarize_clusters(
        Arc::clone(&generator),
        &mut clusters,
        &chunks,
        &intent,
        concurrency,
        progress,
    )
    .await?;

    if intent.wants_project_summary() {
        progress.report(ProgressEvent::Started {
            stage: Stage::Merging,
            detail: "project summary".to_string(),
        });
    }
    let project_summary =
        synthesize_project(generator.as_ref(), &clusters, &chunks, &intent, &manifest).await?;

    Ok(Archive {
        manifest,
        intent,
        chunks,
        clusters,
        project_summary,
        raw_files,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{PendingChunk, SourceInfo};
    use crate::progress::NoProgress;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::Mutex;

    /// Replies by schema title and records every user prompt.
    struct ScriptedGenerator {
        cluster_reply: String,
        project_reply: String,
        prompts: Mutex<Vec<String>>,
    }

    impl ScriptedGenerator {
        fn new(cluster_reply: &str, project_reply: &str) -> Self {
            Self {
                cluster_reply: cluster_reply.to_string(),
                project_reply: project_reply.to_string(),
                prompts: Mutex::new(Vec::new()),
            }
        }
    }

    #[async_trait]
    impl StructuredGenerator for ScriptedGenerator {
        fn model_name(&self) -> &str {
            "scripted"
        }

        async fn generate(&self, _system: &str, user: &str, schema: &Value) -> anyhow::Result<String> {
            self.prompts.lock().unwrap().push(user.to_string());
            match schema["title"].as_str() {
                Some("ClusterSummary") => Ok(self.cluster_reply.clone()),
                Some("ProjectSummary") => Ok(self.project_reply.clone()),
                other => anyhow::bail!("unexpected schema {:?}", other),
            }
        }
    }

    /// Fails for the cluster whose prompt mentions `poison`.
    struct FlakyGenerator;

    #[async_trait]
    impl StructuredGenerator for FlakyGenerator {
        fn model_name(&self) -> &str {
            "flaky"
        }

        async fn generate(&self, _system: &str, user: &str, _schema: &Value) -> anyhow::Result<String> {
            if user.contains("poison") {
                anyhow::bail!("model crashed");
            }
            Ok(r#"{"topic": "ok", "tags": []}"#.to_string())
        }
    }

    fn intent(extra: Value) -> IntentSpec {
        let mut base = json!({
            "name": "test",
            "description": "unit test intent",
            "cluster_schema": {"topic": "str", "tags": ["str"], "note?": "str"},
            "project_schema": {"overview": "str"},
        });
        if let (Some(base), Some(extra)) = (base.as_object_mut(), extra.as_object()) {
            for (k, v) in extra {
                base.insert(k.clone(), v.clone());
            }
        }
        serde_json::from_value(base).unwrap()
    }

    fn fixture() -> (Vec<Chunk>, Vec<Cluster>) {
        let texts = ["alpha one", "beta two", "alpha three", "poison four", "beta five"];
        let mut chunks: Vec<Chunk> = texts
            .iter()
            .enumerate()
            .map(|(i, text)| {
                PendingChunk {
                    chunk_id: i as u64,
                    file_path: format!("src/{}.rs", i % 2),
                    start_line: 1,
                    end_line: 2,
                    tokens: 2,
                    text: text.to_string(),
                }
                .into_chunk(vec![i as f32])
            })
            .collect();
        let clusters = vec![
            Cluster::new(0, vec![0, 2], vec![1.0]),
            Cluster::new(1, vec![1, 4], vec![2.5]),
            Cluster::new(2, vec![3], vec![3.0]),
        ];
        for cluster in &clusters {
            for id in &cluster.chunk_ids {
                chunks[*id as usize].assign_cluster(cluster.cluster_id).unwrap();
            }
        }
        (chunks, clusters)
    }

    fn manifest(intent: &IntentSpec, chunks: &[Chunk], clusters: &[Cluster]) -> Manifest {
        let source = SourceInfo {
            source_type: "directory".to_string(),
            identifier: "fixture".to_string(),
            digest: "0".repeat(64),
        };
        Manifest::build(&source, intent, chunks, clusters, false)
    }

    #[tokio::test]
    async fn test_cluster_members_truncated_to_limit() {
        let (chunks, clusters) = fixture();
        let intent = intent(json!({"max_chunks_per_cluster": 1}));
        let generator = ScriptedGenerator::new(r#"{"topic": "t", "tags": []}"#, "{}");
        let summary = synthesize_cluster(&generator, &clusters[0], &chunks, &intent)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(summary["note"], Value::Null);
        let prompts = generator.prompts.lock().unwrap();
        assert!(prompts[0].contains("alpha one"));
        assert!(!prompts[0].contains("alpha three"));
    }

    #[tokio::test]
    async fn test_no_cluster_schema_means_no_calls() {
        let (chunks, clusters) = fixture();
        let intent: IntentSpec = serde_json::from_value(json!({"name": "bare"})).unwrap();
        let generator = ScriptedGenerator::new("{}", "{}");
        let result = synthesize_cluster(&generator, &clusters[0], &chunks, &intent)
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(generator.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_invalid_cluster_output_names_cluster() {
        let (chunks, clusters) = fixture();
        let intent = intent(json!({}));
        let generator = ScriptedGenerator::new(r#"{"tags": ["x"]}"#, "{}");
        let err = synthesize_cluster(&generator, &clusters[1], &chunks, &intent)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "SchemaValidationError");
        assert!(err.to_string().contains("cluster 1"));
        assert!(err.to_string().contains("$.topic"));
    }

    #[tokio::test]
    async fn test_summarize_clusters_attaches_all() {
        let (chunks, mut clusters) = fixture();
        let intent = intent(json!({}));
        let generator = Arc::new(ScriptedGenerator::new(
            r#"{"topic": "t", "tags": ["a"], "extra": 1}"#,
            "{}",
        ));
        summarize_clusters(generator.clone(), &mut clusters, &chunks, &intent, 2, &NoProgress)
            .await
            .unwrap();
        for cluster in &clusters {
            let summary = cluster.summary().unwrap();
            assert_eq!(summary["topic"], "t");
            assert!(summary.get("extra").is_none());
        }
        assert_eq!(generator.prompts.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_failed_cluster_leaves_siblings_untouched() {
        let (chunks, mut clusters) = fixture();
        let intent = intent(json!({}));
        let err = summarize_clusters(Arc::new(FlakyGenerator), &mut clusters, &chunks, &intent, 3, &NoProgress)
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "GenerationError");
        assert!(err.to_string().contains("cluster 2"));
        assert!(clusters.iter().all(|c| c.summary().is_none()));
    }

    #[tokio::test]
    async fn test_project_summary_empty_when_not_wanted() {
        let (chunks, clusters) = fixture();
        let generator = ScriptedGenerator::new("{}", r#"{"overview": "x"}"#);

        let no_global = intent(json!({"allow_global_summary": false}));
        let m = manifest(&no_global, &chunks, &clusters);
        let summary = synthesize_project(&generator, &clusters, &chunks, &no_global, &m)
            .await
            .unwrap();
        assert!(summary.is_empty());

        let no_schema = intent(json!({"project_schema": null}));
        let summary = synthesize_project(&generator, &clusters, &chunks, &no_schema, &m)
            .await
            .unwrap();
        assert!(summary.is_empty());
        assert!(generator.prompts.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_project_prompt_is_deterministic_and_grounded() {
        let (chunks, mut clusters) = fixture();
        let intent = intent(json!({}));
        clusters[0]
            .set_summary(json!({"topic": "alpha", "tags": [], "note": null}).as_object().cloned().unwrap())
            .unwrap();
        let m = manifest(&intent, &chunks, &clusters);

        let first = project_request(&clusters, &chunks, &intent, &m).unwrap().unwrap();
        let second = project_request(&clusters, &chunks, &intent, &m).unwrap().unwrap();
        assert_eq!(first.prompt, second.prompt);
        assert_eq!(first.schema["title"], "ProjectSummary");
        let first = first.prompt;
        assert!(first.contains("Cluster 0 (2 chunks):\n  topic: \"alpha\""));
        assert!(first.contains("Cluster 2 (1 chunks):\n  (no summary)"));
        assert!(first.contains("Chunks: 5"));
        // representative is the first member only
        assert!(first.contains("beta two"));
        assert!(!first.contains("beta five"));

        let generator = ScriptedGenerator::new("{}", r#"{"overview": "a small project"}"#);
        let summary = synthesize_project(&generator, &clusters, &chunks, &intent, &m)
            .await
            .unwrap();
        assert_eq!(summary["overview"], "a small project");
    }

    #[tokio::test]
    async fn test_apply_intent_assembles_archive() {
        let (chunks, clusters) = fixture();
        let intent = intent(json!({}));
        let m = manifest(&intent, &chunks, &clusters);
        let generator = Arc::new(ScriptedGenerator::new(
            r#"{"topic": "t", "tags": []}"#,
            r#"{"overview": "done"}"#,
        ));
        let archive = apply_intent(
            generator,
            m,
            intent,
            chunks,
            clusters,
            BTreeMap::new(),
            2,
            &NoProgress,
        )
        .await
        .unwrap();
        assert_eq!(archive.project_summary["overview"], "done");
        assert!(archive.clusters.iter().all(|c| c.summary().is_some()));
        archive.check_metrics().unwrap();
    }

    #[test]
    fn test_dangling_member_is_invariant_error() {
        let (chunks, _) = fixture();
        let cluster = Cluster::new(9, vec![42], vec![]);
        let err = cluster_members(&cluster, &chunks, 10).unwrap_err();
        assert_eq!(err.kind(), "InvariantError");
    }
}
