//! Semantic clustering of chunk embeddings.
//!
//! [`cluster_chunks`] partitions chunks into at most `k` clusters with one of
//! two strategies:
//!
//! - **kmeans**: k-means++ seeding from a seeded ChaCha8 RNG, Lloyd iterations, and
//!   [`KMEANS_RESTARTS`] restarts keeping the lowest inertia. Same input and
//!   seed give the same labels.
//! - **hierarchical**: Ward-linkage agglomerative clustering using the
//!   nearest-neighbour chain algorithm. Deterministic, no seed.
//!
//! Labels are renumbered by order of first appearance, so chunk 0 is always in
//! cluster 0 and cluster ids are dense.

use std::fmt;
use std::str::FromStr;

use ndarray::{Array1, Array2, ArrayView1, Axis};
use rand::prelude::*;
use rand_chacha::ChaCha8Rng;

use crate::error::{DocpackError, Result};
use crate::models::{Chunk, Cluster};

pub const DEFAULT_SEED: u64 = 42;
pub const KMEANS_RESTARTS: usize = 10;
const KMEANS_MAX_ITER: usize = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClusterMethod {
    KMeans,
    Hierarchical,
}

impl FromStr for ClusterMethod {
    type Err = DocpackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "kmeans" | "k-means" => Ok(ClusterMethod::KMeans),
            "hierarchical" | "ward" => Ok(ClusterMethod::Hierarchical),
            other => Err(DocpackError::Configuration(format!(
                "Unknown clustering method: '{}'. Must be kmeans or hierarchical.",
                other
            ))),
        }
    }
}

impl fmt::Display for ClusterMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClusterMethod::KMeans => write!(f, "kmeans"),
            ClusterMethod::Hierarchical => write!(f, "hierarchical"),
        }
    }
}

/// Partition `chunks` into `min(k, chunks.len())` non-empty clusters and
/// record each chunk's cluster id.
///
/// Nothing is mutated if any check fails: `k == 0`, a chunk that already
/// carries a cluster id, or embeddings of different lengths.
pub fn cluster_chunks(
    chunks: &mut [Chunk],
    k: usize,
    method: ClusterMethod,
    seed: u64,
) -> Result<Vec<Cluster>> {
    if k == 0 {
        return Err(DocpackError::Configuration(
            "clustering.k must be >= 1".to_string(),
        ));
    }
    if chunks.is_empty() {
        return Ok(Vec::new());
    }
    if let Some(chunk) = chunks.iter().find(|c| c.cluster_id().is_some()) {
        return Err(DocpackError::Invariant(format!(
            "chunk {} is already clustered",
            chunk.chunk_id
        )));
    }

    let data = embedding_matrix(chunks)?;
    let effective_k = k.min(chunks.len());

    let raw_labels = match method {
        ClusterMethod::KMeans => kmeans(&data, effective_k, seed),
        ClusterMethod::Hierarchical => ward(&data, effective_k),
    };
    let labels = canonicalize(&raw_labels);

    let mut clusters = Vec::with_capacity(effective_k);
    for label in 0..effective_k {
        let members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == label)
            .map(|(i, _)| i)
            .collect();
        let centroid: Vec<f32> = mean_of(&data, &members)
            .map(|c| c.iter().map(|v| *v as f32).collect())
            .unwrap_or_default();
        let chunk_ids: Vec<u64> = members.iter().map(|i| chunks[*i].chunk_id).collect();
        clusters.push(Cluster::new(label, chunk_ids, centroid));
    }

    for (chunk, label) in chunks.iter_mut().zip(labels) {
        chunk.assign_cluster(label)?;
    }

    Ok(clusters)
}

fn embedding_matrix(chunks: &[Chunk]) -> Result<Array2<f64>> {
    let dim = chunks[0].embedding.len();
    if let Some(bad) = chunks.iter().find(|c| c.embedding.len() != dim) {
        return Err(DocpackError::Embedding {
            unit: format!("chunk {}", bad.chunk_id),
            message: format!(
                "embedding has {} dimensions, expected {}",
                bad.embedding.len(),
                dim
            ),
        });
    }

    let flat: Vec<f64> = chunks
        .iter()
        .flat_map(|c| c.embedding.iter().map(|v| *v as f64))
        .collect();
    Array2::from_shape_vec((chunks.len(), dim), flat)
        .map_err(|e| DocpackError::Invariant(format!("embedding matrix: {}", e)))
}

fn mean_of(data: &Array2<f64>, rows: &[usize]) -> Option<Array1<f64>> {
    if rows.is_empty() {
        return None;
    }
    data.select(Axis(0), rows).mean_axis(Axis(0))
}

/// Renumber labels by order of first appearance.
fn canonicalize(labels: &[usize]) -> Vec<usize> {
    let mut mapping: Vec<(usize, usize)> = Vec::new();
    labels
        .iter()
        .map(|label| match mapping.iter().find(|(from, _)| from == label) {
            Some((_, to)) => *to,
            None => {
                let next = mapping.len();
                mapping.push((*label, next));
                next
            }
        })
        .collect()
}

fn sq_dist(a: ArrayView1<f64>, b: ArrayView1<f64>) -> f64 {
    a.iter().zip(b.iter()).map(|(x, y)| (x - y) * (x - y)).sum()
}

// ============ k-means ============

fn kmeans(data: &Array2<f64>, k: usize, seed: u64) -> Vec<usize> {
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let mut best: Option<(f64, Vec<usize>)> = None;

    for _ in 0..KMEANS_RESTARTS {
        let centroids = kmeans_plus_plus(data, k, &mut rng);
        let (labels, inertia) = lloyd(data, centroids);
        if best.as_ref().map_or(true, |(b, _)| inertia < *b) {
            best = Some((inertia, labels));
        }
    }

    best.map(|(_, labels)| labels).unwrap_or_default()
}

fn kmeans_plus_plus(data: &Array2<f64>, k: usize, rng: &mut ChaCha8Rng) -> Array2<f64> {
    let n = data.nrows();
    let mut centroids = Array2::zeros((k, data.ncols()));

    let first = rng.gen_range(0..n);
    centroids.row_mut(0).assign(&data.row(first));
    let mut closest: Vec<f64> = data
        .rows()
        .into_iter()
        .map(|row| sq_dist(row, centroids.row(0)))
        .collect();

    for c in 1..k {
        let total: f64 = closest.iter().sum();
        let pick = if total > 0.0 {
            // D² sampling
            let target = rng.gen::<f64>() * total;
            let mut acc = 0.0;
            let mut chosen = n - 1;
            for (i, d) in closest.iter().enumerate() {
                acc += d;
                if acc > target {
                    chosen = i;
                    break;
                }
            }
            chosen
        } else {
            rng.gen_range(0..n)
        };

        centroids.row_mut(c).assign(&data.row(pick));
        for (i, row) in data.rows().into_iter().enumerate() {
            let d = sq_dist(row, centroids.row(c));
            if d < closest[i] {
                closest[i] = d;
            }
        }
    }

    centroids
}

fn nearest(centroids: &Array2<f64>, point: ArrayView1<f64>) -> usize {
    let mut best = 0;
    let mut best_d = f64::INFINITY;
    for (c, centroid) in centroids.rows().into_iter().enumerate() {
        let d = sq_dist(point, centroid);
        if d < best_d {
            best = c;
            best_d = d;
        }
    }
    best
}

/// Lloyd iterations from the given seeds. Returns labels and inertia.
fn lloyd(data: &Array2<f64>, mut centroids: Array2<f64>) -> (Vec<usize>, f64) {
    let n = data.nrows();
    let k = centroids.nrows();
    let mut labels = vec![usize::MAX; n];

    for _ in 0..KMEANS_MAX_ITER {
        let mut changed = false;
        for (i, row) in data.rows().into_iter().enumerate() {
            let label = nearest(&centroids, row);
            if labels[i] != label {
                labels[i] = label;
                changed = true;
            }
        }
        if repair_empty_cells(data, &centroids, &mut labels, k) {
            changed = true;
        }
        centroids = recompute_centroids(data, &labels, &centroids);
        if !changed {
            break;
        }
    }

    let inertia = data
        .rows()
        .into_iter()
        .zip(&labels)
        .map(|(row, label)| sq_dist(row, centroids.row(*label)))
        .sum();
    (labels, inertia)
}

/// Give every empty cell the point farthest from its own centroid, taken
/// from a cell with more than one member. Returns whether anything moved.
fn repair_empty_cells(
    data: &Array2<f64>,
    centroids: &Array2<f64>,
    labels: &mut [usize],
    k: usize,
) -> bool {
    let mut counts = vec![0usize; k];
    for label in labels.iter() {
        counts[*label] += 1;
    }

    let mut moved = false;
    for empty in 0..k {
        if counts[empty] > 0 {
            continue;
        }
        let mut donor: Option<(usize, f64)> = None;
        for (i, row) in data.rows().into_iter().enumerate() {
            if counts[labels[i]] < 2 {
                continue;
            }
            let d = sq_dist(row, centroids.row(labels[i]));
            if donor.map_or(true, |(_, best)| d > best) {
                donor = Some((i, d));
            }
        }
        if let Some((i, _)) = donor {
            counts[labels[i]] -= 1;
            counts[empty] += 1;
            labels[i] = empty;
            moved = true;
        }
    }
    moved
}

fn recompute_centroids(data: &Array2<f64>, labels: &[usize], previous: &Array2<f64>) -> Array2<f64> {
    let mut centroids = previous.clone();
    for c in 0..previous.nrows() {
        let members: Vec<usize> = labels
            .iter()
            .enumerate()
            .filter(|(_, l)| **l == c)
            .map(|(i, _)| i)
            .collect();
        if let Some(mean) = mean_of(data, &members) {
            centroids.row_mut(c).assign(&mean);
        }
    }
    centroids
}

// ============ Ward ============

struct WardNode {
    centroid: Array1<f64>,
    members: Vec<usize>,
}

impl WardNode {
    fn size(&self) -> f64 {
        self.members.len() as f64
    }
}

/// Increase in within-cluster variance caused by merging `a` and `b`.
fn ward_cost(a: &WardNode, b: &WardNode) -> f64 {
    let (na, nb) = (a.size(), b.size());
    na * nb / (na + nb) * sq_dist(a.centroid.view(), b.centroid.view())
}

fn ward(data: &Array2<f64>, k: usize) -> Vec<usize> {
    let n = data.nrows();
    let mut nodes: Vec<Option<WardNode>> = data
        .rows()
        .into_iter()
        .enumerate()
        .map(|(i, row)| {
            Some(WardNode {
                centroid: row.to_owned(),
                members: vec![i],
            })
        })
        .collect();
    let mut active = n;
    let mut chain: Vec<usize> = Vec::new();

    while active > k {
        if chain.is_empty() {
            if let Some(first) = nodes.iter().position(|n| n.is_some()) {
                chain.push(first);
            }
        }
        let a = chain[chain.len() - 1];
        let prev = if chain.len() >= 2 {
            Some(chain[chain.len() - 2])
        } else {
            None
        };

        let Some(node_a) = nodes[a].as_ref() else {
            break;
        };
        // Ties go to the previous chain element so the chain always closes.
        let mut best = prev;
        let mut best_cost = match prev.and_then(|p| nodes[p].as_ref()) {
            Some(node_p) => ward_cost(node_a, node_p),
            None => f64::INFINITY,
        };
        for (j, node_j) in nodes.iter().enumerate() {
            if j == a {
                continue;
            }
            if let Some(node_j) = node_j {
                let cost = ward_cost(node_a, node_j);
                if cost < best_cost {
                    best = Some(j);
                    best_cost = cost;
                }
            }
        }

        match best {
            Some(b) if Some(b) == prev => {
                chain.truncate(chain.len() - 2);
                let (keep, drop) = (a.min(b), a.max(b));
                if let (Some(x), Some(y)) = (nodes[keep].take(), nodes[drop].take()) {
                    nodes[keep] = Some(merge_nodes(x, y));
                }
                active -= 1;
            }
            Some(b) => chain.push(b),
            None => break,
        }
    }

    let mut labels = vec![0usize; n];
    for (label, node) in nodes.iter().flatten().enumerate() {
        for member in &node.members {
            labels[*member] = label;
        }
    }
    labels
}

fn merge_nodes(a: WardNode, b: WardNode) -> WardNode {
    let (na, nb) = (a.size(), b.size());
    let centroid = (&a.centroid * na + &b.centroid * nb) / (na + nb);
    let mut members = a.members;
    members.extend(b.members);
    members.sort_unstable();
    WardNode { centroid, members }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::PendingChunk;

    fn chunk(id: u64, embedding: Vec<f32>) -> Chunk {
        PendingChunk {
            chunk_id: id,
            file_path: format!("f{}.rs", id % 3),
            start_line: 1,
            end_line: 1,
            tokens: 1,
            text: format!("chunk {}", id),
        }
        .into_chunk(embedding)
    }

    /// Two tight blobs around (0,0) and (10,10), interleaved.
    fn two_blobs() -> Vec<Chunk> {
        (0..10)
            .map(|i| {
                let jitter = (i as f32) * 0.01;
                let base = if i % 2 == 0 { 0.0 } else { 10.0 };
                chunk(i, vec![base + jitter, base - jitter])
            })
            .collect()
    }

    fn assert_partition(chunks: &[Chunk], clusters: &[Cluster]) {
        let mut seen: Vec<u64> = clusters.iter().flat_map(|c| c.chunk_ids.clone()).collect();
        seen.sort_unstable();
        let all: Vec<u64> = chunks.iter().map(|c| c.chunk_id).collect();
        assert_eq!(seen, all);
        for cluster in clusters {
            assert!(!cluster.chunk_ids.is_empty());
            for id in &cluster.chunk_ids {
                let chunk = chunks.iter().find(|c| c.chunk_id == *id).unwrap();
                assert_eq!(chunk.cluster_id(), Some(cluster.cluster_id));
            }
        }
    }

    #[test]
    fn test_method_parse() {
        assert_eq!("kmeans".parse::<ClusterMethod>().unwrap(), ClusterMethod::KMeans);
        assert_eq!(
            "Hierarchical".parse::<ClusterMethod>().unwrap(),
            ClusterMethod::Hierarchical
        );
        let err = "dbscan".parse::<ClusterMethod>().unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
    }

    #[test]
    fn test_kmeans_separates_blobs() {
        let mut chunks = two_blobs();
        let clusters = cluster_chunks(&mut chunks, 2, ClusterMethod::KMeans, DEFAULT_SEED).unwrap();
        assert_eq!(clusters.len(), 2);
        assert_partition(&chunks, &clusters);
        assert_eq!(clusters[0].chunk_ids, vec![0, 2, 4, 6, 8]);
        assert_eq!(clusters[1].chunk_ids, vec![1, 3, 5, 7, 9]);
        assert!(clusters[0].centroid[0] < 1.0);
        assert!(clusters[1].centroid[0] > 9.0);
    }

    #[test]
    fn test_hierarchical_separates_blobs() {
        let mut chunks = two_blobs();
        let clusters = cluster_chunks(&mut chunks, 2, ClusterMethod::Hierarchical, 0).unwrap();
        assert_partition(&chunks, &clusters);
        assert_eq!(clusters[0].chunk_ids, vec![0, 2, 4, 6, 8]);
        assert_eq!(clusters[1].chunk_ids, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_centroid_is_member_mean() {
        let mut chunks = vec![chunk(0, vec![1.0, 2.0]), chunk(1, vec![3.0, 4.0])];
        let clusters = cluster_chunks(&mut chunks, 1, ClusterMethod::KMeans, 7).unwrap();
        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].centroid, vec![2.0, 3.0]);
    }

    #[test]
    fn test_k_larger_than_chunk_count() {
        for method in [ClusterMethod::KMeans, ClusterMethod::Hierarchical] {
            let mut chunks = vec![
                chunk(0, vec![0.0, 0.0]),
                chunk(1, vec![5.0, 5.0]),
                chunk(2, vec![9.0, 1.0]),
            ];
            let clusters = cluster_chunks(&mut chunks, 10, method, DEFAULT_SEED).unwrap();
            assert_eq!(clusters.len(), 3);
            assert_partition(&chunks, &clusters);
            // a single-member centroid equals the member but is its own vector
            assert_eq!(clusters[0].centroid, chunks[0].embedding);
        }
    }

    #[test]
    fn test_identical_embeddings_still_fill_every_cluster() {
        let mut chunks: Vec<Chunk> = (0..5).map(|i| chunk(i, vec![1.0, 1.0, 1.0])).collect();
        let clusters = cluster_chunks(&mut chunks, 3, ClusterMethod::KMeans, DEFAULT_SEED).unwrap();
        assert_eq!(clusters.len(), 3);
        assert_partition(&chunks, &clusters);
    }

    #[test]
    fn test_kmeans_is_reproducible() {
        let make = || -> Vec<Chunk> {
            (0..30)
                .map(|i| {
                    let x = ((i * 37) % 17) as f32;
                    let y = ((i * 11) % 13) as f32;
                    chunk(i, vec![x, y, x - y])
                })
                .collect()
        };
        let mut a = make();
        let mut b = make();
        let ca = cluster_chunks(&mut a, 4, ClusterMethod::KMeans, 99).unwrap();
        let cb = cluster_chunks(&mut b, 4, ClusterMethod::KMeans, 99).unwrap();
        assert_eq!(ca, cb);
        assert_partition(&a, &ca);
        // canonical labelling: chunk 0 always lands in cluster 0
        assert_eq!(a[0].cluster_id(), Some(0));
    }

    #[test]
    fn test_empty_input() {
        let mut chunks: Vec<Chunk> = Vec::new();
        let clusters = cluster_chunks(&mut chunks, 3, ClusterMethod::KMeans, DEFAULT_SEED).unwrap();
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_zero_k_is_configuration_error() {
        let mut chunks = two_blobs();
        let err = cluster_chunks(&mut chunks, 0, ClusterMethod::KMeans, DEFAULT_SEED).unwrap_err();
        assert_eq!(err.kind(), "ConfigurationError");
        assert!(chunks.iter().all(|c| c.cluster_id().is_none()));
    }

    #[test]
    fn test_reclustering_fails_without_mutation() {
        let mut chunks = two_blobs();
        chunks[3].assign_cluster(0).unwrap();
        let err = cluster_chunks(&mut chunks, 2, ClusterMethod::KMeans, DEFAULT_SEED).unwrap_err();
        assert_eq!(err.kind(), "InvariantError");
        assert_eq!(chunks[0].cluster_id(), None);
        assert_eq!(chunks[3].cluster_id(), Some(0));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut chunks = vec![chunk(0, vec![1.0, 2.0]), chunk(1, vec![1.0])];
        let err = cluster_chunks(&mut chunks, 2, ClusterMethod::KMeans, DEFAULT_SEED).unwrap_err();
        assert_eq!(err.kind(), "EmbeddingError");
        assert!(err.to_string().contains("chunk 1"));
    }

    #[test]
    fn test_canonicalize() {
        assert_eq!(canonicalize(&[2, 2, 0, 1, 0]), vec![0, 0, 1, 2, 1]);
    }
}
