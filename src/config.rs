//! TOML configuration.
//!
//! Every section is optional; a missing file section falls back to the
//! defaults below, so `Config::default()` is a complete, valid configuration.
//!
//! ```toml
//! [chunking]
//! max_tokens = 500
//! overlap_tokens = 50
//!
//! [clustering]
//! k = 10
//! method = "kmeans"      # or "hierarchical"
//! seed = 42
//!
//! [embedding]
//! provider = "ollama"    # "ollama" | "openai" | "disabled"
//! model = "nomic-embed-text"
//! batch_size = 16
//! concurrency = 4
//!
//! [generation]
//! provider = "ollama"
//! model = "phi4-mini-reasoning"
//! concurrency = 2
//!
//! [ingest]
//! include_globs = ["**/*"]
//! exclude_globs = ["**/*.lock"]
//! max_file_bytes = 1048576
//!
//! [output]
//! include_raw_files = true
//! format = "zip"         # or "directory"
//! ```

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

use crate::archive::ContainerFormat;
use crate::cluster::ClusterMethod;

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    #[serde(default)]
    pub chunking: ChunkingConfig,
    #[serde(default)]
    pub clustering: ClusteringConfig,
    #[serde(default)]
    pub embedding: EmbeddingConfig,
    #[serde(default)]
    pub generation: GenerationConfig,
    #[serde(default)]
    pub ingest: IngestConfig,
    #[serde(default)]
    pub output: OutputConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ChunkingConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_overlap")]
    pub overlap_tokens: usize,
}

impl Default for ChunkingConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            overlap_tokens: default_overlap(),
        }
    }
}

fn default_max_tokens() -> usize {
    500
}
fn default_overlap() -> usize {
    50
}

#[derive(Debug, Deserialize, Clone)]
pub struct ClusteringConfig {
    #[serde(default = "default_k")]
    pub k: usize,
    #[serde(default = "default_method")]
    pub method: String,
    #[serde(default = "default_seed")]
    pub seed: u64,
}

impl Default for ClusteringConfig {
    fn default() -> Self {
        Self {
            k: default_k(),
            method: default_method(),
            seed: default_seed(),
        }
    }
}

fn default_k() -> usize {
    10
}
fn default_method() -> String {
    "kmeans".to_string()
}
fn default_seed() -> u64 {
    crate::cluster::DEFAULT_SEED
}

#[derive(Debug, Deserialize, Clone)]
pub struct EmbeddingConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    /// Expected vector length. Checked against every returned vector.
    #[serde(default)]
    pub dims: Option<usize>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_embed_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_embed_retries")]
    pub max_retries: u32,
    #[serde(default = "default_embed_timeout")]
    pub timeout_secs: u64,
}

impl Default for EmbeddingConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            dims: None,
            batch_size: default_batch_size(),
            concurrency: default_embed_concurrency(),
            max_retries: default_embed_retries(),
            timeout_secs: default_embed_timeout(),
        }
    }
}

impl EmbeddingConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    /// Configured model, or the provider's default.
    pub fn model_name(&self) -> String {
        match &self.model {
            Some(model) => model.clone(),
            None if self.provider == "openai" => "text-embedding-3-small".to_string(),
            None => "nomic-embed-text".to_string(),
        }
    }
}

fn default_provider() -> String {
    "ollama".to_string()
}
fn default_batch_size() -> usize {
    16
}
fn default_embed_concurrency() -> usize {
    4
}
fn default_embed_retries() -> u32 {
    3
}
fn default_embed_timeout() -> u64 {
    30
}

#[derive(Debug, Deserialize, Clone)]
pub struct GenerationConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default = "default_gen_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_gen_retries")]
    pub max_retries: u32,
    #[serde(default = "default_gen_timeout")]
    pub timeout_secs: u64,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            url: None,
            concurrency: default_gen_concurrency(),
            max_retries: default_gen_retries(),
            timeout_secs: default_gen_timeout(),
        }
    }
}

impl GenerationConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }

    pub fn model_name(&self) -> String {
        match &self.model {
            Some(model) => model.clone(),
            None if self.provider == "openai" => "gpt-4o-mini".to_string(),
            None => "phi4-mini-reasoning".to_string(),
        }
    }
}

fn default_gen_concurrency() -> usize {
    2
}
fn default_gen_retries() -> u32 {
    2
}
fn default_gen_timeout() -> u64 {
    300
}

#[derive(Debug, Deserialize, Clone)]
pub struct IngestConfig {
    #[serde(default = "default_include_globs")]
    pub include_globs: Vec<String>,
    #[serde(default)]
    pub exclude_globs: Vec<String>,
    #[serde(default)]
    pub follow_symlinks: bool,
    #[serde(default = "default_max_file_bytes")]
    pub max_file_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            include_globs: default_include_globs(),
            exclude_globs: Vec::new(),
            follow_symlinks: false,
            max_file_bytes: default_max_file_bytes(),
        }
    }
}

fn default_include_globs() -> Vec<String> {
    vec!["**/*".to_string()]
}
fn default_max_file_bytes() -> u64 {
    1024 * 1024
}

#[derive(Debug, Deserialize, Clone)]
pub struct OutputConfig {
    #[serde(default = "default_include_raw")]
    pub include_raw_files: bool,
    #[serde(default = "default_format")]
    pub format: String,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            include_raw_files: default_include_raw(),
            format: default_format(),
        }
    }
}

fn default_include_raw() -> bool {
    true
}
fn default_format() -> String {
    "zip".to_string()
}

impl Config {
    /// Check cross-field constraints. Run again after CLI overrides.
    pub fn validate(&self) -> Result<()> {
        if self.chunking.max_tokens == 0 {
            anyhow::bail!("chunking.max_tokens must be > 0");
        }
        if self.chunking.overlap_tokens >= self.chunking.max_tokens {
            anyhow::bail!(
                "chunking.overlap_tokens ({}) must be < chunking.max_tokens ({})",
                self.chunking.overlap_tokens,
                self.chunking.max_tokens
            );
        }

        if self.clustering.k == 0 {
            anyhow::bail!("clustering.k must be >= 1");
        }
        self.cluster_method()?;

        match self.embedding.provider.as_str() {
            "disabled" | "ollama" | "openai" => {}
            other => anyhow::bail!(
                "Unknown embedding provider: '{}'. Must be disabled, ollama, or openai.",
                other
            ),
        }
        if self.embedding.dims == Some(0) {
            anyhow::bail!("embedding.dims must be > 0 when set");
        }
        if self.embedding.batch_size == 0 {
            anyhow::bail!("embedding.batch_size must be >= 1");
        }
        if self.embedding.concurrency == 0 {
            anyhow::bail!("embedding.concurrency must be >= 1");
        }

        match self.generation.provider.as_str() {
            "disabled" | "ollama" | "openai" => {}
            other => anyhow::bail!(
                "Unknown generation provider: '{}'. Must be disabled, ollama, or openai.",
                other
            ),
        }
        if self.generation.concurrency == 0 {
            anyhow::bail!("generation.concurrency must be >= 1");
        }

        self.container_format()?;
        Ok(())
    }

    pub fn cluster_method(&self) -> Result<ClusterMethod> {
        Ok(self.clustering.method.parse::<ClusterMethod>()?)
    }

    pub fn container_format(&self) -> Result<ContainerFormat> {
        Ok(self.output.format.parse::<ContainerFormat>()?)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_config(content: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(content.as_bytes()).unwrap();
        file
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = Config::default();
        config.validate().unwrap();
        assert_eq!(config.chunking.max_tokens, 500);
        assert_eq!(config.chunking.overlap_tokens, 50);
        assert_eq!(config.clustering.k, 10);
        assert_eq!(config.clustering.seed, 42);
        assert_eq!(config.embedding.model_name(), "nomic-embed-text");
        assert_eq!(config.generation.model_name(), "phi4-mini-reasoning");
        assert!(config.output.include_raw_files);
        assert_eq!(config.container_format().unwrap(), ContainerFormat::Zip);
    }

    #[test]
    fn test_partial_file_keeps_other_defaults() {
        let file = write_config(
            r#"
[chunking]
max_tokens = 200

[clustering]
method = "hierarchical"

[embedding]
provider = "openai"
"#,
        );
        let config = load_config(file.path()).unwrap();
        assert_eq!(config.chunking.max_tokens, 200);
        assert_eq!(config.chunking.overlap_tokens, 50);
        assert_eq!(config.cluster_method().unwrap(), ClusterMethod::Hierarchical);
        assert_eq!(config.embedding.model_name(), "text-embedding-3-small");
        assert_eq!(config.embedding.batch_size, 16);
        assert_eq!(config.ingest.include_globs, vec!["**/*".to_string()]);
    }

    #[test]
    fn test_overlap_must_be_below_size() {
        let file = write_config("[chunking]\nmax_tokens = 50\noverlap_tokens = 50\n");
        let err = load_config(file.path()).unwrap_err();
        assert!(err.to_string().contains("overlap_tokens"));
    }

    #[test]
    fn test_unknown_values_rejected() {
        for body in [
            "[clustering]\nmethod = \"dbscan\"\n",
            "[clustering]\nk = 0\n",
            "[embedding]\nprovider = \"local\"\n",
            "[generation]\nprovider = \"anthropic\"\n",
            "[output]\nformat = \"tar\"\n",
        ] {
            let file = write_config(body);
            assert!(load_config(file.path()).is_err(), "accepted: {}", body);
        }
    }

    #[test]
    fn test_missing_file() {
        let err = load_config(Path::new("/nonexistent/docpack.toml")).unwrap_err();
        assert!(err.to_string().contains("Failed to read config file"));
    }
}
