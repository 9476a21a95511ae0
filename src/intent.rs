//! Intent declarations.
//!
//! An intent names what the archive is for and declares the shape of the
//! summaries to synthesize. Intent files are TOML or JSON, picked by
//! extension:
//!
//! ```toml
//! name = "onboarding"
//! description = "Explain the codebase to a new contributor"
//! max_chunks_per_cluster = 8
//!
//! [cluster_schema]
//! topic = "str"
//! tags = ["str"]
//! "note?" = "str"
//!
//! [project_schema]
//! overview = "str"
//! components = [{ name = "str", role = "str" }]
//! ```
//!
//! Every declared schema is compiled at load time, so a malformed intent fails
//! before any chunking or network work happens.
//!
//! `minimal`, `onboarding` and `index-only` are built in and can be named
//! instead of a path. See [`resolve_intent`].

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DocpackError, Result};
use crate::schema::{self, TypeDescriptor};

pub const PROJECT_SCHEMA_NAME: &str = "ProjectSummary";
pub const CLUSTER_SCHEMA_NAME: &str = "ClusterSummary";
pub const CHUNK_SCHEMA_NAME: &str = "ChunkSummary";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct IntentSpec {
    pub name: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub project_schema: Option<Map<String, Value>>,
    #[serde(default)]
    pub cluster_schema: Option<Map<String, Value>>,
    /// Validated at load, not used by the pipeline.
    #[serde(default)]
    pub chunk_schema: Option<Map<String, Value>>,
    #[serde(default = "default_max_chunks_per_cluster")]
    pub max_chunks_per_cluster: usize,
    #[serde(default)]
    pub allow_cross_file_inference: bool,
    #[serde(default = "default_allow_global_summary")]
    pub allow_global_summary: bool,
}

fn default_max_chunks_per_cluster() -> usize {
    10
}

fn default_allow_global_summary() -> bool {
    true
}

/// Compiled descriptors for the schemas an intent declares.
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledIntent {
    pub project: Option<TypeDescriptor>,
    pub cluster: Option<TypeDescriptor>,
    pub chunk: Option<TypeDescriptor>,
}

impl IntentSpec {
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let intent: IntentSpec = toml::from_str(content).map_err(|e| {
            DocpackError::Configuration(format!("failed to parse intent TOML: {}", e))
        })?;
        intent.validate()?;
        Ok(intent)
    }

    pub fn from_json_str(content: &str) -> Result<Self> {
        let intent: IntentSpec = serde_json::from_str(content).map_err(|e| {
            DocpackError::Configuration(format!("failed to parse intent JSON: {}", e))
        })?;
        intent.validate()?;
        Ok(intent)
    }

    /// Check knobs and compile every declared schema.
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(DocpackError::Configuration(
                "intent.name must not be empty".to_string(),
            ));
        }
        if self.max_chunks_per_cluster == 0 {
            return Err(DocpackError::Configuration(
                "intent.max_chunks_per_cluster must be >= 1".to_string(),
            ));
        }
        self.compile().map(|_| ())
    }

    pub fn compile(&self) -> Result<CompiledIntent> {
        Ok(CompiledIntent {
            project: compile_optional(PROJECT_SCHEMA_NAME, self.project_schema.as_ref())?,
            cluster: compile_optional(CLUSTER_SCHEMA_NAME, self.cluster_schema.as_ref())?,
            chunk: compile_optional(CHUNK_SCHEMA_NAME, self.chunk_schema.as_ref())?,
        })
    }

    /// Whether a project summary will be requested from the generator.
    pub fn wants_project_summary(&self) -> bool {
        self.allow_global_summary && self.project_schema.is_some()
    }

    /// Whether any pipeline stage will call the generator.
    pub fn needs_generator(&self) -> bool {
        self.cluster_schema.is_some() || self.wants_project_summary()
    }
}

fn compile_optional(name: &str, spec: Option<&Map<String, Value>>) -> Result<Option<TypeDescriptor>> {
    spec.map(|spec| schema::compile(name, spec)).transpose()
}

/// Load and validate an intent file. `.json` is parsed as JSON, anything else
/// as TOML.
pub fn load_intent(path: &Path) -> Result<IntentSpec> {
    let content = std::fs::read_to_string(path).map_err(|e| {
        DocpackError::Configuration(format!(
            "failed to read intent file {}: {}",
            path.display(),
            e
        ))
    })?;

    let is_json = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| ext.eq_ignore_ascii_case("json"))
        .unwrap_or(false);

    if is_json {
        IntentSpec::from_json_str(&content)
    } else {
        IntentSpec::from_toml_str(&content)
    }
}

/// Intent used when none is named.
pub const DEFAULT_INTENT: &str = "minimal";

struct BuiltinIntent {
    name: &'static str,
    source: &'static str,
    json: bool,
}

const BUILTIN_INTENTS: &[BuiltinIntent] = &[
    BuiltinIntent {
        name: "minimal",
        source: include_str!("../demos/minimal.toml"),
        json: false,
    },
    BuiltinIntent {
        name: "onboarding",
        source: include_str!("../demos/onboarding.toml"),
        json: false,
    },
    BuiltinIntent {
        name: "index-only",
        source: include_str!("../demos/index-only.json"),
        json: true,
    },
];

pub fn builtin_intent_names() -> Vec<&'static str> {
    BUILTIN_INTENTS.iter().map(|b| b.name).collect()
}

/// Parse the built-in intent called `name`, if there is one.
pub fn builtin_intent(name: &str) -> Option<Result<IntentSpec>> {
    BUILTIN_INTENTS.iter().find(|b| b.name == name).map(|b| {
        if b.json {
            IntentSpec::from_json_str(b.source)
        } else {
            IntentSpec::from_toml_str(b.source)
        }
    })
}

/// Resolve an `--intent` argument: a built-in name first, then a file path.
pub fn resolve_intent(arg: &str) -> Result<IntentSpec> {
    if let Some(intent) = builtin_intent(arg) {
        return intent;
    }
    let path = Path::new(arg);
    if !path.exists() {
        return Err(DocpackError::Configuration(format!(
            "intent '{}' is neither a built-in intent ({}) nor an existing file",
            arg,
            builtin_intent_names().join(", ")
        )));
    }
    load_intent(path)
}
