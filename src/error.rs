//! Error taxonomy for the docpack pipeline.
//!
//! Every failure that crosses a module boundary is a [`DocpackError`]. Each
//! variant names the unit that failed (file path, chunk id, cluster id or
//! container entry) so the CLI can report it verbatim. Undecodable files are
//! not errors at all: the chunker skips them.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, DocpackError>;

#[derive(Error, Debug)]
pub enum DocpackError {
    /// Invalid configuration, unknown method/provider, or an intent that
    /// cannot be executed with the configured capabilities.
    #[error("{0}")]
    Configuration(String),

    /// A field schema failed to compile.
    #[error("invalid schema at {path}: {message}")]
    Schema { path: String, message: String },

    #[error("embedding failed for {unit}: {message}")]
    Embedding { unit: String, message: String },

    #[error("generation failed for {unit}: {message}")]
    Generation { unit: String, message: String },

    /// Generated JSON did not conform to the compiled schema.
    #[error("output for {unit} does not match schema: {}", .issues.join("; "))]
    SchemaValidation { unit: String, issues: Vec<String> },

    #[error("archive entry {entry}: {message}")]
    ArchiveIo { entry: String, message: String },

    /// A set-once slot was written twice, or a reference dangles.
    #[error("{0}")]
    Invariant(String),
}

impl DocpackError {
    /// Taxonomy name shown to users (`error [<kind>]: ...`).
    pub fn kind(&self) -> &'static str {
        match self {
            DocpackError::Configuration(_) => "ConfigurationError",
            DocpackError::Schema { .. } => "SchemaError",
            DocpackError::Embedding { .. } => "EmbeddingError",
            DocpackError::Generation { .. } => "GenerationError",
            DocpackError::SchemaValidation { .. } => "SchemaValidationError",
            DocpackError::ArchiveIo { .. } => "ArchiveIOError",
            DocpackError::Invariant(_) => "InvariantError",
        }
    }

    pub(crate) fn archive(entry: impl Into<String>, message: impl ToString) -> Self {
        DocpackError::ArchiveIo {
            entry: entry.into(),
            message: message.to_string(),
        }
    }
}
