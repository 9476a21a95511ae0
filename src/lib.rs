//! # docpack
//!
//! Turns a source tree into a portable, self-describing `.docpack` archive of
//! semantically grouped, summarized chunks.
//!
//! A run splits every text file into token-bounded, line-aligned chunks,
//! embeds them, partitions the chunks into clusters, asks a language model
//! for a structured summary of each cluster and of the whole project, and
//! writes everything into one archive. What the summaries contain is declared
//! by an *intent*: a small file of field schemas compiled into JSON Schema.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │  Ingest  │──▶│  Chunk   │──▶│  Embed   │──▶│ Cluster  │
//! │ dir/zip  │   │  lines   │   │  Ollama  │   │ k-means  │
//! └──────────┘   └──────────┘   │  OpenAI  │   │   Ward   │
//!                               └──────────┘   └────┬─────┘
//!                                                   ▼
//!                ┌──────────┐                  ┌──────────┐
//!                │ .docpack │◀─────────────────│Synthesize│
//!                │ zip/dir  │                  │ clusters │
//!                └──────────┘                  │ project  │
//!                                              └──────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! docpack intent check intent.toml
//! docpack build ./my-project --intent intent.toml
//! docpack inspect my-project.docpack
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`error`] | Error taxonomy |
//! | [`ingest`] | Directory and zip ingestion |
//! | [`chunk`] | Line-aligned text chunking |
//! | [`embedding`] | Embedding provider abstraction |
//! | [`cluster`] | k-means and Ward clustering |
//! | [`schema`] | Field-schema compiler and validator |
//! | [`intent`] | Intent declarations |
//! | [`generation`] | Structured-generation provider abstraction |
//! | [`prompts`] | Prompt construction |
//! | [`synthesize`] | Cluster and project summaries |
//! | [`pipeline`] | End-to-end build |
//! | [`archive`] | Archive container codec |
//! | [`inspect`] | Archive reports |
//! | [`progress`] | Progress reporting on stderr |

pub mod archive;
pub mod chunk;
pub mod cluster;
pub mod config;
pub mod embedding;
pub mod error;
pub mod generation;
mod http;
pub mod ingest;
pub mod inspect;
pub mod intent;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod schema;
pub mod synthesize;
