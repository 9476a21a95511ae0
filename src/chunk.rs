//! Line-boundary text chunker with token overlap.
//!
//! Splits a source file into [`PendingChunk`]s that respect a configurable
//! `chunk_size_tokens` budget. Splitting only ever happens between lines, so a
//! chunk is always a run of whole lines of the original file.
//!
//! # Algorithm
//!
//! 1. Estimate tokens with a 4 chars/token heuristic ([`count_tokens`]).
//! 2. Accumulate lines until adding the next one would exceed the budget.
//! 3. Close the chunk, then seed the next one by walking backward through the
//!    closed chunk and keeping whole lines while their running token total
//!    stays within `overlap_tokens`.
//! 4. Flush whatever remains as the last chunk.
//!
//! A single line longer than the budget is kept whole, so a chunk may exceed
//! the nominal size by one line.
//!
//! # Example
//!
//! ```rust
//! use docpack::chunk::{chunk_file, ChunkIdAllocator};
//!
//! let ids = ChunkIdAllocator::new();
//! let chunks = chunk_file("src/lib.rs", b"fn a() {}\nfn b() {}\n", 500, 50, &ids);
//! assert_eq!(chunks.len(), 1);
//! assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 2));
//! ```

use std::sync::atomic::{AtomicU64, Ordering};

use crate::models::PendingChunk;

/// Approximate characters-per-token ratio.
///
/// Never reconciled with the embedding or generation model's tokenizer.
const CHARS_PER_TOKEN: usize = 4;

/// Approximate token count of `text`: characters divided by four.
pub fn count_tokens(text: &str) -> usize {
    text.chars().count() / CHARS_PER_TOKEN
}

/// Hands out chunk ids for one pipeline run.
///
/// Ids are dense, zero-based and never reused, even if files are chunked from
/// several threads.
#[derive(Debug, Default)]
pub struct ChunkIdAllocator {
    next: AtomicU64,
}

impl ChunkIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn next_id(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// Number of ids handed out so far.
    pub fn issued(&self) -> u64 {
        self.next.load(Ordering::SeqCst)
    }
}

/// A run of lines selected by [`split_lines`]. Line numbers are 0-indexed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineSpan {
    pub text: String,
    pub start_line: usize,
    pub end_line: usize,
}

/// Split a file into chunks. Returns nothing for undecodable or blank files.
pub fn chunk_file(
    path: &str,
    bytes: &[u8],
    chunk_size_tokens: usize,
    overlap_tokens: usize,
    ids: &ChunkIdAllocator,
) -> Vec<PendingChunk> {
    let text = match std::str::from_utf8(bytes) {
        Ok(text) => text,
        Err(_) => return Vec::new(),
    };
    if text.trim().is_empty() {
        return Vec::new();
    }

    split_lines(text, chunk_size_tokens, overlap_tokens)
        .into_iter()
        .map(|span| PendingChunk {
            chunk_id: ids.next_id(),
            file_path: path.to_string(),
            start_line: span.start_line + 1,
            end_line: span.end_line + 1,
            tokens: count_tokens(&span.text),
            text: span.text,
        })
        .collect()
}

/// Split `text` into overlapping line spans under a token budget.
pub fn split_lines(text: &str, chunk_size_tokens: usize, overlap_tokens: usize) -> Vec<LineSpan> {
    let mut lines: Vec<&str> = text.split('\n').collect();
    if text.ends_with('\n') {
        lines.pop();
    }

    let mut spans = Vec::new();
    let mut current: Vec<&str> = Vec::new();
    let mut current_tokens = 0usize;
    let mut start_line = 0usize;

    for (idx, line) in lines.iter().enumerate() {
        let line_tokens = count_tokens(line);

        if current_tokens + line_tokens > chunk_size_tokens && !current.is_empty() {
            spans.push(LineSpan {
                text: current.join("\n"),
                start_line,
                end_line: idx - 1,
            });

            // Keep trailing whole lines within the overlap budget. A short
            // closed chunk may be carried over whole.
            let mut keep = 0usize;
            let mut kept_tokens = 0usize;
            for prev in current.iter().rev() {
                let prev_tokens = count_tokens(prev);
                if kept_tokens + prev_tokens > overlap_tokens {
                    break;
                }
                kept_tokens += prev_tokens;
                keep += 1;
            }

            current.drain(..current.len() - keep);
            current_tokens = kept_tokens;
            start_line = idx - keep;
        }

        current.push(line);
        current_tokens += line_tokens;
    }

    if !current.is_empty() {
        spans.push(LineSpan {
            text: current.join("\n"),
            start_line,
            end_line: lines.len() - 1,
        });
    }

    spans
}
