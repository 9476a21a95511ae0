//! Source ingestion: turn a directory tree or a `.zip` file into the
//! normalized virtual file list the pipeline consumes.
//!
//! Every path is sanitized (relative, forward-slash, no traversal), files
//! larger than `max_file_bytes` are skipped, duplicates collapse with the
//! last one winning, and the result is sorted by path. `.git`, `target` and
//! `node_modules` are always excluded. A zip whose entries all sit under one
//! folder is read as if that folder were the root.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use walkdir::WalkDir;

use crate::config::IngestConfig;
use crate::models::{SourceFile, SourceInfo};
use crate::progress::{ProgressEvent, ProgressReporter};

const DEFAULT_EXCLUDES: &[&str] = &["**/.git/**", "**/target/**", "**/node_modules/**"];

/// Normalize a source path. Returns `None` for empty or traversing paths.
///
/// ```rust
/// use docpack::ingest::sanitize_path;
///
/// assert_eq!(sanitize_path("./src\\lib.rs").as_deref(), Some("src/lib.rs"));
/// assert_eq!(sanitize_path("../etc/passwd"), None);
/// ```
pub fn sanitize_path(raw: &str) -> Option<String> {
    let normalized = raw.replace('\\', "/");
    let mut parts = Vec::new();
    for part in normalized.split('/') {
        match part {
            "" | "." => continue,
            ".." => return None,
            other => parts.push(other),
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(Glob::new(pattern).with_context(|| format!("invalid glob: {}", pattern))?);
    }
    Ok(builder.build()?)
}

struct PathFilter {
    include: GlobSet,
    exclude: GlobSet,
}

impl PathFilter {
    fn new(config: &IngestConfig) -> Result<Self> {
        let mut excludes: Vec<String> = DEFAULT_EXCLUDES.iter().map(|s| s.to_string()).collect();
        excludes.extend(config.exclude_globs.iter().cloned());
        Ok(Self {
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&excludes)?,
        })
    }

    fn accepts(&self, path: &str) -> bool {
        !self.exclude.is_match(path) && self.include.is_match(path)
    }
}

/// SHA-256 over every (path, bytes) pair in path order.
pub fn digest_files(files: &[SourceFile]) -> String {
    let mut hasher = Sha256::new();
    for file in files {
        hasher.update(file.path.as_bytes());
        hasher.update([0u8]);
        hasher.update((file.bytes.len() as u64).to_le_bytes());
        hasher.update(&file.bytes);
    }
    format!("{:x}", hasher.finalize())
}

fn skip(progress: &dyn ProgressReporter, path: &str, reason: impl Into<String>) {
    progress.report(ProgressEvent::Skipped {
        path: path.to_string(),
        reason: reason.into(),
    });
}

/// Load the files under `path`, a directory or a `.zip` file.
pub fn load_source(
    path: &Path,
    config: &IngestConfig,
    progress: &dyn ProgressReporter,
) -> Result<(SourceInfo, Vec<SourceFile>)> {
    if !path.exists() {
        bail!("Source does not exist: {}", path.display());
    }
    let filter = PathFilter::new(config)?;

    let (source_type, collected) = if path.is_dir() {
        ("directory", scan_directory(path, config, &filter, progress)?)
    } else if is_zip(path) {
        ("zip", scan_zip(path, config, &filter, progress)?)
    } else {
        bail!(
            "Source must be a directory or a .zip file: {}",
            path.display()
        );
    };

    let files: Vec<SourceFile> = collected
        .into_iter()
        .map(|(path, bytes)| SourceFile { path, bytes })
        .collect();

    let identifier = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| path.display().to_string());

    let info = SourceInfo {
        source_type: source_type.to_string(),
        identifier,
        digest: digest_files(&files),
    };
    Ok((info, files))
}

fn is_zip(path: &Path) -> bool {
    path.extension()
        .map(|ext| ext.eq_ignore_ascii_case("zip"))
        .unwrap_or(false)
}

fn scan_directory(
    root: &Path,
    config: &IngestConfig,
    filter: &PathFilter,
    progress: &dyn ProgressReporter,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let mut files = BTreeMap::new();

    for entry in WalkDir::new(root).follow_links(config.follow_symlinks) {
        let entry = entry?;
        if !entry.file_type().is_file() {
            continue;
        }

        let path = entry.path();
        let relative = path.strip_prefix(root).unwrap_or(path);
        let raw = relative.to_string_lossy().to_string();
        let rel = match sanitize_path(&raw) {
            Some(rel) => rel,
            None => {
                skip(progress, &raw, "invalid path");
                continue;
            }
        };

        if !filter.accepts(&rel) {
            continue;
        }

        let size = entry.metadata()?.len();
        if size > config.max_file_bytes {
            skip(progress, &rel, format!("{} bytes exceeds max_file_bytes", size));
            continue;
        }

        let bytes =
            std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
        files.insert(rel, bytes);
    }

    Ok(files)
}

/// The first component every path shares, when no path is a top-level
/// file. Zip downloads of a repository wrap the tree in one such folder,
/// e.g. `repo-main/`.
fn shared_top_level<'a>(paths: impl IntoIterator<Item = &'a str>) -> Option<String> {
    let mut top: Option<&str> = None;
    for path in paths {
        let (first, _) = path.split_once('/')?;
        match top {
            Some(seen) if seen != first => return None,
            Some(_) => {}
            None => top = Some(first),
        }
    }
    top.map(str::to_string)
}

fn scan_zip(
    path: &Path,
    config: &IngestConfig,
    filter: &PathFilter,
    progress: &dyn ProgressReporter,
) -> Result<BTreeMap<String, Vec<u8>>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut archive = zip::ZipArchive::new(file)
        .with_context(|| format!("Not a valid zip file: {}", path.display()))?;

    let mut entries = Vec::new();
    for index in 0..archive.len() {
        let entry = archive.by_index(index)?;
        if entry.is_dir() {
            continue;
        }
        let raw = entry.name().to_string();
        match sanitize_path(&raw) {
            Some(rel) => entries.push((index, raw, rel)),
            None => skip(progress, &raw, "invalid path"),
        }
    }

    let top = shared_top_level(entries.iter().map(|(_, _, rel)| rel.as_str()));
    let mut files = BTreeMap::new();
    for (index, raw, rel) in entries {
        let rel = match &top {
            Some(top) => rel[top.len() + 1..].to_string(),
            None => rel,
        };
        if !filter.accepts(&rel) {
            continue;
        }

        let entry = archive.by_index(index)?;
        if entry.size() > config.max_file_bytes {
            skip(
                progress,
                &rel,
                format!("{} bytes exceeds max_file_bytes", entry.size()),
            );
            continue;
        }

        // The declared size can lie; cap the actual read as well.
        let mut bytes = Vec::new();
        entry
            .take(config.max_file_bytes + 1)
            .read_to_end(&mut bytes)
            .with_context(|| format!("Failed to read zip entry {}", raw))?;
        if bytes.len() as u64 > config.max_file_bytes {
            skip(progress, &rel, "entry exceeds max_file_bytes");
            continue;
        }

        files.insert(rel, bytes);
    }

    Ok(files)
}
