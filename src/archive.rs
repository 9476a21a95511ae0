//! Archive codec: the `.docpack` container format.
//!
//! An archive is a set of named records. The same layout is stored either in
//! a zip file (default, deflate-compressed) or in a plain directory tree:
//!
//! ```text
//! manifest.json
//! intent.json
//! project_summary.json
//! chunks/chunk_00000000.json
//! chunks/chunk_00000001.json
//! clusters/cluster_00000000.json
//! raw/<relative path>            (only when manifest.includes_raw_files)
//! ```
//!
//! Ids are zero-padded to eight digits so name order equals numeric order.
//! JSON records are pretty-printed UTF-8.
//!
//! Writes go to a temporary sibling of the destination and are moved into
//! place only after every record was written. A failed write leaves the
//! destination untouched.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tempfile::{NamedTempFile, TempDir};
use walkdir::WalkDir;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{DocpackError, Result};
use crate::intent::IntentSpec;
use crate::models::{Archive, Chunk, Cluster, Manifest};

pub const MANIFEST_RECORD: &str = "manifest.json";
pub const INTENT_RECORD: &str = "intent.json";
pub const PROJECT_SUMMARY_RECORD: &str = "project_summary.json";
pub const CHUNKS_PREFIX: &str = "chunks/";
pub const CLUSTERS_PREFIX: &str = "clusters/";
pub const RAW_PREFIX: &str = "raw/";

const ID_WIDTH: usize = 8;
const MAX_ID: u64 = 99_999_999;

/// Maximum decompressed bytes read from a single zip record.
const MAX_RECORD_BYTES: u64 = 512 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContainerFormat {
    Zip,
    Directory,
}

impl FromStr for ContainerFormat {
    type Err = DocpackError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "zip" => Ok(ContainerFormat::Zip),
            "directory" | "dir" => Ok(ContainerFormat::Directory),
            other => Err(DocpackError::Configuration(format!(
                "Unknown archive format: '{}'. Must be zip or directory.",
                other
            ))),
        }
    }
}

impl fmt::Display for ContainerFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ContainerFormat::Zip => write!(f, "zip"),
            ContainerFormat::Directory => write!(f, "directory"),
        }
    }
}

fn numbered_record(prefix: &str, stem: &str, id: u64) -> Result<String> {
    if id > MAX_ID {
        return Err(DocpackError::archive(
            format!("{}{}_{}", prefix, stem, id),
            format!("id {} exceeds the {}-digit record name width", id, ID_WIDTH),
        ));
    }
    Ok(format!("{}{}_{:0width$}.json", prefix, stem, id, width = ID_WIDTH))
}

pub fn chunk_record_name(chunk_id: u64) -> Result<String> {
    numbered_record(CHUNKS_PREFIX, "chunk", chunk_id)
}

pub fn cluster_record_name(cluster_id: usize) -> Result<String> {
    numbered_record(CLUSTERS_PREFIX, "cluster", cluster_id as u64)
}

/// Record names are relative, forward-slash paths without traversal.
fn check_record_name(name: &str) -> Result<()> {
    let bad = name.is_empty()
        || name.starts_with('/')
        || name.contains('\\')
        || name.split('/').any(|seg| seg.is_empty() || seg == "." || seg == "..");
    if bad {
        return Err(DocpackError::archive(name, "invalid record name"));
    }
    Ok(())
}

// ============ Container abstraction ============

/// Write side of a named-record container.
pub trait RecordWriter {
    fn put(&mut self, name: &str, bytes: &[u8]) -> Result<()>;

    /// Move the finished container into place.
    fn commit(self: Box<Self>) -> Result<()>;
}

/// Read side of a named-record container.
pub trait RecordReader {
    /// Every record name, sorted.
    fn names(&self) -> Vec<String>;

    fn read(&mut self, name: &str) -> Result<Vec<u8>>;
}

fn prepare_parent(dest: &Path) -> Result<PathBuf> {
    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };
    std::fs::create_dir_all(&parent)
        .map_err(|e| DocpackError::archive(parent.display().to_string(), e))?;
    Ok(parent)
}

pub struct ZipRecordWriter {
    dest: PathBuf,
    temp: NamedTempFile,
    zip: ZipWriter<File>,
}

impl ZipRecordWriter {
    pub fn create(dest: &Path) -> Result<Self> {
        let entry = dest.display().to_string();
        let parent = prepare_parent(dest)?;
        let temp = tempfile::Builder::new()
            .prefix(".docpack-")
            .suffix(".tmp")
            .tempfile_in(&parent)
            .map_err(|e| DocpackError::archive(entry.clone(), e))?;
        let file = temp.reopen().map_err(|e| DocpackError::archive(entry, e))?;
        Ok(Self {
            dest: dest.to_path_buf(),
            temp,
            zip: ZipWriter::new(file),
        })
    }
}

impl RecordWriter for ZipRecordWriter {
    fn put(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        check_record_name(name)?;
        // Fixed timestamps keep identical archives byte-identical.
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .last_modified_time(zip::DateTime::default());
        self.zip
            .start_file(name, options)
            .map_err(|e| DocpackError::archive(name, e))?;
        self.zip
            .write_all(bytes)
            .map_err(|e| DocpackError::archive(name, e))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let entry = this.dest.display().to_string();
        let file = this
            .zip
            .finish()
            .map_err(|e| DocpackError::archive(entry.clone(), e))?;
        file.sync_all()
            .map_err(|e| DocpackError::archive(entry.clone(), e))?;
        this.temp
            .persist(&this.dest)
            .map_err(|e| DocpackError::archive(entry, e.error))?;
        Ok(())
    }
}

pub struct DirRecordWriter {
    dest: PathBuf,
    temp: TempDir,
}

impl DirRecordWriter {
    pub fn create(dest: &Path) -> Result<Self> {
        let parent = prepare_parent(dest)?;
        let temp = tempfile::Builder::new()
            .prefix(".docpack-")
            .tempdir_in(&parent)
            .map_err(|e| DocpackError::archive(dest.display().to_string(), e))?;
        Ok(Self {
            dest: dest.to_path_buf(),
            temp,
        })
    }
}

impl RecordWriter for DirRecordWriter {
    fn put(&mut self, name: &str, bytes: &[u8]) -> Result<()> {
        check_record_name(name)?;
        let path = self.temp.path().join(name);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| DocpackError::archive(name, e))?;
        }
        std::fs::write(&path, bytes).map_err(|e| DocpackError::archive(name, e))
    }

    fn commit(self: Box<Self>) -> Result<()> {
        let this = *self;
        let entry = this.dest.display().to_string();

        if this.dest.exists() {
            // Only ever replace a previous archive, never an arbitrary directory.
            if !this.dest.is_dir() || !this.dest.join(MANIFEST_RECORD).is_file() {
                return Err(DocpackError::archive(
                    entry,
                    "destination exists and is not a docpack directory",
                ));
            }
        }

        let staged = this.temp.keep();
        if let Err(e) = replace_dir(&staged, &this.dest) {
            let _ = std::fs::remove_dir_all(&staged);
            return Err(DocpackError::archive(entry, e));
        }
        Ok(())
    }
}

/// Move `staged` to `dest`. An existing `dest` is first renamed into a
/// temporary sibling and renamed back if the move fails.
fn replace_dir(staged: &Path, dest: &Path) -> std::io::Result<()> {
    if !dest.exists() {
        return std::fs::rename(staged, dest);
    }

    let parent = match dest.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let holder = tempfile::Builder::new()
        .prefix(".docpack-old-")
        .tempdir_in(parent)?;
    let previous = holder.path().join("previous");
    std::fs::rename(dest, &previous)?;

    if let Err(e) = std::fs::rename(staged, dest) {
        std::fs::rename(&previous, dest)?;
        return Err(e);
    }
    // dropping `holder` removes the previous archive
    Ok(())
}

pub struct ZipRecordReader {
    zip: ZipArchive<File>,
    names: Vec<String>,
}

impl ZipRecordReader {
    pub fn open(path: &Path) -> Result<Self> {
        let entry = path.display().to_string();
        let file = File::open(path).map_err(|e| DocpackError::archive(entry.clone(), e))?;
        let zip = ZipArchive::new(file)
            .map_err(|e| DocpackError::archive(entry, format!("not a valid archive: {}", e)))?;
        let mut names: Vec<String> = zip
            .file_names()
            .filter(|name| !name.ends_with('/'))
            .map(|name| name.to_string())
            .collect();
        names.sort();
        Ok(Self { zip, names })
    }
}

impl RecordReader for ZipRecordReader {
    fn names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        let entry = self
            .zip
            .by_name(name)
            .map_err(|_| DocpackError::archive(name, "missing record"))?;
        read_bounded(entry, name, MAX_RECORD_BYTES)
    }
}

/// Read at most `max` bytes. A record with more is an error, not a
/// truncated read.
fn read_bounded(reader: impl Read, name: &str, max: u64) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    reader
        .take(max.saturating_add(1))
        .read_to_end(&mut out)
        .map_err(|e| DocpackError::archive(name, e))?;
    if out.len() as u64 > max {
        return Err(DocpackError::archive(
            name,
            format!("record exceeds {} bytes", max),
        ));
    }
    Ok(out)
}

pub struct DirRecordReader {
    root: PathBuf,
    names: Vec<String>,
}

impl DirRecordReader {
    pub fn open(root: &Path) -> Result<Self> {
        let mut names = Vec::new();
        for entry in WalkDir::new(root).follow_links(false) {
            let entry =
                entry.map_err(|e| DocpackError::archive(root.display().to_string(), e))?;
            if !entry.file_type().is_file() {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(root) {
                let name: Vec<String> = rel
                    .components()
                    .map(|c| c.as_os_str().to_string_lossy().into_owned())
                    .collect();
                names.push(name.join("/"));
            }
        }
        names.sort();
        Ok(Self {
            root: root.to_path_buf(),
            names,
        })
    }
}

impl RecordReader for DirRecordReader {
    fn names(&self) -> Vec<String> {
        self.names.clone()
    }

    fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        check_record_name(name)?;
        std::fs::read(self.root.join(name)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                DocpackError::archive(name, "missing record")
            } else {
                DocpackError::archive(name, e)
            }
        })
    }
}

pub fn open_writer(format: ContainerFormat, dest: &Path) -> Result<Box<dyn RecordWriter>> {
    Ok(match format {
        ContainerFormat::Zip => Box::new(ZipRecordWriter::create(dest)?),
        ContainerFormat::Directory => Box::new(DirRecordWriter::create(dest)?),
    })
}

/// Directories are read as directory containers, files as zip.
pub fn open_reader(path: &Path) -> Result<Box<dyn RecordReader>> {
    if !path.exists() {
        return Err(DocpackError::archive(
            path.display().to_string(),
            "archive not found",
        ));
    }
    Ok(if path.is_dir() {
        Box::new(DirRecordReader::open(path)?)
    } else {
        Box::new(ZipRecordReader::open(path)?)
    })
}

// ============ Codec ============

fn put_json<T: Serialize + ?Sized>(
    writer: &mut dyn RecordWriter,
    name: &str,
    value: &T,
) -> Result<()> {
    let bytes = serde_json::to_vec_pretty(value).map_err(|e| DocpackError::archive(name, e))?;
    writer.put(name, &bytes)
}

fn read_json<T: DeserializeOwned>(reader: &mut dyn RecordReader, name: &str) -> Result<T> {
    let bytes = reader.read(name)?;
    serde_json::from_slice(&bytes).map_err(|e| DocpackError::archive(name, format!("malformed record: {}", e)))
}

/// Write `archive` to `dest` in the given container format.
pub fn write_archive(archive: &Archive, dest: &Path, format: ContainerFormat) -> Result<()> {
    archive.check_metrics()?;

    // validate every name before touching the filesystem
    let chunk_names = archive
        .chunks
        .iter()
        .map(|c| chunk_record_name(c.chunk_id))
        .collect::<Result<Vec<_>>>()?;
    let cluster_names = archive
        .clusters
        .iter()
        .map(|c| cluster_record_name(c.cluster_id))
        .collect::<Result<Vec<_>>>()?;

    let mut writer = open_writer(format, dest)?;
    put_json(writer.as_mut(), MANIFEST_RECORD, &archive.manifest)?;
    put_json(writer.as_mut(), INTENT_RECORD, &archive.intent)?;
    for (chunk, name) in archive.chunks.iter().zip(&chunk_names) {
        put_json(writer.as_mut(), name, chunk)?;
    }
    for (cluster, name) in archive.clusters.iter().zip(&cluster_names) {
        put_json(writer.as_mut(), name, cluster)?;
    }
    put_json(writer.as_mut(), PROJECT_SUMMARY_RECORD, &archive.project_summary)?;

    if archive.manifest.includes_raw_files {
        for (path, bytes) in &archive.raw_files {
            writer.put(&format!("{}{}", RAW_PREFIX, path), bytes)?;
        }
    }

    writer.commit()
}

fn records_under(names: &[String], prefix: &str) -> Vec<String> {
    names
        .iter()
        .filter(|n| n.starts_with(prefix) && n.ends_with(".json"))
        .cloned()
        .collect()
}

/// Read an archive written by [`write_archive`].
pub fn read_archive(path: &Path) -> Result<Archive> {
    let mut reader = open_reader(path)?;
    let reader = reader.as_mut();
    let names = reader.names();

    let manifest: Manifest = read_json(reader, MANIFEST_RECORD)?;
    let intent: IntentSpec = read_json(reader, INTENT_RECORD)?;
    let project_summary: Map<String, Value> = read_json(reader, PROJECT_SUMMARY_RECORD)?;

    let mut chunks: Vec<Chunk> = Vec::new();
    for name in records_under(&names, CHUNKS_PREFIX) {
        chunks.push(read_json(reader, &name)?);
    }
    let mut clusters: Vec<Cluster> = Vec::new();
    for name in records_under(&names, CLUSTERS_PREFIX) {
        clusters.push(read_json(reader, &name)?);
    }

    let mut raw_files = BTreeMap::new();
    if manifest.includes_raw_files {
        for name in names.iter().filter(|n| n.starts_with(RAW_PREFIX)) {
            let bytes = reader.read(name)?;
            raw_files.insert(name[RAW_PREFIX.len()..].to_string(), bytes);
        }
    }

    let declared = manifest.metrics;
    if declared.chunk_count != chunks.len() {
        return Err(DocpackError::archive(
            MANIFEST_RECORD,
            format!(
                "declares {} chunks but {} chunk records were found",
                declared.chunk_count,
                chunks.len()
            ),
        ));
    }
    if declared.cluster_count != clusters.len() {
        return Err(DocpackError::archive(
            MANIFEST_RECORD,
            format!(
                "declares {} clusters but {} cluster records were found",
                declared.cluster_count,
                clusters.len()
            ),
        ));
    }

    let archive = Archive {
        manifest,
        intent,
        chunks,
        clusters,
        project_summary,
        raw_files,
    };
    archive
        .check_metrics()
        .map_err(|e| DocpackError::archive(MANIFEST_RECORD, e))?;
    for cluster in &archive.clusters {
        for id in &cluster.chunk_ids {
            if archive.chunk(*id).is_none() {
                return Err(DocpackError::Invariant(format!(
                    "cluster {} references missing chunk {}",
                    cluster.cluster_id, id
                )));
            }
        }
    }
    Ok(archive)
}
