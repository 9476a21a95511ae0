//! Build progress reporting.
//!
//! Reports what `docpack build` is doing (stage transitions, embedding and
//! summarizing counts, skipped files) so users can follow a long run.
//! Progress is emitted on **stderr** so stdout remains parseable for scripts.

use std::io::Write;
use std::str::FromStr;

/// Pipeline stages, in execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Stage {
    Ingesting,
    Chunking,
    Embedding,
    Clustering,
    Summarizing,
    Merging,
    Writing,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingesting => "ingesting",
            Stage::Chunking => "chunking",
            Stage::Embedding => "embedding",
            Stage::Clustering => "clustering",
            Stage::Summarizing => "summarizing",
            Stage::Merging => "merging",
            Stage::Writing => "writing",
        }
    }
}

/// A single progress event.
#[derive(Clone, Debug)]
pub enum ProgressEvent {
    /// A stage started. `detail` is a short human description.
    Started { stage: Stage, detail: String },
    /// n units of a counted stage are done out of total.
    Advanced { stage: Stage, n: u64, total: u64 },
    /// A file produced no chunks or was filtered out.
    Skipped { path: String, reason: String },
}

/// Reports build progress. Implementations write to stderr (human or JSON).
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: ProgressEvent);
}

fn unit_for(stage: Stage) -> &'static str {
    match stage {
        Stage::Ingesting | Stage::Writing => "files",
        Stage::Chunking | Stage::Embedding => "chunks",
        Stage::Clustering | Stage::Summarizing | Stage::Merging => "clusters",
    }
}

/// Human-friendly progress on stderr: "build  embedding  120 / 480 chunks".
pub struct StderrProgress;

impl ProgressReporter for StderrProgress {
    fn report(&self, event: ProgressEvent) {
        let line = match &event {
            ProgressEvent::Started { stage, detail } => {
                format!("build  {}  {}\n", stage.as_str(), detail)
            }
            ProgressEvent::Advanced { stage, n, total } => format!(
                "build  {}  {} / {} {}\n",
                stage.as_str(),
                format_number(*n),
                format_number(*total),
                unit_for(*stage)
            ),
            ProgressEvent::Skipped { path, reason } => {
                format!("build  skip  {} ({})\n", path, reason)
            }
        };
        let _ = std::io::stderr().lock().write_all(line.as_bytes());
        let _ = std::io::stderr().lock().flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl ProgressReporter for JsonProgress {
    fn report(&self, event: ProgressEvent) {
        let obj = event_json(&event);
        if let Ok(line) = serde_json::to_string(&obj) {
            let _ = writeln!(std::io::stderr().lock(), "{}", line);
            let _ = std::io::stderr().lock().flush();
        }
    }
}

fn event_json(event: &ProgressEvent) -> serde_json::Value {
    match event {
        ProgressEvent::Started { stage, detail } => serde_json::json!({
            "event": "stage",
            "stage": stage.as_str(),
            "detail": detail
        }),
        ProgressEvent::Advanced { stage, n, total } => serde_json::json!({
            "event": "progress",
            "stage": stage.as_str(),
            "n": n,
            "total": total
        }),
        ProgressEvent::Skipped { path, reason } => serde_json::json!({
            "event": "skip",
            "path": path,
            "reason": reason
        }),
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: ProgressEvent) {}
}

pub(crate) fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    let chars: Vec<char> = s.chars().rev().collect();
    for (i, c) in chars.iter().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(*c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> Box<dyn ProgressReporter> {
        match self {
            ProgressMode::Off => Box::new(NoProgress),
            ProgressMode::Human => Box::new(StderrProgress),
            ProgressMode::Json => Box::new(JsonProgress),
        }
    }
}

impl FromStr for ProgressMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "off" | "none" => Ok(ProgressMode::Off),
            "human" => Ok(ProgressMode::Human),
            "json" => Ok(ProgressMode::Json),
            other => anyhow::bail!(
                "Unknown progress mode: '{}'. Must be off, human, or json.",
                other
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn progress_mode_parse() {
        assert_eq!("json".parse::<ProgressMode>().unwrap(), ProgressMode::Json);
        assert_eq!("off".parse::<ProgressMode>().unwrap(), ProgressMode::Off);
        assert!("loud".parse::<ProgressMode>().is_err());
    }

    #[test]
    fn json_event_shape() {
        let obj = event_json(&ProgressEvent::Advanced {
            stage: Stage::Embedding,
            n: 16,
            total: 48,
        });
        assert_eq!(obj["event"], "progress");
        assert_eq!(obj["stage"], "embedding");
        assert_eq!(obj["total"], 48);

        let obj = event_json(&ProgressEvent::Skipped {
            path: "logo.png".to_string(),
            reason: "not UTF-8 text".to_string(),
        });
        assert_eq!(obj["event"], "skip");
        assert_eq!(obj["path"], "logo.png");
    }
}
