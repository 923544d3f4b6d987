//! Per-iteration artifacts under `<state_dir>/attempts/<job_id>/<iter>/`.
//!
//! Product record of what the agent saw and decided; always written when
//! enabled, independent of `RUST_LOG`.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct AttemptMeta {
    pub job_id: i64,
    pub iter: u32,
    pub worker: String,
    pub url: String,
    pub generation: u64,
    pub elements: usize,
    /// `act`, `finish`, `malformed` or `stalled`.
    pub decision: String,
    pub tool: Option<String>,
    pub tool_input: Option<String>,
    pub observation: Option<String>,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone)]
pub struct AttemptPaths {
    pub dir: PathBuf,
    pub meta_path: PathBuf,
    pub prompt_path: PathBuf,
    pub response_path: PathBuf,
}

impl AttemptPaths {
    pub fn new(attempts_dir: &Path, job_id: i64, iter: u32) -> Self {
        let dir = attempts_dir.join(job_id.to_string()).join(iter.to_string());
        Self {
            meta_path: dir.join("meta.json"),
            prompt_path: dir.join("prompt.md"),
            response_path: dir.join("response.txt"),
            dir,
        }
    }
}

pub struct AttemptWriteRequest<'a> {
    pub attempts_dir: &'a Path,
    pub meta: &'a AttemptMeta,
    pub prompt: &'a str,
    pub response: &'a str,
}

pub fn write_attempt(request: &AttemptWriteRequest<'_>) -> Result<AttemptPaths> {
    let paths = AttemptPaths::new(request.attempts_dir, request.meta.job_id, request.meta.iter);
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create attempt dir {}", paths.dir.display()))?;

    // Write in deterministic order to keep logs stable.
    write_json(&paths.meta_path, request.meta)?;
    write_text(&paths.prompt_path, request.prompt)?;
    write_text(&paths.response_path, request.response)?;

    Ok(paths)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}

fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value)?;
    buf.push('\n');
    write_text(path, &buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn meta() -> AttemptMeta {
        let now = Utc::now();
        AttemptMeta {
            job_id: 4,
            iter: 2,
            worker: "worker-0".to_string(),
            url: "https://ex.com/job/1".to_string(),
            generation: 9,
            elements: 12,
            decision: "act".to_string(),
            tool: Some("Click_Element".to_string()),
            tool_input: Some("3".to_string()),
            observation: Some("Clicked element 3.".to_string()),
            started_at: now,
            ended_at: now,
            duration_ms: 0,
        }
    }

    #[test]
    fn attempt_paths_are_stable() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = AttemptPaths::new(temp.path(), 4, 2);
        assert!(paths.dir.ends_with(Path::new("4/2")));
        assert!(paths.meta_path.ends_with("meta.json"));
        assert!(paths.prompt_path.ends_with("prompt.md"));
        assert!(paths.response_path.ends_with("response.txt"));
    }

    #[test]
    fn writes_all_artifacts() {
        let temp = tempfile::tempdir().expect("tempdir");
        let meta = meta();
        let paths = write_attempt(&AttemptWriteRequest {
            attempts_dir: temp.path(),
            meta: &meta,
            prompt: "prompt body",
            response: "Thought: x",
        })
        .expect("write");

        let json: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(&paths.meta_path).expect("read meta"))
                .expect("parse meta");
        assert_eq!(json["tool"], "Click_Element");
        assert_eq!(fs::read_to_string(&paths.prompt_path).expect("read"), "prompt body");
        assert_eq!(fs::read_to_string(&paths.response_path).expect("read"), "Thought: x");
    }
}
