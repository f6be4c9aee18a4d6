use crate::workflow::ExecutionState;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::io::{BufRead, Write};
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

/// Durable record of finished runs
#[async_trait::async_trait]
pub trait ResultSink: Send + Sync {
    async fn record(&self, state: &ExecutionState) -> Result<()>;
}

/// Run log in compressed JSON Lines, one file per workflow per day.
/// Layout: `executions/YYYY/MM/DD/<workflow_id>.jsonl.gz`
pub struct JsonlResultSink {
    base_path: PathBuf,
    // serializes read-modify-write of the day files
    write_lock: Mutex<()>,
}

impl JsonlResultSink {
    pub fn new(base_path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = base_path.into();
        std::fs::create_dir_all(&base_path).context("Failed to create results directory")?;
        Ok(Self {
            base_path,
            write_lock: Mutex::new(()),
        })
    }

    fn log_path(&self, workflow_id: &str, date: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join("executions")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", file_stem(workflow_id)))
    }

    /// Every recorded run of a workflow, oldest first
    pub async fn runs_for_workflow(&self, workflow_id: &str) -> Result<Vec<ExecutionState>> {
        let filename = format!("{}.jsonl.gz", file_stem(workflow_id));
        let mut runs = Vec::new();

        for day_dir in self.day_dirs()? {
            let path = day_dir.join(&filename);
            if path.exists() {
                runs.extend(read_jsonl_gz(&path).await?);
            }
        }

        runs.retain(|run| run.workflow_id == workflow_id);
        runs.sort_by_key(|run| run.start_time);
        Ok(runs)
    }

    fn day_dirs(&self) -> Result<Vec<PathBuf>> {
        let root = self.base_path.join("executions");
        if !root.exists() {
            return Ok(Vec::new());
        }

        let mut dirs = Vec::new();
        for year in subdirs(&root)? {
            for month in subdirs(&year)? {
                dirs.extend(subdirs(&month)?);
            }
        }
        dirs.sort();
        Ok(dirs)
    }
}

#[async_trait::async_trait]
impl ResultSink for JsonlResultSink {
    async fn record(&self, state: &ExecutionState) -> Result<()> {
        let date = state.start_time.unwrap_or_else(Utc::now);
        let path = self.log_path(&state.workflow_id, &date);

        let _guard = self.write_lock.lock().await;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create results directory")?;
        }

        let mut runs = if path.exists() {
            read_jsonl_gz(&path).await?
        } else {
            Vec::new()
        };
        runs.push(state.clone());
        write_jsonl_gz(&path, &runs).await?;

        tracing::debug!(
            execution_id = %state.execution_id,
            path = %path.display(),
            "Recorded execution result"
        );
        Ok(())
    }
}

/// Keeps recorded runs in memory
#[derive(Default)]
pub struct MemoryResultSink {
    runs: Mutex<Vec<ExecutionState>>,
}

impl MemoryResultSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn runs(&self) -> Vec<ExecutionState> {
        self.runs.lock().await.clone()
    }
}

#[async_trait::async_trait]
impl ResultSink for MemoryResultSink {
    async fn record(&self, state: &ExecutionState) -> Result<()> {
        self.runs.lock().await.push(state.clone());
        Ok(())
    }
}

/// Workflow ids are user-supplied; keep them to a single safe path segment
fn file_stem(workflow_id: &str) -> String {
    let stem: String = workflow_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if stem.is_empty() {
        "_".to_string()
    } else {
        stem
    }
}

fn subdirs(path: &Path) -> Result<Vec<PathBuf>> {
    let mut dirs = Vec::new();
    for entry in std::fs::read_dir(path)
        .with_context(|| format!("Failed to read directory {}", path.display()))?
    {
        let entry = entry.context("Failed to read directory entry")?;
        if entry.path().is_dir() {
            dirs.push(entry.path());
        }
    }
    Ok(dirs)
}

async fn read_jsonl_gz(path: &Path) -> Result<Vec<ExecutionState>> {
    let compressed = tokio::fs::read(path)
        .await
        .context("Failed to open results file")?;
    let reader = std::io::BufReader::new(GzDecoder::new(compressed.as_slice()));

    let mut runs = Vec::new();
    for line in reader.lines() {
        let line = line.context("Failed to read line from results file")?;
        if line.trim().is_empty() {
            continue;
        }
        let run: ExecutionState =
            serde_json::from_str(&line).context("Failed to parse execution record")?;
        runs.push(run);
    }
    Ok(runs)
}

async fn write_jsonl_gz(path: &Path, runs: &[ExecutionState]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for run in runs {
        let json = serde_json::to_string(run).context("Failed to serialize execution record")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write execution record")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;
    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write results file")?;
    Ok(())
}
