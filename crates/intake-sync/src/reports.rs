//! Per-run report directory: `reports/<run_id>/` with the run result, a
//! markdown brief and Parquet snapshots listed in a sha256 manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, RecordBatch, StringArray, UInt64Array, UInt8Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::fs;

use crate::pipeline::{QueuedItem, RunResult, SourceRunStats};

pub const RUN_RESULT_FILE: &str = "run_result.json";
pub const BRIEF_FILE: &str = "brief.md";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub async fn write_run_report(reports_root: &Path, result: &RunResult) -> Result<PathBuf> {
    let run_dir = reports_root.join(result.run_id.to_string());
    let snapshot_dir = run_dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let json = serde_json::to_vec_pretty(result).context("serializing run result")?;
    fs::write(run_dir.join(RUN_RESULT_FILE), json)
        .await
        .with_context(|| format!("writing {RUN_RESULT_FILE}"))?;
    fs::write(run_dir.join(BRIEF_FILE), run_brief(result))
        .await
        .with_context(|| format!("writing {BRIEF_FILE}"))?;

    // Parquet encoding and hashing are blocking work.
    let manifest = {
        let run_dir = run_dir.clone();
        let snapshot_dir = snapshot_dir.clone();
        let queued = result.queued.clone();
        let sources = result.sources.clone();
        tokio::task::spawn_blocking(move || write_snapshots(&run_dir, &snapshot_dir, &queued, &sources))
            .await
            .context("parquet snapshot task failed")??
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    fs::write(&manifest_path, bytes)
        .await
        .with_context(|| format!("writing {}", manifest_path.display()))?;

    Ok(run_dir)
}

pub fn run_brief(result: &RunResult) -> String {
    let mut lines = vec![
        "# Content Intake Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", result.run_id),
        format!("- Started: {}", result.started_at),
        format!("- Finished: {} ({} ms)", result.finished_at, result.duration_ms),
        format!(
            "- Fetched {}, unique {}, stored {}, rejected {}, deferred {}",
            result.fetched, result.unique, result.stored, result.rejected, result.deferred
        ),
        String::new(),
        "## Sources".to_string(),
    ];
    for s in &result.sources {
        lines.push(format!(
            "- {}: fetched {}, stored {}, duplicates {}, below threshold {}, deferred {}",
            s.source_id, s.fetched, s.stored, s.duplicates, s.below_threshold, s.deferred
        ));
    }
    if !result.queued.is_empty() {
        lines.push(String::new());
        lines.push("## Queued for review".to_string());
        let mut queued = result.queued.iter().collect::<Vec<_>>();
        queued.sort_by(|a, b| b.score.cmp(&a.score).then_with(|| a.url_key.cmp(&b.url_key)));
        for item in queued {
            lines.push(format!("- [{}] {} ({}, {})", item.score, item.title, item.kind, item.category));
        }
    }
    if !result.errors.is_empty() {
        lines.push(String::new());
        lines.push("## Errors".to_string());
        lines.extend(result.errors.iter().map(|e| format!("- {e}")));
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Summary of the most recent `runs` report directories, newest first.
pub fn report_markdown(reports_root: &Path, runs: usize) -> Result<String> {
    let mut dirs = std::fs::read_dir(reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .filter_map(|entry| {
            let path = entry.path().join(RUN_RESULT_FILE);
            let text = std::fs::read_to_string(&path).ok()?;
            serde_json::from_str::<RunResult>(&text).ok().map(|r| (entry.path(), r))
        })
        .collect::<Vec<_>>();
    dirs.sort_by(|(_, a), (_, b)| b.started_at.cmp(&a.started_at));

    let mut lines = vec!["# Content Intake Report".to_string(), String::new()];
    if dirs.is_empty() {
        lines.push("No runs recorded yet.".to_string());
    }
    for (dir, result) in dirs.into_iter().take(runs.max(1)) {
        lines.push(format!("## Run `{}` ({})", result.run_id, result.started_at));
        lines.push(format!(
            "- fetched {}, stored {}, rejected {}, deferred {}",
            result.fetched, result.stored, result.rejected, result.deferred
        ));
        if !result.errors.is_empty() {
            lines.push(format!("- errors: {}", result.errors.len()));
        }
        let manifest = dir.join("snapshots").join("manifest.json");
        if manifest.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest.display()));
        }
        lines.push(format!("- brief: `{}`", dir.join(BRIEF_FILE).display()));
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_snapshots(
    run_dir: &Path,
    snapshot_dir: &Path,
    queued: &[QueuedItem],
    sources: &[SourceRunStats],
) -> Result<ParquetManifest> {
    let queued_path = snapshot_dir.join("queued_items.parquet");
    let stats_path = snapshot_dir.join("source_stats.parquet");
    write_queued_parquet(&queued_path, queued)?;
    write_source_stats_parquet(&stats_path, sources)?;
    Ok(ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("queued_items", run_dir, &queued_path)?,
            manifest_entry("source_stats", run_dir, &stats_path)?,
        ],
    })
}

fn write_queued_parquet(path: &Path, queued: &[QueuedItem]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("id", DataType::Utf8, true),
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("kind", DataType::Utf8, false),
        ArrowField::new("title", DataType::Utf8, false),
        ArrowField::new("url_key", DataType::Utf8, false),
        ArrowField::new("score", DataType::UInt8, false),
        ArrowField::new("category", DataType::Utf8, false),
        ArrowField::new("confidence", DataType::Float64, false),
        ArrowField::new("degraded", DataType::Boolean, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(queued.iter().map(|q| q.id.as_deref()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(queued.iter().map(|q| q.source_id.as_str()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(queued.iter().map(|q| q.kind.as_str()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(queued.iter().map(|q| q.title.as_str()).collect::<Vec<_>>())),
            Arc::new(StringArray::from(queued.iter().map(|q| q.url_key.as_str()).collect::<Vec<_>>())),
            Arc::new(UInt8Array::from(queued.iter().map(|q| q.score).collect::<Vec<_>>())),
            Arc::new(StringArray::from(queued.iter().map(|q| q.category.as_str()).collect::<Vec<_>>())),
            Arc::new(Float64Array::from(queued.iter().map(|q| q.confidence).collect::<Vec<_>>())),
            Arc::new(BooleanArray::from(queued.iter().map(|q| q.degraded).collect::<Vec<_>>())),
        ],
    )
    .context("building queued_items record batch")?;
    write_parquet(path, batch)
}

fn write_source_stats_parquet(path: &Path, sources: &[SourceRunStats]) -> Result<()> {
    let count = |f: fn(&SourceRunStats) -> usize| {
        UInt64Array::from(sources.iter().map(|s| f(s) as u64).collect::<Vec<_>>())
    };
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("fetched", DataType::UInt64, false),
        ArrowField::new("stored", DataType::UInt64, false),
        ArrowField::new("rejected", DataType::UInt64, false),
        ArrowField::new("deferred", DataType::UInt64, false),
        ArrowField::new("errors", DataType::UInt64, false),
        ArrowField::new("duration_ms", DataType::UInt64, false),
    ]));
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(StringArray::from(sources.iter().map(|s| s.source_id.as_str()).collect::<Vec<_>>())),
            Arc::new(count(|s| s.fetched)),
            Arc::new(count(|s| s.stored)),
            Arc::new(count(SourceRunStats::rejected)),
            Arc::new(count(|s| s.deferred)),
            Arc::new(count(|s| s.errors.len())),
            Arc::new(UInt64Array::from(sources.iter().map(|s| s.duration_ms).collect::<Vec<_>>())),
        ],
    )
    .context("building source_stats record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, run_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: path.strip_prefix(run_dir).unwrap_or(path).display().to_string(),
        sha256: hex::encode(hasher.finalize()),
        bytes: bytes.len() as u64,
    })
}
