use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

/// Where a raw payload landed in the archive.
#[derive(Debug, Clone, PartialEq)]
pub struct ArchivedPayload {
    pub sha256: String,
    /// Relative to the archive root.
    pub path: PathBuf,
    pub bytes: usize,
    /// The same bytes were already archived for this source and day.
    pub already_present: bool,
}

/// Write-once archive of raw source payloads, laid out as
/// `<source_id>/<YYYY-MM-DD>/<sha256>.<ext>`.
#[derive(Debug, Clone)]
pub struct ArtifactStore {
    root: PathBuf,
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn payload_path(&self, fetched_at: DateTime<Utc>, source_id: &str, sha256: &str, extension: &str) -> PathBuf {
        let ext = match extension.trim().trim_start_matches('.') {
            "" => "bin",
            ext => ext,
        };
        PathBuf::from(source_id)
            .join(fetched_at.format("%Y-%m-%d").to_string())
            .join(format!("{sha256}.{ext}"))
    }

    /// Archives `bytes` unless an identical payload is already there. The file
    /// appears under its final name only once fully written.
    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let sha256 = sha256_hex(bytes);
        let path = self.payload_path(fetched_at, source_id, &sha256, extension);
        let target = self.root.join(&path);
        let dir = target
            .parent()
            .with_context(|| format!("archive path {} has no parent", target.display()))?;
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;

        let archived = |already_present| ArchivedPayload {
            sha256: sha256.clone(),
            path: path.clone(),
            bytes: bytes.len(),
            already_present,
        };
        if fs::try_exists(&target).await.unwrap_or(false) {
            return Ok(archived(true));
        }

        let partial = dir.join(format!(".{}.partial", Uuid::new_v4()));
        fs::write(&partial, bytes)
            .await
            .with_context(|| format!("writing {}", partial.display()))?;
        if let Err(err) = fs::rename(&partial, &target).await {
            let _ = fs::remove_file(&partial).await;
            return Err(err).with_context(|| format!("moving payload into {}", target.display()));
        }
        Ok(archived(false))
    }
}
