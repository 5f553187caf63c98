use std::path::{Path, PathBuf};

use anyhow::{bail, Context};
use callrep_core::{Period, ReportEntry};
use chrono::{DateTime, Utc};
use serde_json::{json, Value as JsonValue};
use sha2::{Digest, Sha256};
use tokio::fs;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchivedRun {
    /// Relative to the archive root: `<YYYY-MM>/<run_id>.json`.
    pub path: PathBuf,
    pub sha256: String,
    pub entries: usize,
    /// The same payload was already on disk for this run.
    pub already_archived: bool,
}

/// One JSON file per scrape run, filed under the period the run was saved into.
///
/// Each file wraps the entries with the run id, the period, the archive time and the
/// SHA-256 of the compact entries array. A run is written once; archiving it again
/// with the same entries is a no-op and with different entries is an error.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn run_path(&self, period: Period, run_id: &str) -> PathBuf {
        PathBuf::from(period.month_year()).join(format!("{}.json", file_stem(run_id)))
    }

    pub async fn archive_run(
        &self,
        run_id: &str,
        period: Period,
        archived_at: DateTime<Utc>,
        entries: &[ReportEntry],
    ) -> anyhow::Result<ArchivedRun> {
        let rows = serde_json::to_value(entries).context("serializing run entries")?;
        let sha256 = entries_digest(&rows)?;
        let path = self.run_path(period, run_id);
        let absolute = self.root.join(&path);
        let archived = |already_archived| ArchivedRun {
            path: path.clone(),
            sha256: sha256.clone(),
            entries: entries.len(),
            already_archived,
        };

        if let Some(existing) = stored_digest(&absolute).await? {
            if existing == sha256 {
                return Ok(archived(true));
            }
            bail!(
                "run {run_id} is already archived at {} with different entries",
                path.display()
            );
        }

        let envelope = json!({
            "run_id": run_id,
            "year": period.year,
            "month": period.month,
            "month_year": period.month_year(),
            "archived_at": archived_at.to_rfc3339(),
            "sha256": sha256,
            "entry_count": entries.len(),
            "rows": rows,
        });
        let bytes = serde_json::to_vec_pretty(&envelope).context("serializing archive envelope")?;

        let dir = self.root.join(period.month_year());
        fs::create_dir_all(&dir)
            .await
            .with_context(|| format!("creating archive directory {}", dir.display()))?;
        let staging = dir.join(format!(".{}.partial", Uuid::new_v4()));
        fs::write(&staging, &bytes)
            .await
            .with_context(|| format!("writing {}", staging.display()))?;
        if let Err(err) = fs::rename(&staging, &absolute).await {
            let _ = fs::remove_file(&staging).await;
            return Err(err).with_context(|| format!("moving archive into {}", absolute.display()));
        }
        Ok(archived(false))
    }
}

fn entries_digest(rows: &JsonValue) -> anyhow::Result<String> {
    let compact = serde_json::to_vec(rows).context("serializing entries for digest")?;
    Ok(hex::encode(Sha256::digest(&compact)))
}

async fn stored_digest(path: &Path) -> anyhow::Result<Option<String>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("reading {}", path.display())),
    };
    let envelope: JsonValue = serde_json::from_slice(&bytes)
        .with_context(|| format!("archived run {} is not valid JSON", path.display()))?;
    match envelope.get("sha256").and_then(JsonValue::as_str) {
        Some(digest) => Ok(Some(digest.to_string())),
        None => bail!("archived run {} has no sha256", path.display()),
    }
}

/// Run ids become file names; anything outside `[A-Za-z0-9_-]` is replaced.
fn file_stem(run_id: &str) -> String {
    let stem = run_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect::<String>();
    if stem.is_empty() {
        "run".to_string()
    } else {
        stem
    }
}
