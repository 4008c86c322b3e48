//! Persisted migration checkpoint
//!
//! Stores the end of the last committed slice so an interrupted migration
//! can pick up where it stopped instead of replaying from the beginning.

use crate::{Error, Result};
use chrono::{DateTime, Utc};
use std::io;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::warn;

const CHECKPOINT_FILE: &str = "migrate.checkpoint";

fn checkpoint_path(dir: &Path) -> PathBuf {
    dir.join(CHECKPOINT_FILE)
}

/// Persist the committed end of the migration.
///
/// Written to a temporary file and renamed into place, so a crash leaves
/// either the old or the new value.
pub async fn persist_committed_end(dir: &Path, end: DateTime<Utc>) -> Result<()> {
    let path = checkpoint_path(dir);
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, end.timestamp_millis().to_le_bytes()).await?;
    fs::rename(&tmp, &path).await?;
    Ok(())
}

/// Load the committed end, if a checkpoint exists.
pub async fn load_committed_end(dir: &Path) -> Result<Option<DateTime<Utc>>> {
    let path = checkpoint_path(dir);
    match fs::read(&path).await {
        Ok(bytes) => {
            let Ok(raw) = <[u8; 8]>::try_from(bytes.as_slice()) else {
                warn!(path = %path.display(), "Corrupt migration checkpoint, ignoring it");
                return Ok(None);
            };
            let millis = i64::from_le_bytes(raw);
            DateTime::from_timestamp_millis(millis)
                .map(Some)
                .ok_or_else(|| {
                    Error::Serialization(format!("checkpoint timestamp {} out of range", millis))
                })
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(Error::Io(e)),
    }
}
