//! Optional on-disk buffer snapshot for crash/restart survival.
//!
//! Written as JSON to a temporary file and renamed over the target so a crash
//! mid-write never leaves a truncated snapshot behind.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{PipelineError, Result};
use crate::sample::Sample;

/// Buffer contents at shutdown.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BufferSnapshot {
    /// Sequence id to resume numbering from.
    pub next_sequence: u64,
    pub samples: Vec<Sample>,
}

impl BufferSnapshot {
    /// First sequence id safe to hand out after restoring this snapshot.
    pub fn resume_sequence(&self) -> u64 {
        let after_samples = self
            .samples
            .iter()
            .map(Sample::sequence_id)
            .max()
            .map_or(1, |max| max + 1);
        self.next_sequence.max(after_samples)
    }
}

fn temp_path(path: &Path) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

/// Write a snapshot atomically.
pub fn save(path: &Path, snapshot: &BufferSnapshot) -> Result<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }

    let tmp = temp_path(path);
    let data = serde_json::to_vec(snapshot)?;
    std::fs::write(&tmp, data)?;
    std::fs::rename(&tmp, path)?;

    debug!(
        path = %path.display(),
        samples = snapshot.samples.len(),
        "Buffer snapshot written"
    );
    Ok(())
}

/// Read a snapshot. A missing file is not an error.
pub fn load(path: &Path) -> Result<Option<BufferSnapshot>> {
    let data = match std::fs::read(path) {
        Ok(data) => data,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e.into()),
    };

    let snapshot = serde_json::from_slice(&data).map_err(|e| {
        PipelineError::Persistence(format!("corrupt snapshot {}: {}", path.display(), e))
    })?;

    Ok(Some(snapshot))
}

/// Read and delete a snapshot.
///
/// Restored samples live only in memory afterwards, so a second crash cannot
/// replay them without the redelivery mark.
pub fn take(path: &Path) -> Result<Option<BufferSnapshot>> {
    let snapshot = load(path)?;
    if snapshot.is_some() {
        std::fs::remove_file(path)?;
        info!(path = %path.display(), "Buffer snapshot consumed");
    }
    Ok(snapshot)
}
