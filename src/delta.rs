//! Delta capacity planning.
//!
//! A target may reference a small JSON file describing the static deltas
//! available for it (`custom["delta-stats"] = {sha256, size}`). When the delta
//! from the current rootfs is listed, its uncompressed size is checked against
//! the free space of the sysroot volume, capped by a high watermark, before a
//! single byte of the delta is pulled.

use std::fs;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::http::HttpTransport;
use crate::model::{Remote, Target};

pub const DEFAULT_WATERMARK: u32 = 90;
pub const MIN_WATERMARK: u32 = 50;
pub const MAX_WATERMARK: u32 = 95;

/// Upper bound on the delta stats file.
pub const DELTA_STATS_MAX_SIZE: u64 = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum DeltaError {
    #[error("failed to obtain filesystem statistics for {path}: {source}")]
    Stat {
        path: PathBuf,
        source: rustix::io::Errno,
    },

    #[error("filesystem at {0} reports a zero block size")]
    ZeroBlockSize(PathBuf),

    #[error("delta stats file is larger than allowed: {size} > {max}")]
    TooLarge { size: u64, max: u64 },

    #[error("failed to fetch delta stats: {0}")]
    Fetch(String),

    #[error("failed to read delta stats from {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("delta stats size mismatch: expected {expected}, got {actual}")]
    SizeMismatch { expected: u64, actual: u64 },

    #[error("delta stats hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("invalid delta stats JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, DeltaError>;

/// Size of one static delta.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeltaStat {
    pub size: u64,
    pub uncompressed_size: u64,
}

/// Pointer to the delta stats file, as published in a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeltaStatsRef {
    pub sha256: String,
    pub size: u64,
}

/// Raw block accounting of a filesystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StorageStat {
    pub block_size: u64,
    pub block_count: u64,
    pub free_block_count: u64,
}

/// The outcome of a capacity check, in bytes unless noted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateStat {
    pub storage_capacity: u64,
    /// Watermark percentage in effect.
    pub high_watermark: u32,
    pub max_available: u64,
    pub available: u64,
    pub delta_size: u64,
    pub fits: bool,
}

impl std::fmt::Display for UpdateStat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "required {}, available {} out of {} ({}% of the volume capacity {})",
            self.delta_size,
            self.available,
            self.max_available,
            self.high_watermark,
            self.storage_capacity
        )
    }
}

/// Clamp a configured watermark into the safe range, logging any correction.
pub fn clamp_watermark(value: u32) -> u32 {
    if value < MIN_WATERMARK {
        tracing::error!(
            value,
            min = MIN_WATERMARK,
            "storage watermark is too low; using the minimum allowed"
        );
        MIN_WATERMARK
    } else if value > MAX_WATERMARK {
        tracing::error!(
            value,
            max = MAX_WATERMARK,
            "storage watermark is too high; using the maximum allowed"
        );
        MAX_WATERMARK
    } else {
        value
    }
}

/// Sample block statistics of the filesystem holding `path`.
///
/// Unprivileged callers only count blocks available to non-reserved use;
/// root may also consume the reserved blocks.
pub fn storage_stat(path: &Path) -> Result<StorageStat> {
    let stat = rustix::fs::statvfs(path).map_err(|source| DeltaError::Stat {
        path: path.to_path_buf(),
        source,
    })?;
    let free_block_count = if rustix::process::getuid().is_root() {
        stat.f_bfree
    } else {
        stat.f_bavail
    };
    if stat.f_bsize == 0 {
        return Err(DeltaError::ZeroBlockSize(path.to_path_buf()));
    }
    Ok(StorageStat {
        block_size: stat.f_bsize,
        block_count: stat.f_blocks,
        free_block_count,
    })
}

/// Decide whether a delta fits under the watermark.
///
/// `max = floor(blocks * watermark / 100)`, `available = max(0, max - in_use)`,
/// `required = ceil(uncompressed / block_size)`; fits iff `required <= available`.
pub fn plan_update(delta: &DeltaStat, storage: &StorageStat, watermark: u32) -> UpdateStat {
    let block_size = storage.block_size.max(1);
    let max_blocks = u64::try_from(
        u128::from(storage.block_count) * u128::from(watermark) / 100,
    )
    .unwrap_or(u64::MAX);
    let blocks_in_use = storage.block_count.saturating_sub(storage.free_block_count);
    let available_blocks = max_blocks.saturating_sub(blocks_in_use);
    let required_blocks = delta.uncompressed_size.div_ceil(block_size);

    UpdateStat {
        storage_capacity: block_size.saturating_mul(storage.block_count),
        high_watermark: watermark,
        max_available: max_blocks.saturating_mul(block_size),
        available: available_blocks.saturating_mul(block_size),
        delta_size: delta.uncompressed_size,
        fits: required_blocks <= available_blocks,
    }
}

/// Sample the sysroot volume and plan the update in one step.
///
/// Space is measured here, immediately before the decision.
pub fn check_fits(delta: &DeltaStat, sysroot: &Path, watermark: u32) -> Result<UpdateStat> {
    let storage = storage_stat(sysroot)?;
    Ok(plan_update(delta, &storage, watermark))
}

/// Extract the delta stats reference from a target's custom metadata.
pub fn delta_stats_ref(target: &Target) -> Option<DeltaStatsRef> {
    let entry = target.custom.get("delta-stats")?;
    let Some(sha256) = entry.get("sha256").and_then(serde_json::Value::as_str) else {
        tracing::error!("delta-stats reference is missing a string `sha256` field");
        return None;
    };
    let Some(size) = entry.get("size").and_then(serde_json::Value::as_u64) else {
        tracing::error!("delta-stats reference is missing an integer `size` field");
        return None;
    };
    Some(DeltaStatsRef {
        sha256: sha256.to_lowercase(),
        size,
    })
}

/// Download the delta stats file from `remote` and verify its size and digest.
pub fn download_delta_stats(
    http: &dyn HttpTransport,
    stats_ref: &DeltaStatsRef,
    remote: &Remote,
) -> Result<serde_json::Value> {
    if stats_ref.size > DELTA_STATS_MAX_SIZE {
        return Err(DeltaError::TooLarge {
            size: stats_ref.size,
            max: DELTA_STATS_MAX_SIZE,
        });
    }
    let url = format!(
        "{}/delta-stats/{}",
        remote.base_url.trim_end_matches('/'),
        stats_ref.sha256
    );
    tracing::info!(%url, "fetching delta stats");
    let body = match url.strip_prefix("file://") {
        Some(path) => read_local_stats(Path::new(path), stats_ref.size)?,
        None => {
            let resp = http
                .get(&url, &remote.headers, stats_ref.size)
                .map_err(|e| DeltaError::Fetch(e.to_string()))?;
            if !resp.is_ok() {
                return Err(DeltaError::Fetch(resp.status_str()));
            }
            resp.body
        }
    };
    let actual = body.len() as u64;
    if actual != stats_ref.size {
        return Err(DeltaError::SizeMismatch {
            expected: stats_ref.size,
            actual,
        });
    }
    let digest = hex::encode(Sha256::digest(&body));
    if digest != stats_ref.sha256 {
        return Err(DeltaError::HashMismatch {
            expected: stats_ref.sha256.clone(),
            actual: digest,
        });
    }
    Ok(serde_json::from_slice(&body)?)
}

/// Read delta stats from a repo on a mounted update medium.
fn read_local_stats(path: &Path, expected: u64) -> Result<Vec<u8>> {
    let read_err = |source| DeltaError::Read {
        path: path.to_path_buf(),
        source,
    };
    let actual = fs::metadata(path).map_err(read_err)?.len();
    if actual != expected {
        return Err(DeltaError::SizeMismatch { expected, actual });
    }
    fs::read(path).map_err(read_err)
}

/// Look up the delta `from -> to` in a delta stats document.
///
/// The document maps each target hash to the hashes it has deltas from:
/// `{"<to>": {"<from>": {"size": N, "u_size": M}}}`.
pub fn find_delta_stat(stats: &serde_json::Value, from: &str, to: &str) -> Option<DeltaStat> {
    let Some(to_entry) = stats.get(to) else {
        tracing::error!(to, "delta stats have no entry for the target hash");
        return None;
    };
    let found = to_entry.get(from)?;
    let Some(size) = found.get("size").and_then(serde_json::Value::as_u64) else {
        tracing::error!(%found, "delta stat has no integer `size` field");
        return None;
    };
    let Some(uncompressed_size) = found.get("u_size").and_then(serde_json::Value::as_u64) else {
        tracing::error!(%found, "delta stat has no integer `u_size` field");
        return None;
    };
    Some(DeltaStat {
        size,
        uncompressed_size,
    })
}

/// Best-effort lookup of the delta stat for `current_hash -> target`.
///
/// Any failure is logged and treated as "no delta information".
pub fn fetch_delta_stat(
    http: &dyn HttpTransport,
    target: &Target,
    remote: &Remote,
    current_hash: &str,
) -> Option<DeltaStat> {
    let Some(stats_ref) = delta_stats_ref(target) else {
        tracing::info!("no reference to static delta stats found in target");
        return None;
    };
    let stats = match download_delta_stats(http, &stats_ref, remote) {
        Ok(stats) => stats,
        Err(e) => {
            tracing::error!("failed to get static delta stats: {e}");
            return None;
        }
    };
    let found = find_delta_stat(&stats, current_hash, &target.hash);
    if found.is_none() {
        tracing::error!(
            from = current_hash,
            to = %target.hash,
            "no delta stat found for the update"
        );
    }
    found
}
