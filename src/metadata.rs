//! Targets metadata: what the device may run.
//!
//! The provider hands out raw target records; filtering and ordering are the
//! client's business. No signature checking happens here.
//!
//! The document is a targets map keyed by target name, optionally wrapped in
//! a `signed` envelope:
//!
//! ```text
//! { "signed": { "targets": { "<name>": {
//!     "hashes": { "sha256": "<rootfs hash>" },
//!     "custom": { "version": "2", "hardwareIds": ["..."], "tags": ["..."], ... }
//! } } } }
//! ```

use std::cell::RefCell;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use crate::http::{HttpError, HttpTransport};

/// File name of the targets document, both cached and offline.
pub const TARGETS_FILE: &str = "targets.json";

/// Upper bound on a targets document.
pub const TARGETS_MAX_SIZE: u64 = 16 * 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum MetadataError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("failed to fetch targets: {0}")]
    Status(String),

    #[error("malformed targets document: {0}")]
    Malformed(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, MetadataError>;

/// Outcome of a metadata refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefreshStatus {
    /// Fresh metadata was obtained.
    Ok,
    /// The refresh failed but a previously stored copy is usable.
    Stale,
    Failed,
}

/// A target as listed in the metadata, before version parsing.
#[derive(Debug, Clone, PartialEq)]
pub struct TargetRecord {
    pub name: String,
    pub hash: String,
    pub custom_version: String,
    pub hardware_ids: Vec<String>,
    pub custom: serde_json::Value,
}

/// The metadata seam.
pub trait MetadataProvider {
    fn refresh(&self) -> RefreshStatus;

    /// Every target of the last successfully loaded document.
    fn all_targets(&self) -> Vec<TargetRecord>;
}

/// Where a [`JsonTargetsProvider`] gets its document.
enum Source {
    Remote {
        http: Rc<dyn HttpTransport>,
        url: String,
        cache: PathBuf,
    },
    Offline {
        dir: PathBuf,
    },
}

/// Targets from a JSON document, fetched remotely or read from a directory.
pub struct JsonTargetsProvider {
    source: Source,
    targets: RefCell<Option<Vec<TargetRecord>>>,
}

impl JsonTargetsProvider {
    /// Fetch `<server>/targets.json`, caching the last good copy in `state_dir`.
    pub fn remote(http: Rc<dyn HttpTransport>, server: &str, state_dir: &Path) -> Self {
        Self {
            source: Source::Remote {
                http,
                url: format!("{}/{TARGETS_FILE}", server.trim_end_matches('/')),
                cache: state_dir.join(TARGETS_FILE),
            },
            targets: RefCell::new(None),
        }
    }

    /// Read `<dir>/targets.json`, e.g. from an update medium.
    pub fn offline(dir: impl Into<PathBuf>) -> Self {
        Self {
            source: Source::Offline { dir: dir.into() },
            targets: RefCell::new(None),
        }
    }

    fn stored_path(&self) -> PathBuf {
        match &self.source {
            Source::Remote { cache, .. } => cache.clone(),
            Source::Offline { dir } => dir.join(TARGETS_FILE),
        }
    }

    fn load_stored(&self) -> Result<Vec<TargetRecord>> {
        let body = fs::read(self.stored_path())?;
        parse_targets(&body)
    }

    fn fetch(http: &dyn HttpTransport, url: &str, cache: &Path) -> Result<Vec<TargetRecord>> {
        let resp = http.get(url, &[], TARGETS_MAX_SIZE)?;
        if !resp.is_ok() {
            return Err(MetadataError::Status(resp.status_str()));
        }
        let targets = parse_targets(&resp.body)?;
        if let Some(parent) = cache.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(cache, &resp.body)?;
        Ok(targets)
    }
}

impl MetadataProvider for JsonTargetsProvider {
    fn refresh(&self) -> RefreshStatus {
        let (loaded, status) = match &self.source {
            Source::Remote { http, url, cache } => match Self::fetch(http.as_ref(), url, cache) {
                Ok(targets) => (Ok(targets), RefreshStatus::Ok),
                Err(e) => {
                    tracing::warn!(%url, "unable to update metadata, using the local copy: {e}");
                    (self.load_stored(), RefreshStatus::Stale)
                }
            },
            Source::Offline { .. } => (self.load_stored(), RefreshStatus::Ok),
        };

        match loaded {
            Ok(targets) => {
                tracing::debug!(count = targets.len(), "loaded targets metadata");
                *self.targets.borrow_mut() = Some(targets);
                status
            }
            Err(e) => {
                tracing::error!(path = %self.stored_path().display(), "unable to use metadata: {e}");
                RefreshStatus::Failed
            }
        }
    }

    fn all_targets(&self) -> Vec<TargetRecord> {
        if let Some(targets) = self.targets.borrow().as_ref() {
            return targets.clone();
        }
        // Not refreshed in this process: fall back to whatever is stored.
        match self.load_stored() {
            Ok(targets) => {
                *self.targets.borrow_mut() = Some(targets.clone());
                targets
            }
            Err(e) => {
                tracing::debug!("no stored metadata: {e}");
                Vec::new()
            }
        }
    }
}

/// Parse a targets document into records, ordered by target name.
pub fn parse_targets(body: &[u8]) -> Result<Vec<TargetRecord>> {
    let doc: serde_json::Value = serde_json::from_slice(body)?;
    let signed = doc.get("signed").unwrap_or(&doc);
    let Some(targets) = signed.get("targets").and_then(serde_json::Value::as_object) else {
        return Err(MetadataError::Malformed("missing `targets` map".to_string()));
    };

    let mut records = Vec::with_capacity(targets.len());
    for (name, entry) in targets {
        let Some(hash) = entry
            .pointer("/hashes/sha256")
            .and_then(serde_json::Value::as_str)
        else {
            tracing::warn!(%name, "skipping target without a sha256 hash");
            continue;
        };
        let custom = entry.get("custom").cloned().unwrap_or_else(|| serde_json::json!({}));
        let custom_version = match custom.get("version") {
            Some(serde_json::Value::String(v)) => v.clone(),
            Some(serde_json::Value::Number(n)) => n.to_string(),
            _ => String::new(),
        };
        let hardware_ids = custom
            .get("hardwareIds")
            .and_then(serde_json::Value::as_array)
            .map(|ids| {
                ids.iter()
                    .filter_map(serde_json::Value::as_str)
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default();
        records.push(TargetRecord {
            name: name.clone(),
            hash: hash.to_lowercase(),
            custom_version,
            hardware_ids,
            custom,
        });
    }
    Ok(records)
}
