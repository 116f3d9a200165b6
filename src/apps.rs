//! Application artifacts bundled with a target.
//!
//! Apps are referenced from a target's custom metadata by content locator.
//! The blob store keeps every manifest and layer under its digest:
//!
//! ```text
//! <apps_root>/
//!   blobs/sha256/<hash>   # Manifests and layers, verified on arrival
//!   current.json          # Apps of the active target
//! ```
//!
//! Running the apps is outside this crate; "active" only records which app
//! set the device is meant to run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::model::{AppRef, Target};
use crate::registry::{self, ContentUri, FetchError, HashedDigest, RegistryClient, UriError};

const BLOBS_DIR: &str = "blobs/sha256";
const CURRENT_FILE: &str = "current.json";

#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("invalid app locator: {0}")]
    Uri(#[from] UriError),

    #[error(transparent)]
    Fetch(#[from] FetchError),

    #[error("malformed manifest of {app}: {reason}")]
    Manifest { app: String, reason: String },

    #[error("blob {digest} failed verification: {reason}")]
    Verification { digest: String, reason: String },

    #[error("app {0} is not fully fetched")]
    Missing(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, AppError>;

impl AppError {
    /// Whether an artifact arrived but did not match its digest or size.
    pub fn is_verification(&self) -> bool {
        matches!(
            self,
            Self::Verification { .. }
                | Self::Fetch(FetchError::DigestMismatch { .. } | FetchError::SizeMismatch { .. })
        )
    }
}

/// The application seam.
pub trait AppEngine {
    /// Fetch every artifact the target's apps need. Already present blobs are kept.
    fn fetch(&self, target: &Target) -> Result<()>;

    /// Make the target's app set the active one. All artifacts must be present.
    fn activate(&self, target: &Target) -> Result<()>;

    /// Whether the target's apps are fetched and active.
    fn in_sync(&self, target: &Target) -> bool;
}

/// For devices without applications.
pub struct NoApps;

impl AppEngine for NoApps {
    fn fetch(&self, _target: &Target) -> Result<()> {
        Ok(())
    }

    fn activate(&self, _target: &Target) -> Result<()> {
        Ok(())
    }

    fn in_sync(&self, _target: &Target) -> bool {
        true
    }
}

/// Where missing blobs come from.
pub enum BlobSource {
    Registry(RegistryClient),
    /// Another blob store, e.g. on an update medium.
    Local(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ActiveApp {
    name: String,
    uri: String,
}

/// Content-addressed app store.
pub struct BlobStoreApps {
    root: PathBuf,
    source: BlobSource,
}

impl BlobStoreApps {
    pub fn new(root: impl Into<PathBuf>, source: BlobSource) -> Self {
        Self {
            root: root.into(),
            source,
        }
    }

    fn blob_path(&self, digest: &HashedDigest) -> PathBuf {
        self.root.join(BLOBS_DIR).join(digest.hash())
    }

    /// Layer digests and sizes listed in a stored manifest.
    fn layers(&self, app: &AppRef, uri: &ContentUri) -> Result<Vec<(HashedDigest, u64)>> {
        let manifest: serde_json::Value = serde_json::from_slice(&fs::read(self.blob_path(&uri.digest))?)?;
        let Some(layers) = manifest.get("layers").and_then(serde_json::Value::as_array) else {
            return Err(AppError::Manifest {
                app: app.name.clone(),
                reason: "no `layers` list".to_string(),
            });
        };
        layers
            .iter()
            .map(|layer| {
                let digest = layer.get("digest").and_then(serde_json::Value::as_str);
                let size = layer.get("size").and_then(serde_json::Value::as_u64);
                match (digest, size) {
                    (Some(digest), Some(size)) => Ok((HashedDigest::parse(digest)?, size)),
                    _ => Err(AppError::Manifest {
                        app: app.name.clone(),
                        reason: "layer without digest or size".to_string(),
                    }),
                }
            })
            .collect()
    }

    fn fetch_app(&self, app: &AppRef) -> Result<()> {
        let uri = ContentUri::parse(&app.uri)?;
        let manifest_path = self.blob_path(&uri.digest);
        if !manifest_path.exists() {
            tracing::info!(app = %app.name, digest = %uri.digest.short_hash(), "fetching app manifest");
            let body = match &self.source {
                BlobSource::Registry(client) => client.fetch_manifest(&uri, registry::MANIFEST_FORMAT)?,
                BlobSource::Local(dir) => read_verified(&local_blob(dir, &uri.digest), &uri.digest, None)?,
            };
            write_atomic(&manifest_path, &body)?;
        }

        for (digest, size) in self.layers(app, &uri)? {
            let dest = self.blob_path(&digest);
            if dest.exists() {
                continue;
            }
            tracing::info!(app = %app.name, digest = %digest.short_hash(), size, "fetching app layer");
            let partial = dest.with_extension("part");
            match &self.source {
                BlobSource::Registry(client) => {
                    let layer = uri.with_digest(digest.clone());
                    client.download_blob(&layer, &partial, size, &mut |received, expected| {
                        tracing::trace!(received, expected, "layer download progress");
                    })?;
                }
                BlobSource::Local(dir) => {
                    let body = read_verified(&local_blob(dir, &digest), &digest, Some(size))?;
                    fs::write(&partial, body)?;
                }
            }
            fs::rename(&partial, &dest)?;
        }
        Ok(())
    }

    fn is_fetched(&self, app: &AppRef) -> bool {
        let Ok(uri) = ContentUri::parse(&app.uri) else {
            return false;
        };
        if !self.blob_path(&uri.digest).exists() {
            return false;
        }
        match self.layers(app, &uri) {
            Ok(layers) => layers.iter().all(|(digest, _)| self.blob_path(digest).exists()),
            Err(e) => {
                tracing::debug!(app = %app.name, "cannot read stored manifest: {e}");
                false
            }
        }
    }

    fn active(&self) -> Option<Vec<ActiveApp>> {
        let body = fs::read(self.root.join(CURRENT_FILE)).ok()?;
        serde_json::from_slice(&body).ok()
    }
}

impl AppEngine for BlobStoreApps {
    fn fetch(&self, target: &Target) -> Result<()> {
        fs::create_dir_all(self.root.join(BLOBS_DIR))?;
        for app in target.apps() {
            self.fetch_app(&app)?;
        }
        Ok(())
    }

    fn activate(&self, target: &Target) -> Result<()> {
        let apps = target.apps();
        if let Some(missing) = apps.iter().find(|app| !self.is_fetched(app)) {
            return Err(AppError::Missing(missing.name.clone()));
        }
        let active: Vec<ActiveApp> = apps
            .into_iter()
            .map(|app| ActiveApp {
                name: app.name,
                uri: app.uri,
            })
            .collect();
        write_atomic(&self.root.join(CURRENT_FILE), &serde_json::to_vec_pretty(&active)?)?;
        tracing::info!(name = %target.name, count = active.len(), "activated apps");
        Ok(())
    }

    fn in_sync(&self, target: &Target) -> bool {
        let apps = target.apps();
        let expected: Vec<ActiveApp> = apps
            .iter()
            .map(|app| ActiveApp {
                name: app.name.clone(),
                uri: app.uri.clone(),
            })
            .collect();
        let active = self.active().unwrap_or_default();
        active == expected && apps.iter().all(|app| self.is_fetched(app))
    }
}

fn local_blob(dir: &Path, digest: &HashedDigest) -> PathBuf {
    dir.join(BLOBS_DIR).join(digest.hash())
}

/// Read a blob from another store, checking it before it is used.
fn read_verified(path: &Path, digest: &HashedDigest, size: Option<u64>) -> Result<Vec<u8>> {
    let body = fs::read(path)?;
    if let Some(size) = size
        && body.len() as u64 != size
    {
        return Err(AppError::Verification {
            digest: digest.to_string(),
            reason: format!("size {} != {size}", body.len()),
        });
    }
    let actual = hex::encode(Sha256::digest(&body));
    if actual != digest.hash() {
        return Err(AppError::Verification {
            digest: digest.to_string(),
            reason: format!("hash {actual}"),
        });
    }
    Ok(body)
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("tmp");
    fs::write(&tmp, contents)?;
    fs::rename(&tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::rc::Rc;

    use serde_json::json;
    use tempfile::TempDir;

    use crate::testing::{FakeHttp, registry_routes};

    fn digest_of(data: &[u8]) -> HashedDigest {
        HashedDigest::parse(&format!("sha256:{}", hex::encode(Sha256::digest(data)))).unwrap()
    }

    /// A one-layer app: (manifest bytes, layer bytes, target).
    fn app_target(host: &str) -> (Vec<u8>, Vec<u8>, Target) {
        let layer = b"layer-bytes".to_vec();
        let manifest = serde_json::to_vec(&json!({
            "layers": [{ "digest": digest_of(&layer).to_string(), "size": layer.len() }]
        }))
        .unwrap();
        let uri = format!("{host}/factory/shellhttpd@{}", digest_of(&manifest));
        let target = Target::new(
            "t2",
            "hash2",
            2,
            json!({ "docker_compose_apps": { "shellhttpd": { "uri": uri } } }),
        );
        (manifest, layer, target)
    }

    fn seed_local(dir: &Path, blobs: &[&[u8]]) {
        fs::create_dir_all(dir.join(BLOBS_DIR)).unwrap();
        for blob in blobs {
            fs::write(local_blob(dir, &digest_of(blob)), blob).unwrap();
        }
    }

    #[test]
    fn no_apps_is_always_in_sync() {
        let target = Target::new("t", "h", 1, json!({}));
        assert!(NoApps.in_sync(&target));
        assert!(NoApps.fetch(&target).is_ok());
    }

    #[test]
    fn fetches_from_registry_and_activates() {
        let dir = TempDir::new().unwrap();
        let (manifest, layer, target) = app_target("hub.example.io");
        let http = Rc::new(FakeHttp::new());
        registry_routes(&http, "hub.example.io");
        http.respond_get("https://hub.example.io/v2/factory/shellhttpd/manifests/", 200, manifest.clone());
        http.respond_get("https://hub.example.io/v2/factory/shellhttpd/blobs/", 200, layer.clone());

        let client = RegistryClient::new(http, "https://ota.example.io/treehub", "");
        let store = BlobStoreApps::new(dir.path(), BlobSource::Registry(client));
        assert!(!store.in_sync(&target));

        store.fetch(&target).unwrap();
        assert_eq!(fs::read(dir.path().join(BLOBS_DIR).join(digest_of(&layer).hash())).unwrap(), layer);
        assert!(!store.in_sync(&target));

        store.activate(&target).unwrap();
        assert!(store.in_sync(&target));
    }

    #[test]
    fn fetches_from_local_store() {
        let source = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let (manifest, layer, target) = app_target("hub.example.io");
        seed_local(source.path(), &[&manifest, &layer]);

        let store = BlobStoreApps::new(dir.path(), BlobSource::Local(source.path().to_path_buf()));
        store.fetch(&target).unwrap();
        store.activate(&target).unwrap();
        assert!(store.in_sync(&target));
    }

    #[test]
    fn corrupted_local_layer_is_rejected() {
        let source = TempDir::new().unwrap();
        let dir = TempDir::new().unwrap();
        let (manifest, layer, target) = app_target("hub.example.io");
        seed_local(source.path(), &[&manifest]);
        fs::write(local_blob(source.path(), &digest_of(&layer)), b"layer-bytez").unwrap();

        let store = BlobStoreApps::new(dir.path(), BlobSource::Local(source.path().to_path_buf()));
        let err = store.fetch(&target).unwrap_err();
        assert!(matches!(err, AppError::Verification { .. }));
        assert!(!dir.path().join(BLOBS_DIR).join(digest_of(&layer).hash()).exists());
    }

    #[test]
    fn activation_requires_fetched_apps() {
        let dir = TempDir::new().unwrap();
        let (_, _, target) = app_target("hub.example.io");
        let store = BlobStoreApps::new(dir.path(), BlobSource::Local(dir.path().join("nowhere")));
        assert!(matches!(store.activate(&target), Err(AppError::Missing(_))));
    }

    #[test]
    fn target_without_apps_is_in_sync_once_active_set_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = BlobStoreApps::new(dir.path(), BlobSource::Local(dir.path().join("nowhere")));
        let target = Target::new("t", "h", 1, json!({}));
        assert!(store.in_sync(&target));
        store.activate(&target).unwrap();
        assert!(store.in_sync(&target));
    }
}
