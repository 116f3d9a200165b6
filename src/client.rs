//! The device-side view of updates: what is available, what is running,
//! and how to move from one to the other.
//!
//! The client never caches deployment state. The current target is derived
//! from the tree store's booted hash on every call, and the pending target
//! comes from the install history.

use std::cell::{Cell, RefCell};
use std::path::PathBuf;
use std::rc::Rc;

use uuid::Uuid;

use crate::apps::{AppEngine, BlobSource, BlobStoreApps};
use crate::bootloader::{BootFwUpdateStatus, Bootloader};
use crate::config::Config;
use crate::http::HttpTransport;
use crate::metadata::{JsonTargetsProvider, MetadataProvider, RefreshStatus, TargetRecord};
use crate::model::{
    CheckInResult, CheckInStatus, DownloadResult, InstallResult, InstallStatus, Target,
};
use crate::rootfs::{Installer, RootfsSettings, RootfsTreeManager};
use crate::storage::{InstallMark, Storage};
use crate::tree_store::TreeStore;

/// What an install covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InstallMode {
    #[default]
    All,
    /// Deploy the rootfs now; start apps when the install is completed.
    RootfsOnly,
}

/// An update medium: metadata, a tree-store repo and an app store on disk.
#[derive(Debug, Clone)]
pub struct LocalSource {
    pub metadata_dir: PathBuf,
    pub tree_repo: PathBuf,
    pub apps_dir: PathBuf,
}

/// A secondary ECU updated alongside this device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SecondaryEcu {
    pub serial: String,
    pub hwid: String,
    pub target_name: String,
}

/// Everything the client talks to.
pub struct Collaborators {
    pub metadata: Rc<dyn MetadataProvider>,
    pub tree_store: Rc<dyn TreeStore>,
    pub bootloader: Rc<Bootloader>,
    pub http: Rc<dyn HttpTransport>,
    pub apps: Rc<dyn AppEngine>,
}

pub struct Client {
    config: Config,
    storage: Storage,
    parts: Collaborators,
    /// Set once the device configuration reached the gateway.
    config_reported: Cell<bool>,
    /// Hardware ids of secondary ECUs whose targets check-in accepts.
    secondary_hwids: RefCell<Vec<String>>,
}

impl Client {
    pub fn new(config: Config, storage: Storage, parts: Collaborators) -> Self {
        let secondary_hwids = RefCell::new(config.provision.secondary_hardware_ids.clone());
        Self {
            secondary_hwids,
            config,
            storage,
            parts,
            config_reported: Cell::new(false),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ── Check-in ──

    /// Refresh metadata from the server and list the targets for this device.
    pub fn check_in(&self) -> CheckInResult {
        self.report_config();
        self.check_in_with(self.parts.metadata.as_ref())
    }

    /// Like [`Client::check_in`], with metadata from an update medium.
    pub fn check_in_local(&self, source: &LocalSource) -> CheckInResult {
        let provider = JsonTargetsProvider::offline(&source.metadata_dir);
        self.check_in_with(&provider)
    }

    fn check_in_with(&self, provider: &dyn MetadataProvider) -> CheckInResult {
        tracing::info!("refreshing targets metadata");
        let status = match provider.refresh() {
            RefreshStatus::Ok => CheckInStatus::Ok,
            RefreshStatus::Stale => {
                tracing::warn!("unable to update metadata, using the local copy");
                CheckInStatus::OkCached
            }
            RefreshStatus::Failed => {
                tracing::error!("no usable targets metadata");
                return CheckInResult::failed();
            }
        };

        let mut targets: Vec<Target> = provider
            .all_targets()
            .into_iter()
            .filter(|record| self.is_for_device(record))
            .map(to_target)
            .collect();
        targets.sort_by_key(|t| t.version);

        CheckInResult::new(status, &self.config.provision.primary_hardware_id, targets)
    }

    fn is_for_device(&self, record: &TargetRecord) -> bool {
        let tags = &self.config.pacman.tags;
        if !tags.is_empty() {
            let target_tags = record
                .custom
                .get("tags")
                .and_then(serde_json::Value::as_array)
                .map(Vec::as_slice)
                .unwrap_or_default();
            let tagged = target_tags
                .iter()
                .filter_map(serde_json::Value::as_str)
                .any(|t| tags.iter().any(|wanted| wanted == t));
            if !tagged {
                return false;
            }
        }
        let primary = &self.config.provision.primary_hardware_id;
        let secondaries = self.secondary_hwids.borrow();
        record
            .hardware_ids
            .iter()
            .any(|id| id == primary || secondaries.contains(id))
    }

    /// Register the secondary ECUs with the gateway.
    ///
    /// Once the gateway accepts the list, check-in offers targets for the
    /// listed hardware ids in place of the configured ones.
    pub fn set_secondaries(&self, ecus: &[SecondaryEcu]) -> InstallResult {
        let body: serde_json::Map<String, serde_json::Value> = ecus
            .iter()
            .map(|ecu| (ecu.serial.clone(), serde_json::json!({ "target": ecu.target_name })))
            .collect();
        let body = serde_json::Value::Object(body).to_string();
        let url = format!("{}/ecus", self.config.server.url);
        match self.parts.http.put(&url, &[], body.as_bytes()) {
            Ok(resp) if resp.is_ok() => {}
            Ok(resp) => return InstallResult::failed(resp.status_str()),
            Err(e) => return InstallResult::failed(e.to_string()),
        }
        tracing::info!(count = ecus.len(), "registered secondary ECUs");
        *self.secondary_hwids.borrow_mut() = ecus.iter().map(|ecu| ecu.hwid.clone()).collect();
        InstallResult::ok("")
    }

    /// Upload the device configuration once per process.
    fn report_config(&self) {
        if self.config_reported.get() || self.config.server.url.is_empty() {
            return;
        }
        let body = match self.config.to_toml() {
            Ok(body) => body,
            Err(e) => {
                tracing::warn!("failed to render configuration for reporting: {e}");
                return;
            }
        };
        let url = format!("{}/system_info/config", self.config.server.url);
        let headers = [("Content-Type".to_string(), "application/toml".to_string())];
        match self.parts.http.post(&url, &headers, body.as_bytes()) {
            Ok(resp) if resp.is_ok() => self.config_reported.set(true),
            Ok(resp) => tracing::warn!(%url, "failed to report configuration: {}", resp.status_str()),
            Err(e) => tracing::warn!(%url, "failed to report configuration: {e}"),
        }
    }

    // ── Deployment state ──

    /// The target the device is booted on.
    pub fn current(&self) -> Target {
        let hash = match self.parts.tree_store.current_hash() {
            Ok(hash) => hash,
            Err(e) => {
                tracing::error!("failed to get the booted deployment: {e}");
                return Target::unknown();
            }
        };
        match self.storage.find_by_hash(&hash) {
            Ok(Some(target)) => return target,
            Ok(None) => {}
            Err(e) => tracing::warn!("failed to read install history: {e}"),
        }
        if let Some(record) = self
            .parts
            .metadata
            .all_targets()
            .into_iter()
            .find(|r| r.hash == hash)
        {
            return to_target(record);
        }
        Target::initial(&hash, &self.config.provision.primary_hardware_id)
    }

    /// Record the booted rootfs if the history knows nothing about it,
    /// e.g. on the first start after flashing a factory image.
    pub fn set_initial_target_if_needed(&self) {
        let current = self.current();
        if current.is_unknown() {
            return;
        }
        match self.storage.find_by_hash(&current.hash) {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::info!(name = %current.name, "recording the booted rootfs as current");
                self.record(&current, InstallMark::Current);
            }
            Err(e) => tracing::warn!("failed to read install history: {e}"),
        }
    }

    /// The target waiting for a reboot or app start to be confirmed.
    pub fn pending(&self) -> Option<Target> {
        self.storage.pending().unwrap_or_else(|e| {
            tracing::error!("failed to read install history: {e}");
            None
        })
    }

    pub fn is_installation_in_progress(&self) -> bool {
        self.pending().is_some()
    }

    /// The last target that was installed successfully and differs from the
    /// booted one, or the unknown target.
    pub fn rollback_target(&self) -> Target {
        let current = self.current();
        match self.storage.rollback_target(&current.hash) {
            Ok(Some(target)) => target,
            Ok(None) => Target::unknown(),
            Err(e) => {
                tracing::error!("failed to read install history: {e}");
                Target::unknown()
            }
        }
    }

    /// Whether `target` failed to boot or to start its apps before.
    pub fn is_known_failure(&self, target: &Target) -> bool {
        self.storage.is_failed(target).unwrap_or_else(|e| {
            tracing::warn!("failed to read install history: {e}");
            false
        })
    }

    fn record(&self, target: &Target, mark: InstallMark) {
        if let Err(e) = self.storage.record(target, mark) {
            tracing::error!(name = %target.name, ?mark, "failed to record install history: {e}");
        }
    }

    // ── Install ──

    /// An installer for `target`, looked up by name in the metadata set.
    ///
    /// `None` if the metadata no longer lists the target.
    pub fn installer(
        &self,
        target: &Target,
        mode: InstallMode,
        local: Option<&LocalSource>,
    ) -> Option<InstallContext<'_>> {
        let known = match local {
            Some(source) => JsonTargetsProvider::offline(&source.metadata_dir).all_targets(),
            None => self.parts.metadata.all_targets(),
        };
        let record = known.into_iter().find(|r| r.name == target.name)?;
        Some(self.install_context(to_target(record), mode, local))
    }

    /// An installer that resyncs the apps of the current target, or `None`
    /// when they are already in sync.
    pub fn check_apps_in_sync(&self) -> Option<InstallContext<'_>> {
        let current = self.current();
        if self.parts.apps.in_sync(&current) {
            return None;
        }
        Some(self.install_context(current, InstallMode::All, None))
    }

    fn install_context(&self, target: Target, mode: InstallMode, local: Option<&LocalSource>) -> InstallContext<'_> {
        let correlation_id = format!("{}-{}", target.version, Uuid::new_v4());
        let pacman = &self.config.pacman;
        let (server, keys) = match local {
            Some(source) => (format!("file://{}", source.tree_repo.display()), None),
            None => (pacman.ostree_server.clone(), self.config.tls_keys()),
        };
        let rootfs = RootfsTreeManager::new(
            self.parts.tree_store.clone(),
            self.parts.bootloader.clone(),
            self.parts.bootloader.clone(),
            self.parts.http.clone(),
            RootfsSettings {
                server,
                keys,
                update_block: pacman.update_block,
                storage_watermark: pacman.storage_watermark,
            },
            correlation_id,
        );
        let apps: Rc<dyn AppEngine> = match local {
            Some(source) => Rc::new(BlobStoreApps::new(
                &self.config.storage.apps_root,
                BlobSource::Local(source.apps_dir.clone()),
            )),
            None => self.parts.apps.clone(),
        };
        InstallContext {
            client: self,
            target,
            rootfs: Box::new(rootfs),
            apps,
            mode,
        }
    }

    /// Confirm the pending install after a reboot.
    ///
    /// `NeedsCompletion` while the pending rootfs is still only staged,
    /// `Failed` if the device did not come up on it or its apps failed.
    pub fn complete_installation(&self) -> InstallResult {
        let Some(pending) = self.pending() else {
            return InstallResult::ok("no pending installation");
        };

        let staged = self.parts.tree_store.pending_hash().unwrap_or_else(|e| {
            tracing::warn!("failed to query the pending deployment: {e}");
            None
        });
        if staged.as_deref() == Some(pending.hash.as_str()) {
            return InstallResult::new(
                InstallStatus::NeedsCompletion,
                format!("reboot is required to boot {}", pending.name),
            );
        }

        let booted = match self.parts.tree_store.current_hash() {
            Ok(hash) => hash,
            Err(e) => return InstallResult::failed(format!("failed to get the booted deployment: {e}")),
        };
        if booted != pending.hash {
            tracing::error!(name = %pending.name, %booted, "device did not boot on the pending target");
            self.record(&pending, InstallMark::Failed);
            return InstallResult::failed(format!(
                "{} failed to boot, the bootloader rolled back to {booted}",
                pending.name
            ));
        }

        if let Err(e) = self
            .parts
            .apps
            .fetch(&pending)
            .and_then(|()| self.parts.apps.activate(&pending))
        {
            tracing::error!(name = %pending.name, "failed to start apps: {e}");
            self.record(&pending, InstallMark::Failed);
            return InstallResult::failed(format!("failed to start apps of {}: {e}", pending.name));
        }

        self.record(&pending, InstallMark::Current);
        if self.parts.bootloader.is_update_in_progress() {
            InstallResult::new(
                InstallStatus::OkBootFwNeedsCompletion,
                "reboot is required to confirm the boot firmware update",
            )
        } else {
            InstallResult::ok("")
        }
    }
}

/// Convert a metadata record, falling back to version -1 when it is unparsable.
fn to_target(record: TargetRecord) -> Target {
    let version = Target::parse_version(&record.custom_version).unwrap_or_else(|| {
        tracing::error!(name = %record.name, version = %record.custom_version, "invalid version number format");
        -1
    });
    Target::new(record.name, record.hash, version, record.custom)
}

/// One install attempt of one target.
pub struct InstallContext<'a> {
    client: &'a Client,
    target: Target,
    rootfs: Box<dyn Installer>,
    apps: Rc<dyn AppEngine>,
    mode: InstallMode,
}

impl InstallContext<'_> {
    #[cfg(test)]
    pub fn target(&self) -> &Target {
        &self.target
    }

    /// Fetch the rootfs and the target's apps.
    pub fn download(&self) -> DownloadResult {
        tracing::info!(name = %self.target.name, "downloading");
        let result = self.rootfs.download(&self.target);
        if !result.is_ok() {
            return result;
        }
        match self.apps.fetch(&self.target) {
            Ok(()) => result,
            Err(e) if e.is_verification() => DownloadResult::verification_failed(e.to_string()),
            Err(e) => DownloadResult::failed(format!("failed to fetch apps: {e}")),
        }
    }

    /// Deploy the rootfs and, when nothing waits for a reboot, start the apps.
    pub fn install(&self) -> InstallResult {
        tracing::info!(name = %self.target.name, "installing");
        let rootfs = self.rootfs.install(&self.target);
        let result = match rootfs.status {
            InstallStatus::Ok => self.start_apps(rootfs),
            InstallStatus::OkBootFwNeedsCompletion
            | InstallStatus::NeedsCompletion
            | InstallStatus::AppsNeedCompletion
            | InstallStatus::BootFwNeedsCompletion
            | InstallStatus::DownloadFailed
            | InstallStatus::Failed => rootfs,
        };

        match result.status {
            InstallStatus::Ok | InstallStatus::OkBootFwNeedsCompletion => {
                self.client.record(&self.target, InstallMark::Current);
            }
            InstallStatus::NeedsCompletion | InstallStatus::AppsNeedCompletion => {
                self.client.record(&self.target, InstallMark::Pending);
            }
            // Nothing on the device changed.
            InstallStatus::BootFwNeedsCompletion | InstallStatus::DownloadFailed | InstallStatus::Failed => {}
        }
        result
    }

    fn start_apps(&self, rootfs: InstallResult) -> InstallResult {
        match self.mode {
            InstallMode::RootfsOnly => InstallResult::new(
                InstallStatus::AppsNeedCompletion,
                "apps start when the installation is completed",
            ),
            InstallMode::All => {
                if let Err(e) = self.apps.fetch(&self.target) {
                    return InstallResult::new(InstallStatus::DownloadFailed, format!("failed to fetch apps: {e}"));
                }
                if let Err(e) = self.apps.activate(&self.target) {
                    return InstallResult::failed(format!("failed to start apps: {e}"));
                }
                rootfs
            }
        }
    }
}
