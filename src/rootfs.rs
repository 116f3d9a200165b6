//! Rootfs updates through the tree store.
//!
//! Download walks an ordered list of remotes: short-lived signed URLs handed
//! out by the gateway first, the configured server last. Space exhaustion is
//! fatal for the whole download; any other pull failure moves on to the next
//! remote. Install runs the boot firmware gate before touching the sysroot.

use std::fmt::Write as _;
use std::rc::Rc;

use crate::bootloader::{self, BootFwUpdateStatus, InstallNotifier};
use crate::delta;
use crate::http::HttpTransport;
use crate::model::{DownloadResult, InstallResult, InstallStatus, Remote, Target, TlsKeys};
use crate::tree_store::{DeployOutcome, TreeStore};

/// Name of the remote pointing at the configured server.
pub const PRIMARY_REMOTE: &str = "origin";

/// Name given to gateway-issued download URLs.
pub const SIGNED_URL_REMOTE: &str = "gcs";

const CORRELATION_HEADER: &str = "X-Correlation-ID";

/// Fetches and installs a target.
pub trait Installer {
    fn download(&self, target: &Target) -> DownloadResult;

    /// Only called after a successful [`Installer::download`].
    fn install(&self, target: &Target) -> InstallResult;
}

/// Settings that shape a [`RootfsTreeManager`].
#[derive(Debug, Clone)]
pub struct RootfsSettings {
    /// Tree-store server; also the gateway asked for extra download URLs.
    pub server: String,
    pub keys: Option<TlsKeys>,
    pub update_block: bool,
    pub storage_watermark: u32,
}

/// Installs rootfs targets with the tree store.
pub struct RootfsTreeManager {
    tree_store: Rc<dyn TreeStore>,
    fw_status: Rc<dyn BootFwUpdateStatus>,
    notifier: Rc<dyn InstallNotifier>,
    http: Rc<dyn HttpTransport>,
    settings: RootfsSettings,
    correlation_id: String,
}

impl RootfsTreeManager {
    pub fn new(
        tree_store: Rc<dyn TreeStore>,
        fw_status: Rc<dyn BootFwUpdateStatus>,
        notifier: Rc<dyn InstallNotifier>,
        http: Rc<dyn HttpTransport>,
        settings: RootfsSettings,
        correlation_id: impl Into<String>,
    ) -> Self {
        Self {
            tree_store,
            fw_status,
            notifier,
            http,
            settings,
            correlation_id: correlation_id.into(),
        }
    }

    /// Candidate remotes, in the order they are tried.
    fn remotes(&self) -> Vec<Remote> {
        let mut remotes = vec![Remote {
            name: PRIMARY_REMOTE.to_string(),
            base_url: self.settings.server.clone(),
            headers: vec![(CORRELATION_HEADER.to_string(), self.correlation_id.clone())],
            keys: self.settings.keys.clone(),
            is_set: false,
        }];
        // A `file://` server is a local repo: there is no gateway to ask.
        if self.settings.server.starts_with("http") {
            let mut extra = self.additional_remotes();
            extra.append(&mut remotes);
            remotes = extra;
        }
        remotes
    }

    /// Ask the gateway for signed download URLs. Failure only means fewer remotes.
    fn additional_remotes(&self) -> Vec<Remote> {
        let url = format!("{}/download-urls", self.settings.server);
        let resp = match self.http.post(&url, &[], b"null") {
            Ok(resp) if resp.is_ok() => resp,
            Ok(resp) => {
                tracing::warn!(
                    "failed to obtain download URLs from the gateway, falling back to the server: {}",
                    resp.status_str()
                );
                return Vec::new();
            }
            Err(e) => {
                tracing::warn!("failed to obtain download URLs from the gateway, falling back to the server: {e}");
                return Vec::new();
            }
        };
        let entries: Vec<serde_json::Value> = match resp.json() {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!("gateway returned malformed download URLs: {e}");
                return Vec::new();
            }
        };

        // Each entry goes to the front: the last one listed is tried first.
        let mut remotes = Vec::with_capacity(entries.len());
        for entry in entries {
            let url = entry["download_url"].as_str().unwrap_or_default();
            let token = entry["access_token"].as_str().unwrap_or_default();
            if url.is_empty() {
                continue;
            }
            remotes.insert(
                0,
                Remote {
                    name: SIGNED_URL_REMOTE.to_string(),
                    base_url: url.to_string(),
                    headers: vec![
                        (CORRELATION_HEADER.to_string(), self.correlation_id.clone()),
                        ("Authorization".to_string(), format!("Bearer {token}")),
                    ],
                    keys: None,
                    is_set: false,
                },
            );
        }
        remotes
    }

    /// Run the capacity planner if the target carries delta stats.
    ///
    /// Returns the no-space result when the delta cannot fit.
    fn check_delta_fits(&self, target: &Target, remote: &Remote) -> Option<DownloadResult> {
        let current = match self.tree_store.current_hash() {
            Ok(hash) => hash,
            Err(e) => {
                tracing::warn!("cannot determine the booted hash, skipping the update size check: {e}");
                return None;
            }
        };
        let Some(delta_stat) = delta::fetch_delta_stat(self.http.as_ref(), target, remote, &current)
        else {
            tracing::info!("no static delta stats found, skipping the update size check");
            return None;
        };

        tracing::info!("found delta stats, checking if the update can fit on disk");
        let sysroot = self.tree_store.sysroot();
        match delta::check_fits(&delta_stat, sysroot, self.settings.storage_watermark) {
            Ok(stat) if stat.fits => {
                tracing::info!("fetching static delta; {stat}");
                None
            }
            Ok(stat) => Some(DownloadResult::no_space(
                format!("Insufficient storage available; err: {stat}"),
                sysroot,
            )),
            Err(e) => {
                tracing::error!("failed to check if the static delta can fit on disk, skipping the size check: {e}");
                None
            }
        }
    }
}

impl Installer for RootfsTreeManager {
    fn download(&self, target: &Target) -> DownloadResult {
        let mut errors = String::new();
        for remote in self.remotes() {
            if !remote.is_set
                && let Err(e) = self.tree_store.add_remote(&remote.name, &remote.base_url, remote.keys.as_ref())
            {
                tracing::error!(remote = %remote.name, "failed to register remote: {e}");
                let _ = writeln!(errors, "{e}");
                continue;
            }

            if let Some(no_space) = self.check_delta_fits(target, &remote) {
                return no_space;
            }

            tracing::info!(hash = %target.hash, url = %remote.base_url, "fetching rootfs commit");
            let err = match self.tree_store.pull(&remote, &target.hash) {
                Ok(()) => return DownloadResult::ok(),
                Err(e) => e.to_string(),
            };
            tracing::error!(url = %remote.base_url, "failed to fetch: {err}");

            if is_out_of_space(&err) {
                let sysroot = self.tree_store.sysroot();
                return DownloadResult::no_space(
                    format!(
                        "Insufficient storage available; path: {}; err: {err}",
                        sysroot.display()
                    ),
                    sysroot,
                );
            }
            let _ = writeln!(errors, "{err}");
        }
        DownloadResult::failed(errors)
    }

    fn install(&self, target: &Target) -> InstallResult {
        let current = match self.tree_store.current_hash() {
            Ok(hash) => hash,
            Err(e) => return InstallResult::failed(format!("failed to get the booted deployment: {e}")),
        };

        if current != target.hash && self.fw_status.is_update_supported() {
            let gate = bootloader::verify_update(self.fw_status.as_ref(), self.settings.update_block, target);
            if gate.status != InstallStatus::Ok {
                return gate;
            }
        }

        let pending = self.tree_store.pending_hash().unwrap_or_else(|e| {
            tracing::warn!("failed to query the pending deployment: {e}");
            None
        });
        let conflicting_pending = pending.as_deref().is_some_and(|p| p != target.hash);
        if current == target.hash && !conflicting_pending {
            tracing::info!(hash = %target.hash, "target is same as current");
            return InstallResult::ok("rootfs hash already installed, same as current");
        }

        self.notifier.update_notify();
        let mut result = match self.tree_store.deploy(&target.hash) {
            DeployOutcome::NeedsCompletion => {
                InstallResult::new(InstallStatus::NeedsCompletion, "reboot is required to boot the new rootfs")
            }
            DeployOutcome::Ok => InstallResult::ok(""),
            DeployOutcome::Failed(e) => {
                tracing::error!(hash = %target.hash, "failed to deploy rootfs: {e}");
                return InstallResult::failed(e);
            }
        };
        self.notifier.install_notify(target);

        // Deploying the booted hash undeploys the pending target and leaves
        // the device on the current rootfs.
        if current == target.hash && result.status == InstallStatus::NeedsCompletion {
            tracing::info!(hash = %target.hash, "undeployed the pending failing target");
            self.notifier.update_notify();
            result = InstallResult::ok("rootfs hash already installed, same as current");
        }
        result
    }
}

/// Pull errors that mean the sysroot ran out of space, for object and delta pulls.
pub fn is_out_of_space(error: &str) -> bool {
    let object_pull = error.contains("would be exceeded, at least")
        && (error.contains("min-free-space-size") || error.contains("min-free-space-percent"));
    let delta_pull = error.contains("Delta requires") && error.contains("free space, but only");
    object_pull || delta_pull
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;
    use sha2::{Digest, Sha256};

    use crate::bootloader::Bootloader;
    use crate::testing::{FakeBootloader, FakeHttp, FakeTreeStore};

    const SERVER: &str = "https://ota.example.io/treehub";

    struct Fixture {
        tree: Rc<FakeTreeStore>,
        http: Rc<FakeHttp>,
        boot: FakeBootloader,
    }

    impl Fixture {
        fn new(current: &str) -> Self {
            Self {
                tree: Rc::new(FakeTreeStore::new(current)),
                http: Rc::new(FakeHttp::new()),
                boot: FakeBootloader::new(),
            }
        }

        fn manager(&self, server: &str) -> RootfsTreeManager {
            let bootloader = Rc::new(Bootloader::new(Box::new(self.boot.clone())));
            RootfsTreeManager::new(
                self.tree.clone(),
                bootloader.clone(),
                bootloader,
                self.http.clone(),
                RootfsSettings {
                    server: server.to_string(),
                    keys: None,
                    update_block: true,
                    storage_watermark: 90,
                },
                "2-0000",
            )
        }
    }

    fn target(hash: &str) -> Target {
        Target::new("t2", hash, 2, json!({}))
    }

    #[test]
    fn recognizes_out_of_space_errors() {
        assert!(is_out_of_space(
            "opcode close: min-free-space-percent '3%' would be exceeded, at least 13.6 kB requested"
        ));
        assert!(is_out_of_space(
            "min-free-space-size 1MB would be exceeded, at least 4 kB requested"
        ));
        assert!(is_out_of_space("Delta requires 1.2 GB free space, but only 800 MB available"));
        assert!(!is_out_of_space("would be exceeded, at least 1 byte"));
        assert!(!is_out_of_space("Server returned HTTP 404"));
    }

    #[test]
    fn signed_urls_are_tried_before_the_server() {
        let fx = Fixture::new("hash1");
        fx.http.respond_post(
            &format!("{SERVER}/download-urls"),
            200,
            br#"[{"download_url":"https://a.example","access_token":"ta"},
                {"download_url":"https://b.example","access_token":"tb"}]"#
                .to_vec(),
        );
        fx.tree.fail_pull("https://b.example", "HTTP 403");
        fx.tree.fail_pull("https://a.example", "HTTP 500");

        let result = fx.manager(SERVER).download(&target("hash2"));
        assert!(result.is_ok());

        let pulls = fx.tree.pulls();
        let urls: Vec<&str> = pulls.iter().map(|p| p.url.as_str()).collect();
        assert_eq!(urls, vec!["https://b.example", "https://a.example", SERVER]);
        assert_eq!(pulls[0].remote, SIGNED_URL_REMOTE);
        assert!(pulls[0].headers.contains(&("Authorization".to_string(), "Bearer tb".to_string())));
        assert!(pulls[2].headers.contains(&(CORRELATION_HEADER.to_string(), "2-0000".to_string())));
        assert_eq!(fx.tree.remotes().len(), 3);
    }

    #[test]
    fn local_repo_skips_gateway() {
        let fx = Fixture::new("hash1");
        let result = fx.manager("file:///media/update/ostree_repo").download(&target("hash2"));
        assert!(result.is_ok());
        assert!(fx.http.requests().is_empty());
        assert_eq!(fx.tree.pulls().len(), 1);
    }

    #[test]
    fn all_remotes_failing_concatenates_errors() {
        let fx = Fixture::new("hash1");
        fx.tree.fail_pull(SERVER, "Server returned HTTP 404");
        let result = fx.manager(SERVER).download(&target("hash2"));
        assert_eq!(result.status, crate::model::DownloadStatus::DownloadFailed);
        assert!(result.description.contains("Server returned HTTP 404"));
    }

    #[test]
    fn pull_out_of_space_stops_iteration() {
        let fx = Fixture::new("hash1");
        fx.http.respond_post(
            &format!("{SERVER}/download-urls"),
            200,
            br#"[{"download_url":"https://a.example","access_token":"ta"}]"#.to_vec(),
        );
        fx.tree.fail_pull(
            "https://a.example",
            "Delta requires 1.2 GB free space, but only 800 MB available",
        );

        let result = fx.manager(SERVER).download(&target("hash2"));
        assert_eq!(result.status, crate::model::DownloadStatus::DownloadFailedNoSpace);
        assert_eq!(result.destination.as_deref(), Some(fx.tree.sysroot()));
        assert_eq!(fx.tree.pulls().len(), 1);
    }

    #[test]
    fn delta_that_cannot_fit_aborts_before_pull() {
        let fx = Fixture::new("hash1");
        let stats = serde_json::to_vec(&json!({
            "hash2": { "hash1": { "size": 1, "u_size": 1_u64 << 60 } }
        }))
        .unwrap();
        fx.http.respond_get(&format!("{SERVER}/delta-stats/"), 200, stats.clone());
        let target = Target::new(
            "t2",
            "hash2",
            2,
            json!({ "delta-stats": { "sha256": hex::encode(Sha256::digest(&stats)), "size": stats.len() } }),
        );

        let result = fx.manager(SERVER).download(&target);
        assert_eq!(result.status, crate::model::DownloadStatus::DownloadFailedNoSpace);
        assert!(result.description.starts_with("Insufficient storage available"));
        assert!(fx.tree.pulls().is_empty());
    }

    #[test]
    fn installing_current_is_a_no_op() {
        let fx = Fixture::new("hash1");
        let result = fx.manager(SERVER).install(&target("hash1"));
        assert_eq!(result.status, InstallStatus::Ok);
        assert!(fx.tree.deploys().is_empty());
    }

    #[test]
    fn new_rootfs_needs_completion() {
        let fx = Fixture::new("hash1");
        let result = fx.manager(SERVER).install(&target("hash2"));
        assert_eq!(result.status, InstallStatus::NeedsCompletion);
        assert_eq!(fx.tree.pending().as_deref(), Some("hash2"));
        assert_eq!(fx.boot.env("upgrade_available").as_deref(), Some("1"));
    }

    #[test]
    fn firmware_rollback_is_rejected_before_deploy() {
        let fx = Fixture::new("hash1");
        fx.boot.set_env("rollback_protection", "1");
        fx.boot.set_env("bootfirmware_version", "5");
        fx.boot.set_version_file("hash2", "bootfirmware_version=4");

        let result = fx.manager(SERVER).install(&target("hash2"));
        assert_eq!(result.status, InstallStatus::Failed);
        assert!(fx.tree.deploys().is_empty());
        assert!(fx.boot.env("upgrade_available").is_none());
    }

    #[test]
    fn firmware_update_in_progress_blocks_rootfs_change() {
        let fx = Fixture::new("hash1");
        fx.boot.set_env("bootupgrade_available", "1");
        let result = fx.manager(SERVER).install(&target("hash2"));
        assert_eq!(result.status, InstallStatus::BootFwNeedsCompletion);
        assert!(fx.tree.deploys().is_empty());
    }

    #[test]
    fn firmware_upgrade_is_flagged_after_deploy() {
        let fx = Fixture::new("hash1");
        fx.boot.set_env("bootfirmware_version", "1");
        fx.boot.set_version_file("hash2", "bootfirmware_version=2");
        let result = fx.manager(SERVER).install(&target("hash2"));
        assert_eq!(result.status, InstallStatus::NeedsCompletion);
        assert_eq!(fx.boot.env("bootupgrade_available").as_deref(), Some("1"));
    }

    #[test]
    fn undeploying_failing_pending_reports_ok() {
        let fx = Fixture::new("hash1");
        fx.tree.set_pending(Some("hash2"));
        let result = fx.manager(SERVER).install(&target("hash1"));
        assert_eq!(result.status, InstallStatus::Ok);
        assert_eq!(fx.tree.deploys(), vec!["hash1".to_string()]);
        assert!(fx.tree.pending().is_none());
    }

    #[test]
    fn deploy_failure_is_surfaced() {
        let fx = Fixture::new("hash1");
        fx.tree.fail_deploy("error: bootloader config write failed");
        let result = fx.manager(SERVER).install(&target("hash2"));
        assert_eq!(result.status, InstallStatus::Failed);
        assert!(result.description.contains("bootloader config write failed"));
    }
}
