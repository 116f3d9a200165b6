//! Operator-level install flows.
//!
//! Each flow ends in a single [`StatusCode`]. A failed install triggers
//! exactly one rollback attempt; a failed rollback is reported, never retried.

use crate::client::{Client, InstallMode, LocalSource};
use crate::model::{InstallStatus, Target};
use crate::status::StatusCode;

/// What to install and how.
#[derive(Debug, Clone, Default)]
pub struct InstallRequest {
    /// Install the target with this version instead of the latest.
    pub version: Option<i64>,
    /// Install the target with this name instead of the latest.
    pub name: Option<String>,
    /// Allow installing a lower version than the current one.
    pub force_downgrade: bool,
    pub mode: InstallMode,
    /// Install from an update medium instead of the server.
    pub local: Option<LocalSource>,
}

/// Check in, pick a target, download and install it.
pub fn install(client: &Client, request: &InstallRequest) -> StatusCode {
    if client.is_installation_in_progress() {
        tracing::error!("cannot start an installation while another one is pending; reboot and complete it first");
        return StatusCode::InstallationInProgress;
    }

    let current = client.current();
    let check_in = match &request.local {
        Some(source) => client.check_in_local(source),
        None => client.check_in(),
    };
    if !check_in.is_ok() {
        tracing::error!("failed to pull targets metadata or it is invalid");
        return StatusCode::TufMetaPullFailure;
    }

    let Some(target) = select_target(check_in.targets(), check_in.latest(None), request) else {
        tracing::error!(
            version = ?request.version,
            name = ?request.name,
            hardware_id = %client.config().provision.primary_hardware_id,
            tags = ?client.config().pacman.tags,
            "no target found"
        );
        return StatusCode::TufTargetNotFound;
    };

    if target.version < current.version {
        tracing::warn!(
            current = current.version,
            found = target.version,
            "found target is a lower version than the current one"
        );
        if !request.force_downgrade {
            tracing::error!("downgrade is not allowed by default; re-run with --force to force it");
            return StatusCode::InstallDowngradeAttempt;
        }
        tracing::warn!(from = current.version, to = target.version, "downgrading");
    }

    if target == current && client.check_apps_in_sync().is_none() {
        if request.local.is_some() {
            return StatusCode::InstallAlreadyInstalled;
        }
        tracing::info!(
            name = %target.name,
            "target is already installed, installing anyway to make sure it is synced and running"
        );
    } else {
        if client.is_known_failure(&target) {
            tracing::warn!(name = %target.name, "target failed on this device before");
        }
        tracing::info!(from = %current.name, to = %target.name, "updating");
    }

    let Some(installer) = client.installer(&target, request.mode, request.local.as_ref()) else {
        tracing::error!(name = %target.name, "installer could not find the target in the metadata; try again later");
        return StatusCode::UnknownError;
    };

    let download = installer.download();
    if !download.is_ok() {
        tracing::error!(name = %target.name, "failed to download target: {download}");
        return download.status.into();
    }

    let result = installer.install();
    if result.status != InstallStatus::Failed {
        if !result.is_ok() {
            tracing::error!(name = %target.name, "failed to install target: {result}");
        }
        return result.status.into();
    }

    tracing::error!(name = %target.name, "failed to install target: {result}");
    rollback_to(client, &current)
}

/// The one rollback attempt after a failed install.
fn rollback_to(client: &Client, previous: &Target) -> StatusCode {
    tracing::info!(name = %previous.name, "rolling back to the previous target");
    let Some(installer) = client.installer(previous, InstallMode::All, None) else {
        tracing::error!(name = %previous.name, "failed to find the previous target in the metadata");
        return StatusCode::InstallRollbackFailed;
    };
    let result = installer.install();
    match result.status {
        InstallStatus::Ok => StatusCode::InstallRollbackOk,
        InstallStatus::NeedsCompletion => StatusCode::InstallRollbackNeedsReboot,
        InstallStatus::OkBootFwNeedsCompletion
        | InstallStatus::AppsNeedCompletion
        | InstallStatus::BootFwNeedsCompletion
        | InstallStatus::DownloadFailed
        | InstallStatus::Failed => {
            tracing::error!(name = %previous.name, "failed to roll back: {result}");
            StatusCode::InstallRollbackFailed
        }
    }
}

fn select_target(targets: &[Target], latest: Option<&Target>, request: &InstallRequest) -> Option<Target> {
    if request.version.is_none() && request.name.is_none() {
        return latest.cloned();
    }
    targets
        .iter()
        .find(|t| Some(t.version) == request.version || request.name.as_deref() == Some(t.name.as_str()))
        .cloned()
}

/// Confirm the pending install after a reboot, rolling back if it failed.
pub fn complete_install(client: &Client) -> StatusCode {
    let Some(pending) = client.pending() else {
        tracing::error!("there is no pending installation to complete");
        return StatusCode::NoPendingInstallation;
    };

    let result = client.complete_installation();
    match result.status {
        InstallStatus::Failed => {
            tracing::error!(name = %pending.name, "failed to finalize pending installation: {result}");
        }
        InstallStatus::OkBootFwNeedsCompletion => {
            tracing::info!("finalization was successful, reboot is required to confirm the boot firmware update");
            return result.status.into();
        }
        InstallStatus::NeedsCompletion => {
            tracing::info!("installation finalization was not invoked, device reboot is required");
            return result.status.into();
        }
        InstallStatus::Ok
        | InstallStatus::AppsNeedCompletion
        | InstallStatus::BootFwNeedsCompletion
        | InstallStatus::DownloadFailed => return result.status.into(),
    }

    let current = client.current();
    if current.hash != pending.hash {
        // The bootloader already went back to the previous rootfs.
        tracing::info!(name = %current.name, "installation has failed, device was rolled back");
        let Some(resync) = client.check_apps_in_sync() else {
            tracing::info!(name = %current.name, "no apps to sync, rollback completed");
            return StatusCode::InstallRollbackOk;
        };
        let result = resync.install();
        if result.status == InstallStatus::Ok {
            tracing::info!(name = %current.name, "apps have been synced, rollback completed");
            return StatusCode::InstallRollbackOk;
        }
        tracing::error!(
            name = %current.name,
            "failed to sync apps, rollback failed; try to install the current target again"
        );
        return StatusCode::InstallRollbackFailed;
    }

    tracing::info!("device booted on the updated rootfs but failed to start the updated apps");
    let rollback = client.rollback_target();
    if rollback.is_unknown() {
        tracing::error!("failed to find a target to roll back to, try to install another target");
        return StatusCode::InstallRollbackFailed;
    }
    tracing::info!(name = %rollback.name, "rolling back");
    let Some(installer) = client.installer(&rollback, InstallMode::All, None) else {
        tracing::error!(
            name = %rollback.name,
            "installer could not find the rollback target in the metadata; try to install another target"
        );
        return StatusCode::UnknownError;
    };
    let result = installer.install();
    if result.status == InstallStatus::NeedsCompletion {
        tracing::info!(name = %rollback.name, "installed the rollback target, reboot is required to complete it");
        return StatusCode::InstallRollbackNeedsReboot;
    }
    tracing::error!(name = %rollback.name, "failed to roll back: {result}; try to install another target");
    StatusCode::InstallRollbackFailed
}
