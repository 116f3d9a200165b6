//! Boot firmware state and the rollback gate.
//!
//! The bootloader environment carries the firmware version currently in use
//! and whether a firmware update awaits confirmation. Each rootfs deployment
//! ships the firmware version it carries in a version file. Comparing the two
//! lets the agent refuse a rootfs that would roll the boot firmware back.
//!
//! Two capability sets are exposed separately: [`BootFwUpdateStatus`] for
//! queries and [`InstallNotifier`] for install-time callbacks.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::{fs, io};

use crate::model::{InstallResult, InstallStatus, Target};

/// Relative location of the firmware version file inside a deployment.
pub const VERSION_FILE: &str = "usr/lib/firmware/version.txt";

const VERSION_VAR: &str = "bootfirmware_version";
const UPGRADE_IN_PROGRESS_VAR: &str = "bootupgrade_available";
const ROLLBACK_PROTECTION_VAR: &str = "rollback_protection";
const BOOTCOUNT_VAR: &str = "bootcount";
const UPGRADE_AVAILABLE_VAR: &str = "upgrade_available";

/// Errors from bootloader environment access.
#[derive(Debug, thiserror::Error)]
pub enum BootloaderError {
    #[error("bootloader environment access is not configured")]
    NotConfigured,

    #[error("failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },
}

/// Why a firmware version could not be obtained.
#[derive(Debug, thiserror::Error)]
pub enum VersionError {
    /// A version was found but is not a non-negative integer.
    #[error("malformed bootloader version: {0}")]
    Malformed(String),

    #[error("bootloader version unavailable: {0}")]
    Unavailable(String),
}

/// Raw access to the bootloader environment and deployment version files.
pub trait BootloaderIo {
    /// Whether environment reads are possible at all.
    fn can_read_env(&self) -> bool;

    fn read_env(&self, name: &str) -> Result<String, BootloaderError>;

    fn write_env(&self, name: &str, value: &str) -> Result<(), BootloaderError>;

    /// Contents of the version file of the deployment of `hash`.
    fn read_version_file(&self, hash: &str) -> io::Result<String>;
}

/// Queries about boot firmware update state.
pub trait BootFwUpdateStatus {
    fn is_update_supported(&self) -> bool;
    fn is_update_in_progress(&self) -> bool;
    fn is_rollback_protection_enabled(&self) -> bool;
    fn current_version(&self) -> Result<u64, VersionError>;
    fn deployment_version(&self, hash: &str) -> Result<u64, VersionError>;
}

/// Callbacks around a rootfs deployment.
pub trait InstallNotifier {
    /// Called before the deployment changes.
    fn update_notify(&self);

    /// Called after `target` has been deployed.
    fn install_notify(&self, target: &Target);
}

/// Parse a firmware version string.
pub fn parse_version(raw: &str) -> Result<u64, VersionError> {
    raw.trim()
        .parse()
        .map_err(|_| VersionError::Malformed(raw.trim().to_string()))
}

/// Extract the value of the `bootfirmware_version` entry from a version file.
fn extract_version(contents: &str) -> Option<&str> {
    contents.lines().find_map(|line| {
        let (key, value) = line.split_once('=')?;
        (key.trim() == VERSION_VAR).then_some(value.trim())
    })
}

/// Bootloader state backed by a [`BootloaderIo`].
pub struct Bootloader {
    io: Box<dyn BootloaderIo>,
}

impl Bootloader {
    pub fn new(io: Box<dyn BootloaderIo>) -> Self {
        Self { io }
    }

    fn env_flag(&self, name: &str) -> bool {
        match self.io.read_env(name) {
            Ok(value) => value.trim() == "1",
            Err(e) => {
                tracing::debug!(name, "failed to read bootloader variable: {e}");
                false
            }
        }
    }

    fn set_env(&self, name: &str, value: &str) {
        if let Err(e) = self.io.write_env(name, value) {
            tracing::warn!(name, value, "failed to set bootloader variable: {e}");
        }
    }
}

impl BootFwUpdateStatus for Bootloader {
    fn is_update_supported(&self) -> bool {
        self.io.can_read_env()
    }

    fn is_update_in_progress(&self) -> bool {
        self.env_flag(UPGRADE_IN_PROGRESS_VAR)
    }

    fn is_rollback_protection_enabled(&self) -> bool {
        self.env_flag(ROLLBACK_PROTECTION_VAR)
    }

    fn current_version(&self) -> Result<u64, VersionError> {
        let raw = self
            .io
            .read_env(VERSION_VAR)
            .map_err(|e| VersionError::Unavailable(e.to_string()))?;
        parse_version(&raw)
    }

    fn deployment_version(&self, hash: &str) -> Result<u64, VersionError> {
        let contents = self
            .io
            .read_version_file(hash)
            .map_err(|e| VersionError::Unavailable(format!("version file of {hash}: {e}")))?;
        let raw = extract_version(&contents).ok_or_else(|| {
            VersionError::Unavailable(format!("no {VERSION_VAR} entry in the version file of {hash}"))
        })?;
        parse_version(raw)
    }
}

impl InstallNotifier for Bootloader {
    fn update_notify(&self) {
        if !self.is_update_supported() {
            return;
        }
        self.set_env(BOOTCOUNT_VAR, "0");
        self.set_env(UPGRADE_AVAILABLE_VAR, "1");
    }

    fn install_notify(&self, target: &Target) {
        if !self.is_update_supported() {
            return;
        }
        let (Ok(current), Ok(next)) = (self.current_version(), self.deployment_version(&target.hash))
        else {
            return;
        };
        if current != next {
            tracing::info!(current, next, "boot firmware update is part of the target");
            self.set_env(UPGRADE_IN_PROGRESS_VAR, "1");
        }
    }
}

/// Decide whether deploying `target` is safe for the boot firmware.
///
/// Runs before any filesystem mutation. An `Ok` result allows the install.
pub fn verify_update(
    status: &dyn BootFwUpdateStatus,
    update_block: bool,
    target: &Target,
) -> InstallResult {
    if update_block && status.is_update_in_progress() {
        tracing::warn!(
            "boot firmware update is in progress; the device must be rebooted to confirm it \
             before a new rootfs can be installed"
        );
        return InstallResult::new(
            InstallStatus::BootFwNeedsCompletion,
            "bootloader update is in progress",
        );
    }

    if !status.is_rollback_protection_enabled() {
        return InstallResult::ok("");
    }

    let target_version = match status.deployment_version(&target.hash) {
        Ok(v) => v,
        Err(VersionError::Malformed(raw)) => {
            tracing::warn!(%raw, "rejecting the update: bootloader version file is malformed");
            return InstallResult::failed(format!("malformed bootloader version: {raw}"));
        }
        Err(e) => {
            tracing::info!("failed to get bootloader version, assuming no bootloader update: {e}");
            return InstallResult::ok("");
        }
    };

    let current_version = status.current_version().unwrap_or_else(|e| {
        tracing::warn!(
            "failed to get current bootloader version ({e}); assuming `0` and proceeding"
        );
        0
    });

    if target_version < current_version {
        let msg = format!(
            "bootloader rollback from version {current_version} to {target_version} has been detected"
        );
        tracing::warn!("rejecting the update because {msg}");
        return InstallResult::failed(msg);
    }

    InstallResult::ok("")
}

/// Bootloader environment accessed through `fw_printenv`/`fw_setenv`-style commands.
pub struct FwEnv {
    get_cmd: Vec<String>,
    set_cmd: Vec<String>,
    deploy_root: PathBuf,
}

impl FwEnv {
    /// `deploy_root` is the directory holding `<hash>.<serial>` deployments.
    pub fn new(get_cmd: &str, set_cmd: &str, deploy_root: impl Into<PathBuf>) -> Self {
        Self {
            get_cmd: get_cmd.split_whitespace().map(String::from).collect(),
            set_cmd: set_cmd.split_whitespace().map(String::from).collect(),
            deploy_root: deploy_root.into(),
        }
    }

    /// The deployment directory for `hash` under `<sysroot>/ostree/deploy/<os>/deploy`.
    pub fn deploy_root(sysroot: &Path, os: &str) -> PathBuf {
        sysroot.join("ostree").join("deploy").join(os).join("deploy")
    }
}

impl BootloaderIo for FwEnv {
    fn can_read_env(&self) -> bool {
        !self.get_cmd.is_empty()
    }

    fn read_env(&self, name: &str) -> Result<String, BootloaderError> {
        let output = run_cmd(&self.get_cmd, &[name])?;
        // `fw_printenv name` prints `name=value`.
        let line = output.lines().next().unwrap_or_default();
        Ok(line
            .strip_prefix(name)
            .and_then(|rest| rest.strip_prefix('='))
            .unwrap_or(line)
            .trim()
            .to_string())
    }

    fn write_env(&self, name: &str, value: &str) -> Result<(), BootloaderError> {
        run_cmd(&self.set_cmd, &[name, value]).map(|_| ())
    }

    fn read_version_file(&self, hash: &str) -> io::Result<String> {
        fs::read_to_string(self.deploy_root.join(format!("{hash}.0")).join(VERSION_FILE))
    }
}

/// Run a configured command with extra arguments, returning stdout.
fn run_cmd(cmd: &[String], extra: &[&str]) -> Result<String, BootloaderError> {
    let Some((program, base_args)) = cmd.split_first() else {
        return Err(BootloaderError::NotConfigured);
    };
    let output = Command::new(program)
        .args(base_args)
        .args(extra)
        .output()
        .map_err(|source| BootloaderError::Spawn {
            program: program.clone(),
            source,
        })?;
    if !output.status.success() {
        return Err(BootloaderError::Command {
            command: format!("{} {}", cmd.join(" "), extra.join(" ")),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
