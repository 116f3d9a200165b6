//! Outcomes of the check-in, download and install stages.
//!
//! Every stage result is a status tag plus a human-readable description.
//! Callers match the status exhaustively, so adding a variant forces every
//! decision point to be revisited.

use std::fmt;
use std::path::PathBuf;

use super::Target;

// ── Check-in ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckInStatus {
    /// Metadata was refreshed from the server.
    Ok,
    /// Refresh failed but a previously trusted local copy was used.
    OkCached,
    /// No usable metadata.
    Failed,
}

/// The filtered, version-ordered target list produced by a check-in.
#[derive(Debug, Clone)]
pub struct CheckInResult {
    pub status: CheckInStatus,
    pub primary_hwid: String,
    targets: Vec<Target>,
}

impl CheckInResult {
    pub fn new(status: CheckInStatus, primary_hwid: impl Into<String>, targets: Vec<Target>) -> Self {
        Self {
            status,
            primary_hwid: primary_hwid.into(),
            targets,
        }
    }

    pub fn failed() -> Self {
        Self::new(CheckInStatus::Failed, "", Vec::new())
    }

    pub fn is_ok(&self) -> bool {
        match self.status {
            CheckInStatus::Ok | CheckInStatus::OkCached => true,
            CheckInStatus::Failed => false,
        }
    }

    /// Targets ascending by version.
    pub fn targets(&self) -> &[Target] {
        &self.targets
    }

    /// The highest-version target whose primary hardware id is `hwid`,
    /// defaulting to the device's primary hardware id.
    pub fn latest(&self, hwid: Option<&str>) -> Option<&Target> {
        let hwid = hwid.unwrap_or(&self.primary_hwid);
        self.targets
            .iter()
            .rev()
            .find(|t| t.hardware_ids().first() == Some(&hwid))
    }
}

// ── Download ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DownloadStatus {
    Ok,
    DownloadFailed,
    DownloadFailedNoSpace,
    VerificationFailed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub status: DownloadStatus,
    pub description: String,
    /// Where the failing write was aimed, reported with space exhaustion.
    pub destination: Option<PathBuf>,
}

impl DownloadResult {
    pub fn ok() -> Self {
        Self {
            status: DownloadStatus::Ok,
            description: String::new(),
            destination: None,
        }
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self {
            status: DownloadStatus::DownloadFailed,
            description: description.into(),
            destination: None,
        }
    }

    pub fn no_space(description: impl Into<String>, destination: impl Into<PathBuf>) -> Self {
        Self {
            status: DownloadStatus::DownloadFailedNoSpace,
            description: description.into(),
            destination: Some(destination.into()),
        }
    }

    pub fn verification_failed(description: impl Into<String>) -> Self {
        Self {
            status: DownloadStatus::VerificationFailed,
            description: description.into(),
            destination: None,
        }
    }

    pub fn is_ok(&self) -> bool {
        match self.status {
            DownloadStatus::Ok => true,
            DownloadStatus::DownloadFailed
            | DownloadStatus::DownloadFailedNoSpace
            | DownloadStatus::VerificationFailed => false,
        }
    }
}

impl fmt::Display for DownloadResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.status {
            DownloadStatus::Ok => "Ok",
            DownloadStatus::DownloadFailed => "DownloadFailed",
            DownloadStatus::DownloadFailedNoSpace => "DownloadFailed_NoSpace",
            DownloadStatus::VerificationFailed => "VerificationFailed",
        };
        write!(f, "{tag}/{}", self.description)
    }
}

// ── Install ──

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstallStatus {
    Ok,
    /// Installed; a reboot is still needed to confirm a boot firmware update.
    OkBootFwNeedsCompletion,
    /// Rootfs deployed; a reboot is needed to boot into it.
    NeedsCompletion,
    /// Rootfs is in place but applications were deferred.
    AppsNeedCompletion,
    /// A boot firmware update must be confirmed by a reboot first.
    BootFwNeedsCompletion,
    /// Application artifacts could not be fetched during install.
    DownloadFailed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstallResult {
    pub status: InstallStatus,
    pub description: String,
}

impl InstallResult {
    pub fn new(status: InstallStatus, description: impl Into<String>) -> Self {
        Self {
            status,
            description: description.into(),
        }
    }

    pub fn ok(description: impl Into<String>) -> Self {
        Self::new(InstallStatus::Ok, description)
    }

    pub fn failed(description: impl Into<String>) -> Self {
        Self::new(InstallStatus::Failed, description)
    }

    pub fn is_ok(&self) -> bool {
        match self.status {
            InstallStatus::Ok
            | InstallStatus::OkBootFwNeedsCompletion
            | InstallStatus::NeedsCompletion
            | InstallStatus::AppsNeedCompletion
            | InstallStatus::BootFwNeedsCompletion => true,
            InstallStatus::DownloadFailed | InstallStatus::Failed => false,
        }
    }
}

impl fmt::Display for InstallResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let tag = match self.status {
            InstallStatus::Ok => "Ok",
            InstallStatus::OkBootFwNeedsCompletion => "OkBootFwNeedsCompletion",
            InstallStatus::NeedsCompletion => "NeedsCompletion",
            InstallStatus::AppsNeedCompletion => "AppsNeedCompletion",
            InstallStatus::BootFwNeedsCompletion => "BootFwNeedsCompletion",
            InstallStatus::DownloadFailed => "DownloadFailed",
            InstallStatus::Failed => "Failed",
        };
        write!(f, "{tag}/{}", self.description)
    }
}
