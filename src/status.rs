//! Status codes surfaced to operators.
//!
//! Every internal result maps to exactly one code; the matches below are
//! exhaustive so a new result variant cannot slip through unmapped. The
//! numeric value is the process exit code.

use std::fmt;

use crate::model::{CheckInStatus, DownloadStatus, InstallStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    UnknownError,
    CheckinOkCached,
    CheckinFailure,
    OkNeedsRebootForBootFw,
    TufMetaPullFailure,
    TufTargetNotFound,
    InstallationInProgress,
    NoPendingInstallation,
    DownloadFailure,
    DownloadFailureNoSpace,
    DownloadFailureVerificationFailed,
    InstallAlreadyInstalled,
    InstallAppsNeedFinalization,
    InstallDowngradeAttempt,
    InstallNeedsRebootForBootFw,
    InstallNeedsReboot,
    InstallAppPullFailure,
    InstallRollbackOk,
    InstallRollbackNeedsReboot,
    InstallRollbackFailed,
}

impl StatusCode {
    pub fn code(self) -> i32 {
        match self {
            Self::Ok => 0,
            Self::UnknownError => 1,
            Self::CheckinOkCached => 3,
            Self::CheckinFailure => 4,
            Self::OkNeedsRebootForBootFw => 5,
            Self::TufMetaPullFailure => 10,
            Self::TufTargetNotFound => 20,
            Self::InstallationInProgress => 30,
            Self::NoPendingInstallation => 40,
            Self::DownloadFailure => 50,
            Self::DownloadFailureNoSpace => 60,
            Self::DownloadFailureVerificationFailed => 70,
            Self::InstallAlreadyInstalled => 75,
            Self::InstallAppsNeedFinalization => 80,
            Self::InstallDowngradeAttempt => 90,
            Self::InstallNeedsRebootForBootFw => 95,
            Self::InstallNeedsReboot => 100,
            Self::InstallAppPullFailure => 105,
            Self::InstallRollbackOk => 110,
            Self::InstallRollbackNeedsReboot => 120,
            Self::InstallRollbackFailed => 130,
        }
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{self:?} ({})", self.code())
    }
}

impl From<CheckInStatus> for StatusCode {
    fn from(status: CheckInStatus) -> Self {
        match status {
            CheckInStatus::Ok => Self::Ok,
            CheckInStatus::OkCached => Self::CheckinOkCached,
            CheckInStatus::Failed => Self::CheckinFailure,
        }
    }
}

impl From<DownloadStatus> for StatusCode {
    fn from(status: DownloadStatus) -> Self {
        match status {
            DownloadStatus::Ok => Self::Ok,
            DownloadStatus::DownloadFailed => Self::DownloadFailure,
            DownloadStatus::DownloadFailedNoSpace => Self::DownloadFailureNoSpace,
            DownloadStatus::VerificationFailed => Self::DownloadFailureVerificationFailed,
        }
    }
}

impl From<InstallStatus> for StatusCode {
    fn from(status: InstallStatus) -> Self {
        match status {
            InstallStatus::Ok => Self::Ok,
            InstallStatus::OkBootFwNeedsCompletion => Self::OkNeedsRebootForBootFw,
            InstallStatus::NeedsCompletion => Self::InstallNeedsReboot,
            InstallStatus::AppsNeedCompletion => Self::InstallAppsNeedFinalization,
            InstallStatus::BootFwNeedsCompletion => Self::InstallNeedsRebootForBootFw,
            InstallStatus::DownloadFailed => Self::InstallAppPullFailure,
            // A generic failure that was not turned into a rollback outcome.
            InstallStatus::Failed => Self::UnknownError,
        }
    }
}
