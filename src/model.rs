//! Core data model for the update agent.
//!
//! These types flow between check-in, download and install:
//! targets, the outcome of each pipeline stage, and the remotes a
//! rootfs commit may be pulled from.

mod remote;
mod result;
mod target;

pub use remote::{Remote, TlsKeys};
pub use result::{
    CheckInResult, CheckInStatus, DownloadResult, DownloadStatus, InstallResult, InstallStatus,
};
pub use target::{AppRef, Target};
