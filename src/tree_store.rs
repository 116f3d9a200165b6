//! Tree-store access: pull, deploy, and query deployments.
//!
//! The agent treats the tree store as the single source of truth for which
//! rootfs is booted and which is staged for the next boot. Every query goes
//! back to the store; nothing is cached here.
//!
//! [`OstreeCli`] drives the `ostree` binary the same way an operator would.

use std::io;
use std::path::{Path, PathBuf};
use std::process::Command;

use crate::model::{Remote, TlsKeys};

/// Errors from tree-store operations.
#[derive(Debug, thiserror::Error)]
pub enum TreeStoreError {
    #[error("failed to run {program}: {source}")]
    Spawn { program: String, source: io::Error },

    #[error("{command} failed: {stderr}")]
    Command { command: String, stderr: String },

    #[error("no booted deployment found in {0}")]
    NoBootedDeployment(PathBuf),
}

pub type Result<T> = core::result::Result<T, TreeStoreError>;

/// Result of staging a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeployOutcome {
    /// Deployment changed; a reboot makes it effective.
    NeedsCompletion,
    /// Nothing needed to change.
    Ok,
    Failed(String),
}

/// The tree-store seam.
pub trait TreeStore {
    /// Pull `hash` from `remote`, sending the remote's extra headers.
    fn pull(&self, remote: &Remote, hash: &str) -> Result<()>;

    /// Hash of the booted deployment.
    fn current_hash(&self) -> Result<String>;

    /// Hash of the deployment staged for the next boot, if any.
    fn pending_hash(&self) -> Result<Option<String>>;

    /// Make `hash` the deployment for the next boot.
    ///
    /// Deploying the booted hash while another deployment is pending
    /// removes the pending one instead.
    fn deploy(&self, hash: &str) -> DeployOutcome;

    /// Register (or replace) a named remote.
    fn add_remote(&self, name: &str, url: &str, keys: Option<&TlsKeys>) -> Result<()>;

    /// Root of the sysroot the store manages.
    fn sysroot(&self) -> &Path;
}

/// One line of `ostree admin status`.
#[derive(Debug, Clone, PartialEq, Eq)]
struct Deployment {
    index: usize,
    hash: String,
    booted: bool,
    pending: bool,
}

/// Tree store backed by the `ostree` command-line tool.
pub struct OstreeCli {
    sysroot: PathBuf,
    os: String,
}

impl OstreeCli {
    pub fn new(sysroot: impl Into<PathBuf>, os: impl Into<String>) -> Self {
        Self {
            sysroot: sysroot.into(),
            os: os.into(),
        }
    }

    fn repo_arg(&self) -> String {
        format!("--repo={}", self.sysroot.join("ostree").join("repo").display())
    }

    fn sysroot_arg(&self) -> String {
        format!("--sysroot={}", self.sysroot.display())
    }

    fn deployments(&self) -> Result<Vec<Deployment>> {
        let output = run_ostree(&["admin", "status", &self.sysroot_arg()])?;
        Ok(parse_admin_status(&output))
    }
}

impl TreeStore for OstreeCli {
    fn pull(&self, remote: &Remote, hash: &str) -> Result<()> {
        let mut args = vec!["pull".to_string(), self.repo_arg()];
        for (name, value) in &remote.headers {
            args.push(format!("--http-header={name}={value}"));
        }
        args.push(remote.name.clone());
        args.push(hash.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_ostree(&args)?;
        Ok(())
    }

    fn current_hash(&self) -> Result<String> {
        self.deployments()?
            .into_iter()
            .find(|d| d.booted)
            .map(|d| d.hash)
            .ok_or_else(|| TreeStoreError::NoBootedDeployment(self.sysroot.clone()))
    }

    fn pending_hash(&self) -> Result<Option<String>> {
        Ok(self
            .deployments()?
            .into_iter()
            .find(|d| d.pending)
            .map(|d| d.hash))
    }

    fn deploy(&self, hash: &str) -> DeployOutcome {
        let deployments = match self.deployments() {
            Ok(d) => d,
            Err(e) => return DeployOutcome::Failed(e.to_string()),
        };
        let booted = deployments.iter().find(|d| d.booted);
        let pending = deployments.iter().find(|d| d.pending);

        if booted.is_some_and(|b| b.hash == hash) {
            let Some(pending) = pending else {
                return DeployOutcome::Ok;
            };
            let index = pending.index.to_string();
            return match run_ostree(&["admin", "undeploy", &self.sysroot_arg(), &index]) {
                Ok(_) => DeployOutcome::NeedsCompletion,
                Err(e) => DeployOutcome::Failed(e.to_string()),
            };
        }

        let os_arg = format!("--os={}", self.os);
        match run_ostree(&["admin", "deploy", &self.sysroot_arg(), &os_arg, hash]) {
            Ok(_) => DeployOutcome::NeedsCompletion,
            Err(e) => DeployOutcome::Failed(e.to_string()),
        }
    }

    fn add_remote(&self, name: &str, url: &str, keys: Option<&TlsKeys>) -> Result<()> {
        let mut args = vec![
            "remote".to_string(),
            "add".to_string(),
            self.repo_arg(),
            "--force".to_string(),
            "--no-gpg-verify".to_string(),
        ];
        if let Some(keys) = keys {
            let settings = [
                ("tls-ca-path", &keys.ca_file),
                ("tls-client-cert-path", &keys.cert_file),
                ("tls-client-key-path", &keys.key_file),
            ];
            for (key, path) in settings {
                if let Some(path) = path {
                    args.push(format!("--set={key}={}", path.display()));
                }
            }
        }
        args.push(name.to_string());
        args.push(url.to_string());
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        run_ostree(&args)?;
        Ok(())
    }

    fn sysroot(&self) -> &Path {
        &self.sysroot
    }
}

/// Run an ostree command and return its stdout on success.
fn run_ostree(args: &[&str]) -> Result<String> {
    tracing::debug!(args = %args.join(" "), "running ostree");
    let output = Command::new("ostree")
        .args(args)
        .output()
        .map_err(|source| TreeStoreError::Spawn {
            program: "ostree".to_string(),
            source,
        })?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        return Err(TreeStoreError::Command {
            command: format!("ostree {}", args.join(" ")),
            stderr: stderr.trim().to_string(),
        });
    }

    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}

/// Parse `ostree admin status` output.
///
/// Deployment lines look like `* lmp 2a4b…e1.0 (pending)`: an optional `*`
/// marking the booted deployment, the OS name, `<checksum>.<serial>`, and
/// optional state annotations. Indented lines are details and are skipped.
fn parse_admin_status(output: &str) -> Vec<Deployment> {
    let mut deployments = Vec::new();
    for line in output.lines() {
        let booted = line.starts_with("* ");
        if !booted && !line.starts_with("  ") {
            continue;
        }
        let mut fields = line.trim_start_matches('*').split_whitespace();
        let (Some(_os), Some(checksum)) = (fields.next(), fields.next()) else {
            continue;
        };
        let Some((hash, serial)) = checksum.rsplit_once('.') else {
            continue;
        };
        if hash.len() != 64 || serial.parse::<u32>().is_err() {
            continue;
        }
        let pending = fields.any(|f| f == "(pending)" || f == "(staged)");
        deployments.push(Deployment {
            index: deployments.len(),
            hash: hash.to_string(),
            booted,
            pending,
        });
    }
    deployments
}
