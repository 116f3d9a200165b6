//! Command-line interface for the update agent.
//!
//! Each subcommand is non-interactive and ends in a [`StatusCode`], which
//! becomes the process exit code. Human-readable output goes to stdout;
//! logs go to stderr.
//!
//! Commands:
//!
//! - `ota-agent check` lists the targets available to this device.
//! - `ota-agent install` downloads and installs a target.
//! - `ota-agent complete` finalizes an install after the reboot.
//! - `ota-agent status` shows the current and pending targets.
//! - `ota-agent set-secondaries` registers secondary ECUs and lists the
//!   targets for them and the device.
//! - `ota-agent manifest` and `ota-agent fetch-blob` read verified content
//!   from the container registry.

mod format;

use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};

use crate::apps::{AppEngine, BlobSource, BlobStoreApps, NoApps};
use crate::bootloader::{Bootloader, FwEnv};
use crate::client::{Client, Collaborators, InstallMode, LocalSource, SecondaryEcu};
use crate::config::Config;
use crate::http::{HttpTransport, UreqTransport};
use crate::metadata::{JsonTargetsProvider, MetadataProvider};
use crate::orchestrator::{self, InstallRequest};
use crate::registry::{ContentUri, FetchError, MANIFEST_FORMAT, RegistryClient};
use crate::status::StatusCode;
use crate::storage::Storage;
use crate::tree_store::{OstreeCli, TreeStore};

use format::{format_progress, format_status, format_targets};

const HTTP_TIMEOUT: Duration = Duration::from_secs(60);

/// Over-the-air update agent for ostree-based devices.
#[derive(Debug, Parser)]
#[command(name = "ota-agent", version, after_long_help = WORKFLOW_HELP)]
pub struct Cli {
    /// Config file. Overrides `OTA_AGENT_CONFIG` and `/etc/ota-agent/config.toml`.
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

const WORKFLOW_HELP: &str = r#"Workflow: updating a device
  1. ota-agent check
  2. ota-agent install             → exits 100 when a reboot is needed
  3. reboot
  4. ota-agent complete            → exits 0, or 110/120/130 after a rollback

Offline update from a mounted medium:
  ota-agent install --local-metadata /mnt/update/tuf"#;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Refresh targets metadata and list the targets for this device.
    Check {
        #[command(flatten)]
        local: LocalArgs,
    },

    /// Download and install a target.
    ///
    /// Installs the latest target unless `--version` or `--name` is given.
    /// A failed install is rolled back to the current target once.
    Install {
        /// Target version to install.
        #[arg(long, conflicts_with = "name")]
        version: Option<i64>,

        /// Target name to install.
        #[arg(long)]
        name: Option<String>,

        /// Allow installing a lower version than the current one.
        #[arg(long)]
        force: bool,

        #[arg(long, value_enum, default_value_t = ModeArg::All)]
        mode: ModeArg,

        #[command(flatten)]
        local: LocalArgs,
    },

    /// Finalize the pending installation after a reboot.
    Complete,

    /// Show the current and pending targets.
    Status,

    /// Register secondary ECUs with the server, then list the targets for
    /// the device and its secondaries.
    SetSecondaries {
        /// `<serial>:<hardware-id>:<target-name>`, once per ECU.
        #[arg(long = "ecu", value_parser = parse_ecu, required = true)]
        ecus: Vec<SecondaryEcu>,
    },

    /// Print an app manifest from the container registry.
    Manifest {
        /// `<registry>/<namespace>/<app>@sha256:<hash>`
        uri: String,
    },

    /// Download a content-addressed blob from the container registry.
    ///
    /// The file at `dest` exists only if its size and digest check out.
    FetchBlob {
        /// `<registry>/<namespace>/<app>@sha256:<hash>`
        uri: String,

        /// Where to write the blob.
        dest: PathBuf,

        /// Expected size in bytes.
        #[arg(long)]
        size: u64,
    },
}

/// An update medium in place of the server.
#[derive(Debug, Args)]
pub struct LocalArgs {
    /// Directory holding `targets.json`.
    #[arg(long)]
    local_metadata: Option<PathBuf>,

    /// Tree-store repo on the medium. Defaults to `<local-metadata>/ostree_repo`.
    #[arg(long, requires = "local_metadata")]
    local_tree_repo: Option<PathBuf>,

    /// App blob store on the medium. Defaults to `<local-metadata>/apps`.
    #[arg(long, requires = "local_metadata")]
    local_apps: Option<PathBuf>,
}

impl LocalArgs {
    fn source(&self) -> Option<LocalSource> {
        let metadata_dir = self.local_metadata.clone()?;
        Some(LocalSource {
            tree_repo: self
                .local_tree_repo
                .clone()
                .unwrap_or_else(|| metadata_dir.join("ostree_repo")),
            apps_dir: self
                .local_apps
                .clone()
                .unwrap_or_else(|| metadata_dir.join("apps")),
            metadata_dir,
        })
    }
}

fn parse_ecu(value: &str) -> Result<SecondaryEcu, String> {
    let mut parts = value.splitn(3, ':');
    let (Some(serial), Some(hwid), Some(target_name)) = (parts.next(), parts.next(), parts.next()) else {
        return Err("expected <serial>:<hardware-id>:<target-name>".to_string());
    };
    if serial.is_empty() || hwid.is_empty() || target_name.is_empty() {
        return Err("serial, hardware id and target name must not be empty".to_string());
    }
    Ok(SecondaryEcu {
        serial: serial.to_string(),
        hwid: hwid.to_string(),
        target_name: target_name.to_string(),
    })
}

/// CLI-facing install mode, mapped to the domain `InstallMode`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum ModeArg {
    /// Deploy the rootfs and start apps in one go.
    All,
    /// Deploy the rootfs now, start apps on `complete`.
    DelayAppInstall,
}

impl ModeArg {
    fn to_domain(self) -> InstallMode {
        match self {
            Self::All => InstallMode::All,
            Self::DelayAppInstall => InstallMode::RootfsOnly,
        }
    }
}

/// Run the parsed command, returning an error message if it could not start.
pub fn run(cli: &Cli, config: Config) -> Result<StatusCode, String> {
    let http: Rc<dyn HttpTransport> = Rc::new(
        UreqTransport::new(HTTP_TIMEOUT)
            .with_header("User-Agent", concat!("ota-agent/", env!("CARGO_PKG_VERSION"))),
    );

    match &cli.command {
        Command::Check { local } => {
            let client = connect(config, http)?;
            Ok(cmd_check(&client, local.source().as_ref()))
        }
        Command::Install {
            version,
            name,
            force,
            mode,
            local,
        } => {
            let client = connect(config, http)?;
            let request = InstallRequest {
                version: *version,
                name: name.clone(),
                force_downgrade: *force,
                mode: mode.to_domain(),
                local: local.source(),
            };
            Ok(orchestrator::install(&client, &request))
        }
        Command::Complete => {
            let client = connect(config, http)?;
            Ok(orchestrator::complete_install(&client))
        }
        Command::Status => {
            let client = connect(config, http)?;
            println!("{}", format_status(&client.current(), client.pending().as_ref()));
            Ok(StatusCode::Ok)
        }
        Command::SetSecondaries { ecus } => {
            let client = connect(config, http)?;
            let result = client.set_secondaries(ecus);
            if !result.is_ok() {
                tracing::error!("failed to register secondary ECUs: {}", result.description);
                return Ok(StatusCode::UnknownError);
            }
            Ok(cmd_check(&client, None))
        }
        Command::Manifest { uri } => {
            let registry = registry_client(&config, http);
            cmd_manifest(&registry, uri)
        }
        Command::FetchBlob { uri, dest, size } => {
            let registry = registry_client(&config, http);
            cmd_fetch_blob(&registry, uri, dest, *size)
        }
    }
}

fn connect(config: Config, http: Rc<dyn HttpTransport>) -> Result<Client, String> {
    let client = build_client(config, http)?;
    client.set_initial_target_if_needed();
    Ok(client)
}

fn registry_client(config: &Config, http: Rc<dyn HttpTransport>) -> RegistryClient {
    let registry = RegistryClient::new(
        http,
        &config.pacman.ostree_server,
        &config.registry.auth_creds_endpoint,
    );
    tracing::debug!(endpoint = registry.auth_creds_endpoint(), "registry credentials endpoint");
    registry
}

/// Wire the production collaborators.
fn build_client(config: Config, http: Rc<dyn HttpTransport>) -> Result<Client, String> {
    let storage = Storage::new(&config.storage.path)
        .map_err(|e| format!("failed to initialize storage at {}: {e}", config.storage.path.display()))?;

    let pacman = &config.pacman;
    let tree_store: Rc<dyn TreeStore> = Rc::new(OstreeCli::new(pacman.sysroot.clone(), pacman.os.clone()));
    let fw_env = FwEnv::new(
        &config.bootloader.get_env_cmd,
        &config.bootloader.set_env_cmd,
        FwEnv::deploy_root(&pacman.sysroot, &pacman.os),
    );
    let bootloader = Rc::new(Bootloader::new(Box::new(fw_env)));
    let metadata: Rc<dyn MetadataProvider> = Rc::new(JsonTargetsProvider::remote(
        http.clone(),
        &config.server.url,
        &config.storage.path,
    ));
    let apps: Rc<dyn AppEngine> = if config.apps_enabled() {
        Rc::new(BlobStoreApps::new(
            config.storage.apps_root.clone(),
            BlobSource::Registry(registry_client(&config, http.clone())),
        ))
    } else {
        Rc::new(NoApps)
    };

    Ok(Client::new(
        config,
        storage,
        Collaborators {
            metadata,
            tree_store,
            bootloader,
            http,
            apps,
        },
    ))
}

fn cmd_check(client: &Client, local: Option<&LocalSource>) -> StatusCode {
    let result = match local {
        Some(source) => client.check_in_local(source),
        None => client.check_in(),
    };
    if result.is_ok() {
        println!("{}", format_targets(result.targets(), &client.current()));
    }
    result.status.into()
}

fn cmd_manifest(registry: &RegistryClient, uri: &str) -> Result<StatusCode, String> {
    let uri = ContentUri::parse(uri).map_err(|e| format!("invalid manifest URI {uri}: {e}"))?;
    match registry.get_manifest(&uri, MANIFEST_FORMAT) {
        Ok(manifest) => {
            let json = serde_json::to_string_pretty(&manifest)
                .map_err(|e| format!("failed to serialize manifest: {e}"))?;
            println!("{json}");
            Ok(StatusCode::Ok)
        }
        Err(e) => Ok(fetch_failure(&uri, &e)),
    }
}

fn fetch_failure(uri: &ContentUri, e: &FetchError) -> StatusCode {
    if let FetchError::DigestMismatch { .. } | FetchError::SizeMismatch { .. } = e {
        tracing::error!(%uri, "content failed verification: {e}");
        StatusCode::DownloadFailureVerificationFailed
    } else {
        tracing::error!(%uri, "failed to download: {e}");
        StatusCode::DownloadFailure
    }
}

fn cmd_fetch_blob(registry: &RegistryClient, uri: &str, dest: &Path, size: u64) -> Result<StatusCode, String> {
    let uri = ContentUri::parse(uri).map_err(|e| format!("invalid blob URI {uri}: {e}"))?;
    let mut last_percent = None;
    let mut progress = |received: u64, expected: u64| {
        let percent = received.saturating_mul(10).checked_div(expected);
        if percent != last_percent {
            last_percent = percent;
            eprintln!("{}", format_progress(received, expected));
        }
    };

    match registry.download_blob(&uri, dest, size, &mut progress) {
        Ok(()) => {
            println!("{}", dest.display());
            Ok(StatusCode::Ok)
        }
        Err(e) => Ok(fetch_failure(&uri, &e)),
    }
}
