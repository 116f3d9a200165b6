//! In-memory collaborators for unit tests.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::path::Path;
use std::rc::Rc;

use tempfile::TempDir;

use crate::apps::{AppEngine, AppError};
use crate::bootloader::{Bootloader, BootloaderError, BootloaderIo};
use crate::client::{Client, Collaborators};
use crate::config::Config;
use crate::http::{ChunkSink, Header, HttpError, HttpResponse, HttpTransport};
use crate::metadata::{MetadataProvider, RefreshStatus, TargetRecord};
use crate::model::{Remote, Target, TlsKeys};
use crate::storage::Storage;
use crate::tree_store::{DeployOutcome, TreeStore, TreeStoreError};

// ── HTTP ──

#[derive(Debug, Clone)]
pub struct RecordedRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<Header>,
    pub body: Vec<u8>,
}

/// Serves canned responses by longest matching URL prefix.
#[derive(Default)]
pub struct FakeHttp {
    get_routes: RefCell<Vec<(String, HttpResponse)>>,
    post_routes: RefCell<Vec<(String, HttpResponse)>>,
    put_routes: RefCell<Vec<(String, HttpResponse)>>,
    requests: RefCell<Vec<RecordedRequest>>,
}

impl FakeHttp {
    const CHUNK: usize = 4;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn respond_get(&self, url_prefix: &str, status: u16, body: Vec<u8>) {
        self.get_routes
            .borrow_mut()
            .push((url_prefix.to_string(), HttpResponse::new(status, body)));
    }

    pub fn respond_post(&self, url_prefix: &str, status: u16, body: Vec<u8>) {
        self.post_routes
            .borrow_mut()
            .push((url_prefix.to_string(), HttpResponse::new(status, body)));
    }

    pub fn respond_put(&self, url_prefix: &str, status: u16, body: Vec<u8>) {
        self.put_routes
            .borrow_mut()
            .push((url_prefix.to_string(), HttpResponse::new(status, body)));
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.borrow().clone()
    }

    pub fn requests_to(&self, url_prefix: &str) -> Vec<RecordedRequest> {
        self.requests()
            .into_iter()
            .filter(|r| r.url.starts_with(url_prefix))
            .collect()
    }

    fn record(&self, method: &'static str, url: &str, headers: &[Header], body: &[u8]) {
        self.requests.borrow_mut().push(RecordedRequest {
            method,
            url: url.to_string(),
            headers: headers.to_vec(),
            body: body.to_vec(),
        });
    }

    fn route(routes: &RefCell<Vec<(String, HttpResponse)>>, url: &str) -> Result<HttpResponse, HttpError> {
        routes
            .borrow()
            .iter()
            .filter(|(prefix, _)| url.starts_with(prefix.as_str()))
            .max_by_key(|(prefix, _)| prefix.len())
            .map(|(_, resp)| resp.clone())
            .ok_or_else(|| HttpError::Transport {
                url: url.to_string(),
                reason: "connection refused".to_string(),
            })
    }
}

impl HttpTransport for FakeHttp {
    fn get(&self, url: &str, headers: &[Header], max_bytes: u64) -> Result<HttpResponse, HttpError> {
        self.record("GET", url, headers, &[]);
        let resp = Self::route(&self.get_routes, url)?;
        if resp.body.len() as u64 > max_bytes {
            return Err(HttpError::TooLarge {
                url: url.to_string(),
                limit: max_bytes,
            });
        }
        Ok(resp)
    }

    fn post(&self, url: &str, headers: &[Header], body: &[u8]) -> Result<HttpResponse, HttpError> {
        self.record("POST", url, headers, body);
        Self::route(&self.post_routes, url)
    }

    fn put(&self, url: &str, headers: &[Header], body: &[u8]) -> Result<HttpResponse, HttpError> {
        self.record("PUT", url, headers, body);
        Self::route(&self.put_routes, url)
    }

    fn download(
        &self,
        url: &str,
        headers: &[Header],
        sink: &mut ChunkSink<'_>,
    ) -> Result<HttpResponse, HttpError> {
        self.record("GET", url, headers, &[]);
        let resp = Self::route(&self.get_routes, url)?;
        if !resp.is_ok() {
            return Ok(resp);
        }
        for chunk in resp.body.chunks(Self::CHUNK) {
            sink(chunk).map_err(|reason| HttpError::Aborted {
                url: url.to_string(),
                reason,
            })?;
        }
        Ok(HttpResponse::new(resp.status, Vec::new()))
    }
}

/// Registry credential and token endpoints for `host`, matching a client
/// derived from `https://ota.example.io/treehub`.
pub fn registry_routes(http: &FakeHttp, host: &str) {
    http.respond_get(
        "https://ota.example.io/hub-creds/",
        200,
        br#"{"Username":"device","Secret":"s3cret"}"#.to_vec(),
    );
    http.respond_get(
        &format!("https://{host}/token-auth/"),
        200,
        br#"{"token":"test-token"}"#.to_vec(),
    );
}

// ── Bootloader ──

#[derive(Default)]
struct BootloaderState {
    env: HashMap<String, String>,
    version_files: HashMap<String, String>,
}

/// Bootloader environment in memory. Clones share state.
#[derive(Clone, Default)]
pub struct FakeBootloader {
    state: Rc<RefCell<BootloaderState>>,
}

impl FakeBootloader {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_env(&self, name: &str, value: &str) {
        self.state
            .borrow_mut()
            .env
            .insert(name.to_string(), value.to_string());
    }

    pub fn env(&self, name: &str) -> Option<String> {
        self.state.borrow().env.get(name).cloned()
    }

    pub fn set_version_file(&self, hash: &str, contents: &str) {
        self.state
            .borrow_mut()
            .version_files
            .insert(hash.to_string(), contents.to_string());
    }
}

impl BootloaderIo for FakeBootloader {
    fn can_read_env(&self) -> bool {
        true
    }

    fn read_env(&self, name: &str) -> Result<String, BootloaderError> {
        self.env(name).ok_or_else(|| BootloaderError::Command {
            command: format!("fw_printenv {name}"),
            stderr: format!("## Error: \"{name}\" not defined"),
        })
    }

    fn write_env(&self, name: &str, value: &str) -> Result<(), BootloaderError> {
        self.set_env(name, value);
        Ok(())
    }

    fn read_version_file(&self, hash: &str) -> io::Result<String> {
        self.state
            .borrow()
            .version_files
            .get(hash)
            .cloned()
            .ok_or_else(|| io::Error::from(io::ErrorKind::NotFound))
    }
}

// ── Tree store ──

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pull {
    pub remote: String,
    pub url: String,
    pub hash: String,
    pub headers: Vec<Header>,
}

#[derive(Default)]
struct TreeState {
    current: String,
    pending: Option<String>,
    pull_errors: HashMap<String, String>,
    deploy_error: Option<String>,
    pulls: Vec<Pull>,
    deploys: Vec<String>,
    remotes: Vec<(String, String, Option<TlsKeys>)>,
}

/// A tree store that deploys the way `ostree admin` does, without a disk image.
pub struct FakeTreeStore {
    sysroot: TempDir,
    state: RefCell<TreeState>,
}

impl FakeTreeStore {
    pub fn new(current: &str) -> Self {
        Self {
            sysroot: TempDir::new().expect("temp sysroot"),
            state: RefCell::new(TreeState {
                current: current.to_string(),
                ..TreeState::default()
            }),
        }
    }

    /// Make pulls from remotes whose URL starts with `url_prefix` fail.
    pub fn fail_pull(&self, url_prefix: &str, error: &str) {
        self.state
            .borrow_mut()
            .pull_errors
            .insert(url_prefix.to_string(), error.to_string());
    }

    pub fn fail_deploy(&self, error: &str) {
        self.state.borrow_mut().deploy_error = Some(error.to_string());
    }

    pub fn clear_deploy_failure(&self) {
        self.state.borrow_mut().deploy_error = None;
    }

    pub fn set_pending(&self, hash: Option<&str>) {
        self.state.borrow_mut().pending = hash.map(String::from);
    }

    /// Boot into the pending deployment, if any.
    pub fn reboot(&self) {
        let mut state = self.state.borrow_mut();
        if let Some(pending) = state.pending.take() {
            state.current = pending;
        }
    }

    /// The bootloader gave up on the pending deployment.
    pub fn reboot_with_rollback(&self) {
        self.state.borrow_mut().pending = None;
    }

    pub fn current(&self) -> String {
        self.state.borrow().current.clone()
    }

    pub fn pending(&self) -> Option<String> {
        self.state.borrow().pending.clone()
    }

    pub fn pulls(&self) -> Vec<Pull> {
        self.state.borrow().pulls.clone()
    }

    pub fn deploys(&self) -> Vec<String> {
        self.state.borrow().deploys.clone()
    }

    pub fn remotes(&self) -> Vec<(String, String, Option<TlsKeys>)> {
        self.state.borrow().remotes.clone()
    }
}

impl TreeStore for FakeTreeStore {
    fn pull(&self, remote: &Remote, hash: &str) -> Result<(), TreeStoreError> {
        let mut state = self.state.borrow_mut();
        state.pulls.push(Pull {
            remote: remote.name.clone(),
            url: remote.base_url.clone(),
            hash: hash.to_string(),
            headers: remote.headers.clone(),
        });
        let error = state
            .pull_errors
            .iter()
            .find(|(prefix, _)| remote.base_url.starts_with(prefix.as_str()))
            .map(|(_, e)| e.clone());
        match error {
            Some(stderr) => Err(TreeStoreError::Command {
                command: format!("ostree pull {} {hash}", remote.name),
                stderr,
            }),
            None => Ok(()),
        }
    }

    fn current_hash(&self) -> Result<String, TreeStoreError> {
        Ok(self.current())
    }

    fn pending_hash(&self) -> Result<Option<String>, TreeStoreError> {
        Ok(self.pending())
    }

    fn deploy(&self, hash: &str) -> DeployOutcome {
        let mut state = self.state.borrow_mut();
        state.deploys.push(hash.to_string());
        if let Some(e) = &state.deploy_error {
            return DeployOutcome::Failed(e.clone());
        }
        if state.current == hash {
            if state.pending.take().is_some() {
                return DeployOutcome::NeedsCompletion;
            }
            return DeployOutcome::Ok;
        }
        state.pending = Some(hash.to_string());
        DeployOutcome::NeedsCompletion
    }

    fn add_remote(&self, name: &str, url: &str, keys: Option<&TlsKeys>) -> Result<(), TreeStoreError> {
        self.state
            .borrow_mut()
            .remotes
            .push((name.to_string(), url.to_string(), keys.cloned()));
        Ok(())
    }

    fn sysroot(&self) -> &Path {
        self.sysroot.path()
    }
}

// ── Metadata ──

struct MetadataState {
    status: RefreshStatus,
    targets: Vec<TargetRecord>,
}

pub struct FakeMetadata {
    state: RefCell<MetadataState>,
}

impl Default for FakeMetadata {
    fn default() -> Self {
        Self {
            state: RefCell::new(MetadataState {
                status: RefreshStatus::Ok,
                targets: Vec::new(),
            }),
        }
    }
}

impl FakeMetadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_status(&self, status: RefreshStatus) {
        self.state.borrow_mut().status = status;
    }

    pub fn add(&self, record: TargetRecord) {
        self.state.borrow_mut().targets.push(record);
    }
}

impl MetadataProvider for FakeMetadata {
    fn refresh(&self) -> RefreshStatus {
        self.state.borrow().status
    }

    fn all_targets(&self) -> Vec<TargetRecord> {
        self.state.borrow().targets.clone()
    }
}

/// A metadata record for `hwid` with the given custom fields merged in.
pub fn record(name: &str, hash: &str, version: &str, hwid: &str, extra: serde_json::Value) -> TargetRecord {
    let mut custom = serde_json::json!({ "version": version, "hardwareIds": [hwid] });
    if let (Some(custom), serde_json::Value::Object(extra)) = (custom.as_object_mut(), extra) {
        custom.extend(extra);
    }
    TargetRecord {
        name: name.to_string(),
        hash: hash.to_string(),
        custom_version: version.to_string(),
        hardware_ids: vec![hwid.to_string()],
        custom,
    }
}

// ── Apps ──

#[derive(Default)]
struct AppsState {
    in_sync: bool,
    fetch_error: Option<String>,
    activate_error: Option<String>,
    fetched: Vec<String>,
    activated: Vec<String>,
}

pub struct FakeApps {
    state: RefCell<AppsState>,
}

impl Default for FakeApps {
    fn default() -> Self {
        Self {
            state: RefCell::new(AppsState {
                in_sync: true,
                ..AppsState::default()
            }),
        }
    }
}

impl FakeApps {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_in_sync(&self, in_sync: bool) {
        self.state.borrow_mut().in_sync = in_sync;
    }

    pub fn fail_fetch(&self, error: &str) {
        self.state.borrow_mut().fetch_error = Some(error.to_string());
    }

    pub fn fail_activate(&self, error: &str) {
        self.state.borrow_mut().activate_error = Some(error.to_string());
    }

    pub fn fetched(&self) -> Vec<String> {
        self.state.borrow().fetched.clone()
    }

    pub fn activated(&self) -> Vec<String> {
        self.state.borrow().activated.clone()
    }
}

impl AppEngine for FakeApps {
    fn fetch(&self, target: &Target) -> Result<(), AppError> {
        let mut state = self.state.borrow_mut();
        state.fetched.push(target.name.clone());
        match &state.fetch_error {
            Some(e) => Err(AppError::Missing(e.clone())),
            None => Ok(()),
        }
    }

    fn activate(&self, target: &Target) -> Result<(), AppError> {
        let mut state = self.state.borrow_mut();
        if let Some(e) = &state.activate_error {
            return Err(AppError::Io(io::Error::other(e.clone())));
        }
        state.activated.push(target.name.clone());
        state.in_sync = true;
        Ok(())
    }

    fn in_sync(&self, _target: &Target) -> bool {
        self.state.borrow().in_sync
    }
}

// ── Client harness ──

/// A client wired to fakes, with state in a temp dir.
pub struct Harness {
    pub config: Config,
    pub tree: Rc<FakeTreeStore>,
    pub metadata: Rc<FakeMetadata>,
    pub boot: FakeBootloader,
    pub http: Rc<FakeHttp>,
    pub apps: Rc<FakeApps>,
    state: TempDir,
}

impl Harness {
    pub const HWID: &'static str = "rpi";
    pub const SERVER: &'static str = "https://ota.example.io/treehub";

    pub fn new(current: &str) -> Self {
        let state = TempDir::new().expect("temp state dir");
        let mut config = Config::default();
        config.provision.primary_hardware_id = Self::HWID.to_string();
        config.pacman.ostree_server = Self::SERVER.to_string();
        config.storage.path = state.path().join("sota");
        config.storage.apps_root = state.path().join("apps");
        Self {
            config,
            tree: Rc::new(FakeTreeStore::new(current)),
            metadata: Rc::new(FakeMetadata::new()),
            boot: FakeBootloader::new(),
            http: Rc::new(FakeHttp::new()),
            apps: Rc::new(FakeApps::new()),
            state,
        }
    }

    pub fn storage(&self) -> Storage {
        Storage::new(&self.config.storage.path).expect("storage")
    }

    pub fn state_dir(&self) -> &Path {
        self.state.path()
    }

    pub fn client(&self) -> Client {
        Client::new(
            self.config.clone(),
            self.storage(),
            Collaborators {
                metadata: self.metadata.clone(),
                tree_store: self.tree.clone(),
                bootloader: Rc::new(Bootloader::new(Box::new(self.boot.clone()))),
                http: self.http.clone(),
                apps: self.apps.clone(),
            },
        )
    }
}
