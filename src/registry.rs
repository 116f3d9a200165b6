//! Content-addressed fetching from a container registry.
//!
//! Artifacts are located by `<registry-host>/<namespace>/<app>@sha256:<hash>`.
//! Nothing fetched here is handed to a caller before its digest (and, for
//! blobs, its size) has been checked against the locator. A blob that fails
//! verification never survives on disk.
//!
//! Access is two-tier: basic credentials from the device gateway are traded
//! for a short-lived bearer token scoped to one repository pull. Tokens are
//! requested per call and never cached.

use std::fmt;
use std::fs;
use std::io::{self, Write};
use std::path::Path;
use std::rc::Rc;

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use sha2::{Digest, Sha256};

use crate::http::{Header, HttpError, HttpTransport};

/// Default location of registry credentials when none can be derived.
pub const DEFAULT_AUTH_CREDS_ENDPOINT: &str = "https://ota-lite.foundries.io:8443/hub-creds/";

/// Upper bound on a manifest body.
pub const MANIFEST_MAX_SIZE: u64 = 2 * 1024 * 1024;

/// Upper bound on credential and token responses.
pub const AUTH_MATERIAL_MAX_SIZE: u64 = 16 * 1024;

/// Media type requested for application manifests.
pub const MANIFEST_FORMAT: &str = "application/vnd.oci.image.manifest.v1+json";

/// Why a content locator or digest was rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("unsupported hash type: {0}")]
    UnsupportedHashType(String),

    #[error("invalid hash size: {0}")]
    InvalidHashSize(String),

    #[error("hash contains non-hex characters: {0}")]
    InvalidHashChars(String),

    #[error("'@' not found exactly once in {0}")]
    MissingDigest(String),

    #[error("artifact name not found in {0}")]
    MissingArtifact(String),

    #[error("namespace not found in {0}")]
    MissingNamespace(String),

    #[error("registry host not found in {0}")]
    MissingRegistryHost(String),
}

/// Errors from registry fetches.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    #[error(transparent)]
    Http(#[from] HttpError),

    #[error("failed to fetch {what}: {status}")]
    Status { what: String, status: String },

    #[error("registry authentication failed: {0}")]
    Auth(String),

    #[error("size of {what} exceeds the maximum allowed: {actual} > {max}")]
    TooLarge { what: String, actual: u64, max: u64 },

    #[error("digest of {what} does not match: {actual} != {expected}")]
    DigestMismatch {
        what: String,
        expected: String,
        actual: String,
    },

    #[error("size of {what} does not match: {actual} != {expected}")]
    SizeMismatch {
        what: String,
        expected: u64,
        actual: u64,
    },

    #[error(transparent)]
    Uri(#[from] UriError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = core::result::Result<T, FetchError>;

// ── Locators ──

/// A validated `sha256:<64 hex>` digest, normalized to lowercase.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct HashedDigest {
    digest: String,
}

impl HashedDigest {
    pub const TYPE: &'static str = "sha256:";

    pub fn parse(raw: &str) -> core::result::Result<Self, UriError> {
        let digest = raw.to_lowercase();
        let Some(hash) = digest.strip_prefix(Self::TYPE) else {
            return Err(UriError::UnsupportedHashType(raw.to_string()));
        };
        if hash.len() != 64 {
            return Err(UriError::InvalidHashSize(raw.to_string()));
        }
        if !hash.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(UriError::InvalidHashChars(raw.to_string()));
        }
        Ok(Self { digest })
    }

    /// The 64-character hex hash.
    pub fn hash(&self) -> &str {
        &self.digest[Self::TYPE.len()..]
    }

    pub fn short_hash(&self) -> &str {
        &self.hash()[..7]
    }
}

impl fmt::Display for HashedDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.digest)
    }
}

/// A parsed content locator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentUri {
    pub digest: HashedDigest,
    pub app: String,
    pub namespace: String,
    /// `<namespace>/<app>`.
    pub repo: String,
    pub registry_host: String,
}

impl ContentUri {
    pub fn parse(uri: &str) -> core::result::Result<Self, UriError> {
        let mut at = uri.match_indices('@');
        let (Some((split_pos, _)), None) = (at.next(), at.next()) else {
            return Err(UriError::MissingDigest(uri.to_string()));
        };
        let name = &uri[..split_pos];
        let digest = HashedDigest::parse(&uri[split_pos + 1..])?;

        let Some(app_pos) = name.rfind('/') else {
            return Err(UriError::MissingArtifact(uri.to_string()));
        };
        let app = &name[app_pos + 1..];
        if app.is_empty() {
            return Err(UriError::MissingArtifact(uri.to_string()));
        }

        let Some(namespace_pos) = name[..app_pos].rfind('/') else {
            return Err(UriError::MissingNamespace(uri.to_string()));
        };
        let namespace = &name[namespace_pos + 1..app_pos];
        if namespace.is_empty() {
            return Err(UriError::MissingNamespace(uri.to_string()));
        }

        let registry_host = &name[..namespace_pos];
        if registry_host.is_empty() {
            return Err(UriError::MissingRegistryHost(uri.to_string()));
        }

        tracing::trace!(app, namespace, registry_host, %digest, "parsed content locator");
        Ok(Self {
            digest,
            app: app.to_string(),
            namespace: namespace.to_string(),
            repo: name[namespace_pos + 1..].to_string(),
            registry_host: registry_host.to_string(),
        })
    }

    /// A locator for another object in the same repository.
    pub fn with_digest(&self, digest: HashedDigest) -> Self {
        Self {
            digest,
            ..self.clone()
        }
    }
}

impl fmt::Display for ContentUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}@{}", self.registry_host, self.repo, self.digest)
    }
}

// ── Client ──

/// Fetches manifests and blobs with digest verification.
pub struct RegistryClient {
    http: Rc<dyn HttpTransport>,
    auth_creds_endpoint: String,
}

impl RegistryClient {
    /// `tree_store_server` is used to derive the credentials endpoint, which
    /// shares its base URL: `https://host/treehub` → `https://host/hub-creds/`.
    /// An explicit endpoint wins.
    pub fn new(http: Rc<dyn HttpTransport>, tree_store_server: &str, explicit_endpoint: &str) -> Self {
        let auth_creds_endpoint = if explicit_endpoint.is_empty() {
            tree_store_server
                .find("treehub")
                .map(|pos| format!("{}hub-creds/", &tree_store_server[..pos]))
                .unwrap_or_else(|| DEFAULT_AUTH_CREDS_ENDPOINT.to_string())
        } else {
            explicit_endpoint.to_string()
        };
        Self {
            http,
            auth_creds_endpoint,
        }
    }

    pub fn auth_creds_endpoint(&self) -> &str {
        &self.auth_creds_endpoint
    }

    fn manifest_url(uri: &ContentUri) -> String {
        format!("https://{}/v2/{}/manifests/{}", uri.registry_host, uri.repo, uri.digest)
    }

    fn blob_url(uri: &ContentUri) -> String {
        format!("https://{}/v2/{}/blobs/{}", uri.registry_host, uri.repo, uri.digest)
    }

    /// Fetch the manifest at `uri`, verifying its digest before parsing.
    pub fn get_manifest(&self, uri: &ContentUri, format: &str) -> Result<serde_json::Value> {
        let body = self.fetch_manifest(uri, format)?;
        Ok(serde_json::from_slice(&body)?)
    }

    /// Fetch the raw manifest bytes at `uri`, verified against its digest.
    pub fn fetch_manifest(&self, uri: &ContentUri, format: &str) -> Result<Vec<u8>> {
        let url = Self::manifest_url(uri);
        tracing::debug!(%url, "downloading manifest");

        let headers = vec![
            self.bearer_auth_header(uri)?,
            ("accept".to_string(), format.to_string()),
        ];
        let resp = self.http.get(&url, &headers, MANIFEST_MAX_SIZE)?;
        if !resp.is_ok() {
            return Err(FetchError::Status {
                what: format!("manifest {url}"),
                status: resp.status_str(),
            });
        }
        let actual = resp.body.len() as u64;
        if actual > MANIFEST_MAX_SIZE {
            return Err(FetchError::TooLarge {
                what: "manifest".to_string(),
                actual,
                max: MANIFEST_MAX_SIZE,
            });
        }

        let received = hex::encode(Sha256::digest(&resp.body));
        if received != uri.digest.hash() {
            return Err(FetchError::DigestMismatch {
                what: "manifest".to_string(),
                expected: uri.digest.hash().to_string(),
                actual: received,
            });
        }
        Ok(resp.body)
    }

    /// Stream the blob at `uri` into `dest`, hashing as it arrives.
    ///
    /// On any failure `dest` is removed: the file either exists complete and
    /// verified, or not at all. `progress` receives `(received, expected)`.
    pub fn download_blob(
        &self,
        uri: &ContentUri,
        dest: &Path,
        expected_size: u64,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        let result = self.try_download_blob(uri, dest, expected_size, progress);
        if result.is_err() {
            match fs::remove_file(dest) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => tracing::error!(path = %dest.display(), "failed to remove partial blob: {e}"),
            }
        }
        result
    }

    fn try_download_blob(
        &self,
        uri: &ContentUri,
        dest: &Path,
        expected_size: u64,
        progress: &mut dyn FnMut(u64, u64),
    ) -> Result<()> {
        let url = Self::blob_url(uri);
        tracing::debug!(%url, "downloading blob");
        let headers = vec![self.bearer_auth_header(uri)?];

        let mut file = fs::File::create(dest)?;
        let mut hasher = Sha256::new();
        let mut written: u64 = 0;

        let resp = {
            let mut sink = |chunk: &[u8]| -> core::result::Result<(), String> {
                let received = written + chunk.len() as u64;
                if received > expected_size {
                    return Err(format!(
                        "received data size exceeds the expected size: {received} > {expected_size}"
                    ));
                }
                file.write_all(chunk).map_err(|e| e.to_string())?;
                hasher.update(chunk);
                written = received;
                progress(written, expected_size);
                Ok(())
            };
            self.http.download(&url, &headers, &mut sink)?
        };
        if !resp.is_ok() {
            return Err(FetchError::Status {
                what: format!("blob {url}"),
                status: resp.status_str(),
            });
        }
        file.sync_all()?;
        drop(file);

        if written != expected_size {
            return Err(FetchError::SizeMismatch {
                what: "blob".to_string(),
                expected: expected_size,
                actual: written,
            });
        }
        let received = hex::encode(hasher.finalize());
        if received != uri.digest.hash() {
            return Err(FetchError::DigestMismatch {
                what: "blob".to_string(),
                expected: uri.digest.hash().to_string(),
                actual: received,
            });
        }
        Ok(())
    }

    /// Exchange device credentials for a basic authorization header.
    fn basic_auth_header(&self) -> Result<Header> {
        tracing::debug!(endpoint = %self.auth_creds_endpoint, "getting registry credentials");
        let resp = self
            .http
            .get(&self.auth_creds_endpoint, &[], AUTH_MATERIAL_MAX_SIZE)?;
        if !resp.is_ok() {
            return Err(FetchError::Auth(format!(
                "failed to get credentials from {}: {}",
                self.auth_creds_endpoint,
                resp.status_str()
            )));
        }
        let creds: serde_json::Value = resp.json()?;
        let username = creds["Username"].as_str().unwrap_or_default();
        let secret = creds["Secret"].as_str().unwrap_or_default();
        if username.is_empty() || secret.is_empty() {
            return Err(FetchError::Auth("got invalid registry credentials".to_string()));
        }
        tracing::debug!(username, "got registry credentials");
        let encoded = STANDARD.encode(format!("{username}:{secret}"));
        Ok(("authorization".to_string(), format!("basic {encoded}")))
    }

    /// Obtain a bearer token scoped to pulling `uri`'s repository.
    fn bearer_auth_header(&self, uri: &ContentUri) -> Result<Header> {
        let url = format!(
            "https://{}/token-auth/?service=registry&scope=repository:{}:pull",
            uri.registry_host, uri.repo
        );
        tracing::debug!(%url, "getting registry token");
        let basic = self.basic_auth_header()?;
        let resp = self.http.get(&url, &[basic], AUTH_MATERIAL_MAX_SIZE)?;
        if !resp.is_ok() {
            return Err(FetchError::Auth(format!(
                "failed to get a token from {url}: {}",
                resp.status_str()
            )));
        }
        let body: serde_json::Value = resp.json()?;
        let token = body["token"].as_str().unwrap_or_default();
        if token.is_empty() {
            return Err(FetchError::Auth("got an empty registry token".to_string()));
        }
        Ok(("authorization".to_string(), format!("bearer {token}")))
    }
}
