//! Remotes: candidate sources for a tree-store pull.

use std::path::PathBuf;

/// TLS client material used when registering a remote with the tree store.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TlsKeys {
    pub ca_file: Option<PathBuf>,
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
}

/// A place a rootfs commit can be pulled from.
///
/// Remotes are tried in order; the first successful pull wins.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Remote {
    pub name: String,
    pub base_url: String,
    /// Extra request headers, in the order they are sent.
    pub headers: Vec<(String, String)>,
    pub keys: Option<TlsKeys>,
    /// Whether the remote is already registered with the tree store.
    pub is_set: bool,
}
