//! Targets: the versioned artifacts a device can be told to run.

use std::fmt;

use serde::{Deserialize, Serialize};

/// An identified, versioned software artifact: a rootfs commit plus an
/// optional set of applications described in `custom`.
///
/// Equality is hash-based: two targets with different names but the same
/// rootfs hash are considered the same installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Target {
    pub name: String,
    pub hash: String,
    pub version: i64,
    #[serde(default)]
    pub custom: serde_json::Value,
}

/// A reference to an application bundled with a target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppRef {
    pub name: String,
    pub uri: String,
}

impl Target {
    const UNKNOWN: &'static str = "unknown";
    const INITIAL_PREFIX: &'static str = "initial-target";

    pub fn new(
        name: impl Into<String>,
        hash: impl Into<String>,
        version: i64,
        custom: serde_json::Value,
    ) -> Self {
        Self {
            name: name.into(),
            hash: hash.into(),
            version,
            custom,
        }
    }

    /// The "no target" sentinel.
    pub fn unknown() -> Self {
        Self::new(Self::UNKNOWN, "", -1, serde_json::Value::Null)
    }

    /// A target synthesized for a rootfs that was never installed through
    /// the agent (factory image), so only its hash is known.
    pub fn initial(hash: &str, hardware_id: &str) -> Self {
        Self::new(
            format!("{}-{hardware_id}", Self::INITIAL_PREFIX),
            hash,
            -1,
            serde_json::json!({ "hardwareIds": [hardware_id] }),
        )
    }

    pub fn is_unknown(&self) -> bool {
        self.name == Self::UNKNOWN && self.hash.is_empty()
    }

    pub fn is_initial(&self) -> bool {
        self.name.starts_with(Self::INITIAL_PREFIX)
    }

    /// Hardware ids this target is built for, in declaration order.
    pub fn hardware_ids(&self) -> Vec<&str> {
        string_list(&self.custom, "hardwareIds")
    }

    /// Tags the target was published under.
    pub fn tags(&self) -> Vec<&str> {
        string_list(&self.custom, "tags")
    }

    /// Applications listed under `docker_compose_apps`, sorted by name.
    pub fn apps(&self) -> Vec<AppRef> {
        let Some(apps) = self
            .custom
            .get("docker_compose_apps")
            .and_then(serde_json::Value::as_object)
        else {
            return Vec::new();
        };
        let mut refs: Vec<AppRef> = apps
            .iter()
            .filter_map(|(name, app)| {
                let uri = app.get("uri")?.as_str()?;
                Some(AppRef {
                    name: name.clone(),
                    uri: uri.to_string(),
                })
            })
            .collect();
        refs.sort_by(|a, b| a.name.cmp(&b.name));
        refs
    }

    /// Parses a custom version string into an integer.
    ///
    /// Accepts decimal and `0x`-prefixed hexadecimal. Returns `None` for
    /// anything else, leaving the fallback policy to the caller.
    pub fn parse_version(raw: &str) -> Option<i64> {
        let raw = raw.trim();
        if let Some(hex) = raw.strip_prefix("0x").or_else(|| raw.strip_prefix("0X")) {
            return i64::from_str_radix(hex, 16).ok();
        }
        raw.parse().ok()
    }
}

impl PartialEq for Target {
    fn eq(&self, other: &Self) -> bool {
        self.hash == other.hash
    }
}

impl Eq for Target {}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (version {}, hash {})", self.name, self.version, self.hash)
    }
}

fn string_list<'a>(custom: &'a serde_json::Value, key: &str) -> Vec<&'a str> {
    custom
        .get(key)
        .and_then(serde_json::Value::as_array)
        .map(|items| items.iter().filter_map(serde_json::Value::as_str).collect())
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    #[test]
    fn equality_is_hash_based() {
        let a = Target::new("a", "abc", 1, json!({}));
        let b = Target::new("b", "abc", 2, json!({}));
        let c = Target::new("a", "def", 1, json!({}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn unknown_sentinel() {
        let t = Target::unknown();
        assert!(t.is_unknown());
        assert_eq!(t.version, -1);
        assert!(!Target::new("x", "h", 1, json!({})).is_unknown());
    }

    #[test]
    fn parse_version_accepts_decimal_and_hex() {
        assert_eq!(Target::parse_version("42"), Some(42));
        assert_eq!(Target::parse_version(" 7 "), Some(7));
        assert_eq!(Target::parse_version("0x10"), Some(16));
        assert_eq!(Target::parse_version("v1.2"), None);
        assert_eq!(Target::parse_version(""), None);
    }

    #[test]
    fn custom_accessors() {
        let t = Target::new(
            "intel-corei7-64-lmp-3",
            "abc",
            3,
            json!({
                "hardwareIds": ["intel-corei7-64"],
                "tags": ["main", "devel"],
                "docker_compose_apps": {
                    "shellhttpd": { "uri": "hub.example.io/factory/shellhttpd@sha256:aa" },
                    "agent": { "uri": "hub.example.io/factory/agent@sha256:bb" },
                    "broken": { "no-uri": true }
                }
            }),
        );
        assert_eq!(t.hardware_ids(), vec!["intel-corei7-64"]);
        assert_eq!(t.tags(), vec!["main", "devel"]);
        let apps = t.apps();
        assert_eq!(apps.len(), 2);
        assert_eq!(apps[0].name, "agent");
        assert_eq!(apps[1].name, "shellhttpd");
    }

    #[test]
    fn initial_target_carries_hardware_id() {
        let t = Target::initial("abc", "rpi4");
        assert!(t.is_initial());
        assert_eq!(t.hardware_ids(), vec!["rpi4"]);
        assert_eq!(t.hash, "abc");
    }
}
