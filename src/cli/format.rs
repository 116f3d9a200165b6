//! Output formatting for CLI display.

use crate::model::Target;

/// One line per target, newest last, marking the one that is booted.
pub(super) fn format_targets(targets: &[Target], current: &Target) -> String {
    if targets.is_empty() {
        return "No targets for this device".to_string();
    }
    targets
        .iter()
        .map(|t| {
            let marker = if *t == *current { '*' } else { ' ' };
            let tags = t.tags();
            let tags = if tags.is_empty() {
                String::new()
            } else {
                format!("  [{}]", tags.join(", "))
            };
            format!("{marker} {:>6}  {}  {}{tags}", t.version, short_hash(&t.hash), t.name)
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Current and pending target summary.
pub(super) fn format_status(current: &Target, pending: Option<&Target>) -> String {
    let current = if current.is_unknown() {
        "unknown".to_string()
    } else if current.is_initial() {
        format!("{current}, not installed by the agent")
    } else {
        current.to_string()
    };
    let pending = pending.map_or_else(|| "none".to_string(), Target::to_string);
    format!("Current: {current}\nPending: {pending}")
}

pub(super) fn format_progress(received: u64, expected: u64) -> String {
    if expected == 0 {
        return format!("{received} bytes");
    }
    let percent = received.saturating_mul(100) / expected;
    format!("{received}/{expected} bytes ({percent}%)")
}

fn short_hash(hash: &str) -> &str {
    hash.get(..12).unwrap_or(hash)
}
