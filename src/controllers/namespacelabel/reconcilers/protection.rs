use std::collections::BTreeMap;

use glob::Pattern;
use tracing::debug;

use crate::resources::namespacelabels::ProtectionMode;

/// Outcome of filtering desired labels through the protection rules.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Verdict {
    /// Labels cleared to land on the namespace
    pub allowed: BTreeMap<String, String>,
    /// Keys withheld because a protected key already holds another value
    pub skipped: Vec<String>,
    /// One conflict description per withheld key, in key order
    pub warnings: Vec<String>,
    /// Set when mode `fail` saw at least one conflict
    pub failed: bool,
}

/// Whether a label key matches any protection pattern.
///
/// Returns on the first match. Empty patterns never match, and a malformed
/// pattern only disables itself, never the rest of the list.
pub fn is_protected(key: &str, patterns: &[String]) -> bool {
    patterns.iter().any(|pattern| {
        if pattern.is_empty() {
            return false;
        }
        match Pattern::new(pattern) {
            Ok(pattern) => pattern.matches(key),
            Err(err) => {
                debug!("ignoring malformed protection pattern {pattern:?}: {err}");
                false
            }
        }
    })
}

/// Filter desired labels through the protection rules.
///
/// Keys are visited in sorted order so skip lists and warnings come out
/// stable across passes. Protection only fires when a protected key exists
/// with a value other than the desired one; absent keys and exact matches
/// pass through. In `fail` mode every conflict is still gathered before the
/// verdict is marked failed, so one status update shows them all.
pub fn evaluate(
    desired: &BTreeMap<String, String>,
    existing: &BTreeMap<String, String>,
    prev_applied: &BTreeMap<String, String>,
    patterns: &[String],
    mode: ProtectionMode,
    ignore_existing: bool,
) -> Verdict {
    let mut verdict = Verdict::default();

    for (key, value) in desired {
        if is_protected(key, patterns) {
            // A key this operator applied earlier stays under management.
            if ignore_existing && prev_applied.contains_key(key) {
                verdict.allowed.insert(key.clone(), value.clone());
                continue;
            }

            if let Some(existing_value) = existing.get(key) {
                if existing_value != value {
                    if mode == ProtectionMode::Fail {
                        verdict.failed = true;
                    }
                    if mode != ProtectionMode::Skip {
                        verdict.warnings.push(conflict_warning(key, existing_value, value));
                    }
                    verdict.skipped.push(key.clone());
                    continue;
                }
            }
        }

        verdict.allowed.insert(key.clone(), value.clone());
    }

    verdict
}

fn conflict_warning(key: &str, existing: &str, attempted: &str) -> String {
    format!(
        "Label '{key}' is protected by pattern and has existing value '{existing}' (attempting to set '{attempted}')"
    )
}
