use std::collections::BTreeMap;

use kube::ResourceExt;

use crate::resources::namespacelabels::{NamespaceLabel, ProtectionMode};

/// Remove previously-applied keys that no owner wants any more.
///
/// A key is only removed while its current value still equals the recorded
/// one; a label somebody else overwrote since we applied it is theirs now
/// and stays. Returns whether anything was removed.
pub fn remove_stale(
    labels: &mut BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
    prev_applied: &BTreeMap<String, String>,
) -> bool {
    let mut changed = false;
    for (key, recorded) in prev_applied {
        if desired.contains_key(key) {
            continue;
        }
        if labels.get(key) == Some(recorded) {
            labels.remove(key);
            changed = true;
        }
    }
    changed
}

/// Upsert every desired key, reporting whether anything moved.
pub fn apply_desired(
    labels: &mut BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
) -> bool {
    let mut changed = false;
    for (key, value) in desired {
        if labels.get(key) != Some(value) {
            labels.insert(key.clone(), value.clone());
            changed = true;
        }
    }
    changed
}

/// One full merge pass: stale removal, then upsert. Both halves always run;
/// the change flags are combined without short-circuiting.
pub fn apply(
    labels: &mut BTreeMap<String, String>,
    desired: &BTreeMap<String, String>,
    prev_applied: &BTreeMap<String, String>,
) -> bool {
    let removed = remove_stale(labels, desired, prev_applied);
    let upserted = apply_desired(labels, desired);
    removed || upserted
}

/// Merge desired labels across every given object.
///
/// When two objects claim the same key, the lexicographically smallest
/// object name wins, which keeps the merge independent of list order.
pub fn merge_desired(items: &[NamespaceLabel]) -> BTreeMap<String, String> {
    let mut sorted: Vec<&NamespaceLabel> = items.iter().collect();
    sorted.sort_by_key(|nsl| nsl.name_any());

    let mut desired = BTreeMap::new();
    for nsl in sorted {
        for (key, value) in &nsl.spec.labels {
            desired.entry(key.clone()).or_insert_with(|| value.clone());
        }
    }
    desired
}

/// Protection policy gathered across every given object: all patterns
/// concatenated, the most restrictive mode, and the override flag if any
/// object set it.
pub fn merge_policy(items: &[NamespaceLabel]) -> (Vec<String>, ProtectionMode, bool) {
    let mut patterns = Vec::new();
    let mut mode = ProtectionMode::Skip;
    let mut ignore_existing = false;

    for nsl in items {
        patterns.extend(nsl.spec.protected_label_patterns.iter().cloned());
        mode = mode.max(nsl.spec.protection_mode);
        ignore_existing |= nsl.spec.ignore_existing_protected_labels;
    }
    (patterns, mode, ignore_existing)
}
