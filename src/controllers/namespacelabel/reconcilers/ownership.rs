use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Namespace;
use kube::api::{Api, PostParams};
use kube::ResourceExt;
use tracing::debug;

use crate::Result;

/// The labels this operator last applied to a namespace, parsed from the
/// tracking annotation.
///
/// An absent, empty, or unparsable annotation reads as "nothing owned"; a
/// bad record must degrade to no ownership rather than fail the pass.
pub fn read(ns: &Namespace, annotation: &str) -> BTreeMap<String, String> {
    let Some(raw) = ns.annotations().get(annotation) else {
        return BTreeMap::new();
    };
    if raw.is_empty() {
        return BTreeMap::new();
    }
    serde_json::from_str(raw).unwrap_or_default()
}

/// Persist the ownership record on the namespace.
///
/// Always re-fetches first: the label update earlier in the pass bumped the
/// resourceVersion, and other writers may have touched the object since.
/// An already-current record is left alone so the pass stays idempotent.
pub async fn write(
    api: &Api<Namespace>,
    name: &str,
    annotation: &str,
    owned: &BTreeMap<String, String>,
) -> Result<()> {
    let mut ns = api.get(name).await?;

    let encoded = serde_json::to_string(owned)?;
    if ns.annotations().get(annotation) == Some(&encoded) {
        debug!("applied-labels annotation on namespace {name} is already current");
        return Ok(());
    }

    ns.annotations_mut()
        .insert(annotation.to_string(), encoded);
    api.replace(name, &PostParams::default(), &ns).await?;
    Ok(())
}
