use std::borrow::Cow;
use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::schema::{Schema, SchemaObject};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// Finalizer attached to every NamespaceLabel so its labels are rolled back
/// before the object disappears.
pub static NAMESPACE_LABEL_FINALIZER: &str = "namespacelabels.nslabels.dev";

/// Namespace annotation recording the labels this operator applied last, as
/// a JSON map of key to value.
pub static APPLIED_ANNOTATION: &str = "nslabels.dev/applied";

/// The one name a NamespaceLabel may carry in single-owner mode.
pub static REQUIRED_NAME: &str = "labels";

/// Labels desired on the namespace a NamespaceLabel lives in
#[derive(CustomResource, Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[kube(
    kind = "NamespaceLabel",
    group = "nslabels.dev",
    version = "v1alpha1",
    namespaced,
    schema = "manual",
    printcolumn = r#"{"name":"Applied", "type":"boolean", "jsonPath":".status.applied"}"#,
    printcolumn = r#"{"name":"Ready", "type":"string", "jsonPath":".status.conditions[?(@.type==\"Ready\")].status"}"#,
    printcolumn = r#"{"name":"Message", "priority": 1, "type":"string", "jsonPath":".status.message"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[kube(status = "NamespaceLabelStatus", shortname = "nsl")]
#[serde(rename_all = "camelCase")]
pub struct NamespaceLabelSpec {
    /// Labels to apply to the namespace this object lives in
    #[serde(default)]
    pub labels: BTreeMap<String, String>,

    /// Glob patterns (`*`, `?`, `[...]`) naming label keys that must not be
    /// overwritten while they hold a value other than the desired one
    #[serde(default)]
    pub protected_label_patterns: Vec<String>,

    /// What to do when a desired label collides with a protected key
    #[serde(default)]
    pub protection_mode: ProtectionMode,

    /// Keep managing protected keys whose current value was applied by this
    /// operator in an earlier pass
    #[serde(default)]
    pub ignore_existing_protected_labels: bool,
}

// Hoisted from the derived implementation so that object names can be
// restricted to valid DNS label names
impl schemars::JsonSchema for NamespaceLabel {
    fn schema_name() -> String {
        "NamespaceLabel".to_owned()
    }
    fn schema_id() -> Cow<'static, str> {
        "namespace_label_operator::resources::namespacelabels::NamespaceLabel".into()
    }
    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> Schema {
        {
            let mut schema_object = SchemaObject {
                instance_type: Some(schemars::schema::InstanceType::Object.into()),
                metadata: Some(Box::new(schemars::schema::Metadata {
                    description: Some(
                        "NamespaceLabel declares labels for the namespace it lives in, protecting keys owned by other systems from being overwritten."
                            .to_owned(),
                    ),
                    ..Default::default()
                })),
                ..Default::default()
            };
            let object_validation = schema_object.object();

            object_validation
                .properties
                .insert(
                    "metadata".to_owned(),
                    serde_json::from_value(json!({
                                "type": "object",
                                "properties": {
                                    "name": {
                                        "type": "string",
                                        "minLength": 1,
                                        "maxLength": 63,
                                        "pattern": "^[a-z0-9]([-a-z0-9]*[a-z0-9])?$",
                                    }
                                }
                            })).unwrap(),
                );
            object_validation.required.insert("metadata".to_owned());

            object_validation
                .properties
                .insert("spec".to_owned(), gen.subschema_for::<NamespaceLabelSpec>());
            object_validation.required.insert("spec".to_owned());

            object_validation.properties.insert(
                "status".to_owned(),
                gen.subschema_for::<Option<NamespaceLabelStatus>>(),
            );
            Schema::Object(schema_object)
        }
    }
}

/// How a write to a protected label key is handled when the key already
/// holds a different value.
///
/// Variants are ordered weakest to strongest so merging across objects can
/// take the most restrictive with `max`.
#[derive(
    Deserialize, Serialize, Clone, Copy, Default, Debug, JsonSchema, PartialEq, Eq, PartialOrd, Ord,
)]
#[serde(rename_all = "lowercase")]
pub enum ProtectionMode {
    /// Leave the existing value in place and continue silently
    #[default]
    Skip,
    /// Leave the existing value in place and surface a warning in status
    Warn,
    /// Apply nothing and report the conflict as an error
    Fail,
}

/// Status of a NamespaceLabel, written after every reconcile pass
#[derive(Deserialize, Serialize, Clone, Default, Debug, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceLabelStatus {
    /// Whether the last pass applied cleanly
    #[serde(default)]
    pub applied: bool,

    /// Human-readable summary of the last pass
    #[serde(default)]
    pub message: String,

    pub conditions: Option<Vec<NamespaceLabelCondition>>,

    /// Desired keys withheld because they matched a protection pattern
    pub protected_labels_skipped: Option<Vec<String>>,

    /// Label keys applied by the last pass, sorted
    pub labels_applied: Option<Vec<String>>,
}

#[derive(Deserialize, Serialize, Clone, Debug, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NamespaceLabelCondition {
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: Option<Time>,

    /// Human readable message indicating details about the transition.
    pub message: Option<String>,

    /// The generation of the object that was reconciled into this condition.
    pub observed_generation: Option<i64>,

    /// The reason for the condition's last transition.
    pub reason: Option<String>,

    /// Status of the condition, one of True, False, Unknown.
    pub status: String,

    /// Type of the condition, currently only Ready.
    pub r#type: String,
}
