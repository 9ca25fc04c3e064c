use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;

use crate::resources::namespacelabels::NamespaceLabelCondition;

/// Fold a pass outcome into the conditions list, replacing the Ready
/// condition in place (or appending it) and leaving any other condition
/// types untouched.
///
/// The transition time only moves when the status value actually changes,
/// so repeated passes with the same outcome keep a stable timestamp.
pub fn upsert_ready(
    existing: Option<&Vec<NamespaceLabelCondition>>,
    observed_generation: Option<i64>,
    status: &str,
    reason: &str,
    message: &str,
    now: Time,
) -> Vec<NamespaceLabelCondition> {
    let prior = existing.and_then(|conditions| conditions.iter().find(|c| c.r#type == "Ready"));

    let last_transition_time = match prior {
        Some(prior) if prior.status == status => {
            prior.last_transition_time.clone().unwrap_or(now)
        }
        _ => now,
    };

    let ready = NamespaceLabelCondition {
        last_transition_time: Some(last_transition_time),
        message: Some(message.to_string()),
        observed_generation,
        reason: Some(reason.to_string()),
        status: status.to_string(),
        r#type: "Ready".to_string(),
    };

    let mut conditions = existing.cloned().unwrap_or_default();
    match conditions.iter_mut().find(|c| c.r#type == "Ready") {
        Some(slot) => *slot = ready,
        None => conditions.push(ready),
    }
    conditions
}

/// Human summary of a successful pass.
pub fn success_message(
    namespace: &str,
    requested: usize,
    applied: usize,
    skipped: &[String],
) -> String {
    if requested == 0 {
        return format!(
            "No labels are defined; add labels to the spec to apply them to namespace '{namespace}'"
        );
    }
    if skipped.is_empty() {
        format!("Applied {applied} labels to namespace '{namespace}'")
    } else {
        format!(
            "Applied {applied} labels to namespace '{namespace}', skipped {} protected labels ({})",
            skipped.len(),
            skipped.join(", ")
        )
    }
}
