//! Condition management helpers following Kubernetes API conventions

use chrono::Utc;

use crate::crd::Condition;

/// The keystore Secret is published for the current secure settings
pub const CONDITION_TYPE_KEYSTORE_READY: &str = "KeystoreReady";
/// Every node loaded the published keystore
pub const CONDITION_TYPE_KEYSTORE_CONVERGED: &str = "KeystoreConverged";
/// Trust and API keys are in place for every associated cluster
pub const CONDITION_TYPE_REMOTE_CLUSTERS_READY: &str = "RemoteClustersReady";

/// Standard condition statuses
pub const CONDITION_STATUS_TRUE: &str = "True";
pub const CONDITION_STATUS_FALSE: &str = "False";

pub const REASON_PUBLISHED: &str = "Published";
pub const REASON_DISABLED: &str = "Disabled";
pub const REASON_RECONCILE_FAILED: &str = "ReconcileFailed";
pub const REASON_CONVERGED: &str = "Converged";
pub const REASON_RELOADING: &str = "Reloading";
pub const REASON_RECONCILED: &str = "Reconciled";
pub const REASON_WAITING_FOR_CERTIFICATES: &str = "WaitingForCertificates";

/// Update or add a condition to the conditions list
///
/// The transition time only moves when the status changes.
pub fn set_condition(
    conditions: &mut Vec<Condition>,
    type_: &str,
    status: &str,
    reason: &str,
    message: &str,
) {
    let now = Utc::now().to_rfc3339();

    if let Some(existing) = conditions.iter_mut().find(|c| c.type_ == type_) {
        let should_update_time = existing.status != status;

        existing.status = status.to_string();
        existing.reason = reason.to_string();
        existing.message = message.to_string();

        if should_update_time {
            existing.last_transition_time = now;
        }
    } else {
        conditions.push(Condition {
            type_: type_.to_string(),
            status: status.to_string(),
            last_transition_time: now,
            reason: reason.to_string(),
            message: message.to_string(),
            observed_generation: None,
        });
    }
}

/// Same as [`set_condition`] with a boolean status
pub fn set_condition_bool(
    conditions: &mut Vec<Condition>,
    type_: &str,
    ok: bool,
    reason: &str,
    message: &str,
) {
    let status = if ok {
        CONDITION_STATUS_TRUE
    } else {
        CONDITION_STATUS_FALSE
    };
    set_condition(conditions, type_, status, reason, message);
}

/// Find a condition by type
pub fn find_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Check if a condition is true
pub fn is_condition_true(conditions: &[Condition], type_: &str) -> bool {
    find_condition(conditions, type_)
        .map(|c| c.status == CONDITION_STATUS_TRUE)
        .unwrap_or(false)
}

/// Remove a condition by type
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

/// Stamp every condition with the generation it was computed for
pub fn set_observed_generation(conditions: &mut [Condition], generation: Option<i64>) {
    for condition in conditions {
        condition.observed_generation = generation;
    }
}
