use k8s_openapi::apimachinery::pkg::apis::meta::v1::{Condition, Time};

/// Finds a condition by type.
pub fn get_condition<'a>(conditions: &'a [Condition], type_: &str) -> Option<&'a Condition> {
    conditions.iter().find(|c| c.type_ == type_)
}

/// Sets (inserting or updating in place) a named condition.
///
/// Idempotent: if an entry with the same type already has the same Status,
/// Reason, Message and LastTransitionTime, the list is left untouched; in
/// particular `LastTransitionTime` only advances when `status` actually
/// changes, never on a same-status refresh. Ordering of the slice is
/// preserved; updates happen in place, new conditions are appended.
pub fn set_condition(conditions: &mut Vec<Condition>, type_: &str, status: &str, reason: &str, message: &str, now: Time) {
    match conditions.iter().position(|c| c.type_ == type_) {
        Some(idx) => {
            let transition_time = if conditions[idx].status == status {
                conditions[idx].last_transition_time.clone()
            } else {
                now
            };
            let candidate = build_condition(type_, status, reason, message, transition_time);
            if !conditions_equal(&conditions[idx], &candidate) {
                conditions[idx] = candidate;
            }
        }
        None => conditions.push(build_condition(type_, status, reason, message, now)),
    }
}

/// Removes a condition by type, if present. Ordering of the remainder is preserved.
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    conditions.retain(|c| c.type_ != type_);
}

fn build_condition(type_: &str, status: &str, reason: &str, message: &str, last_transition_time: Time) -> Condition {
    Condition {
        type_: type_.to_string(),
        status: status.to_string(),
        reason: reason.to_string(),
        message: message.to_string(),
        last_transition_time,
        observed_generation: None,
    }
}

fn conditions_equal(a: &Condition, b: &Condition) -> bool {
    a.status == b.status
        && a.reason == b.reason
        && a.message == b.message
        && a.last_transition_time.0 == b.last_transition_time.0
}
