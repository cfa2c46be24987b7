//! Condition algebra for resource status
//!
//! Conditions double as the transition history: each successful phase
//! transition is recorded as a condition whose type is the phase name, so
//! `resolve_last_phase` can compute "what to do next" after a Failed
//! excursion without a separate retry counter.

use chrono::{DateTime, Utc};

use crate::crd::{Condition, ConditionStatus};

/// Upsert a condition by type
///
/// Writing the same `(type, status, reason, message)` quadruple is a no-op,
/// so `lastTransitionTime` only moves on real transitions.
pub fn update_condition(
    conditions: &mut Vec<Condition>,
    status: ConditionStatus,
    type_: &str,
    reason: &str,
    message: &str,
    now: DateTime<Utc>,
) {
    for cond in conditions.iter_mut() {
        if cond.type_ == type_ {
            if cond.status == status && cond.reason == reason && cond.message == message {
                return;
            }
            *cond = Condition::new(type_, status, reason, message, now);
            return;
        }
    }

    conditions.push(Condition::new(type_, status, reason, message, now));
}

/// Remove the first condition of the given type by swap-with-last
///
/// Ordering of the remaining conditions is not preserved.
pub fn remove_condition(conditions: &mut Vec<Condition>, type_: &str) {
    if let Some(idx) = conditions.iter().position(|c| c.type_ == type_) {
        conditions.swap_remove(idx);
    }
}

/// Pick the highest-ranked condition type present in `order`
///
/// `order` lists condition types from lowest to highest rank. Returns
/// `first` when no listed type is present. Depends only on the set of
/// condition types, not on slice order.
pub fn resolve_last_phase<'a>(
    conditions: &[Condition],
    order: &[&'a str],
    first: &'a str,
) -> &'a str {
    let mut best: Option<usize> = None;
    for cond in conditions {
        if let Some(rank) = order.iter().position(|t| *t == cond.type_) {
            best = Some(best.map_or(rank, |b| b.max(rank)));
        }
    }

    match best {
        Some(rank) => order[rank],
        None => first,
    }
}
