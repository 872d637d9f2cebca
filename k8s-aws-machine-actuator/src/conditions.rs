use chrono::{DateTime, Utc};

use crate::model::{AwsMachineProviderCondition, ConditionStatus, ConditionType};

/// Decides whether an existing condition whose status is unchanged should
/// still be rewritten with a new reason and message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateConditionCheck {
    Always,
    Never,
    IfReasonOrMessageChange,
}

impl UpdateConditionCheck {
    fn should_update(
        &self,
        old_reason: &str,
        old_message: &str,
        new_reason: &str,
        new_message: &str,
    ) -> bool {
        match self {
            UpdateConditionCheck::Always => true,
            UpdateConditionCheck::Never => false,
            UpdateConditionCheck::IfReasonOrMessageChange => {
                old_reason != new_reason || old_message != new_message
            }
        }
    }
}

pub fn find_condition(
    conditions: &[AwsMachineProviderCondition],
    condition_type: ConditionType,
) -> Option<&AwsMachineProviderCondition> {
    conditions
        .iter()
        .find(|condition| condition.condition_type == condition_type)
}

/// Sets a condition and returns the resulting list.
///
/// A missing condition is only added when `status` is `True`. An existing one
/// is rewritten when its status changes or when `check` allows it; the
/// transition time moves only on a status change.
pub fn set_condition(
    conditions: Vec<AwsMachineProviderCondition>,
    condition_type: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    check: UpdateConditionCheck,
) -> Vec<AwsMachineProviderCondition> {
    set_condition_at(
        conditions,
        condition_type,
        status,
        reason,
        message,
        check,
        Utc::now(),
    )
}

fn set_condition_at(
    mut conditions: Vec<AwsMachineProviderCondition>,
    condition_type: ConditionType,
    status: ConditionStatus,
    reason: &str,
    message: &str,
    check: UpdateConditionCheck,
    now: DateTime<Utc>,
) -> Vec<AwsMachineProviderCondition> {
    let existing = conditions
        .iter_mut()
        .find(|condition| condition.condition_type == condition_type);

    match existing {
        None => {
            if status == ConditionStatus::True {
                conditions.push(AwsMachineProviderCondition {
                    condition_type,
                    status,
                    reason: reason.to_string(),
                    message: message.to_string(),
                    last_probe_time: now,
                    last_transition_time: now,
                });
            }
        }
        Some(existing) => {
            let status_changed = existing.status != status;
            if status_changed
                || check.should_update(&existing.reason, &existing.message, reason, message)
            {
                if status_changed {
                    existing.last_transition_time = now;
                }
                existing.status = status;
                existing.reason = reason.to_string();
                existing.message = message.to_string();
                existing.last_probe_time = now;
            }
        }
    }

    conditions
}
