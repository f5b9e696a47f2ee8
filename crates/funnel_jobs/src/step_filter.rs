use std::collections::HashSet;

use shared::{domain::StepId, protocol::ReportStep};

/// Drops report entries for steps the user disabled on this funnel.
///
/// Survivors keep their relative order and user counts.
pub fn remove_disabled_steps(
    steps: Vec<ReportStep>,
    disabled_steps: Option<&[StepId]>,
) -> Vec<ReportStep> {
    let disabled: HashSet<StepId> = match disabled_steps {
        Some(ids) if !ids.is_empty() => ids.iter().copied().collect(),
        _ => return steps,
    };

    steps
        .into_iter()
        .filter(|step| !disabled.contains(&step.id))
        .collect()
}
