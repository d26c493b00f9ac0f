//! Apply reporting
//!
//! The reconciler always reports per-descriptor end states rather than one
//! opaque failure for the whole run: every descriptor's final state, the
//! provider error behind each failure, and the chain of dependents skipped
//! because of it.

use std::collections::HashMap;
use std::fmt;

use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, ContentArrangement, Table};

use crate::model::{DeploymentPlan, ResourceKind, ResourceState};

/// What the reconciler did to one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    Created,
    Updated,
    /// Remote state already matched; zero mutating calls
    Unchanged,
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Unchanged => "unchanged",
        };
        f.write_str(s)
    }
}

/// Overall outcome of an apply run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Every descriptor reached Ready
    Success,
    /// At least one descriptor failed; independent branches may be Ready
    PartialFailure,
    /// Run was cancelled; in-flight work completed, the rest never started
    Cancelled,
}

impl ApplyOutcome {
    /// Process exit code for this outcome
    pub fn exit_code(&self) -> i32 {
        match self {
            ApplyOutcome::Success => 0,
            ApplyOutcome::PartialFailure => 2,
            ApplyOutcome::Cancelled => 3,
        }
    }
}

/// Final state of one descriptor after an apply run
#[derive(Debug, Clone)]
pub struct DescriptorOutcome {
    pub id: String,
    pub kind: ResourceKind,
    pub state: ResourceState,
    pub action: Option<Action>,
    /// Provider error message, for failed descriptors
    pub error: Option<String>,
    /// Failed ancestor id, for descriptors skipped by the bulkhead
    pub skipped_because: Option<String>,
}

/// Structured summary of an apply run, in plan declaration order
#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub outcomes: Vec<DescriptorOutcome>,
    pub cancelled: bool,
}

impl ApplyReport {
    pub(super) fn build(
        plan: &DeploymentPlan,
        states: &HashMap<String, ResourceState>,
        actions: &HashMap<String, Action>,
        errors: &HashMap<String, String>,
        skipped: &HashMap<String, String>,
        cancelled: bool,
    ) -> Self {
        let outcomes = plan
            .descriptors
            .iter()
            .map(|desc| DescriptorOutcome {
                id: desc.id.clone(),
                kind: desc.kind,
                state: states
                    .get(&desc.id)
                    .copied()
                    .unwrap_or(ResourceState::Planned),
                action: actions.get(&desc.id).copied(),
                error: errors.get(&desc.id).cloned(),
                skipped_because: skipped.get(&desc.id).cloned(),
            })
            .collect();
        Self {
            outcomes,
            cancelled,
        }
    }

    /// Outcome for one descriptor id
    pub fn outcome_for(&self, id: &str) -> Option<&DescriptorOutcome> {
        self.outcomes.iter().find(|o| o.id == id)
    }

    /// Overall run outcome. Cancellation dominates partial failure: the
    /// operator interrupted the run and re-running resumes it.
    pub fn outcome(&self) -> ApplyOutcome {
        if self.cancelled {
            ApplyOutcome::Cancelled
        } else if self
            .outcomes
            .iter()
            .any(|o| o.state == ResourceState::Failed)
        {
            ApplyOutcome::PartialFailure
        } else {
            ApplyOutcome::Success
        }
    }

    /// Count of descriptors in a given state
    pub fn count_in(&self, state: ResourceState) -> usize {
        self.outcomes.iter().filter(|o| o.state == state).count()
    }

    /// Count of mutating actions taken
    pub fn changed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.action, Some(Action::Created | Action::Updated)))
            .count()
    }

    /// Render the end-state summary table
    pub fn render_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["DESCRIPTOR", "KIND", "STATE", "ACTION", "DETAIL"]);

        for outcome in &self.outcomes {
            let detail = match (&outcome.error, &outcome.skipped_because) {
                (Some(err), _) => err.clone(),
                (None, Some(ancestor)) => format!("skipped: '{ancestor}' failed"),
                (None, None) if self.cancelled && outcome.action.is_none() => {
                    "not attempted (cancelled)".to_string()
                }
                _ => String::new(),
            };
            table.add_row(vec![
                Cell::new(&outcome.id),
                Cell::new(outcome.kind.as_str()),
                Cell::new(outcome.state.to_string()),
                Cell::new(
                    outcome
                        .action
                        .map(|a| a.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ),
                Cell::new(detail),
            ]);
        }
        table
    }
}
