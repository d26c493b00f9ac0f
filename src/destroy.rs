//! Rollback/cleanup engine
//!
//! Destroys a plan's resources in reverse dependency order. Deleting a
//! resource that is already absent counts as success, so a destroy can be
//! re-run safely and a never-applied plan destroys as a no-op. Protected
//! resources (the database instance and the artifact bucket) are skipped
//! with an explicit report entry unless the destructive override is passed —
//! never silently skipped, never silently destroyed.

use std::fmt;
use std::sync::Arc;

use backon::{ExponentialBuilder, Retryable};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, ContentArrangement, Table};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::graph::{DependencyGraph, GraphError};
use crate::model::{ConfigError, DeploymentPlan, ResourceKind};
use crate::provider::{DeleteOutcome, ProviderError, ResourceProvider};
use crate::reconcile::RetrySchedule;

/// Errors that abort a destroy before any deletion
#[derive(Debug, Error)]
pub enum DestroyPreflightError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),
}

/// Tunables for one destroy run
#[derive(Debug, Clone)]
pub struct DestroyOptions {
    /// Delete protected resources too (explicit operator confirmation)
    pub allow_destructive_override: bool,
    pub retry: RetrySchedule,
    pub cancel: CancellationToken,
}

impl Default for DestroyOptions {
    fn default() -> Self {
        Self {
            allow_destructive_override: false,
            retry: RetrySchedule::default(),
            cancel: CancellationToken::new(),
        }
    }
}

/// Result of one resource's destroy step
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DestroyAction {
    /// Deleted by this run
    Deleted,
    /// Was already gone
    AlreadyAbsent,
    /// Protected and no override given
    ProtectedSkipped,
    /// Delete call failed
    Failed(String),
    /// Run was cancelled before this resource was reached
    NotAttempted,
}

impl fmt::Display for DestroyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DestroyAction::Deleted => f.write_str("deleted"),
            DestroyAction::AlreadyAbsent => f.write_str("already absent"),
            DestroyAction::ProtectedSkipped => f.write_str("protected (skipped)"),
            DestroyAction::Failed(_) => f.write_str("failed"),
            DestroyAction::NotAttempted => f.write_str("not attempted"),
        }
    }
}

/// Per-descriptor results of a destroy run, in deletion order
#[derive(Debug, Clone)]
pub struct DestroyReport {
    pub outcomes: Vec<(String, ResourceKind, DestroyAction)>,
    pub cancelled: bool,
}

impl DestroyReport {
    pub fn action_for(&self, id: &str) -> Option<&DestroyAction> {
        self.outcomes
            .iter()
            .find(|(oid, _, _)| oid == id)
            .map(|(_, _, action)| action)
    }

    pub fn deleted(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, _, a)| *a == DestroyAction::Deleted)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, _, a)| matches!(a, DestroyAction::Failed(_)))
            .count()
    }

    pub fn skipped_protected(&self) -> usize {
        self.outcomes
            .iter()
            .filter(|(_, _, a)| *a == DestroyAction::ProtectedSkipped)
            .count()
    }

    /// Process exit code: cancellation dominates, then any failed delete.
    pub fn exit_code(&self) -> i32 {
        if self.cancelled {
            3
        } else if self.failed() > 0 {
            2
        } else {
            0
        }
    }

    pub fn render_table(&self) -> Table {
        let mut table = Table::new();
        table
            .load_preset(UTF8_FULL_CONDENSED)
            .set_content_arrangement(ContentArrangement::Dynamic)
            .set_header(vec!["DESCRIPTOR", "KIND", "RESULT", "DETAIL"]);
        for (id, kind, action) in &self.outcomes {
            let detail = match action {
                DestroyAction::Failed(e) => e.clone(),
                DestroyAction::ProtectedSkipped => {
                    "pass --allow-destructive-override to delete".to_string()
                }
                _ => String::new(),
            };
            table.add_row(vec![
                Cell::new(id),
                Cell::new(kind.as_str()),
                Cell::new(action.to_string()),
                Cell::new(detail),
            ]);
        }
        table
    }
}

/// Destroy a plan's resources in reverse dependency order.
///
/// Walks sequentially: a dependent is always deleted before the resources it
/// depends on, so the remote API never sees a dangling reference from our
/// side. Failures are recorded per resource and do not stop the walk —
/// later resources on other branches may still delete cleanly.
pub async fn destroy(
    provider: Arc<dyn ResourceProvider>,
    plan: &DeploymentPlan,
    options: &DestroyOptions,
) -> Result<DestroyReport, DestroyPreflightError> {
    plan.validate()?;
    let graph = DependencyGraph::build(&plan.descriptors)?;

    let mut outcomes = Vec::with_capacity(plan.descriptors.len());
    let mut cancelled = false;

    for id in graph.destroy_order() {
        let desc = plan.get(&id).expect("descriptor in plan");

        if options.cancel.is_cancelled() {
            cancelled = true;
            outcomes.push((id.clone(), desc.kind, DestroyAction::NotAttempted));
            continue;
        }

        if desc.is_protected() && !options.allow_destructive_override {
            warn!(
                id = %id,
                kind = %desc.kind,
                "Protected resource skipped; pass --allow-destructive-override to delete"
            );
            outcomes.push((id.clone(), desc.kind, DestroyAction::ProtectedSkipped));
            continue;
        }

        let action = delete_one(provider.as_ref(), desc, &options.retry).await;
        match &action {
            DestroyAction::Deleted => info!(id = %id, kind = %desc.kind, "Deleted"),
            DestroyAction::AlreadyAbsent => {
                info!(id = %id, kind = %desc.kind, "Already absent")
            }
            DestroyAction::Failed(e) => {
                warn!(id = %id, kind = %desc.kind, error = %e, "Delete failed")
            }
            _ => {}
        }
        outcomes.push((id.clone(), desc.kind, action));
    }

    Ok(DestroyReport {
        outcomes,
        cancelled,
    })
}

async fn delete_one(
    provider: &dyn ResourceProvider,
    desc: &crate::model::ResourceDescriptor,
    retry: &RetrySchedule,
) -> DestroyAction {
    let result = (|| provider.delete(desc))
        .retry(
            ExponentialBuilder::default()
                .with_min_delay(retry.min_delay)
                .with_max_delay(retry.max_delay)
                .with_max_times(retry.max_attempts.saturating_sub(1)),
        )
        .when(ProviderError::is_retryable)
        .notify(|err, dur| {
            warn!(id = %desc.id, delay = ?dur, error = %err, "Transient error during delete, backing off");
        })
        .await;

    match result {
        Ok(DeleteOutcome::Deleted) => DestroyAction::Deleted,
        Ok(DeleteOutcome::AlreadyAbsent) => DestroyAction::AlreadyAbsent,
        Err(e) if e.is_not_found() => DestroyAction::AlreadyAbsent,
        Err(e) => DestroyAction::Failed(e.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceDescriptor;
    use crate::provider::memory::MemoryProvider;
    use crate::provider::DepView;

    fn plan() -> DeploymentPlan {
        DeploymentPlan {
            project: "p".into(),
            region: "r".into(),
            prefix: "x".into(),
            descriptors: vec![
                ResourceDescriptor::new("db", ResourceKind::DatabaseInstance)
                    .with("region", "europe-west1")
                    .with("tier", "db-f1-micro")
                    .with("database_version", "POSTGRES_16")
                    .with("protected", "true"),
                ResourceDescriptor::new("database", ResourceKind::Database)
                    .with("instance", "db")
                    .depends_on("db"),
            ],
        }
    }

    #[tokio::test]
    async fn dependents_delete_before_dependencies() {
        let provider = Arc::new(MemoryProvider::new());
        for desc in &plan().descriptors {
            provider
                .create(desc, &DepView::default(), None)
                .await
                .unwrap();
        }

        let options = DestroyOptions {
            allow_destructive_override: true,
            ..Default::default()
        };
        let report = destroy(provider.clone(), &plan(), &options).await.unwrap();

        assert_eq!(report.deleted(), 2);
        let order: Vec<&str> = report
            .outcomes
            .iter()
            .map(|(id, _, _)| id.as_str())
            .collect();
        assert_eq!(order, vec!["database", "db"]);
    }

    #[tokio::test]
    async fn protected_resources_require_override() {
        let provider = Arc::new(MemoryProvider::new());
        for desc in &plan().descriptors {
            provider
                .create(desc, &DepView::default(), None)
                .await
                .unwrap();
        }

        let report = destroy(provider.clone(), &plan(), &DestroyOptions::default())
            .await
            .unwrap();

        assert_eq!(
            report.action_for("db"),
            Some(&DestroyAction::ProtectedSkipped)
        );
        assert_eq!(report.action_for("database"), Some(&DestroyAction::Deleted));
        assert!(provider.contains("db"));
        assert_eq!(report.exit_code(), 0);
    }

    #[tokio::test]
    async fn destroy_never_applied_plan_is_noop_success() {
        let provider = Arc::new(MemoryProvider::new());
        let options = DestroyOptions {
            allow_destructive_override: true,
            ..Default::default()
        };
        let report = destroy(provider, &plan(), &options).await.unwrap();

        assert_eq!(report.deleted(), 0);
        assert_eq!(report.failed(), 0);
        assert_eq!(report.exit_code(), 0);
        assert!(report
            .outcomes
            .iter()
            .all(|(_, _, a)| *a == DestroyAction::AlreadyAbsent));
    }
}
