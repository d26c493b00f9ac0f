//! The reconciler
//!
//! Walks a plan's dependency graph in topological order and makes each
//! remote resource match its desired config: absent resources are created,
//! divergent ones are updated in place, converged ones are left untouched.
//! Re-running against an already-converged system performs zero mutating
//! calls.
//!
//! Independent branches of the graph are applied concurrently by a small
//! worker pool; descriptors on one dependency chain are strictly sequential.
//! A failure marks its whole dependent subtree as skipped while unrelated
//! branches continue (bulkhead semantics).

pub mod report;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use backon::{ExponentialBuilder, Retryable};
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::graph::{DependencyGraph, GraphError};
use crate::model::{ConfigError, DeploymentPlan, ResourceDescriptor, ResourceKind, ResourceState};
use crate::provider::{DepView, Observed, ProviderError, Resolved, ResourceProvider};
use crate::secrets::{PolicyViolation, SecretEngine, SecretMaterial};

pub use report::{Action, ApplyOutcome, ApplyReport, DescriptorOutcome};

/// Errors that abort an apply before any mutation
#[derive(Debug, Error)]
pub enum PreflightError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    Policy(#[from] PolicyViolation),
}

/// Backoff schedule for transient provider errors
#[derive(Debug, Clone)]
pub struct RetrySchedule {
    pub min_delay: Duration,
    pub max_delay: Duration,
    /// Total attempts including the first (spec: bounded, up to 5)
    pub max_attempts: usize,
}

impl Default for RetrySchedule {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            max_attempts: 5,
        }
    }
}

/// Tunables for one reconciliation run
#[derive(Debug, Clone)]
pub struct ReconcileOptions {
    /// Maximum concurrent apply calls (remote APIs rate-limit aggressively)
    pub workers: usize,
    pub retry: RetrySchedule,
    pub cancel: CancellationToken,
    /// Allow convergence steps that replace protected resources
    pub allow_destructive_override: bool,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            workers: 4,
            retry: RetrySchedule::default(),
            cancel: CancellationToken::new(),
            allow_destructive_override: false,
        }
    }
}

/// Fields that identify a resource rather than configure it; changing one
/// means replacing the resource, not updating it.
const IDENTITY_KEYS: &[&str] = &["name", "region", "location", "database_version", "instance"];

/// True when converging `desc` onto `observed` would replace the resource.
fn needs_replacement(desc: &ResourceDescriptor, observed: &Observed) -> bool {
    IDENTITY_KEYS.iter().any(|key| {
        match (desc.desired.get(*key), observed.config.get(*key)) {
            (Some(desired), Some(current)) => desired != current,
            _ => false,
        }
    })
}

/// Remote-assigned attributes, keyed by descriptor id.
///
/// The only shared mutable structure across concurrent branches. Append-only
/// per key: the graph guarantees exactly one writer per descriptor id, so
/// contention is limited to point-wise inserts. Plaintext secret material is
/// never stored here, only version identifiers.
#[derive(Clone, Default)]
pub struct ResolvedAttrs {
    inner: Arc<Mutex<HashMap<String, BTreeMap<String, String>>>>,
}

impl ResolvedAttrs {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a descriptor's attributes. First write wins; the single-writer
    /// guarantee makes a second write a bug upstream, not here.
    pub fn record(&self, id: &str, attrs: BTreeMap<String, String>) {
        let mut table = self.inner.lock().unwrap();
        if table.contains_key(id) {
            warn!(id = %id, "Resolved attributes recorded twice, keeping first write");
            return;
        }
        table.insert(id.to_string(), attrs);
    }

    /// Attributes resolved for one descriptor, if applied
    pub fn get(&self, id: &str) -> Option<BTreeMap<String, String>> {
        self.inner.lock().unwrap().get(id).cloned()
    }

    /// View restricted to a descriptor's declared dependencies
    pub fn view_for(&self, desc: &ResourceDescriptor) -> DepView {
        let table = self.inner.lock().unwrap();
        let entries = desc
            .depends_on
            .iter()
            .filter_map(|dep| table.get(dep).map(|attrs| (dep.clone(), attrs.clone())))
            .collect();
        DepView::new(entries)
    }
}

/// Applies a plan against a provider
pub struct Reconciler {
    provider: Arc<dyn ResourceProvider>,
    secrets: Arc<SecretEngine>,
    options: ReconcileOptions,
}

impl Reconciler {
    pub fn new(
        provider: Arc<dyn ResourceProvider>,
        secrets: SecretEngine,
        options: ReconcileOptions,
    ) -> Self {
        Self {
            provider,
            secrets: Arc::new(secrets),
            options,
        }
    }

    /// Validate, order, and apply the plan.
    ///
    /// Pre-flight errors return `Err` before any mutation. Everything after
    /// that is reported per descriptor in the [`ApplyReport`]; a failed
    /// branch never turns into an opaque run-wide error.
    pub async fn apply(&self, plan: &DeploymentPlan) -> Result<ApplyReport, PreflightError> {
        plan.validate()?;
        let graph = DependencyGraph::build(&plan.descriptors)?;

        let order_pos: HashMap<&str, usize> = graph
            .apply_order()
            .iter()
            .enumerate()
            .map(|(i, id)| (id.as_str(), i))
            .collect();

        let mut states: HashMap<String, ResourceState> = plan
            .descriptors
            .iter()
            .map(|d| (d.id.clone(), ResourceState::Planned))
            .collect();
        let mut actions: HashMap<String, Action> = HashMap::new();
        let mut errors: HashMap<String, String> = HashMap::new();
        // skipped id -> the failed ancestor that caused the skip
        let mut skipped: HashMap<String, String> = HashMap::new();

        let mut in_degree = graph.in_degrees();
        let mut ready: VecDeque<String> = graph
            .apply_order()
            .iter()
            .filter(|id| in_degree[id.as_str()] == 0)
            .cloned()
            .collect();

        let resolved = ResolvedAttrs::new();
        let workers = self.options.workers.max(1);
        let mut running: JoinSet<(String, Result<(Resolved, Action), ProviderError>)> =
            JoinSet::new();

        loop {
            if !self.options.cancel.is_cancelled() {
                while running.len() < workers {
                    let Some(id) = next_ready(&mut ready, &skipped) else {
                        break;
                    };
                    let desc = plan.get(&id).expect("descriptor in plan").clone();
                    states.insert(id.clone(), ResourceState::Applying);

                    let provider = self.provider.clone();
                    let secrets = self.secrets.clone();
                    let deps = resolved.view_for(&desc);
                    let retry = self.options.retry.clone();
                    let allow_destructive = self.options.allow_destructive_override;
                    running.spawn(async move {
                        let result =
                            apply_one(provider, secrets, &desc, deps, &retry, allow_destructive)
                                .await;
                        (desc.id, result)
                    });
                }
            }

            let Some(joined) = running.join_next().await else {
                break;
            };

            let (id, result) = match joined {
                Ok(pair) => pair,
                Err(e) => {
                    // A panicked worker leaves its subtree unattempted; the
                    // report shows those descriptors as never applied.
                    error!(error = ?e, "Apply worker panicked");
                    continue;
                }
            };

            match result {
                Ok((res, action)) => {
                    debug!(id = %id, action = %action, "Descriptor ready");
                    states.insert(id.clone(), ResourceState::Ready);
                    actions.insert(id.clone(), action);
                    resolved.record(&id, res.attrs);

                    let mut unlocked: Vec<String> = Vec::new();
                    for dep in graph.dependents_of(&id) {
                        let degree = in_degree.get_mut(&dep).expect("dependent in degree map");
                        *degree -= 1;
                        if *degree == 0 && !skipped.contains_key(&dep) {
                            unlocked.push(dep);
                        }
                    }
                    // Stable ordering regardless of neighbor iteration order
                    unlocked.sort_by_key(|d| order_pos[d.as_str()]);
                    ready.extend(unlocked);
                }
                Err(e) => {
                    error!(id = %id, error = %e, "Descriptor failed");
                    states.insert(id.clone(), ResourceState::Failed);
                    errors.insert(id.clone(), e.to_string());

                    for dependent in graph.transitive_dependents(&id) {
                        skipped.entry(dependent.clone()).or_insert_with(|| {
                            warn!(
                                id = %dependent,
                                failed = %id,
                                "Skipping descriptor, dependency failed"
                            );
                            id.clone()
                        });
                    }
                }
            }
        }

        let cancelled = self.options.cancel.is_cancelled();
        if cancelled {
            info!("Reconciliation cancelled, in-flight work drained");
        }

        Ok(ApplyReport::build(
            plan, &states, &actions, &errors, &skipped, cancelled,
        ))
    }
}

/// One row of a read-only plan preview
#[derive(Debug, Clone)]
pub struct PreviewRow {
    pub id: String,
    pub kind: ResourceKind,
    /// What apply would do, or `None` when the lookup itself failed
    pub action: Option<Action>,
    pub error: Option<String>,
}

/// Read-only diff of a plan against observed state: what `apply` would do,
/// with zero mutating calls. Lookups run sequentially in apply order.
pub async fn preview(
    provider: &dyn ResourceProvider,
    plan: &DeploymentPlan,
) -> Result<Vec<PreviewRow>, PreflightError> {
    plan.validate()?;
    let graph = DependencyGraph::build(&plan.descriptors)?;

    let mut rows = Vec::with_capacity(plan.descriptors.len());
    for id in graph.apply_order() {
        let desc = plan.get(id).expect("descriptor in plan");
        let row = match provider.fetch(desc).await {
            Ok(Some(observed)) if observed.satisfies(&desc.desired) => PreviewRow {
                id: id.clone(),
                kind: desc.kind,
                action: Some(Action::Unchanged),
                error: None,
            },
            Ok(Some(_)) => PreviewRow {
                id: id.clone(),
                kind: desc.kind,
                action: Some(Action::Updated),
                error: None,
            },
            Ok(None) => PreviewRow {
                id: id.clone(),
                kind: desc.kind,
                action: Some(Action::Created),
                error: None,
            },
            Err(e) => PreviewRow {
                id: id.clone(),
                kind: desc.kind,
                action: None,
                error: Some(e.to_string()),
            },
        };
        rows.push(row);
    }
    Ok(rows)
}

/// Pop the next non-skipped ready descriptor
fn next_ready(ready: &mut VecDeque<String>, skipped: &HashMap<String, String>) -> Option<String> {
    while let Some(id) = ready.pop_front() {
        if !skipped.contains_key(&id) {
            return Some(id);
        }
    }
    None
}

/// Apply a single descriptor: fetch, then create / update / no-op.
async fn apply_one(
    provider: Arc<dyn ResourceProvider>,
    secrets: Arc<SecretEngine>,
    desc: &ResourceDescriptor,
    deps: DepView,
    retry: &RetrySchedule,
    allow_destructive: bool,
) -> Result<(Resolved, Action), ProviderError> {
    let observed = with_retries(retry, "fetch", &desc.id, || provider.fetch(desc)).await?;

    match observed {
        Some(current) if current.satisfies(&desc.desired) => {
            debug!(id = %desc.id, kind = %desc.kind, "Already converged");
            Ok((Resolved { attrs: current.attrs }, Action::Unchanged))
        }
        Some(current) => {
            if desc.is_protected() && !allow_destructive && needs_replacement(desc, &current) {
                return Err(ProviderError::InvalidRequest(format!(
                    "converging '{}' would replace a protected resource; \
                     pass --allow-destructive-override to proceed",
                    desc.id
                )));
            }
            info!(id = %desc.id, kind = %desc.kind, "Updating divergent resource");
            let res = with_retries(retry, "update", &desc.id, || {
                provider.update(desc, &current, &deps)
            })
            .await?;
            Ok((res, Action::Updated))
        }
        None => {
            // Secret material exists only here, between generation and the
            // store write; it never reaches the resolved-attributes table.
            let payload: Option<SecretMaterial> = if desc.kind == ResourceKind::SecretVersion {
                let policy = desc.desired.get("policy").cloned().unwrap_or_default();
                Some(
                    secrets
                        .material_for(&desc.id, &policy)
                        .map_err(|e| ProviderError::InvalidRequest(e.to_string()))?,
                )
            } else {
                None
            };

            info!(id = %desc.id, kind = %desc.kind, "Creating resource");
            let created = with_retries(retry, "create", &desc.id, || {
                provider.create(desc, &deps, payload.as_ref())
            })
            .await;

            match created {
                Ok(res) => Ok((res, Action::Created)),
                // Lost a race with a concurrent creator: adopt the resource.
                Err(e) if e.is_already_exists() => {
                    let adopted = with_retries(retry, "fetch", &desc.id, || provider.fetch(desc))
                        .await?
                        .ok_or(ProviderError::AlreadyExists)?;
                    Ok((Resolved { attrs: adopted.attrs }, Action::Unchanged))
                }
                Err(e) => Err(e),
            }
        }
    }
}

/// Retry a provider call on transient errors with bounded exponential
/// backoff. Permanent errors propagate immediately.
async fn with_retries<T, F, Fut>(
    schedule: &RetrySchedule,
    op: &'static str,
    id: &str,
    call: F,
) -> Result<T, ProviderError>
where
    F: Fn() -> Fut,
    Fut: std::future::Future<Output = Result<T, ProviderError>>,
{
    call.retry(
        ExponentialBuilder::default()
            .with_min_delay(schedule.min_delay)
            .with_max_delay(schedule.max_delay)
            .with_max_times(schedule.max_attempts.saturating_sub(1)),
    )
    .when(ProviderError::is_retryable)
    .notify(|err, dur| {
        warn!(
            id = %id,
            op = op,
            delay = ?dur,
            error = %err,
            "Transient provider error, backing off"
        );
    })
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::ResourceKind;
    use crate::provider::memory::{FailureMode, MemoryProvider};

    fn fast_options() -> ReconcileOptions {
        ReconcileOptions {
            workers: 2,
            retry: RetrySchedule {
                min_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(5),
                max_attempts: 5,
            },
            ..Default::default()
        }
    }

    fn tiny_plan() -> DeploymentPlan {
        DeploymentPlan {
            project: "proj".into(),
            region: "europe-west1".into(),
            prefix: "t".into(),
            descriptors: vec![
                ResourceDescriptor::new("sa", ResourceKind::ServiceAccount)
                    .with("account_id", "t-runner"),
                ResourceDescriptor::new("bucket", ResourceKind::StorageBucket)
                    .with("location", "EU"),
                ResourceDescriptor::new("binding", ResourceKind::StorageBucketBinding)
                    .with("bucket", "bucket")
                    .with("service_account", "sa")
                    .with("role", "roles/storage.objectViewer")
                    .depends_on("bucket")
                    .depends_on("sa"),
            ],
        }
    }

    #[tokio::test]
    async fn transient_failures_are_retried() {
        let provider = Arc::new(MemoryProvider::new());
        provider.inject_failure("sa", FailureMode::Transient(2));

        let reconciler = Reconciler::new(provider.clone(), SecretEngine::new(), fast_options());
        let report = reconciler.apply(&tiny_plan()).await.unwrap();

        assert_eq!(report.outcome(), ApplyOutcome::Success);
        assert!(provider.contains("sa"));
    }

    #[tokio::test]
    async fn permanent_failures_are_not_retried() {
        let provider = Arc::new(MemoryProvider::new());
        provider.inject_failure("bucket", FailureMode::Permanent);

        let reconciler = Reconciler::new(provider.clone(), SecretEngine::new(), fast_options());
        let report = reconciler.apply(&tiny_plan()).await.unwrap();

        assert_eq!(report.outcome(), ApplyOutcome::PartialFailure);
        let bucket = report.outcome_for("bucket").unwrap();
        assert_eq!(bucket.state, ResourceState::Failed);
        // Exactly one create attempt for the bucket: no retries on a
        // permanent error.
        assert_eq!(
            provider
                .create_order()
                .iter()
                .filter(|id| id.as_str() == "bucket")
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn cancelled_before_start_applies_nothing() {
        let provider = Arc::new(MemoryProvider::new());
        let options = fast_options();
        options.cancel.cancel();

        let reconciler = Reconciler::new(provider.clone(), SecretEngine::new(), options);
        let report = reconciler.apply(&tiny_plan()).await.unwrap();

        assert_eq!(report.outcome(), ApplyOutcome::Cancelled);
        assert_eq!(provider.counts().mutations(), 0);
    }

    #[tokio::test]
    async fn preflight_cycle_aborts_without_mutation() {
        let provider = Arc::new(MemoryProvider::new());
        let plan = DeploymentPlan {
            project: "p".into(),
            region: "r".into(),
            prefix: "t".into(),
            descriptors: vec![
                ResourceDescriptor::new("a", ResourceKind::Secret).depends_on("b"),
                ResourceDescriptor::new("b", ResourceKind::Secret).depends_on("a"),
            ],
        };

        let reconciler = Reconciler::new(provider.clone(), SecretEngine::new(), fast_options());
        let err = reconciler.apply(&plan).await.unwrap_err();

        assert!(matches!(
            err,
            PreflightError::Graph(GraphError::CyclicDependency { .. })
        ));
        assert_eq!(provider.counts().fetch, 0);
        assert_eq!(provider.counts().mutations(), 0);
    }
}
