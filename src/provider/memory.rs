//! In-memory provider
//!
//! A fake provider backing the integration test suites. Stores resources in
//! a process-local map, counts every call, and supports failure injection so
//! retry and bulkhead behavior can be exercised without a cloud project.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{DeleteOutcome, DepView, Observed, ProviderError, Resolved, ResourceProvider};
use crate::model::{ResourceDescriptor, ResourceKind};
use crate::secrets::SecretMaterial;

/// Per-operation call counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallCounts {
    pub fetch: usize,
    pub create: usize,
    pub update: usize,
    pub delete: usize,
}

impl CallCounts {
    /// Total number of mutating calls (everything except fetch)
    pub fn mutations(&self) -> usize {
        self.create + self.update + self.delete
    }
}

/// How an injected failure behaves
#[derive(Debug, Clone, Copy)]
pub enum FailureMode {
    /// Fail every mutating call on the resource (permanent error)
    Permanent,
    /// Fail the next `n` mutating calls with a retryable error, then succeed
    Transient(usize),
}

#[derive(Default)]
struct Inner {
    resources: HashMap<String, Observed>,
    /// version handle -> plaintext, mimicking the secret store
    secret_payloads: HashMap<String, String>,
    /// secret descriptor id -> next version number
    version_counters: HashMap<String, u64>,
    failures: HashMap<String, FailureMode>,
    counts: CallCounts,
    /// (operation, descriptor id) in call order
    mutation_log: Vec<(&'static str, String)>,
}

/// Call-counting fake provider
#[derive(Default)]
pub struct MemoryProvider {
    inner: Mutex<Inner>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a failure for mutating calls on one descriptor id.
    pub fn inject_failure(&self, id: &str, mode: FailureMode) {
        self.inner
            .lock()
            .unwrap()
            .failures
            .insert(id.to_string(), mode);
    }

    /// Snapshot of the call counters
    pub fn counts(&self) -> CallCounts {
        self.inner.lock().unwrap().counts
    }

    /// Descriptor ids passed to `create`, in call order
    pub fn create_order(&self) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .mutation_log
            .iter()
            .filter(|(op, _)| *op == "create")
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Whether a resource currently exists in the fake store
    pub fn contains(&self, id: &str) -> bool {
        self.inner.lock().unwrap().resources.contains_key(id)
    }

    /// Plaintext stored for a secret version handle (test assertions only)
    pub fn stored_secret_material(&self, version_handle: &str) -> Option<String> {
        self.inner
            .lock()
            .unwrap()
            .secret_payloads
            .get(version_handle)
            .cloned()
    }

    /// Consume one injected failure charge, returning the error to raise.
    fn take_failure(inner: &mut Inner, id: &str) -> Option<ProviderError> {
        match inner.failures.get(id).copied() {
            Some(FailureMode::Permanent) => Some(ProviderError::InvalidRequest(format!(
                "injected permanent failure for '{id}'"
            ))),
            Some(FailureMode::Transient(0)) => {
                inner.failures.remove(id);
                None
            }
            Some(FailureMode::Transient(remaining)) => {
                inner
                    .failures
                    .insert(id.to_string(), FailureMode::Transient(remaining - 1));
                Some(ProviderError::Throttled)
            }
            None => None,
        }
    }

    /// Remote-assigned attributes a real provider would return for this kind.
    fn assign_attrs(inner: &mut Inner, desc: &ResourceDescriptor) -> Resolved {
        match desc.kind {
            ResourceKind::DatabaseInstance => Resolved::default()
                .attr("name", desc.id.clone())
                .attr(
                    "connection_name",
                    format!(
                        "fake:{}:{}",
                        desc.desired.get("region").cloned().unwrap_or_default(),
                        desc.id
                    ),
                ),
            ResourceKind::ServiceAccount => {
                let account_id = desc.desired.get("account_id").cloned().unwrap_or_default();
                Resolved::default()
                    .attr("email", format!("{account_id}@fake.iam.gserviceaccount.com"))
            }
            ResourceKind::SecretVersion => {
                let secret = desc.desired.get("secret").cloned().unwrap_or_default();
                let counter = inner.version_counters.entry(secret.clone()).or_insert(0);
                *counter += 1;
                Resolved::default().attr(
                    "version",
                    format!("projects/fake/secrets/{secret}/versions/{counter}"),
                )
            }
            ResourceKind::StorageBucket => Resolved::default().attr("name", desc.id.clone()),
            ResourceKind::ComputeService => Resolved::default()
                .attr("uri", format!("https://{}.a.run.app", desc.id)),
            _ => Resolved::default().attr("name", desc.id.clone()),
        }
    }

    /// Observed config stored for a resource: the desired map minus local keys.
    fn observed_config(desc: &ResourceDescriptor) -> BTreeMap<String, String> {
        desc.desired
            .iter()
            .filter(|(k, _)| k.as_str() != "protected")
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

#[async_trait]
impl ResourceProvider for MemoryProvider {
    async fn fetch(
        &self,
        desc: &ResourceDescriptor,
    ) -> Result<Option<Observed>, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.counts.fetch += 1;
        Ok(inner.resources.get(&desc.id).cloned())
    }

    async fn create(
        &self,
        desc: &ResourceDescriptor,
        deps: &DepView,
        payload: Option<&SecretMaterial>,
    ) -> Result<Resolved, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.counts.create += 1;
        inner.mutation_log.push(("create", desc.id.clone()));

        if let Some(err) = Self::take_failure(&mut inner, &desc.id) {
            return Err(err);
        }
        if inner.resources.contains_key(&desc.id) {
            return Err(ProviderError::AlreadyExists);
        }

        let resolved = match desc.kind {
            ResourceKind::SecretVersion => {
                let material = payload.ok_or_else(|| {
                    ProviderError::InvalidRequest(format!(
                        "secret version '{}' created without material",
                        desc.id
                    ))
                })?;
                let resolved = Self::assign_attrs(&mut inner, desc);
                let handle = resolved.attrs["version"].clone();
                inner
                    .secret_payloads
                    .insert(handle, material.expose().to_string());
                resolved
            }
            ResourceKind::DatabaseUser => {
                // When a password reference is declared, read it from the
                // referenced secret version the way the real provider calls
                // the secret store.
                if let Some(version_id) = desc.desired.get("password_version") {
                    let handle = deps.require(version_id, "version")?;
                    if !inner.secret_payloads.contains_key(handle) {
                        return Err(ProviderError::NotFound {
                            kind: "secret-version",
                            id: handle.to_string(),
                        });
                    }
                }
                Self::assign_attrs(&mut inner, desc)
            }
            _ => Self::assign_attrs(&mut inner, desc),
        };

        inner.resources.insert(
            desc.id.clone(),
            Observed {
                config: Self::observed_config(desc),
                attrs: resolved.attrs.clone(),
            },
        );
        Ok(resolved)
    }

    async fn update(
        &self,
        desc: &ResourceDescriptor,
        observed: &Observed,
        _deps: &DepView,
    ) -> Result<Resolved, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.counts.update += 1;
        inner.mutation_log.push(("update", desc.id.clone()));

        if let Some(err) = Self::take_failure(&mut inner, &desc.id) {
            return Err(err);
        }

        let attrs = observed.attrs.clone();
        inner.resources.insert(
            desc.id.clone(),
            Observed {
                config: Self::observed_config(desc),
                attrs: attrs.clone(),
            },
        );
        Ok(Resolved { attrs })
    }

    async fn delete(&self, desc: &ResourceDescriptor) -> Result<DeleteOutcome, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.counts.delete += 1;
        inner.mutation_log.push(("delete", desc.id.clone()));

        if let Some(err) = Self::take_failure(&mut inner, &desc.id) {
            return Err(err);
        }

        match inner.resources.remove(&desc.id) {
            Some(_) => Ok(DeleteOutcome::Deleted),
            None => Ok(DeleteOutcome::AlreadyAbsent),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secret_version(id: &str, secret: &str) -> ResourceDescriptor {
        ResourceDescriptor::new(id, ResourceKind::SecretVersion)
            .with("secret", secret)
            .with("policy", "encryption-key")
    }

    #[tokio::test]
    async fn create_then_fetch_roundtrip() {
        let provider = MemoryProvider::new();
        let desc = ResourceDescriptor::new("bucket", ResourceKind::StorageBucket)
            .with("location", "EU")
            .with("protected", "true");

        provider
            .create(&desc, &DepView::default(), None)
            .await
            .unwrap();

        let observed = provider.fetch(&desc).await.unwrap().expect("stored");
        assert!(observed.satisfies(&desc.desired));
        assert!(!observed.config.contains_key("protected"));
        assert_eq!(provider.counts().create, 1);
    }

    #[tokio::test]
    async fn secret_versions_are_append_only() {
        let provider = MemoryProvider::new();
        let material = crate::secrets::SecretPolicy::EncryptionKey.generate();

        let v1 = provider
            .create(&secret_version("v1", "db-password"), &DepView::default(), Some(&material))
            .await
            .unwrap();
        let v2 = provider
            .create(&secret_version("v2", "db-password"), &DepView::default(), Some(&material))
            .await
            .unwrap();

        assert_ne!(v1.attrs["version"], v2.attrs["version"]);
    }

    #[tokio::test]
    async fn secret_version_without_payload_rejected() {
        let provider = MemoryProvider::new();
        let err = provider
            .create(&secret_version("v1", "s"), &DepView::default(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn delete_twice_reports_already_absent() {
        let provider = MemoryProvider::new();
        let desc = ResourceDescriptor::new("sa", ResourceKind::ServiceAccount)
            .with("account_id", "runner");

        provider
            .create(&desc, &DepView::default(), None)
            .await
            .unwrap();
        assert_eq!(
            provider.delete(&desc).await.unwrap(),
            DeleteOutcome::Deleted
        );
        assert_eq!(
            provider.delete(&desc).await.unwrap(),
            DeleteOutcome::AlreadyAbsent
        );
    }

    #[tokio::test]
    async fn transient_failures_expire() {
        let provider = MemoryProvider::new();
        provider.inject_failure("sa", FailureMode::Transient(2));
        let desc = ResourceDescriptor::new("sa", ResourceKind::ServiceAccount)
            .with("account_id", "runner");

        for _ in 0..2 {
            let err = provider
                .create(&desc, &DepView::default(), None)
                .await
                .unwrap_err();
            assert!(err.is_retryable());
        }
        provider
            .create(&desc, &DepView::default(), None)
            .await
            .unwrap();
    }
}
