//! Provider capability interface
//!
//! Remote state lookups and mutations are abstracted behind the
//! [`ResourceProvider`] trait, implemented per target: [`gcp::GcpProvider`]
//! speaks the Google REST APIs, [`memory::MemoryProvider`] is the in-memory
//! fake the test suites run against.

pub mod error;
pub mod gcp;
pub mod memory;

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;

pub use error::ProviderError;

use crate::model::ResourceDescriptor;
use crate::secrets::SecretMaterial;

/// Config keys interpreted by runway itself, never sent to or read from the
/// remote API.
const LOCAL_KEYS: &[&str] = &["protected"];

/// Snapshot of a remote resource's current state
#[derive(Debug, Clone, Default)]
pub struct Observed {
    /// Remote config normalized into the descriptor's key vocabulary
    pub config: BTreeMap<String, String>,
    /// Remote-assigned attributes (connection names, emails, version ids)
    pub attrs: BTreeMap<String, String>,
}

impl Observed {
    /// True when the remote state already satisfies the desired config.
    ///
    /// Every desired entry must be present with the same value; extra remote
    /// config is ignored. Local-only keys are excluded from the comparison.
    pub fn satisfies(&self, desired: &BTreeMap<String, String>) -> bool {
        desired
            .iter()
            .filter(|(k, _)| !LOCAL_KEYS.contains(&k.as_str()))
            .all(|(k, v)| self.config.get(k) == Some(v))
    }
}

/// Remote-assigned attributes recorded after a successful apply
#[derive(Debug, Clone, Default)]
pub struct Resolved {
    pub attrs: BTreeMap<String, String>,
}

impl Resolved {
    pub fn attr(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attrs.insert(key.into(), value.into());
        self
    }
}

/// Outcome of a delete call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    /// Resource was deleted by this call
    Deleted,
    /// Resource was already gone (idempotent destroy)
    AlreadyAbsent,
}

/// Read-only view of the resolved-attributes table, restricted to one
/// descriptor's declared dependencies.
#[derive(Debug, Clone, Default)]
pub struct DepView {
    entries: HashMap<String, BTreeMap<String, String>>,
}

impl DepView {
    pub fn new(entries: HashMap<String, BTreeMap<String, String>>) -> Self {
        Self { entries }
    }

    /// Attribute of a dependency, if resolved
    pub fn get(&self, id: &str, key: &str) -> Option<&str> {
        self.entries.get(id).and_then(|attrs| attrs.get(key)).map(String::as_str)
    }

    /// Attribute of a dependency; missing entries are an invalid request
    /// since the graph guarantees dependencies resolve before dependents.
    pub fn require(&self, id: &str, key: &str) -> Result<&str, ProviderError> {
        self.get(id, key).ok_or_else(|| {
            ProviderError::InvalidRequest(format!(
                "dependency '{id}' has no resolved attribute '{key}'"
            ))
        })
    }
}

/// Capability interface every provider implements per resource kind.
///
/// All calls are idempotent from the reconciler's perspective: `create` on an
/// already-present resource and `delete` on an already-absent one are the
/// provider's responsibility to absorb or report via the error taxonomy.
#[async_trait]
pub trait ResourceProvider: Send + Sync {
    /// Fetch current remote state, `None` when the resource does not exist.
    async fn fetch(
        &self,
        desc: &ResourceDescriptor,
    ) -> Result<Option<Observed>, ProviderError>;

    /// Create the resource. `payload` carries plaintext secret material for
    /// `SecretVersion` descriptors only; no other kind receives one.
    async fn create(
        &self,
        desc: &ResourceDescriptor,
        deps: &DepView,
        payload: Option<&SecretMaterial>,
    ) -> Result<Resolved, ProviderError>;

    /// Update a divergent resource in place towards the desired config.
    async fn update(
        &self,
        desc: &ResourceDescriptor,
        observed: &Observed,
        deps: &DepView,
    ) -> Result<Resolved, ProviderError>;

    /// Delete the resource, reporting already-absent as success.
    async fn delete(&self, desc: &ResourceDescriptor) -> Result<DeleteOutcome, ProviderError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn satisfies_ignores_local_and_extra_keys() {
        let mut observed = Observed::default();
        observed.config.insert("tier".into(), "db-f1-micro".into());
        observed.config.insert("extra".into(), "remote-only".into());

        let mut desired = BTreeMap::new();
        desired.insert("tier".to_string(), "db-f1-micro".to_string());
        desired.insert("protected".to_string(), "true".to_string());
        assert!(observed.satisfies(&desired));

        desired.insert("tier".to_string(), "db-custom-2-4096".to_string());
        assert!(!observed.satisfies(&desired));
    }

    #[test]
    fn dep_view_require_reports_missing() {
        let view = DepView::default();
        let err = view.require("db-instance", "connection_name").unwrap_err();
        assert!(matches!(err, ProviderError::InvalidRequest(_)));
    }
}
