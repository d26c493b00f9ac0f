//! Resource descriptor model
//!
//! A [`ResourceDescriptor`] is the logical declaration of one managed cloud
//! resource: a stable id, a kind, the ids it depends on, and the desired
//! configuration the reconciler converges the remote resource towards.
//! Descriptors are pure data; validation has no side effects.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors detected before any apply begins
#[derive(Debug, Error)]
pub enum ConfigError {
    /// A kind-required field is missing from the desired config
    #[error("descriptor '{id}' ({kind}) is missing required field '{field}'")]
    MissingField {
        id: String,
        kind: ResourceKind,
        field: &'static str,
    },

    /// A field is present but malformed
    #[error("descriptor '{id}' has invalid field '{field}': {reason}")]
    InvalidField {
        id: String,
        field: &'static str,
        reason: String,
    },

    /// Two descriptors in one plan share an id
    #[error("duplicate descriptor id '{id}'")]
    DuplicateId { id: String },

    /// A depends_on entry names a descriptor that is not in the plan
    #[error("descriptor '{id}' depends on unknown descriptor '{missing}'")]
    UnknownDependency { id: String, missing: String },
}

/// The kinds of managed resources runway provisions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceKind {
    /// Cloud Run service hosting the application container
    ComputeService,
    /// Cloud SQL instance
    DatabaseInstance,
    /// Logical database inside an instance
    Database,
    /// Database user (password sourced from a secret version)
    DatabaseUser,
    /// Secret Manager secret (container for versions)
    Secret,
    /// One immutable version of a secret's material
    SecretVersion,
    /// Service account the running application executes as
    ServiceAccount,
    /// IAM role grant (on a secret, a project, or another resource)
    IamBinding,
    /// GCS bucket for extension artifacts
    StorageBucket,
    /// IAM grant scoped to a bucket
    StorageBucketBinding,
    /// Artifact Registry repository for a custom container image
    ArtifactRepository,
}

impl ResourceKind {
    /// Short lowercase name used in logs and reports
    pub fn as_str(&self) -> &'static str {
        match self {
            ResourceKind::ComputeService => "compute-service",
            ResourceKind::DatabaseInstance => "database-instance",
            ResourceKind::Database => "database",
            ResourceKind::DatabaseUser => "database-user",
            ResourceKind::Secret => "secret",
            ResourceKind::SecretVersion => "secret-version",
            ResourceKind::ServiceAccount => "service-account",
            ResourceKind::IamBinding => "iam-binding",
            ResourceKind::StorageBucket => "storage-bucket",
            ResourceKind::StorageBucketBinding => "storage-bucket-binding",
            ResourceKind::ArtifactRepository => "artifact-repository",
        }
    }

    /// Fields that must be present in the desired config for this kind
    fn required_fields(&self) -> &'static [&'static str] {
        match self {
            ResourceKind::ComputeService => &["region", "image", "container_port"],
            ResourceKind::DatabaseInstance => &["region", "tier", "database_version"],
            ResourceKind::Database => &["instance"],
            ResourceKind::DatabaseUser => &["instance"],
            ResourceKind::Secret => &[],
            ResourceKind::SecretVersion => &["secret", "policy"],
            ResourceKind::ServiceAccount => &["account_id"],
            ResourceKind::IamBinding => &["role", "service_account", "target"],
            ResourceKind::StorageBucket => &["location"],
            ResourceKind::StorageBucketBinding => &["bucket", "role", "service_account"],
            ResourceKind::ArtifactRepository => &["location", "format"],
        }
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle state of a descriptor during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResourceState {
    /// Declared, not yet touched
    Planned,
    /// A create/update call is in flight
    Applying,
    /// Remote state matches desired state
    Ready,
    /// Apply failed; dependents will not be attempted
    Failed,
    /// A delete call is in flight
    Destroying,
    /// Remote resource confirmed gone
    Destroyed,
}

impl fmt::Display for ResourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceState::Planned => "planned",
            ResourceState::Applying => "applying",
            ResourceState::Ready => "ready",
            ResourceState::Failed => "failed",
            ResourceState::Destroying => "destroying",
            ResourceState::Destroyed => "destroyed",
        };
        f.write_str(s)
    }
}

/// Logical declaration of one managed resource and its dependencies
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    /// Stable logical name, unique within a deployment
    pub id: String,
    /// What this descriptor provisions
    pub kind: ResourceKind,
    /// Descriptor ids that must be Ready before this one applies
    pub depends_on: Vec<String>,
    /// Kind-specific desired configuration (ordered for stable diffs)
    pub desired: BTreeMap<String, String>,
}

impl ResourceDescriptor {
    /// Create a descriptor with no dependencies or config
    pub fn new(id: impl Into<String>, kind: ResourceKind) -> Self {
        Self {
            id: id.into(),
            kind,
            depends_on: Vec::new(),
            desired: BTreeMap::new(),
        }
    }

    /// Builder-style: add a dependency
    pub fn depends_on(mut self, id: impl Into<String>) -> Self {
        self.depends_on.push(id.into());
        self
    }

    /// Builder-style: set a desired config entry
    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.desired.insert(key.into(), value.into());
        self
    }

    /// Whether this resource is protected from destruction
    ///
    /// Protected resources are skipped by the destroy engine unless the
    /// caller passes the explicit destructive override.
    pub fn is_protected(&self) -> bool {
        self.desired
            .get("protected")
            .is_some_and(|v| v == "true")
    }

    /// Validate that the descriptor carries the fields its kind requires.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.id.is_empty() {
            return Err(ConfigError::InvalidField {
                id: "<empty>".to_string(),
                field: "id",
                reason: "descriptor id must not be empty".to_string(),
            });
        }

        for field in self.kind.required_fields() {
            match self.desired.get(*field) {
                None => {
                    return Err(ConfigError::MissingField {
                        id: self.id.clone(),
                        kind: self.kind,
                        field,
                    })
                }
                Some(v) if v.is_empty() => {
                    return Err(ConfigError::InvalidField {
                        id: self.id.clone(),
                        field,
                        reason: "value must not be empty".to_string(),
                    })
                }
                Some(_) => {}
            }
        }

        if let Some(port) = self.desired.get("container_port") {
            if port.parse::<u16>().is_err() {
                return Err(ConfigError::InvalidField {
                    id: self.id.clone(),
                    field: "container_port",
                    reason: format!("'{port}' is not a valid port number"),
                });
            }
        }

        Ok(())
    }
}

/// The full set of descriptors plus global parameters, produced at plan time.
///
/// Immutable once apply begins; regenerated on each run. Declaration order
/// is preserved and used as the deterministic tie-break when sorting.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentPlan {
    /// Cloud project the plan targets
    pub project: String,
    /// Default region for regional resources
    pub region: String,
    /// Naming prefix shared by all resources in the deployment
    pub prefix: String,
    /// Descriptors in declaration order
    pub descriptors: Vec<ResourceDescriptor>,
}

impl DeploymentPlan {
    /// Look up a descriptor by id
    pub fn get(&self, id: &str) -> Option<&ResourceDescriptor> {
        self.descriptors.iter().find(|d| d.id == id)
    }

    /// Validate every descriptor, id uniqueness, and dependency references.
    ///
    /// Fails before any mutation: a plan that does not validate is never
    /// handed to the reconciler.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut seen = std::collections::HashSet::new();
        for desc in &self.descriptors {
            if !seen.insert(desc.id.as_str()) {
                return Err(ConfigError::DuplicateId {
                    id: desc.id.clone(),
                });
            }
            desc.validate()?;
        }
        for desc in &self.descriptors {
            for dep in &desc.depends_on {
                if !seen.contains(dep.as_str()) {
                    return Err(ConfigError::UnknownDependency {
                        id: desc.id.clone(),
                        missing: dep.clone(),
                    });
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn database_instance_requires_tier() {
        let desc = ResourceDescriptor::new("db", ResourceKind::DatabaseInstance)
            .with("region", "europe-west1")
            .with("database_version", "POSTGRES_16");

        let err = desc.validate().unwrap_err();
        assert!(matches!(
            err,
            ConfigError::MissingField { field: "tier", .. }
        ));
    }

    #[test]
    fn empty_required_field_rejected() {
        let desc = ResourceDescriptor::new("db", ResourceKind::Database).with("instance", "");
        assert!(matches!(
            desc.validate(),
            Err(ConfigError::InvalidField {
                field: "instance",
                ..
            })
        ));
    }

    #[test]
    fn bad_port_rejected() {
        let desc = ResourceDescriptor::new("svc", ResourceKind::ComputeService)
            .with("region", "europe-west1")
            .with("image", "n8nio/n8n")
            .with("container_port", "not-a-port");
        assert!(matches!(
            desc.validate(),
            Err(ConfigError::InvalidField {
                field: "container_port",
                ..
            })
        ));
    }

    #[test]
    fn plan_rejects_duplicate_ids() {
        let plan = DeploymentPlan {
            project: "p".into(),
            region: "r".into(),
            prefix: "x".into(),
            descriptors: vec![
                ResourceDescriptor::new("sa", ResourceKind::ServiceAccount)
                    .with("account_id", "x-runner"),
                ResourceDescriptor::new("sa", ResourceKind::ServiceAccount)
                    .with("account_id", "x-runner"),
            ],
        };
        assert!(matches!(
            plan.validate(),
            Err(ConfigError::DuplicateId { .. })
        ));
    }

    #[test]
    fn plan_rejects_unknown_dependency() {
        let plan = DeploymentPlan {
            project: "p".into(),
            region: "r".into(),
            prefix: "x".into(),
            descriptors: vec![ResourceDescriptor::new("db", ResourceKind::Database)
                .with("instance", "missing")
                .depends_on("missing")],
        };
        assert!(matches!(
            plan.validate(),
            Err(ConfigError::UnknownDependency { .. })
        ));
    }

    #[test]
    fn protected_flag_parsed() {
        let desc = ResourceDescriptor::new("db", ResourceKind::DatabaseInstance)
            .with("protected", "true");
        assert!(desc.is_protected());
        let desc = ResourceDescriptor::new("db2", ResourceKind::DatabaseInstance);
        assert!(!desc.is_protected());
    }
}
