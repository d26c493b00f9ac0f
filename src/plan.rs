//! Plan builder
//!
//! Derives the full descriptor set for one deployment from its
//! configuration. The plan is rebuilt from scratch on every run and is
//! immutable once apply begins; all ordering is expressed through
//! `depends_on` references, never hardcoded in the reconciler.

use crate::config::{DeployConfig, ARTIFACT_MOUNT_PATH};
use crate::model::{DeploymentPlan, ResourceDescriptor, ResourceKind};
use crate::secrets::SecretPolicy;

/// Descriptor ids are stable logical names; remote resource names derive
/// from the deployment prefix inside each descriptor's desired config.
pub mod ids {
    pub const SERVICE_ACCOUNT: &str = "service-account";
    pub const DB_INSTANCE: &str = "db-instance";
    pub const DATABASE: &str = "database";
    pub const DB_USER: &str = "db-user";
    pub const DB_PASSWORD_SECRET: &str = "db-password-secret";
    pub const DB_PASSWORD: &str = "db-password";
    pub const ENCRYPTION_KEY_SECRET: &str = "encryption-key-secret";
    pub const ENCRYPTION_KEY: &str = "encryption-key";
    pub const DB_PASSWORD_ACCESS: &str = "db-password-access";
    pub const ENCRYPTION_KEY_ACCESS: &str = "encryption-key-access";
    pub const SQL_CLIENT: &str = "sql-client";
    pub const BUCKET: &str = "bucket";
    pub const BUCKET_ACCESS: &str = "bucket-access";
    pub const ARTIFACT_REPO: &str = "artifact-repo";
    pub const SERVICE: &str = "service";
}

/// Build the deployment plan from configuration.
///
/// Resource wiring: one service account; a protected database instance with
/// one database and one user; two secrets (database password, encryption
/// key) with one version each; least-privilege accessor bindings between the
/// service account and each secret; a project-level Cloud SQL client grant;
/// a protected, versioned artifact bucket with a read-write grant; an
/// optional Artifact Registry repository when a custom image is configured;
/// and the Cloud Run service depending on all of the above.
pub fn build_plan(config: &DeployConfig) -> DeploymentPlan {
    let prefix = &config.project.prefix;
    let region = &config.project.region;
    let mut descriptors = Vec::new();

    descriptors.push(
        ResourceDescriptor::new(ids::SERVICE_ACCOUNT, ResourceKind::ServiceAccount)
            .with("account_id", format!("{prefix}-runner"))
            .with("display_name", format!("{prefix} workflow runner")),
    );

    descriptors.push(
        ResourceDescriptor::new(ids::DB_INSTANCE, ResourceKind::DatabaseInstance)
            .with("name", format!("{prefix}-pg"))
            .with("region", region)
            .with("tier", &config.database.tier)
            .with("database_version", &config.database.version)
            .with("protected", "true"),
    );

    // Remote names are plan-deterministic so that fetch and delete work
    // standalone; only remote-assigned attributes (version handles,
    // connection names) flow through the resolved-attributes table.
    let instance_name = format!("{prefix}-pg");
    let db_password_secret = format!("{prefix}-db-password");
    let encryption_key_secret = format!("{prefix}-encryption-key");
    let runner_account = format!("{prefix}-runner");
    let bucket_name = format!("{}-{prefix}-nodes", config.project.project);

    descriptors.push(
        ResourceDescriptor::new(ids::DATABASE, ResourceKind::Database)
            .with("instance", &instance_name)
            .with("name", &config.database.database)
            .depends_on(ids::DB_INSTANCE),
    );

    descriptors.push(
        ResourceDescriptor::new(ids::DB_PASSWORD_SECRET, ResourceKind::Secret)
            .with("name", &db_password_secret),
    );
    descriptors.push(
        ResourceDescriptor::new(ids::DB_PASSWORD, ResourceKind::SecretVersion)
            .with("secret", &db_password_secret)
            .with("policy", SecretPolicy::DatabasePassword.as_str())
            .depends_on(ids::DB_PASSWORD_SECRET),
    );

    descriptors.push(
        ResourceDescriptor::new(ids::ENCRYPTION_KEY_SECRET, ResourceKind::Secret)
            .with("name", &encryption_key_secret),
    );
    descriptors.push(
        ResourceDescriptor::new(ids::ENCRYPTION_KEY, ResourceKind::SecretVersion)
            .with("secret", &encryption_key_secret)
            .with("policy", SecretPolicy::EncryptionKey.as_str())
            .depends_on(ids::ENCRYPTION_KEY_SECRET),
    );

    descriptors.push(
        ResourceDescriptor::new(ids::DB_USER, ResourceKind::DatabaseUser)
            .with("instance", &instance_name)
            .with("name", &config.database.user)
            .with("password_version", ids::DB_PASSWORD)
            .depends_on(ids::DB_INSTANCE)
            .depends_on(ids::DB_PASSWORD),
    );

    for (binding_id, secret_name, secret_desc) in [
        (
            ids::DB_PASSWORD_ACCESS,
            &db_password_secret,
            ids::DB_PASSWORD_SECRET,
        ),
        (
            ids::ENCRYPTION_KEY_ACCESS,
            &encryption_key_secret,
            ids::ENCRYPTION_KEY_SECRET,
        ),
    ] {
        descriptors.push(
            ResourceDescriptor::new(binding_id, ResourceKind::IamBinding)
                .with("role", "roles/secretmanager.secretAccessor")
                .with("service_account", &runner_account)
                .with("target", secret_name)
                .with("target_kind", "secret")
                .depends_on(ids::SERVICE_ACCOUNT)
                .depends_on(secret_desc),
        );
    }

    descriptors.push(
        ResourceDescriptor::new(ids::SQL_CLIENT, ResourceKind::IamBinding)
            .with("role", "roles/cloudsql.client")
            .with("service_account", &runner_account)
            .with("target", "project")
            .with("target_kind", "project")
            .depends_on(ids::SERVICE_ACCOUNT),
    );

    descriptors.push(
        ResourceDescriptor::new(ids::BUCKET, ResourceKind::StorageBucket)
            .with("name", &bucket_name)
            .with("location", region.to_uppercase())
            .with("versioning", "true")
            .with("protected", "true"),
    );
    descriptors.push(
        ResourceDescriptor::new(ids::BUCKET_ACCESS, ResourceKind::StorageBucketBinding)
            .with("bucket", &bucket_name)
            .with("service_account", &runner_account)
            .with("role", "roles/storage.objectAdmin")
            .depends_on(ids::BUCKET)
            .depends_on(ids::SERVICE_ACCOUNT),
    );

    if config.service.custom_image.is_some() {
        descriptors.push(
            ResourceDescriptor::new(ids::ARTIFACT_REPO, ResourceKind::ArtifactRepository)
                .with("name", format!("{prefix}-images"))
                .with("location", region)
                .with("format", "DOCKER"),
        );
    }

    descriptors.push(service_descriptor(config));

    DeploymentPlan {
        project: config.project.project.clone(),
        region: region.clone(),
        prefix: prefix.clone(),
        descriptors,
    }
}

/// The Cloud Run service descriptor, including the container contract.
fn service_descriptor(config: &DeployConfig) -> ResourceDescriptor {
    let service = &config.service;
    let port = service.container_port();

    let mut desc = ResourceDescriptor::new(ids::SERVICE, ResourceKind::ComputeService)
        .with("name", &config.project.prefix)
        .with("region", &config.project.region)
        .with("image", service.image())
        .with("container_port", port.to_string())
        .with("service_account", format!("{}-runner", config.project.prefix))
        // Volumes: database socket and the extension-artifacts bucket
        .with("cloudsql_instance", ids::DB_INSTANCE)
        .with("artifact_bucket", ids::BUCKET)
        .with("artifact_mount_path", ARTIFACT_MOUNT_PATH)
        // Startup probe (TCP connect against the container port)
        .with(
            "probe_initial_delay",
            service.probe.initial_delay_secs.to_string(),
        )
        .with("probe_timeout", service.probe.timeout_secs.to_string())
        .with("probe_period", service.probe.period_secs.to_string())
        .with(
            "probe_failure_threshold",
            service.probe.failure_threshold.to_string(),
        )
        // Environment the wrapped application is configured through
        .with("env.DB_TYPE", "postgresdb")
        .with("env.DB_POSTGRESDB_DATABASE", &config.database.database)
        .with("env.DB_POSTGRESDB_USER", &config.database.user)
        .with("env.DB_POSTGRESDB_PORT", "5432")
        .with("env.N8N_PORT", port.to_string())
        .with("env.N8N_PROTOCOL", "https")
        .with("env.N8N_HOST", host_of(&service.public_url))
        .with("env.WEBHOOK_URL", &service.public_url)
        .with("env.N8N_PROXY_HOPS", service.proxy_hops.to_string())
        .with("env.QUEUE_HEALTH_CHECK_ACTIVE", "true")
        // Secret-backed environment, referencing explicit version handles
        .with("secret_env.DB_POSTGRESDB_PASSWORD", ids::DB_PASSWORD)
        .with("secret_env.N8N_ENCRYPTION_KEY", ids::ENCRYPTION_KEY)
        // The instance and bucket are direct dependencies: their resolved
        // attributes (connection name, bucket name) feed the volume wiring.
        .depends_on(ids::DB_INSTANCE)
        .depends_on(ids::DATABASE)
        .depends_on(ids::DB_USER)
        .depends_on(ids::DB_PASSWORD)
        .depends_on(ids::ENCRYPTION_KEY)
        .depends_on(ids::DB_PASSWORD_ACCESS)
        .depends_on(ids::ENCRYPTION_KEY_ACCESS)
        .depends_on(ids::SQL_CLIENT)
        .depends_on(ids::BUCKET)
        .depends_on(ids::BUCKET_ACCESS);

    if service.custom_image.is_some() {
        desc = desc
            .with("env.N8N_PATH", &service.path)
            .depends_on(ids::ARTIFACT_REPO);
    }

    desc
}

/// Hostname part of the public base URL
fn host_of(url: &str) -> String {
    url.trim_start_matches("https://")
        .trim_start_matches("http://")
        .split('/')
        .next()
        .unwrap_or(url)
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{
        DatabaseConfig, ProbeConfig, ProjectConfig, SecretsConfig, ServiceConfig,
    };
    use crate::graph::DependencyGraph;

    fn test_config(custom_image: Option<&str>) -> DeployConfig {
        DeployConfig {
            project: ProjectConfig {
                project: "acme-prod".to_string(),
                region: "europe-west1".to_string(),
                prefix: "n8n".to_string(),
            },
            database: DatabaseConfig::default(),
            service: ServiceConfig {
                custom_image: custom_image.map(String::from),
                public_url: "https://n8n.acme.example/".to_string(),
                path: "/".to_string(),
                proxy_hops: 1,
                probe: ProbeConfig::default(),
            },
            secrets: SecretsConfig::default(),
        }
    }

    #[test]
    fn plan_validates_and_orders() {
        let plan = build_plan(&test_config(None));
        plan.validate().unwrap();
        let graph = DependencyGraph::build(&plan.descriptors).unwrap();
        // The service is always last: everything else is a dependency.
        assert_eq!(graph.apply_order().last().unwrap(), ids::SERVICE);
    }

    #[test]
    fn official_image_omits_path_and_uses_5678() {
        let plan = build_plan(&test_config(None));
        let service = plan.get(ids::SERVICE).unwrap();

        assert_eq!(service.desired.get("container_port").unwrap(), "5678");
        assert_eq!(service.desired.get("env.N8N_PORT").unwrap(), "5678");
        assert!(!service.desired.contains_key("env.N8N_PATH"));
        assert!(plan.get(ids::ARTIFACT_REPO).is_none());
    }

    #[test]
    fn custom_image_includes_path_and_uses_443() {
        let plan = build_plan(&test_config(Some(
            "europe-west1-docker.pkg.dev/acme-prod/n8n-images/n8n:1",
        )));
        let service = plan.get(ids::SERVICE).unwrap();

        assert_eq!(service.desired.get("container_port").unwrap(), "443");
        assert_eq!(service.desired.get("env.N8N_PORT").unwrap(), "443");
        assert_eq!(service.desired.get("env.N8N_PATH").unwrap(), "/");
        assert!(plan.get(ids::ARTIFACT_REPO).is_some());
        assert!(service
            .depends_on
            .contains(&ids::ARTIFACT_REPO.to_string()));
    }

    #[test]
    fn stateful_resources_are_protected() {
        let plan = build_plan(&test_config(None));
        assert!(plan.get(ids::DB_INSTANCE).unwrap().is_protected());
        assert!(plan.get(ids::BUCKET).unwrap().is_protected());
        assert!(!plan.get(ids::SERVICE).unwrap().is_protected());
    }

    #[test]
    fn secret_env_references_version_descriptors_not_plaintext() {
        let plan = build_plan(&test_config(None));
        let service = plan.get(ids::SERVICE).unwrap();
        assert_eq!(
            service.desired.get("secret_env.DB_POSTGRESDB_PASSWORD").unwrap(),
            ids::DB_PASSWORD
        );
        assert_eq!(
            service.desired.get("secret_env.N8N_ENCRYPTION_KEY").unwrap(),
            ids::ENCRYPTION_KEY
        );
    }

    #[test]
    fn service_waits_for_every_binding() {
        let plan = build_plan(&test_config(None));
        let service = plan.get(ids::SERVICE).unwrap();
        for dep in [
            ids::DB_PASSWORD_ACCESS,
            ids::ENCRYPTION_KEY_ACCESS,
            ids::SQL_CLIENT,
            ids::BUCKET_ACCESS,
        ] {
            assert!(service.depends_on.contains(&dep.to_string()), "missing {dep}");
        }
    }
}
