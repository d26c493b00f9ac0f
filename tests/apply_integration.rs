//! End-to-end apply scenarios against the in-memory provider

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use runway::config::{
    DatabaseConfig, DeployConfig, ProbeConfig, ProjectConfig, SecretsConfig, ServiceConfig,
};
use runway::model::{DeploymentPlan, ResourceDescriptor, ResourceKind, ResourceState};
use runway::plan::{build_plan, ids};
use runway::provider::memory::{FailureMode, MemoryProvider};
use runway::provider::ResourceProvider;
use runway::reconcile::{
    preview, Action, ApplyOutcome, ReconcileOptions, Reconciler, RetrySchedule,
};
use runway::secrets::{SecretEngine, SecretPolicy};

fn fast_options() -> ReconcileOptions {
    ReconcileOptions {
        workers: 4,
        retry: RetrySchedule {
            min_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(5),
            max_attempts: 5,
        },
        cancel: CancellationToken::new(),
        allow_destructive_override: false,
    }
}

fn deploy_config(custom_image: Option<&str>) -> DeployConfig {
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

/// A linear five-node chain covering the kinds a minimal deployment needs.
fn chain_plan() -> DeploymentPlan {
    DeploymentPlan {
        project: "acme-prod".into(),
        region: "europe-west1".into(),
        prefix: "chain".into(),
        descriptors: vec![
            ResourceDescriptor::new("db-instance", ResourceKind::DatabaseInstance)
                .with("name", "chain-pg")
                .with("region", "europe-west1")
                .with("tier", "db-f1-micro")
                .with("database_version", "POSTGRES_16"),
            ResourceDescriptor::new("db-user", ResourceKind::DatabaseUser)
                .with("instance", "chain-pg")
                .with("name", "app")
                .depends_on("db-instance"),
            ResourceDescriptor::new("db-password", ResourceKind::Secret)
                .with("name", "chain-db-password")
                .depends_on("db-user"),
            ResourceDescriptor::new("iam-binding", ResourceKind::IamBinding)
                .with("role", "roles/secretmanager.secretAccessor")
                .with("service_account", "chain-runner")
                .with("target", "chain-db-password")
                .with("target_kind", "secret")
                .depends_on("db-password"),
            ResourceDescriptor::new("service", ResourceKind::ComputeService)
                .with("name", "chain")
                .with("region", "europe-west1")
                .with("image", "docker.n8n.io/n8nio/n8n")
                .with("container_port", "5678")
                .depends_on("iam-binding"),
        ],
    }
}

#[tokio::test]
async fn five_node_chain_creates_in_order() {
    let provider = Arc::new(MemoryProvider::new());
    let reconciler = Reconciler::new(provider.clone(), SecretEngine::new(), fast_options());

    let report = reconciler.apply(&chain_plan()).await.unwrap();

    assert_eq!(report.outcome(), ApplyOutcome::Success);
    assert_eq!(
        report.outcome_for("service").unwrap().state,
        ResourceState::Ready
    );
    assert_eq!(
        provider.create_order(),
        vec!["db-instance", "db-user", "db-password", "iam-binding", "service"]
    );
    assert_eq!(provider.counts().create, 5);
    assert_eq!(provider.counts().update, 0);
}

#[tokio::test]
async fn reapplying_converged_plan_mutates_nothing() {
    let provider = Arc::new(MemoryProvider::new());
    let plan = build_plan(&deploy_config(None));

    let first = Reconciler::new(provider.clone(), SecretEngine::new(), fast_options())
        .apply(&plan)
        .await
        .unwrap();
    assert_eq!(first.outcome(), ApplyOutcome::Success);
    let after_first = provider.counts();
    assert!(after_first.create > 0);

    let second = Reconciler::new(provider.clone(), SecretEngine::new(), fast_options())
        .apply(&plan)
        .await
        .unwrap();
    assert_eq!(second.outcome(), ApplyOutcome::Success);

    let after_second = provider.counts();
    assert_eq!(
        after_second.mutations(),
        after_first.mutations(),
        "re-apply of a converged plan must issue zero mutating calls"
    );
    assert!(second
        .outcomes
        .iter()
        .all(|o| o.action == Some(Action::Unchanged)));
}

#[tokio::test]
async fn failed_branch_skips_dependents_but_not_siblings() {
    let provider = Arc::new(MemoryProvider::new());
    provider.inject_failure(ids::DB_INSTANCE, FailureMode::Permanent);

    let plan = build_plan(&deploy_config(None));
    let report = Reconciler::new(provider.clone(), SecretEngine::new(), fast_options())
        .apply(&plan)
        .await
        .unwrap();

    assert_eq!(report.outcome(), ApplyOutcome::PartialFailure);

    // The failed descriptor carries the provider error
    let failed = report.outcome_for(ids::DB_INSTANCE).unwrap();
    assert_eq!(failed.state, ResourceState::Failed);
    assert!(failed.error.is_some());

    // Everything downstream of the instance is skipped, never attempted
    for id in [ids::DATABASE, ids::DB_USER, ids::SERVICE] {
        let outcome = report.outcome_for(id).unwrap();
        assert_eq!(outcome.state, ResourceState::Planned, "{id} must be skipped");
        assert!(outcome.skipped_because.is_some(), "{id} must carry a skip reason");
        assert!(!provider.contains(id), "{id} must not be created");
    }

    // Independent branches still converge
    for id in [
        ids::SERVICE_ACCOUNT,
        ids::BUCKET,
        ids::BUCKET_ACCESS,
        ids::DB_PASSWORD_SECRET,
        ids::DB_PASSWORD,
        ids::ENCRYPTION_KEY,
        ids::SQL_CLIENT,
    ] {
        assert_eq!(
            report.outcome_for(id).unwrap().state,
            ResourceState::Ready,
            "{id} is independent of the database instance"
        );
    }
}

#[tokio::test]
async fn full_deployment_applies_and_secrets_meet_policy() {
    let provider = Arc::new(MemoryProvider::new());
    let plan = build_plan(&deploy_config(None));

    let report = Reconciler::new(provider.clone(), SecretEngine::new(), fast_options())
        .apply(&plan)
        .await
        .unwrap();

    assert_eq!(report.outcome(), ApplyOutcome::Success);
    assert!(report
        .outcomes
        .iter()
        .all(|o| o.state == ResourceState::Ready));

    // Stored secret material satisfies the policy of its version descriptor
    for (version_id, policy) in [
        (ids::DB_PASSWORD, SecretPolicy::DatabasePassword),
        (ids::ENCRYPTION_KEY, SecretPolicy::EncryptionKey),
    ] {
        let desc = plan.get(version_id).unwrap();
        let observed = provider.fetch(desc).await.unwrap().expect("version exists");
        let handle = observed.attrs.get("version").expect("version handle");
        let material = provider
            .stored_secret_material(handle)
            .expect("material stored");
        policy.check(&material).expect("stored material meets policy");
    }
}

#[tokio::test]
async fn supplied_encryption_key_is_stored_verbatim() {
    let provider = Arc::new(MemoryProvider::new());
    let key = "0123456789abcdefghijABCDEFGHIJ0123456789abcdefgh";

    let mut engine = SecretEngine::new();
    engine
        .supply(ids::ENCRYPTION_KEY, key, SecretPolicy::EncryptionKey)
        .unwrap();

    let plan = build_plan(&deploy_config(None));
    let report = Reconciler::new(provider.clone(), engine, fast_options())
        .apply(&plan)
        .await
        .unwrap();
    assert_eq!(report.outcome(), ApplyOutcome::Success);

    let desc = plan.get(ids::ENCRYPTION_KEY).unwrap();
    let observed = provider.fetch(desc).await.unwrap().unwrap();
    let handle = observed.attrs.get("version").unwrap();
    assert_eq!(provider.stored_secret_material(handle).unwrap(), key);
}

#[tokio::test]
async fn supplied_material_violating_policy_fails_preflight() {
    let mut engine = SecretEngine::new();
    let err = engine
        .supply(ids::ENCRYPTION_KEY, "too-short", SecretPolicy::EncryptionKey)
        .unwrap_err();
    assert!(err.to_string().contains("encryption-key"));
}

#[tokio::test]
async fn official_and_custom_images_branch_the_container_contract() {
    // Official image: port 5678, no path entry
    let provider = Arc::new(MemoryProvider::new());
    let plan = build_plan(&deploy_config(None));
    Reconciler::new(provider.clone(), SecretEngine::new(), fast_options())
        .apply(&plan)
        .await
        .unwrap();

    let service = provider
        .fetch(plan.get(ids::SERVICE).unwrap())
        .await
        .unwrap()
        .expect("service exists");
    assert_eq!(service.config.get("container_port").unwrap(), "5678");
    assert_eq!(service.config.get("env.N8N_PORT").unwrap(), "5678");
    assert!(!service.config.contains_key("env.N8N_PATH"));

    // Custom image: port 443, path entry present, artifact repo provisioned
    let provider = Arc::new(MemoryProvider::new());
    let plan = build_plan(&deploy_config(Some(
        "europe-west1-docker.pkg.dev/acme-prod/n8n-images/n8n:1",
    )));
    Reconciler::new(provider.clone(), SecretEngine::new(), fast_options())
        .apply(&plan)
        .await
        .unwrap();

    let service = provider
        .fetch(plan.get(ids::SERVICE).unwrap())
        .await
        .unwrap()
        .expect("service exists");
    assert_eq!(service.config.get("container_port").unwrap(), "443");
    assert_eq!(service.config.get("env.N8N_PORT").unwrap(), "443");
    assert_eq!(service.config.get("env.N8N_PATH").unwrap(), "/");
    assert!(provider.contains(ids::ARTIFACT_REPO));
}

#[tokio::test]
async fn preview_reports_without_mutating() {
    let provider = Arc::new(MemoryProvider::new());
    let plan = build_plan(&deploy_config(None));

    let rows = preview(provider.as_ref(), &plan).await.unwrap();
    assert_eq!(rows.len(), plan.descriptors.len());
    assert!(rows.iter().all(|r| r.action == Some(Action::Created)));
    assert_eq!(provider.counts().mutations(), 0);

    // After an apply, preview reports everything unchanged
    Reconciler::new(provider.clone(), SecretEngine::new(), fast_options())
        .apply(&plan)
        .await
        .unwrap();
    let before = provider.counts().mutations();
    let rows = preview(provider.as_ref(), &plan).await.unwrap();
    assert!(rows.iter().all(|r| r.action == Some(Action::Unchanged)));
    assert_eq!(provider.counts().mutations(), before);
}

#[tokio::test]
async fn resolved_attributes_flow_to_dependents() {
    let provider = Arc::new(MemoryProvider::new());
    let plan = build_plan(&deploy_config(None));

    Reconciler::new(provider.clone(), SecretEngine::new(), fast_options())
        .apply(&plan)
        .await
        .unwrap();

    // The database user was provisioned with material from the version the
    // plan wired it to: the fake provider would have failed the create if
    // the handle had not resolved through the dependency view.
    assert!(provider.contains(ids::DB_USER));
    assert!(provider.contains(ids::SERVICE));
}
