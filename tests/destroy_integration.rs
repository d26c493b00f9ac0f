//! End-to-end destroy scenarios against the in-memory provider

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use runway::config::{
    DatabaseConfig, DeployConfig, ProbeConfig, ProjectConfig, SecretsConfig, ServiceConfig,
};
use runway::destroy::{destroy, DestroyAction, DestroyOptions};
use runway::plan::{build_plan, ids};
use runway::provider::memory::MemoryProvider;
use runway::reconcile::{ReconcileOptions, Reconciler, RetrySchedule};
use runway::secrets::SecretEngine;

fn fast_retry() -> RetrySchedule {
    RetrySchedule {
        min_delay: Duration::from_millis(1),
        max_delay: Duration::from_millis(5),
        max_attempts: 5,
    }
}

fn deploy_config() -> DeployConfig {
    DeployConfig {
        project: ProjectConfig {
            project: "acme-prod".to_string(),
            region: "europe-west1".to_string(),
            prefix: "n8n".to_string(),
        },
        database: DatabaseConfig::default(),
        service: ServiceConfig {
            custom_image: None,
            public_url: "https://n8n.acme.example/".to_string(),
            path: "/".to_string(),
            proxy_hops: 1,
            probe: ProbeConfig::default(),
        },
        secrets: SecretsConfig::default(),
    }
}

async fn applied_provider() -> Arc<MemoryProvider> {
    let provider = Arc::new(MemoryProvider::new());
    let options = ReconcileOptions {
        retry: fast_retry(),
        ..Default::default()
    };
    Reconciler::new(provider.clone(), SecretEngine::new(), options)
        .apply(&build_plan(&deploy_config()))
        .await
        .unwrap();
    provider
}

#[tokio::test]
async fn destroy_with_override_removes_everything() {
    let provider = applied_provider().await;
    let plan = build_plan(&deploy_config());

    let options = DestroyOptions {
        allow_destructive_override: true,
        retry: fast_retry(),
        cancel: CancellationToken::new(),
    };
    let report = destroy(provider.clone(), &plan, &options).await.unwrap();

    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.deleted(), plan.descriptors.len());
    for desc in &plan.descriptors {
        assert!(!provider.contains(&desc.id), "{} must be gone", desc.id);
    }
}

#[tokio::test]
async fn destroy_without_override_keeps_stateful_resources() {
    let provider = applied_provider().await;
    let plan = build_plan(&deploy_config());

    let options = DestroyOptions {
        retry: fast_retry(),
        ..Default::default()
    };
    let report = destroy(provider.clone(), &plan, &options).await.unwrap();

    assert_eq!(
        report.action_for(ids::DB_INSTANCE),
        Some(&DestroyAction::ProtectedSkipped)
    );
    assert_eq!(
        report.action_for(ids::BUCKET),
        Some(&DestroyAction::ProtectedSkipped)
    );
    assert!(provider.contains(ids::DB_INSTANCE));
    assert!(provider.contains(ids::BUCKET));

    // Everything unprotected is gone
    assert_eq!(report.action_for(ids::SERVICE), Some(&DestroyAction::Deleted));
    assert!(!provider.contains(ids::SERVICE));
    assert_eq!(report.exit_code(), 0);
}

#[tokio::test]
async fn destroy_twice_reports_already_absent() {
    let provider = applied_provider().await;
    let plan = build_plan(&deploy_config());
    let options = DestroyOptions {
        allow_destructive_override: true,
        retry: fast_retry(),
        cancel: CancellationToken::new(),
    };

    let first = destroy(provider.clone(), &plan, &options).await.unwrap();
    assert_eq!(first.deleted(), plan.descriptors.len());

    let second = destroy(provider.clone(), &plan, &options).await.unwrap();
    assert_eq!(second.deleted(), 0);
    assert_eq!(second.failed(), 0);
    assert!(second
        .outcomes
        .iter()
        .all(|(_, _, action)| *action == DestroyAction::AlreadyAbsent));
    assert_eq!(second.exit_code(), 0);
}

#[tokio::test]
async fn destroy_never_applied_plan_succeeds() {
    let provider = Arc::new(MemoryProvider::new());
    let plan = build_plan(&deploy_config());
    let options = DestroyOptions {
        allow_destructive_override: true,
        retry: fast_retry(),
        cancel: CancellationToken::new(),
    };

    let report = destroy(provider, &plan, &options).await.unwrap();
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.deleted(), 0);
    assert!(report
        .outcomes
        .iter()
        .all(|(_, _, action)| *action == DestroyAction::AlreadyAbsent));
}

#[tokio::test]
async fn service_deletes_before_its_dependencies() {
    let provider = applied_provider().await;
    let plan = build_plan(&deploy_config());
    let options = DestroyOptions {
        allow_destructive_override: true,
        retry: fast_retry(),
        cancel: CancellationToken::new(),
    };

    let report = destroy(provider, &plan, &options).await.unwrap();
    let position = |id: &str| {
        report
            .outcomes
            .iter()
            .position(|(oid, _, _)| oid == id)
            .unwrap()
    };

    assert!(position(ids::SERVICE) < position(ids::DB_INSTANCE));
    assert!(position(ids::SERVICE) < position(ids::BUCKET_ACCESS));
    assert!(position(ids::DB_USER) < position(ids::DB_INSTANCE));
    assert!(position(ids::DB_PASSWORD) < position(ids::DB_PASSWORD_SECRET));
    assert!(position(ids::BUCKET_ACCESS) < position(ids::BUCKET));
}
