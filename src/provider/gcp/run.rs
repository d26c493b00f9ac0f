//! Cloud Run client
//!
//! The application service via `run.googleapis.com/v2`. The container
//! contract lives here: environment wiring (plain and secret-backed), the
//! Cloud SQL socket volume, the GCS artifacts volume, and the TCP startup
//! probe. Creation waits for the service's terminal Ready condition.

use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use super::{required, GcpContext};
use crate::labels;
use crate::model::ResourceDescriptor;
use crate::provider::{DeleteOutcome, DepView, Observed, ProviderError, Resolved};
use crate::wait::{wait_for_resource, WaitConfig};

const BASE: &str = "https://run.googleapis.com/v2";

fn service_url(project: &str, region: &str, name: &str) -> String {
    format!("{BASE}/projects/{project}/locations/{region}/services/{name}")
}

/// Poll a Cloud Run operation until done.
async fn await_operation(
    ctx: &GcpContext,
    response: &Value,
    what: &str,
) -> Result<(), ProviderError> {
    let Some(op_name) = response.get("name").and_then(Value::as_str) else {
        return Ok(());
    };
    if !op_name.contains("/operations/") {
        return Ok(());
    }
    let url = format!("{BASE}/{op_name}");

    wait_for_resource(
        WaitConfig::with_timeout(Duration::from_secs(600)),
        None,
        || async {
            let op = ctx
                .request(Method::GET, &url, "operation", op_name, None)
                .await?;
            if let Some(error) = op.get("error") {
                anyhow::bail!("operation failed: {error}");
            }
            Ok(op.get("done").and_then(Value::as_bool).unwrap_or(false))
        },
        what,
    )
    .await
    .map_err(|e| ProviderError::Api {
        status: 0,
        message: e.to_string(),
    })
}

/// Split a secret version handle into (secret short name, version number).
fn split_version_handle(handle: &str) -> Result<(String, String), ProviderError> {
    let parts: Vec<&str> = handle.split('/').collect();
    match parts.as_slice() {
        ["projects", _, "secrets", secret, "versions", version] => {
            Ok((secret.to_string(), version.to_string()))
        }
        _ => Err(ProviderError::InvalidRequest(format!(
            "'{handle}' is not a secret version handle"
        ))),
    }
}

/// Build the Cloud Run service body from the descriptor and its resolved
/// dependencies.
fn service_body(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
    deps: &DepView,
) -> Result<Value, ProviderError> {
    let port: u64 = required(desc, "container_port")?
        .parse()
        .map_err(|_| ProviderError::InvalidRequest("container_port is not a number".into()))?;
    let account_id = required(desc, "service_account")?;
    let connection_name = deps
        .require(&required(desc, "cloudsql_instance")?, "connection_name")?
        .to_string();
    let bucket = deps
        .require(&required(desc, "artifact_bucket")?, "name")?
        .to_string();

    // Plain environment, plus the socket path derived from the instance
    let mut env = vec![json!({
        "name": "DB_POSTGRESDB_HOST",
        "value": format!("/cloudsql/{connection_name}"),
    })];
    for (key, value) in &desc.desired {
        if let Some(name) = key.strip_prefix("env.") {
            env.push(json!({ "name": name, "value": value }));
        }
    }
    // Secret-backed environment referencing explicit version handles
    for (key, version_desc) in &desc.desired {
        if let Some(name) = key.strip_prefix("secret_env.") {
            let handle = deps.require(version_desc, "version")?;
            let (secret, version) = split_version_handle(handle)?;
            env.push(json!({
                "name": name,
                "valueSource": { "secretKeyRef": { "secret": secret, "version": version } },
            }));
        }
    }

    let mut label_map = serde_json::Map::new();
    for (k, v) in labels::standard_labels(&ctx.deployment) {
        label_map.insert(k, Value::String(v));
    }

    Ok(json!({
        "labels": label_map,
        "template": {
            "serviceAccount": format!("{account_id}@{}.iam.gserviceaccount.com", ctx.project),
            "volumes": [
                { "name": "cloudsql", "cloudSqlInstance": { "instances": [connection_name] } },
                {
                    "name": "artifacts",
                    "gcs": { "bucket": bucket, "readOnly": false },
                },
            ],
            "containers": [{
                "image": required(desc, "image")?,
                "ports": [{ "containerPort": port }],
                "env": env,
                "volumeMounts": [
                    { "name": "cloudsql", "mountPath": "/cloudsql" },
                    {
                        "name": "artifacts",
                        "mountPath": required(desc, "artifact_mount_path")?,
                    },
                ],
                "startupProbe": {
                    "initialDelaySeconds": probe_value(desc, "probe_initial_delay")?,
                    "timeoutSeconds": probe_value(desc, "probe_timeout")?,
                    "periodSeconds": probe_value(desc, "probe_period")?,
                    "failureThreshold": probe_value(desc, "probe_failure_threshold")?,
                    "tcpSocket": { "port": port },
                },
            }],
        },
    }))
}

fn probe_value(desc: &ResourceDescriptor, key: &str) -> Result<u64, ProviderError> {
    required(desc, key)?
        .parse()
        .map_err(|_| ProviderError::InvalidRequest(format!("{key} is not a number")))
}

/// Wait until the service's terminal condition reports ready.
async fn await_ready(
    ctx: &GcpContext,
    url: &str,
    name: &str,
    timeout: Duration,
) -> Result<Value, ProviderError> {
    wait_for_resource(
        WaitConfig::with_timeout(timeout),
        None,
        || async {
            let body = ctx.request(Method::GET, url, "compute-service", name, None).await?;
            let state = body
                .pointer("/terminalCondition/state")
                .and_then(Value::as_str);
            match state {
                Some("CONDITION_SUCCEEDED") => Ok(true),
                Some("CONDITION_FAILED") => {
                    let message = body
                        .pointer("/terminalCondition/message")
                        .and_then(Value::as_str)
                        .unwrap_or("no condition message");
                    anyhow::bail!("service failed to become ready: {message}");
                }
                _ => Ok(false),
            }
        },
        "compute service",
    )
    .await
    .map_err(|e| ProviderError::Api {
        status: 0,
        message: e.to_string(),
    })?;

    ctx.request(Method::GET, url, "compute-service", name, None).await
}

pub(super) async fn service_fetch(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Option<Observed>, ProviderError> {
    let name = required(desc, "name")?;
    let region = required(desc, "region")?;
    let Some(body) = ctx
        .get_opt(
            &service_url(&ctx.project, &region, &name),
            "compute-service",
            &name,
        )
        .await?
    else {
        return Ok(None);
    };

    let mut observed = Observed::default();
    observed.config.insert("name".into(), name.clone());
    observed.config.insert("region".into(), region);

    let container = body.pointer("/template/containers/0");
    if let Some(image) = container
        .and_then(|c| c.get("image"))
        .and_then(Value::as_str)
    {
        observed.config.insert("image".into(), image.to_string());
    }
    if let Some(port) = container
        .and_then(|c| c.pointer("/ports/0/containerPort"))
        .and_then(Value::as_u64)
    {
        observed
            .config
            .insert("container_port".into(), port.to_string());
    }

    let env_list = container
        .and_then(|c| c.get("env"))
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    for entry in &env_list {
        let Some(env_name) = entry.get("name").and_then(Value::as_str) else {
            continue;
        };
        if let Some(value) = entry.get("value").and_then(Value::as_str) {
            observed
                .config
                .insert(format!("env.{env_name}"), value.to_string());
        } else if entry.pointer("/valueSource/secretKeyRef").is_some() {
            // Remote stores the resolved handle; a present secret ref
            // satisfies the desired reference entry.
            if let Some(reference) = desc.desired.get(&format!("secret_env.{env_name}")) {
                observed
                    .config
                    .insert(format!("secret_env.{env_name}"), reference.clone());
            }
        }
    }

    // Probe settings, normalized back into the descriptor vocabulary
    if let Some(probe) = container.and_then(|c| c.get("startupProbe")) {
        for (key, field) in [
            ("probe_initial_delay", "initialDelaySeconds"),
            ("probe_timeout", "timeoutSeconds"),
            ("probe_period", "periodSeconds"),
            ("probe_failure_threshold", "failureThreshold"),
        ] {
            if let Some(v) = probe.get(field).and_then(Value::as_u64) {
                observed.config.insert(key.into(), v.to_string());
            }
        }
    }

    // Volume wiring: a present Cloud SQL / GCS volume satisfies the
    // descriptor-reference entries.
    let volumes = body
        .pointer("/template/volumes")
        .and_then(Value::as_array)
        .cloned()
        .unwrap_or_default();
    if volumes.iter().any(|v| v.get("cloudSqlInstance").is_some()) {
        if let Some(reference) = desc.desired.get("cloudsql_instance") {
            observed
                .config
                .insert("cloudsql_instance".into(), reference.clone());
        }
    }
    if volumes.iter().any(|v| v.get("gcs").is_some()) {
        if let Some(reference) = desc.desired.get("artifact_bucket") {
            observed
                .config
                .insert("artifact_bucket".into(), reference.clone());
        }
        if let Some(mount) = desc.desired.get("artifact_mount_path") {
            observed
                .config
                .insert("artifact_mount_path".into(), mount.clone());
        }
    }
    if let Some(sa) = body
        .pointer("/template/serviceAccount")
        .and_then(Value::as_str)
    {
        if let Some(account_id) = sa.split('@').next() {
            observed
                .config
                .insert("service_account".into(), account_id.to_string());
        }
    }

    if let Some(uri) = body.get("uri").and_then(Value::as_str) {
        observed.attrs.insert("uri".into(), uri.to_string());
    }
    Ok(Some(observed))
}

pub(super) async fn service_create(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
    deps: &DepView,
) -> Result<Resolved, ProviderError> {
    let name = required(desc, "name")?;
    let region = required(desc, "region")?;
    let body = service_body(ctx, desc, deps)?;

    info!(service = %name, region = %region, "Creating service");
    let response = ctx
        .request(
            Method::POST,
            &format!(
                "{BASE}/projects/{}/locations/{region}/services?serviceId={name}",
                ctx.project
            ),
            "compute-service",
            &name,
            Some(body),
        )
        .await?;
    await_operation(ctx, &response, "compute service").await?;

    let url = service_url(&ctx.project, &region, &name);
    let ready = await_ready(ctx, &url, &name, Duration::from_secs(600)).await?;

    let mut resolved = Resolved::default().attr("name", name);
    if let Some(uri) = ready.get("uri").and_then(Value::as_str) {
        resolved = resolved.attr("uri", uri);
    }
    Ok(resolved)
}

pub(super) async fn service_update(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
    deps: &DepView,
) -> Result<Resolved, ProviderError> {
    let name = required(desc, "name")?;
    let region = required(desc, "region")?;
    let body = service_body(ctx, desc, deps)?;
    let url = service_url(&ctx.project, &region, &name);

    info!(service = %name, "Updating service");
    let response = ctx
        .request(Method::PATCH, &url, "compute-service", &name, Some(body))
        .await?;
    await_operation(ctx, &response, "compute service").await?;

    let ready = await_ready(ctx, &url, &name, Duration::from_secs(600)).await?;
    let mut resolved = Resolved::default().attr("name", name);
    if let Some(uri) = ready.get("uri").and_then(Value::as_str) {
        resolved = resolved.attr("uri", uri);
    }
    Ok(resolved)
}

pub(super) async fn service_delete(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<DeleteOutcome, ProviderError> {
    let name = required(desc, "name")?;
    let region = required(desc, "region")?;
    let response = ctx
        .request(
            Method::DELETE,
            &service_url(&ctx.project, &region, &name),
            "compute-service",
            &name,
            None,
        )
        .await?;
    await_operation(ctx, &response, "compute service").await?;
    Ok(DeleteOutcome::Deleted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn version_handle_parsing() {
        let (secret, version) =
            split_version_handle("projects/acme/secrets/n8n-db-password/versions/3").unwrap();
        assert_eq!(secret, "n8n-db-password");
        assert_eq!(version, "3");

        assert!(split_version_handle("n8n-db-password/versions/3").is_err());
        assert!(split_version_handle("latest").is_err());
    }
}
