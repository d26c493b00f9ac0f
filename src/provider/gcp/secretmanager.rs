//! Secret Manager client
//!
//! Secrets and their versions via `secretmanager.googleapis.com/v1`.
//! Versions are append-only: every write creates a new version and callers
//! reference the returned version handle explicitly, never "latest".

use base64::Engine as _;
use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use super::{required, GcpContext};
use crate::labels;
use crate::model::ResourceDescriptor;
use crate::provider::{DeleteOutcome, Observed, ProviderError, Resolved};
use crate::secrets::SecretMaterial;

const BASE: &str = "https://secretmanager.googleapis.com/v1";

fn secret_url(project: &str, name: &str) -> String {
    format!("{BASE}/projects/{project}/secrets/{name}")
}

// ── Secrets ─────────────────────────────────────────────────────────────

pub(super) async fn secret_fetch(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Option<Observed>, ProviderError> {
    let name = required(desc, "name")?;
    let found = ctx
        .get_opt(&secret_url(&ctx.project, &name), "secret", &name)
        .await?;

    Ok(found.map(|body| {
        let mut observed = Observed::default();
        observed.config.insert("name".into(), name.clone());
        observed.attrs.insert("name".into(), name);
        if let Some(full_name) = body.get("name").and_then(Value::as_str) {
            observed
                .attrs
                .insert("resource_name".into(), full_name.to_string());
        }
        observed
    }))
}

pub(super) async fn secret_create(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Resolved, ProviderError> {
    let name = required(desc, "name")?;
    let mut label_map = serde_json::Map::new();
    for (k, v) in labels::standard_labels(&ctx.deployment) {
        label_map.insert(k, Value::String(v));
    }

    info!(secret = %name, "Creating secret");
    let body = ctx
        .request(
            Method::POST,
            &format!("{BASE}/projects/{}/secrets?secretId={name}", ctx.project),
            "secret",
            &name,
            Some(json!({
                "replication": { "automatic": {} },
                "labels": label_map,
            })),
        )
        .await?;

    let mut resolved = Resolved::default().attr("name", name);
    if let Some(full_name) = body.get("name").and_then(Value::as_str) {
        resolved = resolved.attr("resource_name", full_name);
    }
    Ok(resolved)
}

pub(super) async fn secret_delete(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<DeleteOutcome, ProviderError> {
    let name = required(desc, "name")?;
    ctx.request(
        Method::DELETE,
        &secret_url(&ctx.project, &name),
        "secret",
        &name,
        None,
    )
    .await?;
    Ok(DeleteOutcome::Deleted)
}

// ── Versions ────────────────────────────────────────────────────────────

pub(super) async fn version_fetch(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Option<Observed>, ProviderError> {
    let secret = required(desc, "secret")?;
    let url = format!(
        "{}/versions/latest",
        secret_url(&ctx.project, &secret)
    );
    let Some(body) = ctx.get_opt(&url, "secret-version", &desc.id).await? else {
        return Ok(None);
    };

    // A destroyed/disabled latest version does not satisfy the plan
    if body.get("state").and_then(Value::as_str) != Some("ENABLED") {
        return Ok(None);
    }
    let Some(handle) = body.get("name").and_then(Value::as_str) else {
        return Ok(None);
    };

    let mut observed = Observed::default();
    observed.config.insert("secret".into(), secret);
    // The policy a version was generated under is not remotely observable;
    // an existing enabled version satisfies the descriptor.
    if let Some(policy) = desc.desired.get("policy") {
        observed.config.insert("policy".into(), policy.clone());
    }
    observed.attrs.insert("version".into(), handle.to_string());
    Ok(Some(observed))
}

pub(super) async fn version_create(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
    material: &SecretMaterial,
) -> Result<Resolved, ProviderError> {
    let secret = required(desc, "secret")?;
    let data = base64::engine::general_purpose::STANDARD.encode(material.expose());

    info!(secret = %secret, "Adding secret version");
    let body = ctx
        .request(
            Method::POST,
            &format!("{}:addVersion", secret_url(&ctx.project, &secret)),
            "secret-version",
            &desc.id,
            Some(json!({ "payload": { "data": data } })),
        )
        .await?;

    let handle = body
        .get("name")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Api {
            status: 0,
            message: "addVersion response carried no version name".to_string(),
        })?;
    Ok(Resolved::default().attr("version", handle))
}

pub(super) async fn version_delete(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<DeleteOutcome, ProviderError> {
    let secret = required(desc, "secret")?;
    let url = format!(
        "{}/versions/latest:destroy",
        secret_url(&ctx.project, &secret)
    );
    match ctx
        .request(Method::POST, &url, "secret-version", &desc.id, None)
        .await
    {
        Ok(_) => Ok(DeleteOutcome::Deleted),
        // Already destroyed versions report a failed precondition
        Err(ProviderError::InvalidRequest(_)) => Ok(DeleteOutcome::AlreadyAbsent),
        Err(e) => Err(e),
    }
}

/// Read a version's plaintext for provider-side consumption (database user
/// provisioning). Never logged, never returned to the reconciler.
pub(super) async fn access_version(
    ctx: &GcpContext,
    handle: &str,
) -> Result<SecretMaterial, ProviderError> {
    let body = ctx
        .request(
            Method::GET,
            &format!("{BASE}/{handle}:access"),
            "secret-version",
            handle,
            None,
        )
        .await?;

    let encoded = body
        .pointer("/payload/data")
        .and_then(Value::as_str)
        .ok_or_else(|| ProviderError::Api {
            status: 0,
            message: "access response carried no payload".to_string(),
        })?;
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(encoded)
        .map_err(|e| ProviderError::Api {
            status: 0,
            message: format!("payload is not valid base64: {e}"),
        })?;
    let value = String::from_utf8(decoded).map_err(|e| ProviderError::Api {
        status: 0,
        message: format!("payload is not valid UTF-8: {e}"),
    })?;
    Ok(SecretMaterial::from_store(value))
}
