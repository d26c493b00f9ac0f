//! Cloud SQL admin client
//!
//! Instances, databases, and users via `sqladmin.googleapis.com/v1`.
//! Instance mutations are long-running operations polled to completion;
//! instance creation routinely takes several minutes.

use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use super::{required, GcpContext};
use crate::labels;
use crate::provider::{DeleteOutcome, DepView, Observed, ProviderError, Resolved};
use crate::model::ResourceDescriptor;
use crate::wait::{wait_for_resource, WaitConfig};

const BASE: &str = "https://sqladmin.googleapis.com/v1";

fn instance_url(project: &str, name: &str) -> String {
    format!("{BASE}/projects/{project}/instances/{name}")
}

/// Poll a sqladmin operation until DONE.
async fn await_operation(
    ctx: &GcpContext,
    response: &Value,
    what: &str,
    timeout: Duration,
) -> Result<(), ProviderError> {
    let Some(op_name) = response.get("name").and_then(Value::as_str) else {
        return Ok(());
    };
    let url = format!("{BASE}/projects/{}/operations/{op_name}", ctx.project);

    wait_for_resource(
        WaitConfig::with_timeout(timeout),
        None,
        || async {
            let op = ctx
                .request(Method::GET, &url, "operation", op_name, None)
                .await?;
            if let Some(errors) = op.pointer("/error/errors") {
                anyhow::bail!("operation failed: {errors}");
            }
            Ok(op.get("status").and_then(Value::as_str) == Some("DONE"))
        },
        what,
    )
    .await
    .map_err(|e| ProviderError::Api {
        status: 0,
        message: e.to_string(),
    })
}

// ── Instances ───────────────────────────────────────────────────────────

pub(super) async fn instance_fetch(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Option<Observed>, ProviderError> {
    let name = required(desc, "name")?;
    let Some(body) = ctx
        .get_opt(&instance_url(&ctx.project, &name), "database-instance", &name)
        .await?
    else {
        return Ok(None);
    };

    let mut observed = Observed::default();
    observed.config.insert("name".into(), name.clone());
    if let Some(region) = body.get("region").and_then(Value::as_str) {
        observed.config.insert("region".into(), region.to_string());
    }
    if let Some(version) = body.get("databaseVersion").and_then(Value::as_str) {
        observed
            .config
            .insert("database_version".into(), version.to_string());
    }
    if let Some(tier) = body.pointer("/settings/tier").and_then(Value::as_str) {
        observed.config.insert("tier".into(), tier.to_string());
    }
    observed.attrs.insert("name".into(), name);
    if let Some(conn) = body.get("connectionName").and_then(Value::as_str) {
        observed
            .attrs
            .insert("connection_name".into(), conn.to_string());
    }
    Ok(Some(observed))
}

pub(super) async fn instance_create(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Resolved, ProviderError> {
    let name = required(desc, "name")?;
    let body = json!({
        "name": name,
        "region": required(desc, "region")?,
        "databaseVersion": required(desc, "database_version")?,
        "settings": {
            "tier": required(desc, "tier")?,
            "userLabels": label_map(ctx),
        },
    });

    info!(instance = %name, "Creating database instance (may take minutes)");
    let response = ctx
        .request(
            Method::POST,
            &format!("{BASE}/projects/{}/instances", ctx.project),
            "database-instance",
            &name,
            Some(body),
        )
        .await?;
    await_operation(ctx, &response, "database instance", Duration::from_secs(1200)).await?;

    // connectionName is remote-assigned; read it back for dependents
    let observed = instance_fetch(ctx, desc).await?.ok_or(ProviderError::NotFound {
        kind: "database-instance",
        id: name,
    })?;
    Ok(Resolved {
        attrs: observed.attrs,
    })
}

pub(super) async fn instance_update(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
    observed: &Observed,
) -> Result<Resolved, ProviderError> {
    let name = required(desc, "name")?;
    let body = json!({
        "settings": { "tier": required(desc, "tier")? },
    });

    info!(instance = %name, "Updating database instance settings");
    let response = ctx
        .request(
            Method::PATCH,
            &instance_url(&ctx.project, &name),
            "database-instance",
            &name,
            Some(body),
        )
        .await?;
    await_operation(ctx, &response, "database instance", Duration::from_secs(1200)).await?;

    Ok(Resolved {
        attrs: observed.attrs.clone(),
    })
}

pub(super) async fn instance_delete(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<DeleteOutcome, ProviderError> {
    let name = required(desc, "name")?;
    let response = ctx
        .request(
            Method::DELETE,
            &instance_url(&ctx.project, &name),
            "database-instance",
            &name,
            None,
        )
        .await?;
    await_operation(ctx, &response, "database instance", Duration::from_secs(1200)).await?;
    Ok(DeleteOutcome::Deleted)
}

// ── Databases ───────────────────────────────────────────────────────────

fn database_url(project: &str, instance: &str, name: &str) -> String {
    format!("{BASE}/projects/{project}/instances/{instance}/databases/{name}")
}

pub(super) async fn database_fetch(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Option<Observed>, ProviderError> {
    let instance = required(desc, "instance")?;
    let name = required(desc, "name")?;
    let found = ctx
        .get_opt(&database_url(&ctx.project, &instance, &name), "database", &name)
        .await?;

    Ok(found.map(|_| {
        let mut observed = Observed::default();
        observed.config.insert("instance".into(), instance);
        observed.config.insert("name".into(), name.clone());
        observed.attrs.insert("name".into(), name);
        observed
    }))
}

pub(super) async fn database_create(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Resolved, ProviderError> {
    let instance = required(desc, "instance")?;
    let name = required(desc, "name")?;

    info!(database = %name, instance = %instance, "Creating database");
    let response = ctx
        .request(
            Method::POST,
            &format!(
                "{BASE}/projects/{}/instances/{instance}/databases",
                ctx.project
            ),
            "database",
            &name,
            Some(json!({ "name": name })),
        )
        .await?;
    await_operation(ctx, &response, "database", Duration::from_secs(120)).await?;

    Ok(Resolved::default().attr("name", name))
}

pub(super) async fn database_delete(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<DeleteOutcome, ProviderError> {
    let instance = required(desc, "instance")?;
    let name = required(desc, "name")?;
    let response = ctx
        .request(
            Method::DELETE,
            &database_url(&ctx.project, &instance, &name),
            "database",
            &name,
            None,
        )
        .await?;
    await_operation(ctx, &response, "database", Duration::from_secs(120)).await?;
    Ok(DeleteOutcome::Deleted)
}

// ── Users ───────────────────────────────────────────────────────────────

pub(super) async fn user_fetch(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Option<Observed>, ProviderError> {
    let instance = required(desc, "instance")?;
    let name = required(desc, "name")?;
    let Some(body) = ctx
        .get_opt(
            &format!("{BASE}/projects/{}/instances/{instance}/users", ctx.project),
            "database-user",
            &name,
        )
        .await?
    else {
        return Ok(None);
    };

    let exists = body
        .get("items")
        .and_then(Value::as_array)
        .is_some_and(|users| {
            users
                .iter()
                .any(|u| u.get("name").and_then(Value::as_str) == Some(name.as_str()))
        });
    if !exists {
        return Ok(None);
    }

    let mut observed = Observed::default();
    observed.config.insert("instance".into(), instance);
    observed.config.insert("name".into(), name.clone());
    // The password is not observable; echo the desired reference so a
    // stable plan reads as converged.
    if let Some(version) = desc.desired.get("password_version") {
        observed
            .config
            .insert("password_version".into(), version.clone());
    }
    observed.attrs.insert("name".into(), name);
    Ok(Some(observed))
}

pub(super) async fn user_create(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
    deps: &DepView,
) -> Result<Resolved, ProviderError> {
    let instance = required(desc, "instance")?;
    let name = required(desc, "name")?;

    // The password is read from the referenced secret version so plaintext
    // never crosses the reconciler.
    let version_id = required(desc, "password_version")?;
    let handle = deps.require(&version_id, "version")?;
    let password = super::secretmanager::access_version(ctx, handle).await?;

    info!(user = %name, instance = %instance, "Creating database user");
    let response = ctx
        .request(
            Method::POST,
            &format!("{BASE}/projects/{}/instances/{instance}/users", ctx.project),
            "database-user",
            &name,
            Some(json!({ "name": name, "password": password.expose() })),
        )
        .await?;
    await_operation(ctx, &response, "database user", Duration::from_secs(120)).await?;

    Ok(Resolved::default().attr("name", name))
}

pub(super) async fn user_delete(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<DeleteOutcome, ProviderError> {
    let instance = required(desc, "instance")?;
    let name = required(desc, "name")?;
    let response = ctx
        .request(
            Method::DELETE,
            &format!(
                "{BASE}/projects/{}/instances/{instance}/users?name={name}",
                ctx.project
            ),
            "database-user",
            &name,
            None,
        )
        .await?;
    await_operation(ctx, &response, "database user", Duration::from_secs(120)).await?;
    Ok(DeleteOutcome::Deleted)
}

fn label_map(ctx: &GcpContext) -> Value {
    let mut map = serde_json::Map::new();
    for (k, v) in labels::standard_labels(&ctx.deployment) {
        map.insert(k, Value::String(v));
    }
    Value::Object(map)
}
