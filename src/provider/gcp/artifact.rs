//! Artifact Registry client
//!
//! The Docker repository a custom image is pushed to, via
//! `artifactregistry.googleapis.com/v1`. Only provisioned when the
//! deployment runs a custom image.

use std::time::Duration;

use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use super::{required, GcpContext};
use crate::model::ResourceDescriptor;
use crate::provider::{DeleteOutcome, Observed, ProviderError, Resolved};
use crate::wait::{wait_for_resource, WaitConfig};

const BASE: &str = "https://artifactregistry.googleapis.com/v1";

fn repository_name(project: &str, location: &str, name: &str) -> String {
    format!("projects/{project}/locations/{location}/repositories/{name}")
}

/// Poll an Artifact Registry operation until done.
async fn await_operation(
    ctx: &GcpContext,
    response: &Value,
    what: &str,
) -> Result<(), ProviderError> {
    let Some(op_name) = response.get("name").and_then(Value::as_str) else {
        return Ok(());
    };
    // Immediate responses carry the resource, not an operation
    if !op_name.contains("/operations/") {
        return Ok(());
    }
    let url = format!("{BASE}/{op_name}");

    wait_for_resource(
        WaitConfig::with_timeout(Duration::from_secs(300)),
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

pub(super) async fn repository_fetch(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Option<Observed>, ProviderError> {
    let name = required(desc, "name")?;
    let location = required(desc, "location")?;
    let full_name = repository_name(&ctx.project, &location, &name);
    let Some(body) = ctx
        .get_opt(&format!("{BASE}/{full_name}"), "artifact-repository", &name)
        .await?
    else {
        return Ok(None);
    };

    let mut observed = Observed::default();
    observed.config.insert("name".into(), name.clone());
    observed.config.insert("location".into(), location);
    if let Some(format) = body.get("format").and_then(Value::as_str) {
        observed.config.insert("format".into(), format.to_string());
    }
    observed.attrs.insert("name".into(), name);
    observed.attrs.insert("resource_name".into(), full_name);
    Ok(Some(observed))
}

pub(super) async fn repository_create(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Resolved, ProviderError> {
    let name = required(desc, "name")?;
    let location = required(desc, "location")?;

    info!(repository = %name, location = %location, "Creating artifact repository");
    let response = ctx
        .request(
            Method::POST,
            &format!(
                "{BASE}/projects/{}/locations/{location}/repositories?repositoryId={name}",
                ctx.project
            ),
            "artifact-repository",
            &name,
            Some(json!({ "format": required(desc, "format")? })),
        )
        .await?;
    await_operation(ctx, &response, "artifact repository").await?;

    let resource_name = repository_name(&ctx.project, &location, &name);
    Ok(Resolved::default()
        .attr("name", name)
        .attr("resource_name", resource_name))
}

pub(super) async fn repository_delete(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<DeleteOutcome, ProviderError> {
    let name = required(desc, "name")?;
    let location = required(desc, "location")?;
    let response = ctx
        .request(
            Method::DELETE,
            &format!(
                "{BASE}/{}",
                repository_name(&ctx.project, &location, &name)
            ),
            "artifact-repository",
            &name,
            None,
        )
        .await?;
    await_operation(ctx, &response, "artifact repository").await?;
    Ok(DeleteOutcome::Deleted)
}
