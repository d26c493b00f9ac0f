//! GCS client
//!
//! The extension-artifacts bucket and its access grant via
//! `storage.googleapis.com/storage/v1`. Content lifecycle is owned by the
//! operator; runway only provisions the bucket and grants the runtime
//! identity access.

use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use super::{policy, required, GcpContext};
use crate::labels;
use crate::model::ResourceDescriptor;
use crate::provider::{DeleteOutcome, Observed, ProviderError, Resolved};

const BASE: &str = "https://storage.googleapis.com/storage/v1";

fn bucket_url(name: &str) -> String {
    format!("{BASE}/b/{name}")
}

// ── Buckets ─────────────────────────────────────────────────────────────

pub(super) async fn bucket_fetch(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Option<Observed>, ProviderError> {
    let name = required(desc, "name")?;
    let Some(body) = ctx
        .get_opt(&bucket_url(&name), "storage-bucket", &name)
        .await?
    else {
        return Ok(None);
    };

    let mut observed = Observed::default();
    observed.config.insert("name".into(), name.clone());
    if let Some(location) = body.get("location").and_then(Value::as_str) {
        observed
            .config
            .insert("location".into(), location.to_string());
    }
    let versioning = body
        .pointer("/versioning/enabled")
        .and_then(Value::as_bool)
        .unwrap_or(false);
    observed
        .config
        .insert("versioning".into(), versioning.to_string());
    observed.attrs.insert("name".into(), name);
    Ok(Some(observed))
}

pub(super) async fn bucket_create(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Resolved, ProviderError> {
    let name = required(desc, "name")?;
    let versioning = desc.desired.get("versioning").map(String::as_str) == Some("true");
    let mut label_map = serde_json::Map::new();
    for (k, v) in labels::standard_labels(&ctx.deployment) {
        label_map.insert(k, Value::String(v));
    }

    info!(bucket = %name, "Creating bucket");
    ctx.request(
        Method::POST,
        &format!("{BASE}/b?project={}", ctx.project),
        "storage-bucket",
        &name,
        Some(json!({
            "name": name,
            "location": required(desc, "location")?,
            "versioning": { "enabled": versioning },
            "iamConfiguration": { "uniformBucketLevelAccess": { "enabled": true } },
            "labels": label_map,
        })),
    )
    .await?;

    Ok(Resolved::default().attr("name", name))
}

pub(super) async fn bucket_update(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
    observed: &Observed,
) -> Result<Resolved, ProviderError> {
    let name = required(desc, "name")?;
    let versioning = desc.desired.get("versioning").map(String::as_str) == Some("true");

    info!(bucket = %name, "Updating bucket");
    ctx.request(
        Method::PATCH,
        &bucket_url(&name),
        "storage-bucket",
        &name,
        Some(json!({ "versioning": { "enabled": versioning } })),
    )
    .await?;

    Ok(Resolved {
        attrs: observed.attrs.clone(),
    })
}

pub(super) async fn bucket_delete(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<DeleteOutcome, ProviderError> {
    let name = required(desc, "name")?;
    ctx.request(Method::DELETE, &bucket_url(&name), "storage-bucket", &name, None)
        .await?;
    Ok(DeleteOutcome::Deleted)
}

// ── Bucket access grants ────────────────────────────────────────────────

fn member_of(ctx: &GcpContext, desc: &ResourceDescriptor) -> Result<String, ProviderError> {
    let account_id = required(desc, "service_account")?;
    Ok(format!(
        "serviceAccount:{account_id}@{}.iam.gserviceaccount.com",
        ctx.project
    ))
}

pub(super) async fn binding_fetch(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Option<Observed>, ProviderError> {
    let bucket = required(desc, "bucket")?;
    let role = required(desc, "role")?;
    let member = member_of(ctx, desc)?;

    let current = match ctx
        .request(
            Method::GET,
            &format!("{}/iam", bucket_url(&bucket)),
            "storage-bucket-binding",
            &desc.id,
            None,
        )
        .await
    {
        Ok(current) => current,
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };

    if !policy::has_member(&current, &role, &member) {
        return Ok(None);
    }

    let mut observed = Observed::default();
    for key in ["bucket", "role", "service_account"] {
        if let Some(v) = desc.desired.get(key) {
            observed.config.insert(key.to_string(), v.clone());
        }
    }
    observed.attrs.insert("member".into(), member);
    Ok(Some(observed))
}

pub(super) async fn binding_create(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Resolved, ProviderError> {
    let bucket = required(desc, "bucket")?;
    let role = required(desc, "role")?;
    let member = member_of(ctx, desc)?;
    let iam_url = format!("{}/iam", bucket_url(&bucket));

    let current = ctx
        .request(Method::GET, &iam_url, "storage-bucket-binding", &desc.id, None)
        .await?;

    if !policy::has_member(&current, &role, &member) {
        info!(bucket = %bucket, role = %role, member = %member, "Granting bucket access");
        let updated = policy::with_member(current, &role, &member);
        let result = ctx
            .request(
                Method::PUT,
                &iam_url,
                "storage-bucket-binding",
                &desc.id,
                Some(updated),
            )
            .await;
        if let Err(e) = result {
            return Err(match e {
                ProviderError::InvalidRequest(msg) if msg.contains("does not exist") => {
                    ProviderError::PropagationDelay(msg)
                }
                other => other,
            });
        }
    }

    Ok(Resolved::default().attr("member", member))
}

pub(super) async fn binding_delete(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<DeleteOutcome, ProviderError> {
    let bucket = required(desc, "bucket")?;
    let role = required(desc, "role")?;
    let member = member_of(ctx, desc)?;
    let iam_url = format!("{}/iam", bucket_url(&bucket));

    let current = ctx
        .request(Method::GET, &iam_url, "storage-bucket-binding", &desc.id, None)
        .await?;

    if !policy::has_member(&current, &role, &member) {
        return Ok(DeleteOutcome::AlreadyAbsent);
    }

    let updated = policy::without_member(current, &role, &member);
    ctx.request(
        Method::PUT,
        &iam_url,
        "storage-bucket-binding",
        &desc.id,
        Some(updated),
    )
    .await?;
    Ok(DeleteOutcome::Deleted)
}
