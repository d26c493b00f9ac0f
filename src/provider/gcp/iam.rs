//! Service accounts and IAM policy bindings
//!
//! One service account runs the deployment; bindings grant it exactly the
//! roles it needs on each secret and on the project (Cloud SQL client).
//! Grants are idempotent read-modify-write edits of the target's policy:
//! granting an already-granted role is a no-op.

use reqwest::Method;
use serde_json::{json, Value};
use tracing::info;

use super::{policy, required, GcpContext};
use crate::model::ResourceDescriptor;
use crate::provider::{DeleteOutcome, Observed, ProviderError, Resolved};

const IAM_BASE: &str = "https://iam.googleapis.com/v1";
const CRM_BASE: &str = "https://cloudresourcemanager.googleapis.com/v1";
const SM_BASE: &str = "https://secretmanager.googleapis.com/v1";

/// Service account email, deterministic from account id and project
fn account_email(project: &str, account_id: &str) -> String {
    format!("{account_id}@{project}.iam.gserviceaccount.com")
}

fn account_url(project: &str, email: &str) -> String {
    format!("{IAM_BASE}/projects/{project}/serviceAccounts/{email}")
}

// ── Service accounts ────────────────────────────────────────────────────

pub(super) async fn account_fetch(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Option<Observed>, ProviderError> {
    let account_id = required(desc, "account_id")?;
    let email = account_email(&ctx.project, &account_id);
    let Some(body) = ctx
        .get_opt(&account_url(&ctx.project, &email), "service-account", &email)
        .await?
    else {
        return Ok(None);
    };

    let mut observed = Observed::default();
    observed.config.insert("account_id".into(), account_id);
    if let Some(display) = body.get("displayName").and_then(Value::as_str) {
        observed
            .config
            .insert("display_name".into(), display.to_string());
    }
    observed.attrs.insert("email".into(), email);
    Ok(Some(observed))
}

pub(super) async fn account_create(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Resolved, ProviderError> {
    let account_id = required(desc, "account_id")?;
    let display_name = desc
        .desired
        .get("display_name")
        .cloned()
        .unwrap_or_else(|| account_id.clone());

    info!(account_id = %account_id, "Creating service account");
    ctx.request(
        Method::POST,
        &format!("{IAM_BASE}/projects/{}/serviceAccounts", ctx.project),
        "service-account",
        &account_id,
        Some(json!({
            "accountId": account_id,
            "serviceAccount": { "displayName": display_name },
        })),
    )
    .await?;

    Ok(Resolved::default().attr("email", account_email(&ctx.project, &account_id)))
}

pub(super) async fn account_delete(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<DeleteOutcome, ProviderError> {
    let account_id = required(desc, "account_id")?;
    let email = account_email(&ctx.project, &account_id);
    ctx.request(
        Method::DELETE,
        &account_url(&ctx.project, &email),
        "service-account",
        &email,
        None,
    )
    .await?;
    Ok(DeleteOutcome::Deleted)
}

// ── Policy bindings ─────────────────────────────────────────────────────

/// The IAM policy endpoints for one binding target
struct PolicyTarget {
    get_url: String,
    set_url: String,
    get_method: Method,
}

fn policy_target(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<PolicyTarget, ProviderError> {
    let target = required(desc, "target")?;
    match desc.desired.get("target_kind").map(String::as_str) {
        Some("project") => Ok(PolicyTarget {
            get_url: format!("{CRM_BASE}/projects/{}:getIamPolicy", ctx.project),
            set_url: format!("{CRM_BASE}/projects/{}:setIamPolicy", ctx.project),
            get_method: Method::POST,
        }),
        Some("secret") => {
            let base = format!("{SM_BASE}/projects/{}/secrets/{target}", ctx.project);
            Ok(PolicyTarget {
                get_url: format!("{base}:getIamPolicy"),
                set_url: format!("{base}:setIamPolicy"),
                get_method: Method::GET,
            })
        }
        other => Err(ProviderError::InvalidRequest(format!(
            "binding '{}' has unsupported target_kind {other:?}",
            desc.id
        ))),
    }
}

fn member_of(ctx: &GcpContext, desc: &ResourceDescriptor) -> Result<String, ProviderError> {
    let account_id = required(desc, "service_account")?;
    Ok(format!(
        "serviceAccount:{}",
        account_email(&ctx.project, &account_id)
    ))
}

pub(super) async fn binding_fetch(
    ctx: &GcpContext,
    desc: &ResourceDescriptor,
) -> Result<Option<Observed>, ProviderError> {
    let target = policy_target(ctx, desc)?;
    let role = required(desc, "role")?;
    let member = member_of(ctx, desc)?;

    let current = match ctx
        .request(target.get_method, &target.get_url, "iam-binding", &desc.id, None)
        .await
    {
        Ok(current) => current,
        // Target gone means the grant is gone
        Err(e) if e.is_not_found() => return Ok(None),
        Err(e) => return Err(e),
    };

    if !policy::has_member(&current, &role, &member) {
        return Ok(None);
    }

    let mut observed = Observed::default();
    for key in ["role", "service_account", "target", "target_kind"] {
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
    let target = policy_target(ctx, desc)?;
    let role = required(desc, "role")?;
    let member = member_of(ctx, desc)?;

    let current = ctx
        .request(
            target.get_method.clone(),
            &target.get_url,
            "iam-binding",
            &desc.id,
            None,
        )
        .await?;

    if !policy::has_member(&current, &role, &member) {
        info!(role = %role, member = %member, "Granting role");
        let updated = policy::with_member(current, &role, &member);
        let result = ctx
            .request(
                Method::POST,
                &target.set_url,
                "iam-binding",
                &desc.id,
                Some(json!({ "policy": updated })),
            )
            .await;
        if let Err(e) = result {
            // A freshly created service account may not be visible to the
            // policy service yet; surface as retryable.
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
    let target = policy_target(ctx, desc)?;
    let role = required(desc, "role")?;
    let member = member_of(ctx, desc)?;

    let current = ctx
        .request(
            target.get_method,
            &target.get_url,
            "iam-binding",
            &desc.id,
            None,
        )
        .await?;

    if !policy::has_member(&current, &role, &member) {
        return Ok(DeleteOutcome::AlreadyAbsent);
    }

    let updated = policy::without_member(current, &role, &member);
    ctx.request(
        Method::POST,
        &target.set_url,
        "iam-binding",
        &desc.id,
        Some(json!({ "policy": updated })),
    )
    .await?;
    Ok(DeleteOutcome::Deleted)
}
