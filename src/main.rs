//! runway: provision an n8n deployment on Google Cloud Run
//!
//! `plan` shows what apply would change without mutating anything, `apply`
//! converges the remote project towards the plan, `destroy` tears it down in
//! reverse dependency order. Exit codes: 0 success, 1 validation error,
//! 2 partial apply failure, 3 cancelled.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL_CONDENSED, Cell, ContentArrangement, Table};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use runway::config::{
    DatabaseConfig, DeployConfig, ProbeConfig, ProjectConfig, SecretsConfig, ServiceConfig,
};
use runway::destroy::{destroy, DestroyOptions};
use runway::model::ResourceState;
use runway::plan::{build_plan, ids};
use runway::provider::gcp::GcpProvider;
use runway::provider::ResourceProvider;
use runway::reconcile::{preview, Action, ReconcileOptions, Reconciler};
use runway::secrets::{SecretEngine, SecretPolicy};

#[derive(Parser, Debug)]
#[command(name = "runway")]
#[command(about = "Provision an n8n deployment on Google Cloud Run")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

/// Deployment parameters shared by every command
#[derive(clap::Args, Debug)]
struct DeployArgs {
    /// Cloud project id
    #[arg(long, env = "RUNWAY_PROJECT")]
    project: String,

    /// Region for regional resources
    #[arg(long, default_value = "europe-west1")]
    region: String,

    /// Naming prefix for every resource in the deployment
    #[arg(long, default_value = "n8n")]
    prefix: String,

    /// Public base URL the application is reached at
    #[arg(long)]
    url: String,

    /// Database instance machine tier
    #[arg(long, default_value = "db-f1-micro")]
    db_tier: String,

    /// Database engine version
    #[arg(long, default_value = "POSTGRES_16")]
    db_version: String,

    /// Logical database name
    #[arg(long, default_value = "n8n")]
    db_name: String,

    /// Database user the application connects as
    #[arg(long, default_value = "n8n")]
    db_user: String,

    /// Custom container image; omit to run the official image
    #[arg(long)]
    custom_image: Option<String>,

    /// URL path prefix served by a custom image
    #[arg(long, default_value = "/")]
    service_path: String,

    /// Proxy hops between the load balancer and the container
    #[arg(long, default_value = "1")]
    proxy_hops: u32,

    /// Startup probe: seconds before the first check
    #[arg(long, default_value = "60")]
    probe_initial_delay: u32,

    /// Startup probe: per-check timeout in seconds
    #[arg(long, default_value = "5")]
    probe_timeout: u32,

    /// Startup probe: seconds between checks
    #[arg(long, default_value = "10")]
    probe_period: u32,

    /// Startup probe: failed checks before the deployment is failed
    #[arg(long, default_value = "10")]
    probe_failure_threshold: u32,

    /// Reuse an existing application encryption key instead of generating
    /// one (validated against the encryption-key policy)
    #[arg(long, env = "N8N_ENCRYPTION_KEY", hide_env_values = true)]
    encryption_key: Option<String>,

    /// Maximum concurrent provisioning calls
    #[arg(long, default_value = "4")]
    workers: usize,

    /// Also replace/delete protected resources (database instance, bucket)
    #[arg(long)]
    allow_destructive_override: bool,
}

impl From<&DeployArgs> for DeployConfig {
    fn from(args: &DeployArgs) -> Self {
        Self {
            project: ProjectConfig {
                project: args.project.clone(),
                region: args.region.clone(),
                prefix: args.prefix.clone(),
            },
            database: DatabaseConfig {
                tier: args.db_tier.clone(),
                version: args.db_version.clone(),
                database: args.db_name.clone(),
                user: args.db_user.clone(),
            },
            service: ServiceConfig {
                custom_image: args.custom_image.clone(),
                public_url: args.url.clone(),
                path: args.service_path.clone(),
                proxy_hops: args.proxy_hops,
                probe: ProbeConfig {
                    initial_delay_secs: args.probe_initial_delay,
                    timeout_secs: args.probe_timeout,
                    period_secs: args.probe_period,
                    failure_threshold: args.probe_failure_threshold,
                },
            },
            secrets: SecretsConfig {
                encryption_key: args.encryption_key.clone(),
            },
        }
    }
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Show what apply would change, without mutating anything
    Plan(Box<DeployArgs>),

    /// Provision and converge the deployment
    Apply(Box<DeployArgs>),

    /// Tear the deployment down in reverse dependency order
    Destroy(Box<DeployArgs>),
}

#[tokio::main]
async fn main() {
    let code = match run().await {
        Ok(code) => code,
        Err(e) => {
            print_error(&e);
            1
        }
    };
    std::process::exit(code);
}

/// Print error in a user-friendly way
fn print_error(e: &anyhow::Error) {
    use std::io::Write;

    let mut stderr = std::io::stderr();
    let _ = writeln!(stderr, "\n\x1b[1;31mError:\x1b[0m {e}");

    let mut source = e.source();
    while let Some(cause) = source {
        let _ = writeln!(stderr, "  \x1b[33mCaused by:\x1b[0m {cause}");
        source = cause.source();
    }
}

async fn run() -> Result<i32> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .init();

    let args = Args::parse();

    match args.command {
        Command::Plan(deploy) => handle_plan(&deploy).await,
        Command::Apply(deploy) => handle_apply(&deploy).await,
        Command::Destroy(deploy) => handle_destroy(&deploy).await,
    }
}

/// Cancel the token on Ctrl-C; in-flight calls drain cleanly.
fn cancel_on_interrupt() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, letting in-flight work finish");
            token.cancel();
        }
    });
    cancel
}

fn provider_for(args: &DeployArgs) -> Result<Arc<dyn ResourceProvider>> {
    let provider = GcpProvider::new(&args.project, &args.prefix)
        .context("Failed to construct the Google Cloud provider")?;
    Ok(Arc::new(provider))
}

/// Pre-validate operator-supplied secret material before any mutation.
fn secret_engine_for(config: &DeployConfig) -> Result<SecretEngine> {
    let mut engine = SecretEngine::new();
    if let Some(key) = &config.secrets.encryption_key {
        engine
            .supply(ids::ENCRYPTION_KEY, key, SecretPolicy::EncryptionKey)
            .context("Supplied encryption key does not meet the key policy")?;
    }
    Ok(engine)
}

async fn handle_plan(args: &DeployArgs) -> Result<i32> {
    let config = DeployConfig::from(args);
    let plan = build_plan(&config);
    let provider = provider_for(args)?;

    info!(
        project = %config.project.project,
        prefix = %config.project.prefix,
        descriptors = plan.descriptors.len(),
        "Previewing plan"
    );
    let rows = preview(provider.as_ref(), &plan).await?;

    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["DESCRIPTOR", "KIND", "ACTION", "DETAIL"]);
    let mut changes = 0usize;
    for row in &rows {
        let action = match (&row.action, &row.error) {
            (Some(action), _) => action.to_string(),
            (None, Some(_)) => "error".to_string(),
            (None, None) => "-".to_string(),
        };
        if matches!(row.action, Some(Action::Created | Action::Updated)) {
            changes += 1;
        }
        table.add_row(vec![
            Cell::new(&row.id),
            Cell::new(row.kind.as_str()),
            Cell::new(action),
            Cell::new(row.error.clone().unwrap_or_default()),
        ]);
    }
    println!("{table}");
    println!("\nPlan: {changes} of {} resources would change.", rows.len());

    Ok(0)
}

async fn handle_apply(args: &DeployArgs) -> Result<i32> {
    let config = DeployConfig::from(args);
    let plan = build_plan(&config);
    let provider = provider_for(args)?;
    let secrets = secret_engine_for(&config)?;

    let options = ReconcileOptions {
        workers: args.workers,
        cancel: cancel_on_interrupt(),
        allow_destructive_override: args.allow_destructive_override,
        ..Default::default()
    };

    info!(
        project = %config.project.project,
        prefix = %config.project.prefix,
        descriptors = plan.descriptors.len(),
        workers = options.workers,
        "Applying plan"
    );

    let reconciler = Reconciler::new(provider, secrets, options);
    let report = reconciler.apply(&plan).await?;

    let unchanged = report
        .outcomes
        .iter()
        .filter(|o| o.action == Some(Action::Unchanged))
        .count();
    println!("{}", report.render_table());
    println!(
        "\nApply: {} changed, {} failed, {} unchanged.",
        report.changed(),
        report.count_in(ResourceState::Failed),
        unchanged,
    );
    if let Some(outcome) = report.outcome_for(ids::SERVICE) {
        if outcome.state == ResourceState::Ready {
            println!("Service URL: {}", config.service.public_url);
        }
    }

    Ok(report.outcome().exit_code())
}

async fn handle_destroy(args: &DeployArgs) -> Result<i32> {
    let config = DeployConfig::from(args);
    let plan = build_plan(&config);
    let provider = provider_for(args)?;

    let options = DestroyOptions {
        allow_destructive_override: args.allow_destructive_override,
        cancel: cancel_on_interrupt(),
        ..Default::default()
    };

    info!(
        project = %config.project.project,
        prefix = %config.project.prefix,
        "Destroying deployment"
    );
    let report = destroy(provider, &plan, &options).await?;

    println!("{}", report.render_table());
    println!(
        "\nDestroy: {} deleted, {} failed, {} protected.",
        report.deleted(),
        report.failed(),
        report.skipped_protected(),
    );
    if report.skipped_protected() > 0 {
        println!("Protected resources were kept; re-run with --allow-destructive-override to delete them.");
    }

    Ok(report.exit_code())
}
