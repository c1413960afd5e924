//! Clinic kernel operator CLI.
//!
//! Provides `migrate`, `sweep`, `audit`, `feature` and `watch` subcommands
//! for maintaining the kernel database outside the request path.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use tracing::info;

use clinic_kernel::audit::{AuditAction, AuditFilter, Page};
use clinic_kernel::config::{self, Config};
use clinic_kernel::identity::{Origin, Principal, Role, TenantId, UserId};
use clinic_kernel::{db, logging, Kernel};

/// Clinic kernel: tenant isolation, permission and audit maintenance.
#[derive(Parser)]
#[command(name = "clinic-kernel", version, about)]
struct Cli {
    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Create the database if needed and apply the schema.
    Migrate,
    /// Run one integrity sweep and print the JSON report.
    Sweep {
        /// Tenant to sweep.
        #[arg(long)]
        tenant: i64,
    },
    /// Print a tenant's audit entries as JSON lines, newest first.
    Audit {
        /// Tenant whose log is read.
        #[arg(long)]
        tenant: i64,
        /// Only entries by this user.
        #[arg(long)]
        user: Option<i64>,
        /// Only entries about this resource type.
        #[arg(long)]
        resource_type: Option<String>,
        /// Only entries about this resource id.
        #[arg(long)]
        resource_id: Option<String>,
        /// Only entries of this action (`create`, `feature.set`, ...).
        #[arg(long)]
        action: Option<AuditAction>,
        /// Entries at or after this RFC 3339 time.
        #[arg(long)]
        since: Option<DateTime<Utc>>,
        /// Entries before this RFC 3339 time.
        #[arg(long)]
        until: Option<DateTime<Utc>>,
        /// Maximum entries printed.
        #[arg(long, default_value_t = 50)]
        limit: u32,
        /// Entries skipped.
        #[arg(long, default_value_t = 0)]
        offset: u32,
    },
    /// Read or toggle a tenant feature flag.
    Feature {
        /// Feature action.
        #[command(subcommand)]
        action: FeatureAction,
    },
    /// Sweep the given tenants periodically until Ctrl-C.
    Watch {
        /// Tenants to sweep.
        #[arg(long = "tenant", required = true)]
        tenants: Vec<i64>,
    },
}

/// `feature` subcommands.
#[derive(Subcommand)]
enum FeatureAction {
    /// Print whether a feature is enabled.
    Get {
        /// Tenant to inspect.
        #[arg(long)]
        tenant: i64,
        /// Feature name.
        #[arg(long)]
        name: String,
    },
    /// Enable or disable a feature (audited).
    Set {
        /// Tenant to change.
        #[arg(long)]
        tenant: i64,
        /// Feature name.
        #[arg(long)]
        name: String,
        /// Target state.
        #[arg(long, action = clap::ArgAction::Set)]
        enabled: bool,
        /// Operator user id recorded in the audit log.
        #[arg(long)]
        by: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();
    if !matches!(cli.command, Command::Watch { .. }) {
        logging::init_cli();
    }

    let config = Config::load().context("failed to load configuration")?;
    let base = config_base()?;

    match cli.command {
        Command::Migrate => handle_migrate(&config, &base).await,
        Command::Sweep { tenant } => handle_sweep(&config, &base, tenant).await,
        Command::Audit {
            tenant,
            user,
            resource_type,
            resource_id,
            action,
            since,
            until,
            limit,
            offset,
        } => {
            let filter = AuditFilter {
                user_id: user.map(UserId::new),
                resource_type,
                resource_id,
                action,
                since,
                until,
            };
            handle_audit(&config, &base, tenant, filter, Page::new(limit, offset)).await
        }
        Command::Feature { action } => handle_feature(&config, &base, action).await,
        Command::Watch { tenants } => handle_watch(&config, &base, tenants).await,
    }
}

/// Directory relative database and log paths resolve against.
fn config_base() -> anyhow::Result<PathBuf> {
    let path = config::config_path_with(|key| std::env::var(key).ok())?;
    Ok(path
        .parent()
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf))
}

async fn open_kernel(config: &Config, base: &Path) -> anyhow::Result<Kernel> {
    let db_path = config.database_path(base);
    let pool = db::open(&db_path, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    Ok(Kernel::new(pool, config))
}

/// Operator principal acting inside `tenant` on behalf of the CLI.
fn operator(tenant: TenantId, user: i64) -> Principal {
    Principal::new(tenant, UserId::new(user), [Role::Operator]).with_origin(Origin {
        request_id: Some(uuid::Uuid::new_v4().to_string()),
        user_agent: Some(format!("clinic-kernel-cli/{}", env!("CARGO_PKG_VERSION"))),
        ..Origin::default()
    })
}

async fn handle_migrate(config: &Config, base: &Path) -> anyhow::Result<()> {
    let db_path = config.database_path(base);
    let pool = db::open(&db_path, config.database.max_connections)
        .await
        .with_context(|| format!("failed to open database {}", db_path.display()))?;
    pool.close().await;
    info!(path = %db_path.display(), "schema applied");
    println!("migrated {}", db_path.display());
    Ok(())
}

async fn handle_sweep(config: &Config, base: &Path, tenant: i64) -> anyhow::Result<()> {
    let tenant = TenantId::new(tenant)?;
    let kernel = open_kernel(config, base).await?;
    let plan = kernel.full_sweep_plan();
    let report = kernel.run_integrity_sweep(tenant, &plan).await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    kernel.pool().close().await;
    if !report.is_clean() {
        std::process::exit(2);
    }
    Ok(())
}

async fn handle_audit(
    config: &Config,
    base: &Path,
    tenant: i64,
    filter: AuditFilter,
    page: Page,
) -> anyhow::Result<()> {
    let tenant = TenantId::new(tenant)?;
    let kernel = open_kernel(config, base).await?;
    // Reads are not audited, so no acting user is recorded.
    let principal = operator(tenant, 0);
    let entries = kernel.get_audit_log(&principal, &filter, page).await?;
    for entry in &entries {
        println!("{}", serde_json::to_string(entry)?);
    }
    kernel.pool().close().await;
    Ok(())
}

async fn handle_feature(config: &Config, base: &Path, action: FeatureAction) -> anyhow::Result<()> {
    let kernel = open_kernel(config, base).await?;
    match action {
        FeatureAction::Get { tenant, name } => {
            let tenant = TenantId::new(tenant)?;
            let enabled = kernel.is_feature_enabled(tenant, &name).await?;
            println!("{}", serde_json::json!({ "tenant_id": tenant, "feature": name, "enabled": enabled }));
        }
        FeatureAction::Set {
            tenant,
            name,
            enabled,
            by,
        } => {
            let tenant = TenantId::new(tenant)?;
            let principal = operator(tenant, by);
            let flag = kernel.set_feature(&principal, tenant, &name, enabled).await?;
            println!("{}", serde_json::to_string(&flag)?);
        }
    }
    kernel.pool().close().await;
    Ok(())
}

async fn handle_watch(config: &Config, base: &Path, tenants: Vec<i64>) -> anyhow::Result<()> {
    let logs_dir = config
        .logging
        .logs_dir
        .clone()
        .unwrap_or_else(|| base.join("logs"));
    let _logging_guard = logging::init_production(&logs_dir)?;

    let tenants = tenants
        .into_iter()
        .map(TenantId::new)
        .collect::<Result<Vec<_>, _>>()?;
    let kernel = open_kernel(config, base).await?;
    let interval = Duration::from_secs(config.integrity.interval_secs.max(1));
    info!(tenants = tenants.len(), interval_secs = interval.as_secs(), "starting periodic integrity sweeps");

    let (handle, mut reports) =
        kernel
            .integrity()
            .spawn_periodic(tenants, kernel.full_sweep_plan(), interval);

    loop {
        tokio::select! {
            report = reports.recv() => match report {
                Some(report) => println!("{}", serde_json::to_string(&report)?),
                None => break,
            },
            _ = tokio::signal::ctrl_c() => {
                info!("shutdown requested");
                break;
            }
        }
    }

    handle.abort();
    kernel.pool().close().await;
    Ok(())
}
