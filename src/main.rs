//! tblwatch CLI entry point.
//!
//! `start` runs the relay until Ctrl-C; `check` resolves the configuration
//! and reports what would run.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tokio::sync::watch;
use tracing::{error, info, warn};

use tblwatch::audit::{AuditSink, SqliteAuditSink, TracingAuditSink};
use tblwatch::capture::listener::run_listener;
use tblwatch::capture::sanitizer::Sanitizer;
use tblwatch::capture::EventFilter;
use tblwatch::config::{Config, ConfigError, DatabaseKind, DatabaseSettings};
use tblwatch::destinations::rocketchat::RocketChatDestination;
use tblwatch::destinations::telegram::TelegramDestination;
use tblwatch::destinations::Destination;
use tblwatch::format::otp::{OtpColumns, PgOtpLookup};
use tblwatch::format::{Formatter, OtpRoute};
use tblwatch::outbound::scheduler::run_delivery_loop;
use tblwatch::outbound::{Aggregator, DestinationLimits};
use tblwatch::relay::Relay;

/// tblwatch: relay PostgreSQL row changes to chat rooms.
#[derive(Parser)]
#[command(name = "tblwatch", version, about)]
struct Cli {
    /// Config file (default: `$TBLWATCH_CONFIG`, then `./tblwatch.toml`).
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Subcommand to execute.
    #[command(subcommand)]
    command: Command,
}

/// Available CLI subcommands.
#[derive(Subcommand)]
enum Command {
    /// Listen for changes and deliver them until interrupted.
    Start,
    /// Validate the configuration and exit.
    Check,
}

/// A destination ready to wrap in an aggregator.
struct PlannedDestination {
    destination: Arc<dyn Destination>,
    limits: DestinationLimits,
    tick: Duration,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // A missing .env is fine; real deployments set the environment directly.
    let _ = dotenvy::dotenv();

    let cli = Cli::parse();
    let config_path = Config::resolve_path(cli.config.as_deref(), |key| std::env::var(key).ok());

    match cli.command {
        Command::Start => handle_start(&config_path).await,
        Command::Check => handle_check(&config_path),
    }
}

/// Run the relay until Ctrl-C.
async fn handle_start(config_path: &Path) -> anyhow::Result<()> {
    let config = Config::load(config_path)?;
    let _logging_guard = tblwatch::logging::init_production(&config.logging)?;

    anyhow::ensure!(
        !config.capture.table.is_empty(),
        "capture.table must name the table to relay"
    );

    let env = |key: &str| std::env::var(key).ok();
    let audit = open_audit(&config).await?;

    let planned = plan_destinations(&config, &env);
    anyhow::ensure!(
        !planned.is_empty(),
        "no destination is configured; enable [telegram] or [rocketchat]"
    );

    let aggregators: Vec<(Arc<Aggregator>, Duration)> = planned
        .into_iter()
        .map(|p| {
            (
                Aggregator::new(p.destination, p.limits, Arc::clone(&audit)),
                p.tick,
            )
        })
        .collect();

    // Initial logins run in the background; failures schedule their own retry.
    for (aggregator, _) in &aggregators {
        let aggregator = Arc::clone(aggregator);
        tokio::spawn(async move {
            aggregator.authenticate().await;
        });
    }

    let formatter = build_formatter(&config, &env)?;
    let relay = Arc::new(Relay::new(
        EventFilter::new(config.capture.table.clone(), config.capture.databases.clone()),
        config.capture.key_field.clone(),
        formatter,
        aggregators.iter().map(|(a, _)| Arc::clone(a)).collect(),
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut tasks = Vec::new();

    for (aggregator, tick) in &aggregators {
        tasks.push(tokio::spawn(run_delivery_loop(
            Arc::clone(aggregator),
            *tick,
            shutdown_rx.clone(),
        )));
    }

    let databases = resolve_databases(&config, &env);
    if databases.is_empty() {
        warn!("no database connection resolved; nothing will be captured");
    }
    for settings in databases {
        tasks.push(tokio::spawn(run_listener(
            settings,
            config.capture.channel.clone(),
            Arc::clone(&relay),
            shutdown_rx.clone(),
        )));
    }

    info!(
        config = %config_path.display(),
        channel = %config.capture.channel,
        table = %config.capture.table,
        destinations = aggregators.len(),
        "tblwatch started"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("shutdown requested");

    let _ = shutdown_tx.send(true);
    for (aggregator, _) in &aggregators {
        aggregator.shutdown();
    }
    for task in tasks {
        if let Err(e) = task.await {
            error!(error = %e, "task ended abnormally");
        }
    }

    info!("tblwatch stopped");
    Ok(())
}

/// Resolve everything and report it without connecting anywhere.
fn handle_check(config_path: &Path) -> anyhow::Result<()> {
    tblwatch::logging::init_cli();

    let config = Config::load(config_path)?;
    let env = |key: &str| std::env::var(key).ok();

    if config.capture.table.is_empty() {
        warn!("capture.table is empty; every notification will be filtered");
    }
    info!(
        channel = %config.capture.channel,
        table = %config.capture.table,
        databases = ?config.capture.databases,
        "capture"
    );

    let databases = resolve_databases(&config, &env);
    info!(count = databases.len(), "database connections resolved");

    config
        .sanitizer
        .rules()
        .context("invalid [sanitizer] section")?;

    let planned = plan_destinations(&config, &env);
    for p in &planned {
        info!(
            destination = p.destination.name(),
            soft_limit = p.limits.soft_limit,
            hard_limit = p.limits.hard_limit,
            tick_ms = u64::try_from(p.tick.as_millis()).unwrap_or(u64::MAX),
            "destination ready"
        );
    }
    anyhow::ensure!(!planned.is_empty(), "no usable destination");

    if let Some(otp) = &config.otp {
        columns_for(otp)
            .query()
            .context("invalid [otp] section")?;
        info!(table = %otp.table, databases = ?config.otp_databases(), "one-time-code lookup");
    }

    info!(config = %config_path.display(), "configuration ok");
    Ok(())
}

async fn open_audit(config: &Config) -> anyhow::Result<Arc<dyn AuditSink>> {
    match &config.audit.path {
        Some(path) => {
            let sink = SqliteAuditSink::open(path).await?;
            info!(path = %path.display(), "audit records stored in sqlite");
            Ok(Arc::new(sink))
        }
        None => Ok(Arc::new(TracingAuditSink)),
    }
}

/// Build each enabled destination; one that cannot be resolved is skipped.
fn plan_destinations(
    config: &Config,
    env: &impl Fn(&str) -> Option<String>,
) -> Vec<PlannedDestination> {
    let mut planned = Vec::new();

    if let Some(tg) = config.telegram.as_ref().filter(|tg| tg.enabled) {
        let limits_config = config.limits_for(tg.limits.as_ref());
        let built = tg.resolve(env).and_then(|settings| {
            let limits = limits_config.to_limits()?;
            Ok(PlannedDestination {
                destination: Arc::new(TelegramDestination::new(settings)),
                limits,
                tick: limits_config.tick_interval(),
            })
        });
        push_or_skip(&mut planned, "telegram", built);
    }

    if let Some(rc) = config.rocketchat.as_ref().filter(|rc| rc.enabled) {
        let limits_config = config.limits_for(rc.limits.as_ref());
        let built = rc.resolve(env).and_then(|settings| {
            let limits = limits_config.to_limits()?;
            Ok(PlannedDestination {
                destination: Arc::new(RocketChatDestination::new(settings)),
                limits,
                tick: limits_config.tick_interval(),
            })
        });
        push_or_skip(&mut planned, "rocketchat", built);
    }

    planned
}

fn push_or_skip(
    planned: &mut Vec<PlannedDestination>,
    name: &str,
    built: Result<PlannedDestination, ConfigError>,
) {
    match built {
        Ok(p) => planned.push(p),
        Err(e) => warn!(destination = name, error = %e, "destination disabled"),
    }
}

fn resolve_databases(
    config: &Config,
    env: &impl Fn(&str) -> Option<String>,
) -> Vec<DatabaseSettings> {
    config
        .databases
        .iter()
        .filter_map(|db| match (db.kind, db.resolve(env)) {
            (DatabaseKind::Postgres, Ok(settings)) => Some(settings),
            (_, Err(e)) => {
                warn!(database = %db.name, error = %e, "database skipped");
                None
            }
        })
        .collect()
}

fn columns_for(otp: &tblwatch::config::OtpConfig) -> OtpColumns {
    OtpColumns {
        table: otp.table.clone(),
        id_column: otp.id_column.clone(),
        identifier_column: otp.identifier_column.clone(),
        code_column: otp.code_column.clone(),
    }
}

fn build_formatter(
    config: &Config,
    env: &impl Fn(&str) -> Option<String>,
) -> anyhow::Result<Formatter> {
    let sanitizer = Sanitizer::new(
        config
            .sanitizer
            .rules()
            .context("invalid [sanitizer] section")?,
    );
    let formatter = Formatter::new(config.capture.key_field.clone(), sanitizer);

    let Some(otp) = &config.otp else {
        return Ok(formatter);
    };
    let Some(base_url) = env(otp.url_env.as_str()).filter(|v| !v.trim().is_empty()) else {
        warn!(var = %otp.url_env, "one-time-code lookup disabled: connection url not set");
        return Ok(formatter);
    };

    let databases = config.otp_databases();
    let lookup = PgOtpLookup::new(&base_url, &columns_for(otp), databases.clone())
        .context("invalid [otp] section")?;
    let route = OtpRoute {
        table: otp.table.clone(),
        code_field: otp.code_column.clone(),
        databases,
    };
    info!(table = %route.table, "one-time-code lookup enabled");
    Ok(formatter.with_otp(route, Arc::new(lookup)))
}
