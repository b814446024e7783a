//! metricd monitoring agent
//!
//! The agent schedules data-collection checks across a set of collector
//! plugins. Checks come from the local configuration (the built-in
//! local-checks client) or from upstream consumers feeding the
//! scheduler API; results flow back through per-client sinks. This
//! entry point wires configuration, logging, the plugin registry and
//! the scheduler together and handles the process lifecycle.

// Use jemalloc as the global allocator for better performance
#[cfg(not(target_os = "windows"))]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::RwLock;
use tracing::{info, warn};

mod alias;
mod client;
mod config;
mod keyaccess;
mod plugin_agent;
mod plugin_cpu;
mod plugin_exec;
mod plugin_logfile;
mod plugin_system;
mod queue;
mod scheduler;
mod task;
#[cfg(test)]
mod tests;
mod userparams;

use client::{LOCAL_CHECKS_CLIENT_ID, TESTRUN_CLIENT_ID};
use config::AgentConfig;
use metricd_core::plugin::{CheckResult, MetricRegistry, Request, ResultWriter};
use metricd_core::ExpressionSet;
use plugin_cpu::CpuPlugin;
use plugin_exec::ExecPlugin;
use plugin_logfile::LogfilePlugin;
use plugin_system::SystemPlugin;
use scheduler::Manager;

/// Timeout of a single `--test` evaluation.
const TEST_CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Command-line arguments for the agent
#[derive(Parser, Debug)]
#[command(name = "metricd")]
#[command(about = "Monitoring agent that schedules collector plugins", long_about = None)]
struct CliArgs {
    /// Path to the configuration file
    #[arg(value_name = "CONFIG", default_value = "metricd.toml")]
    config: PathBuf,

    /// Override the log level from the config file
    #[arg(long = "log-level", value_name = "LEVEL")]
    log_level: Option<String>,

    /// Evaluate a single item key once and exit
    #[arg(short = 't', long = "test", value_name = "KEY")]
    test: Option<String>,
}

/// Sink of the locally configured checks: results go to stdout as JSON
/// lines, one per collected value.
struct ConsoleSink;

impl ResultWriter for ConsoleSink {
    fn write(&self, result: CheckResult) {
        match serde_json::to_string(&result) {
            Ok(line) => println!("{line}"),
            Err(err) => warn!("cannot serialize check result: {err}"),
        }
    }

    fn slots_available(&self) -> usize {
        1_000
    }
}

/// Registers the built-in plugins and the configured user parameters.
fn build_registry(config: &AgentConfig) -> Result<MetricRegistry> {
    let mut registry = MetricRegistry::new();
    SystemPlugin::register(&mut registry);
    CpuPlugin::register(&mut registry);
    ExecPlugin::register(&mut registry);
    LogfilePlugin::register(&mut registry);
    for metric in userparams::compile(&config.user_parameters, config.unsafe_user_parameters)? {
        registry.register_user_param(metric.plugin, metric.key, metric.description);
    }
    Ok(registry)
}

fn init_logging(
    config: &AgentConfig,
    override_level: Option<&str>,
) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let level = override_level.unwrap_or(&config.log_level);
    // RUST_LOG wins; the configured level is only the default
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        tracing_subscriber::EnvFilter::new(format!(
            "metricd_agent={level},metricd_core={level},metricd={level}"
        ))
    });

    match &config.log_dir {
        Some(dir) => {
            let file_appender = tracing_appender::rolling::daily(dir, "metricd.log");
            let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter)
                .json()
                .with_current_span(false)
                .with_span_list(false)
                .with_writer(non_blocking)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt().with_env_filter(env_filter).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();

    let config = if args.config.exists() {
        AgentConfig::load(&args.config)?
    } else {
        AgentConfig::default()
    };
    let _log_guard = init_logging(&config, args.log_level.as_deref());
    info!("metricd agent starting up");
    if !args.config.exists() {
        warn!(
            "configuration file {} not found, using defaults",
            args.config.display()
        );
    }

    let registry = build_registry(&config)?;
    let checks = config.checks.clone();
    let shared_config = Arc::new(RwLock::new(config));
    let (manager, handle) = Manager::new(&registry, shared_config).await?;
    let scheduler_loop = tokio::spawn(manager.run());

    // one-shot test mode, the on-demand equivalent of a passive check
    if let Some(key) = args.test {
        let outcome = handle
            .perform_task(&key, TEST_CHECK_TIMEOUT, TESTRUN_CLIENT_ID)
            .await;
        match outcome {
            Ok(value) => println!("{key}: {value}"),
            Err(err) => println!("{key}: error: {err}"),
        }
        handle.stop().await;
        let _ = scheduler_loop.await;
        return Ok(());
    }

    if checks.is_empty() {
        warn!("no local checks configured, scheduler is idle");
    } else {
        let requests: Vec<Request> = checks
            .iter()
            .enumerate()
            .map(|(index, check)| Request {
                itemid: index as u64 + 1,
                key: check.key.clone(),
                delay: check.delay.clone(),
                last_logsize: Some(0),
                mtime: Some(0),
            })
            .collect();
        info!("subscribing {} local checks", requests.len());
        handle
            .update_tasks(
                LOCAL_CHECKS_CLIENT_ID,
                Arc::new(ConsoleSink),
                false,
                Arc::new(ExpressionSet::default()),
                requests,
            )
            .await;
    }

    tokio::signal::ctrl_c()
        .await
        .context("cannot listen for the interrupt signal")?;
    info!("interrupt received, stopping scheduler");
    handle.stop().await;
    let _ = scheduler_loop.await;
    info!("metricd agent stopped");
    Ok(())
}
