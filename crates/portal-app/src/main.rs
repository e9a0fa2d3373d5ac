//! Portal - a forward proxy that relays selected hosts through a peer or
//! an upstream proxy.
//!
//! This is the main binary:
//! - loads `portal.config.json`
//! - opens the rule sources and starts the remote rule refresher
//! - runs the proxy listener until Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use directories::ProjectDirs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::filter::filter_fn;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Layer};

use portal_core::config::DEFAULT_CONFIG_FILE;
use portal_core::{PortalConfig, ProxyRuleManager};
use portal_proxy::ACCESS_LOG_TARGET;
use portal_server::{AppState, Server};

/// Portal - relaying forward proxy
#[derive(Parser, Debug)]
#[command(name = "portal", version, about)]
struct Args {
    /// Path to the configuration file
    #[arg(long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging and mirror logs to stdout
    #[arg(long)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Directory for log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

/// Get the logs directory path.
fn logs_dir(args: &Args) -> Option<PathBuf> {
    args.log_dir.clone().or_else(|| {
        ProjectDirs::from("", "portal", "Portal").map(|dirs| dirs.data_dir().join("logs"))
    })
}

/// Default filter: our crates at `level`, access lines always, others warn.
fn default_directives(level: &str) -> String {
    format!("portal={level},{ACCESS_LOG_TARGET}=info,warn")
}

fn rolling_appender(dir: &PathBuf, prefix: &str) -> Option<RollingFileAppender> {
    RollingFileAppender::builder()
        .rotation(Rotation::DAILY)
        .max_log_files(5)
        .filename_prefix(prefix)
        .filename_suffix("log")
        .build(dir)
        .ok()
}

/// Initialize logging with file rotation.
///
/// Access lines go to `access.*.log`, everything else to `portal.*.log`.
fn init_logging(args: &Args) -> Vec<WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(default_directives(log_level)));

    let appenders = logs_dir(args).and_then(|log_dir| {
        std::fs::create_dir_all(&log_dir).ok()?;
        let main = rolling_appender(&log_dir, "portal")?;
        let access = rolling_appender(&log_dir, "access")?;
        Some((log_dir, main, access))
    });

    if let Some((log_dir, main, access)) = appenders {
        let (main_writer, main_guard) = tracing_appender::non_blocking(main);
        let (access_writer, access_guard) = tracing_appender::non_blocking(access);

        let console = args
            .debug
            .then(|| fmt::layer().with_writer(std::io::stdout));

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console)
            .with(
                fmt::layer()
                    .with_writer(main_writer)
                    .with_ansi(false)
                    .with_filter(filter_fn(|meta| meta.target() != ACCESS_LOG_TARGET)),
            )
            .with(
                fmt::layer()
                    .with_writer(access_writer)
                    .with_ansi(false)
                    .with_target(false)
                    .with_filter(filter_fn(|meta| meta.target() == ACCESS_LOG_TARGET)),
            )
            .init();

        tracing::info!("Logging to {:?}", log_dir);
        return vec![main_guard, access_guard];
    }

    // Fallback: console logging only
    tracing_subscriber::fmt().with_env_filter(env_filter).init();

    tracing::warn!("File logging unavailable, using console only");
    Vec::new()
}

async fn run(config: PortalConfig) -> anyhow::Result<()> {
    let data_dir = config.data_dir();
    tokio::fs::create_dir_all(&data_dir)
        .await
        .with_context(|| format!("Failed to create data directory {:?}", data_dir))?;
    tracing::info!("Data directory: {:?}", data_dir);

    let rules = ProxyRuleManager::open(&data_dir, config.direct_proxy.rule_manager_options())
        .await
        .context("Failed to open rule sources")?;
    let rules = Arc::new(rules);

    if config.direct_proxy.enabled {
        tokio::spawn(rules.clone().start_remote_refresh());
    }

    let state = AppState::new(&config, rules).context("Failed to build proxy state")?;
    let server = Server::bind(&config.bind_address(), state)
        .await
        .context("Failed to start listener")?;
    let handle = server.start()?;
    tracing::info!("Portal started on {}", handle.addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;

    tracing::info!("Portal shutting down");
    handle.stop().await;
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep guards alive for the duration of the program
    let _log_guards = init_logging(&args);

    tracing::info!("Starting Portal...");
    tracing::debug!("Args: {:?}", args);

    let config = PortalConfig::load(&args.config)
        .with_context(|| format!("Failed to load configuration from {:?}", args.config))?;

    let workers = config.instance_number.resolve();
    tracing::info!("Using {} worker threads", workers);

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(workers)
        .enable_all()
        .build()
        .context("Failed to build async runtime")?;

    let result = runtime.block_on(run(config));
    if let Err(e) = &result {
        tracing::error!("{:#}", e);
    }
    result
}
