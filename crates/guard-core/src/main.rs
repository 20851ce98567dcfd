//! guard-server: trading safety and capital allocation controller.
//!
//! Usage:
//!   guard-server [OPTIONS]
//!
//! Options:
//!   -c, --config <FILE>         Config file path (default: config/guard.toml)
//!   --api-port <PORT>           REST API port (overrides config)
//!   --push-port <PORT>          WebSocket push port (overrides config)
//!   --log-level <LEVEL>         trace, debug, info, warn, error
//!   --clickhouse-url <URL>      ClickHouse HTTP URL; enables the event journal

use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use guard_common::{ClickHouseClient, Platform, UserId};
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use guard_core::api::{spawn_api_server, ApiServerConfig};
use guard_core::broadcast::{ClickHouseJournal, PushServer, PushServerConfig};
use guard_core::collaborators::http::{
    HttpBalanceProvider, HttpCredentialVault, HttpExecutionSink, HttpIdentityProvider,
};
use guard_core::collaborators::memory::{
    FixedBalanceProvider, MemoryVault, StaticIdentityProvider, TracingExecutionSink,
};
use guard_core::collaborators::{
    BalanceProvider, CredentialVault, EventJournal, ExecutionSink, IdentityProvider,
};
use guard_core::gate::ONBOARDING_FINAL_STEP;
use guard_core::{Collaborators, GuardConfig, TradingGuard};

/// CLI arguments for guard-server.
#[derive(Parser, Debug)]
#[command(name = "guard-server")]
#[command(about = "Trading safety and capital allocation controller")]
#[command(version)]
struct Args {
    /// Config file path
    #[arg(short, long, default_value = "config/guard.toml")]
    config: PathBuf,

    /// REST API port (overrides config file)
    #[arg(long)]
    api_port: Option<u16>,

    /// WebSocket push port (overrides config file)
    #[arg(long)]
    push_port: Option<u16>,

    /// Log level (overrides config file)
    #[arg(long)]
    log_level: Option<String>,

    /// ClickHouse HTTP URL (overrides config file, enables the journal)
    #[arg(long)]
    clickhouse_url: Option<String>,
}

#[tokio::main]
async fn main() -> ExitCode {
    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {:#}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run() -> Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !matches!(e, dotenvy::Error::Io(ref io_err) if io_err.kind() == std::io::ErrorKind::NotFound) {
            eprintln!("Warning: Failed to load .env file: {}", e);
        }
    }

    let args = Args::parse();

    let config_found = args.config.exists();
    let mut config = if config_found {
        GuardConfig::from_file(&args.config)
            .with_context(|| format!("Failed to load config from {:?}", args.config))?
    } else {
        GuardConfig::default()
    };
    config.apply_env_overrides();
    config.apply_cli_overrides(
        args.api_port,
        args.push_port,
        args.log_level,
        args.clickhouse_url,
    );

    let log_level = match config.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };
    let subscriber = FmtSubscriber::builder().with_max_level(log_level).finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("Failed to set global tracing subscriber")?;

    if !config_found {
        warn!(path = ?args.config, "Config file not found, using defaults");
    }
    info!("Starting guard-server");

    config.validate().context("Configuration validation failed")?;
    if config.admin_key.is_none() {
        warn!("GUARD_ADMIN_KEY not set, admin kill-switch clearing is disabled");
    }

    let collaborators = build_collaborators(&config).await?;
    let guard = Arc::new(TradingGuard::new(config.clone(), collaborators));
    let tasks = guard.start();

    let push_server = Arc::new(PushServer::new(
        PushServerConfig::from_server_config(&config.server),
        Arc::clone(&guard),
    ));
    let push_shutdown = push_server.shutdown_handle();
    let push_handle = {
        let server = Arc::clone(&push_server);
        tokio::spawn(async move { server.run().await })
    };
    let api_handle = spawn_api_server(
        ApiServerConfig::from_server_config(&config.server),
        Arc::clone(&guard),
    );

    info!(
        api_port = config.server.api_port,
        push_port = config.server.push_port,
        "guard-server ready"
    );

    tokio::select! {
        result = wait_for_shutdown() => {
            if let Err(e) = result {
                error!(error = %e, "Error waiting for shutdown signal");
            }
            info!("Shutting down");
        }
        result = api_handle => {
            match result {
                Ok(Ok(())) => warn!("REST API server exited"),
                Ok(Err(e)) => error!(error = %e, "REST API server failed"),
                Err(e) => error!(error = %e, "REST API server task panicked"),
            }
        }
    }

    let _ = push_shutdown.send(());
    match push_handle.await {
        Ok(Err(e)) => error!(error = %e, "Push server failed"),
        Err(e) => error!(error = %e, "Push server task panicked"),
        Ok(Ok(())) => {}
    }
    tasks.shutdown();

    info!("guard-server stopped");
    Ok(())
}

/// HTTP collaborators where a URL is configured, in-process ones otherwise.
async fn build_collaborators(config: &GuardConfig) -> Result<Collaborators> {
    let providers = &config.providers;

    let identity: Arc<dyn IdentityProvider> = match &providers.identity_url {
        Some(url) => Arc::new(HttpIdentityProvider::new(url).context("identity provider")?),
        None => {
            let local = StaticIdentityProvider::new();
            match std::env::var("GUARD_DEV_TOKEN") {
                Ok(token) if !token.is_empty() => {
                    local.insert_token(&token, UserId::new("dev"), ONBOARDING_FINAL_STEP);
                    warn!("No identity_url configured, accepting GUARD_DEV_TOKEN for user 'dev'");
                }
                _ => warn!("No identity_url configured and no GUARD_DEV_TOKEN, every token is rejected"),
            }
            Arc::new(local)
        }
    };

    let vault: Arc<dyn CredentialVault> = match &providers.vault_url {
        Some(url) => Arc::new(HttpCredentialVault::new(url).context("credential vault")?),
        None => {
            warn!("No vault_url configured, credentials are kept in memory");
            Arc::new(MemoryVault::new())
        }
    };

    let mut balances: Vec<Arc<dyn BalanceProvider>> = Vec::with_capacity(Platform::ALL.len());
    for platform in Platform::ALL {
        match providers.balance_url(platform) {
            Some(url) => balances.push(Arc::new(
                HttpBalanceProvider::new(platform, url)
                    .with_context(|| format!("{} balance provider", platform))?,
            )),
            None => {
                warn!(platform = %platform, "No balance URL configured, balances report zero");
                balances.push(Arc::new(FixedBalanceProvider::new(platform)));
            }
        }
    }

    let execution: Arc<dyn ExecutionSink> = match &providers.execution_url {
        Some(url) => Arc::new(HttpExecutionSink::new(url).context("execution sink")?),
        None => {
            warn!("No execution_url configured, mode changes are only logged");
            Arc::new(TracingExecutionSink)
        }
    };

    let journal: Option<Arc<dyn EventJournal>> = if config.clickhouse.enabled {
        let journal = ClickHouseJournal::new(ClickHouseClient::new(config.clickhouse.clone()));
        match journal.prepare().await {
            Ok(()) => info!(url = %config.clickhouse.url, "Event journal ready"),
            // The writer retries, so an unreachable journal does not block startup.
            Err(e) => warn!(error = %e, "ClickHouse not ready, journal writes will retry"),
        }
        Some(Arc::new(journal))
    } else {
        info!("Event journal disabled");
        None
    };

    Ok(Collaborators {
        identity,
        vault,
        balances,
        execution,
        journal,
    })
}

/// Wait for SIGTERM or SIGINT (Ctrl+C on Windows).
async fn wait_for_shutdown() -> Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;

        tokio::select! {
            _ = sigterm.recv() => {
                info!("Received SIGTERM");
            }
            _ = sigint.recv() => {
                info!("Received SIGINT");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C");
    }

    Ok(())
}
