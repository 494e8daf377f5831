//! HTTP egress dispatcher - main entry point.
//!
//! One binary, three roles selected by `--mode`:
//! - `coordinator`: REST API + agent control plane + metrics.
//! - `agent`: connects outbound to a coordinator and executes dispatched
//!   requests from its local source IPs.
//! - `monitoring`: deprecated; the terminal UI was replaced by the
//!   Prometheus/Grafana stack.
//!
//! Environment variables (`DISPATCHER_MODE`, `DISPATCHER_COORDINATOR_URL`,
//! `DISPATCHER_AGENT_ID`, `DISPATCHER_LOG_LEVEL`) override CLI defaults.

use std::process::ExitCode;

use anyhow::Result;
use clap::error::ErrorKind as ClapErrorKind;
use clap::{Parser, ValueEnum};
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use dispatcher_agent::{AgentSession, SessionConfig};
use http_dispatcher::config::{parse_listeners, CoordinatorConfig};
use http_dispatcher::server::{serve, AppState};

/// Distributed HTTP egress dispatcher
#[derive(Parser, Debug)]
#[command(name = "http-dispatcher", version, about, long_about = None)]
struct Cli {
    /// Role to run this process as
    #[arg(long, value_enum, default_value = "coordinator", env = "DISPATCHER_MODE")]
    mode: Mode,

    /// Coordinator: address for the primary listener
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Coordinator: port for the primary listener
    #[arg(long, default_value_t = 8000)]
    port: u16,

    /// Coordinator: additional listeners as HOST:PORT (repeatable)
    #[arg(long = "bind", value_name = "HOST:PORT")]
    bind: Vec<String>,

    /// Agent: coordinator base URL
    #[arg(
        long,
        default_value = "http://localhost:8000",
        env = "DISPATCHER_COORDINATOR_URL"
    )]
    coordinator_url: String,

    /// Agent: stable identity (auto-generated when omitted)
    #[arg(long, env = "DISPATCHER_AGENT_ID")]
    agent_id: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "DISPATCHER_LOG_LEVEL")]
    log_level: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum Mode {
    Coordinator,
    Agent,
    Monitoring,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let code = match e.kind() {
                // Help and version are normal exits.
                ClapErrorKind::DisplayHelp | ClapErrorKind::DisplayVersion => 0,
                _ => 1,
            };
            let _ = e.print();
            return ExitCode::from(code);
        }
    };

    init_logging(&cli.log_level);

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    match cli.mode {
        Mode::Coordinator => run_coordinator(cli).await,
        Mode::Agent => run_agent(cli).await,
        Mode::Monitoring => {
            warn!(
                "monitoring mode is deprecated; scrape /metrics with the \
                 Prometheus/Grafana stack instead"
            );
            Ok(())
        }
    }
}

async fn run_coordinator(cli: Cli) -> Result<()> {
    let config = CoordinatorConfig {
        listeners: parse_listeners(&cli.host, cli.port, &cli.bind)?,
        ..CoordinatorConfig::default()
    };
    let state = AppState::build(config);
    info!("starting coordinator");

    let shutdown_state = state.clone();
    tokio::select! {
        result = serve(state) => result,
        _ = shutdown_signal() => {
            info!("shutdown signal received, draining agents");
            shutdown_state.registry.drain_all().await;
            Ok(())
        }
    }
}

async fn run_agent(cli: Cli) -> Result<()> {
    let agent_id = cli.agent_id.unwrap_or_else(|| {
        let hostname = gethostname::gethostname().to_string_lossy().into_owned();
        format!("agent-{}-{}", hostname, chrono::Utc::now().timestamp())
    });
    info!(agent_id = %agent_id, coordinator = %cli.coordinator_url, "starting agent");

    let session = AgentSession::new(SessionConfig::new(cli.coordinator_url, agent_id));
    tokio::select! {
        result = session.run() => result.map_err(Into::into),
        _ = shutdown_signal() => {
            info!("shutdown signal received");
            Ok(())
        }
    }
}

/// Base filter suppresses noisy transport crates; `--log-level` sets the
/// default and `RUST_LOG` layers on top.
fn init_logging(level: &str) {
    let base = "hyper=warn,hyper_util=warn,reqwest=warn,h2=warn,tungstenite=warn,\
                tokio_tungstenite=warn";
    let directives = format!("{base},{}", level.to_lowercase());
    let filter = match std::env::var("RUST_LOG") {
        Ok(env) => EnvFilter::new(format!("{directives},{env}")),
        Err(_) => EnvFilter::new(directives),
    };
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .init();
}

/// Wait for SIGTERM or Ctrl-C.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("received Ctrl-C"),
        _ = terminate => info!("received SIGTERM"),
    }
}
