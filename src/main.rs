use clap::{Parser, Subcommand};
use claude_relay::config::AppConfig;
use claude_relay::pool::EndpointPool;
use claude_relay::proxy::ProxyEngine;
use claude_relay::server::{self, AppState, ServerError};
use claude_relay::stats::StatsStore;
use claude_relay::pid;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

const EXIT_OK: i32 = 0;
const EXIT_BAD_CONFIG: i32 = 1;
const EXIT_BIND_FAILED: i32 = 2;
const EXIT_SIGINT: i32 = 130;

#[derive(Parser)]
#[command(name = "claude-relay")]
#[command(about = "Claude Messages API reverse proxy with multi-provider failover", long_about = None)]
#[command(version)]
struct Cli {
    /// Path to configuration file (defaults to ~/.claude-relay/config.toml)
    #[arg(short, long)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start the proxy
    Start {
        /// Port to listen on, overriding the config file
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Stop a running proxy
    Stop,
    /// Check whether the proxy is running
    Status,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => match AppConfig::default_path() {
            Ok(path) => path,
            Err(e) => {
                eprintln!("error: {e}");
                std::process::exit(EXIT_BAD_CONFIG);
            }
        },
    };

    let code = match cli.command {
        Commands::Start { port } => start(&config_path, port).await,
        Commands::Stop => stop(),
        Commands::Status => status(),
    };
    std::process::exit(code);
}

fn stats_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude-relay")
        .join("stats.json")
}

async fn start(config_path: &PathBuf, port_override: Option<u16>) -> i32 {
    let mut config = if config_path.exists() {
        match AppConfig::from_file(config_path) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!(path = %config_path.display(), error = %e, "invalid configuration");
                return EXIT_BAD_CONFIG;
            }
        }
    } else {
        tracing::warn!(path = %config_path.display(), "no config file, starting with an empty pool");
        AppConfig::default()
    };

    if let Some(port) = port_override {
        config.server.port = port;
    }

    let stats_path = stats_path();
    let stats = Arc::new(StatsStore::load(&stats_path));
    let pool = Arc::new(EndpointPool::new());
    if let Err(e) = pool.replace(config.upstreams()) {
        tracing::error!(error = %e, "invalid upstream pool");
        return EXIT_BAD_CONFIG;
    }

    let state = Arc::new(AppState {
        engine: ProxyEngine::new(pool, stats.clone()),
    });

    if let Err(e) = pid::write_pid() {
        tracing::warn!(error = %e, "failed to write pid file");
    }

    tracing::info!(
        endpoints = config.endpoints.len(),
        port = config.server.port,
        "starting claude-relay v{}",
        env!("CARGO_PKG_VERSION"),
    );

    let (handle, commands) = server::server_channel();
    let interrupted = Arc::new(AtomicBool::new(false));

    {
        let handle = handle.clone();
        let interrupted = interrupted.clone();
        tokio::spawn(async move {
            if wait_for_shutdown_signal().await {
                interrupted.store(true, Ordering::SeqCst);
            }
            tracing::info!("shutting down");
            handle.shutdown().await;
        });
    }

    let result = server::run(&config.server.host, config.server.port, state, commands).await;

    if let Err(e) = stats.save(&stats_path) {
        tracing::warn!(error = %e, "failed to save statistics on shutdown");
    }
    let _ = pid::cleanup_pid();

    match result {
        Ok(()) if interrupted.load(Ordering::SeqCst) => EXIT_SIGINT,
        Ok(()) => EXIT_OK,
        Err(ServerError::Bind { addr, source }) => {
            tracing::error!(%addr, error = %source, "failed to bind");
            EXIT_BIND_FAILED
        }
        Err(e) => {
            tracing::error!(error = %e, "server error");
            EXIT_OK
        }
    }
}

/// Wait for SIGINT or, on unix, SIGTERM. Returns true for SIGINT.
async fn wait_for_shutdown_signal() -> bool {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut term = match signal(SignalKind::terminate()) {
            Ok(term) => term,
            Err(_) => {
                let _ = tokio::signal::ctrl_c().await;
                return true;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => true,
            _ = term.recv() => false,
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        true
    }
}

fn stop() -> i32 {
    match pid::read_pid() {
        Ok(running_pid) if pid::is_process_running(running_pid) => {
            #[cfg(unix)]
            {
                use nix::sys::signal::{kill, Signal};
                use nix::unistd::Pid;

                if let Err(e) = kill(Pid::from_raw(running_pid as i32), Signal::SIGTERM) {
                    eprintln!("failed to stop: {e}");
                    return EXIT_OK;
                }
            }
            #[cfg(windows)]
            {
                use std::process::Command;
                let _ = Command::new("taskkill")
                    .args(["/PID", &running_pid.to_string(), "/F"])
                    .output();
            }
            println!("stopped (pid {running_pid})");
            let _ = pid::cleanup_pid();
            EXIT_OK
        }
        Ok(_) => {
            println!("not running (stale pid file)");
            let _ = pid::cleanup_pid();
            EXIT_OK
        }
        Err(_) => {
            println!("not running");
            EXIT_OK
        }
    }
}

fn status() -> i32 {
    match pid::read_pid() {
        Ok(running_pid) if pid::is_process_running(running_pid) => {
            println!("running (pid {running_pid})");
            EXIT_OK
        }
        Ok(_) => {
            println!("not running (stale pid file)");
            EXIT_OK
        }
        Err(_) => {
            println!("not running");
            EXIT_OK
        }
    }
}
