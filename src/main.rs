#![forbid(unsafe_code)]

//! `stdio-bridge`: HTTP/SSE front end for a stdio JSON-RPC child process.
//!
//! Loads configuration, spawns the child, and serves `POST /message` and
//! `GET /events` until a shutdown signal arrives or the child exits.

use std::net::IpAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, ValueEnum};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, EnvFilter};

use stdio_bridge::bridge::server::{serve, Bridge};
use stdio_bridge::child::spawner::{drain_stderr, spawn_child, ChildProcess};
use stdio_bridge::child::supervisor::{spawn_supervisor, ChildExit};
use stdio_bridge::{AppError, BridgeConfig, Result};

#[derive(Debug, Copy, Clone, Eq, PartialEq, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Debug, Parser)]
#[command(
    name = "stdio-bridge",
    about = "Expose a stdio JSON-RPC process over HTTP and SSE",
    version,
    long_about = None
)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Log output format (text or json).
    #[arg(long, value_enum, default_value_t = LogFormat::Text)]
    log_format: LogFormat,

    /// Override the listen address.
    #[arg(long)]
    host: Option<IpAddr>,

    /// Override the listen port.
    #[arg(long)]
    port: Option<u16>,

    /// Override the response timeout in milliseconds.
    #[arg(long)]
    timeout_ms: Option<u64>,

    /// Child command and arguments, replacing `[child]` from the config.
    #[arg(last = true)]
    command: Vec<String>,
}

fn main() -> Result<()> {
    let args = Cli::parse();
    init_tracing(args.log_format)?;
    info!("stdio-bridge bootstrap");

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .map_err(|err| AppError::Config(format!("failed to build tokio runtime: {err}")))?
        .block_on(run(args))
}

/// What ended the serving phase.
enum Trigger {
    Signal,
    Child(std::result::Result<ChildExit, tokio::task::JoinError>),
    Server(std::result::Result<Result<()>, tokio::task::JoinError>),
}

async fn run(args: Cli) -> Result<()> {
    let config = Arc::new(load_config(args)?);
    info!(
        bind = %config.bind_addr(),
        timeout_ms = config.timeout_ms,
        command = %config.child.command,
        "configuration loaded"
    );

    // Bind before spawning so a port conflict never leaves a child behind.
    let listener = TcpListener::bind(config.bind_addr())
        .await
        .map_err(|err| AppError::Server(format!("failed to bind {}: {err}", config.bind_addr())))?;

    let ct = CancellationToken::new();

    let ChildProcess {
        child,
        stdin,
        stdout,
        stderr,
    } = spawn_child(&config.child)?;
    let stderr_task = drain_stderr(stderr, ct.clone());
    let (bridge, tasks) = Bridge::start(Arc::clone(&config), stdin, stdout, &ct);
    let mut supervisor = spawn_supervisor(child, ct.clone(), config.shutdown_grace());
    let mut server = tokio::spawn(serve(bridge, listener, ct.clone()));

    info!("bridge ready");

    let trigger = tokio::select! {
        () = shutdown_signal() => Trigger::Signal,
        exit = &mut supervisor => Trigger::Child(exit),
        served = &mut server => Trigger::Server(served),
    };

    ct.cancel();
    let grace = config.shutdown_grace();

    // Await whichever of the two long-lived tasks did not end the run.
    let (child_exit, served) = match trigger {
        Trigger::Signal => {
            info!("shutdown signal received");
            (
                supervisor.await,
                finish_within(grace, server, "http server").await,
            )
        }
        Trigger::Child(exit) => (exit, finish_within(grace, server, "http server").await),
        Trigger::Server(served) => (supervisor.await, Some(served)),
    };

    finish_within(grace, tasks.router, "response router").await;
    finish_within(grace, tasks.writer, "child writer").await;
    finish_within(grace, stderr_task, "stderr forwarder").await;

    if let Some(Ok(Err(err))) = served {
        error!(%err, "http server failed");
        return Err(err);
    }

    match child_exit {
        Ok(ChildExit::Stopped) => {
            info!("stdio-bridge shut down");
            Ok(())
        }
        Ok(ChildExit::Unexpected { reason, .. }) => {
            error!(%reason, "child process exited; bridge stopped");
            Err(AppError::ChildUnavailable(reason))
        }
        Err(err) => Err(AppError::ChildUnavailable(format!(
            "child supervisor failed: {err}"
        ))),
    }
}

/// Await `handle` for at most `grace`, aborting it afterwards.
async fn finish_within<T>(
    grace: std::time::Duration,
    handle: JoinHandle<T>,
    name: &'static str,
) -> Option<std::result::Result<T, tokio::task::JoinError>> {
    let abort = handle.abort_handle();
    if let Ok(joined) = tokio::time::timeout(grace, handle).await {
        Some(joined)
    } else {
        warn!(task = name, ?grace, "task did not stop within grace period, aborting");
        abort.abort();
        None
    }
}

fn load_config(args: Cli) -> Result<BridgeConfig> {
    let mut config = match args.config {
        Some(ref path) => BridgeConfig::load_from_path(path)?,
        None => BridgeConfig::default(),
    };

    if let Some(host) = args.host {
        config.host = host;
    }
    if let Some(port) = args.port {
        config.port = port;
    }
    if let Some(timeout_ms) = args.timeout_ms {
        config.timeout_ms = timeout_ms;
    }

    let mut command = args.command.into_iter();
    if let Some(program) = command.next() {
        config.child.command = program;
        config.child.args = command.collect();
    }

    config.validate()?;
    Ok(config)
}

async fn shutdown_signal() {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                tokio::select! {
                    _ = ctrl_c => {}
                    _ = sigterm.recv() => {}
                }
            }
            Err(err) => {
                warn!(%err, "failed to register SIGTERM handler, using ctrl-c only");
                let _ = ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    {
        if let Err(err) = ctrl_c.await {
            error!(%err, "ctrl-c signal handler failed");
        }
    }
}

fn init_tracing(log_format: LogFormat) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| AppError::Config(format!("failed to init tracing: {err}")))?,
    }

    Ok(())
}
