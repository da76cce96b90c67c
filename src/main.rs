use std::net::SocketAddr;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use plc_servient::api;
use plc_servient::config::ServientConfig;
use plc_servient::ServientContext;

#[derive(Debug, Parser)]
#[command(name = "plc-servient", version, about = "Modbus TCP PLC servient")]
struct Args {
    /// Configuration file (YAML)
    #[arg(short, long, env = "PLC_CONFIG")]
    config: Option<PathBuf>,

    /// Bind address override, host:port
    #[arg(short, long)]
    bind: Option<String>,

    /// Log filter, e.g. `info` or `plc_servient=debug`
    #[arg(long, default_value = "info", env = "PLC_LOG")]
    log_level: String,

    /// Validate the configuration and device description, then exit
    #[arg(long)]
    validate: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_new(&args.log_level).unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config = ServientConfig::load(args.config.as_deref()).context("loading configuration")?;
    if args.validate {
        info!("configuration valid");
        return Ok(());
    }

    let bind = args
        .bind
        .clone()
        .unwrap_or_else(|| format!("{}:{}", config.api.host, config.api.port));
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid bind address '{bind}'"))?;

    let shutdown = CancellationToken::new();
    let (context, relay_task) = ServientContext::initialize(config, shutdown.clone())?;

    let app = api::router(context.clone());
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding {addr}"))?;
    info!(%addr, device = %context.config.device.name, "http server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(shutdown.clone()))
        .await
        .context("http server")?;

    // The server has drained; stop the samplers and the relay consumer.
    context.monitor.shutdown().await;
    shutdown.cancel();
    let _ = relay_task.await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("shutdown signal received");
    shutdown.cancel();
}
