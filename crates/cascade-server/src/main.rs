use anyhow::{Context, Result};
use cascade_server::config::Config;
use cascade_server::{create_app, turn};
use clap::{Args, Parser, Subcommand};
use std::time::Duration;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::mpsc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser)]
#[command(name = "cascade", about = "Clustered selective forwarding unit")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Start a cascade server node
    Server(ServerArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// HTTP listen address
    #[arg(short = 'a', long, default_value = ":7000")]
    addr: String,

    /// TLS certificate (advertises wss; termination happens in front of
    /// the node)
    #[arg(long, default_value = "")]
    cert: String,

    /// TLS private key
    #[arg(long, default_value = "")]
    key: String,

    /// Config file path
    #[arg(short, long)]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cascade_server=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Server(args) => server_main(args).await,
    }
}

fn listen_addr(addr: &str) -> String {
    match addr.strip_prefix(':') {
        Some(port) => format!("0.0.0.0:{port}"),
        None => addr.to_owned(),
    }
}

async fn server_main(args: ServerArgs) -> Result<()> {
    tracing::info!("--- starting sfu node ---");

    let mut conf = Config::load(args.config.as_deref())?;
    conf.signal.http_addr = args.addr;
    if !args.cert.is_empty() {
        conf.signal.cert = args.cert;
    }
    if !args.key.is_empty() {
        conf.signal.key = args.key;
    }

    let ballast = vec![0u8; conf.sfu.ballast * 1024 * 1024];

    let turn_conf = conf.sfu.turn.clone();
    let (router, server) = create_app(conf.clone())
        .await
        .context("initialising node")?;

    let addr = listen_addr(&conf.signal.http_addr);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("binding signal server on {addr}"))?;
    tracing::info!(%addr, endpoint = %conf.endpoint(), "signal server listening");

    let (err_tx, mut err_rx) = mpsc::channel::<anyhow::Error>(1);
    tokio::spawn(async move {
        if let Err(err) = axum::serve(listener, router).await {
            let _ = err_tx.send(err.into()).await;
        }
    });

    let _turn_server = if turn_conf.enabled {
        Some(turn::start(&turn_conf).await?)
    } else {
        None
    };

    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sigterm = signal(SignalKind::terminate())?;

    // Wait for the first stop signal or an internal error.
    tokio::select! {
        Some(err) = err_rx.recv() => {
            tracing::error!("signal server error: {err}");
            return Err(err);
        }
        _ = sigint.recv() => {}
        _ = sigterm.recv() => {}
    }

    tracing::info!("got signal, beginning shutdown");
    server.set_draining(true);

    // Drain: poll active clients until zero; a second signal forces exit.
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let active = server.metrics().active_clients();
                if active == 0 {
                    tracing::info!("server idle, shutting down");
                    break;
                }
                tracing::info!(active, "shutdown waiting on clients");
            }
            _ = sigint.recv() => {
                tracing::info!("got second signal: forcing shutdown");
                break;
            }
            _ = sigterm.recv() => {
                tracing::info!("got second signal: forcing shutdown");
                break;
            }
        }
    }

    drop(ballast);
    Ok(())
}
