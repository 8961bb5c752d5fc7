use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tower_http::cors::CorsLayer;
use tower_http::trace::{MakeSpan, TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use uuid::Uuid;

use gp_remote::config::{FileConfig, load_config, parse_listen_addr};
use gp_remote::{AppState, create_router};
use vpn_supervisor::Supervisor;

/// In-flight requests get this long to finish once a shutdown signal arrives
const DRAIN_TIMEOUT: Duration = Duration::from_secs(5);

/// Custom span maker that adds a unique request ID to each incoming request
#[derive(Clone)]
struct RequestIdMakeSpan;

impl<B> MakeSpan<B> for RequestIdMakeSpan {
    fn make_span(&mut self, request: &axum::http::Request<B>) -> tracing::Span {
        let request_id = Uuid::new_v4().to_string();
        tracing::info_span!(
            "request",
            method = %request.method(),
            uri = %request.uri(),
            request_id = %request_id,
        )
    }
}

#[derive(Parser)]
#[command(name = "gp-remote")]
#[command(about = "HTTP-controlled supervisor for a GlobalProtect openconnect client")]
struct Args {
    /// TOML config file (values there are overridden by GP_SAML_CLIENT_REMOTE_* env vars)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Address to listen on, e.g. ":8080" or "127.0.0.1:8080"
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable debug logging (includes every client output line)
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Setup logging
    let default_directive = if args.debug {
        "gp_remote=debug,vpn_supervisor=debug,tower_http=debug,info"
    } else {
        "gp_remote=info,vpn_supervisor=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();

    let config: FileConfig = load_config(args.config.as_deref())
        .extract()
        .context("Failed to load configuration")?;
    let listen = args.listen.as_deref().unwrap_or(config.listen());
    let addr = parse_listen_addr(listen)?;

    let command = config.client.to_command();
    info!(
        "Supervising {} {:?}",
        command.program.display(),
        command.leading_args
    );
    let supervisor = Arc::new(Supervisor::new(command));

    let app = create_router(AppState {
        supervisor: supervisor.clone(),
    })
    .layer(TraceLayer::new_for_http().make_span_with(RequestIdMakeSpan))
    .layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    let actual_addr = listener.local_addr()?;

    info!("gp-remote listening on http://{}", actual_addr);
    info!("API endpoints:");
    info!("  GET    /status      - Current connection status");
    info!("  POST   /connect     - Start the VPN client");
    info!("  POST   /disconnect  - Stop the VPN client");
    info!("  GET    /health      - Liveness check");

    let (signalled_tx, signalled_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        info!("Received shutdown signal, draining requests...");
        let _ = signalled_tx.send(());
    });
    let server = server.into_future();
    tokio::pin!(server);

    // A connect waiting on its client can hold a request open indefinitely,
    // so the drain is bounded once the signal has fired
    let drained = tokio::select! {
        result = &mut server => Some(result),
        _ = async {
            if signalled_rx.await.is_ok() {
                tokio::time::sleep(DRAIN_TIMEOUT).await;
            } else {
                std::future::pending::<()>().await;
            }
        } => None,
    };

    let server_result = match drained {
        Some(result) => result.context("Server error"),
        None => {
            warn!("Requests still in flight after {:?}", DRAIN_TIMEOUT);
            Err(anyhow::anyhow!("Server forced to shutdown"))
        }
    };

    info!("Stopping VPN client...");
    let grace = supervisor
        .command()
        .terminate_grace
        .map_or(DRAIN_TIMEOUT, |grace| grace + DRAIN_TIMEOUT);
    if tokio::time::timeout(grace, supervisor.shutdown())
        .await
        .is_err()
    {
        warn!("VPN client did not stop within {:?}", grace);
    }

    info!("Shutdown complete");
    server_result
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
