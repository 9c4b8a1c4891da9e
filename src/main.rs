// src/main.rs
use anyhow::Result;
use hyper::header::{HeaderValue, CONTENT_TYPE};
use hyper::{Body, Request, Response, Server as HttpServer, StatusCode};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};

use tcp_echo_server::{
    config,
    metrics::MetricsRegistry,
    server::ServerBuilder,
};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("tcp_echo_server=info".parse()?)
                .add_directive("hyper=info".parse()?),
        )
        .init();

    // Load configuration
    let config_path = std::env::args().nth(1);
    match &config_path {
        Some(path) => info!("Loading configuration from: {}", path),
        None => info!("No configuration file given, using defaults"),
    }
    let config = config::load_or_default(config_path.as_deref()).await?;

    let mut builder = ServerBuilder::new(config.server.clone())
        .with_grace_period(config.shutdown.grace_period());

    // Start metrics server if enabled
    if config.metrics.enabled {
        let metrics_registry = MetricsRegistry::new()?;
        builder = builder.with_metrics(metrics_registry.collector());

        let metrics_addr: SocketAddr = ([0, 0, 0, 0], config.metrics.port).into();
        start_metrics_server(metrics_addr, metrics_registry, config.metrics.path.clone()).await?;
    }

    let server = builder.bind().await?;
    let mut signals = ShutdownSignals::install()?;

    let run = server.run();
    tokio::pin!(run);

    let (run_result, signalled) = tokio::select! {
        result = &mut run => (result, None),
        received = signals.recv() => {
            info!("{} received, shutting down", received);
            server.stop_accepting();
            (run.as_mut().await, Some(received))
        }
    };

    // Ctrl-C during cleanup must not start a second cleanup
    let interrupts = tokio::spawn(async {
        while signal::ctrl_c().await.is_ok() {
            warn!("Interrupt ignored while shutting down");
        }
    });
    server.shutdown().await;
    // back to default handling: nothing swallows interrupts from here to exit
    interrupts.abort();
    info!("Shutdown complete");

    if let Err(e) = run_result {
        error!("Server stopped: {}", e);
        return Err(e.into());
    }
    if signalled.is_some() {
        std::process::exit(1);
    }
    Ok(())
}

struct ShutdownSignals {
    #[cfg(unix)]
    terminate: signal::unix::Signal,
}

impl ShutdownSignals {
    fn install() -> Result<Self> {
        Ok(Self {
            #[cfg(unix)]
            terminate: signal::unix::signal(signal::unix::SignalKind::terminate())?,
        })
    }

    /// Wait for SIGTERM or Ctrl-C and name the one that arrived.
    async fn recv(&mut self) -> &'static str {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                error!("Failed to listen for Ctrl-C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = self.terminate.recv();

        #[cfg(not(unix))]
        let terminate = std::future::pending::<Option<()>>();

        tokio::select! {
            _ = ctrl_c => "SIGINT",
            _ = terminate => "SIGTERM",
        }
    }
}

async fn start_metrics_server(
    addr: SocketAddr,
    registry: MetricsRegistry,
    path: String,
) -> Result<()> {
    let registry = Arc::new(registry);
    let metrics_path = Arc::new(path);
    let service_path = metrics_path.clone();

    let make_service = hyper::service::make_service_fn(move |_| {
        let registry = registry.clone();
        let path = service_path.clone();

        async move {
            Ok::<_, Infallible>(hyper::service::service_fn(move |req: Request<Body>| {
                let registry = registry.clone();
                let path = path.clone();

                async move {
                    let response = if req.uri().path() == path.as_str() {
                        let mut response = Response::new(Body::from(registry.gather()));
                        response.headers_mut().insert(
                            CONTENT_TYPE,
                            HeaderValue::from_static("text/plain; version=0.0.4"),
                        );
                        response
                    } else {
                        let mut response = Response::new(Body::from("Not Found"));
                        *response.status_mut() = StatusCode::NOT_FOUND;
                        response
                    };
                    Ok::<_, Infallible>(response)
                }
            }))
        }
    });

    let server = HttpServer::try_bind(&addr)?.serve(make_service);

    info!(
        "Metrics server listening on http://{}{}",
        addr,
        metrics_path.as_str()
    );

    tokio::spawn(async move {
        if let Err(e) = server.await {
            error!("Metrics server error: {}", e);
        }
    });

    Ok(())
}
