//! Play-by-mail backend entrypoint wiring the record store, the pipeline workers and the REST layer.

use std::{net::SocketAddr, sync::Arc};

use anyhow::Context;
use axum::Router;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use playbymail_back::{
    config::{AppConfig, TransportConfig},
    dao::{database::DbHandle, models::DeliveryChannel},
    routes,
    services::worker,
    sheets::{
        ocr::{EmbeddedTextOcr, OcrEngine},
        registry::ProcessorRegistry,
    },
    state::{AppState, SharedState},
    transport::{
        Transport, TransportSet, recording::RecordingTransport, spool::LocalSpoolTransport,
    },
};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = AppConfig::load();
    if let Some(parent) = config.database_path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let db = DbHandle::open(&config.database_path).context("opening record store")?;
    let registry = ProcessorRegistry::with_defaults(ocr_engine(&config));
    let transports = transport_set(&config);
    let app_state = AppState::new(db, registry, transports, config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let workers: Vec<_> = (0..app_state.config().worker_count.max(1))
        .map(|id| tokio::spawn(worker::run(app_state.clone(), id, shutdown_rx.clone())))
        .collect();

    let app = build_router(app_state.clone());
    let addr = SocketAddr::from(([0, 0, 0, 0], app_state.config().port));
    info!(%addr, "starting server");

    let listener = TcpListener::bind(addr).await.context("binding server")?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("serving axum")?;

    info!("stopping queue workers");
    shutdown_tx.send_replace(true);
    for handle in workers {
        if let Err(err) = handle.await {
            warn!(error = %err, "queue worker ended abnormally");
        }
    }
    Ok(())
}

/// OCR backend selected by the configured model.
fn ocr_engine(config: &AppConfig) -> Arc<dyn OcrEngine> {
    if config.uses_embedded_ocr() {
        return Arc::new(EmbeddedTextOcr);
    }
    #[cfg(feature = "http-services")]
    {
        if let Some(endpoint) = config.ocr_endpoint.as_deref() {
            return Arc::new(playbymail_back::sheets::ocr::HttpOcr::new(
                endpoint,
                &config.ocr_model,
                config.job_deadline(),
            ));
        }
    }
    warn!(model = %config.ocr_model, "no HTTP OCR backend available; using embedded text OCR");
    Arc::new(EmbeddedTextOcr)
}

/// Transports for every delivery channel.
fn transport_set(config: &AppConfig) -> TransportSet {
    let mut transports = TransportSet::default();
    for (channel, settings) in [
        (DeliveryChannel::Email, &config.email),
        (DeliveryChannel::PhysicalPost, &config.physical_post),
    ] {
        let transport: Arc<dyn Transport> = match settings {
            TransportConfig::Fake => {
                info!(%channel, "using the recording transport");
                Arc::new(RecordingTransport::new(channel))
            }
            #[cfg(feature = "http-services")]
            TransportConfig::Http { endpoint, api_key } => {
                info!(%channel, %endpoint, "using the HTTP transport");
                Arc::new(playbymail_back::transport::http::HttpTransport::new(
                    channel,
                    endpoint,
                    api_key.as_deref(),
                ))
            }
            #[cfg(not(feature = "http-services"))]
            TransportConfig::Http { endpoint, .. } => {
                warn!(%channel, %endpoint, "built without http-services; using the recording transport");
                Arc::new(RecordingTransport::new(channel))
            }
        };
        transports.insert(transport);
    }
    transports.insert(Arc::new(LocalSpoolTransport::new(config.spool_dir.clone())));
    transports
}

/// Build the top-level router and attach cross-cutting middleware layers.
fn build_router(state: SharedState) -> Router<()> {
    routes::router(state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

/// Configure tracing subscribers so logs include spans by default.
fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info,tower_http=debug".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Wait for Ctrl+C or SIGTERM and shut the server down gracefully.
async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term = signal(SignalKind::terminate()).expect("install SIGTERM handler");
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {},
            _ = term.recv() => {},
        }
    }

    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}
