//! Recorder binary: loads settings, wires the pipeline, serves the status API
//! and runs until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use ephemeral_recorder::api::{self, AppState};
use ephemeral_recorder::capture::preflight::FsDiskProbe;
use ephemeral_recorder::capture::transfer::{CaptureTool, HttpTool, ProcessTool, ToolRouter};
use ephemeral_recorder::config::Settings;
use ephemeral_recorder::item::Quality;
use ephemeral_recorder::ledger::DedupLedger;
use ephemeral_recorder::metrics::Metrics;
use ephemeral_recorder::notify::NotifierMux;
use ephemeral_recorder::platform::http::HttpPlatformClient;
use ephemeral_recorder::platform::{PlatformClient, SessionGuard};
use ephemeral_recorder::scheduler::{Pipeline, PipelineParts};
use ephemeral_recorder::sinks::EventSink;
use ephemeral_recorder::stats::DailyStats;
use ephemeral_recorder::target::TargetRegistry;

/// `LOG_FORMAT=json` switches to one JSON object per line.
fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("ephemeral_recorder=info,warn"));
    let json = std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json"));
    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry.with(fmt::layer().json()).init();
    } else {
        registry.with(fmt::layer().compact()).init();
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "installing Ctrl+C handler failed");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "installing SIGTERM handler failed");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env in local/dev; no-op when absent.
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = Settings::load_default().context("loading settings")?;
    let metrics = Metrics::init()?;

    let registry = Arc::new(
        TargetRegistry::load(&settings.monitor.targets_file)
            .await
            .with_context(|| format!("loading targets from {}", settings.monitor.targets_file.display()))?,
    );
    if registry.is_empty() {
        tracing::warn!("target list is empty; nothing will be captured");
    }

    let client: Arc<dyn PlatformClient> =
        Arc::new(HttpPlatformClient::new(settings.platform_config()).context("building platform client")?);
    let guard = Arc::new(SessionGuard::new(
        std::time::Duration::from_secs(settings.platform.cooldown_secs),
        settings.platform.max_failures,
    ));

    let resolved = registry
        .resolve_missing(client.as_ref(), settings.resolve_throttle())
        .await;
    tracing::info!(targets = registry.len(), resolved, "targets loaded");

    let capture_cfg = settings.capture_config();
    let process = ProcessTool::detect(
        Quality::parse(&settings.capture.video_quality),
        settings.capture.broadcast_format.clone(),
    )
    .await;
    let http = HttpTool::new(
        std::time::Duration::from_secs(settings.capture.connect_timeout_secs),
        std::time::Duration::from_secs(settings.capture.read_timeout_secs),
        &settings.platform.user_agent,
    )
    .context("building download client")?;
    let tool: Arc<dyn CaptureTool> = Arc::new(ToolRouter::new(Arc::new(process), Arc::new(http)));

    let ledger = Arc::new(DedupLedger::load(&settings.ledger.path, settings.ledger_horizon()).await);
    let daily = if settings.stats.enabled {
        Some(Arc::new(DailyStats::load(&settings.stats.path).await))
    } else {
        None
    };
    let notifier = Arc::new(NotifierMux::from_settings(&settings.notify));

    let mut sinks: Vec<Arc<dyn EventSink>> = Vec::new();
    if !notifier.is_empty() {
        sinks.push(notifier.clone());
    }
    if let Some(d) = &daily {
        sinks.push(d.clone());
    }

    let shutdown = CancellationToken::new();
    let max_concurrent = capture_cfg.max_concurrent;
    let mut pipeline = Pipeline::start(
        PipelineParts {
            client,
            registry: registry.clone(),
            guard,
            monitor: settings.monitor_config(),
            capture: capture_cfg,
            tool,
            disk: Arc::new(FsDiskProbe),
            ledger: ledger.clone(),
            sinks,
        },
        &shutdown,
    );

    let server = if settings.server.enabled {
        let app = api::router(AppState {
            poller: pipeline.poller.clone(),
            captures: pipeline.captures.clone(),
            ledger,
            daily: daily.clone(),
        })
        .merge(metrics.router());
        let listener = tokio::net::TcpListener::bind(&settings.server.bind)
            .await
            .with_context(|| format!("binding {}", settings.server.bind))?;
        tracing::info!(bind = %settings.server.bind, "status server listening");
        let stop = shutdown.clone();
        Some(tokio::spawn(async move {
            let res = axum::serve(listener, app)
                .with_graceful_shutdown(async move { stop.cancelled().await })
                .await;
            if let Err(e) = res {
                tracing::error!(error = %e, "status server failed");
            }
        }))
    } else {
        None
    };

    notifier.startup(registry.len(), max_concurrent).await;
    pipeline.spawn_poll_loop(settings.check_interval(), daily);

    shutdown_signal().await;
    tracing::info!("shutdown requested");
    shutdown.cancel();

    let captures = pipeline.captures.clone();
    pipeline.shutdown(settings.shutdown_timeout()).await;
    let stats = captures.stats();
    notifier.shutdown(stats.completed, stats.failed).await;

    if let Some(server) = server {
        let _ = server.await;
    }
    tracing::info!(
        completed = stats.completed,
        failed = stats.failed,
        "recorder stopped"
    );
    Ok(())
}
