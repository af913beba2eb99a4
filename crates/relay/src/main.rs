mod api;
mod auth;
mod config;
mod cors;
mod db;
mod error;
mod identity;
mod ledger;
mod metrics;
mod room;
mod ws;

use anyhow::Context;
use axum::{
    body::Body,
    extract::{DefaultBodyLimit, State},
    http::{header::CONTENT_TYPE, Request, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::{sync::Arc, time::Instant};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

use crate::{
    auth::{jwt::JwtTokenVerifier, middleware::BearerAuth},
    config::{LogFormat, RelayConfig},
    db::pool::{check_pool_health, create_pg_pool, PoolConfig},
    error::{attach_request_id_header, request_id_from_headers_or_generate, with_request_id_scope},
    identity::UserDirectory,
    ledger::AccessLedger,
    metrics::{RelayMetrics, RoomGauges},
    room::RoomRegistry,
    ws::CollabState,
};

const MAX_REQUEST_BODY_BYTES: usize = 64 * 1024;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env();
    init_tracing(&config)?;

    if config.is_dev_jwt_secret() {
        warn!("COLLAB_RELAY_JWT_SECRET is unset; using the development-only secret");
    }

    let ttl_seconds = config.token_ttl_seconds().with_context(|| {
        format!("COLLAB_RELAY_TOKEN_TTL_MINUTES={} is too large", config.token_ttl_minutes)
    })?;
    let verifier = Arc::new(
        JwtTokenVerifier::with_ttl(&config.jwt_secret, ttl_seconds)
            .context("invalid relay JWT configuration")?,
    );
    let (directory, ledger) = build_stores(&config).await?;

    let relay_metrics = Arc::new(RelayMetrics::default());
    metrics::set_global_metrics(Arc::clone(&relay_metrics));

    let state = CollabState {
        verifier,
        directory,
        ledger,
        registry: RoomRegistry::default(),
        outbound_queue_capacity: config.outbound_queue_capacity,
        max_message_bytes: config.max_message_bytes,
    };
    let app = build_router(state, relay_metrics, config.cors_origins.as_deref());

    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(listen_addr = %config.listen_addr, "starting collaboration relay");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("relay server exited unexpectedly")
}

fn init_tracing(config: &RelayConfig) -> anyhow::Result<()> {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_filter)
        .with_context(|| format!("invalid log filter `{}`", config.log_filter))?;
    let builder = tracing_subscriber::fmt().with_env_filter(filter);

    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
    Ok(())
}

async fn build_stores(config: &RelayConfig) -> anyhow::Result<(UserDirectory, AccessLedger)> {
    let Some(database_url) = config.database_url.as_deref() else {
        warn!("COLLAB_RELAY_DATABASE_URL is unset; using in-memory stores with no accounts");
        return Ok((UserDirectory::memory(), AccessLedger::memory()));
    };

    let pool = create_pg_pool(database_url, PoolConfig::from_env())
        .await
        .context("failed to initialize relay PostgreSQL pool")?;
    check_pool_health(&pool).await.context("relay PostgreSQL health check failed")?;

    if config.run_migrations {
        db::migrations::run_migrations(&pool).await?;
        info!("applied relay migrations");
    }

    Ok((UserDirectory::Postgres(pool.clone()), AccessLedger::Postgres(pool)))
}

fn build_router(state: CollabState, metrics: Arc<RelayMetrics>, cors_origins: Option<&str>) -> Router {
    let auth = BearerAuth { verifier: Arc::clone(&state.verifier), directory: state.directory.clone() };
    let metrics_router = Router::new()
        .route("/metrics", get(render_metrics))
        .with_state((metrics, state.registry.clone()));

    apply_middleware(
        Router::new()
            .route("/healthz", get(healthz))
            .merge(metrics_router)
            .merge(api::router(auth, state.ledger.clone(), state.registry.clone()))
            .merge(ws::router(state)),
        cors_origins,
    )
}

fn apply_middleware(router: Router, cors_origins: Option<&str>) -> Router {
    router
        .layer(DefaultBodyLimit::max(MAX_REQUEST_BODY_BYTES))
        .layer(cors::cors_layer(cors_origins))
        .layer(middleware::from_fn(request_context_middleware))
        .layer(middleware::from_fn(panic_handler))
}

async fn healthz() -> (StatusCode, &'static str) {
    (StatusCode::OK, "ok")
}

async fn render_metrics(
    State((metrics, registry)): State<(Arc<RelayMetrics>, RoomRegistry)>,
) -> impl IntoResponse {
    let gauges = RoomGauges {
        active_rooms: registry.room_count().await,
        active_connections: registry.connection_count().await,
    };
    ([(CONTENT_TYPE, "text/plain; version=0.0.4")], metrics.render_prometheus(gauges))
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(error) = tokio::signal::ctrl_c().await {
            error!(error = %error, "failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(error) => {
                error!(error = %error, "failed to install SIGTERM handler");
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

    info!("shutdown signal received");
}

async fn panic_handler(request: Request<Body>, next: Next) -> Response {
    match tokio::spawn(async move { next.run(request).await }).await {
        Ok(response) => response,
        Err(join_error) => {
            error!(?join_error, "request handling panicked");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn request_context_middleware(request: Request<Body>, next: Next) -> Response {
    let request_id = request_id_from_headers_or_generate(request.headers());
    let method = request.method().clone();
    let path = request.uri().path().to_owned();
    let started_at = Instant::now();

    let mut response = with_request_id_scope(request_id.clone(), next.run(request)).await;

    attach_request_id_header(&mut response, &request_id);

    let latency_ms = started_at.elapsed().as_millis() as u64;
    let status = response.status().as_u16();
    metrics::record_http_request(method.as_str(), &path, status, latency_ms);
    info!(
        request_id = %request_id,
        method = %method,
        path = %path,
        status,
        latency_ms,
        "request completed"
    );

    response
}
