use axum::{
    extract::FromRef,
    routing::get,
    Router,
};
use std::{net::SocketAddr, sync::Arc};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use realtime_core::{actors, auth, config::Config, db, health, metrics, middleware, models, pipeline, realtime, resume};

#[derive(Clone, FromRef)]
struct AppState {
    db_pool: db::DbPool,
    actor_registry: Arc<actors::ActorRegistry>,
    pipeline_health: Arc<health::PipelineHealth>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let log_level = std::env::var("RUST_LOG").unwrap_or_else(|_| {
        #[cfg(debug_assertions)]
        {
            "debug".to_string()
        }
        #[cfg(not(debug_assertions))]
        {
            "warn".to_string()
        }
    });

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(&log_level))
        .with(tracing_subscriber::fmt::layer().json())
        .init();

    tracing::info!("starting realtime messaging core");

    let config = Config::from_env();

    let metrics_recorder = metrics::MetricsRecorder::new();
    let metrics_handle = metrics_recorder.handle().clone();
    tracing::info!("metrics recorder initialized");

    let db_pool = db::init_db(&config.db).await?;
    tracing::info!("database pool initialized");

    let actor_registry = Arc::new(actors::ActorRegistry::new(db_pool.clone()));
    let resume_store: Arc<dyn resume::ResumeStore> = Arc::new(resume::SharedResumeStore::new(config.ws.resume_ttl));
    let rate_limiter = middleware::rate_limit::RateLimiter::new(
        config.ratelimit.connections_per_min,
        config.ratelimit.messages_per_min,
    );
    let authenticator = Arc::new(auth::Authenticator::new(config.auth.clone())?);

    // Group membership policy is supplied externally; this crate enforces
    // frame-level access only, per the spec's own non-goal on membership
    // policy. Default predicate admits every connection until a deployment
    // substitutes its own.
    let access_policy: realtime::AccessPolicy = Arc::new(|_identity: &models::Identity, _aggregate_id: &str| true);

    let hub = realtime::Hub::new(
        resume_store,
        rate_limiter.clone(),
        actor_registry.as_ref().clone(),
        db_pool.clone(),
        config.ws.clone(),
        access_policy,
    );

    let shutdown = CancellationToken::new();

    let pipeline_health = if config.queue.enabled {
        Arc::new(health::PipelineHealth::new())
    } else {
        Arc::new(health::PipelineHealth::disabled())
    };

    if config.queue.enabled {
        let redis_client = redis::Client::open(config.queue.redis_url.clone())?;
        let redis_conn = redis_client.get_connection_manager().await?;

        let mut dispatcher = pipeline::dispatcher::StreamDispatcher::new(
            db_pool.clone(),
            redis_conn.clone(),
            config.queue.clone(),
            pipeline_health.clone(),
        );
        let dispatcher_shutdown = shutdown.clone();
        tokio::spawn(async move {
            dispatcher.run(dispatcher_shutdown).await;
        });
        tracing::info!("stream dispatcher started");

        let mut consumer = pipeline::consumer::StreamConsumer::new(
            redis_conn,
            db_pool.clone(),
            config.queue.clone(),
            hub.clone(),
            pipeline_health.clone(),
        );
        let consumer_shutdown = shutdown.clone();
        tokio::spawn(async move {
            consumer.run(consumer_shutdown).await;
        });
        tracing::info!("stream consumer started");
    } else {
        tracing::warn!("queue disabled, hub will not receive pipeline deliveries");
    }

    let rate_limiter_cleanup = rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval_timer = tokio::time::interval(std::time::Duration::from_secs(300));
        loop {
            interval_timer.tick().await;
            rate_limiter_cleanup
                .cleanup_old_buckets(std::time::Duration::from_secs(600))
                .await;
        }
    });

    let app_state = AppState {
        db_pool: db_pool.clone(),
        actor_registry: actor_registry.clone(),
        pipeline_health: pipeline_health.clone(),
    };

    let metrics_router = if config.enable_metrics {
        Router::new()
            .route("/metrics", get(metrics::metrics_handler))
            .with_state(metrics_handle)
    } else {
        Router::new()
    };

    let hub_state = realtime::HubState {
        hub: hub.clone(),
        authenticator,
    };

    let health_router = Router::new()
        .route("/healthz", get(health::liveness))
        .route("/readyz", get(health::readiness))
        .route("/health", get(health::health))
        .with_state(app_state.clone());

    let ws_router = Router::new()
        .route("/ws", get(realtime::upgrade))
        .with_state(hub_state);

    let app = health_router
        .merge(ws_router)
        .merge(metrics_router)
        .layer(TraceLayer::new_for_http())
        .layer(axum::middleware::from_fn(middleware::logging::log_headers_middleware))
        .layer(axum::middleware::from_fn(metrics::track_request_metrics));

    let addr = SocketAddr::from((
        config.server.host.parse::<std::net::IpAddr>().unwrap_or([0, 0, 0, 0].into()),
        config.server.port,
    ));
    tracing::info!(%addr, "server listening");

    let listener = tokio::net::TcpListener::bind(addr).await?;

    let serve_shutdown = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = tokio::signal::ctrl_c().await;
            tracing::info!("shutdown signal received, draining pipeline");
            serve_shutdown.cancel();
        })
        .await?;

    // Give the dispatcher/consumer loops one tick to notice cancellation and
    // release any in-flight claims before the pool closes under them.
    tokio::time::sleep(std::time::Duration::from_millis(500)).await;

    // Force-close every live connection so each one persists its resume
    // snapshot through the normal per-connection teardown path, rather than
    // losing pending deliveries when the process exits.
    hub.shutdown_all();
    for _ in 0..100 {
        if hub.connection_count() == 0 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
    }

    actor_registry.shutdown_all().await;
    db_pool.close().await;

    tracing::info!("shutdown complete");
    Ok(())
}
