//! services/api/src/bin/api.rs

use api_lib::{
    adapters::{DbAdapter, OpenAiGenerator, PgTaskQueue, QueueWorker},
    config::Config,
    error::ApiError,
    web::{api_router, ApiDoc, AppState},
};
use axum::http::{
    header::{ACCEPT, CONTENT_TYPE},
    HeaderName, Method,
};
use axum::Router;
use course_engine_core::{
    in_memory::{InMemoryCourseRepository, InMemoryUsageStore},
    CourseEngine, CourseRepository, EnginePorts, TaskQueue, UsageStore,
};
use sqlx::postgres::PgPoolOptions;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tower_http::cors::{Any, CorsLayer};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[tokio::main]
async fn main() -> Result<(), ApiError> {
    // --- 1. Load Configuration & Set Up Logging ---
    let config = Arc::new(Config::from_env()?);
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(config.log_level.to_string()))
        .with(tracing_subscriber::fmt::layer())
        .init();
    info!("Configuration loaded. Starting server...");

    // --- 2. Connect to Database & Run Migrations (or fall back to memory) ---
    let repo: Arc<dyn CourseRepository>;
    let usage: Arc<dyn UsageStore>;
    let pool = match &config.database_url {
        Some(database_url) => {
            info!("Connecting to database...");
            let db_pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(database_url)
                .await?;
            let db_adapter = Arc::new(DbAdapter::new(db_pool.clone()));
            info!("Running database migrations...");
            db_adapter.run_migrations().await?;
            info!("Database migrations complete.");
            repo = db_adapter.clone();
            usage = db_adapter;
            Some(db_pool)
        }
        None => {
            warn!("DATABASE_URL not set; courses and usage are kept in memory only.");
            repo = Arc::new(InMemoryCourseRepository::new());
            usage = Arc::new(InMemoryUsageStore::new());
            None
        }
    };

    let queue: Option<Arc<dyn TaskQueue>> = match (&pool, config.durable_queue_enabled) {
        (Some(db_pool), true) => Some(Arc::new(PgTaskQueue::new(db_pool.clone()))),
        _ => None,
    };

    // --- 3. Initialize the Generator ---
    let generator = Arc::new(OpenAiGenerator::from_key(
        &config.openai_api_key,
        config.openai_base_url.as_deref(),
        config.generation_model.clone(),
    ));

    // --- 4. Build the Engine ---
    let engine = Arc::new(CourseEngine::new(
        EnginePorts {
            repo,
            generator,
            usage,
            queue: queue.clone(),
        },
        config.engine_config(),
    ));

    // --- 5. Start Background Workers ---
    let shutdown = CancellationToken::new();
    let sweeper = engine
        .cache()
        .spawn_sweeper(config.sweep_interval, shutdown.clone());

    let worker = match (pool, queue.is_some()) {
        (Some(db_pool), true) => {
            let worker = QueueWorker::new(
                db_pool,
                engine.work_runner(),
                config.queue_poll_interval,
                config.queue_max_attempts,
            );
            Some(tokio::spawn(worker.run(shutdown.clone())))
        }
        _ => {
            info!("Durable queue disabled; background generation runs detached.");
            None
        }
    };

    // --- 6. Create the Web Router ---
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::DELETE, Method::OPTIONS])
        .allow_headers([
            CONTENT_TYPE,
            ACCEPT,
            HeaderName::from_static("x-user-id"),
            HeaderName::from_static("x-user-tier"),
        ]);

    let app_state = Arc::new(AppState::new(engine));
    let app = Router::new()
        .merge(api_router(app_state).layer(cors))
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()));

    // --- 7. Start the Server ---
    info!("Starting server on {}", config.bind_address);
    info!(
        "Swagger UI available at http://{}/swagger-ui",
        config.bind_address
    );
    let listener = tokio::net::TcpListener::bind(&config.bind_address).await?;
    let stop = shutdown.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "Failed to listen for shutdown signal");
            }
            info!("Shutdown signal received.");
            stop.cancel();
        })
        .await?;

    // --- 8. Drain Background Workers ---
    shutdown.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "Cache sweeper ended abnormally");
    }
    if let Some(handle) = worker {
        if let Err(e) = handle.await {
            warn!(error = %e, "Queue worker ended abnormally");
        }
    }
    info!("Server stopped.");
    Ok(())
}
