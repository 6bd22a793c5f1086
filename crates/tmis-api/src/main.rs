//! TMIS API Server
//!
//! REST API server for the multi-tenant authentication service.
//!
//! Author: hephaex@gmail.com

use std::sync::Arc;
use tmis_api::{create_router, seed::seed_demo_data, AppState};
use tmis_core::config::LoggingConfig;
use tmis_core::{AppConfig, PgStore, Repositories};
use tokio::signal;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "tmis_api={level},tmis_core={level},audit=info,tower_http=info",
            level = logging.level
        ))
    });

    let registry = tracing_subscriber::registry().with(filter);
    if logging.json_format {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_file(logging.include_location)
                    .with_line_number(logging.include_location),
            )
            .init();
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .with_file(logging.include_location)
                    .with_line_number(logging.include_location),
            )
            .init();
    }
}

async fn shutdown_signal(state: Arc<AppState>) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    state.set_ready(false);
    tracing::info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration; an incomplete signing setup is fatal
    let config = AppConfig::load()?;
    init_tracing(&config.logging);

    // Database
    let store = PgStore::connect(
        &config.database.postgres_url,
        config.database.postgres_pool_size,
    )
    .await?;
    sqlx::migrate!("../../migrations").run(store.pool()).await?;
    tracing::info!("Database migrations applied");

    let repos = Repositories::from_store(Arc::new(store));
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let seed_on_startup = config.seed_on_startup();

    let state = Arc::new(AppState::new(config, repos)?);

    if seed_on_startup {
        let outcome = seed_demo_data(&state.repos, state.auth.hasher().as_ref()).await?;
        tracing::info!(tenant_id = %outcome.tenant_id(), "Seeding complete");
    }

    state.set_ready(true);
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("TMIS API Server starting on http://{}", addr);
    tracing::info!("Swagger UI available at http://{}/swagger-ui/", addr);
    tracing::info!("OpenAPI spec at http://{}/openapi.json", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(state))
        .await?;

    Ok(())
}
