use std::sync::Arc;

use anyhow::Context;
use note_tutor::api::{app_router, ApiState};
use note_tutor::config::{AppConfig, Settings};
use note_tutor::db::Db;
use note_tutor::intensity::{SchedulerConfig, SimpleIntervalConfig};
use note_tutor::llm::LlmService;
use note_tutor::orchestrator::{ReviewService, ServiceOptions};
use note_tutor::pregen::{PreGenerator, PregenOptions};
use tokio::net::TcpListener;
use tokio::sync::watch;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let config = AppConfig::from_env()?;
    let settings = Settings::load(&config.settings_path).await?;

    let scheduler = match &settings.scheduler {
        Some(update) => SchedulerConfig::default()
            .updated(update)
            .map_err(|e| anyhow::anyhow!("Invalid scheduler settings: {}", e))?,
        None => SchedulerConfig::default(),
    };
    let cache_ttl = config.question_cache_ttl.unwrap_or_else(|| settings.cache_ttl());

    let db = Db::connect(&config.database_url)
        .await
        .with_context(|| format!("Failed to open database {}", config.database_url))?;
    log::info!("Database ready at {}", config.database_url);

    let llm = Arc::new(LlmService::from_config(config.llm.clone()));
    log::info!(
        "AI provider: {} (timeout {}ms)",
        config.llm.provider.as_str(),
        config.llm.timeout.as_millis()
    );

    let service = Arc::new(ReviewService::new(
        db,
        llm,
        ServiceOptions {
            scheduling_model: config.scheduling_model,
            review_count_policy: config.review_count_policy,
            scheduler,
            simple: if config.rapid_testing {
                SimpleIntervalConfig::rapid_testing()
            } else {
                SimpleIntervalConfig::default()
            },
            cache_ttl,
            queue_capacity: config.queue_capacity,
            settings,
            settings_path: Some(config.settings_path.clone()),
            ..ServiceOptions::default()
        },
    ));
    log::info!("Scheduling model: {:?}", service.scheduling_model());

    let pregen = Arc::new(PreGenerator::new(
        Arc::clone(&service),
        PregenOptions {
            enabled: config.pregenerate_enabled,
            ..PregenOptions::default()
        },
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let auto_pregen = (config.pregenerate_enabled && config.auto_pregenerate)
        .then(|| Arc::clone(&pregen).spawn_auto(config.pregenerate_interval, shutdown_rx));

    let app = app_router(ApiState { service, pregen });
    let listener = TcpListener::bind(&config.bind_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.bind_addr))?;
    log::info!("Listening on http://{}", config.bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                log::error!("Failed to listen for shutdown signal: {}", e);
            }
        })
        .await?;

    log::info!("Shutting down");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = auto_pregen {
        handle.await.ok();
    }

    Ok(())
}
