//! Accounting server binary

use accounting_core::{handlers, AccountingService, Config};
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json = std::env::var("ACCOUNTING_LOG_FORMAT").map_or(false, |format| format == "json");

    if json {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .init();
    }
}

fn load_config() -> anyhow::Result<Config> {
    match std::env::var("ACCOUNTING_CONFIG") {
        Ok(path) => Config::from_file(&path)
            .with_context(|| format!("Failed to load configuration from {}", path)),
        Err(_) => Config::from_env().context("Failed to load configuration from environment"),
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let config = load_config()?;
    tracing::info!(
        "Starting {} {} on {}",
        config.service_name,
        config.service_version,
        config.listen_addr
    );

    let service = Arc::new(AccountingService::open(&config).context("Failed to open accounting service")?);
    service
        .election()
        .heartbeat()
        .await
        .context("Failed to resolve the active processor")?;
    let heartbeat = service.election().clone().spawn_heartbeat();

    let app_service = service.clone();
    HttpServer::new(move || {
        App::new()
            .wrap(middleware::Logger::default())
            .wrap(middleware::NormalizePath::trim())
            .app_data(web::Data::new(app_service.clone()))
            .configure(handlers::configure_routes)
    })
    .bind(&config.listen_addr)
    .with_context(|| format!("Failed to bind {}", config.listen_addr))?
    .run()
    .await?;

    tracing::info!("Shutting down accounting server");
    service.shutdown().await?;
    if let Some(heartbeat) = heartbeat {
        heartbeat.abort();
    }
    Ok(())
}
