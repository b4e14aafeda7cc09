use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use dotenvy::dotenv;

use tracing::info;

use tvgate::{AppConfig, GatewayApplicationServer, Logger, services::GatewayServices};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenv().ok();
    let config = Arc::new(AppConfig::parse());

    std::fs::create_dir_all(&config.path_prefix).with_context(|| {
        format!("could not create {}", config.path_prefix.display())
    })?;

    // guards are kept alive to flush logs and maintain the sentry connection
    let _guards = Logger::init(config.cargo_env, &config.log_dir(), config.sentry_dsn.clone());

    info!("logger and env prepped, state lives in {}", config.path_prefix.display());

    let services = GatewayServices::new(config.clone());
    services.start_background_jobs().await;

    info!("background jobs armed, starting gateway...");

    let scheduler = services.scheduler.clone();
    GatewayApplicationServer::serve(services, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("failed to listen for shutdown signal: {}", e);
        }
        info!("shutdown signal received");
    })
    .await
    .context("gateway server failed")?;

    scheduler.stop();
    info!("scheduler stopped, bye");

    Ok(())
}
