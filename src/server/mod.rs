pub mod api;
pub mod dtos;
pub mod error;
pub mod extractors;
pub mod services;
pub mod utils;

use std::future::Future;
use std::net::SocketAddr;
use std::time::Instant;

use anyhow::Context;
use axum::{Extension, Router, ServiceExt, extract::Request, http::HeaderValue, routing::get};
use once_cell::sync::Lazy;
use tower::{Layer, ServiceBuilder};
use tower_http::{
    cors::{Any, CorsLayer},
    normalize_path::NormalizePathLayer,
    trace::TraceLayer,
};
use tracing::{info, warn};

use crate::server::{
    api::{
        channels_controller::ChannelsController, health_controller::health_endpoint,
        playback_controller::PlaybackController, render_controller::RenderController,
    },
    services::gateway_services::GatewayServices,
};

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub fn get_uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub struct GatewayApplicationServer;

impl GatewayApplicationServer {
    /// every route with the shared layers, without binding anything
    pub fn router(services: GatewayServices) -> Router {
        Lazy::force(&START_TIME);
        let cors = Self::cors_layer(&services.config.cors_origin);

        Router::new()
            .merge(RenderController::app())
            .merge(PlaybackController::app())
            .merge(ChannelsController::app())
            .route("/health", get(health_endpoint))
            .layer(
                ServiceBuilder::new()
                    .layer(TraceLayer::new_for_http())
                    .layer(cors)
                    .layer(Extension(services)),
            )
    }

    pub async fn serve(
        services: GatewayServices,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> anyhow::Result<()> {
        let port = services.config.port;
        let router = Self::router(services);
        let app = NormalizePathLayer::trim_trailing_slash().layer(router);

        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {}", addr))?;

        info!("gateway listening on {}", addr);
        axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
            .with_graceful_shutdown(shutdown)
            .await
            .context("error while running the gateway")?;

        Ok(())
    }

    /// "*" allows everything, otherwise a comma seperated list of origins
    fn cors_layer(cors_origin: &str) -> CorsLayer {
        let base = CorsLayer::new().allow_methods(Any).allow_headers(Any);
        if cors_origin.trim() == "*" {
            return base.allow_origin(Any);
        }

        let origins: Vec<HeaderValue> = cors_origin
            .split(',')
            .map(str::trim)
            .filter(|o| !o.is_empty())
            .filter_map(|o| match o.parse::<HeaderValue>() {
                Ok(value) => Some(value),
                Err(_) => {
                    warn!("ignoring invalid cors origin {}", o);
                    None
                }
            })
            .collect();

        base.allow_origin(origins)
    }
}
