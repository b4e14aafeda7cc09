use axum::Extension;
use axum::Json;
use axum::http::StatusCode;
use chrono::Utc;

use crate::server::dtos::health_dto::{
    CatalogHealth, EpgHealth, HealthResponse, HealthStatus, SchedulerHealth, ServiceHealthDetails,
};
use crate::server::services::epg_services::EpgState;
use crate::server::services::gateway_services::GatewayServices;
use crate::server::{get_app_version, get_uptime_seconds};

/// health endpoint, nothing here calls the upstream
pub async fn health_endpoint(
    Extension(services): Extension<GatewayServices>,
) -> (StatusCode, Json<HealthResponse>) {
    let catalog = CatalogHealth {
        status: HealthStatus::Healthy,
        custom_channels: services.registry.len(),
    };
    let epg = check_epg_health(&services).await;

    // a failed guide run still leaves playback working
    let overall_status = if epg.status == HealthStatus::Healthy {
        HealthStatus::Healthy
    } else {
        HealthStatus::Degraded
    };

    let response = HealthResponse {
        status: overall_status,
        timestamp: Utc::now(),
        uptime_seconds: get_uptime_seconds(),
        version: get_app_version().to_string(),
        environment: format!("{:?}", services.config.cargo_env).to_lowercase(),
        services: ServiceHealthDetails {
            catalog,
            epg,
            scheduler: SchedulerHealth {
                pending_tasks: services.scheduler.pending_count(),
            },
        },
    };

    let http_status = match overall_status {
        HealthStatus::Healthy => StatusCode::OK,
        HealthStatus::Degraded => StatusCode::OK,
        HealthStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (http_status, Json(response))
}

async fn check_epg_health(services: &GatewayServices) -> EpgHealth {
    let state = services.epg.state();
    let status = match state {
        EpgState::Failed => HealthStatus::Degraded,
        _ => HealthStatus::Healthy,
    };

    EpgHealth {
        status,
        enabled: services.config.epg || services.config.epg_url.is_some(),
        state: state.as_str().to_string(),
        artifact_present: tokio::fs::try_exists(services.epg.path())
            .await
            .unwrap_or(false),
        last_success: services.epg.last_success(),
    }
}
