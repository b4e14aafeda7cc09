use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: HealthStatus,
    pub timestamp: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub version: String,
    pub environment: String,
    pub services: ServiceHealthDetails,
}

#[derive(Debug, Serialize)]
pub struct ServiceHealthDetails {
    pub catalog: CatalogHealth,
    pub epg: EpgHealth,
    pub scheduler: SchedulerHealth,
}

#[derive(Debug, Serialize)]
pub struct CatalogHealth {
    pub status: HealthStatus,
    pub custom_channels: usize,
}

#[derive(Debug, Serialize)]
pub struct EpgHealth {
    pub status: HealthStatus,
    pub enabled: bool,
    pub state: String,
    pub artifact_present: bool,
    pub last_success: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize)]
pub struct SchedulerHealth {
    pub pending_tasks: usize,
}
