pub mod channel_services;
pub mod epg_services;
pub mod gateway_services;
pub mod render_services;
pub mod scheduler_services;
pub mod upstream_services;

pub use epg_services::DynEpgSource;
pub use gateway_services::GatewayServices;
pub use upstream_services::DynUpstreamService;
