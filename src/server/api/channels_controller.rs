use axum::{
    Extension, Json, Router,
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use tracing::{error, info, warn};

use crate::server::{
    dtos::channel_dto::{ChannelsQuery, ChannelsResponse},
    error::{AppResult, Error},
    services::{
        channel_services::{filter_by_defaults, filter_channels},
        gateway_services::GatewayServices,
    },
};

pub struct ChannelsController;

impl ChannelsController {
    pub fn app() -> Router {
        Router::new()
            .route("/channels", get(Self::channels))
            .route("/epg.xml.gz", get(Self::epg))
    }

    /// upstream catalog followed by the custom channels
    async fn channels(
        Extension(services): Extension<GatewayServices>,
        Query(query): Query<ChannelsQuery>,
    ) -> AppResult<Json<ChannelsResponse>> {
        let upstream = match services.upstream.channels().await {
            Ok(channels) => channels,
            Err(e) => {
                error!("upstream catalog unavailable, serving custom channels only: {}", e);
                Vec::new()
            }
        };
        let merged = services.registry.merge(upstream);

        let result = match (query.language, query.category) {
            (None, None) => filter_by_defaults(
                &merged,
                &services.config.default_categories,
                &services.config.default_languages,
            ),
            (language, category) => {
                filter_channels(&merged, language.unwrap_or(0), category.unwrap_or(0))
            }
        };
        info!("serving {} of {} channels", result.len(), merged.len());

        Ok(Json(ChannelsResponse {
            code: StatusCode::OK.as_u16(),
            message: "success".to_string(),
            result,
        }))
    }

    async fn epg(Extension(services): Extension<GatewayServices>) -> AppResult<Response> {
        let path = services.epg.path();
        let body = match tokio::fs::read(path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!("epg requested but {} does not exist", path.display());
                return Err(Error::NotFound("epg has not been generated yet".to_string()));
            }
            Err(e) => return Err(e.into()),
        };

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "application/gzip"
                .parse()
                .expect("Static header value should parse"),
        );
        headers.insert(
            header::CACHE_CONTROL,
            "public, max-age=3600"
                .parse()
                .expect("Static header value should parse"),
        );

        Ok((StatusCode::OK, headers, body).into_response())
    }
}
