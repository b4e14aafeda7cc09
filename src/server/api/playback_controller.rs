use axum::{
    Extension, Router,
    extract::{Path, Query},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tracing::{debug, info};

use crate::server::{
    error::{AppResult, Error},
    services::gateway_services::GatewayServices,
};

#[derive(Deserialize)]
struct LiveQuery {
    q: Option<String>,
}

#[derive(Deserialize)]
struct CatchupQuery {
    srno: Option<String>,
    start: Option<String>,
    end: Option<String>,
    q: Option<String>,
}

/// entry points handed to players, both answer with a redirect to /render.m3u8 (or /render.mpd)
pub struct PlaybackController;

impl PlaybackController {
    pub fn app() -> Router {
        Router::new()
            .route("/live/{id}", get(Self::live))
            .route("/catchup/{id}", get(Self::catchup))
    }

    async fn live(
        Extension(services): Extension<GatewayServices>,
        Path(id): Path<String>,
        Query(query): Query<LiveQuery>,
    ) -> AppResult<Response> {
        let location = services.render.play_live(&id, query.q.as_deref()).await?;
        info!("live {} -> render", id);
        Self::redirect(&location)
    }

    async fn catchup(
        Extension(services): Extension<GatewayServices>,
        Path(id): Path<String>,
        Query(query): Query<CatchupQuery>,
    ) -> AppResult<Response> {
        let (Some(srno), Some(start), Some(end)) = (query.srno, query.start, query.end) else {
            return Err(Error::BadRequest(
                "catchup needs srno, start and end".to_string(),
            ));
        };

        let location = services
            .render
            .play_catchup(&id, &srno, &start, &end, query.q.as_deref())
            .await?;
        debug!("catchup {} srno {} -> render", id, srno);
        Self::redirect(&location)
    }

    fn redirect(location: &str) -> AppResult<Response> {
        let mut headers = HeaderMap::new();
        headers.insert(
            header::LOCATION,
            location
                .parse()
                .map_err(|_| Error::InternalServerErrorWithContext(format!("bad location {}", location)))?,
        );
        headers.insert(
            header::CACHE_CONTROL,
            "no-store".parse().expect("Static header value should parse"),
        );

        Ok((StatusCode::FOUND, headers).into_response())
    }
}
