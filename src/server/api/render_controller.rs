use axum::{
    Extension, Router,
    extract::{Path, RawQuery},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use flate2::{Compression, write::GzEncoder};
use std::io::Write;
use tracing::{debug, error};

use crate::server::{
    error::{AppResult, Error},
    extractors::RenderToken,
    services::gateway_services::GatewayServices,
    utils::{
        hdnea_utils::HDNEA_COOKIE,
        secure_url_utils::{DASH_MANIFEST_PATH, EndpointKind},
    },
};

/// Supported compression encodings
#[derive(Debug, Clone, Copy, PartialEq)]
enum ContentEncoding {
    Zstd,
    Gzip,
    None,
}

impl ContentEncoding {
    /// picks from Accept-Encoding. hls players mostly send "gzip, deflate" or "identity"
    fn from_accept_encoding(accept_encoding: Option<&str>) -> Self {
        match accept_encoding {
            Some(v) => {
                if v == "identity" || v.starts_with("identity,") {
                    return Self::None;
                }
                if v.contains("zstd") {
                    Self::Zstd
                } else if v.contains("gzip") {
                    Self::Gzip
                } else {
                    Self::None
                }
            }
            None => Self::None,
        }
    }

    fn as_header_value(&self) -> Option<&'static str> {
        match self {
            Self::Zstd => Some("zstd"),
            Self::Gzip => Some("gzip"),
            Self::None => None,
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        match self {
            Self::Zstd => zstd::encode_all(data, 3),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::None => Ok(data.to_vec()),
        }
    }
}

pub struct RenderController;

impl RenderController {
    pub fn app() -> Router {
        Router::new()
            .route("/render.m3u8", get(Self::render_manifest))
            .route(DASH_MANIFEST_PATH, get(Self::render_manifest))
            .route("/render.ts", get(Self::render_segment))
            .route("/render.key", get(Self::render_key))
            .route("/render.dash/{token}/{*rest}", get(Self::render_dash))
    }

    async fn render_manifest(
        RenderToken(reference, services): RenderToken,
        jar: CookieJar,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        if reference.endpoint != EndpointKind::Manifest {
            debug!("{:?} token used on the manifest route", reference.endpoint);
            return Err(Error::InvalidToken);
        }

        let rendered = services.render.render_manifest(&reference).await?;

        let jar = match rendered.hdnea_cookie {
            Some(token) => jar.add(Cookie::build((HDNEA_COOKIE, token)).path("/").build()),
            None => jar,
        };

        let response = Self::build_manifest_response(&rendered.body, rendered.content_type, &headers)?;
        Ok((jar, response).into_response())
    }

    async fn render_segment(
        RenderToken(reference, services): RenderToken,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        if !reference.endpoint.is_segment() {
            debug!("{:?} token used on the segment route", reference.endpoint);
            return Err(Error::InvalidToken);
        }

        let rendered = services.render.render_resource(&reference).await?;
        Ok(Self::build_binary_response(
            rendered.body,
            rendered.content_type,
            "public, max-age=3600",
            &headers,
        ))
    }

    /// segment templates of a rewritten mpd resolve below /render.dash/<token>/
    async fn render_dash(
        Extension(services): Extension<GatewayServices>,
        Path((token, rest)): Path<(String, String)>,
        RawQuery(query): RawQuery,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let reference = services.codec.decrypt(&token)?;
        if reference.endpoint != EndpointKind::DashBase {
            debug!("{:?} token used on the dash route", reference.endpoint);
            return Err(Error::InvalidToken);
        }

        let rendered = services
            .render
            .render_dash_resource(&reference, &rest, query.as_deref())
            .await?;
        Ok(Self::build_binary_response(
            rendered.body,
            rendered.content_type,
            "public, max-age=3600",
            &headers,
        ))
    }

    async fn render_key(RenderToken(reference, services): RenderToken) -> AppResult<Response> {
        if reference.endpoint != EndpointKind::Key {
            debug!("{:?} token used on the key route", reference.endpoint);
            return Err(Error::InvalidToken);
        }

        let rendered = services.render.render_resource(&reference).await?;
        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            rendered
                .content_type
                .parse()
                .expect("Static header value should parse"),
        );
        response_headers.insert(
            header::CACHE_CONTROL,
            "no-store".parse().expect("Static header value should parse"),
        );

        Ok((StatusCode::OK, response_headers, rendered.body).into_response())
    }

    /// manifest response with optional compression
    fn build_manifest_response(
        body: &str,
        content_type: &'static str,
        headers: &HeaderMap,
    ) -> AppResult<Response> {
        let encoding = ContentEncoding::from_accept_encoding(
            headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            content_type
                .parse()
                .expect("Static header value should parse"),
        );
        response_headers.insert(
            header::CACHE_CONTROL,
            "no-cache".parse().expect("Static header value should parse"),
        );

        let response_body = if encoding != ContentEncoding::None {
            let compressed = encoding.compress(body.as_bytes()).map_err(|e| {
                error!("Failed to compress response with {:?}: {}", encoding, e);
                Error::InternalServerErrorWithContext("Failed to compress response".to_string())
            })?;
            debug!(
                "Compressed manifest with {:?} from {} to {} bytes",
                encoding,
                body.len(),
                compressed.len()
            );
            if let Some(value) = encoding.as_header_value() {
                response_headers.insert(
                    header::CONTENT_ENCODING,
                    value.parse().expect("Static header value should parse"),
                );
            }
            compressed
        } else {
            body.as_bytes().to_vec()
        };

        response_headers.insert(
            header::CONTENT_LENGTH,
            response_body
                .len()
                .to_string()
                .parse()
                .expect("Content length should parse"),
        );

        Ok((StatusCode::OK, response_headers, response_body).into_response())
    }

    /// segments are already compressed media, only ranges are honoured
    fn build_binary_response(
        body: Vec<u8>,
        content_type: &'static str,
        cache_control: &'static str,
        headers: &HeaderMap,
    ) -> Response {
        let total_len = body.len();
        let range = headers
            .get(header::RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| parse_range(v, total_len));

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            content_type
                .parse()
                .expect("Static header value should parse"),
        );
        response_headers.insert(
            header::CACHE_CONTROL,
            cache_control
                .parse()
                .expect("Static header value should parse"),
        );
        response_headers.insert(
            header::ACCEPT_RANGES,
            "bytes".parse().expect("Static header value should parse"),
        );

        let (status, body) = match range {
            Some((start, end)) => {
                debug!("Serving range {}-{} of {} bytes", start, end, total_len);
                response_headers.insert(
                    header::CONTENT_RANGE,
                    format!("bytes {}-{}/{}", start, end, total_len)
                        .parse()
                        .expect("Range header should parse"),
                );
                (StatusCode::PARTIAL_CONTENT, body[start..=end].to_vec())
            }
            None => (StatusCode::OK, body),
        };

        response_headers.insert(
            header::CONTENT_LENGTH,
            body.len()
                .to_string()
                .parse()
                .expect("Content length should parse"),
        );

        (status, response_headers, body).into_response()
    }
}

/// "bytes=start-end" within `total_len`, anything unsatisfiable serves the whole body
fn parse_range(value: &str, total_len: usize) -> Option<(usize, usize)> {
    let (start, end) = value.strip_prefix("bytes=")?.split_once('-')?;
    let last = total_len.checked_sub(1)?;
    let start: usize = start.trim().parse().ok()?;
    let end = match end.trim() {
        "" => last,
        end => end.parse::<usize>().ok()?.min(last),
    };

    (start <= end).then_some((start, end))
}
