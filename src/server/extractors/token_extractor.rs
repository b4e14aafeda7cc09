use axum::Extension;
use axum::extract::{FromRequestParts, Query};
use axum::http::request::Parts;
use serde::Deserialize;
use tracing::debug;

use crate::server::error::Error;
use crate::server::services::gateway_services::GatewayServices;
use crate::server::utils::secure_url_utils::EncryptedReference;

#[derive(Deserialize)]
struct AuthQuery {
    auth: Option<String>,
}

/// the decrypted `auth` query param of a /render.* request
pub struct RenderToken(pub EncryptedReference, pub GatewayServices);

/// stateless, everything needed to serve the request travels inside the token
impl<S> FromRequestParts<S> for RenderToken
where
    S: Send + Sync,
{
    type Rejection = Error;

    async fn from_request_parts(parts: &mut Parts, state: &S) -> Result<Self, Self::Rejection> {
        let Extension(services): Extension<GatewayServices> =
            Extension::from_request_parts(parts, state)
                .await
                .map_err(|err| Error::InternalServerErrorWithContext(err.to_string()))?;

        let Query(query): Query<AuthQuery> = Query::from_request_parts(parts, state)
            .await
            .unwrap_or(Query(AuthQuery { auth: None }));

        let token = query.auth.filter(|t| !t.is_empty()).ok_or_else(|| {
            debug!("render request without auth on {}", parts.uri.path());
            Error::InvalidToken
        })?;

        let reference = services.codec.decrypt(&token)?;
        Ok(RenderToken(reference, services))
    }
}
