use std::sync::Arc;

use tracing::{debug, error, info};

use crate::server::{
    dtos::channel_dto::CUSTOM_CHANNEL_PREFIX,
    error::{AppResult, Error},
    services::{channel_services::ChannelRegistry, upstream_services::DynUpstreamService},
    utils::{
        manifest_utils::{
            ManifestFormat, ManifestRewriter, Quality, ResourceClass, RewriteContext, classify,
        },
        secure_url_utils::{DASH_MANIFEST_PATH, EncryptedReference, EndpointKind},
    },
};

pub struct RenderedManifest {
    pub body: String,
    pub content_type: &'static str,
    /// forwarded to the player as the __hdnea__ cookie
    pub hdnea_cookie: Option<String>,
}

pub struct RenderedResource {
    pub body: Vec<u8>,
    pub content_type: &'static str,
}

/// turns channel ids into gateway manifest urls and serves what those urls point at
pub struct RenderService {
    upstream: DynUpstreamService,
    registry: Arc<ChannelRegistry>,
    rewriter: Arc<ManifestRewriter>,
}

impl RenderService {
    pub fn new(
        upstream: DynUpstreamService,
        registry: Arc<ChannelRegistry>,
        rewriter: Arc<ManifestRewriter>,
    ) -> Self {
        Self {
            upstream,
            registry,
            rewriter,
        }
    }

    /// "auto" and missing both mean let the player pick
    fn quality_hint(quality: Option<&str>) -> AppResult<Option<&str>> {
        match quality {
            None | Some("") | Some("auto") => Ok(None),
            Some(q) => {
                q.parse::<Quality>()?;
                Ok(Some(q))
            }
        }
    }

    fn manifest_path(
        &self,
        url: &str,
        channel_id: &str,
        quality: Option<&str>,
    ) -> AppResult<String> {
        let reference = EncryptedReference::absolute(url, EndpointKind::Manifest)
            .with_channel(Some(channel_id))
            .with_quality(quality);
        let path = self.rewriter.codec().gateway_path(&reference)?;

        Ok(match ManifestFormat::detect(url, "") {
            ManifestFormat::Dash => {
                path.replacen(EndpointKind::Manifest.path(), DASH_MANIFEST_PATH, 1)
            }
            ManifestFormat::Hls => path,
        })
    }

    /// gateway path of the channel's top manifest
    pub async fn play_live(&self, channel_id: &str, quality: Option<&str>) -> AppResult<String> {
        let quality = Self::quality_hint(quality)?;

        if channel_id.starts_with(CUSTOM_CHANNEL_PREFIX) {
            let channel = self
                .registry
                .get(channel_id)
                .ok_or_else(|| Error::ChannelNotFound(channel_id.to_string()))?;
            debug!("custom channel {} plays {}", channel_id, channel.url);
            return self.manifest_path(&channel.url, channel_id, quality);
        }

        let resolution = self.upstream.live(channel_id).await?;
        let url = resolution.playable_url(None).ok_or_else(|| {
            Error::MalformedResponse(format!("no playable url for channel {}", channel_id))
        })?;

        info!("live {} resolved (drm: {})", channel_id, resolution.is_drm);
        self.manifest_path(url, channel_id, quality)
    }

    pub async fn play_catchup(
        &self,
        channel_id: &str,
        srno: &str,
        start: &str,
        end: &str,
        quality: Option<&str>,
    ) -> AppResult<String> {
        let quality = Self::quality_hint(quality)?;

        let resolution = self.upstream.catchup(channel_id, srno, start, end).await?;
        let url = resolution.playable_url(None).ok_or_else(|| {
            Error::MalformedResponse(format!("no playable catchup url for {}", channel_id))
        })?;

        self.manifest_path(url, channel_id, quality)
    }

    /// fetches the referenced manifest and rewrites every reference inside it
    pub async fn render_manifest(&self, reference: &EncryptedReference) -> AppResult<RenderedManifest> {
        if reference.endpoint != EndpointKind::Manifest {
            return Err(Error::InvalidToken);
        }

        let target = reference.target_url()?;
        let rendered = self.upstream.render(&target).await?;

        let body = String::from_utf8(rendered.body).map_err(|e| {
            error!("manifest from {} is not utf-8: {}", target, e);
            Error::MalformedResponse("manifest is not utf-8".to_string())
        })?;

        let hdnea = rendered
            .hdnea_cookie
            .as_deref()
            .or(reference.hdnea.as_deref());
        let ctx = RewriteContext {
            base_url: &target,
            channel_id: reference.channel_id.as_deref(),
            hdnea,
            quality: reference.quality.as_deref(),
        };

        let content_type = match ManifestFormat::detect(&target, &body) {
            ManifestFormat::Dash => "application/dash+xml",
            ManifestFormat::Hls => EndpointKind::Manifest.content_type(),
        };
        let body = self.rewriter.rewrite(&body, &ctx)?;

        Ok(RenderedManifest {
            body,
            content_type,
            hdnea_cookie: rendered.hdnea_cookie,
        })
    }

    /// segment and key bytes, passed through untouched
    pub async fn render_resource(&self, reference: &EncryptedReference) -> AppResult<RenderedResource> {
        if reference.endpoint == EndpointKind::Manifest {
            return Err(Error::InvalidToken);
        }

        let target = reference.target_url()?;
        let rendered = self.upstream.render(&target).await?;
        debug!("{:?} {} bytes from {}", reference.endpoint, rendered.body.len(), target);

        Ok(RenderedResource {
            body: rendered.body,
            content_type: reference.endpoint.content_type(),
        })
    }

    /// a file below a dash base directory, `rest` is whatever the player appended to it
    pub async fn render_dash_resource(
        &self,
        reference: &EncryptedReference,
        rest: &str,
        query: Option<&str>,
    ) -> AppResult<RenderedResource> {
        let target = reference.dash_target_url(rest, query)?;
        let rendered = self.upstream.render(&target).await?;
        debug!("dash {} bytes from {}", rendered.body.len(), target);

        let content_type = match classify(rest) {
            ResourceClass::Segment(kind) => kind.content_type(),
            ResourceClass::Manifest => EndpointKind::Manifest.content_type(),
            ResourceClass::Other => EndpointKind::DashBase.content_type(),
        };

        Ok(RenderedResource {
            body: rendered.body,
            content_type,
        })
    }
}
