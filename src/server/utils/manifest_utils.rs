use std::str::FromStr;
use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use tracing::{debug, error};

use crate::server::{
    error::{AppResult, Error},
    utils::{
        hdnea_utils,
        secure_url_utils::{EncryptedReference, EndpointKind, SecureUrlCodec, split_query},
    },
};

static URI_ATTR_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r#"URI="([^"]*)""#).expect("static regex should compile"));

// the leading anchor keeps AVERAGE-BANDWIDTH from matching
static BANDWIDTH_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?:^|[:,])BANDWIDTH=(\d+)").expect("static regex should compile")
});

static BASE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?s)<BaseURL([^>]*)>(.*?)</BaseURL>").expect("static regex should compile")
});

static TEMPLATE_URL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"\b(media|initialization)="(https?://[^"]*)""#)
        .expect("static regex should compile")
});

static MPD_OPEN_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"<MPD\b[^>]*>").expect("static regex should compile"));

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RewriteMode {
    /// playlist of variant playlists
    Master,
    /// playlist of segments
    Media,
}

impl RewriteMode {
    pub fn detect(body: &str) -> Self {
        if body.contains("#EXT-X-STREAM-INF") {
            Self::Master
        } else {
            Self::Media
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManifestFormat {
    Hls,
    Dash,
}

impl ManifestFormat {
    pub fn detect(url: &str, body: &str) -> Self {
        let (path, _) = split_query(url);
        if path.to_ascii_lowercase().ends_with(".mpd") || body.trim_start().starts_with("<?xml")
            || body.contains("<MPD")
        {
            Self::Dash
        } else {
            Self::Hls
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    High,
    Medium,
    Low,
}

impl FromStr for Quality {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            _ => Err(Error::UnknownQuality(s.to_string())),
        }
    }
}

/// what a manifest reference points at, decides which gateway route it goes through
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceClass {
    Manifest,
    Segment(EndpointKind),
    Other,
}

pub fn classify(reference: &str) -> ResourceClass {
    let (path, _) = split_query(reference);
    let path = path.to_ascii_lowercase();

    if path.ends_with(".m3u8") {
        ResourceClass::Manifest
    } else if path.ends_with(".ts") {
        ResourceClass::Segment(EndpointKind::TsSegment)
    } else if path.ends_with(".aac") {
        ResourceClass::Segment(EndpointKind::AacSegment)
    } else if path.ends_with(".mp4") || path.ends_with(".m4s") || path.ends_with(".m4a") {
        ResourceClass::Segment(EndpointKind::Mp4Segment)
    } else {
        ResourceClass::Other
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Variant {
    pub bandwidth: u64,
    pub uri: String,
    /// line index of the #EXT-X-STREAM-INF tag
    pub info_line: usize,
    /// line index of the uri that follows it
    pub uri_line: usize,
}

/// pairs every #EXT-X-STREAM-INF with the uri line after it
pub fn parse_variants(body: &str) -> Vec<Variant> {
    let mut variants = Vec::new();
    let mut pending: Option<(usize, u64)> = None;

    for (index, line) in body.lines().enumerate() {
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if trimmed.starts_with("#EXT-X-STREAM-INF") {
            let bandwidth = BANDWIDTH_RE
                .captures(trimmed)
                .and_then(|c| c.get(1))
                .and_then(|m| m.as_str().parse().ok())
                .unwrap_or(0);
            pending = Some((index, bandwidth));
            continue;
        }

        if trimmed.starts_with('#') {
            continue;
        }

        if let Some((info_line, bandwidth)) = pending.take() {
            variants.push(Variant {
                bandwidth,
                uri: trimmed.to_string(),
                info_line,
                uri_line: index,
            });
        }
    }

    variants
}

/// high is the max bandwidth, low the min, medium the one closest to the midpoint of the two.
/// ties go to whichever variant is listed first
pub fn select_variant<'a>(variants: &'a [Variant], quality: &str) -> AppResult<&'a Variant> {
    let quality: Quality = quality.parse()?;

    let min = variants.iter().map(|v| v.bandwidth).min();
    let max = variants.iter().map(|v| v.bandwidth).max();
    let (Some(min), Some(max)) = (min, max) else {
        return Err(Error::MalformedResponse(
            "master playlist has no variants".to_string(),
        ));
    };

    let chosen = match quality {
        Quality::High => variants.iter().find(|v| v.bandwidth == max),
        Quality::Low => variants.iter().find(|v| v.bandwidth == min),
        Quality::Medium => {
            // doubled distances keep the midpoint integral
            let doubled_mid = min as i128 + max as i128;
            variants.iter().fold(None, |best: Option<&Variant>, v| {
                let distance = (2 * v.bandwidth as i128 - doubled_mid).abs();
                match best {
                    Some(b) if (2 * b.bandwidth as i128 - doubled_mid).abs() <= distance => {
                        Some(b)
                    }
                    _ => Some(v),
                }
            })
        }
    };

    chosen.ok_or_else(|| Error::MalformedResponse("no variant matched".to_string()))
}

/// per-request inputs for a rewrite
#[derive(Debug, Clone, Default)]
pub struct RewriteContext<'a> {
    /// url the manifest was fetched from, relative references resolve against it
    pub base_url: &'a str,
    pub channel_id: Option<&'a str>,
    pub hdnea: Option<&'a str>,
    pub quality: Option<&'a str>,
}

pub struct ManifestRewriter {
    codec: Arc<SecureUrlCodec>,
    disable_ts_handler: bool,
}

impl ManifestRewriter {
    pub fn new(codec: Arc<SecureUrlCodec>, disable_ts_handler: bool) -> Self {
        Self {
            codec,
            disable_ts_handler,
        }
    }

    pub fn codec(&self) -> &SecureUrlCodec {
        &self.codec
    }

    pub fn rewrite(
        &self,
        body: &str,
        ctx: &RewriteContext<'_>,
    ) -> AppResult<String> {
        match ManifestFormat::detect(ctx.base_url, body) {
            ManifestFormat::Dash => self.rewrite_dash(body, ctx),
            ManifestFormat::Hls => self.rewrite_hls(body, ctx, RewriteMode::detect(body)),
        }
    }

    pub fn rewrite_hls(
        &self,
        body: &str,
        ctx: &RewriteContext<'_>,
        mode: RewriteMode,
    ) -> AppResult<String> {
        // with a quality on a master playlist only the chosen variant survives
        let keep = match (mode, ctx.quality) {
            (RewriteMode::Master, Some(quality)) => {
                let variants = parse_variants(body);
                let chosen = select_variant(&variants, quality)?;
                debug!(
                    "selected {} variant at {} bps: {}",
                    quality, chosen.bandwidth, chosen.uri
                );
                let dropped: Vec<usize> = variants
                    .iter()
                    .filter(|v| v.info_line != chosen.info_line)
                    .flat_map(|v| [v.info_line, v.uri_line])
                    .collect();
                Some(dropped)
            }
            _ => None,
        };

        let mut lines = Vec::new();
        for (index, line) in body.lines().enumerate() {
            if keep.as_ref().is_some_and(|dropped| dropped.contains(&index)) {
                continue;
            }

            let trimmed = line.trim();
            if trimmed.is_empty() {
                lines.push(line.to_string());
            } else if trimmed.starts_with('#') {
                lines.push(self.rewrite_tag(line, ctx, mode)?);
            } else {
                lines.push(self.rewrite_uri_line(trimmed, ctx, mode)?);
            }
        }

        let mut rewritten = lines.join("\n");
        if body.ends_with('\n') {
            rewritten.push('\n');
        }
        Ok(rewritten)
    }

    fn rewrite_uri_line(
        &self,
        reference: &str,
        ctx: &RewriteContext<'_>,
        mode: RewriteMode,
    ) -> AppResult<String> {
        match classify(reference) {
            ResourceClass::Manifest => {
                self.mint(reference, EndpointKind::Manifest, ctx, ctx.quality)
            }
            // a master playlist should never list segments, leave them be if one does
            ResourceClass::Segment(_) if mode == RewriteMode::Master => Ok(reference.to_string()),
            ResourceClass::Segment(_) if self.disable_ts_handler => Ok(self.absolute(reference, ctx)),
            ResourceClass::Segment(kind) => self.mint(reference, kind, ctx, None),
            ResourceClass::Other => Ok(self.absolute(reference, ctx)),
        }
    }

    fn rewrite_tag(
        &self,
        line: &str,
        ctx: &RewriteContext<'_>,
        mode: RewriteMode,
    ) -> AppResult<String> {
        if !line.contains("URI=\"") {
            return Ok(line.to_string());
        }

        let tag = line.trim_start();
        let mut failure = None;

        let rewritten = URI_ATTR_RE.replace_all(line, |caps: &Captures| {
            let uri = &caps[1];
            let result = if tag.starts_with("#EXT-X-KEY") || tag.starts_with("#EXT-X-SESSION-KEY")
            {
                if self.disable_ts_handler {
                    Ok(self.absolute(uri, ctx))
                } else {
                    self.mint(uri, EndpointKind::Key, ctx, None)
                }
            } else if tag.starts_with("#EXT-X-MAP") {
                let kind = match classify(uri) {
                    ResourceClass::Segment(kind) => kind,
                    _ => EndpointKind::Mp4Segment,
                };
                if mode == RewriteMode::Master {
                    Ok(uri.to_string())
                } else if self.disable_ts_handler {
                    Ok(self.absolute(uri, ctx))
                } else {
                    self.mint(uri, kind, ctx, None)
                }
            } else if classify(uri) == ResourceClass::Manifest {
                // EXT-X-MEDIA renditions and I-frame playlists
                self.mint(uri, EndpointKind::Manifest, ctx, ctx.quality)
            } else {
                Ok(self.absolute(uri, ctx))
            };

            match result {
                Ok(value) => format!("URI=\"{}\"", value),
                Err(e) => {
                    failure.get_or_insert(e);
                    caps[0].to_string()
                }
            }
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(rewritten.into_owned()),
        }
    }

    fn mint(
        &self,
        reference: &str,
        endpoint: EndpointKind,
        ctx: &RewriteContext<'_>,
        quality: Option<&str>,
    ) -> AppResult<String> {
        let (path, params) = split_query(reference);
        let hdnea = hdnea_utils::extract_hdnea(params).or_else(|| ctx.hdnea.map(str::to_string));

        let reference = EncryptedReference {
            origin_url: ctx.base_url.to_string(),
            match_pattern: path.to_string(),
            params: params.to_string(),
            channel_id: ctx.channel_id.map(str::to_string),
            endpoint,
            quality: quality.map(str::to_string),
            hdnea,
        };

        self.codec.gateway_path(&reference)
    }

    /// resolves against the base url. the session token only goes along to the base's own host
    fn absolute(&self, reference: &str, ctx: &RewriteContext<'_>) -> String {
        let base = match url::Url::parse(ctx.base_url) {
            Ok(base) => base,
            Err(e) => {
                error!("failed to parse base url {}: {}", ctx.base_url, e);
                return reference.to_string();
            }
        };
        let resolved = match base.join(reference) {
            Ok(resolved) => resolved,
            Err(e) => {
                error!("failed to resolve {} against {}: {}", reference, ctx.base_url, e);
                return reference.to_string();
            }
        };

        match ctx.hdnea {
            Some(token) if resolved.host_str() == base.host_str() => {
                hdnea_utils::append_hdnea(resolved.as_str(), token)
            }
            _ => resolved.to_string(),
        }
    }

    /// every BaseURL becomes a gateway directory, so segment templates resolve to
    /// /render.dash/<token>/... and the upstream host never reaches the player
    pub fn rewrite_dash(&self, body: &str, ctx: &RewriteContext<'_>) -> AppResult<String> {
        let base = url::Url::parse(ctx.base_url).map_err(|e| {
            Error::MalformedResponse(format!("invalid manifest url {}: {}", ctx.base_url, e))
        })?;

        let body = self.rewrite_dash_templates(body, &base, ctx)?;

        if BASE_URL_RE.is_match(&body) {
            let mut failure = None;
            let rewritten = BASE_URL_RE.replace_all(&body, |caps: &Captures| {
                let raw = caps[2].trim().replace("&amp;", "&");
                match self.mint_dash_base(&base, &raw, ctx) {
                    Ok(path) => format!("<BaseURL{}>{}</BaseURL>", &caps[1], path),
                    Err(e) => {
                        failure.get_or_insert(e);
                        caps[0].to_string()
                    }
                }
            });

            return match failure {
                Some(e) => Err(e),
                None => Ok(rewritten.into_owned()),
            };
        }

        let Some(open) = MPD_OPEN_RE.find(&body) else {
            return Err(Error::MalformedResponse(
                "dash manifest has no MPD element".to_string(),
            ));
        };
        let directory = self.mint_dash_base(&base, ".", ctx)?;

        let mut rewritten = String::with_capacity(body.len() + 160);
        rewritten.push_str(&body[..open.end()]);
        rewritten.push_str(&format!("<BaseURL>{}</BaseURL>", directory));
        rewritten.push_str(&body[open.end()..]);
        Ok(rewritten)
    }

    /// absolute SegmentTemplate urls skip BaseURL resolution, so their fixed directory part
    /// is swapped for a gateway directory and the $...$ part is kept
    fn rewrite_dash_templates(
        &self,
        body: &str,
        base: &url::Url,
        ctx: &RewriteContext<'_>,
    ) -> AppResult<String> {
        let mut failure = None;
        let rewritten = TEMPLATE_URL_RE.replace_all(body, |caps: &Captures| {
            let raw = caps[2].replace("&amp;", "&");
            let fixed_end = raw.find('$').unwrap_or(raw.len());
            let split = raw[..fixed_end].rfind('/').map_or(0, |i| i + 1);
            let (directory, template) = raw.split_at(split);

            match self.mint_dash_base(base, directory, ctx) {
                Ok(path) => format!(
                    "{}=\"{}{}\"",
                    &caps[1],
                    path,
                    template.replace('&', "&amp;")
                ),
                Err(e) => {
                    failure.get_or_insert(e);
                    caps[0].to_string()
                }
            }
        });

        match failure {
            Some(e) => Err(e),
            None => Ok(rewritten.into_owned()),
        }
    }

    fn mint_dash_base(
        &self,
        base: &url::Url,
        reference: &str,
        ctx: &RewriteContext<'_>,
    ) -> AppResult<String> {
        let resolved = base.join(reference).map_err(|e| {
            Error::MalformedResponse(format!("invalid BaseURL {}: {}", reference, e))
        })?;
        let params = resolved.query().unwrap_or_default().to_string();

        // templates resolve against the directory even when BaseURL names a file
        let directory = resolved.join(".").map_err(|e| {
            Error::MalformedResponse(format!("cannot derive directory of {}: {}", resolved, e))
        })?;

        let hdnea = hdnea_utils::extract_hdnea(&params).or_else(|| {
            ctx.hdnea
                .filter(|_| directory.host_str() == base.host_str())
                .map(str::to_string)
        });

        let reference = EncryptedReference {
            origin_url: directory.to_string(),
            match_pattern: String::new(),
            params,
            channel_id: ctx.channel_id.map(str::to_string),
            endpoint: EndpointKind::DashBase,
            quality: None,
            hdnea,
        };
        self.codec.gateway_path(&reference)
    }
}
