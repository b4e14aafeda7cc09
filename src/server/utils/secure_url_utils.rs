use base64::{Engine as _, engine::general_purpose::URL_SAFE_NO_PAD};
use crypto_secretbox::{
    Key, Nonce, XSalsa20Poly1305,
    aead::{Aead, KeyInit},
};
use rand::{TryRngCore, rngs::OsRng};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::server::{
    error::{AppResult, Error},
    utils::hdnea_utils,
};

/// manifest route handed out for dash streams, it accepts the same tokens as /render.m3u8
pub const DASH_MANIFEST_PATH: &str = "/render.mpd";

const NONCE_LEN: usize = 24;
const TAG_LEN: usize = 16;

/// which gateway route a reference is allowed to be replayed against
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointKind {
    Manifest,
    TsSegment,
    AacSegment,
    Mp4Segment,
    Key,
    /// directory a dash manifest's segment templates resolve against
    DashBase,
}

impl EndpointKind {
    pub fn path(&self) -> &'static str {
        match self {
            Self::Manifest => "/render.m3u8",
            Self::TsSegment | Self::AacSegment | Self::Mp4Segment => "/render.ts",
            Self::Key => "/render.key",
            Self::DashBase => "/render.dash",
        }
    }

    pub fn content_type(&self) -> &'static str {
        match self {
            Self::Manifest => "application/vnd.apple.mpegurl",
            Self::TsSegment => "video/mp2t",
            Self::AacSegment => "audio/aac",
            Self::Mp4Segment => "video/mp4",
            Self::Key | Self::DashBase => "application/octet-stream",
        }
    }

    pub fn is_segment(&self) -> bool {
        matches!(self, Self::TsSegment | Self::AacSegment | Self::Mp4Segment)
    }
}

/// everything a follow-up request needs, sealed so the client can't read or edit any of it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncryptedReference {
    /// url the reference was found in (or the absolute url itself)
    pub origin_url: String,
    /// the reference as written in the manifest, without its query
    pub match_pattern: String,
    /// query string of the reference, without the leading '?'
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub params: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_id: Option<String>,
    pub endpoint: EndpointKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub quality: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdnea: Option<String>,
}

impl EncryptedReference {
    /// reference to an already absolute url
    pub fn absolute(url: &str, endpoint: EndpointKind) -> Self {
        let (path, params) = split_query(url);
        Self {
            origin_url: path.to_string(),
            match_pattern: String::new(),
            params: params.to_string(),
            channel_id: None,
            endpoint,
            quality: None,
            hdnea: hdnea_utils::extract_hdnea(url),
        }
    }

    pub fn with_channel(mut self, channel_id: Option<&str>) -> Self {
        self.channel_id = channel_id.map(str::to_string);
        self
    }

    pub fn with_quality(mut self, quality: Option<&str>) -> Self {
        self.quality = quality.map(str::to_string);
        self
    }

    /// the upstream url this reference points at, session token included
    pub fn target_url(&self) -> AppResult<String> {
        let resolved = if self.match_pattern.is_empty() {
            self.origin_url.clone()
        } else {
            let base = url::Url::parse(&self.origin_url).map_err(|_| Error::InvalidToken)?;
            let mut joined = base
                .join(&self.match_pattern)
                .map_err(|_| Error::InvalidToken)?;
            joined.set_query(None);
            joined.to_string()
        };

        let with_params = if self.params.is_empty() {
            resolved
        } else {
            format!("{}?{}", resolved, self.params)
        };

        Ok(match &self.hdnea {
            Some(token) => hdnea_utils::append_hdnea(&with_params, token),
            None => with_params,
        })
    }

    /// joins a path below a dash base directory. anything resolving outside the directory
    /// (absolute urls, `..`) is refused
    pub fn dash_target_url(&self, rest: &str, query: Option<&str>) -> AppResult<String> {
        if self.endpoint != EndpointKind::DashBase {
            return Err(Error::InvalidToken);
        }

        let base = url::Url::parse(&self.origin_url).map_err(|_| Error::InvalidToken)?;
        let mut joined = base.join(rest).map_err(|_| Error::InvalidToken)?;
        if joined.origin() != base.origin() || !joined.path().starts_with(base.path()) {
            debug!("{} escapes dash base {}", rest, self.origin_url);
            return Err(Error::InvalidToken);
        }

        let query: Vec<&str> = [query.unwrap_or_default(), self.params.as_str()]
            .into_iter()
            .filter(|q| !q.is_empty())
            .collect();
        joined.set_query(None);
        let joined = if query.is_empty() {
            joined.to_string()
        } else {
            format!("{}?{}", joined, query.join("&"))
        };

        Ok(match &self.hdnea {
            Some(token) => hdnea_utils::append_hdnea(&joined, token),
            None => joined,
        })
    }
}

/// splits "a/b.ts?x=1" into ("a/b.ts", "x=1")
pub fn split_query(reference: &str) -> (&str, &str) {
    match reference.split_once('?') {
        Some((path, query)) => (path, query),
        None => (reference, ""),
    }
}

/// XSalsa20-Poly1305 sealed url references
///
/// token layout is base64url(nonce || ciphertext || tag) without padding so it can sit in a
/// query string as is
pub struct SecureUrlCodec {
    cipher: XSalsa20Poly1305,
}

impl SecureUrlCodec {
    /// the key is sha256 of the configured secret so any secret length works
    pub fn new(secret: &str) -> Self {
        let digest = Sha256::digest(secret.as_bytes());
        let cipher = XSalsa20Poly1305::new(Key::from_slice(&digest));
        Self { cipher }
    }

    pub fn encrypt(&self, reference: &EncryptedReference) -> AppResult<String> {
        let plaintext = serde_json::to_vec(reference).map_err(|e| {
            Error::InternalServerErrorWithContext(format!("failed to serialize reference: {}", e))
        })?;

        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.try_fill_bytes(&mut nonce_bytes).map_err(|e| {
            Error::InternalServerErrorWithContext(format!("os rng unavailable for nonce: {}", e))
        })?;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), plaintext.as_ref())
            .map_err(|_| {
                Error::InternalServerErrorWithContext("failed to seal reference".to_string())
            })?;

        let mut sealed = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        sealed.extend_from_slice(&nonce_bytes);
        sealed.extend_from_slice(&ciphertext);

        Ok(URL_SAFE_NO_PAD.encode(sealed))
    }

    pub fn decrypt(&self, token: &str) -> AppResult<EncryptedReference> {
        let sealed = URL_SAFE_NO_PAD.decode(token).map_err(|e| {
            debug!("token is not base64url: {}", e);
            Error::InvalidToken
        })?;

        if sealed.len() < NONCE_LEN + TAG_LEN {
            debug!("token too short ({} bytes)", sealed.len());
            return Err(Error::InvalidToken);
        }

        let (nonce, ciphertext) = sealed.split_at(NONCE_LEN);
        let plaintext = self
            .cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| {
                debug!("token failed authentication");
                Error::InvalidToken
            })?;

        serde_json::from_slice(&plaintext).map_err(|e| {
            debug!("token payload did not deserialize: {}", e);
            Error::InvalidToken
        })
    }

    /// "/render.ts?auth=TOKEN", or "/render.dash/TOKEN/" for a dash base so segment
    /// templates can be appended to it
    pub fn gateway_path(&self, reference: &EncryptedReference) -> AppResult<String> {
        let token = self.encrypt(reference)?;
        Ok(match reference.endpoint {
            EndpointKind::DashBase => format!("{}/{}/", reference.endpoint.path(), token),
            endpoint => format!("{}?auth={}", endpoint.path(), token),
        })
    }
}
