// everything that talks to the tv backend. headers are fixed per process, only the
// access token and the per request channel/srno headers change
use async_trait::async_trait;
use axum::http::header::{ACCEPT, CONTENT_ENCODING, CONTENT_TYPE, COOKIE, LOCATION, SET_COOKIE};
use base64::{Engine as _, engine::general_purpose::STANDARD};
use chrono::Utc;
use flate2::read::GzDecoder;
use mockall::automock;
use rand::{TryRngCore, rngs::OsRng};
use std::io::Read;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info};

use crate::{
    config::AppConfig,
    server::{
        dtos::{
            channel_dto::{Channel, UpstreamChannelsResponse},
            epg_dto::{ProgrammePage, UpstreamEpgPage},
            stream_dto::{ApiResponse, StreamResolution},
        },
        error::{AppResult, Error},
        services::epg_services::EpgSourceTrait,
        utils::{
            hdnea_utils::{HDNEA_COOKIE, extract_hdnea, hdnea_from_set_cookie},
            retry_utils::{
                CATCHUP_MAX_ATTEMPTS, LIVE_MAX_ATTEMPTS, RetryAction, retry_immediately,
            },
        },
    },
};

pub type DynUpstreamService = Arc<dyn UpstreamServiceTrait + Send + Sync>;

const PLAYBACK_HOST: &str = "https://jiotvapi.media.jio.com";
const DATA_HOST: &str = "https://jiotv.data.cdn.jio.com";
const PLAYBACK_PATH: &str = "/playback/apis/v1.1/geturl?langId=6";
const CHANNELS_PATH: &str = "/apis/v3.0/getMobileChannelList/get/?langId=6&os=android&devicetype=phone&usertype=JIO&version=389";
const EPG_PATH: &str = "/apis/v1.3/getepg/get";
pub const EPG_POSTER_URL: &str = "https://jiotv.catchup.cdn.jio.com/dare_images/shows";

const USER_AGENT_OKHTTP: &str = "okhttp/4.12.13";
const APP_KEY: &str = "NzNiMDhlYzQyNjJm";

/// ids with this prefix are partner channels served off a redirecting cdn url
pub const SL_PREFIX: &str = "sl";

// base64 so the urls don't show up in a plain grep of the binary
static SL_CHANNELS: &[(&str, &str)] = &[
    (
        "sl291",
        "aHR0cHM6Ly9kYWkuZ29vZ2xlLmNvbS9saW5lYXIvaGxzL2V2ZW50L2RCZHdPaUdhUXZ5MFRBMXpPc2pWNncvbWFzdGVyLm0zdTg=",
    ),
    (
        "sl471",
        "aHR0cHM6Ly9kYWkuZ29vZ2xlLmNvbS9saW5lYXIvaGxzL2V2ZW50L3g0THhXVWNWU0lpRGFxMVZDTTdEU0EvbWFzdGVyLm0zdTg=",
    ),
    (
        "sl154",
        "aHR0cHM6Ly9kYWkuZ29vZ2xlLmNvbS9saW5lYXIvaGxzL2V2ZW50L0hfWnZYV3FIUkdLcEhjZERFNVJjREEvbWFzdGVyLm0zdTg=",
    ),
];

/// where the playback, channel list and guide requests go
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpstreamEndpoints {
    pub playback: String,
    pub channels: String,
    pub epg: String,
}

impl Default for UpstreamEndpoints {
    fn default() -> Self {
        Self {
            playback: format!("{}{}", PLAYBACK_HOST, PLAYBACK_PATH),
            channels: format!("{}{}", DATA_HOST, CHANNELS_PATH),
            epg: format!("{}{}", DATA_HOST, EPG_PATH),
        }
    }
}

impl UpstreamEndpoints {
    /// same paths, every api on one host
    pub fn with_base(base: &str) -> Self {
        let base = base.trim_end_matches('/');
        Self {
            playback: format!("{}{}", base, PLAYBACK_PATH),
            channels: format!("{}{}", base, CHANNELS_PATH),
            epg: format!("{}{}", base, EPG_PATH),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        match config.upstream_base_url.as_deref() {
            Some(base) if !base.is_empty() => Self::with_base(base),
            _ => Self::default(),
        }
    }
}

/// body of a manifest/segment/key fetch
#[derive(Debug, Clone, Default)]
pub struct RenderedBody {
    pub status: u16,
    pub content_type: Option<String>,
    pub body: Vec<u8>,
    /// a refreshed session token the cdn handed back as a cookie
    pub hdnea_cookie: Option<String>,
}

#[automock]
#[async_trait]
pub trait UpstreamServiceTrait {
    async fn live(&self, channel_id: &str) -> AppResult<StreamResolution>;
    async fn catchup(
        &self,
        channel_id: &str,
        srno: &str,
        start: &str,
        end: &str,
    ) -> AppResult<StreamResolution>;
    async fn channels(&self) -> AppResult<Vec<Channel>>;
    async fn render(&self, url: &str) -> AppResult<RenderedBody>;
}

#[derive(Clone)]
pub struct UpstreamService {
    http_client: reqwest::Client,
    // the sl cdn answers with a 302 we have to read instead of follow
    redirectless_client: reqwest::Client,
    headers: Vec<(&'static str, String)>,
    access_token: String,
    endpoints: UpstreamEndpoints,
    /// sl id -> cdn url that answers with the real stream location
    sl_channels: Vec<(String, String)>,
}

impl UpstreamService {
    pub fn new(config: &AppConfig) -> Self {
        let timeout = Duration::from_secs(config.upstream_timeout_secs);

        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let redirectless_client = reqwest::Client::builder()
            .timeout(timeout)
            .redirect(reqwest::redirect::Policy::none())
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        let device_id = config.device_id.clone().unwrap_or_else(generate_device_id);
        info!("upstream client ready with device id {}", device_id);

        let endpoints = UpstreamEndpoints::from_config(config);
        debug!("playback api at {}", endpoints.playback);

        Self {
            http_client,
            redirectless_client,
            headers: fixed_headers(config, &device_id),
            access_token: config.access_token.clone(),
            endpoints,
            sl_channels: decode_sl_table(SL_CHANNELS),
        }
    }

    /// replaces the built-in sl table, urls are plain here
    pub fn with_sl_channels(mut self, table: Vec<(String, String)>) -> Self {
        self.sl_channels = table;
        self
    }

    fn with_headers(&self, mut request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        for (name, value) in &self.headers {
            request = request.header(*name, value);
        }
        request
    }

    async fn post_playback(
        &self,
        form: &str,
        channel_id: &str,
        srno: Option<&str>,
    ) -> RetryAction<(u16, Vec<u8>)> {
        let mut request = self
            .with_headers(self.http_client.post(&self.endpoints.playback))
            .header("accesstoken", &self.access_token)
            .header("channel_id", channel_id)
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
            .body(form.to_string());

        if let Some(srno) = srno {
            request = request.header("srno", srno);
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return RetryAction::from_transport(e, "playback request"),
        };

        match read_body(response).await {
            Ok((status, _, body)) => RetryAction::Success((status, body)),
            Err(e) => RetryAction::Fail(e),
        }
    }

    async fn get_once(&self, url: &str, hdnea: Option<&str>) -> RetryAction<RenderedBody> {
        let mut request = self.with_headers(self.http_client.get(url));

        // the cdn wants the token as a cookie as well as on the url
        if let Some(token) = hdnea {
            request = request.header(COOKIE, format!("{}={}", HDNEA_COOKIE, token));
        }

        let response = match request.send().await {
            Ok(response) => response,
            Err(e) => return RetryAction::from_transport(e, "render request"),
        };

        let hdnea_cookie = response
            .headers()
            .get_all(SET_COOKIE)
            .iter()
            .filter_map(|v| v.to_str().ok())
            .find_map(hdnea_from_set_cookie);

        let (status, content_type, body) = match read_body(response).await {
            Ok(read) => read,
            Err(e) => return RetryAction::Fail(e),
        };

        if !(200..300).contains(&status) {
            return RetryAction::Fail(Error::UpstreamRejected {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        RetryAction::Success(RenderedBody {
            status,
            content_type,
            body,
            hdnea_cookie,
        })
    }

    async fn resolve_sl(&self, channel_id: &str) -> AppResult<StreamResolution> {
        let cdn_url = self
            .sl_channels
            .iter()
            .find(|(id, _)| id == channel_id)
            .map(|(_, url)| url.as_str())
            .ok_or_else(|| Error::ChannelNotFound(channel_id.to_string()))?;

        let response = self
            .redirectless_client
            .get(cdn_url)
            .send()
            .await
            .map_err(|e| {
                error!("sl redirect request failed for {}: {}", channel_id, e);
                Error::TransientNetworkError {
                    attempts: 1,
                    message: e.to_string(),
                }
            })?;

        let location = response
            .headers()
            .get(LOCATION)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| Error::UpstreamRejected {
                status: response.status().as_u16(),
                body: "redirect without location".to_string(),
            })?;

        debug!("sl channel {} resolved to {}", channel_id, location);

        let mut resolution = StreamResolution {
            result: location.clone(),
            ..Default::default()
        };
        resolution.bitrates.auto = location;
        Ok(resolution)
    }
}

#[async_trait]
impl UpstreamServiceTrait for UpstreamService {
    async fn live(&self, channel_id: &str) -> AppResult<StreamResolution> {
        if channel_id.starts_with(SL_PREFIX) {
            return self.resolve_sl(channel_id).await;
        }

        let now = Utc::now();
        let begin = now.format("%Y%m%dT%H%M%S").to_string();
        let srno = now.format("%y%m%d").to_string();
        let form = encode_form(&[
            ("channel_id", channel_id),
            ("stream_type", "Seek"),
            ("begin", &begin),
            ("srno", &srno),
        ]);
        let form = form.as_str();

        let (status, body) = retry_immediately(LIVE_MAX_ATTEMPTS, |_| {
            self.post_playback(form, channel_id, None)
        })
        .await?;

        let mut resolution = ApiResponse::<StreamResolution>::decode(status, body)
            .into_result()
            .inspect_err(|e| error!("live request for {} failed: {}", channel_id, e))?;
        resolution.adopt_live_hdnea();
        Ok(resolution)
    }

    async fn catchup(
        &self,
        channel_id: &str,
        srno: &str,
        start: &str,
        end: &str,
    ) -> AppResult<StreamResolution> {
        let form = encode_form(&[
            ("stream_type", "Catchup"),
            ("channel_id", channel_id),
            ("programId", srno),
            ("showtime", "000000"),
            ("srno", srno),
            ("begin", start),
            ("end", end),
        ]);
        let form = form.as_str();

        let (status, body) = retry_immediately(CATCHUP_MAX_ATTEMPTS, |_| {
            self.post_playback(form, channel_id, Some(srno))
        })
        .await?;

        let mut resolution = ApiResponse::<StreamResolution>::decode(status, body)
            .into_result()
            .inspect_err(|e| {
                error!("catchup request for {} ({}) failed: {}", channel_id, srno, e)
            })?;
        resolution.adopt_catchup_hdnea();
        Ok(resolution)
    }

    async fn channels(&self) -> AppResult<Vec<Channel>> {
        let response = self
            .with_headers(self.http_client.get(&self.endpoints.channels))
            .header(ACCEPT, "application/json")
            .header("usertype", "JIO")
            .send()
            .await
            .map_err(|e| {
                error!("channel list request failed: {}", e);
                Error::TransientNetworkError {
                    attempts: 1,
                    message: e.to_string(),
                }
            })?;

        let (status, _, body) = read_body(response).await?;
        let catalog = ApiResponse::<UpstreamChannelsResponse>::decode(status, body).into_result()?;

        debug!("upstream catalog has {} channels", catalog.result.len());
        Ok(catalog.result.into_iter().map(Channel::from).collect())
    }

    async fn render(&self, url: &str) -> AppResult<RenderedBody> {
        let hdnea = extract_hdnea(url);
        let hdnea = hdnea.as_deref();
        retry_immediately(1, |_| self.get_once(url, hdnea)).await
    }
}

#[async_trait]
impl EpgSourceTrait for UpstreamService {
    async fn guide_channels(&self) -> AppResult<Vec<Channel>> {
        self.channels().await
    }

    async fn programme_page(&self, channel_id: &str, offset: u32) -> AppResult<ProgrammePage> {
        let url = format!(
            "{}?offset={}&channel_id={}&langId=6",
            self.endpoints.epg, offset, channel_id
        );

        let response = self
            .with_headers(self.http_client.get(&url))
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|e| Error::TransientNetworkError {
                attempts: 1,
                message: e.to_string(),
            })?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(ProgrammePage::NoMorePages);
        }

        let (status, _, body) = read_body(response).await?;
        let page = ApiResponse::<UpstreamEpgPage>::decode(status, body).into_result()?;
        Ok(ProgrammePage::Entries(page.epg))
    }
}

fn decode_sl_table(table: &[(&str, &str)]) -> Vec<(String, String)> {
    table
        .iter()
        .filter_map(|(id, encoded)| {
            let url = STANDARD
                .decode(encoded)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok());
            if url.is_none() {
                error!("bad cdn url in sl table for {}", id);
            }
            url.map(|url| (id.to_string(), url))
        })
        .collect()
}

fn fixed_headers(config: &AppConfig, device_id: &str) -> Vec<(&'static str, String)> {
    vec![
        ("appkey", APP_KEY.to_string()),
        ("devicetype", "phone".to_string()),
        ("deviceId", device_id.to_string()),
        ("isott", "false".to_string()),
        ("languageId", "6".to_string()),
        ("lbcookie", "1".to_string()),
        ("os", "android".to_string()),
        ("osVersion", "13".to_string()),
        ("crmid", config.crm.clone()),
        ("userId", config.crm.clone()),
        ("subscriberId", config.crm.clone()),
        ("uniqueId", config.unique_id.clone()),
        ("ssotoken", config.sso_token.clone()),
        ("User-Agent", USER_AGENT_OKHTTP.to_string()),
        ("usergroup", "tvYR7NSNn7rymo3F".to_string()),
        ("versionCode", "389".to_string()),
    ]
}

/// application/x-www-form-urlencoded, order preserved
pub fn encode_form(fields: &[(&str, &str)]) -> String {
    fields
        .iter()
        .map(|(k, v)| format!("{}={}", urlencoding::encode(k), urlencoding::encode(v)))
        .collect::<Vec<_>>()
        .join("&")
}

fn generate_device_id() -> String {
    let mut bytes = [0u8; 8];
    match OsRng.try_fill_bytes(&mut bytes) {
        Ok(()) => hex::encode(bytes),
        Err(e) => {
            error!("os rng unavailable for device id, using clock: {}", e);
            format!("{:016x}", Utc::now().timestamp_nanos_opt().unwrap_or_default())
        }
    }
}

async fn read_body(response: reqwest::Response) -> AppResult<(u16, Option<String>, Vec<u8>)> {
    let status = response.status().as_u16();
    let content_type = response
        .headers()
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let content_encoding = response
        .headers()
        .get(CONTENT_ENCODING)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    let bytes = response.bytes().await.map_err(|e| {
        error!("failed to read upstream body: {}", e);
        Error::TransientNetworkError {
            attempts: 1,
            message: format!("failed to read body: {}", e),
        }
    })?;

    let body = decode_body(content_encoding.as_deref(), &bytes)?;
    Ok((status, content_type, body))
}

/// undoes gzip/zstd content encoding, anything else is passed through
pub fn decode_body(content_encoding: Option<&str>, bytes: &[u8]) -> AppResult<Vec<u8>> {
    match content_encoding {
        Some("zstd") => zstd::decode_all(bytes).map_err(|e| {
            error!("failed to decompress zstd: {}", e);
            Error::MalformedResponse("bad zstd body".to_string())
        }),
        Some("gzip") => {
            let mut decoder = GzDecoder::new(bytes);
            let mut decompressed = Vec::new();
            decoder.read_to_end(&mut decompressed).map_err(|e| {
                error!("failed to decompress gzip: {}", e);
                Error::MalformedResponse("bad gzip body".to_string())
            })?;
            Ok(decompressed)
        }
        _ => Ok(bytes.to_vec()),
    }
}
