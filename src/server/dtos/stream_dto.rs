use serde::{Deserialize, Serialize, de::DeserializeOwned};
use tracing::error;

use crate::server::{
    error::{AppResult, Error},
    utils::hdnea_utils::{append_hdnea, extract_hdnea},
};

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bitrates {
    #[serde(default)]
    pub auto: String,
    #[serde(default)]
    pub high: String,
    #[serde(default)]
    pub medium: String,
    #[serde(default)]
    pub low: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Mpd {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub key: String,
}

/// playback urls for one live or catchup request, never cached
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamResolution {
    #[serde(default)]
    pub result: String,
    #[serde(default)]
    pub bitrates: Bitrates,
    #[serde(default)]
    pub mpd: Mpd,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hdnea: Option<String>,
    #[serde(default, rename = "isDRM")]
    pub is_drm: bool,
    #[serde(default, rename = "algoName")]
    pub algo_name: String,
}

impl StreamResolution {
    /// live responses carry the session token on the auto bitrate, or on the mpd for dash-only
    /// channels
    pub fn adopt_live_hdnea(&mut self) {
        let token = extract_hdnea(&self.bitrates.auto).or_else(|| extract_hdnea(&self.mpd.result));
        self.adopt_hdnea(token);
    }

    /// catchup puts it on result first
    pub fn adopt_catchup_hdnea(&mut self) {
        let token = extract_hdnea(&self.result).or_else(|| extract_hdnea(&self.bitrates.auto));
        self.adopt_hdnea(token);
    }

    fn adopt_hdnea(&mut self, token: Option<String>) {
        let Some(token) = token else {
            return;
        };

        for url in [
            &mut self.result,
            &mut self.bitrates.auto,
            &mut self.bitrates.high,
            &mut self.bitrates.medium,
            &mut self.bitrates.low,
            &mut self.mpd.result,
            &mut self.mpd.key,
        ] {
            *url = append_hdnea(url, &token);
        }

        self.hdnea = Some(token);
    }

    /// the hls url to start playback from, auto unless a non empty bitrate was asked for
    pub fn playable_url(&self, quality: Option<&str>) -> Option<&str> {
        let preferred = match quality {
            Some("high") => &self.bitrates.high,
            Some("medium") => &self.bitrates.medium,
            Some("low") => &self.bitrates.low,
            _ => &self.bitrates.auto,
        };

        [preferred, &self.bitrates.auto, &self.result, &self.mpd.result]
            .into_iter()
            .map(String::as_str)
            .find(|u| !u.is_empty())
    }
}

/// structured error payload the playback api sends with non 2xx statuses
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiError {
    pub code: Option<i64>,
    pub message: Option<String>,
}

/// a decoded backend reply
#[derive(Debug)]
pub enum ApiResponse<T> {
    Success(T),
    Failure {
        status: u16,
        error: ApiError,
        body: String,
    },
    Opaque {
        status: u16,
        body: Vec<u8>,
    },
}

impl<T: DeserializeOwned> ApiResponse<T> {
    pub fn decode(status: u16, body: Vec<u8>) -> Self {
        if (200..300).contains(&status) {
            return match serde_json::from_slice::<T>(&body) {
                Ok(value) => Self::Success(value),
                Err(e) => {
                    error!("failed to decode successful upstream reply: {}", e);
                    Self::Opaque { status, body }
                }
            };
        }

        match serde_json::from_slice::<ApiError>(&body) {
            Ok(error) if error.code.is_some() || error.message.is_some() => Self::Failure {
                status,
                error,
                body: String::from_utf8_lossy(&body).into_owned(),
            },
            _ => Self::Opaque { status, body },
        }
    }

    pub fn into_result(self) -> AppResult<T> {
        match self {
            Self::Success(value) => Ok(value),
            Self::Failure {
                status,
                error,
                body,
            } => {
                error!(
                    "upstream error code {:?}: {}",
                    error.code,
                    error.message.as_deref().unwrap_or("no message")
                );
                Err(Error::UpstreamRejected { status, body })
            }
            Self::Opaque { status, body } if (200..300).contains(&status) => {
                Err(Error::MalformedResponse(format!(
                    "undecodable {} byte reply",
                    body.len()
                )))
            }
            Self::Opaque { status, body } => Err(Error::UpstreamRejected {
                status,
                body: String::from_utf8_lossy(&body).into_owned(),
            }),
        }
    }
}
