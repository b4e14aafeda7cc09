use serde::{Deserialize, Deserializer, Serialize};

/// ids carrying this prefix come from the custom channels file
pub const CUSTOM_CHANNEL_PREFIX: &str = "cc_";

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelOrigin {
    #[default]
    Upstream,
    Custom,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    #[serde(deserialize_with = "string_or_number")]
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub logo_url: String,
    #[serde(default)]
    pub category: i32,
    #[serde(default)]
    pub language: i32,
    #[serde(default)]
    pub is_hd: bool,
    #[serde(default)]
    pub origin: ChannelOrigin,
}

impl Channel {
    pub fn is_custom(&self) -> bool {
        self.origin == ChannelOrigin::Custom || self.id.starts_with(CUSTOM_CHANNEL_PREFIX)
    }
}

/// shape of a custom channels file, either `{"channels": [...]}` or a bare list
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum CustomChannelsDocument {
    Wrapped { channels: Vec<Channel> },
    Bare(Vec<Channel>),
}

impl CustomChannelsDocument {
    pub fn into_channels(self) -> Vec<Channel> {
        match self {
            Self::Wrapped { channels } | Self::Bare(channels) => channels,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct CustomChannelsFile<'a> {
    pub channels: &'a [Channel],
}

/// one entry of the upstream catalog
#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamChannel {
    #[serde(deserialize_with = "string_or_number")]
    pub channel_id: String,
    pub channel_name: String,
    #[serde(default, rename = "logoUrl")]
    pub logo_url: String,
    #[serde(default, rename = "channelCategoryId")]
    pub category: i32,
    #[serde(default, rename = "channelLanguageId")]
    pub language: i32,
    #[serde(default, rename = "isHD")]
    pub is_hd: bool,
}

impl From<UpstreamChannel> for Channel {
    fn from(c: UpstreamChannel) -> Self {
        Self {
            id: c.channel_id,
            name: c.channel_name,
            url: String::new(),
            logo_url: c.logo_url,
            category: c.category,
            language: c.language,
            is_hd: c.is_hd,
            origin: ChannelOrigin::Upstream,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct UpstreamChannelsResponse {
    #[serde(default)]
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub result: Vec<UpstreamChannel>,
}

#[derive(Debug, Deserialize)]
pub struct ChannelsQuery {
    pub language: Option<i32>,
    pub category: Option<i32>,
}

#[derive(Debug, Serialize)]
pub struct ChannelsResponse {
    pub code: u16,
    pub message: String,
    pub result: Vec<Channel>,
}

/// upstream sends ids as numbers, custom files usually as strings
pub fn string_or_number<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Text(String),
        Int(i64),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Text(s) => s,
        Id::Int(n) => n.to_string(),
    })
}
