use serde::Deserialize;

/// one page of a channel's guide as the backend sends it
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamEpgPage {
    #[serde(default)]
    pub epg: Vec<UpstreamProgramme>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpstreamProgramme {
    #[serde(default, rename = "startEpoch")]
    pub start_epoch: i64,
    #[serde(default, rename = "endEpoch")]
    pub end_epoch: i64,
    #[serde(default)]
    pub showname: String,
    #[serde(default)]
    pub description: String,
    #[serde(default, rename = "showCategory")]
    pub show_category: String,
    #[serde(default, rename = "episodePoster")]
    pub episode_poster: String,
}

pub enum ProgrammePage {
    Entries(Vec<UpstreamProgramme>),
    /// the backend answered 404, there is nothing past this offset
    NoMorePages,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuideChannel {
    pub id: String,
    pub display_name: String,
}

/// a programme as written to the guide, times already formatted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Programme {
    pub channel: String,
    pub start: String,
    pub stop: String,
    pub title: String,
    pub description: String,
    pub category: String,
    pub icon: String,
}

#[derive(Debug, Clone, Default)]
pub struct GuideDocument {
    pub channels: Vec<GuideChannel>,
    pub programmes: Vec<Programme>,
}
