// guide generation. one run fetches the channel list, fans the per channel pages out over a
// fixed worker pool, then writes a gzipped xmltv file next to the previous one and swaps it in
use std::collections::{HashMap, VecDeque};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Days, NaiveTime, TimeZone, Utc};
use flate2::{Compression, write::GzEncoder};
use mockall::automock;
use quick_xml::Writer;
use quick_xml::events::{BytesDecl, BytesEnd, BytesStart, BytesText, Event};
use rand::{TryRngCore, rngs::OsRng};
use serde::Serialize;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::server::{
    dtos::{
        channel_dto::Channel,
        epg_dto::{GuideChannel, GuideDocument, ProgrammePage, Programme, UpstreamProgramme},
    },
    error::{AppResult, Error},
    services::{
        scheduler_services::{Scheduler, task},
        upstream_services::EPG_POSTER_URL,
    },
};

pub type DynEpgSource = Arc<dyn EpgSourceTrait + Send + Sync>;

pub const EPG_TASK_ID: &str = "epg-generation";
pub const EXTERNAL_EPG_TASK_ID: &str = "external-epg-refresh";
pub const EXTERNAL_EPG_INTERVAL: Duration = Duration::from_secs(12 * 60 * 60);

const EPG_WORKERS: usize = 20;
const PAGES_PER_CHANNEL: u32 = 2;
// used when the os rng can't be read
const DEFAULT_RANDOM_HOUR: u32 = 2;
const DEFAULT_RANDOM_MINUTE: u32 = 30;
const EXTERNAL_MAX_REDIRECTS: usize = 5;
const EXTERNAL_TIMEOUT: Duration = Duration::from_secs(20);
// epochs above this are milliseconds
const MILLIS_THRESHOLD: i64 = 100_000_000_000;
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

#[automock]
#[async_trait]
pub trait EpgSourceTrait {
    async fn guide_channels(&self) -> AppResult<Vec<Channel>>;
    async fn programme_page(&self, channel_id: &str, offset: u32) -> AppResult<ProgrammePage>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EpgState {
    Idle,
    FetchingChannels,
    FetchingProgrammes,
    Assembling,
    Serializing,
    Writing,
    Failed,
}

impl EpgState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::FetchingChannels => "fetching_channels",
            Self::FetchingProgrammes => "fetching_programmes",
            Self::Assembling => "assembling",
            Self::Serializing => "serializing",
            Self::Writing => "writing",
            Self::Failed => "failed",
        }
    }
}

pub struct EpgService {
    source: DynEpgSource,
    path: PathBuf,
    state: Mutex<EpgState>,
    last_success: Mutex<Option<DateTime<Utc>>>,
    run_lock: tokio::sync::Mutex<()>,
    http_client: reqwest::Client,
}

impl EpgService {
    pub fn new(source: DynEpgSource, path: PathBuf) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(EXTERNAL_TIMEOUT)
            .redirect(reqwest::redirect::Policy::limited(EXTERNAL_MAX_REDIRECTS))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            source,
            path,
            state: Mutex::new(EpgState::Idle),
            last_success: Mutex::new(None),
            run_lock: tokio::sync::Mutex::new(()),
            http_client,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn state(&self) -> EpgState {
        *self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn last_success(&self) -> Option<DateTime<Utc>> {
        *self.last_success.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn set_state(&self, state: EpgState) {
        debug!("epg state -> {:?}", state);
        *self.state.lock().unwrap_or_else(|p| p.into_inner()) = state;
    }

    /// a full run. on any failure the file on disk is left as it was
    pub async fn generate(&self) -> AppResult<usize> {
        let Ok(_running) = self.run_lock.try_lock() else {
            warn!("epg generation already running, skipping");
            return Err(Error::InternalServerErrorWithContext(
                "epg generation already running".to_string(),
            ));
        };

        match self.run().await {
            Ok(count) => {
                self.set_state(EpgState::Idle);
                *self.last_success.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
                info!("epg written to {} with {} programmes", self.path.display(), count);
                Ok(count)
            }
            Err(e) => {
                self.set_state(EpgState::Failed);
                error!("epg generation failed: {}", e);
                Err(e)
            }
        }
    }

    async fn run(&self) -> AppResult<usize> {
        self.set_state(EpgState::FetchingChannels);
        let channels = self.source.guide_channels().await?;
        info!("fetched {} channels for the guide", channels.len());

        self.set_state(EpgState::FetchingProgrammes);
        let programmes = fetch_programmes(self.source.clone(), &channels).await;

        self.set_state(EpgState::Assembling);
        let document = assemble(&channels, programmes)?;
        let count = document.programmes.len();

        self.set_state(EpgState::Serializing);
        let xml = render_guide(&document)?;
        let compressed = gzip(&xml)?;

        self.set_state(EpgState::Writing);
        write_atomically(&self.path, &compressed).await?;
        Ok(count)
    }

    /// true when the artifact exists and was written today (utc)
    pub async fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        let modified = match tokio::fs::metadata(&self.path)
            .await
            .and_then(|m| m.modified())
        {
            Ok(modified) => DateTime::<Utc>::from(modified),
            Err(_) => return false,
        };
        modified.date_naive() == now.date_naive()
    }

    /// downloads a prebuilt guide over the artifact, plain xml gets compressed on the way
    pub async fn download_external(&self, url: &str) -> AppResult<usize> {
        info!("downloading external epg from {}", url);
        let response = self.http_client.get(url).send().await.map_err(|e| {
            error!("external epg request failed: {}", e);
            Error::TransientNetworkError {
                attempts: 1,
                message: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamRejected {
                status: status.as_u16(),
                body: format!("external epg download from {}", url),
            });
        }

        let bytes = response.bytes().await.map_err(|e| Error::TransientNetworkError {
            attempts: 1,
            message: e.to_string(),
        })?;

        if bytes.is_empty() {
            return Err(Error::MalformedResponse("external epg is empty".to_string()));
        }

        let artifact = if bytes.starts_with(&GZIP_MAGIC) {
            bytes.to_vec()
        } else {
            gzip(&bytes)?
        };

        write_atomically(&self.path, &artifact).await?;
        *self.last_success.lock().unwrap_or_else(|p| p.into_inner()) = Some(Utc::now());
        info!("external epg saved to {} ({} bytes)", self.path.display(), artifact.len());
        Ok(artifact.len())
    }

    /// generates now unless today's file is already there, then arms the daily run
    pub async fn init(self: &Arc<Self>, scheduler: &Scheduler) {
        if self.is_fresh(Utc::now()).await {
            info!("epg file is up to date");
        } else {
            info!("epg file is missing or old, generating");
            let epg = self.clone();
            tokio::spawn(async move {
                if epg.generate().await.is_err() {
                    warn!("server continues without a fresh epg");
                }
            });
        }
        self.schedule_next(scheduler);
    }

    /// arms the next daily run, the run re-arms itself when it finishes
    pub fn schedule_next(self: &Arc<Self>, scheduler: &Scheduler) -> bool {
        let (hour_index, minute_index) = random_offsets();
        let now = Utc::now();
        let at = next_run_time(now, hour_index, minute_index);
        let delay = (at - now).to_std().unwrap_or_default();
        info!("scheduled epg generation at {}", at);

        let epg = self.clone();
        let next_scheduler = scheduler.clone();
        scheduler.add(
            EPG_TASK_ID,
            delay,
            task(move || {
                let epg = epg.clone();
                let scheduler = next_scheduler.clone();
                async move {
                    let result = epg.generate().await;
                    epg.schedule_next(&scheduler);
                    result.map(|_| ()).map_err(anyhow::Error::from)
                }
            }),
        )
    }
}

async fn fetch_programmes(source: DynEpgSource, channels: &[Channel]) -> Vec<Programme> {
    let total = channels.len();
    let queue = Arc::new(Mutex::new(channels.iter().cloned().collect::<VecDeque<_>>()));
    let programmes = Arc::new(Mutex::new(Vec::new()));
    let completed = Arc::new(AtomicUsize::new(0));

    let mut workers = JoinSet::new();
    for _ in 0..EPG_WORKERS.min(total.max(1)) {
        let source = source.clone();
        let queue = queue.clone();
        let programmes = programmes.clone();
        let completed = completed.clone();

        workers.spawn(async move {
            loop {
                let next = queue.lock().unwrap_or_else(|p| p.into_inner()).pop_front();
                let Some(channel) = next else {
                    break;
                };

                let fetched = fetch_channel(source.as_ref(), &channel).await;
                programmes
                    .lock()
                    .unwrap_or_else(|p| p.into_inner())
                    .extend(fetched);

                let done = completed.fetch_add(1, Ordering::Relaxed) + 1;
                if done % 50 == 0 || done == total {
                    info!("epg progress {}/{} channels", done, total);
                }
            }
        });
    }

    while let Some(joined) = workers.join_next().await {
        if let Err(e) = joined {
            error!("epg worker died: {}", e);
        }
    }

    let mut collected = programmes.lock().unwrap_or_else(|p| p.into_inner());
    std::mem::take(&mut *collected)
}

async fn fetch_channel(source: &(dyn EpgSourceTrait + Send + Sync), channel: &Channel) -> Vec<Programme> {
    let mut programmes = Vec::new();

    for offset in 0..PAGES_PER_CHANNEL {
        match source.programme_page(&channel.id, offset).await {
            Ok(ProgrammePage::NoMorePages) => break,
            Ok(ProgrammePage::Entries(entries)) => {
                programmes.extend(entries.iter().filter_map(|p| to_programme(&channel.id, p)));
            }
            Err(e) => {
                error!(
                    "error fetching epg for channel {}, offset {}: {}",
                    channel.id, offset, e
                );
            }
        }
    }

    programmes
}

fn to_programme(channel_id: &str, entry: &UpstreamProgramme) -> Option<Programme> {
    let start = time_from_epoch(entry.start_epoch)?;
    let stop = time_from_epoch(entry.end_epoch)?;

    Some(Programme {
        channel: channel_id.to_string(),
        start: format_time(start),
        stop: format_time(stop),
        title: entry.showname.clone(),
        description: entry.description.clone(),
        category: entry.show_category.clone(),
        icon: format!("{}/{}", EPG_POSTER_URL, entry.episode_poster),
    })
}

/// accepts seconds or milliseconds, non positive epochs are rejected
pub fn time_from_epoch(epoch: i64) -> Option<DateTime<Utc>> {
    if epoch <= 0 {
        return None;
    }
    if epoch < MILLIS_THRESHOLD {
        Utc.timestamp_opt(epoch, 0).single()
    } else {
        Utc.timestamp_millis_opt(epoch).single()
    }
}

/// xmltv time, "20240101093000 +0000"
pub fn format_time(time: DateTime<Utc>) -> String {
    time.format("%Y%m%d%H%M%S %z").to_string()
}

/// programmes grouped in channel order, by start time within a channel
pub fn assemble(channels: &[Channel], mut programmes: Vec<Programme>) -> AppResult<GuideDocument> {
    if channels.is_empty() {
        return Err(Error::MalformedResponse(
            "no channels to build a guide from".to_string(),
        ));
    }

    let position: HashMap<&str, usize> = channels
        .iter()
        .enumerate()
        .map(|(i, c)| (c.id.as_str(), i))
        .collect();
    programmes.sort_by(|a, b| {
        let pa = position.get(a.channel.as_str()).copied().unwrap_or(usize::MAX);
        let pb = position.get(b.channel.as_str()).copied().unwrap_or(usize::MAX);
        pa.cmp(&pb).then_with(|| a.start.cmp(&b.start))
    });

    Ok(GuideDocument {
        channels: channels
            .iter()
            .map(|c| GuideChannel {
                id: c.id.clone(),
                display_name: c.name.clone(),
            })
            .collect(),
        programmes,
    })
}

fn xml_error(e: impl std::fmt::Display) -> Error {
    Error::InternalServerErrorWithContext(format!("failed to write guide xml: {}", e))
}

fn text_element(
    writer: &mut Writer<Vec<u8>>,
    name: &str,
    attributes: &[(&str, &str)],
    text: &str,
) -> AppResult<()> {
    let mut start = BytesStart::new(name);
    for attribute in attributes {
        start.push_attribute(*attribute);
    }
    writer.write_event(Event::Start(start)).map_err(xml_error)?;
    writer
        .write_event(Event::Text(BytesText::new(text)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::End(BytesEnd::new(name)))
        .map_err(xml_error)?;
    Ok(())
}

pub fn render_guide(document: &GuideDocument) -> AppResult<Vec<u8>> {
    let mut writer = Writer::new_with_indent(Vec::new(), b' ', 2);

    writer
        .write_event(Event::Decl(BytesDecl::new("1.0", Some("UTF-8"), None)))
        .map_err(xml_error)?;
    writer
        .write_event(Event::DocType(BytesText::from_escaped(
            r#"tv SYSTEM "xmltv.dtd""#,
        )))
        .map_err(xml_error)?;

    let mut tv = BytesStart::new("tv");
    tv.push_attribute(("generator-info-name", "tvgate"));
    writer.write_event(Event::Start(tv)).map_err(xml_error)?;

    for channel in &document.channels {
        let mut start = BytesStart::new("channel");
        start.push_attribute(("id", channel.id.as_str()));
        writer.write_event(Event::Start(start)).map_err(xml_error)?;
        text_element(&mut writer, "display-name", &[], &channel.display_name)?;
        writer
            .write_event(Event::End(BytesEnd::new("channel")))
            .map_err(xml_error)?;
    }

    for programme in &document.programmes {
        let mut start = BytesStart::new("programme");
        start.push_attribute(("channel", programme.channel.as_str()));
        start.push_attribute(("start", programme.start.as_str()));
        start.push_attribute(("stop", programme.stop.as_str()));
        writer.write_event(Event::Start(start)).map_err(xml_error)?;

        text_element(&mut writer, "title", &[("lang", "en")], &programme.title)?;
        text_element(&mut writer, "desc", &[("lang", "en")], &programme.description)?;
        text_element(&mut writer, "category", &[("lang", "en")], &programme.category)?;

        let mut icon = BytesStart::new("icon");
        icon.push_attribute(("src", programme.icon.as_str()));
        writer.write_event(Event::Empty(icon)).map_err(xml_error)?;

        writer
            .write_event(Event::End(BytesEnd::new("programme")))
            .map_err(xml_error)?;
    }

    writer
        .write_event(Event::End(BytesEnd::new("tv")))
        .map_err(xml_error)?;

    Ok(writer.into_inner())
}

pub fn gzip(data: &[u8]) -> AppResult<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

/// writes `<path>.tmp` and renames it over `path`
pub async fn write_atomically(path: &Path, data: &[u8]) -> AppResult<()> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent).await?;
    }

    let mut staged = path.as_os_str().to_owned();
    staged.push(".tmp");
    let staged = PathBuf::from(staged);

    tokio::fs::write(&staged, data).await?;
    if let Err(e) = tokio::fs::rename(&staged, path).await {
        let _ = tokio::fs::remove_file(&staged).await;
        return Err(e.into());
    }
    Ok(())
}

/// the next run lands on the evening before the coming utc midnight, shifted by
/// `hour_index - 5` hours and `minute_index - 30` minutes. an instant already behind `now`
/// moves a day forward
pub fn next_run_time(now: DateTime<Utc>, hour_index: u32, minute_index: u32) -> DateTime<Utc> {
    let tomorrow = now
        .date_naive()
        .checked_add_days(Days::new(1))
        .unwrap_or(now.date_naive())
        .and_time(NaiveTime::MIN)
        .and_utc();

    let offset = chrono::Duration::hours(hour_index as i64 - 5)
        + chrono::Duration::minutes(minute_index as i64 - 30);
    let at = tomorrow + offset;

    if at <= now {
        at + chrono::Duration::days(1)
    } else {
        at
    }
}

/// (hour index in 0..3, minute index in 0..60) from the os rng
pub fn random_offsets() -> (u32, u32) {
    let hour = match OsRng.try_next_u32() {
        Ok(n) => n % 3,
        Err(e) => {
            error!("failed to generate random hour: {}", e);
            DEFAULT_RANDOM_HOUR
        }
    };
    let minute = match OsRng.try_next_u32() {
        Ok(n) => n % 60,
        Err(e) => {
            error!("failed to generate random minute: {}", e);
            DEFAULT_RANDOM_MINUTE
        }
    };
    (hour, minute)
}
