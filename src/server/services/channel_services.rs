use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::{error, info, warn};

use crate::server::{
    dtos::channel_dto::{
        CUSTOM_CHANNEL_PREFIX, Channel, ChannelOrigin, CustomChannelsDocument, CustomChannelsFile,
    },
    error::{AppResult, Error},
};

pub const DEFAULT_SOFT_LIMIT: usize = 1000;

const DEFAULT_CATALOG_NAMES: [&str; 6] = [
    "custom-channels.json",
    "custom_channels.json",
    "custom-channels.yml",
    "custom_channels.yml",
    "custom-channels.yaml",
    "custom_channels.yaml",
];

/// served when the default file name is configured but nothing is on disk yet
const BUILT_IN_CUSTOM_CHANNELS_JSON: &str = r#"{
  "channels": [
    {
      "id": "custom_news_1",
      "name": "Sample News Channel",
      "url": "https://example.com/news/playlist.m3u8",
      "logo_url": "https://example.com/logos/news.png",
      "category": 12,
      "language": 6,
      "is_hd": true
    },
    {
      "id": "custom_entertainment_1",
      "name": "Sample Entertainment Channel",
      "url": "https://example.com/entertainment/playlist.m3u8",
      "logo_url": "https://example.com/logos/entertainment.png",
      "category": 5,
      "language": 1,
      "is_hd": false
    }
  ]
}"#;

const UTF8_BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

#[derive(Debug, Default)]
struct CatalogSnapshot {
    // file order, one entry per id
    ordered: Vec<Channel>,
    by_id: HashMap<String, usize>,
}

impl CatalogSnapshot {
    fn build(channels: Vec<Channel>) -> Self {
        let mut snapshot = Self::default();
        for channel in channels {
            match snapshot.by_id.get(&channel.id) {
                // last one wins but keeps the first one's slot
                Some(&index) => snapshot.ordered[index] = channel,
                None => {
                    snapshot.by_id.insert(channel.id.clone(), snapshot.ordered.len());
                    snapshot.ordered.push(channel);
                }
            }
        }
        snapshot
    }
}

/// custom channel cache, swapped whole on every (re)load
pub struct ChannelRegistry {
    path: Option<PathBuf>,
    soft_limit: usize,
    snapshot: RwLock<Arc<CatalogSnapshot>>,
    http_client: reqwest::Client,
}

impl ChannelRegistry {
    pub fn new(path: Option<PathBuf>, soft_limit: usize) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(Duration::from_secs(20))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            path,
            soft_limit,
            snapshot: RwLock::new(Arc::new(CatalogSnapshot::default())),
            http_client,
        }
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// reads the configured file and swaps the cache, a failure keeps whatever was loaded before
    pub async fn load(&self) -> AppResult<usize> {
        let Some(path) = self.path.as_deref() else {
            return Ok(0);
        };

        let channels = load_custom_channels(path).await.inspect_err(|e| {
            error!(
                "failed to load custom channels from {}, keeping previous set: {}",
                path.display(),
                e
            );
        })?;

        let count = self.replace(channels);
        info!("cached {} custom channels from {}", count, path.display());
        log_soft_limit_warning(count, self.soft_limit, "Cached");
        Ok(count)
    }

    pub async fn reload(&self) -> AppResult<usize> {
        self.load().await
    }

    fn replace(&self, channels: Vec<Channel>) -> usize {
        let next = Arc::new(CatalogSnapshot::build(channels));
        let count = next.ordered.len();
        let mut guard = self.snapshot.write().unwrap_or_else(|p| p.into_inner());
        *guard = next;
        count
    }

    fn current(&self) -> Arc<CatalogSnapshot> {
        self.snapshot
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    pub fn custom_channels(&self) -> Vec<Channel> {
        self.current().ordered.clone()
    }

    pub fn get(&self, id: &str) -> Option<Channel> {
        let snapshot = self.current();
        snapshot
            .by_id
            .get(id)
            .map(|&index| snapshot.ordered[index].clone())
    }

    pub fn len(&self) -> usize {
        self.current().ordered.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// upstream channels first, then the custom ones
    pub fn merge(&self, upstream: Vec<Channel>) -> Vec<Channel> {
        let snapshot = self.current();
        let mut merged = upstream;
        merged.reserve(snapshot.ordered.len());
        merged.extend(snapshot.ordered.iter().cloned());
        merged
    }

    /// pulls a fresh custom channels file, writes it over the configured path and reloads.
    /// nothing on disk or in memory changes unless the download parses
    pub async fn refresh_from_url(&self, url: &str) -> AppResult<usize> {
        let path = self.path.as_deref().ok_or_else(|| {
            Error::InternalServerErrorWithContext(
                "custom channels url set without a custom channels file".to_string(),
            )
        })?;

        let response = self.http_client.get(url).send().await.map_err(|e| {
            error!("custom channels download from {} failed: {}", url, e);
            Error::TransientNetworkError {
                attempts: 1,
                message: e.to_string(),
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamRejected {
                status: status.as_u16(),
                body: response.text().await.unwrap_or_default(),
            });
        }

        let bytes = response.bytes().await.map_err(|e| Error::TransientNetworkError {
            attempts: 1,
            message: e.to_string(),
        })?;
        let data = bytes.strip_prefix(UTF8_BOM).unwrap_or(&bytes);

        // validate before touching the file
        let parsed = detect_and_parse(data, path)?;
        info!(
            "downloaded {} custom channels from {}",
            parsed.len(),
            url
        );

        write_staged(path, data).await?;
        let count = self.replace(parsed);
        info!("cached {} custom channels from {}", count, path.display());
        log_soft_limit_warning(count, self.soft_limit, "Cached");
        Ok(count)
    }
}

/// parses a custom channels file, missing default-named files fall back to the built in set
pub async fn load_custom_channels(path: &Path) -> AppResult<Vec<Channel>> {
    if !tokio::fs::try_exists(path).await.unwrap_or(false) {
        warn!("custom channels file not found: {}", path.display());
        if is_default_catalog_path(path) {
            return detect_and_parse(BUILT_IN_CUSTOM_CHANNELS_JSON.as_bytes(), Path::new("built-in.json"));
        }
        return Ok(Vec::new());
    }

    let data = tokio::fs::read(path).await?;
    let data = data.strip_prefix(UTF8_BOM).unwrap_or(&data);
    detect_and_parse(data, path)
}

pub fn is_default_catalog_path(path: &Path) -> bool {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(|n| n.to_ascii_lowercase())
        .is_some_and(|n| DEFAULT_CATALOG_NAMES.contains(&n.as_str()))
}

/// extension decides first, otherwise the content is sniffed. ids come back `cc_` prefixed
pub fn detect_and_parse(data: &[u8], path: &Path) -> AppResult<Vec<Channel>> {
    let extension = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());

    let unsupported = |e: &dyn std::fmt::Display| {
        Error::UnsupportedFormat(format!("{}: {}", path.display(), e))
    };

    let document: CustomChannelsDocument = match extension.as_deref() {
        Some("json") => serde_json::from_slice(data).map_err(|e| unsupported(&e))?,
        Some("yml") | Some("yaml") => serde_yaml::from_slice(data).map_err(|e| unsupported(&e))?,
        _ => {
            let text = std::str::from_utf8(data).map_err(|e| unsupported(&e))?;
            let trimmed = text.trim();
            if trimmed.is_empty() {
                return Err(unsupported(&"empty file"));
            }

            if trimmed.starts_with('{') || trimmed.starts_with('[') {
                match serde_json::from_str(trimmed) {
                    Ok(document) => document,
                    Err(_) => serde_yaml::from_str(trimmed).map_err(|e| unsupported(&e))?,
                }
            } else {
                serde_yaml::from_str(trimmed).map_err(|e| unsupported(&e))?
            }
        }
    };

    Ok(normalize_custom(document.into_channels()))
}

pub fn normalize_custom(channels: Vec<Channel>) -> Vec<Channel> {
    channels
        .into_iter()
        .map(|mut channel| {
            if !channel.id.starts_with(CUSTOM_CHANNEL_PREFIX) {
                channel.id = format!("{}{}", CUSTOM_CHANNEL_PREFIX, channel.id);
            }
            channel.origin = ChannelOrigin::Custom;
            channel
        })
        .collect()
}

/// writes the set as json via a temp file and rename
pub async fn save_custom_channels(path: &Path, channels: &[Channel]) -> AppResult<()> {
    let body = serde_json::to_vec_pretty(&CustomChannelsFile { channels }).map_err(|e| {
        Error::InternalServerErrorWithContext(format!("failed to serialize channels: {}", e))
    })?;
    write_staged(path, &body).await?;
    info!("saved {} custom channels to {}", channels.len(), path.display());
    Ok(())
}

async fn write_staged(path: &Path, data: &[u8]) -> AppResult<()> {
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

/// lists of allowed values, an empty list allows everything and both lists must match
pub fn filter_by_defaults(channels: &[Channel], categories: &[i32], languages: &[i32]) -> Vec<Channel> {
    channels
        .iter()
        .filter(|c| categories.is_empty() || categories.contains(&c.category))
        .filter(|c| languages.is_empty() || languages.contains(&c.language))
        .cloned()
        .collect()
}

/// single value filter, 0 means no constraint
pub fn filter_channels(channels: &[Channel], language: i32, category: i32) -> Vec<Channel> {
    channels
        .iter()
        .filter(|c| language == 0 || c.language == language)
        .filter(|c| category == 0 || c.category == category)
        .cloned()
        .collect()
}

fn log_soft_limit_warning(count: usize, limit: usize, context: &str) {
    if count <= limit {
        return;
    }

    warn!(
        "{} {} custom channels, which exceeds the recommended limit of {} channels.",
        context, count, limit
    );
    warn!("Large numbers of custom channels may impact performance:");
    warn!("  - Slower channel listing and filtering operations");
    warn!("  - Increased memory usage");
    warn!("  - Longer startup times");
    warn!("Consider splitting channels into multiple files or reducing the total number.");
}

#[cfg(test)]
mod tests {
    use super::*;

    fn channel(id: &str) -> Channel {
        Channel {
            id: id.to_string(),
            name: id.to_uppercase(),
            url: String::new(),
            logo_url: String::new(),
            category: 0,
            language: 0,
            is_hd: false,
            origin: ChannelOrigin::Custom,
        }
    }

    #[test]
    fn duplicates_keep_first_slot_last_value() {
        let mut second = channel("cc_a");
        second.name = "second".to_string();
        let snapshot = CatalogSnapshot::build(vec![channel("cc_a"), channel("cc_b"), second]);

        assert_eq!(snapshot.ordered.len(), 2);
        assert_eq!(snapshot.ordered[0].name, "second");
        assert_eq!(snapshot.ordered[1].id, "cc_b");
    }

    #[test]
    fn built_in_catalog_parses() {
        let channels =
            detect_and_parse(BUILT_IN_CUSTOM_CHANNELS_JSON.as_bytes(), Path::new("x.json")).unwrap();
        assert_eq!(channels.len(), 2);
        assert!(channels.iter().all(|c| c.id.starts_with("cc_")));
    }

    #[test]
    fn default_names_are_case_insensitive() {
        assert!(is_default_catalog_path(Path::new("/etc/tv/Custom-Channels.YAML")));
        assert!(!is_default_catalog_path(Path::new("/etc/tv/channels.json")));
    }

    #[test]
    fn json_looking_yaml_still_parses() {
        // flow style yaml isn't valid json because of the unquoted keys
        let data = b"{channels: [{id: 7, name: Seven}]}";
        let channels = detect_and_parse(data, Path::new("channels.txt")).unwrap();
        assert_eq!(channels[0].id, "cc_7");
    }
}
