use std::path::Path;

use tvgate::server::dtos::channel_dto::{Channel, ChannelOrigin};
use tvgate::server::error::Error;
use tvgate::server::services::channel_services::{
    ChannelRegistry, detect_and_parse, filter_by_defaults, filter_channels, load_custom_channels,
    save_custom_channels,
};

fn channel(id: &str, category: i32, language: i32) -> Channel {
    Channel {
        id: id.to_string(),
        name: format!("Channel {}", id),
        url: format!("https://cdn.example.com/{}/index.m3u8", id),
        logo_url: String::new(),
        category,
        language,
        is_hd: false,
        origin: ChannelOrigin::Upstream,
    }
}

fn five_channels() -> Vec<Channel> {
    vec![
        channel("1", 5, 1),
        channel("2", 5, 1),
        channel("3", 5, 6),
        channel("4", 8, 6),
        channel("5", 8, 9),
    ]
}

#[test]
fn test_ids_get_custom_prefix_once() {
    let data = br#"{"channels":[
        {"id":"1","name":"One","url":"https://a/1.m3u8"},
        {"id":"cc_2","name":"Two","url":"https://a/2.m3u8"}
    ]}"#;

    let channels = detect_and_parse(data, Path::new("custom.json")).unwrap();
    let ids: Vec<&str> = channels.iter().map(|c| c.id.as_str()).collect();

    assert_eq!(ids, ["cc_1", "cc_2"]);
    assert!(channels.iter().all(|c| c.origin == ChannelOrigin::Custom));
}

#[test]
fn test_language_defaults_filter() {
    let filtered = filter_by_defaults(&five_channels(), &[], &[6]);
    let ids: Vec<&str> = filtered.iter().map(|c| c.id.as_str()).collect();

    assert_eq!(ids, ["3", "4"]);
}

#[test]
fn test_empty_defaults_allow_everything() {
    assert_eq!(filter_by_defaults(&five_channels(), &[], &[]).len(), 5);
    assert_eq!(filter_by_defaults(&five_channels(), &[8], &[6]).len(), 1);
    assert_eq!(filter_by_defaults(&five_channels(), &[5], &[1, 6]).len(), 3);
    assert_eq!(filter_by_defaults(&five_channels(), &[8], &[]).len(), 2);
}

#[test]
fn test_single_value_filter() {
    assert_eq!(filter_channels(&five_channels(), 0, 0).len(), 5);
    assert_eq!(filter_channels(&five_channels(), 1, 0).len(), 2);
    assert_eq!(filter_channels(&five_channels(), 0, 5).len(), 3);
    assert_eq!(filter_channels(&five_channels(), 6, 5).len(), 1);
    assert_eq!(filter_channels(&five_channels(), 9, 8).len(), 1);
    assert_eq!(filter_channels(&five_channels(), 9, 5).len(), 0);
}

#[test]
fn test_format_detection_without_extension() {
    let yaml = b"channels:\n  - id: 7\n    name: Seven\n    url: https://a/7.m3u8\n";
    let parsed = detect_and_parse(yaml, Path::new("channels")).unwrap();
    assert_eq!(parsed[0].id, "cc_7");

    let bare_json = br#"[{"id": 8, "name": "Eight", "url": "https://a/8.m3u8"}]"#;
    let parsed = detect_and_parse(bare_json, Path::new("channels.txt")).unwrap();
    assert_eq!(parsed[0].id, "cc_8");

    let result = detect_and_parse(b"   ", Path::new("channels"));
    assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
}

#[tokio::test]
async fn test_missing_default_file_falls_back_to_built_in() {
    let dir = tempfile::tempdir().unwrap();

    let channels = load_custom_channels(&dir.path().join("custom-channels.json"))
        .await
        .unwrap();
    assert!(!channels.is_empty());
    assert!(channels.iter().all(|c| c.id.starts_with("cc_")));

    let channels = load_custom_channels(&dir.path().join("mine.json")).await.unwrap();
    assert!(channels.is_empty());
}

#[tokio::test]
async fn test_save_then_load() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("channels.json");

    let saved: Vec<Channel> = five_channels()
        .into_iter()
        .map(|mut c| {
            c.id = format!("cc_{}", c.id);
            c.origin = ChannelOrigin::Custom;
            c
        })
        .collect();
    save_custom_channels(&path, &saved).await.unwrap();

    let registry = ChannelRegistry::new(Some(path), 10);
    assert_eq!(registry.load().await.unwrap(), 5);
    assert_eq!(registry.custom_channels(), saved);
    assert_eq!(registry.get("cc_4").unwrap().category, 8);
    assert!(registry.get("3").is_none());
}

#[tokio::test]
async fn test_failed_reload_keeps_previous_channels() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channels.json");
    std::fs::write(&path, br#"[{"id":"1","name":"One","url":"https://a/1.m3u8"}]"#).unwrap();

    let registry = ChannelRegistry::new(Some(path.clone()), 10);
    assert_eq!(registry.load().await.unwrap(), 1);

    std::fs::write(&path, b"{ not json").unwrap();
    assert!(registry.reload().await.is_err());
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_merge_puts_upstream_first_and_dedups_custom_ids() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channels.json");
    std::fs::write(
        &path,
        br#"[
            {"id":"1","name":"First","url":"https://a/1.m3u8"},
            {"id":"2","name":"Second","url":"https://a/2.m3u8"},
            {"id":"1","name":"First again","url":"https://a/1b.m3u8"}
        ]"#,
    )
    .unwrap();

    let registry = ChannelRegistry::new(Some(path), 10);
    registry.load().await.unwrap();

    let merged = registry.merge(vec![channel("144", 12, 6)]);
    let names: Vec<&str> = merged.iter().map(|c| c.name.as_str()).collect();
    assert_eq!(names, ["Channel 144", "First again", "Second"]);
}

async fn spawn_catalog_host() -> String {
    let app = axum::Router::new()
        .route(
            "/channels.json",
            axum::routing::get(|| async {
                "\u{feff}{\"channels\":[{\"id\":\"9\",\"name\":\"Nine\",\"url\":\"https://a/9.m3u8\"}]}"
            }),
        )
        .route(
            "/broken.json",
            axum::routing::get(|| async { "{ not json" }),
        );

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

#[tokio::test]
async fn test_refresh_writes_the_file_and_swaps_the_cache() {
    let host = spawn_catalog_host().await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("channels.json");
    std::fs::write(&path, br#"[{"id":"1","name":"One","url":"https://a/1.m3u8"}]"#).unwrap();

    let registry = ChannelRegistry::new(Some(path.clone()), 10);
    registry.load().await.unwrap();

    let result = registry.refresh_from_url(&format!("{}/broken.json", host)).await;
    assert!(matches!(result, Err(Error::UnsupportedFormat(_))));
    assert!(registry.get("cc_1").is_some());

    let count = registry
        .refresh_from_url(&format!("{}/channels.json", host))
        .await
        .unwrap();
    assert_eq!(count, 1);
    assert!(registry.get("cc_9").is_some());
    assert!(registry.get("cc_1").is_none());

    let on_disk = load_custom_channels(&path).await.unwrap();
    assert_eq!(on_disk[0].id, "cc_9");
    assert!(!dir.path().join("channels.json.tmp").exists());
}
