use std::collections::HashMap;
use std::io::Write;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::{
    Extension, Router,
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::IntoResponse,
    routing::{get, post},
};
use flate2::{Compression, write::GzEncoder};
use tokio::io::AsyncReadExt;
use tvgate::config::AppConfig;
use tvgate::server::dtos::epg_dto::ProgrammePage;
use tvgate::server::dtos::stream_dto::{ApiResponse, StreamResolution};
use tvgate::server::error::Error;
use tvgate::server::services::epg_services::EpgSourceTrait;
use tvgate::server::services::upstream_services::{
    UpstreamService, UpstreamServiceTrait, decode_body, encode_form,
};

/// headers and form of every playback request the fake backend saw
type Seen = Arc<Mutex<Vec<(HeaderMap, String)>>>;

async fn spawn_backend() -> (String, Seen) {
    async fn playback(
        Extension(seen): Extension<Seen>,
        headers: HeaderMap,
        form: String,
    ) -> impl IntoResponse {
        seen.lock().unwrap().push((headers, form.clone()));

        if form.contains("channel_id=419") {
            return (
                StatusCode::from_u16(419).unwrap(),
                r#"{"code":419,"message":"token expired"}"#.to_string(),
            );
        }
        if form.contains("stream_type=Catchup") {
            return (
                StatusCode::OK,
                r#"{"code":200,"result":"https://cdn.example.com/catchup/x.m3u8?hdnea=CU","bitrates":{"auto":"https://cdn.example.com/catchup/auto.m3u8"}}"#.to_string(),
            );
        }
        (
            StatusCode::OK,
            r#"{"code":200,"result":"","bitrates":{"auto":"https://cdn.example.com/144/master.m3u8?hdnea=LIVE","high":"https://cdn.example.com/144/high.m3u8"}}"#.to_string(),
        )
    }

    async fn channels() -> impl IntoResponse {
        r#"{"code":200,"message":"ok","result":[{"channel_id":144,"channel_name":"News 24","logoUrl":"n.png","channelCategoryId":12,"channelLanguageId":6,"isHD":true}]}"#
    }

    async fn guide(Query(query): Query<HashMap<String, String>>) -> impl IntoResponse {
        match query.get("offset").map(String::as_str) {
            Some("0") => (
                StatusCode::OK,
                r#"{"epg":[{"startEpoch":1700000000000,"endEpoch":1700001800000,"showname":"Morning Edition"}]}"#,
            ),
            _ => (StatusCode::NOT_FOUND, ""),
        }
    }

    async fn sl_redirect() -> impl IntoResponse {
        (
            StatusCode::FOUND,
            [(header::LOCATION, "https://stream.example.com/sl9/master.m3u8")],
        )
    }

    let seen: Seen = Arc::default();
    let app = Router::new()
        .route("/playback/apis/v1.1/geturl", post(playback))
        .route("/apis/v3.0/getMobileChannelList/get/", get(channels))
        .route("/apis/v1.3/getepg/get", get(guide))
        .route("/sl/9", get(sl_redirect))
        .layer(Extension(seen.clone()));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (format!("http://{}", addr), seen)
}

/// reads each request and hangs up without a response
async fn spawn_hangup_backend() -> (String, Arc<AtomicU32>) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let accepted = Arc::new(AtomicU32::new(0));

    let counter = accepted.clone();
    tokio::spawn(async move {
        while let Ok((mut socket, _)) = listener.accept().await {
            counter.fetch_add(1, Ordering::SeqCst);
            let mut buf = [0u8; 8192];
            let _ = socket.read(&mut buf).await;
        }
    });

    (format!("http://{}", addr), accepted)
}

fn service_for(base: &str) -> UpstreamService {
    UpstreamService::new(&AppConfig {
        upstream_base_url: Some(base.to_string()),
        access_token: "acc".to_string(),
        crm: "crm1".to_string(),
        unique_id: "u1".to_string(),
        device_id: Some("dev1".to_string()),
        ..Default::default()
    })
}

async fn spawn_cdn() -> String {
    async fn playlist(headers: HeaderMap) -> impl IntoResponse {
        let cookie = headers
            .get(header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder
            .write_all(format!("#EXTM3U\n# cookie {}\n", cookie).as_bytes())
            .unwrap();

        (
            [
                (header::CONTENT_ENCODING, "gzip"),
                (header::SET_COOKIE, "__hdnea__=fresh~hmac=01; path=/"),
            ],
            encoder.finish().unwrap(),
        )
    }

    let app = Router::new()
        .route("/live/index.m3u8", get(playlist))
        .route("/gone.m3u8", get(|| async { (StatusCode::FORBIDDEN, "expired") }));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    format!("http://{}", addr)
}

#[test]
fn test_hdnea_moves_from_auto_to_every_bitrate() {
    let body = br#"{
        "code": 200,
        "result": "",
        "bitrates": {
            "auto": "https://cdn.example.com/144/master.m3u8?hdnea=ABC",
            "high": "https://cdn.example.com/144/high.m3u8",
            "medium": "https://cdn.example.com/144/medium.m3u8?x=1",
            "low": ""
        },
        "isDRM": false
    }"#;

    let mut resolution = ApiResponse::<StreamResolution>::decode(200, body.to_vec())
        .into_result()
        .unwrap();
    resolution.adopt_live_hdnea();

    assert_eq!(resolution.hdnea.as_deref(), Some("ABC"));
    assert_eq!(
        resolution.bitrates.high,
        "https://cdn.example.com/144/high.m3u8?hdnea=ABC"
    );
    assert_eq!(
        resolution.bitrates.medium,
        "https://cdn.example.com/144/medium.m3u8?x=1&hdnea=ABC"
    );
    // empty urls stay empty
    assert_eq!(resolution.bitrates.low, "");
    assert_eq!(resolution.bitrates.auto.matches("hdnea=").count(), 1);
}

#[test]
fn test_catchup_prefers_result_token() {
    let mut resolution = StreamResolution {
        result: "https://cdn.example.com/catchup/x.m3u8?hdnea=FROM_RESULT".to_string(),
        ..Default::default()
    };
    resolution.bitrates.auto = "https://cdn.example.com/catchup/auto.m3u8?hdnea=FROM_AUTO".to_string();
    resolution.adopt_catchup_hdnea();

    assert_eq!(resolution.hdnea.as_deref(), Some("FROM_RESULT"));
}

#[test]
fn test_non_success_is_rejected_not_malformed() {
    let result = ApiResponse::<StreamResolution>::decode(403, b"denied".to_vec()).into_result();
    assert!(matches!(
        result,
        Err(Error::UpstreamRejected { status: 403, .. })
    ));
}

#[test]
fn test_zstd_bodies_are_decoded() {
    let compressed = zstd::encode_all(&b"{\"code\":200}"[..], 3).unwrap();
    assert_eq!(
        decode_body(Some("zstd"), &compressed).unwrap(),
        b"{\"code\":200}"
    );
}

#[test]
fn test_form_encoding() {
    assert_eq!(
        encode_form(&[("stream_type", "Seek"), ("begin", "20240310T120000")]),
        "stream_type=Seek&begin=20240310T120000"
    );
}

#[tokio::test]
async fn test_render_sends_and_refreshes_hdnea_cookie() {
    let base = spawn_cdn().await;
    let upstream = UpstreamService::new(&AppConfig::default());

    let rendered = upstream
        .render(&format!("{}/live/index.m3u8?hdnea=old~hmac=00", base))
        .await
        .unwrap();

    let body = String::from_utf8(rendered.body).unwrap();
    assert!(body.starts_with("#EXTM3U"));
    assert!(body.contains("__hdnea__=old~hmac=00"));
    assert_eq!(rendered.hdnea_cookie.as_deref(), Some("fresh~hmac=01"));
}

#[tokio::test]
async fn test_render_surfaces_upstream_rejection() {
    let base = spawn_cdn().await;
    let upstream = UpstreamService::new(&AppConfig::default());

    let result = upstream.render(&format!("{}/gone.m3u8", base)).await;
    assert!(matches!(
        result,
        Err(Error::UpstreamRejected { status: 403, .. })
    ));
}

#[tokio::test]
async fn test_live_adopts_hdnea_and_sends_the_fixed_headers() {
    let (base, seen) = spawn_backend().await;
    let upstream = service_for(&base);

    let resolution = upstream.live("144").await.unwrap();
    assert_eq!(resolution.hdnea.as_deref(), Some("LIVE"));
    assert_eq!(
        resolution.bitrates.high,
        "https://cdn.example.com/144/high.m3u8?hdnea=LIVE"
    );

    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    let (headers, form) = &seen[0];
    assert!(form.starts_with("channel_id=144&stream_type=Seek&begin="));
    for (name, value) in [
        ("accesstoken", "acc"),
        ("channel_id", "144"),
        ("appkey", "NzNiMDhlYzQyNjJm"),
        ("crmid", "crm1"),
        ("uniqueId", "u1"),
        ("deviceId", "dev1"),
        ("user-agent", "okhttp/4.12.13"),
        ("content-type", "application/x-www-form-urlencoded"),
    ] {
        assert_eq!(headers.get(name).unwrap(), value, "header {}", name);
    }
    assert!(headers.get("srno").is_none());
}

#[tokio::test]
async fn test_catchup_sends_srno_and_takes_the_result_token() {
    let (base, seen) = spawn_backend().await;
    let upstream = service_for(&base);

    let resolution = upstream
        .catchup("144", "240310123", "20240310T120000", "20240310T123000")
        .await
        .unwrap();
    assert_eq!(resolution.hdnea.as_deref(), Some("CU"));
    assert_eq!(
        resolution.bitrates.auto,
        "https://cdn.example.com/catchup/auto.m3u8?hdnea=CU"
    );

    let seen = seen.lock().unwrap();
    let (headers, form) = &seen[0];
    assert_eq!(headers.get("srno").unwrap(), "240310123");
    assert_eq!(
        form,
        "stream_type=Catchup&channel_id=144&programId=240310123&showtime=000000&srno=240310123&begin=20240310T120000&end=20240310T123000"
    );
}

#[tokio::test]
async fn test_structured_rejection_is_not_retried() {
    let (base, seen) = spawn_backend().await;
    let upstream = service_for(&base);

    let result = upstream.live("419").await;
    assert!(matches!(
        result,
        Err(Error::UpstreamRejected { status: 419, ref body }) if body.contains("token expired")
    ));
    assert_eq!(seen.lock().unwrap().len(), 1);
}

#[tokio::test]
async fn test_hangups_use_the_live_and_catchup_bounds() {
    let (base, accepted) = spawn_hangup_backend().await;
    let result = service_for(&base).live("144").await;
    assert!(matches!(
        result,
        Err(Error::TransientNetworkError { attempts: 2, .. })
    ));
    assert_eq!(accepted.load(Ordering::SeqCst), 2);

    let (base, accepted) = spawn_hangup_backend().await;
    let result = service_for(&base)
        .catchup("144", "1", "20240310T120000", "20240310T123000")
        .await;
    assert!(matches!(
        result,
        Err(Error::TransientNetworkError { attempts: 3, .. })
    ));
    assert_eq!(accepted.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn test_sl_channels_resolve_through_the_redirect() {
    let (base, seen) = spawn_backend().await;
    let upstream = service_for(&base)
        .with_sl_channels(vec![("sl9".to_string(), format!("{}/sl/9", base))]);

    let resolution = upstream.live("sl9").await.unwrap();
    assert_eq!(
        resolution.bitrates.auto,
        "https://stream.example.com/sl9/master.m3u8"
    );
    assert!(seen.lock().unwrap().is_empty());

    assert!(matches!(
        upstream.live("sl404").await,
        Err(Error::ChannelNotFound(_))
    ));
}

#[tokio::test]
async fn test_catalog_and_guide_pages_come_from_the_configured_host() {
    let (base, _) = spawn_backend().await;
    let upstream = service_for(&base);

    let channels = upstream.channels().await.unwrap();
    assert_eq!(channels.len(), 1);
    assert_eq!(channels[0].id, "144");
    assert_eq!(channels[0].language, 6);
    assert!(channels[0].is_hd);

    match upstream.programme_page("144", 0).await.unwrap() {
        ProgrammePage::Entries(entries) => {
            assert_eq!(entries.len(), 1);
            assert_eq!(entries[0].showname, "Morning Edition");
        }
        ProgrammePage::NoMorePages => panic!("first page should have entries"),
    }
    assert!(matches!(
        upstream.programme_page("144", 1).await.unwrap(),
        ProgrammePage::NoMorePages
    ));
}
