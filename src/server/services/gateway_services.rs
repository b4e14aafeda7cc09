use std::sync::Arc;
use std::time::Duration;

use tracing::{error, info};

use crate::{
    config::AppConfig,
    server::{
        services::{
            channel_services::ChannelRegistry,
            epg_services::{DynEpgSource, EXTERNAL_EPG_INTERVAL, EXTERNAL_EPG_TASK_ID, EpgService},
            render_services::RenderService,
            scheduler_services::{Scheduler, task},
            upstream_services::{DynUpstreamService, UpstreamService},
        },
        utils::{manifest_utils::ManifestRewriter, secure_url_utils::SecureUrlCodec},
    },
};

pub const CUSTOM_CHANNELS_TASK_ID: &str = "custom-channels-refresh";
pub const CUSTOM_CHANNELS_INTERVAL: Duration = Duration::from_secs(6 * 60 * 60);

/// everything a handler can reach, cloned into every request through an Extension
#[derive(Clone)]
pub struct GatewayServices {
    pub codec: Arc<SecureUrlCodec>,
    pub rewriter: Arc<ManifestRewriter>,
    pub upstream: DynUpstreamService,
    pub registry: Arc<ChannelRegistry>,
    pub epg: Arc<EpgService>,
    pub render: Arc<RenderService>,
    pub scheduler: Scheduler,
    pub config: Arc<AppConfig>,
}

impl GatewayServices {
    pub fn new(config: Arc<AppConfig>) -> Self {
        info!("starting gateway services...");

        let upstream = Arc::new(UpstreamService::new(&config));
        Self::with_upstream(config, upstream.clone(), upstream)
    }

    /// same wiring with the backend swapped out, tests hand in mocks here
    pub fn with_upstream(
        config: Arc<AppConfig>,
        upstream: DynUpstreamService,
        epg_source: DynEpgSource,
    ) -> Self {
        let codec = Arc::new(SecureUrlCodec::new(&config.url_secret));
        info!("url codec ok, starting remaining services...");

        let rewriter = Arc::new(ManifestRewriter::new(
            codec.clone(),
            config.disable_ts_handler,
        ));
        let registry = Arc::new(ChannelRegistry::new(
            config.custom_channels_file.clone(),
            config.max_custom_channels,
        ));
        let epg = Arc::new(EpgService::new(epg_source, config.epg_file()));
        let render = Arc::new(RenderService::new(
            upstream.clone(),
            registry.clone(),
            rewriter.clone(),
        ));

        Self {
            codec,
            rewriter,
            upstream,
            registry,
            epg,
            render,
            scheduler: Scheduler::new(),
            config,
        }
    }

    /// loads the custom channels and arms the periodic jobs the config asks for
    pub async fn start_background_jobs(&self) {
        if let Err(e) = self.registry.load().await {
            error!("custom channels not loaded: {}", e);
        }

        if let Some(url) = self.config.custom_channels_url.clone() {
            let registry = self.registry.clone();
            self.scheduler.add_recurring(
                CUSTOM_CHANNELS_TASK_ID,
                CUSTOM_CHANNELS_INTERVAL,
                task(move || {
                    let registry = registry.clone();
                    let url = url.clone();
                    async move {
                        let count = registry.refresh_from_url(&url).await?;
                        info!("custom channels refreshed, {} cached", count);
                        Ok(())
                    }
                }),
            );
        }

        if let Some(url) = self.config.epg_url.clone() {
            if let Err(e) = self.epg.download_external(&url).await {
                error!("initial external epg download failed: {}", e);
            }

            let epg = self.epg.clone();
            self.scheduler.add_recurring(
                EXTERNAL_EPG_TASK_ID,
                EXTERNAL_EPG_INTERVAL,
                task(move || {
                    let epg = epg.clone();
                    let url = url.clone();
                    async move {
                        epg.download_external(&url).await?;
                        Ok(())
                    }
                }),
            );
        } else if self.config.epg {
            self.epg.init(&self.scheduler).await;
        }
    }
}
