use std::path::PathBuf;

#[derive(clap::ValueEnum, Clone, Debug, Copy)]
pub enum CargoEnv {
    Development,
    Production,
}

#[derive(clap::Parser, Clone, Debug)]
pub struct AppConfig {
    // production or development
    #[clap(long, env, value_enum)]
    pub cargo_env: CargoEnv,

    // port that the gateway will bind to
    #[clap(long, env, default_value = "5001")]
    pub port: u16,

    // secret the url token key is derived from, anything long and random works
    // like 'openssl rand -base64 32'. changing it kills every token already handed out
    #[clap(long, env)]
    pub url_secret: String,

    // upstream session credentials, these come from the login flow which lives elsewhere
    #[clap(long, env, default_value = "")]
    pub access_token: String,

    #[clap(long, env, default_value = "")]
    pub sso_token: String,

    #[clap(long, env, default_value = "")]
    pub crm: String,

    #[clap(long, env, default_value = "")]
    pub unique_id: String,

    // generated once per process when missing
    #[clap(long, env)]
    pub device_id: Option<String>,

    // everything the gateway writes (epg, logs) lands under here
    #[clap(long, env, default_value = ".tvgate")]
    pub path_prefix: PathBuf,

    #[clap(long, env, default_value = "configs/custom-channels.json")]
    pub custom_channels_file: Option<PathBuf>,

    // optional remote json that periodically replaces the custom channels file
    #[clap(long, env)]
    pub custom_channels_url: Option<String>,

    // soft limit, going over it only logs a warning
    #[clap(long, env, default_value = "1000")]
    pub max_custom_channels: usize,

    // hand segments and keys straight to the upstream instead of routing them through us
    #[clap(long, env)]
    pub disable_ts_handler: bool,

    // generate the epg locally
    #[clap(long, env)]
    pub epg: bool,

    // download a prebuilt epg instead of generating one
    #[clap(long, env)]
    pub epg_url: Option<String>,

    // comma seperated lists like 5,8,12
    #[clap(long, env, value_delimiter = ',')]
    pub default_categories: Vec<i32>,

    #[clap(long, env, value_delimiter = ',')]
    pub default_languages: Vec<i32>,

    #[clap(long, env, default_value = "30")]
    pub upstream_timeout_secs: u64,

    // points the playback, channel list and guide apis at one host instead of the real ones,
    // e.g. a local stand-in like http://127.0.0.1:9000
    #[clap(long, env)]
    pub upstream_base_url: Option<String>,

    // this should be either * for allowing everything, or a comma seperated list of domains like
    // example.com,something.com
    #[clap(long, env, default_value = "*")]
    pub cors_origin: String,

    // optional sentry integration
    #[clap(long, env)]
    pub sentry_dsn: Option<String>,
}

impl AppConfig {
    pub fn epg_file(&self) -> PathBuf {
        self.path_prefix.join("epg.xml.gz")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.path_prefix.join("logs")
    }
}

impl Default for AppConfig {
    // used by tests and as a bad fallback
    fn default() -> Self {
        Self {
            cargo_env: CargoEnv::Development,
            port: 5001,
            url_secret: "default-url-secret".to_string(),
            access_token: String::new(),
            sso_token: String::new(),
            crm: String::new(),
            unique_id: String::new(),
            device_id: None,
            path_prefix: PathBuf::from(".tvgate"),
            custom_channels_file: None,
            custom_channels_url: None,
            max_custom_channels: 1000,
            disable_ts_handler: false,
            epg: false,
            epg_url: None,
            default_categories: Vec::new(),
            default_languages: Vec::new(),
            upstream_timeout_secs: 30,
            upstream_base_url: None,
            cors_origin: "*".to_string(),
            sentry_dsn: None,
        }
    }
}
