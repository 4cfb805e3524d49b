use clap::Parser;
use std::time::Duration;
use switchboard_core::wire::DEFAULT_MAX_FRAME_BYTES;
use switchboard_core::DEFAULT_LOG_CAPACITY;

pub const DEFAULT_ADDR: &str = "127.0.0.1:8080";
pub const DEFAULT_GEOCODE_URL: &str = "https://nominatim.openstreetmap.org/reverse";
pub const DEFAULT_LOCATION_COMMAND: &str = "getLocation";

#[derive(Clone, Debug)]
pub struct Config {
    pub addr: String,
    pub debug: bool,
    pub allow_remote: bool,
    /// Connections silent for longer than this are closed. `None` disables the reaper.
    pub stale_after: Option<Duration>,
    pub ping_interval: Duration,
    pub write_timeout: Duration,
    pub queue_capacity: usize,
    pub max_frame_bytes: usize,
    /// Disconnected agents older than this are swept from the roster.
    pub inactive_after: Duration,
    pub sweep_interval: Duration,
    pub log_capacity: usize,
    pub log_dir: String,
    pub dispatch: DispatchDefaults,
    pub retention: RetentionConfig,
    pub geocode: Option<GeocodeConfig>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            addr: DEFAULT_ADDR.to_string(),
            debug: false,
            allow_remote: false,
            stale_after: Some(Duration::from_secs(60)),
            ping_interval: Duration::from_secs(20),
            write_timeout: Duration::from_secs(2),
            queue_capacity: 256,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            inactive_after: Duration::from_secs(24 * 60 * 60),
            sweep_interval: Duration::from_secs(60),
            log_capacity: DEFAULT_LOG_CAPACITY,
            log_dir: String::new(),
            dispatch: DispatchDefaults::default(),
            retention: RetentionConfig::default(),
            geocode: None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct DispatchDefaults {
    pub timeout: Duration,
    pub retries: u32,
    pub location_command: String,
    pub location_timeout: Duration,
    pub location_retries: u32,
    pub retry_backoff: Duration,
}

impl Default for DispatchDefaults {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(8_000),
            retries: 0,
            location_command: DEFAULT_LOCATION_COMMAND.to_string(),
            location_timeout: Duration::from_millis(12_000),
            location_retries: 2,
            retry_backoff: Duration::from_millis(700),
        }
    }
}

impl DispatchDefaults {
    pub fn is_location(&self, kind: &str) -> bool {
        kind == self.location_command
    }
}

#[derive(Clone, Debug)]
pub struct RetentionConfig {
    /// Encoded payloads above this size are moved to the blob store.
    pub inline_payload_limit: usize,
    /// Total bytes the blob store may hold before evicting the oldest blobs.
    pub blob_budget: usize,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            inline_payload_limit: 64 * 1024,
            blob_budget: 64 * 1024 * 1024,
        }
    }
}

#[derive(Clone, Debug)]
pub struct GeocodeConfig {
    pub url: String,
    pub user_agent: String,
    pub timeout: Duration,
}

#[derive(Parser, Debug)]
#[command(name = "switchboard-hub")]
pub struct Args {
    #[arg(long, default_value = "")]
    addr: String,
    #[arg(long, default_value_t = false)]
    debug: bool,
    #[arg(long, default_value_t = false)]
    allow_remote: bool,
    #[arg(long, default_value_t = 60)]
    stale_seconds: u64,
    #[arg(long, default_value_t = 20)]
    ping_interval: u64,
    #[arg(long, default_value_t = 2)]
    write_timeout: u64,
    #[arg(long, default_value_t = 256)]
    queue_capacity: usize,
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_BYTES)]
    max_frame_bytes: usize,
    #[arg(long, default_value_t = 24 * 60 * 60)]
    inactive_after: u64,
    #[arg(long, default_value_t = 60)]
    sweep_interval: u64,
    #[arg(long, default_value_t = DEFAULT_LOG_CAPACITY)]
    log_capacity: usize,
    #[arg(long, default_value_t = 700)]
    retry_backoff_ms: u64,
    #[arg(long, default_value = DEFAULT_LOCATION_COMMAND)]
    location_command: String,
    #[arg(long, default_value_t = 64 * 1024)]
    inline_payload_limit: usize,
    #[arg(long, default_value_t = 64 * 1024 * 1024)]
    blob_budget: usize,
    #[arg(long, default_value = "")]
    geocode_url: String,
    #[arg(long, default_value = "switchboard-hub/0.1")]
    geocode_user_agent: String,
    #[arg(long, default_value_t = false)]
    no_geocode: bool,
    #[arg(long, default_value = "")]
    log_dir: String,
}

pub fn load_config() -> Config {
    Config::from_args(Args::parse())
}

impl Config {
    pub fn from_args(args: Args) -> Self {
        let defaults = Config::default();
        let geocode = if args.no_geocode || env_true("SWITCHBOARD_NO_GEOCODE") {
            None
        } else {
            Some(GeocodeConfig {
                url: resolve_geocode_url(&args.geocode_url),
                user_agent: args.geocode_user_agent,
                timeout: Duration::from_secs(5),
            })
        };
        Config {
            addr: resolve_addr(&args.addr),
            debug: args.debug || env_true("SWITCHBOARD_DEBUG"),
            allow_remote: args.allow_remote || env_true("SWITCHBOARD_ALLOW_REMOTE"),
            stale_after: (args.stale_seconds > 0).then(|| Duration::from_secs(args.stale_seconds)),
            ping_interval: Duration::from_secs(args.ping_interval),
            write_timeout: Duration::from_secs(args.write_timeout.max(1)),
            queue_capacity: args.queue_capacity.max(1),
            max_frame_bytes: args.max_frame_bytes,
            inactive_after: Duration::from_secs(args.inactive_after),
            sweep_interval: Duration::from_secs(args.sweep_interval.max(1)),
            log_capacity: args.log_capacity.max(1),
            log_dir: resolve_log_dir(&args.log_dir),
            dispatch: DispatchDefaults {
                location_command: args.location_command,
                retry_backoff: Duration::from_millis(args.retry_backoff_ms),
                ..defaults.dispatch
            },
            retention: RetentionConfig {
                inline_payload_limit: args.inline_payload_limit,
                blob_budget: args.blob_budget,
            },
            geocode,
        }
    }
}

fn env_true(key: &str) -> bool {
    match std::env::var(key) {
        Ok(value) => matches!(
            value.trim().to_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        Err(_) => false,
    }
}

fn env_non_empty(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .filter(|value| !value.trim().is_empty())
}

fn resolve_addr(addr_flag: &str) -> String {
    if !addr_flag.trim().is_empty() {
        return addr_flag.to_string();
    }
    if let Some(value) = env_non_empty("SWITCHBOARD_ADDR") {
        return value;
    }
    if let Some(port) = env_non_empty("PORT") {
        return format!("0.0.0.0:{}", port.trim());
    }
    DEFAULT_ADDR.to_string()
}

fn resolve_log_dir(log_dir_flag: &str) -> String {
    if !log_dir_flag.trim().is_empty() {
        return log_dir_flag.to_string();
    }
    if let Some(value) = env_non_empty("SWITCHBOARD_LOG_DIR") {
        return value;
    }
    ".switchboard/logs".to_string()
}

fn resolve_geocode_url(flag: &str) -> String {
    if !flag.trim().is_empty() {
        return flag.trim_end_matches('/').to_string();
    }
    env_non_empty("SWITCHBOARD_GEOCODE_URL").unwrap_or_else(|| DEFAULT_GEOCODE_URL.to_string())
}
