//! Gateway configuration module
//!
//! Two layers: [`GatewayConfig`] is what the binary loads from the
//! environment, the `*Options` types are what the library consumes.

use crate::error::GatewayError;
use crate::gateway::redact::mask_token;
use crate::gateway::{versioned_url, IdentifyProperties, DEFAULT_API_VERSION, DEFAULT_GATEWAY_URL};
use crate::providers::{GatewayInfoProvider, PresenceProvider};
use std::env;
use std::fmt;
use std::ops::Range;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use twilight_model::gateway::Intents;

/// Default spacing between two connection attempts.
///
/// The gateway allows one identify per 5 seconds per concurrency bucket;
/// the extra 300ms absorbs clock jitter during mass reconnects.
pub const DEFAULT_SPAWN_SHARD_DELAY: Duration = Duration::from_millis(5300);

/// Send-side rate limit window of the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitOptions {
    /// Frames the gateway accepts per window
    pub max_requests_per_tick: u32,
    /// Window length
    pub reset_interval: Duration,
}

impl Default for RateLimitOptions {
    fn default() -> Self {
        Self {
            max_requests_per_tick: 120,
            reset_interval: Duration::from_secs(60),
        }
    }
}

/// Bootstrap options shared by every shard of a fleet
#[derive(Clone)]
pub struct ShardOptions {
    pub token: String,
    /// Base gateway URL used when no resume URL is known
    pub url: String,
    pub version: u8,
    pub intents: Intents,
    pub properties: IdentifyProperties,
    /// Ask the gateway for per-frame zlib compression
    pub compress: bool,
    pub ratelimit: RateLimitOptions,
    /// Identifies this process among several running the same bot
    pub worker_id: Option<u32>,
    pub presence: Option<Arc<dyn PresenceProvider>>,
}

impl ShardOptions {
    pub fn new(token: impl Into<String>, intents: Intents) -> Self {
        Self {
            token: token.into(),
            url: DEFAULT_GATEWAY_URL.to_string(),
            version: DEFAULT_API_VERSION,
            intents,
            properties: IdentifyProperties::default(),
            compress: false,
            ratelimit: RateLimitOptions::default(),
            worker_id: None,
            presence: None,
        }
    }
}

impl fmt::Debug for ShardOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ShardOptions")
            .field("token", &mask_token(&self.token))
            .field("url", &self.url)
            .field("version", &self.version)
            .field("intents", &self.intents)
            .field("properties", &self.properties)
            .field("compress", &self.compress)
            .field("ratelimit", &self.ratelimit)
            .field("worker_id", &self.worker_id)
            .field("presence", &self.presence.is_some())
            .finish()
    }
}

/// Live resharding settings
#[derive(Clone)]
pub struct ReshardingOptions {
    pub info: Arc<dyn GatewayInfoProvider>,
    /// How often to poll the recommended shard count
    pub interval: Duration,
    /// Reshard once the recommendation drifts more than this many percent
    pub percentage: f64,
}

impl fmt::Debug for ReshardingOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReshardingOptions")
            .field("interval", &self.interval)
            .field("percentage", &self.percentage)
            .finish_non_exhaustive()
    }
}

/// Everything a [`crate::ShardManager`] needs
#[derive(Debug, Clone)]
pub struct ManagerOptions {
    pub shard: ShardOptions,
    pub total_shards: u32,
    /// First shard index owned by this process
    pub shard_start: u32,
    /// One past the last owned index; `None` means `total_shards`
    pub shard_end: Option<u32>,
    pub spawn_shard_delay: Duration,
    pub resharding: Option<ReshardingOptions>,
}

impl ManagerOptions {
    pub fn new(shard: ShardOptions, total_shards: u32) -> Self {
        Self {
            shard,
            total_shards,
            shard_start: 0,
            shard_end: None,
            spawn_shard_delay: DEFAULT_SPAWN_SHARD_DELAY,
            resharding: None,
        }
    }

    /// Indices owned by this process
    pub fn shard_range(&self) -> Range<u32> {
        self.shard_start..self.shard_end.unwrap_or(self.total_shards)
    }

    /// Whether this process owns the whole fleet
    pub fn owns_all_shards(&self) -> bool {
        self.shard_range() == (0..self.total_shards)
    }

    /// Reject configurations the gateway would refuse anyway
    pub fn validate(&self) -> Result<(), GatewayError> {
        if self.shard.token.is_empty() {
            return Err(GatewayError::Config("token must not be empty".to_string()));
        }
        versioned_url(&self.shard.url, self.shard.version)
            .map_err(|e| GatewayError::Config(format!("invalid gateway url '{}': {e}", self.shard.url)))?;
        if self.total_shards == 0 {
            return Err(GatewayError::Config("total_shards must be at least 1".to_string()));
        }
        let range = self.shard_range();
        if range.is_empty() || range.end > self.total_shards {
            return Err(GatewayError::Config(format!(
                "shard range {}..{} must be non-empty and within 0..{}",
                range.start, range.end, self.total_shards
            )));
        }
        if self.shard.ratelimit.reset_interval.is_zero() {
            return Err(GatewayError::Config("rate limit reset interval must be > 0".to_string()));
        }
        if let Some(resharding) = &self.resharding {
            if resharding.interval.is_zero() {
                return Err(GatewayError::Config("resharding interval must be > 0".to_string()));
            }
            if !(resharding.percentage > 0.0) {
                return Err(GatewayError::Config("resharding percentage must be > 0".to_string()));
            }
        }
        Ok(())
    }
}

/// Process configuration
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Discord bot token
    pub discord_token: String,

    /// Base gateway URL
    pub gateway_url: String,

    /// Gateway API version
    pub gateway_version: u8,

    /// Gateway intents
    pub intents: Intents,

    /// Request per-frame zlib compression
    pub compress: bool,

    /// Send-side rate limit window
    pub ratelimit: RateLimitOptions,

    /// Spacing between connection attempts
    pub spawn_shard_delay: Duration,

    /// Total shards across all processes; `None` asks the gateway
    pub total_shards: Option<u32>,

    /// Owned shard range
    pub shard_start: u32,
    pub shard_end: Option<u32>,

    /// Poll interval for live resharding; `None` disables it
    pub resharding_interval: Option<Duration>,

    /// Drift threshold for live resharding
    pub resharding_percentage: f64,

    /// Worker id passed to the presence provider
    pub worker_id: Option<u32>,

    /// Verbose protocol logging
    pub debug: bool,

    /// NATS server URL(s) - comma-separated for multiple servers
    pub nats_url: Option<String>,

    /// Health/metrics HTTP port
    pub http_port: u16,

    /// Log level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl GatewayConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self, GatewayError> {
        dotenvy::dotenv().ok();

        let discord_token = env::var("DISCORD_TOKEN")
            .or_else(|_| env::var("DISCORD_BOT_TOKEN"))
            .map_err(|_| {
                GatewayError::Config("DISCORD_TOKEN or DISCORD_BOT_TOKEN must be set".to_string())
            })?;

        let gateway_url = env::var("GATEWAY_URL").unwrap_or_else(|_| DEFAULT_GATEWAY_URL.to_string());
        let gateway_version = parse_var("GATEWAY_VERSION", DEFAULT_API_VERSION)?;

        let intents = match env::var("GATEWAY_INTENTS") {
            Ok(bits) => Intents::from_bits_truncate(bits.parse().map_err(|e| {
                GatewayError::Config(format!("GATEWAY_INTENTS must be a bitfield: {e}"))
            })?),
            Err(_) => Self::default_intents(),
        };

        let compress = parse_var("GATEWAY_COMPRESS", false)?;

        let defaults = RateLimitOptions::default();
        let ratelimit = RateLimitOptions {
            max_requests_per_tick: parse_var("RATELIMIT_MAX_REQUESTS", defaults.max_requests_per_tick)?,
            reset_interval: Duration::from_millis(parse_var(
                "RATELIMIT_RESET_INTERVAL_MS",
                defaults.reset_interval.as_millis() as u64,
            )?),
        };

        let spawn_shard_delay = Duration::from_millis(parse_var(
            "SPAWN_SHARD_DELAY_MS",
            DEFAULT_SPAWN_SHARD_DELAY.as_millis() as u64,
        )?);

        let total_shards = parse_optional_var::<u64>("TOTAL_SHARDS")?
            .map(shard_index)
            .transpose()?;
        let shard_start = shard_index(parse_var("SHARD_START", 0u64)?)?;
        let shard_end = parse_optional_var::<u64>("SHARD_END")?
            .map(shard_index)
            .transpose()?;

        let resharding_interval =
            parse_optional_var::<u64>("RESHARDING_INTERVAL_MS")?.map(Duration::from_millis);
        let resharding_percentage = parse_var("RESHARDING_PERCENTAGE", 80.0)?;

        let worker_id = parse_optional_var("WORKER_ID")?;
        let debug = parse_var("DEBUG", false)?;

        let nats_url = env::var("NATS_URL").ok();

        let http_port = env::var("HTTP_PORT")
            .or_else(|_| env::var("METRICS_PORT")) // Backwards compat
            .unwrap_or_else(|_| "9090".to_string())
            .parse()
            .map_err(|e| GatewayError::Config(format!("HTTP_PORT must be a valid port number: {e}")))?;

        let log_level = if debug {
            "debug".to_string()
        } else {
            env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
        };

        Ok(Self {
            discord_token,
            gateway_url,
            gateway_version,
            intents,
            compress,
            ratelimit,
            spawn_shard_delay,
            total_shards,
            shard_start,
            shard_end,
            resharding_interval,
            resharding_percentage,
            worker_id,
            debug,
            nats_url,
            http_port,
            log_level,
        })
    }

    /// Default Discord intents
    ///
    /// - GUILDS: Required for guild lifecycle events
    /// - GUILD_MEMBERS: Required for member events (privileged)
    pub fn default_intents() -> Intents {
        Intents::GUILDS | Intents::GUILD_MEMBERS
    }

    /// Shard bootstrap options derived from this configuration
    pub fn shard_options(&self) -> ShardOptions {
        ShardOptions {
            url: self.gateway_url.clone(),
            version: self.gateway_version,
            compress: self.compress,
            ratelimit: self.ratelimit,
            worker_id: self.worker_id,
            ..ShardOptions::new(self.discord_token.clone(), self.intents)
        }
    }

    /// Manager options for a fleet of `total_shards`
    pub fn manager_options(
        &self,
        total_shards: u32,
        info: Option<Arc<dyn GatewayInfoProvider>>,
    ) -> ManagerOptions {
        let resharding = match (self.resharding_interval, info) {
            (Some(interval), Some(info)) => Some(ReshardingOptions {
                info,
                interval,
                percentage: self.resharding_percentage,
            }),
            _ => None,
        };

        ManagerOptions {
            shard_start: self.shard_start,
            shard_end: self.shard_end,
            spawn_shard_delay: self.spawn_shard_delay,
            resharding,
            ..ManagerOptions::new(self.shard_options(), total_shards)
        }
    }
}

fn parse_var<T>(key: &str, default: T) -> Result<T, GatewayError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    Ok(parse_optional_var(key)?.unwrap_or(default))
}

fn parse_optional_var<T>(key: &str) -> Result<Option<T>, GatewayError>
where
    T: FromStr,
    T::Err: fmt::Display,
{
    match env::var(key) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| GatewayError::Config(format!("{key} is invalid: {e}"))),
        Err(_) => Ok(None),
    }
}

/// Shard indices travel as u32 on the wire
fn shard_index(value: u64) -> Result<u32, GatewayError> {
    u32::try_from(value).map_err(|_| GatewayError::ShardIdOverflow { value })
}
