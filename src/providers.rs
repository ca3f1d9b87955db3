//! Pull-based collaborators consulted by shards and the manager
//!
//! Presence is asked for at identify time; gateway sizing is polled by the
//! resharding loop and used once at startup to size the fleet.

use crate::error::GatewayError;
use crate::gateway::PresenceUpdate;
use futures_util::future::BoxFuture;
use twilight_http::Client;

/// Supplies the presence a shard announces when it identifies
pub trait PresenceProvider: Send + Sync + 'static {
    fn presence(&self, shard_id: u32, worker_id: Option<u32>) -> Option<PresenceUpdate>;
}

impl<F> PresenceProvider for F
where
    F: Fn(u32, Option<u32>) -> Option<PresenceUpdate> + Send + Sync + 'static,
{
    fn presence(&self, shard_id: u32, worker_id: Option<u32>) -> Option<PresenceUpdate> {
        self(shard_id, worker_id)
    }
}

/// Identify budget reported by the gateway
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionStartLimit {
    pub total: u64,
    pub remaining: u64,
    /// Milliseconds until `remaining` resets
    pub reset_after: u64,
    pub max_concurrency: u64,
}

/// Gateway sizing guidance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayInfo {
    pub url: String,
    pub recommended_shards: u32,
    pub session_start_limit: SessionStartLimit,
}

/// Source of gateway sizing guidance
pub trait GatewayInfoProvider: Send + Sync + 'static {
    fn get_info(&self) -> BoxFuture<'_, Result<GatewayInfo, GatewayError>>;
}

/// `GET /gateway/bot` through twilight-http
pub struct TwilightInfoProvider {
    client: Client,
}

impl TwilightInfoProvider {
    pub fn new(token: String) -> Self {
        Self {
            client: Client::new(token),
        }
    }
}

impl GatewayInfoProvider for TwilightInfoProvider {
    fn get_info(&self) -> BoxFuture<'_, Result<GatewayInfo, GatewayError>> {
        Box::pin(async move {
            let info = self
                .client
                .gateway()
                .authed()
                .await
                .map_err(|e| GatewayError::GatewayInfo(Box::new(e)))?
                .model()
                .await
                .map_err(|e| GatewayError::GatewayInfo(Box::new(e)))?;

            let shards = u64::from(info.shards);
            let recommended_shards =
                u32::try_from(shards).map_err(|_| GatewayError::ShardIdOverflow { value: shards })?;

            let limit = &info.session_start_limit;
            Ok(GatewayInfo {
                url: info.url,
                recommended_shards,
                session_start_limit: SessionStartLimit {
                    total: u64::from(limit.total),
                    remaining: u64::from(limit.remaining),
                    reset_after: u64::from(limit.reset_after),
                    max_concurrency: u64::from(limit.max_concurrency),
                },
            })
        })
    }
}
