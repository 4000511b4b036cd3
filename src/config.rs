use std::time::Duration;

use bon::Builder;

use crate::backoff::BackoffPolicy;

/// Time allowed between starting a connection attempt and the socket reporting open.
pub const CONNECT_TIMEOUT: Duration = Duration::from_millis(5000);

const DEFAULT_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);
const DEFAULT_MAX_RECONNECT_DELAY: Duration = Duration::from_secs(8 * 60);
const DEFAULT_IGNORE_SKIPPED_COUNTER_INTERVAL: Duration = Duration::from_secs(60);
const DEFAULT_COUNTER_PROBE_MIN_INTERVAL: Duration = Duration::from_secs(1);

/// Subprotocol requested when the socket is created.
pub const DEFAULT_PROTOCOL: &str = "rtc-events-1.0";

/// Attempts made to replay missed events before accepting the gap.
pub const MAX_REPLAY_RETRIES: u32 = 8;

/// What happens when an `Event.replay` request fails.
#[non_exhaustive]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ReplayRetryPolicy {
    /// Retry with the replay backoff up to [`MAX_REPLAY_RETRIES`] times
    Enabled,
    /// Log the failure and accept that some events for this gap are lost; the next query
    /// refresh of the owning cache reconciles them
    #[default]
    Disabled,
}

/// Configuration for the socket manager.
#[non_exhaustive]
#[derive(Clone, Debug, Builder)]
pub struct Config {
    /// How long the socket may stay silent before a `Counter.read` probe is sent
    #[builder(default = DEFAULT_KEEPALIVE_INTERVAL)]
    pub(crate) keepalive_interval: Duration,
    /// Ceiling for the un-jittered reconnect delay. Keep this below any upstream liveness
    /// interval so slow background retries are never mistaken for being offline.
    #[builder(default = DEFAULT_MAX_RECONNECT_DELAY)]
    pub(crate) max_reconnect_delay: Duration,
    #[builder(default)]
    pub(crate) replay_retries: ReplayRetryPolicy,
    /// Whether `Presence.update` setting status to `auto` follows every presence subscription
    #[builder(default = true)]
    pub(crate) presence_enabled: bool,
    #[builder(default = DEFAULT_PROTOCOL.to_owned(), into)]
    pub(crate) protocol: String,
    /// Version reported in the connect URL and to the session validator
    #[builder(default = env!("CARGO_PKG_VERSION").to_owned(), into)]
    pub(crate) client_version: String,
    /// Skipped counters seen within this window of the last handled skip are ignored
    #[builder(default = DEFAULT_IGNORE_SKIPPED_COUNTER_INTERVAL)]
    pub(crate) ignore_skipped_counter_interval: Duration,
    /// `Counter.read` requests closer together than this are coalesced
    #[builder(default = DEFAULT_COUNTER_PROBE_MIN_INTERVAL)]
    pub(crate) counter_probe_min_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Config::builder().build()
    }
}

impl Config {
    #[must_use]
    pub fn keepalive_interval(&self) -> Duration {
        self.keepalive_interval
    }

    #[must_use]
    pub fn replay_retries(&self) -> ReplayRetryPolicy {
        self.replay_retries
    }

    #[must_use]
    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    #[must_use]
    pub fn client_version(&self) -> &str {
        &self.client_version
    }

    #[must_use]
    pub fn reconnect_backoff(&self) -> BackoffPolicy {
        BackoffPolicy::reconnect(self.max_reconnect_delay)
    }
}
