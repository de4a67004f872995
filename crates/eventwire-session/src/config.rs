use std::sync::Arc;
use std::time::Duration;

use eventwire_codec::{Codec, CodecKind};
use eventwire_frame::{FrameConfig, DEFAULT_CHANNEL};

use crate::handshake::HandshakeConfig;

/// Default outbound queue capacity while a connection is not open.
pub const DEFAULT_QUEUE_CAPACITY: usize = 10_000;

/// Default cap on calls awaiting a reply at the same time.
pub const DEFAULT_MAX_PENDING_ACKS: usize = 65_536;

/// Default ping interval advertised by servers.
pub const DEFAULT_PING_INTERVAL: Duration = Duration::from_secs(25);

/// Default grace period after a missed ping.
pub const DEFAULT_PING_TIMEOUT: Duration = Duration::from_secs(20);

/// Exponential reconnect backoff.
///
/// Attempt `n` (0-based) waits `min(base * 2^n, max)`; with jitter enabled
/// a uniform sample from `[0, delay)` is added and the result capped at `max`
/// again. `max_attempts: None` retries forever.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: Option<u32>,
    pub jitter: bool,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: None,
            jitter: true,
        }
    }
}

impl ReconnectPolicy {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            ..Self::default()
        }
    }

    /// A policy that never retries: the first loss closes the connection.
    pub fn disabled() -> Self {
        Self {
            max_attempts: Some(0),
            ..Self::default()
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Un-jittered delay for a 0-based attempt index.
    pub fn base_delay_for(&self, attempt: u32) -> Duration {
        let shift = attempt.min(20);
        let multiplier = 1_u32 << shift;
        self.base_delay
            .saturating_mul(multiplier)
            .min(self.max_delay)
    }

    /// Inclusive bounds a jittered delay for `attempt` falls in.
    pub fn window(&self, attempt: u32) -> (Duration, Duration) {
        let low = self.base_delay_for(attempt);
        if !self.jitter {
            return (low, low);
        }
        (low, low.saturating_mul(2).min(self.max_delay))
    }

    /// Delay for `attempt` given a jitter sample in `[0, 1)`.
    pub fn jittered(&self, attempt: u32, sample: f64) -> Duration {
        let delay = self.base_delay_for(attempt);
        if !self.jitter {
            return delay;
        }
        let extra = delay.mul_f64(sample.clamp(0.0, 1.0));
        delay.saturating_add(extra).min(self.max_delay)
    }

    /// Delay for `attempt` with a fresh random jitter sample.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        self.jittered(attempt, rand::random::<f64>())
    }

    /// Whether `attempts` consecutive failures use up the retry budget.
    pub fn exhausted(&self, attempts: u32) -> bool {
        matches!(self.max_attempts, Some(max) if attempts >= max)
    }
}

/// Attempt counter over a [`ReconnectPolicy`].
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: ReconnectPolicy,
    attempt: u32,
}

impl Backoff {
    pub fn new(policy: ReconnectPolicy) -> Self {
        Self { policy, attempt: 0 }
    }

    /// Attempts scheduled since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    pub fn exhausted(&self) -> bool {
        self.policy.exhausted(self.attempt)
    }

    /// Delay before the next attempt; advances the counter.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.policy.delay_for(self.attempt);
        self.attempt = self.attempt.saturating_add(1);
        delay
    }
}

/// What to do when the outbound queue is full.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum OverflowPolicy {
    /// Evict the oldest queued frame to make room.
    #[default]
    DropOldest,
    /// Discard the frame being sent.
    DropNewest,
    /// Fail the send with [`crate::SessionError::QueueFull`].
    Reject,
}

/// Client connection settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub codec: Arc<dyn Codec>,
    pub frame: FrameConfig,
    /// Channel the socket's own `on`/`emit`/`call` target.
    pub channel: String,
    pub handshake: HandshakeConfig,
    pub reconnect: ReconnectPolicy,
    /// Used when the server does not advertise an interval. `None` disables pings.
    pub ping_interval: Option<Duration>,
    pub ping_timeout: Duration,
    /// Treat a malformed inbound frame as a lost connection instead of dropping it.
    pub strict: bool,
    pub outbound_queue_capacity: usize,
    pub overflow: OverflowPolicy,
    pub max_pending_acks: usize,
    /// Keep acks sent on a lost connection pending until their own deadline.
    pub resume_pending_on_reconnect: bool,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::default().build(),
            frame: FrameConfig::default(),
            channel: DEFAULT_CHANNEL.to_string(),
            handshake: HandshakeConfig::default(),
            reconnect: ReconnectPolicy::default(),
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            ping_timeout: DEFAULT_PING_TIMEOUT,
            strict: false,
            outbound_queue_capacity: DEFAULT_QUEUE_CAPACITY,
            overflow: OverflowPolicy::default(),
            max_pending_acks: DEFAULT_MAX_PENDING_ACKS,
            resume_pending_on_reconnect: false,
        }
    }
}

impl ClientConfig {
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_codec_kind(self, kind: CodecKind) -> Self {
        self.with_codec(kind.build())
    }

    pub fn with_frame(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_channel(mut self, channel: impl Into<String>) -> Self {
        self.channel = channel.into();
        self
    }

    pub fn with_reconnect(mut self, reconnect: ReconnectPolicy) -> Self {
        self.reconnect = reconnect;
        self
    }

    pub fn with_auth_token(mut self, token: impl Into<String>) -> Self {
        self.handshake.auth_token = Some(token.into());
        self
    }

    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake.timeout = timeout;
        self
    }

    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = Some(interval);
        self.ping_timeout = timeout;
        self
    }

    pub fn without_ping(mut self) -> Self {
        self.ping_interval = None;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_queue(mut self, capacity: usize, overflow: OverflowPolicy) -> Self {
        self.outbound_queue_capacity = capacity;
        self.overflow = overflow;
        self
    }

    pub fn with_max_pending_acks(mut self, max: usize) -> Self {
        self.max_pending_acks = max;
        self
    }

    pub fn with_resume_pending_on_reconnect(mut self, resume: bool) -> Self {
        self.resume_pending_on_reconnect = resume;
        self
    }
}

/// Server settings shared by every accepted socket.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub codec: Arc<dyn Codec>,
    pub frame: FrameConfig,
    pub handshake: HandshakeConfig,
    /// Advertised to clients in CONNECT_OK; also bounds server-side liveness.
    pub ping_interval: Option<Duration>,
    pub ping_timeout: Duration,
    pub strict: bool,
    pub max_pending_acks: usize,
    /// Socket ids are `"{sid_prefix}-{n}"`.
    pub sid_prefix: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            codec: CodecKind::default().build(),
            frame: FrameConfig::default(),
            handshake: HandshakeConfig::default(),
            ping_interval: Some(DEFAULT_PING_INTERVAL),
            ping_timeout: DEFAULT_PING_TIMEOUT,
            strict: false,
            max_pending_acks: DEFAULT_MAX_PENDING_ACKS,
            sid_prefix: "sock".to_string(),
        }
    }
}

impl ServerConfig {
    pub fn with_codec(mut self, codec: Arc<dyn Codec>) -> Self {
        self.codec = codec;
        self
    }

    pub fn with_codec_kind(self, kind: CodecKind) -> Self {
        self.with_codec(kind.build())
    }

    pub fn with_ping(mut self, interval: Duration, timeout: Duration) -> Self {
        self.ping_interval = Some(interval);
        self.ping_timeout = timeout;
        self
    }

    pub fn without_ping(mut self) -> Self {
        self.ping_interval = None;
        self
    }

    pub fn with_strict(mut self, strict: bool) -> Self {
        self.strict = strict;
        self
    }

    pub fn with_frame(mut self, frame: FrameConfig) -> Self {
        self.frame = frame;
        self
    }

    pub fn with_sid_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.sid_prefix = prefix.into();
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn doubles_until_capped() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(1000));
        let delays: Vec<u64> = (0..6)
            .map(|n| policy.base_delay_for(n).as_millis() as u64)
            .collect();
        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn huge_attempts_saturate_at_cap() {
        let policy = ReconnectPolicy::new(Duration::from_secs(1), Duration::from_secs(30));
        assert_eq!(policy.base_delay_for(u32::MAX), Duration::from_secs(30));
    }

    #[test]
    fn jitter_stays_inside_window() {
        let policy = ReconnectPolicy::new(Duration::from_millis(100), Duration::from_millis(1000));
        for attempt in 0..8 {
            let (low, high) = policy.window(attempt);
            for sample in [0.0, 0.25, 0.5, 0.999] {
                let delay = policy.jittered(attempt, sample);
                assert!(delay >= low && delay <= high, "{delay:?} outside {low:?}..={high:?}");
            }
        }
        assert_eq!(policy.jittered(0, 0.5), Duration::from_millis(150));
        assert_eq!(policy.jittered(3, 0.5), Duration::from_millis(1000));
    }

    #[test]
    fn no_jitter_is_deterministic() {
        let policy = ReconnectPolicy::new(Duration::from_millis(50), Duration::from_secs(1))
            .without_jitter();
        assert_eq!(policy.delay_for(2), Duration::from_millis(200));
        assert_eq!(policy.window(2), (Duration::from_millis(200), Duration::from_millis(200)));
    }

    #[test]
    fn budget_accounting() {
        assert!(!ReconnectPolicy::default().exhausted(u32::MAX));
        let policy = ReconnectPolicy::default().with_max_attempts(3);
        assert!(!policy.exhausted(2));
        assert!(policy.exhausted(3));
        assert!(ReconnectPolicy::disabled().exhausted(0));
    }

    #[test]
    fn backoff_counts_and_resets() {
        let mut backoff = Backoff::new(
            ReconnectPolicy::new(Duration::from_millis(10), Duration::from_millis(40))
                .without_jitter()
                .with_max_attempts(2),
        );
        assert_eq!(backoff.next_delay(), Duration::from_millis(10));
        assert_eq!(backoff.next_delay(), Duration::from_millis(20));
        assert!(backoff.exhausted());
        backoff.reset();
        assert_eq!(backoff.attempt(), 0);
        assert!(!backoff.exhausted());
    }

    #[test]
    fn client_config_builders() {
        let config = ClientConfig::default()
            .with_channel("/chat")
            .with_auth_token("secret")
            .with_queue(8, OverflowPolicy::Reject)
            .without_ping();
        assert_eq!(config.channel, "/chat");
        assert_eq!(config.handshake.auth_token.as_deref(), Some("secret"));
        assert_eq!(config.outbound_queue_capacity, 8);
        assert_eq!(config.overflow, OverflowPolicy::Reject);
        assert!(config.ping_interval.is_none());
        assert_eq!(config.codec.name(), "json");
    }
}
