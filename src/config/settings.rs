use std::collections::HashMap;
use std::env;
use std::time::Duration;

use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub server: ServerConfig,
    pub jwt: JwtConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub pool: PoolConfig,
    #[serde(default)]
    pub ssh: SshConfig,
    #[serde(default)]
    pub circuit_breaker: CircuitBreakerSettings,
    #[serde(default)]
    pub websocket: WebSocketConfig,
    #[serde(default)]
    pub compression: CompressionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    /// Quota overrides keyed by tier name
    #[serde(default)]
    pub tiers: HashMap<String, TierQuota>,
    #[serde(default)]
    pub otel: OtelConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default)]
    pub cors_origins: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JwtConfig {
    pub secret: String,
    pub issuer: Option<String>,
    pub audience: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApiConfig {
    /// Key required on the admin routes; unset leaves them open (development)
    pub key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    /// Cap on pooled SSH sessions per user
    #[serde(default = "default_max_connections_per_user")]
    pub max_connections_per_user: usize,
    /// Evict an idle pooled session after this many milliseconds
    #[serde(default = "default_max_idle_time_ms")]
    pub max_idle_time_ms: u64,
    /// Sweep frequency in milliseconds
    #[serde(default = "default_cleanup_interval_ms")]
    pub cleanup_interval_ms: u64,
    /// How long shutdown waits for in-flight forwards
    #[serde(default = "default_drain_timeout_ms")]
    pub drain_timeout_ms: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SshConfig {
    /// Concurrent forwards per SSH session
    #[serde(default = "default_max_channels")]
    pub max_channels: u32,
    #[serde(default = "default_keep_alive_interval_ms")]
    pub keep_alive_interval_ms: u64,
    #[serde(default = "default_keep_alive_timeout_ms")]
    pub keep_alive_timeout_ms: u64,
    /// Consecutive missed keep-alive replies before a session is stale
    #[serde(default = "default_keep_alive_max_missed")]
    pub keep_alive_max_missed: u32,
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
    #[serde(default = "default_forward_timeout_ms")]
    pub forward_timeout_ms: u64,
    /// Grace period for in-flight channels when a session closes
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    #[serde(default = "default_max_response_bytes")]
    pub max_response_bytes: usize,
    /// Command executed on the remote endpoint for each forwarded request
    #[serde(default = "default_forward_command")]
    pub forward_command: String,
    /// Remote endpoint per user id
    #[serde(default)]
    pub endpoints: HashMap<String, EndpointConfig>,
    /// Endpoint used for users without an explicit entry
    #[serde(default)]
    pub default_endpoint: Option<EndpointConfig>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EndpointConfig {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub passphrase: Option<String>,
    /// Pinned server key, base64 of the public key blob
    pub host_key: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CircuitBreakerSettings {
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Per-call timeout in milliseconds
    #[serde(default = "default_breaker_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,
    #[serde(default = "default_half_open_max_probes")]
    pub half_open_max_probes: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebSocketConfig {
    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    #[serde(default = "default_max_missed_pongs")]
    pub max_missed_pongs: u32,
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: usize,
    #[serde(default = "default_warn_threshold")]
    pub warn_threshold: usize,
    #[serde(default = "default_close_timeout_ms")]
    pub close_timeout_ms: u64,
    /// Capacity of the per-connection outbound queue
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CompressionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// DEFLATE level, 0-9
    #[serde(default = "default_compression_level")]
    pub level: u32,
    /// Messages smaller than this many bytes are sent uncompressed
    #[serde(default = "default_compression_threshold")]
    pub threshold: usize,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Sustained inbound messages per second, per user and per IP
    #[serde(default = "default_messages_per_second")]
    pub messages_per_second: u32,
    #[serde(default = "default_burst_size")]
    pub burst_size: u32,
    /// Unused buckets are dropped after this many seconds
    #[serde(default = "default_bucket_ttl_seconds")]
    pub bucket_ttl_seconds: u64,
    /// How often stale buckets are swept
    #[serde(default = "default_bucket_cleanup_interval_seconds")]
    pub cleanup_interval_seconds: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TierQuota {
    pub max_connections_per_user: Option<usize>,
    pub max_channels: Option<u32>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct OtelConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default = "default_otel_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_service_name")]
    pub service_name: String,
    #[serde(default = "default_sampling_ratio")]
    pub sampling_ratio: f64,
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_max_connections_per_user() -> usize {
    3
}

fn default_max_idle_time_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_cleanup_interval_ms() -> u64 {
    30_000
}

fn default_drain_timeout_ms() -> u64 {
    10_000
}

fn default_max_channels() -> u32 {
    10
}

fn default_keep_alive_interval_ms() -> u64 {
    60_000
}

fn default_keep_alive_timeout_ms() -> u64 {
    10_000
}

fn default_keep_alive_max_missed() -> u32 {
    3
}

fn default_connect_timeout_ms() -> u64 {
    4_000 // a cold acquire runs inside the breaker timeout too
}

fn default_forward_timeout_ms() -> u64 {
    4_000 // below the breaker timeout so the session reports first
}

fn default_close_grace_ms() -> u64 {
    5_000
}

fn default_max_response_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_forward_command() -> String {
    "tunnel-agent forward".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

fn default_failure_threshold() -> u32 {
    5
}

fn default_success_threshold() -> u32 {
    2
}

fn default_breaker_timeout_ms() -> u64 {
    5_000
}

fn default_reset_timeout_ms() -> u64 {
    60_000
}

fn default_half_open_max_probes() -> u32 {
    1
}

fn default_ping_interval_ms() -> u64 {
    30_000
}

fn default_pong_timeout_ms() -> u64 {
    5_000
}

fn default_max_missed_pongs() -> u32 {
    3
}

fn default_max_frame_size() -> usize {
    1024 * 1024 // 1 MiB
}

fn default_warn_threshold() -> usize {
    512 * 1024
}

fn default_close_timeout_ms() -> u64 {
    5_000
}

fn default_outbound_buffer() -> usize {
    64
}

fn default_compression_level() -> u32 {
    6
}

fn default_compression_threshold() -> usize {
    1024
}

fn default_messages_per_second() -> u32 {
    20
}

fn default_burst_size() -> u32 {
    40
}

fn default_bucket_cleanup_interval_seconds() -> u64 {
    60
}

fn default_bucket_ttl_seconds() -> u64 {
    300
}

fn default_otel_endpoint() -> String {
    "http://localhost:4317".to_string()
}

fn default_service_name() -> String {
    "ssh-tunnel-gateway".to_string()
}

fn default_sampling_ratio() -> f64 {
    1.0
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        // Load .env file if exists
        let _ = dotenvy::dotenv();

        let run_mode = env::var("RUN_MODE").unwrap_or_else(|_| "development".into());

        let builder = Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 8080)?
            .add_source(File::with_name("config/default").required(false))
            .add_source(File::with_name(&format!("config/{}", run_mode)).required(false))
            // POOL__MAX_IDLE_TIME_MS, JWT__SECRET, CIRCUIT_BREAKER__TIMEOUT_MS, ...
            .add_source(
                Environment::default()
                    .separator("__")
                    .try_parsing(true)
                    .list_separator(",")
                    .with_list_parse_key("server.cors_origins"),
            );

        let settings: Settings = builder.build()?.try_deserialize()?;
        settings.validate()?;
        Ok(settings)
    }

    /// Reject combinations the runtime cannot honour
    pub fn validate(&self) -> Result<(), ConfigError> {
        let fail = |msg: &str| Err(ConfigError::Message(msg.to_string()));

        if self.pool.max_connections_per_user == 0 {
            return fail("pool.max_connections_per_user must be at least 1");
        }
        if self.ssh.max_channels == 0 {
            return fail("ssh.max_channels must be at least 1");
        }
        if self.ssh.keep_alive_max_missed == 0 {
            return fail("ssh.keep_alive_max_missed must be at least 1");
        }
        if self.circuit_breaker.failure_threshold == 0
            || self.circuit_breaker.success_threshold == 0
            || self.circuit_breaker.half_open_max_probes == 0
        {
            return fail("circuit breaker thresholds must be at least 1");
        }
        if self.compression.level > 9 {
            return fail("compression.level must be between 0 and 9");
        }
        if self.websocket.warn_threshold > self.websocket.max_frame_size {
            return fail("websocket.warn_threshold must not exceed websocket.max_frame_size");
        }
        if self.websocket.pong_timeout_ms >= self.websocket.ping_interval_ms {
            return fail("websocket.pong_timeout_ms must be shorter than websocket.ping_interval_ms");
        }
        if self.websocket.max_missed_pongs == 0 {
            return fail("websocket.max_missed_pongs must be at least 1");
        }
        for (name, timeout_ms) in self.ssh_timeouts_not_below_breaker() {
            tracing::warn!(
                setting = name,
                timeout_ms = timeout_ms,
                breaker_timeout_ms = self.circuit_breaker.timeout_ms,
                "SSH timeout is not below the breaker timeout; breaker will cut the call first"
            );
        }
        Ok(())
    }

    /// SSH timeouts that the breaker's call timeout would pre-empt
    pub fn ssh_timeouts_not_below_breaker(&self) -> Vec<(&'static str, u64)> {
        [
            ("ssh.connect_timeout_ms", self.ssh.connect_timeout_ms),
            ("ssh.forward_timeout_ms", self.ssh.forward_timeout_ms),
        ]
        .into_iter()
        .filter(|(_, timeout_ms)| *timeout_ms >= self.circuit_breaker.timeout_ms)
        .collect()
    }

    pub fn server_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

impl RateLimitConfig {
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds.max(1))
    }
}

impl PoolConfig {
    pub fn max_idle_time(&self) -> Duration {
        Duration::from_millis(self.max_idle_time_ms)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_millis(self.cleanup_interval_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}

impl SshConfig {
    pub fn keep_alive_interval(&self) -> Duration {
        Duration::from_millis(self.keep_alive_interval_ms)
    }

    pub fn keep_alive_timeout(&self) -> Duration {
        Duration::from_millis(self.keep_alive_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn forward_timeout(&self) -> Duration {
        Duration::from_millis(self.forward_timeout_ms)
    }

    pub fn close_grace(&self) -> Duration {
        Duration::from_millis(self.close_grace_ms)
    }

    /// Endpoint for a user, falling back to the default endpoint
    pub fn endpoint_for(&self, user_id: &str) -> Option<&EndpointConfig> {
        self.endpoints
            .get(user_id)
            .or(self.default_endpoint.as_ref())
    }
}

impl WebSocketConfig {
    pub fn ping_interval(&self) -> Duration {
        Duration::from_millis(self.ping_interval_ms)
    }

    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.pong_timeout_ms)
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// Worst-case time to notice a dead peer
    pub fn dead_peer_detection_latency(&self) -> Duration {
        self.ping_interval() * self.max_missed_pongs + self.pong_timeout()
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            cors_origins: vec![],
        }
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections_per_user: default_max_connections_per_user(),
            max_idle_time_ms: default_max_idle_time_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            drain_timeout_ms: default_drain_timeout_ms(),
        }
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            max_channels: default_max_channels(),
            keep_alive_interval_ms: default_keep_alive_interval_ms(),
            keep_alive_timeout_ms: default_keep_alive_timeout_ms(),
            keep_alive_max_missed: default_keep_alive_max_missed(),
            connect_timeout_ms: default_connect_timeout_ms(),
            forward_timeout_ms: default_forward_timeout_ms(),
            close_grace_ms: default_close_grace_ms(),
            max_response_bytes: default_max_response_bytes(),
            forward_command: default_forward_command(),
            endpoints: HashMap::new(),
            default_endpoint: None,
        }
    }
}

impl Default for CircuitBreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            success_threshold: default_success_threshold(),
            timeout_ms: default_breaker_timeout_ms(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_probes: default_half_open_max_probes(),
        }
    }
}

impl Default for WebSocketConfig {
    fn default() -> Self {
        Self {
            ping_interval_ms: default_ping_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            max_missed_pongs: default_max_missed_pongs(),
            max_frame_size: default_max_frame_size(),
            warn_threshold: default_warn_threshold(),
            close_timeout_ms: default_close_timeout_ms(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            level: default_compression_level(),
            threshold: default_compression_threshold(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            messages_per_second: default_messages_per_second(),
            burst_size: default_burst_size(),
            bucket_ttl_seconds: default_bucket_ttl_seconds(),
            cleanup_interval_seconds: default_bucket_cleanup_interval_seconds(),
        }
    }
}

impl Default for OtelConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            endpoint: default_otel_endpoint(),
            service_name: default_service_name(),
            sampling_ratio: default_sampling_ratio(),
        }
    }
}

impl Settings {
    /// Settings with every section at its default, for tests and tooling
    pub fn with_jwt_secret(secret: impl Into<String>) -> Self {
        Self {
            server: ServerConfig::default(),
            jwt: JwtConfig {
                secret: secret.into(),
                issuer: None,
                audience: None,
            },
            api: ApiConfig::default(),
            pool: PoolConfig::default(),
            ssh: SshConfig::default(),
            circuit_breaker: CircuitBreakerSettings::default(),
            websocket: WebSocketConfig::default(),
            compression: CompressionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            tiers: HashMap::new(),
            otel: OtelConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_values() {
        let server = ServerConfig::default();
        assert_eq!(server.host, "0.0.0.0");
        assert_eq!(server.port, 8080);

        let pool = PoolConfig::default();
        assert_eq!(pool.max_connections_per_user, 3);
        assert_eq!(pool.max_idle_time(), Duration::from_secs(300));
        assert_eq!(pool.cleanup_interval(), Duration::from_secs(30));

        let ssh = SshConfig::default();
        assert_eq!(ssh.max_channels, 10);
        assert_eq!(ssh.keep_alive_interval(), Duration::from_secs(60));

        let cb = CircuitBreakerSettings::default();
        assert_eq!(cb.failure_threshold, 5);
        assert_eq!(cb.success_threshold, 2);
        assert_eq!(cb.timeout_ms, 5_000);
        assert_eq!(cb.reset_timeout_ms, 60_000);

        let ws = WebSocketConfig::default();
        assert_eq!(ws.max_frame_size, 1_048_576);
        assert_eq!(ws.warn_threshold, 524_288);
        assert_eq!(ws.max_missed_pongs, 3);
    }

    #[test]
    fn test_dead_peer_detection_latency() {
        let ws = WebSocketConfig::default();
        assert_eq!(ws.dead_peer_detection_latency(), Duration::from_secs(95));
    }

    #[test]
    fn test_validate_defaults() {
        let settings = Settings::with_jwt_secret("secret");
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_ssh_timeouts_fit_inside_breaker_timeout() {
        let mut settings = Settings::with_jwt_secret("secret");
        assert!(settings.ssh.connect_timeout_ms < settings.circuit_breaker.timeout_ms);
        assert!(settings.ssh_timeouts_not_below_breaker().is_empty());

        settings.ssh.connect_timeout_ms = 15_000;
        assert_eq!(
            settings.ssh_timeouts_not_below_breaker(),
            vec![("ssh.connect_timeout_ms", 15_000)]
        );
        // Reported, not rejected
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_compression_level() {
        let mut settings = Settings::with_jwt_secret("secret");
        settings.compression.level = 12;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_warn_above_max_frame() {
        let mut settings = Settings::with_jwt_secret("secret");
        settings.websocket.warn_threshold = settings.websocket.max_frame_size + 1;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_endpoint_fallback() {
        let mut ssh = SshConfig::default();
        assert!(ssh.endpoint_for("alice").is_none());

        ssh.default_endpoint = Some(EndpointConfig {
            host: "relay.internal".to_string(),
            port: 22,
            username: "tunnel".to_string(),
            password: Some("pw".to_string()),
            key_path: None,
            passphrase: None,
            host_key: None,
        });
        assert_eq!(ssh.endpoint_for("alice").unwrap().host, "relay.internal");
    }
}
