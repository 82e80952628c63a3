mod settings;

pub use settings::{
    ApiConfig, CircuitBreakerSettings, CompressionConfig, EndpointConfig, JwtConfig, OtelConfig,
    PoolConfig, RateLimitConfig, ServerConfig, Settings, SshConfig, TierQuota, WebSocketConfig,
};
