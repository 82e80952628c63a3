use std::sync::Arc;

use async_trait::async_trait;

use super::error::SshError;
use super::types::{ForwardRequest, ForwardResponse};

/// One established, authenticated SSH connection.
///
/// Implementations must allow concurrent `round_trip` calls: each one runs on
/// its own multiplexed channel.
#[async_trait]
pub trait SshTransport: Send + Sync {
    /// Open a channel, send the request, and read the response until the
    /// remote closes the channel.
    async fn round_trip(&self, request: &ForwardRequest) -> Result<ForwardResponse, SshError>;

    /// Protocol-level keep-alive that expects a reply
    async fn keepalive(&self) -> Result<(), SshError>;

    async fn disconnect(&self);
}

/// Creates transports for users. The pool only ever talks to this trait.
#[async_trait]
pub trait SshConnector: Send + Sync {
    async fn connect(&self, user_id: &str) -> Result<Arc<dyn SshTransport>, SshError>;
}
