//! SSH sessions to users' private endpoints
//!
//! - [`SshSession`]: one multiplexed connection with channel accounting and keep-alive
//! - [`SshConnector`] / [`SshTransport`]: the seam between session logic and russh
//! - [`RusshConnector`]: production connector

mod client;
mod error;
mod session;
mod transport;
mod types;

pub use client::{modern_algorithms, RusshConnector, RusshTransport, TunnelClientHandler};
pub use error::SshError;
pub use session::{ChannelPermit, SessionOptions, SshSession};
pub use transport::{SshConnector, SshTransport};
pub use types::{ForwardRequest, ForwardResponse, SessionStats};

#[cfg(test)]
pub(crate) use session::tests::{create_test_request, MockTransport};
