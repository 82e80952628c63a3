//! russh-backed connector and transport

use std::borrow::Cow;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use russh::client::{self, Handle};
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh::{cipher, kex, mac, ChannelMsg, Preferred};
use tracing::{debug, info, warn};

use super::error::SshError;
use super::transport::{SshConnector, SshTransport};
use super::types::{ForwardRequest, ForwardResponse};
use crate::config::{EndpointConfig, SshConfig};

const KEX_ORDER: &[kex::Name] = &[
    kex::CURVE25519,
    kex::CURVE25519_PRE_RFC_8731,
    kex::EXTENSION_SUPPORT_AS_CLIENT,
    kex::EXTENSION_OPENSSH_STRICT_KEX_AS_CLIENT,
];

const CIPHER_ORDER: &[cipher::Name] = &[
    cipher::CHACHA20_POLY1305,
    cipher::AES_256_GCM,
    cipher::AES_256_CTR,
];

const MAC_ORDER: &[mac::Name] = &[mac::HMAC_SHA512_ETM, mac::HMAC_SHA256_ETM];

/// Algorithm set offered during key exchange. Legacy algorithms are never negotiated.
pub fn modern_algorithms() -> Preferred {
    Preferred {
        kex: Cow::Borrowed(KEX_ORDER),
        cipher: Cow::Borrowed(CIPHER_ORDER),
        mac: Cow::Borrowed(MAC_ORDER),
        ..Preferred::DEFAULT
    }
}

/// russh sends its own keep-alive requests and disconnects after
/// `keep_alive_max_missed` unanswered ones; `SshSession` sees the closed
/// handle on its next keep-alive.
fn client_config(config: &SshConfig) -> client::Config {
    client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(config.keep_alive_interval()),
        keepalive_max: config.keep_alive_max_missed as usize,
        preferred: modern_algorithms(),
        ..Default::default()
    }
}

/// Opens SSH sessions to the endpoint configured for each user
pub struct RusshConnector {
    config: SshConfig,
    client_config: Arc<client::Config>,
}

impl RusshConnector {
    pub fn new(config: SshConfig) -> Self {
        Self {
            client_config: Arc::new(client_config(&config)),
            config,
        }
    }

    async fn establish(
        &self,
        endpoint: &EndpointConfig,
    ) -> Result<Handle<TunnelClientHandler>, SshError> {
        let handler = TunnelClientHandler {
            host: endpoint.host.clone(),
            pinned_key: endpoint.host_key.clone(),
        };

        let mut handle = client::connect(
            Arc::clone(&self.client_config),
            (endpoint.host.as_str(), endpoint.port),
            handler,
        )
        .await
        .map_err(into_connect_error)?;

        debug!(host = %endpoint.host, "SSH handshake completed");

        let auth = if let Some(key_path) = &endpoint.key_path {
            let key = russh::keys::load_secret_key(key_path, endpoint.passphrase.as_deref())?;
            let key_with_hash = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(&endpoint.username, key_with_hash)
                .await
        } else if let Some(password) = &endpoint.password {
            handle
                .authenticate_password(&endpoint.username, password)
                .await
        } else {
            return Err(SshError::Connect(format!(
                "no credentials configured for {}@{}",
                endpoint.username, endpoint.host
            )));
        }
        .map_err(|e| SshError::Connect(format!("authentication error: {}", e)))?;

        if !auth.success() {
            return Err(SshError::Connect(
                "authentication rejected by server".to_string(),
            ));
        }

        Ok(handle)
    }
}

#[async_trait]
impl SshConnector for RusshConnector {
    async fn connect(&self, user_id: &str) -> Result<Arc<dyn SshTransport>, SshError> {
        let endpoint = self.config.endpoint_for(user_id).ok_or_else(|| {
            SshError::Connect(format!("no SSH endpoint configured for user {}", user_id))
        })?;

        let timeout = self.config.connect_timeout();
        info!(
            user_id = %user_id,
            host = %endpoint.host,
            port = endpoint.port,
            "Opening SSH session"
        );

        let handle = tokio::time::timeout(timeout, self.establish(endpoint))
            .await
            .map_err(|_| SshError::Connect(format!("timed out after {:?}", timeout)))??;

        Ok(Arc::new(RusshTransport {
            handle,
            forward_command: self.config.forward_command.clone(),
            max_response_bytes: self.config.max_response_bytes,
        }))
    }
}

fn into_connect_error(err: SshError) -> SshError {
    match err {
        SshError::Connect(_) => err,
        other => SshError::Connect(other.to_string()),
    }
}

/// Runs the forward command once per request on its own channel
pub struct RusshTransport {
    handle: Handle<TunnelClientHandler>,
    forward_command: String,
    max_response_bytes: usize,
}

#[async_trait]
impl SshTransport for RusshTransport {
    async fn round_trip(&self, request: &ForwardRequest) -> Result<ForwardResponse, SshError> {
        let payload =
            serde_json::to_vec(request).map_err(|e| SshError::Protocol(e.to_string()))?;

        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, self.forward_command.as_str()).await?;
        channel.data(&payload[..]).await?;
        channel.eof().await?;

        let mut stdout: Vec<u8> = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { data } => {
                    if stdout.len() + data.len() > self.max_response_bytes {
                        let _ = channel.close().await;
                        return Err(SshError::ResponseTooLarge {
                            limit: self.max_response_bytes,
                        });
                    }
                    stdout.extend_from_slice(&data);
                }
                ChannelMsg::ExtendedData { data, ext: 1 } => {
                    debug!(
                        request_id = %request.id,
                        stderr = %String::from_utf8_lossy(&data),
                        "Forward command stderr"
                    );
                }
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                ChannelMsg::Close => break,
                _ => {}
            }
        }

        if stdout.is_empty() {
            return Err(SshError::Protocol(match exit_status {
                Some(code) => format!("forward command exited with status {} and no output", code),
                None => "channel closed without a response".to_string(),
            }));
        }

        serde_json::from_slice(&stdout)
            .map_err(|e| SshError::Protocol(format!("invalid response: {}", e)))
    }

    async fn keepalive(&self) -> Result<(), SshError> {
        // send_keepalive only queues the request; a dead peer shows up as a
        // handle russh has already closed
        if self.handle.is_closed() {
            return Err(SshError::SessionClosed);
        }
        self.handle.send_keepalive(true).await?;
        Ok(())
    }

    async fn disconnect(&self) {
        if let Err(e) = self
            .handle
            .disconnect(russh::Disconnect::ByApplication, "session closed", "en")
            .await
        {
            debug!(error = %e, "SSH disconnect failed");
        }
    }
}

/// Client callbacks; verifies the server key against an optional pin
pub struct TunnelClientHandler {
    host: String,
    pinned_key: Option<String>,
}

impl client::Handler for TunnelClientHandler {
    type Error = SshError;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> Result<bool, Self::Error> {
        let Some(expected) = &self.pinned_key else {
            debug!(host = %self.host, "No pinned host key, accepting server key");
            return Ok(true);
        };

        let actual = BASE64.encode(server_public_key.public_key_bytes());
        if host_key_matches(expected, &actual) {
            Ok(true)
        } else {
            warn!(host = %self.host, "SSH host key does not match pinned key");
            Err(SshError::Connect(format!(
                "host key mismatch for {}",
                self.host
            )))
        }
    }
}

/// Accepts either a bare base64 key blob or an `authorized_keys` style line
fn host_key_matches(expected: &str, actual_b64: &str) -> bool {
    let blob = expected
        .split_whitespace()
        .find(|token| token.starts_with("AAAA"))
        .unwrap_or_else(|| expected.trim());
    blob == actual_b64
}

#[cfg(test)]
mod tests {
    use super::*;

    const BLOB: &str = "AAAAC3NzaC1lZDI1NTE5AAAAIOMqqnkVzrm0SdG6UOoqKLsabgH5C9okWi0dh2l9GKJl";

    #[test]
    fn test_host_key_matches_bare_blob() {
        assert!(host_key_matches(BLOB, BLOB));
        assert!(host_key_matches(&format!("  {}\n", BLOB), BLOB));
        assert!(!host_key_matches(BLOB, "AAAAB3NzaC1yc2EAAAADAQABAAABAQ"));
    }

    #[test]
    fn test_host_key_matches_authorized_keys_line() {
        let line = format!("ssh-ed25519 {} relay@internal", BLOB);
        assert!(host_key_matches(&line, BLOB));
    }

    #[test]
    fn test_modern_algorithms_only() {
        let preferred = modern_algorithms();
        assert_eq!(preferred.kex[0], kex::CURVE25519);
        assert!(preferred.cipher.contains(&cipher::CHACHA20_POLY1305));
        assert!(preferred.cipher.contains(&cipher::AES_256_GCM));
        assert!(preferred.mac.iter().all(|m| *m == mac::HMAC_SHA512_ETM || *m == mac::HMAC_SHA256_ETM));
    }

    #[test]
    fn test_client_config_enables_keepalive() {
        let ssh = SshConfig {
            keep_alive_interval_ms: 15_000,
            keep_alive_max_missed: 4,
            ..SshConfig::default()
        };
        let config = client_config(&ssh);
        assert_eq!(config.keepalive_interval, Some(std::time::Duration::from_secs(15)));
        assert_eq!(config.keepalive_max, 4);
        assert!(config.inactivity_timeout.is_none());
    }

    #[tokio::test]
    async fn test_connect_without_endpoint_fails() {
        let connector = RusshConnector::new(SshConfig::default());
        let err = match connector.connect("nobody").await {
            Ok(_) => panic!("expected connect error"),
            Err(e) => e,
        };
        assert!(matches!(err, SshError::Connect(_)));
    }
}
