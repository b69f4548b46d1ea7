//! SSH Session Connector
//!
//! Opens authenticated SSH sessions with `russh` and runs each CLI command
//! on its own exec channel, collecting stdout, stderr and the exit status.

use crate::domain::ports::{ArraySession, CliResult, Credentials, Endpoint, SessionConnector};
use crate::error::{Error, Result};
use async_trait::async_trait;
use russh::client;
use russh::ChannelMsg;
use russh_keys::key;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

/// Verifies the array's host key against configured fingerprints
struct HostKeyCheck {
    fingerprints: Arc<Vec<String>>,
    endpoint: String,
}

#[async_trait]
impl client::Handler for HostKeyCheck {
    type Error = russh::Error;

    async fn check_server_key(&mut self, server_public_key: &key::PublicKey) -> std::result::Result<bool, Self::Error> {
        if self.fingerprints.is_empty() {
            return Ok(true);
        }
        let fingerprint = server_public_key.fingerprint();
        let known = self.fingerprints.iter().any(|f| *f == fingerprint);
        if !known {
            warn!("Rejecting unknown host key {} from {}", fingerprint, self.endpoint);
        }
        Ok(known)
    }
}

/// Connector that reaches arrays over SSH
pub struct SshConnector {
    fingerprints: Arc<Vec<String>>,
    inactivity_timeout: Duration,
}

impl SshConnector {
    pub fn new(host_key_fingerprints: Vec<String>, inactivity_timeout: Duration) -> Self {
        Self {
            fingerprints: Arc::new(host_key_fingerprints),
            inactivity_timeout,
        }
    }
}

fn transport_error(endpoint: &Endpoint, reason: impl std::fmt::Display) -> Error {
    Error::Transport {
        endpoint: endpoint.to_string(),
        reason: reason.to_string(),
    }
}

#[async_trait]
impl SessionConnector for SshConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn ArraySession>> {
        let config = Arc::new(client::Config {
            inactivity_timeout: Some(self.inactivity_timeout),
            ..Default::default()
        });
        let handler = HostKeyCheck {
            fingerprints: Arc::clone(&self.fingerprints),
            endpoint: endpoint.to_string(),
        };

        let mut handle = client::connect(config, (endpoint.address.as_str(), endpoint.port), handler)
            .await
            .map_err(|e| transport_error(endpoint, e))?;

        let authenticated = match &endpoint.credentials {
            Credentials::Password(password) => handle
                .authenticate_password(endpoint.username.clone(), password.clone())
                .await
                .map_err(|e| transport_error(endpoint, e))?,
            Credentials::PrivateKey { path, passphrase } => {
                let key_pair = russh_keys::load_secret_key(path, passphrase.as_deref())
                    .map_err(|e| transport_error(endpoint, format!("cannot load key {}: {}", path.display(), e)))?;
                handle
                    .authenticate_publickey(endpoint.username.clone(), Arc::new(key_pair))
                    .await
                    .map_err(|e| transport_error(endpoint, e))?
            }
        };
        if !authenticated {
            return Err(transport_error(
                endpoint,
                format!("authentication failed for user {}", endpoint.username),
            ));
        }

        debug!("SSH session established to {}", endpoint);
        Ok(Box::new(SshSession {
            handle,
            endpoint: endpoint.clone(),
        }))
    }
}

/// One authenticated SSH connection
pub struct SshSession {
    handle: client::Handle<HostKeyCheck>,
    endpoint: Endpoint,
}

#[async_trait]
impl ArraySession for SshSession {
    async fn exec(&mut self, command: &str) -> Result<CliResult> {
        let mut channel = self
            .handle
            .channel_open_session()
            .await
            .map_err(|e| transport_error(&self.endpoint, e))?;
        channel
            .exec(true, command)
            .await
            .map_err(|e| transport_error(&self.endpoint, e))?;

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        let mut exit_status = None;

        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, ext: 1 } => stderr.extend_from_slice(data),
                ChannelMsg::ExitStatus { exit_status: code } => exit_status = Some(code),
                _ => {}
            }
        }

        let exit_status = exit_status
            .ok_or_else(|| transport_error(&self.endpoint, "channel closed without exit status"))?;

        Ok(CliResult {
            exit_status,
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
        })
    }

    fn is_alive(&self) -> bool {
        !self.handle.is_closed()
    }
}
