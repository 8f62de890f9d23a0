use std::sync::Arc;
use std::time::Duration;

use russh::client;
use russh::keys::{HashAlg, PrivateKeyWithHashAlg, decode_secret_key};
use russh::{ChannelMsg, Disconnect};
use tracing::debug;

use crate::error::{HosterError, HosterResult};

/// Budget for the pre-verb keepalive probe.
pub const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Stream type of a forwarded TCP tunnel.
pub type TunnelStream = russh::ChannelStream<client::Msg>;

/// Output of one remote command.
#[derive(Debug, Default)]
pub struct ExecOutput {
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
    pub exit_code: u32,
}

impl ExecOutput {
    #[must_use]
    pub fn stdout_string(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    #[must_use]
    pub fn stderr_string(&self) -> String {
        String::from_utf8_lossy(&self.stderr).trim().to_string()
    }
}

/// One authenticated SSH connection to a node.
///
/// Commands and tunnels each open a fresh session channel over the
/// multiplexed connection; the connection itself is cheap to probe
/// and re-dialed by the owner when the probe fails.
pub struct SshSession {
    handle: client::Handle<AcceptHost>,
    host: String,
}

impl SshSession {
    /// Dial and authenticate with a PEM-encoded private key.
    pub async fn connect(
        host: &str,
        port: u16,
        user: &str,
        private_key_pem: &str,
    ) -> HosterResult<Self> {
        let key = decode_secret_key(private_key_pem, None)
            .map_err(|e| HosterError::ConnectionFailed(format!("ssh key for {host}: {e}")))?;

        let config = Arc::new(client::Config {
            inactivity_timeout: Some(Duration::from_secs(300)),
            ..Default::default()
        });

        let mut handle = tokio::time::timeout(
            CONNECT_TIMEOUT,
            client::connect(config, (host.to_string(), port), AcceptHost),
        )
        .await
        .map_err(|_| HosterError::Timeout(format!("ssh connect to {host}:{port}")))?
        .map_err(|e| HosterError::ConnectionFailed(format!("ssh connect to {host}:{port}: {e}")))?;

        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .map_err(HosterError::from)?
            .flatten();

        let auth = handle
            .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
            .await
            .map_err(|e| HosterError::ConnectionFailed(format!("ssh auth on {host}: {e}")))?;

        if !auth.success() {
            return Err(HosterError::ConnectionFailed(format!(
                "ssh key rejected by {host} for user {user}"
            )));
        }

        debug!(host, port, user, "ssh connection established");
        Ok(Self {
            handle,
            host: host.to_string(),
        })
    }

    /// Run a command, optionally piping bytes to its stdin, and
    /// collect output until the channel closes or the deadline hits.
    pub async fn exec(
        &self,
        command: &str,
        stdin: Option<&[u8]>,
        timeout: Duration,
    ) -> HosterResult<ExecOutput> {
        tokio::time::timeout(timeout, self.exec_inner(command, stdin))
            .await
            .map_err(|_| {
                HosterError::Timeout(format!(
                    "command on {} exceeded {}s",
                    self.host,
                    timeout.as_secs()
                ))
            })?
    }

    async fn exec_inner(&self, command: &str, stdin: Option<&[u8]>) -> HosterResult<ExecOutput> {
        let mut channel = self.handle.channel_open_session().await?;
        channel.exec(true, command).await?;

        if let Some(bytes) = stdin {
            channel.data(&bytes[..]).await?;
        }
        channel.eof().await?;

        let mut output = ExecOutput::default();
        while let Some(msg) = channel.wait().await {
            match msg {
                ChannelMsg::Data { ref data } => output.stdout.extend_from_slice(data),
                ChannelMsg::ExtendedData { ref data, .. } => {
                    output.stderr.extend_from_slice(data);
                }
                ChannelMsg::ExitStatus { exit_status } => output.exit_code = exit_status,
                _ => {}
            }
        }
        Ok(output)
    }

    /// Cheap liveness probe: open and drop a session channel within
    /// the keepalive budget.
    pub async fn keepalive(&self) -> bool {
        match tokio::time::timeout(KEEPALIVE_TIMEOUT, self.handle.channel_open_session()).await {
            // Dropping the channel closes it.
            Ok(Ok(_channel)) => true,
            _ => false,
        }
    }

    /// Open a TCP tunnel to a port on the node's loopback, returning
    /// the local end as a byte stream.
    pub async fn open_tunnel(&self, port: u16) -> HosterResult<TunnelStream> {
        let channel = self
            .handle
            .channel_open_direct_tcpip("127.0.0.1", u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| {
                HosterError::ConnectionFailed(format!(
                    "tunnel to {}:{port}: {e}",
                    self.host
                ))
            })?;
        Ok(channel.into_stream())
    }

    pub async fn disconnect(&self) {
        let _ = self
            .handle
            .disconnect(Disconnect::ByApplication, "shutting down", "en")
            .await;
    }
}

/// Nodes are registered by their owner together with the key to use;
/// host keys are accepted on first use.
struct AcceptHost;

impl client::Handler for AcceptHost {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        _server_public_key: &russh::keys::PublicKey,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

/// SHA-256 fingerprint of the public half of a PEM private key.
pub fn key_fingerprint(private_key_pem: &str) -> HosterResult<String> {
    let key = decode_secret_key(private_key_pem, None)
        .map_err(|e| HosterError::BadRequest(format!("private key does not parse: {e}")))?;
    Ok(key.public_key().fingerprint(HashAlg::Sha256).to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exec_output_trims() {
        let out = ExecOutput {
            stdout: b"  {\"version\":\"0.3.0\"}\n".to_vec(),
            stderr: b"\n".to_vec(),
            exit_code: 0,
        };
        assert_eq!(out.stdout_string(), "{\"version\":\"0.3.0\"}");
        assert_eq!(out.stderr_string(), "");
    }

    #[test]
    fn garbage_key_is_rejected() {
        let err = key_fingerprint("not a key").unwrap_err();
        assert_eq!(err.kind(), "bad-request");
    }
}
