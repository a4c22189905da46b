//! Pushes an exported file to a job's SSH/SFTP destination.
//!
//! Connects fresh for every transfer (no connection pooling): transfers are
//! infrequent relative to query execution and a job-scoped connection keeps
//! failure isolation simple. Host keys are trusted on first use; a fleet
//! that wants stricter verification should pin `known_hosts` ahead of this
//! crate.

use async_trait::async_trait;
use dispatcher_core::{DispatchError, SshAuth, SshIdentity, TransferAgent};
use russh::client::{self, Handle};
use russh::keys::key::PublicKey;
use russh::keys::decode_secret_key;
use russh_sftp::client::SftpSession;
use std::path::Path;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, instrument};

struct AcceptingHandler;

#[async_trait]
impl client::Handler for AcceptingHandler {
    type Error = russh::Error;

    async fn check_server_key(&mut self, _server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        Ok(true)
    }
}

async fn connect(identity: &SshIdentity) -> Result<Handle<AcceptingHandler>, DispatchError> {
    let config = Arc::new(client::Config::default());
    let mut session = client::connect(config, (identity.host.as_str(), identity.port), AcceptingHandler)
        .await
        .map_err(|e| DispatchError::SshConnect(e.to_string()))?;

    let authenticated = match &identity.auth {
        SshAuth::Password(password) => session
            .authenticate_password(&identity.username, password)
            .await
            .map_err(|e| DispatchError::SshAuth(e.to_string()))?,
        SshAuth::PrivateKey { key_pem, passphrase } => {
            let key_pair = decode_secret_key(key_pem, passphrase.as_deref())
                .map_err(|e| DispatchError::SshAuth(format!("invalid private key: {e}")))?;
            session
                .authenticate_publickey(&identity.username, Arc::new(key_pair))
                .await
                .map_err(|e| DispatchError::SshAuth(e.to_string()))?
        }
    };

    if !authenticated {
        return Err(DispatchError::SshAuth("authentication rejected".into()));
    }

    Ok(session)
}

async fn open_sftp(session: &mut Handle<AcceptingHandler>) -> Result<SftpSession, DispatchError> {
    let channel = session
        .channel_open_session()
        .await
        .map_err(|e| DispatchError::SshConnect(e.to_string()))?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(|e| DispatchError::SshConnect(e.to_string()))?;
    SftpSession::new(channel.into_stream())
        .await
        .map_err(|e| DispatchError::SshConnect(e.to_string()))
}

/// Create `remote_dir` and every missing ancestor, tolerating components
/// that already exist. Returns the absolute directory path built, so the
/// caller composes the final file path from exactly what was created.
async fn ensure_remote_dir(sftp: &SftpSession, remote_dir: &str) -> Result<String, DispatchError> {
    let mut built = String::new();
    for component in remote_dir.split('/').filter(|c| !c.is_empty()) {
        built.push('/');
        built.push_str(component);
        if sftp.metadata(&built).await.is_ok() {
            continue;
        }
        if let Err(err) = sftp.create_dir(&built).await {
            if sftp.metadata(&built).await.is_err() {
                return Err(DispatchError::SshTransfer(format!(
                    "failed to create remote directory {built}: {err}"
                )));
            }
        }
    }
    Ok(built)
}

/// Pushes files over SFTP, connecting fresh for each transfer.
pub struct SshTransferAgent;

#[async_trait]
impl TransferAgent for SshTransferAgent {
    #[instrument(skip(self, identity, cancel), fields(host = %identity.host, remote_dir, remote_filename))]
    async fn transfer(
        &self,
        local_path: &Path,
        identity: &SshIdentity,
        remote_dir: &str,
        remote_filename: &str,
        cancel: CancellationToken,
    ) -> Result<String, DispatchError> {
        if cancel.is_cancelled() {
            return Err(DispatchError::Canceled("canceled before transfer started".into()));
        }

        let local_size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| DispatchError::ExportIo(e.to_string()))?
            .len();

        let mut session = connect(identity).await?;
        let sftp = open_sftp(&mut session).await?;

        let absolute_dir = if remote_dir.is_empty() {
            String::new()
        } else {
            ensure_remote_dir(&sftp, remote_dir).await?
        };

        let remote_path = if absolute_dir.is_empty() {
            format!("/{remote_filename}")
        } else {
            format!("{absolute_dir}/{remote_filename}")
        };

        if let Ok(existing) = sftp.metadata(&remote_path).await {
            if existing.size == Some(local_size) {
                info!(remote_path, "remote file already present with matching size, skipping transfer");
                let _ = session.disconnect(russh::Disconnect::ByApplication, "", "").await;
                return Ok(remote_path);
            }
        }

        let mut local_file = tokio::fs::File::open(local_path)
            .await
            .map_err(|e| DispatchError::ExportIo(e.to_string()))?;
        let mut remote_file = sftp
            .create(&remote_path)
            .await
            .map_err(|e| DispatchError::SshTransfer(e.to_string()))?;

        let mut buf = vec![0u8; 64 * 1024];
        loop {
            if cancel.is_cancelled() {
                return Err(DispatchError::Canceled("canceled during transfer".into()));
            }
            let n = local_file
                .read(&mut buf)
                .await
                .map_err(|e| DispatchError::ExportIo(e.to_string()))?;
            if n == 0 {
                break;
            }
            remote_file
                .write_all(&buf[..n])
                .await
                .map_err(|e| DispatchError::SshTransfer(e.to_string()))?;
        }
        remote_file
            .shutdown()
            .await
            .map_err(|e| DispatchError::SshTransfer(e.to_string()))?;
        drop(remote_file);

        let uploaded = sftp
            .metadata(&remote_path)
            .await
            .map_err(|e| DispatchError::SshTransfer(format!("failed to stat uploaded file: {e}")))?;
        if uploaded.size != Some(local_size) {
            return Err(DispatchError::SshTransfer(format!(
                "uploaded file size mismatch for {remote_path}: expected {local_size} bytes, remote reports {:?}",
                uploaded.size
            )));
        }

        let _ = session.disconnect(russh::Disconnect::ByApplication, "", "").await;
        Ok(remote_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_path_is_absolute_when_dir_given() {
        let absolute_dir = "/exports/daily".to_string();
        let remote_filename = "report.csv";
        let joined = format!("{absolute_dir}/{remote_filename}");
        assert_eq!(joined, "/exports/daily/report.csv");
    }

    #[test]
    fn remote_path_is_absolute_when_dir_empty() {
        let absolute_dir = String::new();
        let remote_filename = "report.csv";
        let joined = if absolute_dir.is_empty() {
            format!("/{remote_filename}")
        } else {
            format!("{absolute_dir}/{remote_filename}")
        };
        assert_eq!(joined, "/report.csv");
    }
}
