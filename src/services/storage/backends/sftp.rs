//! SFTP over russh.
//!
//! One SSH session per provider, opened lazily and shared by every call
//! through an async mutex, so requests on one provider are issued one at a
//! time. A stream returned by `read` outlives the lock: its chunk reads go
//! over the open file handle and rely on russh-sftp multiplexing requests
//! by id on the channel. russh needs a tokio reactor; protocol work is
//! spawned onto a small shared runtime and awaited from whatever executor
//! the caller uses.

use async_lock::{Mutex, RwLock};
use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::Bytes;
use chrono::DateTime;
use futures::StreamExt;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::{PublicKey, PublicKeyBase64};
use russh_sftp::client::SftpSession;
use russh_sftp::client::fs::Metadata;
use russh_sftp::protocol::OpenFlags;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::future::Future;
use std::io::SeekFrom;
use std::sync::{Arc, LazyLock};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::runtime::Runtime;
use tracing::{debug, info, warn};

use crate::services::profiles::Credentials;
use crate::services::storage::pagination::paginate;
use crate::services::storage::path::{PathStyle, parent as parent_dir};
use crate::services::storage::{
    ByteStream, Capability, CapabilitySet, ConnectionState, Entry, EntryMetadata, ListOptions,
    ListResult, OperationError, OperationResult, OperationStatus, ProviderKind, StorageBackend,
};

pub const CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
    Capability::List,
    Capability::Read,
    Capability::Write,
    Capability::Delete,
    Capability::Mkdir,
    Capability::Rmdir,
    Capability::Copy,
    Capability::Move,
    Capability::Download,
    Capability::Upload,
    Capability::Resume,
    Capability::Metadata,
    Capability::Permissions,
    Capability::Symlinks,
    Capability::Connection,
]);

const READ_CHUNK: usize = 64 * 1024;

static RUNTIME: LazyLock<std::io::Result<Runtime>> = LazyLock::new(|| {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(2)
        .thread_name("stowage-ssh")
        .enable_all()
        .build()
});

/// Run `fut` on the SSH runtime.
async fn on_runtime<T, F>(fut: F) -> OperationResult<T>
where
    T: Send + 'static,
    F: Future<Output = OperationResult<T>> + Send + 'static,
{
    let runtime = RUNTIME
        .as_ref()
        .map_err(|e| OperationError::error(format!("Failed to start SSH runtime: {}", e)))?;
    runtime
        .spawn(fut)
        .await
        .map_err(|e| OperationError::error(format!("SSH task failed: {}", e)))?
}

#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("SSH error: {0}")]
    Russh(#[from] russh::Error),

    #[error("Host key mismatch for {host}: expected {expected}, got {actual}")]
    HostKeyMismatch {
        host: String,
        expected: String,
        actual: String,
    },

    #[error("Authentication failed: {0}")]
    AuthenticationFailed(String),

    #[error("Key error: {0}")]
    Key(String),

    #[error("SFTP error: {0}")]
    Sftp(#[from] russh_sftp::client::error::Error),
}

impl From<SshError> for OperationError {
    fn from(e: SshError) -> Self {
        let error = match &e {
            SshError::Russh(_) => OperationError::connection_failed(e.to_string()),
            SshError::HostKeyMismatch { .. } => {
                OperationError::error(e.to_string()).with_code("host_key_mismatch")
            }
            SshError::AuthenticationFailed(_) => {
                OperationError::permission_denied(e.to_string()).with_code("authentication_failed")
            }
            SshError::Key(_) => OperationError::invalid_input(e.to_string()),
            SshError::Sftp(inner) => return sftp_error("", inner.to_string()),
        };
        error.with_cause(e)
    }
}

/// Classify an SFTP failure by the server's status message.
fn sftp_error(path: &str, message: String) -> OperationError {
    let lower = message.to_lowercase();
    let message = if path.is_empty() {
        message
    } else {
        format!("{}: {}", path, message)
    };
    if lower.contains("no such file") || lower.contains("not found") {
        OperationError::new(OperationStatus::NotFound, "not_found", message)
    } else if lower.contains("permission denied") {
        OperationError::permission_denied(message)
    } else if lower.contains("already exists") {
        OperationError::already_exists(message)
    } else if lower.contains("unsupported") {
        OperationError::new(OperationStatus::Unimplemented, "unimplemented", message)
    } else if lower.contains("connection") || lower.contains("timeout") || lower.contains("closed") {
        OperationError::connection_failed(message)
    } else {
        OperationError::error(message).with_code("sftp_error")
    }
}

fn map_sftp(path: &str) -> impl Fn(russh_sftp::client::error::Error) -> OperationError + '_ {
    move |e| sftp_error(path, e.to_string())
}

/// `SHA256:<base64>` without padding, as printed by `ssh-keygen -l`.
pub fn fingerprint(key_bytes: &[u8]) -> String {
    let hash = Sha256::digest(key_bytes);
    format!("SHA256:{}", STANDARD.encode(hash).trim_end_matches('='))
}

fn fingerprint_matches(expected: &str, actual: &str) -> bool {
    let normalize = |s: &str| {
        s.trim()
            .trim_start_matches("SHA256:")
            .trim_end_matches('=')
            .to_string()
    };
    normalize(expected) == normalize(actual)
}

fn default_port() -> u16 {
    22
}

fn default_timeout() -> u64 {
    30
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    /// Remote directory that `/` maps to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
    /// Pinned server key. Unknown keys are accepted with a warning when unset.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub host_key_fingerprint: Option<String>,
    #[serde(default = "default_timeout")]
    pub timeout_secs: u64,
}

impl SftpConfig {
    pub fn new(host: impl Into<String>, username: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_port(),
            username: username.into(),
            root: None,
            host_key_fingerprint: None,
            timeout_secs: default_timeout(),
        }
    }
}

struct HostKeyCheck {
    host: String,
    expected: Option<String>,
}

impl client::Handler for HostKeyCheck {
    type Error = SshError;

    async fn check_server_key(&mut self, server_public_key: &PublicKey) -> Result<bool, Self::Error> {
        let actual = fingerprint(&server_public_key.public_key_bytes());
        match self.expected.as_deref() {
            Some(expected) if fingerprint_matches(expected, &actual) => Ok(true),
            Some(expected) => Err(SshError::HostKeyMismatch {
                host: self.host.clone(),
                expected: expected.to_string(),
                actual,
            }),
            None => {
                warn!("Accepting unpinned host key for {} ({})", self.host, actual);
                Ok(true)
            }
        }
    }
}

struct Session {
    handle: client::Handle<HostKeyCheck>,
    sftp: Arc<SftpSession>,
}

async fn open_session(config: SftpConfig, credentials: Option<Credentials>) -> OperationResult<Session> {
    let ssh_config = client::Config {
        inactivity_timeout: None,
        keepalive_interval: Some(Duration::from_secs(30)),
        keepalive_max: 3,
        ..Default::default()
    };
    let handler = HostKeyCheck {
        host: config.host.clone(),
        expected: config.host_key_fingerprint.clone(),
    };
    let addr = format!("{}:{}", config.host, config.port);

    let mut handle = tokio::time::timeout(
        Duration::from_secs(config.timeout_secs),
        client::connect(Arc::new(ssh_config), addr.clone(), handler),
    )
    .await
    .map_err(|_| OperationError::connection_failed(format!("Timed out connecting to {}", addr)))??;
    debug!("SSH handshake with {} completed", addr);

    let authenticated = match credentials {
        Some(Credentials::Password { username, password }) => {
            let user = username.unwrap_or_else(|| config.username.clone());
            handle
                .authenticate_password(user, password)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
        Some(Credentials::PrivateKey { path, passphrase }) => {
            let key = russh::keys::load_secret_key(&path, passphrase.as_deref())
                .map_err(|e| SshError::Key(format!("{}: {}", path.display(), e)))?;
            let key = PrivateKeyWithHashAlg::new(Arc::new(key), None);
            handle
                .authenticate_publickey(config.username.clone(), key)
                .await
                .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?
        }
        Some(Credentials::Anonymous) | None => handle
            .authenticate_none(config.username.clone())
            .await
            .map_err(|e| SshError::AuthenticationFailed(e.to_string()))?,
        Some(other) => {
            return Err(OperationError::invalid_input(format!(
                "SFTP does not accept {} credentials",
                other.kind_name()
            )));
        }
    };
    if !authenticated.success() {
        return Err(SshError::AuthenticationFailed("Rejected by server".to_string()).into());
    }

    let channel = handle.channel_open_session().await.map_err(SshError::from)?;
    channel
        .request_subsystem(true, "sftp")
        .await
        .map_err(SshError::from)?;
    let sftp = SftpSession::new(channel.into_stream())
        .await
        .map_err(SshError::from)?;

    Ok(Session {
        handle,
        sftp: Arc::new(sftp),
    })
}

fn to_entry(path: &str, metadata: &Metadata, target: Option<String>) -> Entry {
    let modified = metadata
        .mtime
        .and_then(|t| DateTime::from_timestamp(i64::from(t), 0));
    let extra = EntryMetadata {
        permissions: metadata.permissions.map(|p| p & 0o7777),
        owner: metadata.uid.map(|u| u.to_string()),
        group: metadata.gid.map(|g| g.to_string()),
        symlink_target: target.clone(),
        ..Default::default()
    };

    let entry = if let Some(target) = target {
        Entry::symlink(path, target)
    } else if metadata.is_dir() {
        Entry::directory(path)
    } else {
        Entry::file(path, metadata.size.unwrap_or(0), None)
    };
    entry.with_modified(modified).with_metadata(extra)
}

pub struct SftpBackend {
    config: SftpConfig,
    credentials: Option<Credentials>,
    session: Mutex<Option<Session>>,
    state: RwLock<ConnectionState>,
}

impl SftpBackend {
    pub fn new(config: &SftpConfig, credentials: Option<Credentials>) -> Self {
        Self {
            config: config.clone(),
            credentials,
            session: Mutex::new(None),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    /// Remote path for a normalized path.
    fn remote(&self, path: &str) -> String {
        match self.config.root.as_deref() {
            Some(root) if !root.is_empty() && root != "/" => {
                PathStyle::Posix.join(root.trim_end_matches('/'), path.trim_start_matches('/'))
            }
            _ if path.is_empty() => "/".to_string(),
            _ => path.to_string(),
        }
    }

    async fn connect_locked(&self, slot: &mut Option<Session>) -> OperationResult<Arc<SftpSession>> {
        if let Some(session) = slot.as_ref() {
            return Ok(session.sftp.clone());
        }
        *self.state.write().await = ConnectionState::Connecting;
        let config = self.config.clone();
        let credentials = self.credentials.clone();
        match on_runtime(open_session(config, credentials)).await {
            Ok(session) => {
                info!("Connected to sftp://{}:{}", self.config.host, self.config.port);
                let sftp = session.sftp.clone();
                *slot = Some(session);
                *self.state.write().await = ConnectionState::Connected;
                Ok(sftp)
            }
            Err(e) => {
                warn!("SFTP connection to {} failed: {}", self.config.host, e.message());
                *self.state.write().await = ConnectionState::Failed(e.message().to_string());
                Err(e)
            }
        }
    }

    /// Run `op` with exclusive use of the session, reconnecting first when
    /// needed. A dropped connection discards the session.
    async fn with_session<T, F, Fut>(&self, op: F) -> OperationResult<T>
    where
        T: Send + 'static,
        F: FnOnce(Arc<SftpSession>) -> Fut,
        Fut: Future<Output = OperationResult<T>> + Send + 'static,
    {
        let mut slot = self.session.lock().await;
        let sftp = self.connect_locked(&mut slot).await?;
        let result = on_runtime(op(sftp)).await;
        if let Err(e) = &result {
            if e.status() == OperationStatus::ConnectionFailed {
                warn!("SFTP session to {} dropped: {}", self.config.host, e.message());
                slot.take();
                *self.state.write().await = ConnectionState::Failed(e.message().to_string());
            }
        }
        result
    }
}

#[async_trait]
impl StorageBackend for SftpBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Sftp
    }

    fn capabilities(&self) -> CapabilitySet {
        CAPABILITIES
    }

    fn path_style(&self) -> PathStyle {
        PathStyle::Posix
    }

    fn object_uri(&self, path: &str) -> String {
        format!("sftp://{}{}", self.config.host, path)
    }

    async fn connect(&self) -> OperationResult<()> {
        let mut slot = self.session.lock().await;
        self.connect_locked(&mut slot).await.map(|_| ())
    }

    async fn disconnect(&self) -> OperationResult<()> {
        let mut slot = self.session.lock().await;
        if let Some(session) = slot.take() {
            let result = on_runtime(async move {
                session
                    .handle
                    .disconnect(russh::Disconnect::ByApplication, "", "en")
                    .await
                    .map_err(|e| OperationError::from(SshError::from(e)))
            })
            .await;
            if let Err(e) = result {
                debug!("Ignoring error while closing SFTP session: {}", e.message());
            }
        }
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    async fn list_page(&self, path: &str, options: &ListOptions) -> OperationResult<ListResult> {
        let remote = self.remote(path);
        let base = path.to_string();
        let entries = self
            .with_session(move |sftp| async move {
                let dir = sftp.read_dir(remote.clone()).await.map_err(map_sftp(&base))?;
                let mut entries = Vec::new();
                for item in dir {
                    let name = item.file_name();
                    if name == "." || name == ".." {
                        continue;
                    }
                    let child = PathStyle::Posix.join(&base, &name);
                    let metadata = item.metadata();
                    let target = if metadata.is_symlink() {
                        let link = PathStyle::Posix.join(&remote, &name);
                        sftp.read_link(link).await.ok()
                    } else {
                        None
                    };
                    entries.push(to_entry(&child, &metadata, target));
                }
                Ok(entries)
            })
            .await?;
        paginate(entries, options, path)
    }

    async fn stat(&self, path: &str) -> OperationResult<Entry> {
        let remote = self.remote(path);
        let path = path.to_string();
        self.with_session(move |sftp| async move {
            let metadata = sftp
                .symlink_metadata(remote.clone())
                .await
                .map_err(map_sftp(&path))?;
            let target = if metadata.is_symlink() {
                Some(sftp.read_link(remote).await.map_err(map_sftp(&path))?)
            } else {
                None
            };
            Ok(to_entry(&path, &metadata, target))
        })
        .await
    }

    /// Only the open runs under the session lock. Holding it for the life
    /// of the stream would deadlock a copy that writes while it reads.
    async fn read(&self, path: &str) -> OperationResult<ByteStream> {
        let remote = self.remote(path);
        let label = path.to_string();
        let file = self
            .with_session(move |sftp| async move { sftp.open(remote).await.map_err(map_sftp(&label)) })
            .await?;

        let stream = futures::stream::try_unfold(Some(file), |file| async move {
            let Some(mut file) = file else {
                return Ok(None);
            };
            let (chunk, file) = on_runtime(async move {
                let mut buf = vec![0u8; READ_CHUNK];
                let n = file.read(&mut buf).await?;
                buf.truncate(n);
                Ok((buf, file))
            })
            .await?;
            if chunk.is_empty() {
                return Ok(None);
            }
            Ok(Some((Bytes::from(chunk), Some(file))))
        });
        Ok(stream.boxed())
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> OperationResult<Bytes> {
        let remote = self.remote(path);
        let path = path.to_string();
        self.with_session(move |sftp| async move {
            let mut file = sftp.open(remote).await.map_err(map_sftp(&path))?;
            file.seek(SeekFrom::Start(offset)).await?;
            let mut buf = Vec::new();
            file.take(length).read_to_end(&mut buf).await?;
            Ok(Bytes::from(buf))
        })
        .await
    }

    /// Creates missing parent directories.
    async fn write(&self, path: &str, data: Bytes) -> OperationResult<()> {
        let remote = self.remote(path);
        let path = path.to_string();
        self.with_session(move |sftp| async move {
            let parent = parent_dir(&remote).unwrap_or("").to_string();
            let mut current = String::new();
            for segment in parent.split('/').filter(|s| !s.is_empty()) {
                current = format!("{}/{}", current, segment);
                if !sftp.try_exists(current.clone()).await.map_err(map_sftp(&path))? {
                    sftp.create_dir(current.clone()).await.map_err(map_sftp(&path))?;
                }
            }

            let mut file = sftp
                .open_with_flags(remote, OpenFlags::CREATE | OpenFlags::TRUNCATE | OpenFlags::WRITE)
                .await
                .map_err(map_sftp(&path))?;
            file.write_all(&data).await?;
            file.flush().await?;
            file.shutdown().await?;
            Ok(())
        })
        .await
    }

    async fn delete(&self, path: &str) -> OperationResult<()> {
        let remote = self.remote(path);
        let path = path.to_string();
        self.with_session(move |sftp| async move { sftp.remove_file(remote).await.map_err(map_sftp(&path)) })
            .await
    }

    async fn mkdir(&self, path: &str) -> OperationResult<()> {
        let remote = self.remote(path);
        let path = path.to_string();
        self.with_session(move |sftp| async move { sftp.create_dir(remote).await.map_err(map_sftp(&path)) })
            .await
    }

    async fn rmdir(&self, path: &str) -> OperationResult<()> {
        let remote = self.remote(path);
        let path = path.to_string();
        self.with_session(move |sftp| async move { sftp.remove_dir(remote).await.map_err(map_sftp(&path)) })
            .await
    }

    async fn rename(&self, src: &str, dst: &str) -> OperationResult<()> {
        let from = self.remote(src);
        let to = self.remote(dst);
        let path = src.to_string();
        self.with_session(move |sftp| async move { sftp.rename(from, to).await.map_err(map_sftp(&path)) })
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fingerprint_format() {
        assert_eq!(
            fingerprint(b""),
            "SHA256:47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU"
        );
        assert!(fingerprint_matches(
            "47DEQpj8HBSa+/TImW+5JCeuQeRkm5NMpJWZG3hSuFU=",
            &fingerprint(b"")
        ));
        assert!(!fingerprint_matches("SHA256:other", &fingerprint(b"")));
    }

    #[test]
    fn test_status_messages_are_classified() {
        assert!(sftp_error("/a", "No such file".into()).is_not_found());
        assert_eq!(
            sftp_error("/a", "Permission denied".into()).status(),
            OperationStatus::PermissionDenied
        );
        assert!(sftp_error("", "Connection lost".into()).is_retryable());
        let other = sftp_error("/a", "Failure".into());
        assert_eq!(other.code(), "sftp_error");
        assert_eq!(other.message(), "/a: Failure");
    }

    #[test]
    fn test_remote_paths_respect_root() {
        let mut config = SftpConfig::new("host", "deploy");
        let backend = SftpBackend::new(&config, None);
        assert_eq!(backend.remote("/etc/hosts"), "/etc/hosts");
        assert_eq!(backend.remote(""), "/");

        config.root = Some("/home/deploy/".into());
        let backend = SftpBackend::new(&config, None);
        assert_eq!(backend.remote("/site/index.html"), "/home/deploy/site/index.html");
        assert_eq!(backend.object_uri("/site"), "sftp://host/site");
    }

    #[test]
    fn test_unreachable_host_marks_failed() {
        smol::block_on(async {
            let mut config = SftpConfig::new("127.0.0.1", "nobody");
            config.port = 1;
            config.timeout_secs = 5;
            let backend = SftpBackend::new(&config, None);
            assert_eq!(backend.connection_state().await, ConnectionState::Disconnected);

            let err = backend.stat("/x").await.unwrap_err();
            assert!(err.is_retryable());
            assert!(matches!(backend.connection_state().await, ConnectionState::Failed(_)));
        });
    }
}
