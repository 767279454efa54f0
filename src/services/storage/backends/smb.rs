//! SMB shares through the operating system's SMB client.
//!
//! The share is mounted by the OS at `mount_point`; this backend treats the
//! mount as the session. Calls are serialized behind one async mutex,
//! except the chunks of a stream returned by `read`, which the OS client
//! serves after the lock is released. When the mount disappears the
//! provider reports `Failed` and re-checks the mount on the next call.

use async_lock::{Mutex, MutexGuard, RwLock};
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::{info, warn};

use super::posix::FsTree;
use crate::services::storage::pagination::paginate;
use crate::services::storage::{
    ByteStream, Capability, CapabilitySet, ConnectionState, Entry, ListOptions, ListResult,
    OperationError, OperationResult, PathStyle, ProviderKind, StorageBackend,
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

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SmbConfig {
    pub host: String,
    pub share: String,
    /// Where the OS has mounted `//host/share`.
    pub mount_point: PathBuf,
}

pub struct SmbBackend {
    config: SmbConfig,
    tree: FsTree,
    session: Mutex<()>,
    state: RwLock<ConnectionState>,
}

impl SmbBackend {
    pub fn new(config: &SmbConfig) -> Self {
        Self {
            tree: FsTree::new(config.mount_point.clone()),
            config: config.clone(),
            session: Mutex::new(()),
            state: RwLock::new(ConnectionState::Disconnected),
        }
    }

    async fn check_mount(&self) -> OperationResult<()> {
        if self.tree.is_dir().await {
            *self.state.write().await = ConnectionState::Connected;
            Ok(())
        } else {
            let reason = format!(
                "//{}/{} is not mounted at {}",
                self.config.host,
                self.config.share,
                self.config.mount_point.display()
            );
            warn!("{}", reason);
            *self.state.write().await = ConnectionState::Failed(reason.clone());
            Err(OperationError::connection_failed(reason))
        }
    }

    /// Exclusive use of the share, reconnecting first when needed.
    async fn session(&self) -> OperationResult<MutexGuard<'_, ()>> {
        let guard = self.session.lock().await;
        if !self.state.read().await.is_connected() {
            self.check_mount().await?;
        }
        Ok(guard)
    }

    /// Mark the session dropped when an operation fails because the mount
    /// went away.
    async fn observe<T>(&self, result: OperationResult<T>) -> OperationResult<T> {
        if let Err(e) = &result {
            if e.is_not_found() && !self.tree.is_dir().await {
                *self.state.write().await = ConnectionState::Failed(e.message().to_string());
                return Err(OperationError::connection_failed(e.message().to_string()));
            }
        }
        result
    }
}

#[async_trait]
impl StorageBackend for SmbBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Smb
    }

    fn capabilities(&self) -> CapabilitySet {
        CAPABILITIES
    }

    fn path_style(&self) -> PathStyle {
        PathStyle::Posix
    }

    fn object_uri(&self, path: &str) -> String {
        format!("smb://{}/{}{}", self.config.host, self.config.share, path)
    }

    async fn connect(&self) -> OperationResult<()> {
        let _session = self.session.lock().await;
        *self.state.write().await = ConnectionState::Connecting;
        self.check_mount().await?;
        info!("Connected to //{}/{}", self.config.host, self.config.share);
        Ok(())
    }

    async fn disconnect(&self) -> OperationResult<()> {
        let _session = self.session.lock().await;
        *self.state.write().await = ConnectionState::Disconnected;
        Ok(())
    }

    async fn connection_state(&self) -> ConnectionState {
        self.state.read().await.clone()
    }

    async fn list_page(&self, path: &str, options: &ListOptions) -> OperationResult<ListResult> {
        let _session = self.session().await?;
        let entries = self.observe(self.tree.list(path).await).await?;
        paginate(entries, options, path)
    }

    async fn stat(&self, path: &str) -> OperationResult<Entry> {
        let _session = self.session().await?;
        self.observe(self.tree.stat(path).await).await
    }

    /// Only the open runs under the session lock; the returned stream reads
    /// outside it.
    async fn read(&self, path: &str) -> OperationResult<ByteStream> {
        let _session = self.session().await?;
        self.observe(self.tree.read(path).await).await
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> OperationResult<Bytes> {
        let _session = self.session().await?;
        self.observe(self.tree.read_range(path, offset, length).await)
            .await
    }

    async fn write(&self, path: &str, data: Bytes) -> OperationResult<()> {
        let _session = self.session().await?;
        self.observe(self.tree.write(path, data).await).await
    }

    async fn delete(&self, path: &str) -> OperationResult<()> {
        let _session = self.session().await?;
        self.observe(self.tree.delete(path).await).await
    }

    async fn mkdir(&self, path: &str) -> OperationResult<()> {
        let _session = self.session().await?;
        self.observe(self.tree.mkdir(path).await).await
    }

    async fn rmdir(&self, path: &str) -> OperationResult<()> {
        let _session = self.session().await?;
        self.observe(self.tree.rmdir(path).await).await
    }

    async fn rename(&self, src: &str, dst: &str) -> OperationResult<()> {
        let _session = self.session().await?;
        self.observe(self.tree.rename(src, dst).await).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(mount_point: PathBuf) -> SmbConfig {
        SmbConfig {
            host: "nas".into(),
            share: "media".into(),
            mount_point,
        }
    }

    #[test]
    fn test_connect_requires_mount() {
        smol::block_on(async {
            let backend = SmbBackend::new(&config(PathBuf::from("/definitely/not/mounted")));
            let err = backend.connect().await.unwrap_err();
            assert!(err.is_retryable());
            assert!(matches!(backend.connection_state().await, ConnectionState::Failed(_)));
        });
    }

    #[test]
    fn test_first_call_connects_lazily() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("movie.mkv"), b"frames").unwrap();
            let backend = SmbBackend::new(&config(dir.path().to_path_buf()));
            assert_eq!(backend.connection_state().await, ConnectionState::Disconnected);

            let entry = backend.stat("/movie.mkv").await.unwrap();
            assert_eq!(entry.size, Some(6));
            assert_eq!(backend.connection_state().await, ConnectionState::Connected);
        });
    }

    #[test]
    fn test_lost_mount_marks_failed() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let mount = dir.path().join("share");
            std::fs::create_dir(&mount).unwrap();
            let backend = SmbBackend::new(&config(mount.clone()));
            backend.connect().await.unwrap();

            std::fs::remove_dir(&mount).unwrap();
            let err = backend.stat("/anything").await.unwrap_err();
            assert!(err.is_retryable());
            assert!(matches!(backend.connection_state().await, ConnectionState::Failed(_)));
        });
    }

    #[test]
    fn test_object_uri() {
        let backend = SmbBackend::new(&config(PathBuf::from("/mnt/media")));
        assert_eq!(backend.object_uri("/films/a.mkv"), "smb://nas/media/films/a.mkv");
    }
}
