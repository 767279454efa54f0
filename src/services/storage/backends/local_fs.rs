//! Local filesystem backend.
//!
//! Stateless; safe to call concurrently. Copies use the filesystem's own
//! copy, renames are native.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use super::posix::FsTree;
use crate::services::storage::pagination::paginate;
use crate::services::storage::{
    ByteStream, Capability, CapabilitySet, Entry, ListOptions, ListResult, OperationResult,
    PathStyle, ProviderKind, StorageBackend,
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
    Capability::ServerSideCopy,
    Capability::Download,
    Capability::Upload,
    Capability::Resume,
    Capability::Metadata,
    Capability::Permissions,
    Capability::Symlinks,
    Capability::Hardlinks,
]);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalConfig {
    pub root: PathBuf,
}

pub struct LocalBackend {
    tree: FsTree,
}

impl LocalBackend {
    pub fn new(config: &LocalConfig) -> Self {
        Self {
            tree: FsTree::new(config.root.clone()),
        }
    }
}

#[async_trait]
impl StorageBackend for LocalBackend {
    fn kind(&self) -> ProviderKind {
        ProviderKind::Local
    }

    fn capabilities(&self) -> CapabilitySet {
        CAPABILITIES
    }

    fn path_style(&self) -> PathStyle {
        PathStyle::Posix
    }

    fn object_uri(&self, path: &str) -> String {
        format!("file://{}", self.tree.resolve(path).display())
    }

    async fn list_page(&self, path: &str, options: &ListOptions) -> OperationResult<ListResult> {
        let entries = self.tree.list(path).await?;
        paginate(entries, options, path)
    }

    async fn stat(&self, path: &str) -> OperationResult<Entry> {
        self.tree.stat(path).await
    }

    async fn read(&self, path: &str) -> OperationResult<ByteStream> {
        self.tree.read(path).await
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> OperationResult<Bytes> {
        self.tree.read_range(path, offset, length).await
    }

    async fn write(&self, path: &str, data: Bytes) -> OperationResult<()> {
        self.tree.write(path, data).await
    }

    async fn delete(&self, path: &str) -> OperationResult<()> {
        self.tree.delete(path).await
    }

    async fn mkdir(&self, path: &str) -> OperationResult<()> {
        self.tree.mkdir(path).await
    }

    async fn rmdir(&self, path: &str) -> OperationResult<()> {
        self.tree.rmdir(path).await
    }

    async fn server_copy(&self, src: &str, dst: &str) -> OperationResult<()> {
        self.tree.copy(src, dst).await
    }

    async fn rename(&self, src: &str, dst: &str) -> OperationResult<()> {
        self.tree.rename(src, dst).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::{OperationStatus, StorageProvider, TransferState};
    use crate::services::transfer::TransferOptions;
    use crate::settings::EngineSettings;

    fn provider(root: &std::path::Path) -> StorageProvider {
        let config = LocalConfig {
            root: root.to_path_buf(),
        };
        StorageProvider::new("local", Box::new(LocalBackend::new(&config)), &EngineSettings::default())
    }

    #[test]
    fn test_write_delete_read_roundtrip() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let provider = provider(dir.path());

            provider.write("a.txt", Bytes::new()).await.unwrap();
            assert!(provider.exists("/a.txt").await.unwrap());
            provider.delete("a.txt").await.unwrap();
            let err = provider.read("a.txt").await.err().unwrap();
            assert_eq!(err.status(), OperationStatus::NotFound);
        });
    }

    #[test]
    fn test_copy_tree_on_disk() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir_all(dir.path().join("src/deep")).unwrap();
            std::fs::write(dir.path().join("src/one.txt"), b"1").unwrap();
            std::fs::write(dir.path().join("src/deep/two.txt"), b"22").unwrap();
            let provider = provider(dir.path());

            let report = provider
                .copy("/src", "/dst", &TransferOptions::default())
                .await
                .unwrap();
            assert_eq!(report.state, TransferState::Completed);
            assert_eq!(report.files_processed, 2);
            assert_eq!(report.bytes_transferred, 3);
            assert_eq!(std::fs::read(dir.path().join("dst/deep/two.txt")).unwrap(), b"22");
        });
    }

    #[test]
    fn test_rmdir_refuses_non_empty_directory() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir(dir.path().join("full")).unwrap();
            std::fs::write(dir.path().join("full/f"), b"x").unwrap();
            let provider = provider(dir.path());

            assert!(provider.rmdir("/full").await.is_err());
            provider.delete("/full/f").await.unwrap();
            provider.rmdir("/full").await.unwrap();
            assert!(!provider.exists("/full").await.unwrap());
        });
    }

    #[test]
    fn test_object_uri() {
        let backend = LocalBackend::new(&LocalConfig {
            root: PathBuf::from("/srv"),
        });
        assert_eq!(backend.object_uri("/a/b.txt"), "file:///srv/a/b.txt");
    }
}
