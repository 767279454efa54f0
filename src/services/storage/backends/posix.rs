//! Hierarchical filesystem tree rooted at a local directory.
//!
//! Shared by the local and mounted-share backends. Paths are POSIX style
//! (`/a/b`) and already normalized, so `..` cannot lift them above the
//! root. Confinement is lexical only: reading or writing through a symlink
//! inside the root follows it, wherever it points. Listings and `stat`
//! report symlinks without following them.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use futures::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use futures::{StreamExt, TryStreamExt};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};

use crate::services::storage::{ByteStream, Entry, EntryMetadata, OperationError, OperationResult, PathStyle};

const READ_CHUNK: usize = 64 * 1024;

/// Attach the path to an io failure.
fn io_error(path: &str, e: std::io::Error) -> OperationError {
    let err = OperationError::from(e);
    let message = format!("{}: {}", path, err.message());
    err.with_message(message)
}

#[derive(Debug, Clone)]
pub struct FsTree {
    root: PathBuf,
}

impl FsTree {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &str) -> PathBuf {
        let relative = path.trim_start_matches('/');
        if relative.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relative)
        }
    }

    fn entry_for(&self, path: &str, metadata: &std::fs::Metadata, target: Option<String>) -> Entry {
        let modified = metadata.modified().ok().map(DateTime::<Utc>::from);
        let mut extra = EntryMetadata::default();

        #[cfg(unix)]
        {
            use std::os::unix::fs::MetadataExt;
            extra.permissions = Some(metadata.mode() & 0o7777);
            extra.owner = Some(metadata.uid().to_string());
            extra.group = Some(metadata.gid().to_string());
            if metadata.is_file() && metadata.nlink() > 1 {
                extra.custom.insert("hardlinks".into(), metadata.nlink().to_string());
            }
        }

        let entry = if let Some(target) = target {
            extra.symlink_target = Some(target.clone());
            Entry::symlink(path, target)
        } else if metadata.is_dir() {
            Entry::directory(path)
        } else {
            Entry::file(path, metadata.len(), None)
        };
        entry.with_modified(modified).with_metadata(extra)
    }

    pub async fn stat(&self, path: &str) -> OperationResult<Entry> {
        let local = self.resolve(path);
        let metadata = async_fs::symlink_metadata(&local)
            .await
            .map_err(|e| io_error(path, e))?;
        let target = if metadata.file_type().is_symlink() {
            let target = async_fs::read_link(&local)
                .await
                .map_err(|e| io_error(path, e))?;
            Some(target.display().to_string())
        } else {
            None
        };
        Ok(self.entry_for(path, &metadata, target))
    }

    /// Direct children of `path`. Symlinks are reported, not followed.
    pub async fn list(&self, path: &str) -> OperationResult<Vec<Entry>> {
        let local = self.resolve(path);
        let mut dir = async_fs::read_dir(&local)
            .await
            .map_err(|e| io_error(path, e))?;

        let mut entries = Vec::new();
        while let Some(item) = dir.try_next().await.map_err(|e| io_error(path, e))? {
            let name = item.file_name().to_string_lossy().into_owned();
            let child = PathStyle::Posix.join(path, &name);
            match self.stat(&child).await {
                Ok(entry) => entries.push(entry),
                // Removed between readdir and stat.
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(entries)
    }

    pub async fn read(&self, path: &str) -> OperationResult<ByteStream> {
        let file = async_fs::File::open(self.resolve(path))
            .await
            .map_err(|e| io_error(path, e))?;
        let stream = futures::stream::try_unfold(file, |mut file| async move {
            let mut buf = vec![0u8; READ_CHUNK];
            let n = file.read(&mut buf).await?;
            if n == 0 {
                return Ok::<_, OperationError>(None);
            }
            buf.truncate(n);
            Ok(Some((Bytes::from(buf), file)))
        });
        Ok(stream.boxed())
    }

    pub async fn read_range(&self, path: &str, offset: u64, length: u64) -> OperationResult<Bytes> {
        let mut file = async_fs::File::open(self.resolve(path))
            .await
            .map_err(|e| io_error(path, e))?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buf = Vec::new();
        file.take(length).read_to_end(&mut buf).await?;
        Ok(Bytes::from(buf))
    }

    /// Write a file, creating missing parent directories.
    pub async fn write(&self, path: &str, data: Bytes) -> OperationResult<()> {
        let local = self.resolve(path);
        if let Some(parent) = local.parent() {
            async_fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(path, e))?;
        }
        let mut file = async_fs::File::create(&local)
            .await
            .map_err(|e| io_error(path, e))?;
        file.write_all(&data).await?;
        file.flush().await?;
        file.sync_all().await?;
        Ok(())
    }

    pub async fn delete(&self, path: &str) -> OperationResult<()> {
        async_fs::remove_file(self.resolve(path))
            .await
            .map_err(|e| io_error(path, e))
    }

    pub async fn mkdir(&self, path: &str) -> OperationResult<()> {
        async_fs::create_dir(self.resolve(path))
            .await
            .map_err(|e| io_error(path, e))
    }

    pub async fn rmdir(&self, path: &str) -> OperationResult<()> {
        async_fs::remove_dir(self.resolve(path))
            .await
            .map_err(|e| io_error(path, e))
    }

    pub async fn copy(&self, src: &str, dst: &str) -> OperationResult<()> {
        let target = self.resolve(dst);
        if let Some(parent) = target.parent() {
            async_fs::create_dir_all(parent)
                .await
                .map_err(|e| io_error(dst, e))?;
        }
        async_fs::copy(self.resolve(src), target)
            .await
            .map_err(|e| io_error(src, e))?;
        Ok(())
    }

    pub async fn rename(&self, src: &str, dst: &str) -> OperationResult<()> {
        async_fs::rename(self.resolve(src), self.resolve(dst))
            .await
            .map_err(|e| io_error(src, e))
    }

    pub async fn is_dir(&self) -> bool {
        async_fs::metadata(&self.root)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::storage::EntryType;

    #[test]
    fn test_resolve_stays_under_root() {
        let tree = FsTree::new("/srv/data");
        assert_eq!(tree.resolve("/"), PathBuf::from("/srv/data"));
        assert_eq!(tree.resolve("/a/b.txt"), PathBuf::from("/srv/data/a/b.txt"));
    }

    #[test]
    fn test_list_reports_types() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            std::fs::create_dir(dir.path().join("sub")).unwrap();
            std::fs::write(dir.path().join("a.txt"), b"abc").unwrap();
            let tree = FsTree::new(dir.path());

            let mut entries = tree.list("/").await.unwrap();
            entries.sort_by(|a, b| a.name.cmp(&b.name));
            assert_eq!(entries.len(), 2);
            assert_eq!(entries[0].path, "/a.txt");
            assert_eq!(entries[0].size, Some(3));
            assert_eq!(entries[1].entry_type, EntryType::Directory);
        });
    }

    #[cfg(unix)]
    #[test]
    fn test_symlink_keeps_target() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("real.txt"), b"x").unwrap();
            std::os::unix::fs::symlink("real.txt", dir.path().join("link")).unwrap();
            let tree = FsTree::new(dir.path());

            let entry = tree.stat("/link").await.unwrap();
            assert_eq!(entry.entry_type, EntryType::Symlink);
            assert_eq!(
                entry.metadata.and_then(|m| m.symlink_target).as_deref(),
                Some("real.txt")
            );
        });
    }

    #[test]
    fn test_read_range_and_stream() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let tree = FsTree::new(dir.path());
            tree.write("/nested/f.bin", Bytes::from_static(b"0123456789"))
                .await
                .unwrap();

            let slice = tree.read_range("/nested/f.bin", 3, 4).await.unwrap();
            assert_eq!(&slice[..], b"3456");
            let tail = tree.read_range("/nested/f.bin", 8, 10).await.unwrap();
            assert_eq!(&tail[..], b"89");

            let stream = tree.read("/nested/f.bin").await.unwrap();
            let all = crate::services::transfer::read_all(stream).await.unwrap();
            assert_eq!(&all[..], b"0123456789");
        });
    }

    #[test]
    fn test_missing_file_is_not_found() {
        smol::block_on(async {
            let dir = tempfile::tempdir().unwrap();
            let tree = FsTree::new(dir.path());
            let err = tree.delete("/nope.txt").await.unwrap_err();
            assert!(err.is_not_found());
            assert!(err.message().starts_with("/nope.txt"));
        });
    }
}
