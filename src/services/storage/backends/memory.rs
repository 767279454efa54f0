//! In-memory backend with fault injection, used to drive engine and
//! provider tests.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::services::storage::pagination::paginate;
use crate::services::storage::{
    ByteStream, Capability, CapabilitySet, CompletedPart, Entry, KeyOutcome, ListOptions,
    ListResult, OperationError, OperationResult, PathStyle, ProviderKind, StorageBackend,
    TransferLimits,
};

const POSIX_CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
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
]);

const OBJECT_CAPABILITIES: CapabilitySet = CapabilitySet::of(&[
    Capability::List,
    Capability::Read,
    Capability::Write,
    Capability::Delete,
    Capability::Copy,
    Capability::Move,
    Capability::ServerSideCopy,
    Capability::Download,
    Capability::Upload,
    Capability::Resume,
    Capability::Metadata,
    Capability::BatchDelete,
]);

/// Calls observed by the backend.
#[derive(Debug, Clone, Default)]
pub struct CallLog {
    pub reads: Vec<String>,
    pub range_reads: usize,
    pub writes: Vec<String>,
    pub deletes: Vec<String>,
    pub server_copies: Vec<(String, String)>,
    pub renames: Vec<(String, String)>,
    pub rmdirs: Vec<String>,
    pub batch_sizes: Vec<usize>,
    pub begun: Vec<String>,
    pub parts_started: Vec<u32>,
    pub part_finish_order: Vec<u32>,
    /// `(upload id, part numbers in completion request order)`
    pub completed: Vec<(String, Vec<u32>)>,
    pub aborted: Vec<String>,
}

#[derive(Debug, Default)]
struct Faults {
    keys: HashSet<String>,
    part: Option<u32>,
    delayed_part: Option<(u32, Duration)>,
    list: bool,
    batches: bool,
    transient: HashMap<String, u32>,
    broken_streams: HashMap<String, usize>,
}

#[derive(Debug)]
struct Upload {
    path: String,
    parts: BTreeMap<u32, Bytes>,
}

#[derive(Debug, Default)]
struct State {
    files: BTreeMap<String, Bytes>,
    dirs: BTreeSet<String>,
    uploads: HashMap<String, Upload>,
    next_upload: u64,
    faults: Faults,
    log: CallLog,
}

/// Clones share the same state, so a test can keep a handle on a backend
/// it hands to a provider.
#[derive(Clone)]
pub struct MemoryBackend {
    kind: ProviderKind,
    style: PathStyle,
    capabilities: CapabilitySet,
    object_store: bool,
    state: Arc<Mutex<State>>,
}

fn injected(path: &str) -> OperationError {
    OperationError::error(format!("Injected failure for {}", path)).with_code("injected_failure")
}

impl MemoryBackend {
    /// Hierarchical namespace with explicit directories and native rename.
    pub fn posix() -> Self {
        Self {
            kind: ProviderKind::Local,
            style: PathStyle::Posix,
            capabilities: POSIX_CAPABILITIES,
            object_store: false,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    /// Flat key namespace with server-side copy, batch delete and
    /// multipart uploads.
    pub fn object_store() -> Self {
        Self {
            kind: ProviderKind::S3,
            style: PathStyle::ObjectKey,
            capabilities: OBJECT_CAPABILITIES,
            object_store: true,
            state: Arc::new(Mutex::new(State::default())),
        }
    }

    pub fn with_capabilities(mut self, capabilities: CapabilitySet) -> Self {
        self.capabilities = capabilities;
        self
    }

    fn state(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert(&self, path: &str, data: Bytes) {
        self.state().files.insert(path.to_string(), data);
    }

    pub fn contents(&self, path: &str) -> Option<Bytes> {
        self.state().files.get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.is_dir(&self.state(), path)
    }

    pub fn open_uploads(&self) -> usize {
        self.state().uploads.len()
    }

    pub fn log(&self) -> CallLog {
        self.state().log.clone()
    }

    pub fn fail_key(&self, key: &str) {
        self.state().faults.keys.insert(key.to_string());
    }

    pub fn fail_part(&self, part_number: u32) {
        self.state().faults.part = Some(part_number);
    }

    pub fn delay_part(&self, part_number: u32, delay: Duration) {
        self.state().faults.delayed_part = Some((part_number, delay));
    }

    pub fn fail_list(&self, fail: bool) {
        self.state().faults.list = fail;
    }

    pub fn fail_batches(&self, fail: bool) {
        self.state().faults.batches = fail;
    }

    /// Make the next `times` writes to `key` fail with a retryable error.
    pub fn fail_transiently(&self, key: &str, times: u32) {
        self.state().faults.transient.insert(key.to_string(), times);
    }

    /// Make reads of `key` fail after `chunks` chunks have been yielded.
    pub fn break_stream_after(&self, key: &str, chunks: usize) {
        self.state().faults.broken_streams.insert(key.to_string(), chunks);
    }

    fn check_key(state: &mut State, key: &str) -> OperationResult<()> {
        if state.faults.keys.contains(key) {
            return Err(injected(key));
        }
        if let Some(remaining) = state.faults.transient.get_mut(key) {
            if *remaining > 0 {
                *remaining -= 1;
                return Err(OperationError::connection_failed(format!(
                    "Injected transient failure for {}",
                    key
                )));
            }
        }
        Ok(())
    }

    fn is_dir(&self, state: &State, path: &str) -> bool {
        if self.style.is_root(path) || state.dirs.contains(path) {
            return true;
        }
        let prefix = format!("{}/", path.trim_end_matches('/'));
        state.files.keys().any(|k| k.starts_with(&prefix))
            || state.dirs.iter().any(|d| d.starts_with(&prefix))
    }

    fn children(&self, state: &State, path: &str, recursive: bool) -> Vec<Entry> {
        let mut files = Vec::new();
        let mut dirs = BTreeSet::new();

        for (key, data) in &state.files {
            let Some(rel) = self.style.relative(path, key) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            match rel.split_once('/') {
                Some(_) if recursive => files.push(Entry::file(key.clone(), data.len() as u64, None)),
                Some((first, _)) => {
                    dirs.insert(self.style.join(path, first));
                }
                None => files.push(Entry::file(key.clone(), data.len() as u64, None)),
            }
        }
        for dir in &state.dirs {
            let Some(rel) = self.style.relative(path, dir) else {
                continue;
            };
            if rel.is_empty() {
                continue;
            }
            let first = rel.split('/').next().unwrap_or(rel);
            dirs.insert(self.style.join(path, first));
        }

        files.extend(dirs.into_iter().map(Entry::directory));
        files
    }
}

#[async_trait]
impl StorageBackend for MemoryBackend {
    fn kind(&self) -> ProviderKind {
        self.kind
    }

    fn capabilities(&self) -> CapabilitySet {
        self.capabilities
    }

    fn path_style(&self) -> PathStyle {
        self.style
    }

    fn limits(&self) -> TransferLimits {
        TransferLimits {
            max_batch_delete: 1000,
            ..Default::default()
        }
    }

    fn object_uri(&self, path: &str) -> String {
        format!("memory://{}", path.trim_start_matches('/'))
    }

    fn native_recursive_list(&self) -> bool {
        self.object_store
    }

    fn supports_multipart(&self) -> bool {
        self.object_store
    }

    async fn list_page(&self, path: &str, options: &ListOptions) -> OperationResult<ListResult> {
        let state = self.state();
        if state.faults.list {
            return Err(injected(path));
        }
        if !self.object_store && !self.is_dir(&state, path) {
            return Err(OperationError::not_found(path));
        }
        let recursive = options.recursive && self.object_store;
        let entries = self.children(&state, path, recursive);
        paginate(entries, options, path)
    }

    async fn stat(&self, path: &str) -> OperationResult<Entry> {
        let state = self.state();
        if let Some(data) = state.files.get(path) {
            return Ok(Entry::file(path, data.len() as u64, None));
        }
        if self.is_dir(&state, path) {
            return Ok(Entry::directory(path));
        }
        Err(OperationError::not_found(path))
    }

    async fn read(&self, path: &str) -> OperationResult<ByteStream> {
        let mut state = self.state();
        Self::check_key(&mut state, path)?;
        state.log.reads.push(path.to_string());
        let data = state
            .files
            .get(path)
            .cloned()
            .ok_or_else(|| OperationError::not_found(path))?;
        let mut chunks: Vec<OperationResult<Bytes>> = data
            .chunks(4)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        if let Some(&keep) = state.faults.broken_streams.get(path) {
            chunks.truncate(keep);
            chunks.push(Err(injected(path)));
        }
        Ok(futures::stream::iter(chunks).boxed())
    }

    async fn read_range(&self, path: &str, offset: u64, length: u64) -> OperationResult<Bytes> {
        let mut state = self.state();
        Self::check_key(&mut state, path)?;
        state.log.range_reads += 1;
        let data = state
            .files
            .get(path)
            .ok_or_else(|| OperationError::not_found(path))?;
        let start = (offset as usize).min(data.len());
        let end = (offset.saturating_add(length) as usize).min(data.len());
        Ok(data.slice(start..end))
    }

    async fn write(&self, path: &str, data: Bytes) -> OperationResult<()> {
        let mut state = self.state();
        Self::check_key(&mut state, path)?;
        state.log.writes.push(path.to_string());
        state.files.insert(path.to_string(), data);
        Ok(())
    }

    async fn delete(&self, path: &str) -> OperationResult<()> {
        let mut state = self.state();
        Self::check_key(&mut state, path)?;
        state.log.deletes.push(path.to_string());
        match state.files.remove(path) {
            Some(_) => Ok(()),
            None => Err(OperationError::not_found(path)),
        }
    }

    async fn mkdir(&self, path: &str) -> OperationResult<()> {
        self.state().dirs.insert(path.to_string());
        Ok(())
    }

    async fn rmdir(&self, path: &str) -> OperationResult<()> {
        let mut state = self.state();
        state.log.rmdirs.push(path.to_string());
        if !self.children(&state, path, false).is_empty() {
            return Err(OperationError::error(format!("Directory not empty: {}", path)));
        }
        state.dirs.remove(path);
        Ok(())
    }

    async fn server_copy(&self, src: &str, dst: &str) -> OperationResult<()> {
        let mut state = self.state();
        Self::check_key(&mut state, src)?;
        let data = state
            .files
            .get(src)
            .cloned()
            .ok_or_else(|| OperationError::not_found(src))?;
        state.log.server_copies.push((src.to_string(), dst.to_string()));
        state.files.insert(dst.to_string(), data);
        Ok(())
    }

    async fn rename(&self, src: &str, dst: &str) -> OperationResult<()> {
        if self.object_store {
            return Err(OperationError::unimplemented("rename"));
        }
        let mut state = self.state();
        Self::check_key(&mut state, src)?;
        let prefix = format!("{}/", src);
        let moved: Vec<String> = state
            .files
            .keys()
            .filter(|k| k.as_str() == src || k.starts_with(&prefix))
            .cloned()
            .collect();
        let moved_dirs: Vec<String> = state
            .dirs
            .iter()
            .filter(|d| d.as_str() == src || d.starts_with(&prefix))
            .cloned()
            .collect();
        if moved.is_empty() && moved_dirs.is_empty() {
            return Err(OperationError::not_found(src));
        }
        for key in moved {
            if let Some(data) = state.files.remove(&key) {
                state.files.insert(format!("{}{}", dst, &key[src.len()..]), data);
            }
        }
        for dir in moved_dirs {
            state.dirs.remove(&dir);
            state.dirs.insert(format!("{}{}", dst, &dir[src.len()..]));
        }
        state.log.renames.push((src.to_string(), dst.to_string()));
        Ok(())
    }

    async fn delete_batch(&self, keys: &[String]) -> OperationResult<Vec<KeyOutcome>> {
        let mut state = self.state();
        state.log.batch_sizes.push(keys.len());
        if state.faults.batches {
            return Err(OperationError::error("Injected batch failure").with_code("injected_failure"));
        }
        let mut outcomes = Vec::with_capacity(keys.len());
        for key in keys {
            match Self::check_key(&mut state, key) {
                Ok(()) => {
                    state.files.remove(key);
                    state.log.deletes.push(key.clone());
                    outcomes.push(KeyOutcome::ok(key.clone()));
                }
                Err(e) => outcomes.push(KeyOutcome::failed(key.clone(), e)),
            }
        }
        Ok(outcomes)
    }

    async fn multipart_begin(&self, path: &str) -> OperationResult<String> {
        let mut state = self.state();
        state.next_upload += 1;
        let id = format!("upload-{}", state.next_upload);
        state.uploads.insert(
            id.clone(),
            Upload {
                path: path.to_string(),
                parts: BTreeMap::new(),
            },
        );
        state.log.begun.push(id.clone());
        Ok(id)
    }

    async fn multipart_put_part(
        &self,
        upload_id: &str,
        part_number: u32,
        data: Bytes,
    ) -> OperationResult<CompletedPart> {
        let delay = {
            let mut state = self.state();
            state.log.parts_started.push(part_number);
            if state.faults.part == Some(part_number) {
                return Err(injected(&format!("part {}", part_number)));
            }
            state
                .faults
                .delayed_part
                .filter(|(n, _)| *n == part_number)
                .map(|(_, d)| d)
        };
        if let Some(delay) = delay {
            smol::Timer::after(delay).await;
        }

        let mut state = self.state();
        let size = data.len() as u64;
        let upload = state
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| OperationError::not_found(upload_id))?;
        upload.parts.insert(part_number, data);
        state.log.part_finish_order.push(part_number);
        Ok(CompletedPart {
            part_number,
            etag: Some(format!("etag-{}", part_number)),
            size,
        })
    }

    async fn multipart_complete(&self, upload_id: &str, parts: &[CompletedPart]) -> OperationResult<()> {
        let mut state = self.state();
        let upload = state
            .uploads
            .remove(upload_id)
            .ok_or_else(|| OperationError::not_found(upload_id))?;
        let mut assembled = BytesMut::new();
        for part in parts {
            let data = upload
                .parts
                .get(&part.part_number)
                .ok_or_else(|| OperationError::invalid_input("Unknown part"))?;
            assembled.extend_from_slice(data);
        }
        state.log.completed.push((
            upload_id.to_string(),
            parts.iter().map(|p| p.part_number).collect(),
        ));
        state.files.insert(upload.path, assembled.freeze());
        Ok(())
    }

    async fn multipart_abort(&self, upload_id: &str) -> OperationResult<()> {
        let mut state = self.state();
        state.uploads.remove(upload_id);
        state.log.aborted.push(upload_id.to_string());
        Ok(())
    }
}
