//! Filesystem-backed object store with a single-writer header-byte cache
//! (spec §4.2).
//!
//! Grounded in `original_source/cdn/backends/filesystem/filesystem.go`,
//! `file-object.go`, and `file-object-reader.go`. The cache-fill latch
//! (`claim`/`push`/`mark_filled`) mirrors `FileObject.doCache` and
//! `FileObject.Write`; `FileObjectReader` fixes the legacy `Seek` bug (spec
//! §9(b)): `whence` now has the ordinary `SeekFrom` meaning instead of
//! treating `SeekFrom::Start` as relative to the current cache index.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use tokio::io::AsyncReadExt;

use crate::error::BackendError;
use crate::range;
use crate::writer::ByteSink;

use super::Backend;

/// Tunables pulled out of a zone's `backendSettings` map (spec §3).
#[derive(Clone, Debug)]
pub struct FsBackendConfig {
    pub directory_path: PathBuf,
    pub cached_header_bytes: usize,
    pub exists_check_can_file_open: bool,
    pub watch_modified: bool,
    pub mime_type_by_extension: bool,
    pub list_directories: bool,
    pub directory_modified_time_check: bool,
    pub calculate_etags: bool,
}

impl FsBackendConfig {
    /// Reads the string-keyed `backendSettings` map (spec §3) into typed
    /// fields, matching `NewFileSystemBackend`'s defaults in the original.
    pub fn from_settings(settings: &std::collections::HashMap<String, String>) -> Self {
        let get_bool = |key: &str, default: bool| {
            settings
                .get(key)
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(default)
        };
        let get_usize = |key: &str, default: usize| {
            settings.get(key).and_then(|v| v.parse().ok()).unwrap_or(default)
        };
        Self {
            directory_path: PathBuf::from(
                settings.get("directoryPath").cloned().unwrap_or_else(|| ".".to_string()),
            ),
            cached_header_bytes: get_usize("cachedHeaderBytes", 0),
            exists_check_can_file_open: get_bool("existsCheckCanFileOpen", false),
            watch_modified: get_bool("watchModified", true),
            mime_type_by_extension: get_bool("mimeTypeByExtension", true),
            list_directories: get_bool("listDirectories", false),
            directory_modified_time_check: get_bool("directoryModifiedTimeCheck", false),
            calculate_etags: get_bool("calculateETags", true),
        }
    }
}

struct CacheBuf {
    bytes: Vec<u8>,
    filled: usize,
}

/// Per-path cached state: size/mtime plus an optional prefix byte cache
/// protected by a single-writer latch (spec §4.2, §5).
pub struct FileObject {
    pub size: i64,
    pub modify_time: SystemTime,
    cache_capacity: usize,
    buf: Mutex<CacheBuf>,
    claimed: AtomicBool,
    filled: AtomicBool,
}

impl FileObject {
    fn new(cache_capacity: usize, size: i64, modify_time: SystemTime) -> Self {
        Self {
            size,
            modify_time,
            cache_capacity,
            buf: Mutex::new(CacheBuf {
                bytes: Vec::with_capacity(cache_capacity),
                filled: 0,
            }),
            claimed: AtomicBool::new(false),
            filled: AtomicBool::new(false),
        }
    }

    pub fn cache_capacity(&self) -> usize {
        self.cache_capacity
    }

    /// Test-and-set: only the first caller to claim a `FileObject` becomes
    /// its cache-fill owner (spec §4.2 `doCache`). Readers that lose the
    /// race bypass the cache and read the file directly while the owner
    /// fills it.
    pub fn claim(&self) -> bool {
        self.cache_capacity > 0
            && self
                .claimed
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }

    pub fn is_filled(&self) -> bool {
        self.filled.load(Ordering::Acquire)
    }

    /// Appends to the prefix buffer, owner-only, monotonic up to capacity.
    pub fn push(&self, data: &[u8]) {
        let mut buf = self.buf.lock();
        if buf.filled >= self.cache_capacity {
            return;
        }
        let take = data.len().min(self.cache_capacity - buf.filled);
        buf.bytes.extend_from_slice(&data[..take]);
        buf.filled += take;
    }

    pub fn mark_filled(&self) {
        self.filled.store(true, Ordering::Release);
    }

    /// Serves up to `out.len()` bytes starting at `at` from the prefix
    /// buffer. Returns 0 once `at` is past the cached prefix.
    pub fn read_prefix(&self, at: usize, out: &mut [u8]) -> usize {
        let buf = self.buf.lock();
        if at >= buf.filled {
            return 0;
        }
        let take = out.len().min(buf.filled - at);
        out[..take].copy_from_slice(&buf.bytes[at..at + take]);
        take
    }
}

/// Reads an object's bytes, serving the cached prefix from memory once
/// filled and falling back to the real file otherwise.
pub struct FileObjectReader {
    file_path: PathBuf,
    object: Arc<FileObject>,
    position: u64,
    file: Option<tokio::fs::File>,
}

impl FileObjectReader {
    pub fn new(file_path: PathBuf, object: Arc<FileObject>) -> Self {
        Self {
            file_path,
            object,
            position: 0,
            file: None,
        }
    }

    /// Standard `whence` semantics: `Start`/`Current`/`End` all compute an
    /// absolute offset, fixing the legacy bug where `Start` was added to
    /// the current position instead of replacing it (spec §9(b)).
    pub fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        let size = self.object.size.max(0) as u64;
        let new_pos: i64 = match pos {
            SeekFrom::Start(n) => n as i64,
            SeekFrom::Current(n) => self.position as i64 + n,
            SeekFrom::End(n) => size as i64 + n,
        };
        if new_pos < 0 || new_pos as u64 > size {
            return Err(io::Error::new(io::ErrorKind::InvalidInput, "seek index out of range"));
        }
        self.position = new_pos as u64;
        self.file = None;
        Ok(self.position)
    }

    pub async fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.object.is_filled() {
            let served = self.object.read_prefix(self.position as usize, buf);
            if served > 0 {
                self.position += served as u64;
                return Ok(served);
            }
        }
        let size = self.object.size.max(0) as u64;
        if self.position >= size {
            return Ok(0);
        }
        if self.file.is_none() {
            use tokio::io::AsyncSeekExt;
            let mut file = tokio::fs::File::open(&self.file_path).await?;
            if self.position > 0 {
                file.seek(SeekFrom::Start(self.position)).await?;
            }
            self.file = Some(file);
        }
        let file = self.file.as_mut().expect("just opened above");
        let n = file.read(buf).await?;
        self.position += n as u64;
        Ok(n)
    }
}

struct FsState {
    file_objects: FxHashMap<String, Arc<FileObject>>,
    etags: FxHashMap<String, String>,
}

pub struct FilesystemBackend {
    config: FsBackendConfig,
    state: Mutex<FsState>,
}

impl FilesystemBackend {
    pub fn new(config: FsBackendConfig) -> Self {
        Self {
            config,
            state: Mutex::new(FsState {
                file_objects: FxHashMap::default(),
                etags: FxHashMap::default(),
            }),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.config.directory_path.join(path.trim_start_matches('/'))
    }

    /// Stats `path` on disk, maintaining the ETag map as a side effect when
    /// enabled (spec §4.2). Takes `state` by reference rather than
    /// re-locking `self.state` since callers already hold the lock.
    fn direct_stats(&self, path: &str, state: &mut FsState) -> Result<(i64, SystemTime), BackendError> {
        let full = self.resolve(path);
        let meta = std::fs::metadata(&full).map_err(classify_io_err)?;
        let modified = meta.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        if meta.is_dir() {
            if self.config.calculate_etags {
                state
                    .etags
                    .insert(path.to_string(), range::filesystem_etag(-1, modified));
            }
            let reported_modified = if self.config.directory_modified_time_check {
                modified
            } else {
                SystemTime::UNIX_EPOCH
            };
            Ok((-1, reported_modified))
        } else {
            if self.config.calculate_etags {
                state
                    .etags
                    .insert(path.to_string(), range::filesystem_etag(meta.len() as i64, modified));
            }
            Ok((meta.len() as i64, modified))
        }
    }

    /// Single backend-wide mutex covers lookup + insert + invalidation
    /// (spec §4.2, §5); it is released before any I/O that reads object
    /// content.
    fn get_file_object(&self, path: &str) -> Result<Arc<FileObject>, BackendError> {
        let mut state = self.state.lock();

        if self.config.watch_modified {
            if let Some(existing) = state.file_objects.get(path).cloned() {
                match self.direct_stats(path, &mut state) {
                    Ok((size, modified)) if size == existing.size && modified == existing.modify_time => {}
                    Ok(_) => {
                        state.file_objects.remove(path);
                    }
                    Err(e) => return Err(e),
                }
            }
        }

        if let Some(obj) = state.file_objects.get(path) {
            return Ok(obj.clone());
        }

        let (size, modified) = self.direct_stats(path, &mut state)?;
        if size < 0 {
            return Ok(Arc::new(FileObject::new(0, -1, modified)));
        }
        let obj = Arc::new(FileObject::new(self.config.cached_header_bytes, size, modified));
        state.file_objects.insert(path.to_string(), obj.clone());
        Ok(obj)
    }

    async fn stream_from(
        reader: &mut FileObjectReader,
        sink: &mut (impl ByteSink + Send),
        mut remaining: u64,
    ) -> Result<(), BackendError> {
        let mut chunk = [0u8; 8192];
        while remaining > 0 {
            let want = chunk.len().min(remaining as usize);
            let n = reader.read(&mut chunk[..want]).await?;
            if n == 0 {
                break;
            }
            sink.send(&chunk[..n]).await?;
            remaining -= n as u64;
        }
        Ok(())
    }

    /// Reads the whole file once to fill `fobj`'s prefix cache, optionally
    /// mirroring every chunk to `mirror` as it goes (used by `write_data`
    /// so the claim owner serves its own request in the same pass).
    async fn fill_cache<S: ByteSink + Send>(
        &self,
        fobj: &Arc<FileObject>,
        full_path: &Path,
        mut mirror: Option<&mut S>,
    ) -> Result<(), BackendError> {
        let mut file = tokio::fs::File::open(full_path).await?;
        let mut chunk = [0u8; 8192];
        loop {
            let n = file.read(&mut chunk).await?;
            if n == 0 {
                break;
            }
            fobj.push(&chunk[..n]);
            if let Some(sink) = mirror.as_deref_mut() {
                sink.send(&chunk[..n]).await?;
            }
        }
        fobj.mark_filled();
        Ok(())
    }
}

fn classify_io_err(e: io::Error) -> BackendError {
    if e.kind() == io::ErrorKind::NotFound {
        BackendError::NotFound
    } else {
        BackendError::Io(e)
    }
}

impl Backend for FilesystemBackend {
    fn exists(&self, path: &str) -> (bool, bool) {
        let full = self.resolve(path);
        match std::fs::metadata(&full) {
            Ok(meta) if meta.is_dir() => (self.config.list_directories, true),
            Ok(_) => {
                if self.config.exists_check_can_file_open {
                    (std::fs::File::open(&full).is_ok(), false)
                } else {
                    (true, false)
                }
            }
            Err(_) => (false, false),
        }
    }

    async fn stats(&self, path: &str) -> Result<(i64, SystemTime), BackendError> {
        let obj = self.get_file_object(path)?;
        Ok((obj.size, obj.modify_time))
    }

    fn mime_type(&self, path: &str) -> String {
        if !self.config.mime_type_by_extension {
            return String::new();
        }
        crate::mime::get_mime_type(path).to_string()
    }

    fn etag(&self, path: &str) -> String {
        if !self.config.calculate_etags {
            return String::new();
        }
        let mut state = self.state.lock();
        if !state.etags.contains_key(path) {
            let _ = self.direct_stats(path, &mut state);
        }
        state.etags.get(path).cloned().unwrap_or_default()
    }

    async fn write_data<S: ByteSink + Send>(&self, path: &str, sink: &mut S) -> Result<(), BackendError> {
        let fobj = self.get_file_object(path)?;
        if fobj.size < 0 {
            return Err(BackendError::NotReadable);
        }
        let full_path = self.resolve(path);

        if fobj.claim() {
            self.fill_cache(&fobj, &full_path, Some(sink)).await
        } else {
            let mut reader = FileObjectReader::new(full_path, fobj.clone());
            Self::stream_from(&mut reader, sink, fobj.size.max(0) as u64).await
        }
    }

    async fn write_data_range<S: ByteSink + Send>(
        &self,
        path: &str,
        sink: &mut S,
        start: u64,
        length: u64,
    ) -> Result<(), BackendError> {
        let fobj = self.get_file_object(path)?;
        if fobj.size < 0 {
            return Err(BackendError::NotReadable);
        }
        let full_path = self.resolve(path);

        if fobj.claim() {
            // The claim owner always fills the cache from byte zero first,
            // then serves the requested window, regardless of where it
            // starts (spec §4.2(b)).
            self.fill_cache::<S>(&fobj, &full_path, None).await?;
        }

        let mut reader = FileObjectReader::new(full_path, fobj);
        reader.seek(SeekFrom::Start(start))?;
        Self::stream_from(&mut reader, sink, length).await
    }

    fn purge(&self, path: &str) -> Result<(), BackendError> {
        let mut state = self.state.lock();
        state.file_objects.remove(path);
        state.etags.remove(path);
        Ok(())
    }

    fn list(&self, path: &str) -> Result<Vec<String>, BackendError> {
        let full = self.resolve(path);
        let mut names = Vec::new();
        for entry in std::fs::read_dir(&full).map_err(classify_io_err)? {
            let entry = entry.map_err(BackendError::Io)?;
            names.push(entry.file_name().to_string_lossy().into_owned());
        }
        names.sort();
        Ok(names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend(dir: &Path, cache_bytes: usize) -> FilesystemBackend {
        FilesystemBackend::new(FsBackendConfig {
            directory_path: dir.to_path_buf(),
            cached_header_bytes: cache_bytes,
            exists_check_can_file_open: false,
            watch_modified: true,
            mime_type_by_extension: true,
            list_directories: true,
            directory_modified_time_check: false,
            calculate_etags: true,
        })
    }

    #[tokio::test]
    async fn write_data_streams_full_contents() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"hello world").unwrap();
        let backend = backend(dir.path(), 4);
        let mut out = Vec::new();
        backend.write_data("a.txt", &mut out).await.unwrap();
        assert_eq!(out, b"hello world");
    }

    #[tokio::test]
    async fn write_data_range_streams_window() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"0123456789").unwrap();
        let backend = backend(dir.path(), 4);
        let mut out = Vec::new();
        backend.write_data_range("a.txt", &mut out, 3, 4).await.unwrap();
        assert_eq!(out, b"3456");
    }

    #[tokio::test]
    async fn concurrent_reads_agree_after_cache_fill() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"abcdefghij").unwrap();
        let backend = Arc::new(backend(dir.path(), 5));

        let mut first = Vec::new();
        backend.write_data("a.txt", &mut first).await.unwrap();

        let mut second = Vec::new();
        backend.write_data("a.txt", &mut second).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, b"abcdefghij");
    }

    #[tokio::test]
    async fn purge_drops_cached_state() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.txt"), b"data").unwrap();
        let backend = backend(dir.path(), 4);
        let _ = backend.stats("a.txt").await.unwrap();
        backend.purge("a.txt").unwrap();
        let etag_before = backend.etag("a.txt");
        assert!(!etag_before.is_empty());
    }

    #[test]
    fn directory_reports_negative_size() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        let backend = backend(dir.path(), 4);
        let (exists, listable) = backend.exists("sub");
        assert!(exists);
        assert!(listable);
    }
}
