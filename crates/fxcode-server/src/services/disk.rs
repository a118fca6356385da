//! File-system collaborator used by the file channel.
//!
//! [`FileSystemProvider`] is the narrow surface the channel needs; the
//! [`DiskFileSystemProvider`] implementation works directly on the local
//! disk with `tokio::fs`, numeric descriptors for open files and `notify`
//! watchers for change events.

use async_trait::async_trait;
use fxcode_core::codec::MAX_FRAME_SIZE;
use fxcode_core::{FxError, FxResult};
use notify::event::{ModifyKind, RenameMode};
use notify::{EventKind, RecursiveMode, Watcher};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

pub const FILE_TYPE_UNKNOWN: u32 = 0;
pub const FILE_TYPE_FILE: u32 = 1;
pub const FILE_TYPE_DIRECTORY: u32 = 2;
pub const FILE_TYPE_SYMBOLIC_LINK: u32 = 64;

const DEFAULT_STREAM_CHUNK: usize = 64 * 1024;

/// Largest single `read`; the reply has to fit in one frame.
pub const MAX_READ_LENGTH: usize = MAX_FRAME_SIZE / 2;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileStat {
    #[serde(rename = "type")]
    pub file_type: u32,
    /// Milliseconds since the epoch.
    pub ctime: u64,
    pub mtime: u64,
    pub size: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(into = "u8")]
pub enum FileChangeType {
    Updated = 0,
    Added = 1,
    Deleted = 2,
}

impl From<FileChangeType> for u8 {
    fn from(t: FileChangeType) -> u8 {
        t as u8
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileChange {
    pub path: PathBuf,
    pub kind: FileChangeType,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OpenOptions {
    /// Open for writing, creating or truncating the file.
    pub create: bool,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WriteOptions {
    pub create: bool,
    pub overwrite: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            create: true,
            overwrite: true,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct DeleteOptions {
    pub recursive: bool,
    pub use_trash: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct OverwriteOptions {
    pub overwrite: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct WatchOptions {
    pub recursive: bool,
    pub excludes: Vec<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ReadStreamOptions {
    pub position: Option<u64>,
    pub length: Option<u64>,
    pub buffer_size: Option<usize>,
}

/// One step of a streamed read. `End` is always the last event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadStreamEvent {
    Data(Vec<u8>),
    Error(String),
    End,
}

/// Receives batches of changes from a watch.
pub type ChangeSink = Arc<dyn Fn(Vec<FileChange>) + Send + Sync>;

/// Keeps a watch alive; dropping it stops the watch.
pub struct WatchHandle {
    _guard: Box<dyn Send>,
}

impl WatchHandle {
    pub fn new(guard: impl Send + 'static) -> Self {
        Self {
            _guard: Box::new(guard),
        }
    }
}

#[async_trait]
pub trait FileSystemProvider: Send + Sync {
    async fn stat(&self, path: &Path) -> FxResult<FileStat>;
    async fn open(&self, path: &Path, opts: OpenOptions) -> FxResult<u64>;
    async fn close(&self, fd: u64) -> FxResult<()>;
    /// Read up to `length` bytes at `pos`; fewer at end of file.
    async fn read(&self, fd: u64, pos: u64, length: usize) -> FxResult<Vec<u8>>;
    async fn write(&self, fd: u64, pos: u64, data: &[u8]) -> FxResult<usize>;
    async fn read_file(&self, path: &Path) -> FxResult<Vec<u8>>;
    async fn write_file(&self, path: &Path, data: &[u8], opts: WriteOptions) -> FxResult<()>;
    async fn delete(&self, path: &Path, opts: DeleteOptions) -> FxResult<()>;
    async fn mkdir(&self, path: &Path) -> FxResult<()>;
    async fn readdir(&self, path: &Path) -> FxResult<Vec<(String, u32)>>;
    async fn rename(&self, from: &Path, to: &Path, opts: OverwriteOptions) -> FxResult<()>;
    async fn copy(&self, from: &Path, to: &Path, opts: OverwriteOptions) -> FxResult<()>;
    fn watch(&self, path: &Path, opts: WatchOptions, sink: ChangeSink) -> FxResult<WatchHandle>;
    /// Start a streamed read that stops early once `cancel` fires.
    fn read_file_stream(
        &self,
        path: &Path,
        opts: ReadStreamOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ReadStreamEvent>;
}

type OpenFile = Arc<tokio::sync::Mutex<tokio::fs::File>>;

/// Local-disk provider.
pub struct DiskFileSystemProvider {
    files: Mutex<HashMap<u64, OpenFile>>,
    next_fd: AtomicU64,
}

impl Default for DiskFileSystemProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl DiskFileSystemProvider {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            next_fd: AtomicU64::new(1),
        }
    }

    fn file(&self, fd: u64) -> FxResult<OpenFile> {
        self.files
            .lock()
            .map_err(|_| FxError::Other("descriptor table poisoned".into()))?
            .get(&fd)
            .cloned()
            .ok_or_else(|| bad_descriptor(fd))
    }

    pub fn open_descriptors(&self) -> usize {
        self.files.lock().map(|f| f.len()).unwrap_or(0)
    }
}

#[async_trait]
impl FileSystemProvider for DiskFileSystemProvider {
    async fn stat(&self, path: &Path) -> FxResult<FileStat> {
        let link = tokio::fs::symlink_metadata(path).await?;
        let (meta, link_bit) = if link.file_type().is_symlink() {
            // A dangling link still stats as a link.
            match tokio::fs::metadata(path).await {
                Ok(target) => (target, FILE_TYPE_SYMBOLIC_LINK),
                Err(_) => (link, FILE_TYPE_SYMBOLIC_LINK),
            }
        } else {
            (link, 0)
        };
        let kind = if meta.is_dir() {
            FILE_TYPE_DIRECTORY
        } else if meta.is_file() {
            FILE_TYPE_FILE
        } else {
            FILE_TYPE_UNKNOWN
        };
        Ok(FileStat {
            file_type: kind | link_bit,
            ctime: millis(meta.created().ok()),
            mtime: millis(meta.modified().ok()),
            size: meta.len(),
        })
    }

    async fn open(&self, path: &Path, opts: OpenOptions) -> FxResult<u64> {
        let file = if opts.create {
            tokio::fs::OpenOptions::new()
                .write(true)
                .create(true)
                .truncate(true)
                .open(path)
                .await?
        } else {
            tokio::fs::File::open(path).await?
        };
        let fd = self.next_fd.fetch_add(1, Ordering::Relaxed);
        self.files
            .lock()
            .map_err(|_| FxError::Other("descriptor table poisoned".into()))?
            .insert(fd, Arc::new(tokio::sync::Mutex::new(file)));
        debug!(fd, path = %path.display(), "opened");
        Ok(fd)
    }

    async fn close(&self, fd: u64) -> FxResult<()> {
        let file = self
            .files
            .lock()
            .map_err(|_| FxError::Other("descriptor table poisoned".into()))?
            .remove(&fd)
            .ok_or_else(|| bad_descriptor(fd))?;
        let mut file = file.lock().await;
        file.flush().await?;
        Ok(())
    }

    async fn read(&self, fd: u64, pos: u64, length: usize) -> FxResult<Vec<u8>> {
        if length > MAX_READ_LENGTH {
            return Err(FxError::InvalidMessage(format!(
                "read of {length} bytes exceeds the limit of {MAX_READ_LENGTH}"
            )));
        }
        let file = self.file(fd)?;
        let mut file = file.lock().await;
        let available = file.metadata().await?.len().saturating_sub(pos);
        let length = usize::try_from(available).map_or(length, |a| a.min(length));

        let mut buf = Vec::new();
        buf.try_reserve_exact(length)
            .map_err(|e| FxError::InvalidMessage(format!("cannot buffer {length} bytes: {e}")))?;
        buf.resize(length, 0);
        file.seek(SeekFrom::Start(pos)).await?;
        let mut filled = 0;
        while filled < length {
            let n = file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        Ok(buf)
    }

    async fn write(&self, fd: u64, pos: u64, data: &[u8]) -> FxResult<usize> {
        let file = self.file(fd)?;
        let mut file = file.lock().await;
        file.seek(SeekFrom::Start(pos)).await?;
        file.write_all(data).await?;
        Ok(data.len())
    }

    async fn read_file(&self, path: &Path) -> FxResult<Vec<u8>> {
        Ok(tokio::fs::read(path).await?)
    }

    async fn write_file(&self, path: &Path, data: &[u8], opts: WriteOptions) -> FxResult<()> {
        let exists = tokio::fs::try_exists(path).await?;
        if !exists && !opts.create {
            return Err(not_found(path));
        }
        if exists && !opts.overwrite {
            return Err(already_exists(path));
        }
        tokio::fs::write(path, data).await?;
        Ok(())
    }

    async fn delete(&self, path: &Path, opts: DeleteOptions) -> FxResult<()> {
        if opts.use_trash {
            debug!(path = %path.display(), "trash unsupported, deleting permanently");
        }
        let meta = tokio::fs::symlink_metadata(path).await?;
        if meta.is_dir() {
            if opts.recursive {
                tokio::fs::remove_dir_all(path).await?;
            } else {
                tokio::fs::remove_dir(path).await?;
            }
        } else {
            tokio::fs::remove_file(path).await?;
        }
        Ok(())
    }

    async fn mkdir(&self, path: &Path) -> FxResult<()> {
        tokio::fs::create_dir(path).await?;
        Ok(())
    }

    async fn readdir(&self, path: &Path) -> FxResult<Vec<(String, u32)>> {
        let mut entries = tokio::fs::read_dir(path).await?;
        let mut out = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let ft = entry.file_type().await?;
            let kind = if ft.is_symlink() {
                let target = tokio::fs::metadata(entry.path()).await.ok();
                FILE_TYPE_SYMBOLIC_LINK
                    | match target {
                        Some(m) if m.is_dir() => FILE_TYPE_DIRECTORY,
                        Some(m) if m.is_file() => FILE_TYPE_FILE,
                        _ => FILE_TYPE_UNKNOWN,
                    }
            } else if ft.is_dir() {
                FILE_TYPE_DIRECTORY
            } else if ft.is_file() {
                FILE_TYPE_FILE
            } else {
                FILE_TYPE_UNKNOWN
            };
            out.push((entry.file_name().to_string_lossy().into_owned(), kind));
        }
        Ok(out)
    }

    async fn rename(&self, from: &Path, to: &Path, opts: OverwriteOptions) -> FxResult<()> {
        if !opts.overwrite && tokio::fs::try_exists(to).await? {
            return Err(already_exists(to));
        }
        tokio::fs::rename(from, to).await?;
        Ok(())
    }

    async fn copy(&self, from: &Path, to: &Path, opts: OverwriteOptions) -> FxResult<()> {
        if !opts.overwrite && tokio::fs::try_exists(to).await? {
            return Err(already_exists(to));
        }
        let mut pending = vec![(from.to_path_buf(), to.to_path_buf())];
        while let Some((src, dst)) = pending.pop() {
            if tokio::fs::metadata(&src).await?.is_dir() {
                tokio::fs::create_dir_all(&dst).await?;
                let mut entries = tokio::fs::read_dir(&src).await?;
                while let Some(entry) = entries.next_entry().await? {
                    pending.push((entry.path(), dst.join(entry.file_name())));
                }
            } else {
                tokio::fs::copy(&src, &dst).await?;
            }
        }
        Ok(())
    }

    fn watch(&self, path: &Path, opts: WatchOptions, sink: ChangeSink) -> FxResult<WatchHandle> {
        let excludes: Vec<String> = opts.excludes.iter().map(|p| exclude_segment(p)).collect();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            match res {
                Ok(event) => {
                    let changes = to_changes(event, &excludes);
                    if !changes.is_empty() {
                        sink(changes);
                    }
                }
                Err(e) => warn!(error = %e, "file watch error"),
            }
        })
        .map_err(|e| FxError::Other(format!("failed to create watcher: {e}")))?;

        let mode = if opts.recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        watcher
            .watch(path, mode)
            .map_err(|e| FxError::Other(format!("failed to watch {}: {e}", path.display())))?;
        debug!(path = %path.display(), recursive = opts.recursive, "watching");
        Ok(WatchHandle::new(watcher))
    }

    fn read_file_stream(
        &self,
        path: &Path,
        opts: ReadStreamOptions,
        cancel: CancellationToken,
    ) -> mpsc::Receiver<ReadStreamEvent> {
        let (tx, rx) = mpsc::channel(16);
        let path = path.to_path_buf();
        tokio::spawn(async move {
            if let Err(e) = stream_file(&path, opts, &tx, &cancel).await {
                let _ = tx.send(ReadStreamEvent::Error(e.to_string())).await;
            }
            if !cancel.is_cancelled() {
                let _ = tx.send(ReadStreamEvent::End).await;
            }
        });
        rx
    }
}

async fn stream_file(
    path: &Path,
    opts: ReadStreamOptions,
    tx: &mpsc::Sender<ReadStreamEvent>,
    cancel: &CancellationToken,
) -> FxResult<()> {
    let mut file = tokio::fs::File::open(path).await?;
    if let Some(pos) = opts.position {
        file.seek(SeekFrom::Start(pos)).await?;
    }
    let chunk_size = opts
        .buffer_size
        .filter(|n| *n > 0)
        .unwrap_or(DEFAULT_STREAM_CHUNK)
        .min(MAX_READ_LENGTH);
    let mut remaining = opts.length;
    let mut buf = vec![0u8; chunk_size];
    loop {
        let want = match remaining {
            Some(0) => return Ok(()),
            Some(r) => chunk_size.min(r as usize),
            None => chunk_size,
        };
        let n = tokio::select! {
            _ = cancel.cancelled() => {
                debug!(path = %path.display(), "read stream cancelled");
                return Ok(());
            }
            n = file.read(&mut buf[..want]) => n?,
        };
        if n == 0 {
            return Ok(());
        }
        if let Some(r) = remaining.as_mut() {
            *r -= n as u64;
        }
        if tx.send(ReadStreamEvent::Data(buf[..n].to_vec())).await.is_err() {
            return Ok(());
        }
    }
}

fn to_changes(event: notify::Event, excludes: &[String]) -> Vec<FileChange> {
    let kind = match event.kind {
        EventKind::Access(_) => return Vec::new(),
        EventKind::Create(_) => FileChangeType::Added,
        EventKind::Remove(_) => FileChangeType::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => FileChangeType::Deleted,
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => FileChangeType::Added,
        _ => FileChangeType::Updated,
    };
    event
        .paths
        .into_iter()
        .filter(|p| !is_excluded(p, excludes))
        .map(|path| FileChange { path, kind })
        .collect()
}

/// `**/node_modules/**` and `node_modules` both exclude any path with a
/// `node_modules` component.
fn exclude_segment(pattern: &str) -> String {
    pattern
        .trim_start_matches("**/")
        .trim_end_matches("/**")
        .trim_matches('/')
        .to_string()
}

fn is_excluded(path: &Path, excludes: &[String]) -> bool {
    path.components()
        .any(|c| excludes.iter().any(|e| c.as_os_str() == e.as_str()))
}

fn millis(time: Option<SystemTime>) -> u64 {
    time.and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn bad_descriptor(fd: u64) -> FxError {
    FxError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("unknown file descriptor {fd}"),
    ))
}

fn not_found(path: &Path) -> FxError {
    FxError::Io(std::io::Error::new(
        std::io::ErrorKind::NotFound,
        format!("{} does not exist", path.display()),
    ))
}

fn already_exists(path: &Path) -> FxError {
    FxError::Io(std::io::Error::new(
        std::io::ErrorKind::AlreadyExists,
        format!("{} already exists", path.display()),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn descriptors_read_and_write_at_offsets() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("a.txt");
        let disk = DiskFileSystemProvider::new();

        let fd = disk.open(&path, OpenOptions { create: true }).await.unwrap();
        assert_eq!(disk.write(fd, 0, b"hello world").await.unwrap(), 11);
        disk.write(fd, 6, b"fxdk!").await.unwrap();
        disk.close(fd).await.unwrap();
        assert_eq!(disk.open_descriptors(), 0);

        let fd = disk.open(&path, OpenOptions::default()).await.unwrap();
        assert_eq!(disk.read(fd, 6, 100).await.unwrap(), b"fxdk!");
        disk.close(fd).await.unwrap();
        assert!(disk.close(fd).await.is_err());
    }

    #[tokio::test]
    async fn oversized_reads_are_refused_or_clamped() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("small.txt");
        tokio::fs::write(&path, b"abc").await.unwrap();
        let disk = DiskFileSystemProvider::new();
        let fd = disk.open(&path, OpenOptions::default()).await.unwrap();

        let err = disk.read(fd, 0, usize::MAX / 2).await.unwrap_err();
        assert_eq!(err.code(), "InvalidMessage");

        // Within the limit the buffer only covers what the file holds.
        assert_eq!(disk.read(fd, 1, MAX_READ_LENGTH).await.unwrap(), b"bc");
        assert!(disk.read(fd, 10, 4).await.unwrap().is_empty());
        disk.close(fd).await.unwrap();
    }

    #[tokio::test]
    async fn write_file_honours_create_and_overwrite() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("b.txt");
        let disk = DiskFileSystemProvider::new();

        let strict = WriteOptions {
            create: false,
            overwrite: true,
        };
        let err = disk.write_file(&path, b"x", strict).await.unwrap_err();
        assert_eq!(err.code(), "FileNotFound");

        disk.write_file(&path, b"x", WriteOptions::default()).await.unwrap();
        let no_overwrite = WriteOptions {
            create: true,
            overwrite: false,
        };
        let err = disk.write_file(&path, b"y", no_overwrite).await.unwrap_err();
        assert_eq!(err.code(), "FileExists");
        assert_eq!(disk.read_file(&path).await.unwrap(), b"x");
    }

    #[tokio::test]
    async fn stat_readdir_copy_delete() {
        let tmp = tempfile::tempdir().unwrap();
        let disk = DiskFileSystemProvider::new();
        let dir = tmp.path().join("src");
        disk.mkdir(&dir).await.unwrap();
        disk.write_file(&dir.join("f.lua"), b"print(1)", WriteOptions::default())
            .await
            .unwrap();

        let stat = disk.stat(&dir).await.unwrap();
        assert_eq!(stat.file_type, FILE_TYPE_DIRECTORY);
        assert_eq!(
            disk.readdir(&dir).await.unwrap(),
            vec![("f.lua".to_string(), FILE_TYPE_FILE)]
        );

        let copy = tmp.path().join("copy");
        disk.copy(&dir, &copy, OverwriteOptions::default()).await.unwrap();
        assert_eq!(disk.stat(&copy.join("f.lua")).await.unwrap().size, 8);
        let err = disk
            .copy(&dir, &copy, OverwriteOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.code(), "FileExists");

        assert!(disk.delete(&copy, DeleteOptions::default()).await.is_err());
        disk.delete(
            &copy,
            DeleteOptions {
                recursive: true,
                use_trash: false,
            },
        )
        .await
        .unwrap();
        assert_eq!(disk.stat(&copy).await.unwrap_err().code(), "FileNotFound");
    }

    #[tokio::test]
    async fn stream_respects_position_and_length() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("c.bin");
        tokio::fs::write(&path, b"0123456789").await.unwrap();
        let disk = DiskFileSystemProvider::new();

        let opts = ReadStreamOptions {
            position: Some(2),
            length: Some(5),
            buffer_size: Some(2),
        };
        let mut rx = disk.read_file_stream(&path, opts, CancellationToken::new());
        let mut data = Vec::new();
        loop {
            match rx.recv().await.unwrap() {
                ReadStreamEvent::Data(chunk) => data.extend(chunk),
                ReadStreamEvent::End => break,
                ReadStreamEvent::Error(e) => panic!("{e}"),
            }
        }
        assert_eq!(data, b"23456");
    }

    #[tokio::test]
    async fn stream_of_missing_file_reports_error_then_end() {
        let disk = DiskFileSystemProvider::new();
        let mut rx = disk.read_file_stream(
            Path::new("/nonexistent/fxcode.txt"),
            ReadStreamOptions::default(),
            CancellationToken::new(),
        );
        assert!(matches!(rx.recv().await, Some(ReadStreamEvent::Error(_))));
        assert_eq!(rx.recv().await, Some(ReadStreamEvent::End));
    }

    #[test]
    fn excludes_match_path_components() {
        let excludes = vec![exclude_segment("**/node_modules/**"), exclude_segment(".git")];
        assert!(is_excluded(Path::new("/w/node_modules/x.js"), &excludes));
        assert!(is_excluded(Path::new("/w/.git/HEAD"), &excludes));
        assert!(!is_excluded(Path::new("/w/src/node_modules.lua"), &excludes));
    }
}
