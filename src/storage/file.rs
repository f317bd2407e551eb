//! Storage backed by a directory on the local filesystem.
//!
//! A `FileStorage` answers for every path under its virtual prefix, so
//! `/share/movies/a.avi` with prefix `/share` and root `/srv/dc` maps to
//! `/srv/dc/movies/a.avi`. Tasks are handed to a worker task through a
//! bounded channel; the worker does the file I/O and completes each task.
//! A file check that cannot be queued is answered `-1` on the spot.

use std::io::SeekFrom;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use crate::error::Result;
use crate::hyper::buffer_pool::{BufferPool, PooledBuf};
use crate::hyper::protocol::FILE_NOT_FOUND;
use crate::storage::{Storage, Task, TaskResult};

pub struct FileStorage {
    prefix: String,
    root: PathBuf,
    tx: mpsc::Sender<(PathBuf, Task)>,
    stats: Arc<FileStats>,
}

#[derive(Default)]
struct FileStats {
    completed: AtomicU64,
    failed: AtomicU64,
    rejected: AtomicU64,
}

impl FileStorage {
    /// Serve `root` under the virtual `prefix`. Must be called inside a
    /// tokio runtime; the worker stops once the storage is dropped.
    pub fn new(
        prefix: impl Into<String>,
        root: impl Into<PathBuf>,
        pool: Arc<BufferPool>,
        queue_depth: usize,
    ) -> Arc<Self> {
        let prefix = normalize_prefix(&prefix.into());
        let root = root.into();
        let (tx, rx) = mpsc::channel(queue_depth.max(1));
        let stats = Arc::new(FileStats::default());

        tokio::spawn(run_worker(rx, pool, stats.clone()));

        Arc::new(Self {
            prefix,
            root,
            tx,
            stats,
        })
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Tasks waiting for the worker.
    pub fn queued(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Map a virtual path to a file under the root, or `None` if the path
    /// is not ours or tries to leave the root.
    pub fn local_path(&self, path: &str) -> Option<PathBuf> {
        let rest = path.strip_prefix(self.prefix.as_str())?;
        if !self.prefix.is_empty() && !rest.is_empty() && !rest.starts_with('/') {
            // "/sharefoo" is not under "/share"
            return None;
        }
        validate_path(&self.root, rest.trim_start_matches('/'))
    }
}

impl Storage for FileStorage {
    fn enqueue(&self, task: Task) {
        let local = match self.local_path(&task.path) {
            Some(local) => local,
            None => {
                warn!(path = %task.path, "rejecting task outside {}", self.prefix);
                self.stats.rejected.fetch_add(1, Ordering::Relaxed);
                if task.is_file_check() {
                    task.complete(TaskResult::FileSize(FILE_NOT_FOUND));
                }
                return;
            }
        };

        if let Err(e) = self.tx.try_send((local, task)) {
            self.stats.rejected.fetch_add(1, Ordering::Relaxed);
            let task = match e {
                mpsc::error::TrySendError::Full((_, task)) => {
                    warn!(token = task.token, "storage queue full, dropping task");
                    task
                }
                mpsc::error::TrySendError::Closed((_, task)) => {
                    warn!(token = task.token, "storage worker gone, dropping task");
                    task
                }
            };
            if task.is_file_check() {
                task.complete(TaskResult::FileSize(FILE_NOT_FOUND));
            }
        }
    }

    fn contains(&self, path: &str) -> bool {
        self.local_path(path).is_some()
    }

    fn debug_line(&self) -> String {
        format!(
            "FileStorage {} -> {} (queued {}, completed {}, failed {}, rejected {})",
            if self.prefix.is_empty() { "/" } else { self.prefix.as_str() },
            self.root.display(),
            self.queued(),
            self.stats.completed.load(Ordering::Relaxed),
            self.stats.failed.load(Ordering::Relaxed),
            self.stats.rejected.load(Ordering::Relaxed),
        )
    }
}

// =============================================================================
// Worker
// =============================================================================

async fn run_worker(
    mut rx: mpsc::Receiver<(PathBuf, Task)>,
    pool: Arc<BufferPool>,
    stats: Arc<FileStats>,
) {
    while let Some((path, task)) = rx.recv().await {
        if task.is_file_check() {
            let size = file_size(&path).await;
            trace!(token = task.token, size, "file check done");
            stats.completed.fetch_add(1, Ordering::Relaxed);
            task.complete(TaskResult::FileSize(size));
            continue;
        }

        if task.offset < 0 {
            debug!(token = task.token, offset = task.offset, "negative offset, dropping task");
            stats.failed.fetch_add(1, Ordering::Relaxed);
            continue;
        }

        match read_segment(&path, task.offset as u64, task.length as usize, &pool).await {
            Ok(data) => {
                trace!(token = task.token, len = data.len(), "segment read");
                stats.completed.fetch_add(1, Ordering::Relaxed);
                task.complete(TaskResult::Segment(data));
            }
            Err(e) => {
                // The client's timeout recovers the request.
                debug!(token = task.token, path = %path.display(), "segment read failed: {}", e);
                stats.failed.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
    debug!("file storage worker stopped");
}

async fn file_size(path: &Path) -> i64 {
    match tokio::fs::metadata(path).await {
        Ok(meta) if meta.is_file() => meta.len() as i64,
        _ => FILE_NOT_FOUND,
    }
}

/// Read up to `len` bytes at `offset`. Short reads at end of file return
/// fewer bytes.
async fn read_segment(
    path: &Path,
    offset: u64,
    len: usize,
    pool: &Arc<BufferPool>,
) -> Result<PooledBuf> {
    let mut buf = pool.acquire(len)?;
    let mut file = File::open(path).await?;
    file.seek(SeekFrom::Start(offset)).await?;

    let data = buf.vec_mut();
    data.resize(len, 0);
    let mut filled = 0;
    while filled < len {
        let n = file.read(&mut data[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    data.truncate(filled);
    Ok(buf)
}

// =============================================================================
// Path validation
// =============================================================================

fn normalize_prefix(prefix: &str) -> String {
    let trimmed = prefix.trim_end_matches('/');
    if trimmed.is_empty() {
        String::new()
    } else if trimmed.starts_with('/') {
        trimmed.to_string()
    } else {
        format!("/{}", trimmed)
    }
}

/// Join `relative` onto `root`, refusing anything that could escape it.
fn validate_path(root: &Path, relative: &str) -> Option<PathBuf> {
    if relative.is_empty() {
        return None;
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        return None;
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir | Component::Prefix(_) | Component::RootDir => return None,
            _ => {}
        }
    }

    let full = root.join(rel_path);
    if !normalize_path(&full).starts_with(normalize_path(root)) {
        return None;
    }
    Some(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize_path(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::TaskSink;
    use std::sync::Weak;
    use std::time::Duration;
    use tempfile::TempDir;

    struct Channel(mpsc::UnboundedSender<(u32, TaskResult)>);

    impl TaskSink for Channel {
        fn task_completed(&self, token: u32, result: TaskResult) {
            let _ = self.0.send((token, result));
        }
    }

    fn setup() -> (TempDir, Arc<BufferPool>) {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("video.avi"), (0..1000u32).map(|i| i as u8).collect::<Vec<_>>())
            .unwrap();
        std::fs::create_dir(dir.path().join("sub")).unwrap();
        (dir, BufferPool::new(4096, 4))
    }

    #[test]
    fn test_validate_path_rejects_traversal() {
        let root = Path::new("/srv/share");
        assert!(validate_path(root, "").is_none());
        assert!(validate_path(root, "../etc/passwd").is_none());
        assert!(validate_path(root, "a/../../b").is_none());
        assert!(validate_path(root, "/etc/passwd").is_none());
        assert_eq!(
            validate_path(root, "a/b.txt"),
            Some(PathBuf::from("/srv/share/a/b.txt"))
        );
    }

    #[tokio::test]
    async fn test_prefix_matching() {
        let (dir, pool) = setup();
        let storage = FileStorage::new("share/", dir.path(), pool, 8);
        assert_eq!(storage.prefix(), "/share");
        assert!(storage.contains("/share/video.avi"));
        assert!(storage.contains("/share/missing.bin"));
        assert!(!storage.contains("/sharefoo/video.avi"));
        assert!(!storage.contains("/other/video.avi"));
        assert!(!storage.contains("/share/../video.avi"));
    }

    #[tokio::test]
    async fn test_reads_segments_and_sizes() {
        let (dir, pool) = setup();
        let storage = FileStorage::new("/share", dir.path(), pool.clone(), 8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn TaskSink> = Arc::new(Channel(tx));
        let target: Weak<dyn TaskSink> = Arc::downgrade(&sink);

        let tasks = [
            Task::new("/share/video.avi", 100, 50, 1),
            Task::new("/share/video.avi", 0, -1, 2),
            Task::new("/share/missing.bin", 0, -1, 3),
            Task::new("/share/sub", 0, -1, 4),
            Task::new("/share/video.avi", 990, 50, 5),
        ];
        for mut task in tasks {
            task.set_target(target.clone());
            storage.enqueue(task);
        }

        let mut results = Vec::new();
        for _ in 0..5 {
            let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            results.push(got);
        }

        let expected: Vec<u8> = (100..150u32).map(|i| i as u8).collect();
        assert_eq!(results[0], (1, TaskResult::Segment(PooledBuf::from_vec(expected))));
        assert_eq!(results[1], (2, TaskResult::FileSize(1000)));
        assert_eq!(results[2], (3, TaskResult::FileSize(FILE_NOT_FOUND)));
        assert_eq!(results[3], (4, TaskResult::FileSize(FILE_NOT_FOUND)));
        match &results[4] {
            (5, TaskResult::Segment(data)) => assert_eq!(data.len(), 10),
            other => panic!("unexpected result {:?}", other),
        }

        drop(results);
        assert_eq!(pool.outstanding(), 0);
        assert!(storage.debug_line().contains("completed 5"));
    }

    #[tokio::test]
    async fn test_missing_file_segment_is_dropped() {
        let (dir, pool) = setup();
        let storage = FileStorage::new("/share", dir.path(), pool.clone(), 8);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn TaskSink> = Arc::new(Channel(tx));

        let mut missing = Task::new("/share/missing.bin", 0, 10, 1);
        missing.set_target(Arc::downgrade(&sink));
        storage.enqueue(missing);
        let mut check = Task::new("/share/video.avi", 0, -1, 2);
        check.set_target(Arc::downgrade(&sink));
        storage.enqueue(check);

        let (token, result) = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!((token, result), (2, TaskResult::FileSize(1000)));
        assert_eq!(pool.outstanding(), 0);
    }

    #[tokio::test]
    async fn test_full_queue_still_answers_file_checks() {
        let (dir, pool) = setup();
        let storage = FileStorage::new("/share", dir.path(), pool, 1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn TaskSink> = Arc::new(Channel(tx));

        // The worker has not run yet, so only the first task fits.
        for token in 1..=3 {
            let mut check = Task::new("/share/video.avi", 0, -1, token);
            check.set_target(Arc::downgrade(&sink));
            storage.enqueue(check);
        }

        let mut results = Vec::new();
        for _ in 0..3 {
            let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
                .await
                .unwrap()
                .unwrap();
            results.push(got);
        }
        results.sort_by_key(|(token, _)| *token);
        assert_eq!(
            results,
            vec![
                (1, TaskResult::FileSize(1000)),
                (2, TaskResult::FileSize(FILE_NOT_FOUND)),
                (3, TaskResult::FileSize(FILE_NOT_FOUND)),
            ]
        );
        assert!(storage.debug_line().contains("rejected 2"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_non_utf8_root_is_served() {
        use std::ffi::OsStr;
        use std::os::unix::ffi::OsStrExt;

        let base = TempDir::new().unwrap();
        let root = base.path().join(OsStr::from_bytes(b"dc-\xff"));
        if std::fs::create_dir(&root).is_err() {
            // Filesystem refuses non-UTF-8 names.
            return;
        }
        std::fs::write(root.join("a.bin"), [7u8; 42]).unwrap();

        let storage = FileStorage::new("/share", &root, BufferPool::new(64, 1), 4);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let sink: Arc<dyn TaskSink> = Arc::new(Channel(tx));
        let mut check = Task::new("/share/a.bin", 0, -1, 9);
        check.set_target(Arc::downgrade(&sink));
        storage.enqueue(check);

        let got = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(got, (9, TaskResult::FileSize(42)));
    }
}
