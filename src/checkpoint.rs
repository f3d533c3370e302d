//! Durable checkpoint and tracked-file storage.
//!
//! Layout under the checkpoint directory:
//!
//! - `<file name>.<path hash>.checkpoint`: one per tailed file, holding the
//!   last confirmed byte offset as a base-10 integer.
//! - `in_progress_files.json`: JSON array of absolute paths currently being
//!   tailed, used to resume work after a restart.
//!
//! Every write goes to a temporary file that is synced and then renamed over
//! the target, so a crash never leaves a half-written checkpoint behind.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};

/// File name of the tracked-file list inside the checkpoint directory.
pub const TRACKED_FILES_NAME: &str = "in_progress_files.json";

const CHECKPOINT_SUFFIX: &str = "checkpoint";

pub struct CheckpointStore {
    dir: PathBuf,
    tracked_path: PathBuf,

    /// Serializes every mutation of the tracked-file list, and the
    /// checkpoint deletions that go with untracking.
    file_set_lock: Mutex<()>,
}

impl CheckpointStore {
    /// Open (creating if needed) a store rooted at `dir`.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        let tracked_path = dir.join(TRACKED_FILES_NAME);
        Ok(Self {
            dir,
            tracked_path,
            file_set_lock: Mutex::new(()),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the checkpoint file for `source`.
    pub fn checkpoint_path(&self, source: &Path) -> PathBuf {
        let name = source
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "source".to_string());
        let digest = Sha256::digest(source.to_string_lossy().as_bytes());
        let hash: String = digest[..8].iter().map(|b| format!("{:02x}", b)).collect();
        self.dir.join(format!("{}.{}.{}", name, hash, CHECKPOINT_SUFFIX))
    }

    /// Last confirmed offset for `source`; 0 when absent or unreadable.
    pub fn load(&self, source: &Path) -> u64 {
        let path = self.checkpoint_path(source);
        match fs::read_to_string(&path) {
            Ok(contents) => match contents.trim().parse::<u64>() {
                Ok(offset) => offset,
                Err(e) => {
                    warn!(checkpoint = %path.display(), error = %e, "Malformed checkpoint, starting from 0");
                    0
                }
            },
            Err(e) if e.kind() == io::ErrorKind::NotFound => 0,
            Err(e) => {
                warn!(checkpoint = %path.display(), error = %e, "Failed to read checkpoint, starting from 0");
                0
            }
        }
    }

    /// Durably replace the checkpoint for `source`.
    pub fn save(&self, source: &Path, offset: u64) -> io::Result<()> {
        let path = self.checkpoint_path(source);
        write_atomic(&path, offset.to_string().as_bytes())?;
        debug!(source = %source.display(), offset, "Checkpoint saved");
        Ok(())
    }

    /// Add `source` to the tracked set. No-op if already present.
    pub fn track(&self, source: &Path) -> io::Result<()> {
        let _guard = self.lock();
        let mut files = self.read_tracked();
        let entry = source.to_string_lossy().into_owned();
        if !files.contains(&entry) {
            files.push(entry);
            self.write_tracked(&files)?;
        }
        Ok(())
    }

    /// Remove `source` from the tracked set. No-op if absent.
    pub fn untrack(&self, source: &Path) -> io::Result<()> {
        let _guard = self.lock();
        self.untrack_locked(source)
    }

    /// Drop all state for `source`: its checkpoint file and tracked entry.
    pub fn forget(&self, source: &Path) -> io::Result<()> {
        let _guard = self.lock();
        self.untrack_locked(source)?;
        self.remove_checkpoint(source)?;
        info!(source = %source.display(), "Cleaned up tracking state");
        Ok(())
    }

    /// Delete only the checkpoint for `source`, keeping it tracked.
    pub fn forget_checkpoint(&self, source: &Path) -> io::Result<()> {
        let _guard = self.lock();
        self.remove_checkpoint(source)
    }

    fn remove_checkpoint(&self, source: &Path) -> io::Result<()> {
        match fs::remove_file(self.checkpoint_path(source)) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Run `op` against the store on the blocking thread pool.
    ///
    /// Async callers go through this so that fsync and waits on the
    /// file-set lock happen off the runtime's worker threads.
    pub async fn blocking<T, F>(self: &Arc<Self>, op: F) -> io::Result<T>
    where
        F: FnOnce(&CheckpointStore) -> io::Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let store = Arc::clone(self);
        tokio::task::spawn_blocking(move || op(&store))
            .await
            .map_err(io::Error::other)?
    }

    /// Paths that were being tailed when the store was last written.
    pub fn tracked_files(&self) -> Vec<PathBuf> {
        let _guard = self.lock();
        self.read_tracked().into_iter().map(PathBuf::from).collect()
    }

    fn untrack_locked(&self, source: &Path) -> io::Result<()> {
        let mut files = self.read_tracked();
        let entry = source.to_string_lossy();
        let before = files.len();
        files.retain(|f| *f != entry);
        if files.len() != before {
            self.write_tracked(&files)?;
        }
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ()> {
        // The guarded data is `()`, so a poisoned lock carries no broken state.
        self.file_set_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn read_tracked(&self) -> Vec<String> {
        let contents = match fs::read(&self.tracked_path) {
            Ok(contents) => contents,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Vec::new(),
            Err(e) => {
                warn!(path = %self.tracked_path.display(), error = %e, "Failed to read tracked file list");
                return Vec::new();
            }
        };
        serde_json::from_slice(&contents).unwrap_or_else(|e| {
            warn!(path = %self.tracked_path.display(), error = %e, "Malformed tracked file list, treating as empty");
            Vec::new()
        })
    }

    fn write_tracked(&self, files: &[String]) -> io::Result<()> {
        let json = serde_json::to_vec(files).map_err(io::Error::other)?;
        write_atomic(&self.tracked_path, &json)
    }
}

fn write_atomic(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);

    {
        let mut file = fs::File::create(&tmp)?;
        file.write_all(contents)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)
}
