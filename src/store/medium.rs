//! Durable media behind the session store
//!
//! A medium stores one opaque snapshot. `save` must replace the previous
//! snapshot atomically: a crash during a save leaves either the old or the
//! new snapshot, never a mix.

use super::{StoreError, StoreResult};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Blob storage with atomic replace semantics
pub trait StateMedium: Send + Sync {
    /// Read the last saved snapshot, `None` if nothing was ever saved
    ///
    /// # Errors
    ///
    /// Any error of the backing storage other than "nothing saved yet".
    fn load(&self) -> StoreResult<Option<Vec<u8>>>;

    /// Replace the snapshot
    ///
    /// # Errors
    ///
    /// Any error of the backing storage. The previous snapshot stays intact.
    fn save(&self, bytes: &[u8]) -> StoreResult<()>;

    /// Human-readable location, for logs
    fn describe(&self) -> String;
}

impl<T: StateMedium + ?Sized> StateMedium for Arc<T> {
    fn load(&self) -> StoreResult<Option<Vec<u8>>> {
        (**self).load()
    }

    fn save(&self, bytes: &[u8]) -> StoreResult<()> {
        (**self).save(bytes)
    }

    fn describe(&self) -> String {
        (**self).describe()
    }
}

// ============================================================================
// File
// ============================================================================

/// Snapshot file written via temp file + fsync + rename
#[derive(Debug, Clone)]
pub struct FileMedium {
    path: PathBuf,
}

impl FileMedium {
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling of the target so the rename never crosses filesystems
    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map_or_else(|| "state".into(), std::ffi::OsStr::to_os_string);
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl StateMedium for FileMedium {
    fn load(&self) -> StoreResult<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(&self.path, e)),
        }
    }

    fn save(&self, bytes: &[u8]) -> StoreResult<()> {
        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| StoreError::io(parent, e))?;
        }

        let temp_path = self.temp_path();
        let mut file = fs::File::create(&temp_path).map_err(|e| StoreError::io(&temp_path, e))?;
        file.write_all(bytes)
            .and_then(|()| file.sync_all())
            .map_err(|e| StoreError::io(&temp_path, e))?;
        drop(file);

        // Atomic rename
        fs::rename(&temp_path, &self.path).map_err(|e| StoreError::io(&self.path, e))
    }

    fn describe(&self) -> String {
        self.path.display().to_string()
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Process-local medium. Nothing survives a restart.
#[derive(Debug, Default)]
pub struct MemoryMedium {
    contents: Mutex<Option<Vec<u8>>>,
    saves: AtomicUsize,
    fail_saves: AtomicBool,
}

impl MemoryMedium {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Medium pre-filled with a snapshot
    #[must_use]
    pub fn with_contents(bytes: Vec<u8>) -> Self {
        Self {
            contents: Mutex::new(Some(bytes)),
            ..Self::default()
        }
    }

    /// Number of successful saves
    #[must_use]
    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }

    /// Make subsequent saves fail (to exercise degraded mode)
    pub fn fail_saves(&self, fail: bool) {
        self.fail_saves.store(fail, Ordering::SeqCst);
    }

    #[must_use]
    pub fn contents(&self) -> Option<Vec<u8>> {
        self.contents
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

impl StateMedium for MemoryMedium {
    fn load(&self) -> StoreResult<Option<Vec<u8>>> {
        Ok(self.contents())
    }

    fn save(&self, bytes: &[u8]) -> StoreResult<()> {
        if self.fail_saves.load(Ordering::SeqCst) {
            return Err(StoreError::io(
                "<memory>",
                std::io::Error::other("saves disabled"),
            ));
        }
        *self.contents.lock().unwrap_or_else(PoisonError::into_inner) = Some(bytes.to_vec());
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn describe(&self) -> String {
        "<memory>".to_string()
    }
}
