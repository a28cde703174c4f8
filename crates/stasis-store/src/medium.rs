use std::collections::HashMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::RwLock;

/// Where committed stores are read from and written to.
///
/// Implementations are called from a blocking worker thread, never from
/// the async task awaiting the commit.
pub trait SaveMedium: Send + Sync + 'static {
    /// Read the blob at `path`, or `None` if nothing is stored there.
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>>;

    /// Replace the blob at `path` atomically.
    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()>;
}

/// The local file system.
///
/// Writes go to a temporary file in the destination directory which is
/// then renamed over the target, so readers see either the old or the new
/// file and never a torn one.
#[derive(Clone, Copy, Debug, Default)]
pub struct DiskMedium;

impl SaveMedium for DiskMedium {
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        match fs::read(path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        let dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        };
        fs::create_dir_all(&dir)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&dir)?;
        tmp.write_all(bytes)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    }
}

/// An in-memory medium that counts writes.
///
/// Intended for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryMedium {
    files: RwLock<HashMap<PathBuf, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryMedium {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of completed writes.
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Raw bytes stored at `path`.
    pub fn bytes(&self, path: &Path) -> Option<Vec<u8>> {
        self.files.read().expect("lock poisoned").get(path).cloned()
    }

    /// Place raw bytes at `path` without counting a write.
    pub fn insert(&self, path: impl Into<PathBuf>, bytes: Vec<u8>) {
        self.files
            .write()
            .expect("lock poisoned")
            .insert(path.into(), bytes);
    }
}

impl SaveMedium for MemoryMedium {
    fn read(&self, path: &Path) -> io::Result<Option<Vec<u8>>> {
        Ok(self.bytes(path))
    }

    fn write(&self, path: &Path, bytes: &[u8]) -> io::Result<()> {
        self.files
            .write()
            .expect("lock poisoned")
            .insert(path.to_path_buf(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
