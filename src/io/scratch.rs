//! Query-scoped scratch storage for partial chunk results.

use crate::types::{CubeError, CubeResult};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::File;
use std::io::{BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tempfile::TempDir;

/// One temp directory per query, one bincode file per (geo chunk, time chunk).
///
/// Keys never collide across workers, so the only shared state is the
/// directory handle itself.
pub struct ScratchStore {
    path: PathBuf,
    dir: Mutex<Option<TempDir>>,
}

impl ScratchStore {
    /// Create a fresh query directory under `root`
    pub fn new(root: &Path) -> CubeResult<Self> {
        std::fs::create_dir_all(root)?;
        let dir = tempfile::Builder::new().prefix("query-").tempdir_in(root)?;
        let path = dir.path().to_path_buf();
        log::debug!("Scratch directory: {}", path.display());
        Ok(Self {
            path,
            dir: Mutex::new(Some(dir)),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn entry_path(&self, geo_chunk: usize, time_chunk: usize) -> PathBuf {
        self.path.join(format!("g{}_t{}.bin", geo_chunk, time_chunk))
    }

    fn ensure_open(&self) -> CubeResult<()> {
        let open = self
            .dir
            .lock()
            .map(|guard| guard.is_some())
            .unwrap_or(false);
        if !open {
            return Err(CubeError::Compute("scratch store already cleared".to_string()));
        }
        Ok(())
    }

    pub fn put<T: Serialize>(&self, geo_chunk: usize, time_chunk: usize, value: &T) -> CubeResult<()> {
        self.ensure_open()?;
        let path = self.entry_path(geo_chunk, time_chunk);
        let mut writer = BufWriter::new(File::create(&path)?);
        bincode::serialize_into(&mut writer, value)?;
        Ok(())
    }

    pub fn contains(&self, geo_chunk: usize, time_chunk: usize) -> bool {
        self.entry_path(geo_chunk, time_chunk).exists()
    }

    /// Read and delete an entry; `None` if it was never written
    pub fn take<T: DeserializeOwned>(&self, geo_chunk: usize, time_chunk: usize) -> CubeResult<Option<T>> {
        let path = self.entry_path(geo_chunk, time_chunk);
        if !path.exists() {
            return Ok(None);
        }
        let value = {
            let reader = BufReader::new(File::open(&path)?);
            bincode::deserialize_from(reader)?
        };
        std::fs::remove_file(&path)?;
        Ok(Some(value))
    }

    /// Number of entries still on disk
    pub fn len(&self) -> usize {
        std::fs::read_dir(&self.path)
            .map(|entries| entries.filter_map(Result::ok).count())
            .unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the whole directory. Safe to call more than once.
    pub fn clear(&self) {
        let dir = match self.dir.lock() {
            Ok(mut guard) => guard.take(),
            Err(poisoned) => poisoned.into_inner().take(),
        };
        if let Some(dir) = dir {
            if let Err(e) = dir.close() {
                log::warn!("Failed to remove scratch directory {}: {}", self.path.display(), e);
            }
        }
    }
}

impl Drop for ScratchStore {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_put_take_removes_entry() {
        let root = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(root.path()).unwrap();
        store.put(2, 1, &vec![1.5f64, 2.5]).unwrap();
        assert!(store.contains(2, 1));
        assert!(store.path().join("g2_t1.bin").exists());

        let value: Vec<f64> = store.take(2, 1).unwrap().unwrap();
        assert_eq!(value, vec![1.5, 2.5]);
        assert!(!store.contains(2, 1));
        assert!(store.take::<Vec<f64>>(2, 1).unwrap().is_none());
    }

    #[test]
    fn test_clear_removes_directory() {
        let root = tempfile::tempdir().unwrap();
        let store = ScratchStore::new(root.path()).unwrap();
        store.put(0, 0, &42u32).unwrap();
        let path = store.path().to_path_buf();

        store.clear();
        assert!(!path.exists());
        assert!(store.put(0, 1, &1u32).is_err());
        store.clear();
    }
}
