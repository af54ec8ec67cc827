//! The single live screenshot reference held by a view.
//!
//! Screenshot bytes are spilled to a temp file so a renderer can open them by
//! path. The file is deleted when its [`TransientRef`] drops, and the slot
//! never holds more than one.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tempfile::NamedTempFile;
use tracing::debug;

/// A screenshot on disk, valid until dropped.
#[derive(Debug)]
pub struct TransientRef {
    file: NamedTempFile,
    len: usize,
    generation: u64,
    live: Arc<AtomicUsize>,
}

impl TransientRef {
    pub fn path(&self) -> &Path {
        self.file.path()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// How many times the owning slot had been filled when this ref was made.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for TransientRef {
    fn drop(&mut self) {
        self.live.fetch_sub(1, Ordering::SeqCst);
        debug!(path = %self.file.path().display(), "released screenshot reference");
    }
}

/// Owns at most one [`TransientRef`].
#[derive(Debug)]
pub struct ScreenshotSlot {
    spill_dir: PathBuf,
    current: Option<TransientRef>,
    generation: u64,
    live: Arc<AtomicUsize>,
}

impl ScreenshotSlot {
    pub fn new(spill_dir: impl Into<PathBuf>) -> Self {
        Self {
            spill_dir: spill_dir.into(),
            current: None,
            generation: 0,
            live: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn current(&self) -> Option<&TransientRef> {
        self.current.as_ref()
    }

    /// References created by this slot that have not been released yet.
    pub fn live_references(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Release the held reference, then publish `bytes` as the new one.
    ///
    /// If writing the new file fails the slot is left empty.
    pub fn replace(&mut self, bytes: &[u8]) -> std::io::Result<&TransientRef> {
        self.clear();

        std::fs::create_dir_all(&self.spill_dir)?;
        let mut file = tempfile::Builder::new()
            .prefix("screenshot-")
            .suffix(".png")
            .tempfile_in(&self.spill_dir)?;
        file.write_all(bytes)?;
        file.flush()?;

        self.generation += 1;
        self.live.fetch_add(1, Ordering::SeqCst);
        let reference: &TransientRef = self.current.insert(TransientRef {
            file,
            len: bytes.len(),
            generation: self.generation,
            live: self.live.clone(),
        });
        Ok(reference)
    }

    /// Release the held reference, if any.
    pub fn clear(&mut self) {
        self.current = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_replace_releases_predecessor() {
        let dir = tempfile::tempdir().unwrap();
        let mut slot = ScreenshotSlot::new(dir.path());

        let first = slot.replace(b"one").unwrap().path().to_path_buf();
        assert!(first.exists());
        assert_eq!(slot.live_references(), 1);

        for n in 0..25u8 {
            slot.replace(&[n; 16]).unwrap();
            assert_eq!(slot.live_references(), 1);
        }

        assert!(!first.exists());
        assert_eq!(slot.current().unwrap().len(), 16);
        assert_eq!(slot.current().unwrap().generation(), 26);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1);
    }

    #[test]
    fn test_clear_releases_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut slot = ScreenshotSlot::new(dir.path());
        let path = slot.replace(b"png").unwrap().path().to_path_buf();

        slot.clear();
        slot.clear();
        assert!(slot.current().is_none());
        assert_eq!(slot.live_references(), 0);
        assert!(!path.exists());
    }

    #[test]
    fn test_spill_dir_created_on_demand() {
        let dir = tempfile::tempdir().unwrap();
        let mut slot = ScreenshotSlot::new(dir.path().join("shots"));
        let reference = slot.replace(b"x").unwrap();
        assert_eq!(std::fs::read(reference.path()).unwrap(), b"x");
    }
}
