use parking_lot::RwLock;

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;
use std::sync::Arc;

/// Lazily opened segment files, one per segment, named by the decimal segment id.
#[derive(Debug)]
pub struct SegmentFiles {
    dir: PathBuf,
    files: RwLock<HashMap<u16, Arc<File>>>
}

impl SegmentFiles {
    pub fn new(dir: impl Into<PathBuf>) -> SegmentFiles {
        SegmentFiles {
            dir: dir.into(),
            files: RwLock::new(HashMap::new())
        }
    }

    pub fn path_of(&self, segment: u16) -> PathBuf {
        self.dir.join(segment.to_string())
    }

    fn file(&self, segment: u16) -> io::Result<Arc<File>> {
        if let Some(file) = self.files.read().get(&segment) {
            return Ok(Arc::clone(file));
        }

        let mut files = self.files.write();
        if let Some(file) = files.get(&segment) {
            return Ok(Arc::clone(file));
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(self.path_of(segment))?;
        log::trace!("opened segment file {:?}", self.path_of(segment));

        let file = Arc::new(file);
        files.insert(segment, Arc::clone(&file));
        Ok(file)
    }

    /// Fills `buf` from `offset`, zeroing whatever lies past the end of the file.
    pub fn read_at(&self, segment: u16, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let file = self.file(segment)?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read_at(&mut buf[filled..], offset + filled as u64) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e)
            }
        }

        for byte in buf[filled..].iter_mut() {
            *byte = 0;
        }

        Ok(())
    }

    pub fn write_at(&self, segment: u16, offset: u64, buf: &[u8]) -> io::Result<()> {
        let file = self.file(segment)?;
        file.write_all_at(buf, offset)
    }

    /// Current length in bytes of the segment's file, zero if it does not exist yet.
    pub fn len(&self, segment: u16) -> io::Result<u64> {
        match std::fs::metadata(self.path_of(segment)) {
            Ok(meta) => Ok(meta.len()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(0),
            Err(e) => Err(e)
        }
    }

    pub fn sync_all(&self) -> io::Result<()> {
        for file in self.files.read().values() {
            file.sync_all()?;
        }
        Ok(())
    }
}
