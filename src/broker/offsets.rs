use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Committed read positions, one file per consumer group and partition.
///
/// A checkpoint is the next offset to consume. Files are replaced atomically
/// (`tmp` + fsync + rename + directory fsync), so a crash leaves either the
/// old or the new value.
pub struct OffsetStore {
    dir: PathBuf,
}

impl OffsetStore {
    pub fn open(dir: &Path) -> io::Result<Self> {
        fs::create_dir_all(dir)?;
        Ok(Self {
            dir: dir.to_path_buf(),
        })
    }

    fn path(&self, group: &str, partition: u32) -> io::Result<PathBuf> {
        let valid = !group.is_empty()
            && group
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.');
        if !valid || group.starts_with('.') {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("invalid consumer group name: {group:?}"),
            ));
        }
        Ok(self.dir.join(format!("{group}-{partition:04}.offset")))
    }

    /// Last committed checkpoint, or 0 when the group never committed.
    pub fn load(&self, group: &str, partition: u32) -> io::Result<u64> {
        let path = self.path(group, partition)?;
        let bytes = match fs::read(&path) {
            Ok(b) => b,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(e) => return Err(e),
        };
        let raw: [u8; 8] = bytes.as_slice().try_into().map_err(|_| {
            io::Error::new(
                io::ErrorKind::InvalidData,
                format!("{}: expected 8 bytes, found {}", path.display(), bytes.len()),
            )
        })?;
        Ok(u64::from_le_bytes(raw))
    }

    pub fn commit(&self, group: &str, partition: u32, next_offset: u64) -> io::Result<()> {
        let path = self.path(group, partition)?;
        let tmp_path = path.with_extension("offset.tmp");
        {
            let mut file = File::create(&tmp_path)?;
            file.write_all(&next_offset.to_le_bytes())?;
            file.sync_all()?;
        }
        fs::rename(&tmp_path, &path)?;
        crate::wal::sync_parent(&path)
    }
}
