//! Append-only frame files.
//!
//! Each frame is `[u32 LE: len][bincode: T][u32 LE: crc32(payload)]`. The same
//! file type backs the booking store's event log and every command log
//! partition. On open, a torn or corrupt tail left by a crash is cut off so
//! that later appends stay reachable on the next replay. A commit that fails
//! is rolled back to the last synced length, so a frame whose caller saw an
//! error never reappears on disk.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{error, warn};

/// Frames claiming more than this are treated as corruption.
const MAX_FRAME_BYTES: usize = 1 << 20;

fn write_frame<T: Serialize>(out: &mut impl Write, entry: &T) -> io::Result<()> {
    let payload =
        bincode::serialize(entry).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    out.write_all(&(payload.len() as u32).to_le_bytes())?;
    out.write_all(&payload)?;
    out.write_all(&crc32fast::hash(&payload).to_le_bytes())
}

enum Frame<T> {
    Entry { entry: T, bytes: u64 },
    /// Clean end of file.
    End,
    /// Partial, oversized, or failing its checksum.
    Torn,
}

/// `read_exact` that maps a short read to `Ok(false)`.
fn fill(input: &mut impl Read, buf: &mut [u8]) -> io::Result<bool> {
    match input.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

fn read_frame<T: DeserializeOwned>(input: &mut impl Read) -> io::Result<Frame<T>> {
    let mut word = [0u8; 4];
    let mut first = [0u8; 1];
    if input.read(&mut first)? == 0 {
        return Ok(Frame::End);
    }
    word[0] = first[0];
    if !fill(input, &mut word[1..])? {
        return Ok(Frame::Torn);
    }
    let len = u32::from_le_bytes(word) as usize;
    if len > MAX_FRAME_BYTES {
        return Ok(Frame::Torn);
    }

    let mut payload = vec![0u8; len];
    if !fill(input, &mut payload)? || !fill(input, &mut word)? {
        return Ok(Frame::Torn);
    }
    if u32::from_le_bytes(word) != crc32fast::hash(&payload) {
        return Ok(Frame::Torn);
    }
    Ok(match bincode::deserialize(&payload) {
        Ok(entry) => Frame::Entry {
            entry,
            bytes: (len + 8) as u64,
        },
        Err(_) => Frame::Torn,
    })
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// fsync the directory holding `path`, making a rename in it durable.
pub(crate) fn sync_parent(path: &Path) -> io::Result<()> {
    #[cfg(test)]
    if faults::take(path, faults::Fault::DirSync) {
        return Err(io::Error::other("injected directory sync failure"));
    }
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

/// Exclusive advisory lock on a file, held until dropped.
///
/// Keeps a second process (or a second opener in this one) from appending to
/// files another writer already owns.
#[derive(Debug)]
pub struct WriterLock {
    _file: File,
}

impl WriterLock {
    pub fn acquire(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(path)?;
        match file.try_lock() {
            Ok(()) => Ok(Self { _file: file }),
            Err(TryLockError::WouldBlock) => Err(io::Error::new(
                io::ErrorKind::WouldBlock,
                format!("{} is held by another writer", path.display()),
            )),
            Err(TryLockError::Error(e)) => Err(e),
        }
    }

    /// Lock `<path>.lock`, guarding the file at `path`.
    pub fn beside(path: &Path) -> io::Result<Self> {
        Self::acquire(&sibling(path, ".lock"))
    }
}

pub struct Wal<T> {
    file: File,
    path: PathBuf,
    /// Frames staged since the last sync, not yet handed to the file.
    pending: Vec<u8>,
    pending_frames: u64,
    /// File length covered by the last successful sync.
    synced_len: u64,
    /// Frames on disk that the last rewrite did not produce.
    stale: u64,
    /// Set when a failed commit could not be rolled back.
    poisoned: bool,
    _entry: PhantomData<fn(T)>,
}

impl<T: Serialize + DeserializeOwned> Wal<T> {
    /// Open (or create) the file at `path` and recover every intact frame.
    /// Anything after the first bad frame is truncated away.
    pub fn open(path: &Path) -> io::Result<(Self, Vec<T>)> {
        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)?;
        let on_disk = file.metadata()?.len();

        let mut reader = BufReader::new(&file);
        let mut entries = Vec::new();
        let mut intact = 0u64;
        loop {
            match read_frame(&mut reader)? {
                Frame::Entry { entry, bytes } => {
                    entries.push(entry);
                    intact += bytes;
                }
                Frame::End | Frame::Torn => break,
            }
        }
        drop(reader);

        if intact < on_disk {
            warn!(
                "{}: discarding {} bytes after {} intact frames",
                path.display(),
                on_disk - intact,
                entries.len()
            );
            file.set_len(intact)?;
            file.sync_all()?;
        }

        let wal = Self {
            file,
            path: path.to_path_buf(),
            pending: Vec::new(),
            pending_frames: 0,
            synced_len: intact,
            stale: entries.len() as u64,
            poisoned: false,
            _entry: PhantomData,
        };
        Ok((wal, entries))
    }

    fn usable(&self) -> io::Result<()> {
        if self.poisoned {
            return Err(io::Error::other(format!(
                "{}: writes refused after a failed rollback",
                self.path.display()
            )));
        }
        Ok(())
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Buffer one frame. Nothing reaches the file until `sync`.
    pub fn stage(&mut self, entry: &T) -> io::Result<()> {
        self.usable()?;
        let mark = self.pending.len();
        if let Err(e) = write_frame(&mut self.pending, entry) {
            self.pending.truncate(mark);
            return Err(e);
        }
        self.pending_frames += 1;
        Ok(())
    }

    /// Write staged frames and fsync. On failure the staged frames are
    /// dropped and the file is cut back to its last synced length.
    pub fn sync(&mut self) -> io::Result<()> {
        self.usable()?;
        if self.pending.is_empty() {
            return Ok(());
        }
        match self.write_pending() {
            Ok(()) => {
                self.synced_len += self.pending.len() as u64;
                self.stale += self.pending_frames;
                self.pending.clear();
                self.pending_frames = 0;
                Ok(())
            }
            Err(e) => {
                self.roll_back();
                Err(e)
            }
        }
    }

    fn write_pending(&mut self) -> io::Result<()> {
        self.file.write_all(&self.pending)?;
        #[cfg(test)]
        if faults::take(&self.path, faults::Fault::Sync) {
            return Err(io::Error::other("injected sync failure"));
        }
        self.file.sync_data()
    }

    fn roll_back(&mut self) {
        self.pending.clear();
        self.pending_frames = 0;
        if let Err(e) = self.truncate_to_synced() {
            error!(
                "{}: cannot roll back failed commit to {} bytes: {e}",
                self.path.display(),
                self.synced_len
            );
            self.poisoned = true;
        }
    }

    fn truncate_to_synced(&self) -> io::Result<()> {
        #[cfg(test)]
        if faults::take(&self.path, faults::Fault::Rollback) {
            return Err(io::Error::other("injected truncate failure"));
        }
        self.file.set_len(self.synced_len)?;
        self.file.sync_all()
    }

    /// Stage every entry, then sync once. All or nothing: if any step
    /// fails, none of the entries stay on disk.
    pub fn commit<'a>(&mut self, entries: impl IntoIterator<Item = &'a T>) -> io::Result<()>
    where
        T: 'a,
    {
        for entry in entries {
            if let Err(e) = self.stage(entry) {
                self.roll_back();
                return Err(e);
            }
        }
        self.sync()
    }

    #[cfg(test)]
    pub fn append(&mut self, entry: &T) -> io::Result<()> {
        self.commit(std::iter::once(entry))
    }

    /// Frames written since the last `rewrite`, counting those recovered on open.
    pub fn stale_frames(&self) -> u64 {
        self.stale
    }

    /// Replace the whole file with `entries`: write a sibling, fsync it,
    /// rename it over the original and continue appending to the new file.
    /// A poisoned log is usable again afterwards.
    pub fn rewrite(&mut self, entries: &[T]) -> io::Result<()> {
        let tmp = sibling(&self.path, ".rewrite");
        let written = {
            let mut out = BufWriter::new(File::create(&tmp)?);
            for entry in entries {
                write_frame(&mut out, entry)?;
            }
            out.flush()?;
            out.get_ref().sync_all()?;
            out.get_ref().metadata()?.len()
        };
        fs::rename(&tmp, &self.path)?;
        sync_parent(&self.path)?;

        self.file = OpenOptions::new().append(true).open(&self.path)?;
        self.pending.clear();
        self.pending_frames = 0;
        self.synced_len = written;
        self.stale = 0;
        self.poisoned = false;
        Ok(())
    }
}
