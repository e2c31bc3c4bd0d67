//! Append-only partition log.
//!
//! Layout: a 5-byte header (magic + version), then frames of
//! `len: u32 | MessagePack body | crc32(body): u32`. The frame index (offset
//! -> file position) is rebuilt by scanning on open; a torn tail left by a
//! crash mid-append is truncated.

use crate::error::{CohortError, Result};
use crate::types::Timestamp;
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for partition logs.
const LOG_MAGIC: &[u8; 4] = b"CHL\0";

/// Current log format version.
const LOG_VERSION: u8 = 1;

const HEADER_SIZE: u64 = 5;

/// Sanity bound on a single frame.
const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Frame body as stored on disk.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct StoredMessage {
    pub offset: u64,
    pub timestamp: Timestamp,
    pub key: String,
    pub payload: Vec<u8>,
}

/// Append-only log for one topic partition.
pub struct TopicLog {
    path: PathBuf,

    file: Mutex<File>,

    /// File position of each offset.
    positions: RwLock<Vec<u64>>,

    /// End of the last complete frame; the next append starts here.
    tail: Mutex<u64>,

    /// Number of appends since last sync.
    writes_since_sync: Mutex<u64>,

    /// Sync every N appends (1 = every append is durable when acked).
    sync_interval: u64,
}

impl TopicLog {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        Self::open_with_sync_interval(path, 1)
    }

    pub fn open_with_sync_interval(path: impl AsRef<Path>, sync_interval: u64) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let positions = if file.metadata()?.len() == 0 {
            file.write_all(LOG_MAGIC)?;
            file.write_all(&[LOG_VERSION])?;
            file.sync_all()?;
            Vec::new()
        } else {
            Self::recover(&path, &mut file)?
        };
        let tail = file.metadata()?.len();

        Ok(Self {
            path,
            file: Mutex::new(file),
            positions: RwLock::new(positions),
            tail: Mutex::new(tail),
            writes_since_sync: Mutex::new(0),
            sync_interval: sync_interval.max(1),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Append a message; returns its offset once written (and synced, per
    /// the sync interval). A failed append leaves the log as it was, so the
    /// caller may retry with the same offset.
    pub fn append(&self, key: &str, payload: &[u8]) -> Result<StoredMessage> {
        let mut file = self.file.lock();
        let mut tail = self.tail.lock();
        let offset = self.positions.read().len() as u64;

        let message = StoredMessage {
            offset,
            timestamp: Timestamp::now(),
            key: key.to_string(),
            payload: payload.to_vec(),
        };
        let frame = encode_frame(&message)?;

        let position = *tail;
        let mut writes = self.writes_since_sync.lock();
        let sync = *writes + 1 >= self.sync_interval;

        if let Err(e) = append_frame(&mut *file, position, &frame, sync) {
            warn!(
                path = %self.path.display(),
                offset,
                error = %e,
                "append failed, log rolled back"
            );
            return Err(e.into());
        }

        *writes = if sync { 0 } else { *writes + 1 };
        *tail = position + frame.len() as u64;
        self.positions.write().push(position);
        Ok(message)
    }

    /// Force sync all pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        let file = self.file.lock();
        file.sync_data()?;
        *self.writes_since_sync.lock() = 0;
        Ok(())
    }

    /// Offset of the next append.
    pub fn next_offset(&self) -> u64 {
        self.positions.read().len() as u64
    }

    pub fn read_at(&self, offset: u64) -> Result<Option<StoredMessage>> {
        Ok(self.read_from(offset, 1)?.into_iter().next())
    }

    /// Up to `max` messages starting at `offset`.
    pub fn read_from(&self, offset: u64, max: usize) -> Result<Vec<StoredMessage>> {
        let start = {
            let positions = self.positions.read();
            match positions.get(offset as usize) {
                Some(position) => *position,
                None => return Ok(Vec::new()),
            }
        };
        let end = self.next_offset();

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(start))?;
        let mut reader = BufReader::new(&mut *file);

        let mut out = Vec::new();
        let mut next = offset;
        while next < end && out.len() < max {
            let (message, _) = read_frame(&mut reader)?;
            if message.offset != next {
                return Err(CohortError::Corruption(format!(
                    "{}: expected offset {next}, found {}",
                    self.path.display(),
                    message.offset
                )));
            }
            out.push(message);
            next += 1;
        }

        Ok(out)
    }

    /// Scan the log, truncating a torn tail. Returns frame positions.
    fn recover(path: &Path, file: &mut File) -> Result<Vec<u64>> {
        let size = file.metadata()?.len();
        file.seek(SeekFrom::Start(0))?;

        let mut reader = BufReader::new(file.try_clone()?);
        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LOG_MAGIC {
            return Err(CohortError::InvalidFormat(format!(
                "{}: invalid log magic",
                path.display()
            )));
        }
        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LOG_VERSION {
            return Err(CohortError::InvalidFormat(format!(
                "{}: unsupported log version {}",
                path.display(),
                version[0]
            )));
        }

        let mut positions = Vec::new();
        let mut position = HEADER_SIZE;
        while position < size {
            match read_frame(&mut reader) {
                Ok((message, frame_len)) if message.offset == positions.len() as u64 => {
                    positions.push(position);
                    position += frame_len;
                }
                Ok((message, _)) => {
                    return Err(CohortError::Corruption(format!(
                        "{}: frame at {position} has offset {}, expected {}",
                        path.display(),
                        message.offset,
                        positions.len()
                    )));
                }
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        position,
                        size,
                        error = %e,
                        "truncating torn tail of topic log"
                    );
                    file.set_len(position)?;
                    file.sync_all()?;
                    break;
                }
            }
        }

        Ok(positions)
    }
}

/// File operations an append relies on.
trait AppendTarget: Write + Seek {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate(&mut self, size: u64) -> io::Result<()>;
}

impl AppendTarget for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate(&mut self, size: u64) -> io::Result<()> {
        self.set_len(size)
    }
}

/// Write `frame` at `position`, syncing if asked. On failure the target is
/// cut back to `position`, so no unindexed bytes stay behind.
fn append_frame<T: AppendTarget>(
    target: &mut T,
    position: u64,
    frame: &[u8],
    sync: bool,
) -> io::Result<()> {
    if let Err(e) = write_frame_at(target, position, frame, sync) {
        if let Err(truncate) = target.truncate(position) {
            // The next append starts at `position` again and overwrites
            // whatever is left.
            warn!(position, error = %truncate, "failed to roll back partial frame");
        }
        return Err(e);
    }
    Ok(())
}

fn write_frame_at<T: AppendTarget>(
    target: &mut T,
    position: u64,
    frame: &[u8],
    sync: bool,
) -> io::Result<()> {
    target.seek(SeekFrom::Start(position))?;
    target.write_all(frame)?;
    if sync {
        target.sync()?;
    }
    Ok(())
}

fn encode_frame(message: &StoredMessage) -> Result<Vec<u8>> {
    let body = rmp_serde::to_vec(message)?;
    if body.len() > MAX_FRAME_SIZE {
        return Err(CohortError::InvalidFormat(format!(
            "message of {} bytes exceeds frame limit",
            body.len()
        )));
    }

    let mut frame = Vec::with_capacity(body.len() + 8);
    frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
    frame.extend_from_slice(&body);
    frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
    Ok(frame)
}

/// Read one frame; returns the message and the frame's length on disk.
fn read_frame<R: Read>(reader: &mut R) -> Result<(StoredMessage, u64)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_SIZE {
        return Err(CohortError::Corruption("frame too large".into()));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);
    let computed = crc32fast::hash(&body);
    if stored != computed {
        return Err(CohortError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let message = rmp_serde::from_slice(&body)?;
    Ok((message, (len + 8) as u64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_append_and_read() {
        let dir = TempDir::new().unwrap();
        let log = TopicLog::open(dir.path().join("p0.log")).unwrap();

        let first = log.append("42", b"hello").unwrap();
        let second = log.append("7", b"world").unwrap();
        assert_eq!(first.offset, 0);
        assert_eq!(second.offset, 1);
        assert_eq!(log.next_offset(), 2);

        let read = log.read_at(1).unwrap().unwrap();
        assert_eq!(read.key, "7");
        assert_eq!(read.payload, b"world");
        assert!(log.read_at(2).unwrap().is_none());
    }

    #[test]
    fn test_read_from_respects_max() {
        let dir = TempDir::new().unwrap();
        let log = TopicLog::open(dir.path().join("p0.log")).unwrap();
        for i in 0..10 {
            log.append("k", format!("m{}", i).as_bytes()).unwrap();
        }

        let batch = log.read_from(3, 4).unwrap();
        let offsets: Vec<u64> = batch.iter().map(|m| m.offset).collect();
        assert_eq!(offsets, vec![3, 4, 5, 6]);
        assert_eq!(log.read_from(8, 100).unwrap().len(), 2);
    }

    #[test]
    fn test_persistence() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p0.log");

        {
            let log = TopicLog::open(&path).unwrap();
            for i in 0..5 {
                log.append("k", format!("m{}", i).as_bytes()).unwrap();
            }
        }

        let log = TopicLog::open(&path).unwrap();
        assert_eq!(log.next_offset(), 5);
        let appended = log.append("k", b"m5").unwrap();
        assert_eq!(appended.offset, 5);
        assert_eq!(log.read_from(0, 100).unwrap().len(), 6);
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p0.log");

        {
            let log = TopicLog::open(&path).unwrap();
            log.append("k", b"complete").unwrap();
        }

        // Half-written frame
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(&100u32.to_le_bytes()).unwrap();
            file.write_all(b"partial").unwrap();
        }

        let log = TopicLog::open(&path).unwrap();
        assert_eq!(log.next_offset(), 1);
        let appended = log.append("k", b"after").unwrap();
        assert_eq!(appended.offset, 1);
        assert_eq!(log.read_at(1).unwrap().unwrap().payload, b"after");
    }

    /// In-memory target that fails after a byte budget or on sync.
    struct FlakyDisk {
        data: io::Cursor<Vec<u8>>,
        write_budget: Option<usize>,
        fail_sync: bool,
    }

    impl FlakyDisk {
        fn new(len: usize) -> Self {
            Self {
                data: io::Cursor::new(vec![0xAB; len]),
                write_budget: None,
                fail_sync: false,
            }
        }

        fn len(&self) -> usize {
            self.data.get_ref().len()
        }
    }

    impl Write for FlakyDisk {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            match self.write_budget {
                Some(0) => Err(io::Error::new(io::ErrorKind::Other, "disk full")),
                Some(budget) => {
                    let n = budget.min(buf.len());
                    self.write_budget = Some(budget - n);
                    self.data.write(&buf[..n])
                }
                None => self.data.write(buf),
            }
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Seek for FlakyDisk {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.data.seek(pos)
        }
    }

    impl AppendTarget for FlakyDisk {
        fn sync(&mut self) -> io::Result<()> {
            if self.fail_sync {
                Err(io::Error::new(io::ErrorKind::Other, "EIO"))
            } else {
                Ok(())
            }
        }

        fn truncate(&mut self, size: u64) -> io::Result<()> {
            self.data.get_mut().truncate(size as usize);
            Ok(())
        }
    }

    fn frame(offset: u64) -> Vec<u8> {
        encode_frame(&StoredMessage {
            offset,
            timestamp: Timestamp(0),
            key: "42".into(),
            payload: b"payload".to_vec(),
        })
        .unwrap()
    }

    #[test]
    fn test_partial_write_is_rolled_back() {
        let mut disk = FlakyDisk::new(HEADER_SIZE as usize);
        disk.write_budget = Some(6);

        assert!(append_frame(&mut disk, HEADER_SIZE, &frame(0), true).is_err());
        assert_eq!(disk.len(), HEADER_SIZE as usize);
    }

    #[test]
    fn test_failed_sync_is_rolled_back_and_retry_reuses_offset() {
        let mut disk = FlakyDisk::new(HEADER_SIZE as usize);
        disk.fail_sync = true;
        assert!(append_frame(&mut disk, HEADER_SIZE, &frame(0), true).is_err());
        assert_eq!(disk.len(), HEADER_SIZE as usize);

        disk.fail_sync = false;
        append_frame(&mut disk, HEADER_SIZE, &frame(0), true).unwrap();

        // Exactly one frame, carrying offset 0
        let bytes = disk.data.get_ref()[HEADER_SIZE as usize..].to_vec();
        let mut reader = io::Cursor::new(&bytes);
        let (message, len) = read_frame(&mut reader).unwrap();
        assert_eq!(message.offset, 0);
        assert_eq!(len as usize, bytes.len());
    }

    #[test]
    fn test_append_overwrites_bytes_past_tail() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p0.log");

        let log = TopicLog::open(&path).unwrap();
        log.append("k", b"first").unwrap();

        // Leftover bytes from an append whose rollback failed
        {
            let mut file = OpenOptions::new().append(true).open(&path).unwrap();
            file.write_all(b"junk").unwrap();
        }

        log.append("k", b"second").unwrap();
        drop(log);

        let log = TopicLog::open(&path).unwrap();
        assert_eq!(log.next_offset(), 2);
        assert_eq!(log.read_at(1).unwrap().unwrap().payload, b"second");
    }

    #[test]
    fn test_rejects_foreign_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("p0.log");
        std::fs::write(&path, b"nope, not a log").unwrap();

        assert!(matches!(
            TopicLog::open(&path),
            Err(CohortError::InvalidFormat(_))
        ));
    }
}
