//! Durable, append-only log of game-state snapshots.
//!
//! The log is a single file of length-prefixed records, each a MessagePack
//! encoding of [`LogEntry`]. Entry ids are non-decreasing in file order,
//! which lets range reads stop as soon as they scan past their upper bound.
//! The file is shared between one appending writer and any number of
//! readers, coordinated by a [`ReaderWriterLock`] with writer preference.
//!
//! All access goes through scoped sessions: [`GameStateLog::writer`] and
//! [`GameStateLog::reader`] acquire the corresponding side of the lock and
//! hold it for the lifetime of the returned session value, releasing it on
//! drop. There is no way to append or fetch outside a session.

mod rwlock;

pub use rwlock::{LockTimeout, ReadGuard, ReaderWriterLock, WriteGuard};

use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, BufWriter, ErrorKind, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// One framed record in the log.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    /// Monotonically non-decreasing id assigned by the producer.
    pub id: u64,
    /// Unix seconds at which the entry was appended.
    pub created_at: i64,
    /// Opaque snapshot blob; the log does not interpret it.
    pub payload: Vec<u8>,
}

#[derive(Debug, thiserror::Error)]
pub enum LogError {
    /// The requested record does not exist (e.g. `fetch_last` on an empty
    /// log).
    #[error("no such record")]
    NoSuchRecord,
    /// The lock was not acquired within the session timeout.
    #[error("timed out waiting for the log lock")]
    Timeout(#[from] LockTimeout),
    #[error("failed to encode log record")]
    Encode(#[source] rmp_serde::encode::Error),
    /// A complete frame whose body does not decode. Distinct from a
    /// truncated final record, which is treated as end-of-log.
    #[error("corrupt log record at byte offset {offset}")]
    Corrupt {
        offset: u64,
        #[source]
        source: rmp_serde::decode::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// The append-only snapshot log at a fixed path.
///
/// The value itself is cheap; files are opened per session. The log file
/// is created transparently by the first writer session.
#[derive(Debug)]
pub struct GameStateLog {
    path: PathBuf,
    lock: ReaderWriterLock,
}

impl GameStateLog {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: ReaderWriterLock::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open a writer session, waiting at most `timeout` for the write side
    /// of the lock. At most one writer session exists at a time, and never
    /// concurrently with reader sessions.
    pub fn writer(&self, timeout: Option<Duration>) -> Result<StateLogWriter<'_>, LogError> {
        let guard = self.lock.write(timeout)?;
        let file = OpenOptions::new()
            .append(true)
            .create(true)
            .open(&self.path)?;
        Ok(StateLogWriter {
            out: BufWriter::new(file),
            _guard: guard,
        })
    }

    /// Open a reader session, waiting at most `timeout` for the read side
    /// of the lock. A missing log file reads as an empty log.
    pub fn reader(&self, timeout: Option<Duration>) -> Result<StateLogReader<'_>, LogError> {
        let guard = self.lock.read(timeout)?;
        let input = match File::open(&self.path) {
            Ok(file) => Some(BufReader::new(file)),
            Err(err) if err.kind() == ErrorKind::NotFound => None,
            Err(err) => return Err(err.into()),
        };
        Ok(StateLogReader {
            input,
            _guard: guard,
        })
    }
}

/// Exclusive append session on the log.
#[derive(Debug)]
pub struct StateLogWriter<'a> {
    out: BufWriter<File>,
    _guard: WriteGuard<'a>,
}

impl StateLogWriter<'_> {
    /// Append one framed record at the end of the file.
    pub fn append(&mut self, entry: &LogEntry) -> Result<(), LogError> {
        let body = rmp_serde::to_vec(entry).map_err(LogError::Encode)?;
        let len = u32::try_from(body.len()).map_err(|_| {
            io::Error::new(ErrorKind::InvalidInput, "log record exceeds frame limit")
        })?;
        self.out.write_all(&len.to_le_bytes())?;
        self.out.write_all(&body)?;
        Ok(())
    }

    /// Force appended records to durable storage.
    pub fn flush(&mut self) -> Result<(), LogError> {
        self.out.flush()?;
        self.out.get_ref().sync_data()?;
        Ok(())
    }
}

/// Shared read session on the log.
#[derive(Debug)]
pub struct StateLogReader<'a> {
    input: Option<BufReader<File>>,
    _guard: ReadGuard<'a>,
}

impl StateLogReader<'_> {
    /// Entries with `start_id <= id <= end_id`, in ascending id order.
    ///
    /// The returned iterator is lazy and single-pass; a fresh `fetch` call
    /// starts over from the beginning of the file.
    pub fn fetch(&mut self, start_id: u64, end_id: u64) -> Result<Fetch<'_>, LogError> {
        if let Some(input) = self.input.as_mut() {
            input.seek(SeekFrom::Start(0))?;
        }
        Ok(Fetch {
            input: self.input.as_mut(),
            offset: 0,
            start_id,
            end_id,
            done: false,
        })
    }

    /// All entries from `start_id` (or the first record) onward.
    pub fn fetch_all(&mut self, start_id: Option<u64>) -> Result<Fetch<'_>, LogError> {
        self.fetch(start_id.unwrap_or(0), u64::MAX)
    }

    /// The entry with the highest id, or [`LogError::NoSuchRecord`] on an
    /// empty log.
    pub fn fetch_last(&mut self) -> Result<LogEntry, LogError> {
        let mut last = None;
        for entry in self.fetch_all(None)? {
            last = Some(entry?);
        }
        last.ok_or(LogError::NoSuchRecord)
    }
}

/// Lazy scan over a range of log entries. See [`StateLogReader::fetch`].
#[derive(Debug)]
pub struct Fetch<'r> {
    input: Option<&'r mut BufReader<File>>,
    offset: u64,
    start_id: u64,
    end_id: u64,
    done: bool,
}

impl Iterator for Fetch<'_> {
    type Item = Result<LogEntry, LogError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let input = self.input.as_mut()?;
        loop {
            match read_frame(input, &mut self.offset) {
                Ok(Some(entry)) => {
                    if entry.id > self.end_id {
                        // Ids are non-decreasing; nothing later can match.
                        self.done = true;
                        return None;
                    }
                    if entry.id >= self.start_id {
                        return Some(Ok(entry));
                    }
                }
                Ok(None) => {
                    self.done = true;
                    return None;
                }
                Err(err) => {
                    self.done = true;
                    return Some(Err(err));
                }
            }
        }
    }
}

enum Filled {
    Full,
    Partial,
    Eof,
}

fn read_buf(input: &mut impl Read, buf: &mut [u8]) -> io::Result<Filled> {
    let mut filled = 0;
    while filled < buf.len() {
        match input.read(&mut buf[filled..]) {
            Ok(0) => {
                return Ok(if filled == 0 {
                    Filled::Eof
                } else {
                    Filled::Partial
                })
            }
            Ok(n) => filled += n,
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            Err(err) => return Err(err),
        }
    }
    Ok(Filled::Full)
}

/// Read one frame, or `None` at end-of-log. A truncated final frame —
/// possible after a crash mid-append — is reported as end-of-log so that
/// everything before it stays readable.
fn read_frame(input: &mut BufReader<File>, offset: &mut u64) -> Result<Option<LogEntry>, LogError> {
    let mut len_bytes = [0u8; 4];
    match read_buf(input, &mut len_bytes)? {
        Filled::Eof => return Ok(None),
        Filled::Partial => {
            tracing::warn!(
                offset = *offset,
                "truncated length prefix at end of log; treating as end-of-log"
            );
            return Ok(None);
        }
        Filled::Full => {}
    }

    let len = u32::from_le_bytes(len_bytes) as usize;
    let mut body = vec![0u8; len];
    match read_buf(input, &mut body)? {
        Filled::Full => {}
        Filled::Eof | Filled::Partial => {
            tracing::warn!(
                offset = *offset,
                len,
                "truncated record at end of log; treating as end-of-log"
            );
            return Ok(None);
        }
    }

    let entry = rmp_serde::from_slice(&body).map_err(|source| LogError::Corrupt {
        offset: *offset,
        source,
    })?;
    *offset += 4 + len as u64;
    Ok(Some(entry))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::tempdir;

    fn entry(id: u64) -> LogEntry {
        LogEntry {
            id,
            created_at: 1_557_535_071,
            payload: format!("{{\"round\":{id}}}").into_bytes(),
        }
    }

    fn log_in(dir: &tempfile::TempDir) -> GameStateLog {
        GameStateLog::new(dir.path().join("statelog.bin"))
    }

    #[test]
    fn write_and_read_roundtrip() {
        let dir = tempdir().unwrap();
        let log = log_in(&dir);

        let mut writer = log.writer(None).unwrap();
        writer.append(&entry(1)).unwrap();
        writer.append(&entry(2)).unwrap();
        writer.flush().unwrap();
        drop(writer);

        let mut reader = log.reader(None).unwrap();
        let read: Vec<_> = reader
            .fetch_all(None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(read, vec![entry(1), entry(2)]);
    }

    #[test]
    fn appends_accumulate_across_sessions() {
        let dir = tempdir().unwrap();
        let log = log_in(&dir);

        for id in 1..=3 {
            let mut writer = log.writer(None).unwrap();
            writer.append(&entry(id)).unwrap();
        }

        let mut reader = log.reader(None).unwrap();
        let ids: Vec<_> = reader
            .fetch_all(None)
            .unwrap()
            .map(|e| e.unwrap().id)
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }

    #[test]
    fn fetch_returns_exactly_the_requested_range() {
        let dir = tempdir().unwrap();
        let log = log_in(&dir);

        let mut writer = log.writer(None).unwrap();
        for id in 1..=5 {
            writer.append(&entry(id)).unwrap();
        }
        drop(writer);

        let mut reader = log.reader(None).unwrap();
        let ids: Vec<_> = reader
            .fetch(2, 4)
            .unwrap()
            .map(|e| e.unwrap().id)
            .collect();
        assert_eq!(ids, vec![2, 3, 4]);

        // A later fetch on the same session starts over.
        let ids: Vec<_> = reader
            .fetch(4, 5)
            .unwrap()
            .map(|e| e.unwrap().id)
            .collect();
        assert_eq!(ids, vec![4, 5]);
    }

    #[test]
    fn fetch_past_the_end_is_empty() {
        let dir = tempdir().unwrap();
        let log = log_in(&dir);

        let mut writer = log.writer(None).unwrap();
        writer.append(&entry(1)).unwrap();
        writer.append(&entry(2)).unwrap();
        drop(writer);

        let mut reader = log.reader(None).unwrap();
        assert_eq!(reader.fetch(5, 10).unwrap().count(), 0);
    }

    #[test]
    fn fetch_last_returns_highest_id() {
        let dir = tempdir().unwrap();
        let log = log_in(&dir);

        {
            let mut reader = log.reader(None).unwrap();
            assert!(matches!(
                reader.fetch_last(),
                Err(LogError::NoSuchRecord)
            ));
        }

        let mut writer = log.writer(None).unwrap();
        writer.append(&entry(10)).unwrap();
        drop(writer);
        {
            let mut reader = log.reader(None).unwrap();
            assert_eq!(reader.fetch_last().unwrap().id, 10);
        }

        let mut writer = log.writer(None).unwrap();
        for id in 11..=13 {
            writer.append(&entry(id)).unwrap();
        }
        drop(writer);
        let mut reader = log.reader(None).unwrap();
        assert_eq!(reader.fetch_last().unwrap().id, 13);
    }

    #[test]
    fn missing_file_reads_as_empty() {
        let dir = tempdir().unwrap();
        let log = log_in(&dir);

        let mut reader = log.reader(None).unwrap();
        assert_eq!(reader.fetch_all(None).unwrap().count(), 0);
        assert!(matches!(reader.fetch_last(), Err(LogError::NoSuchRecord)));
    }

    #[test]
    fn truncated_final_record_is_end_of_log() {
        let dir = tempdir().unwrap();
        let log = log_in(&dir);

        let mut writer = log.writer(None).unwrap();
        writer.append(&entry(1)).unwrap();
        writer.append(&entry(2)).unwrap();
        writer.flush().unwrap();
        drop(writer);

        // Chop into the body of the final record.
        let len = std::fs::metadata(log.path()).unwrap().len();
        let file = OpenOptions::new().write(true).open(log.path()).unwrap();
        file.set_len(len - 3).unwrap();

        let mut reader = log.reader(None).unwrap();
        let read: Vec<_> = reader
            .fetch_all(None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(read, vec![entry(1)]);

        // Chop into the length prefix of the second record as well.
        let first_frame = 4 + rmp_serde::to_vec(&entry(1)).unwrap().len() as u64;
        let file = OpenOptions::new().write(true).open(log.path()).unwrap();
        file.set_len(first_frame + 2).unwrap();

        let mut reader = log.reader(None).unwrap();
        let read: Vec<_> = reader
            .fetch_all(None)
            .unwrap()
            .collect::<Result<_, _>>()
            .unwrap();
        assert_eq!(read, vec![entry(1)]);
    }

    #[test]
    fn concurrent_readers_share_a_session_window() {
        let dir = tempdir().unwrap();
        let log = Arc::new(log_in(&dir));

        let mut writer = log.writer(None).unwrap();
        for id in 1..=4 {
            writer.append(&entry(id)).unwrap();
        }
        writer.flush().unwrap();
        drop(writer);

        let tasks: Vec<_> = (0..4)
            .map(|_| {
                let log = log.clone();
                thread::spawn(move || {
                    let mut reader = log.reader(None).unwrap();
                    reader
                        .fetch_all(None)
                        .unwrap()
                        .map(|e| e.unwrap().id)
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        for task in tasks {
            assert_eq!(task.join().unwrap(), vec![1, 2, 3, 4]);
        }
    }
}
