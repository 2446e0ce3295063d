//! The on-disk log manager: a paged append-only file where each log record
//! occupies exactly one page, checksummed with `crc32c`. LSN 0 is the
//! master record's fixed page, rewritten in place by
//! [`LogManager::rewrite_master_record`]; every other LSN is write-once.
//!
//! A checksum failure (or short read) on what bookkeeping expects to be
//! the very last page is treated as a torn write from an in-flight append
//! at crash time -- the log is considered to end there, not corrupt. The
//! same failure on an earlier page is a hard [`LogError::ChecksumMismatch`].

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::common::{Lsn, MASTER_LSN};
use crate::error::{LogError, LogResult};
use crate::log::record::LogRecord;

const PAGE_HEADER_LEN: usize = 8;

struct LogManagerState {
    file: File,
    page_size: usize,
    /// The next LSN that will be handed out by `append_to_log`.
    next_lsn: Lsn,
    /// The highest LSN durably written (and fsynced) to disk.
    flushed_lsn: Lsn,
    /// Records appended but not yet flushed.
    pending: BTreeMap<Lsn, LogRecord>,
}

fn write_page(file: &mut File, page_index: u64, page_size: usize, body: &[u8]) -> std::io::Result<()> {
    let checksum = crc32c::crc32c(body);
    let mut buf = vec![0u8; page_size];
    buf[0..4].copy_from_slice(&checksum.to_le_bytes());
    buf[4..8].copy_from_slice(&(body.len() as u32).to_le_bytes());
    buf[PAGE_HEADER_LEN..PAGE_HEADER_LEN + body.len()].copy_from_slice(body);
    file.seek(SeekFrom::Start(page_index * page_size as u64))?;
    file.write_all(&buf)
}

/// Reads and validates the page at `page_index`. Returns `Ok(None)` for a
/// short read, truncated body, or checksum mismatch -- any of which mean
/// "no valid record here", leaving the caller to decide whether that's an
/// expected torn tail or a hard corruption.
fn read_page(file: &mut File, page_index: u64, page_size: usize) -> std::io::Result<Option<Vec<u8>>> {
    let offset = page_index * page_size as u64;
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = vec![0u8; page_size];
    let n = file.read(&mut buf)?;
    if n < PAGE_HEADER_LEN {
        return Ok(None);
    }
    let checksum = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let len = u32::from_le_bytes(buf[4..8].try_into().unwrap()) as usize;
    if PAGE_HEADER_LEN + len > n {
        return Ok(None);
    }
    let body = &buf[PAGE_HEADER_LEN..PAGE_HEADER_LEN + len];
    if crc32c::crc32c(body) != checksum {
        return Ok(None);
    }
    Ok(Some(body.to_vec()))
}

pub struct LogManager {
    state: Mutex<LogManagerState>,
}

impl LogManager {
    /// Opens (creating if absent) the log file at `path`, paged at
    /// `page_size` bytes. On an existing file, replays page headers to
    /// discover where the valid log ends, tolerating a torn tail at the
    /// very last page.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> LogResult<LogManager> {
        let mut file = OpenOptions::new().read(true).write(true).create(true).open(path)?;
        let len = file.metadata()?.len();

        if len == 0 {
            let master = LogRecord::Master { flushed_lsn: MASTER_LSN };
            let body = master.encode()?;
            write_page(&mut file, 0, page_size, &body)?;
            file.sync_all()?;
            return Ok(LogManager {
                state: Mutex::new(LogManagerState {
                    file,
                    page_size,
                    next_lsn: 1,
                    flushed_lsn: 0,
                    pending: BTreeMap::new(),
                }),
            });
        }

        match read_page(&mut file, 0, page_size)? {
            Some(body) => {
                LogRecord::decode(&body)?;
            }
            None => return Err(LogError::ChecksumMismatch { page: 0 }),
        }

        let mut next_lsn = 1u64;
        loop {
            match read_page(&mut file, next_lsn, page_size)? {
                Some(body) => {
                    LogRecord::decode(&body)?;
                    next_lsn += 1;
                }
                None => break,
            }
        }
        let flushed_lsn = next_lsn - 1;
        debug!(next_lsn, flushed_lsn, "log manager recovered end-of-log position");

        Ok(LogManager {
            state: Mutex::new(LogManagerState { file, page_size, next_lsn, flushed_lsn, pending: BTreeMap::new() }),
        })
    }

    /// Appends `record`, assigning it the next LSN. The record is buffered
    /// in memory until a later [`LogManager::flush_to_lsn`] call makes it
    /// durable.
    pub fn append_to_log(&self, record: LogRecord) -> LogResult<Lsn> {
        let mut state = self.state.lock();
        let body_len_estimate = record.encode()?.len();
        if body_len_estimate + PAGE_HEADER_LEN > state.page_size {
            return Err(LogError::Serialize("log record exceeds page size".into()));
        }
        let lsn = state.next_lsn;
        state.next_lsn += 1;
        state.pending.insert(lsn, record);
        Ok(lsn)
    }

    /// Forces every buffered record up to and including `target` to disk,
    /// fsyncing once. A no-op if `target` is already durable.
    pub fn flush_to_lsn(&self, target: Lsn) -> LogResult<()> {
        let mut state = self.state.lock();
        if target <= state.flushed_lsn {
            return Ok(());
        }
        let to_flush: Vec<Lsn> = state.pending.range(..=target).map(|(lsn, _)| *lsn).collect();
        let page_size = state.page_size;
        for lsn in &to_flush {
            let record = state.pending.get(lsn).unwrap();
            let body = record.encode()?;
            write_page(&mut state.file, *lsn, page_size, &body)?;
        }
        if !to_flush.is_empty() {
            state.file.sync_all()?;
            for lsn in &to_flush {
                state.pending.remove(lsn);
            }
        }
        state.flushed_lsn = state.flushed_lsn.max(target.min(state.next_lsn.saturating_sub(1)));
        Ok(())
    }

    /// Rewrites the fixed master record in place, pointing at the most
    /// recent checkpoint's begin-LSN. The only record ever overwritten
    /// rather than appended.
    pub fn rewrite_master_record(&self, last_checkpoint_lsn: Lsn) -> LogResult<()> {
        let mut state = self.state.lock();
        let master = LogRecord::Master { flushed_lsn: last_checkpoint_lsn };
        let body = master.encode()?;
        let page_size = state.page_size;
        write_page(&mut state.file, 0, page_size, &body)?;
        state.file.sync_all()?;
        Ok(())
    }

    /// Fetches the record at `lsn`, consulting the pending buffer first.
    pub fn fetch_log_record(&self, lsn: Lsn) -> LogResult<LogRecord> {
        let mut state = self.state.lock();
        if lsn >= state.next_lsn {
            return Err(LogError::NotFound { lsn });
        }
        if let Some(record) = state.pending.get(&lsn) {
            return Ok(record.clone());
        }
        let page_size = state.page_size;
        match read_page(&mut state.file, lsn, page_size)? {
            Some(body) => LogRecord::decode(&body),
            None => {
                warn!(lsn, "log page failed validation for an LSN bookkeeping expected to be durable");
                Err(LogError::ChecksumMismatch { page: lsn })
            }
        }
    }

    /// All records from `start` (inclusive) to the current end of the log,
    /// in LSN order.
    pub fn scan_from(&self, start: Lsn) -> LogResult<Vec<(Lsn, LogRecord)>> {
        let next_lsn = self.state.lock().next_lsn;
        let mut out = Vec::new();
        for lsn in start.max(1)..next_lsn {
            out.push((lsn, self.fetch_log_record(lsn)?));
        }
        Ok(out)
    }

    pub fn flushed_lsn(&self) -> Lsn {
        self.state.lock().flushed_lsn
    }

    pub fn last_lsn(&self) -> Lsn {
        self.state.lock().next_lsn - 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn append_flush_and_fetch_round_trip() {
        let dir = tempdir().unwrap();
        let lm = LogManager::open(dir.path().join("log"), 4096).unwrap();
        let lsn = lm.append_to_log(LogRecord::Commit { txn_id: 1, prev_lsn: 0 }).unwrap();
        lm.flush_to_lsn(lsn).unwrap();
        let fetched = lm.fetch_log_record(lsn).unwrap();
        assert_eq!(fetched, LogRecord::Commit { txn_id: 1, prev_lsn: 0 });
    }

    #[test]
    fn fetch_before_flush_reads_pending() {
        let dir = tempdir().unwrap();
        let lm = LogManager::open(dir.path().join("log"), 4096).unwrap();
        let lsn = lm.append_to_log(LogRecord::Abort { txn_id: 2, prev_lsn: 0 }).unwrap();
        let fetched = lm.fetch_log_record(lsn).unwrap();
        assert_eq!(fetched, LogRecord::Abort { txn_id: 2, prev_lsn: 0 });
    }

    #[test]
    fn recovers_end_of_log_after_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("log");
        {
            let lm = LogManager::open(&path, 4096).unwrap();
            let lsn = lm.append_to_log(LogRecord::Commit { txn_id: 1, prev_lsn: 0 }).unwrap();
            lm.flush_to_lsn(lsn).unwrap();
        }
        let lm2 = LogManager::open(&path, 4096).unwrap();
        assert_eq!(lm2.last_lsn(), 1);
        assert_eq!(lm2.fetch_log_record(1).unwrap(), LogRecord::Commit { txn_id: 1, prev_lsn: 0 });
    }

    #[test]
    fn master_record_is_rewritten_in_place() {
        let dir = tempdir().unwrap();
        let lm = LogManager::open(dir.path().join("log"), 4096).unwrap();
        let lsn = lm.append_to_log(LogRecord::Commit { txn_id: 9, prev_lsn: 0 }).unwrap();
        lm.flush_to_lsn(lsn).unwrap();
        lm.rewrite_master_record(lsn).unwrap();
        assert_eq!(lm.fetch_log_record(0).unwrap(), LogRecord::Master { flushed_lsn: lsn });
    }

    #[test]
    fn scan_from_returns_ordered_records() {
        let dir = tempdir().unwrap();
        let lm = LogManager::open(dir.path().join("log"), 4096).unwrap();
        for i in 0..3 {
            let lsn = lm.append_to_log(LogRecord::Commit { txn_id: i, prev_lsn: 0 }).unwrap();
            lm.flush_to_lsn(lsn).unwrap();
        }
        let scanned = lm.scan_from(1).unwrap();
        assert_eq!(scanned.len(), 3);
        assert_eq!(scanned[0].0, 1);
        assert_eq!(scanned[2].0, 3);
    }
}
