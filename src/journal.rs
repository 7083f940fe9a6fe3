//! Append-only journal of store mutations.
//!
//! Every mutation of the subscriber and payment tables is written here as a
//! single framed entry before it is applied in memory. On open the journal is
//! replayed to rebuild the tables. A payment touches both tables but is one
//! frame, so it is either fully present after a crash or not at all.
//!
//! Frame layout: `u32` length (LE), MessagePack body, `u32` CRC32 of the body.

use crate::error::{GateError, Result};
use crate::types::{PaymentRecord, Subscriber, Timestamp, UserId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Magic bytes for the journal file.
const JOURNAL_MAGIC: &[u8; 4] = b"SGJ\0";

/// Current journal format version.
const JOURNAL_VERSION: u8 = 1;

const HEADER_SIZE: u64 = 5;

/// Upper bound on a single frame; anything larger is damage, not data.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// A mutation recorded in the journal.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum JournalOp {
    /// Subscriber upsert plus payment append, applied together.
    PaymentApplied {
        subscriber: Subscriber,
        payment: PaymentRecord,
    },
    /// Reminder delivered (or given up on) for the current period.
    Notified { user_id: UserId },
    /// A reminder attempt failed; `attempts` is the new total.
    ReminderFailed { user_id: UserId, attempts: u32 },
    /// The sweep expired the subscriber.
    Expired { user_id: UserId },
    /// Admin removed the subscriber row.
    SubscriberDeleted { user_id: UserId },
    /// Full contents of both tables (written by compaction).
    Snapshot {
        subscribers: Vec<Subscriber>,
        payments: Vec<PaymentRecord>,
    },
}

/// A single journal entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct JournalEntry {
    /// Monotonic sequence number.
    pub seq: u64,
    /// When the entry was written.
    pub timestamp: Timestamp,
    pub op: JournalOp,
}

struct Writer {
    file: File,
    size: u64,
    next_seq: u64,
}

/// Journal file manager.
pub struct Journal {
    path: PathBuf,
    writer: Mutex<Writer>,
    sync_every_write: bool,
    #[cfg(test)]
    fail_writes: std::sync::atomic::AtomicBool,
}

impl Journal {
    /// Open (or create) a journal and return it with every entry it holds.
    ///
    /// A torn frame at the very end of the file is the trace of a crash
    /// mid-write; it is cut off with a warning. Damage anywhere else is an
    /// error.
    pub fn open(path: impl AsRef<Path>, sync_every_write: bool) -> Result<(Self, Vec<JournalEntry>)> {
        let path = path.as_ref().to_path_buf();

        if !path.exists() {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(true)
                .open(&path)?;
            file.write_all(JOURNAL_MAGIC)?;
            file.write_all(&[JOURNAL_VERSION])?;
            file.sync_all()?;

            let journal = Self::with_file(path, file, HEADER_SIZE, 1, sync_every_write);
            return Ok((journal, Vec::new()));
        }

        let bytes = fs::read(&path)?;
        let (entries, good_len) = Self::parse(&bytes)?;

        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        if good_len < bytes.len() as u64 {
            warn!(
                path = %path.display(),
                dropped_bytes = bytes.len() as u64 - good_len,
                "truncating torn journal tail"
            );
            file.set_len(good_len)?;
            file.sync_all()?;
        }

        let next_seq = entries.last().map(|e| e.seq + 1).unwrap_or(1);
        let journal = Self::with_file(path, file, good_len, next_seq, sync_every_write);
        Ok((journal, entries))
    }

    fn with_file(path: PathBuf, file: File, size: u64, next_seq: u64, sync_every_write: bool) -> Self {
        Self {
            path,
            writer: Mutex::new(Writer {
                file,
                size,
                next_seq,
            }),
            sync_every_write,
            #[cfg(test)]
            fail_writes: std::sync::atomic::AtomicBool::new(false),
        }
    }

    /// Parse the whole file, returning entries and the length of the valid prefix.
    fn parse(bytes: &[u8]) -> Result<(Vec<JournalEntry>, u64)> {
        if bytes.len() < HEADER_SIZE as usize || &bytes[0..4] != JOURNAL_MAGIC {
            return Err(GateError::InvalidFormat("Invalid journal magic".into()));
        }
        if bytes[4] != JOURNAL_VERSION {
            return Err(GateError::InvalidFormat(format!(
                "Unsupported journal version: {}",
                bytes[4]
            )));
        }

        let mut entries = Vec::new();
        let mut pos = HEADER_SIZE as usize;

        while pos < bytes.len() {
            let rest = &bytes[pos..];
            if rest.len() < 4 {
                break;
            }
            let len = u32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]) as usize;
            if len > MAX_FRAME_SIZE {
                return Err(GateError::Corruption(format!(
                    "journal frame at offset {} claims {} bytes",
                    pos, len
                )));
            }
            let frame_len = 4 + len + 4;
            if rest.len() < frame_len {
                break;
            }

            let body = &rest[4..4 + len];
            let stored = u32::from_le_bytes([
                rest[4 + len],
                rest[5 + len],
                rest[6 + len],
                rest[7 + len],
            ]);
            let computed = crc32fast::hash(body);
            if stored != computed {
                if pos + frame_len == bytes.len() {
                    // Last frame, written partially before a crash.
                    break;
                }
                return Err(GateError::ChecksumMismatch {
                    expected: stored,
                    got: computed,
                });
            }

            let entry: JournalEntry = rmp_serde::from_slice(body)?;
            entries.push(entry);
            pos += frame_len;
        }

        Ok((entries, pos as u64))
    }

    /// Append an operation. Returns its sequence number once it is written.
    ///
    /// On failure the file is cut back to its previous length so a partial
    /// frame never sits in front of later entries.
    pub fn append(&self, op: JournalOp) -> Result<u64> {
        let mut writer = self.writer.lock();
        let seq = writer.next_seq;

        let entry = JournalEntry {
            seq,
            timestamp: Timestamp::now(),
            op,
        };
        let frame = Self::encode_frame(&entry)?;

        let start = writer.size;
        match self.write_frame(&mut writer.file, start, &frame) {
            Ok(()) => {
                writer.size = start + frame.len() as u64;
                writer.next_seq += 1;
                Ok(seq)
            }
            Err(e) => {
                if let Err(rollback) = writer.file.set_len(start) {
                    warn!(error = %rollback, "failed to roll back partial journal frame");
                }
                Err(e)
            }
        }
    }

    fn write_frame(&self, file: &mut File, offset: u64, frame: &[u8]) -> Result<()> {
        self.check_injected_failure()?;

        file.seek(SeekFrom::Start(offset))?;
        file.write_all(frame)?;
        file.flush()?;
        if self.sync_every_write {
            file.sync_data()?;
        }
        Ok(())
    }

    /// Replace the journal with the given operations (used by compaction).
    ///
    /// Written to a sibling file and renamed into place, so a crash leaves
    /// either the old journal or the new one.
    pub fn rewrite(&self, ops: Vec<JournalOp>) -> Result<()> {
        let mut writer = self.writer.lock();
        let tmp_path = self.path.with_extension("compact");

        let mut seq = writer.next_seq;
        let mut size = HEADER_SIZE;
        {
            let mut tmp = File::create(&tmp_path)?;
            tmp.write_all(JOURNAL_MAGIC)?;
            tmp.write_all(&[JOURNAL_VERSION])?;
            for op in ops {
                let frame = Self::encode_frame(&JournalEntry {
                    seq,
                    timestamp: Timestamp::now(),
                    op,
                })?;
                tmp.write_all(&frame)?;
                size += frame.len() as u64;
                seq += 1;
            }
            tmp.sync_all()?;
        }

        fs::rename(&tmp_path, &self.path)?;

        writer.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
        writer.size = size;
        writer.next_seq = seq;
        Ok(())
    }

    /// Current file size in bytes.
    pub fn size(&self) -> u64 {
        self.writer.lock().size
    }

    /// Force pending writes to disk.
    pub fn sync(&self) -> Result<()> {
        self.writer.lock().file.sync_all()?;
        Ok(())
    }

    fn encode_frame(entry: &JournalEntry) -> Result<Vec<u8>> {
        let body = rmp_serde::to_vec(entry)?;
        let mut frame = Vec::with_capacity(body.len() + 8);
        frame.extend_from_slice(&(body.len() as u32).to_le_bytes());
        frame.extend_from_slice(&body);
        frame.extend_from_slice(&crc32fast::hash(&body).to_le_bytes());
        Ok(frame)
    }

    #[cfg(test)]
    fn check_injected_failure(&self) -> Result<()> {
        if self.fail_writes.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(GateError::Io(std::io::Error::new(
                std::io::ErrorKind::Other,
                "injected journal write failure",
            )));
        }
        Ok(())
    }

    #[cfg(not(test))]
    fn check_injected_failure(&self) -> Result<()> {
        Ok(())
    }

    /// Make every following write fail.
    #[cfg(test)]
    pub(crate) fn set_fail_writes(&self, fail: bool) {
        self.fail_writes
            .store(fail, std::sync::atomic::Ordering::SeqCst);
    }
}
