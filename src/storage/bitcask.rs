//! An implementation of [Bitcask](https://riak.com/assets/bitcask-intro.pdf).
//!
//! A store is a directory of append-only data files. At any moment exactly
//! one data file is "active" for writing; records are only ever appended to
//! it, and once its size passes the configured limit it is sealed and the
//! next ordinal becomes active. An in-memory keydir maps every live key to
//! the file and offset of its most recent record, so reads are a single seek
//! into the right file. Deletes append a tombstone record, which persists the
//! deletion across restarts.
//!
//! Opening a store replays its files to rebuild the keydir: hint files first
//! (compact per-merged-file indexes written during merges, which predate
//! everything in the surviving data files), then the data files in write
//! order, reading only headers and keys. Every record carries a CRC-64 which
//! is verified on read, so a torn or corrupted record is reported rather
//! than served.
//!
//! Merging rewrites the sealed data files: records that are still some key's
//! current location are copied into merged files (with a hint record each),
//! tombstones and superseded versions are dropped, and the source files are
//! unlinked. The keydir is repointed at the merged locations as they are
//! written, so reads stay coherent without reopening.
//!
//! The engine is single-threaded: one handle, one caller at a time. Cross
//! process, a shared advisory lock is held on the active file for the
//! lifetime of a read-write handle.

mod config;
mod files;
mod keydir;
mod record;

use std::fs::{self, File};
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use fs4::fs_std::FileExt;

pub use self::config::Config;
use self::files::{FileId, FileKind, FileSet};
use self::keydir::{KeyDir, KeyDirEntry};
use self::record::{HintRecord, Record, CRC_LEN, HEADER_LEN, HINT_HEADER_LEN, TOMBSTONE};
use crate::error::{Error, Result};
use crate::region::Region;

/// Initial keydir capacity; the table doubles as it fills.
const KEYDIR_CAPACITY: usize = 4096;

/// A Bitcask store. All engine-owned memory (interned keys, encode and read
/// scratch buffers) is drawn from the caller's [`Region`]; long-running
/// callers should reopen against a fresh or reset region periodically.
pub struct Bitcask<'r> {
    region: &'r Region,
    files: FileSet,
    keydir: KeyDir<'r>,
    config: Config,
    /// The sole writable file. All other data files are immutable.
    active: File,
    active_id: u32,
    num_files: u32,
    /// Offset in the active file where the next record will land.
    cursor: u64,
}

impl<'r> Bitcask<'r> {
    /// Opens or creates a store at the given directory. See [`Config::open`].
    pub(crate) fn open(region: &'r Region, path: &Path, config: Config) -> Result<Self> {
        log::info!("Opening database {}", path.display());
        let files = FileSet::open(path)?;
        // Zero data files and one data file both address ordinal 1.
        let num_files = files.count(FileKind::Data)?.max(1);
        let active = files.open_active(num_files)?;
        let cursor = active.metadata()?.len();
        let keydir = KeyDir::with_capacity(region, KEYDIR_CAPACITY)
            .map_err(|err| Error::Init(Box::new(err)))?;

        let mut bitcask = Self {
            region,
            files,
            keydir,
            config,
            active,
            active_id: num_files,
            num_files,
            cursor,
        };
        bitcask.rebuild_keydir().map_err(|err| Error::Init(Box::new(err)))?;
        if bitcask.config.read_write {
            bitcask.active.lock_shared()?;
        }
        log::info!("Indexed {} live keys in {}", bitcask.keydir.len(), path.display());
        Ok(bitcask)
    }

    /// Gets the value of a key, or `None` if the key is absent or deleted.
    /// The record is reread from disk and its CRC verified on every call.
    pub fn get(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let Some(entry) = self.keydir.get(key) else {
            return Ok(None);
        };
        let entry = *entry;
        let len = (HEADER_LEN as u64)
            .checked_add(key.len() as u64)
            .and_then(|n| n.checked_add(entry.val_len))
            .and_then(|n| n.checked_add(CRC_LEN as u64))
            .ok_or(Error::ArithmeticOverflow)?;
        let len = usize::try_from(len).map_err(|_| Error::ArithmeticOverflow)?;

        let buf = self.region.allocate_unzeroed(1, 1, len)?;
        if entry.file == FileId::Data(self.active_id) {
            self.active.seek(SeekFrom::Start(entry.val_offset))?;
            self.active.read_exact(buf)?;
        } else {
            let mut file = File::open(self.files.path(entry.file))?;
            file.seek(SeekFrom::Start(entry.val_offset))?;
            file.read_exact(buf)?;
        }
        if !record::verify(buf) {
            return Err(Error::Crc);
        }

        let value = record::value_of(buf, key.len());
        // The keydir does not expose tombstones, but recovery replays them.
        if value == TOMBSTONE {
            return Ok(None);
        }
        Ok(Some(value.to_vec()))
    }

    /// Sets the value of a key, overwriting any existing value. A value equal
    /// to the tombstone bytes deletes the key instead.
    pub fn put(&mut self, key: &[u8], value: &[u8]) -> Result<()> {
        if !self.config.read_write {
            return Err(Error::ReadOnly);
        }
        if self.cursor >= self.config.max_file_size {
            self.rotate()?;
        }

        let record = Record { timestamp: now_seconds(), key, value };
        let len = record.encoded_len()?;
        let buf = self.region.allocate_unzeroed(1, 1, len)?;
        record.encode(buf);
        self.active.write_all(buf)?;

        if value == TOMBSTONE {
            self.keydir.delete(key);
        } else {
            let entry = KeyDirEntry {
                file: FileId::Data(self.active_id),
                val_len: value.len() as u64,
                val_offset: self.cursor,
                timestamp: record.timestamp,
            };
            self.keydir.insert(key, entry)?;
        }
        self.cursor = self.cursor.checked_add(len as u64).ok_or(Error::ArithmeticOverflow)?;

        if self.config.sync_on_put {
            self.active.sync_all()?;
        }
        Ok(())
    }

    /// Deletes a key by persisting a tombstone record. Returns `false`
    /// without writing anything if the key is absent.
    pub fn delete(&mut self, key: &[u8]) -> Result<bool> {
        if self.keydir.get(key).is_none() {
            return Ok(false);
        }
        self.put(key, TOMBSTONE)?;
        Ok(true)
    }

    /// Fsyncs the active file.
    pub fn sync(&mut self) -> Result<()> {
        Ok(self.active.sync_all()?)
    }

    /// Compacts the store: streams every sealed data file through merged
    /// files plus hint files, dropping tombstones and superseded records,
    /// then unlinks the sources and renames the active file to ordinal 1 so
    /// numbering stays dense. Requires at least two data files.
    pub fn merge(&mut self) -> Result<()> {
        if !self.config.read_write {
            return Err(Error::ReadOnly);
        }
        if self.num_files < 2 {
            return Err(Error::Merge);
        }
        log::info!("Merging {} sealed data files", self.num_files - 1);

        let mut sink = MergeSink::open(&self.files, self.files.count(FileKind::Merged)?.max(1))?;
        for n in 1..self.num_files {
            self.merge_data_file(n, &mut sink)?;
        }
        sink.sync()?;

        let old_active = self.active_id;
        fs::rename(self.files.data_path(old_active), self.files.data_path(1))?;
        self.keydir.repoint(FileId::Data(old_active), FileId::Data(1));
        self.active_id = 1;
        self.num_files = 1;
        log::info!("Merged into {} live keys", self.keydir.len());
        Ok(())
    }

    /// Seals the active file and opens the next ordinal for appending.
    fn rotate(&mut self) -> Result<()> {
        let next = self.num_files.checked_add(1).ok_or(Error::ArithmeticOverflow)?;
        let file = self.files.open_active(next)?;
        if self.config.read_write {
            file.lock_shared()?;
        }
        log::debug!("Rotating active file to {}", self.files.data_path(next).display());
        self.active = file;
        self.active_id = next;
        self.num_files = next;
        self.cursor = 0;
        Ok(())
    }

    /// Rebuilds the keydir from disk in write order: hint files first (their
    /// merged records predate everything in the surviving data files), then
    /// data files, ascending, so the last insertion per key is its latest
    /// write. Tombstone records overwrite prior entries and are filtered by
    /// `get`.
    fn rebuild_keydir(&mut self) -> Result<()> {
        for n in 1..=self.files.count(FileKind::Hint)? {
            self.replay_hint_file(n)?;
        }
        for n in 1..=self.num_files {
            let valid_len = self.replay_data_file(n)?;
            if n == self.active_id && valid_len < self.cursor {
                log::error!(
                    "Found incomplete record at offset {valid_len} in {}, truncating",
                    self.files.data_path(n).display()
                );
                if self.config.read_write {
                    self.active.set_len(valid_len)?;
                }
                self.cursor = valid_len;
            }
        }
        Ok(())
    }

    /// Replays one data file, inserting an entry per record without reading
    /// value payloads. Returns the length of the well-formed prefix; a short
    /// or malformed record ends the replay cleanly rather than erroring.
    fn replay_data_file(&mut self, n: u32) -> Result<u64> {
        let file = File::open(self.files.data_path(n))?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut header_buf = [0u8; HEADER_LEN];
        let mut key_buf = Vec::new();
        let mut pos = 0u64;

        while pos < file_len {
            if !read_exact_or_eof(&mut reader, &mut header_buf)? {
                break;
            }
            let header = record::decode_header(&header_buf);
            let Some(record_len) = record_len(&header) else { break };
            let Some(end) = pos.checked_add(record_len) else { break };
            if end > file_len {
                break;
            }

            key_buf.resize(header.key_len as usize, 0);
            if !read_exact_or_eof(&mut reader, &mut key_buf)? {
                break;
            }
            let entry = KeyDirEntry {
                file: FileId::Data(n),
                val_len: header.val_len as u64,
                val_offset: pos,
                timestamp: header.timestamp,
            };
            self.keydir.insert(&key_buf, entry)?;

            reader.seek_relative(header.val_len + CRC_LEN as i64)?;
            pos = end;
        }
        Ok(pos)
    }

    /// Replays one hint file, inserting entries that point into the merged
    /// file of the same ordinal.
    fn replay_hint_file(&mut self, n: u32) -> Result<()> {
        let file = File::open(self.files.hint_path(n))?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut header_buf = [0u8; HINT_HEADER_LEN];
        let mut key_buf = Vec::new();
        let mut pos = 0u64;

        while pos < file_len {
            if !read_exact_or_eof(&mut reader, &mut header_buf)? {
                break;
            }
            let (header, val_offset) = record::decode_hint_header(&header_buf);
            if header.key_len < 0 || header.val_len < 0 || val_offset < 0 {
                break;
            }
            let Some(end) = pos
                .checked_add(HINT_HEADER_LEN as u64)
                .and_then(|n| n.checked_add(header.key_len as u64))
            else {
                break;
            };
            if end > file_len {
                break;
            }

            key_buf.resize(header.key_len as usize, 0);
            if !read_exact_or_eof(&mut reader, &mut key_buf)? {
                break;
            }
            let entry = KeyDirEntry {
                file: FileId::Merged(n),
                val_len: header.val_len as u64,
                val_offset: val_offset as u64,
                timestamp: header.timestamp,
            };
            self.keydir.insert(&key_buf, entry)?;
            pos = end;
        }
        Ok(())
    }

    /// Streams one sealed data file through the merge sink. A record
    /// survives only if it is not a tombstone and the keydir still points at
    /// exactly this file and offset; survivors are copied verbatim, get a
    /// hint record, and have their keydir entry repointed at the merged
    /// location. The source file is unlinked once consumed.
    fn merge_data_file(&mut self, n: u32, sink: &mut MergeSink) -> Result<()> {
        let path = self.files.data_path(n);
        let file = File::open(&path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);
        let mut header_buf = [0u8; HEADER_LEN];
        let mut pos = 0u64;

        while pos < file_len {
            if !read_exact_or_eof(&mut reader, &mut header_buf)? {
                break;
            }
            let header = record::decode_header(&header_buf);
            let Some(record_len) = record_len(&header) else { break };
            let Some(end) = pos.checked_add(record_len) else { break };
            if end > file_len {
                break;
            }

            let len = usize::try_from(record_len).map_err(|_| Error::ArithmeticOverflow)?;
            let buf = self.region.allocate_unzeroed(1, 1, len)?;
            buf[..HEADER_LEN].copy_from_slice(&header_buf);
            if !read_exact_or_eof(&mut reader, &mut buf[HEADER_LEN..])? {
                break;
            }
            let key_len = header.key_len as usize;
            let key = &buf[HEADER_LEN..HEADER_LEN + key_len];
            let value = record::value_of(buf, key_len);

            let live = value != TOMBSTONE
                && matches!(
                    self.keydir.get(key),
                    Some(e) if e.file == FileId::Data(n) && e.val_offset == pos
                );
            if live {
                let hint = HintRecord {
                    timestamp: header.timestamp,
                    val_len: header.val_len as u64,
                    val_offset: sink.cursor,
                    key,
                };
                let hint_buf = self.region.allocate_unzeroed(1, 1, hint.encoded_len()?)?;
                hint.encode(hint_buf);

                let entry = KeyDirEntry {
                    file: FileId::Merged(sink.id),
                    val_len: header.val_len as u64,
                    val_offset: sink.cursor,
                    timestamp: header.timestamp,
                };
                sink.merged.write_all(buf)?;
                sink.hint.write_all(hint_buf)?;
                self.keydir.insert(key, entry)?;

                sink.cursor =
                    sink.cursor.checked_add(record_len).ok_or(Error::ArithmeticOverflow)?;
                if sink.cursor >= self.config.max_file_size {
                    sink.rotate(&self.files)?;
                }
            }
            pos = end;
        }

        drop(reader);
        fs::remove_file(&path)?;
        Ok(())
    }
}

/// Attempt to flush the active file when the store is closed.
impl Drop for Bitcask<'_> {
    fn drop(&mut self) {
        if let Err(error) = self.sync() {
            log::error!("failed to sync active file: {error}");
        }
    }
}

/// The merged-file/hint-file pair a merge is currently appending to. Opening
/// a sink at an existing ordinal resumes appending where the last merge left
/// off.
struct MergeSink {
    id: u32,
    merged: File,
    hint: File,
    cursor: u64,
}

impl MergeSink {
    fn open(files: &FileSet, id: u32) -> Result<Self> {
        let merged = files.open_append(FileKind::Merged, id)?;
        let hint = files.open_append(FileKind::Hint, id)?;
        let cursor = merged.metadata()?.len();
        Ok(Self { id, merged, hint, cursor })
    }

    fn rotate(&mut self, files: &FileSet) -> Result<()> {
        self.sync()?;
        let next = self.id.checked_add(1).ok_or(Error::ArithmeticOverflow)?;
        *self = Self::open(files, next)?;
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.merged.sync_all()?;
        self.hint.sync_all()?;
        Ok(())
    }
}

/// The full encoded size of the record a header describes, or `None` when
/// the header cannot be well-formed (negative lengths, overflowing size).
fn record_len(header: &record::Header) -> Option<u64> {
    if header.key_len < 0 || header.val_len < 0 {
        return None;
    }
    (HEADER_LEN as u64)
        .checked_add(header.key_len as u64)?
        .checked_add(header.val_len as u64)?
        .checked_add(CRC_LEN as u64)
}

/// Reads exactly `buf` bytes, or reports a clean end-of-file. A partial
/// record at the tail of a file reads as end-of-file, not as an error.
fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<bool> {
    match reader.read_exact(buf) {
        Ok(()) => Ok(true),
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn now_seconds() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_secs() as i64)
}
