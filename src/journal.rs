//! Binary journal of computed clock deltas
//!
//! A live requester appends one record per completed exchange; replay mode
//! reads the records back in order and feeds them to the clock sink. Each
//! record is `timestamp` (8 bytes), payload length (4 bytes) and the
//! payload itself, all little-endian like the wire codec.

use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read, Write};
use std::path::Path;

use crate::types::{Error, Result};

/// Append/read store for `(timestamp, payload)` records
///
/// A journal is opened in exactly one direction: [`DeltaJournal::create`]
/// for appending during a live run, [`DeltaJournal::open`] for replaying a
/// previous one.
pub struct DeltaJournal {
    file: File,
}

impl DeltaJournal {
    /// Create the journal file for appending, truncating any previous run
    ///
    /// # Errors
    ///
    /// Will return `Err` if the file cannot be created
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .map_err(|_| Error::JournalInit)?;

        Ok(DeltaJournal { file })
    }

    /// Open an existing journal for reading from its first record
    ///
    /// # Errors
    ///
    /// Will return `Err` if the file cannot be opened
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = File::open(path).map_err(|_| Error::JournalInit)?;

        Ok(DeltaJournal { file })
    }

    /// Append one record
    ///
    /// # Errors
    ///
    /// Will return `Err` if the record cannot be written out
    pub fn write(&mut self, timestamp: i64, payload: &[u8]) -> Result<()> {
        let len = u32::try_from(payload.len())
            .map_err(|_| Error::JournalWrite)?;

        self.file
            .write_all(&timestamp.to_le_bytes())
            .map_err(|_| Error::JournalWrite)?;
        self.file
            .write_all(&len.to_le_bytes())
            .map_err(|_| Error::JournalWrite)?;
        self.file
            .write_all(payload)
            .map_err(|_| Error::JournalWrite)?;
        self.file.flush().map_err(|_| Error::JournalWrite)
    }

    /// Read the next record
    ///
    /// # Errors
    ///
    /// Will return `Error::ReplayExhausted` once every record has been
    /// consumed and `Error::JournalRead` on a truncated or unreadable one
    pub fn read(&mut self) -> Result<(i64, Vec<u8>)> {
        let mut stamp = [0u8; 8];
        match self.file.read_exact(&mut stamp) {
            Ok(()) => {}
            Err(err) if err.kind() == ErrorKind::UnexpectedEof => {
                return Err(Error::ReplayExhausted);
            }
            Err(_) => return Err(Error::JournalRead),
        }

        let mut len = [0u8; 4];
        self.file
            .read_exact(&mut len)
            .map_err(|_| Error::JournalRead)?;

        let mut payload = vec![0u8; u32::from_le_bytes(len) as usize];
        self.file
            .read_exact(&mut payload)
            .map_err(|_| Error::JournalRead)?;

        Ok((i64::from_le_bytes(stamp), payload))
    }
}
