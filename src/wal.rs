use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use crate::model::Record;

/// Encode one committed unit to [len][bincode][crc32] format.
fn encode_entry(writer: &mut impl Write, records: &[Record]) -> io::Result<()> {
    let payload =
        bincode::serialize(records).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Append-only Write-Ahead Log.
///
/// Format per entry: `[u32: len][bincode: Vec<Record>][u32: crc32]`
/// - One entry holds every record of one atomic unit, so a unit is either
///   replayed whole or not at all.
/// - Truncated last entry (crash) is safely discarded via length-prefix + CRC check.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    /// File length after the last successful `flush_sync`.
    durable_len: u64,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        let durable_len = file.metadata()?.len();
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            durable_len,
            appends_since_compact: 0,
        })
    }

    /// Replay the WAL at `path`, cut off any torn tail so later appends stay
    /// readable, and open it for appending.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Vec<Record>>)> {
        let (entries, valid_len) = Self::replay_prefix(path)?;
        let wal = Self::open(path)?;
        if wal.durable_len > valid_len {
            tracing::warn!(
                "discarding {} bytes of torn WAL tail in {}",
                wal.durable_len - valid_len,
                path.display()
            );
            wal.writer.get_ref().set_len(valid_len)?;
            wal.writer.get_ref().sync_all()?;
        }
        Ok((Self { durable_len: valid_len, ..wal }, entries))
    }

    /// Append one entry and fsync. Tests only; the writer task uses
    /// `append_buffered` and one `flush_sync` per batch.
    #[cfg(test)]
    pub fn append(&mut self, records: &[Record]) -> io::Result<()> {
        self.append_buffered(records)?;
        self.flush_sync()
    }

    /// Append one entry to the BufWriter without flushing or syncing.
    /// Call `flush_sync()` after the batch to durably commit all buffered entries.
    pub fn append_buffered(&mut self, records: &[Record]) -> io::Result<()> {
        encode_entry(&mut self.writer, records)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()?;
        self.durable_len = self.writer.get_ref().metadata()?.len();
        Ok(())
    }

    /// Drop everything written since the last successful `flush_sync`, both
    /// still-buffered bytes and bytes that reached the file.
    pub fn discard_unflushed(&mut self) -> io::Result<()> {
        let file = OpenOptions::new().append(true).open(&self.path)?;
        let old = std::mem::replace(&mut self.writer, BufWriter::new(file));
        let (file, _unwritten) = old.into_parts();
        file.set_len(self.durable_len)?;
        file.sync_all()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write compacted entries to a temp file and fsync.
    pub fn write_compact_file(path: &Path, entries: &[Vec<Record>]) -> io::Result<()> {
        let tmp_path = path.with_extension("wal.tmp");
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        for entry in entries {
            encode_entry(&mut writer, entry)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }

    /// Atomic swap: rename temp file over the WAL and reopen.
    pub fn swap_compact_file(&mut self) -> io::Result<()> {
        let tmp_path = self.path.with_extension("wal.tmp");
        fs::rename(&tmp_path, &self.path)?;
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        self.durable_len = file.metadata()?.len();
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Replace the WAL with a minimal set of entries. Used by tests.
    #[cfg(test)]
    pub fn compact(&mut self, entries: &[Vec<Record>]) -> io::Result<()> {
        Self::write_compact_file(&self.path, entries)?;
        self.swap_compact_file()
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    /// Replay the WAL from disk, returning all valid entries in commit order.
    /// Truncated/corrupt trailing entries are silently discarded.
    pub fn replay(path: &Path) -> io::Result<Vec<Vec<Record>>> {
        Self::replay_prefix(path).map(|(entries, _)| entries)
    }

    /// Replay, also returning the byte length of the valid prefix.
    fn replay_prefix(path: &Path) -> io::Result<(Vec<Vec<Record>>, u64)> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok((Vec::new(), 0)),
            Err(e) => return Err(e),
        };
        let mut reader = BufReader::new(file);
        let mut entries = Vec::new();
        let mut valid_len = 0u64;

        loop {
            let mut len_buf = [0u8; 4];
            match reader.read_exact(&mut len_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
            let len = u32::from_le_bytes(len_buf) as usize;

            let mut payload = vec![0u8; len];
            match reader.read_exact(&mut payload) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }

            let mut crc_buf = [0u8; 4];
            match reader.read_exact(&mut crc_buf) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => break, // truncated
                Err(e) => return Err(e),
            }
            if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
                break;
            }

            match bincode::deserialize::<Vec<Record>>(&payload) {
                Ok(records) => entries.push(records),
                Err(_) => break, // corrupt payload
            }
            valid_len += 8 + len as u64;
        }

        Ok((entries, valid_len))
    }
}
