//! Append-only segment files backing the write-ahead log. A segment holds a
//! contiguous run of length-prefixed raft entries and records its index range
//! in a fixed-size header so restarts can rebuild entry positions.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

const HEADER_SIZE: u64 = 16;
const LEN_PREFIX_SIZE: u64 = 8;

#[derive(Debug)]
pub struct Segment {
    file: File,
    first_index: u64,
    next_index: u64,
    positions: BTreeMap<u64, u64>,
}

impl Segment {
    /// Opens or creates the segment at `path` whose first entry carries
    /// `first_index`.
    pub fn open<P: AsRef<Path>>(path: P, first_index: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;

        let mut segment = Segment {
            file,
            first_index,
            next_index: first_index,
            positions: BTreeMap::new(),
        };

        if segment.file.metadata()?.len() == 0 {
            segment.write_header()?;
        } else {
            segment.read_header()?;
            segment.rebuild_positions()?;
        }

        Ok(segment)
    }

    pub fn first_index(&self) -> u64 {
        self.first_index
    }

    /// Index one past the last stored entry.
    pub fn next_index(&self) -> u64 {
        self.next_index
    }

    pub fn len(&self) -> u64 {
        self.next_index - self.first_index
    }

    pub fn is_empty(&self) -> bool {
        self.next_index == self.first_index
    }

    /// Appends entries at consecutive indexes starting at `next_index`.
    pub fn append(&mut self, entries: &[Vec<u8>]) -> io::Result<()> {
        self.file.seek(SeekFrom::End(0))?;
        let mut position = self.file.metadata()?.len();

        for entry in entries {
            self.file.write_all(&(entry.len() as u64).to_le_bytes())?;
            self.file.write_all(entry)?;
            self.positions.insert(self.next_index, position);
            position += LEN_PREFIX_SIZE + entry.len() as u64;
            self.next_index += 1;
        }

        self.write_header()?;
        self.file.sync_data()?;
        Ok(())
    }

    pub fn read(&mut self, index: u64) -> io::Result<Vec<u8>> {
        let position = *self.positions.get(&index).ok_or_else(|| {
            io::Error::new(io::ErrorKind::InvalidInput, "entry index out of range")
        })?;

        self.file.seek(SeekFrom::Start(position))?;
        let mut len_bytes = [0u8; 8];
        self.file.read_exact(&mut len_bytes)?;
        let len = u64::from_le_bytes(len_bytes);

        let mut entry = vec![0u8; len as usize];
        self.file.read_exact(&mut entry)?;
        Ok(entry)
    }

    /// Drops `index` and everything after it; raft overwrites a conflicting
    /// log suffix by appending at an already-used index.
    pub fn truncate_from(&mut self, index: u64) -> io::Result<()> {
        if index >= self.next_index {
            return Ok(());
        }
        let cut = if index <= self.first_index {
            HEADER_SIZE
        } else {
            *self
                .positions
                .get(&index)
                .expect("positions cover the stored index range")
        };

        self.file.set_len(cut)?;
        self.next_index = index.max(self.first_index);
        self.positions.split_off(&self.next_index);
        self.write_header()?;
        Ok(())
    }

    fn write_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        self.file.write_all(&self.first_index.to_le_bytes())?;
        self.file.write_all(&self.next_index.to_le_bytes())?;
        Ok(())
    }

    fn read_header(&mut self) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(0))?;
        let mut header = [0u8; HEADER_SIZE as usize];
        self.file.read_exact(&mut header)?;
        self.first_index = u64::from_le_bytes(header[..8].try_into().unwrap());
        self.next_index = u64::from_le_bytes(header[8..].try_into().unwrap());
        Ok(())
    }

    fn rebuild_positions(&mut self) -> io::Result<()> {
        self.positions.clear();
        let mut position = HEADER_SIZE;
        let file_len = self.file.metadata()?.len();
        let mut index = self.first_index;

        while position + LEN_PREFIX_SIZE <= file_len && index < self.next_index {
            self.file.seek(SeekFrom::Start(position))?;
            let mut len_bytes = [0u8; 8];
            self.file.read_exact(&mut len_bytes)?;
            let len = u64::from_le_bytes(len_bytes);
            if position + LEN_PREFIX_SIZE + len > file_len {
                break;
            }
            self.positions.insert(index, position);
            position += LEN_PREFIX_SIZE + len;
            index += 1;
        }

        // drop the torn tail of an interrupted append
        if position < file_len {
            self.file.set_len(position)?;
        }
        if index != self.next_index {
            self.next_index = index;
            self.write_header()?;
        }

        Ok(())
    }
}
