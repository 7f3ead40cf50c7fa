//! Fixed-size file chunking and offset-addressed reassembly.
//!
//! A file of `n` bytes chunked at size `s` yields `ceil(n / s)` chunks;
//! chunk `i` covers byte offset `i * s` and every chunk but the last is
//! exactly `s` bytes. Reassembly writes chunks back by offset into a file
//! pre-sized to the full length, so arrival order never matters.

use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

/// One chunk of a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Zero-based chunk index
    pub index: u32,
    /// Byte offset in the source file (`index * chunk_size`)
    pub offset: u64,
    /// Payload length; only the final chunk may be shorter than the chunk
    /// size
    pub size: u32,
    /// Chunk bytes
    pub data: Vec<u8>,
}

/// Size of a file in bytes.
///
/// # Errors
///
/// Returns an error if the file cannot be stat'ed.
pub fn file_size<P: AsRef<Path>>(path: P) -> io::Result<u64> {
    Ok(std::fs::metadata(path)?.len())
}

/// Number of chunks a file splits into at the given chunk size.
///
/// # Errors
///
/// Returns an error if the file cannot be stat'ed.
pub fn num_chunks<P: AsRef<Path>>(path: P, chunk_size: usize) -> io::Result<u32> {
    let size = file_size(path)?;
    Ok(size.div_ceil(chunk_size as u64) as u32)
}

/// Split a file into its full ordered chunk sequence.
///
/// The whole file is materialized in memory; prefer [`stream`] or
/// [`read_chunk_at`] for large inputs.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or a read fails.
pub fn split<P: AsRef<Path>>(path: P, chunk_size: usize) -> io::Result<Vec<Chunk>> {
    let mut chunks = Vec::new();
    stream(path, chunk_size, |chunk| {
        chunks.push(chunk.clone());
        true
    })?;
    Ok(chunks)
}

/// Stream a file's chunks through a callback, one at a time.
///
/// The callback returning `false` halts iteration early. Chunks are not
/// retained; each buffer is dropped after its callback returns.
///
/// # Errors
///
/// Returns an error if the file cannot be opened or a read fails.
pub fn stream<P, F>(path: P, chunk_size: usize, mut on_chunk: F) -> io::Result<()>
where
    P: AsRef<Path>,
    F: FnMut(&Chunk) -> bool,
{
    let total = file_size(&path)?;
    let mut file = File::open(&path)?;

    let mut index = 0u32;
    let mut offset = 0u64;

    while offset < total {
        let remaining = total - offset;
        let this_size = remaining.min(chunk_size as u64) as usize;

        let mut data = vec![0u8; this_size];
        file.read_exact(&mut data)?;

        let chunk = Chunk {
            index,
            offset,
            size: this_size as u32,
            data,
        };

        if !on_chunk(&chunk) {
            return Ok(());
        }

        offset += this_size as u64;
        index += 1;
    }

    Ok(())
}

/// Read a single chunk by index, on demand.
///
/// # Errors
///
/// Returns an error if the index is out of bounds or file I/O fails.
pub fn read_chunk_at<P: AsRef<Path>>(
    path: P,
    chunk_size: usize,
    index: u32,
) -> io::Result<Chunk> {
    let total = file_size(&path)?;
    let offset = u64::from(index) * chunk_size as u64;

    if total == 0 || offset >= total {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("chunk index {index} out of bounds"),
        ));
    }

    let this_size = (total - offset).min(chunk_size as u64) as usize;

    let mut file = File::open(&path)?;
    file.seek(SeekFrom::Start(offset))?;

    let mut data = vec![0u8; this_size];
    file.read_exact(&mut data)?;

    Ok(Chunk {
        index,
        offset,
        size: this_size as u32,
        data,
    })
}

/// Serialize a chunk to disk as `[index: u32][offset: u64][size: u32][bytes]`
/// (little-endian).
///
/// # Errors
///
/// Returns an error on any write failure.
pub fn write_chunk<P: AsRef<Path>>(path: P, chunk: &Chunk) -> io::Result<()> {
    let mut file = File::create(path)?;

    file.write_all(&chunk.index.to_le_bytes())?;
    file.write_all(&chunk.offset.to_le_bytes())?;
    file.write_all(&chunk.size.to_le_bytes())?;
    file.write_all(&chunk.data)?;

    file.flush()
}

/// Read a chunk previously serialized with [`write_chunk`].
///
/// # Errors
///
/// Returns an error if the header or payload is truncated or unreadable.
pub fn read_chunk<P: AsRef<Path>>(path: P) -> io::Result<Chunk> {
    let mut file = File::open(path)?;

    let mut u32_buf = [0u8; 4];
    let mut u64_buf = [0u8; 8];

    file.read_exact(&mut u32_buf)?;
    let index = u32::from_le_bytes(u32_buf);
    file.read_exact(&mut u64_buf)?;
    let offset = u64::from_le_bytes(u64_buf);
    file.read_exact(&mut u32_buf)?;
    let size = u32::from_le_bytes(u32_buf);

    let mut data = vec![0u8; size as usize];
    file.read_exact(&mut data)?;

    Ok(Chunk {
        index,
        offset,
        size,
        data,
    })
}

/// Receive-side reassembler: writes chunks by offset into an output file
/// pre-sized to the transfer length.
pub struct FileReassembler {
    file: File,
    total_size: u64,
    received: HashSet<u32>,
}

impl FileReassembler {
    /// Create a reassembler, pre-allocating the output file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be created or pre-sized.
    pub fn new<P: AsRef<Path>>(path: P, total_size: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        file.set_len(total_size)?;

        Ok(Self {
            file,
            total_size,
            received: HashSet::new(),
        })
    }

    /// Write one chunk at its byte offset and record it as received.
    ///
    /// # Errors
    ///
    /// Returns an error if the chunk would overrun the file or a write
    /// fails.
    pub fn write_chunk(&mut self, index: u32, offset: u64, data: &[u8]) -> io::Result<()> {
        let in_bounds = offset
            .checked_add(data.len() as u64)
            .is_some_and(|end| end <= self.total_size);
        if !in_bounds {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("chunk {index} overruns file of {} bytes", self.total_size),
            ));
        }

        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        self.received.insert(index);

        Ok(())
    }

    /// Whether a chunk index has already been written.
    #[must_use]
    pub fn has_chunk(&self, index: u32) -> bool {
        self.received.contains(&index)
    }

    /// Number of distinct chunks written so far.
    #[must_use]
    pub fn received_count(&self) -> u32 {
        self.received.len() as u32
    }

    /// Whether every chunk of a `total_chunks`-chunk transfer has arrived.
    #[must_use]
    pub fn is_complete(&self, total_chunks: u32) -> bool {
        self.received_count() == total_chunks
    }

    /// Flush the assembled bytes to disk.
    ///
    /// # Errors
    ///
    /// Returns an error if syncing fails.
    pub fn sync(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}
