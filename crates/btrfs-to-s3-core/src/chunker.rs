use std::io::Read;

use sha2::{Digest, Sha256};

use crate::error::{B2sError, Result};

/// Upper bound on a single read against the source stream, so a chunk is
/// surfaced as a sequence of modest buffers rather than one allocation.
const MAX_READ_BYTES: u64 = 8 * 1024 * 1024;

/// Splits a byte stream into fixed-size logical chunks.
///
/// Each chunk is handed out as a [`ChunkBody`] sub-stream that hashes bytes
/// as the consumer drains it. A chunk body must be read to EOF before the
/// next one is requested; the borrow on the chunker enforces the ordering
/// and [`ChunkBody::finish`] enforces completeness.
pub struct Chunker<R> {
    stream: R,
    chunk_size: u64,
    next_index: u64,
}

impl<R: Read> Chunker<R> {
    pub fn new(stream: R, chunk_size: u64) -> Result<Self> {
        if chunk_size == 0 {
            return Err(B2sError::Other("chunk size must be > 0".into()));
        }
        Ok(Self {
            stream,
            chunk_size,
            next_index: 0,
        })
    }

    /// Next chunk body, or `None` at stream EOF.
    ///
    /// Probes a single byte first so a stream ending exactly on a chunk
    /// boundary produces no empty trailing chunk.
    pub fn next_chunk(&mut self) -> Result<Option<ChunkBody<'_, R>>> {
        let mut probe = [0u8; 1];
        loop {
            match self.stream.read(&mut probe) {
                Ok(0) => return Ok(None),
                Ok(_) => break,
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        let index = self.next_index;
        self.next_index += 1;
        Ok(Some(ChunkBody {
            stream: &mut self.stream,
            pending: Some(probe[0]),
            remaining: self.chunk_size - 1,
            hasher: Sha256::new(),
            size: 0,
            index,
            done: false,
        }))
    }
}

/// One chunk of the source stream, exposed as a bounded `Read`.
pub struct ChunkBody<'a, R> {
    stream: &'a mut R,
    pending: Option<u8>,
    remaining: u64,
    hasher: Sha256,
    size: u64,
    index: u64,
    done: bool,
}

impl<R: Read> ChunkBody<'_, R> {
    pub fn index(&self) -> u64 {
        self.index
    }

    /// Byte length and hex SHA-256 of the fully-drained chunk.
    pub fn finish(self) -> Result<(u64, String)> {
        if !self.done {
            return Err(B2sError::Other(format!(
                "chunk {} not fully consumed",
                self.index
            )));
        }
        Ok((self.size, hex::encode(self.hasher.finalize())))
    }
}

impl<R: Read> Read for ChunkBody<'_, R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if self.done {
            return Ok(0);
        }
        if let Some(byte) = self.pending.take() {
            buf[0] = byte;
            self.hasher.update(&buf[..1]);
            self.size += 1;
            if self.remaining == 0 {
                self.done = true;
            }
            return Ok(1);
        }
        if self.remaining == 0 {
            self.done = true;
            return Ok(0);
        }
        let want = (buf.len() as u64).min(self.remaining).min(MAX_READ_BYTES) as usize;
        let n = self.stream.read(&mut buf[..want])?;
        if n == 0 {
            self.done = true;
            return Ok(0);
        }
        self.remaining -= n as u64;
        self.hasher.update(&buf[..n]);
        self.size += n as u64;
        if self.remaining == 0 {
            self.done = true;
        }
        Ok(n)
    }
}
