/*
A growable byte buffer used as both the outbound send queue and the inbound receive
accumulator of a connection. Bytes are appended at the end and popped from the front.
Storage grows in fixed size chunks and is released as soon as the stream drains.
*/

use thiserror::Error;

use crate::data_types::ByteCount;

pub const CHUNK_SIZE: ByteCount = 1024;

#[derive(Debug, PartialEq, Error)]
pub enum StreamError {
    #[error("unable to allocate {requested} bytes")]
    OutOfMemory { requested: ByteCount },

    #[error("{len} bytes at offset {offset} is outside the {size} live bytes")]
    OutOfRange { offset: ByteCount, len: ByteCount, size: ByteCount },

    #[error("consume requires at least one byte")]
    EmptyConsume,

    #[error("cannot consume {requested} bytes, only {available} available")]
    ConsumeTooLarge { requested: ByteCount, available: ByteCount },
}

pub type StreamResult<T> = Result<T, StreamError>;

/// Invariant: `read_position <= buffer.len() <= allocated`. The write position is
/// `buffer.len()`; bytes before the read position are dead and reclaimed when the
/// stream drains.
#[derive(Debug, Default)]
pub struct ByteStream {
    buffer: Vec<u8>,
    allocated: ByteCount,
    read_position: ByteCount,
}

impl ByteStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live bytes, i.e. the ones not yet consumed
    pub fn size(self: &Self) -> ByteCount {
        self.buffer.len() - self.read_position
    }

    pub fn is_empty(self: &Self) -> bool {
        self.size() == 0
    }

    /// Bytes currently reserved for this stream, including dead and unused bytes
    pub fn capacity(self: &Self) -> ByteCount {
        self.allocated
    }

    /// The live bytes. Valid until the next mutation of the stream.
    pub fn view(self: &Self) -> &[u8] {
        &self.buffer[self.read_position..]
    }

    /// Copies `bytes` to the end of the stream. On allocation failure the stream is unchanged.
    pub fn append(self: &mut Self, bytes: &[u8]) -> StreamResult<()> {
        if bytes.is_empty() {
            return Ok(());
        }

        let required = self.buffer.len() + bytes.len();
        if required > self.allocated {
            let growth = ((bytes.len() / CHUNK_SIZE) + 1) * CHUNK_SIZE;
            let allocated = self.allocated + growth;
            if self.buffer.try_reserve_exact(allocated - self.buffer.len()).is_err() {
                return Err(StreamError::OutOfMemory { requested: allocated });
            }
            self.allocated = allocated;
        }

        self.buffer.extend_from_slice(bytes);
        Ok(())
    }

    pub fn append_u32(self: &mut Self, value: u32) -> StreamResult<()> {
        self.append(&value.to_be_bytes())
    }

    pub fn append_u16(self: &mut Self, value: u16) -> StreamResult<()> {
        self.append(&value.to_be_bytes())
    }

    pub fn append_u8(self: &mut Self, value: u8) -> StreamResult<()> {
        self.append(&[value])
    }

    /// Appends the UTF-8 bytes of `value`, followed by a NUL byte when `terminate` is true
    pub fn append_str(self: &mut Self, value: &str, terminate: bool) -> StreamResult<()> {
        if terminate {
            let mut bytes = Vec::with_capacity(value.len() + 1);
            bytes.extend_from_slice(value.as_bytes());
            bytes.push(0);
            self.append(&bytes)
        } else {
            self.append(value.as_bytes())
        }
    }

    /// Pops `count` bytes from the front of the stream. When nothing live remains the
    /// stream is reset and its storage released.
    pub fn consume(self: &mut Self, count: ByteCount) -> StreamResult<()> {
        if count == 0 {
            return Err(StreamError::EmptyConsume);
        }
        let available = self.size();
        if count > available {
            return Err(StreamError::ConsumeTooLarge { requested: count, available });
        }

        self.read_position += count;
        if self.read_position >= self.buffer.len() {
            self.reset();
        }
        Ok(())
    }

    /// Discards all content and releases the backing storage
    pub fn reset(self: &mut Self) {
        self.buffer = Vec::new();
        self.allocated = 0;
        self.read_position = 0;
    }

    /// Overwrites live bytes starting `offset` bytes past the read position. Never grows
    /// the stream, so the whole range must already have been written.
    pub fn insert_at(self: &mut Self, bytes: &[u8], offset: ByteCount) -> StreamResult<()> {
        let size = self.size();
        let end = offset.checked_add(bytes.len());
        match end {
            Some(end) if end <= size => {
                let start = self.read_position + offset;
                self.buffer[start..start + bytes.len()].copy_from_slice(bytes);
                Ok(())
            }
            _ => Err(StreamError::OutOfRange { offset, len: bytes.len(), size }),
        }
    }

    /// Patches a big-endian u16 in place, typically a length prefix written as a placeholder
    pub fn insert_u16_at(self: &mut Self, value: u16, offset: ByteCount) -> StreamResult<()> {
        self.insert_at(&value.to_be_bytes(), offset)
    }

    pub fn insert_u32_at(self: &mut Self, value: u32, offset: ByteCount) -> StreamResult<()> {
        self.insert_at(&value.to_be_bytes(), offset)
    }

    /// Decodes a big-endian u16 at `offset` past the read position
    pub fn u16_at(self: &Self, offset: ByteCount) -> Option<u16> {
        let bytes = self.view().get(offset..offset.checked_add(2)?)?;
        Some(u16::from_be_bytes(bytes.try_into().ok()?))
    }

    pub fn u32_at(self: &Self, offset: ByteCount) -> Option<u32> {
        let bytes = self.view().get(offset..offset.checked_add(4)?)?;
        Some(u32::from_be_bytes(bytes.try_into().ok()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn should_grow_in_whole_chunks() {
        let mut stream = ByteStream::new();
        assert_eq!(stream.capacity(), 0);

        stream.append(&[1u8; 10]).unwrap();
        assert_eq!(stream.capacity(), CHUNK_SIZE);

        stream.append(&[2u8; CHUNK_SIZE]).unwrap();
        assert_eq!(stream.capacity(), CHUNK_SIZE * 3);
        assert_eq!(stream.size(), CHUNK_SIZE + 10);
    }

    #[test]
    fn should_not_grow_when_space_remains() {
        let mut stream = ByteStream::new();
        stream.append(&[0u8; 100]).unwrap();
        stream.append(&[0u8; 900]).unwrap();
        assert_eq!(stream.capacity(), CHUNK_SIZE);
    }

    #[test]
    fn should_ignore_empty_append() {
        let mut stream = ByteStream::new();
        stream.append(&[]).unwrap();
        assert_eq!(stream.capacity(), 0);
    }
}
