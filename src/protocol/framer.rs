//! Frame accumulator for partial reads
//!
//! A byte stream does not preserve message boundaries: one read may hold half
//! a frame, or several frames back to back. [`FrameAccumulator`] buffers
//! incoming bytes and slices off complete frames using the length field at
//! offset 12 of the header.

use bytes::{Bytes, BytesMut};

use super::{CodecError, DEFAULT_MAX_FRAME_LENGTH, HEADER_SIZE, LENGTH_FIELD_OFFSET};

/// Per-connection accumulation buffer yielding complete frames
#[derive(Debug)]
pub struct FrameAccumulator {
    buffer: BytesMut,
    max_frame_length: usize,
}

impl FrameAccumulator {
    /// Create an accumulator with the default 1024-byte frame limit
    pub fn new() -> Self {
        Self::with_max_frame_length(DEFAULT_MAX_FRAME_LENGTH)
    }

    pub fn with_max_frame_length(max_frame_length: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(max_frame_length.min(64 * 1024)),
            max_frame_length,
        }
    }

    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Append a chunk received from the transport
    pub fn extend(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    /// Direct access for transports that read straight into the buffer
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Slice the next complete frame off the buffer.
    ///
    /// Returns `Ok(None)` when more bytes are needed. A declared length that
    /// would exceed the maximum frame length is fatal for the stream.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, CodecError> {
        if self.buffer.len() < HEADER_SIZE {
            return Ok(None);
        }

        let field = &self.buffer[LENGTH_FIELD_OFFSET..LENGTH_FIELD_OFFSET + 4];
        let payload_length = u32::from_be_bytes([field[0], field[1], field[2], field[3]]) as usize;
        let frame_length = HEADER_SIZE.saturating_add(payload_length);

        if frame_length > self.max_frame_length {
            return Err(CodecError::FrameTooLarge {
                size: frame_length,
                max: self.max_frame_length,
            });
        }

        if self.buffer.len() < frame_length {
            self.buffer.reserve(frame_length - self.buffer.len());
            return Ok(None);
        }

        Ok(Some(self.buffer.split_to(frame_length).freeze()))
    }

    /// Append a chunk and drain every frame it completes
    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, CodecError> {
        self.extend(chunk);

        let mut frames = Vec::new();
        while let Some(frame) = self.next_frame()? {
            frames.push(frame);
        }
        Ok(frames)
    }

    /// Number of buffered bytes not yet delivered as a frame
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Discard any partial frame
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

impl Default for FrameAccumulator {
    fn default() -> Self {
        Self::new()
    }
}
