use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use uuid::Uuid;

use crate::error::FrameError;
use crate::frame::{max_data_bytes, Frame, MAX_FRAME_COUNT};

/// Slices an outbound message into MTU-sized frames.
///
/// If the payload does not fit a single frame, the whole message is
/// zlib-compressed once and re-sliced; every frame of the stream then
/// carries the compression flag.
pub struct FrameQueue {
    id: Uuid,
    source: String,
    bytes: Vec<u8>,
    compressed: bool,
    offset: usize,
    frame_number: u16,
}

impl FrameQueue {
    pub fn new(source: impl Into<String>, bytes: Vec<u8>) -> Self {
        FrameQueue {
            id: Uuid::new_v4(),
            source: source.into(),
            bytes,
            compressed: false,
            offset: 0,
            frame_number: 0,
        }
    }

    pub fn stream_id(&self) -> Uuid {
        self.id
    }

    /// Returns the next frame, or `None` once the message is fully sliced.
    pub fn next_frame(&mut self, mtu: usize) -> Result<Option<Frame>, FrameError> {
        if self.offset >= self.bytes.len() {
            return Ok(None);
        }
        if self.frame_number >= MAX_FRAME_COUNT {
            return Err(FrameError::MaxFrameCountExceeded);
        }

        let available = max_data_bytes(mtu, &self.source)?;
        if available == 0 {
            return Err(FrameError::MtuTooSmall);
        }

        // First frame decides whether the stream needs compression.
        if self.frame_number == 0 && available < self.bytes.len() && !self.compressed {
            self.bytes = compress(&self.bytes)?;
            self.compressed = true;
        }

        let end = (self.offset + available).min(self.bytes.len());
        let is_last = self.offset + available >= self.bytes.len();

        let frame = Frame {
            is_compressed: self.compressed,
            stream_id: self.id,
            frame_number: self.frame_number,
            is_last,
            source: self.source.clone(),
            data: self.bytes[self.offset..end].to_vec(),
        };
        self.frame_number += 1;
        self.offset = end;
        Ok(Some(frame))
    }
}

pub fn compress(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|err| FrameError::Compression(err.to_string()))?;
    encoder
        .finish()
        .map_err(|err| FrameError::Compression(err.to_string()))
}

pub fn decompress(data: &[u8]) -> Result<Vec<u8>, FrameError> {
    let mut decoder = ZlibDecoder::new(data);
    let mut out = Vec::new();
    decoder
        .read_to_end(&mut out)
        .map_err(|err| FrameError::Compression(err.to_string()))?;
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Deterministic incompressible bytes.
    fn noise(len: usize, mut seed: u64) -> Vec<u8> {
        (0..len)
            .map(|_| {
                seed = seed
                    .wrapping_mul(6364136223846793005)
                    .wrapping_add(1442695040888963407);
                (seed >> 33) as u8
            })
            .collect()
    }

    #[test]
    fn small_message_fits_one_uncompressed_frame() {
        let mut queue = FrameQueue::new("node", b"hello".to_vec());
        let frame = queue.next_frame(1024).unwrap().unwrap();
        assert!(!frame.is_compressed);
        assert!(frame.is_last);
        assert_eq!(frame.frame_number, 0);
        assert_eq!(frame.data, b"hello");
        assert!(queue.next_frame(1024).unwrap().is_none());
    }

    #[test]
    fn oversized_message_is_compressed_and_fragmented() {
        // Half noise, half zeroes: compresses to roughly half its size, so
        // the stream needs several frames but clearly fewer than the
        // uncompressed payload would.
        let mut payload = noise(25 * 1024, 7);
        payload.resize(50 * 1024, 0);
        let mut queue = FrameQueue::new("node", payload);

        let mut frames = Vec::new();
        while let Some(frame) = queue.next_frame(1024).unwrap() {
            frames.push(frame);
        }

        assert!(frames.len() > 1);
        assert!(frames.len() <= 50);
        assert!(frames.iter().all(|frame| frame.is_compressed));
        assert!(frames.iter().rev().skip(1).all(|frame| !frame.is_last));
        assert!(frames.last().unwrap().is_last);

        let numbers: Vec<u16> = frames.iter().map(|frame| frame.frame_number).collect();
        let expected: Vec<u16> = (0..frames.len() as u16).collect();
        assert_eq!(numbers, expected);
    }

    #[test]
    fn message_too_large_for_stream_errors() {
        // Incompressible payload far beyond MAX_FRAME_COUNT tiny frames.
        let payload = noise(256 * 1024, 99);
        let mut queue = FrameQueue::new("n", payload);
        let mut result = Ok(None);
        for _ in 0..=MAX_FRAME_COUNT {
            result = queue.next_frame(64);
            if result.is_err() {
                break;
            }
        }
        assert_eq!(result.unwrap_err(), FrameError::MaxFrameCountExceeded);
    }

    #[test]
    fn compress_round_trips() {
        let data = b"windows event payload".repeat(100);
        let compressed = compress(&data).unwrap();
        assert!(compressed.len() < data.len());
        assert_eq!(decompress(&compressed).unwrap(), data);
    }
}
