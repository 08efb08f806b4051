use uuid::Uuid;

use crate::error::FrameError;
use crate::frame::{Frame, MAX_FRAME_COUNT};
use crate::queue::decompress;

/// Reassembles one stream's frames, tolerating duplicates and arbitrary
/// arrival order. The stream is complete once an `is_last` frame has been
/// seen and every slot up to it is filled.
pub struct StreamDecoder {
    id: Uuid,
    received: u16,
    terminated: bool,
    is_compressed: bool,
    frames: Vec<Option<Frame>>,
}

impl StreamDecoder {
    pub fn new(id: Uuid) -> Self {
        StreamDecoder {
            id,
            received: 0,
            terminated: false,
            is_compressed: false,
            frames: Vec::new(),
        }
    }

    pub fn read_bytes(&mut self, bytes: &[u8]) -> Result<(), FrameError> {
        self.read_frame(Frame::decode(bytes)?)
    }

    pub fn read_frame(&mut self, frame: Frame) -> Result<(), FrameError> {
        if self.received > MAX_FRAME_COUNT || frame.frame_number > MAX_FRAME_COUNT {
            return Err(FrameError::MaxFrameCountExceeded);
        }
        if frame.stream_id != self.id {
            return Err(FrameError::StreamIdMismatch {
                expected: self.id,
                actual: frame.stream_id,
            });
        }

        // The first frame fixes the stream's compression flag; every later
        // frame must agree.
        if self.received == 0 {
            self.is_compressed = frame.is_compressed;
        } else if self.is_compressed != frame.is_compressed {
            return Err(FrameError::MixedCompression);
        }

        let slot = frame.frame_number as usize;
        if self.frames.get(slot).is_some_and(Option::is_some) {
            // Duplicate.
            return Ok(());
        }
        if slot >= self.frames.len() {
            self.frames.resize_with(slot + 1, || None);
        }

        if frame.is_last {
            self.terminated = true;
        }
        self.frames[slot] = Some(frame);
        self.received += 1;
        Ok(())
    }

    pub fn has_frame(&self, frame_number: u16) -> bool {
        self.frames
            .get(frame_number as usize)
            .is_some_and(Option::is_some)
    }

    pub fn received_all(&self) -> bool {
        self.terminated && self.received as usize == self.frames.len()
    }

    pub fn source(&self) -> Result<&str, FrameError> {
        self.frames
            .first()
            .and_then(Option::as_ref)
            .map(|frame| frame.source.as_str())
            .ok_or(FrameError::NoFrames)
    }

    pub fn decode(&self) -> Result<Vec<u8>, FrameError> {
        if !self.terminated {
            return Err(FrameError::NotTerminated);
        }

        let mut bytes = Vec::new();
        for frame in self.frames.iter().flatten() {
            bytes.extend_from_slice(&frame.data);
        }

        if self.is_compressed {
            decompress(&bytes)
        } else {
            Ok(bytes)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::FrameQueue;

    /// Deterministic incompressible bytes, so fragment counts are stable.
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

    fn frames_for(payload: &[u8], mtu: usize) -> Vec<Frame> {
        let mut queue = FrameQueue::new("node", payload.to_vec());
        let mut frames = Vec::new();
        while let Some(frame) = queue.next_frame(mtu).unwrap() {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn reassembly_is_order_independent() {
        let payload = noise(20 * 1024, 3);
        let frames = frames_for(&payload, 1024);
        assert!(frames.len() > 2);
        let id = frames[0].stream_id;

        // In order.
        let mut decoder = StreamDecoder::new(id);
        for frame in &frames {
            decoder.read_frame(frame.clone()).unwrap();
        }
        assert!(decoder.received_all());
        assert_eq!(decoder.decode().unwrap(), payload);

        // Reversed, with every frame duplicated.
        let mut decoder = StreamDecoder::new(id);
        for frame in frames.iter().rev() {
            decoder.read_frame(frame.clone()).unwrap();
            decoder.read_frame(frame.clone()).unwrap();
        }
        assert!(decoder.received_all());
        assert_eq!(decoder.decode().unwrap(), payload);

        // Odd slots first, then even.
        let mut decoder = StreamDecoder::new(id);
        for frame in frames.iter().filter(|frame| frame.frame_number % 2 == 1) {
            decoder.read_frame(frame.clone()).unwrap();
        }
        assert!(!decoder.received_all());
        for frame in frames.iter().filter(|frame| frame.frame_number % 2 == 0) {
            decoder.read_frame(frame.clone()).unwrap();
        }
        assert!(decoder.received_all());
        assert_eq!(decoder.decode().unwrap(), payload);
    }

    #[test]
    fn incomplete_stream_refuses_to_decode() {
        let frames = frames_for(&noise(8 * 1024, 5), 1024);
        assert!(frames.len() > 1);
        let mut decoder = StreamDecoder::new(frames[0].stream_id);
        decoder.read_frame(frames[0].clone()).unwrap();
        assert!(!decoder.received_all());
        assert_eq!(decoder.decode(), Err(FrameError::NotTerminated));
    }

    #[test]
    fn mixed_compression_is_a_hard_error() {
        let frames = frames_for(&noise(8 * 1024, 6), 1024);
        let mut decoder = StreamDecoder::new(frames[0].stream_id);
        decoder.read_frame(frames[0].clone()).unwrap();

        let mut tampered = frames[1].clone();
        tampered.is_compressed = !tampered.is_compressed;
        assert_eq!(
            decoder.read_frame(tampered),
            Err(FrameError::MixedCompression)
        );
    }

    #[test]
    fn wrong_stream_id_is_rejected() {
        let frames = frames_for(b"hello", 1024);
        let mut decoder = StreamDecoder::new(Uuid::new_v4());
        assert!(matches!(
            decoder.read_frame(frames[0].clone()),
            Err(FrameError::StreamIdMismatch { .. })
        ));
    }
}
