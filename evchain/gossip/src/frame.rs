use uuid::Uuid;

use crate::error::FrameError;

/// Hard cap on frames per stream; bounds decoder memory under loss.
pub const MAX_FRAME_COUNT: u16 = 64;

/// Fixed header bytes around the variable-length source name and data:
/// compressed flag, stream id, frame number, last flag, source length,
/// data length and the trailing CRC.
const FIXED_OVERHEAD: usize = 1 + 16 + 2 + 1 + 2 + 4 + 4;

/// One fragment of a gossip stream.
///
/// Wire layout, all integers little-endian:
/// `is_compressed u8 | stream_id 16B | frame_number u16 | is_last u8 |
/// source_len u16 | source | data_len u32 | data | crc32 u32`.
/// The CRC (IEEE) covers every preceding byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub is_compressed: bool,
    pub stream_id: Uuid,
    pub frame_number: u16,
    pub is_last: bool,
    pub source: String,
    pub data: Vec<u8>,
}

impl Frame {
    pub fn encode(&self) -> Vec<u8> {
        let source = self.source.as_bytes();
        let mut buf =
            Vec::with_capacity(FIXED_OVERHEAD + source.len() + self.data.len());

        buf.push(self.is_compressed as u8);
        buf.extend_from_slice(self.stream_id.as_bytes());
        buf.extend_from_slice(&self.frame_number.to_le_bytes());
        buf.push(self.is_last as u8);
        buf.extend_from_slice(&(source.len() as u16).to_le_bytes());
        buf.extend_from_slice(source);
        buf.extend_from_slice(&(self.data.len() as u32).to_le_bytes());
        buf.extend_from_slice(&self.data);

        let checksum = crc32fast::hash(&buf);
        buf.extend_from_slice(&checksum.to_le_bytes());
        buf
    }

    pub fn decode(bytes: &[u8]) -> Result<Frame, FrameError> {
        let mut cursor = 0usize;

        let is_compressed = read_u8(bytes, &mut cursor)? == 1;
        let stream_id = Uuid::from_bytes(
            read_array::<16>(bytes, &mut cursor)?,
        );
        let frame_number = u16::from_le_bytes(read_array::<2>(bytes, &mut cursor)?);
        let is_last = read_u8(bytes, &mut cursor)? == 1;

        let source_len = u16::from_le_bytes(read_array::<2>(bytes, &mut cursor)?) as usize;
        let source = read_slice(bytes, &mut cursor, source_len)?;
        let source = std::str::from_utf8(source)
            .map_err(|_| FrameError::SourceNotUtf8)?
            .to_string();

        let data_len = u32::from_le_bytes(read_array::<4>(bytes, &mut cursor)?) as usize;
        let data = read_slice(bytes, &mut cursor, data_len)?.to_vec();

        let body_end = cursor;
        let received_checksum = u32::from_le_bytes(read_array::<4>(bytes, &mut cursor)?);
        if crc32fast::hash(&bytes[..body_end]) != received_checksum {
            return Err(FrameError::ChecksumMismatch);
        }

        Ok(Frame {
            is_compressed,
            stream_id,
            frame_number,
            is_last,
            source,
            data,
        })
    }
}

/// Payload bytes that fit one frame at the given MTU for a source name.
pub fn max_data_bytes(mtu: usize, source: &str) -> Result<usize, FrameError> {
    let header = FIXED_OVERHEAD + source.len();
    if mtu <= header {
        return Err(FrameError::MtuTooSmall);
    }
    Ok(mtu - header)
}

fn read_u8(bytes: &[u8], cursor: &mut usize) -> Result<u8, FrameError> {
    let value = *bytes.get(*cursor).ok_or(FrameError::UnexpectedEnd)?;
    *cursor += 1;
    Ok(value)
}

fn read_array<const N: usize>(bytes: &[u8], cursor: &mut usize) -> Result<[u8; N], FrameError> {
    let slice = read_slice(bytes, cursor, N)?;
    Ok(slice.try_into().expect("slice length checked"))
}

fn read_slice<'a>(
    bytes: &'a [u8],
    cursor: &mut usize,
    len: usize,
) -> Result<&'a [u8], FrameError> {
    let end = cursor.checked_add(len).ok_or(FrameError::UnexpectedEnd)?;
    if end > bytes.len() {
        return Err(FrameError::UnexpectedEnd);
    }
    let slice = &bytes[*cursor..end];
    *cursor = end;
    Ok(slice)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_frame() -> Frame {
        Frame {
            is_compressed: true,
            stream_id: Uuid::new_v4(),
            frame_number: 3,
            is_last: false,
            source: "replica-1".to_string(),
            data: b"some payload".to_vec(),
        }
    }

    #[test]
    fn encode_decode_round_trip() {
        let frame = sample_frame();
        let decoded = Frame::decode(&frame.encode()).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn corrupted_bytes_fail_the_checksum() {
        let mut encoded = sample_frame().encode();
        let mid = encoded.len() / 2;
        encoded[mid] ^= 0xff;
        assert_eq!(Frame::decode(&encoded), Err(FrameError::ChecksumMismatch));
    }

    #[test]
    fn truncated_bytes_are_rejected() {
        let encoded = sample_frame().encode();
        assert_eq!(
            Frame::decode(&encoded[..encoded.len() - 5]),
            Err(FrameError::UnexpectedEnd)
        );
        assert_eq!(Frame::decode(&[]), Err(FrameError::UnexpectedEnd));
    }

    #[test]
    fn mtu_accounts_for_source_length() {
        let header = FIXED_OVERHEAD + "node".len();
        assert_eq!(max_data_bytes(header, "node"), Err(FrameError::MtuTooSmall));
        assert_eq!(max_data_bytes(header + 1, "node"), Ok(1));
    }
}
