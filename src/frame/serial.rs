use super::*;

const OFFSET_SESSION_ID: usize = 0;
const OFFSET_TYPE: usize = 4;
const OFFSET_SCRAMBLE: usize = 6;
const OFFSET_FIELD: usize = 8;
const OFFSET_CHECKSUM: usize = 12;

#[derive(Debug, Eq, PartialEq, thiserror::Error)]
pub enum DecodeError {
    /// The frame cannot hold a header.
    #[error("frame of {len} bytes is shorter than the header")]
    TooShort { len: usize },
    /// The stored checksum does not match the contents.
    #[error("checksum mismatch: stored {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch { expected: u32, actual: u32 },
    /// The type field holds no known packet type.
    #[error("unknown packet type {0}")]
    UnknownType(u16),
}

fn be_u16(bytes: &[u8], offset: usize) -> u16 {
    u16::from_be_bytes([bytes[offset], bytes[offset + 1]])
}

fn be_u32(bytes: &[u8], offset: usize) -> u32 {
    u32::from_be_bytes([
        bytes[offset],
        bytes[offset + 1],
        bytes[offset + 2],
        bytes[offset + 3],
    ])
}

fn word_sum(bytes: &[u8]) -> u32 {
    let mut sum: u32 = 0;

    let mut words = bytes.chunks_exact(2);
    for word in &mut words {
        sum = sum.wrapping_add(u16::from_be_bytes([word[0], word[1]]) as u32);
    }

    // Odd trailing byte
    if let [last] = words.remainder() {
        sum = sum.wrapping_add(*last as u32);
    }

    sum
}

/// Sums all 16-bit big-endian words (plus any odd trailing byte) and complements the result.
pub fn checksum(bytes: &[u8]) -> u32 {
    !word_sum(bytes)
}

/// Checksum of a complete frame computed as if its checksum field were zero.
fn frame_checksum(frame_bytes: &[u8]) -> u32 {
    debug_assert!(verify_minimum_size(frame_bytes));

    let stored_words = (be_u16(frame_bytes, OFFSET_CHECKSUM) as u32)
        .wrapping_add(be_u16(frame_bytes, OFFSET_CHECKSUM + 2) as u32);

    !word_sum(frame_bytes).wrapping_sub(stored_words)
}

pub fn verify_minimum_size(frame_bytes: &[u8]) -> bool {
    frame_bytes.len() >= HEADER_SIZE
}

pub fn verify_checksum(frame_bytes: &[u8]) -> Result<(), DecodeError> {
    if !verify_minimum_size(frame_bytes) {
        return Err(DecodeError::TooShort {
            len: frame_bytes.len(),
        });
    }

    let expected = be_u32(frame_bytes, OFFSET_CHECKSUM);
    let actual = frame_checksum(frame_bytes);

    if expected != actual {
        return Err(DecodeError::ChecksumMismatch { expected, actual });
    }

    Ok(())
}

/// Serializes a header and payload into a contiguous frame with its checksum filled in.
pub fn write(header: &Header, payload: &[u8]) -> Box<[u8]> {
    let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());

    buf.extend_from_slice(&header.session_id.to_be_bytes());
    buf.extend_from_slice(&header.packet_type.to_u16().to_be_bytes());
    buf.extend_from_slice(&header.scramble.to_be_bytes());
    buf.extend_from_slice(&header.field.to_be_bytes());
    buf.extend_from_slice(&[0; 4]);
    buf.extend_from_slice(payload);

    let sum = checksum(&buf);
    buf[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4].copy_from_slice(&sum.to_be_bytes());

    buf.into_boxed_slice()
}

pub fn write_pdu(pdu: &Pdu) -> Box<[u8]> {
    write(&pdu.header, &pdu.payload)
}

/// Validates and decodes a received frame.
pub fn read(frame_bytes: &[u8]) -> Result<Pdu, DecodeError> {
    verify_checksum(frame_bytes)?;

    let type_raw = be_u16(frame_bytes, OFFSET_TYPE);
    let packet_type = PacketType::from_u16(type_raw).ok_or(DecodeError::UnknownType(type_raw))?;

    let header = Header {
        session_id: be_u32(frame_bytes, OFFSET_SESSION_ID),
        packet_type,
        scramble: be_u16(frame_bytes, OFFSET_SCRAMBLE),
        field: be_u32(frame_bytes, OFFSET_FIELD),
    };

    Ok(Pdu {
        header,
        payload: frame_bytes[HEADER_SIZE..].into(),
    })
}
