//! PDU types shared by the codec and the protocol engines.

pub mod serial;

pub use serial::DecodeError;

/// Size of the fixed PDU header in bytes.
pub const HEADER_SIZE: usize = 16;

/// Maximum number of sequence numbers carried by a single ACK or REPEAT PDU.
pub const ENTRIES_PER_PDU_MAX: usize = 100;

/// Sequence number carried by an RST that does not belong to a session's sequence space.
pub const DEFENSIVE_RST_SEQ: u16 = 0xFFFF;

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum PacketType {
    None,
    Data,
    Ack,
    Rst,
    Repeat,
    Syn,
    SynAck,
}

impl PacketType {
    pub fn from_u16(value: u16) -> Option<Self> {
        let packet_type = match value {
            0 => Self::None,
            1 => Self::Data,
            2 => Self::Ack,
            3 => Self::Rst,
            4 => Self::Repeat,
            5 => Self::Syn,
            6 => Self::SynAck,
            _ => return None,
        };

        Some(packet_type)
    }

    pub fn to_u16(self) -> u16 {
        match self {
            Self::None => 0,
            Self::Data => 1,
            Self::Ack => 2,
            Self::Rst => 3,
            Self::Repeat => 4,
            Self::Syn => 5,
            Self::SynAck => 6,
        }
    }
}

/// Fixed PDU header.
///
/// `field` is the 32-bit union slot of the wire format. Sequence numbers and entry counts occupy
/// its first two bytes on the wire (the high half of the big-endian word), while SYNACK stores
/// the server-assigned session id in all four.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Header {
    pub session_id: u32,
    pub packet_type: PacketType,
    pub scramble: u16,
    pub field: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Pdu {
    pub header: Header,
    pub payload: Box<[u8]>,
}

fn short_field(value: u16) -> u32 {
    (value as u32) << 16
}

fn seq_list_payload(seqs: &[u16]) -> Box<[u8]> {
    seqs.iter()
        .flat_map(|seq| seq.to_be_bytes())
        .collect::<Vec<u8>>()
        .into_boxed_slice()
}

impl Pdu {
    pub fn new(packet_type: PacketType, session_id: u32, field: u32, payload: Box<[u8]>) -> Self {
        Self {
            header: Header {
                session_id,
                packet_type,
                scramble: 0,
                field,
            },
            payload,
        }
    }

    /// Session-less DATA; the session id is stamped when the PDU is transmitted.
    pub fn data(seq: u16, payload: Box<[u8]>) -> Self {
        Self::new(PacketType::Data, 0, short_field(seq), payload)
    }

    pub fn rst(session_id: u32, seq: u16) -> Self {
        Self::new(PacketType::Rst, session_id, short_field(seq), Box::new([]))
    }

    pub fn syn(session_id: u32) -> Self {
        Self::new(PacketType::Syn, session_id, 0, Box::new([]))
    }

    pub fn synack(session_id: u32, new_session_id: u32) -> Self {
        Self::new(PacketType::SynAck, session_id, new_session_id, Box::new([]))
    }

    /// Empty ACK completing a handshake.
    pub fn handshake_ack(session_id: u32) -> Self {
        Self::new(PacketType::Ack, session_id, 0, Box::new([]))
    }

    pub fn ack(session_id: u32, seqs: &[u16]) -> Self {
        debug_assert!(seqs.len() <= ENTRIES_PER_PDU_MAX);
        let count = short_field(seqs.len() as u16);
        Self::new(PacketType::Ack, session_id, count, seq_list_payload(seqs))
    }

    pub fn repeat(session_id: u32, seqs: &[u16]) -> Self {
        debug_assert!(seqs.len() <= ENTRIES_PER_PDU_MAX);
        let count = short_field(seqs.len() as u16);
        Self::new(PacketType::Repeat, session_id, count, seq_list_payload(seqs))
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn session_id(&self) -> u32 {
        self.header.session_id
    }

    pub fn seq(&self) -> u16 {
        (self.header.field >> 16) as u16
    }

    pub fn count(&self) -> u16 {
        (self.header.field >> 16) as u16
    }

    pub fn new_session_id(&self) -> u32 {
        self.header.field
    }

    /// Sequence numbers listed in an ACK or REPEAT payload.
    pub fn entries(&self) -> impl Iterator<Item = u16> + '_ {
        self.payload
            .chunks_exact(2)
            .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
    }
}
