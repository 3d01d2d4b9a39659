//! AAL5 CPCS framing
//!
//! Padding rules and the 8-byte CPCS-PDU trailer. The trailer is
//! big-endian on the wire: `[UU][CPI][length:2][CRC-32:4]`.

use sar_api::Aal5Info;

/// ATM cell payload size.
pub const CELL_PAYLOAD_SIZE: usize = 48;

/// Size of the CPCS-PDU trailer.
pub const TRAILER_SIZE: usize = 8;

/// Most bytes a PDU can carry beyond its payload (padding plus trailer).
pub const MAX_APPEND_BYTES: usize = CELL_PAYLOAD_SIZE - 1 + TRAILER_SIZE;

/// Bytes of padding placed between the payload and the trailer.
///
/// The payload, padding and trailer together fill a whole number of cells.
pub fn padding_bytes(payload_len: usize) -> usize {
    let tail = payload_len % CELL_PAYLOAD_SIZE;
    let fill = if tail > CELL_PAYLOAD_SIZE - TRAILER_SIZE {
        2 * CELL_PAYLOAD_SIZE
    } else {
        CELL_PAYLOAD_SIZE
    };
    fill - tail - TRAILER_SIZE
}

/// Length of the PDU on the wire, in bytes.
pub fn pdu_length(payload_len: usize) -> usize {
    payload_len + padding_bytes(payload_len) + TRAILER_SIZE
}

/// CPCS-PDU trailer in host order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Aal5Trailer {
    pub user_to_user: u8,
    pub common_part_indicator: u8,
    pub length: u16,
    pub crc: u32,
}

impl Aal5Trailer {
    pub fn new(info: Aal5Info, length: u16) -> Self {
        Self {
            user_to_user: info.user_to_user,
            common_part_indicator: info.common_part_indicator,
            length,
            crc: 0,
        }
    }

    pub fn info(&self) -> Aal5Info {
        Aal5Info {
            user_to_user: self.user_to_user,
            common_part_indicator: self.common_part_indicator,
        }
    }

    pub fn to_bytes(self) -> [u8; TRAILER_SIZE] {
        let mut bytes = [0u8; TRAILER_SIZE];
        bytes[0] = self.user_to_user;
        bytes[1] = self.common_part_indicator;
        bytes[2..4].copy_from_slice(&self.length.to_be_bytes());
        bytes[4..].copy_from_slice(&self.crc.to_be_bytes());
        bytes
    }

    pub fn from_bytes(bytes: [u8; TRAILER_SIZE]) -> Self {
        Self {
            user_to_user: bytes[0],
            common_part_indicator: bytes[1],
            length: u16::from_be_bytes([bytes[2], bytes[3]]),
            crc: u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]),
        }
    }
}
