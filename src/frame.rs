//! Frame & identifier codec (module A).
//!
//! Packs and unpacks the 29-bit J1939/ISOBUS CAN identifier:
//!
//! ```text
//! | priority:3 | reserved:1 | data-page:1 | PDU-format:8 | PDU-specific:8 | source:8 |
//! ```

use crate::error::{IsobusError, Result};
use crate::types::{Address, BROADCAST_ADDRESS};

/// A raw CAN frame as delivered by the hardware driver: the 29-bit identifier plus payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    /// The 29-bit extended CAN identifier, right-justified in a u32.
    pub id: u32,
    /// 0-8 bytes of payload.
    pub data: Vec<u8>,
}

/// A J1939/ISOBUS frame, decoded into its logical fields.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    priority: u8,
    pgn: u32,
    source: Address,
    destination: Address,
    payload: Vec<u8>,
}

impl Frame {
    /// Build a frame from logical fields.
    ///
    /// If the PGN's PDU-format byte (bits 16..23) is < 240 (PDU1), `destination` overwrites the
    /// PGN's low byte on the wire and the frame targets that address. Otherwise (PDU2, PF >= 240)
    /// the PGN's low byte is the group extension and the frame is always broadcast.
    pub fn from_message(priority: u8, pgn: u32, source: Address, destination: Address, payload: Vec<u8>) -> Self {
        Self {
            priority: priority & 0x07,
            pgn: pgn & 0x3FFFF,
            source,
            destination,
            payload,
        }
    }

    /// Decode a raw 29-bit identifier + payload into a logical frame.
    pub fn from_raw(raw: &RawFrame) -> Result<Self> {
        if raw.id > 0x1FFF_FFFF {
            return Err(IsobusError::InvalidArgument(format!(
                "CAN id {:#x} exceeds 29 bits",
                raw.id
            )));
        }
        let source = (raw.id & 0xFF) as u8;
        let ps = ((raw.id >> 8) & 0xFF) as u8;
        let pf = ((raw.id >> 16) & 0xFF) as u8;
        let dp = ((raw.id >> 24) & 0x01) as u32;
        let priority = ((raw.id >> 26) & 0x07) as u8;

        let (pgn, destination) = if pf >= 240 {
            ((dp << 16) | ((pf as u32) << 8) | (ps as u32), BROADCAST_ADDRESS)
        } else {
            ((dp << 16) | ((pf as u32) << 8), ps)
        };

        Ok(Self {
            priority,
            pgn,
            source,
            destination,
            payload: raw.data.clone(),
        })
    }

    /// Encode back into a raw 29-bit identifier + payload.
    pub fn to_raw(&self) -> RawFrame {
        let pf = ((self.pgn >> 8) & 0xFF) as u8;
        let dp = ((self.pgn >> 16) & 0x01) as u32;

        let ps = if pf < 240 {
            self.destination as u32
        } else {
            self.pgn & 0xFF
        };

        let id = ((self.priority as u32) << 26)
            | (dp << 24)
            | ((pf as u32) << 16)
            | (ps << 8)
            | (self.source as u32);

        RawFrame {
            id,
            data: self.payload.clone(),
        }
    }

    /// Message priority, 0 (highest) to 7 (lowest).
    pub fn priority(&self) -> u8 {
        self.priority
    }

    /// The 18-bit effective Parameter Group Number.
    pub fn pgn(&self) -> u32 {
        self.pgn
    }

    /// Source address of the sending node.
    pub fn source(&self) -> Address {
        self.source
    }

    /// Destination address; `255` for broadcast frames.
    pub fn destination(&self) -> Address {
        self.destination
    }

    /// The frame's payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Whether this frame is a PDU2 (PF >= 240) broadcast.
    pub fn is_broadcast(&self) -> bool {
        let pf = (self.pgn >> 8) & 0xFF;
        pf >= 240
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_pdu1_peer_to_peer() {
        // Request PGN (0xEA00) from 0xFE to 0x00
        let raw = RawFrame {
            id: 0x18EA00FE,
            data: vec![0xE5, 0xFE, 0x00],
        };
        let frame = Frame::from_raw(&raw).unwrap();
        assert_eq!(frame.priority(), 6);
        assert_eq!(frame.pgn(), 0xEA00);
        assert_eq!(frame.source(), 0xFE);
        assert_eq!(frame.destination(), 0x00);
        assert!(!frame.is_broadcast());
    }

    #[test]
    fn decodes_pdu2_broadcast() {
        // DM1 (0xFECA) broadcast from source 0x00
        let raw = RawFrame {
            id: 0x18FECA00,
            data: vec![0; 8],
        };
        let frame = Frame::from_raw(&raw).unwrap();
        assert_eq!(frame.pgn(), 0xFECA);
        assert_eq!(frame.destination(), BROADCAST_ADDRESS);
        assert!(frame.is_broadcast());
    }

    #[test]
    fn roundtrips_through_raw() {
        let original = RawFrame {
            id: 0x0CF00400,
            data: vec![1, 2, 3, 4, 5, 6, 7, 8],
        };
        let frame = Frame::from_raw(&original).unwrap();
        let rebuilt = frame.to_raw();
        assert_eq!(original, rebuilt);
    }

    #[test]
    fn from_message_sets_destination_for_pdu1() {
        let frame = Frame::from_message(3, 0xEF00, 0x10, 0x20, vec![1, 2]);
        let raw = frame.to_raw();
        let decoded = Frame::from_raw(&raw).unwrap();
        assert_eq!(decoded.destination(), 0x20);
        assert_eq!(decoded.source(), 0x10);
    }

    #[test]
    fn rejects_identifiers_wider_than_29_bits() {
        let raw = RawFrame {
            id: 0x2000_0000,
            data: vec![],
        };
        assert!(matches!(
            Frame::from_raw(&raw),
            Err(IsobusError::InvalidArgument(_))
        ));
    }
}
