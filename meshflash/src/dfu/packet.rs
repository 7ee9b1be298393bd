//! HCI packets of the legacy serial DFU transport
//!
//! Every packet starts with a four byte header:
//!
//! ```text
//! byte 0: seq[0:2] | ack[3:5] | data integrity[6] | reliable[7]
//! byte 1: packet type[0:3] | length[4:7] (low nibble of length)
//! byte 2: length[8:15] (bits 4..12 of length)
//! byte 3: two's complement of the sum of bytes 0..2
//! ```
//!
//! followed by the payload and a CRC16 of header and payload, and the whole
//! packet is sent as one SLIP frame.

use std::io::Write;

use slip_codec::SlipEncoder;

use crate::error::DfuError;

/// Packet type used for all reliable DFU packets
const HCI_PACKET_TYPE: u8 = 14;
const DATA_INTEGRITY_CHECK_PRESENT: u8 = 1;
const RELIABLE_PACKET: u8 = 1;

/// Sequence numbers wrap around after this many packets
pub const SEQUENCE_MODULO: u8 = 8;

/// The header has twelve bits for the payload length
pub const MAX_PAYLOAD_LEN: usize = 0x0FFF;

/// Opcodes carried in the first word of a DFU payload
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Opcode {
    InitPacket = 1,
    StartPacket = 3,
    DataPacket = 4,
    StopDataPacket = 5,
}

/// CRC16-CCITT as computed by the bootloader, seeded with `0xFFFF`
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0xFFFF, |crc: u16, &byte| {
        let mut crc = crc.rotate_left(8);
        crc ^= u16::from(byte);
        crc ^= (crc & 0x00FF) >> 4;
        crc ^= crc << 12;
        crc ^= (crc & 0x00FF) << 5;
        crc
    })
}

fn header(sequence: u8, len: u16) -> [u8; 4] {
    let mut header = [
        sequence
            | (((sequence + 1) % SEQUENCE_MODULO) << 3)
            | (DATA_INTEGRITY_CHECK_PRESENT << 6)
            | (RELIABLE_PACKET << 7),
        HCI_PACKET_TYPE | (((len & 0x000F) as u8) << 4),
        ((len & 0x0FF0) >> 4) as u8,
        0,
    ];
    header[3] = header[..3]
        .iter()
        .fold(0u8, |sum, byte| sum.wrapping_add(*byte))
        .wrapping_neg();

    header
}

/// A DFU packet ready to be framed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HciPacket {
    pub sequence: u8,
    data: Vec<u8>,
}

impl HciPacket {
    /// Build a packet with the given sequence number around `payload`.
    pub fn new(sequence: u8, payload: &[u8]) -> Result<Self, DfuError> {
        let len = u16::try_from(payload.len())
            .ok()
            .filter(|len| usize::from(*len) <= MAX_PAYLOAD_LEN)
            .ok_or_else(|| {
                DfuError::InvalidPackage(format!(
                    "a {} byte packet exceeds the {MAX_PAYLOAD_LEN} byte limit",
                    payload.len()
                ))
            })?;

        let mut data = Vec::with_capacity(payload.len() + 6);
        data.extend_from_slice(&header(sequence, len));
        data.extend_from_slice(payload);

        let crc = crc16(&data);
        data.extend_from_slice(&crc.to_le_bytes());

        Ok(Self { sequence, data })
    }

    /// The acknowledgement number the bootloader answers this packet with
    pub fn expected_ack(&self) -> u8 {
        (self.sequence + 1) % SEQUENCE_MODULO
    }

    /// Header, payload and CRC, before SLIP framing
    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    /// Write the packet as a single SLIP frame.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> std::io::Result<usize> {
        SlipEncoder::new(true).encode(&self.data, writer)
    }
}

/// Build a DFU payload: the opcode as a little endian word followed by `body`.
pub fn payload(opcode: Opcode, body: &[u8]) -> Vec<u8> {
    let mut payload = Vec::with_capacity(body.len() + 4);
    payload.extend_from_slice(&(opcode as u32).to_le_bytes());
    payload.extend_from_slice(body);
    payload
}

/// Extract the acknowledgement number from a decoded reply.
pub fn ack_number(reply: &[u8]) -> Option<u8> {
    reply.first().map(|byte| (byte >> 3) & 0x07)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crc16_reference_values() {
        // CRC-16/CCITT-FALSE check value
        assert_eq!(crc16(b"123456789"), 0x29B1);
        assert_eq!(crc16(&[]), 0xFFFF);
    }

    #[test]
    fn header_layout() {
        let header = header(1, 0x123);

        // seq 1, ack 2, integrity and reliable flags
        assert_eq!(header[0], 0xD1);
        assert_eq!(header[1], 0x3E);
        assert_eq!(header[2], 0x12);
        assert_eq!(
            header
                .iter()
                .fold(0u8, |sum, byte| sum.wrapping_add(*byte)),
            0
        );
    }

    #[test]
    fn packet_carries_crc() {
        let packet = HciPacket::new(3, &payload(Opcode::StopDataPacket, &[])).unwrap();
        let bytes = packet.as_bytes();

        assert_eq!(bytes.len(), 4 + 4 + 2);
        assert_eq!(&bytes[4..8], &[5, 0, 0, 0]);

        let crc = crc16(&bytes[..8]);
        assert_eq!(&bytes[8..], &crc.to_le_bytes());
        assert_eq!(packet.expected_ack(), 4);
    }

    #[test]
    fn sequence_wraps() {
        let packet = HciPacket::new(7, &[]).unwrap();

        assert_eq!(packet.expected_ack(), 0);
        assert_eq!(packet.as_bytes()[0] & 0x3F, 0x07);
    }

    #[test]
    fn framed_packet() {
        let packet = HciPacket::new(1, &payload(Opcode::DataPacket, &[0xC0])).unwrap();
        let mut out = Vec::new();
        let len = packet.write_to(&mut out).unwrap();

        assert_eq!(len, out.len());
        assert_eq!(out.first(), Some(&0xC0));
        assert_eq!(out.last(), Some(&0xC0));
        // The 0xC0 in the payload is escaped
        assert_eq!(out.iter().filter(|byte| **byte == 0xC0).count(), 2);
    }

    #[test]
    fn oversized_payload_is_rejected() {
        assert!(HciPacket::new(1, &[0; MAX_PAYLOAD_LEN]).is_ok());
        assert!(matches!(
            HciPacket::new(1, &[0; MAX_PAYLOAD_LEN + 1]),
            Err(DfuError::InvalidPackage(_))
        ));
    }

    #[test]
    fn parse_ack() {
        assert_eq!(ack_number(&[2 << 3, 0, 0, 0]), Some(2));
        assert_eq!(ack_number(&[]), None);
    }
}
