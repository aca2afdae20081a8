use byteorder::{BigEndian, ByteOrder, LittleEndian};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::DecodeError;
use crate::icmp::Family;

pub const ICMP_ECHO_REQUEST: u8 = 8;
pub const ICMP_ECHO_REPLY: u8 = 0;
pub const ICMPV6_ECHO_REQUEST: u8 = 128;
pub const ICMPV6_ECHO_REPLY: u8 = 129;

/// Type, code, checksum, identifier, sequence
pub const ICMP_HEADER_SIZE: usize = 8;
/// Send time, nanoseconds since the UNIX epoch, little-endian
pub const TIMESTAMP_SIZE: usize = 8;
pub const DEFAULT_PAYLOAD_SIZE: usize = 32;

const PAYLOAD_FILL: u8 = 0x61;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EchoPacket {
    pub icmp_type: u8,
    pub code: u8,
    pub checksum: u16,
    pub identifier: u16,
    pub sequence: u16,
    pub payload: Vec<u8>,
}

/// The fields an echo reply carries back to the sender.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Echo {
    pub identifier: u16,
    pub sequence: u16,
    pub sent: SystemTime,
}

impl EchoPacket {
    pub fn new_echo_request(
        family: Family,
        identifier: u16,
        sequence: u16,
        sent: SystemTime,
        payload_size: usize,
    ) -> Self {
        let mut payload = vec![PAYLOAD_FILL; payload_size.max(TIMESTAMP_SIZE)];
        LittleEndian::write_u64(&mut payload[..TIMESTAMP_SIZE], to_nanos(sent));

        let mut packet = Self {
            icmp_type: family.echo_request_type(),
            code: 0,
            checksum: 0,
            identifier,
            sequence,
            payload,
        };

        // The kernel fills in ICMPv6 checksums over the pseudo-header
        if family == Family::V4 {
            packet.calculate_checksum();
        }
        packet
    }

    pub fn from_bytes(data: &[u8]) -> Result<Self, DecodeError> {
        if data.len() < ICMP_HEADER_SIZE {
            return Err(DecodeError::NotEcho);
        }

        Ok(Self {
            icmp_type: data[0],
            code: data[1],
            checksum: BigEndian::read_u16(&data[2..4]),
            identifier: BigEndian::read_u16(&data[4..6]),
            sequence: BigEndian::read_u16(&data[6..8]),
            payload: data[ICMP_HEADER_SIZE..].to_vec(),
        })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = vec![0u8; ICMP_HEADER_SIZE + self.payload.len()];
        bytes[0] = self.icmp_type;
        bytes[1] = self.code;
        BigEndian::write_u16(&mut bytes[2..4], self.checksum);
        BigEndian::write_u16(&mut bytes[4..6], self.identifier);
        BigEndian::write_u16(&mut bytes[6..8], self.sequence);
        bytes[ICMP_HEADER_SIZE..].copy_from_slice(&self.payload);
        bytes
    }

    pub fn calculate_checksum(&mut self) {
        self.checksum = 0;
        let bytes = self.to_bytes();
        self.checksum = compute_checksum(&bytes);
    }

    pub fn verify_checksum(&self) -> bool {
        compute_checksum(&self.to_bytes()) == 0
    }

    /// Turn a request into the reply a peer would send back for it.
    pub fn into_reply(mut self, family: Family) -> Self {
        self.icmp_type = family.echo_reply_type();
        if family == Family::V4 {
            self.calculate_checksum();
        } else {
            self.checksum = 0;
        }
        self
    }

    pub fn timestamp(&self) -> Result<SystemTime, DecodeError> {
        if self.payload.len() < TIMESTAMP_SIZE {
            return Err(DecodeError::TooShort);
        }
        let nanos = LittleEndian::read_u64(&self.payload[..TIMESTAMP_SIZE]);
        Ok(UNIX_EPOCH + Duration::from_nanos(nanos))
    }
}

/// Build the wire bytes of an echo request stamped with `sent`.
pub fn encode(
    family: Family,
    identifier: u16,
    sequence: u16,
    sent: SystemTime,
    payload_size: usize,
) -> Vec<u8> {
    EchoPacket::new_echo_request(family, identifier, sequence, sent, payload_size).to_bytes()
}

/// Parse an echo message and check it is the reply type the family expects.
pub fn decode(data: &[u8], expected_type: u8) -> Result<Echo, DecodeError> {
    let packet = EchoPacket::from_bytes(data)?;
    if packet.icmp_type != expected_type {
        return Err(DecodeError::WrongType {
            expected: expected_type,
            found: packet.icmp_type,
        });
    }
    if packet.code != 0 {
        return Err(DecodeError::NotEcho);
    }

    Ok(Echo {
        identifier: packet.identifier,
        sequence: packet.sequence,
        sent: packet.timestamp()?,
    })
}

fn to_nanos(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos() as u64)
        .unwrap_or(0)
}

fn compute_checksum(data: &[u8]) -> u16 {
    let mut sum: u32 = 0;

    let mut words = data.chunks_exact(2);
    for word in &mut words {
        sum += BigEndian::read_u16(word) as u32;
    }

    // Odd trailing byte is padded with zero
    if let [last] = words.remainder() {
        sum += (*last as u32) << 8;
    }

    while (sum >> 16) != 0 {
        sum = (sum & 0xFFFF) + (sum >> 16);
    }

    !sum as u16
}
