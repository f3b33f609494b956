//! DDC/CI packet framing.
//!
//! A packet written by the host carries the source sub-address 0x51, a
//! length byte with bit 7 set, up to 32 payload bytes (opcode included) and
//! an XOR checksum seeded with the virtual destination byte 0x6E. Replies
//! from the monitor lead with 0x6E and their checksum is seeded with 0x50.

use std::iter;

use crate::error::{DdcResult, Status};

/// Host source sub-address, first wire byte of every request.
pub const HOST_ADDRESS: u8 = 0x51;
/// Monitor address as it appears on the wire (0x37 << 1).
pub const DISPLAY_ADDRESS: u8 = 0x6E;
/// Virtual checksum seed for monitor replies.
const REPLY_SEED: u8 = 0x50;

/// Maximum payload length (opcode byte included).
pub const MAX_PAYLOAD: usize = 32;

/// Upper bound on an assembled multi-part value.
const MAX_MULTI_PART: usize = 4096;

/// Fragment payload limit for multi-part replies and table writes.
pub const MAX_FRAGMENT: usize = 32;

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum PacketType {
    VcpRequest,
    VcpReply,
    VcpSet,
    TimingRequest,
    TimingReply,
    SaveSettings,
    CapabilitiesRequest,
    CapabilitiesReply,
    TableWrite,
    TableReadRequest,
    TableReadReply,
    IdentificationRequest,
}

impl PacketType {
    pub fn opcode(self) -> u8 {
        match self {
            PacketType::VcpRequest => 0x01,
            PacketType::VcpReply => 0x02,
            PacketType::VcpSet => 0x03,
            PacketType::TimingRequest => 0x07,
            PacketType::TimingReply => 0x06,
            PacketType::SaveSettings => 0xE2,
            PacketType::CapabilitiesRequest => 0xF3,
            PacketType::CapabilitiesReply => 0xE3,
            PacketType::TableWrite => 0xE4,
            PacketType::TableReadRequest => 0xE5,
            PacketType::TableReadReply => 0xE7,
            PacketType::IdentificationRequest => 0xE6,
        }
    }

    pub fn from_opcode(opcode: u8) -> Option<PacketType> {
        Some(match opcode {
            0x01 => PacketType::VcpRequest,
            0x02 => PacketType::VcpReply,
            0x03 => PacketType::VcpSet,
            0x07 => PacketType::TimingRequest,
            0x06 => PacketType::TimingReply,
            0xE2 => PacketType::SaveSettings,
            0xF3 => PacketType::CapabilitiesRequest,
            0xE3 => PacketType::CapabilitiesReply,
            0xE4 => PacketType::TableWrite,
            0xE5 => PacketType::TableReadRequest,
            0xE7 => PacketType::TableReadReply,
            0xE6 => PacketType::IdentificationRequest,
            _ => return None,
        })
    }

    /// True for packets that originate at the monitor.
    pub fn is_reply(self) -> bool {
        matches!(
            self,
            PacketType::VcpReply
                | PacketType::TimingReply
                | PacketType::CapabilitiesReply
                | PacketType::TableReadReply
        )
    }

    /// Minimum body length (payload after the opcode byte).
    fn min_body(self) -> usize {
        match self {
            PacketType::VcpRequest => 1,
            PacketType::VcpReply => 7,
            PacketType::VcpSet => 3,
            PacketType::TimingRequest => 0,
            PacketType::TimingReply => 5,
            PacketType::SaveSettings => 0,
            PacketType::CapabilitiesRequest => 2,
            PacketType::CapabilitiesReply => 2,
            PacketType::TableWrite => 3,
            PacketType::TableReadRequest => 3,
            PacketType::TableReadReply => 2,
            PacketType::IdentificationRequest => 0,
        }
    }
}

/// A parsed DDC/CI packet. `body` is the payload after the opcode byte; the
/// wire payload length is therefore `1 + body.len()`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    pub ty: PacketType,
    pub source: u8,
    pub dest: u8,
    pub body: Vec<u8>,
}

impl Packet {
    pub fn request(ty: PacketType, body: Vec<u8>) -> Packet {
        Packet {
            ty,
            source: HOST_ADDRESS,
            dest: DISPLAY_ADDRESS,
            body,
        }
    }

    pub fn reply(ty: PacketType, body: Vec<u8>) -> Packet {
        Packet {
            ty,
            source: DISPLAY_ADDRESS,
            dest: HOST_ADDRESS,
            body,
        }
    }

    fn from_host(&self) -> bool {
        self.source == HOST_ADDRESS
    }
}

/// XOR reduction over a byte stream.
pub fn checksum<I: IntoIterator<Item = u8>>(bytes: I) -> u8 {
    bytes.into_iter().fold(0u8, |sum, b| sum ^ b)
}

/// Encodes a packet to its exact wire image (I2C address byte excluded).
pub fn encode(packet: &Packet) -> DdcResult<Vec<u8>> {
    let payload_len = 1 + packet.body.len();
    if payload_len > MAX_PAYLOAD {
        return Err(Status::InvalidArgument(format!(
            "payload length {} exceeds {} bytes",
            payload_len, MAX_PAYLOAD
        ))
        .at("packet::encode"));
    }
    match (packet.source, packet.dest) {
        (HOST_ADDRESS, DISPLAY_ADDRESS) | (DISPLAY_ADDRESS, HOST_ADDRESS) => {}
        _ => {
            return Err(Status::InvalidArgument(format!(
                "unrecognized addressing {:#04x} -> {:#04x}",
                packet.source, packet.dest
            ))
            .at("packet::encode"))
        }
    }
    if packet.from_host() == packet.ty.is_reply() {
        return Err(Status::InvalidArgument(format!(
            "packet type {:?} does not match source {:#04x}",
            packet.ty, packet.source
        ))
        .at("packet::encode"));
    }

    let mut out = Vec::with_capacity(payload_len + 3);
    out.push(packet.source);
    out.push(0x80 | payload_len as u8);
    out.push(packet.ty.opcode());
    out.extend_from_slice(&packet.body);
    let ck = if packet.from_host() {
        checksum(iter::once(DISPLAY_ADDRESS).chain(out.iter().cloned()))
    } else {
        checksum(iter::once(REPLY_SEED).chain(out[1..].iter().cloned()))
    };
    out.push(ck);
    Ok(out)
}

/// Decodes an exactly framed wire image. A zero-length payload from the
/// monitor is the Null Response and is reported as an error, never as a
/// packet.
pub fn decode(bytes: &[u8]) -> DdcResult<Packet> {
    const SITE: &str = "packet::decode";
    if bytes.len() < 3 {
        return Err(Status::ShortRead {
            expected: 3,
            actual: bytes.len(),
        }
        .at(SITE));
    }
    let (source, dest) = match bytes[0] {
        HOST_ADDRESS => (HOST_ADDRESS, DISPLAY_ADDRESS),
        DISPLAY_ADDRESS => (DISPLAY_ADDRESS, HOST_ADDRESS),
        _ => return Err(Status::InvalidResponse("unexpected destination").at(SITE)),
    };
    if bytes[1] & 0x80 == 0 {
        return Err(Status::InvalidResponse("length bit not set").at(SITE));
    }
    let payload_len = (bytes[1] & 0x7F) as usize;
    if payload_len > MAX_PAYLOAD {
        return Err(Status::InvalidResponse("declared payload too long").at(SITE));
    }
    if bytes.len() != payload_len + 3 {
        if bytes.len() < payload_len + 3 {
            return Err(Status::ShortRead {
                expected: payload_len + 3,
                actual: bytes.len(),
            }
            .at(SITE));
        }
        return Err(Status::InvalidResponse("length mismatch").at(SITE));
    }

    let ck = if source == HOST_ADDRESS {
        checksum(iter::once(DISPLAY_ADDRESS).chain(bytes[..bytes.len() - 1].iter().cloned()))
    } else {
        checksum(iter::once(REPLY_SEED).chain(bytes[1..bytes.len() - 1].iter().cloned()))
    };
    if ck != bytes[bytes.len() - 1] {
        return Err(Status::ChecksumMismatch.at(SITE));
    }

    if payload_len == 0 {
        return Err(Status::NullResponse.at(SITE));
    }

    let opcode = bytes[2];
    let ty = match PacketType::from_opcode(opcode) {
        Some(ty) => ty,
        None if source == DISPLAY_ADDRESS => {
            return Err(Status::InvalidResponse("unknown reply opcode").at(SITE))
        }
        None => return Err(Status::InvalidResponse("unknown request opcode").at(SITE)),
    };
    if ty.is_reply() != (source == DISPLAY_ADDRESS) {
        return Err(Status::InvalidResponse("opcode direction mismatch").at(SITE));
    }
    let body = &bytes[3..bytes.len() - 1];
    if body.len() < ty.min_body() {
        return Err(Status::InvalidResponse("payload too short for declared operation").at(SITE));
    }

    Ok(Packet {
        ty,
        source,
        dest,
        body: body.to_vec(),
    })
}

/// Reassembles a multi-part value (capabilities string, table value) from a
/// sequence of offset-tagged fragments.
///
/// Offsets must start at 0 and each fragment must continue exactly where the
/// previous one ended; a zero-length fragment terminates the stream.
#[derive(Debug, Default)]
pub struct MultiPartAssembler {
    buf: Vec<u8>,
    complete: bool,
}

impl MultiPartAssembler {
    pub fn new() -> MultiPartAssembler {
        MultiPartAssembler::default()
    }

    /// Feeds one fragment. Returns `true` once the stream has terminated.
    pub fn push(&mut self, offset: u16, fragment: &[u8]) -> DdcResult<bool> {
        const SITE: &str = "packet::multi_part";
        if self.complete {
            return Err(Status::InvalidResponse("fragment after terminator").at(SITE));
        }
        if fragment.len() > MAX_FRAGMENT {
            return Err(Status::InvalidResponse("fragment longer than 32 bytes").at(SITE));
        }
        if offset as usize != self.buf.len() {
            return Err(Status::InvalidResponse("fragment out of order").at(SITE));
        }
        if fragment.is_empty() {
            self.complete = true;
            return Ok(true);
        }
        if self.buf.len() + fragment.len() > MAX_MULTI_PART {
            return Err(Status::InvalidResponse("multi-part value too large").at(SITE));
        }
        self.buf.extend_from_slice(fragment);
        Ok(false)
    }

    pub fn assembled_len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_complete(&self) -> bool {
        self.complete
    }

    /// Yields the assembled value; refuses if the stream never terminated.
    pub fn finish(self) -> DdcResult<Vec<u8>> {
        if !self.complete {
            return Err(
                Status::InvalidResponse("multi-part stream not terminated").at("packet::multi_part")
            );
        }
        Ok(self.buf)
    }
}
