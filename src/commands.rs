//! Typed DDC/CI request and response types.
//!
//! Each command knows its packet type, the delay the monitor needs before
//! its response may be read, the delay before the next command may be
//! written, and the retry class the retry engine files it under.

use std::fmt;

use crate::error::{DdcResult, ErrorInfo, Status};
use crate::packet::{Packet, PacketType, MAX_FRAGMENT};
use crate::retry::TryClass;

/// A VCP feature code.
pub type FeatureCode = u8;

pub trait Command {
    type Ok: CommandResult;
    const TYPE: PacketType;
    /// Bytes to read back for the reply; 0 for write-only commands.
    const MAX_READ: usize;
    /// Required delay between writing the request and reading the reply.
    const DELAY_RESPONSE_MS: u64;
    /// Required delay before the next command may be written.
    const DELAY_COMMAND_MS: u64;
    const RETRY_CLASS: TryClass;

    /// Payload after the opcode byte.
    fn body(&self) -> DdcResult<Vec<u8>>;

    fn packet(&self) -> DdcResult<Packet> {
        Ok(Packet::request(Self::TYPE, self.body()?))
    }
}

pub trait CommandResult: Sized {
    fn decode(packet: &Packet) -> DdcResult<Self>;
}

fn expect_type(packet: &Packet, ty: PacketType, site: &'static str) -> DdcResult<()> {
    if packet.ty != ty {
        return Err(Status::InvalidResponse("unexpected reply opcode").at(site));
    }
    Ok(())
}

#[derive(Copy, Clone, Debug)]
pub struct GetVcpFeature {
    pub code: FeatureCode,
}

impl GetVcpFeature {
    pub fn new(code: FeatureCode) -> Self {
        GetVcpFeature { code }
    }
}

impl Command for GetVcpFeature {
    type Ok = VcpValue;
    const TYPE: PacketType = PacketType::VcpRequest;
    const MAX_READ: usize = 11;
    const DELAY_RESPONSE_MS: u64 = 40;
    const DELAY_COMMAND_MS: u64 = 50;
    const RETRY_CLASS: TryClass = TryClass::WriteRead;

    fn body(&self) -> DdcResult<Vec<u8>> {
        Ok(vec![self.code])
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SetVcpFeature {
    pub code: FeatureCode,
    pub value: u16,
}

impl SetVcpFeature {
    pub fn new(code: FeatureCode, value: u16) -> Self {
        SetVcpFeature { code, value }
    }
}

impl Command for SetVcpFeature {
    type Ok = ();
    const TYPE: PacketType = PacketType::VcpSet;
    const MAX_READ: usize = 0;
    const DELAY_RESPONSE_MS: u64 = 0;
    const DELAY_COMMAND_MS: u64 = 50;
    const RETRY_CLASS: TryClass = TryClass::WriteOnly;

    fn body(&self) -> DdcResult<Vec<u8>> {
        Ok(vec![self.code, (self.value >> 8) as u8, self.value as u8])
    }
}

#[derive(Copy, Clone, Debug)]
pub struct SaveCurrentSettings;

impl Command for SaveCurrentSettings {
    type Ok = ();
    const TYPE: PacketType = PacketType::SaveSettings;
    const MAX_READ: usize = 0;
    const DELAY_RESPONSE_MS: u64 = 0;
    const DELAY_COMMAND_MS: u64 = 200;
    const RETRY_CLASS: TryClass = TryClass::WriteOnly;

    fn body(&self) -> DdcResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

/// A non-table feature value as reported by the monitor.
#[derive(Copy, Clone, PartialEq, Eq, Hash)]
pub struct VcpValue {
    pub feature: FeatureCode,
    /// Type byte from the reply (0 = set parameter, 1 = momentary).
    pub kind: u8,
    pub mh: u8,
    pub ml: u8,
    pub sh: u8,
    pub sl: u8,
}

impl VcpValue {
    pub fn value(&self) -> u16 {
        ((self.sh as u16) << 8) | self.sl as u16
    }

    pub fn maximum(&self) -> u16 {
        ((self.mh as u16) << 8) | self.ml as u16
    }

    /// True when every max/current byte is zero; some monitors signal an
    /// unsupported feature this way.
    pub fn bytes_all_zero(&self) -> bool {
        self.mh == 0 && self.ml == 0 && self.sh == 0 && self.sl == 0
    }
}

impl fmt::Debug for VcpValue {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("VcpValue")
            .field("feature", &self.feature)
            .field("maximum", &self.maximum())
            .field("value", &self.value())
            .finish()
    }
}

impl CommandResult for VcpValue {
    fn decode(packet: &Packet) -> DdcResult<Self> {
        const SITE: &str = "VcpValue::decode";
        expect_type(packet, PacketType::VcpReply, SITE)?;
        let body = &packet.body;
        if body.len() != 7 {
            return Err(Status::InvalidResponse("VCP reply payload length").at(SITE));
        }
        match body[0] {
            0x00 => {}
            0x01 => return Err(Status::ReportedUnsupported.at(SITE)),
            _ => return Err(Status::InvalidResponse("unrecognized VCP result code").at(SITE)),
        }
        Ok(VcpValue {
            feature: body[1],
            kind: body[2],
            mh: body[3],
            ml: body[4],
            sh: body[5],
            sl: body[6],
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct TableRead {
    pub code: FeatureCode,
    pub offset: u16,
}

impl TableRead {
    pub fn new(code: FeatureCode, offset: u16) -> Self {
        TableRead { code, offset }
    }
}

impl Command for TableRead {
    type Ok = TableResponse;
    const TYPE: PacketType = PacketType::TableReadRequest;
    const MAX_READ: usize = 35;
    const DELAY_RESPONSE_MS: u64 = 40;
    const DELAY_COMMAND_MS: u64 = 50;
    const RETRY_CLASS: TryClass = TryClass::MultiPartRead;

    fn body(&self) -> DdcResult<Vec<u8>> {
        Ok(vec![self.code, (self.offset >> 8) as u8, self.offset as u8])
    }
}

#[derive(Copy, Clone, Debug)]
pub struct TableWrite<'a> {
    pub code: FeatureCode,
    pub offset: u16,
    pub data: &'a [u8],
}

impl<'a> TableWrite<'a> {
    pub fn new(code: FeatureCode, offset: u16, data: &'a [u8]) -> Self {
        TableWrite { code, offset, data }
    }
}

impl<'a> Command for TableWrite<'a> {
    type Ok = ();
    const TYPE: PacketType = PacketType::TableWrite;
    const MAX_READ: usize = 0;
    const DELAY_RESPONSE_MS: u64 = 0;
    const DELAY_COMMAND_MS: u64 = 50;
    const RETRY_CLASS: TryClass = TryClass::MultiPartWrite;

    fn body(&self) -> DdcResult<Vec<u8>> {
        if self.data.len() > MAX_FRAGMENT - 4 {
            return Err(Status::InvalidArgument(format!(
                "table write chunk of {} bytes",
                self.data.len()
            ))
            .at("TableWrite::body"));
        }
        let mut body = Vec::with_capacity(3 + self.data.len());
        body.push(self.code);
        body.push((self.offset >> 8) as u8);
        body.push(self.offset as u8);
        body.extend_from_slice(self.data);
        Ok(body)
    }
}

#[derive(Copy, Clone, Debug)]
pub struct CapabilitiesRequest {
    pub offset: u16,
}

impl CapabilitiesRequest {
    pub fn new(offset: u16) -> Self {
        CapabilitiesRequest { offset }
    }
}

impl Command for CapabilitiesRequest {
    type Ok = CapabilitiesReply;
    const TYPE: PacketType = PacketType::CapabilitiesRequest;
    const MAX_READ: usize = 35;
    const DELAY_RESPONSE_MS: u64 = 50;
    const DELAY_COMMAND_MS: u64 = 50;
    const RETRY_CLASS: TryClass = TryClass::MultiPartRead;

    fn body(&self) -> DdcResult<Vec<u8>> {
        Ok(vec![(self.offset >> 8) as u8, self.offset as u8])
    }
}

/// One fragment of a table value.
#[derive(Copy, Clone)]
pub struct TableResponse {
    pub offset: u16,
    data: [u8; MAX_FRAGMENT],
    len: u8,
}

impl TableResponse {
    pub fn bytes(&self) -> &[u8] {
        &self.data[..self.len as usize]
    }
}

impl fmt::Debug for TableResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TableResponse")
            .field("offset", &self.offset)
            .field("bytes", &self.bytes())
            .finish()
    }
}

impl CommandResult for TableResponse {
    fn decode(packet: &Packet) -> DdcResult<Self> {
        const SITE: &str = "TableResponse::decode";
        expect_type(packet, PacketType::TableReadReply, SITE)?;
        let body = &packet.body;
        if body.len() < 2 {
            return Err(Status::InvalidResponse("table reply payload length").at(SITE));
        }
        let fragment = &body[2..];
        let mut data = [0u8; MAX_FRAGMENT];
        data[..fragment.len()].copy_from_slice(fragment);
        Ok(TableResponse {
            offset: ((body[0] as u16) << 8) | body[1] as u16,
            data,
            len: fragment.len() as u8,
        })
    }
}

/// One fragment of the capabilities string.
#[derive(Clone, Debug)]
pub struct CapabilitiesReply {
    pub offset: u16,
    pub data: Box<[u8]>,
}

impl CommandResult for CapabilitiesReply {
    fn decode(packet: &Packet) -> DdcResult<Self> {
        const SITE: &str = "CapabilitiesReply::decode";
        expect_type(packet, PacketType::CapabilitiesReply, SITE)?;
        let body = &packet.body;
        if body.len() < 2 {
            return Err(Status::InvalidResponse("capabilities reply payload length").at(SITE));
        }
        Ok(CapabilitiesReply {
            offset: ((body[0] as u16) << 8) | body[1] as u16,
            data: body[2..].to_vec().into_boxed_slice(),
        })
    }
}

#[derive(Copy, Clone, Debug)]
pub struct GetTimingReport;

impl Command for GetTimingReport {
    type Ok = TimingMessage;
    const TYPE: PacketType = PacketType::TimingRequest;
    const MAX_READ: usize = 9;
    const DELAY_RESPONSE_MS: u64 = 40;
    const DELAY_COMMAND_MS: u64 = 50;
    const RETRY_CLASS: TryClass = TryClass::WriteRead;

    fn body(&self) -> DdcResult<Vec<u8>> {
        Ok(Vec::new())
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TimingMessage {
    pub timing_status: u8,
    pub horizontal_frequency: u16,
    pub vertical_frequency: u16,
}

impl CommandResult for TimingMessage {
    fn decode(packet: &Packet) -> DdcResult<Self> {
        const SITE: &str = "TimingMessage::decode";
        expect_type(packet, PacketType::TimingReply, SITE)?;
        let body = &packet.body;
        if body.len() != 5 {
            return Err(Status::InvalidResponse("timing reply payload length").at(SITE));
        }
        Ok(TimingMessage {
            timing_status: body[0],
            horizontal_frequency: ((body[1] as u16) << 8) | body[2] as u16,
            vertical_frequency: ((body[3] as u16) << 8) | body[4] as u16,
        })
    }
}

impl CommandResult for () {
    fn decode(_packet: &Packet) -> DdcResult<Self> {
        Err(ErrorInfo::new(
            Status::InvalidOperation("write-only command has no reply"),
            "CommandResult::decode",
        ))
    }
}

impl<'a, C: Command> Command for &'a C {
    type Ok = C::Ok;
    const TYPE: PacketType = C::TYPE;
    const MAX_READ: usize = C::MAX_READ;
    const DELAY_RESPONSE_MS: u64 = C::DELAY_RESPONSE_MS;
    const DELAY_COMMAND_MS: u64 = C::DELAY_COMMAND_MS;
    const RETRY_CLASS: TryClass = C::RETRY_CLASS;

    fn body(&self) -> DdcResult<Vec<u8>> {
        (*self).body()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet;

    #[test]
    fn get_vcp_request_encodes_feature() {
        let cmd = GetVcpFeature::new(0x10);
        let pkt = cmd.packet().unwrap();
        assert_eq!(pkt.ty, PacketType::VcpRequest);
        assert_eq!(pkt.body, vec![0x10]);
    }

    #[test]
    fn vcp_reply_decodes_value_fields() {
        let pkt = Packet::reply(
            PacketType::VcpReply,
            vec![0x00, 0x10, 0x00, 0x00, 0xFF, 0x00, 0x64],
        );
        let val = VcpValue::decode(&pkt).unwrap();
        assert_eq!(val.feature, 0x10);
        assert_eq!(val.maximum(), 0x00FF);
        assert_eq!(val.value(), 0x0064);
        assert!(!val.bytes_all_zero());
    }

    #[test]
    fn vcp_reply_unsupported_flag() {
        let pkt = Packet::reply(
            PacketType::VcpReply,
            vec![0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00],
        );
        let err = VcpValue::decode(&pkt).unwrap_err();
        assert_eq!(err.status, Status::ReportedUnsupported);
    }

    #[test]
    fn set_vcp_round_trips_through_codec() {
        let cmd = SetVcpFeature::new(0x10, 0x0032);
        let bytes = packet::encode(&cmd.packet().unwrap()).unwrap();
        let back = packet::decode(&bytes).unwrap();
        assert_eq!(back.ty, PacketType::VcpSet);
        assert_eq!(back.body, vec![0x10, 0x00, 0x32]);
    }

    #[test]
    fn capabilities_reply_carries_offset_and_data() {
        let mut body = vec![0x00, 0x20];
        body.extend_from_slice(b"(prot(monitor)");
        let pkt = Packet::reply(PacketType::CapabilitiesReply, body);
        let reply = CapabilitiesReply::decode(&pkt).unwrap();
        assert_eq!(reply.offset, 0x20);
        assert_eq!(&*reply.data, b"(prot(monitor)".as_slice());
    }

    #[test]
    fn table_response_fragment() {
        let pkt = Packet::reply(PacketType::TableReadReply, vec![0x00, 0x06, 1, 2, 3]);
        let frag = TableResponse::decode(&pkt).unwrap();
        assert_eq!(frag.offset, 6);
        assert_eq!(frag.bytes(), &[1, 2, 3]);
    }

    #[test]
    fn timing_reply_decodes() {
        let pkt = Packet::reply(PacketType::TimingReply, vec![0x00, 0x1A, 0x2B, 0x00, 0x3C]);
        let msg = TimingMessage::decode(&pkt).unwrap();
        assert_eq!(msg.horizontal_frequency, 0x1A2B);
        assert_eq!(msg.vertical_frequency, 0x003C);
    }

    #[test]
    fn oversized_table_write_chunk_is_refused() {
        let data = [0u8; 40];
        let cmd = TableWrite::new(0x73, 0, &data);
        assert!(matches!(
            cmd.body().unwrap_err().status,
            Status::InvalidArgument(_)
        ));
    }
}
