//! Shared test fixtures: a protocol-level mock monitor and a mock bus
//! provider that discovery and the context run against unchanged.

use std::collections::HashMap;
use std::io;
use std::sync::Mutex;

use ddctool::discovery::{BusProvider, BusScan};
use ddctool::packet::{self, Packet, PacketType};
use ddctool::transport::{I2cIo, I2C_ADDRESS_DDC_CI, I2C_ADDRESS_EDID};

/// How the mock signals a feature it does not have.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum Dialect {
    /// Valid reply with the unsupported bit set.
    DdcFlag,
    /// Valid reply with mh=ml=sh=sl=0.
    AllZero,
    /// Null response.
    NullResponse,
    /// Null response for everything, supported or not.
    Dead,
}

/// A monitor simulated at the wire level. Each `open` of its bus gets an
/// independent clone, mirroring a fresh kernel file handle.
#[derive(Clone, Debug)]
pub struct MockMonitor {
    pub edid: Vec<u8>,
    pub dialect: Dialect,
    /// feature code -> (max, current)
    pub features: HashMap<u8, (u16, u16)>,
    pub capabilities: Option<String>,
    /// Serve this many garbage DDC replies before behaving.
    pub flaky_reads: u32,
    /// Accept set commands but never apply them.
    pub ignore_sets: bool,
    address: u16,
    edid_offset: u8,
    pending: Option<Vec<u8>>,
}

const CAPS_FRAGMENT: usize = 16;

impl MockMonitor {
    pub fn new(edid: Vec<u8>, dialect: Dialect) -> MockMonitor {
        MockMonitor {
            edid,
            dialect,
            features: HashMap::new(),
            capabilities: None,
            flaky_reads: 0,
            ignore_sets: false,
            address: 0,
            edid_offset: 0,
            pending: None,
        }
    }

    pub fn with_feature(mut self, code: u8, max: u16, current: u16) -> MockMonitor {
        self.features.insert(code, (max, current));
        self
    }

    pub fn with_capabilities(mut self, caps: &str) -> MockMonitor {
        self.capabilities = Some(caps.to_string());
        self
    }

    pub fn with_flaky_reads(mut self, count: u32) -> MockMonitor {
        self.flaky_reads = count;
        self
    }

    pub fn with_ignored_sets(mut self) -> MockMonitor {
        self.ignore_sets = true;
        self
    }

    fn null_reply() -> Vec<u8> {
        vec![0x6E, 0x80, 0x50 ^ 0x80]
    }

    fn vcp_reply(rc: u8, feature: u8, max: u16, current: u16) -> Vec<u8> {
        packet::encode(&Packet::reply(
            PacketType::VcpReply,
            vec![
                rc,
                feature,
                0x00,
                (max >> 8) as u8,
                max as u8,
                (current >> 8) as u8,
                current as u8,
            ],
        ))
        .expect("mock reply encodes")
    }

    fn caps_reply(offset: u16, data: &[u8]) -> Vec<u8> {
        let mut body = vec![(offset >> 8) as u8, offset as u8];
        body.extend_from_slice(data);
        packet::encode(&Packet::reply(PacketType::CapabilitiesReply, body))
            .expect("mock reply encodes")
    }

    fn handle_request(&mut self, request: Packet) {
        self.pending = match request.ty {
            PacketType::VcpRequest => {
                let code = request.body[0];
                if self.flaky_reads > 0 {
                    self.flaky_reads -= 1;
                    Some(vec![0x6E])
                } else if self.dialect == Dialect::Dead {
                    Some(Self::null_reply())
                } else if let Some((max, current)) = self.features.get(&code) {
                    Some(Self::vcp_reply(0x00, code, *max, *current))
                } else {
                    match self.dialect {
                        Dialect::DdcFlag => Some(Self::vcp_reply(0x01, code, 0, 0)),
                        Dialect::AllZero => Some(Self::vcp_reply(0x00, code, 0, 0)),
                        Dialect::NullResponse | Dialect::Dead => Some(Self::null_reply()),
                    }
                }
            }
            PacketType::VcpSet => {
                let code = request.body[0];
                let value = ((request.body[1] as u16) << 8) | request.body[2] as u16;
                if !self.ignore_sets {
                    if let Some(entry) = self.features.get_mut(&code) {
                        entry.1 = value;
                    }
                }
                None
            }
            PacketType::CapabilitiesRequest => {
                let offset = ((request.body[0] as u16) << 8) | request.body[1] as u16;
                match &self.capabilities {
                    Some(caps) => {
                        let bytes = caps.as_bytes();
                        let start = (offset as usize).min(bytes.len());
                        let end = (start + CAPS_FRAGMENT).min(bytes.len());
                        Some(Self::caps_reply(offset, &bytes[start..end]))
                    }
                    None => Some(Self::null_reply()),
                }
            }
            _ => None,
        };
    }
}

impl I2cIo for MockMonitor {
    fn set_slave_address(&mut self, addr: u16, _force: bool) -> io::Result<()> {
        self.address = addr;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        match self.address {
            I2C_ADDRESS_EDID => {
                self.edid_offset = data.first().copied().unwrap_or(0);
            }
            I2C_ADDRESS_DDC_CI => {
                let request = packet::decode(data).expect("host sent a well-formed packet");
                self.handle_request(request);
            }
            other => panic!("write to unexpected address {:#04x}", other),
        }
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.address {
            I2C_ADDRESS_EDID => {
                let start = (self.edid_offset as usize).min(self.edid.len());
                let n = (self.edid.len() - start).min(buf.len());
                buf[..n].copy_from_slice(&self.edid[start..start + n]);
                self.edid_offset = self.edid_offset.saturating_add(n as u8);
                Ok(n)
            }
            I2C_ADDRESS_DDC_CI => {
                let reply = self.pending.take().unwrap_or_else(MockMonitor::null_reply);
                let n = reply.len().min(buf.len());
                buf[..n].copy_from_slice(&reply[..n]);
                Ok(n)
            }
            other => panic!("read from unexpected address {:#04x}", other),
        }
    }
}

/// Bus provider serving mock monitors; every open clones the prototype.
pub struct MockBus {
    monitors: Mutex<HashMap<u32, MockMonitor>>,
}

impl MockBus {
    pub fn new(monitors: Vec<(u32, MockMonitor)>) -> MockBus {
        MockBus {
            monitors: Mutex::new(monitors.into_iter().collect()),
        }
    }
}

impl BusProvider for MockBus {
    fn scan(&self) -> BusScan {
        let mut buses: Vec<u32> = self.monitors.lock().unwrap().keys().copied().collect();
        buses.sort_unstable();
        BusScan {
            buses,
            errors: Vec::new(),
        }
    }

    fn open(&self, busno: u32) -> io::Result<Box<dyn I2cIo>> {
        let monitors = self.monitors.lock().unwrap();
        match monitors.get(&busno) {
            Some(monitor) => Ok(Box::new(monitor.clone())),
            None => Err(io::Error::from_raw_os_error(libc::ENODEV)),
        }
    }
}

/// Builds a syntactically valid 128-byte EDID for the given identity.
pub fn build_edid(mfg: &str, model: &str, product_code: u16, serial: &str) -> Vec<u8> {
    let mut edid = vec![0u8; 128];
    edid[..8].copy_from_slice(&[0x00, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0xFF, 0x00]);
    let mut mfg_value = 0u16;
    for (i, c) in mfg.bytes().take(3).enumerate() {
        mfg_value |= (((c - b'A' + 1) as u16) & 0x1F) << (10 - 5 * i);
    }
    edid[8] = (mfg_value >> 8) as u8;
    edid[9] = mfg_value as u8;
    edid[10] = product_code as u8;
    edid[11] = (product_code >> 8) as u8;
    edid[12..16].copy_from_slice(&1u32.to_le_bytes());
    edid[16] = 12;
    edid[17] = 30;
    edid[18] = 1;
    edid[19] = 4;

    fill_descriptor(&mut edid[72..90], 0xFC, model);
    fill_descriptor(&mut edid[90..108], 0xFF, serial);

    let sum: u8 = edid[..127].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    edid[127] = sum.wrapping_neg();
    edid
}

fn fill_descriptor(desc: &mut [u8], tag: u8, text: &str) {
    desc[3] = tag;
    let bytes = text.as_bytes();
    let n = bytes.len().min(13);
    desc[5..5 + n].copy_from_slice(&bytes[..n]);
    if n < 13 {
        desc[5 + n] = 0x0A;
        for b in desc[5 + n + 1..18].iter_mut() {
            *b = 0x20;
        }
    }
}
