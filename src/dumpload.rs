//! VCP profile files: the dumpvcp/loadvcp text format.
//!
//! A profile captures identity header lines followed by `VCP <code>
//! <value>` entries, one feature per line:
//!
//! ```text
//! TIMESTAMP 2024-03-01T10:15:00
//! MFG_ID DEL
//! MODEL P2411H
//! SN ABC123
//! EDID 00ffffffffffff00...
//! VCP 10 50
//! VCP 12 37
//! ```

use std::fmt::Write as _;

use crate::commands::FeatureCode;
use crate::display::DisplayRef;
use crate::error::{DdcResult, Status};

/// Feature codes captured by a profile dump: luminance, contrast, select
/// color preset, and the RGB gains.
pub const PROFILE_FEATURES: [FeatureCode; 6] = [0x10, 0x12, 0x14, 0x16, 0x18, 0x1A];

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct VcpProfile {
    pub timestamp: Option<String>,
    pub mfg_id: String,
    pub model: String,
    pub serial_ascii: String,
    /// Hex rendering of the raw EDID block, if known.
    pub edid_hex: Option<String>,
    pub values: Vec<(FeatureCode, u16)>,
}

impl VcpProfile {
    pub fn for_display(dref: &DisplayRef, timestamp: Option<String>) -> VcpProfile {
        VcpProfile {
            timestamp,
            mfg_id: dref.edid.mfg_id.clone(),
            model: dref.edid.model_name.clone(),
            serial_ascii: dref.edid.serial_ascii.clone(),
            edid_hex: Some(hex_encode(&dref.edid.raw)),
            values: Vec::new(),
        }
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        if let Some(ts) = &self.timestamp {
            let _ = writeln!(out, "TIMESTAMP {}", ts);
        }
        let _ = writeln!(out, "MFG_ID {}", self.mfg_id);
        let _ = writeln!(out, "MODEL {}", self.model);
        let _ = writeln!(out, "SN {}", self.serial_ascii);
        if let Some(edid) = &self.edid_hex {
            let _ = writeln!(out, "EDID {}", edid);
        }
        for (code, value) in &self.values {
            let _ = writeln!(out, "VCP {:02X} {}", code, value);
        }
        out
    }

    pub fn parse(text: &str) -> DdcResult<VcpProfile> {
        const SITE: &str = "dumpload::parse";
        let bad =
            |lineno: usize, msg: String| Status::InvalidArgument(format!("line {}: {}", lineno, msg)).at(SITE);
        let mut profile = VcpProfile::default();
        for (index, raw) in text.lines().enumerate() {
            let lineno = index + 1;
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let (keyword, rest) = line.split_once(char::is_whitespace).unwrap_or((line, ""));
            let rest = rest.trim();
            match keyword {
                "TIMESTAMP" => profile.timestamp = Some(rest.to_string()),
                "MFG_ID" => profile.mfg_id = rest.to_string(),
                "MODEL" => profile.model = rest.to_string(),
                "SN" => profile.serial_ascii = rest.to_string(),
                "EDID" => profile.edid_hex = Some(rest.to_ascii_lowercase()),
                "VCP" => {
                    let mut fields = rest.split_whitespace();
                    let code = fields
                        .next()
                        .and_then(|c| u8::from_str_radix(c, 16).ok())
                        .ok_or_else(|| bad(lineno, format!("bad VCP feature code: {}", rest)))?;
                    let value = fields
                        .next()
                        .and_then(|v| v.parse::<u16>().ok())
                        .ok_or_else(|| bad(lineno, format!("bad VCP value: {}", rest)))?;
                    if fields.next().is_some() {
                        return Err(bad(lineno, format!("trailing fields: {}", rest)));
                    }
                    profile.values.push((code, value));
                }
                _ => return Err(bad(lineno, format!("unrecognized keyword: {}", keyword))),
            }
        }
        if profile.values.is_empty() {
            return Err(Status::InvalidArgument("profile contains no VCP values".into()).at(SITE));
        }
        Ok(profile)
    }

    /// True when this profile's identity lines match the given display.
    pub fn matches_display(&self, dref: &DisplayRef) -> bool {
        self.mfg_id == dref.edid.mfg_id
            && self.model == dref.edid.model_name
            && self.serial_ascii == dref.edid.serial_ascii
    }

    /// Generated file name: `<model>-<serial>-<timestamp>.vcp`, blanks
    /// replaced with underscores.
    pub fn default_filename(&self, timestamp: &str) -> String {
        let name = format!("{}-{}-{}.vcp", self.model, self.serial_ascii, timestamp);
        name.replace(' ', "_")
    }
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

/// Parses a hex string into bytes (for `--edid` selection and profile
/// EDID lines).
pub fn hex_decode(text: &str) -> DdcResult<Vec<u8>> {
    const SITE: &str = "dumpload::hex_decode";
    let text: String = text.chars().filter(|c| !c.is_whitespace()).collect();
    if text.len() % 2 != 0 {
        return Err(Status::InvalidArgument("odd-length hex string".into()).at(SITE));
    }
    (0..text.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&text[i..i + 2], 16)
                .map_err(|_| Status::InvalidArgument(format!("bad hex at offset {}", i)).at(SITE))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::display::IoPath;
    use crate::edid::testing::build_edid;
    use crate::edid::ParsedEdid;

    fn dref() -> DisplayRef {
        let edid = ParsedEdid::parse(&build_edid("DEL", "P2411H", 7, "ABC123")).unwrap();
        DisplayRef::new(IoPath::I2c { busno: 5 }, edid)
    }

    #[test]
    fn render_parse_round_trip() {
        let mut profile = VcpProfile::for_display(&dref(), Some("2024-03-01T10:15:00".into()));
        profile.values = vec![(0x10, 80), (0x12, 55)];
        let text = profile.render();
        let back = VcpProfile::parse(&text).unwrap();
        assert_eq!(back, profile);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(VcpProfile::parse("WHAT is this\n").is_err());
        assert!(VcpProfile::parse("VCP zz 10\n").is_err());
        assert!(VcpProfile::parse("MFG_ID DEL\n").is_err()); // no values
    }

    #[test]
    fn identity_match() {
        let d = dref();
        let mut profile = VcpProfile::for_display(&d, None);
        profile.values.push((0x10, 1));
        assert!(profile.matches_display(&d));
        profile.serial_ascii = "OTHER".into();
        assert!(!profile.matches_display(&d));
    }

    #[test]
    fn default_filename_replaces_blanks() {
        let profile = VcpProfile {
            model: "My Monitor".into(),
            serial_ascii: "S 1".into(),
            ..VcpProfile::default()
        };
        assert_eq!(
            profile.default_filename("20240301"),
            "My_Monitor-S_1-20240301.vcp"
        );
    }

    #[test]
    fn hex_decode_round_trips() {
        assert_eq!(hex_decode("00ff10").unwrap(), vec![0x00, 0xFF, 0x10]);
        assert!(hex_decode("0f0").is_err());
        assert!(hex_decode("zz").is_err());
    }
}
