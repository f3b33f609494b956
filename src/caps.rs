//! Capabilities string parsing.
//!
//! Monitors return an ASCII property list shaped like
//! `(prot(monitor)type(lcd)cmds(01 02 03)vcp(02 04 10 14(05 08) 60(01 0F)))`.
//! Real strings are frequently sloppy; the parser preserves unknown
//! properties verbatim, records malformed subtrees with their byte offset,
//! and merges duplicate top-level properties instead of rejecting them.

use std::collections::BTreeMap;

use crate::commands::FeatureCode;
use crate::error::{DdcResult, Status};

/// Legal values for one VCP feature.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FeatureValues {
    /// No enumeration given; the feature takes any value in range.
    Continuous,
    Enumerated(Vec<u8>),
}

/// A problem found while parsing; the surrounding parse continues.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CapIssue {
    pub offset: usize,
    pub message: String,
}

/// Parsed capabilities tree.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Capabilities {
    /// Raw value text per top-level property, unknown properties included.
    pub properties: BTreeMap<String, String>,
    /// The decoded `vcp` subtree.
    pub vcp: BTreeMap<FeatureCode, FeatureValues>,
    pub issues: Vec<CapIssue>,
}

impl Capabilities {
    pub fn mccs_version(&self) -> Option<&str> {
        self.properties.get("mccs_ver").map(String::as_str)
    }

    pub fn supports_feature(&self, code: FeatureCode) -> bool {
        self.vcp.contains_key(&code)
    }

    pub fn feature_values(&self, code: FeatureCode) -> Option<&FeatureValues> {
        self.vcp.get(&code)
    }
}

struct Parser<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Parser<'a> {
    fn peek(&self) -> Option<u8> {
        self.bytes.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let b = self.peek()?;
        self.pos += 1;
        Some(b)
    }

    fn skip_whitespace(&mut self) {
        while matches!(self.peek(), Some(b) if b.is_ascii_whitespace()) {
            self.pos += 1;
        }
    }

    fn atom(&mut self) -> &'a str {
        let start = self.pos;
        while matches!(self.peek(), Some(b) if !b.is_ascii_whitespace() && b != b'(' && b != b')')
        {
            self.pos += 1;
        }
        std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or("")
    }

    /// Consumes a balanced `(...)` group, returning the inner text.
    /// An unbalanced group runs to end of input and is reported by the
    /// caller.
    fn group(&mut self) -> (&'a str, bool) {
        debug_assert_eq!(self.peek(), Some(b'('));
        self.pos += 1;
        let start = self.pos;
        let mut depth = 1usize;
        while let Some(b) = self.bump() {
            match b {
                b'(' => depth += 1,
                b')' => {
                    depth -= 1;
                    if depth == 0 {
                        let inner = &self.bytes[start..self.pos - 1];
                        return (std::str::from_utf8(inner).unwrap_or(""), true);
                    }
                }
                _ => {}
            }
        }
        (
            std::str::from_utf8(&self.bytes[start..self.pos]).unwrap_or(""),
            false,
        )
    }
}

/// Parses a capabilities string into a property tree.
///
/// Fails only when no parenthesized property list is present at all;
/// every lesser problem is recorded in [`Capabilities::issues`].
pub fn parse_capabilities(input: &str) -> DdcResult<Capabilities> {
    let mut caps = Capabilities::default();

    let mut parser = Parser {
        bytes: input.as_bytes(),
        pos: 0,
    };

    // some monitors prepend garbage before the opening paren
    while matches!(parser.peek(), Some(b) if b != b'(') {
        parser.pos += 1;
    }
    if parser.peek().is_none() {
        return Err(
            Status::InvalidResponse("capabilities string has no property list")
                .at("caps::parse_capabilities"),
        );
    }
    let leading = parser.pos;
    if leading > 0 {
        caps.issues.push(CapIssue {
            offset: 0,
            message: format!("{} bytes before property list ignored", leading),
        });
    }
    let (top, balanced) = parser.group();
    if !balanced {
        caps.issues.push(CapIssue {
            offset: leading,
            message: "unterminated property list".into(),
        });
    }

    let mut inner = Parser {
        bytes: top.as_bytes(),
        pos: 0,
    };
    loop {
        inner.skip_whitespace();
        if inner.peek().is_none() {
            break;
        }
        let name_offset = leading + 1 + inner.pos;
        if inner.peek() == Some(b'(') {
            let (skipped, _) = inner.group();
            caps.issues.push(CapIssue {
                offset: name_offset,
                message: format!("value without property name: ({})", skipped),
            });
            continue;
        }
        let name = inner.atom().to_string();
        inner.skip_whitespace();
        let value_offset = leading + 1 + inner.pos;
        let value = if inner.peek() == Some(b'(') {
            let (value, balanced) = inner.group();
            if !balanced {
                caps.issues.push(CapIssue {
                    offset: value_offset,
                    message: format!("unterminated value for property {}", name),
                });
            }
            value.to_string()
        } else {
            String::new()
        };

        if name == "vcp" {
            parse_vcp_subtree(&value, value_offset + 1, &mut caps);
        }
        // duplicate top-level properties merge
        if let Some(existing) = caps.properties.get_mut(&name) {
            if !value.is_empty() {
                if !existing.is_empty() {
                    existing.push(' ');
                }
                existing.push_str(&value);
            }
        } else {
            caps.properties.insert(name, value);
        }
    }

    Ok(caps)
}

fn parse_vcp_subtree(text: &str, base_offset: usize, caps: &mut Capabilities) {
    let mut parser = Parser {
        bytes: text.as_bytes(),
        pos: 0,
    };
    loop {
        parser.skip_whitespace();
        if parser.peek().is_none() {
            break;
        }
        let code_offset = base_offset + parser.pos;
        if parser.peek() == Some(b'(') {
            let (skipped, _) = parser.group();
            caps.issues.push(CapIssue {
                offset: code_offset,
                message: format!("value list without a feature code: ({})", skipped),
            });
            continue;
        }
        let code_text = parser.atom();
        let code = match u8::from_str_radix(code_text, 16) {
            Ok(code) => code,
            Err(_) => {
                caps.issues.push(CapIssue {
                    offset: code_offset,
                    message: format!("unparseable feature code: {}", code_text),
                });
                // skip a value list attached to the bad code
                parser.skip_whitespace();
                if parser.peek() == Some(b'(') {
                    parser.group();
                }
                continue;
            }
        };

        parser.skip_whitespace();
        let values = if parser.peek() == Some(b'(') {
            let list_offset = base_offset + parser.pos;
            let (list, balanced) = parser.group();
            if !balanced {
                caps.issues.push(CapIssue {
                    offset: list_offset,
                    message: format!("unterminated value list for feature {:02x}", code),
                });
            }
            let mut values = Vec::new();
            let mut ok = true;
            for token in list.split_ascii_whitespace() {
                match u8::from_str_radix(token, 16) {
                    Ok(v) => values.push(v),
                    Err(_) => {
                        caps.issues.push(CapIssue {
                            offset: list_offset,
                            message: format!(
                                "unparseable value {} for feature {:02x}",
                                token, code
                            ),
                        });
                        ok = false;
                    }
                }
            }
            if ok || !values.is_empty() {
                FeatureValues::Enumerated(values)
            } else {
                FeatureValues::Continuous
            }
        } else {
            FeatureValues::Continuous
        };

        // duplicate feature codes union their enumerations
        match (caps.vcp.get_mut(&code), values) {
            (Some(FeatureValues::Enumerated(existing)), FeatureValues::Enumerated(new)) => {
                for v in new {
                    if !existing.contains(&v) {
                        existing.push(v);
                    }
                }
            }
            (Some(_), _) => {}
            (None, values) => {
                caps.vcp.insert(code, values);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TYPICAL: &str = "(prot(monitor)type(lcd)model(P2411H)\
cmds(01 02 03 07 0C E3 F3)\
vcp(02 04 05 08 10 12 14(05 08 0B) 16 18 1A 60(01 0F 11))\
mccs_ver(2.1))";

    #[test]
    fn parses_typical_string() {
        let caps = parse_capabilities(TYPICAL).unwrap();
        assert_eq!(caps.properties["model"], "P2411H");
        assert_eq!(caps.mccs_version(), Some("2.1"));
        assert!(caps.supports_feature(0x10));
        assert_eq!(
            caps.feature_values(0x14),
            Some(&FeatureValues::Enumerated(vec![0x05, 0x08, 0x0B]))
        );
        assert_eq!(caps.feature_values(0x10), Some(&FeatureValues::Continuous));
        assert!(caps.issues.is_empty());
    }

    #[test]
    fn unknown_properties_are_preserved_opaque() {
        let caps = parse_capabilities("(vdif(0001)whatever(a b (c d))vcp(10))").unwrap();
        assert_eq!(caps.properties["vdif"], "0001");
        assert_eq!(caps.properties["whatever"], "a b (c d)");
    }

    #[test]
    fn leading_garbage_is_skipped_and_recorded() {
        let caps = parse_capabilities("\u{1}\u{2}junk(type(lcd)vcp(10))").unwrap();
        assert_eq!(caps.properties["type"], "lcd");
        assert!(!caps.issues.is_empty());
    }

    #[test]
    fn malformed_feature_code_is_recorded_not_fatal() {
        let caps = parse_capabilities("(vcp(10 ZZ(01 02) 12))").unwrap();
        assert!(caps.supports_feature(0x10));
        assert!(caps.supports_feature(0x12));
        assert_eq!(caps.vcp.len(), 2);
        assert!(caps.issues.iter().any(|i| i.message.contains("ZZ")));
    }

    #[test]
    fn duplicate_top_level_properties_merge() {
        let caps = parse_capabilities("(vcp(10 12)vcp(12 14(01 02)))").unwrap();
        assert!(caps.supports_feature(0x10));
        assert!(caps.supports_feature(0x12));
        assert_eq!(
            caps.feature_values(0x14),
            Some(&FeatureValues::Enumerated(vec![0x01, 0x02]))
        );
    }

    #[test]
    fn unterminated_list_is_tolerated() {
        let caps = parse_capabilities("(type(lcd)vcp(10 12").unwrap();
        assert!(caps.supports_feature(0x12));
        assert!(caps
            .issues
            .iter()
            .any(|i| i.message.contains("unterminated")));
    }

    #[test]
    fn no_property_list_at_all_is_an_error() {
        let err = parse_capabilities("garbage with no parens").unwrap_err();
        assert!(matches!(err.status, Status::InvalidResponse(_)));
    }

    #[test]
    fn issue_offsets_point_into_the_input() {
        let input = "(vcp(10 ZZ 12))";
        let caps = parse_capabilities(input).unwrap();
        let issue = caps.issues.iter().find(|i| i.message.contains("ZZ")).unwrap();
        assert_eq!(&input[issue.offset..issue.offset + 2], "ZZ");
    }
}
