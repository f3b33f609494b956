//! Connector metadata from the sysfs tree.
//!
//! The phantom filter needs three facts about an I2C bus's connector: its
//! `status` and `enabled` attributes and whether an `edid` attribute is
//! exposed. The root is overridable so tests can point at a fixture tree.

use std::fs;
use std::path::{Path, PathBuf};

/// A view over `/sys` (or a test fixture standing in for it).
#[derive(Clone, Debug)]
pub struct SysfsView {
    root: PathBuf,
}

impl Default for SysfsView {
    fn default() -> Self {
        SysfsView {
            root: PathBuf::from("/sys"),
        }
    }
}

impl SysfsView {
    pub fn new() -> SysfsView {
        SysfsView::default()
    }

    pub fn with_root<P: Into<PathBuf>>(root: P) -> SysfsView {
        SysfsView { root: root.into() }
    }

    /// Resolves `<root>/bus/i2c/devices/i2c-N/device` to its real path.
    pub fn connector_dir(&self, busno: u32) -> Option<PathBuf> {
        let device = self
            .root
            .join(format!("bus/i2c/devices/i2c-{}/device", busno));
        fs::canonicalize(device).ok()
    }

    /// Reads a small text attribute, trimmed of trailing whitespace.
    pub fn attr_text(&self, dir: &Path, name: &str) -> Option<String> {
        fs::read_to_string(dir.join(name))
            .ok()
            .map(|s| s.trim_end().to_string())
    }

    pub fn has_attr(&self, dir: &Path, name: &str) -> bool {
        dir.join(name).exists()
    }
}
