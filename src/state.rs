//! Persisted per-user state: the displays cache, DSA tuning, and the
//! capabilities cache. Files live under the XDG state directory and are
//! rewritten atomically (write to a temporary, then rename).

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::dsa::TuningSnapshot;
use crate::error::{DdcResult, Status};

const DISPLAYS_FILE: &str = "displays.json";
const DSA_FILE: &str = "dsa.json";
const CAPABILITIES_FILE: &str = "capabilities.json";

/// Last-known facts about a display, keyed by EDID identity.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplayCacheEntry {
    pub busno: Option<u32>,
    pub dispno: i32,
    pub model: String,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DisplaysCache {
    pub displays: HashMap<String, DisplayCacheEntry>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct DsaCache {
    pub tuning: HashMap<String, TuningSnapshot>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct CapabilitiesCache {
    pub capabilities: HashMap<String, String>,
}

/// Handle on the state directory.
#[derive(Clone, Debug)]
pub struct StateStore {
    dir: PathBuf,
}

impl StateStore {
    /// Store under `$XDG_STATE_HOME/ddctool` (or `~/.local/state/ddctool`).
    pub fn new() -> Option<StateStore> {
        let base = std::env::var_os("XDG_STATE_HOME")
            .map(PathBuf::from)
            .filter(|p| p.is_absolute())
            .or_else(|| {
                std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".local/state"))
            })?;
        Some(StateStore {
            dir: base.join("ddctool"),
        })
    }

    /// Store rooted at an explicit directory.
    pub fn at<P: Into<PathBuf>>(dir: P) -> StateStore {
        StateStore { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn load_displays(&self) -> DdcResult<DisplaysCache> {
        self.load_json(DISPLAYS_FILE)
    }

    pub fn save_displays(&self, cache: &DisplaysCache) -> DdcResult<()> {
        self.save_json(DISPLAYS_FILE, cache)
    }

    pub fn load_dsa(&self) -> DdcResult<DsaCache> {
        self.load_json(DSA_FILE)
    }

    pub fn save_dsa(&self, cache: &DsaCache) -> DdcResult<()> {
        self.save_json(DSA_FILE, cache)
    }

    pub fn load_capabilities(&self) -> DdcResult<CapabilitiesCache> {
        self.load_json(CAPABILITIES_FILE)
    }

    pub fn save_capabilities(&self, cache: &CapabilitiesCache) -> DdcResult<()> {
        self.save_json(CAPABILITIES_FILE, cache)
    }

    fn load_json<T: Default + DeserializeOwned>(&self, name: &str) -> DdcResult<T> {
        let path = self.dir.join(name);
        let text = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(T::default()),
            Err(e) => {
                return Err(Status::Io {
                    errno: e.raw_os_error(),
                    msg: format!("{}: {}", path.display(), e),
                }
                .at("state::load"))
            }
        };
        serde_json::from_str(&text).map_err(|e| {
            Status::BadConfigurationFile(format!("{}: {}", path.display(), e)).at("state::load")
        })
    }

    fn save_json<T: Serialize>(&self, name: &str, value: &T) -> DdcResult<()> {
        const SITE: &str = "state::save";
        let io_err = |path: &Path, e: std::io::Error| {
            Status::Io {
                errno: e.raw_os_error(),
                msg: format!("{}: {}", path.display(), e),
            }
            .at(SITE)
        };
        fs::create_dir_all(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let mut tmp =
            tempfile::NamedTempFile::new_in(&self.dir).map_err(|e| io_err(&self.dir, e))?;
        let text = serde_json::to_string_pretty(value)
            .map_err(|e| Status::InvalidArgument(format!("serialize {}: {}", name, e)).at(SITE))?;
        tmp.write_all(text.as_bytes())
            .map_err(|e| io_err(tmp.path(), e))?;
        let path = self.dir.join(name);
        tmp.persist(&path)
            .map_err(|e| io_err(&path, e.error))?;
        Ok(())
    }
}
