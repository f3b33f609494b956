//! Runtime options and the configuration file.
//!
//! The config file lives in the XDG config directory and uses INI-style
//! sections; the `[ddctool]` section's `options` line carries the same
//! vocabulary as the library option string and the CLI flags.

use std::fs;
use std::path::{Path, PathBuf};

use crate::dsa::MULTIPLIER_MAX;
use crate::edid::EDID_BLOCK_SIZE;
use crate::error::{DdcResult, ErrorInfo, Status};
use crate::retry::{RetryPolicy, TryClass};

const CONFIG_SECTION: &str = "ddctool";

/// Everything configurable at initialization time.
#[derive(Clone, Debug, PartialEq)]
pub struct Options {
    /// Per-class retry caps: write-only, write-read, multi-part.
    pub max_tries: (Option<u8>, Option<u8>, Option<u8>),
    /// Pins the DSA multiplier on every display.
    pub sleep_multiplier: Option<f64>,
    pub dynamic_sleep: bool,
    pub displays_cache: bool,
    pub capabilities_cache: bool,
    pub usb: bool,
    pub edid_read_size: usize,
    pub async_threshold: usize,
    pub verify_sets: bool,
}

impl Default for Options {
    fn default() -> Self {
        Options {
            max_tries: (None, None, None),
            sleep_multiplier: None,
            dynamic_sleep: true,
            displays_cache: true,
            capabilities_cache: true,
            usb: false,
            edid_read_size: EDID_BLOCK_SIZE,
            async_threshold: crate::discovery::DISPLAY_CHECK_ASYNC_THRESHOLD,
            verify_sets: true,
        }
    }
}

impl Options {
    /// Parses a whitespace-separated option string.
    pub fn parse(option_string: &str) -> DdcResult<Options> {
        let mut options = Options::default();
        for token in option_string.split_whitespace() {
            options.apply_token(token)?;
        }
        Ok(options)
    }

    /// Applies one option token of the shared vocabulary.
    pub fn apply_token(&mut self, token: &str) -> DdcResult<()> {
        const SITE: &str = "config::apply_token";
        let bad = |msg: String| Status::InvalidArgument(msg).at(SITE);
        match token.split_once('=') {
            Some(("maxtries", value)) => {
                let fields: Vec<&str> = value.split(',').collect();
                if fields.len() != 3 {
                    return Err(bad(format!("maxtries wants three fields: {}", value)));
                }
                let mut parsed = [None; 3];
                for (slot, field) in parsed.iter_mut().zip(&fields) {
                    if field.is_empty() || *field == "." {
                        continue;
                    }
                    let tries: u8 = field
                        .parse()
                        .map_err(|_| bad(format!("maxtries field: {}", field)))?;
                    *slot = Some(tries);
                }
                self.max_tries = (parsed[0], parsed[1], parsed[2]);
                // validate eagerly so the error points at the option
                self.to_policy()?;
            }
            Some(("sleep-multiplier", value)) => {
                let multiplier: f64 = value
                    .parse()
                    .map_err(|_| bad(format!("sleep-multiplier: {}", value)))?;
                if !(0.0..=MULTIPLIER_MAX).contains(&multiplier) {
                    return Err(bad(format!(
                        "sleep-multiplier {} outside [0.0, {}]",
                        multiplier, MULTIPLIER_MAX
                    )));
                }
                self.sleep_multiplier = Some(multiplier);
            }
            Some(("edid-read-size", value)) => match value {
                "128" => self.edid_read_size = 128,
                "256" => self.edid_read_size = 256,
                _ => return Err(bad(format!("edid-read-size must be 128 or 256: {}", value))),
            },
            Some(("async-threshold", value)) => {
                self.async_threshold = value
                    .parse()
                    .map_err(|_| bad(format!("async-threshold: {}", value)))?;
            }
            None => match token {
                "disable-dynamic-sleep" => self.dynamic_sleep = false,
                "enable-dynamic-sleep" => self.dynamic_sleep = true,
                "disable-displays-cache" => self.displays_cache = false,
                "disable-capabilities-cache" => self.capabilities_cache = false,
                "enable-usb" => self.usb = true,
                "disable-usb" => self.usb = false,
                "noverify" => self.verify_sets = false,
                "verify" => self.verify_sets = true,
                _ => return Err(bad(format!("unrecognized option: {}", token))),
            },
            Some((key, _)) => return Err(bad(format!("unrecognized option: {}", key))),
        }
        Ok(())
    }

    /// Builds the retry policy implied by `max_tries`.
    pub fn to_policy(&self) -> DdcResult<RetryPolicy> {
        let mut policy = RetryPolicy::default();
        let (write, write_read, multi) = self.max_tries;
        if let Some(tries) = write {
            policy.set_max_tries(TryClass::WriteOnly, tries)?;
            policy.set_max_tries(TryClass::ReadOnly, tries)?;
        }
        if let Some(tries) = write_read {
            policy.set_max_tries(TryClass::WriteRead, tries)?;
        }
        if let Some(tries) = multi {
            policy.set_max_tries(TryClass::MultiPartRead, tries)?;
            policy.set_max_tries(TryClass::MultiPartWrite, tries)?;
        }
        Ok(policy)
    }
}

/// `$XDG_CONFIG_HOME/ddctool/ddctoolrc` (or `~/.config/ddctool/ddctoolrc`).
pub fn default_config_path() -> Option<PathBuf> {
    let base = std::env::var_os("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .filter(|p| p.is_absolute())
        .or_else(|| std::env::var_os("HOME").map(|home| PathBuf::from(home).join(".config")))?;
    Some(base.join("ddctool/ddctoolrc"))
}

/// Reads the option tokens supplied by the config file's `[ddctool]`
/// section. A missing file yields no tokens; an unparseable file is a
/// bad-configuration-file error.
pub fn read_config_file(path: &Path) -> DdcResult<Vec<String>> {
    const SITE: &str = "config::read_config_file";
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => {
            return Err(Status::Io {
                errno: e.raw_os_error(),
                msg: format!("{}: {}", path.display(), e),
            }
            .at(SITE))
        }
    };

    let mut tokens = Vec::new();
    let mut in_section = false;
    for (lineno, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let Some(name) = rest.strip_suffix(']') else {
                return Err(Status::BadConfigurationFile(format!(
                    "{}:{}: malformed section header",
                    path.display(),
                    lineno + 1
                ))
                .at(SITE));
            };
            in_section = name.trim() == CONFIG_SECTION;
            continue;
        }
        let Some((key, value)) = line.split_once('=') else {
            return Err(Status::BadConfigurationFile(format!(
                "{}:{}: expected key = value",
                path.display(),
                lineno + 1
            ))
            .at(SITE));
        };
        if in_section && key.trim() == "options" {
            tokens.extend(value.split_whitespace().map(str::to_string));
        }
    }
    Ok(tokens)
}

/// Merges config-file options (first) with a caller option string
/// (overriding). Config-file parse errors surface as
/// bad-configuration-file.
pub fn load_options(config_path: Option<&Path>, option_string: &str) -> DdcResult<Options> {
    let mut options = Options::default();
    let path = match config_path {
        Some(path) => Some(path.to_path_buf()),
        None => default_config_path(),
    };
    if let Some(path) = path {
        for token in read_config_file(&path)? {
            options.apply_token(&token).map_err(|e| {
                ErrorInfo::with_message(
                    Status::BadConfigurationFile(format!("{}: {}", path.display(), e.message)),
                    "config::load_options",
                    e.message.clone(),
                )
            })?;
        }
    }
    for token in option_string.split_whitespace() {
        options.apply_token(token)?;
    }
    Ok(options)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_full_vocabulary() {
        let options = Options::parse(
            "maxtries=3,5,7 sleep-multiplier=2.0 disable-dynamic-sleep \
             disable-displays-cache disable-capabilities-cache enable-usb \
             edid-read-size=256",
        )
        .unwrap();
        assert_eq!(options.max_tries, (Some(3), Some(5), Some(7)));
        assert_eq!(options.sleep_multiplier, Some(2.0));
        assert!(!options.dynamic_sleep);
        assert!(!options.displays_cache);
        assert!(!options.capabilities_cache);
        assert!(options.usb);
        assert_eq!(options.edid_read_size, 256);

        let policy = options.to_policy().unwrap();
        assert_eq!(policy.max_tries(TryClass::WriteOnly), 3);
        assert_eq!(policy.max_tries(TryClass::WriteRead), 5);
        assert_eq!(policy.max_tries(TryClass::MultiPartRead), 7);
    }

    #[test]
    fn maxtries_allows_empty_positions() {
        let options = Options::parse("maxtries=,8,").unwrap();
        let policy = options.to_policy().unwrap();
        assert_eq!(
            policy.max_tries(TryClass::WriteOnly),
            TryClass::WriteOnly.default_max_tries()
        );
        assert_eq!(policy.max_tries(TryClass::WriteRead), 8);
    }

    #[test]
    fn rejects_out_of_range_values() {
        assert!(Options::parse("maxtries=0,5,5").is_err());
        assert!(Options::parse("maxtries=5,16,5").is_err());
        assert!(Options::parse("sleep-multiplier=11").is_err());
        assert!(Options::parse("edid-read-size=512").is_err());
        assert!(Options::parse("no-such-option").is_err());
    }

    #[test]
    fn reads_options_from_the_right_section() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ddctoolrc");
        fs::write(
            &path,
            "# comment\n\
             [other]\n\
             options = enable-usb\n\
             [ddctool]\n\
             options = sleep-multiplier=1.5 disable-usb\n",
        )
        .unwrap();
        let tokens = read_config_file(&path).unwrap();
        assert_eq!(tokens, vec!["sleep-multiplier=1.5", "disable-usb"]);
    }

    #[test]
    fn missing_config_file_is_fine() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(read_config_file(&tmp.path().join("absent")).unwrap().is_empty());
    }

    #[test]
    fn malformed_config_file_is_reported() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ddctoolrc");
        fs::write(&path, "[ddctool\noptions = x\n").unwrap();
        let err = read_config_file(&path).unwrap_err();
        assert!(matches!(err.status, Status::BadConfigurationFile(_)));
    }

    #[test]
    fn caller_options_override_config_file() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ddctoolrc");
        fs::write(&path, "[ddctool]\noptions = sleep-multiplier=1.5\n").unwrap();
        let options = load_options(Some(&path), "sleep-multiplier=3.0").unwrap();
        assert_eq!(options.sleep_multiplier, Some(3.0));
    }

    #[test]
    fn bad_option_in_config_file_is_bad_configuration() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ddctoolrc");
        fs::write(&path, "[ddctool]\noptions = bogus-option\n").unwrap();
        let err = load_options(Some(&path), "").unwrap_err();
        assert!(matches!(err.status, Status::BadConfigurationFile(_)));
    }
}
