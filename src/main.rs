use std::fmt;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use clap::{Parser, Subcommand};

use ddctool::caps::FeatureValues;
use ddctool::config::{self, Options};
use ddctool::context::{Context, DisplaySelector};
use ddctool::display::{DISPNO_BUSY, DISPNO_PHANTOM, DISPNO_REMOVED};
use ddctool::dumpload::{hex_decode, VcpProfile, PROFILE_FEATURES};
use ddctool::error::{ErrorInfo, Status};

#[derive(Debug, Parser)]
#[command(name = "ddctool")]
#[command(about = "Query and set monitor settings using DDC/CI", version)]
struct Cli {
    /// I2C bus number of the target display.
    #[arg(long, global = true)]
    bus: Option<u32>,

    /// Display number assigned during detection.
    #[arg(long, global = true)]
    display: Option<i32>,

    /// Hex EDID of the target display.
    #[arg(long, global = true)]
    edid: Option<String>,

    /// Manufacturer id filter (3 letters).
    #[arg(long, global = true)]
    mfg: Option<String>,

    /// Model name filter.
    #[arg(long, global = true)]
    model: Option<String>,

    /// Serial number filter.
    #[arg(long, global = true)]
    sn: Option<String>,

    /// Retry caps as write,write-read,multi-part (e.g. 4,6,8).
    #[arg(long, global = true)]
    maxtries: Option<String>,

    /// Pin the per-display sleep multiplier.
    #[arg(long, global = true)]
    sleep_multiplier: Option<f64>,

    /// Freeze dynamic sleep adjustment.
    #[arg(long, global = true)]
    disable_dynamic_sleep: bool,

    /// Ignore the persisted displays cache.
    #[arg(long, global = true)]
    disable_displays_cache: bool,

    /// Ignore the persisted capabilities cache.
    #[arg(long, global = true)]
    disable_capabilities_cache: bool,

    /// Detect USB-connected monitors.
    #[arg(long, global = true)]
    enable_usb: bool,

    /// Never probe USB devices.
    #[arg(long, global = true)]
    disable_usb: bool,

    /// Bytes of EDID to request (128 or 256).
    #[arg(long, global = true)]
    edid_read_size: Option<usize>,

    /// Skip read-back verification after setvcp.
    #[arg(long, global = true)]
    noverify: bool,

    /// Report retry statistics before exiting.
    #[arg(long, global = true)]
    stats: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List attached displays.
    Detect,
    /// Report one or more VCP feature values.
    Getvcp {
        /// Feature codes in hex (e.g. 10 or 0x10).
        #[arg(required = true)]
        features: Vec<String>,
    },
    /// Set a VCP feature value.
    Setvcp {
        /// Feature code in hex.
        feature: String,
        /// New value, decimal or 0x-prefixed hex.
        value: String,
    },
    /// Show the monitor's capabilities string.
    Capabilities,
    /// Save profile-related feature values to a file.
    Dumpvcp {
        /// Output file; generated from model and serial when omitted.
        file: Option<PathBuf>,
    },
    /// Restore feature values saved by dumpvcp.
    Loadvcp { file: PathBuf },
}

enum CliError {
    Ddc(ErrorInfo),
    Usage(String),
    Other(anyhow::Error),
}

impl From<ErrorInfo> for CliError {
    fn from(err: ErrorInfo) -> Self {
        CliError::Ddc(err)
    }
}

impl From<anyhow::Error> for CliError {
    fn from(err: anyhow::Error) -> Self {
        CliError::Other(err)
    }
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            CliError::Ddc(err) => write!(f, "{}", err.message),
            CliError::Usage(msg) => write!(f, "{}", msg),
            CliError::Other(err) => write!(f, "{:#}", err),
        }
    }
}

impl CliError {
    fn exit_code(&self) -> u8 {
        match self {
            CliError::Usage(_) => 2,
            CliError::Other(_) => 1,
            CliError::Ddc(err) => match err.status {
                Status::InvalidArgument(_) | Status::BadConfigurationFile(_) => 2,
                Status::DisplayNotFound | Status::DisplayRemoved => 3,
                Status::ReportedUnsupported | Status::DeterminedUnsupported => 4,
                Status::DisplayBusy => 5,
                _ => 1,
            },
        }
    }
}

fn main() -> ExitCode {
    env_logger::init();
    let cli = Cli::parse();
    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("ddctool: {}", err);
            if let CliError::Ddc(info) = &err {
                if !info.causes.is_empty() {
                    eprint!("{}", info.causes_tree());
                }
            }
            ExitCode::from(err.exit_code())
        }
    }
}

fn run(cli: &Cli) -> Result<(), CliError> {
    let options = build_options(cli)?;
    let selector = build_selector(cli)?;
    let ctx = Context::new(options)?;

    let result = match &cli.command {
        Command::Detect => cmd_detect(&ctx),
        Command::Getvcp { features } => cmd_getvcp(&ctx, &selector, features),
        Command::Setvcp { feature, value } => cmd_setvcp(&ctx, &selector, feature, value),
        Command::Capabilities => cmd_capabilities(&ctx, &selector),
        Command::Dumpvcp { file } => cmd_dumpvcp(&ctx, &selector, file.as_deref()),
        Command::Loadvcp { file } => cmd_loadvcp(&ctx, cli, file),
    };

    if cli.stats {
        print_stats(&ctx);
    }
    let teardown = ctx.teardown().map_err(CliError::from);
    result.and(teardown)
}

fn build_options(cli: &Cli) -> Result<Options, CliError> {
    let mut options = config::load_options(None, "")?;
    if let Some(maxtries) = &cli.maxtries {
        options.apply_token(&format!("maxtries={}", maxtries))?;
    }
    if let Some(multiplier) = cli.sleep_multiplier {
        options.apply_token(&format!("sleep-multiplier={}", multiplier))?;
    }
    if let Some(size) = cli.edid_read_size {
        options.apply_token(&format!("edid-read-size={}", size))?;
    }
    if cli.disable_dynamic_sleep {
        options.dynamic_sleep = false;
    }
    if cli.disable_displays_cache {
        options.displays_cache = false;
    }
    if cli.disable_capabilities_cache {
        options.capabilities_cache = false;
    }
    if cli.enable_usb {
        options.usb = true;
    }
    if cli.disable_usb {
        options.usb = false;
    }
    if cli.noverify {
        options.verify_sets = false;
    }
    Ok(options)
}

fn build_selector(cli: &Cli) -> Result<DisplaySelector, CliError> {
    Ok(DisplaySelector {
        dispno: cli.display,
        busno: cli.bus,
        edid: match &cli.edid {
            Some(hex) => Some(hex_decode(hex)?),
            None => None,
        },
        mfg: cli.mfg.clone(),
        model: cli.model.clone(),
        serial: cli.sn.clone(),
    })
}

fn parse_feature(text: &str) -> Result<u8, CliError> {
    let digits = text
        .strip_prefix("0x")
        .or_else(|| text.strip_prefix("0X"))
        .or_else(|| text.strip_prefix('x'))
        .unwrap_or(text);
    u8::from_str_radix(digits, 16)
        .map_err(|_| CliError::Usage(format!("bad feature code: {}", text)))
}

fn parse_value(text: &str) -> Result<u16, CliError> {
    let parsed = if let Some(hex) = text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        u16::from_str_radix(hex, 16)
    } else {
        text.parse()
    };
    parsed.map_err(|_| CliError::Usage(format!("bad value: {}", text)))
}

fn cmd_detect(ctx: &Context) -> Result<(), CliError> {
    let registry = ctx.registry();
    for dref in registry.displays() {
        match dref.dispno() {
            dispno if dispno > 0 => {
                println!("Display {}", dispno);
                println!("   I2C bus:  {}", dref.io_path);
            }
            DISPNO_PHANTOM => {
                println!("Phantom display");
                println!("   I2C bus:  {}", dref.io_path);
                if let Some(actual) = dref.phantom_of() {
                    let real = &registry.displays()[actual];
                    println!("   Duplicate of: {}", real.io_path);
                }
            }
            DISPNO_BUSY => {
                println!("Busy display");
                println!("   I2C bus:  {}", dref.io_path);
            }
            DISPNO_REMOVED => {
                println!("Removed display");
                println!("   I2C bus:  {}", dref.io_path);
            }
            _ => {
                println!("Invalid display");
                println!("   I2C bus:  {}", dref.io_path);
            }
        }
        println!("   Mfg id:   {}", dref.edid.mfg_id);
        println!("   Model:    {}", dref.edid.model_name);
        println!("   Serial:   {}", dref.edid.serial_ascii);
        println!("   Product:  {:#06x}", dref.edid.product_code);
    }
    if registry.displays().is_empty() {
        println!("No displays found");
    }
    for err in &registry.open_errors {
        eprintln!("Unable to open {}: {}", err.io_path, err.message);
    }
    Ok(())
}

fn cmd_getvcp(
    ctx: &Context,
    selector: &DisplaySelector,
    features: &[String],
) -> Result<(), CliError> {
    let mut failures = 0usize;
    let mut last_error = None;
    for text in features {
        let code = parse_feature(text)?;
        let label = match feature_name(code) {
            Some(name) => format!("VCP code {:#04x} ({})", code, name),
            None => format!("VCP code {:#04x}", code),
        };
        match ctx.get_vcp(selector, code) {
            Ok(value) => println!(
                "{}: current value = {}, max value = {}",
                label,
                value.value(),
                value.maximum()
            ),
            Err(err) => {
                match err.status {
                    Status::ReportedUnsupported | Status::DeterminedUnsupported => {
                        println!("{}: unsupported feature", label)
                    }
                    _ => println!("{}: {}", label, err.message),
                }
                failures += 1;
                last_error = Some(err);
            }
        }
    }
    match last_error {
        Some(err) if failures == features.len() => Err(err.into()),
        _ => Ok(()),
    }
}

fn cmd_setvcp(
    ctx: &Context,
    selector: &DisplaySelector,
    feature: &str,
    value: &str,
) -> Result<(), CliError> {
    let code = parse_feature(feature)?;
    let value = parse_value(value)?;
    ctx.set_vcp(selector, code, value)?;
    Ok(())
}

fn cmd_capabilities(ctx: &Context, selector: &DisplaySelector) -> Result<(), CliError> {
    let caps = ctx.capabilities(selector)?;
    if let Some(model) = caps.properties.get("model") {
        println!("Model: {}", model);
    }
    if let Some(version) = caps.mccs_version() {
        println!("MCCS version: {}", version);
    }
    println!("VCP features:");
    for (code, values) in &caps.vcp {
        let name = feature_name(*code).unwrap_or("unrecognized feature");
        match values {
            FeatureValues::Continuous => println!("   Feature {:#04x} ({})", code, name),
            FeatureValues::Enumerated(values) => {
                let list: Vec<String> = values.iter().map(|v| format!("{:#04x}", v)).collect();
                println!("   Feature {:#04x} ({}): {}", code, name, list.join(" "));
            }
        }
    }
    for issue in &caps.issues {
        eprintln!(
            "Capabilities string problem at offset {}: {}",
            issue.offset, issue.message
        );
    }
    Ok(())
}

fn cmd_dumpvcp(
    ctx: &Context,
    selector: &DisplaySelector,
    file: Option<&std::path::Path>,
) -> Result<(), CliError> {
    let dref = ctx.resolve(selector)?;
    let timestamp = unix_timestamp();
    let mut profile = VcpProfile::for_display(dref, Some(timestamp.clone()));
    for code in PROFILE_FEATURES {
        match ctx.get_vcp(selector, code) {
            Ok(value) => profile.values.push((code, value.value())),
            Err(err)
                if matches!(
                    err.status,
                    Status::ReportedUnsupported | Status::DeterminedUnsupported
                ) => {}
            Err(err) => return Err(err.into()),
        }
    }
    let path = match file {
        Some(path) => path.to_path_buf(),
        None => PathBuf::from(profile.default_filename(&timestamp)),
    };
    std::fs::write(&path, profile.render())
        .with_context(|| format!("writing {}", path.display()))
        .map_err(CliError::from)?;
    println!("Wrote {}", path.display());
    Ok(())
}

fn cmd_loadvcp(ctx: &Context, cli: &Cli, file: &std::path::Path) -> Result<(), CliError> {
    let text = std::fs::read_to_string(file)
        .with_context(|| format!("reading {}", file.display()))
        .map_err(CliError::from)?;
    let profile = VcpProfile::parse(&text)?;

    // an explicit selector wins; otherwise find the display the profile
    // was captured from
    let explicit = cli.bus.is_some() || cli.display.is_some() || cli.edid.is_some();
    let selector = if explicit {
        build_selector(cli)?
    } else {
        DisplaySelector {
            mfg: Some(profile.mfg_id.clone()),
            model: Some(profile.model.clone()),
            serial: Some(profile.serial_ascii.clone()),
            ..DisplaySelector::default()
        }
    };
    let dref = ctx.resolve(&selector)?;
    if !profile.matches_display(dref) {
        eprintln!(
            "Warning: profile was saved from {} {} {}, target is {} {} {}",
            profile.mfg_id,
            profile.model,
            profile.serial_ascii,
            dref.edid.mfg_id,
            dref.edid.model_name,
            dref.edid.serial_ascii
        );
    }
    for (code, value) in &profile.values {
        ctx.set_vcp(&selector, *code, *value)?;
    }
    Ok(())
}

fn print_stats(ctx: &Context) {
    println!("Retry statistics:");
    for snapshot in ctx.stats().snapshot() {
        if snapshot.successes == 0 && snapshot.failed == 0 {
            continue;
        }
        println!(
            "   {:16} attempts: {:4}  ok: {:4}  failed: {:4}  elapsed: {:?}",
            snapshot.class.label(),
            snapshot.attempts,
            snapshot.successes,
            snapshot.failed,
            snapshot.elapsed
        );
        for (tries, count) in snapshot.histogram.iter().enumerate().skip(1) {
            if *count > 0 {
                println!("      {:2} tries: {}", tries, count);
            }
        }
    }
}

fn unix_timestamp() -> String {
    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    secs.to_string()
}

/// A few well-known VCP feature names for readable output. The complete
/// MCCS dictionary is out of scope.
fn feature_name(code: u8) -> Option<&'static str> {
    Some(match code {
        0x02 => "New control value",
        0x04 => "Restore factory defaults",
        0x05 => "Restore factory brightness/contrast",
        0x08 => "Restore factory color defaults",
        0x10 => "Brightness",
        0x12 => "Contrast",
        0x14 => "Select color preset",
        0x16 => "Video gain: Red",
        0x18 => "Video gain: Green",
        0x1A => "Video gain: Blue",
        0x60 => "Input Source",
        0x62 => "Audio speaker volume",
        0xAC => "Horizontal frequency",
        0xAE => "Vertical frequency",
        0xB6 => "Display technology type",
        0xC0 => "Display usage time",
        0xC8 => "Display controller type",
        0xC9 => "Display firmware level",
        0xCA => "OSD",
        0xCC => "OSD Language",
        0xD6 => "Power mode",
        0xDF => "VCP Version",
        _ => return None,
    })
}
