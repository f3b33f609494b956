//#![deny(missing_docs)]

//! Query and control monitor settings using the DDC/CI protocol.
//!
//! DDC/CI commands travel over the I2C side-channel of each video
//! connector. Monitors are uncooperative peers: they NAK, time out, drop
//! bytes, misreport feature support, and want per-model pauses between
//! transactions. This crate wraps the protocol in bounded retries,
//! per-display adaptive delays, and dialect detection so callers can just
//! read and write VCP features.
//!
//! # Example
//!
//! ```rust,no_run
//! use ddctool::config::Options;
//! use ddctool::context::{Context, DisplaySelector};
//!
//! let ctx = Context::new(Options::default()).unwrap();
//! let brightness = ctx.get_vcp(&DisplaySelector::dispno(1), 0x10).unwrap();
//! println!("brightness {}/{}", brightness.value(), brightness.maximum());
//! ```

pub mod api;
pub mod caps;
pub mod commands;
pub mod config;
pub mod context;
pub mod discovery;
pub mod display;
pub mod dsa;
pub mod dumpload;
pub mod edid;
pub mod error;
pub mod locking;
pub mod packet;
pub mod retry;
pub mod state;
pub mod stats;
pub mod sysfs;
pub mod transport;
pub mod vcp;

pub use commands::{FeatureCode, TimingMessage, VcpValue};
pub use context::{Context, DisplaySelector};
pub use error::{DdcResult, ErrorInfo, Status};
pub use transport::{I2C_ADDRESS_DDC_CI, I2C_ADDRESS_EDID};

/// DDC sub-address command prefix: the host source byte on the wire.
pub const SUB_ADDRESS_DDC_CI: u8 = packet::HOST_ADDRESS;
