//! I2C transport: bus handles, slave-address selection, raw read/write, and
//! classification of OS errors into the protocol error taxonomy.

use std::cmp;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

use i2c_linux::{I2c, Message};
use resize_slice::ResizeSlice;

use crate::error::Status;

/// EDID EEPROM I2C address.
pub const I2C_ADDRESS_EDID: u16 = 0x50;

/// DDC/CI command and control I2C address.
pub const I2C_ADDRESS_DDC_CI: u16 = 0x37;

/// Raw I2C operations the protocol engine is written against.
///
/// Production code talks to `/dev/i2c-N` through [`I2cDevice`]; tests drive
/// the engine with scripted implementations.
pub trait I2cIo: Send {
    /// Selects the 7-bit slave address for subsequent transfers. The
    /// `force` variant takes the address even if another kernel driver owns
    /// it; callers only force after a normal attempt returned EBUSY.
    fn set_slave_address(&mut self, addr: u16, force: bool) -> io::Result<()>;

    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;
}

/// An open `/dev/i2c-N` device node.
pub struct I2cDevice {
    inner: I2c<File>,
    path: PathBuf,
    address: u16,
}

impl I2cDevice {
    /// Opens the device node for the given bus number.
    pub fn open(busno: u32) -> io::Result<I2cDevice> {
        I2cDevice::from_path(format!("/dev/i2c-{}", busno))
    }

    pub fn from_path<P: AsRef<Path>>(p: P) -> io::Result<I2cDevice> {
        let path = p.as_ref().to_path_buf();
        Ok(I2cDevice {
            inner: I2c::from_path(&path)?,
            path,
            address: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl I2cIo for I2cDevice {
    fn set_slave_address(&mut self, addr: u16, force: bool) -> io::Result<()> {
        self.inner.smbus_set_slave_address(addr, force)?;
        self.address = addr;
        Ok(())
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.inner.i2c_transfer(&mut [Message::Write {
            address: self.address,
            data,
            flags: Default::default(),
        }])?;
        Ok(data.len())
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut msgs = [Message::Read {
            address: self.address,
            data: buf,
            flags: Default::default(),
        }];
        self.inner.i2c_transfer(&mut msgs)?;
        Ok(msgs[0].len())
    }
}

/// Reads the EDID at the given offset into `data`, returning the number of
/// bytes read. Reads proceed in blocks of at most 0x80 bytes.
pub fn read_edid<D: I2cIo + ?Sized>(dev: &mut D, offset: u8, mut data: &mut [u8]) -> io::Result<usize> {
    dev.set_slave_address(I2C_ADDRESS_EDID, false)?;
    dev.write(&[offset])?;

    let mut len = 0;
    while !data.is_empty() {
        let datalen = cmp::min(0x80, data.len());
        let read = dev.read(&mut data[..datalen])?;
        if read == 0 {
            break;
        }
        len += read;
        data.resize_from(read);
    }

    Ok(len)
}

/// Maps a raw OS error to the protocol-level taxonomy.
///
/// EBUSY means another driver holds the address; ENODEV/ENXIO mean the
/// device went away. EAGAIN/ETIMEDOUT stay in [`Status::Io`] and classify
/// as retriable.
pub fn classify_os_error(err: &io::Error) -> Status {
    match err.raw_os_error() {
        Some(e) if e == libc::EBUSY => Status::DisplayBusy,
        Some(e) if e == libc::ENODEV || e == libc::ENXIO => Status::DisplayRemoved,
        errno => Status::Io {
            errno,
            msg: err.to_string(),
        },
    }
}
