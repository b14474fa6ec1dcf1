//! Boot image composition and serial delivery for RISC-V boards
//!
//! Images are built in three stages: a [`BoardDescriptor`] describes the flash layout, the
//! composer lays built artifacts out into a [`ComposedImage`] and the header injector prepends
//! the record the mask ROM checks before it runs the first stage. The finished image is then
//! delivered over a serial [`SerialPort`] with one of the [`TransferStrategy`] protocols.

pub mod descriptor;
mod error;
pub mod header;
pub mod image;
pub mod transfer;

use std::ffi::OsStr;
use std::fmt;
use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};
use std::time::Duration;

use log::debug;
pub use serialport;
use serialport::prelude::*;
use serialport::{ClearBuffer, ErrorKind};

pub use descriptor::{AreaKind, BoardDescriptor, DescriptorError};
pub use error::{Error, Stage};
pub use header::{Header, HeaderConfig, HeaderError};
pub use image::{ArtifactNames, Artifacts, ComposeError, ComposedImage};
pub use transfer::{
    transfer, Cancellation, FailureCause, Link, TransferError, TransferOutcome, TransferSession,
    TransferStrategy,
};

/// Serial connection with an open serial port.
pub struct SerialPort {
    path: String,
    inner_port: Box<dyn serialport::SerialPort>,
}

impl fmt::Debug for SerialPort {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SerialPort")
            .field("path", &self.path)
            .field("settings", &self.settings())
            .finish()
    }
}

impl Deref for SerialPort {
    type Target = Box<dyn serialport::SerialPort>;

    fn deref(&self) -> &Self::Target {
        &self.inner_port
    }
}

impl DerefMut for SerialPort {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner_port
    }
}

impl SerialPort {
    /// Opens the given `port` as a `SerialPort` with the given `baud_rate`.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use boardflash::SerialPort;
    ///
    /// let port = SerialPort::open("/dev/ttyUSB0", 115_200)?;
    ///
    /// # Ok::<(), boardflash::TransferError>(())
    /// ```
    pub fn open<S: AsRef<OsStr>>(port: S, baud_rate: u32) -> Result<SerialPort, TransferError> {
        let path = port.as_ref().to_string_lossy().into_owned();
        let settings = SerialPortSettings {
            baud_rate,
            data_bits: DataBits::Eight,
            flow_control: FlowControl::None,
            parity: Parity::None,
            stop_bits: StopBits::One,
            timeout: Duration::from_millis(2000),
        };

        let serial_port =
            serialport::open_with_settings(port.as_ref(), &settings).map_err(|err| {
                match err.kind {
                    ErrorKind::NoDevice => TransferError::NoDevice(path.clone()),
                    _ => TransferError::OpenError(path.clone(), err),
                }
            })?;

        debug!("Opened {} with {:?}", path, settings);

        Ok(SerialPort {
            path,
            inner_port: serial_port,
        })
    }

    /// Consumes `self` and returns the inner serial port.
    pub fn into_port(self) -> Box<dyn serialport::SerialPort> {
        self.inner_port
    }
}

impl Read for SerialPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner_port.read(buf)
    }
}

impl Write for SerialPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.inner_port.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner_port.flush()
    }
}

fn to_io_error(err: serialport::Error) -> io::Error {
    io::Error::new(io::ErrorKind::Other, err)
}

impl Link for SerialPort {
    fn name(&self) -> String {
        self.path.clone()
    }

    fn set_timeout(&mut self, timeout: Duration) -> io::Result<()> {
        self.inner_port.set_timeout(timeout).map_err(to_io_error)
    }

    fn clear_input(&mut self) -> io::Result<()> {
        self.inner_port
            .clear(ClearBuffer::Input)
            .map_err(to_io_error)
    }
}
