//! STM32 Serial Bootloader.
//!
//! Based on AN3155, this provides a blocking driver for the STM32 factory
//! USART bootloader over any `embedded-hal` serial port.
//!
//! The layers, leaves first:
//!
//! - [`transport`] byte I/O with timeouts over the serial port
//! - [`framer`] command framing, ACK / NACK handling and retries
//! - [`programmer`] bootloader commands and chunked transfers
//! - [`device`] / [`option_bytes`] the device model
//! - [`session`] the stateful interface used by applications
//!
//! ```ignore
//! let mut s = Session::new(Options::default());
//! let info = s.connect_linux("/dev/ttyUSB0", 115200)?;
//! let data = s.read(info.device.flash.start, 1024)?;
//! ```

#[macro_use]
extern crate log;

use embedded_hal::serial::{Read, Write};

pub mod device;
pub mod error;
pub mod framer;
pub mod option_bytes;
pub mod programmer;
pub mod protocol;
pub mod session;
pub mod transport;

#[cfg(feature = "linux")]
pub mod linux;

pub use device::{DeviceDescriptor, FlashPage, MemoryRegion};
pub use error::{Error, ErrorKind, TransferError};
pub use option_bytes::{OptionBytes, WatchdogType};
pub use programmer::{CancelHandle, Programmer};
pub use session::{DeviceInfo, PageUsage, Session};

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Do not reset the device on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_reset: bool,

    /// Do not read option bytes on connection
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub no_option_bytes: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "500"))]
    pub response_timeout_ms: u32,

    /// Timeout to wait for a mass erase or option byte write to complete
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "40000"))]
    pub erase_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init before sending init character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub init_delay_ms: u32,

    /// Number of init characters sent before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "5"))]
    pub sync_attempts: u8,

    /// Attempts per exchange on timeout or serial errors
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "3"))]
    pub max_attempts: u8,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            no_reset: false,
            no_option_bytes: false,
            response_timeout_ms: 500,
            erase_timeout_ms: 40_000,
            poll_delay_ms: 1,
            init_delay_ms: 50,
            sync_attempts: 5,
            max_attempts: 3,
        }
    }
}
