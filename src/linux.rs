use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use linux_embedded_hal::{Delay, Serial};
use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind as SerialErrorKind, FlowControl, Parity,
    SerialDevice as _, SerialPortSettings as _, StopBits,
};

use crate::{DeviceInfo, Error, Session, SerialPort};

/// Port level read timeout, polling and overall timeouts are handled by the transport
const PORT_TIMEOUT: Duration = Duration::from_millis(1);

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        SerialErrorKind::Io(k) => k,
        SerialErrorKind::InvalidInput => IoErrorKind::InvalidInput,
        SerialErrorKind::NoDevice => IoErrorKind::NotFound,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }
}

/// Open and configure a linux serial port for the bootloader (8E1, no flow control)
pub fn open<P: AsRef<Path>>(port: P, baud: u32) -> Result<Serial, SerialError> {
    // Open port
    let mut port = Serial::open(port.as_ref())?;

    // Apply settings
    let mut settings = port.0.read_settings()?;

    settings.set_char_size(CharSize::Bits8);
    settings.set_stop_bits(StopBits::Stop1);
    settings.set_baud_rate(BaudRate::from_speed(baud as usize))?;
    settings.set_flow_control(FlowControl::FlowNone);
    settings.set_parity(Parity::ParityEven);

    port.0.write_settings(&settings)?;
    port.0.set_timeout(PORT_TIMEOUT)?;

    Ok(port)
}

impl Session<Serial, Delay, IoErrorKind> {
    /// Open a linux serial port and connect to the bootloader
    pub fn connect_linux<P: AsRef<Path>>(
        &mut self,
        port: P,
        baud: u32,
    ) -> Result<DeviceInfo, Error<IoErrorKind>> {
        Self::check_baud(baud)?;

        let serial = open(port.as_ref(), baud).map_err(|e| Error::Open {
            port: port.as_ref().display().to_string(),
            reason: e.to_string(),
        })?;

        self.connect(serial, Delay, baud)
    }
}
