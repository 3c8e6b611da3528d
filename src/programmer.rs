//! Bootloader command implementations.
//!
//! Each operation is a fixed sequence of framer exchanges. Multi-chunk
//! transfers check the target region and the cancel flag before every
//! chunk and report the number of bytes completed on failure.

use std::convert::TryFrom;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use embedded_hal::blocking::delay::DelayMs;

use crate::device::{self, DeviceDescriptor};
use crate::error::{Error, TransferError};
use crate::framer::{Framer, State};
use crate::option_bytes::{OptionBytes, OPTION_BYTES_LEN};
use crate::protocol::{self, Command, Version, MAX_CHUNK};
use crate::{Options, SerialPort};

/// Additional time allowed per page when erasing pages
pub const PAGE_ERASE_TIMEOUT_MS: u32 = 50;

/// Shared flag used to stop a transfer between chunks
#[derive(Clone, Debug, Default)]
pub struct CancelHandle(Arc<AtomicBool>);

impl CancelHandle {
    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn clear(&self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

/// Response to the `Get` command
#[derive(Clone, Debug, PartialEq)]
pub struct BootloaderInfo {
    pub version: Version,
    pub commands: Vec<u8>,
}

impl BootloaderInfo {
    pub fn supports(&self, command: Command) -> bool {
        self.commands.contains(&command.opcode())
    }

    /// Commands reported by the bootloader that this crate knows about
    pub fn known_commands(&self) -> Vec<Command> {
        self.commands
            .iter()
            .filter_map(|c| Command::try_from(*c).ok())
            .collect()
    }
}

pub struct Programmer<P, D, E> {
    framer: Framer<P, D, E>,
    info: Option<BootloaderInfo>,
    cancel: CancelHandle,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            framer: Framer::new(port, delay, options),
            info: None,
            cancel: CancelHandle::default(),
        }
    }

    pub fn with_cancel(mut self, cancel: CancelHandle) -> Self {
        self.cancel = cancel;
        self
    }

    /// Fetch the link state
    pub fn state(&self) -> State {
        self.framer.state()
    }

    pub fn is_ready(&self) -> bool {
        self.framer.is_ready()
    }

    pub fn info(&self) -> Option<&BootloaderInfo> {
        self.info.as_ref()
    }

    /// Synchronise with the bootloader
    pub fn init(&mut self) -> Result<(), Error<E>> {
        self.info = None;
        self.framer.sync()
    }

    /// Fetch the bootloader version and supported commands
    pub fn get(&mut self) -> Result<BootloaderInfo, Error<E>> {
        self.framer.send_command(Command::Get)?;

        let resp = self.framer.read_prefixed_response()?;
        self.framer.finish(self.framer.options().response_timeout_ms)?;

        let info = BootloaderInfo {
            version: Version(resp[0]),
            commands: resp[1..].to_vec(),
        };

        debug!("Bootloader v{} commands: {:02x?}", info.version, info.commands);
        self.info = Some(info.clone());

        Ok(info)
    }

    /// Fetch the product ID
    pub fn chip_id(&mut self) -> Result<u16, Error<E>> {
        self.framer.send_command(Command::GetId)?;

        let resp = self.framer.read_prefixed_response()?;
        self.framer.finish(self.framer.options().response_timeout_ms)?;

        if resp.len() != 2 {
            return Err(Error::UnexpectedLength {
                expected: 2,
                actual: resp.len(),
            });
        }

        Ok(u16::from_be_bytes([resp[0], resp[1]]))
    }

    /// Fetch the product ID and resolve the matching device
    pub fn identify(&mut self) -> Result<&'static DeviceDescriptor, Error<E>> {
        let id = self.chip_id()?;

        match device::lookup(id) {
            Some(d) => {
                info!("Found device: {} (0x{:03x})", d.name, id);
                Ok(d)
            }
            None => {
                error!("Unsupported device id: 0x{:04x}", id);
                Err(Error::UnsupportedDevice(id))
            }
        }
    }

    /// Fetch the bootloader version
    pub fn version(&mut self) -> Result<Version, Error<E>> {
        self.framer.send_command(Command::GetVersionReadStatus)?;

        // Version followed by two option bytes kept for compatibility
        let resp = self.framer.read_response(3)?;
        self.framer.finish(self.framer.options().response_timeout_ms)?;

        Ok(Version(resp[0]))
    }

    /// Read a single chunk of up to 256 bytes
    pub fn read_chunk(&mut self, address: u32, buff: &mut [u8]) -> Result<(), Error<E>> {
        if buff.is_empty() || buff.len() > MAX_CHUNK {
            return Err(Error::InvalidAddress {
                address,
                length: buff.len(),
            });
        }

        trace!("Read 0x{:08x} ({} bytes)", address, buff.len());

        self.framer.send_command(Command::ReadMemory)?;
        self.framer.send_params(&protocol::address_frame(address))?;
        self.framer.send_params(&protocol::read_length_frame(buff.len()))?;

        let data = self.framer.read_response(buff.len())?;
        buff.copy_from_slice(&data);

        Ok(())
    }

    /// Write a single chunk of up to 256 bytes, padded to the write alignment
    pub fn write_chunk(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        if data.is_empty() || data.len() > MAX_CHUNK {
            return Err(Error::InvalidAddress {
                address,
                length: data.len(),
            });
        }

        trace!("Write 0x{:08x} ({} bytes)", address, data.len());

        self.framer.send_command(Command::WriteMemory)?;
        self.framer.send_params(&protocol::address_frame(address))?;
        self.framer.send_params(&protocol::write_data_frame(data))
    }

    /// Read `len` bytes in protocol sized chunks
    pub fn read_memory<F>(
        &mut self,
        device: &DeviceDescriptor,
        address: u32,
        len: usize,
        mut progress: F,
    ) -> Result<Vec<u8>, TransferError<E>>
    where
        F: FnMut(usize, usize),
    {
        let mut data = vec![0u8; len];
        let mut done = 0;

        for (chunk_address, chunk_len) in protocol::chunks(address, len) {
            self.check_chunk(device, chunk_address, chunk_len, done)?;

            self.read_chunk(chunk_address, &mut data[done..done + chunk_len])
                .map_err(|e| TransferError::new(done, e))?;

            done += chunk_len;
            progress(done, len);
        }

        Ok(data)
    }

    /// Write `data` in protocol sized chunks
    pub fn write_memory<F>(
        &mut self,
        device: &DeviceDescriptor,
        address: u32,
        data: &[u8],
        mut progress: F,
    ) -> Result<(), TransferError<E>>
    where
        F: FnMut(usize, usize),
    {
        let mut done = 0;

        for (chunk_address, chunk_len) in protocol::chunks(address, data.len()) {
            // Padding is written too and must stay inside the region
            self.check_chunk(device, chunk_address, protocol::padded_len(chunk_len), done)?;

            self.write_chunk(chunk_address, &data[done..done + chunk_len])
                .map_err(|e| TransferError::new(done, e))?;

            done += chunk_len;
            progress(done, data.len());
        }

        Ok(())
    }

    fn check_chunk(
        &self,
        device: &DeviceDescriptor,
        address: u32,
        len: usize,
        done: usize,
    ) -> Result<(), TransferError<E>> {
        if self.cancel.is_cancelled() {
            info!("Transfer cancelled after {} bytes", done);
            return Err(TransferError::new(done, Error::Cancelled));
        }

        if device.region_for_span(address, len).is_none() {
            return Err(TransferError::new(done, Error::InvalidAddress { address, length: len }));
        }

        Ok(())
    }

    /// Pick the erase command supported by this bootloader
    fn erase_command(&self) -> Result<Command, Error<E>> {
        match &self.info {
            Some(i) if i.supports(Command::ExtendedErase) => Ok(Command::ExtendedErase),
            Some(i) if i.supports(Command::Erase) => Ok(Command::Erase),
            Some(_) => Err(Error::UnsupportedCommand(Command::Erase.opcode())),
            // Command list unknown, assume a v3+ bootloader
            None => Ok(Command::ExtendedErase),
        }
    }

    /// Erase the whole flash
    pub fn erase_all(&mut self) -> Result<(), Error<E>> {
        let command = self.erase_command()?;
        let timeout = self.framer.options().erase_timeout_ms;

        info!("Erasing all flash pages");

        self.framer.send_command(command)?;
        self.framer
            .send_params_with_timeout(&protocol::global_erase_frame(command), timeout)
    }

    /// Erase the listed pages
    pub fn erase_pages(&mut self, device: &DeviceDescriptor, pages: &[u16]) -> Result<(), Error<E>> {
        if pages.is_empty() {
            return Ok(());
        }

        let page_count = device.page_count();
        if let Some(&index) = pages.iter().find(|&&p| p >= page_count) {
            return Err(Error::InvalidPage { index, page_count });
        }

        // Each page once, bounding the list by the page count
        let mut pages = pages.to_vec();
        pages.sort_unstable();
        pages.dedup();

        let command = self.erase_command()?;
        let frame = match command {
            Command::ExtendedErase => protocol::extended_erase_frame(&pages),
            _ => {
                if pages.len() > 256 || pages.iter().any(|&p| p > 0xFF) {
                    return Err(Error::UnsupportedCommand(Command::ExtendedErase.opcode()));
                }
                let p: Vec<u8> = pages.iter().map(|&p| p as u8).collect();
                protocol::erase_frame(&p)
            }
        };

        let timeout = self.framer.options().response_timeout_ms
            + PAGE_ERASE_TIMEOUT_MS * pages.len() as u32;

        debug!("Erasing pages {:?}", pages);

        self.framer.send_command(command)?;
        self.framer.send_params_with_timeout(&frame, timeout)
    }

    /// Read and decode the option byte block
    pub fn read_option_bytes(&mut self, device: &DeviceDescriptor) -> Result<OptionBytes, Error<E>> {
        let layout = &device.option_bytes;
        let mut raw = [0u8; OPTION_BYTES_LEN];

        self.read_chunk(layout.address, &mut raw)?;
        debug!("Option bytes: {:02x?}", raw);

        Ok(OptionBytes::decode(layout, &raw)?)
    }

    /// Encode and write the option byte block.
    ///
    /// The bootloader resets the target once the block is programmed so the
    /// link must be synchronised again before further commands.
    pub fn write_option_bytes(
        &mut self,
        device: &DeviceDescriptor,
        option_bytes: &OptionBytes,
    ) -> Result<OptionBytes, Error<E>> {
        let layout = &device.option_bytes;
        let raw = option_bytes.encode(layout);

        debug!("Writing option bytes: {:02x?}", raw);

        self.framer.send_command(Command::WriteMemory)?;
        self.framer.send_params(&protocol::address_frame(layout.address))?;
        self.framer.send_params_with_timeout(
            &protocol::write_data_frame(&raw),
            self.framer.options().erase_timeout_ms,
        )?;

        self.framer.invalidate();

        Ok(OptionBytes::decode(layout, &raw)?)
    }

    /// Jump to the application at `address`, the bootloader stops responding afterwards
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        info!("Jumping to 0x{:08x}", address);

        self.framer.send_command(Command::Go)?;
        self.framer.send_params(&protocol::address_frame(address))?;

        self.framer.invalidate();

        Ok(())
    }

    /// Enable readout protection, the target resets on completion
    pub fn readout_protect(&mut self) -> Result<(), Error<E>> {
        self.resetting_command(Command::ReadoutProtect)
    }

    /// Disable readout protection, this mass erases the flash and resets the target
    pub fn readout_unprotect(&mut self) -> Result<(), Error<E>> {
        self.resetting_command(Command::ReadoutUnprotect)
    }

    /// Disable write protection for all pages, the target resets on completion
    pub fn write_unprotect(&mut self) -> Result<(), Error<E>> {
        self.resetting_command(Command::WriteUnprotect)
    }

    fn resetting_command(&mut self, command: Command) -> Result<(), Error<E>> {
        info!("Executing {:?}", command);

        self.framer.send_command(command)?;
        self.framer.finish(self.framer.options().erase_timeout_ms)?;

        self.framer.invalidate();

        Ok(())
    }

    /// Close the programmer, returning the serial port
    pub fn release(self) -> (P, D) {
        self.framer.release()
    }
}
