//! Stateful device interface.
//!
//! A [`Session`] wraps a [`Programmer`] together with the device resolved
//! during [`Session::connect`]. All operations are blocking; long running
//! calls (erase, large transfers) should be run off any UI thread, and may
//! be stopped between chunks through a [`CancelHandle`].

use embedded_hal::blocking::delay::DelayMs;

use crate::device::{DeviceDescriptor, Region};
use crate::error::{Error, TransferError};
use crate::option_bytes::OptionBytes;
use crate::programmer::{CancelHandle, Programmer};
use crate::protocol::{self, Version, MAX_BAUD, MIN_BAUD};
use crate::{Options, SerialPort};

/// Information gathered on connection
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceInfo {
    pub device: &'static DeviceDescriptor,
    pub version: Version,
    pub commands: Vec<u8>,
    pub option_bytes: Option<OptionBytes>,
}

/// Flash page occupancy
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageUsage {
    pub index: u16,
    pub start: u32,
    pub blank: bool,
}

pub struct Session<P, D, E> {
    options: Options,
    programmer: Option<Programmer<P, D, E>>,
    baud: u32,
    device: Option<&'static DeviceDescriptor>,
    version: Option<Version>,
    option_bytes: Option<OptionBytes>,
    cancel: CancelHandle,
}

impl<P, D, E> Session<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(options: Options) -> Self {
        Self {
            options,
            programmer: None,
            baud: 0,
            device: None,
            version: None,
            option_bytes: None,
            cancel: CancelHandle::default(),
        }
    }

    /// Check a baud rate is usable with the bootloader
    pub fn check_baud(baud: u32) -> Result<(), Error<E>> {
        if baud < MIN_BAUD || baud > MAX_BAUD {
            return Err(Error::InvalidBaud(baud));
        }
        Ok(())
    }

    /// Connect to the bootloader over an already configured port
    pub fn connect(&mut self, port: P, delay: D, baud: u32) -> Result<DeviceInfo, Error<E>> {
        Self::check_baud(baud)?;

        self.disconnect();

        self.baud = baud;
        self.programmer = Some(
            Programmer::new(port, delay, self.options.clone()).with_cancel(self.cancel.clone()),
        );

        self.reconnect()
    }

    /// Run the connection sequence again on the held port.
    ///
    /// Required after commands that reset the target, or after the link failed.
    pub fn reconnect(&mut self) -> Result<DeviceInfo, Error<E>> {
        self.clear();

        let read_ob = !self.options.no_option_bytes;
        let p = self.programmer.as_mut().ok_or(Error::NotConnected)?;

        info!("Connecting to bootloader at {} baud", self.baud);

        p.init()?;
        let bl = p.get()?;
        let device = p.identify()?;
        let version = p.version()?;

        let option_bytes = if read_ob {
            match p.read_option_bytes(device) {
                Ok(ob) => Some(ob),
                Err(e @ Error::Nack(_)) => {
                    warn!("Option bytes not readable (read protection active?): {}", e);
                    None
                }
                Err(e @ Error::OptionBytes(_)) => {
                    warn!("Option bytes invalid: {}", e);
                    None
                }
                Err(e) => return Err(e),
            }
        } else {
            None
        };

        info!("Bootloader connected (v{})", version);

        self.device = Some(device);
        self.version = Some(version);
        self.option_bytes = option_bytes.clone();

        Ok(DeviceInfo {
            device,
            version,
            commands: bl.commands,
            option_bytes,
        })
    }

    /// Close the session, returning the port if one was held
    pub fn disconnect(&mut self) -> Option<(P, D)> {
        self.clear();
        self.programmer.take().map(|p| {
            debug!("Disconnected");
            p.release()
        })
    }

    fn clear(&mut self) {
        self.device = None;
        self.version = None;
        self.option_bytes = None;
    }

    pub fn is_connected(&self) -> bool {
        self.device.is_some() && self.programmer.as_ref().map_or(false, |p| p.is_ready())
    }

    pub fn device(&self) -> Option<&'static DeviceDescriptor> {
        self.device
    }

    pub fn bootloader_version(&self) -> Option<Version> {
        self.version
    }

    /// Last option bytes read or written
    pub fn option_bytes(&self) -> Option<&OptionBytes> {
        self.option_bytes.as_ref()
    }

    pub fn baud(&self) -> u32 {
        self.baud
    }

    /// Handle for stopping transfers from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Borrow the programmer and device for a connected session
    fn connected(&mut self) -> Result<(&mut Programmer<P, D, E>, &'static DeviceDescriptor), Error<E>> {
        match (self.programmer.as_mut(), self.device) {
            (Some(p), Some(d)) if p.is_ready() => Ok((p, d)),
            _ => Err(Error::NotConnected),
        }
    }

    /// Drop device state if the link failed during an operation
    fn check_link<T, F>(&mut self, r: Result<T, F>) -> Result<T, F> {
        if r.is_err() && !self.programmer.as_ref().map_or(false, |p| p.is_ready()) {
            warn!("Bootloader link lost, reconnect required");
            self.clear();
        }
        r
    }

    /// Read `len` bytes from flash, RAM, or the option byte block
    pub fn read(&mut self, address: u32, len: usize) -> Result<Vec<u8>, TransferError<E>> {
        self.read_with_progress(address, len, |_, _| ())
    }

    pub fn read_with_progress<F>(
        &mut self,
        address: u32,
        len: usize,
        progress: F,
    ) -> Result<Vec<u8>, TransferError<E>>
    where
        F: FnMut(usize, usize),
    {
        self.cancel.clear();
        let (p, d) = self.connected()?;

        if d.region_for_span(address, len).is_none() {
            return Err(Error::InvalidAddress { address, length: len }.into());
        }

        let r = p.read_memory(d, address, len, progress);
        self.check_link(r)
    }

    /// Write `data` to flash or RAM, flash pages must be erased first
    pub fn write(&mut self, address: u32, data: &[u8]) -> Result<(), TransferError<E>> {
        self.write_with_progress(address, data, |_, _| ())
    }

    pub fn write_with_progress<F>(
        &mut self,
        address: u32,
        data: &[u8],
        progress: F,
    ) -> Result<(), TransferError<E>>
    where
        F: FnMut(usize, usize),
    {
        self.cancel.clear();
        let (p, d) = self.connected()?;

        // Option bytes must go through `write_option_bytes` to keep complements valid,
        // padding of the final chunk must not spill past the region
        match d.region_for_span(address, protocol::padded_len(data.len())) {
            Some(Region::Flash) | Some(Region::Ram) => (),
            _ => {
                return Err(Error::InvalidAddress {
                    address,
                    length: data.len(),
                }
                .into())
            }
        }

        let r = p.write_memory(d, address, data, progress);
        self.check_link(r)
    }

    /// Read back and compare, reporting the first mismatch
    pub fn verify(&mut self, address: u32, data: &[u8]) -> Result<(), TransferError<E>> {
        let read = self.read(address, data.len())?;

        match data.iter().zip(read.iter()).position(|(a, b)| a != b) {
            Some(i) => Err(TransferError::new(
                i,
                Error::Verify {
                    address: address + i as u32,
                    expected: data[i],
                    actual: read[i],
                },
            )),
            None => Ok(()),
        }
    }

    /// Mass erase the flash
    pub fn erase_all(&mut self) -> Result<(), Error<E>> {
        let (p, _d) = self.connected()?;
        let r = p.erase_all();
        self.check_link(r)
    }

    /// Erase flash pages by index
    pub fn erase_pages(&mut self, pages: &[u16]) -> Result<(), Error<E>> {
        let (p, d) = self.connected()?;
        let r = p.erase_pages(d, pages);
        self.check_link(r)
    }

    /// Erase every page touched by a flash span
    pub fn erase_span(&mut self, address: u32, len: usize) -> Result<(), Error<E>> {
        let (_p, d) = self.connected()?;

        let pages = d
            .pages_for_span(address, len)
            .ok_or(Error::InvalidAddress { address, length: len })?;

        self.erase_pages(&pages)
    }

    /// Read every flash page, reporting which are blank
    pub fn scan_pages<F>(&mut self, mut progress: F) -> Result<Vec<PageUsage>, TransferError<E>>
    where
        F: FnMut(usize, usize),
    {
        let (_p, d) = self.connected()?;
        let total = d.page_count() as usize;
        let mut usage = Vec::with_capacity(total);

        self.cancel.clear();

        for page in d.pages() {
            let done = usage.len() * d.page_size as usize;

            let (p, _) = self.connected().map_err(|e| TransferError::new(done, e))?;
            let r = p.read_memory(d, page.start, page.size as usize, |_, _| ());
            let data = self
                .check_link(r)
                .map_err(|e| TransferError::new(done + e.completed, e.error))?;

            usage.push(PageUsage {
                index: page.index,
                start: page.start,
                blank: data.iter().all(|b| *b == 0xFF),
            });
            progress(usage.len(), total);
        }

        Ok(usage)
    }

    /// Read the option bytes, updating the stored snapshot
    pub fn read_option_bytes(&mut self) -> Result<OptionBytes, Error<E>> {
        let (p, d) = self.connected()?;
        let r = p.read_option_bytes(d);
        let ob = self.check_link(r)?;

        self.option_bytes = Some(ob.clone());
        Ok(ob)
    }

    /// Write the option bytes.
    ///
    /// The target resets once the block is programmed, call
    /// [`Session::reconnect`] before issuing further commands.
    pub fn write_option_bytes(&mut self, option_bytes: &OptionBytes) -> Result<OptionBytes, Error<E>> {
        let (p, d) = self.connected()?;
        let r = p.write_option_bytes(d, option_bytes);
        let ob = self.check_link(r)?;

        self.option_bytes = Some(ob.clone());
        Ok(ob)
    }

    /// Start execution at `address`, ending the bootloader session
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        let (p, d) = self.connected()?;

        if d.region_for_span(address, 4).is_none() {
            return Err(Error::InvalidAddress { address, length: 4 });
        }

        let r = p.go(address);
        self.check_link(r)
    }

    pub fn readout_protect(&mut self) -> Result<(), Error<E>> {
        let (p, _d) = self.connected()?;
        let r = p.readout_protect();
        self.check_link(r)
    }

    /// Remove readout protection, erasing the flash
    pub fn readout_unprotect(&mut self) -> Result<(), Error<E>> {
        let (p, _d) = self.connected()?;
        let r = p.readout_unprotect();
        self.check_link(r)
    }

    pub fn write_unprotect(&mut self) -> Result<(), Error<E>> {
        let (p, _d) = self.connected()?;
        let r = p.write_unprotect();
        self.check_link(r)
    }
}
