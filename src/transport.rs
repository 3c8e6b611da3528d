//! Byte level access to the serial port.
//!
//! Ports are driven through the non-blocking `embedded-hal` serial traits,
//! timeouts are implemented by polling with a [`DelayMs`] between attempts.

use core::marker::PhantomData;

use embedded_hal::blocking::delay::DelayMs;

use crate::error::Error;
use crate::SerialPort;

/// Upper bound on bytes drained by [`Transport::discard_input`]
const MAX_DISCARD: usize = 4096;

/// Duration of the DTR/RTS reset pulse
const RESET_PULSE_MS: u32 = 100;

pub struct Transport<P, D, E> {
    port: P,
    delay: D,
    poll_delay_ms: u32,
    _err: PhantomData<E>,
}

impl<P, D, E> Transport<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(port: P, delay: D, poll_delay_ms: u32) -> Self {
        Self {
            port,
            delay,
            poll_delay_ms,
            _err: PhantomData,
        }
    }

    /// Write all bytes and flush the port
    pub fn write(&mut self, data: &[u8]) -> Result<(), Error<E>> {
        trace!("TX {:02x?}", data);

        for b in data {
            nb::block!(self.port.write(*b)).map_err(Error::Serial)?;
        }
        nb::block!(self.port.flush()).map_err(Error::Serial)?;

        Ok(())
    }

    /// Read a single byte, waiting up to `timeout_ms`
    pub fn read_byte(&mut self, timeout_ms: u32) -> Result<u8, Error<E>> {
        // A zero poll delay would never advance the timeout
        let step = self.poll_delay_ms.max(1);
        let mut t = 0;

        loop {
            match self.port.read() {
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
                Ok(v) => return Ok(v),
            }

            if t >= timeout_ms {
                return Err(Error::Timeout(timeout_ms));
            }

            self.delay.delay_ms(self.poll_delay_ms);
            t += step;
        }
    }

    /// Read exactly `n` bytes, each arriving within `timeout_ms` of the last.
    ///
    /// Partial reads are reported as a timeout, never returned.
    pub fn read_exact(&mut self, n: usize, timeout_ms: u32) -> Result<Vec<u8>, Error<E>> {
        let mut buff = Vec::with_capacity(n);

        while buff.len() < n {
            match self.read_byte(timeout_ms) {
                Ok(b) => buff.push(b),
                Err(e) => {
                    debug!("Read failed after {} of {} bytes: {:?}", buff.len(), n, e);
                    return Err(e);
                }
            }
        }

        trace!("RX {:02x?}", buff);

        Ok(buff)
    }

    /// Drop any pending received bytes
    pub fn discard_input(&mut self) -> Result<usize, Error<E>> {
        let mut n = 0;

        while n < MAX_DISCARD {
            match self.port.read() {
                Ok(_) => n += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
            }
        }

        if n > 0 {
            debug!("Discarded {} stale bytes", n);
        }

        Ok(n)
    }

    /// Pulse DTR / RTS to reset the target, then wait for the bootloader to start
    pub fn reset(&mut self, init_delay_ms: u32) -> Result<(), Error<E>> {
        debug!("Resetting device");

        self.port.set_dtr(true).map_err(Error::Serial)?;
        self.port.set_rts(true).map_err(Error::Serial)?;

        self.delay.delay_ms(RESET_PULSE_MS);

        self.port.set_dtr(false).map_err(Error::Serial)?;
        self.port.set_rts(false).map_err(Error::Serial)?;

        self.delay.delay_ms(init_delay_ms);

        Ok(())
    }

    /// Close the transport, returning the underlying port and delay
    pub fn release(self) -> (P, D) {
        (self.port, self.delay)
    }
}
