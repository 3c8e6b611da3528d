//! Command framing and acknowledgement handling.
//!
//! Every exchange with the bootloader is a frame followed by a single
//! ACK / NACK byte. The framer owns the transport, tracks the link state and
//! applies the bounded retry policy: timeouts and serial errors are retried
//! up to [`Options::max_attempts`] times, a NACK never is.

use embedded_hal::blocking::delay::DelayMs;

use crate::error::{Error, Stage};
use crate::protocol::{Command, UART_ACK, UART_DISC, UART_NACK};
use crate::transport::Transport;
use crate::{Options, SerialPort};

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum State {
    Disconnected,
    Syncing,
    Ready,
    Sending,
    AwaitingAck,
    /// Link is out of step with the bootloader, a new handshake is required
    Failed,
}

pub struct Framer<P, D, E> {
    transport: Transport<P, D, E>,
    options: Options,
    state: State,
}

impl<P, D, E> Framer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self {
            transport: Transport::new(port, delay, options.poll_delay_ms),
            options,
            state: State::Disconnected,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn is_ready(&self) -> bool {
        self.state == State::Ready
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Mark the link as no longer synchronised, e.g. after the target resets
    pub fn invalidate(&mut self) {
        self.state = State::Disconnected;
    }

    /// Reset the target (unless disabled) and run the sync handshake
    pub fn sync(&mut self) -> Result<(), Error<E>> {
        self.state = State::Syncing;

        if !self.options.no_reset {
            if let Err(e) = self.transport.reset(self.options.init_delay_ms) {
                self.state = State::Failed;
                return Err(e);
            }
        }

        let attempts = self.options.sync_attempts.max(1);

        for i in 0..attempts {
            debug!("Sending discovery character (attempt {}/{})", i + 1, attempts);

            let r = self
                .transport
                .discard_input()
                .and_then(|_| self.transport.write(&[UART_DISC]))
                .and_then(|_| self.read_ack(self.options.response_timeout_ms));

            match r {
                Ok(true) => {
                    debug!("Received bootloader ack");
                    self.state = State::Ready;
                    return Ok(());
                }
                Ok(false) => debug!("Received bootloader nack"),
                Err(e) if e.is_retriable() => debug!("Sync attempt failed: {:?}", e),
                Err(e) => {
                    self.state = State::Failed;
                    return Err(e);
                }
            }
        }

        error!("No response from bootloader");
        self.state = State::Failed;

        Err(Error::SyncFailed { attempts })
    }

    /// Send a command frame and await the ACK
    pub fn send_command(&mut self, command: Command) -> Result<(), Error<E>> {
        let timeout = self.options.response_timeout_ms;
        self.exchange(&command.frame(), Stage::Command(command.opcode()), timeout)
    }

    /// Send a parameter frame and await the ACK
    pub fn send_params(&mut self, frame: &[u8]) -> Result<(), Error<E>> {
        let timeout = self.options.response_timeout_ms;
        self.exchange(frame, Stage::Parameters, timeout)
    }

    /// Send a parameter frame where the ACK follows a slow operation
    pub fn send_params_with_timeout(&mut self, frame: &[u8], timeout_ms: u32) -> Result<(), Error<E>> {
        self.exchange(frame, Stage::Parameters, timeout_ms)
    }

    /// Single frame / acknowledge exchange with retries on transient errors
    fn exchange(&mut self, frame: &[u8], stage: Stage, timeout_ms: u32) -> Result<(), Error<E>> {
        if self.state != State::Ready {
            return Err(Error::NotConnected);
        }

        let attempts = self.options.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            attempt += 1;

            self.state = State::Sending;

            // A late reply to the previous attempt must not answer this one
            let r = if attempt > 1 {
                self.transport.discard_input().map(|_| ())
            } else {
                Ok(())
            };

            let r = r.and_then(|_| self.transport.write(frame)).and_then(|_| {
                self.state = State::AwaitingAck;
                self.read_ack(timeout_ms)
            });

            match r {
                Ok(true) => {
                    self.state = State::Ready;
                    return Ok(());
                }
                Ok(false) => {
                    debug!("Received nack for {}", stage);
                    self.state = State::Ready;
                    return Err(Error::Nack(stage));
                }
                Err(e) if e.is_retriable() && attempt < attempts => {
                    warn!("Exchange for {} failed ({}), retrying ({}/{})", stage, e, attempt, attempts);
                }
                Err(e) => {
                    error!("Exchange for {} failed after {} attempts: {}", stage, attempt, e);
                    self.state = State::Failed;
                    return Err(e);
                }
            }
        }
    }

    /// Read a fixed length payload
    pub fn read_response(&mut self, len: usize) -> Result<Vec<u8>, Error<E>> {
        let timeout = self.options.response_timeout_ms;
        self.transport
            .read_exact(len, timeout)
            .map_err(|e| self.fail(e))
    }

    /// Read a payload prefixed by a `N-1` length byte
    pub fn read_prefixed_response(&mut self) -> Result<Vec<u8>, Error<E>> {
        let n = self.read_response(1)?[0] as usize;
        self.read_response(n + 1)
    }

    /// Await the ACK terminating a response or signalling completion of an operation
    pub fn finish(&mut self, timeout_ms: u32) -> Result<(), Error<E>> {
        match self.read_ack(timeout_ms) {
            Ok(true) => Ok(()),
            Ok(false) => Err(Error::Nack(Stage::Completion)),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn fail(&mut self, e: Error<E>) -> Error<E> {
        self.state = State::Failed;
        e
    }

    /// Read a single ACK / NACK, `Ok(false)` indicates a NACK
    fn read_ack(&mut self, timeout_ms: u32) -> Result<bool, Error<E>> {
        match self.transport.read_byte(timeout_ms)? {
            UART_ACK => Ok(true),
            UART_NACK => Ok(false),
            v => {
                debug!("Received unexpected value: 0x{:02x}", v);
                Err(Error::UnexpectedResponse(v))
            }
        }
    }

    /// Close the link, returning the port
    pub fn release(self) -> (P, D) {
        self.transport.release()
    }
}
