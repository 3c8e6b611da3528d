//! Error types for bootloader sessions.

use thiserror::Error;

/// Errors returned by the bootloader engine, generic over the serial port error
#[derive(Clone, PartialEq, Debug, Error)]
pub enum Error<SerialError> {
    /// Underlying serial port failure
    #[error("serial error: {0:?}")]
    Serial(SerialError),

    /// Serial port could not be opened or configured
    #[error("failed to open port {port}: {reason}")]
    Open { port: String, reason: String },

    /// Requested baud rate is outside the range supported by the bootloader
    #[error("baud rate {0} outside range supported by the bootloader")]
    InvalidBaud(u32),

    /// Bootloader did not acknowledge the synchronisation byte
    #[error("no bootloader response after {attempts} sync attempts")]
    SyncFailed { attempts: u8 },

    /// Product ID is not in the device table
    #[error("unsupported device id 0x{0:04x}")]
    UnsupportedDevice(u16),

    /// No response within the allowed time
    #[error("response timeout after {0} ms")]
    Timeout(u32),

    /// Bootloader explicitly rejected a command or parameter frame
    #[error("bootloader rejected {0}")]
    Nack(Stage),

    /// Received a byte other than ACK / NACK where one was expected
    #[error("unexpected response 0x{0:02x}")]
    UnexpectedResponse(u8),

    /// Response payload was not of the declared length
    #[error("unexpected response length (expected {expected}, got {actual})")]
    UnexpectedLength { expected: usize, actual: usize },

    /// Command is not in the list reported by the bootloader
    #[error("command 0x{0:02x} not supported by this bootloader")]
    UnsupportedCommand(u8),

    /// Span does not fit in any memory region of the device
    #[error("invalid address 0x{address:08x} (length {length})")]
    InvalidAddress { address: u32, length: usize },

    /// Page index outside the device page table
    #[error("invalid page {index} (device has {page_count} pages)")]
    InvalidPage { index: u16, page_count: u16 },

    /// Option byte block failed validation
    #[error(transparent)]
    OptionBytes(#[from] OptionBytesError),

    /// Read back data did not match
    #[error("verify failed at 0x{address:08x} (expected 0x{expected:02x}, read 0x{actual:02x})")]
    Verify { address: u32, expected: u8, actual: u8 },

    /// Session has not been connected, or has been torn down
    #[error("not connected")]
    NotConnected,

    /// Operation was cancelled between chunks
    #[error("operation cancelled")]
    Cancelled,
}

/// Protocol stage at which a NACK was received
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Stage {
    Sync,
    Command(u8),
    Parameters,
    Completion,
}

impl core::fmt::Display for Stage {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Stage::Sync => write!(f, "sync"),
            Stage::Command(c) => write!(f, "command 0x{:02x}", c),
            Stage::Parameters => write!(f, "parameters"),
            Stage::Completion => write!(f, "operation"),
        }
    }
}

/// Option byte block decode failures
#[derive(Clone, PartialEq, Debug, Error)]
pub enum OptionBytesError {
    #[error("option byte block is {actual} bytes, expected {expected}")]
    Length { expected: usize, actual: usize },

    #[error("option byte 0x{value:02x} at offset {offset} does not match complement 0x{complement:02x}")]
    Complement { offset: usize, value: u8, complement: u8 },
}

/// Coarse error classification
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ErrorKind {
    Connect,
    Timeout,
    Protocol,
    InvalidAddress,
    NotConnected,
    Io,
    Data,
    Cancelled,
}

impl<E> Error<E> {
    pub fn kind(&self) -> ErrorKind {
        use Error::*;

        match self {
            Open { .. } | InvalidBaud(_) | SyncFailed { .. } | UnsupportedDevice(_) => {
                ErrorKind::Connect
            }
            Timeout(_) => ErrorKind::Timeout,
            Nack(_) | UnexpectedResponse(_) | UnexpectedLength { .. } | UnsupportedCommand(_) => {
                ErrorKind::Protocol
            }
            InvalidAddress { .. } | InvalidPage { .. } => ErrorKind::InvalidAddress,
            NotConnected => ErrorKind::NotConnected,
            Serial(_) => ErrorKind::Io,
            OptionBytes(_) | Verify { .. } => ErrorKind::Data,
            Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Transient errors that may succeed if the exchange is repeated.
    ///
    /// An explicit NACK is never retriable.
    pub fn is_retriable(&self) -> bool {
        matches!(self.kind(), ErrorKind::Timeout | ErrorKind::Io)
    }
}

/// Failure part way through a chunked transfer
#[derive(Clone, PartialEq, Debug, Error)]
#[error("{error} ({completed} bytes completed)")]
pub struct TransferError<SerialError> {
    /// Bytes successfully transferred before the failure
    pub completed: usize,
    pub error: Error<SerialError>,
}

impl<E> TransferError<E> {
    pub fn new(completed: usize, error: Error<E>) -> Self {
        Self { completed, error }
    }
}

impl<E> From<Error<E>> for TransferError<E> {
    fn from(error: Error<E>) -> Self {
        Self { completed: 0, error }
    }
}
