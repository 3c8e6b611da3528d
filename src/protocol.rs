//! Wire level definitions for the STM32 USART bootloader (AN3155).
//!
//! Everything in here is pure: frames are built as byte vectors and
//! handed to the [`Framer`](crate::framer::Framer) for transmission.

use core::convert::TryFrom;

/// Synchronisation / baud detection byte sent to start a session
pub const UART_DISC: u8 = 0x7F;

pub const UART_ACK: u8 = 0x79;
pub const UART_NACK: u8 = 0x1F;

/// Maximum payload of a single read or write memory exchange
pub const MAX_CHUNK: usize = 256;

/// Write memory payloads are padded to a multiple of this length
pub const WRITE_ALIGN: usize = 4;

/// Value used to pad write memory payloads
pub const PAD_BYTE: u8 = 0xFF;

/// Baud range supported by the bootloader auto-baud detection
pub const MIN_BAUD: u32 = 1200;
pub const MAX_BAUD: u32 = 115_200;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Gets the bootloader version and the Read Protection status of the Flash memory.
    GetVersionReadStatus = 0x01,

    /// Gets the chip ID
    GetId = 0x02,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 256 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases from one to all the Flash memory pages.
    Erase = 0x43,

    /// Erases from one to all the Flash memory pages using two byte addressing mode (available only for v3.0 USART bootloader versions and above).
    ExtendedErase = 0x44,

    /// Enables the write protection for some sectors.
    WriteProtect = 0x63,

    /// Disables the write protection for all Flash memory sectors
    WriteUnprotect = 0x73,

    /// Enables the read protection
    ReadoutProtect = 0x82,

    /// Disables the read protection.
    ReadoutUnprotect = 0x92,
}

impl Command {
    pub fn opcode(self) -> u8 {
        self as u8
    }

    /// Command frame: the opcode followed by its one's complement
    pub fn frame(self) -> [u8; 2] {
        let c = self.opcode();
        [c, c ^ 0xFF]
    }
}

impl TryFrom<u8> for Command {
    type Error = u8;

    fn try_from(v: u8) -> Result<Self, Self::Error> {
        let c = match v {
            0x00 => Command::Get,
            0x01 => Command::GetVersionReadStatus,
            0x02 => Command::GetId,
            0x11 => Command::ReadMemory,
            0x21 => Command::Go,
            0x31 => Command::WriteMemory,
            0x43 => Command::Erase,
            0x44 => Command::ExtendedErase,
            0x63 => Command::WriteProtect,
            0x73 => Command::WriteUnprotect,
            0x82 => Command::ReadoutProtect,
            0x92 => Command::ReadoutUnprotect,
            _ => return Err(v),
        };
        Ok(c)
    }
}

/// XOR of every byte in `data`
pub fn checksum(data: &[u8]) -> u8 {
    data.iter().fold(0, |acc, b| acc ^ b)
}

/// Append the XOR checksum to a parameter frame
pub fn with_checksum(mut data: Vec<u8>) -> Vec<u8> {
    let c = checksum(&data);
    data.push(c);
    data
}

/// Address frame: four big endian address bytes and their checksum
pub fn address_frame(address: u32) -> [u8; 5] {
    let a = address.to_be_bytes();
    [a[0], a[1], a[2], a[3], checksum(&a)]
}

/// Length frame for read memory, `N-1` and its complement
pub fn read_length_frame(len: usize) -> [u8; 2] {
    debug_assert!(len > 0 && len <= MAX_CHUNK);
    let n = (len - 1) as u8;
    [n, n ^ 0xFF]
}

/// Length of a write payload once padded to the target alignment
pub fn padded_len(len: usize) -> usize {
    (len + WRITE_ALIGN - 1) / WRITE_ALIGN * WRITE_ALIGN
}

/// Pad a write payload to the target alignment
pub fn pad_write_data(data: &[u8]) -> Vec<u8> {
    let mut padded = data.to_vec();
    padded.resize(padded_len(data.len()), PAD_BYTE);
    padded
}

/// Data frame for write memory: `N-1`, padded data, then the checksum of both
pub fn write_data_frame(data: &[u8]) -> Vec<u8> {
    let padded = pad_write_data(data);
    debug_assert!(!padded.is_empty() && padded.len() <= MAX_CHUNK);

    let mut frame = Vec::with_capacity(padded.len() + 2);
    frame.push((padded.len() - 1) as u8);
    frame.extend_from_slice(&padded);
    with_checksum(frame)
}

/// Global erase frame for the given erase command
pub fn global_erase_frame(command: Command) -> Vec<u8> {
    match command {
        Command::ExtendedErase => vec![0xFF, 0xFF, 0x00],
        _ => vec![0xFF, 0x00],
    }
}

/// Page erase frame for the extended (two byte) erase command
pub fn extended_erase_frame(pages: &[u16]) -> Vec<u8> {
    // Counts from 0xFFF0 up are reserved for the special erase codes
    debug_assert!(!pages.is_empty() && pages.len() <= 0xFFF0);

    let mut frame = Vec::with_capacity(pages.len() * 2 + 3);
    frame.extend_from_slice(&((pages.len() - 1) as u16).to_be_bytes());
    for p in pages {
        frame.extend_from_slice(&p.to_be_bytes());
    }
    with_checksum(frame)
}

/// Page erase frame for the legacy (one byte) erase command
pub fn erase_frame(pages: &[u8]) -> Vec<u8> {
    debug_assert!(!pages.is_empty() && pages.len() <= 256);

    let mut frame = Vec::with_capacity(pages.len() + 2);
    frame.push((pages.len() - 1) as u8);
    frame.extend_from_slice(pages);
    with_checksum(frame)
}

/// Split a `(address, length)` request into protocol sized chunks
pub fn chunks(address: u32, len: usize) -> impl Iterator<Item = (u32, usize)> {
    (0..len)
        .step_by(MAX_CHUNK)
        .map(move |offset| (address + offset as u32, (len - offset).min(MAX_CHUNK)))
}

/// Bootloader version, BCD encoded as `0xMm`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Version(pub u8);

impl Version {
    pub fn major(&self) -> u8 {
        self.0 >> 4
    }

    pub fn minor(&self) -> u8 {
        self.0 & 0x0F
    }
}

impl core::fmt::Display for Version {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{}", self.major(), self.minor())
    }
}
