//! In-process bootloader emulator for driving sessions in tests.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::rc::Rc;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use stm32_serial_flasher::device::{self, DeviceDescriptor};
use stm32_serial_flasher::option_bytes::{OptionBytes, STM32F1_OPTION_BYTES};
use stm32_serial_flasher::protocol::{checksum, UART_ACK, UART_DISC, UART_NACK};
use stm32_serial_flasher::{Options, SerialPort, Session};

pub const OB_ADDRESS: u32 = 0x1FFF_F800;

/// Empty polls before a late reply shows up, one past the 20 ms test timeout
const LATE_POLLS: usize = 21;

#[derive(Debug, Clone, PartialEq)]
pub struct EmuError;

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

#[derive(Debug, Clone, Copy, PartialEq)]
enum Phase {
    Unsynced,
    Command,
    ReadAddress,
    ReadLength(u32),
    WriteAddress,
    WriteData(u32),
    Erase { extended: bool },
    GoAddress,
}

pub struct Device {
    pub product_id: u16,
    pub version: u8,
    pub commands: Vec<u8>,
    pub memory: BTreeMap<u32, u8>,

    /// Opcodes to reject at the command stage
    pub nack_commands: Vec<u8>,
    /// Number of sync bytes to NACK before accepting
    pub nack_syncs: usize,
    /// Swallow everything without responding
    pub silent: bool,
    /// Drop the next frames as if lost on the line
    pub ignore_frames: usize,
    /// Go silent after this many write data frames
    pub fail_after_writes: Option<usize>,
    /// NACK the next parameter frames as if their checksum was wrong
    pub nack_params: usize,
    /// Reject the next frames with a NACK that arrives after the host timed out
    pub late_frames: usize,

    /// Every byte received
    pub rx: Vec<u8>,
    /// Accepted opcodes in order
    pub opcodes: Vec<u8>,
    pub reads: Vec<(u32, usize)>,
    pub writes: Vec<(u32, Vec<u8>)>,
    pub erased_pages: Vec<u16>,
    pub mass_erased: bool,
    pub go: Option<u32>,
    pub resets: usize,

    phase: Phase,
    buf: Vec<u8>,
    tx: VecDeque<u8>,
    late: VecDeque<u8>,
    idle_polls: usize,
}

impl Device {
    fn descriptor(&self) -> Option<&'static DeviceDescriptor> {
        device::lookup(self.product_id)
    }

    /// Target reset, the bootloader restarts awaiting the sync byte
    pub fn reset(&mut self) {
        self.phase = Phase::Unsynced;
        self.buf.clear();
        self.tx.clear();
        self.late.clear();
        self.resets += 1;
    }

    fn respond(&mut self, data: &[u8]) {
        self.tx.extend(data.iter());
    }

    fn ack(&mut self) {
        self.respond(&[UART_ACK]);
    }

    fn nack(&mut self) {
        self.respond(&[UART_NACK]);
    }

    fn receive(&mut self, b: u8) {
        self.rx.push(b);
        self.release_late();

        if self.silent {
            return;
        }

        self.buf.push(b);

        let len = match self.frame_len() {
            Some(l) => l,
            None => return,
        };
        if self.buf.len() < len {
            return;
        }

        let frame = std::mem::take(&mut self.buf);
        if self.ignore_frames > 0 {
            self.ignore_frames -= 1;
            return;
        }
        if self.late_frames > 0 {
            self.late_frames -= 1;
            self.late.push_back(UART_NACK);
            return;
        }
        let params = self.phase != Phase::Unsynced && self.phase != Phase::Command;
        if params && self.nack_params > 0 {
            self.nack_params -= 1;
            self.nack();
            self.phase = Phase::Command;
            return;
        }

        self.handle(frame);
    }

    fn frame_len(&self) -> Option<usize> {
        let b = &self.buf;

        match self.phase {
            Phase::Unsynced => Some(1),
            Phase::Command | Phase::ReadLength(_) => Some(2),
            Phase::ReadAddress | Phase::WriteAddress | Phase::GoAddress => Some(5),
            Phase::WriteData(_) => b.first().map(|n| *n as usize + 1 + 2),
            Phase::Erase { extended: true } if b.len() >= 2 => {
                let n = u16::from_be_bytes([b[0], b[1]]);
                if n >= 0xFFF0 {
                    Some(3)
                } else {
                    Some(2 + 2 * (n as usize + 1) + 1)
                }
            }
            Phase::Erase { extended: true } => None,
            Phase::Erase { extended: false } => b.first().map(|&n| {
                if n == 0xFF {
                    2
                } else {
                    1 + n as usize + 1 + 1
                }
            }),
        }
    }

    fn handle(&mut self, frame: Vec<u8>) {
        match self.phase {
            Phase::Unsynced => {
                if frame[0] == UART_DISC && self.nack_syncs == 0 {
                    self.ack();
                    self.phase = Phase::Command;
                } else {
                    self.nack_syncs = self.nack_syncs.saturating_sub(1);
                    self.nack();
                }
            }
            Phase::Command => self.command(frame[0], frame[1]),
            Phase::ReadAddress | Phase::WriteAddress | Phase::GoAddress => {
                if checksum(&frame) != 0 {
                    self.nack();
                    self.phase = Phase::Command;
                    return;
                }

                let a = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
                self.ack();

                self.phase = match self.phase {
                    Phase::ReadAddress => Phase::ReadLength(a),
                    Phase::WriteAddress => Phase::WriteData(a),
                    _ => {
                        self.go = Some(a);
                        Phase::Unsynced
                    }
                };
            }
            Phase::ReadLength(a) => {
                self.phase = Phase::Command;
                if frame[0] ^ frame[1] != 0xFF {
                    self.nack();
                    return;
                }

                let n = frame[0] as usize + 1;
                self.reads.push((a, n));
                self.ack();

                let data: Vec<u8> = (0..n as u32).map(|i| self.peek(a + i)).collect();
                self.respond(&data);
            }
            Phase::WriteData(a) => {
                self.phase = Phase::Command;
                if checksum(&frame) != 0 || frame[0] as usize + 1 != frame.len() - 2 {
                    self.nack();
                    return;
                }

                let data = frame[1..frame.len() - 1].to_vec();
                for (i, b) in data.iter().enumerate() {
                    self.memory.insert(a + i as u32, *b);
                }
                self.writes.push((a, data));
                self.ack();

                // Programming the option bytes reloads them with a system reset
                if a == OB_ADDRESS {
                    self.phase = Phase::Unsynced;
                    self.resets += 1;
                }

                if let Some(n) = self.fail_after_writes {
                    if self.writes.len() >= n {
                        self.silent = true;
                    }
                }
            }
            Phase::Erase { extended } => {
                self.phase = Phase::Command;
                self.erase(extended, &frame);
            }
        }
    }

    fn command(&mut self, op: u8, complement: u8) {
        if op ^ complement != 0xFF || !self.commands.contains(&op) || self.nack_commands.contains(&op) {
            self.nack();
            return;
        }

        self.opcodes.push(op);
        self.ack();

        match op {
            0x00 => {
                let mut r = vec![self.commands.len() as u8, self.version];
                r.extend(self.commands.clone());
                r.push(UART_ACK);
                self.respond(&r);
            }
            0x01 => self.respond(&[self.version, 0x00, 0x00, UART_ACK]),
            0x02 => {
                let id = self.product_id.to_be_bytes();
                self.respond(&[0x01, id[0], id[1], UART_ACK]);
            }
            0x11 => self.phase = Phase::ReadAddress,
            0x21 => self.phase = Phase::GoAddress,
            0x31 => self.phase = Phase::WriteAddress,
            0x43 => self.phase = Phase::Erase { extended: false },
            0x44 => self.phase = Phase::Erase { extended: true },
            _ => {
                // Protection commands complete then reset the target
                self.ack();
                self.phase = Phase::Unsynced;
                self.buf.clear();
                self.resets += 1;
            }
        }
    }

    fn erase(&mut self, extended: bool, frame: &[u8]) {
        let global = if extended {
            frame == [0xFF, 0xFF, 0x00]
        } else {
            frame == [0xFF, 0x00]
        };

        if global {
            if let Some(d) = self.descriptor() {
                let flash = d.flash;
                self.memory.retain(|a, _| !flash.contains(*a));
            }
            self.mass_erased = true;
            self.ack();
            return;
        }

        if checksum(frame) != 0 {
            self.nack();
            return;
        }

        let pages: Vec<u16> = if extended {
            frame[2..frame.len() - 1]
                .chunks(2)
                .map(|p| u16::from_be_bytes([p[0], p[1]]))
                .collect()
        } else {
            frame[1..frame.len() - 1].iter().map(|p| *p as u16).collect()
        };

        if let Some(d) = self.descriptor() {
            for p in &pages {
                if let Some(page) = d.page(*p) {
                    self.memory.retain(|a, _| !page.contains(*a));
                }
            }
        }

        self.erased_pages.extend(pages);
        self.ack();
    }

    fn release_late(&mut self) {
        let late = std::mem::take(&mut self.late);
        self.tx.extend(late);
        self.idle_polls = 0;
    }

    fn poll(&mut self) -> Option<u8> {
        if self.tx.is_empty() && !self.late.is_empty() {
            self.idle_polls += 1;
            if self.idle_polls > LATE_POLLS {
                self.release_late();
            }
        }
        self.tx.pop_front()
    }

    /// Queue bytes for the host as if sent by the target
    pub fn inject(&mut self, data: &[u8]) {
        self.respond(data);
    }

    pub fn peek(&self, address: u32) -> u8 {
        self.memory.get(&address).copied().unwrap_or(0xFF)
    }

    pub fn load(&mut self, address: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.memory.insert(address + i as u32, *b);
        }
    }

    /// Count of times a command frame for `op` was received on the wire
    pub fn command_frames(&self, op: u8) -> usize {
        self.rx.windows(2).filter(|w| w[0] == op && w[1] == op ^ 0xFF).count()
    }
}

/// Shared handle to an emulated bootloader, cloned into the session as its port
#[derive(Clone)]
pub struct Emulator(pub Rc<RefCell<Device>>);

impl Emulator {
    /// Emulated v3.1 bootloader with extended erase
    pub fn new(product_id: u16) -> Self {
        let mut d = Device {
            product_id,
            version: 0x31,
            commands: vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x44, 0x63, 0x73, 0x82, 0x92],
            memory: BTreeMap::new(),
            nack_commands: vec![],
            nack_syncs: 0,
            silent: false,
            ignore_frames: 0,
            fail_after_writes: None,
            nack_params: 0,
            late_frames: 0,
            rx: vec![],
            opcodes: vec![],
            reads: vec![],
            writes: vec![],
            erased_pages: vec![],
            mass_erased: false,
            go: None,
            resets: 0,
            phase: Phase::Unsynced,
            buf: vec![],
            tx: VecDeque::new(),
            late: VecDeque::new(),
            idle_polls: 0,
        };

        d.load(OB_ADDRESS, &OptionBytes::default().encode(&STM32F1_OPTION_BYTES));

        Emulator(Rc::new(RefCell::new(d)))
    }

    /// Emulated v2.2 bootloader with the legacy one byte erase
    pub fn legacy(product_id: u16) -> Self {
        let e = Self::new(product_id);
        {
            let mut d = e.dev();
            d.version = 0x22;
            d.commands = vec![0x00, 0x01, 0x02, 0x11, 0x21, 0x31, 0x43, 0x63, 0x73, 0x82, 0x92];
        }
        e
    }

    pub fn dev(&self) -> std::cell::RefMut<'_, Device> {
        self.0.borrow_mut()
    }
}

impl Write<u8> for Emulator {
    type Error = EmuError;

    fn write(&mut self, word: u8) -> nb::Result<(), Self::Error> {
        self.0.borrow_mut().receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), Self::Error> {
        Ok(())
    }
}

impl Read<u8> for Emulator {
    type Error = EmuError;

    fn read(&mut self) -> nb::Result<u8, Self::Error> {
        self.0.borrow_mut().poll().ok_or(nb::Error::WouldBlock)
    }
}

impl SerialPort<EmuError> for Emulator {
    fn set_rts(&mut self, _level: bool) -> Result<(), EmuError> {
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), EmuError> {
        if level {
            self.0.borrow_mut().reset();
        }
        Ok(())
    }
}

pub type TestSession = Session<Emulator, NoDelay, EmuError>;

pub fn options() -> Options {
    Options {
        response_timeout_ms: 20,
        erase_timeout_ms: 50,
        init_delay_ms: 0,
        sync_attempts: 3,
        max_attempts: 3,
        ..Options::default()
    }
}

pub fn init_logging() {
    let _ = simplelog::TestLogger::init(simplelog::LevelFilter::Debug, simplelog::Config::default());
}

/// Connect a new session to a fresh emulator
pub fn connect(product_id: u16) -> (Emulator, TestSession) {
    init_logging();

    let emu = Emulator::new(product_id);
    let mut s = Session::new(options());
    s.connect(emu.clone(), NoDelay, 115_200)
        .expect("connect to emulator");

    (emu, s)
}
