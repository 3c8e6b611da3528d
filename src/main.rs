#[macro_use]
extern crate log;

use std::path::PathBuf;

use anyhow::{anyhow, Context};
use indicatif::{ProgressBar, ProgressStyle};
use structopt::StructOpt;

use simplelog::{Config, LevelFilter, SimpleLogger};

use stm32_serial_flasher::option_bytes::{self, WatchdogType};
use stm32_serial_flasher::{DeviceInfo, Options, Session};

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "57600")]
    baud: u32,

    #[structopt(flatten)]
    options: Options,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,

    #[structopt(subcommand)]
    operation: Operation,
}

#[derive(Clone, Debug, StructOpt)]
pub enum Operation {
    /// Display device and bootloader information
    Info,

    /// Read memory to a file, or dump as hex
    Read {
        /// Start address, defaults to the start of flash
        #[structopt(long, parse(try_from_str = parse_u32))]
        address: Option<u32>,

        /// Bytes to read (e.g. 300, 0x100, 4KiB), defaults to the whole flash
        #[structopt(long, parse(try_from_str = parse_size))]
        length: Option<usize>,

        /// Output file
        #[structopt(long)]
        file: Option<PathBuf>,
    },

    /// Write a binary image
    Write {
        /// Binary image to write
        file: PathBuf,

        /// Target address, defaults to the start of flash
        #[structopt(long, parse(try_from_str = parse_u32))]
        address: Option<u32>,

        /// Do not erase the pages covered by the image first
        #[structopt(long)]
        no_erase: bool,

        /// Do not read back and compare after writing
        #[structopt(long)]
        no_verify: bool,

        /// Start the application once written
        #[structopt(long)]
        go: bool,
    },

    /// Compare memory against a binary image
    Verify {
        file: PathBuf,

        #[structopt(long, parse(try_from_str = parse_u32))]
        address: Option<u32>,
    },

    /// Erase flash pages, or the whole flash if none are given
    Erase {
        /// Page indices to erase
        #[structopt(long)]
        pages: Vec<u16>,
    },

    /// Report blank and occupied flash pages
    Scan,

    /// Display or modify option bytes
    OptionBytes(OptionArgs),

    /// Jump to an application
    Go {
        #[structopt(parse(try_from_str = parse_u32))]
        address: Option<u32>,
    },

    /// Remove readout protection (erases the flash)
    Unprotect,
}

#[derive(Clone, Debug, StructOpt)]
pub struct OptionArgs {
    /// Enable or disable readout protection
    #[structopt(long)]
    read_protect: Option<bool>,

    /// Use the software (true) or hardware (false) watchdog
    #[structopt(long)]
    software_watchdog: Option<bool>,

    /// Reset when entering stop mode
    #[structopt(long)]
    reset_on_stop: Option<bool>,

    /// Reset when entering standby mode
    #[structopt(long)]
    reset_on_standby: Option<bool>,

    /// User data byte 0
    #[structopt(long, parse(try_from_str = parse_u8))]
    data0: Option<u8>,

    /// User data byte 1
    #[structopt(long, parse(try_from_str = parse_u8))]
    data1: Option<u8>,

    /// Write protection mask, WRP3..WRP0 as a 32 bit value (cleared bits are protected)
    #[structopt(long, parse(try_from_str = parse_u32))]
    write_protect: Option<u32>,
}

impl OptionArgs {
    fn is_empty(&self) -> bool {
        self.read_protect.is_none()
            && self.software_watchdog.is_none()
            && self.reset_on_stop.is_none()
            && self.reset_on_standby.is_none()
            && self.data0.is_none()
            && self.data1.is_none()
            && self.write_protect.is_none()
    }

    fn apply(&self, ob: &mut option_bytes::OptionBytes) {
        if let Some(v) = self.read_protect {
            ob.read_protect = v;
        }
        if let Some(v) = self.software_watchdog {
            ob.watchdog = if v {
                WatchdogType::Software
            } else {
                WatchdogType::Hardware
            };
        }
        if let Some(v) = self.reset_on_stop {
            ob.reset_on_stop = v;
        }
        if let Some(v) = self.reset_on_standby {
            ob.reset_on_standby = v;
        }
        if let Some(v) = self.data0 {
            ob.data0 = v;
        }
        if let Some(v) = self.data1 {
            ob.data1 = v;
        }
        if let Some(v) = self.write_protect {
            ob.write_protect = v.to_le_bytes();
        }
    }
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn parse_u8(s: &str) -> Result<u8, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u8::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn parse_size(s: &str) -> Result<usize, String> {
    if let Ok(v) = parse_u32(s) {
        return Ok(v as usize);
    }
    bytefmt::parse(s)
        .map(|v| v as usize)
        .map_err(|e| format!("invalid size '{}': {}", s, e))
}

fn progress_bar(len: usize, msg: &str) -> ProgressBar {
    let pb = ProgressBar::new(len as u64);

    pb.set_style(
        ProgressStyle::default_bar()
            .template("{msg} [{elapsed_precise}] {bar:40.cyan/blue} {bytes}/{total_bytes} ({eta})")
            .progress_chars("#>-"),
    );
    pb.set_message(msg);

    pb
}

fn print_info(info: &DeviceInfo) {
    let d = info.device;

    println!("Device:      {} (0x{:03x})", d.name, d.product_id);
    println!("Bootloader:  v{}", info.version);
    println!("Commands:    {:02x?}", info.commands);
    println!(
        "Flash:       0x{:08x} {} ({} pages of {})",
        d.flash.start,
        bytefmt::format(d.flash.size as u64),
        d.page_count(),
        bytefmt::format(d.page_size as u64)
    );
    println!(
        "RAM:         0x{:08x} {}",
        d.ram.start,
        bytefmt::format(d.ram.size as u64)
    );

    match &info.option_bytes {
        Some(ob) => print_option_bytes(ob, &d.option_bytes),
        None => println!("Option bytes: unavailable"),
    }
}

fn print_option_bytes(ob: &option_bytes::OptionBytes, layout: &option_bytes::OptionByteLayout) {
    println!("Option bytes:");
    println!("  Read protect:     {} (RDP 0x{:02x})", ob.read_protect, ob.rdp);
    println!("  Watchdog:         {:?}", ob.watchdog);
    println!("  Reset on standby: {}", ob.reset_on_standby);
    println!("  Reset on stop:    {}", ob.reset_on_stop);
    println!("  Data 0 / 1:       0x{:02x} 0x{:02x}", ob.data0, ob.data1);
    println!("  Write protect:    {:02x?}", ob.write_protect);
    println!("  Raw:              {}", option_bytes::to_hex_string(&ob.encode(layout)));
}

fn hex_dump(address: u32, data: &[u8]) {
    for (i, line) in data.chunks(16).enumerate() {
        println!("{:08x}: {}", address as usize + i * 16, hex::encode(line));
    }
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    let mut s = Session::new(o.options.clone());

    info!("Connecting to {} at {} baud", o.port, o.baud);

    let info = s
        .connect_linux(&o.port, o.baud)
        .with_context(|| format!("Error connecting to bootloader on {}", o.port))?;
    let device = info.device;

    match o.operation {
        Operation::Info => print_info(&info),
        Operation::Read {
            address,
            length,
            file,
        } => {
            let address = address.unwrap_or(device.flash.start);
            let length = length.unwrap_or(device.flash.size as usize);

            let pb = progress_bar(length, "Reading");
            let data = s.read_with_progress(address, length, |n, _| pb.set_position(n as u64))?;
            pb.finish_with_message("Read complete");

            match file {
                Some(f) => {
                    std::fs::write(&f, &data)
                        .with_context(|| format!("Error writing {}", f.display()))?;
                    info!("Read {} bytes into {}", data.len(), f.display());
                }
                None => hex_dump(address, &data),
            }
        }
        Operation::Write {
            file,
            address,
            no_erase,
            no_verify,
            go,
        } => {
            let address = address.unwrap_or(device.flash.start);
            let data =
                std::fs::read(&file).with_context(|| format!("Error reading {}", file.display()))?;

            if data.is_empty() {
                return Err(anyhow!("{} is empty", file.display()));
            }

            if !no_erase && device.flash.contains(address) {
                info!("Erasing {} bytes from 0x{:08x}", data.len(), address);
                s.erase_span(address, data.len())?;
            }

            let pb = progress_bar(data.len(), "Writing");
            s.write_with_progress(address, &data, |n, _| pb.set_position(n as u64))?;
            pb.finish_with_message("Write complete");

            if !no_verify {
                s.verify(address, &data)?;
                info!("Verified {} bytes", data.len());
            }

            if go {
                s.go(address)?;
            }
        }
        Operation::Verify { file, address } => {
            let address = address.unwrap_or(device.flash.start);
            let data =
                std::fs::read(&file).with_context(|| format!("Error reading {}", file.display()))?;

            s.verify(address, &data)?;
            info!("Verified {} bytes", data.len());
        }
        Operation::Erase { pages } => {
            if pages.is_empty() {
                s.erase_all()?;
                info!("Erased all flash pages");
            } else {
                s.erase_pages(&pages)?;
                info!("Erased {} pages", pages.len());
            }
        }
        Operation::Scan => {
            let pb = ProgressBar::new(device.page_count() as u64);
            let usage = s.scan_pages(|n, _| pb.set_position(n as u64))?;
            pb.finish_and_clear();

            for p in &usage {
                debug!("Page {} (0x{:08x}): {}", p.index, p.start, if p.blank { "blank" } else { "used" });
            }

            let blank = usage.iter().filter(|p| p.blank).count();
            info!("Occupied pages: {} Free pages: {}", usage.len() - blank, blank);
        }
        Operation::OptionBytes(args) => {
            let mut ob = s.read_option_bytes()?;

            if !args.is_empty() {
                args.apply(&mut ob);
                ob = s.write_option_bytes(&ob)?;
                info!("Option bytes written, device will reset");
            }

            print_option_bytes(&ob, &device.option_bytes);
        }
        Operation::Go { address } => {
            s.go(address.unwrap_or(device.flash.start))?;
        }
        Operation::Unprotect => {
            s.readout_unprotect()?;
            info!("Readout protection removed, flash erased");
        }
    }

    s.disconnect();

    Ok(())
}
