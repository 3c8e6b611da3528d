//! Option byte block encoding.
//!
//! The block is stored as pairs of `(value, !value)`. Bit positions within
//! the USER byte differ between families so they are carried in an
//! [`OptionByteLayout`] rather than hard coded here.

use crate::device::MemoryRegion;
use crate::error::OptionBytesError;

/// Size of the raw option byte block
pub const OPTION_BYTES_LEN: usize = 16;

const RDP: usize = 0;
const USER: usize = 2;
const DATA0: usize = 4;
const DATA1: usize = 6;
const WRP0: usize = 8;

/// Read protection level written when protection is enabled
const RDP_PROTECTED: u8 = 0x00;

/// Per-family option byte description
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OptionByteLayout {
    /// Memory mapped address of the block
    pub address: u32,
    /// RDP value meaning "not protected"
    pub rdp_key: u8,
    /// USER bit set when the watchdog is software enabled
    pub wdg_sw_bit: u8,
    /// USER bit cleared to reset on stop entry
    pub nrst_stop_bit: u8,
    /// USER bit cleared to reset on standby entry
    pub nrst_stdby_bit: u8,
}

impl OptionByteLayout {
    pub fn region(&self) -> MemoryRegion {
        MemoryRegion {
            start: self.address,
            size: OPTION_BYTES_LEN as u32,
        }
    }

    fn user_mask(&self) -> u8 {
        (1 << self.wdg_sw_bit) | (1 << self.nrst_stop_bit) | (1 << self.nrst_stdby_bit)
    }
}

/// STM32F1 option byte layout (PM0075)
pub const STM32F1_OPTION_BYTES: OptionByteLayout = OptionByteLayout {
    address: 0x1FFF_F800,
    rdp_key: 0xA5,
    wdg_sw_bit: 0,
    nrst_stop_bit: 1,
    nrst_stdby_bit: 2,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchdogType {
    /// Independent watchdog started by hardware on reset
    Hardware,
    /// Independent watchdog started by software
    Software,
}

/// Decoded option bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OptionBytes {
    pub read_protect: bool,
    /// RDP byte as read, written back unchanged while `read_protect` agrees with it
    pub rdp: u8,
    pub watchdog: WatchdogType,
    pub reset_on_standby: bool,
    pub reset_on_stop: bool,
    /// USER bits not described by the layout (e.g. BFB2 on XL-density parts)
    pub user_reserved: u8,
    pub data0: u8,
    pub data1: u8,
    /// Write protection bitmasks, a cleared bit protects the matching page group
    pub write_protect: [u8; 4],
}

impl Default for OptionBytes {
    /// Factory configuration
    fn default() -> Self {
        Self {
            read_protect: false,
            rdp: STM32F1_OPTION_BYTES.rdp_key,
            watchdog: WatchdogType::Software,
            reset_on_standby: false,
            reset_on_stop: false,
            user_reserved: !STM32F1_OPTION_BYTES.user_mask(),
            data0: 0xFF,
            data1: 0xFF,
            write_protect: [0xFF; 4],
        }
    }
}

impl OptionBytes {
    /// Decode a raw block, checking every complement pair
    pub fn decode(layout: &OptionByteLayout, raw: &[u8]) -> Result<Self, OptionBytesError> {
        if raw.len() != OPTION_BYTES_LEN {
            return Err(OptionBytesError::Length {
                expected: OPTION_BYTES_LEN,
                actual: raw.len(),
            });
        }

        for (i, pair) in raw.chunks_exact(2).enumerate() {
            if pair[0] ^ pair[1] != 0xFF {
                return Err(OptionBytesError::Complement {
                    offset: i * 2,
                    value: pair[0],
                    complement: pair[1],
                });
            }
        }

        let user = raw[USER];
        let bit = |b: u8| user & (1 << b) != 0;

        Ok(Self {
            read_protect: raw[RDP] != layout.rdp_key,
            rdp: raw[RDP],
            watchdog: if bit(layout.wdg_sw_bit) {
                WatchdogType::Software
            } else {
                WatchdogType::Hardware
            },
            reset_on_stop: !bit(layout.nrst_stop_bit),
            reset_on_standby: !bit(layout.nrst_stdby_bit),
            user_reserved: user & !layout.user_mask(),
            data0: raw[DATA0],
            data1: raw[DATA1],
            write_protect: [raw[WRP0], raw[WRP0 + 2], raw[WRP0 + 4], raw[WRP0 + 6]],
        })
    }

    /// Encode to a raw block with regenerated complements
    pub fn encode(&self, layout: &OptionByteLayout) -> [u8; OPTION_BYTES_LEN] {
        let mut user = self.user_reserved & !layout.user_mask();
        if self.watchdog == WatchdogType::Software {
            user |= 1 << layout.wdg_sw_bit;
        }
        if !self.reset_on_stop {
            user |= 1 << layout.nrst_stop_bit;
        }
        if !self.reset_on_standby {
            user |= 1 << layout.nrst_stdby_bit;
        }

        let rdp = match self.read_protect {
            false => layout.rdp_key,
            true if self.rdp == layout.rdp_key => RDP_PROTECTED,
            true => self.rdp,
        };

        let values = [
            rdp,
            user,
            self.data0,
            self.data1,
            self.write_protect[0],
            self.write_protect[1],
            self.write_protect[2],
            self.write_protect[3],
        ];

        let mut raw = [0u8; OPTION_BYTES_LEN];
        for (i, v) in values.iter().enumerate() {
            raw[i * 2] = *v;
            raw[i * 2 + 1] = !*v;
        }
        raw
    }

    /// Whether the page group guarded by write protect bit `group` is protected
    pub fn is_write_protected(&self, group: usize) -> bool {
        match self.write_protect.get(group / 8) {
            Some(b) => b & (1 << (group % 8)) == 0,
            None => false,
        }
    }
}

/// Render a raw block as space separated hex pairs
pub fn to_hex_string(raw: &[u8]) -> String {
    raw.iter()
        .map(|b| format!("{:02X}", b))
        .collect::<Vec<_>>()
        .join(" ")
}
