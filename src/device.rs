//! Device descriptions for the supported STM32 families.
//!
//! Devices are looked up by the product ID returned from the `GetId`
//! command. All entries are static; a session borrows the matching
//! descriptor for its lifetime.

use crate::option_bytes::{OptionByteLayout, STM32F1_OPTION_BYTES};

pub const FLASH_BASE: u32 = 0x0800_0000;
pub const SRAM_BASE: u32 = 0x2000_0000;

/// RAM used by the F1 bootloader itself, writes below this corrupt the loader
pub const BOOTLOADER_RAM_RESERVED: u32 = 0x200;

/// A contiguous address range on the target
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryRegion {
    pub start: u32,
    pub size: u32,
}

impl MemoryRegion {
    /// Create a region, returning `None` if it is empty or wraps the address space
    pub fn new(start: u32, size: u32) -> Option<Self> {
        if size == 0 || start.checked_add(size - 1).is_none() {
            return None;
        }
        Some(Self { start, size })
    }

    /// Exclusive end address
    pub fn end(&self) -> u64 {
        self.start as u64 + self.size as u64
    }

    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && (address as u64) < self.end()
    }

    /// Whether every byte of `address..address+len` lies within the region
    pub fn contains_span(&self, address: u32, len: usize) -> bool {
        len != 0 && self.contains(address) && address as u64 + len as u64 <= self.end()
    }
}

/// A single erasable flash page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashPage {
    pub index: u16,
    pub start: u32,
    pub size: u32,
}

impl FlashPage {
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && (address as u64) < self.start as u64 + self.size as u64
    }
}

/// Memory areas accessible through the bootloader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Region {
    Flash,
    Ram,
    OptionBytes,
}

/// Static description of a chip family
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceDescriptor {
    pub name: &'static str,
    pub product_id: u16,
    pub flash: MemoryRegion,
    pub ram: MemoryRegion,
    pub page_size: u32,
    pub option_bytes: OptionByteLayout,
}

impl DeviceDescriptor {
    pub fn page_count(&self) -> u16 {
        (self.flash.size / self.page_size) as u16
    }

    /// Fetch a page by index
    pub fn page(&self, index: u16) -> Option<FlashPage> {
        if index >= self.page_count() {
            return None;
        }

        Some(FlashPage {
            index,
            start: self.flash.start + index as u32 * self.page_size,
            size: self.page_size,
        })
    }

    /// Page table in ascending address order
    pub fn pages(&self) -> impl Iterator<Item = FlashPage> + '_ {
        (0..self.page_count()).filter_map(move |i| self.page(i))
    }

    pub fn page_containing(&self, address: u32) -> Option<FlashPage> {
        if !self.flash.contains(address) {
            return None;
        }
        self.page(((address - self.flash.start) / self.page_size) as u16)
    }

    /// Indices of every page touched by a flash span
    pub fn pages_for_span(&self, address: u32, len: usize) -> Option<Vec<u16>> {
        if !self.flash.contains_span(address, len) {
            return None;
        }

        let first = self.page_containing(address)?.index;
        let last = self.page_containing(address + (len - 1) as u32)?.index;
        Some((first..=last).collect())
    }

    /// Region containing the whole span, if any
    pub fn region_for_span(&self, address: u32, len: usize) -> Option<Region> {
        if self.flash.contains_span(address, len) {
            Some(Region::Flash)
        } else if self.ram.contains_span(address, len) {
            Some(Region::Ram)
        } else if self.option_bytes.region().contains_span(address, len) {
            Some(Region::OptionBytes)
        } else {
            None
        }
    }
}

const fn f1(
    name: &'static str,
    product_id: u16,
    flash_size: u32,
    page_size: u32,
    ram_size: u32,
) -> DeviceDescriptor {
    DeviceDescriptor {
        name,
        product_id,
        flash: MemoryRegion {
            start: FLASH_BASE,
            size: flash_size,
        },
        ram: MemoryRegion {
            start: SRAM_BASE + BOOTLOADER_RAM_RESERVED,
            size: ram_size - BOOTLOADER_RAM_RESERVED,
        },
        page_size,
        option_bytes: STM32F1_OPTION_BYTES,
    }
}

/// Known devices
pub const DEVICES: &[DeviceDescriptor] = &[
    f1("STM32F10xxx Low-density", 0x412, 0x8000, 0x400, 0x2800),
    f1("STM32F10xxx Medium-density", 0x410, 0x2_0000, 0x400, 0x5000),
    f1("STM32F10xxx High-density", 0x414, 0x8_0000, 0x800, 0x1_0000),
    f1("STM32F10xxx XL-density", 0x430, 0x10_0000, 0x800, 0x1_8000),
    f1("STM32F105/107 Connectivity line", 0x418, 0x4_0000, 0x800, 0x1_0000),
    f1("STM32F100xx Medium-density value line", 0x420, 0x2_0000, 0x400, 0x2000),
    f1("STM32F100xx High-density value line", 0x428, 0x8_0000, 0x800, 0x8000),
];

/// Find the descriptor for a product ID
pub fn lookup(product_id: u16) -> Option<&'static DeviceDescriptor> {
    DEVICES.iter().find(|d| d.product_id == product_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn region_bounds() {
        let r = MemoryRegion::new(0x0800_0000, 0x100).unwrap();
        assert!(r.contains(0x0800_0000));
        assert!(r.contains(0x0800_00FF));
        assert!(!r.contains(0x0800_0100));
        assert!(!r.contains(0x07FF_FFFF));

        assert!(r.contains_span(0x0800_0000, 0x100));
        assert!(!r.contains_span(0x0800_0001, 0x100));
        assert!(!r.contains_span(0x0800_0000, 0));

        assert!(MemoryRegion::new(0xFFFF_FF00, 0x100).is_some());
        assert!(MemoryRegion::new(0xFFFF_FF00, 0x101).is_none());
        assert!(MemoryRegion::new(0x1000, 0).is_none());
    }

    #[test]
    fn page_tables_partition_flash() {
        for d in DEVICES {
            assert_eq!(d.flash.size % d.page_size, 0, "{}", d.name);
            assert!(MemoryRegion::new(d.flash.start, d.flash.size).is_some());
            assert!(MemoryRegion::new(d.ram.start, d.ram.size).is_some());

            let pages: Vec<_> = d.pages().collect();
            assert_eq!(pages.len(), d.page_count() as usize);
            assert_eq!(pages.iter().map(|p| p.size as u64).sum::<u64>(), d.flash.size as u64);
            assert_eq!(pages[0].start, d.flash.start);

            for w in pages.windows(2) {
                assert_eq!(w[0].start + w[0].size, w[1].start, "{}", d.name);
                assert_eq!(w[0].index + 1, w[1].index);
            }

            let last = pages.last().unwrap();
            assert_eq!(last.start as u64 + last.size as u64, d.flash.end());
        }
    }

    #[test]
    fn regions_do_not_overlap() {
        for d in DEVICES {
            let ob = d.option_bytes.region();
            assert!(d.flash.end() <= d.ram.start as u64 || d.ram.end() <= d.flash.start as u64);
            assert!(!d.flash.contains(ob.start) && !d.ram.contains(ob.start));
        }
    }

    #[test]
    fn medium_density_lookup() {
        let d = lookup(0x410).unwrap();
        assert_eq!(d.flash, MemoryRegion { start: 0x0800_0000, size: 0x2_0000 });
        assert_eq!(d.page_count(), 128);
        assert_eq!(d.page(127).unwrap().start, 0x0801_FC00);
        assert_eq!(d.page(128), None);
        assert!(lookup(0x999).is_none());
    }

    #[test]
    fn span_helpers() {
        let d = lookup(0x410).unwrap();
        assert_eq!(d.page_containing(0x0800_0400).unwrap().index, 1);
        assert_eq!(d.pages_for_span(0x0800_03FF, 2), Some(vec![0, 1]));
        assert_eq!(d.pages_for_span(0x0801_FFFF, 2), None);

        assert_eq!(d.region_for_span(0x0800_0000, 300), Some(Region::Flash));
        assert_eq!(d.region_for_span(0x2000_0200, 16), Some(Region::Ram));
        assert_eq!(d.region_for_span(0x1FFF_F800, 16), Some(Region::OptionBytes));
        assert_eq!(d.region_for_span(0x2000_0000, 16), None);
        assert_eq!(d.region_for_span(0x0801_FFF0, 32), None);
    }
}
