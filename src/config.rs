// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use crate::low_level::{DeviceInfo, FREE_LINK};

/// Number of bad-sector retries allowed within a single sector write.
pub const DEFAULT_MAX_WRITE_RETRIES: u32 = 8;

/// Compaction erases every reclaimable block when fewer than
/// `block_count / DEFAULT_RECLAIM_DIVISOR` blocks are free.
pub const DEFAULT_RECLAIM_DIVISOR: u32 = 5;

/// Tunables for a `WearLeveling` instance.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Config {
    /// Block size presented to clients. `None` uses the block size of the
    /// device's first region.
    pub bytes_per_block: Option<u32>,
    pub max_write_retries: u32,
    pub reclaim_divisor: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bytes_per_block: None,
            max_write_retries: DEFAULT_MAX_WRITE_RETRIES,
            reclaim_divisor: DEFAULT_RECLAIM_DIVISOR,
        }
    }
}

/// Shape of the managed region, derived once at initialization.
///
/// Indices here are block and sector indices relative to the start of the
/// region; addresses are byte addresses in the device's address space.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Geometry {
    pub base: u32,
    pub bytes_per_sector: u32,
    pub bytes_per_block: u32,
    pub block_count: u32,
    pub sectors_per_block: u32,
    /// Smallest power of two not below `block_count`; the width of the index
    /// space the remap search walks.
    pub max_index: u32,
}

impl Geometry {
    /// Derives the geometry of region 0, or `None` if it can't be managed.
    pub fn new(info: &DeviceInfo, config: &Config) -> Option<Self> {
        let region = info.regions.first()?;
        let bytes_per_sector = info.bytes_per_sector;
        let bytes_per_block = config.bytes_per_block.unwrap_or(region.bytes_per_block);

        if bytes_per_sector == 0
            || bytes_per_block == 0
            || bytes_per_block % bytes_per_sector != 0
        {
            return None;
        }

        let block_count = region.size() / bytes_per_block;
        let sectors_per_block = bytes_per_block / bytes_per_sector;
        // Both have to fit in a link field without colliding with the free
        // link value.
        if block_count == 0
            || block_count >= u32::from(FREE_LINK)
            || sectors_per_block >= u32::from(FREE_LINK)
            || config.reclaim_divisor == 0
        {
            return None;
        }

        Some(Self {
            base: region.start,
            bytes_per_sector,
            bytes_per_block,
            block_count,
            sectors_per_block,
            max_index: block_count.next_power_of_two(),
        })
    }

    /// Byte size of the managed area.
    pub fn size(&self) -> u32 {
        self.block_count * self.bytes_per_block
    }

    pub fn contains(&self, addr: u32, len: u32) -> bool {
        addr >= self.base
            && u64::from(addr) + u64::from(len)
                <= u64::from(self.base) + u64::from(self.size())
    }

    pub fn block_addr(&self, block: u32) -> u32 {
        self.base + block * self.bytes_per_block
    }

    pub fn sector_addr(&self, block: u32, sector: u32) -> u32 {
        self.block_addr(block) + sector * self.bytes_per_sector
    }

    /// Index of the block containing `addr`.
    pub fn block_index(&self, addr: u32) -> u32 {
        (addr - self.base) / self.bytes_per_block
    }

    /// Index of the sector containing `addr`, within its block.
    pub fn sector_index(&self, addr: u32) -> u32 {
        ((addr - self.base) % self.bytes_per_block) / self.bytes_per_sector
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::low_level::{BlockRegion, DeviceAttributes};

    fn info(num_blocks: u32, bytes_per_block: u32) -> DeviceInfo {
        DeviceInfo {
            attributes: DeviceAttributes::default(),
            bytes_per_sector: 512,
            max_sector_write_us: 0,
            max_block_erase_us: 0,
            regions: alloc::vec![BlockRegion {
                start: 0x8000,
                num_blocks,
                bytes_per_block,
                ranges: alloc::vec![],
            }],
        }
    }

    #[test]
    fn geometry_from_region() {
        let geo = Geometry::new(&info(12, 4096), &Config::default()).unwrap();
        assert_eq!(geo.block_count, 12);
        assert_eq!(geo.sectors_per_block, 8);
        assert_eq!(geo.max_index, 16);
        assert_eq!(geo.block_addr(3), 0x8000 + 3 * 4096);
        assert_eq!(geo.block_index(0x8000 + 3 * 4096 + 700), 3);
        assert_eq!(geo.sector_index(0x8000 + 3 * 4096 + 700), 1);
        assert!(geo.contains(0x8000, 12 * 4096));
        assert!(!geo.contains(0x8000, 12 * 4096 + 1));
        assert!(!geo.contains(0x7FFF, 1));
    }

    #[test]
    fn config_block_size_overrides_region() {
        let config = Config { bytes_per_block: Some(2048), ..Config::default() };
        let geo = Geometry::new(&info(4, 4096), &config).unwrap();
        assert_eq!(geo.block_count, 8);
        assert_eq!(geo.sectors_per_block, 4);
    }

    #[test]
    fn unusable_geometry() {
        let config = Config { bytes_per_block: Some(1000), ..Config::default() };
        assert_eq!(Geometry::new(&info(4, 4096), &config), None);
        assert_eq!(Geometry::new(&info(0, 4096), &Config::default()), None);

        let mut no_regions = info(4, 4096);
        no_regions.regions.clear();
        assert_eq!(Geometry::new(&no_regions, &Config::default()), None);
    }
}
