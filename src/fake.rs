// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! In-memory NAND for tests.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::Config;
use crate::low_level::{
    BlockDevice, BlockRange, BlockRegion, BlockUsage, DeviceAttributes, DeviceInfo, PowerState,
    RawMeta, SectorMeta, META_LEN,
};

/// A single region of equally sized blocks at address 0. Programming ANDs
/// new bits into old ones, like the real thing.
pub struct FakeNand {
    bytes_per_block: u32,
    bytes_per_sector: u32,
    block_count: u32,
    data: Vec<u8>,
    meta: Vec<RawMeta>,
    erases: Vec<u32>,
    /// Number of upcoming data programs that will come out wrong.
    corrupt_programs: u32,
    pub power: PowerState,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FakeNandError {
    OutOfRange,
    Misaligned,
}

impl FakeNand {
    pub fn new(block_count: u32, bytes_per_block: u32, bytes_per_sector: u32) -> Self {
        let size = (block_count * bytes_per_block) as usize;
        let sectors = (block_count * bytes_per_block / bytes_per_sector) as usize;
        Self {
            bytes_per_block,
            bytes_per_sector,
            block_count,
            data: vec![0xFF; size],
            meta: vec![[0xFF; META_LEN]; sectors],
            erases: vec![0; block_count as usize],
            corrupt_programs: 0,
            power: PowerState::On,
        }
    }

    /// Makes the next `n` data programs clear one bit they shouldn't.
    pub fn corrupt_next_programs(&mut self, n: u32) {
        self.corrupt_programs = n;
    }

    pub fn erase_count(&self, block: u32) -> u32 {
        self.erases[block as usize]
    }

    pub fn total_erases(&self) -> u32 {
        self.erases.iter().sum()
    }

    pub fn meta(&self, sector_addr: u32) -> SectorMeta {
        SectorMeta::from_raw(&self.meta[(sector_addr / self.bytes_per_sector) as usize])
    }

    /// Overwrites metadata outright, bypassing the program rules.
    pub fn poke_meta(&mut self, sector_addr: u32, raw: RawMeta) {
        self.meta[(sector_addr / self.bytes_per_sector) as usize] = raw;
    }

    fn range(&self, addr: u32, len: usize) -> Result<core::ops::Range<usize>, FakeNandError> {
        let start = addr as usize;
        let end = start + len;
        if end > self.data.len() {
            return Err(FakeNandError::OutOfRange);
        }
        Ok(start..end)
    }

    fn meta_index(&self, sector_addr: u32) -> Result<usize, FakeNandError> {
        if sector_addr % self.bytes_per_sector != 0 {
            return Err(FakeNandError::Misaligned);
        }
        let i = (sector_addr / self.bytes_per_sector) as usize;
        if i >= self.meta.len() {
            return Err(FakeNandError::OutOfRange);
        }
        Ok(i)
    }
}

impl BlockDevice for FakeNand {
    type Error = FakeNandError;

    fn initialize(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn uninitialize(&mut self) -> Result<(), Self::Error> {
        Ok(())
    }

    fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            attributes: DeviceAttributes::default(),
            bytes_per_sector: self.bytes_per_sector,
            max_sector_write_us: 100,
            max_block_erase_us: 2000,
            regions: vec![BlockRegion {
                start: 0,
                num_blocks: self.block_count,
                bytes_per_block: self.bytes_per_block,
                ranges: vec![BlockRange {
                    usage: BlockUsage::FileSystem,
                    start_block: 0,
                    end_block: self.block_count - 1,
                }],
            }],
        }
    }

    fn read(&self, addr: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        let r = self.range(addr, dest.len())?;
        dest.copy_from_slice(&self.data[r]);
        Ok(())
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        let r = self.range(addr, data.len())?;
        let dest = &mut self.data[r];
        for (d, s) in dest.iter_mut().zip(data) {
            *d &= s;
        }
        if self.corrupt_programs > 0 {
            self.corrupt_programs -= 1;
            if let Some(d) = dest.iter_mut().find(|d| **d != 0) {
                *d &= *d - 1;
            }
        }
        Ok(())
    }

    fn sector_metadata(&self, sector_addr: u32) -> Result<RawMeta, Self::Error> {
        Ok(self.meta[self.meta_index(sector_addr)?])
    }

    fn set_sector_metadata(&mut self, sector_addr: u32, meta: &RawMeta) -> Result<(), Self::Error> {
        let i = self.meta_index(sector_addr)?;
        for (d, s) in self.meta[i].iter_mut().zip(meta) {
            *d &= s;
        }
        Ok(())
    }

    fn is_block_erased(&self, addr: u32, len: u32) -> Result<bool, Self::Error> {
        let r = self.range(addr, len as usize)?;
        Ok(self.data[r].iter().all(|&b| b == 0xFF))
    }

    fn erase_block(&mut self, block_addr: u32) -> Result<(), Self::Error> {
        if block_addr % self.bytes_per_block != 0 {
            return Err(FakeNandError::Misaligned);
        }
        let block = block_addr / self.bytes_per_block;
        if block >= self.block_count {
            return Err(FakeNandError::OutOfRange);
        }
        let r = self.range(block_addr, self.bytes_per_block as usize)?;
        self.data[r].fill(0xFF);
        let per_block = (self.bytes_per_block / self.bytes_per_sector) as usize;
        let first = block as usize * per_block;
        for m in &mut self.meta[first..first + per_block] {
            *m = [0xFF; META_LEN];
        }
        self.erases[block as usize] += 1;
        Ok(())
    }

    fn set_power_state(&mut self, state: PowerState) {
        self.power = state;
    }

    fn max_sector_write_us(&self) -> u32 {
        100
    }

    fn max_block_erase_us(&self) -> u32 {
        2000
    }
}

/// Config for tests: a tight retry bound so failure paths end quickly.
pub fn test_config() -> Config {
    Config { max_write_retries: 4, ..Config::default() }
}
