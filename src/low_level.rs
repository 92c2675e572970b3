// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

use alloc::vec::Vec;
use core::mem::size_of;
use zerocopy::{AsBytes, FromBytes, Unaligned};

use crate::map_field::BlockMap;

//////////////////////////////////////////////////////////////////////////////
// Convenience wrappers for zerocopy.

pub fn cast_prefix<T>(bytes: &[u8]) -> (&T, &[u8])
    where T: FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in record");
    (lv.into_ref(), rest)
}

pub(crate) fn cast_prefix_mut<T>(bytes: &mut [u8]) -> (&mut T, &mut [u8])
    where T: AsBytes + FromBytes + Unaligned,
{
    let (lv, rest) = zerocopy::LayoutVerified::<_, T>::new_unaligned_from_prefix(bytes)
        .expect("type does not fit in record");
    (lv.into_mut(), rest)
}

//////////////////////////////////////////////////////////////////////////////
// At-rest layout.

/// Shorthand for a `u16` in little-endian representation.
type U16LE = zerocopy::U16<byteorder::LittleEndian>;
/// Shorthand for a `u32` in little-endian representation.
type U32LE = zerocopy::U32<byteorder::LittleEndian>;

/// Size of the per-sector metadata record kept by the device, in bytes.
pub const META_LEN: usize = 16;

/// Raw per-sector metadata as the device stores it.
pub type RawMeta = [u8; META_LEN];

/// Link field value meaning "nothing written here yet".
pub const FREE_LINK: u16 = 0xFFFF;
/// Link field value meaning "this field has been used up".
pub const DEAD_LINK: u16 = 0x0000;

bitflags::bitflags! {
    /// Per-sector state. Stored active-low in `SectorMeta::sector_flags`: a
    /// flag is set once its bit has been programmed to 0.
    pub struct SectorFlags: u8 {
        const BAD       = 0x01;
        const READ_ONLY = 0x02;
        const DIRTY     = 0x04;
        const IN_USE    = 0x08;
        const MAPPED    = 0x10;
    }
}

bitflags::bitflags! {
    /// Per-block state, meaningful only in the metadata of a block's first
    /// sector. Stored active-low like `SectorFlags`.
    pub struct BlockFlags: u8 {
        const BAD_BLOCK_REPLACEMENT = 0x01;
        const TRASH                 = 0x04;
        const IN_USE                = 0x08;
        const MAPPED                = 0x10;
        const DIRTY                 = 0x20;
        const FORMATTED             = 0x80;
    }
}

/// Bits of `block_flags` that must all still read 1 for a block to be free.
/// `FORMATTED` is excluded: a formatted block that was never used is free.
const BLOCK_FREE_MASK: u8 = 0x3F;

/// Metadata record attached to every sector.
///
/// The first sector of a block also carries the block-level fields
/// (`block_offset`, `owner_block`, `block_flags`). Every field can only have
/// bits cleared between erases, which is why the map target is stored
/// inverted and in two generations; see `BlockMap`.
#[derive(Copy, Clone, Debug, FromBytes, AsBytes, Unaligned, Eq, PartialEq)]
#[repr(C)]
pub struct SectorMeta {
    /// Bit-inverted index of the physical block this virtual block maps to,
    /// first and second generation.
    pub block_offset: [U16LE; 2],
    /// Back-link to the virtual block whose data lives in this block.
    pub owner_block: U16LE,
    /// Sector index (within the block) of the first relocation hop for the
    /// virtual sector at this position.
    pub mapped_sector_offset: U16LE,
    /// Sector index continuing a relocation chain through this sector.
    pub linked_sector_offset: U16LE,
    /// Active-low `SectorFlags`.
    pub sector_flags: u8,
    /// Active-low `BlockFlags`.
    pub block_flags: u8,
    /// CRC of the payload at last successful write, or 0 if not tracked.
    pub crc: U32LE,
}

const _: () = assert!(size_of::<SectorMeta>() == META_LEN);

impl SectorMeta {
    /// Decodes a raw record.
    pub fn from_raw(raw: &RawMeta) -> Self {
        *cast_prefix::<Self>(raw).0
    }

    /// Encodes into the raw on-device representation.
    pub fn to_raw(&self) -> RawMeta {
        let mut raw = [0; META_LEN];
        *cast_prefix_mut::<Self>(&mut raw).0 = *self;
        raw
    }

    /// The state of metadata after an erase: every bit set.
    pub fn erased() -> Self {
        Self::from_raw(&[0xFF; META_LEN])
    }

    /// Metadata written to the first sector of a block right after it has
    /// been erased by the FTL.
    pub fn formatted() -> Self {
        let mut meta = Self::erased();
        meta.set_block_flags(BlockFlags::FORMATTED);
        meta
    }

    pub fn sector_flags(&self) -> SectorFlags {
        SectorFlags::from_bits_truncate(!self.sector_flags)
    }

    /// Sets `flags` (clears their bits). Never unsets anything.
    pub fn set_sector_flags(&mut self, flags: SectorFlags) {
        self.sector_flags &= !flags.bits();
    }

    pub fn block_flags(&self) -> BlockFlags {
        BlockFlags::from_bits_truncate(!self.block_flags)
    }

    /// Sets `flags` (clears their bits). Never unsets anything.
    pub fn set_block_flags(&mut self, flags: BlockFlags) {
        self.block_flags &= !flags.bits();
    }

    /// Marks the block as trash, which also severs its owner back-link.
    pub fn mark_trash(&mut self) {
        self.set_block_flags(BlockFlags::TRASH);
        self.owner_block = DEAD_LINK.into();
    }

    pub fn is_sector_free(&self) -> bool {
        let all = SectorFlags::all().bits();
        self.sector_flags & all == all
    }

    pub fn is_block_free(&self) -> bool {
        self.block_flags & BLOCK_FREE_MASK == BLOCK_FREE_MASK
    }

    pub fn is_formatted(&self) -> bool {
        self.block_flags().contains(BlockFlags::FORMATTED)
    }

    pub fn is_trash(&self) -> bool {
        self.block_flags().contains(BlockFlags::TRASH)
    }

    pub fn is_bad_block_replacement(&self) -> bool {
        self.block_flags().contains(BlockFlags::BAD_BLOCK_REPLACEMENT)
    }

    /// Heuristic bad-block test: every structural field reads as zero.
    ///
    /// A block whose metadata was zeroed by a failing part reads exactly like
    /// this; so would one that was programmed to zero for any other reason.
    /// Callers log when it fires.
    pub fn is_bad_block(&self) -> bool {
        self.block_offset[0].get() == 0
            && self.block_offset[1].get() == 0
            && self.owner_block.get() == 0
            && self.mapped_sector_offset.get() == 0
            && self.linked_sector_offset.get() == 0
            && self.sector_flags == 0
            && self.block_flags == 0
    }

    /// Owner back-link, if this block currently hosts another virtual block's
    /// data (as a remap target or as a bad-block replacement).
    pub fn owner_link(&self) -> Option<u16> {
        let flags = self.block_flags();
        if flags.contains(BlockFlags::TRASH)
            || !flags.intersects(BlockFlags::MAPPED | BlockFlags::BAD_BLOCK_REPLACEMENT)
        {
            return None;
        }
        match self.owner_block.get() {
            FREE_LINK => None,
            owner => Some(owner),
        }
    }

    /// First relocation hop for the sector at this position. Sector 0 is
    /// never a relocation target, so a zero link is as good as none.
    pub fn mapped_sector(&self) -> Option<u16> {
        match self.mapped_sector_offset.get() {
            FREE_LINK | DEAD_LINK => None,
            s => Some(s),
        }
    }

    pub fn linked_sector(&self) -> Option<u16> {
        match self.linked_sector_offset.get() {
            FREE_LINK | DEAD_LINK => None,
            s => Some(s),
        }
    }

    pub fn block_map(&self) -> BlockMap {
        BlockMap::new([self.block_offset[0].get(), self.block_offset[1].get()])
    }

    pub fn set_block_map(&mut self, map: BlockMap) {
        let [a, b] = map.raw();
        self.block_offset = [a.into(), b.into()];
    }

    /// Records `crc` if that only clears bits, otherwise stores the "not
    /// tracked" value 0.
    pub fn record_crc(&mut self, crc: u32) {
        if !self.crc.get() & crc != 0 {
            self.crc = 0.into();
        } else {
            self.crc = crc.into();
        }
    }

    /// Checks a payload against the stored CRC. A stored 0 accepts anything.
    pub fn crc_matches(&self, payload: &[u8]) -> bool {
        let stored = self.crc.get();
        stored == 0 || stored == sector_crc(payload)
    }

    /// Whether the payload under this metadata is live data of the sector at
    /// this position (as opposed to relocated data, stale data, or nothing).
    pub fn holds_direct_data(&self) -> bool {
        let flags = self.sector_flags();
        flags.contains(SectorFlags::IN_USE)
            && !flags.intersects(SectorFlags::BAD | SectorFlags::DIRTY | SectorFlags::MAPPED)
    }

    /// Whether this sector is a usable end of a relocation chain.
    pub fn holds_chain_data(&self) -> bool {
        let flags = self.sector_flags();
        flags.contains(SectorFlags::IN_USE)
            && !flags.intersects(SectorFlags::BAD | SectorFlags::DIRTY)
    }
}

/// CRC used to validate sector payloads.
pub fn sector_crc(payload: &[u8]) -> u32 {
    let algo = crc::Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    algo.checksum(payload)
}

//////////////////////////////////////////////////////////////////////////////
// Block device interface.

/// Intended use of a range of blocks, as advertised by the device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum BlockUsage {
    Bootstrap = 0x10,
    Code = 0x20,
    Config = 0x30,
    FileSystem = 0x40,
    Deployment = 0x50,
    Update = 0x60,
    SimpleA = 0x90,
    SimpleB = 0xA0,
    StorageA = 0xE0,
    StorageB = 0xF0,
}

/// Power states that can be requested of a device.
#[derive(Copy, Clone, Debug, Eq, PartialEq, num_derive::FromPrimitive)]
pub enum PowerState {
    Off = 0,
    On = 1,
    Standby = 2,
}

/// Inclusive range of block indexes within a region, tagged with a usage.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockRange {
    pub usage: BlockUsage,
    pub start_block: u32,
    pub end_block: u32,
}

/// Contiguous run of equally sized blocks.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct BlockRegion {
    /// Byte address of the first block.
    pub start: u32,
    pub num_blocks: u32,
    pub bytes_per_block: u32,
    pub ranges: Vec<BlockRange>,
}

impl BlockRegion {
    pub fn size(&self) -> u32 {
        self.num_blocks * self.bytes_per_block
    }
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct DeviceAttributes {
    pub removable: bool,
    pub supports_xip: bool,
    pub write_protected: bool,
}

/// Geometry and timing of a block device.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct DeviceInfo {
    pub attributes: DeviceAttributes,
    pub bytes_per_sector: u32,
    pub max_sector_write_us: u32,
    pub max_block_erase_us: u32,
    pub regions: Vec<BlockRegion>,
}

impl DeviceInfo {
    /// Byte size of the first region, which is the one the FTL manages.
    pub fn size(&self) -> u32 {
        self.regions.first().map(BlockRegion::size).unwrap_or(0)
    }

    /// Finds the first range tagged with `usage`, returning its starting byte
    /// address and the region and range indexes it was found at.
    pub fn find_for_block_usage(&self, usage: BlockUsage) -> Option<(u32, usize, usize)> {
        for (ri, region) in self.regions.iter().enumerate() {
            for (gi, range) in region.ranges.iter().enumerate() {
                if range.usage == usage {
                    let addr = region.start + range.start_block * region.bytes_per_block;
                    return Some((addr, ri, gi));
                }
            }
        }
        None
    }
}

/// Trait describing a raw NAND-like device with per-sector metadata.
///
/// Addresses are byte addresses in the device's own address space.
/// Programming (`write`, `memset`, `set_sector_metadata`) may only move bits
/// from 1 to 0; only `erase_block` moves bits back to 1. An implementation is
/// free to AND new data into old, to reject the program, or to do anything
/// else when asked to set a bit: callers that rely on it get what they
/// deserve.
pub trait BlockDevice {
    /// Error type that can be produced during device accesses.
    type Error: core::fmt::Debug;

    fn initialize(&mut self) -> Result<(), Self::Error>;

    fn uninitialize(&mut self) -> Result<(), Self::Error>;

    /// Returns the device geometry. Expected to be cheap and to return the
    /// same answer every time between `initialize` and `uninitialize`.
    fn device_info(&self) -> DeviceInfo;

    /// Reads `dest.len()` bytes starting at `addr`.
    fn read(&self, addr: u32, dest: &mut [u8]) -> Result<(), Self::Error>;

    /// Programs `data` starting at `addr`.
    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error>;

    /// Programs `len` copies of `value` starting at `addr`.
    ///
    /// The default implementation uses `write` in chunks.
    fn memset(&mut self, addr: u32, value: u8, len: u32) -> Result<(), Self::Error> {
        let chunk = [value; 64];
        let mut addr = addr;
        let mut left = len as usize;
        while left > 0 {
            let n = usize::min(left, chunk.len());
            self.write(addr, &chunk[..n])?;
            addr += n as u32;
            left -= n;
        }
        Ok(())
    }

    /// Reads the metadata record of the sector starting at `sector_addr`.
    fn sector_metadata(&self, sector_addr: u32) -> Result<RawMeta, Self::Error>;

    /// Programs the metadata record of the sector starting at `sector_addr`.
    fn set_sector_metadata(&mut self, sector_addr: u32, meta: &RawMeta) -> Result<(), Self::Error>;

    /// Checks whether `len` bytes starting at `addr` are erased.
    fn is_block_erased(&self, addr: u32, len: u32) -> Result<bool, Self::Error>;

    /// Erases the block starting at `block_addr`, data and metadata.
    fn erase_block(&mut self, block_addr: u32) -> Result<(), Self::Error>;

    fn set_power_state(&mut self, state: PowerState);

    fn max_sector_write_us(&self) -> u32;

    fn max_block_erase_us(&self) -> u32;
}
