// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! A wear-leveling flash translation layer.
//!
//! `WearLeveling` wraps a raw `BlockDevice` whose blocks can only be
//! programmed from 1 to 0 and must be erased as a unit, and presents the same
//! `BlockDevice` interface upward with rewritable sectors. Rewrites are
//! absorbed by relocating sectors within a block, then by remapping whole
//! blocks, and only when both run out by compaction, which is the one place
//! erases happen on the layer's own initiative.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod config;
pub mod low_level;
pub mod map_field;

mod bad_blocks;
mod compact;
mod resolve;
mod write;

#[cfg(test)]
mod fake;

use core::fmt;

pub use crate::config::{Config, Geometry};
pub use crate::low_level::{
    BlockDevice, BlockRange, BlockRegion, BlockUsage, DeviceAttributes, DeviceInfo, PowerState,
    RawMeta,
};

use crate::low_level::BlockFlags;
use crate::resolve::Driver;
use crate::write::Payload;

/// Wear-leveling layer over a device `D`.
///
/// Every operation takes the same lock for its whole duration, so a
/// `WearLeveling` can be shared by reference.
pub struct WearLeveling<D: BlockDevice> {
    inner: spin::Mutex<Driver<D>>,
}

impl<D: BlockDevice> WearLeveling<D> {
    pub fn new(device: D, config: Config) -> Self {
        Self {
            inner: spin::Mutex::new(Driver::new(device, config)),
        }
    }

    /// Initializes the device and scans it for bad blocks and their
    /// replacements. Calling this on an initialized instance does nothing.
    pub fn initialize(&self) -> Result<(), Error<D::Error>> {
        let mut drv = self.inner.lock();
        logged("initialize", drv.initialize())
    }

    pub fn uninitialize(&self) -> Result<(), Error<D::Error>> {
        let mut drv = self.inner.lock();
        logged("uninitialize", drv.uninitialize())
    }

    pub fn is_initialized(&self) -> bool {
        self.inner.lock().geometry.is_some()
    }

    pub fn device_info(&self) -> DeviceInfo {
        self.inner.lock().device.device_info()
    }

    /// Geometry of the managed region, once initialized.
    pub fn geometry(&self) -> Option<Geometry> {
        self.inner.lock().geometry
    }

    pub fn read(&self, addr: u32, buf: &mut [u8]) -> Result<(), Error<D::Error>> {
        let mut drv = self.inner.lock();
        logged("read", drv.read(addr, buf))
    }

    /// Writes `data` at `addr`, sector by sector.
    ///
    /// Bytes of a partially written sector outside `data` are always
    /// preserved; `_read_modify_write` is accepted for interface parity with
    /// devices where it matters.
    pub fn write(
        &self,
        addr: u32,
        data: &[u8],
        _read_modify_write: bool,
    ) -> Result<(), Error<D::Error>> {
        let mut drv = self.inner.lock();
        logged("write", drv.write_span(addr, Payload::Bytes(data)))
    }

    pub fn memset(&self, addr: u32, value: u8, len: u32) -> Result<(), Error<D::Error>> {
        let mut drv = self.inner.lock();
        logged("memset", drv.write_span(addr, Payload::Fill(value, len as usize)))
    }

    /// Sector metadata belongs to this layer and is never exposed.
    pub fn sector_metadata(&self, _sector_addr: u32) -> Result<RawMeta, Error<D::Error>> {
        Err(Error::MetadataDenied)
    }

    /// Sector metadata belongs to this layer and can't be set from above.
    pub fn set_sector_metadata(
        &self,
        _sector_addr: u32,
        _meta: &RawMeta,
    ) -> Result<(), Error<D::Error>> {
        Err(Error::MetadataDenied)
    }

    /// Reports whether the block containing `addr` holds no data: either it
    /// was never written since its last erase, or it has been erased (lazily)
    /// since.
    pub fn is_block_erased(&self, addr: u32, len: u32) -> Result<bool, Error<D::Error>> {
        let mut drv = self.inner.lock();
        logged("is_block_erased", drv.is_block_erased(addr, len))
    }

    /// Erases the block containing `addr`.
    ///
    /// This only marks the block's current physical home as trash; the
    /// physical erase happens during a later compaction.
    pub fn erase_block(&self, addr: u32) -> Result<(), Error<D::Error>> {
        let mut drv = self.inner.lock();
        logged("erase_block", drv.erase_virtual_block(addr))
    }

    /// Runs a compaction pass. With `None` every reclaimable block is
    /// erased; with a block index only that block is, unless free space is
    /// low.
    pub fn compact(&self, hint: Option<u32>) -> Result<(), Error<D::Error>> {
        let mut drv = self.inner.lock();
        drv.geo()?;
        logged("compact", drv.compact(hint))
    }

    /// Erases every block that isn't bad and gives every bad block a fresh,
    /// empty replacement.
    pub fn format(&self) -> Result<(), Error<D::Error>> {
        let mut drv = self.inner.lock();
        logged("format", drv.format_all())
    }

    /// Physical address currently backing the virtual address `addr`.
    ///
    /// Resolving may allocate, exactly as a read would.
    pub fn physical_address(&self, addr: u32) -> Result<u32, Error<D::Error>> {
        let mut drv = self.inner.lock();
        logged("physical_address", drv.physical_address(addr))
    }

    /// Counts physical blocks by role.
    pub fn census(&self) -> Result<Census, Error<D::Error>> {
        let drv = self.inner.lock();
        drv.census()
    }

    pub fn set_power_state(&self, state: PowerState) {
        self.inner.lock().device.set_power_state(state)
    }

    pub fn max_sector_write_us(&self) -> u32 {
        self.inner.lock().device.max_sector_write_us()
    }

    pub fn max_block_erase_us(&self) -> u32 {
        self.inner.lock().device.max_block_erase_us()
    }

    /// Runs `body` against the underlying device while holding the lock.
    pub fn with_device<R>(&self, body: impl FnOnce(&mut D) -> R) -> R {
        body(&mut self.inner.lock().device)
    }

    pub fn into_inner(self) -> D {
        self.inner.into_inner().device
    }
}

fn logged<T, E: fmt::Debug>(op: &str, r: Result<T, Error<E>>) -> Result<T, Error<E>> {
    if let Err(e) = &r {
        log::error!("{} failed: {:?}", op, e);
    }
    r
}

impl<D: BlockDevice> BlockDevice for WearLeveling<D> {
    type Error = Error<D::Error>;

    fn initialize(&mut self) -> Result<(), Self::Error> {
        WearLeveling::initialize(self)
    }

    fn uninitialize(&mut self) -> Result<(), Self::Error> {
        WearLeveling::uninitialize(self)
    }

    fn device_info(&self) -> DeviceInfo {
        WearLeveling::device_info(self)
    }

    fn read(&self, addr: u32, dest: &mut [u8]) -> Result<(), Self::Error> {
        WearLeveling::read(self, addr, dest)
    }

    fn write(&mut self, addr: u32, data: &[u8]) -> Result<(), Self::Error> {
        WearLeveling::write(self, addr, data, true)
    }

    fn memset(&mut self, addr: u32, value: u8, len: u32) -> Result<(), Self::Error> {
        WearLeveling::memset(self, addr, value, len)
    }

    fn sector_metadata(&self, sector_addr: u32) -> Result<RawMeta, Self::Error> {
        WearLeveling::sector_metadata(self, sector_addr)
    }

    fn set_sector_metadata(&mut self, sector_addr: u32, meta: &RawMeta) -> Result<(), Self::Error> {
        WearLeveling::set_sector_metadata(self, sector_addr, meta)
    }

    fn is_block_erased(&self, addr: u32, len: u32) -> Result<bool, Self::Error> {
        WearLeveling::is_block_erased(self, addr, len)
    }

    fn erase_block(&mut self, block_addr: u32) -> Result<(), Self::Error> {
        WearLeveling::erase_block(self, block_addr)
    }

    fn set_power_state(&mut self, state: PowerState) {
        WearLeveling::set_power_state(self, state)
    }

    fn max_sector_write_us(&self) -> u32 {
        WearLeveling::max_sector_write_us(self)
    }

    fn max_block_erase_us(&self) -> u32 {
        WearLeveling::max_block_erase_us(self)
    }
}

/// Block counts by role, as reported by `WearLeveling::census`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Census {
    pub free: u32,
    pub in_use: u32,
    /// Blocks holding another virtual block's data.
    pub mapped: u32,
    /// Blocks holding a bad block's data.
    pub replacements: u32,
    pub trash: u32,
    pub bad: u32,
    pub unformatted: u32,
}

impl<D: BlockDevice> Driver<D> {
    fn census(&self) -> Result<Census, Error<D::Error>> {
        let geo = self.geo()?;
        let mut c = Census::default();
        for b in 0..geo.block_count {
            let meta = match self.block_meta(b) {
                Ok(meta) => meta,
                Err(Error::Device(_)) => {
                    c.bad += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };
            let flags = meta.block_flags();
            if meta.is_bad_block() {
                c.bad += 1;
            } else if !meta.is_formatted() {
                c.unformatted += 1;
            } else if meta.is_block_free() {
                c.free += 1;
            } else if flags.contains(BlockFlags::TRASH) {
                c.trash += 1;
            } else if flags.contains(BlockFlags::BAD_BLOCK_REPLACEMENT) {
                c.replacements += 1;
            } else if flags.contains(BlockFlags::MAPPED) {
                c.mapped += 1;
            } else {
                c.in_use += 1;
            }
        }
        Ok(c)
    }

    fn is_block_erased(&mut self, addr: u32, len: u32) -> Result<bool, Error<D::Error>> {
        let geo = self.checked_range(addr, len)?;
        let block = match self.lookup_block(geo.block_index(addr))? {
            Some(block) => block,
            None => return Ok(true),
        };
        let flags = self.block_meta(block)?.block_flags();
        Ok(!flags.contains(BlockFlags::DIRTY) || flags.contains(BlockFlags::TRASH))
    }

    fn erase_virtual_block(&mut self, addr: u32) -> Result<(), Error<D::Error>> {
        let geo = self.checked_range(addr, 1)?;
        let vblock = geo.block_index(addr);
        let block = match self.lookup_block(vblock)? {
            Some(block) => block,
            // Nothing is mapped, so nothing to erase.
            None => return Ok(()),
        };
        match self.block_meta(block) {
            Ok(meta) => {
                let flags = meta.block_flags();
                if flags.contains(BlockFlags::DIRTY) && !flags.contains(BlockFlags::TRASH) {
                    self.update_meta(block, 0, |m| m.mark_trash())?;
                    log::debug!("block {} (physical {}) marked trash", vblock, block);
                }
                Ok(())
            }
            Err(Error::Device(_)) => {
                log::warn!("unreadable metadata on block {}, formatting", block);
                self.format_block(block)
            }
            Err(e) => Err(e),
        }
    }

    fn physical_address(&mut self, addr: u32) -> Result<u32, Error<D::Error>> {
        let geo = self.checked_range(addr, 1)?;
        let (block, sector, _) =
            self.resolve_sector(geo.block_index(addr), geo.sector_index(addr))?;
        Ok(geo.sector_addr(block, sector) + (addr - geo.base) % geo.bytes_per_sector)
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Error<E> {
    /// The underlying device failed.
    Device(E),
    /// Every avenue for finding space (free sectors, remapping, compaction)
    /// has been exhausted.
    NoFreeSpace,
    /// Metadata of the given physical block is inconsistent.
    Corrupt(u32),
    /// The given virtual block is bad and no replacement could be found.
    Unmapped(u32),
    NotInitialized,
    /// The device geometry can't be managed with the given configuration.
    Geometry,
    OutOfRange,
    /// Sector metadata is private to this layer.
    MetadataDenied,
    /// A sector write kept failing verification.
    RetriesExhausted,
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Device(e)
    }
}

impl<E: fmt::Display> fmt::Display for Error<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(e) => write!(f, "device error: {}", e),
            Self::NoFreeSpace => f.write_str("no free space"),
            Self::Corrupt(b) => write!(f, "corrupt metadata in block {}", b),
            Self::Unmapped(b) => write!(f, "bad block {} has no replacement", b),
            Self::NotInitialized => f.write_str("not initialized"),
            Self::Geometry => f.write_str("unusable device geometry"),
            Self::OutOfRange => f.write_str("address out of range"),
            Self::MetadataDenied => f.write_str("sector metadata is not accessible"),
            Self::RetriesExhausted => f.write_str("too many bad sectors in one write"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{test_config, FakeNand, FakeNandError};
    use crate::low_level::META_LEN;
    use rand::{rngs::SmallRng, Rng, SeedableRng};

    const BLOCK: u32 = 4096;

    fn mounted(blocks: u32) -> WearLeveling<FakeNand> {
        let wl = WearLeveling::new(FakeNand::new(blocks, BLOCK, 512), test_config());
        wl.initialize().unwrap();
        wl.format().unwrap();
        wl
    }

    fn read_back(wl: &WearLeveling<FakeNand>, addr: u32, len: usize) -> Vec<u8> {
        let mut buf = vec![0; len];
        wl.read(addr, &mut buf).unwrap();
        buf
    }

    fn assert_same(addr: u32, got: &[u8], want: &[u8]) {
        if let Some(i) = got.iter().zip(want).position(|(g, w)| g != w) {
            let from = i.saturating_sub(16);
            let to = usize::min(i + 48, got.len());
            panic!(
                "mismatch at {:#x}\ngot: {}\nwant: {}",
                addr as usize + i,
                pretty_hex::pretty_hex(&&got[from..to]),
                pretty_hex::pretty_hex(&&want[from..to]),
            );
        }
    }

    #[test]
    fn rewrite_after_block_goes_bad() {
        let wl = mounted(16);

        wl.write(0, &[0xAA; 512], true).unwrap();
        assert_eq!(read_back(&wl, 0, 512), [0xAA; 512]);
        let first = wl.physical_address(0).unwrap();
        assert_eq!(first, 0);

        // 0x55 sets bits 0xAA cleared, so this one has to move.
        wl.write(0, &[0x55; 512], true).unwrap();
        let second = wl.physical_address(0).unwrap();
        assert_ne!(second, first);
        assert_eq!(second / BLOCK, 0, "a free sector in the same block should do");

        wl.with_device(|nand| nand.poke_meta(0, [0; META_LEN]));
        assert_eq!(read_back(&wl, 0, 512), [0x55; 512]);
        assert_ne!(wl.physical_address(0).unwrap() / BLOCK, 0);
        assert_eq!(wl.census().unwrap().bad, 1);
    }

    #[test]
    fn exhausted_device_keeps_what_it_has() {
        let wl = mounted(4);
        wl.write(0, &[0x0F; 4 * BLOCK as usize], true).unwrap();
        let erases = wl.with_device(|nand| nand.total_erases());

        // Every sector holds live data, so nothing can move anywhere.
        assert_eq!(wl.write(3 * 512, &[0xF0; 512], true), Err(Error::NoFreeSpace));

        assert_same(0, &read_back(&wl, 0, 4 * BLOCK as usize), &[0x0F; 4 * BLOCK as usize]);
        assert_eq!(wl.with_device(|nand| nand.total_erases()), erases);
        // Rewrites that only clear bits still fit in place.
        wl.write(3 * 512, &[0x03; 512], true).unwrap();
        assert_eq!(read_back(&wl, 3 * 512, 512), [0x03; 512]);
    }

    #[test]
    fn spans_across_blocks_read_back() {
        let wl = mounted(16);
        let mut model = vec![0xFF; 4 * BLOCK as usize];

        let long: Vec<u8> = (0..5000u32).map(|i| (i * 7) as u8).collect();
        wl.write(4000, &long, true).unwrap();
        model[4000..9000].copy_from_slice(&long);

        // Small writes over the same range, in between each other.
        for (i, addr) in [4090u32, 300, 8200, 4100, 12000, 4095].into_iter().enumerate() {
            let chunk = vec![i as u8 * 0x11; 20];
            wl.write(addr, &chunk, true).unwrap();
            model[addr as usize..addr as usize + 20].copy_from_slice(&chunk);
        }

        let got = read_back(&wl, 0, model.len());
        assert_same(0, &got, &model);
    }

    #[test]
    fn rewrites_remap_without_erasing() {
        let wl = mounted(16);
        let erases = wl.with_device(|nand| nand.total_erases());

        let mut homes = Vec::new();
        for i in 0..30 {
            let fill = if i % 2 == 0 { 0x0F } else { 0xF0 };
            wl.write(BLOCK, &[fill; 512], true).unwrap();
            assert_eq!(read_back(&wl, BLOCK, 512), [fill; 512]);
            homes.push(wl.physical_address(BLOCK).unwrap() / BLOCK);
        }
        homes.dedup();

        // Each block absorbs eight versions (one in place, seven relocated)
        // before the next remap.
        assert_eq!(homes, [1, 8, 12, 14]);
        assert_eq!(wl.with_device(|nand| nand.total_erases()), erases);
    }

    #[test]
    fn random_workload_keeps_data() {
        let wl = mounted(16);
        let mut rng = SmallRng::seed_from_u64(0x5745_4152);
        // Stay well inside the device so there is room to remap.
        let span = 6 * BLOCK as usize;
        let mut model = vec![0xFF; span];

        for _ in 0..300 {
            match rng.gen_range(0..20) {
                0 => {
                    let block = rng.gen_range(0..6) * BLOCK;
                    wl.erase_block(block).unwrap();
                    model[block as usize..(block + BLOCK) as usize].fill(0xFF);
                }
                1 => {
                    let before = wl.census().unwrap().free;
                    wl.compact(None).unwrap();
                    assert!(wl.census().unwrap().free >= before);
                }
                2 => wl.compact(Some(rng.gen_range(0..16))).unwrap(),
                _ => {
                    let addr = rng.gen_range(0..span - 1);
                    let len = rng.gen_range(1..=usize::min(1024, span - addr));
                    let mut data = vec![0; len];
                    rng.fill(&mut data[..]);
                    wl.write(addr as u32, &data, true).unwrap();
                    model[addr..addr + len].copy_from_slice(&data);
                }
            }

            let at = rng.gen_range(0..span - 512);
            assert_same(at as u32, &read_back(&wl, at as u32, 512), &model[at..at + 512]);
        }

        wl.compact(None).unwrap();
        assert_same(0, &read_back(&wl, 0, span), &model);
    }

    #[test]
    fn erase_is_lazy() {
        let wl = mounted(16);
        assert!(wl.is_block_erased(0, BLOCK).unwrap());

        wl.write(100, b"hello", true).unwrap();
        assert!(!wl.is_block_erased(0, BLOCK).unwrap());

        let erases = wl.with_device(|nand| nand.total_erases());
        wl.erase_block(0).unwrap();
        assert!(wl.is_block_erased(0, BLOCK).unwrap());
        assert_eq!(wl.with_device(|nand| nand.total_erases()), erases);
        assert_eq!(wl.census().unwrap().trash, 1);

        assert_eq!(read_back(&wl, 0, 512), [0xFF; 512]);
        wl.write(100, b"again", true).unwrap();
        assert_eq!(&read_back(&wl, 100, 5), b"again");
    }

    #[test]
    fn lifecycle() {
        let wl = WearLeveling::new(FakeNand::new(8, BLOCK, 512), test_config());
        assert!(!wl.is_initialized());
        assert_eq!(wl.read(0, &mut [0; 4]), Err(Error::NotInitialized));
        assert_eq!(wl.compact(None), Err(Error::NotInitialized));
        assert!(wl.geometry().is_none());

        wl.initialize().unwrap();
        wl.initialize().unwrap();
        assert!(wl.is_initialized());
        assert_eq!(wl.geometry().unwrap().block_count, 8);

        wl.uninitialize().unwrap();
        wl.uninitialize().unwrap();
        assert!(!wl.is_initialized());
    }

    #[test]
    fn rejects_what_it_cannot_do() {
        let wl = mounted(8);
        let end = 8 * BLOCK;
        assert_eq!(wl.read(end, &mut [0; 1]), Err(Error::OutOfRange));
        assert_eq!(wl.write(end - 2, &[0; 4], true), Err(Error::OutOfRange));
        assert_eq!(wl.erase_block(end), Err(Error::OutOfRange));
        assert_eq!(wl.sector_metadata(0), Err(Error::MetadataDenied));
        assert_eq!(wl.set_sector_metadata(0, &[0; META_LEN]), Err(Error::MetadataDenied));

        let geometry = WearLeveling::new(
            FakeNand::new(8, BLOCK, 512),
            Config { bytes_per_block: Some(3000), ..test_config() },
        );
        assert_eq!(geometry.initialize(), Err(Error::<FakeNandError>::Geometry));
    }

    /// Anything written against the plain device trait.
    fn scribble<B: BlockDevice>(dev: &mut B) -> Result<Vec<u8>, B::Error> {
        dev.write(10, &[1, 2, 3])?;
        dev.write(11, &[9])?;
        dev.memset(13, 0x77, 2)?;
        let mut buf = vec![0; 6];
        dev.read(10, &mut buf)?;
        Ok(buf)
    }

    #[test]
    fn stacks_as_a_block_device() {
        let mut wl = mounted(8);
        assert_eq!(scribble(&mut wl).unwrap(), [1, 9, 3, 0x77, 0x77, 0xFF]);
        assert_eq!(
            BlockDevice::sector_metadata(&wl, 0),
            Err(Error::MetadataDenied),
        );
        assert_eq!(wl.device_info().bytes_per_sector, 512);
    }

    #[test]
    fn power_and_timing_pass_through() {
        let wl = mounted(8);
        wl.set_power_state(PowerState::Standby);
        assert_eq!(wl.max_sector_write_us(), 100);
        assert_eq!(wl.max_block_erase_us(), 2000);
        assert_eq!(wl.into_inner().power, PowerState::Standby);
    }
}
