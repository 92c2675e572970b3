// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Virtual to physical resolution, at block and at sector granularity.

use alloc::vec;
use log::{debug, info, trace, warn};

use crate::bad_blocks::{BadBlockTable, Salvage};
use crate::config::{Config, Geometry};
use crate::low_level::{BlockDevice, BlockFlags, SectorFlags, SectorMeta};
use crate::write::{Carry, Payload, Placement};
use crate::Error;

/// State behind the `WearLeveling` lock.
pub(crate) struct Driver<D: BlockDevice> {
    pub(crate) device: D,
    pub(crate) config: Config,
    /// `Some` exactly while initialized.
    pub(crate) geometry: Option<Geometry>,
    pub(crate) bad_blocks: BadBlockTable,
    /// Blocks held as compaction scratch space, which no allocator may hand
    /// out.
    pub(crate) reserved: Option<[u32; 2]>,
}

/// Outcome of looking for a virtual sector's home inside a physical block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum SectorSlot {
    /// The sector's data lives (or will live) at `sector`. `direct` is set
    /// when that is the sector's own position in the block.
    Found { sector: u32, direct: bool },
    /// A relocation hop is needed and every sector in the block is taken.
    BlockFull,
}

/// Where `relocate_block` left a virtual block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Relocated {
    pub(crate) block: u32,
    /// The carried sector went along with the copy and needs no further
    /// write.
    pub(crate) carried: bool,
}

/// Full passes a block copy gets before its failure is surfaced. The
/// destination is erased between passes.
const COPY_ATTEMPTS: u32 = 3;

impl<D: BlockDevice> Driver<D> {
    pub(crate) fn new(device: D, config: Config) -> Self {
        Self {
            device,
            config,
            geometry: None,
            bad_blocks: BadBlockTable::default(),
            reserved: None,
        }
    }

    pub(crate) fn initialize(&mut self) -> Result<(), Error<D::Error>> {
        if self.geometry.is_some() {
            return Ok(());
        }
        self.device.initialize()?;
        let info = self.device.device_info();
        let geo = Geometry::new(&info, &self.config).ok_or(Error::Geometry)?;
        self.geometry = Some(geo);

        if let Err(e) = self.scan_bad_blocks() {
            self.geometry = None;
            self.bad_blocks.clear();
            return Err(e);
        }
        info!(
            "wear leveling over {} blocks of {} bytes ({} sectors each)",
            geo.block_count, geo.bytes_per_block, geo.sectors_per_block,
        );
        Ok(())
    }

    pub(crate) fn uninitialize(&mut self) -> Result<(), Error<D::Error>> {
        if self.geometry.take().is_none() {
            return Ok(());
        }
        self.bad_blocks.clear();
        self.device.uninitialize()?;
        Ok(())
    }

    pub(crate) fn geo(&self) -> Result<Geometry, Error<D::Error>> {
        self.geometry.ok_or(Error::NotInitialized)
    }

    /// Checks that `addr..addr + len` lies in the managed region.
    pub(crate) fn checked_range(&self, addr: u32, len: u32) -> Result<Geometry, Error<D::Error>> {
        let geo = self.geo()?;
        if !geo.contains(addr, len) {
            return Err(Error::OutOfRange);
        }
        Ok(geo)
    }

    //////////////////////////////////////////////////////////////////////////
    // Metadata access.

    pub(crate) fn read_meta(&self, block: u32, sector: u32) -> Result<SectorMeta, Error<D::Error>> {
        let geo = self.geo()?;
        let raw = self.device.sector_metadata(geo.sector_addr(block, sector))?;
        Ok(SectorMeta::from_raw(&raw))
    }

    pub(crate) fn block_meta(&self, block: u32) -> Result<SectorMeta, Error<D::Error>> {
        self.read_meta(block, 0)
    }

    /// Read-modify-write of a sector's metadata. `f` must only set flags and
    /// fill in unused fields, since the device can't set bits.
    pub(crate) fn update_meta(
        &mut self,
        block: u32,
        sector: u32,
        f: impl FnOnce(&mut SectorMeta),
    ) -> Result<SectorMeta, Error<D::Error>> {
        let geo = self.geo()?;
        let mut meta = self.read_meta(block, sector)?;
        f(&mut meta);
        self.device.set_sector_metadata(geo.sector_addr(block, sector), &meta.to_raw())?;
        Ok(meta)
    }

    pub(crate) fn read_payload(&self, block: u32, sector: u32, buf: &mut [u8]) -> Result<(), Error<D::Error>> {
        let geo = self.geo()?;
        self.device.read(geo.sector_addr(block, sector), buf)?;
        Ok(())
    }

    pub(crate) fn is_reserved(&self, block: u32) -> bool {
        self.reserved.map_or(false, |r| r.contains(&block))
    }

    /// Whether a block can be handed out as a fresh home for some data.
    pub(crate) fn is_allocatable(&self, block: u32, meta: &SectorMeta) -> bool {
        !self.is_reserved(block) && meta.is_block_free() && !meta.block_map().is_valid()
    }

    /// Erases a block and stamps it formatted. Bad blocks are never erased.
    pub(crate) fn format_block(&mut self, block: u32) -> Result<(), Error<D::Error>> {
        let geo = self.geo()?;
        if let Ok(meta) = self.block_meta(block) {
            if meta.is_bad_block() {
                warn!("refusing to erase bad block {}", block);
                return Ok(());
            }
        }
        self.device.erase_block(geo.block_addr(block))?;
        self.device
            .set_sector_metadata(geo.block_addr(block), &SectorMeta::formatted().to_raw())?;
        trace!("formatted block {}", block);
        Ok(())
    }

    //////////////////////////////////////////////////////////////////////////
    // Block resolution.

    /// Finds the physical block currently holding virtual block `vblock`
    /// without changing anything. `None` means the block has no usable home
    /// and a new one must be allocated.
    pub(crate) fn lookup_block(&self, vblock: u32) -> Result<Option<u32>, Error<D::Error>> {
        let geo = self.geo()?;
        if vblock >= geo.block_count {
            return Err(Error::OutOfRange);
        }
        let meta = self.block_meta(vblock)?;

        if meta.is_bad_block() {
            let found = match self.bad_blocks.lookup_virtual(vblock) {
                Some(r) => {
                    let rmeta = self.block_meta(r)?;
                    let live = rmeta.is_bad_block_replacement()
                        && rmeta.owner_link() == Some(vblock as u16);
                    live.then(|| r)
                }
                None => None,
            };
            trace!("bad block {} -> {:?}", vblock, found);
            return Ok(found);
        }

        match meta.block_map().current_target() {
            Some(target) => {
                let target = u32::from(target);
                if target >= geo.block_count {
                    return Err(Error::Corrupt(vblock));
                }
                let tmeta = self.block_meta(target)?;
                if tmeta.owner_link() == Some(vblock as u16) && !tmeta.is_bad_block_replacement() {
                    trace!("block {} mapped to {}", vblock, target);
                    Ok(Some(target))
                } else {
                    trace!("block {} has a stale mapping to {}", vblock, target);
                    Ok(None)
                }
            }
            None => {
                let taken = BlockFlags::MAPPED | BlockFlags::TRASH | BlockFlags::BAD_BLOCK_REPLACEMENT;
                if meta.block_flags().intersects(taken) {
                    Ok(None)
                } else {
                    Ok(Some(vblock))
                }
            }
        }
    }

    /// Finds the physical block for `vblock`, allocating a new home if it
    /// has none. May compact.
    pub(crate) fn resolve_block(&mut self, vblock: u32) -> Result<u32, Error<D::Error>> {
        if let Some(block) = self.lookup_block(vblock)? {
            return Ok(block);
        }

        if self.block_meta(vblock)?.is_bad_block() {
            return match self.bad_blocks.lookup_virtual(vblock) {
                // The replacement was erased; the data went with it.
                Some(_) => self.replace_bad_block(vblock, Salvage::Nothing),
                None => self.substitute_bad_block(vblock),
            };
        }

        let mut compacted = false;
        loop {
            if let Some(new) = self.allocate_remap_block(vblock)? {
                self.replace_block(vblock, None, new, None)?;
                return Ok(new);
            }
            if compacted {
                return Err(Error::NoFreeSpace);
            }
            info!("no remap target for block {}, compacting", vblock);
            self.compact(None)?;
            compacted = true;
            if let Some(block) = self.lookup_block(vblock)? {
                return Ok(block);
            }
        }
    }

    /// Picks a free physical block that `vblock`'s map field can still be
    /// pointed at, spending as few of the field's remaining bits as possible.
    pub(crate) fn allocate_remap_block(&self, vblock: u32) -> Result<Option<u32>, Error<D::Error>> {
        let geo = self.geo()?;
        let map = self.block_meta(vblock)?.block_map();

        for cand in map.candidates(geo.block_count, geo.max_index) {
            let cand32 = u32::from(cand);
            if cand32 == vblock || !map.can_accept(cand) {
                continue;
            }
            match self.block_meta(cand32) {
                Ok(meta) if self.is_allocatable(cand32, &meta) => {
                    debug!("remap target for block {}: {}", vblock, cand32);
                    return Ok(Some(cand32));
                }
                Ok(_) => (),
                Err(Error::Device(e)) => {
                    warn!("skipping remap candidate {}: {:?}", cand32, e);
                }
                Err(e) => return Err(e),
            }
        }
        Ok(None)
    }

    /// Makes `new` the home of virtual block `vblock`. With `from`, the live
    /// data of that block (with `carry` laid over it) is copied over first
    /// and the block is then trashed.
    pub(crate) fn replace_block(
        &mut self,
        vblock: u32,
        from: Option<u32>,
        new: u32,
        carry: Option<Carry<'_>>,
    ) -> Result<(), Error<D::Error>> {
        if let Some(src) = from {
            self.copy_block_contents(src, new, carry)?;
        }

        let vmeta = self.block_meta(vblock)?;
        if new != vblock && !vmeta.is_bad_block() {
            let mut map = vmeta.block_map();
            if !map.try_advance(new as u16) {
                return Err(Error::NoFreeSpace);
            }
            self.update_meta(vblock, 0, |m| m.set_block_map(map))?;
        }

        self.update_meta(new, 0, |m| {
            if new == vblock {
                m.set_block_flags(BlockFlags::IN_USE);
            } else {
                m.set_block_flags(BlockFlags::IN_USE | BlockFlags::MAPPED);
                m.owner_block = (vblock as u16).into();
            }
        })?;

        if let Some(src) = from {
            if src != new {
                self.update_meta(src, 0, |m| m.mark_trash())?;
            }
        }
        debug!("block {} now lives in {}", vblock, new);
        Ok(())
    }

    /// Moves virtual block `vblock` to a new physical block because its
    /// current one has no free sectors left. `carry` replaces one sector's
    /// contents in the copy.
    ///
    /// Nothing in the current block is touched until the copy is done, so a
    /// failure leaves the old data readable. If even compaction finds no new
    /// block, the (possibly collapsed) current block is returned uncarried.
    pub(crate) fn relocate_block(
        &mut self,
        vblock: u32,
        carry: Option<Carry<'_>>,
    ) -> Result<Relocated, Error<D::Error>> {
        let mut compacted = false;
        loop {
            let current = self.resolve_block(vblock)?;
            if self.block_meta(vblock)?.is_bad_block() {
                let block = self.replace_bad_block(vblock, Salvage::Block(current, carry))?;
                return Ok(Relocated { block, carried: carry.is_some() });
            }
            if let Some(new) = self.allocate_remap_block(vblock)? {
                self.replace_block(vblock, Some(current), new, carry)?;
                return Ok(Relocated { block: new, carried: carry.is_some() });
            }
            if compacted {
                return Ok(Relocated { block: current, carried: false });
            }
            info!("block {} is full and can't be remapped, compacting", vblock);
            self.compact(None)?;
            compacted = true;
        }
    }

    //////////////////////////////////////////////////////////////////////////
    // Sector resolution.

    /// Highest free sector of `block` other than `except`. Sector 0 is
    /// never a relocation target.
    pub(crate) fn next_free_sector(&self, block: u32, except: u32) -> Result<Option<u32>, Error<D::Error>> {
        let geo = self.geo()?;
        for sector in (1..geo.sectors_per_block).rev() {
            if sector != except && self.read_meta(block, sector)?.is_sector_free() {
                return Ok(Some(sector));
            }
        }
        Ok(None)
    }

    /// Follows `sector`'s relocation chain inside `block` to the place its
    /// data lives, allocating a first hop if the sector's own slot can't be
    /// used.
    pub(crate) fn locate_sector(&mut self, block: u32, sector: u32) -> Result<SectorSlot, Error<D::Error>> {
        let geo = self.geo()?;
        let spb = geo.sectors_per_block;
        let mut cur = sector;
        let mut direct = true;

        for _ in 0..=spb {
            let meta = self.read_meta(block, cur)?;
            let link = if direct { meta.mapped_sector() } else { meta.linked_sector() };
            if let Some(next) = link {
                let next = u32::from(next);
                if next >= spb || next == cur {
                    return Err(Error::Corrupt(block));
                }
                cur = next;
                direct = false;
                continue;
            }

            let flags = meta.sector_flags();
            let unusable = flags.intersects(SectorFlags::BAD | SectorFlags::DIRTY)
                || (direct && flags.contains(SectorFlags::MAPPED));
            if !unusable {
                return Ok(SectorSlot::Found { sector: cur, direct });
            }

            let hop = match self.next_free_sector(block, cur)? {
                Some(hop) => hop,
                None => return Ok(SectorSlot::BlockFull),
            };
            self.update_meta(block, hop, |m| {
                m.set_sector_flags(SectorFlags::IN_USE | SectorFlags::MAPPED)
            })?;
            self.update_meta(block, cur, |m| {
                if direct {
                    m.mapped_sector_offset = (hop as u16).into();
                } else {
                    m.linked_sector_offset = (hop as u16).into();
                }
            })?;
            self.update_meta(block, 0, |m| m.set_block_flags(BlockFlags::IN_USE))?;
            debug!("block {} sector {}: new hop {}", block, cur, hop);
            return Ok(SectorSlot::Found { sector: hop, direct: false });
        }
        Err(Error::Corrupt(block))
    }

    /// Resolves virtual sector `sector` of virtual block `vblock` to a
    /// physical `(block, sector, direct)`, remapping the block if it is full.
    pub(crate) fn resolve_sector(
        &mut self,
        vblock: u32,
        sector: u32,
    ) -> Result<(u32, u32, bool), Error<D::Error>> {
        let block = self.resolve_block(vblock)?;
        if let SectorSlot::Found { sector: s, direct } = self.locate_sector(block, sector)? {
            return Ok((block, s, direct));
        }
        let block = self.relocate_block(vblock, None)?.block;
        match self.locate_sector(block, sector)? {
            SectorSlot::Found { sector: s, direct } => Ok((block, s, direct)),
            SectorSlot::BlockFull => Err(Error::NoFreeSpace),
        }
    }

    /// Follows a `linked_sector_offset` chain from `start` to its end.
    pub(crate) fn chain_end(&self, block: u32, start: u32) -> Result<(u32, SectorMeta), Error<D::Error>> {
        let spb = self.geo()?.sectors_per_block;
        if start >= spb {
            return Err(Error::Corrupt(block));
        }
        let mut cur = start;
        for _ in 0..=spb {
            let meta = self.read_meta(block, cur)?;
            match meta.linked_sector() {
                Some(next) if u32::from(next) < spb && u32::from(next) != cur => {
                    cur = u32::from(next);
                }
                Some(_) => return Err(Error::Corrupt(block)),
                None => return Ok((cur, meta)),
            }
        }
        Err(Error::Corrupt(block))
    }

    /// Reads the live data of the sector at position `sector` of `block`
    /// into `buf`, following relocations. Returns `false`, leaving `buf`
    /// unspecified, if there is none or it fails its CRC.
    pub(crate) fn read_live_sector(
        &self,
        block: u32,
        sector: u32,
        buf: &mut [u8],
    ) -> Result<bool, Error<D::Error>> {
        let meta = self.read_meta(block, sector)?;
        let (at, meta) = match meta.mapped_sector() {
            Some(first) => {
                let (at, end) = self.chain_end(block, u32::from(first))?;
                if !end.holds_chain_data() {
                    return Ok(false);
                }
                (at, end)
            }
            None if meta.holds_direct_data() => (sector, meta),
            None => return Ok(false),
        };
        self.read_payload(block, at, buf)?;
        Ok(self.check_crc(block, at, &meta, buf))
    }

    pub(crate) fn check_crc(&self, block: u32, sector: u32, meta: &SectorMeta, payload: &[u8]) -> bool {
        if meta.crc_matches(payload) {
            return true;
        }
        // A hop that was allocated but never written still has the erased
        // CRC; that is not worth a warning.
        if meta.crc.get() != u32::MAX {
            warn!("CRC mismatch in block {} sector {}, dropping it", block, sector);
        }
        false
    }

    /// Copies the live contents of `src`, with relocation chains collapsed,
    /// into the direct slots of `dst`, which must be freshly formatted.
    /// With `carry`, that sector is written from the carried payload instead.
    pub(crate) fn copy_block_contents(
        &mut self,
        src: u32,
        dst: u32,
        carry: Option<Carry<'_>>,
    ) -> Result<(), Error<D::Error>> {
        self.fill_with_retries(dst, |drv| drv.copy_pass(src, dst, carry))
    }

    /// Runs `fill` to populate the formatted block `dst`. When a pass runs
    /// out of room (bad sectors ate the slots it needed), `dst` is erased
    /// and the pass starts over. A block that never fills is left erased.
    pub(crate) fn fill_with_retries(
        &mut self,
        dst: u32,
        mut fill: impl FnMut(&mut Self) -> Result<(), Error<D::Error>>,
    ) -> Result<(), Error<D::Error>> {
        let mut attempt = 1;
        loop {
            match fill(self) {
                Err(e @ (Error::NoFreeSpace | Error::RetriesExhausted)) => {
                    warn!("filling block {} failed on pass {}: {:?}", dst, attempt, e);
                    self.format_block(dst)?;
                    if attempt == COPY_ATTEMPTS {
                        return Err(e);
                    }
                    attempt += 1;
                }
                r => return r,
            }
        }
    }

    /// Copies from the top sector down. A placement that fails verification
    /// only moves to a slot above its own, and those have all been dealt
    /// with already.
    fn copy_pass(&mut self, src: u32, dst: u32, carry: Option<Carry<'_>>) -> Result<(), Error<D::Error>> {
        let geo = self.geo()?;
        let trash = self.block_meta(src)?.is_trash();
        if trash {
            debug!("not copying trashed block {}", src);
        }
        let mut buf = vec![0; geo.bytes_per_sector as usize];
        let mut copied = 0;
        for sector in (0..geo.sectors_per_block).rev() {
            match carry {
                Some(c) if c.sector == sector => {
                    self.place_sector(dst, sector, c.data)?;
                    copied += 1;
                }
                _ if trash => (),
                _ => {
                    if self.read_live_sector(src, sector, &mut buf)? {
                        self.place_sector(dst, sector, &buf)?;
                        copied += 1;
                    }
                }
            }
        }
        debug!("copied {} sectors from block {} to {}", copied, src, dst);
        Ok(())
    }

    /// Writes a full sector into slot `sector` of physical block `block`.
    pub(crate) fn place_sector(&mut self, block: u32, sector: u32, data: &[u8]) -> Result<(), Error<D::Error>> {
        self.write_sector(Placement::Physical { block, sector }, 0, Payload::Bytes(data))
    }

    /// Reads `buf.len()` bytes at virtual address `addr`.
    pub(crate) fn read(&mut self, addr: u32, buf: &mut [u8]) -> Result<(), Error<D::Error>> {
        let len = u32::try_from(buf.len()).map_err(|_| Error::OutOfRange)?;
        let geo = self.checked_range(addr, len)?;
        let bps = geo.bytes_per_sector as usize;
        let mut addr = addr;
        let mut done = 0;
        while done < buf.len() {
            let offset = ((addr - geo.base) as usize) % bps;
            let n = usize::min(bps - offset, buf.len() - done);
            let (block, sector, _) =
                self.resolve_sector(geo.block_index(addr), geo.sector_index(addr))?;
            self.device.read(
                geo.sector_addr(block, sector) + offset as u32,
                &mut buf[done..done + n],
            )?;
            addr += n as u32;
            done += n;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{test_config, FakeNand};
    use crate::WearLeveling;

    fn mounted(blocks: u32) -> WearLeveling<FakeNand> {
        let wl = WearLeveling::new(FakeNand::new(blocks, 4096, 512), test_config());
        wl.initialize().unwrap();
        wl.format().unwrap();
        wl
    }

    /// Overwrites the metadata of `sector` in block 0 with the given links.
    fn link(wl: &WearLeveling<FakeNand>, sector: u32, mapped: u16, linked: u16) {
        let mut meta = SectorMeta::erased();
        meta.set_sector_flags(SectorFlags::IN_USE | SectorFlags::DIRTY);
        meta.mapped_sector_offset = mapped.into();
        meta.linked_sector_offset = linked.into();
        wl.with_device(|nand| nand.poke_meta(sector * 512, meta.to_raw()));
    }

    #[test]
    fn self_link_is_corrupt() {
        let wl = mounted(8);
        link(&wl, 1, 1, 0xFFFF);

        let mut buf = [0; 512];
        assert_eq!(wl.read(512, &mut buf), Err(Error::Corrupt(0)));
        assert_eq!(wl.write(512, &[0x12; 512], true), Err(Error::Corrupt(0)));
        // Neighbors are unaffected.
        wl.write(1024, &[0x34; 512], true).unwrap();
        wl.read(1024, &mut buf).unwrap();
        assert_eq!(buf, [0x34; 512]);
    }

    #[test]
    fn link_past_the_block_is_corrupt() {
        let wl = mounted(8);
        let mut meta = SectorMeta::erased();
        meta.set_sector_flags(SectorFlags::IN_USE | SectorFlags::MAPPED);
        meta.linked_sector_offset = 99.into();
        wl.with_device(|nand| nand.poke_meta(5 * 512, meta.to_raw()));
        link(&wl, 1, 5, 0xFFFF);

        let mut buf = [0; 512];
        assert_eq!(wl.read(512, &mut buf), Err(Error::Corrupt(0)));
    }

    #[test]
    fn chain_loop_is_corrupt() {
        let wl = mounted(8);
        link(&wl, 1, 5, 0xFFFF);
        link(&wl, 5, 0xFFFF, 6);
        link(&wl, 6, 0xFFFF, 5);

        let mut buf = [0; 512];
        assert_eq!(wl.read(512, &mut buf), Err(Error::Corrupt(0)));
    }

    #[test]
    fn oversized_buffers_are_out_of_range() {
        let wl = mounted(8);
        let geo = wl.geometry().unwrap();
        let mut buf = alloc::vec![0; geo.size() as usize + 1];
        assert_eq!(wl.read(0, &mut buf), Err(Error::OutOfRange));
        assert_eq!(wl.write(0, &buf, true), Err(Error::OutOfRange));
    }
}
