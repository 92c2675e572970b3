// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Compaction: undo remapping, then erase what it left behind.
//!
//! The sweep walks every physical block once. A virtual block that has been
//! remapped is brought home by copying its data back into its own block,
//! which is erased first. Its own block may be hosting a third block's data,
//! so that is saved to a scratch block beforehand and then brought home in
//! turn, and so on down the chain. Two scratch blocks are enough: one holds
//! the data being carried to the next step while the other receives the
//! next block saved.
//!
//! Blocks whose sectors have been relocated within the block are collapsed
//! through a scratch block as well. Finally trash is erased, either all of
//! it or just the block the caller asked about.

use alloc::collections::VecDeque;
use log::{debug, info, warn};

use crate::bad_blocks::Salvage;
use crate::low_level::{BlockDevice, BlockFlags, SectorFlags};
use crate::resolve::Driver;
use crate::Error;

/// The two blocks compaction copies through.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct ScratchPair {
    /// Receives the next save.
    a: u32,
    b: u32,
}

impl ScratchPair {
    fn rotate(&mut self) {
        core::mem::swap(&mut self.a, &mut self.b);
    }

    fn contains(&self, block: u32) -> bool {
        self.a == block || self.b == block
    }
}

/// One step of bringing a chain home: erase `dest` and fill it from
/// `source`, if there is one.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct DrainStep {
    dest: u32,
    source: Option<u32>,
}

impl<D: BlockDevice> Driver<D> {
    /// Runs a full sweep and a reclaim pass. `hint` names the block the
    /// caller needs erased; `None` reclaims everything it can.
    pub(crate) fn compact(&mut self, hint: Option<u32>) -> Result<(), Error<D::Error>> {
        let mut scratch = match self.claim_scratch()? {
            Some(pair) => pair,
            None => {
                // Every spare block is somebody's remap target. Bring home
                // the blocks that don't need scratch space to do it, which
                // frees their targets.
                info!("no scratch space, draining simple chains first");
                self.drain_unhosted()?;
                self.reclaim(None, 0)?;
                self.claim_scratch()?.ok_or(Error::NoFreeSpace)?
            }
        };
        self.reserved = Some([scratch.a, scratch.b]);
        let swept = self.sweep(&mut scratch);
        self.reserved = None;
        let free = swept?;

        let reclaimed = self.reclaim(hint, free)?;
        info!("compaction: {} blocks free after sweep, {} reclaimed", free, reclaimed);
        Ok(())
    }

    /// Finds two blocks that hold nothing live, from the top of the region
    /// down.
    fn claim_scratch(&self) -> Result<Option<ScratchPair>, Error<D::Error>> {
        let geo = self.geo()?;
        let mut found = [0; 2];
        let mut n = 0;
        for b in (0..geo.block_count).rev() {
            let meta = match self.block_meta(b) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let usable = !meta.is_bad_block()
                && !meta.block_map().is_valid()
                && (meta.is_block_free() || meta.is_trash());
            if usable {
                found[n] = b;
                n += 1;
                if n == found.len() {
                    debug!("compaction scratch blocks {} and {}", found[0], found[1]);
                    return Ok(Some(ScratchPair { a: found[0], b: found[1] }));
                }
            }
        }
        Ok(None)
    }

    /// Erases a scratch block unless it is already blank.
    fn blank(&mut self, block: u32) -> Result<(), Error<D::Error>> {
        let meta = self.block_meta(block)?;
        if !(meta.is_formatted() && meta.is_block_free() && !meta.block_map().is_valid()) {
            self.format_block(block)?;
        }
        Ok(())
    }

    /// Returns the number of free blocks left afterwards, scratch included.
    fn sweep(&mut self, scratch: &mut ScratchPair) -> Result<u32, Error<D::Error>> {
        let geo = self.geo()?;
        let mut free = 0;

        for b in 0..geo.block_count {
            if scratch.contains(b) {
                continue;
            }
            let meta = match self.block_meta(b) {
                Ok(meta) => meta,
                Err(Error::Device(e)) => {
                    warn!("unreadable metadata on block {} ({:?}), formatting", b, e);
                    self.format_block(b)?;
                    free += 1;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if meta.is_bad_block() {
                if self.bad_blocks.lookup_virtual(b).is_none() {
                    match self.substitute_bad_block(b) {
                        Ok(_) => (),
                        Err(Error::Unmapped(_)) => warn!("no replacement available for bad block {}", b),
                        Err(e) => return Err(e),
                    }
                }
                continue;
            }
            if !meta.is_formatted() {
                self.format_block(b)?;
                free += 1;
                continue;
            }
            if meta.block_map().is_valid() {
                self.drain_chain(b, scratch)?;
            }

            let meta = self.block_meta(b)?;
            if meta.is_block_free() {
                free += 1;
                continue;
            }
            if meta.is_trash() {
                continue;
            }

            let mut relocated = false;
            let mut live = false;
            for s in 0..geo.sectors_per_block {
                let flags = self.read_meta(b, s)?.sector_flags();
                relocated |= flags.contains(SectorFlags::MAPPED);
                live |= !flags.intersects(SectorFlags::BAD | SectorFlags::DIRTY);
            }
            if !live && !meta.is_bad_block_replacement() {
                self.update_meta(b, 0, |m| m.mark_trash())?;
                debug!("block {} holds nothing live, trashed", b);
            } else if relocated {
                self.collapse_block(b, scratch)?;
            }
        }

        self.blank(scratch.a)?;
        self.blank(scratch.b)?;
        Ok(free + 2)
    }

    /// Brings virtual block `vblock` back into its own physical block, and
    /// with it every block whose data was sitting where it lands.
    fn drain_chain(&mut self, vblock: u32, scratch: &mut ScratchPair) -> Result<(), Error<D::Error>> {
        let geo = self.geo()?;
        let source = self.lookup_block(vblock)?.filter(|&t| t != vblock);
        let mut queue = VecDeque::new();
        queue.push_back(DrainStep { dest: vblock, source });

        let mut steps = 0;
        while let Some(DrainStep { dest, source }) = queue.pop_front() {
            steps += 1;
            if steps > geo.block_count {
                return Err(Error::Corrupt(vblock));
            }
            let dmeta = self.block_meta(dest)?;

            if dmeta.is_bad_block() {
                let salvage = source.map_or(Salvage::Nothing, |s| Salvage::Block(s, None));
                self.replace_bad_block(dest, salvage)?;
                break;
            }

            // Someone else's data lives in `dest`; carry it along.
            let hosted = self.hosted_for(dest)?;
            if hosted.is_some() {
                self.blank(scratch.a)?;
                self.copy_block_contents(dest, scratch.a, None)?;
            }

            self.bring_home(dest, source, !source.map_or(false, |s| scratch.contains(s)))?;

            if let Some(owner) = hosted {
                queue.push_back(DrainStep { dest: owner, source: Some(scratch.a) });
                scratch.rotate();
            }
        }
        Ok(())
    }

    /// Erases `dest` and refills it from `source`, trashing the source
    /// afterwards if `trash_source`.
    fn bring_home(
        &mut self,
        dest: u32,
        source: Option<u32>,
        trash_source: bool,
    ) -> Result<(), Error<D::Error>> {
        self.format_block(dest)?;
        if let Some(src) = source {
            self.copy_block_contents(src, dest, None)?;
            if trash_source {
                self.update_meta(src, 0, |m| m.mark_trash())?;
            }
        }
        debug!("block {} brought home from {:?}", dest, source);
        Ok(())
    }

    /// Brings home every remapped block whose own physical block isn't
    /// hosting anyone, which takes no scratch space.
    fn drain_unhosted(&mut self) -> Result<(), Error<D::Error>> {
        let geo = self.geo()?;
        for b in 0..geo.block_count {
            let meta = match self.block_meta(b) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_bad_block() || !meta.block_map().is_valid() || self.hosted_for(b)?.is_some() {
                continue;
            }
            let source = self.lookup_block(b)?.filter(|&t| t != b);
            self.bring_home(b, source, true)?;
        }
        Ok(())
    }

    /// The virtual block whose current data lives in `block`, if that isn't
    /// `block` itself.
    pub(crate) fn hosted_for(&self, block: u32) -> Result<Option<u32>, Error<D::Error>> {
        let meta = self.block_meta(block)?;
        let owner = match meta.owner_link() {
            Some(owner) => u32::from(owner),
            None => return Ok(None),
        };
        if owner >= self.geo()?.block_count || owner == block {
            return Ok(None);
        }
        let live = if meta.is_bad_block_replacement() {
            self.bad_blocks.lookup_virtual(owner) == Some(block)
        } else {
            let ometa = self.block_meta(owner)?;
            !ometa.is_bad_block() && ometa.block_map().current_target() == Some(block as u16)
        };
        Ok(live.then(|| owner))
    }

    /// Folds sector relocations in `block` back into direct slots, keeping
    /// the block's role.
    fn collapse_block(&mut self, block: u32, scratch: &mut ScratchPair) -> Result<(), Error<D::Error>> {
        let meta = self.block_meta(block)?;
        let role = meta.block_flags() & (BlockFlags::MAPPED | BlockFlags::BAD_BLOCK_REPLACEMENT);
        let owner = meta.owner_block;

        self.blank(scratch.a)?;
        self.copy_block_contents(block, scratch.a, None)?;
        self.format_block(block)?;
        self.copy_block_contents(scratch.a, block, None)?;
        self.update_meta(block, 0, |m| {
            m.set_block_flags(BlockFlags::IN_USE | role);
            if !role.is_empty() {
                m.owner_block = owner;
            }
        })?;
        debug!("collapsed sector chains in block {}", block);
        Ok(())
    }

    /// Erases trash and orphaned blocks. Everything reclaimable goes when
    /// free space is low or no hint was given; otherwise only the hinted
    /// block, if it is trash.
    fn reclaim(&mut self, hint: Option<u32>, free: u32) -> Result<u32, Error<D::Error>> {
        let geo = self.geo()?;
        let threshold = geo.block_count / self.config.reclaim_divisor;
        let mut reclaimed = 0;

        if hint.is_none() || free < threshold {
            for b in 0..geo.block_count {
                if self.is_reclaimable(b)? {
                    self.format_block(b)?;
                    reclaimed += 1;
                }
            }
        } else if let Some(h) = hint.filter(|&h| h < geo.block_count) {
            let meta = self.block_meta(h)?;
            if meta.is_trash() && !meta.block_map().is_valid() && !meta.is_bad_block() {
                self.format_block(h)?;
                reclaimed += 1;
            }
        }
        Ok(reclaimed)
    }

    fn is_reclaimable(&self, block: u32) -> Result<bool, Error<D::Error>> {
        let meta = match self.block_meta(block) {
            Ok(meta) => meta,
            Err(Error::Device(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        if meta.is_bad_block() || meta.block_map().is_valid() {
            return Ok(false);
        }
        let flags = meta.block_flags();
        if flags.contains(BlockFlags::TRASH) {
            return Ok(true);
        }
        if flags.intersects(BlockFlags::MAPPED | BlockFlags::BAD_BLOCK_REPLACEMENT) {
            return Ok(self.hosted_for(block)?.is_none());
        }
        Ok(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::{test_config, FakeNand};
    use crate::WearLeveling;
    use alloc::vec::Vec;

    fn mounted(blocks: u32) -> WearLeveling<FakeNand> {
        let wl = WearLeveling::new(FakeNand::new(blocks, 4096, 512), test_config());
        wl.initialize().unwrap();
        wl
    }

    fn fill_of(i: u32) -> u8 {
        if i % 2 == 0 { 0xA5 } else { 0x5A }
    }

    #[test]
    fn scratch_pair_rotates() {
        let mut pair = ScratchPair { a: 15, b: 14 };
        pair.rotate();
        assert_eq!(pair, ScratchPair { a: 14, b: 15 });
        assert!(pair.contains(15));
        assert!(!pair.contains(13));
    }

    #[test]
    fn compaction_brings_blocks_home() {
        let wl = mounted(16);
        let geo = wl.geometry().unwrap();
        // Enough inversions to remap block 2 twice.
        for i in 0..17 {
            wl.write(geo.block_addr(2) + 512, &[fill_of(i); 512], true).unwrap();
        }
        wl.write(geo.block_addr(2), &[0x11; 512], true).unwrap();
        assert_ne!(geo.block_index(wl.physical_address(geo.block_addr(2)).unwrap()), 2);

        wl.compact(None).unwrap();

        assert_eq!(wl.physical_address(geo.block_addr(2)).unwrap(), geo.block_addr(2));
        assert_eq!(
            wl.physical_address(geo.block_addr(2) + 512).unwrap(),
            geo.block_addr(2) + 512,
        );
        let mut buf = [0; 1024];
        wl.read(geo.block_addr(2), &mut buf).unwrap();
        assert_eq!(&buf[..512], &[0x11; 512][..]);
        assert_eq!(&buf[512..], &[fill_of(16); 512][..]);

        let census = wl.census().unwrap();
        assert_eq!(census.trash, 0);
        assert_eq!(census.mapped, 0);
    }

    #[test]
    fn verify_failure_while_bringing_home() {
        let wl = mounted(16);
        let geo = wl.geometry().unwrap();
        for i in 0..17 {
            wl.write(geo.block_addr(2) + 512, &[fill_of(i); 512], true).unwrap();
        }
        wl.write(geo.block_addr(2), &[0x11; 512], true).unwrap();

        wl.with_device(|nand| nand.corrupt_next_programs(1));
        wl.compact(None).unwrap();

        let mut buf = [0; 1024];
        wl.read(geo.block_addr(2), &mut buf).unwrap();
        assert_eq!(&buf[..512], &[0x11; 512][..]);
        assert_eq!(&buf[512..], &[fill_of(16); 512][..]);
        for off in [0, 512] {
            let phys = wl.physical_address(geo.block_addr(2) + off).unwrap();
            assert_eq!(geo.block_index(phys), 2);
        }
        assert_eq!(wl.census().unwrap().mapped, 0);
    }

    #[test]
    fn full_device_compacts_without_scratch() {
        let wl = mounted(4);
        let geo = wl.geometry().unwrap();
        // Fill blocks 0 and 1 with versions until each moves out; that
        // leaves no block that is both spare and unclaimed.
        for v in 0..2 {
            for i in 0..9 {
                wl.write(geo.block_addr(v), &[fill_of(i); 512], true).unwrap();
            }
        }
        let census = wl.census().unwrap();
        assert_eq!((census.free, census.mapped, census.trash), (0, 2, 2));

        wl.compact(None).unwrap();

        for v in 0..2 {
            assert_eq!(wl.physical_address(geo.block_addr(v)).unwrap(), geo.block_addr(v));
            let mut buf = [0; 512];
            wl.read(geo.block_addr(v), &mut buf).unwrap();
            assert_eq!(buf, [fill_of(8); 512]);
        }
        assert_eq!(wl.census().unwrap().free, 2);
    }

    #[test]
    fn chained_remaps_drain_through_scratch() {
        let wl = mounted(16);
        let geo = wl.geometry().unwrap();

        // Park block 12's data in block 8, then give block 8 a home of its
        // own elsewhere. The sweep reaches 8 first, and can only bring it
        // home after carrying 12's data off through a scratch block.
        for i in 0..9 {
            wl.write(geo.block_addr(12), &[fill_of(i); 512], true).unwrap();
        }
        let host = geo.block_index(wl.physical_address(geo.block_addr(12)).unwrap());
        assert_eq!(host, 8);
        wl.write(geo.block_addr(8) + 1024, &[0x3C; 512], true).unwrap();
        let away = geo.block_index(wl.physical_address(geo.block_addr(8) + 1024).unwrap());
        assert_eq!(away, 4);

        let erases_before = wl.with_device(|nand| nand.erase_count(15));
        wl.compact(None).unwrap();

        let mut buf = [0; 512];
        wl.read(geo.block_addr(12), &mut buf).unwrap();
        assert_eq!(buf, [fill_of(8); 512]);
        wl.read(geo.block_addr(8) + 1024, &mut buf).unwrap();
        assert_eq!(buf, [0x3C; 512]);
        assert_eq!(wl.physical_address(geo.block_addr(12)).unwrap(), geo.block_addr(12));
        assert_eq!(wl.physical_address(geo.block_addr(8)).unwrap(), geo.block_addr(8));

        // The first scratch block was used, then erased.
        assert_eq!(wl.with_device(|nand| nand.erase_count(15)), erases_before + 1);
        let census = wl.census().unwrap();
        assert_eq!(census.mapped, 0);
        assert_eq!(census.trash, 0);
    }

    #[test]
    fn compaction_keeps_data_and_free_space() {
        let wl = mounted(16);
        let geo = wl.geometry().unwrap();
        let mut expected = Vec::new();
        for b in [0u32, 3, 6, 7, 11] {
            for i in 0..5 {
                let fill = fill_of(i + b);
                wl.write(geo.block_addr(b) + (i % 3) * 512, &[fill; 512], true).unwrap();
            }
        }
        wl.erase_block(geo.block_addr(6)).unwrap();
        for b in [0u32, 3, 6, 7, 11] {
            let mut buf = alloc::vec![0; geo.bytes_per_block as usize];
            wl.read(geo.block_addr(b), &mut buf).unwrap();
            expected.push((b, buf));
        }
        let free_before = wl.census().unwrap().free;

        wl.compact(None).unwrap();

        for (b, data) in &expected {
            let mut buf = alloc::vec![0; geo.bytes_per_block as usize];
            wl.read(geo.block_addr(*b), &mut buf).unwrap();
            assert_eq!(&buf, data, "block {} changed", b);
        }
        assert!(wl.census().unwrap().free >= free_before);
    }

    #[test]
    fn hinted_compaction_reclaims_only_the_hint() {
        let wl = mounted(16);
        let geo = wl.geometry().unwrap();
        for b in [1u32, 2] {
            wl.write(geo.block_addr(b), &[0; 512], true).unwrap();
            wl.erase_block(geo.block_addr(b)).unwrap();
        }
        assert_eq!(wl.census().unwrap().trash, 2);

        wl.compact(Some(1)).unwrap();

        let census = wl.census().unwrap();
        assert_eq!(census.trash, 1);
        assert!(wl.is_block_erased(geo.block_addr(1), geo.bytes_per_block).unwrap());
        let erases = wl.with_device(|nand| (nand.erase_count(1), nand.erase_count(2)));
        assert_eq!(erases.0, 2);
        assert_eq!(erases.1, 1);
    }

    #[test]
    fn fully_dirty_block_becomes_trash_and_is_reclaimed() {
        let wl = mounted(16);
        let geo = wl.geometry().unwrap();
        wl.write(geo.block_addr(5), &[0x0F; 512], true).unwrap();
        // Mark every sector dirty by hand.
        wl.with_device(|nand| {
            for s in 0..geo.sectors_per_block {
                let addr = geo.sector_addr(5, s);
                let mut meta = nand.meta(addr);
                meta.set_sector_flags(SectorFlags::DIRTY);
                nand.poke_meta(addr, meta.to_raw());
            }
        });

        wl.compact(None).unwrap();

        let meta = wl.with_device(|nand| nand.meta(geo.block_addr(5)));
        assert!(meta.is_block_free());
        assert_eq!(wl.census().unwrap().free, 16);
    }
}
