// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Bad blocks and their replacements.
//!
//! A block whose first-sector metadata reads as all zeroes is treated as bad:
//! its map field is gone, so the block it stands for is found through an
//! in-memory table instead. The table is never stored; it is rebuilt at
//! initialization from the replacement blocks, which carry a flag and a
//! back-link to the bad block they stand in for.

use alloc::vec;
use alloc::vec::Vec;
use log::{debug, info, warn};

use crate::low_level::{BlockDevice, BlockFlags, SectorFlags};
use crate::resolve::Driver;
use crate::write::Carry;
use crate::Error;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
struct BadBlockEntry {
    virtual_index: u32,
    physical_index: u32,
}

/// Bad block to replacement mapping.
///
/// Small by construction (a handful of entries on a healthy part), so
/// lookups are linear scans.
#[derive(Clone, Debug, Default)]
pub(crate) struct BadBlockTable {
    entries: Vec<BadBlockEntry>,
}

impl BadBlockTable {
    pub(crate) fn lookup_virtual(&self, virtual_index: u32) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.virtual_index == virtual_index)
            .map(|e| e.physical_index)
    }

    /// Finds the bad block that `physical_index` stands in for.
    pub(crate) fn lookup_physical(&self, physical_index: u32) -> Option<u32> {
        self.entries
            .iter()
            .find(|e| e.physical_index == physical_index)
            .map(|e| e.virtual_index)
    }

    /// Records (or moves) the replacement for a bad block, returning the
    /// previous replacement if there was one.
    pub(crate) fn insert(&mut self, virtual_index: u32, physical_index: u32) -> Option<u32> {
        match self.entries.iter_mut().find(|e| e.virtual_index == virtual_index) {
            Some(e) => Some(core::mem::replace(&mut e.physical_index, physical_index)),
            None => {
                self.entries.push(BadBlockEntry { virtual_index, physical_index });
                None
            }
        }
    }

    pub(crate) fn clear(&mut self) {
        self.entries.clear();
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

/// Where the contents of a new replacement block come from.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Salvage<'a> {
    /// Start empty.
    Nothing,
    /// Copy the live data of an intact block, with an optional sector
    /// replaced on the way.
    Block(u32, Option<Carry<'a>>),
    /// Recover what can be recovered from a block whose first-sector
    /// metadata has been destroyed.
    Damaged(u32),
}

impl<D: BlockDevice> Driver<D> {
    /// Rebuilds the bad block table from the media, formatting blocks that
    /// were never formatted and replacing bad blocks that have no
    /// replacement yet.
    pub(crate) fn scan_bad_blocks(&mut self) -> Result<(), Error<D::Error>> {
        let geo = self.geo()?;
        self.bad_blocks.clear();

        let mut formatted = 0;
        for b in 0..geo.block_count {
            if let Ok(meta) = self.block_meta(b) {
                if !meta.is_formatted() {
                    self.format_block(b)?;
                    formatted += 1;
                }
            }
        }

        for b in 0..geo.block_count {
            let meta = match self.block_meta(b) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if meta.is_bad_block() || !meta.is_bad_block_replacement() {
                continue;
            }
            let owner = match meta.owner_link() {
                Some(owner) => u32::from(owner),
                None => continue,
            };
            if owner >= geo.block_count || self.bad_blocks.lookup_physical(b).is_some() {
                continue;
            }
            if let Some(other) = self.bad_blocks.lookup_virtual(owner) {
                warn!(
                    "bad block {} has two replacements ({} and {}), keeping {}",
                    owner, other, b, other,
                );
                continue;
            }
            self.bad_blocks.insert(owner, b);
        }
        let found = self.bad_blocks.len();

        let mut substituted = 0;
        for b in 0..geo.block_count {
            let bad = match self.block_meta(b) {
                Ok(meta) => meta.is_bad_block(),
                Err(_) => true,
            };
            if !bad || self.bad_blocks.lookup_virtual(b).is_some() {
                continue;
            }
            warn!(
                "block {} reads as bad (all-zero metadata or unreadable); \
                 this may be a false positive",
                b,
            );
            match self.substitute_bad_block(b) {
                Ok(_) => substituted += 1,
                Err(Error::Unmapped(_)) | Err(Error::NoFreeSpace) => {
                    warn!("no replacement available for bad block {}", b);
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            "bad block scan: {} formatted, {} replacements found, {} new",
            formatted, found, substituted,
        );
        Ok(())
    }

    /// Gives bad block `vblock` a replacement, preferring a block that
    /// already holds its data.
    pub(crate) fn substitute_bad_block(&mut self, vblock: u32) -> Result<u32, Error<D::Error>> {
        let geo = self.geo()?;
        for b in 0..geo.block_count {
            if b == vblock || self.is_reserved(b) {
                continue;
            }
            let meta = match self.block_meta(b) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            let flags = meta.block_flags();
            // A remap target owned by the bad block holds its current data.
            if flags.contains(BlockFlags::MAPPED)
                && !flags.intersects(BlockFlags::BAD_BLOCK_REPLACEMENT | BlockFlags::TRASH)
                && meta.owner_link() == Some(vblock as u16)
                && !meta.is_bad_block()
            {
                self.update_meta(b, 0, |m| m.set_block_flags(BlockFlags::BAD_BLOCK_REPLACEMENT))?;
                self.bad_blocks.insert(vblock, b);
                info!("bad block {} adopted its remap target {}", vblock, b);
                return Ok(b);
            }
        }
        self.replace_bad_block(vblock, Salvage::Damaged(vblock))
    }

    /// Takes a free block as the new replacement for bad block `vblock`,
    /// filled from `salvage`. Any previous replacement is trashed.
    pub(crate) fn replace_bad_block(&mut self, vblock: u32, salvage: Salvage<'_>) -> Result<u32, Error<D::Error>> {
        let new = self.find_replacement_block()?.ok_or(Error::Unmapped(vblock))?;
        match salvage {
            Salvage::Nothing => (),
            Salvage::Block(src, carry) => self.copy_block_contents(src, new, carry)?,
            Salvage::Damaged(bad) => self.fill_with_retries(new, |drv| drv.salvage_damaged(bad, new))?,
        }

        self.update_meta(new, 0, |m| {
            m.set_block_flags(
                BlockFlags::IN_USE | BlockFlags::MAPPED | BlockFlags::BAD_BLOCK_REPLACEMENT,
            );
            m.owner_block = (vblock as u16).into();
        })?;

        if let Some(old) = self.bad_blocks.insert(vblock, new) {
            if old != new {
                let ometa = self.block_meta(old)?;
                if ometa.is_bad_block_replacement() && ometa.owner_link() == Some(vblock as u16) {
                    self.update_meta(old, 0, |m| m.mark_trash())?;
                }
            }
        }
        info!("bad block {} replaced by {}", vblock, new);
        Ok(new)
    }

    /// Free block for a replacement, searching down from the top of the
    /// region. Block 0 is never used.
    fn find_replacement_block(&mut self) -> Result<Option<u32>, Error<D::Error>> {
        let geo = self.geo()?;
        for b in (1..geo.block_count).rev() {
            let meta = match self.block_meta(b) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            if self.is_allocatable(b, &meta) {
                if !meta.is_formatted() {
                    self.format_block(b)?;
                }
                return Ok(Some(b));
            }
        }
        Ok(None)
    }

    /// Copies what survives of `bad` into `dst`.
    ///
    /// Sectors other than 0 still have their metadata and are copied the
    /// usual way. Sector 0's metadata is gone along with its relocation link,
    /// but the chain it started can still be found: it is the one relocated
    /// sector in the block that nothing else links to.
    fn salvage_damaged(&mut self, bad: u32, dst: u32) -> Result<(), Error<D::Error>> {
        let geo = self.geo()?;
        let spb = geo.sectors_per_block;
        let mut buf = vec![0; geo.bytes_per_sector as usize];

        let mut referenced = vec![false; spb as usize];
        let mut relocated = Vec::new();
        for s in 1..spb {
            let meta = match self.read_meta(bad, s) {
                Ok(meta) => meta,
                Err(_) => continue,
            };
            for link in [meta.mapped_sector(), meta.linked_sector()].into_iter().flatten() {
                if u32::from(link) < spb {
                    referenced[usize::from(link)] = true;
                }
            }
            let flags = meta.sector_flags();
            if flags.contains(SectorFlags::MAPPED) && !flags.contains(SectorFlags::BAD) {
                relocated.push(s);
            }
        }

        // Top down, as in an ordinary block copy; sector 0 goes last.
        for s in (1..spb).rev() {
            match self.read_live_sector(bad, s, &mut buf) {
                Ok(true) => self.place_sector(dst, s, &buf)?,
                Ok(false) => (),
                Err(e) => warn!("lost sector {} of bad block {}: {:?}", s, bad, e),
            }
        }

        let heads: Vec<u32> = relocated
            .into_iter()
            .filter(|&s| !referenced[s as usize])
            .collect();
        match heads.as_slice() {
            [head] => {
                let (at, end) = match self.chain_end(bad, *head) {
                    Ok(found) => found,
                    Err(e) => {
                        warn!("lost sector 0 of bad block {}: {:?}", bad, e);
                        return Ok(());
                    }
                };
                if !end.holds_chain_data() {
                    return Ok(());
                }
                if self.read_payload(bad, at, &mut buf).is_ok() && self.check_crc(bad, at, &end, &buf) {
                    debug!("recovered sector 0 of bad block {} from sector {}", bad, at);
                    self.place_sector(dst, 0, &buf)?;
                }
            }
            [] => {
                // Never relocated; whatever is in the slot is the data.
                if self.read_payload(bad, 0, &mut buf).is_ok() && buf.iter().any(|&b| b != 0xFF) {
                    self.place_sector(dst, 0, &buf)?;
                }
            }
            _ => {
                warn!(
                    "lost sector 0 of bad block {}: {} candidate chains",
                    bad,
                    heads.len(),
                );
            }
        }
        Ok(())
    }

    /// Erases every block that isn't bad and gives each bad block a fresh
    /// replacement.
    pub(crate) fn format_all(&mut self) -> Result<(), Error<D::Error>> {
        let geo = self.geo()?;
        let mut bad = Vec::new();
        for b in 0..geo.block_count {
            match self.block_meta(b) {
                Ok(meta) if meta.is_bad_block() => bad.push(b),
                _ => self.format_block(b)?,
            }
        }
        self.bad_blocks.clear();
        for &b in &bad {
            match self.replace_bad_block(b, Salvage::Nothing) {
                Ok(_) => (),
                Err(Error::Unmapped(_)) => warn!("no replacement available for bad block {}", b),
                Err(e) => return Err(e),
            }
        }
        info!("formatted {} blocks, {} bad", geo.block_count - bad.len() as u32, bad.len());
        Ok(())
    }
}
