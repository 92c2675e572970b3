// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The verified sector write.

use alloc::vec;
use log::{debug, trace, warn};

use crate::low_level::{sector_crc, BlockDevice, BlockFlags, SectorFlags};
use crate::resolve::{Driver, Relocated, SectorSlot};
use crate::Error;

/// Where a sector write is going.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) enum Placement {
    /// Virtual sector `sector` of virtual block `block`. The block may be
    /// remapped or compacted to make room.
    Virtual { block: u32, sector: u32 },
    /// Slot `sector` of physical block `block`, which must have room.
    Physical { block: u32, sector: u32 },
}

/// Bytes to lay over (part of) a sector.
#[derive(Copy, Clone, Debug)]
pub(crate) enum Payload<'a> {
    Bytes(&'a [u8]),
    Fill(u8, usize),
}

impl<'a> Payload<'a> {
    pub(crate) fn len(&self) -> usize {
        match self {
            Self::Bytes(b) => b.len(),
            Self::Fill(_, n) => *n,
        }
    }

    /// The part of this payload starting at `start`, at most `len` long.
    pub(crate) fn slice(&self, start: usize, len: usize) -> Payload<'a> {
        match *self {
            Self::Bytes(b) => Self::Bytes(&b[start..start + len]),
            Self::Fill(v, _) => Self::Fill(v, len),
        }
    }

    fn apply(&self, dest: &mut [u8]) {
        match self {
            Self::Bytes(b) => dest.copy_from_slice(b),
            Self::Fill(v, _) => dest.fill(*v),
        }
    }
}

/// A whole sector that travels with a block copy, replacing whatever the
/// source block holds for it.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub(crate) struct Carry<'a> {
    pub(crate) sector: u32,
    pub(crate) data: &'a [u8],
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
enum WriteStep {
    /// Pick the sector to program: the home sector, or a free one when the
    /// new contents can't be programmed over the old.
    Attempt,
    Program,
    /// Read back and compare CRCs.
    Verify,
    /// Verification failed; retire the sector and try elsewhere.
    BadSector,
    Commit,
}

/// Whether programming `new` over `current` would need a 0 bit to become 1.
fn needs_relocation(current: &[u8], new: &[u8]) -> bool {
    current.iter().zip(new).any(|(c, n)| n & !c != 0)
}

impl<D: BlockDevice> Driver<D> {
    /// Lays `payload` over the sector at `place`, starting `offset` bytes in.
    pub(crate) fn write_sector(
        &mut self,
        place: Placement,
        offset: usize,
        payload: Payload<'_>,
    ) -> Result<(), Error<D::Error>> {
        let geo = self.geo()?;
        let bps = geo.bytes_per_sector as usize;
        if offset + payload.len() > bps {
            return Err(Error::OutOfRange);
        }

        let (mut block, mut home, mut direct) = match place {
            Placement::Virtual { block, sector } => self.resolve_sector(block, sector)?,
            Placement::Physical { block, sector } => match self.locate_sector(block, sector)? {
                SectorSlot::Found { sector, direct } => (block, sector, direct),
                SectorSlot::BlockFull => return Err(Error::NoFreeSpace),
            },
        };

        // `current` holds what's on the media, `contents` what we want there.
        let mut current = vec![0; bps];
        let mut contents = vec![0; bps];
        self.read_payload(block, home, &mut current)?;
        contents.copy_from_slice(&current);
        payload.apply(&mut contents[offset..offset + payload.len()]);
        let crc = sector_crc(&contents);

        let mut relocate = needs_relocation(&current, &contents);
        let mut target = home;
        let mut failures = 0;
        let mut fell_back = false;
        let mut step = WriteStep::Attempt;

        while step != WriteStep::Commit {
            trace!("{:?}: block {} home {} target {}", step, block, home, target);
            step = match step {
                WriteStep::Attempt => {
                    if !relocate {
                        target = home;
                        WriteStep::Program
                    } else if let Some(free) = self.relocation_slot(place, block, home)? {
                        target = free;
                        WriteStep::Program
                    } else {
                        let (vblock, vsector) = match place {
                            Placement::Virtual { block, sector } if !fell_back => (block, sector),
                            _ => return Err(Error::NoFreeSpace),
                        };
                        fell_back = true;

                        // The old copy stays live until the block has moved.
                        let carry = Carry { sector: vsector, data: &contents };
                        let Relocated { block: moved, carried } = self.relocate_block(vblock, Some(carry))?;
                        if carried {
                            debug!("block {} sector {} written through relocation", vblock, vsector);
                            return Ok(());
                        }
                        match self.locate_sector(moved, vsector)? {
                            SectorSlot::Found { sector, direct: d } => {
                                block = moved;
                                home = sector;
                                direct = d;
                            }
                            SectorSlot::BlockFull => return Err(Error::NoFreeSpace),
                        }
                        self.read_payload(block, home, &mut current)?;
                        relocate = needs_relocation(&current, &contents);
                        WriteStep::Attempt
                    }
                }
                WriteStep::Program => {
                    self.device.write(geo.sector_addr(block, target), &contents)?;
                    WriteStep::Verify
                }
                WriteStep::Verify => {
                    self.read_payload(block, target, &mut current)?;
                    if sector_crc(&current) == crc {
                        WriteStep::Commit
                    } else {
                        WriteStep::BadSector
                    }
                }
                WriteStep::BadSector => {
                    warn!("verify failed on block {} sector {}, marking it bad", block, target);
                    self.update_meta(block, target, |m| m.set_sector_flags(SectorFlags::BAD))?;
                    self.update_meta(block, 0, |m| {
                        m.set_block_flags(BlockFlags::IN_USE | BlockFlags::DIRTY)
                    })?;
                    failures += 1;
                    if failures > self.config.max_write_retries {
                        return Err(Error::RetriesExhausted);
                    }
                    relocate = true;
                    WriteStep::Attempt
                }
                WriteStep::Commit => WriteStep::Commit,
            };
        }

        if target != home {
            self.update_meta(block, target, |m| {
                m.set_sector_flags(SectorFlags::IN_USE | SectorFlags::MAPPED);
                m.record_crc(crc);
            })?;
            self.update_meta(block, home, |m| {
                m.set_sector_flags(SectorFlags::DIRTY);
                if direct {
                    m.mapped_sector_offset = (target as u16).into();
                } else {
                    m.linked_sector_offset = (target as u16).into();
                }
            })?;
            debug!("block {} sector {} relocated to {}", block, home, target);
        } else {
            self.update_meta(block, home, |m| {
                m.set_sector_flags(SectorFlags::IN_USE);
                m.record_crc(crc);
            })?;
        }
        self.update_meta(block, 0, |m| m.set_block_flags(BlockFlags::IN_USE | BlockFlags::DIRTY))?;
        Ok(())
    }

    /// A free slot in `block` to relocate `home` into.
    fn relocation_slot(&self, place: Placement, block: u32, home: u32) -> Result<Option<u32>, Error<D::Error>> {
        let free = self.next_free_sector(block, home)?;
        Ok(match place {
            Placement::Virtual { .. } => free,
            // Slots below `home` still have to receive the rest of a copy.
            Placement::Physical { .. } => free.filter(|&s| s > home),
        })
    }

    /// Writes a payload at virtual address `addr`, one sector at a time.
    ///
    /// Sectors written before a failure stay written.
    pub(crate) fn write_span(&mut self, addr: u32, payload: Payload<'_>) -> Result<(), Error<D::Error>> {
        let len = u32::try_from(payload.len()).map_err(|_| Error::OutOfRange)?;
        let geo = self.checked_range(addr, len)?;
        let bps = geo.bytes_per_sector as usize;
        let mut addr = addr;
        let mut done = 0;
        while done < payload.len() {
            let offset = ((addr - geo.base) as usize) % bps;
            let n = usize::min(bps - offset, payload.len() - done);
            let place = Placement::Virtual {
                block: geo.block_index(addr),
                sector: geo.sector_index(addr),
            };
            self.write_sector(place, offset, payload.slice(done, n))?;
            addr += n as u32;
            done += n;
        }
        Ok(())
    }
}
