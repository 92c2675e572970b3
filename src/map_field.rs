// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! The block map field: a pair of 16-bit fields that name the physical block
//! a virtual block currently lives in, rewritable without an erase as long as
//! every rewrite only clears bits.
//!
//! Targets are stored bit-inverted, so an erased field (`0xFFFF`) means "no
//! target", and moving to a new target is possible whenever the new index has
//! every bit of the old index set. When the first field can't absorb a target
//! it is killed (written to `0`) and the second field takes over. When neither
//! can, the owning block has to be erased before it can be remapped again.

use crate::low_level::{DEAD_LINK, FREE_LINK};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BlockMap {
    fields: [u16; 2],
}

impl BlockMap {
    pub fn new(fields: [u16; 2]) -> Self {
        Self { fields }
    }

    /// Map with neither field used.
    pub fn unmapped() -> Self {
        Self::new([FREE_LINK; 2])
    }

    pub fn raw(&self) -> [u16; 2] {
        self.fields
    }

    /// Whether either field currently names a target.
    pub fn is_valid(&self) -> bool {
        self.fields.iter().any(|&f| f != FREE_LINK && f != DEAD_LINK)
    }

    /// The block index this map currently points at.
    pub fn current_target(&self) -> Option<u16> {
        if !self.is_valid() {
            return None;
        }
        let [first, second] = self.fields;
        if first != DEAD_LINK {
            Some(!first)
        } else {
            Some(!second)
        }
    }

    /// Whether `target` can still be committed without an erase.
    pub fn can_accept(&self, target: u16) -> bool {
        let [first, second] = self.fields;
        fits(first, target) || fits(second, target)
    }

    /// Commits `target`, preferring the first field. Returns `false` (leaving
    /// the map untouched) if neither field can absorb it.
    pub fn try_advance(&mut self, target: u16) -> bool {
        let [first, second] = self.fields;
        if first != DEAD_LINK && fits(first, target) {
            self.fields[0] = !target;
            true
        } else if fits(second, target) {
            self.fields = [DEAD_LINK, !target];
            true
        } else {
            false
        }
    }

    /// Candidate targets in the order a remap search should try them.
    pub fn candidates(&self, block_count: u32, max_index: u32) -> RemapCandidates {
        RemapCandidates::new(*self, block_count, max_index)
    }
}

/// Whether `field` can be rewritten to hold `target` by clearing bits only.
fn fits(field: u16, target: u16) -> bool {
    // `!field` is the stored target; the new one must be a superset of it.
    // A dead field stores "every bit", which only 0xFFFF could cover, and
    // that is never a block index.
    target != FREE_LINK && !field & !target == 0
}

/// Iterator over remap candidates.
///
/// For each of the two fields in turn, yields every block index that keeps
/// the bits of that field's current target, starting from the fewest extra
/// set bits and, within one popcount, from the highest index down. This
/// spends the map's remaining 1 bits as slowly as possible.
pub struct RemapCandidates {
    fields: [u16; 2],
    block_count: u32,
    max_index: u32,
    round: usize,
    base: u32,
    bits: u32,
    next_i: u32,
}

impl RemapCandidates {
    fn new(map: BlockMap, block_count: u32, max_index: u32) -> Self {
        let mut c = Self {
            fields: map.fields,
            block_count,
            max_index,
            round: 0,
            base: 0,
            bits: 0,
            next_i: 0,
        };
        c.start_round(0);
        c
    }

    fn start_round(&mut self, round: usize) {
        self.round = round;
        self.base = match round {
            0 => {
                let map = BlockMap::new(self.fields);
                map.current_target().map(u32::from).unwrap_or(0)
            }
            _ => u32::from(!self.fields[1]),
        };
        self.bits = self.base.count_ones() + 1;
        self.next_i = self.max_index.saturating_sub(1);
    }
}

impl Iterator for RemapCandidates {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        loop {
            if self.round > 1 {
                return None;
            }
            if (1u32 << self.bits.min(31)) > self.max_index || self.bits > 16 {
                // This field is used up.
                self.start_round(self.round + 1);
                continue;
            }
            if self.next_i == 0 {
                self.bits += 1;
                self.next_i = self.max_index.saturating_sub(1);
                continue;
            }
            let i = self.next_i;
            self.next_i -= 1;

            if i & self.base != 0 {
                continue;
            }
            let cand = i | self.base;
            if cand.count_ones() == self.bits && cand < self.block_count {
                return Some(cand as u16);
            }
        }
    }
}
