//! Generations and generation-safe pointers.
//!
//! Every node records the generation it was written in. A checkpoint makes
//! the unstable generation stable; anything written in a generation that was
//! never made stable belongs to a crash and must be ignored. Pointers that
//! are rewritten in place (siblings and successors) are therefore stored as
//! a pair of generation-stamped slots: a write never touches the slot
//! holding the last stable value.

use crate::page_cache::{Page, PageId};

/// The stable/unstable generation pair a tree operates under.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Generation {
    pub stable: u64,
    pub unstable: u64,
}

impl Generation {
    #[must_use]
    pub const fn new(stable: u64, unstable: u64) -> Self {
        Self { stable, unstable }
    }

    /// Whether data stamped with `generation` is visible: it was either
    /// checkpointed or written in the current session.
    #[must_use]
    pub const fn is_valid(&self, generation: u64) -> bool {
        generation != 0 && (generation <= self.stable || generation == self.unstable)
    }

    /// Whether `generation` was written by a session that crashed.
    #[must_use]
    pub const fn is_crashed(&self, generation: u64) -> bool {
        generation > self.stable && generation < self.unstable
    }

    /// The generation pair after a checkpoint of this one.
    #[must_use]
    pub const fn next_checkpoint(&self) -> Self {
        Self {
            stable: self.unstable,
            unstable: self.unstable + 1,
        }
    }
}

/// One generation-stamped pointer slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenSafePointer {
    pub generation: u64,
    pub pointer: PageId,
}

impl GenSafePointer {
    pub const SIZE: usize = 16;

    fn read(page: &Page, offset: usize) -> Self {
        Self {
            generation: page.read_u64(offset),
            pointer: page.read_u64(offset + 8),
        }
    }

    fn write(self, page: &mut Page, offset: usize) {
        page.write_u64(offset, self.generation);
        page.write_u64(offset + 8, self.pointer);
    }
}

/// A pair of pointer slots at a fixed page offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct GenSafePointerPair {
    pub a: GenSafePointer,
    pub b: GenSafePointer,
}

impl GenSafePointerPair {
    pub const SIZE: usize = 2 * GenSafePointer::SIZE;

    #[must_use]
    pub fn read_from(page: &Page, offset: usize) -> Self {
        Self {
            a: GenSafePointer::read(page, offset),
            b: GenSafePointer::read(page, offset + GenSafePointer::SIZE),
        }
    }

    pub fn write_to(&self, page: &mut Page, offset: usize) {
        self.a.write(page, offset);
        self.b.write(page, offset + GenSafePointer::SIZE);
    }

    /// A pair holding `pointer` in slot A only.
    #[must_use]
    pub const fn fresh(pointer: PageId, generation: u64) -> Self {
        Self {
            a: GenSafePointer {
                generation,
                pointer,
            },
            b: GenSafePointer {
                generation: 0,
                pointer: 0,
            },
        }
    }

    /// The visible pointer: the valid slot with the highest generation.
    /// `None` when no slot is valid or the visible slot holds the null page.
    #[must_use]
    pub fn read(&self, generation: Generation) -> Option<PageId> {
        let a_valid = generation.is_valid(self.a.generation);
        let b_valid = generation.is_valid(self.b.generation);
        let slot = match (a_valid, b_valid) {
            (true, true) if self.b.generation > self.a.generation => self.b,
            (true, _) => self.a,
            (false, true) => self.b,
            (false, false) => return None,
        };
        (slot.pointer != 0).then_some(slot.pointer)
    }

    /// Store `pointer` under the unstable generation.
    ///
    /// A slot already written in this generation is overwritten; otherwise a
    /// slot no longer visible is reused; otherwise the older of two stable
    /// slots is replaced. The newest stable slot is never touched.
    pub fn write(&mut self, pointer: PageId, generation: Generation) {
        let new = GenSafePointer {
            generation: generation.unstable,
            pointer,
        };
        if self.a.generation == generation.unstable {
            self.a = new;
        } else if self.b.generation == generation.unstable {
            self.b = new;
        } else if !generation.is_valid(self.a.generation) {
            self.a = new;
        } else if !generation.is_valid(self.b.generation) {
            self.b = new;
        } else if self.a.generation <= self.b.generation {
            self.a = new;
        } else {
            self.b = new;
        }
    }

    /// Clear slots written by crashed generations. Returns how many slots
    /// were cleared.
    pub fn clean_crashed(&mut self, generation: Generation) -> usize {
        let mut cleaned = 0;
        for slot in [&mut self.a, &mut self.b] {
            if generation.is_crashed(slot.generation) {
                *slot = GenSafePointer::default();
                cleaned += 1;
            }
        }
        cleaned
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generation_visibility() {
        let generation = Generation::new(5, 8);
        assert!(!generation.is_valid(0));
        assert!(generation.is_valid(3));
        assert!(generation.is_valid(5));
        assert!(!generation.is_valid(6));
        assert!(!generation.is_valid(7));
        assert!(generation.is_valid(8));
        assert!(!generation.is_valid(9));
        assert!(generation.is_crashed(6));
        assert!(!generation.is_crashed(8));
        assert_eq!(generation.next_checkpoint(), Generation::new(8, 9));
    }

    #[test]
    fn test_write_keeps_stable_slot() {
        let g1 = Generation::new(1, 2);
        let mut pair = GenSafePointerPair::fresh(10, 1);
        pair.write(20, g1);
        assert_eq!(pair.read(g1), Some(20));
        // Overwriting within the same generation reuses the unstable slot.
        pair.write(30, g1);
        assert_eq!(pair.a.pointer, 10);
        assert_eq!(pair.read(g1), Some(30));

        // A crash before the checkpoint: the next session sees the old value.
        let after_crash = Generation::new(1, 3);
        assert_eq!(pair.read(after_crash), Some(10));
        pair.write(40, after_crash);
        assert_eq!(pair.read(after_crash), Some(40));
        assert_eq!(pair.a.pointer, 10);
    }

    #[test]
    fn test_write_replaces_older_stable_slot() {
        let mut pair = GenSafePointerPair::fresh(10, 1);
        pair.write(20, Generation::new(1, 2));
        let g = Generation::new(2, 3);
        assert_eq!(pair.read(g), Some(20));
        pair.write(30, g);
        assert_eq!(pair.read(g), Some(30));
        assert_eq!(pair.read(Generation::new(2, 4)), Some(20));
    }

    #[test]
    fn test_null_pointer_reads_as_none() {
        let g = Generation::new(1, 2);
        let mut pair = GenSafePointerPair::fresh(0, 1);
        assert_eq!(pair.read(g), None);
        pair.write(7, g);
        assert_eq!(pair.read(g), Some(7));
        assert_eq!(GenSafePointerPair::default().read(g), None);
    }

    #[test]
    fn test_clean_crashed_slots() {
        let mut pair = GenSafePointerPair::fresh(10, 1);
        pair.write(20, Generation::new(1, 2));
        let g = Generation::new(1, 3);
        assert_eq!(pair.clean_crashed(g), 1);
        assert_eq!(pair.b, GenSafePointer::default());
        assert_eq!(pair.read(g), Some(10));
        assert_eq!(pair.clean_crashed(g), 0);
    }

    #[test]
    fn test_page_roundtrip() {
        let mut page = Page::new(256);
        let mut pair = GenSafePointerPair::fresh(11, 4);
        pair.write(12, Generation::new(4, 5));
        pair.write_to(&mut page, 24);
        assert_eq!(GenSafePointerPair::read_from(&page, 24), pair);
    }
}
