//! Tree state pair.
//!
//! Two tree state records live in pages 1 (slot A) and 2 (slot B). Each
//! checkpoint writes the slot not holding the newest state, so a crash while
//! writing one slot always leaves the other intact. Selection is a pure read:
//! slots failing their checksum are discarded and the valid slot with the
//! greater generation stamp wins.

use crate::page_cache::{Page, PageId, PageType, PagedFile, PinMode};
use crate::tree::error::TreeInconsistency;

/// Meta record page.
pub const META_PAGE_ID: PageId = 0;
/// First page available to tree nodes and free-list pages.
pub const BASE_PAGE_ID: PageId = 3;

/// Current tree state record version.
pub const STATE_VERSION: u8 = 1;

/// Byte offsets within a tree state page.
mod offsets {
    pub const PAGE_TYPE: usize = 0;
    pub const STABLE_GENERATION: usize = 8;
    pub const UNSTABLE_GENERATION: usize = 16;
    pub const ROOT_ID: usize = 24;
    pub const ROOT_GENERATION: usize = 32;
    pub const LAST_ID: usize = 40;
    pub const FREE_LIST_HEAD: usize = 48;
    pub const FREE_LIST_COUNT: usize = 56;
    pub const CLEAN: usize = 64;
    pub const VERSION: usize = 65;
    pub const CHECKSUM: usize = 68;
    pub const HEADER_LENGTH: usize = 72;
    pub const HEADER_DATA: usize = 76;
}

/// One of the two state slots.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateSlot {
    A,
    B,
}

impl StateSlot {
    #[must_use]
    pub const fn page_id(self) -> PageId {
        match self {
            Self::A => 1,
            Self::B => 2,
        }
    }

    #[must_use]
    pub const fn other(self) -> Self {
        match self {
            Self::A => Self::B,
            Self::B => Self::A,
        }
    }
}

impl std::fmt::Display for StateSlot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::A => write!(f, "A"),
            Self::B => write!(f, "B"),
        }
    }
}

/// A persisted tree state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TreeState {
    pub slot: StateSlot,
    /// Last checkpointed generation.
    pub stable_generation: u64,
    /// Generation being written since the state was persisted.
    pub unstable_generation: u64,
    pub root_id: PageId,
    pub root_generation: u64,
    /// Highest page id ever allocated.
    pub last_id: PageId,
    pub free_list_head: PageId,
    pub free_list_count: u64,
    /// Whether the tree was closed cleanly after this state was written.
    pub clean: bool,
    pub version: u8,
}

impl TreeState {
    /// Generation stamp ordering the two slots.
    #[must_use]
    pub const fn stamp(&self) -> (u64, u64) {
        (self.stable_generation, self.unstable_generation)
    }

    /// Largest header payload a state page of `page_size` can hold.
    #[must_use]
    pub const fn max_header_size(page_size: usize) -> usize {
        page_size - offsets::HEADER_DATA
    }

    /// Write this state and the header data into a page.
    #[allow(clippy::cast_possible_truncation)] // header length is bounded by the page size
    pub fn write_to_page(&self, page: &mut Page, header: &[u8]) -> Result<(), StateError> {
        let max = Self::max_header_size(page.size());
        if header.len() > max {
            return Err(StateError::HeaderTooLarge {
                size: header.len(),
                max,
            });
        }
        page.init(PageType::TreeState);
        page.write_u64(offsets::STABLE_GENERATION, self.stable_generation);
        page.write_u64(offsets::UNSTABLE_GENERATION, self.unstable_generation);
        page.write_u64(offsets::ROOT_ID, self.root_id);
        page.write_u64(offsets::ROOT_GENERATION, self.root_generation);
        page.write_u64(offsets::LAST_ID, self.last_id);
        page.write_u64(offsets::FREE_LIST_HEAD, self.free_list_head);
        page.write_u64(offsets::FREE_LIST_COUNT, self.free_list_count);
        page.write_u8(offsets::CLEAN, u8::from(self.clean));
        page.write_u8(offsets::VERSION, self.version);
        page.write_u32(offsets::HEADER_LENGTH, header.len() as u32);
        page.write_bytes(offsets::HEADER_DATA, header);
        let checksum = record_checksum(page, header.len());
        page.write_u32(offsets::CHECKSUM, checksum);
        Ok(())
    }

    /// Read a state and its header data from a slot's page.
    pub fn read_from_page(page: &Page, slot: StateSlot) -> Result<TreeStateRecord, StateError> {
        if page.is_zeroed() {
            return Err(StateError::Unwritten);
        }
        let page_type = page.read_u8(offsets::PAGE_TYPE);
        if page_type != PageType::TreeState as u8 {
            return Err(StateError::WrongPageType(page_type));
        }
        let header_len = page.read_u32(offsets::HEADER_LENGTH) as usize;
        let max = Self::max_header_size(page.size());
        if header_len > max {
            return Err(StateError::HeaderTooLarge {
                size: header_len,
                max,
            });
        }
        let expected = page.read_u32(offsets::CHECKSUM);
        let actual = record_checksum(page, header_len);
        if expected != actual {
            return Err(StateError::ChecksumMismatch { expected, actual });
        }

        let state = Self {
            slot,
            stable_generation: page.read_u64(offsets::STABLE_GENERATION),
            unstable_generation: page.read_u64(offsets::UNSTABLE_GENERATION),
            root_id: page.read_u64(offsets::ROOT_ID),
            root_generation: page.read_u64(offsets::ROOT_GENERATION),
            last_id: page.read_u64(offsets::LAST_ID),
            free_list_head: page.read_u64(offsets::FREE_LIST_HEAD),
            free_list_count: page.read_u64(offsets::FREE_LIST_COUNT),
            clean: page.read_u8(offsets::CLEAN) != 0,
            version: page.read_u8(offsets::VERSION),
        };
        if state.stable_generation == 0 || state.unstable_generation <= state.stable_generation {
            return Err(StateError::InvalidGenerations {
                stable: state.stable_generation,
                unstable: state.unstable_generation,
            });
        }
        if state.version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion(state.version));
        }
        Ok(TreeStateRecord {
            state,
            header: page.read_bytes(offsets::HEADER_DATA, header_len).to_vec(),
        })
    }
}

fn record_checksum(page: &Page, header_len: usize) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(page.read_bytes(
        offsets::STABLE_GENERATION,
        offsets::CHECKSUM - offsets::STABLE_GENERATION,
    ));
    hasher.update(page.read_bytes(
        offsets::HEADER_LENGTH,
        offsets::HEADER_DATA - offsets::HEADER_LENGTH + header_len,
    ));
    hasher.finalize()
}

/// A tree state together with the user header data stored beside it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStateRecord {
    pub state: TreeState,
    pub header: Vec<u8>,
}

/// Why a state slot is not usable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StateError {
    /// The slot was never written.
    Unwritten,
    /// The slot page has another page type.
    WrongPageType(u8),
    /// The record checksum does not match.
    ChecksumMismatch { expected: u32, actual: u32 },
    /// The generations recorded are impossible.
    InvalidGenerations { stable: u64, unstable: u64 },
    /// Unknown record version.
    UnsupportedVersion(u8),
    /// Header data does not fit in the page.
    HeaderTooLarge { size: usize, max: usize },
    /// The slot page could not be read.
    Unreadable(String),
}

impl std::fmt::Display for StateError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unwritten => write!(f, "never written"),
            Self::WrongPageType(t) => write!(f, "wrong page type 0x{t:02x}"),
            Self::ChecksumMismatch { expected, actual } => {
                write!(f, "checksum mismatch: expected {expected}, got {actual}")
            }
            Self::InvalidGenerations { stable, unstable } => {
                write!(f, "invalid generations: stable {stable}, unstable {unstable}")
            }
            Self::UnsupportedVersion(v) => write!(f, "unsupported state version {v}"),
            Self::HeaderTooLarge { size, max } => {
                write!(f, "header data of {size} bytes exceeds {max}")
            }
            Self::Unreadable(reason) => write!(f, "unreadable: {reason}"),
        }
    }
}

impl std::error::Error for StateError {}

/// Both state slots as read from a file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeStatePair {
    pub a: Result<TreeStateRecord, StateError>,
    pub b: Result<TreeStateRecord, StateError>,
}

impl TreeStatePair {
    /// Read both slots. Never writes, so it is safe to call repeatedly on
    /// a file that is in use elsewhere.
    #[must_use]
    pub fn read(paged_file: &PagedFile) -> Self {
        let read_slot = |slot: StateSlot| {
            let cursor = paged_file
                .pin(slot.page_id(), PinMode::Read)
                .map_err(|e| StateError::Unreadable(e.to_string()))?;
            TreeState::read_from_page(cursor.page(), slot)
        };
        Self {
            a: read_slot(StateSlot::A),
            b: read_slot(StateSlot::B),
        }
    }

    /// The newest valid state.
    pub fn select_newest(&self) -> Result<&TreeStateRecord, TreeInconsistency> {
        match (&self.a, &self.b) {
            (Ok(a), Ok(b)) => match a.state.stamp().cmp(&b.state.stamp()) {
                std::cmp::Ordering::Greater => Ok(a),
                std::cmp::Ordering::Less => Ok(b),
                std::cmp::Ordering::Equal => Err(TreeInconsistency::EqualStateGenerations {
                    stable: a.state.stable_generation,
                    unstable: a.state.unstable_generation,
                }),
            },
            (Ok(a), Err(_)) => Ok(a),
            (Err(_), Ok(b)) => Ok(b),
            (Err(a), Err(b)) => Err(TreeInconsistency::BothStatesInvalid {
                a: a.to_string(),
                b: b.to_string(),
            }),
        }
    }

    /// The slot the next state must be written to: the one not holding the
    /// newest state. When only one slot is valid this is the invalid one, so
    /// the valid state ends up duplicated at the next write.
    pub fn slot_to_write(&self) -> Result<StateSlot, TreeInconsistency> {
        Ok(self.select_newest()?.state.slot.other())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fs::{EphemeralFileSystem, FileSystem};
    use crate::page_cache::{MapOptions, PageCache};
    use std::path::Path;
    use std::sync::Arc;

    const PAGE_SIZE: usize = 256;

    fn state(slot: StateSlot, stable: u64, unstable: u64) -> TreeState {
        TreeState {
            slot,
            stable_generation: stable,
            unstable_generation: unstable,
            root_id: 3,
            root_generation: stable,
            last_id: 3,
            free_list_head: 0,
            free_list_count: 0,
            clean: true,
            version: STATE_VERSION,
        }
    }

    fn record(slot: StateSlot, stable: u64, unstable: u64) -> TreeStateRecord {
        TreeStateRecord {
            state: state(slot, stable, unstable),
            header: Vec::new(),
        }
    }

    #[test]
    fn test_state_roundtrip_with_header() {
        let mut page = Page::new(PAGE_SIZE);
        let original = state(StateSlot::B, 5, 6);
        original
            .write_to_page(&mut page, b"user header")
            .expect("write");

        let read = TreeState::read_from_page(&page, StateSlot::B).expect("read");
        assert_eq!(read.state, original);
        assert_eq!(read.header, b"user header");
    }

    #[test]
    fn test_checksum_covers_header_data() {
        let mut page = Page::new(PAGE_SIZE);
        state(StateSlot::A, 1, 2)
            .write_to_page(&mut page, b"abc")
            .expect("write");
        page.write_u8(77, b'X');
        assert!(matches!(
            TreeState::read_from_page(&page, StateSlot::A),
            Err(StateError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn test_header_too_large() {
        let mut page = Page::new(PAGE_SIZE);
        let header = vec![1u8; TreeState::max_header_size(PAGE_SIZE) + 1];
        assert!(matches!(
            state(StateSlot::A, 1, 2).write_to_page(&mut page, &header),
            Err(StateError::HeaderTooLarge { .. })
        ));
    }

    #[test]
    fn test_selection_picks_greater_stamp() {
        let stamps = [
            ((1, 2), (2, 3)),
            ((5, 9), (5, 7)),
            ((10, 11), (3, 40)),
            ((7, 8), (7, 9)),
        ];
        for ((sa, ua), (sb, ub)) in stamps {
            let pair = TreeStatePair {
                a: Ok(record(StateSlot::A, sa, ua)),
                b: Ok(record(StateSlot::B, sb, ub)),
            };
            let expected = if (sa, ua) > (sb, ub) {
                StateSlot::A
            } else {
                StateSlot::B
            };
            let newest = pair.select_newest().expect("select");
            assert_eq!(newest.state.slot, expected, "stamps {:?} vs {:?}", (sa, ua), (sb, ub));
            assert_eq!(pair.slot_to_write().expect("slot"), expected.other());
        }
    }

    #[test]
    fn test_single_valid_slot_wins_regardless_of_stamp() {
        let pair = TreeStatePair {
            a: Err(StateError::ChecksumMismatch {
                expected: 1,
                actual: 2,
            }),
            b: Ok(record(StateSlot::B, 1, 2)),
        };
        assert_eq!(pair.select_newest().expect("select").state.slot, StateSlot::B);
        assert_eq!(pair.slot_to_write().expect("slot"), StateSlot::A);

        let pair = TreeStatePair {
            a: Ok(record(StateSlot::A, 1, 2)),
            b: Err(StateError::Unwritten),
        };
        assert_eq!(pair.select_newest().expect("select").state.slot, StateSlot::A);
    }

    #[test]
    fn test_both_invalid_is_inconsistency() {
        let pair = TreeStatePair {
            a: Err(StateError::Unwritten),
            b: Err(StateError::WrongPageType(9)),
        };
        assert!(matches!(
            pair.select_newest(),
            Err(TreeInconsistency::BothStatesInvalid { .. })
        ));
    }

    #[test]
    fn test_equal_stamps_are_inconsistent() {
        let pair = TreeStatePair {
            a: Ok(record(StateSlot::A, 4, 5)),
            b: Ok(record(StateSlot::B, 4, 5)),
        };
        assert!(matches!(
            pair.select_newest(),
            Err(TreeInconsistency::EqualStateGenerations { .. })
        ));
    }

    #[test]
    fn test_invalid_generations_rejected() {
        let mut page = Page::new(PAGE_SIZE);
        state(StateSlot::A, 3, 3)
            .write_to_page(&mut page, &[])
            .expect("write");
        assert!(matches!(
            TreeState::read_from_page(&page, StateSlot::A),
            Err(StateError::InvalidGenerations { .. })
        ));
    }

    #[test]
    fn test_read_pair_from_file_discards_corrupt_slot() {
        let fs = Arc::new(EphemeralFileSystem::new());
        let path = Path::new("/states");
        let cache = PageCache::new(Arc::clone(&fs) as Arc<dyn FileSystem>, 8);
        let file = cache
            .map(path, PAGE_SIZE, MapOptions::create())
            .expect("map");
        for (slot, stable) in [(StateSlot::A, 1), (StateSlot::B, 2)] {
            let mut cursor = file.pin(slot.page_id(), PinMode::Overwrite).expect("pin");
            state(slot, stable, stable + 1)
                .write_to_page(cursor.page_mut(), &[])
                .expect("write");
            cursor.commit().expect("commit");
        }
        file.flush_and_force().expect("flush");
        let pair = TreeStatePair::read(&file);
        assert_eq!(pair.select_newest().expect("select").state.slot, StateSlot::B);
        drop(file);

        // Corrupt slot B on disk: A becomes the only valid slot.
        fs.corrupt_byte(path, StateSlot::B.page_id() * PAGE_SIZE as u64 + 20)
            .expect("corrupt");
        let file = cache
            .map(path, PAGE_SIZE, MapOptions::read_only())
            .expect("remap");
        let pair = TreeStatePair::read(&file);
        assert!(matches!(pair.b, Err(StateError::Unreadable(_))));
        assert_eq!(pair.select_newest().expect("select").state.slot, StateSlot::A);
        // Reading is side-effect free.
        assert_eq!(TreeStatePair::read(&file), pair);
    }
}
