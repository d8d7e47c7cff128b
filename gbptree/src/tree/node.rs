//! Tree node pages.
//!
//! A node page starts with the common page header, followed by the node
//! header and the node body:
//!
//! ```text
//! 8   kind (u8: 1 = leaf, 2 = internal)
//! 10  key count (u16)
//! 16  generation (u64)
//! 24  right sibling pointer pair (32 bytes, leaves only)
//! 56  left sibling pointer pair (32 bytes, leaves only)
//! 88  successor pointer pair (32 bytes)
//! 120 body
//! ```
//!
//! Leaf body: `key_len u16, value_len u16, key, value` per entry.
//! Internal body: child 0 as `(id u64, generation u64)`, then
//! `key_len u16, key, child` per key. Keys of an internal node separate its
//! children: every key in `children[i]` is `< keys[i] <= ` every key in
//! `children[i + 1]`.

use std::cmp::Ordering;

use crate::page_cache::{Page, PageId, PageType};
use crate::tree::pointer::{GenSafePointerPair, Generation};

mod offsets {
    pub const PAGE_TYPE: usize = 0;
    pub const KIND: usize = 8;
    pub const KEY_COUNT: usize = 10;
    pub const GENERATION: usize = 16;
    pub const RIGHT_SIBLING: usize = 24;
    pub const LEFT_SIBLING: usize = 56;
    pub const SUCCESSOR: usize = 88;
    pub const DATA: usize = 120;
}

const KIND_LEAF: u8 = 1;
const KIND_INTERNAL: u8 = 2;

/// Per-entry overhead of a leaf entry (two u16 lengths).
const LEAF_ENTRY_OVERHEAD: usize = 4;
/// Per-key overhead of an internal key (one u16 length).
const INTERNAL_KEY_OVERHEAD: usize = 2;

/// Bytes available for the node body.
#[must_use]
pub const fn data_space(page_size: usize) -> usize {
    page_size - offsets::DATA
}

/// Largest encoded key. Three keys of this size always fit in an internal
/// node, so an overflowing internal node can always be split around a
/// median with at least one key on each side.
#[must_use]
pub const fn max_key_size(page_size: usize) -> usize {
    (data_space(page_size) - ChildPointer::SIZE) / 3 - INTERNAL_KEY_OVERHEAD - ChildPointer::SIZE
}

/// Largest encoded leaf entry (key, value and overhead).
#[must_use]
pub const fn max_entry_size(page_size: usize) -> usize {
    data_space(page_size) / 3
}

/// Encoded size of a leaf entry.
#[must_use]
pub const fn leaf_entry_size(key_len: usize, value_len: usize) -> usize {
    LEAF_ENTRY_OVERHEAD + key_len + value_len
}

/// Generation-safe pointer fields in a node header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerField {
    RightSibling,
    LeftSibling,
    Successor,
}

impl PointerField {
    pub const ALL: [Self; 3] = [Self::RightSibling, Self::LeftSibling, Self::Successor];

    #[must_use]
    pub const fn offset(self) -> usize {
        match self {
            Self::RightSibling => offsets::RIGHT_SIBLING,
            Self::LeftSibling => offsets::LEFT_SIBLING,
            Self::Successor => offsets::SUCCESSOR,
        }
    }
}

/// Whether a page holds a tree node.
#[must_use]
pub fn is_node_page(page: &Page) -> bool {
    page.read_u8(offsets::PAGE_TYPE) == PageType::TreeNode as u8
}

/// Update one pointer field directly in a node page.
pub fn write_pointer(page: &mut Page, field: PointerField, pointer: PageId, generation: Generation) {
    let mut pair = GenSafePointerPair::read_from(page, field.offset());
    pair.write(pointer, generation);
    pair.write_to(page, field.offset());
}

/// A child pointer: page id plus the generation the child was written in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildPointer {
    pub id: PageId,
    pub generation: u64,
}

impl ChildPointer {
    pub const SIZE: usize = 16;

    #[must_use]
    pub const fn new(id: PageId, generation: u64) -> Self {
        Self { id, generation }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NodeHeader {
    pub generation: u64,
    pub right_sibling: GenSafePointerPair,
    pub left_sibling: GenSafePointerPair,
    pub successor: GenSafePointerPair,
}

impl NodeHeader {
    /// Header of a node first written in `generation`, with sibling pointers
    /// stored fresh.
    #[must_use]
    pub const fn fresh(generation: u64, left: Option<PageId>, right: Option<PageId>) -> Self {
        Self {
            generation,
            right_sibling: GenSafePointerPair::fresh(unwrap_pointer(right), generation),
            left_sibling: GenSafePointerPair::fresh(unwrap_pointer(left), generation),
            successor: GenSafePointerPair::fresh(0, generation),
        }
    }

    #[must_use]
    pub const fn pointer(&self, field: PointerField) -> &GenSafePointerPair {
        match field {
            PointerField::RightSibling => &self.right_sibling,
            PointerField::LeftSibling => &self.left_sibling,
            PointerField::Successor => &self.successor,
        }
    }

    pub const fn pointer_mut(&mut self, field: PointerField) -> &mut GenSafePointerPair {
        match field {
            PointerField::RightSibling => &mut self.right_sibling,
            PointerField::LeftSibling => &mut self.left_sibling,
            PointerField::Successor => &mut self.successor,
        }
    }
}

const fn unwrap_pointer(pointer: Option<PageId>) -> PageId {
    match pointer {
        Some(id) => id,
        None => 0,
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeafEntry {
    pub key: Vec<u8>,
    pub value: Vec<u8>,
}

impl LeafEntry {
    #[must_use]
    pub const fn size(&self) -> usize {
        leaf_entry_size(self.key.len(), self.value.len())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct LeafNode {
    pub entries: Vec<LeafEntry>,
}

impl LeafNode {
    /// Bytes of the body in use.
    #[must_use]
    pub fn used_space(&self) -> usize {
        self.entries.iter().map(LeafEntry::size).sum()
    }

    /// Binary search for an encoded key.
    pub fn search<F>(&self, key: &[u8], compare: F) -> Result<usize, usize>
    where
        F: Fn(&[u8], &[u8]) -> Ordering,
    {
        self.entries.binary_search_by(|entry| compare(&entry.key, key))
    }

    /// Split off the upper part of the entries, dividing the bytes in use
    /// roughly in half.
    ///
    /// # Pre-conditions
    ///
    /// - the leaf has at least two entries
    #[must_use]
    pub fn split_off_upper(&mut self) -> Self {
        let sizes: Vec<usize> = self.entries.iter().map(LeafEntry::size).collect();
        let at = byte_split_point(&sizes, 1, sizes.len().saturating_sub(1));
        Self {
            entries: self.entries.split_off(at),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InternalNode {
    pub keys: Vec<Vec<u8>>,
    /// Always one more than `keys`.
    pub children: Vec<ChildPointer>,
}

impl InternalNode {
    #[must_use]
    pub fn used_space(&self) -> usize {
        ChildPointer::SIZE
            + self
                .keys
                .iter()
                .map(|key| internal_key_size(key.len()))
                .sum::<usize>()
    }

    /// Index of the child whose range holds `key`. Keys equal to a separator
    /// go right.
    pub fn find_child_index<F>(&self, key: &[u8], compare: F) -> usize
    where
        F: Fn(&[u8], &[u8]) -> Ordering,
    {
        self.keys
            .partition_point(|separator| compare(separator, key) != Ordering::Greater)
    }

    /// Index of the child pointer to page `id`.
    #[must_use]
    pub fn position_of(&self, id: PageId) -> Option<usize> {
        self.children.iter().position(|child| child.id == id)
    }

    /// Split around a median key. The median moves up to the parent; this
    /// node keeps the lower keys and the returned node takes the upper ones.
    ///
    /// # Pre-conditions
    ///
    /// - the node has at least three keys
    pub fn split_around_median(&mut self) -> (Vec<u8>, Self) {
        let sizes: Vec<usize> = self.keys.iter().map(|k| internal_key_size(k.len())).collect();
        let n = sizes.len();
        let median = byte_split_point(&sizes, 1, n.saturating_sub(2));
        let mut upper_keys = self.keys.split_off(median);
        let separator = upper_keys.remove(0);
        let upper_children = self.children.split_off(median + 1);
        (
            separator,
            Self {
                keys: upper_keys,
                children: upper_children,
            },
        )
    }
}

const fn internal_key_size(key_len: usize) -> usize {
    INTERNAL_KEY_OVERHEAD + key_len + ChildPointer::SIZE
}

/// Index at which to divide items of the given sizes so that the bytes on
/// each side are as even as possible, clamped to `[min, max]`.
#[must_use]
pub fn byte_split_point(sizes: &[usize], min: usize, max: usize) -> usize {
    let total: usize = sizes.iter().sum();
    let mut before = 0;
    let mut at = sizes.len();
    for (i, size) in sizes.iter().enumerate() {
        if (before + size) * 2 > total {
            // Take the item on whichever side leaves the halves closer.
            let without = total - 2 * before;
            let with = 2 * (before + size) - total;
            at = if with < without { i + 1 } else { i };
            break;
        }
        before += size;
    }
    at.clamp(min.min(max), max)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeBody {
    Leaf(LeafNode),
    Internal(InternalNode),
}

/// A decoded tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    pub header: NodeHeader,
    pub body: NodeBody,
}

impl Node {
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.header.generation
    }

    #[must_use]
    pub const fn is_leaf(&self) -> bool {
        matches!(self.body, NodeBody::Leaf(_))
    }

    #[must_use]
    pub const fn as_leaf(&self) -> Option<&LeafNode> {
        match &self.body {
            NodeBody::Leaf(leaf) => Some(leaf),
            NodeBody::Internal(_) => None,
        }
    }

    pub const fn as_leaf_mut(&mut self) -> Option<&mut LeafNode> {
        match &mut self.body {
            NodeBody::Leaf(leaf) => Some(leaf),
            NodeBody::Internal(_) => None,
        }
    }

    #[must_use]
    pub const fn as_internal(&self) -> Option<&InternalNode> {
        match &self.body {
            NodeBody::Internal(internal) => Some(internal),
            NodeBody::Leaf(_) => None,
        }
    }

    pub const fn as_internal_mut(&mut self) -> Option<&mut InternalNode> {
        match &mut self.body {
            NodeBody::Internal(internal) => Some(internal),
            NodeBody::Leaf(_) => None,
        }
    }

    #[must_use]
    pub fn used_space(&self) -> usize {
        match &self.body {
            NodeBody::Leaf(leaf) => leaf.used_space(),
            NodeBody::Internal(internal) => internal.used_space(),
        }
    }

    /// Number of keys in the node.
    #[must_use]
    pub fn key_count(&self) -> usize {
        match &self.body {
            NodeBody::Leaf(leaf) => leaf.entries.len(),
            NodeBody::Internal(internal) => internal.keys.len(),
        }
    }

    /// Encode into `page`, replacing its content.
    ///
    /// # Pre-conditions
    ///
    /// - `self.used_space()` fits in the page's data space
    #[allow(clippy::cast_possible_truncation)] // lengths are bounded by the page size
    pub fn write_to(&self, page: &mut Page) {
        page.init(PageType::TreeNode);
        page.write_u16(offsets::KEY_COUNT, self.key_count() as u16);
        page.write_u64(offsets::GENERATION, self.header.generation);
        for field in PointerField::ALL {
            self.header.pointer(field).write_to(page, field.offset());
        }

        let mut offset = offsets::DATA;
        match &self.body {
            NodeBody::Leaf(leaf) => {
                page.write_u8(offsets::KIND, KIND_LEAF);
                for entry in &leaf.entries {
                    page.write_u16(offset, entry.key.len() as u16);
                    page.write_u16(offset + 2, entry.value.len() as u16);
                    offset += LEAF_ENTRY_OVERHEAD;
                    page.write_bytes(offset, &entry.key);
                    offset += entry.key.len();
                    page.write_bytes(offset, &entry.value);
                    offset += entry.value.len();
                }
            }
            NodeBody::Internal(internal) => {
                page.write_u8(offsets::KIND, KIND_INTERNAL);
                let mut children = internal.children.iter();
                if let Some(first) = children.next() {
                    write_child(page, offset, *first);
                }
                offset += ChildPointer::SIZE;
                for (key, child) in internal.keys.iter().zip(children) {
                    page.write_u16(offset, key.len() as u16);
                    offset += INTERNAL_KEY_OVERHEAD;
                    page.write_bytes(offset, key);
                    offset += key.len();
                    write_child(page, offset, *child);
                    offset += ChildPointer::SIZE;
                }
            }
        }
    }

    /// Decode a node page. Never panics on malformed content.
    pub fn read_from(page: &Page) -> Result<Self, NodeError> {
        let page_type = page.read_u8(offsets::PAGE_TYPE);
        if page_type != PageType::TreeNode as u8 {
            return Err(NodeError::WrongPageType(page_type));
        }
        let key_count = page.read_u16(offsets::KEY_COUNT) as usize;
        let header = NodeHeader {
            generation: page.read_u64(offsets::GENERATION),
            right_sibling: GenSafePointerPair::read_from(page, offsets::RIGHT_SIBLING),
            left_sibling: GenSafePointerPair::read_from(page, offsets::LEFT_SIBLING),
            successor: GenSafePointerPair::read_from(page, offsets::SUCCESSOR),
        };

        let mut reader = BodyReader {
            page,
            offset: offsets::DATA,
        };
        let body = match page.read_u8(offsets::KIND) {
            KIND_LEAF => {
                let mut entries = Vec::with_capacity(key_count);
                for _ in 0..key_count {
                    let key_len = reader.u16()? as usize;
                    let value_len = reader.u16()? as usize;
                    let key = reader.bytes(key_len)?.to_vec();
                    let value = reader.bytes(value_len)?.to_vec();
                    entries.push(LeafEntry { key, value });
                }
                NodeBody::Leaf(LeafNode { entries })
            }
            KIND_INTERNAL => {
                let mut keys = Vec::with_capacity(key_count);
                let mut children = Vec::with_capacity(key_count + 1);
                children.push(reader.child()?);
                for _ in 0..key_count {
                    let key_len = reader.u16()? as usize;
                    keys.push(reader.bytes(key_len)?.to_vec());
                    children.push(reader.child()?);
                }
                NodeBody::Internal(InternalNode { keys, children })
            }
            other => return Err(NodeError::UnknownKind(other)),
        };
        Ok(Self { header, body })
    }
}

fn write_child(page: &mut Page, offset: usize, child: ChildPointer) {
    page.write_u64(offset, child.id);
    page.write_u64(offset + 8, child.generation);
}

struct BodyReader<'a> {
    page: &'a Page,
    offset: usize,
}

impl<'a> BodyReader<'a> {
    fn check(&self, len: usize) -> Result<(), NodeError> {
        if self.offset + len > self.page.size() {
            return Err(NodeError::Overrun {
                offset: self.offset,
                len,
            });
        }
        Ok(())
    }

    fn u16(&mut self) -> Result<u16, NodeError> {
        self.check(2)?;
        let value = self.page.read_u16(self.offset);
        self.offset += 2;
        Ok(value)
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8], NodeError> {
        self.check(len)?;
        let bytes = self.page.read_bytes(self.offset, len);
        self.offset += len;
        Ok(bytes)
    }

    fn child(&mut self) -> Result<ChildPointer, NodeError> {
        self.check(ChildPointer::SIZE)?;
        let child = ChildPointer {
            id: self.page.read_u64(self.offset),
            generation: self.page.read_u64(self.offset + 8),
        };
        self.offset += ChildPointer::SIZE;
        Ok(child)
    }
}

/// A node page that cannot be decoded.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeError {
    WrongPageType(u8),
    UnknownKind(u8),
    /// An entry runs past the end of the page.
    Overrun { offset: usize, len: usize },
}

impl std::fmt::Display for NodeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::WrongPageType(t) => write!(f, "not a tree node page (type 0x{t:02x})"),
            Self::UnknownKind(k) => write!(f, "unknown node kind {k}"),
            Self::Overrun { offset, len } => {
                write!(f, "{len} bytes at offset {offset} run past the page end")
            }
        }
    }
}

impl std::error::Error for NodeError {}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE_SIZE: usize = 256;

    fn entry(key: u8, value_len: usize) -> LeafEntry {
        LeafEntry {
            key: vec![key],
            value: vec![key; value_len],
        }
    }

    #[test]
    fn test_size_limits() {
        assert_eq!(data_space(PAGE_SIZE), 136);
        assert_eq!(max_key_size(PAGE_SIZE), 22);
        assert_eq!(max_entry_size(PAGE_SIZE), 45);
        // Three maximum keys fill an internal node exactly.
        let internal = InternalNode {
            keys: vec![vec![0; 22]; 3],
            children: vec![ChildPointer::new(3, 1); 4],
        };
        assert_eq!(internal.used_space(), data_space(PAGE_SIZE));
    }

    #[test]
    fn test_leaf_roundtrip() {
        let mut header = NodeHeader::fresh(4, Some(7), None);
        header.successor.write(9, Generation::new(4, 5));
        let node = Node {
            header,
            body: NodeBody::Leaf(LeafNode {
                entries: vec![entry(1, 3), entry(2, 0), entry(5, 10)],
            }),
        };
        let mut page = Page::new(PAGE_SIZE);
        node.write_to(&mut page);
        assert!(is_node_page(&page));
        assert_eq!(Node::read_from(&page).expect("decode"), node);
    }

    #[test]
    fn test_internal_roundtrip() {
        let node = Node {
            header: NodeHeader::fresh(2, None, None),
            body: NodeBody::Internal(InternalNode {
                keys: vec![b"m".to_vec(), b"t".to_vec()],
                children: vec![
                    ChildPointer::new(3, 1),
                    ChildPointer::new(4, 2),
                    ChildPointer::new(5, 2),
                ],
            }),
        };
        let mut page = Page::new(PAGE_SIZE);
        node.write_to(&mut page);
        let decoded = Node::read_from(&page).expect("decode");
        assert_eq!(decoded, node);
        assert_eq!(decoded.key_count(), 2);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        let mut page = Page::new(PAGE_SIZE);
        assert_eq!(Node::read_from(&page), Err(NodeError::WrongPageType(0)));

        page.init(PageType::TreeNode);
        page.write_u8(offsets::KIND, 9);
        assert_eq!(Node::read_from(&page), Err(NodeError::UnknownKind(9)));

        page.write_u8(offsets::KIND, KIND_LEAF);
        page.write_u16(offsets::KEY_COUNT, 1);
        page.write_u16(offsets::DATA, 200);
        assert!(matches!(
            Node::read_from(&page),
            Err(NodeError::Overrun { .. })
        ));
    }

    #[test]
    fn test_find_child_index_sends_equal_keys_right() {
        let node = InternalNode {
            keys: vec![vec![10], vec![20]],
            children: vec![ChildPointer::new(3, 1); 3],
        };
        let cmp = |a: &[u8], b: &[u8]| a.cmp(b);
        assert_eq!(node.find_child_index(&[5], cmp), 0);
        assert_eq!(node.find_child_index(&[10], cmp), 1);
        assert_eq!(node.find_child_index(&[15], cmp), 1);
        assert_eq!(node.find_child_index(&[20], cmp), 2);
        assert_eq!(node.find_child_index(&[99], cmp), 2);
    }

    #[test]
    fn test_leaf_split_balances_bytes() {
        let mut leaf = LeafNode {
            entries: vec![entry(1, 30), entry(2, 2), entry(3, 2), entry(4, 2), entry(5, 2)],
        };
        let upper = leaf.split_off_upper();
        assert_eq!(leaf.entries.len(), 1);
        assert_eq!(upper.entries.len(), 4);

        let mut leaf = LeafNode {
            entries: vec![entry(1, 2), entry(2, 2)],
        };
        let upper = leaf.split_off_upper();
        assert_eq!((leaf.entries.len(), upper.entries.len()), (1, 1));
    }

    #[test]
    fn test_internal_split_keeps_a_key_on_each_side() {
        let mut node = InternalNode {
            keys: vec![vec![1; 20], vec![2], vec![3], vec![4]],
            children: (0..5).map(|i| ChildPointer::new(10 + i, 1)).collect(),
        };
        let (separator, upper) = node.split_around_median();
        assert_eq!(node.keys, vec![vec![1; 20]]);
        assert_eq!(separator, vec![2]);
        assert_eq!(upper.keys, vec![vec![3], vec![4]]);
        assert_eq!(node.children.len(), 2);
        assert_eq!(upper.children.len(), 3);
        assert_eq!(upper.children[0].id, 12);
    }

    #[test]
    fn test_write_pointer_in_place() {
        let node = Node {
            header: NodeHeader::fresh(1, None, Some(8)),
            body: NodeBody::Leaf(LeafNode::default()),
        };
        let mut page = Page::new(PAGE_SIZE);
        node.write_to(&mut page);
        let generation = Generation::new(1, 2);
        write_pointer(&mut page, PointerField::RightSibling, 11, generation);
        let decoded = Node::read_from(&page).expect("decode");
        assert_eq!(decoded.header.right_sibling.read(generation), Some(11));
        assert_eq!(
            decoded.header.right_sibling.read(Generation::new(1, 3)),
            Some(8)
        );
    }
}
