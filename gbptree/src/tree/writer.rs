//! Structural changes.
//!
//! A [`Mutation`] runs in two phases. First the affected nodes are loaded
//! into a working set and changed in memory: entries are inserted or
//! removed, nodes split, merge or redistribute, and sibling links are
//! rewired. Then [`Mutation::commit`] decides where every changed node goes
//! and publishes the pages inside one write section of the structure latch.
//!
//! # Invariants
//!
//! - a node written in a stable generation is never rewritten in place
//!   except for its generation-safe pointer slots; changing its content
//!   copies it to a new page, and its old page gets a successor pointer
//! - page ids released in this generation are not reused before the next
//!   checkpoint
//! - leaves form a doubly linked list in key order; internal nodes carry no
//!   sibling links

use std::collections::HashMap;

use crate::failpoint;
use crate::page_cache::{PageId, PinMode};
use crate::tree::error::GBPTreeError;
use crate::tree::freelist::FreeList;
use crate::tree::gbptree::{RootSnapshot, TreeCore};
use crate::tree::layout::Layout;
use crate::tree::node::{
    self, ChildPointer, InternalNode, LeafEntry, LeafNode, Node, NodeBody, NodeHeader,
    PointerField,
};
use crate::tree::pointer::Generation;
use crate::tree::seek::MAX_TREE_DEPTH;

/// A node in the working set.
#[derive(Debug)]
struct WorkNode {
    node: Node,
    /// 0 for leaves.
    level: usize,
    /// Sibling links as page ids of the working set, resolved to their final
    /// ids at commit.
    left: Option<PageId>,
    right: Option<PageId>,
    loaded_left: Option<PageId>,
    loaded_right: Option<PageId>,
    /// Allocated by this mutation.
    new: bool,
    content_dirty: bool,
    pointers_dirty: bool,
    freed: bool,
}

/// A sibling pointer to rewrite on a page outside the working set.
#[derive(Debug, Clone, Copy)]
struct Fixup {
    page: PageId,
    field: PointerField,
    target: Option<PageId>,
}

pub(crate) struct Mutation<'a, L: Layout> {
    core: &'a TreeCore<L>,
    free_list: &'a mut FreeList,
    generation: Generation,
    root: PageId,
    root_pointer: ChildPointer,
    root_changed: bool,
    data_space: usize,
    nodes: HashMap<PageId, WorkNode>,
    fixups: Vec<Fixup>,
}

impl<'a, L: Layout> Mutation<'a, L> {
    pub(crate) fn new(
        core: &'a TreeCore<L>,
        free_list: &'a mut FreeList,
        snapshot: RootSnapshot,
    ) -> Self {
        Self {
            core,
            free_list,
            generation: snapshot.generation,
            root: snapshot.root.id,
            root_pointer: snapshot.root,
            root_changed: false,
            data_space: node::data_space(core.page_size()),
            nodes: HashMap::new(),
            fixups: Vec::new(),
        }
    }

    /// Insert or replace an entry. Returns the replaced value.
    pub(crate) fn insert(&mut self, key: &[u8], value: &[u8]) -> Result<Option<Vec<u8>>, GBPTreeError> {
        let core = self.core;
        let path = self.find_leaf(key)?;
        let leaf_id = last(&path)?;

        let leaf = self.leaf_mut(leaf_id)?;
        let old = match leaf.search(key, |a, b| core.layout.compare(a, b)) {
            Ok(i) => Some(std::mem::replace(&mut leaf.entries[i].value, value.to_vec())),
            Err(i) => {
                leaf.entries.insert(
                    i,
                    LeafEntry {
                        key: key.to_vec(),
                        value: value.to_vec(),
                    },
                );
                None
            }
        };

        if self.leaf(leaf_id)?.used_space() > self.data_space {
            self.split_leaf(&path)?;
        }
        Ok(old)
    }

    /// Remove an entry. Returns the removed value; `None` leaves the tree
    /// untouched.
    pub(crate) fn remove(&mut self, key: &[u8]) -> Result<Option<Vec<u8>>, GBPTreeError> {
        let core = self.core;
        let path = self.find_leaf(key)?;
        let leaf_id = last(&path)?;

        let Ok(position) = self
            .leaf(leaf_id)?
            .search(key, |a, b| core.layout.compare(a, b))
        else {
            return Ok(None);
        };
        let removed = self.leaf_mut(leaf_id)?.entries.remove(position);
        self.rebalance_leaf(&path)?;
        Ok(Some(removed.value))
    }

    /// Whether anything needs to be written.
    pub(crate) fn is_dirty(&self) -> bool {
        self.root_changed
            || !self.fixups.is_empty()
            || self
                .nodes
                .values()
                .any(|w| w.content_dirty || w.pointers_dirty || w.freed)
    }

    // Loading

    /// Descend from the root to the leaf whose range holds `key`, loading
    /// every node on the way. Returns the path, root first.
    fn find_leaf(&mut self, key: &[u8]) -> Result<Vec<PageId>, GBPTreeError> {
        let core = self.core;
        let mut path = Vec::new();
        let mut pointer = self.root_pointer;
        loop {
            if path.len() >= MAX_TREE_DEPTH {
                return Err(GBPTreeError::corrupt(
                    pointer.id,
                    "tree depth exceeds the supported maximum",
                ));
            }
            self.load(pointer, None)?;
            path.push(pointer.id);
            let work = self.work(pointer.id)?;
            match &work.node.body {
                NodeBody::Leaf(_) => break,
                NodeBody::Internal(internal) => {
                    let index = internal.find_child_index(key, |a, b| core.layout.compare(a, b));
                    pointer = *internal.children.get(index).ok_or_else(|| {
                        GBPTreeError::corrupt(pointer.id, "missing child pointer")
                    })?;
                }
            }
        }

        let height = path.len();
        for (depth, id) in path.iter().enumerate() {
            self.work_mut(*id)?.level = height - 1 - depth;
        }
        Ok(path)
    }

    /// Load a node reached through `pointer` into the working set. With a
    /// `level`, the node kind is checked against it.
    fn load(&mut self, pointer: ChildPointer, level: Option<usize>) -> Result<(), GBPTreeError> {
        if self.nodes.contains_key(&pointer.id) {
            return Ok(());
        }
        let node = self.core.read_node(pointer.id)?;
        if node.generation() > pointer.generation || !self.generation.is_valid(node.generation())
        {
            return Err(GBPTreeError::corrupt(
                pointer.id,
                format!(
                    "node generation {} does not match pointer generation {}",
                    node.generation(),
                    pointer.generation
                ),
            ));
        }
        if let Some(level) = level
            && (level == 0) != node.is_leaf()
        {
            return Err(GBPTreeError::corrupt(
                pointer.id,
                format!("unexpected node kind at level {level}"),
            ));
        }

        let loaded_left = node.header.left_sibling.read(self.generation);
        let loaded_right = node.header.right_sibling.read(self.generation);
        let mut work = WorkNode {
            node,
            level: level.unwrap_or(0),
            left: loaded_left,
            right: loaded_right,
            loaded_left,
            loaded_right,
            new: false,
            content_dirty: false,
            pointers_dirty: false,
            freed: false,
        };
        self.fixups.retain(|fixup| {
            if fixup.page != pointer.id {
                return true;
            }
            match fixup.field {
                PointerField::LeftSibling => work.left = fixup.target,
                PointerField::RightSibling => work.right = fixup.target,
                PointerField::Successor => return true,
            }
            work.pointers_dirty = true;
            false
        });
        self.nodes.insert(pointer.id, work);
        Ok(())
    }

    fn work(&self, id: PageId) -> Result<&WorkNode, GBPTreeError> {
        self.nodes
            .get(&id)
            .ok_or_else(|| GBPTreeError::corrupt(id, "node missing from the working set"))
    }

    fn work_mut(&mut self, id: PageId) -> Result<&mut WorkNode, GBPTreeError> {
        self.nodes
            .get_mut(&id)
            .ok_or_else(|| GBPTreeError::corrupt(id, "node missing from the working set"))
    }

    fn leaf(&self, id: PageId) -> Result<&LeafNode, GBPTreeError> {
        self.work(id)?
            .node
            .as_leaf()
            .ok_or_else(|| GBPTreeError::corrupt(id, "expected a leaf"))
    }

    fn internal(&self, id: PageId) -> Result<&InternalNode, GBPTreeError> {
        self.work(id)?
            .node
            .as_internal()
            .ok_or_else(|| GBPTreeError::corrupt(id, "expected an internal node"))
    }

    /// Mutable leaf content; marks the node as changed.
    fn leaf_mut(&mut self, id: PageId) -> Result<&mut LeafNode, GBPTreeError> {
        let work = self.work_mut(id)?;
        work.content_dirty = true;
        work.node
            .as_leaf_mut()
            .ok_or_else(|| GBPTreeError::corrupt(id, "expected a leaf"))
    }

    /// Mutable internal content; marks the node as changed.
    fn internal_mut(&mut self, id: PageId) -> Result<&mut InternalNode, GBPTreeError> {
        let work = self.work_mut(id)?;
        work.content_dirty = true;
        work.node
            .as_internal_mut()
            .ok_or_else(|| GBPTreeError::corrupt(id, "expected an internal node"))
    }

    /// Add a node on a freshly acquired page.
    fn allocate(
        &mut self,
        body: NodeBody,
        level: usize,
        left: Option<PageId>,
        right: Option<PageId>,
    ) -> PageId {
        let id = self.free_list.acquire(self.generation);
        self.nodes.insert(
            id,
            WorkNode {
                node: Node {
                    header: NodeHeader::fresh(self.generation.unstable, None, None),
                    body,
                },
                level,
                left,
                right,
                loaded_left: None,
                loaded_right: None,
                new: true,
                content_dirty: true,
                pointers_dirty: false,
                freed: false,
            },
        );
        id
    }

    fn free(&mut self, id: PageId) -> Result<(), GBPTreeError> {
        self.work_mut(id)?.freed = true;
        self.free_list.release(id, self.generation);
        self.fixups.retain(|fixup| fixup.page != id);
        Ok(())
    }

    /// Point a sibling link of leaf `page` at `target`.
    fn set_sibling(&mut self, page: PageId, field: PointerField, target: Option<PageId>) {
        if let Some(work) = self.nodes.get_mut(&page) {
            match field {
                PointerField::LeftSibling => work.left = target,
                PointerField::RightSibling => work.right = target,
                PointerField::Successor => return,
            }
            work.pointers_dirty = true;
            return;
        }
        self.fixups
            .retain(|fixup| !(fixup.page == page && fixup.field == field));
        self.fixups.push(Fixup {
            page,
            field,
            target,
        });
    }

    // Insert

    fn split_leaf(&mut self, path: &[PageId]) -> Result<(), GBPTreeError> {
        let leaf_id = last(path)?;
        let upper = self.leaf_mut(leaf_id)?.split_off_upper();
        let separator = upper
            .entries
            .first()
            .map(|entry| entry.key.clone())
            .ok_or_else(|| GBPTreeError::corrupt(leaf_id, "split produced an empty leaf"))?;

        let old_right = self.work(leaf_id)?.right;
        let right_id = self.allocate(NodeBody::Leaf(upper), 0, Some(leaf_id), old_right);
        self.set_sibling(leaf_id, PointerField::RightSibling, Some(right_id));
        if let Some(neighbor) = old_right {
            self.set_sibling(neighbor, PointerField::LeftSibling, Some(right_id));
        }
        self.insert_into_parent(path, path.len() - 1, separator, right_id)
    }

    /// Insert `key` and the new node `right_child` into the parent of
    /// `path[index]`, directly after it.
    fn insert_into_parent(
        &mut self,
        path: &[PageId],
        index: usize,
        key: Vec<u8>,
        right_child: PageId,
    ) -> Result<(), GBPTreeError> {
        let left_child = path[index];
        if index == 0 {
            return self.create_new_root(left_child, key, right_child);
        }

        let parent_id = path[index - 1];
        let unstable = self.generation.unstable;
        let parent = self.internal_mut(parent_id)?;
        let position = parent
            .position_of(left_child)
            .ok_or_else(|| GBPTreeError::corrupt(parent_id, "child missing from its parent"))?;
        parent.keys.insert(position, key);
        parent
            .children
            .insert(position + 1, ChildPointer::new(right_child, unstable));

        if parent.used_space() > self.data_space {
            self.split_internal(path, index - 1)?;
        }
        Ok(())
    }

    fn create_new_root(
        &mut self,
        left_child: PageId,
        key: Vec<u8>,
        right_child: PageId,
    ) -> Result<(), GBPTreeError> {
        let left = self.work(left_child)?;
        let level = left.level + 1;
        let body = NodeBody::Internal(InternalNode {
            keys: vec![key],
            children: vec![
                ChildPointer::new(left_child, left.node.generation()),
                ChildPointer::new(right_child, self.generation.unstable),
            ],
        });
        self.root = self.allocate(body, level, None, None);
        self.root_changed = true;
        Ok(())
    }

    fn split_internal(&mut self, path: &[PageId], index: usize) -> Result<(), GBPTreeError> {
        let id = path[index];
        let level = self.work(id)?.level;
        let node = self.internal_mut(id)?;
        if node.keys.len() < 3 {
            return Err(GBPTreeError::corrupt(id, "overflowing internal node has too few keys"));
        }
        let (median, upper) = node.split_around_median();
        let right_id = self.allocate(NodeBody::Internal(upper), level, None, None);
        self.insert_into_parent(path, index, median, right_id)
    }

    // Remove

    /// Merge or redistribute a leaf that dropped below half full.
    fn rebalance_leaf(&mut self, path: &[PageId]) -> Result<(), GBPTreeError> {
        if path.len() < 2 {
            return Ok(());
        }
        let leaf_id = last(path)?;
        if self.leaf(leaf_id)?.used_space() >= self.data_space / 2 {
            return Ok(());
        }
        let parent_index = path.len() - 2;
        let Some((left_id, right_id, separator_index)) =
            self.pick_sibling(path[parent_index], leaf_id, 0)?
        else {
            return Ok(());
        };

        let combined = self.leaf(left_id)?.used_space() + self.leaf(right_id)?.used_space();
        if combined <= self.data_space {
            let entries = std::mem::take(&mut self.leaf_mut(right_id)?.entries);
            let right_of_right = self.work(right_id)?.right;
            self.leaf_mut(left_id)?.entries.extend(entries);
            self.set_sibling(left_id, PointerField::RightSibling, right_of_right);
            if let Some(neighbor) = right_of_right {
                self.set_sibling(neighbor, PointerField::LeftSibling, Some(left_id));
            }
            self.free(right_id)?;

            let parent = self.internal_mut(path[parent_index])?;
            parent.keys.remove(separator_index);
            parent.children.remove(separator_index + 1);
            return self.rebalance_internal(path, parent_index);
        }

        let mut entries = std::mem::take(&mut self.leaf_mut(left_id)?.entries);
        entries.append(&mut self.leaf_mut(right_id)?.entries);
        let sizes: Vec<usize> = entries.iter().map(LeafEntry::size).collect();
        let at = node::byte_split_point(&sizes, 1, sizes.len() - 1);
        let upper = entries.split_off(at);
        let separator = upper
            .first()
            .map(|entry| entry.key.clone())
            .ok_or_else(|| GBPTreeError::corrupt(right_id, "redistribution emptied a leaf"))?;
        self.leaf_mut(left_id)?.entries = entries;
        self.leaf_mut(right_id)?.entries = upper;

        let parent = self.internal_mut(path[parent_index])?;
        parent.keys[separator_index] = separator;
        if parent.used_space() > self.data_space {
            self.split_internal(path, parent_index)?;
        }
        Ok(())
    }

    /// Handle an internal node left without keys.
    fn rebalance_internal(&mut self, path: &[PageId], index: usize) -> Result<(), GBPTreeError> {
        let id = path[index];
        let (key_count, first_child) = {
            let node = self.internal(id)?;
            (node.keys.len(), node.children.first().copied())
        };
        if key_count > 0 {
            return Ok(());
        }
        if index == 0 {
            let child = first_child
                .ok_or_else(|| GBPTreeError::corrupt(id, "internal node without children"))?;
            let level = self.work(id)?.level;
            self.load(child, Some(level - 1))?;
            self.free(id)?;
            self.root = child.id;
            self.root_changed = true;
            return Ok(());
        }

        let level = self.work(id)?.level;
        let Some((left_id, right_id, separator_index)) =
            self.pick_sibling(path[index - 1], id, level)?
        else {
            return Ok(());
        };
        let sibling_id = if left_id == id { right_id } else { left_id };
        let parent_id = path[index - 1];

        if self.internal(sibling_id)?.keys.len() >= 2 {
            let separator = self.internal(parent_id)?.keys[separator_index].clone();
            let raised = if sibling_id == left_id {
                let left = self.internal_mut(left_id)?;
                let (Some(child), Some(key)) = (left.children.pop(), left.keys.pop()) else {
                    return Err(GBPTreeError::corrupt(left_id, "sibling lost its keys"));
                };
                let node = self.internal_mut(id)?;
                node.keys.insert(0, separator);
                node.children.insert(0, child);
                key
            } else {
                let right = self.internal_mut(right_id)?;
                let child = right.children.remove(0);
                let key = right.keys.remove(0);
                let node = self.internal_mut(id)?;
                node.keys.push(separator);
                node.children.push(child);
                key
            };
            let parent = self.internal_mut(parent_id)?;
            parent.keys[separator_index] = raised;
            if parent.used_space() > self.data_space {
                self.split_internal(path, index - 1)?;
            }
            return Ok(());
        }

        let parent = self.internal_mut(parent_id)?;
        let separator = parent.keys.remove(separator_index);
        parent.children.remove(separator_index + 1);
        let right = self.internal_mut(right_id)?;
        let keys = std::mem::take(&mut right.keys);
        let children = std::mem::take(&mut right.children);
        let left = self.internal_mut(left_id)?;
        left.keys.push(separator);
        left.keys.extend(keys);
        left.children.extend(children);
        self.free(right_id)?;
        self.rebalance_internal(path, index - 1)
    }

    /// Load a sibling of `id` under `parent_id` and return the pair as
    /// `(left, right, separator index)`. Prefers the left sibling.
    fn pick_sibling(
        &mut self,
        parent_id: PageId,
        id: PageId,
        level: usize,
    ) -> Result<Option<(PageId, PageId, usize)>, GBPTreeError> {
        let parent = self.internal(parent_id)?;
        let position = parent
            .position_of(id)
            .ok_or_else(|| GBPTreeError::corrupt(parent_id, "child missing from its parent"))?;
        let (sibling, pair) = if position > 0 {
            let sibling = parent.children[position - 1];
            (sibling, (sibling.id, id, position - 1))
        } else if let Some(sibling) = parent.children.get(1).copied() {
            (sibling, (id, sibling.id, 0))
        } else {
            return Ok(None);
        };
        self.load(sibling, Some(level))?;
        self.work_mut(sibling.id)?.level = level;
        Ok(Some(pair))
    }

    // Commit

    /// Publish the working set.
    pub(crate) fn commit(mut self) -> Result<(), GBPTreeError> {
        let core = self.core;
        let generation = self.generation;
        let remap = self.copy_on_write()?;
        self.relink_moved_leaves(&remap);
        let resolve = |id: PageId| remap.get(&id).copied().unwrap_or(id);

        let mut writes: Vec<(bool, usize, PageId)> = self
            .nodes
            .iter()
            .filter(|(_, w)| !w.freed && (w.content_dirty || w.pointers_dirty))
            .map(|(id, w)| (!(w.new || remap.contains_key(id)), w.level, *id))
            .collect();
        // Pages at fresh ids first, then in-place pages bottom-up.
        writes.sort_unstable();

        let _guard = core.latch.write();
        for (written, (in_place, _, id)) in writes.into_iter().enumerate() {
            if written > 0 {
                failpoint::maybe_fail(failpoint::COMMIT_BETWEEN_PAGE_WRITES)?;
            }
            let work = self.work(id)?;
            let left = work.left.map(resolve);
            let right = work.right.map(resolve);
            let header = if in_place {
                let mut header = work.node.header;
                if left != work.loaded_left {
                    header
                        .left_sibling
                        .write(left.unwrap_or(0), generation);
                }
                if right != work.loaded_right {
                    header
                        .right_sibling
                        .write(right.unwrap_or(0), generation);
                }
                header
            } else if work.node.is_leaf() {
                NodeHeader::fresh(generation.unstable, left, right)
            } else {
                NodeHeader::fresh(generation.unstable, None, None)
            };
            let node = Node {
                header,
                body: work.node.body.clone(),
            };
            let mut cursor = core.paged_file.pin(resolve(id), PinMode::Overwrite)?;
            node.write_to(cursor.page_mut());
            cursor.commit()?;
        }

        let mut moved: Vec<(PageId, PageId)> = remap.iter().map(|(k, v)| (*k, *v)).collect();
        moved.sort_unstable();
        for (old, new) in moved {
            self.write_pointer(old, PointerField::Successor, Some(new))?;
        }
        for fixup in std::mem::take(&mut self.fixups) {
            self.write_pointer(fixup.page, fixup.field, fixup.target.map(resolve))?;
        }

        let root_id = resolve(self.root);
        let root_work = self.work(self.root)?;
        let root_generation = if root_work.new || remap.contains_key(&self.root) {
            generation.unstable
        } else {
            root_work.node.generation()
        };
        let new_root = ChildPointer::new(root_id, root_generation);
        if new_root != self.root_pointer {
            let mut root = core
                .root
                .write()
                .map_err(|_| GBPTreeError::LockPoisoned)?;
            root.root = new_root;
        }
        Ok(())
    }

    /// Give every changed node written in a stable generation a new page,
    /// bottom-up, pointing parents at the copies. Returns old id -> new id.
    fn copy_on_write(&mut self) -> Result<HashMap<PageId, PageId>, GBPTreeError> {
        let mut remap = HashMap::new();
        let max_level = self.nodes.values().map(|w| w.level).max().unwrap_or(0);
        for level in 0..=max_level {
            let mut ids: Vec<PageId> = self
                .nodes
                .iter()
                .filter(|(_, w)| w.level == level && w.content_dirty && !w.freed)
                .map(|(id, _)| *id)
                .collect();
            ids.sort_unstable();
            for id in ids {
                let work = self.work(id)?;
                if work.new || work.node.generation() >= self.generation.unstable {
                    continue;
                }
                let new_id = self.free_list.acquire(self.generation);
                self.free_list.release(id, self.generation);
                remap.insert(id, new_id);
                if id == self.root {
                    continue;
                }
                let parent_id = self.find_parent(id)?;
                let unstable = self.generation.unstable;
                let parent = self.internal_mut(parent_id)?;
                if let Some(position) = parent.position_of(id) {
                    parent.children[position] = ChildPointer::new(new_id, unstable);
                }
            }
        }
        Ok(remap)
    }

    /// Leaves that moved to a new page must be linked from their neighbors.
    fn relink_moved_leaves(&mut self, remap: &HashMap<PageId, PageId>) {
        let mut moved: Vec<(PageId, Option<PageId>, Option<PageId>)> = self
            .nodes
            .iter()
            .filter(|(id, w)| w.level == 0 && !w.freed && remap.contains_key(id))
            .map(|(id, w)| (*id, w.left, w.right))
            .collect();
        moved.sort_unstable();
        for (id, left, right) in moved {
            if let Some(left) = left {
                self.set_sibling(left, PointerField::RightSibling, Some(id));
            }
            if let Some(right) = right {
                self.set_sibling(right, PointerField::LeftSibling, Some(id));
            }
        }
    }

    fn find_parent(&self, id: PageId) -> Result<PageId, GBPTreeError> {
        self.nodes
            .iter()
            .filter(|(_, w)| !w.freed)
            .find(|(_, w)| {
                w.node
                    .as_internal()
                    .is_some_and(|internal| internal.position_of(id).is_some())
            })
            .map(|(parent, _)| *parent)
            .ok_or_else(|| GBPTreeError::corrupt(id, "parent missing from the working set"))
    }

    /// Rewrite one generation-safe pointer of a page in place.
    fn write_pointer(
        &self,
        page_id: PageId,
        field: PointerField,
        target: Option<PageId>,
    ) -> Result<(), GBPTreeError> {
        let mut cursor = self.core.paged_file.pin(page_id, PinMode::Write)?;
        if !node::is_node_page(cursor.page()) {
            return Err(GBPTreeError::corrupt(page_id, "pointer fixup on a non-node page"));
        }
        node::write_pointer(cursor.page_mut(), field, target.unwrap_or(0), self.generation);
        cursor.commit()?;
        Ok(())
    }
}

fn last(path: &[PageId]) -> Result<PageId, GBPTreeError> {
    path.last()
        .copied()
        .ok_or_else(|| GBPTreeError::corrupt(0, "empty path"))
}
