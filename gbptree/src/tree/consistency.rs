//! Structural consistency checking.

use std::cmp::Ordering;
use std::collections::HashSet;

use crate::page_cache::PageId;
use crate::tree::error::GBPTreeError;
use crate::tree::gbptree::TreeCore;
use crate::tree::layout::Layout;
use crate::tree::node::{ChildPointer, NodeBody};
use crate::tree::pointer::Generation;
use crate::tree::seek::MAX_TREE_DEPTH;
use crate::tree::state::BASE_PAGE_ID;

/// What a consistency check found.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsistencyReport {
    /// Pages reachable from the root.
    pub tree_pages: u64,
    pub leaves: u64,
    pub entries: u64,
    /// Number of levels, 1 for a tree that is a single leaf.
    pub depth: usize,
    pub free_pages: u64,
    pub violations: Vec<String>,
}

impl ConsistencyReport {
    #[must_use]
    pub fn is_consistent(&self) -> bool {
        self.violations.is_empty()
    }
}

#[derive(Debug)]
struct LeafLinks {
    id: PageId,
    left: Option<PageId>,
    right: Option<PageId>,
}

struct Checker<'a, L: Layout> {
    core: &'a TreeCore<L>,
    generation: Generation,
    last_id: PageId,
    visited: HashSet<PageId>,
    leaves: Vec<LeafLinks>,
    leaf_depth: Option<usize>,
    report: ConsistencyReport,
}

impl<L: Layout> Checker<'_, L> {
    fn violation(&mut self, message: String) {
        tracing::debug!(violation = %message, "consistency violation");
        self.report.violations.push(message);
    }

    /// Whether `key` lies in `[lower, upper)`.
    fn in_bounds(&self, key: &[u8], lower: Option<&[u8]>, upper: Option<&[u8]>) -> bool {
        let layout = &self.core.layout;
        lower.is_none_or(|lower| layout.compare(key, lower) != Ordering::Less)
            && upper.is_none_or(|upper| layout.compare(key, upper) == Ordering::Less)
    }

    fn check_keys<'k>(
        &mut self,
        id: PageId,
        keys: impl Iterator<Item = &'k [u8]>,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
    ) {
        let mut previous: Option<&[u8]> = None;
        let mut problems = Vec::new();
        for key in keys {
            if let Some(previous) = previous
                && self.core.layout.compare(previous, key) != Ordering::Less
            {
                problems.push(format!("page {id}: keys out of order"));
            }
            if !self.in_bounds(key, lower, upper) {
                problems.push(format!("page {id}: key outside the range of its parent"));
            }
            previous = Some(key);
        }
        problems.dedup();
        for problem in problems {
            self.violation(problem);
        }
    }

    fn visit(
        &mut self,
        pointer: ChildPointer,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        depth: usize,
    ) -> Result<(), GBPTreeError> {
        let id = pointer.id;
        if depth >= MAX_TREE_DEPTH {
            self.violation(format!("page {id}: tree deeper than {MAX_TREE_DEPTH} levels"));
            return Ok(());
        }
        if id < BASE_PAGE_ID || id > self.last_id {
            self.violation(format!(
                "page {id}: child pointer outside [{BASE_PAGE_ID}, {}]",
                self.last_id
            ));
            return Ok(());
        }
        if !self.visited.insert(id) {
            self.violation(format!("page {id}: reachable more than once"));
            return Ok(());
        }
        let node = match self.core.read_node(id) {
            Ok(node) => node,
            Err(e) if e.is_inconsistency() => {
                self.violation(format!("page {id}: {e}"));
                return Ok(());
            }
            Err(e) => return Err(e),
        };
        self.report.tree_pages += 1;

        if node.generation() > pointer.generation {
            self.violation(format!(
                "page {id}: generation {} newer than its pointer ({})",
                node.generation(),
                pointer.generation
            ));
        }
        if !self.generation.is_valid(node.generation()) {
            self.violation(format!(
                "page {id}: generation {} is not visible",
                node.generation()
            ));
        }
        if let Some(successor) = node.header.successor.read(self.generation) {
            self.violation(format!("page {id}: reachable but has successor {successor}"));
        }

        match &node.body {
            NodeBody::Leaf(leaf) => {
                self.check_keys(id, leaf.entries.iter().map(|e| e.key.as_slice()), lower, upper);
                match self.leaf_depth {
                    None => self.leaf_depth = Some(depth),
                    Some(expected) if expected != depth => {
                        self.violation(format!(
                            "page {id}: leaf at depth {depth}, expected {expected}"
                        ));
                    }
                    Some(_) => {}
                }
                self.report.leaves += 1;
                self.report.entries += leaf.entries.len() as u64;
                self.leaves.push(LeafLinks {
                    id,
                    left: node.header.left_sibling.read(self.generation),
                    right: node.header.right_sibling.read(self.generation),
                });
            }
            NodeBody::Internal(internal) => {
                self.check_keys(id, internal.keys.iter().map(Vec::as_slice), lower, upper);
                if internal.keys.is_empty() {
                    self.violation(format!("page {id}: internal node without keys"));
                }
                if internal.children.len() != internal.keys.len() + 1 {
                    self.violation(format!(
                        "page {id}: {} keys but {} children",
                        internal.keys.len(),
                        internal.children.len()
                    ));
                    return Ok(());
                }
                for (i, child) in internal.children.iter().enumerate() {
                    let child_lower = if i == 0 {
                        lower
                    } else {
                        Some(internal.keys[i - 1].as_slice())
                    };
                    let child_upper = internal.keys.get(i).map_or(upper, |k| Some(k.as_slice()));
                    self.visit(*child, child_lower, child_upper, depth + 1)?;
                }
            }
        }
        Ok(())
    }

    fn check_sibling_chain(&mut self) {
        let mut problems = Vec::new();
        if let Some(first) = self.leaves.first()
            && let Some(left) = first.left
        {
            problems.push(format!("page {}: leftmost leaf has left sibling {left}", first.id));
        }
        if let Some(last) = self.leaves.last()
            && let Some(right) = last.right
        {
            problems.push(format!("page {}: rightmost leaf has right sibling {right}", last.id));
        }
        for pair in self.leaves.windows(2) {
            let (left, right) = (&pair[0], &pair[1]);
            if left.right != Some(right.id) {
                problems.push(format!(
                    "page {}: right sibling {:?}, expected {}",
                    left.id, left.right, right.id
                ));
            }
            if right.left != Some(left.id) {
                problems.push(format!(
                    "page {}: left sibling {:?}, expected {}",
                    right.id, right.left, left.id
                ));
            }
        }
        for problem in problems {
            self.violation(problem);
        }
    }
}

impl<L: Layout> TreeCore<L> {
    /// Walk every reachable page and the free list. Holds the writer lock
    /// for the duration.
    pub(crate) fn check_consistency(&self) -> Result<ConsistencyReport, GBPTreeError> {
        let writer = self.lock_writer()?;
        let snapshot = self.snapshot()?;
        let mut checker = Checker {
            core: self,
            generation: snapshot.generation,
            last_id: writer.free_list.last_id(),
            visited: HashSet::new(),
            leaves: Vec::new(),
            leaf_depth: None,
            report: ConsistencyReport::default(),
        };
        checker.visit(snapshot.root, None, None, 0)?;
        checker.check_sibling_chain();
        checker.report.depth = checker.leaf_depth.map_or(0, |depth| depth + 1);

        let mut free = HashSet::new();
        let chain = writer.free_list.chain_pages().iter().copied();
        for id in writer.free_list.iter().map(|entry| entry.id).chain(chain) {
            if !free.insert(id) {
                checker.violation(format!("page {id}: free more than once"));
            }
            if checker.visited.contains(&id) {
                checker.violation(format!("page {id}: both free and reachable"));
            }
            if id < BASE_PAGE_ID || id > checker.last_id {
                checker.violation(format!("page {id}: free page outside the file"));
            }
        }
        drop(writer);
        checker.report.free_pages = free.len() as u64;

        let report = checker.report;
        if report.is_consistent() {
            tracing::debug!(
                tree_pages = report.tree_pages,
                entries = report.entries,
                depth = report.depth,
                "tree is consistent"
            );
        } else {
            tracing::warn!(violations = report.violations.len(), "tree is inconsistent");
        }
        Ok(report)
    }
}
