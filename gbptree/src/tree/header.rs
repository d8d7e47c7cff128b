//! Header access without opening a tree.

use crate::page_cache::{PagedFile, PinMode};
use crate::tree::error::GBPTreeError;
use crate::tree::meta::Meta;
use crate::tree::state::{
    META_PAGE_ID, StateError, StateSlot, TreeStatePair, TreeStateRecord,
};

/// What a checkpoint does with the user header data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeaderUpdate<'a> {
    /// Keep the header data of the last checkpoint.
    CarryOver,
    /// Store new header data.
    Replace(&'a [u8]),
}

/// Called with the header data of the selected state when a tree is opened.
pub type HeaderReader = Box<dyn FnOnce(&[u8]) + Send>;

/// Receives the pieces of a tree file header as they are read.
pub trait HeaderVisitor {
    fn meta(&mut self, _meta: &Meta) {}

    fn tree_state(&mut self, _slot: StateSlot, _state: &Result<TreeStateRecord, StateError>) {}

    /// Header data of the selected state.
    fn header_data(&mut self, _data: &[u8]) {}
}

/// Read meta and both tree states, select the newest state and report each
/// step to `visitor`. Nothing is written.
///
/// Returns the meta record and the selected state.
pub fn visit_header(
    paged_file: &PagedFile,
    visitor: &mut dyn HeaderVisitor,
) -> Result<(Meta, TreeStateRecord), GBPTreeError> {
    let meta = {
        let cursor = paged_file.pin(META_PAGE_ID, PinMode::Read)?;
        Meta::from_page(cursor.page())?
    };
    visitor.meta(&meta);

    let pair = TreeStatePair::read(paged_file);
    visitor.tree_state(StateSlot::A, &pair.a);
    visitor.tree_state(StateSlot::B, &pair.b);

    let selected = pair.select_newest()?.clone();
    visitor.header_data(&selected.header);
    Ok((meta, selected))
}

/// A visitor that records everything it is shown.
#[derive(Debug, Default)]
pub struct CollectingVisitor {
    pub meta: Option<Meta>,
    pub states: Vec<(StateSlot, Result<TreeStateRecord, StateError>)>,
    pub header_data: Option<Vec<u8>>,
}

impl HeaderVisitor for CollectingVisitor {
    fn meta(&mut self, meta: &Meta) {
        self.meta = Some(*meta);
    }

    fn tree_state(&mut self, slot: StateSlot, state: &Result<TreeStateRecord, StateError>) {
        self.states.push((slot, state.clone()));
    }

    fn header_data(&mut self, data: &[u8]) {
        self.header_data = Some(data.to_vec());
    }
}
