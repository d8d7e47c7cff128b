//! Tree mutations carried in log command entries.
//!
//! ```text
//! Insert   0x01, key length u32, key, value length u32, value
//! Remove   0x02, key length u32, key
//! ```

use crate::tree::{GBPTree, GBPTreeError, Layout};

const INSERT: u8 = 0x01;
const REMOVE: u8 = 0x02;

/// One mutation of a tree, in encoded key/value form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TreeCommand {
    Insert { key: Vec<u8>, value: Vec<u8> },
    Remove { key: Vec<u8> },
}

/// Errors decoding a command payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    Empty,
    UnknownOpcode(u8),
    Truncated { needed: usize, available: usize },
    TrailingBytes(usize),
}

impl std::fmt::Display for CommandError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Empty => write!(f, "empty command"),
            Self::UnknownOpcode(op) => write!(f, "unknown command opcode 0x{op:02x}"),
            Self::Truncated { needed, available } => {
                write!(f, "command needs {needed} more bytes, {available} left")
            }
            Self::TrailingBytes(n) => write!(f, "{n} trailing bytes after command"),
        }
    }
}

impl std::error::Error for CommandError {}

struct Decoder<'a> {
    bytes: &'a [u8],
}

impl<'a> Decoder<'a> {
    fn take(&mut self, len: usize) -> Result<&'a [u8], CommandError> {
        if self.bytes.len() < len {
            return Err(CommandError::Truncated {
                needed: len,
                available: self.bytes.len(),
            });
        }
        let (head, tail) = self.bytes.split_at(len);
        self.bytes = tail;
        Ok(head)
    }

    fn field(&mut self) -> Result<Vec<u8>, CommandError> {
        let mut len = [0u8; 4];
        len.copy_from_slice(self.take(4)?);
        let len = u32::from_be_bytes(len) as usize;
        Ok(self.take(len)?.to_vec())
    }
}

#[allow(clippy::cast_possible_truncation)] // keys and values are bounded by the page size
fn put_field(out: &mut Vec<u8>, field: &[u8]) {
    out.extend_from_slice(&(field.len() as u32).to_be_bytes());
    out.extend_from_slice(field);
}

impl TreeCommand {
    /// An insert of `key` and `value` encoded with `layout`.
    pub fn insert<L: Layout>(layout: &L, key: &L::Key, value: &L::Value) -> Self {
        let mut k = Vec::new();
        let mut v = Vec::new();
        layout.write_key(key, &mut k);
        layout.write_value(value, &mut v);
        Self::Insert { key: k, value: v }
    }

    /// A removal of `key` encoded with `layout`.
    pub fn remove<L: Layout>(layout: &L, key: &L::Key) -> Self {
        let mut k = Vec::new();
        layout.write_key(key, &mut k);
        Self::Remove { key: k }
    }

    #[must_use]
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::new();
        match self {
            Self::Insert { key, value } => {
                out.push(INSERT);
                put_field(&mut out, key);
                put_field(&mut out, value);
            }
            Self::Remove { key } => {
                out.push(REMOVE);
                put_field(&mut out, key);
            }
        }
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        let (&op, rest) = bytes.split_first().ok_or(CommandError::Empty)?;
        let mut decoder = Decoder { bytes: rest };
        let command = match op {
            INSERT => Self::Insert {
                key: decoder.field()?,
                value: decoder.field()?,
            },
            REMOVE => Self::Remove {
                key: decoder.field()?,
            },
            other => return Err(CommandError::UnknownOpcode(other)),
        };
        if !decoder.bytes.is_empty() {
            return Err(CommandError::TrailingBytes(decoder.bytes.len()));
        }
        Ok(command)
    }

    /// Apply to `tree`. Inserting over an existing key replaces it and
    /// removing a missing key does nothing, so applying twice is harmless.
    pub fn apply<L: Layout>(&self, tree: &GBPTree<L>) -> Result<(), GBPTreeError> {
        match self {
            Self::Insert { key, value } => tree.insert_raw(key, value).map(drop),
            Self::Remove { key } => tree.remove_raw(key).map(drop),
        }
    }
}
