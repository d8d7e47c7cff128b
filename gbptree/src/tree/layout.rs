//! Key/value layouts.
//!
//! A [`Layout`] defines how keys and values are encoded into node bytes and
//! how encoded keys are ordered. The tree itself only ever handles encoded
//! bytes; the layout identifier and versions are recorded in the meta page
//! so a file cannot be opened with an incompatible layout.

use std::cmp::Ordering;
use std::fmt::Debug;
use std::sync::Arc;

/// Key/value codec and ordering for a tree.
pub trait Layout: Send + Sync + 'static {
    type Key: Clone + Debug + Send + 'static;
    type Value: Clone + Debug + Send + 'static;

    /// Identifier recorded in the meta page.
    fn identifier(&self) -> u64;

    fn major_version(&self) -> u32;

    fn minor_version(&self) -> u32;

    /// Encoded key size if every key has the same size.
    fn key_size(&self) -> Option<usize> {
        None
    }

    /// Encoded value size if every value has the same size.
    fn value_size(&self) -> Option<usize> {
        None
    }

    fn write_key(&self, key: &Self::Key, out: &mut Vec<u8>);

    fn read_key(&self, bytes: &[u8]) -> Result<Self::Key, LayoutError>;

    fn write_value(&self, value: &Self::Value, out: &mut Vec<u8>);

    fn read_value(&self, bytes: &[u8]) -> Result<Self::Value, LayoutError>;

    /// Order two encoded keys.
    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        left.cmp(right)
    }
}

impl<L: Layout + ?Sized> Layout for Arc<L> {
    type Key = L::Key;
    type Value = L::Value;

    fn identifier(&self) -> u64 {
        (**self).identifier()
    }

    fn major_version(&self) -> u32 {
        (**self).major_version()
    }

    fn minor_version(&self) -> u32 {
        (**self).minor_version()
    }

    fn key_size(&self) -> Option<usize> {
        (**self).key_size()
    }

    fn value_size(&self) -> Option<usize> {
        (**self).value_size()
    }

    fn write_key(&self, key: &Self::Key, out: &mut Vec<u8>) {
        (**self).write_key(key, out);
    }

    fn read_key(&self, bytes: &[u8]) -> Result<Self::Key, LayoutError> {
        (**self).read_key(bytes)
    }

    fn write_value(&self, value: &Self::Value, out: &mut Vec<u8>) {
        (**self).write_value(value, out);
    }

    fn read_value(&self, bytes: &[u8]) -> Result<Self::Value, LayoutError> {
        (**self).read_value(bytes)
    }

    fn compare(&self, left: &[u8], right: &[u8]) -> Ordering {
        (**self).compare(left, right)
    }
}

/// A layout whose key and value types are raw bytes, usable when the
/// concrete layout of a file is only known at runtime.
pub type DynLayout = Arc<dyn Layout<Key = Vec<u8>, Value = Vec<u8>>>;

/// Build a layout identifier from a short ASCII name and a salt.
///
/// The first four bytes of `name` fill the upper 32 bits; `salt` fills the
/// lower 32 bits.
#[must_use]
pub const fn named_identifier(name: &str, salt: u32) -> u64 {
    let bytes = name.as_bytes();
    let mut upper: u64 = 0;
    let mut i = 0;
    while i < 4 {
        let b = if i < bytes.len() { bytes[i] } else { b' ' };
        upper = (upper << 8) | b as u64;
        i += 1;
    }
    (upper << 32) | salt as u64
}

/// Errors decoding keys or values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LayoutError {
    /// Encoded bytes have the wrong length for a fixed-size type.
    InvalidLength { expected: usize, actual: usize },
}

impl std::fmt::Display for LayoutError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InvalidLength { expected, actual } => {
                write!(f, "expected {expected} encoded bytes, found {actual}")
            }
        }
    }
}

impl std::error::Error for LayoutError {}

fn read_u64_be(bytes: &[u8]) -> Result<u64, LayoutError> {
    let array: [u8; 8] = bytes.try_into().map_err(|_| LayoutError::InvalidLength {
        expected: 8,
        actual: bytes.len(),
    })?;
    Ok(u64::from_be_bytes(array))
}

/// `u64` keys and values, encoded big-endian so that byte order is numeric
/// order.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SimpleLongLayout;

impl SimpleLongLayout {
    pub const IDENTIFIER: u64 = named_identifier("SLNG", 0x0008_0008);
    pub const MAJOR_VERSION: u32 = 0;
    pub const MINOR_VERSION: u32 = 1;
}

impl Layout for SimpleLongLayout {
    type Key = u64;
    type Value = u64;

    fn identifier(&self) -> u64 {
        Self::IDENTIFIER
    }

    fn major_version(&self) -> u32 {
        Self::MAJOR_VERSION
    }

    fn minor_version(&self) -> u32 {
        Self::MINOR_VERSION
    }

    fn key_size(&self) -> Option<usize> {
        Some(8)
    }

    fn value_size(&self) -> Option<usize> {
        Some(8)
    }

    fn write_key(&self, key: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&key.to_be_bytes());
    }

    fn read_key(&self, bytes: &[u8]) -> Result<u64, LayoutError> {
        read_u64_be(bytes)
    }

    fn write_value(&self, value: &u64, out: &mut Vec<u8>) {
        out.extend_from_slice(&value.to_be_bytes());
    }

    fn read_value(&self, bytes: &[u8]) -> Result<u64, LayoutError> {
        read_u64_be(bytes)
    }
}

/// Raw byte keys and values ordered lexicographically.
///
/// The identifier and versions are configurable so a `ByteLayout` can stand
/// in for any layout whose encoded keys sort bytewise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteLayout {
    identifier: u64,
    major_version: u32,
    minor_version: u32,
    key_size: Option<usize>,
    value_size: Option<usize>,
}

impl ByteLayout {
    pub const IDENTIFIER: u64 = named_identifier("RAWB", 0);

    /// Variable-size byte keys and values under the default identifier.
    #[must_use]
    pub const fn raw() -> Self {
        Self {
            identifier: Self::IDENTIFIER,
            major_version: 0,
            minor_version: 1,
            key_size: None,
            value_size: None,
        }
    }

    /// A byte layout presenting itself under another layout's identity.
    #[must_use]
    pub const fn with_identity(
        identifier: u64,
        major_version: u32,
        minor_version: u32,
        key_size: Option<usize>,
        value_size: Option<usize>,
    ) -> Self {
        Self {
            identifier,
            major_version,
            minor_version,
            key_size,
            value_size,
        }
    }

    fn check_size(expected: Option<usize>, bytes: &[u8]) -> Result<(), LayoutError> {
        match expected {
            Some(expected) if expected != bytes.len() => Err(LayoutError::InvalidLength {
                expected,
                actual: bytes.len(),
            }),
            _ => Ok(()),
        }
    }
}

impl Default for ByteLayout {
    fn default() -> Self {
        Self::raw()
    }
}

impl Layout for ByteLayout {
    type Key = Vec<u8>;
    type Value = Vec<u8>;

    fn identifier(&self) -> u64 {
        self.identifier
    }

    fn major_version(&self) -> u32 {
        self.major_version
    }

    fn minor_version(&self) -> u32 {
        self.minor_version
    }

    fn key_size(&self) -> Option<usize> {
        self.key_size
    }

    fn value_size(&self) -> Option<usize> {
        self.value_size
    }

    fn write_key(&self, key: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(key);
    }

    fn read_key(&self, bytes: &[u8]) -> Result<Vec<u8>, LayoutError> {
        Self::check_size(self.key_size, bytes)?;
        Ok(bytes.to_vec())
    }

    fn write_value(&self, value: &Vec<u8>, out: &mut Vec<u8>) {
        out.extend_from_slice(value);
    }

    fn read_value(&self, bytes: &[u8]) -> Result<Vec<u8>, LayoutError> {
        Self::check_size(self.value_size, bytes)?;
        Ok(bytes.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encode_key<L: Layout>(layout: &L, key: &L::Key) -> Vec<u8> {
        let mut out = Vec::new();
        layout.write_key(key, &mut out);
        out
    }

    #[test]
    fn test_simple_long_byte_order_matches_numeric_order() {
        let layout = SimpleLongLayout;
        let pairs = [(0u64, 1u64), (255, 256), (1 << 40, u64::MAX), (7, 7)];
        for (a, b) in pairs {
            let ea = encode_key(&layout, &a);
            let eb = encode_key(&layout, &b);
            assert_eq!(layout.compare(&ea, &eb), a.cmp(&b));
        }
        assert_eq!(layout.read_key(&encode_key(&layout, &42)), Ok(42));
    }

    #[test]
    fn test_simple_long_rejects_wrong_length() {
        assert_eq!(
            SimpleLongLayout.read_value(&[1, 2, 3]),
            Err(LayoutError::InvalidLength {
                expected: 8,
                actual: 3
            })
        );
    }

    #[test]
    fn test_byte_layout_checks_fixed_sizes() {
        let layout = ByteLayout::with_identity(9, 1, 2, Some(2), None);
        assert!(layout.read_key(&[1, 2]).is_ok());
        assert!(layout.read_key(&[1, 2, 3]).is_err());
        assert!(layout.read_value(&[1, 2, 3, 4, 5]).is_ok());
        assert_eq!(layout.identifier(), 9);
    }

    #[test]
    fn test_named_identifiers_differ_by_name_and_salt() {
        assert_ne!(named_identifier("SLNG", 1), named_identifier("SLNG", 2));
        assert_ne!(named_identifier("AAAA", 0), named_identifier("AAAB", 0));
        assert_eq!(named_identifier("AB", 0) >> 56, u64::from(b'A'));
    }

    #[test]
    fn test_dyn_layout_delegates() {
        let layout: DynLayout = Arc::new(ByteLayout::raw());
        assert_eq!(layout.identifier(), ByteLayout::IDENTIFIER);
        assert_eq!(layout.compare(b"a", b"b"), Ordering::Less);
        assert_eq!(layout.read_key(b"xyz"), Ok(b"xyz".to_vec()));
    }
}
