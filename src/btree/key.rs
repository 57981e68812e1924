//! Fixed-width keys and their orderings.

use std::cmp::Ordering;
use std::fmt;

/// A key with a fixed-width little endian encoding, stored inline in node pages.
pub trait NodeKey: Copy + fmt::Debug + Send + Sync + 'static {
    /// Encoded width in bytes.
    const SIZE: usize;

    /// Encodes into `out`, which is exactly `SIZE` bytes long.
    fn write_to(&self, out: &mut [u8]);

    /// Decodes from `buf`, which is exactly `SIZE` bytes long.
    fn read_from(buf: &[u8]) -> Self;
}

macro_rules! int_key {
    ($($t:ty),*) => {
        $(
            impl NodeKey for $t {
                const SIZE: usize = std::mem::size_of::<$t>();

                #[inline]
                fn write_to(&self, out: &mut [u8]) {
                    out.copy_from_slice(&self.to_le_bytes());
                }

                #[inline]
                fn read_from(buf: &[u8]) -> Self {
                    let mut bytes = [0u8; std::mem::size_of::<$t>()];
                    bytes.copy_from_slice(buf);
                    <$t>::from_le_bytes(bytes)
                }
            }
        )*
    }
}

int_key!(u32, u64, i32, i64);

/// Fixed-length byte strings, compared lexicographically.
impl<const N: usize> NodeKey for [u8; N] {
    const SIZE: usize = N;

    #[inline]
    fn write_to(&self, out: &mut [u8]) {
        out.copy_from_slice(self);
    }

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        let mut bytes = [0u8; N];
        bytes.copy_from_slice(buf);
        bytes
    }
}

/// Pairs of integers, ordered by the first then the second component.
impl NodeKey for (u64, u64) {
    const SIZE: usize = 16;

    #[inline]
    fn write_to(&self, out: &mut [u8]) {
        out[..8].copy_from_slice(&self.0.to_le_bytes());
        out[8..].copy_from_slice(&self.1.to_le_bytes());
    }

    #[inline]
    fn read_from(buf: &[u8]) -> Self {
        (u64::read_from(&buf[..8]), u64::read_from(&buf[8..16]))
    }
}

/// Three-way comparison used to order keys inside the tree.
pub trait Comparator<K>: Send + Sync {
    fn compare(&self, a: &K, b: &K) -> Ordering;
}

/// Orders keys by their `Ord` implementation.
#[derive(Debug, Default, Clone, Copy)]
pub struct NaturalOrder;

impl<K: Ord> Comparator<K> for NaturalOrder {
    #[inline]
    fn compare(&self, a: &K, b: &K) -> Ordering {
        a.cmp(b)
    }
}
