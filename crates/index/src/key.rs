use std::cmp::Ordering;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};

use storage::PageId;

/// Fixed-size little-endian codec for keys and values stored in block
/// page slots.
///
/// Every instantiation of the hash table is monomorphised over one
/// (key, value) pairing; the encoded sizes decide how many slots fit in
/// a block page.
pub trait SlotData: Copy + PartialEq {
    /// Number of bytes the encoded form occupies in a slot.
    const ENCODED_SIZE: usize;

    /// Encodes into `buf`, which is exactly `ENCODED_SIZE` bytes.
    fn encode_into(&self, buf: &mut [u8]);

    /// Decodes from `buf`, which is exactly `ENCODED_SIZE` bytes.
    fn decode_from(buf: &[u8]) -> Self;
}

impl SlotData for i32 {
    const ENCODED_SIZE: usize = 4;

    fn encode_into(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(buf);
        i32::from_le_bytes(bytes)
    }
}

impl SlotData for u32 {
    const ENCODED_SIZE: usize = 4;

    fn encode_into(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut bytes = [0u8; 4];
        bytes.copy_from_slice(buf);
        u32::from_le_bytes(bytes)
    }
}

impl SlotData for i64 {
    const ENCODED_SIZE: usize = 8;

    fn encode_into(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(buf);
        i64::from_le_bytes(bytes)
    }
}

impl SlotData for u64 {
    const ENCODED_SIZE: usize = 8;

    fn encode_into(&self, buf: &mut [u8]) {
        buf.copy_from_slice(&self.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(buf);
        u64::from_le_bytes(bytes)
    }
}

/// Record locator: the page a row lives on and its slot within the page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Rid {
    pub page_id: PageId,
    pub slot_id: u32,
}

impl SlotData for Rid {
    const ENCODED_SIZE: usize = 8;

    fn encode_into(&self, buf: &mut [u8]) {
        buf[0..4].copy_from_slice(&self.page_id.to_le_bytes());
        buf[4..8].copy_from_slice(&self.slot_id.to_le_bytes());
    }

    fn decode_from(buf: &[u8]) -> Self {
        let mut page_id = [0u8; 4];
        page_id.copy_from_slice(&buf[0..4]);
        let mut slot_id = [0u8; 4];
        slot_id.copy_from_slice(&buf[4..8]);
        Self {
            page_id: u32::from_le_bytes(page_id),
            slot_id: u32::from_le_bytes(slot_id),
        }
    }
}

/// Decides key equality and ordering for the hash table.
pub trait KeyComparator<K> {
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering;
}

/// Comparator for keys with a total order of their own.
#[derive(Debug, Clone, Copy, Default)]
pub struct OrdComparator;

impl<K: Ord> KeyComparator<K> for OrdComparator {
    fn compare(&self, lhs: &K, rhs: &K) -> Ordering {
        lhs.cmp(rhs)
    }
}

/// Maps a key to the 64-bit fingerprint that picks its home slot.
pub trait KeyHasher<K> {
    fn hash_key(&self, key: &K) -> u64;
}

/// Hasher backed by `DefaultHasher::new()`.
///
/// The zero-keyed SipHash state is stable across processes, which slot
/// positions persisted through the buffer pool require.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultKeyHasher;

impl<K: Hash> KeyHasher<K> for DefaultKeyHasher {
    fn hash_key(&self, key: &K) -> u64 {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        hasher.finish()
    }
}
