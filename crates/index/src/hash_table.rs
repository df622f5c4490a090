use std::cmp::Ordering;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use thiserror::Error;
use tracing::debug;

use storage::{BufferPoolError, BufferPoolManager, PageGuard, PageId};
use txn::Transaction;

use crate::block_page::{BlockPage, BlockPageMut, block_array_size};
use crate::header_page::{HeaderPage, HeaderPageMut, MAX_BLOCK_PAGE_IDS};
use crate::key::{KeyComparator, KeyHasher, SlotData};

/// Errors returned by index structures.
#[derive(Debug, Error)]
pub enum IndexError {
    /// The buffer pool failed underneath the index.
    #[error("buffer pool error: {0}")]
    Buffer(#[from] BufferPoolError),
    /// Every buffer pool frame is pinned; the index cannot make progress.
    #[error("buffer pool exhausted: every frame is pinned")]
    PoolExhausted,
    /// The header page cannot track the block pages this table needs.
    #[error("hash table header cannot track more block pages")]
    HeaderFull,
}

/// Convenience alias for index results.
pub type IndexResult<T> = Result<T, IndexError>;

/// Disk-backed open-addressing hash index with linear probing.
///
/// The header page records the logical size and the block pages holding
/// the slots; every page access goes through the buffer pool, pinned only
/// for the duration of the touch. Equal keys with distinct values coexist
/// (multi-map); an exact (key, value) duplicate is suppressed.
///
/// Latching: a table-level readers-writer latch taken shared by every
/// operation and exclusively by resize, plus one readers-writer latch per
/// block, handed off as a probe crosses block boundaries.
pub struct LinearProbeHashTable<K, V, C, H> {
    name: String,
    header_page_id: PageId,
    buffer_pool: BufferPoolManager,
    comparator: C,
    hasher: H,
    table_latch: RwLock<()>,
    block_latches: Mutex<Vec<Arc<RwLock<()>>>>,
    _marker: PhantomData<(K, V)>,
}

/// Header fields copied out under the header pin.
struct HeaderSnapshot {
    size: usize,
    block_page_ids: Vec<PageId>,
}

enum ProbeInsert {
    Inserted,
    Duplicate,
    /// Full revolution without a free slot; carries the size that was full.
    TableFull {
        size: usize,
    },
}

impl<K, V, C, H> LinearProbeHashTable<K, V, C, H>
where
    K: SlotData,
    V: SlotData,
    C: KeyComparator<K>,
    H: KeyHasher<K>,
{
    /// Creates the block pages and the header page for a fresh table.
    pub fn new(
        name: impl Into<String>,
        buffer_pool: BufferPoolManager,
        comparator: C,
        num_buckets: usize,
        hasher: H,
    ) -> IndexResult<Self> {
        assert!(num_buckets > 0, "hash table needs at least one bucket");
        let name = name.into();
        let slots_per_block = block_array_size::<K, V>();
        let num_blocks = num_buckets.div_ceil(slots_per_block);
        if num_blocks > MAX_BLOCK_PAGE_IDS {
            return Err(IndexError::HeaderFull);
        }

        let mut block_page_ids = Vec::with_capacity(num_blocks);
        for _ in 0..num_blocks {
            let (page_id, guard) = buffer_pool.new_page()?.ok_or(IndexError::PoolExhausted)?;
            drop(guard);
            buffer_pool.unpin_page(page_id, false)?;
            block_page_ids.push(page_id);
        }

        let (header_page_id, mut guard) =
            buffer_pool.new_page()?.ok_or(IndexError::PoolExhausted)?;
        {
            let mut header = HeaderPageMut::new(guard.bytes_mut());
            header.set_page_id(header_page_id);
            header.set_size(num_buckets);
            for &block_page_id in &block_page_ids {
                let added = header.add_block_page_id(block_page_id);
                debug_assert!(added);
            }
        }
        drop(guard);
        buffer_pool.unpin_page(header_page_id, true)?;

        debug!(name = %name, num_buckets, num_blocks, "created linear probe hash table");

        let block_latches = block_page_ids
            .iter()
            .map(|_| Arc::new(RwLock::new(())))
            .collect();
        Ok(Self {
            name,
            header_page_id,
            buffer_pool,
            comparator,
            hasher,
            table_latch: RwLock::new(()),
            block_latches: Mutex::new(block_latches),
            _marker: PhantomData,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current logical size: the maximum number of addressable slots.
    pub fn get_size(&self) -> IndexResult<usize> {
        let _table = self.table_latch.read();
        Ok(self.read_header()?.size)
    }

    /// Collects every value stored under `key`, in probe order.
    ///
    /// The scan walks the probe sequence from the key's home slot and ends
    /// at the first empty slot or after a full revolution; tombstones are
    /// walked through. Returns true iff at least one value was found.
    pub fn get_value(
        &self,
        _txn: &Transaction,
        key: &K,
        result: &mut Vec<V>,
    ) -> IndexResult<bool> {
        let _table = self.table_latch.read();
        let header = self.read_header()?;
        let slots_per_block = block_array_size::<K, V>();
        let num_blocks = header.block_page_ids.len();

        let start = self.home_slot(&header, key);
        let mut block_index = start / slots_per_block;
        let mut offset = start % slots_per_block;
        let mut remaining = slots_per_block * num_blocks;
        let mut done = false;

        while remaining > 0 && !done {
            let segment = (slots_per_block - offset).min(remaining);
            let latch = self.block_latch(block_index);
            let _block_latch = latch.read();
            let page_id = header.block_page_ids[block_index];
            let guard = self.fetch_block(page_id)?;
            let block = BlockPage::<K, V>::new(guard.bytes());
            for slot in offset..offset + segment {
                if !block.is_occupied(slot) {
                    done = true;
                    break;
                }
                if block.is_readable(slot)
                    && self.comparator.compare(&block.key_at(slot), key) == Ordering::Equal
                {
                    result.push(block.value_at(slot));
                }
            }
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;
            remaining -= segment;
            block_index = (block_index + 1) % num_blocks;
            offset = 0;
        }
        Ok(!result.is_empty())
    }

    /// Inserts (key, value), growing the table if the probe sequence finds
    /// no free slot. Returns false iff the exact pair is already present.
    pub fn insert(&self, _txn: &Transaction, key: &K, value: &V) -> IndexResult<bool> {
        loop {
            let full_size = {
                let _table = self.table_latch.read();
                match self.probe_insert(key, value)? {
                    ProbeInsert::Inserted => return Ok(true),
                    ProbeInsert::Duplicate => return Ok(false),
                    ProbeInsert::TableFull { size } => size,
                }
            };
            // Full revolution without a free slot: grow, then retry.
            let _table = self.table_latch.write();
            self.resize(full_size)?;
        }
    }

    /// Removes the exact (key, value) pair, leaving a tombstone.
    pub fn remove(&self, _txn: &Transaction, key: &K, value: &V) -> IndexResult<bool> {
        let _table = self.table_latch.read();
        let header = self.read_header()?;
        let slots_per_block = block_array_size::<K, V>();
        let num_blocks = header.block_page_ids.len();

        let start = self.home_slot(&header, key);
        let mut block_index = start / slots_per_block;
        let mut offset = start % slots_per_block;
        let mut remaining = slots_per_block * num_blocks;

        while remaining > 0 {
            let segment = (slots_per_block - offset).min(remaining);
            let latch = self.block_latch(block_index);
            let _block_latch = latch.write();
            let page_id = header.block_page_ids[block_index];
            let mut guard = self.fetch_block(page_id)?;
            let mut block = BlockPageMut::<K, V>::new(guard.bytes_mut());
            let mut removed = false;
            let mut done = false;
            for slot in offset..offset + segment {
                if !block.is_occupied(slot) {
                    done = true;
                    break;
                }
                if block.is_readable(slot)
                    && self.comparator.compare(&block.key_at(slot), key) == Ordering::Equal
                    && block.value_at(slot) == *value
                {
                    block.remove(slot);
                    removed = true;
                    done = true;
                    break;
                }
            }
            drop(guard);
            self.buffer_pool.unpin_page(page_id, removed)?;
            if done {
                return Ok(removed);
            }
            remaining -= segment;
            block_index = (block_index + 1) % num_blocks;
            offset = 0;
        }
        Ok(false)
    }

    fn home_slot(&self, header: &HeaderSnapshot, key: &K) -> usize {
        (self.hasher.hash_key(key) % header.size as u64) as usize
    }

    fn block_latch(&self, block_index: usize) -> Arc<RwLock<()>> {
        self.block_latches.lock()[block_index].clone()
    }

    fn fetch_block(&self, page_id: PageId) -> IndexResult<PageGuard<'_>> {
        self.buffer_pool
            .fetch_page(page_id)?
            .ok_or(IndexError::PoolExhausted)
    }

    /// Copies the header fields out under a transient header pin.
    fn read_header(&self) -> IndexResult<HeaderSnapshot> {
        let guard = self
            .buffer_pool
            .fetch_page(self.header_page_id)?
            .ok_or(IndexError::PoolExhausted)?;
        let header = HeaderPage::new(guard.bytes());
        let size = header.size();
        let block_page_ids = (0..header.num_blocks())
            .map(|index| header.block_page_id(index))
            .collect();
        drop(guard);
        self.buffer_pool.unpin_page(self.header_page_id, false)?;
        Ok(HeaderSnapshot {
            size,
            block_page_ids,
        })
    }

    /// One pass of the insert probe. The caller holds the table latch.
    fn probe_insert(&self, key: &K, value: &V) -> IndexResult<ProbeInsert> {
        let header = self.read_header()?;
        let slots_per_block = block_array_size::<K, V>();
        let num_blocks = header.block_page_ids.len();

        let start = self.home_slot(&header, key);
        let mut block_index = start / slots_per_block;
        let mut offset = start % slots_per_block;
        let mut remaining = slots_per_block * num_blocks;

        while remaining > 0 {
            let segment = (slots_per_block - offset).min(remaining);
            let latch = self.block_latch(block_index);
            let _block_latch = latch.write();
            let page_id = header.block_page_ids[block_index];
            let mut guard = self.fetch_block(page_id)?;
            let mut block = BlockPageMut::<K, V>::new(guard.bytes_mut());
            let mut outcome = None;
            for slot in offset..offset + segment {
                if block.insert(slot, key, value) {
                    outcome = Some(ProbeInsert::Inserted);
                    break;
                }
                if block.is_readable(slot)
                    && self.comparator.compare(&block.key_at(slot), key) == Ordering::Equal
                    && block.value_at(slot) == *value
                {
                    outcome = Some(ProbeInsert::Duplicate);
                    break;
                }
            }
            let inserted = matches!(outcome, Some(ProbeInsert::Inserted));
            drop(guard);
            self.buffer_pool.unpin_page(page_id, inserted)?;
            if let Some(outcome) = outcome {
                return Ok(outcome);
            }
            remaining -= segment;
            block_index = (block_index + 1) % num_blocks;
            offset = 0;
        }
        Ok(ProbeInsert::TableFull { size: header.size })
    }

    /// Re-homes a rehashed entry. The caller holds the table write latch.
    fn reinsert(&self, key: &K, value: &V) -> IndexResult<()> {
        loop {
            match self.probe_insert(key, value)? {
                ProbeInsert::Inserted | ProbeInsert::Duplicate => return Ok(()),
                ProbeInsert::TableFull { size } => self.resize(size)?,
            }
        }
    }

    /// Doubles the table from `initial_size` and rehashes.
    ///
    /// The caller holds the table write latch, so no other operation runs
    /// and block latches are not needed. A live entry moves iff its new
    /// home lands in one of the freshly appended blocks; moving tombstones
    /// it in place and re-inserts it through the regular probe path.
    fn resize(&self, initial_size: usize) -> IndexResult<()> {
        let header = self.read_header()?;
        if header.size != initial_size {
            // Another thread grew the table between our probe and latch.
            return Ok(());
        }
        let slots_per_block = block_array_size::<K, V>();
        let new_size = initial_size * 2;
        let old_block_num = header.block_page_ids.len();
        let new_block_num = new_size.div_ceil(slots_per_block);
        if new_block_num > MAX_BLOCK_PAGE_IDS {
            return Err(IndexError::HeaderFull);
        }

        let mut added_block_page_ids = Vec::with_capacity(new_block_num - old_block_num);
        for _ in old_block_num..new_block_num {
            let (page_id, guard) = self
                .buffer_pool
                .new_page()?
                .ok_or(IndexError::PoolExhausted)?;
            drop(guard);
            self.buffer_pool.unpin_page(page_id, false)?;
            added_block_page_ids.push(page_id);
        }

        {
            let mut guard = self
                .buffer_pool
                .fetch_page(self.header_page_id)?
                .ok_or(IndexError::PoolExhausted)?;
            let mut header_view = HeaderPageMut::new(guard.bytes_mut());
            header_view.set_size(new_size);
            for &page_id in &added_block_page_ids {
                let added = header_view.add_block_page_id(page_id);
                debug_assert!(added);
            }
            drop(guard);
            self.buffer_pool.unpin_page(self.header_page_id, true)?;
        }

        {
            let mut latches = self.block_latches.lock();
            latches.resize_with(new_block_num, || Arc::new(RwLock::new(())));
        }

        debug!(name = %self.name, new_size, new_block_num, "resized hash table");

        for block_index in 0..old_block_num {
            // Re-read per block: a re-insert below can grow the table
            // again, which changes where an entry's new home lands.
            let grown = self.read_header()?;
            let page_id = grown.block_page_ids[block_index];
            let mut moved: Vec<(K, V)> = Vec::new();
            {
                let mut guard = self.fetch_block(page_id)?;
                let mut block = BlockPageMut::<K, V>::new(guard.bytes_mut());
                for slot in 0..slots_per_block {
                    if !block.is_occupied(slot) || !block.is_readable(slot) {
                        continue;
                    }
                    let key = block.key_at(slot);
                    let home = (self.hasher.hash_key(&key) % grown.size as u64) as usize;
                    if home / slots_per_block >= old_block_num {
                        moved.push((key, block.value_at(slot)));
                        block.remove(slot);
                    }
                }
                drop(guard);
                self.buffer_pool.unpin_page(page_id, !moved.is_empty())?;
            }
            for (key, value) in moved {
                self.reinsert(&key, &value)?;
            }
        }
        Ok(())
    }
}
