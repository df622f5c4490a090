//! On-disk page store.
//!
//! Page 0 belongs to the store itself: a magic tag, the extent high-water
//! mark, and the stack of freed page ids available for reuse. The header
//! is rewritten and synced whenever allocation state changes, so a
//! reopened file resumes exactly where the previous process stopped.

use std::fs::{File, OpenOptions};
use std::io::{Error, ErrorKind, Result};
use std::os::unix::fs::FileExt;
use std::path::Path;

pub type PageId = u32;
pub const PAGE_SIZE: usize = 4096;

/// Reserved identifier that never names a data page; page 0 is the
/// store's own header.
pub const INVALID_PAGE_ID: PageId = 0;

const MAGIC: &[u8; 8] = b"PGSTORE1";
const HIGH_WATER_OFFSET: usize = 8;
const FREE_LEN_OFFSET: usize = 12;
const FREE_STACK_OFFSET: usize = 16;

/// Freed ids the header page can hold; an id freed beyond this is
/// dropped and simply never reused.
const FREE_STACK_CAPACITY: usize = (PAGE_SIZE - FREE_STACK_OFFSET) / 4;

fn u32_at(buf: &[u8], offset: usize) -> u32 {
    let mut word = [0u8; 4];
    word.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(word)
}

/// Allocation bookkeeping persisted on page 0.
struct Allocator {
    /// One past the highest page id ever handed out.
    high_water: PageId,
    /// Freed ids, reused last-in first-out.
    free_stack: Vec<PageId>,
}

impl Allocator {
    fn fresh() -> Self {
        Self {
            high_water: 1,
            free_stack: Vec::new(),
        }
    }

    fn decode(buf: &[u8]) -> Result<Self> {
        if &buf[..MAGIC.len()] != MAGIC {
            return Err(Error::new(ErrorKind::InvalidData, "not a page store file"));
        }
        let high_water = u32_at(buf, HIGH_WATER_OFFSET);
        let free_len = u32_at(buf, FREE_LEN_OFFSET) as usize;
        if high_water == 0 || free_len > FREE_STACK_CAPACITY {
            return Err(Error::new(ErrorKind::InvalidData, "page store header corrupt"));
        }
        let free_stack = (0..free_len)
            .map(|slot| u32_at(buf, FREE_STACK_OFFSET + slot * 4))
            .collect();
        Ok(Self {
            high_water,
            free_stack,
        })
    }

    fn encode(&self) -> [u8; PAGE_SIZE] {
        let mut buf = [0u8; PAGE_SIZE];
        buf[..MAGIC.len()].copy_from_slice(MAGIC);
        buf[HIGH_WATER_OFFSET..HIGH_WATER_OFFSET + 4]
            .copy_from_slice(&self.high_water.to_le_bytes());
        buf[FREE_LEN_OFFSET..FREE_LEN_OFFSET + 4]
            .copy_from_slice(&(self.free_stack.len() as u32).to_le_bytes());
        for (slot, page_id) in self.free_stack.iter().enumerate() {
            let offset = FREE_STACK_OFFSET + slot * 4;
            buf[offset..offset + 4].copy_from_slice(&page_id.to_le_bytes());
        }
        buf
    }

    /// True when `page_id` names a currently-allocated data page.
    fn owns(&self, page_id: PageId) -> bool {
        page_id != INVALID_PAGE_ID
            && page_id < self.high_water
            && !self.free_stack.contains(&page_id)
    }
}

pub struct DiskManager {
    file: File,
    allocator: Allocator,
}

impl DiskManager {
    /// Opens or creates the backing file and loads its allocation header.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)?;
        let allocator = if file.metadata()?.len() < PAGE_SIZE as u64 {
            let allocator = Allocator::fresh();
            file.write_at(&allocator.encode(), 0)?;
            allocator
        } else {
            let mut buf = [0u8; PAGE_SIZE];
            file.read_at(&mut buf, 0)?;
            Allocator::decode(&buf)?
        };
        Ok(Self { file, allocator })
    }

    fn byte_offset(page_id: PageId) -> u64 {
        page_id as u64 * PAGE_SIZE as u64
    }

    fn check_page_buffer(buf: &[u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(Error::new(
                ErrorKind::InvalidInput,
                "buffer must be exactly one page",
            ));
        }
        Ok(())
    }

    fn persist_allocator(&mut self) -> Result<()> {
        self.file.write_at(&self.allocator.encode(), 0)?;
        self.file.sync_data()
    }

    /// Reads the page into `buf`.
    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> Result<()> {
        Self::check_page_buffer(buf)?;
        self.file.read_at(buf, Self::byte_offset(page_id))?;
        Ok(())
    }

    /// Writes `buf` over the page.
    pub fn write_page(&mut self, page_id: PageId, buf: &[u8]) -> Result<()> {
        Self::check_page_buffer(buf)?;
        self.file.write_at(buf, Self::byte_offset(page_id))?;
        Ok(())
    }

    /// Forces buffered data to disk.
    pub fn sync_data(&self) -> Result<()> {
        self.file.sync_data()
    }

    /// Hands out a page id, preferring freed ids over file growth.
    ///
    /// The page bytes are zeroed and the header is persisted and synced
    /// before the id is returned, so an allocation a crash interrupts is
    /// either fully on disk or never happened.
    pub fn allocate_page(&mut self) -> Result<PageId> {
        let (page_id, reused) = match self.allocator.free_stack.last() {
            Some(&freed) => (freed, true),
            None => (self.allocator.high_water, false),
        };
        self.file
            .write_at(&[0u8; PAGE_SIZE], Self::byte_offset(page_id))?;
        if reused {
            self.allocator.free_stack.pop();
        } else {
            self.allocator.high_water += 1;
        }
        self.persist_allocator()?;
        Ok(page_id)
    }

    /// Returns a page to the store for reuse by a later allocation.
    pub fn deallocate_page(&mut self, page_id: PageId) -> Result<()> {
        if !self.allocator.owns(page_id) {
            return Err(Error::new(ErrorKind::InvalidInput, "page is not allocated"));
        }
        if self.allocator.free_stack.len() == FREE_STACK_CAPACITY {
            return Ok(());
        }
        self.allocator.free_stack.push(page_id);
        self.persist_allocator()
    }

    /// One past the highest page id ever handed out.
    pub fn high_water_mark(&self) -> PageId {
        self.allocator.high_water
    }

    /// Number of freed pages waiting for reuse.
    pub fn free_page_count(&self) -> usize {
        self.allocator.free_stack.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::path::PathBuf;

    // Deletes the backing file when a test ends, pass or fail.
    struct TestContext {
        path: PathBuf,
    }

    impl TestContext {
        fn new(test_name: &str) -> Self {
            let path = std::env::temp_dir().join(format!("ballast_disk_{}.db", test_name));
            if path.exists() {
                let _ = fs::remove_file(&path);
            }
            Self { path }
        }

        fn open(&self) -> DiskManager {
            DiskManager::open(&self.path).expect("open page store")
        }
    }

    impl Drop for TestContext {
        fn drop(&mut self) {
            let _ = fs::remove_file(&self.path);
        }
    }

    fn patterned(byte: u8) -> [u8; PAGE_SIZE] {
        [byte; PAGE_SIZE]
    }

    #[test]
    fn test_fresh_file_starts_empty() {
        let ctx = TestContext::new("fresh_file");
        let dm = ctx.open();
        assert_eq!(dm.high_water_mark(), 1);
        assert_eq!(dm.free_page_count(), 0);

        // The header page is already on disk.
        let len = fs::metadata(&ctx.path).unwrap().len();
        assert_eq!(len, PAGE_SIZE as u64);
    }

    #[test]
    fn test_allocation_state_survives_reopen() {
        let ctx = TestContext::new("reopen");
        {
            let mut dm = ctx.open();
            let kept = dm.allocate_page().unwrap();
            let freed = dm.allocate_page().unwrap();
            dm.write_page(kept, &patterned(0x5A)).unwrap();
            dm.deallocate_page(freed).unwrap();
        } // process "exit"

        let mut dm = ctx.open();
        assert_eq!(dm.high_water_mark(), 3);
        assert_eq!(dm.free_page_count(), 1);

        let mut buf = [0u8; PAGE_SIZE];
        dm.read_page(1, &mut buf).unwrap();
        assert_eq!(buf, patterned(0x5A));

        // The freed id comes back before the file grows.
        assert_eq!(dm.allocate_page().unwrap(), 2);
        assert_eq!(dm.high_water_mark(), 3);
    }

    #[test]
    fn test_reused_pages_come_back_zeroed() {
        let ctx = TestContext::new("reuse_zeroed");
        let mut dm = ctx.open();

        let page_id = dm.allocate_page().unwrap();
        dm.write_page(page_id, &patterned(0xFF)).unwrap();
        dm.deallocate_page(page_id).unwrap();

        let reused = dm.allocate_page().unwrap();
        assert_eq!(reused, page_id);

        let mut buf = [0u8; PAGE_SIZE];
        dm.read_page(reused, &mut buf).unwrap();
        assert_eq!(buf, [0u8; PAGE_SIZE]);
    }

    #[test]
    fn test_free_stack_reuses_newest_first() {
        let ctx = TestContext::new("lifo_reuse");
        let mut dm = ctx.open();

        let first = dm.allocate_page().unwrap();
        let second = dm.allocate_page().unwrap();
        let third = dm.allocate_page().unwrap();

        dm.deallocate_page(first).unwrap();
        dm.deallocate_page(third).unwrap();
        assert_eq!(dm.free_page_count(), 2);

        assert_eq!(dm.allocate_page().unwrap(), third);
        assert_eq!(dm.allocate_page().unwrap(), first);
        // Stack drained; the next allocation extends the file.
        assert_eq!(dm.allocate_page().unwrap(), second + 2);
    }

    #[test]
    fn test_deallocate_rejects_foreign_ids() {
        let ctx = TestContext::new("foreign_ids");
        let mut dm = ctx.open();
        let page_id = dm.allocate_page().unwrap();

        // The header page, never-allocated ids and double frees all fail.
        assert!(dm.deallocate_page(INVALID_PAGE_ID).is_err());
        assert!(dm.deallocate_page(page_id + 50).is_err());
        dm.deallocate_page(page_id).unwrap();
        assert!(dm.deallocate_page(page_id).is_err());
    }

    #[test]
    fn test_mismatched_buffers_are_rejected() {
        let ctx = TestContext::new("buffer_sizes");
        let mut dm = ctx.open();
        let page_id = dm.allocate_page().unwrap();

        let short = [0u8; 16];
        assert!(dm.write_page(page_id, &short).is_err());

        let mut long = [0u8; PAGE_SIZE + 1];
        assert!(dm.read_page(page_id, &mut long).is_err());
    }

    #[test]
    fn test_neighboring_pages_do_not_bleed() {
        let ctx = TestContext::new("isolation");
        let mut dm = ctx.open();

        let pages: Vec<PageId> = (0..4).map(|_| dm.allocate_page().unwrap()).collect();
        for (index, &page_id) in pages.iter().enumerate() {
            dm.write_page(page_id, &patterned(index as u8 + 1)).unwrap();
        }

        let mut buf = [0u8; PAGE_SIZE];
        for (index, &page_id) in pages.iter().enumerate() {
            dm.read_page(page_id, &mut buf).unwrap();
            assert_eq!(buf, patterned(index as u8 + 1), "page {} bled", page_id);
        }
    }

    #[test]
    fn test_rejects_files_with_wrong_magic() {
        let ctx = TestContext::new("wrong_magic");
        {
            let mut file = fs::File::create(&ctx.path).unwrap();
            file.write_all(&[0xABu8; PAGE_SIZE]).unwrap();
        }
        assert!(DiskManager::open(&ctx.path).is_err());
    }
}
