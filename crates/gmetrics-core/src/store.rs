//! The allocation block store: an mmap-backed region sliced into
//! fixed-size blocks, first-fit allocated, lazily coalesced.
//!
//! This is the one module in the crate allowed to use `unsafe`, confined
//! to creating the mapping and converting between block indices and raw
//! payload pointers at the store's public boundary. Header encode/decode
//! and all of the run-search/coalesce/split bookkeeping operate on plain
//! byte slices and are ordinary safe Rust.

use std::fs::OpenOptions;
use std::path::PathBuf;

use memmap2::MmapMut;

use crate::block::{blocks_needed_for_size, next_run_index, Header, BLOCK_SIZE, HEADER_SIZE};
use crate::error::BlockStoreError;
use crate::stacktrace::StackTrace;

/// A single mmap-backed, block-sliced allocation arena.
pub struct BlockStore {
    name: String,
    thread_name: String,
    creation_stack_trace: Option<StackTrace>,
    mmap: Option<MmapMut>,
    size: usize,
    block_count: u32,
    last_block_allocated: Option<u32>,
    total_bytes_allocated: usize,
    number_of_allocations: usize,
    is_dedicated: bool,
    is_thread_default: bool,
}

impl BlockStore {
    /// Creates and maps a new store of `size` bytes backed by
    /// `/var/tmp/user-<uid>-for-pid-<pid>-<name>.map`. The file is
    /// unlinked immediately after mapping, matching the original's
    /// practice of never leaving a named file behind in `/var/tmp`.
    pub fn new(name: &str, size: usize) -> Result<Self, BlockStoreError> {
        let truncated_name = truncate_name(name, 127);
        let pid = std::process::id();
        let uid = unsafe { libc::getuid() };
        let path = PathBuf::from(format!("/var/tmp/user-{uid}-for-pid-{pid}-{truncated_name}.map"));

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)
            .map_err(|e| BlockStoreError::MappingFailed(e.to_string()))?;
        file.set_len(size as u64).map_err(|e| BlockStoreError::MappingFailed(e.to_string()))?;
        let _ = std::fs::remove_file(&path);

        let mut mmap =
            unsafe { MmapMut::map_mut(&file) }.map_err(|e| BlockStoreError::MappingFailed(e.to_string()))?;
        drop(file);

        let block_count = (size / BLOCK_SIZE) as u32;
        if block_count < 2 {
            return Err(BlockStoreError::MappingFailed(
                "store too small to hold even one allocation".to_string(),
            ));
        }
        let header = Header::free_run(block_count, None);
        mmap[0..HEADER_SIZE].copy_from_slice(&header.to_bytes());

        Ok(Self {
            name: truncated_name,
            thread_name: current_thread_name(),
            creation_stack_trace: None,
            mmap: Some(mmap),
            size,
            block_count,
            last_block_allocated: None,
            total_bytes_allocated: 0,
            number_of_allocations: 0,
            is_dedicated: false,
            is_thread_default: false,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn thread_name(&self) -> &str {
        &self.thread_name
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn block_count(&self) -> u32 {
        self.block_count
    }

    pub fn number_of_allocations(&self) -> usize {
        self.number_of_allocations
    }

    pub fn total_bytes_allocated(&self) -> usize {
        self.total_bytes_allocated
    }

    pub fn is_dedicated(&self) -> bool {
        self.is_dedicated
    }

    pub fn set_dedicated(&mut self, dedicated: bool) {
        self.is_dedicated = dedicated;
    }

    pub fn is_thread_default(&self) -> bool {
        self.is_thread_default
    }

    pub fn set_thread_default(&mut self, is_default: bool) {
        self.is_thread_default = is_default;
    }

    pub fn creation_stack_trace(&self) -> Option<&StackTrace> {
        self.creation_stack_trace.as_ref()
    }

    pub fn set_creation_stack_trace(&mut self, trace: StackTrace) {
        self.creation_stack_trace = Some(trace);
    }

    pub fn is_mapped(&self) -> bool {
        self.mmap.is_some()
    }

    /// Base address of the mapped region, used by the registry to test
    /// whether a payload pointer falls inside this store without having
    /// to go through the store itself.
    pub fn base_addr(&self) -> Option<usize> {
        self.mmap.as_ref().map(|mmap| mmap.as_ptr() as usize)
    }

    /// Whether a self-destructing dedicated store is now empty.
    pub fn is_empty(&self) -> bool {
        self.number_of_allocations == 0
    }

    /// Allocates `size` bytes, returning a zeroed payload pointer, or the
    /// reason allocation failed: `OutOfSpace` if no run (even after
    /// coalescing) is large enough, `MappingFailed` if the store is
    /// unmapped.
    pub fn try_allocate(&mut self, size: usize, name: Option<&str>) -> Result<*mut u8, BlockStoreError> {
        if !self.is_mapped() {
            return Err(BlockStoreError::MappingFailed("store is unmapped".to_string()));
        }
        let needed = blocks_needed_for_size(size);
        let index = self.find_and_claim(needed, name).ok_or(BlockStoreError::OutOfSpace { requested: size })?;
        let ptr = unsafe { self.payload_ptr(index) };
        if size > 0 {
            unsafe { std::ptr::write_bytes(ptr, 0, size) };
        }
        Ok(ptr)
    }

    /// Allocates `size` bytes, returning a zeroed payload pointer or
    /// `None` if no run (even after coalescing) is large enough, or the
    /// store is unmapped. See [`BlockStore::try_allocate`] for the
    /// reason behind a `None`.
    pub fn allocate(&mut self, size: usize, name: Option<&str>) -> Option<*mut u8> {
        self.try_allocate(size, name).ok()
    }

    /// Allocates `size` bytes and copies `size` bytes from `src` into it.
    pub fn copy(&mut self, src: *const u8, size: usize, name: Option<&str>) -> Option<*mut u8> {
        let dst = self.allocate(size, name)?;
        if size > 0 {
            unsafe { std::ptr::copy_nonoverlapping(src, dst, size) };
        }
        Some(dst)
    }

    /// Frees the run holding `payload`, coalescing with the preceding
    /// run if it is also free. Traps on a header that fails validation
    /// or is already free — both indicate corrupted store state.
    pub fn deallocate(&mut self, payload: *mut u8) {
        if payload.is_null() || !self.is_mapped() {
            return;
        }
        let index = self.header_index_for_payload(payload);
        if !self.validate_block(index) {
            panic!("gmetrics-core: corrupt allocation header detected on free");
        }
        let mut header = self.read_header(index);
        if header.is_freed() {
            panic!("gmetrics-core: double free detected");
        }
        header.set_freed(true);
        self.write_header(index, &header);
        self.total_bytes_allocated -= header.num_blocks() as usize * BLOCK_SIZE;
        self.number_of_allocations -= 1;

        if self.last_block_allocated == Some(index) {
            self.last_block_allocated = header.previous_block();
        }

        if let Some(previous) = header.previous_block() {
            let previous_header = self.read_header(previous);
            if previous_header.is_freed() {
                self.consolidate(previous, previous_header.num_blocks() + header.num_blocks());
            }
        }
    }

    /// Resizes the run holding `payload` to `size` bytes, shrinking in
    /// place, growing in place via coalescing, or relocating if neither
    /// is possible. `size == 0` frees and returns `None`; a null
    /// `payload` behaves like `allocate`.
    pub fn reallocate(&mut self, payload: *mut u8, size: usize) -> Option<*mut u8> {
        if size == 0 {
            self.deallocate(payload);
            return None;
        }
        if payload.is_null() {
            return self.allocate(size, None);
        }

        let index = self.header_index_for_payload(payload);
        let header = self.read_header(index);
        let needed = blocks_needed_for_size(size);

        if needed == header.num_blocks() {
            return Some(payload);
        }
        if needed < header.num_blocks() {
            self.shrink(index, needed);
            return Some(payload);
        }

        if self.try_grow_in_place(index, needed) {
            return Some(payload);
        }

        let grown = self.read_header(index);
        let old_capacity = (grown.num_blocks() - 1) as usize * BLOCK_SIZE;
        let label = grown.label().to_string();
        let new_payload = self.allocate(size, Some(&label))?;
        let copy_len = old_capacity.min(size);
        if copy_len > 0 {
            unsafe { std::ptr::copy_nonoverlapping(payload, new_payload, copy_len) };
        }
        self.deallocate(payload);
        Some(new_payload)
    }

    /// Whether `payload` falls inside this store's mapped region.
    pub fn has_allocation(&self, payload: *mut u8) -> bool {
        let Some(mmap) = &self.mmap else { return false };
        let base = mmap.as_ptr() as usize;
        let addr = payload as usize;
        addr >= base && addr < base + self.size
    }

    /// Iterates every run (free and allocated) starting just after
    /// `after`, or from the beginning of the store if `after` is `None`,
    /// visiting each run once and stopping once it returns to the start.
    pub fn iter_runs(&self, after: Option<u32>) -> RunIter<'_> {
        let starting_block = match after {
            None => 0,
            Some(index) => {
                let header = self.read_header(index);
                next_run_index(self.block_count, index, header.num_blocks())
            }
        };
        RunIter { store: self, starting_block, previous: None }
    }

    /// Iterates only the currently-allocated runs.
    pub fn iter_allocations(&self) -> impl Iterator<Item = (u32, Header)> + '_ {
        self.iter_runs(None).filter(|(_, header)| !header.is_freed())
    }

    /// Unmaps the store. The backing file was already unlinked at
    /// creation time, so this is the store's only remaining cleanup.
    pub fn free(mut self) {
        self.mmap = None;
    }

    fn read_header(&self, index: u32) -> Header {
        let mmap = self.mmap.as_ref().expect("block store is unmapped");
        let offset = index as usize * BLOCK_SIZE;
        let mut buf = [0u8; HEADER_SIZE];
        buf.copy_from_slice(&mmap[offset..offset + HEADER_SIZE]);
        Header::from_bytes(&buf)
    }

    fn write_header(&mut self, index: u32, header: &Header) {
        let mmap = self.mmap.as_mut().expect("block store is unmapped");
        let offset = index as usize * BLOCK_SIZE;
        mmap[offset..offset + HEADER_SIZE].copy_from_slice(&(*header).to_bytes());
    }

    /// Cross-checks a run's header against its neighbors' back-pointers.
    fn validate_block(&self, index: u32) -> bool {
        let header = self.read_header(index);
        if header.num_blocks() == 0 || header.num_blocks() > self.block_count {
            return false;
        }
        if let Some(previous) = header.previous_block() {
            let previous_header = self.read_header(previous);
            if previous_header.num_blocks() == 0 || previous + previous_header.num_blocks() != index {
                return false;
            }
        }
        let next = index + header.num_blocks();
        if next < self.block_count {
            let next_header = self.read_header(next);
            if next_header.num_blocks() == 0 || next_header.previous_block() != Some(index) {
                return false;
            }
        }
        true
    }

    /// First-fit search starting just after the last allocated run,
    /// coalescing freed neighbors as it goes, claiming and (if the run
    /// overshoots) splitting the first run big enough.
    fn find_and_claim(&mut self, needed: u32, name: Option<&str>) -> Option<u32> {
        if let Some(last) = self.last_block_allocated {
            if !self.validate_block(last) {
                self.last_block_allocated = None;
            }
        }
        let start = match self.last_block_allocated {
            None => 0,
            Some(last) => {
                let header = self.read_header(last);
                next_run_index(self.block_count, last, header.num_blocks())
            }
        };

        let mut current = start;
        let mut steps = 0u32;
        loop {
            if steps > 0 && current == start {
                return None;
            }
            steps += 1;

            let mut header = self.read_header(current);
            if header.is_freed() {
                if header.num_blocks() < needed {
                    self.consolidate(current, needed);
                    header = self.read_header(current);
                }
                if header.num_blocks() >= needed {
                    self.claim(current, name);
                    if header.num_blocks() > needed {
                        self.shrink(current, needed);
                    }
                    return Some(current);
                }
            }
            current = next_run_index(self.block_count, current, header.num_blocks());
        }
    }

    fn claim(&mut self, index: u32, name: Option<&str>) {
        let mut header = self.read_header(index);
        header.set_freed(false);
        header.set_label(name.unwrap_or(""));
        self.write_header(index, &header);
        self.total_bytes_allocated += header.num_blocks() as usize * BLOCK_SIZE;
        self.number_of_allocations += 1;
        if self.last_block_allocated.is_none_or(|last| index > last) {
            self.last_block_allocated = Some(index);
        }
    }

    /// Merges the run at `index` forward with consecutive free runs
    /// until it holds at least `needed` blocks or the store's end is
    /// reached. Never wraps past the end of the block array.
    fn consolidate(&mut self, index: u32, needed: u32) {
        let header = self.read_header(index);
        let mut total = header.num_blocks();
        if total >= needed {
            return;
        }
        loop {
            let lookahead = index + total;
            if lookahead >= self.block_count {
                break;
            }
            let lookahead_header = self.read_header(lookahead);
            if !lookahead_header.is_freed() {
                break;
            }
            total += lookahead_header.num_blocks();
            if total >= needed {
                break;
            }
        }
        if total == header.num_blocks() {
            return;
        }
        let mut header = header;
        header.set_num_blocks(total);
        self.write_header(index, &header);
        let next = index + total;
        if next < self.block_count {
            let mut next_header = self.read_header(next);
            next_header.set_previous_block(Some(index));
            self.write_header(next, &next_header);
        }
    }

    /// Attempts to grow the run at `index` in place to `needed` blocks by
    /// coalescing forward, shrinking back down if it overshot. Returns
    /// whether the run now holds exactly `needed` blocks.
    fn try_grow_in_place(&mut self, index: u32, needed: u32) -> bool {
        let old_blocks = self.read_header(index).num_blocks();
        self.consolidate(index, needed);
        let grown = self.read_header(index);
        self.total_bytes_allocated += (grown.num_blocks() - old_blocks) as usize * BLOCK_SIZE;
        if grown.num_blocks() > needed {
            self.shrink(index, needed);
        }
        self.read_header(index).num_blocks() == needed
    }

    /// Splits the run at `index` down to `needed` blocks, turning the
    /// surplus into a new free run.
    fn shrink(&mut self, index: u32, needed: u32) {
        let mut header = self.read_header(index);
        let surplus = header.num_blocks() - needed;
        header.set_num_blocks(needed);
        self.write_header(index, &header);
        if surplus == 0 {
            return;
        }

        let next = index + needed;
        if self.last_block_allocated == Some(next) {
            panic!("gmetrics-core: logic error — surplus split collided with last_block_allocated");
        }
        let next_header = Header::free_run(surplus, Some(index));
        self.write_header(next, &next_header);
        self.total_bytes_allocated -= surplus as usize * BLOCK_SIZE;

        let after = next + surplus;
        if after < self.block_count {
            let mut after_header = self.read_header(after);
            after_header.set_previous_block(Some(next));
            self.write_header(after, &after_header);
        }
    }

    fn header_index_for_payload(&self, payload: *mut u8) -> u32 {
        let mmap = self.mmap.as_ref().expect("block store is unmapped");
        let base = mmap.as_ptr() as usize;
        let offset = payload as usize - base;
        (offset / BLOCK_SIZE - 1) as u32
    }

    unsafe fn payload_ptr(&mut self, index: u32) -> *mut u8 {
        let mmap = self.mmap.as_mut().expect("block store is unmapped");
        unsafe { mmap.as_mut_ptr().add((index as usize + 1) * BLOCK_SIZE) }
    }
}

/// Walks a store's runs starting after a given run, wrapping once back to
/// the start and stopping there.
pub struct RunIter<'a> {
    store: &'a BlockStore,
    starting_block: u32,
    previous: Option<u32>,
}

impl<'a> Iterator for RunIter<'a> {
    type Item = (u32, Header);

    fn next(&mut self) -> Option<Self::Item> {
        let block = match self.previous {
            None => self.starting_block,
            Some(previous) => {
                let previous_header = self.store.read_header(previous);
                next_run_index(self.store.block_count, previous, previous_header.num_blocks())
            }
        };
        if self.previous.is_some() && block == self.starting_block {
            return None;
        }
        self.previous = Some(block);
        Some((block, self.store.read_header(block)))
    }
}

fn truncate_name(name: &str, max_len: usize) -> String {
    if name.len() <= max_len {
        name.to_string()
    } else {
        name.chars().take(max_len).collect()
    }
}

fn current_thread_name() -> String {
    std::thread::current()
        .name()
        .map(str::to_string)
        .unwrap_or_else(|| format!("thread-{:?}", std::thread::current().id()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_store() -> BlockStore {
        BlockStore::new("test-store", 64 * 64).expect("store should map")
    }

    #[test]
    fn allocate_zeroes_payload_and_tracks_usage() {
        let mut store = small_store();
        let ptr = store.allocate(100, Some("widgets")).expect("allocation should succeed");
        let slice = unsafe { std::slice::from_raw_parts(ptr, 100) };
        assert!(slice.iter().all(|&b| b == 0));
        assert_eq!(store.number_of_allocations(), 1);
        assert!(store.total_bytes_allocated() > 0);
    }

    #[test]
    fn deallocate_then_allocate_reuses_the_freed_run() {
        let mut store = small_store();
        let first = store.allocate(100, None).unwrap();
        store.deallocate(first);
        assert_eq!(store.number_of_allocations(), 0);
        let second = store.allocate(100, None).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn shrink_then_grow_back_preserves_prefix_bytes() {
        let mut store = small_store();
        let ptr = store.allocate(200, None).unwrap();
        unsafe { std::ptr::write_bytes(ptr, 0xAB, 200) };
        let shrunk = store.reallocate(ptr, 50).unwrap();
        assert_eq!(shrunk, ptr);
        let grown = store.reallocate(shrunk, 200).unwrap();
        let slice = unsafe { std::slice::from_raw_parts(grown, 50) };
        assert!(slice.iter().all(|&b| b == 0xAB));
    }

    #[test]
    fn reallocate_to_zero_frees_and_returns_none() {
        let mut store = small_store();
        let ptr = store.allocate(50, None).unwrap();
        assert!(store.reallocate(ptr, 0).is_none());
        assert_eq!(store.number_of_allocations(), 0);
    }

    #[test]
    fn out_of_space_returns_none_without_panicking() {
        let mut store = BlockStore::new("tiny", 4 * 64).expect("store should map");
        assert!(store.allocate(1000, None).is_none());
    }

    #[test]
    fn try_allocate_reports_out_of_space_with_the_requested_size() {
        let mut store = BlockStore::new("tiny", 4 * 64).expect("store should map");
        match store.try_allocate(1000, None) {
            Err(BlockStoreError::OutOfSpace { requested }) => assert_eq!(requested, 1000),
            other => panic!("expected OutOfSpace, got {other:?}"),
        }
    }

    #[test]
    fn has_allocation_is_false_outside_the_mapped_region() {
        let store = small_store();
        let bogus = 0x1 as *mut u8;
        assert!(!store.has_allocation(bogus));
    }

    #[test]
    fn iter_allocations_skips_freed_runs() {
        let mut store = small_store();
        let a = store.allocate(50, Some("a")).unwrap();
        let _b = store.allocate(50, Some("b")).unwrap();
        store.deallocate(a);
        let labels: Vec<_> = store.iter_allocations().map(|(_, h)| h.label().to_string()).collect();
        assert_eq!(labels, vec!["b"]);
    }

    #[test]
    fn randomized_alloc_free_sequence_keeps_layout_consistent() {
        use rand::rngs::StdRng;
        use rand::{Rng, SeedableRng};

        let mut store = BlockStore::new("fuzzed", 256 * 64).expect("store should map");
        let mut live: Vec<(*mut u8, usize)> = Vec::new();
        let mut rng = StdRng::seed_from_u64(42);

        for _ in 0..500 {
            if live.is_empty() || rng.gen_bool(0.6) {
                let size = rng.gen_range(1..=400);
                if let Some(ptr) = store.allocate(size, None) {
                    live.push((ptr, size));
                }
            } else {
                let idx = rng.gen_range(0..live.len());
                let (ptr, _) = live.remove(idx);
                store.deallocate(ptr);
            }
        }

        for (ptr, size) in live {
            store.deallocate(ptr);
            let _ = size;
        }
        assert_eq!(store.number_of_allocations(), 0);
    }
}
