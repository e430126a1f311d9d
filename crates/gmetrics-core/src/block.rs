//! Fixed-size block layout shared by every allocation block store.
//!
//! A store is sliced into `BLOCK_SIZE`-byte blocks. Every run — free or
//! allocated — begins with one block holding a [`Header`]; an allocation's
//! payload occupies the blocks that follow. Headers are (de)serialized to a
//! plain byte array so the store can keep them inside an `mmap`'d region
//! without any unsafe reinterpretation of the map's bytes.

/// Size, in bytes, of one block.
pub const BLOCK_SIZE: usize = 64;

/// Longest label a header can carry, not counting the implicit terminator.
pub const MAX_LABEL_LEN: usize = 31;

/// On-disk/in-map size of a serialized [`Header`]. Always `<= BLOCK_SIZE`.
pub const HEADER_SIZE: usize = 44;

/// Sentinel meaning "no previous block" in a serialized header.
const NONE_BLOCK: u32 = u32::MAX;

/// Per-run bookkeeping: whether the run is free, how many blocks it spans,
/// the index of the run immediately behind it, and (for allocated runs) a
/// short caller-supplied label.
#[derive(Clone, Copy, Debug)]
pub struct Header {
    label: [u8; MAX_LABEL_LEN + 1],
    is_freed: bool,
    num_blocks: u32,
    previous_block: u32,
}

impl Header {
    /// A freshly-initialized free run of `num_blocks` blocks.
    pub fn free_run(num_blocks: u32, previous_block: Option<u32>) -> Self {
        Self {
            label: [0u8; MAX_LABEL_LEN + 1],
            is_freed: true,
            num_blocks,
            previous_block: previous_block.unwrap_or(NONE_BLOCK),
        }
    }

    pub fn is_freed(&self) -> bool {
        self.is_freed
    }

    pub fn set_freed(&mut self, freed: bool) {
        self.is_freed = freed;
    }

    pub fn num_blocks(&self) -> u32 {
        self.num_blocks
    }

    pub fn set_num_blocks(&mut self, num_blocks: u32) {
        self.num_blocks = num_blocks;
    }

    pub fn previous_block(&self) -> Option<u32> {
        (self.previous_block != NONE_BLOCK).then_some(self.previous_block)
    }

    pub fn set_previous_block(&mut self, previous_block: Option<u32>) {
        self.previous_block = previous_block.unwrap_or(NONE_BLOCK);
    }

    pub fn label(&self) -> &str {
        let len = self.label.iter().position(|&b| b == 0).unwrap_or(self.label.len());
        std::str::from_utf8(&self.label[..len]).unwrap_or("")
    }

    /// Truncates to `MAX_LABEL_LEN` bytes; the original never did length
    /// checking at all and relied on callers behaving. We don't.
    pub fn set_label(&mut self, label: &str) {
        self.label = [0u8; MAX_LABEL_LEN + 1];
        let bytes = label.as_bytes();
        let n = bytes.len().min(MAX_LABEL_LEN);
        self.label[..n].copy_from_slice(&bytes[..n]);
    }

    pub fn to_bytes(self) -> [u8; HEADER_SIZE] {
        let mut buf = [0u8; HEADER_SIZE];
        buf[0..32].copy_from_slice(&self.label);
        buf[32] = self.is_freed as u8;
        buf[36..40].copy_from_slice(&self.num_blocks.to_le_bytes());
        buf[40..44].copy_from_slice(&self.previous_block.to_le_bytes());
        buf
    }

    pub fn from_bytes(buf: &[u8; HEADER_SIZE]) -> Self {
        let mut label = [0u8; MAX_LABEL_LEN + 1];
        label.copy_from_slice(&buf[0..32]);
        Self {
            label,
            is_freed: buf[32] != 0,
            num_blocks: u32::from_le_bytes(buf[36..40].try_into().unwrap()),
            previous_block: u32::from_le_bytes(buf[40..44].try_into().unwrap()),
        }
    }
}

/// Number of blocks (header + payload) needed to hold `size` payload bytes.
///
/// A zero-byte request is rounded up to one byte so every allocation still
/// spans at least two blocks, matching the store's run-size invariant.
pub fn blocks_needed_for_size(size: usize) -> u32 {
    let size = size.max(1);
    let payload_bytes = size.div_ceil(BLOCK_SIZE) * BLOCK_SIZE;
    ((BLOCK_SIZE + payload_bytes).div_ceil(BLOCK_SIZE)) as u32
}

/// Wraparound successor of a run starting at `index` spanning `num_blocks`.
pub fn next_run_index(block_count: u32, index: u32, num_blocks: u32) -> u32 {
    (index + num_blocks) % block_count
}
