use thiserror::Error;

/// Failure kinds raised by the block-store layer.
///
/// Logic-error conditions (freeing an already-freed run, a corrupt
/// header chain) are not represented here — they trap via
/// `panic!` at the call site instead of returning a `Result`, because
/// continuing past them would corrupt layout state shared by every other
/// allocation in the store.
#[derive(Debug, Error)]
pub enum BlockStoreError {
    #[error("failed to create or map backing file for block store: {0}")]
    MappingFailed(String),
    #[error("no run large enough to satisfy a {requested}-byte request, even after coalescing")]
    OutOfSpace { requested: usize },
}
