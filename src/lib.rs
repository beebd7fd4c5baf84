//! A first-fit boundary-tag allocator over a simulated heap

#![no_std]
#![deny(
    missing_docs,
    trivial_casts,
    trivial_numeric_casts,
    unstable_features,
    unused_import_braces,
    unused_qualifications
)]

extern crate alloc;

/// The main allocator
mod block;
/// The simulated heap backing it
mod heap;

pub use block::BlockAllocator;
pub use heap::{AllocError, SimHeap};
