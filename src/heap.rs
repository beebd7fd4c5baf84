use alloc::vec::Vec;
use log::{debug, error, trace};
use thiserror::Error;

/// Errors surfaced by the allocator and its backing heap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AllocError {
    /// An extension request would push the break past the configured maximum
    /// heap size. Retrying cannot succeed: the heap never shrinks.
    #[error("out of memory: heap break would exceed the configured maximum")]
    OutOfMemory,
    /// The bootstrap sequence could not obtain its initial region. The
    /// allocator instance is unusable; build a new one over a fresh heap.
    #[error("allocator initialization failed")]
    Initialization,
}

/// A simulated process heap: an owned byte buffer with a break offset.
///
/// The heap grows monotonically through [`SimHeap::extend`] up to the maximum
/// size fixed at construction. There is no operation to give memory back.
/// All addresses handed out by the layers above are offsets into this buffer.
pub struct SimHeap {
    buf: Vec<u8>,
    max_size: usize,
}

impl SimHeap {
    /// Creates an empty heap (break at 0) that may grow up to `max_size`
    /// bytes. The backing buffer is reserved up front.
    pub fn new(max_size: usize) -> Self {
        debug!("simulated heap created, maximum size {max_size} bytes");
        Self {
            buf: Vec::with_capacity(max_size),
            max_size,
        }
    }

    /// Raises the break by `incr` bytes and returns the old break, which is
    /// the offset of the first byte of the new region. The new region is
    /// zero-filled.
    ///
    /// Fails with [`AllocError::OutOfMemory`] when the raised break would
    /// pass the maximum heap size, or when `incr` is large enough that the
    /// break arithmetic itself would overflow.
    pub fn extend(&mut self, incr: usize) -> Result<usize, AllocError> {
        let old_brk = self.buf.len();
        let new_brk = match old_brk.checked_add(incr) {
            Some(new_brk) if new_brk <= self.max_size => new_brk,
            _ => {
                error!(
                    "extend({incr}) refused: break {old_brk}, maximum {}",
                    self.max_size
                );
                return Err(AllocError::OutOfMemory);
            }
        };
        self.buf.resize(new_brk, 0);
        trace!("extend({incr}): break {old_brk} -> {new_brk}");
        Ok(old_brk)
    }

    /// The current break offset: one past the last committed byte.
    pub fn brk(&self) -> usize {
        self.buf.len()
    }

    /// The maximum size this heap may grow to.
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// A view of the committed region `[0, brk)`.
    pub fn bytes(&self) -> &[u8] {
        &self.buf
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.buf
    }
}
