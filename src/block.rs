use bitflags::bitflags;
use core::fmt;
use log::{debug, trace};

use crate::heap::{AllocError, SimHeap};

/// The size of a header or footer word
const HEADER_SIZE: usize = 8;

/// Payload alignment unit, two header words
const ALIGNMENT: usize = 2 * HEADER_SIZE;

/// Smallest manageable block: header + footer + one alignment unit of payload
const MIN_BLOCK_SIZE: usize = ALIGNMENT + 2 * HEADER_SIZE;

/// Amount the heap grows by when no free block fits
const CHUNK_SIZE: usize = 4096;

/// A first-fit allocator carving blocks out of a [`SimHeap`].
///
/// Every block carries a header word and a footer word packing its size
/// together with an allocated bit. Free neighbors are merged eagerly on every
/// free and on every heap extension, so the heap never holds two adjacent
/// free blocks. Allocations are addressed by payload offset into the heap.
///
/// Freeing an offset that is not a live allocation from this allocator is out
/// of contract: no provenance check is performed, and the block structure is
/// silently corrupted (in-bounds corruption or a panic, never memory
/// unsafety).
pub struct BlockAllocator {
    heap: SimHeap,
    /// Offset of the prologue block's payload, where block scans start.
    base: usize,
}

impl BlockAllocator {
    /// Bootstraps an allocator over `heap`.
    ///
    /// Lays down the boundary sentinels (an alignment padding word, a
    /// prologue block, an epilogue header) and then grows the heap by one
    /// default chunk formatted as a single free block, so the first
    /// allocation does not need to extend the heap.
    ///
    /// Fails with [`AllocError::Initialization`] if the heap cannot supply
    /// the sentinel words or the initial chunk.
    pub fn init(heap: SimHeap) -> Result<Self, AllocError> {
        let mut alloc = Self { heap, base: 0 };

        let start = alloc
            .heap
            .extend(4 * HEADER_SIZE)
            .map_err(|_| AllocError::Initialization)?;
        alloc.store(start, HeaderWord::new(0, false)); // alignment padding
        alloc.store(start + HEADER_SIZE, HeaderWord::new(ALIGNMENT, true)); // prologue header
        alloc.store(start + 2 * HEADER_SIZE, HeaderWord::new(ALIGNMENT, true)); // prologue footer
        alloc.store(start + 3 * HEADER_SIZE, HeaderWord::new(0, true)); // epilogue header
        alloc.base = start + 2 * HEADER_SIZE;

        alloc
            .extend_heap(CHUNK_SIZE)
            .map_err(|_| AllocError::Initialization)?;
        debug!(
            "allocator initialized: break {}, maximum {}",
            alloc.heap.brk(),
            alloc.heap.max_size()
        );
        Ok(alloc)
    }

    /// Allocates `size` usable bytes and returns the payload offset.
    ///
    /// Returns `None` for a zero-size request (defined as "no allocation",
    /// not an error) and when the heap cannot grow enough to satisfy the
    /// request. An out-of-memory result is final: the heap never shrinks, so
    /// retrying without freeing cannot succeed.
    pub fn allocate(&mut self, size: usize) -> Option<usize> {
        if size == 0 {
            return None;
        }
        let needed = adjusted_size(size)?;

        if let Some(bp) = self.find_fit(needed) {
            self.place(bp, needed);
            trace!("allocate({size}): reusing block at {bp}");
            return Some(bp);
        }

        let bp = match self.extend_heap(needed.max(CHUNK_SIZE)) {
            Ok(bp) => bp,
            Err(_) => {
                debug!("allocate({size}): out of memory");
                return None;
            }
        };
        self.place(bp, needed);
        trace!("allocate({size}): heap grown, block at {bp}");
        Some(bp)
    }

    /// Releases the allocation whose payload starts at `bp`, merging it with
    /// any free neighbor.
    ///
    /// `bp` must be a live offset previously returned by
    /// [`BlockAllocator::allocate`]; nothing is validated beyond a
    /// debug-build alignment assertion.
    pub fn free(&mut self, bp: usize) {
        debug_assert!(bp % ALIGNMENT == 0, "freed offset is not payload-aligned");

        let size = self.load(header_offset(bp)).size();
        self.store(header_offset(bp), HeaderWord::new(size, false));
        self.store(self.footer_offset(bp), HeaderWord::new(size, false));
        self.coalesce(bp);
        trace!("free({bp}): released {size} bytes");
    }

    /// Borrows `len` bytes of the payload at `bp`.
    ///
    /// `len` beyond the requested allocation size observes block metadata or
    /// panics at the committed heap boundary; staying within the requested
    /// size is the caller's contract.
    pub fn payload(&self, bp: usize, len: usize) -> &[u8] {
        &self.heap.bytes()[bp..bp + len]
    }

    /// Mutably borrows `len` bytes of the payload at `bp`.
    ///
    /// Writing past the requested allocation size clobbers block metadata;
    /// the same contract as [`BlockAllocator::payload`] applies.
    pub fn payload_mut(&mut self, bp: usize, len: usize) -> &mut [u8] {
        &mut self.heap.bytes_mut()[bp..bp + len]
    }

    /// The backing simulated heap, for break and limit introspection.
    pub fn heap(&self) -> &SimHeap {
        &self.heap
    }

    /// Grows the heap by `bytes` rounded up to the alignment unit, formats
    /// the new region as one free block, re-plants the epilogue header at the
    /// new end, and merges backward into a trailing free block if there is
    /// one. Returns the offset of the resulting free block.
    fn extend_heap(&mut self, bytes: usize) -> Result<usize, AllocError> {
        let size = round_to(bytes, ALIGNMENT);
        // The old epilogue header becomes the new block's header.
        let bp = self.heap.extend(size)?;
        self.store(header_offset(bp), HeaderWord::new(size, false));
        self.store(self.footer_offset(bp), HeaderWord::new(size, false));
        let next = self.next_block(bp);
        self.store(header_offset(next), HeaderWord::new(0, true));
        Ok(self.coalesce(bp))
    }

    /// First-fit scan over the implicit block list, from the bottom of the
    /// heap to the size-0 epilogue.
    fn find_fit(&self, needed: usize) -> Option<usize> {
        let mut bp = self.base;
        loop {
            let header = self.load(header_offset(bp));
            if header.size() == 0 {
                return None;
            }
            if !header.allocated() && header.size() >= needed {
                return Some(bp);
            }
            bp += header.size();
        }
    }

    /// Marks `needed` bytes of the free block at `bp` allocated. The tail
    /// becomes its own free block when it is still independently manageable;
    /// otherwise the whole block is taken and the slack stays inside it.
    fn place(&mut self, bp: usize, needed: usize) {
        let total = self.load(header_offset(bp)).size();

        if total - needed >= MIN_BLOCK_SIZE {
            self.store(header_offset(bp), HeaderWord::new(needed, true));
            self.store(self.footer_offset(bp), HeaderWord::new(needed, true));
            let rest = self.next_block(bp);
            self.store(header_offset(rest), HeaderWord::new(total - needed, false));
            self.store(self.footer_offset(rest), HeaderWord::new(total - needed, false));
        } else {
            self.store(header_offset(bp), HeaderWord::new(total, true));
            self.store(self.footer_offset(bp), HeaderWord::new(total, true));
        }
    }

    /// Merges the free block at `bp` with whichever of its neighbors are
    /// free and returns the merged block's offset. The prologue and epilogue
    /// sentinels read as allocated, so the merge never runs off either end of
    /// the heap.
    fn coalesce(&mut self, bp: usize) -> usize {
        let prev_free = !self.load(bp - 2 * HEADER_SIZE).allocated();
        let next = self.next_block(bp);
        let next_free = !self.load(header_offset(next)).allocated();
        let mut size = self.load(header_offset(bp)).size();

        match (prev_free, next_free) {
            (false, false) => bp,
            (false, true) => {
                size += self.load(header_offset(next)).size();
                self.store(header_offset(bp), HeaderWord::new(size, false));
                self.store(self.footer_offset(bp), HeaderWord::new(size, false));
                bp
            }
            (true, false) => {
                let prev = self.prev_block(bp);
                size += self.load(header_offset(prev)).size();
                self.store(self.footer_offset(bp), HeaderWord::new(size, false));
                self.store(header_offset(prev), HeaderWord::new(size, false));
                prev
            }
            (true, true) => {
                let prev = self.prev_block(bp);
                size += self.load(header_offset(prev)).size()
                    + self.load(header_offset(next)).size();
                self.store(self.footer_offset(next), HeaderWord::new(size, false));
                self.store(header_offset(prev), HeaderWord::new(size, false));
                prev
            }
        }
    }

    fn load(&self, offset: usize) -> HeaderWord {
        let mut word = [0u8; HEADER_SIZE];
        word.copy_from_slice(&self.heap.bytes()[offset..offset + HEADER_SIZE]);
        HeaderWord::from_bits_retain(u64::from_ne_bytes(word))
    }

    fn store(&mut self, offset: usize, word: HeaderWord) {
        self.heap.bytes_mut()[offset..offset + HEADER_SIZE]
            .copy_from_slice(&word.bits().to_ne_bytes());
    }

    /// Offset of the footer word of the block at `bp`, per its current header.
    fn footer_offset(&self, bp: usize) -> usize {
        bp + self.load(header_offset(bp)).size() - 2 * HEADER_SIZE
    }

    fn next_block(&self, bp: usize) -> usize {
        bp + self.load(header_offset(bp)).size()
    }

    /// Walks backward over the previous block's footer to its payload.
    fn prev_block(&self, bp: usize) -> usize {
        bp - self.load(bp - 2 * HEADER_SIZE).size()
    }

    fn blocks(&self) -> Blocks<'_> {
        Blocks {
            alloc: self,
            bp: self.base,
        }
    }
}

impl fmt::Debug for BlockAllocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // we want a better debug for this type
        #[derive(Debug)]
        struct Block {
            offset: usize,
            size: usize,
            allocated: bool,
        }

        let mut list = f.debug_list();
        for (offset, size, allocated) in self.blocks() {
            list.entry(&Block {
                offset,
                size,
                allocated,
            });
        }
        list.finish()
    }
}

/// Walks the implicit block list from the prologue up to the epilogue,
/// yielding `(payload offset, size, allocated)` per block.
struct Blocks<'a> {
    alloc: &'a BlockAllocator,
    bp: usize,
}

impl Iterator for Blocks<'_> {
    type Item = (usize, usize, bool);

    fn next(&mut self) -> Option<Self::Item> {
        let header = self.alloc.load(header_offset(self.bp));
        let size = header.size();
        if size == 0 {
            return None;
        }
        let item = (self.bp, size, header.allocated());
        self.bp += size;
        Some(item)
    }
}

bitflags! {
    /// A block's header word, doubling as the footer word. Since block sizes
    /// are always a multiple of 8 the low 3 bits are free for metadata; the
    /// allocated flag lives in bit 0 and the size in all bits above.
    #[derive(Clone, Copy, PartialEq, Eq)]
    struct HeaderWord: u64 {
        /// The block is allocated
        const ALLOCATED = 0b1;
    }
}

impl HeaderWord {
    fn new(size: usize, allocated: bool) -> Self {
        debug_assert!(size & 0x7 == 0, "block sizes are multiples of 8");
        let mut word = Self::from_bits_retain(size as u64);
        word.set(Self::ALLOCATED, allocated);
        word
    }

    /// Total block size in bytes, metadata included
    fn size(self) -> usize {
        (self.bits() & !0x7) as usize
    }

    fn allocated(self) -> bool {
        self.contains(Self::ALLOCATED)
    }
}

/// Rounds `value` up to the next multiple of `multiple`, which must be a
/// power of two. Panics if the result would not fit in a usize.
fn round_to(value: usize, multiple: usize) -> usize {
    (value + multiple - 1) & !(multiple - 1)
}

/// Converts a requested payload size into a block size: rounded up to the
/// alignment unit with header and footer added, clamped to the minimum block
/// size. `None` when the arithmetic would overflow.
fn adjusted_size(size: usize) -> Option<usize> {
    if size <= ALIGNMENT {
        Some(MIN_BLOCK_SIZE)
    } else {
        size.checked_add(2 * HEADER_SIZE + (ALIGNMENT - 1))
            .map(|total| total & !(ALIGNMENT - 1))
    }
}

const fn header_offset(bp: usize) -> usize {
    bp - HEADER_SIZE
}
