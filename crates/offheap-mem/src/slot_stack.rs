//! Lock-free, duplicate-rejecting stack of slot indices.
//!
//! A Treiber stack threaded through a fixed array: `cells[i]` is either
//! `FREE` (slot `i` is not on the stack), `TAIL` (slot `i` is the bottom), or
//! the index of the slot below it. The head packs a generation counter in the
//! upper 32 bits with the top index in the lower 32 bits, so a head that was
//! popped and pushed back between a load and a CAS still fails the CAS.
//!
//! ```text
//! head: (gen=7, idx=3)
//! cells: [FREE, TAIL, FREE, 5, FREE, 1]      stack: 3 -> 5 -> 1
//! ```
//!
//! `push(i)` claims `cells[i]` with a `FREE -> link` CAS before publishing the
//! head, which is what makes a second concurrent `push(i)` fail.

use std::sync::atomic::{AtomicIsize, AtomicU32, AtomicU64, Ordering};

const FREE: u32 = u32::MAX;
const TAIL: u32 = u32::MAX - 1;

/// Largest capacity a stack can be built with.
pub const MAX_SLOTS: usize = TAIL as usize;

#[inline]
fn pack(generation: u32, index: u32) -> u64 {
    ((generation as u64) << 32) | index as u64
}

#[inline]
fn index_of(head: u64) -> u32 {
    head as u32
}

#[inline]
fn generation_of(head: u64) -> u32 {
    (head >> 32) as u32
}

pub struct SlotStack {
    cells: Box<[AtomicU32]>,
    head: AtomicU64,
    // Maintained after the head CAS, so it can briefly dip below zero.
    len: AtomicIsize,
}

impl SlotStack {
    /// Create an empty stack able to hold slots `0..capacity`.
    ///
    /// # Panics
    /// If `capacity > MAX_SLOTS`.
    pub fn new(capacity: usize) -> Self {
        assert!(
            capacity <= MAX_SLOTS,
            "slot stack capacity {capacity} exceeds {MAX_SLOTS}"
        );
        let cells = (0..capacity).map(|_| AtomicU32::new(FREE)).collect();
        Self {
            cells,
            head: AtomicU64::new(pack(0, TAIL)),
            len: AtomicIsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.cells.len()
    }

    /// Push `slot`. Returns `false` if it is already on the stack (or out of
    /// range), leaving the stack untouched.
    pub fn push(&self, slot: usize) -> bool {
        let Some(cell) = self.cells.get(slot) else {
            return false;
        };
        let slot_u = slot as u32;

        let mut head = self.head.load(Ordering::Acquire);
        if cell
            .compare_exchange(FREE, index_of(head), Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        // We own `cell` now: it is neither FREE nor reachable from the head,
        // so relinking it on a lost head race is a plain store.
        loop {
            let next = pack(generation_of(head).wrapping_add(1), slot_u);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.len.fetch_add(1, Ordering::Relaxed);
                    return true;
                }
                Err(observed) => {
                    head = observed;
                    cell.store(index_of(head), Ordering::Release);
                }
            }
        }
    }

    /// Pop the most recently pushed slot.
    pub fn pop(&self) -> Option<usize> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let top = index_of(head);
            if top == TAIL {
                return None;
            }
            // May read a stale link if `top` was popped concurrently; the
            // generation bump makes the CAS below fail in that case.
            let below = self.cells[top as usize].load(Ordering::Acquire);
            let next = pack(generation_of(head).wrapping_add(1), below);
            match self
                .head
                .compare_exchange_weak(head, next, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => {
                    self.cells[top as usize].store(FREE, Ordering::Release);
                    self.len.fetch_sub(1, Ordering::Relaxed);
                    return Some(top as usize);
                }
                Err(observed) => head = observed,
            }
        }
    }

    /// Whether `slot` is currently on the stack.
    pub fn contains(&self, slot: usize) -> bool {
        self.cells
            .get(slot)
            .map_or(false, |c| c.load(Ordering::Acquire) != FREE)
    }

    /// Approximate number of slots on the stack.
    pub fn len(&self) -> usize {
        self.len.load(Ordering::Relaxed).max(0) as usize
    }

    pub fn is_empty(&self) -> bool {
        index_of(self.head.load(Ordering::Acquire)) == TAIL
    }
}

impl std::fmt::Debug for SlotStack {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let head = self.head.load(Ordering::Relaxed);
        f.debug_struct("SlotStack")
            .field("capacity", &self.capacity())
            .field("len", &self.len())
            .field("generation", &generation_of(head))
            .finish()
    }
}
