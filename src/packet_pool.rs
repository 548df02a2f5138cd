//! A fixed-size pool of H4 packet buffers handed out as exclusively owned handles.
use core::cell::{RefCell, UnsafeCell};

use embassy_sync::blocking_mutex::raw::RawMutex;
use embassy_sync::blocking_mutex::Mutex;

use crate::types::H4PacketType;

/// Slot-level pool interface. Object-safe so handles can carry `&dyn` and the
/// proxy does not need to thread the pool's const generics everywhere.
pub(crate) trait BufferPool {
    /// Reserve a free slot, zeroing its buffer. Returns the slot index.
    fn alloc(&self) -> Option<usize>;
    /// Return a slot to the pool and latch a drain request.
    fn free(&self, slot: usize);
    fn slot_ptr(&self, slot: usize) -> *mut u8;
    fn slot_size(&self) -> usize;
    fn free_slots(&self) -> usize;
    /// Consume the latched drain request, if any.
    fn take_drain_request(&self) -> bool;
}

struct PoolState<const N: usize> {
    free: [bool; N],
    drain_pending: bool,
}

/// A pool of `N` H4 buffers of `MTU` bytes each.
///
/// Each buffer holds a full H4 frame: the framing type byte followed by the
/// HCI packet.
pub struct H4BufferPool<M: RawMutex, const N: usize, const MTU: usize> {
    state: Mutex<M, RefCell<PoolState<N>>>,
    buffers: [UnsafeCell<[u8; MTU]>; N],
}

// Buffer contents are only ever touched by the single owner of the slot (or
// by alloc() before a slot has an owner), so sharing the pool is fine.
unsafe impl<M: RawMutex, const N: usize, const MTU: usize> Sync for H4BufferPool<M, N, MTU> {}

impl<M: RawMutex, const N: usize, const MTU: usize> H4BufferPool<M, N, MTU> {
    const EMPTY: UnsafeCell<[u8; MTU]> = UnsafeCell::new([0; MTU]);

    pub const fn new() -> Self {
        Self {
            state: Mutex::new(RefCell::new(PoolState {
                free: [true; N],
                drain_pending: false,
            })),
            buffers: [Self::EMPTY; N],
        }
    }
}

impl<M: RawMutex, const N: usize, const MTU: usize> Default for H4BufferPool<M, N, MTU> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: RawMutex, const N: usize, const MTU: usize> BufferPool for H4BufferPool<M, N, MTU> {
    fn alloc(&self) -> Option<usize> {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            for idx in 0..N {
                if state.free[idx] {
                    state.free[idx] = false;
                    // No owner yet, so clearing under the lock is fine.
                    unsafe { (*self.buffers[idx].get()).fill(0) };
                    return Some(idx);
                }
            }
            None
        })
    }

    fn free(&self, slot: usize) {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            debug_assert!(!state.free[slot]);
            state.free[slot] = true;
            state.drain_pending = true;
        });
    }

    fn slot_ptr(&self, slot: usize) -> *mut u8 {
        self.buffers[slot].get() as *mut u8
    }

    fn slot_size(&self) -> usize {
        MTU
    }

    fn free_slots(&self) -> usize {
        self.state.lock(|state| state.borrow().free.iter().filter(|f| **f).count())
    }

    fn take_drain_request(&self) -> bool {
        self.state.lock(|state| {
            let mut state = state.borrow_mut();
            let pending = state.drain_pending;
            state.drain_pending = false;
            pending
        })
    }
}

/// An exclusively owned H4 buffer from a pool.
///
/// The slot is released exactly once, when the packet is dropped. Sinks that
/// receive one must not stash away the backing memory's address; the slot is
/// reused once released.
pub struct PoolPacket<'d> {
    pool: &'d dyn BufferPool,
    slot: usize,
    len: usize,
}

impl<'d> PoolPacket<'d> {
    pub(crate) fn new(pool: &'d dyn BufferPool, slot: usize, len: usize) -> Self {
        Self { pool, slot, len }
    }

    /// Give up the drop-release and hand the raw slot back to the caller.
    pub(crate) fn into_raw(self) -> (usize, usize) {
        let parts = (self.slot, self.len);
        core::mem::forget(self);
        parts
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The H4 framing type stored in the first byte.
    pub fn h4_type(&self) -> H4PacketType {
        self.as_ref().first().map(|b| H4PacketType::from(*b)).unwrap_or(H4PacketType::Unknown)
    }

    /// The HCI packet, i.e. everything after the framing type byte.
    pub fn hci_span(&self) -> &[u8] {
        let data = self.as_ref();
        if data.is_empty() {
            data
        } else {
            &data[1..]
        }
    }
}

impl AsRef<[u8]> for PoolPacket<'_> {
    fn as_ref(&self) -> &[u8] {
        // This packet is the only owner of the slot until drop.
        unsafe { core::slice::from_raw_parts(self.pool.slot_ptr(self.slot), self.len) }
    }
}

impl AsMut<[u8]> for PoolPacket<'_> {
    fn as_mut(&mut self) -> &mut [u8] {
        unsafe { core::slice::from_raw_parts_mut(self.pool.slot_ptr(self.slot), self.len) }
    }
}

impl Drop for PoolPacket<'_> {
    fn drop(&mut self) {
        self.pool.free(self.slot);
    }
}
