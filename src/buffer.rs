//! Per-destination message accumulation buffers.
//!
//! A [`MessageBuffer`] is a fixed-capacity byte buffer that concurrent
//! producers append to by CAS-reserving disjoint ranges of an atomic
//! length word. The first producer that does not fit seals the buffer
//! (exactly once); sealed buffers travel to the sender worker and come
//! back through the free pool. A [`DestQueue`] holds the active buffer
//! for one (tag, destination) pair and arbitrates append-vs-swap with a
//! fine-grained read/write lock, so appends stay lock-free among
//! themselves and a swapped-out buffer can no longer be written.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crossbeam_channel::{bounded, Receiver, Sender};
use parking_lot::RwLock;

/// High bit of the reservation word marks the buffer sealed.
const SEALED: usize = 1 << (usize::BITS - 1);
const LEN_MASK: usize = SEALED - 1;

#[derive(Debug, PartialEq, Eq)]
pub enum Append {
    /// Payload copied into the buffer.
    Done,
    /// Payload did not fit; the caller performed the Open → Sealed
    /// transition and now owns the swap-and-ship duty.
    Full,
    /// Buffer already sealed by somebody else; re-read the active slot.
    Sealed,
}

pub struct MessageBuffer {
    data: Box<[UnsafeCell<u8>]>,
    /// Reserved byte count plus the [`SEALED`] flag.
    reserved: AtomicUsize,
}

// Safety: producers only ever write disjoint `[cur, cur+n)` ranges they
// reserved through `reserved`, and readers (`sealed_bytes`) run only
// after the buffer left its queue slot, which the DestQueue lock orders
// after every in-flight append.
unsafe impl Send for MessageBuffer {}
unsafe impl Sync for MessageBuffer {}

impl MessageBuffer {
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(capacity > 0 && capacity < LEN_MASK, "bad buffer capacity");
        MessageBuffer {
            data: (0..capacity).map(|_| UnsafeCell::new(0)).collect(),
            reserved: AtomicUsize::new(0),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    #[inline]
    pub fn is_sealed(&self) -> bool {
        self.reserved.load(Ordering::Acquire) & SEALED != 0
    }

    /// Byte length accumulated so far (valid for observation; exact once
    /// the buffer is sealed).
    #[inline]
    pub fn len(&self) -> usize {
        self.reserved.load(Ordering::Acquire) & LEN_MASK
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Reserve space and copy `payload` in. Payloads must be shorter
    /// than the capacity; the oversize check belongs to the caller.
    pub fn append(&self, payload: &[u8]) -> Append {
        let n = payload.len();
        assert!(n > 0 && n < self.capacity(), "payload size {} out of range", n);
        let mut cur = self.reserved.load(Ordering::Acquire);
        loop {
            if cur & SEALED != 0 {
                return Append::Sealed;
            }
            if cur + n > self.capacity() {
                match self.reserved.compare_exchange_weak(
                    cur,
                    cur | SEALED,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => return Append::Full,
                    Err(actual) => {
                        cur = actual;
                        continue;
                    }
                }
            }
            match self.reserved.compare_exchange_weak(
                cur,
                cur + n,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    let dst = self.data[cur..cur + n].as_ptr() as *mut u8;
                    // Safety: `[cur, cur+n)` was reserved exclusively above.
                    unsafe { std::ptr::copy_nonoverlapping(payload.as_ptr(), dst, n) };
                    return Append::Done;
                }
                Err(actual) => cur = actual,
            }
        }
    }

    /// Force the Open → Sealed transition (used when flushing a
    /// partially filled buffer). Returns the sealed byte length.
    pub fn seal(&self) -> usize {
        self.reserved.fetch_or(SEALED, Ordering::AcqRel) & LEN_MASK
    }

    /// The accumulated bytes of a sealed buffer.
    ///
    /// Callers must only invoke this after the buffer has been swapped
    /// out of its [`DestQueue`] slot; the slot's write lock orders the
    /// swap after every append that reserved space.
    pub fn sealed_bytes(&self) -> &[u8] {
        let r = self.reserved.load(Ordering::Acquire);
        assert!(r & SEALED != 0, "buffer read before sealing");
        let len = r & LEN_MASK;
        // Safety: see above; no writer can touch a swapped-out buffer.
        unsafe { std::slice::from_raw_parts(self.data[..len].as_ptr() as *const u8, len) }
    }

    /// Return the buffer to the Open state for reuse. Only the free
    /// pool calls this, when no other reference exists.
    fn reset(&self) {
        self.reserved.store(0, Ordering::Release);
    }
}

/// MPMC free list with back-pressure: `acquire` blocks while every
/// buffer is in flight.
pub struct BufferPool {
    free_tx: Sender<Arc<MessageBuffer>>,
    free_rx: Receiver<Arc<MessageBuffer>>,
    buffer_capacity: usize,
}

impl BufferPool {
    pub fn new(pool_buffers: usize, buffer_capacity: usize) -> Self {
        assert!(pool_buffers > 0, "pool needs at least one buffer");
        let (free_tx, free_rx) = bounded(pool_buffers);
        for _ in 0..pool_buffers {
            free_tx
                .send(Arc::new(MessageBuffer::with_capacity(buffer_capacity)))
                .expect("populate buffer pool");
        }
        BufferPool {
            free_tx,
            free_rx,
            buffer_capacity,
        }
    }

    #[inline]
    pub fn buffer_capacity(&self) -> usize {
        self.buffer_capacity
    }

    pub fn acquire(&self) -> Arc<MessageBuffer> {
        self.free_rx.recv().expect("buffer pool closed")
    }

    pub fn release(&self, buffer: Arc<MessageBuffer>) {
        buffer.reset();
        // The channel holds exactly the buffers created above, so this
        // send cannot block.
        self.free_tx.send(buffer).expect("buffer pool closed");
    }
}

/// Active-buffer slot for one (tag, destination) pair.
pub struct DestQueue {
    active: RwLock<Option<Arc<MessageBuffer>>>,
}

impl Default for DestQueue {
    fn default() -> Self {
        DestQueue {
            active: RwLock::new(None),
        }
    }
}

enum Step {
    Done,
    Install,
    SwapOut(Arc<MessageBuffer>),
    Wait,
}

impl DestQueue {
    /// Append `payload`, sealing and shipping full buffers through
    /// `ship`. `ship` runs while the slot lock is held so that buffers
    /// for one destination enter the send pipeline in seal order.
    pub fn append(
        &self,
        pool: &BufferPool,
        payload: &[u8],
        mut ship: impl FnMut(Arc<MessageBuffer>),
    ) {
        loop {
            let step = {
                let slot = self.active.read();
                match slot.as_ref() {
                    Some(buf) => match buf.append(payload) {
                        Append::Done => Step::Done,
                        Append::Full => Step::SwapOut(Arc::clone(buf)),
                        Append::Sealed => Step::Wait,
                    },
                    None => Step::Install,
                }
            };
            match step {
                Step::Done => return,
                Step::Install => {
                    let fresh = pool.acquire();
                    let mut slot = self.active.write();
                    if slot.is_none() {
                        *slot = Some(fresh);
                    } else {
                        drop(slot);
                        pool.release(fresh);
                    }
                }
                Step::SwapOut(sealed) => {
                    // We performed the seal; swap in a fresh buffer and
                    // ship, unless a flush swapped the slot first.
                    let fresh = pool.acquire();
                    let mut slot = self.active.write();
                    let current = slot.as_ref().expect("sealed buffer vanished from slot");
                    if Arc::ptr_eq(current, &sealed) {
                        *slot = Some(fresh);
                        ship(sealed);
                    } else {
                        drop(slot);
                        pool.release(fresh);
                    }
                }
                Step::Wait => std::thread::yield_now(),
            }
        }
    }

    /// Seal and ship the active buffer (empty buffers go back to the
    /// pool), leaving a fresh one installed. Used by flush.
    pub fn flush_active(&self, pool: &BufferPool, mut ship: impl FnMut(Arc<MessageBuffer>)) {
        let fresh = pool.acquire();
        let recycled = {
            let mut slot = self.active.write();
            match slot.replace(fresh) {
                Some(old) => {
                    let len = old.seal();
                    if len > 0 {
                        ship(old);
                        None
                    } else {
                        Some(old)
                    }
                }
                None => None,
            }
        };
        if let Some(empty) = recycled {
            pool.release(empty);
        }
    }
}
