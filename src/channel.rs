// src/channel.rs

//! Bounded single-writer, multi-reader ring channel.
//!
//! One producer owns the write cursor and each of the `R` readers owns exactly
//! one read cursor. Cursors are stored already masked to `0..size`, so
//!
//! ```text
//! count(i) = (size + wr - rd[i]) & (size - 1)
//! rooms()  = min_i (size + rd[i] - wr - 1) & (size - 1)
//! ```
//!
//! One slot is always kept free, so `wr == rd[i]` means "empty", never "full".
//!
//! # Shadow region
//!
//! The backing store holds `size + threshold` elements. The trailing
//! `threshold` slots mirror logical slots `0..threshold`:
//!
//! ```text
//!  physical:  [ 0 1 2 ... size-1 | size size+1 ... size+threshold-1 ]
//!  logical:   [ 0 1 2 ... size-1 | 0    1    ...   threshold-1      ]
//! ```
//!
//! A writer may fill a window that runs past `size` and commit copies the
//! overflow back to the front. Every commit also mirrors freshly written
//! front slots into the shadow. A reader can therefore take any window of up
//! to `threshold` elements as one slice even when it straddles the end.
//! Only the writer ever touches the shadow, and only for slots it has not yet
//! published.
//!
//! # Protocol
//!
//! Participants must check `rooms()`/`count()`, transfer at most that much,
//! then commit. Committing more than was reported corrupts the ring and
//! panics. Windows are burst-synchronised: a window must not be used after its
//! own cursor has been committed. The [`endpoint`] ports enforce that through
//! borrowing; the raw methods here are `unsafe` for that reason.

pub mod endpoint;

use std::cell::UnsafeCell;
use std::sync::atomic::{fence, AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use log::trace;
use parking_lot::Mutex;

use crate::error::ChannelError;
use crate::os::WaitCondition;

pub use endpoint::{ring, ReadPort, WritePort};

/// Cache line size on x86-64 (64 bytes)
const CACHE_LINE: usize = 64;

/// Pad to cache line to prevent false sharing between cursors.
#[repr(align(64))]
struct CachePadded<T>(T);

const _: () = assert!(std::mem::align_of::<CachePadded<AtomicUsize>>() == CACHE_LINE);

/// Readiness notification for participants that prefer blocking to spinning.
///
/// Every commit calls [`Doorbell::ring`]. When nobody waits that is one fence
/// and one atomic load.
struct Doorbell {
    generation: Mutex<u64>,
    cond: WaitCondition,
    waiters: AtomicUsize,
}

impl Doorbell {
    fn new() -> Self {
        Self {
            generation: Mutex::new(0),
            cond: WaitCondition::new(),
            waiters: AtomicUsize::new(0),
        }
    }

    fn ring(&self) {
        // Pairs with the fence in `wait_until`: either we see the waiter or
        // the waiter sees our cursor store.
        fence(Ordering::SeqCst);
        if self.waiters.load(Ordering::Relaxed) == 0 {
            return;
        }
        let mut generation = self.generation.lock();
        *generation = generation.wrapping_add(1);
        self.cond.broadcast();
    }

    /// Blocks until `ready()` holds or `timeout` elapses. Returns `ready()`.
    fn wait_until(&self, timeout: Duration, ready: impl Fn() -> bool) -> bool {
        if ready() {
            return true;
        }
        let deadline = Instant::now().checked_add(timeout);

        self.waiters.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);
        let mut generation = self.generation.lock();
        let satisfied = loop {
            if ready() {
                break true;
            }
            let remaining = match deadline {
                Some(deadline) => deadline.saturating_duration_since(Instant::now()),
                None => Duration::MAX,
            };
            if remaining.is_zero() {
                break false;
            }
            self.cond.wait_timeout(&mut generation, remaining);
        };
        drop(generation);
        self.waiters.fetch_sub(1, Ordering::Relaxed);
        satisfied
    }
}

/// Shared state of one channel. Usually reached through [`WritePort`] and
/// [`ReadPort`]; see the module docs for the raw contract.
pub struct RingChannel<T> {
    /// `size + threshold` slots. The tail mirrors logical slots `0..threshold`.
    store: Box<[UnsafeCell<T>]>,
    size: usize,
    /// `size - 1`
    mask: usize,
    threshold: usize,
    /// Writer cursor. Only the producer stores to this.
    wr: CachePadded<AtomicUsize>,
    /// One cursor per reader. Reader `i` is the only one to store to `rd[i]`.
    rd: Box<[CachePadded<AtomicUsize>]>,
    doorbell: Doorbell,
}

// Safety: the producer only writes slots that no reader can observe (free
// slots and their shadows) and publishes them with a Release store of `wr`.
// Readers only read slots below an Acquire load of `wr` and hand them back
// with a Release store of their own cursor. Elements are `Copy`, so no slot
// is ever dropped.
unsafe impl<T: Send> Send for RingChannel<T> {}
unsafe impl<T: Send> Sync for RingChannel<T> {}

impl<T: Copy + Default> RingChannel<T> {
    /// Creates a channel of `size` slots (`size - 1` usable), with a
    /// `threshold`-slot shadow region and `readers` read cursors.
    ///
    /// # Errors
    ///
    /// Rejects sizes below 2, sizes that are not a power of two, a threshold
    /// larger than the size, and zero readers.
    pub fn new(size: usize, threshold: usize, readers: usize) -> Result<Self, ChannelError> {
        if size < 2 {
            return Err(ChannelError::ZeroCapacity(size));
        }
        if !size.is_power_of_two() {
            return Err(ChannelError::CapacityNotPowerOfTwo(size));
        }
        if threshold > size {
            return Err(ChannelError::ThresholdTooLarge { size, threshold });
        }
        if readers == 0 {
            return Err(ChannelError::NoReaders);
        }

        let store = (0..size + threshold)
            .map(|_| UnsafeCell::new(T::default()))
            .collect();
        let rd = (0..readers)
            .map(|_| CachePadded(AtomicUsize::new(0)))
            .collect();

        trace!(
            "RingChannel created: size={} threshold={} readers={}",
            size,
            threshold,
            readers
        );
        Ok(Self {
            store,
            size,
            mask: size - 1,
            threshold,
            wr: CachePadded(AtomicUsize::new(0)),
            rd,
            doorbell: Doorbell::new(),
        })
    }
}

impl<T: Copy> RingChannel<T> {
    /// Number of ring slots (a power of two).
    #[must_use]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Elements the ring can hold at once: `size - 1`.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.size - 1
    }

    /// Longest window guaranteed contiguous across the end of the ring.
    #[must_use]
    pub fn threshold(&self) -> usize {
        self.threshold
    }

    #[must_use]
    pub fn readers(&self) -> usize {
        self.rd.len()
    }

    /// Unread elements available to `reader`.
    ///
    /// # Panics
    ///
    /// If `reader` is out of range.
    #[must_use]
    pub fn count(&self, reader: usize) -> usize {
        let wr = self.wr.0.load(Ordering::Acquire);
        let rd = self.rd[reader].0.load(Ordering::Acquire);
        self.size.wrapping_add(wr).wrapping_sub(rd) & self.mask
    }

    /// Free slots the writer may fill. Bounded by the slowest reader.
    #[must_use]
    pub fn rooms(&self) -> usize {
        let wr = self.wr.0.load(Ordering::Acquire);
        self.rd
            .iter()
            .map(|rd| {
                let rd = rd.0.load(Ordering::Acquire);
                self.size.wrapping_add(rd).wrapping_sub(wr).wrapping_sub(1) & self.mask
            })
            .min()
            .unwrap_or(0)
    }

    /// Current writer cursor, in `0..size`.
    #[must_use]
    pub fn write_cursor(&self) -> usize {
        self.wr.0.load(Ordering::Acquire)
    }

    /// Current cursor of `reader`, in `0..size`.
    #[must_use]
    pub fn read_cursor(&self, reader: usize) -> usize {
        self.rd[reader].0.load(Ordering::Acquire)
    }

    fn base(&self) -> *mut T {
        UnsafeCell::raw_get(self.store.as_ptr())
    }

    /// The next `n` unwritten slots as one slice. Does not move the cursor.
    ///
    /// # Safety
    ///
    /// The caller must be the channel's only producer, and must not use the
    /// slice after the next [`commit_write`](Self::commit_write).
    ///
    /// # Panics
    ///
    /// If `n > rooms()`, or if the window would run past the shadow region.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn write_window(&self, n: usize) -> &mut [T] {
        let wr = self.wr.0.load(Ordering::Relaxed);
        let rooms = self.rooms();
        assert!(n <= rooms, "write window of {n} exceeds {rooms} free slot(s)");
        assert!(
            wr + n <= self.size + self.threshold,
            "write window of {n} at {wr} crosses the ring end beyond threshold {}",
            self.threshold
        );
        // Safety: range is in bounds (checked above) and only covers free
        // slots or their shadows, which no reader observes.
        unsafe { std::slice::from_raw_parts_mut(self.base().add(wr), n) }
    }

    /// Publishes `n` elements written through [`write_window`](Self::write_window).
    ///
    /// # Safety
    ///
    /// The caller must be the channel's only producer.
    ///
    /// # Panics
    ///
    /// If `n > rooms()`. That is a protocol violation, not a recoverable
    /// condition.
    pub unsafe fn commit_write(&self, n: usize) {
        let wr = self.wr.0.load(Ordering::Relaxed);
        let rooms = self.rooms();
        assert!(n <= rooms, "commit_write({n}) exceeds {rooms} free slot(s)");
        let end = wr + n;
        assert!(
            end <= self.size + self.threshold,
            "commit_write({n}) at {wr} runs past the shadow region"
        );

        let base = self.base();
        // Safety: every slot touched below belongs to the span being
        // published or to its shadow; no reader can observe either yet.
        unsafe {
            if end > self.size {
                // Overflow was written into the shadow; copy it to the front.
                std::ptr::copy_nonoverlapping(base.add(self.size), base, end - self.size);
            }
            let lo = wr;
            let hi = end.min(self.size).min(self.threshold);
            if lo < hi {
                std::ptr::copy_nonoverlapping(base.add(lo), base.add(self.size + lo), hi - lo);
            }
        }

        self.wr.0.store(end & self.mask, Ordering::Release);
        self.doorbell.ring();
    }

    /// The longest contiguous run of unread elements for `reader`, without
    /// crossing the ring end. May be shorter than `count(reader)`.
    ///
    /// # Safety
    ///
    /// The caller must be the only consumer of `reader` and must not use the
    /// slice after the next [`commit_read`](Self::commit_read) for `reader`.
    pub unsafe fn read_window(&self, reader: usize) -> &[T] {
        let rd = self.rd[reader].0.load(Ordering::Relaxed);
        let n = self.count(reader).min(self.size - rd);
        // Safety: committed, unread, in bounds.
        unsafe { std::slice::from_raw_parts(self.base().add(rd), n) }
    }

    /// The oldest `n` unread elements for `reader` as one slice.
    ///
    /// # Safety
    ///
    /// As for [`read_window`](Self::read_window).
    ///
    /// # Panics
    ///
    /// If `n > count(reader)`, or if the window would cross the ring end by
    /// more than `threshold`.
    pub unsafe fn read_window_n(&self, reader: usize, n: usize) -> &[T] {
        let rd = self.rd[reader].0.load(Ordering::Relaxed);
        let count = self.count(reader);
        assert!(n <= count, "read window of {n} exceeds {count} unread element(s)");
        assert!(
            rd + n <= self.size + self.threshold,
            "read window of {n} at {rd} crosses the ring end beyond threshold {}",
            self.threshold
        );
        // Safety: committed, unread; wrapped part is mirrored in the shadow.
        unsafe { std::slice::from_raw_parts(self.base().add(rd), n) }
    }

    /// Releases `n` elements read by `reader` back to the writer.
    ///
    /// # Safety
    ///
    /// The caller must be the only consumer of `reader`.
    ///
    /// # Panics
    ///
    /// If `n > count(reader)`.
    pub unsafe fn commit_read(&self, reader: usize, n: usize) {
        let rd = self.rd[reader].0.load(Ordering::Relaxed);
        let count = self.count(reader);
        assert!(n <= count, "commit_read({n}) exceeds {count} unread element(s)");
        self.rd[reader]
            .0
            .store((rd + n) & self.mask, Ordering::Release);
        self.doorbell.ring();
    }

    /// Blocks until `reader` has at least `n` unread elements or `timeout`
    /// elapses. Returns whether the condition holds.
    pub fn wait_for_count(&self, reader: usize, n: usize, timeout: Duration) -> bool {
        self.doorbell.wait_until(timeout, || self.count(reader) >= n)
    }

    /// Blocks until at least `n` slots are free or `timeout` elapses.
    pub fn wait_for_rooms(&self, n: usize, timeout: Duration) -> bool {
        self.doorbell.wait_until(timeout, || self.rooms() >= n)
    }
}

impl<T> std::fmt::Debug for RingChannel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RingChannel")
            .field("size", &self.size)
            .field("threshold", &self.threshold)
            .field("wr", &self.wr.0.load(Ordering::Relaxed))
            .field(
                "rd",
                &self
                    .rd
                    .iter()
                    .map(|rd| rd.0.load(Ordering::Relaxed))
                    .collect::<Vec<_>>(),
            )
            .finish_non_exhaustive()
    }
}
