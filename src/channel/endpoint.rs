// src/channel/endpoint.rs

//! Typed ports over a [`RingChannel`].
//!
//! `ring()` hands out exactly one [`WritePort`] and one [`ReadPort`] per
//! reader. Neither is `Clone`, so each cursor has exactly one owner, and
//! windows borrow the port so they cannot outlive the next commit.

use std::sync::Arc;
use std::time::Duration;

use crate::channel::RingChannel;
use crate::error::ChannelError;

/// Create a channel with `size` slots, a `threshold`-slot shadow region and
/// `readers` read ports.
///
/// # Errors
///
/// See [`RingChannel::new`].
pub fn ring<T: Copy + Default>(
    size: usize,
    threshold: usize,
    readers: usize,
) -> Result<(WritePort<T>, Vec<ReadPort<T>>), ChannelError> {
    let channel = Arc::new(RingChannel::new(size, threshold, readers)?);
    let read_ports = (0..readers)
        .map(|id| ReadPort {
            channel: Arc::clone(&channel),
            id,
        })
        .collect();
    Ok((WritePort { channel }, read_ports))
}

/// Producer end of a channel.
pub struct WritePort<T> {
    channel: Arc<RingChannel<T>>,
}

impl<T: Copy> WritePort<T> {
    #[must_use]
    pub fn rooms(&self) -> usize {
        self.channel.rooms()
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.channel.capacity()
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.channel.threshold()
    }

    /// Shared view of the channel, for inspection only.
    #[must_use]
    pub fn channel(&self) -> &Arc<RingChannel<T>> {
        &self.channel
    }

    /// Claims the next `n` free slots as one slice.
    ///
    /// # Panics
    ///
    /// If `n > rooms()`, or `n > threshold()` when the window crosses the end
    /// of the ring.
    pub fn write_window(&mut self, n: usize) -> &mut [T] {
        // Safety: this port is the channel's only producer and the slice
        // borrows `self`, so it is gone before the next commit.
        unsafe { self.channel.write_window(n) }
    }

    /// Publishes `n` elements written through [`write_window`](Self::write_window).
    ///
    /// # Panics
    ///
    /// If `n > rooms()`.
    pub fn commit_write(&mut self, n: usize) {
        // Safety: only producer.
        unsafe { self.channel.commit_write(n) }
    }

    /// Copies as much of `src` as fits and commits it. Returns the number of
    /// elements written.
    pub fn write(&mut self, src: &[T]) -> usize {
        let mut done = 0;
        while done < src.len() {
            let to_end = self.channel.size() - self.channel.write_cursor();
            let n = (src.len() - done).min(self.rooms()).min(to_end);
            if n == 0 {
                break;
            }
            self.write_window(n).copy_from_slice(&src[done..done + n]);
            self.commit_write(n);
            done += n;
        }
        done
    }

    /// Blocks until `n` slots are free or `timeout` elapses.
    pub fn wait_for_rooms(&self, n: usize, timeout: Duration) -> bool {
        self.channel.wait_for_rooms(n, timeout)
    }
}

impl<T> std::fmt::Debug for WritePort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WritePort")
            .field("channel", &self.channel)
            .finish()
    }
}

/// Consumer end of a channel, bound to one reader id.
pub struct ReadPort<T> {
    channel: Arc<RingChannel<T>>,
    id: usize,
}

impl<T: Copy> ReadPort<T> {
    #[must_use]
    pub fn id(&self) -> usize {
        self.id
    }

    #[must_use]
    pub fn count(&self) -> usize {
        self.channel.count(self.id)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.channel.capacity()
    }

    #[must_use]
    pub fn threshold(&self) -> usize {
        self.channel.threshold()
    }

    /// Oldest unread elements, up to the end of the ring.
    #[must_use]
    pub fn read_window(&self) -> &[T] {
        // Safety: this port is the only consumer of `id`; `commit_read`
        // needs `&mut self`, so the slice is gone before the cursor moves.
        unsafe { self.channel.read_window(self.id) }
    }

    /// Oldest `n` unread elements as one slice.
    ///
    /// # Panics
    ///
    /// If `n > count()`, or `n > threshold()` when the window crosses the end
    /// of the ring.
    #[must_use]
    pub fn read_window_n(&self, n: usize) -> &[T] {
        // Safety: as for `read_window`.
        unsafe { self.channel.read_window_n(self.id, n) }
    }

    /// Releases `n` elements back to the writer.
    ///
    /// # Panics
    ///
    /// If `n > count()`.
    pub fn commit_read(&mut self, n: usize) {
        // Safety: only consumer of `id`.
        unsafe { self.channel.commit_read(self.id, n) }
    }

    /// Copies up to `dst.len()` unread elements into `dst` and commits them.
    /// Returns the number of elements read.
    pub fn read(&mut self, dst: &mut [T]) -> usize {
        let mut done = 0;
        while done < dst.len() {
            let window = self.read_window();
            let n = window.len().min(dst.len() - done);
            if n == 0 {
                break;
            }
            dst[done..done + n].copy_from_slice(&window[..n]);
            self.commit_read(n);
            done += n;
        }
        done
    }

    /// Blocks until `n` elements are unread or `timeout` elapses.
    pub fn wait_for_count(&self, n: usize, timeout: Duration) -> bool {
        self.channel.wait_for_count(self.id, n, timeout)
    }
}

impl<T> std::fmt::Debug for ReadPort<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReadPort")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Instant;
    use test_log::test;

    #[test]
    fn ring_hands_out_one_port_per_reader() {
        let (_tx, rxs) = ring::<u8>(8, 4, 3).unwrap();
        let ids: Vec<_> = rxs.iter().map(ReadPort::id).collect();
        assert_eq!(ids, vec![0, 1, 2]);
    }

    #[test]
    fn write_and_read_split_at_ring_end() {
        let (mut tx, mut rxs) = ring::<u32>(8, 2, 1).unwrap();
        let rx = &mut rxs[0];

        assert_eq!(tx.write(&[1, 2, 3, 4, 5, 6]), 6);
        let mut sink = [0u32; 6];
        assert_eq!(rx.read(&mut sink), 6);

        // Longer than threshold across the end: split into two commits.
        assert_eq!(tx.write(&[7, 8, 9, 10, 11]), 5);
        let mut out = [0u32; 5];
        assert_eq!(rx.read(&mut out), 5);
        assert_eq!(out, [7, 8, 9, 10, 11]);
        assert_eq!(rx.count(), 0);
    }

    #[test]
    fn write_stops_at_rooms() {
        let (mut tx, rxs) = ring::<u8>(4, 2, 1).unwrap();
        assert_eq!(tx.write(&[1, 2, 3, 4, 5]), 3);
        assert_eq!(tx.rooms(), 0);
        assert_eq!(rxs[0].count(), 3);
    }

    #[test]
    fn window_then_commit() {
        let (mut tx, mut rxs) = ring::<u8>(8, 4, 1).unwrap();
        tx.write_window(3).copy_from_slice(b"abc");
        assert_eq!(rxs[0].count(), 0, "uncommitted data must be invisible");
        tx.commit_write(3);

        let rx = &mut rxs[0];
        assert_eq!(rx.read_window(), b"abc");
        assert_eq!(rx.read_window_n(2), b"ab");
        rx.commit_read(2);
        assert_eq!(rx.read_window(), b"c");
    }

    #[test]
    fn wait_for_count_wakes_on_commit() {
        let (mut tx, rxs) = ring::<u8>(16, 4, 1).unwrap();
        let rx = rxs.into_iter().next().unwrap();

        let waiter = thread::spawn(move || {
            let start = Instant::now();
            let ready = rx.wait_for_count(4, Duration::from_secs(5));
            (ready, start.elapsed(), rx.count())
        });

        thread::sleep(Duration::from_millis(20));
        tx.write(&[1, 2]);
        thread::sleep(Duration::from_millis(20));
        tx.write(&[3, 4]);

        let (ready, elapsed, count) = waiter.join().unwrap();
        assert!(ready);
        assert_eq!(count, 4);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn wait_for_rooms_times_out_when_reader_stalls() {
        let (mut tx, _rxs) = ring::<u8>(4, 2, 1).unwrap();
        tx.write(&[1, 2, 3]);
        let start = Instant::now();
        assert!(!tx.wait_for_rooms(1, Duration::from_millis(30)));
        assert!(start.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn wait_for_rooms_wakes_on_read() {
        let (mut tx, rxs) = ring::<u8>(4, 2, 1).unwrap();
        tx.write(&[1, 2, 3]);
        let mut rx = rxs.into_iter().next().unwrap();

        let reader = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            rx.commit_read(2);
        });
        assert!(tx.wait_for_rooms(2, Duration::from_secs(5)));
        reader.join().unwrap();
    }
}
