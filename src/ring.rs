//! Single-producer/single-consumer byte ring buffer bridging the receive
//! path and the realtime audio callback. The writer (receiver context) and
//! the reader (audio callback) never take a lock; `write_idx`/`read_idx` are
//! the only shared mutable state, advanced with release/acquire ordering so
//! bytes written before the index bump are visible to the reader after it.
//!
//! `write`/`read_or_silence` take `&self`, not `&mut self`. The backing
//! storage lives behind an `UnsafeCell` so the buffer sits in a plain
//! `Arc<RingBuffer>` with no lock of any kind, matching
//! `examples/original_source/src/ring_buffer.c`.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Ring buffer overflow: the writer had fewer free bytes than it needed.
/// The caller drops the current decoded frame and logs; the stream is not
/// torn down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Overflow {
    pub requested: usize,
    pub free: usize,
}

pub struct RingBuffer {
    buf: UnsafeCell<Box<[u8]>>,
    capacity: usize,
    read_idx: AtomicUsize,
    write_idx: AtomicUsize,
}

// SAFETY: `write` and `read_or_silence` each touch only the region their own
// index arithmetic just proved is theirs to touch, and the caller must not
// call either from more than one thread at a time (the SPSC contract above).
unsafe impl Sync for RingBuffer {}

impl RingBuffer {
    /// `capacity` should be at least 8x the largest decoded frame the caller
    /// expects to write in one call.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be non-zero");
        Self {
            buf: UnsafeCell::new(vec![0u8; capacity].into_boxed_slice()),
            capacity,
            read_idx: AtomicUsize::new(0),
            write_idx: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Bytes currently available to read. Uses a reader-consistent snapshot:
    /// load `write_idx` first (acquire) so the following read of the ring
    /// contents observes everything the writer released.
    pub fn fill(&self) -> usize {
        let w = self.write_idx.load(Ordering::Acquire);
        let r = self.read_idx.load(Ordering::Relaxed);
        w.wrapping_sub(r)
    }

    pub fn free(&self) -> usize {
        self.capacity - self.fill()
    }

    /// Writes `data` into the ring, wrapping as needed. Returns
    /// `Err(Overflow)` without writing anything if there isn't room; the
    /// write index is only advanced on success.
    ///
    /// Single-producer only: must not be called from more than one thread
    /// concurrently.
    pub fn write(&self, data: &[u8]) -> Result<(), Overflow> {
        let free = self.free();
        if data.len() > free {
            return Err(Overflow {
                requested: data.len(),
                free,
            });
        }
        let w = self.write_idx.load(Ordering::Relaxed);
        let start = w % self.capacity;
        let first = (self.capacity - start).min(data.len());
        // SAFETY: sole writer, and `[start, start+data.len())` is free.
        let buf = unsafe { &mut *self.buf.get() };
        buf[start..start + first].copy_from_slice(&data[..first]);
        if first < data.len() {
            let rest = data.len() - first;
            buf[..rest].copy_from_slice(&data[first..]);
        }
        self.write_idx
            .store(w.wrapping_add(data.len()), Ordering::Release);
        Ok(())
    }

    /// Reads up to `out.len()` bytes into `out`, zero-filling any remainder
    /// with silence when fewer bytes than requested are available (the
    /// underrun-avoidance policy for the audio callback). Returns the number
    /// of bytes actually copied from the ring (the rest of `out` is zeroed).
    ///
    /// Single-consumer only: must not be called from more than one thread
    /// concurrently.
    pub fn read_or_silence(&self, out: &mut [u8]) -> usize {
        let fill = self.fill();
        let to_read = fill.min(out.len());
        let r = self.read_idx.load(Ordering::Relaxed);
        let start = r % self.capacity;
        let first = (self.capacity - start).min(to_read);
        // SAFETY: sole reader, and `[start, start+to_read)` holds bytes the
        // writer has already released.
        let buf = unsafe { &*self.buf.get() };
        out[..first].copy_from_slice(&buf[start..start + first]);
        if first < to_read {
            let rest = to_read - first;
            out[first..first + rest].copy_from_slice(&buf[..rest]);
        }
        if to_read < out.len() {
            out[to_read..].fill(0);
        }
        self.read_idx
            .store(r.wrapping_add(to_read), Ordering::Relaxed);
        to_read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn fill_and_free_always_sum_to_capacity() {
        let ring = RingBuffer::new(16);
        assert_eq!(ring.fill() + ring.free(), ring.capacity());
        ring.write(&[1, 2, 3, 4]).unwrap();
        assert_eq!(ring.fill() + ring.free(), ring.capacity());
        let mut out = [0u8; 2];
        ring.read_or_silence(&mut out);
        assert_eq!(ring.fill() + ring.free(), ring.capacity());
    }

    #[test]
    fn write_then_read_round_trips() {
        let ring = RingBuffer::new(8);
        ring.write(&[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        let n = ring.read_or_silence(&mut out);
        assert_eq!(n, 3);
        assert_eq!(out, [1, 2, 3]);
    }

    #[test]
    fn read_pads_with_silence_on_underrun() {
        let ring = RingBuffer::new(8);
        ring.write(&[9, 9]).unwrap();
        let mut out = [1u8; 5];
        let n = ring.read_or_silence(&mut out);
        assert_eq!(n, 2);
        assert_eq!(out, [9, 9, 0, 0, 0]);
    }

    #[test]
    fn overflow_is_reported_and_does_not_write() {
        let ring = RingBuffer::new(4);
        let err = ring.write(&[1, 2, 3, 4, 5]).unwrap_err();
        assert_eq!(err, Overflow { requested: 5, free: 4 });
        assert_eq!(ring.fill(), 0);
    }

    #[test]
    fn write_and_read_wrap_around() {
        let ring = RingBuffer::new(4);
        ring.write(&[1, 2, 3]).unwrap();
        let mut out = [0u8; 3];
        ring.read_or_silence(&mut out);
        // write_idx/read_idx are now at 3; the next write wraps.
        ring.write(&[4, 5, 6]).unwrap();
        let mut out2 = [0u8; 3];
        let n = ring.read_or_silence(&mut out2);
        assert_eq!(n, 3);
        assert_eq!(out2, [4, 5, 6]);
    }
}
