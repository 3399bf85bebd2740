//! The externally visible "latest" frame and the reader lease protocol.
//!
//! The producer swaps a finished back buffer into the latest slot only when
//! no reader holds a lease. Readers never block the producer: an
//! outstanding lease simply vetoes the publish and the frame is dropped.

use std::ops::Deref;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard};

use tracing::trace;

use crate::error::{BridgeError, BridgeResult};
use crate::frame::FrameDescriptor;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PublishOutcome {
    Published { frame_count: u64 },
    /// Vetoed by outstanding leases. The back buffer is left untouched.
    Dropped { readers: usize },
}

#[derive(Debug, Default)]
pub struct FrameExchange {
    latest: Mutex<Vec<u8>>,
    readers: AtomicUsize,
    width: AtomicU32,
    height: AtomicU32,
    frame_count: AtomicU64,
}

impl FrameExchange {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock_latest(&self) -> MutexGuard<'_, Vec<u8>> {
        match self.latest.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Swaps `back` into the latest slot if no lease is outstanding.
    ///
    /// On success `back` receives the previous latest buffer, which the
    /// producer reuses as scratch for the next frame.
    pub fn publish(&self, back: &mut Vec<u8>, width: u32, height: u32) -> PublishOutcome {
        let readers = self.readers.load(Ordering::Acquire);
        if readers > 0 {
            trace!(readers, "frame dropped: readers active");
            return PublishOutcome::Dropped { readers };
        }

        let mut latest = self.lock_latest();
        // A lease may have been taken between the optimistic check and the lock.
        let readers = self.readers.load(Ordering::Acquire);
        if readers > 0 {
            trace!(readers, "frame dropped: reader arrived before swap");
            return PublishOutcome::Dropped { readers };
        }

        std::mem::swap(&mut *latest, back);
        self.width.store(width, Ordering::Release);
        self.height.store(height, Ordering::Release);
        let frame_count = self.frame_count.fetch_add(1, Ordering::AcqRel) + 1;
        PublishOutcome::Published { frame_count }
    }

    /// Number of successful publishes so far. Readable without the lock.
    pub fn frame_count(&self) -> u64 {
        self.frame_count.load(Ordering::Acquire)
    }

    pub fn reader_count(&self) -> usize {
        self.readers.load(Ordering::Acquire)
    }

    fn descriptor_locked(&self, latest: &[u8]) -> BridgeResult<FrameDescriptor> {
        if latest.is_empty() {
            return Err(BridgeError::NoFrame);
        }
        Ok(FrameDescriptor::bgra(
            self.width.load(Ordering::Acquire),
            self.height.load(Ordering::Acquire),
        ))
    }

    /// Dimensions and byte size of the latest frame, without taking a lease.
    pub fn peek(&self) -> BridgeResult<(FrameDescriptor, usize)> {
        let latest = self.lock_latest();
        let descriptor = self.descriptor_locked(&latest)?;
        Ok((descriptor, latest.len()))
    }

    /// Copies the latest frame into `dst`. Fails without writing anything
    /// when `dst` is shorter than the frame.
    pub fn copy_out(&self, dst: &mut [u8]) -> BridgeResult<FrameDescriptor> {
        let latest = self.lock_latest();
        let descriptor = self.descriptor_locked(&latest)?;
        if dst.len() < latest.len() {
            return Err(BridgeError::BufferTooSmall {
                required: latest.len(),
                width: descriptor.width,
                height: descriptor.height,
            });
        }
        dst[..latest.len()].copy_from_slice(&latest);
        Ok(descriptor)
    }

    /// Takes a lease on the latest frame. The referenced bytes stay stable
    /// until the lease is dropped.
    pub fn acquire(&self) -> BridgeResult<FrameLease<'_>> {
        let raw = self.acquire_raw()?;
        Ok(FrameLease {
            exchange: self,
            raw,
        })
    }

    /// Takes a lease that must be returned with [`FrameExchange::release`].
    ///
    /// The pointer stays valid until the matching release, or until the
    /// exchange itself is dropped.
    pub fn acquire_raw(&self) -> BridgeResult<RawLease> {
        let latest = self.lock_latest();
        let descriptor = self.descriptor_locked(&latest)?;
        self.readers.fetch_add(1, Ordering::AcqRel);
        Ok(RawLease {
            ptr: latest.as_ptr(),
            len: latest.len(),
            descriptor,
        })
    }

    /// Returns one lease. Extra releases are ignored rather than wrapping
    /// the count.
    pub fn release(&self) {
        let _ = self
            .readers
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |readers| {
                readers.checked_sub(1)
            });
    }
}

/// An unmanaged lease handed across the C boundary.
#[derive(Clone, Copy, Debug)]
pub struct RawLease {
    pub ptr: *const u8,
    pub len: usize,
    pub descriptor: FrameDescriptor,
}

/// A lease on the latest frame. Dereferences to the frame bytes and
/// releases itself on drop.
#[derive(Debug)]
pub struct FrameLease<'a> {
    exchange: &'a FrameExchange,
    raw: RawLease,
}

impl FrameLease<'_> {
    pub fn descriptor(&self) -> FrameDescriptor {
        self.raw.descriptor
    }
}

impl Deref for FrameLease<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        // SAFETY: `raw` points into the latest buffer, which `publish` will not
        // swap out while this lease keeps the reader count above zero, and the
        // borrow of `exchange` keeps the buffer's owner alive.
        unsafe { std::slice::from_raw_parts(self.raw.ptr, self.raw.len) }
    }
}

impl Drop for FrameLease<'_> {
    fn drop(&mut self) {
        self.exchange.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn frame(width: u32, height: u32, fill: u8) -> Vec<u8> {
        vec![fill; width as usize * height as usize * 4]
    }

    #[test]
    fn empty_exchange_reports_no_frame() {
        let exchange = FrameExchange::new();
        assert!(matches!(exchange.peek(), Err(BridgeError::NoFrame)));
        assert!(matches!(exchange.acquire(), Err(BridgeError::NoFrame)));
        assert!(matches!(
            exchange.copy_out(&mut [0u8; 16]),
            Err(BridgeError::NoFrame)
        ));
        assert_eq!(exchange.reader_count(), 0);
        assert_eq!(exchange.frame_count(), 0);
    }

    #[test]
    fn publish_swaps_buffers_and_counts() {
        let exchange = FrameExchange::new();
        let mut back = frame(2, 2, 7);
        assert_eq!(
            exchange.publish(&mut back, 2, 2),
            PublishOutcome::Published { frame_count: 1 }
        );
        assert!(back.is_empty(), "previous latest moves into the back buffer");

        let mut back = frame(3, 1, 9);
        assert_eq!(
            exchange.publish(&mut back, 3, 1),
            PublishOutcome::Published { frame_count: 2 }
        );
        assert_eq!(back, frame(2, 2, 7));

        let (descriptor, size) = exchange.peek().unwrap();
        assert_eq!(descriptor, FrameDescriptor::bgra(3, 1));
        assert_eq!(size, 12);
    }

    #[test]
    fn copy_out_rejects_short_destination_without_writing() {
        let exchange = FrameExchange::new();
        exchange.publish(&mut frame(4, 4, 0xAB), 4, 4);

        let mut short = vec![0u8; 63];
        match exchange.copy_out(&mut short) {
            Err(BridgeError::BufferTooSmall {
                required,
                width,
                height,
            }) => {
                assert_eq!((required, width, height), (64, 4, 4));
            }
            other => panic!("unexpected result: {other:?}"),
        }
        assert!(short.iter().all(|byte| *byte == 0));

        let mut exact = vec![0u8; 64];
        assert_eq!(
            exchange.copy_out(&mut exact).unwrap(),
            FrameDescriptor::bgra(4, 4)
        );
        assert!(exact.iter().all(|byte| *byte == 0xAB));
    }

    #[test]
    fn lease_blocks_publish_until_dropped() {
        let exchange = FrameExchange::new();
        exchange.publish(&mut frame(2, 2, 1), 2, 2);

        let lease = exchange.acquire().unwrap();
        let leased_ptr = lease.as_ptr();
        assert_eq!(exchange.reader_count(), 1);

        let mut next = frame(2, 2, 2);
        assert_eq!(
            exchange.publish(&mut next, 2, 2),
            PublishOutcome::Dropped { readers: 1 }
        );
        assert_eq!(exchange.frame_count(), 1);
        assert_eq!(lease.as_ptr(), leased_ptr);
        assert!(lease.iter().all(|byte| *byte == 1));
        assert_eq!(next, frame(2, 2, 2), "vetoed publish leaves back buffer intact");

        drop(lease);
        assert_eq!(exchange.reader_count(), 0);
        assert_eq!(
            exchange.publish(&mut next, 2, 2),
            PublishOutcome::Published { frame_count: 2 }
        );
    }

    #[test]
    fn concurrent_leases_share_one_buffer() {
        let exchange = FrameExchange::new();
        exchange.publish(&mut frame(1, 1, 5), 1, 1);
        let first = exchange.acquire().unwrap();
        let second = exchange.acquire().unwrap();
        assert_eq!(exchange.reader_count(), 2);
        assert_eq!(first.as_ptr(), second.as_ptr());
        assert_eq!(first.descriptor(), FrameDescriptor::bgra(1, 1));
        drop(first);
        assert_eq!(exchange.reader_count(), 1);
        drop(second);
        assert_eq!(exchange.reader_count(), 0);
    }

    #[test]
    fn stray_release_saturates_at_zero() {
        let exchange = FrameExchange::new();
        exchange.release();
        assert_eq!(exchange.reader_count(), 0);

        exchange.publish(&mut frame(1, 1, 0), 1, 1);
        let raw = exchange.acquire_raw().unwrap();
        assert_eq!(raw.len, 4);
        exchange.release();
        exchange.release();
        assert_eq!(exchange.reader_count(), 0);
    }

    #[test]
    fn leased_bytes_never_change_under_concurrent_publishers() {
        let exchange = Arc::new(FrameExchange::new());
        exchange.publish(&mut frame(8, 8, 0), 8, 8);

        let producer = {
            let exchange = Arc::clone(&exchange);
            std::thread::spawn(move || {
                let mut back = Vec::new();
                for fill in 1..=200u8 {
                    back.clear();
                    back.resize(8 * 8 * 4, fill);
                    exchange.publish(&mut back, 8, 8);
                }
            })
        };

        for _ in 0..200 {
            if let Ok(lease) = exchange.acquire() {
                let first = lease[0];
                std::thread::yield_now();
                assert!(lease.iter().all(|byte| *byte == first));
            }
        }
        producer.join().unwrap();
        assert_eq!(exchange.reader_count(), 0);
    }
}
