//! Per-worker memory arena.
//!
//! Handlers charge the bytes they hold against the arena. Charges are
//! released when the returned lease drops, so the arena always reflects what
//! the worker currently holds, and exceeding the limit surfaces as
//! `ResourceExhausted` instead of unbounded growth.

use std::sync::atomic::{AtomicUsize, Ordering};

use crate::error::WorkerError;

/// Accounting arena with a hard byte limit.
#[derive(Debug)]
pub struct MemoryArena {
    limit: usize,
    used: AtomicUsize,
    peak: AtomicUsize,
}

impl MemoryArena {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            used: AtomicUsize::new(0),
            peak: AtomicUsize::new(0),
        }
    }

    /// Reserve `bytes`; fails without reserving anything if the limit would
    /// be exceeded.
    pub fn charge(&self, bytes: usize) -> Result<ArenaLease<'_>, WorkerError> {
        let limit = self.limit;
        let updated = self
            .used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|next| *next <= limit)
            });

        match updated {
            Ok(previous) => {
                self.peak.fetch_max(previous + bytes, Ordering::AcqRel);
                Ok(ArenaLease { arena: self, bytes })
            }
            Err(used) => Err(WorkerError::ResourceExhausted(format!(
                "memory arena: {bytes} bytes requested with {used} of {limit} in use"
            ))),
        }
    }

    /// Allocate a zeroed buffer charged against the arena.
    pub fn alloc(&self, len: usize) -> Result<ArenaBuffer<'_>, WorkerError> {
        let lease = self.charge(len)?;
        Ok(ArenaBuffer {
            data: vec![0u8; len],
            _lease: lease,
        })
    }

    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::Acquire)
    }

    pub fn limit(&self) -> usize {
        self.limit
    }
}

/// A reservation that returns its bytes to the arena on drop.
#[derive(Debug)]
pub struct ArenaLease<'a> {
    arena: &'a MemoryArena,
    bytes: usize,
}

impl ArenaLease<'_> {
    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for ArenaLease<'_> {
    fn drop(&mut self) {
        self.arena.used.fetch_sub(self.bytes, Ordering::AcqRel);
    }
}

/// Byte buffer owned by the worker and charged to its arena.
#[derive(Debug)]
pub struct ArenaBuffer<'a> {
    data: Vec<u8>,
    _lease: ArenaLease<'a>,
}

impl std::ops::Deref for ArenaBuffer<'_> {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::DerefMut for ArenaBuffer<'_> {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn charge_and_release() {
        let arena = MemoryArena::new(1_000);
        {
            let a = arena.charge(600).unwrap();
            assert_eq!(a.bytes(), 600);
            assert_eq!(arena.used(), 600);
            let _b = arena.charge(400).unwrap();
            assert_eq!(arena.used(), 1_000);
        }
        assert_eq!(arena.used(), 0);
        assert_eq!(arena.peak(), 1_000);
    }

    #[test]
    fn over_limit_is_resource_exhausted() {
        let arena = MemoryArena::new(100);
        let _held = arena.charge(80).unwrap();
        let err = arena.charge(21).unwrap_err();
        assert!(matches!(err, WorkerError::ResourceExhausted(_)));
        // Failed charge reserves nothing.
        assert_eq!(arena.used(), 80);
    }

    #[test]
    fn buffers_are_charged() {
        let arena = MemoryArena::new(64);
        let mut buf = arena.alloc(32).unwrap();
        buf[0] = 7;
        assert_eq!(buf.len(), 32);
        assert_eq!(arena.used(), 32);
        drop(buf);
        assert_eq!(arena.used(), 0);
        assert!(arena.alloc(65).is_err());
    }
}
