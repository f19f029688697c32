//! Sequence lock for 64-bit values.
//!
//! Readers retry instead of blocking; a single writer (serialized externally)
//! is never delayed by readers. The value is stored as two 32-bit atomics so
//! that reads stay lock-free on 32-bit hosts where `AtomicU64` is not.

use std::sync::atomic::{fence, AtomicU32, Ordering};

/// Values storable in a [`Seqlock`].
pub trait SeqValue: Copy {
    fn to_bits(self) -> u64;
    fn from_bits(bits: u64) -> Self;
}

impl SeqValue for u64 {
    fn to_bits(self) -> u64 {
        self
    }
    fn from_bits(bits: u64) -> Self {
        bits
    }
}

impl SeqValue for i64 {
    fn to_bits(self) -> u64 {
        self as u64
    }
    fn from_bits(bits: u64) -> Self {
        bits as i64
    }
}

/// Versioned 64-bit cell with non-blocking reads.
pub struct Seqlock<T: SeqValue> {
    seq: AtomicU32,
    lo: AtomicU32,
    hi: AtomicU32,
    _marker: std::marker::PhantomData<T>,
}

impl<T: SeqValue> Seqlock<T> {
    pub fn new(value: T) -> Self {
        let bits = value.to_bits();
        Self {
            seq: AtomicU32::new(0),
            lo: AtomicU32::new(bits as u32),
            hi: AtomicU32::new((bits >> 32) as u32),
            _marker: std::marker::PhantomData,
        }
    }

    /// Tries to read the value without waiting.
    ///
    /// Returns `None` if a concurrent store is in progress.
    pub fn try_load(&self) -> Option<T> {
        let seq1 = self.seq.load(Ordering::Acquire);
        if seq1 & 1 != 0 {
            return None;
        }
        let lo = self.lo.load(Ordering::Relaxed);
        let hi = self.hi.load(Ordering::Relaxed);
        fence(Ordering::Acquire);
        let seq2 = self.seq.load(Ordering::Relaxed);
        if seq1 != seq2 {
            return None;
        }
        Some(T::from_bits((lo as u64) | ((hi as u64) << 32)))
    }

    /// Reads the value, spinning through concurrent stores.
    pub fn wait_load(&self) -> T {
        loop {
            if let Some(value) = self.try_load() {
                return value;
            }
            std::hint::spin_loop();
        }
    }

    /// Stores a new value.
    ///
    /// Callers must serialize stores externally (the writers in this crate
    /// hold a mutex or run on a single thread).
    pub fn exclusive_store(&self, value: T) {
        let bits = value.to_bits();
        let seq = self.seq.load(Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.lo.store(bits as u32, Ordering::Relaxed);
        self.hi.store((bits >> 32) as u32, Ordering::Relaxed);
        self.seq.store(seq.wrapping_add(2), Ordering::Release);
    }
}
