//! Writer/reader epoch phaser
//!
//! Coordinates many concurrent writers with a single flipping reader without
//! ever making a writer wait. Writers bracket their work in a critical section
//! that costs two uncontended atomic adds. The reader flips the phase and then
//! waits only for writers that entered *before* the flip to leave; writers that
//! enter afterwards land in the new phase and are never waited on.
//!
//! # Protocol
//!
//! ```text
//! start_epoch   even phase: counts up from 0
//!               odd phase:  counts up from i64::MIN
//!
//! writer:  e = start_epoch.fetch_add(1)     // enter, e < 0 means odd phase
//!          ... write ...
//!          (e < 0 ? odd_end : even_end).fetch_add(1)   // exit
//!
//! reader:  reset the next phase's end counter
//!          value_at_flip = start_epoch.swap(next phase start)
//!          wait until the old phase's end counter == value_at_flip
//! ```
//!
//! The registry swaps its active generation *before* calling
//! [`Phaser::flip_phase`], so once the flip returns no writer can still be
//! touching the generation that just became inactive.

use crossbeam::utils::{Backoff, CachePadded};
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Mutex, MutexGuard};

/// Epoch counters shared by writers and the flipping reader
#[derive(Debug)]
pub struct Phaser {
    start_epoch: CachePadded<AtomicI64>,
    even_end_epoch: CachePadded<AtomicI64>,
    odd_end_epoch: CachePadded<AtomicI64>,
    reader_lock: Mutex<()>,
}

/// Guard for a writer critical section; leaving the section is `Drop`
#[must_use = "dropping the guard immediately ends the critical section"]
#[derive(Debug)]
pub struct WriterGuard<'a> {
    phaser: &'a Phaser,
    epoch: i64,
}

/// Proof that the caller holds the reader role
pub struct ReaderGuard<'a> {
    _lock: MutexGuard<'a, ()>,
}

impl Phaser {
    pub fn new() -> Self {
        Self {
            start_epoch: CachePadded::new(AtomicI64::new(0)),
            even_end_epoch: CachePadded::new(AtomicI64::new(0)),
            odd_end_epoch: CachePadded::new(AtomicI64::new(i64::MIN)),
            reader_lock: Mutex::new(()),
        }
    }

    /// Enter a writer critical section (wait-free)
    #[inline]
    pub fn writer_enter(&self) -> WriterGuard<'_> {
        let epoch = self.start_epoch.fetch_add(1, Ordering::SeqCst);
        WriterGuard {
            phaser: self,
            epoch,
        }
    }

    /// Acquire the reader role; only one reader may flip at a time
    pub fn reader_lock(&self) -> ReaderGuard<'_> {
        // The lock guards no data, so a poisoned lock is still usable.
        let lock = self
            .reader_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        ReaderGuard { _lock: lock }
    }

    /// Flip the phase and wait for every writer of the previous phase to exit
    ///
    /// Writers that enter after the flip are not waited for.
    pub fn flip_phase(&self, _reader: &ReaderGuard<'_>) {
        let next_phase_is_even = self.start_epoch.load(Ordering::SeqCst) < 0;

        let initial_start_value = if next_phase_is_even { 0 } else { i64::MIN };
        if next_phase_is_even {
            self.even_end_epoch
                .store(initial_start_value, Ordering::SeqCst);
        } else {
            self.odd_end_epoch
                .store(initial_start_value, Ordering::SeqCst);
        }

        let value_at_flip = self
            .start_epoch
            .swap(initial_start_value, Ordering::SeqCst);

        let previous_end = if next_phase_is_even {
            &self.odd_end_epoch
        } else {
            &self.even_end_epoch
        };

        let backoff = Backoff::new();
        while previous_end.load(Ordering::SeqCst) != value_at_flip {
            backoff.snooze();
        }
    }

    /// True while the phaser is in its even phase
    pub fn is_even_phase(&self) -> bool {
        self.start_epoch.load(Ordering::SeqCst) >= 0
    }
}

impl Default for Phaser {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for WriterGuard<'_> {
    #[inline]
    fn drop(&mut self) {
        if self.epoch < 0 {
            self.phaser.odd_end_epoch.fetch_add(1, Ordering::SeqCst);
        } else {
            self.phaser.even_end_epoch.fetch_add(1, Ordering::SeqCst);
        }
    }
}
