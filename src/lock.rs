//! Locking over words inside the shared region.
//!
//! Two lock families coexist, both built on plain `AtomicU32`s living in
//! the region so that every process mapping it shares them:
//!
//! * a map-wide readers/writer lock made of three words — `SHARED` (the
//!   readers-count mutex), `EXCLUSIVE` (the writer word), `READERS` (the
//!   reader count); readers-preference, writer-blocking;
//! * per-slot locks, one bit per slot in a bitmap of u32 words.
//!
//! Waiting is futex-style on the word's value. On Linux this is the real
//! futex syscall (non-PRIVATE, so waits pair up across processes); on other
//! platforms a yield loop keeps identical semantics at a performance cost.

use std::sync::atomic::{AtomicU32, Ordering};

#[cfg(target_os = "linux")]
mod futex {
    use std::sync::atomic::AtomicU32;

    pub fn wait(word: &AtomicU32, expected: u32) {
        // Returns on wake, spurious wake, EINTR or value mismatch; the
        // caller re-checks the word in a loop either way.
        unsafe {
            libc::syscall(
                libc::SYS_futex,
                word.as_ptr(),
                libc::FUTEX_WAIT,
                expected,
                std::ptr::null::<libc::timespec>(),
            );
        }
    }

    pub fn wake_one(word: &AtomicU32) {
        unsafe {
            libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, 1);
        }
    }

    pub fn wake_all(word: &AtomicU32) {
        unsafe {
            libc::syscall(libc::SYS_futex, word.as_ptr(), libc::FUTEX_WAKE, i32::MAX);
        }
    }
}

#[cfg(not(target_os = "linux"))]
mod futex {
    use std::sync::atomic::{AtomicU32, Ordering};

    pub fn wait(word: &AtomicU32, expected: u32) {
        if word.load(Ordering::Acquire) == expected {
            std::thread::yield_now();
        }
    }

    pub fn wake_one(_word: &AtomicU32) {}

    pub fn wake_all(_word: &AtomicU32) {}
}

/// Acquire a mutex word: flip 0 → 1, waiting on the word while contended.
fn acquire(word: &AtomicU32) {
    loop {
        match word.compare_exchange(0, 1, Ordering::Acquire, Ordering::Relaxed) {
            Ok(_) => return,
            Err(seen) => futex::wait(word, seen),
        }
    }
}

/// Release a mutex word and wake one waiter.
fn release(word: &AtomicU32) {
    word.store(0, Ordering::Release);
    futex::wake_one(word);
}

/// A view of the map-lock triple and the slot-lock bitmap.
///
/// Constructed per call from region pointers, like a lock handle rather
/// than an owner; all state lives in the region itself.
pub struct Locks<'a> {
    slots: &'a [AtomicU32],
    shared: &'a AtomicU32,
    exclusive: &'a AtomicU32,
    readers: &'a AtomicU32,
}

impl<'a> Locks<'a> {
    pub fn new(
        slots: &'a [AtomicU32],
        shared: &'a AtomicU32,
        exclusive: &'a AtomicU32,
        readers: &'a AtomicU32,
    ) -> Self {
        Locks {
            slots,
            shared,
            exclusive,
            readers,
        }
    }

    /// Block other workers entirely. Deleters, `clear` and the deadlock
    /// escalation path take this; everyone else reads shared.
    pub fn lock_exclusive(&self) {
        acquire(self.exclusive);
    }

    pub fn unlock_exclusive(&self) {
        release(self.exclusive);
    }

    /// The first reader in also takes `EXCLUSIVE`, so writers wait until
    /// the last reader is out.
    pub fn lock_shared(&self) {
        acquire(self.shared);
        if self.readers.fetch_add(1, Ordering::AcqRel) == 0 {
            acquire(self.exclusive);
        }
        release(self.shared);
    }

    pub fn unlock_shared(&self) {
        acquire(self.shared);
        if self.readers.fetch_sub(1, Ordering::AcqRel) == 1 {
            release(self.exclusive);
        }
        release(self.shared);
    }

    /// Acquire slot `index`'s bit, waiting on the bitmap word while some
    /// other worker holds it.
    pub fn lock_slot(&self, index: u32) {
        let word = &self.slots[(index / 32) as usize];
        let bit = 1u32 << (index % 32);
        loop {
            let seen = word.fetch_or(bit, Ordering::Acquire);
            if seen & bit == 0 {
                return;
            }
            futex::wait(word, seen | bit);
        }
    }

    /// Release slot `index`'s bit.
    ///
    /// Panics if the bit was not set: releasing a lock that is not held
    /// means the engine's bookkeeping has desynced, and nothing down the
    /// line can be trusted.
    pub fn unlock_slot(&self, index: u32) {
        let word = &self.slots[(index / 32) as usize];
        let bit = 1u32 << (index % 32);
        let seen = word.fetch_and(!bit, Ordering::Release);
        assert!(seen & bit != 0, "released slot {index} without holding its lock");
        // Waiters for any bit sleep on the whole word.
        futex::wake_all(word);
    }

    /// Move the held traversal lock from `old` to `new`, acquiring the new
    /// slot before releasing the old one.
    ///
    /// The new slot must come strictly later in slot order; that total
    /// order is what makes concurrent traversals deadlock-free. Returns
    /// `false` without touching either lock when the rule would be
    /// violated — the caller escalates to the exclusive map lock instead.
    #[must_use]
    pub fn slide_slot(&self, old: u32, new: u32) -> bool {
        if new <= old {
            return false;
        }
        self.lock_slot(new);
        self.unlock_slot(old);
        true
    }
}
