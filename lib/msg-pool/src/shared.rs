// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Interrupt/main-loop mediation for a [`MsgPool`].
//!
//! The pool is shared between exactly two contexts on one CPU: the receive
//! interrupt and the cooperative main loop. The masking primitive is the
//! `critical-section` crate; the platform crate provides its implementation
//! on a real target, and host tests use the crate's `std` implementation.
//!
//! The handler side does not mask again; running in the handler *is* the
//! critical section, and the caller proves it by presenting the
//! [`CriticalSection`] token it already holds. The main-loop side masks for
//! the duration of one closure. That makes every pool operation atomic from
//! both sides, including the whole of the TX insert protocol; no operation
//! here opens a mid-operation interrupt window, trading a few microseconds
//! of interrupt latency for state that is never observable half-moved.

use core::cell::RefCell;

use critical_section::{CriticalSection, Mutex};

use crate::MsgPool;

/// A [`MsgPool`] shareable between the receive interrupt and the main loop.
pub struct SharedPool<C, const N: usize, const M: usize> {
    inner: Mutex<RefCell<MsgPool<C, N, M>>>,
}

impl<C: Copy + PartialEq, const N: usize, const M: usize> Default for SharedPool<C, N, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Copy + PartialEq, const N: usize, const M: usize> SharedPool<C, N, M> {
    /// An empty pool, suitable for a `static`.
    pub const fn new() -> Self {
        Self {
            inner: Mutex::new(RefCell::new(MsgPool::new())),
        }
    }

    /// Handler-side access. The caller attests it is running with interrupts
    /// masked by holding `cs`; no further masking happens.
    pub fn with_isr<R>(
        &self,
        cs: CriticalSection<'_>,
        f: impl FnOnce(&mut MsgPool<C, N, M>) -> R,
    ) -> R {
        f(&mut self.inner.borrow_ref_mut(cs))
    }

    /// Main-loop-side access: masks interrupts around `f`.
    pub fn with<R>(&self, f: impl FnOnce(&mut MsgPool<C, N, M>) -> R) -> R {
        critical_section::with(|cs| f(&mut self.inner.borrow_ref_mut(cs)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use frame::Header;

    #[test]
    fn both_handles_reach_the_same_pool() {
        let pool = SharedPool::<u16, 1024, 10>::new();

        // Byte reception from the "handler" side...
        critical_section::with(|cs| {
            pool.with_isr(cs, |p| {
                for byte in 0..14 {
                    p.push_byte(byte);
                }
                p.header_received(true, 2);
                p.end_msg();
            });
        });

        // ...is visible from the main-loop side.
        let (offset, dropped) = pool.with(|p| {
            let msg = p.pop_rx().unwrap();
            (msg.offset(), p.stats().drop_count)
        });
        assert_eq!(offset, 0);
        assert_eq!(dropped, 0);
    }

    #[test]
    fn injection_round_trips() {
        let pool = SharedPool::<u16, 1024, 10>::new();
        let header = Header::new(3, 0, 9, 0x42, 2);

        pool.with(|p| p.push_message(&header, &[0xAA, 0xBB]));
        pool.with(|p| {
            let msg = p.pop_rx().unwrap();
            assert_eq!(&p.msg_bytes(msg)[8..], &[0xAA, 0xBB]);
        });
    }
}
