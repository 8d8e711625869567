// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Zero-copy message pool for an interrupt-driven bus stack.
//!
//! All message traffic, inbound and outbound, lives in one fixed byte arena.
//! The receive interrupt writes frames into it a byte at a time; completed
//! records are *indexed*, never copied, by three bounded task queues:
//!
//! ```text
//!     arena
//!     +--------------------------------------------------------------+
//!     |hhhhhhhh dd ..                                                |
//!     +--------^-----^-----------------------------------------------+
//!              |     |
//!       current_msg  data_ptr
//!
//!     rx_tasks            dispatch_tasks         tx_tasks
//!     +-----------+       +----------------+     +-------------+
//!     | offset    |       | offset, dest   |     | offset, len |
//!     | ...       |       | ...            |     | ...         |
//!     +-----------+       +----------------+     +-------------+
//! ```
//!
//! * `rx_tasks`: completed records the interpreter has not looked at yet.
//! * `dispatch_tasks`: records assigned to a destination container.
//! * `tx_tasks`: outbound frames waiting for the line driver.
//!
//! The reception path must never stall, so it never waits on consumers:
//! when the write cursor needs space that live queue entries still cover,
//! those entries are evicted head-first and the loss is counted in
//! [`MemoryStats::drop_count`]. A record whose projected end would run past
//! the arena is restarted at the origin; the header bytes already received
//! at the old position are copied down by the next [`MsgPool::tick`].
//!
//! [`MsgPool`] itself is a plain `&mut self` state machine with no masking
//! inside, which keeps it testable on the host. The [`shared`] module layers
//! the interrupt/main-loop split on top with the `critical-section` crate.

#![cfg_attr(not(test), no_std)]

mod queue;
pub mod shared;

use frame::{Header, CRC_SIZE, HEADER_SIZE, MAX_DATA_SIZE};
use zerocopy::{FromBytes, IntoBytes};

use crate::queue::TaskQueue;

/// Memory-pressure counters, readable through [`MsgPool::stats`].
///
/// The two ratios are high-water marks in percent; they only ever rise. The
/// drop counter saturates instead of wrapping so a stuck consumer reads as
/// "many", not "few again".
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct MemoryStats {
    /// High-water mark of the RX-ready queue fill, percent.
    pub rx_stack_ratio: u8,
    /// High-water mark of the dispatch queue fill, percent.
    pub dispatch_stack_ratio: u8,
    /// Number of accepted messages reclaimed before their consumer read
    /// them. Saturates at 255.
    pub drop_count: u8,
}

impl MemoryStats {
    pub const fn new() -> Self {
        Self {
            rx_stack_ratio: 0,
            dispatch_stack_ratio: 0,
            drop_count: 0,
        }
    }

    fn count_drop(&mut self) {
        self.drop_count = self.drop_count.saturating_add(1);
    }
}

/// Handle to a record inside the arena.
///
/// This is a positional token, not a borrow: the record it names can be
/// reclaimed under memory pressure after the handle was issued. Holders find
/// out by the in-use handle going empty, not through this type.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct MsgRef(usize);

impl MsgRef {
    /// Byte offset of the record's header in the arena. Diagnostic.
    pub fn offset(self) -> usize {
        self.0
    }
}

#[derive(Copy, Clone, Debug)]
struct DispatchEntry<C> {
    msg: usize,
    container: C,
}

#[derive(Copy, Clone, Debug)]
struct TxEntry {
    data: usize,
    len: u16,
}

/// The message pool: one `N`-byte arena plus three task queues of depth `M`.
///
/// `C` is the container handle type used to address consumers; the pool
/// stores and compares it but never interprets it.
///
/// Reception operations ([`push_byte`], [`header_received`], [`end_msg`],
/// [`invalid_msg`]) are meant to run in the receive interrupt; everything
/// else belongs to the main loop. The type itself enforces nothing about
/// contexts. See [`shared::SharedPool`] for the mediated form.
///
/// [`push_byte`]: MsgPool::push_byte
/// [`header_received`]: MsgPool::header_received
/// [`end_msg`]: MsgPool::end_msg
/// [`invalid_msg`]: MsgPool::invalid_msg
pub struct MsgPool<C, const N: usize, const M: usize> {
    buf: [u8; N],
    /// Start of the record currently being received.
    current_msg: usize,
    /// Next byte to write.
    data_ptr: usize,
    /// Projected one-past-the-end of the record being received, valid once
    /// its header has been accepted.
    data_end_estimation: usize,
    /// Offset of a header stranded at the arena end, to be copied down to
    /// offset 0 by the next `tick`.
    reloc_header: Option<usize>,
    rx_tasks: TaskQueue<usize, M>,
    dispatch_tasks: TaskQueue<DispatchEntry<C>, M>,
    tx_tasks: TaskQueue<TxEntry, M>,
    /// Record currently held by a consumer outside any queue.
    used_msg: Option<usize>,
    stats: MemoryStats,
}

impl<C: Copy + PartialEq, const N: usize, const M: usize> Default for MsgPool<C, N, M> {
    fn default() -> Self {
        Self::new()
    }
}

impl<C: Copy + PartialEq, const N: usize, const M: usize> MsgPool<C, N, M> {
    /// An empty pool. Evaluates to all-zeroes so a `static` lands in bss.
    pub const fn new() -> Self {
        Self {
            buf: [0; N],
            current_msg: 0,
            data_ptr: 0,
            data_end_estimation: HEADER_SIZE + CRC_SIZE,
            reloc_header: None,
            rx_tasks: TaskQueue::new(),
            dispatch_tasks: TaskQueue::new(),
            tx_tasks: TaskQueue::new(),
            used_msg: None,
            stats: MemoryStats::new(),
        }
    }

    /// Memory-pressure counters.
    pub fn stats(&self) -> &MemoryStats {
        &self.stats
    }

    /// True until the first received byte lands. Goes (and stays) false
    /// afterwards, except transiently when reception wraps to the origin.
    pub fn is_empty(&self) -> bool {
        self.data_ptr == 0
    }

    /// Handle to the record currently being received.
    pub fn current_msg(&self) -> MsgRef {
        MsgRef(self.current_msg)
    }

    //
    // Reception path (interrupt context).
    //

    /// Appends one received byte. The per-byte hot path: no queue access, no
    /// bounds bookkeeping. The caller owns pacing via `header_received` /
    /// `end_msg`; writing past the projected record end is a contract
    /// violation.
    pub fn push_byte(&mut self, byte: u8) {
        self.buf[self.data_ptr] = byte;
        self.data_ptr += 1;
    }

    /// Reports the outcome of header validation, with the payload length
    /// decoded from the header just received.
    ///
    /// An invalid header is simply erased by rewinding the write cursor. A
    /// valid one fixes the projected record end; if that projection runs past
    /// the arena, reception restarts at the origin and the already-received
    /// header bytes are left behind for [`tick`](Self::tick) to copy down.
    pub fn header_received(&mut self, valid: bool, data_size: u16) {
        if valid {
            let data_size = usize::from(data_size);
            if !self.has_room(self.current_msg + HEADER_SIZE + data_size + CRC_SIZE) {
                self.reloc_header = Some(self.current_msg);
                self.current_msg = 0;
                self.data_ptr = HEADER_SIZE;
            }
            self.data_end_estimation = self.current_msg + HEADER_SIZE + data_size + CRC_SIZE;
            if let Some(used) = self.used_msg {
                if used >= self.current_msg && used <= self.data_end_estimation {
                    // The held record sits where this one will land.
                    self.used_msg = None;
                    self.stats.count_drop();
                }
            }
        } else {
            self.data_ptr = self.current_msg;
        }
    }

    /// Finalises the record being received and queues it for interpretation,
    /// then seats the cursors for the next one.
    pub fn end_msg(&mut self) {
        self.clear_space(self.current_msg, self.data_ptr);

        if self.rx_tasks.is_full() {
            self.rx_tasks.remove(0);
            self.stats.count_drop();
        }
        self.rx_tasks.push(self.current_msg);

        // The cursor sits one past the checksum trailer; the next record
        // starts where the trailer began.
        self.data_ptr -= CRC_SIZE;
        if !self.has_room(self.data_ptr + HEADER_SIZE + CRC_SIZE) {
            self.data_ptr = 0;
        } else if self.buf[self.data_ptr] % 2 != 1 {
            // The line decoder requires the next record to start on a byte
            // holding an odd value; skip one byte when it does not.
            self.data_ptr += 1;
        }
        self.current_msg = self.data_ptr;
        self.data_end_estimation = self.current_msg + HEADER_SIZE + CRC_SIZE;
        self.clear_space(self.current_msg, self.current_msg + HEADER_SIZE + CRC_SIZE);
    }

    /// Discards the record being received (framing error, bad checksum, not
    /// for us). The write cursor rewinds to the record start.
    pub fn invalid_msg(&mut self) {
        self.clear_space(self.current_msg, self.data_ptr);
        self.data_ptr = self.current_msg;
        self.data_end_estimation = self.current_msg + HEADER_SIZE + CRC_SIZE;
        if self.current_msg == 0 {
            // Reception restarted at the origin on its own; a pending header
            // copy would now clobber it.
            self.reloc_header = None;
        }
    }

    //
    // Maintenance (main loop).
    //

    /// Out-of-interrupt housekeeping: refreshes the RX fill watermark and
    /// performs a pending header relocation to the arena origin.
    pub fn tick(&mut self) {
        let ratio = (self.rx_tasks.len() * 100 / M) as u8;
        if ratio > self.stats.rx_stack_ratio {
            self.stats.rx_stack_ratio = ratio;
        }
        if let Some(src) = self.reloc_header.take() {
            self.buf.copy_within(src..src + HEADER_SIZE, 0);
        }
    }

    //
    // Local producers (main loop).
    //

    /// Injects a locally produced record as if it had just been received,
    /// making it pullable via [`pop_rx`](Self::pop_rx).
    ///
    /// The cursors are repositioned *before* any byte is written, so a
    /// reception starting mid-copy lands cleanly behind the injected record.
    ///
    /// # Panics
    ///
    /// Panics if `payload` is shorter than the length the header claims
    /// (clamped to [`MAX_DATA_SIZE`]).
    pub fn push_message(&mut self, header: &Header, payload: &[u8]) {
        let data_size = usize::from(header.size).min(MAX_DATA_SIZE) + HEADER_SIZE;
        assert!(payload.len() >= data_size - HEADER_SIZE);

        if !self.has_room(self.current_msg + data_size) {
            self.current_msg = 0;
        }
        self.clear_space(self.current_msg, self.current_msg + data_size);

        let dst = self.current_msg;
        // Fake the cursor progression past the record before finalising, so
        // concurrent reception cannot land inside the copy destination.
        self.data_ptr = self.current_msg + data_size + CRC_SIZE;
        self.end_msg();

        self.buf[dst..dst + HEADER_SIZE].copy_from_slice(header.as_bytes());
        self.buf[dst + HEADER_SIZE..dst + data_size]
            .copy_from_slice(&payload[..data_size - HEADER_SIZE]);
    }

    /// Places an outbound frame into the arena at the current reception
    /// point and queues it for transmission, sliding the in-progress
    /// reception out of its way.
    ///
    /// Three placements are possible: at the arena origin when the frame
    /// itself no longer fits before the end; in place with the reception
    /// relocated to the origin when only the reception's projected end
    /// overflows; in place with the reception slid just behind the frame
    /// otherwise. Whatever was partially received is copied to the new
    /// reception point, so the line sees no discontinuity.
    ///
    /// The first three bytes are written before the task is queued so a
    /// transmitter picking the task up immediately has a valid start; the
    /// remainder follows. A queue already holding `M - 1` frames loses its
    /// oldest, counted as a drop.
    ///
    /// # Panics
    ///
    /// Panics if `data` is shorter than 3 bytes or longer than `u16::MAX`.
    pub fn push_tx(&mut self, data: &[u8]) {
        let size = data.len();
        assert!(size >= 3 && size <= usize::from(u16::MAX));
        assert!(self.current_msg < N);

        let progression = self.data_ptr - self.current_msg;
        let estimated = self.data_end_estimation - self.current_msg;
        let rx_backup = self.current_msg;

        let tx_msg;
        if !self.has_room(self.current_msg + size) {
            // The frame itself no longer fits: both it and the reception
            // restart at the origin, frame first.
            tx_msg = 0;
            self.current_msg = size;
            self.data_ptr = self.current_msg + progression;
            self.data_end_estimation = self.current_msg + estimated;
            self.clear_space(tx_msg, self.data_end_estimation);
        } else {
            tx_msg = self.current_msg;
            if !self.has_room(self.current_msg + size + estimated) {
                // The frame fits but the reception behind it would not;
                // relocate the reception to the origin.
                self.clear_space(tx_msg, tx_msg + size);
                self.current_msg = 0;
                self.data_end_estimation = estimated;
                self.clear_space(self.current_msg, self.data_end_estimation);
            } else {
                // Both fit in place; the reception slides behind the frame.
                self.current_msg += size;
                self.data_end_estimation = self.current_msg + estimated;
                self.clear_space(tx_msg, self.data_end_estimation);
            }
            self.data_ptr = self.current_msg + progression;
            assert!(self.data_ptr < N);
        }

        // Re-seat the partially received bytes behind the inserted frame.
        self.buf
            .copy_within(rx_backup..rx_backup + progression, self.current_msg);

        // Enough for a transmitter to start immediately.
        self.buf[tx_msg..tx_msg + 3].copy_from_slice(&data[..3]);
        self.tx_tasks.push(TxEntry {
            data: tx_msg,
            len: size as u16,
        });
        if self.tx_tasks.len() == M {
            self.pop_tx();
            self.stats.count_drop();
        }
        self.buf[tx_msg + 3..tx_msg + size].copy_from_slice(&data[3..]);
    }

    //
    // Consumers (main loop).
    //

    /// Pulls the oldest completed record that has not been interpreted yet.
    pub fn pop_rx(&mut self) -> Option<MsgRef> {
        let offset = self.rx_tasks.pop_head()?;
        assert!(offset < N);
        Some(MsgRef(offset))
    }

    /// Assigns a record to a destination container.
    ///
    /// A full dispatch queue loses its oldest entry silently: the record is
    /// still in the arena, so this is backpressure on interpretation, not
    /// data loss, and it deliberately does not count as a drop.
    pub fn dispatch(&mut self, container: C, msg: MsgRef) {
        assert!(msg.0 < N);
        if self.dispatch_tasks.is_full() {
            self.dispatch_tasks.remove(0);
        }
        self.dispatch_tasks.push(DispatchEntry {
            msg: msg.0,
            container,
        });
        let ratio = (self.dispatch_tasks.len() * 100 / M) as u8;
        if ratio > self.stats.dispatch_stack_ratio {
            self.stats.dispatch_stack_ratio = ratio;
        }
    }

    /// Pulls the oldest record assigned to `container` and marks it in use.
    pub fn pop_for(&mut self, container: C) -> Option<MsgRef> {
        let (index, msg) = (0..self.dispatch_tasks.len()).find_map(|i| {
            let entry = self.dispatch_tasks.get(i)?;
            (entry.container == container).then_some((i, entry.msg))
        })?;
        self.used_msg = Some(msg);
        self.dispatch_tasks.remove(index);
        Some(MsgRef(msg))
    }

    /// Pulls the dispatch entry at `index` and marks its record in use.
    pub fn pop_at(&mut self, index: usize) -> Option<MsgRef> {
        let entry = self.dispatch_tasks.get(index)?;
        self.used_msg = Some(entry.msg);
        self.dispatch_tasks.remove(index);
        Some(MsgRef(entry.msg))
    }

    /// Removes every dispatch entry referring to `msg`. Used when a consumer
    /// abandons its copy of a broadcast. Idempotent.
    pub fn undispatch(&mut self, msg: MsgRef) {
        let mut index = 0;
        while index < self.dispatch_tasks.len() {
            match self.dispatch_tasks.get(index) {
                Some(entry) if entry.msg == msg.0 => {
                    self.dispatch_tasks.remove(index);
                }
                _ => index += 1,
            }
        }
    }

    /// Declares the record pulled via [`pop_for`](Self::pop_for) /
    /// [`pop_at`](Self::pop_at) no longer in use.
    pub fn release(&mut self) {
        self.used_msg = None;
    }

    /// Number of live dispatch entries.
    pub fn dispatched(&self) -> usize {
        self.dispatch_tasks.len()
    }

    /// Destination container of the dispatch entry at `index`.
    pub fn container_at(&self, index: usize) -> Option<C> {
        self.dispatch_tasks.get(index).map(|entry| entry.container)
    }

    /// Command byte of the record dispatched at `index`.
    pub fn cmd_at(&self, index: usize) -> Option<u8> {
        let entry = self.dispatch_tasks.get(index)?;
        self.header_at(entry.msg).map(|h| h.cmd)
    }

    /// Sender id of the record dispatched at `index`.
    pub fn source_at(&self, index: usize) -> Option<u16> {
        let entry = self.dispatch_tasks.get(index)?;
        self.header_at(entry.msg).map(|h| h.source)
    }

    /// Payload length of the record dispatched at `index`.
    pub fn size_at(&self, index: usize) -> Option<u16> {
        let entry = self.dispatch_tasks.get(index)?;
        self.header_at(entry.msg).map(|h| h.size)
    }

    /// The oldest queued outbound frame, without consuming it.
    pub fn peek_tx(&self) -> Option<&[u8]> {
        let entry = self.tx_tasks.get(0)?;
        Some(&self.buf[entry.data..entry.data + usize::from(entry.len)])
    }

    /// Drops the oldest queued outbound frame (transmission done or
    /// abandoned).
    ///
    /// # Panics
    ///
    /// Panics if the TX queue is empty.
    pub fn pop_tx(&mut self) {
        self.tx_tasks.remove(0);
    }

    /// Borrows the `HEADER_SIZE + size` bytes of a completed record.
    ///
    /// # Panics
    ///
    /// Panics if `msg` does not name a readable record.
    pub fn msg_bytes(&self, msg: MsgRef) -> &[u8] {
        let header = match self.header_at(msg.0) {
            Some(header) => header,
            None => panic!(),
        };
        &self.buf[msg.0..msg.0 + HEADER_SIZE + usize::from(header.size)]
    }

    //
    // Internals.
    //

    fn has_room(&self, to: usize) -> bool {
        to <= N - 1
    }

    /// Makes the closed byte range `[from, to]` safe to overwrite by
    /// evicting whatever still points into it: the in-use handle, then
    /// dispatch entries, then RX-ready entries. Each eviction is a counted
    /// drop.
    ///
    /// Entries enter the queues in arena order modulo wrap, so if the head
    /// does not overlap the range no later entry does either; checking heads
    /// only is sufficient. A range past the arena end touches nothing.
    fn clear_space(&mut self, from: usize, to: usize) {
        if to > N - 1 {
            return;
        }
        if let Some(used) = self.used_msg {
            if used >= from && used <= to {
                self.used_msg = None;
                self.stats.count_drop();
            }
        }
        while let Some(entry) = self.dispatch_tasks.get(0) {
            if entry.msg < from || entry.msg > to {
                break;
            }
            self.dispatch_tasks.remove(0);
            self.stats.count_drop();
        }
        while let Some(offset) = self.rx_tasks.get(0) {
            if offset < from || offset > to {
                break;
            }
            self.rx_tasks.remove(0);
            self.stats.count_drop();
        }
    }

    fn header_at(&self, offset: usize) -> Option<Header> {
        let bytes = self.buf.get(offset..)?;
        Header::read_from_prefix(bytes).ok().map(|(header, _)| header)
    }
}
