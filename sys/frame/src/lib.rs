// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Wire-record layout shared between the line codec, the message interpreter
//! and the message pool.
//!
//! A record on the bus is a packed [`Header`], followed by `size` payload
//! bytes, followed by a [`CRC_SIZE`]-byte checksum trailer. The pool treats
//! the payload and the trailer as opaque; only the header prefix is ever
//! decoded, and only for its `size`, `cmd` and `source` fields. The checksum
//! itself is computed and verified by the line codec, never here.

#![cfg_attr(not(test), no_std)]

use static_assertions::const_assert_eq;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned};

/// Size of the packed record header, in bytes.
pub const HEADER_SIZE: usize = core::mem::size_of::<Header>();

/// Largest payload a single record may carry. Senders producing more than
/// this must stream across several records.
pub const MAX_DATA_SIZE: usize = 128;

/// Width of the checksum trailer that closes every record on the wire.
pub const CRC_SIZE: usize = 2;

/// Arena footprint of the largest legal record.
pub const MAX_RECORD_SIZE: usize = HEADER_SIZE + MAX_DATA_SIZE + CRC_SIZE;

/// The record header, exactly as it crosses the wire.
///
/// All fields are little-endian and unaligned; the struct is free of padding
/// so it can be read in place from any byte offset of the receive arena.
#[derive(
    Copy, Clone, Debug, Eq, PartialEq, FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned,
)]
#[repr(C, packed)]
pub struct Header {
    /// Destination id, interpreted according to `target_mode`.
    pub target: u16,
    /// Addressing mode (unicast id, multicast group, broadcast, ...). Opaque
    /// to the pool; the interpreter owns the encoding.
    pub target_mode: u8,
    /// Bus id of the sender.
    pub source: u16,
    /// Command byte.
    pub cmd: u8,
    /// Number of payload bytes following the header.
    pub size: u16,
}

const_assert_eq!(HEADER_SIZE, 8);

impl Header {
    pub fn new(target: u16, target_mode: u8, source: u16, cmd: u8, size: u16) -> Self {
        Self {
            target,
            target_mode,
            source,
            cmd,
            size,
        }
    }

    /// Payload length this header admits, clamped to [`MAX_DATA_SIZE`].
    pub fn payload_len(&self) -> usize {
        usize::from(self.size).min(MAX_DATA_SIZE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layout_is_packed_little_endian() {
        let h = Header::new(0x0102, 3, 0x0405, 6, 0x0708);
        assert_eq!(h.as_bytes(), &[0x02, 0x01, 3, 0x05, 0x04, 6, 0x08, 0x07]);
    }

    #[test]
    fn reads_back_from_a_prefix() {
        let mut bytes = [0u8; 16];
        let h = Header::new(42, 0, 7, 0x11, 4);
        bytes[..HEADER_SIZE].copy_from_slice(h.as_bytes());

        let (back, rest) = Header::read_from_prefix(&bytes[..]).unwrap();
        assert_eq!(back, h);
        assert_eq!(rest.len(), 16 - HEADER_SIZE);
    }

    #[test]
    fn payload_len_clamps() {
        let h = Header::new(1, 0, 2, 0, 4);
        assert_eq!(h.payload_len(), 4);

        let h = Header::new(1, 0, 2, 0, 5000);
        assert_eq!(h.payload_len(), MAX_DATA_SIZE);
    }
}
