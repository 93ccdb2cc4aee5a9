// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use bytes::{BufMut, Bytes, BytesMut};
use zerocopy::{
    BigEndian, FromBytes as ZFromBytes, Immutable, IntoBytes, KnownLayout, U16,
    Unaligned,
};

/// Length of the fixed DNS message header.
pub const HEADER_LEN: usize = 12;

/// Largest wire message DNS can express (and the largest TCP frame).
pub const MAX_MESSAGE_LEN: usize = 65535;

/// Largest payload sent over UDP before the engine promotes to TCP.
pub const MAX_UDP_PAYLOAD: usize = 512;

/// Fixed DNS header as it appears on the wire.
#[repr(C)]
#[derive(Debug, Default, PartialEq, ZFromBytes, IntoBytes, KnownLayout, Immutable, Unaligned)]
pub struct DnsHeader {
    pub id: U16<BigEndian>,       // 0..2
    pub flags: U16<BigEndian>,    // 2..4
    pub qdcount: U16<BigEndian>,  // 4..6
    pub ancount: U16<BigEndian>,  // 6..8
    pub nscount: U16<BigEndian>,  // 8..10
    pub arcount: U16<BigEndian>,  // 10..12
}

/// Read the message id out of a wire buffer, if it holds at least a header.
pub fn message_id(wire: &[u8]) -> Option<u16> {
    DnsHeader::ref_from_prefix(wire)
        .ok()
        .map(|(hdr, _)| hdr.id.get())
}

/// Overwrite the message id in place. Returns false when the buffer is too
/// short to carry a header.
pub fn set_message_id(wire: &mut [u8], id: u16) -> bool {
    match DnsHeader::mut_from_prefix(wire) {
        Ok((hdr, _)) => {
            hdr.id.set(id);
            true
        },
        Err(_) => false,
    }
}

/// Frame a wire message for the chosen transport: TCP payloads carry the
/// big-endian `u16` length prefix mandated by DNS-over-TCP, UDP payloads are
/// the bare message.
pub fn frame_query(wire: &[u8], tcp: bool) -> Bytes {
    if !tcp {
        return Bytes::copy_from_slice(wire);
    }
    let mut framed = BytesMut::with_capacity(wire.len() + 2);
    framed.put_u16(wire.len() as u16);
    framed.extend_from_slice(wire);
    framed.freeze()
}
