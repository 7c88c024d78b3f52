//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! RTP value types shared by the forwarding pipeline. See
//! https://tools.ietf.org/html/rfc3550. Parsing and crypto live with the
//! transport; the core works on already-parsed headers.

use relay_common::Instant;

use crate::vp8;

pub type Ssrc = u32;
pub type PayloadType = u8;
pub type TruncatedSequenceNumber = u16;
pub type FullSequenceNumber = u64;
pub type TruncatedTimestamp = u32;
pub type FullTimestamp = u64;

/// The header fields of one RTP packet that the forwarder reads or rewrites.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Header {
    pub payload_type: PayloadType,
    pub seqnum: TruncatedSequenceNumber,
    pub timestamp: TruncatedTimestamp,
    pub ssrc: Ssrc,
    pub marker: bool,
}

/// One parsed packet from a publisher, extended with the metadata the
/// forwarder needs to make a drop/forward decision.
#[derive(Clone, Debug)]
pub struct ExtPacket {
    pub header: Header,
    pub payload: Vec<u8>,
    pub vp8: Option<vp8::Vp8Header>,
    pub arrival: Instant,
    pub is_key_frame: bool,
}

impl ExtPacket {
    /// Padding-only packets carry no media payload; they exist to open
    /// bitrate or terminate frames.
    pub fn is_padding_only(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod test_packets {
    use super::*;

    pub struct TestExtPacketParams {
        pub sequence_number: TruncatedSequenceNumber,
        pub timestamp: TruncatedTimestamp,
        pub ssrc: Ssrc,
        pub payload_size: usize,
        pub marker: bool,
    }

    impl Default for TestExtPacketParams {
        fn default() -> Self {
            Self {
                sequence_number: 0,
                timestamp: 0,
                ssrc: 0,
                payload_size: 0,
                marker: false,
            }
        }
    }

    pub fn ext_packet(params: &TestExtPacketParams) -> ExtPacket {
        ExtPacket {
            header: Header {
                payload_type: 96,
                seqnum: params.sequence_number,
                timestamp: params.timestamp,
                ssrc: params.ssrc,
                marker: params.marker,
            },
            payload: vec![0u8; params.payload_size],
            vp8: None,
            arrival: Instant::now(),
            is_key_frame: false,
        }
    }

    pub fn ext_packet_vp8(params: &TestExtPacketParams, vp8: vp8::Vp8Header) -> ExtPacket {
        let mut packet = ext_packet(params);
        packet.is_key_frame = vp8.is_key_frame;
        packet.vp8 = Some(vp8);
        packet
    }
}
