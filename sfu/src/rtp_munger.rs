//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Rewrites RTP sequence numbers and timestamps so a subscriber sees one
//! continuous stream no matter how many source SSRCs feed it. Gaps in the
//! source reserve outbound slots for late arrivals; padding-only packets are
//! swallowed unless they fill a reserved slot.

use std::collections::HashMap;

use thiserror::Error;

use crate::{
    rtp::{ExtPacket, FullSequenceNumber, FullTimestamp, TruncatedSequenceNumber,
        TruncatedTimestamp},
    wraparound::WrapAround,
};

/// How many reserved gap slots to remember for late arrivals.
const MISSING_SEQUENCE_NUMBERS_MAX: u64 = 25;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SequenceNumberOrdering {
    Contiguous,
    OutOfOrder,
    Gap,
    Duplicate,
}

/// The rewritten RTP fields for one forwarded packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TranslationParamsRtp {
    pub sn_ordering: SequenceNumberOrdering,
    pub sequence_number: TruncatedSequenceNumber,
    pub timestamp: TruncatedTimestamp,
}

/// A generated sequence-number/timestamp pair for padding or blank frames.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SnTs {
    pub sequence_number: TruncatedSequenceNumber,
    pub timestamp: TruncatedTimestamp,
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RtpMungerError {
    #[error("duplicate packet")]
    DuplicatePacket,
    #[error("padding-only packet in order")]
    PaddingOnlyPacket,
    #[error("out-of-order sequence number not in cache")]
    OutOfOrderSequenceNumberCacheMiss,
    #[error("munger has not locked onto a stream")]
    NotStarted,
}

#[derive(Default)]
pub struct RtpMunger {
    initialized: bool,

    ext_highest_in_sn: WrapAround<u16>,
    ext_highest_in_ts: WrapAround<u32>,

    // ext_outgoing = ext_incoming - offset
    sn_offset: i64,
    ts_offset: i64,

    ext_highest_out_sn: FullSequenceNumber,
    ext_last_out_ts: FullTimestamp,
    last_marker: bool,

    // Outbound offsets of source sequence numbers skipped by a gap.
    missing_sn_offsets: HashMap<FullSequenceNumber, i64>,
}

impl RtpMunger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_started(&self) -> bool {
        self.initialized
    }

    /// True when the last forwarded packet ended its frame.
    pub fn is_on_frame_boundary(&self) -> bool {
        self.last_marker
    }

    /// Locks onto the first packet of a stream. The caller forwards that
    /// packet unmodified; this records the position the rest of the stream is
    /// translated against.
    pub fn set_last_sn_ts(&mut self, packet: &ExtPacket) {
        self.ext_highest_in_sn = WrapAround::new();
        self.ext_highest_in_sn.update(packet.header.seqnum);
        self.ext_highest_in_ts = WrapAround::new();
        self.ext_highest_in_ts.update(packet.header.timestamp);

        self.sn_offset = 0;
        self.ts_offset = 0;
        self.ext_highest_out_sn = packet.header.seqnum as FullSequenceNumber;
        self.ext_last_out_ts = packet.header.timestamp as FullTimestamp;
        self.last_marker = packet.header.marker;
        self.missing_sn_offsets.clear();
        self.initialized = true;
    }

    /// Re-anchors on a new source SSRC so this packet continues the outbound
    /// stream `sn_adv`/`ts_adv` past the last forwarded position.
    pub fn update_sn_ts_offsets(&mut self, packet: &ExtPacket, sn_adv: i64, ts_adv: i64) {
        self.ext_highest_in_sn = WrapAround::new();
        self.ext_highest_in_sn
            .update(packet.header.seqnum.wrapping_sub(1));
        self.ext_highest_in_ts = WrapAround::new();
        self.ext_highest_in_ts
            .update(packet.header.timestamp.wrapping_sub(1));

        self.sn_offset =
            packet.header.seqnum as i64 - (self.ext_highest_out_sn as i64 + sn_adv);
        self.ts_offset =
            packet.header.timestamp as i64 - (self.ext_last_out_ts as i64 + ts_adv);
        self.missing_sn_offsets.clear();
    }

    /// Translates one packet. Duplicates, unreserved out-of-order packets,
    /// and contiguous padding-only packets are reported as errors so the
    /// caller can drop them.
    pub fn update_and_get_sn_ts(
        &mut self,
        packet: &ExtPacket,
    ) -> Result<TranslationParamsRtp, RtpMungerError> {
        if !self.initialized {
            return Err(RtpMungerError::NotStarted);
        }

        let sn_update = self.ext_highest_in_sn.update(packet.header.seqnum);
        let ext_in_sn = sn_update.extended;
        let pre_highest = sn_update.pre_extended_highest;

        if ext_in_sn == pre_highest {
            return Err(RtpMungerError::DuplicatePacket);
        }

        if ext_in_sn < pre_highest {
            // Late arrival: only forward if an in-order gap reserved its slot.
            match self.missing_sn_offsets.remove(&ext_in_sn) {
                Some(sn_offset) => {
                    let ts_update = self.ext_highest_in_ts.update(packet.header.timestamp);
                    return Ok(TranslationParamsRtp {
                        sn_ordering: SequenceNumberOrdering::OutOfOrder,
                        sequence_number: (ext_in_sn as i64 - sn_offset) as u16,
                        timestamp: (ts_update.extended as i64 - self.ts_offset) as u32,
                    });
                }
                None => {
                    if sn_update.is_restart {
                        self.ext_highest_in_sn
                            .rollback_restart(sn_update.pre_extended_start);
                    }
                    return Err(RtpMungerError::OutOfOrderSequenceNumberCacheMiss);
                }
            }
        }

        let gap = ext_in_sn - pre_highest;
        if gap == 1 && packet.is_padding_only() {
            // Swallow the padding and close the hole it would have left.
            self.sn_offset += 1;
            return Err(RtpMungerError::PaddingOnlyPacket);
        }

        let sn_ordering = if gap == 1 {
            SequenceNumberOrdering::Contiguous
        } else {
            // Reserve the skipped slots for late arrivals.
            let first_reservable =
                (pre_highest + 1).max(ext_in_sn.saturating_sub(MISSING_SEQUENCE_NUMBERS_MAX));
            for missing in first_reservable..ext_in_sn {
                self.missing_sn_offsets.insert(missing, self.sn_offset);
            }
            self.missing_sn_offsets
                .retain(|sn, _| ext_in_sn - sn <= MISSING_SEQUENCE_NUMBERS_MAX);
            SequenceNumberOrdering::Gap
        };

        let ts_update = self.ext_highest_in_ts.update(packet.header.timestamp);
        let out_sn = (ext_in_sn as i64 - self.sn_offset) as u64;
        let out_ts = (ts_update.extended as i64 - self.ts_offset) as u64;

        if out_sn > self.ext_highest_out_sn {
            self.ext_highest_out_sn = out_sn;
        }
        if out_ts > self.ext_last_out_ts {
            self.ext_last_out_ts = out_ts;
        }
        self.last_marker = packet.header.marker;

        Ok(TranslationParamsRtp {
            sn_ordering,
            sequence_number: out_sn as u16,
            timestamp: out_ts as u32,
        })
    }

    /// Returns the outbound slot consumed by a packet that a later stage
    /// decided to drop, so the stream stays contiguous.
    pub fn packet_dropped(&mut self, translated: &TranslationParamsRtp) {
        match translated.sn_ordering {
            SequenceNumberOrdering::Contiguous | SequenceNumberOrdering::Gap => {
                self.sn_offset += 1;
                self.ext_highest_out_sn -= 1;
            }
            // Late and duplicate packets never advanced the outbound highest.
            SequenceNumberOrdering::OutOfOrder | SequenceNumberOrdering::Duplicate => {}
        }
    }

    /// Generates `num` sequence-number/timestamp pairs continuing the
    /// outbound stream. With `frame_end_needed` the first pair repeats the
    /// last timestamp to close the open frame; otherwise timestamps start one
    /// frame later. Padding always ends on a frame boundary.
    pub fn update_and_get_padding_sn_ts(
        &mut self,
        num: usize,
        clock_rate: u32,
        frame_rate: u32,
        frame_end_needed: bool,
    ) -> Result<Vec<SnTs>, RtpMungerError> {
        if !self.initialized {
            return Err(RtpMungerError::NotStarted);
        }

        let ts_step = |frame_index: u64| -> u64 {
            if frame_rate == 0 {
                return 0;
            }
            frame_index * clock_rate as u64 / frame_rate as u64
        };

        let mut pairs = Vec::with_capacity(num);
        for i in 0..num as u64 {
            let frame_index = if frame_end_needed { i } else { i + 1 };
            pairs.push(SnTs {
                sequence_number: (self.ext_highest_out_sn + 1 + i) as u16,
                timestamp: (self.ext_last_out_ts + ts_step(frame_index)) as u32,
            });
        }

        self.ext_highest_out_sn += num as u64;
        if let Some(last) = pairs.last() {
            let frame_index = if frame_end_needed {
                num as u64 - 1
            } else {
                num as u64
            };
            self.ext_last_out_ts += ts_step(frame_index);
            debug_assert_eq!(last.timestamp, self.ext_last_out_ts as u32);
        }
        // The generated packets consumed outbound slots; keep the incoming
        // mapping continuous past them.
        self.sn_offset =
            self.ext_highest_in_sn.get_extended_highest() as i64 - self.ext_highest_out_sn as i64;
        self.last_marker = true;
        Ok(pairs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtp::test_packets::{ext_packet, TestExtPacketParams};

    fn media(sequence_number: u16, timestamp: u32, ssrc: u32) -> ExtPacket {
        ext_packet(&TestExtPacketParams {
            sequence_number,
            timestamp,
            ssrc,
            payload_size: 20,
            ..Default::default()
        })
    }

    fn padding(sequence_number: u16, timestamp: u32, ssrc: u32) -> ExtPacket {
        ext_packet(&TestExtPacketParams {
            sequence_number,
            timestamp,
            ssrc,
            ..Default::default()
        })
    }

    #[test]
    fn duplicates_and_unreserved_out_of_order_drop() {
        let mut munger = RtpMunger::new();
        munger.set_last_sn_ts(&media(23333, 0xabcdef, 1));

        assert_eq!(
            Err(RtpMungerError::DuplicatePacket),
            munger.update_and_get_sn_ts(&media(23333, 0xabcdef, 1))
        );
        assert_eq!(
            Err(RtpMungerError::OutOfOrderSequenceNumberCacheMiss),
            munger.update_and_get_sn_ts(&media(23332, 0xabcdef, 1))
        );
    }

    #[test]
    fn padding_swallowed_then_stream_stays_contiguous() {
        let mut munger = RtpMunger::new();
        munger.set_last_sn_ts(&media(23333, 0xabcdef, 1));

        assert_eq!(
            Err(RtpMungerError::PaddingOnlyPacket),
            munger.update_and_get_sn_ts(&padding(23334, 0xabcdef, 1))
        );
        assert_eq!(
            Ok(TranslationParamsRtp {
                sn_ordering: SequenceNumberOrdering::Contiguous,
                sequence_number: 23334,
                timestamp: 0xabcdef,
            }),
            munger.update_and_get_sn_ts(&media(23335, 0xabcdef, 1))
        );
    }

    #[test]
    fn gap_reserves_slots_for_late_arrivals() {
        let mut munger = RtpMunger::new();
        munger.set_last_sn_ts(&media(23333, 0xabcdef, 1));
        munger.update_and_get_sn_ts(&padding(23334, 0xabcdef, 1)).ok();
        munger.update_and_get_sn_ts(&media(23335, 0xabcdef, 1)).unwrap();

        // Padding after a gap is forwarded; the hole is reserved.
        assert_eq!(
            Ok(TranslationParamsRtp {
                sn_ordering: SequenceNumberOrdering::Gap,
                sequence_number: 23336,
                timestamp: 0xabcdef,
            }),
            munger.update_and_get_sn_ts(&padding(23337, 0xabcdef, 1))
        );

        // The late arrival fills its reserved slot.
        assert_eq!(
            Ok(TranslationParamsRtp {
                sn_ordering: SequenceNumberOrdering::OutOfOrder,
                sequence_number: 23335,
                timestamp: 0xabcdef,
            }),
            munger.update_and_get_sn_ts(&media(23336, 0xabcdef, 1))
        );

        // Only once, though.
        assert_eq!(
            Err(RtpMungerError::OutOfOrderSequenceNumberCacheMiss),
            munger.update_and_get_sn_ts(&media(23336, 0xabcdef, 1))
        );
    }

    #[test]
    fn source_switch_is_contiguous() {
        let mut munger = RtpMunger::new();
        munger.set_last_sn_ts(&media(23333, 0xabcdef, 1));
        munger.update_and_get_sn_ts(&padding(23334, 0xabcdef, 1)).ok();
        munger.update_and_get_sn_ts(&media(23335, 0xabcdef, 1)).unwrap();
        munger.update_and_get_sn_ts(&padding(23337, 0xabcdef, 1)).unwrap();
        munger.update_and_get_sn_ts(&media(23336, 0xabcdef, 1)).unwrap();

        let switch = media(123, 0xfedcba, 2);
        munger.update_sn_ts_offsets(&switch, 1, 1);
        assert_eq!(
            Ok(TranslationParamsRtp {
                sn_ordering: SequenceNumberOrdering::Contiguous,
                sequence_number: 23337,
                timestamp: 0xabcdf0,
            }),
            munger.update_and_get_sn_ts(&switch)
        );
    }

    #[test]
    fn sequence_numbers_wrap() {
        let mut munger = RtpMunger::new();
        munger.set_last_sn_ts(&media(65534, 1000, 1));
        munger.update_and_get_sn_ts(&media(65535, 1000, 1)).unwrap();
        assert_eq!(
            Ok(TranslationParamsRtp {
                sn_ordering: SequenceNumberOrdering::Contiguous,
                sequence_number: 0,
                timestamp: 1000,
            }),
            munger.update_and_get_sn_ts(&media(0, 1000, 1))
        );
    }

    #[test]
    fn padding_with_frame_end_repeats_timestamp() {
        let mut munger = RtpMunger::new();
        munger.set_last_sn_ts(&media(23333, 0xabcdef, 1));

        let pairs = munger
            .update_and_get_padding_sn_ts(5, 0, 5, true)
            .unwrap();
        let expected: Vec<SnTs> = (0..5)
            .map(|i| SnTs {
                sequence_number: 23334 + i,
                timestamp: 0xabcdef,
            })
            .collect();
        assert_eq!(expected, pairs);

        // The padding ended the frame, so the next batch starts one frame in.
        let pairs = munger
            .update_and_get_padding_sn_ts(5, 0, 5, false)
            .unwrap();
        let expected: Vec<SnTs> = (0..5)
            .map(|i| SnTs {
                sequence_number: 23339 + i,
                timestamp: 0xabcdef,
            })
            .collect();
        assert_eq!(expected, pairs);
    }

    #[test]
    fn blank_frame_timestamps_advance_by_frame_time() {
        let mut munger = RtpMunger::new();
        munger.set_last_sn_ts(&media(23333, 0xabcdef, 1));

        let pairs = munger
            .update_and_get_padding_sn_ts(7, 90000, 30, true)
            .unwrap();
        let expected: Vec<SnTs> = (0..7u32)
            .map(|i| SnTs {
                sequence_number: 23334 + i as u16,
                timestamp: 0xabcdef + i * 90000 / 30,
            })
            .collect();
        assert_eq!(expected, pairs);

        let last_ts = expected.last().unwrap().timestamp;
        let pairs = munger
            .update_and_get_padding_sn_ts(6, 90000, 30, false)
            .unwrap();
        let expected: Vec<SnTs> = (0..6u32)
            .map(|i| SnTs {
                sequence_number: 23341 + i as u16,
                timestamp: last_ts + (i + 1) * 90000 / 30,
            })
            .collect();
        assert_eq!(expected, pairs);
    }

    #[test]
    fn media_after_padding_continues_outbound_stream() {
        let mut munger = RtpMunger::new();
        munger.set_last_sn_ts(&media(100, 5000, 1));
        munger.update_and_get_padding_sn_ts(3, 0, 5, true).unwrap();

        // Source continues at 101; outbound must continue past the padding.
        let translated = munger.update_and_get_sn_ts(&media(101, 5000, 1)).unwrap();
        assert_eq!(104, translated.sequence_number);
        assert_eq!(SequenceNumberOrdering::Contiguous, translated.sn_ordering);
    }
}
