//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! VP8 payload descriptor handling (see RFC 7741) and the munger that keeps
//! picture IDs, TL0PICIDX, and KEYIDX contiguous for a subscriber across
//! layer switches, source switches, and temporal-layer drops.

use std::collections::HashMap;

use relay_common::expand_truncated_counter;
use thiserror::Error;

pub type TruncatedPictureId = u16;
pub type FullPictureId = u64;

const PICTURE_ID_WIDTH: usize = 15;
const TL0_PIC_IDX_WIDTH: usize = 8;
const KEY_IDX_WIDTH: usize = 5;

/// First byte of a generated blank frame: partition 0, start of partition.
const BLANK_FRAME_FIRST_BYTE: u8 = 0x10;

/// How many out-of-order picture-ID mappings to retain for late packets.
const MISSING_PICTURE_IDS_MAX: u64 = 50;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum Vp8Error {
    #[error("payload too short for VP8 descriptor")]
    PayloadTooShort,
    #[error("packet filtered by temporal layer")]
    FilteredTemporalLayer,
    #[error("out-of-order picture id not in cache")]
    OutOfOrderPictureIdCacheMiss,
    #[error("packet has no VP8 descriptor")]
    MissingDescriptor,
}

/// The parsed fields of a VP8 payload descriptor plus the key-frame flag from
/// the payload header behind it.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Vp8Header {
    pub first_byte: u8,
    pub picture_id_present: bool,
    pub picture_id: TruncatedPictureId,
    pub m_bit: bool,
    pub tl0_pic_idx_present: bool,
    pub tl0_pic_idx: u8,
    pub tid_present: bool,
    pub tid: u8,
    pub y_bit: bool,
    pub key_idx_present: bool,
    pub key_idx: u8,
    pub header_size: usize,
    pub is_key_frame: bool,
}

impl Vp8Header {
    pub fn parse(payload: &[u8]) -> Result<Self, Vp8Error> {
        if payload.is_empty() {
            return Err(Vp8Error::PayloadTooShort);
        }

        let first_byte = payload[0];
        let mut idx = 1;
        let mut header = Vp8Header {
            first_byte,
            ..Default::default()
        };

        let extended = (first_byte & 0b1000_0000) != 0;
        let start_of_partition = (first_byte & 0b0001_0000) != 0;
        let partition_index = first_byte & 0b0000_0111;

        if extended {
            let ext = *payload.get(idx).ok_or(Vp8Error::PayloadTooShort)?;
            idx += 1;
            let has_picture_id = (ext & 0b1000_0000) != 0;
            let has_tl0 = (ext & 0b0100_0000) != 0;
            let has_tid = (ext & 0b0010_0000) != 0;
            let has_key_idx = (ext & 0b0001_0000) != 0;

            if has_picture_id {
                header.picture_id_present = true;
                let b = *payload.get(idx).ok_or(Vp8Error::PayloadTooShort)?;
                header.m_bit = (b & 0b1000_0000) != 0;
                if header.m_bit {
                    let low = *payload.get(idx + 1).ok_or(Vp8Error::PayloadTooShort)?;
                    header.picture_id = u16::from_be_bytes([b & 0b0111_1111, low]);
                    idx += 2;
                } else {
                    header.picture_id = (b & 0b0111_1111) as u16;
                    idx += 1;
                }
            }
            if has_tl0 {
                header.tl0_pic_idx_present = true;
                header.tl0_pic_idx = *payload.get(idx).ok_or(Vp8Error::PayloadTooShort)?;
                idx += 1;
            }
            if has_tid || has_key_idx {
                let b = *payload.get(idx).ok_or(Vp8Error::PayloadTooShort)?;
                idx += 1;
                if has_tid {
                    header.tid_present = true;
                    header.tid = b >> 6;
                    header.y_bit = (b & 0b0010_0000) != 0;
                }
                if has_key_idx {
                    header.key_idx_present = true;
                    header.key_idx = b & 0b0001_1111;
                }
            }
        }

        header.header_size = idx;
        // A key frame starts at partition 0 with the inverse-frame-type bit
        // clear in the VP8 payload header.
        header.is_key_frame = start_of_partition
            && partition_index == 0
            && payload
                .get(idx)
                .map(|b| (b & 0b0000_0001) == 0)
                .unwrap_or(false);
        Ok(header)
    }

    /// Writes this descriptor back over the front of an RTP payload that was
    /// parsed with the same set of present fields. The picture ID is always
    /// written in its 15-bit form.
    pub fn apply(&self, rtp_payload: &mut [u8]) -> Result<(), Vp8Error> {
        if rtp_payload.len() < self.header_size {
            return Err(Vp8Error::PayloadTooShort);
        }

        rtp_payload[0] = self.first_byte | 0b1000_0000;
        let mut ext = 0u8;
        if self.picture_id_present {
            ext |= 0b1000_0000;
        }
        if self.tl0_pic_idx_present {
            ext |= 0b0100_0000;
        }
        if self.tid_present {
            ext |= 0b0010_0000;
        }
        if self.key_idx_present {
            ext |= 0b0001_0000;
        }
        rtp_payload[1] = ext;

        let mut idx = 2;
        if self.picture_id_present {
            rtp_payload[idx..idx + 2]
                .copy_from_slice(&(self.picture_id | 0b1000_0000_0000_0000).to_be_bytes());
            idx += 2;
        }
        if self.tl0_pic_idx_present {
            rtp_payload[idx] = self.tl0_pic_idx;
            idx += 1;
        }
        if self.tid_present || self.key_idx_present {
            let mut b = 0u8;
            if self.tid_present {
                b |= self.tid << 6;
                if self.y_bit {
                    b |= 0b0010_0000;
                }
            }
            if self.key_idx_present {
                b |= self.key_idx & 0b0001_1111;
            }
            rtp_payload[idx] = b;
        }
        Ok(())
    }
}

/// Rewrites VP8 descriptor counters so the outbound stream looks continuous
/// no matter which simulcast layer feeds it. Single writer per subscriber
/// track.
#[derive(Default)]
pub struct Vp8Munger {
    initialized: bool,

    // Expansion state for the incoming stream; reset on source switch.
    max_in_picture_id: FullPictureId,
    max_in_tl0_pic_idx: u64,
    max_in_key_idx: u64,

    // ext_outgoing = ext_incoming - offset
    picture_id_offset: i64,
    tl0_pic_idx_offset: i64,
    key_idx_offset: i64,

    // Highest outgoing values, kept across switches.
    ext_last_picture_id: FullPictureId,
    ext_last_tl0_pic_idx: u64,
    ext_last_key_idx: u64,

    // The incoming picture currently being dropped by the temporal gate, so a
    // multi-packet picture only shifts the offset once.
    dropped_picture_id: Option<FullPictureId>,
    // Offsets for pictures skipped by in-order gaps, for late arrivals.
    missing_picture_ids: HashMap<FullPictureId, i64>,
}

impl Vp8Munger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// Locks onto the first packet of a stream; outgoing IDs equal incoming.
    pub fn set_last(&mut self, header: &Vp8Header) {
        self.max_in_picture_id = header.picture_id as u64;
        self.max_in_tl0_pic_idx = header.tl0_pic_idx as u64;
        self.max_in_key_idx = header.key_idx as u64;

        self.picture_id_offset = 0;
        self.tl0_pic_idx_offset = 0;
        self.key_idx_offset = 0;

        self.ext_last_picture_id = header.picture_id as u64;
        self.ext_last_tl0_pic_idx = header.tl0_pic_idx as u64;
        self.ext_last_key_idx = header.key_idx as u64;

        self.dropped_picture_id = None;
        self.missing_picture_ids.clear();
        self.initialized = true;
    }

    /// Re-anchors on a new source so its first picture continues the outbound
    /// sequence one past the last forwarded values.
    pub fn update_offsets(&mut self, header: &Vp8Header) {
        self.max_in_picture_id = header.picture_id as u64;
        self.max_in_tl0_pic_idx = header.tl0_pic_idx as u64;
        self.max_in_key_idx = header.key_idx as u64;

        self.picture_id_offset =
            header.picture_id as i64 - (self.ext_last_picture_id as i64 + 1);
        self.tl0_pic_idx_offset =
            header.tl0_pic_idx as i64 - (self.ext_last_tl0_pic_idx as i64 + 1);
        self.key_idx_offset = header.key_idx as i64 - (self.ext_last_key_idx as i64 + 1);

        self.dropped_picture_id = None;
        self.missing_picture_ids.clear();
    }

    /// Translates one packet's descriptor. `out_of_order` selects the late
    /// arrival path, which can only succeed for pictures whose mapping was
    /// reserved by an in-order gap. `max_temporal` gates TID.
    pub fn update_and_get(
        &mut self,
        header: &Vp8Header,
        out_of_order: bool,
        max_temporal: i8,
    ) -> Result<Vp8Header, Vp8Error> {
        let prev_max = self.max_in_picture_id;
        let ext_picture_id = expand_truncated_counter(
            header.picture_id,
            &mut self.max_in_picture_id,
            PICTURE_ID_WIDTH,
        );
        let ext_tl0 = expand_truncated_counter(
            header.tl0_pic_idx,
            &mut self.max_in_tl0_pic_idx,
            TL0_PIC_IDX_WIDTH,
        );
        let ext_key_idx =
            expand_truncated_counter(header.key_idx, &mut self.max_in_key_idx, KEY_IDX_WIDTH);

        let picture_id_offset = if out_of_order {
            if self.dropped_picture_id == Some(ext_picture_id) {
                return Err(Vp8Error::FilteredTemporalLayer);
            }
            match self.missing_picture_ids.get(&ext_picture_id) {
                Some(offset) => *offset,
                None => return Err(Vp8Error::OutOfOrderPictureIdCacheMiss),
            }
        } else {
            if header.tid_present && header.tid as i8 > max_temporal {
                // The whole picture is gated; shift subsequent pictures down
                // by one, but only once however many packets it spans.
                if self.dropped_picture_id != Some(ext_picture_id) {
                    self.picture_id_offset += 1;
                    self.dropped_picture_id = Some(ext_picture_id);
                }
                return Err(Vp8Error::FilteredTemporalLayer);
            }

            // Reserve mappings for pictures skipped over by this one.
            let mut missing = prev_max.saturating_add(1);
            while missing < ext_picture_id {
                self.missing_picture_ids
                    .insert(missing, self.picture_id_offset);
                missing += 1;
            }
            self.missing_picture_ids
                .retain(|id, _| ext_picture_id.saturating_sub(*id) < MISSING_PICTURE_IDS_MAX);
            self.picture_id_offset
        };

        let out_picture_id = (ext_picture_id as i64 - picture_id_offset) as u64;
        let out_tl0 = (ext_tl0 as i64 - self.tl0_pic_idx_offset) as u64;
        let out_key_idx = (ext_key_idx as i64 - self.key_idx_offset) as u64;

        if out_picture_id > self.ext_last_picture_id {
            self.ext_last_picture_id = out_picture_id;
        }
        if out_tl0 > self.ext_last_tl0_pic_idx {
            self.ext_last_tl0_pic_idx = out_tl0;
        }
        if out_key_idx > self.ext_last_key_idx {
            self.ext_last_key_idx = out_key_idx;
        }

        let mut munged = header.clone();
        munged.picture_id = (out_picture_id & 0x7fff) as TruncatedPictureId;
        munged.tl0_pic_idx = out_tl0 as u8;
        munged.key_idx = (out_key_idx & 0x1f) as u8;
        // Rewrites always carry the 15-bit picture ID.
        if !munged.m_bit {
            munged.m_bit = true;
            munged.header_size += 1;
        }
        Ok(munged)
    }

    /// Builds the descriptor for a blank frame. With `frame_end_needed` the
    /// last picture ID is repeated to close the open frame; otherwise every
    /// counter advances by one and the state advances with it.
    pub fn update_and_get_padding(&mut self, new_picture: bool) -> Vp8Header {
        let advance = new_picture as u64;
        let picture_id = self.ext_last_picture_id + advance;
        let tl0_pic_idx = self.ext_last_tl0_pic_idx + advance;
        let key_idx = self.ext_last_key_idx + advance;

        if new_picture {
            self.ext_last_picture_id = picture_id;
            self.ext_last_tl0_pic_idx = tl0_pic_idx;
            self.ext_last_key_idx = key_idx;
            // Keep the incoming mapping continuous past the consumed IDs.
            self.picture_id_offset -= advance as i64;
            self.tl0_pic_idx_offset -= advance as i64;
            self.key_idx_offset -= advance as i64;
        }

        Vp8Header {
            first_byte: BLANK_FRAME_FIRST_BYTE,
            picture_id_present: true,
            picture_id: (picture_id & 0x7fff) as TruncatedPictureId,
            m_bit: true,
            tl0_pic_idx_present: true,
            tl0_pic_idx: tl0_pic_idx as u8,
            tid_present: true,
            tid: 0,
            y_bit: true,
            key_idx_present: true,
            key_idx: (key_idx & 0x1f) as u8,
            header_size: 6,
            is_key_frame: true,
        }
    }
}
