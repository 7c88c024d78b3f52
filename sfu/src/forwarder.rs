//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Per-subscriber-track forwarding engine: decides which simulcast layer to
//! send under a bandwidth budget and rewrites each packet so that layer and
//! source switches are invisible to the receiver.
//!
//! The struct is single-writer on the packet path; callers serialize
//! allocator calls per track (typically by holding the track under a mutex).

use log::*;
use thiserror::Error;

use crate::{
    layers::{
        distance_to_desired, Bitrates, VideoAllocation, VideoLayers, VideoPauseReason,
        VideoTransition, DEFAULT_MAX_LAYER_SPATIAL, DEFAULT_MAX_LAYER_TEMPORAL,
        INVALID_LAYERS, INVALID_LAYER_SPATIAL,
    },
    rtp::{ExtPacket, Ssrc},
    rtp_munger::{RtpMunger, RtpMungerError, SequenceNumberOrdering, SnTs, TranslationParamsRtp},
    vp8::{Vp8Error, Vp8Header, Vp8Munger},
};

/// Effectively-unbounded channel capacity for allocator calls that should
/// ignore the budget.
pub const CHANNEL_CAPACITY_INFINITY: i64 = 100_000_000;

/// Nominal frame rate used to pace bare padding packets.
const PADDING_FRAME_RATE: u32 = 5;

const TRANSITION_COST_SPATIAL: i32 = 10;
const TRANSITION_COST_TEMPORAL: i32 = 2;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MediaKind {
    Audio,
    Video,
}

/// The closed set of codecs the forwarder translates.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Codec {
    Opus,
    Vp8,
    H264,
}

impl Codec {
    pub fn clock_rate(&self) -> u32 {
        match self {
            Codec::Opus => 48_000,
            Codec::Vp8 | Codec::H264 => 90_000,
        }
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ForwarderError {
    #[error("forwarder has not locked onto a stream")]
    NotStarted,
}

/// The decision for one packet: drop it, or forward it with these rewritten
/// fields.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TranslationParams {
    pub should_drop: bool,
    /// A drop worth surfacing (unexpected reordering), as opposed to routine
    /// duplicates and swallowed padding.
    pub is_dropping_relevant: bool,
    pub is_switching_to_target_layer: bool,
    pub is_switching_to_max_layer: bool,
    pub rtp: Option<TranslationParamsRtp>,
    pub vp8: Option<Vp8Header>,
}

impl TranslationParams {
    fn drop_packet(relevant: bool) -> Self {
        Self {
            should_drop: true,
            is_dropping_relevant: relevant,
            ..Default::default()
        }
    }
}

struct ProvisionalAllocation {
    bitrates: Bitrates,
    allocated_layers: VideoLayers,
}

pub struct Forwarder {
    kind: MediaKind,
    codec: Option<Codec>,

    started: bool,
    muted: bool,
    pub_muted: bool,
    last_ssrc: Ssrc,
    max_published_spatial: i8,

    max_layers: VideoLayers,
    current_layers: VideoLayers,
    target_layers: VideoLayers,
    parked_layers: VideoLayers,

    provisional: Option<ProvisionalAllocation>,
    last_allocation: VideoAllocation,

    rtp_munger: RtpMunger,
    vp8_munger: Option<Vp8Munger>,
}

impl Forwarder {
    pub fn new(kind: MediaKind) -> Self {
        let max_layers = match kind {
            MediaKind::Audio => INVALID_LAYERS,
            // Spatial stays unset until the subscriber expresses a cap.
            MediaKind::Video => VideoLayers::new(INVALID_LAYER_SPATIAL, DEFAULT_MAX_LAYER_TEMPORAL),
        };
        Self {
            kind,
            codec: None,
            started: false,
            muted: false,
            pub_muted: false,
            last_ssrc: 0,
            max_published_spatial: INVALID_LAYER_SPATIAL,
            max_layers,
            current_layers: INVALID_LAYERS,
            target_layers: INVALID_LAYERS,
            parked_layers: INVALID_LAYERS,
            provisional: None,
            last_allocation: VideoAllocation::default(),
            rtp_munger: RtpMunger::new(),
            vp8_munger: None,
        }
    }

    /// Fixes the codec once the publisher's track is known. Only the first
    /// call has any effect.
    pub fn determine_codec(&mut self, codec: Codec) {
        if self.codec.is_some() {
            return;
        }
        self.codec = Some(codec);
        if codec == Codec::Vp8 {
            self.vp8_munger = Some(Vp8Munger::new());
        }
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub fn last_ssrc(&self) -> Ssrc {
        self.last_ssrc
    }

    pub fn is_muted(&self) -> bool {
        self.muted
    }

    pub fn is_pub_muted(&self) -> bool {
        self.pub_muted
    }

    /// Returns whether the mute state changed, and the max layers for the
    /// caller's bookkeeping.
    pub fn mute(&mut self, muted: bool) -> (bool, VideoLayers) {
        if self.muted == muted {
            return (false, self.max_layers);
        }
        self.muted = muted;
        (true, self.max_layers)
    }

    /// Publisher-side mute. Parks the current layers so that a later unmute
    /// can resume opportunistically without waiting for a fresh allocation.
    pub fn pub_mute(&mut self, pub_muted: bool) -> (bool, VideoLayers) {
        if self.pub_muted == pub_muted {
            return (false, self.max_layers);
        }
        self.pub_muted = pub_muted;
        if pub_muted && self.kind == MediaKind::Video && self.current_layers.is_valid() {
            self.parked_layers = self.current_layers;
            self.current_layers = INVALID_LAYERS;
        }
        (true, self.max_layers)
    }

    pub fn max_layers(&self) -> VideoLayers {
        self.max_layers
    }

    pub fn current_layers(&self) -> VideoLayers {
        self.current_layers
    }

    pub fn target_layers(&self) -> VideoLayers {
        self.target_layers
    }

    pub fn set_max_published_layer(&mut self, spatial: i8) {
        self.max_published_spatial = spatial;
    }

    pub fn set_max_spatial_layer(&mut self, spatial: i8) -> (bool, VideoLayers, VideoLayers) {
        if self.kind != MediaKind::Video || spatial == self.max_layers.spatial {
            return (false, self.max_layers, self.current_layers);
        }
        self.max_layers.spatial = spatial;
        (true, self.max_layers, self.current_layers)
    }

    pub fn set_max_temporal_layer(&mut self, temporal: i8) -> (bool, VideoLayers, VideoLayers) {
        if self.kind != MediaKind::Video || temporal == self.max_layers.temporal {
            return (false, self.max_layers, self.current_layers);
        }
        self.max_layers.temporal = temporal;
        (true, self.max_layers, self.current_layers)
    }

    pub fn last_allocation(&self) -> &VideoAllocation {
        &self.last_allocation
    }

    /// The bitrate of the best available cell at or below the max layers.
    /// Zero when muted, when the publisher has not reported a published
    /// layer, or when nothing under the cap has traffic.
    fn optimal_bandwidth_needed(&self, bitrates: &Bitrates) -> i64 {
        if self.muted
            || self.pub_muted
            || self.max_published_spatial == INVALID_LAYER_SPATIAL
            || !self.max_layers.is_valid()
        {
            return 0;
        }
        for s in (0..=self.max_layers.spatial as usize).rev() {
            for t in (0..=self.max_layers.temporal as usize).rev() {
                if bitrates[s][t] > 0 {
                    return bitrates[s][t];
                }
            }
        }
        0
    }

    fn bitrate_of(bitrates: &Bitrates, layers: VideoLayers) -> i64 {
        if !layers.is_valid() {
            return 0;
        }
        bitrates[layers.spatial as usize][layers.temporal as usize]
    }

    /// Finalizes an allocation: computes the layer distance, installs the new
    /// target, and remembers the record for delta computation next time.
    fn commit_allocation(&mut self, mut alloc: VideoAllocation) -> VideoAllocation {
        alloc.distance_to_desired = match alloc.pause_reason {
            VideoPauseReason::Muted | VideoPauseReason::PubMuted | VideoPauseReason::FeedDry => 0,
            _ => distance_to_desired(&alloc.bitrates, alloc.target_layers, alloc.max_layers),
        };
        self.target_layers = alloc.target_layers;
        self.last_allocation = alloc.clone();
        alloc
    }

    /// Chooses the best available layer under the max, ignoring the budget.
    /// `available_layers` is the publisher's hint of spatial layers that are
    /// currently flowing, consulted when the bitrate matrix is dry.
    pub fn allocate_optimal(
        &mut self,
        available_layers: Option<&[i8]>,
        bitrates: Bitrates,
        allow_overshoot: bool,
    ) -> VideoAllocation {
        if self.kind != MediaKind::Video {
            return self.last_allocation.clone();
        }

        let optimal = self.optimal_bandwidth_needed(&bitrates);
        let mut alloc = VideoAllocation {
            bitrates,
            max_layers: self.max_layers,
            ..Default::default()
        };

        if self.muted {
            alloc.pause_reason = VideoPauseReason::Muted;
        } else if self.pub_muted {
            alloc.pause_reason = VideoPauseReason::PubMuted;
        } else if !self.max_layers.is_valid() {
            alloc.pause_reason = VideoPauseReason::FeedDry;
        } else if optimal > 0 {
            'outer: for s in (0..=self.max_layers.spatial as usize).rev() {
                for t in (0..=self.max_layers.temporal as usize).rev() {
                    if bitrates[s][t] > 0 {
                        alloc.target_layers = VideoLayers::new(s as i8, t as i8);
                        alloc.request_layer_spatial = s as i8;
                        alloc.bandwidth_requested = bitrates[s][t];
                        break 'outer;
                    }
                }
            }
        } else if allow_overshoot
            && self.max_published_spatial != INVALID_LAYER_SPATIAL
            && Self::lowest_spatial_above_max(&bitrates, self.max_layers) != INVALID_LAYERS
        {
            // Nothing under the cap has traffic but a higher layer does.
            let target = Self::lowest_spatial_above_max(&bitrates, self.max_layers);
            alloc.target_layers = target;
            alloc.request_layer_spatial = target.spatial;
            alloc.bandwidth_requested = Self::bitrate_of(&bitrates, target);
        } else {
            alloc.pause_reason = VideoPauseReason::FeedDry;
            if self.parked_layers.is_valid() {
                alloc.target_layers = self.parked_layers;
                alloc.request_layer_spatial = self.parked_layers.spatial;
            } else if self.current_layers.is_valid() {
                let available = available_layers.unwrap_or(&[]);
                if available.is_empty() || available.contains(&self.current_layers.spatial) {
                    // Stay where we are; packets may still trickle in.
                    alloc.target_layers = self.current_layers;
                    alloc.request_layer_spatial = self.current_layers.spatial;
                } else {
                    // The current layer stopped; chase the highest one that
                    // the publisher says is alive.
                    let mut spatial = available.iter().copied().max().unwrap_or(0);
                    if !allow_overshoot && spatial > self.max_layers.spatial {
                        spatial = self.max_layers.spatial;
                    }
                    alloc.target_layers = VideoLayers::new(spatial, DEFAULT_MAX_LAYER_TEMPORAL);
                    alloc.request_layer_spatial =
                        self.max_layers.spatial.min(self.max_published_spatial);
                }
            } else if self.max_published_spatial != INVALID_LAYER_SPATIAL {
                // Not forwarding anything; set up an opportunistic target so
                // forwarding can start the moment packets arrive.
                let request = self.max_layers.spatial.min(self.max_published_spatial);
                let spatial = if allow_overshoot {
                    self.max_published_spatial
                } else {
                    request
                };
                alloc.target_layers = VideoLayers::new(spatial, DEFAULT_MAX_LAYER_TEMPORAL);
                alloc.request_layer_spatial = request;
            }
        }

        alloc.bandwidth_delta =
            alloc.bandwidth_requested - self.last_allocation.bandwidth_requested;
        self.commit_allocation(alloc)
    }

    fn lowest_spatial_above_max(bitrates: &Bitrates, max_layers: VideoLayers) -> VideoLayers {
        let above = (max_layers.spatial + 1).max(0);
        for s in above as usize..=DEFAULT_MAX_LAYER_SPATIAL as usize {
            for t in (0..=DEFAULT_MAX_LAYER_TEMPORAL as usize).rev() {
                if bitrates[s][t] > 0 {
                    return VideoLayers::new(s as i8, t as i8);
                }
            }
        }
        INVALID_LAYERS
    }

    /// Snapshots the bitrate matrix and resets the provisional accumulator
    /// for a round of iterative allocation.
    pub fn provisional_allocate_prepare(&mut self, bitrates: Bitrates) {
        self.provisional = Some(ProvisionalAllocation {
            bitrates,
            allocated_layers: INVALID_LAYERS,
        });
    }

    /// One step of iterative bin-packing. Commits `layers` provisionally when
    /// it fits (or must be taken because pausing is disallowed or overshoot
    /// is permitted) and returns the bitrate delta versus the previously
    /// committed cell; returns 0 when the cell is skipped.
    pub fn provisional_allocate(
        &mut self,
        available_channel_capacity: i64,
        layers: VideoLayers,
        allow_pause: bool,
        allow_overshoot: bool,
    ) -> i64 {
        if self.muted || self.pub_muted || !layers.is_valid() {
            return 0;
        }
        let max_layers = self.max_layers;
        let Some(provisional) = self.provisional.as_mut() else {
            return 0;
        };

        let required = provisional.bitrates[layers.spatial as usize][layers.temporal as usize];
        if required == 0 {
            return 0;
        }
        let already_allocated = if provisional.allocated_layers.is_valid() {
            provisional.bitrates[provisional.allocated_layers.spatial as usize]
                [provisional.allocated_layers.temporal as usize]
        } else {
            0
        };

        // A layer under the maximum that fits is always taken.
        if !layers.greater_than(&max_layers)
            && required <= available_channel_capacity + already_allocated
        {
            provisional.allocated_layers = layers;
            return required - already_allocated;
        }

        // The layer does not fit, or is above the maximum. If pausing is not
        // allowed, take the lowest candidate offered so far so that something
        // streams.
        if !allow_pause
            && (!provisional.allocated_layers.is_valid()
                || !layers.greater_than(&provisional.allocated_layers))
        {
            provisional.allocated_layers = layers;
            return required - already_allocated;
        }

        if allow_overshoot && layers.greater_than(&max_layers) {
            provisional.allocated_layers = layers;
            return required - already_allocated;
        }

        0
    }

    /// Finalizes the provisional selection as the new target.
    pub fn provisional_allocate_commit(&mut self) -> VideoAllocation {
        let Some(provisional) = self.provisional.as_ref() else {
            return self.last_allocation.clone();
        };
        let bitrates = provisional.bitrates;
        let allocated_layers = provisional.allocated_layers;
        let optimal = self.optimal_bandwidth_needed(&bitrates);

        let mut alloc = VideoAllocation {
            bitrates,
            max_layers: self.max_layers,
            ..Default::default()
        };

        if self.muted {
            alloc.pause_reason = VideoPauseReason::Muted;
        } else if self.pub_muted {
            alloc.pause_reason = VideoPauseReason::PubMuted;
        } else if allocated_layers.is_valid() {
            alloc.target_layers = allocated_layers;
            alloc.request_layer_spatial = allocated_layers.spatial;
            alloc.bandwidth_requested = Self::bitrate_of(&bitrates, allocated_layers);
            alloc.is_deficient = optimal > 0 && alloc.bandwidth_requested < optimal;
        } else if optimal == 0 {
            alloc.pause_reason = VideoPauseReason::FeedDry;
            if self.current_layers.is_valid() {
                if !self.current_layers.greater_than(&self.max_layers) {
                    // Keep the target at current for opportunistic forwarding.
                    alloc.target_layers = self.current_layers;
                    alloc.request_layer_spatial = self.current_layers.spatial;
                } else {
                    // Current exceeds the cap with nothing flowing; stop.
                    self.current_layers = INVALID_LAYERS;
                }
            }
        } else {
            alloc.pause_reason = VideoPauseReason::Bandwidth;
            alloc.is_deficient = true;
        }

        alloc.bandwidth_delta =
            alloc.bandwidth_requested - self.last_allocation.bandwidth_requested;
        self.commit_allocation(alloc)
    }

    /// Proposes the smallest change from the current target that keeps the
    /// stream viable: keep the target if it still has traffic, otherwise
    /// degrade to the best cell at or below it, or start from the lowest
    /// available cell when nothing is targeted yet.
    pub fn provisional_allocate_get_cooperative_transition(
        &mut self,
        allow_overshoot: bool,
    ) -> VideoTransition {
        let existing = self.last_allocation.bandwidth_requested;
        let from = self.target_layers;
        let max_layers = self.max_layers;
        let current_layers = self.current_layers;
        let muted = self.muted || self.pub_muted;
        let Some(provisional) = self.provisional.as_mut() else {
            return VideoTransition {
                from,
                to: from,
                bandwidth_delta: 0,
            };
        };

        if muted {
            provisional.allocated_layers = INVALID_LAYERS;
            return VideoTransition {
                from,
                to: INVALID_LAYERS,
                bandwidth_delta: -existing,
            };
        }

        let bitrates = &provisional.bitrates;
        let cell = |layers: VideoLayers| {
            bitrates[layers.spatial as usize][layers.temporal as usize]
        };

        if !from.is_valid() {
            let mut best = INVALID_LAYERS;
            if max_layers.is_valid() {
                'outer: for s in 0..=max_layers.spatial as usize {
                    for t in 0..=max_layers.temporal as usize {
                        if bitrates[s][t] > 0 {
                            best = VideoLayers::new(s as i8, t as i8);
                            break 'outer;
                        }
                    }
                }
            }
            if !best.is_valid() && allow_overshoot {
                'outer: for s in
                    (max_layers.spatial + 1).max(0) as usize..=DEFAULT_MAX_LAYER_SPATIAL as usize
                {
                    for t in 0..=DEFAULT_MAX_LAYER_TEMPORAL as usize {
                        if bitrates[s][t] > 0 {
                            best = VideoLayers::new(s as i8, t as i8);
                            break 'outer;
                        }
                    }
                }
            }
            if !best.is_valid() && current_layers.is_valid() {
                // Feed is dry; continue at current for opportunistic
                // forwarding.
                best = current_layers;
            }
            provisional.allocated_layers = best;
            let bandwidth = if best.is_valid() { cell(best) } else { 0 };
            return VideoTransition {
                from,
                to: best,
                bandwidth_delta: bandwidth - existing,
            };
        }

        if cell(from) > 0 {
            provisional.allocated_layers = from;
            return VideoTransition {
                from,
                to: from,
                bandwidth_delta: cell(from) - existing,
            };
        }

        // The target went dry; take the best cell at or below it.
        let mut best = INVALID_LAYERS;
        'outer: for s in (0..=from.spatial).rev() {
            let t_top = if s == from.spatial {
                from.temporal
            } else {
                DEFAULT_MAX_LAYER_TEMPORAL
            };
            for t in (0..=t_top).rev() {
                if bitrates[s as usize][t as usize] > 0 {
                    best = VideoLayers::new(s, t);
                    break 'outer;
                }
            }
        }
        provisional.allocated_layers = best;
        let bandwidth = if best.is_valid() { cell(best) } else { 0 };
        VideoTransition {
            from,
            to: best,
            bandwidth_delta: bandwidth - existing,
        }
    }

    /// Picks the downward transition that frees the most bandwidth per unit
    /// of quality lost, preferring temporal drops over spatial ones.
    pub fn provisional_allocate_get_best_weighted_transition(&mut self) -> VideoTransition {
        let existing = self.last_allocation.bandwidth_requested;
        let from = self.target_layers;
        let max_layers = self.max_layers;
        let muted = self.muted || self.pub_muted;
        let Some(provisional) = self.provisional.as_mut() else {
            return VideoTransition {
                from,
                to: from,
                bandwidth_delta: 0,
            };
        };

        if muted || !from.is_valid() {
            provisional.allocated_layers = INVALID_LAYERS;
            return VideoTransition {
                from,
                to: INVALID_LAYERS,
                bandwidth_delta: -existing,
            };
        }

        let bitrates = &provisional.bitrates;
        let mut max_reachable_temporal = -1i8;
        if max_layers.is_valid() {
            'outer: for t in (0..=max_layers.temporal).rev() {
                for s in (0..=max_layers.spatial).rev() {
                    if bitrates[s as usize][t as usize] != 0 {
                        max_reachable_temporal = t;
                        break 'outer;
                    }
                }
            }
        }
        if max_reachable_temporal < 0 {
            provisional.allocated_layers = INVALID_LAYERS;
            return VideoTransition {
                from,
                to: INVALID_LAYERS,
                bandwidth_delta: -existing,
            };
        }

        let mut best = INVALID_LAYERS;
        let mut best_delta = 0i64;
        let mut best_value = 0f32;
        for s in 0..=from.spatial {
            for t in 0..=from.temporal {
                let bandwidth_delta =
                    (existing - bitrates[s as usize][t as usize]).max(0);

                let mut transition_cost = 0i32;
                if s != from.spatial {
                    transition_cost = TRANSITION_COST_SPATIAL;
                }
                if t != from.temporal {
                    transition_cost += TRANSITION_COST_TEMPORAL;
                }

                let quality_cost = (max_reachable_temporal as i32 + 1)
                    * (from.spatial - s) as i32
                    + (from.temporal - t) as i32;

                let value = if transition_cost + quality_cost != 0 {
                    bandwidth_delta as f32 / (transition_cost + quality_cost) as f32
                } else {
                    0.0
                };
                if value > best_value || (value == best_value && bandwidth_delta < best_delta) {
                    best_value = value;
                    best_delta = bandwidth_delta;
                    best = VideoLayers::new(s, t);
                }
            }
        }

        provisional.allocated_layers = best;
        VideoTransition {
            from,
            to: best,
            bandwidth_delta: best_delta,
        }
    }

    /// Moves one step up from the current target when deficient and caught
    /// up, preferring a temporal bump to a spatial one. Returns the resulting
    /// allocation and whether a bump happened.
    pub fn allocate_next_higher(
        &mut self,
        available_channel_capacity: i64,
        bitrates: Bitrates,
        allow_overshoot: bool,
    ) -> (VideoAllocation, bool) {
        if self.kind != MediaKind::Video {
            return (self.last_allocation.clone(), false);
        }
        if !self.last_allocation.is_deficient {
            return (self.last_allocation.clone(), false);
        }
        // Wait for the stream to reach the current target before going
        // higher.
        if self.target_layers.is_valid() && self.current_layers != self.target_layers {
            return (self.last_allocation.clone(), false);
        }

        let optimal = self.optimal_bandwidth_needed(&bitrates);
        let already_allocated = Self::bitrate_of(&bitrates, self.target_layers);

        let mut candidates: Vec<VideoLayers> = Vec::new();
        if self.max_layers.is_valid() {
            if self.target_layers.is_valid() {
                for t in self.target_layers.temporal + 1..=self.max_layers.temporal {
                    candidates.push(VideoLayers::new(self.target_layers.spatial, t));
                }
                for s in self.target_layers.spatial + 1..=self.max_layers.spatial {
                    for t in 0..=self.max_layers.temporal {
                        candidates.push(VideoLayers::new(s, t));
                    }
                }
            } else {
                for s in 0..=self.max_layers.spatial {
                    for t in 0..=self.max_layers.temporal {
                        candidates.push(VideoLayers::new(s, t));
                    }
                }
            }
        }

        for layers in candidates {
            let required = Self::bitrate_of(&bitrates, layers);
            if required == 0 {
                continue;
            }
            let delta = required - already_allocated;
            if delta > available_channel_capacity {
                continue;
            }
            let alloc = VideoAllocation {
                is_deficient: optimal > 0 && required < optimal,
                bandwidth_requested: required,
                bandwidth_delta: delta,
                bitrates,
                target_layers: layers,
                request_layer_spatial: layers.spatial,
                max_layers: self.max_layers,
                ..Default::default()
            };
            return (self.commit_allocation(alloc), true);
        }

        if allow_overshoot {
            let target = Self::lowest_spatial_above_max(&bitrates, self.max_layers);
            if target.is_valid() {
                // Take the lowest temporal of the overshoot spatial; capacity
                // does not gate an explicit overshoot request.
                let layers = VideoLayers::new(target.spatial, 0);
                let required = Self::bitrate_of(&bitrates, layers);
                if required > 0 {
                    let alloc = VideoAllocation {
                        is_deficient: optimal > 0 && required < optimal,
                        bandwidth_requested: required,
                        bandwidth_delta: required - already_allocated,
                        bitrates,
                        target_layers: layers,
                        request_layer_spatial: layers.spatial,
                        max_layers: self.max_layers,
                        ..Default::default()
                    };
                    return (self.commit_allocation(alloc), true);
                }
            }
        }

        (self.last_allocation.clone(), false)
    }

    /// Stops forwarding for lack of bandwidth (or because of mutes, which
    /// take precedence in the recorded reason).
    pub fn pause(&mut self, bitrates: Bitrates) -> VideoAllocation {
        let optimal = self.optimal_bandwidth_needed(&bitrates);
        let mut alloc = VideoAllocation {
            bitrates,
            max_layers: self.max_layers,
            bandwidth_delta: -self.last_allocation.bandwidth_requested,
            ..Default::default()
        };
        if self.muted {
            alloc.pause_reason = VideoPauseReason::Muted;
        } else if self.pub_muted {
            alloc.pause_reason = VideoPauseReason::PubMuted;
        } else if optimal == 0 {
            alloc.pause_reason = VideoPauseReason::FeedDry;
        } else {
            alloc.pause_reason = VideoPauseReason::Bandwidth;
            alloc.is_deficient = true;
        }
        self.commit_allocation(alloc)
    }

    /// Translates one source packet into a forward/drop decision.
    /// `spatial_layer` is the publisher's spatial index for the packet's
    /// SSRC.
    pub fn get_translation_params(
        &mut self,
        packet: &ExtPacket,
        spatial_layer: i8,
    ) -> Result<TranslationParams, ForwarderError> {
        if self.muted || self.pub_muted {
            return Ok(TranslationParams::drop_packet(false));
        }
        match self.kind {
            MediaKind::Audio => self.get_translation_params_audio(packet),
            MediaKind::Video => self.get_translation_params_video(packet, spatial_layer),
        }
    }

    fn get_translation_params_audio(
        &mut self,
        packet: &ExtPacket,
    ) -> Result<TranslationParams, ForwarderError> {
        if !self.started {
            self.started = true;
            self.last_ssrc = packet.header.ssrc;
            self.rtp_munger.set_last_sn_ts(packet);
            return Ok(TranslationParams {
                rtp: Some(TranslationParamsRtp {
                    sn_ordering: SequenceNumberOrdering::Contiguous,
                    sequence_number: packet.header.seqnum,
                    timestamp: packet.header.timestamp,
                }),
                ..Default::default()
            });
        }

        if self.last_ssrc != packet.header.ssrc {
            // Audio sources switch freely; splice immediately.
            self.rtp_munger.update_sn_ts_offsets(packet, 1, 1);
            self.last_ssrc = packet.header.ssrc;
        }

        Ok(self.translate_rtp(packet))
    }

    fn get_translation_params_video(
        &mut self,
        packet: &ExtPacket,
        spatial_layer: i8,
    ) -> Result<TranslationParams, ForwarderError> {
        if !self.target_layers.is_valid() {
            return Ok(TranslationParams::drop_packet(false));
        }

        let mut tp = TranslationParams::default();

        if !self.started {
            // Lock onto the stream at a key frame of the target spatial.
            if !packet.is_key_frame || spatial_layer != self.target_layers.spatial {
                return Ok(TranslationParams::drop_packet(false));
            }
            self.started = true;
            self.last_ssrc = packet.header.ssrc;
            self.current_layers = VideoLayers::new(spatial_layer, self.target_layers.temporal);
            self.parked_layers = INVALID_LAYERS;
            tp.is_switching_to_target_layer = true;
            tp.is_switching_to_max_layer =
                self.target_layers.spatial >= self.max_layers.spatial;
            trace!(
                "locking onto ssrc {} at layer {}",
                packet.header.ssrc,
                spatial_layer
            );
            self.rtp_munger.set_last_sn_ts(packet);
            if let (Some(munger), Some(vp8)) = (self.vp8_munger.as_mut(), packet.vp8.as_ref()) {
                munger.set_last(vp8);
            }
            tp.rtp = Some(TranslationParamsRtp {
                sn_ordering: SequenceNumberOrdering::Contiguous,
                sequence_number: packet.header.seqnum,
                timestamp: packet.header.timestamp,
            });
            tp.vp8 = packet.vp8.clone();
            return Ok(tp);
        }

        if self.last_ssrc != packet.header.ssrc {
            // A different simulcast layer. Switch only at a key frame of the
            // target spatial; everything else from foreign SSRCs drops.
            if !packet.is_key_frame || spatial_layer != self.target_layers.spatial {
                return Ok(TranslationParams::drop_packet(false));
            }
            trace!(
                "switching from ssrc {} to ssrc {} at layer {}",
                self.last_ssrc,
                packet.header.ssrc,
                spatial_layer
            );
            self.last_ssrc = packet.header.ssrc;
            self.current_layers = VideoLayers::new(spatial_layer, self.target_layers.temporal);
            self.parked_layers = INVALID_LAYERS;
            tp.is_switching_to_target_layer = true;
            tp.is_switching_to_max_layer =
                self.target_layers.spatial >= self.max_layers.spatial;
            self.rtp_munger.update_sn_ts_offsets(packet, 1, 1);
            if let (Some(munger), Some(vp8)) = (self.vp8_munger.as_mut(), packet.vp8.as_ref()) {
                munger.update_offsets(vp8);
            }
        }

        let translated = self.translate_rtp(packet);
        if translated.should_drop {
            return Ok(TranslationParams {
                should_drop: true,
                is_dropping_relevant: translated.is_dropping_relevant,
                ..tp
            });
        }
        let rtp = translated.rtp.expect("translated packet has rtp params");
        tp.rtp = Some(rtp);

        if let (Some(munger), Some(vp8)) = (self.vp8_munger.as_mut(), packet.vp8.as_ref()) {
            let out_of_order = rtp.sn_ordering == SequenceNumberOrdering::OutOfOrder;
            match munger.update_and_get(vp8, out_of_order, self.target_layers.temporal) {
                Ok(header) => tp.vp8 = Some(header),
                Err(Vp8Error::FilteredTemporalLayer) => {
                    // The RTP munger consumed an outbound slot for this
                    // packet; take it back so the stream stays contiguous.
                    self.rtp_munger.packet_dropped(&rtp);
                    return Ok(TranslationParams::drop_packet(false));
                }
                Err(Vp8Error::OutOfOrderPictureIdCacheMiss) => {
                    return Ok(TranslationParams::drop_packet(false));
                }
                Err(err) => {
                    debug!("vp8 munging failed: {}", err);
                    return Ok(TranslationParams::drop_packet(true));
                }
            }
        }

        Ok(tp)
    }

    fn translate_rtp(&mut self, packet: &ExtPacket) -> TranslationParams {
        match self.rtp_munger.update_and_get_sn_ts(packet) {
            Ok(rtp) => TranslationParams {
                rtp: Some(rtp),
                ..Default::default()
            },
            Err(RtpMungerError::DuplicatePacket) | Err(RtpMungerError::PaddingOnlyPacket) => {
                TranslationParams::drop_packet(false)
            }
            Err(RtpMungerError::OutOfOrderSequenceNumberCacheMiss) => {
                TranslationParams::drop_packet(true)
            }
            Err(RtpMungerError::NotStarted) => TranslationParams::drop_packet(false),
        }
    }

    /// Sequence numbers and timestamps for padding packets continuing the
    /// outbound stream.
    pub fn get_sn_ts_for_padding(&mut self, num: usize) -> Result<Vec<SnTs>, ForwarderError> {
        let frame_end_needed = !self.rtp_munger.is_on_frame_boundary();
        self.rtp_munger
            .update_and_get_padding_sn_ts(num, 0, PADDING_FRAME_RATE, frame_end_needed)
            .map_err(|_| ForwarderError::NotStarted)
    }

    /// Sequence numbers and timestamps for `num` blank frames at the given
    /// frame rate. When the previous frame is still open, one extra packet is
    /// generated to close it; the flag says so.
    pub fn get_sn_ts_for_blank_frames(
        &mut self,
        frame_rate: u32,
        num: usize,
    ) -> Result<(Vec<SnTs>, bool), ForwarderError> {
        let frame_end_needed = !self.rtp_munger.is_on_frame_boundary();
        let count = num + frame_end_needed as usize;
        let clock_rate = self.codec.map(|c| c.clock_rate()).unwrap_or(90_000);
        let pairs = self
            .rtp_munger
            .update_and_get_padding_sn_ts(count, clock_rate, frame_rate, frame_end_needed)
            .map_err(|_| ForwarderError::NotStarted)?;
        Ok((pairs, frame_end_needed))
    }

    /// The VP8 descriptor for a blank frame. Repeats the last picture ID when
    /// closing an open frame; otherwise advances every counter by one.
    pub fn get_padding_vp8(&mut self, frame_end_needed: bool) -> Option<Vp8Header> {
        self.vp8_munger
            .as_mut()
            .map(|munger| munger.update_and_get_padding(!frame_end_needed))
    }
}
