//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Simulcast layer coordinates and the records produced by the layer allocator.

pub const INVALID_LAYER_SPATIAL: i8 = -1;
pub const INVALID_LAYER_TEMPORAL: i8 = -1;

pub const DEFAULT_MAX_LAYER_SPATIAL: i8 = 2;
pub const DEFAULT_MAX_LAYER_TEMPORAL: i8 = 3;

pub const SPATIAL_LAYER_COUNT: usize = (DEFAULT_MAX_LAYER_SPATIAL + 1) as usize;
pub const TEMPORAL_LAYER_COUNT: usize = (DEFAULT_MAX_LAYER_TEMPORAL + 1) as usize;

/// Bits per second for each `(spatial, temporal)` cell, as measured from the
/// publisher's feed. Zero means the layer is not currently available.
pub type Bitrates = [[i64; TEMPORAL_LAYER_COUNT]; SPATIAL_LAYER_COUNT];

/// A `(spatial, temporal)` coordinate in the simulcast grid.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoLayers {
    pub spatial: i8,
    pub temporal: i8,
}

pub const INVALID_LAYERS: VideoLayers = VideoLayers {
    spatial: INVALID_LAYER_SPATIAL,
    temporal: INVALID_LAYER_TEMPORAL,
};

pub const DEFAULT_MAX_LAYERS: VideoLayers = VideoLayers {
    spatial: DEFAULT_MAX_LAYER_SPATIAL,
    temporal: DEFAULT_MAX_LAYER_TEMPORAL,
};

impl VideoLayers {
    pub fn new(spatial: i8, temporal: i8) -> Self {
        Self { spatial, temporal }
    }

    pub fn is_valid(&self) -> bool {
        self.spatial != INVALID_LAYER_SPATIAL && self.temporal != INVALID_LAYER_TEMPORAL
    }

    /// Spatial-major ordering: a layer is greater when its spatial index is
    /// greater, or equal with a greater temporal index.
    pub fn greater_than(&self, other: &VideoLayers) -> bool {
        self.spatial > other.spatial
            || (self.spatial == other.spatial && self.temporal > other.temporal)
    }
}

impl Default for VideoLayers {
    fn default() -> Self {
        INVALID_LAYERS
    }
}

/// Why a track's forwarding is paused, if it is.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum VideoPauseReason {
    #[default]
    None,
    Muted,
    PubMuted,
    FeedDry,
    Bandwidth,
}

/// The result of one allocator decision. Immutable once returned.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VideoAllocation {
    pub pause_reason: VideoPauseReason,
    pub is_deficient: bool,
    pub bandwidth_requested: i64,
    pub bandwidth_delta: i64,
    pub bitrates: Bitrates,
    pub target_layers: VideoLayers,
    pub request_layer_spatial: i8,
    pub max_layers: VideoLayers,
    pub distance_to_desired: i32,
}

impl Default for VideoAllocation {
    fn default() -> Self {
        Self {
            pause_reason: VideoPauseReason::None,
            is_deficient: false,
            bandwidth_requested: 0,
            bandwidth_delta: 0,
            bitrates: Bitrates::default(),
            target_layers: INVALID_LAYERS,
            request_layer_spatial: INVALID_LAYER_SPATIAL,
            max_layers: INVALID_LAYERS,
            distance_to_desired: 0,
        }
    }
}

/// A proposed move between two targets, with the bandwidth it would give
/// back or consume.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VideoTransition {
    pub from: VideoLayers,
    pub to: VideoLayers,
    pub bandwidth_delta: i64,
}

/// Counts the available (non-zero bitrate) cells strictly between `target`
/// and `max` in spatial-major order. Negative when the target overshoots the
/// max. This is how far the subscriber is from what it asked for, measured in
/// layers it could actually step through.
pub fn distance_to_desired(bitrates: &Bitrates, target: VideoLayers, max: VideoLayers) -> i32 {
    let cell = |s: usize, t: usize| bitrates[s][t] > 0;
    let in_range = |s: i8, t: i8, lo: VideoLayers, hi: VideoLayers| {
        let layer = VideoLayers::new(s, t);
        layer.greater_than(&lo) && !layer.greater_than(&hi)
    };

    if target.is_valid() && target.greater_than(&max) {
        // Overshooting: count the cells from just above max up to the target.
        let mut count = 0;
        for s in 0..SPATIAL_LAYER_COUNT {
            for t in 0..TEMPORAL_LAYER_COUNT {
                if cell(s, t) && in_range(s as i8, t as i8, max, target) {
                    count += 1;
                }
            }
        }
        return -count;
    }

    // An invalid target sits below every real cell, so it counts everything
    // available up to max.
    let floor = target;
    let mut count = 0;
    for s in 0..SPATIAL_LAYER_COUNT {
        for t in 0..TEMPORAL_LAYER_COUNT {
            if cell(s, t) && in_range(s as i8, t as i8, floor, max) {
                count += 1;
            }
        }
    }
    count
}
