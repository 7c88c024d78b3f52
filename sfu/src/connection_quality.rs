//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Periodic per-track connection-quality scoring: a MOS-like score clamped to
//! [1, 5] plus a coarse three-level rating, recomputed on an interval from
//! interval-delta stats supplied by the caller.

use std::sync::Arc;

use relay_common::Duration;
use log::*;
use parking_lot::{Mutex, RwLock};
use tokio::sync::oneshot;

use crate::{config::Config, forwarder::MediaKind};

pub const MIN_SCORE: f32 = 1.0;
pub const MAX_SCORE: f32 = 5.0;

const BASE_SCORE: f32 = 4.5;
const INITIAL_SCORE: f32 = 4.0;

const EXCELLENT_MIN_SCORE: f32 = 3.9;
const GOOD_MIN_SCORE: f32 = 2.5;

// Deductions. Loss is the dominant term: 10% loss lands exactly at the
// Good/Poor boundary.
const LOSS_PENALTY_PER_PERCENT: f32 = 0.25;
const RTT_PENALTY_THRESHOLD_MS: u32 = 250;
const RTT_PENALTY: f32 = 0.5;
const RTT_SEVERE_THRESHOLD_MS: u32 = 500;
const RTT_SEVERE_PENALTY: f32 = 1.0;
const JITTER_PENALTY_THRESHOLD_MS: f32 = 30.0;
const JITTER_PENALTY: f32 = 0.5;
const DTX_DISABLED_PENALTY: f32 = 0.2;
const RESOLUTION_SHORTFALL_PENALTY: f32 = 2.0;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConnectionQuality {
    Excellent,
    Good,
    Poor,
}

pub fn quality_from_score(score: f32) -> ConnectionQuality {
    if score >= EXCELLENT_MIN_SCORE {
        ConnectionQuality::Excellent
    } else if score >= GOOD_MIN_SCORE {
        ConnectionQuality::Good
    } else {
        ConnectionQuality::Poor
    }
}

/// Interval-delta stats for an audio track.
#[derive(Clone, Debug, Default)]
pub struct AudioTrackStats {
    pub duration: Duration,
    pub bytes_sent: u64,
    pub loss_percentage: f32,
    pub rtt_ms: u32,
    pub jitter_ms: f32,
    pub dtx_disabled: bool,
}

/// Interval-delta stats for a video track.
#[derive(Clone, Debug, Default)]
pub struct VideoTrackStats {
    pub duration: Duration,
    pub bytes_sent: u64,
    pub frames: u32,
    pub loss_percentage: f32,
    pub rtt_ms: u32,
    pub jitter_ms: f32,
    /// Carried through for analytics; does not influence the score.
    pub mime_type: String,
    pub expected_height: u32,
    pub actual_height: u32,
}

pub enum TrackStats {
    Audio(AudioTrackStats),
    Video(VideoTrackStats),
}

fn clamp_score(score: f32) -> f32 {
    score.clamp(MIN_SCORE, MAX_SCORE)
}

fn shared_penalties(loss_percentage: f32, rtt_ms: u32, jitter_ms: f32) -> f32 {
    let mut penalty = loss_percentage.max(0.0) * LOSS_PENALTY_PER_PERCENT;
    if rtt_ms > RTT_SEVERE_THRESHOLD_MS {
        penalty += RTT_SEVERE_PENALTY;
    } else if rtt_ms > RTT_PENALTY_THRESHOLD_MS {
        penalty += RTT_PENALTY;
    }
    if jitter_ms > JITTER_PENALTY_THRESHOLD_MS {
        penalty += JITTER_PENALTY;
    }
    penalty
}

pub fn audio_track_score(stats: &AudioTrackStats) -> f32 {
    let mut score = BASE_SCORE;
    score -= shared_penalties(stats.loss_percentage, stats.rtt_ms, stats.jitter_ms);
    if stats.dtx_disabled {
        // No DTX means a higher sustained rate and less concealment headroom.
        score -= DTX_DISABLED_PENALTY;
    }
    clamp_score(score)
}

pub fn video_track_score(stats: &VideoTrackStats) -> f32 {
    if stats.bytes_sent > 0 && stats.frames == 0 {
        // Bytes flowed but no frame completed: frozen video.
        return MIN_SCORE;
    }
    let mut score = BASE_SCORE;
    score -= shared_penalties(stats.loss_percentage, stats.rtt_ms, stats.jitter_ms);
    if stats.expected_height > 0 && stats.actual_height < stats.expected_height {
        let shortfall = 1.0 - (stats.actual_height as f32 / stats.expected_height as f32);
        score -= RESOLUTION_SHORTFALL_PENALTY * shortfall;
    }
    clamp_score(score)
}

pub struct ConnectionStatsParams {
    pub kind: MediaKind,
    /// Returns the delta stats for the last interval; `None` when there is
    /// nothing to score yet.
    pub get_stats: Box<dyn Fn() -> Option<TrackStats> + Send + Sync>,
    pub on_update: Box<dyn Fn(f32, ConnectionQuality) + Send + Sync>,
}

struct StatsInner {
    params: ConnectionStatsParams,
    score: RwLock<f32>,
}

impl StatsInner {
    fn update_score(&self) -> Option<(f32, ConnectionQuality)> {
        let stats = (self.params.get_stats)()?;
        let score = match (&self.params.kind, stats) {
            (MediaKind::Audio, TrackStats::Audio(stats)) => {
                if stats.bytes_sent == 0 || stats.duration.is_zero() {
                    return None;
                }
                audio_track_score(&stats)
            }
            (MediaKind::Video, TrackStats::Video(stats)) => {
                if stats.bytes_sent == 0 || stats.duration.is_zero() {
                    return None;
                }
                video_track_score(&stats)
            }
            _ => {
                warn!("track stats do not match the track kind");
                return None;
            }
        };
        *self.score.write() = score;
        Some((score, quality_from_score(score)))
    }
}

/// Recomputes the score on an interval (default 2 s) until closed.
/// Must be created from within a tokio runtime.
pub struct ConnectionStats {
    inner: Arc<StatsInner>,
    close_tx: Mutex<Option<oneshot::Sender<()>>>,
}

impl ConnectionStats {
    pub fn new(params: ConnectionStatsParams, config: &Config) -> Self {
        let inner = Arc::new(StatsInner {
            params,
            score: RwLock::new(INITIAL_SCORE),
        });
        let (close_tx, mut close_rx) = oneshot::channel::<()>();
        let interval =
            Duration::from_millis(config.connection_quality_update_interval_ms);
        let worker_inner = Arc::clone(&inner);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval.into());
            loop {
                tokio::select! {
                    _ = &mut close_rx => {
                        return;
                    }
                    _ = tick.tick() => {
                        if let Some((score, quality)) = worker_inner.update_score() {
                            (worker_inner.params.on_update)(score, quality);
                        }
                    }
                }
            }
        });
        Self {
            inner,
            close_tx: Mutex::new(Some(close_tx)),
        }
    }

    pub fn get_score(&self) -> f32 {
        *self.inner.score.read()
    }

    /// Idempotent.
    pub fn close(&self) {
        if let Some(close_tx) = self.close_tx.lock().take() {
            let _ = close_tx.send(());
        }
    }
}

impl Drop for ConnectionStats {
    fn drop(&mut self) {
        self.close();
    }
}
