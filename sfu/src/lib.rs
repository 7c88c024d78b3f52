//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! The media forwarding core of a selective forwarding unit: per-subscriber
//! layer allocation, packet translation across simulcast layer and source
//! switches, subscription reconciliation, pacing, and connection-quality
//! scoring. Transport (ICE/DTLS/SRTP), signaling, and congestion control are
//! collaborators, not residents.

pub mod config;
pub mod connection_quality;
pub mod forwarder;
pub mod layers;
pub mod pacer;
pub mod rtp;
pub mod rtp_munger;
pub mod subscription;
pub mod updates;
pub mod vp8;
pub mod wraparound;
