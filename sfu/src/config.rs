//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Configuration options for the forwarding core.

use clap;

/// General configuration options, set by command line arguments or falls
/// back to defaults. All timings are per-instance so tests can shrink them.
#[derive(Default, clap::Parser, Debug, Clone)]
#[clap(name = "relay_sfu")]
pub struct Config {
    /// How often the subscription reconciler sweeps all subscriptions (ms).
    #[clap(long, default_value = "3000")]
    pub reconcile_interval_ms: u64,

    /// How long to keep retrying a subscription whose publisher or track
    /// cannot be found before dropping the desire for it (ms).
    #[clap(long, default_value = "5000")]
    pub not_found_timeout_ms: u64,

    /// How long a subscription may stay unsatisfied or unbound before the
    /// subscription-error callback fires (ms).
    #[clap(long, default_value = "10000")]
    pub subscription_timeout_ms: u64,

    /// Interval between connection-quality score updates (ms).
    #[clap(long, default_value = "2000")]
    pub connection_quality_update_interval_ms: u64,

    /// Drain interval of the leaky-bucket pacer (ms).
    #[clap(long, default_value = "5")]
    pub pacer_interval_ms: u64,

    /// Initial drain rate of the leaky-bucket pacer.
    #[clap(long, default_value = "10000")]
    pub pacer_bitrate_kbps: u64,

    /// Bound on the pacer queue before the overflow policy kicks in.
    #[clap(long, default_value = "512")]
    pub pacer_max_queue_packets: usize,
}

pub fn default_test_config() -> Config {
    Config {
        reconcile_interval_ms: 20,
        not_found_timeout_ms: 100,
        subscription_timeout_ms: 200,
        connection_quality_update_interval_ms: 20,
        pacer_interval_ms: 5,
        pacer_bitrate_kbps: 10_000,
        pacer_max_queue_packets: 512,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    #[test]
    fn defaults() {
        let config = Config::parse_from(["relay_sfu"]);
        assert_eq!(3000, config.reconcile_interval_ms);
        assert_eq!(5000, config.not_found_timeout_ms);
        assert_eq!(10000, config.subscription_timeout_ms);
        assert_eq!(2000, config.connection_quality_update_interval_ms);
    }

    #[test]
    fn overrides() {
        let config = Config::parse_from(["relay_sfu", "--reconcile-interval-ms", "50"]);
        assert_eq!(50, config.reconcile_interval_ms);
    }
}
