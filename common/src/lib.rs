//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

mod counters;
mod data_rate;
mod time;

pub use counters::expand_truncated_counter;
pub use data_rate::{DataRate, DataSize};
pub use time::{Duration, Instant};
