//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

use std::{
    convert::{TryFrom, TryInto},
    ops::Sub,
};

/// Expands a truncated counter of the given bit width into a full 64-bit counter,
/// tracking rollovers relative to the largest expanded value seen so far.
///
/// Wire counters like VP8 picture IDs (15 bits), TL0PICIDX (8 bits), and KEYIDX
/// (5 bits) are all expanded through this one function.
pub fn expand_truncated_counter<Truncated>(truncated: Truncated, max: &mut u64, width: usize) -> u64
where
    Truncated: TryFrom<u64> + Into<u64> + Sub<Truncated, Output = Truncated> + Ord + Copy,
    <Truncated as TryFrom<u64>>::Error: std::fmt::Debug,
{
    let mask: u64 = (1 << width) - 1;
    let really_big: Truncated = (1u64 << (width - 1)).try_into().unwrap();

    let truncated_max = (*max & mask).try_into().unwrap();
    let max_roc = *max >> width;
    let roc: u64 = if truncated_max > truncated && truncated_max - truncated > really_big {
        // Truncated is a lot smaller than the max; it's likely a rollover.
        max_roc + 1
    } else if max_roc > 0 && truncated > truncated_max && truncated - truncated_max > really_big {
        // Truncated is a lot bigger than the max; it's likely a rollunder.
        max_roc - 1
    } else {
        // Truncated is close to the max, so it's neither rollover nor rollunder.
        max_roc
    };
    let full = (roc << width) | (truncated.into() & mask);
    if full > *max {
        *max = full;
    }
    full
}
