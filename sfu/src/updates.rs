//
// Copyright 2023 Signal Messenger, LLC
// SPDX-License-Identifier: AGPL-3.0-only
//

//! Version gating for participant-state updates. Signaling fan-out can
//! deliver updates out of order; a sink must only ever observe the newest
//! version for each participant.

use std::collections::HashMap;

use crate::subscription::ParticipantId;

/// One versioned participant-state update. The version is monotonic per
/// participant at the producer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ParticipantUpdate {
    pub participant_id: ParticipantId,
    pub version: u64,
    pub is_disconnected: bool,
}

/// Where filtered updates get written.
pub trait UpdateSink {
    fn write(&mut self, update: &ParticipantUpdate);
}

/// Remembers the highest version written per participant and suppresses
/// anything older or equal.
#[derive(Default)]
pub struct UpdateVersionGate {
    last_written: HashMap<ParticipantId, u64>,
}

impl UpdateVersionGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Writes each update to the sink at most once per version, newest wins.
    /// A batch is first coalesced so that `[v2, v1]` produces exactly one
    /// write with `v2`'s contents.
    pub fn write_updates(&mut self, updates: &[ParticipantUpdate], sink: &mut dyn UpdateSink) {
        let mut newest_in_batch: HashMap<&ParticipantId, &ParticipantUpdate> = HashMap::new();
        for update in updates {
            match newest_in_batch.get(&update.participant_id) {
                Some(existing) if existing.version >= update.version => {}
                _ => {
                    newest_in_batch.insert(&update.participant_id, update);
                }
            }
        }

        // Preserve first-appearance order of participants within the batch.
        let mut written: Vec<&ParticipantId> = Vec::new();
        for update in updates {
            if written.contains(&&update.participant_id) {
                continue;
            }
            let Some(newest) = newest_in_batch.get(&update.participant_id) else {
                continue;
            };
            if self.should_write(newest) {
                sink.write(newest);
            }
            written.push(&update.participant_id);
        }
    }

    fn should_write(&mut self, update: &ParticipantUpdate) -> bool {
        match self.last_written.get(&update.participant_id) {
            Some(last) if *last >= update.version => false,
            _ => {
                self.last_written
                    .insert(update.participant_id.clone(), update.version);
                true
            }
        }
    }
}
