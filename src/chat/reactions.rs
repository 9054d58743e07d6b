//! Reaction state for the open conversation: one reaction per reactor per message.

use crate::api::models::{MessageId, Reaction};
use std::collections::{BTreeMap, HashMap};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UpsertOutcome {
    Inserted,
    Replaced { previous: String },
    Unchanged,
    /// Held until the snapshot in flight lands.
    Deferred,
}

#[derive(Debug, Default)]
pub struct ReactionAggregator {
    by_message: HashMap<MessageId, Vec<Reaction>>,
    /// Snapshot requests not answered yet.
    outstanding: usize,
    /// Pushed deltas received while a snapshot was outstanding.
    deferred: Vec<Reaction>,
}

impl ReactionAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop everything and wait for a new snapshot.
    pub fn reset(&mut self) {
        self.by_message.clear();
        self.deferred.clear();
        self.outstanding = 1;
    }

    /// Another snapshot was requested; current state stays visible meanwhile.
    pub fn begin_reload(&mut self) {
        self.outstanding += 1;
    }

    pub fn clear(&mut self) {
        self.by_message.clear();
        self.deferred.clear();
        self.outstanding = 0;
    }

    pub fn is_loading(&self) -> bool {
        self.outstanding > 0
    }

    /// Replace local state with a full snapshot. Later entries win when the
    /// snapshot repeats a reactor on the same message.
    pub fn replace_snapshot(&mut self, snapshot: Vec<Reaction>) {
        self.by_message.clear();
        for reaction in snapshot {
            self.insert(reaction);
        }
        self.snapshot_done();
    }

    /// A snapshot request failed. Current state is kept.
    pub fn snapshot_failed(&mut self) {
        self.snapshot_done();
    }

    fn snapshot_done(&mut self) {
        self.outstanding = self.outstanding.saturating_sub(1);
        if self.outstanding == 0 {
            for reaction in std::mem::take(&mut self.deferred) {
                self.insert(reaction);
            }
        }
    }

    /// Apply a pushed reaction. While a snapshot is outstanding the delta is
    /// replayed on top of it, since the snapshot may predate it.
    pub fn upsert(&mut self, reaction: Reaction) -> UpsertOutcome {
        if self.is_loading() {
            self.deferred.push(reaction);
            return UpsertOutcome::Deferred;
        }
        self.insert(reaction)
    }

    fn insert(&mut self, reaction: Reaction) -> UpsertOutcome {
        let entries = self.by_message.entry(reaction.message_id.clone()).or_default();
        match entries.iter_mut().find(|r| r.reactor_id == reaction.reactor_id) {
            Some(existing) if existing.emoji == reaction.emoji => UpsertOutcome::Unchanged,
            Some(existing) => {
                let previous = std::mem::replace(&mut existing.emoji, reaction.emoji);
                UpsertOutcome::Replaced { previous }
            }
            None => {
                entries.push(reaction);
                UpsertOutcome::Inserted
            }
        }
    }

    pub fn reactions_for(&self, message_id: &MessageId) -> &[Reaction] {
        self.by_message.get(message_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Emoji → number of reactors, for rendering counts under a message.
    pub fn tally(&self, message_id: &MessageId) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for reaction in self.reactions_for(message_id) {
            *counts.entry(reaction.emoji.clone()).or_insert(0) += 1;
        }
        counts
    }
}
