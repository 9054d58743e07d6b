use crate::api::models::{RecentConversationSummary, UserId};
use crate::error::ApiError;

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum IndexStatus {
    #[default]
    Idle,
    Loading,
    Ready,
    /// Last refresh failed; the list is empty and can be retried.
    Degraded(String),
}

/// Ranked list of recent conversations. Always replaced as a whole.
#[derive(Debug, Default)]
pub struct RecentConversationsIndex {
    entries: Vec<RecentConversationSummary>,
    status: IndexStatus,
    issued: u64,
    applied: u64,
}

impl RecentConversationsIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new refresh request and return its sequence number.
    pub fn begin_refresh(&mut self) -> u64 {
        self.issued += 1;
        if self.status != IndexStatus::Ready {
            self.status = IndexStatus::Loading;
        }
        self.issued
    }

    /// Apply the response to request `seq`. Responses older than one already
    /// applied are dropped. Returns whether the list was replaced.
    pub fn apply(
        &mut self,
        seq: u64,
        result: Result<Vec<RecentConversationSummary>, ApiError>,
    ) -> bool {
        if seq <= self.applied {
            log::debug!("dropping stale recent-conversations response #{seq}");
            return false;
        }
        self.applied = seq;
        match result {
            Ok(mut entries) => {
                entries.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
                self.entries = entries;
                self.status = IndexStatus::Ready;
            }
            Err(e) => {
                log::warn!("recent conversations unavailable: {e}");
                self.entries.clear();
                self.status = IndexStatus::Degraded(e.to_string());
            }
        }
        true
    }

    pub fn entries(&self) -> &[RecentConversationSummary] {
        &self.entries
    }

    pub fn status(&self) -> &IndexStatus {
        &self.status
    }

    /// Most recent conversation, the auto-select candidate.
    pub fn top(&self) -> Option<&UserId> {
        self.entries.first().map(|s| &s.peer_identity)
    }
}
