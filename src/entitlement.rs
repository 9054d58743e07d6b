//! Read-only view of the account's plan state, consulted before every write.

use crate::api::models::EntitlementFact;
use crate::error::ChatError;
use std::time::Duration;

#[derive(Debug, Default)]
pub struct EntitlementGate {
    fact: Option<EntitlementFact>,
}

impl EntitlementGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the fact with the latest fetch. Nothing older is retained.
    pub fn update(&mut self, fact: EntitlementFact) {
        self.fact = Some(fact);
    }

    /// Forget the current fact, e.g. when its fetch failed.
    pub fn invalidate(&mut self) {
        self.fact = None;
    }

    /// Unknown plan state counts as inactive.
    pub fn active(&self) -> bool {
        self.fact.as_ref().is_some_and(|f| f.active)
    }

    pub fn remaining_period(&self) -> Option<Duration> {
        self.fact.as_ref().and_then(EntitlementFact::remaining_period)
    }

    pub fn check(&self) -> Result<(), ChatError> {
        if self.active() {
            Ok(())
        } else {
            Err(ChatError::EntitlementDenied { remaining: self.remaining_period() })
        }
    }
}
