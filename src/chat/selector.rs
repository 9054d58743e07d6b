//! Decides which peer's conversation is open.
//!
//! Triggers, highest precedence first: a deep link evaluated once on mount,
//! an explicit pick from the contact or recent list, and the auto-select
//! fallback to the most recent conversation.

use crate::api::models::UserId;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionTrigger {
    DeepLink,
    Explicit,
    AutoRecent,
}

/// Identifies the conversation a fetch was issued for. A result is applied
/// only while its target is still current.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FetchTarget {
    pub peer: UserId,
    pub generation: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Selection {
    pub target: FetchTarget,
    pub trigger: SelectionTrigger,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Viewport {
    Compact,
    #[default]
    Wide,
}

#[derive(Debug)]
pub struct ConversationSelector {
    me: UserId,
    current: Option<FetchTarget>,
    generation: u64,
    mounted: bool,
    viewport: Viewport,
}

impl ConversationSelector {
    pub fn new(me: UserId) -> Self {
        Self { me, current: None, generation: 0, mounted: false, viewport: Viewport::default() }
    }

    /// First render. The deep link is honoured here and nowhere else.
    pub fn mount(&mut self, deep_link: Option<UserId>) -> Option<Selection> {
        if self.mounted {
            return None;
        }
        self.mounted = true;
        let peer = deep_link?;
        self.switch_to(peer, SelectionTrigger::DeepLink)
    }

    /// User picked a contact or recent entry.
    pub fn select(&mut self, peer: UserId) -> Option<Selection> {
        self.switch_to(peer, SelectionTrigger::Explicit)
    }

    /// Fallback after a recent-list refresh: open the top entry only when
    /// nothing is open yet.
    pub fn auto_select(&mut self, top: Option<&UserId>) -> Option<Selection> {
        if !self.mounted || self.current.is_some() {
            return None;
        }
        self.switch_to(top?.clone(), SelectionTrigger::AutoRecent)
    }

    pub fn close(&mut self) {
        self.current = None;
    }

    pub fn active_peer(&self) -> Option<&UserId> {
        self.current.as_ref().map(|t| &t.peer)
    }

    pub fn current(&self) -> Option<&FetchTarget> {
        self.current.as_ref()
    }

    pub fn is_current(&self, target: &FetchTarget) -> bool {
        self.current.as_ref() == Some(target)
    }

    pub fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    /// On compact viewports the contact list gives way to an open conversation.
    pub fn contact_list_visible(&self) -> bool {
        self.viewport == Viewport::Wide || self.current.is_none()
    }

    fn switch_to(&mut self, peer: UserId, trigger: SelectionTrigger) -> Option<Selection> {
        if peer == self.me {
            log::warn!("refusing to open a conversation with self");
            return None;
        }
        if self.active_peer() == Some(&peer) {
            return None;
        }
        self.generation += 1;
        let target = FetchTarget { peer, generation: self.generation };
        log::info!("opening conversation with {} ({:?})", target.peer, trigger);
        self.current = Some(target.clone());
        Some(Selection { target, trigger })
    }
}
