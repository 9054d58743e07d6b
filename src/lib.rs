//! Client side of one-to-one messaging: the open conversation with optimistic
//! sends, per-message reactions, the recent-conversations list, and the push
//! channel that keeps them live.

pub mod api;
pub mod app;
pub mod chat;
pub mod entitlement;
pub mod error;
pub mod transport;
pub mod utils;

pub use chat::{ChatSession, Connectivity, SessionContext};
pub use error::{ApiError, ChatError, SendFailure, ValidationError};
