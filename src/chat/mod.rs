pub mod reactions;
pub mod recent;
pub mod selector;
pub mod session;
pub mod store;

pub use session::{ChatSession, Connectivity, SessionContext};
