// Re-export needed modules for testing
pub mod config;
pub mod error;
pub mod models;
pub mod sync;

// Re-export main types for convenience
pub use models::*;
pub use sync::driver::{ChatBackend, Command, SyncDriver, SyncHandle};
pub use sync::{ChatId, ChatSync, ChatView, FetchOutcome, FetchTicket, PushEvent, PushFrame, SyncAction};
