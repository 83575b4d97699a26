//! flagdev core - value types, storage contracts and change fan-out.
//!
//! This crate has no dependencies on other flagdev crates.

pub mod context;
pub mod debug;
pub mod error;
pub mod flag_override;
pub mod flags;
pub mod observer;
pub mod project;
pub mod sdk;
pub mod storage;
pub mod variation;

// Re-exports for convenience
pub use context::Context;
pub use debug::{DebugEvent, DebugSession, DebugSessionsPage, EventsPage, Page};
pub use error::{CoreError, StorageError, UpstreamError, ValidationError};
pub use flag_override::Override;
pub use flags::{AllFlagsState, FlagMetadata, FlagState, FlagsState};
pub use observer::{
    ChannelObserver, Observer, ObserverEvent, ObserverId, Observers, OverrideEvent, ReceivedEvent,
    Subscription, SyncEvent,
};
pub use project::Project;
pub use storage::{Backup, EventStore, Store};
pub use variation::{FlagVariation, Variation};

#[cfg(any(test, feature = "test-utils"))]
pub use storage::memory::{InMemoryEventStore, InMemoryStore};
