//! Render state tracking and immutable state object caching

pub mod cache;
pub mod dirty;

pub use cache::{CacheStats, StateDescriptor, StateObjectCache};
pub use dirty::{DirtyStateTracker, RenderState, StateBits};
