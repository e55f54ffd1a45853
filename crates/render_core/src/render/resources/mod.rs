//! GPU resources and their lifecycle
//!
//! Resources never outlive the GPU work that references them: releasing one
//! queues its destruction on the [`DeferredQueue`] at the index of the command
//! buffer being recorded.

pub mod buffer;
pub mod deferred;
pub mod defaults;
pub mod readback;
pub mod staging;
pub mod texture;

pub use buffer::{Buffer, BufferDataUsage, BufferSettings, MapTarget, MapType};
pub use deferred::DeferredQueue;
pub use defaults::DefaultResources;
pub use readback::{Readback, ReadbackId, ReadbackStatus};
pub use staging::TransferContext;
pub use texture::{Texture, TextureSettings};
