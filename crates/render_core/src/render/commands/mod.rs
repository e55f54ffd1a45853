//! Command recording: one open command buffer, at most one active encoder

pub mod encoder;
pub mod stream;

pub use encoder::{ActiveEncoder, EncoderStateMachine, EncoderUse};
pub use stream::CommandStream;
