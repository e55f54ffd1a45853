//! Core configuration types

pub mod config;

pub use config::{BackbufferConfig, BackendKind, GraphicsConfig};
