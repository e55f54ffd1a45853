//! # Graphics Configuration
//!
//! Settings consumed when a [`Graphics`](crate::render::Graphics) instance is
//! created. Every struct here is serde-serializable, so the whole tree can be
//! loaded from a TOML or RON file through the [`Config`] trait.
//!
//! ```rust
//! use render_core::core::{BackendKind, GraphicsConfig};
//!
//! let config = GraphicsConfig::new("Demo")
//!     .with_backend(BackendKind::Headless)
//!     .with_backbuffer_size(640, 480)
//!     .with_msaa(4);
//! assert!(config.validate().is_ok());
//! ```

use serde::{Deserialize, Serialize};

pub use crate::config::{Config, ConfigError};

/// Which backend a [`GraphicsConfig`] asks for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum BackendKind {
    /// In-process simulated GPU, always available
    #[default]
    Headless,
    /// Native Vulkan, requires the `vulkan` feature
    Vulkan,
}

/// # Backbuffer Configuration
///
/// Size and layout of the default render target the backend provides when no
/// explicit render targets are bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BackbufferConfig {
    /// Width in pixels
    pub width: u32,
    /// Height in pixels
    pub height: u32,
    /// Sample count; values above 1 add a multisampled color target resolved on store
    pub msaa: u32,
    /// Whether a depth/stencil attachment is created
    pub depth_stencil: bool,
}

impl Default for BackbufferConfig {
    fn default() -> Self {
        Self {
            width: 800,
            height: 600,
            msaa: 1,
            depth_stencil: true,
        }
    }
}

impl BackbufferConfig {
    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.width == 0 || self.height == 0 {
            return Err(format!(
                "Backbuffer size must be non-zero, got {}x{}",
                self.width, self.height
            ));
        }

        if !self.msaa.is_power_of_two() || self.msaa > 16 {
            return Err(format!("MSAA sample count must be 1, 2, 4, 8 or 16, got {}", self.msaa));
        }

        Ok(())
    }
}

/// # Graphics Configuration
///
/// Top-level configuration for the rendering core.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GraphicsConfig {
    /// Application name passed to native backends
    pub application_name: String,
    /// Requested backend
    pub backend: BackendKind,
    /// Whether to enable API validation layers (None auto-detects from build type)
    pub enable_validation: Option<bool>,
    /// Default render target
    pub backbuffer: BackbufferConfig,
    /// Fallback log filter used when `RUST_LOG` is unset
    pub log_level: String,
    /// Pending cleanup count above which a warning is logged each frame
    pub pending_cleanup_warning: usize,
}

impl GraphicsConfig {
    /// Create a new graphics configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            backend: BackendKind::Headless,
            enable_validation: None,
            backbuffer: BackbufferConfig::default(),
            log_level: "info".to_string(),
            pending_cleanup_warning: 1024,
        }
    }

    /// Select the backend
    pub fn with_backend(mut self, backend: BackendKind) -> Self {
        self.backend = backend;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enabled: bool) -> Self {
        self.enable_validation = Some(enabled);
        self
    }

    /// Set backbuffer dimensions
    pub fn with_backbuffer_size(mut self, width: u32, height: u32) -> Self {
        self.backbuffer.width = width;
        self.backbuffer.height = height;
        self
    }

    /// Set backbuffer sample count
    pub fn with_msaa(mut self, samples: u32) -> Self {
        self.backbuffer.msaa = samples;
        self
    }

    /// Enable or disable the backbuffer depth/stencil attachment
    pub fn with_depth_stencil(mut self, enabled: bool) -> Self {
        self.backbuffer.depth_stencil = enabled;
        self
    }

    /// Set the fallback log filter
    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    /// Whether validation layers should be enabled for this build
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.application_name.is_empty() {
            return Err("Application name cannot be empty".to_string());
        }

        self.backbuffer.validate()?;

        Ok(())
    }
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self::new("render_core application")
    }
}

impl Config for GraphicsConfig {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{Builder, NamedTempFile};

    #[test]
    fn test_default_config_is_valid() {
        let config = GraphicsConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.backend, BackendKind::Headless);
        assert_eq!(config.backbuffer.msaa, 1);
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        assert!(GraphicsConfig::new("").validate().is_err());
        assert!(GraphicsConfig::default().with_backbuffer_size(0, 10).validate().is_err());
        assert!(GraphicsConfig::default().with_msaa(3).validate().is_err());
        assert!(GraphicsConfig::default().with_msaa(8).validate().is_ok());
    }

    #[test]
    fn test_toml_round_trip() {
        let file = Builder::new().suffix(".toml").tempfile().unwrap();
        let config = GraphicsConfig::new("Round Trip")
            .with_backbuffer_size(320, 200)
            .with_validation(false);
        config.save_to_file(file.path()).unwrap();

        let loaded = GraphicsConfig::load_from_file(file.path()).unwrap();
        assert_eq!(loaded.application_name, "Round Trip");
        assert_eq!(loaded.backbuffer.width, 320);
        assert_eq!(loaded.enable_validation, Some(false));
    }

    #[test]
    fn test_ron_load() {
        let mut file = Builder::new().suffix(".ron").tempfile().unwrap();
        write!(
            file,
            r#"(
                application_name: "Ron",
                backend: Headless,
                enable_validation: None,
                backbuffer: (width: 64, height: 32, msaa: 4, depth_stencil: false),
                log_level: "debug",
                pending_cleanup_warning: 16,
            )"#
        )
        .unwrap();

        let loaded = GraphicsConfig::load_from_file(file.path()).unwrap();
        assert_eq!(loaded.backbuffer.msaa, 4);
        assert!(!loaded.backbuffer.depth_stencil);
        assert_eq!(loaded.pending_cleanup_warning, 16);
    }

    #[test]
    fn test_unsupported_extension() {
        let file = NamedTempFile::new().unwrap();
        let result = GraphicsConfig::load_from_file(file.path());
        assert!(matches!(result, Err(ConfigError::UnsupportedFormat(_))));
    }

    #[test]
    fn test_missing_file_falls_back_to_default() {
        let dir = tempfile::tempdir().unwrap();
        let loaded = GraphicsConfig::load_or_default(dir.path().join("absent.toml")).unwrap();
        assert_eq!(loaded.application_name, GraphicsConfig::default().application_name);
    }
}
