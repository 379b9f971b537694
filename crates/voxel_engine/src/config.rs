//! Configuration system
//!
//! Plain serde structs plus the [`Config`] trait for reading them from TOML or
//! RON files. The rendering core never loads files itself; callers hand it a
//! finished [`RendererConfig`].

pub use serde::{Deserialize, Serialize};

/// Configuration trait
pub trait Config: Serialize + for<'de> Deserialize<'de> + Default {
    /// Load configuration from file
    fn load_from_file(path: &str) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;

        if path.ends_with(".toml") {
            toml::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else if path.ends_with(".ron") {
            ron::from_str(&contents).map_err(|e| ConfigError::Parse(e.to_string()))
        } else {
            Err(ConfigError::UnsupportedFormat(path.to_string()))
        }
    }

    /// Save configuration to file
    fn save_to_file(&self, path: &str) -> Result<(), ConfigError> {
        let contents = if path.ends_with(".toml") {
            toml::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else if path.ends_with(".ron") {
            ron::ser::to_string_pretty(self, ron::ser::PrettyConfig::default())
                .map_err(|e| ConfigError::Serialize(e.to_string()))?
        } else {
            return Err(ConfigError::UnsupportedFormat(path.to_string()));
        };

        std::fs::write(path, contents).map_err(ConfigError::Io)
    }
}

/// Configuration errors
#[derive(thiserror::Error, Debug)]
pub enum ConfigError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Parse error
    #[error("Parse error: {0}")]
    Parse(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialize(String),

    /// Unsupported format
    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    /// A value is outside its allowed range
    #[error("Invalid value for {field}: {reason}")]
    Invalid {
        /// Offending field
        field: &'static str,
        /// What is wrong with it
        reason: String,
    },
}

/// What the recorder does with a mesh that has no GPU allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MissingMeshPolicy {
    /// Leave the mesh out of the frame and log it at debug level
    Skip,
    /// Abort recording with `UnuploadedMesh`
    Fail,
}

impl Default for MissingMeshPolicy {
    fn default() -> Self {
        if cfg!(debug_assertions) {
            Self::Fail
        } else {
            Self::Skip
        }
    }
}

/// Configuration for the rendering core
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RendererConfig {
    /// Application name for instance creation
    pub application_name: String,
    /// Number of frame slots used round-robin
    pub frames_in_flight: usize,
    /// Upper bound on any single fence wait, in milliseconds
    pub fence_timeout_ms: u64,
    /// Background clear color [R, G, B, A] (0.0-1.0 range)
    pub clear_color: [f32; 4],
    /// Depth clear value
    pub clear_depth: f32,
    /// Whether to enable validation layers; `None` follows the build profile
    pub enable_validation: Option<bool>,
    /// Handling of meshes drawn before upload
    pub missing_mesh_policy: MissingMeshPolicy,
    /// Staging transfers that may await cleanup at once
    pub max_pending_uploads: usize,
    /// Largest anisotropy a texture sampler may request
    pub max_anisotropy: f32,
}

impl RendererConfig {
    /// Create a new renderer configuration
    pub fn new(app_name: impl Into<String>) -> Self {
        Self {
            application_name: app_name.into(),
            frames_in_flight: 2,
            fence_timeout_ms: 1000,
            clear_color: [0.53, 0.81, 0.92, 1.0],
            clear_depth: 1.0,
            enable_validation: None,
            missing_mesh_policy: MissingMeshPolicy::default(),
            max_pending_uploads: 64,
            max_anisotropy: 16.0,
        }
    }

    /// Set the number of frame slots
    pub fn with_frames_in_flight(mut self, frames: usize) -> Self {
        self.frames_in_flight = frames.clamp(1, 8);
        self
    }

    /// Set background clear color
    pub fn with_clear_color(mut self, color: [f32; 4]) -> Self {
        self.clear_color = color;
        self
    }

    /// Enable or disable validation layers
    pub fn with_validation(mut self, enable: bool) -> Self {
        self.enable_validation = Some(enable);
        self
    }

    /// Set the missing-mesh policy
    pub fn with_missing_mesh_policy(mut self, policy: MissingMeshPolicy) -> Self {
        self.missing_mesh_policy = policy;
        self
    }

    /// Set the deferred-free queue capacity
    pub fn with_max_pending_uploads(mut self, capacity: usize) -> Self {
        self.max_pending_uploads = capacity;
        self
    }

    /// Whether validation layers should be requested
    pub fn validation_enabled(&self) -> bool {
        self.enable_validation.unwrap_or(cfg!(debug_assertions))
    }

    /// Fence timeout in nanoseconds
    pub fn fence_timeout_ns(&self) -> u64 {
        self.fence_timeout_ms.saturating_mul(1_000_000)
    }

    /// Check every field against its allowed range
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(1..=8).contains(&self.frames_in_flight) {
            return Err(ConfigError::Invalid {
                field: "frames_in_flight",
                reason: format!("{} is outside 1..=8", self.frames_in_flight),
            });
        }
        if self.fence_timeout_ms == 0 {
            return Err(ConfigError::Invalid {
                field: "fence_timeout_ms",
                reason: "must be greater than zero".to_string(),
            });
        }
        if !(0.0..=1.0).contains(&self.clear_depth) {
            return Err(ConfigError::Invalid {
                field: "clear_depth",
                reason: format!("{} is outside 0.0..=1.0", self.clear_depth),
            });
        }
        if self.max_pending_uploads == 0 {
            return Err(ConfigError::Invalid {
                field: "max_pending_uploads",
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.max_anisotropy < 1.0 {
            return Err(ConfigError::Invalid {
                field: "max_anisotropy",
                reason: format!("{} is below 1.0", self.max_anisotropy),
            });
        }
        Ok(())
    }
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self::new("Voxel Engine")
    }
}

impl Config for RendererConfig {}

/// Window settings for applications that open their own window
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    /// Window title
    pub title: String,
    /// Initial width in screen coordinates
    pub width: u32,
    /// Initial height in screen coordinates
    pub height: u32,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Voxel Engine".to_string(),
            width: 1280,
            height: 720,
        }
    }
}

impl Config for WindowConfig {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = RendererConfig::default();
        assert_eq!(config.frames_in_flight, 2);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_frames_builder_clamps() {
        assert_eq!(RendererConfig::default().with_frames_in_flight(0).frames_in_flight, 1);
        assert_eq!(RendererConfig::default().with_frames_in_flight(20).frames_in_flight, 8);
    }

    #[test]
    fn test_validate_rejects_zero_capacity() {
        let config = RendererConfig::default().with_max_pending_uploads(0);
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { field: "max_pending_uploads", .. })
        ));
    }

    #[test]
    fn test_toml_round_trip_with_partial_file() {
        let parsed: RendererConfig = toml::from_str(
            "application_name = \"Chunks\"\nframes_in_flight = 3\nmissing_mesh_policy = \"Skip\"\n",
        )
        .unwrap();
        assert_eq!(parsed.application_name, "Chunks");
        assert_eq!(parsed.frames_in_flight, 3);
        assert_eq!(parsed.missing_mesh_policy, MissingMeshPolicy::Skip);
        assert_eq!(parsed.fence_timeout_ms, 1000);
    }

    #[test]
    fn test_file_round_trip() {
        let dir = std::env::temp_dir();
        let path = dir.join(format!("voxel_engine_config_{}.ron", std::process::id()));
        let path = path.to_str().unwrap();

        let config = RendererConfig::new("Saved").with_validation(false);
        config.save_to_file(path).unwrap();
        let loaded = RendererConfig::load_from_file(path).unwrap();
        std::fs::remove_file(path).unwrap();

        assert_eq!(loaded, config);
    }

    #[test]
    fn test_unknown_extension_is_rejected() {
        assert!(matches!(
            WindowConfig::default().save_to_file("window.json"),
            Err(ConfigError::UnsupportedFormat(_))
        ));
    }
}
