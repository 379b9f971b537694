//! Demo settings, read from `voxel_demo.toml` when present

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use voxel_engine::config::{Config, RendererConfig, WindowConfig};

/// Everything the demo can be tuned with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    /// Window title and size
    pub window: WindowConfig,
    /// Rendering core settings
    pub renderer: RendererConfig,
    /// Directory holding `voxel.vert.spv` and `voxel.frag.spv`
    pub shader_dir: PathBuf,
    /// Texture sampled by every voxel; generated when the file is missing
    pub texture: PathBuf,
    /// Voxels along each side of the terrain patch
    pub grid_size: u32,
    /// Terrain spin in radians per second
    pub spin_speed: f32,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            window: WindowConfig {
                title: "Voxel Demo".to_string(),
                ..WindowConfig::default()
            },
            renderer: RendererConfig::new("Voxel Demo"),
            shader_dir: PathBuf::from("target/shaders"),
            texture: PathBuf::from("resources/textures/grass.png"),
            grid_size: 12,
            spin_speed: 0.3,
        }
    }
}

impl Config for DemoConfig {}

impl DemoConfig {
    /// Settings from `path`, falling back to defaults when the file is absent or invalid
    pub fn load_or_default(path: &str) -> Self {
        match Self::load_from_file(path) {
            Ok(config) => {
                log::info!("Loaded settings from {}", path);
                config
            }
            Err(error) => {
                log::info!("Using default settings ({})", error);
                Self::default()
            }
        }
    }

    /// Vertex shader bytecode path
    pub fn vertex_shader(&self) -> PathBuf {
        self.shader_dir.join("voxel.vert.spv")
    }

    /// Fragment shader bytecode path
    pub fn fragment_shader(&self) -> PathBuf {
        self.shader_dir.join("voxel.frag.spv")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_partial_toml_keeps_defaults() {
        let config: DemoConfig = toml::from_str("grid_size = 4\n[window]\ntitle = \"Tiny\"\n").unwrap();
        assert_eq!(config.grid_size, 4);
        assert_eq!(config.window.title, "Tiny");
        assert_eq!(config.window.width, WindowConfig::default().width);
        assert_eq!(config.renderer.frames_in_flight, 2);
    }

    #[test]
    fn test_missing_file_falls_back() {
        let config = DemoConfig::load_or_default("does/not/exist.toml");
        assert_eq!(config, DemoConfig::default());
        assert!(config.vertex_shader().ends_with("voxel.vert.spv"));
    }
}
