//! Whole-engine scenarios on the headless backend

mod engine_scenarios;

use std::path::{Path, PathBuf};

use nalgebra::{Matrix4, Point3, Vector3};

use crate::backend::headless::{
    HeadlessInstance, HeadlessProbe, HeadlessWindow, HeadlessWindowHandle,
};
use crate::config::RendererConfig;
use crate::engine::RenderEngine;
use crate::error::RenderResult;
use crate::scene::{
    cube_mesh, MaterialGroup, MaterialSource, PerspectiveCamera, Scene, ShaderGroup, ShaderSource,
};
use crate::shader::SPIRV_MAGIC;
use crate::texture::{DecodedImage, ImageDecoder};

pub(crate) type TestEngine = RenderEngine<HeadlessInstance, HeadlessWindow>;

/// Decodes every path to the same 2x2 opaque image
pub(crate) struct CheckerDecoder;

impl ImageDecoder for CheckerDecoder {
    fn decode(&self, _path: &Path) -> RenderResult<DecodedImage> {
        Ok(DecodedImage {
            width: 2,
            height: 2,
            channels: 4,
            pixels: vec![
                255, 255, 255, 255, 0, 0, 0, 255, //
                0, 0, 0, 255, 255, 255, 255, 255,
            ],
        })
    }
}

/// Minimal module header written to a per-test temp file
pub(crate) fn spirv_file(name: &str) -> PathBuf {
    let path = std::env::temp_dir().join(format!("voxel_engine_{name}.spv"));
    let words = [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0];
    std::fs::write(&path, bytemuck::cast_slice::<u32, u8>(&words)).unwrap();
    path
}

/// One shader, one material, `mesh_count` cubes in a row
pub(crate) fn cube_scene(tag: &str, mesh_count: usize) -> Scene {
    let meshes = (0..mesh_count)
        .map(|i| cube_mesh(Matrix4::new_translation(&Vector3::new(i as f32 * 2.0, 0.0, 0.0))))
        .collect();
    let camera = PerspectiveCamera::new(Point3::new(0.0, 3.0, 8.0), Point3::origin());
    Scene::new(camera).with_group(ShaderGroup {
        shader: ShaderSource::new(
            spirv_file(&format!("{tag}_vert")),
            spirv_file(&format!("{tag}_frag")),
        ),
        materials: vec![MaterialGroup {
            material: MaterialSource::single("textures/grass.png"),
            meshes,
        }],
    })
}

/// Initialized engine over a fresh headless instance
pub(crate) fn engine_with(
    config: RendererConfig,
    width: u32,
    height: u32,
) -> (TestEngine, HeadlessProbe, HeadlessWindowHandle) {
    let instance = HeadlessInstance::default();
    let probe = instance.probe();
    let window = HeadlessWindow::new(width, height);
    let handle = window.handle();
    let mut engine = RenderEngine::new(instance, window, config).with_decoder(CheckerDecoder);
    engine.initialize().unwrap();
    (engine, probe, handle)
}

/// Initialized 800x600 engine with the default configuration
pub(crate) fn engine() -> (TestEngine, HeadlessProbe, HeadlessWindowHandle) {
    engine_with(RendererConfig::default(), 800, 600)
}
