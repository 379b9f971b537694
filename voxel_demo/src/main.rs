//! Voxel demo
//!
//! Renders a patch of textured voxel terrain that slowly spins. A/D orbit the
//! camera, W/S zoom and Escape quits. Settings come from `voxel_demo.toml`.

mod config;
mod textures;

use nalgebra::{Matrix4, Point3, Vector3};
use voxel_engine::prelude::*;

use crate::config::DemoConfig;
use crate::textures::GrassDecoder;

const CONFIG_PATH: &str = "voxel_demo.toml";

fn main() {
    voxel_engine::logging::init();

    if let Err(error) = run() {
        log::error!("Fatal error: {}", error);
        std::process::exit(1);
    }
}

fn run() -> RenderResult<()> {
    let config = DemoConfig::load_or_default(CONFIG_PATH);

    let mut window = GlfwWindow::new(&config.window)?;
    let instance = VulkanInstance::new(&config.renderer, &mut window)?;
    let mut engine =
        RenderEngine::new(instance, window, config.renderer.clone()).with_decoder(GrassDecoder);
    engine.initialize()?;

    let mut app = VoxelDemo::new(&config);
    engine.load_scene(terrain_scene(&config, app.camera()))?;

    let result = engine.run(&mut app);
    let shutdown = engine.shutdown();
    log::info!("Demo finished after {:.1} seconds", app.elapsed);
    result.and(shutdown)
}

/// Height of the column at grid cell (`x`, `z`)
fn column_height(x: u32, z: u32) -> u32 {
    let wave = (x as f32 * 0.6).sin() + (z as f32 * 0.45).cos();
    ((wave + 2.0).round() as u32).max(1)
}

fn terrain_scene(config: &DemoConfig, camera: PerspectiveCamera) -> Scene {
    let half = config.grid_size as f32 / 2.0;
    let mut meshes = Vec::new();
    for x in 0..config.grid_size {
        for z in 0..config.grid_size {
            for y in 0..column_height(x, z) {
                let offset = Vector3::new(x as f32 - half, y as f32, z as f32 - half);
                meshes.push(cube_mesh(Matrix4::new_translation(&offset)));
            }
        }
    }
    log::info!("Built terrain with {} voxels", meshes.len());

    let material = MaterialSource::single(&config.texture);

    Scene::new(camera).with_group(ShaderGroup {
        shader: ShaderSource::new(config.vertex_shader(), config.fragment_shader()),
        materials: vec![MaterialGroup { material, meshes }],
    })
}

/// Orbit camera and terrain spin
struct VoxelDemo {
    yaw: f32,
    distance: f32,
    spin_speed: f32,
    elapsed: f32,
    exit: bool,
}

impl VoxelDemo {
    fn new(config: &DemoConfig) -> Self {
        Self {
            yaw: 0.0,
            distance: config.grid_size as f32 * 1.5,
            spin_speed: config.spin_speed,
            elapsed: 0.0,
            exit: false,
        }
    }

    fn camera(&self) -> PerspectiveCamera {
        let eye = Point3::new(
            self.yaw.sin() * self.distance,
            self.distance * 0.6,
            self.yaw.cos() * self.distance,
        );
        PerspectiveCamera::new(eye, Point3::new(0.0, 1.0, 0.0))
    }
}

impl Application for VoxelDemo {
    fn update(&mut self, scene: Option<&mut Scene>, input: &InputState, delta: f32) {
        self.elapsed += delta;
        if input.is_pressed(KeyCode::Escape) {
            self.exit = true;
        }
        if input.is_pressed(KeyCode::A) {
            self.yaw -= delta;
        }
        if input.is_pressed(KeyCode::D) {
            self.yaw += delta;
        }
        if input.is_pressed(KeyCode::W) {
            self.distance = (self.distance - delta * 8.0).max(3.0);
        }
        if input.is_pressed(KeyCode::S) {
            self.distance = (self.distance + delta * 8.0).min(200.0);
        }

        let Some(scene) = scene else {
            return;
        };
        let step = Matrix4::from_euler_angles(0.0, self.spin_speed * delta, 0.0);
        for mesh in scene.meshes_mut() {
            mesh.model = step * mesh.model;
        }
        scene.camera = Box::new(self.camera());
    }

    fn should_exit(&self) -> bool {
        self.exit
    }
}
