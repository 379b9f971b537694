//! Scene data consumed by the engine
//!
//! A [`Scene`] is an ordered tree: shaders own materials, materials own
//! meshes. The engine records draws in exactly that order. Mesh generation,
//! camera movement and input handling live outside the core; they only meet it
//! through the types in this module.

use std::collections::HashSet;
use std::path::PathBuf;

use ash::vk;
use bytemuck::{Pod, Zeroable};
use nalgebra::{Matrix4, Perspective3, Point3, Vector3};

use crate::device::DeviceContext;
use crate::backend::GpuDevice;
use crate::error::RenderResult;
use crate::memory::{Allocation, MemoryAllocator};
use crate::texture::SamplerConfig;

/// Vertex layout shared by every pipeline
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    /// Position in model space
    pub position: [f32; 3],
    /// Vertex color
    pub color: [f32; 3],
    /// Texture coordinates
    pub uv: [f32; 2],
}

impl Vertex {
    /// Bytes per vertex
    pub const STRIDE: u32 = std::mem::size_of::<Self>() as u32;

    /// Construct a vertex
    pub const fn new(position: [f32; 3], color: [f32; 3], uv: [f32; 2]) -> Self {
        Self { position, color, uv }
    }

    /// Attribute descriptions for binding 0
    pub fn attributes() -> [vk::VertexInputAttributeDescription; 3] {
        [
            vk::VertexInputAttributeDescription {
                location: 0,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 0,
            },
            vk::VertexInputAttributeDescription {
                location: 1,
                binding: 0,
                format: vk::Format::R32G32B32_SFLOAT,
                offset: 12,
            },
            vk::VertexInputAttributeDescription {
                location: 2,
                binding: 0,
                format: vk::Format::R32G32_SFLOAT,
                offset: 24,
            },
        ]
    }
}

/// GPU side of an uploaded mesh
///
/// One buffer holds the indices followed by the vertices.
#[derive(Debug)]
pub struct MeshGpu {
    allocation: Allocation,
    index_count: u32,
    vertex_offset: u64,
}

impl MeshGpu {
    /// Buffer allocation
    pub fn allocation(&self) -> &Allocation {
        &self.allocation
    }

    /// Number of indices to draw
    pub fn index_count(&self) -> u32 {
        self.index_count
    }

    /// Byte offset of the first vertex
    pub fn vertex_offset(&self) -> u64 {
        self.vertex_offset
    }
}

/// Indexed triangle mesh with a model transform
#[derive(Debug)]
pub struct Mesh {
    /// Triangle list indices
    pub indices: Vec<u32>,
    /// Vertex data
    pub vertices: Vec<Vertex>,
    /// Model-to-world transform
    pub model: Matrix4<f32>,
    gpu: Option<MeshGpu>,
}

impl Mesh {
    /// Mesh with an identity transform, not yet on the GPU
    pub fn new(vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self {
            indices,
            vertices,
            model: Matrix4::identity(),
            gpu: None,
        }
    }

    /// Set the model transform
    #[must_use]
    pub fn with_model(mut self, model: Matrix4<f32>) -> Self {
        self.model = model;
        self
    }

    /// GPU state, kept after release so its allocation reads as invalid
    pub fn gpu(&self) -> Option<&MeshGpu> {
        self.gpu.as_ref()
    }

    /// Allocation backing the mesh, if it was ever uploaded
    pub fn allocation(&self) -> Option<&Allocation> {
        self.gpu.as_ref().map(MeshGpu::allocation)
    }

    /// Whether the mesh currently has a valid GPU allocation
    pub fn is_uploaded(&self) -> bool {
        self.allocation().map_or(false, Allocation::is_valid)
    }

    /// Indices followed by vertices, as uploaded
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(
            self.indices.len() * 4 + self.vertices.len() * Vertex::STRIDE as usize,
        );
        bytes.extend_from_slice(bytemuck::cast_slice(&self.indices));
        bytes.extend_from_slice(bytemuck::cast_slice(&self.vertices));
        bytes
    }

    /// Upload the geometry unless a valid allocation already exists
    pub fn upload<D: GpuDevice>(
        &mut self,
        ctx: &DeviceContext<D>,
        allocator: &mut MemoryAllocator<D>,
    ) -> RenderResult<()> {
        if self.is_uploaded() {
            return Ok(());
        }
        let bytes = self.to_bytes();
        let mut allocation = allocator.create_buffer(
            ctx,
            vk::BufferUsageFlags::VERTEX_BUFFER | vk::BufferUsageFlags::INDEX_BUFFER,
            bytes.len().max(4) as u64,
        )?;
        if let Err(error) = allocator.upload_to_buffer(ctx, &allocation, &bytes) {
            if let Err(cleanup) = allocator.destroy(ctx, &mut allocation) {
                log::warn!("Could not free mesh buffer after failed upload: {}", cleanup);
            }
            return Err(error);
        }
        self.gpu = Some(MeshGpu {
            allocation,
            index_count: u32::try_from(self.indices.len()).unwrap_or(u32::MAX),
            vertex_offset: (self.indices.len() * 4) as u64,
        });
        Ok(())
    }

    /// Free the GPU allocation. The caller guarantees the GPU is done with it.
    pub fn release<D: GpuDevice>(
        &mut self,
        ctx: &DeviceContext<D>,
        allocator: &mut MemoryAllocator<D>,
    ) -> RenderResult<()> {
        match self.gpu.as_mut() {
            Some(gpu) if gpu.allocation.is_valid() => allocator.destroy(ctx, &mut gpu.allocation),
            _ => Ok(()),
        }
    }
}

/// Unit cube centered on the origin with per-face colors and UVs
pub fn cube_mesh(model: Matrix4<f32>) -> Mesh {
    const FACES: [([f32; 3], [f32; 3], [f32; 3], [f32; 3]); 6] = [
        // normal, u axis, v axis, color
        ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.9, 0.3, 0.3]),
        ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.3, 0.9, 0.3]),
        ([1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.0, 1.0, 0.0], [0.3, 0.3, 0.9]),
        ([-1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0, 0.0], [0.9, 0.9, 0.3]),
        ([0.0, 1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, -1.0], [0.3, 0.9, 0.9]),
        ([0.0, -1.0, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0, 1.0], [0.9, 0.3, 0.9]),
    ];
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (n, u, v, color) in FACES {
        let base = vertices.len() as u32;
        for (su, sv) in [(-0.5, -0.5), (0.5, -0.5), (0.5, 0.5), (-0.5, 0.5)] {
            let position = [
                n[0] * 0.5 + u[0] * su + v[0] * sv,
                n[1] * 0.5 + u[1] * su + v[1] * sv,
                n[2] * 0.5 + u[2] * su + v[2] * sv,
            ];
            vertices.push(Vertex::new(position, color, [su + 0.5, 0.5 - sv]));
        }
        indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
    }
    Mesh::new(vertices, indices).with_model(model)
}

/// Keys the core knows by name
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyCode {
    /// W
    W,
    /// A
    A,
    /// S
    S,
    /// D
    D,
    /// Space bar
    Space,
    /// Left shift
    LeftShift,
    /// Escape
    Escape,
    /// Any other key, by platform scancode
    Other(i32),
}

/// Input gathered during one tick
#[derive(Debug, Clone, Default, PartialEq)]
pub struct InputState {
    /// Keys held down at the end of the poll
    pub pressed: HashSet<KeyCode>,
    /// Cursor movement since the previous poll
    pub cursor_delta: (f64, f64),
    /// Framebuffer size change reported by the window
    pub resized: Option<(u32, u32)>,
    /// The user asked to close the window
    pub close_requested: bool,
}

impl InputState {
    /// Whether `key` is held
    pub fn is_pressed(&self, key: KeyCode) -> bool {
        self.pressed.contains(&key)
    }
}

/// Source of the camera matrix
pub trait Camera {
    /// Combined projection and view matrix for a viewport of `aspect` = width / height
    fn view_projection(&self, aspect: f32) -> Matrix4<f32>;
}

/// Right-handed Y-up perspective camera producing Vulkan clip space
#[derive(Debug, Clone, PartialEq)]
pub struct PerspectiveCamera {
    /// Eye position
    pub position: Point3<f32>,
    /// Look-at point
    pub target: Point3<f32>,
    /// Up direction
    pub up: Vector3<f32>,
    /// Vertical field of view in radians
    pub fov_y: f32,
    /// Near plane distance
    pub near: f32,
    /// Far plane distance
    pub far: f32,
}

impl PerspectiveCamera {
    /// Camera at `position` looking at `target`
    pub fn new(position: Point3<f32>, target: Point3<f32>) -> Self {
        Self {
            position,
            target,
            up: Vector3::y(),
            fov_y: 70.0_f32.to_radians(),
            near: 0.1,
            far: 500.0,
        }
    }

    /// World-to-view matrix
    pub fn view(&self) -> Matrix4<f32> {
        Matrix4::look_at_rh(&self.position, &self.target, &self.up)
    }

    /// View-to-clip matrix with Y pointing down and depth in 0..1
    pub fn projection(&self, aspect: f32) -> Matrix4<f32> {
        #[rustfmt::skip]
        let vulkan_clip = Matrix4::new(
            1.0,  0.0, 0.0, 0.0,
            0.0, -1.0, 0.0, 0.0,
            0.0,  0.0, 0.5, 0.5,
            0.0,  0.0, 0.0, 1.0,
        );
        let aspect = if aspect.is_finite() && aspect > 0.0 { aspect } else { 1.0 };
        vulkan_clip * Perspective3::new(aspect, self.fov_y, self.near, self.far).to_homogeneous()
    }
}

impl Camera for PerspectiveCamera {
    fn view_projection(&self, aspect: f32) -> Matrix4<f32> {
        self.projection(aspect) * self.view()
    }
}

/// SPIR-V files of one pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShaderSource {
    /// Vertex stage bytecode path
    pub vertex: PathBuf,
    /// Fragment stage bytecode path
    pub fragment: PathBuf,
}

impl ShaderSource {
    /// Pair of compiled shader paths
    pub fn new(vertex: impl Into<PathBuf>, fragment: impl Into<PathBuf>) -> Self {
        Self {
            vertex: vertex.into(),
            fragment: fragment.into(),
        }
    }
}

/// Texture inputs of one material
#[derive(Debug, Clone, PartialEq)]
pub struct MaterialSource {
    /// Image files, one per layer when `is_array`
    pub textures: Vec<PathBuf>,
    /// Pack all images into one array texture
    pub is_array: bool,
    /// Sampling parameters
    pub sampler: SamplerConfig,
}

impl MaterialSource {
    /// Material sampling one image
    pub fn single(path: impl Into<PathBuf>) -> Self {
        Self {
            textures: vec![path.into()],
            is_array: false,
            sampler: SamplerConfig::default(),
        }
    }

    /// Material sampling an array built from `paths`
    pub fn array(paths: impl IntoIterator<Item = impl Into<PathBuf>>) -> Self {
        Self {
            textures: paths.into_iter().map(Into::into).collect(),
            is_array: true,
            sampler: SamplerConfig::default(),
        }
    }
}

/// Meshes drawn with one material
#[derive(Debug)]
pub struct MaterialGroup {
    /// Material description
    pub material: MaterialSource,
    /// Meshes using it, in draw order
    pub meshes: Vec<Mesh>,
}

/// Materials drawn with one shader pipeline
#[derive(Debug)]
pub struct ShaderGroup {
    /// Pipeline description
    pub shader: ShaderSource,
    /// Materials, in draw order
    pub materials: Vec<MaterialGroup>,
}

/// Everything the engine draws
pub struct Scene {
    /// Camera used for every shader group
    pub camera: Box<dyn Camera>,
    /// Shader groups, in draw order
    pub groups: Vec<ShaderGroup>,
}

impl Scene {
    /// Empty scene viewed through `camera`
    pub fn new(camera: impl Camera + 'static) -> Self {
        Self {
            camera: Box::new(camera),
            groups: Vec::new(),
        }
    }

    /// Append a shader group
    #[must_use]
    pub fn with_group(mut self, group: ShaderGroup) -> Self {
        self.groups.push(group);
        self
    }

    /// Every mesh in draw order
    pub fn meshes(&self) -> impl Iterator<Item = &Mesh> {
        self.groups
            .iter()
            .flat_map(|g| g.materials.iter())
            .flat_map(|m| m.meshes.iter())
    }

    /// Every mesh, mutably
    pub fn meshes_mut(&mut self) -> impl Iterator<Item = &mut Mesh> {
        self.groups
            .iter_mut()
            .flat_map(|g| g.materials.iter_mut())
            .flat_map(|m| m.meshes.iter_mut())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use nalgebra::Vector4;

    #[test]
    fn test_vertex_layout() {
        assert_eq!(Vertex::STRIDE, 32);
        let attributes = Vertex::attributes();
        assert_eq!(attributes[2].offset, 24);
    }

    #[test]
    fn test_mesh_bytes_put_indices_first() {
        let mesh = Mesh::new(
            vec![Vertex::new([1.0, 2.0, 3.0], [0.0; 3], [0.0; 2])],
            vec![7, 0, 0],
        );
        let bytes = mesh.to_bytes();
        assert_eq!(bytes.len(), 12 + 32);
        assert_eq!(&bytes[..4], &7_u32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &1.0_f32.to_ne_bytes());
    }

    #[test]
    fn test_cube_mesh_shape() {
        let cube = cube_mesh(Matrix4::identity());
        assert_eq!(cube.vertices.len(), 24);
        assert_eq!(cube.indices.len(), 36);
        assert!(cube.indices.iter().all(|&i| (i as usize) < cube.vertices.len()));
        for vertex in &cube.vertices {
            for coordinate in vertex.position {
                assert_relative_eq!(coordinate.abs(), 0.5);
            }
        }
    }

    #[test]
    fn test_projection_depth_range() {
        let camera = PerspectiveCamera::new(Point3::origin(), Point3::new(0.0, 0.0, -1.0));
        let projection = camera.projection(1.0);

        let near = projection * Vector4::new(0.0, 0.0, -camera.near, 1.0);
        let far = projection * Vector4::new(0.0, 0.0, -camera.far, 1.0);
        assert_relative_eq!(near.z / near.w, 0.0, epsilon = 1e-5);
        assert_relative_eq!(far.z / far.w, 1.0, epsilon = 1e-5);
    }

    #[test]
    fn test_projection_flips_y() {
        let camera = PerspectiveCamera::new(Point3::origin(), Point3::new(0.0, 0.0, -1.0));
        let clip = camera.view_projection(1.0) * Vector4::new(0.0, 1.0, -2.0, 1.0);
        assert!(clip.y / clip.w < 0.0);
    }

    #[test]
    fn test_bad_aspect_falls_back() {
        let camera = PerspectiveCamera::new(Point3::new(0.0, 0.0, 3.0), Point3::origin());
        assert_relative_eq!(camera.projection(0.0), camera.projection(1.0));
    }

    #[test]
    fn test_scene_mesh_order() {
        let scene = Scene::new(PerspectiveCamera::new(Point3::origin(), Point3::new(0.0, 0.0, -1.0)))
            .with_group(ShaderGroup {
                shader: ShaderSource::new("a.vert.spv", "a.frag.spv"),
                materials: vec![
                    MaterialGroup {
                        material: MaterialSource::single("a.png"),
                        meshes: vec![Mesh::new(Vec::new(), vec![1])],
                    },
                    MaterialGroup {
                        material: MaterialSource::single("b.png"),
                        meshes: vec![Mesh::new(Vec::new(), vec![2]), Mesh::new(Vec::new(), vec![3])],
                    },
                ],
            });
        let order: Vec<u32> = scene.meshes().map(|m| m.indices[0]).collect();
        assert_eq!(order, vec![1, 2, 3]);
    }
}
