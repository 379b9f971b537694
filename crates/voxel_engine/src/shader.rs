//! Shader pipelines and the materials drawn with them

use std::fs::File;
use std::path::{Path, PathBuf};

use ash::vk;

use crate::backend::{GpuDevice, MaterialSet, PipelineDesc, PipelineHandles};
use crate::device::DeviceContext;
use crate::error::{creation, RenderError, RenderResult};
use crate::memory::MemoryAllocator;
use crate::recorder::PUSH_CONSTANT_SIZE;
use crate::scene::{MaterialSource, ShaderSource, Vertex};
use crate::texture::{ImageDecoder, Texture};

/// First word of every SPIR-V module
pub const SPIRV_MAGIC: u32 = 0x0723_0203;

/// Read SPIR-V bytecode from `path`
pub fn read_spirv(path: &Path) -> RenderResult<Vec<u32>> {
    let asset_error = |reason: String| RenderError::AssetLoad {
        path: path.display().to_string(),
        reason,
    };
    let mut file = File::open(path).map_err(|e| asset_error(e.to_string()))?;
    let words = ash::util::read_spv(&mut file).map_err(|e| asset_error(e.to_string()))?;
    match words.first() {
        Some(&SPIRV_MAGIC) => Ok(words),
        Some(word) => Err(asset_error(format!("bad SPIR-V magic {word:#010x}"))),
        None => Err(asset_error("empty SPIR-V module".to_string())),
    }
}

/// Graphics pipeline built from a vertex and fragment shader pair
#[derive(Debug)]
pub struct ShaderPipeline {
    source: ShaderSource,
    vertex: Vec<u32>,
    fragment: Vec<u32>,
    handles: PipelineHandles,
}

impl ShaderPipeline {
    /// Load both stages and build a pipeline for `render_pass`
    pub fn load<D: GpuDevice>(
        ctx: &DeviceContext<D>,
        render_pass: vk::RenderPass,
        source: &ShaderSource,
    ) -> RenderResult<Self> {
        let vertex = read_spirv(&source.vertex)?;
        let fragment = read_spirv(&source.fragment)?;
        let handles = Self::build(ctx, render_pass, &vertex, &fragment)?;
        log::debug!("Loaded shader pipeline {:?} / {:?}", source.vertex, source.fragment);
        Ok(Self {
            source: source.clone(),
            vertex,
            fragment,
            handles,
        })
    }

    fn build<D: GpuDevice>(
        ctx: &DeviceContext<D>,
        render_pass: vk::RenderPass,
        vertex: &[u32],
        fragment: &[u32],
    ) -> RenderResult<PipelineHandles> {
        let attributes = Vertex::attributes();
        ctx.device()
            .create_pipeline(&PipelineDesc {
                vertex_spirv: vertex,
                fragment_spirv: fragment,
                render_pass,
                vertex_stride: Vertex::STRIDE,
                vertex_attributes: &attributes,
                push_constant_size: PUSH_CONSTANT_SIZE,
            })
            .map_err(creation("graphics pipeline"))
    }

    /// Replace the pipeline for a new render pass. The caller has waited for the device to go idle.
    pub fn rebuild<D: GpuDevice>(
        &mut self,
        ctx: &DeviceContext<D>,
        render_pass: vk::RenderPass,
    ) -> RenderResult<()> {
        let handles = Self::build(ctx, render_pass, &self.vertex, &self.fragment)?;
        ctx.device().destroy_pipeline(&self.handles);
        self.handles = handles;
        Ok(())
    }

    /// Pipeline, layout and material set layout
    pub fn handles(&self) -> &PipelineHandles {
        &self.handles
    }

    /// Pipeline layout used for push constants and material sets
    pub fn layout(&self) -> vk::PipelineLayout {
        self.handles.layout
    }

    /// Bytecode paths
    pub fn source(&self) -> &ShaderSource {
        &self.source
    }

    /// Destroy the pipeline. The caller has waited for the device to go idle.
    pub fn destroy<D: GpuDevice>(self, ctx: &DeviceContext<D>) {
        ctx.device().destroy_pipeline(&self.handles);
    }
}

/// Texture bound to a shader's material set
#[derive(Debug)]
pub struct Material {
    textures: Vec<PathBuf>,
    texture: Texture,
    set: MaterialSet,
}

impl Material {
    /// Build the texture described by `source` and a set for `pipeline`
    pub fn create<D: GpuDevice>(
        ctx: &DeviceContext<D>,
        allocator: &mut MemoryAllocator<D>,
        decoder: &dyn ImageDecoder,
        source: &MaterialSource,
        pipeline: &ShaderPipeline,
        max_anisotropy: f32,
    ) -> RenderResult<Self> {
        let texture = Texture::create(
            ctx,
            allocator,
            decoder,
            &source.textures,
            source.is_array,
            &source.sampler,
            max_anisotropy,
        )?;
        let set = match ctx.device().create_material_set(
            pipeline.handles().set_layout,
            texture.view(),
            texture.sampler(),
        ) {
            Ok(set) => set,
            Err(error) => {
                ctx.wait_idle()?;
                allocator.flush(ctx)?;
                texture.destroy(ctx, allocator)?;
                return Err(creation("material descriptor set")(error));
            }
        };
        Ok(Self {
            textures: source.textures.clone(),
            texture,
            set,
        })
    }

    /// Descriptor set to bind before drawing
    pub fn descriptor_set(&self) -> vk::DescriptorSet {
        self.set.set
    }

    /// Texture sampled by the material
    pub fn texture(&self) -> &Texture {
        &self.texture
    }

    /// Source image paths
    pub fn textures(&self) -> &[PathBuf] {
        &self.textures
    }

    /// Reallocate the set against a rebuilt pipeline's layout
    pub fn rebind<D: GpuDevice>(
        &mut self,
        ctx: &DeviceContext<D>,
        pipeline: &ShaderPipeline,
    ) -> RenderResult<()> {
        let set = ctx
            .device()
            .create_material_set(
                pipeline.handles().set_layout,
                self.texture.view(),
                self.texture.sampler(),
            )
            .map_err(creation("material descriptor set"))?;
        ctx.device().destroy_material_set(&self.set);
        self.set = set;
        Ok(())
    }

    /// Free the set and texture. The caller has waited for the device to go idle.
    pub fn destroy<D: GpuDevice>(
        self,
        ctx: &DeviceContext<D>,
        allocator: &mut MemoryAllocator<D>,
    ) -> RenderResult<()> {
        ctx.device().destroy_material_set(&self.set);
        self.texture.destroy(ctx, allocator)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{HeadlessInstance, ObjectKind};
    use crate::device::DeviceRequirements;

    fn write_words(name: &str, words: &[u32]) -> PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, bytemuck::cast_slice::<u32, u8>(words)).unwrap();
        path
    }

    #[test]
    fn test_read_spirv_checks_magic() {
        let good = write_words("voxel_engine_good.spv", &[SPIRV_MAGIC, 0x0001_0000, 0, 1, 0]);
        assert_eq!(read_spirv(&good).unwrap()[0], SPIRV_MAGIC);

        let bad = write_words("voxel_engine_bad.spv", &[0xdead_beef, 0]);
        assert!(matches!(read_spirv(&bad), Err(RenderError::AssetLoad { .. })));

        let path = std::env::temp_dir().join("voxel_engine_truncated.spv");
        std::fs::write(&path, [0x03, 0x02, 0x23]).unwrap();
        assert!(matches!(read_spirv(&path), Err(RenderError::AssetLoad { .. })));

        assert!(matches!(
            read_spirv(Path::new("no/such/shader.spv")),
            Err(RenderError::AssetLoad { path, .. }) if path.ends_with("shader.spv")
        ));
    }

    #[test]
    fn test_pipeline_rebuild_replaces_handles() {
        let instance = HeadlessInstance::default();
        let probe = instance.probe();
        let ctx = DeviceContext::select(&instance, &DeviceRequirements::default()).unwrap();
        let source = ShaderSource::new(
            write_words("voxel_engine_pipeline.vert.spv", &[SPIRV_MAGIC, 0, 0, 0, 0]),
            write_words("voxel_engine_pipeline.frag.spv", &[SPIRV_MAGIC, 0, 0, 0, 0]),
        );
        let pass = ctx
            .device()
            .create_render_pass(vk::Format::B8G8R8A8_SRGB, vk::Format::D32_SFLOAT)
            .unwrap();

        let mut pipeline = ShaderPipeline::load(&ctx, pass, &source).unwrap();
        let first = *pipeline.handles();
        pipeline.rebuild(&ctx, pass).unwrap();
        assert_ne!(pipeline.handles().pipeline, first.pipeline);
        assert_eq!(probe.live(ObjectKind::Pipeline), 1);

        pipeline.destroy(&ctx);
        assert_eq!(probe.live(ObjectKind::Pipeline), 0);
    }
}
