//! Typestate command recording
//!
//! A [`CommandRecorder`] wraps one command buffer between `begin` and `end`.
//! The state parameter decides which commands are available:
//!
//! ```text
//! begin ─▶ Recording ──begin_render_pass──▶ InRenderPass
//!              ▲                                 │
//!              └────────end_render_pass──────────┘
//! Recording ──end──▶ Ended ──submit──▶ (consumed)
//! ```
//!
//! Every method takes the recorder by value and hands it back, so calls chain
//! and a finished recorder cannot be written to again.

use std::marker::PhantomData;

use ash::vk;
use nalgebra::Matrix4;

use crate::backend::{BufferBarrier, GpuCommand, GpuDevice, ImageBarrier, PipelineHandles, Submission};
use crate::config::MissingMeshPolicy;
use crate::error::{api, RenderResult, ResourceMisuse};
use crate::memory::MemoryAllocator;
use crate::scene::Mesh;

/// Byte offset of the view-projection matrix in the push constant block
pub const VIEW_PROJECTION_OFFSET: u32 = 0;
/// Byte offset of the model matrix in the push constant block
pub const MODEL_OFFSET: u32 = 64;
/// Size of the push constant block shared by every pipeline
pub const PUSH_CONSTANT_SIZE: u32 = 128;

/// Outside a render pass, commands may still be added
#[derive(Debug)]
pub struct Recording;
/// Inside a render pass
#[derive(Debug)]
pub struct InRenderPass;
/// Recording finished, ready to submit
#[derive(Debug)]
pub struct Ended;

/// Builder over one command buffer
#[must_use = "a recorder must be ended and submitted"]
pub struct CommandRecorder<'d, D: GpuDevice, S = Recording> {
    device: &'d D,
    command_buffer: vk::CommandBuffer,
    _state: PhantomData<S>,
}

impl<'d, D: GpuDevice, S> CommandRecorder<'d, D, S> {
    /// Command buffer being recorded
    pub fn command_buffer(&self) -> vk::CommandBuffer {
        self.command_buffer
    }

    fn push(self, command: GpuCommand) -> Self {
        self.device.record(self.command_buffer, &command);
        self
    }

    fn into_state<T>(self) -> CommandRecorder<'d, D, T> {
        CommandRecorder {
            device: self.device,
            command_buffer: self.command_buffer,
            _state: PhantomData,
        }
    }
}

impl<'d, D: GpuDevice> CommandRecorder<'d, D, Recording> {
    /// Reset `command_buffer` and begin a one-time recording
    pub fn begin(device: &'d D, command_buffer: vk::CommandBuffer) -> RenderResult<Self> {
        device
            .begin_command_buffer(command_buffer, true)
            .map_err(api("begin command buffer"))?;
        Ok(Self {
            device,
            command_buffer,
            _state: PhantomData,
        })
    }

    /// Full-extent viewport with a 0..1 depth range
    #[allow(clippy::cast_precision_loss)]
    pub fn set_viewport(self, extent: vk::Extent2D) -> Self {
        self.push(GpuCommand::SetViewport(vk::Viewport {
            x: 0.0,
            y: 0.0,
            width: extent.width as f32,
            height: extent.height as f32,
            min_depth: 0.0,
            max_depth: 1.0,
        }))
    }

    /// Full-extent scissor
    pub fn set_scissor(self, extent: vk::Extent2D) -> Self {
        self.push(GpuCommand::SetScissor(vk::Rect2D {
            offset: vk::Offset2D { x: 0, y: 0 },
            extent,
        }))
    }

    /// Copy the first `size` bytes of `src` into `dst`
    pub fn copy_buffer(self, src: vk::Buffer, dst: vk::Buffer, size: u64) -> Self {
        self.push(GpuCommand::CopyBuffer { src, dst, size })
    }

    /// Copy packed layers from `src` into `dst`
    pub fn copy_buffer_to_image(
        self,
        src: vk::Buffer,
        dst: vk::Image,
        extent: vk::Extent2D,
        layer_count: u32,
    ) -> Self {
        self.push(GpuCommand::CopyBufferToImage {
            src,
            dst,
            extent,
            layer_count,
        })
    }

    /// Record a buffer barrier
    pub fn buffer_barrier(self, barrier: BufferBarrier) -> Self {
        self.push(GpuCommand::BufferBarrier(barrier))
    }

    /// Record an image barrier
    pub fn image_barrier(self, barrier: ImageBarrier) -> Self {
        self.push(GpuCommand::ImageBarrier(barrier))
    }

    /// Begin a render pass clearing color and depth
    pub fn begin_render_pass(
        self,
        render_pass: vk::RenderPass,
        framebuffer: vk::Framebuffer,
        extent: vk::Extent2D,
        clear_color: [f32; 4],
        clear_depth: f32,
    ) -> CommandRecorder<'d, D, InRenderPass> {
        self.push(GpuCommand::BeginRenderPass {
            render_pass,
            framebuffer,
            extent,
            clear_color,
            clear_depth,
        })
        .into_state()
    }

    /// Finish recording
    pub fn end(self) -> RenderResult<CommandRecorder<'d, D, Ended>> {
        self.device
            .end_command_buffer(self.command_buffer)
            .map_err(api("end command buffer"))?;
        Ok(self.into_state())
    }
}

impl<'d, D: GpuDevice> CommandRecorder<'d, D, InRenderPass> {
    /// Bind a shader pipeline
    pub fn bind_pipeline(self, pipeline: &PipelineHandles) -> Self {
        self.push(GpuCommand::BindPipeline(pipeline.pipeline))
    }

    /// Bind a material descriptor set at set 0
    pub fn bind_material(self, layout: vk::PipelineLayout, set: vk::DescriptorSet) -> Self {
        self.push(GpuCommand::BindDescriptorSet { layout, set })
    }

    /// Push a matrix at `offset` in the push constant block
    pub fn push_matrix(self, layout: vk::PipelineLayout, offset: u32, matrix: &Matrix4<f32>) -> Self {
        let mut columns = [0.0_f32; 16];
        columns.copy_from_slice(matrix.as_slice());
        self.push(GpuCommand::PushMatrix {
            layout,
            offset,
            matrix: columns,
        })
    }

    /// Push the camera matrix shared by every mesh of a shader
    pub fn push_view_projection(self, layout: vk::PipelineLayout, matrix: &Matrix4<f32>) -> Self {
        self.push_matrix(layout, VIEW_PROJECTION_OFFSET, matrix)
    }

    /// Push the model matrix, bind the mesh buffer and draw it.
    ///
    /// A mesh without a valid allocation is left out under
    /// [`MissingMeshPolicy::Skip`] and rejected with
    /// [`ResourceMisuse::UnuploadedMesh`] under [`MissingMeshPolicy::Fail`].
    pub fn draw_mesh(
        self,
        layout: vk::PipelineLayout,
        mesh: &Mesh,
        allocator: &MemoryAllocator<D>,
        policy: MissingMeshPolicy,
    ) -> RenderResult<Self> {
        let Some(gpu) = mesh.gpu().filter(|gpu| gpu.allocation().is_valid()) else {
            return match policy {
                MissingMeshPolicy::Skip => {
                    log::debug!("Skipping mesh without GPU allocation");
                    Ok(self)
                }
                MissingMeshPolicy::Fail => Err(ResourceMisuse::UnuploadedMesh.into()),
            };
        };
        let buffer = allocator.buffer(gpu.allocation())?;

        Ok(self
            .push_matrix(layout, MODEL_OFFSET, &mesh.model)
            .push(GpuCommand::BindIndexBuffer { buffer, offset: 0 })
            .push(GpuCommand::BindVertexBuffer {
                buffer,
                offset: gpu.vertex_offset(),
            })
            .push(GpuCommand::DrawIndexed {
                index_count: gpu.index_count(),
            }))
    }

    /// End the render pass
    pub fn end_render_pass(self) -> CommandRecorder<'d, D, Recording> {
        self.push(GpuCommand::EndRenderPass).into_state()
    }
}

impl<'d, D: GpuDevice> CommandRecorder<'d, D, Ended> {
    /// Submit to `queue` with no semaphores
    pub fn submit(self, queue: vk::Queue, fence: Option<vk::Fence>) -> RenderResult<()> {
        self.submit_with(queue, &[], &[], fence)
    }

    /// Submit to `queue`, waiting on and signaling semaphores
    pub fn submit_with(
        self,
        queue: vk::Queue,
        waits: &[(vk::Semaphore, vk::PipelineStageFlags)],
        signals: &[vk::Semaphore],
        fence: Option<vk::Fence>,
    ) -> RenderResult<()> {
        self.device
            .submit(
                queue,
                &Submission {
                    command_buffer: self.command_buffer,
                    waits,
                    signals,
                    fence,
                },
            )
            .map_err(api("queue submit"))
    }
}
