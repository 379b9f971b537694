//! GPU backend protocol
//!
//! The rendering core talks to the GPU only through [`GpuInstance`] and
//! [`GpuDevice`]. Handles are plain `ash::vk` handles so the same recorded
//! commands work against the Vulkan backend and the headless simulation.
//!
//! Calls return raw `VkResult`s; the core adds context when it maps them into
//! [`RenderError`](crate::RenderError).

use ash::prelude::VkResult;
use ash::vk;

use crate::device::{AdapterInfo, DeviceRequirements, QueueFamilyIndices};

pub mod headless;
pub mod vulkan;

/// Where an allocation should live
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryLocation {
    /// Fast device memory, not mappable
    DeviceLocal,
    /// Host-visible, coherent memory the CPU can write
    HostVisible,
}

/// Buffer creation parameters
#[derive(Debug, Clone, Copy)]
pub struct BufferDesc {
    /// Size in bytes
    pub size: u64,
    /// How the buffer will be used
    pub usage: vk::BufferUsageFlags,
    /// Memory placement
    pub location: MemoryLocation,
}

/// 2D image creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ImageDesc {
    /// Image size
    pub extent: vk::Extent2D,
    /// Texel format
    pub format: vk::Format,
    /// How the image will be used
    pub usage: vk::ImageUsageFlags,
    /// Number of array layers, 1 for a plain 2D image
    pub array_layers: u32,
}

/// Image view creation parameters
#[derive(Debug, Clone, Copy)]
pub struct ImageViewDesc {
    /// Viewed image
    pub image: vk::Image,
    /// View format
    pub format: vk::Format,
    /// Color or depth aspect
    pub aspect: vk::ImageAspectFlags,
    /// `TYPE_2D` or `TYPE_2D_ARRAY`
    pub view_type: vk::ImageViewType,
    /// Layers covered by the view
    pub layer_count: u32,
}

/// Sampler creation parameters
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SamplerDesc {
    /// Min and mag filter
    pub filter: vk::Filter,
    /// Address mode on all axes
    pub address_mode: vk::SamplerAddressMode,
    /// Maximum anisotropy, `None` to disable
    pub anisotropy: Option<f32>,
}

/// Surface capabilities as reported for one adapter
#[derive(Debug, Clone, Default)]
pub struct SurfaceSupport {
    /// Extent and image count limits
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    /// Supported formats in driver order
    pub formats: Vec<vk::SurfaceFormatKHR>,
    /// Supported present modes
    pub present_modes: Vec<vk::PresentModeKHR>,
}

/// Fully resolved presentation chain parameters
#[derive(Debug, Clone, Copy)]
pub struct SwapchainPlan {
    /// Image format and color space
    pub format: vk::SurfaceFormatKHR,
    /// Presentation mode
    pub present_mode: vk::PresentModeKHR,
    /// Image size
    pub extent: vk::Extent2D,
    /// Number of presentable images
    pub image_count: u32,
    /// Surface transform to apply
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
    /// Queue families that access the images
    pub graphics_family: u32,
    /// Family that presents the images
    pub present_family: u32,
}

/// One queue submission
#[derive(Debug, Clone, Copy)]
pub struct Submission<'a> {
    /// Command buffer to execute
    pub command_buffer: vk::CommandBuffer,
    /// Signals to wait on, with the stage that waits
    pub waits: &'a [(vk::Semaphore, vk::PipelineStageFlags)],
    /// Signals raised on completion
    pub signals: &'a [vk::Semaphore],
    /// Fence signaled on completion
    pub fence: Option<vk::Fence>,
}

/// Graphics pipeline creation parameters
#[derive(Debug, Clone, Copy)]
pub struct PipelineDesc<'a> {
    /// Vertex shader SPIR-V words
    pub vertex_spirv: &'a [u32],
    /// Fragment shader SPIR-V words
    pub fragment_spirv: &'a [u32],
    /// Render pass the pipeline draws into
    pub render_pass: vk::RenderPass,
    /// Bytes per vertex
    pub vertex_stride: u32,
    /// Vertex attribute layout
    pub vertex_attributes: &'a [vk::VertexInputAttributeDescription],
    /// Push constant range size shared by both stages
    pub push_constant_size: u32,
}

/// Objects that make up one graphics pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineHandles {
    /// Pipeline object
    pub pipeline: vk::Pipeline,
    /// Layout holding push constants and the material set
    pub layout: vk::PipelineLayout,
    /// Layout of the material descriptor set (one combined image sampler)
    pub set_layout: vk::DescriptorSetLayout,
}

/// A material descriptor set and the pool it was allocated from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MaterialSet {
    /// Pool owning the set
    pub pool: vk::DescriptorPool,
    /// Descriptor set bound at set 0
    pub set: vk::DescriptorSet,
}

/// Pipeline barrier for a whole buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BufferBarrier {
    /// Buffer covered by the barrier
    pub buffer: vk::Buffer,
    /// Stage that produced the data
    pub src_stage: vk::PipelineStageFlags,
    /// Stage that consumes the data
    pub dst_stage: vk::PipelineStageFlags,
    /// Writes made available
    pub src_access: vk::AccessFlags,
    /// Reads made visible
    pub dst_access: vk::AccessFlags,
    /// Releasing family, or `QUEUE_FAMILY_IGNORED`
    pub src_family: u32,
    /// Acquiring family, or `QUEUE_FAMILY_IGNORED`
    pub dst_family: u32,
}

/// Pipeline barrier with a layout transition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ImageBarrier {
    /// Image covered by the barrier
    pub image: vk::Image,
    /// Layout before the barrier
    pub old_layout: vk::ImageLayout,
    /// Layout after the barrier
    pub new_layout: vk::ImageLayout,
    /// Stage that produced the data
    pub src_stage: vk::PipelineStageFlags,
    /// Stage that consumes the data
    pub dst_stage: vk::PipelineStageFlags,
    /// Writes made available
    pub src_access: vk::AccessFlags,
    /// Reads made visible
    pub dst_access: vk::AccessFlags,
    /// Releasing family, or `QUEUE_FAMILY_IGNORED`
    pub src_family: u32,
    /// Acquiring family, or `QUEUE_FAMILY_IGNORED`
    pub dst_family: u32,
    /// Array layers covered
    pub layer_count: u32,
}

/// A single recorded command
#[derive(Debug, Clone, Copy)]
pub enum GpuCommand {
    /// Set viewport 0
    SetViewport(vk::Viewport),
    /// Set scissor 0
    SetScissor(vk::Rect2D),
    /// Begin a render pass clearing color and depth
    BeginRenderPass {
        /// Pass to begin
        render_pass: vk::RenderPass,
        /// Target framebuffer
        framebuffer: vk::Framebuffer,
        /// Render area, starting at the origin
        extent: vk::Extent2D,
        /// Color clear value
        clear_color: [f32; 4],
        /// Depth clear value
        clear_depth: f32,
    },
    /// End the current render pass
    EndRenderPass,
    /// Bind a graphics pipeline
    BindPipeline(vk::Pipeline),
    /// Bind a descriptor set at set 0
    BindDescriptorSet {
        /// Layout the set is compatible with
        layout: vk::PipelineLayout,
        /// Set to bind
        set: vk::DescriptorSet,
    },
    /// Push one column-major 4x4 matrix to the vertex and fragment stages
    PushMatrix {
        /// Layout declaring the push constant range
        layout: vk::PipelineLayout,
        /// Byte offset in the range
        offset: u32,
        /// Matrix columns
        matrix: [f32; 16],
    },
    /// Bind vertex buffer 0
    BindVertexBuffer {
        /// Buffer holding vertices
        buffer: vk::Buffer,
        /// Byte offset of the first vertex
        offset: u64,
    },
    /// Bind a `u32` index buffer
    BindIndexBuffer {
        /// Buffer holding indices
        buffer: vk::Buffer,
        /// Byte offset of the first index
        offset: u64,
    },
    /// Indexed draw of one instance
    DrawIndexed {
        /// Number of indices
        index_count: u32,
    },
    /// Copy a prefix of one buffer to another
    CopyBuffer {
        /// Source buffer
        src: vk::Buffer,
        /// Destination buffer
        dst: vk::Buffer,
        /// Bytes to copy
        size: u64,
    },
    /// Copy tightly packed layers into an image in `TRANSFER_DST_OPTIMAL`
    CopyBufferToImage {
        /// Source buffer, layers stored back to back
        src: vk::Buffer,
        /// Destination image
        dst: vk::Image,
        /// Size of every layer
        extent: vk::Extent2D,
        /// Number of layers
        layer_count: u32,
    },
    /// Buffer memory barrier
    BufferBarrier(BufferBarrier),
    /// Image memory barrier
    ImageBarrier(ImageBarrier),
}

/// Entry point of a backend: enumerates adapters and opens devices
pub trait GpuInstance {
    /// Device type produced by this instance
    type Device: GpuDevice;

    /// List every physical adapter with its capabilities
    fn enumerate_adapters(&self) -> VkResult<Vec<AdapterInfo>>;

    /// Open a logical device with one queue per distinct family
    fn create_device(
        &self,
        adapter: &AdapterInfo,
        families: &QueueFamilyIndices,
        requirements: &DeviceRequirements,
    ) -> VkResult<Self::Device>;
}

/// Logical device operations the core relies on
///
/// All methods take `&self`: the core is single-threaded and owns the device.
/// Destroy calls accept handles previously created by the same device.
pub trait GpuDevice {
    /// Backend memory block backing a buffer or image
    type Memory;

    /// Queue 0 of `family`
    fn queue(&self, family: u32) -> vk::Queue;
    /// Block until every queue is idle
    fn wait_idle(&self) -> VkResult<()>;
    /// Current surface capabilities
    fn surface_support(&self) -> VkResult<SurfaceSupport>;

    /// Create a presentation chain, retiring `old` if not null
    fn create_swapchain(
        &self,
        plan: &SwapchainPlan,
        old: vk::SwapchainKHR,
    ) -> VkResult<vk::SwapchainKHR>;
    /// Images owned by a presentation chain
    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>>;
    /// Destroy a presentation chain
    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR);
    /// Acquire the next image, signaling `signal`; returns the index and a suboptimal flag
    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        timeout: u64,
    ) -> VkResult<(u32, bool)>;
    /// Present `image_index` after `wait`; returns a suboptimal flag
    fn queue_present(
        &self,
        queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool>;

    /// Create a buffer with bound memory
    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<(vk::Buffer, Self::Memory)>;
    /// Write `data` into host-visible memory at `offset`
    fn write_memory(&self, memory: &mut Self::Memory, offset: u64, data: &[u8]) -> VkResult<()>;
    /// Destroy a buffer and free its memory
    fn destroy_buffer(&self, buffer: vk::Buffer, memory: Self::Memory);
    /// Create a device-local image with bound memory
    fn create_image(&self, desc: &ImageDesc) -> VkResult<(vk::Image, Self::Memory)>;
    /// Destroy an image and free its memory
    fn destroy_image(&self, image: vk::Image, memory: Self::Memory);
    /// Create an image view
    fn create_image_view(&self, desc: &ImageViewDesc) -> VkResult<vk::ImageView>;
    /// Destroy an image view
    fn destroy_image_view(&self, view: vk::ImageView);
    /// Create a sampler
    fn create_sampler(&self, desc: &SamplerDesc) -> VkResult<vk::Sampler>;
    /// Destroy a sampler
    fn destroy_sampler(&self, sampler: vk::Sampler);
    /// Best supported depth attachment format
    fn find_depth_format(&self) -> VkResult<vk::Format>;

    /// Create a single-subpass pass with one color and one depth attachment
    fn create_render_pass(
        &self,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> VkResult<vk::RenderPass>;
    /// Destroy a render pass
    fn destroy_render_pass(&self, render_pass: vk::RenderPass);
    /// Create a framebuffer over `attachments`
    fn create_framebuffer(
        &self,
        render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer>;
    /// Destroy a framebuffer
    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer);

    /// Create a binary semaphore
    fn create_semaphore(&self) -> VkResult<vk::Semaphore>;
    /// Destroy a semaphore
    fn destroy_semaphore(&self, semaphore: vk::Semaphore);
    /// Create a fence, optionally already signaled
    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence>;
    /// Destroy a fence
    fn destroy_fence(&self, fence: vk::Fence);
    /// Block until `fence` signals or `timeout` nanoseconds pass (`Err(TIMEOUT)`)
    fn wait_for_fence(&self, fence: vk::Fence, timeout: u64) -> VkResult<()>;
    /// Return a fence to the unsignaled state
    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()>;
    /// Non-blocking fence query
    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool>;

    /// Create a command pool whose buffers can be reset individually
    fn create_command_pool(&self, family: u32, transient: bool) -> VkResult<vk::CommandPool>;
    /// Destroy a command pool and every buffer allocated from it
    fn destroy_command_pool(&self, pool: vk::CommandPool);
    /// Allocate one primary command buffer
    fn allocate_command_buffer(&self, pool: vk::CommandPool) -> VkResult<vk::CommandBuffer>;
    /// Return a command buffer to its pool
    fn free_command_buffer(&self, pool: vk::CommandPool, command_buffer: vk::CommandBuffer);
    /// Reset and begin recording
    fn begin_command_buffer(&self, command_buffer: vk::CommandBuffer, one_time: bool)
        -> VkResult<()>;
    /// Finish recording
    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()>;
    /// Record one command
    fn record(&self, command_buffer: vk::CommandBuffer, command: &GpuCommand);
    /// Submit recorded work to `queue`
    fn submit(&self, queue: vk::Queue, submission: &Submission<'_>) -> VkResult<()>;

    /// Build a graphics pipeline
    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> VkResult<PipelineHandles>;
    /// Destroy a pipeline with its layouts
    fn destroy_pipeline(&self, handles: &PipelineHandles);
    /// Allocate and write a material set sampling `view`
    fn create_material_set(
        &self,
        set_layout: vk::DescriptorSetLayout,
        view: vk::ImageView,
        sampler: vk::Sampler,
    ) -> VkResult<MaterialSet>;
    /// Free a material set and its pool
    fn destroy_material_set(&self, material: &MaterialSet);
}
