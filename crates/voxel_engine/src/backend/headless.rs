//! Headless simulation of the GPU protocol
//!
//! [`HeadlessInstance`] and [`HeadlessDevice`] implement the backend traits on
//! the CPU. Handles are counters, memory is plain byte vectors and GPU work
//! "completes" when a fence is waited on, when `wait_idle` runs, or when a
//! test calls [`HeadlessProbe::complete_pending`]. Fences attached to a
//! submission complete immediately while auto-complete is on (the default).
//!
//! Every call is logged and checked against the lifetime rules of the
//! protocol. Breaking one (re-recording a command buffer that is still in
//! flight, destroying a buffer pending GPU reads, submitting with a signaled
//! fence) is recorded as a violation so tests can assert there were none.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet, VecDeque};
use std::rc::Rc;

use ash::prelude::VkResult;
use ash::vk::{self, Handle};

use crate::backend::{
    BufferDesc, GpuCommand, GpuDevice, GpuInstance, ImageDesc, ImageViewDesc, MaterialSet,
    MemoryLocation, PipelineDesc, PipelineHandles, SamplerDesc, Submission, SurfaceSupport,
    SwapchainPlan,
};
use crate::device::{AdapterInfo, DeviceRequirements, QueueFamilyCaps, QueueFamilyIndices};
use crate::scene::InputState;
use crate::window::WindowSurface;

/// Kinds of objects the simulation counts
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObjectKind {
    /// Presentation chain
    Swapchain,
    /// Buffer with memory
    Buffer,
    /// Image with memory
    Image,
    /// Image view
    ImageView,
    /// Sampler
    Sampler,
    /// Render pass
    RenderPass,
    /// Framebuffer
    Framebuffer,
    /// Semaphore
    Semaphore,
    /// Fence
    Fence,
    /// Command pool
    CommandPool,
    /// Command buffer
    CommandBuffer,
    /// Pipeline with its layouts
    Pipeline,
    /// Descriptor pool with one set
    MaterialSet,
}

/// One logged backend call
#[derive(Debug, Clone, Copy)]
pub enum GpuCall {
    /// `wait_idle`
    WaitIdle,
    /// Presentation chain created
    CreateSwapchain {
        /// New chain
        swapchain: vk::SwapchainKHR,
        /// Image size
        extent: vk::Extent2D,
        /// Images requested
        image_count: u32,
        /// Chosen format
        format: vk::Format,
        /// Chosen present mode
        present_mode: vk::PresentModeKHR,
        /// Chain retired by this one, null if none
        retired: vk::SwapchainKHR,
    },
    /// Presentation chain destroyed
    DestroySwapchain(vk::SwapchainKHR),
    /// Image acquisition attempted
    Acquire {
        /// Chain acquired from
        swapchain: vk::SwapchainKHR,
        /// Signal semaphore
        signal: vk::Semaphore,
    },
    /// Present attempted
    Present {
        /// Chain presented to
        swapchain: vk::SwapchainKHR,
        /// Image presented
        image_index: u32,
        /// Semaphore waited on
        wait: vk::Semaphore,
    },
    /// Buffer created
    CreateBuffer {
        /// New buffer
        buffer: vk::Buffer,
        /// Size in bytes
        size: u64,
        /// Memory placement
        location: MemoryLocation,
    },
    /// Buffer destroyed
    DestroyBuffer(vk::Buffer),
    /// Image created
    CreateImage {
        /// New image
        image: vk::Image,
        /// Layer size
        extent: vk::Extent2D,
        /// Array layers
        layers: u32,
        /// Texel format
        format: vk::Format,
    },
    /// Image destroyed
    DestroyImage(vk::Image),
    /// Image view created
    CreateImageView {
        /// New view
        view: vk::ImageView,
        /// `TYPE_2D` or `TYPE_2D_ARRAY`
        view_type: vk::ImageViewType,
        /// Layers covered
        layer_count: u32,
    },
    /// Framebuffer created
    CreateFramebuffer(vk::Framebuffer),
    /// Render pass created
    CreateRenderPass {
        /// Color attachment format
        color_format: vk::Format,
        /// Depth attachment format
        depth_format: vk::Format,
    },
    /// Blocking fence wait
    WaitFence(vk::Fence),
    /// Fence reset
    ResetFence(vk::Fence),
    /// Recording started
    BeginCommandBuffer(vk::CommandBuffer),
    /// Recording finished
    EndCommandBuffer(vk::CommandBuffer),
    /// Command recorded
    Record {
        /// Target command buffer
        command_buffer: vk::CommandBuffer,
        /// Recorded command
        command: GpuCommand,
    },
    /// Work submitted
    Submit {
        /// Target queue
        queue: vk::Queue,
        /// Submitted command buffer
        command_buffer: vk::CommandBuffer,
        /// Completion fence
        fence: Option<vk::Fence>,
        /// Number of wait semaphores
        waits: usize,
        /// Number of signal semaphores
        signals: usize,
    },
    /// Pipeline created
    CreatePipeline(vk::Pipeline),
    /// Pipeline destroyed
    DestroyPipeline(vk::Pipeline),
}

impl GpuCall {
    /// Whether this is an acquire, submit or present
    pub fn is_frame_call(&self) -> bool {
        matches!(self, Self::Acquire { .. } | Self::Submit { .. } | Self::Present { .. })
    }
}

/// Memory block of a simulated buffer or image
#[derive(Debug)]
pub struct HeadlessMemory {
    resource: u64,
    size: u64,
    host_visible: bool,
}

#[derive(Debug, Default, Clone, Copy)]
struct FenceState {
    signaled: bool,
    pending: bool,
}

#[derive(Debug)]
struct PendingSubmission {
    fence: Option<u64>,
    waits: Vec<u64>,
    signals: Vec<u64>,
    buffers: HashSet<u64>,
    done: bool,
}

#[derive(Debug)]
struct SwapchainState {
    image_count: u32,
    next_image: u32,
    images: Vec<vk::Image>,
}

#[derive(Debug)]
struct State {
    next_handle: u64,
    calls: Vec<GpuCall>,
    live: HashMap<ObjectKind, usize>,
    violations: Vec<String>,
    surface: SurfaceSupport,
    depth_format: vk::Format,
    auto_complete: bool,
    fences: HashMap<u64, FenceState>,
    /// Semaphores with a signal nothing has waited on yet
    pending_signals: HashSet<u64>,
    submissions: Vec<PendingSubmission>,
    last_submission: HashMap<u64, usize>,
    recording: HashMap<u64, Vec<GpuCommand>>,
    recorded: HashMap<u64, Vec<GpuCommand>>,
    swapchains: HashMap<u64, SwapchainState>,
    buffer_data: HashMap<u64, Vec<u8>>,
    acquire_script: VecDeque<vk::Result>,
    present_script: VecDeque<vk::Result>,
    submit_script: VecDeque<vk::Result>,
    failures: HashMap<ObjectKind, vk::Result>,
}

impl State {
    fn new(surface: SurfaceSupport) -> Self {
        Self {
            next_handle: 1,
            calls: Vec::new(),
            live: HashMap::new(),
            violations: Vec::new(),
            surface,
            depth_format: vk::Format::D32_SFLOAT,
            auto_complete: true,
            fences: HashMap::new(),
            pending_signals: HashSet::new(),
            submissions: Vec::new(),
            last_submission: HashMap::new(),
            recording: HashMap::new(),
            recorded: HashMap::new(),
            swapchains: HashMap::new(),
            buffer_data: HashMap::new(),
            acquire_script: VecDeque::new(),
            present_script: VecDeque::new(),
            submit_script: VecDeque::new(),
            failures: HashMap::new(),
        }
    }

    fn allocate(&mut self, kind: ObjectKind) -> VkResult<u64> {
        if let Some(result) = self.failures.remove(&kind) {
            return Err(result);
        }
        let handle = self.next_handle;
        self.next_handle += 1;
        *self.live.entry(kind).or_insert(0) += 1;
        Ok(handle)
    }

    fn release(&mut self, kind: ObjectKind, handle: u64) {
        if handle == 0 {
            self.violations.push(format!("destroyed a null {kind:?}"));
            return;
        }
        match self.live.get_mut(&kind) {
            Some(count) if *count > 0 => *count -= 1,
            _ => self.violations.push(format!("destroyed more {kind:?} objects than created")),
        }
    }

    fn violation(&mut self, message: String) {
        log::error!("headless protocol violation: {message}");
        self.violations.push(message);
    }

    /// A queue operation will signal `semaphore`
    fn signal(&mut self, semaphore: u64, operation: &str) {
        if semaphore != 0 && !self.pending_signals.insert(semaphore) {
            self.violation(format!(
                "{operation} signals semaphore {semaphore:#x} which already has a pending signal"
            ));
        }
    }

    /// A queue operation waited on `semaphore`, consuming its signal
    fn consume(&mut self, semaphore: u64) {
        self.pending_signals.remove(&semaphore);
    }

    /// Propagate completion from signaled fences through semaphore waits.
    fn settle(&mut self) {
        loop {
            let mut completed_signals = HashSet::new();
            let mut changed = false;
            for submission in &mut self.submissions {
                if !submission.done {
                    if let Some(fence) = submission.fence {
                        if self.fences.get(&fence).map_or(false, |f| f.signaled) {
                            submission.done = true;
                            changed = true;
                        }
                    }
                }
                if submission.done {
                    completed_signals.extend(submission.waits.iter().copied());
                }
            }
            for submission in &mut self.submissions {
                if !submission.done && submission.signals.iter().any(|s| completed_signals.contains(s)) {
                    submission.done = true;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }
    }

    fn complete_fence(&mut self, fence: u64) {
        if let Some(state) = self.fences.get_mut(&fence) {
            state.signaled = true;
            state.pending = false;
        }
        self.settle();
    }

    fn complete_all(&mut self) {
        for state in self.fences.values_mut() {
            if state.pending {
                state.signaled = true;
                state.pending = false;
            }
        }
        for submission in &mut self.submissions {
            submission.done = true;
        }
    }

    fn buffer_in_flight(&self, buffer: u64) -> bool {
        self.submissions
            .iter()
            .any(|s| !s.done && s.buffers.contains(&buffer))
    }

    fn execute_copies(&mut self, commands: &[GpuCommand]) {
        for command in commands {
            if let GpuCommand::CopyBuffer { src, dst, size } = *command {
                let Ok(len) = usize::try_from(size) else { continue };
                let data = self
                    .buffer_data
                    .get(&src.as_raw())
                    .map(|bytes| bytes[..len.min(bytes.len())].to_vec());
                if let (Some(data), Some(target)) = (data, self.buffer_data.get_mut(&dst.as_raw())) {
                    let end = data.len().min(target.len());
                    target[..end].copy_from_slice(&data[..end]);
                }
            }
        }
    }
}

/// Builder for simulated adapters
#[derive(Debug, Clone)]
pub struct HeadlessAdapter {
    info: AdapterInfo,
}

impl HeadlessAdapter {
    fn new(name: &str, device_type: vk::PhysicalDeviceType) -> Self {
        Self {
            info: AdapterInfo {
                name: name.to_string(),
                handle: vk::PhysicalDevice::null(),
                device_type,
                extensions: vec![crate::device::SWAPCHAIN_EXTENSION.to_string()],
                sampler_anisotropy: true,
                max_sampler_anisotropy: 16.0,
                max_image_dimension_2d: 8192,
                queue_families: vec![QueueFamilyCaps {
                    flags: vk::QueueFlags::GRAPHICS
                        | vk::QueueFlags::COMPUTE
                        | vk::QueueFlags::TRANSFER,
                    queue_count: 1,
                    supports_present: true,
                }],
                surface: default_surface(),
            },
        }
    }

    /// A discrete GPU meeting every default requirement
    pub fn discrete(name: &str) -> Self {
        Self::new(name, vk::PhysicalDeviceType::DISCRETE_GPU)
    }

    /// An integrated GPU meeting every default requirement
    pub fn integrated(name: &str) -> Self {
        Self::new(name, vk::PhysicalDeviceType::INTEGRATED_GPU)
    }

    /// Drop an extension from the supported list
    pub fn without_extension(mut self, name: &str) -> Self {
        self.info.extensions.retain(|e| e != name);
        self
    }

    /// Report no anisotropic sampling
    pub fn without_anisotropy(mut self) -> Self {
        self.info.sampler_anisotropy = false;
        self
    }

    /// Report a surface with no present modes
    pub fn without_present_modes(mut self) -> Self {
        self.info.surface.present_modes.clear();
        self
    }

    /// Add a transfer-only queue family
    pub fn with_dedicated_transfer(mut self) -> Self {
        self.info.queue_families.push(QueueFamilyCaps {
            flags: vk::QueueFlags::TRANSFER,
            queue_count: 1,
            supports_present: false,
        });
        self
    }

    /// Set the 2D image dimension limit
    pub fn max_image_dimension(mut self, limit: u32) -> Self {
        self.info.max_image_dimension_2d = limit;
        self
    }

    /// Replace the surface capabilities
    pub fn surface(mut self, surface: SurfaceSupport) -> Self {
        self.info.surface = surface;
        self
    }

    /// Replace the present modes, keeping driver order
    pub fn present_modes(mut self, modes: &[vk::PresentModeKHR]) -> Self {
        self.info.surface.present_modes = modes.to_vec();
        self
    }

    /// Finish the adapter description
    pub fn build(self) -> AdapterInfo {
        self.info
    }
}

/// Surface reported by simulated adapters unless overridden
pub fn default_surface() -> SurfaceSupport {
    SurfaceSupport {
        capabilities: vk::SurfaceCapabilitiesKHR {
            min_image_count: 2,
            max_image_count: 8,
            current_extent: vk::Extent2D {
                width: 800,
                height: 600,
            },
            min_image_extent: vk::Extent2D {
                width: 1,
                height: 1,
            },
            max_image_extent: vk::Extent2D {
                width: 4096,
                height: 4096,
            },
            max_image_array_layers: 1,
            supported_transforms: vk::SurfaceTransformFlagsKHR::IDENTITY,
            current_transform: vk::SurfaceTransformFlagsKHR::IDENTITY,
            supported_composite_alpha: vk::CompositeAlphaFlagsKHR::OPAQUE,
            supported_usage_flags: vk::ImageUsageFlags::COLOR_ATTACHMENT,
        },
        formats: vec![
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_UNORM,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
            vk::SurfaceFormatKHR {
                format: vk::Format::B8G8R8A8_SRGB,
                color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
            },
        ],
        present_modes: vec![
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ],
    }
}

/// Simulated instance
pub struct HeadlessInstance {
    adapters: Vec<AdapterInfo>,
    state: Rc<RefCell<State>>,
}

impl Default for HeadlessInstance {
    fn default() -> Self {
        Self::new(vec![HeadlessAdapter::discrete("Headless GPU")
            .with_dedicated_transfer()
            .build()])
    }
}

impl HeadlessInstance {
    /// Instance reporting `adapters`
    pub fn new(adapters: Vec<AdapterInfo>) -> Self {
        let surface = adapters
            .first()
            .map_or_else(default_surface, |a| a.surface.clone());
        Self {
            adapters,
            state: Rc::new(RefCell::new(State::new(surface))),
        }
    }

    /// Probe sharing state with every device this instance creates
    pub fn probe(&self) -> HeadlessProbe {
        HeadlessProbe {
            state: Rc::clone(&self.state),
        }
    }
}

impl GpuInstance for HeadlessInstance {
    type Device = HeadlessDevice;

    fn enumerate_adapters(&self) -> VkResult<Vec<AdapterInfo>> {
        Ok(self
            .adapters
            .iter()
            .enumerate()
            .map(|(index, adapter)| AdapterInfo {
                handle: vk::PhysicalDevice::from_raw(index as u64 + 1),
                ..adapter.clone()
            })
            .collect())
    }

    fn create_device(
        &self,
        adapter: &AdapterInfo,
        families: &QueueFamilyIndices,
        requirements: &DeviceRequirements,
    ) -> VkResult<HeadlessDevice> {
        if requirements.first_missing(adapter).is_some() {
            return Err(vk::Result::ERROR_EXTENSION_NOT_PRESENT);
        }
        self.state.borrow_mut().surface = adapter.surface.clone();
        Ok(HeadlessDevice {
            state: Rc::clone(&self.state),
            families: families.unique(),
        })
    }
}

/// Simulated logical device
pub struct HeadlessDevice {
    state: Rc<RefCell<State>>,
    families: Vec<u32>,
}

impl HeadlessDevice {
    fn create<T: Handle>(&self, kind: ObjectKind) -> VkResult<T> {
        self.state.borrow_mut().allocate(kind).map(T::from_raw)
    }

    fn destroy<T: Handle>(&self, kind: ObjectKind, handle: T) {
        self.state.borrow_mut().release(kind, handle.as_raw());
    }
}

impl GpuDevice for HeadlessDevice {
    type Memory = HeadlessMemory;

    fn queue(&self, family: u32) -> vk::Queue {
        if !self.families.contains(&family) {
            self.state
                .borrow_mut()
                .violation(format!("queue family {family} was not requested"));
        }
        vk::Queue::from_raw(0x1000 + u64::from(family))
    }

    fn wait_idle(&self) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::WaitIdle);
        state.complete_all();
        Ok(())
    }

    fn surface_support(&self) -> VkResult<SurfaceSupport> {
        Ok(self.state.borrow().surface.clone())
    }

    fn create_swapchain(
        &self,
        plan: &SwapchainPlan,
        old: vk::SwapchainKHR,
    ) -> VkResult<vk::SwapchainKHR> {
        let swapchain: vk::SwapchainKHR = self.create(ObjectKind::Swapchain)?;
        let mut state = self.state.borrow_mut();
        let mut images = Vec::new();
        for _ in 0..plan.image_count {
            let handle = state.next_handle;
            state.next_handle += 1;
            images.push(vk::Image::from_raw(handle));
        }
        state.swapchains.insert(
            swapchain.as_raw(),
            SwapchainState {
                image_count: plan.image_count,
                next_image: 0,
                images,
            },
        );
        state.calls.push(GpuCall::CreateSwapchain {
            swapchain,
            extent: plan.extent,
            image_count: plan.image_count,
            format: plan.format.format,
            present_mode: plan.present_mode,
            retired: old,
        });
        Ok(swapchain)
    }

    fn swapchain_images(&self, swapchain: vk::SwapchainKHR) -> VkResult<Vec<vk::Image>> {
        self.state
            .borrow()
            .swapchains
            .get(&swapchain.as_raw())
            .map(|s| s.images.clone())
            .ok_or(vk::Result::ERROR_UNKNOWN)
    }

    fn destroy_swapchain(&self, swapchain: vk::SwapchainKHR) {
        let mut state = self.state.borrow_mut();
        state.swapchains.remove(&swapchain.as_raw());
        state.calls.push(GpuCall::DestroySwapchain(swapchain));
        state.release(ObjectKind::Swapchain, swapchain.as_raw());
    }

    fn acquire_next_image(
        &self,
        swapchain: vk::SwapchainKHR,
        signal: vk::Semaphore,
        _timeout: u64,
    ) -> VkResult<(u32, bool)> {
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::Acquire { swapchain, signal });
        let scripted = state.acquire_script.pop_front();
        if scripted == Some(vk::Result::ERROR_OUT_OF_DATE_KHR) {
            return Err(vk::Result::ERROR_OUT_OF_DATE_KHR);
        }
        if let Some(result) = scripted.filter(|r| *r != vk::Result::SUBOPTIMAL_KHR && *r != vk::Result::SUCCESS) {
            return Err(result);
        }
        let chain = state
            .swapchains
            .get_mut(&swapchain.as_raw())
            .ok_or(vk::Result::ERROR_SURFACE_LOST_KHR)?;
        let index = chain.next_image;
        chain.next_image = (chain.next_image + 1) % chain.image_count.max(1);
        state.signal(signal.as_raw(), "acquire");
        Ok((index, scripted == Some(vk::Result::SUBOPTIMAL_KHR)))
    }

    fn queue_present(
        &self,
        _queue: vk::Queue,
        swapchain: vk::SwapchainKHR,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> VkResult<bool> {
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::Present {
            swapchain,
            image_index,
            wait,
        });
        state.consume(wait.as_raw());
        match state.present_script.pop_front() {
            None | Some(vk::Result::SUCCESS) => Ok(false),
            Some(vk::Result::SUBOPTIMAL_KHR) => Ok(true),
            Some(error) => Err(error),
        }
    }

    fn create_buffer(&self, desc: &BufferDesc) -> VkResult<(vk::Buffer, HeadlessMemory)> {
        let buffer: vk::Buffer = self.create(ObjectKind::Buffer)?;
        let mut state = self.state.borrow_mut();
        let len = usize::try_from(desc.size).map_err(|_| vk::Result::ERROR_OUT_OF_HOST_MEMORY)?;
        state.buffer_data.insert(buffer.as_raw(), vec![0; len]);
        state.calls.push(GpuCall::CreateBuffer {
            buffer,
            size: desc.size,
            location: desc.location,
        });
        Ok((
            buffer,
            HeadlessMemory {
                resource: buffer.as_raw(),
                size: desc.size,
                host_visible: desc.location == MemoryLocation::HostVisible,
            },
        ))
    }

    fn write_memory(&self, memory: &mut HeadlessMemory, offset: u64, data: &[u8]) -> VkResult<()> {
        if !memory.host_visible {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        if offset + data.len() as u64 > memory.size {
            return Err(vk::Result::ERROR_MEMORY_MAP_FAILED);
        }
        let mut state = self.state.borrow_mut();
        let target = state
            .buffer_data
            .get_mut(&memory.resource)
            .ok_or(vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        let start = usize::try_from(offset).map_err(|_| vk::Result::ERROR_MEMORY_MAP_FAILED)?;
        target[start..start + data.len()].copy_from_slice(data);
        Ok(())
    }

    fn destroy_buffer(&self, buffer: vk::Buffer, memory: HeadlessMemory) {
        let mut state = self.state.borrow_mut();
        if memory.resource != buffer.as_raw() {
            state.violation(format!("buffer {buffer:?} destroyed with foreign memory"));
        }
        if state.buffer_in_flight(buffer.as_raw()) {
            state.violation(format!("buffer {buffer:?} destroyed while the GPU may read it"));
        }
        state.buffer_data.remove(&buffer.as_raw());
        state.calls.push(GpuCall::DestroyBuffer(buffer));
        state.release(ObjectKind::Buffer, buffer.as_raw());
    }

    fn create_image(&self, desc: &ImageDesc) -> VkResult<(vk::Image, HeadlessMemory)> {
        let image: vk::Image = self.create(ObjectKind::Image)?;
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::CreateImage {
            image,
            extent: desc.extent,
            layers: desc.array_layers,
            format: desc.format,
        });
        Ok((
            image,
            HeadlessMemory {
                resource: image.as_raw(),
                size: u64::from(desc.extent.width)
                    * u64::from(desc.extent.height)
                    * u64::from(desc.array_layers),
                host_visible: false,
            },
        ))
    }

    fn destroy_image(&self, image: vk::Image, memory: HeadlessMemory) {
        let mut state = self.state.borrow_mut();
        if memory.resource != image.as_raw() {
            state.violation(format!("image {image:?} destroyed with foreign memory"));
        }
        state.calls.push(GpuCall::DestroyImage(image));
        state.release(ObjectKind::Image, image.as_raw());
    }

    fn create_image_view(&self, desc: &ImageViewDesc) -> VkResult<vk::ImageView> {
        let view: vk::ImageView = self.create(ObjectKind::ImageView)?;
        self.state.borrow_mut().calls.push(GpuCall::CreateImageView {
            view,
            view_type: desc.view_type,
            layer_count: desc.layer_count,
        });
        Ok(view)
    }

    fn destroy_image_view(&self, view: vk::ImageView) {
        self.destroy(ObjectKind::ImageView, view);
    }

    fn create_sampler(&self, _desc: &SamplerDesc) -> VkResult<vk::Sampler> {
        self.create(ObjectKind::Sampler)
    }

    fn destroy_sampler(&self, sampler: vk::Sampler) {
        self.destroy(ObjectKind::Sampler, sampler);
    }

    fn find_depth_format(&self) -> VkResult<vk::Format> {
        Ok(self.state.borrow().depth_format)
    }

    fn create_render_pass(
        &self,
        color_format: vk::Format,
        depth_format: vk::Format,
    ) -> VkResult<vk::RenderPass> {
        let pass = self.create(ObjectKind::RenderPass)?;
        self.state.borrow_mut().calls.push(GpuCall::CreateRenderPass {
            color_format,
            depth_format,
        });
        Ok(pass)
    }

    fn destroy_render_pass(&self, render_pass: vk::RenderPass) {
        self.destroy(ObjectKind::RenderPass, render_pass);
    }

    fn create_framebuffer(
        &self,
        _render_pass: vk::RenderPass,
        attachments: &[vk::ImageView],
        _extent: vk::Extent2D,
    ) -> VkResult<vk::Framebuffer> {
        if attachments.iter().any(|view| *view == vk::ImageView::null()) {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        let framebuffer: vk::Framebuffer = self.create(ObjectKind::Framebuffer)?;
        self.state.borrow_mut().calls.push(GpuCall::CreateFramebuffer(framebuffer));
        Ok(framebuffer)
    }

    fn destroy_framebuffer(&self, framebuffer: vk::Framebuffer) {
        self.destroy(ObjectKind::Framebuffer, framebuffer);
    }

    fn create_semaphore(&self) -> VkResult<vk::Semaphore> {
        self.create(ObjectKind::Semaphore)
    }

    fn destroy_semaphore(&self, semaphore: vk::Semaphore) {
        self.state.borrow_mut().consume(semaphore.as_raw());
        self.destroy(ObjectKind::Semaphore, semaphore);
    }

    fn create_fence(&self, signaled: bool) -> VkResult<vk::Fence> {
        let fence: vk::Fence = self.create(ObjectKind::Fence)?;
        self.state.borrow_mut().fences.insert(
            fence.as_raw(),
            FenceState {
                signaled,
                pending: false,
            },
        );
        Ok(fence)
    }

    fn destroy_fence(&self, fence: vk::Fence) {
        let mut state = self.state.borrow_mut();
        if state.fences.get(&fence.as_raw()).map_or(false, |f| f.pending) {
            state.violation(format!("fence {fence:?} destroyed with work pending"));
        }
        state.fences.remove(&fence.as_raw());
        state.release(ObjectKind::Fence, fence.as_raw());
    }

    fn wait_for_fence(&self, fence: vk::Fence, _timeout: u64) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::WaitFence(fence));
        let current = state.fences.get(&fence.as_raw()).copied().unwrap_or_default();
        if current.signaled {
            Ok(())
        } else if current.pending {
            state.complete_fence(fence.as_raw());
            Ok(())
        } else {
            // Nothing will ever signal this fence.
            Err(vk::Result::TIMEOUT)
        }
    }

    fn reset_fence(&self, fence: vk::Fence) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::ResetFence(fence));
        let current = state
            .fences
            .get(&fence.as_raw())
            .copied()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        if current.pending {
            state.violation(format!("fence {fence:?} reset while in use"));
        } else if let Some(f) = state.fences.get_mut(&fence.as_raw()) {
            f.signaled = false;
        }
        Ok(())
    }

    fn fence_signaled(&self, fence: vk::Fence) -> VkResult<bool> {
        Ok(self
            .state
            .borrow()
            .fences
            .get(&fence.as_raw())
            .map_or(false, |f| f.signaled))
    }

    fn create_command_pool(&self, family: u32, _transient: bool) -> VkResult<vk::CommandPool> {
        if !self.families.contains(&family) {
            return Err(vk::Result::ERROR_INITIALIZATION_FAILED);
        }
        self.create(ObjectKind::CommandPool)
    }

    fn destroy_command_pool(&self, pool: vk::CommandPool) {
        self.destroy(ObjectKind::CommandPool, pool);
    }

    fn allocate_command_buffer(&self, _pool: vk::CommandPool) -> VkResult<vk::CommandBuffer> {
        self.create(ObjectKind::CommandBuffer)
    }

    fn free_command_buffer(&self, _pool: vk::CommandPool, command_buffer: vk::CommandBuffer) {
        self.destroy(ObjectKind::CommandBuffer, command_buffer);
    }

    fn begin_command_buffer(
        &self,
        command_buffer: vk::CommandBuffer,
        _one_time: bool,
    ) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::BeginCommandBuffer(command_buffer));
        let raw = command_buffer.as_raw();
        let last = state.last_submission.get(&raw).copied();
        if let Some(index) = last {
            if !state.submissions[index].done {
                state.violation(format!(
                    "command buffer {command_buffer:?} re-recorded while in flight"
                ));
            }
        }
        state.recording.insert(raw, Vec::new());
        Ok(())
    }

    fn end_command_buffer(&self, command_buffer: vk::CommandBuffer) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::EndCommandBuffer(command_buffer));
        let commands = state
            .recording
            .remove(&command_buffer.as_raw())
            .ok_or(vk::Result::ERROR_UNKNOWN)?;
        state.recorded.insert(command_buffer.as_raw(), commands);
        Ok(())
    }

    fn record(&self, command_buffer: vk::CommandBuffer, command: &GpuCommand) {
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::Record {
            command_buffer,
            command: *command,
        });
        if let Some(commands) = state.recording.get_mut(&command_buffer.as_raw()) {
            commands.push(*command);
            return;
        }
        state.violation(format!(
            "command recorded into {command_buffer:?} outside begin/end"
        ));
    }

    fn submit(&self, queue: vk::Queue, submission: &Submission<'_>) -> VkResult<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::Submit {
            queue,
            command_buffer: submission.command_buffer,
            fence: submission.fence,
            waits: submission.waits.len(),
            signals: submission.signals.len(),
        });
        if let Some(result) = state.submit_script.pop_front() {
            return Err(result);
        }

        let raw = submission.command_buffer.as_raw();
        let commands = state
            .recorded
            .get(&raw)
            .cloned()
            .ok_or(vk::Result::ERROR_UNKNOWN)?;

        if let Some(fence) = submission.fence {
            let current = state
                .fences
                .get(&fence.as_raw())
                .copied()
                .ok_or(vk::Result::ERROR_UNKNOWN)?;
            if current.signaled || current.pending {
                state.violation(format!("fence {fence:?} submitted while signaled or in use"));
            }
        }

        let buffers = commands
            .iter()
            .flat_map(|command| match *command {
                GpuCommand::BindVertexBuffer { buffer, .. }
                | GpuCommand::BindIndexBuffer { buffer, .. } => vec![buffer.as_raw()],
                GpuCommand::CopyBuffer { src, dst, .. } => vec![src.as_raw(), dst.as_raw()],
                GpuCommand::CopyBufferToImage { src, .. } => vec![src.as_raw()],
                _ => Vec::new(),
            })
            .collect();

        state.execute_copies(&commands);
        for (wait, _) in submission.waits {
            state.consume(wait.as_raw());
        }
        for signal in submission.signals {
            state.signal(signal.as_raw(), "submit");
        }

        let index = state.submissions.len();
        state.submissions.push(PendingSubmission {
            fence: submission.fence.map(|f| f.as_raw()),
            waits: submission.waits.iter().map(|(s, _)| s.as_raw()).collect(),
            signals: submission.signals.iter().map(|s| s.as_raw()).collect(),
            buffers,
            done: false,
        });
        state.last_submission.insert(raw, index);

        if let Some(fence) = submission.fence {
            if let Some(f) = state.fences.get_mut(&fence.as_raw()) {
                f.pending = true;
            }
            if state.auto_complete {
                state.complete_fence(fence.as_raw());
            }
        }
        Ok(())
    }

    fn create_pipeline(&self, desc: &PipelineDesc<'_>) -> VkResult<PipelineHandles> {
        const SPIRV_MAGIC: u32 = 0x0723_0203;
        if desc.vertex_spirv.first() != Some(&SPIRV_MAGIC)
            || desc.fragment_spirv.first() != Some(&SPIRV_MAGIC)
        {
            return Err(vk::Result::ERROR_INVALID_SHADER_NV);
        }
        let pipeline: vk::Pipeline = self.create(ObjectKind::Pipeline)?;
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::CreatePipeline(pipeline));
        let layout = state.next_handle;
        let set_layout = state.next_handle + 1;
        state.next_handle += 2;
        Ok(PipelineHandles {
            pipeline,
            layout: vk::PipelineLayout::from_raw(layout),
            set_layout: vk::DescriptorSetLayout::from_raw(set_layout),
        })
    }

    fn destroy_pipeline(&self, handles: &PipelineHandles) {
        let mut state = self.state.borrow_mut();
        state.calls.push(GpuCall::DestroyPipeline(handles.pipeline));
        state.release(ObjectKind::Pipeline, handles.pipeline.as_raw());
    }

    fn create_material_set(
        &self,
        _set_layout: vk::DescriptorSetLayout,
        _view: vk::ImageView,
        _sampler: vk::Sampler,
    ) -> VkResult<MaterialSet> {
        let pool: vk::DescriptorPool = self.create(ObjectKind::MaterialSet)?;
        let mut state = self.state.borrow_mut();
        let set = state.next_handle;
        state.next_handle += 1;
        Ok(MaterialSet {
            pool,
            set: vk::DescriptorSet::from_raw(set),
        })
    }

    fn destroy_material_set(&self, material: &MaterialSet) {
        self.destroy(ObjectKind::MaterialSet, material.pool);
    }
}

/// Test handle for inspecting and steering the simulation
#[derive(Clone)]
pub struct HeadlessProbe {
    state: Rc<RefCell<State>>,
}

impl HeadlessProbe {
    /// Every call logged so far
    pub fn calls(&self) -> Vec<GpuCall> {
        self.state.borrow().calls.clone()
    }

    /// Forget logged calls
    pub fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    /// Number of logged calls matching `predicate`
    pub fn count(&self, predicate: impl Fn(&GpuCall) -> bool) -> usize {
        self.state.borrow().calls.iter().filter(|c| predicate(c)).count()
    }

    /// Live objects of one kind
    pub fn live(&self, kind: ObjectKind) -> usize {
        self.state.borrow().live.get(&kind).copied().unwrap_or(0)
    }

    /// Live objects of every kind
    pub fn live_total(&self) -> usize {
        self.state.borrow().live.values().sum()
    }

    /// Protocol violations observed so far
    pub fn violations(&self) -> Vec<String> {
        self.state.borrow().violations.clone()
    }

    /// Commands of the last finished recording of `command_buffer`
    pub fn recorded(&self, command_buffer: vk::CommandBuffer) -> Vec<GpuCommand> {
        self.state
            .borrow()
            .recorded
            .get(&command_buffer.as_raw())
            .cloned()
            .unwrap_or_default()
    }

    /// Bytes currently held by `buffer`
    pub fn buffer_contents(&self, buffer: vk::Buffer) -> Option<Vec<u8>> {
        self.state.borrow().buffer_data.get(&buffer.as_raw()).cloned()
    }

    /// Report a new fixed surface extent
    pub fn set_surface_extent(&self, width: u32, height: u32) {
        self.state.borrow_mut().surface.capabilities.current_extent =
            vk::Extent2D { width, height };
    }

    /// Replace the surface capabilities
    pub fn set_surface(&self, surface: SurfaceSupport) {
        self.state.borrow_mut().surface = surface;
    }

    /// Change the depth format reported by the device
    pub fn set_depth_format(&self, format: vk::Format) {
        self.state.borrow_mut().depth_format = format;
    }

    /// Queue the result of a future acquire
    pub fn push_acquire_result(&self, result: vk::Result) {
        self.state.borrow_mut().acquire_script.push_back(result);
    }

    /// Queue the result of a future present
    pub fn push_present_result(&self, result: vk::Result) {
        self.state.borrow_mut().present_script.push_back(result);
    }

    /// Fail the next queue submission with `result`
    pub fn fail_next_submit(&self, result: vk::Result) {
        self.state.borrow_mut().submit_script.push_back(result);
    }

    /// Make the next creation of `kind` fail with `result`
    pub fn fail_next(&self, kind: ObjectKind, result: vk::Result) {
        self.state.borrow_mut().failures.insert(kind, result);
    }

    /// Choose whether submitted fences signal immediately
    pub fn set_auto_complete(&self, enabled: bool) {
        self.state.borrow_mut().auto_complete = enabled;
    }

    /// Finish all submitted work
    pub fn complete_pending(&self) {
        self.state.borrow_mut().complete_all();
    }

    /// Whether `semaphore` has a signal nothing has waited on yet
    pub fn signal_pending(&self, semaphore: vk::Semaphore) -> bool {
        self.state.borrow().pending_signals.contains(&semaphore.as_raw())
    }

    /// Whether `fence` is signaled
    pub fn fence_signaled(&self, fence: vk::Fence) -> bool {
        self.state
            .borrow()
            .fences
            .get(&fence.as_raw())
            .map_or(false, |f| f.signaled)
    }
}

#[derive(Debug)]
struct WindowState {
    size: (u32, u32),
    close_requested: bool,
    inputs: VecDeque<InputState>,
    polls: u64,
}

/// Scripted window for headless runs
pub struct HeadlessWindow {
    state: Rc<RefCell<WindowState>>,
}

/// Handle for changing a [`HeadlessWindow`] after the engine took ownership
#[derive(Clone)]
pub struct HeadlessWindowHandle {
    state: Rc<RefCell<WindowState>>,
}

impl HeadlessWindow {
    /// Window with a drawable area of `width` x `height`
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            state: Rc::new(RefCell::new(WindowState {
                size: (width, height),
                close_requested: false,
                inputs: VecDeque::new(),
                polls: 0,
            })),
        }
    }

    /// Shared handle to the window state
    pub fn handle(&self) -> HeadlessWindowHandle {
        HeadlessWindowHandle {
            state: Rc::clone(&self.state),
        }
    }
}

impl HeadlessWindowHandle {
    /// Resize the drawable area
    pub fn set_size(&self, width: u32, height: u32) {
        self.state.borrow_mut().size = (width, height);
    }

    /// Ask the window to close
    pub fn request_close(&self) {
        self.state.borrow_mut().close_requested = true;
    }

    /// Queue input returned by a future poll
    pub fn push_input(&self, input: InputState) {
        self.state.borrow_mut().inputs.push_back(input);
    }

    /// Number of event polls so far
    pub fn polls(&self) -> u64 {
        self.state.borrow().polls
    }
}

impl WindowSurface for HeadlessWindow {
    fn drawable_size(&self) -> (u32, u32) {
        self.state.borrow().size
    }

    fn poll_input(&mut self) -> InputState {
        let mut state = self.state.borrow_mut();
        state.polls += 1;
        state.inputs.pop_front().unwrap_or_default()
    }

    fn should_close(&self) -> bool {
        self.state.borrow().close_requested
    }
}
