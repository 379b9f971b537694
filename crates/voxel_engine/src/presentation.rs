//! Presentation chain: presentable images, their views, depth buffer and framebuffers
//!
//! The chain moves through `Uninitialized -> Ready -> OutOfDate -> Ready -> ...
//! -> Destroyed`. It only becomes `OutOfDate` when the surface reports it
//! (acquire or present) and only leaves that state through
//! [`PresentationChain::handle_resize`], which waits for the device to go idle
//! before tearing anything down. The previous chain object is handed to the
//! driver as `old_swapchain` and destroyed after its replacement exists.
//!
//! The render pass survives recreation unless the surface format changes.

use ash::vk;

use crate::backend::{GpuDevice, ImageDesc, ImageViewDesc, SurfaceSupport, SwapchainPlan};
use crate::device::DeviceContext;
use crate::error::{api, creation, RenderError, RenderResult, ResourceMisuse};

/// Preferred surface format: 8-bit BGRA with sRGB encoding
pub const PREFERRED_FORMAT: vk::SurfaceFormatKHR = vk::SurfaceFormatKHR {
    format: vk::Format::B8G8R8A8_SRGB,
    color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
};

/// Pick the preferred format if offered, else the first one
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| f.format == PREFERRED_FORMAT.format && f.color_space == PREFERRED_FORMAT.color_space)
        .or_else(|| formats.first().copied())
}

/// Dedicated GPUs always use FIFO; others prefer mailbox, then immediate
pub fn choose_present_mode(modes: &[vk::PresentModeKHR], dedicated: bool) -> vk::PresentModeKHR {
    if dedicated {
        return vk::PresentModeKHR::FIFO;
    }
    [vk::PresentModeKHR::MAILBOX, vk::PresentModeKHR::IMMEDIATE]
        .into_iter()
        .find(|mode| modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// Use the surface's fixed extent if it reports one, else clamp `desired`
pub fn choose_extent(capabilities: &vk::SurfaceCapabilitiesKHR, desired: vk::Extent2D) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        return capabilities.current_extent;
    }
    vk::Extent2D {
        width: desired.width.clamp(
            capabilities.min_image_extent.width,
            capabilities.max_image_extent.width,
        ),
        height: desired.height.clamp(
            capabilities.min_image_extent.height,
            capabilities.max_image_extent.height,
        ),
    }
}

/// One image more than the minimum, capped by the maximum (0 means no maximum)
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = capabilities.min_image_count + 1;
    if capabilities.max_image_count > 0 {
        count.min(capabilities.max_image_count)
    } else {
        count
    }
}

/// A surface with at least one format and one present mode
pub fn is_usable(support: &SurfaceSupport) -> bool {
    !support.formats.is_empty() && !support.present_modes.is_empty()
}

/// Zero-area extents cannot back a chain
pub fn is_renderable(extent: vk::Extent2D) -> bool {
    extent.width > 0 && extent.height > 0
}

/// Lifecycle state of a [`PresentationChain`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainState {
    /// Nothing created yet
    Uninitialized,
    /// Images can be acquired
    Ready,
    /// The surface changed; rebuild before acquiring
    OutOfDate,
    /// Torn down for good
    Destroyed,
}

impl ChainState {
    fn name(self) -> &'static str {
        match self {
            Self::Uninitialized => "uninitialized",
            Self::Ready => "ready",
            Self::OutOfDate => "out of date",
            Self::Destroyed => "destroyed",
        }
    }
}

/// Result of an acquire attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acquired {
    /// Image ready to render into
    Image(u32),
    /// The chain must be rebuilt first. `signal_pending` is true when the
    /// acquire semaphore was still handed to the driver and will be signaled.
    Stale {
        /// The acquire semaphore has a pending signal
        signal_pending: bool,
    },
}

/// What a rebuild changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Rebuild {
    /// The surface is zero-sized; nothing was touched
    Skipped,
    /// The chain was rebuilt with the same render pass
    Recreated,
    /// The surface format changed and the render pass was replaced
    RenderPassChanged,
}

struct DepthBuffer<M> {
    image: vk::Image,
    memory: M,
    view: vk::ImageView,
}

/// Presentable images plus the attachments each frame renders into
pub struct PresentationChain<D: GpuDevice> {
    state: ChainState,
    swapchain: vk::SwapchainKHR,
    format: vk::SurfaceFormatKHR,
    present_mode: vk::PresentModeKHR,
    extent: vk::Extent2D,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    depth_format: vk::Format,
    depth: Option<DepthBuffer<D::Memory>>,
    render_pass: vk::RenderPass,
    framebuffers: Vec<vk::Framebuffer>,
    generation: u64,
}

impl<D: GpuDevice> Default for PresentationChain<D> {
    fn default() -> Self {
        Self::new()
    }
}

impl<D: GpuDevice> PresentationChain<D> {
    /// Chain with nothing created yet
    pub fn new() -> Self {
        Self {
            state: ChainState::Uninitialized,
            swapchain: vk::SwapchainKHR::null(),
            format: vk::SurfaceFormatKHR::default(),
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            images: Vec::new(),
            views: Vec::new(),
            depth_format: vk::Format::UNDEFINED,
            depth: None,
            render_pass: vk::RenderPass::null(),
            framebuffers: Vec::new(),
            generation: 0,
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ChainState {
        self.state
    }

    /// Whether images can be acquired right now
    pub fn is_ready(&self) -> bool {
        self.state == ChainState::Ready
    }

    /// Force a rebuild on the next tick, dropping any image acquired but not presented
    pub fn mark_out_of_date(&mut self) {
        if self.state == ChainState::Ready {
            self.state = ChainState::OutOfDate;
        }
    }

    /// Image size
    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Width over height, 1.0 for degenerate extents
    pub fn aspect_ratio(&self) -> f32 {
        if is_renderable(self.extent) {
            self.extent.width as f32 / self.extent.height as f32
        } else {
            1.0
        }
    }

    /// Surface format in use
    pub fn format(&self) -> vk::SurfaceFormatKHR {
        self.format
    }

    /// Present mode in use
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        self.present_mode
    }

    /// Number of presentable images
    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    /// Depth attachment format
    pub fn depth_format(&self) -> vk::Format {
        self.depth_format
    }

    /// Render pass compatible with every framebuffer
    pub fn render_pass(&self) -> vk::RenderPass {
        self.render_pass
    }

    /// Number of chains built so far
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Framebuffer for an acquired image
    pub fn framebuffer(&self, image_index: u32) -> RenderResult<vk::Framebuffer> {
        self.framebuffers
            .get(image_index as usize)
            .copied()
            .ok_or_else(|| self.not_ready())
    }

    fn not_ready(&self) -> RenderError {
        ResourceMisuse::ChainNotReady {
            state: self.state.name(),
        }
        .into()
    }

    /// Build the first chain for `desired`
    pub fn create(&mut self, ctx: &DeviceContext<D>, desired: vk::Extent2D) -> RenderResult<Rebuild> {
        if self.state != ChainState::Uninitialized {
            return Err(self.not_ready());
        }
        self.rebuild(ctx, desired)
    }

    /// Rebuild the chain for `desired`, creating it if needed.
    ///
    /// Returns [`Rebuild::Skipped`] when the surface is zero-sized; the chain
    /// keeps its state and nothing is destroyed.
    pub fn handle_resize(
        &mut self,
        ctx: &DeviceContext<D>,
        desired: vk::Extent2D,
    ) -> RenderResult<Rebuild> {
        if self.state == ChainState::Destroyed {
            return Err(self.not_ready());
        }
        self.rebuild(ctx, desired)
    }

    fn rebuild(&mut self, ctx: &DeviceContext<D>, desired: vk::Extent2D) -> RenderResult<Rebuild> {
        let device = ctx.device();
        let support = device.surface_support().map_err(api("surface query"))?;
        let extent = choose_extent(&support.capabilities, desired);
        if !is_renderable(extent) {
            log::debug!("Surface is {}x{}, not rebuilding", extent.width, extent.height);
            return Ok(Rebuild::Skipped);
        }
        let format = choose_surface_format(&support.formats).ok_or_else(|| {
            RenderError::DeviceSelection {
                reason: "surface reports no formats".to_string(),
            }
        })?;

        ctx.wait_idle()?;
        self.destroy_attachments(device);

        self.depth_format = device.find_depth_format().map_err(creation("depth format"))?;
        let mut outcome = Rebuild::Recreated;
        if self.render_pass == vk::RenderPass::null() || format.format != self.format.format {
            if self.render_pass != vk::RenderPass::null() {
                log::info!("Surface format changed to {:?}", format.format);
                device.destroy_render_pass(self.render_pass);
                self.render_pass = vk::RenderPass::null();
                outcome = Rebuild::RenderPassChanged;
            }
            self.render_pass = device
                .create_render_pass(format.format, self.depth_format)
                .map_err(creation("render pass"))?;
        }

        let families = ctx.families();
        let plan = SwapchainPlan {
            format,
            present_mode: choose_present_mode(&support.present_modes, ctx.is_dedicated()),
            extent,
            image_count: choose_image_count(&support.capabilities),
            pre_transform: support.capabilities.current_transform,
            graphics_family: families.graphics,
            present_family: families.present,
        };

        let old = self.swapchain;
        let swapchain = match device.create_swapchain(&plan, old) {
            Ok(swapchain) => swapchain,
            Err(error) => {
                self.state = ChainState::OutOfDate;
                return Err(creation("presentation chain")(error));
            }
        };
        self.swapchain = swapchain;
        self.format = format;
        self.present_mode = plan.present_mode;
        self.extent = extent;
        // Any failure below leaves a chain without attachments: keep it out of date
        self.state = ChainState::OutOfDate;

        let attached = match device.swapchain_images(swapchain) {
            Ok(images) => {
                self.images = images;
                self.create_attachments(device)
            }
            Err(error) => Err(api("presentation image query")(error)),
        };
        // The retired chain goes only once its replacement is complete or has failed
        if old != vk::SwapchainKHR::null() {
            device.destroy_swapchain(old);
        }
        attached?;

        self.state = ChainState::Ready;
        self.generation += 1;
        log::info!(
            "Presentation chain {} ready: {}x{}, {} images, {:?}, {:?}",
            self.generation,
            extent.width,
            extent.height,
            self.images.len(),
            format.format,
            plan.present_mode
        );
        Ok(outcome)
    }

    fn create_attachments(&mut self, device: &D) -> RenderResult<()> {
        for &image in &self.images {
            let view = device
                .create_image_view(&ImageViewDesc {
                    image,
                    format: self.format.format,
                    aspect: vk::ImageAspectFlags::COLOR,
                    view_type: vk::ImageViewType::TYPE_2D,
                    layer_count: 1,
                })
                .map_err(creation("presentation image view"))?;
            self.views.push(view);
        }

        let (image, memory) = device
            .create_image(&ImageDesc {
                extent: self.extent,
                format: self.depth_format,
                usage: vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
                array_layers: 1,
            })
            .map_err(creation("depth image"))?;
        let view = match device.create_image_view(&ImageViewDesc {
            image,
            format: self.depth_format,
            aspect: vk::ImageAspectFlags::DEPTH,
            view_type: vk::ImageViewType::TYPE_2D,
            layer_count: 1,
        }) {
            Ok(view) => view,
            Err(error) => {
                device.destroy_image(image, memory);
                return Err(creation("depth image view")(error));
            }
        };
        self.depth = Some(DepthBuffer { image, memory, view });

        for &color in &self.views {
            let framebuffer = device
                .create_framebuffer(self.render_pass, &[color, view], self.extent)
                .map_err(creation("framebuffer"))?;
            self.framebuffers.push(framebuffer);
        }
        Ok(())
    }

    fn destroy_attachments(&mut self, device: &D) {
        for framebuffer in self.framebuffers.drain(..) {
            device.destroy_framebuffer(framebuffer);
        }
        for view in self.views.drain(..) {
            device.destroy_image_view(view);
        }
        if let Some(depth) = self.depth.take() {
            device.destroy_image_view(depth.view);
            device.destroy_image(depth.image, depth.memory);
        }
        self.images.clear();
    }

    /// Acquire the next image, signaling `signal` when it is ready
    pub fn acquire(
        &mut self,
        ctx: &DeviceContext<D>,
        signal: vk::Semaphore,
        timeout: u64,
    ) -> RenderResult<Acquired> {
        if self.state != ChainState::Ready {
            return Err(self.not_ready());
        }
        match ctx.device().acquire_next_image(self.swapchain, signal, timeout) {
            Ok((index, false)) => Ok(Acquired::Image(index)),
            Ok((_, true)) => {
                log::debug!("Acquire reported a suboptimal chain");
                self.state = ChainState::OutOfDate;
                Ok(Acquired::Stale { signal_pending: true })
            }
            Err(result) => match RenderError::from_vk("image acquire", result) {
                RenderError::StaleSurface => {
                    log::debug!("Acquire reported an out-of-date chain");
                    self.state = ChainState::OutOfDate;
                    Ok(Acquired::Stale { signal_pending: false })
                }
                error => Err(error),
            },
        }
    }

    /// Queue `image_index` for display once `wait` signals.
    ///
    /// A stale surface marks the chain out of date instead of failing.
    pub fn present(
        &mut self,
        ctx: &DeviceContext<D>,
        image_index: u32,
        wait: vk::Semaphore,
    ) -> RenderResult<()> {
        if self.state != ChainState::Ready {
            return Err(self.not_ready());
        }
        match ctx
            .device()
            .queue_present(ctx.present_queue(), self.swapchain, image_index, wait)
        {
            Ok(false) => Ok(()),
            Ok(true) => {
                self.state = ChainState::OutOfDate;
                Ok(())
            }
            Err(result) => match RenderError::from_vk("present", result) {
                RenderError::StaleSurface => {
                    self.state = ChainState::OutOfDate;
                    Ok(())
                }
                error => Err(error),
            },
        }
    }

    /// Destroy every object. The caller has waited for the device to go idle.
    pub fn destroy(&mut self, ctx: &DeviceContext<D>) {
        if self.state == ChainState::Destroyed {
            return;
        }
        let device = ctx.device();
        self.destroy_attachments(device);
        if self.swapchain != vk::SwapchainKHR::null() {
            device.destroy_swapchain(self.swapchain);
            self.swapchain = vk::SwapchainKHR::null();
        }
        if self.render_pass != vk::RenderPass::null() {
            device.destroy_render_pass(self.render_pass);
            self.render_pass = vk::RenderPass::null();
        }
        self.state = ChainState::Destroyed;
        log::debug!("Presentation chain destroyed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::headless::{
        default_surface, GpuCall, HeadlessAdapter, HeadlessDevice, HeadlessInstance, HeadlessProbe,
        ObjectKind,
    };
    use crate::device::DeviceRequirements;

    const EXTENT: vk::Extent2D = vk::Extent2D {
        width: 800,
        height: 600,
    };

    fn setup(adapter: HeadlessAdapter) -> (HeadlessProbe, DeviceContext<HeadlessDevice>) {
        let instance = HeadlessInstance::new(vec![adapter.build()]);
        let probe = instance.probe();
        let ctx = DeviceContext::select(&instance, &DeviceRequirements::default()).unwrap();
        (probe, ctx)
    }

    fn capabilities(min: u32, max: u32) -> vk::SurfaceCapabilitiesKHR {
        vk::SurfaceCapabilitiesKHR {
            min_image_count: min,
            max_image_count: max,
            ..Default::default()
        }
    }

    #[test]
    fn test_format_prefers_srgb_bgra() {
        let unorm = vk::SurfaceFormatKHR {
            format: vk::Format::B8G8R8A8_UNORM,
            color_space: vk::ColorSpaceKHR::SRGB_NONLINEAR,
        };
        assert_eq!(
            choose_surface_format(&[unorm, PREFERRED_FORMAT]),
            Some(PREFERRED_FORMAT)
        );
        assert_eq!(choose_surface_format(&[unorm]), Some(unorm));
        assert_eq!(choose_surface_format(&[]), None);
    }

    #[test]
    fn test_present_mode_policy() {
        let all = [
            vk::PresentModeKHR::FIFO,
            vk::PresentModeKHR::IMMEDIATE,
            vk::PresentModeKHR::MAILBOX,
        ];
        assert_eq!(choose_present_mode(&all, true), vk::PresentModeKHR::FIFO);
        assert_eq!(choose_present_mode(&all, false), vk::PresentModeKHR::MAILBOX);
        assert_eq!(
            choose_present_mode(&all[..2], false),
            vk::PresentModeKHR::IMMEDIATE
        );
        assert_eq!(
            choose_present_mode(&[vk::PresentModeKHR::FIFO], false),
            vk::PresentModeKHR::FIFO
        );
    }

    #[test]
    fn test_extent_clamped_unless_fixed() {
        let mut caps = vk::SurfaceCapabilitiesKHR {
            current_extent: vk::Extent2D {
                width: u32::MAX,
                height: u32::MAX,
            },
            min_image_extent: vk::Extent2D { width: 1, height: 1 },
            max_image_extent: vk::Extent2D {
                width: 1024,
                height: 1024,
            },
            ..Default::default()
        };
        let desired = vk::Extent2D {
            width: 4000,
            height: 300,
        };
        assert_eq!(
            choose_extent(&caps, desired),
            vk::Extent2D {
                width: 1024,
                height: 300
            }
        );

        caps.current_extent = EXTENT;
        assert_eq!(choose_extent(&caps, desired), EXTENT);
    }

    #[test]
    fn test_image_count() {
        assert_eq!(choose_image_count(&capabilities(2, 8)), 3);
        assert_eq!(choose_image_count(&capabilities(2, 2)), 2);
        assert_eq!(choose_image_count(&capabilities(3, 0)), 4);
    }

    #[test]
    fn test_usable_and_renderable() {
        assert!(is_usable(&default_surface()));
        let mut surface = default_surface();
        surface.present_modes.clear();
        assert!(!is_usable(&surface));

        assert!(is_renderable(EXTENT));
        assert!(!is_renderable(vk::Extent2D { width: 0, height: 600 }));
        assert!(!is_renderable(vk::Extent2D { width: 800, height: 0 }));
    }

    #[test]
    fn test_create_builds_attachments() {
        let (probe, ctx) = setup(HeadlessAdapter::discrete("gpu"));
        let mut chain = PresentationChain::new();
        assert_eq!(chain.create(&ctx, EXTENT).unwrap(), Rebuild::Recreated);

        assert_eq!(chain.state(), ChainState::Ready);
        assert_eq!(chain.image_count(), 3);
        assert_eq!(chain.format(), PREFERRED_FORMAT);
        assert_eq!(chain.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(probe.live(ObjectKind::Framebuffer), 3);
        // color views plus the depth view
        assert_eq!(probe.live(ObjectKind::ImageView), 4);
        assert_eq!(probe.live(ObjectKind::Image), 1);
        assert!(chain.create(&ctx, EXTENT).is_err());
    }

    #[test]
    fn test_resize_is_idempotent() {
        let (probe, ctx) = setup(HeadlessAdapter::integrated("igpu"));
        let mut chain = PresentationChain::new();
        chain.create(&ctx, EXTENT).unwrap();
        assert_eq!(chain.present_mode(), vk::PresentModeKHR::MAILBOX);
        let first = chain.swapchain;

        chain.handle_resize(&ctx, EXTENT).unwrap();
        let (count, format) = (chain.image_count(), chain.format());
        chain.handle_resize(&ctx, EXTENT).unwrap();

        assert_eq!(chain.image_count(), count);
        assert_eq!(chain.format(), format);
        assert_eq!(chain.generation(), 3);
        assert_eq!(probe.live(ObjectKind::Swapchain), 1);
        assert_eq!(probe.live(ObjectKind::RenderPass), 1);
        assert_eq!(probe.live(ObjectKind::Framebuffer), count);
        assert!(probe.calls().iter().any(|call| matches!(
            call,
            GpuCall::CreateSwapchain { retired, .. } if *retired == first
        )));
        assert!(probe.violations().is_empty());
    }

    #[test]
    fn test_resize_waits_idle_and_retires_old_chain_last() {
        let (probe, ctx) = setup(HeadlessAdapter::discrete("gpu"));
        let mut chain = PresentationChain::new();
        chain.create(&ctx, EXTENT).unwrap();
        let old = chain.swapchain;
        probe.clear_calls();

        probe.set_surface_extent(1024, 768);
        chain.handle_resize(&ctx, EXTENT).unwrap();
        assert_eq!(chain.extent(), vk::Extent2D { width: 1024, height: 768 });

        let calls = probe.calls();
        assert!(matches!(calls.first(), Some(GpuCall::WaitIdle)));
        let created = calls
            .iter()
            .position(|c| matches!(c, GpuCall::CreateSwapchain { .. }))
            .unwrap();
        let destroyed = calls
            .iter()
            .position(|c| matches!(c, GpuCall::DestroySwapchain(s) if *s == old))
            .unwrap();
        let last_attachment = calls
            .iter()
            .rposition(|c| {
                matches!(
                    c,
                    GpuCall::CreateImage { .. }
                        | GpuCall::CreateImageView { .. }
                        | GpuCall::CreateFramebuffer(_)
                )
            })
            .unwrap();
        assert!(created < destroyed);
        assert!(last_attachment < destroyed);
        assert_eq!(
            calls.iter().filter(|c| matches!(c, GpuCall::CreateFramebuffer(_))).count(),
            chain.image_count()
        );
    }

    #[test]
    fn test_zero_sized_resize_touches_nothing() {
        let (probe, ctx) = setup(HeadlessAdapter::discrete("gpu"));
        let mut chain = PresentationChain::new();
        chain.create(&ctx, EXTENT).unwrap();
        probe.clear_calls();

        probe.set_surface_extent(0, 600);
        assert_eq!(chain.handle_resize(&ctx, EXTENT).unwrap(), Rebuild::Skipped);
        assert!(probe.calls().is_empty());
        assert_eq!(chain.state(), ChainState::Ready);
    }

    #[test]
    fn test_format_change_replaces_render_pass() {
        let (probe, ctx) = setup(HeadlessAdapter::discrete("gpu"));
        let mut chain = PresentationChain::new();
        chain.create(&ctx, EXTENT).unwrap();
        let pass = chain.render_pass();

        let mut surface = default_surface();
        surface.formats.retain(|f| f.format == vk::Format::B8G8R8A8_UNORM);
        probe.set_surface(surface);

        assert_eq!(
            chain.handle_resize(&ctx, EXTENT).unwrap(),
            Rebuild::RenderPassChanged
        );
        assert_ne!(chain.render_pass(), pass);
        assert_eq!(chain.format().format, vk::Format::B8G8R8A8_UNORM);
        assert_eq!(probe.live(ObjectKind::RenderPass), 1);
    }

    #[test]
    fn test_stale_acquire_marks_out_of_date() {
        let (probe, ctx) = setup(HeadlessAdapter::discrete("gpu"));
        let mut chain = PresentationChain::new();
        chain.create(&ctx, EXTENT).unwrap();
        let signal = ctx.device().create_semaphore().unwrap();

        probe.push_acquire_result(vk::Result::ERROR_OUT_OF_DATE_KHR);
        assert_eq!(
            chain.acquire(&ctx, signal, u64::MAX).unwrap(),
            Acquired::Stale { signal_pending: false }
        );
        assert_eq!(chain.state(), ChainState::OutOfDate);
        assert!(chain.acquire(&ctx, signal, u64::MAX).is_err());

        chain.handle_resize(&ctx, EXTENT).unwrap();
        probe.push_acquire_result(vk::Result::SUBOPTIMAL_KHR);
        assert_eq!(
            chain.acquire(&ctx, signal, u64::MAX).unwrap(),
            Acquired::Stale { signal_pending: true }
        );
    }

    #[test]
    fn test_stale_present_marks_out_of_date() {
        let (probe, ctx) = setup(HeadlessAdapter::discrete("gpu"));
        let mut chain = PresentationChain::new();
        chain.create(&ctx, EXTENT).unwrap();
        let signal = ctx.device().create_semaphore().unwrap();

        probe.push_present_result(vk::Result::ERROR_OUT_OF_DATE_KHR);
        chain.present(&ctx, 0, signal).unwrap();
        assert_eq!(chain.state(), ChainState::OutOfDate);
    }

    #[test]
    fn test_destroy_releases_everything() {
        let (probe, ctx) = setup(HeadlessAdapter::discrete("gpu"));
        let mut chain = PresentationChain::new();
        chain.create(&ctx, EXTENT).unwrap();
        chain.destroy(&ctx);
        chain.destroy(&ctx);

        assert_eq!(chain.state(), ChainState::Destroyed);
        for kind in [
            ObjectKind::Swapchain,
            ObjectKind::ImageView,
            ObjectKind::Image,
            ObjectKind::Framebuffer,
            ObjectKind::RenderPass,
        ] {
            assert_eq!(probe.live(kind), 0, "{kind:?}");
        }
        assert!(chain.handle_resize(&ctx, EXTENT).is_err());
    }
}
