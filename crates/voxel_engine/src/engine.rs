//! Render engine: owns the GPU objects and drives one frame per tick
//!
//! A tick runs the frame clock, pumps window input, calls the application's
//! update hook, drains finished uploads and then, when a scene is loaded and
//! the window has area:
//!
//! 1. waits for the current frame slot's fence,
//! 2. acquires a presentable image (a stale chain is rebuilt and the tick ends),
//! 3. resets the fence and records shaders, then materials, then meshes,
//! 4. submits waiting on image-acquired and signaling render-finished,
//! 5. presents and advances to the next slot.
//!
//! Stale surfaces never leave [`RenderEngine::run_tick`]; every other error does.

use ash::vk;

use crate::backend::{GpuDevice, GpuInstance};
use crate::clock::FrameClock;
use crate::config::{MissingMeshPolicy, RendererConfig};
use crate::device::{DeviceContext, DeviceRequirements};
use crate::error::{RenderError, RenderResult, ResourceMisuse};
use crate::frame::FrameRing;
use crate::memory::{AllocatorStats, MemoryAllocator};
use crate::presentation::{is_renderable, Acquired, ChainState, PresentationChain, Rebuild};
use crate::scene::{InputState, Scene};
use crate::shader::{Material, ShaderPipeline};
use crate::texture::{FileDecoder, ImageDecoder};
use crate::window::WindowSurface;

/// Hooks the engine calls once per tick
pub trait Application {
    /// Advance game state. `scene` is `None` until a scene is loaded.
    fn update(&mut self, _scene: Option<&mut Scene>, _input: &InputState, _delta_seconds: f32) {}

    /// Stop the run loop after the current tick
    fn should_exit(&self) -> bool {
        false
    }
}

impl Application for () {}

/// Why a tick drew nothing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// No scene is loaded
    NoScene,
    /// The window or surface has zero area
    ZeroSized,
    /// The presentation chain was stale and got rebuilt
    SurfaceRecreated,
}

/// Result of one tick
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickOutcome {
    /// A frame was submitted and queued for presentation
    Presented {
        /// Presentable image used
        image_index: u32,
        /// Frame slot used
        slot: usize,
    },
    /// Nothing was drawn
    Skipped(SkipReason),
    /// The window or application asked to stop
    Closing,
}

struct GroupResources {
    pipeline: ShaderPipeline,
    materials: Vec<Material>,
}

struct LoadedScene {
    scene: Scene,
    resources: Option<Vec<GroupResources>>,
}

struct Runtime<D: GpuDevice> {
    ctx: DeviceContext<D>,
    allocator: MemoryAllocator<D>,
    chain: PresentationChain<D>,
    frames: FrameRing,
    scene: Option<LoadedScene>,
}

/// Owns the device, allocator, presentation chain and frame slots
pub struct RenderEngine<I: GpuInstance, W: WindowSurface> {
    // Declared before `instance` so the device drops first
    runtime: Option<Runtime<I::Device>>,
    instance: I,
    window: W,
    config: RendererConfig,
    requirements: DeviceRequirements,
    decoder: Box<dyn ImageDecoder>,
    clock: FrameClock,
}

fn extent_of(size: (u32, u32)) -> vk::Extent2D {
    vk::Extent2D {
        width: size.0,
        height: size.1,
    }
}

impl<I: GpuInstance, W: WindowSurface> RenderEngine<I, W> {
    /// Engine for `window` on `instance`; no GPU work happens until [`initialize`](Self::initialize)
    pub fn new(instance: I, window: W, config: RendererConfig) -> Self {
        Self {
            runtime: None,
            instance,
            window,
            config,
            requirements: DeviceRequirements::default(),
            decoder: Box::new(FileDecoder),
            clock: FrameClock::new(),
        }
    }

    /// Use `decoder` for material textures
    #[must_use]
    pub fn with_decoder(mut self, decoder: impl ImageDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    /// Replace the adapter requirements used by [`initialize`](Self::initialize)
    #[must_use]
    pub fn with_requirements(mut self, requirements: DeviceRequirements) -> Self {
        self.requirements = requirements;
        self
    }

    /// Select the device and create the allocator, frame slots and presentation chain
    pub fn initialize(&mut self) -> RenderResult<()> {
        if self.runtime.is_some() {
            return Ok(());
        }
        self.config.validate()?;

        let ctx = DeviceContext::select(&self.instance, &self.requirements)?;
        let fence_timeout = self.config.fence_timeout_ns();
        let allocator = MemoryAllocator::new(&ctx, self.config.max_pending_uploads, fence_timeout)?;
        let mut frames = match FrameRing::new(&ctx, self.config.frames_in_flight, fence_timeout) {
            Ok(frames) => frames,
            Err(error) => {
                allocator.destroy_all(&ctx)?;
                return Err(error);
            }
        };

        let mut chain = PresentationChain::new();
        let extent = extent_of(self.window.drawable_size());
        if is_renderable(extent) {
            if let Err(error) = chain.create(&ctx, extent) {
                ctx.wait_idle()?;
                chain.destroy(&ctx);
                frames.destroy(&ctx);
                allocator.destroy_all(&ctx)?;
                return Err(error);
            }
        } else {
            log::info!("Window has no area yet; presentation chain deferred");
        }

        log::info!(
            "Render engine initialized with {} frames in flight",
            frames.len()
        );
        self.runtime = Some(Runtime {
            ctx,
            allocator,
            chain,
            frames,
            scene: None,
        });
        Ok(())
    }

    /// Upload every mesh of `scene` and build its shaders and materials.
    ///
    /// A previously loaded scene is unloaded first.
    pub fn load_scene(&mut self, scene: Scene) -> RenderResult<()> {
        self.unload_scene()?;
        let max_anisotropy = self.config.max_anisotropy;
        let decoder = &*self.decoder;
        let runtime = self.runtime.as_mut().ok_or(ResourceMisuse::ChainNotReady {
            state: "uninitialized",
        })?;

        let mut loaded = LoadedScene {
            scene,
            resources: None,
        };
        let mut result = upload_meshes(runtime, &mut loaded);
        // Without a render pass the pipelines wait for the first chain
        if result.is_ok() && runtime.chain.render_pass() != vk::RenderPass::null() {
            result = build_resources(runtime, decoder, &loaded.scene, max_anisotropy)
                .map(|resources| loaded.resources = Some(resources));
        }

        if let Err(error) = result {
            log::error!("Scene load failed: {}", error);
            release_scene(runtime, loaded)?;
            return Err(error);
        }

        let scene = &loaded.scene;
        log::info!(
            "Scene loaded: {} shader(s), {} material(s), {} mesh(es)",
            scene.groups.len(),
            scene.groups.iter().map(|g| g.materials.len()).sum::<usize>(),
            scene.meshes().count()
        );
        runtime.scene = Some(loaded);
        Ok(())
    }

    /// Wait for the device to go idle, then free the scene's GPU resources.
    ///
    /// Returns the scene; its meshes keep their now invalid allocations.
    pub fn unload_scene(&mut self) -> RenderResult<Option<Scene>> {
        let Some(runtime) = self.runtime.as_mut() else {
            return Ok(None);
        };
        let Some(loaded) = runtime.scene.take() else {
            return Ok(None);
        };
        let scene = release_scene(runtime, loaded)?;
        log::info!("Scene unloaded");
        Ok(Some(scene))
    }

    /// Run one tick. Stale surfaces are handled here and reported as a skip.
    pub fn run_tick(&mut self, app: &mut impl Application) -> RenderResult<TickOutcome> {
        match self.tick(app) {
            Err(error) if error.is_recoverable() => {
                log::warn!("Recovering from stale surface: {}", error);
                Ok(TickOutcome::Skipped(SkipReason::SurfaceRecreated))
            }
            other => other,
        }
    }

    fn tick(&mut self, app: &mut impl Application) -> RenderResult<TickOutcome> {
        let delta = self.clock.tick();
        let input = self.window.poll_input();
        if input.close_requested || self.window.should_close() {
            return Ok(TickOutcome::Closing);
        }

        let scene = self
            .runtime
            .as_mut()
            .and_then(|r| r.scene.as_mut())
            .map(|loaded| &mut loaded.scene);
        app.update(scene, &input, delta);
        if app.should_exit() {
            return Ok(TickOutcome::Closing);
        }

        let extent = extent_of(self.window.drawable_size());
        let clear_color = self.config.clear_color;
        let clear_depth = self.config.clear_depth;
        let policy = self.config.missing_mesh_policy;
        let timeout = self.config.fence_timeout_ns();
        let max_anisotropy = self.config.max_anisotropy;
        let decoder = &*self.decoder;
        let runtime = self.runtime.as_mut().ok_or(ResourceMisuse::ChainNotReady {
            state: "uninitialized",
        })?;

        runtime.allocator.drain_completed(&runtime.ctx)?;

        if runtime.scene.is_none() {
            return Ok(TickOutcome::Skipped(SkipReason::NoScene));
        }
        if !is_renderable(extent) {
            log::trace!("Window is {}x{}, skipping frame", extent.width, extent.height);
            return Ok(TickOutcome::Skipped(SkipReason::ZeroSized));
        }

        match runtime.chain.state() {
            ChainState::Uninitialized => {
                if runtime.rebuild_chain(decoder, extent, max_anisotropy)? == Rebuild::Skipped {
                    return Ok(TickOutcome::Skipped(SkipReason::ZeroSized));
                }
            }
            ChainState::OutOfDate => {
                return Ok(match runtime.rebuild_chain(decoder, extent, max_anisotropy)? {
                    Rebuild::Skipped => TickOutcome::Skipped(SkipReason::ZeroSized),
                    _ => TickOutcome::Skipped(SkipReason::SurfaceRecreated),
                });
            }
            ChainState::Ready | ChainState::Destroyed => {}
        }
        if input.resized.is_some() {
            log::debug!("Window resized, rebuilding presentation chain");
            return Ok(match runtime.rebuild_chain(decoder, extent, max_anisotropy)? {
                Rebuild::Skipped => TickOutcome::Skipped(SkipReason::ZeroSized),
                _ => TickOutcome::Skipped(SkipReason::SurfaceRecreated),
            });
        }

        if policy == MissingMeshPolicy::Fail {
            let missing = runtime
                .scene
                .as_ref()
                .map_or(0, |loaded| loaded.scene.meshes().filter(|mesh| !mesh.is_uploaded()).count());
            if missing > 0 {
                log::error!("{} mesh(es) in the scene have no GPU allocation", missing);
                return Err(ResourceMisuse::UnuploadedMesh.into());
            }
        }

        runtime.frames.wait_current(&runtime.ctx)?;

        let signal = runtime.frames.current().image_acquired();
        let image_index = match runtime.chain.acquire(&runtime.ctx, signal, timeout)? {
            Acquired::Image(index) => index,
            Acquired::Stale { signal_pending } => {
                let rebuilt = runtime.rebuild_chain(decoder, extent, max_anisotropy)?;
                if signal_pending {
                    runtime.frames.replace_acquire_signal(&runtime.ctx)?;
                }
                return Ok(TickOutcome::Skipped(match rebuilt {
                    Rebuild::Skipped => SkipReason::ZeroSized,
                    _ => SkipReason::SurfaceRecreated,
                }));
            }
        };

        let settings = FrameSettings {
            clear_color,
            clear_depth,
            policy,
        };
        if let Err(error) = runtime.record_frame(image_index, &settings) {
            runtime.abandon_frame();
            return Err(error);
        }
        runtime.frames.mark_submitted();

        let Runtime {
            ctx, chain, frames, ..
        } = runtime;
        let slot = frames.current();
        let slot_index = slot.index();
        chain.present(ctx, image_index, slot.render_finished())?;
        frames.advance();
        log::trace!("Presented image {} from slot {}", image_index, slot_index);

        Ok(TickOutcome::Presented {
            image_index,
            slot: slot_index,
        })
    }

    /// Tick until the window closes or the application asks to exit
    pub fn run(&mut self, app: &mut impl Application) -> RenderResult<()> {
        log::info!("Entering render loop");
        loop {
            if self.run_tick(app)? == TickOutcome::Closing {
                break;
            }
        }
        log::info!(
            "Render loop finished after {} frames ({:.1} fps average)",
            self.clock.frame_count(),
            self.clock.average_fps()
        );
        Ok(())
    }

    /// Tear everything down in dependency order. Safe to call more than once.
    pub fn shutdown(&mut self) -> RenderResult<()> {
        let Some(mut runtime) = self.runtime.take() else {
            return Ok(());
        };
        log::info!("Shutting down render engine");

        let mut first_error = runtime.ctx.wait_idle().err();
        if let Some(loaded) = runtime.scene.take() {
            if let Err(error) = release_scene(&mut runtime, loaded) {
                first_error.get_or_insert(error);
            }
        }
        let Runtime {
            ctx,
            allocator,
            mut chain,
            mut frames,
            ..
        } = runtime;
        if let Err(error) = allocator.destroy_all(&ctx) {
            first_error.get_or_insert(error);
        }
        frames.destroy(&ctx);
        chain.destroy(&ctx);
        drop(ctx);

        first_error.map_or(Ok(()), Err)
    }

    /// Whether [`initialize`](Self::initialize) succeeded and no shutdown happened since
    pub fn is_initialized(&self) -> bool {
        self.runtime.is_some()
    }

    /// Device context, once initialized
    pub fn device_context(&self) -> Option<&DeviceContext<I::Device>> {
        self.runtime.as_ref().map(|r| &r.ctx)
    }

    /// Allocator counters, once initialized
    pub fn allocator_stats(&self) -> Option<AllocatorStats> {
        self.runtime.as_ref().map(|r| r.allocator.stats())
    }

    /// Presentation chain, once initialized
    pub fn presentation_chain(&self) -> Option<&PresentationChain<I::Device>> {
        self.runtime.as_ref().map(|r| &r.chain)
    }

    /// Frame slots, once initialized
    pub fn frames(&self) -> Option<&FrameRing> {
        self.runtime.as_ref().map(|r| &r.frames)
    }

    /// Loaded scene
    pub fn scene(&self) -> Option<&Scene> {
        self.runtime
            .as_ref()
            .and_then(|r| r.scene.as_ref())
            .map(|loaded| &loaded.scene)
    }

    /// Configuration in use
    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Frame clock
    pub fn clock(&self) -> &FrameClock {
        &self.clock
    }

    /// Window
    pub fn window(&self) -> &W {
        &self.window
    }

    /// Window, mutably
    pub fn window_mut(&mut self) -> &mut W {
        &mut self.window
    }

    /// Backend instance
    pub fn instance(&self) -> &I {
        &self.instance
    }
}

impl<I: GpuInstance, W: WindowSurface> Drop for RenderEngine<I, W> {
    fn drop(&mut self) {
        if self.runtime.is_some() {
            log::warn!("RenderEngine dropped without shutdown; tearing down now");
            if let Err(error) = self.shutdown() {
                log::error!("Shutdown during drop failed: {}", error);
            }
        }
    }
}

/// Per-tick values taken from the renderer config
struct FrameSettings {
    clear_color: [f32; 4],
    clear_depth: f32,
    policy: MissingMeshPolicy,
}

impl<D: GpuDevice> Runtime<D> {
    /// Reset the current fence, record the scene and submit it
    fn record_frame(&self, image_index: u32, settings: &FrameSettings) -> RenderResult<()> {
        let Self {
            ctx,
            allocator,
            chain,
            frames,
            scene,
        } = self;
        let loaded = scene.as_ref().ok_or(ResourceMisuse::NoScene)?;
        frames.reset_current(ctx)?;

        let resources = loaded.resources.as_deref().unwrap_or_default();
        let view_projection = loaded.scene.camera.view_projection(chain.aspect_ratio());
        let chain_extent = chain.extent();

        let mut pass = frames
            .begin_recording(ctx)?
            .set_viewport(chain_extent)
            .set_scissor(chain_extent)
            .begin_render_pass(
                chain.render_pass(),
                chain.framebuffer(image_index)?,
                chain_extent,
                settings.clear_color,
                settings.clear_depth,
            );
        for (group, resource) in loaded.scene.groups.iter().zip(resources) {
            let layout = resource.pipeline.layout();
            pass = pass
                .bind_pipeline(resource.pipeline.handles())
                .push_view_projection(layout, &view_projection);
            for (material_group, material) in group.materials.iter().zip(&resource.materials) {
                pass = pass.bind_material(layout, material.descriptor_set());
                for mesh in &material_group.meshes {
                    pass = pass.draw_mesh(layout, mesh, allocator, settings.policy)?;
                }
            }
        }

        let slot = frames.current();
        pass.end_render_pass().end()?.submit_with(
            ctx.graphics_queue(),
            &[(slot.image_acquired(), vk::PipelineStageFlags::COLOR_ATTACHMENT_OUTPUT)],
            &[slot.render_finished()],
            Some(slot.in_flight()),
        )
    }

    /// Recover from a frame that acquired an image but was never submitted.
    ///
    /// The image-acquired semaphore still holds a signal and the image is never
    /// presented, so the semaphore is replaced and the chain rebuilt next tick.
    fn abandon_frame(&mut self) {
        log::warn!(
            "Frame in slot {} was not submitted, discarding its image",
            self.frames.current_index()
        );
        if let Err(error) = self.frames.replace_acquire_signal(&self.ctx) {
            log::warn!("Could not replace image-acquired semaphore: {}", error);
        }
        self.chain.mark_out_of_date();
    }

    /// Rebuild the chain and bring the scene's pipelines in line with its render pass
    fn rebuild_chain(
        &mut self,
        decoder: &dyn ImageDecoder,
        extent: vk::Extent2D,
        max_anisotropy: f32,
    ) -> RenderResult<Rebuild> {
        let outcome = self.chain.handle_resize(&self.ctx, extent)?;
        if outcome == Rebuild::Skipped {
            return Ok(outcome);
        }
        let render_pass = self.chain.render_pass();
        let Some(loaded) = self.scene.as_mut() else {
            return Ok(outcome);
        };
        if let Some(resources) = loaded.resources.as_mut() {
            if outcome == Rebuild::RenderPassChanged {
                for group in resources {
                    group.pipeline.rebuild(&self.ctx, render_pass)?;
                    for material in &mut group.materials {
                        material.rebind(&self.ctx, &group.pipeline)?;
                    }
                }
                log::info!("Rebuilt shader pipelines for the new render pass");
            }
        } else {
            let resources = build_resources_for(
                &self.ctx,
                &mut self.allocator,
                render_pass,
                decoder,
                &loaded.scene,
                max_anisotropy,
            )?;
            loaded.resources = Some(resources);
        }
        Ok(outcome)
    }
}

fn upload_meshes<D: GpuDevice>(runtime: &mut Runtime<D>, loaded: &mut LoadedScene) -> RenderResult<()> {
    for mesh in loaded.scene.meshes_mut() {
        mesh.upload(&runtime.ctx, &mut runtime.allocator)?;
    }
    Ok(())
}

fn build_resources<D: GpuDevice>(
    runtime: &mut Runtime<D>,
    decoder: &dyn ImageDecoder,
    scene: &Scene,
    max_anisotropy: f32,
) -> RenderResult<Vec<GroupResources>> {
    let render_pass = runtime.chain.render_pass();
    build_resources_for(
        &runtime.ctx,
        &mut runtime.allocator,
        render_pass,
        decoder,
        scene,
        max_anisotropy,
    )
}

fn build_resources_for<D: GpuDevice>(
    ctx: &DeviceContext<D>,
    allocator: &mut MemoryAllocator<D>,
    render_pass: vk::RenderPass,
    decoder: &dyn ImageDecoder,
    scene: &Scene,
    max_anisotropy: f32,
) -> RenderResult<Vec<GroupResources>> {
    let mut built = Vec::with_capacity(scene.groups.len());
    match fill_resources(ctx, allocator, render_pass, decoder, scene, max_anisotropy, &mut built) {
        Ok(()) => Ok(built),
        Err(error) => {
            ctx.wait_idle()?;
            allocator.flush(ctx)?;
            destroy_resources(ctx, allocator, built)?;
            Err(error)
        }
    }
}

fn fill_resources<D: GpuDevice>(
    ctx: &DeviceContext<D>,
    allocator: &mut MemoryAllocator<D>,
    render_pass: vk::RenderPass,
    decoder: &dyn ImageDecoder,
    scene: &Scene,
    max_anisotropy: f32,
    built: &mut Vec<GroupResources>,
) -> RenderResult<()> {
    for group in &scene.groups {
        let pipeline = ShaderPipeline::load(ctx, render_pass, &group.shader)?;
        let mut materials = Vec::with_capacity(group.materials.len());
        for material_group in &group.materials {
            match Material::create(
                ctx,
                allocator,
                decoder,
                &material_group.material,
                &pipeline,
                max_anisotropy,
            ) {
                Ok(material) => materials.push(material),
                Err(error) => {
                    built.push(GroupResources { pipeline, materials });
                    return Err(error);
                }
            }
        }
        built.push(GroupResources { pipeline, materials });
    }
    Ok(())
}

fn destroy_resources<D: GpuDevice>(
    ctx: &DeviceContext<D>,
    allocator: &mut MemoryAllocator<D>,
    resources: Vec<GroupResources>,
) -> RenderResult<()> {
    for group in resources {
        for material in group.materials {
            material.destroy(ctx, allocator)?;
        }
        group.pipeline.destroy(ctx);
    }
    Ok(())
}

fn release_scene<D: GpuDevice>(runtime: &mut Runtime<D>, loaded: LoadedScene) -> RenderResult<Scene> {
    let LoadedScene { mut scene, resources } = loaded;
    runtime.ctx.wait_idle()?;
    runtime.allocator.flush(&runtime.ctx)?;
    if let Some(resources) = resources {
        destroy_resources(&runtime.ctx, &mut runtime.allocator, resources)?;
    }
    for mesh in scene.meshes_mut() {
        mesh.release(&runtime.ctx, &mut runtime.allocator)?;
    }
    Ok(scene)
}
