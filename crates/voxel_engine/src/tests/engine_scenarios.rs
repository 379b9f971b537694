use ash::vk;
use nalgebra::{Matrix4, Vector3};

use super::{cube_scene, engine, engine_with};
use crate::backend::headless::{GpuCall, ObjectKind};
use crate::backend::GpuCommand;
use crate::config::{MissingMeshPolicy, RendererConfig};
use crate::engine::{Application, SkipReason, TickOutcome};
use crate::error::{RenderError, ResourceMisuse};
use crate::presentation::ChainState;
use crate::scene::{cube_mesh, InputState, Scene};

fn presented(outcome: TickOutcome) -> bool {
    matches!(outcome, TickOutcome::Presented { .. })
}

fn swapchains_created(calls: &[GpuCall]) -> usize {
    calls
        .iter()
        .filter(|c| matches!(c, GpuCall::CreateSwapchain { .. }))
        .count()
}

fn draws(calls: &[GpuCall]) -> usize {
    calls
        .iter()
        .filter(|c| {
            matches!(
                c,
                GpuCall::Record {
                    command: GpuCommand::DrawIndexed { .. },
                    ..
                }
            )
        })
        .count()
}

#[test]
fn test_frames_wait_on_their_own_fence_before_rerecording() {
    let (mut engine, probe, _window) = engine();
    engine.load_scene(cube_scene("pacing", 2)).unwrap();
    probe.set_auto_complete(false);
    probe.clear_calls();

    let slots: Vec<usize> = (0..4)
        .map(|_| match engine.run_tick(&mut ()).unwrap() {
            TickOutcome::Presented { slot, .. } => slot,
            other => panic!("expected a presented frame, got {other:?}"),
        })
        .collect();
    assert_eq!(slots, vec![0, 1, 0, 1]);

    let calls = probe.calls();
    let submits: Vec<(usize, vk::CommandBuffer, vk::Fence)> = calls
        .iter()
        .enumerate()
        .filter_map(|(i, c)| match *c {
            GpuCall::Submit {
                command_buffer,
                fence: Some(fence),
                ..
            } => Some((i, command_buffer, fence)),
            _ => None,
        })
        .collect();
    assert_eq!(submits.len(), 4);
    assert_eq!(submits[0].2, submits[2].2);
    assert_eq!(submits[1].2, submits[3].2);
    assert_ne!(submits[0].2, submits[1].2);
    assert_eq!(submits[0].1, submits[2].1);

    // slot 0 comes around again: its fence is waited on before its buffer is re-recorded
    let (first, command_buffer, fence) = submits[0];
    let (third, ..) = submits[2];
    let between = &calls[first + 1..third];
    let waited = between
        .iter()
        .position(|c| matches!(*c, GpuCall::WaitFence(f) if f == fence))
        .expect("fence wait before reuse");
    let begun = between
        .iter()
        .position(|c| matches!(*c, GpuCall::BeginCommandBuffer(cb) if cb == command_buffer))
        .expect("re-recording of slot 0");
    assert!(waited < begun);

    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
    engine.shutdown().unwrap();
    assert_eq!(probe.live_total(), 0);
}

#[test]
fn test_three_slots_rotate() {
    let config = RendererConfig {
        frames_in_flight: 3,
        ..RendererConfig::default()
    };
    let (mut engine, probe, _window) = engine_with(config, 800, 600);
    engine.load_scene(cube_scene("three_slots", 1)).unwrap();

    let slots: Vec<usize> = (0..6)
        .map(|_| match engine.run_tick(&mut ()).unwrap() {
            TickOutcome::Presented { slot, .. } => slot,
            other => panic!("expected a presented frame, got {other:?}"),
        })
        .collect();
    assert_eq!(slots, vec![0, 1, 2, 0, 1, 2]);
    assert!(probe.live(ObjectKind::Fence) >= 3);
    engine.shutdown().unwrap();
    assert!(probe.violations().is_empty());
}

#[test]
fn test_zero_sized_window_skips_all_frame_work() {
    let (mut engine, probe, window) = engine();
    engine.load_scene(cube_scene("minimized", 1)).unwrap();
    assert!(presented(engine.run_tick(&mut ()).unwrap()));

    window.set_size(0, 0);
    probe.clear_calls();
    for _ in 0..3 {
        assert_eq!(
            engine.run_tick(&mut ()).unwrap(),
            TickOutcome::Skipped(SkipReason::ZeroSized)
        );
    }
    assert_eq!(probe.count(GpuCall::is_frame_call), 0);
    assert_eq!(window.polls(), 4);

    // restored: the resize event rebuilds, the following tick draws again
    window.set_size(800, 600);
    window.push_input(InputState {
        resized: Some((800, 600)),
        ..InputState::default()
    });
    assert_eq!(
        engine.run_tick(&mut ()).unwrap(),
        TickOutcome::Skipped(SkipReason::SurfaceRecreated)
    );
    assert!(presented(engine.run_tick(&mut ()).unwrap()));
    engine.shutdown().unwrap();
    assert!(probe.violations().is_empty());
}

#[test]
fn test_chain_deferred_until_window_has_area() {
    let (mut engine, probe, window) = engine_with(RendererConfig::default(), 0, 0);
    assert_eq!(probe.live(ObjectKind::Swapchain), 0);

    engine.load_scene(cube_scene("deferred", 2)).unwrap();
    assert_eq!(probe.live(ObjectKind::Pipeline), 0);
    assert_eq!(
        engine.run_tick(&mut ()).unwrap(),
        TickOutcome::Skipped(SkipReason::ZeroSized)
    );

    window.set_size(640, 480);
    assert!(presented(engine.run_tick(&mut ()).unwrap()));
    assert_eq!(probe.live(ObjectKind::Swapchain), 1);
    assert_eq!(probe.live(ObjectKind::Pipeline), 1);
    assert_eq!(probe.live(ObjectKind::MaterialSet), 1);

    engine.shutdown().unwrap();
    assert_eq!(probe.live_total(), 0);
}

#[test]
fn test_repeated_resize_leaves_one_chain() {
    let (mut engine, probe, window) = engine();
    engine.load_scene(cube_scene("resize", 1)).unwrap();
    let image_count = engine.presentation_chain().unwrap().image_count() as usize;
    let pipelines_before = probe.count(|c| matches!(c, GpuCall::CreatePipeline(_)));

    for _ in 0..3 {
        probe.set_surface_extent(1024, 768);
        window.set_size(1024, 768);
        window.push_input(InputState {
            resized: Some((1024, 768)),
            ..InputState::default()
        });
        assert_eq!(
            engine.run_tick(&mut ()).unwrap(),
            TickOutcome::Skipped(SkipReason::SurfaceRecreated)
        );
    }

    let chain = engine.presentation_chain().unwrap();
    assert_eq!(chain.extent(), vk::Extent2D { width: 1024, height: 768 });
    assert_eq!(probe.live(ObjectKind::Swapchain), 1);
    assert_eq!(probe.live(ObjectKind::RenderPass), 1);
    assert_eq!(probe.live(ObjectKind::Framebuffer), image_count);
    // same formats: the render pass and pipelines survive
    assert_eq!(
        probe.count(|c| matches!(c, GpuCall::CreatePipeline(_))),
        pipelines_before
    );

    assert!(presented(engine.run_tick(&mut ()).unwrap()));
    engine.shutdown().unwrap();
    assert!(probe.violations().is_empty());
    assert_eq!(probe.live_total(), 0);
}

#[test]
fn test_depth_format_change_rebuilds_pipelines() {
    let (mut engine, probe, window) = engine();
    engine.load_scene(cube_scene("depth_change", 1)).unwrap();
    let pipelines_before = probe.count(|c| matches!(c, GpuCall::CreatePipeline(_)));

    probe.set_depth_format(vk::Format::D24_UNORM_S8_UINT);
    window.push_input(InputState {
        resized: Some((800, 600)),
        ..InputState::default()
    });
    assert_eq!(
        engine.run_tick(&mut ()).unwrap(),
        TickOutcome::Skipped(SkipReason::SurfaceRecreated)
    );
    assert_eq!(
        probe.count(|c| matches!(c, GpuCall::CreatePipeline(_))),
        pipelines_before + 1
    );
    assert_eq!(probe.live(ObjectKind::Pipeline), 1);
    assert_eq!(probe.live(ObjectKind::MaterialSet), 1);
    assert!(presented(engine.run_tick(&mut ()).unwrap()));

    engine.shutdown().unwrap();
    assert_eq!(probe.live_total(), 0);
}

#[test]
fn test_load_unload_round_trip() {
    let (mut engine, probe, _window) = engine();
    engine.load_scene(cube_scene("round_trip", 3)).unwrap();

    let scene = engine.scene().unwrap();
    assert_eq!(scene.meshes().count(), 3);
    assert!(scene.meshes().all(|m| m.is_uploaded()));
    // three mesh buffers and one texture image
    assert_eq!(engine.allocator_stats().unwrap().live, 4);
    assert_eq!(probe.live(ObjectKind::Pipeline), 1);

    let scene = engine.unload_scene().unwrap().unwrap();
    assert!(engine.scene().is_none());
    assert!(scene
        .meshes()
        .all(|m| m.allocation().map_or(false, |a| !a.is_valid())));
    let stats = engine.allocator_stats().unwrap();
    assert_eq!(stats.live, 0);
    assert_eq!(stats.live_bytes, 0);
    assert_eq!(probe.live(ObjectKind::Pipeline), 0);
    assert_eq!(probe.live(ObjectKind::MaterialSet), 0);
    assert_eq!(probe.live(ObjectKind::Sampler), 0);

    // unloaded meshes upload again on reload
    engine.load_scene(scene).unwrap();
    assert_eq!(engine.allocator_stats().unwrap().live, 4);
    assert!(engine.scene().unwrap().meshes().all(|m| m.is_uploaded()));

    engine.shutdown().unwrap();
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
    assert_eq!(probe.live_total(), 0);
}

#[test]
fn test_loading_replaces_previous_scene() {
    let (mut engine, probe, _window) = engine();
    engine.load_scene(cube_scene("replace_a", 2)).unwrap();
    engine.load_scene(cube_scene("replace_b", 1)).unwrap();
    assert_eq!(engine.allocator_stats().unwrap().live, 2);
    assert_eq!(probe.live(ObjectKind::Pipeline), 1);
    engine.shutdown().unwrap();
    assert_eq!(probe.live_total(), 0);
}

#[test]
fn test_out_of_date_acquire_recovers() {
    let (mut engine, probe, _window) = engine();
    engine.load_scene(cube_scene("stale_acquire", 1)).unwrap();
    assert!(presented(engine.run_tick(&mut ()).unwrap()));

    probe.push_acquire_result(vk::Result::ERROR_OUT_OF_DATE_KHR);
    probe.clear_calls();
    assert_eq!(
        engine.run_tick(&mut ()).unwrap(),
        TickOutcome::Skipped(SkipReason::SurfaceRecreated)
    );
    let calls = probe.calls();
    assert_eq!(swapchains_created(&calls), 1);
    assert!(calls.iter().any(|c| matches!(
        c,
        GpuCall::CreateSwapchain { retired, .. } if *retired != vk::SwapchainKHR::null()
    )));
    assert!(!calls.iter().any(|c| matches!(c, GpuCall::Submit { .. })));

    assert!(presented(engine.run_tick(&mut ()).unwrap()));
    assert_eq!(probe.live(ObjectKind::Swapchain), 1);
    engine.shutdown().unwrap();
    assert!(probe.violations().is_empty());
}

#[test]
fn test_suboptimal_acquire_replaces_signaled_semaphore() {
    let (mut engine, probe, _window) = engine();
    engine.load_scene(cube_scene("suboptimal", 1)).unwrap();
    assert!(presented(engine.run_tick(&mut ()).unwrap()));

    let slot = engine.frames().unwrap().current_index();
    let semaphore = engine.frames().unwrap().current().image_acquired();
    probe.push_acquire_result(vk::Result::SUBOPTIMAL_KHR);
    assert_eq!(
        engine.run_tick(&mut ()).unwrap(),
        TickOutcome::Skipped(SkipReason::SurfaceRecreated)
    );
    let frames = engine.frames().unwrap();
    assert_eq!(frames.current_index(), slot);
    assert_ne!(frames.current().image_acquired(), semaphore);

    assert!(presented(engine.run_tick(&mut ()).unwrap()));
    engine.shutdown().unwrap();
    assert!(probe.violations().is_empty());
}

#[test]
fn test_out_of_date_present_rebuilds_next_tick() {
    let (mut engine, probe, _window) = engine();
    engine.load_scene(cube_scene("stale_present", 1)).unwrap();

    probe.push_present_result(vk::Result::ERROR_OUT_OF_DATE_KHR);
    assert!(presented(engine.run_tick(&mut ()).unwrap()));
    assert_eq!(
        engine.run_tick(&mut ()).unwrap(),
        TickOutcome::Skipped(SkipReason::SurfaceRecreated)
    );
    assert!(presented(engine.run_tick(&mut ()).unwrap()));
    engine.shutdown().unwrap();
    assert!(probe.violations().is_empty());
}

#[test]
fn test_device_lost_is_fatal() {
    let (mut engine, probe, _window) = engine();
    engine.load_scene(cube_scene("device_lost", 1)).unwrap();
    probe.push_acquire_result(vk::Result::ERROR_DEVICE_LOST);
    assert!(matches!(
        engine.run_tick(&mut ()),
        Err(RenderError::DeviceLost { .. })
    ));
    engine.shutdown().unwrap();
}

#[test]
fn test_tick_without_scene_is_skipped() {
    let (mut engine, probe, _window) = engine();
    probe.clear_calls();
    assert_eq!(
        engine.run_tick(&mut ()).unwrap(),
        TickOutcome::Skipped(SkipReason::NoScene)
    );
    assert_eq!(probe.count(GpuCall::is_frame_call), 0);
    engine.shutdown().unwrap();
}

#[test]
fn test_draws_follow_scene_order() {
    let (mut engine, probe, _window) = engine();
    engine.load_scene(cube_scene("order", 3)).unwrap();
    probe.clear_calls();
    assert!(presented(engine.run_tick(&mut ()).unwrap()));

    let commands: Vec<GpuCommand> = probe
        .calls()
        .into_iter()
        .filter_map(|c| match c {
            GpuCall::Record { command, .. } => Some(command),
            _ => None,
        })
        .collect();
    let position = |pred: fn(&GpuCommand) -> bool| commands.iter().position(pred).unwrap();
    let pipeline = position(|c| matches!(c, GpuCommand::BindPipeline(_)));
    let material = position(|c| matches!(c, GpuCommand::BindDescriptorSet { .. }));
    let first_draw = position(|c| matches!(c, GpuCommand::DrawIndexed { .. }));
    assert!(pipeline < material && material < first_draw);
    assert!(matches!(commands.first(), Some(GpuCommand::SetViewport(_))));
    assert!(matches!(commands.last(), Some(GpuCommand::EndRenderPass)));
    assert_eq!(draws(&probe.calls()), 3);
    engine.shutdown().unwrap();
}

/// Spins the first cube, adds an unuploaded cube after two updates and exits after five
struct SpinApp {
    updates: u32,
    saw_scene: bool,
}

impl Application for SpinApp {
    fn update(&mut self, scene: Option<&mut Scene>, _input: &InputState, delta: f32) {
        self.updates += 1;
        let Some(scene) = scene else {
            return;
        };
        self.saw_scene = true;
        if let Some(mesh) = scene.meshes_mut().next() {
            mesh.model *= Matrix4::from_euler_angles(0.0, delta, 0.0);
        }
        if self.updates == 2 {
            scene.groups[0].materials[0]
                .meshes
                .push(cube_mesh(Matrix4::new_translation(&Vector3::new(0.0, 2.0, 0.0))));
        }
    }

    fn should_exit(&self) -> bool {
        self.updates >= 5
    }
}

#[test]
fn test_run_stops_when_application_exits() {
    let config = RendererConfig {
        missing_mesh_policy: MissingMeshPolicy::Skip,
        ..RendererConfig::default()
    };
    let (mut engine, probe, window) = engine_with(config, 800, 600);
    engine.load_scene(cube_scene("run_loop", 1)).unwrap();
    let mut app = SpinApp {
        updates: 0,
        saw_scene: false,
    };

    probe.clear_calls();
    engine.run(&mut app).unwrap();
    assert_eq!(app.updates, 5);
    assert!(app.saw_scene);
    assert_eq!(window.polls(), 5);
    // the added cube is never uploaded and is skipped every frame
    assert_eq!(draws(&probe.calls()), 4);
    assert_eq!(engine.clock().frame_count(), 5);
    engine.shutdown().unwrap();
    assert!(probe.violations().is_empty());
}

#[test]
fn test_unuploaded_mesh_fails_under_fail_policy() {
    let config = RendererConfig {
        missing_mesh_policy: MissingMeshPolicy::Fail,
        ..RendererConfig::default()
    };
    let (mut engine, _probe, _window) = engine_with(config, 800, 600);
    engine.load_scene(cube_scene("fail_policy", 1)).unwrap();
    let mut app = SpinApp {
        updates: 0,
        saw_scene: false,
    };
    assert!(presented(engine.run_tick(&mut app).unwrap()));
    assert!(matches!(
        engine.run_tick(&mut app),
        Err(RenderError::InvalidResourceUse(ResourceMisuse::UnuploadedMesh))
    ));
    engine.shutdown().unwrap();
}

/// Adds an unuploaded cube while `stray` is set and removes it afterwards
struct StrayMesh {
    stray: bool,
}

impl Application for StrayMesh {
    fn update(&mut self, scene: Option<&mut Scene>, _input: &InputState, _delta: f32) {
        let Some(scene) = scene else {
            return;
        };
        let meshes = &mut scene.groups[0].materials[0].meshes;
        if self.stray && meshes.len() == 1 {
            meshes.push(cube_mesh(Matrix4::new_translation(&Vector3::new(0.0, 2.0, 0.0))));
        } else if !self.stray {
            meshes.truncate(1);
        }
    }
}

#[test]
fn test_unuploaded_mesh_error_leaves_slot_reusable() {
    let config = RendererConfig {
        missing_mesh_policy: MissingMeshPolicy::Fail,
        ..RendererConfig::default()
    };
    let (mut engine, probe, _window) = engine_with(config, 800, 600);
    engine.load_scene(cube_scene("fail_recovers", 1)).unwrap();
    let mut app = StrayMesh { stray: true };

    let slot = engine.frames().unwrap().current_index();
    probe.clear_calls();
    assert!(matches!(
        engine.run_tick(&mut app),
        Err(RenderError::InvalidResourceUse(ResourceMisuse::UnuploadedMesh))
    ));
    // rejected before the slot was touched
    let calls = probe.calls();
    assert!(!calls.iter().any(|c| matches!(
        c,
        GpuCall::Acquire { .. } | GpuCall::ResetFence(_) | GpuCall::BeginCommandBuffer(_)
    )));
    assert_eq!(engine.frames().unwrap().current_index(), slot);

    app.stray = false;
    for _ in 0..3 {
        assert!(presented(engine.run_tick(&mut app).unwrap()));
    }
    engine.shutdown().unwrap();
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[test]
fn test_failed_submit_abandons_acquired_image() {
    let (mut engine, probe, _window) = engine();
    engine.load_scene(cube_scene("failed_submit", 1)).unwrap();
    assert!(presented(engine.run_tick(&mut ()).unwrap()));

    let slot = engine.frames().unwrap().current_index();
    let semaphore = engine.frames().unwrap().current().image_acquired();
    probe.fail_next_submit(vk::Result::ERROR_OUT_OF_HOST_MEMORY);
    assert!(matches!(
        engine.run_tick(&mut ()),
        Err(RenderError::Api {
            result: vk::Result::ERROR_OUT_OF_HOST_MEMORY,
            ..
        })
    ));

    let frames = engine.frames().unwrap();
    assert_eq!(frames.current_index(), slot);
    assert_ne!(frames.current().image_acquired(), semaphore);
    assert!(!probe.signal_pending(frames.current().image_acquired()));
    assert_eq!(
        engine.presentation_chain().unwrap().state(),
        ChainState::OutOfDate
    );

    assert_eq!(
        engine.run_tick(&mut ()).unwrap(),
        TickOutcome::Skipped(SkipReason::SurfaceRecreated)
    );
    assert!(presented(engine.run_tick(&mut ()).unwrap()));
    assert!(presented(engine.run_tick(&mut ()).unwrap()));
    engine.shutdown().unwrap();
    assert!(probe.violations().is_empty(), "{:?}", probe.violations());
}

#[test]
fn test_close_request_ends_run() {
    let (mut engine, _probe, window) = engine();
    engine.load_scene(cube_scene("close", 1)).unwrap();
    window.request_close();
    assert_eq!(engine.run_tick(&mut ()).unwrap(), TickOutcome::Closing);
    engine.run(&mut ()).unwrap();
    engine.shutdown().unwrap();
    engine.shutdown().unwrap();
    assert!(!engine.is_initialized());
}
