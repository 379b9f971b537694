//! # Voxel Engine
//!
//! Frame lifecycle and GPU resource management for a Vulkan voxel renderer.
//!
//! ## Features
//!
//! - **Device selection**: scores adapters and opens graphics, present and transfer queues
//! - **Presentation**: swapchain rebuilds on resize, minimization and stale surfaces
//! - **Frames in flight**: fence-paced ring of command buffers and semaphores
//! - **Resources**: tracked allocations with staged, fence-released uploads
//! - **Headless backend**: a CPU simulation of the device for tests
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use nalgebra::Point3;
//! use voxel_engine::prelude::*;
//!
//! fn main() -> Result<(), RenderError> {
//!     voxel_engine::logging::init();
//!     let config = RendererConfig::default();
//!     let mut window = GlfwWindow::new(&WindowConfig::default())?;
//!     let instance = VulkanInstance::new(&config, &mut window)?;
//!     let mut engine = RenderEngine::new(instance, window, config);
//!     engine.initialize()?;
//!     let camera = PerspectiveCamera::new(Point3::new(0.0, 2.0, 5.0), Point3::origin());
//!     engine.load_scene(Scene::new(camera))?;
//!     engine.run(&mut ())?;
//!     engine.shutdown()
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic, clippy::nursery)]
#![allow(
    clippy::module_name_repetitions,
    clippy::similar_names,
    clippy::too_many_arguments,
    clippy::missing_errors_doc,
    clippy::cast_possible_truncation,
    clippy::cast_precision_loss
)]

pub mod backend;
pub mod clock;
pub mod config;
pub mod device;
pub mod engine;
pub mod error;
pub mod frame;
pub mod logging;
pub mod memory;
pub mod presentation;
pub mod recorder;
pub mod scene;
pub mod shader;
pub mod texture;
pub mod window;

pub use engine::{Application, RenderEngine, SkipReason, TickOutcome};
pub use error::{RenderError, RenderResult, ResourceMisuse};

/// Common imports for engine users
pub mod prelude {
    pub use crate::{
        backend::{
            headless::HeadlessInstance,
            vulkan::{VulkanDevice, VulkanInstance},
            GpuDevice, GpuInstance,
        },
        clock::FrameClock,
        config::{Config, MissingMeshPolicy, RendererConfig, WindowConfig},
        device::{DeviceContext, DeviceRequirements},
        memory::{Allocation, AllocatorStats, MemoryAllocator},
        scene::{
            cube_mesh, Camera, InputState, KeyCode, MaterialGroup, MaterialSource, Mesh,
            PerspectiveCamera, Scene, ShaderGroup, ShaderSource, Vertex,
        },
        texture::{FileDecoder, FilterMode, ImageDecoder, SamplerConfig, WrapMode},
        window::{GlfwWindow, WindowSurface},
        Application, RenderEngine, RenderError, RenderResult, ResourceMisuse, SkipReason,
        TickOutcome,
    };
}

#[cfg(test)]
mod tests;
