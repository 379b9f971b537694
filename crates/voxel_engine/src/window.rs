//! Window management using GLFW
//!
//! The engine only needs a drawable size, a stream of input and a close flag;
//! [`WindowSurface`] captures that. [`VulkanSurfaceSource`] adds what the
//! Vulkan backend needs to create its instance and surface.

use std::collections::HashSet;

use ash::vk;

use crate::config::WindowConfig;
use crate::error::{RenderError, RenderResult};
use crate::scene::{InputState, KeyCode};

/// A window the engine draws into
pub trait WindowSurface {
    /// Drawable area in pixels; zero while minimized
    fn drawable_size(&self) -> (u32, u32);

    /// Pump platform events and return the input gathered since the last call
    fn poll_input(&mut self) -> InputState;

    /// The user or the application asked to close
    fn should_close(&self) -> bool;
}

/// A window that can host a Vulkan surface
pub trait VulkanSurfaceSource {
    /// Instance extensions required to present to this window
    fn required_instance_extensions(&self) -> RenderResult<Vec<String>>;

    /// Create a surface for `instance`
    fn create_surface(&mut self, instance: vk::Instance) -> RenderResult<vk::SurfaceKHR>;
}

/// GLFW window without a client API, ready for Vulkan
pub struct GlfwWindow {
    glfw: glfw::Glfw,
    window: glfw::PWindow,
    events: glfw::GlfwReceiver<(f64, glfw::WindowEvent)>,
    pressed: HashSet<KeyCode>,
    last_cursor: Option<(f64, f64)>,
}

impl GlfwWindow {
    /// Open a resizable window
    pub fn new(config: &WindowConfig) -> RenderResult<Self> {
        let mut glfw = glfw::init(glfw::fail_on_errors)
            .map_err(|e| RenderError::Window(format!("GLFW initialization failed: {e:?}")))?;

        // Configure for Vulkan (no OpenGL context)
        glfw.window_hint(glfw::WindowHint::ClientApi(glfw::ClientApiHint::NoApi));
        glfw.window_hint(glfw::WindowHint::Resizable(true));

        let (mut window, events) = glfw
            .create_window(
                config.width,
                config.height,
                &config.title,
                glfw::WindowMode::Windowed,
            )
            .ok_or_else(|| RenderError::Window("window creation failed".to_string()))?;

        window.set_key_polling(true);
        window.set_close_polling(true);
        window.set_framebuffer_size_polling(true);
        window.set_cursor_pos_polling(true);

        log::info!("Opened window '{}' ({}x{})", config.title, config.width, config.height);
        Ok(Self {
            glfw,
            window,
            events,
            pressed: HashSet::new(),
            last_cursor: None,
        })
    }

    /// Flag the window for closing
    pub fn set_should_close(&mut self, should_close: bool) {
        self.window.set_should_close(should_close);
    }
}

fn key_code(key: glfw::Key, scancode: i32) -> KeyCode {
    match key {
        glfw::Key::W => KeyCode::W,
        glfw::Key::A => KeyCode::A,
        glfw::Key::S => KeyCode::S,
        glfw::Key::D => KeyCode::D,
        glfw::Key::Space => KeyCode::Space,
        glfw::Key::LeftShift => KeyCode::LeftShift,
        glfw::Key::Escape => KeyCode::Escape,
        _ => KeyCode::Other(scancode),
    }
}

impl WindowSurface for GlfwWindow {
    fn drawable_size(&self) -> (u32, u32) {
        let (width, height) = self.window.get_framebuffer_size();
        (width.max(0) as u32, height.max(0) as u32)
    }

    fn poll_input(&mut self) -> InputState {
        self.glfw.poll_events();

        let mut input = InputState::default();
        let mut delta = (0.0, 0.0);
        for (_, event) in glfw::flush_messages(&self.events) {
            match event {
                glfw::WindowEvent::Key(key, scancode, action, _) => {
                    let code = key_code(key, scancode);
                    match action {
                        glfw::Action::Press | glfw::Action::Repeat => {
                            self.pressed.insert(code);
                        }
                        glfw::Action::Release => {
                            self.pressed.remove(&code);
                        }
                    }
                }
                glfw::WindowEvent::CursorPos(x, y) => {
                    if let Some((last_x, last_y)) = self.last_cursor {
                        delta.0 += x - last_x;
                        delta.1 += y - last_y;
                    }
                    self.last_cursor = Some((x, y));
                }
                glfw::WindowEvent::FramebufferSize(width, height) => {
                    log::debug!("Framebuffer resized to {}x{}", width, height);
                    input.resized = Some((width.max(0) as u32, height.max(0) as u32));
                }
                glfw::WindowEvent::Close => input.close_requested = true,
                _ => {}
            }
        }

        input.pressed = self.pressed.clone();
        input.cursor_delta = delta;
        input
    }

    fn should_close(&self) -> bool {
        self.window.should_close()
    }
}

impl VulkanSurfaceSource for GlfwWindow {
    fn required_instance_extensions(&self) -> RenderResult<Vec<String>> {
        self.glfw
            .get_required_instance_extensions()
            .ok_or_else(|| RenderError::Window("Vulkan is not supported by GLFW".to_string()))
    }

    fn create_surface(&mut self, instance: vk::Instance) -> RenderResult<vk::SurfaceKHR> {
        let mut surface = vk::SurfaceKHR::null();
        let result = self
            .window
            .create_window_surface(instance, std::ptr::null(), &mut surface);
        if result == vk::Result::SUCCESS {
            Ok(surface)
        } else {
            Err(RenderError::ResourceCreation {
                what: "window surface",
                result,
            })
        }
    }
}
