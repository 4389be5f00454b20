//! Window and engine lifecycle.

use std::sync::Arc;

use cadence_core::{
    AntiAliasingMode, AntiAliasingSettings, EngineConfig, GameTimer, ShadowQuality,
    ShadowSettings,
};
use cadence_gpu::{FrameEngine, GpuError};
use cadence_vulkan::VulkanDevice;
use tracing::{error, info, warn};
use winit::application::ApplicationHandler;
use winit::dpi::PhysicalSize;
use winit::event::{ElementState, KeyEvent, WindowEvent};
use winit::event_loop::ActiveEventLoop;
use winit::keyboard::{KeyCode, PhysicalKey};
use winit::window::{Window, WindowId};

const TITLE: &str = "Cadence Viewer";
const MSAA_SAMPLES: u32 = 4;

/// Winit handler owning the window and the engine.
pub struct Viewer {
    config: EngineConfig,
    state: Option<ViewerState>,
}

struct ViewerState {
    // Dropped before the window it presents to
    engine: FrameEngine<VulkanDevice>,
    timer: Arc<GameTimer>,
    window: Arc<Window>,
    shown_fps: u32,
}

impl Viewer {
    pub const fn new(config: EngineConfig) -> Self {
        Self {
            config,
            state: None,
        }
    }

    fn create_state(&self, event_loop: &ActiveEventLoop) -> anyhow::Result<ViewerState> {
        let display = self.config.settings.display;
        let window_attrs = Window::default_attributes()
            .with_title(TITLE)
            .with_inner_size(PhysicalSize::new(display.width, display.height));
        let window = Arc::new(event_loop.create_window(window_attrs)?);

        let device = VulkanDevice::builder().app_name(TITLE).build(window.as_ref())?;
        let output = device.create_output(window.as_ref())?;

        // The window manager may not honour the requested size
        let size = window.inner_size();
        let mut config = self.config.clone();
        config.settings.display.width = size.width.max(1);
        config.settings.display.height = size.height.max(1);

        let timer = Arc::new(GameTimer::new());
        let engine = FrameEngine::initialize(Arc::new(device), output, timer.clone(), config)?;

        Ok(ViewerState {
            engine,
            timer,
            window,
            shown_fps: 0,
        })
    }
}

impl ApplicationHandler for Viewer {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.state.is_some() {
            return;
        }

        match self.create_state(event_loop) {
            Ok(state) => {
                info!("Viewer ready on {}", state.engine.adapter_info().name);
                self.state = Some(state);
            }
            Err(e) => {
                error!("Failed to initialize viewer: {e:#}");
                event_loop.exit();
            }
        }
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, _id: WindowId, event: WindowEvent) {
        let Some(state) = &mut self.state else {
            return;
        };

        match event {
            WindowEvent::CloseRequested
            | WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(KeyCode::Escape),
                        state: ElementState::Pressed,
                        ..
                    },
                ..
            } => {
                info!("Close requested");
                if let Some(mut state) = self.state.take() {
                    if let Err(e) = state.engine.shutdown() {
                        warn!("Engine shutdown failed: {e}");
                    }
                }
                event_loop.exit();
            }
            WindowEvent::Resized(size) => state.resize(size),
            WindowEvent::KeyboardInput {
                event:
                    KeyEvent {
                        physical_key: PhysicalKey::Code(code),
                        state: ElementState::Pressed,
                        repeat: false,
                        ..
                    },
                ..
            } => state.handle_key(code),
            WindowEvent::RedrawRequested => {
                if let Err(e) = state.frame() {
                    error!("Frame failed: {e}");
                    if e.is_fatal() {
                        event_loop.exit();
                    }
                }
            }
            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(state) = &self.state {
            state.window.request_redraw();
        }
    }
}

impl ViewerState {
    fn frame(&mut self) -> Result<(), GpuError> {
        self.timer.tick();
        match self.engine.render_frame() {
            Ok(_) => {}
            Err(GpuError::SurfaceOutOfDate) => {
                self.resize(self.window.inner_size());
                return Ok(());
            }
            Err(e) => return Err(e),
        }
        self.engine.present_frame()?;

        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        let fps = self.engine.frame_stats().fps.round() as u32;
        if fps != self.shown_fps {
            self.shown_fps = fps;
            self.window.set_title(&format!("{TITLE} - {fps} fps"));
        }
        Ok(())
    }

    fn resize(&mut self, size: PhysicalSize<u32>) {
        // Minimised
        if size.width == 0 || size.height == 0 {
            return;
        }
        let mut display = self.engine.settings().display;
        display.width = size.width;
        display.height = size.height;
        if let Err(e) = self.engine.set_display_settings(display) {
            error!("Resize to {}x{} failed: {e}", size.width, size.height);
        }
    }

    fn handle_key(&mut self, code: KeyCode) {
        let settings = *self.engine.settings();
        let result = match code {
            KeyCode::KeyM => {
                let anti_aliasing = if settings.anti_aliasing.mode == AntiAliasingMode::Msaa {
                    AntiAliasingSettings::default()
                } else {
                    AntiAliasingSettings::msaa(MSAA_SAMPLES)
                };
                info!("Anti-aliasing: {:?}", anti_aliasing.mode);
                self.engine.set_anti_aliasing_settings(anti_aliasing)
            }
            KeyCode::Digit1 | KeyCode::Digit2 | KeyCode::Digit3 | KeyCode::Digit4 => {
                let quality = match code {
                    KeyCode::Digit1 => ShadowQuality::Low,
                    KeyCode::Digit2 => ShadowQuality::Medium,
                    KeyCode::Digit3 => ShadowQuality::High,
                    _ => ShadowQuality::Ultra,
                };
                info!("Shadow quality: {:?}", quality);
                self.engine.set_shadow_settings(ShadowSettings {
                    quality,
                    ..settings.shadows
                })
            }
            KeyCode::KeyV => {
                let mut requested = settings.display;
                requested.vsync = !requested.vsync;
                info!("Vsync: {}", requested.vsync);
                self.engine.set_display_settings(requested)
            }
            _ => return,
        };

        if let Err(e) = result {
            error!("Settings change failed: {e}");
        }
    }
}
