// =============================================================================
// ETNA DEMO - clear screen, SSBO upload, per-frame skinning matrices
// =============================================================================
//
// FRAME FLOW:
// 1. Upload this frame's joint matrices (staging copy, blocking)
// 2. Acquire swapchain image
// 3. Record the render pass (clear only)
// 4. Submit + present
// 5. Advance the frame cursor
//
// =============================================================================

use anyhow::{Context, Result};
use ash::vk;
use etna::{AllocatedBuffer, Config, ContextDesc, GpuContext};
use glam::{Mat4, Vec3};
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, EventLoop},
    window::{Window, WindowAttributes},
};

const PATTERN_LEN: usize = 256;
const JOINT_COUNT: usize = 32;

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    let config = Config::load();
    init_logging(&config);
    log::info!("Starting etna demo");
    log::info!(
        "Window: {}x{}, {} frames in flight",
        config.window.width,
        config.window.height,
        config.frames_in_flight()
    );

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;
    match app.error.take() {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_logging(config: &Config) {
    let env = env_logger::Env::default().default_filter_or(config.debug.log_level.as_str());
    env_logger::Builder::from_env(env).init();
}

// =============================================================================
// GPU RESOURCES OWNED BY THE DEMO
// =============================================================================

struct DemoBuffers {
    pattern: AllocatedBuffer,
    joints: AllocatedBuffer,
}

impl DemoBuffers {
    fn new(ctx: &mut GpuContext) -> Result<Self> {
        let pattern = ctx.create_ssbo(PATTERN_LEN as vk::DeviceSize)?;
        let joints = match ctx.create_ssbo(std::mem::size_of::<[Mat4; JOINT_COUNT]>() as vk::DeviceSize) {
            Ok(joints) => joints,
            Err(e) => {
                ctx.destroy_buffer(pattern);
                return Err(e.into());
            }
        };
        let buffers = Self { pattern, joints };

        if let Err(e) = buffers.check_pattern_round_trip(ctx) {
            buffers.destroy(ctx);
            return Err(e);
        }
        Ok(buffers)
    }

    /// Upload 0x00..=0xFF and read it back through the staging path.
    fn check_pattern_round_trip(&self, ctx: &mut GpuContext) -> Result<()> {
        let bytes: Vec<u8> = (0..PATTERN_LEN).map(|i| i as u8).collect();
        ctx.upload_to_device_local(&self.pattern, &bytes)
            .context("SSBO upload failed")?;
        let read = ctx
            .read_back(&self.pattern, PATTERN_LEN)
            .context("SSBO readback failed")?;
        anyhow::ensure!(read == bytes, "SSBO readback does not match the upload");
        log::info!("{}-byte SSBO round trip verified", PATTERN_LEN);
        Ok(())
    }

    fn upload_joints(&self, ctx: &mut GpuContext, time: f32) -> Result<()> {
        let joints: Vec<Mat4> = (0..JOINT_COUNT)
            .map(|i| {
                let bend = (time + i as f32 * 0.2).sin() * 0.3;
                Mat4::from_translation(Vec3::new(0.0, i as f32 * 0.1, 0.0))
                    * Mat4::from_rotation_z(bend)
            })
            .collect();
        ctx.upload_slice(&self.joints, &joints)?;
        Ok(())
    }

    fn destroy(self, ctx: &GpuContext) {
        ctx.destroy_buffer(self.pattern);
        ctx.destroy_buffer(self.joints);
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Buffers go before the context, the context before the window.
struct App {
    config: Config,
    buffers: Option<DemoBuffers>,
    ctx: Option<GpuContext>,
    window: Option<Arc<Window>>,
    error: Option<anyhow::Error>,

    start_time: Instant,
    frame_count: u32,
    last_fps_update: Instant,
}

impl App {
    fn new(config: Config) -> Self {
        let now = Instant::now();
        Self {
            config,
            buffers: None,
            ctx: None,
            window: None,
            error: None,
            start_time: now,
            frame_count: 0,
            last_fps_update: now,
        }
    }

    fn init_gpu(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");
        let size = window.inner_size();
        let desc = ContextDesc::from(&self.config);

        let mut ctx = GpuContext::startup(
            &desc,
            window,
            vk::Extent2D {
                width: size.width,
                height: size.height,
            },
        )
        .context("GPU context startup failed")?;

        let buffers = DemoBuffers::new(&mut ctx)?;
        self.buffers = Some(buffers);
        self.ctx = Some(ctx);
        Ok(())
    }

    fn render_frame(&mut self) -> Result<bool> {
        let (Some(ctx), Some(buffers)) = (self.ctx.as_mut(), self.buffers.as_ref()) else {
            return Ok(false);
        };
        if ctx.is_minimized() {
            return Ok(false);
        }

        buffers.upload_joints(ctx, self.start_time.elapsed().as_secs_f32())?;

        let drawn = ctx.draw_frame(self.config.graphics.clear_color, |_, _, _| {
            // Clear only; the render pass does the work.
        })?;
        Ok(drawn)
    }

    fn update_fps(&mut self) {
        self.frame_count += 1;
        let elapsed = self.last_fps_update.elapsed().as_secs_f32();
        if elapsed < 1.0 {
            return;
        }
        if let Some(window) = &self.window {
            window.set_title(&format!(
                "{} - {:.0} FPS",
                self.config.window.title,
                self.frame_count as f32 / elapsed
            ));
        }
        self.frame_count = 0;
        self.last_fps_update = Instant::now();
    }

    fn shutdown(&mut self) {
        if let Some(mut ctx) = self.ctx.take() {
            if let Err(e) = ctx.device().wait_idle() {
                log::error!("Device not idle at shutdown: {}", e);
            }
            if let Some(buffers) = self.buffers.take() {
                buffers.destroy(&ctx);
            }
            ctx.shutdown();
        }
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:#}", error);
        self.error = Some(error);
        self.shutdown();
        event_loop.exit();
    }
}

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::Error::new(e).context("Failed to create window"));
                return;
            }
        };

        if let Err(e) = self.init_gpu(&window) {
            self.fail(event_loop, e);
            return;
        }
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                self.shutdown();
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                if let Some(ctx) = self.ctx.as_mut() {
                    ctx.resize(vk::Extent2D {
                        width: size.width,
                        height: size.height,
                    });
                }
            }

            WindowEvent::RedrawRequested => match self.render_frame() {
                Ok(true) => self.update_fps(),
                Ok(false) => {}
                Err(e) => self.fail(event_loop, e.context("Render error")),
            },

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed()
                    && event.physical_key == PhysicalKey::Code(KeyCode::Escape)
                {
                    log::info!("ESC pressed, exiting...");
                    self.shutdown();
                    event_loop.exit();
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if let Some(window) = &self.window {
            window.request_redraw();
        }
    }
}

impl Drop for App {
    fn drop(&mut self) {
        self.shutdown();
    }
}
