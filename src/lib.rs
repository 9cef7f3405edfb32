// src/lib.rs
//! Multi-view frame renderer on wgpu.
//!
//! A [`Renderer`] owns the device and one [`RenderedSurface`] per window.
//! Each surface renders any number of views into offscreen targets and
//! composites them, in view order, into the swap-chain image.

pub mod binding;
pub mod camera;
pub mod compositor;
pub mod config;
pub mod context;
pub mod culling;
pub mod dirty;
pub mod draw;
pub mod error;
pub mod event_bus;
pub mod influence;
pub mod lighting;
pub mod logging;
pub mod mesh;
pub mod model;
pub mod preprocess;
pub mod registry;
pub mod render_target;
pub mod renderer;
pub mod ring_buffer;
pub mod shader;
#[cfg(not(target_arch = "wasm32"))]
pub mod shader_watch;
pub mod surface;
pub mod texture;
pub mod view;

pub use camera::{Camera, IlluminationUniform, ViewUniform};
pub use compositor::CombinationType;
pub use config::{RendererConfig, ViewConfig};
pub use error::{Error, Result};
pub use event_bus::{RendererEvent, SurfaceId};
pub use influence::GpuInfluenceField;
pub use lighting::GpuLight;
pub use mesh::{MeshData, SubmeshData, TextureUsage, Vertex};
pub use model::{DrawKind, ModelId};
pub use render_target::DrawerType;
pub use renderer::Renderer;
pub use surface::RenderedSurface;
pub use view::ViewId;

use std::sync::Arc;

use glam::{Mat4, Vec3, Vec4};
use winit::{
    application::ApplicationHandler,
    event::{ElementState, WindowEvent},
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    keyboard::{Key, ModifiersState},
    window::{Window, WindowId},
};

#[cfg(target_arch = "wasm32")]
use wasm_bindgen::prelude::*;

#[cfg(target_arch = "wasm32")]
use winit::platform::web::WindowExtWebSys;

const DEMO_SHADER: &str = "flat";
const DEMO_VERT: &str = include_str!("../shaders/flat.vert.wgsl");
const DEMO_FRAG: &str = include_str!("../shaders/flat.frag.wgsl");

#[cfg(target_arch = "wasm32")]
#[wasm_bindgen(start)]
pub async fn run() {
    std::panic::set_hook(Box::new(console_error_panic_hook::hook));
    logging::init_logging(&logging::LoggingConfig::default());
    if let Err(err) = run_inner(RendererConfig::default()).await {
        log::error!("renderer failed: {err}");
    }
}

#[cfg(not(target_arch = "wasm32"))]
pub fn run_native(config: RendererConfig) -> Result<()> {
    pollster::block_on(run_inner(config))
}

// ----------------------------------------------------------------------------
// Demo host: one window, one view, a spinning cube
// ----------------------------------------------------------------------------

struct DemoScene {
    surface: SurfaceId,
    view: ViewId,
    model: ModelId,
}

struct DemoApp {
    renderer: Renderer,
    window: Option<Arc<Window>>,
    scene: Option<DemoScene>,
    camera: Camera,
    modifiers: ModifiersState,
    frame: u64,
}

impl DemoApp {
    fn build_scene(&mut self, window: Arc<Window>) -> Result<DemoScene> {
        let size = window.inner_size();
        self.camera.set_extent(size.width, size.height);

        let surface = self.renderer.create_surface(window)?;
        let Some(rendered) = self.renderer.surface_mut(surface) else {
            return Err(Error::msg("surface vanished right after creation"));
        };

        rendered.add_builtin_shader(DEMO_SHADER, DEMO_VERT, DEMO_FRAG);
        let view = rendered.register_view(
            ViewConfig::new("main", 0.0).with_clear_color(wgpu::Color {
                r: 0.08,
                g: 0.12,
                b: 0.18,
                a: 1.0,
            }),
        );
        rendered.update_window_illumination_buffer(
            view,
            IlluminationUniform::default()
                .with_camera(self.camera.eye)
                .with_ambient(Vec4::new(0.15, 0.15, 0.2, 1.0)),
        )?;
        rendered.create_light(view, GpuLight::directional(Vec3::new(-0.4, -1.0, -0.6), Vec4::ONE, 0.9))?;
        rendered.create_light(view, GpuLight::point(Vec3::new(2.0, 1.5, 2.0), Vec4::new(1.0, 0.6, 0.3, 1.0), 0.6))?;

        rendered.load_mesh(&MeshData::cube("cube", DEMO_SHADER))?;
        let model = rendered.create_model(view, "cube", DrawKind::Triangles)?;
        if let Some(state) = rendered.model_mut(model) {
            state.set_color(Vec4::new(0.9, 0.85, 0.8, 1.0));
        }

        Ok(DemoScene { surface, view, model })
    }

    fn update_scene(&mut self) {
        let Some(scene) = &self.scene else {
            return;
        };
        let Some(surface) = self.renderer.surface_mut(scene.surface) else {
            return;
        };

        let angle = self.frame as f32 * 0.01;
        if let Some(state) = surface.model_mut(scene.model) {
            state.set_transform(Mat4::from_rotation_y(angle) * Mat4::from_rotation_x(angle * 0.5));
        }
        if let Err(err) = surface.update_window_view_buffer(scene.view, self.camera.uniform()) {
            log::warn!("demo view is gone: {err}");
        }
        self.frame += 1;
    }
}

impl ApplicationHandler for DemoApp {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        event_loop.set_control_flow(ControlFlow::Poll);
        if self.window.is_some() {
            return;
        }

        let attrs = Window::default_attributes().with_title("slop_render");
        let window = match event_loop.create_window(attrs) {
            Ok(window) => Arc::new(window),
            Err(err) => {
                log::error!("failed to create window: {err}");
                event_loop.exit();
                return;
            }
        };

        #[cfg(target_arch = "wasm32")]
        attach_canvas(&window);

        match self.build_scene(window.clone()) {
            Ok(scene) => self.scene = Some(scene),
            Err(err) => {
                log::error!("failed to build demo scene: {err}");
                event_loop.exit();
                return;
            }
        }
        window.request_redraw();
        self.window = Some(window);
    }

    fn window_event(&mut self, event_loop: &ActiveEventLoop, window_id: WindowId, event: WindowEvent) {
        let Some(window) = self.window.clone() else {
            return;
        };
        if window.id() != window_id {
            return;
        }

        match event {
            WindowEvent::CloseRequested => {
                if let Some(scene) = self.scene.take() {
                    self.renderer.destroy_surface(scene.surface);
                }
                event_loop.exit();
            }
            WindowEvent::Resized(size) => {
                self.camera.set_extent(size.width, size.height);
                if let Some(surface) = self.scene.as_ref().and_then(|s| self.renderer.surface_mut(s.surface)) {
                    surface.request_resize();
                }
            }
            WindowEvent::ModifiersChanged(modifiers) => {
                self.modifiers = modifiers.state();
            }
            WindowEvent::KeyboardInput { event, .. } => {
                let reload = event.state == ElementState::Pressed
                    && self.modifiers.control_key()
                    && matches!(event.logical_key.as_ref(), Key::Character("r") | Key::Character("R"));
                if reload {
                    if let Some(surface) = self.scene.as_ref().and_then(|s| self.renderer.surface_mut(s.surface)) {
                        surface.reload_all_shaders();
                    }
                }
            }
            WindowEvent::RedrawRequested => {
                self.update_scene();
                self.renderer.render_all();
                window.request_redraw();
            }
            _ => {}
        }
    }
}

#[cfg(target_arch = "wasm32")]
fn attach_canvas(window: &Window) {
    let Some(canvas) = window.canvas() else {
        log::error!("winit window has no canvas");
        return;
    };
    let canvas: web_sys::Element = canvas.into();
    let Some(document) = web_sys::window().and_then(|w| w.document()) else {
        log::error!("no document to attach the canvas to");
        return;
    };
    let parent = document
        .get_element_by_id("slop-container")
        .or_else(|| document.body().map(Into::into));
    if let Some(parent) = parent {
        if parent.append_child(&canvas).is_err() {
            log::error!("failed to attach canvas");
        }
    }
}

async fn run_inner(config: RendererConfig) -> Result<()> {
    let event_loop = EventLoop::new().map_err(|err| Error::custom(format!("creating event loop: {err}")))?;
    let renderer = Renderer::new(config).await?;

    let mut app = DemoApp {
        renderer,
        window: None,
        scene: None,
        camera: Camera::new(Vec3::new(2.5, 2.0, 3.0), Vec3::ZERO, 16.0 / 9.0),
        modifiers: ModifiersState::default(),
        frame: 0,
    };

    // The browser owns the loop on the web; run_app would block it.
    #[cfg(target_arch = "wasm32")]
    {
        use winit::platform::web::EventLoopExtWebSys;
        event_loop.spawn_app(app);
    }

    #[cfg(not(target_arch = "wasm32"))]
    {
        event_loop
            .run_app(&mut app)
            .map_err(|err| Error::custom(format!("event loop failed: {err}")))?;
    }

    Ok(())
}
