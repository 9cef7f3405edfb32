// src/renderer.rs
//! The per-process rendering context and the surfaces it drives.

use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use winit::window::Window;

use crate::config::RendererConfig;
use crate::error::{Error, Result};
use crate::event_bus::{EventBus, Subscription, SurfaceId};
use crate::mesh::{GpuMesh, MeshCache, MeshData};
use crate::surface::RenderedSurface;
use crate::texture::{GpuTexture, TextureCache};

/// Device-level state shared by every surface.
pub struct GpuContext {
    pub instance: wgpu::Instance,
    pub adapter: wgpu::Adapter,
    pub device: Arc<wgpu::Device>,
    pub queue: Arc<wgpu::Queue>,
    pub bus: EventBus,
    pub meshes: Mutex<MeshCache<GpuMesh>>,
    pub textures: Mutex<TextureCache>,
    pub config: RendererConfig,
}

impl GpuContext {
    pub async fn new(config: RendererConfig) -> Result<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            dx12_shader_compiler: Default::default(),
            flags: wgpu::InstanceFlags::from_build_config(),
            gles_minor_version: wgpu::Gles3MinorVersion::Automatic,
        });

        // No surface exists yet; presentation support is checked per window.
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or(Error::AdapterUnavailable)?;
        log::info!("using adapter {:?}", adapter.get_info());

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("slop_render_device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: if cfg!(target_arch = "wasm32") {
                        wgpu::Limits::downlevel_webgl2_defaults().using_resolution(adapter.limits())
                    } else {
                        wgpu::Limits::default()
                    },
                    memory_hints: Default::default(),
                },
                None,
            )
            .await?;

        Ok(Self {
            instance,
            adapter,
            device: Arc::new(device),
            queue: Arc::new(queue),
            bus: EventBus::default(),
            meshes: Mutex::new(MeshCache::new()),
            textures: Mutex::new(TextureCache::new(config.texture_root.clone())),
            config,
        })
    }

    /// Upload `data` unless a mesh of the same name is already cached.
    pub fn load_mesh(&self, data: &MeshData) -> Result<Arc<GpuMesh>> {
        self.meshes
            .lock()
            .get_or_create(&data.name, || Ok(GpuMesh::upload(&self.device, data)))
    }

    pub fn texture(&self, name: &str) -> Result<Arc<GpuTexture>> {
        self.textures.lock().get_or_load(&self.device, &self.queue, name)
    }

    /// Register a texture from raw RGBA8 pixels under `name`.
    pub fn insert_texture(&self, name: &str, width: u32, height: u32, rgba: &[u8]) -> Result<Arc<GpuTexture>> {
        let texture = GpuTexture::from_rgba(&self.device, &self.queue, rgba, width, height, name)?;
        Ok(self.textures.lock().insert(name, texture))
    }
}

/// Owns the [`GpuContext`] and one [`RenderedSurface`] per renderable window.
pub struct Renderer {
    context: Arc<GpuContext>,
    surfaces: BTreeMap<SurfaceId, RenderedSurface>,
    next_surface: u32,
}

impl Renderer {
    pub async fn new(config: RendererConfig) -> Result<Self> {
        Ok(Self {
            context: Arc::new(GpuContext::new(config).await?),
            surfaces: BTreeMap::new(),
            next_surface: 0,
        })
    }

    pub fn context(&self) -> &Arc<GpuContext> {
        &self.context
    }

    pub fn subscribe(&self) -> Subscription {
        self.context.bus.subscribe()
    }

    /// Make `window` renderable.
    pub fn create_surface(&mut self, window: Arc<Window>) -> Result<SurfaceId> {
        let id = SurfaceId(self.next_surface);
        let surface = RenderedSurface::new(id, self.context.clone(), window)?;
        self.next_surface += 1;
        self.surfaces.insert(id, surface);
        Ok(id)
    }

    pub fn destroy_surface(&mut self, id: SurfaceId) -> bool {
        // dropping the surface waits for its in-flight work
        let removed = self.surfaces.remove(&id).is_some();
        if removed {
            self.context.meshes.lock().purge_unused();
        }
        removed
    }

    pub fn surface(&self, id: SurfaceId) -> Option<&RenderedSurface> {
        self.surfaces.get(&id)
    }

    pub fn surface_mut(&mut self, id: SurfaceId) -> Option<&mut RenderedSurface> {
        self.surfaces.get_mut(&id)
    }

    /// Every live surface, in creation order.
    pub fn windows(&self) -> impl Iterator<Item = SurfaceId> + '_ {
        self.surfaces.keys().copied()
    }

    /// Run the three per-frame entry points on every surface.
    pub fn render_all(&mut self) {
        for surface in self.surfaces.values_mut() {
            surface.frame_update();
            surface.present_frame();
            surface.graphics_data_update();
        }
    }
}
