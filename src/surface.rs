// src/surface.rs
//! One window's swap chain and the views rendered into it.
//!
//! A host drives a surface with three calls per frame, in this order:
//!
//! 1. [`RenderedSurface::frame_update`] acquires the next swap-chain image,
//!    records every view's forward pass, composites the views and submits.
//! 2. [`RenderedSurface::present_frame`] presents that image.
//! 3. [`RenderedSurface::graphics_data_update`] uploads everything that
//!    changed on the CPU side (model, view and registry blocks) in a single
//!    submission and waits for it, so the next frame never samples a
//!    half-written buffer.
//!
//! Stale swap chains, failed acquires and minimized windows are absorbed
//! here. A failed acquire schedules a swap-chain rebuild; the frame is
//! dropped and the next one retries.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use glam::Mat4;
use winit::window::Window;

use crate::camera::{IlluminationUniform, ViewUniform};
use crate::compositor::{CombinationType, CompositeSource, ScreenCompositor};
use crate::config::ViewConfig;
use crate::context::Context;
use crate::dirty::DirtySet;
use crate::error::{Error, Result};
use crate::event_bus::{RendererEvent, SurfaceId};
use crate::influence::GpuInfluenceField;
use crate::lighting::GpuLight;
use crate::mesh::{GpuMesh, MeshData, TextureUsage};
use crate::model::{DrawKind, InstantiatedModel, ModelGpu, ModelId, ModelState};
use crate::registry::RegistryHandle;
use crate::render_target::{DrawerType, ForwardFrame};
use crate::renderer::GpuContext;
use crate::ring_buffer::{CommandLevel, CommandRingBuffer, EventRingBuffer};
use crate::shader::{FileShaderLoader, PipelineSet, ReloadSummary, ShaderCache, WgpuShaderCompiler};
use crate::texture::GpuTexture;
use crate::view::{detach_view, move_model, remove_mesh_models, remove_model, ViewData, ViewEntry, ViewId};

#[cfg(not(target_arch = "wasm32"))]
use crate::shader_watch::ShaderWatcher;

// ============================================================================
// 1. PURE HELPERS
// ============================================================================

/// `preferred` when the surface offers it, else the first sRGB format,
/// else whatever comes first.
pub fn pick_format(
    formats: &[wgpu::TextureFormat],
    preferred: Option<wgpu::TextureFormat>,
) -> Option<wgpu::TextureFormat> {
    if let Some(preferred) = preferred {
        if formats.contains(&preferred) {
            return Some(preferred);
        }
        log::warn!("surface does not support {preferred:?}; falling back");
    }
    formats
        .iter()
        .copied()
        .find(|f| f.is_srgb())
        .or_else(|| formats.first().copied())
}

/// Extents a resize applies, or `None` while the window has no area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResizePlan {
    pub swap_chain: (u32, u32),
    pub targets: (u32, u32),
}

impl ResizePlan {
    pub fn new(window: (u32, u32), super_sampling: u32) -> Option<Self> {
        if window.0 == 0 || window.1 == 0 {
            return None;
        }
        let factor = super_sampling.max(1);
        Some(Self {
            swap_chain: window,
            targets: (window.0.saturating_mul(factor), window.1.saturating_mul(factor)),
        })
    }
}

/// `#define`s every forward shader set is built with.
pub fn capacity_defines(max_lights: usize, max_fields: usize) -> Vec<String> {
    vec![
        format!("#define LIGHT_CAPACITY {}", max_lights.max(1)),
        format!("#define FIELD_CAPACITY {}", max_fields.max(1)),
    ]
}

// ============================================================================
// 2. HANDLES
// ============================================================================

/// A light living in one view's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LightHandle {
    pub view: ViewId,
    entry: RegistryHandle,
}

/// An influence field living in one view's registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FieldHandle {
    pub view: ViewId,
    entry: RegistryHandle,
}

// ============================================================================
// 3. SURFACE
// ============================================================================

pub struct RenderedSurface {
    id: SurfaceId,
    context: Arc<GpuContext>,
    window: Arc<Window>,
    surface: wgpu::Surface<'static>,
    surface_config: wgpu::SurfaceConfiguration,
    resize_pending: bool,
    frame: Option<wgpu::SurfaceTexture>,

    views: BTreeMap<ViewId, ViewData>,
    next_view: u32,
    models: HashMap<ModelId, InstantiatedModel>,
    next_model: u64,
    dirty: DirtySet<ModelId>,

    shaders: ShaderCache<PipelineSet>,
    loader: FileShaderLoader,
    compiler: WgpuShaderCompiler,
    compositor: ScreenCompositor,

    render_commands: CommandRingBuffer,
    transfer_commands: CommandRingBuffer,
    frame_events: EventRingBuffer,

    #[cfg(not(target_arch = "wasm32"))]
    watcher: Option<ShaderWatcher>,
}

impl RenderedSurface {
    pub fn new(id: SurfaceId, context: Arc<GpuContext>, window: Arc<Window>) -> Result<Self> {
        let config = &context.config;
        let device = &context.device;

        let surface = context.instance.create_surface(window.clone())?;
        let caps = surface.get_capabilities(&context.adapter);
        let format = pick_format(&caps.formats, config.color_format).ok_or(Error::AdapterUnavailable)?;
        let size = window.inner_size();

        let surface_config = wgpu::SurfaceConfiguration {
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT,
            format,
            width: size.width.max(1),
            height: size.height.max(1),
            present_mode: if caps.present_modes.contains(&config.present_mode) {
                config.present_mode
            } else {
                wgpu::PresentMode::AutoVsync
            },
            alpha_mode: caps.alpha_modes.first().copied().unwrap_or(wgpu::CompositeAlphaMode::Auto),
            view_formats: vec![],
            desired_maximum_frame_latency: config.frame_latency.max(1),
        };
        surface.configure(device, &surface_config);
        log::info!(
            "surface {:?}: {:?} {}x{} ({:?})",
            id,
            format,
            surface_config.width,
            surface_config.height,
            surface_config.present_mode
        );

        #[cfg(not(target_arch = "wasm32"))]
        let watcher = if config.watch_shaders {
            ShaderWatcher::new(&config.shader_root)
                .map_err(|err| log::warn!("shader hot reload disabled: {err}"))
                .ok()
        } else {
            None
        };

        let label = format!("surface_{}", id.0);
        Ok(Self {
            id,
            window,
            surface,
            resize_pending: false,
            frame: None,
            views: BTreeMap::new(),
            next_view: 0,
            models: HashMap::new(),
            next_model: 0,
            dirty: DirtySet::new(),
            shaders: ShaderCache::new(),
            loader: FileShaderLoader::new(config.shader_root.clone()),
            compiler: WgpuShaderCompiler::new(device.clone(), format, config.depth_format),
            compositor: ScreenCompositor::new(device.clone(), format, config.compositor_clear),
            render_commands: CommandRingBuffer::commands(
                device,
                &format!("{label}_render"),
                config.render_ring_size,
                CommandLevel::Primary,
            ),
            transfer_commands: CommandRingBuffer::commands(
                device,
                &format!("{label}_transfer"),
                config.transfer_ring_size,
                CommandLevel::Primary,
            ),
            frame_events: EventRingBuffer::events(device, config.render_ring_size),
            #[cfg(not(target_arch = "wasm32"))]
            watcher,
            surface_config,
            context,
        })
    }

    pub fn id(&self) -> SurfaceId {
        self.id
    }

    pub fn window(&self) -> &Arc<Window> {
        &self.window
    }

    pub fn format(&self) -> wgpu::TextureFormat {
        self.surface_config.format
    }

    pub fn extent(&self) -> (u32, u32) {
        (self.surface_config.width, self.surface_config.height)
    }

    fn device(&self) -> &wgpu::Device {
        &self.context.device
    }

    fn publish(&self, event: RendererEvent) {
        self.context.bus.publish(event);
    }

    fn view_data(&self, view: ViewId) -> Result<&ViewData> {
        self.views.get(&view).ok_or(Error::UnknownView(view))
    }

    fn view_data_mut(&mut self, view: ViewId) -> Result<&mut ViewData> {
        self.views.get_mut(&view).ok_or(Error::UnknownView(view))
    }

    // ------------------------------------------------------------------------
    // Views
    // ------------------------------------------------------------------------

    pub fn register_view(&mut self, config: ViewConfig) -> ViewId {
        let id = ViewId(self.next_view);
        self.next_view += 1;

        let mut view = ViewData::new(&self.context.device, id, &config, &self.context.config, self.format());
        if let Some(plan) = ResizePlan::new(self.extent(), self.context.config.super_sampling) {
            view.target.resize(plan.targets);
        }
        log::info!("registered view `{}` as {:?} (order {})", config.name, id, config.order);
        self.views.insert(id, view);

        self.rebuild_compositor();
        self.publish(RendererEvent::ViewRegistered { surface: self.id, view: id });
        id
    }

    /// Models of the view are detached, not destroyed; see [`attach_model`](Self::attach_model).
    pub fn deregister_view(&mut self, view: ViewId) -> Result<()> {
        let mut data = detach_view(&mut self.views, &mut self.models, view).ok_or(Error::UnknownView(view))?;
        data.target.destroy();
        log::info!("deregistered view `{}`", data.name());

        self.rebuild_compositor();
        self.publish(RendererEvent::ViewDeregistered { surface: self.id, view });
        Ok(())
    }

    pub fn views(&self) -> impl Iterator<Item = &ViewData> {
        self.views.values()
    }

    pub fn view(&self, view: ViewId) -> Option<&ViewData> {
        self.views.get(&view)
    }

    pub fn set_view_drawing_type(&mut self, view: ViewId, drawer: DrawerType) -> Result<()> {
        self.view_data_mut(view)?.set_drawer(drawer);
        Ok(())
    }

    pub fn set_view_combination_type(&mut self, view: ViewId, combination: CombinationType) -> Result<()> {
        self.view_data_mut(view)?.set_combination(combination);
        self.rebuild_compositor();
        Ok(())
    }

    pub fn set_view_order(&mut self, view: ViewId, order: f32) -> Result<()> {
        self.view_data_mut(view)?.set_order(order);
        self.rebuild_compositor();
        Ok(())
    }

    pub fn set_view_clear_color(&mut self, view: ViewId, color: wgpu::Color) -> Result<()> {
        self.view_data_mut(view)?.set_clear_color(color);
        Ok(())
    }

    pub fn update_window_view_buffer(&mut self, view: ViewId, uniform: ViewUniform) -> Result<()> {
        self.view_data_mut(view)?.set_view_uniform(uniform);
        Ok(())
    }

    pub fn update_window_illumination_buffer(&mut self, view: ViewId, illumination: IlluminationUniform) -> Result<()> {
        self.view_data_mut(view)?.set_illumination(illumination);
        Ok(())
    }

    /// Hand the compositor every view's current color target. Failures keep
    /// the previous composite pipeline.
    fn rebuild_compositor(&mut self) {
        let sources: Vec<CompositeSource<'_>> = self
            .views
            .values()
            .filter_map(|view| {
                Some(CompositeSource {
                    input: view.composite_input(),
                    view: view.target.color_view()?,
                    sampler: view.target.sampler(),
                })
            })
            .collect();
        if let Err(err) = self.compositor.set_sources(sources) {
            log::error!("compositor rebuild failed: {err}");
        }
    }

    // ------------------------------------------------------------------------
    // Lights & influence fields
    // ------------------------------------------------------------------------

    /// `Ok(None)` when the view's light registry is full.
    pub fn create_light(&mut self, view: ViewId, light: GpuLight) -> Result<Option<LightHandle>> {
        let entry = self.view_data_mut(view)?.lights.add(light);
        Ok(entry.map(|entry| LightHandle { view, entry }))
    }

    pub fn light(&self, handle: LightHandle) -> Option<&GpuLight> {
        self.views.get(&handle.view)?.lights.get(handle.entry)
    }

    pub fn update_light(&mut self, handle: LightHandle, light: GpuLight) -> bool {
        self.views
            .get_mut(&handle.view)
            .is_some_and(|view| view.lights.update(handle.entry, light))
    }

    pub fn modify_light(&mut self, handle: LightHandle, f: impl FnOnce(&mut GpuLight)) -> bool {
        self.views
            .get_mut(&handle.view)
            .is_some_and(|view| view.lights.modify(handle.entry, f))
    }

    pub fn destroy_light(&mut self, handle: LightHandle) -> bool {
        self.views
            .get_mut(&handle.view)
            .is_some_and(|view| view.lights.remove(handle.entry).is_some())
    }

    pub fn set_lights_enabled(&mut self, view: ViewId, enabled: bool) -> Result<()> {
        self.view_data_mut(view)?.lights.set_enabled(enabled);
        Ok(())
    }

    /// `Ok(None)` when the view's field registry is full.
    pub fn create_influence_field(&mut self, view: ViewId, field: GpuInfluenceField) -> Result<Option<FieldHandle>> {
        let entry = self.view_data_mut(view)?.fields.add(field);
        Ok(entry.map(|entry| FieldHandle { view, entry }))
    }

    pub fn influence_field(&self, handle: FieldHandle) -> Option<&GpuInfluenceField> {
        self.views.get(&handle.view)?.fields.get(handle.entry)
    }

    pub fn update_influence_field(&mut self, handle: FieldHandle, field: GpuInfluenceField) -> bool {
        self.views
            .get_mut(&handle.view)
            .is_some_and(|view| view.fields.update(handle.entry, field))
    }

    pub fn destroy_influence_field(&mut self, handle: FieldHandle) -> bool {
        self.views
            .get_mut(&handle.view)
            .is_some_and(|view| view.fields.remove(handle.entry).is_some())
    }

    // ------------------------------------------------------------------------
    // Shaders
    // ------------------------------------------------------------------------

    /// Register in-memory sources for a shader set; files under the shader
    /// root still take precedence.
    pub fn add_builtin_shader(&mut self, name: &str, vertex: &str, fragment: &str) {
        self.loader.add_builtin(name, vertex, fragment);
    }

    pub fn shader_error(&self, name: &str) -> Option<&str> {
        self.shaders.last_error(name)
    }

    /// Recompile every cached shader set. Sets whose new source fails keep
    /// drawing with their previous pipelines.
    pub fn reload_all_shaders(&mut self) -> ReloadSummary {
        let summary = self.shaders.reload_all(&self.loader, &self.compiler);
        log::info!(
            "shader reload: {} reloaded, {} unchanged, {} validating, {} kept previous",
            summary.reloaded,
            summary.unchanged,
            summary.validating,
            summary.kept.len()
        );
        self.announce_reload(&summary);
        summary
    }

    /// Swap in reloaded sets the GPU has accepted since the last frame.
    fn settle_shaders(&mut self) {
        let summary = self.shaders.settle_pending();
        if summary.has_verdicts() {
            log::info!(
                "shader validation: {} reloaded, {} kept previous",
                summary.reloaded,
                summary.kept.len()
            );
            self.announce_reload(&summary);
        }
    }

    fn announce_reload(&self, summary: &ReloadSummary) {
        self.publish(RendererEvent::ShadersReloaded {
            surface: self.id,
            reloaded: summary.reloaded,
            kept: summary.kept.len(),
        });
    }

    fn shader_sets(&mut self, mesh: &GpuMesh) -> Result<Vec<Arc<PipelineSet>>> {
        let defines = capacity_defines(self.context.config.max_lights, self.context.config.max_influence_fields);
        mesh.submeshes()
            .iter()
            .map(|submesh| {
                self.shaders
                    .get_or_create(&submesh.shader, &submesh.layout, &defines, &self.loader, &self.compiler)
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Meshes & models
    // ------------------------------------------------------------------------

    /// Memoized by mesh name across every surface of the renderer.
    pub fn load_mesh(&self, data: &MeshData) -> Result<Arc<GpuMesh>> {
        self.context.load_mesh(data)
    }

    fn submesh_textures(&self, mesh: &GpuMesh) -> Result<Vec<Vec<(TextureUsage, Arc<GpuTexture>)>>> {
        mesh.submeshes()
            .iter()
            .map(|submesh| {
                submesh
                    .textures
                    .iter()
                    .map(|texture| Ok((texture.usage, self.context.texture(&texture.file)?)))
                    .collect()
            })
            .collect()
    }

    /// Instantiate the cached mesh `mesh` in `view`. Unresolvable binding
    /// slots and shader sets that fail their first build are returned here.
    pub fn create_model(&mut self, view: ViewId, mesh: &str, kind: DrawKind) -> Result<ModelId> {
        self.view_data(view)?;
        let gpu_mesh = self
            .context
            .meshes
            .lock()
            .get(mesh)
            .ok_or_else(|| Error::UnknownMesh(mesh.to_string()))?;

        let shaders = self
            .shader_sets(&gpu_mesh)
            .with_context(|| format!("building shaders for mesh `{mesh}`"))?;
        let textures = self
            .submesh_textures(&gpu_mesh)
            .with_context(|| format!("loading textures for mesh `{mesh}`"))?;

        let id = ModelId(self.next_model);
        let state = ModelState::new(
            id,
            view,
            mesh,
            kind,
            gpu_mesh.submeshes().iter().map(|s| s.material).collect(),
            self.dirty.tracker(),
        );
        let mut gpu = ModelGpu::new(self.device(), &state, textures);

        let data = self.views.get_mut(&view).ok_or(Error::UnknownView(view))?;
        gpu.bind(&self.context.device, &gpu_mesh, &shaders, data.bindings())
            .with_context(|| format!("creating model of mesh `{mesh}`"))?;
        for shader in &shaders {
            data.use_shader(shader.name());
        }
        data.models.add(mesh, id);

        self.next_model += 1;
        self.models.insert(
            id,
            InstantiatedModel {
                state,
                mesh: gpu_mesh,
                gpu,
            },
        );
        log::debug!("created model {:?} of `{mesh}` in {:?}", id, view);
        Ok(id)
    }

    /// Move a model into `view`, rebinding it to that view's buffers.
    pub fn attach_model(&mut self, model: ModelId, view: ViewId) -> Result<()> {
        let mesh = self.models.get(&model).ok_or(Error::UnknownModel(model))?.mesh.clone();
        self.view_data(view)?;

        let shaders = self.shader_sets(&mesh)?;
        let (Some(instance), Some(data)) = (self.models.get_mut(&model), self.views.get_mut(&view)) else {
            return Err(Error::UnknownModel(model));
        };
        instance.gpu.bind(&self.context.device, &mesh, &shaders, data.bindings())?;
        for shader in &shaders {
            data.use_shader(shader.name());
        }
        move_model(&mut self.views, &mut self.models, model, view)
    }

    pub fn model(&self, model: ModelId) -> Option<&ModelState> {
        self.models.get(&model).map(|m| &m.state)
    }

    /// Setters on the returned state are uploaded by the next
    /// [`graphics_data_update`](Self::graphics_data_update).
    pub fn model_mut(&mut self, model: ModelId) -> Option<&mut ModelState> {
        self.models.get_mut(&model).map(|m| &mut m.state)
    }

    pub fn model_count(&self) -> usize {
        self.models.len()
    }

    pub fn destroy_model(&mut self, model: ModelId) -> bool {
        if remove_model(&mut self.views, &mut self.models, model).is_none() {
            return false;
        }
        self.dirty.tracker().forget(model);
        true
    }

    /// Destroy every model of `mesh` on this surface and evict the mesh from
    /// the shared cache. Returns how many models were destroyed.
    pub fn destroy_mesh_and_models(&mut self, mesh: &str) -> usize {
        let doomed = remove_mesh_models(&mut self.views, &mut self.models, mesh);
        let tracker = self.dirty.tracker();
        for (model, _) in &doomed {
            tracker.forget(*model);
        }
        self.context.meshes.lock().remove(mesh);
        log::debug!("destroyed mesh `{mesh}` and {} models", doomed.len());
        doomed.len()
    }

    // ------------------------------------------------------------------------
    // Resize
    // ------------------------------------------------------------------------

    /// Schedule a swap-chain rebuild before the next acquire.
    pub fn request_resize(&mut self) {
        self.resize_pending = true;
    }

    /// Returns whether anything was rebuilt. A window without area leaves
    /// every GPU object untouched and keeps the resize pending.
    fn resize_internal(&mut self) -> bool {
        let size = self.window.inner_size();
        let Some(plan) = ResizePlan::new((size.width, size.height), self.context.config.super_sampling) else {
            log::debug!("window has no area; resize deferred");
            self.resize_pending = true;
            return false;
        };
        self.resize_pending = false;

        let _ = self.context.device.poll(wgpu::Maintain::Wait);
        self.surface_config.width = plan.swap_chain.0;
        self.surface_config.height = plan.swap_chain.1;
        self.surface.configure(&self.context.device, &self.surface_config);

        for view in self.views.values_mut() {
            view.target.resize(plan.targets);
        }
        self.rebuild_compositor();

        log::debug!(
            "surface {:?} resized to {}x{} (targets {}x{})",
            self.id,
            plan.swap_chain.0,
            plan.swap_chain.1,
            plan.targets.0,
            plan.targets.1
        );
        self.publish(RendererEvent::Resized {
            surface: self.id,
            extent: plan.swap_chain,
        });
        true
    }

    // ------------------------------------------------------------------------
    // Per-frame entry points
    // ------------------------------------------------------------------------

    /// Acquire, draw every view, composite and submit. The image is held
    /// until [`present_frame`](Self::present_frame).
    pub fn frame_update(&mut self) {
        #[cfg(not(target_arch = "wasm32"))]
        if self.watcher.as_mut().is_some_and(|w| w.poll()) {
            self.reload_all_shaders();
        }
        self.settle_shaders();

        if self.frame.is_some() {
            log::warn!("frame_update called twice without present_frame");
            return;
        }
        if self.resize_pending && !self.resize_internal() {
            return;
        }

        let frame = match self.surface.get_current_texture() {
            Ok(frame) => frame,
            Err(err) => {
                // stale extent or not, a rebuilt swap chain is the retry path
                log::warn!("surface {:?}: failed to acquire image ({err}); resizing", self.id);
                self.resize_pending = true;
                return;
            }
        };
        let target = frame.texture.create_view(&wgpu::TextureViewDescriptor::default());

        self.record_views();

        let slot = self.render_commands.advance();
        let mut encoder = slot.encoder();
        for view in self.views.values() {
            view.target.encode_pass(&mut encoder, view.clear_color());
        }
        self.compositor.render(&mut encoder, &target);

        let index = self.context.queue.submit(std::iter::once(encoder.finish()));
        slot.submitted(index);
        self.frame_events.advance().arm(&self.context.queue);
        self.frame = Some(frame);
    }

    /// Each view's forward drawer records into its target's bundle ring.
    fn record_views(&mut self) {
        let models = &self.models;
        for view in self.views.values_mut() {
            if view.drawer() != DrawerType::GameForward {
                view.target.render_full(&ForwardFrame {
                    view_projection: Mat4::IDENTITY,
                    shaders: &[],
                    instances: Vec::new(),
                    models,
                });
                continue;
            }

            let shaders: Vec<Arc<PipelineSet>> = view.shaders().iter().filter_map(|name| self.shaders.get(name)).collect();
            let view_projection = view.view_uniform().view_projection();

            let instances: Vec<(&GpuMesh, Vec<&ModelState>)> = view
                .models
                .iter()
                .filter_map(|(_, ids)| {
                    let instances: Vec<&InstantiatedModel> = ids.iter().filter_map(|id| models.get(id)).collect();
                    let mesh: &GpuMesh = &instances.first().copied()?.mesh;
                    Some((mesh, instances.into_iter().map(|m| &m.state).collect()))
                })
                .collect();

            let stats = view.target.render_full(&ForwardFrame {
                view_projection,
                shaders: &shaders,
                instances,
                models,
            });
            log::trace!("view {:?}: {} draws, {} pipeline binds", view.id(), stats.draws, stats.pipeline_binds);
        }
    }

    /// Present the image acquired by [`frame_update`](Self::frame_update).
    /// A suboptimal swap chain is rebuilt before the next acquire.
    pub fn present_frame(&mut self) {
        let Some(frame) = self.frame.take() else {
            return;
        };
        let suboptimal = frame.suboptimal;
        self.window.pre_present_notify();
        frame.present();
        if suboptimal {
            log::debug!("surface {:?} is suboptimal; resizing", self.id);
            self.resize_pending = true;
        }
    }

    /// Upload every pending model, view and registry block in one submission
    /// and wait for it.
    pub fn graphics_data_update(&mut self) {
        let device = &self.context.device;
        let slot = self.transfer_commands.advance();
        let mut encoder = slot.encoder();
        let mut wrote = false;

        for model in self.dirty.drain() {
            if let Some(instance) = self.models.get_mut(&model) {
                wrote |= instance.flush(device, &mut encoder, slot);
            }
        }
        for view in self.views.values_mut() {
            wrote |= view.flush(device, &mut encoder, slot);
        }
        if !wrote {
            return;
        }

        let index = self.context.queue.submit(std::iter::once(encoder.finish()));
        let _ = device.poll(wgpu::Maintain::WaitForSubmissionIndex(index.clone()));
        slot.submitted(index);
    }
}

impl Drop for RenderedSurface {
    fn drop(&mut self) {
        self.frame = None;
        let _ = self.context.device.poll(wgpu::Maintain::Wait);
        log::debug!("surface {:?} destroyed", self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::compositor::{CompositeInput, CompositeList};
    use crate::view::{ModelBuckets, PlacedModel};
    use wgpu::TextureFormat;

    struct BareView {
        input: CompositeInput,
        models: ModelBuckets,
    }

    impl ViewEntry for BareView {
        fn composite_input(&self) -> CompositeInput {
            self.input.clone()
        }

        fn model_buckets(&mut self) -> &mut ModelBuckets {
            &mut self.models
        }
    }

    /// Views `main`, `overlay`, `minimap` registered in that order with
    /// orders 3, 1 and 2.
    fn three_views() -> BTreeMap<ViewId, BareView> {
        [("main", 3.0), ("overlay", 1.0), ("minimap", 2.0)]
            .into_iter()
            .enumerate()
            .map(|(i, (name, order))| {
                let view = BareView {
                    input: CompositeInput {
                        name: name.to_string(),
                        order,
                        combination: CombinationType::AlphaBlend,
                    },
                    models: ModelBuckets::default(),
                };
                (ViewId(i as u32), view)
            })
            .collect()
    }

    fn spawn(
        views: &mut BTreeMap<ViewId, BareView>,
        models: &mut HashMap<ModelId, ModelState>,
        dirty: &DirtySet<ModelId>,
        id: u64,
        view: u32,
        mesh: &str,
    ) -> ModelId {
        let id = ModelId(id);
        let view = ViewId(view);
        models.insert(id, ModelState::new(id, view, mesh, DrawKind::Triangles, Vec::new(), dirty.tracker()));
        views.get_mut(&view).unwrap().models.add(mesh, id);
        id
    }

    fn arranged(views: &BTreeMap<ViewId, BareView>, list: &mut CompositeList) -> (bool, Vec<String>) {
        let mut inputs: Vec<CompositeInput> = views.values().map(ViewEntry::composite_input).collect();
        let changed = list.arrange(&mut inputs, |input| input);
        (changed, list.inputs().iter().map(|i| i.name.clone()).collect())
    }

    #[test]
    fn views_reach_the_compositor_by_order() {
        let mut views = three_views();
        let mut list = CompositeList::default();

        let (changed, names) = arranged(&views, &mut list);
        assert!(changed);
        assert_eq!(names, vec!["overlay", "minimap", "main"]);
        let orders: Vec<f32> = list.inputs().iter().map(|i| i.order).collect();
        assert_eq!(orders, vec![1.0, 2.0, 3.0]);

        views.get_mut(&ViewId(0)).unwrap().input.order = 0.5;
        let (changed, names) = arranged(&views, &mut list);
        assert!(changed);
        assert_eq!(names, vec!["main", "overlay", "minimap"]);
    }

    #[test]
    fn deregistering_a_view_detaches_its_models() {
        let mut views = three_views();
        let mut models = HashMap::new();
        let dirty = DirtySet::new();
        let cube = spawn(&mut views, &mut models, &dirty, 1, 1, "cube");
        let tree = spawn(&mut views, &mut models, &dirty, 2, 1, "tree");
        let other = spawn(&mut views, &mut models, &dirty, 3, 2, "cube");
        let mut list = CompositeList::default();
        arranged(&views, &mut list);

        let removed = detach_view(&mut views, &mut models, ViewId(1)).unwrap();
        assert!(removed.models.is_empty());
        assert_eq!(models[&cube].view(), None);
        assert_eq!(models[&tree].view(), None);
        assert_eq!(models[&other].view(), Some(ViewId(2)));
        assert_eq!(models.len(), 3);

        let (changed, names) = arranged(&views, &mut list);
        assert!(changed);
        assert_eq!(names, vec!["minimap", "main"]);
        assert!(detach_view(&mut views, &mut models, ViewId(1)).is_none());

        // a detached model can be picked up by a live view again
        move_model(&mut views, &mut models, cube, ViewId(0)).unwrap();
        assert_eq!(models[&cube].placement(), Some(ViewId(0)));
        assert_eq!(views[&ViewId(0)].models.models_of("cube"), &[cube]);
    }

    #[test]
    fn destroying_a_mesh_clears_it_from_every_view() {
        let mut views = three_views();
        let mut models = HashMap::new();
        let dirty = DirtySet::new();
        let a = spawn(&mut views, &mut models, &dirty, 1, 0, "cube");
        let b = spawn(&mut views, &mut models, &dirty, 2, 2, "cube");
        let tree = spawn(&mut views, &mut models, &dirty, 3, 2, "tree");

        let removed: Vec<ModelId> = remove_mesh_models(&mut views, &mut models, "cube")
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        assert_eq!(removed, vec![a, b]);
        for view in views.values() {
            assert!(view.models.models_of("cube").is_empty());
            assert!(!view.models.contains(a) && !view.models.contains(b));
        }
        assert_eq!(views[&ViewId(2)].models.models_of("tree"), &[tree]);
        assert_eq!(models.len(), 1);
    }

    #[test]
    fn moving_a_model_leaves_its_old_view() {
        let mut views = three_views();
        let mut models = HashMap::new();
        let dirty = DirtySet::new();
        let cube = spawn(&mut views, &mut models, &dirty, 1, 0, "cube");

        move_model(&mut views, &mut models, cube, ViewId(2)).unwrap();
        assert!(!views[&ViewId(0)].models.contains(cube));
        assert_eq!(views[&ViewId(2)].models.models_of("cube"), &[cube]);
        assert_eq!(models[&cube].view(), Some(ViewId(2)));

        let err = move_model(&mut views, &mut models, cube, ViewId(9)).unwrap_err();
        assert!(matches!(err, Error::UnknownView(ViewId(9))));
        assert_eq!(models[&cube].view(), Some(ViewId(2)));

        assert!(remove_model(&mut views, &mut models, cube).is_some());
        assert!(views.values().all(|v| v.models.is_empty()));
        assert!(remove_model(&mut views, &mut models, cube).is_none());
    }

    #[test]
    fn zero_extent_produces_no_resize_plan() {
        assert_eq!(ResizePlan::new((0, 0), 1), None);
        assert_eq!(ResizePlan::new((800, 0), 2), None);
        assert_eq!(ResizePlan::new((0, 600), 2), None);
    }

    #[test]
    fn targets_scale_with_super_sampling() {
        let plan = ResizePlan::new((800, 600), 2).unwrap();
        assert_eq!(plan.swap_chain, (800, 600));
        assert_eq!(plan.targets, (1600, 1200));

        let plan = ResizePlan::new((800, 600), 0).unwrap();
        assert_eq!(plan.targets, (800, 600));
    }

    #[test]
    fn format_prefers_the_requested_then_srgb() {
        let formats = [TextureFormat::Bgra8Unorm, TextureFormat::Bgra8UnormSrgb];

        assert_eq!(pick_format(&formats, None), Some(TextureFormat::Bgra8UnormSrgb));
        assert_eq!(
            pick_format(&formats, Some(TextureFormat::Bgra8Unorm)),
            Some(TextureFormat::Bgra8Unorm)
        );
        assert_eq!(
            pick_format(&formats, Some(TextureFormat::Rgba16Float)),
            Some(TextureFormat::Bgra8UnormSrgb)
        );
        assert_eq!(pick_format(&[TextureFormat::Rgba8Unorm], None), Some(TextureFormat::Rgba8Unorm));
        assert_eq!(pick_format(&[], None), None);
    }

    #[test]
    fn capacity_defines_are_never_zero() {
        assert_eq!(
            capacity_defines(64, 0),
            vec!["#define LIGHT_CAPACITY 64".to_string(), "#define FIELD_CAPACITY 1".to_string()]
        );
    }
}
