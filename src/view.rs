// src/view.rs
//! Per-view state owned by a surface.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use wgpu::util::DeviceExt;

use crate::camera::{IlluminationUniform, ViewUniform};
use crate::compositor::{CombinationType, CompositeInput};
use crate::config::{RendererConfig, ViewConfig};
use crate::error::{Error, Result};
use crate::influence::{create_field_registry, FieldRegistry};
use crate::lighting::{create_light_registry, LightRegistry};
use crate::model::{ModelId, ViewBindings};
use crate::registry::{EncoderUpload, UploadSink};
use crate::render_target::{DrawerType, RenderTarget};
use crate::ring_buffer::CommandSlot;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ViewId(pub u32);

/// Models instanced in a view, grouped by the mesh they draw.
#[derive(Debug, Clone, Default)]
pub struct ModelBuckets {
    by_mesh: BTreeMap<String, Vec<ModelId>>,
}

impl ModelBuckets {
    pub fn add(&mut self, mesh: &str, model: ModelId) {
        let models = self.by_mesh.entry(mesh.to_string()).or_default();
        if !models.contains(&model) {
            models.push(model);
        }
    }

    /// Empty mesh entries are dropped so the drawer never visits them.
    pub fn remove(&mut self, mesh: &str, model: ModelId) -> bool {
        let Some(models) = self.by_mesh.get_mut(mesh) else {
            return false;
        };
        let before = models.len();
        models.retain(|m| *m != model);
        let removed = models.len() != before;
        if models.is_empty() {
            self.by_mesh.remove(mesh);
        }
        removed
    }

    pub fn remove_mesh(&mut self, mesh: &str) -> Vec<ModelId> {
        self.by_mesh.remove(mesh).unwrap_or_default()
    }

    /// Every model id, leaving the buckets empty.
    pub fn take_all(&mut self) -> Vec<ModelId> {
        std::mem::take(&mut self.by_mesh).into_values().flatten().collect()
    }

    pub fn models_of(&self, mesh: &str) -> &[ModelId] {
        self.by_mesh.get(mesh).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ModelId])> {
        self.by_mesh.iter().map(|(mesh, models)| (mesh.as_str(), models.as_slice()))
    }

    pub fn contains(&self, model: ModelId) -> bool {
        self.by_mesh.values().any(|models| models.contains(&model))
    }

    pub fn len(&self) -> usize {
        self.by_mesh.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_mesh.is_empty()
    }
}

// ----------------------------------------------------------------------------
// Membership
// ----------------------------------------------------------------------------

/// The part of a view that view and model bookkeeping touches.
pub trait ViewEntry {
    fn composite_input(&self) -> CompositeInput;
    fn model_buckets(&mut self) -> &mut ModelBuckets;
}

/// A model as far as view membership goes.
pub trait PlacedModel {
    fn mesh(&self) -> &str;
    fn placement(&self) -> Option<ViewId>;
    fn place(&mut self, view: Option<ViewId>);
}

/// Remove `view` and detach its models. The caller releases whatever GPU
/// objects the returned view owns.
pub fn detach_view<V: ViewEntry, M: PlacedModel>(
    views: &mut BTreeMap<ViewId, V>,
    models: &mut HashMap<ModelId, M>,
    view: ViewId,
) -> Option<V> {
    let mut data = views.remove(&view)?;
    for id in data.model_buckets().take_all() {
        if let Some(model) = models.get_mut(&id) {
            model.place(None);
        }
    }
    Some(data)
}

/// Forget `model`, including its place in its view.
pub fn remove_model<V: ViewEntry, M: PlacedModel>(
    views: &mut BTreeMap<ViewId, V>,
    models: &mut HashMap<ModelId, M>,
    model: ModelId,
) -> Option<M> {
    let removed = models.remove(&model)?;
    if let Some(view) = removed.placement().and_then(|v| views.get_mut(&v)) {
        view.model_buckets().remove(removed.mesh(), model);
    }
    Some(removed)
}

/// Forget every model of `mesh` and drop the mesh from every view. Removed
/// models come back in id order.
pub fn remove_mesh_models<V: ViewEntry, M: PlacedModel>(
    views: &mut BTreeMap<ViewId, V>,
    models: &mut HashMap<ModelId, M>,
    mesh: &str,
) -> Vec<(ModelId, M)> {
    let mut doomed: Vec<ModelId> = models
        .iter()
        .filter(|(_, m)| m.mesh() == mesh)
        .map(|(id, _)| *id)
        .collect();
    doomed.sort();
    for view in views.values_mut() {
        view.model_buckets().remove_mesh(mesh);
    }
    doomed
        .into_iter()
        .filter_map(|id| models.remove(&id).map(|m| (id, m)))
        .collect()
}

/// Record that `model` now draws in `view`; the view it left forgets it.
pub fn move_model<V: ViewEntry, M: PlacedModel>(
    views: &mut BTreeMap<ViewId, V>,
    models: &mut HashMap<ModelId, M>,
    model: ModelId,
    view: ViewId,
) -> Result<()> {
    let entry = models.get_mut(&model).ok_or(Error::UnknownModel(model))?;
    let target = views.get_mut(&view).ok_or(Error::UnknownView(view))?;
    target.model_buckets().add(entry.mesh(), model);

    let previous = entry.placement();
    entry.place(Some(view));
    if let Some(previous) = previous.filter(|p| *p != view) {
        if let Some(old) = views.get_mut(&previous) {
            old.model_buckets().remove(entry.mesh(), model);
        }
    }
    Ok(())
}

pub struct ViewData {
    id: ViewId,
    name: String,
    order: f32,
    clear_color: wgpu::Color,
    combination: CombinationType,

    view_uniform: ViewUniform,
    illumination: IlluminationUniform,
    view_buffer: wgpu::Buffer,
    illumination_buffer: wgpu::Buffer,
    view_dirty: bool,
    illumination_dirty: bool,

    pub lights: LightRegistry,
    pub fields: FieldRegistry,

    /// Shader sets drawn in this view, in first-use order.
    shaders: Vec<String>,
    pub models: ModelBuckets,
    pub target: RenderTarget,
}

impl ViewData {
    pub fn new(
        device: &Arc<wgpu::Device>,
        id: ViewId,
        view: &ViewConfig,
        config: &RendererConfig,
        color_format: wgpu::TextureFormat,
    ) -> Self {
        let view_uniform = ViewUniform::default();
        let illumination = IlluminationUniform::default();
        let label = format!("view_{}_{}", id.0, view.name);

        Self {
            id,
            name: view.name.clone(),
            order: view.order,
            clear_color: view.clear_color,
            combination: view.combination,
            view_buffer: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{label}_ubo")),
                contents: bytemuck::bytes_of(&view_uniform),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            }),
            illumination_buffer: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                label: Some(&format!("{label}_illumination")),
                contents: bytemuck::bytes_of(&illumination),
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
            }),
            view_uniform,
            illumination,
            view_dirty: false,
            illumination_dirty: false,
            lights: create_light_registry(device, config.max_lights),
            fields: create_field_registry(device, config.max_influence_fields),
            shaders: Vec::new(),
            models: ModelBuckets::default(),
            target: RenderTarget::new(
                device,
                &label,
                color_format,
                config.depth_format,
                config.render_ring_size,
                view.drawer,
            ),
        }
    }

    pub fn id(&self) -> ViewId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn order(&self) -> f32 {
        self.order
    }

    pub fn set_order(&mut self, order: f32) {
        self.order = order;
    }

    pub fn clear_color(&self) -> wgpu::Color {
        self.clear_color
    }

    pub fn set_clear_color(&mut self, color: wgpu::Color) {
        self.clear_color = color;
    }

    pub fn combination(&self) -> CombinationType {
        self.combination
    }

    pub fn set_combination(&mut self, combination: CombinationType) {
        self.combination = combination;
    }

    pub fn drawer(&self) -> DrawerType {
        self.target.drawer()
    }

    pub fn set_drawer(&mut self, drawer: DrawerType) {
        self.target.set_drawer(drawer);
    }

    pub fn view_uniform(&self) -> &ViewUniform {
        &self.view_uniform
    }

    pub fn set_view_uniform(&mut self, uniform: ViewUniform) {
        self.view_uniform = uniform;
        self.view_dirty = true;
    }

    pub fn illumination(&self) -> &IlluminationUniform {
        &self.illumination
    }

    pub fn set_illumination(&mut self, illumination: IlluminationUniform) {
        self.illumination = illumination;
        self.illumination_dirty = true;
    }

    pub fn shaders(&self) -> &[String] {
        &self.shaders
    }

    pub fn use_shader(&mut self, name: &str) {
        if !self.shaders.iter().any(|s| s == name) {
            self.shaders.push(name.to_string());
        }
    }

    pub fn bindings(&self) -> ViewBindings<'_> {
        ViewBindings {
            view: &self.view_buffer,
            illumination: &self.illumination_buffer,
            lights: self.lights.buffer(),
            fields: self.fields.buffer(),
        }
    }

    /// Record writes for every view-owned block that changed.
    pub fn flush(&mut self, device: &wgpu::Device, encoder: &mut wgpu::CommandEncoder, slot: &mut CommandSlot) -> bool {
        let mut wrote = false;
        if std::mem::take(&mut self.view_dirty) {
            EncoderUpload {
                device,
                encoder: &mut *encoder,
                slot: &mut *slot,
                target: &self.view_buffer,
            }
            .write_bytes(0, bytemuck::bytes_of(&self.view_uniform));
            wrote = true;
        }
        if std::mem::take(&mut self.illumination_dirty) {
            EncoderUpload {
                device,
                encoder: &mut *encoder,
                slot: &mut *slot,
                target: &self.illumination_buffer,
            }
            .write_bytes(0, bytemuck::bytes_of(&self.illumination));
            wrote = true;
        }
        wrote |= self.lights.flush(device, encoder, slot);
        wrote |= self.fields.flush(device, encoder, slot);
        wrote
    }
}

impl ViewEntry for ViewData {
    fn composite_input(&self) -> CompositeInput {
        CompositeInput {
            name: self.name.clone(),
            order: self.order,
            combination: self.combination,
        }
    }

    fn model_buckets(&mut self) -> &mut ModelBuckets {
        &mut self.models
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_group_models_by_mesh() {
        let mut buckets = ModelBuckets::default();
        buckets.add("cube", ModelId(1));
        buckets.add("cube", ModelId(2));
        buckets.add("tree", ModelId(3));
        buckets.add("cube", ModelId(1));

        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets.models_of("cube"), &[ModelId(1), ModelId(2)]);
        assert!(buckets.contains(ModelId(3)));
    }

    #[test]
    fn removing_the_last_model_drops_the_mesh_entry() {
        let mut buckets = ModelBuckets::default();
        buckets.add("cube", ModelId(1));

        assert!(!buckets.remove("cube", ModelId(9)));
        assert!(buckets.remove("cube", ModelId(1)));
        assert!(buckets.is_empty());
        assert_eq!(buckets.iter().count(), 0);
    }

    #[test]
    fn take_all_detaches_everything() {
        let mut buckets = ModelBuckets::default();
        buckets.add("cube", ModelId(1));
        buckets.add("tree", ModelId(2));

        let mut taken = buckets.take_all();
        taken.sort();
        assert_eq!(taken, vec![ModelId(1), ModelId(2)]);
        assert!(buckets.is_empty());
    }

    #[test]
    fn remove_mesh_returns_its_models() {
        let mut buckets = ModelBuckets::default();
        buckets.add("cube", ModelId(1));
        buckets.add("tree", ModelId(2));

        assert_eq!(buckets.remove_mesh("cube"), vec![ModelId(1)]);
        assert!(buckets.remove_mesh("cube").is_empty());
        assert_eq!(buckets.len(), 1);
    }
}
