// src/model.rs
//! Instantiated models: a mesh placed in a view with its own uniforms.
//!
//! [`ModelState`] is the host-facing half. Setters only touch CPU copies and
//! mark the model in the surface's dirty set; the GPU half ([`ModelGpu`])
//! writes the changed blocks during the next upload pass.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec4};
use wgpu::util::DeviceExt;

use crate::binding::{self, create_bind_group, resolve_slots, BindingSlot, SlotResolver, SlotResource};
use crate::dirty::DirtyTracker;
use crate::draw::BucketKind;
use crate::error::Result;
use crate::mesh::{GpuMesh, MaterialUniform, TextureUsage};
use crate::registry::{EncoderUpload, UploadSink};
use crate::ring_buffer::CommandSlot;
use crate::shader::{PipelineKind, PipelineSet};
use crate::texture::GpuTexture;
use crate::view::{PlacedModel, ViewId};

pub const MAX_BONES: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ModelId(pub u64);

/// How a model's submeshes are rasterized and blended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum DrawKind {
    #[default]
    Triangles,
    Lines,
    Curves,
    /// Drawn with the line-strip pipeline.
    Wireframe,
    NoCull,
    AdditiveBlend,
    AlphaBlend,
}

impl DrawKind {
    pub fn bucket(self) -> BucketKind {
        match self {
            DrawKind::Triangles => BucketKind::Opaque,
            DrawKind::Lines => BucketKind::Lines,
            DrawKind::Curves | DrawKind::Wireframe => BucketKind::Curves,
            DrawKind::NoCull => BucketKind::NoCull,
            DrawKind::AdditiveBlend => BucketKind::Additive,
            DrawKind::AlphaBlend => BucketKind::AlphaBlend,
        }
    }

    pub fn pipeline(self) -> PipelineKind {
        self.bucket().pipeline()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Uniform blocks
// ─────────────────────────────────────────────────────────────────────────────

/// Bound as `UBO_MODEL`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct ModelUniform {
    pub model: [[f32; 4]; 4],
    pub diffuse_color: [f32; 4],
}

impl Default for ModelUniform {
    fn default() -> Self {
        Self {
            model: Mat4::IDENTITY.to_cols_array_2d(),
            diffuse_color: [1.0; 4],
        }
    }
}

/// Bound as `UBO_ANIMATION_BONE`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct AnimationUniform {
    pub bones: [[[f32; 4]; 4]; MAX_BONES],
}

impl Default for AnimationUniform {
    fn default() -> Self {
        Self {
            bones: [Mat4::IDENTITY.to_cols_array_2d(); MAX_BONES],
        }
    }
}

/// Which uniform blocks changed since the last upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DirtyAspects(u8);

impl DirtyAspects {
    pub const TRANSFORM: Self = Self(1);
    pub const MATERIAL: Self = Self(1 << 1);
    pub const SUBMESH_MATERIAL: Self = Self(1 << 2);
    pub const ANIMATION: Self = Self(1 << 3);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0 && other.0 != 0
    }

    pub fn insert(&mut self, other: Self) {
        self.0 |= other.0;
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Host-facing state
// ─────────────────────────────────────────────────────────────────────────────

pub struct ModelState {
    id: ModelId,
    view: Option<ViewId>,
    mesh: String,
    kind: DrawKind,
    line_width: f32,
    visible: bool,
    uniform: ModelUniform,
    material: MaterialUniform,
    submesh_materials: Vec<MaterialUniform>,
    animation: Box<AnimationUniform>,
    pending: DirtyAspects,
    tracker: DirtyTracker<ModelId>,
}

impl ModelState {
    pub fn new(
        id: ModelId,
        view: ViewId,
        mesh: impl Into<String>,
        kind: DrawKind,
        submesh_materials: Vec<MaterialUniform>,
        tracker: DirtyTracker<ModelId>,
    ) -> Self {
        Self {
            id,
            view: Some(view),
            mesh: mesh.into(),
            kind,
            line_width: 1.0,
            visible: true,
            uniform: ModelUniform::default(),
            material: MaterialUniform::default(),
            submesh_materials,
            animation: Box::default(),
            pending: DirtyAspects::default(),
            tracker,
        }
    }

    pub fn id(&self) -> ModelId {
        self.id
    }

    /// `None` while detached from a deregistered view.
    pub fn view(&self) -> Option<ViewId> {
        self.view
    }

    pub fn mesh_name(&self) -> &str {
        &self.mesh
    }

    fn touch(&mut self, aspect: DirtyAspects) {
        self.pending.insert(aspect);
        self.tracker.mark(self.id);
    }

    pub fn transform(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.uniform.model)
    }

    pub fn set_transform(&mut self, transform: Mat4) {
        self.uniform.model = transform.to_cols_array_2d();
        self.touch(DirtyAspects::TRANSFORM);
    }

    pub fn set_color(&mut self, color: Vec4) {
        self.uniform.diffuse_color = color.to_array();
        self.touch(DirtyAspects::TRANSFORM);
    }

    pub fn uniform(&self) -> &ModelUniform {
        &self.uniform
    }

    pub fn material(&self) -> &MaterialUniform {
        &self.material
    }

    pub fn set_material(&mut self, material: MaterialUniform) {
        self.material = material;
        self.touch(DirtyAspects::MATERIAL);
    }

    pub fn submesh_material(&self, submesh: usize) -> Option<&MaterialUniform> {
        self.submesh_materials.get(submesh)
    }

    pub fn set_submesh_material(&mut self, submesh: usize, material: MaterialUniform) -> bool {
        match self.submesh_materials.get_mut(submesh) {
            Some(slot) => {
                *slot = material;
                self.touch(DirtyAspects::SUBMESH_MATERIAL);
                true
            }
            None => false,
        }
    }

    pub fn animation(&self) -> &AnimationUniform {
        &self.animation
    }

    /// Extra bones beyond [`MAX_BONES`] are ignored.
    pub fn set_bones(&mut self, bones: &[Mat4]) {
        for (slot, bone) in self.animation.bones.iter_mut().zip(bones) {
            *slot = bone.to_cols_array_2d();
        }
        if bones.len() > MAX_BONES {
            log::warn!("model {:?}: {} bones, only {MAX_BONES} are uploaded", self.id, bones.len());
        }
        self.touch(DirtyAspects::ANIMATION);
    }

    pub fn draw_kind(&self) -> DrawKind {
        self.kind
    }

    /// Takes effect from the next frame's bucketing.
    pub fn set_draw_kind(&mut self, kind: DrawKind) {
        self.kind = kind;
    }

    pub fn line_width(&self) -> f32 {
        self.line_width
    }

    pub fn set_line_width(&mut self, width: f32) {
        self.line_width = width.max(0.0);
    }

    pub fn is_visible(&self) -> bool {
        self.visible
    }

    pub fn set_visible(&mut self, visible: bool) {
        self.visible = visible;
    }

    pub fn pending(&self) -> DirtyAspects {
        self.pending
    }

    pub fn take_pending(&mut self) -> DirtyAspects {
        std::mem::take(&mut self.pending)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GPU half
// ─────────────────────────────────────────────────────────────────────────────

/// Per-view uniform blocks a model binds alongside its own.
#[derive(Clone, Copy)]
pub struct ViewBindings<'a> {
    pub view: &'a wgpu::Buffer,
    pub illumination: &'a wgpu::Buffer,
    pub lights: &'a wgpu::Buffer,
    pub fields: &'a wgpu::Buffer,
}

pub struct ModelGpu {
    model_buffer: wgpu::Buffer,
    material_buffer: wgpu::Buffer,
    animation_buffer: wgpu::Buffer,
    submesh_buffers: Vec<wgpu::Buffer>,
    /// `textures[i]` holds what submesh `i` samples.
    textures: Vec<Vec<(TextureUsage, Arc<GpuTexture>)>>,
    bind_groups: Vec<wgpu::BindGroup>,
}

/// A model as the surface owns it: host state, the shared mesh it draws and
/// its GPU resources.
pub struct InstantiatedModel {
    pub state: ModelState,
    pub mesh: Arc<GpuMesh>,
    pub gpu: ModelGpu,
}

impl InstantiatedModel {
    pub fn id(&self) -> ModelId {
        self.state.id
    }

    /// Upload whatever changed since the last call.
    pub fn flush(&mut self, device: &wgpu::Device, encoder: &mut wgpu::CommandEncoder, slot: &mut CommandSlot) -> bool {
        let aspects = self.state.take_pending();
        self.gpu.flush(&self.state, aspects, device, encoder, slot)
    }
}

impl PlacedModel for ModelState {
    fn mesh(&self) -> &str {
        &self.mesh
    }

    fn placement(&self) -> Option<ViewId> {
        self.view
    }

    fn place(&mut self, view: Option<ViewId>) {
        self.view = view;
    }
}

impl PlacedModel for InstantiatedModel {
    fn mesh(&self) -> &str {
        self.state.mesh_name()
    }

    fn placement(&self) -> Option<ViewId> {
        self.state.view
    }

    fn place(&mut self, view: Option<ViewId>) {
        self.state.view = view;
    }
}

fn uniform_buffer(device: &wgpu::Device, label: &str, contents: &[u8]) -> wgpu::Buffer {
    device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
        label: Some(label),
        contents,
        usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
    })
}

impl ModelGpu {
    /// Buffers start out holding the state's current values.
    pub fn new(device: &wgpu::Device, state: &ModelState, textures: Vec<Vec<(TextureUsage, Arc<GpuTexture>)>>) -> Self {
        let label = format!("model_{}", state.id.0);
        Self {
            model_buffer: uniform_buffer(device, &format!("{label}_ubo"), bytemuck::bytes_of(&state.uniform)),
            material_buffer: uniform_buffer(device, &format!("{label}_material"), bytemuck::bytes_of(&state.material)),
            animation_buffer: uniform_buffer(device, &format!("{label}_bones"), bytemuck::bytes_of(&*state.animation)),
            submesh_buffers: state
                .submesh_materials
                .iter()
                .enumerate()
                .map(|(i, m)| uniform_buffer(device, &format!("{label}_submesh_{i}"), bytemuck::bytes_of(m)))
                .collect(),
            textures,
            bind_groups: Vec::new(),
        }
    }

    /// (Re)build one bind group per submesh against `view`. Every slot of every
    /// submesh must resolve.
    pub fn bind(
        &mut self,
        device: &wgpu::Device,
        mesh: &GpuMesh,
        shaders: &[Arc<PipelineSet>],
        view: ViewBindings<'_>,
    ) -> Result<()> {
        let mut groups = Vec::with_capacity(mesh.submeshes().len());
        for (index, (submesh, shader)) in mesh.submeshes().iter().zip(shaders).enumerate() {
            let resolver = ModelSlots {
                gpu: self,
                view,
                submesh: index,
            };
            let resolved = resolve_slots(&submesh.layout, &resolver, &submesh.shader)?;
            groups.push(create_bind_group(
                device,
                &format!("{}/{}_bind_group", mesh.name(), submesh.name),
                shader.bind_group_layout(),
                &resolved,
            ));
        }
        self.bind_groups = groups;
        Ok(())
    }

    pub fn bind_group(&self, submesh: usize) -> Option<&wgpu::BindGroup> {
        self.bind_groups.get(submesh)
    }

    /// Write every block `aspects` names. Returns whether anything was recorded.
    pub fn flush(
        &self,
        state: &ModelState,
        aspects: DirtyAspects,
        device: &wgpu::Device,
        encoder: &mut wgpu::CommandEncoder,
        slot: &mut CommandSlot,
    ) -> bool {
        let mut write = |target: &wgpu::Buffer, bytes: &[u8]| {
            EncoderUpload {
                device,
                encoder: &mut *encoder,
                slot: &mut *slot,
                target,
            }
            .write_bytes(0, bytes);
        };

        if aspects.contains(DirtyAspects::TRANSFORM) {
            write(&self.model_buffer, bytemuck::bytes_of(&state.uniform));
        }
        if aspects.contains(DirtyAspects::MATERIAL) {
            write(&self.material_buffer, bytemuck::bytes_of(&state.material));
        }
        if aspects.contains(DirtyAspects::SUBMESH_MATERIAL) {
            for (buffer, material) in self.submesh_buffers.iter().zip(&state.submesh_materials) {
                write(buffer, bytemuck::bytes_of(material));
            }
        }
        if aspects.contains(DirtyAspects::ANIMATION) {
            write(&self.animation_buffer, bytemuck::bytes_of(&*state.animation));
        }
        !aspects.is_empty()
    }
}

struct ModelSlots<'a> {
    gpu: &'a ModelGpu,
    view: ViewBindings<'a>,
    submesh: usize,
}

impl<'a> SlotResolver for ModelSlots<'a> {
    type Resource = SlotResource<'a>;

    fn resolve(&self, slot: &BindingSlot) -> Option<SlotResource<'a>> {
        let buffer = match slot.name.as_str() {
            binding::VIEW => Some(self.view.view),
            binding::ILLUMINATION => Some(self.view.illumination),
            binding::LIGHTS => Some(self.view.lights),
            binding::WATER => Some(self.view.fields),
            binding::MODEL => Some(&self.gpu.model_buffer),
            binding::MODEL_MATERIAL => Some(&self.gpu.material_buffer),
            binding::ANIMATION_BONE => Some(&self.gpu.animation_buffer),
            binding::SUBMESH_MATERIAL => self.gpu.submesh_buffers.get(self.submesh),
            _ => None,
        };
        if let Some(buffer) = buffer {
            return Some(SlotResource::Buffer(buffer));
        }

        self.gpu
            .textures
            .get(self.submesh)?
            .iter()
            .find(|(usage, _)| usage.slot_name() == slot.name)
            .map(|(_, texture)| SlotResource::Texture(texture.as_ref()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::DirtySet;

    fn model(set: &DirtySet<ModelId>) -> ModelState {
        ModelState::new(
            ModelId(7),
            ViewId(0),
            "cube",
            DrawKind::Triangles,
            vec![MaterialUniform::default(); 2],
            set.tracker(),
        )
    }

    #[test]
    fn uniform_sizes_are_16_byte_multiples() {
        assert_eq!(std::mem::size_of::<ModelUniform>(), 80);
        assert_eq!(std::mem::size_of::<AnimationUniform>(), 64 * 64);
    }

    #[test]
    fn setters_mark_the_model_once_per_frame() {
        let set = DirtySet::new();
        let mut m = model(&set);

        m.set_transform(Mat4::from_translation(glam::Vec3::X));
        m.set_material(MaterialUniform::default().with_diffuse([1.0, 0.0, 0.0, 1.0]));
        m.set_color(Vec4::ONE);

        assert_eq!(set.drain(), vec![ModelId(7)]);
        let pending = m.take_pending();
        assert!(pending.contains(DirtyAspects::TRANSFORM));
        assert!(pending.contains(DirtyAspects::MATERIAL));
        assert!(!pending.contains(DirtyAspects::ANIMATION));
        assert!(m.take_pending().is_empty());
    }

    #[test]
    fn visibility_and_kind_do_not_touch_uniforms() {
        let set = DirtySet::new();
        let mut m = model(&set);
        m.set_visible(false);
        m.set_draw_kind(DrawKind::Wireframe);
        m.set_line_width(-3.0);

        assert!(set.is_empty());
        assert!(!m.is_visible());
        assert_eq!(m.draw_kind().bucket(), BucketKind::Curves);
        assert_eq!(m.line_width(), 0.0);
    }

    #[test]
    fn out_of_range_submesh_material_is_rejected() {
        let set = DirtySet::new();
        let mut m = model(&set);
        assert!(m.set_submesh_material(1, MaterialUniform::default()));
        assert!(!m.set_submesh_material(2, MaterialUniform::default()));
        assert!(m.pending().contains(DirtyAspects::SUBMESH_MATERIAL));
    }

    #[test]
    fn excess_bones_are_dropped() {
        let set = DirtySet::new();
        let mut m = model(&set);
        let bones = vec![Mat4::from_scale(glam::Vec3::splat(2.0)); MAX_BONES + 4];
        m.set_bones(&bones);
        assert_eq!(m.animation().bones[MAX_BONES - 1], bones[0].to_cols_array_2d());
    }

    #[test]
    fn draw_kinds_map_to_buckets() {
        assert_eq!(DrawKind::Triangles.bucket(), BucketKind::Opaque);
        assert_eq!(DrawKind::AlphaBlend.pipeline(), PipelineKind::AlphaBlend);
        assert_eq!(DrawKind::AdditiveBlend.pipeline(), PipelineKind::Additive);
        assert_eq!(DrawKind::Wireframe.pipeline(), PipelineKind::Curves);
    }
}
