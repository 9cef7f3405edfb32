// src/render_target.rs
//! Offscreen color + depth target owned by a view.
//!
//! Each frame the forward drawer walks the view's shader sets, the meshes
//! instanced in the view and their models, culls against the view frustum,
//! buckets the survivors and records them into a render bundle held by the
//! target's secondary command ring. The surface then replays that bundle in
//! a pass that clears to the view's clear color.

use std::collections::HashMap;
use std::sync::Arc;

use glam::Mat4;

use crate::culling::{world_sphere, Frustum};
use crate::draw::{clip_depth, DrawBuckets, DrawEncoder, DrawRecord, SubmitStats};
use crate::mesh::{GpuMesh, MeshShape};
use crate::model::{InstantiatedModel, ModelId, ModelState};
use crate::ring_buffer::{CommandLevel, CommandRingBuffer};
use crate::shader::{PipelineKind, PipelineSet};
use crate::texture::{linear_sampler, Attachment};

/// What a view's target draws each frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DrawerType {
    /// Forward-shaded meshes.
    #[default]
    GameForward,
    /// Only the clear color.
    Clear,
}

// ============================================================================
// 1. LIFECYCLE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetState {
    Uninitialized,
    Ready,
    Resizing,
    Destroyed,
}

/// Tracks whether attachments exist and how many times they were rebuilt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TargetLifecycle {
    state: TargetState,
    extent: (u32, u32),
    pending: (u32, u32),
    generation: u64,
}

impl Default for TargetLifecycle {
    fn default() -> Self {
        Self {
            state: TargetState::Uninitialized,
            extent: (0, 0),
            pending: (0, 0),
            generation: 0,
        }
    }
}

impl TargetLifecycle {
    pub fn state(&self) -> TargetState {
        self.state
    }

    pub fn extent(&self) -> (u32, u32) {
        self.extent
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// False (and no state change) for a zero-area extent or a destroyed target.
    pub fn begin_resize(&mut self, extent: (u32, u32)) -> bool {
        if extent.0 == 0 || extent.1 == 0 {
            log::debug!("ignoring resize to {}x{}", extent.0, extent.1);
            return false;
        }
        if self.state == TargetState::Destroyed {
            log::warn!("resize requested on a destroyed render target");
            return false;
        }
        self.state = TargetState::Resizing;
        self.pending = extent;
        true
    }

    pub fn finish_resize(&mut self) {
        debug_assert_eq!(self.state, TargetState::Resizing);
        self.extent = self.pending;
        self.generation += 1;
        self.state = TargetState::Ready;
    }

    pub fn destroy(&mut self) {
        self.state = TargetState::Destroyed;
    }
}

// ============================================================================
// 2. FORWARD DRAW COLLECTION
// ============================================================================

/// One submesh of one model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrawItem {
    pub model: ModelId,
    pub submesh: usize,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GatherStats {
    pub queued: usize,
    pub culled: usize,
    pub hidden: usize,
}

/// Walk shader sets, then meshes, then the submeshes of each mesh drawn with
/// that set, then the mesh's models, queueing every visible draw.
pub fn gather_draws<M: MeshShape>(
    buckets: &mut DrawBuckets<DrawItem>,
    view_projection: Mat4,
    shaders: &[&str],
    instances: &[(&M, Vec<&ModelState>)],
) -> GatherStats {
    let frustum = Frustum::from_view_projection(&view_projection);
    let mut stats = GatherStats::default();

    for (shader_index, shader) in shaders.iter().enumerate() {
        for (mesh, models) in instances {
            if models.is_empty() {
                continue;
            }
            for &submesh in mesh.submeshes_using(shader) {
                let Some(bounds) = mesh.bounds(submesh) else {
                    continue;
                };
                for model in models {
                    if !model.is_visible() {
                        stats.hidden += 1;
                        continue;
                    }
                    let transform = model.transform();
                    let (center, radius) = world_sphere(&transform, bounds.center(), bounds.radius());
                    if !frustum.intersects_sphere(center, radius) {
                        stats.culled += 1;
                        continue;
                    }
                    buckets.push(
                        model.draw_kind().bucket(),
                        DrawRecord {
                            shader: shader_index,
                            line_width: model.line_width(),
                            depth: clip_depth(&view_projection, &transform),
                            item: DrawItem {
                                model: model.id(),
                                submesh,
                            },
                        },
                    );
                    stats.queued += 1;
                }
            }
        }
    }
    stats
}

/// Everything one view's forward pass reads.
pub struct ForwardFrame<'a> {
    pub view_projection: Mat4,
    /// Shader sets the view uses, in draw order.
    pub shaders: &'a [Arc<PipelineSet>],
    pub instances: Vec<(&'a GpuMesh, Vec<&'a ModelState>)>,
    pub models: &'a HashMap<ModelId, InstantiatedModel>,
}

struct BundleDrawEncoder<'e> {
    encoder: wgpu::RenderBundleEncoder<'e>,
    shaders: &'e [Arc<PipelineSet>],
    models: &'e HashMap<ModelId, InstantiatedModel>,
}

impl<'e> DrawEncoder<DrawItem> for BundleDrawEncoder<'e> {
    fn bind_pipeline(&mut self, shader: usize, kind: PipelineKind) {
        let shaders: &'e [Arc<PipelineSet>] = self.shaders;
        if let Some(set) = shaders.get(shader) {
            self.encoder.set_pipeline(set.pipeline(kind));
        }
    }

    fn set_line_width(&mut self, width: f32) {
        // wgpu rasterizes lines one pixel wide
        log::trace!("line width {width} requested");
    }

    fn draw(&mut self, _shader: usize, item: &DrawItem) {
        let models: &'e HashMap<ModelId, InstantiatedModel> = self.models;
        let Some(model) = models.get(&item.model) else {
            return;
        };
        let (Some(submesh), Some(bind_group)) = (model.mesh.submesh(item.submesh), model.gpu.bind_group(item.submesh))
        else {
            return;
        };
        self.encoder.set_bind_group(0, bind_group, &[]);
        self.encoder.set_vertex_buffer(0, submesh.vertex_buffer.slice(..));
        self.encoder.set_index_buffer(submesh.index_buffer.slice(..), wgpu::IndexFormat::Uint32);
        self.encoder.draw_indexed(0..submesh.index_count, 0, 0..1);
    }
}

// ============================================================================
// 3. GPU TARGET
// ============================================================================

pub struct RenderTarget {
    label: String,
    device: Arc<wgpu::Device>,
    lifecycle: TargetLifecycle,
    color_format: wgpu::TextureFormat,
    depth_format: wgpu::TextureFormat,
    color: Option<Attachment>,
    depth: Option<Attachment>,
    sampler: wgpu::Sampler,
    commands: CommandRingBuffer,
    buckets: DrawBuckets<DrawItem>,
    drawer: DrawerType,
}

impl RenderTarget {
    pub fn new(
        device: &Arc<wgpu::Device>,
        label: &str,
        color_format: wgpu::TextureFormat,
        depth_format: wgpu::TextureFormat,
        ring_size: usize,
        drawer: DrawerType,
    ) -> Self {
        Self {
            label: label.to_string(),
            device: device.clone(),
            lifecycle: TargetLifecycle::default(),
            color_format,
            depth_format,
            color: None,
            depth: None,
            sampler: linear_sampler(device, &format!("{label}_sampler"), wgpu::AddressMode::ClampToEdge),
            commands: CommandRingBuffer::commands(device, label, ring_size, CommandLevel::Secondary),
            buckets: DrawBuckets::new(),
            drawer,
        }
    }

    pub fn state(&self) -> TargetState {
        self.lifecycle.state()
    }

    pub fn extent(&self) -> (u32, u32) {
        self.lifecycle.extent()
    }

    pub fn generation(&self) -> u64 {
        self.lifecycle.generation()
    }

    pub fn drawer(&self) -> DrawerType {
        self.drawer
    }

    pub fn set_drawer(&mut self, drawer: DrawerType) {
        self.drawer = drawer;
    }

    pub fn color_view(&self) -> Option<&wgpu::TextureView> {
        self.color.as_ref().map(|a| &a.view)
    }

    pub fn sampler(&self) -> &wgpu::Sampler {
        &self.sampler
    }

    /// Rebuild attachments at `extent`. A zero extent leaves the target as it was.
    pub fn resize(&mut self, extent: (u32, u32)) -> bool {
        if !self.lifecycle.begin_resize(extent) {
            return false;
        }
        self.color = Some(Attachment::new(
            &self.device,
            &format!("{}_color", self.label),
            extent,
            self.color_format,
            true,
        ));
        self.depth = Some(Attachment::new(
            &self.device,
            &format!("{}_depth", self.label),
            extent,
            self.depth_format,
            false,
        ));
        self.lifecycle.finish_resize();
        log::debug!(
            "render target `{}` is {}x{} (generation {})",
            self.label,
            extent.0,
            extent.1,
            self.generation()
        );
        true
    }

    pub fn destroy(&mut self) {
        self.color = None;
        self.depth = None;
        self.buckets.clear();
        self.lifecycle.destroy();
    }

    /// Record this frame's draws into the next secondary slot.
    pub fn render_full(&mut self, frame: &ForwardFrame<'_>) -> SubmitStats {
        let slot = self.commands.advance();
        if self.drawer == DrawerType::Clear || self.lifecycle.state() != TargetState::Ready {
            return SubmitStats::default();
        }

        let names: Vec<&str> = frame.shaders.iter().map(|s| s.name()).collect();
        let gathered = gather_draws(&mut self.buckets, frame.view_projection, &names, &frame.instances);
        log::trace!("`{}`: {:?}", self.label, gathered);

        let label = slot.label().to_string();
        let mut encoder = BundleDrawEncoder {
            encoder: self.device.create_render_bundle_encoder(&wgpu::RenderBundleEncoderDescriptor {
                label: Some(&label),
                color_formats: &[Some(self.color_format)],
                depth_stencil: Some(wgpu::RenderBundleDepthStencil {
                    format: self.depth_format,
                    depth_read_only: false,
                    stencil_read_only: false,
                }),
                sample_count: 1,
                multiview: None,
            }),
            shaders: frame.shaders,
            models: frame.models,
        };
        let stats = self.buckets.submit(&mut encoder);
        slot.set_bundle(encoder.encoder.finish(&wgpu::RenderBundleDescriptor { label: Some(&label) }));
        stats
    }

    /// Clear to `clear` and replay the bundle recorded by [`render_full`](Self::render_full).
    pub fn encode_pass(&self, encoder: &mut wgpu::CommandEncoder, clear: wgpu::Color) {
        let (Some(color), Some(depth)) = (&self.color, &self.depth) else {
            return;
        };
        let stencil_ops = self.depth_format.has_stencil_aspect().then_some(wgpu::Operations {
            load: wgpu::LoadOp::Clear(0),
            store: wgpu::StoreOp::Store,
        });

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(&self.label),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &color.view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(clear),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &depth.view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Clear(1.0),
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        if self.drawer == DrawerType::GameForward {
            if let Some(bundle) = self.commands.current().bundle() {
                pass.execute_bundles(std::iter::once(bundle));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dirty::DirtySet;
    use crate::draw::BucketKind;
    use crate::mesh::{Dimension, MaterialUniform};
    use crate::model::DrawKind;
    use crate::view::ViewId;
    use glam::Vec3;

    struct TestMesh {
        name: &'static str,
        by_shader: Vec<(&'static str, Vec<usize>)>,
    }

    impl MeshShape for TestMesh {
        fn name(&self) -> &str {
            self.name
        }

        fn submeshes_using(&self, shader: &str) -> &[usize] {
            self.by_shader
                .iter()
                .find(|(s, _)| *s == shader)
                .map(|(_, v)| v.as_slice())
                .unwrap_or(&[])
        }

        fn bounds(&self, _submesh: usize) -> Option<Dimension> {
            Some(Dimension {
                min: Vec3::splat(-0.5),
                max: Vec3::splat(0.5),
            })
        }
    }

    fn camera() -> Mat4 {
        Mat4::perspective_rh(90f32.to_radians(), 1.0, 0.1, 100.0) * Mat4::look_at_rh(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y)
    }

    fn model(set: &DirtySet<ModelId>, id: u64, at: Vec3, kind: DrawKind) -> ModelState {
        let mut m = ModelState::new(ModelId(id), ViewId(0), "m", kind, vec![MaterialUniform::default()], set.tracker());
        m.set_transform(Mat4::from_translation(at));
        m
    }

    #[test]
    fn zero_extent_resize_is_a_no_op() {
        let mut lifecycle = TargetLifecycle::default();
        assert!(lifecycle.begin_resize((640, 480)));
        lifecycle.finish_resize();

        assert!(!lifecycle.begin_resize((0, 0)));
        assert!(!lifecycle.begin_resize((800, 0)));
        assert_eq!(lifecycle.state(), TargetState::Ready);
        assert_eq!(lifecycle.extent(), (640, 480));
        assert_eq!(lifecycle.generation(), 1);
    }

    #[test]
    fn every_rebuild_bumps_the_generation() {
        let mut lifecycle = TargetLifecycle::default();
        assert_eq!(lifecycle.state(), TargetState::Uninitialized);
        for (i, extent) in [(100, 100), (200, 150), (200, 150)].into_iter().enumerate() {
            assert!(lifecycle.begin_resize(extent));
            assert_eq!(lifecycle.state(), TargetState::Resizing);
            lifecycle.finish_resize();
            assert_eq!(lifecycle.generation(), i as u64 + 1);
        }
        lifecycle.destroy();
        assert!(!lifecycle.begin_resize((10, 10)));
        assert_eq!(lifecycle.state(), TargetState::Destroyed);
    }

    #[test]
    fn gather_skips_hidden_and_culled_models() {
        let set = DirtySet::new();
        let mesh = TestMesh {
            name: "crate",
            by_shader: vec![("phong", vec![0])],
        };
        let visible = model(&set, 1, Vec3::new(0.0, 0.0, -5.0), DrawKind::Triangles);
        let behind = model(&set, 2, Vec3::new(0.0, 0.0, 5.0), DrawKind::Triangles);
        let mut hidden = model(&set, 3, Vec3::new(0.0, 0.0, -5.0), DrawKind::Triangles);
        hidden.set_visible(false);

        let mut buckets = DrawBuckets::new();
        let stats = gather_draws(
            &mut buckets,
            camera(),
            &["phong"],
            &[(&mesh, vec![&visible, &behind, &hidden])],
        );

        assert_eq!(stats, GatherStats { queued: 1, culled: 1, hidden: 1 });
        let opaque = buckets.bucket(BucketKind::Opaque).records();
        assert_eq!(opaque[0].item, DrawItem { model: ModelId(1), submesh: 0 });
    }

    #[test]
    fn gather_walks_shader_then_mesh_then_submesh() {
        let set = DirtySet::new();
        let ship = TestMesh {
            name: "ship",
            by_shader: vec![("phong", vec![0, 2]), ("glass", vec![1])],
        };
        let rock = TestMesh {
            name: "rock",
            by_shader: vec![("phong", vec![0])],
        };
        let a = model(&set, 10, Vec3::new(0.0, 0.0, -4.0), DrawKind::Triangles);
        let b = model(&set, 20, Vec3::new(1.0, 0.0, -6.0), DrawKind::Triangles);

        let mut buckets = DrawBuckets::new();
        gather_draws(
            &mut buckets,
            camera(),
            &["phong", "glass"],
            &[(&ship, vec![&a]), (&rock, vec![&b])],
        );

        let order: Vec<(usize, u64, usize)> = buckets
            .bucket(BucketKind::Opaque)
            .records()
            .iter()
            .map(|r| (r.shader, r.item.model.0, r.item.submesh))
            .collect();
        assert_eq!(order, vec![(0, 10, 0), (0, 10, 2), (0, 20, 0), (1, 10, 1)]);
    }

    #[test]
    fn draw_kind_picks_the_bucket() {
        let set = DirtySet::new();
        let mesh = TestMesh {
            name: "fx",
            by_shader: vec![("fx", vec![0])],
        };
        let glow = model(&set, 1, Vec3::new(0.0, 0.0, -3.0), DrawKind::AdditiveBlend);
        let wire = model(&set, 2, Vec3::new(0.0, 0.0, -3.0), DrawKind::Wireframe);

        let mut buckets = DrawBuckets::new();
        gather_draws(&mut buckets, camera(), &["fx"], &[(&mesh, vec![&glow, &wire])]);

        assert_eq!(buckets.bucket(BucketKind::Additive).records().len(), 1);
        assert_eq!(buckets.bucket(BucketKind::Curves).records().len(), 1);
        assert!(buckets.bucket(BucketKind::Opaque).records().is_empty());
    }
}
