// src/compositor.rs
//! Folds every view's render target into the swap-chain image.
//!
//! Inputs are sorted by view order (ascending, ties keep registration order)
//! and blended front to back in a generated fragment shader, one
//! `textureSample` per input. The shader and pipeline are rebuilt whenever
//! the set of inputs changes; a resize only rebinds the new target images.

use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use wgpu::util::DeviceExt;

use crate::binding::{create_bind_group, BindingLayout, SlotResource};
use crate::error::{Error, Result};
use crate::preprocess::preprocess;
use crate::shader::{finish_validation, Validation};

/// How a view's image is folded into what the views before it produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CombinationType {
    Opaque,
    #[default]
    AlphaBlend,
    AdditiveBlend,
    MultiplicativeBlend,
    /// Sampled, but contributes nothing.
    DoNotInclude,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompositeInput {
    pub name: String,
    pub order: f32,
    pub combination: CombinationType,
}

/// Stable ascending sort by view order.
pub fn sort_by_order<T>(items: &mut [T], order: impl Fn(&T) -> f32) {
    items.sort_by(|a, b| order(a).total_cmp(&order(b)));
}

/// The compositor's inputs in blend order, apart from its GPU objects.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CompositeList {
    inputs: Vec<CompositeInput>,
}

impl CompositeList {
    pub fn inputs(&self) -> &[CompositeInput] {
        &self.inputs
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty()
    }

    /// Sort `sources` into blend order and adopt their inputs. Returns
    /// whether the list changed, which means the blend shader is stale.
    pub fn arrange<S>(&mut self, sources: &mut [S], input: impl Fn(&S) -> &CompositeInput) -> bool {
        sort_by_order(sources, |s| input(s).order);
        let inputs: Vec<CompositeInput> = sources.iter().map(|s| input(s).clone()).collect();
        if inputs == self.inputs {
            return false;
        }
        self.inputs = inputs;
        true
    }
}

fn input_slot(index: usize) -> String {
    format!("INPUT{index}")
}

pub fn input_layout(count: usize) -> BindingLayout {
    let mut layout = BindingLayout::new();
    for i in 0..count {
        layout.add_texture(&input_slot(i));
    }
    layout
}

// ─────────────────────────────────────────────────────────────────────────────
// Shader generation
// ─────────────────────────────────────────────────────────────────────────────

const QUAD_WGSL: &str = r#"
struct VsOut {
    @builtin(position) position: vec4<f32>,
    @location(0) uv: vec2<f32>,
};

@vertex
fn vs_main(@location(0) position: vec2<f32>, @location(1) uv: vec2<f32>) -> VsOut {
    var out: VsOut;
    out.position = vec4<f32>(position, 0.0, 1.0);
    out.uv = uv;
    return out;
}
"#;

fn blend_expression(combination: CombinationType, c: &str) -> Option<String> {
    Some(match combination {
        CombinationType::AdditiveBlend => format!("saturate(col + {c})"),
        CombinationType::AlphaBlend => format!(
            "saturate(vec4<f32>((1.0 - {c}.a) * col.rgb, 1.0 - {c}.a) + vec4<f32>({c}.a * {c}.rgb, {c}.a))"
        ),
        CombinationType::MultiplicativeBlend => format!("saturate(col * {c})"),
        CombinationType::Opaque => format!("saturate(vec4<f32>((1.0 - {c}.a) * col.rgb, 1.0 - {c}.a) + {c})"),
        CombinationType::DoNotInclude => return None,
    })
}

fn comment_safe(name: &str) -> String {
    name.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == ' ' { c } else { '_' })
        .collect()
}

/// Full WGSL module (vertex + fragment) for `inputs`, already sorted.
/// Binding numbers are left as `UBO_INPUT<n>_BINDING` macros.
pub fn generate_shader(inputs: &[CompositeInput]) -> String {
    let mut src = String::from(QUAD_WGSL);

    for i in 0..inputs.len() {
        let slot = input_slot(i);
        src.push_str(&format!(
            "@group(0) @binding(UBO_{slot}_BINDING) var input{i}_texture: texture_2d<f32>;\n\
             @group(0) @binding(UBO_{slot}_SAMPLER_BINDING) var input{i}_sampler: sampler;\n"
        ));
    }

    src.push_str("\n@fragment\nfn fs_main(in: VsOut) -> @location(0) vec4<f32> {\n");
    src.push_str("    var col = vec4<f32>(0.0);\n");
    for (i, input) in inputs.iter().enumerate() {
        let c = format!("c{i}");
        src.push_str(&format!(
            "    // {} ({:?})\n",
            comment_safe(&input.name),
            input.combination
        ));
        match blend_expression(input.combination, &c) {
            Some(expr) => {
                src.push_str(&format!("    let {c} = textureSample(input{i}_texture, input{i}_sampler, in.uv);\n"));
                src.push_str(&format!("    col = {expr};\n"));
            }
            None => {
                src.push_str(&format!("    _ = textureSample(input{i}_texture, input{i}_sampler, in.uv);\n"));
            }
        }
    }
    src.push_str("    return col;\n}\n");
    src
}

// ─────────────────────────────────────────────────────────────────────────────
// Full-screen quad
// ─────────────────────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct QuadVertex {
    pub position: [f32; 2],
    pub uv: [f32; 2],
}

pub const QUAD_VERTICES: [QuadVertex; 4] = [
    QuadVertex { position: [-1.0, -1.0], uv: [0.0, 1.0] },
    QuadVertex { position: [1.0, -1.0], uv: [1.0, 1.0] },
    QuadVertex { position: [1.0, 1.0], uv: [1.0, 0.0] },
    QuadVertex { position: [-1.0, 1.0], uv: [0.0, 0.0] },
];

pub const QUAD_INDICES: [u16; 6] = [2, 1, 0, 0, 3, 2];

impl QuadVertex {
    const ATTRS: [wgpu::VertexAttribute; 2] = wgpu::vertex_attr_array![0 => Float32x2, 1 => Float32x2];

    fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<QuadVertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRS,
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// GPU compositor
// ─────────────────────────────────────────────────────────────────────────────

/// A render target image handed to the compositor.
pub struct CompositeSource<'a> {
    pub input: CompositeInput,
    pub view: &'a wgpu::TextureView,
    pub sampler: &'a wgpu::Sampler,
}

struct CompositePipeline {
    layout: BindingLayout,
    bind_group_layout: wgpu::BindGroupLayout,
    pipeline: wgpu::RenderPipeline,
    validation: Validation,
}

pub struct ScreenCompositor {
    device: Arc<wgpu::Device>,
    format: wgpu::TextureFormat,
    clear: wgpu::Color,
    vertex_buffer: wgpu::Buffer,
    index_buffer: wgpu::Buffer,
    list: CompositeList,
    pipeline: Option<CompositePipeline>,
    bind_group: Option<wgpu::BindGroup>,
}

impl ScreenCompositor {
    pub fn new(device: Arc<wgpu::Device>, format: wgpu::TextureFormat, clear: wgpu::Color) -> Self {
        let vertex_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("compositor_quad_vertices"),
            contents: bytemuck::cast_slice(&QUAD_VERTICES),
            usage: wgpu::BufferUsages::VERTEX,
        });
        let index_buffer = device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("compositor_quad_indices"),
            contents: bytemuck::cast_slice(&QUAD_INDICES),
            usage: wgpu::BufferUsages::INDEX,
        });

        Self {
            device,
            format,
            clear,
            vertex_buffer,
            index_buffer,
            list: CompositeList::default(),
            pipeline: None,
            bind_group: None,
        }
    }

    /// Inputs of the live pipeline, in blend order.
    pub fn inputs(&self) -> &[CompositeInput] {
        self.list.inputs()
    }

    /// Swap-chain format changed; the next [`set_sources`](Self::set_sources) rebuilds.
    pub fn set_format(&mut self, format: wgpu::TextureFormat) {
        if self.format != format {
            self.format = format;
            self.pipeline = None;
            self.bind_group = None;
        }
    }

    /// Rebuild for a new set of target images. The shader is regenerated only
    /// when the sorted input list differs from the current one; a failed
    /// build leaves the previous pipeline and inputs in place.
    pub fn set_sources(&mut self, mut sources: Vec<CompositeSource<'_>>) -> Result<()> {
        let previous = self.list.clone();
        let changed = self.list.arrange(&mut sources, |s| &s.input);

        if self.list.is_empty() {
            self.pipeline = None;
            self.bind_group = None;
            return Ok(());
        }

        if changed || self.pipeline.is_none() {
            match self.build_pipeline(self.list.inputs()) {
                Ok(pipeline) => self.pipeline = Some(pipeline),
                Err(err) => {
                    self.list = previous;
                    return Err(err);
                }
            }
        }
        let Some(pipeline) = &self.pipeline else {
            return Ok(());
        };

        let resolved: Vec<_> = pipeline
            .layout
            .slots()
            .iter()
            .zip(&sources)
            .map(|(slot, source)| (slot, SlotResource::View(source.view, source.sampler)))
            .collect();
        self.bind_group = Some(create_bind_group(
            &self.device,
            "compositor_bind_group",
            &pipeline.bind_group_layout,
            &resolved,
        ));
        Ok(())
    }

    fn build_pipeline(&self, inputs: &[CompositeInput]) -> Result<CompositePipeline> {
        let layout = input_layout(inputs.len());
        let no_includes = |name: &str| -> Result<String> {
            Err(Error::Preprocess(format!("compositor shader cannot include `{name}`")))
        };
        let source = preprocess(&generate_shader(inputs), &layout.prelude(), &no_includes)?;
        log::debug!("compositor shader for {} inputs:\n{source}", inputs.len());

        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let module = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("compositor"),
            source: wgpu::ShaderSource::Wgsl(source.into()),
        });
        let bind_group_layout = layout.create_bind_group_layout(&self.device, "compositor_bgl");
        let pipeline_layout = self.device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("compositor_layout"),
            bind_group_layouts: &[&bind_group_layout],
            push_constant_ranges: &[],
        });
        let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some("compositor"),
            layout: Some(&pipeline_layout),
            vertex: wgpu::VertexState {
                module: &module,
                entry_point: "vs_main",
                buffers: &[QuadVertex::layout()],
                compilation_options: Default::default(),
            },
            fragment: Some(wgpu::FragmentState {
                module: &module,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: self.format,
                    blend: Some(wgpu::BlendState::REPLACE),
                    write_mask: wgpu::ColorWrites::ALL,
                })],
                compilation_options: Default::default(),
            }),
            primitive: wgpu::PrimitiveState {
                cull_mode: None,
                ..Default::default()
            },
            depth_stencil: None,
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
            cache: None,
        });
        let validation = finish_validation(&self.device, "compositor")?;

        Ok(CompositePipeline {
            layout,
            bind_group_layout,
            pipeline,
            validation,
        })
    }

    /// Clear `target` and draw the blended quad over it. A pipeline the GPU
    /// has not accepted yet only clears.
    pub fn render(&self, encoder: &mut wgpu::CommandEncoder, target: &wgpu::TextureView) {
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some("compositor"),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: target,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Clear(self.clear),
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: None,
            timestamp_writes: None,
            occlusion_query_set: None,
        });

        let Some(pipeline) = self.pipeline.as_ref().filter(|p| p.validation.is_valid()) else {
            return;
        };
        if let Some(bind_group) = &self.bind_group {
            pass.set_pipeline(&pipeline.pipeline);
            pass.set_bind_group(0, bind_group, &[]);
            pass.set_vertex_buffer(0, self.vertex_buffer.slice(..));
            pass.set_index_buffer(self.index_buffer.slice(..), wgpu::IndexFormat::Uint16);
            pass.draw_indexed(0..QUAD_INDICES.len() as u32, 0, 0..1);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(name: &str, order: f32, combination: CombinationType) -> CompositeInput {
        CompositeInput {
            name: name.to_string(),
            order,
            combination,
        }
    }

    #[test]
    fn inputs_sort_by_ascending_order() {
        let mut inputs = vec![
            input("hud", 3.0, CombinationType::AlphaBlend),
            input("world", 1.0, CombinationType::Opaque),
            input("fx", 2.0, CombinationType::AdditiveBlend),
        ];
        sort_by_order(&mut inputs, |i| i.order);
        let orders: Vec<f32> = inputs.iter().map(|i| i.order).collect();
        assert_eq!(orders, vec![1.0, 2.0, 3.0]);
    }

    #[test]
    fn equal_orders_keep_registration_order() {
        let mut inputs = vec![
            input("first", 1.0, CombinationType::AlphaBlend),
            input("second", 1.0, CombinationType::AlphaBlend),
            input("zero", 0.0, CombinationType::AlphaBlend),
        ];
        sort_by_order(&mut inputs, |i| i.order);
        let names: Vec<&str> = inputs.iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["zero", "first", "second"]);
    }

    #[test]
    fn list_adopts_sorted_sources_and_reports_changes() {
        let mut list = CompositeList::default();
        let mut sources = vec![
            (input("hud", 3.0, CombinationType::AlphaBlend), "hud_target"),
            (input("world", 1.0, CombinationType::Opaque), "world_target"),
            (input("fx", 2.0, CombinationType::AdditiveBlend), "fx_target"),
        ];

        assert!(list.arrange(&mut sources, |s| &s.0));
        let names: Vec<&str> = list.inputs().iter().map(|i| i.name.as_str()).collect();
        assert_eq!(names, vec!["world", "fx", "hud"]);
        let targets: Vec<&str> = sources.iter().map(|s| s.1).collect();
        assert_eq!(targets, vec!["world_target", "fx_target", "hud_target"]);

        // a resize hands the same inputs back in registration order
        let mut again = vec![
            (input("hud", 3.0, CombinationType::AlphaBlend), "hud_resized"),
            (input("world", 1.0, CombinationType::Opaque), "world_resized"),
            (input("fx", 2.0, CombinationType::AdditiveBlend), "fx_resized"),
        ];
        assert!(!list.arrange(&mut again, |s| &s.0));
        assert_eq!(again[0].1, "world_resized");

        let mut reblended = vec![(input("world", 1.0, CombinationType::MultiplicativeBlend), "world_target")];
        assert!(list.arrange(&mut reblended, |s| &s.0));
        assert_eq!(list.inputs().len(), 1);
    }

    #[test]
    fn generated_shader_blends_each_input_in_order() {
        let src = generate_shader(&[
            input("world", 0.0, CombinationType::Opaque),
            input("glow", 1.0, CombinationType::AdditiveBlend),
            input("tint", 2.0, CombinationType::MultiplicativeBlend),
            input("hud", 3.0, CombinationType::AlphaBlend),
        ]);

        assert!(src.contains("var col = vec4<f32>(0.0);"));
        let opaque = src.find("col = saturate(vec4<f32>((1.0 - c0.a) * col.rgb, 1.0 - c0.a) + c0);").unwrap();
        let additive = src.find("col = saturate(col + c1);").unwrap();
        let multiply = src.find("col = saturate(col * c2);").unwrap();
        let alpha = src
            .find("col = saturate(vec4<f32>((1.0 - c3.a) * col.rgb, 1.0 - c3.a) + vec4<f32>(c3.a * c3.rgb, c3.a));")
            .unwrap();
        assert!(opaque < additive && additive < multiply && multiply < alpha);
    }

    #[test]
    fn excluded_inputs_are_sampled_but_not_blended() {
        let src = generate_shader(&[input("debug", 0.0, CombinationType::DoNotInclude)]);
        assert!(src.contains("_ = textureSample(input0_texture, input0_sampler, in.uv);"));
        assert!(!src.contains("    col = "));
    }

    #[test]
    fn bindings_resolve_through_the_prelude() {
        let inputs = [
            input("a", 0.0, CombinationType::AlphaBlend),
            input("b", 1.0, CombinationType::AlphaBlend),
        ];
        let layout = input_layout(inputs.len());
        let no_includes = |_: &str| -> Result<String> { Err(Error::Preprocess(String::new())) };
        let src = preprocess(&generate_shader(&inputs), &layout.prelude(), &no_includes).unwrap();

        assert!(src.contains("@group(0) @binding(0) var input0_texture"));
        assert!(src.contains("@group(0) @binding(1) var input0_sampler"));
        assert!(src.contains("@group(0) @binding(2) var input1_texture"));
        assert!(!src.contains("UBO_"));
    }

    #[test]
    fn view_names_cannot_break_out_of_comments() {
        let src = generate_shader(&[input("evil\nfn x() {}", 0.0, CombinationType::AlphaBlend)]);
        assert!(!src.contains("\nfn x()"));
    }

    #[test]
    fn quad_covers_clip_space() {
        assert_eq!(QUAD_INDICES, [2, 1, 0, 0, 3, 2]);
        assert_eq!(QUAD_VERTICES.len(), 4);
        assert!(QUAD_INDICES.iter().all(|&i| (i as usize) < QUAD_VERTICES.len()));
    }
}
