// src/binding.rs
//! Named resource slots and their binding numbers.
//!
//! A shader set declares the slots it reads, in order. Binding numbers are
//! handed out in that order and published to the shader source as
//! `#define UBO_<NAME>_BINDING <n>` lines, so WGSL never hard-codes them.
//! When a model is instantiated every slot must resolve to a live resource;
//! a slot nobody provides is a configuration error.

use crate::error::{Error, Result};
use crate::texture::GpuTexture;

pub const VIEW: &str = "VIEW";
pub const ANIMATION_BONE: &str = "ANIMATION_BONE";
pub const MODEL_MATERIAL: &str = "MODEL_MATERIAL";
pub const SUBMESH_MATERIAL: &str = "SUBMESH_MATERIAL";
pub const LIGHTS: &str = "LIGHTS";
pub const ILLUMINATION: &str = "ILLUMINATION";
pub const WATER: &str = "WATER";
pub const MODEL: &str = "MODEL";

/// Uniform slots every forward-shaded submesh binds, in binding order.
pub const MODEL_UNIFORM_SLOTS: [&str; 8] = [
    VIEW,
    ANIMATION_BONE,
    MODEL_MATERIAL,
    SUBMESH_MATERIAL,
    LIGHTS,
    ILLUMINATION,
    WATER,
    MODEL,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Uniform,
    /// A 2D texture at `binding` and its sampler at `binding + 1`.
    Texture,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BindingSlot {
    pub name: String,
    pub kind: SlotKind,
    pub binding: u32,
    pub visibility: wgpu::ShaderStages,
}

impl BindingSlot {
    /// Bindings this slot occupies.
    pub fn width(&self) -> u32 {
        match self.kind {
            SlotKind::Uniform => 1,
            SlotKind::Texture => 2,
        }
    }
}

/// Ordered slot list of one shader set (bind group 0).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct BindingLayout {
    slots: Vec<BindingSlot>,
    next: u32,
}

impl BindingLayout {
    pub fn new() -> Self {
        Self::default()
    }

    /// Layout of a forward-shaded submesh: the standard uniform blocks
    /// followed by one texture slot per texture the submesh samples.
    pub fn for_model<'a>(textures: impl IntoIterator<Item = &'a str>) -> Self {
        let mut layout = Self::new();
        for name in MODEL_UNIFORM_SLOTS {
            layout.add_uniform(name, wgpu::ShaderStages::VERTEX_FRAGMENT);
        }
        for name in textures {
            layout.add_texture(name);
        }
        layout
    }

    pub fn add_uniform(&mut self, name: &str, visibility: wgpu::ShaderStages) -> &mut Self {
        self.push(name, SlotKind::Uniform, visibility)
    }

    pub fn add_texture(&mut self, name: &str) -> &mut Self {
        self.push(name, SlotKind::Texture, wgpu::ShaderStages::FRAGMENT)
    }

    fn push(&mut self, name: &str, kind: SlotKind, visibility: wgpu::ShaderStages) -> &mut Self {
        let name = name.to_ascii_uppercase();
        if self.slot(&name).is_some() {
            log::warn!("binding slot `{name}` declared twice; keeping the first");
            return self;
        }
        let slot = BindingSlot {
            name,
            kind,
            binding: self.next,
            visibility,
        };
        self.next += slot.width();
        self.slots.push(slot);
        self
    }

    pub fn slots(&self) -> &[BindingSlot] {
        &self.slots
    }

    pub fn slot(&self, name: &str) -> Option<&BindingSlot> {
        self.slots.iter().find(|s| s.name.eq_ignore_ascii_case(name))
    }

    pub fn binding_of(&self, name: &str) -> Option<u32> {
        self.slot(name).map(|s| s.binding)
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// `#define` lines that publish every binding number to the shader source.
    pub fn prelude(&self) -> Vec<String> {
        let mut lines = Vec::with_capacity(self.slots.len());
        for slot in &self.slots {
            lines.push(format!("#define UBO_{}_BINDING {}", slot.name, slot.binding));
            if slot.kind == SlotKind::Texture {
                lines.push(format!("#define UBO_{}_SAMPLER_BINDING {}", slot.name, slot.binding + 1));
            }
        }
        lines
    }

    pub fn layout_entries(&self) -> Vec<wgpu::BindGroupLayoutEntry> {
        let mut entries = Vec::with_capacity(self.next as usize);
        for slot in &self.slots {
            match slot.kind {
                SlotKind::Uniform => entries.push(wgpu::BindGroupLayoutEntry {
                    binding: slot.binding,
                    visibility: slot.visibility,
                    ty: wgpu::BindingType::Buffer {
                        ty: wgpu::BufferBindingType::Uniform,
                        has_dynamic_offset: false,
                        min_binding_size: None,
                    },
                    count: None,
                }),
                SlotKind::Texture => {
                    entries.push(wgpu::BindGroupLayoutEntry {
                        binding: slot.binding,
                        visibility: slot.visibility,
                        ty: wgpu::BindingType::Texture {
                            sample_type: wgpu::TextureSampleType::Float { filterable: true },
                            view_dimension: wgpu::TextureViewDimension::D2,
                            multisampled: false,
                        },
                        count: None,
                    });
                    entries.push(wgpu::BindGroupLayoutEntry {
                        binding: slot.binding + 1,
                        visibility: slot.visibility,
                        ty: wgpu::BindingType::Sampler(wgpu::SamplerBindingType::Filtering),
                        count: None,
                    });
                }
            }
        }
        entries
    }

    pub fn create_bind_group_layout(&self, device: &wgpu::Device, label: &str) -> wgpu::BindGroupLayout {
        device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(label),
            entries: &self.layout_entries(),
        })
    }
}

// ============================================================================
// Resolution
// ============================================================================

/// Supplies the resource behind a named slot, if it has one.
pub trait SlotResolver {
    type Resource;

    fn resolve(&self, slot: &BindingSlot) -> Option<Self::Resource>;
}

/// Resolve every slot of `layout` or fail on the first one without a provider.
pub fn resolve_slots<'l, R: SlotResolver>(
    layout: &'l BindingLayout,
    resolver: &R,
    shader: &str,
) -> Result<Vec<(&'l BindingSlot, R::Resource)>> {
    layout
        .slots()
        .iter()
        .map(|slot| {
            resolver
                .resolve(slot)
                .map(|resource| (slot, resource))
                .ok_or_else(|| Error::UnresolvedBinding {
                    slot: slot.name.clone(),
                    shader: shader.to_string(),
                })
        })
        .collect()
}

#[derive(Clone, Copy)]
pub enum SlotResource<'a> {
    Buffer(&'a wgpu::Buffer),
    Texture(&'a GpuTexture),
    View(&'a wgpu::TextureView, &'a wgpu::Sampler),
}

pub fn create_bind_group(
    device: &wgpu::Device,
    label: &str,
    layout: &wgpu::BindGroupLayout,
    resolved: &[(&BindingSlot, SlotResource<'_>)],
) -> wgpu::BindGroup {
    let mut entries = Vec::with_capacity(resolved.len() + 4);
    for (slot, resource) in resolved {
        match *resource {
            SlotResource::Buffer(buffer) => entries.push(wgpu::BindGroupEntry {
                binding: slot.binding,
                resource: buffer.as_entire_binding(),
            }),
            SlotResource::Texture(texture) => {
                entries.push(wgpu::BindGroupEntry {
                    binding: slot.binding,
                    resource: wgpu::BindingResource::TextureView(&texture.view),
                });
                entries.push(wgpu::BindGroupEntry {
                    binding: slot.binding + 1,
                    resource: wgpu::BindingResource::Sampler(&texture.sampler),
                });
            }
            SlotResource::View(view, sampler) => {
                entries.push(wgpu::BindGroupEntry {
                    binding: slot.binding,
                    resource: wgpu::BindingResource::TextureView(view),
                });
                entries.push(wgpu::BindGroupEntry {
                    binding: slot.binding + 1,
                    resource: wgpu::BindingResource::Sampler(sampler),
                });
            }
        }
    }

    device.create_bind_group(&wgpu::BindGroupDescriptor {
        label: Some(label),
        layout,
        entries: &entries,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    struct Table(HashMap<&'static str, u32>);

    impl SlotResolver for Table {
        type Resource = u32;

        fn resolve(&self, slot: &BindingSlot) -> Option<u32> {
            self.0.get(slot.name.as_str()).copied()
        }
    }

    #[test]
    fn bindings_follow_declaration_order() {
        let layout = BindingLayout::for_model(["diffuse", "normal"]);

        assert_eq!(layout.binding_of(VIEW), Some(0));
        assert_eq!(layout.binding_of(MODEL), Some(7));
        assert_eq!(layout.binding_of("DIFFUSE"), Some(8));
        // the diffuse sampler sits at 9
        assert_eq!(layout.binding_of("NORMAL"), Some(10));
        assert_eq!(layout.layout_entries().len(), 12);
    }

    #[test]
    fn prelude_publishes_every_binding() {
        let mut layout = BindingLayout::new();
        layout
            .add_uniform("view", wgpu::ShaderStages::VERTEX)
            .add_texture("diffuse");

        assert_eq!(
            layout.prelude(),
            vec![
                "#define UBO_VIEW_BINDING 0".to_string(),
                "#define UBO_DIFFUSE_BINDING 1".to_string(),
                "#define UBO_DIFFUSE_SAMPLER_BINDING 2".to_string(),
            ]
        );
    }

    #[test]
    fn duplicate_slots_are_ignored() {
        let mut layout = BindingLayout::new();
        layout
            .add_uniform("LIGHTS", wgpu::ShaderStages::FRAGMENT)
            .add_uniform("lights", wgpu::ShaderStages::FRAGMENT);
        assert_eq!(layout.slots().len(), 1);
    }

    #[test]
    fn unresolved_slot_is_a_configuration_error() {
        let mut layout = BindingLayout::new();
        layout
            .add_uniform(VIEW, wgpu::ShaderStages::VERTEX)
            .add_uniform(WATER, wgpu::ShaderStages::FRAGMENT);
        let resolver = Table(HashMap::from([(VIEW, 10)]));

        let err = resolve_slots(&layout, &resolver, "water_surface").unwrap_err();
        assert!(err.is_configuration());
        match err {
            Error::UnresolvedBinding { slot, shader } => {
                assert_eq!(slot, WATER);
                assert_eq!(shader, "water_surface");
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn resolved_slots_keep_layout_order() {
        let layout = BindingLayout::for_model(std::iter::empty());
        let table: HashMap<_, _> = MODEL_UNIFORM_SLOTS.iter().enumerate().map(|(i, n)| (*n, i as u32 * 10)).collect();

        let resolved = resolve_slots(&layout, &Table(table), "phong").unwrap();
        let values: Vec<u32> = resolved.iter().map(|(_, v)| *v).collect();
        assert_eq!(values, vec![0, 10, 20, 30, 40, 50, 60, 70]);
    }
}
