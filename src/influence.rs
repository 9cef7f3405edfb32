// src/influence.rs
//! Dynamic influence fields: localized sources (wakes, splashes, heat)
//! that water and terrain shaders read to displace or tint surfaces.

use bytemuck::{Pod, Zeroable};
use glam::Vec3;

use crate::registry::GpuRegistry;

pub const MAX_INFLUENCE_FIELDS: usize = 8;

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct GpuInfluenceField {
    pub center: [f32; 3],
    pub radius: f32,
    pub color: [f32; 3],
    pub strength: f32,
    pub direction: [f32; 3],
    pub active: u32,
}

impl Default for GpuInfluenceField {
    fn default() -> Self {
        Self {
            center: [0.0; 3],
            radius: 1.0,
            color: [1.0; 3],
            strength: 1.0,
            direction: [0.0, 1.0, 0.0],
            active: 1,
        }
    }
}

impl GpuInfluenceField {
    pub fn new(center: Vec3, radius: f32) -> Self {
        Self {
            center: center.to_array(),
            radius,
            ..Self::default()
        }
    }

    pub fn with_color(mut self, color: Vec3) -> Self {
        self.color = color.to_array();
        self
    }

    pub fn with_direction(mut self, direction: Vec3) -> Self {
        self.direction = direction.normalize_or_zero().to_array();
        self
    }

    pub fn with_strength(mut self, strength: f32) -> Self {
        self.strength = strength;
        self
    }
}

pub type FieldRegistry = GpuRegistry<GpuInfluenceField>;

pub fn create_field_registry(device: &wgpu::Device, capacity: usize) -> FieldRegistry {
    GpuRegistry::new(device, "influence_registry", capacity)
}

/// Included as `#include "fields.wgsl"`.
pub const FIELDS_WGSL: &str = r#"
struct InfluenceField {
    center: vec3<f32>,
    radius: f32,
    color: vec3<f32>,
    strength: f32,
    direction: vec3<f32>,
    active: u32,
};

struct FieldBlock {
    count: u32,
    enabled: u32,
    _pad0: u32,
    _pad1: u32,
    fields: array<InfluenceField, FIELD_CAPACITY>,
};
"#;
