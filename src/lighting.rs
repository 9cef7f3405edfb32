// src/lighting.rs
use bytemuck::{Pod, Zeroable};
use glam::{Vec3, Vec4};

use crate::registry::GpuRegistry;

pub const MAX_LIGHTS: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum LightType {
    Directional = 0,
    Point = 1,
    Spot = 2,
}

/// One light as the fragment shader sees it. 96 bytes, 16-byte aligned
/// members so the array stride matches WGSL uniform layout rules.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct GpuLight {
    pub position: [f32; 3],
    pub active: u32,
    pub direction: [f32; 3],
    pub intensity: f32,
    pub ambient: [f32; 4],
    pub diffuse: [f32; 4],
    pub specular: [f32; 4],
    /// (inner, outer) cone angles in radians.
    pub spot_cone: [f32; 2],
    pub light_type: u32,
    pub spot_falloff: f32,
}

impl Default for GpuLight {
    fn default() -> Self {
        Self {
            position: [0.0; 3],
            active: 1,
            direction: [0.0, -1.0, 0.0],
            intensity: 1.0,
            ambient: [0.0, 0.0, 0.0, 1.0],
            diffuse: [1.0; 4],
            specular: [1.0; 4],
            spot_cone: [0.35, 0.5],
            light_type: LightType::Point as u32,
            spot_falloff: 1.0,
        }
    }
}

impl GpuLight {
    pub fn point(position: Vec3, diffuse: Vec4, intensity: f32) -> Self {
        Self {
            position: position.to_array(),
            diffuse: diffuse.to_array(),
            intensity,
            ..Self::default()
        }
    }

    pub fn directional(direction: Vec3, diffuse: Vec4, intensity: f32) -> Self {
        Self {
            direction: direction.normalize_or_zero().to_array(),
            diffuse: diffuse.to_array(),
            intensity,
            light_type: LightType::Directional as u32,
            ..Self::default()
        }
    }

    pub fn spot(position: Vec3, direction: Vec3, inner: f32, outer: f32, diffuse: Vec4) -> Self {
        Self {
            position: position.to_array(),
            direction: direction.normalize_or_zero().to_array(),
            spot_cone: [inner, outer],
            diffuse: diffuse.to_array(),
            light_type: LightType::Spot as u32,
            ..Self::default()
        }
    }

    pub fn set_active(&mut self, active: bool) {
        self.active = active as u32;
    }
}

pub type LightRegistry = GpuRegistry<GpuLight>;

pub fn create_light_registry(device: &wgpu::Device, capacity: usize) -> LightRegistry {
    GpuRegistry::new(device, "light_registry", capacity)
}

/// WGSL declaration of the light block, available to shaders as
/// `#include "lights.wgsl"`. `LIGHT_CAPACITY` comes from the binding prelude.
pub const LIGHTS_WGSL: &str = r#"
struct Light {
    position: vec3<f32>,
    active: u32,
    direction: vec3<f32>,
    intensity: f32,
    ambient: vec4<f32>,
    diffuse: vec4<f32>,
    specular: vec4<f32>,
    spot_cone: vec2<f32>,
    light_type: u32,
    spot_falloff: f32,
};

struct LightBlock {
    count: u32,
    enabled: u32,
    _pad0: u32,
    _pad1: u32,
    lights: array<Light, LIGHT_CAPACITY>,
};
"#;
