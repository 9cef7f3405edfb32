// src/mesh.rs
//! Mesh data, its GPU upload, and the name-keyed mesh cache.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use bytemuck::{Pod, Zeroable};
use glam::Vec3;
use wgpu::util::DeviceExt;

use crate::binding::BindingLayout;
use crate::error::Result;

// ─────────────────────────────────────────────────────────────────────────────
// Vertex & material records
// ─────────────────────────────────────────────────────────────────────────────

#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub uv: [f32; 2],
    pub color: [f32; 4],
}

impl Vertex {
    pub const ATTRS: [wgpu::VertexAttribute; 4] = wgpu::vertex_attr_array![
        0 => Float32x3, // position
        1 => Float32x3, // normal
        2 => Float32x2, // uv
        3 => Float32x4, // color
    ];

    pub fn new(position: [f32; 3], normal: [f32; 3], uv: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            uv,
            color: [1.0; 4],
        }
    }

    pub fn layout() -> wgpu::VertexBufferLayout<'static> {
        wgpu::VertexBufferLayout {
            array_stride: std::mem::size_of::<Vertex>() as wgpu::BufferAddress,
            step_mode: wgpu::VertexStepMode::Vertex,
            attributes: &Self::ATTRS,
        }
    }
}

/// Surface material of a submesh or a whole model, bound as
/// `UBO_SUBMESH_MATERIAL` / `UBO_MODEL_MATERIAL`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct MaterialUniform {
    pub diffuse: [f32; 4],
    pub ambient: [f32; 4],
    pub specular: [f32; 4],
    pub emissive: [f32; 4],
    pub transparent: [f32; 4],
    pub reflective: [f32; 4],
    pub opacity: f32,
    pub shininess: f32,
    pub shininess_strength: f32,
    pub reflectivity: f32,
    pub refraction_index: f32,
    pub bump_scaling: f32,
    /// Non-zero for helper geometry that only editors draw.
    pub is_editor_object: u32,
    pub _pad: f32,
}

impl Default for MaterialUniform {
    fn default() -> Self {
        Self {
            diffuse: [1.0; 4],
            ambient: [0.1, 0.1, 0.1, 1.0],
            specular: [0.5, 0.5, 0.5, 1.0],
            emissive: [0.0, 0.0, 0.0, 1.0],
            transparent: [0.0; 4],
            reflective: [0.0; 4],
            opacity: 1.0,
            shininess: 32.0,
            shininess_strength: 1.0,
            reflectivity: 0.0,
            refraction_index: 1.0,
            bump_scaling: 1.0,
            is_editor_object: 0,
            _pad: 0.0,
        }
    }
}

impl MaterialUniform {
    pub fn with_diffuse(mut self, color: [f32; 4]) -> Self {
        self.diffuse = color;
        self
    }
}

/// Texture roles a submesh can sample; each maps to a binding slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum TextureUsage {
    Diffuse,
    Specular,
    Ambient,
    Emissive,
    Height,
    Normal,
    Shininess,
    Opacity,
    Displacement,
    Lightmap,
    Reflection,
}

impl TextureUsage {
    pub fn slot_name(self) -> &'static str {
        match self {
            TextureUsage::Diffuse => "DIFFUSE",
            TextureUsage::Specular => "SPECULAR",
            TextureUsage::Ambient => "AMBIENT",
            TextureUsage::Emissive => "EMISSIVE",
            TextureUsage::Height => "HEIGHT",
            TextureUsage::Normal => "NORMAL",
            TextureUsage::Shininess => "SHININESS",
            TextureUsage::Opacity => "OPACITY",
            TextureUsage::Displacement => "DISPLACEMENT",
            TextureUsage::Lightmap => "LIGHTMAP",
            TextureUsage::Reflection => "REFLECTION",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureRef {
    pub usage: TextureUsage,
    /// File name relative to the texture root.
    pub file: String,
}

// ─────────────────────────────────────────────────────────────────────────────
// Bounds
// ─────────────────────────────────────────────────────────────────────────────

/// Axis-aligned extent of a submesh in mesh space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Dimension {
    pub min: Vec3,
    pub max: Vec3,
}

impl Dimension {
    pub fn from_positions<'a>(positions: impl IntoIterator<Item = &'a [f32; 3]>) -> Self {
        let mut min = Vec3::splat(f32::INFINITY);
        let mut max = Vec3::splat(f32::NEG_INFINITY);
        let mut any = false;
        for p in positions {
            let p = Vec3::from_array(*p);
            min = min.min(p);
            max = max.max(p);
            any = true;
        }
        if !any {
            return Self { min: Vec3::ZERO, max: Vec3::ZERO };
        }
        Self { min, max }
    }

    pub fn center(&self) -> Vec3 {
        self.min + (self.max - self.min) * 0.5
    }

    /// Distance from the mesh origin to the farthest corner of the box.
    pub fn radius(&self) -> f32 {
        self.min.length().max(self.max.length())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// CPU-side mesh description
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct SubmeshData {
    pub name: String,
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    /// Name of the shader set this submesh is drawn with.
    pub shader: String,
    pub material: MaterialUniform,
    pub textures: Vec<TextureRef>,
}

impl SubmeshData {
    pub fn new(name: impl Into<String>, shader: impl Into<String>, vertices: Vec<Vertex>, indices: Vec<u32>) -> Self {
        Self {
            name: name.into(),
            vertices,
            indices,
            shader: shader.into(),
            material: MaterialUniform::default(),
            textures: Vec::new(),
        }
    }

    pub fn with_material(mut self, material: MaterialUniform) -> Self {
        self.material = material;
        self
    }

    pub fn with_texture(mut self, usage: TextureUsage, file: impl Into<String>) -> Self {
        self.textures.push(TextureRef { usage, file: file.into() });
        self
    }

    pub fn dimension(&self) -> Dimension {
        Dimension::from_positions(self.vertices.iter().map(|v| &v.position))
    }

    /// Slots the submesh's shader set must expose.
    pub fn binding_layout(&self) -> BindingLayout {
        BindingLayout::for_model(self.textures.iter().map(|t| t.usage.slot_name()))
    }
}

#[derive(Debug, Clone)]
pub struct MeshData {
    pub name: String,
    pub submeshes: Vec<SubmeshData>,
}

impl MeshData {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            submeshes: Vec::new(),
        }
    }

    pub fn with_submesh(mut self, submesh: SubmeshData) -> Self {
        self.submeshes.push(submesh);
        self
    }

    /// Unit cube with per-face normals, drawn with `shader`.
    pub fn cube(name: impl Into<String>, shader: &str) -> Self {
        let faces: [([f32; 3], [f32; 3], [f32; 3]); 6] = [
            ([1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, 1.0]),
            ([-1.0, 0.0, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0, -1.0]),
            ([0.0, 1.0, 0.0], [0.0, 0.0, 1.0], [1.0, 0.0, 0.0]),
            ([0.0, -1.0, 0.0], [0.0, 0.0, -1.0], [1.0, 0.0, 0.0]),
            ([0.0, 0.0, 1.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
            ([0.0, 0.0, -1.0], [-1.0, 0.0, 0.0], [0.0, 1.0, 0.0]),
        ];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);
        for (normal, u, v) in faces {
            let (n, u, v) = (Vec3::from(normal), Vec3::from(u), Vec3::from(v));
            debug_assert!(u.cross(v).abs_diff_eq(n, 1e-6));
            let base = vertices.len() as u32;
            for (su, sv) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
                let p = (n + u * su + v * sv) * 0.5;
                vertices.push(Vertex::new(p.to_array(), normal, [(su + 1.0) * 0.5, (sv + 1.0) * 0.5]));
            }
            // u x v == normal, so this winding is counter-clockwise from outside
            indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
        }

        Self::new(name).with_submesh(SubmeshData::new("cube", shader, vertices, indices))
    }

    pub fn dimension_of(&self, submesh: usize) -> Option<Dimension> {
        self.submeshes.get(submesh).map(SubmeshData::dimension)
    }
}

/// What the forward drawer needs to know about a mesh.
pub trait MeshShape {
    fn name(&self) -> &str;

    /// Submesh indices drawn with `shader`, in submesh order.
    fn submeshes_using(&self, shader: &str) -> &[usize];

    fn bounds(&self, submesh: usize) -> Option<Dimension>;
}

/// Groups submesh indices by shader set name.
pub fn group_by_shader<'a>(shaders: impl IntoIterator<Item = &'a str>) -> BTreeMap<String, Vec<usize>> {
    let mut map: BTreeMap<String, Vec<usize>> = BTreeMap::new();
    for (index, shader) in shaders.into_iter().enumerate() {
        map.entry(shader.to_string()).or_default().push(index);
    }
    map
}

// ─────────────────────────────────────────────────────────────────────────────
// GPU upload
// ─────────────────────────────────────────────────────────────────────────────

pub struct GpuSubmesh {
    pub name: String,
    pub shader: String,
    pub vertex_buffer: wgpu::Buffer,
    pub index_buffer: wgpu::Buffer,
    pub index_count: u32,
    pub dimension: Dimension,
    pub material: MaterialUniform,
    pub textures: Vec<TextureRef>,
    pub layout: BindingLayout,
}

pub struct GpuMesh {
    name: String,
    submeshes: Vec<GpuSubmesh>,
    by_shader: BTreeMap<String, Vec<usize>>,
}

impl GpuMesh {
    pub fn upload(device: &wgpu::Device, data: &MeshData) -> Self {
        let submeshes: Vec<GpuSubmesh> = data
            .submeshes
            .iter()
            .map(|sub| {
                let label = format!("{}/{}", data.name, sub.name);
                GpuSubmesh {
                    name: sub.name.clone(),
                    shader: sub.shader.clone(),
                    vertex_buffer: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(&format!("{label}_vertices")),
                        contents: bytemuck::cast_slice(&sub.vertices),
                        usage: wgpu::BufferUsages::VERTEX,
                    }),
                    index_buffer: device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(&format!("{label}_indices")),
                        contents: bytemuck::cast_slice(&sub.indices),
                        usage: wgpu::BufferUsages::INDEX,
                    }),
                    index_count: sub.indices.len() as u32,
                    dimension: sub.dimension(),
                    material: sub.material,
                    textures: sub.textures.clone(),
                    layout: sub.binding_layout(),
                }
            })
            .collect();

        let by_shader = group_by_shader(submeshes.iter().map(|s| s.shader.as_str()));
        log::debug!(
            "uploaded mesh `{}` ({} submeshes, {} shader sets)",
            data.name,
            submeshes.len(),
            by_shader.len()
        );

        Self {
            name: data.name.clone(),
            submeshes,
            by_shader,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn submeshes(&self) -> &[GpuSubmesh] {
        &self.submeshes
    }

    pub fn submesh(&self, index: usize) -> Option<&GpuSubmesh> {
        self.submeshes.get(index)
    }

    pub fn shaders(&self) -> impl Iterator<Item = &str> {
        self.by_shader.keys().map(String::as_str)
    }
}

impl MeshShape for GpuMesh {
    fn name(&self) -> &str {
        &self.name
    }

    fn submeshes_using(&self, shader: &str) -> &[usize] {
        self.by_shader.get(shader).map(Vec::as_slice).unwrap_or(&[])
    }

    fn bounds(&self, submesh: usize) -> Option<Dimension> {
        self.submeshes.get(submesh).map(|s| s.dimension)
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Cache
// ─────────────────────────────────────────────────────────────────────────────

/// Meshes shared across surfaces, created on first use and keyed by name.
pub struct MeshCache<M> {
    meshes: HashMap<String, Arc<M>>,
}

impl<M> Default for MeshCache<M> {
    fn default() -> Self {
        Self { meshes: HashMap::new() }
    }
}

impl<M> MeshCache<M> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, name: &str) -> Option<Arc<M>> {
        self.meshes.get(name).cloned()
    }

    /// Returns the cached mesh or builds, caches and returns a new one.
    pub fn get_or_create(&mut self, name: &str, create: impl FnOnce() -> Result<M>) -> Result<Arc<M>> {
        if let Some(mesh) = self.meshes.get(name) {
            return Ok(mesh.clone());
        }
        let mesh = Arc::new(create()?);
        self.meshes.insert(name.to_string(), mesh.clone());
        Ok(mesh)
    }

    pub fn remove(&mut self, name: &str) -> Option<Arc<M>> {
        self.meshes.remove(name)
    }

    /// Drop meshes nothing outside the cache refers to. Returns their names.
    pub fn purge_unused(&mut self) -> Vec<String> {
        let unused: Vec<String> = self
            .meshes
            .iter()
            .filter(|(_, mesh)| Arc::strong_count(mesh) == 1)
            .map(|(name, _)| name.clone())
            .collect();
        for name in &unused {
            self.meshes.remove(name);
            log::debug!("purged unused mesh `{name}`");
        }
        unused
    }

    pub fn len(&self) -> usize {
        self.meshes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.meshes.is_empty()
    }
}
