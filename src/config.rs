// src/config.rs
//! Renderer and view configuration.

use std::path::PathBuf;

use crate::compositor::CombinationType;
use crate::render_target::DrawerType;

/// Knobs shared by every surface a [`crate::Renderer`] creates.
#[derive(Debug, Clone)]
pub struct RendererConfig {
    // --- Command recording ---------------------------------------------------
    /// Slots in each render command ring.
    pub render_ring_size: usize,
    /// Slots in the surface's upload ring.
    pub transfer_ring_size: usize,

    // --- Registries ----------------------------------------------------------
    pub max_lights: usize,
    pub max_influence_fields: usize,

    // --- Swap chain & targets --------------------------------------------------
    pub depth_format: wgpu::TextureFormat,
    /// `None` picks the first sRGB format the surface offers.
    pub color_format: Option<wgpu::TextureFormat>,
    pub present_mode: wgpu::PresentMode,
    pub frame_latency: u32,
    /// Render targets are this many times larger than the window.
    pub super_sampling: u32,
    pub compositor_clear: wgpu::Color,

    // --- Assets ----------------------------------------------------------------
    pub shader_root: PathBuf,
    pub texture_root: PathBuf,
    /// Native only: recompile shaders when files under `shader_root` change.
    pub watch_shaders: bool,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            render_ring_size: 3,
            transfer_ring_size: 3,
            max_lights: crate::lighting::MAX_LIGHTS,
            max_influence_fields: crate::influence::MAX_INFLUENCE_FIELDS,
            depth_format: wgpu::TextureFormat::Depth24PlusStencil8,
            color_format: None,
            present_mode: wgpu::PresentMode::AutoVsync,
            frame_latency: 2,
            super_sampling: 1,
            compositor_clear: wgpu::Color::BLACK,
            shader_root: PathBuf::from("shaders"),
            texture_root: PathBuf::from("textures"),
            watch_shaders: false,
        }
    }
}

impl RendererConfig {
    pub fn with_shader_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.shader_root = root.into();
        self
    }

    pub fn with_super_sampling(mut self, factor: u32) -> Self {
        self.super_sampling = factor.max(1);
        self
    }

    pub fn with_watch_shaders(mut self, watch: bool) -> Self {
        self.watch_shaders = watch;
        self
    }

    /// Render-target extent for a given window extent.
    pub fn scaled_extent(&self, width: u32, height: u32) -> (u32, u32) {
        let factor = self.super_sampling.max(1);
        (width.saturating_mul(factor), height.saturating_mul(factor))
    }
}

/// Everything needed to register a view on a surface.
#[derive(Debug, Clone)]
pub struct ViewConfig {
    pub name: String,
    /// Compositing priority; lower orders are blended first.
    pub order: f32,
    pub clear_color: wgpu::Color,
    pub combination: CombinationType,
    pub drawer: DrawerType,
}

impl ViewConfig {
    pub fn new(name: impl Into<String>, order: f32) -> Self {
        Self {
            name: name.into(),
            order,
            ..Self::default()
        }
    }

    pub fn with_clear_color(mut self, color: wgpu::Color) -> Self {
        self.clear_color = color;
        self
    }

    pub fn with_combination(mut self, combination: CombinationType) -> Self {
        self.combination = combination;
        self
    }

    pub fn with_drawer(mut self, drawer: DrawerType) -> Self {
        self.drawer = drawer;
        self
    }
}

impl Default for ViewConfig {
    fn default() -> Self {
        Self {
            name: "main".into(),
            order: 0.0,
            clear_color: wgpu::Color::BLACK,
            combination: CombinationType::AlphaBlend,
            drawer: DrawerType::GameForward,
        }
    }
}
