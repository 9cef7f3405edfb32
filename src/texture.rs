// src/texture.rs
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::context::Context;
use crate::ensure;
use crate::error::Result;

// ─────────────────────────────────────────────────────────────────────────────
// Sampled textures
// ─────────────────────────────────────────────────────────────────────────────

pub struct GpuTexture {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub sampler: wgpu::Sampler,
    pub size: wgpu::Extent3d,
    pub format: wgpu::TextureFormat,
}

impl GpuTexture {
    #[inline]
    pub fn width(&self) -> u32 {
        self.size.width
    }

    #[inline]
    pub fn height(&self) -> u32 {
        self.size.height
    }

    /// Upload tightly packed RGBA8 pixels.
    pub fn from_rgba(
        device: &wgpu::Device,
        queue: &wgpu::Queue,
        data: &[u8],
        width: u32,
        height: u32,
        label: &str,
    ) -> Result<Self> {
        let expected = rgba_len(width, height);
        ensure!(
            width > 0 && height > 0 && data.len() >= expected,
            "texture `{}`: expected {} bytes of RGBA8 for {}x{}, got {}",
            label,
            expected,
            width,
            height,
            data.len()
        );

        let size = wgpu::Extent3d {
            width,
            height,
            depth_or_array_layers: 1,
        };
        let format = wgpu::TextureFormat::Rgba8UnormSrgb;

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size,
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::TEXTURE_BINDING | wgpu::TextureUsages::COPY_DST,
            view_formats: &[],
        });

        queue.write_texture(
            wgpu::ImageCopyTexture {
                aspect: wgpu::TextureAspect::All,
                texture: &texture,
                mip_level: 0,
                origin: wgpu::Origin3d::ZERO,
            },
            &data[..expected],
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(4 * width),
                rows_per_image: Some(height),
            },
            size,
        );

        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        let sampler = linear_sampler(device, label, wgpu::AddressMode::Repeat);

        Ok(Self {
            texture,
            view,
            sampler,
            size,
            format,
        })
    }

    /// Decode a PNG/JPEG file.
    pub fn from_path(device: &wgpu::Device, queue: &wgpu::Queue, path: &Path) -> Result<Self> {
        let bytes = std::fs::read(path).with_context(|| format!("reading texture {}", path.display()))?;
        let image = image::load_from_memory(&bytes)
            .with_context(|| format!("decoding texture {}", path.display()))?
            .to_rgba8();
        let (width, height) = image.dimensions();
        let label = path.file_name().and_then(|n| n.to_str()).unwrap_or("texture");
        Self::from_rgba(device, queue, image.as_raw(), width, height, label)
    }

    pub fn solid(device: &wgpu::Device, queue: &wgpu::Queue, color: [u8; 4], label: &str) -> Result<Self> {
        Self::from_rgba(device, queue, &color, 1, 1, label)
    }
}

#[inline]
pub fn rgba_len(width: u32, height: u32) -> usize {
    width as usize * height as usize * 4
}

pub fn linear_sampler(device: &wgpu::Device, label: &str, address_mode: wgpu::AddressMode) -> wgpu::Sampler {
    device.create_sampler(&wgpu::SamplerDescriptor {
        label: Some(label),
        address_mode_u: address_mode,
        address_mode_v: address_mode,
        address_mode_w: address_mode,
        mag_filter: wgpu::FilterMode::Linear,
        min_filter: wgpu::FilterMode::Linear,
        mipmap_filter: wgpu::FilterMode::Nearest,
        ..Default::default()
    })
}

// ─────────────────────────────────────────────────────────────────────────────
// Render-target attachments
// ─────────────────────────────────────────────────────────────────────────────

/// Color or depth image a render pass writes and the compositor may sample.
pub struct Attachment {
    pub texture: wgpu::Texture,
    pub view: wgpu::TextureView,
    pub format: wgpu::TextureFormat,
}

impl Attachment {
    pub fn new(
        device: &wgpu::Device,
        label: &str,
        (width, height): (u32, u32),
        format: wgpu::TextureFormat,
        sampled: bool,
    ) -> Self {
        let mut usage = wgpu::TextureUsages::RENDER_ATTACHMENT;
        if sampled {
            usage |= wgpu::TextureUsages::TEXTURE_BINDING;
        }

        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some(label),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());

        Self { texture, view, format }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Name-keyed cache
// ─────────────────────────────────────────────────────────────────────────────

/// Textures shared by every surface, keyed by file name relative to `root`.
pub struct TextureCache {
    root: PathBuf,
    textures: HashMap<String, Arc<GpuTexture>>,
}

impl TextureCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            textures: HashMap::new(),
        }
    }

    pub fn get(&self, name: &str) -> Option<Arc<GpuTexture>> {
        self.textures.get(name).cloned()
    }

    pub fn insert(&mut self, name: impl Into<String>, texture: GpuTexture) -> Arc<GpuTexture> {
        let texture = Arc::new(texture);
        self.textures.insert(name.into(), texture.clone());
        texture
    }

    pub fn get_or_load(&mut self, device: &wgpu::Device, queue: &wgpu::Queue, name: &str) -> Result<Arc<GpuTexture>> {
        if let Some(texture) = self.get(name) {
            return Ok(texture);
        }
        let path = self.root.join(name);
        log::debug!("loading texture {}", path.display());
        let texture = GpuTexture::from_path(device, queue, &path)?;
        Ok(self.insert(name, texture))
    }

    pub fn len(&self) -> usize {
        self.textures.len()
    }

    pub fn is_empty(&self) -> bool {
        self.textures.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rgba_len_does_not_overflow_u32_math() {
        assert_eq!(rgba_len(2, 3), 24);
        assert_eq!(rgba_len(70_000, 70_000), 19_600_000_000);
    }

    #[test]
    fn empty_cache_misses() {
        let cache = TextureCache::new("textures");
        assert!(cache.get("diffuse.png").is_none());
        assert!(cache.is_empty());
    }
}
