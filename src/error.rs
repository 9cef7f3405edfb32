// src/error.rs
//! Error type for the whole renderer.
//!
//! Only creation-time failures travel through `Result`: device and surface
//! setup, unresolved binding slots, and first-time shader builds. Per-frame
//! problems (full registries, failed reloads, stale swap chains) are absorbed
//! and logged where they happen.

use std::fmt;
use thiserror::Error;

use crate::model::ModelId;
use crate::view::ViewId;

#[derive(Error, Debug)]
#[non_exhaustive]
pub enum Error {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("image decode error: {0}")]
    Image(#[from] image::ImageError),

    #[error("failed to create surface: {0}")]
    CreateSurface(#[from] wgpu::CreateSurfaceError),

    #[error("failed to request device: {0}")]
    RequestDevice(#[from] wgpu::RequestDeviceError),

    #[error("no graphics adapter is compatible with this surface")]
    AdapterUnavailable,

    /// A shader declared a resource slot nobody can supply. Always fatal.
    #[error("binding slot `{slot}` of shader `{shader}` has no provider")]
    UnresolvedBinding { slot: String, shader: String },

    /// Two submeshes asked for the same shader set with different slots.
    #[error("shader `{shader}` was already built with a different binding layout")]
    LayoutMismatch { shader: String },

    #[error("shader `{shader}` is missing its {stage} stage")]
    MissingShaderStage { shader: String, stage: &'static str },

    #[error("shader `{shader}` failed to compile:\n{diagnostic}")]
    ShaderCompile { shader: String, diagnostic: String },

    #[error("shader preprocessing failed: {0}")]
    Preprocess(String),

    #[error("view {0:?} is not registered on this surface")]
    UnknownView(ViewId),

    #[error("model {0:?} does not exist")]
    UnknownModel(ModelId),

    #[error("mesh `{0}` is not loaded")]
    UnknownMesh(String),

    #[error("{0}")]
    Custom(String),

    #[error("{message}: {source}")]
    WithContext {
        message: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    #[inline]
    pub fn custom<S: Into<String>>(msg: S) -> Self {
        Self::Custom(msg.into())
    }

    #[inline]
    pub fn format(args: fmt::Arguments) -> Self {
        Self::Custom(fmt::format(args))
    }

    #[inline]
    pub fn msg(msg: &'static str) -> Self {
        Self::Custom(msg.into())
    }

    /// Wrap this error with a higher-level description.
    #[inline]
    pub fn context<C: Into<String>>(self, context: C) -> Self {
        Self::WithContext {
            message: context.into(),
            source: Box::new(self),
        }
    }

    /// Configuration errors mean the scene description and the shaders
    /// disagree; retrying cannot fix them.
    pub fn is_configuration(&self) -> bool {
        match self {
            Error::UnresolvedBinding { .. } | Error::LayoutMismatch { .. } => true,
            Error::WithContext { source, .. } => source.is_configuration(),
            _ => false,
        }
    }

    pub fn is_shader_compile(&self) -> bool {
        match self {
            Error::ShaderCompile { .. } | Error::MissingShaderStage { .. } | Error::Preprocess(_) => true,
            Error::WithContext { source, .. } => source.is_shader_compile(),
            _ => false,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
