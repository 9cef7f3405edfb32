// src/camera.rs
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

/// Per-view camera block, bound as `UBO_VIEW`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct ViewUniform {
    /// Column-major projection matrix.
    pub projection: [[f32; 4]; 4],
    pub view: [[f32; 4]; 4],
}

impl ViewUniform {
    pub fn new(projection: Mat4, view: Mat4) -> Self {
        Self {
            projection: projection.to_cols_array_2d(),
            view: view.to_cols_array_2d(),
        }
    }

    pub fn projection(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.projection)
    }

    pub fn view(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.view)
    }

    /// World to clip space.
    pub fn view_projection(&self) -> Mat4 {
        self.projection() * self.view()
    }
}

impl Default for ViewUniform {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, Mat4::IDENTITY)
    }
}

/// Ambient and fog state for a view, bound as `UBO_ILLUMINATION`.
#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Pod, Zeroable)]
pub struct IlluminationUniform {
    pub camera_position: [f32; 4],
    pub global_illumination: [f32; 4],
    pub fog_color: [f32; 4],
    pub fog_coefficients: [f32; 4],
    /// (near, far) distances where fog starts and saturates.
    pub fog_planes: [f32; 2],
    pub _pad: [f32; 2],
}

impl Default for IlluminationUniform {
    fn default() -> Self {
        Self {
            camera_position: [0.0, 0.0, 0.0, 1.0],
            global_illumination: [0.2, 0.2, 0.2, 1.0],
            fog_color: [0.5, 0.5, 0.5, 1.0],
            fog_coefficients: [0.0; 4],
            fog_planes: [100.0, 1000.0],
            _pad: [0.0; 2],
        }
    }
}

impl IlluminationUniform {
    pub fn with_camera(mut self, position: Vec3) -> Self {
        self.camera_position = position.extend(1.0).to_array();
        self
    }

    pub fn with_ambient(mut self, ambient: Vec4) -> Self {
        self.global_illumination = ambient.to_array();
        self
    }

    pub fn with_fog(mut self, color: Vec4, coefficients: Vec4, planes: Vec2) -> Self {
        self.fog_color = color.to_array();
        self.fog_coefficients = coefficients.to_array();
        self.fog_planes = planes.to_array();
        self
    }
}

/// Look-at perspective camera used by hosts to fill a [`ViewUniform`].
#[derive(Debug, Clone, Copy)]
pub struct Camera {
    pub eye: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub fovy: f32,
    pub aspect: f32,
    pub znear: f32,
    pub zfar: f32,
}

impl Camera {
    pub fn new(eye: Vec3, target: Vec3, aspect: f32) -> Self {
        Self {
            eye,
            target,
            up: Vec3::Y,
            fovy: 60f32.to_radians(),
            aspect,
            znear: 0.1,
            zfar: 500.0,
        }
    }

    pub fn view_matrix(&self) -> Mat4 {
        Mat4::look_at_rh(self.eye, self.target, self.up)
    }

    pub fn proj_matrix(&self) -> Mat4 {
        Mat4::perspective_rh(self.fovy, self.aspect, self.znear, self.zfar)
    }

    /// Call on resize; degenerate extents keep the previous aspect.
    pub fn set_extent(&mut self, width: u32, height: u32) {
        if width > 0 && height > 0 {
            self.aspect = width as f32 / height as f32;
        }
    }

    pub fn uniform(&self) -> ViewUniform {
        ViewUniform::new(self.proj_matrix(), self.view_matrix())
    }
}
