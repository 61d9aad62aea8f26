//! Entity, bounds and material records
//!
//! The entity buffer is owned by the host; the pipeline only reads it.

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};

/// One entry of the global entity/transform buffer
///
/// | field          | offset |
/// |----------------|--------|
/// | transform      | 0      |
/// | material_index | 64     |
/// | joint_offset   | 68     |
/// | flags          | 72     |
/// | _padding       | 76     |
///
/// Total size: 80 bytes (16-byte aligned for the mat4)
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct EntityRecord {
    /// Model-to-world, column major
    pub transform: [[f32; 4]; 4],
    pub material_index: u32,
    /// First joint matrix of this entity in the joint buffer (animated pool)
    pub joint_offset: u32,
    pub flags: u32,
    pub _padding: u32,
}

impl EntityRecord {
    pub fn new(transform: Mat4, material_index: u32) -> Self {
        Self {
            transform: transform.to_cols_array_2d(),
            material_index,
            joint_offset: 0,
            flags: 0,
            _padding: 0,
        }
    }

    pub fn from_translation(translation: Vec3) -> Self {
        Self::new(Mat4::from_translation(translation), 0)
    }

    pub fn with_joint_offset(mut self, joint_offset: u32) -> Self {
        self.joint_offset = joint_offset;
        self
    }

    pub fn transform(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.transform)
    }
}

impl Default for EntityRecord {
    fn default() -> Self {
        Self::new(Mat4::IDENTITY, 0)
    }
}

/// Mesh-local bounds of a command, transformed per instance by the visibility kernel
///
/// | field     | offset | contents                       |
/// |-----------|--------|--------------------------------|
/// | local_min | 0      | xyz min, w = bounding radius   |
/// | local_max | 16     | xyz max, w unused              |
///
/// Total size: 32 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CommandBounds {
    pub local_min: [f32; 4],
    pub local_max: [f32; 4],
}

impl CommandBounds {
    pub fn new(min: Vec3, max: Vec3, radius: f32) -> Self {
        Self {
            local_min: min.extend(radius).to_array(),
            local_max: max.extend(0.0).to_array(),
        }
    }

    pub fn min(&self) -> Vec3 {
        Vec3::new(self.local_min[0], self.local_min[1], self.local_min[2])
    }

    pub fn max(&self) -> Vec3 {
        Vec3::new(self.local_max[0], self.local_max[1], self.local_max[2])
    }

    pub fn radius(&self) -> f32 {
        self.local_min[3]
    }
}

/// Minimal material entry read by the first-pass fragment shader
///
/// Total size: 32 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Pod, Zeroable)]
pub struct MaterialRecord {
    pub base_color: [f32; 4],
    /// x = roughness, y = metallic, zw unused
    pub params: [f32; 4],
}

impl Default for MaterialRecord {
    fn default() -> Self {
        Self {
            base_color: [1.0; 4],
            params: [0.5, 0.0, 0.0, 0.0],
        }
    }
}
