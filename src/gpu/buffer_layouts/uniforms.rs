//! Uniform blocks for the culling kernels and first-pass draws
//!
//! All blocks are std140-safe: matrices and vec4s first, scalars last, no
//! vec3 members, sizes padded to 16 bytes.

use crate::constants::culling::{FLAG_FRUSTUM, FLAG_OCCLUSION, FLAG_PHASE_TWO};
use bytemuck::{Pod, Zeroable};
use glam::Mat4;

/// Visibility kernel parameters
///
/// | field                     | offset |
/// |---------------------------|--------|
/// | view_proj                 | 0      |
/// | frustum_planes[6]         | 64     |
/// | hi_z_size                 | 160    |
/// | command_count             | 176    |
/// | flags                     | 180    |
/// | max_instances_per_command | 184    |
/// | entity_count              | 188    |
///
/// `hi_z_size` is (depth width, depth height, Hi-Z mip count, Hi-Z valid).
///
/// Total size: 192 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct CullUniforms {
    pub view_proj: [[f32; 4]; 4],
    /// Normalized (n, d) planes: left, right, bottom, top, near, far
    pub frustum_planes: [[f32; 4]; 6],
    pub hi_z_size: [u32; 4],
    pub command_count: u32,
    pub flags: u32,
    pub max_instances_per_command: u32,
    pub entity_count: u32,
}

impl CullUniforms {
    pub fn frustum_enabled(&self) -> bool {
        self.flags & FLAG_FRUSTUM != 0
    }

    /// Occlusion is only honoured once a Hi-Z chain exists
    pub fn occlusion_enabled(&self) -> bool {
        self.flags & FLAG_OCCLUSION != 0 && self.hi_z_size[3] != 0
    }

    pub fn phase_two(&self) -> bool {
        self.flags & FLAG_PHASE_TWO != 0
    }

    pub fn view_proj(&self) -> Mat4 {
        Mat4::from_cols_array_2d(&self.view_proj)
    }
}

/// Hi-Z build parameters, one block per mip dispatch
///
/// | field    | offset |
/// |----------|--------|
/// | src_size | 0      |
/// | dst_size | 8      |
///
/// Total size: 16 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct HiZUniforms {
    pub src_size: [u32; 2],
    pub dst_size: [u32; 2],
}

/// Parameters shared by the compaction kernels
///
/// Total size: 16 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CompactionUniforms {
    pub command_count: u32,
    pub max_instances_per_command: u32,
    pub _padding: [u32; 2],
}

/// Per-frame draw uniforms
///
/// | field           | offset |
/// |-----------------|--------|
/// | view            | 0      |
/// | projection      | 64     |
/// | view_proj       | 128    |
/// | camera_position | 192    |
/// | near_far_time   | 208    |
/// | effect_flags    | 224    |
/// | _padding        | 228    |
///
/// Total size: 240 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct FrameUniforms {
    pub view: [[f32; 4]; 4],
    pub projection: [[f32; 4]; 4],
    pub view_proj: [[f32; 4]; 4],
    /// xyz = world position, w = 1
    pub camera_position: [f32; 4],
    /// x = near, y = far, z = time in seconds
    pub near_far_time: [f32; 4],
    pub effect_flags: u32,
    pub _padding: [u32; 3],
}
