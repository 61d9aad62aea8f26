//! Vertex formats of the two geometry pools
//!
//! Shader locations match `shaders/indirect_draw.wgsl`: 0 position,
//! 1 normal, 2 texture coordinates, and for skinned vertices 3 joint
//! indices and 4 joint weights.

use bytemuck::{Pod, Zeroable};
use wgpu::{VertexAttribute, VertexBufferLayout, VertexStepMode};

const STATIC_ATTRIBUTES: [VertexAttribute; 3] = wgpu::vertex_attr_array![
    0 => Float32x3,
    1 => Float32x3,
    2 => Float32x2,
];

const ANIMATED_ATTRIBUTES: [VertexAttribute; 5] = wgpu::vertex_attr_array![
    0 => Float32x3,
    1 => Float32x3,
    2 => Float32x2,
    3 => Uint32x4,
    4 => Float32x4,
];

/// Static pool vertex
/// Total size: 32 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct StaticVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tex_coords: [f32; 2],
}

impl StaticVertex {
    pub fn new(position: [f32; 3], normal: [f32; 3], tex_coords: [f32; 2]) -> Self {
        Self {
            position,
            normal,
            tex_coords,
        }
    }

    pub fn layout() -> VertexBufferLayout<'static> {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            step_mode: VertexStepMode::Vertex,
            attributes: &STATIC_ATTRIBUTES,
        }
    }
}

/// Skinned pool vertex: static attributes plus four joint influences
/// Total size: 64 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Pod, Zeroable)]
pub struct AnimatedVertex {
    pub position: [f32; 3],
    pub normal: [f32; 3],
    pub tex_coords: [f32; 2],
    /// Joint indices relative to the entity's `joint_offset`
    pub joints: [u32; 4],
    pub weights: [f32; 4],
}

impl AnimatedVertex {
    /// Vertex rigidly bound to the entity's first joint
    pub fn rigid(base: StaticVertex) -> Self {
        Self {
            position: base.position,
            normal: base.normal,
            tex_coords: base.tex_coords,
            joints: [0; 4],
            weights: [1.0, 0.0, 0.0, 0.0],
        }
    }

    pub fn layout() -> VertexBufferLayout<'static> {
        VertexBufferLayout {
            array_stride: std::mem::size_of::<Self>() as u64,
            step_mode: VertexStepMode::Vertex,
            attributes: &ANIMATED_ATTRIBUTES,
        }
    }
}
