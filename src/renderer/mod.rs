//! First-pass renderer
//!
//! `gpu_culling` holds the culling math and the Hi-Z builder shared by every
//! device; `gpu_driven` sequences the per-frame stages on top of them.

pub mod gpu_culling;
pub mod gpu_driven;

pub use gpu_culling::{Aabb, Frustum, HierarchicalZBuffer, HiZInfo};
pub use gpu_driven::{CompactedOutput, CullPhase, FirstPassRenderer, FirstPassResult};
