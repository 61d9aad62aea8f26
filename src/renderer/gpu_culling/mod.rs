/// GPU culling building blocks
///
/// Frustum extraction and box tests, the screen-space Hi-Z occlusion test,
/// and the hierarchical depth buffer they sample.

pub mod frustum_culler;
pub mod hzb_builder;
pub mod occlusion;

pub use frustum_culler::{Aabb, Frustum, Plane};
pub use hzb_builder::HierarchicalZBuffer;
pub use occlusion::{is_occluded, HiZInfo, ScreenRect};
