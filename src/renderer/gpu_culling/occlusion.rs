//! Hi-Z occlusion test
//!
//! Depth convention: 0 at the near plane, 1 at the far plane. Hi-Z texels
//! hold the farthest depth of their footprint, so an object is hidden when
//! even its nearest point lies behind every sample covering it.
//!
//! Hi-Z level `L` has `max(1, depth_size >> (L + 1))` texels per axis and
//! depth pixel `p` falls into texel `min(p >> (L + 1), size_L - 1)`. The
//! clamp matches the odd-size folding done by the downsample kernel.

use super::frustum_culler::Aabb;
use crate::constants::culling::CLIP_W_EPSILON;
use glam::{Mat4, Vec2};

/// Dimensions of the depth target and the Hi-Z chain built from it
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HiZInfo {
    pub depth_width: u32,
    pub depth_height: u32,
    pub mip_count: u32,
}

impl HiZInfo {
    pub fn level_size(&self, level: u32) -> (u32, u32) {
        (
            (self.depth_width >> (level + 1)).max(1),
            (self.depth_height >> (level + 1)).max(1),
        )
    }
}

/// Screen footprint of a projected box, in depth-target pixels
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScreenRect {
    pub min_px: [u32; 2],
    pub max_px: [u32; 2],
    /// Nearest projected depth of the box
    pub nearest_depth: f32,
}

impl ScreenRect {
    pub fn span(&self) -> u32 {
        (self.max_px[0] - self.min_px[0] + 1).max(self.max_px[1] - self.min_px[1] + 1)
    }
}

/// Project the eight corners of `aabb`
///
/// Returns `None` when any corner reaches the camera plane; such boxes are
/// always treated as visible.
pub fn project_aabb(aabb: &Aabb, view_proj: &Mat4, info: &HiZInfo) -> Option<ScreenRect> {
    let mut uv_min = Vec2::splat(f32::MAX);
    let mut uv_max = Vec2::splat(f32::MIN);
    let mut nearest = f32::MAX;

    for corner in aabb.corners() {
        let clip = *view_proj * corner.extend(1.0);
        if clip.w <= CLIP_W_EPSILON {
            return None;
        }
        let ndc = clip.truncate() / clip.w;
        let uv = Vec2::new(ndc.x * 0.5 + 0.5, 0.5 - ndc.y * 0.5);
        uv_min = uv_min.min(uv);
        uv_max = uv_max.max(uv);
        nearest = nearest.min(ndc.z);
    }

    let uv_min = uv_min.clamp(Vec2::ZERO, Vec2::ONE);
    let uv_max = uv_max.clamp(Vec2::ZERO, Vec2::ONE);
    let to_pixel = |uv: f32, size: u32| ((uv * size as f32) as u32).min(size - 1);

    Some(ScreenRect {
        min_px: [to_pixel(uv_min.x, info.depth_width), to_pixel(uv_min.y, info.depth_height)],
        max_px: [to_pixel(uv_max.x, info.depth_width), to_pixel(uv_max.y, info.depth_height)],
        nearest_depth: nearest,
    })
}

/// Coarsest level at which `span` pixels cover at most two texels
pub fn select_mip(span: u32, mip_count: u32) -> u32 {
    let level = if span <= 2 {
        0
    } else {
        32 - (span - 1).leading_zeros() - 1
    };
    level.min(mip_count.saturating_sub(1))
}

/// Farthest Hi-Z depth over `rect` at `level`
pub fn sample_max_depth(
    rect: &ScreenRect,
    level: u32,
    info: &HiZInfo,
    fetch: impl Fn(u32, u32, u32) -> f32,
) -> f32 {
    let (width, height) = info.level_size(level);
    let shift = level + 1;
    let x0 = (rect.min_px[0] >> shift).min(width - 1);
    let x1 = (rect.max_px[0] >> shift).min(width - 1);
    let y0 = (rect.min_px[1] >> shift).min(height - 1);
    let y1 = (rect.max_px[1] >> shift).min(height - 1);

    let mut farthest = 0.0f32;
    for y in y0..=y1 {
        for x in x0..=x1 {
            farthest = farthest.max(fetch(level, x, y));
        }
    }
    farthest
}

/// Full occlusion test for a world-space box
pub fn is_occluded(
    aabb: &Aabb,
    view_proj: &Mat4,
    info: &HiZInfo,
    fetch: impl Fn(u32, u32, u32) -> f32,
) -> bool {
    if info.mip_count == 0 || info.depth_width == 0 || info.depth_height == 0 {
        return false;
    }
    let Some(rect) = project_aabb(aabb, view_proj, info) else {
        return false;
    };
    let level = select_mip(rect.span(), info.mip_count);
    rect.nearest_depth > sample_max_depth(&rect, level, info, fetch)
}
