/// Hierarchical Z-Buffer Builder
///
/// Snapshots the live depth target and reduces it into an R32Float mip chain
/// holding the farthest depth of each footprint. Mip 0 is half the depth
/// target size; every level halves again down to 1x1.

use super::occlusion::HiZInfo;
use crate::constants::culling::FAR_DEPTH;
use crate::constants::dispatch::HI_Z_TILE_SIZE;
use crate::error::{CullError, CullResult};
use crate::gpu::buffer_layouts::bindings::hi_z;
use crate::gpu::buffer_layouts::HiZUniforms;
use crate::gpu::{
    workgroups_for, Barrier, Binding, ComputeDispatch, ComputeProgram, GraphicsApi, TextureDesc,
    TextureFormat, TextureHandle,
};

/// Size of Hi-Z mip 0 for a depth target
pub fn hi_z_base_size(depth_width: u32, depth_height: u32) -> (u32, u32) {
    ((depth_width >> 1).max(1), (depth_height >> 1).max(1))
}

/// Levels needed to reduce `width` x `height` down to a single texel
pub fn hi_z_mip_count(width: u32, height: u32) -> u32 {
    32 - width.max(height).max(1).leading_zeros()
}

/// Source texels folded into destination texel `dst` along one axis
///
/// Each texel covers `2 * dst` and `2 * dst + 1`; the last texel of an
/// odd-sized source also takes the leftover row or column so nothing is lost.
pub fn footprint(dst: u32, dst_size: u32, src_size: u32) -> std::ops::Range<u32> {
    let start = (dst * 2).min(src_size - 1);
    let mut end = (dst * 2 + 2).min(src_size);
    if dst + 1 == dst_size {
        end = src_size;
    }
    start..end.max(start + 1)
}

pub struct HierarchicalZBuffer {
    /// Depth snapshot taken at the start of each build
    base_depth: TextureHandle,
    hzb_texture: TextureHandle,

    depth_width: u32,
    depth_height: u32,
    mip_levels: u32,

    /// Set once the chain has been built from real depth
    valid: bool,
    builds: u64,
}

impl HierarchicalZBuffer {
    pub fn new<G: GraphicsApi + ?Sized>(api: &mut G, depth_width: u32, depth_height: u32) -> CullResult<Self> {
        if depth_width == 0 || depth_height == 0 {
            return Err(CullError::TextureMismatch(format!(
                "depth target {}x{} has no texels",
                depth_width, depth_height
            )));
        }

        let (width, height) = hi_z_base_size(depth_width, depth_height);
        let mip_levels = hi_z_mip_count(width, height);

        let base_depth = api.create_texture(&TextureDesc {
            label: "Hi-Z Base Depth Snapshot".to_string(),
            width: depth_width,
            height: depth_height,
            mip_levels: 1,
            format: TextureFormat::Depth32Float,
        })?;
        let hzb_texture = api.create_texture(&TextureDesc {
            label: "Hi-Z Texture".to_string(),
            width,
            height,
            mip_levels,
            format: TextureFormat::R32Float,
        })?;

        let mut hzb = Self {
            base_depth,
            hzb_texture,
            depth_width,
            depth_height,
            mip_levels,
            valid: false,
            builds: 0,
        };
        hzb.clear_to_far(api)?;

        log::debug!(
            "[HierarchicalZBuffer::new] {}x{} depth -> {}x{} Hi-Z with {} mips",
            depth_width, depth_height, width, height, mip_levels
        );
        Ok(hzb)
    }

    /// Recreate the chain when the depth target changed size
    ///
    /// Returns `true` if the textures were reallocated. The new chain is
    /// permissive and invalid until the next build.
    pub fn ensure_size<G: GraphicsApi + ?Sized>(
        &mut self,
        api: &mut G,
        depth_width: u32,
        depth_height: u32,
    ) -> CullResult<bool> {
        if depth_width == self.depth_width && depth_height == self.depth_height {
            return Ok(false);
        }
        log::debug!(
            "[HierarchicalZBuffer::ensure_size] Depth target resized {}x{} -> {}x{}",
            self.depth_width, self.depth_height, depth_width, depth_height
        );
        let replacement = Self::new(api, depth_width, depth_height)?;
        self.release(api);
        *self = replacement;
        Ok(true)
    }

    /// Reset every level to the far plane so nothing tests as occluded
    fn clear_to_far<G: GraphicsApi + ?Sized>(&mut self, api: &mut G) -> CullResult<()> {
        let (width, height) = hi_z_base_size(self.depth_width, self.depth_height);
        for level in 0..self.mip_levels {
            let w = (width >> level).max(1);
            let h = (height >> level).max(1);
            api.write_texture(self.hzb_texture, level, &vec![FAR_DEPTH; (w * h) as usize])?;
        }
        self.valid = false;
        Ok(())
    }

    /// Rebuild the whole chain from `depth_target`
    ///
    /// The depth target is copied first so draws recorded later in the phase
    /// cannot alias the reference the visibility kernel reads.
    pub fn build<G: GraphicsApi + ?Sized>(&mut self, api: &mut G, depth_target: TextureHandle) -> CullResult<()> {
        api.copy_texture(depth_target, self.base_depth)?;
        api.memory_barrier(Barrier::TEXTURE_UPDATE);

        let (mut src_width, mut src_height) = (self.depth_width, self.depth_height);
        for level in 0..self.mip_levels {
            let (dst_width, dst_height) = self.level_size(level);
            let uniforms = HiZUniforms {
                src_size: [src_width, src_height],
                dst_size: [dst_width, dst_height],
            };

            let (program, label, source) = if level == 0 {
                (ComputeProgram::HiZBase, "Hi-Z Base", Binding::Texture {
                    slot: hi_z::SOURCE,
                    texture: self.base_depth,
                    mip: Some(0),
                })
            } else {
                (ComputeProgram::HiZDownsample, "Hi-Z Downsample", Binding::Texture {
                    slot: hi_z::SOURCE,
                    texture: self.hzb_texture,
                    mip: Some(level - 1),
                })
            };
            let bindings = [
                source,
                Binding::Image {
                    slot: hi_z::DESTINATION,
                    texture: self.hzb_texture,
                    mip: level,
                },
            ];

            api.dispatch_compute(&ComputeDispatch {
                label,
                program,
                bindings: &bindings,
                uniforms: bytemuck::bytes_of(&uniforms),
                workgroups: [
                    workgroups_for(dst_width, HI_Z_TILE_SIZE),
                    workgroups_for(dst_height, HI_Z_TILE_SIZE),
                    1,
                ],
            })?;
            // Level N must land before level N + 1 reads it
            api.memory_barrier(Barrier::IMAGE_ACCESS);

            src_width = dst_width;
            src_height = dst_height;
        }

        self.valid = true;
        self.builds += 1;
        log::trace!(
            "[HierarchicalZBuffer::build] Rebuilt {} mips (build #{})",
            self.mip_levels, self.builds
        );
        Ok(())
    }

    pub fn level_size(&self, level: u32) -> (u32, u32) {
        self.info().level_size(level)
    }

    pub fn info(&self) -> HiZInfo {
        HiZInfo {
            depth_width: self.depth_width,
            depth_height: self.depth_height,
            mip_count: self.mip_levels,
        }
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn texture(&self) -> TextureHandle {
        self.hzb_texture
    }

    pub fn base_depth(&self) -> TextureHandle {
        self.base_depth
    }

    pub fn mip_levels(&self) -> u32 {
        self.mip_levels
    }

    pub fn build_count(&self) -> u64 {
        self.builds
    }

    pub fn release<G: GraphicsApi + ?Sized>(&mut self, api: &mut G) {
        api.destroy_texture(self.base_depth);
        api.destroy_texture(self.hzb_texture);
        self.valid = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu::{LoggedCommand, SoftwareGpu};

    #[test]
    fn test_mip_count() {
        assert_eq!(hi_z_mip_count(1, 1), 1);
        assert_eq!(hi_z_mip_count(2, 1), 2);
        assert_eq!(hi_z_mip_count(3, 3), 2);
        assert_eq!(hi_z_mip_count(640, 360), 10);
        assert_eq!(hi_z_mip_count(1024, 1), 11);
    }

    #[test]
    fn test_footprint_folds_odd_remainder() {
        assert_eq!(footprint(0, 2, 5), 0..2);
        assert_eq!(footprint(1, 2, 5), 2..5);
        assert_eq!(footprint(0, 1, 1), 0..1);
        assert_eq!(footprint(0, 1, 3), 0..3);
        assert_eq!(footprint(3, 4, 8), 6..8);
    }

    #[test]
    fn test_new_hi_z_is_permissive_and_invalid() {
        let mut gpu = SoftwareGpu::new(16, 8);
        let hzb = HierarchicalZBuffer::new(&mut gpu, 16, 8).unwrap();

        assert!(!hzb.is_valid());
        assert_eq!(hzb.level_size(0), (8, 4));
        assert_eq!(hzb.mip_levels(), 4);
        for level in 0..hzb.mip_levels() {
            assert!(gpu.texture_texels(hzb.texture(), level).unwrap().iter().all(|&d| d == FAR_DEPTH));
        }
    }

    #[test]
    fn test_build_keeps_farthest_depth() {
        let mut gpu = SoftwareGpu::new(8, 8);
        let depth = gpu.depth_target();
        let mut texels = vec![0.25f32; 64];
        texels[8 * 5 + 6] = 0.9;
        gpu.write_texture(depth, 0, &texels).unwrap();

        let mut hzb = HierarchicalZBuffer::new(&mut gpu, 8, 8).unwrap();
        hzb.build(&mut gpu, depth).unwrap();

        assert!(hzb.is_valid());
        let mip0 = gpu.texture_texels(hzb.texture(), 0).unwrap();
        assert_eq!(mip0.len(), 16);
        assert_eq!(mip0[4 * 2 + 3], 0.9);
        assert_eq!(mip0.iter().filter(|&&d| d == 0.25).count(), 15);

        let top = gpu.texture_texels(hzb.texture(), hzb.mip_levels() - 1).unwrap();
        assert_eq!(top, vec![0.9]);
    }

    #[test]
    fn test_build_folds_odd_edge_texels() {
        let mut gpu = SoftwareGpu::new(7, 5);
        let depth = gpu.depth_target();
        let mut texels = vec![0.1f32; 35];
        // Bottom-right pixel falls in the folded last row and column
        texels[7 * 4 + 6] = 0.8;
        gpu.write_texture(depth, 0, &texels).unwrap();

        let mut hzb = HierarchicalZBuffer::new(&mut gpu, 7, 5).unwrap();
        hzb.build(&mut gpu, depth).unwrap();

        let mip0 = gpu.texture_texels(hzb.texture(), 0).unwrap();
        assert_eq!(hzb.level_size(0), (3, 2));
        assert_eq!(mip0[3 + 2], 0.8);
        let top = gpu.texture_texels(hzb.texture(), hzb.mip_levels() - 1).unwrap();
        assert_eq!(top, vec![0.8]);
    }

    #[test]
    fn test_build_snapshots_depth_before_downsampling() {
        let mut gpu = SoftwareGpu::new(4, 4);
        let depth = gpu.depth_target();
        let mut hzb = HierarchicalZBuffer::new(&mut gpu, 4, 4).unwrap();
        gpu.clear_command_log();
        hzb.build(&mut gpu, depth).unwrap();

        let log = gpu.command_log();
        assert!(matches!(log[0], LoggedCommand::CopyTexture { .. }));
        assert!(matches!(log[1], LoggedCommand::Barrier(b) if b.contains(Barrier::TEXTURE_UPDATE)));
        assert!(matches!(log[2], LoggedCommand::Dispatch { program: ComputeProgram::HiZBase, .. }));
        // Every level is followed by an image barrier
        let dispatches = log
            .iter()
            .enumerate()
            .filter(|(_, c)| matches!(c, LoggedCommand::Dispatch { .. }))
            .map(|(i, _)| i)
            .collect::<Vec<_>>();
        assert_eq!(dispatches.len() as u32, hzb.mip_levels());
        for index in dispatches {
            assert!(matches!(log[index + 1], LoggedCommand::Barrier(b) if b.contains(Barrier::IMAGE_ACCESS)));
        }
    }

    #[test]
    fn test_ensure_size_reallocates_on_resize() {
        let mut gpu = SoftwareGpu::new(8, 8);
        let depth = gpu.depth_target();
        let mut hzb = HierarchicalZBuffer::new(&mut gpu, 8, 8).unwrap();
        hzb.build(&mut gpu, depth).unwrap();

        assert!(!hzb.ensure_size(&mut gpu, 8, 8).unwrap());
        assert!(hzb.ensure_size(&mut gpu, 32, 16).unwrap());
        assert!(!hzb.is_valid());
        assert_eq!(hzb.level_size(0), (16, 8));
    }
}
