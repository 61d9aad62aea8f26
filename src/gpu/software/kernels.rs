//! CPU implementations of the compute kernels
//!
//! One function per WGSL entry point, invoked once per global invocation id.
//! Storage is shared as `AtomicU32` words so invocations running on different
//! rayon workers race exactly the way GPU threads do.

use crate::gpu::buffer_layouts::bindings::{cull, hi_z};
use crate::gpu::buffer_layouts::{
    CommandBounds, CompactionUniforms, CullUniforms, DrawElementsIndirectCommand, EntityRecord,
    HiZUniforms,
};
use crate::gpu::{grid_command_index, grid_instances};
use crate::renderer::gpu_culling::frustum_culler::{Aabb, Frustum};
use crate::renderer::gpu_culling::hzb_builder::footprint;
use crate::renderer::gpu_culling::occlusion::{is_occluded, HiZInfo};
use bytemuck::Pod;
use std::sync::atomic::{AtomicU32, Ordering};

pub(crate) const MAX_SLOTS: usize = 16;

/// Word index of each `CommandCullState` field
mod state {
    pub const STRIDE: usize = 6;
    pub const INSTANCE_OFFSET: usize = 0;
    pub const VISIBLE_COUNT: usize = 1;
    pub const COMPACTED_BASE: usize = 2;
    pub const RUNNING: usize = 3;
    pub const CLAIMED: usize = 4;
    pub const DRAW_SLOT: usize = 5;
}

/// Word index of each `DrawCounts` field
mod counts {
    pub const COMMANDS: usize = 0;
    pub const ENTITIES: usize = 1;
}

#[inline]
pub(crate) fn load(words: &[AtomicU32], index: usize) -> u32 {
    words.get(index).map_or(0, |w| w.load(Ordering::Relaxed))
}

#[inline]
pub(crate) fn store(words: &[AtomicU32], index: usize, value: u32) {
    if let Some(w) = words.get(index) {
        w.store(value, Ordering::Relaxed);
    }
}

#[inline]
fn fetch_add(words: &[AtomicU32], index: usize, value: u32) -> u32 {
    words.get(index).map_or(0, |w| w.fetch_add(value, Ordering::AcqRel))
}

#[inline]
fn swap(words: &[AtomicU32], index: usize, value: u32) -> u32 {
    words.get(index).map_or(u32::MAX, |w| w.swap(value, Ordering::AcqRel))
}

/// Read record `index` of a tightly packed array of `T`
pub(crate) fn read_record<T: Pod>(words: &[AtomicU32], index: usize) -> Option<T> {
    let stride = std::mem::size_of::<T>() / 4;
    let start = index.checked_mul(stride)?;
    let source = words.get(start..start + stride)?;
    let mut scratch = [0u32; 32];
    let scratch = scratch.get_mut(..stride)?;
    for (dst, src) in scratch.iter_mut().zip(source) {
        *dst = src.load(Ordering::Relaxed);
    }
    Some(bytemuck::pod_read_unaligned(bytemuck::cast_slice(scratch)))
}

pub(crate) fn write_record<T: Pod>(words: &[AtomicU32], index: usize, value: &T) {
    let stride = std::mem::size_of::<T>() / 4;
    let bytes = bytemuck::bytes_of(value);
    for word in 0..stride {
        let chunk = [bytes[word * 4], bytes[word * 4 + 1], bytes[word * 4 + 2], bytes[word * 4 + 3]];
        store(words, index * stride + word, u32::from_le_bytes(chunk));
    }
}

/// A texture bound for texel loads, starting at `base_mip`
#[derive(Clone, Copy)]
pub(crate) struct TextureView<'a> {
    pub mips: &'a [Vec<AtomicU32>],
    pub sizes: &'a [(u32, u32)],
    pub base_mip: u32,
}

impl TextureView<'_> {
    pub fn size(&self, level: u32) -> (u32, u32) {
        self.sizes.get((self.base_mip + level) as usize).copied().unwrap_or((0, 0))
    }

    pub fn load(&self, level: u32, x: u32, y: u32) -> f32 {
        let mip = (self.base_mip + level) as usize;
        let (width, _) = self.size(level);
        self.mips
            .get(mip)
            .map_or(0.0, |texels| f32::from_bits(load(texels, (y * width + x) as usize)))
    }
}

/// A single mip bound as a storage image
#[derive(Clone, Copy)]
pub(crate) struct ImageView<'a> {
    pub texels: &'a [AtomicU32],
    pub width: u32,
    pub height: u32,
}

impl ImageView<'_> {
    pub fn store(&self, x: u32, y: u32, value: f32) {
        if x < self.width && y < self.height {
            store(self.texels, (y * self.width + x) as usize, value.to_bits());
        }
    }
}

/// Resources resolved from a dispatch's binding list
pub(crate) struct KernelContext<'a> {
    pub buffers: [Option<&'a [AtomicU32]>; MAX_SLOTS],
    pub textures: [Option<TextureView<'a>>; MAX_SLOTS],
    pub images: [Option<ImageView<'a>>; MAX_SLOTS],
    empty: Vec<AtomicU32>,
}

impl<'a> KernelContext<'a> {
    pub fn new() -> Self {
        Self {
            buffers: [None; MAX_SLOTS],
            textures: [None; MAX_SLOTS],
            images: [None; MAX_SLOTS],
            empty: Vec::new(),
        }
    }

    fn buffer(&self, slot: u32) -> &[AtomicU32] {
        match self.buffers[slot as usize] {
            Some(words) => words,
            None => &self.empty,
        }
    }

    fn texture(&self, slot: u32) -> Option<TextureView<'a>> {
        self.textures[slot as usize]
    }

    fn image(&self, slot: u32) -> Option<ImageView<'a>> {
        self.images[slot as usize]
    }
}

fn command_at(ctx: &KernelContext<'_>, command: u32) -> Option<DrawElementsIndirectCommand> {
    read_record(ctx.buffer(cull::COMMANDS), command as usize)
}

/// Frustum and Hi-Z test of the instances owned by one invocation
pub(crate) fn visibility(ctx: &KernelContext<'_>, u: &CullUniforms, global_id: [u32; 3]) {
    let command = grid_command_index(global_id);
    if command >= u.command_count {
        return;
    }
    let Some(cmd) = command_at(ctx, command) else {
        return;
    };
    for instance in grid_instances(global_id[0], cmd.instance_count) {
        cull_instance(ctx, u, command, instance);
    }
}

/// Writes the visibility flag of one instance
fn cull_instance(ctx: &KernelContext<'_>, u: &CullUniforms, command: u32, instance: u32) {
    let cull_state = ctx.buffer(cull::CULL_STATE);
    let state_base = command as usize * state::STRIDE;
    let slot = (load(cull_state, state_base + state::INSTANCE_OFFSET) + instance) as usize;
    let entity_index = load(ctx.buffer(cull::ENTITY_OFFSETS), command as usize) + instance;

    let mut visible = true;
    let entity = if entity_index < u.entity_count {
        read_record::<EntityRecord>(ctx.buffer(cull::ENTITIES), entity_index as usize)
    } else {
        None
    };
    let bounds = read_record::<CommandBounds>(ctx.buffer(cull::COMMAND_BOUNDS), command as usize);

    // Missing entity or bounds data keeps the instance visible
    if let (Some(entity), Some(bounds)) = (entity, bounds) {
        let world = Aabb::new(bounds.min(), bounds.max()).transformed(&entity.transform());

        if u.frustum_enabled() && !Frustum::from_arrays(&u.frustum_planes).intersects_aabb(&world) {
            visible = false;
        }

        if visible && u.occlusion_enabled() {
            if let Some(hi_z) = ctx.texture(cull::HI_Z) {
                let info = HiZInfo {
                    depth_width: u.hi_z_size[0],
                    depth_height: u.hi_z_size[1],
                    mip_count: u.hi_z_size[2],
                };
                if is_occluded(&world, &u.view_proj(), &info, |level, x, y| hi_z.load(level, x, y)) {
                    visible = false;
                }
            }
        }
    }

    // Second phase only draws what the first phase missed
    if visible && u.phase_two() && load(ctx.buffer(cull::PREVIOUS_VISIBILITY), slot) != 0 {
        visible = false;
    }

    store(ctx.buffer(cull::VISIBILITY), slot, visible as u32);
    if visible {
        fetch_add(cull_state, state_base + state::VISIBLE_COUNT, 1);
    }
}

/// Zero the GPU-written counters of one command, keeping its instance offset
pub(crate) fn reset_cull_state(ctx: &KernelContext<'_>, u: &CompactionUniforms, global_id: [u32; 3]) {
    let command = global_id[0];
    if command >= u.command_count {
        return;
    }
    let cull_state = ctx.buffer(cull::CULL_STATE);
    let base = command as usize * state::STRIDE;
    for field in [
        state::VISIBLE_COUNT,
        state::COMPACTED_BASE,
        state::RUNNING,
        state::CLAIMED,
        state::DRAW_SLOT,
    ] {
        store(cull_state, base + field, 0);
    }
}

/// Exclusive prefix sum of visible counts into compacted bases
pub(crate) fn compaction_offsets(ctx: &KernelContext<'_>, u: &CompactionUniforms, global_id: [u32; 3]) {
    if global_id != [0, 0, 0] {
        return;
    }
    let cull_state = ctx.buffer(cull::CULL_STATE);
    let mut running_total = 0u32;
    for command in 0..u.command_count as usize {
        let base = command * state::STRIDE;
        store(cull_state, base + state::COMPACTED_BASE, running_total);
        running_total += load(cull_state, base + state::VISIBLE_COUNT);
    }
}

/// Append one visible instance; the first finder of a command emits its record
fn append_instance(ctx: &KernelContext<'_>, command: u32, cmd: &DrawElementsIndirectCommand, instance: u32) {
    let cull_state = ctx.buffer(cull::CULL_STATE);
    let base = command as usize * state::STRIDE;
    let slot = (load(cull_state, base + state::INSTANCE_OFFSET) + instance) as usize;
    if load(ctx.buffer(cull::VISIBILITY), slot) == 0 {
        return;
    }

    let compacted_base = load(cull_state, base + state::COMPACTED_BASE);
    let local = fetch_add(cull_state, base + state::RUNNING, 1);
    let entity_index = load(ctx.buffer(cull::ENTITY_OFFSETS), command as usize) + instance;
    store(ctx.buffer(cull::ENTITIES_COMPACTED), (compacted_base + local) as usize, entity_index);

    let draw_counts = ctx.buffer(cull::DRAW_COUNTS);
    fetch_add(draw_counts, counts::ENTITIES, 1);

    if swap(cull_state, base + state::CLAIMED, 1) == 0 {
        let draw_slot = fetch_add(draw_counts, counts::COMMANDS, 1);
        let compacted = DrawElementsIndirectCommand {
            instance_count: load(cull_state, base + state::VISIBLE_COUNT),
            base_instance: compacted_base,
            ..*cmd
        };
        write_record(ctx.buffer(cull::COMMANDS_COMPACTED), draw_slot as usize, &compacted);
        store(ctx.buffer(cull::OFFSETS_COMPACTED), draw_slot as usize, compacted_base);
        store(cull_state, base + state::DRAW_SLOT, draw_slot);
    }
}

/// One invocation per instance, all commands racing on the shared counters
pub(crate) fn append_parallel(ctx: &KernelContext<'_>, u: &CompactionUniforms, global_id: [u32; 3]) {
    let command = grid_command_index(global_id);
    if command >= u.command_count {
        return;
    }
    let Some(cmd) = command_at(ctx, command) else {
        return;
    };
    for instance in grid_instances(global_id[0], cmd.instance_count) {
        append_instance(ctx, command, &cmd, instance);
    }
}

/// Single invocation walking commands and instances in order
pub(crate) fn append_serial(ctx: &KernelContext<'_>, u: &CompactionUniforms, global_id: [u32; 3]) {
    if global_id != [0, 0, 0] {
        return;
    }
    for command in 0..u.command_count {
        let Some(cmd) = command_at(ctx, command) else {
            continue;
        };
        for instance in 0..cmd.instance_count {
            append_instance(ctx, command, &cmd, instance);
        }
    }
}

/// Farthest depth of the source footprint of one destination texel
///
/// Serves both the base pass (depth snapshot) and every downsample pass.
pub(crate) fn hi_z_reduce(ctx: &KernelContext<'_>, u: &HiZUniforms, global_id: [u32; 3]) {
    let (x, y) = (global_id[0], global_id[1]);
    let [dst_width, dst_height] = u.dst_size;
    let [src_width, src_height] = u.src_size;
    if x >= dst_width || y >= dst_height || src_width == 0 || src_height == 0 {
        return;
    }
    let (Some(source), Some(destination)) = (ctx.texture(hi_z::SOURCE), ctx.image(hi_z::DESTINATION)) else {
        return;
    };

    let mut farthest = 0.0f32;
    for sy in footprint(y, dst_height, src_height) {
        for sx in footprint(x, dst_width, src_width) {
            farthest = farthest.max(source.load(0, sx, sy));
        }
    }
    destination.store(x, y, farthest);
}
