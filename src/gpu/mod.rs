//! Graphics device abstraction
//!
//! The culling pipeline records a strict sequence of device commands (buffer
//! writes, compute dispatches, barriers, texture copies and indirect draws)
//! through [`GraphicsApi`]. Two devices implement it:
//!
//! - [`SoftwareGpu`] executes every kernel on the CPU with atomics and rayon
//!   workgroups. It is the reference device used by the test-suite.
//! - [`WgpuGraphics`] compiles the WGSL kernels in `src/shaders` and records
//!   real compute and render passes.

pub mod buffer_layouts;
pub mod software;
pub mod wgpu_backend;

pub use software::{LoggedCommand, RecordedDraw, SoftwareGpu};
pub use wgpu_backend::WgpuGraphics;

use crate::error::CullResult;
use buffer_layouts::{DrawElementsIndirectCommand, FrameUniforms};
use std::ops::{BitOr, BitOrAssign};

/// Opaque GPU buffer handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle(pub(crate) u32);

/// Opaque GPU texture handle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureHandle(pub(crate) u32);

/// Host-registered draw program (used by batches with an exclusive shader)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramId(pub u32);

/// Buffer usage bits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const STORAGE: Self = Self(1 << 0);
    pub const INDIRECT: Self = Self(1 << 1);
    pub const UNIFORM: Self = Self(1 << 2);
    pub const VERTEX: Self = Self(1 << 3);
    pub const INDEX: Self = Self(1 << 4);

    pub const fn empty() -> Self {
        Self(0)
    }

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for BufferUsage {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

impl BitOrAssign for BufferUsage {
    fn bitor_assign(&mut self, rhs: Self) {
        self.0 |= rhs.0;
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: String,
    pub size: u64,
    pub usage: BufferUsage,
}

impl BufferDesc {
    pub fn new(label: impl Into<String>, size: u64, usage: BufferUsage) -> Self {
        Self {
            label: label.into(),
            size,
            usage,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    /// Scene depth (live depth target and its per-phase snapshot)
    Depth32Float,
    /// Hi-Z levels
    R32Float,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TextureDesc {
    pub label: String,
    pub width: u32,
    pub height: u32,
    pub mip_levels: u32,
    pub format: TextureFormat,
}

impl TextureDesc {
    /// Size of `level`, following the usual `max(1, size >> level)` mip rule
    pub fn mip_size(&self, level: u32) -> (u32, u32) {
        ((self.width >> level).max(1), (self.height >> level).max(1))
    }
}

/// Memory barrier scopes
///
/// `SHADER_STORAGE` orders storage-buffer writes before later reads,
/// `COMMAND` orders them before indirect argument fetches, `IMAGE_ACCESS`
/// orders image stores before later image loads and `TEXTURE_UPDATE`
/// orders copies before later sampling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Barrier(u32);

impl Barrier {
    pub const SHADER_STORAGE: Self = Self(1 << 0);
    pub const COMMAND: Self = Self(1 << 1);
    pub const IMAGE_ACCESS: Self = Self(1 << 2);
    pub const TEXTURE_UPDATE: Self = Self(1 << 3);
    pub const ALL: Self = Self(0b1111);

    pub const fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Barrier {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Every compute kernel the pipeline dispatches
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputeProgram {
    /// Zero the per-command counters ahead of a second culling phase
    ResetCullState,
    /// Per-instance frustum and Hi-Z test
    Visibility,
    /// Exclusive prefix sum of visible counts into compacted bases
    CompactionOffsets,
    /// Lock-free parallel append of visible instances and commands
    AppendParallel,
    /// Single-invocation append with deterministic ordering
    AppendSerial,
    /// Depth snapshot to Hi-Z mip 0
    HiZBase,
    /// Hi-Z mip N to mip N + 1
    HiZDownsample,
}

/// How a kernel accesses a binding slot
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    StorageRead,
    StorageReadWrite,
    /// Texel loads from a depth texture
    DepthTexture,
    /// Texel loads from an R32Float texture
    FloatTexture,
    /// Write-only R32Float storage image
    Image,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProgramSlot {
    pub slot: u32,
    pub kind: SlotKind,
}

const fn slot(slot: u32, kind: SlotKind) -> ProgramSlot {
    ProgramSlot { slot, kind }
}

mod program_slots {
    use super::buffer_layouts::bindings::{cull, hi_z};
    use super::slot;
    use super::ProgramSlot;
    use super::SlotKind::*;

    pub(super) const CULL_STATE_ONLY: [ProgramSlot; 1] = [slot(cull::CULL_STATE, StorageReadWrite)];

    pub(super) const VISIBILITY: [ProgramSlot; 8] = [
        slot(cull::COMMANDS, StorageRead),
        slot(cull::ENTITY_OFFSETS, StorageRead),
        slot(cull::COMMAND_BOUNDS, StorageRead),
        slot(cull::ENTITIES, StorageRead),
        slot(cull::CULL_STATE, StorageReadWrite),
        slot(cull::VISIBILITY, StorageReadWrite),
        slot(cull::PREVIOUS_VISIBILITY, StorageRead),
        slot(cull::HI_Z, FloatTexture),
    ];

    pub(super) const APPEND: [ProgramSlot; 8] = [
        slot(cull::COMMANDS, StorageRead),
        slot(cull::ENTITY_OFFSETS, StorageRead),
        slot(cull::CULL_STATE, StorageReadWrite),
        slot(cull::VISIBILITY, StorageRead),
        slot(cull::COMMANDS_COMPACTED, StorageReadWrite),
        slot(cull::OFFSETS_COMPACTED, StorageReadWrite),
        slot(cull::ENTITIES_COMPACTED, StorageReadWrite),
        slot(cull::DRAW_COUNTS, StorageReadWrite),
    ];

    pub(super) const HI_Z_BASE: [ProgramSlot; 2] = [slot(hi_z::SOURCE, DepthTexture), slot(hi_z::DESTINATION, Image)];

    pub(super) const HI_Z_DOWNSAMPLE: [ProgramSlot; 2] =
        [slot(hi_z::SOURCE, FloatTexture), slot(hi_z::DESTINATION, Image)];
}

impl ComputeProgram {
    /// Resources the kernel reads or writes besides the slot-0 uniforms
    pub fn slots(self) -> &'static [ProgramSlot] {
        match self {
            ComputeProgram::ResetCullState | ComputeProgram::CompactionOffsets => &program_slots::CULL_STATE_ONLY,
            ComputeProgram::Visibility => &program_slots::VISIBILITY,
            ComputeProgram::AppendParallel | ComputeProgram::AppendSerial => &program_slots::APPEND,
            ComputeProgram::HiZBase => &program_slots::HI_Z_BASE,
            ComputeProgram::HiZDownsample => &program_slots::HI_Z_DOWNSAMPLE,
        }
    }

    /// Threads per workgroup, as declared by the WGSL entry point
    pub fn workgroup_size(self) -> [u32; 3] {
        use crate::constants::dispatch::{COMMAND_WORKGROUP_SIZE, HI_Z_TILE_SIZE, INSTANCE_WORKGROUP_SIZE};

        match self {
            ComputeProgram::Visibility | ComputeProgram::AppendParallel => [INSTANCE_WORKGROUP_SIZE, 1, 1],
            ComputeProgram::ResetCullState => [COMMAND_WORKGROUP_SIZE, 1, 1],
            ComputeProgram::CompactionOffsets | ComputeProgram::AppendSerial => [1, 1, 1],
            ComputeProgram::HiZBase | ComputeProgram::HiZDownsample => [HI_Z_TILE_SIZE, HI_Z_TILE_SIZE, 1],
        }
    }

    /// Size in bytes of the uniform block bound at slot 0
    pub fn uniform_size(self) -> u64 {
        match self {
            ComputeProgram::Visibility => buffer_layouts::CULL_UNIFORMS_SIZE,
            ComputeProgram::HiZBase | ComputeProgram::HiZDownsample => buffer_layouts::HI_Z_UNIFORMS_SIZE,
            _ => buffer_layouts::COMPACTION_UNIFORMS_SIZE,
        }
    }
}

/// A resource bound to a numbered slot of a compute kernel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Binding {
    /// Storage buffer, entire range
    Buffer { slot: u32, buffer: BufferHandle },
    /// Texture read with texel loads; `mip: None` exposes the whole chain
    Texture {
        slot: u32,
        texture: TextureHandle,
        mip: Option<u32>,
    },
    /// Write-only storage image of a single mip level
    Image {
        slot: u32,
        texture: TextureHandle,
        mip: u32,
    },
}

impl Binding {
    pub fn slot(&self) -> u32 {
        match *self {
            Binding::Buffer { slot, .. } | Binding::Texture { slot, .. } | Binding::Image { slot, .. } => slot,
        }
    }
}

/// One compute dispatch; `uniforms` is bound to slot 0
#[derive(Debug, Clone)]
pub struct ComputeDispatch<'a> {
    pub label: &'a str,
    pub program: ComputeProgram,
    pub bindings: &'a [Binding],
    pub uniforms: &'a [u8],
    pub workgroups: [u32; 3],
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum CullMode {
    None,
    #[default]
    Back,
    Front,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum PolygonMode {
    #[default]
    Fill,
    Line,
}

/// Fixed-function state applied to subsequent draws
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RasterState {
    pub cull_mode: CullMode,
    pub depth_test: bool,
    pub depth_write: bool,
    pub polygon_mode: PolygonMode,
}

impl Default for RasterState {
    fn default() -> Self {
        Self {
            cull_mode: CullMode::Back,
            depth_test: true,
            depth_write: true,
            polygon_mode: PolygonMode::Fill,
        }
    }
}

/// Draw programs
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RenderProgram {
    Static,
    Animated,
    Custom(ProgramId),
}

/// Resources shared by every static-pool draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaticDrawUniforms {
    pub frame: FrameUniforms,
    pub entities: BufferHandle,
    pub materials: BufferHandle,
    /// `instance_index` -> entity index indirection (compacted entities)
    pub entity_indices: BufferHandle,
}

/// Resources shared by every animated-pool draw
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AnimatedDrawUniforms {
    pub frame: FrameUniforms,
    pub entities: BufferHandle,
    pub materials: BufferHandle,
    pub entity_indices: BufferHandle,
    pub joints: BufferHandle,
}

/// Uniforms and bindings for a first-pass draw, selected by geometry pool
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DrawUniforms {
    Static(StaticDrawUniforms),
    Animated(AnimatedDrawUniforms),
}

impl DrawUniforms {
    pub fn frame(&self) -> &FrameUniforms {
        match self {
            DrawUniforms::Static(u) => &u.frame,
            DrawUniforms::Animated(u) => &u.frame,
        }
    }

    pub fn entities(&self) -> BufferHandle {
        match self {
            DrawUniforms::Static(u) => u.entities,
            DrawUniforms::Animated(u) => u.entities,
        }
    }

    pub fn materials(&self) -> BufferHandle {
        match self {
            DrawUniforms::Static(u) => u.materials,
            DrawUniforms::Animated(u) => u.materials,
        }
    }

    pub fn entity_indices(&self) -> BufferHandle {
        match self {
            DrawUniforms::Static(u) => u.entity_indices,
            DrawUniforms::Animated(u) => u.entity_indices,
        }
    }

    pub fn joints(&self) -> Option<BufferHandle> {
        match self {
            DrawUniforms::Static(_) => None,
            DrawUniforms::Animated(u) => Some(u.joints),
        }
    }
}

/// Multi-draw-indirect whose draw count is read from a GPU buffer
#[derive(Debug, Clone)]
pub struct IndirectDraw<'a> {
    pub label: &'a str,
    pub program: RenderProgram,
    pub uniforms: &'a DrawUniforms,
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub commands: BufferHandle,
    pub count_buffer: BufferHandle,
    pub count_offset: u64,
    pub max_draw_count: u32,
}

/// Single indexed draw issued by the non-indirect fallback loop
#[derive(Debug, Clone)]
pub struct DirectDraw<'a> {
    pub label: &'a str,
    pub program: RenderProgram,
    pub uniforms: &'a DrawUniforms,
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub command: DrawElementsIndirectCommand,
}

/// Capability surface the first pass needs from a graphics device
///
/// Commands are recorded in call order and execute asynchronously; ordering
/// between dependent stages is expressed only through [`GraphicsApi::memory_barrier`].
pub trait GraphicsApi {
    fn backend_name(&self) -> &'static str;

    fn create_buffer(&mut self, desc: &BufferDesc) -> CullResult<BufferHandle>;

    /// Reallocate `buffer` to `new_size` bytes, copying the old contents forward
    fn resize_buffer(&mut self, buffer: BufferHandle, new_size: u64) -> CullResult<()>;

    fn destroy_buffer(&mut self, buffer: BufferHandle);

    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64>;

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> CullResult<()>;

    /// Zero the whole buffer
    fn clear_buffer(&mut self, buffer: BufferHandle) -> CullResult<()>;

    /// Blocking readback of the whole buffer, after all recorded work completes
    fn read_buffer(&mut self, buffer: BufferHandle) -> CullResult<Vec<u8>>;

    fn create_texture(&mut self, desc: &TextureDesc) -> CullResult<TextureHandle>;

    fn destroy_texture(&mut self, texture: TextureHandle);

    fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc>;

    /// Overwrite one mip level with `texels.len() == width * height` depth values
    fn write_texture(&mut self, texture: TextureHandle, mip: u32, texels: &[f32]) -> CullResult<()>;

    /// Copy mip 0 of `src` into mip 0 of `dst`; both must be the same size and format
    fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle) -> CullResult<()>;

    /// The depth buffer the first pass renders into
    fn depth_target(&self) -> TextureHandle;

    fn dispatch_compute(&mut self, dispatch: &ComputeDispatch<'_>) -> CullResult<()>;

    fn memory_barrier(&mut self, barrier: Barrier);

    fn set_raster_state(&mut self, state: &RasterState);

    fn draw_indexed_indirect_count(&mut self, draw: &IndirectDraw<'_>) -> CullResult<()>;

    fn draw_indexed(&mut self, draw: &DirectDraw<'_>) -> CullResult<()>;

    /// Hand recorded work to the device without waiting for it
    fn submit(&mut self) -> CullResult<()>;

    /// Submit and wait for the device to go idle
    fn finish(&mut self) -> CullResult<()>;
}

/// Workgroup counts covering `invocations` threads in groups of `group_size`
pub fn workgroups_for(invocations: u32, group_size: u32) -> u32 {
    invocations.div_ceil(group_size)
}

/// Grid for per-instance kernels
///
/// x walks the instances of one command; y and z page through commands so
/// no dimension exceeds the dispatch limit. Commands wider than one row of
/// workgroups are covered by [`grid_instances`].
pub fn instance_grid(command_count: u32, max_instances_per_command: u32) -> [u32; 3] {
    use crate::constants::dispatch::{INSTANCE_WORKGROUP_SIZE, MAX_WORKGROUPS_PER_DIMENSION};

    [
        workgroups_for(max_instances_per_command.max(1), INSTANCE_WORKGROUP_SIZE).min(MAX_WORKGROUPS_PER_DIMENSION),
        command_count.clamp(1, MAX_WORKGROUPS_PER_DIMENSION),
        workgroups_for(command_count.max(1), MAX_WORKGROUPS_PER_DIMENSION),
    ]
}

/// Instances of one command handled by the invocation at `global_x`
pub fn grid_instances(global_x: u32, instance_count: u32) -> impl Iterator<Item = u32> {
    use crate::constants::dispatch::INSTANCE_GRID_STRIDE;

    (global_x..instance_count).step_by(INSTANCE_GRID_STRIDE as usize)
}

/// Command index of a per-instance invocation laid out by [`instance_grid`]
pub fn grid_command_index(global_id: [u32; 3]) -> u32 {
    use crate::constants::dispatch::MAX_WORKGROUPS_PER_DIMENSION;

    global_id[1] + global_id[2] * MAX_WORKGROUPS_PER_DIMENSION
}
