//! Indirect command buffer layout definitions
//!
//! Records written by the command builder and the compaction kernels.
//! Field offsets are std430 and match `src/shaders/compaction.wgsl`.

use bytemuck::{Pod, Zeroable};

/// Indexed indirect draw command, binary compatible with the native
/// `DrawIndexedIndirect` argument layout
///
/// | field          | offset |
/// |----------------|--------|
/// | count          | 0      |
/// | instance_count | 4      |
/// | first_index    | 8      |
/// | base_vertex    | 12     |
/// | base_instance  | 16     |
///
/// Total size: 20 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawElementsIndirectCommand {
    /// Number of indices per instance
    pub count: u32,
    pub instance_count: u32,
    pub first_index: u32,
    /// Value added to each index before the vertex fetch
    pub base_vertex: i32,
    /// First `instance_index` seen by the vertex shader
    pub base_instance: u32,
}

impl DrawElementsIndirectCommand {
    pub fn new(count: u32, instance_count: u32, first_index: u32, base_vertex: i32) -> Self {
        Self {
            count,
            instance_count,
            first_index,
            base_vertex,
            base_instance: 0,
        }
    }

    /// Indices submitted by this command across all instances
    pub fn vertices(&self) -> u64 {
        self.count as u64 * self.instance_count as u64
    }
}

/// Per-command cull bookkeeping, rewritten by the CPU every prepare
///
/// | field           | offset | writer                         |
/// |-----------------|--------|--------------------------------|
/// | instance_offset | 0      | CPU, prefix of instance counts |
/// | visible_count   | 4      | visibility (atomic)            |
/// | compacted_base  | 8      | compaction offsets             |
/// | running         | 12     | append (atomic)                |
/// | claimed         | 16     | append (atomic flag)           |
/// | draw_slot       | 20     | append, claiming invocation    |
///
/// Total size: 24 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct CommandCullState {
    /// First slot of this command in the visibility buffer
    pub instance_offset: u32,
    pub visible_count: u32,
    /// First slot of this command in the compacted entity buffer
    pub compacted_base: u32,
    pub running: u32,
    pub claimed: u32,
    /// Index of this command in the compacted command buffer
    pub draw_slot: u32,
}

impl CommandCullState {
    pub fn new(instance_offset: u32) -> Self {
        Self {
            instance_offset,
            ..Self::default()
        }
    }
}

/// Atomic counters read by the indirect draw
///
/// `commands` at offset 0 is the draw count consumed by
/// `multi_draw_indexed_indirect_count`.
///
/// Total size: 8 bytes
#[repr(C)]
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct DrawCounts {
    /// Compacted commands written
    pub commands: u32,
    /// Compacted entities written
    pub entities: u32,
}

/// Byte offset of the compacted command counter inside [`DrawCounts`]
pub const DRAW_COUNT_OFFSET: u64 = 0;
