//! Centralized GPU buffer layout definitions
//!
//! Single source of truth for record layouts, sizes and binding slots shared
//! by the CPU side, the software device and the WGSL kernels.

pub mod commands;
pub mod entity;
pub mod mesh;
pub mod uniforms;


pub use commands::{CommandCullState, DrawCounts, DrawElementsIndirectCommand, DRAW_COUNT_OFFSET};
pub use entity::{CommandBounds, EntityRecord, MaterialRecord};
pub use mesh::{AnimatedVertex, StaticVertex};
pub use uniforms::{CompactionUniforms, CullUniforms, FrameUniforms, HiZUniforms};

pub const DRAW_COMMAND_SIZE: u64 = 20;
pub const COMMAND_CULL_STATE_SIZE: u64 = 24;
pub const DRAW_COUNTS_SIZE: u64 = 8;
pub const ENTITY_RECORD_SIZE: u64 = 80;
pub const COMMAND_BOUNDS_SIZE: u64 = 32;
pub const MATERIAL_RECORD_SIZE: u64 = 32;
pub const CULL_UNIFORMS_SIZE: u64 = 192;
pub const HI_Z_UNIFORMS_SIZE: u64 = 16;
pub const COMPACTION_UNIFORMS_SIZE: u64 = 16;
pub const FRAME_UNIFORMS_SIZE: u64 = 240;

/// Binding slots, identical in every backend and in the WGSL sources
pub mod bindings {
    /// Visibility and compaction kernels share one numbering
    pub mod cull {
        pub const UNIFORMS: u32 = 0;
        pub const COMMANDS: u32 = 1;
        pub const ENTITY_OFFSETS: u32 = 2;
        pub const COMMAND_BOUNDS: u32 = 3;
        pub const ENTITIES: u32 = 4;
        pub const CULL_STATE: u32 = 5;
        pub const VISIBILITY: u32 = 6;
        pub const PREVIOUS_VISIBILITY: u32 = 7;
        pub const HI_Z: u32 = 8;
        pub const COMMANDS_COMPACTED: u32 = 9;
        pub const OFFSETS_COMPACTED: u32 = 10;
        pub const ENTITIES_COMPACTED: u32 = 11;
        pub const DRAW_COUNTS: u32 = 12;
    }

    /// Hi-Z base and downsample kernels
    pub mod hi_z {
        pub const UNIFORMS: u32 = 0;
        pub const SOURCE: u32 = 1;
        pub const DESTINATION: u32 = 2;
    }

    /// First-pass draw programs
    pub mod draw {
        pub const FRAME: u32 = 0;
        pub const ENTITIES: u32 = 1;
        pub const MATERIALS: u32 = 2;
        pub const ENTITY_INDICES: u32 = 3;
        pub const JOINTS: u32 = 4;
    }
}
