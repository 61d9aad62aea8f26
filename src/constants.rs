// First-pass culling constants
//
// Shared by the CPU orchestration, the software device and the WGSL kernels.
// The kernels hard-code the same workgroup sizes; keep them in sync.

/// Compute dispatch shape
pub mod dispatch {
    /// Threads per workgroup for the per-instance kernels (visibility, append)
    pub const INSTANCE_WORKGROUP_SIZE: u32 = 64;

    /// Threads per workgroup for per-command kernels (cull state reset)
    pub const COMMAND_WORKGROUP_SIZE: u32 = 64;

    /// Hi-Z kernels run square 8x8 tiles
    pub const HI_Z_TILE_SIZE: u32 = 8;

    /// Largest workgroup count allowed in a single dispatch dimension
    pub const MAX_WORKGROUPS_PER_DIMENSION: u32 = 65_535;

    /// Instances one per-instance invocation steps over when a command
    /// outgrows a single row of workgroups
    pub const INSTANCE_GRID_STRIDE: u32 = MAX_WORKGROUPS_PER_DIMENSION * INSTANCE_WORKGROUP_SIZE;
}

/// Buffer sizing
pub mod buffers {
    /// Smallest allocation handed out, so empty frames still bind valid storage
    pub const MIN_BUFFER_SIZE: u64 = 256;

    /// Default number of draw commands reserved per geometry pool
    pub const DEFAULT_COMMAND_CAPACITY: u32 = 1024;

    /// Default number of instances reserved per geometry pool
    pub const DEFAULT_INSTANCE_CAPACITY: u32 = 16 * 1024;

    /// Grow-only buffers at least double when they run out of room
    pub const GROWTH_FACTOR: u64 = 2;

    /// Size of the wgpu uniform ring shared by all dispatches and draws
    pub const UNIFORM_RING_SIZE: u64 = 256 * 1024;
}

/// Culling math
pub mod culling {
    /// Clip-space w at or below this is treated as "touches the camera plane"
    pub const CLIP_W_EPSILON: f32 = 1.0e-5;

    /// Depth the Hi-Z chain is cleared to before it has ever been built
    pub const FAR_DEPTH: f32 = 1.0;

    /// Cull flag bits carried in `CullUniforms::flags`
    pub const FLAG_FRUSTUM: u32 = 1 << 0;
    pub const FLAG_OCCLUSION: u32 = 1 << 1;
    pub const FLAG_PHASE_TWO: u32 = 1 << 2;
}

/// Effect toggles forwarded to the draw shaders in `FrameUniforms::effect_flags`
pub mod effects {
    pub const WIREFRAME: u32 = 1 << 0;
}
