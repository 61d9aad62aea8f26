//! GPU-driven first pass
//!
//! Frustum and Hi-Z occlusion culling, lock-free draw compaction and
//! multi-draw-indirect submission for static and animated geometry pools.
//! The pipeline talks to the device exclusively through [`gpu::GraphicsApi`];
//! [`gpu::SoftwareGpu`] runs every kernel on the CPU and [`gpu::WgpuGraphics`]
//! runs them as WGSL compute passes.

pub mod config;
pub mod constants;
pub mod error;
pub mod gpu;
pub mod memory;
pub mod renderer;
pub mod state;

pub use config::{CoarseCulling, CullingConfig, PipelineConfig};
pub use error::{CullError, CullResult, GpuErrorContext};
pub use gpu::{
    Barrier, BufferHandle, BufferUsage, GraphicsApi, ProgramId, SoftwareGpu, TextureHandle,
    WgpuGraphics,
};
pub use memory::PersistentBuffer;
pub use renderer::gpu_driven::{CompactedOutput, FirstPassRenderer, FirstPassResult};
pub use state::{Camera, DoubleBuffer, GeometryPool, PoolKind, RenderBatch, RenderState};
