/// GPU-driven first pass
///
/// The GPU decides what to draw: batches are packed into indirect commands,
/// a compute pass tests every instance against the frustum and the Hi-Z,
/// compaction appends the survivors with atomics, and one
/// multi-draw-indirect-count per geometry pool consumes the result.
///
/// Key components:
/// - Command and entity-offset buffers built from render batches
/// - Per-instance visibility kernel, two-phase capable
/// - Lock-free compaction of commands and entity indices
/// - Indirect draws with a GPU-resident draw count, plus a non-indirect fallback

pub mod compaction;
pub mod culling_pipeline;
pub mod gpu_driven_renderer;
pub mod indirect_commands;
pub mod indirect_draw;

#[cfg(test)]
mod tests;

pub use compaction::{CompactedOutput, DrawCompaction};
pub use culling_pipeline::{CullPhase, CullingPipeline};
pub use gpu_driven_renderer::{filter_batches, FirstPassRenderer, FirstPassResult, PrepareStats};
pub use indirect_commands::IndirectCommandBuffers;
pub use indirect_draw::{FallbackDraw, FallbackDrawer, FallbackStats};
