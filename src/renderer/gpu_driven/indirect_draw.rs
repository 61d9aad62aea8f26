//! First-pass draw submission
//!
//! The indirect path issues one multi-draw-indirect-count per geometry pool
//! from the compacted buffers. Batches that need their own state (custom
//! program, priority override, forward rendering, or a material raster
//! policy other than back-face culling with depth test and write) go
//! through [`FallbackDrawer`], one indexed draw each.

use super::compaction::DrawCompaction;
use crate::error::CullResult;
use crate::gpu::buffer_layouts::{DrawElementsIndirectCommand, FrameUniforms, DRAW_COUNT_OFFSET};
use crate::gpu::{
    AnimatedDrawUniforms, BufferHandle, BufferUsage, CullMode, DirectDraw, DrawUniforms,
    GraphicsApi, IndirectDraw, PolygonMode, RasterState, RenderProgram, StaticDrawUniforms,
};
use crate::memory::PersistentBuffer;
use crate::state::{GeometryPool, PoolKind, RenderBatch, RenderState};

/// Raster state shared by every batch of the indirect path
pub fn first_pass_raster_state(draw_lines: bool) -> RasterState {
    RasterState {
        cull_mode: CullMode::Back,
        depth_test: true,
        depth_write: true,
        polygon_mode: if draw_lines { PolygonMode::Line } else { PolygonMode::Fill },
    }
}

/// Draw program of a pool
pub fn pool_program(kind: PoolKind) -> RenderProgram {
    match kind {
        PoolKind::Static => RenderProgram::Static,
        PoolKind::Animated => RenderProgram::Animated,
    }
}

/// Uniforms and bindings for a pool, with `entity_indices` as the instance indirection
pub fn draw_uniforms(
    kind: PoolKind,
    frame: FrameUniforms,
    state: &RenderState,
    entity_indices: BufferHandle,
    joints: BufferHandle,
) -> DrawUniforms {
    match kind {
        PoolKind::Static => DrawUniforms::Static(StaticDrawUniforms {
            frame,
            entities: state.entities,
            materials: state.materials,
            entity_indices,
        }),
        PoolKind::Animated => DrawUniforms::Animated(AnimatedDrawUniforms {
            frame,
            entities: state.entities,
            materials: state.materials,
            entity_indices,
            joints: state.joints.unwrap_or(joints),
        }),
    }
}

/// Draw the compacted set of one pool; returns whether a draw was issued
pub fn draw_compacted<G: GraphicsApi + ?Sized>(
    api: &mut G,
    label: &str,
    pool: &GeometryPool,
    uniforms: &DrawUniforms,
    compaction: &DrawCompaction,
) -> CullResult<bool> {
    // Nothing was ever compacted for this pool
    if compaction.max_draw_count() == 0 {
        return Ok(false);
    }
    api.draw_indexed_indirect_count(&IndirectDraw {
        label,
        program: pool_program(pool.kind),
        uniforms,
        vertex_buffer: pool.vertex_buffer,
        index_buffer: pool.index_buffer,
        commands: compaction.commands_compacted(),
        count_buffer: compaction.draw_counts(),
        count_offset: DRAW_COUNT_OFFSET,
        max_draw_count: compaction.max_draw_count(),
    })?;
    Ok(true)
}

/// One recorded fallback draw, replayed verbatim while culling is frozen
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FallbackDraw {
    pub pool: PoolKind,
    pub program: RenderProgram,
    pub command: DrawElementsIndirectCommand,
    pub cull_mode: CullMode,
    pub depth_test: bool,
    pub depth_write: bool,
}

/// Totals of one fallback pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FallbackStats {
    pub draw_calls: u32,
    pub entities: u64,
    pub vertices: u64,
}

/// Non-indirect loop for batches the indirect path cannot share state with
pub struct FallbackDrawer {
    /// Entity index of every fallback instance, addressed by `base_instance`
    entity_indices: PersistentBuffer,
    draws: Vec<FallbackDraw>,
}

impl FallbackDrawer {
    pub fn new<G: GraphicsApi + ?Sized>(api: &mut G) -> CullResult<Self> {
        Ok(Self {
            entity_indices: PersistentBuffer::new(api, "Fallback Entity Indices", BufferUsage::STORAGE, 0)?,
            draws: Vec::new(),
        })
    }

    /// Record draws for `batches`, ordered by render priority
    ///
    /// The sort is stable, so batches without a priority or with equal
    /// priority keep their extraction order.
    pub fn prepare<G: GraphicsApi + ?Sized>(
        &mut self,
        api: &mut G,
        batches: &[(PoolKind, &RenderBatch)],
    ) -> CullResult<()> {
        let mut ordered = batches.to_vec();
        ordered.sort_by_key(|(_, batch)| batch.render_priority.unwrap_or(0));

        let mut indices = Vec::new();
        self.draws.clear();
        for (pool, batch) in ordered {
            let base_instance = indices.len() as u32;
            let first = batch.entity_buffer_index;
            indices.extend(first..first + batch.instance_count());
            self.draws.push(FallbackDraw {
                pool,
                program: batch.program.map_or(pool_program(pool), RenderProgram::Custom),
                command: DrawElementsIndirectCommand {
                    base_instance,
                    ..batch.draw_command
                },
                cull_mode: batch.cull_mode,
                depth_test: batch.depth_test,
                depth_write: batch.writes_depth,
            });
        }
        self.entity_indices.write(api, 0, &indices)?;
        Ok(())
    }

    /// Issue the recorded draws
    pub fn draw<G: GraphicsApi + ?Sized>(
        &self,
        api: &mut G,
        state: &RenderState,
        frame: FrameUniforms,
        joints: BufferHandle,
    ) -> CullResult<FallbackStats> {
        let mut stats = FallbackStats::default();
        let base_raster = first_pass_raster_state(state.config.is_draw_lines);
        let mut current = base_raster;

        for draw in &self.draws {
            let raster = RasterState {
                cull_mode: draw.cull_mode,
                depth_test: draw.depth_test,
                depth_write: draw.depth_write,
                ..base_raster
            };
            if raster != current {
                api.set_raster_state(&raster);
                current = raster;
            }
            let uniforms = draw_uniforms(draw.pool, frame, state, self.entity_indices.handle(), joints);
            let pool = state.geometry(draw.pool);
            api.draw_indexed(&DirectDraw {
                label: "First Pass Fallback",
                program: draw.program,
                uniforms: &uniforms,
                vertex_buffer: pool.vertex_buffer,
                index_buffer: pool.index_buffer,
                command: draw.command,
            })?;

            stats.draw_calls += 1;
            stats.entities += draw.command.instance_count as u64;
            stats.vertices += draw.command.vertices();
        }
        if current != base_raster {
            api.set_raster_state(&base_raster);
        }
        Ok(stats)
    }

    pub fn draws(&self) -> &[FallbackDraw] {
        &self.draws
    }

    pub fn release<G: GraphicsApi + ?Sized>(self, api: &mut G) {
        self.entity_indices.release(api);
    }
}
