use super::compaction::{CompactedOutput, DrawCompaction};
use super::culling_pipeline::{CullPhase, CullingPipeline};
use super::indirect_commands::IndirectCommandBuffers;
use super::indirect_draw::{draw_compacted, draw_uniforms, first_pass_raster_state, FallbackDrawer};
use crate::config::{CoarseCulling, PipelineConfig};
use crate::constants::effects::WIREFRAME;
use crate::error::{CullError, CullResult};
use crate::gpu::buffer_layouts::FrameUniforms;
use crate::gpu::{BufferUsage, GraphicsApi};
use crate::memory::PersistentBuffer;
use crate::renderer::gpu_culling::frustum_culler::Frustum;
use crate::renderer::gpu_culling::hzb_builder::HierarchicalZBuffer;
use crate::state::{PoolKind, RenderBatch, RenderState};

/// Per-frame counters of the first pass
///
/// Indirect counts are the filtered input handed to the GPU; the surviving
/// subset is only known on the device (see [`CompactedOutput`]).
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct FirstPassResult {
    pub vertices_drawn: u64,
    pub entities_drawn: u64,
    pub indirect_draw_calls: u32,
    pub fallback_draw_calls: u32,
}

/// Batch filtering outcome of one pool
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PrepareStats {
    pub indirect: u32,
    pub fallback: u32,
    pub cpu_culled: u32,
    pub rejected: u32,
}

/// Command, visibility and compaction buffers of one geometry pool
struct PoolPipeline {
    kind: PoolKind,
    label: &'static str,
    commands: IndirectCommandBuffers,
    culling: CullingPipeline,
    compaction: DrawCompaction,
    /// Newly visible instances of phase two, kept apart so a frozen frame
    /// can redraw both phases
    phase_two: Option<DrawCompaction>,
}

impl PoolPipeline {
    fn new<G: GraphicsApi + ?Sized>(api: &mut G, kind: PoolKind, config: &PipelineConfig) -> CullResult<Self> {
        let label = match kind {
            PoolKind::Static => "Static",
            PoolKind::Animated => "Animated",
        };
        Ok(Self {
            kind,
            label,
            commands: IndirectCommandBuffers::new(api, label, config.initial_command_capacity)?,
            culling: CullingPipeline::new(api, label, config.initial_instance_capacity)?,
            compaction: DrawCompaction::new(
                api,
                label,
                config.initial_command_capacity,
                config.initial_instance_capacity,
            )?,
            phase_two: match config.coarse_culling {
                CoarseCulling::TwoPhase => Some(DrawCompaction::new(
                    api,
                    &format!("{} Phase2", label),
                    config.initial_command_capacity,
                    config.initial_instance_capacity,
                )?),
                CoarseCulling::PhaseOne => None,
            },
        })
    }

    fn compaction(&self, phase: CullPhase) -> Option<&DrawCompaction> {
        match phase {
            CullPhase::One => Some(&self.compaction),
            CullPhase::Two => self.phase_two.as_ref(),
        }
    }

    fn release<G: GraphicsApi + ?Sized>(self, api: &mut G) {
        self.commands.release(api);
        self.culling.release(api);
        self.compaction.release(api);
        if let Some(phase_two) = self.phase_two {
            phase_two.release(api);
        }
    }
}

/// GPU-driven first pass over the static and animated pools
///
/// Per frame: prepare (filter and pack batches), cull phase one against the
/// previous Hi-Z, compact, draw, rebuild the Hi-Z from the new depth, and
/// with [`CoarseCulling::TwoPhase`] cull, compact and draw the newly visible
/// instances against the fresh Hi-Z before rebuilding it again.
pub struct FirstPassRenderer {
    config: PipelineConfig,
    static_pool: PoolPipeline,
    animated_pool: PoolPipeline,
    hi_z: HierarchicalZBuffer,
    fallback: FallbackDrawer,

    /// Bound in place of the joint buffer when the host provides none
    placeholder_joints: PersistentBuffer,

    frames: u64,
    prepare_stats: [PrepareStats; 2],
    debug_dump: Vec<(PoolKind, CullPhase, CompactedOutput)>,
}

impl FirstPassRenderer {
    pub fn new<G: GraphicsApi + ?Sized>(api: &mut G, config: PipelineConfig) -> CullResult<Self> {
        let depth_target = api.depth_target();
        let desc = api
            .texture_desc(depth_target)
            .ok_or(CullError::InvalidTexture(depth_target))?;

        let static_pool = PoolPipeline::new(api, PoolKind::Static, &config)?;
        let animated_pool = PoolPipeline::new(api, PoolKind::Animated, &config)?;
        let hi_z = HierarchicalZBuffer::new(api, desc.width, desc.height)?;
        let fallback = FallbackDrawer::new(api)?;
        let mut placeholder_joints = PersistentBuffer::new(api, "Placeholder Joints", BufferUsage::STORAGE, 0)?;
        // Bind pose for skinned meshes drawn without host joints
        placeholder_joints.write(api, 0, &[glam::Mat4::IDENTITY.to_cols_array()])?;

        log::debug!(
            "[FirstPassRenderer::new] {} backend, depth {}x{}, {:?}",
            api.backend_name(),
            desc.width,
            desc.height,
            config.coarse_culling
        );

        Ok(Self {
            config,
            static_pool,
            animated_pool,
            hi_z,
            fallback,
            placeholder_joints,
            frames: 0,
            prepare_stats: [PrepareStats::default(); 2],
            debug_dump: Vec::new(),
        })
    }

    /// Run the first pass for one frame and accumulate its counters into `result`
    pub fn render<G: GraphicsApi + ?Sized>(
        &mut self,
        api: &mut G,
        state: &RenderState,
        result: &mut FirstPassResult,
    ) -> CullResult<()> {
        let depth_target = api.depth_target();
        let desc = api
            .texture_desc(depth_target)
            .ok_or(CullError::InvalidTexture(depth_target))?;
        self.hi_z.ensure_size(api, desc.width, desc.height)?;
        self.debug_dump.clear();

        let frozen = state.config.freeze_culling;
        let mut effect_flags = state.effect_flags;
        if state.config.is_draw_lines {
            effect_flags |= WIREFRAME;
        }
        let frame = state.camera.frame_uniforms(state.time, effect_flags);
        api.set_raster_state(&first_pass_raster_state(state.config.is_draw_lines));

        if !frozen {
            self.prepare(api, state)?;
        }

        self.cull_and_render(api, state, CullPhase::One, frozen, frame, result)?;

        let fallback = self
            .fallback
            .draw(api, state, frame, self.placeholder_joints.handle())?;
        result.fallback_draw_calls += fallback.draw_calls;
        result.entities_drawn += fallback.entities;
        result.vertices_drawn += fallback.vertices;

        let two_phase = self.config.coarse_culling == CoarseCulling::TwoPhase;
        if two_phase && frozen {
            // Last unfrozen frame drew in two phases; both outputs stay valid
            self.cull_and_render(api, state, CullPhase::Two, frozen, frame, result)?;
        }

        self.hi_z.build(api, depth_target)?;

        if two_phase && !frozen {
            self.cull_and_render(api, state, CullPhase::Two, frozen, frame, result)?;
            self.hi_z.build(api, depth_target)?;
        }

        api.submit()?;
        self.frames += 1;
        log::debug!(
            "[FirstPassRenderer::render] Frame {}: {} entities, {} vertices, {} indirect + {} fallback draws{}",
            self.frames,
            result.entities_drawn,
            result.vertices_drawn,
            result.indirect_draw_calls,
            result.fallback_draw_calls,
            if frozen { " (frozen)" } else { "" }
        );
        Ok(())
    }

    /// Filter both pools and rebuild their command buffers
    fn prepare<G: GraphicsApi + ?Sized>(&mut self, api: &mut G, state: &RenderState) -> CullResult<()> {
        let cpu_frustum = state
            .config
            .use_cpu_frustum_culling
            .then(|| Frustum::from_view_projection(&state.camera.view_projection));

        let mut fallback = Vec::new();
        for (index, pool) in [&mut self.static_pool, &mut self.animated_pool].into_iter().enumerate() {
            let mut indirect = Vec::new();
            let stats = filter_batches(
                state.batches(pool.kind),
                pool.kind,
                cpu_frustum.as_ref(),
                &mut indirect,
                &mut fallback,
            );
            pool.commands.build(api, &indirect)?;
            self.prepare_stats[index] = stats;

            log::debug!(
                "[FirstPassRenderer::prepare] {}: {} indirect, {} fallback, {} culled on CPU, {} rejected",
                pool.label, stats.indirect, stats.fallback, stats.cpu_culled, stats.rejected
            );
        }
        self.fallback.prepare(api, &fallback)
    }

    fn cull_and_render<G: GraphicsApi + ?Sized>(
        &mut self,
        api: &mut G,
        state: &RenderState,
        phase: CullPhase,
        frozen: bool,
        frame: FrameUniforms,
        result: &mut FirstPassResult,
    ) -> CullResult<()> {
        let parallel = state.config.use_compute_shader_draw_command_append;
        let label = match phase {
            CullPhase::One => "Cull&Render Phase1",
            CullPhase::Two => "Cull&Render Phase2",
        };

        for pool in [&mut self.static_pool, &mut self.animated_pool] {
            if !frozen {
                pool.culling.run(api, phase, &pool.commands, state, &self.hi_z)?;
                let target = match phase {
                    CullPhase::One => Some(&mut pool.compaction),
                    CullPhase::Two => pool.phase_two.as_mut(),
                };
                if let Some(target) = target {
                    target.execute(api, &pool.commands, pool.culling.visibility(phase), parallel)?;
                }
            }
            let Some(compaction) = pool.compaction(phase) else {
                continue;
            };

            let uniforms = draw_uniforms(
                pool.kind,
                frame,
                state,
                compaction.entities_compacted(),
                self.placeholder_joints.handle(),
            );
            let geometry = state.geometry(pool.kind);
            if draw_compacted(api, label, geometry, &uniforms, compaction)? {
                result.indirect_draw_calls += 1;
                if phase == CullPhase::One {
                    result.entities_drawn += pool.commands.instance_count() as u64;
                    result.vertices_drawn += pool.commands.vertex_count();
                }
            }

            if self.config.debug_dump_buffers {
                api.finish()?;
                let output = compaction.read_back(api)?;
                log::debug!(
                    "[FirstPassRenderer::cull_and_render] {} {} dump: draw count {}, entity count {}, commands {:?}, entities {:?}",
                    pool.label, label, output.draw_count, output.entity_count, output.commands, output.entity_indices
                );
                self.debug_dump.push((pool.kind, phase, output));
            }
        }
        Ok(())
    }

    /// Blocking readback of the phase-one compaction of `pool`; diagnostics only
    pub fn read_compacted<G: GraphicsApi + ?Sized>(&self, api: &mut G, pool: PoolKind) -> CullResult<CompactedOutput> {
        self.read_compacted_phase(api, pool, CullPhase::One)
    }

    /// Blocking readback of one phase's compaction of `pool`
    ///
    /// Phase two yields an empty output unless the renderer was built for
    /// [`CoarseCulling::TwoPhase`].
    pub fn read_compacted_phase<G: GraphicsApi + ?Sized>(
        &self,
        api: &mut G,
        pool: PoolKind,
        phase: CullPhase,
    ) -> CullResult<CompactedOutput> {
        api.finish()?;
        let pipeline = match pool {
            PoolKind::Static => &self.static_pool,
            PoolKind::Animated => &self.animated_pool,
        };
        match pipeline.compaction(phase) {
            Some(compaction) => compaction.read_back(api),
            None => Ok(CompactedOutput::default()),
        }
    }

    /// Buffers dumped during the last frame when `debug_dump_buffers` is set
    pub fn debug_dump(&self) -> &[(PoolKind, CullPhase, CompactedOutput)] {
        &self.debug_dump
    }

    pub fn prepare_stats(&self, pool: PoolKind) -> PrepareStats {
        match pool {
            PoolKind::Static => self.prepare_stats[0],
            PoolKind::Animated => self.prepare_stats[1],
        }
    }

    pub fn commands(&self, pool: PoolKind) -> &IndirectCommandBuffers {
        match pool {
            PoolKind::Static => &self.static_pool.commands,
            PoolKind::Animated => &self.animated_pool.commands,
        }
    }

    pub fn hi_z(&self) -> &HierarchicalZBuffer {
        &self.hi_z
    }

    pub fn fallback(&self) -> &FallbackDrawer {
        &self.fallback
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn frame_count(&self) -> u64 {
        self.frames
    }

    pub fn release<G: GraphicsApi + ?Sized>(mut self, api: &mut G) {
        self.static_pool.release(api);
        self.animated_pool.release(api);
        self.hi_z.release(api);
        self.fallback.release(api);
        self.placeholder_joints.release(api);
    }
}

/// Split one pool's batches into the indirect set and the fallback set
///
/// Invisible batches and batches outside the CPU frustum are dropped;
/// batches with no instances break the `instance_count >= 1` contract and
/// are dropped with a warning.
pub fn filter_batches<'a>(
    batches: &'a [RenderBatch],
    kind: PoolKind,
    cpu_frustum: Option<&Frustum>,
    indirect: &mut Vec<&'a RenderBatch>,
    fallback: &mut Vec<(PoolKind, &'a RenderBatch)>,
) -> PrepareStats {
    let mut stats = PrepareStats::default();
    for batch in batches {
        if batch.instance_count() == 0 {
            log::warn!(
                "[FirstPassRenderer::filter_batches] Dropping batch at entity {} with zero instances",
                batch.entity_buffer_index
            );
            stats.rejected += 1;
            continue;
        }
        if !batch.is_visible {
            continue;
        }
        if let Some(frustum) = cpu_frustum {
            if !frustum.intersects_aabb(&batch.world_bounds) {
                stats.cpu_culled += 1;
                continue;
            }
        }
        if batch.is_indirect_eligible() {
            indirect.push(batch);
            stats.indirect += 1;
        } else {
            fallback.push((kind, batch));
            stats.fallback += 1;
        }
    }
    stats
}
