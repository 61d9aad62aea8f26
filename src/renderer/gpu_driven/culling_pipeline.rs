use super::indirect_commands::IndirectCommandBuffers;
use crate::constants::culling::{FLAG_FRUSTUM, FLAG_OCCLUSION, FLAG_PHASE_TWO};
use crate::constants::dispatch::COMMAND_WORKGROUP_SIZE;
use crate::error::CullResult;
use crate::gpu::buffer_layouts::bindings::cull;
use crate::gpu::buffer_layouts::{CompactionUniforms, CullUniforms};
use crate::gpu::{
    instance_grid, workgroups_for, Barrier, Binding, BufferHandle, BufferUsage, ComputeDispatch,
    ComputeProgram, GraphicsApi,
};
use crate::memory::PersistentBuffer;
use crate::renderer::gpu_culling::frustum_culler::Frustum;
use crate::renderer::gpu_culling::hzb_builder::HierarchicalZBuffer;
use crate::state::RenderState;

/// Coarse culling phase of a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullPhase {
    /// Against last frame's Hi-Z
    One,
    /// Against the Hi-Z rebuilt from this frame's phase-one depth
    Two,
}

impl CullPhase {
    fn visibility_slot(self) -> usize {
        match self {
            CullPhase::One => 0,
            CullPhase::Two => 1,
        }
    }
}

/// Visibility stage of one geometry pool
///
/// Owns two per-instance visibility buffers: phase one writes the first,
/// phase two writes the second and reads the first to skip instances that
/// were already drawn.
pub struct CullingPipeline {
    label: String,
    visibility: [PersistentBuffer; 2],
    warned_missing_hi_z: bool,
}

impl CullingPipeline {
    pub fn new<G: GraphicsApi + ?Sized>(api: &mut G, label: &str, instance_capacity: u32) -> CullResult<Self> {
        let capacity = instance_capacity as usize;
        Ok(Self {
            label: label.to_string(),
            visibility: [
                PersistentBuffer::for_records::<u32, _>(
                    api,
                    format!("{} Visibility Phase 1", label),
                    BufferUsage::STORAGE,
                    capacity,
                )?,
                PersistentBuffer::for_records::<u32, _>(
                    api,
                    format!("{} Visibility Phase 2", label),
                    BufferUsage::STORAGE,
                    capacity,
                )?,
            ],
            warned_missing_hi_z: false,
        })
    }

    /// Uniform block for one visibility dispatch
    pub fn cull_uniforms(
        phase: CullPhase,
        commands: &IndirectCommandBuffers,
        state: &RenderState,
        hi_z: &HierarchicalZBuffer,
    ) -> CullUniforms {
        let mut flags = 0;
        if state.config.use_gpu_frustum_culling {
            flags |= FLAG_FRUSTUM;
        }
        if state.config.use_gpu_occlusion_culling {
            flags |= FLAG_OCCLUSION;
        }
        if phase == CullPhase::Two {
            flags |= FLAG_PHASE_TWO;
        }
        let info = hi_z.info();
        let view_proj = state.camera.view_projection;

        CullUniforms {
            view_proj: view_proj.to_cols_array_2d(),
            frustum_planes: Frustum::from_view_projection(&view_proj).to_arrays(),
            hi_z_size: [info.depth_width, info.depth_height, info.mip_count, hi_z.is_valid() as u32],
            command_count: commands.command_count(),
            flags,
            max_instances_per_command: commands.max_instances_per_command(),
            entity_count: state.entity_count,
        }
    }

    /// Test every instance of `commands` and count survivors per command
    ///
    /// Phase two first zeroes the GPU-written counters so the compaction
    /// that follows only sees this phase's survivors.
    pub fn run<G: GraphicsApi + ?Sized>(
        &mut self,
        api: &mut G,
        phase: CullPhase,
        commands: &IndirectCommandBuffers,
        state: &RenderState,
        hi_z: &HierarchicalZBuffer,
    ) -> CullResult<()> {
        if commands.is_empty() {
            return Ok(());
        }
        let instances = commands.instance_count() as usize;
        for buffer in &mut self.visibility {
            buffer.reserve_records::<u32, _>(api, instances)?;
        }

        if state.config.use_gpu_occlusion_culling && !hi_z.is_valid() && !self.warned_missing_hi_z {
            log::warn!(
                "[CullingPipeline::run] {}: occlusion culling requested before any Hi-Z was built, treating everything as unoccluded",
                self.label
            );
            self.warned_missing_hi_z = true;
        }

        if phase == CullPhase::Two {
            let reset = CompactionUniforms {
                command_count: commands.command_count(),
                max_instances_per_command: commands.max_instances_per_command(),
                _padding: [0; 2],
            };
            api.dispatch_compute(&ComputeDispatch {
                label: "Reset Cull State",
                program: ComputeProgram::ResetCullState,
                bindings: &[Binding::Buffer {
                    slot: cull::CULL_STATE,
                    buffer: commands.cull_state().handle(),
                }],
                uniforms: bytemuck::bytes_of(&reset),
                workgroups: [workgroups_for(commands.command_count(), COMMAND_WORKGROUP_SIZE), 1, 1],
            })?;
            api.memory_barrier(Barrier::SHADER_STORAGE);
        }

        let uniforms = Self::cull_uniforms(phase, commands, state, hi_z);
        let current = phase.visibility_slot();
        let bindings = [
            Binding::Buffer {
                slot: cull::COMMANDS,
                buffer: commands.commands().handle(),
            },
            Binding::Buffer {
                slot: cull::ENTITY_OFFSETS,
                buffer: commands.entity_offsets().handle(),
            },
            Binding::Buffer {
                slot: cull::COMMAND_BOUNDS,
                buffer: commands.bounds().handle(),
            },
            Binding::Buffer {
                slot: cull::ENTITIES,
                buffer: state.entities,
            },
            Binding::Buffer {
                slot: cull::CULL_STATE,
                buffer: commands.cull_state().handle(),
            },
            Binding::Buffer {
                slot: cull::VISIBILITY,
                buffer: self.visibility[current].handle(),
            },
            Binding::Buffer {
                slot: cull::PREVIOUS_VISIBILITY,
                buffer: self.visibility[current ^ 1].handle(),
            },
            Binding::Texture {
                slot: cull::HI_Z,
                texture: hi_z.texture(),
                mip: None,
            },
        ];

        api.dispatch_compute(&ComputeDispatch {
            label: "Visibility",
            program: ComputeProgram::Visibility,
            bindings: &bindings,
            uniforms: bytemuck::bytes_of(&uniforms),
            workgroups: instance_grid(commands.command_count(), commands.max_instances_per_command()),
        })?;
        // Flags and counters must be complete before compaction reads them
        api.memory_barrier(Barrier::SHADER_STORAGE);

        log::trace!(
            "[CullingPipeline::run] {} {:?}: {} commands, {} instances",
            self.label,
            phase,
            commands.command_count(),
            commands.instance_count()
        );
        Ok(())
    }

    /// Visibility buffer written by `phase`
    pub fn visibility(&self, phase: CullPhase) -> BufferHandle {
        self.visibility[phase.visibility_slot()].handle()
    }

    pub fn release<G: GraphicsApi + ?Sized>(self, api: &mut G) {
        let [first, second] = self.visibility;
        first.release(api);
        second.release(api);
    }
}
