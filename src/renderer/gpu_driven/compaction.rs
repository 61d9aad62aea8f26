//! Draw-call compaction
//!
//! Turns per-instance visibility flags into a tight set of indirect commands
//! and a compacted entity index list:
//!
//! 1. `CompactionOffsets` writes each command's `compacted_base`, the
//!    exclusive prefix sum of visible counts.
//! 2. `AppendParallel` (one invocation per instance) or `AppendSerial` (one
//!    invocation overall) appends every visible instance. The first instance
//!    of a command to win the `claimed` flag reserves a draw slot from the
//!    global counter and emits the command with its final visible count.
//!
//! Commands without survivors never claim a slot, so the draw count read by
//! the indirect draw equals the number of commands with at least one
//! visible instance.

use super::indirect_commands::IndirectCommandBuffers;
use crate::error::CullResult;
use crate::gpu::buffer_layouts::bindings::cull;
use crate::gpu::buffer_layouts::{CompactionUniforms, DrawCounts, DrawElementsIndirectCommand};
use crate::gpu::{
    instance_grid, Barrier, Binding, BufferHandle, BufferUsage, ComputeDispatch, ComputeProgram,
    GraphicsApi,
};
use crate::memory::PersistentBuffer;

/// Compacted buffers as read back from the device
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactedOutput {
    /// Compacted commands in draw-slot order
    pub commands: Vec<DrawElementsIndirectCommand>,
    /// Compacted base of each command, parallel to `commands`
    pub offsets: Vec<u32>,
    /// Entity index of every surviving instance
    pub entity_indices: Vec<u32>,
    pub draw_count: u32,
    pub entity_count: u32,
}

impl CompactedOutput {
    /// Sum of instance counts over compacted commands
    pub fn instance_total(&self) -> u64 {
        self.commands.iter().map(|c| c.instance_count as u64).sum()
    }

    pub fn vertices(&self) -> u64 {
        self.commands.iter().map(|c| c.vertices()).sum()
    }

    /// Entity indices each compacted command draws, in draw-slot order
    pub fn entities_per_command(&self) -> Vec<Vec<u32>> {
        self.commands
            .iter()
            .map(|c| {
                let start = c.base_instance as usize;
                let end = (start + c.instance_count as usize).min(self.entity_indices.len());
                self.entity_indices.get(start..end).map(<[u32]>::to_vec).unwrap_or_default()
            })
            .collect()
    }
}

pub struct DrawCompaction {
    label: String,
    commands_compacted: PersistentBuffer,
    offsets_compacted: PersistentBuffer,
    entities_compacted: PersistentBuffer,
    /// `DrawCounts`; offset 0 is the indirect draw count
    draw_counts: PersistentBuffer,

    /// Upper bound for the indirect draw count of the last execution
    max_draw_count: u32,
    /// Entities the last execution could have produced
    max_entity_count: u32,
}

impl DrawCompaction {
    pub fn new<G: GraphicsApi + ?Sized>(
        api: &mut G,
        label: &str,
        command_capacity: u32,
        instance_capacity: u32,
    ) -> CullResult<Self> {
        let indirect = BufferUsage::STORAGE | BufferUsage::INDIRECT;
        Ok(Self {
            label: label.to_string(),
            commands_compacted: PersistentBuffer::for_records::<DrawElementsIndirectCommand, _>(
                api,
                format!("{} Commands Compacted", label),
                indirect,
                command_capacity as usize,
            )?,
            offsets_compacted: PersistentBuffer::for_records::<u32, _>(
                api,
                format!("{} Offsets Compacted", label),
                BufferUsage::STORAGE,
                command_capacity as usize,
            )?,
            entities_compacted: PersistentBuffer::for_records::<u32, _>(
                api,
                format!("{} Entities Compacted", label),
                BufferUsage::STORAGE,
                instance_capacity as usize,
            )?,
            draw_counts: PersistentBuffer::for_records::<DrawCounts, _>(
                api,
                format!("{} Draw Counts", label),
                indirect,
                1,
            )?,
            max_draw_count: 0,
            max_entity_count: 0,
        })
    }

    /// Compact the instances flagged in `visibility`
    ///
    /// `parallel` selects the lock-free append; the serial append produces
    /// the same set in command order.
    pub fn execute<G: GraphicsApi + ?Sized>(
        &mut self,
        api: &mut G,
        commands: &IndirectCommandBuffers,
        visibility: BufferHandle,
        parallel: bool,
    ) -> CullResult<()> {
        let command_count = commands.command_count();
        self.commands_compacted
            .reserve_records::<DrawElementsIndirectCommand, _>(api, command_count as usize)?;
        self.offsets_compacted.reserve_records::<u32, _>(api, command_count as usize)?;
        self.entities_compacted
            .reserve_records::<u32, _>(api, commands.instance_count() as usize)?;

        api.clear_buffer(self.draw_counts.handle())?;
        self.max_draw_count = command_count;
        self.max_entity_count = commands.instance_count();
        if command_count == 0 {
            return Ok(());
        }

        let uniforms = CompactionUniforms {
            command_count,
            max_instances_per_command: commands.max_instances_per_command(),
            _padding: [0; 2],
        };

        api.dispatch_compute(&ComputeDispatch {
            label: "Compaction Offsets",
            program: ComputeProgram::CompactionOffsets,
            bindings: &[Binding::Buffer {
                slot: cull::CULL_STATE,
                buffer: commands.cull_state().handle(),
            }],
            uniforms: bytemuck::bytes_of(&uniforms),
            workgroups: [1, 1, 1],
        })?;
        api.memory_barrier(Barrier::SHADER_STORAGE);

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
                slot: cull::CULL_STATE,
                buffer: commands.cull_state().handle(),
            },
            Binding::Buffer {
                slot: cull::VISIBILITY,
                buffer: visibility,
            },
            Binding::Buffer {
                slot: cull::COMMANDS_COMPACTED,
                buffer: self.commands_compacted.handle(),
            },
            Binding::Buffer {
                slot: cull::OFFSETS_COMPACTED,
                buffer: self.offsets_compacted.handle(),
            },
            Binding::Buffer {
                slot: cull::ENTITIES_COMPACTED,
                buffer: self.entities_compacted.handle(),
            },
            Binding::Buffer {
                slot: cull::DRAW_COUNTS,
                buffer: self.draw_counts.handle(),
            },
        ];
        let (label, program, workgroups) = if parallel {
            (
                "Append Parallel",
                ComputeProgram::AppendParallel,
                instance_grid(command_count, commands.max_instances_per_command()),
            )
        } else {
            ("Append Serial", ComputeProgram::AppendSerial, [1, 1, 1])
        };
        api.dispatch_compute(&ComputeDispatch {
            label,
            program,
            bindings: &bindings,
            uniforms: bytemuck::bytes_of(&uniforms),
            workgroups,
        })?;
        // The indirect draw fetches commands and the count written above
        api.memory_barrier(Barrier::SHADER_STORAGE | Barrier::COMMAND | Barrier::IMAGE_ACCESS);

        log::trace!(
            "[DrawCompaction::execute] {}: {} commands via {}",
            self.label, command_count, label
        );
        Ok(())
    }

    /// Blocking readback of the compacted buffers; diagnostics only
    pub fn read_back<G: GraphicsApi + ?Sized>(&self, api: &mut G) -> CullResult<CompactedOutput> {
        let counts = self
            .draw_counts
            .read_back::<DrawCounts, _>(api, 1)?
            .first()
            .copied()
            .unwrap_or_default();
        let draw_count = counts.commands.min(self.max_draw_count);
        let entity_count = counts.entities.min(self.max_entity_count);

        Ok(CompactedOutput {
            commands: self
                .commands_compacted
                .read_back(api, draw_count as usize)?,
            offsets: self.offsets_compacted.read_back(api, draw_count as usize)?,
            entity_indices: self
                .entities_compacted
                .read_back(api, entity_count as usize)?,
            draw_count,
            entity_count,
        })
    }

    pub fn commands_compacted(&self) -> BufferHandle {
        self.commands_compacted.handle()
    }

    pub fn entities_compacted(&self) -> BufferHandle {
        self.entities_compacted.handle()
    }

    pub fn draw_counts(&self) -> BufferHandle {
        self.draw_counts.handle()
    }

    pub fn max_draw_count(&self) -> u32 {
        self.max_draw_count
    }

    pub fn release<G: GraphicsApi + ?Sized>(self, api: &mut G) {
        self.commands_compacted.release(api);
        self.offsets_compacted.release(api);
        self.entities_compacted.release(api);
        self.draw_counts.release(api);
    }
}
