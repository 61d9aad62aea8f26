use crate::error::CullResult;
use crate::gpu::buffer_layouts::{CommandBounds, CommandCullState, DrawElementsIndirectCommand};
use crate::gpu::{BufferUsage, GraphicsApi};
use crate::memory::PersistentBuffer;
use crate::state::RenderBatch;

/// Per-pool input buffers of the culling pipeline
///
/// Batch `i` becomes command `i`, entity offset `i`, bounds `i` and cull
/// state `i`. All four are grow-only and rewritten in full every prepare.
pub struct IndirectCommandBuffers {
    /// Original draw commands, copied verbatim from the batches
    commands: PersistentBuffer,

    /// First entity record of each command's instance range
    entity_offsets: PersistentBuffer,

    /// Mesh-local bounds of each command
    bounds: PersistentBuffer,

    /// Counters shared by the visibility and compaction kernels
    cull_state: PersistentBuffer,

    command_count: u32,
    instance_count: u32,
    max_instances_per_command: u32,
    /// Indices submitted if every instance survives
    vertex_count: u64,
}

impl IndirectCommandBuffers {
    pub fn new<G: GraphicsApi + ?Sized>(api: &mut G, label: &str, command_capacity: u32) -> CullResult<Self> {
        let capacity = command_capacity as usize;
        Ok(Self {
            commands: PersistentBuffer::for_records::<DrawElementsIndirectCommand, _>(
                api,
                format!("{} Commands", label),
                BufferUsage::STORAGE,
                capacity,
            )?,
            entity_offsets: PersistentBuffer::for_records::<u32, _>(
                api,
                format!("{} Entity Offsets", label),
                BufferUsage::STORAGE,
                capacity,
            )?,
            bounds: PersistentBuffer::for_records::<CommandBounds, _>(
                api,
                format!("{} Command Bounds", label),
                BufferUsage::STORAGE,
                capacity,
            )?,
            cull_state: PersistentBuffer::for_records::<CommandCullState, _>(
                api,
                format!("{} Cull State", label),
                BufferUsage::STORAGE,
                capacity,
            )?,
            command_count: 0,
            instance_count: 0,
            max_instances_per_command: 0,
            vertex_count: 0,
        })
    }

    /// Pack `batches` into the command, offset, bounds and cull-state buffers
    ///
    /// An empty slice leaves every count at zero; callers skip the pool.
    pub fn build<G: GraphicsApi + ?Sized>(&mut self, api: &mut G, batches: &[&RenderBatch]) -> CullResult<()> {
        let mut commands = Vec::with_capacity(batches.len());
        let mut offsets = Vec::with_capacity(batches.len());
        let mut bounds = Vec::with_capacity(batches.len());
        let mut cull_state = Vec::with_capacity(batches.len());

        let mut instance_offset = 0u32;
        let mut max_instances = 0u32;
        let mut vertex_count = 0u64;
        for batch in batches {
            let command = batch.draw_command;
            commands.push(command);
            offsets.push(batch.entity_buffer_index);
            bounds.push(CommandBounds::new(
                batch.mesh_bounds.min,
                batch.mesh_bounds.max,
                batch.bounding_sphere_radius,
            ));
            cull_state.push(CommandCullState::new(instance_offset));

            instance_offset += command.instance_count;
            max_instances = max_instances.max(command.instance_count);
            vertex_count += command.vertices();
        }

        let count = batches.len();
        self.commands.reserve_records::<DrawElementsIndirectCommand, _>(api, count)?;
        self.entity_offsets.reserve_records::<u32, _>(api, count)?;
        self.bounds.reserve_records::<CommandBounds, _>(api, count)?;
        self.cull_state.reserve_records::<CommandCullState, _>(api, count)?;

        self.commands.write(api, 0, &commands)?;
        self.entity_offsets.write(api, 0, &offsets)?;
        self.bounds.write(api, 0, &bounds)?;
        self.cull_state.write(api, 0, &cull_state)?;

        self.command_count = count as u32;
        self.instance_count = instance_offset;
        self.max_instances_per_command = max_instances;
        self.vertex_count = vertex_count;
        Ok(())
    }

    pub fn commands(&self) -> &PersistentBuffer {
        &self.commands
    }

    pub fn entity_offsets(&self) -> &PersistentBuffer {
        &self.entity_offsets
    }

    pub fn bounds(&self) -> &PersistentBuffer {
        &self.bounds
    }

    pub fn cull_state(&self) -> &PersistentBuffer {
        &self.cull_state
    }

    pub fn command_count(&self) -> u32 {
        self.command_count
    }

    pub fn instance_count(&self) -> u32 {
        self.instance_count
    }

    pub fn max_instances_per_command(&self) -> u32 {
        self.max_instances_per_command
    }

    pub fn vertex_count(&self) -> u64 {
        self.vertex_count
    }

    pub fn is_empty(&self) -> bool {
        self.command_count == 0
    }

    /// Commands as last written, from the CPU mapping
    pub fn mapped_commands(&self) -> Vec<DrawElementsIndirectCommand> {
        self.commands.mapped_records(self.command_count as usize)
    }

    /// Entity offsets as last written, from the CPU mapping
    pub fn mapped_entity_offsets(&self) -> Vec<u32> {
        self.entity_offsets.mapped_records(self.command_count as usize)
    }

    pub fn release<G: GraphicsApi + ?Sized>(self, api: &mut G) {
        self.commands.release(api);
        self.entity_offsets.release(api);
        self.bounds.release(api);
        self.cull_state.release(api);
    }
}
