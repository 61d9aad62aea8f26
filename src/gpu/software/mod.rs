//! CPU reference device
//!
//! Executes the pipeline's kernels on the host with the same data layouts,
//! binding slots and atomics as the WGSL versions. Workgroups are spread over
//! the rayon pool, so lock-free compaction really runs concurrently. Draws are
//! not rasterized: they are resolved against the bound buffers and recorded
//! for inspection, and the depth target holds whatever the host wrote into it.

mod kernels;


use super::buffer_layouts::DrawElementsIndirectCommand;
use super::{
    Barrier, Binding, BufferDesc, BufferHandle, BufferUsage, ComputeDispatch, ComputeProgram,
    DirectDraw, DrawUniforms, GraphicsApi, IndirectDraw, RasterState, RenderProgram, SlotKind,
    TextureDesc, TextureFormat, TextureHandle,
};
use crate::constants::culling::FAR_DEPTH;
use crate::error::{gpu_operation_error, CullError, CullResult};
use bytemuck::Pod;
use kernels::{ImageView, KernelContext, TextureView, MAX_SLOTS};
use rayon::prelude::*;
use std::sync::atomic::{AtomicU32, Ordering};

struct SoftBuffer {
    label: String,
    usage: BufferUsage,
    size: u64,
    words: Vec<AtomicU32>,
}

impl SoftBuffer {
    fn new(desc: &BufferDesc) -> Self {
        Self {
            label: desc.label.clone(),
            usage: desc.usage,
            size: desc.size,
            words: zeroed_words(desc.size.div_ceil(4) as usize),
        }
    }

    fn bytes(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.words.len() * 4);
        for word in &self.words {
            bytes.extend_from_slice(&word.load(Ordering::Relaxed).to_le_bytes());
        }
        bytes.truncate(self.size as usize);
        bytes
    }

    fn write(&self, offset: u64, data: &[u8]) -> CullResult<()> {
        let end = offset + data.len() as u64;
        if end > self.size {
            return Err(CullError::OutOfRange {
                label: self.label.clone(),
                offset,
                len: data.len() as u64,
                size: self.size,
            });
        }
        for (i, byte) in data.iter().enumerate() {
            let address = offset as usize + i;
            let word = &self.words[address / 4];
            let shift = (address % 4) * 8;
            let current = word.load(Ordering::Relaxed);
            let updated = (current & !(0xFF << shift)) | ((*byte as u32) << shift);
            word.store(updated, Ordering::Relaxed);
        }
        Ok(())
    }
}

struct SoftTexture {
    desc: TextureDesc,
    sizes: Vec<(u32, u32)>,
    mips: Vec<Vec<AtomicU32>>,
}

impl SoftTexture {
    fn new(desc: &TextureDesc, fill: f32) -> Self {
        let sizes = (0..desc.mip_levels).map(|level| desc.mip_size(level)).collect::<Vec<_>>();
        let mips = sizes
            .iter()
            .map(|&(w, h)| (0..w * h).map(|_| AtomicU32::new(fill.to_bits())).collect())
            .collect();
        Self {
            desc: desc.clone(),
            sizes,
            mips,
        }
    }

    fn byte_size(&self) -> u64 {
        self.sizes.iter().map(|&(w, h)| w as u64 * h as u64 * 4).sum()
    }

    fn view(&self, base_mip: u32) -> TextureView<'_> {
        TextureView {
            mips: &self.mips,
            sizes: &self.sizes,
            base_mip,
        }
    }
}

fn zeroed_words(count: usize) -> Vec<AtomicU32> {
    (0..count).map(|_| AtomicU32::new(0)).collect()
}

/// Everything the device was asked to do, in order
#[derive(Debug, Clone, PartialEq)]
pub enum LoggedCommand {
    CreateBuffer { buffer: BufferHandle, size: u64 },
    ResizeBuffer { buffer: BufferHandle, size: u64 },
    WriteBuffer { buffer: BufferHandle, offset: u64, len: u64 },
    ClearBuffer(BufferHandle),
    WriteTexture { texture: TextureHandle, mip: u32 },
    CopyTexture { src: TextureHandle, dst: TextureHandle },
    Dispatch {
        label: String,
        program: ComputeProgram,
        workgroups: [u32; 3],
    },
    Barrier(Barrier),
    SetRasterState(RasterState),
    DrawIndirect { label: String, draw_count: u32 },
    DrawDirect { label: String },
    Submit,
    Finish,
}

/// A draw as the device resolved it
#[derive(Debug, Clone, PartialEq)]
pub struct RecordedDraw {
    pub label: String,
    pub program: RenderProgram,
    pub raster: RasterState,
    pub indirect: bool,
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
    pub joints: Option<BufferHandle>,
    /// Commands actually executed (indirect count already applied)
    pub commands: Vec<DrawElementsIndirectCommand>,
    /// Entity index seen by each instance of each command
    pub instances: Vec<Vec<u32>>,
}

impl RecordedDraw {
    pub fn entities(&self) -> impl Iterator<Item = u32> + '_ {
        self.instances.iter().flatten().copied()
    }

    pub fn vertices(&self) -> u64 {
        self.commands.iter().map(|c| c.vertices()).sum()
    }
}

pub struct SoftwareGpu {
    buffers: Vec<Option<SoftBuffer>>,
    textures: Vec<Option<SoftTexture>>,
    depth_target: TextureHandle,
    raster: RasterState,

    memory_budget: Option<u64>,
    allocated: u64,

    draws: Vec<RecordedDraw>,
    log: Vec<LoggedCommand>,
    submissions: u64,
}

impl SoftwareGpu {
    /// Device with a `width` x `height` depth target cleared to the far plane
    pub fn new(width: u32, height: u32) -> Self {
        let depth = SoftTexture::new(
            &TextureDesc {
                label: "Software Depth Target".to_string(),
                width: width.max(1),
                height: height.max(1),
                mip_levels: 1,
                format: TextureFormat::Depth32Float,
            },
            FAR_DEPTH,
        );
        Self {
            buffers: Vec::new(),
            textures: vec![Some(depth)],
            depth_target: TextureHandle(0),
            raster: RasterState::default(),
            memory_budget: None,
            allocated: 0,
            draws: Vec::new(),
            log: Vec::new(),
            submissions: 0,
        }
    }

    /// Fail allocations once buffers and textures exceed `bytes`
    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = Some(bytes);
        self
    }

    fn reserve(&mut self, label: &str, bytes: u64) -> CullResult<()> {
        if let Some(budget) = self.memory_budget {
            if self.allocated + bytes > budget {
                log::warn!(
                    "[SoftwareGpu::reserve] '{}' needs {} bytes, {} of {} in use",
                    label, bytes, self.allocated, budget
                );
                return Err(CullError::OutOfMemory {
                    label: label.to_string(),
                    requested: bytes,
                    budget,
                });
            }
        }
        self.allocated += bytes;
        Ok(())
    }

    fn buffer(&self, handle: BufferHandle) -> CullResult<&SoftBuffer> {
        self.buffers
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(CullError::InvalidBuffer(handle))
    }

    fn texture(&self, handle: TextureHandle) -> CullResult<&SoftTexture> {
        self.textures
            .get(handle.0 as usize)
            .and_then(Option::as_ref)
            .ok_or(CullError::InvalidTexture(handle))
    }

    /// Replace the depth target with a far-cleared one of a new size
    pub fn resize_depth_target(&mut self, width: u32, height: u32) {
        let desc = TextureDesc {
            label: "Software Depth Target".to_string(),
            width: width.max(1),
            height: height.max(1),
            mip_levels: 1,
            format: TextureFormat::Depth32Float,
        };
        self.textures[self.depth_target.0 as usize] = Some(SoftTexture::new(&desc, FAR_DEPTH));
    }

    /// Fill the depth target with one value
    pub fn fill_depth(&mut self, depth: f32) -> CullResult<()> {
        let (width, height) = self.texture(self.depth_target)?.desc.mip_size(0);
        self.write_texture(self.depth_target, 0, &vec![depth; (width * height) as usize])
    }

    pub fn draws(&self) -> &[RecordedDraw] {
        &self.draws
    }

    pub fn take_draws(&mut self) -> Vec<RecordedDraw> {
        std::mem::take(&mut self.draws)
    }

    pub fn command_log(&self) -> &[LoggedCommand] {
        &self.log
    }

    pub fn clear_command_log(&mut self) {
        self.log.clear();
    }

    pub fn submissions(&self) -> u64 {
        self.submissions
    }

    pub fn raster_state(&self) -> RasterState {
        self.raster
    }

    pub fn allocated_bytes(&self) -> u64 {
        self.allocated
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.iter().flatten().count()
    }

    /// Texels of one mip level, row major
    pub fn texture_texels(&self, texture: TextureHandle, mip: u32) -> Option<Vec<f32>> {
        let texture = self.texture(texture).ok()?;
        let texels = texture.mips.get(mip as usize)?;
        Some(texels.iter().map(|t| f32::from_bits(t.load(Ordering::Relaxed))).collect())
    }

    /// Whole buffer reinterpreted as records of `T`
    pub fn read_records<T: Pod>(&self, buffer: BufferHandle) -> CullResult<Vec<T>> {
        let bytes = self.buffer(buffer)?.bytes();
        let stride = std::mem::size_of::<T>();
        Ok(bytes
            .chunks_exact(stride)
            .map(bytemuck::pod_read_unaligned::<T>)
            .collect())
    }

    fn resolve<'a>(&'a self, dispatch: &ComputeDispatch<'_>) -> CullResult<KernelContext<'a>> {
        let mut ctx = KernelContext::new();
        for binding in dispatch.bindings {
            let slot = binding.slot() as usize;
            if slot >= MAX_SLOTS {
                return Err(CullError::Unsupported(format!("binding slot {} out of range", slot)));
            }
            match *binding {
                Binding::Buffer { buffer, .. } => {
                    ctx.buffers[slot] = Some(&self.buffer(buffer)?.words);
                }
                Binding::Texture { texture, mip, .. } => {
                    let texture = self.texture(texture)?;
                    ctx.textures[slot] = Some(texture.view(mip.unwrap_or(0)));
                }
                Binding::Image { texture, mip, .. } => {
                    let texture = self.texture(texture)?;
                    let &(width, height) = texture
                        .sizes
                        .get(mip as usize)
                        .ok_or_else(|| CullError::TextureMismatch(format!("{} has no mip {}", texture.desc.label, mip)))?;
                    ctx.images[slot] = Some(ImageView {
                        texels: &texture.mips[mip as usize],
                        width,
                        height,
                    });
                }
            }
        }

        for required in dispatch.program.slots() {
            let slot = required.slot as usize;
            let bound = match required.kind {
                SlotKind::StorageRead | SlotKind::StorageReadWrite => ctx.buffers[slot].is_some(),
                SlotKind::DepthTexture | SlotKind::FloatTexture => ctx.textures[slot].is_some(),
                SlotKind::Image => ctx.images[slot].is_some(),
            };
            if !bound {
                return Err(CullError::MissingBinding {
                    program: dispatch.program,
                    slot: required.slot,
                });
            }
        }
        Ok(ctx)
    }

    fn resolve_instances(&self, uniforms: &DrawUniforms, command: &DrawElementsIndirectCommand) -> CullResult<Vec<u32>> {
        let indices = &self.buffer(uniforms.entity_indices())?.words;
        Ok((0..command.instance_count)
            .map(|i| kernels::load(indices, (command.base_instance + i) as usize))
            .collect())
    }

    fn check_draw_resources(&self, uniforms: &DrawUniforms, vertex: BufferHandle, index: BufferHandle) -> CullResult<()> {
        self.buffer(vertex)?;
        self.buffer(index)?;
        self.buffer(uniforms.entities())?;
        self.buffer(uniforms.materials())?;
        if let Some(joints) = uniforms.joints() {
            self.buffer(joints)?;
        }
        Ok(())
    }
}

/// Launch `kernel` once per invocation of the grid, workgroups in parallel
fn launch<F>(workgroups: [u32; 3], group_size: [u32; 3], kernel: F)
where
    F: Fn([u32; 3]) + Sync,
{
    let [gx, gy, gz] = workgroups;
    let total = gx as u64 * gy as u64 * gz as u64;
    (0..total).into_par_iter().for_each(|group| {
        let wx = (group % gx as u64) as u32;
        let wy = ((group / gx as u64) % gy as u64) as u32;
        let wz = (group / (gx as u64 * gy as u64)) as u32;
        for lz in 0..group_size[2] {
            for ly in 0..group_size[1] {
                for lx in 0..group_size[0] {
                    kernel([
                        wx * group_size[0] + lx,
                        wy * group_size[1] + ly,
                        wz * group_size[2] + lz,
                    ]);
                }
            }
        }
    });
}

fn parse_uniforms<T: Pod>(program: ComputeProgram, bytes: &[u8]) -> CullResult<T> {
    let size = std::mem::size_of::<T>();
    if bytes.len() < size {
        return Err(gpu_operation_error(
            "dispatch_compute",
            format!("{:?} needs {} uniform bytes, got {}", program, size, bytes.len()),
        ));
    }
    Ok(bytemuck::pod_read_unaligned(&bytes[..size]))
}

impl GraphicsApi for SoftwareGpu {
    fn backend_name(&self) -> &'static str {
        "software"
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> CullResult<BufferHandle> {
        self.reserve(&desc.label, desc.size)?;
        let handle = BufferHandle(self.buffers.len() as u32);
        self.buffers.push(Some(SoftBuffer::new(desc)));
        self.log.push(LoggedCommand::CreateBuffer {
            buffer: handle,
            size: desc.size,
        });
        Ok(handle)
    }

    fn resize_buffer(&mut self, buffer: BufferHandle, new_size: u64) -> CullResult<()> {
        let (label, old_size) = {
            let existing = self.buffer(buffer)?;
            (existing.label.clone(), existing.size)
        };
        if new_size == old_size {
            return Ok(());
        }
        if new_size > old_size {
            self.reserve(&label, new_size - old_size)?;
        } else {
            self.allocated -= old_size - new_size;
        }

        let Some(existing) = self.buffers.get_mut(buffer.0 as usize).and_then(Option::as_mut) else {
            return Err(CullError::InvalidBuffer(buffer));
        };
        let word_count = new_size.div_ceil(4) as usize;
        let mut words = std::mem::take(&mut existing.words);
        words.truncate(word_count);
        words.extend((words.len()..word_count).map(|_| AtomicU32::new(0)));
        existing.words = words;
        existing.size = new_size;

        self.log.push(LoggedCommand::ResizeBuffer { buffer, size: new_size });
        Ok(())
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(slot) = self.buffers.get_mut(buffer.0 as usize) {
            if let Some(existing) = slot.take() {
                self.allocated -= existing.size;
            }
        }
    }

    fn buffer_size(&self, buffer: BufferHandle) -> Option<u64> {
        self.buffer(buffer).ok().map(|b| b.size)
    }

    fn write_buffer(&mut self, buffer: BufferHandle, offset: u64, data: &[u8]) -> CullResult<()> {
        self.buffer(buffer)?.write(offset, data)?;
        self.log.push(LoggedCommand::WriteBuffer {
            buffer,
            offset,
            len: data.len() as u64,
        });
        Ok(())
    }

    fn clear_buffer(&mut self, buffer: BufferHandle) -> CullResult<()> {
        for word in &self.buffer(buffer)?.words {
            word.store(0, Ordering::Relaxed);
        }
        self.log.push(LoggedCommand::ClearBuffer(buffer));
        Ok(())
    }

    fn read_buffer(&mut self, buffer: BufferHandle) -> CullResult<Vec<u8>> {
        Ok(self.buffer(buffer)?.bytes())
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> CullResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 {
            return Err(CullError::TextureMismatch(format!(
                "'{}' is {}x{} with {} mips",
                desc.label, desc.width, desc.height, desc.mip_levels
            )));
        }
        let texture = SoftTexture::new(desc, 0.0);
        self.reserve(&desc.label, texture.byte_size())?;
        let handle = TextureHandle(self.textures.len() as u32);
        self.textures.push(Some(texture));
        Ok(handle)
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if texture == self.depth_target {
            return;
        }
        if let Some(slot) = self.textures.get_mut(texture.0 as usize) {
            if let Some(existing) = slot.take() {
                self.allocated -= existing.byte_size();
            }
        }
    }

    fn texture_desc(&self, texture: TextureHandle) -> Option<TextureDesc> {
        self.texture(texture).ok().map(|t| t.desc.clone())
    }

    fn write_texture(&mut self, texture: TextureHandle, mip: u32, texels: &[f32]) -> CullResult<()> {
        let target = self.texture(texture)?;
        let level = target
            .mips
            .get(mip as usize)
            .ok_or_else(|| CullError::TextureMismatch(format!("{} has no mip {}", target.desc.label, mip)))?;
        if level.len() != texels.len() {
            return Err(CullError::TextureMismatch(format!(
                "{} mip {} holds {} texels, got {}",
                target.desc.label,
                mip,
                level.len(),
                texels.len()
            )));
        }
        for (dst, src) in level.iter().zip(texels) {
            dst.store(src.to_bits(), Ordering::Relaxed);
        }
        self.log.push(LoggedCommand::WriteTexture { texture, mip });
        Ok(())
    }

    fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle) -> CullResult<()> {
        let source = self.texture(src)?;
        let target = self.texture(dst)?;
        if source.sizes[0] != target.sizes[0] || source.desc.format != target.desc.format {
            return Err(CullError::TextureMismatch(format!(
                "cannot copy {} {:?} {:?} into {} {:?} {:?}",
                source.desc.label,
                source.sizes[0],
                source.desc.format,
                target.desc.label,
                target.sizes[0],
                target.desc.format
            )));
        }
        for (d, s) in target.mips[0].iter().zip(&source.mips[0]) {
            d.store(s.load(Ordering::Relaxed), Ordering::Relaxed);
        }
        self.log.push(LoggedCommand::CopyTexture { src, dst });
        Ok(())
    }

    fn depth_target(&self) -> TextureHandle {
        self.depth_target
    }

    fn dispatch_compute(&mut self, dispatch: &ComputeDispatch<'_>) -> CullResult<()> {
        {
            let ctx = self.resolve(dispatch)?;
            let ctx = &ctx;
            let group_size = dispatch.program.workgroup_size();
            match dispatch.program {
                ComputeProgram::Visibility => {
                    let u = parse_uniforms(dispatch.program, dispatch.uniforms)?;
                    launch(dispatch.workgroups, group_size, |id| kernels::visibility(ctx, &u, id));
                }
                ComputeProgram::ResetCullState => {
                    let u = parse_uniforms(dispatch.program, dispatch.uniforms)?;
                    launch(dispatch.workgroups, group_size, |id| kernels::reset_cull_state(ctx, &u, id));
                }
                ComputeProgram::CompactionOffsets => {
                    let u = parse_uniforms(dispatch.program, dispatch.uniforms)?;
                    launch(dispatch.workgroups, group_size, |id| kernels::compaction_offsets(ctx, &u, id));
                }
                ComputeProgram::AppendParallel => {
                    let u = parse_uniforms(dispatch.program, dispatch.uniforms)?;
                    launch(dispatch.workgroups, group_size, |id| kernels::append_parallel(ctx, &u, id));
                }
                ComputeProgram::AppendSerial => {
                    let u = parse_uniforms(dispatch.program, dispatch.uniforms)?;
                    launch(dispatch.workgroups, group_size, |id| kernels::append_serial(ctx, &u, id));
                }
                ComputeProgram::HiZBase | ComputeProgram::HiZDownsample => {
                    let u = parse_uniforms(dispatch.program, dispatch.uniforms)?;
                    launch(dispatch.workgroups, group_size, |id| kernels::hi_z_reduce(ctx, &u, id));
                }
            }
        }

        log::trace!(
            "[SoftwareGpu::dispatch_compute] {} {:?} x {:?}",
            dispatch.label, dispatch.program, dispatch.workgroups
        );
        self.log.push(LoggedCommand::Dispatch {
            label: dispatch.label.to_string(),
            program: dispatch.program,
            workgroups: dispatch.workgroups,
        });
        Ok(())
    }

    fn memory_barrier(&mut self, barrier: Barrier) {
        // Dispatches complete before returning; only the ordering is recorded
        self.log.push(LoggedCommand::Barrier(barrier));
    }

    fn set_raster_state(&mut self, state: &RasterState) {
        self.raster = *state;
        self.log.push(LoggedCommand::SetRasterState(*state));
    }

    fn draw_indexed_indirect_count(&mut self, draw: &IndirectDraw<'_>) -> CullResult<()> {
        self.check_draw_resources(draw.uniforms, draw.vertex_buffer, draw.index_buffer)?;
        let commands_buffer = self.buffer(draw.commands)?;
        let count_buffer = self.buffer(draw.count_buffer)?;
        for (buffer, name) in [(commands_buffer, "commands"), (count_buffer, "count")] {
            if !buffer.usage.contains(BufferUsage::INDIRECT) {
                return Err(gpu_operation_error(
                    "draw_indexed_indirect_count",
                    format!("{} buffer '{}' lacks INDIRECT usage", name, buffer.label),
                ));
            }
        }
        if draw.count_offset % 4 != 0 {
            return Err(gpu_operation_error(
                "draw_indexed_indirect_count",
                format!("count offset {} is not 4-byte aligned", draw.count_offset),
            ));
        }

        let gpu_count = kernels::load(&count_buffer.words, (draw.count_offset / 4) as usize);
        let draw_count = gpu_count.min(draw.max_draw_count);
        let mut commands = Vec::with_capacity(draw_count as usize);
        let mut instances = Vec::with_capacity(draw_count as usize);
        for i in 0..draw_count as usize {
            let command: DrawElementsIndirectCommand = kernels::read_record(&commands_buffer.words, i)
                .ok_or_else(|| gpu_operation_error("draw_indexed_indirect_count", "indirect command out of range"))?;
            instances.push(self.resolve_instances(draw.uniforms, &command)?);
            commands.push(command);
        }

        self.draws.push(RecordedDraw {
            label: draw.label.to_string(),
            program: draw.program,
            raster: self.raster,
            indirect: true,
            vertex_buffer: draw.vertex_buffer,
            index_buffer: draw.index_buffer,
            joints: draw.uniforms.joints(),
            commands,
            instances,
        });
        self.log.push(LoggedCommand::DrawIndirect {
            label: draw.label.to_string(),
            draw_count,
        });
        Ok(())
    }

    fn draw_indexed(&mut self, draw: &DirectDraw<'_>) -> CullResult<()> {
        self.check_draw_resources(draw.uniforms, draw.vertex_buffer, draw.index_buffer)?;
        let instances = self.resolve_instances(draw.uniforms, &draw.command)?;
        self.draws.push(RecordedDraw {
            label: draw.label.to_string(),
            program: draw.program,
            raster: self.raster,
            indirect: false,
            vertex_buffer: draw.vertex_buffer,
            index_buffer: draw.index_buffer,
            joints: draw.uniforms.joints(),
            commands: vec![draw.command],
            instances: vec![instances],
        });
        self.log.push(LoggedCommand::DrawDirect {
            label: draw.label.to_string(),
        });
        Ok(())
    }

    fn submit(&mut self) -> CullResult<()> {
        self.submissions += 1;
        self.log.push(LoggedCommand::Submit);
        Ok(())
    }

    fn finish(&mut self) -> CullResult<()> {
        self.submissions += 1;
        self.log.push(LoggedCommand::Finish);
        Ok(())
    }
}
