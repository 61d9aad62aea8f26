//! wgpu implementation of [`GraphicsApi`]
//!
//! Work is recorded into one lazily created command encoder and handed to
//! the queue on [`GraphicsApi::submit`]. Every dispatch and draw gets its own
//! pass, so wgpu's resource tracking places the hazards the pipeline's
//! explicit barriers describe; `memory_barrier` itself only traces.
//!
//! Queue writes land before everything recorded in the same submission, so
//! buffer and texture writes flush pending work first. Uniform blocks go
//! through a ring bound with dynamic offsets and never alias within one
//! submission.

mod pipelines;

pub use pipelines::REQUIRED_FEATURES;

use crate::constants::buffers::UNIFORM_RING_SIZE;
use crate::constants::culling::FAR_DEPTH;
use crate::error::{CullError, CullResult, GpuErrorContext};
use crate::gpu::buffer_layouts::bindings::draw;
use crate::gpu::buffer_layouts::{DrawElementsIndirectCommand, FRAME_UNIFORMS_SIZE};
use crate::gpu::{
    Barrier, Binding, BufferDesc, BufferHandle, BufferUsage, ComputeDispatch, DirectDraw,
    DrawUniforms, GraphicsApi, IndirectDraw, PolygonMode, ProgramId, RasterState, RenderProgram,
    TextureDesc, TextureFormat, TextureHandle,
};
use crate::state::PoolKind;
use pipelines::{ComputePipelines, RenderPipelines, DEPTH_FORMAT};
use std::num::NonZeroU64;
use std::sync::Arc;

struct GpuBuffer {
    label: String,
    /// Size requested by the caller; the allocation is padded to 4 bytes
    size: u64,
    buffer: wgpu::Buffer,
}

struct GpuTexture {
    desc: TextureDesc,
    texture: wgpu::Texture,
    full_view: wgpu::TextureView,
    mip_views: Vec<wgpu::TextureView>,
}

impl GpuTexture {
    fn view(&self, mip: Option<u32>) -> CullResult<&wgpu::TextureView> {
        match mip {
            None => Ok(&self.full_view),
            Some(level) => self.mip_views.get(level as usize).ok_or_else(|| {
                CullError::TextureMismatch(format!(
                    "'{}' has {} mips, level {} requested",
                    self.desc.label, self.desc.mip_levels, level
                ))
            }),
        }
    }
}

/// Dynamic-offset uniform storage shared by all dispatches and draws
struct UniformRing {
    buffer: wgpu::Buffer,
    size: u64,
    alignment: u64,
    cursor: u64,
}

/// What a first-pass render pass issues once its state is bound
#[derive(Clone, Copy)]
enum DrawCall {
    Indirect {
        commands: BufferHandle,
        count: BufferHandle,
        count_offset: u64,
        max_draw_count: u32,
    },
    Direct(DrawElementsIndirectCommand),
}

fn padded(size: u64) -> u64 {
    size.max(wgpu::COPY_BUFFER_ALIGNMENT).next_multiple_of(wgpu::COPY_BUFFER_ALIGNMENT)
}

fn buffer_entry(buffers: &[Option<GpuBuffer>], handle: BufferHandle) -> CullResult<&GpuBuffer> {
    buffers
        .get(handle.0 as usize)
        .and_then(Option::as_ref)
        .ok_or(CullError::InvalidBuffer(handle))
}

fn texture_entry(textures: &[Option<GpuTexture>], handle: TextureHandle) -> CullResult<&GpuTexture> {
    textures
        .get(handle.0 as usize)
        .and_then(Option::as_ref)
        .ok_or(CullError::InvalidTexture(handle))
}

fn recording<'a>(encoder: &'a mut Option<wgpu::CommandEncoder>, device: &wgpu::Device) -> &'a mut wgpu::CommandEncoder {
    encoder.get_or_insert_with(|| {
        device.create_command_encoder(&wgpu::CommandEncoderDescriptor {
            label: Some("First Pass Encoder"),
        })
    })
}

fn wgpu_usage(usage: BufferUsage) -> wgpu::BufferUsages {
    let mut out = wgpu::BufferUsages::COPY_SRC | wgpu::BufferUsages::COPY_DST;
    for (ours, theirs) in [
        (BufferUsage::STORAGE, wgpu::BufferUsages::STORAGE),
        (BufferUsage::INDIRECT, wgpu::BufferUsages::INDIRECT),
        (BufferUsage::UNIFORM, wgpu::BufferUsages::UNIFORM),
        (BufferUsage::VERTEX, wgpu::BufferUsages::VERTEX),
        (BufferUsage::INDEX, wgpu::BufferUsages::INDEX),
    ] {
        if usage.contains(ours) {
            out |= theirs;
        }
    }
    out
}

pub struct WgpuGraphics {
    device: Arc<wgpu::Device>,
    queue: Arc<wgpu::Queue>,

    buffers: Vec<Option<GpuBuffer>>,
    textures: Vec<Option<GpuTexture>>,
    /// Buffers replaced or destroyed while still referenced by recorded work
    retired: Vec<wgpu::Buffer>,

    encoder: Option<wgpu::CommandEncoder>,
    ring: UniformRing,
    compute: ComputePipelines,
    render: RenderPipelines,

    color_format: wgpu::TextureFormat,
    color_target: wgpu::Texture,
    color_view: wgpu::TextureView,
    depth_target: TextureHandle,

    raster: RasterState,
    line_mode_supported: bool,
    warned_line_mode: bool,
    /// The next render pass clears color and depth instead of loading them
    clear_targets: bool,
    submissions: u64,
}

impl WgpuGraphics {
    /// Wrap an existing device; `width` x `height` sizes the owned render targets
    pub fn new(
        device: Arc<wgpu::Device>,
        queue: Arc<wgpu::Queue>,
        width: u32,
        height: u32,
        color_format: wgpu::TextureFormat,
    ) -> CullResult<Self> {
        let missing = REQUIRED_FEATURES - device.features();
        if !missing.is_empty() {
            return Err(CullError::Unsupported(format!(
                "device lacks required features {:?}",
                missing
            )));
        }

        let alignment = device.limits().min_uniform_buffer_offset_alignment as u64;
        let ring = UniformRing {
            buffer: device.create_buffer(&wgpu::BufferDescriptor {
                label: Some("Uniform Ring"),
                size: UNIFORM_RING_SIZE,
                usage: wgpu::BufferUsages::UNIFORM | wgpu::BufferUsages::COPY_DST,
                mapped_at_creation: false,
            }),
            size: UNIFORM_RING_SIZE,
            alignment,
            cursor: 0,
        };

        let compute = ComputePipelines::new(&device);
        let render = RenderPipelines::new(&device, color_format);
        let (color_target, color_view) = Self::create_color_target(&device, width, height, color_format);
        let line_mode_supported = device.features().contains(wgpu::Features::POLYGON_MODE_LINE);

        let mut graphics = Self {
            device,
            queue,
            buffers: Vec::new(),
            textures: Vec::new(),
            retired: Vec::new(),
            encoder: None,
            ring,
            compute,
            render,
            color_format,
            color_target,
            color_view,
            depth_target: TextureHandle(0),
            raster: RasterState::default(),
            line_mode_supported,
            warned_line_mode: false,
            clear_targets: true,
            submissions: 0,
        };
        graphics.depth_target = graphics.create_texture(&TextureDesc {
            label: "First Pass Depth".to_string(),
            width,
            height,
            mip_levels: 1,
            format: TextureFormat::Depth32Float,
        })?;

        log::info!(
            "[WgpuGraphics::new] {}x{} targets, color {:?}, line mode {}",
            width,
            height,
            color_format,
            if line_mode_supported { "available" } else { "unavailable" }
        );
        Ok(graphics)
    }

    /// Create a headless device on the default adapter
    pub fn request(width: u32, height: u32) -> CullResult<Self> {
        let (device, queue) = pollster::block_on(async {
            let instance = wgpu::Instance::new(wgpu::InstanceDescriptor::default());
            let adapter = instance
                .request_adapter(&wgpu::RequestAdapterOptions {
                    power_preference: wgpu::PowerPreference::HighPerformance,
                    force_fallback_adapter: false,
                    compatible_surface: None,
                })
                .await
                .ok_or_else(|| CullError::Unsupported("no compatible GPU adapter".to_string()))?;

            log::info!("[WgpuGraphics::request] Using adapter {:?}", adapter.get_info().name);
            let optional = adapter.features() & wgpu::Features::POLYGON_MODE_LINE;
            adapter
                .request_device(
                    &wgpu::DeviceDescriptor {
                        label: Some("First Pass Device"),
                        required_features: REQUIRED_FEATURES | optional,
                        required_limits: adapter.limits(),
                    },
                    None,
                )
                .await
                .gpu_context("request_device")
        })?;

        Self::new(
            Arc::new(device),
            Arc::new(queue),
            width,
            height,
            wgpu::TextureFormat::Rgba8Unorm,
        )
    }

    fn create_color_target(
        device: &wgpu::Device,
        width: u32,
        height: u32,
        format: wgpu::TextureFormat,
    ) -> (wgpu::Texture, wgpu::TextureView) {
        let texture = device.create_texture(&wgpu::TextureDescriptor {
            label: Some("First Pass Color"),
            size: wgpu::Extent3d {
                width: width.max(1),
                height: height.max(1),
                depth_or_array_layers: 1,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage: wgpu::TextureUsages::RENDER_ATTACHMENT | wgpu::TextureUsages::COPY_SRC,
            view_formats: &[],
        });
        let view = texture.create_view(&wgpu::TextureViewDescriptor::default());
        (texture, view)
    }

    pub fn device(&self) -> &Arc<wgpu::Device> {
        &self.device
    }

    pub fn queue(&self) -> &Arc<wgpu::Queue> {
        &self.queue
    }

    pub fn color_target(&self) -> &wgpu::Texture {
        &self.color_target
    }

    /// Register a draw program for batches with an exclusive shader
    ///
    /// The WGSL must export `vs_main` and `fs_main` and use the bindings and
    /// vertex format of `pool`.
    pub fn register_program(&mut self, label: &str, wgsl: &str, pool: PoolKind) -> ProgramId {
        self.render.register(&self.device, label, wgsl, pool)
    }

    /// Clear color and depth at the start of the next render pass
    pub fn begin_frame(&mut self) {
        self.clear_targets = true;
    }

    /// Reallocate the owned color and depth targets
    pub fn resize_targets(&mut self, width: u32, height: u32) -> CullResult<()> {
        self.flush();
        let (color_target, color_view) =
            Self::create_color_target(&self.device, width, height, self.color_format);
        self.color_target = color_target;
        self.color_view = color_view;

        let old_depth = self.depth_target;
        self.depth_target = self.create_texture(&TextureDesc {
            label: "First Pass Depth".to_string(),
            width,
            height,
            mip_levels: 1,
            format: TextureFormat::Depth32Float,
        })?;
        self.destroy_texture(old_depth);
        self.clear_targets = true;
        Ok(())
    }

    pub fn submission_count(&self) -> u64 {
        self.submissions
    }

    /// Submit everything recorded so far
    fn flush(&mut self) {
        if let Some(encoder) = self.encoder.take() {
            self.queue.submit(std::iter::once(encoder.finish()));
            self.submissions += 1;
        }
        self.retired.clear();
        self.ring.cursor = 0;
    }

    /// Copy `bytes` into the uniform ring and return their dynamic offset
    fn push_uniforms(&mut self, bytes: &[u8], binding_size: u64) -> CullResult<u32> {
        if (bytes.len() as u64) < binding_size {
            return Err(CullError::GpuOperationFailed {
                operation: "push_uniforms".to_string(),
                error: format!("{} byte block for a {} byte binding", bytes.len(), binding_size),
            });
        }
        let size = padded(bytes.len() as u64);
        let mut offset = self.ring.cursor.next_multiple_of(self.ring.alignment);
        if offset + size > self.ring.size {
            // Earlier blocks are still referenced by recorded passes
            self.flush();
            offset = 0;
        }

        let mut block = bytes.to_vec();
        block.resize(size as usize, 0);
        self.queue.write_buffer(&self.ring.buffer, offset, &block);
        self.ring.cursor = offset + size;
        Ok(offset as u32)
    }

    fn draw_bind_group(&mut self, pool: PoolKind, uniforms: &DrawUniforms) -> CullResult<(wgpu::BindGroup, u32)> {
        let offset = self.push_uniforms(bytemuck::bytes_of(uniforms.frame()), FRAME_UNIFORMS_SIZE)?;

        let mut resources = vec![
            (draw::ENTITIES, uniforms.entities()),
            (draw::MATERIALS, uniforms.materials()),
            (draw::ENTITY_INDICES, uniforms.entity_indices()),
        ];
        if pool == PoolKind::Animated {
            let joints = uniforms.joints().ok_or_else(|| {
                CullError::Unsupported("animated draw program used with static-pool uniforms".to_string())
            })?;
            resources.push((draw::JOINTS, joints));
        }

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: draw::FRAME,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &self.ring.buffer,
                offset: 0,
                size: NonZeroU64::new(FRAME_UNIFORMS_SIZE),
            }),
        }];
        for (binding, handle) in resources {
            entries.push(wgpu::BindGroupEntry {
                binding,
                resource: buffer_entry(&self.buffers, handle)?.buffer.as_entire_binding(),
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("First Pass Draw Bind Group"),
            layout: self.render.bind_group_layout(pool),
            entries: &entries,
        });
        Ok((bind_group, offset))
    }

    /// Record one draw in its own render pass over the owned targets
    fn record_draw(
        &mut self,
        label: &str,
        program: RenderProgram,
        uniforms: &DrawUniforms,
        vertex_buffer: BufferHandle,
        index_buffer: BufferHandle,
        call: DrawCall,
    ) -> CullResult<()> {
        let pool = self.render.pool_of(program)?;
        let (bind_group, offset) = self.draw_bind_group(pool, uniforms)?;
        self.render.pipeline(&self.device, program, self.raster)?;

        let (color_load, depth_load) = if self.clear_targets {
            (wgpu::LoadOp::Clear(wgpu::Color::BLACK), wgpu::LoadOp::Clear(FAR_DEPTH))
        } else {
            (wgpu::LoadOp::Load, wgpu::LoadOp::Load)
        };

        // Resolve everything before the pass borrows the encoder
        let pipeline = self.render.cached(program, self.raster)?;
        let depth = texture_entry(&self.textures, self.depth_target)?;
        let vertices = buffer_entry(&self.buffers, vertex_buffer)?;
        let indices = buffer_entry(&self.buffers, index_buffer)?;
        let indirect = match call {
            DrawCall::Indirect { commands, count, .. } => Some((
                buffer_entry(&self.buffers, commands)?,
                buffer_entry(&self.buffers, count)?,
            )),
            DrawCall::Direct(_) => None,
        };

        let encoder = recording(&mut self.encoder, &self.device);
        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: Some(label),
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: &self.color_view,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: color_load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: Some(wgpu::RenderPassDepthStencilAttachment {
                view: &depth.full_view,
                depth_ops: Some(wgpu::Operations {
                    load: depth_load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_pipeline(pipeline);
        pass.set_bind_group(0, &bind_group, &[offset]);
        pass.set_vertex_buffer(0, vertices.buffer.slice(..));
        pass.set_index_buffer(indices.buffer.slice(..), wgpu::IndexFormat::Uint32);

        match (call, indirect) {
            (
                DrawCall::Indirect {
                    count_offset,
                    max_draw_count,
                    ..
                },
                Some((commands, count)),
            ) => {
                pass.multi_draw_indexed_indirect_count(&commands.buffer, 0, &count.buffer, count_offset, max_draw_count);
            }
            (DrawCall::Direct(command), _) => {
                pass.draw_indexed(
                    command.first_index..command.first_index + command.count,
                    command.base_vertex,
                    command.base_instance..command.base_instance + command.instance_count,
                );
            }
            (DrawCall::Indirect { .. }, None) => {}
        }
        drop(pass);

        self.clear_targets = false;
        Ok(())
    }
}

impl GraphicsApi for WgpuGraphics {
    fn backend_name(&self) -> &'static str {
        "wgpu"
    }

    fn create_buffer(&mut self, desc: &BufferDesc) -> CullResult<BufferHandle> {
        let size = padded(desc.size);
        let limit = self.device.limits().max_buffer_size;
        if size > limit {
            return Err(CullError::OutOfMemory {
                label: desc.label.clone(),
                requested: size,
                budget: limit,
            });
        }

        self.device.push_error_scope(wgpu::ErrorFilter::OutOfMemory);
        let buffer = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&desc.label),
            size,
            usage: wgpu_usage(desc.usage),
            mapped_at_creation: false,
        });
        if let Some(error) = pollster::block_on(self.device.pop_error_scope()) {
            log::error!("[WgpuGraphics::create_buffer] '{}': {}", desc.label, error);
            return Err(CullError::OutOfMemory {
                label: desc.label.clone(),
                requested: size,
                budget: limit,
            });
        }

        self.buffers.push(Some(GpuBuffer {
            label: desc.label.clone(),
            size: desc.size,
            buffer,
        }));
        Ok(BufferHandle(self.buffers.len() as u32 - 1))
    }

    fn resize_buffer(&mut self, handle: BufferHandle, new_size: u64) -> CullResult<()> {
        let (label, old_size) = {
            let entry = buffer_entry(&self.buffers, handle)?;
            (entry.label.clone(), entry.size)
        };
        let usage = buffer_entry(&self.buffers, handle)?.buffer.usage();

        let size = padded(new_size);
        let limit = self.device.limits().max_buffer_size;
        if size > limit {
            return Err(CullError::OutOfMemory {
                label,
                requested: size,
                budget: limit,
            });
        }
        let replacement = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some(&label),
            size,
            usage,
            mapped_at_creation: false,
        });

        let preserved = old_size.min(new_size) / wgpu::COPY_BUFFER_ALIGNMENT * wgpu::COPY_BUFFER_ALIGNMENT;
        let old = buffer_entry(&self.buffers, handle)?;
        if preserved > 0 {
            recording(&mut self.encoder, &self.device).copy_buffer_to_buffer(&old.buffer, 0, &replacement, 0, preserved);
        }

        if let Some(slot) = self.buffers.get_mut(handle.0 as usize).and_then(Option::as_mut) {
            let old = std::mem::replace(&mut slot.buffer, replacement);
            slot.size = new_size;
            self.retired.push(old);
        }
        log::trace!(
            "[WgpuGraphics::resize_buffer] '{}' {} -> {} bytes",
            label, old_size, new_size
        );
        Ok(())
    }

    fn destroy_buffer(&mut self, handle: BufferHandle) {
        if let Some(entry) = self.buffers.get_mut(handle.0 as usize).and_then(Option::take) {
            self.retired.push(entry.buffer);
        }
    }

    fn buffer_size(&self, handle: BufferHandle) -> Option<u64> {
        buffer_entry(&self.buffers, handle).ok().map(|entry| entry.size)
    }

    fn write_buffer(&mut self, handle: BufferHandle, offset: u64, data: &[u8]) -> CullResult<()> {
        let entry = buffer_entry(&self.buffers, handle)?;
        let len = data.len() as u64;
        if offset + len > entry.size {
            return Err(CullError::OutOfRange {
                label: entry.label.clone(),
                offset,
                len,
                size: entry.size,
            });
        }
        if len == 0 {
            return Ok(());
        }
        if offset % wgpu::COPY_BUFFER_ALIGNMENT != 0 {
            return Err(CullError::GpuOperationFailed {
                operation: "write_buffer".to_string(),
                error: format!("'{}' offset {} is not 4-byte aligned", entry.label, offset),
            });
        }

        // Recorded work must observe the old contents
        if self.encoder.is_some() {
            self.flush();
        }
        let entry = buffer_entry(&self.buffers, handle)?;
        if len % wgpu::COPY_BUFFER_ALIGNMENT == 0 {
            self.queue.write_buffer(&entry.buffer, offset, data);
        } else {
            let mut block = data.to_vec();
            block.resize(padded(len) as usize, 0);
            self.queue.write_buffer(&entry.buffer, offset, &block);
        }
        Ok(())
    }

    fn clear_buffer(&mut self, handle: BufferHandle) -> CullResult<()> {
        let entry = buffer_entry(&self.buffers, handle)?;
        recording(&mut self.encoder, &self.device).clear_buffer(&entry.buffer, 0, None);
        Ok(())
    }

    fn read_buffer(&mut self, handle: BufferHandle) -> CullResult<Vec<u8>> {
        let entry = buffer_entry(&self.buffers, handle)?;
        let size = entry.size;
        let download = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("Readback Buffer"),
            size: padded(size),
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });
        recording(&mut self.encoder, &self.device).copy_buffer_to_buffer(&entry.buffer, 0, &download, 0, padded(size));
        self.flush();

        let slice = download.slice(..);
        let (tx, rx) = futures::channel::oneshot::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            if tx.send(result).is_err() {
                log::error!("[WgpuGraphics::read_buffer] Readback receiver dropped before mapping finished");
            }
        });
        self.device.poll(wgpu::Maintain::Wait);
        pollster::block_on(rx)
            .gpu_context("read_buffer: map callback")?
            .gpu_context("read_buffer: map")?;

        let mut bytes = {
            let data = slice.get_mapped_range();
            data.to_vec()
        };
        download.unmap();
        bytes.truncate(size as usize);
        Ok(bytes)
    }

    fn create_texture(&mut self, desc: &TextureDesc) -> CullResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.mip_levels == 0 {
            return Err(CullError::TextureMismatch(format!(
                "'{}' is {}x{} with {} mips",
                desc.label, desc.width, desc.height, desc.mip_levels
            )));
        }
        let (format, usage) = match desc.format {
            TextureFormat::Depth32Float => (
                DEPTH_FORMAT,
                wgpu::TextureUsages::RENDER_ATTACHMENT
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
            ),
            TextureFormat::R32Float => (
                wgpu::TextureFormat::R32Float,
                wgpu::TextureUsages::STORAGE_BINDING
                    | wgpu::TextureUsages::TEXTURE_BINDING
                    | wgpu::TextureUsages::COPY_SRC
                    | wgpu::TextureUsages::COPY_DST,
            ),
        };

        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: Some(&desc.label),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
            mip_level_count: desc.mip_levels,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format,
            usage,
            view_formats: &[],
        });
        let full_view = texture.create_view(&wgpu::TextureViewDescriptor {
            label: Some(&desc.label),
            ..Default::default()
        });
        let mip_views = (0..desc.mip_levels)
            .map(|level| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    label: Some(&format!("{} Mip {}", desc.label, level)),
                    base_mip_level: level,
                    mip_level_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();

        self.textures.push(Some(GpuTexture {
            desc: desc.clone(),
            texture,
            full_view,
            mip_views,
        }));
        Ok(TextureHandle(self.textures.len() as u32 - 1))
    }

    fn destroy_texture(&mut self, handle: TextureHandle) {
        if let Some(slot) = self.textures.get_mut(handle.0 as usize) {
            *slot = None;
        }
    }

    fn texture_desc(&self, handle: TextureHandle) -> Option<TextureDesc> {
        texture_entry(&self.textures, handle).ok().map(|entry| entry.desc.clone())
    }

    fn write_texture(&mut self, handle: TextureHandle, mip: u32, texels: &[f32]) -> CullResult<()> {
        let entry = texture_entry(&self.textures, handle)?;
        if entry.desc.format == TextureFormat::Depth32Float {
            return Err(CullError::Unsupported(format!(
                "'{}': depth textures cannot be written from the host",
                entry.desc.label
            )));
        }
        if mip >= entry.desc.mip_levels {
            return Err(CullError::TextureMismatch(format!(
                "'{}' has {} mips, level {} written",
                entry.desc.label, entry.desc.mip_levels, mip
            )));
        }
        let (width, height) = entry.desc.mip_size(mip);
        if texels.len() != (width * height) as usize {
            return Err(CullError::TextureMismatch(format!(
                "'{}' mip {} is {}x{}, got {} texels",
                entry.desc.label,
                mip,
                width,
                height,
                texels.len()
            )));
        }

        if self.encoder.is_some() {
            self.flush();
        }
        let entry = texture_entry(&self.textures, handle)?;
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &entry.texture,
                mip_level: mip,
                origin: wgpu::Origin3d::ZERO,
                aspect: wgpu::TextureAspect::All,
            },
            bytemuck::cast_slice(texels),
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(width * 4),
                rows_per_image: Some(height),
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn copy_texture(&mut self, src: TextureHandle, dst: TextureHandle) -> CullResult<()> {
        let source = texture_entry(&self.textures, src)?;
        let destination = texture_entry(&self.textures, dst)?;
        if source.desc.format != destination.desc.format
            || source.desc.width != destination.desc.width
            || source.desc.height != destination.desc.height
        {
            return Err(CullError::TextureMismatch(format!(
                "cannot copy '{}' {}x{} {:?} into '{}' {}x{} {:?}",
                source.desc.label,
                source.desc.width,
                source.desc.height,
                source.desc.format,
                destination.desc.label,
                destination.desc.width,
                destination.desc.height,
                destination.desc.format
            )));
        }

        recording(&mut self.encoder, &self.device).copy_texture_to_texture(
            source.texture.as_image_copy(),
            destination.texture.as_image_copy(),
            wgpu::Extent3d {
                width: source.desc.width,
                height: source.desc.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn depth_target(&self) -> TextureHandle {
        self.depth_target
    }

    fn dispatch_compute(&mut self, dispatch: &ComputeDispatch<'_>) -> CullResult<()> {
        let program = dispatch.program;
        let offset = self.push_uniforms(dispatch.uniforms, program.uniform_size())?;
        let kernel = self.compute.get(program)?;

        let mut entries = vec![wgpu::BindGroupEntry {
            binding: 0,
            resource: wgpu::BindingResource::Buffer(wgpu::BufferBinding {
                buffer: &self.ring.buffer,
                offset: 0,
                size: NonZeroU64::new(program.uniform_size()),
            }),
        }];
        for slot in program.slots() {
            let binding = dispatch
                .bindings
                .iter()
                .find(|binding| binding.slot() == slot.slot)
                .ok_or(CullError::MissingBinding {
                    program,
                    slot: slot.slot,
                })?;
            let resource = match *binding {
                Binding::Buffer { buffer, .. } => buffer_entry(&self.buffers, buffer)?.buffer.as_entire_binding(),
                Binding::Texture { texture, mip, .. } => {
                    wgpu::BindingResource::TextureView(texture_entry(&self.textures, texture)?.view(mip)?)
                }
                Binding::Image { texture, mip, .. } => {
                    wgpu::BindingResource::TextureView(texture_entry(&self.textures, texture)?.view(Some(mip))?)
                }
            };
            entries.push(wgpu::BindGroupEntry {
                binding: slot.slot,
                resource,
            });
        }

        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some(dispatch.label),
            layout: &kernel.layout,
            entries: &entries,
        });

        let encoder = recording(&mut self.encoder, &self.device);
        let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
            label: Some(dispatch.label),
            timestamp_writes: None,
        });
        pass.set_pipeline(&kernel.pipeline);
        pass.set_bind_group(0, &bind_group, &[offset]);
        let [x, y, z] = dispatch.workgroups;
        pass.dispatch_workgroups(x, y, z);
        Ok(())
    }

    fn memory_barrier(&mut self, barrier: Barrier) {
        // Pass boundaries already order the hazards
        log::trace!("[WgpuGraphics::memory_barrier] {:#06b}", barrier.bits());
    }

    fn set_raster_state(&mut self, state: &RasterState) {
        let mut state = *state;
        if state.polygon_mode == PolygonMode::Line && !self.line_mode_supported {
            if !self.warned_line_mode {
                log::warn!("[WgpuGraphics::set_raster_state] Line rasterization unsupported, drawing filled");
                self.warned_line_mode = true;
            }
            state.polygon_mode = PolygonMode::Fill;
        }
        self.raster = state;
    }

    fn draw_indexed_indirect_count(&mut self, draw: &IndirectDraw<'_>) -> CullResult<()> {
        self.record_draw(
            draw.label,
            draw.program,
            draw.uniforms,
            draw.vertex_buffer,
            draw.index_buffer,
            DrawCall::Indirect {
                commands: draw.commands,
                count: draw.count_buffer,
                count_offset: draw.count_offset,
                max_draw_count: draw.max_draw_count,
            },
        )
    }

    fn draw_indexed(&mut self, draw: &DirectDraw<'_>) -> CullResult<()> {
        self.record_draw(
            draw.label,
            draw.program,
            draw.uniforms,
            draw.vertex_buffer,
            draw.index_buffer,
            DrawCall::Direct(draw.command),
        )
    }

    fn submit(&mut self) -> CullResult<()> {
        self.flush();
        Ok(())
    }

    fn finish(&mut self) -> CullResult<()> {
        self.flush();
        self.device.poll(wgpu::Maintain::Wait);
        Ok(())
    }
}
