//! Compute kernels and draw pipelines compiled from `src/shaders`
//!
//! Bind group layouts are derived from [`ComputeProgram::slots`], so the
//! WGSL binding numbers and the Rust slot tables cannot drift apart
//! without the layout validation catching it.

use crate::error::{CullError, CullResult};
use crate::gpu::buffer_layouts::bindings::draw;
use crate::gpu::buffer_layouts::{AnimatedVertex, StaticVertex, FRAME_UNIFORMS_SIZE};
use crate::gpu::{ComputeProgram, CullMode, PolygonMode, ProgramId, RasterState, RenderProgram, SlotKind};
use crate::state::PoolKind;
use rustc_hash::FxHashMap;
use std::num::NonZeroU64;

/// Features the backend cannot run without
pub const REQUIRED_FEATURES: wgpu::Features =
    wgpu::Features::MULTI_DRAW_INDIRECT_COUNT.union(wgpu::Features::INDIRECT_FIRST_INSTANCE);

pub(super) const DEPTH_FORMAT: wgpu::TextureFormat = wgpu::TextureFormat::Depth32Float;

const ALL_KERNELS: [ComputeProgram; 7] = [
    ComputeProgram::ResetCullState,
    ComputeProgram::Visibility,
    ComputeProgram::CompactionOffsets,
    ComputeProgram::AppendParallel,
    ComputeProgram::AppendSerial,
    ComputeProgram::HiZBase,
    ComputeProgram::HiZDownsample,
];

fn shader_module(device: &wgpu::Device, label: &str, source: &'static str) -> wgpu::ShaderModule {
    device.create_shader_module(wgpu::ShaderModuleDescriptor {
        label: Some(label),
        source: wgpu::ShaderSource::Wgsl(source.into()),
    })
}

fn uniform_entry(binding: u32, visibility: wgpu::ShaderStages, size: u64) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Uniform,
            has_dynamic_offset: true,
            min_binding_size: NonZeroU64::new(size),
        },
        count: None,
    }
}

fn storage_entry(binding: u32, visibility: wgpu::ShaderStages, read_only: bool) -> wgpu::BindGroupLayoutEntry {
    wgpu::BindGroupLayoutEntry {
        binding,
        visibility,
        ty: wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage { read_only },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        count: None,
    }
}

fn slot_binding_type(kind: SlotKind) -> wgpu::BindingType {
    match kind {
        SlotKind::StorageRead | SlotKind::StorageReadWrite => wgpu::BindingType::Buffer {
            ty: wgpu::BufferBindingType::Storage {
                read_only: kind == SlotKind::StorageRead,
            },
            has_dynamic_offset: false,
            min_binding_size: None,
        },
        SlotKind::DepthTexture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Depth,
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        SlotKind::FloatTexture => wgpu::BindingType::Texture {
            sample_type: wgpu::TextureSampleType::Float { filterable: false },
            view_dimension: wgpu::TextureViewDimension::D2,
            multisampled: false,
        },
        SlotKind::Image => wgpu::BindingType::StorageTexture {
            access: wgpu::StorageTextureAccess::WriteOnly,
            format: wgpu::TextureFormat::R32Float,
            view_dimension: wgpu::TextureViewDimension::D2,
        },
    }
}

/// One compiled kernel with the layout of its single bind group
pub(super) struct ComputeKernel {
    pub layout: wgpu::BindGroupLayout,
    pub pipeline: wgpu::ComputePipeline,
}

pub(super) struct ComputePipelines {
    kernels: FxHashMap<ComputeProgram, ComputeKernel>,
}

impl ComputePipelines {
    pub fn new(device: &wgpu::Device) -> Self {
        let visibility = shader_module(device, "Visibility Shader", include_str!("../../shaders/visibility.wgsl"));
        let compaction = shader_module(device, "Compaction Shader", include_str!("../../shaders/compaction.wgsl"));
        let hi_z_base = shader_module(device, "Hi-Z Base Shader", include_str!("../../shaders/hiz_base.wgsl"));
        let hi_z_downsample = shader_module(
            device,
            "Hi-Z Downsample Shader",
            include_str!("../../shaders/hiz_downsample.wgsl"),
        );

        let mut kernels = FxHashMap::default();
        for program in ALL_KERNELS {
            let (module, entry_point) = match program {
                ComputeProgram::ResetCullState => (&compaction, "reset_cull_state"),
                ComputeProgram::Visibility => (&visibility, "main"),
                ComputeProgram::CompactionOffsets => (&compaction, "compaction_offsets"),
                ComputeProgram::AppendParallel => (&compaction, "append_parallel"),
                ComputeProgram::AppendSerial => (&compaction, "append_serial"),
                ComputeProgram::HiZBase => (&hi_z_base, "main"),
                ComputeProgram::HiZDownsample => (&hi_z_downsample, "main"),
            };
            kernels.insert(program, Self::build_kernel(device, program, module, entry_point));
        }

        log::debug!("[ComputePipelines::new] Compiled {} compute kernels", kernels.len());
        Self { kernels }
    }

    fn build_kernel(
        device: &wgpu::Device,
        program: ComputeProgram,
        module: &wgpu::ShaderModule,
        entry_point: &str,
    ) -> ComputeKernel {
        let label = format!("{:?}", program);

        let mut entries = vec![uniform_entry(0, wgpu::ShaderStages::COMPUTE, program.uniform_size())];
        entries.extend(program.slots().iter().map(|slot| wgpu::BindGroupLayoutEntry {
            binding: slot.slot,
            visibility: wgpu::ShaderStages::COMPUTE,
            ty: slot_binding_type(slot.kind),
            count: None,
        }));

        let layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some(&format!("{} Bind Group Layout", label)),
            entries: &entries,
        });
        let pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some(&format!("{} Pipeline Layout", label)),
            bind_group_layouts: &[&layout],
            push_constant_ranges: &[],
        });
        let pipeline = device.create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
            label: Some(&format!("{} Pipeline", label)),
            layout: Some(&pipeline_layout),
            module,
            entry_point,
        });

        ComputeKernel { layout, pipeline }
    }

    pub fn get(&self, program: ComputeProgram) -> CullResult<&ComputeKernel> {
        self.kernels
            .get(&program)
            .ok_or_else(|| CullError::Unsupported(format!("no compute kernel for {:?}", program)))
    }
}

/// A host-supplied draw program; must export `vs_main` and `fs_main`
struct CustomProgram {
    label: String,
    module: wgpu::ShaderModule,
    pool: PoolKind,
}

/// Draw pipelines, created on first use for each program and raster state
pub(super) struct RenderPipelines {
    color_format: wgpu::TextureFormat,
    draw_shader: wgpu::ShaderModule,
    static_layout: wgpu::BindGroupLayout,
    animated_layout: wgpu::BindGroupLayout,
    static_pipeline_layout: wgpu::PipelineLayout,
    animated_pipeline_layout: wgpu::PipelineLayout,
    custom: Vec<CustomProgram>,
    cache: FxHashMap<(RenderProgram, RasterState), wgpu::RenderPipeline>,
}

impl RenderPipelines {
    pub fn new(device: &wgpu::Device, color_format: wgpu::TextureFormat) -> Self {
        let draw_shader = shader_module(device, "Indirect Draw Shader", include_str!("../../shaders/indirect_draw.wgsl"));

        let vertex = wgpu::ShaderStages::VERTEX;
        let both = wgpu::ShaderStages::VERTEX_FRAGMENT;
        let mut entries = vec![
            uniform_entry(draw::FRAME, both, FRAME_UNIFORMS_SIZE),
            storage_entry(draw::ENTITIES, vertex, true),
            storage_entry(draw::MATERIALS, both, true),
            storage_entry(draw::ENTITY_INDICES, vertex, true),
        ];
        let static_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Static Draw Bind Group Layout"),
            entries: &entries,
        });
        entries.push(storage_entry(draw::JOINTS, vertex, true));
        let animated_layout = device.create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
            label: Some("Animated Draw Bind Group Layout"),
            entries: &entries,
        });

        let static_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Static Draw Pipeline Layout"),
            bind_group_layouts: &[&static_layout],
            push_constant_ranges: &[],
        });
        let animated_pipeline_layout = device.create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
            label: Some("Animated Draw Pipeline Layout"),
            bind_group_layouts: &[&animated_layout],
            push_constant_ranges: &[],
        });

        Self {
            color_format,
            draw_shader,
            static_layout,
            animated_layout,
            static_pipeline_layout,
            animated_pipeline_layout,
            custom: Vec::new(),
            cache: FxHashMap::default(),
        }
    }

    pub fn register(&mut self, device: &wgpu::Device, label: &str, wgsl: &str, pool: PoolKind) -> ProgramId {
        let module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(label),
            source: wgpu::ShaderSource::Wgsl(wgsl.to_string().into()),
        });
        self.custom.push(CustomProgram {
            label: label.to_string(),
            module,
            pool,
        });
        ProgramId(self.custom.len() as u32 - 1)
    }

    /// Geometry pool whose vertex format and bindings `program` uses
    pub fn pool_of(&self, program: RenderProgram) -> CullResult<PoolKind> {
        match program {
            RenderProgram::Static => Ok(PoolKind::Static),
            RenderProgram::Animated => Ok(PoolKind::Animated),
            RenderProgram::Custom(id) => self
                .custom
                .get(id.0 as usize)
                .map(|custom| custom.pool)
                .ok_or_else(|| CullError::Unsupported(format!("unregistered draw program {:?}", id))),
        }
    }

    pub fn bind_group_layout(&self, pool: PoolKind) -> &wgpu::BindGroupLayout {
        match pool {
            PoolKind::Static => &self.static_layout,
            PoolKind::Animated => &self.animated_layout,
        }
    }

    pub fn pipeline(
        &mut self,
        device: &wgpu::Device,
        program: RenderProgram,
        raster: RasterState,
    ) -> CullResult<&wgpu::RenderPipeline> {
        let key = (program, raster);
        if !self.cache.contains_key(&key) {
            let pipeline = self.create(device, program, raster)?;
            log::debug!(
                "[RenderPipelines::pipeline] Created {:?} pipeline for {:?}",
                program, raster
            );
            self.cache.insert(key, pipeline);
        }
        self.cached(program, raster)
    }

    /// A pipeline previously created by [`RenderPipelines::pipeline`]
    pub fn cached(&self, program: RenderProgram, raster: RasterState) -> CullResult<&wgpu::RenderPipeline> {
        self.cache
            .get(&(program, raster))
            .ok_or_else(|| CullError::Unsupported(format!("no pipeline created for {:?}", program)))
    }

    fn create(
        &self,
        device: &wgpu::Device,
        program: RenderProgram,
        raster: RasterState,
    ) -> CullResult<wgpu::RenderPipeline> {
        let pool = self.pool_of(program)?;
        let (label, module, vertex_entry) = match program {
            RenderProgram::Static => ("First Pass Static", &self.draw_shader, "vs_static"),
            RenderProgram::Animated => ("First Pass Animated", &self.draw_shader, "vs_animated"),
            RenderProgram::Custom(id) => {
                let custom = self
                    .custom
                    .get(id.0 as usize)
                    .ok_or_else(|| CullError::Unsupported(format!("unregistered draw program {:?}", id)))?;
                (custom.label.as_str(), &custom.module, "vs_main")
            }
        };
        let (layout, vertex_layout) = match pool {
            PoolKind::Static => (&self.static_pipeline_layout, StaticVertex::layout()),
            PoolKind::Animated => (&self.animated_pipeline_layout, AnimatedVertex::layout()),
        };

        Ok(device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
            label: Some(label),
            layout: Some(layout),
            vertex: wgpu::VertexState {
                module,
                entry_point: vertex_entry,
                buffers: &[vertex_layout],
            },
            fragment: Some(wgpu::FragmentState {
                module,
                entry_point: "fs_main",
                targets: &[Some(wgpu::ColorTargetState {
                    format: self.color_format,
                    blend: None,
                    write_mask: wgpu::ColorWrites::ALL,
                })],
            }),
            primitive: wgpu::PrimitiveState {
                topology: wgpu::PrimitiveTopology::TriangleList,
                strip_index_format: None,
                front_face: wgpu::FrontFace::Ccw,
                cull_mode: match raster.cull_mode {
                    CullMode::None => None,
                    CullMode::Back => Some(wgpu::Face::Back),
                    CullMode::Front => Some(wgpu::Face::Front),
                },
                unclipped_depth: false,
                polygon_mode: match raster.polygon_mode {
                    PolygonMode::Fill => wgpu::PolygonMode::Fill,
                    PolygonMode::Line => wgpu::PolygonMode::Line,
                },
                conservative: false,
            },
            depth_stencil: Some(wgpu::DepthStencilState {
                format: DEPTH_FORMAT,
                depth_write_enabled: raster.depth_write,
                depth_compare: if raster.depth_test {
                    wgpu::CompareFunction::LessEqual
                } else {
                    wgpu::CompareFunction::Always
                },
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            }),
            multisample: wgpu::MultisampleState::default(),
            multiview: None,
        }))
    }
}
