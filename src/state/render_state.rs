//! Per-frame render snapshot
//!
//! Built by scene extraction once per frame and consumed read-only by
//! [`FirstPassRenderer::render`](crate::FirstPassRenderer::render).

use crate::config::CullingConfig;
use crate::error::CullResult;
use crate::gpu::buffer_layouts::{DrawElementsIndirectCommand, FrameUniforms};
use crate::gpu::{BufferDesc, BufferHandle, BufferUsage, CullMode, GraphicsApi, ProgramId};
use crate::renderer::gpu_culling::frustum_culler::Aabb;
use glam::{Mat4, Vec3};

/// Camera matrices for the frame
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Camera {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
    pub position: Vec3,
    pub near: f32,
    pub far: f32,
}

impl Camera {
    /// Camera from explicit matrices; the position is recovered from the view
    pub fn new(view: Mat4, projection: Mat4, near: f32, far: f32) -> Self {
        Self {
            view,
            projection,
            view_projection: projection * view,
            position: view.inverse().w_axis.truncate(),
            near,
            far,
        }
    }

    /// Right-handed perspective camera with standard 0..1 depth
    pub fn look_at(eye: Vec3, target: Vec3, up: Vec3, fov_y: f32, aspect: f32, near: f32, far: f32) -> Self {
        let view = Mat4::look_at_rh(eye, target, up);
        let projection = Mat4::perspective_rh(fov_y, aspect, near, far);
        Self {
            view,
            projection,
            view_projection: projection * view,
            position: eye,
            near,
            far,
        }
    }

    pub fn frame_uniforms(&self, time: f32, effect_flags: u32) -> FrameUniforms {
        FrameUniforms {
            view: self.view.to_cols_array_2d(),
            projection: self.projection.to_cols_array_2d(),
            view_proj: self.view_projection.to_cols_array_2d(),
            camera_position: self.position.extend(1.0).to_array(),
            near_far_time: [self.near, self.far, time, 0.0],
            effect_flags,
            _padding: [0; 3],
        }
    }
}

impl Default for Camera {
    fn default() -> Self {
        Self::look_at(
            Vec3::new(0.0, 0.0, 5.0),
            Vec3::ZERO,
            Vec3::Y,
            std::f32::consts::FRAC_PI_3,
            1.0,
            0.1,
            1000.0,
        )
    }
}

/// Vertex layout family of a geometry pool
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolKind {
    Static,
    Animated,
}

/// Shared vertex and index buffers of one pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeometryPool {
    pub kind: PoolKind,
    pub vertex_buffer: BufferHandle,
    pub index_buffer: BufferHandle,
}

impl GeometryPool {
    pub fn new(kind: PoolKind, vertex_buffer: BufferHandle, index_buffer: BufferHandle) -> Self {
        Self {
            kind,
            vertex_buffer,
            index_buffer,
        }
    }

    /// Allocate zeroed vertex and index buffers of the given sizes
    pub fn allocate<G: GraphicsApi + ?Sized>(
        api: &mut G,
        kind: PoolKind,
        vertex_bytes: u64,
        index_bytes: u64,
    ) -> CullResult<Self> {
        let name = match kind {
            PoolKind::Static => "Static",
            PoolKind::Animated => "Animated",
        };
        let vertex_buffer = api.create_buffer(&BufferDesc::new(
            format!("{} Vertex Buffer", name),
            vertex_bytes.max(4),
            BufferUsage::VERTEX,
        ))?;
        let index_buffer = api.create_buffer(&BufferDesc::new(
            format!("{} Index Buffer", name),
            index_bytes.max(4),
            BufferUsage::INDEX,
        ))?;
        Ok(Self::new(kind, vertex_buffer, index_buffer))
    }
}

/// One drawable mesh of an entity (possibly instanced)
///
/// Instances `0..draw_command.instance_count` read consecutive entity
/// records starting at `entity_buffer_index`.
#[derive(Debug, Clone, PartialEq)]
pub struct RenderBatch {
    pub entity_buffer_index: u32,
    /// Mesh-local bounds, transformed per instance on the GPU
    pub mesh_bounds: Aabb,
    /// World-space bounds covering every instance, for the CPU prefilter
    pub world_bounds: Aabb,
    pub bounding_sphere_radius: f32,
    pub is_visible: bool,
    pub is_forward_rendered: bool,
    pub material_index: u32,
    pub draw_command: DrawElementsIndirectCommand,
    pub is_animated: bool,
    /// Exclusive shader program; such batches skip the indirect path
    pub program: Option<ProgramId>,
    pub writes_depth: bool,
    /// Material face culling; anything but back faces skips the indirect path
    pub cull_mode: CullMode,
    /// Material depth test; disabling it skips the indirect path
    pub depth_test: bool,
    /// Explicit ordering override; such batches skip the indirect path
    pub render_priority: Option<i32>,
}

impl RenderBatch {
    pub fn new(entity_buffer_index: u32, draw_command: DrawElementsIndirectCommand, mesh_bounds: Aabb) -> Self {
        Self {
            entity_buffer_index,
            mesh_bounds,
            world_bounds: mesh_bounds,
            bounding_sphere_radius: mesh_bounds.half_extents().length(),
            is_visible: true,
            is_forward_rendered: false,
            material_index: 0,
            draw_command,
            is_animated: false,
            program: None,
            writes_depth: true,
            cull_mode: CullMode::Back,
            depth_test: true,
            render_priority: None,
        }
    }

    pub fn with_world_bounds(mut self, world_bounds: Aabb) -> Self {
        self.world_bounds = world_bounds;
        self
    }

    pub fn animated(mut self) -> Self {
        self.is_animated = true;
        self
    }

    pub fn instance_count(&self) -> u32 {
        self.draw_command.instance_count
    }

    /// Can be drawn by the shared multi-draw-indirect path
    pub fn is_indirect_eligible(&self) -> bool {
        !self.is_forward_rendered
            && self.program.is_none()
            && self.writes_depth
            && self.depth_test
            && self.cull_mode == CullMode::Back
            && self.render_priority.is_none()
    }
}

/// Everything the first pass reads for one frame
#[derive(Debug, Clone)]
pub struct RenderState {
    pub camera: Camera,
    pub static_batches: Vec<RenderBatch>,
    pub animated_batches: Vec<RenderBatch>,

    /// Host-owned `EntityRecord` array
    pub entities: BufferHandle,
    pub entity_count: u32,
    /// Host-owned `MaterialRecord` array
    pub materials: BufferHandle,
    /// Joint matrices for the animated pool
    pub joints: Option<BufferHandle>,

    pub static_geometry: GeometryPool,
    pub animated_geometry: GeometryPool,

    pub config: CullingConfig,
    pub time: f32,
    pub effect_flags: u32,
}

impl RenderState {
    pub fn new(
        camera: Camera,
        entities: BufferHandle,
        entity_count: u32,
        materials: BufferHandle,
        static_geometry: GeometryPool,
        animated_geometry: GeometryPool,
    ) -> Self {
        Self {
            camera,
            static_batches: Vec::new(),
            animated_batches: Vec::new(),
            entities,
            entity_count,
            materials,
            joints: None,
            static_geometry,
            animated_geometry,
            config: CullingConfig::default(),
            time: 0.0,
            effect_flags: 0,
        }
    }

    pub fn batches(&self, kind: PoolKind) -> &[RenderBatch] {
        match kind {
            PoolKind::Static => &self.static_batches,
            PoolKind::Animated => &self.animated_batches,
        }
    }

    pub fn geometry(&self, kind: PoolKind) -> &GeometryPool {
        match kind {
            PoolKind::Static => &self.static_geometry,
            PoolKind::Animated => &self.animated_geometry,
        }
    }

    /// Queue a batch into the pool its `is_animated` flag selects
    pub fn push_batch(&mut self, batch: RenderBatch) {
        if batch.is_animated {
            self.animated_batches.push(batch);
        } else {
            self.static_batches.push(batch);
        }
    }
}
