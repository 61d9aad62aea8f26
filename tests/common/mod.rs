//! Scene helpers shared by the integration tests

#![allow(dead_code)]

use firstpass::gpu::buffer_layouts::{DrawElementsIndirectCommand, EntityRecord, MaterialRecord};
use firstpass::gpu::{LoggedCommand, RecordedDraw};
use firstpass::renderer::Aabb;
use firstpass::{
    BufferUsage, Camera, CullingConfig, FirstPassRenderer, FirstPassResult, GeometryPool,
    PersistentBuffer, PipelineConfig, PoolKind, RenderBatch, RenderState, SoftwareGpu,
};
use glam::Vec3;

pub const WIDTH: u32 = 64;
pub const HEIGHT: u32 = 64;

/// Indices of the unit cube every test batch draws
pub const CUBE_INDICES: u32 = 36;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Camera at the origin looking down -Z
pub fn camera() -> Camera {
    Camera::look_at(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 60f32.to_radians(), 1.0, 0.1, 100.0)
}

/// Depth-target value of a surface `distance` units in front of [`camera`]
pub fn depth_at(distance: f32) -> f32 {
    camera()
        .view_projection
        .project_point3(Vec3::new(0.0, 0.0, -distance))
        .z
}

pub fn unit_bounds() -> Aabb {
    Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5))
}

/// Batch of `instances` unit cubes starting at entity `entity`
pub fn cube_batch(entity: u32, instances: u32) -> RenderBatch {
    RenderBatch::new(
        entity,
        DrawElementsIndirectCommand::new(CUBE_INDICES, instances, 0, 0),
        unit_bounds(),
    )
}

/// A software device and a render state whose entity `i` sits at `positions[i]`
pub struct Scene {
    pub gpu: SoftwareGpu,
    pub state: RenderState,
    pub entities: PersistentBuffer,
}

impl Scene {
    pub fn new(positions: &[Vec3]) -> Self {
        Self::on_device(SoftwareGpu::new(WIDTH, HEIGHT), positions)
    }

    pub fn on_device(mut gpu: SoftwareGpu, positions: &[Vec3]) -> Self {
        init_logging();

        let records = positions
            .iter()
            .enumerate()
            .map(|(i, &p)| EntityRecord::new(glam::Mat4::from_translation(p), i as u32 % 4))
            .collect::<Vec<_>>();
        let mut entities = PersistentBuffer::new(&mut gpu, "Entities", BufferUsage::STORAGE, 0).unwrap();
        entities.write(&mut gpu, 0, &records).unwrap();

        let mut materials = PersistentBuffer::new(&mut gpu, "Materials", BufferUsage::STORAGE, 0).unwrap();
        materials.write(&mut gpu, 0, &[MaterialRecord::default(); 4]).unwrap();

        let static_pool = GeometryPool::allocate(&mut gpu, PoolKind::Static, 4096, 4096).unwrap();
        let animated_pool = GeometryPool::allocate(&mut gpu, PoolKind::Animated, 4096, 4096).unwrap();

        let state = RenderState::new(
            camera(),
            entities.handle(),
            records.len() as u32,
            materials.handle(),
            static_pool,
            animated_pool,
        );
        Self { gpu, state, entities }
    }

    /// `count` entities in a row at `distance` in front of the camera
    pub fn row(count: u32, distance: f32) -> Self {
        let positions = (0..count)
            .map(|i| Vec3::new((i as f32 - count as f32 / 2.0) * 0.1, 0.0, -distance))
            .collect::<Vec<_>>();
        Self::new(&positions)
    }

    pub fn with_config(mut self, config: CullingConfig) -> Self {
        self.state.config = config;
        self
    }

    pub fn renderer(&mut self, config: PipelineConfig) -> FirstPassRenderer {
        FirstPassRenderer::new(&mut self.gpu, config).unwrap()
    }

    /// Render one frame, returning its counters and the draws it recorded
    pub fn frame(&mut self, renderer: &mut FirstPassRenderer) -> (FirstPassResult, Vec<RecordedDraw>) {
        let mut result = FirstPassResult::default();
        self.gpu.take_draws();
        renderer.render(&mut self.gpu, &self.state, &mut result).unwrap();
        (result, self.gpu.take_draws())
    }

    pub fn dispatch_labels(&self) -> Vec<String> {
        self.gpu
            .command_log()
            .iter()
            .filter_map(|command| match command {
                LoggedCommand::Dispatch { label, .. } => Some(label.clone()),
                _ => None,
            })
            .collect()
    }
}

/// Entity indices drawn by the indirect draws of `draws`, sorted
pub fn indirect_entities(draws: &[RecordedDraw]) -> Vec<u32> {
    let mut entities = draws
        .iter()
        .filter(|draw| draw.indirect)
        .flat_map(|draw| draw.entities().collect::<Vec<_>>())
        .collect::<Vec<_>>();
    entities.sort_unstable();
    entities
}
