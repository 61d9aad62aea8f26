/// Render a synthetic grid of cubes through the first pass and report how
/// much of it survives culling each frame.
///
/// Usage: cull_stats [--wgpu] [pipeline.toml]
///
/// The software device runs by default; it does not rasterize, so a wall
/// of depth is written into its depth target to give the Hi-Z something to
/// occlude with. `--wgpu` runs the same scene on a headless wgpu device.

use anyhow::{Context, Result};
use firstpass::gpu::buffer_layouts::{DrawElementsIndirectCommand, EntityRecord, MaterialRecord, StaticVertex};
use firstpass::renderer::Aabb;
use firstpass::{
    BufferUsage, Camera, FirstPassRenderer, FirstPassResult, GeometryPool, GraphicsApi,
    PersistentBuffer, PipelineConfig, PoolKind, RenderBatch, RenderState, SoftwareGpu, WgpuGraphics,
};
use glam::{Mat4, Vec3};

const WIDTH: u32 = 256;
const HEIGHT: u32 = 256;
const GRID: u32 = 16;
const FRAMES: u32 = 4;
/// Distance of the software depth wall in front of the camera
const WALL_DISTANCE: f32 = 40.0;

fn cube_mesh() -> (Vec<StaticVertex>, Vec<u32>) {
    let faces: [(Vec3, Vec3, Vec3); 6] = [
        (Vec3::X, Vec3::Y, Vec3::Z),
        (Vec3::NEG_X, Vec3::Y, Vec3::NEG_Z),
        (Vec3::Y, Vec3::Z, Vec3::X),
        (Vec3::NEG_Y, Vec3::Z, Vec3::NEG_X),
        (Vec3::Z, Vec3::Y, Vec3::NEG_X),
        (Vec3::NEG_Z, Vec3::Y, Vec3::X),
    ];
    let mut vertices = Vec::with_capacity(24);
    let mut indices = Vec::with_capacity(36);
    for (normal, up, right) in faces {
        let base = vertices.len() as u32;
        for (u, v) in [(-1.0, -1.0), (1.0, -1.0), (1.0, 1.0), (-1.0, 1.0)] {
            let position = (normal + right * u + up * v) * 0.5;
            vertices.push(StaticVertex::new(
                position.to_array(),
                normal.to_array(),
                [(u + 1.0) * 0.5, (v + 1.0) * 0.5],
            ));
        }
        indices.extend([base, base + 1, base + 2, base, base + 2, base + 3]);
    }
    (vertices, indices)
}

const EYE: Vec3 = Vec3::new(0.0, 4.0, 0.0);
const TARGET: Vec3 = Vec3::new(0.0, 0.0, -40.0);

fn camera() -> Camera {
    Camera::look_at(
        EYE,
        TARGET,
        Vec3::Y,
        60f32.to_radians(),
        WIDTH as f32 / HEIGHT as f32,
        0.1,
        200.0,
    )
}

/// One batch per grid row, each instancing `GRID` cubes along X
fn build_scene<G: GraphicsApi + ?Sized>(api: &mut G, config: &PipelineConfig) -> Result<RenderState> {
    let (vertices, indices) = cube_mesh();
    let vertex_bytes: &[u8] = bytemuck::cast_slice(&vertices);
    let index_bytes: &[u8] = bytemuck::cast_slice(&indices);
    let static_pool = GeometryPool::allocate(api, PoolKind::Static, vertex_bytes.len() as u64, index_bytes.len() as u64)?;
    api.write_buffer(static_pool.vertex_buffer, 0, vertex_bytes)?;
    api.write_buffer(static_pool.index_buffer, 0, index_bytes)?;
    let animated_pool = GeometryPool::allocate(api, PoolKind::Animated, 0, 0)?;

    let records = (0..GRID * GRID)
        .map(|i| {
            let (row, column) = (i / GRID, i % GRID);
            let position = Vec3::new(column as f32 * 3.0 - GRID as f32 * 1.5, 0.0, -5.0 - row as f32 * 6.0);
            EntityRecord::new(Mat4::from_translation(position), row % 4)
        })
        .collect::<Vec<_>>();
    let mut entities = PersistentBuffer::new(api, "Grid Entities", BufferUsage::STORAGE, 0)?;
    entities.write(api, 0, &records)?;

    let materials = [[0.8, 0.3, 0.3, 1.0], [0.3, 0.8, 0.3, 1.0], [0.3, 0.3, 0.8, 1.0], [0.8, 0.8, 0.3, 1.0]]
        .map(|base_color| MaterialRecord {
            base_color,
            ..MaterialRecord::default()
        });
    let mut material_buffer = PersistentBuffer::new(api, "Grid Materials", BufferUsage::STORAGE, 0)?;
    material_buffer.write(api, 0, &materials)?;

    let mut state = RenderState::new(
        camera(),
        entities.handle(),
        records.len() as u32,
        material_buffer.handle(),
        static_pool,
        animated_pool,
    );
    state.config = config.culling;

    let mesh_bounds = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5));
    for row in 0..GRID {
        let command = DrawElementsIndirectCommand::new(indices.len() as u32, GRID, 0, 0);
        state.push_batch(RenderBatch::new(row * GRID, command, mesh_bounds));
    }
    Ok(state)
}

fn report<G: GraphicsApi + ?Sized>(
    api: &mut G,
    renderer: &FirstPassRenderer,
    frame: u32,
    result: &FirstPassResult,
) -> Result<()> {
    let compacted = renderer.read_compacted(api, PoolKind::Static)?;
    println!(
        "frame {}: {} submitted, {} survived in {} draws ({} indirect + {} fallback calls, {} vertices)",
        frame,
        result.entities_drawn,
        compacted.entity_count,
        compacted.draw_count,
        result.indirect_draw_calls,
        result.fallback_draw_calls,
        result.vertices_drawn,
    );
    Ok(())
}

fn run_software(config: PipelineConfig) -> Result<()> {
    let mut gpu = SoftwareGpu::new(WIDTH, HEIGHT);
    let state = build_scene(&mut gpu, &config)?;
    let mut renderer = FirstPassRenderer::new(&mut gpu, config)?;

    let camera = camera();
    let wall_point = EYE + (TARGET - EYE).normalize() * WALL_DISTANCE;
    let wall = camera.view_projection.project_point3(wall_point).z;
    gpu.fill_depth(wall)?;

    for frame in 0..FRAMES {
        let mut result = FirstPassResult::default();
        renderer.render(&mut gpu, &state, &mut result)?;
        report(&mut gpu, &renderer, frame, &result)?;
    }
    log::info!(
        "[cull_stats] software device: {} submissions, {} bytes allocated",
        gpu.submissions(),
        gpu.allocated_bytes()
    );
    Ok(())
}

fn run_wgpu(config: PipelineConfig) -> Result<()> {
    let mut gpu = WgpuGraphics::request(WIDTH, HEIGHT).context("no wgpu adapter with multi-draw-indirect-count")?;
    let state = build_scene(&mut gpu, &config)?;
    let mut renderer = FirstPassRenderer::new(&mut gpu, config)?;

    for frame in 0..FRAMES {
        gpu.begin_frame();
        let mut result = FirstPassResult::default();
        renderer.render(&mut gpu, &state, &mut result)?;
        report(&mut gpu, &renderer, frame, &result)?;
    }
    log::info!("[cull_stats] wgpu device: {} submissions", gpu.submission_count());
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();

    let mut use_wgpu = false;
    let mut config_path = None;
    for arg in std::env::args().skip(1) {
        match arg.as_str() {
            "--wgpu" => use_wgpu = true,
            _ => config_path = Some(arg),
        }
    }

    let config = match &config_path {
        Some(path) => PipelineConfig::load(path).with_context(|| format!("loading {}", path))?,
        None => PipelineConfig::default(),
    };
    log::info!("[cull_stats] {:?}", config);

    println!("First Pass Culling Statistics");
    println!("=============================");
    println!("{} x {} grid, {} frames, {:?}", GRID, GRID, FRAMES, config.coarse_culling);

    if use_wgpu {
        run_wgpu(config)
    } else {
        run_software(config)
    }
}
