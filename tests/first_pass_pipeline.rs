mod common;

use common::{cube_batch, indirect_entities, Scene, CUBE_INDICES};
use firstpass::gpu::{Barrier, CullMode, LoggedCommand, RenderProgram};
use firstpass::renderer::Aabb;
use firstpass::{CullError, CullingConfig, PipelineConfig, PoolKind, SoftwareGpu};
use glam::Vec3;

/// Entities 0, 1, 2, 4 and 6 in front of the camera; 3, 5 and 7 behind it
fn mixed_positions() -> Vec<Vec3> {
    (0..8)
        .map(|i| {
            let x = i as f32 * 0.5 - 2.0;
            match i {
                3 | 5 | 7 => Vec3::new(x, 0.0, 10.0),
                _ => Vec3::new(x, 0.0, -10.0),
            }
        })
        .collect()
}

fn frustum_only() -> CullingConfig {
    CullingConfig {
        use_gpu_occlusion_culling: false,
        ..CullingConfig::default()
    }
}

fn dispatch_index(log: &[LoggedCommand], name: &str) -> usize {
    log.iter()
        .position(|c| matches!(c, LoggedCommand::Dispatch { label, .. } if label == name))
        .unwrap()
}

#[test]
fn test_pass_through_draws_every_instance_once() {
    let mut scene = Scene::row(8, 10.0).with_config(CullingConfig::pass_through());
    for batch in [cube_batch(0, 2), cube_batch(2, 5), cube_batch(7, 1)] {
        scene.state.push_batch(batch);
    }
    let mut renderer = scene.renderer(PipelineConfig::default());

    let (result, draws) = scene.frame(&mut renderer);

    assert_eq!(indirect_entities(&draws), (0..8).collect::<Vec<_>>());
    assert_eq!(result.indirect_draw_calls, 1);
    assert_eq!(result.fallback_draw_calls, 0);
    assert_eq!(result.entities_drawn, 8);
    assert_eq!(result.vertices_drawn, 8 * CUBE_INDICES as u64);

    let compacted = renderer.read_compacted(&mut scene.gpu, PoolKind::Static).unwrap();
    assert_eq!(compacted.draw_count, 3);
    assert_eq!(compacted.entity_count, 8);
    assert_eq!(compacted.instance_total(), 8);
}

#[test]
fn test_mixed_visibility_compacts_to_two_commands() {
    let mut scene = Scene::new(&mixed_positions()).with_config(frustum_only());
    for batch in [cube_batch(0, 2), cube_batch(2, 5), cube_batch(7, 1)] {
        scene.state.push_batch(batch);
    }
    let mut renderer = scene.renderer(PipelineConfig::default());
    let (_, draws) = scene.frame(&mut renderer);

    let compacted = renderer.read_compacted(&mut scene.gpu, PoolKind::Static).unwrap();
    assert_eq!(compacted.draw_count, 2);
    assert_eq!(compacted.entity_count, 5);

    // Draw slots are claimed in arbitrary order by the parallel append
    let mut per_command = compacted
        .commands
        .iter()
        .zip(compacted.entities_per_command())
        .map(|(command, mut entities)| {
            entities.sort_unstable();
            (command.base_instance, command.instance_count, entities)
        })
        .collect::<Vec<_>>();
    per_command.sort();
    assert_eq!(per_command, vec![(0, 2, vec![0, 1]), (2, 3, vec![2, 4, 6])]);

    assert_eq!(indirect_entities(&draws), vec![0, 1, 2, 4, 6]);
}

#[test]
fn test_serial_append_matches_parallel_set_in_order() {
    let batches = [cube_batch(0, 2), cube_batch(2, 5), cube_batch(7, 1)];

    let mut parallel = Scene::new(&mixed_positions()).with_config(frustum_only());
    let mut serial = Scene::new(&mixed_positions()).with_config(CullingConfig {
        use_compute_shader_draw_command_append: false,
        ..frustum_only()
    });
    for scene in [&mut parallel, &mut serial] {
        for batch in &batches {
            scene.state.push_batch(batch.clone());
        }
    }

    let mut parallel_renderer = parallel.renderer(PipelineConfig::default());
    let mut serial_renderer = serial.renderer(PipelineConfig::default());
    let (_, parallel_draws) = parallel.frame(&mut parallel_renderer);
    let (_, serial_draws) = serial.frame(&mut serial_renderer);
    assert_eq!(indirect_entities(&parallel_draws), indirect_entities(&serial_draws));

    let ordered = serial_renderer.read_compacted(&mut serial.gpu, PoolKind::Static).unwrap();
    assert_eq!(ordered.entity_indices, vec![0, 1, 2, 4, 6]);
    assert_eq!(ordered.offsets, vec![0, 2]);
    assert!(serial.dispatch_labels().iter().any(|label| label == "Append Serial"));
}

#[test]
fn test_frustum_culls_outside_and_keeps_inside() {
    let positions = [
        Vec3::new(0.0, 0.0, -10.0),
        Vec3::new(0.0, 0.0, 10.0),
        Vec3::new(100.0, 0.0, -10.0),
        Vec3::new(0.0, 0.0, -150.0),
        Vec3::new(0.0, 0.0, -50.0),
    ];
    let mut scene = Scene::new(&positions).with_config(frustum_only());
    for entity in 0..positions.len() as u32 {
        scene.state.push_batch(cube_batch(entity, 1));
    }
    let mut renderer = scene.renderer(PipelineConfig::default());

    let (_, draws) = scene.frame(&mut renderer);
    assert_eq!(indirect_entities(&draws), vec![0, 4]);
}

#[test]
fn test_disabling_gpu_frustum_culling_keeps_everything() {
    let mut scene = Scene::new(&mixed_positions()).with_config(CullingConfig::pass_through());
    scene.state.push_batch(cube_batch(0, 8));
    let mut renderer = scene.renderer(PipelineConfig::default());

    let (_, draws) = scene.frame(&mut renderer);
    assert_eq!(indirect_entities(&draws), (0..8).collect::<Vec<_>>());
}

#[test]
fn test_empty_scene_draws_nothing() {
    let mut scene = Scene::row(4, 10.0);
    let mut renderer = scene.renderer(PipelineConfig::default());

    let (result, draws) = scene.frame(&mut renderer);

    assert!(draws.is_empty());
    assert_eq!(result, Default::default());
    assert!(!scene.dispatch_labels().iter().any(|label| label == "Visibility"));
}

#[test]
fn test_fully_culled_pool_issues_zero_count_draw() {
    let mut scene = Scene::new(&[Vec3::new(0.0, 0.0, 10.0)]).with_config(frustum_only());
    scene.state.push_batch(cube_batch(0, 1));
    let mut renderer = scene.renderer(PipelineConfig::default());

    let (_, draws) = scene.frame(&mut renderer);
    assert!(indirect_entities(&draws).is_empty());

    let compacted = renderer.read_compacted(&mut scene.gpu, PoolKind::Static).unwrap();
    assert_eq!(compacted.draw_count, 0);
    assert_eq!(compacted.entity_count, 0);
}

#[test]
fn test_invisible_and_zero_instance_batches_are_skipped() {
    let mut scene = Scene::row(4, 10.0).with_config(CullingConfig::pass_through());
    let mut hidden = cube_batch(0, 1);
    hidden.is_visible = false;
    scene.state.push_batch(hidden);
    scene.state.push_batch(cube_batch(1, 0));
    scene.state.push_batch(cube_batch(2, 2));
    let mut renderer = scene.renderer(PipelineConfig::default());

    let (result, draws) = scene.frame(&mut renderer);

    assert_eq!(indirect_entities(&draws), vec![2, 3]);
    assert_eq!(result.entities_drawn, 2);
    let stats = renderer.prepare_stats(PoolKind::Static);
    assert_eq!(stats.indirect, 1);
    assert_eq!(stats.rejected, 1);
}

#[test]
fn test_cpu_frustum_culling_drops_batches_before_upload() {
    let mut scene = Scene::new(&[Vec3::new(0.0, 0.0, -10.0), Vec3::new(0.0, 0.0, 10.0)]).with_config(CullingConfig {
        use_cpu_frustum_culling: true,
        ..CullingConfig::pass_through()
    });
    let behind = Aabb::from_center_half_extents(Vec3::new(0.0, 0.0, 10.0), Vec3::splat(0.5));
    let ahead = Aabb::from_center_half_extents(Vec3::new(0.0, 0.0, -10.0), Vec3::splat(0.5));
    scene.state.push_batch(cube_batch(0, 1).with_world_bounds(ahead));
    scene.state.push_batch(cube_batch(1, 1).with_world_bounds(behind));
    let mut renderer = scene.renderer(PipelineConfig::default());

    let (_, draws) = scene.frame(&mut renderer);

    assert_eq!(indirect_entities(&draws), vec![0]);
    assert_eq!(renderer.prepare_stats(PoolKind::Static).cpu_culled, 1);
    assert_eq!(renderer.commands(PoolKind::Static).command_count(), 1);
}

#[test]
fn test_animated_pool_draws_with_placeholder_joints() {
    let mut scene = Scene::row(3, 10.0).with_config(CullingConfig::pass_through());
    scene.state.push_batch(cube_batch(0, 1));
    scene.state.push_batch(cube_batch(1, 2).animated());
    let mut renderer = scene.renderer(PipelineConfig::default());

    let (result, draws) = scene.frame(&mut renderer);
    assert_eq!(result.indirect_draw_calls, 2);

    let animated = draws
        .iter()
        .find(|draw| draw.program == RenderProgram::Animated)
        .expect("animated draw");
    assert!(animated.indirect);
    assert!(animated.joints.is_some());
    let mut entities = animated.entities().collect::<Vec<_>>();
    entities.sort_unstable();
    assert_eq!(entities, vec![1, 2]);

    let stat = draws
        .iter()
        .find(|draw| draw.program == RenderProgram::Static)
        .expect("static draw");
    assert_eq!(stat.joints, None);
}

#[test]
fn test_fallback_batches_draw_in_priority_order() {
    let mut scene = Scene::row(6, 10.0).with_config(CullingConfig::pass_through());
    let mut late = cube_batch(0, 1);
    late.render_priority = Some(5);
    let mut early = cube_batch(1, 1);
    early.render_priority = Some(-1);
    let mut forward = cube_batch(2, 2);
    forward.is_forward_rendered = true;
    let mut no_depth = cube_batch(4, 1);
    no_depth.writes_depth = false;

    for batch in [late, early, forward, no_depth, cube_batch(5, 1)] {
        scene.state.push_batch(batch);
    }
    let mut renderer = scene.renderer(PipelineConfig::default());

    let (result, draws) = scene.frame(&mut renderer);

    let fallback = draws.iter().filter(|draw| !draw.indirect).collect::<Vec<_>>();
    let order = fallback
        .iter()
        .map(|draw| draw.entities().collect::<Vec<_>>())
        .collect::<Vec<_>>();
    assert_eq!(order, vec![vec![1], vec![2, 3], vec![4], vec![0]]);
    assert!(!fallback[2].raster.depth_write);
    assert!(fallback[0].raster.depth_write);

    assert_eq!(result.fallback_draw_calls, 4);
    assert_eq!(result.indirect_draw_calls, 1);
    assert_eq!(result.entities_drawn, 6);
    assert_eq!(indirect_entities(&draws), vec![5]);
}

#[test]
fn test_fallback_draws_follow_material_raster_policy() {
    let mut scene = Scene::row(3, 10.0).with_config(CullingConfig::pass_through());
    let mut double_sided = cube_batch(0, 1);
    double_sided.cull_mode = CullMode::None;
    let mut overlay = cube_batch(1, 1);
    overlay.depth_test = false;
    overlay.writes_depth = false;
    overlay.render_priority = Some(1);

    for batch in [double_sided, overlay, cube_batch(2, 1)] {
        scene.state.push_batch(batch);
    }
    let mut renderer = scene.renderer(PipelineConfig::default());
    let (result, draws) = scene.frame(&mut renderer);

    let fallback = draws.iter().filter(|draw| !draw.indirect).collect::<Vec<_>>();
    assert_eq!(fallback.len(), 2);
    assert_eq!(fallback[0].entities().collect::<Vec<_>>(), vec![0]);
    assert_eq!(fallback[0].raster.cull_mode, CullMode::None);
    assert!(fallback[0].raster.depth_test);
    assert!(fallback[0].raster.depth_write);

    assert_eq!(fallback[1].entities().collect::<Vec<_>>(), vec![1]);
    assert_eq!(fallback[1].raster.cull_mode, CullMode::Back);
    assert!(!fallback[1].raster.depth_test);
    assert!(!fallback[1].raster.depth_write);

    assert_eq!(indirect_entities(&draws), vec![2]);
    assert_eq!(result.fallback_draw_calls, 2);
    // Later passes start from the shared first-pass state again
    assert_eq!(scene.gpu.raster_state().cull_mode, CullMode::Back);
    assert!(scene.gpu.raster_state().depth_test);
}

#[test]
fn test_freeze_replays_previous_compacted_set() {
    let mut scene = Scene::new(&mixed_positions()).with_config(frustum_only());
    scene.state.push_batch(cube_batch(0, 8));
    let mut renderer = scene.renderer(PipelineConfig::default());
    let (_, first) = scene.frame(&mut renderer);

    scene.state.config.freeze_culling = true;
    scene.state.static_batches.clear();
    scene.gpu.clear_command_log();
    let (_, frozen) = scene.frame(&mut renderer);

    assert_eq!(indirect_entities(&frozen), indirect_entities(&first));
    assert_eq!(indirect_entities(&frozen), vec![0, 1, 2, 4, 6]);
    let labels = scene.dispatch_labels();
    assert!(!labels.iter().any(|label| label == "Visibility"));
    assert!(!labels.iter().any(|label| label.starts_with("Append")));
}

#[test]
fn test_stages_are_separated_by_barriers() {
    let mut scene = Scene::row(4, 10.0).with_config(frustum_only());
    scene.state.push_batch(cube_batch(0, 4));
    let mut renderer = scene.renderer(PipelineConfig::default());
    scene.gpu.clear_command_log();
    scene.frame(&mut renderer);

    let log = scene.gpu.command_log();
    let visibility = dispatch_index(log, "Visibility");
    let offsets = dispatch_index(log, "Compaction Offsets");
    let append = dispatch_index(log, "Append Parallel");
    let draw = log
        .iter()
        .position(|c| matches!(c, LoggedCommand::DrawIndirect { .. }))
        .unwrap();

    assert!(visibility < offsets && offsets < append && append < draw);
    let barrier_between = |from: usize, to: usize, scope: Barrier| {
        log[from..to]
            .iter()
            .any(|c| matches!(c, LoggedCommand::Barrier(b) if b.contains(scope)))
    };
    assert!(barrier_between(visibility, offsets, Barrier::SHADER_STORAGE));
    assert!(barrier_between(offsets, append, Barrier::SHADER_STORAGE));
    assert!(barrier_between(append, draw, Barrier::COMMAND));
}

#[test]
fn test_buffers_grow_between_frames() {
    let mut scene = Scene::row(4, 10.0).with_config(CullingConfig::pass_through());
    scene.state.push_batch(cube_batch(0, 4));
    let mut renderer = scene.renderer(PipelineConfig {
        initial_command_capacity: 2,
        initial_instance_capacity: 4,
        ..PipelineConfig::default()
    });
    scene.frame(&mut renderer);
    let before = renderer.commands(PoolKind::Static).commands().capacity();

    for _ in 0..2000 {
        scene.state.push_batch(cube_batch(1, 2));
    }
    let (result, draws) = scene.frame(&mut renderer);

    assert!(renderer.commands(PoolKind::Static).commands().capacity() > before);
    assert_eq!(result.entities_drawn, 4 + 2000 * 2);
    assert_eq!(indirect_entities(&draws).len(), 4 + 2000 * 2);
}

#[test]
fn test_out_of_memory_aborts_the_frame() {
    let gpu = SoftwareGpu::new(common::WIDTH, common::HEIGHT).with_memory_budget(160 * 1024);
    let mut scene = Scene::on_device(gpu, &[Vec3::new(0.0, 0.0, -10.0)]);
    let mut renderer = scene.renderer(PipelineConfig {
        initial_command_capacity: 4,
        initial_instance_capacity: 16,
        ..PipelineConfig::default()
    });
    for _ in 0..10_000 {
        scene.state.push_batch(cube_batch(0, 1));
    }

    let mut result = Default::default();
    let error = renderer.render(&mut scene.gpu, &scene.state, &mut result).unwrap_err();
    assert!(matches!(error, CullError::OutOfMemory { .. }), "unexpected error: {}", error);
}

#[test]
fn test_debug_dump_records_each_pool_and_phase() {
    let mut scene = Scene::new(&mixed_positions()).with_config(frustum_only());
    scene.state.push_batch(cube_batch(0, 8));
    let mut renderer = scene.renderer(PipelineConfig {
        debug_dump_buffers: true,
        ..PipelineConfig::default()
    });
    scene.frame(&mut renderer);

    let dump = renderer.debug_dump();
    assert_eq!(dump.len(), 2);
    let (pool, _, output) = &dump[0];
    assert_eq!(*pool, PoolKind::Static);
    assert_eq!(output.entity_count, 5);
    assert_eq!(dump[1].2.draw_count, 0);
}

#[test]
fn test_wireframe_sets_line_raster_and_effect_flag() {
    let mut scene = Scene::row(2, 10.0).with_config(CullingConfig {
        is_draw_lines: true,
        ..CullingConfig::pass_through()
    });
    scene.state.push_batch(cube_batch(0, 2));
    let mut renderer = scene.renderer(PipelineConfig::default());

    let (_, draws) = scene.frame(&mut renderer);
    assert_eq!(draws[0].raster.polygon_mode, firstpass::gpu::PolygonMode::Line);
    assert_eq!(scene.gpu.raster_state().polygon_mode, firstpass::gpu::PolygonMode::Line);
}
