mod common;

use common::{cube_batch, depth_at, indirect_entities, Scene};
use firstpass::renderer::CullPhase;
use firstpass::{CoarseCulling, CullingConfig, PipelineConfig, PoolKind};
use glam::Vec3;

/// Entity 0 in front of a wall at distance 5, entity 1 behind it
fn wall_scene(config: CullingConfig) -> Scene {
    let mut scene = Scene::new(&[Vec3::new(0.0, 0.0, -2.0), Vec3::new(0.0, 0.0, -10.0)]).with_config(config);
    scene.state.push_batch(cube_batch(0, 1));
    scene.state.push_batch(cube_batch(1, 1));
    scene.gpu.fill_depth(depth_at(5.0)).unwrap();
    scene
}

#[test]
fn test_first_frame_treats_everything_as_unoccluded() {
    let mut scene = wall_scene(CullingConfig::default());
    let mut renderer = scene.renderer(PipelineConfig::default());

    assert!(!renderer.hi_z().is_valid());
    let (_, draws) = scene.frame(&mut renderer);

    assert_eq!(indirect_entities(&draws), vec![0, 1]);
    assert!(renderer.hi_z().is_valid());
}

#[test]
fn test_hi_z_holds_the_farthest_depth() {
    let mut scene = wall_scene(CullingConfig::default());
    let mut renderer = scene.renderer(PipelineConfig::default());
    scene.frame(&mut renderer);

    let hi_z = renderer.hi_z();
    let wall = depth_at(5.0);
    for level in 0..hi_z.mip_levels() {
        let texels = scene.gpu.texture_texels(hi_z.texture(), level).unwrap();
        let (width, height) = hi_z.level_size(level);
        assert_eq!(texels.len(), (width * height) as usize);
        assert!(texels.iter().all(|&d| d == wall), "mip {} is not uniform", level);
    }
    assert_eq!(hi_z.level_size(0), (common::WIDTH / 2, common::HEIGHT / 2));
}

#[test]
fn test_objects_behind_last_frame_depth_are_culled() {
    let mut scene = wall_scene(CullingConfig::default());
    let mut renderer = scene.renderer(PipelineConfig::default());
    scene.frame(&mut renderer);

    let (result, draws) = scene.frame(&mut renderer);

    assert_eq!(indirect_entities(&draws), vec![0]);
    // The counter reports the filtered input, not the survivors
    assert_eq!(result.entities_drawn, 2);
    let compacted = renderer.read_compacted(&mut scene.gpu, PoolKind::Static).unwrap();
    assert_eq!(compacted.entity_count, 1);
}

#[test]
fn test_disabled_occlusion_keeps_hidden_objects() {
    let mut scene = wall_scene(CullingConfig {
        use_gpu_occlusion_culling: false,
        ..CullingConfig::default()
    });
    let mut renderer = scene.renderer(PipelineConfig::default());
    scene.frame(&mut renderer);

    let (_, draws) = scene.frame(&mut renderer);
    assert_eq!(indirect_entities(&draws), vec![0, 1]);
}

#[test]
fn test_cleared_depth_occludes_nothing() {
    let mut scene = wall_scene(CullingConfig::default());
    scene.gpu.fill_depth(1.0).unwrap();
    let mut renderer = scene.renderer(PipelineConfig::default());
    scene.frame(&mut renderer);

    let (_, draws) = scene.frame(&mut renderer);
    assert_eq!(indirect_entities(&draws), vec![0, 1]);
}

#[test]
fn test_second_phase_draws_newly_disoccluded_objects() {
    let mut scene = wall_scene(CullingConfig::default());
    let mut renderer = scene.renderer(PipelineConfig {
        coarse_culling: CoarseCulling::TwoPhase,
        debug_dump_buffers: true,
        ..PipelineConfig::default()
    });

    // Nothing was culled in phase one, so phase two has nothing to add
    let (_, first) = scene.frame(&mut renderer);
    assert_eq!(indirect_entities(&first), vec![0, 1]);
    let phase_two = |renderer: &firstpass::FirstPassRenderer| {
        renderer
            .debug_dump()
            .iter()
            .find(|(pool, phase, _)| *pool == PoolKind::Static && *phase == CullPhase::Two)
            .map(|(_, _, output)| output.entity_indices.clone())
            .unwrap()
    };
    assert!(phase_two(&renderer).is_empty());

    // The wall is gone: last frame's Hi-Z still hides entity 1 from phase one
    scene.gpu.fill_depth(1.0).unwrap();
    let (result, second) = scene.frame(&mut renderer);

    let phase_one = renderer
        .debug_dump()
        .iter()
        .find(|(pool, phase, _)| *pool == PoolKind::Static && *phase == CullPhase::One)
        .map(|(_, _, output)| output.entity_indices.clone())
        .unwrap();
    assert_eq!(phase_one, vec![0]);
    assert_eq!(phase_two(&renderer), vec![1]);
    assert_eq!(indirect_entities(&second), vec![0, 1]);
    assert_eq!(result.indirect_draw_calls, 2);
    assert_eq!(renderer.debug_dump().len(), 4);
}

#[test]
fn test_two_phase_rebuilds_hi_z_twice_per_frame() {
    let mut scene = wall_scene(CullingConfig::default());
    let mut renderer = scene.renderer(PipelineConfig {
        coarse_culling: CoarseCulling::TwoPhase,
        ..PipelineConfig::default()
    });
    scene.frame(&mut renderer);
    scene.frame(&mut renderer);
    assert_eq!(renderer.hi_z().build_count(), 4);

    let base_builds = scene
        .dispatch_labels()
        .iter()
        .filter(|label| *label == "Hi-Z Base")
        .count();
    assert_eq!(base_builds, 4);
    assert!(scene.dispatch_labels().iter().any(|label| label == "Reset Cull State"));
}

#[test]
fn test_phase_one_never_resets_cull_state() {
    let mut scene = wall_scene(CullingConfig::default());
    let mut renderer = scene.renderer(PipelineConfig::default());
    scene.frame(&mut renderer);

    assert!(!scene.dispatch_labels().iter().any(|label| label == "Reset Cull State"));
}

#[test]
fn test_freeze_after_two_phase_frame_redraws_both_phases() {
    let mut scene = wall_scene(CullingConfig::default());
    let mut renderer = scene.renderer(PipelineConfig {
        coarse_culling: CoarseCulling::TwoPhase,
        ..PipelineConfig::default()
    });
    scene.frame(&mut renderer);

    // Entity 1 is hidden from phase one and recovered by phase two
    scene.gpu.fill_depth(1.0).unwrap();
    let (_, unfrozen) = scene.frame(&mut renderer);
    assert_eq!(indirect_entities(&unfrozen), vec![0, 1]);
    let phase_one = renderer.read_compacted_phase(&mut scene.gpu, PoolKind::Static, CullPhase::One).unwrap();
    let phase_two = renderer.read_compacted_phase(&mut scene.gpu, PoolKind::Static, CullPhase::Two).unwrap();
    assert_eq!(phase_one.entity_indices, vec![0]);
    assert_eq!(phase_two.entity_indices, vec![1]);

    scene.state.config.freeze_culling = true;
    let (result, frozen) = scene.frame(&mut renderer);
    assert_eq!(indirect_entities(&frozen), vec![0, 1]);
    assert_eq!(result.indirect_draw_calls, 2);
    assert_eq!(result.entities_drawn, 2);
}

#[test]
fn test_freeze_after_unoccluded_two_phase_frame_keeps_everything() {
    let mut scene = wall_scene(CullingConfig::default());
    scene.gpu.fill_depth(1.0).unwrap();
    let mut renderer = scene.renderer(PipelineConfig {
        coarse_culling: CoarseCulling::TwoPhase,
        ..PipelineConfig::default()
    });

    let (_, unfrozen) = scene.frame(&mut renderer);
    scene.state.config.freeze_culling = true;
    let (_, frozen) = scene.frame(&mut renderer);

    assert_eq!(indirect_entities(&unfrozen), vec![0, 1]);
    assert_eq!(indirect_entities(&frozen), vec![0, 1]);
}
