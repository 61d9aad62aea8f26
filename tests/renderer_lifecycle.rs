mod common;

use common::{cube_batch, indirect_entities, Scene};
use firstpass::{CoarseCulling, CullingConfig, GraphicsApi, PipelineConfig};
use std::io::Write;

#[test]
fn test_release_returns_all_pipeline_memory() {
    let mut scene = Scene::row(4, 10.0);
    scene.state.push_batch(cube_batch(0, 4));
    let before = scene.gpu.live_buffers();

    let mut renderer = scene.renderer(PipelineConfig::default());
    scene.frame(&mut renderer);
    assert!(scene.gpu.live_buffers() > before);

    renderer.release(&mut scene.gpu);
    assert_eq!(scene.gpu.live_buffers(), before);
}

#[test]
fn test_renderer_drives_a_trait_object() {
    let mut scene = Scene::row(3, 10.0).with_config(CullingConfig::pass_through());
    scene.state.push_batch(cube_batch(0, 3));

    let mut renderer = scene.renderer(PipelineConfig::default());
    let mut result = Default::default();
    {
        let api: &mut dyn GraphicsApi = &mut scene.gpu;
        assert_eq!(api.backend_name(), "software");
        renderer.render(api, &scene.state, &mut result).unwrap();
    }
    assert_eq!(result.entities_drawn, 3);
    assert_eq!(indirect_entities(scene.gpu.draws()), vec![0, 1, 2]);
}

#[test]
fn test_counters_accumulate_across_frames() {
    let mut scene = Scene::row(2, 10.0).with_config(CullingConfig::pass_through());
    scene.state.push_batch(cube_batch(0, 2));
    let mut renderer = scene.renderer(PipelineConfig::default());

    let mut result = Default::default();
    for _ in 0..3 {
        renderer.render(&mut scene.gpu, &scene.state, &mut result).unwrap();
    }
    assert_eq!(result.entities_drawn, 6);
    assert_eq!(result.indirect_draw_calls, 3);
    assert_eq!(renderer.frame_count(), 3);
    assert_eq!(scene.gpu.submissions(), 3);
}

#[test]
fn test_pipeline_config_from_file_selects_two_phase() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(
        file,
        "coarse_culling = \"two_phase\"\ninitial_command_capacity = 8\ninitial_instance_capacity = 32\n\n[culling]\nuse_gpu_occlusion_culling = false"
    )
    .unwrap();
    let config = PipelineConfig::load(file.path()).unwrap();
    assert_eq!(config.coarse_culling, CoarseCulling::TwoPhase);
    assert!(!config.culling.use_gpu_occlusion_culling);
    assert!(config.culling.use_gpu_frustum_culling);

    let mut scene = Scene::row(2, 10.0).with_config(config.culling);
    scene.state.push_batch(cube_batch(0, 2));
    let mut renderer = scene.renderer(config);
    let (result, _) = scene.frame(&mut renderer);

    // Phase one and phase two each issue one static draw
    assert_eq!(result.indirect_draw_calls, 2);
    assert!(scene.dispatch_labels().iter().any(|label| label == "Reset Cull State"));
}
