#[cfg(test)]
mod tests {
    use super::super::indirect_draw::first_pass_raster_state;
    use super::super::*;
    use crate::config::CullingConfig;
    use crate::gpu::buffer_layouts::{CommandCullState, DrawElementsIndirectCommand, EntityRecord};
    use crate::gpu::{BufferUsage, GraphicsApi, LoggedCommand, PolygonMode, ProgramId, RenderProgram, SoftwareGpu};
    use crate::memory::PersistentBuffer;
    use crate::renderer::gpu_culling::frustum_culler::{Aabb, Frustum};
    use crate::renderer::gpu_culling::hzb_builder::HierarchicalZBuffer;
    use crate::state::{Camera, GeometryPool, PoolKind, RenderBatch, RenderState};
    use glam::Vec3;

    fn unit_bounds() -> Aabb {
        Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5))
    }

    fn batch(entity: u32, instances: u32) -> RenderBatch {
        RenderBatch::new(entity, DrawElementsIndirectCommand::new(36, instances, 0, 0), unit_bounds())
    }

    fn camera() -> Camera {
        Camera::look_at(Vec3::ZERO, Vec3::NEG_Z, Vec3::Y, 60f32.to_radians(), 1.0, 0.1, 100.0)
    }

    /// Scene whose entity `i` sits at `positions[i]`
    fn scene(gpu: &mut SoftwareGpu, positions: &[Vec3]) -> RenderState {
        let records = positions.iter().map(|&p| EntityRecord::from_translation(p)).collect::<Vec<_>>();
        let mut entities = PersistentBuffer::new(gpu, "Entities", BufferUsage::STORAGE, 0).unwrap();
        entities.write(gpu, 0, &records).unwrap();
        let materials = PersistentBuffer::new(gpu, "Materials", BufferUsage::STORAGE, 0).unwrap();
        let static_pool = GeometryPool::allocate(gpu, PoolKind::Static, 1024, 1024).unwrap();
        let animated_pool = GeometryPool::allocate(gpu, PoolKind::Animated, 1024, 1024).unwrap();

        let mut state = RenderState::new(
            camera(),
            entities.handle(),
            records.len() as u32,
            materials.handle(),
            static_pool,
            animated_pool,
        );
        state.config = CullingConfig {
            use_gpu_occlusion_culling: false,
            ..CullingConfig::default()
        };
        state
    }

    fn build_commands(gpu: &mut SoftwareGpu, batches: &[RenderBatch]) -> IndirectCommandBuffers {
        let mut commands = IndirectCommandBuffers::new(gpu, "Test", 1).unwrap();
        let refs = batches.iter().collect::<Vec<_>>();
        commands.build(gpu, &refs).unwrap();
        commands
    }

    #[test]
    fn test_command_build_is_positional_copy() {
        let mut gpu = SoftwareGpu::new(4, 4);
        let batches = vec![batch(10, 2), batch(20, 5), batch(30, 1)];
        let commands = build_commands(&mut gpu, &batches);

        assert_eq!(commands.command_count(), 3);
        assert_eq!(commands.instance_count(), 8);
        assert_eq!(commands.max_instances_per_command(), 5);
        assert_eq!(commands.mapped_entity_offsets(), vec![10, 20, 30]);
        let written = commands.mapped_commands();
        assert_eq!(written, batches.iter().map(|b| b.draw_command).collect::<Vec<_>>());

        let state = gpu.read_records::<CommandCullState>(commands.cull_state().handle()).unwrap();
        let offsets = state.iter().take(3).map(|s| s.instance_offset).collect::<Vec<_>>();
        assert_eq!(offsets, vec![0, 2, 7]);
    }

    #[test]
    fn test_command_build_grows_buffers() {
        let mut gpu = SoftwareGpu::new(4, 4);
        let batches = (0..500).map(|i| batch(i, 1)).collect::<Vec<_>>();
        let commands = build_commands(&mut gpu, &batches);
        assert!(commands.commands().capacity() >= 500 * 20);
        assert_eq!(commands.mapped_entity_offsets()[499], 499);
    }

    #[test]
    fn test_empty_build_yields_no_commands() {
        let mut gpu = SoftwareGpu::new(4, 4);
        let commands = build_commands(&mut gpu, &[]);
        assert!(commands.is_empty());
        assert_eq!(commands.instance_count(), 0);
        assert!(commands.mapped_commands().is_empty());
    }

    /// Counts [2, 5, 1] with visibility [1,1 | 1,0,1,0,1 | 0]
    fn compact_reference_case(parallel: bool) -> CompactedOutput {
        let mut gpu = SoftwareGpu::new(4, 4);
        let batches = vec![batch(0, 2), batch(100, 5), batch(200, 1)];
        let commands = build_commands(&mut gpu, &batches);

        let flags = [1u32, 1, 1, 0, 1, 0, 1, 0];
        let mut visibility = PersistentBuffer::new(&mut gpu, "Visibility", BufferUsage::STORAGE, 0).unwrap();
        visibility.write(&mut gpu, 0, &flags).unwrap();
        let state = [
            CommandCullState { instance_offset: 0, visible_count: 2, ..Default::default() },
            CommandCullState { instance_offset: 2, visible_count: 3, ..Default::default() },
            CommandCullState { instance_offset: 7, visible_count: 0, ..Default::default() },
        ];
        gpu.write_buffer(commands.cull_state().handle(), 0, bytemuck::cast_slice(&state)).unwrap();

        let mut compaction = DrawCompaction::new(&mut gpu, "Test", 1, 1).unwrap();
        compaction.execute(&mut gpu, &commands, visibility.handle(), parallel).unwrap();
        compaction.read_back(&mut gpu).unwrap()
    }

    #[test]
    fn test_parallel_compaction_reference_case() {
        let output = compact_reference_case(true);
        assert_eq!(output.draw_count, 2);
        assert_eq!(output.entity_count, 5);
        assert_eq!(output.instance_total(), 5);

        let mut commands = output.commands.clone();
        commands.sort_by_key(|c| c.base_instance);
        assert_eq!(
            commands.iter().map(|c| (c.instance_count, c.base_instance)).collect::<Vec<_>>(),
            vec![(2, 0), (3, 2)]
        );

        let mut per_command = output.entities_per_command();
        for entities in &mut per_command {
            entities.sort_unstable();
        }
        per_command.sort();
        assert_eq!(per_command, vec![vec![0, 1], vec![100, 102, 104]]);

        let mut offsets = output.offsets.clone();
        offsets.sort_unstable();
        assert_eq!(offsets, vec![0, 2]);
    }

    #[test]
    fn test_serial_compaction_is_ordered() {
        let output = compact_reference_case(false);
        assert_eq!(output.draw_count, 2);
        assert_eq!(output.entity_indices, vec![0, 1, 100, 102, 104]);
        assert_eq!(output.commands[0].instance_count, 2);
        assert_eq!(output.commands[1].instance_count, 3);
        assert_eq!(output.commands[1].base_instance, 2);
        assert_eq!(output.offsets, vec![0, 2]);
    }

    #[test]
    fn test_compaction_of_nothing_clears_draw_count() {
        let mut gpu = SoftwareGpu::new(4, 4);
        let commands = build_commands(&mut gpu, &[]);
        let mut compaction = DrawCompaction::new(&mut gpu, "Test", 1, 1).unwrap();
        gpu.write_buffer(compaction.draw_counts(), 0, bytemuck::cast_slice(&[9u32, 9])).unwrap();

        let visibility = gpu.create_buffer(&crate::gpu::BufferDesc::new("v", 4, BufferUsage::STORAGE)).unwrap();
        compaction.execute(&mut gpu, &commands, visibility, true).unwrap();

        let output = compaction.read_back(&mut gpu).unwrap();
        assert_eq!(output, CompactedOutput::default());
        assert_eq!(compaction.max_draw_count(), 0);
    }

    #[test]
    fn test_phase_two_marks_only_newly_visible() {
        let mut gpu = SoftwareGpu::new(16, 16);
        // Entity 0 ahead of the camera, entity 1 to its right
        let mut state = scene(&mut gpu, &[Vec3::new(0.0, 0.0, -10.0), Vec3::new(40.0, 0.0, -10.0)]);
        let batches = vec![batch(0, 2)];
        let commands = build_commands(&mut gpu, &batches);
        let hi_z = HierarchicalZBuffer::new(&mut gpu, 16, 16).unwrap();
        let mut culling = CullingPipeline::new(&mut gpu, "Test", 1).unwrap();

        culling.run(&mut gpu, CullPhase::One, &commands, &state, &hi_z).unwrap();
        let first = gpu.read_records::<u32>(culling.visibility(CullPhase::One)).unwrap();
        assert_eq!(&first[..2], &[1, 0]);

        // Turn to face both; phase two only reports entity 1
        state.camera = Camera::look_at(Vec3::new(20.0, 0.0, 30.0), Vec3::new(20.0, 0.0, -10.0), Vec3::Y, 90f32.to_radians(), 1.0, 0.1, 100.0);
        culling.run(&mut gpu, CullPhase::Two, &commands, &state, &hi_z).unwrap();
        let second = gpu.read_records::<u32>(culling.visibility(CullPhase::Two)).unwrap();
        assert_eq!(&second[..2], &[0, 1]);

        let cull_state = gpu.read_records::<CommandCullState>(commands.cull_state().handle()).unwrap();
        assert_eq!(cull_state[0].visible_count, 1);
        assert_eq!(cull_state[0].instance_offset, 0);

        let log = gpu.command_log();
        let reset = log.iter().position(|c| matches!(c, LoggedCommand::Dispatch { label, .. } if label == "Reset Cull State"));
        let second_visibility = log
            .iter()
            .rposition(|c| matches!(c, LoggedCommand::Dispatch { label, .. } if label == "Visibility"));
        assert!(reset.is_some() && reset < second_visibility);
    }

    #[test]
    fn test_cull_uniform_flags_follow_config() {
        let mut gpu = SoftwareGpu::new(16, 16);
        let mut state = scene(&mut gpu, &[Vec3::ZERO]);
        let commands = build_commands(&mut gpu, &[batch(0, 1)]);
        let hi_z = HierarchicalZBuffer::new(&mut gpu, 16, 16).unwrap();

        state.config = CullingConfig::default();
        let uniforms = CullingPipeline::cull_uniforms(CullPhase::One, &commands, &state, &hi_z);
        assert!(uniforms.frustum_enabled());
        // No Hi-Z yet: occlusion is requested but not honoured
        assert!(!uniforms.occlusion_enabled());
        assert!(!uniforms.phase_two());
        assert_eq!(uniforms.hi_z_size, [16, 16, 4, 0]);

        state.config = CullingConfig::pass_through();
        let uniforms = CullingPipeline::cull_uniforms(CullPhase::Two, &commands, &state, &hi_z);
        assert_eq!(uniforms.flags, crate::constants::culling::FLAG_PHASE_TWO);
        assert_eq!(
            Frustum::from_arrays(&uniforms.frustum_planes),
            Frustum::from_view_projection(&state.camera.view_projection)
        );
    }

    #[test]
    fn test_filter_splits_indirect_and_fallback() {
        let mut forward = batch(1, 1);
        forward.is_forward_rendered = true;
        let mut hidden = batch(2, 1);
        hidden.is_visible = false;
        let empty = batch(3, 0);
        let far_away = batch(4, 1).with_world_bounds(Aabb::from_center_half_extents(Vec3::new(500.0, 0.0, 0.0), Vec3::ONE));
        let near = batch(5, 1).with_world_bounds(Aabb::from_center_half_extents(Vec3::new(0.0, 0.0, -5.0), Vec3::ONE));
        let batches = vec![forward, hidden, empty, far_away, near];

        let frustum = Frustum::from_view_projection(&camera().view_projection);
        let mut indirect = Vec::new();
        let mut fallback = Vec::new();
        let stats = filter_batches(&batches, PoolKind::Static, Some(&frustum), &mut indirect, &mut fallback);

        assert_eq!(indirect.iter().map(|b| b.entity_buffer_index).collect::<Vec<_>>(), vec![5]);
        assert_eq!(fallback.len(), 1);
        assert_eq!(fallback[0].1.entity_buffer_index, 1);
        assert_eq!(stats, PrepareStats { indirect: 1, fallback: 1, cpu_culled: 1, rejected: 1 });
    }

    #[test]
    fn test_fallback_sorted_by_priority_and_stable() {
        let mut gpu = SoftwareGpu::new(4, 4);
        let mut late = batch(10, 1);
        late.render_priority = Some(2);
        let mut early = batch(20, 2);
        early.render_priority = Some(-1);
        let mut custom = batch(30, 1);
        custom.program = Some(ProgramId(3));
        let mut forward = batch(40, 1);
        forward.is_forward_rendered = true;
        forward.writes_depth = false;

        let input = [
            (PoolKind::Static, &late),
            (PoolKind::Static, &early),
            (PoolKind::Static, &custom),
            (PoolKind::Animated, &forward),
        ];
        let mut drawer = FallbackDrawer::new(&mut gpu).unwrap();
        drawer.prepare(&mut gpu, &input).unwrap();

        let draws = drawer.draws();
        assert_eq!(draws.len(), 4);
        assert_eq!(draws[0].command.base_instance, 0);
        assert_eq!(draws[0].command.instance_count, 2);
        assert_eq!(draws[1].program, RenderProgram::Custom(ProgramId(3)));
        assert_eq!(draws[1].command.base_instance, 2);
        assert_eq!(draws[2].program, RenderProgram::Animated);
        assert!(!draws[2].depth_write);
        assert_eq!(draws[3].program, RenderProgram::Static);
        assert_eq!(draws[3].command.base_instance, 4);

        let state = scene(&mut gpu, &[Vec3::ZERO]);
        let stats = drawer
            .draw(&mut gpu, &state, state.camera.frame_uniforms(0.0, 0), state.entities)
            .unwrap();
        assert_eq!(stats.draw_calls, 4);
        assert_eq!(stats.entities, 5);

        let recorded = gpu.draws();
        assert_eq!(recorded[0].instances, vec![vec![20, 21]]);
        assert_eq!(recorded[1].instances, vec![vec![30]]);
        assert_eq!(recorded[3].instances, vec![vec![10]]);
        assert!(!recorded[2].raster.depth_write);
        assert!(recorded[3].raster.depth_write);
        assert_eq!(recorded[2].joints, Some(state.entities));
    }

    #[test]
    fn test_wireframe_raster_state() {
        assert_eq!(first_pass_raster_state(true).polygon_mode, PolygonMode::Line);
        assert_eq!(first_pass_raster_state(false).polygon_mode, PolygonMode::Fill);
        assert!(first_pass_raster_state(false).depth_write);
    }
}
