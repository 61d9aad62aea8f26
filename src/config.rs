//! Pipeline configuration
//!
//! `CullingConfig` is the per-frame flag set carried by every `RenderState`.
//! `PipelineConfig` fixes construction-time choices and can be loaded from TOML:
//!
//! ```toml
//! coarse_culling = "two_phase"
//! debug_dump_buffers = false
//!
//! [culling]
//! use_gpu_occlusion_culling = true
//! use_cpu_frustum_culling = true
//! ```

use crate::constants::buffers::{DEFAULT_COMMAND_CAPACITY, DEFAULT_INSTANCE_CAPACITY};
use crate::error::{CullError, CullResult};
use serde::{Deserialize, Serialize};
use std::path::Path;

/// Per-frame culling toggles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CullingConfig {
    /// Rasterize the first pass as wireframe
    pub is_draw_lines: bool,
    /// Skip prepare and culling, redraw last frame's compacted set
    pub freeze_culling: bool,
    pub use_gpu_frustum_culling: bool,
    pub use_gpu_occlusion_culling: bool,
    /// Reject whole batches on the CPU before building commands
    pub use_cpu_frustum_culling: bool,
    /// Parallel atomic append; `false` selects the single-invocation serial append
    pub use_compute_shader_draw_command_append: bool,
}

impl Default for CullingConfig {
    fn default() -> Self {
        Self {
            is_draw_lines: false,
            freeze_culling: false,
            use_gpu_frustum_culling: true,
            use_gpu_occlusion_culling: true,
            use_cpu_frustum_culling: false,
            use_compute_shader_draw_command_append: true,
        }
    }
}

impl CullingConfig {
    /// Every GPU test disabled: the compacted set equals the filtered input
    pub fn pass_through() -> Self {
        Self {
            use_gpu_frustum_culling: false,
            use_gpu_occlusion_culling: false,
            ..Self::default()
        }
    }
}

/// How many coarse culling phases run per frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CoarseCulling {
    /// Cull against last frame's Hi-Z only
    #[default]
    PhaseOne,
    /// Additionally re-test against this frame's Hi-Z and draw the newly visible set
    TwoPhase,
}

/// Construction-time pipeline settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Flags used by `RenderState::new` until the host overrides them
    pub culling: CullingConfig,
    pub coarse_culling: CoarseCulling,
    pub initial_command_capacity: u32,
    pub initial_instance_capacity: u32,
    /// Force a GPU finish after each phase and log the compacted buffers
    pub debug_dump_buffers: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            culling: CullingConfig::default(),
            coarse_culling: CoarseCulling::default(),
            initial_command_capacity: DEFAULT_COMMAND_CAPACITY,
            initial_instance_capacity: DEFAULT_INSTANCE_CAPACITY,
            debug_dump_buffers: false,
        }
    }
}

impl PipelineConfig {
    /// Parse a TOML document; missing fields take their defaults
    pub fn from_toml_str(source: &str) -> CullResult<Self> {
        let config: Self = toml::from_str(source)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and parse a TOML file
    pub fn load(path: impl AsRef<Path>) -> CullResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?;
        log::debug!("[PipelineConfig::load] Loaded {}", path.display());
        Ok(config)
    }

    pub fn to_toml_string(&self) -> CullResult<String> {
        toml::to_string_pretty(self).map_err(|e| CullError::Config(e.to_string()))
    }

    fn validate(&self) -> CullResult<()> {
        if self.initial_command_capacity == 0 {
            return Err(CullError::Config(
                "initial_command_capacity must be at least 1".to_string(),
            ));
        }
        if self.initial_instance_capacity < self.initial_command_capacity {
            return Err(CullError::Config(format!(
                "initial_instance_capacity ({}) is smaller than initial_command_capacity ({})",
                self.initial_instance_capacity, self.initial_command_capacity
            )));
        }
        Ok(())
    }
}
